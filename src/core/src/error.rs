use thiserror::Error;

/// Sandcastle error types.
///
/// Every layer of the control plane reports failures through this enum; the
/// HTTP surface is the only place that converts kinds into status codes.
#[derive(Error, Debug)]
pub enum FleetError {
    /// The caller supplied an invalid or incomplete request.
    #[error("{0}")]
    Validation(String),

    /// A resource with the same identity already exists.
    #[error("{0}")]
    Conflict(String),

    /// The named resource does not exist.
    #[error("{0}")]
    NotFound(String),

    /// A finite pool (guest IPs, host ports) is exhausted.
    #[error("{0}")]
    ResourcesExhausted(String),

    /// The hypervisor child process did not come up or stopped answering.
    #[error("hypervisor unreachable: {0}")]
    HypervisorUnreachable(String),

    /// The hypervisor answered with a non-2xx status.
    #[error("hypervisor error {code}: {body}")]
    HypervisorError { code: u16, body: String },

    /// No client session is registered for the VM.
    #[error("no active session for VM: {0}")]
    NoSession(String),

    /// The client session closed while an operation was in flight.
    #[error("session closed")]
    SessionClosed,

    /// The session's outbound queue is full.
    #[error("session send queue full")]
    Backpressure,

    /// A bounded wait expired.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Host network plumbing failure (bridge, tap, NAT).
    #[error("network error: {0}")]
    Network(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Anything that should not happen.
    #[error("{0}")]
    Internal(String),
}

impl From<serde_json::Error> for FleetError {
    fn from(err: serde_json::Error) -> Self {
        FleetError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for FleetError {
    fn from(err: serde_yaml::Error) -> Self {
        FleetError::Serialization(err.to_string())
    }
}

/// Result type alias for Sandcastle operations.
pub type Result<T> = std::result::Result<T, FleetError>;
