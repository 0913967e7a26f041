//! Sandcastle core - shared types for the microVM control plane.
//!
//! Carries the error taxonomy, server configuration, and the callback wire
//! formats used by both the runtime and the daemon.

pub mod config;
pub mod error;
pub mod wire;

pub use config::{parse_cidr, NfsSource, PortForwardSpec, ServerConfig};
pub use error::{FleetError, Result};
pub use wire::{CallbackError, CallbackRequest, CallbackResponse, DatagramCommand};
