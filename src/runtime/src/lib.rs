//! Sandcastle runtime - microVM fleet management.
//!
//! Hosts the VM lifecycle manager and its collaborating subsystems: the
//! network fabric, the guest IP and host port allocators, the per-VM
//! hypervisor adapter, the datagram bridge for in-guest agents, and the
//! callback fabric connecting guests to WebSocket clients.

pub mod bridge;
pub mod callback;
pub mod cmdline;
pub mod hypervisor;
pub mod net;
pub mod store;
pub mod vm;

pub use bridge::{DatagramBridge, CALLBACK_VSOCK_PORT};
pub use callback::{ClientSession, SessionRegistry, DEFAULT_CALLBACK_TIMEOUT, MAX_FRAME_SIZE};
pub use hypervisor::HypervisorAdapter;
pub use net::{IpAllocator, IptablesNat, NatBackend, NetworkFabric, PortForward, PortForwardManager};
pub use store::{VmRecordData, VmStore};
pub use vm::{CreateRequest, UploadFile, VmManager, VmState, VmView};

/// Sandcastle runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
