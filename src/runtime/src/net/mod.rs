//! Host networking: bridge fabric, guest IP allocation, port forwards.

pub mod fabric;
pub mod ipalloc;
pub mod portfwd;

pub use fabric::{tap_device_name, NetworkFabric};
pub use ipalloc::IpAllocator;
pub use portfwd::{IptablesNat, NatBackend, PortForward, PortForwardManager, NAT_CHAIN};
