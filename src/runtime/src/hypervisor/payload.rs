//! Serde payloads for the hypervisor's REST control API.

use serde::{Deserialize, Serialize};

/// Full VM configuration submitted on `vm.create`.
#[derive(Debug, Clone, Serialize)]
pub struct VmConfig {
    pub payload: PayloadConfig,
    pub cpus: CpusConfig,
    pub memory: MemoryConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disks: Option<Vec<DiskConfig>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub net: Option<Vec<NetConfig>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vsock: Option<VsockConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub serial: Option<ConsoleConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub console: Option<ConsoleConfig>,
}

/// Kernel, initramfs, and command line.
#[derive(Debug, Clone, Serialize)]
pub struct PayloadConfig {
    pub kernel: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initramfs: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cmdline: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CpusConfig {
    pub boot_vcpus: u8,
    pub max_vcpus: u8,
}

#[derive(Debug, Clone, Serialize)]
pub struct MemoryConfig {
    /// Guest memory in bytes.
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shared: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DiskConfig {
    pub path: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct NetConfig {
    pub tap: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
}

/// Vsock device. The hypervisor materialises guest-initiated connections to
/// port N as host connections to `<socket>_<N>`.
#[derive(Debug, Clone, Serialize)]
pub struct VsockConfig {
    pub cid: u64,
    pub socket: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConsoleConfig {
    pub mode: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
}

impl ConsoleConfig {
    pub fn off() -> Self {
        Self {
            mode: "Off".to_string(),
            file: None,
        }
    }

    pub fn tty() -> Self {
        Self {
            mode: "Tty".to_string(),
            file: None,
        }
    }
}

/// `vm.snapshot` body.
#[derive(Debug, Clone, Serialize)]
pub struct SnapshotConfig {
    pub destination_url: String,
}

/// `vm.restore` body.
#[derive(Debug, Clone, Serialize)]
pub struct RestoreConfig {
    pub source_url: String,
}

/// Subset of `vm.info` the manager inspects.
#[derive(Debug, Clone, Deserialize)]
pub struct VmInfo {
    pub state: String,
}
