//! Server configuration loaded from a YAML file at startup.

use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use crate::error::{FleetError, Result};

/// A configured port-forward range.
///
/// `port` is either a single port (`"8080"`) or an inclusive span
/// (`"9000-9100"`). Spans hand out the lowest free port on reservation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PortForwardSpec {
    /// Port or inclusive span, e.g. "8080" or "9000-9100".
    pub port: String,

    /// Human-readable label carried through to VM info.
    pub description: String,
}

impl PortForwardSpec {
    /// Parse into an inclusive (lo, hi) pair.
    pub fn span(&self) -> Result<(u16, u16)> {
        let parse = |s: &str| {
            s.trim().parse::<u16>().map_err(|_| {
                FleetError::Config(format!("invalid port '{}' in port_forwards", self.port))
            })
        };

        match self.port.split_once('-') {
            Some((lo, hi)) => {
                let (lo, hi) = (parse(lo)?, parse(hi)?);
                if lo > hi {
                    return Err(FleetError::Config(format!(
                        "inverted port span '{}' in port_forwards",
                        self.port
                    )));
                }
                Ok((lo, hi))
            }
            None => {
                let p = parse(&self.port)?;
                Ok((p, p))
            }
        }
    }
}

/// The NFS endpoint a VM mounts its root filesystem from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NfsSource {
    pub server: String,
    pub port: u16,
    pub path: String,
}

/// Top-level server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address.
    #[serde(default = "default_host")]
    pub host: String,

    /// HTTP listen port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Directory holding per-VM runtime state (disks, sockets, snapshots).
    pub state_dir: PathBuf,

    /// Host bridge device name.
    #[serde(default = "default_bridge_name")]
    pub bridge_name: String,

    /// Bridge address in CIDR notation (e.g. "10.20.1.1/24"); doubles as
    /// the guest gateway.
    pub bridge_ip: String,

    /// Bridge subnet in CIDR notation (e.g. "10.20.1.0/24").
    pub bridge_subnet: String,

    /// Path to the cloud-hypervisor binary.
    pub chv_bin: PathBuf,

    /// Default kernel image.
    pub kernel: PathBuf,

    /// Default initramfs image.
    pub initramfs: PathBuf,

    /// Host port ranges available for forwarding into guests.
    #[serde(default)]
    pub port_forwards: Vec<PortForwardSpec>,

    /// Size of each VM's local scratch disk, in MiB.
    #[serde(default = "default_stateful_size_in_mb")]
    pub stateful_size_in_mb: u64,

    /// Memory budget for each VM as a percentage of host memory.
    #[serde(default = "default_guest_mem_percentage")]
    pub guest_mem_percentage: u8,

    /// Default NFS server hosting guest root filesystems.
    pub nfs_server: Option<String>,

    /// Default NFS server port.
    pub nfs_port: Option<u16>,

    /// Default NFS export path.
    #[serde(default = "default_nfs_path")]
    pub nfs_path: String,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    7000
}

fn default_bridge_name() -> String {
    "sc-br0".to_string()
}

fn default_stateful_size_in_mb() -> u64 {
    2048
}

fn default_guest_mem_percentage() -> u8 {
    50
}

fn default_nfs_path() -> String {
    "/".to_string()
}

impl ServerConfig {
    /// Load and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| {
            FleetError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;

        let config: ServerConfig = serde_yaml::from_str(&data)
            .map_err(|e| FleetError::Config(format!("failed to parse {}: {}", path.display(), e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate field values and cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        parse_cidr(&self.bridge_ip)
            .map_err(|e| FleetError::Config(format!("bridge_ip: {}", e)))?;
        parse_cidr(&self.bridge_subnet)
            .map_err(|e| FleetError::Config(format!("bridge_subnet: {}", e)))?;

        if self.guest_mem_percentage == 0 || self.guest_mem_percentage > 100 {
            return Err(FleetError::Config(format!(
                "guest_mem_percentage must be in 1..=100, got {}",
                self.guest_mem_percentage
            )));
        }

        if self.stateful_size_in_mb == 0 {
            return Err(FleetError::Config(
                "stateful_size_in_mb must be non-zero".to_string(),
            ));
        }

        for spec in &self.port_forwards {
            spec.span()?;
        }

        Ok(())
    }

    /// The bridge's own address (the guest gateway), without the prefix.
    pub fn gateway_ip(&self) -> Result<Ipv4Addr> {
        let (addr, _) = parse_cidr(&self.bridge_ip)
            .map_err(|e| FleetError::Config(format!("bridge_ip: {}", e)))?;
        Ok(addr)
    }

    /// The default NFS root source, if the config carries one.
    pub fn nfs_source(&self) -> Option<NfsSource> {
        match (&self.nfs_server, self.nfs_port) {
            (Some(server), Some(port)) => Some(NfsSource {
                server: server.clone(),
                port,
                path: self.nfs_path.clone(),
            }),
            _ => None,
        }
    }
}

/// Parse "a.b.c.d/len" into an address and prefix length.
pub fn parse_cidr(cidr: &str) -> std::result::Result<(Ipv4Addr, u8), String> {
    let (addr, len) = cidr
        .split_once('/')
        .ok_or_else(|| format!("invalid CIDR notation: {}", cidr))?;

    let addr: Ipv4Addr = addr
        .parse()
        .map_err(|e| format!("invalid address '{}': {}", addr, e))?;
    let len: u8 = len
        .parse()
        .map_err(|e| format!("invalid prefix length '{}': {}", len, e))?;

    if len > 30 {
        return Err(format!("prefix length {} too large (max 30 for usable hosts)", len));
    }

    Ok((addr, len))
}
