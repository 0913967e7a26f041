//! Host bridge and per-VM tap plumbing.
//!
//! Startup creates the shared L2 bridge once (address, link up, IP
//! forwarding, masquerade); each VM then gets a tap device enslaved to the
//! bridge. Every operation tolerates stale state left by a crashed
//! predecessor.

use std::process::Output;

use tokio::process::Command;

use sandcastle_core::error::{FleetError, Result};

/// Longest name the kernel accepts for a network interface.
const IFNAMSIZ: usize = 15;

/// Derive the tap device name for a VM. Deterministic, truncated to fit.
pub fn tap_device_name(vm_name: &str) -> String {
    let mut name = format!("tap-{}", vm_name);
    name.truncate(IFNAMSIZ);
    name
}

/// Host-side network fabric: one bridge, many taps.
#[derive(Debug, Clone)]
pub struct NetworkFabric {
    bridge_name: String,
    bridge_cidr: String,
    bridge_subnet: String,
}

impl NetworkFabric {
    pub fn new(bridge_name: &str, bridge_cidr: &str, bridge_subnet: &str) -> Self {
        Self {
            bridge_name: bridge_name.to_string(),
            bridge_cidr: bridge_cidr.to_string(),
            bridge_subnet: bridge_subnet.to_string(),
        }
    }

    /// Bring up the bridge, IP forwarding, and the masquerade rule.
    pub async fn setup(&self) -> Result<()> {
        if !self.link_exists(&self.bridge_name).await? {
            run_checked(&["ip", "link", "add", &self.bridge_name, "type", "bridge"]).await?;
            tracing::info!(bridge = %self.bridge_name, "Created host bridge");
        }

        // `ip addr add` fails with EEXIST when re-run; treat that as done.
        let output = run(&[
            "ip",
            "addr",
            "add",
            &self.bridge_cidr,
            "dev",
            &self.bridge_name,
        ])
        .await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if !stderr.contains("File exists") {
                return Err(FleetError::Network(format!(
                    "failed to assign {} to {}: {}",
                    self.bridge_cidr,
                    self.bridge_name,
                    stderr.trim()
                )));
            }
        }

        run_checked(&["ip", "link", "set", &self.bridge_name, "up"]).await?;

        std::fs::write("/proc/sys/net/ipv4/ip_forward", "1").map_err(|e| {
            FleetError::Network(format!("failed to enable IP forwarding: {}", e))
        })?;

        self.ensure_masquerade().await?;

        tracing::info!(
            bridge = %self.bridge_name,
            address = %self.bridge_cidr,
            subnet = %self.bridge_subnet,
            "Network fabric ready"
        );
        Ok(())
    }

    /// Install the subnet masquerade rule once.
    async fn ensure_masquerade(&self) -> Result<()> {
        let rule = [
            "-t",
            "nat",
            "-C",
            "POSTROUTING",
            "-s",
            &self.bridge_subnet,
            "!",
            "-o",
            &self.bridge_name,
            "-j",
            "MASQUERADE",
        ];
        let mut check = vec!["iptables"];
        check.extend_from_slice(&rule);
        if run(&check).await?.status.success() {
            return Ok(());
        }

        let mut append: Vec<&str> = check.clone();
        append[3] = "-A";
        run_checked(&append).await
    }

    /// Create a VM's tap device and enslave it to the bridge.
    pub async fn create_tap(&self, vm_name: &str) -> Result<String> {
        let tap = tap_device_name(vm_name);

        // A tap left by a crashed process is deleted and recreated so the
        // hypervisor gets a fresh device.
        if self.link_exists(&tap).await? {
            tracing::warn!(tap = %tap, "Removing stale tap device");
            run_checked(&["ip", "link", "del", &tap]).await?;
        }

        run_checked(&["ip", "tuntap", "add", "dev", &tap, "mode", "tap"]).await?;
        run_checked(&["ip", "link", "set", &tap, "master", &self.bridge_name]).await?;
        run_checked(&["ip", "link", "set", &tap, "up"]).await?;

        tracing::info!(tap = %tap, bridge = %self.bridge_name, "Tap device attached");
        Ok(tap)
    }

    /// Bring down and delete a VM's tap device. Idempotent.
    pub async fn delete_tap(&self, tap: &str) -> Result<()> {
        if !self.link_exists(tap).await? {
            return Ok(());
        }
        let _ = run(&["ip", "link", "set", tap, "down"]).await?;
        run_checked(&["ip", "link", "del", tap]).await?;
        tracing::info!(tap = %tap, "Tap device removed");
        Ok(())
    }

    async fn link_exists(&self, name: &str) -> Result<bool> {
        Ok(run(&["ip", "link", "show", name]).await?.status.success())
    }
}

async fn run(argv: &[&str]) -> Result<Output> {
    Command::new(argv[0])
        .args(&argv[1..])
        .output()
        .await
        .map_err(|e| FleetError::Network(format!("failed to run {}: {}", argv[0], e)))
}

async fn run_checked(argv: &[&str]) -> Result<()> {
    let output = run(argv).await?;
    if !output.status.success() {
        return Err(FleetError::Network(format!(
            "{} failed: {}",
            argv.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tap_name_is_deterministic() {
        assert_eq!(tap_device_name("alpha"), "tap-alpha");
        assert_eq!(tap_device_name("alpha"), tap_device_name("alpha"));
    }

    #[test]
    fn test_tap_name_fits_ifnamsiz() {
        let name = tap_device_name("a-very-long-vm-name-indeed");
        assert!(name.len() <= IFNAMSIZ);
        assert!(name.starts_with("tap-"));
    }
}
