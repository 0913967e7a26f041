//! Host port-forward accounting and NAT rule management.
//!
//! Host ports come from configured ranges (single ports or inclusive spans,
//! each with a description). Reservation picks the lowest free port of a
//! span; a single-port range that is already taken fails the whole reserve.
//! Installed DNAT rules live in a dedicated chain that only this manager
//! writes.

use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::process::Output;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use sandcastle_core::config::PortForwardSpec;
use sandcastle_core::error::{FleetError, Result};

/// The iptables NAT chain owned by the port-forward manager.
pub const NAT_CHAIN: &str = "SANDCASTLE-PF";

/// One installed forward, as recorded on the VM and returned to callers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PortForward {
    pub host_port: u16,
    pub guest_port: u16,
    pub description: String,
}

/// Backend that mutates the host NAT table.
///
/// A trait seam so rule installation can be faked in tests; production uses
/// [`IptablesNat`].
#[async_trait]
pub trait NatBackend: Send + Sync {
    /// Create the owned chain and jump rules if missing. Idempotent.
    async fn ensure_chain(&self) -> Result<()>;

    /// Add a DNAT rule redirecting `host_port` to `guest_ip:guest_port`.
    async fn install(&self, host_port: u16, guest_ip: Ipv4Addr, guest_port: u16) -> Result<()>;

    /// Remove the same rule. Idempotent on "rule not found".
    async fn uninstall(&self, host_port: u16, guest_ip: Ipv4Addr, guest_port: u16) -> Result<()>;
}

/// NAT backend shelling out to `iptables`.
pub struct IptablesNat;

impl IptablesNat {
    async fn run(&self, args: &[String]) -> Result<Output> {
        let output = Command::new("iptables")
            .args(args)
            .output()
            .await
            .map_err(|e| FleetError::Network(format!("failed to run iptables: {}", e)))?;
        Ok(output)
    }

    async fn run_checked(&self, args: &[String]) -> Result<()> {
        let output = self.run(args).await?;
        if !output.status.success() {
            return Err(FleetError::Network(format!(
                "iptables {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }

    fn rule_args(action: &str, host_port: u16, guest_ip: Ipv4Addr, guest_port: u16) -> Vec<String> {
        vec![
            "-t".into(),
            "nat".into(),
            action.into(),
            NAT_CHAIN.into(),
            "-p".into(),
            "tcp".into(),
            "--dport".into(),
            host_port.to_string(),
            "-j".into(),
            "DNAT".into(),
            "--to-destination".into(),
            format!("{}:{}", guest_ip, guest_port),
        ]
    }
}

#[async_trait]
impl NatBackend for IptablesNat {
    async fn ensure_chain(&self) -> Result<()> {
        // Chain creation fails harmlessly when the chain already exists.
        let create: Vec<String> = ["-t", "nat", "-N", NAT_CHAIN]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let _ = self.run(&create).await?;

        // PREROUTING covers external traffic, OUTPUT locally-originated.
        for entry in ["PREROUTING", "OUTPUT"] {
            let check: Vec<String> = ["-t", "nat", "-C", entry, "-j", NAT_CHAIN]
                .iter()
                .map(|s| s.to_string())
                .collect();
            if self.run(&check).await?.status.success() {
                continue;
            }
            let append: Vec<String> = ["-t", "nat", "-A", entry, "-j", NAT_CHAIN]
                .iter()
                .map(|s| s.to_string())
                .collect();
            self.run_checked(&append).await?;
        }
        Ok(())
    }

    async fn install(&self, host_port: u16, guest_ip: Ipv4Addr, guest_port: u16) -> Result<()> {
        self.run_checked(&Self::rule_args("-A", host_port, guest_ip, guest_port))
            .await
    }

    async fn uninstall(&self, host_port: u16, guest_ip: Ipv4Addr, guest_port: u16) -> Result<()> {
        let output = self
            .run(&Self::rule_args("-D", host_port, guest_ip, guest_port))
            .await?;
        if !output.status.success() {
            // Rule already gone; stale state from a prior crash is expected.
            tracing::debug!(
                host_port,
                guest_ip = %guest_ip,
                "NAT rule not found on uninstall"
            );
        }
        Ok(())
    }
}

/// Parsed port range with its description.
#[derive(Debug, Clone)]
struct PortRange {
    lo: u16,
    hi: u16,
    description: String,
}

/// Allocates host ports from the configured ranges and keeps the NAT table
/// in sync with the lease set.
pub struct PortForwardManager {
    ranges: Vec<PortRange>,
    leased: BTreeSet<u16>,
    nat: Arc<dyn NatBackend>,
}

impl PortForwardManager {
    pub fn new(specs: &[PortForwardSpec], nat: Arc<dyn NatBackend>) -> Result<Self> {
        let mut ranges = Vec::with_capacity(specs.len());
        for spec in specs {
            let (lo, hi) = spec.span()?;
            ranges.push(PortRange {
                lo,
                hi,
                description: spec.description.clone(),
            });
        }
        Ok(Self {
            ranges,
            leased: BTreeSet::new(),
            nat,
        })
    }

    /// Mark ports as leased without touching NAT (seeding from persisted
    /// records; the rules are reinstalled separately).
    pub fn reserve_existing(&mut self, ports: impl IntoIterator<Item = u16>) {
        self.leased.extend(ports);
    }

    /// Reserve one port from every configured range and install the DNAT
    /// rules pointing at `guest_ip`. On any failure all partial work from
    /// this call is rolled back before the error surfaces.
    pub async fn reserve_and_install(&mut self, guest_ip: Ipv4Addr) -> Result<Vec<PortForward>> {
        let mut installed: Vec<PortForward> = Vec::new();

        let result = self.try_reserve_all(guest_ip, &mut installed).await;
        if let Err(err) = result {
            for fwd in &installed {
                let _ = self
                    .nat
                    .uninstall(fwd.host_port, guest_ip, fwd.guest_port)
                    .await;
                self.leased.remove(&fwd.host_port);
            }
            return Err(err);
        }

        Ok(installed)
    }

    async fn try_reserve_all(
        &mut self,
        guest_ip: Ipv4Addr,
        installed: &mut Vec<PortForward>,
    ) -> Result<()> {
        let ranges = self.ranges.clone();
        for range in &ranges {
            let host_port = self.pick(range)?;
            self.leased.insert(host_port);

            if let Err(err) = self.nat.install(host_port, guest_ip, host_port).await {
                self.leased.remove(&host_port);
                return Err(err);
            }

            installed.push(PortForward {
                host_port,
                guest_port: host_port,
                description: range.description.clone(),
            });
        }
        Ok(())
    }

    fn pick(&self, range: &PortRange) -> Result<u16> {
        if range.lo == range.hi {
            if self.leased.contains(&range.lo) {
                return Err(FleetError::Conflict(format!(
                    "host port {} ({}) is already reserved",
                    range.lo, range.description
                )));
            }
            return Ok(range.lo);
        }

        (range.lo..=range.hi)
            .find(|p| !self.leased.contains(p))
            .ok_or_else(|| {
                FleetError::ResourcesExhausted(format!(
                    "no free port in {}-{} ({})",
                    range.lo, range.hi, range.description
                ))
            })
    }

    /// Tear down the NAT rules for `forwards` and return the ports to their
    /// ranges. Uninstall is idempotent, so this is safe against stale rules.
    pub async fn remove(&mut self, forwards: &[PortForward], guest_ip: Ipv4Addr) -> Result<()> {
        for fwd in forwards {
            self.nat
                .uninstall(fwd.host_port, guest_ip, fwd.guest_port)
                .await?;
            self.leased.remove(&fwd.host_port);
        }
        Ok(())
    }

    /// Reinstall NAT rules for already-leased forwards (startup reseeding).
    pub async fn reinstall(&self, forwards: &[PortForward], guest_ip: Ipv4Addr) -> Result<()> {
        for fwd in forwards {
            self.nat
                .install(fwd.host_port, guest_ip, fwd.guest_port)
                .await?;
        }
        Ok(())
    }

    /// Number of currently leased host ports.
    pub fn leased_count(&self) -> usize {
        self.leased.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Records install/uninstall calls; optionally fails the Nth install.
    struct FakeNat {
        rules: Mutex<Vec<(u16, Ipv4Addr, u16)>>,
        fail_on_install: Mutex<Option<usize>>,
        installs_seen: Mutex<usize>,
    }

    impl FakeNat {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                rules: Mutex::new(Vec::new()),
                fail_on_install: Mutex::new(None),
                installs_seen: Mutex::new(0),
            })
        }

        fn failing_on(n: usize) -> Arc<Self> {
            let nat = Self::new();
            *nat.fail_on_install.lock().unwrap() = Some(n);
            nat
        }

        fn installed(&self) -> Vec<(u16, Ipv4Addr, u16)> {
            self.rules.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl NatBackend for FakeNat {
        async fn ensure_chain(&self) -> Result<()> {
            Ok(())
        }

        async fn install(
            &self,
            host_port: u16,
            guest_ip: Ipv4Addr,
            guest_port: u16,
        ) -> Result<()> {
            let mut seen = self.installs_seen.lock().unwrap();
            if Some(*seen) == *self.fail_on_install.lock().unwrap() {
                *seen += 1;
                return Err(FleetError::Network("synthetic install failure".into()));
            }
            *seen += 1;
            self.rules
                .lock()
                .unwrap()
                .push((host_port, guest_ip, guest_port));
            Ok(())
        }

        async fn uninstall(
            &self,
            host_port: u16,
            guest_ip: Ipv4Addr,
            guest_port: u16,
        ) -> Result<()> {
            self.rules
                .lock()
                .unwrap()
                .retain(|r| *r != (host_port, guest_ip, guest_port));
            Ok(())
        }
    }

    fn specs() -> Vec<PortForwardSpec> {
        vec![
            PortForwardSpec {
                port: "8080".to_string(),
                description: "web".to_string(),
            },
            PortForwardSpec {
                port: "9000-9002".to_string(),
                description: "dev".to_string(),
            },
        ]
    }

    fn guest() -> Ipv4Addr {
        Ipv4Addr::new(10, 20, 1, 2)
    }

    #[tokio::test]
    async fn test_reserve_picks_lowest_in_span() {
        let nat = FakeNat::new();
        let mut mgr = PortForwardManager::new(&specs(), nat.clone()).unwrap();

        let forwards = mgr.reserve_and_install(guest()).await.unwrap();
        let ports: Vec<u16> = forwards.iter().map(|f| f.host_port).collect();
        assert_eq!(ports, vec![8080, 9000]);
        assert_eq!(nat.installed().len(), 2);
    }

    #[tokio::test]
    async fn test_single_port_conflict() {
        let nat = FakeNat::new();
        let mut mgr = PortForwardManager::new(&specs(), nat.clone()).unwrap();
        mgr.reserve_existing([8080]);

        let err = mgr.reserve_and_install(guest()).await.unwrap_err();
        assert!(matches!(err, FleetError::Conflict(_)));
        // The failed attempt must not leave rules behind.
        assert!(nat.installed().is_empty());
    }

    #[tokio::test]
    async fn test_span_exhaustion() {
        let nat = FakeNat::new();
        let mut mgr = PortForwardManager::new(&specs(), nat.clone()).unwrap();
        mgr.reserve_existing([9000, 9001, 9002]);

        // The single port installs first, then the span fails; rollback must
        // remove the single-port rule again.
        let err = mgr.reserve_and_install(guest()).await.unwrap_err();
        assert!(matches!(err, FleetError::ResourcesExhausted(_)));
        assert!(nat.installed().is_empty());
        assert_eq!(mgr.leased_count(), 3);
    }

    #[tokio::test]
    async fn test_install_failure_rolls_back() {
        let nat = FakeNat::failing_on(1);
        let mut mgr = PortForwardManager::new(&specs(), nat.clone()).unwrap();

        assert!(mgr.reserve_and_install(guest()).await.is_err());
        assert!(nat.installed().is_empty());
        assert_eq!(mgr.leased_count(), 0);
    }

    #[tokio::test]
    async fn test_remove_releases_ports() {
        let nat = FakeNat::new();
        let mut mgr = PortForwardManager::new(&specs(), nat.clone()).unwrap();

        let forwards = mgr.reserve_and_install(guest()).await.unwrap();
        mgr.remove(&forwards, guest()).await.unwrap();

        assert!(nat.installed().is_empty());
        assert_eq!(mgr.leased_count(), 0);

        // Ports are reusable after release.
        let again = mgr.reserve_and_install(guest()).await.unwrap();
        assert_eq!(again[0].host_port, 8080);
    }

    #[tokio::test]
    async fn test_accounting_matches_rules_across_vms() {
        let nat = FakeNat::new();
        let mut mgr = PortForwardManager::new(&specs(), nat.clone()).unwrap();

        let a = mgr.reserve_and_install(Ipv4Addr::new(10, 20, 1, 2)).await;
        // Second VM: single port is taken, so the whole reserve fails.
        let b = mgr.reserve_and_install(Ipv4Addr::new(10, 20, 1, 3)).await;
        assert!(a.is_ok());
        assert!(b.is_err());

        // Installed rules equal the union of live forwards.
        assert_eq!(nat.installed().len(), a.unwrap().len());
    }
}
