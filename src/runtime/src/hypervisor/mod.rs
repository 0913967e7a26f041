//! Per-VM hypervisor adapter.
//!
//! Each VM is backed by one `cloud-hypervisor` child process. The adapter
//! spawns it with `--api-socket`, waits for the control socket to accept
//! connections, and translates operations into REST calls over that socket.
//! Calls on one adapter are serialised by a mutex; the hypervisor assumes a
//! single control connection.

mod client;
pub mod payload;

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::sync::Mutex;

use sandcastle_core::error::{FleetError, Result};

use client::ApiResponse;
use payload::{RestoreConfig, SnapshotConfig, VmConfig, VmInfo};

/// Deadline for ordinary control calls.
const API_TIMEOUT: Duration = Duration::from_secs(10);

/// Deadline for snapshot/restore, which copy guest memory.
const SLOW_API_TIMEOUT: Duration = Duration::from_secs(60);

/// How long to wait for the control socket after spawning the child.
const READY_TIMEOUT: Duration = Duration::from_secs(10);

const READY_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Handle to one hypervisor child and its control socket.
#[derive(Debug)]
pub struct HypervisorAdapter {
    vm_name: String,
    socket_path: PathBuf,
    child: Mutex<Option<Child>>,
    /// Serialises control calls; held across each HTTP exchange.
    ops: Mutex<()>,
}

impl HypervisorAdapter {
    /// Spawn the hypervisor binary and wait until its API socket is live.
    pub async fn spawn(chv_bin: &Path, socket_path: &Path, vm_name: &str) -> Result<Self> {
        if socket_path.exists() {
            tracing::warn!(
                path = %socket_path.display(),
                "Removing stale control socket"
            );
            let _ = std::fs::remove_file(socket_path);
        }

        if let Some(dir) = socket_path.parent() {
            std::fs::create_dir_all(dir)?;
        }

        let child = Command::new(chv_bin)
            .arg("--api-socket")
            .arg(socket_path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                FleetError::HypervisorUnreachable(format!(
                    "failed to spawn {}: {}",
                    chv_bin.display(),
                    e
                ))
            })?;

        tracing::info!(
            vm_name = %vm_name,
            pid = child.id().unwrap_or(0),
            socket = %socket_path.display(),
            "Hypervisor child spawned"
        );

        let adapter = Self {
            vm_name: vm_name.to_string(),
            socket_path: socket_path.to_path_buf(),
            child: Mutex::new(Some(child)),
            ops: Mutex::new(()),
        };

        adapter.wait_ready().await?;
        Ok(adapter)
    }

    /// Poll the API socket until it answers `vmm.ping` or the deadline hits.
    async fn wait_ready(&self) -> Result<()> {
        let start = tokio::time::Instant::now();

        loop {
            if start.elapsed() > READY_TIMEOUT {
                return Err(FleetError::HypervisorUnreachable(format!(
                    "control socket {} not ready after {:?}",
                    self.socket_path.display(),
                    READY_TIMEOUT
                )));
            }

            {
                let mut guard = self.child.lock().await;
                if let Some(child) = guard.as_mut() {
                    if let Ok(Some(status)) = child.try_wait() {
                        return Err(FleetError::HypervisorUnreachable(format!(
                            "hypervisor exited during startup: {}",
                            status
                        )));
                    }
                }
            }

            if self.socket_path.exists() {
                let ping = client::request(
                    &self.socket_path,
                    "GET",
                    "/api/v1/vmm.ping",
                    None,
                    READY_POLL_INTERVAL * 5,
                )
                .await;
                if matches!(ping, Ok(ref r) if r.is_success()) {
                    tracing::debug!(vm_name = %self.vm_name, "Hypervisor API ready");
                    return Ok(());
                }
            }

            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }
    }

    async fn call(
        &self,
        method: &str,
        command: &str,
        body: Option<String>,
        deadline: Duration,
    ) -> Result<ApiResponse> {
        let _guard = self.ops.lock().await;
        let uri = format!("/api/v1/{}", command);
        let resp = client::request(
            &self.socket_path,
            method,
            &uri,
            body.as_deref(),
            deadline,
        )
        .await?;

        if !resp.is_success() {
            return Err(FleetError::HypervisorError {
                code: resp.status,
                body: resp.body.unwrap_or_default(),
            });
        }
        Ok(resp)
    }

    pub async fn create_vm(&self, config: &VmConfig) -> Result<()> {
        let body = serde_json::to_string(config)?;
        self.call("PUT", "vm.create", Some(body), API_TIMEOUT).await?;
        Ok(())
    }

    pub async fn boot_vm(&self) -> Result<()> {
        self.call("PUT", "vm.boot", None, API_TIMEOUT).await?;
        Ok(())
    }

    pub async fn pause_vm(&self) -> Result<()> {
        self.call("PUT", "vm.pause", None, API_TIMEOUT).await?;
        Ok(())
    }

    pub async fn resume_vm(&self) -> Result<()> {
        self.call("PUT", "vm.resume", None, API_TIMEOUT).await?;
        Ok(())
    }

    pub async fn shutdown_vm(&self) -> Result<()> {
        self.call("PUT", "vm.shutdown", None, API_TIMEOUT).await?;
        Ok(())
    }

    pub async fn snapshot_vm(&self, destination: &Path) -> Result<()> {
        let body = serde_json::to_string(&SnapshotConfig {
            destination_url: format!("file://{}", destination.display()),
        })?;
        self.call("PUT", "vm.snapshot", Some(body), SLOW_API_TIMEOUT)
            .await?;
        Ok(())
    }

    pub async fn restore_vm(&self, source: &Path) -> Result<()> {
        let body = serde_json::to_string(&RestoreConfig {
            source_url: format!("file://{}", source.display()),
        })?;
        self.call("PUT", "vm.restore", Some(body), SLOW_API_TIMEOUT)
            .await?;
        Ok(())
    }

    pub async fn info(&self) -> Result<VmInfo> {
        let resp = self.call("GET", "vm.info", None, API_TIMEOUT).await?;
        let body = resp
            .body
            .ok_or_else(|| FleetError::Internal("vm.info returned no body".to_string()))?;
        Ok(serde_json::from_str(&body)?)
    }

    /// No-op request proving the control socket is responsive.
    pub async fn ping(&self) -> Result<()> {
        self.call("GET", "vmm.ping", None, API_TIMEOUT).await?;
        Ok(())
    }

    /// The control socket path (owned by the VM record).
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Whether the child process is still running.
    pub async fn is_alive(&self) -> bool {
        match self.child.lock().await.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Tear the child down: graceful shutdown, then kill, then remove the
    /// control socket. Safe to call more than once.
    pub async fn destroy(&self) {
        if let Err(e) = self.shutdown_vm().await {
            tracing::debug!(vm_name = %self.vm_name, error = %e, "Graceful shutdown failed");
        }

        if let Some(mut child) = self.child.lock().await.take() {
            if let Err(e) = child.kill().await {
                tracing::warn!(vm_name = %self.vm_name, error = %e, "Failed to kill hypervisor");
            }
            let _ = child.wait().await;
            tracing::info!(vm_name = %self.vm_name, "Hypervisor child terminated");
        }

        let _ = std::fs::remove_file(&self.socket_path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_spawn_missing_binary() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("chv.sock");

        let err = HypervisorAdapter::spawn(Path::new("/nonexistent/chv"), &socket, "alpha")
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::HypervisorUnreachable(_)));
    }

    #[tokio::test]
    async fn test_spawn_cleans_stale_socket() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("chv.sock");
        std::fs::write(&socket, "stale").unwrap();

        // `true` exits immediately, so readiness fails, but the stale file
        // must have been replaced along the way.
        let result = HypervisorAdapter::spawn(Path::new("/usr/bin/true"), &socket, "alpha").await;
        assert!(result.is_err());
    }
}
