//! Datagram-transport bridge between in-guest agents and the callback
//! fabric.
//!
//! The hypervisor materialises a guest-initiated vsock connection to port N
//! as a connection to the host unix socket `<vsock socket>_<N>`, so the
//! bridge binds one listener per VM at that derived path when the VM boots.
//! That binding is also what attributes each connection to its VM. Guests
//! speak a newline-delimited text protocol; every command is answered with a
//! single JSON line.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinHandle;

use sandcastle_core::error::{FleetError, Result};
use sandcastle_core::wire::DatagramCommand;

use crate::callback::SessionRegistry;

/// The vsock port in-guest agents connect to.
pub const CALLBACK_VSOCK_PORT: u32 = 4088;

/// Host-side listener path for a VM's callback port.
pub fn listener_path(vsock_socket: &Path) -> PathBuf {
    let mut path = vsock_socket.as_os_str().to_os_string();
    path.push(format!("_{}", CALLBACK_VSOCK_PORT));
    PathBuf::from(path)
}

/// Accepts guest connections and routes their commands to client sessions.
pub struct DatagramBridge {
    registry: Arc<SessionRegistry>,
    listeners: Mutex<HashMap<String, VmListener>>,
}

struct VmListener {
    path: PathBuf,
    accept_task: JoinHandle<()>,
}

impl DatagramBridge {
    pub fn new(registry: Arc<SessionRegistry>) -> Arc<Self> {
        Arc::new(Self {
            registry,
            listeners: Mutex::new(HashMap::new()),
        })
    }

    /// Start listening for the given VM. Called by the lifecycle manager at
    /// boot; replaces any stale registration for the same name.
    pub fn register_vm(&self, vm_name: &str, vsock_socket: &Path) -> Result<()> {
        let path = listener_path(vsock_socket);
        if path.exists() {
            let _ = std::fs::remove_file(&path);
        }

        let listener = UnixListener::bind(&path).map_err(|e| {
            FleetError::Network(format!("failed to bind {}: {}", path.display(), e))
        })?;

        let accept_task = tokio::spawn(accept_loop(
            vm_name.to_string(),
            listener,
            self.registry.clone(),
        ));

        let replaced = self.listeners.lock().unwrap().insert(
            vm_name.to_string(),
            VmListener { path, accept_task },
        );
        if let Some(replaced) = replaced {
            replaced.accept_task.abort();
            let _ = std::fs::remove_file(&replaced.path);
        }

        tracing::info!(vm_name = %vm_name, "Datagram bridge listening");
        Ok(())
    }

    /// Stop listening for the given VM. Idempotent.
    pub fn unregister_vm(&self, vm_name: &str) {
        let removed = self.listeners.lock().unwrap().remove(vm_name);
        if let Some(removed) = removed {
            removed.accept_task.abort();
            let _ = std::fs::remove_file(&removed.path);
            tracing::info!(vm_name = %vm_name, "Datagram bridge unregistered");
        }
    }

    /// Number of registered VM listeners.
    pub fn listener_count(&self) -> usize {
        self.listeners.lock().unwrap().len()
    }
}

async fn accept_loop(vm_name: String, listener: UnixListener, registry: Arc<SessionRegistry>) {
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                tokio::spawn(handle_connection(
                    vm_name.clone(),
                    stream,
                    registry.clone(),
                ));
            }
            Err(e) => {
                tracing::warn!(vm_name = %vm_name, error = %e, "Datagram accept failed");
                break;
            }
        }
    }
}

async fn handle_connection(vm_name: String, stream: UnixStream, registry: Arc<SessionRegistry>) {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(vm_name = %vm_name, error = %e, "Guest connection read error");
                break;
            }
        };

        let reply = match DatagramCommand::parse(&line) {
            Ok(None) => continue,
            Ok(Some(cmd)) => {
                tracing::debug!(vm_name = %vm_name, method = %cmd.method, "Guest command");
                match registry
                    .route_callback(&vm_name, &cmd.method, cmd.params, None)
                    .await
                {
                    Ok(result) => serde_json::json!({ "result": result }),
                    Err(e) => serde_json::json!({ "error": e.to_string() }),
                }
            }
            Err(e) => serde_json::json!({ "error": e }),
        };

        let mut frame = reply.to_string();
        frame.push('\n');
        if write_half.write_all(frame.as_bytes()).await.is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sandcastle_core::wire::{CallbackRequest, CallbackResponse};
    use serde_json::json;

    async fn connect_and_send(path: &Path, line: &str) -> serde_json::Value {
        let stream = UnixStream::connect(path).await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        write_half.write_all(line.as_bytes()).await.unwrap();
        write_half.write_all(b"\n").await.unwrap();

        let mut lines = BufReader::new(read_half).lines();
        let reply = lines.next_line().await.unwrap().unwrap();
        serde_json::from_str(&reply).unwrap()
    }

    #[tokio::test]
    async fn test_callback_round_trip_through_bridge() {
        let dir = tempfile::tempdir().unwrap();
        let vsock = dir.path().join("vsock.sock");

        let registry = SessionRegistry::new();
        let (session, mut outbound) = registry.install_session("alpha");
        tokio::spawn(async move {
            while let Some(frame) = outbound.recv().await {
                let req: CallbackRequest = serde_json::from_str(&frame).unwrap();
                session.deliver(CallbackResponse {
                    id: req.id,
                    result: req.params,
                    error: None,
                });
            }
        });

        let bridge = DatagramBridge::new(registry);
        bridge.register_vm("alpha", &vsock).unwrap();

        let reply = connect_and_send(&listener_path(&vsock), "CALLBACK echo {\"x\":1}").await;
        assert_eq!(reply, json!({"result": {"x": 1}}));
    }

    #[tokio::test]
    async fn test_no_session_reports_error_line() {
        let dir = tempfile::tempdir().unwrap();
        let vsock = dir.path().join("vsock.sock");

        let bridge = DatagramBridge::new(SessionRegistry::new());
        bridge.register_vm("beta", &vsock).unwrap();

        let reply = connect_and_send(&listener_path(&vsock), "CALLBACK ping").await;
        let error = reply["error"].as_str().unwrap();
        assert!(error.contains("no active session"), "got: {}", error);
    }

    #[tokio::test]
    async fn test_opaque_verb_forwarded_lowercased() {
        let dir = tempfile::tempdir().unwrap();
        let vsock = dir.path().join("vsock.sock");

        let registry = SessionRegistry::new();
        let (session, mut outbound) = registry.install_session("gamma");
        tokio::spawn(async move {
            while let Some(frame) = outbound.recv().await {
                let req: CallbackRequest = serde_json::from_str(&frame).unwrap();
                session.deliver(CallbackResponse {
                    id: req.id,
                    result: Some(json!({ "method": req.method })),
                    error: None,
                });
            }
        });

        let bridge = DatagramBridge::new(registry);
        bridge.register_vm("gamma", &vsock).unwrap();

        let reply = connect_and_send(&listener_path(&vsock), "EXEC {\"cmd\":\"ls\"}").await;
        assert_eq!(reply["result"]["method"], "exec");
    }

    #[tokio::test]
    async fn test_unregister_removes_listener() {
        let dir = tempfile::tempdir().unwrap();
        let vsock = dir.path().join("vsock.sock");

        let bridge = DatagramBridge::new(SessionRegistry::new());
        bridge.register_vm("alpha", &vsock).unwrap();
        assert!(listener_path(&vsock).exists());

        bridge.unregister_vm("alpha");
        assert!(!listener_path(&vsock).exists());
        assert_eq!(bridge.listener_count(), 0);

        // Idempotent.
        bridge.unregister_vm("alpha");
    }

    #[tokio::test]
    async fn test_malformed_command_reports_error() {
        let dir = tempfile::tempdir().unwrap();
        let vsock = dir.path().join("vsock.sock");

        let bridge = DatagramBridge::new(SessionRegistry::new());
        bridge.register_vm("alpha", &vsock).unwrap();

        let reply = connect_and_send(&listener_path(&vsock), "CALLBACK echo {broken").await;
        assert!(reply["error"].as_str().unwrap().contains("invalid JSON"));
    }
}
