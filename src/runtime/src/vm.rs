//! VM lifecycle manager.
//!
//! Owns the name → record map and orchestrates create/boot, pause/resume,
//! stop, snapshot, restore, and destroy against the per-VM hypervisor
//! adapter, the network fabric, and the allocators. All state transitions
//! for one VM are serialised by that VM's mutex; operations on distinct VMs
//! run concurrently. Map, allocator, and port mutexes are never held across
//! I/O on the hypervisor.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};

use serde::{Deserialize, Serialize};
use sysinfo::System;
use tokio::sync::Mutex;

use sandcastle_core::config::{NfsSource, ServerConfig};
use sandcastle_core::error::{FleetError, Result};

use crate::bridge::DatagramBridge;
use crate::callback::SessionRegistry;
use crate::cmdline::kernel_cmdline;
use crate::hypervisor::payload::{
    ConsoleConfig, CpusConfig, DiskConfig, MemoryConfig, NetConfig, PayloadConfig, VmConfig,
    VsockConfig,
};
use crate::hypervisor::HypervisorAdapter;
use crate::net::{IpAllocator, NatBackend, NetworkFabric, PortForward, PortForwardManager};
use crate::store::{VmRecordData, VmStore};

/// Guest vsock context id (the host is always 2).
const GUEST_CID: u64 = 3;

/// Boot vCPUs for every guest.
const DEFAULT_VCPUS: u8 = 2;

const STATEFUL_DISK_FILE: &str = "stateful.img";
const CONTROL_SOCKET_FILE: &str = "chv.sock";
const VSOCK_SOCKET_FILE: &str = "vsock.sock";
const SNAPSHOT_DIR: &str = "snapshots";

/// VM lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmState {
    Booting,
    Running,
    Paused,
    Stopping,
    Stopped,
    Destroyed,
}

impl VmState {
    pub fn as_str(&self) -> &'static str {
        match self {
            VmState::Booting => "booting",
            VmState::Running => "running",
            VmState::Paused => "paused",
            VmState::Stopping => "stopping",
            VmState::Stopped => "stopped",
            VmState::Destroyed => "destroyed",
        }
    }
}

/// Create-or-restore request, already schema-validated by the HTTP surface.
#[derive(Debug, Clone, Default)]
pub struct CreateRequest {
    pub name: String,
    pub kernel: Option<PathBuf>,
    pub initramfs: Option<PathBuf>,
    pub entry_point: Option<String>,
    pub snapshot_id: Option<String>,
    pub nfs_server: Option<String>,
    pub nfs_port: Option<u16>,
    pub nfs_path: Option<String>,
    pub callback_url: Option<String>,
}

/// One file in an upload request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadFile {
    pub path: String,
    pub content: String,
}

/// Caller-facing view of one VM.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmView {
    pub vm_name: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tap_device_name: Option<String>,
    pub port_forwards: Vec<PortForward>,
}

/// Mutable per-VM state, guarded by the record mutex.
struct VmInner {
    state: VmState,
    guest_ip: Option<Ipv4Addr>,
    tap_device: Option<String>,
    port_forwards: Vec<PortForward>,
    root_source: NfsSource,
    entry_point: Option<String>,
    callback_url: Option<String>,
    created_at: String,
    adapter: Option<Arc<HypervisorAdapter>>,
}

/// One VM record. All transitions take `inner`.
struct VmRecord {
    name: String,
    inner: Mutex<VmInner>,
}

/// Resources claimed so far during a create, for rollback on failure.
#[derive(Default)]
struct Provisioned {
    guest_ip: Option<Ipv4Addr>,
    port_forwards: Vec<PortForward>,
    tap_device: Option<String>,
    disk_created: Option<PathBuf>,
    adapter: Option<Arc<HypervisorAdapter>>,
    bridge_registered: bool,
}

/// The fleet: every live VM record plus the shared allocators.
pub struct VmManager {
    config: ServerConfig,
    fabric: NetworkFabric,
    ip_alloc: StdMutex<IpAllocator>,
    port_fwd: Mutex<PortForwardManager>,
    store: VmStore,
    persisted: StdMutex<HashMap<String, VmRecordData>>,
    sessions: Arc<SessionRegistry>,
    bridge: Arc<DatagramBridge>,
    vms: StdMutex<HashMap<String, Arc<VmRecord>>>,
}

impl VmManager {
    pub fn new(
        config: ServerConfig,
        fabric: NetworkFabric,
        nat: Arc<dyn NatBackend>,
        sessions: Arc<SessionRegistry>,
        bridge: Arc<DatagramBridge>,
    ) -> Result<Arc<Self>> {
        let ip_alloc = IpAllocator::new(&config.bridge_subnet)?;
        let port_fwd = PortForwardManager::new(&config.port_forwards, nat)?;
        let store = VmStore::new(&config.state_dir);

        Ok(Arc::new(Self {
            config,
            fabric,
            ip_alloc: StdMutex::new(ip_alloc),
            port_fwd: Mutex::new(port_fwd),
            store,
            persisted: StdMutex::new(HashMap::new()),
            sessions,
            bridge,
            vms: StdMutex::new(HashMap::new()),
        }))
    }

    /// Rebuild in-memory state from the persisted records.
    ///
    /// Records that claim `running`/`paused` lost their hypervisor child
    /// with the previous process; their host-side leftovers are reclaimed
    /// and they are demoted to `stopped`.
    pub async fn recover(&self) -> Result<()> {
        let records = self.store.load()?;

        for (name, mut record) in records {
            if record.state == VmState::Destroyed {
                continue;
            }

            if record.state != VmState::Stopped {
                tracing::warn!(
                    vm_name = %name,
                    state = record.state.as_str(),
                    "Reclaiming resources of VM from previous process"
                );

                // Seed the allocators so the cleanup below balances them.
                if let Some(ip) = record.guest_ip {
                    self.ip_alloc.lock().unwrap().reserve([ip]);
                }
                {
                    let mut port_fwd = self.port_fwd.lock().await;
                    port_fwd.reserve_existing(record.port_forwards.iter().map(|f| f.host_port));
                    if let Some(ip) = record.guest_ip {
                        if let Err(e) = port_fwd.remove(&record.port_forwards, ip).await {
                            tracing::warn!(vm_name = %name, error = %e, "Stale NAT cleanup failed");
                        }
                    }
                }
                if let Some(tap) = &record.tap_device {
                    if let Err(e) = self.fabric.delete_tap(tap).await {
                        tracing::warn!(vm_name = %name, error = %e, "Stale tap cleanup failed");
                    }
                }
                if let Some(ip) = record.guest_ip {
                    self.ip_alloc.lock().unwrap().release(ip);
                }

                record.state = VmState::Stopped;
                record.guest_ip = None;
                record.tap_device = None;
                record.port_forwards.clear();
            }

            let vm = Arc::new(VmRecord {
                name: name.clone(),
                inner: Mutex::new(VmInner {
                    state: record.state,
                    guest_ip: record.guest_ip,
                    tap_device: record.tap_device.clone(),
                    port_forwards: record.port_forwards.clone(),
                    root_source: record.root_source.clone(),
                    entry_point: record.entry_point.clone(),
                    callback_url: record.callback_url.clone(),
                    created_at: record.created_at.clone(),
                    adapter: None,
                }),
            });

            self.vms.lock().unwrap().insert(name.clone(), vm);
            self.persisted.lock().unwrap().insert(name, record);
        }

        self.save_records()?;
        Ok(())
    }

    fn vm_dir(&self, name: &str) -> PathBuf {
        self.config.state_dir.join(name)
    }

    fn snapshot_dir(&self, name: &str, snapshot_id: &str) -> PathBuf {
        self.vm_dir(name).join(SNAPSHOT_DIR).join(snapshot_id)
    }

    fn validate_name(name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(FleetError::Validation("Empty vm name".to_string()));
        }
        if name.contains(['/', '\\']) || name.contains("..") || name.contains(char::is_whitespace) {
            return Err(FleetError::Validation(format!("Invalid vm name: {}", name)));
        }
        Ok(())
    }

    fn resolve_root_source(&self, req: &CreateRequest) -> Result<NfsSource> {
        let server = req
            .nfs_server
            .clone()
            .or_else(|| self.config.nfs_server.clone());
        let port = req.nfs_port.or(self.config.nfs_port);

        match (server, port) {
            (Some(server), Some(port)) => Ok(NfsSource {
                server,
                port,
                path: req
                    .nfs_path
                    .clone()
                    .unwrap_or_else(|| self.config.nfs_path.clone()),
            }),
            _ => Err(FleetError::Validation(
                "nfsServer and nfsPort are required (request or configuration)".to_string(),
            )),
        }
    }

    /// Guest memory budget in bytes.
    fn guest_memory_bytes(&self) -> u64 {
        let mut sys = System::new();
        sys.refresh_memory();
        sys.total_memory() / 100 * self.config.guest_mem_percentage as u64
    }

    /// Create and boot a VM, or restore one from a snapshot. Each step
    /// reverses its predecessors on failure.
    pub async fn create_vm(&self, req: CreateRequest) -> Result<VmView> {
        Self::validate_name(&req.name)?;
        let root_source = self.resolve_root_source(&req)?;

        // Step 1: claim the name slot.
        let record = {
            let mut vms = self.vms.lock().unwrap();
            if vms.contains_key(&req.name) {
                return Err(FleetError::Conflict(format!(
                    "VM '{}' already exists",
                    req.name
                )));
            }
            let record = Arc::new(VmRecord {
                name: req.name.clone(),
                inner: Mutex::new(VmInner {
                    state: VmState::Booting,
                    guest_ip: None,
                    tap_device: None,
                    port_forwards: Vec::new(),
                    root_source: root_source.clone(),
                    entry_point: req.entry_point.clone(),
                    callback_url: req.callback_url.clone(),
                    created_at: chrono::Utc::now().to_rfc3339(),
                    adapter: None,
                }),
            });
            vms.insert(req.name.clone(), record.clone());
            record
        };

        let mut inner = record.inner.lock().await;

        match self.provision(&req, &root_source).await {
            Ok(p) => {
                inner.state = VmState::Running;
                inner.guest_ip = p.guest_ip;
                inner.tap_device = p.tap_device;
                inner.port_forwards = p.port_forwards;
                inner.adapter = p.adapter;

                let view = self.view_of(&record.name, &inner);
                self.persist(&record.name, &inner)?;

                tracing::info!(
                    vm_name = %record.name,
                    guest_ip = ?inner.guest_ip,
                    restored = req.snapshot_id.is_some(),
                    "VM running"
                );
                Ok(view)
            }
            Err(e) => {
                drop(inner);
                self.vms.lock().unwrap().remove(&req.name);
                tracing::error!(vm_name = %req.name, error = %e, "VM create failed");
                Err(e)
            }
        }
    }

    /// Steps 2-8 of the create contract. Returns the claimed resources, or
    /// rolls all of them back before surfacing the error.
    async fn provision(&self, req: &CreateRequest, root_source: &NfsSource) -> Result<Provisioned> {
        let mut p = Provisioned::default();
        match self.try_provision(req, root_source, &mut p).await {
            Ok(()) => Ok(p),
            Err(e) => {
                self.rollback(&req.name, std::mem::take(&mut p)).await;
                Err(e)
            }
        }
    }

    async fn try_provision(
        &self,
        req: &CreateRequest,
        root_source: &NfsSource,
        p: &mut Provisioned,
    ) -> Result<()> {
        // Step 2: guest IP.
        let guest_ip = self.ip_alloc.lock().unwrap().allocate()?;
        p.guest_ip = Some(guest_ip);

        // Step 3: port forwards + NAT.
        p.port_forwards = self
            .port_fwd
            .lock()
            .await
            .reserve_and_install(guest_ip)
            .await?;

        // Step 4: tap device.
        p.tap_device = Some(self.fabric.create_tap(&req.name).await?);

        // Step 5: stateful disk.
        let vm_dir = self.vm_dir(&req.name);
        std::fs::create_dir_all(&vm_dir)?;
        let disk_path = vm_dir.join(STATEFUL_DISK_FILE);
        if !disk_path.exists() {
            let disk = std::fs::File::create(&disk_path)?;
            // Sparse: allocate length without writing data blocks.
            disk.set_len(self.config.stateful_size_in_mb * 1024 * 1024)?;
            p.disk_created = Some(disk_path.clone());
        }

        // Restores need the disk image captured with the snapshot.
        if let Some(snapshot_id) = &req.snapshot_id {
            let snapshot_dir = self.snapshot_dir(&req.name, snapshot_id);
            if !snapshot_dir.is_dir() {
                return Err(FleetError::NotFound(format!(
                    "snapshot '{}' not found for VM '{}'",
                    snapshot_id, req.name
                )));
            }
            let saved_disk = snapshot_dir.join(STATEFUL_DISK_FILE);
            if saved_disk.exists() {
                std::fs::copy(&saved_disk, &disk_path)?;
            }
        }

        // Steps 6-7: spawn the hypervisor and wait for its API.
        let control_socket = vm_dir.join(CONTROL_SOCKET_FILE);
        let adapter = Arc::new(
            HypervisorAdapter::spawn(&self.config.chv_bin, &control_socket, &req.name).await?,
        );
        p.adapter = Some(adapter.clone());

        // Step 8: submit config and boot (or restore).
        let vsock_socket = vm_dir.join(VSOCK_SOCKET_FILE);
        match &req.snapshot_id {
            None => {
                let cmdline = kernel_cmdline(
                    root_source,
                    self.config.gateway_ip()?,
                    guest_ip,
                    &req.name,
                    req.callback_url.as_deref(),
                );
                let vm_config = self.build_vm_config(req, &disk_path, &vsock_socket, cmdline);
                adapter.create_vm(&vm_config).await?;
                adapter.boot_vm().await?;
            }
            Some(snapshot_id) => {
                let snapshot_dir = self.snapshot_dir(&req.name, snapshot_id);
                adapter.restore_vm(&snapshot_dir).await?;
            }
        }

        self.bridge.register_vm(&req.name, &vsock_socket)?;
        p.bridge_registered = true;

        Ok(())
    }

    fn build_vm_config(
        &self,
        req: &CreateRequest,
        disk_path: &Path,
        vsock_socket: &Path,
        cmdline: String,
    ) -> VmConfig {
        VmConfig {
            payload: PayloadConfig {
                kernel: req
                    .kernel
                    .clone()
                    .unwrap_or_else(|| self.config.kernel.clone())
                    .display()
                    .to_string(),
                initramfs: Some(
                    req.initramfs
                        .clone()
                        .unwrap_or_else(|| self.config.initramfs.clone())
                        .display()
                        .to_string(),
                ),
                cmdline: Some(cmdline),
            },
            cpus: CpusConfig {
                boot_vcpus: DEFAULT_VCPUS,
                max_vcpus: DEFAULT_VCPUS,
            },
            memory: MemoryConfig {
                size: self.guest_memory_bytes(),
                shared: None,
            },
            disks: Some(vec![DiskConfig {
                path: disk_path.display().to_string(),
            }]),
            net: Some(vec![NetConfig {
                tap: crate::net::tap_device_name(&req.name),
                mac: None,
            }]),
            vsock: Some(VsockConfig {
                cid: GUEST_CID,
                socket: vsock_socket.display().to_string(),
            }),
            serial: Some(ConsoleConfig::tty()),
            console: Some(ConsoleConfig::off()),
        }
    }

    /// Undo a partial provision, newest resource first.
    async fn rollback(&self, name: &str, p: Provisioned) {
        if p.bridge_registered {
            self.bridge.unregister_vm(name);
        }
        if let Some(adapter) = p.adapter {
            adapter.destroy().await;
        }
        if let Some(disk) = p.disk_created {
            let _ = std::fs::remove_file(disk);
        }
        if let Some(tap) = p.tap_device {
            if let Err(e) = self.fabric.delete_tap(&tap).await {
                tracing::warn!(vm_name = %name, error = %e, "Tap rollback failed");
            }
        }
        if let Some(ip) = p.guest_ip {
            if !p.port_forwards.is_empty() {
                if let Err(e) = self.port_fwd.lock().await.remove(&p.port_forwards, ip).await {
                    tracing::warn!(vm_name = %name, error = %e, "Port rollback failed");
                }
            }
            self.ip_alloc.lock().unwrap().release(ip);
        }
    }

    fn get_record(&self, name: &str) -> Result<Arc<VmRecord>> {
        self.vms
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| FleetError::NotFound(format!("VM '{}' not found", name)))
    }

    /// Describe one VM.
    pub async fn get_vm(&self, name: &str) -> Result<VmView> {
        let record = self.get_record(name)?;
        let inner = record.inner.lock().await;
        Ok(self.view_of(&record.name, &inner))
    }

    /// Describe every VM.
    pub async fn list_vms(&self) -> Vec<VmView> {
        let records: Vec<Arc<VmRecord>> = self.vms.lock().unwrap().values().cloned().collect();

        let mut views = Vec::with_capacity(records.len());
        for record in records {
            let inner = record.inner.lock().await;
            views.push(self.view_of(&record.name, &inner));
        }
        views.sort_by(|a, b| a.vm_name.cmp(&b.vm_name));
        views
    }

    fn view_of(&self, name: &str, inner: &VmInner) -> VmView {
        VmView {
            vm_name: name.to_string(),
            status: inner.state.as_str().to_string(),
            ip: inner.guest_ip.map(|ip| ip.to_string()),
            tap_device_name: inner.tap_device.clone(),
            port_forwards: inner.port_forwards.clone(),
        }
    }

    /// Pause a running VM.
    pub async fn pause_vm(&self, name: &str) -> Result<VmView> {
        let record = self.get_record(name)?;
        let mut inner = record.inner.lock().await;

        if inner.state != VmState::Running {
            return Err(FleetError::Validation(format!(
                "VM '{}' is {}, cannot pause",
                name,
                inner.state.as_str()
            )));
        }

        adapter_of(&inner)?.pause_vm().await?;
        inner.state = VmState::Paused;
        self.persist(name, &inner)?;
        Ok(self.view_of(name, &inner))
    }

    /// Resume a paused VM.
    pub async fn resume_vm(&self, name: &str) -> Result<VmView> {
        let record = self.get_record(name)?;
        let mut inner = record.inner.lock().await;

        if inner.state != VmState::Paused {
            return Err(FleetError::Validation(format!(
                "VM '{}' is {}, cannot resume",
                name,
                inner.state.as_str()
            )));
        }

        adapter_of(&inner)?.resume_vm().await?;
        inner.state = VmState::Running;
        self.persist(name, &inner)?;
        Ok(self.view_of(name, &inner))
    }

    /// Stop a VM: shut the guest down and release its IP, ports, and tap.
    /// The record and the stateful disk remain.
    pub async fn stop_vm(&self, name: &str) -> Result<VmView> {
        let record = self.get_record(name)?;
        let mut inner = record.inner.lock().await;

        if !matches!(inner.state, VmState::Running | VmState::Paused) {
            return Err(FleetError::Validation(format!(
                "VM '{}' is {}, cannot stop",
                name,
                inner.state.as_str()
            )));
        }

        inner.state = VmState::Stopping;
        if let Some(adapter) = inner.adapter.take() {
            adapter.destroy().await;
        }
        self.release_network(name, &mut inner).await;

        inner.state = VmState::Stopped;
        self.persist(name, &inner)?;
        tracing::info!(vm_name = %name, "VM stopped");
        Ok(self.view_of(name, &inner))
    }

    /// Release bridge registration, tap, NAT rules, and guest IP.
    async fn release_network(&self, name: &str, inner: &mut VmInner) {
        self.bridge.unregister_vm(name);

        if let Some(tap) = inner.tap_device.take() {
            if let Err(e) = self.fabric.delete_tap(&tap).await {
                tracing::warn!(vm_name = %name, error = %e, "Tap teardown failed");
            }
        }

        if let Some(ip) = inner.guest_ip.take() {
            let forwards = std::mem::take(&mut inner.port_forwards);
            if !forwards.is_empty() {
                if let Err(e) = self.port_fwd.lock().await.remove(&forwards, ip).await {
                    tracing::warn!(vm_name = %name, error = %e, "NAT teardown failed");
                }
            }
            self.ip_alloc.lock().unwrap().release(ip);
        }
    }

    /// Snapshot a VM into `<state_dir>/<name>/snapshots/<id>`.
    ///
    /// A running VM is paused around the hypervisor snapshot and resumed
    /// afterwards; a VM the caller paused beforehand stays paused.
    pub async fn snapshot_vm(&self, name: &str, snapshot_id: Option<String>) -> Result<String> {
        let record = self.get_record(name)?;
        let inner = record.inner.lock().await;

        if !matches!(inner.state, VmState::Running | VmState::Paused) {
            return Err(FleetError::Validation(format!(
                "VM '{}' is {}, cannot snapshot",
                name,
                inner.state.as_str()
            )));
        }

        let snapshot_id = snapshot_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let snapshot_dir = self.snapshot_dir(name, &snapshot_id);
        std::fs::create_dir_all(&snapshot_dir)?;

        let adapter = adapter_of(&inner)?;
        let was_running = inner.state == VmState::Running;

        if was_running {
            adapter.pause_vm().await?;
        }

        let result = adapter.snapshot_vm(&snapshot_dir).await;

        // Capture the scratch disk alongside the memory/device state so a
        // restore after destroy is self-contained.
        if result.is_ok() {
            let disk = self.vm_dir(name).join(STATEFUL_DISK_FILE);
            if disk.exists() {
                std::fs::copy(&disk, snapshot_dir.join(STATEFUL_DISK_FILE))?;
            }
        }

        if was_running {
            adapter.resume_vm().await?;
        }

        result?;
        tracing::info!(vm_name = %name, snapshot_id = %snapshot_id, "Snapshot created");
        Ok(snapshot_id)
    }

    /// Destroy a VM from any non-terminal state. Idempotent on the terminal
    /// outcome; teardown failures are logged but in-memory bookkeeping is
    /// always released.
    pub async fn destroy_vm(&self, name: &str) -> Result<()> {
        // The destroy path wins races with in-flight callbacks by closing
        // the session first.
        self.sessions.remove_session(name);

        let record = self.get_record(name)?;
        let mut inner = record.inner.lock().await;

        if inner.state == VmState::Destroyed {
            return Ok(());
        }

        if let Some(adapter) = inner.adapter.take() {
            adapter.destroy().await;
        }
        self.release_network(name, &mut inner).await;

        // The disk goes; snapshots stay restorable until the caller removes
        // them, so the VM directory is only removed once it is empty of them.
        let vm_dir = self.vm_dir(name);
        let _ = std::fs::remove_file(vm_dir.join(STATEFUL_DISK_FILE));
        let _ = std::fs::remove_file(vm_dir.join(CONTROL_SOCKET_FILE));
        let _ = std::fs::remove_file(vm_dir.join(VSOCK_SOCKET_FILE));
        let snapshots = vm_dir.join(SNAPSHOT_DIR);
        let has_snapshots = std::fs::read_dir(&snapshots)
            .map(|mut entries| entries.next().is_some())
            .unwrap_or(false);
        if !has_snapshots {
            let _ = std::fs::remove_dir_all(&vm_dir);
        }

        inner.state = VmState::Destroyed;
        drop(inner);

        self.vms.lock().unwrap().remove(name);
        self.persisted.lock().unwrap().remove(name);
        self.save_records()?;

        tracing::info!(vm_name = %name, "VM destroyed");
        Ok(())
    }

    /// Destroy every VM. Failures are logged; the sweep continues.
    pub async fn destroy_all(&self) -> Result<()> {
        let names: Vec<String> = self.vms.lock().unwrap().keys().cloned().collect();

        let mut first_err = None;
        for name in names {
            if let Err(e) = self.destroy_vm(&name).await {
                tracing::error!(vm_name = %name, error = %e, "Destroy failed");
                first_err.get_or_insert(e);
            }
        }

        match first_err {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    /// Run a command in the guest, routed via the callback fabric.
    pub async fn vm_command(
        &self,
        name: &str,
        cmd: &str,
        blocking: bool,
    ) -> Result<serde_json::Value> {
        self.require_running(name).await?;
        self.sessions
            .route_callback(
                name,
                "exec",
                Some(serde_json::json!({ "cmd": cmd, "blocking": blocking })),
                None,
            )
            .await
    }

    /// Upload files into the guest, routed via the callback fabric.
    pub async fn file_upload(
        &self,
        name: &str,
        files: Vec<UploadFile>,
    ) -> Result<serde_json::Value> {
        self.require_running(name).await?;
        self.sessions
            .route_callback(
                name,
                "upload",
                Some(serde_json::json!({ "files": files })),
                None,
            )
            .await
    }

    /// Download files from the guest, routed via the callback fabric.
    pub async fn file_download(&self, name: &str, paths: Vec<String>) -> Result<serde_json::Value> {
        self.require_running(name).await?;
        self.sessions
            .route_callback(
                name,
                "download",
                Some(serde_json::json!({ "paths": paths })),
                None,
            )
            .await
    }

    /// Route a guest-originated callback (direct HTTP mode).
    pub async fn route_callback(
        &self,
        name: &str,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value> {
        self.sessions.route_callback(name, method, params, None).await
    }

    async fn require_running(&self, name: &str) -> Result<()> {
        let record = self.get_record(name)?;
        let inner = record.inner.lock().await;
        if inner.state != VmState::Running {
            return Err(FleetError::Validation(format!(
                "VM '{}' is {}, expected running",
                name,
                inner.state.as_str()
            )));
        }
        Ok(())
    }

    fn persist(&self, name: &str, inner: &VmInner) -> Result<()> {
        let data = VmRecordData {
            name: name.to_string(),
            state: inner.state,
            guest_ip: inner.guest_ip,
            tap_device: inner.tap_device.clone(),
            port_forwards: inner.port_forwards.clone(),
            stateful_disk_path: self.vm_dir(name).join(STATEFUL_DISK_FILE),
            root_source: inner.root_source.clone(),
            entry_point: inner.entry_point.clone(),
            callback_url: inner.callback_url.clone(),
            created_at: inner.created_at.clone(),
        };
        self.persisted.lock().unwrap().insert(name.to_string(), data);
        self.save_records()
    }

    fn save_records(&self) -> Result<()> {
        let snapshot = self.persisted.lock().unwrap().clone();
        self.store.save(&snapshot)
    }
}

fn adapter_of(inner: &VmInner) -> Result<Arc<HypervisorAdapter>> {
    inner
        .adapter
        .clone()
        .ok_or_else(|| FleetError::Internal("VM has no hypervisor adapter".to_string()))
}
