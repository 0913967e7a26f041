//! sandcastled - daemon for spawning and managing cloud-hypervisor based
//! microVMs.
//!
//! Startup order: configuration, network fabric, NAT chain, lifecycle
//! manager (with state recovery), callback fabric wiring, HTTP surface.
//! Shutdown order: stop accepting HTTP, then destroy the whole fleet.

mod http;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use sandcastle_core::config::ServerConfig;
use sandcastle_runtime::net::IptablesNat;
use sandcastle_runtime::{DatagramBridge, NatBackend, NetworkFabric, SessionRegistry, VmManager};

use http::AppState;

/// Sandcastle control plane daemon.
#[derive(Parser, Debug)]
#[command(name = "sandcastled", about = "Sandcastle microVM control plane")]
struct Args {
    /// Path to the YAML configuration file.
    #[arg(long, short, default_value = "./config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = ServerConfig::load(&args.config)
        .with_context(|| format!("loading configuration from {}", args.config.display()))?;

    tracing::info!(
        host = %config.host,
        port = config.port,
        state_dir = %config.state_dir.display(),
        bridge = %config.bridge_name,
        "Starting sandcastled"
    );

    std::fs::create_dir_all(&config.state_dir)
        .with_context(|| format!("creating state dir {}", config.state_dir.display()))?;

    // Host networking first; nothing else works without the bridge.
    let fabric = NetworkFabric::new(&config.bridge_name, &config.bridge_ip, &config.bridge_subnet);
    fabric
        .setup()
        .await
        .context("setting up the network fabric")?;

    let nat: Arc<dyn NatBackend> = Arc::new(IptablesNat);
    nat.ensure_chain()
        .await
        .context("preparing the NAT chain")?;

    let sessions = SessionRegistry::new();
    let bridge = DatagramBridge::new(sessions.clone());
    let manager = VmManager::new(
        config.clone(),
        fabric,
        nat,
        sessions.clone(),
        bridge,
    )?;
    manager.recover().await.context("recovering VM records")?;

    // A client holding a session owns at most one live VM: when the session
    // closes, the VM goes with it. The registry only knows it calls a hook.
    let hook_manager = manager.clone();
    sessions.set_on_session_close(Arc::new(move |vm_name: &str| {
        let manager = hook_manager.clone();
        let vm_name = vm_name.to_string();
        tokio::spawn(async move {
            tracing::info!(vm_name = %vm_name, "Client disconnected, destroying VM");
            if let Err(e) = manager.destroy_vm(&vm_name).await {
                tracing::error!(
                    vm_name = %vm_name,
                    error = %e,
                    "Failed to destroy VM on client disconnect"
                );
            }
        });
    }));

    let app = http::router(AppState {
        manager: manager.clone(),
        sessions,
    });

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {}", addr))?;
    tracing::info!(addr = %addr, "REST server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving HTTP")?;

    tracing::info!("Shutting down, destroying all VMs");
    if let Err(e) = manager.destroy_all().await {
        tracing::error!(error = %e, "Fleet teardown finished with errors");
    }
    tracing::info!("Server stopped");

    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
