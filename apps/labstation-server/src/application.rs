//! Composition root: wires a validated configuration into a
//! running `ThreadManager`/`ModuleManager` pair, starts the optional remote
//! module server, and drives the startup-activate / shutdown sequence
//! `main` calls into.

use std::path::PathBuf;
use std::sync::Arc;

use labstation_core::config::{RemoteServerConfig, ValidatedConfig};
use labstation_core::manager::ModuleManager;
use labstation_core::remote::{RemoteExportTarget, RemoteServer, ServerTlsConfig};
use labstation_core::thread_manager::ThreadManager;

/// A running instance of the composition root.
pub struct Application {
    manager: Arc<ModuleManager>,
    remote_server: Option<tokio::task::JoinHandle<()>>,
    startup_modules: Vec<String>,
}

impl Application {
    /// Eagerly constructs every declared module and starts the remote server when
    /// `global.remote_modules_server` is set.
    ///
    /// # Errors
    /// Returns an error if a configured remote server's TLS material
    /// cannot be read from disk.
    pub fn bootstrap(cfg: &ValidatedConfig, app_state_dir: PathBuf) -> anyhow::Result<Self> {
        let thread_manager = Arc::new(ThreadManager::new());
        let manager = ModuleManager::new(cfg, thread_manager, app_state_dir);

        let remote_server = cfg
            .global
            .remote_modules_server
            .as_ref()
            .map(|remote_cfg| spawn_remote_server(&manager, remote_cfg))
            .transpose()?;

        Ok(Self {
            manager,
            remote_server,
            startup_modules: cfg.global.startup_modules.clone(),
        })
    }

    /// Activates the configured startup modules, then blocks until
    /// `shutdown` cancels, then deactivates every live module and stops the
    /// remote server.
    ///
    /// # Errors
    /// Propagates the first startup-activation failure; shutdown-time
    /// deactivation failures are logged, not propagated, so a single broken
    /// module never blocks the rest of the teardown.
    pub async fn run_until_shutdown(self, shutdown: tokio_util::sync::CancellationToken) -> anyhow::Result<()> {
        self.manager
            .activate_startup_modules(&self.startup_modules)
            .await?;

        shutdown.cancelled().await;
        tracing::info!("shutdown signal observed, deactivating modules");

        for row in self.manager.snapshot() {
            if let Err(e) = self.manager.deactivate(&row.name).await {
                tracing::error!(module = %row.name, error = %e, "deactivation failed during shutdown");
            }
        }

        if let Some(handle) = self.remote_server {
            handle.abort();
        }

        Ok(())
    }
}

fn spawn_remote_server(
    manager: &Arc<ModuleManager>,
    remote_cfg: &RemoteServerConfig,
) -> anyhow::Result<tokio::task::JoinHandle<()>> {
    let tls = match (&remote_cfg.certfile, &remote_cfg.keyfile) {
        (Some(cert_path), Some(key_path)) => Some(ServerTlsConfig {
            cert_chain_pem: std::fs::read(cert_path)?,
            key_pem: std::fs::read(key_path)?,
        }),
        _ => None,
    };

    let target: Arc<dyn RemoteExportTarget> = Arc::clone(manager);
    let server = RemoteServer::new(target);
    let address = remote_cfg.address.clone();
    let port = remote_cfg.port;

    Ok(tokio::spawn(async move {
        if let Err(e) = server.serve(&address, port, tls).await {
            tracing::error!(error = %e, "remote module server stopped");
        }
    }))
}
