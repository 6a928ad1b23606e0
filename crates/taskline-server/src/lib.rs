use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use taskline_core::{Collaborators, ControlPlaneConfig, TaskRegistry};
use taskline_observability::{emit_event, init_process_logging, ObservabilityEvent, ProcessKind};

mod http;

pub use http::{app_router, serve};

#[derive(Clone)]
pub struct AppState {
    pub registry: TaskRegistry,
    pub services: Arc<dyn Collaborators>,
    pub config: Arc<ControlPlaneConfig>,
}

impl AppState {
    pub fn new(services: Arc<dyn Collaborators>, config: ControlPlaneConfig) -> Self {
        Self {
            registry: TaskRegistry::new(),
            services,
            config: Arc::new(config),
        }
    }
}

/// Loads configuration, installs process logging and serves until ctrl-c.
pub async fn run(
    addr: SocketAddr,
    services: Arc<dyn Collaborators>,
    config_path: Option<&Path>,
) -> anyhow::Result<()> {
    let config = ControlPlaneConfig::load(config_path).await?;
    let (_log_guard, log_info) = init_process_logging(
        ProcessKind::Server,
        &config.logs_dir(),
        config.log_retention_days,
    )?;
    emit_event(
        tracing::Level::INFO,
        ProcessKind::Server,
        ObservabilityEvent::new("server.main", "logging.initialized")
            .status("ok")
            .detail("server jsonl logging initialized"),
    );
    tracing::info!("server logging initialized: {:?}", log_info);
    tracing::info!(
        "serving taskline on {} (workspace root {})",
        addr,
        config.workspace_root.display()
    );
    serve(addr, AppState::new(services, config)).await
}
