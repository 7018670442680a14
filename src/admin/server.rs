//! Admin server

use crate::admin::http::{create_router, AdminState};
use crate::common::{AdminConfig, Result};

pub struct AdminServer {
    config: AdminConfig,
    state: AdminState,
    auto_start: bool,
}

impl AdminServer {
    pub fn new(config: AdminConfig, state: AdminState, auto_start: bool) -> Self {
        Self {
            config,
            state,
            auto_start,
        }
    }

    /// Serve until ctrl-c. A run in flight is abandoned with the process;
    /// the next run recovers its MIGRATING rows.
    pub async fn serve(self) -> Result<()> {
        tracing::info!("Starting admin server");
        tracing::info!("  HTTP API: {}", self.config.bind_addr);
        tracing::info!("  Auto start: {}", self.auto_start);

        if self.auto_start && !self.state.start_run() {
            tracing::warn!("auto start skipped, a run is already in progress");
        }

        let listener = tokio::net::TcpListener::bind(self.config.bind_addr).await?;
        let router = create_router(self.state);
        tracing::info!("✓ Admin server ready");

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        tracing::info!("Admin server stopped");
        Ok(())
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for ctrl-c: {}", e);
        std::future::pending::<()>().await;
    }
}
