pub mod query_string;
pub mod routes;

use crate::action::ActionDispatcher;
use crate::auth::AuthGate;
use crate::config::Config;
use crate::error::Result;
use crate::observability::{log_requests, LogConfig, Metrics, SlowActionLog};
use crate::registry::ClusterRegistry;
use axum::routing::{any, get};
use axum::{middleware, Router};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

/// State shared by all handlers
pub struct AppState {
    pub config: Arc<Config>,
    pub dispatcher: ActionDispatcher,
}

impl AppState {
    pub fn new(config: Arc<Config>) -> Self {
        let log_config = LogConfig::from_config(&config.logging);
        let dispatcher = ActionDispatcher::new(
            Arc::new(ClusterRegistry::from_config(&config)),
            AuthGate::from_config(&config),
            Arc::new(Metrics::new()),
            Arc::new(SlowActionLog::new(log_config.slow_action_threshold)),
        );
        Self { config, dispatcher }
    }
}

/// Data API HTTP server
pub struct Server {
    state: Arc<AppState>,
}

impl Server {
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            state: Arc::new(AppState::new(config)),
        }
    }

    pub fn state(&self) -> Arc<AppState> {
        Arc::clone(&self.state)
    }

    /// Routes with request logging attached
    pub fn router(&self) -> Router {
        Router::new()
            .route("/", get(routes::service_info))
            .route("/api/v1/action/:action", any(routes::action))
            .layer(middleware::from_fn(log_requests))
            .with_state(Arc::clone(&self.state))
    }

    /// Bind the configured address and serve until the process exits
    pub async fn run(&self) -> Result<()> {
        let addr = self.state.config.listen_addr();
        let listener = TcpListener::bind(&addr).await?;
        info!("Data API listening on http://{}", addr);

        axum::serve(listener, self.router()).await?;
        Ok(())
    }
}
