use crate::config::Config;
use crate::context::OpContext;
use crate::handlers::databases::{
    create_db_handler, delete_expired_handler, list_backends_handler, list_dbs_handler,
    list_expired_handler,
};
use crate::registry::Registry;
use axum::{
    Router,
    routing::{get, post},
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub struct TempDbState {
    pub registry: Arc<Registry>,
    pub default_ttl: Duration,
    pub request_timeout: Duration,
    shutdown: CancellationToken,
}

impl TempDbState {
    pub fn new(registry: Arc<Registry>, config: &Config) -> Self {
        Self {
            registry,
            default_ttl: config.default_ttl,
            request_timeout: config.request_timeout,
            shutdown: CancellationToken::new(),
        }
    }

    /// In-flight requests are cancelled when `token` is.
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    /// Context for one request: bounded by `request_timeout`, cancelled on shutdown.
    pub fn request_context(&self) -> OpContext {
        OpContext::with_cancellation(self.shutdown.child_token()).with_timeout(self.request_timeout)
    }
}

pub fn tempdb_router(state: TempDbState) -> Router {
    Router::new()
        .route("/api/v1/databases", get(list_backends_handler))
        .route(
            "/api/v1/databases/{name}/dbs",
            post(create_db_handler).get(list_dbs_handler),
        )
        .route(
            "/api/v1/databases/{name}/dbs/expired",
            get(list_expired_handler).delete(delete_expired_handler),
        )
        .with_state(state)
}
