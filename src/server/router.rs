use std::sync::Arc;
use std::time::Instant;

use axum::extract::Request;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::{
    Router,
    routing::{get, post},
};
use tokio_util::sync::CancellationToken;

use super::admin::admin_router;
use super::user::user_router;
use super::{auth, ws};
use crate::agent::AgentClient;
use crate::audit::{AuditWriter, OperationMirror};
use crate::auth::SecretHasher;
use crate::config::ServerConfig;
use crate::crypto::SecretBox;
use crate::error::Result;
use crate::operations::{OperationService, SubscriberHub};
use crate::queue::QueueService;
use crate::rbac::Authorizer;
use crate::store::Store;
use crate::webhook::WebhookService;

/// Services shared by every handler, built once at startup.
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub config: ServerConfig,
    pub authorizer: Authorizer,
    pub agent: Arc<AgentClient>,
    pub audit: AuditWriter,
    pub operations: Arc<OperationService>,
    pub queue: QueueService,
    pub webhooks: WebhookService,
    pub hasher: Arc<SecretHasher>,
    /// Root token; cancelling it stops workers, the reaper and relays.
    pub cancel: CancellationToken,
}

impl AppState {
    pub fn new(
        store: Arc<dyn Store>,
        config: ServerConfig,
        secrets: SecretBox,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let authorizer = Authorizer::new(store.clone());
        let audit = AuditWriter::new(store.clone());
        let agent = Arc::new(AgentClient::new(&config.agent, secrets)?);
        let hub = Arc::new(SubscriberHub::new());
        let operations = Arc::new(OperationService::new(
            store.clone(),
            agent.clone(),
            authorizer.clone(),
            audit.clone(),
            hub,
        ));
        let queue = QueueService::new(
            store.clone(),
            authorizer.clone(),
            audit.clone(),
            operations.clone(),
            Arc::new(OperationMirror::from_config(&config)),
            config.queue.clone(),
            cancel.clone(),
        );
        let hasher = Arc::new(SecretHasher::new());
        let webhooks = WebhookService::new(
            store.clone(),
            authorizer.clone(),
            agent.clone(),
            queue.clone(),
            audit.clone(),
            cancel.clone(),
        );

        Ok(Self {
            store,
            config,
            authorizer,
            agent,
            audit,
            operations,
            queue,
            webhooks,
            hasher,
            cancel,
        })
    }
}

async fn health() -> &'static str {
    "OK"
}

async fn log_request(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let start = Instant::now();

    let response = next.run(request).await;

    let latency = start.elapsed();
    let status = response.status();

    tracing::info!(
        "{} {} {} {}ms",
        method,
        uri.path(),
        status.as_u16(),
        latency.as_millis()
    );

    response
}

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/auth/login", post(auth::login))
        .route("/api/v1/auth/refresh", post(auth::refresh))
        .route("/api/v1/auth/logout", post(auth::logout))
        .route("/api/v1/auth/me", get(auth::me))
        .nest("/api/v1/admin", admin_router())
        .nest("/api/v1", user_router())
        .route(
            "/ws/api/servers/{server_id}/stacks/{stack}/operations",
            get(ws::operation_socket),
        )
        .route(
            "/ws/api/servers/{server_id}/stacks/{stack}/operations/{operation_id}",
            get(ws::attach_socket),
        )
        .layer(middleware::from_fn(log_request))
        .with_state(state)
}
