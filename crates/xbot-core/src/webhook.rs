//! Push-mode transport: one HTTP listener multiplexing every identity.
//!
//! `POST /webhook/main` serves the primary identity and requires the process
//! secret in the `X-Telegram-Bot-Api-Secret-Token` header.
//! `POST /webhook/bot/{token}` serves minions; the token in the path is the
//! only authentication.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use async_trait::async_trait;
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    routing::post,
    Router,
};
use rand::{distributions::Alphanumeric, Rng};
use tokio::{
    net::TcpListener,
    sync::{Mutex, OwnedMutexGuard, RwLock},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::{
    config::{TransportMode, WebhookSettings},
    domain::{Credential, Update},
    errors::Error,
    identity::Identity,
    polling::{deliver_guarded, Delivery},
    ports::{ClientFactory, UpdatePipeline},
    registry::MinionRegistry,
    transport::Transport,
    Result,
};

pub const MAIN_WEBHOOK_PATH: &str = "/webhook/main";
pub const MINION_WEBHOOK_ROUTE: &str = "/webhook/bot/{token}";
pub const SECRET_TOKEN_HEADER: &str = "x-telegram-bot-api-secret-token";

const SECRET_LEN: usize = 64;

/// Rejected minion-route tokens remembered before the set is reset.
const REJECTED_TOKENS_LIMIT: usize = 1024;

pub fn main_webhook_url(base_url: &str) -> String {
    format!("{base_url}{MAIN_WEBHOOK_PATH}")
}

pub fn minion_webhook_url(base_url: &str, credential: &Credential) -> String {
    format!("{base_url}/webhook/bot/{}", credential.expose())
}

/// Per-process secret for the primary route. Never persisted.
pub struct WebhookSecret(String);

impl WebhookSecret {
    pub fn generate() -> Self {
        let secret = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(SECRET_LEN)
            .map(char::from)
            .collect();
        Self(secret)
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Constant-time comparison against a received header value.
    pub fn matches(&self, provided: Option<&str>) -> bool {
        let Some(provided) = provided else {
            return false;
        };
        let (a, b) = (self.0.as_bytes(), provided.as_bytes());
        if a.len() != b.len() {
            return false;
        }
        a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
    }
}

/// Serializes deliveries per identity so requests reach the pipeline in arrival order.
#[derive(Default)]
pub struct IdentityLocks {
    inner: Mutex<HashMap<Credential, Arc<Mutex<()>>>>,
}

impl IdentityLocks {
    pub async fn lock(&self, credential: &Credential) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.inner.lock().await;
            map.entry(credential.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    pub async fn forget(&self, credential: &Credential) {
        self.inner.lock().await.remove(credential);
    }
}

/// Shared state behind both routes.
pub struct WebhookState {
    primary: Arc<Identity>,
    registry: Arc<MinionRegistry>,
    factory: Arc<dyn ClientFactory>,
    pipeline: Arc<dyn UpdatePipeline>,
    secret: WebhookSecret,
    // Handles built on demand for tokens that are not in the registry.
    handles: RwLock<HashMap<Credential, Arc<Identity>>>,
    // Tokens the service rejected; answered without asking again.
    rejected: Mutex<HashSet<Credential>>,
    locks: IdentityLocks,
}

impl WebhookState {
    async fn resolve(&self, credential: &Credential) -> Option<Arc<Identity>> {
        if credential == self.primary.credential() {
            tracing::warn!("primary token used on the minion route; ignoring");
            return None;
        }
        if let Some(identity) = self.registry.get(credential).await {
            return Some(identity);
        }
        if let Some(identity) = self.handles.read().await.get(credential).cloned() {
            return Some(identity);
        }
        if self.rejected.lock().await.contains(credential) {
            tracing::debug!(bot_id = %credential.id(), "undeliverable update: token rejected earlier");
            return None;
        }

        let client = self.factory.client(credential);
        match client.who_am_i().await {
            Ok(_) => {
                let identity = Arc::new(Identity::new(credential.clone(), client));
                let mut handles = self.handles.write().await;
                Some(
                    handles
                        .entry(credential.clone())
                        .or_insert(identity)
                        .clone(),
                )
            }
            Err(e) if e.is_unauthorized() => {
                tracing::warn!(bot_id = %credential.id(), "undeliverable update: unauthorized token");
                let mut rejected = self.rejected.lock().await;
                if rejected.len() >= REJECTED_TOKENS_LIMIT {
                    rejected.clear();
                }
                rejected.insert(credential.clone());
                None
            }
            Err(e) => {
                tracing::warn!(bot_id = %credential.id(), error = %e, "undeliverable update: token check failed");
                None
            }
        }
    }

    async fn dispatch(&self, identity: &Arc<Identity>, update: Update) {
        let bot_id = identity.id();
        let update_id = update.id;
        let _guard = self.locks.lock(identity.credential()).await;
        match deliver_guarded(identity, &self.pipeline, update).await {
            Delivery::Accepted => {}
            Delivery::Rejected(e) => {
                tracing::warn!(%bot_id, update_id, error = %e, "pipeline rejected update");
            }
            Delivery::Panicked => {
                tracing::error!(%bot_id, update_id, "pipeline panicked; update dropped");
            }
        }
    }
}

pub fn build_router(state: Arc<WebhookState>) -> Router {
    Router::new()
        .route(MAIN_WEBHOOK_PATH, post(primary_update))
        .route(MINION_WEBHOOK_ROUTE, post(minion_update))
        .with_state(state)
}

async fn primary_update(
    State(state): State<Arc<WebhookState>>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    let provided = headers
        .get(SECRET_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok());
    if !state.secret.matches(provided) {
        tracing::warn!("primary webhook rejected: secret token mismatch");
        return StatusCode::UNAUTHORIZED;
    }

    let update = match Update::from_slice(&body) {
        Ok(u) => u,
        Err(e) => {
            tracing::warn!(error = %e, "primary webhook: malformed update");
            return StatusCode::BAD_REQUEST;
        }
    };

    let primary = state.primary.clone();
    state.dispatch(&primary, update).await;
    StatusCode::OK
}

async fn minion_update(
    State(state): State<Arc<WebhookState>>,
    Path(token): Path<String>,
    body: Bytes,
) -> StatusCode {
    let credential = match Credential::parse(&token) {
        Ok(c) => c,
        Err(e) => {
            tracing::warn!(error = %e, "minion webhook: bad token in path");
            return StatusCode::BAD_REQUEST;
        }
    };

    let update = match Update::from_slice(&body) {
        Ok(u) => u,
        Err(e) => {
            tracing::warn!(bot_id = %credential.id(), error = %e, "minion webhook: malformed update");
            return StatusCode::BAD_REQUEST;
        }
    };

    // Undeliverable requests are still acknowledged so Telegram does not retry.
    if let Some(identity) = state.resolve(&credential).await {
        state.dispatch(&identity, update).await;
    }
    StatusCode::OK
}

pub struct WebhookTransport {
    settings: WebhookSettings,
    state: Arc<WebhookState>,
    shutdown: CancellationToken,
    server: Mutex<Option<JoinHandle<std::io::Result<()>>>>,
}

impl WebhookTransport {
    pub fn new(
        primary: Arc<Identity>,
        registry: Arc<MinionRegistry>,
        factory: Arc<dyn ClientFactory>,
        pipeline: Arc<dyn UpdatePipeline>,
        settings: WebhookSettings,
    ) -> Self {
        let state = Arc::new(WebhookState {
            primary,
            registry,
            factory,
            pipeline,
            secret: WebhookSecret::generate(),
            handles: RwLock::new(HashMap::new()),
            rejected: Mutex::new(HashSet::new()),
            locks: IdentityLocks::default(),
        });
        Self {
            settings,
            state,
            shutdown: CancellationToken::new(),
            server: Mutex::new(None),
        }
    }

    pub fn secret(&self) -> &WebhookSecret {
        &self.state.secret
    }

    pub fn router(&self) -> Router {
        build_router(self.state.clone())
    }
}

#[async_trait]
impl Transport for WebhookTransport {
    fn mode(&self) -> TransportMode {
        TransportMode::Webhook
    }

    async fn prepare_primary(&self, _primary: &Arc<Identity>) -> Result<()> {
        // The primary webhook is (re)set in bring_up, after every minion is reachable.
        Ok(())
    }

    async fn register_identity(&self, identity: &Arc<Identity>) -> Result<()> {
        let url = minion_webhook_url(&self.settings.base_url, identity.credential());
        identity.client().set_webhook(&url, None).await?;
        tracing::info!(bot_id = %identity.id(), "minion webhook registered");
        Ok(())
    }

    async fn remove_identity(&self, identity: &Identity) {
        let bot_id = identity.id();
        if let Err(e) = identity.client().delete_webhook(false).await {
            tracing::debug!(%bot_id, error = %e, "webhook removal failed; dropping identity anyway");
        }
        self.state.handles.write().await.remove(identity.credential());
        self.state.locks.forget(identity.credential()).await;
    }

    async fn bring_up(&self, primary: &Arc<Identity>, _minions: Vec<Arc<Identity>>) -> Result<()> {
        let url = main_webhook_url(&self.settings.base_url);
        primary
            .client()
            .set_webhook(&url, Some(self.state.secret.expose()))
            .await?;

        let listener = TcpListener::bind(self.settings.listen).await?;
        let addr = listener.local_addr()?;
        tracing::info!(%addr, "webhook listener started");

        let app = self.router();
        let shutdown = self.shutdown.clone();
        let task = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await
        });
        *self.server.lock().await = Some(task);
        Ok(())
    }

    async fn closed(&self) -> Result<()> {
        let task = self.server.lock().await.take();
        match task {
            Some(task) => task
                .await
                .map_err(|e| Error::External(format!("webhook server task failed: {e}")))??,
            None => self.shutdown.cancelled().await,
        }
        tracing::info!("webhook listener stopped");
        Ok(())
    }

    fn shutdown(&self) {
        self.shutdown.cancel();
    }
}
