//! Owns the primary identity, the minion registry and the active transport.

use std::sync::Arc;

use tokio::sync::Mutex;

use crate::{
    config::{Config, TransportMode},
    domain::{BotProfile, Credential},
    errors::Error,
    identity::Identity,
    polling::PollingTransport,
    ports::{ClientFactory, UpdatePipeline},
    registry::MinionRegistry,
    transport::Transport,
    webhook::WebhookTransport,
    Result,
};

pub struct Orchestrator {
    primary: Arc<Identity>,
    registry: Arc<MinionRegistry>,
    factory: Arc<dyn ClientFactory>,
    transport: Arc<dyn Transport>,
    startup: Vec<Credential>,
    // Serializes add/remove/reconciliation so cancel-then-join is atomic
    // with respect to re-adding the same credential.
    lifecycle: Mutex<()>,
}

impl Orchestrator {
    /// Build the orchestrator and pick the transport for `cfg.transport`.
    pub fn new(
        cfg: &Config,
        factory: Arc<dyn ClientFactory>,
        pipeline: Arc<dyn UpdatePipeline>,
    ) -> Result<Self> {
        let primary_credential = Credential::parse(&cfg.telegram_bot_token)
            .map_err(|e| Error::Config(format!("TELEGRAM_BOT_TOKEN: {e}")))?;
        let primary = Arc::new(Identity::new(
            primary_credential.clone(),
            factory.client(&primary_credential),
        ));

        let mut startup = Vec::with_capacity(cfg.minion_tokens.len());
        for raw in &cfg.minion_tokens {
            match Credential::parse(raw) {
                Ok(c) => startup.push(c),
                Err(e) => tracing::warn!(error = %e, "skipping malformed startup token"),
            }
        }

        let registry = Arc::new(MinionRegistry::new());
        let transport: Arc<dyn Transport> = match cfg.transport {
            TransportMode::Polling => Arc::new(PollingTransport::new(pipeline, cfg.polling())),
            TransportMode::Webhook => Arc::new(WebhookTransport::new(
                primary.clone(),
                registry.clone(),
                factory.clone(),
                pipeline,
                cfg.webhook()?,
            )),
        };

        Ok(Self::from_parts(primary, startup, registry, factory, transport))
    }

    pub fn from_parts(
        primary: Arc<Identity>,
        startup: Vec<Credential>,
        registry: Arc<MinionRegistry>,
        factory: Arc<dyn ClientFactory>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            primary,
            registry,
            factory,
            transport,
            startup,
            lifecycle: Mutex::new(()),
        }
    }

    pub fn mode(&self) -> TransportMode {
        self.transport.mode()
    }

    pub fn primary(&self) -> &Arc<Identity> {
        &self.primary
    }

    pub fn registry(&self) -> &Arc<MinionRegistry> {
        &self.registry
    }

    /// Validate and register a minion.
    ///
    /// Returns `Ok(None)` when the service rejects the credential; nothing is
    /// mutated in that case. Any other failure propagates.
    pub async fn add(&self, credential: Credential) -> Result<Option<BotProfile>> {
        if credential.id() == self.primary.id() {
            return Err(Error::InvalidCredential(
                "the primary bot cannot be added as a minion".to_string(),
            ));
        }
        let _guard = self.lifecycle.lock().await;
        self.admit_locked(credential).await
    }

    /// Unregister a minion. Returns false if it was not registered.
    ///
    /// In pull mode this only returns after the identity's polling loop has stopped.
    pub async fn remove(&self, credential: &Credential) -> bool {
        let _guard = self.lifecycle.lock().await;
        let Some(identity) = self.registry.get(credential).await else {
            return false;
        };
        self.transport.remove_identity(&identity).await;
        self.registry.remove(credential).await;
        tracing::info!(bot_id = %identity.id(), "minion removed");
        true
    }

    /// Validate the primary identity, reconcile the startup list, bring the
    /// transport up and block until it has shut down.
    pub async fn start(&self) -> Result<()> {
        let profile = self.primary.client().who_am_i().await?;
        tracing::info!(
            bot_id = %profile.id,
            username = profile.username.as_deref().unwrap_or("-"),
            mode = ?self.mode(),
            "primary identity validated"
        );

        {
            let _guard = self.lifecycle.lock().await;
            self.transport.prepare_primary(&self.primary).await?;
            self.reconcile_locked().await?;
            let minions = self.registry.identities().await;
            tracing::info!(minions = minions.len(), "bringing transport up");
            self.transport.bring_up(&self.primary, minions).await?;
        }

        self.transport.closed().await
    }

    /// Request termination; `start` returns once the transport has stopped.
    pub fn shutdown(&self) {
        self.transport.shutdown();
    }

    async fn reconcile_locked(&self) -> Result<()> {
        for credential in &self.startup {
            if credential.id() == self.primary.id() {
                tracing::warn!(bot_id = %credential.id(), "startup token belongs to the primary bot; skipping");
                continue;
            }
            if self.registry.contains(credential).await {
                continue;
            }
            if self.admit_locked(credential.clone()).await?.is_none() {
                tracing::debug!(bot_id = %credential.id(), "startup token rejected; skipping");
            }
        }
        Ok(())
    }

    async fn admit_locked(&self, credential: Credential) -> Result<Option<BotProfile>> {
        let client = self.factory.client(&credential);
        let profile = match client.who_am_i().await {
            Ok(p) => p,
            Err(e) if e.is_unauthorized() => {
                tracing::info!(bot_id = %credential.id(), "credential rejected by the service");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        client.delete_webhook(true).await?;

        if let Some(previous) = self.registry.get(&credential).await {
            self.transport.remove_identity(&previous).await;
        }

        let identity = Arc::new(Identity::new(credential.clone(), client));
        self.registry.insert(identity.clone()).await;
        if let Err(e) = self.transport.register_identity(&identity).await {
            self.registry.remove(&credential).await;
            return Err(e);
        }

        tracing::info!(
            bot_id = %profile.id,
            username = profile.username.as_deref().unwrap_or("-"),
            "minion registered"
        );
        Ok(Some(profile))
    }
}
