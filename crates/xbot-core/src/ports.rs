use std::{any::Any, sync::Arc, time::Duration};

use async_trait::async_trait;

use crate::{
    domain::{BotProfile, Credential, Update},
    identity::Identity,
    Result,
};

/// Port to the external messaging service, bound to one credential.
///
/// Implementations must report a rejected credential as
/// [`Error::Unauthorized`](crate::Error::Unauthorized); anything else is
/// treated as a transport fault.
#[async_trait]
pub trait MessagingClient: Send + Sync {
    /// Who-am-i probe.
    async fn who_am_i(&self) -> Result<BotProfile>;

    async fn set_webhook(&self, url: &str, secret: Option<&str>) -> Result<()>;

    async fn delete_webhook(&self, drop_pending_updates: bool) -> Result<()>;

    /// Long-poll for updates starting at `offset`, waiting at most `timeout`.
    async fn get_updates(&self, offset: i64, timeout: Duration) -> Result<Vec<Update>>;

    /// The concrete client, for adapters that reuse the handle for outbound sends.
    fn as_any(&self) -> &dyn Any;
}

/// Builds client handles. Every handle shares the factory's connection settings.
pub trait ClientFactory: Send + Sync {
    fn client(&self, credential: &Credential) -> Arc<dyn MessagingClient>;
}

/// Shared downstream consumer of updates from every identity.
#[async_trait]
pub trait UpdatePipeline: Send + Sync {
    async fn deliver(&self, identity: &Identity, update: Update) -> Result<()>;
}
