use std::sync::Arc;

use async_trait::async_trait;

use crate::{config::TransportMode, identity::Identity, Result};

/// A delivery strategy (long polling or webhooks), chosen once at construction.
///
/// The orchestrator serializes `register_identity`, `remove_identity` and
/// `bring_up`; implementations do not need to guard against them racing.
#[async_trait]
pub trait Transport: Send + Sync {
    fn mode(&self) -> TransportMode;

    /// Mode-specific preparation of the already validated primary identity.
    async fn prepare_primary(&self, primary: &Arc<Identity>) -> Result<()>;

    /// Make a freshly registered minion reachable.
    async fn register_identity(&self, identity: &Arc<Identity>) -> Result<()>;

    /// Tear down a minion's delivery. Never fails; once this returns nothing
    /// delivers for the identity any more.
    async fn remove_identity(&self, identity: &Identity);

    /// Start delivering for the primary identity and every registered minion.
    async fn bring_up(&self, primary: &Arc<Identity>, minions: Vec<Arc<Identity>>) -> Result<()>;

    /// Resolves once the transport has fully stopped after [`Transport::shutdown`].
    async fn closed(&self) -> Result<()>;

    fn shutdown(&self);
}
