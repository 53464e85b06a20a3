//! Shared update pipeline: turns raw updates into teloxide types and hands
//! them to the handler together with the bot handle of the identity that got them.

use std::sync::Arc;

use async_trait::async_trait;
use teloxide::types::Update as TgUpdate;

use xbot_core::{
    domain::{IdentityId, Update},
    errors::Error,
    identity::Identity,
    ports::UpdatePipeline,
    Result,
};

use crate::{reply_bot, ReplyBot};

/// Business logic behind the pipeline. `bot` answers as the identity that
/// received the update.
///
/// An `Err` makes the transport deliver the update again, so handlers only
/// return one for faults a later attempt can fix.
#[async_trait]
pub trait UpdateHandler: Send + Sync {
    async fn handle(&self, bot: ReplyBot, bot_id: IdentityId, update: TgUpdate)
        -> anyhow::Result<()>;
}

pub struct TeloxidePipeline {
    handler: Arc<dyn UpdateHandler>,
}

impl TeloxidePipeline {
    pub fn new(handler: Arc<dyn UpdateHandler>) -> Self {
        Self { handler }
    }
}

/// Parse the wire form into teloxide's typed update.
pub fn to_teloxide(update: &Update) -> Result<TgUpdate> {
    Ok(serde_json::from_value(update.to_value())?)
}

#[async_trait]
impl UpdatePipeline for TeloxidePipeline {
    async fn deliver(&self, identity: &Identity, update: Update) -> Result<()> {
        let update_id = update.id;
        let parsed = to_teloxide(&update)?;
        let bot = reply_bot(identity).ok_or_else(|| {
            Error::External(format!("bot {} is not backed by teloxide", identity.id()))
        })?;

        self.handler
            .handle(bot, identity.id(), parsed)
            .await
            .map_err(|e| {
                Error::External(format!(
                    "handler failed for update {update_id} on bot {}: {e:#}",
                    identity.id()
                ))
            })
    }
}
