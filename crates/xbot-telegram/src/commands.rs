use async_trait::async_trait;
use teloxide::{
    prelude::*,
    types::{ChatId, Message, Update as TgUpdate, UpdateKind, UserId},
    RequestError,
};
use tokio::sync::mpsc;

use xbot_core::domain::IdentityId;

use crate::{
    admin::{AdminRequest, MinionCommand},
    pipeline::UpdateHandler,
    ReplyBot,
};

const ADD_USAGE: &str = "Usage: /addminion &lt;token&gt;";
const REMOVE_USAGE: &str = "Usage: /removeminion &lt;token&gt;";

fn parse_command(text: &str) -> (String, String) {
    // Telegram may send `/cmd@botname arg1 ...`
    let mut parts = text.trim().splitn(2, char::is_whitespace);
    let first = parts.next().unwrap_or("").trim();
    let rest = parts.next().unwrap_or("").trim().to_string();

    let cmd = first
        .trim_start_matches('/')
        .split('@')
        .next()
        .unwrap_or("")
        .to_lowercase();

    (cmd, rest)
}

fn is_admin(user_id: Option<UserId>, admins: &[i64]) -> bool {
    let Some(user_id) = user_id else {
        return false;
    };
    i64::try_from(user_id.0).is_ok_and(|id| admins.contains(&id))
}

/// Map an admin command to a request. `None` if it is not an admin command.
fn admin_command(cmd: &str, args: &str) -> Option<Result<MinionCommand, &'static str>> {
    let token = args.split_whitespace().next().map(str::to_string);
    match cmd {
        "addminion" => Some(token.map(MinionCommand::Add).ok_or(ADD_USAGE)),
        "removeminion" => Some(token.map(MinionCommand::Remove).ok_or(REMOVE_USAGE)),
        "minions" => Some(Ok(MinionCommand::List)),
        _ => None,
    }
}

/// Faults that may clear up on their own. Everything else (blocked by the
/// user, chat gone, bad request) would fail the same way on every retry.
fn is_transient(e: &RequestError) -> bool {
    matches!(
        e,
        RequestError::Network(_) | RequestError::RetryAfter(_) | RequestError::Io(_)
    )
}

async fn reply(bot: &ReplyBot, chat_id: ChatId, text: impl Into<String>) -> anyhow::Result<()> {
    match bot.send_message(chat_id, text).await {
        Ok(_) => Ok(()),
        Err(e) if is_transient(&e) => Err(e.into()),
        Err(e) => {
            tracing::warn!(chat_id = chat_id.0, error = %e, "reply dropped");
            Ok(())
        }
    }
}

/// Commands understood by every identity, plus the admin commands the
/// primary identity forwards to the admin loop.
pub struct CommandHandler {
    primary: IdentityId,
    admins: Vec<i64>,
    admin_tx: mpsc::Sender<AdminRequest>,
}

impl CommandHandler {
    pub fn new(primary: IdentityId, admins: Vec<i64>, admin_tx: mpsc::Sender<AdminRequest>) -> Self {
        Self {
            primary,
            admins,
            admin_tx,
        }
    }

    async fn handle_admin(
        &self,
        bot: &ReplyBot,
        msg: &Message,
        command: Result<MinionCommand, &'static str>,
    ) -> anyhow::Result<()> {
        if !is_admin(msg.from().map(|u| u.id), &self.admins) {
            return reply(bot, msg.chat.id, "Unauthorized.").await;
        }
        let command = match command {
            Ok(c) => c,
            Err(usage) => return reply(bot, msg.chat.id, usage).await,
        };

        // The token should not linger in the chat history.
        if matches!(command, MinionCommand::Add(_) | MinionCommand::Remove(_)) {
            if let Err(e) = bot.delete_message(msg.chat.id, msg.id).await {
                tracing::debug!(error = %e, "could not delete message containing a token");
            }
        }

        let request = AdminRequest {
            chat_id: msg.chat.id,
            command,
        };
        if self.admin_tx.send(request).await.is_err() {
            tracing::warn!("admin loop is gone; dropping admin command");
        }
        Ok(())
    }
}

#[async_trait]
impl UpdateHandler for CommandHandler {
    async fn handle(
        &self,
        bot: ReplyBot,
        bot_id: IdentityId,
        update: TgUpdate,
    ) -> anyhow::Result<()> {
        let UpdateKind::Message(msg) = update.kind else {
            return Ok(());
        };
        let Some(text) = msg.text().filter(|t| t.starts_with('/')) else {
            return Ok(());
        };
        let (cmd, args) = parse_command(text);

        if cmd == "ping" {
            return reply(&bot, msg.chat.id, "pong").await;
        }

        if bot_id == self.primary {
            if let Some(command) = admin_command(&cmd, &args) {
                return self.handle_admin(&bot, &msg, command).await;
            }
        }

        tracing::debug!(%bot_id, command = %cmd, "ignoring unknown command");
        Ok(())
    }
}
