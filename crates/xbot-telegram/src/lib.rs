//! Telegram adapter (teloxide).
//!
//! Implements the `xbot-core` client ports over the Telegram Bot API and
//! provides the update pipeline the identities feed into.

use std::{any::Any, sync::Arc, time::Duration};

use async_trait::async_trait;
use teloxide::{adaptors::DefaultParseMode, prelude::*, types::ParseMode, ApiError, RequestError};
use tokio::time::sleep;

pub mod admin;
pub mod commands;
pub mod pipeline;

use xbot_core::{
    domain::{BotProfile, Credential, IdentityId, Update},
    errors::Error,
    identity::Identity,
    ports::{ClientFactory, MessagingClient},
    Result,
};

/// The bot handle handlers reply with. Replies are HTML unless a request says otherwise.
pub type ReplyBot = DefaultParseMode<Bot>;

/// Headroom on top of the long-poll wait before a request counts as hung.
const REQUEST_TIMEOUT_MARGIN: Duration = Duration::from_secs(10);

/// HTTP client shared by every bot. Its request timeout must exceed the
/// long-poll wait or idle fetches would be cut off.
pub fn http_client(poll_timeout: Duration) -> Result<reqwest::Client> {
    teloxide::net::default_reqwest_settings()
        .timeout(poll_timeout + REQUEST_TIMEOUT_MARGIN)
        .build()
        .map_err(|e| Error::Config(format!("failed to build http client: {e}")))
}

/// One per credential; the same handle serves the lifecycle calls and the
/// handlers' replies.
#[derive(Clone)]
pub struct TelegramClient {
    bot: ReplyBot,
}

impl TelegramClient {
    pub fn new(bot: ReplyBot) -> Self {
        Self { bot }
    }

    pub fn bot(&self) -> ReplyBot {
        self.bot.clone()
    }

    async fn with_retry<T, Fut>(&self, mut op: impl FnMut() -> Fut) -> Result<T>
    where
        Fut: std::future::IntoFuture<Output = std::result::Result<T, RequestError>>,
        Fut::IntoFuture: Send,
    {
        const MAX_RETRIES: usize = 1;
        let mut attempts = 0usize;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(RequestError::RetryAfter(d)) if attempts < MAX_RETRIES => {
                    attempts += 1;
                    tracing::debug!(wait = ?d, "telegram asked to retry later");
                    sleep(d).await;
                }
                Err(other) => return Err(map_err(other)),
            }
        }
    }
}

/// Escape text for HTML-mode messages.
pub fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Telegram answers 401 for revoked tokens and 404 for tokens it never issued.
pub fn map_err(e: RequestError) -> Error {
    match e {
        RequestError::Api(ApiError::NotFound) => Error::Unauthorized,
        RequestError::Api(ApiError::Unknown(ref description)) if description == "Not Found" => {
            Error::Unauthorized
        }
        other => Error::Transport(format!("telegram error: {other}")),
    }
}

#[async_trait]
impl MessagingClient for TelegramClient {
    async fn who_am_i(&self) -> Result<BotProfile> {
        let me = self.with_retry(|| self.bot.get_me()).await?;
        Ok(BotProfile {
            id: IdentityId(me.user.id.0),
            username: me.user.username.clone(),
            first_name: me.user.first_name.clone(),
        })
    }

    async fn set_webhook(&self, url: &str, secret: Option<&str>) -> Result<()> {
        let url = reqwest::Url::parse(url)
            .map_err(|e| Error::Config(format!("invalid webhook url: {e}")))?;
        self.with_retry(|| {
            let mut req = self.bot.set_webhook(url.clone());
            if let Some(s) = secret {
                req = req.secret_token(s.to_string());
            }
            req
        })
        .await?;
        Ok(())
    }

    async fn delete_webhook(&self, drop_pending_updates: bool) -> Result<()> {
        self.with_retry(|| {
            self.bot
                .delete_webhook()
                .drop_pending_updates(drop_pending_updates)
        })
        .await?;
        Ok(())
    }

    async fn get_updates(&self, offset: i64, timeout: Duration) -> Result<Vec<Update>> {
        let offset = i32::try_from(offset)
            .map_err(|_| Error::Transport(format!("update offset {offset} out of range")))?;
        let timeout = u32::try_from(timeout.as_secs()).unwrap_or(u32::MAX);

        let updates = self
            .bot
            .get_updates()
            .offset(offset)
            .timeout(timeout)
            .await
            .map_err(map_err)?;

        updates
            .iter()
            .map(|u| -> Result<Update> { Ok(serde_json::from_value(serde_json::to_value(u)?)?) })
            .collect()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// The reply handle of an identity whose client was built by [`TelegramClientFactory`].
pub fn reply_bot(identity: &Identity) -> Option<ReplyBot> {
    identity
        .client()
        .as_any()
        .downcast_ref::<TelegramClient>()
        .map(TelegramClient::bot)
}

/// Builds one teloxide `Bot` per credential over a shared connection pool.
#[derive(Clone)]
pub struct TelegramClientFactory {
    http: reqwest::Client,
}

impl TelegramClientFactory {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }

    pub fn bot(&self, credential: &Credential) -> ReplyBot {
        Bot::with_client(credential.expose(), self.http.clone()).parse_mode(ParseMode::Html)
    }
}

impl ClientFactory for TelegramClientFactory {
    fn client(&self, credential: &Credential) -> Arc<dyn MessagingClient> {
        Arc::new(TelegramClient::new(self.bot(credential)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejected_tokens_map_to_unauthorized() {
        assert!(map_err(RequestError::Api(ApiError::NotFound)).is_unauthorized());
        assert!(
            map_err(RequestError::Api(ApiError::Unknown("Not Found".to_string())))
                .is_unauthorized()
        );
    }

    #[test]
    fn other_failures_are_transport_errors() {
        let err = map_err(RequestError::Api(ApiError::BotBlocked));
        assert!(matches!(err, Error::Transport(_)));
        let err = map_err(RequestError::RetryAfter(Duration::from_secs(3)));
        assert!(matches!(err, Error::Transport(_)));
    }

    #[test]
    fn escapes_html_markup() {
        assert_eq!(escape_html("a <b> & c"), "a &lt;b&gt; &amp; c");
    }

    #[test]
    fn http_timeout_covers_long_poll() {
        assert!(http_client(Duration::from_secs(30)).is_ok());
    }
}
