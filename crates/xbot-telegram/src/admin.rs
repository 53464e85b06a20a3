//! Runtime minion management, driven by admin commands on the primary bot.

use std::sync::Arc;

use teloxide::{prelude::*, types::ChatId};
use tokio::sync::mpsc;

use xbot_core::{domain::Credential, orchestrator::Orchestrator};

use crate::{escape_html, ReplyBot};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MinionCommand {
    Add(String),
    Remove(String),
    List,
}

#[derive(Debug)]
pub struct AdminRequest {
    pub chat_id: ChatId,
    pub command: MinionCommand,
}

/// Apply admin requests one at a time and reply on the primary bot.
pub async fn run_admin_loop(
    orchestrator: Arc<Orchestrator>,
    bot: ReplyBot,
    mut rx: mpsc::Receiver<AdminRequest>,
) {
    while let Some(req) = rx.recv().await {
        let reply = execute(&orchestrator, req.command).await;
        if let Err(e) = bot.send_message(req.chat_id, reply).await {
            tracing::warn!(error = %e, "failed to answer admin command");
        }
    }
    tracing::debug!("admin loop stopped");
}

pub async fn execute(orchestrator: &Orchestrator, command: MinionCommand) -> String {
    match command {
        MinionCommand::Add(raw) => {
            let credential = match Credential::parse(&raw) {
                Ok(c) => c,
                Err(e) => return format!("Invalid token: {}", escape_html(&e.to_string())),
            };
            match orchestrator.add(credential).await {
                Ok(Some(profile)) => match profile.username {
                    Some(name) => format!("Minion @{} ({}) added.", escape_html(&name), profile.id),
                    None => format!("Minion {} added.", profile.id),
                },
                Ok(None) => "Token rejected by Telegram.".to_string(),
                Err(e) => {
                    tracing::warn!(error = %e, "adding minion failed");
                    format!("Failed to add minion: {}", escape_html(&e.to_string()))
                }
            }
        }
        MinionCommand::Remove(raw) => {
            let credential = match Credential::parse(&raw) {
                Ok(c) => c,
                Err(e) => return format!("Invalid token: {}", escape_html(&e.to_string())),
            };
            if orchestrator.remove(&credential).await {
                format!("Minion {} removed.", credential.id())
            } else {
                "No minion with that token.".to_string()
            }
        }
        MinionCommand::List => {
            let mut ids: Vec<_> = orchestrator
                .registry()
                .credentials()
                .await
                .iter()
                .map(Credential::id)
                .collect();
            if ids.is_empty() {
                return "No minions registered.".to_string();
            }
            ids.sort();
            let lines: Vec<String> = ids.iter().map(|id| format!("- {id}")).collect();
            format!("Minions ({}):\n{}", ids.len(), lines.join("\n"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::{any::Any, time::Duration};
    use xbot_core::{
        config::PollingSettings,
        domain::{BotProfile, Update},
        errors::Error,
        identity::Identity,
        polling::PollingTransport,
        ports::{ClientFactory, MessagingClient, UpdatePipeline},
        registry::MinionRegistry,
        Result,
    };

    /// Accepts any token whose secret part is "good".
    struct StubClient {
        credential: Credential,
    }

    #[async_trait]
    impl MessagingClient for StubClient {
        async fn who_am_i(&self) -> Result<BotProfile> {
            if !self.credential.expose().ends_with(":good") {
                return Err(Error::Unauthorized);
            }
            Ok(BotProfile {
                id: self.credential.id(),
                username: Some(format!("minion{}", self.credential.id())),
                first_name: "Minion".to_string(),
            })
        }

        async fn set_webhook(&self, _url: &str, _secret: Option<&str>) -> Result<()> {
            Ok(())
        }

        async fn delete_webhook(&self, _drop_pending_updates: bool) -> Result<()> {
            Ok(())
        }

        async fn get_updates(&self, _offset: i64, _timeout: Duration) -> Result<Vec<Update>> {
            Ok(Vec::new())
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    struct StubFactory;

    impl ClientFactory for StubFactory {
        fn client(&self, credential: &Credential) -> Arc<dyn MessagingClient> {
            Arc::new(StubClient {
                credential: credential.clone(),
            })
        }
    }

    struct NullPipeline;

    #[async_trait]
    impl UpdatePipeline for NullPipeline {
        async fn deliver(&self, _identity: &Identity, _update: Update) -> Result<()> {
            Ok(())
        }
    }

    fn orchestrator() -> Orchestrator {
        let primary = Credential::parse("1:good").unwrap();
        let factory = Arc::new(StubFactory);
        let settings = PollingSettings {
            timeout: Duration::from_millis(50),
            retry_interval: Duration::from_millis(10),
        };
        Orchestrator::from_parts(
            Arc::new(Identity::new(primary.clone(), factory.client(&primary))),
            Vec::new(),
            Arc::new(MinionRegistry::new()),
            factory,
            Arc::new(PollingTransport::new(Arc::new(NullPipeline), settings)),
        )
    }

    #[tokio::test]
    async fn add_list_and_remove() {
        let orch = orchestrator();

        let reply = execute(&orch, MinionCommand::Add("22:good".to_string())).await;
        assert_eq!(reply, "Minion @minion22 (22) added.");
        execute(&orch, MinionCommand::Add("7:good".to_string())).await;

        let reply = execute(&orch, MinionCommand::List).await;
        assert_eq!(reply, "Minions (2):\n- 7\n- 22");

        let reply = execute(&orch, MinionCommand::Remove("22:good".to_string())).await;
        assert_eq!(reply, "Minion 22 removed.");
        let reply = execute(&orch, MinionCommand::Remove("22:good".to_string())).await;
        assert_eq!(reply, "No minion with that token.");
        assert_eq!(orch.registry().credentials().await.len(), 1);
    }

    #[tokio::test]
    async fn rejected_and_malformed_tokens() {
        let orch = orchestrator();

        let reply = execute(&orch, MinionCommand::Add("3:revoked".to_string())).await;
        assert_eq!(reply, "Token rejected by Telegram.");
        let reply = execute(&orch, MinionCommand::Add("not a token".to_string())).await;
        assert!(reply.starts_with("Invalid token"));
        let reply = execute(&orch, MinionCommand::Add("1:good".to_string())).await;
        assert!(reply.starts_with("Failed to add minion"));

        assert_eq!(
            execute(&orch, MinionCommand::List).await,
            "No minions registered."
        );
    }
}
