//! Fakes shared by the unit tests.

use std::{
    any::Any,
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use serde_json::json;

use crate::{
    config::PollingSettings,
    domain::{BotProfile, Credential, IdentityId, Update},
    errors::Error,
    identity::Identity,
    ports::{ClientFactory, MessagingClient, UpdatePipeline},
    Result,
};

pub const TEST_POLLING: PollingSettings = PollingSettings {
    timeout: Duration::from_millis(50),
    retry_interval: Duration::from_millis(10),
};

pub fn credential(raw: &str) -> Credential {
    Credential::parse(raw).unwrap()
}

pub fn update(id: i64) -> Update {
    let value = json!({ "update_id": id, "message": { "text": format!("#{id}") } });
    serde_json::from_value(value).unwrap()
}

/// Poll `cond` until it holds; panics after a few seconds.
pub async fn wait_until(cond: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Call {
    WhoAmI,
    SetWebhook { url: String, secret: Option<String> },
    DeleteWebhook { drop_pending: bool },
    GetUpdates { offset: i64 },
}

#[derive(Default)]
struct ServerState {
    batches: VecDeque<Vec<i64>>,
    released: Vec<i64>,
}

/// Behaves like the Bot API for one token: released updates stay pending
/// until a fetch with a higher offset confirms them.
#[derive(Default)]
pub struct FakeClient {
    bot_id: AtomicU64,
    unauthorized: bool,
    fail_fetch: bool,
    pub fail_who_am_i: AtomicBool,
    pub fail_delete_webhook: AtomicBool,
    pub fail_set_webhook: AtomicBool,
    pub fetch_dropped: Arc<AtomicBool>,
    calls: Mutex<Vec<Call>>,
    state: Mutex<ServerState>,
}

impl FakeClient {
    pub fn with_batches(batches: Vec<Vec<i64>>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ServerState {
                batches: batches.into(),
                released: Vec::new(),
            }),
            ..Default::default()
        })
    }

    pub fn always_failing() -> Arc<Self> {
        Arc::new(Self {
            fail_fetch: true,
            ..Default::default()
        })
    }

    pub fn unauthorized() -> Arc<Self> {
        Arc::new(Self {
            unauthorized: true,
            ..Default::default()
        })
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn fetch_offsets(&self) -> Vec<i64> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::GetUpdates { offset } => Some(offset),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    fn check_auth(&self) -> Result<()> {
        if self.unauthorized {
            Err(Error::Unauthorized)
        } else {
            Ok(())
        }
    }
}

struct DropFlag(Arc<AtomicBool>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl MessagingClient for FakeClient {
    async fn who_am_i(&self) -> Result<BotProfile> {
        self.record(Call::WhoAmI);
        self.check_auth()?;
        if self.fail_who_am_i.load(Ordering::SeqCst) {
            return Err(Error::Transport("get_me timed out".to_string()));
        }
        let id = IdentityId(self.bot_id.load(Ordering::SeqCst));
        Ok(BotProfile {
            id,
            username: Some(format!("bot{id}")),
            first_name: "Bot".to_string(),
        })
    }

    async fn set_webhook(&self, url: &str, secret: Option<&str>) -> Result<()> {
        self.record(Call::SetWebhook {
            url: url.to_string(),
            secret: secret.map(str::to_string),
        });
        self.check_auth()?;
        if self.fail_set_webhook.load(Ordering::SeqCst) {
            return Err(Error::Transport("set_webhook unreachable".to_string()));
        }
        Ok(())
    }

    async fn delete_webhook(&self, drop_pending_updates: bool) -> Result<()> {
        self.record(Call::DeleteWebhook {
            drop_pending: drop_pending_updates,
        });
        self.check_auth()?;
        if self.fail_delete_webhook.load(Ordering::SeqCst) {
            return Err(Error::Transport("delete_webhook unreachable".to_string()));
        }
        Ok(())
    }

    async fn get_updates(&self, offset: i64, _timeout: Duration) -> Result<Vec<Update>> {
        self.record(Call::GetUpdates { offset });
        self.check_auth()?;
        if self.fail_fetch {
            return Err(Error::Transport("network down".to_string()));
        }

        let ready = {
            let mut st = self.state.lock().unwrap();
            st.released.retain(|id| *id >= offset);
            if st.released.is_empty() {
                if let Some(batch) = st.batches.pop_front() {
                    st.released = batch;
                }
            }
            st.released.clone()
        };
        if !ready.is_empty() {
            return Ok(ready.into_iter().map(update).collect());
        }

        // Nothing left: hang like a long poll until the caller drops us.
        let _flag = DropFlag(self.fetch_dropped.clone());
        Ok(std::future::pending::<Vec<Update>>().await)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Hands out pre-registered fakes; unknown credentials get an unauthorized client.
#[derive(Default)]
pub struct FakeFactory {
    clients: Mutex<HashMap<String, Arc<FakeClient>>>,
}

impl FakeFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert(&self, raw: &str, client: Arc<FakeClient>) -> Arc<FakeClient> {
        let id = credential(raw).id();
        client.bot_id.store(id.0, Ordering::SeqCst);
        self.clients
            .lock()
            .unwrap()
            .insert(raw.to_string(), client.clone());
        client
    }

    pub fn get(&self, raw: &str) -> Option<Arc<FakeClient>> {
        self.clients.lock().unwrap().get(raw).cloned()
    }
}

impl ClientFactory for FakeFactory {
    fn client(&self, credential: &Credential) -> Arc<dyn MessagingClient> {
        let mut clients = self.clients.lock().unwrap();
        clients
            .entry(credential.expose().to_string())
            .or_insert_with(FakeClient::unauthorized)
            .clone()
    }
}

#[derive(Default)]
pub struct RecordingPipeline {
    attempts: Mutex<Vec<i64>>,
    delivered: Mutex<Vec<(IdentityId, i64)>>,
    fail_once_on: Mutex<Option<i64>>,
    panic_on: Option<i64>,
}

impl RecordingPipeline {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing_once_on(id: i64) -> Arc<Self> {
        Arc::new(Self {
            fail_once_on: Mutex::new(Some(id)),
            ..Default::default()
        })
    }

    pub fn panicking_on(id: i64) -> Arc<Self> {
        Arc::new(Self {
            panic_on: Some(id),
            ..Default::default()
        })
    }

    pub fn attempts(&self) -> Vec<i64> {
        self.attempts.lock().unwrap().clone()
    }

    pub fn ids(&self) -> Vec<i64> {
        self.delivered.lock().unwrap().iter().map(|(_, u)| *u).collect()
    }

    pub fn delivered(&self) -> Vec<(IdentityId, i64)> {
        self.delivered.lock().unwrap().clone()
    }
}

#[async_trait]
impl UpdatePipeline for RecordingPipeline {
    async fn deliver(&self, identity: &Identity, update: Update) -> Result<()> {
        self.attempts.lock().unwrap().push(update.id);
        if self.panic_on == Some(update.id) {
            panic!("handler panicked on update {}", update.id);
        }
        {
            let mut fail = self.fail_once_on.lock().unwrap();
            if *fail == Some(update.id) {
                *fail = None;
                return Err(Error::External("handler blew up".to_string()));
            }
        }
        self.delivered
            .lock()
            .unwrap()
            .push((identity.id(), update.id));
        Ok(())
    }
}

/// Records start/end of each delivery; deliveries of `hold` block until released.
pub struct GatedPipeline {
    hold: i64,
    gate: tokio::sync::Semaphore,
    events: Mutex<Vec<String>>,
}

impl GatedPipeline {
    pub fn holding(hold: i64) -> Arc<Self> {
        Arc::new(Self {
            hold,
            gate: tokio::sync::Semaphore::new(0),
            events: Mutex::new(Vec::new()),
        })
    }

    pub fn release(&self) {
        self.gate.add_permits(1);
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl UpdatePipeline for GatedPipeline {
    async fn deliver(&self, identity: &Identity, update: Update) -> Result<()> {
        let tag = format!("{}/{}", identity.id(), update.id);
        self.events.lock().unwrap().push(format!("start {tag}"));
        if update.id == self.hold {
            let permit = self
                .gate
                .acquire()
                .await
                .map_err(|e| Error::External(e.to_string()))?;
            permit.forget();
        }
        self.events.lock().unwrap().push(format!("end {tag}"));
        Ok(())
    }
}
