//! Pull-mode transport: one long-polling loop per identity.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use tokio::{sync::Mutex, task::JoinHandle, time::sleep};
use tokio_util::sync::CancellationToken;

use crate::{
    config::{PollingSettings, TransportMode},
    domain::{Credential, IdentityId, Update},
    errors::Error,
    identity::Identity,
    ports::UpdatePipeline,
    transport::Transport,
    Result,
};

/// Fetch updates for one identity until `cancel` fires.
///
/// The offset only moves past an update once the pipeline accepted it, so a
/// failed fetch or delivery re-fetches from the same point.
pub async fn run_polling_loop(
    identity: Arc<Identity>,
    pipeline: Arc<dyn UpdatePipeline>,
    settings: PollingSettings,
    cancel: CancellationToken,
) {
    let bot_id = identity.id();

    // Push and pull must never be active together for one identity.
    loop {
        let res = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::debug!(%bot_id, "polling cancelled before start");
                return;
            }
            res = identity.client().delete_webhook(true) => res,
        };
        match res {
            Ok(()) => break,
            Err(e) => {
                tracing::warn!(%bot_id, error = %e, "webhook teardown failed, retrying");
                if !backoff(&cancel, &settings).await {
                    return;
                }
            }
        }
    }

    tracing::info!(%bot_id, offset = identity.offset(), "polling started");

    loop {
        let fetched = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            res = identity.client().get_updates(identity.offset(), settings.timeout) => res,
        };

        let updates = match fetched {
            Ok(updates) => updates,
            Err(e) => {
                tracing::warn!(%bot_id, error = %e, "fetching updates failed");
                if !backoff(&cancel, &settings).await {
                    break;
                }
                continue;
            }
        };

        let mut failed = false;
        for update in updates {
            if cancel.is_cancelled() {
                break;
            }
            let update_id = update.id;
            if update_id < identity.offset() {
                continue;
            }
            match deliver_guarded(&identity, &pipeline, update).await {
                Delivery::Accepted => {}
                Delivery::Rejected(e) => {
                    tracing::warn!(%bot_id, update_id, error = %e, "pipeline rejected update");
                    failed = true;
                    break;
                }
                // A panicking handler would panic again on redelivery.
                Delivery::Panicked => {
                    tracing::error!(%bot_id, update_id, "pipeline panicked; update dropped");
                }
            }
            identity.set_offset(update_id + 1);
        }

        if failed && !backoff(&cancel, &settings).await {
            break;
        }
    }

    tracing::debug!(%bot_id, offset = identity.offset(), "polling stopped");
}

pub(crate) enum Delivery {
    Accepted,
    Rejected(Error),
    Panicked,
}

/// Run the pipeline on its own task so a panicking handler cannot take the
/// caller down with it.
pub(crate) async fn deliver_guarded(
    identity: &Arc<Identity>,
    pipeline: &Arc<dyn UpdatePipeline>,
    update: Update,
) -> Delivery {
    let identity = identity.clone();
    let pipeline = pipeline.clone();
    let task = tokio::spawn(async move { pipeline.deliver(&identity, update).await });
    match task.await {
        Ok(Ok(())) => Delivery::Accepted,
        Ok(Err(e)) => Delivery::Rejected(e),
        Err(e) if e.is_panic() => Delivery::Panicked,
        Err(e) => Delivery::Rejected(Error::External(format!("delivery task failed: {e}"))),
    }
}

/// Sleep the retry interval. Returns false if cancelled meanwhile.
async fn backoff(cancel: &CancellationToken, settings: &PollingSettings) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = sleep(settings.retry_interval) => true,
    }
}

struct PollerHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl PollerHandle {
    /// Cancel and wait until the loop has observably stopped.
    async fn stop(self, bot_id: IdentityId) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            tracing::warn!(%bot_id, error = %e, "polling task ended abnormally");
        }
    }
}

#[derive(Default)]
struct PollerTable {
    running: bool,
    handles: HashMap<Credential, PollerHandle>,
}

/// Owns every polling loop and the "running" flag.
pub struct PollingTransport {
    pipeline: Arc<dyn UpdatePipeline>,
    settings: PollingSettings,
    shutdown: CancellationToken,
    table: Mutex<PollerTable>,
}

impl PollingTransport {
    pub fn new(pipeline: Arc<dyn UpdatePipeline>, settings: PollingSettings) -> Self {
        Self {
            pipeline,
            settings,
            shutdown: CancellationToken::new(),
            table: Mutex::new(PollerTable::default()),
        }
    }

    pub async fn is_running(&self) -> bool {
        self.table.lock().await.running
    }

    /// Credentials with a loop that has not finished yet, sorted.
    pub async fn active_identities(&self) -> Vec<Credential> {
        let table = self.table.lock().await;
        let mut active: Vec<Credential> = table
            .handles
            .iter()
            .filter(|(_, h)| !h.task.is_finished())
            .map(|(c, _)| c.clone())
            .collect();
        active.sort_by(|a, b| a.expose().cmp(b.expose()));
        active
    }

    /// Replace any loop for this identity with a fresh one. Caller holds the table lock.
    async fn spawn_locked(&self, table: &mut PollerTable, identity: Arc<Identity>) {
        let credential = identity.credential().clone();
        if let Some(previous) = table.handles.remove(&credential) {
            previous.stop(credential.id()).await;
        }

        let cancel = self.shutdown.child_token();
        let task = tokio::spawn(run_polling_loop(
            identity,
            self.pipeline.clone(),
            self.settings,
            cancel.clone(),
        ));
        table.handles.insert(credential, PollerHandle { cancel, task });
    }
}

#[async_trait]
impl Transport for PollingTransport {
    fn mode(&self) -> TransportMode {
        TransportMode::Polling
    }

    async fn prepare_primary(&self, primary: &Arc<Identity>) -> Result<()> {
        primary.client().delete_webhook(true).await
    }

    async fn register_identity(&self, identity: &Arc<Identity>) -> Result<()> {
        let mut table = self.table.lock().await;
        if table.running {
            self.spawn_locked(&mut table, identity.clone()).await;
        }
        Ok(())
    }

    async fn remove_identity(&self, identity: &Identity) {
        let bot_id = identity.id();
        let handle = self.table.lock().await.handles.remove(identity.credential());
        if let Some(handle) = handle {
            handle.stop(bot_id).await;
            tracing::info!(%bot_id, "polling loop stopped");
        }
    }

    async fn bring_up(&self, primary: &Arc<Identity>, minions: Vec<Arc<Identity>>) -> Result<()> {
        let mut table = self.table.lock().await;
        table.running = true;
        self.spawn_locked(&mut table, primary.clone()).await;
        for identity in minions {
            self.spawn_locked(&mut table, identity).await;
        }
        tracing::info!(loops = table.handles.len(), "long polling running");
        Ok(())
    }

    async fn closed(&self) -> Result<()> {
        self.shutdown.cancelled().await;

        let handles: Vec<(Credential, PollerHandle)> = {
            let mut table = self.table.lock().await;
            table.running = false;
            table.handles.drain().collect()
        };
        for (credential, handle) in handles {
            handle.stop(credential.id()).await;
        }
        tracing::info!("all polling loops stopped");
        Ok(())
    }

    fn shutdown(&self) {
        self.shutdown.cancel();
    }
}
