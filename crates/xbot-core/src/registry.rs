use std::{collections::HashMap, sync::Arc};

use tokio::sync::RwLock;

use crate::{domain::Credential, identity::Identity};

/// Credential -> live identity. Absence means "not currently served".
#[derive(Default)]
pub struct MinionRegistry {
    inner: RwLock<HashMap<Credential, Arc<Identity>>>,
}

impl MinionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, credential: &Credential) -> Option<Arc<Identity>> {
        self.inner.read().await.get(credential).cloned()
    }

    pub async fn contains(&self, credential: &Credential) -> bool {
        self.inner.read().await.contains_key(credential)
    }

    /// Insert (or overwrite) an identity, returning the previous entry.
    pub async fn insert(&self, identity: Arc<Identity>) -> Option<Arc<Identity>> {
        self.inner
            .write()
            .await
            .insert(identity.credential().clone(), identity)
    }

    pub async fn remove(&self, credential: &Credential) -> Option<Arc<Identity>> {
        self.inner.write().await.remove(credential)
    }

    pub async fn identities(&self) -> Vec<Arc<Identity>> {
        self.inner.read().await.values().cloned().collect()
    }

    pub async fn credentials(&self) -> Vec<Credential> {
        self.inner.read().await.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }
}
