use std::{
    fmt,
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc,
    },
};

use crate::{
    domain::{Credential, IdentityId},
    ports::MessagingClient,
};

/// A credential plus its client handle.
///
/// The fetch offset is only meaningful in pull mode; it is the next update id
/// the polling loop will ask for.
pub struct Identity {
    credential: Credential,
    client: Arc<dyn MessagingClient>,
    offset: AtomicI64,
}

impl Identity {
    pub fn new(credential: Credential, client: Arc<dyn MessagingClient>) -> Self {
        Self {
            credential,
            client,
            offset: AtomicI64::new(0),
        }
    }

    pub fn credential(&self) -> &Credential {
        &self.credential
    }

    pub fn id(&self) -> IdentityId {
        self.credential.id()
    }

    pub fn client(&self) -> &Arc<dyn MessagingClient> {
        &self.client
    }

    pub fn offset(&self) -> i64 {
        self.offset.load(Ordering::SeqCst)
    }

    pub(crate) fn set_offset(&self, offset: i64) {
        self.offset.store(offset, Ordering::SeqCst);
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("credential", &self.credential)
            .field("offset", &self.offset())
            .finish()
    }
}
