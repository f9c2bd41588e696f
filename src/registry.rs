use std::sync::Arc;

use slab::Slab;
use tokio::sync::RwLock;

use crate::session::SessionHandle;

/// Live connections by id. Touched on accept, on disconnect and by the
/// control service, never on the frame path.
#[derive(Clone)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<Slab<SessionHandle>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        SessionRegistry {
            sessions: Arc::new(RwLock::new(Slab::new())),
        }
    }

    pub async fn insert(&self, handle: SessionHandle) -> usize {
        self.sessions.write().await.insert(handle)
    }

    pub async fn remove(&self, id: usize) -> Option<SessionHandle> {
        self.sessions.write().await.try_remove(id)
    }

    pub async fn get(&self, id: usize) -> Option<SessionHandle> {
        self.sessions.read().await.get(id).cloned()
    }

    pub async fn snapshot(&self) -> Vec<(usize, SessionHandle)> {
        self.sessions
            .read()
            .await
            .iter()
            .map(|(id, handle)| (id, handle.clone()))
            .collect()
    }
}
