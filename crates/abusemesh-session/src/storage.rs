//! Session storage: a map from remote [`NodeId`] to a session, guarded by a
//! single read-write lock — adds and removes are exclusive, lookups are
//! shared. [`ClientSessionStorage`] (serving side) and
//! [`ServerSessionStorage`] (consuming side) are both instances of the same
//! generic shape; they differ only in which half of a peer relation they
//! index.

use std::collections::HashMap;
use std::sync::Arc;

use abusemesh_core::NodeId;
use tokio::sync::RwLock;

use snafu::OptionExt as _;

use crate::error::{DuplicateSnafu, NotFoundSnafu, SessionResult};

/// A map from remote `NodeId` to a session handle, shared-lookup /
/// exclusive-mutation.
pub struct SessionStorage<S> {
    sessions: RwLock<HashMap<NodeId, Arc<S>>>,
}

impl<S> Default for SessionStorage<S> {
    fn default() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }
}

impl<S> SessionStorage<S> {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, peer: NodeId) -> Option<Arc<S>> {
        self.sessions.read().await.get(&peer).cloned()
    }

    pub async fn add(&self, peer: NodeId, session: Arc<S>) -> SessionResult<()> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&peer) {
            return DuplicateSnafu.fail();
        }
        sessions.insert(peer, session);
        Ok(())
    }

    pub async fn remove(&self, peer: NodeId) -> SessionResult<Arc<S>> {
        self.sessions
            .write()
            .await
            .remove(&peer)
            .context(NotFoundSnafu)
    }

    /// Fetches the session for `peer`, inserting `make()`'s result under the
    /// lock if none exists yet.
    pub async fn get_or_insert_with(&self, peer: NodeId, make: impl FnOnce() -> S) -> Arc<S> {
        if let Some(existing) = self.get(peer).await {
            return existing;
        }
        let mut sessions = self.sessions.write().await;
        sessions
            .entry(peer)
            .or_insert_with(|| Arc::new(make()))
            .clone()
    }

    pub async fn all(&self) -> Vec<(NodeId, Arc<S>)> {
        self.sessions
            .read()
            .await
            .iter()
            .map(|(id, s)| (*id, s.clone()))
            .collect()
    }
}
