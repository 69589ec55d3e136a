//! In-memory set of active forwards with change notification.
//!
//! The registry only holds descriptive records; listeners and sockets belong
//! to the controllers. Every mutation publishes the full list to subscribers.

use tokio::sync::watch;

use super::model::{ActiveForward, NaturalKey};
use crate::protocol::ForwardId;

pub struct ForwardRegistry {
    tx: watch::Sender<Vec<ActiveForward>>,
}

impl ForwardRegistry {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(Vec::new());
        Self { tx }
    }

    /// Receive the full active-forward list after every change
    pub fn subscribe(&self) -> watch::Receiver<Vec<ActiveForward>> {
        self.tx.subscribe()
    }

    pub fn list(&self) -> Vec<ActiveForward> {
        self.tx.borrow().clone()
    }

    pub fn len(&self) -> usize {
        self.tx.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.borrow().is_empty()
    }

    pub fn get(&self, id: &ForwardId) -> Option<ActiveForward> {
        self.tx.borrow().iter().find(|f| &f.id == id).cloned()
    }

    pub fn find_by_key(&self, key: &NaturalKey) -> Option<ActiveForward> {
        self.tx.borrow().iter().find(|f| &f.key() == key).cloned()
    }

    pub fn insert(&self, forward: ActiveForward) {
        self.tx.send_modify(|forwards| forwards.push(forward));
    }

    /// Remove a record, publishing only when something was removed
    pub fn remove(&self, id: &ForwardId) -> Option<ActiveForward> {
        let mut removed = None;
        self.tx.send_if_modified(|forwards| {
            let index = forwards.iter().position(|f| &f.id == id);
            removed = index.map(|i| forwards.remove(i));
            removed.is_some()
        });
        removed
    }
}

impl Default for ForwardRegistry {
    fn default() -> Self {
        Self::new()
    }
}
