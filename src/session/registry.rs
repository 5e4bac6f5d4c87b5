//! Subscription Registry
//!
//! Holds the logical subscriptions independently of any live socket. It is
//! never cleared on disconnect; the supervisor replays it after every
//! reconnect.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use uuid::Uuid;

use super::types::{Payload, TargetKey};

/// Opaque subscription identifier
pub type SubscriptionId = String;

/// Subscriber callback, invoked on the session task
pub type Callback = Arc<dyn Fn(&Payload) + Send + Sync>;

/// A registered subscription
#[derive(Clone)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub target: TargetKey,
    pub callback: Callback,
    pub created_at: DateTime<Utc>,
    seq: u64,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("target", &self.target)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
struct Inner {
    /// SubscriptionId → Subscription
    by_id: HashMap<SubscriptionId, Subscription>,
    /// TargetKey → SubscriptionId (at most one per target)
    by_target: HashMap<TargetKey, SubscriptionId>,
    next_seq: u64,
}

/// Current set of subscriptions, keyed by id and by target
#[derive(Default)]
pub struct SubscriptionRegistry {
    inner: RwLock<Inner>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callback` for `target`, replacing any callback already there
    ///
    /// A replacement gets a fresh id and keeps the replaced entry's position
    /// in [`all`](Self::all); the old id becomes unknown.
    pub fn add(&self, target: TargetKey, callback: Callback) -> SubscriptionId {
        let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let inner = &mut *guard;

        let id = Uuid::new_v4().to_string();
        let replaced = inner
            .by_target
            .remove(&target)
            .and_then(|old_id| inner.by_id.remove(&old_id));

        let seq = match &replaced {
            Some(old) => {
                tracing::debug!(
                    key = %target,
                    old_id = %old.id,
                    new_id = %id,
                    "Replacing subscription"
                );
                old.seq
            }
            None => {
                let seq = inner.next_seq;
                inner.next_seq += 1;
                seq
            }
        };

        inner.by_target.insert(target.clone(), id.clone());
        inner.by_id.insert(
            id.clone(),
            Subscription {
                id: id.clone(),
                target,
                callback,
                created_at: Utc::now(),
                seq,
            },
        );

        id
    }

    /// Remove a subscription; `None` if it was already gone
    pub fn remove(&self, id: &str) -> Option<Subscription> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let removed = inner.by_id.remove(id)?;
        inner.by_target.remove(&removed.target);
        Some(removed)
    }

    /// Snapshot of all subscriptions in insertion order
    pub fn all(&self) -> Vec<Subscription> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let mut subscriptions: Vec<Subscription> = inner.by_id.values().cloned().collect();
        subscriptions.sort_by_key(|s| s.seq);
        subscriptions
    }

    /// Callback registered for `target`, if any
    pub fn dispatch_target(&self, target: &TargetKey) -> Option<Callback> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner
            .by_target
            .get(target)
            .and_then(|id| inner.by_id.get(id))
            .map(|s| Arc::clone(&s.callback))
    }

    pub fn contains_target(&self, target: &TargetKey) -> bool {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .by_target
            .contains_key(target)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .by_id
            .contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .by_id
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
