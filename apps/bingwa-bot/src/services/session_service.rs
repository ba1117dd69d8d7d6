use crate::models::session::{FlowState, SessionSlot, Step};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

/// Per-user slots. Holding a slot's guard serializes that user's steps.
#[derive(Clone, Default)]
pub struct SessionStore {
    slots: Arc<DashMap<i64, Arc<Mutex<SessionSlot>>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits until the user's previous step has finished.
    pub async fn lock(&self, user_id: i64) -> OwnedMutexGuard<SessionSlot> {
        // Clone the Arc out so no DashMap shard lock is held across the await.
        let slot = self.slots.entry(user_id).or_default().value().clone();
        slot.lock_owned().await
    }

    pub async fn state(&self, user_id: i64) -> FlowState {
        let slot = match self.slots.get(&user_id) {
            Some(slot) => slot.value().clone(),
            None => return FlowState::Idle,
        };
        let guard = slot.lock().await;
        guard.state()
    }

    /// Drops slots idle past `ttl` and returns the user ids whose session was discarded.
    /// Busy slots are skipped until the next sweep.
    pub fn sweep_idle(&self, now: DateTime<Utc>, ttl: Duration) -> Vec<i64> {
        let mut discarded = Vec::new();
        self.slots.retain(|user_id, slot| {
            // Another task holds or awaits this slot.
            if Arc::strong_count(slot) > 1 {
                return true;
            }
            let Ok(guard) = slot.try_lock() else {
                return true;
            };
            if guard.is_stale(now, ttl) {
                if guard.session.is_some() {
                    discarded.push(*user_id);
                }
                debug!("Dropping idle session slot for user {}", user_id);
                false
            } else {
                true
            }
        });
        discarded
    }

    /// `(user_id, reference)` of payments pending since before `cutoff`.
    pub fn overdue_payments(&self, cutoff: DateTime<Utc>) -> Vec<(i64, String)> {
        self.slots
            .iter()
            .filter_map(|entry| {
                let guard = entry.value().try_lock().ok()?;
                match guard.session.as_ref().map(|s| &s.step) {
                    Some(Step::Paying { reference, since, .. }) if *since < cutoff => {
                        Some((*entry.key(), reference.clone()))
                    }
                    _ => None,
                }
            })
            .collect()
    }

    pub fn open_sessions(&self) -> usize {
        self.slots
            .iter()
            .filter(|entry| {
                entry
                    .value()
                    .try_lock()
                    .map(|g| g.session.is_some())
                    // A locked slot is mid-step, so it is in use.
                    .unwrap_or(true)
            })
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::session::PurchaseSession;
    use std::time::Duration as StdDuration;

    #[tokio::test]
    async fn same_user_steps_are_sequential() {
        let store = SessionStore::new();
        let first = store.lock(1).await;

        let contender = store.clone();
        let waiter = tokio::spawn(async move {
            let _guard = contender.lock(1).await;
        });

        tokio::time::sleep(StdDuration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        drop(first);
        tokio::time::timeout(StdDuration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn other_users_are_not_blocked() {
        let store = SessionStore::new();
        let _held = store.lock(1).await;
        tokio::time::timeout(StdDuration::from_millis(200), store.lock(2))
            .await
            .expect("user 2 was blocked by user 1");
    }

    #[tokio::test]
    async fn sweep_discards_abandoned_sessions() {
        let store = SessionStore::new();
        let now = Utc::now();
        let ttl = Duration::seconds(180);

        {
            let mut slot = store.lock(1).await;
            let then = now - Duration::minutes(10);
            slot.session = Some(PurchaseSession::new(then));
            slot.last_activity = Some(then);
        }
        {
            let mut slot = store.lock(2).await;
            slot.session = Some(PurchaseSession::new(now));
            slot.last_activity = Some(now);
        }

        assert_eq!(store.sweep_idle(now, ttl), vec![1]);
        assert_eq!(store.state(1).await, FlowState::Idle);
        assert_eq!(store.state(2).await, FlowState::CategorySelected);
        assert_eq!(store.open_sessions(), 1);
    }
}
