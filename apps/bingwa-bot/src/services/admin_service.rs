use crate::services::notification_service::{Notifier, OutboundMessage};
use crate::services::store_service::UserStore;
use chrono::{Duration, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub attempted: usize,
    pub delivered: usize,
    pub failed: Vec<(i64, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stats {
    pub user_count: usize,
    pub active_last_24h: usize,
}

#[derive(Clone)]
pub struct AdminService {
    admin_ids: Arc<HashSet<i64>>,
    users: UserStore,
    batch_size: usize,
    batch_pause: std::time::Duration,
}

impl AdminService {
    pub fn new(
        admin_ids: HashSet<i64>,
        users: UserStore,
        batch_size: usize,
        batch_pause: std::time::Duration,
    ) -> Self {
        Self {
            admin_ids: Arc::new(admin_ids),
            users,
            batch_size: batch_size.max(1),
            batch_pause,
        }
    }

    pub fn is_admin(&self, tg_id: i64) -> bool {
        self.admin_ids.contains(&tg_id)
    }

    /// Sends `message` to every known user, one at a time and in batches.
    /// A failed recipient is recorded and the rest are still attempted.
    pub async fn broadcast(&self, notifier: &dyn Notifier, message: OutboundMessage) -> DeliveryReport {
        let recipients = self.users.all_user_ids().await;
        info!("Broadcasting to {} users", recipients.len());

        let mut report = DeliveryReport::default();
        for (i, batch) in recipients.chunks(self.batch_size).enumerate() {
            if i > 0 && !self.batch_pause.is_zero() {
                tokio::time::sleep(self.batch_pause).await;
            }
            for &user_id in batch {
                report.attempted += 1;
                match notifier.send(user_id, message.clone()).await {
                    Ok(()) => report.delivered += 1,
                    Err(e) => {
                        warn!("Failed to send broadcast to user {}: {}", user_id, e);
                        report.failed.push((user_id, e.to_string()));
                    }
                }
            }
        }

        info!(
            "Broadcast complete: {}/{} sent, {} failed",
            report.delivered,
            report.attempted,
            report.failed.len()
        );
        report
    }

    pub async fn stats(&self) -> Stats {
        Stats {
            user_count: self.users.count().await,
            active_last_24h: self.users.active_since(Utc::now() - Duration::hours(24)).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::user::UserProfile;
    use crate::services::notification_service::testing::RecordingNotifier;

    async fn store_with(ids: &[i64]) -> UserStore {
        let store = UserStore::in_memory();
        for &id in ids {
            store
                .record_interaction(&UserProfile { id, ..Default::default() })
                .await;
        }
        store
    }

    #[tokio::test]
    async fn one_failure_does_not_stop_the_batch() {
        let store = store_with(&[1, 2, 3, 4, 5]).await;
        let admin = AdminService::new(HashSet::from([1]), store, 2, std::time::Duration::ZERO);
        let notifier = RecordingNotifier::default();
        notifier.block(3);

        let report = admin.broadcast(&notifier, OutboundMessage::text("hello")).await;

        assert_eq!(report.attempted, 5);
        assert_eq!(report.delivered, 4);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, 3);
        assert_eq!(notifier.attempts(), 5);
    }

    #[tokio::test]
    async fn allow_list_gates_admins() {
        let admin = AdminService::new(
            HashSet::from([10, 20]),
            UserStore::in_memory(),
            25,
            std::time::Duration::ZERO,
        );
        assert!(admin.is_admin(10));
        assert!(!admin.is_admin(30));
    }

    #[tokio::test]
    async fn stats_count_users() {
        let admin = AdminService::new(
            HashSet::new(),
            store_with(&[1, 2]).await,
            25,
            std::time::Duration::ZERO,
        );
        let stats = admin.stats().await;
        assert_eq!(stats.user_count, 2);
        assert_eq!(stats.active_last_24h, 2);
    }
}
