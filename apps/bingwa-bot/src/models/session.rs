use crate::models::bundle::Validity;
use crate::phone::Msisdn;
use chrono::{DateTime, Duration, Utc};

/// Where a purchase currently stands. Completion is represented by dropping the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Categories are on screen.
    Category,
    /// Bundles of one category are on screen.
    Bundle { category: Validity },
    /// A bundle is chosen; waiting for a phone number.
    Phone { bundle_id: String },
    /// Summary shown; waiting for explicit confirmation.
    Confirm { bundle_id: String, phone: Msisdn },
    /// Payment request sent under `reference`; waiting for settlement.
    Paying {
        bundle_id: String,
        phone: Msisdn,
        reference: String,
        since: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PurchaseSession {
    pub step: Step,
    pub last_activity: DateTime<Utc>,
}

impl PurchaseSession {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            step: Step::Category,
            last_activity: now,
        }
    }

    pub fn advance(&mut self, step: Step, now: DateTime<Utc>) {
        self.step = step;
        self.last_activity = now;
    }
}

/// Left behind by a failed payment so the user can re-confirm without starting over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryOffer {
    pub bundle_id: String,
    pub phone: Msisdn,
    pub offered_at: DateTime<Utc>,
}

/// Everything the flow keeps for one user. Guarded by that user's mutex.
#[derive(Debug, Default)]
pub struct SessionSlot {
    pub session: Option<PurchaseSession>,
    pub retry: Option<RetryOffer>,
    pub awaiting_broadcast: bool,
    pub last_activity: Option<DateTime<Utc>>,
}

impl SessionSlot {
    pub fn state(&self) -> FlowState {
        match self.session.as_ref().map(|s| &s.step) {
            None => FlowState::Idle,
            Some(Step::Category) | Some(Step::Bundle { .. }) => FlowState::CategorySelected,
            Some(Step::Phone { .. }) => FlowState::BundleSelected,
            Some(Step::Confirm { .. }) => FlowState::PhoneCaptured,
            Some(Step::Paying { .. }) => FlowState::PaymentPending,
        }
    }

    pub fn reset(&mut self) {
        self.session = None;
        self.retry = None;
        self.awaiting_broadcast = false;
    }

    /// Nothing worth keeping: no session, no retry offer, no admin prompt.
    pub fn is_vacant(&self) -> bool {
        self.session.is_none() && self.retry.is_none() && !self.awaiting_broadcast
    }

    /// True when the slot has been idle for longer than `ttl`. Pending payments never go stale here.
    pub fn is_stale(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        if matches!(self.state(), FlowState::PaymentPending) {
            return false;
        }
        match self.last_activity {
            Some(at) => now - at > ttl,
            None => true,
        }
    }
}

/// Observable conversation state, in the vocabulary of the purchase workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    Idle,
    CategorySelected,
    BundleSelected,
    PhoneCaptured,
    PaymentPending,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_payments_are_never_stale() {
        let now = Utc::now();
        let mut slot = SessionSlot {
            last_activity: Some(now - Duration::hours(1)),
            ..Default::default()
        };
        assert!(slot.is_stale(now, Duration::seconds(180)));

        slot.session = Some(PurchaseSession {
            step: Step::Paying {
                bundle_id: "D1".into(),
                phone: crate::phone::normalize("0712345678").unwrap(),
                reference: "BINGWA-1".into(),
                since: now - Duration::hours(1),
            },
            last_activity: now - Duration::hours(1),
        });
        assert!(!slot.is_stale(now, Duration::seconds(180)));
        assert_eq!(slot.state(), FlowState::PaymentPending);
    }
}
