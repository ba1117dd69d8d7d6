//! The purchase conversation. Every inbound event runs as one step while
//! holding that user's slot, so a user's steps never interleave.

pub mod actions;
pub mod messages;

use crate::config::BotConfig;
use crate::error::{BotError, BotResult, GatewayError};
use crate::flow::actions::{Action, Command, InboundEvent, Payload};
use crate::flow::messages::FailureReason;
use crate::models::bundle::{Catalog, Validity};
use crate::models::payment::{
    generate_reference, PaymentOutcome, PaymentRequest, PaymentResult, PaymentStatus,
};
use crate::models::session::{FlowState, PurchaseSession, RetryOffer, SessionSlot, Step};
use crate::phone::{self, Msisdn};
use crate::services::admin_service::AdminService;
use crate::services::notification_service::{Notifier, OutboundMessage};
use crate::services::pay_service::PaymentGateway;
use crate::services::session_service::SessionStore;
use crate::services::store_service::UserStore;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct FlowSettings {
    pub support_contact: String,
    pub support_phone: String,
    /// Idle time after which an unfinished purchase is discarded.
    pub session_timeout: Duration,
    /// How long a pushed payment may wait for its callback before we ask the gateway.
    pub payment_timeout: Duration,
    pub gateway_timeout: std::time::Duration,
    /// How long a payment that timed out stays matchable against a late callback.
    pub unresolved_ttl: Duration,
}

impl FlowSettings {
    pub fn from_config(config: &BotConfig) -> Self {
        Self {
            support_contact: config.support_contact.clone(),
            support_phone: config.support_phone.clone(),
            session_timeout: Duration::seconds(config.session_timeout().as_secs() as i64),
            payment_timeout: Duration::seconds(config.payment_timeout().as_secs() as i64),
            gateway_timeout: config.payhero.timeout(),
            unresolved_ttl: Duration::seconds(config.unresolved_ttl().as_secs() as i64),
        }
    }
}

/// Where to report a reference once it settles.
#[derive(Debug, Clone)]
struct PendingPayment {
    user_id: i64,
    chat_id: i64,
    first_name: String,
    /// Whole shillings requested from the customer.
    amount: Option<u32>,
}

/// A payment we reported as failed without knowing its outcome.
#[derive(Debug, Clone)]
struct UnresolvedPayment {
    payer: PendingPayment,
    bundle_id: String,
    phone: Msisdn,
    since: DateTime<Utc>,
}

enum Settlement {
    Paid { transaction_reference: String },
    Failed(FailureReason),
}

#[derive(Clone)]
pub struct ConversationFlow {
    catalog: Arc<Catalog>,
    users: UserStore,
    sessions: SessionStore,
    gateway: Arc<dyn PaymentGateway>,
    admin: AdminService,
    notifier: Arc<dyn Notifier>,
    /// Unsettled references. Removing an entry is what makes settlement happen once.
    pending: Arc<DashMap<String, PendingPayment>>,
    /// Timed-out references a late callback may still settle. Entries expire after `unresolved_ttl`.
    unresolved: Arc<DashMap<String, UnresolvedPayment>>,
    settings: Arc<FlowSettings>,
}

impl ConversationFlow {
    pub fn new(
        catalog: Arc<Catalog>,
        users: UserStore,
        gateway: Arc<dyn PaymentGateway>,
        admin: AdminService,
        notifier: Arc<dyn Notifier>,
        settings: FlowSettings,
    ) -> Self {
        Self {
            catalog,
            users,
            sessions: SessionStore::new(),
            gateway,
            admin,
            notifier,
            pending: Arc::new(DashMap::new()),
            unresolved: Arc::new(DashMap::new()),
            settings: Arc::new(settings),
        }
    }

    pub async fn state(&self, user_id: i64) -> FlowState {
        self.sessions.state(user_id).await
    }

    pub fn pending_payments(&self) -> usize {
        self.pending.len()
    }

    pub fn unresolved_payments(&self) -> usize {
        self.unresolved.len()
    }

    /// Runs one conversation step for `event`. Never fails: errors end up as a chat reply or a log line.
    pub async fn handle(&self, event: InboundEvent) {
        if self.users.record_interaction(&event.user).await {
            info!("New user {} ({})", event.user.id, event.user.display_name());
        }

        let mut slot = self.sessions.lock(event.user.id).await;
        let now = Utc::now();
        if !slot.is_vacant() && slot.is_stale(now, self.settings.session_timeout) {
            debug!("Session of user {} expired before this step", event.user.id);
            slot.reset();
        }
        slot.last_activity = Some(now);

        if let Err(err) = self.step(&mut slot, &event, now).await {
            self.recover(&mut slot, &event, err).await;
        }
    }

    async fn step(&self, slot: &mut SessionSlot, event: &InboundEvent, now: DateTime<Utc>) -> BotResult<()> {
        if let Some(reference) = pending_reference(slot) {
            if blocks_while_paying(&event.payload) {
                debug!("User {} sent input while payment {} is pending", event.user.id, reference);
                return self.reply(event.chat_id, messages::payment_in_progress(&reference)).await;
            }
        }

        match &event.payload {
            Payload::Command(command) => self.on_command(slot, event, command, now).await,
            Payload::Action(action) => self.on_action(slot, event, action, now).await,
            Payload::Text(text) => self.on_text(slot, event, text, now).await,
            Payload::UnknownAction(data) => {
                debug!("Unknown callback data {:?} from user {}", data, event.user.id);
                self.reply(event.chat_id, messages::session_expired()).await
            }
            Payload::Unsupported => self.reply(event.chat_id, messages::use_menu_hint()).await,
        }
    }

    async fn on_command(
        &self,
        slot: &mut SessionSlot,
        event: &InboundEvent,
        command: &Command,
        now: DateTime<Utc>,
    ) -> BotResult<()> {
        let chat = event.chat_id;
        let s = &self.settings;
        match command {
            Command::Start => {
                slot.reset();
                let welcome =
                    messages::welcome(event.user.display_name(), &s.support_contact, &s.support_phone);
                self.reply(chat, welcome).await?;
                self.show_categories(slot, chat, now).await
            }
            Command::Bundles => self.show_categories(slot, chat, now).await,
            Command::Help => {
                self.reply(chat, messages::help(s.session_timeout.num_seconds()))
                    .await
            }
            Command::About => self.reply(chat, messages::about()).await,
            Command::Support => {
                self.reply(chat, messages::support(&s.support_contact, &s.support_phone))
                    .await
            }
            Command::Restart => {
                slot.reset();
                info!("User {} restarted their session", event.user.id);
                self.reply(chat, messages::restarted()).await?;
                self.show_categories(slot, chat, now).await
            }
            Command::Cancel => self.cancel(slot, chat).await,
            Command::Admin => {
                self.require_admin(event.user.id)?;
                slot.awaiting_broadcast = false;
                self.reply(chat, messages::admin_menu()).await
            }
        }
    }

    async fn on_action(
        &self,
        slot: &mut SessionSlot,
        event: &InboundEvent,
        action: &Action,
        now: DateTime<Utc>,
    ) -> BotResult<()> {
        let chat = event.chat_id;
        match action {
            Action::Category(validity) => self.show_bundles(slot, chat, *validity, now).await,
            Action::Bundle(id) => self.select_bundle(slot, chat, id, now).await,
            Action::BackToCategories => self.show_categories(slot, chat, now).await,
            Action::Support => {
                let s = &self.settings;
                self.reply(chat, messages::support(&s.support_contact, &s.support_phone))
                    .await
            }
            Action::Cancel => self.cancel(slot, chat).await,
            Action::Confirm => match current_step(slot) {
                Some(Step::Confirm { bundle_id, phone }) => {
                    self.confirm_and_pay(slot, event, bundle_id, phone, now).await
                }
                _ => self.reply(chat, messages::session_expired()).await,
            },
            Action::ChangePhone => match current_step(slot) {
                Some(Step::Confirm { bundle_id, .. }) => {
                    advance(slot, Step::Phone { bundle_id }, now);
                    self.reply(chat, messages::change_phone_prompt()).await
                }
                _ => self.reply(chat, messages::session_expired()).await,
            },
            Action::Retry => self.retry(slot, event, now).await,
            Action::AdminBroadcast => {
                self.require_admin(event.user.id)?;
                slot.awaiting_broadcast = true;
                self.reply(chat, messages::broadcast_prompt()).await
            }
            Action::AdminStats => {
                self.require_admin(event.user.id)?;
                let stats = self.admin.stats().await;
                let message =
                    messages::admin_stats(&stats, self.sessions.open_sessions(), self.pending.len());
                self.reply(chat, message).await
            }
            Action::AdminExit => {
                self.require_admin(event.user.id)?;
                slot.awaiting_broadcast = false;
                self.reply(chat, messages::admin_closed()).await
            }
        }
    }

    async fn on_text(
        &self,
        slot: &mut SessionSlot,
        event: &InboundEvent,
        text: &str,
        now: DateTime<Utc>,
    ) -> BotResult<()> {
        let chat = event.chat_id;
        if slot.awaiting_broadcast && self.admin.is_admin(event.user.id) {
            return self.run_broadcast(slot, chat, text).await;
        }

        match current_step(slot) {
            Some(Step::Phone { bundle_id }) => {
                let phone = phone::normalize(text)?;
                let bundle = self
                    .catalog
                    .get(&bundle_id)
                    .ok_or_else(|| BotError::UnknownBundle(bundle_id.clone()))?;
                let summary = messages::summary(bundle, &phone);
                advance(slot, Step::Confirm { bundle_id, phone }, now);
                self.reply(chat, summary).await
            }
            _ => self.reply(chat, messages::use_menu_hint()).await,
        }
    }

    async fn show_categories(&self, slot: &mut SessionSlot, chat: i64, now: DateTime<Utc>) -> BotResult<()> {
        slot.retry = None;
        slot.awaiting_broadcast = false;
        slot.session = Some(PurchaseSession::new(now));
        self.reply(chat, messages::categories(&self.catalog)).await
    }

    async fn show_bundles(
        &self,
        slot: &mut SessionSlot,
        chat: i64,
        validity: Validity,
        now: DateTime<Utc>,
    ) -> BotResult<()> {
        let bundles = self.catalog.in_category(validity);
        if bundles.is_empty() {
            return Err(BotError::InvalidInput(format!("no bundles in {}", validity)));
        }
        slot.retry = None;
        slot.session
            .get_or_insert_with(|| PurchaseSession::new(now))
            .advance(Step::Bundle { category: validity }, now);
        self.reply(chat, messages::bundle_list(validity, &bundles)).await
    }

    async fn select_bundle(&self, slot: &mut SessionSlot, chat: i64, id: &str, now: DateTime<Utc>) -> BotResult<()> {
        let Some(Step::Bundle { category }) = current_step(slot) else {
            return self.reply(chat, messages::session_expired()).await;
        };
        let bundle = self
            .catalog
            .get(id)
            .ok_or_else(|| BotError::UnknownBundle(id.to_string()))?;
        if bundle.validity != category {
            return Err(BotError::InvalidInput(format!("{} is not a {} bundle", id, category)));
        }

        advance(slot, Step::Phone { bundle_id: bundle.id.clone() }, now);
        self.reply(chat, messages::phone_prompt(bundle)).await
    }

    /// Restores the confirmation summary of the last failed purchase. If an earlier
    /// push of this user is still unresolved, a double-charge warning goes first.
    async fn retry(&self, slot: &mut SessionSlot, event: &InboundEvent, now: DateTime<Utc>) -> BotResult<()> {
        let chat = event.chat_id;
        let Some(offer) = slot.retry.take() else {
            return self.reply(chat, messages::session_expired()).await;
        };
        if now - offer.offered_at > self.settings.session_timeout {
            return self.reply(chat, messages::session_expired()).await;
        }
        let bundle = self
            .catalog
            .get(&offer.bundle_id)
            .ok_or_else(|| BotError::UnknownBundle(offer.bundle_id.clone()))?;
        let summary = messages::summary(bundle, &offer.phone);

        if let Some(reference) = self.unresolved_reference_of(event.user.id) {
            info!("User {} retries while payment {} is unresolved", event.user.id, reference);
            self.reply(chat, messages::earlier_payment_unresolved(&reference)).await?;
        }

        let mut session = PurchaseSession::new(now);
        session.advance(
            Step::Confirm {
                bundle_id: offer.bundle_id,
                phone: offer.phone,
            },
            now,
        );
        slot.session = Some(session);
        self.reply(chat, summary).await
    }

    async fn cancel(&self, slot: &mut SessionSlot, chat: i64) -> BotResult<()> {
        let message = if slot.awaiting_broadcast {
            slot.awaiting_broadcast = false;
            messages::broadcast_cancelled()
        } else if slot.session.is_some() || slot.retry.is_some() {
            slot.session = None;
            slot.retry = None;
            messages::cancelled(&self.settings.support_contact, &self.settings.support_phone)
        } else {
            messages::nothing_to_cancel()
        };
        self.reply(chat, message).await
    }

    async fn run_broadcast(&self, slot: &mut SessionSlot, chat: i64, text: &str) -> BotResult<()> {
        slot.awaiting_broadcast = false;
        let recipients = self.users.count().await;
        if recipients == 0 {
            return self.reply(chat, messages::broadcast_no_users()).await;
        }

        self.reply(chat, messages::broadcast_started(recipients)).await?;
        let report = self
            .admin
            .broadcast(self.notifier.as_ref(), messages::broadcast_body(text))
            .await;
        self.reply(chat, messages::broadcast_summary(&report)).await
    }

    /// The only place a payment request is created. Reachable from the confirmation step alone.
    async fn confirm_and_pay(
        &self,
        slot: &mut SessionSlot,
        event: &InboundEvent,
        bundle_id: String,
        phone: Msisdn,
        now: DateTime<Utc>,
    ) -> BotResult<()> {
        let chat = event.chat_id;
        let bundle = self
            .catalog
            .get(&bundle_id)
            .ok_or_else(|| BotError::UnknownBundle(bundle_id.clone()))?;

        let reference = generate_reference(now);
        let request = PaymentRequest {
            amount: bundle.price,
            phone: phone.clone(),
            reference: reference.clone(),
        };
        let confirmed = messages::confirmed(bundle, &phone, &reference);

        advance(
            slot,
            Step::Paying {
                bundle_id,
                phone,
                reference: reference.clone(),
                since: now,
            },
            now,
        );
        slot.retry = None;
        let payer = PendingPayment {
            user_id: event.user.id,
            chat_id: chat,
            first_name: event.user.display_name().to_string(),
            amount: Some(bundle.price),
        };
        self.pending.insert(reference.clone(), payer.clone());

        info!(
            "Initiating payment {} of KSh {} for user {} via {}",
            reference,
            request.amount,
            event.user.id,
            self.gateway.name()
        );
        self.deliver(chat, confirmed).await;

        let result = match tokio::time::timeout(self.settings.gateway_timeout, self.gateway.initiate(&request)).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::Timeout),
        };

        match result {
            Ok(PaymentResult {
                status: PaymentStatus::Success,
                transaction_reference,
            }) => {
                let paid = Settlement::Paid { transaction_reference };
                self.settle(slot, &reference, &payer, paid, now).await;
            }
            Ok(PaymentResult {
                status: PaymentStatus::Failed,
                ..
            }) => {
                let failed = Settlement::Failed(FailureReason::Declined);
                self.settle(slot, &reference, &payer, failed, now).await;
            }
            Ok(PaymentResult {
                status: PaymentStatus::Initiated,
                ..
            }) => {
                debug!("Payment {} is waiting for the customer", reference);
                self.deliver(chat, messages::payment_processing(&reference)).await;
            }
            Err(err) => {
                warn!("Payment {} for user {} failed: {}", reference, event.user.id, err);
                let failed = Settlement::Failed(FailureReason::from(&err));
                self.settle(slot, &reference, &payer, failed, now).await;
            }
        }
        Ok(())
    }

    /// Ends the pending payment `reference`. Returns false when the slot is no longer waiting on it.
    /// A failure of unknown outcome stays matchable in `unresolved`.
    async fn settle(
        &self,
        slot: &mut SessionSlot,
        reference: &str,
        payer: &PendingPayment,
        settlement: Settlement,
        now: DateTime<Utc>,
    ) -> bool {
        let Some((bundle_id, phone)) = take_paying(slot, reference) else {
            self.pending.remove(reference);
            return false;
        };
        slot.last_activity = Some(now);
        let (chat_id, first_name) = (payer.chat_id, payer.first_name.as_str());

        let message = match settlement {
            Settlement::Paid { transaction_reference } => {
                info!(
                    "Payment {} succeeded ({}) for bundle {}",
                    reference, transaction_reference, bundle_id
                );
                slot.retry = None;
                messages::payment_success(first_name, &transaction_reference, reference)
            }
            Settlement::Failed(reason) => {
                info!("Payment {} failed: {:?}", reference, reason);
                if reason.is_uncertain() {
                    self.unresolved.insert(
                        reference.to_string(),
                        UnresolvedPayment {
                            payer: payer.clone(),
                            bundle_id: bundle_id.clone(),
                            phone: phone.clone(),
                            since: now,
                        },
                    );
                }
                slot.retry = Some(RetryOffer {
                    bundle_id,
                    phone,
                    offered_at: now,
                });
                messages::payment_failed(&reason)
            }
        };
        // Only after an uncertain failure is in `unresolved`, so a callback always finds one of them.
        self.pending.remove(reference);
        self.deliver(chat_id, message).await;
        true
    }

    /// Applies an asynchronous gateway callback. Unknown and already settled references are ignored,
    /// and so is a success whose amount differs from the one requested.
    pub async fn complete_payment(&self, outcome: PaymentOutcome) -> bool {
        let Some(pending) = self.pending.get(&outcome.reference).map(|e| e.value().clone()) else {
            return self.complete_unresolved(outcome).await;
        };
        if !amount_matches(&outcome, &pending) {
            return false;
        }

        let settlement = if outcome.success {
            Settlement::Paid {
                transaction_reference: outcome
                    .transaction_reference
                    .clone()
                    .unwrap_or_else(|| outcome.reference.clone()),
            }
        } else {
            debug!(
                "Callback for {} reports failure: {:?}",
                outcome.reference, outcome.description
            );
            Settlement::Failed(FailureReason::NotCompleted)
        };

        let mut slot = self.sessions.lock(pending.user_id).await;
        if self
            .settle(&mut slot, &outcome.reference, &pending, settlement, Utc::now())
            .await
        {
            return true;
        }
        // The confirmation step may have given up on this push while we waited for the slot.
        drop(slot);
        self.complete_unresolved(outcome).await
    }

    /// A callback for a payment the user was already told had failed.
    async fn complete_unresolved(&self, outcome: PaymentOutcome) -> bool {
        let amount_ok = match self.unresolved.get(&outcome.reference) {
            Some(entry) => amount_matches(&outcome, &entry.payer),
            None => {
                info!("Ignoring callback for unknown or settled reference {}", outcome.reference);
                return false;
            }
        };
        if !amount_ok {
            return false;
        }
        let Some((reference, late)) = self.unresolved.remove(&outcome.reference) else {
            return false;
        };

        if !outcome.success {
            info!("Unresolved payment {} turned out failed", reference);
            return true;
        }

        let transaction_reference = outcome
            .transaction_reference
            .unwrap_or_else(|| reference.clone());
        info!(
            "Unresolved payment {} succeeded late ({}) for bundle {}",
            reference, transaction_reference, late.bundle_id
        );

        let mut slot = self.sessions.lock(late.payer.user_id).await;
        slot.retry = None;
        if let Some(Step::Confirm { bundle_id, phone }) = current_step(&slot) {
            if bundle_id == late.bundle_id && phone == late.phone {
                slot.session = None;
            }
        }
        let message = messages::payment_late_success(&late.payer.first_name, &transaction_reference, &reference);
        self.deliver(late.payer.chat_id, message).await;
        true
    }

    fn unresolved_reference_of(&self, user_id: i64) -> Option<String> {
        self.unresolved
            .iter()
            .filter(|e| e.payer.user_id == user_id)
            .max_by_key(|e| e.since)
            .map(|e| e.key().clone())
    }

    /// Asks the gateway once about every payment pending longer than the payment timeout
    /// and settles it. A payment that is still pending counts as timed out.
    pub async fn expire_overdue_payments(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - self.settings.payment_timeout;
        let mut resolved = 0;

        for (user_id, reference) in self.sessions.overdue_payments(cutoff) {
            let status = match tokio::time::timeout(self.settings.gateway_timeout, self.gateway.status(&reference)).await {
                Ok(result) => result,
                Err(_) => Err(GatewayError::Timeout),
            };
            let settlement = match status {
                Ok(PaymentResult {
                    status: PaymentStatus::Success,
                    transaction_reference,
                }) => Settlement::Paid { transaction_reference },
                Ok(PaymentResult {
                    status: PaymentStatus::Failed,
                    ..
                }) => Settlement::Failed(FailureReason::NotCompleted),
                Ok(_) => Settlement::Failed(FailureReason::Timeout),
                Err(err) => {
                    warn!("Status query for {} failed: {}", reference, err);
                    Settlement::Failed(FailureReason::Timeout)
                }
            };

            let payer = match self.pending.get(&reference) {
                Some(p) => p.value().clone(),
                None => PendingPayment {
                    user_id,
                    chat_id: user_id,
                    first_name: "Valued Customer".to_string(),
                    amount: None,
                },
            };
            let mut slot = self.sessions.lock(user_id).await;
            if self.settle(&mut slot, &reference, &payer, settlement, now).await {
                resolved += 1;
            }
        }
        resolved
    }

    /// Drops abandoned sessions and expired unresolved payments. Returns the users whose
    /// sessions were discarded.
    pub fn sweep(&self, now: DateTime<Utc>) -> Vec<i64> {
        let discarded = self.sessions.sweep_idle(now, self.settings.session_timeout);
        if !discarded.is_empty() {
            info!("Discarded {} abandoned sessions", discarded.len());
        }

        let ttl = self.settings.unresolved_ttl;
        let before = self.unresolved.len();
        self.unresolved.retain(|_, p| now - p.since < ttl);
        let forgotten = before.saturating_sub(self.unresolved.len());
        if forgotten > 0 {
            info!("Forgot {} unresolved payments older than {}s", forgotten, ttl.num_seconds());
        }
        discarded
    }

    pub async fn run_maintenance(self, every: std::time::Duration, mut shutdown: broadcast::Receiver<()>) {
        info!("Session sweeper started (every {:?})", every);
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let now = Utc::now();
                    self.sweep(now);
                    let resolved = self.expire_overdue_payments(now).await;
                    if resolved > 0 {
                        info!("Resolved {} overdue payments", resolved);
                    }
                }
                _ = shutdown.recv() => {
                    info!("Session sweeper stopping");
                    break;
                }
            }
        }
    }

    fn require_admin(&self, user_id: i64) -> BotResult<()> {
        if self.admin.is_admin(user_id) {
            Ok(())
        } else {
            Err(BotError::Unauthorized)
        }
    }

    async fn reply(&self, chat_id: i64, message: OutboundMessage) -> BotResult<()> {
        self.notifier.send(chat_id, message).await?;
        Ok(())
    }

    /// Fire-and-log variant of `reply` for paths that must carry on regardless.
    async fn deliver(&self, chat_id: i64, message: OutboundMessage) {
        if let Err(e) = self.notifier.send(chat_id, message).await {
            error!("Failed to send message to chat {}: {}", chat_id, e);
        }
    }

    /// Turns a failed step into a reply. The user never sees internal detail.
    async fn recover(&self, slot: &mut SessionSlot, event: &InboundEvent, err: BotError) {
        let mut replies = Vec::new();
        match &err {
            BotError::Notify(e) => {
                error!("Failed to reply to chat {}: {}", event.chat_id, e);
                return;
            }
            BotError::InvalidPhoneFormat => {
                debug!("User {} entered an invalid phone number", event.user.id);
                replies.push(messages::invalid_phone());
            }
            BotError::UnknownBundle(id) => {
                warn!("User {} selected unknown bundle {}", event.user.id, id);
                if !matches!(current_step(slot), Some(Step::Bundle { .. })) {
                    slot.session = Some(PurchaseSession::new(Utc::now()));
                }
                replies.push(messages::bundle_unavailable());
                replies.extend(self.reprompt(slot));
            }
            BotError::InvalidInput(reason) => {
                debug!("Invalid input from user {}: {}", event.user.id, reason);
                replies.push(messages::invalid_selection());
                replies.extend(self.reprompt(slot));
            }
            BotError::Unauthorized => {
                warn!("Unauthorized admin access attempt by user {}", event.user.id);
                replies.push(messages::unauthorized());
            }
            BotError::Gateway(_) | BotError::StorageUnavailable(_) => {
                error!("Step for user {} failed: {}", event.user.id, err);
                replies.push(messages::temporary_problem());
            }
        }
        for message in replies {
            self.deliver(event.chat_id, message).await;
        }
    }

    /// The prompt for whatever the slot is currently waiting on.
    fn reprompt(&self, slot: &SessionSlot) -> Option<OutboundMessage> {
        match current_step(slot)? {
            Step::Category => Some(messages::categories(&self.catalog)),
            Step::Bundle { category } => Some(messages::bundle_list(
                category,
                &self.catalog.in_category(category),
            )),
            Step::Phone { bundle_id } => self.catalog.get(&bundle_id).map(messages::phone_prompt),
            Step::Confirm { bundle_id, phone } => self
                .catalog
                .get(&bundle_id)
                .map(|b| messages::summary(b, &phone)),
            Step::Paying { reference, .. } => Some(messages::payment_in_progress(&reference)),
        }
    }
}

/// A callback without an amount is trusted. Otherwise it must match what we asked for.
fn amount_matches(outcome: &PaymentOutcome, payer: &PendingPayment) -> bool {
    match (outcome.amount, payer.amount) {
        (Some(reported), Some(requested)) if (reported - f64::from(requested)).abs() >= 0.5 => {
            warn!(
                "Callback for {} reports KSh {} but KSh {} was requested; ignoring it",
                outcome.reference, reported, requested
            );
            false
        }
        _ => true,
    }
}

fn current_step(slot: &SessionSlot) -> Option<Step> {
    slot.session.as_ref().map(|s| s.step.clone())
}

fn advance(slot: &mut SessionSlot, step: Step, now: DateTime<Utc>) {
    slot.session
        .get_or_insert_with(|| PurchaseSession::new(now))
        .advance(step, now);
}

fn pending_reference(slot: &SessionSlot) -> Option<String> {
    match slot.session.as_ref().map(|s| &s.step) {
        Some(Step::Paying { reference, .. }) => Some(reference.clone()),
        _ => None,
    }
}

/// Clears the session if it is paying under `reference`.
fn take_paying(slot: &mut SessionSlot, reference: &str) -> Option<(String, Msisdn)> {
    if pending_reference(slot).as_deref() != Some(reference) {
        return None;
    }
    match slot.session.take()?.step {
        Step::Paying { bundle_id, phone, .. } => Some((bundle_id, phone)),
        _ => None,
    }
}

/// Input that would start or change a purchase is refused until the pending payment settles.
fn blocks_while_paying(payload: &Payload) -> bool {
    match payload {
        Payload::Command(command) => matches!(
            command,
            Command::Start | Command::Bundles | Command::Restart | Command::Cancel
        ),
        Payload::Action(action) => !matches!(
            action,
            Action::Support | Action::AdminBroadcast | Action::AdminStats | Action::AdminExit
        ),
        Payload::Text(_) | Payload::UnknownAction(_) | Payload::Unsupported => true,
    }
}
