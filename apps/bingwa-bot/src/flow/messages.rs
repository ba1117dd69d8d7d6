use crate::config::{APP_NAME, APP_VERSION};
use crate::error::GatewayError;
use crate::flow::actions::Action;
use crate::models::bundle::{Bundle, Catalog, Validity};
use crate::phone::Msisdn;
use crate::services::admin_service::{DeliveryReport, Stats};
use crate::services::notification_service::{escape_html, Button, OutboundMessage};

const PHONE_FORMATS: &str = "Accepted formats: 07XXXXXXXX, 01XXXXXXXX, +254XXXXXXXXX, 254XXXXXXXXX";

fn button(label: &str, action: Action) -> Vec<Button> {
    vec![Button::new(label, action.encode())]
}

fn navigation_rows() -> Vec<Vec<Button>> {
    vec![
        button("📞 Customer Support", Action::Support),
        button("❌ Cancel", Action::Cancel),
    ]
}

pub fn welcome(first_name: &str, support_contact: &str, support_phone: &str) -> OutboundMessage {
    OutboundMessage::text(format!(
        "👋 <b>Welcome to {}, {}!</b>\n\n\
         I can help you purchase mobile data bundles quickly and easily.\n\n\
         Need help? Contact our support at {} or call {}",
        APP_NAME,
        escape_html(first_name),
        escape_html(support_contact),
        escape_html(support_phone)
    ))
}

pub fn categories(catalog: &Catalog) -> OutboundMessage {
    let mut rows: Vec<Vec<Button>> = catalog
        .categories()
        .into_iter()
        .map(|v| button(v.label(), Action::Category(v)))
        .collect();
    rows.extend(navigation_rows());
    OutboundMessage::text("📶 <b>Data Bundles</b>\n\nPlease select a category:").with_buttons(rows)
}

pub fn bundle_list(category: Validity, bundles: &[&Bundle]) -> OutboundMessage {
    let mut rows: Vec<Vec<Button>> = bundles
        .iter()
        .map(|b| button(&b.display_name, Action::Bundle(b.id.clone())))
        .collect();
    rows.push(button("⬅️ Back to Categories", Action::BackToCategories));
    rows.extend(navigation_rows());
    OutboundMessage::text(format!(
        "<b>{}</b>\n\nPlease select a package:",
        category.label()
    ))
    .with_buttons(rows)
}

fn bundle_details(bundle: &Bundle) -> String {
    let mut out = escape_html(&bundle.display_name);
    if !bundle.data_allowance.is_empty() {
        out.push_str(&format!("\nData: {}", escape_html(&bundle.data_allowance)));
    }
    if !bundle.validity_label.is_empty() {
        out.push_str(&format!("\nValidity: {}", escape_html(&bundle.validity_label)));
    }
    if !bundle.description.is_empty() {
        out.push_str(&format!("\nDescription: {}", escape_html(&bundle.description)));
    }
    out
}

pub fn phone_prompt(bundle: &Bundle) -> OutboundMessage {
    OutboundMessage::text(format!(
        "You selected: {}\n\n\
         Please enter the phone number to purchase this package for:\n\n{}",
        bundle_details(bundle),
        PHONE_FORMATS
    ))
    .with_buttons(vec![button("❌ Cancel", Action::Cancel)])
}

pub fn change_phone_prompt() -> OutboundMessage {
    OutboundMessage::text(format!("Please enter a different phone number:\n\n{}", PHONE_FORMATS))
        .with_buttons(vec![button("❌ Cancel", Action::Cancel)])
}

pub fn invalid_phone() -> OutboundMessage {
    OutboundMessage::text(format!(
        "❌ Invalid phone number format. Please enter a valid Kenyan phone number.\n\n{}",
        PHONE_FORMATS
    ))
    .with_buttons(vec![button("❌ Cancel", Action::Cancel)])
}

pub fn summary(bundle: &Bundle, phone: &Msisdn) -> OutboundMessage {
    OutboundMessage::text(format!(
        "📋 <b>Purchase Summary</b>\n\n\
         Data Bundle: {}\n\
         Size: {}\n\
         Validity: {}\n\
         Phone Number: {}\n\
         Price: KSh {}\n\n\
         Please confirm your purchase:",
        escape_html(&bundle.display_name),
        escape_html(&bundle.data_allowance),
        escape_html(&bundle.validity_label),
        phone,
        bundle.price
    ))
    .with_buttons(vec![
        button("✅ Confirm Purchase", Action::Confirm),
        button("🔄 Change Phone Number", Action::ChangePhone),
        button("❌ Cancel", Action::Cancel),
    ])
}

pub fn confirmed(bundle: &Bundle, phone: &Msisdn, reference: &str) -> OutboundMessage {
    OutboundMessage::text(format!(
        "✅ Purchase confirmed!\n\n\
         • Package: {}\n\
         • Phone: {}\n\
         • Price: KSh {}\n\
         • Reference: <code>{}</code>\n\n\
         Processing payment...\n\n\
         Please complete the payment on your phone when prompted.",
        escape_html(&bundle.display_name),
        phone,
        bundle.price,
        reference
    ))
}

pub fn payment_processing(reference: &str) -> OutboundMessage {
    OutboundMessage::text(format!(
        "🔄 <b>Payment Processing</b>\n\n\
         Please check your phone and enter your M-PESA PIN to complete the payment.\n\n\
         Reference: <code>{}</code>\n\n\
         We will let you know as soon as it goes through.",
        reference
    ))
}

pub fn payment_in_progress(reference: &str) -> OutboundMessage {
    OutboundMessage::text(format!(
        "⏳ A payment is already in progress (reference <code>{}</code>).\n\n\
         Please complete it on your phone. You will be notified of the result.",
        reference
    ))
}

pub fn payment_success(first_name: &str, transaction_reference: &str, reference: &str) -> OutboundMessage {
    OutboundMessage::text(format!(
        "✅ <b>Payment Successful</b>\n\n\
         Thank you {} for your purchase! Your data bundle has been activated.\n\n\
         Transaction: <code>{}</code>\n\
         Reference: <code>{}</code>",
        escape_html(first_name),
        escape_html(transaction_reference),
        reference
    ))
    .with_buttons(vec![button("🛒 Buy Another Bundle", Action::BackToCategories)])
}

/// Sent when a payment we had reported as failed settles after all.
pub fn payment_late_success(first_name: &str, transaction_reference: &str, reference: &str) -> OutboundMessage {
    OutboundMessage::text(format!(
        "✅ <b>Payment Received</b>\n\n\
         Good news {}! Your earlier payment went through after all and your data bundle has been activated. \
         There is no need to retry it.\n\n\
         Transaction: <code>{}</code>\n\
         Reference: <code>{}</code>",
        escape_html(first_name),
        escape_html(transaction_reference),
        reference
    ))
    .with_buttons(vec![button("🛒 Buy Another Bundle", Action::BackToCategories)])
}

pub fn earlier_payment_unresolved(reference: &str) -> OutboundMessage {
    OutboundMessage::text(format!(
        "⚠️ Your earlier payment <code>{}</code> has not been confirmed either way yet.\n\n\
         Check your M-PESA messages first. Confirming again may charge you twice.",
        reference
    ))
}

/// Why a payment did not go through, without internal detail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    Declined,
    NotCompleted,
    Timeout,
    Unavailable,
}

impl FailureReason {
    /// The provider may still settle the push after we gave up on it.
    pub fn is_uncertain(&self) -> bool {
        matches!(self, FailureReason::Timeout | FailureReason::Unavailable)
    }
}

impl From<&GatewayError> for FailureReason {
    fn from(err: &GatewayError) -> Self {
        match err {
            GatewayError::Rejected(_) => FailureReason::Declined,
            GatewayError::Timeout => FailureReason::Timeout,
            GatewayError::Unavailable(_) => FailureReason::Unavailable,
        }
    }
}

pub fn payment_failed(reason: &FailureReason) -> OutboundMessage {
    let detail = match reason {
        FailureReason::Declined => "The payment provider declined the request.",
        FailureReason::NotCompleted => "The payment was not completed on your phone.",
        FailureReason::Timeout => "We did not get a response from the payment provider in time.",
        FailureReason::Unavailable => "The payment service is temporarily unavailable.",
    };
    let next = if reason.is_uncertain() {
        "The payment may still go through. Please check your M-PESA messages before retrying, \
         and we will notify you here if it completes."
    } else {
        "You have not been charged. You can retry the same purchase below."
    };
    OutboundMessage::text(format!(
        "❌ <b>Payment Failed</b>\n\n\
         {}\n\n\
         {}\n\n\
         If the issue persists, please contact our support.",
        detail, next
    ))
    .with_buttons(vec![
        button("🔁 Retry Payment", Action::Retry),
        button("📶 Browse Bundles", Action::BackToCategories),
        button("📞 Customer Support", Action::Support),
    ])
}

pub fn bundle_unavailable() -> OutboundMessage {
    OutboundMessage::text("⚠️ That bundle is no longer available. Please pick another one.")
}

pub fn invalid_selection() -> OutboundMessage {
    OutboundMessage::text("Invalid package selection. Please try again.")
}

pub fn session_expired() -> OutboundMessage {
    OutboundMessage::text(
        "⌛ This menu has expired. Send /bundles to start a new purchase.",
    )
}

pub fn cancelled(support_contact: &str, support_phone: &str) -> OutboundMessage {
    OutboundMessage::text(format!(
        "You have cancelled your purchase. If you need assistance, please contact our support at {} or call {}.\n\n\
         You can start a new purchase anytime by sending /bundles.",
        escape_html(support_contact),
        escape_html(support_phone)
    ))
}

pub fn nothing_to_cancel() -> OutboundMessage {
    OutboundMessage::text("There is nothing to cancel. Send /bundles to browse data bundles.")
}

pub fn restarted() -> OutboundMessage {
    OutboundMessage::text(
        "🔄 Bot has been restarted. Your previous session has been cleared.\n\n\
         You can now start a new purchase.",
    )
}

pub fn support(support_contact: &str, support_phone: &str) -> OutboundMessage {
    OutboundMessage::text(format!(
        "📞 <b>Customer Support</b>\n\n\
         If you need assistance, please contact us through:\n\n\
         • Telegram: {}\n\
         • Phone: {}\n\n\
         We're here to help you with any questions or issues!",
        escape_html(support_contact),
        escape_html(support_phone)
    ))
}

pub fn help(session_timeout_secs: i64) -> OutboundMessage {
    OutboundMessage::text(format!(
        "<b>Welcome to {}</b>\n\n\
         This bot helps you purchase data bundles quickly and easily.\n\n\
         <b>Available Commands:</b>\n\
         /start - Start the bot\n\
         /bundles - View available data bundles\n\
         /help - Show this help message\n\
         /restart - Reset the bot if you get stuck\n\
         /support - Contact customer support\n\
         /about - Information about this service\n\n\
         To purchase a data bundle, follow these steps:\n\
         1. Choose a data bundle from the menu\n\
         2. Enter the phone number\n\
         3. Confirm your purchase\n\
         4. Complete the payment via M-PESA\n\n\
         <b>Note:</b> Conversations automatically reset after {} minutes of inactivity. \
         You can also use /restart at any time to start over.",
        APP_NAME,
        (session_timeout_secs / 60).max(1)
    ))
}

pub fn about() -> OutboundMessage {
    OutboundMessage::text(format!(
        "<b>{} v{}</b>\n\n\
         A convenient way to purchase mobile data bundles directly through Telegram.\n\n\
         Payments are processed securely via M-PESA.",
        APP_NAME, APP_VERSION
    ))
}

pub fn temporary_problem() -> OutboundMessage {
    OutboundMessage::text("⚠️ Something went wrong on our side. Please try again in a moment.")
}

pub fn use_menu_hint() -> OutboundMessage {
    OutboundMessage::text("Please use the menu buttons, or send /bundles to browse data bundles.")
}

pub fn unauthorized() -> OutboundMessage {
    OutboundMessage::text("You don't have permission to access this command.")
}

pub fn admin_menu() -> OutboundMessage {
    OutboundMessage::text("🔐 <b>Admin Panel</b>\n\nPlease select an option:").with_buttons(vec![
        button("📢 Send Broadcast Message", Action::AdminBroadcast),
        button("📊 View Stats", Action::AdminStats),
        button("❌ Exit Admin Panel", Action::AdminExit),
    ])
}

pub fn broadcast_prompt() -> OutboundMessage {
    OutboundMessage::text(
        "📢 <b>Send Broadcast Message</b>\n\n\
         Please enter the message you want to send to all users.\n\
         This will be sent to everyone who has used the bot.\n\n\
         Type /cancel to cancel.",
    )
}

pub fn broadcast_body(text: &str) -> OutboundMessage {
    OutboundMessage::text(format!("📢 <b>Broadcast Message</b>\n\n{}", escape_html(text)))
}

pub fn broadcast_started(recipients: usize) -> OutboundMessage {
    OutboundMessage::text(format!(
        "🔄 Sending broadcast message to {} users...\n\n\
         Please wait, this may take some time depending on the number of users.",
        recipients
    ))
}

pub fn broadcast_summary(report: &DeliveryReport) -> OutboundMessage {
    OutboundMessage::text(format!(
        "✅ <b>Broadcast Complete</b>\n\n\
         Messages sent: {}\n\
         Failed: {}\n\n\
         What would you like to do next?",
        report.delivered,
        report.failed.len()
    ))
    .with_buttons(vec![
        button("📢 Send Another Broadcast", Action::AdminBroadcast),
        button("❌ Exit Admin Panel", Action::AdminExit),
    ])
}

pub fn broadcast_no_users() -> OutboundMessage {
    OutboundMessage::text("No users found in the database.")
}

pub fn broadcast_cancelled() -> OutboundMessage {
    OutboundMessage::text("Broadcast cancelled.")
}

pub fn admin_stats(stats: &Stats, open_sessions: usize, pending_payments: usize) -> OutboundMessage {
    OutboundMessage::text(format!(
        "📊 <b>Bot Statistics</b>\n\n\
         Total Users: {}\n\
         Active (24h): {}\n\
         Open Sessions: {}\n\
         Pending Payments: {}",
        stats.user_count, stats.active_last_24h, open_sessions, pending_payments
    ))
    .with_buttons(vec![
        button("📢 Send Broadcast Message", Action::AdminBroadcast),
        button("❌ Exit Admin Panel", Action::AdminExit),
    ])
}

pub fn admin_closed() -> OutboundMessage {
    OutboundMessage::text("Admin panel closed.")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_lists_price_and_phone() {
        let catalog = Catalog::default();
        let bundle = catalog.get("D1").unwrap();
        let phone = crate::phone::normalize("0712345678").unwrap();

        let msg = summary(bundle, &phone);
        assert!(msg.text.contains("KSh 20"));
        assert!(msg.text.contains("254712345678"));
        assert!(msg.has_button("confirm"));
        assert!(msg.has_button("change_phone"));
        assert!(msg.has_button("cancel"));
    }

    #[test]
    fn failure_message_hides_gateway_detail() {
        let reason = FailureReason::from(&GatewayError::Rejected("channel 2486 inactive".into()));
        let msg = payment_failed(&reason);
        assert!(!msg.text.contains("2486"));
        assert!(msg.has_button("retry"));
    }

    #[test]
    fn only_definite_failures_promise_no_charge() {
        let declined = payment_failed(&FailureReason::Declined);
        assert!(declined.text.contains("not been charged"));

        for reason in [FailureReason::Timeout, FailureReason::Unavailable] {
            let msg = payment_failed(&reason);
            assert!(!msg.text.contains("not been charged"), "{reason:?}");
            assert!(msg.text.contains("check your M-PESA messages"));
        }
    }

    #[test]
    fn user_names_are_escaped() {
        let msg = welcome("<script>", "@support", "0700000000");
        assert!(msg.text.contains("&lt;script&gt;"));
    }
}
