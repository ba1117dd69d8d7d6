use crate::models::bundle::Validity;
use crate::models::user::UserProfile;
use teloxide::utils::command::BotCommands;

#[derive(BotCommands, Clone, Debug, PartialEq, Eq)]
#[command(rename_rule = "lowercase", description = "Available commands:")]
pub enum Command {
    #[command(description = "start the bot")]
    Start,
    #[command(description = "view available data bundles")]
    Bundles,
    #[command(description = "show this help message")]
    Help,
    #[command(description = "information about this service")]
    About,
    #[command(description = "contact customer support")]
    Support,
    #[command(description = "reset the bot if you get stuck")]
    Restart,
    #[command(description = "cancel the current operation")]
    Cancel,
    #[command(hide)]
    Admin,
}

/// Inline-button presses, carried as callback data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Category(Validity),
    Bundle(String),
    BackToCategories,
    Support,
    Cancel,
    Confirm,
    ChangePhone,
    Retry,
    AdminBroadcast,
    AdminStats,
    AdminExit,
}

impl Action {
    pub fn encode(&self) -> String {
        match self {
            Action::Category(v) => format!("cat:{}", v.as_str()),
            Action::Bundle(id) => format!("bundle:{}", id),
            Action::BackToCategories => "back".to_string(),
            Action::Support => "support".to_string(),
            Action::Cancel => "cancel".to_string(),
            Action::Confirm => "confirm".to_string(),
            Action::ChangePhone => "change_phone".to_string(),
            Action::Retry => "retry".to_string(),
            Action::AdminBroadcast => "admin:broadcast".to_string(),
            Action::AdminStats => "admin:stats".to_string(),
            Action::AdminExit => "admin:exit".to_string(),
        }
    }

    pub fn parse(data: &str) -> Option<Self> {
        if let Some(v) = data.strip_prefix("cat:") {
            return v.parse().ok().map(Action::Category);
        }
        if let Some(id) = data.strip_prefix("bundle:") {
            return (!id.is_empty()).then(|| Action::Bundle(id.to_string()));
        }
        Some(match data {
            "back" => Action::BackToCategories,
            "support" => Action::Support,
            "cancel" => Action::Cancel,
            "confirm" => Action::Confirm,
            "change_phone" => Action::ChangePhone,
            "retry" => Action::Retry,
            "admin:broadcast" => Action::AdminBroadcast,
            "admin:stats" => Action::AdminStats,
            "admin:exit" => Action::AdminExit,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Command(Command),
    Text(String),
    Action(Action),
    /// Callback data this build does not understand, e.g. from an old keyboard.
    UnknownAction(String),
    /// A sticker, photo, voice note or anything else without text.
    Unsupported,
}

/// Transport-neutral form of one inbound update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundEvent {
    pub user: UserProfile,
    pub chat_id: i64,
    pub payload: Payload,
}

impl InboundEvent {
    pub fn callback(user: UserProfile, chat_id: i64, data: &str) -> Self {
        let payload = match Action::parse(data) {
            Some(action) => Payload::Action(action),
            None => Payload::UnknownAction(data.to_string()),
        };
        Self { user, chat_id, payload }
    }

    /// Commands win over free text; `/unknown` is passed on as text.
    /// Arguments after a command (e.g. `/start promo`) are ignored.
    pub fn message(user: UserProfile, chat_id: i64, text: &str, bot_username: &str) -> Self {
        let head = text.split_whitespace().next().unwrap_or_default();
        let payload = match Command::parse(head, bot_username) {
            Ok(command) => Payload::Command(command),
            Err(_) => Payload::Text(text.to_string()),
        };
        Self { user, chat_id, payload }
    }

    pub fn unsupported(user: UserProfile, chat_id: i64) -> Self {
        Self {
            user,
            chat_id,
            payload: Payload::Unsupported,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_action_decodes_to_itself() {
        let actions = [
            Action::Category(Validity::Daily),
            Action::Bundle("D1".into()),
            Action::BackToCategories,
            Action::Support,
            Action::Cancel,
            Action::Confirm,
            Action::ChangePhone,
            Action::Retry,
            Action::AdminBroadcast,
            Action::AdminStats,
            Action::AdminExit,
        ];
        for action in actions {
            assert_eq!(Action::parse(&action.encode()), Some(action));
        }
    }

    #[test]
    fn callback_data_fits_telegram_limit() {
        let longest = Action::Bundle("X".repeat(40)).encode();
        assert!(longest.len() <= 64);
    }

    #[test]
    fn garbage_callback_is_unknown() {
        let event = InboundEvent::callback(UserProfile::default(), 1, "data_7");
        assert_eq!(event.payload, Payload::UnknownAction("data_7".into()));
        assert_eq!(Action::parse("cat:yearly"), None);
        assert_eq!(Action::parse("bundle:"), None);
    }

    #[test]
    fn commands_parse_with_and_without_mention() {
        let e = InboundEvent::message(UserProfile::default(), 1, "/bundles", "bingwa_bot");
        assert_eq!(e.payload, Payload::Command(Command::Bundles));

        let e = InboundEvent::message(UserProfile::default(), 1, "/admin@bingwa_bot", "bingwa_bot");
        assert_eq!(e.payload, Payload::Command(Command::Admin));

        let e = InboundEvent::message(UserProfile::default(), 1, "/start promo42", "bingwa_bot");
        assert_eq!(e.payload, Payload::Command(Command::Start));

        let e = InboundEvent::message(UserProfile::default(), 1, "0712 345 678", "bingwa_bot");
        assert_eq!(e.payload, Payload::Text("0712 345 678".into()));
    }

    #[test]
    fn textless_message_keeps_its_sender() {
        let user = UserProfile {
            id: 77,
            ..Default::default()
        };
        let e = InboundEvent::unsupported(user.clone(), 77);
        assert_eq!(e.user, user);
        assert_eq!(e.payload, Payload::Unsupported);
    }
}
