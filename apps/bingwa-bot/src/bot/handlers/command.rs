use crate::bot::handlers::profile_of;
use crate::flow::actions::InboundEvent;
use crate::AppState;
use teloxide::prelude::*;
use tracing::{debug, info};

pub async fn message_handler(
    msg: Message,
    state: AppState,
) -> Result<(), teloxide::RequestError> {
    let Some(user) = msg.from.as_ref() else {
        debug!("Ignoring message without a sender in chat {}", msg.chat.id);
        return Ok(());
    };
    let event = match msg.text() {
        Some(text) => {
            info!("Received message from {}: {:?}", user.id, text);
            InboundEvent::message(profile_of(user), msg.chat.id.0, text, &state.bot_username)
        }
        None => {
            debug!("Received non-text message from {}", user.id);
            InboundEvent::unsupported(profile_of(user), msg.chat.id.0)
        }
    };

    // teloxide already queues updates per chat; the flow also orders steps per user.
    state.flow.handle(event).await;
    Ok(())
}
