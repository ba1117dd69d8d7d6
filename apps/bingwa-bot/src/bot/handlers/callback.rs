use crate::bot::handlers::profile_of;
use crate::flow::actions::InboundEvent;
use crate::AppState;
use teloxide::prelude::*;
use teloxide::types::CallbackQuery;
use tracing::{debug, info};

pub async fn callback_handler(
    bot: Bot,
    q: CallbackQuery,
    state: AppState,
) -> Result<(), teloxide::RequestError> {
    info!("Received callback: {:?}", q.data);
    let _ = bot.answer_callback_query(q.id.clone()).await;

    let (Some(data), Some(msg)) = (q.data.as_deref(), q.message.as_ref()) else {
        debug!("Callback from {} without data or message", q.from.id);
        return Ok(());
    };

    // Pressed menus are removed so stale buttons cannot be pressed twice.
    let chat_id = msg.chat().id;
    let _ = bot.delete_message(chat_id, msg.id()).await;

    let event = InboundEvent::callback(profile_of(&q.from), chat_id.0, data);
    state.flow.handle(event).await;
    Ok(())
}
