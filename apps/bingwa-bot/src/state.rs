use crate::flow::ConversationFlow;
use std::sync::Arc;

/// Shared with every dispatcher handler.
#[derive(Clone)]
pub struct AppState {
    pub flow: ConversationFlow,
    /// Used to accept `/command@bot_username` in groups.
    pub bot_username: Arc<str>,
}
