use anyhow::Result;
use async_trait::async_trait;

/// Inline button: a label and the callback data it sends back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Button {
    pub label: String,
    pub data: String,
}

impl Button {
    pub fn new(label: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            data: data.into(),
        }
    }
}

/// Text is HTML; callers escape anything user-supplied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub text: String,
    pub buttons: Vec<Vec<Button>>,
}

impl OutboundMessage {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            buttons: Vec::new(),
        }
    }

    pub fn with_buttons(mut self, buttons: Vec<Vec<Button>>) -> Self {
        self.buttons = buttons;
        self
    }

    pub fn has_button(&self, data: &str) -> bool {
        self.buttons.iter().flatten().any(|b| b.data == data)
    }
}

/// Outbound side of the messaging transport.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, chat_id: i64, message: OutboundMessage) -> Result<()>;
}

pub fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}
