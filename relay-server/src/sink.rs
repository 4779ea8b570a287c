use async_trait::async_trait;
use serde::Serialize;

/// A URL button shown under a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LinkButton {
    pub text: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub chat_id: i64,
    pub text: String,
    pub reply_to: Option<i64>,
    /// Rows of buttons; empty means no keyboard.
    pub keyboard: Vec<Vec<LinkButton>>,
}

impl OutboundMessage {
    pub fn reply(chat_id: i64, reply_to: i64, text: impl Into<String>) -> Self {
        Self {
            chat_id,
            text: text.into(),
            reply_to: Some(reply_to),
            keyboard: Vec::new(),
        }
    }

    pub fn with_button(mut self, text: impl Into<String>, url: impl Into<String>) -> Self {
        self.keyboard.push(vec![LinkButton {
            text: text.into(),
            url: url.into(),
        }]);
        self
    }
}

/// Where replies go. Shared by every in-flight turn.
#[async_trait]
pub trait MessageSink: Send + Sync {
    async fn send(&self, message: OutboundMessage) -> anyhow::Result<()>;
}
