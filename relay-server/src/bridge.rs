//! Turn orchestration: one inbound message in, one reply out.
//!
//! A chat message runs LOAD → REPLAY → CALL → RESPOND → PERSIST. Failures
//! before a reply exists produce the configured failure text and nothing is
//! persisted. Once the reply has been handed to the sink, a failed history
//! write is only logged; the user already has their answer.

use relay_core::config::BotConfig;
use relay_core::{GeminiChat, HistoryStore, ModelError, ModelSettings, StoreError, Transcript};
use reqwest::Client;
use std::sync::Arc;
use thiserror::Error;

use crate::sink::{MessageSink, OutboundMessage};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundKind {
    Text(String),
    Command { name: String },
}

impl InboundKind {
    /// `/name@bot ...` is a command; anything else is chat text. Command
    /// arguments are not used.
    pub fn parse(text: &str) -> Self {
        let Some(rest) = text.strip_prefix('/') else {
            return Self::Text(text.to_string());
        };

        let head = rest.split(char::is_whitespace).next().unwrap_or_default();
        let name = head.split('@').next().unwrap_or_default();

        Self::Command {
            name: name.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub chat_id: i64,
    pub message_id: i64,
    pub sender: String,
    pub kind: InboundKind,
}

#[derive(Error, Debug)]
pub enum TurnError {
    #[error("history: {0}")]
    Store(#[from] StoreError),

    #[error("model: {0}")]
    Model(#[from] ModelError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnOutcome {
    Replied,
    Reset,
    Failed,
    Ignored,
}

pub struct Bridge {
    store: Arc<dyn HistoryStore>,
    sink: Arc<dyn MessageSink>,
    http: Client,
    model: ModelSettings,
    bot: BotConfig,
}

impl Bridge {
    pub fn new(
        store: Arc<dyn HistoryStore>,
        sink: Arc<dyn MessageSink>,
        model: ModelSettings,
        bot: BotConfig,
    ) -> Result<Self, ModelError> {
        let http = Client::builder().timeout(model.timeout).build()?;
        Ok(Self {
            store,
            sink,
            http,
            model,
            bot,
        })
    }

    pub async fn handle(&self, inbound: InboundMessage) -> TurnOutcome {
        match &inbound.kind {
            InboundKind::Text(text) => {
                tracing::info!(
                    chat_id = inbound.chat_id,
                    sender = %inbound.sender,
                    "Received new message"
                );
                self.handle_message(inbound.chat_id, inbound.message_id, text)
                    .await
            }
            InboundKind::Command { name } if name == "start" => {
                self.handle_start(inbound.chat_id, inbound.message_id).await
            }
            InboundKind::Command { name } => {
                tracing::debug!(chat_id = inbound.chat_id, command = %name, "Ignoring unknown command");
                TurnOutcome::Ignored
            }
        }
    }

    pub async fn handle_message(&self, chat_id: i64, message_id: i64, text: &str) -> TurnOutcome {
        let (reply, transcript) = match self.run_turn(chat_id, text).await {
            Ok(done) => done,
            Err(e) => {
                tracing::error!(chat_id, message_id, error = %e, "Turn failed");
                self.send_failure(chat_id, message_id).await;
                return TurnOutcome::Failed;
            }
        };

        if reply.is_empty() {
            tracing::debug!(chat_id, message_id, "Model returned no text, sending empty reply");
        }
        self.deliver(OutboundMessage::reply(chat_id, message_id, reply))
            .await;

        if let Err(e) = self.store.save(chat_id, &transcript).await {
            tracing::error!(chat_id, error = %e, "Failed to persist chat history");
        }

        TurnOutcome::Replied
    }

    /// Clears history and greets. Never touches the model.
    pub async fn handle_start(&self, chat_id: i64, message_id: i64) -> TurnOutcome {
        if let Err(e) = self.store.reset(chat_id).await {
            tracing::error!(chat_id, error = %e, "Failed to reset chat history");
            self.send_failure(chat_id, message_id).await;
            return TurnOutcome::Failed;
        }

        let mut welcome = OutboundMessage::reply(chat_id, message_id, self.bot.welcome_text.as_str());
        if !self.bot.link_url.is_empty() {
            welcome = welcome.with_button(self.bot.link_label.as_str(), self.bot.link_url.as_str());
        }
        self.deliver(welcome).await;

        TurnOutcome::Reset
    }

    async fn run_turn(&self, chat_id: i64, text: &str) -> Result<(String, Transcript), TurnError> {
        let history = self.store.latest(chat_id).await?.unwrap_or_default();

        let mut chat = GeminiChat::with_client(self.http.clone(), self.model.clone())?;
        chat.load_transcript(history);

        let reply = chat.send_turn(text).await?;
        Ok((reply.text(), chat.into_transcript()))
    }

    async fn send_failure(&self, chat_id: i64, message_id: i64) {
        self.deliver(OutboundMessage::reply(
            chat_id,
            message_id,
            self.bot.failure_text.as_str(),
        ))
        .await;
    }

    async fn deliver(&self, message: OutboundMessage) {
        let chat_id = message.chat_id;
        if let Err(e) = self.sink.send(message).await {
            tracing::error!(chat_id, error = %e, "Failed to send message");
        }
    }
}
