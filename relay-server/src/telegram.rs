//! Telegram Bot API connector — long polling in, `sendMessage` out.
//!
//! Only the handful of methods and fields the relay needs are modelled; unknown
//! fields in API responses are ignored.

use async_trait::async_trait;
use futures::Stream;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use thiserror::Error;

use crate::bridge::{InboundKind, InboundMessage};
use crate::sink::{LinkButton, MessageSink, OutboundMessage};

/// Pause before polling again after a failed `getUpdates`.
const POLL_RETRY_PAUSE: Duration = Duration::from_secs(3);

#[derive(Error, Debug)]
pub enum TelegramError {
    #[error("HTTP request failed: {0}")]
    Http(#[source] reqwest::Error),

    #[error("Telegram API error ({code}): {description}")]
    Api { code: i64, description: String },

    #[error("Telegram API returned ok without a result")]
    MissingResult,
}

// Method URLs embed the bot token; never let it reach error text.
impl From<reqwest::Error> for TelegramError {
    fn from(e: reqwest::Error) -> Self {
        Self::Http(e.without_url())
    }
}

// ============================================================================
// Bot API types
// ============================================================================

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    error_code: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct User {
    pub id: i64,
    #[serde(default)]
    pub is_bot: bool,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub username: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Chat {
    pub id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Message {
    pub message_id: i64,
    #[serde(default)]
    pub from: Option<User>,
    pub chat: Chat,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<Message>,
}

impl Update {
    /// Text messages only; everything else (edits, stickers, joins) is dropped.
    pub fn into_inbound(self) -> Option<InboundMessage> {
        let message = self.message?;
        let text = message.text?;
        let sender = message
            .from
            .map(|u| u.username.unwrap_or(u.first_name))
            .unwrap_or_default();

        Some(InboundMessage {
            chat_id: message.chat.id,
            message_id: message.message_id,
            sender,
            kind: InboundKind::parse(&text),
        })
    }
}

#[derive(Debug, Serialize)]
struct GetUpdates<'a> {
    offset: i64,
    timeout: u64,
    allowed_updates: &'a [&'a str],
}

#[derive(Debug, Serialize)]
struct InlineKeyboardMarkup<'a> {
    inline_keyboard: &'a [Vec<LinkButton>],
}

#[derive(Debug, Serialize)]
struct SendMessage<'a> {
    chat_id: i64,
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    reply_to_message_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reply_markup: Option<InlineKeyboardMarkup<'a>>,
}

// ============================================================================
// TelegramClient
// ============================================================================

#[derive(Debug, Clone)]
pub struct TelegramClient {
    client: Client,
    base_url: String,
    poll_timeout: u64,
}

impl TelegramClient {
    pub fn new(token: &str, api_url: &str, poll_timeout: u64) -> Result<Self, TelegramError> {
        // Long polls hold the connection for `poll_timeout`; leave headroom.
        let client = Client::builder()
            .timeout(Duration::from_secs(poll_timeout + 10))
            .build()?;

        Ok(Self {
            client,
            base_url: format!("{}/bot{}", api_url.trim_end_matches('/'), token),
            poll_timeout,
        })
    }

    async fn call<B, T>(&self, method: &str, body: &B) -> Result<T, TelegramError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = format!("{}/{}", self.base_url, method);
        let response: ApiResponse<T> = self.client.post(&url).json(body).send().await?.json().await?;

        if !response.ok {
            return Err(TelegramError::Api {
                code: response.error_code.unwrap_or_default(),
                description: response.description.unwrap_or_default(),
            });
        }
        response.result.ok_or(TelegramError::MissingResult)
    }

    /// Verifies the token. Used once at startup.
    pub async fn get_me(&self) -> Result<User, TelegramError> {
        self.call("getMe", &serde_json::json!({})).await
    }

    pub async fn get_updates(&self, offset: i64) -> Result<Vec<Update>, TelegramError> {
        self.call(
            "getUpdates",
            &GetUpdates {
                offset,
                timeout: self.poll_timeout,
                allowed_updates: &["message"],
            },
        )
        .await
    }

    pub async fn send_message(&self, message: &OutboundMessage) -> Result<Message, TelegramError> {
        let reply_markup = (!message.keyboard.is_empty()).then(|| InlineKeyboardMarkup {
            inline_keyboard: &message.keyboard,
        });

        self.call(
            "sendMessage",
            &SendMessage {
                chat_id: message.chat_id,
                text: &message.text,
                reply_to_message_id: message.reply_to,
                reply_markup,
            },
        )
        .await
    }

    /// Endless stream of inbound messages. The offset is advanced past every
    /// received update, including ones that are filtered out.
    pub fn inbound(self) -> impl Stream<Item = InboundMessage> {
        let state = PollState {
            client: self,
            offset: 0,
            pending: VecDeque::new(),
        };

        futures::stream::unfold(state, |mut state| async move {
            loop {
                if let Some(next) = state.pending.pop_front() {
                    return Some((next, state));
                }

                match state.client.get_updates(state.offset).await {
                    Ok(updates) => {
                        for update in updates {
                            state.offset = state.offset.max(update.update_id + 1);
                            if let Some(inbound) = update.into_inbound() {
                                state.pending.push_back(inbound);
                            }
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, offset = state.offset, "getUpdates failed, retrying");
                        tokio::time::sleep(POLL_RETRY_PAUSE).await;
                    }
                }
            }
        })
    }
}

struct PollState {
    client: TelegramClient,
    offset: i64,
    pending: VecDeque<InboundMessage>,
}

#[async_trait]
impl MessageSink for TelegramClient {
    async fn send(&self, message: OutboundMessage) -> anyhow::Result<()> {
        self.send_message(&message).await?;
        Ok(())
    }
}
