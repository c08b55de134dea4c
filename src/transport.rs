//! Operator messaging transport with a small buffered send queue.
//!
//! The supervisor never talks to the messaging platform inline; outbound
//! traffic goes through [`MessengerService`], a bounded queue drained by
//! a background task with retry/backoff. Implementations of
//! [`Transport`] are interchangeable: the Telegram Bot API client for
//! production, a null transport for local-only operation, recording
//! doubles in tests.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::config::TelegramConfig;
use crate::{AppError, Result};

const QUEUE_CAPACITY: usize = 256;
const SEND_ATTEMPTS: u32 = 3;
const INITIAL_RETRY_DELAY: Duration = Duration::from_secs(1);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

/// One outbound item for the messaging platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Plain or formatted text message.
    Text {
        /// Destination chat.
        chat_id: i64,
        /// Message body.
        text: String,
        /// Progress updates may be collapsed by the transport.
        is_progress: bool,
    },
    /// Binary photo attachment.
    Photo {
        /// Destination chat.
        chat_id: i64,
        /// Base64-encoded PNG payload.
        image_base64: String,
        /// Caption shown with the photo.
        caption: String,
    },
    /// Cosmetic typing indicator; carries no correctness weight.
    Typing {
        /// Destination chat.
        chat_id: i64,
    },
}

/// Messaging-platform seam presented to the supervisor.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver a text message.
    async fn send_message(&self, chat_id: i64, text: &str, is_progress: bool) -> Result<()>;
    /// Deliver a photo.
    async fn send_photo(&self, chat_id: i64, image: &[u8], caption: &str) -> Result<()>;
    /// Show a typing indicator (best-effort).
    async fn send_typing(&self, chat_id: i64) -> Result<()>;
}

/// Buffered sender in front of a [`Transport`] implementation.
pub struct MessengerService {
    queue_tx: mpsc::Sender<Outbound>,
}

impl MessengerService {
    /// Start the service, spawning the queue-drain task.
    ///
    /// Returns the service and the drain task's handle so shutdown can
    /// await it.
    #[must_use]
    pub fn start(transport: Arc<dyn Transport>) -> (Self, JoinHandle<()>) {
        let (queue_tx, queue_rx) = mpsc::channel(QUEUE_CAPACITY);
        let handle = tokio::spawn(drain_queue(queue_rx, transport));
        (Self { queue_tx }, handle)
    }

    /// Enqueue an outbound item.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Transport`] when the queue is closed.
    pub async fn enqueue(&self, item: Outbound) -> Result<()> {
        self.queue_tx
            .send(item)
            .await
            .map_err(|err| AppError::Transport(format!("failed to enqueue message: {err}")))
    }

    /// Non-blocking enqueue for best-effort paths (crash handling).
    pub fn enqueue_lossy(&self, item: Outbound) {
        if let Err(err) = self.queue_tx.try_send(item) {
            warn!(%err, "dropped outbound message, queue full or closed");
        }
    }
}

async fn drain_queue(mut queue_rx: mpsc::Receiver<Outbound>, transport: Arc<dyn Transport>) {
    while let Some(item) = queue_rx.recv().await {
        let mut delay = INITIAL_RETRY_DELAY;
        for attempt in 1..=SEND_ATTEMPTS {
            match deliver(transport.as_ref(), &item).await {
                Ok(()) => break,
                Err(err) if attempt == SEND_ATTEMPTS => {
                    error!(%err, attempt, "giving up on outbound message");
                }
                Err(err) => {
                    warn!(%err, attempt, "outbound delivery failed, retrying");
                    sleep(delay).await;
                    delay = (delay * 2).min(MAX_RETRY_DELAY);
                }
            }
        }
    }
    info!("messenger queue drained and closed");
}

async fn deliver(transport: &dyn Transport, item: &Outbound) -> Result<()> {
    match item {
        Outbound::Text {
            chat_id,
            text,
            is_progress,
        } => transport.send_message(*chat_id, text, *is_progress).await,
        Outbound::Photo {
            chat_id,
            image_base64,
            caption,
        } => {
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(image_base64)
                .map_err(|err| AppError::Transport(format!("invalid photo payload: {err}")))?;
            transport.send_photo(*chat_id, &bytes, caption).await
        }
        Outbound::Typing { chat_id } => transport.send_typing(*chat_id).await,
    }
}

/// Telegram Bot API transport.
pub struct TelegramTransport {
    client: reqwest::Client,
    api_base: String,
}

impl TelegramTransport {
    /// Build a transport from loaded credentials.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Config`] when no bot token was loaded.
    pub fn new(config: &TelegramConfig) -> Result<Self> {
        if config.bot_token.is_empty() {
            return Err(AppError::Config("telegram bot token not loaded".into()));
        }
        Ok(Self {
            client: reqwest::Client::new(),
            api_base: format!("https://api.telegram.org/bot{}", config.bot_token),
        })
    }

    async fn call(&self, method: &str, body: &serde_json::Value) -> Result<()> {
        let url = format!("{}/{method}", self.api_base);
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|err| AppError::Transport(format!("{method} request failed: {err}")))?;
        if !response.status().is_success() {
            let status = response.status();
            let detail = response.text().await.unwrap_or_default();
            return Err(AppError::Transport(format!(
                "{method} returned {status}: {detail}"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for TelegramTransport {
    async fn send_message(&self, chat_id: i64, text: &str, _is_progress: bool) -> Result<()> {
        self.call(
            "sendMessage",
            &serde_json::json!({ "chat_id": chat_id, "text": text }),
        )
        .await
    }

    async fn send_photo(&self, chat_id: i64, image: &[u8], caption: &str) -> Result<()> {
        let part = reqwest::multipart::Part::bytes(image.to_vec()).file_name("photo.png");
        let form = reqwest::multipart::Form::new()
            .text("chat_id", chat_id.to_string())
            .text("caption", caption.to_owned())
            .part("photo", part);
        let url = format!("{}/sendPhoto", self.api_base);
        let response = self
            .client
            .post(&url)
            .multipart(form)
            .send()
            .await
            .map_err(|err| AppError::Transport(format!("sendPhoto request failed: {err}")))?;
        if !response.status().is_success() {
            return Err(AppError::Transport(format!(
                "sendPhoto returned {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn send_typing(&self, chat_id: i64) -> Result<()> {
        self.call(
            "sendChatAction",
            &serde_json::json!({ "chat_id": chat_id, "action": "typing" }),
        )
        .await
    }
}

/// Transport for local-only operation: logs outbound traffic and
/// delivers nothing.
#[derive(Debug, Default)]
pub struct NullTransport;

#[async_trait]
impl Transport for NullTransport {
    async fn send_message(&self, chat_id: i64, text: &str, _is_progress: bool) -> Result<()> {
        info!(chat_id, text, "outbound message (local-only mode)");
        Ok(())
    }

    async fn send_photo(&self, chat_id: i64, image: &[u8], caption: &str) -> Result<()> {
        info!(chat_id, bytes = image.len(), caption, "outbound photo (local-only mode)");
        Ok(())
    }

    async fn send_typing(&self, _chat_id: i64) -> Result<()> {
        Ok(())
    }
}
