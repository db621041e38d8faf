//! Reelbot Telegram Adapter
//!
//! Telegram Bot API long-polling with offset persistence, client recreation,
//! custom reply keyboards, and message chunking

use anyhow::{anyhow, bail, Context, Result};
use reelbot_config::TelegramConfig;
use reelbot_ipc::{Envelope, EventBus, OutboundMessage, ReplyMarkup, Sender};
use reqwest::{Client, ClientBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::fs;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

const TELEGRAM_MAX_MESSAGE_LEN: usize = 4096;
pub const CHANNEL: &str = "telegram";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramUpdate {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<TelegramMessage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramMessage {
    pub message_id: i64,
    #[serde(default)]
    pub text: Option<String>,
    pub chat: TelegramChat,
    #[serde(default)]
    pub from: Option<TelegramUser>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramChat {
    pub id: i64,
    #[serde(rename = "type")]
    pub chat_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramUser {
    pub id: i64,
    #[serde(default)]
    pub is_bot: Option<bool>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
}

impl From<&TelegramUser> for Sender {
    fn from(user: &TelegramUser) -> Self {
        Sender {
            id: user.id,
            username: user.username.clone(),
            first_name: user.first_name.clone(),
            last_name: user.last_name.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: T,
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, PartialEq)]
enum Delivery {
    Sent,
    Rejected(String),
}

pub struct TelegramAdapter {
    client: Client,
    bot_token: String,
    api_url: String,
    data_dir: PathBuf,
    poll_timeout_secs: u64,
    client_recreate_interval_secs: u64,
    event_bus: Option<EventBus>,
}

impl TelegramAdapter {
    pub fn new(config: &TelegramConfig, data_dir: PathBuf) -> Result<Self> {
        let api_url = format!("https://api.telegram.org/bot{}", config.bot_token);
        Ok(Self {
            client: Self::build_client()?,
            bot_token: config.bot_token.clone(),
            api_url,
            data_dir,
            poll_timeout_secs: config.poll_timeout_secs.unwrap_or(60),
            client_recreate_interval_secs: config.client_recreate_interval_secs.unwrap_or(60),
            event_bus: None,
        })
    }

    pub fn with_event_bus(mut self, event_bus: EventBus) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    fn build_client() -> Result<Client> {
        ClientBuilder::new()
            .pool_idle_timeout(Duration::from_secs(600))
            .pool_max_idle_per_host(10)
            .tcp_keepalive(Some(Duration::from_secs(30)))
            .timeout(Duration::from_secs(180))
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| anyhow!("failed to build HTTP client: {}", e))
    }

    fn bot_id(&self) -> &str {
        self.bot_token.split(':').next().unwrap_or("default")
    }

    fn offset_path(&self) -> PathBuf {
        self.data_dir
            .join("runtime")
            .join(format!("telegram.{}.offset", self.bot_id()))
    }

    async fn read_offset(&self) -> Option<i64> {
        fs::read_to_string(self.offset_path())
            .await
            .ok()?
            .trim()
            .parse()
            .ok()
    }

    async fn write_offset(&self, offset: i64) {
        let path = self.offset_path();
        let written = match path.parent() {
            Some(dir) => fs::create_dir_all(dir).await,
            None => Ok(()),
        };
        if let Err(e) = written.and(fs::write(&path, format!("{}\n", offset)).await) {
            warn!(path = %path.display(), "Failed to persist Telegram offset: {}", e);
        }
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/{}", self.api_url, method)
    }

    /// Calls a Bot API method whose result the caller needs.
    async fn call<T: DeserializeOwned>(
        client: &Client,
        url: &str,
        payload: &serde_json::Value,
    ) -> Result<T> {
        let reply: ApiResponse<T> = client
            .post(url)
            .json(payload)
            .send()
            .await
            .and_then(|resp| resp.error_for_status())
            .context("telegram request failed")?
            .json()
            .await
            .context("telegram response decode failed")?;
        if !reply.ok {
            bail!("telegram returned ok=false");
        }
        Ok(reply.result)
    }

    pub async fn get_updates(
        &self,
        client: &Client,
        offset: Option<i64>,
    ) -> Result<Vec<TelegramUpdate>> {
        let mut payload = serde_json::json!({
            "timeout": self.poll_timeout_secs,
            "allowed_updates": ["message"],
        });
        if let Some(offset) = offset {
            payload["offset"] = offset.into();
        }
        Self::call(client, &self.method_url("getUpdates"), &payload)
            .await
            .context("getUpdates")
    }

    /// `reply_markup` object for the Bot API.
    fn reply_markup_json(markup: &ReplyMarkup, selective: bool) -> serde_json::Value {
        match markup {
            ReplyMarkup::Keyboard(rows) => serde_json::json!({
                "keyboard": rows.iter().map(|row| {
                    row.iter().map(|label| serde_json::json!({ "text": label })).collect::<Vec<_>>()
                }).collect::<Vec<_>>(),
                "one_time_keyboard": true,
                "resize_keyboard": true,
                "selective": selective,
            }),
            ReplyMarkup::ForceReply => serde_json::json!({
                "force_reply": true,
                "selective": selective,
            }),
            ReplyMarkup::RemoveKeyboard => serde_json::json!({
                "remove_keyboard": true,
                "selective": selective,
            }),
        }
    }

    fn build_payloads(&self, msg: &OutboundMessage) -> Vec<serde_json::Value> {
        let chunks = self.chunk_message(&msg.text);
        let last = chunks.len().saturating_sub(1);

        chunks
            .iter()
            .enumerate()
            .map(|(i, chunk)| {
                let mut payload = serde_json::json!({
                    "chat_id": msg.chat_id,
                    "text": chunk,
                    "parse_mode": "Markdown",
                    "disable_web_page_preview": true,
                });

                if let Some(reply_to_message_id) = msg.reply_to {
                    if i == 0 {
                        payload["reply_to_message_id"] = serde_json::json!(reply_to_message_id);
                    }
                }

                if i == last {
                    if let Some(markup) = &msg.reply_markup {
                        payload["reply_markup"] = Self::reply_markup_json(markup, msg.selective);
                    }
                }

                payload
            })
            .collect()
    }

    pub async fn send_message(&self, msg: &OutboundMessage) -> Result<()> {
        let url = self.method_url("sendMessage");
        for payload in self.build_payloads(msg) {
            self.send_with_fallbacks(&url, payload).await?;
        }
        Ok(())
    }

    /// Posts one Bot API call. Transport and decode failures are errors;
    /// a refusal by Telegram comes back as [`Delivery::Rejected`].
    async fn post_api(
        client: &Client,
        url: &str,
        payload: &serde_json::Value,
    ) -> Result<Delivery> {
        let resp = client
            .post(url)
            .json(payload)
            .send()
            .await
            .map_err(|e| anyhow!("telegram request failed: {}", e))?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| anyhow!("telegram response read failed: {}", e))?;

        let parsed = serde_json::from_str::<SendResponse>(&body).ok();
        if status.is_success() && parsed.as_ref().is_some_and(|r| r.ok) {
            return Ok(Delivery::Sent);
        }
        let reason = parsed.and_then(|r| r.description).unwrap_or(body);
        Ok(Delivery::Rejected(format!("HTTP {}: {}", status, reason)))
    }

    /// Strips one optional field so the next attempt can succeed. Returns
    /// `false` when nothing is left to drop.
    fn degrade_payload(payload: &mut serde_json::Value, reason: &str) -> bool {
        if Self::is_reply_target_missing(reason) && Self::remove_reply_to_message_id(payload) {
            warn!("Reply target is gone, resending without reply_to_message_id");
            return true;
        }
        let dropped_markdown = payload
            .as_object_mut()
            .is_some_and(|obj| obj.remove("parse_mode").is_some());
        if dropped_markdown {
            warn!("Markdown payload rejected ({}), resending as plain text", reason);
        }
        dropped_markdown
    }

    async fn send_with_fallbacks(&self, url: &str, mut payload: serde_json::Value) -> Result<()> {
        loop {
            let reason = match Self::post_api(&self.client, url, &payload).await? {
                Delivery::Sent => return Ok(()),
                Delivery::Rejected(reason) => reason,
            };
            if !Self::degrade_payload(&mut payload, &reason) {
                return Err(anyhow!("telegram sendMessage rejected: {}", reason));
            }
        }
    }

    fn remove_reply_to_message_id(payload: &mut serde_json::Value) -> bool {
        payload
            .as_object_mut()
            .map(|obj| obj.remove("reply_to_message_id").is_some())
            .unwrap_or(false)
    }

    fn is_reply_target_missing(body: &str) -> bool {
        body.to_ascii_lowercase()
            .contains("message to be replied not found")
    }

    /// Splits on the last line break before the limit, so a batch of list
    /// lines never breaks a Markdown entity in half.
    fn chunk_message(&self, text: &str) -> Vec<String> {
        let chars: Vec<char> = text.chars().collect();
        if chars.len() <= TELEGRAM_MAX_MESSAGE_LEN {
            return vec![text.to_string()];
        }

        let mut chunks = Vec::new();
        let mut start = 0usize;

        while start < chars.len() {
            let mut end = (start + TELEGRAM_MAX_MESSAGE_LEN).min(chars.len());

            if end < chars.len() {
                let newline = (start..end).rev().find(|&i| chars[i] == '\n');
                let space = (start..end).rev().find(|&i| chars[i] == ' ');
                if let Some(split) = newline.or(space) {
                    end = split + 1;
                }
            }

            chunks.push(chars[start..end].iter().collect::<String>());
            start = end;
        }

        chunks
    }

    pub async fn poll(&self) -> Result<()> {
        let mut offset: Option<i64> = self.read_offset().await;

        info!(offset = ?offset, "Telegram polling started");

        let mut client = self.client.clone();
        let mut client_recreate_at =
            Instant::now() + Duration::from_secs(self.client_recreate_interval_secs);

        if let Err(err) = self.sync_bot_commands(&client).await {
            warn!("Failed to sync Telegram bot commands: {}", err);
        } else {
            info!("Telegram bot commands synced");
        }

        loop {
            if Instant::now() >= client_recreate_at {
                debug!("Recreating HTTP client to prevent stale connections");
                match Self::build_client() {
                    Ok(fresh) => client = fresh,
                    Err(err) => warn!("Keeping previous HTTP client: {}", err),
                }
                client_recreate_at =
                    Instant::now() + Duration::from_secs(self.client_recreate_interval_secs);
            }

            let updates = match self.get_updates(&client, offset).await {
                Ok(v) => v,
                Err(err) => {
                    warn!("Telegram polling error: {}", err);
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    continue;
                }
            };

            for update in updates {
                offset = Some(update.update_id + 1);
                self.write_offset(update.update_id + 1).await;

                if let Some(message) = &update.message {
                    self.handle_message(message);
                }
            }
        }
    }

    async fn sync_bot_commands(&self, client: &Client) -> Result<()> {
        let url = self.method_url("setMyCommands");
        let commands = serde_json::json!([
            { "command": "help", "description": "Show help" },
            { "command": "auth", "description": "Authorize with the bot password" },
            { "command": "q", "description": "Search a movie" },
            { "command": "library", "description": "Search the movie library" },
            { "command": "wanted", "description": "Search all missing movies" },
            { "command": "clear", "description": "Cancel the current conversation" },
            { "command": "users", "description": "List users (owner)" },
            { "command": "revoke", "description": "Revoke a user (owner)" },
            { "command": "unrevoke", "description": "Restore a revoked user (owner)" }
        ]);

        let payload = serde_json::json!({ "commands": commands });
        match Self::post_api(client, &url, &payload).await? {
            Delivery::Sent => Ok(()),
            Delivery::Rejected(reason) => Err(anyhow!("telegram setMyCommands {}", reason)),
        }
    }

    /// Converts a text message from a human into an inbound envelope.
    fn envelope_for(message: &TelegramMessage) -> Option<Envelope> {
        let text = message.text.as_deref()?.trim();
        if text.is_empty() {
            return None;
        }
        let from = message.from.as_ref()?;
        if from.is_bot.unwrap_or(false) {
            return None;
        }
        Some(
            Envelope::new(CHANNEL, message.chat.id, Sender::from(from), text)
                .with_message_id(message.message_id),
        )
    }

    fn handle_message(&self, message: &TelegramMessage) {
        let Some(envelope) = Self::envelope_for(message) else {
            debug!(
                chat_id = message.chat.id,
                "Skipping message without text or human sender"
            );
            return;
        };

        // text stays out of the log, it may carry the bot password
        debug!(
            user_id = envelope.from.id,
            chat_id = envelope.chat_id,
            command = envelope.is_command(),
            "Received message"
        );

        if let Some(event_bus) = &self.event_bus {
            if let Err(e) = event_bus.publish(envelope) {
                warn!("Failed to publish message to event bus: {}", e);
            }
        } else {
            info!("No event bus configured, message not forwarded");
        }
    }

    pub async fn run_outbound_handler(&self, mut receiver: broadcast::Receiver<OutboundMessage>) {
        info!("Telegram outbound handler started");

        loop {
            match receiver.recv().await {
                Ok(msg) => {
                    if msg.channel != CHANNEL {
                        continue;
                    }
                    if let Err(e) = self.send_message(&msg).await {
                        warn!(chat_id = msg.chat_id, "Failed to send outbound message: {}", e);
                    }
                }
                Err(broadcast::error::RecvError::Closed) => {
                    info!("Telegram outbound handler stopped: channel closed");
                    break;
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(
                        "Telegram outbound handler lagged; skipped {} messages",
                        skipped
                    );
                }
            }
        }
    }
}
