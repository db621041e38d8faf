//! Reelbot IPC
//!
//! Event bus between the chat transport and the bot core

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::broadcast;

static NEXT_TRACE_COUNTER: AtomicU64 = AtomicU64::new(1);

fn now_unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn generate_trace_id() -> String {
    let ts = now_unix_secs();
    let n = NEXT_TRACE_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("trace-{}-{}", ts, n)
}

fn default_trace_id() -> String {
    generate_trace_id()
}

/// Who sent an inbound message, as reported by the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sender {
    pub id: i64,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
}

impl Sender {
    pub fn new(id: i64) -> Self {
        Self {
            id,
            username: None,
            first_name: None,
            last_name: None,
        }
    }

    pub fn with_username(mut self, username: &str) -> Self {
        self.username = Some(username.to_string());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default = "default_trace_id")]
    pub trace_id: String,
    pub channel: String,
    pub chat_id: i64,
    pub message_id: Option<i64>,
    pub from: Sender,
    pub text: String,
}

impl Envelope {
    pub fn new(channel: &str, chat_id: i64, from: Sender, text: &str) -> Self {
        Self {
            trace_id: generate_trace_id(),
            channel: channel.to_string(),
            chat_id,
            message_id: None,
            from,
            text: text.to_string(),
        }
    }

    pub fn with_message_id(mut self, message_id: i64) -> Self {
        self.message_id = Some(message_id);
        self
    }

    pub fn is_command(&self) -> bool {
        self.text.trim_start().starts_with('/')
    }
}

/// Reply markup attached to an outbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyMarkup {
    /// One-time custom keyboard, ordered rows of button labels.
    Keyboard(Vec<Vec<String>>),
    ForceReply,
    RemoveKeyboard,
}

impl ReplyMarkup {
    /// One button per row.
    pub fn single_column<I, S>(labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ReplyMarkup::Keyboard(labels.into_iter().map(|l| vec![l.into()]).collect())
    }

    pub fn rows(&self) -> Option<&[Vec<String>]> {
        match self {
            ReplyMarkup::Keyboard(rows) => Some(rows),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub channel: String,
    pub chat_id: i64,
    pub text: String,
    pub reply_to: Option<i64>,
    /// Markup applies only to the users mentioned or replied to.
    pub selective: bool,
    pub reply_markup: Option<ReplyMarkup>,
}

impl OutboundMessage {
    pub fn text(channel: &str, chat_id: i64, text: impl Into<String>) -> Self {
        Self {
            channel: channel.to_string(),
            chat_id,
            text: text.into(),
            reply_to: None,
            selective: false,
            reply_markup: None,
        }
    }

    pub fn reply_to(mut self, message_id: Option<i64>) -> Self {
        self.reply_to = message_id;
        self
    }

    pub fn with_markup(mut self, markup: ReplyMarkup) -> Self {
        self.reply_markup = Some(markup);
        self.selective = true;
        self
    }
}

pub const EVENT_BUS_CAPACITY: usize = 256;
pub const OUTBOUND_CAPACITY: usize = 256;

#[derive(Clone)]
pub struct EventBus {
    inbound: broadcast::Sender<Envelope>,
    outbound: broadcast::Sender<OutboundMessage>,
}

impl EventBus {
    pub fn new() -> Self {
        let (inbound_tx, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        let (outbound_tx, _) = broadcast::channel(OUTBOUND_CAPACITY);

        Self {
            inbound: inbound_tx,
            outbound: outbound_tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.inbound.subscribe()
    }

    pub fn publish(&self, envelope: Envelope) -> anyhow::Result<()> {
        self.inbound.send(envelope)?;
        Ok(())
    }

    pub fn outbound_sender(&self) -> broadcast::Sender<OutboundMessage> {
        self.outbound.clone()
    }

    pub fn outbound_subscribe(&self) -> broadcast::Receiver<OutboundMessage> {
        self.outbound.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
