/// Chat messages: bounded history backfill merged with live delivery
use crate::chat::connection::ChannelHandle;
use crate::config::MESSAGE_EVENT;
use crate::error::{ChatError, Result};
use crate::realtime::{ChannelMessage, Subscription, TransportState};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};
use uuid::Uuid;

const UNKNOWN_AUTHOR: &str = "Unknown";

/// A chat message as observed from the channel. Never constructed locally
/// before the channel has accepted it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub text: String,
    pub author_id: String,
    pub author_name: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub sent_at: DateTime<Utc>,
}

impl Message {
    /// Decode a delivered channel message, filling in what the payload lacks
    pub fn from_channel(message: &ChannelMessage) -> Self {
        let text = message.data.get("text").and_then(|v| v.as_str()).unwrap_or("");
        let author_name = message
            .data
            .get("userName")
            .and_then(|v| v.as_str())
            .filter(|name| !name.is_empty())
            .unwrap_or(UNKNOWN_AUTHOR);
        let id = if message.id.is_empty() {
            Uuid::new_v4().to_string()
        } else {
            message.id.clone()
        };
        let sent_at = if message.timestamp > 0 {
            Utc.timestamp_millis_opt(message.timestamp).single()
        } else {
            None
        };

        Self {
            id,
            text: text.to_string(),
            author_id: message.client_id.clone(),
            author_name: author_name.to_string(),
            sent_at: sent_at.unwrap_or_else(Utc::now),
        }
    }
}

/// `history` followed by the live items whose id has not been seen yet.
/// Both inputs keep their internal order.
pub fn merge_backfill(history: Vec<Message>, live: Vec<Message>) -> Vec<Message> {
    let mut seen = HashSet::with_capacity(history.len() + live.len());
    history
        .into_iter()
        .chain(live)
        .filter(|m| seen.insert(m.id.clone()))
        .collect()
}

/// Insert `missed` messages (oldest-first, none already present) after the
/// last message sent no later than each of them. Existing order is kept.
pub fn splice_missed(messages: &mut Vec<Message>, missed: Vec<Message>) {
    for message in missed {
        let at = messages
            .iter()
            .rposition(|m| m.sent_at <= message.sent_at)
            .map_or(0, |i| i + 1);
        messages.insert(at, message);
    }
}

/// Live message listener. Dropping it unsubscribes.
pub struct LiveMessages {
    subscription: Subscription<ChannelMessage>,
}

impl LiveMessages {
    pub async fn recv(&mut self) -> Option<Message> {
        self.subscription
            .recv()
            .await
            .map(|message| Message::from_channel(&message))
    }
}

/// Message operations on one channel handle
pub struct MessageStream {
    channel: ChannelHandle,
    history_loaded: AtomicBool,
}

impl MessageStream {
    pub fn new(channel: ChannelHandle) -> Self {
        Self {
            channel,
            history_loaded: AtomicBool::new(false),
        }
    }

    /// Most recent `limit` messages, oldest-first. Allowed once per handle.
    pub async fn load_history(&self, limit: usize) -> Result<Vec<Message>> {
        if self.history_loaded.swap(true, Ordering::SeqCst) {
            return Err(ChatError::Protocol("history already loaded for this channel".to_string()));
        }
        self.fetch_recent(limit).await
    }

    /// Same read as [`load_history`](Self::load_history) without the once
    /// guard, for catching up after a reconnect
    pub async fn fetch_recent(&self, limit: usize) -> Result<Vec<Message>> {
        let items = self.channel.history(limit).await?;
        let mut messages: Vec<Message> = items
            .iter()
            .filter(|m| m.name == MESSAGE_EVENT)
            .take(limit)
            .map(Message::from_channel)
            .collect();
        // Transport returns newest-first
        messages.reverse();
        debug!("Loaded {} messages of history", messages.len());
        Ok(messages)
    }

    pub fn subscribe_live(&self) -> LiveMessages {
        LiveMessages {
            subscription: self.channel.subscribe(MESSAGE_EVENT),
        }
    }

    /// Publish a chat message. Nothing is recorded locally; the message shows
    /// up once the channel delivers it back.
    pub async fn publish(&self, text: &str, author_name: &str) -> Result<()> {
        let payload = json!({ "text": text, "userName": author_name });
        self.channel
            .publish(MESSAGE_EVENT, payload)
            .await
            .map_err(|e| match e {
                ChatError::Publish(_) => e,
                other => ChatError::Publish(other.to_string()),
            })
    }
}

/// Visible message list published by a [`MessageFeed`]
#[derive(Debug, Clone)]
pub struct FeedSnapshot {
    pub messages: Arc<Vec<Message>>,
    pub is_loading: bool,
}

impl FeedSnapshot {
    fn loading() -> Self {
        Self {
            messages: Arc::new(Vec::new()),
            is_loading: true,
        }
    }
}

/// Running merge of history and live delivery. Dropping it stops the feed.
pub struct MessageFeed {
    snapshot: watch::Receiver<FeedSnapshot>,
    task: JoinHandle<()>,
}

impl MessageFeed {
    pub fn start(stream: Arc<MessageStream>, history_limit: usize) -> Self {
        let (tx, rx) = watch::channel(FeedSnapshot::loading());
        // Subscribe before the history request goes out so the race window is buffered
        let live = stream.subscribe_live();
        let state = stream.channel.state();
        let task = tokio::spawn(run_feed(stream, history_limit, live, state, tx));
        Self { snapshot: rx, task }
    }

    pub fn snapshot(&self) -> FeedSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<FeedSnapshot> {
        self.snapshot.clone()
    }

    /// Wait for a snapshot satisfying `predicate`
    pub async fn wait_for(
        &self,
        deadline: Duration,
        mut predicate: impl FnMut(&FeedSnapshot) -> bool,
    ) -> Result<FeedSnapshot> {
        let mut rx = self.snapshot.clone();
        let found = timeout(deadline, rx.wait_for(|s| predicate(s)))
            .await
            .map_err(|_| ChatError::Timeout("waiting for messages".to_string()))?;
        found
            .map(|snapshot| snapshot.clone())
            .map_err(|_| ChatError::Transport("message feed stopped".to_string()))
    }
}

impl Drop for MessageFeed {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run_feed(
    stream: Arc<MessageStream>,
    history_limit: usize,
    mut live: LiveMessages,
    mut state: watch::Receiver<TransportState>,
    tx: watch::Sender<FeedSnapshot>,
) {
    let history = stream.load_history(history_limit);
    tokio::pin!(history);

    let mut buffered = Vec::new();
    let mut live_open = true;
    let history = loop {
        tokio::select! {
            biased;
            result = &mut history => break result,
            incoming = live.recv(), if live_open => match incoming {
                Some(message) => buffered.push(message),
                None => live_open = false,
            },
        }
    };

    // A failed backfill is retried on the next connect
    let mut synced = history.is_ok();
    let history = history.unwrap_or_else(|e| {
        warn!("Failed to load message history: {}", e);
        Vec::new()
    });
    if !buffered.is_empty() {
        debug!("Merging {} live messages that raced the history fetch", buffered.len());
    }

    let mut messages = Arc::new(merge_backfill(history, buffered));
    let mut seen: HashSet<String> = messages.iter().map(|m| m.id.clone()).collect();
    tx.send_replace(FeedSnapshot {
        messages: messages.clone(),
        is_loading: false,
    });

    let mut state_open = true;
    loop {
        let connected = *state.borrow_and_update() == TransportState::Connected;
        if !connected {
            // Whatever is published while away is only reachable through history
            synced = false;
        } else if !synced {
            synced = true;
            match stream.fetch_recent(history_limit).await {
                Ok(recent) => {
                    let missed: Vec<Message> = recent.into_iter().filter(|m| seen.insert(m.id.clone())).collect();
                    if !missed.is_empty() {
                        debug!("Caught up on {} missed messages", missed.len());
                        splice_missed(Arc::make_mut(&mut messages), missed);
                        tx.send_replace(FeedSnapshot {
                            messages: messages.clone(),
                            is_loading: false,
                        });
                    }
                }
                Err(e) => warn!("Failed to catch up on message history: {}", e),
            }
        }

        tokio::select! {
            incoming = live.recv(), if live_open => match incoming {
                Some(message) => {
                    if !seen.insert(message.id.clone()) {
                        debug!("Dropping duplicate message {}", message.id);
                        continue;
                    }
                    Arc::make_mut(&mut messages).push(message);
                    tx.send_replace(FeedSnapshot {
                        messages: messages.clone(),
                        is_loading: false,
                    });
                }
                None => live_open = false,
            },
            changed = state.changed(), if state_open => {
                if changed.is_err() {
                    state_open = false;
                }
            }
            else => break,
        }
    }
}
