/// Typing indicators: rate-limited outbound intent, expiring inbound set
use crate::chat::connection::ChannelHandle;
use crate::config::TYPING_EVENT;
use crate::error::{ChatError, Result};
use crate::realtime::{ChannelMessage, Subscription};
use serde_json::json;
use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::debug;

/// Remote client ids currently typing
pub type TypingSet = BTreeSet<String>;

/// Per-client expiry deadlines.
///
/// A refresh pushes a second heap entry for the same id; entries whose
/// deadline no longer matches `deadlines` are stale and skipped.
#[derive(Debug)]
pub struct TypingTracker {
    expiry: Duration,
    deadlines: HashMap<String, Instant>,
    heap: BinaryHeap<Reverse<(Instant, String)>>,
}

impl TypingTracker {
    pub fn new(expiry: Duration) -> Self {
        Self {
            expiry,
            deadlines: HashMap::new(),
            heap: BinaryHeap::new(),
        }
    }

    /// Mark `client_id` typing as of `now`, restarting its countdown.
    /// Returns whether the id was newly added.
    pub fn start(&mut self, client_id: &str, now: Instant) -> bool {
        let fire_at = now + self.expiry;
        let added = self.deadlines.insert(client_id.to_string(), fire_at).is_none();
        self.heap.push(Reverse((fire_at, client_id.to_string())));
        added
    }

    /// Returns whether the id was present
    pub fn stop(&mut self, client_id: &str) -> bool {
        self.deadlines.remove(client_id).is_some()
    }

    pub fn next_deadline(&mut self) -> Option<Instant> {
        self.pop_stale();
        self.heap.peek().map(|Reverse((t, _))| *t)
    }

    /// Remove and return every id whose deadline is at or before `now`
    pub fn expire_due(&mut self, now: Instant) -> Vec<String> {
        let mut expired = Vec::new();
        loop {
            self.pop_stale();
            let due = matches!(self.heap.peek(), Some(Reverse((fire_at, _))) if *fire_at <= now);
            if !due {
                break;
            }
            if let Some(Reverse((_, client_id))) = self.heap.pop() {
                self.deadlines.remove(&client_id);
                expired.push(client_id);
            }
        }
        expired
    }

    pub fn typing(&self) -> TypingSet {
        self.deadlines.keys().cloned().collect()
    }

    fn pop_stale(&mut self) {
        while let Some(Reverse((fire_at, client_id))) = self.heap.peek() {
            if self.deadlines.get(client_id) == Some(fire_at) {
                break;
            }
            self.heap.pop();
        }
    }
}

/// Suppresses events within `window` of the last emitted one
#[derive(Debug)]
pub struct Cooldown {
    window: Duration,
    last: Option<Instant>,
}

impl Cooldown {
    pub fn new(window: Duration) -> Self {
        Self { window, last: None }
    }

    pub fn ready(&self, now: Instant) -> bool {
        self.last.map_or(true, |last| now.duration_since(last) >= self.window)
    }

    pub fn mark(&mut self, now: Instant) {
        self.last = Some(now);
    }

    pub fn reset(&mut self) {
        self.last = None;
    }
}

/// Publishes local typing intent and follows remote typers
pub struct TypingBroadcaster {
    channel: ChannelHandle,
    cooldown: Mutex<Cooldown>,
    typing_tx: Arc<watch::Sender<TypingSet>>,
    task: JoinHandle<()>,
}

impl TypingBroadcaster {
    /// Subscribe to typing events and start the expiry loop
    pub fn start(channel: ChannelHandle, cooldown: Duration, expiry: Duration) -> Self {
        let (typing_tx, _) = watch::channel(TypingSet::new());
        let typing_tx = Arc::new(typing_tx);
        let events = channel.subscribe(TYPING_EVENT);
        let task = tokio::spawn(follow_typing(
            events,
            channel.client_id().to_string(),
            TypingTracker::new(expiry),
            typing_tx.clone(),
        ));

        Self {
            channel,
            cooldown: Mutex::new(Cooldown::new(cooldown)),
            typing_tx,
            task,
        }
    }

    /// Emit a typing event unless one went out within the cooldown.
    /// Returns whether an event was published.
    pub async fn notify_typing(&self) -> Result<bool> {
        // Held across the publish so concurrent callers see the mark
        let mut cooldown = self.cooldown.lock().await;
        let now = Instant::now();
        if !cooldown.ready(now) {
            return Ok(false);
        }
        self.publish(true).await?;
        cooldown.mark(now);
        Ok(true)
    }

    /// Emit an explicit stop and re-arm the limiter
    pub async fn notify_stopped(&self) -> Result<()> {
        let mut cooldown = self.cooldown.lock().await;
        self.publish(false).await?;
        cooldown.reset();
        Ok(())
    }

    pub fn observe_typing_set(&self) -> watch::Receiver<TypingSet> {
        self.typing_tx.subscribe()
    }

    pub fn typing_set(&self) -> TypingSet {
        self.typing_tx.borrow().clone()
    }

    async fn publish(&self, is_typing: bool) -> Result<()> {
        let payload = json!({ "userId": self.channel.client_id(), "isTyping": is_typing });
        self.channel
            .publish(TYPING_EVENT, payload)
            .await
            .map_err(|e| match e {
                ChatError::Publish(_) => e,
                other => ChatError::Publish(other.to_string()),
            })
    }
}

impl Drop for TypingBroadcaster {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn follow_typing(
    mut events: Subscription<ChannelMessage>,
    local_id: String,
    mut tracker: TypingTracker,
    typing_tx: Arc<watch::Sender<TypingSet>>,
) {
    loop {
        let deadline = tracker.next_deadline();
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                // The publisher id is stamped by the service, not taken from the payload
                if event.client_id == local_id {
                    continue;
                }
                let is_typing = event.data.get("isTyping").and_then(|v| v.as_bool()).unwrap_or(false);
                if is_typing {
                    tracker.start(&event.client_id, Instant::now());
                } else {
                    tracker.stop(&event.client_id);
                }
                typing_tx.send_replace(tracker.typing());
            }
            _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                let expired = tracker.expire_due(Instant::now());
                if !expired.is_empty() {
                    debug!("Typing expired for {:?}", expired);
                    typing_tx.send_replace(tracker.typing());
                }
            }
        }
    }
}
