/// In-memory channel whose timing is under the test's control
use crate::chat::connection::ChannelHandle;
use crate::config::MESSAGE_EVENT;
use crate::error::{ChatError, Result};
use crate::realtime::{ChannelMessage, PresenceAction, PresenceMessage, RealtimeChannel, Subscription, TransportState};
use async_trait::async_trait;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, watch, Semaphore};
use tokio::time::sleep;

pub(crate) struct ScriptedChannel {
    pub messages: broadcast::Sender<ChannelMessage>,
    pub presence: broadcast::Sender<PresenceMessage>,
    /// Newest-first, as the service returns it
    pub history: Mutex<Vec<ChannelMessage>>,
    pub history_delay: Duration,
    pub members: Mutex<Vec<PresenceMessage>>,
    /// Each membership read takes one permit
    pub presence_gate: Semaphore,
    pub completed_gets: AtomicUsize,
}

impl ScriptedChannel {
    pub fn new(history_delay: Duration, presence_permits: usize) -> Arc<Self> {
        let (messages, _) = broadcast::channel(64);
        let (presence, _) = broadcast::channel(64);
        Arc::new(Self {
            messages,
            presence,
            history: Mutex::new(Vec::new()),
            history_delay,
            members: Mutex::new(Vec::new()),
            presence_gate: Semaphore::new(presence_permits),
            completed_gets: AtomicUsize::new(0),
        })
    }

    /// Handle plus the sender that drives its connection state
    pub fn handle(self: &Arc<Self>) -> (ChannelHandle, watch::Sender<TransportState>) {
        let (state_tx, state_rx) = watch::channel(TransportState::Connected);
        let channel: Arc<dyn RealtimeChannel> = self.clone();
        (ChannelHandle::new(channel, state_rx), state_tx)
    }
}

pub(crate) fn chat_message(id: &str, timestamp: i64) -> ChannelMessage {
    ChannelMessage {
        id: id.to_string(),
        name: MESSAGE_EVENT.to_string(),
        client_id: "carol-3".to_string(),
        timestamp,
        data: json!({ "text": id, "userName": "Carol" }),
    }
}

pub(crate) fn member(action: PresenceAction, client_id: &str, name: &str) -> PresenceMessage {
    PresenceMessage {
        action,
        client_id: client_id.to_string(),
        data: json!({ "userName": name }),
        timestamp: 1,
    }
}

#[async_trait]
impl RealtimeChannel for ScriptedChannel {
    fn name(&self) -> &str {
        "scripted"
    }

    fn client_id(&self) -> &str {
        "alice-1"
    }

    async fn history(&self, limit: usize) -> Result<Vec<ChannelMessage>> {
        sleep(self.history_delay).await;
        let history = self.history.lock().unwrap();
        Ok(history.iter().take(limit).cloned().collect())
    }

    fn subscribe(&self, event: &str) -> Subscription<ChannelMessage> {
        let event = event.to_string();
        Subscription::filtered(self.messages.subscribe(), move |m| m.name == event)
    }

    async fn publish(&self, _event: &str, _data: serde_json::Value) -> Result<()> {
        Ok(())
    }

    async fn presence_enter(&self, _data: serde_json::Value) -> Result<()> {
        Ok(())
    }

    async fn presence_update(&self, _data: serde_json::Value) -> Result<()> {
        Ok(())
    }

    async fn presence_leave(&self) -> Result<()> {
        Ok(())
    }

    async fn presence_get(&self) -> Result<Vec<PresenceMessage>> {
        let permit = self
            .presence_gate
            .acquire()
            .await
            .map_err(|_| ChatError::Presence("gate closed".to_string()))?;
        permit.forget();
        let members = self.members.lock().unwrap().clone();
        self.completed_gets.fetch_add(1, Ordering::SeqCst);
        Ok(members)
    }

    fn presence_subscribe(&self) -> Subscription<PresenceMessage> {
        Subscription::new(self.presence.subscribe())
    }
}
