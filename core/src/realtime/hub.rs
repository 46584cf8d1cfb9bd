/// Single-room broker state: bounded history, live fan-out, presence membership
use crate::auth::{TokenIssuer, TokenRequest};
use crate::config::Config;
use crate::error::{ChatError, Result};
use crate::realtime::{now_millis, ChannelMessage, PresenceAction, PresenceMessage};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

const EVENT_BUFFER: usize = 256;

struct Member {
    /// Connection that entered; only it may implicitly remove the member
    connection_id: String,
    entry: PresenceMessage,
}

#[derive(Default)]
struct RoomState {
    /// Oldest at the front
    history: VecDeque<ChannelMessage>,
    members: BTreeMap<String, Member>,
}

/// The service side of the channel. Shared by every connection, local or TCP.
pub struct Hub {
    channel_name: String,
    issuer: Option<TokenIssuer>,
    history_capacity: usize,
    room: RwLock<RoomState>,
    messages: broadcast::Sender<ChannelMessage>,
    presence: broadcast::Sender<PresenceMessage>,
}

impl Hub {
    /// Create a hub. Without an issuer every authentication attempt is rejected.
    pub fn new(channel_name: impl Into<String>, history_capacity: usize, issuer: Option<TokenIssuer>) -> Arc<Self> {
        let (messages, _) = broadcast::channel(EVENT_BUFFER);
        let (presence, _) = broadcast::channel(EVENT_BUFFER);
        Arc::new(Self {
            channel_name: channel_name.into(),
            issuer,
            history_capacity,
            room: RwLock::new(RoomState::default()),
            messages,
            presence,
        })
    }

    pub fn from_config(config: &Config) -> Arc<Self> {
        let issuer = TokenIssuer::from_config(config.api_key.as_deref(), config.token_ttl).ok();
        if issuer.is_none() {
            info!("No API key configured; the hub will reject all connections");
        }
        Self::new(config.channel_name.clone(), config.history_capacity, issuer)
    }

    pub fn channel_name(&self) -> &str {
        &self.channel_name
    }

    /// Verify a token request and return the client id it grants
    pub fn authenticate(&self, token: &TokenRequest) -> Result<String> {
        let issuer = self
            .issuer
            .as_ref()
            .ok_or_else(|| ChatError::Credential("hub has no signing key".to_string()))?;
        issuer.verify(token, now_millis())?;
        Ok(token.client_id.clone())
    }

    /// Append to history and deliver to every subscriber, in one step so
    /// history order and live order agree.
    pub async fn publish(&self, client_id: &str, name: &str, data: serde_json::Value) -> ChannelMessage {
        let message = ChannelMessage {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            client_id: client_id.to_string(),
            timestamp: now_millis(),
            data,
        };

        let mut room = self.room.write().await;
        room.history.push_back(message.clone());
        while room.history.len() > self.history_capacity {
            room.history.pop_front();
        }
        // No subscribers is not an error
        let _ = self.messages.send(message.clone());
        drop(room);

        debug!("Published {} {} from {}", message.name, message.id, client_id);
        message
    }

    /// Most recent messages, newest-first
    pub async fn history(&self, limit: usize) -> Vec<ChannelMessage> {
        let room = self.room.read().await;
        room.history.iter().rev().take(limit).cloned().collect()
    }

    pub fn subscribe_messages(&self) -> broadcast::Receiver<ChannelMessage> {
        self.messages.subscribe()
    }

    pub fn subscribe_presence(&self) -> broadcast::Receiver<PresenceMessage> {
        self.presence.subscribe()
    }

    /// Enter (or re-enter, which counts as an update) the member set
    pub async fn presence_enter(&self, connection_id: &str, client_id: &str, data: serde_json::Value) {
        let mut room = self.room.write().await;
        let action = if room.members.contains_key(client_id) {
            PresenceAction::Update
        } else {
            PresenceAction::Enter
        };
        self.upsert_member(&mut room, connection_id, client_id, data, action);
    }

    /// Update member data; entering first when absent
    pub async fn presence_update(&self, connection_id: &str, client_id: &str, data: serde_json::Value) {
        self.presence_enter(connection_id, client_id, data).await
    }

    /// Explicit leave by the client. Only the connection that entered the
    /// member can remove it. Returns whether the member was removed.
    pub async fn presence_leave(&self, connection_id: &str, client_id: &str) -> bool {
        let removed = self.remove_owned(connection_id, client_id).await;
        if !removed {
            debug!("Ignored leave of {} from connection {}", client_id, connection_id);
        }
        removed
    }

    /// Implicit leave when a connection goes away. A member re-entered by a
    /// newer connection of the same client is left alone.
    pub async fn release_connection(&self, connection_id: &str, client_id: &str) -> bool {
        let released = self.remove_owned(connection_id, client_id).await;
        if released {
            debug!("Released presence of {} after connection {} closed", client_id, connection_id);
        }
        released
    }

    async fn remove_owned(&self, connection_id: &str, client_id: &str) -> bool {
        let mut room = self.room.write().await;
        let owned = room
            .members
            .get(client_id)
            .is_some_and(|m| m.connection_id == connection_id);
        if !owned {
            return false;
        }
        match room.members.remove(client_id) {
            Some(member) => {
                self.emit_leave(member.entry);
                true
            }
            None => false,
        }
    }

    /// Current members, ordered by client id
    pub async fn presence_get(&self) -> Vec<PresenceMessage> {
        let room = self.room.read().await;
        room.members
            .values()
            .map(|m| PresenceMessage {
                action: PresenceAction::Present,
                ..m.entry.clone()
            })
            .collect()
    }

    pub async fn member_count(&self) -> usize {
        self.room.read().await.members.len()
    }

    fn upsert_member(
        &self,
        room: &mut RoomState,
        connection_id: &str,
        client_id: &str,
        data: serde_json::Value,
        action: PresenceAction,
    ) {
        let entry = PresenceMessage {
            action,
            client_id: client_id.to_string(),
            data,
            timestamp: now_millis(),
        };
        room.members.insert(
            client_id.to_string(),
            Member {
                connection_id: connection_id.to_string(),
                entry: entry.clone(),
            },
        );
        debug!("Presence {:?} for {}", action, client_id);
        let _ = self.presence.send(entry);
    }

    fn emit_leave(&self, entry: PresenceMessage) {
        debug!("Presence Leave for {}", entry.client_id);
        let _ = self.presence.send(PresenceMessage {
            action: PresenceAction::Leave,
            timestamp: now_millis(),
            ..entry
        });
    }
}
