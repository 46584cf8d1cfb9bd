/// Session facade: one object to join the room and talk in it
use crate::chat::connection::{ChannelHandle, ConnectionManager, StateObserver};
use crate::chat::messages::{FeedSnapshot, MessageFeed, MessageStream};
use crate::chat::presence::{PresenceTracker, Roster};
use crate::chat::typing::{TypingBroadcaster, TypingSet};
use crate::config::Config;
use crate::error::Result;
use crate::identity::ClientIdentity;
use crate::realtime::Transport;
use crate::validation::{validate_display_name, validate_message};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub struct Session {
    identity: ClientIdentity,
    connections: ConnectionManager,
    channel: ChannelHandle,
    messages: Arc<MessageStream>,
    feed: MessageFeed,
    presence: PresenceTracker,
    typing: TypingBroadcaster,
}

impl Session {
    /// Connect as `identity`, start the message feed and typing listener, and
    /// enter presence. A presence failure is logged; the tracker enters again once connected.
    pub async fn join(transport: Arc<dyn Transport>, identity: ClientIdentity, config: &Config) -> Result<Self> {
        let display_name = validate_display_name(&identity.display_name)?;
        let identity = ClientIdentity::new(identity.id, display_name);

        let connections = ConnectionManager::new(transport);
        let channel = connections.connect(&identity).await;

        let messages = Arc::new(MessageStream::new(channel.clone()));
        let feed = MessageFeed::start(messages.clone(), config.history_limit);
        let typing = TypingBroadcaster::start(channel.clone(), config.typing_cooldown, config.typing_expiry);

        let presence = PresenceTracker::new(channel.clone());
        if let Err(e) = presence.join(&identity.display_name).await {
            warn!("Joined {} without presence for now: {}", channel.name(), e);
        }

        info!("{} ({}) joined {}", identity.display_name, identity.id, channel.name());
        Ok(Self {
            identity,
            connections,
            channel,
            messages,
            feed,
            presence,
            typing,
        })
    }

    pub fn identity(&self) -> &ClientIdentity {
        &self.identity
    }

    pub fn channel(&self) -> &ChannelHandle {
        &self.channel
    }

    pub async fn observe_state(&self) -> Option<StateObserver> {
        self.connections.observe_state(&self.identity.id).await
    }

    /// Validate and publish a chat message, then clear the typing indicator
    pub async fn send(&self, text: &str) -> Result<()> {
        let text = validate_message(text)?;
        self.messages.publish(&text, &self.identity.display_name).await?;
        if let Err(e) = self.typing.notify_stopped().await {
            debug!("Could not publish typing stop: {}", e);
        }
        Ok(())
    }

    pub async fn notify_typing(&self) -> Result<bool> {
        self.typing.notify_typing().await
    }

    pub fn feed(&self) -> &MessageFeed {
        &self.feed
    }

    pub fn messages(&self) -> FeedSnapshot {
        self.feed.snapshot()
    }

    pub fn observe_messages(&self) -> watch::Receiver<FeedSnapshot> {
        self.feed.subscribe()
    }

    pub fn roster(&self) -> Roster {
        self.presence.roster()
    }

    pub fn observe_roster(&self) -> watch::Receiver<Roster> {
        self.presence.observe_roster()
    }

    pub fn typing_set(&self) -> TypingSet {
        self.typing.typing_set()
    }

    pub fn observe_typing_set(&self) -> watch::Receiver<TypingSet> {
        self.typing.observe_typing_set()
    }

    /// Leave presence and close the connection. Safe to call twice.
    pub async fn leave(&self) {
        self.presence.leave().await;
        self.connections.disconnect_all().await;
        info!("{} left {}", self.identity.display_name, self.channel.name());
    }
}
