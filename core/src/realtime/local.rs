/// In-process transport: connections talk to a shared [`Hub`] directly
use crate::auth::CredentialSource;
use crate::error::{ChatError, Result};
use crate::realtime::{
    wait_connected, ChannelMessage, Hub, PresenceMessage, RealtimeChannel, RealtimeConnection, Subscription,
    Transport, TransportState,
};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub struct LocalTransport {
    hub: Arc<Hub>,
    credentials: Arc<dyn CredentialSource>,
    request_timeout: Duration,
}

impl LocalTransport {
    pub fn new(hub: Arc<Hub>, credentials: Arc<dyn CredentialSource>, request_timeout: Duration) -> Self {
        Self {
            hub,
            credentials,
            request_timeout,
        }
    }
}

impl Transport for LocalTransport {
    fn connect(&self, client_id: &str) -> Arc<dyn RealtimeConnection> {
        let (state_tx, state_rx) = watch::channel(TransportState::Initialized);
        let state_tx = Arc::new(state_tx);
        let channel = Arc::new(LocalChannel {
            hub: self.hub.clone(),
            connection_id: Uuid::new_v4().to_string(),
            client_id: client_id.to_string(),
            state: state_rx,
            request_timeout: self.request_timeout,
        });

        let connection = Arc::new(LocalConnection {
            channel: channel.clone(),
            state_tx: state_tx.clone(),
        });

        let hub = self.hub.clone();
        let credentials = self.credentials.clone();
        let client_id = client_id.to_string();
        tokio::spawn(async move {
            state_tx.send_replace(TransportState::Connecting);
            let outcome = match credentials.fetch(&client_id).await {
                Ok(token) if token.client_id != client_id => Err(ChatError::Credential(format!(
                    "token issued for {} instead of {}",
                    token.client_id, client_id
                ))),
                Ok(token) => hub.authenticate(&token).map(|_| ()),
                Err(e) => Err(e),
            };

            let next = match outcome {
                Ok(()) => {
                    info!("Local connection {} established for {}", channel.connection_id, client_id);
                    TransportState::Connected
                }
                Err(e) => {
                    warn!("Local connection for {} failed: {}", client_id, e);
                    TransportState::Failed
                }
            };
            // A close issued while authenticating wins
            state_tx.send_if_modified(|state| {
                if *state == TransportState::Connecting {
                    *state = next;
                    true
                } else {
                    false
                }
            });
        });

        connection
    }
}

struct LocalConnection {
    channel: Arc<LocalChannel>,
    state_tx: Arc<watch::Sender<TransportState>>,
}

#[async_trait]
impl RealtimeConnection for LocalConnection {
    fn client_id(&self) -> &str {
        &self.channel.client_id
    }

    fn state(&self) -> watch::Receiver<TransportState> {
        self.state_tx.subscribe()
    }

    fn channel(&self) -> Arc<dyn RealtimeChannel> {
        self.channel.clone()
    }

    async fn close(&self) {
        self.state_tx.send_replace(TransportState::Closing);
        self.channel
            .hub
            .release_connection(&self.channel.connection_id, &self.channel.client_id)
            .await;
        self.state_tx.send_replace(TransportState::Closed);
        debug!("Local connection {} closed", self.channel.connection_id);
    }
}

struct LocalChannel {
    hub: Arc<Hub>,
    connection_id: String,
    client_id: String,
    state: watch::Receiver<TransportState>,
    request_timeout: Duration,
}

impl LocalChannel {
    async fn ready(&self) -> Result<()> {
        let mut state = self.state.clone();
        wait_connected(&mut state, self.request_timeout).await
    }
}

#[async_trait]
impl RealtimeChannel for LocalChannel {
    fn name(&self) -> &str {
        self.hub.channel_name()
    }

    fn client_id(&self) -> &str {
        &self.client_id
    }

    async fn history(&self, limit: usize) -> Result<Vec<ChannelMessage>> {
        self.ready().await?;
        Ok(self.hub.history(limit).await)
    }

    fn subscribe(&self, event: &str) -> Subscription<ChannelMessage> {
        let event = event.to_string();
        Subscription::filtered(self.hub.subscribe_messages(), move |m| m.name == event)
    }

    async fn publish(&self, event: &str, data: serde_json::Value) -> Result<()> {
        self.ready().await?;
        self.hub.publish(&self.client_id, event, data).await;
        Ok(())
    }

    async fn presence_enter(&self, data: serde_json::Value) -> Result<()> {
        self.ready().await?;
        self.hub.presence_enter(&self.connection_id, &self.client_id, data).await;
        Ok(())
    }

    async fn presence_update(&self, data: serde_json::Value) -> Result<()> {
        self.ready().await?;
        self.hub.presence_update(&self.connection_id, &self.client_id, data).await;
        Ok(())
    }

    async fn presence_leave(&self) -> Result<()> {
        self.ready().await?;
        self.hub.presence_leave(&self.connection_id, &self.client_id).await;
        Ok(())
    }

    async fn presence_get(&self) -> Result<Vec<PresenceMessage>> {
        self.ready().await?;
        Ok(self.hub.presence_get().await)
    }

    fn presence_subscribe(&self) -> Subscription<PresenceMessage> {
        Subscription::new(self.hub.subscribe_presence())
    }
}
