/// Presence: announce the local member and keep a roster of who is here
use crate::chat::connection::ChannelHandle;
use crate::error::{ChatError, Result};
use crate::realtime::{PresenceMessage, Subscription, TransportState};
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceMember {
    pub client_id: String,
    pub display_name: String,
}

/// Snapshot of the member set, at most one entry per client id,
/// ordered by display name
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Roster {
    members: Vec<PresenceMember>,
}

impl Roster {
    pub fn from_presence(entries: &[PresenceMessage]) -> Self {
        let unique: BTreeMap<&str, &PresenceMessage> =
            entries.iter().map(|e| (e.client_id.as_str(), e)).collect();
        let mut members: Vec<PresenceMember> = unique
            .into_values()
            .map(|entry| PresenceMember {
                client_id: entry.client_id.clone(),
                display_name: entry
                    .data
                    .get("userName")
                    .and_then(|v| v.as_str())
                    .unwrap_or("Unknown")
                    .to_string(),
            })
            .collect();
        members.sort_by(|a, b| {
            a.display_name
                .to_lowercase()
                .cmp(&b.display_name.to_lowercase())
                .then_with(|| a.client_id.cmp(&b.client_id))
        });
        Self { members }
    }

    pub fn members(&self) -> &[PresenceMember] {
        &self.members
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn contains(&self, client_id: &str) -> bool {
        self.members.iter().any(|m| m.client_id == client_id)
    }
}

/// Tracks channel membership. Every membership event triggers a full
/// re-read of the channel's member set.
///
/// Dropping a joined tracker leaves the channel in the background.
pub struct PresenceTracker {
    channel: ChannelHandle,
    roster_tx: Arc<watch::Sender<Roster>>,
    /// Cleared on leave; late refreshes check it before publishing
    alive: Arc<AtomicBool>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl PresenceTracker {
    pub fn new(channel: ChannelHandle) -> Self {
        let (roster_tx, _) = watch::channel(Roster::default());
        Self {
            channel,
            roster_tx: Arc::new(roster_tx),
            alive: Arc::new(AtomicBool::new(false)),
            listener: Mutex::new(None),
        }
    }

    /// Enter the channel as `display_name` and start following membership.
    ///
    /// The tracker stays joined even when the enter fails: it enters again
    /// and re-reads the roster each time the connection becomes `Connected`.
    /// The error is still returned so the caller can report it.
    pub async fn join(&self, display_name: &str) -> Result<()> {
        if self.alive.swap(true, Ordering::SeqCst) {
            return Err(ChatError::Presence("already joined".to_string()));
        }

        // Listen first so changes made while entering trigger a refresh
        let events = self.channel.presence_subscribe();
        let data = json!({ "userName": display_name });
        let entered = self.channel.presence_enter(data.clone()).await;
        if entered.is_ok() {
            info!("Entered presence as {} ({})", display_name, self.channel.client_id());
            refresh(self.channel.clone(), self.roster_tx.clone(), self.alive.clone()).await;
        }

        let task = tokio::spawn(follow(
            self.channel.clone(),
            events,
            data,
            entered.is_ok(),
            self.roster_tx.clone(),
            self.alive.clone(),
        ));
        if let Ok(mut listener) = self.listener.lock() {
            *listener = Some(task);
        }

        entered.map_err(|e| match e {
            ChatError::Presence(_) => e,
            other => ChatError::Presence(other.to_string()),
        })
    }

    pub fn observe_roster(&self) -> watch::Receiver<Roster> {
        self.roster_tx.subscribe()
    }

    pub fn roster(&self) -> Roster {
        self.roster_tx.borrow().clone()
    }

    pub fn is_joined(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Stop following membership and leave the channel. Failures are logged.
    pub async fn leave(&self) {
        if !self.stop() {
            return;
        }
        if let Err(e) = self.channel.presence_leave().await {
            warn!("Failed to leave presence: {}", e);
        }
        self.roster_tx.send_replace(Roster::default());
        debug!("Left presence ({})", self.channel.client_id());
    }

    /// Returns whether the tracker was joined
    fn stop(&self) -> bool {
        if !self.alive.swap(false, Ordering::SeqCst) {
            return false;
        }
        if let Some(task) = self.listener.lock().ok().and_then(|mut l| l.take()) {
            task.abort();
        }
        true
    }
}

impl Drop for PresenceTracker {
    fn drop(&mut self) {
        if !self.stop() {
            return;
        }
        let channel = self.channel.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(e) = channel.presence_leave().await {
                        warn!("Failed to leave presence on drop: {}", e);
                    }
                });
            }
            Err(_) => warn!("No runtime to leave presence on drop"),
        }
    }
}

/// Membership follower. Every presence event spawns a roster refresh; every
/// (re)connect enters again, then refreshes.
async fn follow(
    channel: ChannelHandle,
    mut events: Subscription<PresenceMessage>,
    data: serde_json::Value,
    mut entered: bool,
    roster_tx: Arc<watch::Sender<Roster>>,
    alive: Arc<AtomicBool>,
) {
    let mut state = channel.state();
    let mut state_open = true;
    loop {
        let connected = *state.borrow_and_update() == TransportState::Connected;
        if !connected {
            // The service drops members of lost connections
            entered = false;
        } else if !entered {
            if !alive.load(Ordering::SeqCst) {
                break;
            }
            // One attempt per connected period
            entered = true;
            match channel.presence_enter(data.clone()).await {
                Ok(()) => {
                    info!("Entered presence after connecting ({})", channel.client_id());
                    refresh(channel.clone(), roster_tx.clone(), alive.clone()).await;
                }
                Err(e) => warn!("Failed to enter presence, retrying on next connect: {}", e),
            }
        }

        tokio::select! {
            event = events.recv() => match event {
                Some(event) => {
                    if !alive.load(Ordering::SeqCst) {
                        break;
                    }
                    debug!("Presence {:?} from {}", event.action, event.client_id);
                    // Refreshes may finish out of order; the last one to finish wins
                    tokio::spawn(refresh(channel.clone(), roster_tx.clone(), alive.clone()));
                }
                None => break,
            },
            changed = state.changed(), if state_open => {
                if changed.is_err() {
                    state_open = false;
                }
            }
        }
    }
}

async fn refresh(channel: ChannelHandle, roster_tx: Arc<watch::Sender<Roster>>, alive: Arc<AtomicBool>) {
    match channel.presence_get().await {
        Ok(entries) => {
            if alive.load(Ordering::SeqCst) {
                roster_tx.send_replace(Roster::from_presence(&entries));
            }
        }
        Err(e) => warn!("Failed to refresh presence, roster may be stale: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::scripted::{member, ScriptedChannel};
    use crate::realtime::PresenceAction;
    use std::time::Duration;
    use tokio::time::{sleep, timeout};

    fn entry(client_id: &str, name: &str) -> PresenceMessage {
        PresenceMessage {
            action: PresenceAction::Present,
            client_id: client_id.to_string(),
            data: json!({ "userName": name }),
            timestamp: 0,
        }
    }

    #[test]
    fn test_roster_set_semantics() {
        let roster = Roster::from_presence(&[entry("b", "Bob"), entry("a", "alice"), entry("b", "Bob")]);
        assert_eq!(roster.len(), 2);
        assert_eq!(roster.members()[0].display_name, "alice");
        assert!(roster.contains("b"));
    }

    #[test]
    fn test_roster_missing_name() {
        let mut raw = entry("x", "");
        raw.data = json!({});
        let roster = Roster::from_presence(&[raw]);
        assert_eq!(roster.members()[0].display_name, "Unknown");
    }

    #[test]
    fn test_roster_is_deterministic() {
        let entries = [entry("c", "Cleo"), entry("a", "Ann"), entry("b", "Bo")];
        let mut reversed = entries.clone();
        reversed.reverse();
        assert_eq!(Roster::from_presence(&entries), Roster::from_presence(&reversed));
    }

    #[tokio::test]
    async fn test_refresh_finishing_after_leave_is_discarded() {
        // One permit: the refresh done by join
        let channel = ScriptedChannel::new(Duration::ZERO, 1);
        *channel.members.lock().unwrap() = vec![member(PresenceAction::Present, "alice-1", "Alice")];
        let (handle, _state) = channel.handle();
        let tracker = PresenceTracker::new(handle);
        tracker.join("Alice").await.unwrap();
        assert_eq!(tracker.roster().len(), 1);

        channel.members.lock().unwrap().push(member(PresenceAction::Present, "bob-2", "Bob"));
        channel.presence.send(member(PresenceAction::Enter, "bob-2", "Bob")).unwrap();
        // Let the refresh start and park on the gate
        sleep(Duration::from_millis(50)).await;

        tracker.leave().await;
        assert!(tracker.roster().is_empty());

        channel.presence_gate.add_permits(1);
        timeout(Duration::from_secs(5), async {
            while channel.completed_gets.load(Ordering::SeqCst) < 2 {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert!(tracker.roster().is_empty());
    }

    #[tokio::test]
    async fn test_reconnect_enters_and_rereads_roster() {
        let channel = ScriptedChannel::new(Duration::ZERO, 10);
        *channel.members.lock().unwrap() = vec![member(PresenceAction::Present, "alice-1", "Alice")];
        let (handle, state) = channel.handle();
        let tracker = PresenceTracker::new(handle);
        tracker.join("Alice").await.unwrap();
        let mut roster = tracker.observe_roster();

        state.send_replace(TransportState::Disconnected);
        sleep(Duration::from_millis(50)).await;
        // Membership changed while away, with no event delivered
        channel.members.lock().unwrap().push(member(PresenceAction::Present, "bob-2", "Bob"));
        state.send_replace(TransportState::Connected);

        timeout(Duration::from_secs(5), roster.wait_for(|r| r.len() == 2))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(channel.completed_gets.load(Ordering::SeqCst), 2);
    }
}
