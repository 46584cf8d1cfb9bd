/// Chat coordination core: connection registry, message feed, presence,
/// typing indicators, and the session that ties them to one channel
pub mod connection;
pub mod messages;
pub mod presence;
pub mod session;
pub mod typing;

#[cfg(test)]
pub(crate) mod scripted;

pub use connection::{ChannelHandle, ConnectionManager, ConnectionState, StateObserver};
pub use messages::{merge_backfill, splice_missed, FeedSnapshot, Message, MessageFeed, MessageStream};
pub use presence::{PresenceMember, PresenceTracker, Roster};
pub use session::Session;
pub use typing::{Cooldown, TypingBroadcaster, TypingSet, TypingTracker};
