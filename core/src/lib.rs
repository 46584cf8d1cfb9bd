/// ChatKu - realtime chat room core
///
/// Connection lifecycle, history backfill merged with live delivery, presence
/// roster, and typing indicators over a pub/sub channel, plus the broker and
/// credential endpoint that serve that channel.

pub mod auth;
pub mod auth_api;
pub mod chat;
pub mod config;
pub mod error;
pub mod http_client;
pub mod identity;
pub mod loadtest;
pub mod realtime;
pub mod server;
pub mod validation;

pub use chat::{ConnectionState, Session};
pub use config::Config;
pub use error::{ChatError, Result};
pub use identity::{ClientIdentity, ProfileStore};
pub use server::Server;
