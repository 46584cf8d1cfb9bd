/// Configuration management
use crate::error::{ChatError, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_HTTP_PORT: u16 = 3000;
const DEFAULT_BROKER_PORT: u16 = 7400;

/// Name of the single room every client joins
pub const CHANNEL_NAME: &str = "chatku-room";

/// Event name for chat messages on the channel
pub const MESSAGE_EVENT: &str = "message";

/// Event name for typing intents on the channel
pub const TYPING_EVENT: &str = "typing";

/// Shared configuration for the server, the terminal client and the load harness
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Address the credential HTTP endpoint listens on
    pub http_addr: SocketAddr,

    /// Address the TCP broker listens on
    pub broker_listen_addr: SocketAddr,

    /// Broker address clients connect to
    pub broker_addr: String,

    /// Credential endpoint clients fetch tokens from
    pub auth_url: String,

    /// Signing key in `name:secret` form. `None` means the endpoint answers 500.
    pub api_key: Option<String>,

    /// Room name (one channel per broker)
    pub channel_name: String,

    /// Messages fetched by the one-time history backfill
    pub history_limit: usize,

    /// Messages the broker retains for backfill
    pub history_capacity: usize,

    /// Minimum gap between two outbound typing events
    pub typing_cooldown: Duration,

    /// Quiet window after which a remote typer is dropped
    pub typing_expiry: Duration,

    /// Lifetime of an issued token request
    pub token_ttl: Duration,

    /// TCP connect + auth handshake timeout
    pub connection_timeout: Duration,

    /// Timeout for a single channel request (publish, history, presence)
    pub request_timeout: Duration,

    /// Delay between reconnect attempts
    pub retry_interval: Duration,

    /// Reconnect attempts before the transport reports `Suspended`
    pub max_connection_attempts: u32,

    /// Delay between reconnect attempts once suspended
    pub suspended_retry_interval: Duration,

    /// Ping interval on an idle broker connection
    pub keepalive_interval: Duration,

    /// Directory for the persisted local profile (defaults to `.chatku`)
    pub data_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_HTTP_PORT)),
            broker_listen_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_BROKER_PORT)),
            broker_addr: format!("127.0.0.1:{}", DEFAULT_BROKER_PORT),
            auth_url: format!("http://127.0.0.1:{}/api/ably-auth", DEFAULT_HTTP_PORT),
            api_key: None,
            channel_name: CHANNEL_NAME.to_string(),
            history_limit: 50,
            history_capacity: 100,
            typing_cooldown: Duration::from_secs(3),
            typing_expiry: Duration::from_secs(3),
            token_ttl: Duration::from_secs(60 * 60),
            connection_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(10),
            retry_interval: Duration::from_secs(2),
            max_connection_attempts: 5,
            suspended_retry_interval: Duration::from_secs(15),
            keepalive_interval: Duration::from_secs(15),
            data_dir: None,
        }
    }
}

impl Config {
    /// Create config from command line arguments, then apply env overrides
    pub fn from_args(args: &[String]) -> Result<Self> {
        let mut config = Self::default();

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--http-port" => {
                    let port = parse_port(args.get(i + 1), "--http-port")?;
                    config.http_addr.set_port(port);
                    config.auth_url = format!("http://127.0.0.1:{}/api/ably-auth", port);
                    i += 2;
                }
                "--broker-port" => {
                    let port = parse_port(args.get(i + 1), "--broker-port")?;
                    config.broker_listen_addr.set_port(port);
                    config.broker_addr = format!("127.0.0.1:{}", port);
                    i += 2;
                }
                "--broker" => {
                    config.broker_addr = flag_value(args.get(i + 1), "--broker")?;
                    i += 2;
                }
                "--auth-url" => {
                    config.auth_url = flag_value(args.get(i + 1), "--auth-url")?;
                    i += 2;
                }
                "--api-key" => {
                    config.api_key = Some(flag_value(args.get(i + 1), "--api-key")?);
                    i += 2;
                }
                "--data-dir" => {
                    config.data_dir = Some(PathBuf::from(flag_value(args.get(i + 1), "--data-dir")?));
                    i += 2;
                }
                "--history-limit" => {
                    let raw = flag_value(args.get(i + 1), "--history-limit")?;
                    config.history_limit = raw.parse::<usize>().map_err(|_| {
                        ChatError::Config("--history-limit must be a positive number".to_string())
                    })?;
                    i += 2;
                }
                other => {
                    return Err(ChatError::Config(format!(
                        "Unknown argument: {}\nUsage: {} [--http-port <port>] [--broker-port <port>] [--broker <host:port>] [--auth-url <url>] [--api-key <name:secret>] [--data-dir <path>] [--history-limit <n>]",
                        other,
                        args.first().map(String::as_str).unwrap_or("chatku")
                    )));
                }
            }
        }

        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Env overrides (nice for containers and scripts)
    pub fn apply_env(&mut self) {
        if let Ok(key) = std::env::var("CHATKU_API_KEY") {
            if !key.trim().is_empty() {
                self.api_key = Some(key);
            }
        }
        if let Some(p) = std::env::var("CHATKU_HTTP_PORT")
            .ok()
            .and_then(|s| s.parse::<u16>().ok())
        {
            self.http_addr.set_port(p);
        }
        if let Some(p) = std::env::var("CHATKU_BROKER_PORT")
            .ok()
            .and_then(|s| s.parse::<u16>().ok())
        {
            self.broker_listen_addr.set_port(p);
        }
        if let Ok(addr) = std::env::var("CHATKU_BROKER_ADDR") {
            self.broker_addr = addr;
        }
        if let Ok(url) = std::env::var("CHATKU_AUTH_URL") {
            self.auth_url = url;
        }
        if let Ok(dir) = std::env::var("CHATKU_DATA_DIR") {
            self.data_dir = Some(PathBuf::from(dir));
        }
    }

    fn validate(&self) -> Result<()> {
        if self.history_limit == 0 {
            return Err(ChatError::Config("history limit must be at least 1".to_string()));
        }
        if self.history_capacity < self.history_limit {
            return Err(ChatError::Config(format!(
                "history capacity ({}) is smaller than the history limit ({})",
                self.history_capacity, self.history_limit
            )));
        }
        Ok(())
    }

    /// Directory for persisted client state
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| PathBuf::from(".chatku"))
    }
}

fn flag_value(value: Option<&String>, flag: &str) -> Result<String> {
    value
        .cloned()
        .ok_or_else(|| ChatError::Config(format!("{} requires an argument", flag)))
}

fn parse_port(value: Option<&String>, flag: &str) -> Result<u16> {
    flag_value(value, flag)?
        .parse::<u16>()
        .map_err(|_| ChatError::Config(format!("{} must be a valid number (0-65535)", flag)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_ports_rewrite_client_addresses() {
        let config = Config::from_args(&args(&["chatku", "--http-port", "8088", "--broker-port", "9099"])).unwrap();
        assert_eq!(config.http_addr.port(), 8088);
        assert_eq!(config.broker_listen_addr.port(), 9099);
        assert!(config.auth_url.ends_with(":8088/api/ably-auth"));
        assert_eq!(config.broker_addr, "127.0.0.1:9099");
    }

    #[test]
    fn test_unknown_flag_is_rejected() {
        let err = Config::from_args(&args(&["chatku", "--bogus"])).unwrap_err();
        assert!(matches!(err, ChatError::Config(_)));
    }

    #[test]
    fn test_missing_flag_value() {
        assert!(Config::from_args(&args(&["chatku", "--api-key"])).is_err());
        assert!(Config::from_args(&args(&["chatku", "--http-port", "x"])).is_err());
    }

    #[test]
    fn test_history_limit_bounds() {
        assert!(Config::from_args(&args(&["chatku", "--history-limit", "0"])).is_err());
        assert!(Config::from_args(&args(&["chatku", "--history-limit", "500"])).is_err());
        let config = Config::from_args(&args(&["chatku", "--history-limit", "20"])).unwrap();
        assert_eq!(config.history_limit, 20);
    }
}
