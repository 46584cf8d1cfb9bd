/// Credential issuance: signed, client-scoped token requests
///
/// A token request is what the credential endpoint hands to a client and what
/// the client presents to the broker when it connects. The broker holds the same
/// key and checks the MAC, so the secret never leaves the server side.
use crate::error::{ChatError, Result};
use crate::http_client;
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use hmac::{Hmac, Mac};
use hyper::{Method, StatusCode};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::time::Duration;
use tracing::{debug, warn};

type HmacSha256 = Hmac<Sha256>;

/// Client id used by the anonymous GET endpoint
pub const ANONYMOUS_CLIENT_ID: &str = "anonymous";

/// Capability granted to every token: all operations on all channels
const DEFAULT_CAPABILITY: &str = r#"{"*":["*"]}"#;

/// Signing key in `keyName:secret` form
#[derive(Clone)]
pub struct ApiKey {
    name: String,
    secret: String,
}

impl ApiKey {
    pub fn parse(raw: &str) -> Result<Self> {
        let (name, secret) = raw
            .trim()
            .split_once(':')
            .ok_or_else(|| ChatError::Credential("API key must be in name:secret form".to_string()))?;
        if name.is_empty() || secret.is_empty() {
            return Err(ChatError::Credential("API key name and secret must be non-empty".to_string()));
        }
        Ok(Self {
            name: name.to_string(),
            secret: secret.to_string(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiKey").field("name", &self.name).finish_non_exhaustive()
    }
}

/// Signed token request (opaque to the chat core, passed through to the transport)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenRequest {
    pub key_name: String,
    pub client_id: String,
    /// Milliseconds
    pub ttl: u64,
    /// Unix milliseconds
    pub timestamp: i64,
    pub nonce: String,
    pub capability: String,
    pub mac: String,
}

impl TokenRequest {
    fn signing_input(&self) -> String {
        format!(
            "{}\n{}\n{}\n{}\n{}\n{}\n",
            self.key_name, self.ttl, self.capability, self.client_id, self.timestamp, self.nonce
        )
    }
}

/// Creates and verifies token requests for one key
#[derive(Debug, Clone)]
pub struct TokenIssuer {
    key: ApiKey,
    ttl: Duration,
}

impl TokenIssuer {
    pub fn new(key: ApiKey, ttl: Duration) -> Self {
        Self { key, ttl }
    }

    /// Build the issuer from an optional `name:secret` string
    pub fn from_config(api_key: Option<&str>, ttl: Duration) -> Result<Self> {
        let raw = api_key.ok_or_else(|| ChatError::Credential("API key not configured".to_string()))?;
        Ok(Self::new(ApiKey::parse(raw)?, ttl))
    }

    /// Create a signed token request scoped to `client_id`
    pub fn create_token_request(&self, client_id: &str) -> Result<TokenRequest> {
        if client_id.is_empty() {
            return Err(ChatError::Credential("Client ID is required".to_string()));
        }

        let nonce: u64 = rand::thread_rng().gen();
        let mut request = TokenRequest {
            key_name: self.key.name.clone(),
            client_id: client_id.to_string(),
            ttl: self.ttl.as_millis() as u64,
            timestamp: chrono::Utc::now().timestamp_millis(),
            nonce: format!("{:016x}", nonce),
            capability: DEFAULT_CAPABILITY.to_string(),
            mac: String::new(),
        };
        request.mac = self.sign(&request)?;
        debug!("Issued token request for {}", client_id);
        Ok(request)
    }

    /// Check MAC, key name and age. `now_ms` is unix milliseconds.
    pub fn verify(&self, request: &TokenRequest, now_ms: i64) -> Result<()> {
        if request.key_name != self.key.name {
            return Err(ChatError::Credential(format!("Unknown key name: {}", request.key_name)));
        }
        if request.client_id.is_empty() {
            return Err(ChatError::Credential("Token request has no client id".to_string()));
        }

        let provided = general_purpose::STANDARD
            .decode(&request.mac)
            .map_err(|e| ChatError::Credential(format!("Invalid MAC encoding: {}", e)))?;
        let mut mac = self.keyed_mac()?;
        mac.update(request.signing_input().as_bytes());
        mac.verify_slice(&provided)
            .map_err(|_| ChatError::Credential("Token request signature mismatch".to_string()))?;

        let expires_at = request.timestamp.saturating_add(request.ttl as i64);
        if now_ms > expires_at {
            warn!("Rejected expired token request for {}", request.client_id);
            return Err(ChatError::Credential("Token request expired".to_string()));
        }
        Ok(())
    }

    fn sign(&self, request: &TokenRequest) -> Result<String> {
        let mut mac = self.keyed_mac()?;
        mac.update(request.signing_input().as_bytes());
        Ok(general_purpose::STANDARD.encode(mac.finalize().into_bytes()))
    }

    fn keyed_mac(&self) -> Result<HmacSha256> {
        HmacSha256::new_from_slice(self.key.secret.as_bytes())
            .map_err(|e| ChatError::Credential(format!("Failed to create token: {}", e)))
    }
}

/// How a client obtains a token request for its identity
#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn fetch(&self, client_id: &str) -> Result<TokenRequest>;
}

/// Issues tokens in process (tests, single-binary deployments)
pub struct LocalCredentials {
    issuer: Option<TokenIssuer>,
}

impl LocalCredentials {
    pub fn new(issuer: TokenIssuer) -> Self {
        Self { issuer: Some(issuer) }
    }

    /// A source whose key is not configured; every fetch fails
    pub fn unconfigured() -> Self {
        Self { issuer: None }
    }
}

#[async_trait]
impl CredentialSource for LocalCredentials {
    async fn fetch(&self, client_id: &str) -> Result<TokenRequest> {
        match &self.issuer {
            Some(issuer) => issuer.create_token_request(client_id),
            None => Err(ChatError::Credential("API key not configured".to_string())),
        }
    }
}

/// Fetches tokens from the credential endpoint with `POST <auth_url>?clientId=<id>`
pub struct HttpCredentials {
    auth_url: String,
    timeout: Duration,
}

impl HttpCredentials {
    pub fn new(auth_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            auth_url: auth_url.into(),
            timeout,
        }
    }
}

#[async_trait]
impl CredentialSource for HttpCredentials {
    async fn fetch(&self, client_id: &str) -> Result<TokenRequest> {
        let url = format!("{}?clientId={}", self.auth_url, urlencoding::encode(client_id));
        let resp = http_client::send(Method::POST, &url, self.timeout)
            .await
            .map_err(|e| ChatError::Credential(format!("Credential endpoint unreachable: {}", e)))?;

        if resp.status != StatusCode::OK {
            let reason = serde_json::from_slice::<serde_json::Value>(&resp.body)
                .ok()
                .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_string))
                .unwrap_or_else(|| resp.status.to_string());
            return Err(ChatError::Credential(format!(
                "Credential endpoint returned {}: {}",
                resp.status.as_u16(),
                reason
            )));
        }

        serde_json::from_slice(&resp.body)
            .map_err(|e| ChatError::Credential(format!("Malformed token request: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn issuer() -> TokenIssuer {
        TokenIssuer::new(ApiKey::parse("app.key:s3cret").unwrap(), Duration::from_secs(60))
    }

    #[test]
    fn test_api_key_parse() {
        assert!(ApiKey::parse("name:secret").is_ok());
        assert!(ApiKey::parse("nosecret").is_err());
        assert!(ApiKey::parse(":secret").is_err());
        assert!(ApiKey::parse("name:").is_err());
    }

    #[test]
    fn test_issued_request_verifies() {
        let issuer = issuer();
        let req = issuer.create_token_request("alice-1").unwrap();
        assert_eq!(req.client_id, "alice-1");
        assert_eq!(req.key_name, "app.key");
        assert!(!req.mac.is_empty());
        issuer.verify(&req, req.timestamp + 1_000).unwrap();
    }

    #[test]
    fn test_tampered_client_id_rejected() {
        let issuer = issuer();
        let mut req = issuer.create_token_request("alice-1").unwrap();
        req.client_id = "mallory".to_string();
        assert!(issuer.verify(&req, req.timestamp).is_err());
    }

    #[test]
    fn test_other_secret_rejected() {
        let req = issuer().create_token_request("alice-1").unwrap();
        let other = TokenIssuer::new(ApiKey::parse("app.key:different").unwrap(), Duration::from_secs(60));
        assert!(other.verify(&req, req.timestamp).is_err());
    }

    #[test]
    fn test_expired_request_rejected() {
        let issuer = issuer();
        let req = issuer.create_token_request("alice-1").unwrap();
        assert!(issuer.verify(&req, req.timestamp + 60_001).is_err());
    }

    #[test]
    fn test_empty_client_id_rejected() {
        assert!(matches!(
            issuer().create_token_request(""),
            Err(ChatError::Credential(_))
        ));
    }

    #[tokio::test]
    async fn test_unconfigured_source_fails() {
        let source = LocalCredentials::unconfigured();
        assert!(source.fetch("alice-1").await.is_err());
    }
}
