/// Credential endpoint over real HTTP, and the full join path through it
extern crate chatku_core;

use chatku_core::auth::{ApiKey, CredentialSource, HttpCredentials, TokenIssuer};
use chatku_core::auth_api::AuthApi;
use chatku_core::chat::{ConnectionState, Session};
use chatku_core::http_client;
use chatku_core::realtime::broker::Broker;
use chatku_core::realtime::{Hub, TcpTransport};
use chatku_core::{ChatError, ClientIdentity, Config};
use hyper::{Method, StatusCode};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

const WAIT: Duration = Duration::from_secs(5);

fn issuer() -> TokenIssuer {
    TokenIssuer::new(ApiKey::parse("test.key:secret").unwrap(), Duration::from_secs(3600))
}

async fn start_api(issuer: Option<TokenIssuer>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(AuthApi::new(issuer).serve(listener));
    format!("http://{}", addr)
}

#[tokio::test]
async fn test_post_with_empty_client_id_is_400() {
    let base = start_api(Some(issuer())).await;
    let resp = http_client::send(Method::POST, &format!("{}/api/ably-auth?clientId=", base), WAIT)
        .await
        .unwrap();
    assert_eq!(resp.status, StatusCode::BAD_REQUEST);
    let body: serde_json::Value = serde_json::from_slice(&resp.body).unwrap();
    assert_eq!(body["error"], "Client ID is required");
}

#[tokio::test]
async fn test_valid_id_without_key_is_500() {
    let base = start_api(None).await;
    let resp = http_client::send(Method::POST, &format!("{}/api/ably-auth?clientId=alice-1", base), WAIT)
        .await
        .unwrap();
    assert_eq!(resp.status, StatusCode::INTERNAL_SERVER_ERROR);

    let credentials = HttpCredentials::new(format!("{}/api/ably-auth", base), WAIT);
    match credentials.fetch("alice-1").await {
        Err(ChatError::Credential(reason)) => assert!(reason.contains("API key not configured")),
        other => panic!("expected credential error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_http_credentials_fetch_verifiable_token() {
    let base = start_api(Some(issuer())).await;
    let credentials = HttpCredentials::new(format!("{}/api/ably-auth", base), WAIT);
    let token = credentials.fetch("alice 1").await.unwrap();
    assert_eq!(token.client_id, "alice 1");
    issuer().verify(&token, token.timestamp).unwrap();
}

#[tokio::test]
async fn test_home_page_and_anonymous_get() {
    let base = start_api(Some(issuer())).await;
    let home = http_client::send(Method::GET, &format!("{}/", base), WAIT).await.unwrap();
    assert_eq!(home.status, StatusCode::OK);
    assert!(!home.body.is_empty());

    let anon = http_client::send(Method::GET, &format!("{}/api/ably-auth", base), WAIT)
        .await
        .unwrap();
    let body: serde_json::Value = serde_json::from_slice(&anon.body).unwrap();
    assert_eq!(body["clientId"], "anonymous");
    assert!(!body["mac"].as_str().unwrap().is_empty());
}

#[tokio::test]
async fn test_join_through_endpoint_and_broker() {
    let base = start_api(Some(issuer())).await;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let config = Config {
        broker_addr: listener.local_addr().unwrap().to_string(),
        auth_url: format!("{}/api/ably-auth", base),
        ..Config::default()
    };
    let hub = Hub::new(config.channel_name.clone(), config.history_capacity, Some(issuer()));
    tokio::spawn(Arc::new(Broker::new(hub.clone(), &config)).serve(listener));

    let credentials: Arc<dyn CredentialSource> = Arc::new(HttpCredentials::new(config.auth_url.clone(), WAIT));
    let transport = Arc::new(TcpTransport::new(&config, credentials));
    let session = Session::join(transport, ClientIdentity::new("alice-1", "Alice"), &config)
        .await
        .unwrap();

    let mut state = session.observe_state().await.unwrap();
    state.wait_for(ConnectionState::Connected, WAIT).await.unwrap();
    assert_eq!(session.roster().len(), 1);
    assert_eq!(hub.member_count().await, 1);

    session.leave().await;
}

#[tokio::test]
async fn test_endpoint_down_fails_connection() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let unused = listener.local_addr().unwrap();
    drop(listener);

    let config = Config {
        broker_addr: "127.0.0.1:1".to_string(),
        auth_url: format!("http://{}/api/ably-auth", unused),
        ..Config::default()
    };
    let credentials: Arc<dyn CredentialSource> = Arc::new(HttpCredentials::new(config.auth_url.clone(), WAIT));
    let transport = Arc::new(TcpTransport::new(&config, credentials));
    let session = Session::join(transport, ClientIdentity::new("alice-1", "Alice"), &config)
        .await
        .unwrap();

    let mut state = session.observe_state().await.unwrap();
    state.wait_for(ConnectionState::Failed, WAIT).await.unwrap();
    assert!(session.roster().is_empty());
}
