/// Credential endpoint: HTTP server handing out signed token requests
///
/// Endpoints:
///   POST    /api/ably-auth?clientId=<id>   token request for <id>
///   GET     /api/ably-auth[?clientId=<id>] token request, `anonymous` by default
///   GET     /                              home page
///   OPTIONS *                              CORS preflight
use crate::auth::{TokenIssuer, ANONYMOUS_CLIENT_ID};
use crate::config::Config;
use crate::error::{ChatError, Result};
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

pub const AUTH_PATH: &str = "/api/ably-auth";

type Resp = Response<BoxBody<bytes::Bytes, Infallible>>;

const HOME_PAGE: &str = r#"<!doctype html>
<html lang="en">
<head><meta charset="utf-8"><title>ChatKu</title></head>
<body>
<h1>ChatKu</h1>
<p>Realtime chat room. Connect with the <code>chat</code> client.</p>
</body>
</html>
"#;

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn cors_headers(builder: hyper::http::response::Builder) -> hyper::http::response::Builder {
    builder
        .header("Access-Control-Allow-Origin", "*")
        .header("Access-Control-Allow-Methods", "GET, POST, OPTIONS")
        .header("Access-Control-Allow-Headers", "Content-Type")
}

fn body_resp(status: StatusCode, content_type: &str, body: Vec<u8>) -> Resp {
    cors_headers(Response::builder())
        .status(status)
        .header("Content-Type", content_type)
        .body(Full::new(bytes::Bytes::from(body)).boxed())
        .unwrap_or_else(|_| Response::new(Full::new(bytes::Bytes::new()).boxed()))
}

fn json_resp(status: StatusCode, value: &impl serde::Serialize) -> Resp {
    body_resp(status, "application/json", serde_json::to_vec(value).unwrap_or_default())
}

fn json_err(status: StatusCode, msg: &str) -> Resp {
    json_resp(status, &serde_json::json!({ "error": msg }))
}

fn query_param(query: &str, key: &str) -> Option<String> {
    query.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
        if k != key {
            return None;
        }
        urlencoding::decode(v).ok().map(|v| v.into_owned())
    })
}

// ─── Server ──────────────────────────────────────────────────────────────────

pub struct AuthApi {
    issuer: Option<TokenIssuer>,
}

impl AuthApi {
    /// Without an issuer every token request answers 500
    pub fn new(issuer: Option<TokenIssuer>) -> Arc<Self> {
        Arc::new(Self { issuer })
    }

    pub fn from_config(config: &Config) -> Arc<Self> {
        let issuer = match TokenIssuer::from_config(config.api_key.as_deref(), config.token_ttl) {
            Ok(issuer) => Some(issuer),
            Err(e) => {
                warn!("Credential endpoint has no signing key: {}", e);
                None
            }
        };
        Self::new(issuer)
    }

    pub async fn start(self: Arc<Self>, addr: SocketAddr) -> Result<()> {
        let listener = TcpListener::bind(addr).await.map_err(ChatError::Io)?;
        self.serve(listener).await
    }

    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        info!("Credential endpoint on http://{}{}", listener.local_addr()?, AUTH_PATH);

        loop {
            match listener.accept().await {
                Ok((stream, _peer)) => {
                    let io = TokioIo::new(stream);
                    let api = self.clone();
                    tokio::spawn(async move {
                        let svc = service_fn(move |req: Request<hyper::body::Incoming>| {
                            let api = api.clone();
                            async move { Ok::<_, Infallible>(api.handle(&req)) }
                        });
                        if let Err(e) = http1::Builder::new().serve_connection(io, svc).await {
                            if !e.is_incomplete_message() {
                                error!("Credential endpoint connection error: {:?}", e);
                            }
                        }
                    });
                }
                Err(e) => error!("Credential endpoint accept error: {}", e),
            }
        }
    }

    /// Route one request. The body is never read.
    pub fn handle<B>(&self, req: &Request<B>) -> Resp {
        let method = req.method();
        let path = req.uri().path();
        let query = req.uri().query().unwrap_or("");
        debug!("{} {}", method, path);

        if method == Method::OPTIONS {
            return cors_headers(Response::builder())
                .status(StatusCode::NO_CONTENT)
                .body(Full::new(bytes::Bytes::new()).boxed())
                .unwrap_or_else(|_| Response::new(Full::new(bytes::Bytes::new()).boxed()));
        }

        match (method, path) {
            (&Method::GET, "/") => body_resp(StatusCode::OK, "text/html; charset=utf-8", HOME_PAGE.as_bytes().to_vec()),
            (&Method::POST, AUTH_PATH) => match query_param(query, "clientId").filter(|id| !id.is_empty()) {
                Some(client_id) => self.issue(&client_id),
                None => json_err(StatusCode::BAD_REQUEST, "Client ID is required"),
            },
            (&Method::GET, AUTH_PATH) => {
                let client_id = query_param(query, "clientId")
                    .filter(|id| !id.is_empty())
                    .unwrap_or_else(|| ANONYMOUS_CLIENT_ID.to_string());
                self.issue(&client_id)
            }
            (_, AUTH_PATH) => json_err(StatusCode::METHOD_NOT_ALLOWED, "method not allowed"),
            _ => json_err(StatusCode::NOT_FOUND, "not found"),
        }
    }

    fn issue(&self, client_id: &str) -> Resp {
        let Some(issuer) = &self.issuer else {
            return json_err(StatusCode::INTERNAL_SERVER_ERROR, "API key not configured");
        };
        match issuer.create_token_request(client_id) {
            Ok(token) => json_resp(StatusCode::OK, &token),
            Err(e) => {
                error!("Token creation for {} failed: {}", client_id, e);
                json_err(StatusCode::INTERNAL_SERVER_ERROR, "Failed to create token")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::ApiKey;
    use std::time::Duration;

    fn api() -> Arc<AuthApi> {
        AuthApi::new(Some(TokenIssuer::new(
            ApiKey::parse("app.key:secret").unwrap(),
            Duration::from_secs(3600),
        )))
    }

    fn request(method: Method, uri: &str) -> Request<()> {
        Request::builder().method(method).uri(uri).body(()).unwrap()
    }

    async fn body_json(resp: Resp) -> serde_json::Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_post_issues_for_client() {
        let resp = api().handle(&request(Method::POST, "/api/ably-auth?clientId=alice-1"));
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["clientId"], "alice-1");
        assert!(!json["mac"].as_str().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_post_requires_client_id() {
        for uri in ["/api/ably-auth", "/api/ably-auth?clientId=", "/api/ably-auth?other=1"] {
            let resp = api().handle(&request(Method::POST, uri));
            assert_eq!(resp.status(), StatusCode::BAD_REQUEST, "{}", uri);
            assert_eq!(body_json(resp).await["error"], "Client ID is required");
        }
    }

    #[tokio::test]
    async fn test_missing_key_is_500() {
        let api = AuthApi::new(None);
        let resp = api.handle(&request(Method::POST, "/api/ably-auth?clientId=alice-1"));
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body_json(resp).await["error"], "API key not configured");

        let resp = api.handle(&request(Method::GET, "/api/ably-auth"));
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_get_defaults_to_anonymous() {
        let json = body_json(api().handle(&request(Method::GET, "/api/ably-auth"))).await;
        assert_eq!(json["clientId"], ANONYMOUS_CLIENT_ID);

        let json = body_json(api().handle(&request(Method::GET, "/api/ably-auth?clientId=vu1-it2"))).await;
        assert_eq!(json["clientId"], "vu1-it2");
    }

    #[test]
    fn test_preflight_and_home() {
        let resp = api().handle(&request(Method::OPTIONS, "/api/ably-auth"));
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
        assert_eq!(resp.headers()["Access-Control-Allow-Origin"], "*");

        assert_eq!(api().handle(&request(Method::GET, "/")).status(), StatusCode::OK);
        assert_eq!(api().handle(&request(Method::GET, "/nope")).status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_query_param_decoding() {
        assert_eq!(query_param("clientId=a%20b&x=1", "clientId"), Some("a b".to_string()));
        assert_eq!(query_param("x=1", "clientId"), None);
        assert_eq!(query_param("clientId", "clientId"), Some(String::new()));
    }
}
