/// Minimal HTTP/1.1 client over hyper, used for credential fetches and the load harness
use crate::error::{ChatError, Result};
use http_body_util::{BodyExt, Empty};
use hyper::client::conn::http1;
use hyper::{Method, Request, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

/// Response status and collected body
#[derive(Debug)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub body: bytes::Bytes,
}

/// Send one request on a fresh connection and collect the whole body.
/// Only plain `http://` URLs are supported.
pub async fn send(method: Method, url: &str, deadline: Duration) -> Result<HttpResponse> {
    let uri: Uri = url
        .parse()
        .map_err(|e| ChatError::Config(format!("Invalid URL {}: {}", url, e)))?;
    if uri.scheme_str().is_some_and(|s| s != "http") {
        return Err(ChatError::Config(format!("Unsupported URL scheme: {}", url)));
    }
    let host = uri
        .host()
        .ok_or_else(|| ChatError::Config(format!("URL has no host: {}", url)))?
        .to_string();
    let port = uri.port_u16().unwrap_or(80);
    let path = uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    let exchange = async {
        let stream = TcpStream::connect((host.as_str(), port))
            .await
            .map_err(ChatError::Io)?;
        let (mut sender, conn) = http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|e| ChatError::Transport(format!("HTTP handshake failed: {}", e)))?;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!("HTTP client connection closed: {}", e);
            }
        });

        let req = Request::builder()
            .method(method)
            .uri(path)
            .header(hyper::header::HOST, format!("{}:{}", host, port))
            .body(Empty::<bytes::Bytes>::new())
            .map_err(|e| ChatError::Protocol(format!("Failed to build request: {}", e)))?;

        let resp = sender
            .send_request(req)
            .await
            .map_err(|e| ChatError::Transport(format!("HTTP request failed: {}", e)))?;
        let status = resp.status();
        let body = resp
            .into_body()
            .collect()
            .await
            .map_err(|e| ChatError::Transport(format!("HTTP body read failed: {}", e)))?
            .to_bytes();
        Ok(HttpResponse { status, body })
    };

    timeout(deadline, exchange)
        .await
        .map_err(|_| ChatError::Timeout(format!("HTTP request to {} timed out", url)))?
}
