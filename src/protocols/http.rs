//! HTTP handler
//!
//! Delegates the transport to `reqwest`. The contract with the dispatcher:
//! given method, URL, newline-separated header lines, body and timeout,
//! produce status, headers, body and an error message on transport failure.
//! Success for metrics purposes is transport-ok AND 200 <= status < 400.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::redirect::Policy;
use tracing::{debug, warn};

use super::ProtocolHandler;
use crate::envelope::{status, Protocol, Request, Response};
use crate::types::{EngineError, Result};

/// Maximum redirects to follow
const MAX_REDIRECTS: usize = 5;

/// HTTP/HTTPS handler backed by a shared `reqwest` client.
///
/// Connection keep-alive and pooling are the client library's concern; this
/// handler keeps no registry of its own.
pub struct HttpHandler {
    client: reqwest::Client,
}

impl HttpHandler {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(Policy::limited(MAX_REDIRECTS))
            .build()
            .map_err(|e| EngineError::Internal(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }

    /// Perform one HTTP transaction
    pub async fn perform(
        &self,
        method: &str,
        url: &str,
        headers: &str,
        body: &str,
        timeout_ms: u64,
    ) -> Response {
        let method = match reqwest::Method::from_bytes(method.as_bytes()) {
            Ok(m) => m,
            Err(_) => {
                return Response::failure(
                    Protocol::Http,
                    status::INVALID_STATE,
                    format!("invalid HTTP method: {method}"),
                );
            }
        };

        let mut builder = self
            .client
            .request(method, url)
            .timeout(Duration::from_millis(timeout_ms.max(1)))
            .headers(parse_header_lines(headers));

        if !body.is_empty() {
            builder = builder.body(body.to_string());
        }

        debug!(url, "dispatching HTTP request");

        match builder.send().await {
            Ok(resp) => {
                let status_code = resp.status().as_u16();
                let header_blob = format_header_lines(resp.headers());

                let body_text = match resp.text().await {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(url, error = %e, "failed to read HTTP response body");
                        let mut failed = Response::failure(
                            Protocol::Http,
                            status::INTERNAL,
                            format!("failed to read body: {e}"),
                        );
                        failed.set_headers(header_blob);
                        return failed;
                    }
                };

                let mut out = Response::new(Protocol::Http);
                out.status_code = status_code;
                out.success = (200..400).contains(&status_code);
                out.set_headers(header_blob);
                out.set_body(body_text);
                out
            }
            Err(e) => {
                let code = if e.is_timeout() {
                    status::TIMEOUT
                } else {
                    status::INTERNAL
                };
                Response::failure(Protocol::Http, code, e.to_string())
            }
        }
    }
}

#[async_trait]
impl ProtocolHandler for HttpHandler {
    fn protocol(&self) -> Protocol {
        Protocol::Http
    }

    async fn execute(&self, request: &Request) -> Response {
        self.perform(
            &request.method,
            &request.url,
            &request.headers,
            &request.body,
            request.timeout_ms,
        )
        .await
    }
}

/// Parse a newline-separated headers blob; each line is one `name: value`
/// header. Malformed lines are skipped.
fn parse_header_lines(blob: &str) -> HeaderMap {
    let mut map = HeaderMap::new();
    for line in blob.lines() {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.trim().as_bytes()),
            HeaderValue::from_str(value.trim()),
        ) else {
            continue;
        };
        map.append(name, value);
    }
    map
}

/// Render response headers back into the one-per-line blob format
fn format_header_lines(headers: &HeaderMap) -> String {
    let mut blob = String::new();
    for (name, value) in headers {
        blob.push_str(name.as_str());
        blob.push_str(": ");
        blob.push_str(value.to_str().unwrap_or(""));
        blob.push('\n');
    }
    blob
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// One-shot mock HTTP server returning a canned response
    async fn spawn_mock_server(canned: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            if let Ok((mut stream, _)) = listener.accept().await {
                let mut buf = [0u8; 4096];
                let _ = stream.read(&mut buf).await;
                let _ = stream.write_all(canned.as_bytes()).await;
            }
        });
        format!("http://{addr}")
    }

    #[test]
    fn header_lines_round_trip() {
        let map = parse_header_lines("Content-Type: text/plain\nX-Custom: abc\nnot-a-header");
        assert_eq!(map.len(), 2);
        assert_eq!(map.get("content-type").unwrap(), "text/plain");
        assert_eq!(map.get("x-custom").unwrap(), "abc");
    }

    #[test]
    fn blank_blob_parses_empty() {
        assert!(parse_header_lines("").is_empty());
    }

    #[tokio::test]
    async fn happy_path_returns_body_and_timing() {
        let url =
            spawn_mock_server("HTTP/1.1 200 OK\r\ncontent-length: 2\r\nconnection: close\r\n\r\nhi")
                .await;
        let handler = HttpHandler::new().unwrap();

        let resp = handler.perform("GET", &url, "", "", 1000).await;
        assert_eq!(resp.status_code, 200);
        assert_eq!(resp.body, "hi");
        assert!(resp.success);
        assert!(resp.headers.contains("content-length: 2"));
    }

    #[tokio::test]
    async fn http_error_status_is_failure() {
        let url = spawn_mock_server(
            "HTTP/1.1 503 Service Unavailable\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
        )
        .await;
        let handler = HttpHandler::new().unwrap();

        let resp = handler.perform("GET", &url, "", "", 1000).await;
        assert_eq!(resp.status_code, 503);
        assert!(!resp.success);
    }

    #[tokio::test]
    async fn connection_refused_maps_to_internal() {
        let handler = HttpHandler::new().unwrap();
        // Port 1 on localhost is essentially never listening
        let resp = handler.perform("GET", "http://127.0.0.1:1/", "", "", 1000).await;
        assert!(!resp.success);
        assert_eq!(resp.status_code, status::INTERNAL);
        assert!(!resp.error_message.is_empty());
    }

    #[tokio::test]
    async fn invalid_method_is_caller_error() {
        let handler = HttpHandler::new().unwrap();
        let resp = handler.perform("BAD METHOD", "http://127.0.0.1:1/", "", "", 100).await;
        assert_eq!(resp.status_code, status::INVALID_STATE);
        assert!(!resp.success);
    }
}
