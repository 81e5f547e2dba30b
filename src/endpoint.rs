//! Transport descriptors for reaching in-sandbox services.
//!
//! A sandbox agent (or a proxy admin surface) is reachable either over a
//! Unix-domain socket on the control host or over an HTTP base URL on a
//! remote container host. The core treats both uniformly: one endpoint
//! type, one client.

use anyhow::{Context, Result, bail};
use bytes::Bytes;
use futures_util::{Stream, TryStreamExt};
use http_body_util::{BodyExt, Full};
use hyper::{Method, Request, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::time::Duration;
use tokio::net::UnixStream;

/// How to reach a service: a Unix socket path on this host, or an HTTP
/// base URL. Serialized as a single string so it round-trips through
/// the registry hash unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEndpoint {
    Unix(PathBuf),
    Http(String),
}

impl TransportEndpoint {
    /// Parse the string form: `unix:///path/to.sock` or an http(s) URL.
    pub fn parse(s: &str) -> Result<Self> {
        if let Some(path) = s.strip_prefix("unix://") {
            if path.is_empty() {
                bail!("empty unix endpoint: {s:?}");
            }
            return Ok(TransportEndpoint::Unix(PathBuf::from(path)));
        }
        if s.starts_with("http://") || s.starts_with("https://") {
            return Ok(TransportEndpoint::Http(s.trim_end_matches('/').to_string()));
        }
        bail!("unrecognized endpoint: {s:?}")
    }

    pub fn unix(path: impl AsRef<Path>) -> Self {
        TransportEndpoint::Unix(path.as_ref().to_path_buf())
    }
}

impl std::fmt::Display for TransportEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportEndpoint::Unix(path) => write!(f, "unix://{}", path.display()),
            TransportEndpoint::Http(url) => write!(f, "{}", url),
        }
    }
}

/// A byte stream from either transport, normalized to io errors.
pub type ByteStream = Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send>>;

/// Response to a raw request: status, selected headers, full body.
#[derive(Debug)]
pub struct RawResponse {
    pub status: StatusCode,
    pub headers: HashMap<String, String>,
    pub body: Bytes,
}

/// HTTP client that speaks to either endpoint flavor. HTTP endpoints go
/// through a pooled reqwest client; Unix endpoints get a fresh http1
/// handshake per request.
#[derive(Clone)]
pub struct EndpointClient {
    http: reqwest::Client,
}

impl Default for EndpointClient {
    fn default() -> Self {
        Self::new()
    }
}

impl EndpointClient {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }

    /// POST a JSON body, decode a JSON response.
    pub async fn post_json<B: Serialize, T: DeserializeOwned>(
        &self,
        endpoint: &TransportEndpoint,
        path: &str,
        body: &B,
    ) -> Result<T> {
        let response = self
            .request_raw(endpoint, Method::POST, path, Some(serde_json::to_vec(body)?))
            .await?;
        if !response.status.is_success() {
            bail!(
                "{} {} returned {}: {}",
                endpoint,
                path,
                response.status,
                String::from_utf8_lossy(&response.body)
            );
        }
        serde_json::from_slice(&response.body)
            .with_context(|| format!("Failed to decode response from {path}"))
    }

    /// POST a JSON body, return the raw response (status + headers +
    /// bytes). Used for `/exec/binary` where the exit code rides in a
    /// header.
    pub async fn post_raw<B: Serialize>(
        &self,
        endpoint: &TransportEndpoint,
        path: &str,
        body: &B,
    ) -> Result<RawResponse> {
        self.request_raw(endpoint, Method::POST, path, Some(serde_json::to_vec(body)?))
            .await
    }

    /// POST a JSON body and return the response body as a byte stream.
    /// Used for SSE.
    pub async fn post_stream<B: Serialize>(
        &self,
        endpoint: &TransportEndpoint,
        path: &str,
        body: &B,
    ) -> Result<ByteStream> {
        match endpoint {
            TransportEndpoint::Http(base) => {
                let response = self
                    .http
                    .post(format!("{base}{path}"))
                    .json(body)
                    .send()
                    .await
                    .with_context(|| format!("Failed to reach {base}{path}"))?;
                if !response.status().is_success() {
                    bail!("{base}{path} returned {}", response.status());
                }
                let stream = response
                    .bytes_stream()
                    .map_err(|e| std::io::Error::other(e.to_string()));
                Ok(Box::pin(stream))
            }
            TransportEndpoint::Unix(socket_path) => {
                let mut sender = self.unix_handshake(socket_path).await?;
                let request = Request::builder()
                    .method(Method::POST)
                    .uri(format!("http://localhost{path}"))
                    .header("Content-Type", "application/json")
                    .header("Accept", "text/event-stream")
                    .body(Full::new(Bytes::from(serde_json::to_vec(body)?)))
                    .context("Failed to build request")?;
                let response = sender
                    .send_request(request)
                    .await
                    .with_context(|| format!("Failed to send request to {}", socket_path.display()))?;
                if !response.status().is_success() {
                    bail!("unix://{} {path} returned {}", socket_path.display(), response.status());
                }
                let stream = response
                    .into_body()
                    .into_data_stream()
                    .map_err(|e| std::io::Error::other(e.to_string()));
                Ok(Box::pin(stream))
            }
        }
    }

    /// GET `/health` with a short deadline. Any 2xx counts as alive.
    pub async fn health(&self, endpoint: &TransportEndpoint) -> bool {
        let probe = self.request_raw(endpoint, Method::GET, "/health", None);
        match tokio::time::timeout(Duration::from_secs(3), probe).await {
            Ok(Ok(response)) => response.status.is_success(),
            _ => false,
        }
    }

    async fn request_raw(
        &self,
        endpoint: &TransportEndpoint,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> Result<RawResponse> {
        match endpoint {
            TransportEndpoint::Http(base) => {
                let url = format!("{base}{path}");
                let mut request = self.http.request(
                    reqwest::Method::from_bytes(method.as_str().as_bytes())
                        .context("Invalid method")?,
                    &url,
                );
                if let Some(bytes) = body {
                    request = request
                        .header("Content-Type", "application/json")
                        .body(bytes);
                }
                let response = request
                    .send()
                    .await
                    .with_context(|| format!("Failed to reach {url}"))?;
                let status =
                    StatusCode::from_u16(response.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
                let headers = response
                    .headers()
                    .iter()
                    .filter_map(|(name, value)| {
                        value
                            .to_str()
                            .ok()
                            .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
                    })
                    .collect();
                let bytes = response.bytes().await.context("Failed to read body")?;
                Ok(RawResponse {
                    status,
                    headers,
                    body: bytes,
                })
            }
            TransportEndpoint::Unix(socket_path) => {
                let mut sender = self.unix_handshake(socket_path).await?;
                let payload = body.unwrap_or_default();
                let request = Request::builder()
                    .method(method)
                    .uri(format!("http://localhost{path}"))
                    .header("Content-Type", "application/json")
                    .header("Accept", "application/json")
                    .body(Full::new(Bytes::from(payload)))
                    .context("Failed to build request")?;
                let response = sender
                    .send_request(request)
                    .await
                    .with_context(|| format!("Failed to send request to {}", socket_path.display()))?;
                let status = response.status();
                let headers = response
                    .headers()
                    .iter()
                    .filter_map(|(name, value)| {
                        value
                            .to_str()
                            .ok()
                            .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
                    })
                    .collect();
                let bytes = response
                    .into_body()
                    .collect()
                    .await
                    .context("Failed to read response body")?
                    .to_bytes();
                Ok(RawResponse {
                    status,
                    headers,
                    body: bytes,
                })
            }
        }
    }

    async fn unix_handshake(
        &self,
        socket_path: &Path,
    ) -> Result<hyper::client::conn::http1::SendRequest<Full<Bytes>>> {
        let stream = UnixStream::connect(socket_path).await.with_context(|| {
            format!("Failed to connect to socket: {}", socket_path.display())
        })?;
        let io = TokioIo::new(stream);
        let (sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .context("Failed to create HTTP connection")?;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                tracing::debug!("unix connection closed: {e:?}");
            }
        });
        Ok(sender)
    }
}
