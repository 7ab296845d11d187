//! Origin forwarding and response buffering.
//!
//! The handler talks to the upstream GraphQL server through the
//! [`OriginCaller`] trait and writes to clients through [`ResponseSink`],
//! keeping the HTTP plumbing swappable (and mockable in tests). Buffered
//! origin responses borrow their storage from a shared [`BufferPool`];
//! every acquired buffer returns to the pool when the response is dropped,
//! on every exit path.

use crate::error::{Error, Result};
use async_trait::async_trait;
use http::HeaderMap;
use parking_lot::Mutex;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use url::Url;

/// Pool of reusable byte buffers for response recording.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<Mutex<Vec<Vec<u8>>>>,
    max_pooled: usize,
}

impl BufferPool {
    /// Create a pool retaining at most `max_pooled` idle buffers.
    pub fn new(max_pooled: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Vec::new())),
            max_pooled,
        }
    }

    /// Take a cleared buffer from the pool, or allocate a fresh one.
    pub fn acquire(&self) -> PooledBuffer {
        let buffer = self.inner.lock().pop().unwrap_or_default();
        PooledBuffer {
            buffer: Some(buffer),
            pool: Arc::clone(&self.inner),
            max_pooled: self.max_pooled,
        }
    }

    /// Number of idle buffers currently pooled.
    pub fn idle_count(&self) -> usize {
        self.inner.lock().len()
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(64)
    }
}

/// A buffer on loan from a [`BufferPool`]. Returns to the pool on drop.
pub struct PooledBuffer {
    buffer: Option<Vec<u8>>,
    pool: Arc<Mutex<Vec<Vec<u8>>>>,
    max_pooled: usize,
}

impl Deref for PooledBuffer {
    type Target = Vec<u8>;

    fn deref(&self) -> &Vec<u8> {
        self.buffer.as_ref().expect("buffer present until drop")
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Vec<u8> {
        self.buffer.as_mut().expect("buffer present until drop")
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(mut buffer) = self.buffer.take() {
            buffer.clear();
            let mut pool = self.pool.lock();
            if pool.len() < self.max_pooled {
                pool.push(buffer);
            }
        }
    }
}

/// The request forwarded to the origin.
#[derive(Debug, Clone)]
pub struct OriginRequest {
    /// JSON payload to POST, exactly as the client sent it.
    pub payload: String,
    /// Headers to forward (already filtered by the handler).
    pub headers: HeaderMap,
}

/// A fully buffered origin response.
pub struct OriginResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    buffer: PooledBuffer,
}

impl OriginResponse {
    /// Buffer a response body into pool-backed storage.
    pub fn new(
        status: u16,
        headers: Vec<(String, String)>,
        body: &[u8],
        pool: &BufferPool,
    ) -> Self {
        let mut buffer = pool.acquire();
        buffer.extend_from_slice(body);
        Self {
            status,
            headers,
            buffer,
        }
    }

    pub fn body(&self) -> &[u8] {
        &self.buffer
    }

    /// The body as text, when it is valid UTF-8.
    pub fn body_text(&self) -> Option<&str> {
        std::str::from_utf8(&self.buffer).ok()
    }

    /// First value of a response header, by case-insensitive name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Whether this is a `200 OK` response with an `application/json` media
    /// type, the only shape the cache will record.
    pub fn is_cacheable_payload(&self) -> bool {
        self.status == 200
            && self
                .header("content-type")
                .map(media_type)
                .is_some_and(|mt| mt == "application/json")
    }
}

/// The media type portion of a content-type value, lowercased.
fn media_type(value: &str) -> String {
    value
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

/// Forwards requests to the upstream GraphQL server.
#[async_trait]
pub trait OriginCaller: Send + Sync {
    async fn forward(&self, request: &OriginRequest) -> Result<OriginResponse>;
}

/// Shared reference to an origin caller.
pub type SharedOriginCaller = Arc<dyn OriginCaller>;

/// HTTP origin caller over a pooled reqwest client.
pub struct HttpOrigin {
    client: reqwest::Client,
    endpoint: Url,
    buffers: BufferPool,
}

impl HttpOrigin {
    /// Point at a GraphQL endpoint, e.g. `http://localhost:4000/graphql`.
    pub fn new(endpoint: &str) -> Result<Self> {
        let endpoint = Url::parse(endpoint)
            .map_err(|e| Error::Config(format!("invalid origin endpoint {endpoint}: {e}")))?;

        Ok(Self {
            client: reqwest::Client::new(),
            endpoint,
            buffers: BufferPool::default(),
        })
    }

    /// Use a preconfigured client (timeouts, TLS, proxies).
    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }
}

#[async_trait]
impl OriginCaller for HttpOrigin {
    async fn forward(&self, request: &OriginRequest) -> Result<OriginResponse> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .headers(request.headers.clone())
            .header(http::header::CONTENT_TYPE, "application/json")
            .body(request.payload.clone())
            .send()
            .await?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();

        let body = response.bytes().await?;
        Ok(OriginResponse::new(status, headers, &body, &self.buffers))
    }
}

/// Destination for the response sent back to the client.
pub trait ResponseSink: Send {
    fn write_response(
        &mut self,
        status: u16,
        headers: &[(String, String)],
        body: &[u8],
    ) -> Result<()>;
}

/// Sink that collects the response in memory. The HTTP layer adapts it to
/// the server framework; tests inspect it directly.
#[derive(Debug, Default)]
pub struct BufferedSink {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub written: bool,
}

impl BufferedSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// First value of a written header, by case-insensitive name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

impl ResponseSink for BufferedSink {
    fn write_response(
        &mut self,
        status: u16,
        headers: &[(String, String)],
        body: &[u8],
    ) -> Result<()> {
        if self.written {
            return Err(Error::ClientWrite("response already written".to_string()));
        }
        self.status = status;
        self.headers = headers.to_vec();
        self.body = body.to_vec();
        self.written = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_pool_reuses_capacity() {
        let pool = BufferPool::new(4);
        assert_eq!(pool.idle_count(), 0);

        {
            let mut buffer = pool.acquire();
            buffer.extend_from_slice(b"hello");
            assert_eq!(&buffer[..], b"hello");
        }
        assert_eq!(pool.idle_count(), 1);

        // The recycled buffer comes back cleared.
        let buffer = pool.acquire();
        assert!(buffer.is_empty());
        assert_eq!(pool.idle_count(), 0);
    }

    #[test]
    fn test_buffer_pool_caps_idle_buffers() {
        let pool = BufferPool::new(1);
        let a = pool.acquire();
        let b = pool.acquire();
        drop(a);
        drop(b);
        assert_eq!(pool.idle_count(), 1);
    }

    #[test]
    fn test_cacheable_payload_detection() {
        let pool = BufferPool::default();
        let json = |status: u16, ct: &str| {
            OriginResponse::new(
                status,
                vec![("Content-Type".to_string(), ct.to_string())],
                b"{}",
                &pool,
            )
        };

        assert!(json(200, "application/json").is_cacheable_payload());
        assert!(json(200, "application/json; charset=utf-8").is_cacheable_payload());
        assert!(json(200, "Application/JSON").is_cacheable_payload());
        assert!(!json(500, "application/json").is_cacheable_payload());
        assert!(!json(200, "text/html").is_cacheable_payload());

        let no_ct = OriginResponse::new(200, Vec::new(), b"{}", &pool);
        assert!(!no_ct.is_cacheable_payload());
    }

    #[test]
    fn test_origin_response_accessors() {
        let pool = BufferPool::default();
        let response = OriginResponse::new(
            200,
            vec![("X-Test".to_string(), "1".to_string())],
            br#"{"data":{}}"#,
            &pool,
        );

        assert_eq!(response.header("x-test"), Some("1"));
        assert_eq!(response.header("missing"), None);
        assert_eq!(response.body_text(), Some(r#"{"data":{}}"#));
    }

    #[test]
    fn test_buffered_sink_single_write() {
        let mut sink = BufferedSink::new();
        sink.write_response(200, &[("x-cache".to_string(), "HIT".to_string())], b"body")
            .unwrap();

        assert!(sink.written);
        assert_eq!(sink.status, 200);
        assert_eq!(sink.header("X-Cache"), Some("HIT"));
        assert_eq!(sink.body_text(), "body");

        assert!(sink.write_response(200, &[], b"again").is_err());
    }

    #[test]
    fn test_http_origin_rejects_bad_endpoint() {
        assert!(HttpOrigin::new("not a url").is_err());
    }
}
