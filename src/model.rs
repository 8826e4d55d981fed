//! The internal request/response model.
//!
//! These types are deliberately independent of any HTTP client library:
//! adapters translate library-native requests and responses into this
//! model at the boundary, and the cache core only ever sees these. Bodies
//! are move-once lazy sequences of byte chunks, in either a blocking or a
//! suspending flavor.

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use http::{HeaderMap, Method, StatusCode};
use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

use crate::error::{CacheError, Result};

/// Grace period, in seconds, before a soft-deleted or abandoned pair may
/// be removed from the backing store.
pub(crate) const REAP_GRACE_SECS: f64 = 3600.0;

/// A blocking body: an iterator of owned byte chunks.
pub type ChunkIter = Box<dyn Iterator<Item = Result<Bytes>> + Send>;

/// A suspending body: a stream of owned byte chunks.
pub type ChunkStream = BoxStream<'static, Result<Bytes>>;

/// A finite, non-restartable sequence of body chunks.
///
/// A body is consumed exactly once. Reading a body that was handed out by
/// the storage layer persists its chunks as a side effect, so dropping a
/// body unread leaves a partial stream behind (the cleanup scan reaps
/// those).
pub enum Body {
    /// A fully buffered body. The default is an empty buffer.
    Full(Bytes),
    /// A lazily produced body for blocking callers.
    Iter(ChunkIter),
    /// A lazily produced body for suspending callers.
    Stream(ChunkStream),
}

impl Body {
    /// An empty body.
    #[must_use]
    pub fn empty() -> Self {
        Body::Full(Bytes::new())
    }

    /// A fully buffered body.
    pub fn full(data: impl Into<Bytes>) -> Self {
        Body::Full(data.into())
    }

    /// A lazy blocking body.
    pub fn iter<I>(iter: I) -> Self
    where
        I: Iterator<Item = Result<Bytes>> + Send + 'static,
    {
        Body::Iter(Box::new(iter))
    }

    /// A lazy suspending body.
    pub fn stream<S>(stream: S) -> Self
    where
        S: futures::Stream<Item = Result<Bytes>> + Send + 'static,
    {
        Body::Stream(stream.boxed())
    }

    /// The buffered contents, if this body is fully buffered.
    #[must_use]
    pub fn buffered(&self) -> Option<&Bytes> {
        match self {
            Body::Full(data) => Some(data),
            _ => None,
        }
    }

    /// Consume the body as a blocking chunk iterator.
    ///
    /// Fails with [`CacheError::BodyFlavor`] if the body is a suspending
    /// stream, which cannot be drained without an executor.
    pub fn into_chunk_iter(self) -> Result<ChunkIter> {
        match self {
            Body::Full(data) if data.is_empty() => {
                Ok(Box::new(std::iter::empty()))
            }
            Body::Full(data) => Ok(Box::new(std::iter::once(Ok(data)))),
            Body::Iter(iter) => Ok(iter),
            Body::Stream(_) => Err(CacheError::BodyFlavor),
        }
    }

    /// Consume the body as a chunk stream. All flavors convert: a
    /// blocking iterator is driven inline.
    #[must_use]
    pub fn into_chunk_stream(self) -> ChunkStream {
        match self {
            Body::Full(data) if data.is_empty() => stream::empty().boxed(),
            Body::Full(data) => stream::once(async move { Ok(data) }).boxed(),
            Body::Iter(iter) => stream::iter(iter).boxed(),
            Body::Stream(stream) => stream,
        }
    }

    /// Drain the body into a single buffer (blocking flavors only).
    pub fn into_bytes(self) -> Result<Bytes> {
        match self {
            Body::Full(data) => Ok(data),
            other => {
                let mut buf = Vec::new();
                for chunk in other.into_chunk_iter()? {
                    buf.extend_from_slice(&chunk?);
                }
                Ok(buf.into())
            }
        }
    }

    /// Drain the body into a single buffer, suspending as needed.
    pub async fn into_bytes_async(self) -> Result<Bytes> {
        let mut stream = self.into_chunk_stream();
        let mut buf = Vec::new();
        while let Some(chunk) = stream.next().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(buf.into())
    }
}

impl Default for Body {
    fn default() -> Self {
        Body::Full(Bytes::new())
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Body::Full(data) => {
                f.debug_tuple("Full").field(&data.len()).finish()
            }
            Body::Iter(_) => f.write_str("Iter(..)"),
            Body::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// Cache-control hints carried on a request, outside its headers.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Deserialize, Serialize,
)]
pub struct RequestMetadata {
    /// Remove the cached response this many seconds after it was stored,
    /// overriding the storage default.
    pub ttl: Option<f64>,
    /// When true, serving this entry from cache resets its TTL clock.
    pub refresh_ttl_on_access: bool,
    /// When true, handle this request on the rule-ignoring path
    /// regardless of the configured options.
    pub spec_ignore: bool,
    /// When true, the cache key incorporates a SHA-256 digest of the
    /// request body in addition to the URL.
    pub body_key: bool,
}

/// Observable cache effects recorded on a response.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize,
)]
pub struct ResponseMetadata {
    /// The response was served from the cache.
    pub from_cache: bool,
    /// The response was revalidated with the origin server.
    pub revalidated: bool,
    /// The caching rules were bypassed for this exchange.
    pub spec_ignored: bool,
    /// The response was written to the cache.
    pub stored: bool,
}

/// An HTTP request in the cache's internal representation.
#[derive(Debug)]
pub struct Request {
    /// Request method
    pub method: Method,
    /// Request URL
    pub url: Url,
    /// Request headers
    pub headers: HeaderMap,
    /// Request body
    pub body: Body,
    /// Cache-control hints for this request
    pub metadata: RequestMetadata,
}

impl Request {
    /// Creates a request with empty headers, body, and metadata.
    #[must_use]
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: Body::empty(),
            metadata: RequestMetadata::default(),
        }
    }

    /// Replaces the body, returning the modified request.
    #[must_use]
    pub fn with_body(mut self, body: Body) -> Self {
        self.body = body;
        self
    }

    /// Clones everything except the body, which is left empty.
    #[must_use]
    pub fn clone_head(&self) -> Self {
        Self {
            method: self.method.clone(),
            url: self.url.clone(),
            headers: self.headers.clone(),
            body: Body::empty(),
            metadata: self.metadata.clone(),
        }
    }

    /// Splits off a sendable request carrying the body, leaving the head
    /// behind for the storability decisions that follow the exchange.
    pub(crate) fn take_for_send(&mut self) -> Request {
        let body = std::mem::take(&mut self.body);
        self.clone_head().with_body(body)
    }
}

/// An HTTP response in the cache's internal representation.
#[derive(Debug)]
pub struct Response {
    /// Response status code
    pub status: StatusCode,
    /// Response headers
    pub headers: HeaderMap,
    /// Response body
    pub body: Body,
    /// Cache effects observed while producing this response
    pub metadata: ResponseMetadata,
}

impl Response {
    /// Creates a response with empty headers, body, and metadata.
    #[must_use]
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Body::empty(),
            metadata: ResponseMetadata::default(),
        }
    }

    /// Replaces the body, returning the modified response.
    #[must_use]
    pub fn with_body(mut self, body: Body) -> Self {
        self.body = body;
        self
    }

    /// Clones everything except the body, which is left empty.
    #[must_use]
    pub fn clone_head(&self) -> Self {
        Self {
            status: self.status,
            headers: self.headers.clone(),
            body: Body::empty(),
            metadata: self.metadata,
        }
    }
}

/// Book-keeping shared by complete and incomplete pairs.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct PairMeta {
    /// Unix timestamp at which the pair was created (or last refreshed).
    pub created_at: f64,
    /// Unix timestamp at which the pair was soft-deleted, if it was.
    pub deleted_at: Option<f64>,
}

impl PairMeta {
    /// Metadata stamped with the current time.
    #[must_use]
    pub fn new() -> Self {
        Self::at(unix_now())
    }

    /// Metadata stamped with an explicit creation time.
    #[must_use]
    pub fn at(created_at: f64) -> Self {
        Self { created_at, deleted_at: None }
    }

    /// The creation timestamp as a [`SystemTime`].
    #[must_use]
    pub fn created_time(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs_f64(self.created_at.max(0.0))
    }

    /// Whether the pair has been soft-deleted.
    #[must_use]
    pub fn is_soft_deleted(&self) -> bool {
        self.deleted_at.is_some_and(|at| at > 0.0)
    }

    /// Stamps the soft-delete timestamp. Idempotent: the first deletion
    /// time is retained on repeated calls.
    pub fn mark_deleted(&mut self, now: f64) {
        if self.deleted_at.is_none() {
            self.deleted_at = Some(now);
        }
    }

    /// Whether the pair has been soft-deleted for longer than the grace
    /// period and may be removed from the backing store.
    #[must_use]
    pub fn safe_to_hard_delete(&self, now: f64) -> bool {
        self.deleted_at.is_some_and(|at| at + REAP_GRACE_SECS < now)
    }
}

impl Default for PairMeta {
    fn default() -> Self {
        Self::new()
    }
}

/// A stored request that does not yet have a response attached.
#[derive(Debug)]
pub struct IncompletePair {
    /// Unique identifier of the pair for the lifetime of the store.
    pub id: Uuid,
    /// The captured request.
    pub request: Request,
    /// Pair book-keeping.
    pub meta: PairMeta,
}

/// A stored request together with its response, retrievable by cache key.
#[derive(Debug)]
pub struct CompletePair {
    /// Unique identifier of the pair for the lifetime of the store.
    pub id: Uuid,
    /// The captured request.
    pub request: Request,
    /// The response attached to the request.
    pub response: Response,
    /// Pair book-keeping.
    pub meta: PairMeta,
    /// The opaque retrieval key this pair is indexed under.
    pub cache_key: Vec<u8>,
}

/// Current Unix time in seconds.
pub(crate) fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}
