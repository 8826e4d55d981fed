//! The pluggable storage layer.
//!
//! A storage backend persists request/response pairs and streams their
//! bodies in chunks. The cache core depends only on the [`Storage`] and
//! [`AsyncStorage`] traits; [`SqliteStorage`] and [`AsyncSqliteStorage`]
//! are the bundled SQLite-backed implementations.

mod async_sqlite;
mod sqlite;

use std::fmt;

use async_trait::async_trait;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

use crate::error::Result;
use crate::model::{
    Body, CompletePair, IncompletePair, PairMeta, Request, RequestMetadata,
    Response, ResponseMetadata,
};

pub use async_sqlite::AsyncSqliteStorage;
pub use sqlite::SqliteStorage;

/// How [`Storage::update_pair`] computes the replacement pair.
pub enum PairUpdate {
    /// Store this pair as-is.
    Replace(CompletePair),
    /// Derive the new pair from the currently stored one.
    With(Box<dyn FnOnce(CompletePair) -> CompletePair + Send>),
}

impl PairUpdate {
    /// An update computed from the currently stored pair.
    pub fn with<F>(f: F) -> Self
    where
        F: FnOnce(CompletePair) -> CompletePair + Send + 'static,
    {
        PairUpdate::With(Box::new(f))
    }

    pub(crate) fn apply(self, current: CompletePair) -> CompletePair {
        match self {
            PairUpdate::Replace(replacement) => replacement,
            PairUpdate::With(f) => f(current),
        }
    }
}

impl From<CompletePair> for PairUpdate {
    fn from(pair: CompletePair) -> Self {
        PairUpdate::Replace(pair)
    }
}

impl fmt::Debug for PairUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PairUpdate::Replace(pair) => {
                f.debug_tuple("Replace").field(&pair.id).finish()
            }
            PairUpdate::With(_) => f.write_str("With(..)"),
        }
    }
}

/// A blocking storage backend for request/response pairs.
///
/// Implementations must serialize access to their backing connection;
/// all methods take `&self`.
pub trait Storage: Send + Sync {
    /// Persists the request as a new incomplete pair.
    ///
    /// The returned pair's request body is a tee: reading it persists
    /// each chunk to the stream store and yields it to the caller, and
    /// end of stream is recorded with a terminator and a completion
    /// sentinel. A fresh id is allocated unless one is supplied.
    fn create_pair(
        &self,
        request: Request,
        id: Option<Uuid>,
    ) -> Result<IncompletePair>;

    /// Attaches a response to an incomplete pair, making it complete and
    /// indexing it under `key`. The response body is teed like the
    /// request body in [`create_pair`](Storage::create_pair).
    ///
    /// Fails with [`CacheError::NotFound`](crate::CacheError::NotFound)
    /// for an unknown id and
    /// [`CacheError::AlreadyComplete`](crate::CacheError::AlreadyComplete)
    /// if the pair already has a response.
    fn add_response(
        &self,
        pair_id: Uuid,
        response: Response,
        key: &[u8],
    ) -> Result<CompletePair>;

    /// All complete, non-soft-deleted pairs stored under exactly `key`.
    /// Body fields are lazy readers that stream chunks back from the
    /// store.
    fn get_pairs(&self, key: &[u8]) -> Result<Vec<CompletePair>>;

    /// Applies an update to a stored complete pair. Returns `None` when
    /// the pair does not exist or is still incomplete. A changed
    /// `cache_key` is re-indexed; a changed id is refused with
    /// [`CacheError::IdMismatch`](crate::CacheError::IdMismatch).
    fn update_pair(
        &self,
        id: Uuid,
        update: PairUpdate,
    ) -> Result<Option<CompletePair>>;

    /// Soft-deletes a pair. Unknown ids are ignored.
    fn remove(&self, id: Uuid) -> Result<()>;

    /// Scans the store, soft-deleting expired pairs and hard-deleting
    /// pairs that have been soft-deleted beyond the grace period or are
    /// corrupt.
    fn cleanup(&self) -> Result<()>;
}

/// The suspending counterpart of [`Storage`].
#[async_trait]
pub trait AsyncStorage: Send + Sync {
    /// See [`Storage::create_pair`].
    async fn create_pair(
        &self,
        request: Request,
        id: Option<Uuid>,
    ) -> Result<IncompletePair>;

    /// See [`Storage::add_response`].
    async fn add_response(
        &self,
        pair_id: Uuid,
        response: Response,
        key: &[u8],
    ) -> Result<CompletePair>;

    /// See [`Storage::get_pairs`].
    async fn get_pairs(&self, key: &[u8]) -> Result<Vec<CompletePair>>;

    /// See [`Storage::update_pair`].
    async fn update_pair(
        &self,
        id: Uuid,
        update: PairUpdate,
    ) -> Result<Option<CompletePair>>;

    /// See [`Storage::remove`].
    async fn remove(&self, id: Uuid) -> Result<()>;

    /// See [`Storage::cleanup`].
    async fn cleanup(&self) -> Result<()>;
}

/// Which side of a pair a stream row belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StreamKind {
    Request,
    Response,
}

impl StreamKind {
    fn prefix(self) -> &'static str {
        match self {
            StreamKind::Request => "request",
            StreamKind::Response => "response",
        }
    }

    pub(crate) fn chunk_key(self, index: u64) -> String {
        format!("{}_chunk_{index}", self.prefix())
    }

    pub(crate) fn complete_key(self) -> &'static str {
        match self {
            StreamKind::Request => "request_complete",
            StreamKind::Response => "response_complete",
        }
    }
}

/// The persisted form of a pair: everything except the body streams,
/// which live in their own table. The enum tag distinguishes incomplete
/// from complete entries in the serialized blob.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) enum StoredPair {
    Incomplete {
        id: Uuid,
        request: StoredRequest,
        meta: PairMeta,
    },
    Complete {
        id: Uuid,
        request: StoredRequest,
        response: StoredResponse,
        meta: PairMeta,
        cache_key: Vec<u8>,
    },
}

impl StoredPair {
    pub(crate) fn id(&self) -> Uuid {
        match self {
            StoredPair::Incomplete { id, .. }
            | StoredPair::Complete { id, .. } => *id,
        }
    }

    pub(crate) fn meta(&self) -> &PairMeta {
        match self {
            StoredPair::Incomplete { meta, .. }
            | StoredPair::Complete { meta, .. } => meta,
        }
    }

    pub(crate) fn meta_mut(&mut self) -> &mut PairMeta {
        match self {
            StoredPair::Incomplete { meta, .. }
            | StoredPair::Complete { meta, .. } => meta,
        }
    }

    pub(crate) fn request_metadata(&self) -> &RequestMetadata {
        match self {
            StoredPair::Incomplete { request, .. }
            | StoredPair::Complete { request, .. } => &request.metadata,
        }
    }
}

/// Persisted request head. Headers are kept as an ordered list of raw
/// `(name, value)` entries so multi-value fields round-trip through a
/// non-self-describing encoding.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct StoredRequest {
    method: String,
    url: Url,
    headers: Vec<(String, Vec<u8>)>,
    metadata: RequestMetadata,
}

impl StoredRequest {
    pub(crate) fn from_request(request: &Request) -> Self {
        Self {
            method: request.method.to_string(),
            url: request.url.clone(),
            headers: headers_to_rows(&request.headers),
            metadata: request.metadata.clone(),
        }
    }

    pub(crate) fn into_request(self) -> Result<Request> {
        Ok(Request {
            method: self.method.parse::<Method>()?,
            url: self.url,
            headers: rows_to_headers(self.headers)?,
            body: Body::empty(),
            metadata: self.metadata,
        })
    }
}

/// Persisted response head.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct StoredResponse {
    status: u16,
    headers: Vec<(String, Vec<u8>)>,
    metadata: ResponseMetadata,
}

impl StoredResponse {
    pub(crate) fn from_response(response: &Response) -> Self {
        Self {
            status: response.status.as_u16(),
            headers: headers_to_rows(&response.headers),
            metadata: response.metadata,
        }
    }

    pub(crate) fn into_response(self) -> Result<Response> {
        Ok(Response {
            status: StatusCode::from_u16(self.status)?,
            headers: rows_to_headers(self.headers)?,
            body: Body::empty(),
            metadata: self.metadata,
        })
    }
}

pub(crate) fn pack_pair(pair: &StoredPair) -> Result<Vec<u8>> {
    Ok(bincode::serialize(pair)?)
}

pub(crate) fn unpack_pair(data: &[u8]) -> Result<StoredPair> {
    Ok(bincode::deserialize(data)?)
}

fn headers_to_rows(headers: &HeaderMap) -> Vec<(String, Vec<u8>)> {
    headers
        .iter()
        .map(|(name, value)| {
            (name.as_str().to_string(), value.as_bytes().to_vec())
        })
        .collect()
}

fn rows_to_headers(rows: Vec<(String, Vec<u8>)>) -> Result<HeaderMap> {
    let mut headers = HeaderMap::with_capacity(rows.len());
    for (name, value) in rows {
        headers.append(
            HeaderName::try_from(name.as_str())?,
            HeaderValue::from_bytes(&value)?,
        );
    }
    Ok(headers)
}
