//! Suspending facade over the SQLite store.
//!
//! The state machine and row operations are shared with the blocking
//! [`SqliteStorage`]; this type hops through `spawn_blocking` at every
//! suspension point and re-expresses the body tees as chunk streams so
//! async callers never block the executor on database I/O.

use std::path::Path;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use tokio::task::JoinError;
use uuid::Uuid;

use crate::error::{CacheError, Result};
use crate::model::{
    Body, ChunkStream, CompletePair, IncompletePair, Request, Response,
};
use crate::storage::{
    AsyncStorage, PairUpdate, SqliteStorage, StreamKind,
};

/// An [`AsyncStorage`] implementation backed by SQLite.
#[derive(Debug, Clone)]
pub struct AsyncSqliteStorage {
    inner: SqliteStorage,
}

impl AsyncSqliteStorage {
    /// Opens (or creates) the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self { inner: SqliteStorage::open(path)? })
    }

    /// An in-memory store, mainly useful for tests.
    pub fn in_memory() -> Result<Self> {
        Ok(Self { inner: SqliteStorage::in_memory()? })
    }

    /// Wraps an already-configured blocking store.
    #[must_use]
    pub fn from_blocking(inner: SqliteStorage) -> Self {
        Self { inner }
    }

    /// See [`SqliteStorage::with_default_ttl`].
    #[must_use]
    pub fn with_default_ttl(self, secs: f64) -> Self {
        Self { inner: self.inner.with_default_ttl(secs) }
    }

    /// See [`SqliteStorage::with_cleanup_interval`].
    #[must_use]
    pub fn with_cleanup_interval(self, secs: f64) -> Self {
        Self { inner: self.inner.with_cleanup_interval(secs) }
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(SqliteStorage) -> Result<T> + Send + 'static,
    {
        let storage = self.inner.clone();
        flatten_join(tokio::task::spawn_blocking(move || f(storage)).await)
    }
}

#[async_trait]
impl AsyncStorage for AsyncSqliteStorage {
    async fn create_pair(
        &self,
        request: Request,
        id: Option<Uuid>,
    ) -> Result<IncompletePair> {
        let mut request = request;
        let body = std::mem::take(&mut request.body).into_chunk_stream();
        let pair =
            self.blocking(move |s| s.insert_pair_row(request, id)).await?;
        let teed =
            save_stream(self.inner.clone(), pair.id, StreamKind::Request, body);
        let IncompletePair { id, request, meta } = pair;
        Ok(IncompletePair {
            id,
            request: request.with_body(Body::Stream(teed)),
            meta,
        })
    }

    async fn add_response(
        &self,
        pair_id: Uuid,
        response: Response,
        key: &[u8],
    ) -> Result<CompletePair> {
        let mut response = response;
        let body = std::mem::take(&mut response.body).into_chunk_stream();
        let key = key.to_vec();
        let pair = self
            .blocking(move |s| s.complete_pair_row(pair_id, response, &key))
            .await?;
        let teed = save_stream(
            self.inner.clone(),
            pair.id,
            StreamKind::Response,
            body,
        );
        let CompletePair { id, request, response, meta, cache_key } = pair;
        Ok(CompletePair {
            id,
            request,
            response: response.with_body(Body::Stream(teed)),
            meta,
            cache_key,
        })
    }

    async fn get_pairs(&self, key: &[u8]) -> Result<Vec<CompletePair>> {
        let key = key.to_vec();
        let pairs = self
            .blocking(move |s| {
                s.maybe_cleanup()?;
                s.load_pairs_by_key(&key)
            })
            .await?;
        Ok(pairs
            .into_iter()
            .map(|pair| {
                let request_body = load_stream(
                    self.inner.clone(),
                    pair.id,
                    StreamKind::Request,
                );
                let response_body = load_stream(
                    self.inner.clone(),
                    pair.id,
                    StreamKind::Response,
                );
                let CompletePair { id, request, response, meta, cache_key } =
                    pair;
                CompletePair {
                    id,
                    request: request.with_body(Body::Stream(request_body)),
                    response: response.with_body(Body::Stream(response_body)),
                    meta,
                    cache_key,
                }
            })
            .collect())
    }

    async fn update_pair(
        &self,
        id: Uuid,
        update: PairUpdate,
    ) -> Result<Option<CompletePair>> {
        self.blocking(move |s| s.update_pair_row(id, update)).await
    }

    async fn remove(&self, id: Uuid) -> Result<()> {
        self.blocking(move |s| s.remove_row(id)).await
    }

    async fn cleanup(&self) -> Result<()> {
        self.blocking(|s| s.cleanup_scan()).await
    }
}

fn flatten_join<T>(
    joined: std::result::Result<Result<T>, JoinError>,
) -> Result<T> {
    match joined {
        Ok(result) => result,
        Err(e) => Err(CacheError::General(e.into())),
    }
}

struct TeeState {
    storage: SqliteStorage,
    entry_id: Uuid,
    kind: StreamKind,
    inner: ChunkStream,
    index: u64,
    done: bool,
}

/// Async counterpart of the blocking tee: persists each chunk before
/// yielding it and writes the end-of-stream markers on exhaustion.
fn save_stream(
    storage: SqliteStorage,
    entry_id: Uuid,
    kind: StreamKind,
    inner: ChunkStream,
) -> ChunkStream {
    let state =
        TeeState { storage, entry_id, kind, inner, index: 0, done: false };
    stream::unfold(state, |mut state| async move {
        if state.done {
            return None;
        }
        match state.inner.next().await {
            Some(Ok(chunk)) => {
                let storage = state.storage.clone();
                let (entry_id, kind, index) =
                    (state.entry_id, state.kind, state.index);
                let data = chunk.clone();
                let written = tokio::task::spawn_blocking(move || {
                    storage.write_chunk(entry_id, kind, index, &data)
                })
                .await;
                match flatten_join(written) {
                    Ok(()) => {
                        state.index += 1;
                        Some((Ok(chunk), state))
                    }
                    Err(e) => {
                        state.done = true;
                        Some((Err(e), state))
                    }
                }
            }
            Some(Err(e)) => {
                state.done = true;
                Some((Err(e), state))
            }
            None => {
                state.done = true;
                let storage = state.storage.clone();
                let (entry_id, kind, index) =
                    (state.entry_id, state.kind, state.index);
                let finished = tokio::task::spawn_blocking(move || {
                    storage.write_stream_end(entry_id, kind, index)
                })
                .await;
                match flatten_join(finished) {
                    Ok(()) => None,
                    Err(e) => Some((Err(e), state)),
                }
            }
        }
    })
    .boxed()
}

struct ReadState {
    storage: SqliteStorage,
    entry_id: Uuid,
    kind: StreamKind,
    index: u64,
    done: bool,
}

/// Streams a stored body back, stopping at the empty terminator chunk.
fn load_stream(
    storage: SqliteStorage,
    entry_id: Uuid,
    kind: StreamKind,
) -> ChunkStream {
    let state = ReadState { storage, entry_id, kind, index: 0, done: false };
    stream::unfold(state, |mut state| async move {
        if state.done {
            return None;
        }
        let storage = state.storage.clone();
        let (entry_id, kind, index) =
            (state.entry_id, state.kind, state.index);
        let chunk = tokio::task::spawn_blocking(move || {
            storage.read_chunk(entry_id, kind, index)
        })
        .await;
        match flatten_join(chunk) {
            Err(e) => {
                state.done = true;
                Some((Err(e), state))
            }
            Ok(None) => {
                state.done = true;
                None
            }
            Ok(Some(chunk)) if chunk.is_empty() => {
                state.done = true;
                None
            }
            Ok(Some(chunk)) => {
                state.index += 1;
                Some((Ok(Bytes::from(chunk)), state))
            }
        }
    })
    .boxed()
}
