//! Blocking SQLite-backed storage.
//!
//! All cached pairs live in a single database file: one `entries` row per
//! pair (with the serialized head in a blob column) and one `streams` row
//! per body chunk. The database uses WAL journal mode and relaxed sync
//! since this is a cache and losing data on a crash is acceptable.

use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use log::{debug, warn};
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use crate::error::{CacheError, Result};
use crate::model::{
    unix_now, Body, ChunkIter, CompletePair, IncompletePair, PairMeta,
    Request, Response, REAP_GRACE_SECS,
};
use crate::storage::{
    pack_pair, unpack_pair, PairUpdate, Storage, StoredPair, StoredRequest,
    StoredResponse, StreamKind,
};

/// Opportunistic cleanup runs at most this often, in seconds.
const DEFAULT_CLEANUP_INTERVAL_SECS: f64 = 60.0;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS entries (
    id BLOB PRIMARY KEY,
    cache_key BLOB,
    data BLOB NOT NULL,
    created_at REAL NOT NULL,
    deleted_at REAL
);
CREATE TABLE IF NOT EXISTS streams (
    entry_id BLOB NOT NULL,
    chunk_key TEXT NOT NULL,
    chunk_data BLOB NOT NULL,
    PRIMARY KEY (entry_id, chunk_key),
    FOREIGN KEY (entry_id) REFERENCES entries(id) ON DELETE CASCADE
);
CREATE INDEX IF NOT EXISTS idx_entries_deleted_at ON entries(deleted_at);
CREATE INDEX IF NOT EXISTS idx_entries_cache_key ON entries(cache_key);
CREATE INDEX IF NOT EXISTS idx_streams_entry_id ON streams(entry_id);
";

/// A blocking [`Storage`] implementation backed by SQLite.
#[derive(Clone)]
pub struct SqliteStorage {
    connection: Arc<Mutex<Connection>>,
    default_ttl: Option<f64>,
    cleanup_interval: f64,
    last_cleanup: Arc<Mutex<f64>>,
}

impl fmt::Debug for SqliteStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqliteStorage")
            .field("default_ttl", &self.default_ttl)
            .finish()
    }
}

impl SqliteStorage {
    /// Opens (or creates) the database at `path`, creating parent
    /// directories as needed.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let connection = Connection::open(path)?;

        // WAL allows concurrent readers alongside the single writer, and
        // NORMAL sync is enough for a cache.
        connection.pragma_update(None, "journal_mode", "WAL")?;
        connection.pragma_update(None, "synchronous", "NORMAL")?;

        // Wait rather than immediately failing with SQLITE_BUSY when
        // another process holds the database.
        connection.busy_timeout(std::time::Duration::from_secs(5))?;

        Self::from_connection(connection)
    }

    /// An in-memory store, mainly useful for tests and short-lived
    /// processes.
    pub fn in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(connection: Connection) -> Result<Self> {
        connection.execute_batch(SCHEMA)?;
        Ok(Self {
            connection: Arc::new(Mutex::new(connection)),
            default_ttl: None,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL_SECS,
            last_cleanup: Arc::new(Mutex::new(f64::NEG_INFINITY)),
        })
    }

    /// Expire pairs this many seconds after creation unless the request
    /// metadata overrides it. Without a default, pairs never expire by
    /// age.
    #[must_use]
    pub fn with_default_ttl(mut self, secs: f64) -> Self {
        self.default_ttl = Some(secs);
        self
    }

    /// How often reads may trigger an opportunistic cleanup scan.
    #[must_use]
    pub fn with_cleanup_interval(mut self, secs: f64) -> Self {
        self.cleanup_interval = secs;
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        // A poisoned lock means another thread panicked mid-statement;
        // the connection itself is still usable for a cache.
        self.connection.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn insert_pair_row(
        &self,
        request: Request,
        id: Option<Uuid>,
    ) -> Result<IncompletePair> {
        let id = id.unwrap_or_else(Uuid::new_v4);
        let meta = PairMeta::new();
        let stored = StoredPair::Incomplete {
            id,
            request: StoredRequest::from_request(&request),
            meta,
        };
        let data = pack_pair(&stored)?;
        self.lock().execute(
            "INSERT INTO entries (id, cache_key, data, created_at, deleted_at) \
             VALUES (?1, NULL, ?2, ?3, NULL)",
            params![id.as_bytes().to_vec(), data, meta.created_at],
        )?;
        Ok(IncompletePair { id, request, meta })
    }

    pub(crate) fn complete_pair_row(
        &self,
        pair_id: Uuid,
        response: Response,
        key: &[u8],
    ) -> Result<CompletePair> {
        // Read and upgrade under one guard so a concurrent second
        // attachment loses with AlreadyComplete instead of racing.
        let connection = self.lock();
        let stored = query_pair(&connection, pair_id)?
            .ok_or(CacheError::NotFound(pair_id))?;
        let StoredPair::Incomplete { id, request, meta } = stored else {
            return Err(CacheError::AlreadyComplete(pair_id));
        };

        let complete = StoredPair::Complete {
            id,
            request,
            response: StoredResponse::from_response(&response),
            meta,
            cache_key: key.to_vec(),
        };
        let data = pack_pair(&complete)?;
        connection.execute(
            "UPDATE entries SET data = ?1, cache_key = ?2 WHERE id = ?3",
            params![data, key.to_vec(), id.as_bytes().to_vec()],
        )?;
        drop(connection);

        let StoredPair::Complete { request, .. } = complete else {
            unreachable!()
        };
        Ok(CompletePair {
            id,
            request: request.into_request()?,
            response,
            meta,
            cache_key: key.to_vec(),
        })
    }

    /// All complete, live pairs stored under `key`, without their
    /// bodies. Pairs whose response stream was cut off before its
    /// sentinel are skipped; the cleanup scan will deal with them.
    pub(crate) fn load_pairs_by_key(
        &self,
        key: &[u8],
    ) -> Result<Vec<CompletePair>> {
        let rows: Vec<Vec<u8>> = {
            let connection = self.lock();
            let mut statement = connection.prepare(
                "SELECT data FROM entries \
                 WHERE cache_key = ?1 AND deleted_at IS NULL",
            )?;
            let rows = statement
                .query_map(params![key.to_vec()], |row| row.get(0))?
                .collect::<std::result::Result<_, _>>()?;
            rows
        };

        let mut pairs = Vec::with_capacity(rows.len());
        for data in rows {
            let stored = unpack_pair(&data)?;
            let StoredPair::Complete {
                id,
                request,
                response,
                meta,
                cache_key,
            } = stored
            else {
                continue;
            };
            if !self.stream_complete(id, StreamKind::Response)? {
                debug!("skipping pair {id}: response stream is incomplete");
                continue;
            }
            pairs.push(CompletePair {
                id,
                request: request.into_request()?,
                response: response.into_response()?,
                meta,
                cache_key,
            });
        }
        Ok(pairs)
    }

    pub(crate) fn update_pair_row(
        &self,
        id: Uuid,
        update: PairUpdate,
    ) -> Result<Option<CompletePair>> {
        let connection = self.lock();
        let Some(stored) = query_pair(&connection, id)? else {
            return Ok(None);
        };
        let StoredPair::Complete {
            id: stored_id,
            request,
            response,
            meta,
            cache_key,
        } = stored
        else {
            return Ok(None);
        };

        let current = CompletePair {
            id: stored_id,
            request: request.into_request()?,
            response: response.into_response()?,
            meta,
            cache_key: cache_key.clone(),
        };
        let updated = update.apply(current);
        if updated.id != id {
            return Err(CacheError::IdMismatch);
        }

        let packed = pack_pair(&StoredPair::Complete {
            id: updated.id,
            request: StoredRequest::from_request(&updated.request),
            response: StoredResponse::from_response(&updated.response),
            meta: updated.meta,
            cache_key: updated.cache_key.clone(),
        })?;
        connection.execute(
            "UPDATE entries SET data = ?1, created_at = ?2 WHERE id = ?3",
            params![packed, updated.meta.created_at, id.as_bytes().to_vec()],
        )?;
        if updated.cache_key != cache_key {
            connection.execute(
                "UPDATE entries SET cache_key = ?1 WHERE id = ?2",
                params![updated.cache_key.clone(), id.as_bytes().to_vec()],
            )?;
        }
        Ok(Some(updated))
    }

    pub(crate) fn remove_row(&self, id: Uuid) -> Result<()> {
        let connection = self.lock();
        let Some(mut stored) = query_pair(&connection, id)? else {
            return Ok(());
        };
        soft_delete(&connection, &mut stored)
    }

    fn hard_delete(&self, id: Uuid) -> Result<()> {
        let connection = self.lock();
        connection.execute(
            "DELETE FROM entries WHERE id = ?1",
            params![id.as_bytes().to_vec()],
        )?;
        connection.execute(
            "DELETE FROM streams WHERE entry_id = ?1",
            params![id.as_bytes().to_vec()],
        )?;
        Ok(())
    }

    /// Whether the given TTL (request metadata, falling back to the
    /// store default) has elapsed for this pair.
    fn is_expired(&self, stored: &StoredPair, now: f64) -> bool {
        let ttl = stored.request_metadata().ttl.or(self.default_ttl);
        match ttl {
            Some(ttl) => stored.meta().created_at + ttl < now,
            None => false,
        }
    }

    fn is_corrupt(&self, stored: &StoredPair, now: f64) -> Result<bool> {
        match stored {
            StoredPair::Incomplete { meta, .. } => {
                Ok(meta.created_at + REAP_GRACE_SECS < now)
            }
            StoredPair::Complete { id, .. } => {
                Ok(!self.stream_complete(*id, StreamKind::Request)?)
            }
        }
    }

    pub(crate) fn cleanup_scan(&self) -> Result<()> {
        let now = unix_now();
        let rows: Vec<Vec<u8>> = {
            let connection = self.lock();
            let mut statement =
                connection.prepare("SELECT data FROM entries")?;
            let rows = statement
                .query_map([], |row| row.get(0))?
                .collect::<std::result::Result<_, _>>()?;
            rows
        };

        let mut expired = Vec::new();
        let mut reapable = Vec::new();
        for data in rows {
            let mut stored = match unpack_pair(&data) {
                Ok(stored) => stored,
                Err(_) => {
                    // An undecodable row cannot be matched to chunks;
                    // nothing more we can do with it here.
                    warn!("found undecodable cache entry during cleanup");
                    continue;
                }
            };
            if self.is_expired(&stored, now) && !stored.meta().is_soft_deleted()
            {
                expired.push(stored.id());
                stored.meta_mut().mark_deleted(now);
            }
            if (stored.meta().is_soft_deleted()
                && stored.meta().safe_to_hard_delete(now))
                || self.is_corrupt(&stored, now)?
            {
                reapable.push(stored.id());
            }
        }

        for id in expired {
            let connection = self.lock();
            if let Some(mut stored) = query_pair(&connection, id)? {
                debug!("soft-deleting expired pair {id}");
                soft_delete(&connection, &mut stored)?;
            }
        }
        for id in reapable {
            warn!("removing corrupt or reapable pair {id}");
            self.hard_delete(id)?;
        }
        Ok(())
    }

    pub(crate) fn maybe_cleanup(&self) -> Result<()> {
        let now = unix_now();
        {
            let mut last = self
                .last_cleanup
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            if now - *last < self.cleanup_interval {
                return Ok(());
            }
            *last = now;
        }
        self.cleanup_scan()
    }

    pub(crate) fn write_chunk(
        &self,
        entry_id: Uuid,
        kind: StreamKind,
        index: u64,
        data: &[u8],
    ) -> Result<()> {
        self.lock().execute(
            "INSERT INTO streams (entry_id, chunk_key, chunk_data) \
             VALUES (?1, ?2, ?3)",
            params![
                entry_id.as_bytes().to_vec(),
                kind.chunk_key(index),
                data
            ],
        )?;
        Ok(())
    }

    /// Marks end of stream: an empty terminator chunk plus the
    /// completion sentinel the corruption check looks for.
    pub(crate) fn write_stream_end(
        &self,
        entry_id: Uuid,
        kind: StreamKind,
        index: u64,
    ) -> Result<()> {
        const EMPTY: &[u8] = &[];
        let connection = self.lock();
        connection.execute(
            "INSERT INTO streams (entry_id, chunk_key, chunk_data) \
             VALUES (?1, ?2, ?3)",
            params![entry_id.as_bytes().to_vec(), kind.chunk_key(index), EMPTY],
        )?;
        connection.execute(
            "INSERT INTO streams (entry_id, chunk_key, chunk_data) \
             VALUES (?1, ?2, ?3)",
            params![
                entry_id.as_bytes().to_vec(),
                kind.complete_key(),
                EMPTY
            ],
        )?;
        Ok(())
    }

    pub(crate) fn read_chunk(
        &self,
        entry_id: Uuid,
        kind: StreamKind,
        index: u64,
    ) -> Result<Option<Vec<u8>>> {
        Ok(self
            .lock()
            .query_row(
                "SELECT chunk_data FROM streams \
                 WHERE entry_id = ?1 AND chunk_key = ?2",
                params![entry_id.as_bytes().to_vec(), kind.chunk_key(index)],
                |row| row.get(0),
            )
            .optional()?)
    }

    pub(crate) fn stream_complete(
        &self,
        entry_id: Uuid,
        kind: StreamKind,
    ) -> Result<bool> {
        let found: Option<i64> = self
            .lock()
            .query_row(
                "SELECT 1 FROM streams \
                 WHERE entry_id = ?1 AND chunk_key = ?2",
                params![entry_id.as_bytes().to_vec(), kind.complete_key()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn tee_body(&self, entry_id: Uuid, kind: StreamKind, inner: ChunkIter) -> Body {
        Body::iter(StreamWriter {
            storage: self.clone(),
            entry_id,
            kind,
            inner,
            index: 0,
            done: false,
        })
    }

    fn stored_body(&self, entry_id: Uuid, kind: StreamKind) -> Body {
        Body::iter(StreamReader {
            storage: self.clone(),
            entry_id,
            kind,
            index: 0,
            done: false,
        })
    }
}

impl Storage for SqliteStorage {
    fn create_pair(
        &self,
        request: Request,
        id: Option<Uuid>,
    ) -> Result<IncompletePair> {
        let mut request = request;
        let body = std::mem::take(&mut request.body).into_chunk_iter()?;
        let pair = self.insert_pair_row(request, id)?;
        let teed = self.tee_body(pair.id, StreamKind::Request, body);
        let IncompletePair { id, request, meta } = pair;
        Ok(IncompletePair { id, request: request.with_body(teed), meta })
    }

    fn add_response(
        &self,
        pair_id: Uuid,
        response: Response,
        key: &[u8],
    ) -> Result<CompletePair> {
        let mut response = response;
        let body = std::mem::take(&mut response.body).into_chunk_iter()?;
        let pair = self.complete_pair_row(pair_id, response, key)?;
        let teed = self.tee_body(pair.id, StreamKind::Response, body);
        let CompletePair { id, request, response, meta, cache_key } = pair;
        Ok(CompletePair {
            id,
            request,
            response: response.with_body(teed),
            meta,
            cache_key,
        })
    }

    fn get_pairs(&self, key: &[u8]) -> Result<Vec<CompletePair>> {
        self.maybe_cleanup()?;
        let pairs = self.load_pairs_by_key(key)?;
        Ok(pairs
            .into_iter()
            .map(|pair| {
                let request_body =
                    self.stored_body(pair.id, StreamKind::Request);
                let response_body =
                    self.stored_body(pair.id, StreamKind::Response);
                let CompletePair { id, request, response, meta, cache_key } =
                    pair;
                CompletePair {
                    id,
                    request: request.with_body(request_body),
                    response: response.with_body(response_body),
                    meta,
                    cache_key,
                }
            })
            .collect())
    }

    fn update_pair(
        &self,
        id: Uuid,
        update: PairUpdate,
    ) -> Result<Option<CompletePair>> {
        self.update_pair_row(id, update)
    }

    fn remove(&self, id: Uuid) -> Result<()> {
        self.remove_row(id)
    }

    fn cleanup(&self) -> Result<()> {
        self.cleanup_scan()
    }
}

fn query_pair(
    connection: &Connection,
    id: Uuid,
) -> Result<Option<StoredPair>> {
    let data: Option<Vec<u8>> = connection
        .query_row(
            "SELECT data FROM entries WHERE id = ?1",
            params![id.as_bytes().to_vec()],
            |row| row.get(0),
        )
        .optional()?;
    match data {
        Some(data) => Ok(Some(unpack_pair(&data)?)),
        None => Ok(None),
    }
}

fn soft_delete(
    connection: &Connection,
    stored: &mut StoredPair,
) -> Result<()> {
    stored.meta_mut().mark_deleted(unix_now());
    let data = pack_pair(stored)?;
    connection.execute(
        "UPDATE entries SET data = ?1, deleted_at = ?2 WHERE id = ?3",
        params![
            data,
            stored.meta().deleted_at,
            stored.id().as_bytes().to_vec()
        ],
    )?;
    Ok(())
}

/// Tee over an outbound body: each chunk is persisted before it is
/// yielded, and exhaustion writes the end-of-stream markers.
struct StreamWriter {
    storage: SqliteStorage,
    entry_id: Uuid,
    kind: StreamKind,
    inner: ChunkIter,
    index: u64,
    done: bool,
}

impl Iterator for StreamWriter {
    type Item = Result<Bytes>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.inner.next() {
            Some(Ok(chunk)) => {
                if let Err(e) = self.storage.write_chunk(
                    self.entry_id,
                    self.kind,
                    self.index,
                    &chunk,
                ) {
                    self.done = true;
                    return Some(Err(e));
                }
                self.index += 1;
                Some(Ok(chunk))
            }
            Some(Err(e)) => {
                self.done = true;
                Some(Err(e))
            }
            None => {
                self.done = true;
                match self.storage.write_stream_end(
                    self.entry_id,
                    self.kind,
                    self.index,
                ) {
                    Ok(()) => None,
                    Err(e) => Some(Err(e)),
                }
            }
        }
    }
}

/// Reads a stored body back chunk by chunk, stopping at the empty
/// terminator chunk.
struct StreamReader {
    storage: SqliteStorage,
    entry_id: Uuid,
    kind: StreamKind,
    index: u64,
    done: bool,
}

impl Iterator for StreamReader {
    type Item = Result<Bytes>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.storage.read_chunk(self.entry_id, self.kind, self.index) {
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
            Ok(None) => {
                self.done = true;
                None
            }
            Ok(Some(chunk)) if chunk.is_empty() => {
                self.done = true;
                None
            }
            Ok(Some(chunk)) => {
                self.index += 1;
                Some(Ok(Bytes::from(chunk)))
            }
        }
    }
}
