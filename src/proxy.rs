//! The cache proxies: drivers that pump the state machine.
//!
//! A proxy owns a storage backend and a `send_request` callable supplied
//! by the caller. [`CacheProxy`] is the blocking flavor,
//! [`AsyncCacheProxy`] the suspending one; both walk the same state
//! machine and differ only in how they reach storage and the network.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use futures::future::BoxFuture;
use futures::stream::{self, StreamExt};
use log::debug;

use crate::error::{CacheError, Result};
use crate::keygen::{sha256_hex, HashKeyGen, KeyDigester, KeyGen, StreamingKeyGen};
use crate::model::{
    unix_now, Body, ChunkStream, CompletePair, IncompletePair, Request,
    Response,
};
use crate::spec::vary_headers_match;
use crate::states::{IdleClient, State};
use crate::storage::{AsyncStorage, PairUpdate, Storage};
use crate::CacheOptions;

/// The blocking transport collaborator.
pub type SendRequest = Box<dyn Fn(Request) -> Result<Response> + Send + Sync>;

/// The suspending transport collaborator.
pub type AsyncSendRequest =
    Box<dyn Fn(Request) -> BoxFuture<'static, Result<Response>> + Send + Sync>;

/// A blocking client-side HTTP cache.
pub struct CacheProxy<S> {
    storage: S,
    send_request: SendRequest,
    options: CacheOptions,
}

impl<S> fmt::Debug for CacheProxy<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheProxy")
            .field("options", &self.options)
            .finish()
    }
}

impl<S: Storage> CacheProxy<S> {
    /// A proxy with default options.
    pub fn new<F>(storage: S, send_request: F) -> Self
    where
        F: Fn(Request) -> Result<Response> + Send + Sync + 'static,
    {
        Self::with_options(storage, send_request, CacheOptions::default())
    }

    /// A proxy with explicit options.
    pub fn with_options<F>(
        storage: S,
        send_request: F,
        options: CacheOptions,
    ) -> Self
    where
        F: Fn(Request) -> Result<Response> + Send + Sync + 'static,
    {
        Self { storage, send_request: Box::new(send_request), options }
    }

    /// Handles one request, consulting and updating the cache as the
    /// caching rules dictate, or bypassing them when configured to.
    pub fn handle_request(&self, request: Request) -> Result<Response> {
        if self.options.ignore_specification || request.metadata.spec_ignore {
            self.handle_ignoring_rules(request)
        } else {
            self.handle_respecting_rules(request)
        }
    }

    fn handle_ignoring_rules(&self, request: Request) -> Result<Response> {
        debug!("looking up cached response, ignoring the caching rules");
        let mut plan = plan_keys(&self.options, &request);
        let pairs = self.storage.get_pairs(&plan.lookup)?;
        debug!("found {} cached pair(s) for the request", pairs.len());

        for pair in pairs {
            if pair.request.url == request.url
                && pair.request.method == request.method
                && vary_headers_match(&request, &pair)
            {
                debug!("serving matching cached response");
                self.maybe_refresh_ttl(&pair)?;
                let mut response = pair.response;
                response.metadata.from_cache = true;
                response.metadata.spec_ignored = true;
                return Ok(response);
            }
        }

        let pair = self.storage.create_pair(request, None)?;
        let mut pair = wire_digest_blocking(pair, &mut plan)?;
        let outbound = pair.request.take_for_send();
        let response = (self.send_request)(outbound)?;
        let key = plan.final_key()?;
        debug!("storing response, ignoring the caching rules");
        let pair = self.storage.add_response(pair.id, response, &key)?;
        let mut response = pair.response;
        response.metadata.spec_ignored = true;
        response.metadata.stored = true;
        Ok(response)
    }

    fn handle_respecting_rules(&self, request: Request) -> Result<Response> {
        let mut plan = plan_keys(&self.options, &request);
        let pair = self.storage.create_pair(request, None)?;
        let pair = wire_digest_blocking(pair, &mut plan)?;
        let stored = self.storage.get_pairs(&plan.lookup)?;
        debug!("found {} stored pair(s) for the request", stored.len());

        let mut idle_input = Some((pair, stored));
        let mut revalidated = false;
        let mut state = State::IdleClient(IdleClient::new(self.options.clone()));
        loop {
            debug!("handling state: {}", state.name());
            state = match state {
                State::IdleClient(idle) => {
                    let Some((pair, stored)) = idle_input.take() else {
                        unreachable!("IdleClient visited twice");
                    };
                    idle.next(pair, stored, SystemTime::now())
                }
                State::CacheMiss(mut miss) => {
                    let outbound = miss.request.take_for_send();
                    let response = (self.send_request)(outbound)?;
                    miss.next(response)
                }
                State::NeedRevalidation(mut revalidation) => {
                    revalidated = true;
                    let outbound = revalidation.request.take_for_send();
                    let response = (self.send_request)(outbound)?;
                    revalidation.next(response, SystemTime::now())
                }
                State::NeedToBeUpdated(update) => {
                    for pair in &update.updating_pairs {
                        // Bind this pair's data before moving it into the
                        // update closure.
                        let headers = pair.response.headers.clone();
                        let status = pair.response.status;
                        self.storage.update_pair(
                            pair.id,
                            PairUpdate::with(move |mut current| {
                                current.response.headers = headers;
                                current.response.status = status;
                                current
                            }),
                        )?;
                    }
                    update.next()
                }
                State::InvalidatePairs(invalidate) => {
                    for id in &invalidate.pair_ids {
                        self.storage.remove(*id)?;
                    }
                    invalidate.next()
                }
                State::StoreAndUse(store) => {
                    let key = plan.final_key()?;
                    let pair = self.storage.add_response(
                        store.pair_id,
                        store.response,
                        &key,
                    )?;
                    let mut response = pair.response;
                    response.metadata.stored = true;
                    response.metadata.revalidated = revalidated;
                    return Ok(response);
                }
                State::FromCache(cached) => {
                    self.maybe_refresh_ttl(&cached.pair)?;
                    let mut response = cached.pair.response;
                    response.metadata.from_cache = true;
                    response.metadata.revalidated = revalidated;
                    return Ok(response);
                }
                State::CouldNotBeStored(terminal) => {
                    return Ok(terminal.response);
                }
            };
        }
    }

    fn maybe_refresh_ttl(&self, pair: &CompletePair) -> Result<()> {
        if pair.request.metadata.refresh_ttl_on_access {
            self.storage.update_pair(
                pair.id,
                PairUpdate::with(|mut current| {
                    current.meta.created_at = unix_now();
                    current
                }),
            )?;
        }
        Ok(())
    }
}

/// A suspending client-side HTTP cache.
pub struct AsyncCacheProxy<S> {
    storage: S,
    send_request: AsyncSendRequest,
    options: CacheOptions,
}

impl<S> fmt::Debug for AsyncCacheProxy<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncCacheProxy")
            .field("options", &self.options)
            .finish()
    }
}

impl<S: AsyncStorage> AsyncCacheProxy<S> {
    /// A proxy with default options.
    pub fn new<F, Fut>(storage: S, send_request: F) -> Self
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Response>> + Send + 'static,
    {
        Self::with_options(storage, send_request, CacheOptions::default())
    }

    /// A proxy with explicit options.
    pub fn with_options<F, Fut>(
        storage: S,
        send_request: F,
        options: CacheOptions,
    ) -> Self
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Response>> + Send + 'static,
    {
        Self {
            storage,
            send_request: Box::new(move |request| {
                Box::pin(send_request(request))
            }),
            options,
        }
    }

    /// See [`CacheProxy::handle_request`].
    pub async fn handle_request(&self, request: Request) -> Result<Response> {
        if self.options.ignore_specification || request.metadata.spec_ignore {
            self.handle_ignoring_rules(request).await
        } else {
            self.handle_respecting_rules(request).await
        }
    }

    async fn handle_ignoring_rules(
        &self,
        request: Request,
    ) -> Result<Response> {
        debug!("looking up cached response, ignoring the caching rules");
        let mut plan = plan_keys(&self.options, &request);
        let pairs = self.storage.get_pairs(&plan.lookup).await?;
        debug!("found {} cached pair(s) for the request", pairs.len());

        for pair in pairs {
            if pair.request.url == request.url
                && pair.request.method == request.method
                && vary_headers_match(&request, &pair)
            {
                debug!("serving matching cached response");
                self.maybe_refresh_ttl(&pair).await?;
                let mut response = pair.response;
                response.metadata.from_cache = true;
                response.metadata.spec_ignored = true;
                return Ok(response);
            }
        }

        let pair = self.storage.create_pair(request, None).await?;
        let mut pair = wire_digest_async(pair, &mut plan);
        let outbound = pair.request.take_for_send();
        let response = (self.send_request)(outbound).await?;
        let key = plan.final_key()?;
        debug!("storing response, ignoring the caching rules");
        let pair = self.storage.add_response(pair.id, response, &key).await?;
        let mut response = pair.response;
        response.metadata.spec_ignored = true;
        response.metadata.stored = true;
        Ok(response)
    }

    async fn handle_respecting_rules(
        &self,
        request: Request,
    ) -> Result<Response> {
        let mut plan = plan_keys(&self.options, &request);
        let pair = self.storage.create_pair(request, None).await?;
        let pair = wire_digest_async(pair, &mut plan);
        let stored = self.storage.get_pairs(&plan.lookup).await?;
        debug!("found {} stored pair(s) for the request", stored.len());

        let mut idle_input = Some((pair, stored));
        let mut revalidated = false;
        let mut state = State::IdleClient(IdleClient::new(self.options.clone()));
        loop {
            debug!("handling state: {}", state.name());
            state = match state {
                State::IdleClient(idle) => {
                    let Some((pair, stored)) = idle_input.take() else {
                        unreachable!("IdleClient visited twice");
                    };
                    idle.next(pair, stored, SystemTime::now())
                }
                State::CacheMiss(mut miss) => {
                    let outbound = miss.request.take_for_send();
                    let response = (self.send_request)(outbound).await?;
                    miss.next(response)
                }
                State::NeedRevalidation(mut revalidation) => {
                    revalidated = true;
                    let outbound = revalidation.request.take_for_send();
                    let response = (self.send_request)(outbound).await?;
                    revalidation.next(response, SystemTime::now())
                }
                State::NeedToBeUpdated(update) => {
                    for pair in &update.updating_pairs {
                        let headers = pair.response.headers.clone();
                        let status = pair.response.status;
                        self.storage
                            .update_pair(
                                pair.id,
                                PairUpdate::with(move |mut current| {
                                    current.response.headers = headers;
                                    current.response.status = status;
                                    current
                                }),
                            )
                            .await?;
                    }
                    update.next()
                }
                State::InvalidatePairs(invalidate) => {
                    for id in &invalidate.pair_ids {
                        self.storage.remove(*id).await?;
                    }
                    invalidate.next()
                }
                State::StoreAndUse(store) => {
                    let key = plan.final_key()?;
                    let pair = self
                        .storage
                        .add_response(store.pair_id, store.response, &key)
                        .await?;
                    let mut response = pair.response;
                    response.metadata.stored = true;
                    response.metadata.revalidated = revalidated;
                    return Ok(response);
                }
                State::FromCache(cached) => {
                    self.maybe_refresh_ttl(&cached.pair).await?;
                    let mut response = cached.pair.response;
                    response.metadata.from_cache = true;
                    response.metadata.revalidated = revalidated;
                    return Ok(response);
                }
                State::CouldNotBeStored(terminal) => {
                    return Ok(terminal.response);
                }
            };
        }
    }

    async fn maybe_refresh_ttl(&self, pair: &CompletePair) -> Result<()> {
        if pair.request.metadata.refresh_ttl_on_access {
            self.storage
                .update_pair(
                    pair.id,
                    PairUpdate::with(|mut current| {
                        current.meta.created_at = unix_now();
                        current
                    }),
                )
                .await?;
        }
        Ok(())
    }
}

type DigestSlot = Arc<Mutex<Option<Vec<u8>>>>;

/// How the cache key for a request gets produced.
///
/// `lookup` is always known up front and drives `get_pairs`. The storage
/// key is either `ready` (URL, URL plus buffered-body digest, or the
/// output of a callable key generator) or `pending`: a digest observed
/// while the request body streams out, resolved by
/// [`KeyPlan::final_key`].
struct KeyPlan {
    lookup: Vec<u8>,
    ready: Option<Vec<u8>>,
    pending: Option<PendingDigest>,
}

struct PendingDigest {
    digester: Option<Box<dyn KeyDigester>>,
    slot: DigestSlot,
    /// `Some(url)` formats the final key as `{url}#{hex digest}`; `None`
    /// uses the raw digest bytes.
    url_prefix: Option<String>,
}

impl KeyPlan {
    fn ready(lookup: Vec<u8>) -> Self {
        Self { lookup: lookup.clone(), ready: Some(lookup), pending: None }
    }

    fn final_key(&mut self) -> Result<Vec<u8>> {
        if let Some(key) = self.ready.take() {
            return Ok(key);
        }
        let Some(pending) = self.pending.as_ref() else {
            return Err(CacheError::General(anyhow::anyhow!(
                "cache key was already consumed"
            )));
        };
        let digest = pending
            .slot
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or_else(|| {
                CacheError::General(anyhow::anyhow!(
                    "request body was not fully consumed; the streaming \
                     cache key is unavailable"
                ))
            })?;
        Ok(match &pending.url_prefix {
            Some(url) => {
                format!("{url}#{}", hex::encode(digest)).into_bytes()
            }
            None => digest,
        })
    }
}

fn plan_keys(options: &CacheOptions, request: &Request) -> KeyPlan {
    let url_key = request.url.as_str().as_bytes().to_vec();
    match &options.keygen {
        None if request.metadata.body_key => {
            match request.body.buffered() {
                Some(buffered) => KeyPlan::ready(
                    format!(
                        "{}#{}",
                        request.url,
                        sha256_hex(buffered)
                    )
                    .into_bytes(),
                ),
                None => KeyPlan {
                    lookup: url_key,
                    ready: None,
                    pending: Some(PendingDigest {
                        digester: Some(HashKeyGen.digester()),
                        slot: Arc::new(Mutex::new(None)),
                        url_prefix: Some(request.url.to_string()),
                    }),
                },
            }
        }
        None => KeyPlan::ready(url_key),
        Some(KeyGen::Fn(keygen)) => KeyPlan::ready(keygen(request)),
        Some(KeyGen::Streaming(keygen)) => match request.body.buffered() {
            Some(buffered) => {
                let mut digester = keygen.digester();
                digester.update(buffered);
                KeyPlan::ready(digester.finish())
            }
            None => KeyPlan {
                lookup: url_key,
                ready: None,
                pending: Some(PendingDigest {
                    digester: Some(keygen.digester()),
                    slot: Arc::new(Mutex::new(None)),
                    url_prefix: None,
                }),
            },
        },
    }
}

/// Wraps the pair's (already teed) request body so the pending digest
/// observes every chunk on its way to the transport.
fn wire_digest_blocking(
    pair: IncompletePair,
    plan: &mut KeyPlan,
) -> Result<IncompletePair> {
    let Some(pending) = plan.pending.as_mut() else {
        return Ok(pair);
    };
    let Some(digester) = pending.digester.take() else {
        return Ok(pair);
    };
    let IncompletePair { id, mut request, meta } = pair;
    let inner = std::mem::take(&mut request.body).into_chunk_iter()?;
    let body = Body::iter(DigestTee {
        inner,
        digester: Some(digester),
        slot: Arc::clone(&pending.slot),
    });
    Ok(IncompletePair { id, request: request.with_body(body), meta })
}

fn wire_digest_async(
    pair: IncompletePair,
    plan: &mut KeyPlan,
) -> IncompletePair {
    let Some(pending) = plan.pending.as_mut() else {
        return pair;
    };
    let Some(digester) = pending.digester.take() else {
        return pair;
    };
    let IncompletePair { id, mut request, meta } = pair;
    let inner = std::mem::take(&mut request.body).into_chunk_stream();
    let body = Body::Stream(digest_stream(
        inner,
        digester,
        Arc::clone(&pending.slot),
    ));
    IncompletePair { id, request: request.with_body(body), meta }
}

struct DigestTee {
    inner: crate::model::ChunkIter,
    digester: Option<Box<dyn KeyDigester>>,
    slot: DigestSlot,
}

impl Iterator for DigestTee {
    type Item = Result<bytes::Bytes>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.inner.next() {
            Some(Ok(chunk)) => {
                if let Some(digester) = self.digester.as_mut() {
                    digester.update(&chunk);
                }
                Some(Ok(chunk))
            }
            Some(Err(e)) => Some(Err(e)),
            None => {
                if let Some(digester) = self.digester.take() {
                    *self.slot.lock().unwrap_or_else(|e| e.into_inner()) =
                        Some(digester.finish());
                }
                None
            }
        }
    }
}

struct DigestStreamState {
    inner: ChunkStream,
    digester: Option<Box<dyn KeyDigester>>,
    slot: DigestSlot,
}

fn digest_stream(
    inner: ChunkStream,
    digester: Box<dyn KeyDigester>,
    slot: DigestSlot,
) -> ChunkStream {
    let state =
        DigestStreamState { inner, digester: Some(digester), slot };
    stream::unfold(state, |mut state| async move {
        match state.inner.next().await {
            Some(Ok(chunk)) => {
                if let Some(digester) = state.digester.as_mut() {
                    digester.update(&chunk);
                }
                Some((Ok(chunk), state))
            }
            Some(Err(e)) => Some((Err(e), state)),
            None => {
                if let Some(digester) = state.digester.take() {
                    *state
                        .slot
                        .lock()
                        .unwrap_or_else(|e| e.into_inner()) =
                        Some(digester.finish());
                }
                None
            }
        }
    })
    .boxed()
}
