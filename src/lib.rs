#![forbid(unsafe_code, future_incompatible)]
#![deny(
    missing_docs,
    missing_debug_implementations,
    missing_copy_implementations,
    nonstandard_style,
    unused_qualifications,
    unused_import_braces,
    unused_extern_crates,
    trivial_casts,
    trivial_numeric_casts
)]
//! A client-side HTTP cache that follows the caching rules of
//! [RFC 9111](https://www.rfc-editor.org/rfc/rfc9111.html).
//!
//! The crate is independent of any particular HTTP client library: you
//! hand a [`CacheProxy`] (or [`AsyncCacheProxy`]) a storage backend and
//! a `send_request` callable that performs the actual network exchange,
//! and it decides per request whether a stored response can be reused,
//! must be revalidated, or cannot be used, storing new responses
//! subject to the storability rules along the way.
//!
//! Internally the decisions are driven by a pure state machine
//! ([`State`]) operating on parsed [`CacheControl`] directives; pairs of
//! requests and responses are persisted through the [`Storage`] /
//! [`AsyncStorage`] traits, with a SQLite backend
//! ([`SqliteStorage`], [`AsyncSqliteStorage`]) bundled.
//!
//! ## Basic usage
//!
//! ```rust
//! use http_cache_proxy::{Body, CacheProxy, Request, Response, SqliteStorage};
//! use http::{Method, StatusCode};
//! use url::Url;
//!
//! # fn main() -> http_cache_proxy::Result<()> {
//! let storage = SqliteStorage::in_memory()?;
//! let proxy = CacheProxy::new(storage, |_request: Request| {
//!     let mut response = Response::new(StatusCode::OK);
//!     response
//!         .headers
//!         .insert("cache-control", "max-age=3600".parse().unwrap());
//!     Ok(response.with_body(Body::full("hello")))
//! });
//!
//! let request =
//!     Request::new(Method::GET, Url::parse("https://example.com")?);
//! let response = proxy.handle_request(request)?;
//! assert!(!response.metadata.from_cache);
//! # Ok(())
//! # }
//! ```
//!
//! ## Configuration
//!
//! [`CacheOptions`] selects shared-cache semantics, the set of cacheable
//! methods, an optional cache key generator, and whether to bypass the
//! caching rules entirely:
//!
//! ```rust
//! use http_cache_proxy::CacheOptions;
//!
//! let options = CacheOptions {
//!     shared: true,
//!     ..Default::default()
//! };
//! assert_eq!(options.supported_methods, vec![http::Method::GET, http::Method::HEAD]);
//! ```
//!
//! Per-request behavior is tuned through [`RequestMetadata`] (TTL
//! overrides, TTL refresh on access, rule bypass, body-derived keys);
//! each returned response records its cache effects in
//! [`ResponseMetadata`].

mod error;
mod headers;
mod keygen;
mod model;
mod proxy;
pub mod spec;
mod states;
mod storage;


use http::Method;

pub use error::{CacheError, Result};
pub use headers::{parse_cache_control, CacheControl, FieldList};
pub use keygen::{HashKeyGen, KeyDigester, KeyGen, StreamingKeyGen};
pub use model::{
    Body, ChunkIter, ChunkStream, CompletePair, IncompletePair, PairMeta,
    Request, RequestMetadata, Response, ResponseMetadata,
};
pub use proxy::{AsyncCacheProxy, AsyncSendRequest, CacheProxy, SendRequest};
pub use states::{
    CacheMiss, CouldNotBeStored, FromCache, IdleClient, InvalidatePairs,
    NeedRevalidation, NeedToBeUpdated, State, StoreAndUse,
};
pub use storage::{
    AsyncSqliteStorage, AsyncStorage, PairUpdate, SqliteStorage, Storage,
};

/// Configuration for a cache proxy.
#[derive(Debug, Clone)]
pub struct CacheOptions {
    /// Evaluate responses from the perspective of a shared cache: the
    /// `private` directive forbids storing, `s-maxage` and
    /// `proxy-revalidate` apply, and `Authorization`-bearing exchanges
    /// need explicit permission to be cached.
    pub shared: bool,
    /// Methods whose exchanges may be cached.
    pub supported_methods: Vec<Method>,
    /// Replaces the default URL-based cache key.
    pub keygen: Option<KeyGen>,
    /// Bypass the caching rules entirely: every response is cached and
    /// reused without freshness checks.
    pub ignore_specification: bool,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            shared: false,
            supported_methods: vec![Method::GET, Method::HEAD],
            keygen: None,
            ignore_specification: false,
        }
    }
}
