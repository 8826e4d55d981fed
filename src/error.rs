use miette::Diagnostic;
use thiserror::Error;

/// A `Result` typedef to use with the [`CacheError`] type
pub type Result<T> = std::result::Result<T, CacheError>;

/// A generic “error” for HTTP caches
#[derive(Error, Diagnostic, Debug)]
pub enum CacheError {
    /// A general error used as a catch all for other errors via anyhow
    #[error(transparent)]
    #[diagnostic(code(http_cache_proxy::general))]
    General(#[from] anyhow::Error),
    /// No pair with the given id exists in the store
    #[error("No cache entry found for pair {0}")]
    #[diagnostic(code(http_cache_proxy::not_found))]
    NotFound(uuid::Uuid),
    /// A response was attached to a pair that already has one
    #[error("Pair {0} already has a response attached")]
    #[diagnostic(code(http_cache_proxy::already_complete))]
    AlreadyComplete(uuid::Uuid),
    /// An update tried to change the id of a stored pair
    #[error("Pair update must keep the original id")]
    #[diagnostic(code(http_cache_proxy::id_mismatch))]
    IdMismatch,
    /// A stored pair failed its integrity checks
    #[error("Cache entry {0} is corrupt")]
    #[diagnostic(code(http_cache_proxy::corrupt))]
    Corrupt(uuid::Uuid),
    /// Error from the SQLite backend
    #[error(transparent)]
    #[diagnostic(code(http_cache_proxy::storage))]
    Storage(#[from] rusqlite::Error),
    /// Error encoding or decoding a stored pair
    #[error(transparent)]
    #[diagnostic(code(http_cache_proxy::encoding))]
    Encoding(#[from] Box<bincode::ErrorKind>),
    /// Error surfaced by the `send_request` collaborator
    #[error("Transport error: {0}")]
    #[diagnostic(code(http_cache_proxy::transport))]
    Transport(#[source] anyhow::Error),
    /// A blocking body was consumed through the async surface or vice versa
    #[error("Body stream does not match the storage flavor (blocking vs async)")]
    #[diagnostic(code(http_cache_proxy::body_flavor))]
    BodyFlavor,
    /// There was an error parsing an HTTP header value
    #[error("Error parsing header value")]
    #[diagnostic(code(http_cache_proxy::bad_header))]
    BadHeader,
    /// An I/O error, e.g. while creating the cache directory
    #[error(transparent)]
    #[diagnostic(code(http_cache_proxy::io))]
    Io(#[from] std::io::Error),
    /// There was an error parsing the HTTP method
    #[error(transparent)]
    #[diagnostic(code(http_cache_proxy::invalid_method))]
    InvalidMethod(#[from] http::method::InvalidMethod),
    /// There was an error parsing an HTTP header name
    #[error(transparent)]
    #[diagnostic(code(http_cache_proxy::invalid_header_name))]
    InvalidHeaderName(#[from] http::header::InvalidHeaderName),
    /// There was an error parsing an HTTP header value
    #[error(transparent)]
    #[diagnostic(code(http_cache_proxy::invalid_header_value))]
    InvalidHeaderValue(#[from] http::header::InvalidHeaderValue),
    /// There was an error parsing the HTTP status code
    #[error(transparent)]
    #[diagnostic(code(http_cache_proxy::invalid_status_code))]
    InvalidStatusCode(#[from] http::status::InvalidStatusCode),
    /// There was an error parsing the URL
    #[error(transparent)]
    #[diagnostic(code(http_cache_proxy::invalid_url))]
    InvalidUrl(#[from] url::ParseError),
}
