//! Cache key generation.
//!
//! By default a pair is keyed by its request URL. A [`KeyGen`] replaces
//! that: either a pure function of the request, or a streaming digester
//! that observes the request body as it is sent and produces the key at
//! end of stream.

use std::fmt;
use std::sync::Arc;

use sha2::{Digest, Sha256};

use crate::model::Request;

/// A configured cache key generator.
#[derive(Clone)]
pub enum KeyGen {
    /// A pure function from request to key bytes.
    Fn(Arc<dyn Fn(&Request) -> Vec<u8> + Send + Sync>),
    /// A digester fed the request body chunk by chunk; the key is the
    /// digest produced at end of stream.
    Streaming(Arc<dyn StreamingKeyGen>),
}

impl KeyGen {
    /// A key generator from a plain function.
    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn(&Request) -> Vec<u8> + Send + Sync + 'static,
    {
        KeyGen::Fn(Arc::new(f))
    }

    /// A streaming key generator.
    pub fn streaming(keygen: impl StreamingKeyGen + 'static) -> Self {
        KeyGen::Streaming(Arc::new(keygen))
    }
}

impl fmt::Debug for KeyGen {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyGen::Fn(_) => f.write_str("KeyGen::Fn(..)"),
            KeyGen::Streaming(_) => f.write_str("KeyGen::Streaming(..)"),
        }
    }
}

/// A key generator that consumes the request body as a stream of chunks.
pub trait StreamingKeyGen: Send + Sync {
    /// Starts a fresh digest for one request body.
    fn digester(&self) -> Box<dyn KeyDigester>;
}

/// One in-flight body digest.
pub trait KeyDigester: Send {
    /// Feeds the digester one body chunk.
    fn update(&mut self, chunk: &[u8]);
    /// Finishes the digest at end of stream, yielding the cache key.
    fn finish(self: Box<Self>) -> Vec<u8>;
}

/// A [`StreamingKeyGen`] producing the SHA-256 digest of the body.
#[derive(Debug, Clone, Copy, Default)]
pub struct HashKeyGen;

impl StreamingKeyGen for HashKeyGen {
    fn digester(&self) -> Box<dyn KeyDigester> {
        Box::new(Sha256Digester(Sha256::new()))
    }
}

struct Sha256Digester(Sha256);

impl KeyDigester for Sha256Digester {
    fn update(&mut self, chunk: &[u8]) {
        self.0.update(chunk);
    }

    fn finish(self: Box<Self>) -> Vec<u8> {
        self.0.finalize().to_vec()
    }
}

/// Hex-encoded SHA-256 of a buffer, used when a request opts into
/// body-derived keys.
pub(crate) fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn streaming_digest_matches_one_shot_hash() {
        let mut digester = HashKeyGen.digester();
        digester.update(b"hello ");
        digester.update(b"world");
        let digest = digester.finish();
        assert_eq!(hex::encode(digest), sha256_hex(b"hello world"));
    }

    #[test]
    fn fn_keygen_sees_the_request() {
        let keygen = KeyGen::from_fn(|request: &Request| {
            request.url.as_str().as_bytes().to_vec()
        });
        let KeyGen::Fn(f) = keygen else { panic!("expected Fn") };
        let request = Request::new(
            http::Method::GET,
            url::Url::parse("https://example.com/a").unwrap(),
        );
        assert_eq!(f(&request), b"https://example.com/a".to_vec());
    }
}
