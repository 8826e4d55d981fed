//! The caching decision state machine.
//!
//! Each request is walked from [`IdleClient`] through the decisions of
//! RFC 9111 until a terminal state yields a response. The states are
//! pure: they read their inputs and compute the next state, while all
//! I/O (store lookups, origin fetches, writes) is performed by the
//! driver between transitions. Non-terminal states double as commands,
//! carrying the data the driver needs to perform the next side effect.

use std::time::{Duration, SystemTime};

use http::{HeaderMap, Method, StatusCode};
use log::debug;
use uuid::Uuid;

use crate::headers::{CacheControl, FieldList};
use crate::model::{
    Body, CompletePair, IncompletePair, Request, Response,
};
use crate::spec::{
    allowed_stale, exclude_unstorable_headers, get_age,
    get_freshness_lifetime, get_heuristic_freshness,
    make_conditional_request, refresh_response_headers, vary_headers_match,
};
use crate::CacheOptions;

// rfc9111 3
const UNDERSTOOD_STATUS_CODES: &[u16] =
    &[200, 203, 204, 206, 300, 301, 308, 404, 405, 410, 414, 451, 501];

// rfc9110 15.1
const HEURISTICALLY_CACHEABLE_STATUS_CODES: &[u16] =
    &[200, 203, 204, 206, 300, 301, 404, 405, 410, 414, 501];

/// The set of states a request can be in.
#[derive(Debug)]
pub enum State {
    /// Initial state: evaluate stored pairs against the request.
    IdleClient(IdleClient),
    /// No stored response is usable; the origin must be contacted.
    CacheMiss(CacheMiss),
    /// Terminal: store the response and return it.
    StoreAndUse(StoreAndUse),
    /// Terminal: return the stored response.
    FromCache(FromCache),
    /// A stored response needs validation before reuse.
    NeedRevalidation(NeedRevalidation),
    /// Stored pairs need their headers refreshed.
    NeedToBeUpdated(NeedToBeUpdated),
    /// Stored pairs must be invalidated before continuing.
    InvalidatePairs(InvalidatePairs),
    /// Terminal: return the response without storing it.
    CouldNotBeStored(CouldNotBeStored),
}

impl State {
    /// The state's name, used for transition logging.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            State::IdleClient(_) => "IdleClient",
            State::CacheMiss(_) => "CacheMiss",
            State::StoreAndUse(_) => "StoreAndUse",
            State::FromCache(_) => "FromCache",
            State::NeedRevalidation(_) => "NeedRevalidation",
            State::NeedToBeUpdated(_) => "NeedToBeUpdated",
            State::InvalidatePairs(_) => "InvalidatePairs",
            State::CouldNotBeStored(_) => "CouldNotBeStored",
        }
    }
}

/// The initial state of every request.
#[derive(Debug)]
pub struct IdleClient {
    /// Cache configuration in effect for this request.
    pub options: CacheOptions,
}

impl IdleClient {
    /// Creates the initial state.
    #[must_use]
    pub fn new(options: CacheOptions) -> Self {
        Self { options }
    }

    /// Evaluates the stored pairs against the request captured in `pair`
    /// (RFC 9111 §4).
    ///
    /// Soft-deleted pairs and pairs whose method, URL, or `Vary` headers
    /// do not line up are skipped. A fresh (or acceptably stale) match
    /// short-circuits to [`FromCache`]; a match that is merely stale
    /// yields [`NeedRevalidation`] with a conditional request; no match
    /// yields [`CacheMiss`], or a synthesized `504 Gateway Timeout` when
    /// the request insists on `only-if-cached`.
    #[must_use]
    pub fn next(
        self,
        pair: IncompletePair,
        stored_pairs: Vec<CompletePair>,
        now: SystemTime,
    ) -> State {
        let IncompletePair { id: pair_id, request, .. } = pair;
        let req_cc = CacheControl::from_headers(&request.headers);

        let mut revalidation_candidate: Option<CompletePair> = None;
        for candidate in stored_pairs {
            if candidate.meta.is_soft_deleted()
                || candidate.request.method != request.method
                || candidate.request.url != request.url
                || !vary_headers_match(&request, &candidate)
            {
                continue;
            }
            match usability(&candidate, &req_cc, &self.options, now) {
                Usability::Usable => {
                    debug!("stored response is usable without validation");
                    return State::FromCache(FromCache { pair: candidate });
                }
                Usability::Revalidate => {
                    revalidation_candidate.get_or_insert(candidate);
                }
            }
        }

        if req_cc.only_if_cached {
            debug!(
                "only-if-cached request has no usable stored response; \
                 synthesizing 504"
            );
            return State::CouldNotBeStored(CouldNotBeStored {
                response: gateway_timeout(),
            });
        }

        match revalidation_candidate {
            Some(stale) => {
                debug!("stored response is stale; validation required");
                let request = make_conditional_request(request, &stale);
                State::NeedRevalidation(NeedRevalidation {
                    pair_id,
                    request,
                    pair: stale,
                    options: self.options,
                })
            }
            None => {
                debug!("no stored response matches the request");
                State::CacheMiss(CacheMiss {
                    pair_id,
                    request,
                    options: self.options,
                })
            }
        }
    }
}

/// How a matching stored pair may be used for the current request.
enum Usability {
    Usable,
    Revalidate,
}

fn usability(
    pair: &CompletePair,
    req_cc: &CacheControl,
    options: &CacheOptions,
    now: SystemTime,
) -> Usability {
    let resp_cc = CacheControl::from_headers(&pair.response.headers);
    if req_cc.no_cache.is_some() || resp_cc.no_cache.is_some() {
        return Usability::Revalidate;
    }

    let age = get_age(pair, now);
    let lifetime = get_freshness_lifetime(pair, options.shared)
        .unwrap_or_else(|| get_heuristic_freshness(pair));

    if age < lifetime {
        if let Some(max_age) = req_cc.max_age {
            if age > secs(max_age) {
                return Usability::Revalidate;
            }
        }
        if let Some(min_fresh) = req_cc.min_fresh {
            if lifetime - age < secs(min_fresh) {
                return Usability::Revalidate;
            }
        }
        return Usability::Usable;
    }

    let staleness = age - lifetime;
    if allowed_stale(pair, options.shared) {
        if req_cc.max_stale.is_some_and(|m| staleness <= secs(m)) {
            return Usability::Usable;
        }
        if resp_cc
            .stale_while_revalidate
            .is_some_and(|w| staleness <= secs(w))
        {
            debug!("serving stale response within its revalidation window");
            return Usability::Usable;
        }
    }
    Usability::Revalidate
}

/// No stored response was usable. The driver fetches the origin and
/// feeds the response back through [`CacheMiss::next`].
#[derive(Debug)]
pub struct CacheMiss {
    /// Id of the incomplete pair capturing this request.
    pub pair_id: Uuid,
    /// The request to send to the origin.
    pub request: Request,
    /// Cache configuration in effect for this request.
    pub options: CacheOptions,
}

impl CacheMiss {
    /// Decides whether the origin response may be stored (RFC 9111 §3).
    #[must_use]
    pub fn next(self, response: Response) -> State {
        if response_storable(
            &self.request.method,
            &self.request.headers,
            &response,
            &self.options,
        ) {
            State::StoreAndUse(StoreAndUse {
                pair_id: self.pair_id,
                response: exclude_unstorable_headers(
                    response,
                    self.options.shared,
                ),
            })
        } else {
            State::CouldNotBeStored(CouldNotBeStored { response })
        }
    }
}

/// Terminal: the driver attaches the response to the pair, stores it,
/// and returns it.
#[derive(Debug)]
pub struct StoreAndUse {
    /// Id of the pair the response is attached to.
    pub pair_id: Uuid,
    /// The response, already stripped of unstorable headers.
    pub response: Response,
}

/// Terminal: the driver returns the stored pair's response.
#[derive(Debug)]
pub struct FromCache {
    /// The stored pair selected for reuse.
    pub pair: CompletePair,
}

/// A stored response must be validated with the origin before reuse.
/// The driver sends the conditional request and feeds the result back
/// through [`NeedRevalidation::next`].
#[derive(Debug)]
pub struct NeedRevalidation {
    /// Id of the incomplete pair capturing this request.
    pub pair_id: Uuid,
    /// The conditional request to send to the origin.
    pub request: Request,
    /// The stale stored pair under validation.
    pub pair: CompletePair,
    /// Cache configuration in effect for this request.
    pub options: CacheOptions,
}

impl NeedRevalidation {
    /// Interprets the origin's answer to a conditional request
    /// (RFC 9111 §4.3.3).
    #[must_use]
    pub fn next(self, response: Response, now: SystemTime) -> State {
        if response.status == StatusCode::NOT_MODIFIED {
            debug!("origin confirmed the stored response is still valid");
            let mut pair = self.pair;
            pair.response.headers = refresh_response_headers(
                &pair.response.headers,
                &response.headers,
            );
            return State::NeedToBeUpdated(NeedToBeUpdated {
                updating_pairs: vec![pair],
            });
        }

        if response.status.is_server_error() {
            if self.stale_allowed_on_error(now) {
                debug!(
                    "validation failed with {}; serving stale response \
                     within its error window",
                    response.status
                );
                return State::FromCache(FromCache { pair: self.pair });
            }
            return State::CouldNotBeStored(CouldNotBeStored { response });
        }

        if response.status.is_success() {
            debug!("origin sent a new representation");
            if response_storable(
                &self.request.method,
                &self.request.headers,
                &response,
                &self.options,
            ) {
                let stored = State::StoreAndUse(StoreAndUse {
                    pair_id: self.pair_id,
                    response: exclude_unstorable_headers(
                        response,
                        self.options.shared,
                    ),
                });
                return State::InvalidatePairs(InvalidatePairs {
                    pair_ids: vec![self.pair.id],
                    follow_up: Box::new(stored),
                });
            }
            return State::CouldNotBeStored(CouldNotBeStored { response });
        }

        State::CouldNotBeStored(CouldNotBeStored { response })
    }

    fn stale_allowed_on_error(&self, now: SystemTime) -> bool {
        let req_cc = CacheControl::from_headers(&self.request.headers);
        let resp_cc = CacheControl::from_headers(&self.pair.response.headers);
        let Some(window) = req_cc.stale_if_error.or(resp_cc.stale_if_error)
        else {
            return false;
        };
        let age = get_age(&self.pair, now);
        let lifetime = get_freshness_lifetime(&self.pair, self.options.shared)
            .unwrap_or_else(|| get_heuristic_freshness(&self.pair));
        age <= lifetime + secs(window)
    }
}

/// Stored pairs whose headers must be refreshed after a successful
/// validation. The driver persists each update, then calls
/// [`NeedToBeUpdated::next`].
#[derive(Debug)]
pub struct NeedToBeUpdated {
    /// Pairs carrying their refreshed header sections.
    pub updating_pairs: Vec<CompletePair>,
}

impl NeedToBeUpdated {
    /// Serves the first refreshed pair from cache.
    #[must_use]
    pub fn next(mut self) -> State {
        if self.updating_pairs.is_empty() {
            unreachable!("NeedToBeUpdated constructed without pairs");
        }
        State::FromCache(FromCache { pair: self.updating_pairs.remove(0) })
    }
}

/// Stored pairs that have been superseded and must be removed. The
/// driver removes each, then calls [`InvalidatePairs::next`].
#[derive(Debug)]
pub struct InvalidatePairs {
    /// Ids of the pairs to remove.
    pub pair_ids: Vec<Uuid>,
    follow_up: Box<State>,
}

impl InvalidatePairs {
    /// The state to continue with once the pairs are gone.
    #[must_use]
    pub fn next(self) -> State {
        *self.follow_up
    }
}

/// Terminal: the response is handed to the caller unchanged and nothing
/// is written to the cache.
#[derive(Debug)]
pub struct CouldNotBeStored {
    /// The response to return.
    pub response: Response,
}

/// The storability decision of RFC 9111 §3.
fn response_storable(
    method: &Method,
    request_headers: &HeaderMap,
    response: &Response,
    options: &CacheOptions,
) -> bool {
    let resp_cc = CacheControl::from_headers(&response.headers);
    let req_cc = CacheControl::from_headers(request_headers);
    let status = response.status.as_u16();

    if !options.supported_methods.contains(method) {
        debug!(
            "cannot store the response: request method {method} is not \
             understood by the cache"
        );
        return false;
    }
    if status < 200 {
        debug!("cannot store the response: status {status} is not final");
        return false;
    }
    if !UNDERSTOOD_STATUS_CODES.contains(&status) {
        debug!(
            "cannot store the response: the cache does not understand \
             status {status}"
        );
        return false;
    }
    if resp_cc.no_store {
        debug!(
            "cannot store the response: no-store directive present in \
             the response"
        );
        return false;
    }
    if req_cc.no_store {
        debug!(
            "cannot store the response: no-store directive present in \
             the request"
        );
        return false;
    }
    if options.shared && matches!(resp_cc.private, Some(FieldList::Bare)) {
        debug!(
            "cannot store the response: the private directive forbids \
             shared caches from storing it"
        );
        return false;
    }
    if options.shared
        && request_headers.contains_key(http::header::AUTHORIZATION)
        && !(resp_cc.public
            || resp_cc.must_revalidate
            || resp_cc.s_maxage.is_some())
    {
        debug!(
            "cannot store the response: the cache is shared and the \
             request carries an Authorization header"
        );
        return false;
    }

    let has_required_component = resp_cc.public
        || (!options.shared && resp_cc.private.is_some())
        || response.headers.contains_key(http::header::EXPIRES)
        || resp_cc.max_age.is_some()
        || (options.shared && resp_cc.s_maxage.is_some())
        || HEURISTICALLY_CACHEABLE_STATUS_CODES.contains(&status);
    if !has_required_component {
        debug!(
            "cannot store the response: it carries none of the components \
             that permit caching"
        );
        return false;
    }
    true
}

fn gateway_timeout() -> Response {
    Response::new(StatusCode::GATEWAY_TIMEOUT)
        .with_body(Body::full("GatewayTimeout"))
}

fn secs(n: u32) -> Duration {
    Duration::from_secs(u64::from(n))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{PairMeta, RequestMetadata};
    use http::HeaderName;
    use url::Url;

    const NOW: f64 = 1_700_000_000.0;

    fn now() -> SystemTime {
        at(0.0)
    }

    fn at(offset_secs: f64) -> SystemTime {
        std::time::UNIX_EPOCH + Duration::from_secs_f64(NOW + offset_secs)
    }

    fn request(headers: &[(&str, &str)]) -> Request {
        let mut request = Request::new(
            Method::GET,
            Url::parse("https://example.com").unwrap(),
        );
        for (name, value) in headers {
            request.headers.append(
                HeaderName::try_from(*name).unwrap(),
                value.parse().unwrap(),
            );
        }
        request
    }

    fn response(status: u16, headers: &[(&str, &str)]) -> Response {
        let mut response =
            Response::new(StatusCode::from_u16(status).unwrap());
        for (name, value) in headers {
            response.headers.append(
                HeaderName::try_from(*name).unwrap(),
                value.parse().unwrap(),
            );
        }
        response
    }

    fn incomplete(headers: &[(&str, &str)]) -> IncompletePair {
        IncompletePair {
            id: Uuid::new_v4(),
            request: request(headers),
            meta: PairMeta::at(NOW),
        }
    }

    fn complete(
        request_headers: &[(&str, &str)],
        response_headers: &[(&str, &str)],
        created_at: f64,
    ) -> CompletePair {
        CompletePair {
            id: Uuid::new_v4(),
            request: request(request_headers),
            response: response(200, response_headers),
            meta: PairMeta::at(created_at),
            cache_key: b"https://example.com/".to_vec(),
        }
    }

    fn miss(options: CacheOptions, request_headers: &[(&str, &str)]) -> CacheMiss {
        CacheMiss {
            pair_id: Uuid::new_v4(),
            request: request(request_headers),
            options,
        }
    }

    #[test]
    fn cacheable_response_is_stored() {
        let state = miss(CacheOptions::default(), &[])
            .next(response(200, &[("cache-control", "max-age=3600")]));
        assert!(matches!(state, State::StoreAndUse(_)));
    }

    #[test]
    fn unsupported_method_is_not_stored() {
        let options = CacheOptions {
            supported_methods: vec![Method::OPTIONS],
            ..Default::default()
        };
        let state = miss(options, &[])
            .next(response(200, &[("cache-control", "max-age=3600")]));
        assert!(matches!(state, State::CouldNotBeStored(_)));
    }

    #[test]
    fn non_final_status_is_not_stored() {
        let state =
            miss(CacheOptions::default(), &[]).next(response(101, &[]));
        assert!(matches!(state, State::CouldNotBeStored(_)));
    }

    #[test]
    fn status_not_understood_is_not_stored() {
        let state =
            miss(CacheOptions::default(), &[]).next(response(304, &[]));
        assert!(matches!(state, State::CouldNotBeStored(_)));
    }

    #[test]
    fn no_store_response_is_not_stored() {
        let state = miss(CacheOptions::default(), &[])
            .next(response(200, &[("cache-control", "no-store")]));
        assert!(matches!(state, State::CouldNotBeStored(_)));
    }

    #[test]
    fn no_store_request_is_not_stored() {
        let state = miss(
            CacheOptions::default(),
            &[("cache-control", "no-store")],
        )
        .next(response(200, &[("cache-control", "max-age=3600")]));
        assert!(matches!(state, State::CouldNotBeStored(_)));
    }

    #[test]
    fn private_response_is_not_stored_by_shared_cache() {
        let options = CacheOptions { shared: true, ..Default::default() };
        let state = miss(options, &[])
            .next(response(200, &[("cache-control", "private")]));
        assert!(matches!(state, State::CouldNotBeStored(_)));

        // A non-shared cache may store it
        let state = miss(CacheOptions::default(), &[])
            .next(response(200, &[("cache-control", "private")]));
        assert!(matches!(state, State::StoreAndUse(_)));
    }

    #[test]
    fn authorized_request_needs_explicit_permission_in_shared_mode() {
        let options = CacheOptions { shared: true, ..Default::default() };
        let authorization = [("authorization", "Bearer 12345")];
        let state = miss(options.clone(), &authorization)
            .next(response(200, &[("cache-control", "max-age=3600")]));
        assert!(matches!(state, State::CouldNotBeStored(_)));

        for permitting in ["public", "must-revalidate", "s-maxage=60"] {
            let cache_control = format!("max-age=3600, {permitting}");
            let state = miss(options.clone(), &authorization).next(response(
                200,
                &[("cache-control", cache_control.as_str())],
            ));
            assert!(
                matches!(state, State::StoreAndUse(_)),
                "{permitting} should permit storing"
            );
        }
    }

    #[test]
    fn response_needs_a_caching_component() {
        // 208 is not heuristically cacheable and nothing else permits it
        let state =
            miss(CacheOptions::default(), &[]).next(response(208, &[]));
        assert!(matches!(state, State::CouldNotBeStored(_)));

        for headers in [
            [("cache-control", "public")],
            [("cache-control", "private")],
            [("expires", "Wed, 15 Nov 2023 00:00:00 GMT")],
            [("cache-control", "max-age=3600")],
        ] {
            let state =
                miss(CacheOptions::default(), &[]).next(response(208, &headers));
            assert!(
                matches!(state, State::StoreAndUse(_)),
                "{headers:?} should permit storing"
            );
        }

        let shared = CacheOptions { shared: true, ..Default::default() };
        let state = miss(shared, &[])
            .next(response(208, &[("cache-control", "s-maxage=3600")]));
        assert!(matches!(state, State::StoreAndUse(_)));

        // A heuristically cacheable status needs nothing else
        let state =
            miss(CacheOptions::default(), &[]).next(response(404, &[]));
        assert!(matches!(state, State::StoreAndUse(_)));
    }

    #[test]
    fn stored_response_drops_unstorable_headers() {
        let state = miss(CacheOptions::default(), &[]).next(response(
            200,
            &[
                ("keep-alive", "timeout=5"),
                ("transfer-encoding", "chunked"),
                ("cache-control", "max-age=3600, no-cache=\"ETag\""),
                ("etag", "\"v1\""),
                ("content-type", "text/plain"),
            ],
        ));
        let State::StoreAndUse(stored) = state else {
            panic!("expected StoreAndUse");
        };
        assert!(!stored.response.headers.contains_key("keep-alive"));
        assert!(!stored.response.headers.contains_key("transfer-encoding"));
        assert!(!stored.response.headers.contains_key("etag"));
        assert!(stored.response.headers.contains_key("content-type"));
    }

    #[test]
    fn fresh_pair_is_served_from_cache() {
        let stored = complete(
            &[],
            &[("cache-control", "max-age=3600")],
            NOW - 100.0,
        );
        let state = IdleClient::new(CacheOptions::default()).next(
            incomplete(&[]),
            vec![stored],
            now(),
        );
        assert!(matches!(state, State::FromCache(_)));
    }

    #[test]
    fn expired_pair_requires_revalidation() {
        let stored = complete(
            &[],
            &[("cache-control", "max-age=60"), ("etag", "\"v1\"")],
            NOW - 3600.0,
        );
        let state = IdleClient::new(CacheOptions::default()).next(
            incomplete(&[]),
            vec![stored],
            now(),
        );
        let State::NeedRevalidation(revalidation) = state else {
            panic!("expected NeedRevalidation");
        };
        assert_eq!(
            revalidation.request.headers.get("if-none-match").unwrap(),
            "\"v1\""
        );
    }

    #[test]
    fn no_stored_pairs_is_a_cache_miss() {
        let state = IdleClient::new(CacheOptions::default()).next(
            incomplete(&[]),
            Vec::new(),
            now(),
        );
        assert!(matches!(state, State::CacheMiss(_)));
    }

    #[test]
    fn soft_deleted_pairs_are_ignored() {
        let mut stored = complete(
            &[],
            &[("cache-control", "max-age=3600")],
            NOW - 100.0,
        );
        stored.meta.mark_deleted(NOW - 50.0);
        let state = IdleClient::new(CacheOptions::default()).next(
            incomplete(&[]),
            vec![stored],
            now(),
        );
        assert!(matches!(state, State::CacheMiss(_)));
    }

    #[test]
    fn vary_mismatch_is_a_cache_miss() {
        let stored = complete(
            &[("accept-encoding", "gzip")],
            &[
                ("cache-control", "max-age=3600"),
                ("vary", "Accept-Encoding"),
            ],
            NOW - 100.0,
        );
        let state = IdleClient::new(CacheOptions::default()).next(
            incomplete(&[("accept-encoding", "br")]),
            vec![stored],
            now(),
        );
        assert!(matches!(state, State::CacheMiss(_)));
    }

    #[test]
    fn request_no_cache_forces_revalidation() {
        let stored = complete(
            &[],
            &[("cache-control", "max-age=3600")],
            NOW - 100.0,
        );
        let state = IdleClient::new(CacheOptions::default()).next(
            incomplete(&[("cache-control", "no-cache")]),
            vec![stored],
            now(),
        );
        assert!(matches!(state, State::NeedRevalidation(_)));
    }

    #[test]
    fn request_max_age_narrows_freshness() {
        let stored = complete(
            &[],
            &[("cache-control", "max-age=3600")],
            NOW - 600.0,
        );
        let state = IdleClient::new(CacheOptions::default()).next(
            incomplete(&[("cache-control", "max-age=60")]),
            vec![stored],
            now(),
        );
        assert!(matches!(state, State::NeedRevalidation(_)));
    }

    #[test]
    fn request_min_fresh_demands_remaining_lifetime() {
        let stored = complete(
            &[],
            &[("cache-control", "max-age=600")],
            NOW - 550.0,
        );
        let state = IdleClient::new(CacheOptions::default()).next(
            incomplete(&[("cache-control", "min-fresh=100")]),
            vec![stored],
            now(),
        );
        assert!(matches!(state, State::NeedRevalidation(_)));
    }

    #[test]
    fn max_stale_accepts_a_stale_pair() {
        let stored = complete(
            &[],
            &[("cache-control", "max-age=60")],
            NOW - 100.0,
        );
        let state = IdleClient::new(CacheOptions::default()).next(
            incomplete(&[("cache-control", "max-stale=120")]),
            vec![stored],
            now(),
        );
        assert!(matches!(state, State::FromCache(_)));
    }

    #[test]
    fn stale_while_revalidate_window_accepts_a_stale_pair() {
        let stored = complete(
            &[],
            &[(
                "cache-control",
                "max-age=60, stale-while-revalidate=3600",
            )],
            NOW - 100.0,
        );
        let state = IdleClient::new(CacheOptions::default()).next(
            incomplete(&[]),
            vec![stored],
            now(),
        );
        assert!(matches!(state, State::FromCache(_)));
    }

    #[test]
    fn must_revalidate_forbids_stale_use() {
        let stored = complete(
            &[],
            &[("cache-control", "max-age=60, must-revalidate")],
            NOW - 100.0,
        );
        let state = IdleClient::new(CacheOptions::default()).next(
            incomplete(&[("cache-control", "max-stale=120")]),
            vec![stored],
            now(),
        );
        assert!(matches!(state, State::NeedRevalidation(_)));
    }

    #[test]
    fn only_if_cached_miss_synthesizes_504() {
        let state = IdleClient::new(CacheOptions::default()).next(
            incomplete(&[("cache-control", "only-if-cached")]),
            Vec::new(),
            now(),
        );
        let State::CouldNotBeStored(terminal) = state else {
            panic!("expected CouldNotBeStored");
        };
        assert_eq!(
            terminal.response.status,
            StatusCode::GATEWAY_TIMEOUT
        );
    }

    #[test]
    fn only_if_cached_hit_is_served() {
        let stored = complete(
            &[],
            &[("cache-control", "max-age=3600")],
            NOW - 100.0,
        );
        let state = IdleClient::new(CacheOptions::default()).next(
            incomplete(&[("cache-control", "only-if-cached")]),
            vec![stored],
            now(),
        );
        assert!(matches!(state, State::FromCache(_)));
    }

    fn revalidation(
        response_headers: &[(&str, &str)],
        created_at: f64,
    ) -> NeedRevalidation {
        let pair = complete(&[], response_headers, created_at);
        NeedRevalidation {
            pair_id: Uuid::new_v4(),
            request: request(&[]),
            pair,
            options: CacheOptions::default(),
        }
    }

    #[test]
    fn not_modified_refreshes_stored_headers() {
        let revalidation = revalidation(
            &[("cache-control", "max-age=60"), ("etag", "\"v1\"")],
            NOW - 3600.0,
        );
        let state = revalidation.next(
            response(304, &[("x-fresh", "yes"), ("etag", "\"v1\"")]),
            now(),
        );
        let State::NeedToBeUpdated(update) = state else {
            panic!("expected NeedToBeUpdated");
        };
        assert_eq!(update.updating_pairs.len(), 1);
        let refreshed = &update.updating_pairs[0];
        assert_eq!(refreshed.response.headers.get("x-fresh").unwrap(), "yes");
        assert_eq!(refreshed.response.headers.get("etag").unwrap(), "\"v1\"");

        let State::FromCache(cached) = update.next() else {
            panic!("expected FromCache");
        };
        assert_eq!(cached.pair.response.status, StatusCode::OK);
    }

    #[test]
    fn server_error_within_stale_if_error_window_serves_stale() {
        let revalidation = revalidation(
            &[("cache-control", "max-age=60, stale-if-error=3600")],
            NOW - 120.0,
        );
        let state = revalidation.next(response(500, &[]), now());
        assert!(matches!(state, State::FromCache(_)));
    }

    #[test]
    fn server_error_outside_the_window_is_passed_through() {
        let revalidation = revalidation(
            &[("cache-control", "max-age=60, stale-if-error=30")],
            NOW - 3600.0,
        );
        let state = revalidation.next(response(502, &[]), now());
        let State::CouldNotBeStored(terminal) = state else {
            panic!("expected CouldNotBeStored");
        };
        assert_eq!(terminal.response.status, StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn new_representation_invalidates_and_stores() {
        let revalidation = revalidation(
            &[("cache-control", "max-age=60")],
            NOW - 3600.0,
        );
        let superseded = revalidation.pair.id;
        let new_pair_id = revalidation.pair_id;
        let state = revalidation.next(
            response(200, &[("cache-control", "max-age=3600")]),
            now(),
        );
        let State::InvalidatePairs(invalidate) = state else {
            panic!("expected InvalidatePairs");
        };
        assert_eq!(invalidate.pair_ids, vec![superseded]);
        let State::StoreAndUse(stored) = invalidate.next() else {
            panic!("expected StoreAndUse");
        };
        assert_eq!(stored.pair_id, new_pair_id);
    }

    #[test]
    fn unstorable_new_representation_is_passed_through() {
        let revalidation = revalidation(
            &[("cache-control", "max-age=60")],
            NOW - 3600.0,
        );
        let state = revalidation.next(
            response(200, &[("cache-control", "no-store")]),
            now(),
        );
        assert!(matches!(state, State::CouldNotBeStored(_)));
    }

    #[test]
    fn unexpected_validation_status_is_passed_through() {
        let revalidation = revalidation(
            &[("cache-control", "max-age=60")],
            NOW - 3600.0,
        );
        let state = revalidation.next(response(404, &[]), now());
        assert!(matches!(state, State::CouldNotBeStored(_)));
    }

    #[test]
    fn request_metadata_survives_the_idle_transition() {
        let mut pair = incomplete(&[]);
        pair.request.metadata = RequestMetadata {
            ttl: Some(30.0),
            ..Default::default()
        };
        let state = IdleClient::new(CacheOptions::default()).next(
            pair,
            Vec::new(),
            now(),
        );
        let State::CacheMiss(miss) = state else {
            panic!("expected CacheMiss");
        };
        assert_eq!(miss.request.metadata.ttl, Some(30.0));
    }
}
