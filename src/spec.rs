//! Pure helper functions computing RFC 9111 quantities.
//!
//! Everything in this module is side-effect free: the state machine and
//! the drivers call these to turn stored pairs and header maps into
//! freshness numbers, conditional requests, and storable header sets.

use std::time::{Duration, SystemTime};

use http::header::{
    CONTENT_LENGTH, DATE, ETAG, EXPIRES, IF_MODIFIED_SINCE, IF_NONE_MATCH,
    LAST_MODIFIED, VARY,
};
use http::{HeaderMap, HeaderName};

use crate::headers::CacheControl;
use crate::model::{CompletePair, Request, Response};

/// Hop-by-hop fields, which are a property of the single connection the
/// response arrived on and must never be stored.
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "keep-alive",
    "te",
    "transfer-encoding",
    "upgrade",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
];

/// Heuristic freshness never exceeds one day.
const HEURISTIC_FRESHNESS_CAP: Duration = Duration::from_secs(24 * 3600);

/// Whether the stored pair may be reused for `request` under the stored
/// response's `Vary` header (RFC 9111 §4.1).
///
/// A `Vary: *` never matches. For every other listed field the request
/// and the stored request must carry byte-identical values; a field
/// absent on both sides matches.
#[must_use]
pub fn vary_headers_match(request: &Request, stored: &CompletePair) -> bool {
    for name in comma_values(&stored.response.headers, &VARY) {
        if name == "*" {
            return false;
        }
        let presented: Vec<_> =
            request.headers.get_all(name).iter().collect();
        let cached: Vec<_> =
            stored.request.headers.get_all(name).iter().collect();
        if presented != cached {
            return false;
        }
    }
    true
}

/// Current age of the stored response (RFC 9111 §4.2.3).
///
/// The pair records a single timestamp, so request time and response
/// time are treated as equal and the `corrected_age_value` reduces to the
/// `Age` header.
#[must_use]
pub fn get_age(pair: &CompletePair, now: SystemTime) -> Duration {
    let response_time = pair.meta.created_time();
    let date = header_date(&pair.response.headers, &DATE)
        .unwrap_or(response_time);

    let apparent_age =
        response_time.duration_since(date).unwrap_or_default();
    let corrected_age_value = Duration::from_secs(
        header_str(&pair.response.headers, &http::header::AGE)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0),
    );
    let corrected_initial_age = apparent_age.max(corrected_age_value);

    let resident_time =
        now.duration_since(response_time).unwrap_or_default();
    corrected_initial_age + resident_time
}

/// Explicit freshness lifetime of the stored response, if it has one
/// (RFC 9111 §4.2.1).
///
/// Priority: `s-maxage` (shared caches) over `max-age` over
/// `Expires - Date`. An unparseable `Expires` counts as already expired.
#[must_use]
pub fn get_freshness_lifetime(
    pair: &CompletePair,
    shared: bool,
) -> Option<Duration> {
    let cc = CacheControl::from_headers(&pair.response.headers);
    if shared {
        if let Some(s_maxage) = cc.s_maxage {
            return Some(Duration::from_secs(u64::from(s_maxage)));
        }
    }
    if let Some(max_age) = cc.max_age {
        return Some(Duration::from_secs(u64::from(max_age)));
    }
    if let Some(expires) = header_str(&pair.response.headers, &EXPIRES) {
        let date = header_date(&pair.response.headers, &DATE)
            .unwrap_or_else(|| pair.meta.created_time());
        return Some(match httpdate::parse_http_date(expires) {
            Ok(expires) => expires.duration_since(date).unwrap_or_default(),
            Err(_) => Duration::ZERO,
        });
    }
    None
}

/// Heuristic freshness for responses without explicit expiration
/// (RFC 9111 §4.2.2): one tenth of the interval between `Last-Modified`
/// and `Date`, capped at 24 hours. Zero when `Last-Modified` is absent.
#[must_use]
pub fn get_heuristic_freshness(pair: &CompletePair) -> Duration {
    let Some(last_modified) =
        header_date(&pair.response.headers, &LAST_MODIFIED)
    else {
        return Duration::ZERO;
    };
    let date = header_date(&pair.response.headers, &DATE)
        .unwrap_or_else(|| pair.meta.created_time());
    let since_modified =
        date.duration_since(last_modified).unwrap_or_default();
    (since_modified / 10).min(HEURISTIC_FRESHNESS_CAP)
}

/// Whether the stored response may be served stale at all
/// (RFC 9111 §4.2.4).
#[must_use]
pub fn allowed_stale(pair: &CompletePair, shared: bool) -> bool {
    let cc = CacheControl::from_headers(&pair.response.headers);
    !(cc.must_revalidate
        || (shared && cc.proxy_revalidate)
        || cc.no_cache.is_some()
        || (shared && cc.s_maxage.is_some()))
}

/// Turn `request` into a conditional request against the stored pair's
/// validators (RFC 9111 §4.3.1). Conditional headers already on the
/// request are replaced.
#[must_use]
pub fn make_conditional_request(
    mut request: Request,
    pair: &CompletePair,
) -> Request {
    request.headers.remove(IF_NONE_MATCH);
    request.headers.remove(IF_MODIFIED_SINCE);
    if let Some(etag) = pair.response.headers.get(ETAG) {
        request.headers.insert(IF_NONE_MATCH, etag.clone());
    }
    if let Some(last_modified) = pair.response.headers.get(LAST_MODIFIED) {
        request.headers.insert(IF_MODIFIED_SINCE, last_modified.clone());
    }
    request
}

/// Strip the fields that must not be stored (RFC 9111 §3.1): hop-by-hop
/// headers, fields named by `Cache-Control: no-cache="..."`, and, in a
/// shared cache, fields named by `Cache-Control: private="..."`.
#[must_use]
pub fn exclude_unstorable_headers(
    mut response: Response,
    shared: bool,
) -> Response {
    let cc = CacheControl::from_headers(&response.headers);

    for name in HOP_BY_HOP_HEADERS {
        response.headers.remove(*name);
    }
    let mut field_names: Vec<&String> = cc.no_cache_fields().iter().collect();
    if shared {
        field_names.extend(cc.private_fields());
    }
    for field in field_names {
        if let Ok(name) = HeaderName::try_from(field.as_str()) {
            response.headers.remove(name);
        }
    }
    response
}

/// Merge the header section of a validating response into the stored one
/// (RFC 9111 §3.2).
///
/// Fields present in `new` replace their stored counterparts, except
/// `Content-Length` and the hop-by-hop set, which keep describing the
/// stored body. Stored fields named by the new response's
/// `no-cache="..."` list are dropped.
#[must_use]
pub fn refresh_response_headers(
    stored: &HeaderMap,
    new: &HeaderMap,
) -> HeaderMap {
    let mut merged = stored.clone();

    let new_cc = CacheControl::from_headers(new);
    for field in new_cc.no_cache_fields() {
        if let Ok(name) = HeaderName::try_from(field.as_str()) {
            merged.remove(name);
        }
    }

    for name in new.keys() {
        if name == CONTENT_LENGTH
            || HOP_BY_HOP_HEADERS.contains(&name.as_str())
        {
            continue;
        }
        merged.remove(name);
        for value in new.get_all(name) {
            merged.append(name.clone(), value.clone());
        }
    }
    merged
}

/// First value of a header as a string, when it is valid UTF-8.
pub(crate) fn header_str<'a>(
    headers: &'a HeaderMap,
    name: &HeaderName,
) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// A header parsed as an HTTP date.
pub(crate) fn header_date(
    headers: &HeaderMap,
    name: &HeaderName,
) -> Option<SystemTime> {
    header_str(headers, name)
        .and_then(|v| httpdate::parse_http_date(v).ok())
}

/// All values of a header, split on commas and trimmed.
pub(crate) fn comma_values<'a>(
    headers: &'a HeaderMap,
    name: &HeaderName,
) -> impl Iterator<Item = &'a str> {
    headers
        .get_all(name)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{PairMeta, Request, Response};
    use http::{Method, StatusCode};
    use url::Url;
    use uuid::Uuid;

    fn pair(
        request_headers: &[(&str, &str)],
        response_headers: &[(&str, &str)],
    ) -> CompletePair {
        pair_created_at(request_headers, response_headers, 1_700_000_000.0)
    }

    fn pair_created_at(
        request_headers: &[(&str, &str)],
        response_headers: &[(&str, &str)],
        created_at: f64,
    ) -> CompletePair {
        let mut request = Request::new(
            Method::GET,
            Url::parse("https://example.com").unwrap(),
        );
        for (name, value) in request_headers {
            request.headers.append(
                HeaderName::try_from(*name).unwrap(),
                value.parse().unwrap(),
            );
        }
        let mut response = Response::new(StatusCode::OK);
        for (name, value) in response_headers {
            response.headers.append(
                HeaderName::try_from(*name).unwrap(),
                value.parse().unwrap(),
            );
        }
        CompletePair {
            id: Uuid::new_v4(),
            request,
            response,
            meta: PairMeta::at(created_at),
            cache_key: b"test".to_vec(),
        }
    }

    fn at(offset_secs: f64) -> SystemTime {
        std::time::UNIX_EPOCH
            + Duration::from_secs_f64(1_700_000_000.0 + offset_secs)
    }

    #[test]
    fn vary_matches_when_values_agree() {
        let stored = pair(
            &[("accept-encoding", "gzip")],
            &[("vary", "Accept-Encoding")],
        );
        let mut request = Request::new(
            Method::GET,
            Url::parse("https://example.com").unwrap(),
        );
        request
            .headers
            .insert("accept-encoding", "gzip".parse().unwrap());
        assert!(vary_headers_match(&request, &stored));

        request
            .headers
            .insert("accept-encoding", "br".parse().unwrap());
        assert!(!vary_headers_match(&request, &stored));
    }

    #[test]
    fn vary_star_never_matches() {
        let stored = pair(&[], &[("vary", "*")]);
        let request = Request::new(
            Method::GET,
            Url::parse("https://example.com").unwrap(),
        );
        assert!(!vary_headers_match(&request, &stored));
    }

    #[test]
    fn vary_absent_on_both_sides_matches() {
        let stored = pair(&[], &[("vary", "Accept-Encoding")]);
        let request = Request::new(
            Method::GET,
            Url::parse("https://example.com").unwrap(),
        );
        assert!(vary_headers_match(&request, &stored));
    }

    #[test]
    fn vary_compares_every_listed_field() {
        let stored = pair(
            &[("accept", "text/html"), ("accept-language", "en")],
            &[("vary", "Accept, Accept-Language")],
        );
        let mut request = Request::new(
            Method::GET,
            Url::parse("https://example.com").unwrap(),
        );
        request.headers.insert("accept", "text/html".parse().unwrap());
        request.headers.insert("accept-language", "en".parse().unwrap());
        assert!(vary_headers_match(&request, &stored));
        request.headers.remove("accept-language");
        assert!(!vary_headers_match(&request, &stored));
    }

    #[test]
    fn age_counts_residence_time() {
        let p = pair_created_at(&[], &[], 1_700_000_000.0);
        assert_eq!(get_age(&p, at(120.0)), Duration::from_secs(120));
    }

    #[test]
    fn age_header_contributes_to_initial_age() {
        let p = pair_created_at(&[], &[("age", "60")], 1_700_000_000.0);
        assert_eq!(get_age(&p, at(120.0)), Duration::from_secs(180));
    }

    #[test]
    fn apparent_age_wins_over_small_age_header() {
        // Date 100 seconds before the recorded response time
        let p = pair_created_at(
            &[],
            &[("date", "Tue, 14 Nov 2023 22:11:40 GMT"), ("age", "10")],
            1_700_000_000.0,
        );
        assert_eq!(get_age(&p, at(0.0)), Duration::from_secs(100));
    }

    #[test]
    fn freshness_prefers_s_maxage_in_shared_mode() {
        let p = pair(
            &[],
            &[("cache-control", "max-age=100, s-maxage=200")],
        );
        assert_eq!(
            get_freshness_lifetime(&p, true),
            Some(Duration::from_secs(200))
        );
        assert_eq!(
            get_freshness_lifetime(&p, false),
            Some(Duration::from_secs(100))
        );
    }

    #[test]
    fn freshness_falls_back_to_expires_minus_date() {
        let p = pair(
            &[],
            &[
                ("date", "Wed, 15 Nov 2023 00:00:00 GMT"),
                ("expires", "Wed, 15 Nov 2023 01:00:00 GMT"),
            ],
        );
        assert_eq!(
            get_freshness_lifetime(&p, false),
            Some(Duration::from_secs(3600))
        );
    }

    #[test]
    fn invalid_expires_means_already_expired() {
        let p = pair(&[], &[("expires", "0")]);
        assert_eq!(get_freshness_lifetime(&p, false), Some(Duration::ZERO));
    }

    #[test]
    fn no_explicit_freshness_is_unset() {
        let p = pair(&[], &[]);
        assert_eq!(get_freshness_lifetime(&p, false), None);
    }

    #[test]
    fn heuristic_freshness_is_a_tenth_of_last_modified_interval() {
        let p = pair(
            &[],
            &[
                ("date", "Wed, 15 Nov 2023 00:00:00 GMT"),
                ("last-modified", "Tue, 14 Nov 2023 14:00:00 GMT"),
            ],
        );
        assert_eq!(get_heuristic_freshness(&p), Duration::from_secs(3600));
    }

    #[test]
    fn heuristic_freshness_caps_at_one_day() {
        let p = pair(
            &[],
            &[
                ("date", "Wed, 15 Nov 2023 00:00:00 GMT"),
                ("last-modified", "Sat, 15 Nov 2003 00:00:00 GMT"),
            ],
        );
        assert_eq!(get_heuristic_freshness(&p), Duration::from_secs(86400));
    }

    #[test]
    fn heuristic_freshness_without_last_modified_is_zero() {
        let p = pair(&[], &[]);
        assert_eq!(get_heuristic_freshness(&p), Duration::ZERO);
    }

    #[test]
    fn stale_use_respects_response_directives() {
        assert!(allowed_stale(&pair(&[], &[]), false));
        assert!(!allowed_stale(
            &pair(&[], &[("cache-control", "must-revalidate")]),
            false
        ));
        assert!(!allowed_stale(
            &pair(&[], &[("cache-control", "no-cache")]),
            false
        ));
        let proxy_revalidate =
            pair(&[], &[("cache-control", "proxy-revalidate")]);
        assert!(allowed_stale(&proxy_revalidate, false));
        assert!(!allowed_stale(&proxy_revalidate, true));
        let s_maxage = pair(&[], &[("cache-control", "s-maxage=60")]);
        assert!(allowed_stale(&s_maxage, false));
        assert!(!allowed_stale(&s_maxage, true));
    }

    #[test]
    fn conditional_request_carries_stored_validators() {
        let stored = pair(
            &[],
            &[
                ("etag", "\"v1\""),
                ("last-modified", "Tue, 14 Nov 2023 14:00:00 GMT"),
            ],
        );
        let mut request = Request::new(
            Method::GET,
            Url::parse("https://example.com").unwrap(),
        );
        request
            .headers
            .insert(IF_NONE_MATCH, "\"stale\"".parse().unwrap());
        let conditional = make_conditional_request(request, &stored);
        assert_eq!(
            conditional.headers.get(IF_NONE_MATCH).unwrap(),
            "\"v1\""
        );
        assert_eq!(
            conditional.headers.get(IF_MODIFIED_SINCE).unwrap(),
            "Tue, 14 Nov 2023 14:00:00 GMT"
        );
    }

    #[test]
    fn conditional_request_drops_stale_conditions_without_validators() {
        let stored = pair(&[], &[]);
        let mut request = Request::new(
            Method::GET,
            Url::parse("https://example.com").unwrap(),
        );
        request
            .headers
            .insert(IF_NONE_MATCH, "\"stale\"".parse().unwrap());
        let conditional = make_conditional_request(request, &stored);
        assert!(conditional.headers.get(IF_NONE_MATCH).is_none());
        assert!(conditional.headers.get(IF_MODIFIED_SINCE).is_none());
    }

    #[test]
    fn unstorable_headers_are_stripped() {
        let mut response = Response::new(StatusCode::OK);
        for (name, value) in [
            ("keep-alive", "timeout=5"),
            ("te", "trailers"),
            ("transfer-encoding", "chunked"),
            ("upgrade", "websocket"),
            ("proxy-connection", "keep-alive"),
            ("proxy-authenticate", "Basic"),
            ("proxy-authorization", "Basic xyz"),
            ("content-type", "text/plain"),
            ("cache-control", "max-age=3600"),
        ] {
            response
                .headers
                .insert(HeaderName::try_from(name).unwrap(), value.parse().unwrap());
        }
        let response = exclude_unstorable_headers(response, false);
        for name in HOP_BY_HOP_HEADERS {
            assert!(!response.headers.contains_key(*name), "{name} kept");
        }
        assert!(response.headers.contains_key("content-type"));
        assert!(response.headers.contains_key("cache-control"));
    }

    #[test]
    fn no_cache_fields_are_stripped() {
        let mut response = Response::new(StatusCode::OK);
        response.headers.insert(
            "cache-control",
            "no-cache=\"Content-Type, ETag\"".parse().unwrap(),
        );
        response
            .headers
            .insert("content-type", "text/plain".parse().unwrap());
        response.headers.insert("etag", "abc123".parse().unwrap());
        response.headers.insert(
            "last-modified",
            "Wed, 21 Oct 2015 07:28:00 GMT".parse().unwrap(),
        );
        let response = exclude_unstorable_headers(response, false);
        assert!(!response.headers.contains_key("content-type"));
        assert!(!response.headers.contains_key("etag"));
        assert!(response.headers.contains_key("last-modified"));
    }

    #[test]
    fn private_fields_are_stripped_only_in_shared_mode() {
        let build = || {
            let mut response = Response::new(StatusCode::OK);
            response.headers.insert(
                "cache-control",
                "private=\"Set-Cookie, Authorization\"".parse().unwrap(),
            );
            response
                .headers
                .insert("set-cookie", "id=123".parse().unwrap());
            response
                .headers
                .insert("authorization", "Bearer xyz".parse().unwrap());
            response
                .headers
                .insert("content-type", "text/plain".parse().unwrap());
            response
        };
        let shared = exclude_unstorable_headers(build(), true);
        assert!(!shared.headers.contains_key("set-cookie"));
        assert!(!shared.headers.contains_key("authorization"));
        assert!(shared.headers.contains_key("content-type"));

        let private = exclude_unstorable_headers(build(), false);
        assert!(private.headers.contains_key("set-cookie"));
        assert!(private.headers.contains_key("authorization"));
    }

    #[test]
    fn refreshed_headers_overwrite_stored_ones() {
        let mut stored = HeaderMap::new();
        stored.insert("etag", "\"v1\"".parse().unwrap());
        stored.insert("content-length", "2".parse().unwrap());
        stored.insert("x-old", "keep".parse().unwrap());

        let mut new = HeaderMap::new();
        new.insert("etag", "\"v1\"".parse().unwrap());
        new.insert("content-length", "0".parse().unwrap());
        new.insert("date", "Wed, 15 Nov 2023 00:00:00 GMT".parse().unwrap());

        let merged = refresh_response_headers(&stored, &new);
        assert_eq!(merged.get("etag").unwrap(), "\"v1\"");
        // Content-Length keeps describing the stored body
        assert_eq!(merged.get("content-length").unwrap(), "2");
        assert_eq!(merged.get("x-old").unwrap(), "keep");
        assert_eq!(
            merged.get("date").unwrap(),
            "Wed, 15 Nov 2023 00:00:00 GMT"
        );
    }

    #[test]
    fn refresh_drops_fields_named_by_new_no_cache_list() {
        let mut stored = HeaderMap::new();
        stored.insert("set-cookie", "id=1".parse().unwrap());
        stored.insert("content-type", "text/plain".parse().unwrap());

        let mut new = HeaderMap::new();
        new.insert(
            "cache-control",
            "no-cache=\"Set-Cookie\"".parse().unwrap(),
        );

        let merged = refresh_response_headers(&stored, &new);
        assert!(!merged.contains_key("set-cookie"));
        assert!(merged.contains_key("content-type"));
    }
}
