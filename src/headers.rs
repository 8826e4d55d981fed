//! The `Cache-Control` model.
//!
//! Parses the header into structured directives once, up front, so the
//! freshness and storability decisions elsewhere in the crate operate on
//! typed fields instead of re-scanning header strings.

use http::header::CACHE_CONTROL;
use http::HeaderMap;

/// Directive arguments are clamped at this value (`2^31 - 1` seconds).
const MAX_DIRECTIVE_SECONDS: u32 = 2_147_483_647;

/// The argument of a `no-cache` or `private` response directive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldList {
    /// The directive was given without an argument and applies to the
    /// whole response.
    Bare,
    /// The directive is limited to the named fields (canonicalized to
    /// Title-Case).
    Fields(Vec<String>),
}

impl FieldList {
    /// The field names this directive is limited to; empty for the bare
    /// form.
    #[must_use]
    pub fn fields(&self) -> &[String] {
        match self {
            FieldList::Bare => &[],
            FieldList::Fields(fields) => fields,
        }
    }
}

/// Parsed `Cache-Control` directives.
///
/// Every field defaults to "unset": numeric directives to `None`, boolean
/// directives to `false`, and the tri-state `no_cache`/`private`
/// directives to `None`. Unrecognized directives are preserved in
/// [`extensions`](CacheControl::extensions).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheControl {
    /// `max-age` in seconds
    pub max_age: Option<u32>,
    /// `s-maxage` in seconds (shared caches only)
    pub s_maxage: Option<u32>,
    /// `max-stale` in seconds; the bare form parses as the maximum value,
    /// meaning the client accepts a stale response of any age
    pub max_stale: Option<u32>,
    /// `min-fresh` in seconds
    pub min_fresh: Option<u32>,
    /// `stale-if-error` in seconds
    pub stale_if_error: Option<u32>,
    /// `stale-while-revalidate` in seconds
    pub stale_while_revalidate: Option<u32>,
    /// `no-store`
    pub no_store: bool,
    /// `no-transform`
    pub no_transform: bool,
    /// `only-if-cached`
    pub only_if_cached: bool,
    /// `must-revalidate`
    pub must_revalidate: bool,
    /// `must-understand`
    pub must_understand: bool,
    /// `public`
    pub public: bool,
    /// `proxy-revalidate`
    pub proxy_revalidate: bool,
    /// `immutable`
    pub immutable: bool,
    /// `no-cache`, either bare or limited to named fields
    pub no_cache: Option<FieldList>,
    /// `private`, either bare or limited to named fields
    pub private: Option<FieldList>,
    /// Unrecognized directives, preserved as `name` or `name=value`
    pub extensions: Vec<String>,
}

impl CacheControl {
    /// Parse the `Cache-Control` values of a header map.
    ///
    /// Multiple header lines are combined into one directive list before
    /// parsing.
    #[must_use]
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let combined = headers
            .get_all(CACHE_CONTROL)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect::<Vec<_>>()
            .join(", ");
        parse_cache_control(&combined)
    }

    /// The field names of a `no-cache="..."` directive; empty when the
    /// directive is absent or bare.
    #[must_use]
    pub fn no_cache_fields(&self) -> &[String] {
        self.no_cache.as_ref().map(FieldList::fields).unwrap_or(&[])
    }

    /// The field names of a `private="..."` directive; empty when the
    /// directive is absent or bare.
    #[must_use]
    pub fn private_fields(&self) -> &[String] {
        self.private.as_ref().map(FieldList::fields).unwrap_or(&[])
    }
}

/// Parse a `Cache-Control` header value into structured directives.
///
/// Parsing never fails: malformed directives degrade to their unset
/// state, and unrecognized directives are carried through verbatim in
/// [`CacheControl::extensions`]. Numeric arguments are parsed as
/// non-negative decimal integers and clamped at `2^31 - 1`; anything else
/// (negative, non-numeric, empty) collapses to unset. For directives that
/// appear more than once the last occurrence wins.
#[must_use]
pub fn parse_cache_control(input: &str) -> CacheControl {
    let mut cc = CacheControl::default();

    for raw in split_directives(input) {
        let raw = raw.trim();
        if raw.is_empty() {
            continue;
        }
        let (name, value) = match raw.split_once('=') {
            Some((name, value)) => (name.trim(), Some(value.trim())),
            None => (raw, None),
        };
        if name.is_empty() {
            continue;
        }
        let unquoted = value.map(unquote);
        match name.to_ascii_lowercase().as_str() {
            "max-age" => cc.max_age = parse_seconds(unquoted.as_deref()),
            "s-maxage" => cc.s_maxage = parse_seconds(unquoted.as_deref()),
            "min-fresh" => cc.min_fresh = parse_seconds(unquoted.as_deref()),
            "stale-if-error" => {
                cc.stale_if_error = parse_seconds(unquoted.as_deref())
            }
            "stale-while-revalidate" => {
                cc.stale_while_revalidate =
                    parse_seconds(unquoted.as_deref())
            }
            "max-stale" => {
                // The bare form means "accept a stale response of any age"
                cc.max_stale = match unquoted.as_deref() {
                    None => Some(MAX_DIRECTIVE_SECONDS),
                    value => parse_seconds(value),
                }
            }
            "no-cache" => cc.no_cache = Some(field_list(unquoted.as_deref())),
            "private" => cc.private = Some(field_list(unquoted.as_deref())),
            "no-store" => cc.no_store = true,
            "no-transform" => cc.no_transform = true,
            "only-if-cached" => cc.only_if_cached = true,
            "must-revalidate" => cc.must_revalidate = true,
            "must-understand" => cc.must_understand = true,
            "public" => cc.public = true,
            "proxy-revalidate" => cc.proxy_revalidate = true,
            "immutable" => cc.immutable = true,
            _ => {
                let ext = match &unquoted {
                    Some(value) => format!("{name}={value}"),
                    None => name.to_string(),
                };
                cc.extensions.push(ext);
            }
        }
    }

    cc
}

/// Split a directive list on commas, honoring quoted strings and
/// `\`-escapes so that `no-cache="Set-Cookie, Authorization"` stays one
/// directive.
fn split_directives(input: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut escaped = false;

    for c in input.chars() {
        if in_quotes {
            current.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_quotes = false;
            }
        } else if c == ',' {
            parts.push(std::mem::take(&mut current));
        } else {
            if c == '"' {
                in_quotes = true;
            }
            current.push(c);
        }
    }
    parts.push(current);
    parts
}

/// Strip optional double quotes and resolve `\`-escapes inside them.
fn unquote(value: &str) -> String {
    let value = value.trim();
    let Some(inner) =
        value.strip_prefix('"').and_then(|v| v.strip_suffix('"'))
    else {
        return value.to_string();
    };
    let mut out = String::with_capacity(inner.len());
    let mut escaped = false;
    for c in inner.chars() {
        if escaped {
            out.push(c);
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else {
            out.push(c);
        }
    }
    out
}

/// Parse a non-negative decimal count of seconds, clamped at `2^31 - 1`.
/// Invalid or negative input yields `None`.
fn parse_seconds(value: Option<&str>) -> Option<u32> {
    let value = value?.trim();
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    match value.parse::<u64>() {
        Ok(n) => Some(n.min(u64::from(MAX_DIRECTIVE_SECONDS)) as u32),
        // All-digit but too large for u64; clamp like any other overflow
        Err(_) => Some(MAX_DIRECTIVE_SECONDS),
    }
}

/// Interpret a `no-cache`/`private` argument: bare means the whole
/// response, a quoted list limits the directive to named fields.
fn field_list(value: Option<&str>) -> FieldList {
    match value {
        None => FieldList::Bare,
        Some(value) if value.trim().is_empty() => FieldList::Bare,
        Some(value) => FieldList::Fields(
            value
                .split(',')
                .map(str::trim)
                .filter(|f| !f.is_empty())
                .map(titlecase_field_name)
                .collect(),
        ),
    }
}

/// Canonicalize a field name to Title-Case, e.g. `set-cookie` to
/// `Set-Cookie`.
pub(crate) fn titlecase_field_name(name: &str) -> String {
    name.split('-')
        .map(|segment| {
            let mut chars = segment.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string()
                    + &chars.as_str().to_ascii_lowercase(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}
