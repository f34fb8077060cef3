//! Header snapshots and the cache-relevant header logic: `Cache-Control`
//! parsing, request/response cacheability and the `Vary` allow-list.

use http::header::{self, HeaderName};
use http::{HeaderMap, Method, StatusCode, Uri};
use std::time::{Duration, SystemTime};

/// Request line and headers as seen by the filter.
#[derive(Clone, Debug)]
pub struct RequestHeaders {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
}

impl RequestHeaders {
    pub fn new(method: Method, uri: Uri) -> Self {
        Self {
            method,
            uri,
            headers: HeaderMap::new(),
        }
    }

    /// Host from the URI authority, falling back to the `Host` header.
    pub fn host(&self) -> Option<&str> {
        self.uri
            .authority()
            .map(|a| a.as_str())
            .or_else(|| self.headers.get(header::HOST).and_then(|v| v.to_str().ok()))
            .filter(|h| !h.is_empty())
    }

    /// Scheme from the URI, falling back to `x-forwarded-proto`.
    pub fn scheme(&self) -> Option<&str> {
        self.uri.scheme_str().or_else(|| {
            self.headers
                .get(X_FORWARDED_PROTO)
                .and_then(|v| v.to_str().ok())
        })
    }
}

/// Response status and headers. Cloned freely between the coordination hub
/// and its views.
#[derive(Clone, Debug)]
pub struct ResponseHeaders {
    pub status: StatusCode,
    pub headers: HeaderMap,
}

impl ResponseHeaders {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
        }
    }

    pub fn get_str(&self, name: &HeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn content_length(&self) -> Option<u64> {
        self.get_str(&header::CONTENT_LENGTH)?.trim().parse().ok()
    }
}

pub const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");

/// Parse an HTTP-date header value.
pub fn http_date(headers: &HeaderMap, name: &HeaderName) -> Option<SystemTime> {
    let value = headers.get(name)?.to_str().ok()?;
    httpdate::parse_http_date(value.trim()).ok()
}

/// Directives a client may send in a request `Cache-Control` header.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RequestCacheControl {
    /// `no-cache`: a cached response must be validated before use.
    pub must_validate: bool,
    pub no_store: bool,
    pub no_transform: bool,
    pub only_if_cached: bool,
    pub max_age: Option<Duration>,
    pub min_fresh: Option<Duration>,
    /// `max-stale` without a value accepts any staleness.
    pub max_stale: Option<Duration>,
}

impl RequestCacheControl {
    pub fn parse(value: &str) -> Self {
        let mut result = Self::default();
        for (name, arg) in directives(value) {
            match name.as_str() {
                "no-cache" => result.must_validate = true,
                "no-store" => result.no_store = true,
                "no-transform" => result.no_transform = true,
                "only-if-cached" => result.only_if_cached = true,
                "max-age" => result.max_age = arg.and_then(parse_seconds),
                "min-fresh" => result.min_fresh = arg.and_then(parse_seconds),
                "max-stale" => {
                    result.max_stale = match arg {
                        Some(a) => parse_seconds(a),
                        None => Some(Duration::MAX),
                    }
                }
                _ => {}
            }
        }
        result
    }

    /// Request directives, honouring `Pragma: no-cache` when no
    /// `Cache-Control` header is present.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        match joined(headers, &header::CACHE_CONTROL) {
            Some(value) => Self::parse(&value),
            None => {
                let pragma_no_cache = joined(headers, &header::PRAGMA)
                    .map(|p| directives(&p).any(|(name, _)| name == "no-cache"))
                    .unwrap_or(false);
                Self {
                    must_validate: pragma_no_cache,
                    ..Self::default()
                }
            }
        }
    }
}

/// Directives an origin may send in a response `Cache-Control` header.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResponseCacheControl {
    /// `no-cache`.
    pub must_validate: bool,
    /// `no-store` or `private`.
    pub no_store: bool,
    pub no_transform: bool,
    /// `must-revalidate` or `proxy-revalidate`: never serve stale.
    pub no_stale: bool,
    pub is_public: bool,
    /// `s-maxage` when present, else `max-age`.
    pub max_age: Option<Duration>,
}

impl ResponseCacheControl {
    pub fn parse(value: &str) -> Self {
        let mut result = Self::default();
        let mut s_maxage = None;
        for (name, arg) in directives(value) {
            match name.as_str() {
                "no-cache" => result.must_validate = true,
                "no-store" | "private" => result.no_store = true,
                "no-transform" => result.no_transform = true,
                "must-revalidate" | "proxy-revalidate" => result.no_stale = true,
                "public" => result.is_public = true,
                "max-age" => result.max_age = arg.and_then(parse_seconds),
                // s-maxage takes precedence for shared caches
                "s-maxage" => s_maxage = arg.and_then(parse_seconds),
                _ => {}
            }
        }
        if s_maxage.is_some() {
            result.max_age = s_maxage;
        }
        result
    }

    pub fn from_headers(headers: &HeaderMap) -> Self {
        joined(headers, &header::CACHE_CONTROL)
            .map(|v| Self::parse(&v))
            .unwrap_or_default()
    }
}

fn directives(value: &str) -> impl Iterator<Item = (String, Option<&str>)> {
    value.split(',').filter_map(|raw| {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }
        Some(match raw.split_once('=') {
            Some((name, arg)) => (
                name.trim().to_ascii_lowercase(),
                Some(arg.trim().trim_matches('"')),
            ),
            None => (raw.to_ascii_lowercase(), None),
        })
    })
}

fn parse_seconds(arg: &str) -> Option<Duration> {
    arg.parse::<u64>().ok().map(Duration::from_secs)
}

/// All values of a possibly repeated header, joined with `,`.
fn joined(headers: &HeaderMap, name: &HeaderName) -> Option<String> {
    let mut values = headers.get_all(name).iter().filter_map(|v| v.to_str().ok());
    let first = values.next()?.to_string();
    Some(values.fold(first, |mut acc, v| {
        acc.push(',');
        acc.push_str(v);
        acc
    }))
}

/// Request headers whose values may select among cached variants.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VaryAllowList {
    names: Vec<HeaderName>,
}

impl VaryAllowList {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut list = Vec::new();
        for name in names {
            match HeaderName::from_bytes(name.as_ref().trim().as_bytes()) {
                Ok(n) if !list.contains(&n) => list.push(n),
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(header = name.as_ref(), error = %e, "ignoring invalid vary allow-list entry");
                }
            }
        }
        Self { names: list }
    }

    pub fn names(&self) -> &[HeaderName] {
        &self.names
    }

    /// Whether every header named by the response `Vary` is allowed. `*`
    /// never is.
    pub fn allows_vary(&self, response: &HeaderMap) -> bool {
        let Some(vary) = joined(response, &header::VARY) else {
            return true;
        };
        vary.split(',')
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .all(|n| n != "*" && self.names.iter().any(|a| a.as_str().eq_ignore_ascii_case(n)))
    }

    /// `name=value` pairs of the allowed headers present on the request, in
    /// allow-list order.
    pub fn request_values(&self, request: &HeaderMap) -> Vec<String> {
        self.names
            .iter()
            .filter_map(|name| {
                let values = joined(request, name)?;
                Some(format!("{}={}", name.as_str(), values))
            })
            .collect()
    }
}

const CONDITIONAL_HEADERS: [HeaderName; 5] = [
    header::IF_MATCH,
    header::IF_NONE_MATCH,
    header::IF_MODIFIED_SINCE,
    header::IF_UNMODIFIED_SINCE,
    header::IF_RANGE,
];

/// Whether a request may be answered from (or populate) the cache.
pub fn can_serve_request_from_cache(request: &RequestHeaders) -> bool {
    let method_ok = request.method == Method::GET || request.method == Method::HEAD;
    let scheme_ok = matches!(request.scheme(), Some("http") | Some("https"));
    let has_path = !request.uri.path().is_empty();

    method_ok
        && scheme_ok
        && has_path
        && request.host().is_some()
        && !request.headers.contains_key(header::AUTHORIZATION)
        && !CONDITIONAL_HEADERS
            .iter()
            .any(|h| request.headers.contains_key(h))
}

fn cacheable_status(status: StatusCode) -> bool {
    matches!(
        status.as_u16(),
        200 | 203 | 204 | 206 | 300 | 301 | 308 | 404 | 405 | 410 | 414 | 451 | 501
    )
}

/// Whether an origin response may be stored.
pub fn is_cacheable_response(response: &ResponseHeaders, allow_list: &VaryAllowList) -> bool {
    let cache_control = ResponseCacheControl::from_headers(&response.headers);
    if cache_control.no_store || !cacheable_status(response.status) {
        return false;
    }

    let has_validation_data = cache_control.must_validate
        || cache_control.max_age.is_some()
        || (response.headers.contains_key(header::DATE)
            && response.headers.contains_key(header::EXPIRES));

    has_validation_data && allow_list.allows_vary(&response.headers)
}
