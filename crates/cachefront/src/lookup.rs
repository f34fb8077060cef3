//! Lookup inputs and outputs: the request snapshot a backend is asked about,
//! and the freshness verdict it hands back.

use crate::headers::{http_date, RequestCacheControl, RequestHeaders, ResponseCacheControl, ResponseHeaders, VaryAllowList};
use crate::key::Key;
use crate::range::RangeDetails;
use http::header::{self, HeaderValue};
use http::{HeaderMap, Method, StatusCode};
use std::time::{Duration, SystemTime};

/// Verdict of a cache lookup.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheEntryStatus {
    /// Fresh entry, serve it.
    Ok,
    /// Nothing usable, go to the origin.
    Unusable,
    /// Stale or `no-cache`: validate with the origin first.
    RequiresValidation,
    /// The backend validated the entry itself. Not supported by the filter.
    FoundNotModified,
    /// The backend failed.
    LookupError,
}

/// Facts recorded alongside a stored response.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResponseMetadata {
    pub response_time: SystemTime,
}

/// Result of a lookup, owned and adjusted by the filter.
#[derive(Clone, Debug)]
pub struct LookupResult {
    pub status: CacheEntryStatus,
    pub headers: Option<ResponseHeaders>,
    pub content_length: Option<u64>,
    pub range_details: Option<RangeDetails>,
}

impl LookupResult {
    pub fn unusable() -> Self {
        Self::with_status(CacheEntryStatus::Unusable)
    }

    pub fn lookup_error() -> Self {
        Self::with_status(CacheEntryStatus::LookupError)
    }

    fn with_status(status: CacheEntryStatus) -> Self {
        Self {
            status,
            headers: None,
            content_length: None,
            range_details: None,
        }
    }

    /// Overwrite the content length, keeping the header in sync.
    pub fn set_content_length(&mut self, length: u64) {
        self.content_length = Some(length);
        if let Some(headers) = self.headers.as_mut() {
            headers
                .headers
                .insert(header::CONTENT_LENGTH, HeaderValue::from(length));
        }
    }
}

/// Request-side input to a lookup.
#[derive(Clone, Debug)]
pub struct LookupRequest {
    key: Key,
    method: Method,
    range_header: Option<String>,
    cache_control: RequestCacheControl,
    timestamp: SystemTime,
}

impl LookupRequest {
    pub fn new(
        request: &RequestHeaders,
        timestamp: SystemTime,
        allow_list: &VaryAllowList,
        ignore_request_cache_control: bool,
    ) -> Self {
        let cache_control = if ignore_request_cache_control {
            RequestCacheControl::default()
        } else {
            RequestCacheControl::from_headers(&request.headers)
        };

        Self {
            key: Key::from_request(request, allow_list),
            method: request.method.clone(),
            range_header: request
                .headers
                .get(header::RANGE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
            cache_control,
            timestamp,
        }
    }

    pub fn key(&self) -> &Key {
        &self.key
    }

    pub fn is_head(&self) -> bool {
        self.method == Method::HEAD
    }

    pub fn cache_control(&self) -> &RequestCacheControl {
        &self.cache_control
    }

    /// Judge a stored response against this request. Rewrites the `Age`
    /// header to the entry's current age.
    pub fn make_lookup_result(
        &self,
        mut headers: ResponseHeaders,
        metadata: ResponseMetadata,
        content_length: Option<u64>,
    ) -> LookupResult {
        let age = calculate_age(&headers.headers, metadata.response_time, self.timestamp);
        headers
            .headers
            .insert(header::AGE, HeaderValue::from(age.as_secs()));

        let status = if self.requires_validation(&headers.headers, age) {
            CacheEntryStatus::RequiresValidation
        } else {
            CacheEntryStatus::Ok
        };

        let range_details = match (&self.range_header, content_length) {
            (Some(range), Some(len))
                if self.method == Method::GET && headers.status == StatusCode::OK =>
            {
                RangeDetails::from_header(range, len)
            }
            _ => None,
        };

        LookupResult {
            status,
            headers: Some(headers),
            content_length,
            range_details,
        }
    }

    fn requires_validation(&self, headers: &HeaderMap, age: Duration) -> bool {
        let response_cc = ResponseCacheControl::from_headers(headers);
        let lifetime = freshness_lifetime(&response_cc, headers);
        let fresh = age < lifetime;

        if response_cc.must_validate
            || self.cache_control.must_validate
            || (!fresh && response_cc.no_stale)
        {
            return true;
        }

        if let Some(max_age) = self.cache_control.max_age {
            if age > max_age {
                return true;
            }
        }

        if fresh {
            match self.cache_control.min_fresh {
                Some(min_fresh) => lifetime - age < min_fresh,
                None => false,
            }
        } else {
            match self.cache_control.max_stale {
                Some(max_stale) => age - lifetime > max_stale,
                None => true,
            }
        }
    }
}

/// Current age of a stored response, in whole seconds: the larger of the
/// apparent age and the `Age` header, plus the time spent in this cache.
pub fn calculate_age(headers: &HeaderMap, response_time: SystemTime, now: SystemTime) -> Duration {
    let resident = now.duration_since(response_time).unwrap_or_default();
    let apparent = http_date(headers, &header::DATE)
        .and_then(|date| response_time.duration_since(date).ok())
        .unwrap_or_default();
    let age_header = headers
        .get(header::AGE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or_default();

    let age = apparent.max(age_header) + resident;
    Duration::from_secs(age.as_secs())
}

/// `s-maxage`/`max-age`, else `Expires - Date`, else zero.
pub fn freshness_lifetime(cache_control: &ResponseCacheControl, headers: &HeaderMap) -> Duration {
    if let Some(max_age) = cache_control.max_age {
        return max_age;
    }
    match (
        http_date(headers, &header::EXPIRES),
        http_date(headers, &header::DATE),
    ) {
        (Some(expires), Some(date)) => expires.duration_since(date).unwrap_or_default(),
        _ => Duration::ZERO,
    }
}
