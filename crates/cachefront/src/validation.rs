//! Revalidation of stale entries with conditional requests.

use crate::headers::{http_date, RequestHeaders, ResponseHeaders};
use http::header;
use http::StatusCode;

/// Make `request` conditional on the cached entry: `If-None-Match` from its
/// `ETag`, `If-Modified-Since` from a valid `Last-Modified` or else `Date`.
pub fn inject_validation_headers(request: &mut RequestHeaders, cached: &ResponseHeaders) {
    if let Some(etag) = cached.headers.get(header::ETAG) {
        request.headers.insert(header::IF_NONE_MATCH, etag.clone());
    }

    let since = if http_date(&cached.headers, &header::LAST_MODIFIED).is_some() {
        cached.headers.get(header::LAST_MODIFIED)
    } else {
        cached.headers.get(header::DATE)
    };
    if let Some(since) = since {
        request.headers.insert(header::IF_MODIFIED_SINCE, since.clone());
    }
}

/// A 304 refreshes the stored entry unless it carries an `ETag` that differs
/// from the cached one.
pub fn should_update_cached_entry(not_modified: &ResponseHeaders, cached: &ResponseHeaders) -> bool {
    debug_assert_eq!(not_modified.status, StatusCode::NOT_MODIFIED);
    match not_modified.headers.get(header::ETAG) {
        None => true,
        Some(etag) => cached.headers.get(header::ETAG) == Some(etag),
    }
}

/// Turn a 304 into the response to serve: the cached status, the 304's
/// headers, and every cached header the 304 lacks. The cached `Age` is
/// dropped since a validated response is as good as fresh.
pub fn merge_not_modified(not_modified: &mut ResponseHeaders, cached: &mut ResponseHeaders) {
    if not_modified.status != StatusCode::NOT_MODIFIED {
        tracing::error!(status = %not_modified.status, "validation merge on a non-304 response");
        debug_assert!(false, "validation merge on a non-304 response");
        return;
    }

    not_modified.status = cached.status;
    not_modified.headers.remove(header::CONTENT_LENGTH);
    cached.headers.remove(header::AGE);

    for name in cached.headers.keys() {
        if not_modified.headers.contains_key(name) {
            continue;
        }
        for value in cached.headers.get_all(name) {
            not_modified.headers.append(name.clone(), value.clone());
        }
    }
}
