//! The per-request cache filter.
//!
//! [`CacheFilter::decode_headers`] drives one request end to end: it decides
//! whether the request may use the cache, looks it up, and then either
//! serves the cached response, revalidates it with the origin, or fetches
//! from the origin while feeding an insert. Requests the filter does not
//! handle are returned to the host with [`FilterHeadersStatus::Continue`].
//!
//! Dropping the future returned by `decode_headers` cancels whatever the
//! filter was waiting on. The host then reports the reply it produced
//! instead through [`CacheFilter::on_local_reply`].

use crate::backend::{HttpCache, InsertContext, LookupContext};
use crate::error::{OriginError, StreamClosed};
use crate::headers::{can_serve_request_from_cache, is_cacheable_response, RequestHeaders, ResponseHeaders, VaryAllowList};
use crate::lookup::{CacheEntryStatus, LookupRequest, LookupResult, ResponseMetadata};
use crate::range::AdjustedByteRange;
use crate::status::{CacheFilterLoggingInfo, InsertStatus, LookupStatus};
use crate::tasks::TaskRegistry;
use crate::time::{SystemClock, TimeSource};
use crate::upstream::{Origin, UpstreamEvent, UpstreamRequest, Verdict};
use crate::validation::{inject_validation_headers, merge_not_modified, should_update_cached_entry};
use async_trait::async_trait;
use bytes::Bytes;
use http::header::{self, HeaderValue};
use http::{HeaderMap, StatusCode};
use std::sync::Arc;

/// Response code details set when the response comes from the cache.
pub const RESPONSE_FROM_CACHE_DETAILS: &str = "cache.response_from_cache_filter";

/// Per-fetch cap on cached body reads when the stream has no buffer limit.
pub const MAX_BYTES_PER_FETCH: u64 = 64 * 1024 * 1024;

#[derive(Clone, Debug, Default)]
pub struct FilterConfig {
    pub allow_list: VaryAllowList,
    pub ignore_request_cache_control: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FilterState {
    Initial,
    /// Serving a fresh hit.
    DecodeServingFromCache,
    /// Serving an entry the origin just validated.
    EncodeServingFromCache,
    ValidatingCachedResponse,
    ResponseServedFromCache,
    NotServingFromCache,
    Destroyed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FilterHeadersStatus {
    /// The host forwards the request itself.
    Continue,
    /// The filter produced the response.
    StopIteration,
}

/// What the host records about a stream.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StreamInfo {
    pub response_from_cache: bool,
    pub response_code_details: Option<String>,
    pub cache_logging: Option<CacheFilterLoggingInfo>,
}

/// The response side of the stream, as seen by the filter.
#[async_trait]
pub trait Downstream: Send {
    async fn encode_headers(&mut self, headers: ResponseHeaders, end_stream: bool) -> Result<(), StreamClosed>;

    async fn encode_data(&mut self, data: Bytes, end_stream: bool) -> Result<(), StreamClosed>;

    async fn encode_trailers(&mut self, trailers: HeaderMap) -> Result<(), StreamClosed>;

    async fn send_local_reply(&mut self, status: StatusCode, details: &'static str);

    fn reset_stream(&mut self);

    /// Largest chunk the stream wants at once. 0 means no limit.
    fn buffer_limit(&self) -> u64 {
        0
    }

    fn stream_info_mut(&mut self) -> &mut StreamInfo;
}

pub struct CacheFilter {
    config: Arc<FilterConfig>,
    cache: Option<Arc<dyn HttpCache>>,
    origin: Arc<dyn Origin>,
    tasks: TaskRegistry,
    clock: Arc<dyn TimeSource>,

    state: FilterState,
    lookup: Option<Box<dyn LookupContext>>,
    lookup_result: Option<LookupResult>,
    upstream: Option<UpstreamRequest>,
    request_allows_inserts: bool,
    is_head: bool,
    insert_status: Option<InsertStatus>,
    insert_active: bool,
    remaining_ranges: Vec<AdjustedByteRange>,
}

impl CacheFilter {
    pub fn new(
        config: Arc<FilterConfig>,
        cache: Option<Arc<dyn HttpCache>>,
        origin: Arc<dyn Origin>,
        tasks: TaskRegistry,
    ) -> Self {
        Self {
            config,
            cache,
            origin,
            tasks,
            clock: Arc::new(SystemClock),
            state: FilterState::Initial,
            lookup: None,
            lookup_result: None,
            upstream: None,
            request_allows_inserts: false,
            is_head: false,
            insert_status: None,
            insert_active: false,
            remaining_ranges: Vec::new(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn TimeSource>) -> Self {
        self.clock = clock;
        self
    }

    pub fn state(&self) -> FilterState {
        self.state
    }

    pub async fn decode_headers(
        &mut self,
        request: RequestHeaders,
        end_stream: bool,
        downstream: &mut dyn Downstream,
    ) -> FilterHeadersStatus {
        if self.state == FilterState::Destroyed {
            return FilterHeadersStatus::Continue;
        }
        let Some(cache) = self.cache.clone() else {
            self.state = FilterState::NotServingFromCache;
            return FilterHeadersStatus::Continue;
        };
        if !end_stream {
            tracing::debug!(uri = %request.uri, "request has body or trailers, bypassing cache");
            self.state = FilterState::NotServingFromCache;
            return FilterHeadersStatus::Continue;
        }
        if !can_serve_request_from_cache(&request) {
            tracing::debug!(uri = %request.uri, method = %request.method, "request not cacheable");
            self.state = FilterState::NotServingFromCache;
            self.insert_status = Some(InsertStatus::NoInsertRequestNotCacheable);
            return FilterHeadersStatus::Continue;
        }

        let lookup_request = LookupRequest::new(
            &request,
            self.clock.now(),
            &self.config.allow_list,
            self.config.ignore_request_cache_control,
        );
        self.request_allows_inserts = !lookup_request.cache_control().no_store;
        self.is_head = lookup_request.is_head();
        tracing::debug!(key = %lookup_request.key(), "starting cache lookup");

        let lookup = self.lookup.insert(cache.make_lookup_context(lookup_request));
        let (result, end_stream) = lookup.get_headers().await;
        self.on_headers(result, request, end_stream, downstream).await
    }

    async fn on_headers(
        &mut self,
        mut result: LookupResult,
        mut request: RequestHeaders,
        end_stream: bool,
        downstream: &mut dyn Downstream,
    ) -> FilterHeadersStatus {
        if matches!(
            self.state,
            FilterState::Destroyed | FilterState::NotServingFromCache
        ) {
            return FilterHeadersStatus::StopIteration;
        }

        if result.status == CacheEntryStatus::FoundNotModified {
            tracing::error!(uri = %request.uri, "cache returned FoundNotModified, treating as a miss");
            result.status = CacheEntryStatus::Unusable;
        }
        let status = result.status;
        self.lookup_result = Some(result);

        match status {
            CacheEntryStatus::Ok => {
                let has_range = self
                    .lookup_result
                    .as_ref()
                    .is_some_and(|r| r.range_details.is_some());
                if has_range {
                    self.handle_cache_hit_with_range(downstream).await;
                } else {
                    self.handle_cache_hit(end_stream, downstream).await;
                }
                FilterHeadersStatus::StopIteration
            }
            CacheEntryStatus::RequiresValidation => {
                self.state = FilterState::ValidatingCachedResponse;
                if let Some(cached) = self.lookup_result.as_ref().and_then(|r| r.headers.as_ref()) {
                    inject_validation_headers(&mut request, cached);
                }
                self.send_upstream(request, downstream).await;
                FilterHeadersStatus::StopIteration
            }
            CacheEntryStatus::Unusable | CacheEntryStatus::FoundNotModified => {
                self.send_upstream(request, downstream).await;
                FilterHeadersStatus::StopIteration
            }
            CacheEntryStatus::LookupError => {
                self.state = FilterState::NotServingFromCache;
                self.insert_status = Some(InsertStatus::NoInsertLookupError);
                self.lookup = None;
                FilterHeadersStatus::Continue
            }
        }
    }

    async fn handle_cache_hit(&mut self, end_stream: bool, downstream: &mut dyn Downstream) {
        self.state = FilterState::DecodeServingFromCache;
        self.insert_status = Some(InsertStatus::NoInsertCacheHit);
        self.encode_cached_response(end_stream, None, downstream).await;
    }

    async fn handle_cache_hit_with_range(&mut self, downstream: &mut dyn Downstream) {
        let Some(result) = self.lookup_result.as_mut() else {
            return;
        };
        let Some(details) = result.range_details.clone() else {
            tracing::error!("range hit without range details");
            return;
        };
        let content_length = result.content_length;

        if !details.satisfiable {
            self.state = FilterState::DecodeServingFromCache;
            self.insert_status = Some(InsertStatus::NoInsertCacheHit);
            if let Some(headers) = result.headers.as_mut() {
                headers.status = StatusCode::RANGE_NOT_SATISFIABLE;
                match content_length {
                    Some(len) => {
                        headers
                            .headers
                            .insert(header::CONTENT_RANGE, content_range(&format!("bytes */{len}")));
                    }
                    None => {
                        tracing::error!("unsatisfiable range without a known content length");
                        debug_assert!(false, "unsatisfiable range without a known content length");
                    }
                }
            }
            result.set_content_length(0);
            self.encode_cached_response(true, None, downstream).await;
            return;
        }

        if details.ranges.len() != 1 {
            // Multipart responses are not produced; serve the whole body.
            self.handle_cache_hit(false, downstream).await;
            return;
        }

        self.state = FilterState::DecodeServingFromCache;
        self.insert_status = Some(InsertStatus::NoInsertCacheHit);
        let range = details.ranges[0];
        if let Some(headers) = result.headers.as_mut() {
            headers.status = StatusCode::PARTIAL_CONTENT;
            let total = content_length.map_or_else(|| "*".to_string(), |len| len.to_string());
            let value = format!("bytes {}-{}/{}", range.begin(), range.end() - 1, total);
            headers.headers.insert(header::CONTENT_RANGE, content_range(&value));
        }
        result.set_content_length(range.length());
        self.remaining_ranges = details.ranges;
        self.encode_cached_response(false, None, downstream).await;
    }

    async fn send_upstream(&mut self, request: RequestHeaders, downstream: &mut dyn Downstream) {
        self.upstream = Some(UpstreamRequest::start(
            &self.tasks,
            Arc::clone(&self.origin),
            request,
        ));
        let mut headers_sent = false;

        loop {
            let event = match self.upstream.as_mut() {
                Some(upstream) => upstream.next_event().await,
                None => return,
            };
            let Some(event) = event else {
                // The fetch ended without a terminal event.
                self.upstream = None;
                self.on_upstream_failed(OriginError::Reset("upstream closed".to_string()), headers_sent, downstream)
                    .await;
                return;
            };

            match event {
                UpstreamEvent::Headers {
                    headers,
                    end_stream,
                    verdict,
                } => {
                    if self.state == FilterState::ValidatingCachedResponse
                        && headers.status == StatusCode::NOT_MODIFIED
                    {
                        let _ = verdict.send(Verdict::Discard);
                        self.upstream = None;
                        self.process_successful_validation(headers, downstream).await;
                        return;
                    }

                    let insert = self.on_origin_headers(&headers, end_stream).await;
                    let _ = verdict.send(Verdict::Forward(insert));
                    headers_sent = true;
                    if downstream.encode_headers(headers, end_stream).await.is_err() || end_stream {
                        self.upstream = None;
                        return;
                    }
                }
                UpstreamEvent::Data { data, end_stream } => {
                    if end_stream {
                        self.finish_insert();
                    }
                    if downstream.encode_data(data, end_stream).await.is_err() || end_stream {
                        self.upstream = None;
                        return;
                    }
                }
                UpstreamEvent::Trailers(trailers) => {
                    self.finish_insert();
                    self.upstream = None;
                    let _ = downstream.encode_trailers(trailers).await;
                    return;
                }
                UpstreamEvent::InsertAborted => {
                    self.insert_active = false;
                    self.insert_status = Some(InsertStatus::InsertAbortedByCache);
                }
                UpstreamEvent::Failed(error) => {
                    self.upstream = None;
                    self.on_upstream_failed(error, headers_sent, downstream).await;
                    return;
                }
            }
        }
    }

    /// The origin response is complete; the insert, if any, has all of it.
    fn finish_insert(&mut self) {
        if self.insert_active {
            self.insert_active = false;
            self.insert_status = Some(InsertStatus::InsertSucceeded);
        }
    }

    async fn on_upstream_failed(&mut self, error: OriginError, headers_sent: bool, downstream: &mut dyn Downstream) {
        if self.insert_active {
            self.insert_active = false;
            self.insert_status = Some(InsertStatus::InsertAbortedResponseIncomplete);
        }
        if headers_sent {
            tracing::debug!(error = %error, "origin reset after response headers");
            downstream.reset_stream();
            return;
        }
        match error {
            OriginError::NoRoute => {
                downstream.send_local_reply(StatusCode::NOT_FOUND, "cache_no_route").await;
            }
            OriginError::NoCluster(cluster) => {
                tracing::debug!(cluster = %cluster, "upstream cluster not available to cache");
                downstream
                    .send_local_reply(StatusCode::SERVICE_UNAVAILABLE, "cache_no_cluster")
                    .await;
            }
            other => {
                tracing::debug!(error = %other, "origin unreachable");
                downstream
                    .send_local_reply(StatusCode::SERVICE_UNAVAILABLE, "cache_upstream_reset")
                    .await;
            }
        }
    }

    /// Decide whether the origin response populates the cache. Returns the
    /// insert for the rest of the body.
    async fn on_origin_headers(
        &mut self,
        headers: &ResponseHeaders,
        end_stream: bool,
    ) -> Option<Box<dyn InsertContext>> {
        self.state = FilterState::NotServingFromCache;
        let cacheable = is_cacheable_response(headers, &self.config.allow_list);

        if !(self.request_allows_inserts && !self.is_head && cacheable) {
            // A cacheable response kept out by HEAD or no-store leaves the
            // lookup, and with it any population role, alive until the
            // filter is dropped. Followers wait out this whole stream.
            self.insert_status = Some(InsertStatus::NoInsertResponseNotCacheable);
            if !cacheable {
                if let Some(lookup) = self.lookup.as_mut() {
                    lookup.response_not_cacheable();
                }
            }
            return None;
        }

        let (Some(cache), Some(lookup)) = (self.cache.as_ref(), self.lookup.take()) else {
            return None;
        };
        let Some(mut insert) = cache.make_insert_context(lookup) else {
            tracing::debug!("cache declined the insert");
            self.insert_status = Some(InsertStatus::NoInsertDeclinedByCache);
            return None;
        };

        let metadata = ResponseMetadata {
            response_time: self.clock.now(),
        };
        match insert.insert_headers(headers, metadata, end_stream).await {
            Err(e) => {
                tracing::warn!(error = %e, "cache aborted insert at headers");
                self.insert_status = Some(InsertStatus::InsertAbortedByCache);
                None
            }
            Ok(()) if end_stream => {
                self.insert_status = Some(InsertStatus::InsertSucceeded);
                None
            }
            Ok(()) => {
                self.insert_active = true;
                Some(insert)
            }
        }
    }

    async fn process_successful_validation(
        &mut self,
        mut response: ResponseHeaders,
        downstream: &mut dyn Downstream,
    ) {
        let Some(mut cached) = self.lookup_result.as_mut().and_then(|r| r.headers.take()) else {
            tracing::error!("validation response without a cached lookup result");
            debug_assert!(false, "validation response without a cached lookup result");
            downstream.reset_stream();
            return;
        };

        let should_update = should_update_cached_entry(&response, &cached);
        self.state = FilterState::EncodeServingFromCache;
        merge_not_modified(&mut response, &mut cached);

        if should_update {
            if let (Some(cache), Some(lookup)) = (self.cache.as_ref(), self.lookup.as_deref()) {
                let metadata = ResponseMetadata {
                    response_time: self.clock.now(),
                };
                let updated = cache.update_headers(lookup, &response, metadata).await;
                tracing::debug!(updated, "refreshed cached headers after validation");
                self.insert_status = Some(InsertStatus::HeaderUpdate);
            }
        }

        self.encode_cached_response(false, Some(response), downstream).await;
    }

    async fn encode_cached_response(
        &mut self,
        end_stream_after_headers: bool,
        headers: Option<ResponseHeaders>,
        downstream: &mut dyn Downstream,
    ) {
        let headers = headers.or_else(|| self.lookup_result.as_mut().and_then(|r| r.headers.take()));
        let Some(headers) = headers else {
            tracing::error!("cache hit without headers");
            debug_assert!(false, "cache hit without headers");
            downstream.reset_stream();
            return;
        };

        let info = downstream.stream_info_mut();
        info.response_from_cache = true;
        info.response_code_details = Some(RESPONSE_FROM_CACHE_DETAILS.to_string());

        let end_stream = self.is_head || end_stream_after_headers;
        if downstream.encode_headers(headers, end_stream).await.is_err() {
            return;
        }
        if end_stream {
            self.state = FilterState::ResponseServedFromCache;
            return;
        }

        let content_length = self.lookup_result.as_ref().and_then(|r| r.content_length);
        if self.remaining_ranges.is_empty() && content_length.unwrap_or(1) > 0 {
            self.remaining_ranges.push(AdjustedByteRange::whole(content_length));
        }
        if self.remaining_ranges.is_empty() {
            self.encode_cached_trailers(downstream).await;
        } else {
            self.encode_cached_body(downstream).await;
        }
    }

    async fn encode_cached_body(&mut self, downstream: &mut dyn Downstream) {
        let has_range = self
            .lookup_result
            .as_ref()
            .is_some_and(|r| r.range_details.is_some());
        let fetch_limit = match downstream.buffer_limit() {
            0 => MAX_BYTES_PER_FETCH,
            limit => limit,
        };

        while let Some(current) = self.remaining_ranges.first().copied() {
            let fetch = if current.length() > fetch_limit {
                AdjustedByteRange::new(current.begin(), current.begin() + fetch_limit)
            } else {
                current
            };

            let Some(lookup) = self.lookup.as_mut() else {
                downstream.reset_stream();
                return;
            };
            let body = match lookup.get_body(fetch).await {
                Ok(body) => body,
                Err(e) => {
                    tracing::warn!(error = %e, "cached body read failed");
                    downstream.reset_stream();
                    return;
                }
            };

            let Some(data) = body.data.filter(|d| !d.is_empty()) else {
                if !current.is_unbounded() {
                    tracing::error!(begin = current.begin(), "cache has no body for a bounded range");
                    downstream.reset_stream();
                    return;
                }
                if body.end_stream {
                    if downstream.encode_data(Bytes::new(), true).await.is_ok() {
                        self.state = FilterState::ResponseServedFromCache;
                    }
                    return;
                }
                // Length unknown until now; trailers follow.
                self.remaining_ranges.clear();
                break;
            };

            let received = data.len() as u64;
            if received < current.length() {
                self.remaining_ranges[0].trim_front(received);
            } else if received == current.length() {
                self.remaining_ranges.remove(0);
            } else {
                tracing::error!(received, wanted = current.length(), "oversized body chunk from cache");
                debug_assert!(false, "oversized body chunk from cache");
                downstream.reset_stream();
                return;
            }

            let end_stream = body.end_stream || (has_range && self.remaining_ranges.is_empty());
            if downstream.encode_data(data, end_stream).await.is_err() {
                return;
            }
            if end_stream {
                self.state = FilterState::ResponseServedFromCache;
                return;
            }
        }

        if has_range {
            // Range responses carry no trailers.
            self.state = FilterState::ResponseServedFromCache;
            return;
        }
        self.encode_cached_trailers(downstream).await;
    }

    async fn encode_cached_trailers(&mut self, downstream: &mut dyn Downstream) {
        let Some(lookup) = self.lookup.as_mut() else {
            downstream.reset_stream();
            return;
        };
        match lookup.get_trailers().await {
            Ok(trailers) => {
                if downstream.encode_trailers(trailers).await.is_ok() {
                    self.state = FilterState::ResponseServedFromCache;
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "cached trailers read failed");
                downstream.reset_stream();
            }
        }
    }

    /// The host replied on its own (timeout, reset) while the filter may
    /// still have been waiting on the cache.
    pub fn on_local_reply(&mut self, status: StatusCode) {
        if self.state == FilterState::Destroyed {
            return;
        }
        if self.lookup_result.is_none() && self.lookup.is_some() {
            if status == StatusCode::REQUEST_TIMEOUT {
                tracing::warn!("request timed out while cache lookup was outstanding");
            }
            self.state = FilterState::NotServingFromCache;
            self.lookup = None;
        }
        self.upstream = None;
    }

    /// Record the cache outcome for access logging.
    pub fn on_stream_complete(&self, info: &mut StreamInfo) {
        info.cache_logging = Some(CacheFilterLoggingInfo {
            lookup_status: self.lookup_status(),
            insert_status: self.insert_status(),
        });
    }

    /// Cancel outstanding work. Later calls are no-ops.
    pub fn on_destroy(&mut self) {
        self.state = FilterState::Destroyed;
        self.lookup = None;
        self.upstream = None;
    }

    pub fn lookup_status(&self) -> LookupStatus {
        if self.lookup_result.is_none() && self.lookup.is_some() {
            return LookupStatus::RequestIncomplete;
        }
        resolve_lookup_status(self.lookup_result.as_ref().map(|r| r.status), self.state)
    }

    pub fn insert_status(&self) -> InsertStatus {
        self.insert_status.unwrap_or(if self.insert_active {
            InsertStatus::InsertAbortedResponseIncomplete
        } else {
            InsertStatus::NoInsertRequestIncomplete
        })
    }
}

impl Drop for CacheFilter {
    fn drop(&mut self) {
        self.on_destroy();
    }
}

fn content_range(value: &str) -> HeaderValue {
    HeaderValue::from_str(value).unwrap_or_else(|_| HeaderValue::from_static("bytes */*"))
}

/// Access-log lookup status for a lookup outcome in a given filter state.
pub fn resolve_lookup_status(status: Option<CacheEntryStatus>, state: FilterState) -> LookupStatus {
    use FilterState as S;

    match (status, state) {
        (Some(CacheEntryStatus::Ok), _) => LookupStatus::CacheHit,
        (Some(CacheEntryStatus::Unusable), _) => LookupStatus::CacheMiss,
        (Some(CacheEntryStatus::FoundNotModified), _) => LookupStatus::CacheHit,
        (Some(CacheEntryStatus::LookupError), _) => LookupStatus::LookupError,
        (Some(CacheEntryStatus::RequiresValidation), S::ValidatingCachedResponse) => {
            LookupStatus::RequestIncomplete
        }
        (
            Some(CacheEntryStatus::RequiresValidation),
            S::EncodeServingFromCache | S::ResponseServedFromCache,
        ) => LookupStatus::StaleHitWithSuccessfulValidation,
        (Some(CacheEntryStatus::RequiresValidation), S::NotServingFromCache) => {
            LookupStatus::StaleHitWithFailedValidation
        }
        (
            Some(CacheEntryStatus::RequiresValidation),
            S::Initial | S::DecodeServingFromCache | S::Destroyed,
        ) => {
            tracing::error!(?state, "lookup required validation but filter state does not match");
            LookupStatus::Unknown
        }
        (None, S::Initial) => LookupStatus::RequestIncomplete,
        (None, S::NotServingFromCache) => LookupStatus::RequestNotCacheable,
        (
            None,
            S::ValidatingCachedResponse
            | S::DecodeServingFromCache
            | S::EncodeServingFromCache
            | S::ResponseServedFromCache
            | S::Destroyed,
        ) => {
            tracing::error!(?state, "no lookup result but filter state implies one");
            LookupStatus::Unknown
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::SharedCache;
    use crate::error::CacheError;
    use crate::lookup::ResponseMetadata;
    use crate::backend::LookupBody;
    use crate::store::{EntryStore, MemoryStore};
    use crate::time::ManualClock;
    use crate::upstream::{OriginEvent, OriginStream};
    use futures_util::{stream, StreamExt};
    use http::Method;
    use parking_lot::Mutex;
    use std::any::Any;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Clone, Debug, PartialEq)]
    enum Sent {
        Headers(StatusCode, HeaderMap, bool),
        Data(Bytes, bool),
        Trailers(HeaderMap),
        LocalReply(StatusCode, &'static str),
        Reset,
    }

    #[derive(Clone, Default)]
    struct Recorder {
        sent: Arc<Mutex<Vec<Sent>>>,
        info: StreamInfo,
        buffer_limit: u64,
    }

    impl Recorder {
        fn sent(&self) -> Vec<Sent> {
            self.sent.lock().clone()
        }

        fn headers(&self) -> (StatusCode, HeaderMap, bool) {
            self.sent()
                .into_iter()
                .find_map(|s| match s {
                    Sent::Headers(status, headers, end) => Some((status, headers, end)),
                    _ => None,
                })
                .expect("no headers sent")
        }

        fn chunks(&self) -> Vec<Bytes> {
            self.sent()
                .into_iter()
                .filter_map(|s| match s {
                    Sent::Data(data, _) => Some(data),
                    _ => None,
                })
                .collect()
        }

        fn body(&self) -> Vec<u8> {
            self.chunks().concat()
        }

        fn trailers(&self) -> Option<HeaderMap> {
            self.sent().into_iter().find_map(|s| match s {
                Sent::Trailers(t) => Some(t),
                _ => None,
            })
        }

        fn logging(&self) -> (LookupStatus, InsertStatus) {
            let info = self.info.cache_logging.expect("stream not completed");
            (info.lookup_status, info.insert_status)
        }
    }

    #[async_trait]
    impl Downstream for Recorder {
        async fn encode_headers(&mut self, headers: ResponseHeaders, end_stream: bool) -> Result<(), StreamClosed> {
            self.sent
                .lock()
                .push(Sent::Headers(headers.status, headers.headers, end_stream));
            Ok(())
        }

        async fn encode_data(&mut self, data: Bytes, end_stream: bool) -> Result<(), StreamClosed> {
            self.sent.lock().push(Sent::Data(data, end_stream));
            Ok(())
        }

        async fn encode_trailers(&mut self, trailers: HeaderMap) -> Result<(), StreamClosed> {
            self.sent.lock().push(Sent::Trailers(trailers));
            Ok(())
        }

        async fn send_local_reply(&mut self, status: StatusCode, details: &'static str) {
            self.sent.lock().push(Sent::LocalReply(status, details));
        }

        fn reset_stream(&mut self) {
            self.sent.lock().push(Sent::Reset);
        }

        fn buffer_limit(&self) -> u64 {
            self.buffer_limit
        }

        fn stream_info_mut(&mut self) -> &mut StreamInfo {
            &mut self.info
        }
    }

    type Events = Vec<Result<OriginEvent, OriginError>>;
    type Script = Box<dyn Fn(&RequestHeaders) -> Result<Events, OriginError> + Send + Sync>;

    struct TestOrigin {
        script: Script,
        delay: Duration,
        calls: AtomicUsize,
        requests: Mutex<Vec<RequestHeaders>>,
    }

    #[async_trait]
    impl Origin for TestOrigin {
        async fn send(&self, request: RequestHeaders) -> Result<OriginStream, OriginError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let events = (self.script)(&request);
            self.requests.lock().push(request);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            Ok(stream::iter(events?).boxed())
        }
    }

    fn response(status: StatusCode, headers: &[(&'static str, &'static str)]) -> ResponseHeaders {
        let mut r = ResponseHeaders::new(status);
        for (k, v) in headers {
            r.headers.append(*k, HeaderValue::from_static(*v));
        }
        r
    }

    fn origin_response(body: &'static str, headers: &[(&'static str, &'static str)]) -> Events {
        let mut headers = response(StatusCode::OK, headers);
        headers
            .headers
            .insert(header::CONTENT_LENGTH, HeaderValue::from(body.len()));
        if !headers.headers.contains_key(header::CACHE_CONTROL) {
            headers
                .headers
                .insert(header::CACHE_CONTROL, HeaderValue::from_static("max-age=600"));
        }
        vec![
            Ok(OriginEvent::Headers {
                headers,
                end_stream: false,
            }),
            Ok(OriginEvent::Data {
                data: Bytes::from_static(body.as_bytes()),
                end_stream: true,
            }),
        ]
    }

    fn get(path: &str) -> RequestHeaders {
        RequestHeaders::new(
            Method::GET,
            format!("http://example.com{path}").parse().unwrap(),
        )
    }

    fn with_header(mut request: RequestHeaders, name: &'static str, value: &'static str) -> RequestHeaders {
        request.headers.insert(name, HeaderValue::from_static(value));
        request
    }

    #[derive(Clone)]
    struct Harness {
        store: Arc<MemoryStore>,
        cache: Arc<SharedCache>,
        origin: Arc<TestOrigin>,
        tasks: TaskRegistry,
        config: Arc<FilterConfig>,
    }

    impl Harness {
        fn new<F>(script: F) -> Self
        where
            F: Fn(&RequestHeaders) -> Result<Events, OriginError> + Send + Sync + 'static,
        {
            Self::with_delay(script, Duration::ZERO)
        }

        fn with_delay<F>(script: F, delay: Duration) -> Self
        where
            F: Fn(&RequestHeaders) -> Result<Events, OriginError> + Send + Sync + 'static,
        {
            let store = Arc::new(MemoryStore::new(1024, None));
            Self {
                cache: Arc::new(SharedCache::new(store.clone())),
                store,
                origin: Arc::new(TestOrigin {
                    script: Box::new(script),
                    delay,
                    calls: AtomicUsize::new(0),
                    requests: Mutex::new(Vec::new()),
                }),
                tasks: TaskRegistry::new(),
                config: Arc::new(FilterConfig::default()),
            }
        }

        fn filter(&self) -> CacheFilter {
            CacheFilter::new(
                Arc::clone(&self.config),
                Some(self.cache.clone() as Arc<dyn HttpCache>),
                self.origin.clone() as Arc<dyn Origin>,
                self.tasks.clone(),
            )
        }

        async fn run_with(&self, request: RequestHeaders, mut recorder: Recorder) -> (FilterHeadersStatus, Recorder) {
            let mut filter = self.filter();
            let status = filter.decode_headers(request, true, &mut recorder).await;
            filter.on_stream_complete(&mut recorder.info);
            (status, recorder)
        }

        async fn run(&self, request: RequestHeaders) -> (FilterHeadersStatus, Recorder) {
            self.run_with(request, Recorder::default()).await
        }

        fn origin_calls(&self) -> usize {
            self.origin.calls.load(Ordering::SeqCst)
        }

        fn stored_headers(&self, path: &str) -> Option<HeaderMap> {
            let key = crate::key::Key::from_request(&get(path), &VaryAllowList::default());
            self.store.get(&key).map(|e| e.headers.headers.clone())
        }
    }

    #[tokio::test]
    async fn miss_inserts_and_hit_serves_the_same_response() {
        let h = Harness::new(|_| {
            let mut events = origin_response("hello world", &[("x-origin", "1")]);
            if let Some(Ok(OriginEvent::Data { end_stream, .. })) = events.last_mut() {
                *end_stream = false;
            }
            let mut trailers = HeaderMap::new();
            trailers.insert("x-checksum", HeaderValue::from_static("42"));
            events.push(Ok(OriginEvent::Trailers(trailers)));
            Ok(events)
        });

        let (status, miss) = h.run(get("/a")).await;
        assert_eq!(status, FilterHeadersStatus::StopIteration);
        assert_eq!(miss.logging(), (LookupStatus::CacheMiss, InsertStatus::InsertSucceeded));
        assert_eq!(miss.body(), b"hello world");
        assert!(!miss.info.response_from_cache);

        let (status, hit) = h.run(get("/a")).await;
        assert_eq!(status, FilterHeadersStatus::StopIteration);
        assert_eq!(hit.logging(), (LookupStatus::CacheHit, InsertStatus::NoInsertCacheHit));
        assert_eq!(h.origin_calls(), 1);

        let (code, headers, end) = hit.headers();
        assert_eq!(code, StatusCode::OK);
        assert!(!end);
        assert_eq!(headers["x-origin"], "1");
        assert_eq!(headers[header::CONTENT_LENGTH], "11");
        assert!(headers.contains_key(header::AGE));
        assert_eq!(hit.body(), b"hello world");
        assert_eq!(hit.trailers().unwrap()["x-checksum"], "42");
        assert!(hit.info.response_from_cache);
        assert_eq!(
            hit.info.response_code_details.as_deref(),
            Some(RESPONSE_FROM_CACHE_DETAILS)
        );
    }

    #[tokio::test]
    async fn requests_with_a_body_bypass_the_cache() {
        let h = Harness::new(|_| Ok(origin_response("x", &[])));
        let mut filter = h.filter();
        let mut rec = Recorder::default();
        let status = filter.decode_headers(get("/upload"), false, &mut rec).await;
        filter.on_stream_complete(&mut rec.info);

        assert_eq!(status, FilterHeadersStatus::Continue);
        assert_eq!(filter.state(), FilterState::NotServingFromCache);
        assert_eq!(
            rec.logging(),
            (LookupStatus::RequestNotCacheable, InsertStatus::NoInsertRequestIncomplete)
        );
        assert_eq!(h.origin_calls(), 0);
        assert!(rec.sent().is_empty());
    }

    #[tokio::test]
    async fn uncacheable_requests_continue() {
        let h = Harness::new(|_| Ok(origin_response("x", &[])));
        let (status, rec) = h
            .run(with_header(get("/private"), "authorization", "Bearer t"))
            .await;
        assert_eq!(status, FilterHeadersStatus::Continue);
        assert_eq!(
            rec.logging(),
            (LookupStatus::RequestNotCacheable, InsertStatus::NoInsertRequestNotCacheable)
        );

        let mut post = get("/form");
        post.method = Method::POST;
        assert_eq!(h.run(post).await.0, FilterHeadersStatus::Continue);
        assert_eq!(h.origin_calls(), 0);
    }

    #[tokio::test]
    async fn no_cache_configured_continues() {
        let h = Harness::new(|_| Ok(origin_response("x", &[])));
        let mut filter = CacheFilter::new(
            Arc::new(FilterConfig::default()),
            None,
            h.origin.clone() as Arc<dyn Origin>,
            h.tasks.clone(),
        );
        let mut rec = Recorder::default();
        assert_eq!(
            filter.decode_headers(get("/a"), true, &mut rec).await,
            FilterHeadersStatus::Continue
        );
        assert_eq!(filter.lookup_status(), LookupStatus::RequestNotCacheable);
    }

    fn validating_origin(not_modified_etag: Option<&'static str>) -> Harness {
        Harness::new(move |req: &RequestHeaders| {
            if req.headers.contains_key(header::IF_NONE_MATCH) {
                let mut headers = vec![("x-refreshed", "yes"), ("cache-control", "no-cache")];
                if let Some(etag) = not_modified_etag {
                    headers.push(("etag", etag));
                }
                return Ok(vec![Ok(OriginEvent::Headers {
                    headers: response(StatusCode::NOT_MODIFIED, &headers),
                    end_stream: true,
                })]);
            }
            Ok(origin_response(
                "cached body",
                &[
                    ("cache-control", "no-cache"),
                    ("etag", "\"v1\""),
                    ("date", "Sun, 06 Nov 1994 08:49:37 GMT"),
                ],
            ))
        })
    }

    #[tokio::test]
    async fn validated_entry_is_served_and_refreshed() {
        let h = validating_origin(Some("\"v1\""));
        h.run(get("/v")).await;

        let (status, rec) = h.run(get("/v")).await;
        assert_eq!(status, FilterHeadersStatus::StopIteration);
        assert_eq!(
            rec.logging(),
            (LookupStatus::StaleHitWithSuccessfulValidation, InsertStatus::HeaderUpdate)
        );

        let sent = h.origin.requests.lock().clone();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].headers[header::IF_NONE_MATCH], "\"v1\"");
        assert_eq!(sent[1].headers[header::IF_MODIFIED_SINCE], "Sun, 06 Nov 1994 08:49:37 GMT");

        let (code, headers, _) = rec.headers();
        assert_eq!(code, StatusCode::OK);
        assert_eq!(headers["x-refreshed"], "yes");
        assert_eq!(headers[header::CONTENT_LENGTH], "11");
        assert_eq!(rec.body(), b"cached body");
        assert!(rec.info.response_from_cache);

        let stored = h.stored_headers("/v").unwrap();
        assert_eq!(stored["x-refreshed"], "yes");
        assert_eq!(stored[header::CONTENT_LENGTH], "11");
    }

    #[tokio::test]
    async fn mismatched_etag_serves_without_refreshing() {
        let h = validating_origin(Some("\"v2\""));
        h.run(get("/v")).await;

        let (_, rec) = h.run(get("/v")).await;
        assert_eq!(
            rec.logging(),
            (
                LookupStatus::StaleHitWithSuccessfulValidation,
                InsertStatus::NoInsertRequestIncomplete
            )
        );
        assert_eq!(rec.body(), b"cached body");
        assert!(!h.stored_headers("/v").unwrap().contains_key("x-refreshed"));
    }

    #[tokio::test]
    async fn failed_validation_replaces_the_entry() {
        let calls = Arc::new(AtomicUsize::new(0));
        let h = {
            let calls = Arc::clone(&calls);
            Harness::new(move |_| {
                let body = if calls.fetch_add(1, Ordering::SeqCst) == 0 { "old" } else { "new" };
                Ok(origin_response(body, &[("cache-control", "no-cache")]))
            })
        };
        h.run(get("/f")).await;

        let (_, rec) = h.run(get("/f")).await;
        assert_eq!(
            rec.logging(),
            (LookupStatus::StaleHitWithFailedValidation, InsertStatus::InsertSucceeded)
        );
        assert_eq!(rec.body(), b"new");
        assert!(!rec.info.response_from_cache);
    }

    fn expiring_origin() -> Harness {
        Harness::new(|req: &RequestHeaders| {
            if req.headers.contains_key(header::IF_NONE_MATCH) {
                return Ok(vec![Ok(OriginEvent::Headers {
                    headers: response(
                        StatusCode::NOT_MODIFIED,
                        &[("etag", "\"v1\""), ("cache-control", "max-age=60")],
                    ),
                    end_stream: true,
                })]);
            }
            Ok(origin_response(
                "expiring",
                &[("cache-control", "max-age=60"), ("etag", "\"v1\"")],
            ))
        })
    }

    #[tokio::test]
    async fn age_and_staleness_follow_the_clock() {
        let h = expiring_origin();
        let clock = Arc::new(ManualClock::new(
            std::time::UNIX_EPOCH + Duration::from_secs(1_700_000_000),
        ));
        let run = |request: RequestHeaders| {
            let mut filter = h.filter().with_clock(clock.clone() as Arc<dyn TimeSource>);
            async move {
                let mut rec = Recorder::default();
                filter.decode_headers(request, true, &mut rec).await;
                filter.on_stream_complete(&mut rec.info);
                rec
            }
        };

        let miss = run(get("/clock")).await;
        assert_eq!(miss.logging(), (LookupStatus::CacheMiss, InsertStatus::InsertSucceeded));

        clock.advance(Duration::from_secs(30));
        let hit = run(get("/clock")).await;
        assert_eq!(hit.logging(), (LookupStatus::CacheHit, InsertStatus::NoInsertCacheHit));
        assert_eq!(hit.headers().1[header::AGE], "30");

        clock.advance(Duration::from_secs(15));
        let hit = run(get("/clock")).await;
        assert_eq!(hit.headers().1[header::AGE], "45");
        assert_eq!(h.origin_calls(), 1);

        // Past max-age the entry must be revalidated before it is served.
        clock.advance(Duration::from_secs(16));
        let revalidated = run(get("/clock")).await;
        assert_eq!(
            revalidated.logging(),
            (LookupStatus::StaleHitWithSuccessfulValidation, InsertStatus::HeaderUpdate)
        );
        assert_eq!(h.origin_calls(), 2);
        let sent = h.origin.requests.lock().clone();
        assert_eq!(sent[1].headers[header::IF_NONE_MATCH], "\"v1\"");
        assert_eq!(revalidated.body(), b"expiring");
        assert!(revalidated.info.response_from_cache);
    }

    fn fifty_bytes() -> Harness {
        Harness::new(|_| {
            Ok(origin_response(
                "0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMN",
                &[],
            ))
        })
    }

    #[tokio::test]
    async fn satisfiable_range_is_served_as_partial_content() {
        let h = fifty_bytes();
        h.run(get("/r")).await;

        let (_, rec) = h.run(with_header(get("/r"), "range", "bytes=10-19")).await;
        let (code, headers, end) = rec.headers();
        assert_eq!(code, StatusCode::PARTIAL_CONTENT);
        assert!(!end);
        assert_eq!(headers[header::CONTENT_RANGE], "bytes 10-19/50");
        assert_eq!(headers[header::CONTENT_LENGTH], "10");
        assert_eq!(rec.body(), b"abcdefghij");
        assert!(matches!(rec.sent().last(), Some(Sent::Data(_, true))));
        assert!(rec.trailers().is_none());
        assert_eq!(rec.logging(), (LookupStatus::CacheHit, InsertStatus::NoInsertCacheHit));
    }

    #[tokio::test]
    async fn unsatisfiable_range_is_416_without_body() {
        let h = fifty_bytes();
        h.run(get("/r")).await;

        let (_, rec) = h.run(with_header(get("/r"), "range", "bytes=60-69")).await;
        let (code, headers, end) = rec.headers();
        assert_eq!(code, StatusCode::RANGE_NOT_SATISFIABLE);
        assert!(end);
        assert_eq!(headers[header::CONTENT_RANGE], "bytes */50");
        assert_eq!(headers[header::CONTENT_LENGTH], "0");
        assert!(rec.chunks().is_empty());
    }

    #[tokio::test]
    async fn multiple_ranges_fall_back_to_the_full_body() {
        let h = fifty_bytes();
        h.run(get("/r")).await;

        let (_, rec) = h
            .run(with_header(get("/r"), "range", "bytes=0-1,10-11"))
            .await;
        let (code, headers, _) = rec.headers();
        assert_eq!(code, StatusCode::OK);
        assert!(!headers.contains_key(header::CONTENT_RANGE));
        assert_eq!(rec.body().len(), 50);
    }

    #[tokio::test]
    async fn cached_body_is_fetched_in_buffer_sized_chunks() {
        let h = Harness::new(|_| Ok(origin_response("hello world", &[])));
        h.run(get("/c")).await;

        let recorder = Recorder {
            buffer_limit: 4,
            ..Default::default()
        };
        let (_, rec) = h.run_with(get("/c"), recorder).await;
        let chunks = rec.chunks();
        assert_eq!(chunks, vec!["hell", "o wo", "rld"]);
        assert!(matches!(rec.sent().last(), Some(Sent::Data(_, true))));
    }

    #[tokio::test]
    async fn head_is_served_from_a_get_entry() {
        let h = Harness::new(|_| Ok(origin_response("hello", &[])));
        h.run(get("/h")).await;

        let mut head = get("/h");
        head.method = Method::HEAD;
        let (_, rec) = h.run(head).await;
        let (code, headers, end) = rec.headers();
        assert_eq!(code, StatusCode::OK);
        assert!(end);
        assert_eq!(headers[header::CONTENT_LENGTH], "5");
        assert!(rec.chunks().is_empty());
        assert_eq!(h.origin_calls(), 1);
    }

    #[tokio::test]
    async fn uncacheable_response_is_not_stored() {
        let h = Harness::new(|_| Ok(origin_response("secret", &[("cache-control", "no-store")])));
        let (_, first) = h.run(get("/n")).await;
        assert_eq!(
            first.logging(),
            (LookupStatus::CacheMiss, InsertStatus::NoInsertResponseNotCacheable)
        );
        assert_eq!(first.body(), b"secret");

        let (_, second) = h.run(get("/n")).await;
        assert_eq!(second.logging().0, LookupStatus::CacheMiss);
        assert_eq!(h.origin_calls(), 2);
    }

    #[tokio::test]
    async fn no_store_request_does_not_block_later_inserts() {
        let h = Harness::new(|_| Ok(origin_response("body", &[])));
        let (_, first) = h
            .run(with_header(get("/ns"), "cache-control", "no-store"))
            .await;
        assert_eq!(first.logging().1, InsertStatus::NoInsertResponseNotCacheable);

        let (_, second) = h.run(get("/ns")).await;
        assert_eq!(second.logging(), (LookupStatus::CacheMiss, InsertStatus::InsertSucceeded));
        let (_, third) = h.run(get("/ns")).await;
        assert_eq!(third.logging().0, LookupStatus::CacheHit);
    }

    #[tokio::test]
    async fn origin_errors_become_local_replies() {
        for (error, status, details) in [
            (OriginError::NoRoute, StatusCode::NOT_FOUND, "cache_no_route"),
            (
                OriginError::NoCluster("backend".to_string()),
                StatusCode::SERVICE_UNAVAILABLE,
                "cache_no_cluster",
            ),
            (
                OriginError::Connect("refused".to_string()),
                StatusCode::SERVICE_UNAVAILABLE,
                "cache_upstream_reset",
            ),
        ] {
            let h = Harness::new(move |_| Err(error.clone()));
            let (_, rec) = h.run(get("/e")).await;
            assert_eq!(rec.sent(), vec![Sent::LocalReply(status, details)]);
            assert_eq!(rec.logging().0, LookupStatus::CacheMiss);
        }
    }

    #[tokio::test]
    async fn origin_reset_mid_body_resets_and_aborts_the_insert() {
        let h = Harness::new(|_| {
            let mut events = origin_response("partial", &[]);
            events.pop();
            events.push(Ok(OriginEvent::Data {
                data: Bytes::from_static(b"part"),
                end_stream: false,
            }));
            events.push(Err(OriginError::Reset("connection lost".to_string())));
            Ok(events)
        });

        let (_, rec) = h.run(get("/p")).await;
        assert!(matches!(rec.sent().last(), Some(Sent::Reset)));
        assert_eq!(rec.logging().1, InsertStatus::InsertAbortedResponseIncomplete);
        assert!(h.stored_headers("/p").is_none());
        assert!(h.tasks.drain(Duration::from_secs(1)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_misses_share_one_origin_fetch() {
        const REQUESTS: usize = 8;
        let h = Harness::with_delay(
            |_| Ok(origin_response("shared body", &[])),
            Duration::from_millis(100),
        );

        let runs: Vec<_> = (0..REQUESTS)
            .map(|_| {
                let h = h.clone();
                tokio::spawn(async move { h.run(get("/hot")).await.1 })
            })
            .collect();

        let mut inserts = 0;
        for run in runs {
            let rec = run.await.unwrap();
            assert_eq!(rec.body(), b"shared body");
            match rec.logging() {
                (LookupStatus::CacheMiss, InsertStatus::InsertSucceeded) => inserts += 1,
                (LookupStatus::CacheHit, InsertStatus::NoInsertCacheHit) => {}
                other => panic!("unexpected outcome {other:?}"),
            }
        }
        assert_eq!(inserts, 1);
        assert_eq!(h.origin_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_lookup_is_cancelled_and_sees_nothing() {
        let h = Harness::new(|_| Ok(origin_response("late", &[])));

        // Another writer owns the key but has not produced headers yet.
        let mut writer_lookup = h.cache.make_lookup_context(LookupRequest::new(
            &get("/slow"),
            std::time::SystemTime::now(),
            &VaryAllowList::default(),
            false,
        ));
        writer_lookup.get_headers().await;
        let mut writer = h.cache.make_insert_context(writer_lookup).unwrap();

        let mut filter = h.filter();
        let mut rec = Recorder::default();
        let outcome = tokio::time::timeout(
            Duration::from_millis(50),
            filter.decode_headers(get("/slow"), true, &mut rec),
        )
        .await;
        assert!(outcome.is_err());
        assert_eq!(filter.lookup_status(), LookupStatus::RequestIncomplete);

        filter.on_local_reply(StatusCode::REQUEST_TIMEOUT);
        assert_eq!(filter.state(), FilterState::NotServingFromCache);
        assert_eq!(filter.lookup_status(), LookupStatus::RequestNotCacheable);
        drop(filter);

        let headers = response(StatusCode::OK, &[("cache-control", "max-age=60")]);
        let metadata = ResponseMetadata {
            response_time: std::time::SystemTime::now(),
        };
        writer.insert_headers(&headers, metadata, false).await.unwrap();
        writer.insert_body(Bytes::from_static(b"late"), true).await.unwrap();

        assert!(rec.sent().is_empty());
        assert_eq!(h.origin_calls(), 0);
    }

    #[tokio::test]
    async fn destroyed_filter_ignores_further_calls() {
        let h = Harness::new(|_| Ok(origin_response("x", &[])));
        let mut filter = h.filter();
        filter.on_destroy();
        let mut rec = Recorder::default();
        assert_eq!(
            filter.decode_headers(get("/d"), true, &mut rec).await,
            FilterHeadersStatus::Continue
        );
        assert_eq!(filter.state(), FilterState::Destroyed);
        assert!(rec.sent().is_empty());
        assert_eq!(h.origin_calls(), 0);
    }

    struct StubCache {
        status: CacheEntryStatus,
    }

    struct StubLookup {
        request: LookupRequest,
        status: CacheEntryStatus,
    }

    #[async_trait]
    impl LookupContext for StubLookup {
        fn request(&self) -> &LookupRequest {
            &self.request
        }

        async fn get_headers(&mut self) -> (LookupResult, bool) {
            let mut result = LookupResult::lookup_error();
            result.status = self.status;
            (result, false)
        }

        async fn get_body(&mut self, _range: AdjustedByteRange) -> Result<LookupBody, CacheError> {
            Err(CacheError::Store("stub".to_string()))
        }

        async fn get_trailers(&mut self) -> Result<HeaderMap, CacheError> {
            Err(CacheError::Store("stub".to_string()))
        }

        fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
            self
        }
    }

    #[async_trait]
    impl HttpCache for StubCache {
        fn make_lookup_context(&self, request: LookupRequest) -> Box<dyn LookupContext> {
            Box::new(StubLookup {
                request,
                status: self.status,
            })
        }

        fn make_insert_context(&self, _lookup: Box<dyn LookupContext>) -> Option<Box<dyn InsertContext>> {
            None
        }

        async fn update_headers(
            &self,
            _lookup: &dyn LookupContext,
            _headers: &ResponseHeaders,
            _metadata: ResponseMetadata,
        ) -> bool {
            false
        }
    }

    fn stub_filter(h: &Harness, status: CacheEntryStatus) -> CacheFilter {
        CacheFilter::new(
            Arc::new(FilterConfig::default()),
            Some(Arc::new(StubCache { status }) as Arc<dyn HttpCache>),
            h.origin.clone() as Arc<dyn Origin>,
            h.tasks.clone(),
        )
    }

    #[tokio::test]
    async fn lookup_error_passes_through() {
        let h = Harness::new(|_| Ok(origin_response("x", &[])));
        let mut filter = stub_filter(&h, CacheEntryStatus::LookupError);
        let mut rec = Recorder::default();
        assert_eq!(
            filter.decode_headers(get("/le"), true, &mut rec).await,
            FilterHeadersStatus::Continue
        );
        assert_eq!(filter.lookup_status(), LookupStatus::LookupError);
        assert_eq!(filter.insert_status(), InsertStatus::NoInsertLookupError);
        assert_eq!(h.origin_calls(), 0);
    }

    #[tokio::test]
    async fn found_not_modified_is_treated_as_a_miss() {
        let h = Harness::new(|_| Ok(origin_response("fresh", &[])));
        let mut filter = stub_filter(&h, CacheEntryStatus::FoundNotModified);
        let mut rec = Recorder::default();
        filter.decode_headers(get("/fnm"), true, &mut rec).await;
        assert_eq!(rec.body(), b"fresh");
        assert_eq!(filter.lookup_status(), LookupStatus::CacheMiss);
        // The stub declines every insert.
        assert_eq!(filter.insert_status(), InsertStatus::NoInsertDeclinedByCache);
    }

    #[test]
    fn insert_status_defaults() {
        let h = Harness::new(|_| Ok(Vec::new()));
        let mut filter = h.filter();
        assert_eq!(filter.insert_status(), InsertStatus::NoInsertRequestIncomplete);
        assert_eq!(filter.lookup_status(), LookupStatus::RequestIncomplete);
        filter.insert_active = true;
        assert_eq!(filter.insert_status(), InsertStatus::InsertAbortedResponseIncomplete);
        filter.insert_status = Some(InsertStatus::InsertAbortedByCache);
        assert_eq!(filter.insert_status(), InsertStatus::InsertAbortedByCache);
    }

    #[test]
    fn lookup_status_resolution() {
        use CacheEntryStatus as C;
        use FilterState as S;
        use LookupStatus as L;

        let cases = [
            (Some(C::Ok), S::ResponseServedFromCache, L::CacheHit),
            (Some(C::Unusable), S::NotServingFromCache, L::CacheMiss),
            (Some(C::FoundNotModified), S::Initial, L::CacheHit),
            (Some(C::LookupError), S::NotServingFromCache, L::LookupError),
            (Some(C::RequiresValidation), S::ValidatingCachedResponse, L::RequestIncomplete),
            (
                Some(C::RequiresValidation),
                S::EncodeServingFromCache,
                L::StaleHitWithSuccessfulValidation,
            ),
            (
                Some(C::RequiresValidation),
                S::ResponseServedFromCache,
                L::StaleHitWithSuccessfulValidation,
            ),
            (
                Some(C::RequiresValidation),
                S::NotServingFromCache,
                L::StaleHitWithFailedValidation,
            ),
            (Some(C::RequiresValidation), S::Initial, L::Unknown),
            (Some(C::RequiresValidation), S::Destroyed, L::Unknown),
            (None, S::Initial, L::RequestIncomplete),
            (None, S::NotServingFromCache, L::RequestNotCacheable),
            (None, S::DecodeServingFromCache, L::Unknown),
            (None, S::Destroyed, L::Unknown),
        ];
        for (status, state, expected) in cases {
            assert_eq!(
                resolve_lookup_status(status, state),
                expected,
                "{status:?} in {state:?}"
            );
        }
    }
}
