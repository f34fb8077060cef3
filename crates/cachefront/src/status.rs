use serde::Serialize;

/// How the cache answered a request, as reported in access logs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LookupStatus {
    Unknown,
    CacheHit,
    CacheMiss,
    StaleHitWithSuccessfulValidation,
    StaleHitWithFailedValidation,
    RequestNotCacheable,
    RequestIncomplete,
    LookupError,
}

impl LookupStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LookupStatus::Unknown => "unknown",
            LookupStatus::CacheHit => "cache_hit",
            LookupStatus::CacheMiss => "cache_miss",
            LookupStatus::StaleHitWithSuccessfulValidation => "stale_hit_with_successful_validation",
            LookupStatus::StaleHitWithFailedValidation => "stale_hit_with_failed_validation",
            LookupStatus::RequestNotCacheable => "request_not_cacheable",
            LookupStatus::RequestIncomplete => "request_incomplete",
            LookupStatus::LookupError => "lookup_error",
        }
    }
}

/// What happened to the cache entry as a result of a request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InsertStatus {
    InsertSucceeded,
    InsertAbortedByCache,
    InsertAbortedResponseIncomplete,
    HeaderUpdate,
    NoInsertCacheHit,
    NoInsertRequestNotCacheable,
    NoInsertResponseNotCacheable,
    NoInsertRequestIncomplete,
    NoInsertLookupError,
    NoInsertDeclinedByCache,
}

impl InsertStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InsertStatus::InsertSucceeded => "insert_succeeded",
            InsertStatus::InsertAbortedByCache => "insert_aborted_by_cache",
            InsertStatus::InsertAbortedResponseIncomplete => "insert_aborted_response_incomplete",
            InsertStatus::HeaderUpdate => "header_update",
            InsertStatus::NoInsertCacheHit => "no_insert_cache_hit",
            InsertStatus::NoInsertRequestNotCacheable => "no_insert_request_not_cacheable",
            InsertStatus::NoInsertResponseNotCacheable => "no_insert_response_not_cacheable",
            InsertStatus::NoInsertRequestIncomplete => "no_insert_request_incomplete",
            InsertStatus::NoInsertLookupError => "no_insert_lookup_error",
            InsertStatus::NoInsertDeclinedByCache => "no_insert_declined_by_cache",
        }
    }
}

/// Per-request cache outcome recorded into the stream info at completion.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct CacheFilterLoggingInfo {
    pub lookup_status: LookupStatus,
    pub insert_status: InsertStatus,
}
