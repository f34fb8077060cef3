//! Shared cache: the coordination hubs in front of an [`EntryStore`].
//!
//! Each request gets an [`EntryLookup`] view bound to its key's hub. The
//! first view on a key checks the store and, on a miss, holds the right to
//! populate it. Later views either read the stored entry or follow the
//! in-progress write through a duplicated file handle, so one origin fetch
//! serves every concurrent requester.

use crate::backend::{HttpCache, InsertContext, LookupBody, LookupContext};
use crate::entry::{ActiveEntry, Notice, Role};
use crate::error::CacheError;
use crate::file::PartialFile;
use crate::headers::ResponseHeaders;
use crate::key::Key;
use crate::lookup::{LookupRequest, LookupResult, ResponseMetadata};
use crate::range::AdjustedByteRange;
use crate::registry::{ActiveEntries, DEFAULT_ENTRY_EXPIRY};
use crate::store::{EntryStore, StoredEntry};
use async_trait::async_trait;
use bytes::Bytes;
use http::HeaderMap;
use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

pub struct SharedCache {
    entries: ActiveEntries,
    store: Arc<dyn EntryStore>,
}

impl SharedCache {
    pub fn new(store: Arc<dyn EntryStore>) -> Self {
        Self::with_entry_expiry(store, DEFAULT_ENTRY_EXPIRY)
    }

    pub fn with_entry_expiry(store: Arc<dyn EntryStore>, expiry: Duration) -> Self {
        Self {
            entries: ActiveEntries::new(expiry),
            store,
        }
    }

    pub fn store(&self) -> &Arc<dyn EntryStore> {
        &self.store
    }

    /// Number of keys with a live coordination hub.
    pub fn active_entries(&self) -> usize {
        self.entries.len()
    }
}

#[async_trait]
impl HttpCache for SharedCache {
    fn make_lookup_context(&self, request: LookupRequest) -> Box<dyn LookupContext> {
        let entry = self.entries.get_entry(request.key());
        Box::new(EntryLookup {
            request,
            entry,
            store: Arc::clone(&self.store),
            state: None,
        })
    }

    fn make_insert_context(&self, lookup: Box<dyn LookupContext>) -> Option<Box<dyn InsertContext>> {
        let mut view = match lookup.into_any().downcast::<EntryLookup>() {
            Ok(view) => view,
            Err(_) => {
                tracing::warn!("insert requested with a foreign lookup context");
                return None;
            }
        };

        let populator = matches!(view.state, Some(LookupState::Missed));
        let file = view.entry.begin_write(populator)?;
        // The population role moves to the insert.
        view.state = None;

        Some(Box::new(EntryInsert {
            key: view.request.key().clone(),
            entry: Arc::clone(&view.entry),
            store: Arc::clone(&self.store),
            file,
            headers: None,
            finished: false,
        }))
    }

    async fn update_headers(
        &self,
        lookup: &dyn LookupContext,
        headers: &ResponseHeaders,
        metadata: ResponseMetadata,
    ) -> bool {
        self.store
            .update_headers(lookup.request().key(), headers, metadata)
    }
}

enum LookupState {
    NotCacheable,
    CheckCacheExistence,
    /// Following another request's write, with the file once handed over.
    StreamListening(Option<PartialFile>),
    /// Holds the right to populate the key.
    Missed,
    CheckingFile,
    ReadingFile(Arc<StoredEntry>),
}

/// A request's view of a key.
pub struct EntryLookup {
    request: LookupRequest,
    entry: Arc<ActiveEntry>,
    store: Arc<dyn EntryStore>,
    state: Option<LookupState>,
}

impl EntryLookup {
    fn stored_result(&self, stored: &StoredEntry) -> (LookupResult, bool) {
        let length = stored.body.len() as u64;
        let result = self.request.make_lookup_result(
            stored.headers.clone(),
            stored.metadata,
            Some(length),
        );
        (result, length == 0 && stored.trailers.is_none())
    }

    /// Wait for the writer's file and headers. `None` means start over.
    async fn follow_writer(&mut self) -> Option<(LookupResult, bool)> {
        let file = match self.entry.want_file_handle().wait().await {
            Some(Ok(file)) => file,
            Some(Err(Notice::NotCacheable)) => {
                self.state = Some(LookupState::NotCacheable);
                return Some((LookupResult::unusable(), false));
            }
            _ => return None,
        };

        match self.entry.want_headers().wait().await {
            Some(Notice::Ready) => {}
            Some(Notice::NotCacheable) => {
                self.state = Some(LookupState::NotCacheable);
                return Some((LookupResult::unusable(), false));
            }
            _ => return None,
        }

        let (headers, metadata) = self.entry.headers()?;
        let content_length = if file.is_complete() {
            Some(file.len())
        } else {
            headers.content_length()
        };
        let end_stream =
            file.is_complete() && file.is_empty() && file.trailers().is_none();
        let result = self
            .request
            .make_lookup_result(headers, metadata, content_length);
        self.state = Some(LookupState::StreamListening(Some(file)));
        Some((result, end_stream))
    }

    async fn read_partial(
        &self,
        file: &PartialFile,
        range: AdjustedByteRange,
    ) -> Result<LookupBody, CacheError> {
        loop {
            let data = file.read(range)?;
            if !data.is_empty() {
                let end = range.begin() + data.len() as u64;
                let end_stream =
                    file.is_complete() && end >= file.len() && file.trailers().is_none();
                return Ok(LookupBody {
                    data: Some(data),
                    end_stream,
                });
            }
            if file.is_complete() {
                return Ok(LookupBody {
                    data: None,
                    end_stream: file.trailers().is_none(),
                });
            }
            match self.entry.want_body(file, range.begin()).wait().await {
                Some(Notice::Ready) => continue,
                _ => return Err(CacheError::Aborted),
            }
        }
    }
}

#[async_trait]
impl LookupContext for EntryLookup {
    fn request(&self) -> &LookupRequest {
        &self.request
    }

    async fn get_headers(&mut self) -> (LookupResult, bool) {
        loop {
            let state = match self.state.take() {
                Some(state) => state,
                None => match self.entry.initialize() {
                    Role::CheckCacheExistence => LookupState::CheckCacheExistence,
                    Role::StreamListening => LookupState::StreamListening(None),
                    Role::CheckingFile => LookupState::CheckingFile,
                    Role::NotCacheable => LookupState::NotCacheable,
                },
            };

            match state {
                LookupState::NotCacheable => {
                    self.state = Some(LookupState::NotCacheable);
                    return (LookupResult::unusable(), false);
                }
                LookupState::CheckCacheExistence => match self.store.get(self.request.key()) {
                    Some(stored) => {
                        self.entry.found_existing();
                        let result = self.stored_result(&stored);
                        self.state = Some(LookupState::ReadingFile(stored));
                        return result;
                    }
                    None => {
                        tracing::debug!(key = %self.request.key(), "cache miss, holding population");
                        self.state = Some(LookupState::Missed);
                        return (LookupResult::unusable(), false);
                    }
                },
                LookupState::CheckingFile => match self.store.get(self.request.key()) {
                    Some(stored) => {
                        let result = self.stored_result(&stored);
                        self.state = Some(LookupState::ReadingFile(stored));
                        return result;
                    }
                    None if self.entry.claim_after_miss() => {
                        self.state = Some(LookupState::Missed);
                        return (LookupResult::unusable(), false);
                    }
                    None => continue,
                },
                LookupState::StreamListening(_) => {
                    if let Some(result) = self.follow_writer().await {
                        return result;
                    }
                    tracing::debug!(key = %self.request.key(), "followed write went away, retrying lookup");
                }
                state @ (LookupState::Missed | LookupState::ReadingFile(_)) => {
                    tracing::error!(key = %self.request.key(), "get_headers called twice");
                    debug_assert!(false, "get_headers called twice");
                    self.state = Some(state);
                    return (LookupResult::unusable(), false);
                }
            }
        }
    }

    async fn get_body(&mut self, range: AdjustedByteRange) -> Result<LookupBody, CacheError> {
        match &self.state {
            Some(LookupState::ReadingFile(stored)) => {
                let len = stored.body.len() as u64;
                if range.begin() >= len {
                    return Ok(LookupBody {
                        data: None,
                        end_stream: stored.trailers.is_none(),
                    });
                }
                let end = range.end().min(len);
                Ok(LookupBody {
                    data: Some(stored.body.slice(range.begin() as usize..end as usize)),
                    end_stream: end == len && stored.trailers.is_none(),
                })
            }
            Some(LookupState::StreamListening(Some(file))) => {
                let file = file.clone();
                self.read_partial(&file, range).await
            }
            _ => Err(CacheError::Aborted),
        }
    }

    async fn get_trailers(&mut self) -> Result<HeaderMap, CacheError> {
        match &self.state {
            Some(LookupState::ReadingFile(stored)) => Ok(stored.trailers.clone().unwrap_or_default()),
            Some(LookupState::StreamListening(Some(file))) => {
                let file = file.clone();
                loop {
                    if file.is_complete() {
                        return Ok(file.trailers().unwrap_or_default());
                    }
                    match self.entry.want_trailers(&file).wait().await {
                        Some(Notice::Ready) => continue,
                        _ => return Err(CacheError::Aborted),
                    }
                }
            }
            _ => Err(CacheError::Aborted),
        }
    }

    fn response_not_cacheable(&mut self) {
        if matches!(self.state, Some(LookupState::Missed)) {
            self.entry.mark_not_cacheable();
            self.state = Some(LookupState::NotCacheable);
        }
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }
}

impl Drop for EntryLookup {
    fn drop(&mut self) {
        // A populator that never inserts (HEAD, request no-store) holds the
        // role until here, so followers of the key only retry once its
        // origin stream has ended.
        if matches!(
            self.state,
            Some(LookupState::Missed) | Some(LookupState::CheckCacheExistence)
        ) {
            self.entry.release_population();
        }
    }
}

/// Writer side of a key. Dropped before completion, it aborts the write and
/// every follower is told.
pub struct EntryInsert {
    key: Key,
    entry: Arc<ActiveEntry>,
    store: Arc<dyn EntryStore>,
    file: PartialFile,
    headers: Option<(ResponseHeaders, ResponseMetadata)>,
    finished: bool,
}

impl EntryInsert {
    fn abort(&mut self, error: CacheError) -> CacheError {
        if !self.finished {
            self.finished = true;
            tracing::debug!(key = %self.key, error = %error, "insert aborted by cache");
            self.entry.insert_abort();
        }
        error
    }

    fn ensure_open(&self) -> Result<(), CacheError> {
        if self.finished {
            Err(CacheError::Aborted)
        } else {
            Ok(())
        }
    }

    fn complete(&mut self, trailers: Option<HeaderMap>) -> Result<(), CacheError> {
        let Some((headers, metadata)) = self.headers.clone() else {
            return Err(self.abort(CacheError::Aborted));
        };
        if let Err(e) = self.file.finish(trailers) {
            return Err(self.abort(e));
        }
        let Some((body, trailers)) = self.file.snapshot() else {
            return Err(self.abort(CacheError::FileClosed));
        };

        let stored = StoredEntry {
            headers,
            metadata,
            body,
            trailers,
        };
        if let Err(e) = self.store.put(self.key.clone(), stored) {
            return Err(self.abort(e));
        }

        self.finished = true;
        self.entry.insert_complete();
        Ok(())
    }
}

#[async_trait]
impl InsertContext for EntryInsert {
    async fn insert_headers(
        &mut self,
        headers: &ResponseHeaders,
        metadata: ResponseMetadata,
        end_stream: bool,
    ) -> Result<(), CacheError> {
        self.ensure_open()?;
        self.headers = Some((headers.clone(), metadata));
        self.entry.headers_ready(headers.clone(), metadata);
        if end_stream {
            self.complete(None)?;
        }
        Ok(())
    }

    async fn insert_body(&mut self, chunk: Bytes, end_stream: bool) -> Result<(), CacheError> {
        self.ensure_open()?;
        if self.headers.is_none() {
            return Err(self.abort(CacheError::Aborted));
        }
        if let Some(limit) = self.store.max_body_size() {
            let size = self.file.len() + chunk.len() as u64;
            if size > limit {
                return Err(self.abort(CacheError::BodyTooLarge { size, limit }));
            }
        }

        let written = match self.file.append(&chunk) {
            Ok(len) => len,
            Err(e) => return Err(self.abort(e)),
        };
        self.entry.body_ready_to(written);

        if end_stream {
            self.complete(None)?;
        }
        Ok(())
    }

    async fn insert_trailers(&mut self, trailers: HeaderMap) -> Result<(), CacheError> {
        self.ensure_open()?;
        self.complete(Some(trailers))
    }
}

impl Drop for EntryInsert {
    fn drop(&mut self) {
        if !self.finished {
            self.abort(CacheError::Aborted);
        }
    }
}
