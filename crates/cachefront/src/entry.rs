//! Per-key coordination hub.
//!
//! One [`ActiveEntry`] exists per cache key while the key is in use. It owns
//! the authoritative population state of the key and fans progress of the
//! single writer out to every reader. All bookkeeping happens under one
//! short `parking_lot` mutex; file handle duplication, reads and appends
//! happen outside it.

use crate::arena::{Arena, Handle};
use crate::error::CacheError;
use crate::file::PartialFile;
use crate::headers::ResponseHeaders;
use crate::key::Key;
use crate::lookup::ResponseMetadata;
use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;
use tokio::sync::oneshot;

/// Population state of a key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryState {
    /// Nobody has looked at the store yet (or the last write was aborted).
    New,
    /// A lookup is checking the store, or holds the right to populate.
    Pending,
    /// An insert is streaming into the entry.
    Writing,
    /// The entry is in the store.
    Written,
    /// The last origin response for this key could not be stored.
    NotCacheable,
}

/// What a new lookup must do, decided by the state it found.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    /// First in: check the store, populate on a miss.
    CheckCacheExistence,
    /// Someone else is populating: wait for their file.
    StreamListening,
    /// Read the stored entry.
    CheckingFile,
    /// Pass through to the origin.
    NotCacheable,
}

/// Outcome delivered to a waiting view.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Notice {
    Ready,
    /// The key changed state underneath the waiter, start over.
    Retry,
    /// The write being followed was aborted.
    Aborted,
    NotCacheable,
}

pub type FileDelivery = Result<PartialFile, Notice>;

#[derive(Clone, Copy, Debug)]
enum Table {
    Headers,
    Body,
    Trailers,
    FileHandle,
}

struct EntryInner {
    state: EntryState,
    headers: Option<(ResponseHeaders, ResponseMetadata)>,
    file: Option<PartialFile>,
    delivering: bool,
    header_waiters: Arena<oneshot::Sender<Notice>>,
    /// Each waiter wants the byte at the recorded offset.
    body_waiters: Arena<(u64, oneshot::Sender<Notice>)>,
    trailer_waiters: Arena<oneshot::Sender<Notice>>,
    file_waiters: Arena<oneshot::Sender<FileDelivery>>,
}

impl EntryInner {
    fn subscriber_count(&self) -> usize {
        self.header_waiters.len()
            + self.body_waiters.len()
            + self.trailer_waiters.len()
            + self.file_waiters.len()
    }
}

pub struct ActiveEntry {
    key: Key,
    inner: Mutex<EntryInner>,
}

/// Registration in one of the hub's waiter tables. Dropping it unsubscribes,
/// which is how a cancelled lookup cleans up after itself.
pub struct Subscription {
    entry: Arc<ActiveEntry>,
    table: Table,
    handle: Handle,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.entry.unsubscribe(self.table, self.handle);
    }
}

/// A pending notification from the hub.
pub struct Waiter<T> {
    rx: oneshot::Receiver<T>,
    _subscription: Option<Subscription>,
}

impl<T> Waiter<T> {
    fn ready(value: T) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(value);
        Self {
            rx,
            _subscription: None,
        }
    }

    /// `None` if the hub dropped the waiter without an answer.
    pub async fn wait(self) -> Option<T> {
        let Waiter { rx, _subscription } = self;
        rx.await.ok()
    }
}

impl ActiveEntry {
    pub fn new(key: Key) -> Self {
        Self {
            key,
            inner: Mutex::new(EntryInner {
                state: EntryState::New,
                headers: None,
                file: None,
                delivering: false,
                header_waiters: Arena::default(),
                body_waiters: Arena::default(),
                trailer_waiters: Arena::default(),
                file_waiters: Arena::default(),
            }),
        }
    }

    pub fn key(&self) -> &Key {
        &self.key
    }

    pub fn state(&self) -> EntryState {
        self.inner.lock().state
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().subscriber_count()
    }

    /// Assign a role to a new lookup. The first lookup on a fresh key moves
    /// it to `Pending` and becomes responsible for checking the store.
    pub fn initialize(&self) -> Role {
        let mut inner = self.inner.lock();
        match inner.state {
            EntryState::New => {
                inner.state = EntryState::Pending;
                Role::CheckCacheExistence
            }
            EntryState::Pending | EntryState::Writing => Role::StreamListening,
            EntryState::Written => Role::CheckingFile,
            EntryState::NotCacheable => Role::NotCacheable,
        }
    }

    /// The store check found the entry.
    pub fn found_existing(&self) {
        let waiters = {
            let mut inner = self.inner.lock();
            if inner.state != EntryState::Pending {
                return;
            }
            inner.state = EntryState::Written;
            inner.file_waiters.drain()
        };
        for tx in waiters {
            let _ = tx.send(Err(Notice::Retry));
        }
    }

    /// The stored entry vanished under a `Written` key. Returns `true` if
    /// the caller now holds the population role.
    pub fn claim_after_miss(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.state == EntryState::Written {
            inner.state = EntryState::Pending;
            true
        } else {
            false
        }
    }

    /// The populator went away without writing.
    pub fn release_population(&self) {
        let waiters = {
            let mut inner = self.inner.lock();
            if inner.state != EntryState::Pending {
                return;
            }
            inner.state = EntryState::New;
            inner.file_waiters.drain()
        };
        tracing::debug!(key = %self.key, waiters = waiters.len(), "population released");
        for tx in waiters {
            let _ = tx.send(Err(Notice::Retry));
        }
    }

    /// The populator learned the response cannot be stored. Waiters pass
    /// through to the origin.
    pub fn mark_not_cacheable(&self) {
        let (files, headers) = {
            let mut inner = self.inner.lock();
            if !matches!(inner.state, EntryState::Pending | EntryState::New) {
                return;
            }
            inner.state = EntryState::NotCacheable;
            (inner.file_waiters.drain(), inner.header_waiters.drain())
        };
        for tx in files {
            let _ = tx.send(Err(Notice::NotCacheable));
        }
        for tx in headers {
            let _ = tx.send(Notice::NotCacheable);
        }
    }

    /// Start a write. Only one writer at a time; while `Pending` only the
    /// populator may write. Returns the file the writer appends to.
    pub fn begin_write(&self, populator: bool) -> Option<PartialFile> {
        let file = {
            let mut inner = self.inner.lock();
            let allowed = match inner.state {
                EntryState::Pending => populator,
                EntryState::New | EntryState::Written | EntryState::NotCacheable => true,
                EntryState::Writing => false,
            };
            if !allowed {
                return None;
            }
            let file = PartialFile::new();
            inner.state = EntryState::Writing;
            inner.headers = None;
            inner.file = Some(file.clone());
            file
        };
        tracing::debug!(key = %self.key, "insert started");
        self.deliver_file_handles();
        Some(file)
    }

    pub fn headers_ready(&self, headers: ResponseHeaders, metadata: ResponseMetadata) {
        let waiters = {
            let mut inner = self.inner.lock();
            inner.headers = Some((headers, metadata));
            inner.header_waiters.drain()
        };
        for tx in waiters {
            let _ = tx.send(Notice::Ready);
        }
    }

    /// `len` bytes of body are now readable.
    pub fn body_ready_to(&self, len: u64) {
        let waiters = self
            .inner
            .lock()
            .body_waiters
            .drain_filter(|(offset, _)| *offset < len);
        for (_, tx) in waiters {
            let _ = tx.send(Notice::Ready);
        }
    }

    pub fn insert_complete(&self) {
        let (headers, body, trailers, files) = {
            let mut inner = self.inner.lock();
            inner.state = EntryState::Written;
            inner.file = None;
            (
                inner.header_waiters.drain(),
                inner.body_waiters.drain(),
                inner.trailer_waiters.drain(),
                inner.file_waiters.drain(),
            )
        };
        tracing::debug!(key = %self.key, "insert complete");
        for tx in headers.into_iter().chain(trailers) {
            let _ = tx.send(Notice::Ready);
        }
        for (_, tx) in body {
            let _ = tx.send(Notice::Ready);
        }
        for tx in files {
            let _ = tx.send(Err(Notice::Retry));
        }
    }

    /// The write failed. The key goes back to `New` and everyone following
    /// the write is told.
    pub fn insert_abort(&self) {
        let (file, headers, body, trailers, files) = {
            let mut inner = self.inner.lock();
            inner.state = EntryState::New;
            inner.headers = None;
            (
                inner.file.take(),
                inner.header_waiters.drain(),
                inner.body_waiters.drain(),
                inner.trailer_waiters.drain(),
                inner.file_waiters.drain(),
            )
        };
        if let Some(file) = file {
            file.close();
        }
        tracing::debug!(key = %self.key, "insert aborted");
        for tx in headers.into_iter().chain(trailers) {
            let _ = tx.send(Notice::Aborted);
        }
        for (_, tx) in body {
            let _ = tx.send(Notice::Aborted);
        }
        for tx in files {
            let _ = tx.send(Err(Notice::Aborted));
        }
    }

    /// Latest header snapshot of the entry being written.
    pub fn headers(&self) -> Option<(ResponseHeaders, ResponseMetadata)> {
        self.inner.lock().headers.clone()
    }

    /// Queue for a handle on the file of the in-progress write. Handles are
    /// given out in queue order.
    pub fn want_file_handle(self: &Arc<Self>) -> Waiter<FileDelivery> {
        let (tx, rx) = oneshot::channel();
        let (handle, deliver) = {
            let mut inner = self.inner.lock();
            match inner.state {
                EntryState::Pending | EntryState::Writing => {}
                EntryState::NotCacheable => return Waiter::ready(Err(Notice::NotCacheable)),
                EntryState::New | EntryState::Written => return Waiter::ready(Err(Notice::Retry)),
            }
            let handle = inner.file_waiters.push_head(tx);
            (handle, inner.file.is_some())
        };
        if deliver {
            self.deliver_file_handles();
        }
        self.waiter(rx, Table::FileHandle, handle)
    }

    /// Wait for the header snapshot of the in-progress write.
    pub fn want_headers(self: &Arc<Self>) -> Waiter<Notice> {
        let (tx, rx) = oneshot::channel();
        let handle = {
            let mut inner = self.inner.lock();
            if inner.headers.is_some() {
                return Waiter::ready(Notice::Ready);
            }
            match inner.state {
                EntryState::Writing => inner.header_waiters.push_head(tx),
                EntryState::NotCacheable => return Waiter::ready(Notice::NotCacheable),
                _ => return Waiter::ready(Notice::Aborted),
            }
        };
        self.waiter(rx, Table::Headers, handle)
    }

    /// Wait until `file` holds the byte at `offset`, or is complete.
    pub fn want_body(self: &Arc<Self>, file: &PartialFile, offset: u64) -> Waiter<Notice> {
        let (tx, rx) = oneshot::channel();
        let handle = {
            let mut inner = self.inner.lock();
            if file.len() > offset || file.is_complete() {
                return Waiter::ready(Notice::Ready);
            }
            if file.is_closed() || inner.state != EntryState::Writing {
                return Waiter::ready(Notice::Aborted);
            }
            inner.body_waiters.push_head((offset, tx))
        };
        self.waiter(rx, Table::Body, handle)
    }

    /// Wait until `file` is complete and its trailers are known.
    pub fn want_trailers(self: &Arc<Self>, file: &PartialFile) -> Waiter<Notice> {
        let (tx, rx) = oneshot::channel();
        let handle = {
            let mut inner = self.inner.lock();
            if file.is_complete() {
                return Waiter::ready(Notice::Ready);
            }
            if file.is_closed() || inner.state != EntryState::Writing {
                return Waiter::ready(Notice::Aborted);
            }
            inner.trailer_waiters.push_head(tx)
        };
        self.waiter(rx, Table::Trailers, handle)
    }

    fn waiter<T>(self: &Arc<Self>, rx: oneshot::Receiver<T>, table: Table, handle: Handle) -> Waiter<T> {
        Waiter {
            rx,
            _subscription: Some(Subscription {
                entry: Arc::clone(self),
                table,
                handle,
            }),
        }
    }

    /// Hand duplicated file handles to queued waiters, oldest first. Only one
    /// caller delivers at a time; others leave their waiters to it. A failed
    /// duplication means the write is dead: every follower still subscribed
    /// is told `Aborted`, file waiters in queue order.
    fn deliver_file_handles(&self) {
        self.deliver_file_handles_with(PartialFile::duplicate);
    }

    fn deliver_file_handles_with<F>(&self, mut duplicate: F)
    where
        F: FnMut(&PartialFile) -> Result<PartialFile, CacheError>,
    {
        let mut inner = self.inner.lock();
        if inner.delivering {
            return;
        }
        inner.delivering = true;

        loop {
            let Some(file) = inner.file.clone() else {
                break;
            };
            let Some(tx) = inner.file_waiters.pop_tail() else {
                break;
            };

            match MutexGuard::unlocked(&mut inner, || duplicate(&file)) {
                Ok(handle) => {
                    let _ = tx.send(Ok(handle));
                }
                Err(e) => {
                    let files = inner.file_waiters.drain();
                    let headers = inner.header_waiters.drain();
                    let body = inner.body_waiters.drain();
                    let trailers = inner.trailer_waiters.drain();
                    inner.delivering = false;
                    drop(inner);
                    tracing::warn!(
                        key = %self.key,
                        error = %e,
                        waiters = files.len() + 1,
                        "failed to duplicate cache file handle"
                    );
                    for tx in std::iter::once(tx).chain(files) {
                        let _ = tx.send(Err(Notice::Aborted));
                    }
                    for tx in headers.into_iter().chain(trailers) {
                        let _ = tx.send(Notice::Aborted);
                    }
                    for (_, tx) in body {
                        let _ = tx.send(Notice::Aborted);
                    }
                    return;
                }
            }
        }

        inner.delivering = false;
    }

    fn unsubscribe(&self, table: Table, handle: Handle) {
        let mut inner = self.inner.lock();
        match table {
            Table::Headers => {
                inner.header_waiters.remove(handle);
            }
            Table::Body => {
                inner.body_waiters.remove(handle);
            }
            Table::Trailers => {
                inner.trailer_waiters.remove(handle);
            }
            Table::FileHandle => {
                inner.file_waiters.remove(handle);
            }
        }
    }
}

impl Drop for ActiveEntry {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        debug_assert_eq!(
            inner.subscriber_count(),
            0,
            "active entry for {} dropped with subscribers",
            self.key
        );
    }
}
