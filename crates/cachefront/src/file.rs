use crate::error::CacheError;
use crate::range::AdjustedByteRange;
use bytes::{Bytes, BytesMut};
use http::HeaderMap;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Handle on the body and trailers of an entry that is still being written.
///
/// The writer appends, readers read whatever has landed so far. Every
/// reader holds its own handle obtained through [`PartialFile::duplicate`],
/// which fails once the file has been closed by an aborted write.
#[derive(Clone, Debug)]
pub struct PartialFile {
    inner: Arc<FileInner>,
}

#[derive(Debug, Default)]
struct FileInner {
    contents: RwLock<Contents>,
    closed: AtomicBool,
}

#[derive(Debug, Default)]
struct Contents {
    body: BytesMut,
    trailers: Option<HeaderMap>,
    complete: bool,
}

impl PartialFile {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(FileInner::default()),
        }
    }

    /// Open another handle on the same file.
    pub fn duplicate(&self) -> Result<PartialFile, CacheError> {
        if self.is_closed() {
            return Err(CacheError::FileClosed);
        }
        Ok(self.clone())
    }

    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Bytes written so far.
    pub fn len(&self) -> u64 {
        self.inner.contents.read().body.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_complete(&self) -> bool {
        self.inner.contents.read().complete
    }

    pub fn append(&self, data: &[u8]) -> Result<u64, CacheError> {
        if self.is_closed() {
            return Err(CacheError::FileClosed);
        }
        let mut contents = self.inner.contents.write();
        contents.body.extend_from_slice(data);
        Ok(contents.body.len() as u64)
    }

    /// Mark the body finished, optionally with trailers.
    pub fn finish(&self, trailers: Option<HeaderMap>) -> Result<(), CacheError> {
        if self.is_closed() {
            return Err(CacheError::FileClosed);
        }
        let mut contents = self.inner.contents.write();
        contents.trailers = trailers;
        contents.complete = true;
        Ok(())
    }

    /// Read the part of `range` that has been written. Empty once the range
    /// starts at or past the written length.
    pub fn read(&self, range: AdjustedByteRange) -> Result<Bytes, CacheError> {
        if self.is_closed() {
            return Err(CacheError::FileClosed);
        }
        let contents = self.inner.contents.read();
        let len = contents.body.len() as u64;
        let begin = range.begin().min(len) as usize;
        let end = range.end().min(len) as usize;
        Ok(Bytes::copy_from_slice(&contents.body[begin..end]))
    }

    pub fn trailers(&self) -> Option<HeaderMap> {
        self.inner.contents.read().trailers.clone()
    }

    /// The complete body, once finished.
    pub fn snapshot(&self) -> Option<(Bytes, Option<HeaderMap>)> {
        let contents = self.inner.contents.read();
        if !contents.complete {
            return None;
        }
        Some((
            Bytes::copy_from_slice(&contents.body),
            contents.trailers.clone(),
        ))
    }
}

impl Default for PartialFile {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readers_see_appended_bytes() {
        let file = PartialFile::new();
        let reader = file.duplicate().unwrap();
        file.append(b"hello ").unwrap();
        assert_eq!(reader.read(AdjustedByteRange::new(0, 100)).unwrap(), "hello ");
        file.append(b"world").unwrap();
        assert_eq!(reader.read(AdjustedByteRange::new(6, 11)).unwrap(), "world");
        assert_eq!(reader.len(), 11);
        assert!(reader.read(AdjustedByteRange::new(20, 30)).unwrap().is_empty());
    }

    #[test]
    fn closed_file_refuses_everything() {
        let file = PartialFile::new();
        file.append(b"abc").unwrap();
        file.close();
        assert_eq!(file.duplicate().unwrap_err(), CacheError::FileClosed);
        assert_eq!(file.append(b"d").unwrap_err(), CacheError::FileClosed);
        assert!(file.read(AdjustedByteRange::new(0, 3)).is_err());
    }

    #[test]
    fn snapshot_only_when_complete() {
        let file = PartialFile::new();
        file.append(b"abc").unwrap();
        assert!(file.snapshot().is_none());
        let mut trailers = HeaderMap::new();
        trailers.insert("x-checksum", "1".parse().unwrap());
        file.finish(Some(trailers)).unwrap();
        let (body, trailers) = file.snapshot().unwrap();
        assert_eq!(body, "abc");
        assert_eq!(trailers.unwrap()["x-checksum"], "1");
    }
}
