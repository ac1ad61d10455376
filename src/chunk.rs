// Copyright 2022 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Chunk queues: append-only ordered sequences of byte ranges backed by
//! shared memory ([`bytes::Bytes`]) or file regions ([`ChunkFile`]).
//!
//! Chunks are never mutated after creation; operations produce new chunks or
//! advance offsets. All queue operations are O(1) amortized per chunk except
//! [`ChunkQueue::extract_to`], which is O(n) and may read from disk.

use std::collections::VecDeque;
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::jobqueue::JobWaker;

/// A shared handle to an open (or lazily opened) file backing file chunks.
///
/// The handle owns the descriptor; it is opened on first read and closed when
/// the last reference goes away. With `delete_on_drop` the path is unlinked
/// on drop, which is how buffered request bodies clean up after themselves.
#[derive(Debug)]
pub struct ChunkFile {
    path: Option<PathBuf>,
    file: Mutex<Option<File>>,
    delete_on_drop: bool,
}

impl ChunkFile {
    /// Creates a handle that opens `path` on first access.
    pub fn open_lazy(path: PathBuf) -> Arc<Self> {
        Arc::new(ChunkFile {
            path: Some(path),
            file: Mutex::new(None),
            delete_on_drop: false,
        })
    }

    /// Wraps an already open file.
    pub fn from_file(file: File, path: Option<PathBuf>, delete_on_drop: bool) -> Arc<Self> {
        Arc::new(ChunkFile {
            path,
            file: Mutex::new(Some(file)),
            delete_on_drop,
        })
    }

    /// The path this handle was created with, if any.
    pub fn path(&self) -> Option<&PathBuf> {
        self.path.as_ref()
    }

    fn with_file<R>(&self, f: impl FnOnce(&File) -> std::io::Result<R>) -> Result<R> {
        let mut guard = self.file.lock();
        if guard.is_none() {
            let path = self
                .path
                .as_ref()
                .ok_or(Error::Protocol("chunk file without path or descriptor"))?;
            *guard = Some(File::open(path)?);
        }
        f(guard.as_ref().expect("file was just opened")).map_err(Error::Io)
    }

    /// Reads at `offset` into `buf`, opening the file if necessary.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        self.with_file(|file| file.read_at(buf, offset))
    }

    /// Writes at `offset`, for handles created around writable descriptors.
    pub fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize> {
        self.with_file(|file| file.write_at(buf, offset))
    }

    /// Runs `f` with the raw descriptor, opening the file if necessary.
    pub(crate) fn with_raw_fd<R>(&self, f: impl FnOnce(RawFd) -> R) -> Result<R> {
        self.with_file(|file| Ok(f(file.as_raw_fd())))
    }
}

impl Drop for ChunkFile {
    fn drop(&mut self) {
        if self.delete_on_drop {
            if let Some(ref path) = self.path {
                let _ = std::fs::remove_file(path);
            }
        }
    }
}

/// Backing storage of a single chunk.
#[derive(Debug, Clone)]
enum ChunkSource {
    /// Shared immutable byte range; also covers owned arrays via `Bytes::from`.
    Mem(Bytes),
    /// Slice `[offset, offset+len)` of a shared file handle.
    File {
        file: Arc<ChunkFile>,
        offset: u64,
        len: u64,
    },
}

/// One immutable byte range inside a [`ChunkQueue`].
#[derive(Debug, Clone)]
pub struct Chunk {
    src: ChunkSource,
}

impl Chunk {
    /// Creates a memory chunk sharing `data`.
    pub fn from_bytes(data: Bytes) -> Self {
        Chunk {
            src: ChunkSource::Mem(data),
        }
    }

    /// Creates a file chunk over `[offset, offset+len)` of `file`.
    pub fn from_file(file: Arc<ChunkFile>, offset: u64, len: u64) -> Self {
        Chunk {
            src: ChunkSource::File { file, offset, len },
        }
    }

    /// Remaining length of this chunk in bytes.
    pub fn len(&self) -> u64 {
        match self.src {
            ChunkSource::Mem(ref b) => b.len() as u64,
            ChunkSource::File { len, .. } => len,
        }
    }

    /// Whether the chunk has no remaining bytes.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The memory view of this chunk, or `None` for file chunks.
    pub fn bytes(&self) -> Option<&[u8]> {
        match self.src {
            ChunkSource::Mem(ref b) => Some(b),
            ChunkSource::File { .. } => None,
        }
    }

    /// The file range of this chunk, or `None` for memory chunks.
    pub fn file_range(&self) -> Option<(&Arc<ChunkFile>, u64, u64)> {
        match self.src {
            ChunkSource::Mem(_) => None,
            ChunkSource::File {
                ref file,
                offset,
                len,
            } => Some((file, offset, len)),
        }
    }

    /// Reads up to `buf.len()` bytes starting `at` bytes into the chunk.
    pub fn read(&self, at: u64, buf: &mut [u8]) -> Result<usize> {
        match self.src {
            ChunkSource::Mem(ref b) => {
                if at >= b.len() as u64 {
                    return Ok(0);
                }
                let src = &b[at as usize..];
                let n = src.len().min(buf.len());
                buf[..n].copy_from_slice(&src[..n]);
                Ok(n)
            }
            ChunkSource::File { ref file, offset, len } => {
                if at >= len {
                    return Ok(0);
                }
                let max = ((len - at) as usize).min(buf.len());
                file.read_at(&mut buf[..max], offset + at)
            }
        }
    }

    /// Advances the chunk start by `n` bytes. `n` must not exceed `len()`.
    fn skip(&mut self, n: u64) {
        match self.src {
            ChunkSource::Mem(ref mut b) => {
                let _ = b.split_to(n as usize);
            }
            ChunkSource::File {
                ref mut offset,
                ref mut len,
                ..
            } => {
                *offset += n;
                *len -= n;
            }
        }
    }

    /// Splits off the first `n` bytes into a new chunk, sharing the backing.
    fn split_to(&mut self, n: u64) -> Chunk {
        match self.src {
            ChunkSource::Mem(ref mut b) => Chunk::from_bytes(b.split_to(n as usize)),
            ChunkSource::File {
                ref file,
                ref mut offset,
                ref mut len,
            } => {
                let head = Chunk::from_file(file.clone(), *offset, n);
                *offset += n;
                *len -= n;
                head
            }
        }
    }
}

/// Shared flow-control limit over the total bytes enqueued in a set of
/// chunk queues.
///
/// Producers check [`CqLimit::available`] after appending; when consumption
/// brings the total back under the cap, the registered waker is fired so the
/// paused producer resumes.
pub struct CqLimit {
    limit: i64,
    current: AtomicI64,
    notify: Mutex<Option<JobWaker>>,
}

impl std::fmt::Debug for CqLimit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CqLimit")
            .field("limit", &self.limit)
            .field("current", &self.current.load(Ordering::Relaxed))
            .finish()
    }
}

impl CqLimit {
    /// Creates a limit capping the shared total at `limit` bytes.
    pub fn new(limit: i64) -> Arc<Self> {
        Arc::new(CqLimit {
            limit,
            current: AtomicI64::new(0),
            notify: Mutex::new(None),
        })
    }

    /// Bytes still available under the cap; `i64::MAX` when unlimited.
    pub fn available(&self) -> i64 {
        if self.limit <= 0 {
            return i64::MAX;
        }
        (self.limit - self.current.load(Ordering::Acquire)).max(0)
    }

    /// Registers the waker fired when the total drops back under the cap.
    pub fn set_notify(&self, waker: Option<JobWaker>) {
        *self.notify.lock() = waker;
    }

    fn update(&self, delta: i64) {
        let prev = self.current.fetch_add(delta, Ordering::AcqRel);
        if self.limit > 0 && delta < 0 && prev >= self.limit && prev + delta < self.limit {
            if let Some(ref waker) = *self.notify.lock() {
                waker.wake();
            }
        }
    }
}

/// Ordered list of chunks with in/out accounting and a monotone closed flag.
///
/// Invariants: the sum of chunk lengths equals [`length`](Self::length);
/// `bytes_in - bytes_out == length`; once closed, appends fail with
/// [`Error::Closed`].
#[derive(Debug, Default)]
pub struct ChunkQueue {
    chunks: VecDeque<Chunk>,
    length: u64,
    bytes_in: u64,
    bytes_out: u64,
    is_closed: bool,
    limit: Option<Arc<CqLimit>>,
}

impl ChunkQueue {
    /// Creates an empty, open queue without a limit.
    pub fn new() -> Self {
        ChunkQueue::default()
    }

    /// Creates a queue that is already closed; used for sources with no data.
    pub fn closed() -> Self {
        ChunkQueue {
            is_closed: true,
            ..ChunkQueue::default()
        }
    }

    /// Total bytes currently queued.
    pub fn length(&self) -> u64 {
        self.length
    }

    /// Whether no bytes are queued.
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Total bytes ever appended.
    pub fn bytes_in(&self) -> u64 {
        self.bytes_in
    }

    /// Total bytes ever consumed.
    pub fn bytes_out(&self) -> u64 {
        self.bytes_out
    }

    /// Whether the closed flag is set.
    pub fn is_closed(&self) -> bool {
        self.is_closed
    }

    /// Sets the monotone closed flag; further appends fail.
    pub fn close(&mut self) {
        self.is_closed = true;
    }

    /// Attaches or clears the shared limit, folding the current queue length
    /// into the limit's accounting.
    pub fn set_limit(&mut self, limit: Option<Arc<CqLimit>>) {
        if let Some(ref old) = self.limit {
            old.update(-(self.length as i64));
        }
        if let Some(ref new) = limit {
            new.update(self.length as i64);
        }
        self.limit = limit;
    }

    /// The shared limit, if any.
    pub fn limit(&self) -> Option<&Arc<CqLimit>> {
        self.limit.as_ref()
    }

    fn push(&mut self, chunk: Chunk) {
        let len = chunk.len();
        if len == 0 {
            return;
        }
        self.length += len;
        self.bytes_in += len;
        if let Some(ref limit) = self.limit {
            limit.update(len as i64);
        }
        self.chunks.push_back(chunk);
    }

    /// Appends a copy of `data`.
    pub fn append_mem(&mut self, data: &[u8]) -> Result<()> {
        self.append_bytes(Bytes::copy_from_slice(data))
    }

    /// Appends a shared byte range without copying.
    pub fn append_bytes(&mut self, data: Bytes) -> Result<()> {
        if self.is_closed {
            return Err(Error::Closed);
        }
        self.push(Chunk::from_bytes(data));
        Ok(())
    }

    /// Appends a file range.
    pub fn append_file(&mut self, file: Arc<ChunkFile>, offset: u64, len: u64) -> Result<()> {
        if self.is_closed {
            return Err(Error::Closed);
        }
        self.push(Chunk::from_file(file, offset, len));
        Ok(())
    }

    /// Moves all chunks from `other` into this queue without copying.
    pub fn steal_all(&mut self, other: &mut ChunkQueue) -> Result<u64> {
        if self.is_closed {
            return Err(Error::Closed);
        }
        let moved = other.length;
        while let Some(chunk) = other.chunks.pop_front() {
            self.push(chunk);
        }
        other.note_consumed(moved);
        Ok(moved)
    }

    /// Moves up to `n` bytes from `other` into this queue, splitting the
    /// last chunk if necessary. Returns the number of bytes moved.
    pub fn steal_len(&mut self, other: &mut ChunkQueue, n: u64) -> Result<u64> {
        if self.is_closed {
            return Err(Error::Closed);
        }
        let mut remaining = n.min(other.length);
        let moved = remaining;
        while remaining > 0 {
            let take_whole = other
                .chunks
                .front()
                .map(|c| c.len() <= remaining)
                .expect("queue length is in sync with chunk list");
            if take_whole {
                let chunk = other.chunks.pop_front().expect("front chunk exists");
                remaining -= chunk.len();
                self.push(chunk);
            } else {
                let head = other
                    .chunks
                    .front_mut()
                    .expect("front chunk exists")
                    .split_to(remaining);
                remaining = 0;
                self.push(head);
            }
        }
        other.note_consumed(moved);
        Ok(moved)
    }

    /// Moves the first chunk wholesale; used for file-chunk passthrough.
    pub fn steal_chunk(&mut self, other: &mut ChunkQueue) -> Result<u64> {
        if self.is_closed {
            return Err(Error::Closed);
        }
        match other.chunks.pop_front() {
            Some(chunk) => {
                let len = chunk.len();
                self.push(chunk);
                other.note_consumed(len);
                Ok(len)
            }
            None => Ok(0),
        }
    }

    fn note_consumed(&mut self, n: u64) {
        self.length -= n;
        self.bytes_out += n;
        if let Some(ref limit) = self.limit {
            limit.update(-(n as i64));
        }
    }

    /// Releases up to `n` bytes from the front of the queue. Returns the
    /// number of bytes actually skipped.
    pub fn skip(&mut self, n: u64) -> u64 {
        let mut remaining = n.min(self.length);
        let skipped = remaining;
        while remaining > 0 {
            let front = self.chunks.front_mut().expect("length is in sync");
            let len = front.len();
            if len <= remaining {
                self.chunks.pop_front();
                remaining -= len;
            } else {
                front.skip(remaining);
                remaining = 0;
            }
        }
        self.note_consumed(skipped);
        skipped
    }

    /// Releases everything currently queued.
    pub fn skip_all(&mut self) -> u64 {
        let n = self.length;
        self.skip(n)
    }

    /// Reads the first `n` queued bytes into `out` without consuming them,
    /// reading file chunks from disk as needed. Fails if fewer than `n`
    /// bytes are queued or a file read fails; `out` may then hold a partial
    /// prefix but the queue itself is untouched.
    pub fn extract_to(&self, n: u64, out: &mut Vec<u8>) -> Result<()> {
        if n > self.length {
            return Err(Error::Protocol("extract beyond queue length"));
        }
        let mut remaining = n;
        out.reserve(n as usize);
        for chunk in &self.chunks {
            if remaining == 0 {
                break;
            }
            let take = chunk.len().min(remaining);
            match chunk.bytes() {
                Some(mem) => out.extend_from_slice(&mem[..take as usize]),
                None => {
                    let start = out.len();
                    out.resize(start + take as usize, 0);
                    let mut filled = 0u64;
                    while filled < take {
                        let read = chunk.read(filled, &mut out[start + filled as usize..])?;
                        if read == 0 {
                            return Err(Error::Io(std::io::Error::new(
                                std::io::ErrorKind::UnexpectedEof,
                                "file chunk shorter than recorded length",
                            )));
                        }
                        filled += read as u64;
                    }
                }
            }
            remaining -= take;
        }
        Ok(())
    }

    /// The first chunk, if any.
    pub fn first_chunk(&self) -> Option<&Chunk> {
        self.chunks.front()
    }

    /// Iterates the queued chunks front to back.
    pub fn chunks(&self) -> impl Iterator<Item = &Chunk> {
        self.chunks.iter()
    }

    /// Iterates memory slices starting `from` bytes into the queue. File
    /// chunks never occur in the wire-facing queues this is used on; hitting
    /// one ends the iteration.
    pub fn slices_from(&self, from: u64) -> impl Iterator<Item = &[u8]> {
        let mut skip = from;
        self.chunks.iter().filter_map(move |chunk| {
            if skip >= chunk.len() {
                skip -= chunk.len();
                return Some(&[][..]);
            }
            let at = skip as usize;
            skip = 0;
            chunk.bytes().map(|b| &b[at..])
        })
    }

    /// Returns the queue to its initial state for reuse.
    pub fn reset(&mut self) {
        if let Some(ref limit) = self.limit {
            limit.update(-(self.length as i64));
        }
        self.chunks.clear();
        self.length = 0;
        self.bytes_in = 0;
        self.bytes_out = 0;
        self.is_closed = false;
    }
}

#[cfg(test)]
mod test {
    use std::io::Write;

    use super::*;

    fn counters_consistent(q: &ChunkQueue) -> bool {
        let sum: u64 = q.chunks().map(|c| c.len()).sum();
        sum == q.length() && q.bytes_in() - q.bytes_out() == q.length()
    }

    #[test]
    fn chunkqueue_append_updates_counters() {
        let mut q = ChunkQueue::new();
        q.append_mem(b"hello").unwrap();
        q.append_mem(b" world").unwrap();
        assert_eq!(11, q.length());
        assert_eq!(11, q.bytes_in());
        assert_eq!(0, q.bytes_out());
        assert!(counters_consistent(&q));
    }

    #[test]
    fn chunkqueue_append_on_closed_fails() {
        let mut q = ChunkQueue::new();
        q.close();
        assert!(matches!(q.append_mem(b"x"), Err(Error::Closed)));
    }

    #[test]
    fn chunkqueue_skip_releases_consumed_chunks() {
        let mut q = ChunkQueue::new();
        q.append_mem(b"abc").unwrap();
        q.append_mem(b"defg").unwrap();
        assert_eq!(5, q.skip(5));
        assert_eq!(2, q.length());
        assert_eq!(5, q.bytes_out());
        assert!(counters_consistent(&q));
        let mut out = Vec::new();
        q.extract_to(2, &mut out).unwrap();
        assert_eq!(b"fg", &out[..]);
    }

    #[test]
    fn chunkqueue_skip_past_end_is_bounded() {
        let mut q = ChunkQueue::new();
        q.append_mem(b"ab").unwrap();
        assert_eq!(2, q.skip(100));
        assert_eq!(0, q.length());
        assert!(counters_consistent(&q));
    }

    #[test]
    fn chunkqueue_steal_len_splits_chunks() {
        let mut src = ChunkQueue::new();
        let mut dst = ChunkQueue::new();
        src.append_mem(b"0123456789").unwrap();
        assert_eq!(4, dst.steal_len(&mut src, 4).unwrap());
        assert_eq!(6, src.length());
        assert_eq!(4, dst.length());
        assert_eq!(4, src.bytes_out());
        assert!(counters_consistent(&src));
        assert!(counters_consistent(&dst));
        let mut out = Vec::new();
        dst.extract_to(4, &mut out).unwrap();
        assert_eq!(b"0123", &out[..]);
    }

    #[test]
    fn chunkqueue_steal_all_moves_everything() {
        let mut src = ChunkQueue::new();
        let mut dst = ChunkQueue::new();
        src.append_mem(b"abc").unwrap();
        src.append_mem(b"def").unwrap();
        assert_eq!(6, dst.steal_all(&mut src).unwrap());
        assert_eq!(0, src.length());
        assert_eq!(6, dst.length());
        assert!(counters_consistent(&src));
        assert!(counters_consistent(&dst));
    }

    #[test]
    fn chunkqueue_extract_reads_file_chunks() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(b"file contents").unwrap();
        let file = ChunkFile::open_lazy(tmp.path().to_path_buf());
        let mut q = ChunkQueue::new();
        q.append_mem(b"mem:").unwrap();
        q.append_file(file, 5, 8).unwrap();
        let mut out = Vec::new();
        q.extract_to(12, &mut out).unwrap();
        assert_eq!(b"mem:contents", &out[..]);
        assert_eq!(12, q.length());
    }

    #[test]
    fn chunkqueue_limit_accounts_across_queues() {
        let limit = CqLimit::new(10);
        let mut a = ChunkQueue::new();
        let mut b = ChunkQueue::new();
        a.set_limit(Some(limit.clone()));
        b.set_limit(Some(limit.clone()));
        a.append_mem(b"1234").unwrap();
        b.append_mem(b"5678").unwrap();
        assert_eq!(2, limit.available());
        a.skip_all();
        assert_eq!(6, limit.available());
    }

    #[test]
    fn chunkqueue_slices_from_offsets_into_first_chunk() {
        let mut q = ChunkQueue::new();
        q.append_mem(b"abcd").unwrap();
        q.append_mem(b"efgh").unwrap();
        let collected: Vec<u8> = q.slices_from(2).flatten().copied().collect();
        assert_eq!(b"cdefgh", &collected[..]);
    }
}
