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

//! Socket-side byte movement.
//!
//! The poll registration is edge-triggered, so the read and write engines
//! always run until `EAGAIN`, end-of-stream or an exhausted throttle
//! allowance; the caller tracks `can_read`/`can_write` flags accordingly.
//! Writes drain a chunk queue with the best available syscall: `writev`
//! over the memory chunks at the head of the queue, `sendfile` for file
//! chunks (with a pread fallback off Linux).

use std::io::{ErrorKind, Read};
use std::os::unix::io::RawFd;

use bytes::BytesMut;

use crate::chunk::ChunkQueue;

const READ_CHUNK: usize = 16 * 1024;
const MAX_IOVECS: usize = 32;

/// How a read loop ended.
#[derive(Debug)]
pub enum ReadStatus {
    /// `EAGAIN`: clear `can_read` until the loop signals readiness again.
    Blocked,
    /// Peer closed its sending side.
    Eof,
    /// The throttle allowance ran out; register for the next tick.
    Throttled,
    /// Fatal socket error.
    Error(std::io::Error),
}

/// Reads from `sock` into `out` until blocked, eof, error or `allowance`
/// bytes were moved. Returns the bytes read and the loop status.
pub fn socket_read(
    sock: &mut impl Read,
    scratch: &mut BytesMut,
    out: &mut ChunkQueue,
    allowance: usize,
) -> (usize, ReadStatus) {
    let mut total = 0usize;
    loop {
        if total >= allowance {
            return (total, ReadStatus::Throttled);
        }
        let want = READ_CHUNK.min(allowance - total);
        scratch.clear();
        scratch.resize(want, 0);
        match sock.read(&mut scratch[..want]) {
            Ok(0) => return (total, ReadStatus::Eof),
            Ok(n) => {
                scratch.truncate(n);
                let data = scratch.split_to(n).freeze();
                if out.append_bytes(data).is_err() {
                    // closed queue: input after the end is a peer error
                    return (
                        total,
                        ReadStatus::Error(std::io::Error::new(
                            ErrorKind::InvalidData,
                            "input after closed stream",
                        )),
                    );
                }
                total += n;
            }
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                return (total, ReadStatus::Blocked)
            }
            Err(ref e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return (total, ReadStatus::Error(e)),
        }
    }
}

/// How a write loop ended.
#[derive(Debug)]
pub enum WriteStatus {
    /// The queue is drained.
    Done,
    /// `EAGAIN`: clear `can_write` until the loop signals readiness again.
    Blocked,
    /// The throttle allowance ran out; register for the next tick.
    Throttled,
    /// Fatal socket error.
    Error(std::io::Error),
}

fn write_mem_chunks(fd: RawFd, out: &mut ChunkQueue, allowance: usize) -> std::io::Result<usize> {
    let mut iovs = [libc::iovec {
        iov_base: std::ptr::null_mut(),
        iov_len: 0,
    }; MAX_IOVECS];
    let mut cnt = 0;
    let mut budget = allowance;
    for chunk in out.chunks() {
        if cnt == MAX_IOVECS || budget == 0 {
            break;
        }
        let Some(mem) = chunk.bytes() else { break };
        let len = mem.len().min(budget);
        iovs[cnt] = libc::iovec {
            iov_base: mem.as_ptr() as *mut libc::c_void,
            iov_len: len,
        };
        budget -= len;
        cnt += 1;
    }
    if cnt == 0 {
        return Ok(0);
    }
    // SAFETY: the iovecs point into chunks owned by `out`, which outlives
    // the syscall; cnt is bounded by MAX_IOVECS
    let n = unsafe { libc::writev(fd, iovs.as_ptr(), cnt as libc::c_int) };
    if n < 0 {
        return Err(std::io::Error::last_os_error());
    }
    out.skip(n as u64);
    Ok(n as usize)
}

#[cfg(target_os = "linux")]
fn write_file_chunk(
    fd: RawFd,
    file_fd: RawFd,
    offset: u64,
    len: usize,
) -> std::io::Result<usize> {
    let mut off = offset as libc::off_t;
    let n = unsafe { libc::sendfile(fd, file_fd, &mut off, len) };
    if n < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(n as usize)
}

#[cfg(not(target_os = "linux"))]
fn write_file_chunk(
    fd: RawFd,
    file_fd: RawFd,
    offset: u64,
    len: usize,
) -> std::io::Result<usize> {
    let mut buf = [0u8; READ_CHUNK];
    let want = len.min(buf.len());
    let r = unsafe {
        libc::pread(
            file_fd,
            buf.as_mut_ptr() as *mut libc::c_void,
            want,
            offset as libc::off_t,
        )
    };
    if r < 0 {
        return Err(std::io::Error::last_os_error());
    }
    let n = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, r as usize) };
    if n < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(n as usize)
}

/// Drains `out` into the socket `fd` until blocked, drained, error or
/// `allowance` bytes were written. Returns bytes written and the status.
pub fn socket_write(fd: RawFd, out: &mut ChunkQueue, allowance: usize) -> (usize, WriteStatus) {
    let mut total = 0usize;
    loop {
        if out.is_empty() {
            return (total, WriteStatus::Done);
        }
        if total >= allowance {
            return (total, WriteStatus::Throttled);
        }
        let budget = allowance - total;

        let head_file = out
            .first_chunk()
            .and_then(|c| c.file_range().map(|(f, off, len)| (f.clone(), off, len)));
        let is_file = head_file.is_some();

        let res = match head_file {
            Some((file, offset, len)) => {
                let want = (len as usize).min(budget);
                match file.with_raw_fd(|ffd| write_file_chunk(fd, ffd, offset, want)) {
                    Ok(inner) => inner,
                    Err(e) => {
                        return (
                            total,
                            WriteStatus::Error(std::io::Error::new(
                                ErrorKind::Other,
                                e.to_string(),
                            )),
                        )
                    }
                }
            }
            None => write_mem_chunks(fd, out, budget),
        };

        match res {
            Ok(0) => return (total, WriteStatus::Blocked),
            Ok(n) => {
                if is_file {
                    out.skip(n as u64);
                }
                total += n;
            }
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                return (total, WriteStatus::Blocked)
            }
            Err(ref e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return (total, WriteStatus::Error(e)),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write;
    use std::os::unix::io::AsRawFd;

    #[test]
    fn socket_read_appends_until_blocked() {
        let (mut a, b) = std::os::unix::net::UnixStream::pair().unwrap();
        b.set_nonblocking(true).unwrap();
        let mut b = b;
        a.write_all(b"hello socket").unwrap();
        let mut scratch = BytesMut::new();
        let mut out = ChunkQueue::new();
        let (n, status) = socket_read(&mut b, &mut scratch, &mut out, usize::MAX);
        assert_eq!(12, n);
        assert!(matches!(status, ReadStatus::Blocked));
        let mut data = Vec::new();
        out.extract_to(12, &mut data).unwrap();
        assert_eq!(b"hello socket", &data[..]);
    }

    #[test]
    fn socket_read_reports_eof() {
        let (a, b) = std::os::unix::net::UnixStream::pair().unwrap();
        b.set_nonblocking(true).unwrap();
        let mut b = b;
        drop(a);
        let mut scratch = BytesMut::new();
        let mut out = ChunkQueue::new();
        let (n, status) = socket_read(&mut b, &mut scratch, &mut out, usize::MAX);
        assert_eq!(0, n);
        assert!(matches!(status, ReadStatus::Eof));
    }

    #[test]
    fn socket_read_respects_allowance() {
        let (mut a, b) = std::os::unix::net::UnixStream::pair().unwrap();
        b.set_nonblocking(true).unwrap();
        let mut b = b;
        a.write_all(&[0u8; 1024]).unwrap();
        let mut scratch = BytesMut::new();
        let mut out = ChunkQueue::new();
        let (n, status) = socket_read(&mut b, &mut scratch, &mut out, 100);
        assert_eq!(100, n);
        assert!(matches!(status, ReadStatus::Throttled));
    }

    #[test]
    fn socket_write_drains_mem_chunks() {
        let (a, mut b) = std::os::unix::net::UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        let mut out = ChunkQueue::new();
        out.append_mem(b"first ").unwrap();
        out.append_mem(b"second").unwrap();
        let (n, status) = socket_write(a.as_raw_fd(), &mut out, usize::MAX);
        assert_eq!(12, n);
        assert!(matches!(status, WriteStatus::Done));
        let mut read_back = [0u8; 12];
        b.read_exact(&mut read_back).unwrap();
        assert_eq!(b"first second", &read_back);
    }

    #[test]
    fn socket_write_handles_file_chunks() {
        use crate::chunk::ChunkFile;
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(b"file payload").unwrap();
        let file = ChunkFile::open_lazy(tmp.path().to_path_buf());

        let (a, mut b) = std::os::unix::net::UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        let mut out = ChunkQueue::new();
        out.append_mem(b"head:").unwrap();
        out.append_file(file, 5, 7).unwrap();
        let (n, status) = socket_write(a.as_raw_fd(), &mut out, usize::MAX);
        assert_eq!(12, n);
        assert!(matches!(status, WriteStatus::Done));
        assert!(out.is_empty());
        let mut read_back = [0u8; 12];
        b.read_exact(&mut read_back).unwrap();
        assert_eq!(b"head:payload", &read_back);
    }
}
