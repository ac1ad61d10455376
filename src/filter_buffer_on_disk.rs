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

//! Buffer-on-disk filter: spools memory chunks into an unlinked tempfile
//! and emits file ranges, so large bodies never sit in memory.
//!
//! The tempfile is opened once on first write. Output is emitted either on
//! input close, or whenever more than `flush_limit` unflushed bytes
//! accumulated. File chunks pass through untouched.

use std::path::PathBuf;
use std::sync::Arc;

use crate::chunk::{ChunkFile, ChunkQueue};
use crate::filter::{FilterHandler, FilterResult};

/// State of one buffer-on-disk instance.
#[derive(Debug)]
pub struct BufferOnDisk {
    tempfile: Option<Arc<ChunkFile>>,
    write_pos: u64,
    flush_pos: u64,
    /// Emit queued tempfile ranges once this many unflushed bytes exist;
    /// `None` flushes only on close.
    flush_limit: Option<u64>,
    /// Start a fresh tempfile after a passed-through file chunk.
    split_on_file_chunks: bool,
    tmp_dir: PathBuf,
}

impl BufferOnDisk {
    /// Creates a spooler writing tempfiles into `tmp_dir`.
    pub fn new(tmp_dir: PathBuf, flush_limit: Option<u64>, split_on_file_chunks: bool) -> Self {
        BufferOnDisk {
            tempfile: None,
            write_pos: 0,
            flush_pos: 0,
            flush_limit,
            split_on_file_chunks,
            tmp_dir,
        }
    }

    fn open(&mut self) -> Result<(), ()> {
        if self.tempfile.is_none() {
            let file = tempfile::tempfile_in(&self.tmp_dir).map_err(|e| {
                log::error!("tempfile creation in {:?} failed: {}", self.tmp_dir, e);
            })?;
            self.tempfile = Some(ChunkFile::from_file(file, None, false));
            self.write_pos = 0;
            self.flush_pos = 0;
        }
        Ok(())
    }

    fn close_file(&mut self) {
        self.tempfile = None;
        self.write_pos = 0;
        self.flush_pos = 0;
    }

    fn flush(&mut self, out: &mut ChunkQueue) -> Result<(), ()> {
        if let Some(ref tempfile) = self.tempfile {
            if self.write_pos > self.flush_pos {
                out.append_file(
                    tempfile.clone(),
                    self.flush_pos,
                    self.write_pos - self.flush_pos,
                )
                .map_err(|_| ())?;
                self.flush_pos = self.write_pos;
            }
        }
        Ok(())
    }

    fn autoflush(&mut self, out: &mut ChunkQueue) -> Result<(), ()> {
        if let Some(limit) = self.flush_limit {
            if self.tempfile.is_some() && self.write_pos - self.flush_pos > limit {
                self.flush(out)?;
            }
        }
        Ok(())
    }

    /// Runs the spooler over the currently queued input.
    pub fn run(&mut self, out: &mut ChunkQueue, input: &mut ChunkQueue) -> FilterResult {
        if out.is_closed() {
            input.skip_all();
            input.close();
            self.close_file();
            return FilterResult::GoOn;
        }

        while input.length() > 0 {
            let first_is_file = input
                .first_chunk()
                .map(|c| c.file_range().is_some())
                .unwrap_or(false);

            if first_is_file {
                if self.flush(out).is_err() {
                    return FilterResult::Error;
                }
                if self.split_on_file_chunks {
                    self.close_file();
                }
                if out.steal_chunk(input).is_err() {
                    return FilterResult::Error;
                }
                continue;
            }

            if self.open().is_err() {
                return FilterResult::Error;
            }
            let written = {
                let chunk = input.first_chunk().expect("input has length");
                let mem = chunk.bytes().expect("first chunk is memory");
                let tempfile = self.tempfile.as_ref().expect("tempfile was just opened");
                let mut off = 0usize;
                loop {
                    match tempfile.write_at(&mem[off..], self.write_pos + off as u64) {
                        Ok(0) => break Err(()),
                        Ok(n) => {
                            off += n;
                            if off == mem.len() {
                                break Ok(off);
                            }
                        }
                        Err(e) => {
                            log::error!("buffer-on-disk write failed: {}", e);
                            break Err(());
                        }
                    }
                }
            };
            match written {
                Ok(n) => {
                    self.write_pos += n as u64;
                    input.skip(n as u64);
                }
                Err(()) => return FilterResult::Error,
            }
        }

        if self.autoflush(out).is_err() {
            return FilterResult::Error;
        }

        if input.is_closed() {
            if self.flush(out).is_err() {
                return FilterResult::Error;
            }
            out.close();
            self.close_file();
        }
        FilterResult::GoOn
    }
}

impl FilterHandler for BufferOnDisk {
    fn handle_data(&mut self, input: &mut ChunkQueue, out: &mut ChunkQueue) -> FilterResult {
        self.run(out, input)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn extract_all(q: &ChunkQueue) -> Vec<u8> {
        let mut out = Vec::new();
        q.extract_to(q.length(), &mut out).unwrap();
        out
    }

    #[test]
    fn buffer_on_disk_round_trips_body() {
        let mut bod = BufferOnDisk::new(std::env::temp_dir(), None, false);
        let mut input = ChunkQueue::new();
        let mut out = ChunkQueue::new();
        input.append_mem(b"spooled ").unwrap();
        input.append_mem(b"to disk").unwrap();
        input.close();
        assert_eq!(FilterResult::GoOn, bod.run(&mut out, &mut input));
        assert!(out.is_closed());
        // one file chunk, contents intact
        assert_eq!(1, out.chunks().count());
        assert!(out.first_chunk().unwrap().file_range().is_some());
        assert_eq!(b"spooled to disk".to_vec(), extract_all(&out));
    }

    #[test]
    fn buffer_on_disk_flush_limit_emits_before_close() {
        let mut bod = BufferOnDisk::new(std::env::temp_dir(), Some(4), false);
        let mut input = ChunkQueue::new();
        let mut out = ChunkQueue::new();
        input.append_mem(b"0123456789").unwrap();
        assert_eq!(FilterResult::GoOn, bod.run(&mut out, &mut input));
        // limit exceeded, so data is visible although input is still open
        assert_eq!(10, out.length());
        assert!(!out.is_closed());
        input.append_mem(b"ab").unwrap();
        input.close();
        bod.run(&mut out, &mut input);
        assert_eq!(b"0123456789ab".to_vec(), extract_all(&out));
        assert!(out.is_closed());
    }

    #[test]
    fn buffer_on_disk_passes_file_chunks_through() {
        use std::io::Write;
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(b"existing").unwrap();
        let file = ChunkFile::open_lazy(tmp.path().to_path_buf());

        let mut bod = BufferOnDisk::new(std::env::temp_dir(), None, false);
        let mut input = ChunkQueue::new();
        let mut out = ChunkQueue::new();
        input.append_mem(b"mem-").unwrap();
        input.append_file(file, 0, 8).unwrap();
        input.close();
        bod.run(&mut out, &mut input);
        assert_eq!(b"mem-existing".to_vec(), extract_all(&out));
    }
}
