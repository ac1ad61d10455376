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

//! Chunked transfer coding per RFC 7230 Section 4.1.
//!
//! The decoder consumes exactly one chunked message from its input: once
//! the trailer is read the output queue is closed and any surplus bytes
//! stay on the input queue for the next request on the connection.
//! Trailer headers are consumed and discarded; the encoder never produces
//! trailers.

use bytes::Bytes;

use crate::chunk::ChunkQueue;
use crate::filter::{FilterHandler, FilterResult};

/// Encodes everything currently queued in `input` into `out`: hex length
/// line, the bytes, CRLF; on input close the `0\r\n\r\n` trailer.
pub fn chunked_encode(out: &mut ChunkQueue, input: &mut ChunkQueue) -> FilterResult {
    if input.length() > 0 {
        let header = format!("{:x}\r\n", input.length());
        if out.append_bytes(Bytes::from(header)).is_err()
            || out.steal_all(input).is_err()
            || out.append_mem(b"\r\n").is_err()
        {
            return FilterResult::Error;
        }
    }
    if input.is_closed() && !out.is_closed() {
        if out.append_mem(b"0\r\n\r\n").is_err() {
            return FilterResult::Error;
        }
        out.close();
    }
    FilterResult::GoOn
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeStep {
    ChunkLenStart,
    ChunkLen,
    ChunkLenCr,
    Data,
    DataCr,
    DataLf,
    /// inside a trailer line, waiting for `\r\n\r\n`
    TrailerAny,
    /// saw `\r`, waiting for `\n\r\n`
    TrailerLf,
    /// at a line start, waiting for `\r\n`
    TrailerCr,
    /// saw the final `\r`, waiting for `\n`
    TrailerEnd,
    Done,
    Failed,
}

/// State carried across invocations of [`chunked_decode`].
#[derive(Debug)]
pub struct ChunkedDecodeState {
    step: DecodeStep,
    cur_chunklen: i64,
}

impl ChunkedDecodeState {
    /// A decoder at the start of a chunked message.
    pub fn new() -> Self {
        ChunkedDecodeState {
            step: DecodeStep::ChunkLenStart,
            cur_chunklen: -1,
        }
    }

    /// Whether the trailer was fully consumed.
    pub fn is_done(&self) -> bool {
        self.step == DecodeStep::Done
    }

    /// Whether the decoder hit invalid framing.
    pub fn is_failed(&self) -> bool {
        self.step == DecodeStep::Failed
    }
}

impl Default for ChunkedDecodeState {
    fn default() -> Self {
        ChunkedDecodeState::new()
    }
}

fn next_byte(input: &mut ChunkQueue) -> Option<u8> {
    let b = input.first_chunk().and_then(|c| c.bytes().map(|m| m[0]));
    if b.is_some() {
        input.skip(1);
    }
    b
}

fn hex_digit(c: u8) -> Option<i64> {
    match c {
        b'0'..=b'9' => Some((c - b'0') as i64),
        b'a'..=b'f' => Some((c - b'a' + 10) as i64),
        b'A'..=b'F' => Some((c - b'A' + 10) as i64),
        _ => None,
    }
}

fn fail(out: &mut ChunkQueue, input: &mut ChunkQueue, state: &mut ChunkedDecodeState) -> FilterResult {
    state.step = DecodeStep::Failed;
    out.close();
    input.skip_all();
    input.close();
    FilterResult::Error
}

/// Decodes available chunked framing from `input` into `out`.
///
/// Chunk lengths are limited to a signed 63-bit range; invalid hex or
/// overflow fails the decode and closes both queues.
pub fn chunked_decode(
    out: &mut ChunkQueue,
    input: &mut ChunkQueue,
    state: &mut ChunkedDecodeState,
) -> FilterResult {
    loop {
        match state.step {
            DecodeStep::ChunkLenStart => {
                state.cur_chunklen = -1;
                state.step = DecodeStep::ChunkLen;
            }
            DecodeStep::ChunkLen => {
                let Some(c) = next_byte(input) else { break };
                if let Some(digit) = hex_digit(c) {
                    if state.cur_chunklen < 0 {
                        state.cur_chunklen = digit;
                    } else if (i64::MAX - digit) / 16 < state.cur_chunklen {
                        return fail(out, input, state);
                    } else {
                        state.cur_chunklen = 16 * state.cur_chunklen + digit;
                    }
                } else if c == b'\r' && state.cur_chunklen >= 0 {
                    state.step = DecodeStep::ChunkLenCr;
                } else {
                    return fail(out, input, state);
                }
            }
            DecodeStep::ChunkLenCr => {
                let Some(c) = next_byte(input) else { break };
                if c != b'\n' {
                    return fail(out, input, state);
                }
                state.step = if state.cur_chunklen > 0 {
                    DecodeStep::Data
                } else {
                    DecodeStep::TrailerCr
                };
            }
            DecodeStep::Data => {
                if state.cur_chunklen > 0 {
                    match out.steal_len(input, state.cur_chunklen as u64) {
                        Ok(moved) => state.cur_chunklen -= moved as i64,
                        Err(_) => return fail(out, input, state),
                    }
                }
                if state.cur_chunklen > 0 {
                    break;
                }
                state.step = DecodeStep::DataCr;
            }
            DecodeStep::DataCr => {
                let Some(c) = next_byte(input) else { break };
                if c != b'\r' {
                    return fail(out, input, state);
                }
                state.step = DecodeStep::DataLf;
            }
            DecodeStep::DataLf => {
                let Some(c) = next_byte(input) else { break };
                if c != b'\n' {
                    return fail(out, input, state);
                }
                state.step = DecodeStep::ChunkLenStart;
            }
            DecodeStep::TrailerAny => {
                let Some(c) = next_byte(input) else { break };
                if c == b'\r' {
                    state.step = DecodeStep::TrailerLf;
                }
            }
            DecodeStep::TrailerLf => {
                let Some(c) = next_byte(input) else { break };
                state.step = if c == b'\n' {
                    DecodeStep::TrailerCr
                } else {
                    DecodeStep::TrailerAny
                };
            }
            DecodeStep::TrailerCr => {
                let Some(c) = next_byte(input) else { break };
                state.step = if c == b'\r' {
                    DecodeStep::TrailerEnd
                } else {
                    DecodeStep::TrailerAny
                };
            }
            DecodeStep::TrailerEnd => {
                let Some(c) = next_byte(input) else { break };
                state.step = if c == b'\n' {
                    DecodeStep::Done
                } else {
                    DecodeStep::TrailerAny
                };
            }
            DecodeStep::Done => {
                // surplus bytes after the trailer stay on the input queue
                out.close();
                return FilterResult::GoOn;
            }
            DecodeStep::Failed => return FilterResult::Error,
        }
    }

    // ran out of input mid-message
    if input.is_closed() {
        return fail(out, input, state);
    }
    FilterResult::GoOn
}

/// Chunked transfer encoder as a chain filter.
#[derive(Debug, Default)]
pub struct ChunkedEncodeFilter;

impl FilterHandler for ChunkedEncodeFilter {
    fn handle_data(&mut self, input: &mut ChunkQueue, out: &mut ChunkQueue) -> FilterResult {
        chunked_encode(out, input)
    }
}

/// Chunked transfer decoder as a chain filter.
#[derive(Debug, Default)]
pub struct ChunkedDecodeFilter {
    state: ChunkedDecodeState,
}

impl FilterHandler for ChunkedDecodeFilter {
    fn handle_data(&mut self, input: &mut ChunkQueue, out: &mut ChunkQueue) -> FilterResult {
        chunked_decode(out, input, &mut self.state)
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
    fn chunked_encode_frames_and_trails() {
        let mut input = ChunkQueue::new();
        let mut out = ChunkQueue::new();
        input.append_mem(b"hello").unwrap();
        input.close();
        assert_eq!(FilterResult::GoOn, chunked_encode(&mut out, &mut input));
        assert_eq!(b"5\r\nhello\r\n0\r\n\r\n".to_vec(), extract_all(&out));
        assert!(out.is_closed());
    }

    #[test]
    fn chunked_encode_empty_body_is_only_trailer() {
        let mut input = ChunkQueue::new();
        let mut out = ChunkQueue::new();
        input.close();
        chunked_encode(&mut out, &mut input);
        assert_eq!(b"0\r\n\r\n".to_vec(), extract_all(&out));
    }

    #[test]
    fn chunked_decode_consumes_trailer_and_leaves_surplus() {
        // 0x14 = 20 data bytes, a trailer header, then surplus
        let mut input = ChunkQueue::new();
        input
            .append_mem(b"14\r\n01234567890123456789\r\n0\r\nx: y\r\n\r\nxxx")
            .unwrap();
        input.close();
        let mut out = ChunkQueue::new();
        let mut state = ChunkedDecodeState::new();
        assert_eq!(
            FilterResult::GoOn,
            chunked_decode(&mut out, &mut input, &mut state)
        );
        assert!(state.is_done());
        assert_eq!(b"01234567890123456789".to_vec(), extract_all(&out));
        assert!(out.is_closed());
        assert_eq!(b"xxx".to_vec(), extract_all(&input));
    }

    #[test]
    fn chunked_decode_is_left_inverse_of_encode() {
        let payloads: [&[u8]; 4] = [b"", b"x", b"hello world", &[0xffu8; 300]];
        for payload in payloads {
            let mut body = ChunkQueue::new();
            body.append_mem(payload).unwrap();
            body.close();
            let mut wire = ChunkQueue::new();
            chunked_encode(&mut wire, &mut body);

            let mut decoded = ChunkQueue::new();
            let mut state = ChunkedDecodeState::new();
            wire.close();
            assert_eq!(
                FilterResult::GoOn,
                chunked_decode(&mut decoded, &mut wire, &mut state)
            );
            assert!(state.is_done());
            assert_eq!(payload.to_vec(), extract_all(&decoded));
        }
    }

    #[test]
    fn chunked_decode_handles_split_arrivals() {
        let wire = b"5\r\nhello\r\n0\r\n\r\n";
        let mut input = ChunkQueue::new();
        let mut out = ChunkQueue::new();
        let mut state = ChunkedDecodeState::new();
        for &b in wire.iter() {
            input.append_mem(&[b]).unwrap();
            let res = chunked_decode(&mut out, &mut input, &mut state);
            assert_eq!(FilterResult::GoOn, res);
        }
        assert!(state.is_done());
        assert_eq!(b"hello".to_vec(), extract_all(&out));
    }

    #[test]
    fn chunked_decode_rejects_invalid_hex() {
        let mut input = ChunkQueue::new();
        input.append_mem(b"zz\r\ndata").unwrap();
        let mut out = ChunkQueue::new();
        let mut state = ChunkedDecodeState::new();
        assert_eq!(
            FilterResult::Error,
            chunked_decode(&mut out, &mut input, &mut state)
        );
        assert!(state.is_failed());
        assert!(out.is_closed());
        assert!(input.is_closed());
        assert!(input.is_empty());
    }

    #[test]
    fn chunked_decode_rejects_length_overflow() {
        let mut input = ChunkQueue::new();
        input.append_mem(b"fffffffffffffffff\r\n").unwrap();
        let mut out = ChunkQueue::new();
        let mut state = ChunkedDecodeState::new();
        assert_eq!(
            FilterResult::Error,
            chunked_decode(&mut out, &mut input, &mut state)
        );
    }

    #[test]
    fn chunked_decode_truncated_input_fails_on_close() {
        let mut input = ChunkQueue::new();
        input.append_mem(b"5\r\nhel").unwrap();
        input.close();
        let mut out = ChunkQueue::new();
        let mut state = ChunkedDecodeState::new();
        assert_eq!(
            FilterResult::Error,
            chunked_decode(&mut out, &mut input, &mut state)
        );
    }
}
