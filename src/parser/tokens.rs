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

//! Byte classification per RFC 9110 Section 5.6.2 and RFC 3986.

/// tchar = "!" / "#" / "$" / "%" / "&" / "'" / "*" / "+" / "-" / "." /
///         "^" / "_" / "`" / "|" / "~" / DIGIT / ALPHA
#[inline]
pub fn is_token(b: u8) -> bool {
    matches!(b,
        b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'*' | b'+' | b'-' | b'.'
        | b'^' | b'_' | b'`' | b'|' | b'~' | b'0'..=b'9' | b'a'..=b'z' | b'A'..=b'Z')
}

/// Bytes allowed in a request target: pchar, path separators, query parts.
#[inline]
pub fn is_request_target_token(b: u8) -> bool {
    // visible ASCII except SP, DEL and the delimiters excluded by RFC 3986
    (0x21..=0x7e).contains(&b) && b != b'"' && b != b'<' && b != b'>' && b != b'\\' && b != b'^' && b != b'`' && b != b'{' && b != b'|' && b != b'}'
}

/// field-vchar / SP / HTAB; obs-text (0x80..) is tolerated on ingest.
#[inline]
pub fn is_header_value_token(b: u8) -> bool {
    b == b'\t' || b == b' ' || (0x21..=0x7e).contains(&b) || b >= 0x80
}
