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

//! Entity tags and conditional request handling per RFC 7232.

use std::time::UNIX_EPOCH;

use crate::http_headers::HttpHeaders;
use crate::parser::date::{format_imf_fixdate, parse_imf_fixdate};
use crate::stat_cache::FileInfo;

/// Include the inode number in generated etags.
pub const ETAG_USE_INODE: u32 = 1;
/// Include the file size in generated etags.
pub const ETAG_USE_SIZE: u32 = 2;
/// Include the modification time in generated etags.
pub const ETAG_USE_MTIME: u32 = 4;

/// Three-valued conditional result: a request without the relevant
/// precondition header stays at `Maybe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tri {
    /// Precondition matched; a 304 may be served.
    True,
    /// Precondition present but did not match.
    False,
    /// No precondition present.
    Maybe,
}

fn mutate(raw: &str) -> String {
    let mut h: u32 = 0;
    for &b in raw.as_bytes() {
        h = (h << 5) ^ (h >> 27) ^ b as u32;
    }
    format!("\"{}\"", h)
}

/// Computes the etag for a stat result under the configured flags;
/// `None` when all flags are cleared.
pub fn etag_for(info: &FileInfo, flags: u32) -> Option<String> {
    if flags == 0 {
        return None;
    }
    let mut raw = String::new();
    if flags & ETAG_USE_INODE != 0 {
        raw.push_str(&info.inode.to_string());
    }
    if flags & ETAG_USE_SIZE != 0 {
        if !raw.is_empty() {
            raw.push('-');
        }
        raw.push_str(&info.size.to_string());
    }
    if flags & ETAG_USE_MTIME != 0 {
        if !raw.is_empty() {
            raw.push('-');
        }
        let mtime = info
            .mtime
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        raw.push_str(&mtime.to_string());
    }
    Some(mutate(&raw))
}

/// Checks `If-None-Match` against `etag`. The header may hold a
/// comma-separated list; `*` matches any current representation.
pub fn cachable_etag(request_headers: &HttpHeaders, etag: &str) -> Tri {
    let mut res = Tri::Maybe;
    for value in request_headers.values("If-None-Match") {
        res = Tri::False;
        for candidate in value.split(',') {
            let candidate = candidate.trim().trim_start_matches("W/");
            if candidate == "*" || candidate == etag {
                return Tri::True;
            }
        }
    }
    res
}

/// Checks `If-Modified-Since` against the `Last-Modified` value the
/// response will carry. Duplicate headers disable caching.
pub fn cachable_modified(request_headers: &HttpHeaders, last_modified: &str) -> Tri {
    if request_headers.count("If-Modified-Since") > 1 {
        return Tri::False;
    }
    let Some(header) = request_headers.get("If-Modified-Since") else {
        return Tri::Maybe;
    };
    // some clients append a length hint after a semicolon
    let header = header.split(';').next().unwrap_or(header).trim();
    if header == last_modified {
        return Tri::True;
    }
    let (Some(t_header), Some(t_file)) = (parse_imf_fixdate(header), parse_imf_fixdate(last_modified))
    else {
        return Tri::False;
    };
    if t_file > t_header {
        Tri::False
    } else {
        Tri::True
    }
}

/// Sets `ETag` and `Last-Modified` on the response and reports whether the
/// request's preconditions allow a 304.
pub fn set_headers(
    request_headers: &HttpHeaders,
    response_headers: &mut HttpHeaders,
    info: &FileInfo,
    flags: u32,
) -> bool {
    let mut cachable = Tri::Maybe;

    match etag_for(info, flags) {
        Some(etag) => {
            response_headers.overwrite("ETag", &etag);
            match cachable_etag(request_headers, &etag) {
                Tri::False => cachable = Tri::False,
                Tri::True => cachable = Tri::True,
                Tri::Maybe => {}
            }
        }
        None => {
            response_headers.remove("ETag");
        }
    }

    let last_modified = format_imf_fixdate(info.mtime);
    response_headers.overwrite("Last-Modified", &last_modified);
    if cachable != Tri::False {
        match cachable_modified(request_headers, &last_modified) {
            Tri::False => cachable = Tri::False,
            Tri::True => cachable = Tri::True,
            Tri::Maybe => {}
        }
    }

    cachable == Tri::True
}

#[cfg(test)]
mod test {
    use std::time::{Duration, SystemTime};

    use super::*;

    fn info() -> FileInfo {
        FileInfo {
            size: 13,
            mtime: UNIX_EPOCH + Duration::from_secs(784111777),
            inode: 42,
            is_dir: false,
            is_file: true,
        }
    }

    #[test]
    fn etag_is_stable_and_quoted() {
        let a = etag_for(&info(), ETAG_USE_INODE | ETAG_USE_SIZE | ETAG_USE_MTIME).unwrap();
        let b = etag_for(&info(), ETAG_USE_INODE | ETAG_USE_SIZE | ETAG_USE_MTIME).unwrap();
        assert_eq!(a, b);
        assert!(a.starts_with('"') && a.ends_with('"'));
    }

    #[test]
    fn etag_changes_with_size() {
        let mut changed = info();
        changed.size = 14;
        assert_ne!(
            etag_for(&info(), ETAG_USE_SIZE),
            etag_for(&changed, ETAG_USE_SIZE)
        );
    }

    #[test]
    fn etag_disabled_by_zero_flags() {
        assert_eq!(None, etag_for(&info(), 0));
    }

    #[test]
    fn if_none_match_list_matches() {
        let mut req = HttpHeaders::new();
        req.insert("If-None-Match", "\"aaa\", \"bbb\"");
        assert_eq!(Tri::True, cachable_etag(&req, "\"bbb\""));
        assert_eq!(Tri::False, cachable_etag(&req, "\"ccc\""));
        assert_eq!(Tri::Maybe, cachable_etag(&HttpHeaders::new(), "\"x\""));
    }

    #[test]
    fn if_none_match_star_matches_everything() {
        let mut req = HttpHeaders::new();
        req.insert("If-None-Match", "*");
        assert_eq!(Tri::True, cachable_etag(&req, "\"anything\""));
    }

    #[test]
    fn if_modified_since_exact_match_is_cachable() {
        let lm = format_imf_fixdate(info().mtime);
        let mut req = HttpHeaders::new();
        req.insert("If-Modified-Since", &lm);
        assert_eq!(Tri::True, cachable_modified(&req, &lm));
    }

    #[test]
    fn if_modified_since_older_header_is_not_cachable() {
        let lm = format_imf_fixdate(info().mtime);
        let older = format_imf_fixdate(info().mtime - Duration::from_secs(60));
        let mut req = HttpHeaders::new();
        req.insert("If-Modified-Since", &older);
        assert_eq!(Tri::False, cachable_modified(&req, &lm));
    }

    #[test]
    fn set_headers_reports_304_eligibility() {
        let mut req = HttpHeaders::new();
        let mut resp = HttpHeaders::new();
        let flags = ETAG_USE_INODE | ETAG_USE_SIZE | ETAG_USE_MTIME;
        assert!(!set_headers(&req, &mut resp, &info(), flags));
        let etag = resp.get("ETag").unwrap().to_owned();
        req.insert("If-None-Match", &etag);
        let mut resp2 = HttpHeaders::new();
        assert!(set_headers(&req, &mut resp2, &info(), flags));
        assert!(resp2.get("Last-Modified").is_some());
    }

    #[test]
    fn duplicate_if_modified_since_disables_caching() {
        let lm = format_imf_fixdate(SystemTime::now());
        let mut req = HttpHeaders::new();
        req.insert("If-Modified-Since", &lm);
        req.insert("If-Modified-Since", &lm);
        assert_eq!(Tri::False, cachable_modified(&req, &lm));
    }
}
