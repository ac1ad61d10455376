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

//! IMF-fixdate handling per RFC 7231 Section 7.1.1.1
//! (`Sun, 06 Nov 1994 08:49:37 GMT`).

use std::time::{Duration, SystemTime, UNIX_EPOCH};

const DAYS: [&str; 7] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];
const MONTHS: [&str; 12] = [
    "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
];

// civil-date conversions on the proleptic Gregorian calendar
fn days_from_civil(y: i64, m: u32, d: u32) -> i64 {
    let y = if m <= 2 { y - 1 } else { y };
    let era = if y >= 0 { y } else { y - 399 } / 400;
    let yoe = (y - era * 400) as i64;
    let mp = if m > 2 { m - 3 } else { m + 9 } as i64;
    let doy = (153 * mp + 2) / 5 + d as i64 - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146097 + doe - 719468
}

fn civil_from_days(z: i64) -> (i64, u32, u32) {
    let z = z + 719468;
    let era = if z >= 0 { z } else { z - 146096 } / 146097;
    let doe = z - era * 146097;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146096) / 365;
    let y = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let m = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
    (if m <= 2 { y + 1 } else { y }, m, d)
}

/// Formats `t` as an IMF-fixdate. Times before the epoch clamp to it.
pub fn format_imf_fixdate(t: SystemTime) -> String {
    let secs = t
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs() as i64;
    let days = secs.div_euclid(86400);
    let tod = secs.rem_euclid(86400);
    let (y, m, d) = civil_from_days(days);
    let weekday = ((days % 7) + 11) % 7; // day 0 (1970-01-01) was a Thursday
    format!(
        "{}, {:02} {} {} {:02}:{:02}:{:02} GMT",
        DAYS[weekday as usize],
        d,
        MONTHS[(m - 1) as usize],
        y,
        tod / 3600,
        (tod / 60) % 60,
        tod % 60
    )
}

fn parse_u32(s: &str) -> Option<u32> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

/// Parses an IMF-fixdate; anything not in that exact shape yields `None`.
pub fn parse_imf_fixdate(s: &str) -> Option<SystemTime> {
    // "Sun, 06 Nov 1994 08:49:37 GMT"
    let s = s.trim();
    if s.len() != 29 || !s.ends_with(" GMT") || s.as_bytes()[3] != b',' {
        return None;
    }
    if !DAYS.contains(&&s[..3]) {
        return None;
    }
    let day = parse_u32(&s[5..7])?;
    let month = MONTHS.iter().position(|m| *m == &s[8..11])? as u32 + 1;
    let year = parse_u32(&s[12..16])? as i64;
    let (h, min, sec) = (
        parse_u32(&s[17..19])?,
        parse_u32(&s[20..22])?,
        parse_u32(&s[23..25])?,
    );
    if s.as_bytes()[16] != b' '
        || s.as_bytes()[19] != b':'
        || s.as_bytes()[22] != b':'
        || s.as_bytes()[25] != b' '
    {
        return None;
    }
    if day == 0 || day > 31 || h > 23 || min > 59 || sec > 60 {
        return None;
    }
    let days = days_from_civil(year, month, day);
    let secs = days * 86400 + (h * 3600 + min * 60 + sec) as i64;
    if secs < 0 {
        return None;
    }
    Some(UNIX_EPOCH + Duration::from_secs(secs as u64))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn date_formats_known_timestamp() {
        // RFC 7231's own example
        let t = UNIX_EPOCH + Duration::from_secs(784111777);
        assert_eq!("Sun, 06 Nov 1994 08:49:37 GMT", format_imf_fixdate(t));
    }

    #[test]
    fn date_parse_inverts_format() {
        for secs in [0u64, 784111777, 1_000_000_000, 1_700_000_000] {
            let t = UNIX_EPOCH + Duration::from_secs(secs);
            assert_eq!(Some(t), parse_imf_fixdate(&format_imf_fixdate(t)));
        }
    }

    #[test]
    fn date_parse_rejects_other_shapes() {
        assert_eq!(None, parse_imf_fixdate("Sunday, 06-Nov-94 08:49:37 GMT"));
        assert_eq!(None, parse_imf_fixdate("Sun Nov  6 08:49:37 1994"));
        assert_eq!(None, parse_imf_fixdate(""));
        assert_eq!(None, parse_imf_fixdate("Sun, 06 Nov 1994 08:49:37 UTC"));
    }

    #[test]
    fn date_epoch_is_a_thursday() {
        assert!(format_imf_fixdate(UNIX_EPOCH).starts_with("Thu, 01 Jan 1970"));
    }
}
