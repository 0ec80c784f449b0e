/*
 * Copyright (C) 2024 Fastly, Inc.
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::time::{SystemTime, UNIX_EPOCH};
use time::format_description::FormatItem;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime, UtcOffset};

// IMF-fixdate, e.g. "Sun, 06 Nov 1994 08:49:37 GMT"
const HTTP_DATE: &[FormatItem<'static>] = format_description!(
    "[weekday repr:short], [day] [month repr:short] [year] [hour]:[minute]:[second] GMT"
);

pub fn format_http_date(t: SystemTime) -> String {
    let t = OffsetDateTime::from(t).to_offset(UtcOffset::UTC);

    // the format has no components that can fail for in-range dates
    t.format(HTTP_DATE).unwrap_or_default()
}

pub fn now_http_date() -> String {
    format_http_date(SystemTime::now())
}

/// Parses an IMF-fixdate. Returns seconds since the epoch.
pub fn parse_http_date(s: &str) -> Option<i64> {
    match PrimitiveDateTime::parse(s.trim(), HTTP_DATE) {
        Ok(t) => Some(t.assume_utc().unix_timestamp()),
        Err(_) => None,
    }
}

pub fn unix_secs(t: SystemTime) -> i64 {
    match t.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs() as i64,
        Err(e) => -(e.duration().as_secs() as i64),
    }
}

pub fn unix_millis(t: SystemTime) -> u128 {
    match t.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_millis(),
        Err(_) => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn http_date() {
        let t = UNIX_EPOCH + Duration::from_secs(784111777);

        let s = format_http_date(t);
        assert_eq!(s, "Sun, 06 Nov 1994 08:49:37 GMT");
        assert_eq!(parse_http_date(&s), Some(784111777));

        assert_eq!(parse_http_date("yesterday"), None);
        assert_eq!(parse_http_date("1700000000000"), None);
    }

    #[test]
    fn epoch_conversions() {
        let t = UNIX_EPOCH + Duration::from_millis(1_500);

        assert_eq!(unix_secs(t), 1);
        assert_eq!(unix_millis(t), 1_500);
    }
}
