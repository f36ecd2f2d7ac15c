// # HTTP Dates
//
// Three wire formats are accepted:
//
//   RFC 850:       Sunday, 06-Nov-94 08:49:37 GMT
//   RFC 822/1123:  Sun, 06 Nov 1994 08:49:37 GMT
//   ANSI C:        Sun Nov  6 08:49:37 1994
//
// Emission always uses RFC 1123 in GMT.

use crate::error::{IoError, Result};
use chrono::{DateTime, Duration, NaiveDate, Utc};

const SHORT_MONTHS: [&str; 12] = [
    "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
];

/// Recognized zone abbreviations and their offsets from UT, hours.
const TIME_ZONES: [(&str, i32); 10] = [
    ("UT", 0),
    ("GMT", 0),
    ("EST", -5),
    ("EDT", -4),
    ("CST", -6),
    ("CDT", -5),
    ("MST", -7),
    ("MDT", -6),
    ("PST", -8),
    ("PDT", -7),
];

fn bad_date(text: &str) -> IoError {
    IoError::InvalidHttpHeader(format!("unparsable date '{}'", text))
}

fn month_number(token: &str) -> Option<u32> {
    SHORT_MONTHS
        .iter()
        .position(|m| token.len() >= 3 && m.eq_ignore_ascii_case(&token[..3]))
        .map(|i| i as u32 + 1)
}

fn zone_offset_hours(token: &str) -> i32 {
    TIME_ZONES
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(token))
        .map(|(_, hours)| *hours)
        .unwrap_or(0)
}

/// Two-digit years pivot at 50: 94 is 1994, 07 is 2007.
fn expand_two_digit_year(year: i32) -> i32 {
    if year >= 50 {
        1900 + year
    } else {
        2000 + year
    }
}

fn parse_clock(token: &str) -> Option<(u32, u32, u32)> {
    let mut parts = token.split(':');
    let h = parts.next()?.parse().ok()?;
    let m = parts.next()?.parse().ok()?;
    let s = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some((h, m, s))
}

fn assemble(
    year: i32,
    month: u32,
    day: u32,
    clock: (u32, u32, u32),
    zone_hours: i32,
) -> Option<DateTime<Utc>> {
    let (h, m, s) = clock;
    let naive = NaiveDate::from_ymd_opt(year, month, day)?.and_hms_opt(h, m, s)?;
    // The wall clock was read in the named zone; shift back to UT.
    let utc = naive - Duration::hours(zone_hours as i64);
    Some(DateTime::from_naive_utc_and_offset(utc, Utc))
}

/// Parse any of the three accepted date formats.
pub fn parse_http_date(text: &str) -> Result<DateTime<Utc>> {
    let text = text.trim();

    if let Some((_weekday, rest)) = text.split_once(',') {
        let fields: Vec<&str> = rest.split_whitespace().collect();

        // RFC 850: 06-Nov-94 08:49:37 GMT
        if fields.len() >= 2 && fields[0].contains('-') {
            let mut date_parts = fields[0].split('-');
            let day: u32 = date_parts
                .next()
                .and_then(|t| t.parse().ok())
                .ok_or_else(|| bad_date(text))?;
            let month = date_parts
                .next()
                .and_then(month_number)
                .ok_or_else(|| bad_date(text))?;
            let year: i32 = date_parts
                .next()
                .and_then(|t| t.parse().ok())
                .ok_or_else(|| bad_date(text))?;
            let year = if year < 100 {
                expand_two_digit_year(year)
            } else {
                year
            };
            let clock = parse_clock(fields[1]).ok_or_else(|| bad_date(text))?;
            let zone = fields.get(2).map(|t| zone_offset_hours(t)).unwrap_or(0);
            return assemble(year, month, day, clock, zone).ok_or_else(|| bad_date(text));
        }

        // RFC 822/1123: 06 Nov 1994 08:49:37 GMT
        if fields.len() >= 4 {
            let day: u32 = fields[0].parse().map_err(|_| bad_date(text))?;
            let month = month_number(fields[1]).ok_or_else(|| bad_date(text))?;
            let year: i32 = fields[2].parse().map_err(|_| bad_date(text))?;
            let year = if year < 100 {
                expand_two_digit_year(year)
            } else {
                year
            };
            let clock = parse_clock(fields[3]).ok_or_else(|| bad_date(text))?;
            let zone = fields.get(4).map(|t| zone_offset_hours(t)).unwrap_or(0);
            return assemble(year, month, day, clock, zone).ok_or_else(|| bad_date(text));
        }

        return Err(bad_date(text));
    }

    // ANSI C asctime: Sun Nov  6 08:49:37 1994
    let fields: Vec<&str> = text.split_whitespace().collect();
    if fields.len() == 5 {
        let month = month_number(fields[1]).ok_or_else(|| bad_date(text))?;
        let day: u32 = fields[2].parse().map_err(|_| bad_date(text))?;
        let clock = parse_clock(fields[3]).ok_or_else(|| bad_date(text))?;
        let year: i32 = fields[4].parse().map_err(|_| bad_date(text))?;
        return assemble(year, month, day, clock, 0).ok_or_else(|| bad_date(text));
    }

    Err(bad_date(text))
}

/// Format per RFC 1123, always GMT.
pub fn format_http_date(when: &DateTime<Utc>) -> String {
    when.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    #[test]
    fn test_all_three_formats_agree() {
        let rfc850 = parse_http_date("Sunday, 06-Nov-94 08:49:37 GMT").unwrap();
        let rfc1123 = parse_http_date("Sun, 06 Nov 1994 08:49:37 GMT").unwrap();
        let asctime = parse_http_date("Sun Nov 6 08:49:37 1994").unwrap();
        assert_eq!(rfc850, rfc1123);
        assert_eq!(rfc1123, asctime);
    }

    #[test]
    fn test_two_digit_year_pivot() {
        let old = parse_http_date("Sunday, 06-Nov-94 08:49:37 GMT").unwrap();
        assert_eq!(format_http_date(&old), "Sun, 06 Nov 1994 08:49:37 GMT");

        let recent = parse_http_date("Sunday, 06-Nov-07 08:49:37 GMT").unwrap();
        assert!(format_http_date(&recent).contains("2007"));

        let edge = parse_http_date("Monday, 01-Jan-50 00:00:00 GMT").unwrap();
        assert!(format_http_date(&edge).contains("1950"));

        let edge = parse_http_date("Monday, 01-Jan-49 00:00:00 GMT").unwrap();
        assert!(format_http_date(&edge).contains("2049"));
    }

    #[test]
    fn test_zone_offsets_normalize_to_gmt() {
        let est = parse_http_date("Sun, 06 Nov 1994 08:49:37 EST").unwrap();
        assert_eq!(est.hour(), 13);

        let pdt = parse_http_date("Sun, 06 Nov 1994 08:49:37 PDT").unwrap();
        assert_eq!(pdt.hour(), 15);
    }

    #[test]
    fn test_round_trip_emission() {
        let text = "Thu, 01 Jan 2026 12:30:45 GMT";
        let parsed = parse_http_date(text).unwrap();
        assert_eq!(format_http_date(&parsed), text);
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(parse_http_date("").is_err());
        assert!(parse_http_date("next Tuesday").is_err());
        assert!(parse_http_date("Sun, 99 Nov 1994 08:49:37 GMT").is_err());
        assert!(parse_http_date("Sun, 06 Nov 1994 08:49 GMT").is_err());
    }
}
