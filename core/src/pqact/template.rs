//! Action-template expansion.
//!
//! Each matched rule's template is rewritten against the product before the
//! action runs, in this order:
//!
//! 1. `\0`..`\9` and `\(n)` — capture groups of the rule's pattern match.
//! 2. `strftime`-style `%` conversions on the arrival time, in UTC.
//! 3. `(DD:comp)` — date components of the arrival time where `DD` is a
//!    day-of-month hint: of the candidate months {previous, this, next},
//!    the one whose day-`DD` timestamp is at most 1.5 days in the future
//!    and closest to the arrival time wins. Disambiguates products whose
//!    headers carry a day of month near a month rollover.
//! 4. `(seq)` — the product's sequence number.
//!
//! The result is tokenized with double-quote-aware splitting.

use chrono::{DateTime, Datelike, Duration as ChronoDuration, NaiveDate, TimeZone, Timelike, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use thiserror::Error;

use crate::product::Timestamp;

#[derive(Error, Debug)]
pub enum TemplateError {
    #[error("capture group {0} not present")]
    NoSuchCapture(usize),

    #[error("no date candidate for day {0} fits the rollover window")]
    NoDateCandidate(u32),
}

lazy_static! {
    static ref DD_SPEC: Regex =
        Regex::new(r"\((\d{1,2}):(yyyy|yy|mmm|mm|ddd|dd|hh)\)").unwrap();
    static ref SEQ_SPEC: Regex = Regex::new(r"\(seq\)").unwrap();
    static ref GROUP_SPEC: Regex = Regex::new(r"\\(?:([0-9])|\(([0-9]+)\))").unwrap();
}

/// Expands `template` for one product match.
pub fn expand(
    template: &str,
    captures: &regex::Captures<'_>,
    arrival: Timestamp,
    seqno: u32,
    now: Timestamp,
) -> Result<String, TemplateError> {
    let expanded = expand_captures(template, captures)?;
    let expanded = expand_strftime(&expanded, arrival.to_utc());
    let expanded = expand_day_hint(&expanded, arrival, now)?;
    Ok(SEQ_SPEC
        .replace_all(&expanded, seqno.to_string().as_str())
        .into_owned())
}

fn expand_captures(
    template: &str,
    captures: &regex::Captures<'_>,
) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(template.len());
    let mut last = 0;
    for found in GROUP_SPEC.captures_iter(template) {
        let whole = found.get(0).unwrap();
        out.push_str(&template[last..whole.start()]);
        let digits = found
            .get(1)
            .or_else(|| found.get(2))
            .map(|m| m.as_str())
            .unwrap_or("0");
        let group: usize = digits.parse().unwrap_or(0);
        let text = captures
            .get(group)
            .ok_or(TemplateError::NoSuchCapture(group))?;
        out.push_str(text.as_str());
        last = whole.end();
    }
    out.push_str(&template[last..]);
    Ok(out)
}

/// The supported strftime subset; unknown `%` sequences pass through.
fn expand_strftime(template: &str, at: DateTime<Utc>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.peek().copied() {
            Some('Y') => out.push_str(&format!("{:04}", at.year())),
            Some('y') => out.push_str(&format!("{:02}", at.year() % 100)),
            Some('m') => out.push_str(&format!("{:02}", at.month())),
            Some('d') => out.push_str(&format!("{:02}", at.day())),
            Some('j') => out.push_str(&format!("{:03}", at.ordinal())),
            Some('H') => out.push_str(&format!("{:02}", at.hour())),
            Some('M') => out.push_str(&format!("{:02}", at.minute())),
            Some('S') => out.push_str(&format!("{:02}", at.second())),
            Some('s') => out.push_str(&at.timestamp().to_string()),
            Some('%') => out.push('%'),
            other => {
                out.push('%');
                if let Some(c) = other {
                    out.push(c);
                }
            }
        }
        chars.next();
    }
    out
}

fn expand_day_hint(
    template: &str,
    arrival: Timestamp,
    now: Timestamp,
) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(template.len());
    let mut last = 0;
    for found in DD_SPEC.captures_iter(template) {
        let whole = found.get(0).unwrap();
        out.push_str(&template[last..whole.start()]);
        let day: u32 = found[1].parse().unwrap_or(0);
        let component = &found[2];
        let date = resolve_day(day, arrival, now)?;
        match component {
            "yyyy" => out.push_str(&format!("{:04}", date.year())),
            "yy" => out.push_str(&format!("{:02}", date.year() % 100)),
            "mmm" => out.push_str(&format!("{}", date.format("%b").to_string().to_lowercase())),
            "mm" => out.push_str(&format!("{:02}", date.month())),
            "dd" => out.push_str(&format!("{:02}", date.day())),
            "ddd" => out.push_str(&format!("{:03}", date.ordinal())),
            "hh" => out.push_str(&format!("{:02}", arrival.to_utc().hour())),
            _ => unreachable!("constrained by the pattern"),
        }
        last = whole.end();
    }
    out.push_str(&template[last..]);
    Ok(out)
}

/// Picks the calendar date for a day-of-month hint: among the previous,
/// current, and next month of the arrival time, the candidate dated at most
/// 1.5 days past `now` and nearest the arrival time.
fn resolve_day(day: u32, arrival: Timestamp, now: Timestamp) -> Result<NaiveDate, TemplateError> {
    let at = arrival.to_utc();
    let horizon = now.to_utc() + ChronoDuration::hours(36);
    let mut best: Option<(i64, NaiveDate)> = None;
    for months in [-1i32, 0, 1] {
        let mut year = at.year();
        let mut month = at.month() as i32 + months;
        if month < 1 {
            month += 12;
            year -= 1;
        } else if month > 12 {
            month -= 12;
            year += 1;
        }
        let candidate = match NaiveDate::from_ymd_opt(year, month as u32, day) {
            Some(date) => date,
            // No such day in that month (e.g. Feb 30).
            None => continue,
        };
        let midnight = Utc
            .from_utc_datetime(&candidate.and_hms_opt(0, 0, 0).unwrap());
        if midnight > horizon {
            continue;
        }
        let distance = (midnight - at).num_seconds().abs();
        if best.map(|(d, _)| distance < d).unwrap_or(true) {
            best = Some((distance, candidate));
        }
    }
    best.map(|(_, date)| date)
        .ok_or(TemplateError::NoDateCandidate(day))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::class::Pattern;

    fn caps<'t>(pattern: &str, text: &'t str) -> regex::Captures<'t> {
        // Tests lean on Pattern to mirror the engine's compile path.
        let p = Pattern::compile(pattern).unwrap();
        let caps = p.captures(text);
        caps.unwrap()
    }

    #[test]
    fn template_capture_groups() {
        let c = caps("^ABCD([0-9]{2}) ([A-Z]{4})", "ABCD12 KWBC 012330");
        let out = expand("\\1/\\2/\\0", &c, Timestamp::new(0, 0), 0, Timestamp::new(0, 0))
            .unwrap();
        assert_eq!(out, "12/KWBC/ABCD12 KWBC");
    }

    #[test]
    fn template_paren_group_form() {
        let c = caps("^(A)(B)(C)(D)(E)(F)(G)(H)(I)(J)(K)", "ABCDEFGHIJK");
        let out = expand("\\(11)", &c, Timestamp::new(0, 0), 0, Timestamp::new(0, 0)).unwrap();
        assert_eq!(out, "K");
    }

    #[test]
    fn template_missing_capture_is_error() {
        let c = caps("^foo", "foobar");
        assert!(matches!(
            expand("\\3", &c, Timestamp::new(0, 0), 0, Timestamp::new(0, 0)),
            Err(TemplateError::NoSuchCapture(3))
        ));
    }

    #[test]
    fn template_strftime_utc() {
        let c = caps(".*", "x");
        // 2024-03-31T23:30:00Z
        let arrival = Timestamp::new(1_711_927_800, 0);
        let out = expand("%Y%m%d_%H%M.%S", &c, arrival, 0, arrival).unwrap();
        assert_eq!(out, "20240331_2330.00");
    }

    #[test]
    fn template_strftime_unknown_passthrough() {
        let c = caps(".*", "x");
        let out = expand("100%% %q", &c, Timestamp::new(0, 0), 0, Timestamp::new(0, 0)).unwrap();
        assert_eq!(out, "100% %q");
    }

    #[test]
    fn template_day_hint_rolls_forward() {
        let c = caps("^ABCD([0-9]{2})", "ABCD12 KWBC 012330");
        // Arrival 2024-03-31T23:30Z; DD=01 resolves to April 1st.
        let arrival = Timestamp::new(1_711_927_800, 0);
        let out = expand(
            "/var/data/(01:yyyy)/(01:mm)/\\1_(seq).txt",
            &c,
            arrival,
            42,
            arrival,
        )
        .unwrap();
        assert_eq!(out, "/var/data/2024/04/12_42.txt");
    }

    #[test]
    fn template_day_hint_rolls_backward() {
        let c = caps(".*", "x");
        // Arrival 2024-03-01T00:30Z; DD=29 resolves to February 29th
        // (2024 is a leap year) rather than March 29th, which would sit
        // four weeks in the future.
        let arrival = Timestamp::new(1_709_252_700, 0); // 2024-03-01T00:25Z
        let out = expand("(29:yyyy)-(29:mm)-(29:dd)", &c, arrival, 0, arrival).unwrap();
        assert_eq!(out, "2024-02-29");
    }

    #[test]
    fn template_day_hint_same_month() {
        let c = caps(".*", "x");
        // Arrival mid-month; DD=15 stays in the same month.
        let arrival = Timestamp::new(1_710_500_000, 0); // 2024-03-15T...
        let out = expand("(15:mm)/(15:ddd)", &c, arrival, 0, arrival).unwrap();
        assert_eq!(out, "03/075");
    }

    #[test]
    fn template_seq() {
        let c = caps(".*", "x");
        let out = expand("n(seq).bin", &c, Timestamp::new(0, 0), 977, Timestamp::new(0, 0))
            .unwrap();
        assert_eq!(out, "n977.bin");
    }
}
