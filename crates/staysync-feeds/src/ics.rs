//! Calendar payload parsing: strict `icalendar` parse with a lenient line-based fallback.

use chrono::{Days, NaiveDate};
use icalendar::{Calendar, CalendarComponent, Component};
use serde::Serialize;
use staysync_core::Event;
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

use crate::FeedAdapter;

/// VEVENT properties as they appear in the payload, before normalization.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawEvent {
    pub uid: Option<String>,
    pub dtstart: Option<String>,
    pub dtend: Option<String>,
    pub summary: Option<String>,
    pub description: Option<String>,
    pub status: Option<String>,
}

impl RawEvent {
    fn set(&mut self, name: &str, value: &str) {
        let value = value.trim().to_string();
        match name.to_ascii_uppercase().as_str() {
            "UID" => self.uid = Some(value),
            "DTSTART" => self.dtstart = Some(value),
            "DTEND" => self.dtend = Some(value),
            "SUMMARY" => self.summary = Some(value),
            "DESCRIPTION" => self.description = Some(value),
            "STATUS" => self.status = Some(value),
            _ => {}
        }
    }

    fn is_complete(&self) -> bool {
        self.uid.is_some() && self.dtstart.is_some() && self.dtend.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ParseMode {
    Strict,
    Lenient,
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("payload is not a calendar")]
    NotCalendar,
    #[error("calendar payload could not be parsed: {reason}")]
    Malformed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EventError {
    #[error("event {uid:?} has no usable start date")]
    MissingStart { uid: Option<String> },
    #[error("event {uid:?} ends ({check_out}) before it starts ({check_in})")]
    InvalidRange {
        uid: Option<String>,
        check_in: NaiveDate,
        check_out: NaiveDate,
    },
    #[error("event {uid:?} is cancelled")]
    Cancelled { uid: Option<String> },
}

impl EventError {
    pub fn uid(&self) -> Option<&str> {
        match self {
            EventError::MissingStart { uid }
            | EventError::InvalidRange { uid, .. }
            | EventError::Cancelled { uid } => uid.as_deref(),
        }
    }
}

/// Where a payload came from; stamped onto every event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedContext {
    pub property_id: String,
    pub feed_url: String,
}

#[derive(Debug, Clone)]
pub struct ParsedFeed {
    pub mode: ParseMode,
    /// `BEGIN:VEVENT` markers in the payload.
    pub declared: usize,
    /// Set when the payload lost events or its closing `END:VCALENDAR`.
    pub truncated: bool,
    raw: Vec<RawEvent>,
}

impl ParsedFeed {
    fn new(mode: ParseMode, declared: usize, closed: bool, raw: Vec<RawEvent>) -> Self {
        Self {
            mode,
            declared,
            truncated: !closed || raw.len() < declared,
            raw,
        }
    }

    pub fn len(&self) -> usize {
        self.raw.len()
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    pub fn raw_events(&self) -> &[RawEvent] {
        &self.raw
    }

    /// Lazily normalizes each VEVENT; one bad event never hides the others.
    pub fn events<'a>(
        &'a self,
        ctx: &'a FeedContext,
        adapter: &'a dyn FeedAdapter,
    ) -> impl Iterator<Item = Result<Event, EventError>> + 'a {
        self.raw.iter().map(move |raw| normalize(raw, ctx, adapter))
    }
}

pub fn parse_feed(payload: &[u8]) -> Result<ParsedFeed, ParseError> {
    let text = String::from_utf8_lossy(payload);
    let markers = count_event_markers(&text);
    if markers == 0 && !contains_ignore_case(&text, "BEGIN:VCALENDAR") {
        return Err(ParseError::NotCalendar);
    }

    let closed = contains_ignore_case(&text, "END:VCALENDAR");

    match parse_strict(&text) {
        Ok(raw) if raw.len() >= markers => {
            return Ok(ParsedFeed::new(ParseMode::Strict, markers, closed, raw))
        }
        Ok(raw) => warn!(
            strict_events = raw.len(),
            markers, "strict parse dropped events; retrying leniently"
        ),
        Err(reason) => warn!(%reason, "strict calendar parse failed; retrying leniently"),
    }

    let raw = parse_lenient(&text);
    if raw.is_empty() && markers > 0 {
        return Err(ParseError::Malformed {
            reason: format!("{markers} VEVENT markers but no recoverable events"),
        });
    }
    let parsed = ParsedFeed::new(ParseMode::Lenient, markers, closed, raw);
    if parsed.truncated {
        warn!(
            recovered = parsed.len(),
            declared = markers,
            closed,
            "calendar payload is truncated"
        );
    }
    Ok(parsed)
}

fn parse_strict(text: &str) -> Result<Vec<RawEvent>, String> {
    let calendar: Calendar = text.parse().map_err(|e| format!("{e}"))?;
    let mut out = Vec::new();
    for component in &calendar.components {
        let CalendarComponent::Event(event) = component else {
            continue;
        };
        let mut raw = RawEvent::default();
        for (name, property) in event.properties() {
            raw.set(name, property.value());
        }
        out.push(raw);
    }
    Ok(out)
}

/// Tolerates bare LF, lowercase names, junk lines and a missing END:VEVENT/END:VCALENDAR.
pub fn parse_lenient(text: &str) -> Vec<RawEvent> {
    let mut events = Vec::new();
    let mut current: Option<RawEvent> = None;

    for line in unfold_lines(text) {
        let Some((name, value)) = split_content_line(&line) else {
            continue;
        };
        let name = name.to_ascii_uppercase();
        let value_upper = value.trim().to_ascii_uppercase();
        match name.as_str() {
            "BEGIN" if value_upper == "VEVENT" => {
                if let Some(prev) = current.take() {
                    if prev.is_complete() {
                        events.push(prev);
                    }
                }
                current = Some(RawEvent::default());
            }
            "END" if value_upper == "VEVENT" => {
                if let Some(done) = current.take() {
                    events.push(done);
                }
            }
            _ => {
                if let Some(event) = current.as_mut() {
                    event.set(&name, value);
                }
            }
        }
    }

    // Truncated tail: only keep it if nothing essential was cut off.
    if let Some(tail) = current {
        if tail.is_complete() {
            events.push(tail);
        }
    }
    events
}

fn unfold_lines(text: &str) -> Vec<String> {
    let mut lines: Vec<String> = Vec::new();
    for line in text.split('\n') {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if let Some(rest) = line.strip_prefix([' ', '\t']) {
            if let Some(last) = lines.last_mut() {
                last.push_str(rest);
                continue;
            }
        }
        lines.push(line.to_string());
    }
    lines
}

/// Splits `NAME;PARAM="a:b":value` into (NAME, value), skipping colons inside quoted params.
fn split_content_line(line: &str) -> Option<(&str, &str)> {
    let mut in_quotes = false;
    for (idx, ch) in line.char_indices() {
        match ch {
            '"' => in_quotes = !in_quotes,
            ':' if !in_quotes => {
                let head = &line[..idx];
                let name = head.split(';').next().unwrap_or(head).trim();
                if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
                    return None;
                }
                return Some((name, &line[idx + 1..]));
            }
            _ => {}
        }
    }
    None
}

fn count_event_markers(text: &str) -> usize {
    text.lines()
        .filter(|l| l.trim().eq_ignore_ascii_case("BEGIN:VEVENT"))
        .count()
}

fn contains_ignore_case(haystack: &str, needle: &str) -> bool {
    haystack
        .to_ascii_uppercase()
        .contains(&needle.to_ascii_uppercase())
}

pub fn unescape_text(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('n') | Some('N') => out.push('\n'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

/// Returns the calendar date and whether the value was date-only.
pub fn parse_calendar_date(value: &str) -> Option<(NaiveDate, bool)> {
    let compact: String = value.trim().chars().filter(|c| *c != '-').collect();
    let date_part = compact.get(..8)?;
    let date = NaiveDate::parse_from_str(date_part, "%Y%m%d").ok()?;
    Some((date, compact.len() == 8))
}

fn normalize(
    raw: &RawEvent,
    ctx: &FeedContext,
    adapter: &dyn FeedAdapter,
) -> Result<Event, EventError> {
    let uid = raw
        .uid
        .as_deref()
        .map(str::trim)
        .filter(|u| !u.is_empty())
        .map(ToString::to_string);

    if raw
        .status
        .as_deref()
        .is_some_and(|s| s.trim().eq_ignore_ascii_case("CANCELLED"))
    {
        return Err(EventError::Cancelled { uid });
    }

    let Some((check_in, _)) = raw.dtstart.as_deref().and_then(parse_calendar_date) else {
        return Err(EventError::MissingStart { uid });
    };
    let check_out = match raw.dtend.as_deref().and_then(parse_calendar_date) {
        Some((date, _)) => date,
        None => check_in
            .checked_add_days(Days::new(1))
            .ok_or_else(|| EventError::MissingStart { uid: uid.clone() })?,
    };
    if check_out < check_in {
        return Err(EventError::InvalidRange {
            uid,
            check_in,
            check_out,
        });
    }

    let summary = unescape_text(raw.summary.as_deref().unwrap_or_default());
    let description = unescape_text(raw.description.as_deref().unwrap_or_default());

    let (source_uid, uid_synthesized) = match uid {
        Some(uid) => (uid, false),
        None => (
            synthesize_uid(&ctx.property_id, check_in, check_out, &summary),
            true,
        ),
    };

    Ok(Event {
        source_uid,
        uid_synthesized,
        property_id: ctx.property_id.clone(),
        feed_url: ctx.feed_url.clone(),
        check_in,
        check_out,
        entry_type: adapter.classify(&summary, &description),
        guest: adapter.guest_name(&summary, &description),
        summary,
        description,
    })
}

/// Deterministic across runs so an id-less event does not churn.
pub fn synthesize_uid(
    property_id: &str,
    check_in: NaiveDate,
    check_out: NaiveDate,
    summary: &str,
) -> String {
    let seed = format!("{property_id}|{check_in}|{check_out}|{}", summary.trim());
    format!(
        "staysync-{}",
        Uuid::new_v5(&Uuid::NAMESPACE_URL, seed.as_bytes())
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{adapter_for_platform, Platform};
    use staysync_core::EntryType;

    fn fixture(name: &str) -> Vec<u8> {
        let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../../fixtures/feeds")
            .join(name);
        std::fs::read(&path).unwrap_or_else(|e| panic!("reading {}: {e}", path.display()))
    }

    fn ctx() -> FeedContext {
        FeedContext {
            property_id: "P1".into(),
            feed_url: "https://www.airbnb.com/calendar/ical/1.ics?s=abc".into(),
        }
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn airbnb_feed_parses_strictly() {
        let parsed = parse_feed(&fixture("airbnb_basic.ics")).expect("parse");
        assert_eq!(parsed.mode, ParseMode::Strict);
        assert_eq!(parsed.len(), 2);
        assert!(!parsed.truncated);

        let ctx = ctx();
        let adapter = adapter_for_platform(Platform::Airbnb);
        let events: Vec<_> = parsed
            .events(&ctx, adapter.as_ref())
            .collect::<Result<_, _>>()
            .expect("events");

        assert_eq!(events[0].source_uid, "1418fb94e984-a1b2c3@airbnb.com");
        assert_eq!(events[0].check_in, date(2025, 7, 1));
        assert_eq!(events[0].check_out, date(2025, 7, 5));
        assert_eq!(events[0].entry_type.value, EntryType::Stay);
        assert!(!events[0].entry_type.is_ambiguous());
        assert_eq!(events[1].entry_type.value, EntryType::Block);
        assert_eq!(events[1].property_id, "P1");
    }

    #[test]
    fn truncated_feed_falls_back_to_lenient_parser() {
        let parsed = parse_feed(&fixture("vrbo_truncated.ics")).expect("parse");
        assert_eq!(parsed.mode, ParseMode::Lenient);
        assert!(parsed.truncated);
        assert_eq!(parsed.declared, 3);
        // The third VEVENT is cut off before DTEND and must not be guessed at.
        assert_eq!(parsed.len(), 2);
        assert_eq!(
            parsed.raw_events()[1].summary.as_deref(),
            Some("Reserved - Maria Garcia")
        );
    }

    #[test]
    fn missing_calendar_end_marks_feed_truncated() {
        let payload = b"BEGIN:VCALENDAR\nBEGIN:VEVENT\nUID:a\nDTSTART;VALUE=DATE:20250701\nDTEND;VALUE=DATE:20250705\nEND:VEVENT\n";
        let parsed = parse_feed(payload).expect("parse");
        assert_eq!(parsed.len(), 1);
        assert!(parsed.truncated);
    }

    #[test]
    fn folded_lines_and_quoted_params_are_handled() {
        let payload = b"BEGIN:VCALENDAR\nBEGIN:VEVENT\nUID:abc\nDTSTART;TZID=\"Europe/Paris:x\":20250701T160000\nDTEND;VALUE=DATE:20250705\nSUMMARY:Reserved - Jean\n  Dupont\nEND:VEVENT\n";
        let raw = parse_lenient(std::str::from_utf8(payload).unwrap());
        assert_eq!(raw.len(), 1);
        assert_eq!(raw[0].dtstart.as_deref(), Some("20250701T160000"));
        assert_eq!(raw[0].summary.as_deref(), Some("Reserved - Jean Dupont"));
    }

    #[test]
    fn non_calendar_payload_is_rejected() {
        let err = parse_feed(b"<html><body>Login required</body></html>").expect_err("html");
        assert!(matches!(err, ParseError::NotCalendar));
    }

    #[test]
    fn unrecoverable_events_are_malformed() {
        let err = parse_feed(b"BEGIN:VCALENDAR\nBEGIN:VEVENT\nthis is not content\n").expect_err("bad");
        assert!(matches!(err, ParseError::Malformed { .. }));
    }

    #[test]
    fn empty_calendar_is_a_valid_empty_feed() {
        let parsed =
            parse_feed(b"BEGIN:VCALENDAR\r\nVERSION:2.0\r\nPRODID:-//x//y//EN\r\nEND:VCALENDAR\r\n")
                .expect("empty");
        assert!(parsed.is_empty());
        assert!(!parsed.truncated);
    }

    #[test]
    fn per_event_errors_do_not_hide_other_events() {
        let text = "BEGIN:VCALENDAR\nBEGIN:VEVENT\nUID:a\nDTEND:20250705\nEND:VEVENT\nBEGIN:VEVENT\nUID:b\nDTSTART:20250710\nDTEND:20250708\nEND:VEVENT\nBEGIN:VEVENT\nUID:c\nDTSTART:20250720\nDTEND:20250722\nSTATUS:CANCELLED\nEND:VEVENT\nBEGIN:VEVENT\nUID:d\nDTSTART;VALUE=DATE:20250801\nSUMMARY:Reserved\nEND:VEVENT\nEND:VCALENDAR\n";
        let raw = parse_lenient(text);
        let parsed = ParsedFeed::new(ParseMode::Lenient, raw.len(), true, raw);
        let ctx = ctx();
        let adapter = adapter_for_platform(Platform::Generic);
        let results: Vec<_> = parsed.events(&ctx, adapter.as_ref()).collect();
        assert_eq!(results.len(), 4);
        assert!(matches!(results[0], Err(EventError::MissingStart { .. })));
        assert!(matches!(results[1], Err(EventError::InvalidRange { .. })));
        assert!(matches!(results[2], Err(EventError::Cancelled { .. })));
        let last = results[3].as_ref().expect("one-night event");
        assert_eq!(last.check_out, date(2025, 8, 2));
    }

    #[test]
    fn missing_uid_is_synthesized_deterministically() {
        let text = "BEGIN:VEVENT\nDTSTART:20250701\nDTEND:20250705\nSUMMARY:Blocked\nEND:VEVENT\n";
        let raw = parse_lenient(text);
        let parsed = ParsedFeed::new(ParseMode::Lenient, raw.len(), true, raw);
        let ctx = ctx();
        let adapter = adapter_for_platform(Platform::Generic);
        let first = parsed.events(&ctx, adapter.as_ref()).next().unwrap().unwrap();
        let second = parsed.events(&ctx, adapter.as_ref()).next().unwrap().unwrap();
        assert!(first.uid_synthesized);
        assert!(first.needs_review());
        assert_eq!(first.source_uid, second.source_uid);
        assert!(first.source_uid.starts_with("staysync-"));
    }

    #[test]
    fn dates_reduce_to_calendar_day() {
        assert_eq!(parse_calendar_date("20250701"), Some((date(2025, 7, 1), true)));
        assert_eq!(
            parse_calendar_date("20250701T150000Z"),
            Some((date(2025, 7, 1), false))
        );
        assert_eq!(parse_calendar_date("2025-07-01"), Some((date(2025, 7, 1), true)));
        assert_eq!(parse_calendar_date("garbage"), None);
    }

    #[test]
    fn text_values_are_unescaped() {
        assert_eq!(unescape_text(r"a\, b\; c\nd\\e"), "a, b; c\nd\\e");
    }
}
