//! Core domain model for staysync: properties, feeds, parsed events and persisted reservation records.

use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "staysync-core";

/// Guest stay or owner/maintenance block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryType {
    Stay,
    Block,
}

impl EntryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryType::Stay => "stay",
            EntryType::Block => "block",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "stay" => Some(EntryType::Stay),
            "block" => Some(EntryType::Block),
            _ => None,
        }
    }
}

impl fmt::Display for EntryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    Confident,
    Ambiguous,
}

/// Heuristic classification result: best guess, how sure we are, and what decided it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inferred<T> {
    pub value: T,
    pub confidence: Confidence,
    pub matched: Option<String>,
}

impl<T> Inferred<T> {
    pub fn confident(value: T, matched: impl Into<String>) -> Self {
        Self {
            value,
            confidence: Confidence::Confident,
            matched: Some(matched.into()),
        }
    }

    pub fn ambiguous(value: T, matched: Option<String>) -> Self {
        Self {
            value,
            confidence: Confidence::Ambiguous,
            matched,
        }
    }

    pub fn is_ambiguous(&self) -> bool {
        self.confidence == Confidence::Ambiguous
    }
}

/// Feed endpoint as listed by the property directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Feed {
    pub url: String,
    #[serde(default)]
    pub platform: Option<String>,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default)]
    pub last_synced_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub consecutive_errors: u32,
}

fn default_active() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Property {
    pub property_id: String,
    #[serde(default)]
    pub feeds: Vec<Feed>,
}

/// Durable key of a logical booking across runs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CompositeIdentity {
    pub source_uid: String,
    pub property_id: String,
}

impl CompositeIdentity {
    pub fn new(source_uid: impl Into<String>, property_id: impl Into<String>) -> Self {
        Self {
            source_uid: source_uid.into(),
            property_id: property_id.into(),
        }
    }
}

impl fmt::Display for CompositeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.source_uid, self.property_id)
    }
}

/// (property, check-in, check-out, entry type) signature used for secondary matching.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BookingTuple {
    pub property_id: String,
    pub check_in: NaiveDate,
    pub check_out: NaiveDate,
    pub entry_type: EntryType,
}

impl fmt::Display for BookingTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}..{} {}",
            self.property_id, self.check_in, self.check_out, self.entry_type
        )
    }
}

/// Normalized calendar event. Never persisted directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub source_uid: String,
    pub uid_synthesized: bool,
    pub property_id: String,
    pub feed_url: String,
    pub check_in: NaiveDate,
    pub check_out: NaiveDate,
    pub summary: String,
    pub description: String,
    pub entry_type: Inferred<EntryType>,
    pub guest: Option<String>,
}

impl Event {
    pub fn identity(&self) -> CompositeIdentity {
        CompositeIdentity::new(self.source_uid.clone(), self.property_id.clone())
    }

    pub fn tuple(&self) -> BookingTuple {
        BookingTuple {
            property_id: self.property_id.clone(),
            check_in: self.check_in,
            check_out: self.check_out,
            entry_type: self.entry_type.value,
        }
    }

    /// Low-confidence parses are persisted but surfaced for manual review.
    pub fn needs_review(&self) -> bool {
        self.entry_type.is_ambiguous() || self.uid_synthesized
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    New,
    Modified,
    Old,
    Removed,
}

impl RecordStatus {
    /// New and Modified are "current"; Old and Removed are history.
    pub fn is_current(&self) -> bool {
        matches!(self, RecordStatus::New | RecordStatus::Modified)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::New => "new",
            RecordStatus::Modified => "modified",
            RecordStatus::Old => "old",
            RecordStatus::Removed => "removed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "new" => Some(RecordStatus::New),
            "modified" => Some(RecordStatus::Modified),
            "old" => Some(RecordStatus::Old),
            "removed" => Some(RecordStatus::Removed),
            _ => None,
        }
    }

    /// The only post-hoc mutation allowed on a record is current -> Old/Removed.
    pub fn can_transition_to(&self, next: RecordStatus) -> bool {
        self.is_current() && matches!(next, RecordStatus::Old | RecordStatus::Removed)
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted, append-only unit of booking history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationRecord {
    pub id: Uuid,
    pub source_uid: String,
    pub property_id: String,
    pub check_in: NaiveDate,
    pub check_out: NaiveDate,
    pub entry_type: EntryType,
    pub guest: Option<String>,
    pub feed_url: Option<String>,
    pub status: RecordStatus,
    pub needs_review: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ReservationRecord {
    pub fn from_event(event: &Event, status: RecordStatus, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            source_uid: event.source_uid.clone(),
            property_id: event.property_id.clone(),
            check_in: event.check_in,
            check_out: event.check_out,
            entry_type: event.entry_type.value,
            guest: event.guest.clone(),
            feed_url: Some(event.feed_url.clone()),
            status,
            needs_review: event.needs_review(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn identity(&self) -> CompositeIdentity {
        CompositeIdentity::new(self.source_uid.clone(), self.property_id.clone())
    }

    pub fn tuple(&self) -> BookingTuple {
        BookingTuple {
            property_id: self.property_id.clone(),
            check_in: self.check_in,
            check_out: self.check_out,
            entry_type: self.entry_type,
        }
    }

    pub fn is_current(&self) -> bool {
        self.status.is_current()
    }

    /// Dates and entry type are the material fields; guest text churns too often to count.
    pub fn same_booking_as(&self, event: &Event) -> bool {
        self.check_in == event.check_in
            && self.check_out == event.check_out
            && self.entry_type == event.entry_type.value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event() -> Event {
        Event {
            source_uid: "abc".into(),
            uid_synthesized: false,
            property_id: "P1".into(),
            feed_url: "https://example.test/p1.ics".into(),
            check_in: NaiveDate::from_ymd_opt(2025, 7, 1).unwrap(),
            check_out: NaiveDate::from_ymd_opt(2025, 7, 5).unwrap(),
            summary: "Reserved".into(),
            description: String::new(),
            entry_type: Inferred::confident(EntryType::Stay, "reserved"),
            guest: None,
        }
    }

    #[test]
    fn only_current_statuses_may_transition() {
        assert!(RecordStatus::New.can_transition_to(RecordStatus::Old));
        assert!(RecordStatus::Modified.can_transition_to(RecordStatus::Removed));
        assert!(!RecordStatus::Old.can_transition_to(RecordStatus::Removed));
        assert!(!RecordStatus::Removed.can_transition_to(RecordStatus::New));
        assert!(!RecordStatus::New.can_transition_to(RecordStatus::Modified));
    }

    #[test]
    fn record_from_event_keeps_identity_and_tuple() {
        let event = sample_event();
        let record = ReservationRecord::from_event(&event, RecordStatus::New, Utc::now());
        assert_eq!(record.identity(), event.identity());
        assert_eq!(record.tuple(), event.tuple());
        assert!(record.same_booking_as(&event));
        assert!(!record.needs_review);
    }

    #[test]
    fn guest_text_is_not_a_material_change() {
        let mut event = sample_event();
        let record = ReservationRecord::from_event(&event, RecordStatus::New, Utc::now());
        event.guest = Some("Jane Doe".into());
        assert!(record.same_booking_as(&event));
        event.check_out = NaiveDate::from_ymd_opt(2025, 7, 6).unwrap();
        assert!(!record.same_booking_as(&event));
    }

    #[test]
    fn ambiguous_or_synthesized_events_need_review() {
        let mut event = sample_event();
        assert!(!event.needs_review());
        event.entry_type = Inferred::ambiguous(EntryType::Block, None);
        assert!(event.needs_review());
        event.entry_type = Inferred::confident(EntryType::Stay, "reserved");
        event.uid_synthesized = true;
        assert!(event.needs_review());
    }

    #[test]
    fn status_serializes_lowercase() {
        let json = serde_json::to_string(&RecordStatus::Modified).unwrap();
        assert_eq!(json, "\"modified\"");
        assert_eq!(RecordStatus::parse("REMOVED"), Some(RecordStatus::Removed));
        assert_eq!(EntryType::parse("block"), Some(EntryType::Block));
    }
}
