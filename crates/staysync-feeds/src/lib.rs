//! Feed registry, calendar parsing and per-platform event interpretation.

use serde::{Deserialize, Serialize};
use staysync_core::{EntryType, Inferred};

pub mod ics;
pub mod registry;

pub use ics::{parse_feed, EventError, FeedContext, ParseError, ParseMode, ParsedFeed, RawEvent};
pub use registry::{
    active_targets, FeedHealth, FeedRegistry, FeedTarget, FetchOutcome, StaticFeedRegistry,
    YamlFeedRegistry,
};

pub const CRATE_NAME: &str = "staysync-feeds";

const BLOCK_TERMS: &[&str] = &[
    "not available",
    "unavailable",
    "blocked",
    "owner",
    "maintenance",
    "closed",
    "hold",
];

const STAY_TERMS: &[&str] = &[
    "reserved",
    "reservation",
    "booked",
    "booking",
    "guest",
    "confirmed",
];

const GUEST_MARKERS: &[&str] = &[
    "reservation url",
    "phone number",
    "guest name",
    "guests:",
    "email",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Airbnb,
    Vrbo,
    Generic,
}

impl Platform {
    /// The URL host wins; the registry's hint is only a fallback.
    pub fn detect(url: &str, hint: Option<&str>) -> Self {
        let lower = url.to_ascii_lowercase();
        let host = lower
            .split("://")
            .nth(1)
            .unwrap_or(&lower)
            .split(['/', '?'])
            .next()
            .unwrap_or_default();
        if host.contains("airbnb.") {
            return Platform::Airbnb;
        }
        if host.contains("vrbo.") || host.contains("homeaway.") {
            return Platform::Vrbo;
        }
        match hint.map(|h| h.trim().to_ascii_lowercase()).as_deref() {
            Some("airbnb") => Platform::Airbnb,
            Some("vrbo") | Some("homeaway") => Platform::Vrbo,
            _ => Platform::Generic,
        }
    }
}

/// Platform-specific reading of event text.
pub trait FeedAdapter: Send + Sync {
    fn platform(&self) -> Platform;

    fn classify(&self, summary: &str, description: &str) -> Inferred<EntryType>;

    fn guest_name(&self, summary: &str, description: &str) -> Option<String>;
}

#[derive(Debug, Clone, Copy)]
struct KeywordAdapter;

#[derive(Debug, Clone, Copy)]
struct AirbnbAdapter;

#[derive(Debug, Clone, Copy)]
struct VrboAdapter;

impl FeedAdapter for KeywordAdapter {
    fn platform(&self) -> Platform {
        Platform::Generic
    }

    fn classify(&self, summary: &str, description: &str) -> Inferred<EntryType> {
        classify_by_keywords(summary, description)
    }

    fn guest_name(&self, summary: &str, description: &str) -> Option<String> {
        guest_from_description(description).or_else(|| guest_from_summary(summary))
    }
}

impl FeedAdapter for AirbnbAdapter {
    fn platform(&self) -> Platform {
        Platform::Airbnb
    }

    fn classify(&self, summary: &str, description: &str) -> Inferred<EntryType> {
        let s = summary.trim();
        if s.eq_ignore_ascii_case("Reserved") {
            return Inferred::confident(EntryType::Stay, "reserved");
        }
        if s.eq_ignore_ascii_case("Airbnb (Not available)") {
            return Inferred::confident(EntryType::Block, "airbnb (not available)");
        }
        classify_by_keywords(summary, description)
    }

    /// Airbnb exports no names; the phone suffix is the only guest descriptor.
    fn guest_name(&self, _summary: &str, description: &str) -> Option<String> {
        description.lines().find_map(|line| {
            let (label, value) = line.split_once(':')?;
            if !label.to_ascii_lowercase().contains("last 4 digits") {
                return None;
            }
            let digits: String = value.chars().filter(char::is_ascii_digit).collect();
            (digits.len() == 4).then(|| format!("phone ...{digits}"))
        })
    }
}

impl FeedAdapter for VrboAdapter {
    fn platform(&self) -> Platform {
        Platform::Vrbo
    }

    fn classify(&self, summary: &str, description: &str) -> Inferred<EntryType> {
        let s = summary.trim().to_ascii_lowercase();
        if s == "blocked" {
            return Inferred::confident(EntryType::Block, "blocked");
        }
        if s == "reserved" || s.starts_with("reserved -") {
            return Inferred::confident(EntryType::Stay, "reserved");
        }
        classify_by_keywords(summary, description)
    }

    fn guest_name(&self, summary: &str, description: &str) -> Option<String> {
        guest_from_summary(summary).or_else(|| guest_from_description(description))
    }
}

pub fn adapter_for_platform(platform: Platform) -> Box<dyn FeedAdapter> {
    match platform {
        Platform::Airbnb => Box::new(AirbnbAdapter),
        Platform::Vrbo => Box::new(VrboAdapter),
        Platform::Generic => Box::new(KeywordAdapter),
    }
}

pub fn adapter_for_feed(url: &str, hint: Option<&str>) -> Box<dyn FeedAdapter> {
    adapter_for_platform(Platform::detect(url, hint))
}

/// Keyword heuristic. Conflicting or missing evidence is returned as ambiguous, never as a firm answer.
pub fn classify_by_keywords(summary: &str, description: &str) -> Inferred<EntryType> {
    let text = format!("{summary}\n{description}").to_lowercase();
    let block = BLOCK_TERMS.iter().find(|t| contains_term(&text, t));
    let stay = STAY_TERMS.iter().find(|t| contains_term(&text, t));
    let lean = if has_guest_text(&text) {
        EntryType::Stay
    } else {
        EntryType::Block
    };

    match (block, stay) {
        (Some(b), None) => Inferred::confident(EntryType::Block, *b),
        (None, Some(s)) => Inferred::confident(EntryType::Stay, *s),
        (Some(b), Some(s)) => Inferred::ambiguous(lean, Some(format!("{b}+{s}"))),
        (None, None) => Inferred::ambiguous(lean, None),
    }
}

fn has_guest_text(lower: &str) -> bool {
    GUEST_MARKERS.iter().any(|m| lower.contains(m))
}

/// Whole-word (or whole-phrase) match, so "hold" does not fire on "household".
fn contains_term(haystack: &str, term: &str) -> bool {
    haystack.match_indices(term).any(|(idx, _)| {
        let before = haystack[..idx].chars().next_back();
        let after = haystack[idx + term.len()..].chars().next();
        !before.is_some_and(char::is_alphanumeric) && !after.is_some_and(char::is_alphanumeric)
    })
}

fn guest_from_summary(summary: &str) -> Option<String> {
    let (head, tail) = summary.split_once(" - ")?;
    let head = head.trim().to_lowercase();
    if !STAY_TERMS.iter().any(|t| head == *t) {
        return None;
    }
    let name = tail.trim();
    (!name.is_empty()).then(|| name.to_string())
}

fn guest_from_description(description: &str) -> Option<String> {
    description.lines().find_map(|line| {
        let (label, value) = line.split_once(':')?;
        let label = label.trim().to_ascii_lowercase();
        if label != "guest" && label != "guest name" && label != "name" {
            return None;
        }
        let value = value.trim();
        (!value.is_empty()).then(|| value.to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use staysync_core::Confidence;

    #[test]
    fn platform_detection_prefers_url_host() {
        assert_eq!(
            Platform::detect("https://www.airbnb.com/calendar/ical/1.ics?s=x", Some("vrbo")),
            Platform::Airbnb
        );
        assert_eq!(
            Platform::detect("http://www.vrbo.com/icalendar/abc.ics", None),
            Platform::Vrbo
        );
        assert_eq!(
            Platform::detect("https://calendar.example.com/feed.ics", Some("HomeAway")),
            Platform::Vrbo
        );
        assert_eq!(
            Platform::detect("https://calendar.example.com/airbnb.ics", None),
            Platform::Generic
        );
    }

    #[test]
    fn airbnb_summaries_are_confident() {
        let adapter = adapter_for_platform(Platform::Airbnb);
        let stay = adapter.classify("Reserved", "Reservation URL: https://x");
        assert_eq!(stay.value, EntryType::Stay);
        assert_eq!(stay.confidence, Confidence::Confident);

        let block = adapter.classify("Airbnb (Not available)", "");
        assert_eq!(block.value, EntryType::Block);
        assert_eq!(block.confidence, Confidence::Confident);

        assert_eq!(
            adapter.guest_name("Reserved", "Phone Number (Last 4 Digits): 4821"),
            Some("phone ...4821".into())
        );
    }

    #[test]
    fn vrbo_reads_guest_from_summary() {
        let adapter = adapter_for_platform(Platform::Vrbo);
        let inferred = adapter.classify("Reserved - Maria Garcia", "");
        assert_eq!(inferred.value, EntryType::Stay);
        assert_eq!(
            adapter.guest_name("Reserved - Maria Garcia", ""),
            Some("Maria Garcia".into())
        );
        assert_eq!(adapter.classify("Blocked", "").value, EntryType::Block);
    }

    #[test]
    fn owner_and_maintenance_text_is_a_block() {
        let inferred = classify_by_keywords("Owner stay", "");
        assert_eq!(inferred.value, EntryType::Block);
        assert_eq!(inferred.matched.as_deref(), Some("owner"));
        assert!(!inferred.is_ambiguous());

        assert_eq!(
            classify_by_keywords("HVAC maintenance", "").value,
            EntryType::Block
        );
    }

    #[test]
    fn conflicting_terms_are_ambiguous() {
        let inferred = classify_by_keywords("Reserved (owner)", "");
        assert!(inferred.is_ambiguous());
        assert_eq!(inferred.value, EntryType::Block);

        let with_guest = classify_by_keywords("Booked - on hold", "Guest name: Ana");
        assert!(with_guest.is_ambiguous());
        assert_eq!(with_guest.value, EntryType::Stay);
    }

    #[test]
    fn no_evidence_leans_block_but_stays_ambiguous() {
        let inferred = classify_by_keywords("Smith family", "");
        assert!(inferred.is_ambiguous());
        assert_eq!(inferred.value, EntryType::Block);
        assert_eq!(inferred.matched, None);
    }

    #[test]
    fn terms_match_whole_words_only() {
        assert!(!contains_term("household chores", "hold"));
        assert!(contains_term("on hold until friday", "hold"));
        assert!(contains_term("airbnb (not available)", "not available"));
    }

    #[test]
    fn generic_guest_from_description() {
        let adapter = adapter_for_feed("https://pms.example.com/ical/9.ics", None);
        assert_eq!(adapter.platform(), Platform::Generic);
        assert_eq!(
            adapter.guest_name("Booking", "Guest: Lee Chen\nNights: 3"),
            Some("Lee Chen".into())
        );
    }
}
