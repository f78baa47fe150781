//! Per-run state shared by reconciliation and removal. Created at the barrier, dropped with the run.

use std::collections::{BTreeMap, HashSet};

use chrono::NaiveDate;
use staysync_core::{BookingTuple, CompositeIdentity};
use uuid::Uuid;

/// How completely a property's feeds were read this run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Coverage {
    /// Every active feed fetched and parsed.
    Complete,
    /// At least one active feed failed.
    Partial,
    /// Registered, but no active feeds.
    NoFeeds,
    Unregistered,
}

#[derive(Debug, Clone, Copy, Default)]
struct FeedTally {
    active: usize,
    succeeded: usize,
    failed: usize,
}

#[derive(Debug)]
pub struct SyncSession {
    run_id: Uuid,
    today: NaiveDate,
    seen_identities: HashSet<CompositeIdentity>,
    seen_tuples: HashSet<BookingTuple>,
    duplicate_tuples: HashSet<BookingTuple>,
    feeds: BTreeMap<String, FeedTally>,
}

impl SyncSession {
    pub fn new(run_id: Uuid, today: NaiveDate) -> Self {
        Self {
            run_id,
            today,
            seen_identities: HashSet::new(),
            seen_tuples: HashSet::new(),
            duplicate_tuples: HashSet::new(),
            feeds: BTreeMap::new(),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn today(&self) -> NaiveDate {
        self.today
    }

    pub fn register_property(&mut self, property_id: &str, active_feeds: usize) {
        self.feeds.entry(property_id.to_string()).or_default().active = active_feeds;
    }

    pub fn record_feed_result(&mut self, property_id: &str, succeeded: bool) {
        let tally = self.feeds.entry(property_id.to_string()).or_default();
        if succeeded {
            tally.succeeded += 1;
        } else {
            tally.failed += 1;
        }
    }

    pub fn coverage(&self, property_id: &str) -> Coverage {
        match self.feeds.get(property_id) {
            None => Coverage::Unregistered,
            Some(t) if t.active == 0 => Coverage::NoFeeds,
            Some(t) if t.failed == 0 && t.succeeded >= t.active => Coverage::Complete,
            Some(_) => Coverage::Partial,
        }
    }

    /// Records the identity and tuple. Returns `false` when the identity was already seen this run.
    pub fn mark_seen(&mut self, identity: &CompositeIdentity, tuple: &BookingTuple) -> bool {
        self.seen_tuples.insert(tuple.clone());
        self.seen_identities.insert(identity.clone())
    }

    pub fn flag_duplicate(&mut self, tuple: BookingTuple) {
        self.duplicate_tuples.insert(tuple);
    }

    pub fn has_seen_identity(&self, identity: &CompositeIdentity) -> bool {
        self.seen_identities.contains(identity)
    }

    /// True if the tuple was observed directly or protected as a duplicate.
    pub fn has_seen_tuple(&self, tuple: &BookingTuple) -> bool {
        self.seen_tuples.contains(tuple) || self.duplicate_tuples.contains(tuple)
    }

    pub fn is_duplicate_tuple(&self, tuple: &BookingTuple) -> bool {
        self.duplicate_tuples.contains(tuple)
    }
}
