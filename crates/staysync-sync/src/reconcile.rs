//! Per-event state machine: Create, Update, Reactivate, Supersede or NoOp, planned as store writes.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::Serialize;
use staysync_core::{BookingTuple, CompositeIdentity, Event, RecordStatus, ReservationRecord};
use staysync_storage::StatusChange;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::detect::{DuplicateCheck, DuplicateDetector, WorkingSet};
use crate::session::SyncSession;

/// Store-level operation a planned write belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Create,
    Update,
    Reactivate,
    Supersede,
    Remove,
    Repair,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Create,
    Update,
    Reactivate,
    Supersede,
    NoOp,
    AmbiguousDuplicate,
    /// Identity already handled earlier in this run.
    Repeat,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedChange {
    pub identity: CompositeIdentity,
    pub operation: Operation,
    pub change: StatusChange,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedInsert {
    pub operation: Operation,
    pub record: ReservationRecord,
    /// Status changes that must land before this record may be written.
    pub requires: Vec<Uuid>,
}

/// Status flips are always written before inserts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WritePlan {
    pub status_changes: Vec<PlannedChange>,
    pub inserts: Vec<PlannedInsert>,
}

impl WritePlan {
    pub fn is_empty(&self) -> bool {
        self.status_changes.is_empty() && self.inserts.is_empty()
    }

    pub fn len(&self) -> usize {
        self.status_changes.len() + self.inserts.len()
    }

    pub fn touches(&self, record_id: &Uuid) -> bool {
        self.status_changes
            .iter()
            .any(|c| &c.change.record_id == record_id)
            || self.inserts.iter().any(|i| &i.record.id == record_id)
    }

    pub fn count_changes(&self, operation: Operation) -> usize {
        self.status_changes
            .iter()
            .filter(|c| c.operation == operation)
            .count()
    }

    fn flip(
        &mut self,
        record: &ReservationRecord,
        status: RecordStatus,
        operation: Operation,
        now: DateTime<Utc>,
    ) -> Uuid {
        self.status_changes.push(PlannedChange {
            identity: record.identity(),
            operation,
            change: StatusChange {
                record_id: record.id,
                expected: record.status,
                status,
                updated_at: now,
            },
        });
        record.id
    }

    pub fn push_removal(&mut self, record: &ReservationRecord, now: DateTime<Utc>) {
        self.flip(record, RecordStatus::Removed, Operation::Remove, now);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReviewReason {
    AmbiguousDuplicate { related: Vec<CompositeIdentity> },
    AmbiguousEntryType { matched: Option<String> },
    SynthesizedUid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReviewItem {
    pub identity: CompositeIdentity,
    pub tuple: BookingTuple,
    pub feed_url: String,
    #[serde(flatten)]
    pub reason: ReviewReason,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DecisionCounts {
    pub created: usize,
    pub updated: usize,
    pub reactivated: usize,
    pub superseded: usize,
    pub noop: usize,
    pub repeats: usize,
    pub ambiguous: usize,
    pub repaired: usize,
}

impl DecisionCounts {
    fn tally(&mut self, decision: Decision) {
        match decision {
            Decision::Create => self.created += 1,
            Decision::Update => self.updated += 1,
            Decision::Reactivate => self.reactivated += 1,
            Decision::Supersede => self.superseded += 1,
            Decision::NoOp => self.noop += 1,
            Decision::AmbiguousDuplicate => self.ambiguous += 1,
            Decision::Repeat => self.repeats += 1,
        }
    }
}

#[derive(Debug)]
pub struct Reconciled {
    pub working: WorkingSet,
    pub plan: WritePlan,
    pub review: Vec<ReviewItem>,
    pub counts: DecisionCounts,
}

pub struct ReconciliationEngine {
    working: WorkingSet,
    detector: DuplicateDetector,
    now: DateTime<Utc>,
    plan: WritePlan,
    review: Vec<ReviewItem>,
    counts: DecisionCounts,
}

impl ReconciliationEngine {
    pub fn new(working: WorkingSet, detector: DuplicateDetector, now: DateTime<Utc>) -> Self {
        Self {
            working,
            detector,
            now,
            plan: WritePlan::default(),
            review: Vec::new(),
            counts: DecisionCounts::default(),
        }
    }

    /// Builds an engine for `events`, seeding the detector with every identity they carry.
    pub fn for_events(working: WorkingSet, events: &[Event], now: DateTime<Utc>) -> Self {
        let identities: HashSet<_> = events.iter().map(Event::identity).collect();
        Self::new(working, DuplicateDetector::new(identities), now)
    }

    /// Retires surplus current records left by earlier partial failures or external edits.
    pub fn repair(&mut self) -> usize {
        let extras = self.working.take_extra_currents();
        for record in &extras {
            warn!(identity = %record.identity(), record_id = %record.id, "retiring surplus current record");
            self.plan
                .flip(record, RecordStatus::Old, Operation::Repair, self.now);
        }
        self.counts.repaired += extras.len();
        extras.len()
    }

    pub fn apply(&mut self, session: &mut SyncSession, event: &Event) -> Decision {
        let decision = self.decide(session, event);
        self.counts.tally(decision);
        debug!(
            identity = %event.identity(),
            check_in = %event.check_in,
            check_out = %event.check_out,
            entry_type = %event.entry_type.value,
            ?decision,
            "reconciled event"
        );
        decision
    }

    fn decide(&mut self, session: &mut SyncSession, event: &Event) -> Decision {
        let identity = event.identity();
        let tuple = event.tuple();
        if !session.mark_seen(&identity, &tuple) {
            return Decision::Repeat;
        }

        match self.detector.check(&self.working, event) {
            DuplicateCheck::Primary(current) if current.same_booking_as(event) => Decision::NoOp,
            DuplicateCheck::Primary(current) => {
                let prerequisite = self
                    .plan
                    .flip(&current, RecordStatus::Old, Operation::Update, self.now);
                self.working.retire(current.id, RecordStatus::Old);
                self.append(event, RecordStatus::Modified, Operation::Update, vec![prerequisite]);
                Decision::Update
            }
            DuplicateCheck::Related(related) if related.len() == 1 => {
                let previous = &related[0];
                let prerequisite =
                    self.plan
                        .flip(previous, RecordStatus::Old, Operation::Supersede, self.now);
                self.working.retire(previous.id, RecordStatus::Old);
                session.flag_duplicate(tuple);
                session.flag_duplicate(previous.tuple());
                debug!(%identity, superseded = %previous.identity(), "identifier churn");
                self.append(event, RecordStatus::New, Operation::Supersede, vec![prerequisite]);
                Decision::Supersede
            }
            DuplicateCheck::Related(related) => {
                session.flag_duplicate(tuple.clone());
                for record in &related {
                    session.flag_duplicate(record.tuple());
                }
                let related: Vec<_> = related.iter().map(ReservationRecord::identity).collect();
                warn!(%identity, %tuple, related = related.len(), "ambiguous duplicate left for review");
                self.review.push(ReviewItem {
                    identity,
                    tuple,
                    feed_url: event.feed_url.clone(),
                    reason: ReviewReason::AmbiguousDuplicate { related },
                });
                Decision::AmbiguousDuplicate
            }
            DuplicateCheck::Unmatched => match self.working.latest_retired(&identity) {
                Some(previous) => {
                    let status = if previous.same_booking_as(event) {
                        RecordStatus::New
                    } else {
                        RecordStatus::Modified
                    };
                    self.append(event, status, Operation::Reactivate, Vec::new());
                    Decision::Reactivate
                }
                None => {
                    self.append(event, RecordStatus::New, Operation::Create, Vec::new());
                    Decision::Create
                }
            },
        }
    }

    fn append(
        &mut self,
        event: &Event,
        status: RecordStatus,
        operation: Operation,
        requires: Vec<Uuid>,
    ) {
        let record = ReservationRecord::from_event(event, status, self.now);
        if event.entry_type.is_ambiguous() {
            self.review.push(ReviewItem {
                identity: event.identity(),
                tuple: event.tuple(),
                feed_url: event.feed_url.clone(),
                reason: ReviewReason::AmbiguousEntryType {
                    matched: event.entry_type.matched.clone(),
                },
            });
        }
        if event.uid_synthesized {
            self.review.push(ReviewItem {
                identity: event.identity(),
                tuple: event.tuple(),
                feed_url: event.feed_url.clone(),
                reason: ReviewReason::SynthesizedUid,
            });
        }
        self.working.insert_current(record.clone());
        self.plan.inserts.push(PlannedInsert {
            operation,
            record,
            requires,
        });
    }

    pub fn finish(self) -> Reconciled {
        Reconciled {
            working: self.working,
            plan: self.plan,
            review: self.review,
            counts: self.counts,
        }
    }
}
