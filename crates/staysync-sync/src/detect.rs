//! In-run view of the store and primary/secondary duplicate matching.

use std::collections::{BTreeSet, HashMap, HashSet};

use staysync_core::{BookingTuple, CompositeIdentity, Event, RecordStatus, ReservationRecord};
use tracing::warn;
use uuid::Uuid;

/// Every stored record for the run's properties, with in-run decisions applied as they are made.
#[derive(Debug, Default)]
pub struct WorkingSet {
    records: HashMap<Uuid, ReservationRecord>,
    current_by_identity: HashMap<CompositeIdentity, Uuid>,
    current_by_tuple: HashMap<BookingTuple, BTreeSet<Uuid>>,
    latest_retired: HashMap<CompositeIdentity, Uuid>,
    extra_currents: Vec<Uuid>,
}

fn newer(a: &ReservationRecord, b: &ReservationRecord) -> bool {
    (a.created_at, a.id) > (b.created_at, b.id)
}

impl WorkingSet {
    pub fn new(records: Vec<ReservationRecord>) -> Self {
        let mut set = Self::default();
        let mut ordered = records;
        ordered.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));

        for record in ordered {
            let identity = record.identity();
            if record.is_current() {
                if let Some(previous) = set.current_by_identity.get(&identity).copied() {
                    warn!(%identity, kept = %record.id, extra = %previous, "identity has more than one current record");
                    set.unindex_current(previous);
                    set.extra_currents.push(previous);
                }
                set.index_current(&record);
            } else {
                set.note_retired(&record);
            }
            set.records.insert(record.id, record);
        }
        set
    }

    fn index_current(&mut self, record: &ReservationRecord) {
        self.current_by_identity.insert(record.identity(), record.id);
        self.current_by_tuple
            .entry(record.tuple())
            .or_default()
            .insert(record.id);
    }

    fn unindex_current(&mut self, id: Uuid) {
        let Some(record) = self.records.get(&id) else {
            return;
        };
        let identity = record.identity();
        let tuple = record.tuple();
        if self.current_by_identity.get(&identity) == Some(&id) {
            self.current_by_identity.remove(&identity);
        }
        if let Some(ids) = self.current_by_tuple.get_mut(&tuple) {
            ids.remove(&id);
            if ids.is_empty() {
                self.current_by_tuple.remove(&tuple);
            }
        }
    }

    fn note_retired(&mut self, record: &ReservationRecord) {
        let identity = record.identity();
        let replace = match self.latest_retired.get(&identity).and_then(|id| self.records.get(id)) {
            Some(existing) => newer(record, existing),
            None => true,
        };
        if replace {
            self.latest_retired.insert(identity, record.id);
        }
    }

    /// Older surplus current records found at load time, newest already kept current.
    pub fn take_extra_currents(&mut self) -> Vec<ReservationRecord> {
        std::mem::take(&mut self.extra_currents)
            .into_iter()
            .filter_map(|id| self.records.get(&id).cloned())
            .collect()
    }

    pub fn get(&self, id: &Uuid) -> Option<&ReservationRecord> {
        self.records.get(id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn current(&self, identity: &CompositeIdentity) -> Option<&ReservationRecord> {
        self.current_by_identity
            .get(identity)
            .and_then(|id| self.records.get(id))
    }

    pub fn current_with_tuple(&self, tuple: &BookingTuple) -> Vec<&ReservationRecord> {
        self.current_by_tuple
            .get(tuple)
            .into_iter()
            .flatten()
            .filter_map(|id| self.records.get(id))
            .collect()
    }

    pub fn latest_retired(&self, identity: &CompositeIdentity) -> Option<&ReservationRecord> {
        self.latest_retired
            .get(identity)
            .and_then(|id| self.records.get(id))
    }

    /// Current records in a stable order (property, check-in, identity).
    pub fn current_records(&self) -> Vec<&ReservationRecord> {
        let mut out: Vec<_> = self
            .current_by_identity
            .values()
            .filter_map(|id| self.records.get(id))
            .collect();
        out.sort_by(|a, b| {
            (&a.property_id, a.check_in, &a.source_uid).cmp(&(&b.property_id, b.check_in, &b.source_uid))
        });
        out
    }

    /// Applies a status flip decided this run. Retiring a non-current record is a no-op.
    pub fn retire(&mut self, id: Uuid, status: RecordStatus) {
        let is_current = self.records.get(&id).is_some_and(|r| r.is_current());
        if !is_current {
            return;
        }
        self.unindex_current(id);
        if let Some(record) = self.records.get_mut(&id) {
            record.status = status;
        }
        if let Some(record) = self.records.get(&id).cloned() {
            self.note_retired(&record);
        }
    }

    pub fn insert_current(&mut self, record: ReservationRecord) {
        if let Some(previous) = self.current_by_identity.get(&record.identity()).copied() {
            self.retire(previous, RecordStatus::Old);
        }
        self.index_current(&record);
        self.records.insert(record.id, record);
    }
}

/// Outcome of matching one event against the working set.
#[derive(Debug, Clone, PartialEq)]
pub enum DuplicateCheck {
    /// Current record with the same composite identity.
    Primary(ReservationRecord),
    /// No primary match; current records under other identities share the event's tuple.
    Related(Vec<ReservationRecord>),
    Unmatched,
}

impl DuplicateCheck {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, DuplicateCheck::Related(_))
    }

    pub fn related(&self) -> &[ReservationRecord] {
        match self {
            DuplicateCheck::Related(records) => records,
            _ => &[],
        }
    }
}

#[derive(Debug, Default)]
pub struct DuplicateDetector {
    run_identities: HashSet<CompositeIdentity>,
}

impl DuplicateDetector {
    /// `run_identities` holds every identity present in this run's events. A record whose own
    /// identity is still being published is reconciled by its own event, never treated as churn.
    pub fn new(run_identities: HashSet<CompositeIdentity>) -> Self {
        Self { run_identities }
    }

    pub fn check(&self, working: &WorkingSet, event: &Event) -> DuplicateCheck {
        let identity = event.identity();
        if let Some(current) = working.current(&identity) {
            return DuplicateCheck::Primary(current.clone());
        }

        let related: Vec<ReservationRecord> = working
            .current_with_tuple(&event.tuple())
            .into_iter()
            .filter(|r| {
                let other = r.identity();
                other != identity && !self.run_identities.contains(&other)
            })
            .cloned()
            .collect();

        if related.is_empty() {
            DuplicateCheck::Unmatched
        } else {
            DuplicateCheck::Related(related)
        }
    }
}
