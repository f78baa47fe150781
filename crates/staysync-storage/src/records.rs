//! Record store contract (CRUD + filter) and the in-memory implementation used for dry runs and tests.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use staysync_core::{RecordStatus, ReservationRecord};
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Published constraints of a record store backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreLimits {
    pub max_batch_size: usize,
    pub requests_per_second: u32,
}

impl Default for StoreLimits {
    fn default() -> Self {
        Self {
            max_batch_size: 100,
            requests_per_second: 10,
        }
    }
}

impl StoreLimits {
    /// Operator overrides may only tighten the backend's limits.
    pub fn tightened(self, batch_size: Option<usize>, requests_per_second: Option<u32>) -> Self {
        Self {
            max_batch_size: batch_size
                .map(|b| b.clamp(1, self.max_batch_size))
                .unwrap_or(self.max_batch_size),
            requests_per_second: requests_per_second
                .map(|r| r.clamp(1, self.requests_per_second))
                .unwrap_or(self.requests_per_second),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordFilter {
    pub property_ids: Option<Vec<String>>,
    pub statuses: Option<Vec<RecordStatus>>,
    pub source_uid: Option<String>,
}

impl RecordFilter {
    pub fn for_properties<I, S>(property_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            property_ids: Some(property_ids.into_iter().map(Into::into).collect()),
            ..Default::default()
        }
    }

    pub fn current() -> Self {
        Self {
            statuses: Some(vec![RecordStatus::New, RecordStatus::Modified]),
            ..Default::default()
        }
    }

    pub fn with_statuses(mut self, statuses: Vec<RecordStatus>) -> Self {
        self.statuses = Some(statuses);
        self
    }

    pub fn matches(&self, record: &ReservationRecord) -> bool {
        if let Some(ids) = &self.property_ids {
            if !ids.iter().any(|id| id == &record.property_id) {
                return false;
            }
        }
        if let Some(statuses) = &self.statuses {
            if !statuses.contains(&record.status) {
                return false;
            }
        }
        if let Some(uid) = &self.source_uid {
            if uid != &record.source_uid {
                return false;
            }
        }
        true
    }
}

/// Status flip with an optimistic check on the status the caller last observed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChange {
    pub record_id: Uuid,
    pub expected: RecordStatus,
    pub status: RecordStatus,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record store unavailable: {0}")]
    Unavailable(String),
    #[error("record {record_id} rejected: {reason}")]
    Rejected { record_id: Uuid, reason: String },
    #[error("record {record_id} changed concurrently (expected status {expected})")]
    Conflict {
        record_id: Uuid,
        expected: RecordStatus,
    },
    #[error("record {record_id}: status {from} -> {to} is not allowed")]
    InvalidTransition {
        record_id: Uuid,
        from: RecordStatus,
        to: RecordStatus,
    },
    #[error("record {0} not found")]
    NotFound(Uuid),
    #[error("batch of {size} exceeds store limit {limit}")]
    BatchTooLarge { size: usize, limit: usize },
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

impl StoreError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    fn limits(&self) -> StoreLimits;

    async fn list_records(&self, filter: &RecordFilter)
        -> Result<Vec<ReservationRecord>, StoreError>;

    /// One write call. Either every record is created or none is.
    async fn create_records(&self, records: &[ReservationRecord]) -> Result<(), StoreError>;

    /// One write call. Either every change applies or none does.
    async fn update_statuses(&self, changes: &[StatusChange]) -> Result<(), StoreError>;
}

#[derive(Debug, Default)]
struct MemoryState {
    records: Vec<ReservationRecord>,
    rejected: HashSet<Uuid>,
    unavailable: bool,
    write_calls: usize,
}

/// Process-local store with the same invariants the Postgres schema enforces.
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    state: Mutex<MemoryState>,
    limits: StoreLimits,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: Vec<ReservationRecord>) -> Self {
        Self {
            state: Mutex::new(MemoryState {
                records,
                ..Default::default()
            }),
            limits: StoreLimits::default(),
        }
    }

    pub fn with_limits(mut self, limits: StoreLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Any write call touching this record id fails with `Rejected`.
    pub async fn reject_record(&self, record_id: Uuid) {
        self.state.lock().await.rejected.insert(record_id);
    }

    pub async fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().await.unavailable = unavailable;
    }

    pub async fn write_calls(&self) -> usize {
        self.state.lock().await.write_calls
    }

    pub async fn snapshot(&self) -> Vec<ReservationRecord> {
        self.state.lock().await.records.clone()
    }

    fn check_batch(&self, size: usize) -> Result<(), StoreError> {
        if size > self.limits.max_batch_size {
            return Err(StoreError::BatchTooLarge {
                size,
                limit: self.limits.max_batch_size,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    fn limits(&self) -> StoreLimits {
        self.limits
    }

    async fn list_records(
        &self,
        filter: &RecordFilter,
    ) -> Result<Vec<ReservationRecord>, StoreError> {
        let state = self.state.lock().await;
        if state.unavailable {
            return Err(StoreError::Unavailable("memory store offline".into()));
        }
        Ok(state
            .records
            .iter()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect())
    }

    async fn create_records(&self, records: &[ReservationRecord]) -> Result<(), StoreError> {
        self.check_batch(records.len())?;
        let mut state = self.state.lock().await;
        if state.unavailable {
            return Err(StoreError::Unavailable("memory store offline".into()));
        }
        state.write_calls += 1;

        let mut current: HashSet<_> = state
            .records
            .iter()
            .filter(|r| r.is_current())
            .map(|r| r.identity())
            .collect();
        let mut ids: HashSet<Uuid> = state.records.iter().map(|r| r.id).collect();

        for record in records {
            if state.rejected.contains(&record.id) {
                return Err(StoreError::Rejected {
                    record_id: record.id,
                    reason: "rejected by store".into(),
                });
            }
            if !ids.insert(record.id) {
                return Err(StoreError::Rejected {
                    record_id: record.id,
                    reason: "duplicate record id".into(),
                });
            }
            if record.is_current() && !current.insert(record.identity()) {
                return Err(StoreError::Rejected {
                    record_id: record.id,
                    reason: format!("{} already has a current record", record.identity()),
                });
            }
        }

        state.records.extend(records.iter().cloned());
        Ok(())
    }

    async fn update_statuses(&self, changes: &[StatusChange]) -> Result<(), StoreError> {
        self.check_batch(changes.len())?;
        let mut state = self.state.lock().await;
        if state.unavailable {
            return Err(StoreError::Unavailable("memory store offline".into()));
        }
        state.write_calls += 1;

        let mut positions = Vec::with_capacity(changes.len());
        for change in changes {
            if state.rejected.contains(&change.record_id) {
                return Err(StoreError::Rejected {
                    record_id: change.record_id,
                    reason: "rejected by store".into(),
                });
            }
            let Some(pos) = state.records.iter().position(|r| r.id == change.record_id) else {
                return Err(StoreError::NotFound(change.record_id));
            };
            let existing = &state.records[pos];
            if existing.status != change.expected {
                return Err(StoreError::Conflict {
                    record_id: change.record_id,
                    expected: change.expected,
                });
            }
            if !existing.status.can_transition_to(change.status) {
                return Err(StoreError::InvalidTransition {
                    record_id: change.record_id,
                    from: existing.status,
                    to: change.status,
                });
            }
            positions.push(pos);
        }

        for (pos, change) in positions.into_iter().zip(changes) {
            let record = &mut state.records[pos];
            record.status = change.status;
            record.updated_at = change.updated_at;
        }
        Ok(())
    }
}
