//! Bounded, paced writes of a `WritePlan`, with per-record fallback when a batch fails.

use std::collections::HashSet;

use serde::Serialize;
use staysync_core::{CompositeIdentity, ReservationRecord};
use staysync_storage::{RecordStore, StatusChange, StoreError, StoreLimits, TokenBucket};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::reconcile::{Operation, PlannedChange, PlannedInsert, WritePlan};
use crate::SyncError;

/// A write that did not land and needs an operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnresolvedWrite {
    pub identity: CompositeIdentity,
    pub record_id: Uuid,
    pub operation: Operation,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WriteReport {
    pub status_changes_written: usize,
    pub records_created: usize,
    pub store_calls: usize,
    pub unresolved: Vec<UnresolvedWrite>,
}

pub struct BatchWriter<'a> {
    store: &'a dyn RecordStore,
    limits: StoreLimits,
    pacer: TokenBucket,
    dry_run: bool,
}

impl<'a> BatchWriter<'a> {
    pub fn new(store: &'a dyn RecordStore, limits: StoreLimits, dry_run: bool) -> Self {
        Self {
            store,
            limits,
            pacer: TokenBucket::per_second(limits.requests_per_second),
            dry_run,
        }
    }

    /// Writes status flips, then inserts whose prerequisite flips all landed.
    ///
    /// Only a store that is unreachable aborts; every other failure is reported per record.
    pub async fn write(&self, plan: &WritePlan) -> Result<WriteReport, SyncError> {
        let mut report = WriteReport::default();
        if self.dry_run {
            info!(
                status_changes = plan.status_changes.len(),
                inserts = plan.inserts.len(),
                "dry run; skipping store writes"
            );
            report.status_changes_written = plan.status_changes.len();
            report.records_created = plan.inserts.len();
            return Ok(report);
        }

        let batch_size = self.limits.max_batch_size.max(1);
        let mut failed: HashSet<Uuid> = HashSet::new();

        for chunk in plan.status_changes.chunks(batch_size) {
            let changes: Vec<StatusChange> = chunk.iter().map(|c| c.change.clone()).collect();
            match self.call_update(&changes, &mut report).await {
                Ok(()) => report.status_changes_written += chunk.len(),
                Err(err) if err.is_unavailable() => return Err(SyncError::StoreUnreachable(err)),
                Err(err) => {
                    warn!(error = %err, size = chunk.len(), "status batch failed; retrying individually");
                    for planned in chunk {
                        self.write_change(planned, &mut report, &mut failed).await?;
                    }
                }
            }
        }

        let (ready, blocked): (Vec<&PlannedInsert>, Vec<&PlannedInsert>) = plan
            .inserts
            .iter()
            .partition(|i| !i.requires.iter().any(|id| failed.contains(id)));
        for insert in blocked {
            warn!(identity = %insert.record.identity(), operation = ?insert.operation, "insert skipped; prerequisite status change failed");
            report.unresolved.push(UnresolvedWrite {
                identity: insert.record.identity(),
                record_id: insert.record.id,
                operation: insert.operation,
                error: "prerequisite status change failed".into(),
            });
        }

        for chunk in ready.chunks(batch_size) {
            let records: Vec<ReservationRecord> = chunk.iter().map(|i| i.record.clone()).collect();
            match self.call_create(&records, &mut report).await {
                Ok(()) => report.records_created += chunk.len(),
                Err(err) if err.is_unavailable() => return Err(SyncError::StoreUnreachable(err)),
                Err(err) => {
                    warn!(error = %err, size = chunk.len(), "insert batch failed; retrying individually");
                    for insert in chunk {
                        self.write_insert(insert, &mut report).await?;
                    }
                }
            }
        }

        Ok(report)
    }

    async fn call_update(
        &self,
        changes: &[StatusChange],
        report: &mut WriteReport,
    ) -> Result<(), StoreError> {
        self.pacer.take().await;
        report.store_calls += 1;
        self.store.update_statuses(changes).await
    }

    async fn call_create(
        &self,
        records: &[ReservationRecord],
        report: &mut WriteReport,
    ) -> Result<(), StoreError> {
        self.pacer.take().await;
        report.store_calls += 1;
        self.store.create_records(records).await
    }

    async fn write_change(
        &self,
        planned: &PlannedChange,
        report: &mut WriteReport,
        failed: &mut HashSet<Uuid>,
    ) -> Result<(), SyncError> {
        match self
            .call_update(std::slice::from_ref(&planned.change), report)
            .await
        {
            Ok(()) => {
                report.status_changes_written += 1;
                Ok(())
            }
            Err(err) if err.is_unavailable() => Err(SyncError::StoreUnreachable(err)),
            Err(err) => {
                error!(
                    identity = %planned.identity,
                    record_id = %planned.change.record_id,
                    operation = ?planned.operation,
                    from = %planned.change.expected,
                    to = %planned.change.status,
                    error = %err,
                    "status change failed"
                );
                failed.insert(planned.change.record_id);
                report.unresolved.push(UnresolvedWrite {
                    identity: planned.identity.clone(),
                    record_id: planned.change.record_id,
                    operation: planned.operation,
                    error: err.to_string(),
                });
                Ok(())
            }
        }
    }

    async fn write_insert(
        &self,
        insert: &PlannedInsert,
        report: &mut WriteReport,
    ) -> Result<(), SyncError> {
        match self
            .call_create(std::slice::from_ref(&insert.record), report)
            .await
        {
            Ok(()) => {
                report.records_created += 1;
                Ok(())
            }
            Err(err) if err.is_unavailable() => Err(SyncError::StoreUnreachable(err)),
            Err(err) => {
                error!(
                    identity = %insert.record.identity(),
                    record_id = %insert.record.id,
                    operation = ?insert.operation,
                    check_in = %insert.record.check_in,
                    check_out = %insert.record.check_out,
                    error = %err,
                    "record insert failed"
                );
                report.unresolved.push(UnresolvedWrite {
                    identity: insert.record.identity(),
                    record_id: insert.record.id,
                    operation: insert.operation,
                    error: err.to_string(),
                });
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, Utc};
    use staysync_core::{EntryType, RecordStatus};
    use staysync_storage::MemoryRecordStore;

    fn record(uid: &str, status: RecordStatus) -> ReservationRecord {
        let now = Utc::now();
        ReservationRecord {
            id: Uuid::new_v4(),
            source_uid: uid.into(),
            property_id: "P1".into(),
            check_in: NaiveDate::from_ymd_opt(2025, 7, 1).unwrap(),
            check_out: NaiveDate::from_ymd_opt(2025, 7, 5).unwrap(),
            entry_type: EntryType::Stay,
            guest: None,
            feed_url: None,
            status,
            needs_review: false,
            created_at: now,
            updated_at: now,
        }
    }

    fn insert(record: ReservationRecord, requires: Vec<Uuid>) -> PlannedInsert {
        PlannedInsert {
            operation: Operation::Create,
            record,
            requires,
        }
    }

    fn fast_limits(max_batch_size: usize) -> StoreLimits {
        StoreLimits {
            max_batch_size,
            requests_per_second: 1000,
        }
    }

    #[tokio::test]
    async fn inserts_are_chunked_by_batch_limit() {
        let store = MemoryRecordStore::new().with_limits(fast_limits(2));
        let plan = WritePlan {
            status_changes: Vec::new(),
            inserts: (0..5)
                .map(|i| insert(record(&format!("uid-{i}"), RecordStatus::New), Vec::new()))
                .collect(),
        };
        let report = BatchWriter::new(&store, store.limits(), false)
            .write(&plan)
            .await
            .unwrap();
        assert_eq!(report.records_created, 5);
        assert_eq!(report.store_calls, 3);
        assert_eq!(store.write_calls().await, 3);
    }

    #[tokio::test]
    async fn one_bad_record_does_not_block_its_batch() {
        let store = MemoryRecordStore::new().with_limits(fast_limits(10));
        let bad = record("bad", RecordStatus::New);
        store.reject_record(bad.id).await;
        let plan = WritePlan {
            status_changes: Vec::new(),
            inserts: vec![
                insert(record("a", RecordStatus::New), Vec::new()),
                insert(bad.clone(), Vec::new()),
                insert(record("c", RecordStatus::New), Vec::new()),
            ],
        };
        let report = BatchWriter::new(&store, store.limits(), false)
            .write(&plan)
            .await
            .unwrap();
        assert_eq!(report.records_created, 2);
        assert_eq!(report.unresolved.len(), 1);
        assert_eq!(report.unresolved[0].record_id, bad.id);
        assert_eq!(store.snapshot().await.len(), 2);
    }

    #[tokio::test]
    async fn failed_flip_skips_dependent_insert() {
        let old = record("abc", RecordStatus::New);
        let store = MemoryRecordStore::with_records(vec![old.clone()]).with_limits(fast_limits(10));
        store.reject_record(old.id).await;

        let mut replacement = record("xyz", RecordStatus::New);
        replacement.check_in = old.check_in;
        let plan = WritePlan {
            status_changes: vec![PlannedChange {
                identity: old.identity(),
                operation: Operation::Supersede,
                change: StatusChange {
                    record_id: old.id,
                    expected: RecordStatus::New,
                    status: RecordStatus::Old,
                    updated_at: Utc::now(),
                },
            }],
            inserts: vec![insert(replacement.clone(), vec![old.id])],
        };
        let report = BatchWriter::new(&store, store.limits(), false)
            .write(&plan)
            .await
            .unwrap();

        assert_eq!(report.status_changes_written, 0);
        assert_eq!(report.records_created, 0);
        assert_eq!(report.unresolved.len(), 2);
        let snapshot = store.snapshot().await;
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].status, RecordStatus::New);
    }

    #[tokio::test]
    async fn unreachable_store_aborts() {
        let store = MemoryRecordStore::new().with_limits(fast_limits(10));
        store.set_unavailable(true).await;
        let plan = WritePlan {
            status_changes: Vec::new(),
            inserts: vec![insert(record("a", RecordStatus::New), Vec::new())],
        };
        let err = BatchWriter::new(&store, store.limits(), false)
            .write(&plan)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::StoreUnreachable(_)));
    }

    #[tokio::test]
    async fn dry_run_issues_no_store_calls() {
        let store = MemoryRecordStore::new();
        let plan = WritePlan {
            status_changes: Vec::new(),
            inserts: vec![insert(record("a", RecordStatus::New), Vec::new())],
        };
        let report = BatchWriter::new(&store, store.limits(), true)
            .write(&plan)
            .await
            .unwrap();
        assert_eq!(report.records_created, 1);
        assert_eq!(report.store_calls, 0);
        assert_eq!(store.write_calls().await, 0);
        assert!(store.snapshot().await.is_empty());
    }
}
