//! Post-barrier removal decisions for current records that were not observed this run.

use chrono::{DateTime, Days, NaiveDate, Utc};
use serde::Serialize;
use staysync_core::{CompositeIdentity, ReservationRecord};
use tracing::{debug, warn};

use crate::detect::WorkingSet;
use crate::reconcile::WritePlan;
use crate::session::{Coverage, SyncSession};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeferReason {
    BeyondHorizon,
    FeedUnavailable,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeferredRemoval {
    pub identity: CompositeIdentity,
    pub check_in: NaiveDate,
    pub check_out: NaiveDate,
    pub reason: DeferReason,
}

#[derive(Debug, Default)]
pub struct RemovalReport {
    pub removed: Vec<CompositeIdentity>,
    pub deferred: Vec<DeferredRemoval>,
}

#[derive(Debug, Clone, Copy)]
pub struct RemovalDetector {
    horizon: Days,
    today: NaiveDate,
}

impl RemovalDetector {
    pub fn new(horizon: Days, today: NaiveDate) -> Self {
        Self { horizon, today }
    }

    /// Last check-in date that may still be removed automatically.
    pub fn cutoff(&self) -> NaiveDate {
        self.today
            .checked_add_days(self.horizon)
            .unwrap_or(NaiveDate::MAX)
    }

    /// Appends a Removed flip to `plan` for every safely removable record.
    pub fn evaluate(
        &self,
        session: &SyncSession,
        working: &WorkingSet,
        plan: &mut WritePlan,
        now: DateTime<Utc>,
    ) -> RemovalReport {
        let cutoff = self.cutoff();
        let mut report = RemovalReport::default();

        let candidates: Vec<&ReservationRecord> = working
            .current_records()
            .into_iter()
            .filter(|r| !plan.touches(&r.id))
            .filter(|r| !session.has_seen_identity(&r.identity()))
            .filter(|r| !session.has_seen_tuple(&r.tuple()))
            .filter(|r| r.check_out >= self.today)
            .collect();

        for record in candidates {
            let identity = record.identity();
            match session.coverage(&record.property_id) {
                Coverage::Complete => {}
                Coverage::Partial => {
                    warn!(%identity, check_in = %record.check_in, "removal deferred; property feed unavailable this run");
                    report.deferred.push(self.deferral(record, DeferReason::FeedUnavailable));
                    continue;
                }
                Coverage::NoFeeds | Coverage::Unregistered => {
                    debug!(%identity, "property not synced; removal not considered");
                    continue;
                }
            }

            if record.check_in > cutoff {
                warn!(%identity, check_in = %record.check_in, %cutoff, "deferred — beyond safety horizon");
                report.deferred.push(self.deferral(record, DeferReason::BeyondHorizon));
                continue;
            }

            debug!(%identity, check_in = %record.check_in, "marking record removed");
            plan.push_removal(record, now);
            report.removed.push(identity);
        }
        report
    }

    fn deferral(&self, record: &ReservationRecord, reason: DeferReason) -> DeferredRemoval {
        DeferredRemoval {
            identity: record.identity(),
            check_in: record.check_in,
            check_out: record.check_out,
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use staysync_core::{EntryType, RecordStatus};
    use uuid::Uuid;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 6, 29).unwrap()
    }

    fn record(uid: &str, check_in: NaiveDate, nights: u64) -> ReservationRecord {
        let at = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
        ReservationRecord {
            id: Uuid::new_v4(),
            source_uid: uid.into(),
            property_id: "P1".into(),
            check_in,
            check_out: check_in + Days::new(nights),
            entry_type: EntryType::Stay,
            guest: None,
            feed_url: None,
            status: RecordStatus::New,
            needs_review: false,
            created_at: at,
            updated_at: at,
        }
    }

    fn covered_session() -> SyncSession {
        let mut session = SyncSession::new(Uuid::new_v4(), today());
        session.register_property("P1", 1);
        session.record_feed_result("P1", true);
        session
    }

    fn evaluate(horizon_days: u64, session: &SyncSession, records: Vec<ReservationRecord>) -> (RemovalReport, WritePlan) {
        let working = WorkingSet::new(records);
        let mut plan = WritePlan::default();
        let report = RemovalDetector::new(Days::new(horizon_days), today()).evaluate(
            session,
            &working,
            &mut plan,
            Utc::now(),
        );
        (report, plan)
    }

    #[test]
    fn absent_record_within_horizon_is_removed() {
        let r = record("abc", NaiveDate::from_ymd_opt(2025, 7, 1).unwrap(), 4);
        let (report, plan) = evaluate(7, &covered_session(), vec![r.clone()]);
        assert_eq!(report.removed, vec![r.identity()]);
        assert_eq!(plan.status_changes[0].change.status, RecordStatus::Removed);
    }

    #[test]
    fn horizon_guard_holds_for_short_and_long_horizons() {
        let far = record("far", NaiveDate::from_ymd_opt(2026, 6, 1).unwrap(), 3);
        for horizon in [7, 180] {
            let (report, plan) = evaluate(horizon, &covered_session(), vec![far.clone()]);
            assert!(plan.is_empty(), "horizon {horizon}");
            assert_eq!(report.deferred[0].reason, DeferReason::BeyondHorizon);
        }
    }

    #[test]
    fn horizon_length_changes_the_outcome_for_mid_range_dates() {
        let mid = record("mid", NaiveDate::from_ymd_opt(2025, 9, 1).unwrap(), 3);
        let (short, _) = evaluate(7, &covered_session(), vec![mid.clone()]);
        let (long, _) = evaluate(180, &covered_session(), vec![mid]);
        assert_eq!(short.deferred.len(), 1);
        assert_eq!(long.removed.len(), 1);
    }

    #[test]
    fn seen_tuple_blocks_removal() {
        let r = record("abc", NaiveDate::from_ymd_opt(2025, 7, 1).unwrap(), 4);
        let mut session = covered_session();
        session.flag_duplicate(r.tuple());
        let (report, plan) = evaluate(7, &session, vec![r]);
        assert!(report.removed.is_empty());
        assert!(plan.is_empty());
    }

    #[test]
    fn failed_feed_defers_removal() {
        let r = record("abc", NaiveDate::from_ymd_opt(2025, 7, 1).unwrap(), 4);
        let mut session = SyncSession::new(Uuid::new_v4(), today());
        session.register_property("P1", 2);
        session.record_feed_result("P1", true);
        session.record_feed_result("P1", false);
        let (report, plan) = evaluate(7, &session, vec![r]);
        assert!(plan.is_empty());
        assert_eq!(report.deferred[0].reason, DeferReason::FeedUnavailable);
    }

    #[test]
    fn departed_stays_are_not_candidates() {
        let r = record("past", NaiveDate::from_ymd_opt(2025, 6, 20).unwrap(), 3);
        let (report, plan) = evaluate(7, &covered_session(), vec![r]);
        assert!(plan.is_empty());
        assert!(report.deferred.is_empty());
    }
}
