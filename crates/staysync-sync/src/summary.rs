//! Run summary and the per-run report files.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use tokio::fs;
use uuid::Uuid;

use crate::reconcile::ReviewItem;
use crate::removal::DeferredRemoval;
use crate::writer::UnresolvedWrite;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FeedFailure {
    pub property_id: String,
    pub url: String,
    /// `timeout`, `not_found`, `http_status`, `network`, `invalid_url` or `parse`.
    pub kind: String,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedEvent {
    pub property_id: String,
    pub url: String,
    pub uid: Option<String>,
    pub reason: String,
}

/// Counts are of planned operations; writes that did not land are listed in `unresolved_writes`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub today: NaiveDate,
    pub dry_run: bool,
    pub horizon_days: u64,
    pub feeds_total: usize,
    pub feeds_succeeded: usize,
    pub feed_failures: Vec<FeedFailure>,
    pub events_seen: usize,
    pub events_skipped: Vec<SkippedEvent>,
    pub created: usize,
    pub updated: usize,
    pub reactivated: usize,
    pub superseded: usize,
    pub noop: usize,
    pub repaired: usize,
    pub removed: usize,
    pub deferred: Vec<DeferredRemoval>,
    pub review: Vec<ReviewItem>,
    pub unresolved_writes: Vec<UnresolvedWrite>,
    pub store_calls: usize,
    pub reports_dir: Option<String>,
}

impl RunSummary {
    /// Every write planned this run, removals included.
    pub fn total_writes(&self) -> usize {
        self.created + self.updated + self.reactivated + self.superseded + self.repaired + self.removed
    }
}

pub fn render_brief(summary: &RunSummary) -> String {
    let mut out = format!(
        "# Staysync Run Brief\n\n- Run ID: `{}`\n- Started: {}\n- Finished: {}\n- Today: {}\n- Dry run: {}\n- Removal horizon: {} days\n- Feeds: {}/{} succeeded\n- Events seen: {}\n\n## Operations\n- created: {}\n- updated: {}\n- reactivated: {}\n- superseded: {}\n- unchanged: {}\n- repaired: {}\n- removed: {}\n",
        summary.run_id,
        summary.started_at,
        summary.finished_at,
        summary.today,
        summary.dry_run,
        summary.horizon_days,
        summary.feeds_succeeded,
        summary.feeds_total,
        summary.events_seen,
        summary.created,
        summary.updated,
        summary.reactivated,
        summary.superseded,
        summary.noop,
        summary.repaired,
        summary.removed,
    );

    if !summary.feed_failures.is_empty() {
        out.push_str("\n## Feed Failures\n");
        for f in &summary.feed_failures {
            out.push_str(&format!("- {} `{}` ({}): {}\n", f.property_id, f.url, f.kind, f.error));
        }
    }
    if !summary.events_skipped.is_empty() {
        out.push_str("\n## Skipped Events\n");
        for s in &summary.events_skipped {
            out.push_str(&format!(
                "- {} {}: {}\n",
                s.property_id,
                s.uid.as_deref().unwrap_or("(no uid)"),
                s.reason
            ));
        }
    }
    if !summary.deferred.is_empty() {
        out.push_str("\n## Deferred Removals\n");
        for d in &summary.deferred {
            out.push_str(&format!(
                "- {} {}..{} ({:?})\n",
                d.identity, d.check_in, d.check_out, d.reason
            ));
        }
    }
    if !summary.review.is_empty() {
        out.push_str("\n## Needs Review\n");
        for r in &summary.review {
            out.push_str(&format!("- {} {} ({:?})\n", r.identity, r.tuple, r.reason));
        }
    }
    if !summary.unresolved_writes.is_empty() {
        out.push_str("\n## Unresolved Writes\n");
        for w in &summary.unresolved_writes {
            out.push_str(&format!(
                "- {} {:?} record {}: {}\n",
                w.identity, w.operation, w.record_id, w.error
            ));
        }
    }
    out
}

/// Writes `run_summary.json` and `run_brief.md` under `<reports_root>/<run_id>/`.
pub async fn write_reports(reports_root: &Path, summary: &RunSummary) -> Result<PathBuf> {
    let dir = reports_root.join(summary.run_id.to_string());
    fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;

    let json = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    fs::write(dir.join("run_summary.json"), json)
        .await
        .context("writing run_summary.json")?;
    fs::write(dir.join("run_brief.md"), render_brief(summary))
        .await
        .context("writing run_brief.md")?;
    Ok(dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::removal::DeferReason;
    use staysync_core::CompositeIdentity;

    fn summary() -> RunSummary {
        let at = Utc::now();
        RunSummary {
            run_id: Uuid::new_v4(),
            started_at: at,
            finished_at: at,
            today: NaiveDate::from_ymd_opt(2025, 6, 29).unwrap(),
            dry_run: false,
            horizon_days: 14,
            feeds_total: 2,
            feeds_succeeded: 1,
            feed_failures: vec![FeedFailure {
                property_id: "P2".into(),
                url: "https://example.test/p2.ics".into(),
                kind: "timeout".into(),
                error: "timed out fetching https://example.test/p2.ics".into(),
            }],
            events_seen: 3,
            events_skipped: Vec::new(),
            created: 1,
            updated: 0,
            reactivated: 0,
            superseded: 1,
            noop: 1,
            repaired: 0,
            removed: 0,
            deferred: vec![DeferredRemoval {
                identity: CompositeIdentity::new("far", "P1"),
                check_in: NaiveDate::from_ymd_opt(2026, 6, 1).unwrap(),
                check_out: NaiveDate::from_ymd_opt(2026, 6, 4).unwrap(),
                reason: DeferReason::BeyondHorizon,
            }],
            review: Vec::new(),
            unresolved_writes: Vec::new(),
            store_calls: 2,
            reports_dir: None,
        }
    }

    #[test]
    fn brief_lists_failures_and_deferrals() {
        let brief = render_brief(&summary());
        assert!(brief.contains("- Feeds: 1/2 succeeded"));
        assert!(brief.contains("## Feed Failures"));
        assert!(brief.contains("far@P1 2026-06-01..2026-06-04 (BeyondHorizon)"));
        assert!(!brief.contains("## Unresolved Writes"));
    }

    #[tokio::test]
    async fn reports_land_under_run_id() {
        let dir = tempfile::tempdir().unwrap();
        let summary = summary();
        let out = write_reports(dir.path(), &summary).await.unwrap();
        assert_eq!(out, dir.path().join(summary.run_id.to_string()));

        let json: serde_json::Value =
            serde_json::from_slice(&std::fs::read(out.join("run_summary.json")).unwrap()).unwrap();
        assert_eq!(json["superseded"], 1);
        assert_eq!(json["deferred"][0]["reason"], "beyond_horizon");
        assert!(out.join("run_brief.md").exists());
    }
}
