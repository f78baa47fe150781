//! PostgreSQL-backed record store.

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, QueryBuilder, Row};
use staysync_core::{EntryType, RecordStatus, ReservationRecord};

use crate::records::{RecordFilter, RecordStore, StatusChange, StoreError, StoreLimits};

const SELECT_COLUMNS: &str = "SELECT id, source_uid, property_id, check_in, check_out, entry_type, \
     guest, feed_url, status, needs_review, created_at, updated_at FROM reservations";

#[derive(Debug, Clone)]
pub struct PgRecordStore {
    pool: PgPool,
    limits: StoreLimits,
}

impl PgRecordStore {
    pub async fn connect(database_url: &str, limits: StoreLimits) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .context("connecting to reservation store")?;
        Ok(Self::from_pool(pool, limits))
    }

    pub fn from_pool(pool: PgPool, limits: StoreLimits) -> Self {
        Self { pool, limits }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .context("applying reservation store migrations")
    }
}

fn map_sqlx(err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => StoreError::Unavailable(err.to_string()),
        other => StoreError::Backend(anyhow!(other)),
    }
}

fn record_from_row(row: &PgRow) -> Result<ReservationRecord, StoreError> {
    let entry_type: String = row.try_get("entry_type").map_err(map_sqlx)?;
    let status: String = row.try_get("status").map_err(map_sqlx)?;
    Ok(ReservationRecord {
        id: row.try_get("id").map_err(map_sqlx)?,
        source_uid: row.try_get("source_uid").map_err(map_sqlx)?,
        property_id: row.try_get("property_id").map_err(map_sqlx)?,
        check_in: row.try_get("check_in").map_err(map_sqlx)?,
        check_out: row.try_get("check_out").map_err(map_sqlx)?,
        entry_type: EntryType::parse(&entry_type)
            .ok_or_else(|| StoreError::Backend(anyhow!("unknown entry_type {entry_type:?}")))?,
        guest: row.try_get("guest").map_err(map_sqlx)?,
        feed_url: row.try_get("feed_url").map_err(map_sqlx)?,
        status: RecordStatus::parse(&status)
            .ok_or_else(|| StoreError::Backend(anyhow!("unknown status {status:?}")))?,
        needs_review: row.try_get("needs_review").map_err(map_sqlx)?,
        created_at: row.try_get("created_at").map_err(map_sqlx)?,
        updated_at: row.try_get("updated_at").map_err(map_sqlx)?,
    })
}

#[async_trait]
impl RecordStore for PgRecordStore {
    fn limits(&self) -> StoreLimits {
        self.limits
    }

    async fn list_records(
        &self,
        filter: &RecordFilter,
    ) -> Result<Vec<ReservationRecord>, StoreError> {
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(SELECT_COLUMNS);
        qb.push(" WHERE TRUE");
        if let Some(ids) = &filter.property_ids {
            qb.push(" AND property_id = ANY(")
                .push_bind(ids.clone())
                .push(")");
        }
        if let Some(statuses) = &filter.statuses {
            let statuses: Vec<String> = statuses.iter().map(|s| s.as_str().to_string()).collect();
            qb.push(" AND status = ANY(").push_bind(statuses).push(")");
        }
        if let Some(uid) = &filter.source_uid {
            qb.push(" AND source_uid = ").push_bind(uid.clone());
        }
        qb.push(" ORDER BY created_at, id");

        let rows = qb.build().fetch_all(&self.pool).await.map_err(map_sqlx)?;
        rows.iter().map(record_from_row).collect()
    }

    async fn create_records(&self, records: &[ReservationRecord]) -> Result<(), StoreError> {
        if records.is_empty() {
            return Ok(());
        }
        if records.len() > self.limits.max_batch_size {
            return Err(StoreError::BatchTooLarge {
                size: records.len(),
                limit: self.limits.max_batch_size,
            });
        }

        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO reservations (id, source_uid, property_id, check_in, check_out, \
             entry_type, guest, feed_url, status, needs_review, created_at, updated_at) ",
        );
        qb.push_values(records, |mut row, r| {
            row.push_bind(r.id)
                .push_bind(r.source_uid.clone())
                .push_bind(r.property_id.clone())
                .push_bind(r.check_in)
                .push_bind(r.check_out)
                .push_bind(r.entry_type.as_str())
                .push_bind(r.guest.clone())
                .push_bind(r.feed_url.clone())
                .push_bind(r.status.as_str())
                .push_bind(r.needs_review)
                .push_bind(r.created_at)
                .push_bind(r.updated_at);
        });

        qb.build().execute(&self.pool).await.map_err(|err| {
            if let Some(db) = err.as_database_error() {
                if db.is_unique_violation() && records.len() == 1 {
                    return StoreError::Rejected {
                        record_id: records[0].id,
                        reason: db.message().to_string(),
                    };
                }
            }
            map_sqlx(err)
        })?;
        Ok(())
    }

    async fn update_statuses(&self, changes: &[StatusChange]) -> Result<(), StoreError> {
        if changes.is_empty() {
            return Ok(());
        }
        if changes.len() > self.limits.max_batch_size {
            return Err(StoreError::BatchTooLarge {
                size: changes.len(),
                limit: self.limits.max_batch_size,
            });
        }
        for change in changes {
            if !change.expected.can_transition_to(change.status) {
                return Err(StoreError::InvalidTransition {
                    record_id: change.record_id,
                    from: change.expected,
                    to: change.status,
                });
            }
        }

        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;
        for change in changes {
            let result = sqlx::query(
                "UPDATE reservations SET status = $1, updated_at = $2 WHERE id = $3 AND status = $4",
            )
            .bind(change.status.as_str())
            .bind(change.updated_at)
            .bind(change.record_id)
            .bind(change.expected.as_str())
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx)?;

            if result.rows_affected() == 0 {
                tx.rollback().await.map_err(map_sqlx)?;
                return Err(StoreError::Conflict {
                    record_id: change.record_id,
                    expected: change.expected,
                });
            }
        }
        tx.commit().await.map_err(map_sqlx)?;
        Ok(())
    }
}
