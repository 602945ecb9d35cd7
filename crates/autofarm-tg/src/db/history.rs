use crate::posting::PostingRecord;
use crate::workers::WorkerId;
use crate::Result;
use chrono::prelude::*;
use sqlx_bat::prelude::*;

/// Posting results of a single worker. Attempts that didn't get any worker
/// are grouped under `None`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct WorkerPostingStats {
    pub(crate) worker: Option<WorkerId>,
    pub(crate) successes: i64,
    pub(crate) failures: i64,
}

#[derive(sqlx::FromRow)]
struct WorkerPostingStatsRecord {
    worker_id: Option<i32>,
    successes: i64,
    failures: i64,
}

pub(crate) struct PostingHistoryRepo {
    db: sqlx::PgPool,
}

impl PostingHistoryRepo {
    pub(crate) fn new(db: sqlx::PgPool) -> Self {
        Self { db }
    }

    pub(crate) async fn record(&self, record: &PostingRecord) -> Result {
        sqlx::query(
            "insert into posting_history (
                slot_id, destination_id, chat_id, worker_id, succeeded, error, attempted_at
            )
            values ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(record.slot_id.into_db())
        .bind(record.destination_id.into_db())
        .bind(record.chat_id.into_db())
        .bind(record.worker_id.map(|worker| worker.into_db()))
        .bind(record.succeeded)
        .bind(record.error.as_deref())
        .bind(record.attempted_at)
        .execute(&self.db)
        .await?;

        Ok(())
    }

    /// Posting results since the given moment grouped by worker
    pub(crate) async fn stats_since(&self, since: DateTime<Utc>) -> Result<Vec<WorkerPostingStats>> {
        sqlx::query_as::<_, WorkerPostingStatsRecord>(
            "select
                worker_id,
                count(*) filter (where succeeded) as successes,
                count(*) filter (where not succeeded) as failures
            from posting_history
            where attempted_at >= $1
            group by worker_id
            order by worker_id nulls last",
        )
        .bind(since)
        .fetch_all(&self.db)
        .await?
        .into_iter()
        .map(|record| -> Result<_> {
            Ok(WorkerPostingStats {
                worker: record.worker_id.map(|id| id.try_into_app()).transpose()?,
                successes: record.successes,
                failures: record.failures,
            })
        })
        .collect()
    }
}
