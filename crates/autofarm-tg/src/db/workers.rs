use crate::prelude::*;
use crate::workers::{WorkerId, WorkerState};
use crate::Result;
use chrono::prelude::*;
use sqlx_bat::prelude::*;
use std::collections::HashMap;
use teloxide::types::ChatId;

#[derive(sqlx::FromRow)]
struct WorkerRecord {
    id: i32,
    hourly_posts: i32,
    hour_started_at: Option<DateTime<Utc>>,
    daily_posts: i32,
    day_started_at: Option<DateTime<Utc>>,
    last_used_at: Option<DateTime<Utc>>,
    is_banned: bool,
    is_healthy: bool,
    last_error: Option<String>,
    cooldown_until: Option<DateTime<Utc>>,
    cooldown_reason: Option<String>,
}

#[derive(sqlx::FromRow)]
struct WorkerBanRecord {
    worker_id: i32,
    chat_id: i64,
}

/// Counters can't be negative, a negative value in the database is treated
/// as zero
fn count_from_db(count: i32) -> u32 {
    u32::try_from(count).unwrap_or_default()
}

fn count_into_db(count: u32) -> i32 {
    i32::try_from(count).unwrap_or(i32::MAX)
}

pub(crate) struct WorkersRepo {
    db: sqlx::PgPool,
}

impl WorkersRepo {
    pub(crate) fn new(db: sqlx::PgPool) -> Self {
        Self { db }
    }

    #[instrument(skip(self))]
    pub(crate) async fn load(&self) -> Result<Vec<WorkerState>> {
        let records = sqlx::query_as::<_, WorkerRecord>(
            "select
                w.id, w.hourly_posts, w.hour_started_at, w.daily_posts, w.day_started_at,
                w.last_used_at, w.is_banned, w.is_healthy, w.last_error,
                c.cooldown_until, c.reason as cooldown_reason
            from workers w
            left join worker_cooldowns c on c.worker_id = w.id
            order by w.id",
        )
        .fetch_all(&self.db)
        .await?;

        let bans = sqlx::query_as::<_, WorkerBanRecord>("select worker_id, chat_id from worker_bans")
            .fetch_all(&self.db)
            .await?;

        let mut banned_chats: HashMap<i32, Vec<ChatId>> = HashMap::new();
        for ban in bans {
            banned_chats
                .entry(ban.worker_id)
                .or_default()
                .push(ban.chat_id.try_into_app()?);
        }

        records
            .into_iter()
            .map(|record| -> Result<_> {
                Ok(WorkerState {
                    id: record.id.try_into_app()?,
                    hourly_posts: count_from_db(record.hourly_posts),
                    hour_started_at: record.hour_started_at,
                    daily_posts: count_from_db(record.daily_posts),
                    day_started_at: record.day_started_at,
                    last_used_at: record.last_used_at,
                    cooldown_until: record.cooldown_until,
                    cooldown_reason: record.cooldown_reason,
                    is_banned: record.is_banned,
                    banned_chats: banned_chats
                        .remove(&record.id)
                        .unwrap_or_default()
                        .into_iter()
                        .collect(),
                    is_healthy: record.is_healthy,
                    last_error: record.last_error,
                    consecutive_failures: 0,
                })
            })
            .collect()
    }

    /// Upserts the worker row and replaces its cooldown in one transaction
    pub(crate) async fn save(&self, worker: &WorkerState) -> Result {
        let mut tx = self.db.begin().await?;

        sqlx::query(
            "insert into workers (
                id, hourly_posts, hour_started_at, daily_posts, day_started_at,
                last_used_at, is_banned, is_healthy, last_error
            )
            values ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            on conflict (id) do update set
                hourly_posts = excluded.hourly_posts,
                hour_started_at = excluded.hour_started_at,
                daily_posts = excluded.daily_posts,
                day_started_at = excluded.day_started_at,
                last_used_at = excluded.last_used_at,
                is_banned = excluded.is_banned,
                is_healthy = excluded.is_healthy,
                last_error = excluded.last_error",
        )
        .bind(worker.id.into_db())
        .bind(count_into_db(worker.hourly_posts))
        .bind(worker.hour_started_at)
        .bind(count_into_db(worker.daily_posts))
        .bind(worker.day_started_at)
        .bind(worker.last_used_at)
        .bind(worker.is_banned)
        .bind(worker.is_healthy)
        .bind(worker.last_error.as_deref())
        .execute(&mut *tx)
        .await?;

        match worker.cooldown_until {
            Some(until) => {
                sqlx::query(
                    "insert into worker_cooldowns (worker_id, cooldown_until, reason)
                    values ($1, $2, $3)
                    on conflict (worker_id) do update set
                        cooldown_until = excluded.cooldown_until,
                        reason = excluded.reason",
                )
                .bind(worker.id.into_db())
                .bind(until)
                .bind(worker.cooldown_reason.as_deref().unwrap_or_default())
                .execute(&mut *tx)
                .await?;
            }
            None => {
                sqlx::query("delete from worker_cooldowns where worker_id = $1")
                    .bind(worker.id.into_db())
                    .execute(&mut *tx)
                    .await?;
            }
        }

        tx.commit().await?;

        Ok(())
    }

    pub(crate) async fn save_chat_ban(&self, worker: WorkerId, chat: ChatId, reason: &str) -> Result {
        sqlx::query(
            "insert into worker_bans (worker_id, chat_id, reason)
            values ($1, $2, $3)
            on conflict (worker_id, chat_id) do update set
                reason = excluded.reason,
                banned_at = now()",
        )
        .bind(worker.into_db())
        .bind(chat.into_db())
        .bind(reason)
        .execute(&self.db)
        .await?;

        Ok(())
    }
}
