use crate::error::{err, UserError};
use crate::posting::{AdContent, AdSlot, SlotId};
use crate::prelude::*;
use crate::Result;
use chrono::prelude::*;
use sqlx_bat::prelude::*;
use teloxide::types::UserId;

const SLOT_COLUMNS: &str = "s.id, s.user_id, s.slot_number, s.content_text, s.content_message_id, \
    s.interval_minutes, s.last_sent_at, s.is_active, s.is_paused";

#[derive(sqlx::FromRow)]
struct AdSlotRecord {
    id: i64,
    user_id: i64,
    slot_number: i32,
    content_text: Option<String>,
    content_message_id: Option<i32>,
    interval_minutes: i32,
    last_sent_at: Option<DateTime<Utc>>,
    is_active: bool,
    is_paused: bool,
}

impl AdSlotRecord {
    fn try_into_app(self) -> Result<AdSlot> {
        let content = self.content_text.map(|text| -> Result<_> {
            Ok(AdContent {
                text,
                storage_message_id: self
                    .content_message_id
                    .map(|id| id.try_into_app())
                    .transpose()?,
            })
        });

        Ok(AdSlot {
            id: self.id.try_into_app()?,
            user_id: self.user_id.try_into_app()?,
            slot_number: self.slot_number,
            content: content.transpose()?,
            interval_minutes: self.interval_minutes,
            last_sent_at: self.last_sent_at,
            is_active: self.is_active,
            is_paused: self.is_paused,
        })
    }
}

type SlotsQuery<'q> =
    sqlx::query::QueryAs<'q, sqlx::Postgres, AdSlotRecord, sqlx::postgres::PgArguments>;

pub(crate) struct SlotsRepo {
    db: sqlx::PgPool,
}

impl SlotsRepo {
    pub(crate) fn new(db: sqlx::PgPool) -> Self {
        Self { db }
    }

    async fn fetch_all(&self, query: SlotsQuery<'_>) -> Result<Vec<AdSlot>> {
        query
            .fetch_all(&self.db)
            .await?
            .into_iter()
            .map(AdSlotRecord::try_into_app)
            .collect()
    }

    /// Slots that must be posted right now. Includes only the slots with
    /// content, at least one destination and the owner's subscription
    /// that hasn't lapsed.
    #[instrument(skip(self))]
    pub(crate) async fn due(&self, now: DateTime<Utc>) -> Result<Vec<AdSlot>> {
        let sql = format!(
            "select {SLOT_COLUMNS}
            from ad_slots s
            inner join users u on u.id = s.user_id
            where s.is_active
                and not s.is_paused
                and s.content_text is not null
                and u.subscription_expires_at > $1
                and (
                    s.last_sent_at is null
                    or s.last_sent_at + make_interval(mins => s.interval_minutes) <= $1
                )
                and exists (
                    select 1 from destinations d
                    where d.slot_id = s.id and d.is_active
                )
            order by s.last_sent_at nulls first, s.id"
        );

        self.fetch_all(sqlx::query_as(&sql).bind(now)).await
    }

    pub(crate) async fn list_for_user(&self, user: UserId) -> Result<Vec<AdSlot>> {
        let sql = format!(
            "select {SLOT_COLUMNS} from ad_slots s
            where s.user_id = $1
            order by s.slot_number"
        );

        self.fetch_all(sqlx::query_as(&sql).bind(user.try_into_db()?))
            .await
    }

    /// Active slot of the user by its user-facing number
    pub(crate) async fn get_by_number(&self, user: UserId, slot_number: i32) -> Result<AdSlot> {
        let sql = format!(
            "select {SLOT_COLUMNS} from ad_slots s
            where s.user_id = $1 and s.slot_number = $2 and s.is_active"
        );

        sqlx::query_as::<_, AdSlotRecord>(&sql)
            .bind(user.try_into_db()?)
            .bind(slot_number)
            .fetch_optional(&self.db)
            .await?
            .ok_or_else(|| err!(UserError::SlotNotFound { slot_number }))?
            .try_into_app()
    }

    pub(crate) async fn set_content(&self, slot: SlotId, content: &AdContent) -> Result {
        sqlx::query(
            "update ad_slots set content_text = $2, content_message_id = $3
            where id = $1",
        )
        .bind(slot.into_db())
        .bind(&content.text)
        .bind(content.storage_message_id.map(|id| id.into_db()))
        .execute(&self.db)
        .await?;

        Ok(())
    }

    pub(crate) async fn set_interval(&self, slot: SlotId, interval_minutes: i32) -> Result {
        sqlx::query("update ad_slots set interval_minutes = $2 where id = $1")
            .bind(slot.into_db())
            .bind(interval_minutes)
            .execute(&self.db)
            .await?;

        Ok(())
    }

    pub(crate) async fn set_paused(&self, slot: SlotId, is_paused: bool) -> Result {
        sqlx::query("update ad_slots set is_paused = $2 where id = $1")
            .bind(slot.into_db())
            .bind(is_paused)
            .execute(&self.db)
            .await?;

        Ok(())
    }

    pub(crate) async fn stamp_sent(&self, slot: SlotId, at: DateTime<Utc>) -> Result {
        sqlx::query("update ad_slots set last_sent_at = $2 where id = $1")
            .bind(slot.into_db())
            .bind(at)
            .execute(&self.db)
            .await?;

        Ok(())
    }

    /// Deactivates the slots of the users whose subscription has expired
    pub(crate) async fn deactivate_lapsed(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "update ad_slots s set is_active = false
            from users u
            where u.id = s.user_id
                and s.is_active
                and (u.subscription_expires_at is null or u.subscription_expires_at <= $1)",
        )
        .bind(now)
        .execute(&self.db)
        .await?;

        Ok(result.rows_affected())
    }

    pub(crate) async fn count_active(&self) -> Result<i64> {
        sqlx::query_scalar("select count(*) from ad_slots where is_active and not is_paused")
            .fetch_one(&self.db)
            .await
            .map_err(Into::into)
    }
}
