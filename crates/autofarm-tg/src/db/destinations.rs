use crate::error::{err, UserError};
use crate::posting::{AdSlot, Destination, DestinationId, SlotId};
use crate::prelude::*;
use crate::Result;
use sqlx_bat::prelude::*;
use teloxide::types::ChatId;

#[derive(sqlx::FromRow)]
struct DestinationRecord {
    id: i64,
    slot_id: i64,
    chat_id: i64,
    alias: String,
}

impl DestinationRecord {
    fn try_into_app(self) -> Result<Destination> {
        Ok(Destination {
            id: self.id.try_into_app()?,
            slot_id: self.slot_id.try_into_app()?,
            chat_id: self.chat_id.try_into_app()?,
            alias: self.alias,
        })
    }
}

pub(crate) struct DestinationsRepo {
    db: sqlx::PgPool,
}

impl DestinationsRepo {
    pub(crate) fn new(db: sqlx::PgPool) -> Self {
        Self { db }
    }

    /// Adds the chat to the slot. A previously removed destination is
    /// brought back.
    #[instrument(skip(self, slot), fields(slot = slot.id.0))]
    pub(crate) async fn add(&self, slot: &AdSlot, chat: ChatId, alias: &str) -> Result<DestinationId> {
        let id: Option<i64> = sqlx::query_scalar(
            "insert into destinations (slot_id, chat_id, alias) values ($1, $2, $3)
            on conflict (slot_id, chat_id) do update
            set is_active = true, alias = excluded.alias
            where not destinations.is_active
            returning id",
        )
        .bind(slot.id.into_db())
        .bind(chat.into_db())
        .bind(alias)
        .fetch_optional(&self.db)
        .await?;

        let id = id.ok_or_else(|| {
            err!(UserError::DestinationAlreadyExists {
                slot_number: slot.slot_number
            })
        })?;

        Ok(id.try_into_app()?)
    }

    pub(crate) async fn list_active(&self, slot: SlotId) -> Result<Vec<Destination>> {
        sqlx::query_as::<_, DestinationRecord>(
            "select id, slot_id, chat_id, alias from destinations
            where slot_id = $1 and is_active
            order by id",
        )
        .bind(slot.into_db())
        .fetch_all(&self.db)
        .await?
        .into_iter()
        .map(DestinationRecord::try_into_app)
        .collect()
    }

    /// Soft-deletes the destination. The posting history keeps referencing it.
    pub(crate) async fn deactivate(&self, slot: &AdSlot, destination: DestinationId) -> Result {
        let result = sqlx::query(
            "update destinations set is_active = false
            where id = $1 and slot_id = $2 and is_active",
        )
        .bind(destination.into_db())
        .bind(slot.id.into_db())
        .execute(&self.db)
        .await?;

        if result.rows_affected() == 0 {
            return Err(err!(UserError::DestinationNotFound {
                slot_number: slot.slot_number,
                destination_id: destination.0,
            }));
        }

        Ok(())
    }

    pub(crate) async fn count_active(&self) -> Result<i64> {
        sqlx::query_scalar("select count(*) from destinations where is_active")
            .fetch_one(&self.db)
            .await
            .map_err(Into::into)
    }
}
