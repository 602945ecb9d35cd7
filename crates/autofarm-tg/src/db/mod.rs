mod cfg;
mod constraints;
mod destinations;
mod error;
mod history;
mod payments;
mod slots;
mod users;
mod workers;

use crate::error::err_ctx;
use crate::payments::{Completion, Payment, PaymentId, PaymentStore};
use crate::posting::{AdSlot, Destination, PostingRecord, PostingStore, SlotId};
use crate::workers::{WorkerId, WorkerState, WorkerStore};
use crate::Result;
use async_trait::async_trait;
use chrono::prelude::*;
use sqlx::postgres::PgPoolOptions;
use std::collections::HashSet;
use teloxide::types::ChatId;

pub(crate) use cfg::*;
pub(crate) use destinations::*;
pub(crate) use error::*;
pub(crate) use history::*;
pub(crate) use payments::*;
pub(crate) use slots::*;
pub(crate) use users::*;
pub(crate) use workers::*;

pub(crate) struct Repo {
    pub(crate) users: UsersRepo,
    pub(crate) slots: SlotsRepo,
    pub(crate) destinations: DestinationsRepo,
    pub(crate) workers: WorkersRepo,
    pub(crate) history: PostingHistoryRepo,
    pub(crate) payments: PaymentsRepo,
}

pub(crate) async fn init(cfg: Config) -> Result<Repo> {
    let pool = PgPoolOptions::new()
        .max_connections(cfg.pool_size)
        // Verify that the connection is working early.
        // The connection created here can also be reused by the migrations down the road.
        // The default idle timeout should be enough for that.
        .connect(cfg.url.as_str())
        .await
        .map_err(err_ctx!(DbError::Connect))?;

    sqlx::migrate!()
        .run(&pool)
        .await
        .map_err(err_ctx!(DbError::Migrate))?;

    constraints::validate(pool.clone()).await?;

    Ok(Repo {
        users: UsersRepo::new(pool.clone()),
        slots: SlotsRepo::new(pool.clone()),
        destinations: DestinationsRepo::new(pool.clone()),
        workers: WorkersRepo::new(pool.clone()),
        history: PostingHistoryRepo::new(pool.clone()),
        payments: PaymentsRepo::new(pool),
    })
}

#[async_trait]
impl PostingStore for Repo {
    async fn due_slots(&self, now: DateTime<Utc>) -> Result<Vec<AdSlot>> {
        self.slots.due(now).await
    }

    async fn active_destinations(&self, slot: SlotId) -> Result<Vec<Destination>> {
        self.destinations.list_active(slot).await
    }

    async fn record_attempt(&self, record: &PostingRecord) -> Result {
        self.history.record(record).await
    }

    async fn stamp_sent(&self, slot: SlotId, at: DateTime<Utc>) -> Result {
        self.slots.stamp_sent(slot, at).await
    }

    async fn deactivate_lapsed_slots(&self, now: DateTime<Utc>) -> Result<u64> {
        self.slots.deactivate_lapsed(now).await
    }
}

#[async_trait]
impl WorkerStore for Repo {
    async fn load_workers(&self) -> Result<Vec<WorkerState>> {
        self.workers.load().await
    }

    async fn save_worker(&self, worker: &WorkerState) -> Result {
        self.workers.save(worker).await
    }

    async fn save_chat_ban(&self, worker: WorkerId, chat: ChatId, reason: &str) -> Result {
        self.workers.save_chat_ban(worker, chat, reason).await
    }
}

#[async_trait]
impl PaymentStore for Repo {
    async fn insert_payment(&self, payment: &Payment) -> Result {
        self.payments.insert(payment).await
    }

    async fn get_payment(&self, id: &PaymentId) -> Result<Option<Payment>> {
        self.payments.get(id).await
    }

    async fn pending_payments(&self) -> Result<Vec<Payment>> {
        self.payments.pending().await
    }

    async fn claimed_tx_hashes(&self, hashes: &[String]) -> Result<HashSet<String>> {
        self.payments.claimed_tx_hashes(hashes).await
    }

    async fn expire_payment(&self, id: &PaymentId) -> Result<bool> {
        self.payments.expire(id).await
    }

    async fn expire_overdue(&self, now: DateTime<Utc>) -> Result<u64> {
        self.payments.expire_overdue(now).await
    }

    async fn complete_payment(&self, completion: &Completion<'_>) -> Result<Option<DateTime<Utc>>> {
        self.payments.complete(completion).await
    }
}
