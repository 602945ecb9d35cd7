use super::constraints;
use crate::payments::{Completion, Payment, PaymentId, PaymentStatus};
use crate::prelude::*;
use crate::Result;
use chrono::prelude::*;
use sqlx_bat::prelude::*;
use std::collections::HashSet;

const PAYMENT_COLUMNS: &str = "id, user_id, tier, crypto, amount_crypto, amount_usd, \
    pay_to_address, status, created_at, expires_at, completed_at, tx_hash";

#[derive(sqlx::FromRow)]
struct PaymentRecord {
    id: String,
    user_id: i64,
    tier: i16,
    crypto: i16,
    amount_crypto: f64,
    amount_usd: f64,
    pay_to_address: String,
    status: i16,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    tx_hash: Option<String>,
}

impl PaymentRecord {
    fn try_into_app(self) -> Result<Payment> {
        Ok(Payment {
            id: self.id.try_into_app()?,
            user_id: self.user_id.try_into_app()?,
            tier: self.tier.try_into_app()?,
            crypto: self.crypto.try_into_app()?,
            amount_crypto: self.amount_crypto,
            amount_usd: self.amount_usd,
            pay_to_address: self.pay_to_address,
            status: self.status.try_into_app()?,
            created_at: self.created_at,
            expires_at: self.expires_at,
            completed_at: self.completed_at,
            tx_hash: self.tx_hash,
        })
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub(crate) struct PaymentStats {
    pub(crate) completed: i64,
    pub(crate) revenue_usd: f64,
}

pub(crate) struct PaymentsRepo {
    db: sqlx::PgPool,
}

impl PaymentsRepo {
    pub(crate) fn new(db: sqlx::PgPool) -> Self {
        Self { db }
    }

    #[instrument(skip_all, fields(payment = %payment.id))]
    pub(crate) async fn insert(&self, payment: &Payment) -> Result {
        let mut tx = self.db.begin().await?;

        let user_id = payment.user_id.try_into_db()?;

        // The user may have skipped `/start`
        sqlx::query("insert into users (id) values ($1) on conflict (id) do nothing")
            .bind(user_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            "insert into payments (
                id, user_id, tier, crypto, amount_crypto, amount_usd,
                pay_to_address, status, created_at, expires_at
            )
            values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(payment.id.clone().into_db())
        .bind(user_id)
        .bind(payment.tier.try_into_db()?)
        .bind(payment.crypto.try_into_db()?)
        .bind(payment.amount_crypto)
        .bind(payment.amount_usd)
        .bind(&payment.pay_to_address)
        .bind(payment.status.try_into_db()?)
        .bind(payment.created_at)
        .bind(payment.expires_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(())
    }

    pub(crate) async fn get(&self, id: &PaymentId) -> Result<Option<Payment>> {
        let sql = format!("select {PAYMENT_COLUMNS} from payments where id = $1");

        sqlx::query_as::<_, PaymentRecord>(&sql)
            .bind(&id.0)
            .fetch_optional(&self.db)
            .await?
            .map(PaymentRecord::try_into_app)
            .transpose()
    }

    pub(crate) async fn pending(&self) -> Result<Vec<Payment>> {
        let sql = format!(
            "select {PAYMENT_COLUMNS} from payments
            where status = $1
            order by created_at"
        );

        sqlx::query_as::<_, PaymentRecord>(&sql)
            .bind(PaymentStatus::Pending.try_into_db()?)
            .fetch_all(&self.db)
            .await?
            .into_iter()
            .map(PaymentRecord::try_into_app)
            .collect()
    }

    pub(crate) async fn claimed_tx_hashes(&self, hashes: &[String]) -> Result<HashSet<String>> {
        if hashes.is_empty() {
            return Ok(HashSet::new());
        }

        let claimed: Vec<String> =
            sqlx::query_scalar("select tx_hash from payments where tx_hash = any($1)")
                .bind(hashes)
                .fetch_all(&self.db)
                .await?;

        Ok(claimed.into_iter().collect())
    }

    pub(crate) async fn expire(&self, id: &PaymentId) -> Result<bool> {
        let result = sqlx::query("update payments set status = $2 where id = $1 and status = $3")
            .bind(&id.0)
            .bind(PaymentStatus::Expired.try_into_db()?)
            .bind(PaymentStatus::Pending.try_into_db()?)
            .execute(&self.db)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    pub(crate) async fn expire_overdue(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "update payments set status = $2
            where status = $3 and expires_at < $1",
        )
        .bind(now)
        .bind(PaymentStatus::Expired.try_into_db()?)
        .bind(PaymentStatus::Pending.try_into_db()?)
        .execute(&self.db)
        .await?;

        Ok(result.rows_affected())
    }

    /// Completes the pending payment, prolongs the subscription and brings
    /// the ad slots of the purchased tier to life. Slots above the tier's
    /// limit are deactivated. Nothing changes if the payment isn't pending
    /// anymore or the transaction has already paid for another payment.
    #[instrument(skip_all, fields(payment = %completion.payment.id))]
    pub(crate) async fn complete(&self, completion: &Completion<'_>) -> Result<Option<DateTime<Utc>>> {
        let payment = completion.payment;
        let user_id = payment.user_id.try_into_db()?;

        let mut tx = self.db.begin().await?;

        let completed = sqlx::query(
            "update payments set status = $2, completed_at = $3, tx_hash = $4
            where id = $1 and status = $5",
        )
        .bind(&payment.id.0)
        .bind(PaymentStatus::Completed.try_into_db()?)
        .bind(completion.completed_at)
        .bind(completion.tx_hash)
        .bind(PaymentStatus::Pending.try_into_db()?)
        .execute(&mut *tx)
        .await;

        let completed = match completed {
            Ok(result) => result.rows_affected(),
            Err(err) if err.is_constraint_violation(constraints::payments_tx_hash_uq) => {
                warn!(
                    tx_hash = completion.tx_hash,
                    "Transaction has already paid for another payment"
                );
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        };

        if completed == 0 {
            return Ok(None);
        }

        let expires_at: DateTime<Utc> = sqlx::query_scalar(
            "insert into users (id, subscription_tier, subscription_expires_at)
            values ($1, $2, $3 + $4 * interval '1 second')
            on conflict (id) do update set
                subscription_tier = excluded.subscription_tier,
                subscription_expires_at =
                    greatest(coalesce(users.subscription_expires_at, $3), $3)
                    + $4 * interval '1 second',
                updated_at = now()
            returning subscription_expires_at",
        )
        .bind(user_id)
        .bind(payment.tier.try_into_db()?)
        .bind(completion.completed_at)
        .bind(completion.subscription_length.num_seconds() as f64)
        .fetch_one(&mut *tx)
        .await?;

        let slots = payment.tier.slots();

        sqlx::query(
            "insert into ad_slots (user_id, slot_number)
            select $1, slot_number from generate_series(1, $2) as slot_number
            on conflict (user_id, slot_number) do update set is_active = true",
        )
        .bind(user_id)
        .bind(slots)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "update ad_slots set is_active = false
            where user_id = $1 and slot_number > $2",
        )
        .bind(user_id)
        .bind(slots)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(Some(expires_at))
    }

    pub(crate) async fn stats_since(&self, since: DateTime<Utc>) -> Result<PaymentStats> {
        let (completed, revenue_usd) = sqlx::query_as::<_, (i64, f64)>(
            "select count(*), coalesce(sum(amount_usd), 0)::float8
            from payments
            where status = $2 and completed_at >= $1",
        )
        .bind(since)
        .bind(PaymentStatus::Completed.try_into_db()?)
        .fetch_one(&self.db)
        .await?;

        Ok(PaymentStats {
            completed,
            revenue_usd,
        })
    }
}
