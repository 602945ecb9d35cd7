use crate::payments::Tier;
use crate::prelude::*;
use crate::Result;
use chrono::prelude::*;
use sqlx_bat::prelude::*;
use teloxide::types::UserId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Subscription {
    pub(crate) tier: Tier,
    pub(crate) expires_at: DateTime<Utc>,
}

impl Subscription {
    pub(crate) fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

#[derive(Debug, Clone)]
pub(crate) struct User {
    pub(crate) id: UserId,
    pub(crate) username: Option<String>,
    pub(crate) subscription: Option<Subscription>,
}

impl User {
    /// Subscription if it hasn't expired yet
    pub(crate) fn active_subscription(&self, now: DateTime<Utc>) -> Option<Subscription> {
        self.subscription.filter(|sub| sub.is_active(now))
    }
}

#[derive(sqlx::FromRow)]
struct UserRecord {
    id: i64,
    username: Option<String>,
    subscription_tier: Option<i16>,
    subscription_expires_at: Option<DateTime<Utc>>,
}

impl UserRecord {
    fn try_into_app(self) -> Result<User> {
        let subscription = match (self.subscription_tier, self.subscription_expires_at) {
            (Some(tier), Some(expires_at)) => Some(Subscription {
                tier: tier.try_into_app()?,
                expires_at,
            }),
            _ => None,
        };

        Ok(User {
            id: self.id.try_into_app()?,
            username: self.username,
            subscription,
        })
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct UserStats {
    pub(crate) total: i64,
    pub(crate) subscribed: i64,
}

pub(crate) struct UsersRepo {
    db: sqlx::PgPool,
}

impl UsersRepo {
    pub(crate) fn new(db: sqlx::PgPool) -> Self {
        Self { db }
    }

    /// Creates the user on the first contact and refreshes the username
    /// on the subsequent ones
    #[instrument(skip(self))]
    pub(crate) async fn register(&self, id: UserId, username: Option<&str>) -> Result<User> {
        sqlx::query_as::<_, UserRecord>(
            "insert into users (id, username) values ($1, $2)
            on conflict (id) do update
            set username = excluded.username, updated_at = now()
            returning id, username, subscription_tier, subscription_expires_at",
        )
        .bind(id.try_into_db()?)
        .bind(username)
        .fetch_one(&self.db)
        .await?
        .try_into_app()
    }

    pub(crate) async fn get(&self, id: UserId) -> Result<Option<User>> {
        sqlx::query_as::<_, UserRecord>(
            "select id, username, subscription_tier, subscription_expires_at
            from users where id = $1",
        )
        .bind(id.try_into_db()?)
        .fetch_optional(&self.db)
        .await?
        .map(UserRecord::try_into_app)
        .transpose()
    }

    pub(crate) async fn stats(&self, now: DateTime<Utc>) -> Result<UserStats> {
        let (total, subscribed) = sqlx::query_as::<_, (i64, i64)>(
            "select
                count(*),
                count(*) filter (where subscription_expires_at > $1)
            from users",
        )
        .bind(now)
        .fetch_one(&self.db)
        .await?;

        Ok(UserStats { total, subscribed })
    }
}
