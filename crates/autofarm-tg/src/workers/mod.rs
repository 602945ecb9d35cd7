//! Pool of secondary accounts that actually post the ads. Spreading the
//! posts over several accounts keeps each of them under the rate limits.

mod client;
mod pool;
mod state;

use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSeconds};
use std::fmt;
use std::time::Duration;
use teloxide::types::ChatId;

pub(crate) use client::*;
pub(crate) use pool::*;
pub(crate) use state::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub(crate) struct WorkerId(pub(crate) i32);

sqlx_bat::impl_into_db_via_newtype!(WorkerId(i32));

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[serde_as]
#[derive(Deserialize)]
pub(crate) struct Config {
    /// JSON array of bot tokens of the worker accounts. The worker id is
    /// the 1-based position of the token in this array, so the order
    /// must be preserved between restarts.
    #[serde_as(as = "serde_with::json::JsonString")]
    pub(crate) tokens: Vec<String>,

    /// Minimal pause between two posts made by the same worker
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "default_cooldown")]
    pub(crate) cooldown: Duration,

    #[serde(default = "default_max_hourly_posts")]
    pub(crate) max_hourly_posts: u32,

    #[serde(default = "default_max_daily_posts")]
    pub(crate) max_daily_posts: u32,

    #[serde(default = "default_max_consecutive_failures")]
    pub(crate) max_consecutive_failures: u32,

    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "default_unhealthy_cooldown")]
    pub(crate) unhealthy_cooldown: Duration,
}

fn default_cooldown() -> Duration {
    Duration::from_secs(2 * 60)
}

fn default_max_hourly_posts() -> u32 {
    20
}

fn default_max_daily_posts() -> u32 {
    100
}

fn default_max_consecutive_failures() -> u32 {
    5
}

fn default_unhealthy_cooldown() -> Duration {
    Duration::from_secs(60 * 60)
}

impl Config {
    pub(crate) fn limits(&self) -> Limits {
        Limits {
            cooldown: to_chrono(self.cooldown),
            max_hourly_posts: self.max_hourly_posts,
            max_daily_posts: self.max_daily_posts,
            max_consecutive_failures: self.max_consecutive_failures,
            unhealthy_cooldown: to_chrono(self.unhealthy_cooldown),
        }
    }
}

/// Converts the duration saturating at a hundred years, so that adding it to
/// the current time never overflows
pub(crate) fn to_chrono(duration: Duration) -> chrono::Duration {
    let max = chrono::Duration::days(365 * 100);
    chrono::Duration::from_std(duration)
        .ok()
        .filter(|duration| *duration <= max)
        .unwrap_or(max)
}

/// Result of a single attempt to post an ad to a chat. Posting never fails
/// with an error, all failures are described by this enum instead.
#[derive(Debug, Clone, PartialEq, Eq, strum::IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub(crate) enum PostOutcome {
    Sent,
    FloodWait(Duration),
    Banned(String),
    Failed(String),
}

impl PostOutcome {
    pub(crate) fn is_success(&self) -> bool {
        matches!(self, Self::Sent)
    }

    pub(crate) fn kind(&self) -> &'static str {
        self.into()
    }

    pub(crate) fn error_message(&self) -> Option<String> {
        match self {
            Self::Sent => None,
            Self::FloodWait(wait) => Some(format!("flood wait for {}s", wait.as_secs())),
            Self::Banned(reason) => Some(format!("banned: {reason}")),
            Self::Failed(reason) => Some(reason.clone()),
        }
    }
}

/// Persistence of the worker pool state. It lets the anti-ban bookkeeping
/// survive restarts.
#[async_trait]
pub(crate) trait WorkerStore: Send + Sync {
    async fn load_workers(&self) -> Result<Vec<WorkerState>>;

    /// Upserts the worker row and its cooldown
    async fn save_worker(&self, worker: &WorkerState) -> Result;

    async fn save_chat_ban(&self, worker: WorkerId, chat: ChatId, reason: &str) -> Result;
}
