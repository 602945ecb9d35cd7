use super::WorkerId;
use chrono::prelude::*;
use serde::Serialize;
use std::collections::HashSet;
use teloxide::types::ChatId;

/// Anti-ban limits that all workers share
#[derive(Debug, Clone)]
pub(crate) struct Limits {
    pub(crate) cooldown: chrono::Duration,
    pub(crate) max_hourly_posts: u32,
    pub(crate) max_daily_posts: u32,
    pub(crate) max_consecutive_failures: u32,
    pub(crate) unhealthy_cooldown: chrono::Duration,
}

/// Everything we know about the worker except its messaging client.
/// This is the state that is persisted in the database.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub(crate) struct WorkerState {
    pub(crate) id: WorkerId,

    pub(crate) hourly_posts: u32,
    pub(crate) hour_started_at: Option<DateTime<Utc>>,

    pub(crate) daily_posts: u32,
    pub(crate) day_started_at: Option<DateTime<Utc>>,

    pub(crate) last_used_at: Option<DateTime<Utc>>,

    pub(crate) cooldown_until: Option<DateTime<Utc>>,
    pub(crate) cooldown_reason: Option<String>,

    /// The worker can't be used anywhere, e.g. its token was revoked
    pub(crate) is_banned: bool,
    pub(crate) banned_chats: HashSet<ChatId>,

    pub(crate) is_healthy: bool,
    pub(crate) last_error: Option<String>,

    /// Not persisted, it starts from zero after the restart
    #[serde(skip)]
    pub(crate) consecutive_failures: u32,
}

impl WorkerState {
    pub(crate) fn new(id: WorkerId) -> Self {
        Self {
            id,
            hourly_posts: 0,
            hour_started_at: None,
            daily_posts: 0,
            day_started_at: None,
            last_used_at: None,
            cooldown_until: None,
            cooldown_reason: None,
            is_banned: false,
            banned_chats: HashSet::new(),
            is_healthy: true,
            last_error: None,
            consecutive_failures: 0,
        }
    }

    pub(crate) fn is_cooling_down(&self, now: DateTime<Utc>) -> bool {
        matches!(self.cooldown_until, Some(until) if now < until)
    }

    pub(crate) fn hourly_posts_at(&self, now: DateTime<Utc>) -> u32 {
        posts_in_window(
            self.hourly_posts,
            self.hour_started_at,
            chrono::Duration::hours(1),
            now,
        )
    }

    pub(crate) fn daily_posts_at(&self, now: DateTime<Utc>) -> u32 {
        posts_in_window(
            self.daily_posts,
            self.day_started_at,
            chrono::Duration::days(1),
            now,
        )
    }

    /// Checks if the worker may be used right now. If `chat` is specified,
    /// then the worker must also not be banned in that chat.
    pub(crate) fn is_eligible(&self, limits: &Limits, chat: Option<ChatId>, now: DateTime<Utc>) -> bool {
        !self.is_banned
            && self.is_healthy
            && !self.is_cooling_down(now)
            && self.hourly_posts_at(now) < limits.max_hourly_posts
            && self.daily_posts_at(now) < limits.max_daily_posts
            && chat.map_or(true, |chat| !self.banned_chats.contains(&chat))
    }

    pub(crate) fn mark_used(&mut self, limits: &Limits, now: DateTime<Utc>) {
        self.hourly_posts = self.hourly_posts_at(now) + 1;
        if self.hourly_posts == 1 {
            self.hour_started_at = Some(now);
        }

        self.daily_posts = self.daily_posts_at(now) + 1;
        if self.daily_posts == 1 {
            self.day_started_at = Some(now);
        }

        self.last_used_at = Some(now);
        self.extend_cooldown(now + limits.cooldown, "cooldown after a post");
    }

    /// Moves the cooldown forward. It never shortens the existing cooldown.
    pub(crate) fn extend_cooldown(&mut self, until: DateTime<Utc>, reason: &str) {
        if matches!(self.cooldown_until, Some(current) if current >= until) {
            return;
        }
        self.cooldown_until = Some(until);
        self.cooldown_reason = Some(reason.to_owned());
    }

    pub(crate) fn record_success(&mut self) {
        self.consecutive_failures = 0;
    }

    /// Returns `true` if the worker became unhealthy because of this failure
    pub(crate) fn record_failure(&mut self, limits: &Limits, reason: &str, now: DateTime<Utc>) -> bool {
        self.last_error = Some(reason.to_owned());
        self.consecutive_failures += 1;

        if !self.is_healthy || self.consecutive_failures < limits.max_consecutive_failures {
            return false;
        }

        self.is_healthy = false;
        self.extend_cooldown(now + limits.unhealthy_cooldown, "too many failures in a row");
        true
    }

    /// Gives an unhealthy worker another chance once its cooldown is over.
    /// Returns `true` if the worker was revived.
    pub(crate) fn try_revive(&mut self, now: DateTime<Utc>) -> bool {
        if self.is_healthy || self.is_banned || self.is_cooling_down(now) {
            return false;
        }
        self.is_healthy = true;
        self.consecutive_failures = 0;
        true
    }
}

fn posts_in_window(
    posts: u32,
    window_start: Option<DateTime<Utc>>,
    window: chrono::Duration,
    now: DateTime<Utc>,
) -> u32 {
    match window_start {
        Some(start) if now - start < window => posts,
        _ => 0,
    }
}
