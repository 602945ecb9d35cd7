use crate::workers::WorkerId;
use chrono::prelude::*;
use serde::Serialize;
use std::fmt;
use teloxide::types::{ChatId, MessageId, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub(crate) struct SlotId(pub(crate) i64);

sqlx_bat::impl_into_db_via_newtype!(SlotId(i64));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub(crate) struct DestinationId(pub(crate) i64);

sqlx_bat::impl_into_db_via_newtype!(DestinationId(i64));

impl fmt::Display for DestinationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// The message that is posted by the slot
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub(crate) struct AdContent {
    /// Text (or caption) of the ad. It is what gets posted when there is no
    /// stored message, otherwise it is used only as a preview.
    pub(crate) text: String,

    /// Copy of the original message in the content storage chat
    pub(crate) storage_message_id: Option<MessageId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub(crate) struct AdSlot {
    pub(crate) id: SlotId,
    pub(crate) user_id: UserId,
    pub(crate) slot_number: i32,
    pub(crate) content: Option<AdContent>,
    pub(crate) interval_minutes: i32,
    pub(crate) last_sent_at: Option<DateTime<Utc>>,

    /// Controlled by the subscription of the owner
    pub(crate) is_active: bool,

    /// Controlled by the owner
    pub(crate) is_paused: bool,
}

impl AdSlot {
    pub(crate) fn interval(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.interval_minutes.into())
    }

    /// The moment when the slot may be posted again. `None` means it was never
    /// posted, so it is due right away.
    pub(crate) fn next_post_at(&self) -> Option<DateTime<Utc>> {
        self.last_sent_at.map(|last| last + self.interval())
    }

    /// The slot is due if it is enabled, has content and a full interval
    /// passed since the last successful post
    pub(crate) fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.is_active
            && !self.is_paused
            && self.content.is_some()
            && self.next_post_at().map_or(true, |next| now >= next)
    }

    pub(crate) fn status(&self) -> SlotStatus {
        if !self.is_active {
            SlotStatus::Inactive
        } else if self.is_paused {
            SlotStatus::Paused
        } else if self.content.is_none() {
            SlotStatus::NoContent
        } else {
            SlotStatus::Running
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub(crate) enum SlotStatus {
    #[strum(serialize = "▶️ running")]
    Running,

    #[strum(serialize = "⏸ paused")]
    Paused,

    #[strum(serialize = "📝 no content")]
    NoContent,

    #[strum(serialize = "⛔ inactive")]
    Inactive,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub(crate) struct Destination {
    pub(crate) id: DestinationId,
    pub(crate) slot_id: SlotId,
    pub(crate) chat_id: ChatId,
    pub(crate) alias: String,
}

/// Single attempt to post a slot to a destination
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PostingRecord {
    pub(crate) slot_id: SlotId,
    pub(crate) destination_id: DestinationId,
    pub(crate) chat_id: ChatId,
    pub(crate) worker_id: Option<WorkerId>,
    pub(crate) succeeded: bool,
    pub(crate) error: Option<String>,
    pub(crate) attempted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct SlotOutcome {
    pub(crate) successes: u32,
    pub(crate) failures: u32,

    /// Whether `last_sent_at` of the slot was updated
    pub(crate) stamped: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct CycleReport {
    pub(crate) slots: u32,
    pub(crate) successes: u32,
    pub(crate) failures: u32,

    /// Slots that couldn't be processed at all
    pub(crate) slot_errors: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot(last_sent_minutes_ago: Option<i64>, now: DateTime<Utc>) -> AdSlot {
        AdSlot {
            id: SlotId(1),
            user_id: UserId(1),
            slot_number: 1,
            content: Some(AdContent {
                text: "ad".to_owned(),
                storage_message_id: None,
            }),
            interval_minutes: 60,
            last_sent_at: last_sent_minutes_ago.map(|ago| now - chrono::Duration::minutes(ago)),
            is_active: true,
            is_paused: false,
        }
    }

    #[test]
    fn due_only_after_full_interval() {
        let now = Utc::now();

        assert!(slot(Some(61), now).is_due(now));
        assert!(slot(Some(60), now).is_due(now));
        assert!(!slot(Some(30), now).is_due(now));
        assert!(slot(None, now).is_due(now));
    }

    #[test]
    fn disabled_slots_are_never_due() {
        let now = Utc::now();

        let paused = AdSlot {
            is_paused: true,
            ..slot(None, now)
        };
        let inactive = AdSlot {
            is_active: false,
            ..slot(None, now)
        };
        let empty = AdSlot {
            content: None,
            ..slot(None, now)
        };

        assert!(!paused.is_due(now));
        assert!(!inactive.is_due(now));
        assert!(!empty.is_due(now));

        assert_eq!(paused.status(), SlotStatus::Paused);
        assert_eq!(inactive.status(), SlotStatus::Inactive);
        assert_eq!(empty.status(), SlotStatus::NoContent);
    }
}
