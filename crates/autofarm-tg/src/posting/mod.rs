//! Auto-poster. It takes the ad slots that are due, and distributes them
//! over their destinations using the worker pool.

mod model;

use crate::error::fatal;
use crate::observability::metrics;
use crate::prelude::*;
use crate::util::retry::FixedRetry;
use crate::workers::{PostOutcome, WorkerPool};
use crate::Result;
use async_trait::async_trait;
use chrono::prelude::*;
use rand::Rng;
use serde::Deserialize;
use serde_with::{serde_as, DurationSeconds};
use std::sync::Arc;
use std::time::Duration;

pub(crate) use model::*;

/// Error message that is recorded in the history when no worker could
/// take the post
const NO_WORKER_AVAILABLE: &str = "no worker available";

#[serde_as]
#[derive(Deserialize, Clone)]
pub(crate) struct Config {
    /// Lower bound of the random delay between posts to different destinations
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "default_min_post_delay")]
    pub(crate) min_post_delay: Duration,

    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "default_max_post_delay")]
    pub(crate) max_post_delay: Duration,

    /// Attempts for the slot-level storage operations
    #[serde(default = "default_retry_attempts")]
    pub(crate) retry_attempts: u32,

    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "default_retry_backoff")]
    pub(crate) retry_backoff: Duration,
}

fn default_min_post_delay() -> Duration {
    Duration::from_secs(20)
}

fn default_max_post_delay() -> Duration {
    Duration::from_secs(60)
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_backoff() -> Duration {
    Duration::from_secs(5)
}

impl Config {
    fn retry(&self) -> FixedRetry {
        FixedRetry {
            attempts: self.retry_attempts.max(1),
            backoff: self.retry_backoff,
        }
    }

    fn random_post_delay(&self) -> Duration {
        if self.max_post_delay <= self.min_post_delay {
            return self.min_post_delay;
        }
        rand::thread_rng().gen_range(self.min_post_delay..=self.max_post_delay)
    }
}

/// Storage operations the auto-poster depends on
#[async_trait]
pub(crate) trait PostingStore: Send + Sync {
    /// Slots that are active, not paused, have content, belong to a user with
    /// an unexpired subscription, have at least one active destination and
    /// whose interval has passed since the last successful post.
    async fn due_slots(&self, now: DateTime<Utc>) -> Result<Vec<AdSlot>>;

    async fn active_destinations(&self, slot: SlotId) -> Result<Vec<Destination>>;

    async fn record_attempt(&self, record: &PostingRecord) -> Result;

    async fn stamp_sent(&self, slot: SlotId, at: DateTime<Utc>) -> Result;

    /// Deactivates the slots of the users whose subscription has expired.
    /// Returns the number of deactivated slots.
    async fn deactivate_lapsed_slots(&self, now: DateTime<Utc>) -> Result<u64>;
}

pub(crate) struct AutoPoster {
    store: Arc<dyn PostingStore>,
    workers: Arc<WorkerPool>,
    cfg: Config,
}

impl AutoPoster {
    pub(crate) fn new(store: Arc<dyn PostingStore>, workers: Arc<WorkerPool>, cfg: Config) -> Self {
        Self {
            store,
            workers,
            cfg,
        }
    }

    pub(crate) async fn get_ads_to_send(&self, now: DateTime<Utc>) -> Result<Vec<AdSlot>> {
        let slots = self.store.due_slots(now).await?;

        // The storage query already applies the same condition, but it must
        // never let through a slot that is not due
        let (due, not_due): (Vec<_>, Vec<_>) =
            slots.into_iter().partition(|slot| slot.is_due(now));

        if !not_due.is_empty() {
            warn!(
                slots = ?not_due.iter().map(|slot| slot.id.0).collect::<Vec<_>>(),
                "Storage returned slots that are not due, skipping them"
            );
        }

        Ok(due)
    }

    /// Processes all due slots one by one
    #[instrument(skip(self))]
    pub(crate) async fn run_cycle(&self) -> Result<CycleReport> {
        let slots = self.get_ads_to_send(Utc::now()).await?;

        info!(slots = slots.len(), "Starting the posting cycle");

        let mut report = CycleReport::default();

        for slot in &slots {
            report.slots += 1;
            match self.process_ad_slot(slot).await {
                Ok(outcome) => {
                    report.successes += outcome.successes;
                    report.failures += outcome.failures;
                }
                Err(err) => {
                    report.slot_errors += 1;
                    error!(
                        slot = slot.id.0,
                        err = tracing_err(&err),
                        "Failed to process the ad slot"
                    );
                }
            }
        }

        info!(?report, "Posting cycle finished");

        Ok(report)
    }

    /// Posts the slot to each of its active destinations. The slot is stamped
    /// as sent only if at least one post succeeded.
    #[instrument(skip_all, fields(slot = slot.id.0, user = slot.user_id.0))]
    pub(crate) async fn process_ad_slot(&self, slot: &AdSlot) -> Result<SlotOutcome> {
        let content = slot
            .content
            .as_ref()
            .ok_or_else(|| fatal!("Ad slot {} has no content to post", slot.id.0))?;

        let retry = self.cfg.retry();

        let destinations = retry
            .run("load destinations", || self.store.active_destinations(slot.id))
            .await?;

        let mut outcome = SlotOutcome::default();

        for (i, destination) in destinations.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(self.cfg.random_post_delay()).await;
            }

            let succeeded = self.post_to_destination(slot, content, destination).await;

            if succeeded {
                outcome.successes += 1;
            } else {
                outcome.failures += 1;
            }
        }

        if outcome.successes == 0 {
            info!(?outcome, "No successful posts, the slot is not stamped");
            return Ok(outcome);
        }

        let now = Utc::now();
        retry
            .run("stamp the slot", || self.store.stamp_sent(slot.id, now))
            .await?;

        outcome.stamped = true;

        info!(?outcome, "Ad slot processed");

        Ok(outcome)
    }

    async fn post_to_destination(
        &self,
        slot: &AdSlot,
        content: &AdContent,
        destination: &Destination,
    ) -> bool {
        let now = Utc::now();

        let (worker_id, outcome) = match self.workers.get_available_worker_for(destination.chat_id, now) {
            Some(worker) => {
                let outcome = self
                    .workers
                    .post_message(worker, destination.chat_id, content)
                    .await;
                (Some(worker), outcome)
            }
            None => {
                warn!(
                    destination = destination.id.0,
                    "No worker is available for the destination"
                );
                metrics::posts_total("no_worker").increment(1);
                (None, PostOutcome::Failed(NO_WORKER_AVAILABLE.to_owned()))
            }
        };

        let record = PostingRecord {
            slot_id: slot.id,
            destination_id: destination.id,
            chat_id: destination.chat_id,
            worker_id,
            succeeded: outcome.is_success(),
            error: outcome.error_message(),
            attempted_at: now,
        };

        // The post already happened at this point, so a lost history record
        // must not prevent stamping the slot
        if let Err(err) = self.store.record_attempt(&record).await {
            warn!(
                destination = destination.id.0,
                err = tracing_err(&err),
                "Failed to record the posting attempt"
            );
        }

        record.succeeded
    }

    /// Deactivates slots of the users with lapsed subscriptions
    pub(crate) async fn cleanup(&self, now: DateTime<Utc>) -> Result<u64> {
        let deactivated = self.store.deactivate_lapsed_slots(now).await?;
        if deactivated > 0 {
            info!(deactivated, "Deactivated slots of lapsed subscriptions");
        }
        Ok(deactivated)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::workers::tests::{limits, pool_of, FakeClient, InMemoryWorkerStore};
    use crate::workers::{Limits, SendError, WorkerId};
    use parking_lot::Mutex as SyncMutex;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use teloxide::types::{ChatId, UserId};

    #[derive(Default)]
    pub(crate) struct InMemoryPostingStore {
        pub(crate) slots: SyncMutex<Vec<AdSlot>>,
        pub(crate) destinations: SyncMutex<Vec<Destination>>,
        pub(crate) history: SyncMutex<Vec<PostingRecord>>,
        pub(crate) failing_destination_loads: AtomicU32,
        pub(crate) failing_due_slots: AtomicBool,

        /// Subscription expiry of the slot owners. Owners that aren't
        /// listed here are subscribed forever.
        pub(crate) subscriptions: SyncMutex<HashMap<UserId, DateTime<Utc>>>,
    }

    impl InMemoryPostingStore {
        fn is_subscribed(&self, user: UserId, now: DateTime<Utc>) -> bool {
            self.subscriptions
                .lock()
                .get(&user)
                .map_or(true, |expires_at| *expires_at > now)
        }
    }

    #[async_trait]
    impl PostingStore for InMemoryPostingStore {
        async fn due_slots(&self, now: DateTime<Utc>) -> Result<Vec<AdSlot>> {
            if self.failing_due_slots.load(Ordering::SeqCst) {
                return Err(fatal!("connection reset"));
            }

            let destinations = self.destinations.lock();
            let slots = self
                .slots
                .lock()
                .iter()
                .filter(|slot| slot.is_due(now))
                .filter(|slot| self.is_subscribed(slot.user_id, now))
                .filter(|slot| destinations.iter().any(|dest| dest.slot_id == slot.id))
                .cloned()
                .collect();
            Ok(slots)
        }

        async fn active_destinations(&self, slot: SlotId) -> Result<Vec<Destination>> {
            let remaining_failures = self.failing_destination_loads.load(Ordering::SeqCst);
            if remaining_failures > 0 {
                self.failing_destination_loads
                    .store(remaining_failures - 1, Ordering::SeqCst);
                return Err(fatal!("connection reset"));
            }

            let destinations = self
                .destinations
                .lock()
                .iter()
                .filter(|dest| dest.slot_id == slot)
                .cloned()
                .collect();
            Ok(destinations)
        }

        async fn record_attempt(&self, record: &PostingRecord) -> Result {
            self.history.lock().push(record.clone());
            Ok(())
        }

        async fn stamp_sent(&self, slot: SlotId, at: DateTime<Utc>) -> Result {
            let mut slots = self.slots.lock();
            let slot = slots
                .iter_mut()
                .find(|it| it.id == slot)
                .ok_or_else(|| fatal!("No slot {slot:?}"))?;
            slot.last_sent_at = Some(at);
            Ok(())
        }

        async fn deactivate_lapsed_slots(&self, now: DateTime<Utc>) -> Result<u64> {
            let mut deactivated = 0;
            for slot in self.slots.lock().iter_mut() {
                if slot.is_active && !self.is_subscribed(slot.user_id, now) {
                    slot.is_active = false;
                    deactivated += 1;
                }
            }
            Ok(deactivated)
        }
    }

    pub(crate) fn slot(id: i64, last_sent_at: Option<DateTime<Utc>>) -> AdSlot {
        AdSlot {
            id: SlotId(id),
            user_id: UserId(1),
            slot_number: 1,
            content: Some(AdContent {
                text: "Buy our stuff".to_owned(),
                storage_message_id: None,
            }),
            interval_minutes: 60,
            last_sent_at,
            is_active: true,
            is_paused: false,
        }
    }

    pub(crate) fn destination(id: i64, slot: i64) -> Destination {
        Destination {
            id: DestinationId(id),
            slot_id: SlotId(slot),
            chat_id: ChatId(-1000 - id),
            alias: format!("chat {id}"),
        }
    }

    pub(crate) fn cfg() -> Config {
        Config {
            min_post_delay: Duration::from_secs(20),
            max_post_delay: Duration::from_secs(60),
            retry_attempts: 3,
            retry_backoff: Duration::from_secs(5),
        }
    }

    fn no_cooldown() -> Limits {
        Limits {
            cooldown: chrono::Duration::zero(),
            ..limits()
        }
    }

    fn poster(store: Arc<InMemoryPostingStore>, clients: Vec<Arc<FakeClient>>, limits: Limits) -> AutoPoster {
        let workers = pool_of(clients, limits, Arc::new(InMemoryWorkerStore::default()));
        AutoPoster::new(store, Arc::new(workers), cfg())
    }

    #[test_log::test(tokio::test)]
    async fn due_set_respects_interval() {
        let now = Utc::now();
        let store = Arc::new(InMemoryPostingStore::default());
        *store.slots.lock() = vec![
            slot(1, Some(now - chrono::Duration::minutes(61))),
            slot(2, Some(now - chrono::Duration::minutes(30))),
        ];
        *store.destinations.lock() = vec![destination(1, 1), destination(2, 2)];

        let poster = poster(store, vec![Default::default()], no_cooldown());

        let due: Vec<_> = poster
            .get_ads_to_send(now)
            .await
            .unwrap()
            .into_iter()
            .map(|slot| slot.id)
            .collect();

        assert_eq!(due, [SlotId(1)]);
    }

    #[test_log::test(tokio::test)]
    async fn lapsed_slots_are_skipped_and_deactivated() {
        let now = Utc::now();
        let store = Arc::new(InMemoryPostingStore::default());
        *store.slots.lock() = vec![
            slot(1, None),
            AdSlot {
                user_id: UserId(2),
                ..slot(2, None)
            },
        ];
        *store.destinations.lock() = vec![destination(1, 1), destination(2, 2)];
        store
            .subscriptions
            .lock()
            .insert(UserId(2), now - chrono::Duration::minutes(1));

        let poster = poster(store.clone(), vec![Default::default()], no_cooldown());

        let due: Vec<_> = poster
            .get_ads_to_send(now)
            .await
            .unwrap()
            .into_iter()
            .map(|slot| slot.id)
            .collect();
        assert_eq!(due, [SlotId(1)]);

        assert_eq!(poster.cleanup(now).await.unwrap(), 1);
        let active: Vec<_> = store.slots.lock().iter().map(|slot| slot.is_active).collect();
        assert_eq!(active, [true, false]);

        assert_eq!(poster.cleanup(now).await.unwrap(), 0);
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn stamps_slot_after_partial_success() {
        let store = Arc::new(InMemoryPostingStore::default());
        *store.slots.lock() = vec![slot(1, None)];
        *store.destinations.lock() = vec![destination(1, 1), destination(2, 1)];

        let client = FakeClient::scripted(vec![Err(SendError::Other("boom".to_owned())), Ok(())]);
        let poster = poster(store.clone(), vec![client], no_cooldown());

        let outcome = poster.process_ad_slot(&slot(1, None)).await.unwrap();

        assert_eq!(
            outcome,
            SlotOutcome {
                successes: 1,
                failures: 1,
                stamped: true
            }
        );
        assert!(store.slots.lock()[0].last_sent_at.is_some());

        let history = store.history.lock();
        assert_eq!(history.len(), 2);
        assert!(!history[0].succeeded);
        assert_eq!(history[0].error.as_deref(), Some("boom"));
        assert!(history[1].succeeded);
        assert_eq!(history[1].worker_id, Some(WorkerId(1)));
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn never_stamps_slot_without_successes() {
        let store = Arc::new(InMemoryPostingStore::default());
        *store.slots.lock() = vec![slot(1, None)];
        *store.destinations.lock() = vec![destination(1, 1), destination(2, 1)];

        let client = FakeClient::scripted(vec![
            Err(SendError::BannedInChat("kicked".to_owned())),
            Err(SendError::Other("boom".to_owned())),
        ]);
        let poster = poster(store.clone(), vec![client], no_cooldown());

        let outcome = poster.process_ad_slot(&slot(1, None)).await.unwrap();

        assert_eq!(outcome.successes, 0);
        assert!(!outcome.stamped);
        assert_eq!(store.slots.lock()[0].last_sent_at, None);
        assert_eq!(store.history.lock().len(), 2);
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn records_attempt_when_no_worker_is_available() {
        let store = Arc::new(InMemoryPostingStore::default());
        *store.slots.lock() = vec![slot(1, None)];
        *store.destinations.lock() = vec![destination(1, 1), destination(2, 1)];

        // The only worker cools down for 2 minutes after the first post
        let poster = poster(store.clone(), vec![Default::default()], limits());

        let outcome = poster.process_ad_slot(&slot(1, None)).await.unwrap();

        assert_eq!(outcome.successes, 1);
        assert_eq!(outcome.failures, 1);

        let history = store.history.lock();
        assert_eq!(history[1].worker_id, None);
        assert_eq!(history[1].error.as_deref(), Some(NO_WORKER_AVAILABLE));
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn retries_slot_level_storage_failures() {
        let store = Arc::new(InMemoryPostingStore::default());
        *store.slots.lock() = vec![slot(1, None)];
        *store.destinations.lock() = vec![destination(1, 1)];
        store.failing_destination_loads.store(2, Ordering::SeqCst);

        let poster = poster(store.clone(), vec![Default::default()], no_cooldown());

        let outcome = poster.process_ad_slot(&slot(1, None)).await.unwrap();
        assert!(outcome.stamped);

        store.failing_destination_loads.store(3, Ordering::SeqCst);
        let result = poster.process_ad_slot(&slot(1, None)).await;
        assert!(result.is_err());
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn cycle_processes_all_due_slots() {
        let now = Utc::now();
        let store = Arc::new(InMemoryPostingStore::default());
        *store.slots.lock() = vec![
            slot(1, None),
            slot(2, Some(now - chrono::Duration::minutes(90))),
            slot(3, Some(now - chrono::Duration::minutes(10))),
        ];
        *store.destinations.lock() = vec![destination(1, 1), destination(2, 2), destination(3, 3)];

        let poster = poster(
            store.clone(),
            vec![Default::default(), Default::default()],
            no_cooldown(),
        );

        let report = poster.run_cycle().await.unwrap();

        assert_eq!(
            report,
            CycleReport {
                slots: 2,
                successes: 2,
                failures: 0,
                slot_errors: 0,
            }
        );

        // The same slots are not due anymore right after the cycle
        let report = poster.run_cycle().await.unwrap();
        assert_eq!(report.slots, 0);
    }
}
