use super::{Limits, PostOutcome, SendError, WorkerClient, WorkerId, WorkerState, WorkerStore};
use crate::observability::metrics;
use crate::posting::AdContent;
use crate::prelude::*;
use crate::Result;
use chrono::prelude::*;
use parking_lot::Mutex as SyncMutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use teloxide::types::ChatId;

pub(crate) struct WorkerPool {
    clients: BTreeMap<WorkerId, Arc<dyn WorkerClient>>,
    limits: Limits,
    store: Arc<dyn WorkerStore>,
    state: SyncMutex<PoolState>,
}

struct PoolState {
    /// Sorted by worker id
    workers: Vec<WorkerState>,

    /// Index of the worker that was returned by the selection last time.
    /// The next scan starts right after it.
    last_picked: Option<usize>,
}

impl WorkerPool {
    pub(crate) fn new(
        clients: BTreeMap<WorkerId, Arc<dyn WorkerClient>>,
        limits: Limits,
        store: Arc<dyn WorkerStore>,
    ) -> Self {
        let workers = clients.keys().copied().map(WorkerState::new).collect();
        Self {
            clients,
            limits,
            store,
            state: SyncMutex::new(PoolState {
                workers,
                last_picked: None,
            }),
        }
    }

    /// Loads the persisted cooldowns, counters and bans. Workers that were never
    /// persisted before get their rows created.
    #[instrument(skip_all)]
    pub(crate) async fn restore(&self) -> Result {
        let persisted: BTreeMap<_, _> = self
            .store
            .load_workers()
            .await?
            .into_iter()
            .map(|worker| (worker.id, worker))
            .collect();

        let fresh: Vec<_> = {
            let mut state = self.state.lock();
            state
                .workers
                .iter_mut()
                .filter_map(|worker| match persisted.get(&worker.id) {
                    Some(saved) => {
                        *worker = saved.clone();
                        None
                    }
                    None => Some(worker.clone()),
                })
                .collect()
        };

        for worker in &fresh {
            self.store.save_worker(worker).await?;
        }

        let unknown = persisted
            .keys()
            .filter(|id| !self.clients.contains_key(id))
            .count();

        info!(
            restored = persisted.len() - unknown,
            created = fresh.len(),
            unknown,
            "Restored the worker pool state"
        );

        Ok(())
    }

    /// Returns a worker that may post right now, rotating over the workers
    pub(crate) fn get_available_worker(&self, now: DateTime<Utc>) -> Option<WorkerId> {
        self.select(None, now)
    }

    /// Same as [`Self::get_available_worker`], but also skips the workers banned
    /// in the given chat
    pub(crate) fn get_available_worker_for(&self, chat: ChatId, now: DateTime<Utc>) -> Option<WorkerId> {
        self.select(Some(chat), now)
    }

    fn select(&self, chat: Option<ChatId>, now: DateTime<Utc>) -> Option<WorkerId> {
        let mut state = self.state.lock();
        let len = state.workers.len();
        let start = state.last_picked.map(|i| i + 1).unwrap_or(0);

        let picked = (0..len)
            .map(|offset| (start + offset) % len)
            .find(|&i| state.workers[i].is_eligible(&self.limits, chat, now))?;

        state.last_picked = Some(picked);
        Some(state.workers[picked].id)
    }

    /// Posts the content via the given worker and updates its anti-ban state
    /// according to the result. No error escapes from here.
    #[instrument(skip(self, content))]
    pub(crate) async fn post_message(
        &self,
        worker: WorkerId,
        chat: ChatId,
        content: &AdContent,
    ) -> PostOutcome {
        let outcome = match self.clients.get(&worker) {
            Some(client) => match client.send(chat, content).await {
                Ok(()) => PostOutcome::Sent,
                Err(err) => self.handle_send_error(worker, chat, err).await,
            },
            None => PostOutcome::Failed(format!("Worker {worker} is not configured")),
        };

        let now = Utc::now();

        match &outcome {
            PostOutcome::Sent => {
                self.update(worker, |state| state.record_success());
                self.mark_used(worker, now).await;
            }
            PostOutcome::Banned(_) => self.mark_used(worker, now).await,
            PostOutcome::FloodWait(_) => {}
            PostOutcome::Failed(reason) => {
                let became_unhealthy =
                    self.update(worker, |state| state.record_failure(&self.limits, reason, now));
                if became_unhealthy == Some(true) {
                    warn!(%worker, reason, "Worker was marked unhealthy");
                }
                self.mark_used(worker, now).await;
            }
        }

        metrics::posts_total(outcome.kind()).increment(1);

        outcome
    }

    async fn handle_send_error(&self, worker: WorkerId, chat: ChatId, err: SendError) -> PostOutcome {
        warn!(%worker, chat = chat.0, err = tracing_err(&err), "Worker failed to post");

        let now = Utc::now();

        match err {
            SendError::FloodWait(wait) => {
                self.update(worker, |state| {
                    state.extend_cooldown(now + super::to_chrono(wait), "flood wait")
                });
                self.persist(worker).await;
                PostOutcome::FloodWait(wait)
            }
            SendError::BannedInChat(reason) => {
                self.update(worker, |state| state.banned_chats.insert(chat));
                if let Err(err) = self.store.save_chat_ban(worker, chat, &reason).await {
                    warn!(
                        %worker,
                        err = tracing_err(&err),
                        "Failed to persist the worker chat ban"
                    );
                }
                PostOutcome::Banned(reason)
            }
            SendError::Revoked(reason) => {
                self.update(worker, |state| {
                    state.is_banned = true;
                    state.last_error = Some(reason.clone());
                });
                self.persist(worker).await;
                PostOutcome::Failed(reason)
            }
            SendError::Other(reason) => PostOutcome::Failed(reason),
        }
    }

    /// Stamps the cooldown and bumps the usage counters of the worker
    pub(crate) async fn mark_used(&self, worker: WorkerId, now: DateTime<Utc>) {
        self.update(worker, |state| state.mark_used(&self.limits, now));
        self.persist(worker).await;
    }

    /// Returns unhealthy workers whose cooldown is over back into rotation
    pub(crate) async fn revive_unhealthy(&self, now: DateTime<Utc>) -> Vec<WorkerId> {
        let revived: Vec<_> = self
            .state
            .lock()
            .workers
            .iter_mut()
            .filter_map(|worker| worker.try_revive(now).then_some(worker.id))
            .collect();

        for &worker in &revived {
            info!(%worker, "Worker was revived after being unhealthy");
            self.persist(worker).await;
        }

        revived
    }

    pub(crate) fn status(&self) -> Vec<WorkerState> {
        self.state.lock().workers.clone()
    }

    fn update<T>(&self, worker: WorkerId, f: impl FnOnce(&mut WorkerState) -> T) -> Option<T> {
        let mut state = self.state.lock();
        let worker = state.workers.iter_mut().find(|state| state.id == worker)?;
        Some(f(worker))
    }

    async fn persist(&self, worker: WorkerId) {
        let Some(snapshot) = self.update(worker, |state| state.clone()) else {
            return;
        };

        if let Err(err) = self.store.save_worker(&snapshot).await {
            warn!(
                %worker,
                err = tracing_err(&err),
                "Failed to persist the worker state"
            );
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::time::Duration;

    #[derive(Default)]
    pub(crate) struct InMemoryWorkerStore {
        pub(crate) workers: SyncMutex<HashMap<WorkerId, WorkerState>>,
        pub(crate) bans: SyncMutex<Vec<(WorkerId, ChatId, String)>>,
    }

    #[async_trait]
    impl WorkerStore for InMemoryWorkerStore {
        async fn load_workers(&self) -> Result<Vec<WorkerState>> {
            Ok(self.workers.lock().values().cloned().collect())
        }

        async fn save_worker(&self, worker: &WorkerState) -> Result {
            self.workers.lock().insert(worker.id, worker.clone());
            Ok(())
        }

        async fn save_chat_ban(&self, worker: WorkerId, chat: ChatId, reason: &str) -> Result {
            self.bans.lock().push((worker, chat, reason.to_owned()));
            Ok(())
        }
    }

    /// Client that replies with the scripted results and then succeeds forever
    #[derive(Default)]
    pub(crate) struct FakeClient {
        pub(crate) script: SyncMutex<Vec<Result<(), SendError>>>,
        pub(crate) sent: SyncMutex<Vec<ChatId>>,
    }

    impl FakeClient {
        pub(crate) fn scripted(script: Vec<Result<(), SendError>>) -> Arc<Self> {
            let mut script = script;
            script.reverse();
            Arc::new(Self {
                script: SyncMutex::new(script),
                sent: Default::default(),
            })
        }
    }

    #[async_trait]
    impl WorkerClient for FakeClient {
        async fn send(&self, chat: ChatId, _content: &AdContent) -> Result<(), SendError> {
            let result = self.script.lock().pop().unwrap_or(Ok(()));
            if result.is_ok() {
                self.sent.lock().push(chat);
            }
            result
        }
    }

    pub(crate) fn limits() -> Limits {
        Limits {
            cooldown: chrono::Duration::minutes(2),
            max_hourly_posts: 100,
            max_daily_posts: 1000,
            max_consecutive_failures: 3,
            unhealthy_cooldown: chrono::Duration::hours(1),
        }
    }

    pub(crate) fn pool_of(
        clients: Vec<Arc<FakeClient>>,
        limits: Limits,
        store: Arc<InMemoryWorkerStore>,
    ) -> WorkerPool {
        let clients = clients
            .into_iter()
            .enumerate()
            .map(|(i, client)| (WorkerId(i as i32 + 1), client as Arc<dyn WorkerClient>))
            .collect();
        WorkerPool::new(clients, limits, store)
    }

    fn content() -> AdContent {
        AdContent {
            text: "Buy our stuff".to_owned(),
            storage_message_id: None,
        }
    }

    #[test]
    fn rotates_workers_round_robin() {
        let pool = pool_of(
            vec![Default::default(), Default::default(), Default::default()],
            limits(),
            Default::default(),
        );
        let now = Utc::now();

        let picked: Vec<_> = (0..4)
            .map(|_| pool.get_available_worker(now).unwrap().0)
            .collect();

        assert_eq!(picked, [1, 2, 3, 1]);
    }

    #[test_log::test(tokio::test)]
    async fn cooled_down_worker_is_never_returned() {
        let pool = pool_of(vec![Default::default()], limits(), Default::default());
        let now = Utc::now();

        pool.mark_used(WorkerId(1), now).await;

        assert_eq!(pool.get_available_worker(now), None);
        assert_eq!(
            pool.get_available_worker(now + chrono::Duration::seconds(119)),
            None
        );
        assert_eq!(
            pool.get_available_worker(now + chrono::Duration::minutes(2)),
            Some(WorkerId(1))
        );
    }

    #[test_log::test(tokio::test)]
    async fn restored_cooldown_excludes_worker() {
        let store = Arc::new(InMemoryWorkerStore::default());
        let now = Utc::now();

        let mut saved = WorkerState::new(WorkerId(1));
        saved.extend_cooldown(now + chrono::Duration::minutes(10), "flood wait");
        store.workers.lock().insert(WorkerId(1), saved);

        let pool = pool_of(
            vec![Default::default(), Default::default()],
            limits(),
            store.clone(),
        );
        pool.restore().await.unwrap();

        assert_eq!(pool.get_available_worker(now), Some(WorkerId(2)));
        assert_eq!(pool.get_available_worker(now), Some(WorkerId(2)));
        assert_eq!(
            pool.get_available_worker(now + chrono::Duration::minutes(10)),
            Some(WorkerId(1))
        );

        // The worker that was never persisted before got its row
        assert!(store.workers.lock().contains_key(&WorkerId(2)));
    }

    #[test_log::test(tokio::test)]
    async fn flood_wait_extends_cooldown() {
        let client = FakeClient::scripted(vec![Err(SendError::FloodWait(Duration::from_secs(600)))]);
        let store = Arc::new(InMemoryWorkerStore::default());
        let pool = pool_of(vec![client], limits(), store.clone());

        let outcome = pool.post_message(WorkerId(1), ChatId(-1), &content()).await;

        assert_eq!(outcome, PostOutcome::FloodWait(Duration::from_secs(600)));
        assert!(!outcome.is_success());

        let later = Utc::now() + chrono::Duration::minutes(5);
        assert_eq!(pool.get_available_worker(later), None);

        let saved = store.workers.lock()[&WorkerId(1)].clone();
        assert_eq!(saved.cooldown_reason.as_deref(), Some("flood wait"));
    }

    #[test_log::test(tokio::test)]
    async fn chat_ban_is_recorded_for_the_destination_only() {
        let client = FakeClient::scripted(vec![Err(SendError::BannedInChat("kicked".to_owned()))]);
        let store = Arc::new(InMemoryWorkerStore::default());
        let limits = Limits {
            cooldown: chrono::Duration::zero(),
            ..limits()
        };
        let pool = pool_of(vec![client], limits, store.clone());

        let outcome = pool.post_message(WorkerId(1), ChatId(-1), &content()).await;
        assert_eq!(outcome, PostOutcome::Banned("kicked".to_owned()));

        let now = Utc::now();
        assert_eq!(pool.get_available_worker_for(ChatId(-1), now), None);
        assert_eq!(
            pool.get_available_worker_for(ChatId(-2), now),
            Some(WorkerId(1))
        );
        assert_eq!(
            *store.bans.lock(),
            [(WorkerId(1), ChatId(-1), "kicked".to_owned())]
        );
    }

    #[test_log::test(tokio::test)]
    async fn revoked_worker_is_excluded_everywhere() {
        let client = FakeClient::scripted(vec![Err(SendError::Revoked("token revoked".to_owned()))]);
        let limits = Limits {
            cooldown: chrono::Duration::zero(),
            ..limits()
        };
        let pool = pool_of(vec![client], limits, Default::default());

        let outcome = pool.post_message(WorkerId(1), ChatId(-1), &content()).await;

        assert_eq!(outcome, PostOutcome::Failed("token revoked".to_owned()));
        assert_eq!(pool.get_available_worker(Utc::now()), None);
        assert!(pool.status()[0].is_banned);
    }

    #[test_log::test(tokio::test)]
    async fn failures_make_worker_unhealthy() {
        let failure = || Err(SendError::Other("internal error".to_owned()));
        let client = FakeClient::scripted(vec![failure(), failure(), failure()]);
        let limits = Limits {
            cooldown: chrono::Duration::zero(),
            ..limits()
        };
        let pool = pool_of(vec![client], limits, Default::default());

        for _ in 0..3 {
            let outcome = pool.post_message(WorkerId(1), ChatId(-1), &content()).await;
            assert_eq!(outcome, PostOutcome::Failed("internal error".to_owned()));
        }

        let status = &pool.status()[0];
        assert!(!status.is_healthy);
        assert_eq!(status.last_error.as_deref(), Some("internal error"));

        let now = Utc::now();
        assert_eq!(pool.get_available_worker(now), None);

        let after = now + chrono::Duration::hours(2);
        assert_eq!(pool.revive_unhealthy(after).await, [WorkerId(1)]);
        assert_eq!(pool.get_available_worker(after), Some(WorkerId(1)));
    }

    #[test_log::test(tokio::test)]
    async fn successful_post_bumps_counters() {
        let client = Arc::new(FakeClient::default());
        let pool = pool_of(vec![client.clone()], limits(), Default::default());

        let outcome = pool.post_message(WorkerId(1), ChatId(-7), &content()).await;

        assert!(outcome.is_success());
        assert_eq!(*client.sent.lock(), [ChatId(-7)]);

        let status = &pool.status()[0];
        let now = Utc::now();
        assert_eq!(status.hourly_posts_at(now), 1);
        assert_eq!(status.daily_posts_at(now), 1);
        assert!(status.is_cooling_down(now));
    }
}
