//! Periodic background jobs: the posting cycle with its cleanup pass, and
//! the watcher of the pending payments.

use crate::observability::metrics;
use crate::payments::PaymentProcessor;
use crate::posting::AutoPoster;
use crate::prelude::*;
use crate::workers::WorkerPool;
use crate::Result;
use chrono::prelude::*;
use futures::prelude::*;
use serde::Deserialize;
use serde_with::{serde_as, DurationSeconds};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

#[serde_as]
#[derive(Deserialize)]
pub(crate) struct Config {
    /// Pause between the posting cycles
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "default_cycle_interval")]
    pub(crate) cycle_interval: Duration,

    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "default_payment_poll_interval")]
    pub(crate) payment_poll_interval: Duration,
}

fn default_cycle_interval() -> Duration {
    Duration::from_secs(60 * 60)
}

fn default_payment_poll_interval() -> Duration {
    Duration::from_secs(60)
}

/// Services the background jobs operate on
pub(crate) struct Jobs {
    pub(crate) poster: Arc<AutoPoster>,
    pub(crate) workers: Arc<WorkerPool>,
    pub(crate) payments: Arc<PaymentProcessor>,
}

/// Wakes up the posting loop before its interval elapses
#[derive(Clone, Default)]
pub(crate) struct Trigger(Arc<Notify>);

impl Trigger {
    pub(crate) fn fire(&self) {
        self.0.notify_one();
    }
}

pub(crate) struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    trigger: Trigger,
    tasks: Vec<JoinHandle<()>>,
}

impl SchedulerHandle {
    pub(crate) fn trigger(&self) -> Trigger {
        self.trigger.clone()
    }

    /// Asks the loops to stop and waits until the jobs in progress finish
    pub(crate) async fn shutdown(self) {
        info!("Shutting down the scheduler");

        // Receivers may already be gone if the loops have exited
        let _ = self.shutdown.send(true);

        for task in self.tasks {
            if let Err(err) = task.await {
                error!(err = tracing_err(&err), "Scheduler task failed to join");
            }
        }
    }
}

pub(crate) fn spawn(cfg: Config, jobs: Jobs) -> SchedulerHandle {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let trigger = Trigger::default();
    let jobs = Arc::new(jobs);

    let posting = {
        let jobs = jobs.clone();
        run_loop(
            "posting",
            cfg.cycle_interval,
            shutdown_rx.clone(),
            Some(trigger.clone()),
            move || {
                let jobs = jobs.clone();
                async move { jobs.posting_cycle().await }
            },
        )
    };

    let payments = run_loop(
        "payments",
        cfg.payment_poll_interval,
        shutdown_rx,
        None,
        move || {
            let jobs = jobs.clone();
            async move { jobs.payments.verify_pending().await.map(drop) }
        },
    );

    SchedulerHandle {
        shutdown: shutdown_tx,
        trigger,
        tasks: vec![tokio::spawn(posting), tokio::spawn(payments)],
    }
}

impl Jobs {
    async fn posting_cycle(&self) -> Result {
        let (result, duration) = self.poster.run_cycle().with_duration().await;

        metrics::posting_cycle_duration_seconds().record(duration);

        let cleanup = self.cleanup().await;

        result?;
        cleanup
    }

    /// Housekeeping that runs after every posting cycle
    async fn cleanup(&self) -> Result {
        let now = Utc::now();

        let revived = self.workers.revive_unhealthy(now).await;
        if !revived.is_empty() {
            info!(?revived, "Revived unhealthy workers");
        }

        self.poster.cleanup(now).await?;
        self.payments.expire_overdue(now).await?;

        Ok(())
    }
}

/// Runs the job right away, and then every `interval` until the shutdown
/// is signaled. Errors and panics of the job are logged and don't stop the
/// loop.
async fn run_loop<F, Fut>(
    job: &'static str,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
    trigger: Option<Trigger>,
    mut run_job: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result>,
{
    info!(job, interval = tracing_duration(interval), "Starting the scheduler loop");

    while !*shutdown.borrow() {
        let result = AssertUnwindSafe(run_job()).catch_unwind().await;

        let label = match result {
            Ok(Ok(())) => "ok",
            Ok(Err(err)) => {
                error!(job, err = tracing_err(&err), "Scheduler job failed");
                "error"
            }
            Err(_) => {
                error!(job, "Scheduler job panicked");
                "panic"
            }
        };

        metrics::scheduler_runs_total(job, label).increment(1);

        let triggered = async {
            match &trigger {
                Some(trigger) => trigger.0.notified().await,
                None => future::pending().await,
            }
        };

        tokio::select! {
            () = tokio::time::sleep(interval) => {}
            () = triggered => info!(job, "Scheduler job was triggered manually"),
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }

    info!(job, "Scheduler loop stopped");
}
