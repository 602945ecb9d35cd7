mod config;
mod db;
mod error;
mod http;
mod observability;
mod payments;
mod posting;
mod scheduler;
mod tg;
mod workers;

pub mod util;

pub use crate::error::*;
pub use config::*;
pub use observability::*;

use std::sync::Arc;

#[allow(unused_imports)]
mod prelude {
    pub(crate) use crate::error::prelude::*;
    pub(crate) use crate::http::prelude::*;
    pub(crate) use crate::observability::logging::prelude::*;
    pub(crate) use crate::util::prelude::*;
}

/// Run the telegram bot processing loop together with the background
/// posting and payment verification jobs
pub async fn run(config: Config) -> Result<()> {
    let http = http::create_client();
    let repo = Arc::new(db::init(config.db).await?);

    let bot = tg::create_bot(&config.tg);

    let clients =
        workers::tg_worker_clients(&config.workers.tokens, config.tg.content_storage_chat);

    let workers = Arc::new(workers::WorkerPool::new(
        clients,
        config.workers.limits(),
        repo.clone(),
    ));

    workers.restore().await?;

    let poster = Arc::new(posting::AutoPoster::new(
        repo.clone(),
        workers.clone(),
        config.posting,
    ));

    let payments = Arc::new(
        payments::PaymentProcessor::from_config(repo.clone(), http, config.payments)
            .with_listener(Arc::new(tg::TgSubscriptionListener::new(bot.clone()))),
    );

    let scheduler = scheduler::spawn(
        config.scheduler,
        scheduler::Jobs {
            poster,
            workers: workers.clone(),
            payments: payments.clone(),
        },
    );

    let opts = tg::RunBotOptions {
        bot,
        cfg: config.tg,
        repo,
        workers,
        payments,
        trigger: scheduler.trigger(),
    };

    let result = tg::run_bot(opts).await;

    scheduler.shutdown().await;

    result
}
