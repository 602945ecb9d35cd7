//! Telegram commands root module

mod chat_ref;
mod cmd;
mod config;
mod destination;
mod notify;

use crate::db;
use crate::error::{err, fatal, UserError};
use crate::observability::metrics;
use crate::payments::PaymentProcessor;
use crate::posting::AdSlot;
use crate::prelude::*;
use crate::scheduler::Trigger;
use crate::workers::WorkerPool;
use crate::Result;
use chrono::prelude::*;
use std::sync::Arc;
use teloxide::adaptors::throttle::Limits;
use teloxide::adaptors::{CacheMe, DefaultParseMode, Throttle, Trace};
use teloxide::dispatching::UpdateFilterExt;
use teloxide::prelude::*;
use teloxide::types::{ParseMode, User};
use teloxide::utils::command::BotCommands;

pub(crate) use config::*;
pub(crate) use destination::ForwardingRequests;
pub(crate) use notify::TgSubscriptionListener;

pub(crate) type Bot = Trace<CacheMe<DefaultParseMode<Throttle<teloxide::Bot>>>>;

pub(crate) fn create_bot(cfg: &Config) -> Bot {
    teloxide::Bot::with_client(cfg.bot_token.clone(), teloxide::net::client_from_env())
        .throttle(Limits::default())
        .parse_mode(ParseMode::MarkdownV2)
        .cache_me()
        .trace(teloxide::adaptors::trace::Settings::all())
}

pub(crate) struct Ctx {
    pub(crate) bot: Bot,
    pub(crate) cfg: Config,
    pub(crate) repo: Arc<db::Repo>,
    pub(crate) workers: Arc<WorkerPool>,
    pub(crate) payments: Arc<PaymentProcessor>,
    pub(crate) trigger: Trigger,
    pub(crate) forwarding: ForwardingRequests,
}

impl Ctx {
    /// Active ad slot of the user with an active subscription
    pub(crate) async fn subscriber_slot(&self, user: UserId, slot_number: i32) -> Result<AdSlot> {
        let subscription = self
            .repo
            .users
            .get(user)
            .await?
            .and_then(|user| user.active_subscription(Utc::now()));

        if subscription.is_none() {
            return Err(err!(UserError::NoSubscription));
        }

        self.repo.slots.get_by_number(user, slot_number).await
    }
}

pub(crate) fn sender(msg: &Message) -> Result<&User> {
    msg.from()
        .ok_or_else(|| fatal!("Message {} in chat {} has no sender", msg.id.0, msg.chat.id))
}

pub(crate) struct RunBotOptions {
    pub(crate) bot: Bot,
    pub(crate) cfg: Config,
    pub(crate) repo: Arc<db::Repo>,
    pub(crate) workers: Arc<WorkerPool>,
    pub(crate) payments: Arc<PaymentProcessor>,
    pub(crate) trigger: Trigger,
}

pub(crate) async fn run_bot(opts: RunBotOptions) -> Result {
    let RunBotOptions {
        bot,
        cfg,
        repo,
        workers,
        payments,
        trigger,
    } = opts;

    let mut di = dptree::di::DependencyMap::new();

    di.insert(Arc::new(Ctx {
        bot: bot.clone(),
        cfg,
        repo,
        workers,
        payments,
        trigger,
        forwarding: Default::default(),
    }));

    info!("Starting bot...");

    bot.set_my_commands(cmd::regular::Cmd::bot_commands())
        .await?;

    let handler = dptree::entry()
        .inspect(|upd: Update| {
            metrics::tg_updates_total(upd.kind.discriminator()).increment(1);
        })
        .branch(
            Update::filter_message()
                .filter(cmd::filter_pm_with_bot)
                .branch(
                    dptree::entry()
                        .filter_command::<cmd::StartCommand>()
                        .endpoint(cmd::handle::<cmd::StartCommand>()),
                )
                .branch(
                    dptree::entry()
                        .filter_command::<cmd::regular::Cmd>()
                        .endpoint(cmd::handle::<cmd::regular::Cmd>()),
                )
                .branch(
                    dptree::entry()
                        .filter_command::<cmd::maintainer::Cmd>()
                        .filter(cmd::maintainer::is_maintainer)
                        .endpoint(cmd::handle::<cmd::maintainer::Cmd>()),
                )
                .branch(
                    dptree::filter_map(destination::filter_forwarded_chat)
                        .endpoint(destination::handle_forwarded_chat),
                ),
        );

    Dispatcher::builder(bot, handler)
        .dependencies(di)
        // We don't handle all possible messages that users send,
        // so to supress the warning that we don't do this we have
        // a noop default handler here
        .default_handler(|_| std::future::ready(()))
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    info!("Bot stopped");

    Ok(())
}
