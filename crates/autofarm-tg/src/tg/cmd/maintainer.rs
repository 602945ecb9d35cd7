use crate::db::{PaymentStats, UserStats, WorkerPostingStats};
use crate::payments::PaymentId;
use crate::prelude::*;
use crate::util::encoding;
use crate::{tg, Result};
use async_trait::async_trait;
use chrono::prelude::*;
use itertools::Itertools;
use std::sync::Arc;
use teloxide::prelude::*;
use teloxide::utils::command::BotCommands;
use teloxide::utils::markdown;

#[derive(BotCommands, Clone, Debug)]
#[command(
    rename_rule = "snake_case",
    description = "Commands for bot maintainer only:"
)]
pub(crate) enum Cmd {
    #[command(description = "show the guide")]
    MaintainerHelp,

    #[command(description = "display version info")]
    Version,

    #[command(description = "display the state of the worker accounts")]
    Workers,

    #[command(description = "run the posting cycle right now")]
    PostNow,

    #[command(description = "display posting and revenue statistics for the last 24 hours")]
    Stats,

    #[command(description = "activate the subscription of a pending payment: <payment id>")]
    ConfirmPayment(String),
}

#[async_trait]
impl tg::cmd::Command for Cmd {
    async fn handle(self, ctx: &tg::Ctx, msg: &Message) -> Result {
        match self {
            Cmd::MaintainerHelp => {
                ctx.bot.reply_help_md_escaped::<Cmd>(msg).await?;
            }
            Cmd::Version => {
                /// Generate the key-value pairs with vergen metadata
                macro_rules! vergen_meta {
                    ( $($meta_name:literal),* $(,)? ) => {
                        [$( ($meta_name, env!(concat!("VERGEN_", $meta_name))) ),*]
                    }
                }

                let meta = vergen_meta![
                    "BUILD_TIMESTAMP",
                    "RUSTC_CHANNEL",
                    "RUSTC_COMMIT_DATE",
                    "RUSTC_COMMIT_HASH",
                    "RUSTC_HOST_TRIPLE",
                    "RUSTC_SEMVER",
                    "CARGO_TARGET_TRIPLE",
                    "CARGO_DEBUG",
                    "CARGO_OPT_LEVEL",
                ];

                let meta = [("VERSION", env!("CARGO_PKG_VERSION"))]
                    .into_iter()
                    .chain(meta);

                let max_name_len = meta.clone().map(|(name, _)| name.len()).max().unwrap_or(0);

                let metadata = meta.format_with("\n", |(name, val), f| {
                    let name = name.to_lowercase();
                    let kv = format!("{name:<max_name_len$} = {val}");
                    f(&markdown::escape(&kv))
                });

                ctx.bot
                    .reply_md(msg, format!("```\n{metadata}\n```"))
                    .await?;
            }
            Cmd::Workers => {
                let workers = ctx.workers.status();
                let reply = if workers.is_empty() {
                    markdown::escape("No workers are configured")
                } else {
                    markdown::code_block(&encoding::to_yaml_string(&workers))
                };
                ctx.bot.reply_md(msg, reply).await?;
            }
            Cmd::PostNow => {
                ctx.trigger.fire();
                info!("Posting cycle was triggered manually");
                ctx.bot
                    .reply_plain(msg, "Posting cycle is scheduled to run now")
                    .await?;
            }
            Cmd::Stats => {
                let now = Utc::now();
                let since = now - chrono::Duration::hours(24);

                let stats = Stats {
                    posting: ctx.repo.history.stats_since(since).await?,
                    payments: ctx.repo.payments.stats_since(since).await?,
                    users: ctx.repo.users.stats(now).await?,
                    active_slots: ctx.repo.slots.count_active().await?,
                    active_destinations: ctx.repo.destinations.count_active().await?,
                };

                ctx.bot
                    .reply_md(msg, markdown::code_block(&stats.render()))
                    .await?;
            }
            Cmd::ConfirmPayment(args) => {
                let mut args = tg::cmd::Args::new(&args, "/confirm_payment <payment id>");
                let id = PaymentId::parse(args.next_str()?);
                args.finish()?;

                let activated = ctx.payments.process_successful_payment(&id, None).await?;

                info!(payment = %id, activated, "Payment was confirmed manually");

                let reply = if activated {
                    format!("Payment {id} is completed, the subscription is active")
                } else {
                    format!("Payment {id} is not pending, nothing was changed")
                };

                ctx.bot.reply_plain(msg, &reply).await?;
            }
        };

        Ok(())
    }
}

struct Stats {
    posting: Vec<WorkerPostingStats>,
    payments: PaymentStats,
    users: UserStats,
    active_slots: i64,
    active_destinations: i64,
}

impl Stats {
    fn render(&self) -> String {
        let successes: i64 = self.posting.iter().map(|stats| stats.successes).sum();
        let failures: i64 = self.posting.iter().map(|stats| stats.failures).sum();

        let workers = self
            .posting
            .iter()
            .map(|stats| {
                let worker = stats
                    .worker
                    .map(|id| format!("worker {id}"))
                    .unwrap_or_else(|| "no worker".to_owned());
                format!("  {worker}: {} ok, {} failed", stats.successes, stats.failures)
            })
            .join("\n");

        format!(
            "Last 24 hours\n\
            Posts: {successes} ok, {failures} failed\n\
            {workers}\n\
            Payments: {} completed, ${:.2} revenue\n\
            Users: {} total, {} subscribed\n\
            Active slots: {}\n\
            Active destinations: {}",
            self.payments.completed,
            self.payments.revenue_usd,
            self.users.total,
            self.users.subscribed,
            self.active_slots,
            self.active_destinations,
        )
    }
}

pub(crate) fn is_maintainer(ctx: Arc<tg::Ctx>, msg: Message) -> bool {
    matches!(msg.from(), Some(sender) if sender.id == ctx.cfg.maintainer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workers::WorkerId;
    use expect_test::expect;

    #[test]
    fn renders_stats() {
        let stats = Stats {
            posting: vec![
                WorkerPostingStats {
                    worker: Some(WorkerId(1)),
                    successes: 40,
                    failures: 2,
                },
                WorkerPostingStats {
                    worker: None,
                    successes: 0,
                    failures: 3,
                },
            ],
            payments: PaymentStats {
                completed: 2,
                revenue_usd: 60.0,
            },
            users: UserStats {
                total: 12,
                subscribed: 4,
            },
            active_slots: 7,
            active_destinations: 19,
        };

        expect![[r#"
            Last 24 hours
            Posts: 40 ok, 5 failed
              worker #1: 40 ok, 2 failed
              no worker: 0 ok, 3 failed
            Payments: 2 completed, $60.00 revenue
            Users: 12 total, 4 subscribed
            Active slots: 7
            Active destinations: 19"#]]
        .assert_eq(&stats.render());
    }
}
