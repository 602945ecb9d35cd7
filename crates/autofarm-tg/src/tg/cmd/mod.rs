mod args;
pub(crate) mod maintainer;
pub(crate) mod regular;

use crate::prelude::*;
use crate::util::DynResult;
use crate::{tg, Result};
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::fmt;
use std::sync::Arc;
use teloxide::macros::BotCommands;
use teloxide::types::{Message, User};
use teloxide::utils::markdown;

pub(crate) use args::Args;

#[async_trait]
pub(crate) trait Command: fmt::Debug + Send + Sync + 'static {
    async fn handle(self, ctx: &tg::Ctx, msg: &Message) -> Result;
}

pub(crate) fn handle<'a, C: Command>(
) -> impl Fn(Arc<tg::Ctx>, Message, C) -> BoxFuture<'a, DynResult> {
    move |ctx, msg, cmd| {
        let info = info_span!(
            "handle_message",
            sender = msg.from().map(User::debug_id).as_deref(),
            msg_text = msg.text(),
            chat = %msg.chat.debug_id(),
            cmd = format_args!("{cmd:#?}")
        );

        let fut = async move {
            debug!("Processing command");

            let result = cmd.handle(&ctx, &msg).await;
            if let Err(err) = &result {
                reply_error(&ctx, &msg, err).await;
            }
            result.map_err(Into::into)
        };

        Box::pin(fut.instrument(info))
    }
}

/// Tells the user that handling of their message failed
pub(crate) async fn reply_error(ctx: &tg::Ctx, msg: &Message, err: &crate::Error) {
    let span = warn_span!("err", err = tracing_err(err), id = err.id());
    async {
        if !err.is_user_error() {
            warn!("Message handler returned an error");
        }

        let msg_result = ctx.bot.reply_md(msg, error_reply(err)).await;

        if let Err(err) = msg_result {
            warn!(
                err = tracing_err(&err),
                "Failed to reply with the error message to the user"
            );
        }
    }
    .instrument(span)
    .await;
}

/// User errors are shown as is, the rest is hidden behind the error id
fn error_reply(err: &crate::Error) -> String {
    if err.is_user_error() {
        return markdown::escape(&err.kind().to_string());
    }

    format!(
        "{} {}",
        markdown::escape("Something went wrong. Please, report this error id to the support:"),
        markdown::code_inline(err.id()),
    )
}

/// Special case for the `/start` command in PM with the bot.
///
/// We don't want this command to appear in the help message, so we handle
/// it separately
#[derive(BotCommands, Clone, Debug)]
#[command(rename_rule = "snake_case")]
pub(crate) enum StartCommand {
    #[command(description = "unreachable")]
    Start,
}

#[async_trait]
impl Command for StartCommand {
    async fn handle(self, ctx: &tg::Ctx, msg: &Message) -> Result {
        if let Some(user) = msg.from() {
            ctx.repo
                .users
                .register(user.id, user.username.as_deref())
                .await?;
        }
        regular::Cmd::Help.handle(ctx, msg).await
    }
}

pub(crate) fn filter_pm_with_bot(msg: Message) -> bool {
    msg.chat.is_private()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{err, fatal, UserError};

    #[test]
    fn user_errors_are_shown_verbatim() {
        let err = err!(UserError::SlotNotFound { slot_number: 4 });
        expect_test::expect![[r#"Slot \#4 doesn't exist\. Use /slots to see your slots"#]]
            .assert_eq(&error_reply(&err));
    }

    #[test]
    fn internal_errors_are_hidden() {
        let err = fatal!("connection refused");
        let reply = error_reply(&err);
        assert!(!reply.contains("connection refused"), "{reply}");
        assert!(reply.contains(err.id()), "{reply}");
    }
}
