use super::Args;
use crate::error::{err, UserError};
use crate::payments::{Crypto, PaymentId, PaymentStatus, Tier};
use crate::posting::{AdContent, AdSlot, DestinationId};
use crate::prelude::*;
use crate::tg::chat_ref::ChatRef;
use crate::tg::{self, destination};
use crate::Result;
use async_trait::async_trait;
use chrono::prelude::*;
use itertools::Itertools;
use std::fmt::Write as _;
use strum::IntoEnumIterator;
use teloxide::prelude::*;
use teloxide::utils::command::BotCommands;
use teloxide::{ApiError, RequestError};

/// Posting more often than this looks like spam to the chat admins
const MIN_INTERVAL_MINUTES: i32 = 30;

/// Number of characters of the ad text shown in the list of slots
const PREVIEW_LEN: usize = 40;

#[derive(BotCommands, Clone, Debug)]
#[command(rename_rule = "snake_case", description = "Commands:")]
pub(crate) enum Cmd {
    #[command(description = "show this help")]
    Help,

    #[command(description = "list the subscription plans")]
    Tiers,

    #[command(description = "buy a subscription: <tier> <currency>")]
    Subscribe(String),

    #[command(description = "check the payment: <payment id>")]
    CheckPayment(String),

    #[command(description = "show your subscription and ad slots")]
    Slots,

    #[command(description = "reply to a message to make it the ad of the slot: <slot>")]
    SetContent(String),

    #[command(
        description = "add a channel or group to the slot: <slot> [@username | t.me link | chat id]"
    )]
    AddDestination(String),

    #[command(description = "list destinations of the slot: <slot>")]
    Destinations(String),

    #[command(description = "remove a destination from the slot: <slot> <destination id>")]
    RemoveDestination(String),

    #[command(description = "change how often the slot is posted: <slot> <minutes>")]
    SetInterval(String),

    #[command(description = "pause posting of the slot: <slot>")]
    Pause(String),

    #[command(description = "resume posting of the slot: <slot>")]
    Resume(String),

    #[command(description = "stop adding destinations from forwarded messages")]
    Cancel,
}

#[async_trait]
impl tg::cmd::Command for Cmd {
    async fn handle(self, ctx: &tg::Ctx, msg: &Message) -> Result {
        let reply = match self {
            Cmd::Help => {
                ctx.bot.reply_help_md_escaped::<Cmd>(msg).await?;
                return Ok(());
            }
            Cmd::Tiers => tiers(ctx),
            Cmd::Subscribe(args) => subscribe(ctx, msg, &args).await?,
            Cmd::CheckPayment(args) => check_payment(ctx, msg, &args).await?,
            Cmd::Slots => slots(ctx, msg).await?,
            Cmd::SetContent(args) => set_content(ctx, msg, &args).await?,
            Cmd::AddDestination(args) => add_destination(ctx, msg, &args).await?,
            Cmd::Destinations(args) => destinations(ctx, msg, &args).await?,
            Cmd::RemoveDestination(args) => remove_destination(ctx, msg, &args).await?,
            Cmd::SetInterval(args) => set_interval(ctx, msg, &args).await?,
            Cmd::Pause(args) => set_paused(ctx, msg, &args, true).await?,
            Cmd::Resume(args) => set_paused(ctx, msg, &args, false).await?,
            Cmd::Cancel => cancel(ctx, msg)?,
        };

        ctx.bot.reply_plain(msg, &reply).await?;

        Ok(())
    }
}

fn tiers(ctx: &tg::Ctx) -> String {
    let days = ctx.payments.cfg().subscription_days;
    let cryptos = ctx.payments.cfg().supported_cryptos().iter().join(", ");

    let tiers = Tier::iter()
        .map(|tier| {
            format!(
                "• {tier}: ${} for {days} days, {} ad slot(s)",
                tier.price_usd(),
                tier.slots()
            )
        })
        .join("\n");

    format!(
        "Subscription plans:\n\n{tiers}\n\n\
        Accepted currencies: {cryptos}\n\n\
        To subscribe: /subscribe <tier> <currency>"
    )
}

async fn subscribe(ctx: &tg::Ctx, msg: &Message, args: &str) -> Result<String> {
    let user = tg::sender(msg)?;

    let mut args = Args::new(args, "/subscribe <tier> <currency>");
    let tier_input = args.next_str()?;
    let crypto_input = args.next_str()?;
    args.finish()?;

    let tier: Tier = tier_input.parse().map_err(|_| {
        err!(UserError::UnknownTier {
            input: tier_input.to_owned()
        })
    })?;

    let supported = ctx.payments.cfg().supported_cryptos();

    let crypto = crypto_input
        .parse::<Crypto>()
        .ok()
        .filter(|crypto| supported.contains(crypto))
        .ok_or_else(|| {
            err!(UserError::UnknownCrypto {
                input: crypto_input.to_owned(),
                supported: supported.iter().join(", "),
            })
        })?;

    let payment = ctx.payments.create_payment(user.id, tier, crypto).await?;

    let mut reply = format!(
        "Send exactly {} {crypto} (${}) to this address:\n\n{}\n\n",
        payment.amount_crypto, payment.amount_usd, payment.pay_to_address,
    );

    if crypto == Crypto::Ton {
        let _ = writeln!(reply, "Put this comment into the transaction: {}\n", payment.id);
    }

    let _ = write!(
        reply,
        "The payment request is valid until {}. \
        The payment is checked automatically, or you can check it right away \
        with /check_payment {}",
        payment.expires_at.to_human_readable(),
        payment.id,
    );

    Ok(reply)
}

async fn check_payment(ctx: &tg::Ctx, msg: &Message, args: &str) -> Result<String> {
    let user = tg::sender(msg)?;

    let mut args = Args::new(args, "/check_payment <payment id>");
    let id = PaymentId::parse(args.next_str()?);
    args.finish()?;

    let payment = ctx.payments.get_payment(&id).await?;

    // Payment ids of other users are not disclosed
    if payment.user_id != user.id {
        return Err(err!(UserError::PaymentNotFound {
            payment_id: id.to_string()
        }));
    }

    if ctx.payments.verify_payment(&id).await? {
        let expires_at = ctx
            .repo
            .users
            .get(user.id)
            .await?
            .and_then(|user| user.subscription)
            .map(|sub| sub.expires_at.to_human_readable())
            .unwrap_or_else(|| "unknown".to_owned());

        return Ok(format!(
            "Payment {id} is confirmed. Your {} subscription is active until {expires_at}.",
            payment.tier
        ));
    }

    let payment = ctx.payments.get_payment(&id).await?;

    let reply = match payment.status {
        PaymentStatus::Expired => {
            format!("Payment {id} has expired. Create a new one with /subscribe")
        }
        PaymentStatus::Pending | PaymentStatus::Completed => format!(
            "Payment {id} is not received yet. It is checked automatically until {}",
            payment.expires_at.to_human_readable()
        ),
    };

    Ok(reply)
}

async fn slots(ctx: &tg::Ctx, msg: &Message) -> Result<String> {
    let user = tg::sender(msg)?;
    let now = Utc::now();

    let subscription = ctx
        .repo
        .users
        .get(user.id)
        .await?
        .and_then(|user| user.active_subscription(now))
        .ok_or_else(|| err!(UserError::NoSubscription))?;

    let slots = ctx.repo.slots.list_for_user(user.id).await?;

    let slots = slots
        .iter()
        .filter(|slot| slot.is_active)
        .map(|slot| describe_slot(slot, now))
        .join("\n\n");

    Ok(format!(
        "Plan: {}, active until {}\n\n{slots}",
        subscription.tier,
        subscription.expires_at.to_human_readable(),
    ))
}

fn describe_slot(slot: &AdSlot, now: DateTime<Utc>) -> String {
    let last_sent = slot
        .last_sent_at
        .map(|at| at.to_human_ago(now))
        .unwrap_or_else(|| "never".to_owned());

    let next = match slot.next_post_at() {
        Some(at) if at > now => at.to_human_readable(),
        _ => "with the next posting cycle".to_owned(),
    };

    let content = match &slot.content {
        Some(content) => preview(&content.text),
        None => "not set, use /set_content".to_owned(),
    };

    format!(
        "Slot {}: {}\n\
        Interval: {} min\n\
        Last sent: {last_sent}\n\
        Next post: {next}\n\
        Ad: {content}",
        slot.slot_number,
        slot.status(),
        slot.interval_minutes,
    )
}

fn preview(text: &str) -> String {
    let text = text.trim();
    if text.is_empty() {
        return "(media without caption)".to_owned();
    }
    if text.chars().count() <= PREVIEW_LEN {
        return text.to_owned();
    }
    let truncated: String = text.chars().take(PREVIEW_LEN).collect();
    format!("{}…", truncated.trim_end())
}

fn slot_number_args<'a>(args: &'a str, expected: &'static str) -> Result<(i32, Args<'a>)> {
    let mut args = Args::new(args, expected);
    let slot_number = args.next()?;
    Ok((slot_number, args))
}

async fn set_content(ctx: &tg::Ctx, msg: &Message, args: &str) -> Result<String> {
    let user = tg::sender(msg)?;

    let (slot_number, args) = slot_number_args(args, "/set_content <slot> as a reply to the ad")?;
    args.finish()?;

    let slot = ctx.subscriber_slot(user.id, slot_number).await?;

    let ad = msg
        .reply_to_message()
        .ok_or_else(|| err!(UserError::NoReplyMessage))?;

    let is_supported = ad.text().is_some()
        || ad.photo().is_some()
        || ad.video().is_some()
        || ad.animation().is_some()
        || ad.document().is_some();

    if !is_supported {
        return Err(err!(UserError::UnsupportedContent));
    }

    let stored = ctx
        .bot
        .copy_message(ctx.cfg.content_storage_chat, ad.chat.id, ad.id)
        .await?;

    let content = AdContent {
        text: ad.text().or_else(|| ad.caption()).unwrap_or_default().to_owned(),
        storage_message_id: Some(stored),
    };

    ctx.repo.slots.set_content(slot.id, &content).await?;

    info!(slot = slot.id.0, stored = stored.0, "Updated ad content");

    Ok(format!(
        "The ad of slot {slot_number} is updated: {}",
        preview(&content.text)
    ))
}

async fn add_destination(ctx: &tg::Ctx, msg: &Message, args: &str) -> Result<String> {
    let user = tg::sender(msg)?;

    let (slot_number, mut args) = slot_number_args(
        args,
        "/add_destination <slot> [@username | t.me link | chat id]",
    )?;
    let chat_input = args.next_opt();
    args.finish()?;

    let slot = ctx.subscriber_slot(user.id, slot_number).await?;

    let Some(chat_input) = chat_input else {
        ctx.forwarding.arm(user.id, slot_number);
        return Ok(format!(
            "Forward any message from the channel or group to add it to slot {slot_number}. \
            Send /cancel when you are done."
        ));
    };

    let chat_ref: ChatRef = chat_input.parse()?;

    let chat = match ctx.bot.get_chat(chat_ref.recipient()).await {
        Ok(chat) => chat,
        Err(RequestError::Api(ApiError::ChatNotFound)) => {
            return Err(err!(UserError::InvalidChat {
                input: chat_input.to_owned()
            }))
        }
        Err(err) => return Err(err.into()),
    };

    destination::add_destination(ctx, &slot, &chat).await
}

async fn destinations(ctx: &tg::Ctx, msg: &Message, args: &str) -> Result<String> {
    let user = tg::sender(msg)?;

    let (slot_number, args) = slot_number_args(args, "/destinations <slot>")?;
    args.finish()?;

    let slot = ctx.subscriber_slot(user.id, slot_number).await?;
    let destinations = ctx.repo.destinations.list_active(slot.id).await?;

    if destinations.is_empty() {
        return Ok(format!(
            "Slot {slot_number} has no destinations. Add one with /add_destination {slot_number}"
        ));
    }

    let list = destinations
        .iter()
        .map(|dest| format!("#{} {} ({})", dest.id, dest.alias, dest.chat_id))
        .join("\n");

    Ok(format!("Destinations of slot {slot_number}:\n\n{list}"))
}

async fn remove_destination(ctx: &tg::Ctx, msg: &Message, args: &str) -> Result<String> {
    let user = tg::sender(msg)?;

    let (slot_number, mut args) =
        slot_number_args(args, "/remove_destination <slot> <destination id>")?;
    let destination = DestinationId(args.next()?);
    args.finish()?;

    let slot = ctx.subscriber_slot(user.id, slot_number).await?;

    ctx.repo.destinations.deactivate(&slot, destination).await?;

    Ok(format!(
        "Destination #{destination} is removed from slot {slot_number}"
    ))
}

async fn set_interval(ctx: &tg::Ctx, msg: &Message, args: &str) -> Result<String> {
    let user = tg::sender(msg)?;

    let (slot_number, mut args) = slot_number_args(args, "/set_interval <slot> <minutes>")?;
    let minutes: i32 = args.next()?;
    args.finish()?;

    if minutes < MIN_INTERVAL_MINUTES {
        return Err(err!(UserError::IntervalTooShort {
            min_minutes: MIN_INTERVAL_MINUTES
        }));
    }

    let slot = ctx.subscriber_slot(user.id, slot_number).await?;

    ctx.repo.slots.set_interval(slot.id, minutes).await?;

    Ok(format!(
        "Slot {slot_number} is now posted every {minutes} minutes"
    ))
}

async fn set_paused(ctx: &tg::Ctx, msg: &Message, args: &str, is_paused: bool) -> Result<String> {
    let user = tg::sender(msg)?;

    let expected = if is_paused {
        "/pause <slot>"
    } else {
        "/resume <slot>"
    };

    let (slot_number, args) = slot_number_args(args, expected)?;
    args.finish()?;

    let slot = ctx.subscriber_slot(user.id, slot_number).await?;

    ctx.repo.slots.set_paused(slot.id, is_paused).await?;

    let state = if is_paused { "paused" } else { "resumed" };

    Ok(format!("Slot {slot_number} is {state}"))
}

fn cancel(ctx: &tg::Ctx, msg: &Message) -> Result<String> {
    let user = tg::sender(msg)?;

    let reply = if ctx.forwarding.disarm(user.id) {
        "Stopped adding destinations from forwarded messages"
    } else {
        "Nothing to cancel"
    };

    Ok(reply.to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::posting::SlotId;
    use expect_test::expect;
    use teloxide::types::{MessageId, UserId};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn slot(content: Option<&str>, last_sent_at: Option<DateTime<Utc>>) -> AdSlot {
        AdSlot {
            id: SlotId(1),
            user_id: UserId(7),
            slot_number: 2,
            content: content.map(|text| AdContent {
                text: text.to_owned(),
                storage_message_id: Some(MessageId(10)),
            }),
            interval_minutes: 60,
            last_sent_at,
            is_active: true,
            is_paused: false,
        }
    }

    #[test]
    fn describes_running_slot() {
        let slot = slot(
            Some("Best crypto signals in town, join us today and get a free bonus"),
            Some(t0() - chrono::Duration::minutes(20)),
        );

        expect![[r#"
            Slot 2: ▶️ running
            Interval: 60 min
            Last sent: 20 minutes ago
            Next post: 2024-03-01 12:40 UTC
            Ad: Best crypto signals in town, join us tod…"#]]
        .assert_eq(&describe_slot(&slot, t0()));
    }

    #[test]
    fn describes_slot_without_content() {
        let slot = slot(None, None);

        expect![[r#"
            Slot 2: 📝 no content
            Interval: 60 min
            Last sent: never
            Next post: with the next posting cycle
            Ad: not set, use /set_content"#]]
        .assert_eq(&describe_slot(&slot, t0()));
    }

    #[test]
    fn preview_of_media_without_caption() {
        assert_eq!(preview("  "), "(media without caption)");
        assert_eq!(preview("short"), "short");
    }
}
