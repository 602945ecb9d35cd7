use crate::payments::{Payment, SubscriptionListener};
use crate::prelude::*;
use crate::tg::Bot;
use async_trait::async_trait;
use chrono::prelude::*;
use teloxide::prelude::*;
use teloxide::utils::markdown;

/// Tells the users that their subscription is active
pub(crate) struct TgSubscriptionListener {
    bot: Bot,
}

impl TgSubscriptionListener {
    pub(crate) fn new(bot: Bot) -> Self {
        Self { bot }
    }
}

#[async_trait]
impl SubscriptionListener for TgSubscriptionListener {
    async fn on_subscription_activated(&self, payment: &Payment, expires_at: DateTime<Utc>) {
        let text = format!(
            "Payment {} is confirmed. Your {} subscription is active until {}. \
            Use /slots to set up your ads.",
            payment.id,
            payment.tier,
            expires_at.to_human_readable(),
        );

        let result = self
            .bot
            .send_message(ChatId::from(payment.user_id), markdown::escape(&text))
            .await;

        if let Err(err) = result {
            warn!(
                user = payment.user_id.0,
                err = tracing_err(&err),
                "Failed to notify the user about the activated subscription"
            );
        }
    }
}
