//! Adding destinations by forwarding a message from the target chat

use crate::error::{err, UserError};
use crate::posting::AdSlot;
use crate::prelude::*;
use crate::tg::{self, cmd};
use crate::util::DynResult;
use crate::Result;
use parking_lot::Mutex as SyncMutex;
use std::collections::HashMap;
use std::sync::Arc;
use teloxide::prelude::*;
use teloxide::types::Chat;

/// Users that are expected to forward a message from a chat to make it
/// a destination of one of their slots. The state is lost on restart,
/// the user just needs to run the command again.
#[derive(Default)]
pub(crate) struct ForwardingRequests {
    armed: SyncMutex<HashMap<UserId, i32>>,
}

impl ForwardingRequests {
    pub(crate) fn arm(&self, user: UserId, slot_number: i32) {
        self.armed.lock().insert(user, slot_number);
    }

    /// Slot number the forwarded messages of the user are added to
    pub(crate) fn armed_slot(&self, user: UserId) -> Option<i32> {
        self.armed.lock().get(&user).copied()
    }

    /// Returns `false` if the user wasn't forwarding anything
    pub(crate) fn disarm(&self, user: UserId) -> bool {
        self.armed.lock().remove(&user).is_some()
    }
}

/// Adds the chat to the slot and returns the reply for the user
pub(crate) async fn add_destination(ctx: &tg::Ctx, slot: &AdSlot, chat: &Chat) -> Result<String> {
    if chat.is_private() {
        return Err(err!(UserError::InvalidChat {
            input: chat.display_name()
        }));
    }

    let alias = chat.display_name();

    let id = ctx.repo.destinations.add(slot, chat.id, &alias).await?;

    info!(
        slot = slot.id.0,
        destination = id.0,
        chat = %chat.debug_id(),
        "Added destination"
    );

    Ok(format!(
        "Added {alias} to slot {} as destination #{id}. \
        Make sure the workers are allowed to post there.",
        slot.slot_number
    ))
}

pub(crate) fn filter_forwarded_chat(msg: Message) -> Option<Chat> {
    if !msg.chat.is_private() {
        return None;
    }
    msg.forward_from_chat().cloned()
}

pub(crate) async fn handle_forwarded_chat(ctx: Arc<tg::Ctx>, msg: Message, chat: Chat) -> DynResult {
    let span = info_span!("handle_forwarded_chat", chat = %chat.debug_id());

    let result = async {
        let user = tg::sender(&msg)?;

        let Some(slot_number) = ctx.forwarding.armed_slot(user.id) else {
            ctx.bot
                .reply_plain(
                    &msg,
                    "To add this chat as a destination, run /add_destination <slot> first",
                )
                .await?;
            return Ok(());
        };

        let slot = ctx.subscriber_slot(user.id, slot_number).await?;
        let reply = add_destination(&ctx, &slot, &chat).await?;

        ctx.bot.reply_plain(&msg, &reply).await?;

        Ok::<_, crate::Error>(())
    }
    .instrument(span)
    .await;

    if let Err(err) = &result {
        cmd::reply_error(&ctx, &msg, err).await;
    }

    result.map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forwarding_stays_armed_until_cancelled() {
        let requests = ForwardingRequests::default();
        let user = UserId(7);

        assert_eq!(requests.armed_slot(user), None);

        requests.arm(user, 2);
        assert_eq!(requests.armed_slot(user), Some(2));
        assert_eq!(requests.armed_slot(user), Some(2));

        requests.arm(user, 3);
        assert_eq!(requests.armed_slot(user), Some(3));

        assert!(requests.disarm(user));
        assert!(!requests.disarm(user));
        assert_eq!(requests.armed_slot(user), None);
    }
}
