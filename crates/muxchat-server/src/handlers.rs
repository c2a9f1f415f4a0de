//! Built-in command handlers.
//!
//! Only direct relays live here. Group, room and friend commands are part
//! of the catalogue but have no handler, so the loop drops their frames.

use async_trait::async_trait;
use muxchat_protocol::{Command, Marshaller, Reply, SendMany, SendOne};
use tracing::{debug, warn};

use crate::dispatch::{CommandHandler, Dispatcher, HandlerContext};

/// Relay a `SendOne` frame unchanged to its recipient.
///
/// The sender gets a tip reply when the recipient is offline.
pub struct SendOneRelay;

#[async_trait]
impl<M: Marshaller> CommandHandler<M> for SendOneRelay {
    async fn handle(&self, ctx: HandlerContext<'_, M>) -> anyhow::Result<()> {
        let msg: SendOne = ctx.payload()?;

        if !ctx.registry.contains(&msg.to).await {
            debug!(from = %msg.from, to = %msg.to, "recipient offline");
            let tip = Reply::tip(format!("{} is offline", msg.to));
            return ctx.reply(ctx.command, &tip).await;
        }

        if let Err(e) = ctx.registry.send_one(ctx.frame.as_bytes(), &msg.to).await {
            warn!(from = %msg.from, to = %msg.to, error = %e, "relay failed");
            ctx.reply(ctx.command, &Reply::debug(e.to_string())).await?;
        }
        Ok(())
    }
}

/// Fan a `SendMany` frame out to every listed recipient.
pub struct SendManyRelay;

#[async_trait]
impl<M: Marshaller> CommandHandler<M> for SendManyRelay {
    async fn handle(&self, ctx: HandlerContext<'_, M>) -> anyhow::Result<()> {
        let msg: SendMany = ctx.payload()?;

        if let Err(e) = ctx.registry.send_many(ctx.frame.to_bytes(), &msg.to).await {
            warn!(from = %msg.from, failed = ?e.failed_keys(), "fan-out partially failed");
            ctx.reply(ctx.command, &Reply::debug(e.to_string())).await?;
        }
        Ok(())
    }
}

/// Register the whole catalogue and the relay handlers.
pub fn register_builtin<M: Marshaller>(dispatcher: &mut Dispatcher<M>) {
    dispatcher.register_commands(Command::all_ids());
    dispatcher.register_handler(Command::SendOne.id(), SendOneRelay);
    dispatcher.register_handler(Command::SendMany.id(), SendManyRelay);
}
