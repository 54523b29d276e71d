pub(crate) mod owner;

use crate::prelude::*;
use crate::relay::WatchMode;
use crate::util::DynResult;
use crate::{tg, Result};
use async_trait::async_trait;
use futures::future::BoxFuture;
use itertools::Itertools;
use std::fmt;
use std::sync::Arc;
use teloxide::types::{Message, User};
use teloxide::utils::command::BotCommands;

pub(crate) use owner::CommandError;

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
            chat = %msg.chat.debug_id(),
            cmd = format_args!("{cmd:?}")
        );

        let fut = async move {
            debug!("Processing command");

            let result = cmd.handle(&ctx, &msg).await;
            if let Err(err) = &result {
                let span = warn_span!("err", err = tracing_err(err), id = err.id());
                async {
                    if !err.is_user_error() {
                        warn!("Command handler returned an error");
                    }

                    let reply_msg = format!("Ошибка: {}", err.display_chain());

                    let msg_result = ctx.bot.reply_to(&msg, reply_msg).await;

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
            result.map_err(Into::into)
        };

        Box::pin(fut.instrument(info))
    }
}

/// Special case for the `/start` command.
///
/// It's available to everyone and we don't want it to appear
/// in the list of commands, so it's handled separately
#[derive(BotCommands, Clone, Debug)]
#[command(rename_rule = "snake_case")]
pub(crate) enum StartCommand {
    #[command(description = "unreachable")]
    Start,
}

#[async_trait]
impl Command for StartCommand {
    async fn handle(self, ctx: &tg::Ctx, msg: &Message) -> Result {
        let status = match ctx.relay.current().await {
            None => "Сейчас наблюдение не ведётся.".to_owned(),
            Some((mode, chats)) => {
                let mode = match mode {
                    WatchMode::Plain => "без обработки",
                    WatchMode::Ai => "с обработкой AI",
                };
                format!("Сейчас идёт наблюдение ({mode}): {}", chats.iter().join(", "))
            }
        };

        let text = format!(
            "Привет! Я пересылаю сообщения из каналов и групп в чат назначения.\n\n\
            {}\n\n\
            {status}",
            owner::Cmd::descriptions()
        );

        ctx.bot.reply_to(msg, text).await?;

        Ok(())
    }
}

pub(crate) fn filter_pm_with_bot(msg: Message) -> bool {
    msg.chat.is_private()
}

#[instrument(skip_all, fields(sender = msg.from().map(User::debug_id).as_deref()))]
pub(crate) async fn deny_non_owner(ctx: Arc<tg::Ctx>, msg: Message) -> DynResult {
    info!("Non-owner user tried to use the owner command");

    ctx.bot
        .reply_to(&msg, "Эта команда доступна только владельцу бота.")
        .await?;

    Ok(())
}

/// Replies to the messages in private chat that aren't known commands
pub(crate) async fn reply_unrecognized(ctx: Arc<tg::Ctx>, msg: Message) -> DynResult {
    let Some(text) = msg.text() else {
        return Ok(());
    };

    let reply = if text.starts_with('/') {
        format!(
            "Команда \"{text}\" не распознана. \
            Используйте /start для просмотра доступных команд."
        )
    } else {
        format!(
            "Ваше сообщение \"{text}\" не распознано как команда. \
            Используйте /start для просмотра доступных команд."
        )
    };

    ctx.bot.reply_to(&msg, reply).await?;

    Ok(())
}
