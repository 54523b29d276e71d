//! Telegram glue: the bot that accepts commands and posts to the destination
//! chat, and the user session client that reads the source chats.

mod cmd;
mod destination;
mod login;
mod source;

use crate::prelude::*;
use crate::relay::Relay;
use crate::Result;
use dptree::di::DependencyMap;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use teloxide::adaptors::{CacheMe, Throttle, Trace};
use teloxide::dispatching::UpdateFilterExt;
use teloxide::prelude::*;
use teloxide::types::{ChatId, UserId};
use teloxide::utils::command::BotCommands;

pub(crate) use cmd::CommandError;
pub(crate) use destination::TgDestination;
pub(crate) use login::login;
pub(crate) use source::{TgClientError, TgSource};

pub(crate) type Bot = Trace<CacheMe<Throttle<teloxide::Bot>>>;

#[derive(Deserialize, Clone)]
pub(crate) struct Config {
    pub(crate) token: String,

    /// Chat where all messages from the watched chats are relayed to
    pub(crate) destination_chat: ChatId,

    /// ID of the user who owns the bot. Only this user may control the relay.
    pub(crate) owner: UserId,
}

/// Credentials of the user session used to read the source chats
#[derive(Deserialize, Clone)]
pub(crate) struct ClientConfig {
    pub(crate) api_id: i32,
    pub(crate) api_hash: String,

    #[serde(default = "default_session_file")]
    pub(crate) session_file: PathBuf,
}

fn default_session_file() -> PathBuf {
    "tg-relay.session".into()
}

pub(crate) struct Ctx {
    bot: Bot,
    cfg: Arc<Config>,
    relay: Arc<Relay>,
}

pub(crate) fn create_bot(cfg: &Config) -> Bot {
    teloxide::Bot::new(cfg.token.clone())
        .throttle(Default::default())
        .cache_me()
        .trace(teloxide::adaptors::trace::Settings::all())
}

pub(crate) struct RunBotOptions {
    pub(crate) bot: Bot,
    pub(crate) cfg: Arc<Config>,
    pub(crate) relay: Arc<Relay>,
}

/// Processes the bot updates until Ctrl+C is received
pub(crate) async fn run_bot(opts: RunBotOptions) -> Result {
    let RunBotOptions { bot, cfg, relay } = opts;

    let mut di = DependencyMap::new();

    di.insert(Arc::new(Ctx {
        bot: bot.clone(),
        cfg,
        relay,
    }));

    info!("Starting bot...");

    bot.set_my_commands(cmd::owner::Cmd::bot_commands()).await?;

    let handler = dptree::entry()
        .branch(
            Update::filter_message()
                .filter_command::<cmd::StartCommand>()
                .endpoint(cmd::handle::<cmd::StartCommand>()),
        )
        .branch(
            Update::filter_message()
                .filter_command::<cmd::owner::Cmd>()
                .chain(dptree::filter(cmd::owner::filter))
                .endpoint(cmd::handle::<cmd::owner::Cmd>()),
        )
        .branch(
            Update::filter_message()
                .filter_command::<cmd::owner::Cmd>()
                .endpoint(cmd::deny_non_owner),
        )
        .branch(
            Update::filter_message()
                .filter(cmd::filter_pm_with_bot)
                .endpoint(cmd::reply_unrecognized),
        );

    Dispatcher::builder(bot, handler)
        .dependencies(di)
        // Messages in the destination chat and other updates are
        // of no interest, so they are silently ignored
        .default_handler(|_| std::future::ready(()))
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    info!("Bot stopped");

    Ok(())
}
