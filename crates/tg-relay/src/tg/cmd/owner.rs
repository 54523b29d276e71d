use crate::prelude::*;
use crate::relay::{SummaryPlan, WatchMode, WatchSummary};
use crate::{err, tg, Error, Result};
use async_trait::async_trait;
use itertools::Itertools;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use teloxide::prelude::*;
use teloxide::utils::command::BotCommands;

/// Upper bound for the number of messages requested via `/sum`
const MAX_SUMMARY_COUNT: usize = 100;

/// Upper bound for the interval between the messages of `/sum`
const MAX_SUMMARY_INTERVAL_SECS: u64 = 60 * 60;

const DEFAULT_SUMMARY_COUNT: usize = 1;
const DEFAULT_SUMMARY_INTERVAL: Duration = Duration::from_secs(5);

#[derive(BotCommands, Clone, Debug)]
#[command(
    rename_rule = "camelCase",
    description = "Доступные команды (ID каналов/групп: @имя, имя или числовой ID):"
)]
pub(crate) enum Cmd {
    #[command(description = "показать это сообщение")]
    Help,

    #[command(description = "<ID...> - начать наблюдение за новыми сообщениями")]
    Watch(String),

    #[command(description = "<ID...> - начать наблюдение с обработкой текста AI")]
    WatchAi(String),

    #[command(description = "<ID> [количество=1] [интервал=5] - переслать последние \
        сообщения с заданным интервалом в секундах")]
    Sum(String),

    #[command(description = "<ID> [количество=1] [интервал=5] - то же, что /sum, \
        но с обработкой текста AI")]
    SumAi(String),

    #[command(description = "остановить текущее наблюдение")]
    Stop,
}

pub(crate) fn filter(ctx: Arc<tg::Ctx>, msg: Message) -> bool {
    matches!(msg.from(), Some(sender) if sender.id == ctx.cfg.owner)
}

#[async_trait]
impl tg::cmd::Command for Cmd {
    async fn handle(self, ctx: &tg::Ctx, msg: &Message) -> Result {
        match self {
            Cmd::Help => {
                ctx.bot.reply_help::<Cmd>(msg).await?;
            }
            Cmd::Watch(args) => watch(ctx, msg, WatchMode::Plain, &args).await?,
            Cmd::WatchAi(args) => watch(ctx, msg, WatchMode::Ai, &args).await?,
            Cmd::Sum(args) => summarize(ctx, msg, WatchMode::Plain, args.parse()?).await?,
            Cmd::SumAi(args) => summarize(ctx, msg, WatchMode::Ai, args.parse()?).await?,
            Cmd::Stop => {
                let reply = match ctx.relay.stop().await {
                    Some(_) => "Текущий процесс был остановлен.",
                    None => "Нет активных процессов для остановки.",
                };
                ctx.bot.reply_to(msg, reply).await?;
            }
        }
        Ok(())
    }
}

async fn watch(ctx: &tg::Ctx, msg: &Message, mode: WatchMode, args: &str) -> Result {
    let identifiers = parse_identifiers(args)?;

    let summary = ctx.relay.start(mode, identifiers).await?;

    ctx.bot.reply_to(msg, describe_watch(&summary)).await?;

    Ok(())
}

fn describe_watch(summary: &WatchSummary) -> String {
    let chats = summary.watched.iter().map(|chat| &chat.title).join(", ");

    let mut text = match summary.mode {
        WatchMode::Plain => format!("Наблюдение за новыми сообщениями из каналов/групп: {chats}"),
        WatchMode::Ai => {
            format!("Наблюдение с обработкой AI за новыми сообщениями из каналов/групп: {chats}")
        }
    };

    if !summary.failed.is_empty() {
        let failed = summary.failed.iter().map(|(identifier, _)| identifier).join(", ");
        text.push_str(&format!("\nНе удалось найти: {failed}"));
    }

    text
}

async fn summarize(ctx: &tg::Ctx, msg: &Message, mode: WatchMode, args: SumArgs) -> Result {
    let plan = ctx
        .relay
        .summarize(mode, &args.channel, args.count, args.interval)
        .await?;

    ctx.bot
        .reply_to(msg, describe_summary(&plan, args.interval))
        .await?;

    Ok(())
}

fn describe_summary(plan: &SummaryPlan, interval: Duration) -> String {
    let mut text = String::new();

    if plan.stopped.is_some() {
        text.push_str("Текущий процесс был остановлен.\n");
    }

    if plan.scheduled == 0 {
        text.push_str("Сообщений не найдено.");
    } else {
        text.push_str(&format!(
            "Сообщений к отправке: {}, интервал: {} с.",
            plan.scheduled,
            interval.as_secs()
        ));
    }

    text
}

/// Identifiers may be separated with whitespace or commas
fn parse_identifiers(args: &str) -> Result<Vec<String>> {
    let identifiers: Vec<_> = args
        .split(|char: char| char.is_whitespace() || char == ',')
        .filter(|identifier| !identifier.is_empty())
        .map(ToOwned::to_owned)
        .collect();

    if identifiers.is_empty() {
        return Err(err!(CommandError::MissingChannels));
    }

    Ok(identifiers)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SumArgs {
    channel: String,
    count: usize,
    interval: Duration,
}

impl FromStr for SumArgs {
    type Err = Error;

    fn from_str(input: &str) -> Result<Self> {
        let mut args = input.split_whitespace();

        let channel = args
            .next()
            .ok_or_else(|| err!(CommandError::MissingChannel))?
            .to_owned();

        let count = match args.next() {
            None => DEFAULT_SUMMARY_COUNT,
            Some(input) => input
                .parse()
                .ok()
                .filter(|count| (1..=MAX_SUMMARY_COUNT).contains(count))
                .ok_or_else(|| {
                    err!(CommandError::InvalidCount {
                        input: input.to_owned()
                    })
                })?,
        };

        let interval = match args.next() {
            None => DEFAULT_SUMMARY_INTERVAL,
            Some(input) => input
                .parse()
                .ok()
                .filter(|&secs| secs <= MAX_SUMMARY_INTERVAL_SECS)
                .map(Duration::from_secs)
                .ok_or_else(|| {
                    err!(CommandError::InvalidInterval {
                        input: input.to_owned()
                    })
                })?,
        };

        let extra = args.join(" ");
        if !extra.is_empty() {
            return Err(err!(CommandError::TooManyArguments { extra }));
        }

        Ok(Self {
            channel,
            count,
            interval,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum CommandError {
    #[error("Вы не указали ID каналов/групп")]
    MissingChannels,

    #[error("Вы не указали ID канала")]
    MissingChannel,

    #[error("Количество сообщений должно быть числом от 1 до {MAX_SUMMARY_COUNT}, получено `{input}`")]
    InvalidCount { input: String },

    #[error(
        "Интервал должен быть целым числом секунд от 0 до {MAX_SUMMARY_INTERVAL_SECS}, получено `{input}`"
    )]
    InvalidInterval { input: String },

    #[error("Лишние аргументы команды: `{extra}`")]
    TooManyArguments { extra: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;
    use assert_matches::assert_matches;

    macro_rules! assert_command_error {
        ($err:expr, $pattern:pat $(if $guard:expr)?) => {{
            let err = $err;
            assert!(err.is_user_error());
            assert_matches!(
                err.kind(),
                ErrorKind::Command { source: $pattern } $(if $guard)?
            );
        }};
    }

    #[test]
    fn commands_are_parsed() {
        assert_matches!(
            Cmd::parse("/watchAi @a -1001234", "relay_bot"),
            Ok(Cmd::WatchAi(args)) if args == "@a -1001234"
        );
        assert_matches!(Cmd::parse("/stop", "relay_bot"), Ok(Cmd::Stop));
        assert_matches!(
            Cmd::parse("/sumAi@relay_bot @news 3", "relay_bot"),
            Ok(Cmd::SumAi(args)) if args == "@news 3"
        );
    }

    #[test]
    fn identifiers_are_split_by_whitespace_and_commas() {
        assert_eq!(
            parse_identifiers(" @a, @b  -1001234,,news ").unwrap(),
            ["@a", "@b", "-1001234", "news"]
        );

        assert_command_error!(
            parse_identifiers(" , ").unwrap_err(),
            CommandError::MissingChannels
        );
    }

    #[test]
    fn sum_args_defaults() {
        let args: SumArgs = "@news".parse().unwrap();
        assert_eq!(
            args,
            SumArgs {
                channel: "@news".to_owned(),
                count: 1,
                interval: Duration::from_secs(5),
            }
        );

        let args: SumArgs = "@news 10 0".parse().unwrap();
        assert_eq!(args.count, 10);
        assert_eq!(args.interval, Duration::ZERO);
    }

    #[test]
    fn summary_reply_mentions_the_stopped_watch() {
        let interval = Duration::from_secs(5);

        let reply = describe_summary(
            &SummaryPlan {
                scheduled: 3,
                stopped: Some(WatchMode::Ai),
            },
            interval,
        );
        expect_test::expect![[r#"
            Текущий процесс был остановлен.
            Сообщений к отправке: 3, интервал: 5 с."#]]
        .assert_eq(&reply);

        let reply = describe_summary(
            &SummaryPlan {
                scheduled: 0,
                stopped: None,
            },
            interval,
        );
        expect_test::expect!["Сообщений не найдено."].assert_eq(&reply);
    }

    #[test]
    fn invalid_sum_args() {
        assert_command_error!(
            "".parse::<SumArgs>().unwrap_err(),
            CommandError::MissingChannel
        );

        for count in ["0", "-1", "abc", "101"] {
            assert_command_error!(
                format!("@news {count}").parse::<SumArgs>().unwrap_err(),
                CommandError::InvalidCount { input } if input == count
            );
        }

        for interval in ["soon", "-5", "3601", "18446744073709551615"] {
            assert_command_error!(
                format!("@news 2 {interval}").parse::<SumArgs>().unwrap_err(),
                CommandError::InvalidInterval { input } if input == interval
            );
        }

        let args: SumArgs = "@news 2 3600".parse().unwrap();
        assert_eq!(args.interval, Duration::from_secs(3600));

        assert_command_error!(
            "@news 2 3 4 5".parse::<SumArgs>().unwrap_err(),
            CommandError::TooManyArguments { extra } if extra == "4 5"
        );
    }
}
