use clap::Parser;
use futures::prelude::*;
use std::panic::AssertUnwindSafe;
use std::process::ExitCode;
use tg_relay::tracing_err;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(version, about = "Relays messages from Telegram channels to a chat")]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(clap::Subcommand, Clone, Copy)]
enum Command {
    /// Watch the source chats and process the bot commands (default)
    Run,

    /// Sign in to the user account used to read the source chats
    Login,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    if dotenvy::dotenv().is_err() {
        eprintln!("Dotenv config was not found, ignoring this...")
    }

    let logging_task = tg_relay::init_logging();

    let command = args.command.unwrap_or(Command::Run);

    if let Command::Run = command {
        tg_relay::init_metrics();
    }

    let main_fut = AssertUnwindSafe(async {
        let result = try_main(command).await;

        result.map(|()| ExitCode::SUCCESS).unwrap_or_else(|err| {
            error!(err = tracing_err(&err), "Exitting with an error...");
            ExitCode::FAILURE
        })
    })
    .catch_unwind()
    .unwrap_or_else(|_| {
        error!("Exitting due to a panic...");
        ExitCode::FAILURE
    });

    let exit_code = if !cfg!(debug_assertions) {
        main_fut.await
    } else {
        // Don't wait for teloxide's shutdown logic when cancelling in debug mode.
        // That takes a lot of time for some reason:
        // https://github.com/teloxide/teloxide/issues/711
        tokio::select! {
            exit_code = main_fut => {
                info!("Main task has finished, exiting...");
                exit_code
            }
            () = abort_signal() => ExitCode::SUCCESS,
        }
    };

    logging_task.shutdown().await;

    exit_code
}

async fn try_main(command: Command) -> tg_relay::Result {
    match command {
        Command::Run => {
            let config = tg_relay::Config::load_or_panic();
            tg_relay::run(config).await
        }
        Command::Login => tg_relay::login().await,
    }
}

async fn abort_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(
            err = tracing_err(&err),
            "Failed to wait for Ctrl+C, exiting..."
        );
    } else {
        info!("Ctrl+C received, exiting forcefully...");
    }
}
