mod config;
mod error;
mod filter;
mod http;
mod llm;
mod media;
mod observability;
mod relay;
mod tg;
mod util;

pub use crate::error::*;
pub use config::*;
pub use observability::*;

use crate::prelude::*;
use std::sync::Arc;
use tokio::sync::watch;

#[allow(unused_imports)]
mod prelude {
    pub(crate) use crate::error::prelude::*;
    pub(crate) use crate::http::prelude::*;
    pub(crate) use crate::observability::logging::prelude::*;
    pub(crate) use crate::util::prelude::*;
}

/// Run the relay: resume the saved watch and process the bot commands
/// until Ctrl+C is received
pub async fn run(config: Config) -> Result {
    let Config {
        tg: tg_cfg,
        tg_client: tg_client_cfg,
        llm: llm_cfg,
        relay: relay_cfg,
    } = config;

    if let Err(err) = media::remove_stale_files(&relay_cfg.media_dir).await {
        warn!(err = tracing_err(&err), "Failed to clean up the media directory");
    }

    let filter = Arc::new(filter::FilterRules::load(relay_cfg.rules_file.as_deref()).await?);
    let llm = Arc::new(llm::LlmClient::new(llm_cfg)?);

    let source = Arc::new(tg::TgSource::connect(&tg_client_cfg).await?);

    let bot = tg::create_bot(&tg_cfg);
    let destination = Arc::new(tg::TgDestination::new(bot.clone(), tg_cfg.destination_chat));

    let pipeline = Arc::new(relay::Pipeline {
        source: source.clone(),
        destination: destination.clone(),
        llm: llm.clone(),
        filter,
        transcoder: Arc::new(media::FfmpegTranscoder {
            timeout: relay_cfg.transcode_timeout,
        }),
        media_dir: relay_cfg.media_dir,
        max_upload_size: relay_cfg.max_upload_mb * util::size::MB,
        ai_ad_check: relay_cfg.ai_ad_check,
    });

    let hub = Arc::new(relay::EventHub::default());

    let relay = Arc::new(relay::Relay::new(
        pipeline,
        relay::ChatResolver::new(source.clone()),
        hub.clone(),
        relay::StateStore::new(relay_cfg.state_file),
    ));

    relay.resolver().clear().await;
    llm.clear_cache();

    relay
        .resolver()
        .ensure_destination_access(
            destination.as_ref(),
            &tg_cfg.destination_chat.to_string(),
        )
        .await?;

    match relay.resume().await {
        Ok(Some(summary)) => info!(
            mode = %summary.mode,
            watched = summary.watched.len(),
            failed = summary.failed.len(),
            "Resumed the saved watch"
        ),
        Ok(None) => {}
        Err(err) => warn!(err = tracing_err(&err), "Failed to resume the saved watch"),
    }

    let (stop_updates, updates_stopped) = watch::channel(());

    let updates = tokio::spawn({
        let source = source.clone();
        let updates_stopped = updates_stopped.clone();
        async move { source.run_updates(&hub, updates_stopped).await }
    });

    let keep_alive = tokio::spawn({
        let source = source.clone();
        async move { source.keep_alive(updates_stopped).await }
    });

    let result = tg::run_bot(tg::RunBotOptions {
        bot,
        cfg: Arc::new(tg_cfg),
        relay: relay.clone(),
    })
    .await;

    drop(stop_updates);

    if let Err(err) = updates.await {
        warn!(err = tracing_err(&err), "The updates listener has panicked");
    }

    if let Err(err) = keep_alive.await {
        warn!(err = tracing_err(&err), "The connection keep-alive has panicked");
    }

    if let Err(err) = relay.persist().await {
        warn!(err = tracing_err(&err), "Failed to persist the watch state on shutdown");
    }

    if let Err(err) = source.save_session() {
        warn!(err = tracing_err(&err), "Failed to save the Telegram session on shutdown");
    }

    result
}

/// Sign in to the Telegram user account that reads the source chats
pub async fn login() -> Result {
    let cfg: tg::ClientConfig = config::from_env_or_panic("TG_CLIENT_");
    tg::login(&cfg).await
}
