use crate::config::from_env_or_panic;
use crate::observability::GLOBAL_LABELS;
use crate::prelude::*;
use serde::Deserialize;
use serde_with::serde_as;
use std::any::Any;
use std::collections::HashMap;
use tokio::task::JoinHandle;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Handle to the background log shipping. Call [`LoggingTask::shutdown`]
/// before exiting so that buffered logs are not lost.
pub struct LoggingTask {
    loki: Option<(JoinHandle<()>, tracing_loki::BackgroundTaskController)>,
}

impl LoggingTask {
    pub async fn shutdown(self) {
        let Some((task, controller)) = self.loki else {
            return;
        };

        info!("Flushing the remaining logs to Loki...");

        let ((), duration) = controller.shutdown().timed().await;

        // The subscriber may already be unusable at this point
        eprintln!("Loki logging task stopped in {duration:.2?}: {:?}", task.await);
    }
}

#[serde_as]
#[derive(Deserialize)]
struct LoggingConfig {
    /// Logs always go to stderr, Loki is optional
    loki_url: Option<url::Url>,

    /// Extra Loki labels as a JSON object
    #[serde(default)]
    #[serde_as(as = "serde_with::json::JsonString")]
    tg_relay_log_labels: HashMap<String, String>,
}

/// Installs the global subscriber. The filter is read from `TG_RELAY_LOG`
/// with the `RUST_LOG` syntax, `info` by default.
pub fn init_logging() -> LoggingTask {
    let cfg: LoggingConfig = from_env_or_panic("");

    let filter = EnvFilter::try_from_env("TG_RELAY_LOG").unwrap_or_else(|_| EnvFilter::new("info"));

    let stderr = tracing_subscriber::fmt::layer()
        .with_ansi(std::env::var("COLORS").as_deref() != Ok("0"))
        .with_writer(std::io::stderr)
        .pretty();

    let (loki_layer, loki) = cfg
        .loki_url
        .map(|url| loki_layer(url, cfg.tg_relay_log_labels))
        .unzip();

    tracing_subscriber::registry()
        .with(stderr)
        .with(loki_layer)
        .with(filter)
        .with(tracing_error::ErrorLayer::default())
        .init();

    install_panic_hook();

    LoggingTask { loki }
}

fn loki_layer(
    url: url::Url,
    mut labels: HashMap<String, String>,
) -> (
    tracing_loki::Layer,
    (JoinHandle<()>, tracing_loki::BackgroundTaskController),
) {
    for (key, value) in GLOBAL_LABELS.iter().chain(&[("source", "tg-relay")]) {
        labels.insert((*key).to_owned(), (*value).to_owned());
    }

    let mut builder = tracing_loki::builder();
    for (key, value) in labels {
        builder = builder
            .label(key, value)
            .unwrap_or_else(|err| panic!("BUG: invalid Loki label: {err:#?}"));
    }

    let (layer, controller, task) = builder
        .build_controller_url(url)
        .unwrap_or_else(|err| panic!("BUG: couldn't create the Loki layer: {err:#?}"));

    (layer, (tokio::spawn(task), controller))
}

/// Routes panics through `tracing`, so they reach Loki with the span trace
fn install_panic_hook() {
    let default_hook = std::panic::take_hook();

    std::panic::set_hook(Box::new(move |info| {
        // The default hook still prints to stderr in case the panic
        // happened inside the subscriber itself
        default_hook(info);

        error!(
            target: "panic",
            thread = std::thread::current().name(),
            location = info.location().map(ToString::to_string),
            span_trace = %tracing_error::SpanTrace::capture(),
            backtrace = format_args!("\n{}", std::backtrace::Backtrace::capture()),
            "{}",
            panic_message(info.payload()),
        );
    }));
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<String>() {
        return message;
    }
    payload.downcast_ref::<&str>().copied().unwrap_or("<unknown>")
}
