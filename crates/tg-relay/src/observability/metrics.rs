use super::GLOBAL_LABELS;
use crate::config::from_env_or_panic;
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};
use serde::Deserialize;
use std::net::Ipv4Addr;

/// Histogram buckets to measure the distribution of durations in seconds
pub(crate) const DEFAULT_DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
];

/// Messages observed by the relay labeled with `mode` and `outcome`
pub(crate) const RELAY_MESSAGES_TOTAL: &str = "relay_messages_total";

/// Chat completion calls labeled with `outcome`
pub(crate) const LLM_REQUESTS_TOTAL: &str = "llm_requests_total";

pub(crate) const LLM_TOKEN_REFRESHES_TOTAL: &str = "llm_token_refreshes_total";

/// Duration of a single real HTTP request
pub(crate) const HTTP_REQUEST_DURATION_SECONDS: &str = "http_request_duration_seconds";

pub(crate) const MEDIA_TRANSCODE_DURATION_SECONDS: &str = "media_transcode_duration_seconds";

fn describe_metrics() {
    metrics::describe_counter!(
        RELAY_MESSAGES_TOTAL,
        "Number of source messages processed by the relay"
    );
    metrics::describe_counter!(
        LLM_REQUESTS_TOTAL,
        "Number of chat completion requests sent to the LLM"
    );
    metrics::describe_counter!(
        LLM_TOKEN_REFRESHES_TOTAL,
        "Number of times the LLM access token was obtained anew"
    );
    metrics::describe_histogram!(
        HTTP_REQUEST_DURATION_SECONDS,
        metrics::Unit::Seconds,
        "Duration of a single real HTTP request"
    );
    metrics::describe_histogram!(
        MEDIA_TRANSCODE_DURATION_SECONDS,
        metrics::Unit::Seconds,
        "Duration of converting a video to mp4"
    );
}

#[derive(Deserialize)]
struct MetricsConfig {
    #[serde(default = "default_port")]
    port: u16,
}

fn default_port() -> u16 {
    2000
}

/// Starts the Prometheus scrape endpoint on the port from `METRICS_PORT`.
/// Must be called from within a tokio runtime.
pub fn init_metrics() {
    let config: MetricsConfig = from_env_or_panic("METRICS_");

    let builder = PrometheusBuilder::new()
        .with_http_listener((Ipv4Addr::UNSPECIFIED, config.port))
        .set_buckets_for_metric(
            Matcher::Suffix("_duration_seconds".to_owned()),
            DEFAULT_DURATION_BUCKETS,
        );

    let mut builder = builder.unwrap_or_else(|err| {
        panic!("BUG: invalid histogram buckets configuration: {err:#?}")
    });

    for (key, value) in GLOBAL_LABELS {
        builder = builder.add_global_label(*key, *value);
    }

    builder
        .install()
        .unwrap_or_else(|err| panic!("BUG: failed to initialize the metrics listener: {err:#?}"));

    describe_metrics();
}
