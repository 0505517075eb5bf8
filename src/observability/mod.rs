pub mod logger;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub use logger::{default_sink, DebugRecorder, DumpRecorder, Level, LogSink, TracingSink};

/// Install the process-wide subscriber. Logs go to stderr so search output on
/// stdout stays machine readable.
pub fn init_tracing(debug: bool) {
    let default_filter = if debug { "info,kibana_es_proxy=debug" } else { "info" };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
