//! provides logging helpers

use tracing::Subscriber;
use tracing_subscriber::filter::{self};
use tracing_subscriber::fmt::layer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

/// Unfiltered stderr layer; callers attach their own filter.
pub fn get_fmt_layer<S>() -> impl Layer<S> + Send + Sync
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    layer().with_writer(std::io::stderr).with_target(true)
}

/// `RUST_LOG` driven filter defaulting to `INFO`.
pub fn env_filter() -> filter::EnvFilter {
    filter::EnvFilter::builder()
        .with_default_directive(filter::LevelFilter::INFO.into())
        .from_env_lossy()
}

/// initiate the global tracing subscriber
pub fn init() {
    registry()
        .with(get_fmt_layer().with_filter(env_filter()))
        .init();
}
