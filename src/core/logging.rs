use tracing::info;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan, MakeWriter},
    layer::SubscriberExt,
    registry::LookupSpan,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

use crate::{
    config::LoggingConfig,
    error::{AppError, Result},
};

/// Install the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over the configured level.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let level = normalize_level(&config.level);
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("warn,replica_balancer={}", level)));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer(config, std::io::stdout))
        .try_init()
        .map_err(|e| {
            AppError::InternalServerError(format!("Failed to initialize logging: {}", e))
        })?;

    info!(
        level = level,
        format = %config.format,
        show_target = config.show_target,
        thread_ids = config.thread_ids,
        "Structured logging initialized"
    );
    Ok(())
}

/// Output layer for the configured format, writing to `writer`
fn fmt_layer<S, W>(config: &LoggingConfig, writer: W) -> Box<dyn Layer<S> + Send + Sync>
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let base = fmt::layer()
        .with_writer(writer)
        .with_target(config.show_target)
        .with_thread_ids(config.thread_ids)
        .with_thread_names(config.thread_ids)
        .with_timer(fmt::time::ChronoUtc::rfc_3339());

    match config.format.as_str() {
        "json" => base.with_span_events(FmtSpan::CLOSE).json().boxed(),
        "pretty" => base.with_span_events(FmtSpan::NONE).pretty().boxed(),
        _ => base.with_span_events(FmtSpan::NONE).compact().boxed(),
    }
}

fn normalize_level(level: &str) -> &'static str {
    match level.to_lowercase().as_str() {
        "trace" => "trace",
        "debug" => "debug",
        "warn" => "warn",
        "error" => "error",
        _ => "info",
    }
}
