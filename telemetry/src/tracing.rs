use std::sync::Once;

use thiserror::Error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_log::LogTracer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

/// Environment variable pointing at a directory for rolling log files.
const LOG_DIR_ENV_NAME: &str = "APP_LOG_DIR";

/// Environment variable switching console output to JSON lines.
const LOG_JSON_ENV_NAME: &str = "APP_LOG_JSON";

/// Filter applied when `RUST_LOG` is not set.
const DEFAULT_FILTER: &str = "info";

static INIT_TEST_TRACING: Once = Once::new();

/// Errors raised while installing the global subscriber.
#[derive(Debug, Error)]
pub enum TracingError {
    #[error("failed to install the log bridge: {0}")]
    LogBridge(#[from] tracing_log::log::SetLoggerError),

    #[error("failed to install the global subscriber: {0}")]
    Init(#[from] tracing_subscriber::util::TryInitError),
}

/// Keeps the non-blocking file writer alive; dropping it flushes buffered lines.
#[must_use = "dropping the flusher stops file logging"]
#[derive(Debug)]
pub struct LogFlusher {
    _guard: Option<WorkerGuard>,
}

/// Installs the global subscriber for a service binary.
///
/// Console output is always enabled. When `APP_LOG_DIR` is set, a daily rolling file named after
/// `app_name` is written through a non-blocking writer as well. The pipeline id, when given,
/// is logged with the initialization event only; later events get it from the spans of the
/// pipeline and its stage tasks.
pub fn init_tracing(app_name: &str, pipeline_id: Option<u64>) -> Result<LogFlusher, TracingError> {
    LogTracer::init()?;

    let json = std::env::var(LOG_JSON_ENV_NAME).is_ok_and(|value| value == "1" || value == "true");
    let console_layer = if json {
        fmt::layer().json().with_current_span(true).boxed()
    } else {
        fmt::layer().with_target(true).boxed()
    };

    let (file_layer, guard) = match std::env::var(LOG_DIR_ENV_NAME) {
        Ok(directory) => {
            let appender = rolling::daily(directory, format!("{app_name}.log"));
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().json().with_writer(writer).boxed();

            (Some(layer), Some(guard))
        }
        Err(_) => (None, None),
    };

    Registry::default()
        .with(env_filter())
        .with(console_layer)
        .with(file_layer)
        .try_init()?;

    match pipeline_id {
        Some(pipeline_id) => tracing::info!(app_name, pipeline_id, "tracing initialized"),
        None => tracing::info!(app_name, "tracing initialized"),
    }

    Ok(LogFlusher { _guard: guard })
}

/// Installs a test writer subscriber once per process.
///
/// Safe to call from every test; later calls are no-ops.
pub fn init_test_tracing() {
    INIT_TEST_TRACING.call_once(|| {
        let _ = Registry::default()
            .with(env_filter())
            .with(fmt::layer().with_test_writer())
            .try_init();
    });
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}
