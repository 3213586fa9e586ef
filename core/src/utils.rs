use batcher_errors::BatcherError;
use std::future::Future;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, EnvFilter, Registry};

/// Initializes a [`tracing`] subscriber depending on the environment.
/// [`EnvFilter`] is used with an optional default level. Sets up the
/// [`color_eyre`] handler.
///
/// # Log Formats
///
/// - `json` **JSON** is used when `JSON_LOGS` is set
/// - `human` **Human-readable** direct logs otherwise
///
/// # Parameters
///
/// - `default_level`: Default level ranges from `0` to `5`. This is
///   overwritten through the `RUST_LOG` environment variable.
///
/// # Returns
///
/// Returns `Err` if `tracing` can't be initialized. Multiple subscription error
/// is ignored and will return `Ok(())`.
pub fn initialize_logger(level: Option<LevelFilter>) -> Result<(), BatcherError> {
    // Configure JSON formatting with additional fields
    let json_layer = fmt::layer::<Registry>()
        .with_test_writer()
        .with_file(true)
        .with_line_number(true)
        .with_target(true)
        .json();

    // Standard human-readable layer
    let standard_layer = fmt::layer().with_test_writer().with_target(true);

    let filter = match level {
        Some(level) => EnvFilter::builder()
            .with_default_directive(level.into())
            .from_env_lossy(),
        None => EnvFilter::from_default_env(),
    };

    if let Err(e) = color_eyre::install() {
        tracing::trace!("color_eyre is already installed: {e}");
    }

    let res = if std::env::var("JSON_LOGS").is_ok() {
        tracing_subscriber::util::SubscriberInitExt::try_init(
            tracing_subscriber::registry().with(json_layer).with(filter),
        )
    } else {
        tracing_subscriber::util::SubscriberInitExt::try_init(
            tracing_subscriber::registry().with(standard_layer).with(filter),
        )
    };

    if let Err(e) = res {
        // If it failed because of a re-initialization, do not care about
        // the error.
        if e.to_string() != "a global default trace dispatcher has already been set" {
            return Err(BatcherError::ConfigError(e.to_string()));
        }

        tracing::trace!("Tracing is already initialized, skipping without errors...");
    };

    Ok(())
}

/// Maps the CLI verbosity, `0` (off) to `5` (trace), to a level filter.
pub fn level_from_verbosity(verbose: u8) -> Option<LevelFilter> {
    match verbose {
        0 => None,
        1 => Some(LevelFilter::ERROR),
        2 => Some(LevelFilter::WARN),
        3 => Some(LevelFilter::INFO),
        4 => Some(LevelFilter::DEBUG),
        _ => Some(LevelFilter::TRACE),
    }
}

/// Bounds a single external call. Expiry surfaces as
/// [`BatcherError::Timeout`] naming the call.
pub async fn with_timeout<T, E, Fut>(
    duration: Duration,
    call: &'static str,
    fut: Fut,
) -> Result<T, BatcherError>
where
    Fut: Future<Output = Result<T, E>>,
    E: Into<BatcherError>,
{
    match tokio::time::timeout(duration, fut).await {
        Ok(result) => result.map_err(Into::into),
        Err(_) => {
            tracing::warn!(call, timeout = ?duration, "External call timed out");
            Err(BatcherError::Timeout(call))
        }
    }
}

/// Current unix time in seconds.
pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
