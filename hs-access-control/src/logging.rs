use crate::config::{AccessControlConfig, LogFormat};
use crate::error::AccessError;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install a global tracing subscriber.
///
/// `RUST_LOG` wins over `config.log_level`. Fails if a subscriber is already
/// installed, which callers that initialise more than once may ignore.
pub fn init_tracing(config: &AccessControlConfig) -> Result<(), AccessError> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .map_err(|e| AccessError::ConfigError(format!("invalid log filter: {}", e)))?;

    let registry = tracing_subscriber::registry().with(env_filter);

    let result = match config.log_format {
        LogFormat::Pretty => registry
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_line_number(true),
            )
            .try_init(),
        LogFormat::Json => registry
            .with(fmt::layer().with_target(false).with_ansi(false).json())
            .try_init(),
    };

    result.map_err(|e| AccessError::ConfigError(format!("tracing already initialised: {}", e)))
}
