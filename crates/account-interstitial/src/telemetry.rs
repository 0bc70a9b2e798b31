use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, util::TryInitError};

use crate::settings::LoggingConfig;

/// Install the global tracing subscriber for hosts embedding the pipeline.
///
/// `RUST_LOG` wins over the configured level. Fails instead of panicking
/// when a subscriber is already installed.
pub fn init_tracing(config: &LoggingConfig) -> Result<(), TryInitError> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| config.level.clone().into());

    if config.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_init_reports_error() {
        let config = LoggingConfig::default();
        // The first call may lose the race against another test.
        let _ = init_tracing(&config);
        assert!(init_tracing(&config).is_err());
    }
}
