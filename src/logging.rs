use crate::config::{LogFormat, LoggingConfig};
use crate::{Error, Result};
use tracing_subscriber::EnvFilter;

/// Filter from `RUST_LOG` when set, else the configured level
pub fn env_filter(config: &LoggingConfig) -> Result<EnvFilter> {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| Error::invalid("logging.level", e.to_string()))
}

/// Install the global subscriber. Fails if one is already set.
pub fn init(config: &LoggingConfig) -> Result<()> {
    let filter = env_filter(config)?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    let installed = match config.format {
        LogFormat::Pretty => builder.try_init(),
        LogFormat::Json => builder.json().with_current_span(false).try_init(),
    };

    installed.map_err(|e| Error::invalid("logging", e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::filter::LevelFilter;

    #[test]
    fn test_configured_level_is_used() {
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }
        let config = LoggingConfig {
            level: "gslb_watch=debug,warn".to_string(),
            ..LoggingConfig::default()
        };
        let filter = env_filter(&config).unwrap();
        assert_eq!(filter.max_level_hint(), Some(LevelFilter::DEBUG));
    }
}
