/// log4rs set-up for applications that let the cache manager configure logging
///
use std::str::FromStr;

use log::LevelFilter;
use log4rs::append::console::ConsoleAppender;
use log4rs::config::{Appender, Config, Root};
use log4rs::encode::pattern::PatternEncoder;

use crate::config::LoggingConfig;
use crate::error::{CacheError, Result};

const PATTERN: &str = "{d(%Y-%m-%d %H:%M:%S%.3f)} {h({l})} {T} {t} - {m}{n}";

pub fn level_filter(config: &LoggingConfig) -> Result<LevelFilter> {
    LevelFilter::from_str(&config.level)
        .map_err(|_| CacheError::InvalidConfig(format!("unknown log level: {}", config.level)))
}

/// Installs the global logger, from the log4rs file when one is named, else to the console.
/// Only the first call in a process can succeed.
pub fn init(config: &LoggingConfig) -> Result<()> {
    if let Some(file) = &config.config_file {
        log4rs::init_file(file, Default::default())?;
        log::info!("logging configured from {}", file.display());
        return Ok(());
    }

    let level = level_filter(config)?;
    let stdout = ConsoleAppender::builder()
        .encoder(Box::new(PatternEncoder::new(PATTERN)))
        .build();
    let log_config = Config::builder()
        .appender(Appender::builder().build("stdout", Box::new(stdout)))
        .build(Root::builder().appender("stdout").build(level))
        .map_err(|e| CacheError::InvalidConfig(e.to_string()))?;

    log4rs::init_config(log_config)
        .map_err(|e| CacheError::InvalidConfig(format!("logger already set: {}", e)))?;
    log::info!("logging configured at level {}", level);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels() {
        let mut config = LoggingConfig::default();
        assert_eq!(level_filter(&config).unwrap(), LevelFilter::Info);

        config.level = "TRACE".to_string();
        assert_eq!(level_filter(&config).unwrap(), LevelFilter::Trace);

        config.level = "loud".to_string();
        assert!(level_filter(&config).is_err());
    }

    #[test]
    fn second_init_fails() {
        let config = LoggingConfig {
            level: "warn".to_string(),
            config_file: None,
        };
        let _ = init(&config);
        assert!(init(&config).is_err());
    }

    #[test]
    fn missing_config_file() {
        let config = LoggingConfig {
            level: "info".to_string(),
            config_file: Some("no/such/log4rs.yaml".into()),
        };
        assert!(init(&config).is_err());
    }
}
