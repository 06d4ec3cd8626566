//! Server configuration.
//!
//! Sources, lowest priority first:
//!
//! 1. Built-in defaults
//! 2. A TOML file, if one is given
//! 3. Environment variables prefixed `SLUICE_`, with `__` separating nested
//!    keys
//!
//! - `SLUICE_ADDR=127.0.0.1:8080` → `addr = "127.0.0.1:8080"`
//! - `SLUICE_LOGGING__FORMAT=json` → `logging.format = "json"`

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::context::RequestSettings;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),

    #[error("configuration file `{0}` does not exist")]
    FileNotFound(String),

    #[error("invalid listen address `{addr}`: {source}")]
    InvalidAddr {
        addr: String,
        #[source]
        source: std::net::AddrParseError,
    },
}

/// Output format of the log subscriber.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive. `RUST_LOG` takes precedence when set.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_owned(), format: LogFormat::Compact }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub addr: String,
    /// Log full request snapshots on every request, not only on failures.
    pub verbose: bool,
    /// How long shutdown waits for in-flight requests before interrupting them.
    pub drain_timeout_secs: u64,
    pub logging: LoggingConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0:3000".to_owned(),
            verbose: false,
            drain_timeout_secs: 30,
            logging: LoggingConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Loads defaults, then `file`, then the environment.
    pub fn load(file: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = file
            && !path.exists()
        {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }
        let config: Self = Self::figment(file).extract().map_err(Box::new)?;
        config.socket_addr()?;
        Ok(config)
    }

    fn figment(file: Option<&Path>) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));
        if let Some(path) = file {
            figment = figment.merge(Toml::file(path));
        }
        figment.merge(Env::prefixed("SLUICE_").split("__"))
    }

    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.addr
            .parse()
            .map_err(|source| ConfigError::InvalidAddr { addr: self.addr.clone(), source })
    }

    pub fn request_settings(&self) -> RequestSettings {
        RequestSettings { verbose: self.verbose }
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use figment::Jail;

    use super::*;

    #[test]
    fn defaults_file_then_env() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "sluice.toml",
                r#"
                    addr = "127.0.0.1:8080"
                    drain_timeout_secs = 5

                    [logging]
                    format = "pretty"
                "#,
            )?;
            jail.set_env("SLUICE_VERBOSE", "true");
            jail.set_env("SLUICE_LOGGING__FORMAT", "json");

            let config = ServerConfig::load(Some(Path::new("sluice.toml"))).expect("config loads");

            assert_eq!(config.addr, "127.0.0.1:8080");
            assert!(config.verbose);
            assert!(config.request_settings().verbose);
            assert_eq!(config.drain_timeout(), Duration::from_secs(5));
            assert_eq!(config.logging.format, LogFormat::Json);
            assert_eq!(config.logging.level, "info");
            Ok(())
        });
    }

    #[test]
    fn bad_address_is_rejected() {
        Jail::expect_with(|jail| {
            jail.set_env("SLUICE_ADDR", "not-an-address");
            let err = ServerConfig::load(None).unwrap_err();
            assert!(matches!(err, ConfigError::InvalidAddr { .. }));
            Ok(())
        });
    }

    #[test]
    fn missing_file_is_an_error() {
        Jail::expect_with(|_| {
            let err = ServerConfig::load(Some(Path::new("absent.toml"))).unwrap_err();
            assert!(matches!(err, ConfigError::FileNotFound(_)));
            Ok(())
        });
    }
}
