//! # Configuration module
//!
//! This module provide utilities and helpers to interact with the configuration

use std::{convert::TryFrom, net::SocketAddr, path::PathBuf, time::Duration};

use config::{builder::DefaultState, Config, ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::svc::mysqlsh::{self, Strategy};

// -----------------------------------------------------------------------------
// Constants

pub const DEFAULT_LISTEN: &str = "0.0.0.0:8000";
pub const DEFAULT_INIT_IMAGE: &str = "percona/percona-server-mysql-operator:0.1.0";
pub const DEFAULT_MYSQLSH_TIMEOUT: u64 = 600;
pub const DEFAULT_MYSQLSH_USER: &str = "operator";

// -----------------------------------------------------------------------------
// Operator structure

#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub struct Operator {
    #[serde(rename = "listen")]
    pub listen: SocketAddr,
    #[serde(rename = "initImage", alias = "initimage")]
    pub init_image: String,
}

// -----------------------------------------------------------------------------
// MySqlShell structure

#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub struct MySqlShell {
    #[serde(rename = "binary")]
    pub binary: String,
    #[serde(rename = "strategy")]
    pub strategy: Strategy,
    /// deadline of a single command in seconds, zero disables it
    #[serde(rename = "timeout")]
    pub timeout: u64,
    /// user whose password is read from the internal secret
    #[serde(rename = "user")]
    pub user: String,
}

impl MySqlShell {
    pub fn deadline(&self) -> Option<Duration> {
        match self.timeout {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

// -----------------------------------------------------------------------------
// Sentry structure

#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub struct Sentry {
    #[serde(rename = "dsn")]
    pub dsn: Option<String>,
}

// -----------------------------------------------------------------------------
// Jaeger structure

#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub struct Jaeger {
    #[serde(rename = "endpoint")]
    pub endpoint: String,
    #[serde(rename = "user")]
    pub user: Option<String>,
    #[serde(rename = "password")]
    pub password: Option<String>,
}

// -----------------------------------------------------------------------------
// Error enum

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to build configuration, {0}")]
    Build(ConfigError),
    #[error("failed to deserialize configuration, {0}")]
    Deserialize(ConfigError),
    #[error("failed to set default for key '{0}', {1}")]
    Default(String, ConfigError),
}

// -----------------------------------------------------------------------------
// Configuration structures

#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub struct Configuration {
    #[serde(rename = "operator")]
    pub operator: Operator,
    #[serde(rename = "mysqlsh")]
    pub mysqlsh: MySqlShell,
    #[serde(rename = "sentry", default)]
    pub sentry: Option<Sentry>,
    #[serde(rename = "jaeger", default)]
    pub jaeger: Option<Jaeger>,
}

impl TryFrom<PathBuf> for Configuration {
    type Error = Error;

    #[cfg_attr(feature = "trace", tracing::instrument)]
    fn try_from(path: PathBuf) -> Result<Self, Self::Error> {
        defaults()?
            .add_source(environment())
            .add_source(File::from(path).required(true))
            .build()
            .map_err(Error::Build)?
            .try_deserialize()
            .map_err(Error::Deserialize)
    }
}

impl Configuration {
    #[cfg_attr(feature = "trace", tracing::instrument)]
    pub fn try_default() -> Result<Self, Error> {
        let mut builder = defaults()?.add_source(environment());

        let mut paths = vec![
            PathBuf::from(format!("/usr/share/{}/config", env!("CARGO_PKG_NAME"))),
            PathBuf::from(format!("/etc/{}/config", env!("CARGO_PKG_NAME"))),
        ];

        if let Ok(home) = std::env::var("HOME") {
            paths.push(PathBuf::from(format!(
                "{}/.config/{}/config",
                home,
                env!("CARGO_PKG_NAME")
            )));
        }

        paths.push(PathBuf::from("config"));
        for path in paths {
            builder = builder.add_source(File::from(path).required(false));
        }

        builder
            .build()
            .map_err(Error::Build)?
            .try_deserialize()
            .map_err(Error::Deserialize)
    }

    /// log the effective configuration, credentials are never printed
    pub fn help(&self) {
        info!(
            listen = self.operator.listen.to_string(),
            init_image = &self.operator.init_image,
            "Operator configuration"
        );

        info!(
            binary = &self.mysqlsh.binary,
            strategy = self.mysqlsh.strategy.to_string(),
            timeout = self.mysqlsh.timeout,
            user = &self.mysqlsh.user,
            "MySql shell configuration"
        );

        info!(
            dsn = self
                .sentry
                .as_ref()
                .and_then(|sentry| sentry.dsn.as_ref())
                .is_some(),
            "Sentry configuration (dsn is hidden)"
        );

        if let Some(jaeger) = &self.jaeger {
            info!(
                endpoint = &jaeger.endpoint,
                user = ?jaeger.user,
                "Jaeger configuration (password is hidden)"
            );
        }
    }
}

// -----------------------------------------------------------------------------
// Helpers

/// reads `MYSQL_OPERATOR_<SECTION>__<KEY>` variables
fn environment() -> Environment {
    Environment::with_prefix(&env!("CARGO_PKG_NAME").replace('-', "_"))
        .prefix_separator("_")
        .separator("__")
}

fn defaults() -> Result<ConfigBuilder<DefaultState>, Error> {
    let defaults = [
        ("operator.listen", DEFAULT_LISTEN.to_string()),
        ("operator.initImage", DEFAULT_INIT_IMAGE.to_string()),
        ("mysqlsh.binary", mysqlsh::DEFAULT_PROGRAM.to_string()),
        ("mysqlsh.strategy", Strategy::default().to_string()),
        ("mysqlsh.timeout", DEFAULT_MYSQLSH_TIMEOUT.to_string()),
        ("mysqlsh.user", DEFAULT_MYSQLSH_USER.to_string()),
    ];

    let mut builder = Config::builder();
    for (key, value) in defaults {
        builder = builder
            .set_default(key, value)
            .map_err(|err| Error::Default(key.to_string(), err))?;
    }

    Ok(builder)
}

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_complete() {
        let config: Configuration = defaults()
            .expect("defaults to be set")
            .build()
            .expect("configuration to build")
            .try_deserialize()
            .expect("configuration to deserialize");

        assert_eq!(DEFAULT_LISTEN, config.operator.listen.to_string());
        assert_eq!(DEFAULT_INIT_IMAGE, config.operator.init_image);
        assert_eq!("mysqlsh", config.mysqlsh.binary);
        assert_eq!(Strategy::Fresh, config.mysqlsh.strategy);
        assert_eq!(Some(Duration::from_secs(600)), config.mysqlsh.deadline());
        assert_eq!("operator", config.mysqlsh.user);
        assert_eq!(None, config.sentry);
        assert_eq!(None, config.jaeger);
    }

    #[test]
    fn zero_timeout_disables_the_deadline() {
        let config: Configuration = defaults()
            .expect("defaults to be set")
            .set_override("mysqlsh.timeout", 0)
            .expect("override to be set")
            .set_override("mysqlsh.strategy", "adopt")
            .expect("override to be set")
            .build()
            .expect("configuration to build")
            .try_deserialize()
            .expect("configuration to deserialize");

        assert_eq!(None, config.mysqlsh.deadline());
        assert_eq!(Strategy::Adopt, config.mysqlsh.strategy);
    }

    #[test]
    fn environment_overrides_defaults() {
        std::env::set_var("MYSQL_OPERATOR_MYSQLSH__USER", "admin");
        let config: Result<Configuration, _> = defaults()
            .expect("defaults to be set")
            .add_source(environment())
            .build()
            .expect("configuration to build")
            .try_deserialize();
        std::env::remove_var("MYSQL_OPERATOR_MYSQLSH__USER");

        let config = config.expect("configuration to deserialize");
        assert_eq!("admin", config.mysqlsh.user);
        assert_eq!("mysqlsh", config.mysqlsh.binary);
    }
}
