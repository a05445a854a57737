//! # MySQL shell module
//!
//! This module drives the innodb cluster metadata of a mysql member through
//! the administrative api of the `mysqlsh` program. Each operation runs
//! exactly one command in a fresh session, nothing is kept between calls.
//!
//! Ordering of operations across members is up to the caller: only one
//! member should create the cluster, the others are configured and added.

use std::{
    fmt::{self, Debug, Display, Formatter},
    str::FromStr,
    sync::Arc,
};

#[cfg(feature = "metrics")]
use once_cell::sync::Lazy;
#[cfg(feature = "metrics")]
use prometheus::{opts, register_counter_vec, CounterVec};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::svc::exec::{self, Executor};

// -----------------------------------------------------------------------------
// Constants

pub const DEFAULT_PROGRAM: &str = "mysqlsh";

// -----------------------------------------------------------------------------
// Telemetry

#[cfg(feature = "metrics")]
static MYSQLSH_COMMAND: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        opts!(
            "kubernetes_operator_mysqlsh_command",
            "number of administrative commands run against mysql members",
        ),
        &["operation", "status"]
    )
    .expect("metrics 'kubernetes_operator_mysqlsh_command' to not be already registered")
});

// -----------------------------------------------------------------------------
// Strategy enumeration

/// how the cluster metadata is formed when the cluster is created
#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Copy, Debug, Default)]
pub enum Strategy {
    /// form a brand new replication group
    #[default]
    #[serde(rename = "fresh")]
    Fresh,
    /// form the metadata around an already running replication group
    #[serde(rename = "adopt")]
    Adopt,
}

impl Display for Strategy {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Self::Fresh => write!(f, "fresh"),
            Self::Adopt => write!(f, "adopt"),
        }
    }
}

impl FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "fresh" => Ok(Self::Fresh),
            "adopt" => Ok(Self::Adopt),
            _ => Err(format!(
                "failed to parse '{}', available options are 'fresh' or 'adopt'",
                s
            )),
        }
    }
}

// -----------------------------------------------------------------------------
// Error enumeration

/// the command is kept with its credentials masked, it ends up in events
/// and logs
#[derive(thiserror::Error, Debug)]
#[error("failed to run '{command}', {cause}")]
pub struct RunError {
    pub command: String,
    pub cause: exec::Error,
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to configure instance, {0}")]
    ConfigureInstance(RunError),
    #[error("failed to create cluster, {0}")]
    CreateCluster(RunError),
    #[error("failed to get cluster status, {0}")]
    Status(RunError),
    #[error("failed to rescan cluster, {0}")]
    RescanCluster(RunError),
}

impl Error {
    pub fn run_error(&self) -> &RunError {
        match self {
            Self::ConfigureInstance(err)
            | Self::CreateCluster(err)
            | Self::Status(err)
            | Self::RescanCluster(err) => err,
        }
    }

    /// returns if the command has been aborted by a cancellation
    pub fn is_cancelled(&self) -> bool {
        self.run_error().cause.is_cancelled()
    }
}

// -----------------------------------------------------------------------------
// Helpers

pub const MASK: &str = "****";

/// returns the connection uri of a member, credentials are percent-encoded
pub fn uri(user: &str, password: &str, host: &str, port: i32) -> String {
    format!(
        "{}:{}@{}:{}",
        urlencoding::encode(user),
        urlencoding::encode(password),
        host,
        port
    )
}

/// returns the uri with its password replaced by [`MASK`]. Credentials are
/// percent-encoded, so the first ':' and '@' are the delimiters.
pub fn redact(uri: &str) -> String {
    match uri.split_once('@') {
        Some((credentials, host)) => match credentials.split_once(':') {
            Some((user, _)) => format!("{}:{}@{}", user, MASK, host),
            None => uri.to_string(),
        },
        None => uri.to_string(),
    }
}

// -----------------------------------------------------------------------------
// Shell structure

#[derive(Clone)]
pub struct Shell {
    executor: Arc<dyn Executor>,
    program: String,
    uri: String,
    strategy: Strategy,
}

impl Debug for Shell {
    // the uri embeds credentials
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shell")
            .field("program", &self.program)
            .field("strategy", &self.strategy)
            .finish_non_exhaustive()
    }
}

impl Shell {
    pub fn new(executor: Arc<dyn Executor>, uri: String, strategy: Strategy) -> Self {
        Self {
            executor,
            program: DEFAULT_PROGRAM.to_string(),
            uri,
            strategy,
        }
    }

    /// use another path for the `mysqlsh` program
    pub fn with_program(mut self, program: String) -> Self {
        self.program = program;
        self
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    async fn run(&self, cancel: &CancellationToken, command: String) -> Result<(), RunError> {
        if cancel.is_cancelled() {
            return Err(RunError {
                command: self.redacted(&command),
                cause: exec::Error::Cancelled,
            });
        }

        let args = vec![
            "--uri".to_string(),
            self.uri.to_owned(),
            "-e".to_string(),
            command.to_owned(),
        ];

        trace!(program = &self.program, "Execute administrative command");
        match self.executor.run(cancel, &self.program, &args).await {
            Ok(_) => Ok(()),
            Err(cause) => Err(RunError {
                command: self.redacted(&command),
                cause,
            }),
        }
    }

    fn redacted(&self, command: &str) -> String {
        command.replace(&self.uri, &redact(&self.uri))
    }

    /// prepares a standalone instance to join or form a cluster, the
    /// command is idempotent on the database side.
    #[cfg_attr(feature = "trace", tracing::instrument(skip(cancel)))]
    pub async fn configure_instance(&self, cancel: &CancellationToken) -> Result<(), Error> {
        let command = format!(
            "dba.configureInstance('{}', {{'interactive': false}})",
            self.uri
        );

        debug!("Configure mysql instance");
        let result = self.run(cancel, command).await.map_err(Error::ConfigureInstance);
        observe("configure_instance", &result);
        result
    }

    /// forms the cluster using the strategy given at construction
    #[cfg_attr(feature = "trace", tracing::instrument(skip(cancel)))]
    pub async fn create_cluster(&self, cancel: &CancellationToken, name: &str) -> Result<(), Error> {
        let command = match self.strategy {
            Strategy::Fresh => format!("dba.createCluster('{}')", name),
            Strategy::Adopt => format!("dba.createCluster('{}', {{'adoptFromGR': true}})", name),
        };

        debug!(cluster = name, strategy = self.strategy.to_string(), "Create innodb cluster");
        let result = self.run(cancel, command).await.map_err(Error::CreateCluster);
        observe("create_cluster", &result);
        result
    }

    /// queries the cluster status and returns the failure if any
    #[cfg_attr(feature = "trace", tracing::instrument(skip(cancel)))]
    pub async fn cluster_status(&self, cancel: &CancellationToken, name: &str) -> Result<(), Error> {
        let command = format!("dba.getCluster('{}').status()", name);

        let result = self.run(cancel, command).await.map_err(Error::Status);
        observe("cluster_status", &result);
        result
    }

    /// returns `false` on any failure, whatever the cause. Use
    /// [`Shell::cluster_status`] to tell an absent cluster from an
    /// unreachable member.
    #[cfg_attr(feature = "trace", tracing::instrument(skip(cancel)))]
    pub async fn does_cluster_exist(&self, cancel: &CancellationToken, name: &str) -> bool {
        match self.cluster_status(cancel, name).await {
            Ok(()) => true,
            Err(err) => {
                debug!(cluster = name, error = err.to_string(), "Consider cluster as missing");
                false
            }
        }
    }

    /// reconciles the cluster member list against the running instances
    #[cfg_attr(feature = "trace", tracing::instrument(skip(cancel)))]
    pub async fn rescan_cluster(&self, cancel: &CancellationToken, name: &str) -> Result<(), Error> {
        let command = format!("dba.getCluster('{}').rescan()", name);

        debug!(cluster = name, "Rescan innodb cluster");
        let result = self.run(cancel, command).await.map_err(Error::RescanCluster);
        observe("rescan_cluster", &result);
        result
    }
}

#[cfg(feature = "metrics")]
fn observe(operation: &str, result: &Result<(), Error>) {
    let status = match result {
        Ok(()) => "success",
        Err(err) if err.is_cancelled() => "cancelled",
        Err(_) => "failure",
    };

    MYSQLSH_COMMAND
        .with_label_values(&[operation, status])
        .inc();
}

#[cfg(not(feature = "metrics"))]
fn observe(_operation: &str, _result: &Result<(), Error>) {}

// -----------------------------------------------------------------------------
// Tests
