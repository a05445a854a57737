//! # Cluster module
//!
//! This module runs a single administrative command against a mysql member,
//! the command is cancelled on termination signal

use std::sync::Arc;

use async_trait::async_trait;
use clap::{Args, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{
    cmd::Executor,
    svc::{
        cfg::Configuration,
        exec::Process,
        mysqlsh::{self, Shell, Strategy},
    },
};

// -----------------------------------------------------------------------------
// Error enum

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to run administrative command, {0}")]
    Shell(mysqlsh::Error),
}

impl From<mysqlsh::Error> for Error {
    fn from(err: mysqlsh::Error) -> Self {
        Self::Shell(err)
    }
}

// -----------------------------------------------------------------------------
// Target structure

#[derive(Args, Clone, Debug)]
pub struct Target {
    /// Connection uri of the member, 'user:password@host:port'
    #[clap(short = 'u', long = "uri")]
    pub uri: String,
    /// Formation strategy, 'fresh' or 'adopt', defaults to the configured one
    #[clap(short = 's', long = "strategy")]
    pub strategy: Option<Strategy>,
}

// -----------------------------------------------------------------------------
// Cluster enum

#[derive(Subcommand, Clone, Debug)]
pub enum Cluster {
    /// Prepare the member to join or form a cluster
    #[clap(name = "configure-instance")]
    ConfigureInstance {
        #[clap(flatten)]
        target: Target,
    },
    /// Create the cluster from the member
    #[clap(name = "create")]
    Create {
        #[clap(flatten)]
        target: Target,
        /// Name of the cluster
        #[clap(short = 'n', long = "name")]
        name: String,
    },
    /// Print whether the cluster is reachable through the member
    #[clap(name = "exists")]
    Exists {
        #[clap(flatten)]
        target: Target,
        /// Name of the cluster
        #[clap(short = 'n', long = "name")]
        name: String,
    },
    /// Reconcile the cluster metadata with the replication group
    #[clap(name = "rescan")]
    Rescan {
        #[clap(flatten)]
        target: Target,
        /// Name of the cluster
        #[clap(short = 'n', long = "name")]
        name: String,
    },
}

impl Cluster {
    fn target(&self) -> &Target {
        match self {
            Self::ConfigureInstance { target }
            | Self::Create { target, .. }
            | Self::Exists { target, .. }
            | Self::Rescan { target, .. } => target,
        }
    }

    /// runs the command with the given shell, returns the text to print
    pub async fn run(&self, shell: &Shell, cancel: &CancellationToken) -> Result<String, Error> {
        Ok(match self {
            Self::ConfigureInstance { .. } => {
                shell.configure_instance(cancel).await?;
                "instance configured".to_string()
            }
            Self::Create { name, .. } => {
                shell.create_cluster(cancel, name).await?;
                format!("cluster '{}' created ({})", name, shell.strategy())
            }
            Self::Exists { name, .. } => shell.does_cluster_exist(cancel, name).await.to_string(),
            Self::Rescan { name, .. } => {
                shell.rescan_cluster(cancel, name).await?;
                format!("cluster '{}' rescanned", name)
            }
        })
    }
}

#[async_trait]
impl Executor for Cluster {
    type Error = Error;

    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    async fn execute(&self, config: Arc<Configuration>) -> Result<(), Self::Error> {
        let target = self.target();
        let executor = Arc::new(Process::new(config.mysqlsh.deadline()));
        let strategy = target.strategy.unwrap_or(config.mysqlsh.strategy);
        let shell = Shell::new(executor, target.uri.to_owned(), strategy)
            .with_program(config.mysqlsh.binary.to_owned());

        let cancel = CancellationToken::new();
        let signal = tokio::spawn({
            let cancel = cancel.to_owned();

            async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Received termination signal, cancel administrative command");
                    cancel.cancel();
                }
            }
        });

        debug!(shell = ?shell, "Run administrative command");
        let result = self.run(&shell, &cancel).await;
        signal.abort();

        println!("{}", result?);
        Ok(())
    }
}
