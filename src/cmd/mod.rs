//! # Command module
//!
//! This module provide command line interface structures and helpers
use std::{io, path::PathBuf, process::abort, sync::Arc};

use async_trait::async_trait;
use clap::{ArgAction, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::svc::{
    cfg::Configuration,
    crd::mysql,
    exec::Process,
    http::server,
    k8s::{client, Context, Watcher},
};

pub mod cluster;
pub mod crd;
pub mod manifest;

// -----------------------------------------------------------------------------
// Executor trait

#[async_trait]
pub trait Executor {
    type Error;

    async fn execute(&self, config: Arc<Configuration>) -> Result<(), Self::Error>;
}

// -----------------------------------------------------------------------------
// Error enum

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to execute command '{0}', {1}")]
    Execution(String, Arc<Error>),
    #[error("failed to execute command, {0}")]
    CustomResourceDefinition(crd::Error),
    #[error("failed to execute command, {0}")]
    Manifest(manifest::Error),
    #[error("failed to execute command, {0}")]
    Cluster(cluster::Error),
    #[error("failed to handle termination signal, {0}")]
    SigTerm(io::Error),
    #[error("failed to create kubernetes client, {0}")]
    Client(client::Error),
}

// -----------------------------------------------------------------------------
// Command enum

#[derive(Subcommand, Clone, Debug)]
pub enum Command {
    /// Interact with custom resource definition
    #[clap(name = "custom-resource-definition", aliases = &["crd"], subcommand)]
    CustomResourceDefinition(crd::CustomResourceDefinition),
    /// Render kubernetes resources from a custom resource
    #[clap(name = "manifest", subcommand)]
    Manifest(manifest::Manifest),
    /// Run an administrative command against a mysql member
    #[clap(name = "cluster", subcommand)]
    Cluster(cluster::Cluster),
}

#[async_trait]
impl Executor for Command {
    type Error = Error;

    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    async fn execute(&self, config: Arc<Configuration>) -> Result<(), Self::Error> {
        match self {
            Self::CustomResourceDefinition(crd) => crd
                .execute(config)
                .await
                .map_err(Error::CustomResourceDefinition)
                .map_err(|err| Error::Execution("custom-resource-definition".into(), Arc::new(err))),
            Self::Manifest(manifest) => manifest
                .execute(config)
                .await
                .map_err(Error::Manifest)
                .map_err(|err| Error::Execution("manifest".into(), Arc::new(err))),
            Self::Cluster(cluster) => cluster
                .execute(config)
                .await
                .map_err(Error::Cluster)
                .map_err(|err| Error::Execution("cluster".into(), Arc::new(err))),
        }
    }
}

// -----------------------------------------------------------------------------
// Args struct

#[derive(Parser, Clone, Debug)]
#[clap(author, version, about = env!("CARGO_PKG_DESCRIPTION"))]
pub struct Args {
    /// Increase log verbosity
    #[clap(short = 'v', global = true, action = ArgAction::Count)]
    pub verbosity: u8,
    /// Specify location of kubeconfig
    #[clap(short = 'k', long = "kubeconfig", global = true)]
    pub kubeconfig: Option<PathBuf>,
    /// Specify location of configuration
    #[clap(short = 'c', long = "config", global = true)]
    pub config: Option<PathBuf>,
    /// Check if configuration is healthy
    #[clap(short = 't', long = "check", global = true)]
    pub check: bool,
    #[clap(subcommand)]
    pub command: Option<Command>,
}

// -----------------------------------------------------------------------------
// daemon function

#[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
pub async fn daemon(kubeconfig: Option<PathBuf>, config: Arc<Configuration>) -> Result<(), Error> {
    // -------------------------------------------------------------------------
    // Create a new kubernetes client from path if defined, or via the
    // environment or defaults locations
    let kube = client::try_new(kubeconfig).await.map_err(Error::Client)?;

    // -------------------------------------------------------------------------
    // Create context to give to each reconciler, cancelling the root token
    // interrupts every in-flight administrative command
    let cancel = CancellationToken::new();
    let executor = Arc::new(Process::new(config.mysqlsh.deadline()));
    let context = Arc::new(Context::new(
        kube,
        config.to_owned(),
        executor,
        cancel.child_token(),
    ));

    // -------------------------------------------------------------------------
    // Create reconcilers and http server
    let handles = vec![
        tokio::spawn({
            let context = context.to_owned();

            async move {
                let reconciler = mysql::Reconciler::default();

                info!("Start to listen for events of percona server mysql custom resource");
                reconciler.watch(context.to_owned()).await;

                if !context.cancel.is_cancelled() {
                    error!("Could not reconcile percona server mysql custom resource anymore");
                    abort();
                }
            }
        }),
        tokio::spawn({
            let addr = config.operator.listen;
            let cancel = cancel.child_token();

            async move {
                if let Err(err) = server::serve(addr, cancel).await {
                    error!(error = err.to_string(), "Could not serve http requests");
                }
            }
        }),
    ];

    // -------------------------------------------------------------------------
    // Wait for termination signal
    tokio::signal::ctrl_c().await.map_err(Error::SigTerm)?;

    // -------------------------------------------------------------------------
    // Cancel reconcilers, in-flight commands and the http server
    info!("Received termination signal, cancel running tasks");
    cancel.cancel();

    for handle in handles {
        if let Err(err) = handle.await {
            if !err.is_cancelled() {
                error!(error = err.to_string(), "Could not wait for the task to complete");
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn command_line_is_consistent() {
        Args::command().debug_assert();
    }

    #[test]
    fn verbosity_is_counted() {
        let args = Args::parse_from(["mysql-operator", "-vvv", "--check"]);

        assert_eq!(3, args.verbosity);
        assert!(args.check);
        assert!(args.command.is_none());
    }

    #[test]
    fn subcommands_are_parsed() {
        let args = Args::parse_from(["mysql-operator", "crd", "view"]);
        assert!(matches!(
            args.command,
            Some(Command::CustomResourceDefinition(_))
        ));

        let args = Args::parse_from([
            "mysql-operator",
            "cluster",
            "create",
            "--uri",
            "operator:pass@db1-mysql-0:33062",
            "--name",
            "db1",
            "--strategy",
            "adopt",
        ]);
        assert!(matches!(args.command, Some(Command::Cluster(_))));
    }
}
