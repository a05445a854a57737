//! # Custom resource definition module
//!
//! This module provides custom resource module command line interface function
//! implementation

use std::sync::Arc;

use async_trait::async_trait;
use clap::Subcommand;
use kube::CustomResourceExt;

use crate::{
    cmd::Executor,
    svc::{cfg::Configuration, crd::mysql::PerconaServerMySQL},
};

// -----------------------------------------------------------------------------
// Error enum

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to serialize custom resource definition, {0}")]
    Serialize(serde_yaml::Error),
}

// -----------------------------------------------------------------------------
// CustomResourceDefinition enum

#[derive(Subcommand, Clone, Debug)]
pub enum CustomResourceDefinition {
    /// View custom resource definition
    #[clap(name = "view", aliases = &["v"])]
    View,
}

#[async_trait]
impl Executor for CustomResourceDefinition {
    type Error = Error;

    #[cfg_attr(feature = "trace", tracing::instrument(skip(_config)))]
    async fn execute(&self, _config: Arc<Configuration>) -> Result<(), Self::Error> {
        match self {
            Self::View => {
                print!("{}", view()?);
                Ok(())
            }
        }
    }
}

// -----------------------------------------------------------------------------
// view function

/// returns the custom resource definition serialized as yaml
pub fn view() -> Result<String, Error> {
    serde_yaml::to_string(&PerconaServerMySQL::crd()).map_err(Error::Serialize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn view_prints_the_definition() {
        let yaml = view().expect("definition to serialize");

        assert!(yaml.contains("kind: CustomResourceDefinition"));
        assert!(yaml.contains("name: perconaservermysqls.ps.percona.com"));
    }
}
