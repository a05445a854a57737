//! # Manifest module
//!
//! This module renders the kubernetes resources assembled from a custom
//! resource without talking to a cluster

use std::{path::PathBuf, sync::Arc};

use async_trait::async_trait;
use clap::Subcommand;
use serde::Serialize;

use crate::{
    cmd::Executor,
    svc::{cfg::Configuration, crd::mysql::PerconaServerMySQL, topology},
};

// -----------------------------------------------------------------------------
// Constants

pub const DEFAULT_NAMESPACE: &str = "default";

// -----------------------------------------------------------------------------
// Error enum

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to read file '{0}', {1}")]
    Read(PathBuf, std::io::Error),
    #[error("failed to parse custom resource, {0}")]
    Parse(serde_yaml::Error),
    #[error("failed to serialize resource, {0}")]
    Serialize(serde_yaml::Error),
}

// -----------------------------------------------------------------------------
// Manifest enum

#[derive(Subcommand, Clone, Debug)]
pub enum Manifest {
    /// Render resources assembled from a custom resource as a yaml stream
    #[clap(name = "render", aliases = &["r"])]
    Render {
        /// Path of the custom resource
        #[clap(short = 'f', long = "file")]
        file: PathBuf,
        /// Image of the init container, defaults to the configured one
        #[clap(short = 'i', long = "init-image")]
        init_image: Option<String>,
    },
}

#[async_trait]
impl Executor for Manifest {
    type Error = Error;

    #[cfg_attr(feature = "trace", tracing::instrument(skip(config)))]
    async fn execute(&self, config: Arc<Configuration>) -> Result<(), Self::Error> {
        match self {
            Self::Render { file, init_image } => {
                let content = tokio::fs::read_to_string(file)
                    .await
                    .map_err(|err| Error::Read(file.to_owned(), err))?;

                let cr = parse(&content)?;
                let image = init_image
                    .to_owned()
                    .unwrap_or_else(|| config.operator.init_image.to_owned());

                print!("{}", render(&cr, &image)?);
                Ok(())
            }
        }
    }
}

// -----------------------------------------------------------------------------
// Helpers

/// parses the custom resource, it lands in the default namespace if none is set
pub fn parse(content: &str) -> Result<PerconaServerMySQL, Error> {
    let mut cr: PerconaServerMySQL = serde_yaml::from_str(content).map_err(Error::Parse)?;
    if cr.metadata.namespace.is_none() {
        cr.metadata.namespace = Some(DEFAULT_NAMESPACE.to_string());
    }

    Ok(cr)
}

fn document<T: Serialize>(obj: &T) -> Result<String, Error> {
    Ok(format!(
        "---\n{}",
        serde_yaml::to_string(obj).map_err(Error::Serialize)?
    ))
}

/// returns the yaml stream of the assembled resources in apply order
pub fn render(cr: &PerconaServerMySQL, init_image: &str) -> Result<String, Error> {
    let resources = topology::assemble(cr, init_image);
    let mut documents = vec![];

    if let Some(config_map) = &resources.config_map {
        documents.push(document(config_map)?);
    }

    for service in resources.services() {
        documents.push(document(service)?);
    }

    documents.push(document(&resources.statefulset)?);
    Ok(documents.join(""))
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = r#"
apiVersion: ps.percona.com/v1alpha1
kind: PerconaServerMySQL
metadata:
  name: db1
spec:
  secretsName: db1-secrets
  sslSecretName: db1-ssl
  mysql:
    size: 3
    image: percona/percona-server:8.0.25
    configuration: |
      [mysqld]
      max_connections=250
"#;

    #[test]
    fn parse_defaults_the_namespace() {
        let cr = parse(MANIFEST).expect("manifest to parse");

        assert_eq!(Some(DEFAULT_NAMESPACE.to_string()), cr.metadata.namespace);
    }

    #[test]
    fn render_lists_resources_in_apply_order() {
        let cr = parse(MANIFEST).expect("manifest to parse");
        let stream = render(&cr, "percona/init:latest").expect("resources to render");

        let kinds: Vec<_> = stream
            .lines()
            .filter(|line| line.starts_with("kind: "))
            .collect();

        assert_eq!(
            vec![
                "kind: ConfigMap",
                "kind: Service",
                "kind: Service",
                "kind: Service",
                "kind: StatefulSet"
            ],
            kinds
        );
        assert_eq!(5, stream.matches("---\n").count());
    }

    #[test]
    fn parse_rejects_invalid_manifest() {
        assert!(matches!(parse("spec: 3"), Err(Error::Parse(_))));
    }
}
