//! # Topology module
//!
//! This module computes, from a [`PerconaServerMySQL`] custom resource, the
//! names, labels and kubernetes resources which run and expose the mysql
//! members. Everything here is a pure function of the custom resource: the
//! same input always gives the same resources, which keeps the
//! reconciliation loop stable.
//!
//! The cluster name is neither truncated nor validated, it is up to the
//! caller to provide a name short enough to fit kubernetes constraints once
//! suffixed.

use std::collections::BTreeMap;

use k8s_openapi::api::{
    apps::v1::StatefulSet,
    core::v1::{ConfigMap, Service},
};
use kube::{api::ObjectMeta, ResourceExt};
use sha2::{Digest, Sha256};

use crate::svc::crd::mysql::PerconaServerMySQL;

pub mod container;
pub mod service;
pub mod statefulset;
pub mod volume;

// -----------------------------------------------------------------------------
// Constants

pub const COMPONENT_NAME: &str = "mysql";

pub const PORT: i32 = 3306;
pub const ADMIN_PORT: i32 = 33062;
pub const X_PORT: i32 = 33060;

pub const CUSTOM_CONFIG_KEY: &str = "my.cnf";

pub const COMPONENT_LABEL: &str = "app.kubernetes.io/component";
pub const NAME_LABEL: &str = "app.kubernetes.io/name";
pub const INSTANCE_LABEL: &str = "app.kubernetes.io/instance";
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const PART_OF_LABEL: &str = "app.kubernetes.io/part-of";
pub const PRIMARY_LABEL: &str = "mysql.percona.com/primary";
pub const EXPOSED_LABEL: &str = "percona.com/exposed";
pub const POD_NAME_LABEL: &str = "statefulset.kubernetes.io/pod-name";

pub const CONFIG_HASH_ANNOTATION: &str = "percona.com/configuration-hash";

// -----------------------------------------------------------------------------
// Naming helpers

/// returns the base name `<cluster>-mysql` shared by the statefulset and the
/// discovery service
pub fn name(cr: &PerconaServerMySQL) -> String {
    format!("{}-{}", cr.name_any(), COMPONENT_NAME)
}

pub fn service_name(cr: &PerconaServerMySQL) -> String {
    name(cr)
}

pub fn unready_service_name(cr: &PerconaServerMySQL) -> String {
    format!("{}-unready", name(cr))
}

pub fn primary_service_name(cr: &PerconaServerMySQL) -> String {
    format!("{}-primary", name(cr))
}

/// returns the name of the pod with the given ordinal, which is also the
/// name of its dedicated service
pub fn instance_name(cr: &PerconaServerMySQL, index: i32) -> String {
    format!("{}-{}", name(cr), index)
}

pub fn config_map_name(cr: &PerconaServerMySQL) -> String {
    name(cr)
}

/// returns the secret holding the credentials of system users
pub fn internal_secret_name(cr: &PerconaServerMySQL) -> String {
    format!("internal-{}", cr.name_any())
}

/// returns the dns name of a member resolved through the discovery service
pub fn instance_address(cr: &PerconaServerMySQL, index: i32) -> String {
    format!(
        "{}.{}.{}",
        instance_name(cr, index),
        service_name(cr),
        cr.namespace().unwrap_or_else(|| "default".to_string())
    )
}

/// returns the innodb cluster name, mysqlsh does not accept dashes
pub fn innodb_cluster_name(cr: &PerconaServerMySQL) -> String {
    cr.name_any().replace('-', "_")
}

/// returns the number of members, negative sizes are considered as empty
pub fn size(cr: &PerconaServerMySQL) -> i32 {
    cr.spec.mysql.size.max(0)
}

// -----------------------------------------------------------------------------
// Label helpers

/// returns the labels identifying the cluster
pub fn cluster_labels(cr: &PerconaServerMySQL) -> BTreeMap<String, String> {
    BTreeMap::from([
        (NAME_LABEL.to_string(), "percona-server".to_string()),
        (INSTANCE_LABEL.to_string(), cr.name_any()),
        (
            MANAGED_BY_LABEL.to_string(),
            "percona-server-operator".to_string(),
        ),
        (PART_OF_LABEL.to_string(), "percona-server".to_string()),
    ])
}

/// merges label maps, for a given key the last map wins
pub fn merge<'a, I>(maps: I) -> BTreeMap<String, String>
where
    I: IntoIterator<Item = &'a BTreeMap<String, String>>,
{
    maps.into_iter().fold(BTreeMap::new(), |mut acc, map| {
        acc.extend(map.iter().map(|(k, v)| (k.to_owned(), v.to_owned())));
        acc
    })
}

/// returns the labels of every resource of the component: custom labels
/// overlaid by cluster labels, the component label is always kept.
pub fn match_labels(cr: &PerconaServerMySQL) -> BTreeMap<String, String> {
    let component = BTreeMap::from([(COMPONENT_LABEL.to_string(), COMPONENT_NAME.to_string())]);

    merge([
        &component,
        &cr.spec.mysql.labels,
        &cluster_labels(cr),
        &component,
    ])
}

/// returns a copy of the labels with the given pairs added
pub fn with_labels(
    labels: &BTreeMap<String, String>,
    more: &[(&str, &str)],
) -> BTreeMap<String, String> {
    let more: BTreeMap<String, String> = more
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

    merge([labels, &more])
}

/// returns the hex encoded sha256 of the custom configuration
pub fn config_hash(cr: &PerconaServerMySQL) -> String {
    let mut hasher = Sha256::new();
    hasher.update(cr.spec.mysql.configuration.as_deref().unwrap_or_default());
    format!("{:x}", hasher.finalize())
}

/// returns a numeric fingerprint of the cluster name, mysqld derives its
/// server identifier from it
pub fn cluster_hash(cr: &PerconaServerMySQL) -> String {
    let digest = Sha256::digest(cr.name_any().as_bytes());
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&digest[..4]);

    u32::from_be_bytes(bytes).to_string()
}

// -----------------------------------------------------------------------------
// Topology structure

/// names and labels derived from the custom resource
#[derive(PartialEq, Eq, Clone, Debug)]
pub struct Topology {
    pub name: String,
    pub namespace: Option<String>,
    pub labels: BTreeMap<String, String>,
    pub service: String,
    pub unready_service: String,
    pub primary_service: String,
    pub instances: Vec<String>,
    pub addresses: Vec<String>,
    pub cluster: String,
}

impl From<&PerconaServerMySQL> for Topology {
    fn from(cr: &PerconaServerMySQL) -> Self {
        Self {
            name: name(cr),
            namespace: cr.namespace(),
            labels: match_labels(cr),
            service: service_name(cr),
            unready_service: unready_service_name(cr),
            primary_service: primary_service_name(cr),
            instances: (0..size(cr)).map(|i| instance_name(cr, i)).collect(),
            addresses: (0..size(cr)).map(|i| instance_address(cr, i)).collect(),
            cluster: innodb_cluster_name(cr),
        }
    }
}

// -----------------------------------------------------------------------------
// Resources structure

/// every kubernetes resource needed to run the mysql component
#[derive(PartialEq, Clone, Debug)]
pub struct Resources {
    pub topology: Topology,
    pub statefulset: StatefulSet,
    pub exposure: service::Exposure,
    pub config_map: Option<ConfigMap>,
}

impl Resources {
    /// returns services in the order they should be applied
    pub fn services(&self) -> Vec<&Service> {
        self.exposure.iter().collect()
    }
}

/// returns the configmap holding the custom configuration, if any
pub fn config_map(cr: &PerconaServerMySQL) -> Option<ConfigMap> {
    let configuration = cr.spec.mysql.configuration.to_owned()?;

    Some(ConfigMap {
        metadata: ObjectMeta {
            name: Some(config_map_name(cr)),
            namespace: cr.namespace(),
            labels: Some(match_labels(cr)),
            ..Default::default()
        },
        data: Some(BTreeMap::from([(
            CUSTOM_CONFIG_KEY.to_string(),
            configuration,
        )])),
        ..Default::default()
    })
}

/// computes the whole set of resources of the mysql component
#[cfg_attr(feature = "trace", tracing::instrument(skip(cr)))]
pub fn assemble(cr: &PerconaServerMySQL, init_image: &str) -> Resources {
    Resources {
        topology: Topology::from(cr),
        statefulset: statefulset::new(cr, init_image, &config_hash(cr)),
        exposure: service::Exposure::from(cr),
        config_map: config_map(cr),
    }
}

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::svc::crd::mysql::{MySqlSpec, Spec};

    pub(crate) fn cluster(name: &str) -> PerconaServerMySQL {
        let mut cr = PerconaServerMySQL::new(
            name,
            Spec {
                secrets_name: format!("{name}-secrets"),
                ssl_secret_name: format!("{name}-ssl"),
                mysql: MySqlSpec {
                    size: 3,
                    image: "percona/percona-server:8.0.25".to_string(),
                    ..Default::default()
                },
                pmm: None,
            },
        );

        cr.metadata.namespace = Some("databases".to_string());
        cr
    }

    #[test]
    fn names_derive_from_cluster_name() {
        let cr = cluster("db1");

        assert_eq!("db1-mysql", name(&cr));
        assert_eq!("db1-mysql", service_name(&cr));
        assert_eq!("db1-mysql-unready", unready_service_name(&cr));
        assert_eq!("db1-mysql-primary", primary_service_name(&cr));
        assert_eq!("db1-mysql-2", instance_name(&cr, 2));
        assert_eq!("internal-db1", internal_secret_name(&cr));
        assert_eq!(
            "db1-mysql-1.db1-mysql.databases",
            instance_address(&cr, 1)
        );
    }

    #[test]
    fn innodb_cluster_name_has_no_dash() {
        assert_eq!("my_db_1", innodb_cluster_name(&cluster("my-db-1")));
    }

    #[test]
    fn cluster_labels_win_over_custom_labels() {
        let mut cr = cluster("db1");
        cr.spec.mysql.labels = BTreeMap::from([
            (INSTANCE_LABEL.to_string(), "other".to_string()),
            ("team".to_string(), "payments".to_string()),
        ]);

        let labels = match_labels(&cr);

        assert_eq!(Some(&"db1".to_string()), labels.get(INSTANCE_LABEL));
        assert_eq!(Some(&"payments".to_string()), labels.get("team"));
    }

    #[test]
    fn component_label_cannot_be_overridden() {
        let mut cr = cluster("db1");
        cr.spec.mysql.labels =
            BTreeMap::from([(COMPONENT_LABEL.to_string(), "proxy".to_string())]);

        assert_eq!(
            Some(&COMPONENT_NAME.to_string()),
            match_labels(&cr).get(COMPONENT_LABEL)
        );
    }

    #[test]
    fn derived_labels_leave_origin_untouched() {
        let cr = cluster("db1");
        let labels = match_labels(&cr);
        let selector = with_labels(&labels, &[(PRIMARY_LABEL, "true")]);

        assert!(!labels.contains_key(PRIMARY_LABEL));
        assert_eq!(Some(&"true".to_string()), selector.get(PRIMARY_LABEL));
        assert_eq!(labels.len() + 1, selector.len());
    }

    #[test]
    fn topology_lists_instances() {
        let topology = Topology::from(&cluster("db1"));

        assert_eq!(
            vec!["db1-mysql-0", "db1-mysql-1", "db1-mysql-2"],
            topology.instances
        );
        assert_eq!("db1", topology.cluster);
        assert_eq!("db1-mysql-unready", topology.unready_service);
    }

    #[test]
    fn negative_size_gives_empty_topology() {
        let mut cr = cluster("db1");
        cr.spec.mysql.size = -2;

        let resources = assemble(&cr, "percona/init:latest");

        assert!(resources.topology.instances.is_empty());
        assert_eq!(
            Some(0),
            resources
                .statefulset
                .spec
                .as_ref()
                .and_then(|spec| spec.replicas)
        );
        assert!(resources.exposure.instances.is_empty());
    }

    #[test]
    fn assemble_is_deterministic() {
        let mut cr = cluster("db1");
        cr.spec.mysql.configuration = Some("[mysqld]\nmax_connections=250\n".to_string());
        cr.spec.mysql.expose.enabled = true;

        let first = assemble(&cr, "percona/init:latest");
        let second = assemble(&cr, "percona/init:latest");

        let encode = |resources: &Resources| {
            let mut buf = serde_json::to_vec(&resources.statefulset).expect("to serialize");
            for svc in resources.services() {
                buf.extend(serde_json::to_vec(svc).expect("to serialize"));
            }
            buf.extend(serde_json::to_vec(&resources.config_map).expect("to serialize"));
            buf
        };

        assert_eq!(encode(&first), encode(&second));
        assert_eq!(first, second);
    }

    #[test]
    fn config_map_only_with_configuration() {
        let mut cr = cluster("db1");
        assert!(config_map(&cr).is_none());

        cr.spec.mysql.configuration = Some("[mysqld]\n".to_string());
        let cm = config_map(&cr).expect("a configmap");

        assert_eq!(Some("db1-mysql".to_string()), cm.metadata.name);
        assert_eq!(
            Some(&"[mysqld]\n".to_string()),
            cm.data.as_ref().and_then(|data| data.get(CUSTOM_CONFIG_KEY))
        );
    }

    #[test]
    fn config_hash_follows_configuration() {
        let mut cr = cluster("db1");
        // sha256 of the empty string
        assert_eq!(
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855",
            config_hash(&cr)
        );

        cr.spec.mysql.configuration = Some("[mysqld]\n".to_string());
        assert_ne!(
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855",
            config_hash(&cr)
        );
    }
}
