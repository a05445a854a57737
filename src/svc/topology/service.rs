//! # Service module
//!
//! This module provides the services exposing the mysql members: the
//! headless discovery service, the unready service, the primary pointer and
//! one service per member.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use kube::{api::ObjectMeta, ResourceExt};

use crate::svc::{
    crd::mysql::{PerconaServerMySQL, ServiceType},
    topology::{
        self, ADMIN_PORT, COMPONENT_NAME, EXPOSED_LABEL, PORT, POD_NAME_LABEL, PRIMARY_LABEL,
        X_PORT,
    },
};

// -----------------------------------------------------------------------------
// Constants

pub const CLUSTER_IP_NONE: &str = "None";

// -----------------------------------------------------------------------------
// Helpers

fn port(name: &str, port: i32) -> ServicePort {
    ServicePort {
        name: Some(name.to_string()),
        port,
        ..Default::default()
    }
}

/// returns the client, administrative and x protocol ports
pub fn ports() -> Vec<ServicePort> {
    vec![
        port(COMPONENT_NAME, PORT),
        port(&format!("{}-admin", COMPONENT_NAME), ADMIN_PORT),
        port(&format!("{}x", COMPONENT_NAME), X_PORT),
    ]
}

fn metadata(
    cr: &PerconaServerMySQL,
    name: String,
    labels: BTreeMap<String, String>,
) -> ObjectMeta {
    ObjectMeta {
        name: Some(name),
        namespace: cr.namespace(),
        labels: Some(labels),
        ..Default::default()
    }
}

/// returns a headless service publishing addresses of pods that are not
/// ready yet, members must see each other before they pass readiness
fn headless(cr: &PerconaServerMySQL, name: String) -> Service {
    let labels = topology::match_labels(cr);

    Service {
        metadata: metadata(cr, name, labels.to_owned()),
        spec: Some(ServiceSpec {
            type_: Some(ServiceType::ClusterIP.to_string()),
            cluster_ip: Some(CLUSTER_IP_NONE.to_string()),
            ports: Some(ports()),
            selector: Some(labels),
            publish_not_ready_addresses: Some(true),
            ..Default::default()
        }),
        ..Default::default()
    }
}

// -----------------------------------------------------------------------------
// Services

/// returns the discovery service, it governs the statefulset
pub fn discovery(cr: &PerconaServerMySQL) -> Service {
    headless(cr, topology::service_name(cr))
}

pub fn unready(cr: &PerconaServerMySQL) -> Service {
    headless(cr, topology::unready_service_name(cr))
}

/// returns the service routing to the member labelled as primary
pub fn primary(cr: &PerconaServerMySQL) -> Service {
    let labels = topology::match_labels(cr);
    let selector = topology::with_labels(&labels, &[(PRIMARY_LABEL, "true")]);
    let type_ = cr.spec.mysql.primary_service_type.unwrap_or_default();

    Service {
        metadata: metadata(cr, topology::primary_service_name(cr), labels),
        spec: Some(ServiceSpec {
            type_: Some(type_.to_string()),
            ports: Some(ports()),
            selector: Some(selector),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// returns the service dedicated to the given pod
pub fn instance(cr: &PerconaServerMySQL, type_: ServiceType, pod: &str) -> Service {
    let base = topology::match_labels(cr);
    let labels = topology::with_labels(&base, &[(EXPOSED_LABEL, "true")]);
    let selector = topology::with_labels(&base, &[(POD_NAME_LABEL, pod)]);

    Service {
        metadata: metadata(cr, pod.to_string(), labels),
        spec: Some(ServiceSpec {
            type_: Some(type_.to_string()),
            ports: Some(ports()),
            selector: Some(selector),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// returns one service per member when exposure is requested
pub fn instances(cr: &PerconaServerMySQL) -> Vec<Service> {
    let expose = &cr.spec.mysql.expose;
    if !expose.enabled {
        return vec![];
    }

    (0..topology::size(cr))
        .map(|index| {
            instance(
                cr,
                expose.type_.unwrap_or_default(),
                &topology::instance_name(cr, index),
            )
        })
        .collect()
}

// -----------------------------------------------------------------------------
// Exposure structure

/// every service of the mysql component
#[derive(PartialEq, Clone, Debug)]
pub struct Exposure {
    pub discovery: Service,
    pub unready: Service,
    pub primary: Service,
    pub instances: Vec<Service>,
}

impl From<&PerconaServerMySQL> for Exposure {
    fn from(cr: &PerconaServerMySQL) -> Self {
        Self {
            discovery: discovery(cr),
            unready: unready(cr),
            primary: primary(cr),
            instances: instances(cr),
        }
    }
}

impl Exposure {
    pub fn iter(&self) -> impl Iterator<Item = &Service> {
        [&self.discovery, &self.unready, &self.primary]
            .into_iter()
            .chain(self.instances.iter())
    }
}

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
mod tests {
    use super::*;
    use crate::svc::topology::tests::cluster;

    fn spec(svc: &Service) -> &ServiceSpec {
        svc.spec.as_ref().expect("a service spec")
    }

    fn port_numbers(svc: &Service) -> Vec<i32> {
        spec(svc)
            .ports
            .as_ref()
            .map(|ports| ports.iter().map(|p| p.port).collect())
            .unwrap_or_default()
    }

    #[test]
    fn discovery_is_headless_and_publishes_unready_pods() {
        let cr = cluster("db1");

        for svc in [discovery(&cr), unready(&cr)] {
            assert_eq!(Some(CLUSTER_IP_NONE.to_string()), spec(&svc).cluster_ip);
            assert_eq!(Some(true), spec(&svc).publish_not_ready_addresses);
            assert_eq!(Some(topology::match_labels(&cr)), spec(&svc).selector);
            assert_eq!(vec![3306, 33062, 33060], port_numbers(&svc));
        }

        assert_eq!(Some("db1-mysql".to_string()), discovery(&cr).metadata.name);
        assert_eq!(
            Some("db1-mysql-unready".to_string()),
            unready(&cr).metadata.name
        );
    }

    #[test]
    fn primary_selects_the_primary_marker() {
        let cr = cluster("db1");
        let svc = primary(&cr);
        let selector = spec(&svc).selector.to_owned().expect("a selector");

        assert_eq!(Some("db1-mysql-primary".to_string()), svc.metadata.name);
        assert_eq!(Some(&"true".to_string()), selector.get(PRIMARY_LABEL));
        assert_eq!(
            topology::match_labels(&cr),
            selector
                .into_iter()
                .filter(|(k, _)| k != PRIMARY_LABEL)
                .collect::<BTreeMap<_, _>>()
        );
        assert_eq!(Some(topology::match_labels(&cr)), svc.metadata.labels);
        assert_eq!(Some("ClusterIP".to_string()), spec(&svc).type_);
    }

    #[test]
    fn primary_service_type_is_overridable() {
        let mut cr = cluster("db1");
        cr.spec.mysql.primary_service_type = Some(ServiceType::LoadBalancer);

        assert_eq!(
            Some("LoadBalancer".to_string()),
            spec(&primary(&cr)).type_
        );
    }

    #[test]
    fn instances_are_only_created_when_exposed() {
        let mut cr = cluster("db1");
        assert!(instances(&cr).is_empty());

        cr.spec.mysql.expose.enabled = true;
        cr.spec.mysql.expose.type_ = Some(ServiceType::NodePort);

        let services = instances(&cr);
        assert_eq!(3, services.len());

        let svc = &services[2];
        assert_eq!(Some("db1-mysql-2".to_string()), svc.metadata.name);
        assert_eq!(Some("NodePort".to_string()), spec(svc).type_);
        assert_eq!(
            Some(&"db1-mysql-2".to_string()),
            spec(svc)
                .selector
                .as_ref()
                .and_then(|selector| selector.get(POD_NAME_LABEL))
        );
        assert_eq!(
            Some(&"true".to_string()),
            svc.metadata
                .labels
                .as_ref()
                .and_then(|labels| labels.get(EXPOSED_LABEL))
        );
        assert_eq!(vec![3306, 33062, 33060], port_numbers(svc));
    }

    #[test]
    fn instance_type_defaults_to_cluster_ip() {
        let mut cr = cluster("db1");
        cr.spec.mysql.expose.enabled = true;

        for svc in instances(&cr) {
            assert_eq!(Some("ClusterIP".to_string()), spec(&svc).type_);
        }
    }

    #[test]
    fn services_have_the_core_kind() {
        let value = serde_json::to_value(discovery(&cluster("db1"))).expect("to serialize");

        assert_eq!("v1", value["apiVersion"]);
        assert_eq!("Service", value["kind"]);
    }

    #[test]
    fn exposure_lists_every_service() {
        let mut cr = cluster("db1");
        cr.spec.mysql.expose.enabled = true;

        let names: Vec<_> = Exposure::from(&cr)
            .iter()
            .filter_map(|svc| svc.metadata.name.to_owned())
            .collect();

        assert_eq!(
            vec![
                "db1-mysql",
                "db1-mysql-unready",
                "db1-mysql-primary",
                "db1-mysql-0",
                "db1-mysql-1",
                "db1-mysql-2"
            ],
            names
        );
    }
}
