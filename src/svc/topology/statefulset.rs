//! # StatefulSet module
//!
//! This module provides the statefulset running the mysql members

use std::collections::BTreeMap;

use k8s_openapi::{
    api::{
        apps::v1::{StatefulSet, StatefulSetSpec, StatefulSetUpdateStrategy},
        core::v1::{Affinity, PodAffinityTerm, PodAntiAffinity, PodSpec, PodTemplateSpec},
    },
    apimachinery::pkg::apis::meta::v1::LabelSelector,
};
use kube::{api::ObjectMeta, ResourceExt};

use crate::svc::{
    crd::mysql::{AffinitySpec, PerconaServerMySQL},
    topology::{self, container, volume, CONFIG_HASH_ANNOTATION},
};

// -----------------------------------------------------------------------------
// Constants

pub const DEFAULT_TOPOLOGY_KEY: &str = "kubernetes.io/hostname";
pub const TOPOLOGY_KEY_NONE: &str = "none";

// -----------------------------------------------------------------------------
// Helpers

/// returns the affinity of the pods, an advanced affinity is used as is,
/// otherwise members are spread across the topology key.
pub fn affinity(spec: Option<&AffinitySpec>, labels: &BTreeMap<String, String>) -> Option<Affinity> {
    let spec = spec.cloned().unwrap_or_default();
    if spec.advanced.is_some() {
        return spec.advanced;
    }

    let key = spec
        .anti_affinity_topology_key
        .unwrap_or_else(|| DEFAULT_TOPOLOGY_KEY.to_string());

    if key == TOPOLOGY_KEY_NONE {
        return None;
    }

    Some(Affinity {
        pod_anti_affinity: Some(PodAntiAffinity {
            required_during_scheduling_ignored_during_execution: Some(vec![PodAffinityTerm {
                label_selector: Some(LabelSelector {
                    match_labels: Some(labels.to_owned()),
                    ..Default::default()
                }),
                topology_key: key,
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    })
}

// -----------------------------------------------------------------------------
// StatefulSet

/// returns the statefulset of the mysql members, the configuration hash is
/// set on the pod template so a configuration change rolls the pods.
pub fn new(cr: &PerconaServerMySQL, init_image: &str, config_hash: &str) -> StatefulSet {
    let labels = topology::match_labels(cr);
    let spec = &cr.spec.mysql;

    let annotations = BTreeMap::from([(
        CONFIG_HASH_ANNOTATION.to_string(),
        config_hash.to_string(),
    )]);

    StatefulSet {
        metadata: ObjectMeta {
            name: Some(topology::name(cr)),
            namespace: cr.namespace(),
            labels: Some(labels.to_owned()),
            ..Default::default()
        },
        spec: Some(StatefulSetSpec {
            replicas: Some(topology::size(cr)),
            selector: LabelSelector {
                match_labels: Some(labels.to_owned()),
                ..Default::default()
            },
            service_name: topology::service_name(cr),
            volume_claim_templates: Some(volume::claim_templates(spec)),
            update_strategy: Some(StatefulSetUpdateStrategy {
                type_: Some("RollingUpdate".to_string()),
                ..Default::default()
            }),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels.to_owned()),
                    annotations: Some(annotations),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    node_selector: spec.node_selector.to_owned(),
                    tolerations: spec.tolerations.to_owned(),
                    init_containers: Some(vec![container::init(cr, init_image)]),
                    containers: container::containers(cr),
                    affinity: affinity(spec.affinity.as_ref(), &labels),
                    image_pull_secrets: spec.image_pull_secrets.to_owned(),
                    termination_grace_period_seconds: spec.termination_grace_period_seconds,
                    restart_policy: Some("Always".to_string()),
                    scheduler_name: Some("default-scheduler".to_string()),
                    dns_policy: Some("ClusterFirst".to_string()),
                    volumes: Some(volume::volumes(cr)),
                    security_context: spec.pod_security_context.to_owned(),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
mod tests {
    use super::*;
    use crate::svc::topology::tests::cluster;

    fn pod_spec(sts: &StatefulSet) -> &PodSpec {
        sts.spec
            .as_ref()
            .and_then(|spec| spec.template.spec.as_ref())
            .expect("a pod spec")
    }

    #[test]
    fn statefulset_is_governed_by_discovery_service() {
        let sts = new(&cluster("db1"), "percona/init:latest", "hash");
        let spec = sts.spec.as_ref().expect("a statefulset spec");

        assert_eq!(Some("db1-mysql".to_string()), sts.metadata.name);
        assert_eq!(Some("databases".to_string()), sts.metadata.namespace);
        assert_eq!("db1-mysql", spec.service_name);
        assert_eq!(Some(3), spec.replicas);
        assert_eq!(
            Some("RollingUpdate".to_string()),
            spec.update_strategy
                .as_ref()
                .and_then(|strategy| strategy.type_.to_owned())
        );
    }

    #[test]
    fn selector_and_template_share_labels() {
        let cr = cluster("db1");
        let sts = new(&cr, "percona/init:latest", "hash");
        let spec = sts.spec.as_ref().expect("a statefulset spec");
        let labels = Some(topology::match_labels(&cr));

        assert_eq!(labels, spec.selector.match_labels);
        assert_eq!(
            labels,
            spec.template
                .metadata
                .as_ref()
                .and_then(|meta| meta.labels.to_owned())
        );
        assert_eq!(
            Some(&"hash".to_string()),
            spec.template
                .metadata
                .as_ref()
                .and_then(|meta| meta.annotations.as_ref())
                .and_then(|annotations| annotations.get(CONFIG_HASH_ANNOTATION))
        );
    }

    #[test]
    fn exactly_one_init_container() {
        let sts = new(&cluster("db1"), "percona/init:latest", "hash");
        let init = pod_spec(&sts)
            .init_containers
            .as_ref()
            .expect("init containers");

        assert_eq!(1, init.len());
        assert_eq!(
            Some(vec![container::INIT_ENTRYPOINT.to_string()]),
            init[0].command
        );
    }

    #[test]
    fn statefulset_has_the_apps_kind() {
        let value = serde_json::to_value(new(&cluster("db1"), "percona/init:latest", "hash"))
            .expect("to serialize");

        assert_eq!("apps/v1", value["apiVersion"]);
        assert_eq!("StatefulSet", value["kind"]);
    }

    #[test]
    fn anti_affinity_defaults_to_hostname() {
        let labels = BTreeMap::from([("a".to_string(), "b".to_string())]);
        let affinity = affinity(None, &labels).expect("an affinity");

        let terms = affinity
            .pod_anti_affinity
            .and_then(|anti| anti.required_during_scheduling_ignored_during_execution)
            .expect("anti affinity terms");

        assert_eq!(DEFAULT_TOPOLOGY_KEY, terms[0].topology_key);
        assert_eq!(
            Some(labels),
            terms[0]
                .label_selector
                .as_ref()
                .and_then(|selector| selector.match_labels.to_owned())
        );
    }

    #[test]
    fn anti_affinity_can_be_disabled_or_replaced() {
        let labels = BTreeMap::new();

        let none = AffinitySpec {
            anti_affinity_topology_key: Some(TOPOLOGY_KEY_NONE.to_string()),
            advanced: None,
        };
        assert_eq!(None, affinity(Some(&none), &labels));

        let advanced = AffinitySpec {
            anti_affinity_topology_key: None,
            advanced: Some(Affinity::default()),
        };
        assert_eq!(Some(Affinity::default()), affinity(Some(&advanced), &labels));
    }
}
