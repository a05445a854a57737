//! # Container module
//!
//! This module provides the init, mysqld and monitoring containers of the
//! mysql pods, their ports and probes.

use std::collections::BTreeSet;

use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, EnvVarSource, ExecAction, ObjectFieldSelector, Probe,
    SecretKeySelector,
};
use kube::ResourceExt;

use crate::svc::{
    crd::mysql::{PerconaServerMySQL, PmmSpec, ProbeSpec},
    topology::{self, volume, ADMIN_PORT, COMPONENT_NAME, PORT, X_PORT},
};

// -----------------------------------------------------------------------------
// Constants

pub const INIT_ENTRYPOINT: &str = "/ps-init-entrypoint.sh";
pub const ENTRYPOINT: &str = "/var/lib/mysql/ps-entrypoint.sh";
pub const BOOTSTRAP_PROBE: &str = "/var/lib/mysql/bootstrap";
pub const HEALTHCHECK_PROBE: &str = "/var/lib/mysql/healthcheck";

pub const TERMINATION_MESSAGE_PATH: &str = "/dev/termination-log";
pub const TERMINATION_MESSAGE_POLICY: &str = "File";

pub const PMM_CONTAINER_NAME: &str = "pmm-client";
pub const PMM_AGENT_PORT: i32 = 7777;
pub const PMM_PORT_MIN: i32 = 30100;
pub const PMM_PORT_MAX: i32 = 30105;

/// user whose credentials the monitoring agent uses
pub const MONITOR_USER: &str = "monitor";
/// key of the pmm server password in the user secret
pub const PMM_SERVER_KEY: &str = "pmmserver";

// -----------------------------------------------------------------------------
// Helpers

fn env(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        ..Default::default()
    }
}

fn env_from_field(name: &str, path: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: path.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn env_from_secret(name: &str, secret: &str, key: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                name: Some(secret.to_string()),
                key: key.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn port(name: &str, port: i32) -> ContainerPort {
    ContainerPort {
        name: Some(name.to_string()),
        container_port: port,
        ..Default::default()
    }
}

/// returns the client, administrative and x protocol ports
pub fn ports() -> Vec<ContainerPort> {
    vec![
        port(COMPONENT_NAME, PORT),
        port(&format!("{}-admin", COMPONENT_NAME), ADMIN_PORT),
        port(&format!("{}x", COMPONENT_NAME), X_PORT),
    ]
}

/// returns an exec probe, timings are given as is by the spec
pub fn probe(command: &[&str], spec: &ProbeSpec) -> Probe {
    Probe {
        exec: Some(ExecAction {
            command: Some(command.iter().map(ToString::to_string).collect()),
        }),
        initial_delay_seconds: spec.initial_delay_seconds,
        timeout_seconds: spec.timeout_seconds,
        period_seconds: spec.period_seconds,
        failure_threshold: spec.failure_threshold,
        success_threshold: spec.success_threshold,
        termination_grace_period_seconds: spec.termination_grace_period_seconds,
        ..Default::default()
    }
}

// -----------------------------------------------------------------------------
// Containers

/// returns the container preparing the data directory before mysqld starts
pub fn init(cr: &PerconaServerMySQL, image: &str) -> Container {
    let spec = &cr.spec.mysql;

    Container {
        name: format!("{}-init", COMPONENT_NAME),
        image: Some(image.to_string()),
        image_pull_policy: spec.image_pull_policy.to_owned(),
        volume_mounts: Some(volume::bootstrap_mounts()),
        command: Some(vec![INIT_ENTRYPOINT.to_string()]),
        termination_message_path: Some(TERMINATION_MESSAGE_PATH.to_string()),
        termination_message_policy: Some(TERMINATION_MESSAGE_POLICY.to_string()),
        security_context: spec.container_security_context.to_owned(),
        ..Default::default()
    }
}

pub fn mysqld(cr: &PerconaServerMySQL) -> Container {
    let spec = &cr.spec.mysql;

    let mut mounts = volume::bootstrap_mounts();
    mounts.push(volume::mount(
        volume::CONFIG_VOLUME_NAME,
        volume::CONFIG_MOUNT_PATH,
    ));

    Container {
        name: COMPONENT_NAME.to_string(),
        image: Some(spec.image.to_owned()),
        image_pull_policy: spec.image_pull_policy.to_owned(),
        resources: spec.resources.to_owned(),
        env: Some(vec![
            env("MONITOR_HOST", "%"),
            env("SERVICE_NAME", &topology::service_name(cr)),
            env("SERVICE_NAME_UNREADY", &topology::unready_service_name(cr)),
            env("CLUSTER_HASH", &topology::cluster_hash(cr)),
        ]),
        ports: Some(ports()),
        volume_mounts: Some(mounts),
        command: Some(vec![ENTRYPOINT.to_string()]),
        args: Some(vec!["mysqld".to_string()]),
        termination_message_path: Some(TERMINATION_MESSAGE_PATH.to_string()),
        termination_message_policy: Some(TERMINATION_MESSAGE_POLICY.to_string()),
        security_context: spec.container_security_context.to_owned(),
        startup_probe: Some(probe(&[BOOTSTRAP_PROBE], &spec.startup_probe)),
        liveness_probe: Some(probe(
            &[HEALTHCHECK_PROBE, "liveness"],
            &spec.liveness_probe,
        )),
        readiness_probe: Some(probe(
            &[HEALTHCHECK_PROBE, "readiness"],
            &spec.readiness_probe,
        )),
        ..Default::default()
    }
}

/// returns the monitoring agent container, the pmm server and mysql
/// credentials come from the user secret
pub fn pmm(cluster: &str, secrets: &str, spec: &PmmSpec) -> Container {
    let mut ports = vec![ContainerPort {
        container_port: PMM_AGENT_PORT,
        ..Default::default()
    }];

    ports.extend((PMM_PORT_MIN..=PMM_PORT_MAX).map(|port| ContainerPort {
        container_port: port,
        ..Default::default()
    }));

    Container {
        name: PMM_CONTAINER_NAME.to_string(),
        image: Some(spec.image.to_owned()),
        image_pull_policy: spec.image_pull_policy.to_owned(),
        security_context: spec.container_security_context.to_owned(),
        resources: spec.resources.to_owned(),
        ports: Some(ports),
        env: Some(vec![
            env_from_field("POD_NAME", "metadata.name"),
            env_from_field("POD_NAMESPACE", "metadata.namespace"),
            env("CLUSTER_NAME", cluster),
            env("CLIENT_PORT_LISTEN", &PMM_AGENT_PORT.to_string()),
            env("CLIENT_PORT_MIN", &PMM_PORT_MIN.to_string()),
            env("CLIENT_PORT_MAX", &PMM_PORT_MAX.to_string()),
            env("PMM_AGENT_SERVER_ADDRESS", &spec.server_host),
            env("PMM_AGENT_SERVER_USERNAME", &spec.server_user),
            env_from_secret("PMM_AGENT_SERVER_PASSWORD", secrets, PMM_SERVER_KEY),
            env("PMM_SERVER", &spec.server_host),
            env("PMM_USER", &spec.server_user),
            env_from_secret("PMM_PASSWORD", secrets, PMM_SERVER_KEY),
            env("PMM_AGENT_LISTEN_PORT", &PMM_AGENT_PORT.to_string()),
            env("PMM_AGENT_PORTS_MIN", &PMM_PORT_MIN.to_string()),
            env("PMM_AGENT_PORTS_MAX", &PMM_PORT_MAX.to_string()),
            env("PMM_AGENT_CONFIG_FILE", "/usr/local/percona/pmm2/config/pmm-agent.yaml"),
            env("PMM_AGENT_SERVER_INSECURE_TLS", "1"),
            env("PMM_AGENT_LISTEN_ADDRESS", "0.0.0.0"),
            env("PMM_AGENT_SETUP_NODE_NAME", "$(POD_NAMESPACE)-$(POD_NAME)"),
            env("PMM_AGENT_SETUP_METRICS_MODE", "push"),
            env("PMM_AGENT_SETUP", "1"),
            env("PMM_AGENT_SETUP_FORCE", "1"),
            env("PMM_AGENT_SETUP_NODE_TYPE", "container"),
            env("PMM_AGENT_SIDECAR", "true"),
            env("PMM_AGENT_SIDECAR_SLEEP", "5"),
            env("DB_CLUSTER", cluster),
            env("DB_TYPE", COMPONENT_NAME),
            env("DB_HOST", "localhost"),
            env("DB_PORT", &ADMIN_PORT.to_string()),
            env("DB_USER", MONITOR_USER),
            env_from_secret("DB_PASSWORD", secrets, MONITOR_USER),
            env("DB_ARGS", "--query-source=perfschema"),
        ]),
        volume_mounts: Some(vec![volume::data_mount()]),
        ..Default::default()
    }
}

/// appends containers whose name is not already taken, the first container
/// with a given name wins
pub fn append_unique<I>(mut containers: Vec<Container>, more: I) -> Vec<Container>
where
    I: IntoIterator<Item = Container>,
{
    let mut names: BTreeSet<String> = containers.iter().map(|c| c.name.to_owned()).collect();

    for container in more {
        if names.insert(container.name.to_owned()) {
            containers.push(container);
        }
    }

    containers
}

/// returns mysqld followed by user sidecars, the monitoring agent is added
/// when enabled unless a sidecar already uses its name
pub fn containers(cr: &PerconaServerMySQL) -> Vec<Container> {
    let containers = append_unique(vec![mysqld(cr)], cr.spec.mysql.sidecars.iter().cloned());

    match &cr.spec.pmm {
        Some(spec) if spec.enabled => append_unique(
            containers,
            [pmm(&cr.name_any(), &cr.spec.secrets_name, spec)],
        ),
        _ => containers,
    }
}

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
mod tests {
    use super::*;
    use crate::svc::topology::tests::cluster;

    fn pmm_spec() -> PmmSpec {
        PmmSpec {
            enabled: true,
            image: "percona/pmm-client:2.28.0".to_string(),
            server_host: "monitoring-service".to_string(),
            server_user: "admin".to_string(),
            ..Default::default()
        }
    }

    fn container_ports(container: &Container) -> Vec<i32> {
        container
            .ports
            .as_ref()
            .map(|ports| ports.iter().map(|p| p.container_port).collect())
            .unwrap_or_default()
    }

    #[test]
    fn mysqld_exposes_fixed_ports() {
        for size in [0, 1, 5] {
            let mut cr = cluster("db1");
            cr.spec.mysql.size = size;
            cr.spec.mysql.expose.enabled = size > 1;

            assert_eq!(vec![3306, 33062, 33060], container_ports(&mysqld(&cr)));
        }
    }

    #[test]
    fn probes_pass_timings_through() {
        let mut cr = cluster("db1");
        cr.spec.mysql.readiness_probe = ProbeSpec {
            initial_delay_seconds: Some(30),
            period_seconds: Some(5),
            timeout_seconds: Some(3),
            failure_threshold: Some(3),
            success_threshold: Some(1),
            termination_grace_period_seconds: None,
        };

        let container = mysqld(&cr);
        let readiness = container.readiness_probe.expect("a readiness probe");

        assert_eq!(Some(30), readiness.initial_delay_seconds);
        assert_eq!(Some(5), readiness.period_seconds);
        assert_eq!(Some(3), readiness.timeout_seconds);
        assert_eq!(
            Some(vec![HEALTHCHECK_PROBE.to_string(), "readiness".to_string()]),
            readiness.exec.and_then(|exec| exec.command)
        );

        let startup = container.startup_probe.expect("a startup probe");
        assert_eq!(None, startup.initial_delay_seconds);
        assert_eq!(
            Some(vec![BOOTSTRAP_PROBE.to_string()]),
            startup.exec.and_then(|exec| exec.command)
        );
    }

    #[test]
    fn init_container_mounts_bootstrap_material() {
        let container = init(&cluster("db1"), "percona/init:latest");
        let mounts: Vec<_> = container
            .volume_mounts
            .unwrap_or_default()
            .into_iter()
            .map(|m| m.mount_path)
            .collect();

        assert_eq!("mysql-init", container.name);
        assert_eq!(Some("percona/init:latest".to_string()), container.image);
        assert_eq!(
            vec![
                volume::DATA_MOUNT_PATH,
                volume::CREDS_MOUNT_PATH,
                volume::TLS_MOUNT_PATH
            ],
            mounts
        );
    }

    #[test]
    fn pmm_is_skipped_when_disabled() {
        let mut cr = cluster("db1");
        cr.spec.pmm = Some(PmmSpec {
            enabled: false,
            ..pmm_spec()
        });

        let names: Vec<_> = containers(&cr).into_iter().map(|c| c.name).collect();
        assert_eq!(vec!["mysql"], names);
    }

    #[test]
    fn pmm_is_appended_when_enabled() {
        let mut cr = cluster("db1");
        cr.spec.pmm = Some(pmm_spec());

        let containers = containers(&cr);
        let names: Vec<_> = containers.iter().map(|c| c.name.as_str()).collect();

        assert_eq!(vec!["mysql", "pmm-client"], names);
        assert_eq!(
            vec![7777, 30100, 30101, 30102, 30103, 30104, 30105],
            container_ports(&containers[1])
        );
    }

    #[test]
    fn user_sidecar_wins_over_pmm() {
        let mut cr = cluster("db1");
        cr.spec.pmm = Some(pmm_spec());
        cr.spec.mysql.sidecars = vec![Container {
            name: PMM_CONTAINER_NAME.to_string(),
            image: Some("my-registry/pmm-client:custom".to_string()),
            ..Default::default()
        }];

        let pmms: Vec<_> = containers(&cr)
            .into_iter()
            .filter(|c| c.name == PMM_CONTAINER_NAME)
            .collect();

        assert_eq!(1, pmms.len());
        assert_eq!(
            Some("my-registry/pmm-client:custom".to_string()),
            pmms[0].image
        );
    }

    #[test]
    fn sidecars_do_not_replace_mysqld() {
        let mut cr = cluster("db1");
        cr.spec.mysql.sidecars = vec![
            Container {
                name: COMPONENT_NAME.to_string(),
                image: Some("busybox".to_string()),
                ..Default::default()
            },
            Container {
                name: "backup".to_string(),
                ..Default::default()
            },
        ];

        let containers = containers(&cr);
        let names: Vec<_> = containers.iter().map(|c| c.name.as_str()).collect();

        assert_eq!(vec!["mysql", "backup"], names);
        assert_eq!(
            Some("percona/percona-server:8.0.25".to_string()),
            containers[0].image
        );
    }
}
