//! # Volume module
//!
//! This module provides the volumes, mounts and volume claim templates of the
//! mysql pods

use k8s_openapi::api::core::v1::{
    ConfigMapProjection, KeyToPath, PersistentVolumeClaim, PersistentVolumeClaimSpec,
    ProjectedVolumeSource, SecretProjection, SecretVolumeSource, Volume, VolumeMount,
    VolumeProjection,
};
use kube::api::ObjectMeta;

use crate::svc::{
    crd::mysql::{MySqlSpec, PerconaServerMySQL},
    topology::{self, CUSTOM_CONFIG_KEY},
};

// -----------------------------------------------------------------------------
// Constants

pub const DATA_VOLUME_NAME: &str = "datadir";
pub const DATA_MOUNT_PATH: &str = "/var/lib/mysql";
pub const CONFIG_VOLUME_NAME: &str = "config";
pub const CONFIG_MOUNT_PATH: &str = "/etc/mysql/config";
pub const CREDS_VOLUME_NAME: &str = "users";
pub const CREDS_MOUNT_PATH: &str = "/etc/mysql/mysql-users-secret";
pub const TLS_VOLUME_NAME: &str = "tls";
pub const TLS_MOUNT_PATH: &str = "/etc/mysql/mysql-tls-secret";

// -----------------------------------------------------------------------------
// Mounts

pub fn mount(name: &str, path: &str) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: path.to_string(),
        ..Default::default()
    }
}

pub fn data_mount() -> VolumeMount {
    mount(DATA_VOLUME_NAME, DATA_MOUNT_PATH)
}

/// mounts needed to bootstrap and run mysqld
pub fn bootstrap_mounts() -> Vec<VolumeMount> {
    vec![
        data_mount(),
        mount(CREDS_VOLUME_NAME, CREDS_MOUNT_PATH),
        mount(TLS_VOLUME_NAME, TLS_MOUNT_PATH),
    ]
}

// -----------------------------------------------------------------------------
// Volumes

fn secret(name: &str, secret_name: &str) -> Volume {
    Volume {
        name: name.to_string(),
        secret: Some(SecretVolumeSource {
            secret_name: Some(secret_name.to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// returns the projected configuration volume, the configmap key is the
/// custom configuration and the secret key overrides it. Both sources are
/// optional so the cluster runs with the defaults when they are missing.
pub fn config(cr: &PerconaServerMySQL) -> Volume {
    let name = topology::config_map_name(cr);
    let item = |path: &str| {
        Some(vec![KeyToPath {
            key: CUSTOM_CONFIG_KEY.to_string(),
            path: path.to_string(),
            ..Default::default()
        }])
    };

    Volume {
        name: CONFIG_VOLUME_NAME.to_string(),
        projected: Some(ProjectedVolumeSource {
            sources: Some(vec![
                VolumeProjection {
                    config_map: Some(ConfigMapProjection {
                        name: Some(name.to_owned()),
                        items: item("my-config.cnf"),
                        optional: Some(true),
                    }),
                    ..Default::default()
                },
                VolumeProjection {
                    secret: Some(SecretProjection {
                        name: Some(name),
                        items: item("my-secret.cnf"),
                        optional: Some(true),
                    }),
                    ..Default::default()
                },
            ]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// returns pod volumes, the data volume comes from the claim templates
pub fn volumes(cr: &PerconaServerMySQL) -> Vec<Volume> {
    let mut volumes = vec![
        secret(CREDS_VOLUME_NAME, &topology::internal_secret_name(cr)),
        secret(TLS_VOLUME_NAME, &cr.spec.ssl_secret_name),
        config(cr),
    ];

    volumes.extend(cr.spec.mysql.sidecar_volumes.iter().cloned());
    volumes
}

// -----------------------------------------------------------------------------
// Claims

/// volume claim factory, placement is left to the storage class given in
/// the spec
pub fn claim(name: &str, spec: &PersistentVolumeClaimSpec) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: Some(spec.to_owned()),
        ..Default::default()
    }
}

pub fn claim_templates(spec: &MySqlSpec) -> Vec<PersistentVolumeClaim> {
    let mut claims = vec![claim(DATA_VOLUME_NAME, &spec.volume_spec)];

    claims.extend(
        spec.sidecar_pvcs
            .iter()
            .map(|pvc| claim(&pvc.name, &pvc.spec)),
    );

    claims
}

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
mod tests {
    use super::*;
    use crate::svc::{crd::mysql::SidecarPvc, topology::tests::cluster};

    #[test]
    fn config_volume_sources_are_optional() {
        let volume = config(&cluster("db1"));
        let sources = volume
            .projected
            .and_then(|projected| projected.sources)
            .expect("projected sources");

        assert_eq!(2, sources.len());

        let cm = sources[0].config_map.as_ref().expect("a configmap source");
        assert_eq!(Some("db1-mysql".to_string()), cm.name);
        assert_eq!(Some(true), cm.optional);
        assert_eq!(
            "my-config.cnf",
            cm.items.as_ref().expect("items")[0].path
        );

        let secret = sources[1].secret.as_ref().expect("a secret source");
        assert_eq!(Some("db1-mysql".to_string()), secret.name);
        assert_eq!(Some(true), secret.optional);
        assert_eq!(
            "my-secret.cnf",
            secret.items.as_ref().expect("items")[0].path
        );
    }

    #[test]
    fn volumes_reference_secrets_then_sidecars() {
        let mut cr = cluster("db1");
        cr.spec.mysql.sidecar_volumes = vec![Volume {
            name: "backup".to_string(),
            ..Default::default()
        }];

        let names: Vec<_> = volumes(&cr).into_iter().map(|v| v.name).collect();
        assert_eq!(vec!["users", "tls", "config", "backup"], names);

        let users = &volumes(&cr)[0];
        assert_eq!(
            Some("internal-db1".to_string()),
            users.secret.as_ref().and_then(|s| s.secret_name.to_owned())
        );
    }

    #[test]
    fn claim_templates_start_with_data() {
        let mut cr = cluster("db1");
        cr.spec.mysql.sidecar_pvcs = vec![SidecarPvc {
            name: "backup".to_string(),
            spec: PersistentVolumeClaimSpec::default(),
        }];

        let names: Vec<_> = claim_templates(&cr.spec.mysql)
            .into_iter()
            .filter_map(|pvc| pvc.metadata.name)
            .collect();

        assert_eq!(vec!["datadir", "backup"], names);
    }
}
