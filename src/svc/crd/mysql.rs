//! # PerconaServerMySQL custom resource
//!
//! This module provide the mysql cluster custom resource, its definition and
//! the reconciler deploying the members and driving the formation of the
//! innodb cluster.

use std::{
    collections::BTreeMap,
    fmt::{self, Display, Formatter},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use k8s_openapi::api::{
    apps::v1::StatefulSet,
    core::v1::{
        Affinity, Container, LocalObjectReference, PersistentVolumeClaimSpec, Pod,
        PodSecurityContext, ResourceRequirements, Secret, SecurityContext, Service, Toleration,
        Volume,
    },
};
use kube::{
    runtime::{controller, watcher, Controller},
    Api, CustomResource, Resource,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use crate::svc::{
    k8s::{self, recorder, resource, Context, ControllerBuilder},
    mysqlsh::{self, Shell},
    topology::{self, ADMIN_PORT},
};

// -----------------------------------------------------------------------------
// ServiceType enumeration

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Copy, Debug, Default)]
pub enum ServiceType {
    #[default]
    #[serde(rename = "ClusterIP")]
    ClusterIP,
    #[serde(rename = "NodePort")]
    NodePort,
    #[serde(rename = "LoadBalancer")]
    LoadBalancer,
}

impl Display for ServiceType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::ClusterIP => write!(f, "ClusterIP"),
            Self::NodePort => write!(f, "NodePort"),
            Self::LoadBalancer => write!(f, "LoadBalancer"),
        }
    }
}

// -----------------------------------------------------------------------------
// ProbeSpec structure

/// timings of a probe, the command itself is owned by the operator
#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug, Default)]
pub struct ProbeSpec {
    #[serde(rename = "initialDelaySeconds", default)]
    pub initial_delay_seconds: Option<i32>,
    #[serde(rename = "periodSeconds", default)]
    pub period_seconds: Option<i32>,
    #[serde(rename = "timeoutSeconds", default)]
    pub timeout_seconds: Option<i32>,
    #[serde(rename = "failureThreshold", default)]
    pub failure_threshold: Option<i32>,
    #[serde(rename = "successThreshold", default)]
    pub success_threshold: Option<i32>,
    #[serde(rename = "terminationGracePeriodSeconds", default)]
    pub termination_grace_period_seconds: Option<i64>,
}

// -----------------------------------------------------------------------------
// ExposeSpec structure

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug, Default)]
pub struct ExposeSpec {
    #[serde(rename = "enabled", default)]
    pub enabled: bool,
    #[serde(rename = "type", default)]
    pub type_: Option<ServiceType>,
}

// -----------------------------------------------------------------------------
// AffinitySpec structure

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Clone, Debug, Default)]
pub struct AffinitySpec {
    /// spread members across this topology key, 'none' disables spreading
    #[serde(rename = "antiAffinityTopologyKey", default)]
    pub anti_affinity_topology_key: Option<String>,
    /// used as is when set
    #[serde(rename = "advanced", default)]
    pub advanced: Option<Affinity>,
}

// -----------------------------------------------------------------------------
// SidecarPvc structure

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Clone, Debug)]
pub struct SidecarPvc {
    #[serde(rename = "name")]
    pub name: String,
    #[serde(rename = "spec")]
    pub spec: PersistentVolumeClaimSpec,
}

// -----------------------------------------------------------------------------
// MySqlSpec structure

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Clone, Debug, Default)]
pub struct MySqlSpec {
    #[serde(rename = "size")]
    pub size: i32,
    #[serde(rename = "image")]
    pub image: String,
    #[serde(rename = "imagePullPolicy", default)]
    pub image_pull_policy: Option<String>,
    #[serde(rename = "imagePullSecrets", default)]
    pub image_pull_secrets: Option<Vec<LocalObjectReference>>,
    #[serde(rename = "resources", default)]
    pub resources: Option<ResourceRequirements>,
    #[serde(rename = "nodeSelector", default)]
    pub node_selector: Option<BTreeMap<String, String>>,
    #[serde(rename = "tolerations", default)]
    pub tolerations: Option<Vec<Toleration>>,
    #[serde(rename = "affinity", default)]
    pub affinity: Option<AffinitySpec>,
    #[serde(rename = "labels", default)]
    pub labels: BTreeMap<String, String>,
    /// content of the custom my.cnf
    #[serde(rename = "configuration", default)]
    pub configuration: Option<String>,
    #[serde(rename = "expose", default)]
    pub expose: ExposeSpec,
    #[serde(rename = "primaryServiceType", default)]
    pub primary_service_type: Option<ServiceType>,
    #[serde(rename = "volumeSpec", default)]
    pub volume_spec: PersistentVolumeClaimSpec,
    #[serde(rename = "sidecars", default)]
    pub sidecars: Vec<Container>,
    #[serde(rename = "sidecarVolumes", default)]
    pub sidecar_volumes: Vec<Volume>,
    #[serde(rename = "sidecarPVCs", default)]
    pub sidecar_pvcs: Vec<SidecarPvc>,
    #[serde(rename = "startupProbe", default)]
    pub startup_probe: ProbeSpec,
    #[serde(rename = "livenessProbe", default)]
    pub liveness_probe: ProbeSpec,
    #[serde(rename = "readinessProbe", default)]
    pub readiness_probe: ProbeSpec,
    #[serde(rename = "podSecurityContext", default)]
    pub pod_security_context: Option<PodSecurityContext>,
    #[serde(rename = "containerSecurityContext", default)]
    pub container_security_context: Option<SecurityContext>,
    #[serde(rename = "terminationGracePeriodSeconds", default)]
    pub termination_grace_period_seconds: Option<i64>,
}

// -----------------------------------------------------------------------------
// PmmSpec structure

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Clone, Debug, Default)]
pub struct PmmSpec {
    #[serde(rename = "enabled", default)]
    pub enabled: bool,
    #[serde(rename = "image", default)]
    pub image: String,
    #[serde(rename = "imagePullPolicy", default)]
    pub image_pull_policy: Option<String>,
    #[serde(rename = "serverHost", default)]
    pub server_host: String,
    #[serde(rename = "serverUser", default)]
    pub server_user: String,
    #[serde(rename = "resources", default)]
    pub resources: Option<ResourceRequirements>,
    #[serde(rename = "containerSecurityContext", default)]
    pub container_security_context: Option<SecurityContext>,
}

// -----------------------------------------------------------------------------
// Spec structure

#[derive(CustomResource, JsonSchema, Serialize, Deserialize, PartialEq, Clone, Debug)]
#[kube(group = "ps.percona.com")]
#[kube(version = "v1alpha1")]
#[kube(kind = "PerconaServerMySQL")]
#[kube(singular = "perconaservermysql")]
#[kube(plural = "perconaservermysqls")]
#[kube(shortname = "ps")]
#[kube(status = "Status")]
#[kube(namespaced)]
#[kube(derive = "PartialEq")]
pub struct Spec {
    #[serde(rename = "secretsName")]
    pub secrets_name: String,
    #[serde(rename = "sslSecretName")]
    pub ssl_secret_name: String,
    #[serde(rename = "mysql")]
    pub mysql: MySqlSpec,
    #[serde(rename = "pmm", default)]
    pub pmm: Option<PmmSpec>,
}

// -----------------------------------------------------------------------------
// Status structure

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Copy, Debug)]
pub enum State {
    #[serde(rename = "initializing")]
    Initializing,
    #[serde(rename = "ready")]
    Ready,
}

impl State {
    /// the cluster is ready once every requested member is ready
    pub fn of(ready: i32, size: i32) -> Self {
        if ready >= size {
            Self::Ready
        } else {
            Self::Initializing
        }
    }
}

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug, Default)]
pub struct Status {
    #[serde(rename = "state", default)]
    pub state: Option<State>,
    /// number of members the cluster metadata was last reconciled against
    #[serde(rename = "size", default)]
    pub size: Option<i32>,
}

// -----------------------------------------------------------------------------
// Action enumeration

#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum Action {
    CreateCluster,
    RescanCluster,
    FormationFailed,
}

impl Display for Action {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::CreateCluster => write!(f, "CreateCluster"),
            Self::RescanCluster => write!(f, "RescanCluster"),
            Self::FormationFailed => write!(f, "FormationFailed"),
        }
    }
}

// -----------------------------------------------------------------------------
// Step enumeration

/// next administrative step on the cluster metadata
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum Step {
    Create,
    Rescan,
    Nothing,
}

impl Step {
    /// `last` is the member count recorded in the status, `ready` the count
    /// of ready members observed on the statefulset
    pub fn next(exists: bool, last: Option<i32>, ready: i32) -> Self {
        match (exists, last) {
            (false, _) => Self::Create,
            (true, Some(last)) if last == ready => Self::Nothing,
            (true, _) => Self::Rescan,
        }
    }
}

// -----------------------------------------------------------------------------
// Constants

/// delay before retrying a reconciliation which failed on the api or while
/// reading credentials
pub const RETRY_DELAY: Duration = Duration::from_millis(500);

/// delay before retrying a failed formation, each attempt spawns a mysql
/// shell and records a warning event
pub const FORMATION_RETRY_DELAY: Duration = Duration::from_secs(30);

// -----------------------------------------------------------------------------
// ReconcilerError enum

#[derive(thiserror::Error, Debug)]
pub enum ReconcilerError {
    #[error("failed to execute request on kubernetes api, {0}")]
    KubeClient(kube::Error),
    #[error("failed to compute diff between the original and modified object, {0}")]
    Diff(serde_json::Error),
    #[error("failed to read password of user '{1}' in secret '{0}'")]
    Credentials(String, String),
    #[error("failed to drive the cluster formation, {0}")]
    Formation(mysqlsh::Error),
}

impl ReconcilerError {
    /// returns how long to wait before the next reconciliation
    pub fn retry_delay(&self) -> Duration {
        match self {
            Self::Formation(err) if !err.is_cancelled() => FORMATION_RETRY_DELAY,
            _ => RETRY_DELAY,
        }
    }
}

impl From<kube::Error> for ReconcilerError {
    fn from(err: kube::Error) -> Self {
        Self::KubeClient(err)
    }
}

impl From<serde_json::Error> for ReconcilerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Diff(err)
    }
}

impl From<mysqlsh::Error> for ReconcilerError {
    fn from(err: mysqlsh::Error) -> Self {
        Self::Formation(err)
    }
}

// -----------------------------------------------------------------------------
// Helpers

/// returns if the pod passes its readiness probe
pub fn is_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
        .unwrap_or(false)
}

/// returns the value of the given key in the secret
pub fn credential(secret: &Secret, key: &str) -> Option<String> {
    if let Some(value) = secret.data.as_ref().and_then(|data| data.get(key)) {
        return String::from_utf8(value.0.to_owned()).ok();
    }

    secret
        .string_data
        .as_ref()
        .and_then(|data| data.get(key))
        .cloned()
}

/// drives the innodb cluster once the first member is ready, returns the
/// number of members the cluster metadata is reconciled against
#[cfg_attr(feature = "trace", tracing::instrument(skip(ctx, cr)))]
async fn form(
    ctx: &Context,
    cr: &PerconaServerMySQL,
    last: Option<i32>,
    ready: i32,
) -> Result<Option<i32>, ReconcilerError> {
    let (namespace, name) = resource::namespaced_name(cr);
    if topology::size(cr) == 0 {
        return Ok(last);
    }

    // -------------------------------------------------------------------------
    // Step 1: wait for the first member

    let first = topology::instance_name(cr, 0);
    let pod: Option<Pod> = resource::get(ctx.kube.to_owned(), &namespace, &first).await?;
    if !pod.as_ref().map(is_ready).unwrap_or(false) {
        debug!(
            namespace = &namespace,
            name = &name,
            pod = &first,
            "First member is not ready yet, postpone the formation"
        );

        return Ok(last);
    }

    // -------------------------------------------------------------------------
    // Step 2: open an administrative session on the first member

    let user = &ctx.config.mysqlsh.user;
    let secret_name = topology::internal_secret_name(cr);
    let secret: Option<Secret> = resource::get(ctx.kube.to_owned(), &namespace, &secret_name).await?;
    let password = secret
        .as_ref()
        .and_then(|secret| credential(secret, user))
        .ok_or_else(|| ReconcilerError::Credentials(secret_name.to_owned(), user.to_owned()))?;

    let uri = mysqlsh::uri(user, &password, &topology::instance_address(cr, 0), ADMIN_PORT);
    let shell = Shell::new(ctx.executor.to_owned(), uri, ctx.config.mysqlsh.strategy)
        .with_program(ctx.config.mysqlsh.binary.to_owned());

    // -------------------------------------------------------------------------
    // Step 3: create or rescan the cluster

    let cluster = topology::innodb_cluster_name(cr);
    let cancel = ctx.cancel.child_token();
    let exists = shell.does_cluster_exist(&cancel, &cluster).await;

    let result = match Step::next(exists, last, ready) {
        Step::Create => {
            info!(
                namespace = &namespace,
                name = &name,
                cluster = &cluster,
                strategy = shell.strategy().to_string(),
                "Create innodb cluster"
            );

            match shell.configure_instance(&cancel).await {
                Ok(()) => shell
                    .create_cluster(&cancel, &cluster)
                    .await
                    .map(|_| Some(Action::CreateCluster)),
                Err(err) => Err(err),
            }
        }
        Step::Rescan => {
            info!(
                namespace = &namespace,
                name = &name,
                cluster = &cluster,
                last = ?last,
                ready = ready,
                "Rescan innodb cluster"
            );

            shell
                .rescan_cluster(&cancel, &cluster)
                .await
                .map(|_| Some(Action::RescanCluster))
        }
        Step::Nothing => Ok(None),
    };

    match result {
        Ok(Some(action)) => {
            let message = format!("Cluster '{}' reconciled against {} member(s)", cluster, ready);
            recorder::normal(ctx.kube.to_owned(), cr, &action, &message).await?;
        }
        Ok(None) => {}
        Err(err) if err.is_cancelled() => {
            debug!(cluster = &cluster, "Formation has been cancelled");
            return Err(err.into());
        }
        Err(err) => {
            warn!(cluster = &cluster, error = err.to_string(), "Formation failed");
            recorder::warning(
                ctx.kube.to_owned(),
                cr,
                &Action::FormationFailed,
                &err.to_string(),
            )
            .await?;

            return Err(err.into());
        }
    }

    Ok(Some(ready))
}

// -----------------------------------------------------------------------------
// Reconciler structure

#[derive(Clone, Default, Debug)]
pub struct Reconciler {}

impl ControllerBuilder<PerconaServerMySQL> for Reconciler {
    fn build(&self, context: Arc<Context>) -> Controller<PerconaServerMySQL> {
        let client = context.kube.to_owned();

        Controller::new(Api::all(client.to_owned()), watcher::Config::default())
            .owns(Api::<StatefulSet>::all(client.to_owned()), watcher::Config::default())
            .owns(Api::<Service>::all(client), watcher::Config::default())
    }
}

#[async_trait]
impl k8s::Reconciler<PerconaServerMySQL> for Reconciler {
    type Error = ReconcilerError;

    async fn upsert(ctx: Arc<Context>, origin: Arc<PerconaServerMySQL>) -> Result<(), ReconcilerError> {
        let kind = PerconaServerMySQL::kind(&()).to_string();
        let (namespace, name) = resource::namespaced_name(&*origin);
        let owner = resource::owner_reference(&*origin);

        // ---------------------------------------------------------------------
        // Step 1: assemble and apply the resources

        let resources = topology::assemble(&origin, &ctx.config.operator.init_image);

        if let Some(config_map) = &resources.config_map {
            resource::apply(
                ctx.kube.to_owned(),
                &resource::owned(config_map.to_owned(), &owner),
            )
            .await?;
        }

        for service in resources.services() {
            resource::apply(
                ctx.kube.to_owned(),
                &resource::owned(service.to_owned(), &owner),
            )
            .await?;
        }

        let statefulset = resource::apply(
            ctx.kube.to_owned(),
            &resource::owned(resources.statefulset.to_owned(), &owner),
        )
        .await?;

        let ready = statefulset
            .status
            .as_ref()
            .and_then(|status| status.ready_replicas)
            .unwrap_or(0);

        info!(
            kind = &kind,
            namespace = &namespace,
            name = &name,
            services = resources.services().len(),
            ready = ready,
            size = topology::size(&origin),
            "Applied resources of custom resource"
        );

        // ---------------------------------------------------------------------
        // Step 2: drive the formation

        let last = origin.status.as_ref().and_then(|status| status.size);
        let size = form(&ctx, &origin, last, ready).await?;

        // ---------------------------------------------------------------------
        // Step 3: update the status

        let mut modified = (*origin).to_owned();
        modified.status = Some(Status {
            state: Some(State::of(ready, topology::size(&origin))),
            size,
        });

        let patch = resource::diff(&*origin, &modified)?;
        resource::patch_status(ctx.kube.to_owned(), modified, patch).await?;

        Ok(())
    }

    fn retry(
        _obj: Arc<PerconaServerMySQL>,
        err: &ReconcilerError,
        _ctx: Arc<Context>,
    ) -> controller::Action {
        let delay = err.retry_delay();

        trace!(
            duration = delay.as_millis() as u64,
            error = err.to_string(),
            "Requeue failed reconciliation"
        );

        controller::Action::requeue(delay)
    }

    async fn delete(_ctx: Arc<Context>, origin: Arc<PerconaServerMySQL>) -> Result<(), ReconcilerError> {
        let (namespace, name) = resource::namespaced_name(&*origin);

        info!(
            kind = PerconaServerMySQL::kind(&()).to_string(),
            namespace = &namespace,
            name = &name,
            "Owned resources are garbage collected by kubernetes"
        );

        Ok(())
    }
}

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
mod tests {
    use k8s_openapi::{
        api::core::v1::{PodCondition, PodStatus},
        ByteString,
    };
    use kube::CustomResourceExt;

    use super::*;
    use crate::svc::{exec, mysqlsh::RunError};

    #[test]
    fn custom_resource_definition() {
        let crd = PerconaServerMySQL::crd();

        assert_eq!(Some("perconaservermysqls.ps.percona.com".to_string()), crd.metadata.name);
        assert_eq!("ps.percona.com", crd.spec.group);
        assert_eq!("Namespaced", crd.spec.scope);
        assert_eq!("PerconaServerMySQL", crd.spec.names.kind);
        assert_eq!(Some(vec!["ps".to_string()]), crd.spec.names.short_names);
        assert_eq!("v1alpha1", crd.spec.versions[0].name);
    }

    #[test]
    fn minimal_manifest_uses_defaults() {
        let cr: PerconaServerMySQL = serde_yaml::from_str(
            r#"
apiVersion: ps.percona.com/v1alpha1
kind: PerconaServerMySQL
metadata:
  name: db1
  namespace: databases
spec:
  secretsName: db1-secrets
  sslSecretName: db1-ssl
  mysql:
    size: 3
    image: percona/percona-server:8.0.25
    expose:
      enabled: true
      type: NodePort
"#,
        )
        .expect("manifest to deserialize");

        assert_eq!(3, cr.spec.mysql.size);
        assert!(cr.spec.mysql.labels.is_empty());
        assert!(cr.spec.mysql.sidecars.is_empty());
        assert_eq!(None, cr.spec.mysql.configuration);
        assert_eq!(Some(ServiceType::NodePort), cr.spec.mysql.expose.type_);
        assert_eq!(ProbeSpec::default(), cr.spec.mysql.readiness_probe);
        assert_eq!(None, cr.spec.pmm);
        assert_eq!(None, cr.status);
    }

    #[test]
    fn next_formation_step() {
        assert_eq!(Step::Create, Step::next(false, None, 1));
        assert_eq!(Step::Create, Step::next(false, Some(3), 3));
        assert_eq!(Step::Rescan, Step::next(true, None, 1));
        assert_eq!(Step::Rescan, Step::next(true, Some(1), 3));
        assert_eq!(Step::Nothing, Step::next(true, Some(3), 3));
    }

    #[test]
    fn state_follows_ready_members() {
        assert_eq!(State::Initializing, State::of(1, 3));
        assert_eq!(State::Ready, State::of(3, 3));
        assert_eq!(State::Ready, State::of(0, 0));
    }

    #[test]
    fn pod_readiness() {
        let pod = |status: &str| Pod {
            status: Some(PodStatus {
                conditions: Some(vec![PodCondition {
                    type_: "Ready".to_string(),
                    status: status.to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };

        assert!(is_ready(&pod("True")));
        assert!(!is_ready(&pod("False")));
        assert!(!is_ready(&Pod::default()));
    }

    #[test]
    fn credential_from_secret() {
        let secret = Secret {
            data: Some(BTreeMap::from([(
                "operator".to_string(),
                ByteString(b"s3cr3t".to_vec()),
            )])),
            string_data: Some(BTreeMap::from([(
                "monitor".to_string(),
                "m0n".to_string(),
            )])),
            ..Default::default()
        };

        assert_eq!(Some("s3cr3t".to_string()), credential(&secret, "operator"));
        assert_eq!(Some("m0n".to_string()), credential(&secret, "monitor"));
        assert_eq!(None, credential(&secret, "root"));
    }

    #[test]
    fn action_names() {
        assert_eq!("CreateCluster", Action::CreateCluster.to_string());
        assert_eq!("RescanCluster", Action::RescanCluster.to_string());
        assert_eq!("FormationFailed", Action::FormationFailed.to_string());
    }

    #[test]
    fn formation_failures_are_retried_later() {
        let failed = ReconcilerError::Formation(mysqlsh::Error::CreateCluster(RunError {
            command: "dba.createCluster('db1')".to_string(),
            cause: exec::Error::Exit {
                program: "mysqlsh".to_string(),
                code: Some(1),
                stderr: "Access denied".to_string(),
            },
        }));
        assert_eq!(FORMATION_RETRY_DELAY, failed.retry_delay());

        let cancelled = ReconcilerError::Formation(mysqlsh::Error::RescanCluster(RunError {
            command: "dba.getCluster('db1').rescan()".to_string(),
            cause: exec::Error::Cancelled,
        }));
        assert_eq!(RETRY_DELAY, cancelled.retry_delay());

        let credentials =
            ReconcilerError::Credentials("internal-db1".to_string(), "operator".to_string());
        assert_eq!(RETRY_DELAY, credentials.retry_delay());
    }
}
