//! # Resource module
//!
//! This module provide helpers on kubernetes [`Resource`]

use std::fmt::Debug;

use k8s_openapi::{
    api::core::v1::ObjectReference, apimachinery::pkg::apis::meta::v1::OwnerReference,
    NamespaceResourceScope,
};
use kube::{
    api::{Patch, PatchParams},
    Api, Client, Resource, ResourceExt,
};
use serde::{de::DeserializeOwned, Serialize};
use tracing::debug;

// -----------------------------------------------------------------------------
// Constants

/// field manager used for server side apply requests
pub const FIELD_MANAGER: &str = env!("CARGO_PKG_NAME");

// -----------------------------------------------------------------------------
// Helpers functions

/// returns if the resource is considered from kubernetes point of view as deleted
pub fn deleted<T>(obj: &T) -> bool
where
    T: Resource,
{
    obj.meta().deletion_timestamp.is_some()
}

/// returns the namespace and name of the kubernetes resource.
///
/// # Panic
///
/// panic if the namespace is null, every resource handled here is namespaced
pub fn namespaced_name<T>(obj: &T) -> (String, String)
where
    T: ResourceExt,
{
    (
        obj.namespace()
            .expect("resource to be owned by a namespace"),
        obj.name_any(),
    )
}

/// returns differnce between the two given object serialize as json patch
pub fn diff<T>(origin: &T, modified: &T) -> Result<json_patch::Patch, serde_json::Error>
where
    T: Serialize,
{
    Ok(json_patch::diff(
        &serde_json::to_value(origin)?,
        &serde_json::to_value(modified)?,
    ))
}

/// make a patch request on the given resource's status using the given patch
#[cfg_attr(feature = "trace", tracing::instrument(skip(client, obj)))]
pub async fn patch_status<T>(
    client: Client,
    obj: T,
    patch: json_patch::Patch,
) -> Result<T, kube::Error>
where
    T: Resource<Scope = NamespaceResourceScope> + DeserializeOwned + Serialize + Clone + Debug,
    <T as Resource>::DynamicType: Default,
{
    let (namespace, name) = namespaced_name(&obj);

    if patch.0.is_empty() {
        debug!(
            name = &name,
            namespace = &namespace,
            "skip patch request on resource's status, no operation to apply"
        );

        return Ok(obj);
    }

    debug!(
        name = &name,
        namespace = &namespace,
        patch = serde_json::to_string(&patch).unwrap_or_default(),
        "execute patch request on resource's status"
    );

    Api::namespaced(client, &namespace)
        .patch_status(&name, &PatchParams::default(), &Patch::Json::<T>(patch))
        .await
}

/// make a server side apply request for the given resource, the operator
/// takes ownership of the fields it sets
#[cfg_attr(feature = "trace", tracing::instrument(skip(client, obj)))]
pub async fn apply<T>(client: Client, obj: &T) -> Result<T, kube::Error>
where
    T: Resource<Scope = NamespaceResourceScope> + DeserializeOwned + Serialize + Clone + Debug,
    <T as Resource>::DynamicType: Default,
{
    let (namespace, name) = namespaced_name(obj);
    let kind = T::kind(&Default::default()).to_string();

    debug!(
        kind = &kind,
        name = &name,
        namespace = &namespace,
        "execute server side apply request on resource"
    );

    Api::namespaced(client, &namespace)
        .patch(
            &name,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(obj),
        )
        .await
}

/// returns the resource with the given name or none, if it does not exist
#[cfg_attr(feature = "trace", tracing::instrument(skip(client)))]
pub async fn get<T>(client: Client, namespace: &str, name: &str) -> Result<Option<T>, kube::Error>
where
    T: Resource<Scope = NamespaceResourceScope> + DeserializeOwned + Clone + Debug,
    <T as Resource>::DynamicType: Default,
{
    let kind = T::kind(&Default::default()).to_string();

    debug!(
        kind = &kind,
        name = &name,
        namespace = &namespace,
        "execute a request to retrieve resource"
    );

    Api::namespaced(client, namespace).get_opt(name).await
}

/// returns a owner references object pointing to the given resource, it
/// marks the resource as the controller of the owned object.
///
/// # Panic
///
/// panic if the resource has no unique identifier, kubernetes always gives
/// one to persisted objects
pub fn owner_reference<T>(obj: &T) -> OwnerReference
where
    T: Resource<DynamicType = ()>,
{
    obj.controller_owner_ref(&())
        .expect("to have an unique identifier provided by kubernetes")
}

/// returns the given object with the owner reference set
pub fn owned<T>(mut obj: T, owner: &OwnerReference) -> T
where
    T: Resource,
{
    obj.meta_mut().owner_references = Some(vec![owner.to_owned()]);
    obj
}

/// returns an object reference pointing to the given resource
pub fn object_reference<T>(obj: &T) -> ObjectReference
where
    T: Resource<DynamicType = ()>,
{
    obj.object_ref(&())
}

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::ConfigMap;
    use kube::api::ObjectMeta;

    use super::*;

    fn config_map(data: &[(&str, &str)]) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some("db1-mysql".to_string()),
                namespace: Some("databases".to_string()),
                uid: Some("6f0a8bd4".to_string()),
                ..Default::default()
            },
            data: Some(
                data.iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
            ..Default::default()
        }
    }

    #[test]
    fn namespaced_name_of_resource() {
        assert_eq!(
            ("databases".to_string(), "db1-mysql".to_string()),
            namespaced_name(&config_map(&[]))
        );
    }

    #[test]
    fn diff_is_empty_for_identical_objects() {
        let cm = config_map(&[("my.cnf", "[mysqld]")]);

        assert!(diff(&cm, &cm).expect("to compute diff").0.is_empty());
        assert!(!diff(&cm, &config_map(&[("my.cnf", "[client]")]))
            .expect("to compute diff")
            .0
            .is_empty());
    }

    #[test]
    fn owner_reference_marks_the_controller() {
        let owner = owner_reference(&config_map(&[]));

        assert_eq!(Some(true), owner.controller);
        assert_eq!("ConfigMap", owner.kind);
        assert_eq!("6f0a8bd4", owner.uid);

        let owned = owned(ConfigMap::default(), &owner);
        assert_eq!(Some(vec![owner]), owned.metadata.owner_references);
    }

    #[test]
    fn object_reference_points_to_the_resource() {
        let reference = object_reference(&config_map(&[]));

        assert_eq!(Some("db1-mysql".to_string()), reference.name);
        assert_eq!(Some("databases".to_string()), reference.namespace);
        assert_eq!(Some("ConfigMap".to_string()), reference.kind);
    }
}
