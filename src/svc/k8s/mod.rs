//! # Kubernetes module
//!
//! This module provide kubernetes custom resources, helpers and custom resource definition
//! generator

use std::{error::Error, fmt::Debug, hash::Hash, sync::Arc, time::Duration};

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use kube::{
    runtime::{
        controller::{self, Action},
        Controller,
    },
    CustomResourceExt, Resource, ResourceExt,
};
#[cfg(feature = "metrics")]
use once_cell::sync::Lazy;
#[cfg(feature = "metrics")]
use prometheus::{opts, register_counter_vec, CounterVec};
use serde::de::DeserializeOwned;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};
#[cfg(feature = "trace")]
use tracing::Instrument;

use crate::svc::{cfg::Configuration, exec::Executor};

pub mod client;
pub mod recorder;
pub mod resource;

// -----------------------------------------------------------------------------
// Constants

pub const RECONCILIATION_UPSERT_EVENT: &str = "upsert";
pub const RECONCILIATION_DELETE_EVENT: &str = "delete";

// -----------------------------------------------------------------------------
// Telemetry

#[cfg(feature = "metrics")]
static RECONCILIATION_SUCCESS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        opts!(
            "kubernetes_operator_reconciliation_success",
            "number of successful reconciliation"
        ),
        &["kind"]
    )
    .expect("metrics 'kubernetes_operator_reconciliation_success' to not be already registered")
});

#[cfg(feature = "metrics")]
static RECONCILIATION_FAILED: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        opts!(
            "kubernetes_operator_reconciliation_failed",
            "number of failed reconciliation"
        ),
        &["kind"]
    )
    .expect("metrics 'kubernetes_operator_reconciliation_failed' to not be already registered")
});

#[cfg(feature = "metrics")]
static RECONCILIATION_EVENT: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        opts!(
            "kubernetes_operator_reconciliation_event",
            "number of upsert or delete event",
        ),
        &["kind", "namespace", "event"]
    )
    .expect("metrics 'kubernetes_operator_reconciliation_event' to not be already registered")
});

#[cfg(feature = "metrics")]
static RECONCILIATION_DURATION: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        opts!(
            "kubernetes_operator_reconciliation_duration",
            "duration of reconciliation",
        ),
        &["kind", "unit"]
    )
    .expect("metrics 'kubernetes_operator_reconciliation_duration' to not be already registered")
});

// -----------------------------------------------------------------------------
// Context structure

/// contains the kubernetes client, the configuration, the executor used to
/// run the mysql shell and the token cancelling every in-flight command.
#[derive(Clone)]
pub struct Context {
    pub kube: kube::Client,
    pub config: Arc<Configuration>,
    pub executor: Arc<dyn Executor>,
    pub cancel: CancellationToken,
}

impl Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("config", &self.config)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

impl Context {
    pub fn new(
        kube: kube::Client,
        config: Arc<Configuration>,
        executor: Arc<dyn Executor>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            kube,
            config,
            executor,
            cancel,
        }
    }
}

// -----------------------------------------------------------------------------
// ControllerBuilder trait

/// provides a common way to create a kubernetes
/// controller [`Controller<T>`]
pub trait ControllerBuilder<T>
where
    T: Resource + Clone + Debug,
    <T as Resource>::DynamicType: Eq + Hash,
{
    /// returns a new created kubernetes controller
    fn build(&self, context: Arc<Context>) -> Controller<T>;
}

// -----------------------------------------------------------------------------
// Reconciler trait

/// provides two method which is given to a kubenetes controller
/// [`Controller<T>`]
#[async_trait]
pub trait Reconciler<T>
where
    T: ResourceExt + CustomResourceExt + Debug + Clone + Send + Sync + 'static,
{
    type Error: Error + Send + Sync + 'static;

    /// create or update the object, this is part of the the reconcile function
    async fn upsert(ctx: Arc<Context>, obj: Arc<T>) -> Result<(), Self::Error>;

    /// delete the object from kubernetes
    async fn delete(ctx: Arc<Context>, obj: Arc<T>) -> Result<(), Self::Error>;

    /// returns a [`Action`] to perform following the given error
    fn retry(_obj: Arc<T>, err: &Self::Error, _ctx: Arc<Context>) -> Action {
        trace!(
            duration = 500,
            error = err.to_string(),
            "Requeue failed reconciliation"
        );

        Action::requeue(Duration::from_millis(500))
    }

    /// process the object and perform actions on kubernetes and/or the mysql
    /// shell, returns a [`Action`] to maybe perform another reconciliation or
    /// an error, if something gets wrong.
    async fn reconcile(obj: Arc<T>, ctx: Arc<Context>) -> Result<Action, Self::Error> {
        let (namespace, name) = resource::namespaced_name(&*obj);
        let api_resource = T::api_resource();

        if resource::deleted(&*obj) {
            info!(
                kind = &api_resource.kind,
                uid = ?obj.meta().uid,
                name = &name,
                namespace = &namespace,
                "Received deletion event for custom resource"
            );

            #[cfg(feature = "metrics")]
            RECONCILIATION_EVENT
                .with_label_values(&[&api_resource.kind, &namespace, RECONCILIATION_DELETE_EVENT])
                .inc();

            #[cfg(not(feature = "trace"))]
            let result = Self::delete(ctx, obj.to_owned()).await;
            #[cfg(feature = "trace")]
            let result = Self::delete(ctx, obj.to_owned())
                .instrument(tracing::info_span!("Reconciler::delete"))
                .await;

            if let Err(err) = result {
                error!(
                    kind = &api_resource.kind,
                    uid = ?obj.meta().uid,
                    name = &name,
                    namespace = &namespace,
                    error = err.to_string(),
                    "Failed to delete custom resource"
                );

                return Err(err);
            }
        } else {
            info!(
                kind = &api_resource.kind,
                uid = ?obj.meta().uid,
                name = &name,
                namespace = &namespace,
                "Received upsertion event for custom resource"
            );

            #[cfg(feature = "metrics")]
            RECONCILIATION_EVENT
                .with_label_values(&[&api_resource.kind, &namespace, RECONCILIATION_UPSERT_EVENT])
                .inc();

            #[cfg(not(feature = "trace"))]
            let result = Self::upsert(ctx, obj.to_owned()).await;
            #[cfg(feature = "trace")]
            let result = Self::upsert(ctx, obj.to_owned())
                .instrument(tracing::info_span!("Reconciler::upsert"))
                .await;

            if let Err(err) = result {
                error!(
                    kind = &api_resource.kind,
                    uid = ?obj.meta().uid,
                    name = &name,
                    namespace = &namespace,
                    error = err.to_string(),
                    "Failed to upsert custom resource"
                );

                return Err(err);
            }
        }

        Ok(Action::await_change())
    }
}

// -----------------------------------------------------------------------------
// Watcher trait

/// provides a watch method that listen to events of
/// kubernetes custom resource using a [`Controller<T>`]
#[async_trait]
pub trait Watcher<T>: ControllerBuilder<T> + Reconciler<T>
where
    T: DeserializeOwned + ResourceExt + CustomResourceExt + Clone + Debug + Send + Sync + 'static,
    <T as Resource>::DynamicType: Unpin + Eq + Hash + Clone + Debug + Send + Sync,
    Self: Send + Sync + 'static,
{
    /// listen for events of the custom resource as generic parameter until
    /// the stream ends or the context is cancelled
    async fn watch(&self, context: Arc<Context>) {
        let api_resource = T::api_resource();
        let cancel = context.cancel.to_owned();
        let mut stream = self
            .build(context.to_owned())
            .run(Self::reconcile, Self::retry, context)
            .boxed();

        loop {
            let instant = Instant::now();
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(kind = &api_resource.kind, "Stop to watch custom resource, context is cancelled");
                    return;
                }
                next = stream.try_next() => next,
            };

            match next {
                Ok(None) => {
                    debug!("We have reached the end of the infinite watch stream");
                    return;
                }
                Ok(Some((obj, _action))) => {
                    info!(
                        kind = &api_resource.kind,
                        name = &obj.name,
                        namespace = ?obj.namespace,
                        "Successfully reconcile resource"
                    );

                    #[cfg(feature = "metrics")]
                    RECONCILIATION_SUCCESS
                        .with_label_values(&[&api_resource.kind])
                        .inc();
                }
                Err(controller::Error::ObjectNotFound(obj_ref)) => {
                    debug!(
                        name = &obj_ref.name,
                        namespace = ?obj_ref.namespace,
                        "Received an event about an already deleted resource"
                    );

                    #[cfg(feature = "metrics")]
                    RECONCILIATION_SUCCESS
                        .with_label_values(&[&api_resource.kind])
                        .inc();
                }
                Err(err) => {
                    error!(
                        kind = &api_resource.kind,
                        error = err.to_string(),
                        "Failed to reconcile resource"
                    );

                    #[cfg(feature = "metrics")]
                    RECONCILIATION_FAILED
                        .with_label_values(&[&api_resource.kind])
                        .inc();
                }
            }

            #[cfg(feature = "metrics")]
            RECONCILIATION_DURATION
                .with_label_values(&[&api_resource.kind, "us"])
                .inc_by(Instant::now().duration_since(instant).as_micros() as f64);

            trace!(
                kind = &api_resource.kind,
                duration = 100,
                "Put watch event loop to bed"
            );

            sleep_until(instant + Duration::from_millis(100)).await;
        }
    }
}

/// Blanket implementation for [`Watcher<T>`]
impl<T, U> Watcher<T> for U
where
    T: DeserializeOwned + ResourceExt + CustomResourceExt + Clone + Debug + Send + Sync + 'static,
    <T as Resource>::DynamicType: Unpin + Eq + Hash + Clone + Debug + Send + Sync,
    U: Reconciler<T> + ControllerBuilder<T>,
    Self: Send + Sync + 'static,
{
}
