//! # Event module
//!
//! This module provide helpers to interact with the kubernetes core/v1/event
//! api

use chrono::Utc;
use k8s_openapi::{
    api::core::v1::{Event, EventSource},
    apimachinery::pkg::apis::meta::v1::{MicroTime, Time},
};
use kube::{api::ObjectMeta, Resource, ResourceExt};

use crate::svc::k8s::{recorder::Level, resource};

// -----------------------------------------------------------------------------
// Constants

pub const COMPONENT: &str = env!("CARGO_PKG_NAME");

// -----------------------------------------------------------------------------
// Helper functions

/// create a new event from the given parameters
pub fn new<T, U>(obj: &T, kind: Level, action: &U, message: &str) -> Event
where
    T: Resource<DynamicType = ()> + ResourceExt,
    U: ToString,
{
    let now = Utc::now();
    let action = action.to_string();

    Event {
        metadata: ObjectMeta {
            namespace: obj.namespace(),
            name: Some(format!(
                "{}-{}-{}",
                obj.name_any(),
                action.to_lowercase(),
                now.timestamp_millis()
            )),
            ..Default::default()
        },
        type_: Some(kind.to_string()),
        action: Some(action.to_owned()),
        count: Some(1),
        event_time: Some(MicroTime(now)),
        first_timestamp: Some(Time(now)),
        involved_object: resource::object_reference(obj),
        last_timestamp: Some(Time(now)),
        message: Some(message.to_string()),
        reason: Some(action),
        reporting_component: Some(COMPONENT.to_string()),
        reporting_instance: Some(format!(
            "{}/{}",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION")
        )),
        series: None,
        source: Some(source()),
        ..Default::default()
    }
}

/// returns the source of this operator
pub fn source() -> EventSource {
    let host = hostname::get()
        .ok()
        .map(|host| host.to_string_lossy().to_string());

    EventSource {
        component: Some(COMPONENT.to_string()),
        host,
    }
}
