//! # Event recorder module
//!
//! This module provide an alternative to the golang EventRecorder structure
//!
//! See following links for more details:
//! - <https://book-v1.book.kubebuilder.io/beyond_basics/creating_events.html>
//! - <https://github.com/kubernetes/client-go/blob/master/tools/record/event.go#L56>

use std::{
    fmt::{self, Debug, Display, Formatter},
    str::FromStr,
};

use k8s_openapi::api::core::v1::Event;
use kube::{api::PostParams, Api, Client, Resource, ResourceExt};
use tracing::debug;

pub mod event;

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to parse '{0}', available options are 'normal' or 'warning'")]
    Parse(String),
}

// -----------------------------------------------------------------------------
// Level enumeration

#[derive(PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Debug)]
pub enum Level {
    Warning,
    Normal,
}

impl FromStr for Level {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_lowercase().as_str() {
            "warning" => Self::Warning,
            "normal" => Self::Normal,
            _ => {
                return Err(Error::Parse(s.to_string()));
            }
        })
    }
}

impl Display for Level {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Self::Warning => write!(f, "Warning"),
            Self::Normal => write!(f, "Normal"),
        }
    }
}

// -----------------------------------------------------------------------------
// Helper methods

/// record an event for the given object
#[cfg_attr(feature = "trace", tracing::instrument(skip(client, obj)))]
pub async fn record<T, U>(
    client: Client,
    obj: &T,
    kind: Level,
    action: &U,
    message: &str,
) -> Result<Event, kube::Error>
where
    T: Resource<DynamicType = ()> + ResourceExt,
    U: ToString + Debug,
{
    let namespace = obj.namespace().unwrap_or_else(|| "default".to_string());

    debug!(
        action = action.to_string(),
        namespace = &namespace,
        name = obj.name_any(),
        level = kind.to_string(),
        "Create event for resource, {}",
        message
    );

    Api::<Event>::namespaced(client, &namespace)
        .create(&PostParams::default(), &event::new(obj, kind, action, message))
        .await
}

/// shortcut for the [`record`] method with the 'Normal' [`Level`]
pub async fn normal<T, U>(
    client: Client,
    obj: &T,
    action: &U,
    message: &str,
) -> Result<Event, kube::Error>
where
    T: Resource<DynamicType = ()> + ResourceExt,
    U: ToString + Debug,
{
    record(client, obj, Level::Normal, action, message).await
}

/// shortcut for the [`record`] method with the 'Warning' [`Level`]
pub async fn warning<T, U>(
    client: Client,
    obj: &T,
    action: &U,
    message: &str,
) -> Result<Event, kube::Error>
where
    T: Resource<DynamicType = ()> + ResourceExt,
    U: ToString + Debug,
{
    record(client, obj, Level::Warning, action, message).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_level() {
        assert_eq!(Level::Normal, "Normal".parse::<Level>().expect("a level"));
        assert_eq!(Level::Warning, "warning".parse::<Level>().expect("a level"));
        assert!("error".parse::<Level>().is_err());
        assert_eq!("Warning", Level::Warning.to_string());
    }
}
