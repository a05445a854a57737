//! # Logging module
//!
//! This module provides logging facilities and helpers

use tracing::Level;
use tracing_subscriber::{filter::LevelFilter, layer::SubscriberExt, Layer};

use crate::svc::cfg::Configuration;

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to set global default subscriber, {0}")]
    GlobalDefaultSubscriber(tracing::subscriber::SetGlobalDefaultError),
    #[cfg(feature = "tracker")]
    #[error("failed to parse sentry dsn, {0}")]
    Dsn(sentry_types::ParseDsnError),
    #[cfg(feature = "trace")]
    #[error("failed to install jaeger pipeline, {0}")]
    Jaeger(opentelemetry::trace::TraceError),
}

// -----------------------------------------------------------------------------
// Guard structure

/// keeps the error tracker alive, events are flushed once dropped
#[derive(Default)]
pub struct Guard {
    #[cfg(feature = "tracker")]
    _sentry: Option<sentry::ClientInitGuard>,
}

impl Drop for Guard {
    fn drop(&mut self) {
        #[cfg(feature = "trace")]
        opentelemetry::global::shutdown_tracer_provider();
    }
}

// -----------------------------------------------------------------------------
// helpers

pub const fn level(verbosity: usize) -> Level {
    match verbosity {
        0 => Level::ERROR,
        1 => Level::WARN,
        2 => Level::INFO,
        3 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

#[cfg(feature = "tracker")]
fn tracker(config: &Configuration) -> Result<Option<sentry::ClientInitGuard>, Error> {
    let dsn = match config.sentry.as_ref().and_then(|sentry| sentry.dsn.as_ref()) {
        Some(dsn) => dsn.parse::<sentry_types::Dsn>().map_err(Error::Dsn)?,
        None => return Ok(None),
    };

    Ok(Some(sentry::init(sentry::ClientOptions {
        dsn: Some(dsn),
        release: sentry::release_name!(),
        ..Default::default()
    })))
}

#[cfg(feature = "trace")]
fn tracer(
    config: &Configuration,
) -> Result<Option<opentelemetry::sdk::trace::Tracer>, Error> {
    let jaeger = match &config.jaeger {
        Some(jaeger) => jaeger,
        None => return Ok(None),
    };

    let mut pipeline = opentelemetry_jaeger::new_collector_pipeline()
        .with_endpoint(&jaeger.endpoint)
        .with_service_name(env!("CARGO_PKG_NAME"))
        .with_reqwest();

    if let Some(user) = &jaeger.user {
        pipeline = pipeline.with_username(user);
    }

    if let Some(password) = &jaeger.password {
        pipeline = pipeline.with_password(password);
    }

    pipeline
        .install_batch(opentelemetry::runtime::Tokio)
        .map(Some)
        .map_err(Error::Jaeger)
}

/// installs the global subscriber, the returned guard has to be kept until
/// the program exits
pub fn initialize(config: &Configuration, verbosity: usize) -> Result<Guard, Error> {
    let fmt = tracing_subscriber::fmt::layer()
        .with_thread_names(true)
        .with_line_number(true)
        .with_thread_ids(true)
        .with_target(true)
        .with_filter(LevelFilter::from_level(level(verbosity)));

    let registry = tracing_subscriber::registry().with(fmt);

    #[cfg(feature = "tracker")]
    let sentry = tracker(config)?;
    #[cfg(feature = "tracker")]
    let registry = registry.with(sentry.as_ref().map(|_| sentry_tracing::layer()));

    #[cfg(feature = "trace")]
    let registry = registry.with(
        tracer(config)?.map(|tracer| tracing_opentelemetry::layer().with_tracer(tracer)),
    );

    #[cfg(not(any(feature = "tracker", feature = "trace")))]
    let _ = config;

    tracing::subscriber::set_global_default(registry).map_err(Error::GlobalDefaultSubscriber)?;

    Ok(Guard {
        #[cfg(feature = "tracker")]
        _sentry: sentry,
    })
}
