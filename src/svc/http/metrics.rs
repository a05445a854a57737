//! # Metrics module
//!
//! This module exposes the prometheus registry of the operator

use hyper::{
    header::{self, HeaderValue, InvalidHeaderValue},
    Body, Request, Response, StatusCode,
};
use prometheus::{gather, Encoder, TextEncoder};

// -----------------------------------------------------------------------------
// Error enum

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to serialize metrics, {0}")]
    PrometheusSerialize(prometheus::Error),
    #[error("failed to parse header value given by prometheus, {0}")]
    PrometheusInvalidHeader(InvalidHeaderValue),
}

// -----------------------------------------------------------------------------
// Helper methods

/// returns in the [`Response`] object the encoded metrics gathered from the
/// application
pub async fn handler(_req: &Request<Body>) -> Result<Response<Body>, Error> {
    let families = gather();
    let encoder = TextEncoder::new();
    let mut buf = vec![];

    encoder
        .encode(&families, &mut buf)
        .map_err(Error::PrometheusSerialize)?;

    let mut res = Response::default();

    res.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(encoder.format_type()).map_err(Error::PrometheusInvalidHeader)?,
    );

    *res.status_mut() = StatusCode::OK;
    *res.body_mut() = Body::from(buf);

    Ok(res)
}
