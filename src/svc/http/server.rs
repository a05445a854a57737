//! # Server module
//!
//! This module provides the http server of the operator, it stops once the
//! given token is cancelled.

use std::{convert::Infallible, net::SocketAddr};

use hyper::{
    service::{make_service_fn, service_fn},
    Body, Request, Server,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::svc::http::router;

// -----------------------------------------------------------------------------
// Error

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to bind on socket '{0}', {1}")]
    Bind(SocketAddr, hyper::Error),
    #[error("failed to serve on socket '{0}', {1}")]
    Serve(SocketAddr, hyper::Error),
}

// -----------------------------------------------------------------------------
// helpers

#[cfg_attr(feature = "trace", tracing::instrument(skip(cancel)))]
pub async fn serve(addr: SocketAddr, cancel: CancellationToken) -> Result<(), Error> {
    let builder = Server::try_bind(&addr).map_err(|err| Error::Bind(addr, err))?;

    let service = make_service_fn(|_| async {
        Ok::<_, Infallible>(service_fn(|req: Request<Body>| async move {
            match router(req).await {
                Ok(res) => Ok(res),
                Err(err) => {
                    error!(error = err.to_string(), "Could not handle request");
                    Err(err)
                }
            }
        }))
    });

    info!(addr = addr.to_string(), "Begin to listen on address");
    builder
        .serve(service)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .map_err(|err| Error::Serve(addr, err))
}
