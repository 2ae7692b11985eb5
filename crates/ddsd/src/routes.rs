//! warp binding for [`DdsService`]

use crate::api::DdsService;
use bytes::Bytes;
use dds_net::peer::HEALTH_PATH;
use std::collections::HashMap;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;
use warp::http::{Method, StatusCode};
use warp::path::FullPath;
use warp::{Filter, Rejection, Reply};

/// Catch-all filter handing every request to the service router
pub fn routes(
    service: Arc<DdsService>,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    warp::method()
        .and(warp::path::full())
        .and(warp::query::<HashMap<String, String>>())
        .and(warp::body::bytes())
        .and(with_service(service))
        .and_then(handle)
}

fn with_service(
    service: Arc<DdsService>,
) -> impl Filter<Extract = (Arc<DdsService>,), Error = Infallible> + Clone {
    warp::any().map(move || Arc::clone(&service))
}

async fn handle(
    method: Method,
    path: FullPath,
    query: HashMap<String, String>,
    body: Bytes,
    service: Arc<DdsService>,
) -> Result<impl Reply, Infallible> {
    let response = service
        .handle(method.as_str(), path.as_str(), &query, &body)
        .await;
    debug!("{} {} -> {}", method, path.as_str(), response.status);

    let content_type = if path.as_str().trim_matches('/') == HEALTH_PATH {
        "application/json"
    } else {
        service.format().content_type()
    };
    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    Ok(warp::reply::with_status(
        warp::reply::with_header(response.body, "content-type", content_type),
        status,
    ))
}

/// Bind `addr`; the returned future serves until `shutdown` fires
pub fn bind(
    service: Arc<DdsService>,
    addr: SocketAddr,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(SocketAddr, impl Future<Output = ()>), warp::Error> {
    warp::serve(routes(service)).try_bind_with_graceful_shutdown(addr, async move {
        let _ = shutdown.recv().await;
    })
}
