use hyper::{
    service::{make_service_fn, service_fn},
    Body, Method, Request, Response, Server, StatusCode,
};
use lazy_static::lazy_static;
use prometheus::{
    register_int_counter_vec_with_registry, register_int_counter_with_registry,
    register_int_gauge_vec_with_registry, register_int_gauge_with_registry, Encoder, IntCounter,
    IntCounterVec, IntGauge, IntGaugeVec, Registry, TextEncoder,
};
use serde_json::json;
use std::convert::Infallible;
use std::net::SocketAddr;
use tokio_util::sync::CancellationToken;

// Create a new registry named `devnet`
lazy_static! {
    pub static ref DEVNET_REGISTRY: Registry =
        Registry::new_custom(Some("devnet".to_string()), None).unwrap();
}

// Register metrics with the `devnet` registry
lazy_static! {
    pub static ref NODES_REGISTERED: IntGauge = register_int_gauge_with_registry!(
        "nodes_registered",
        "Number of node instances currently held by the manager",
        DEVNET_REGISTRY
    )
    .unwrap();
    pub static ref NODE_START_TOTALS: IntCounterVec = register_int_counter_vec_with_registry!(
        "node_start_totals",
        "Node launches by outcome",
        &["status"],
        DEVNET_REGISTRY
    )
    .unwrap();
    pub static ref HEALTH_CHECK_TOTALS: IntCounterVec = register_int_counter_vec_with_registry!(
        "health_check_totals",
        "Per-node health checks by outcome",
        &["status"],
        DEVNET_REGISTRY
    )
    .unwrap();
    pub static ref HEALTHY_NODES: IntGauge = register_int_gauge_with_registry!(
        "healthy_nodes",
        "Nodes that passed the most recent health sweep",
        DEVNET_REGISTRY
    )
    .unwrap();
    pub static ref PEER_CONNECTION_TOTALS: IntCounterVec = register_int_counter_vec_with_registry!(
        "peer_connection_totals",
        "Pairwise peer connection attempts by outcome",
        &["status"],
        DEVNET_REGISTRY
    )
    .unwrap();
    pub static ref ACTIVE_MINERS: IntGauge = register_int_gauge_with_registry!(
        "active_miners",
        "Accounts with mining intent set",
        DEVNET_REGISTRY
    )
    .unwrap();
    pub static ref MINING_MONITOR_TICKS: IntCounter = register_int_counter_with_registry!(
        "mining_monitor_ticks_total",
        "Completed mining monitor passes",
        DEVNET_REGISTRY
    )
    .unwrap();
    pub static ref NODE_BLOCK_HEIGHT: IntGaugeVec = register_int_gauge_vec_with_registry!(
        "node_block_height",
        "Latest block number reported by each node",
        &["node"],
        DEVNET_REGISTRY
    )
    .unwrap();
}

fn encode_metrics() -> Result<Vec<u8>, prometheus::Error> {
    let mut metric_families = DEVNET_REGISTRY.gather();
    metric_families.extend(prometheus::gather());

    let mut buffer = Vec::new();
    TextEncoder::new().encode(&metric_families, &mut buffer)?;
    Ok(buffer)
}

async fn handle_request(req: Request<Body>) -> Result<Response<Body>, Infallible> {
    let response = match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => match encode_metrics() {
            Ok(buffer) => Response::builder()
                .status(StatusCode::OK)
                .header(hyper::header::CONTENT_TYPE, TextEncoder::new().format_type())
                .body(Body::from(buffer)),
            Err(e) => {
                tracing::warn!("Failed to encode metrics: {}", e);
                Response::builder()
                    .status(StatusCode::INTERNAL_SERVER_ERROR)
                    .body(Body::from(e.to_string()))
            }
        },
        (&Method::GET, "/health") => {
            let health_status = json!({
                "status": "healthy",
                "version": env!("CARGO_PKG_VERSION"),
                "nodes": NODES_REGISTERED.get(),
                "healthy_nodes": HEALTHY_NODES.get(),
                "active_miners": ACTIVE_MINERS.get(),
            });
            Response::builder()
                .status(StatusCode::OK)
                .header(hyper::header::CONTENT_TYPE, "application/json")
                .body(Body::from(health_status.to_string()))
        }
        _ => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Body::from("Not Found")),
    };

    Ok(response.unwrap_or_else(|_| {
        let mut fallback = Response::new(Body::empty());
        *fallback.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
        fallback
    }))
}

/// Serve `/metrics` and `/health` on `0.0.0.0:port` until `shutdown` fires.
pub fn start_server(port: u16, shutdown: CancellationToken) -> Result<(), hyper::Error> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    let make_svc =
        make_service_fn(|_conn| async { Ok::<_, Infallible>(service_fn(handle_request)) });

    let server = Server::try_bind(&addr)?
        .serve(make_svc)
        .with_graceful_shutdown(async move { shutdown.cancelled().await });

    tokio::spawn(async move {
        tracing::info!("Starting metrics server on {}", addr);

        if let Err(e) = server.await {
            tracing::error!("Metrics server error: {}", e);
        }
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn metrics_endpoint_exposes_devnet_registry() {
        NODES_REGISTERED.set(3);
        let response = handle_request(
            Request::get("/metrics").body(Body::empty()).unwrap(),
        )
        .await
        .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("devnet_nodes_registered"));
    }

    #[tokio::test]
    async fn health_endpoint_returns_json() {
        let response = handle_request(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["status"], "healthy");
    }

    #[tokio::test]
    async fn unknown_path_is_not_found() {
        let response = handle_request(Request::get("/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
