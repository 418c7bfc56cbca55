use axum::{Router, routing::get};
use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tokio::net::TcpListener;
use tracing::info;

pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;

    describe_counter!("market_orders_cancelled_total", "Orders moved to cancelled");
    describe_counter!(
        "market_stock_restored_units_total",
        "Units returned to product stock by cancellations"
    );
    describe_histogram!(
        "market_status_change_seconds",
        "Time spent applying an order status change"
    );
    describe_counter!("market_outbox_delivered_total", "Outbox events delivered");
    describe_counter!("market_outbox_failed_total", "Failed outbox delivery attempts");

    info!("Prometheus metrics recorder initialized");
    Ok(handle)
}

/// `GET /metrics` in the Prometheus text format.
pub fn metrics_router(handle: PrometheusHandle) -> Router {
    Router::new().route("/metrics", get(move || async move { handle.render() }))
}

/// Serves [`metrics_router`] on its own listener, for workers without an HTTP API.
pub async fn serve_metrics(listener: TcpListener, handle: PrometheusHandle) -> std::io::Result<()> {
    info!(address = ?listener.local_addr().ok(), "Serving metrics");
    axum::serve(listener, metrics_router(handle)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use http_body_util::BodyExt;
    use metrics::counter;
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_metrics_route_renders_recorded_counters() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        metrics::with_local_recorder(&recorder, || {
            counter!("market_outbox_delivered_total").increment(2);
        });

        let request = axum::http::Request::get("/metrics").body(Body::empty()).unwrap();
        let response = metrics_router(handle).oneshot(request).await.unwrap();

        assert_eq!(response.status(), axum::http::StatusCode::OK);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("market_outbox_delivered_total 2"), "{}", text);
    }

    #[tokio::test]
    async fn test_served_metrics_are_reachable_over_tcp() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        metrics::with_local_recorder(&recorder, || {
            counter!("market_outbox_failed_total").increment(1);
        });
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        tokio::spawn(serve_metrics(listener, handle));

        let text = reqwest::get(format!("http://{}/metrics", address))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();

        assert!(text.contains("market_outbox_failed_total 1"), "{}", text);
    }
}
