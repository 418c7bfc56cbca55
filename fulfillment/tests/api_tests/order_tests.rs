use axum::{body::Body, http::StatusCode};
use chrono::Utc;
use common::test_helpers::test_utils::{build_request, check_status_code};
use http_body_util::BodyExt;
use std::time::Duration;
use tower::ServiceExt;
use uuid::Uuid;

use fulfillment::{
    error::MarketError,
    model::{Order, OrderStatus},
};

use super::mocks::{MockOrderStore, market_router, mocked_router, send};
use super::test_utils::Market;

fn order_of(consumer: Uuid, seller: Uuid) -> Order {
    let now = Utc::now();
    Order {
        id: 1,
        user_id: consumer,
        seller_id: seller,
        status: OrderStatus::Pending,
        delivery_method: "pickup".to_string(),
        payment_method: "cash_on_pickup".to_string(),
        delivery_fee: 0.0,
        created_at: now,
        updated_at: now,
        items: vec![],
    }
}

#[tokio::test]
async fn test_health_check() {
    let market = Market::new();
    let request = build_request("GET", "/health", None, None).unwrap();
    let (status, _) = send(market_router(&market), request).await;
    check_status_code(status, StatusCode::OK).unwrap();
}

#[tokio::test]
async fn test_requests_without_valid_user_are_unauthorized() {
    let market = Market::new();

    let request = build_request("GET", "/api/consumer/orders", None, None).unwrap();
    let (status, body) = send(market_router(&market), request).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(body["error"].as_str().unwrap().contains("Missing"));

    let request = build_request("GET", "/api/consumer/orders", Some("not-a-uuid"), None).unwrap();
    let (status, _) = send(market_router(&market), request).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_list_orders_is_scoped_to_caller() {
    let market = Market::new();
    let product = market.product("Tomato", 10);
    market.order(OrderStatus::Pending, &[(product.id, 2)]);
    market.order(OrderStatus::Completed, &[(product.id, 1)]);

    let consumer = market.consumer.to_string();
    let request = build_request("GET", "/api/consumer/orders", Some(&consumer), None).unwrap();
    let (status, body) = send(market_router(&market), request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 2);

    let stranger = Uuid::new_v4().to_string();
    let request = build_request("GET", "/api/consumer/orders", Some(&stranger), None).unwrap();
    let (_, body) = send(market_router(&market), request).await;
    assert!(body.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_cancel_over_http_restores_stock() {
    let market = Market::new();
    let product = market.product("Eggplant", 10);
    let order = market.order(OrderStatus::Pending, &[(product.id, 3)]);

    let uri = format!("/api/consumer/orders/{}/status", order.id);
    let consumer = market.consumer.to_string();
    let body = serde_json::json!({ "status": "cancelled" }).to_string();
    let request = build_request("POST", &uri, Some(&consumer), Some(body)).unwrap();
    let (status, body) = send(market_router(&market), request).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["order"]["status"], "cancelled");
    assert_eq!(body["changed"], true);
    assert_eq!(body["restored"][0]["stock"], 13);
    assert_eq!(market.storage.product_stock(product.id), Some(13));
}

#[tokio::test]
async fn test_status_errors_map_to_http_codes() {
    let market = Market::new();
    let product = market.product("Rice", 10);
    let order = market.order(OrderStatus::Confirmed, &[(product.id, 1)]);
    let consumer = market.consumer.to_string();
    let producer = market.producer.to_string();
    let uri = format!("/api/consumer/orders/{}/status", order.id);

    // Consumers cannot cancel once confirmed
    let body = serde_json::json!({ "status": "cancelled" }).to_string();
    let request = build_request("POST", &uri, Some(&consumer), Some(body)).unwrap();
    let (status, body) = send(market_router(&market), request).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(body["error"].as_str().unwrap().contains("not allowed"));

    let body = serde_json::json!({ "status": "shipped" }).to_string();
    let uri = format!("/api/producer/orders/{}/status", order.id);
    let request = build_request("POST", &uri, Some(&producer), Some(body)).unwrap();
    let (status, _) = send(market_router(&market), request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let body = serde_json::json!({ "status": "preparing" }).to_string();
    let request = build_request("POST", &uri, Some(&consumer), Some(body)).unwrap();
    let (status, _) = send(market_router(&market), request).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let body = serde_json::json!({ "status": "preparing" }).to_string();
    let uri = "/api/producer/orders/424242/status";
    let request = build_request("POST", uri, Some(&producer), Some(body)).unwrap();
    let (status, _) = send(market_router(&market), request).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_next_actions_endpoint() {
    let market = Market::new();
    let product = market.product("Mango", 10);
    let order = market.order(OrderStatus::ReadyForPickup, &[(product.id, 1)]);

    let uri = format!("/api/producer/orders/{}/actions", order.id);
    let producer = market.producer.to_string();
    let request = build_request("GET", &uri, Some(&producer), None).unwrap();
    let (status, body) = send(market_router(&market), request).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, serde_json::json!(["completed", "cancelled"]));
}

#[tokio::test]
async fn test_concurrent_modification_is_a_conflict() {
    let consumer = Uuid::new_v4();
    let order = order_of(consumer, Uuid::new_v4());
    let mut store = MockOrderStore::new();
    store.expect_get_order().returning(move |_| Ok(order.clone()));
    store
        .expect_cancel_order()
        .times(1)
        .returning(|order_id, _| Err(MarketError::StaleStatus { order_id }));

    let body = serde_json::json!({ "status": "cancelled" }).to_string();
    let consumer = consumer.to_string();
    let uri = "/api/consumer/orders/1/status";
    let request = build_request("POST", uri, Some(&consumer), Some(body)).unwrap();
    let (status, body) = send(mocked_router(store), request).await;

    assert_eq!(status, StatusCode::CONFLICT);
    assert!(body["error"].as_str().unwrap().contains("modified concurrently"));
}

#[tokio::test]
async fn test_storage_failure_is_internal_error() {
    let mut store = MockOrderStore::new();
    store
        .expect_list_order_views()
        .returning(|_| Err(MarketError::Database("connection reset".to_string())));

    let stranger = Uuid::new_v4().to_string();
    let request = build_request("GET", "/api/producer/orders", Some(&stranger), None).unwrap();
    let (status, body) = send(mocked_router(store), request).await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body["error"].as_str().unwrap().contains("connection reset"));
}

/// Next server-sent event, skipping keep-alives and ignored changes.
async fn next_event(body: &mut Body) -> String {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), body.frame())
            .await
            .expect("event within timeout")
            .expect("stream still open")
            .expect("readable frame");
        if let Ok(data) = frame.into_data() {
            let text = String::from_utf8_lossy(&data).into_owned();
            if !text.starts_with(':') && !text.contains("event: ignored") {
                return text;
            }
        }
    }
}

#[tokio::test]
async fn test_order_stream_sends_snapshot_then_updates() {
    let market = Market::new();
    let product = market.product("Tomato", 10);
    let order = market.order(OrderStatus::Pending, &[(product.id, 2)]);
    let consumer = market.consumer.to_string();

    let request = build_request("GET", "/api/consumer/orders/stream", Some(&consumer), None)
        .unwrap()
        .map(Body::from);
    let response = market_router(&market).oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers()["content-type"]
        .to_str()
        .unwrap()
        .starts_with("text/event-stream"));
    let mut body = response.into_body();

    let snapshot = next_event(&mut body).await;
    assert!(snapshot.contains("event: reloaded"), "{}", snapshot);
    assert!(snapshot.contains(&format!("\"id\":{}", order.id)), "{}", snapshot);

    market.orders.cancel(&market.consumer_actor(), order.id).await.unwrap();

    let update = next_event(&mut body).await;
    assert!(update.contains("event: upserted"), "{}", update);
    assert!(update.contains("\"status\":\"cancelled\""), "{}", update);
}

#[tokio::test]
async fn test_order_stream_requires_user() {
    let market = Market::new();
    let request = build_request("GET", "/api/producer/orders/stream", None, None).unwrap();
    let (status, body) = send(market_router(&market), request).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(body["error"].is_string());
}

#[tokio::test]
async fn test_unparseable_paths_and_bodies_get_json_errors() {
    let market = Market::new();
    let product = market.product("Squash", 10);
    let order = market.order(OrderStatus::Pending, &[(product.id, 1)]);
    let consumer = market.consumer.to_string();

    let request = build_request("GET", "/api/admin/orders", Some(&consumer), None).unwrap();
    let (status, body) = send(market_router(&market), request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].is_string(), "{}", body);

    let uri = "/api/consumer/orders/latest/actions";
    let request = build_request("GET", uri, Some(&consumer), None).unwrap();
    let (status, body) = send(market_router(&market), request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].is_string(), "{}", body);

    let uri = format!("/api/consumer/orders/{}/status", order.id);
    let truncated = Some("{\"status\":".to_string());
    let request = build_request("POST", &uri, Some(&consumer), truncated).unwrap();
    let (status, body) = send(market_router(&market), request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].is_string(), "{}", body);

    let request = build_request("POST", &uri, Some(&consumer), Some("{}".to_string())).unwrap();
    let (status, body) = send(market_router(&market), request).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert!(body["error"].as_str().unwrap().contains("status"), "{}", body);

    assert_eq!(market.storage.product_stock(product.id), Some(10));
}

