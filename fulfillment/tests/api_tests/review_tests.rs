use axum::http::StatusCode;
use common::test_helpers::test_utils::build_request;
use uuid::Uuid;

use fulfillment::model::OrderStatus;

use super::mocks::{market_router, send};
use super::test_utils::Market;

#[tokio::test]
async fn test_review_rating_and_votes() {
    let market = Market::new();
    let product = market.product("Pineapple", 10);
    market.order(OrderStatus::Completed, &[(product.id, 1)]);
    let consumer = market.consumer.to_string();

    let uri = format!("/api/products/{}/reviews", product.id);
    let body = serde_json::json!({ "rating": 4, "comment": "Sweet" }).to_string();
    let request = build_request("POST", &uri, Some(&consumer), Some(body)).unwrap();
    let (status, review) = send(market_router(&market), request).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(review["rating"], 4);
    let review_id = review["id"].as_i64().unwrap();

    let body = serde_json::json!({ "rating": 5 }).to_string();
    let request = build_request("POST", &uri, Some(&consumer), Some(body)).unwrap();
    let (status, _) = send(market_router(&market), request).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let uri = format!("/api/products/{}/rating", product.id);
    let request = build_request("GET", &uri, None, None).unwrap();
    let (status, summary) = send(market_router(&market), request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(summary["count"], 1);
    assert_eq!(summary["distribution"], serde_json::json!([0, 0, 0, 1, 0]));

    let reader = Uuid::new_v4().to_string();
    let uri = format!("/api/reviews/{}/helpful", review_id);
    let request = build_request("POST", &uri, Some(&reader), None).unwrap();
    let (status, vote) = send(market_router(&market), request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(vote["voted"], true);
    assert_eq!(vote["count"], 1);

    let uri = format!("/api/reviews/{}/report", review_id);
    let body = serde_json::json!({ "reason": "Off-topic" }).to_string();
    let request = build_request("POST", &uri, Some(&reader), Some(body)).unwrap();
    let (status, _) = send(market_router(&market), request).await;
    assert_eq!(status, StatusCode::CREATED);
}

#[tokio::test]
async fn test_review_without_purchase_is_forbidden() {
    let market = Market::new();
    let product = market.product("Lanzones", 10);

    let uri = format!("/api/products/{}/reviews", product.id);
    let body = serde_json::json!({ "rating": 5 }).to_string();
    let consumer = market.consumer.to_string();
    let request = build_request("POST", &uri, Some(&consumer), Some(body)).unwrap();
    let (status, _) = send(market_router(&market), request).await;

    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_review_body_without_rating_is_json_error() {
    let market = Market::new();
    let product = market.product("Okra", 10);
    market.order(OrderStatus::Completed, &[(product.id, 1)]);
    let consumer = market.consumer.to_string();

    let uri = format!("/api/products/{}/reviews", product.id);
    let body = serde_json::json!({ "comment": "No stars" }).to_string();
    let request = build_request("POST", &uri, Some(&consumer), Some(body)).unwrap();
    let (status, body) = send(market_router(&market), request).await;

    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert!(body["error"].as_str().unwrap().contains("rating"), "{}", body);
}

