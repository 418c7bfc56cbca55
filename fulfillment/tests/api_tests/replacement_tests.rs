use axum::http::StatusCode;
use common::test_helpers::test_utils::build_request;

use fulfillment::{
    executable_utils::AppState,
    image::MAX_IMAGE_BYTES,
    model::OrderStatus,
    replacement::EVIDENCE_BUCKET,
};

use super::mocks::{market_router, send};
use super::test_utils::Market;

const BOUNDARY: &str = "market-test-boundary";

fn multipart_body(fields: &[(&str, &str)], image: Option<(&str, &str)>) -> String {
    let mut body = String::new();
    for (name, value) in fields {
        body.push_str(&format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
        ));
    }
    if let Some((content_type, bytes)) = image {
        body.push_str(&format!(
            "--{BOUNDARY}\r\n\
             Content-Disposition: form-data; name=\"image\"; filename=\"proof.jpg\"\r\n\
             Content-Type: {content_type}\r\n\r\n{bytes}\r\n"
        ));
    }
    body.push_str(&format!("--{BOUNDARY}--\r\n"));
    body
}

fn multipart_request(uri: &str, user: &str, body: String) -> http::Request<String> {
    http::Request::builder()
        .method("POST")
        .uri(uri)
        .header("x-user-id", user)
        .header("Content-Type", format!("multipart/form-data; boundary={BOUNDARY}"))
        .body(body)
        .unwrap()
}

#[tokio::test]
async fn test_submit_and_resolve_over_http() {
    let market = Market::new();
    let product = market.product("Tomato", 10);
    let order = market.order(OrderStatus::Completed, &[(product.id, 2)]);
    let item_id = order.items[0].id;

    let image = Some(("image/jpeg", "jpegbytes"));
    let body = multipart_body(&[("reason", "Damaged on arrival")], image);
    let uri = format!("/api/consumer/order-items/{}/replacement", item_id);
    let request = multipart_request(&uri, &market.consumer.to_string(), body);
    let (status, body) = send(market_router(&market), request).await;

    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["replacement"]["reason"], "Damaged on arrival");
    let image_url = body["replacement"]["image_url"].as_str().unwrap().to_string();
    assert!(market.objects.contains_url(EVIDENCE_BUCKET, &image_url));

    let uri = format!("/api/producer/order-items/{}/replacement/resolve", item_id);
    let producer = market.producer.to_string();
    let request = build_request("POST", &uri, Some(&producer), None).unwrap();
    let (status, body) = send(market_router(&market), request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["outcome"], "resolved");
    assert!(body["item"]["replacement"].is_null());

    let request = build_request("POST", &uri, Some(&producer), None).unwrap();
    let (status, body) = send(market_router(&market), request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["outcome"], "already_resolved");
}

#[tokio::test]
async fn test_submit_without_photo_is_bad_request() {
    let market = Market::new();
    let product = market.product("Okra", 10);
    let order = market.order(OrderStatus::Completed, &[(product.id, 1)]);

    let body = multipart_body(&[("reason", "Wrong item received")], None);
    let uri = format!("/api/consumer/order-items/{}/replacement", order.items[0].id);
    let request = multipart_request(&uri, &market.consumer.to_string(), body);
    let (status, body) = send(market_router(&market), request).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("photo"));
    assert!(market.objects.is_empty());
}

#[tokio::test]
async fn test_others_without_text_is_bad_request() {
    let market = Market::new();
    let product = market.product("Squash", 10);
    let order = market.order(OrderStatus::Completed, &[(product.id, 1)]);

    let image = Some(("image/png", "pngbytes"));
    let body = multipart_body(&[("reason", "Others"), ("other_text", "")], image);
    let uri = format!("/api/consumer/order-items/{}/replacement", order.items[0].id);
    let request = multipart_request(&uri, &market.consumer.to_string(), body);
    let (status, _) = send(market_router(&market), request).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(market.objects.is_empty());
}

#[tokio::test]
async fn test_unsupported_image_type_is_bad_request() {
    let market = Market::new();
    let product = market.product("Melon", 10);
    let order = market.order(OrderStatus::Completed, &[(product.id, 1)]);

    let body = multipart_body(&[("reason", "Damaged")], Some(("image/gif", "gifbytes")));
    let uri = format!("/api/consumer/order-items/{}/replacement", order.items[0].id);
    let request = multipart_request(&uri, &market.consumer.to_string(), body);
    let (status, _) = send(market_router(&market), request).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[test]
fn test_configured_upload_limit_is_capped() {
    let market = Market::new();
    let state = AppState::new(
        market.orders.clone(),
        market.replacements.clone(),
        market.reviews.clone(),
        market.storage.clone(),
        market.changes.clone(),
    );

    assert_eq!(state.clone().with_upload_limit(1024).upload_limit, 1024);
    assert_eq!(state.with_upload_limit(64 * 1024 * 1024).upload_limit, MAX_IMAGE_BYTES);
}
