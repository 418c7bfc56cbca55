mod test_utils;

use std::time::Duration;

use common::config::RelayConfig;
use fulfillment::{
    model::{ModelId, OrderStatus},
    object_store::ObjectStorage,
    replacement::{EVIDENCE_BUCKET, SubmitReplacement},
    storage::OrderStorage,
};
use test_utils::{Market, fast_relay_config, jpeg};

async fn market_with_pending_message() -> (Market, ModelId) {
    let market = Market::new();
    let product = market.product("Kangkong", 5);
    let order = market.order(OrderStatus::Completed, &[(product.id, 1)]);
    let item_id = order.items[0].id;
    market
        .replacements
        .submit(
            &market.consumer_actor(),
            item_id,
            SubmitReplacement {
                reason: "Wilted".to_string(),
                other_text: None,
                image: Some(jpeg(64)),
            },
        )
        .await
        .unwrap();
    (market, item_id)
}

#[test]
fn test_backoff_doubles_and_caps() {
    let market = Market::new();
    let relay = market.relay(RelayConfig {
        base_delay_ms: 500,
        max_delay_ms: 3_000,
        ..RelayConfig::default()
    });

    assert_eq!(relay.backoff(0), Duration::from_millis(500));
    assert_eq!(relay.backoff(1), Duration::from_millis(1_000));
    assert_eq!(relay.backoff(2), Duration::from_millis(2_000));
    assert_eq!(relay.backoff(3), Duration::from_millis(3_000));
    assert_eq!(relay.backoff(40), Duration::from_millis(3_000));
}

#[tokio::test]
async fn test_failed_delivery_is_retried() {
    let (market, _) = market_with_pending_message().await;
    let relay = market.relay(fast_relay_config());

    market.storage.set_fail_messages(true);
    let report = relay.run_once().await.unwrap();
    assert_eq!(report.retried, 1);
    let pending = market.storage.pending_outbox();
    assert_eq!(pending[0].attempts, 1);
    assert!(pending[0].last_error.is_some());

    market.storage.set_fail_messages(false);
    let report = relay.run_once().await.unwrap();
    assert_eq!(report.delivered, 1);
    assert!(market.storage.pending_outbox().is_empty());
    assert_eq!(market.storage.messages_between(market.consumer, market.producer).len(), 1);
}

#[tokio::test]
async fn test_event_is_parked_after_max_attempts() {
    let (market, _) = market_with_pending_message().await;
    let relay = market.relay(fast_relay_config());
    market.storage.set_fail_messages(true);

    let mut parked = 0;
    for _ in 0..3 {
        parked += relay.run_once().await.unwrap().parked;
    }

    assert_eq!(parked, 1);
    assert!(market.storage.pending_outbox().is_empty());
    let parked_events = market.storage.parked_outbox();
    assert_eq!(parked_events.len(), 1);
    assert_eq!(parked_events[0].attempts, 3);

    // Parked events stay put even once the store recovers
    market.storage.set_fail_messages(false);
    assert_eq!(relay.run_once().await.unwrap().handled(), 0);
    assert!(market.storage.messages_between(market.consumer, market.producer).is_empty());
}

#[tokio::test]
async fn test_events_wait_for_their_retry_time() {
    let (market, _) = market_with_pending_message().await;
    let relay = market.relay(fast_relay_config());
    market.storage.set_fail_messages(true);

    let slow = market.relay(RelayConfig {
        base_delay_ms: 60_000,
        max_delay_ms: 60_000,
        ..fast_relay_config()
    });
    assert_eq!(slow.run_once().await.unwrap().retried, 1);
    assert_eq!(relay.run_once().await.unwrap().handled(), 0);

    market.storage.expire_outbox_leases();
    market.storage.set_fail_messages(false);
    assert_eq!(relay.run_once().await.unwrap().delivered, 1);
}

#[tokio::test]
async fn test_deleting_a_missing_object_counts_as_delivered() {
    let (market, item_id) = market_with_pending_message().await;
    let relay = market.relay(fast_relay_config());
    relay.run_once().await.unwrap();

    // Evidence disappears before the producer resolves
    let item = market.storage.get_order_item(item_id).await.unwrap();
    let url = item.replacement.unwrap().image_url;
    let path = market.objects.object_path(EVIDENCE_BUCKET, &url).unwrap();
    assert!(market.objects.delete(EVIDENCE_BUCKET, &path).await.unwrap());

    market.replacements.resolve(&market.producer_actor(), item_id).await.unwrap();

    let report = relay.run_once().await.unwrap();
    assert_eq!(report.delivered, 2);
    assert!(market.storage.parked_outbox().is_empty());
}
