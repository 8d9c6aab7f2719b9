//! End-to-end request/response correlation over the in-process broker

mod common;

use common::{build_sender, respond_after, wait_until, RecordingListener, REPLY_QUEUE};
use std::sync::Arc;
use std::time::Duration;
use tradewire::{MemoryBroker, OutboundMessage, SenderSettings, TradewireError};

fn settings(response_timeout: Option<Duration>) -> SenderSettings {
    SenderSettings {
        response_timeout,
        ..Default::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn blocking_call_returns_early_response() {
    let broker = MemoryBroker::new();
    let sender = build_sender(&broker, settings(Some(Duration::from_secs(5))));
    sender.open().await.unwrap();
    respond_after(&broker, Duration::from_millis(500), b"accepted");

    let ticket = OutboundMessage::new("ignored", b"bet".to_vec())
        .with_correlation_id("c1")
        .with_business_id("ticket-1");

    let start = tokio::time::Instant::now();
    let reply = sender
        .call(ticket, Duration::from_millis(2000))
        .await
        .expect("response expected before the deadline");
    let elapsed = start.elapsed();

    // The call returns as soon as the response lands, not at the deadline.
    assert!(elapsed >= Duration::from_millis(450), "elapsed {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(1500), "elapsed {:?}", elapsed);
    assert_eq!(reply.payload, b"accepted");
    // The wire correlation id is the one assigned at send time.
    assert_eq!(reply.correlation_id, "c1");
    assert_eq!(reply.business_id, "ticket-1");

    sender.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn blocking_call_times_out_explicitly() {
    let broker = MemoryBroker::new();
    let sender = build_sender(&broker, settings(Some(Duration::from_secs(30))));
    sender.open().await.unwrap();

    let ticket = OutboundMessage::new("ignored", Vec::new()).with_business_id("ticket-1");
    let start = tokio::time::Instant::now();
    let err = sender
        .call(ticket, Duration::from_millis(300))
        .await
        .unwrap_err();
    let elapsed = start.elapsed();

    assert!(matches!(err, TradewireError::ResponseTimeout { .. }));
    assert!(elapsed >= Duration::from_millis(290), "elapsed {:?}", elapsed);

    // The business id is free again after the timeout.
    let ticket = OutboundMessage::new("ignored", Vec::new()).with_business_id("ticket-1");
    let err = sender
        .call(ticket, Duration::from_millis(200))
        .await
        .unwrap_err();
    assert!(matches!(err, TradewireError::ResponseTimeout { .. }));

    sender.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn async_send_times_out_through_listener_exactly_once() {
    let broker = MemoryBroker::new();
    let sender = build_sender(&broker, settings(Some(Duration::from_millis(1000))));
    let listener = Arc::new(RecordingListener::default());
    sender.set_response_listener(listener.clone());
    sender.open().await.unwrap();

    let ticket = OutboundMessage::new("ignored", Vec::new()).with_correlation_id("c2");
    sender.send(ticket).await.unwrap();

    // The watchdog fires between the timeout and the next maintenance tick.
    assert!(
        wait_until(Duration::from_millis(2500), || listener.timeout_count() == 1).await,
        "timeout listener never fired"
    );
    assert_eq!(listener.timeouts.lock().unwrap()[0], "c2");
    assert_eq!(listener.response_count(), 0);

    // No second notification on later ticks.
    tokio::time::sleep(Duration::from_millis(1200)).await;
    assert_eq!(listener.timeout_count(), 1);

    sender.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn async_send_delivers_response_to_listener() {
    let broker = MemoryBroker::new();
    let sender = build_sender(&broker, settings(Some(Duration::from_secs(5))));
    let listener = Arc::new(RecordingListener::default());
    sender.set_response_listener(listener.clone());
    sender.open().await.unwrap();
    respond_after(&broker, Duration::from_millis(50), b"ok");

    let ticket = OutboundMessage::new("ignored", b"bet".to_vec()).with_business_id("ticket-9");
    sender.send(ticket).await.unwrap();

    assert!(
        wait_until(Duration::from_secs(3), || listener.response_count() == 1).await,
        "listener never saw the response"
    );
    assert_eq!(listener.responses.lock().unwrap()[0].business_id, "ticket-9");
    assert_eq!(listener.timeout_count(), 0);

    sender.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn duplicate_response_is_suppressed() {
    let broker = MemoryBroker::new();
    let sender = build_sender(&broker, settings(Some(Duration::from_secs(5))));
    let listener = Arc::new(RecordingListener::default());
    sender.set_response_listener(listener.clone());
    sender.open().await.unwrap();

    let ticket = OutboundMessage::new("ignored", Vec::new()).with_business_id("ticket-3");
    sender.send(ticket).await.unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while broker.published().await.is_empty() {
        assert!(tokio::time::Instant::now() < deadline, "request never published");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let published = broker.published().await;
    let request = &published[0].message;

    // The backend answers twice; at-least-once delivery on the wire.
    broker.inject(REPLY_QUEUE, common::reply_to(request, b"ok")).await;
    broker.inject(REPLY_QUEUE, common::reply_to(request, b"ok")).await;

    assert!(
        wait_until(Duration::from_secs(2), || listener.response_count() >= 1).await
    );
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(listener.response_count(), 1, "duplicate was not suppressed");

    sender.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn publish_failure_notifies_exactly_once_and_suppresses_timeout() {
    let broker = MemoryBroker::new();
    broker
        .set_confirm_behavior(tradewire::ConfirmBehavior::NackFirst(u64::MAX))
        .await;
    let publisher_settings = tradewire::PublisherSettings {
        max_retry_count: 1,
        ..Default::default()
    };
    let sender = common::build_sender_with(
        &broker,
        settings(Some(Duration::from_millis(800))),
        publisher_settings,
    );
    let listener = Arc::new(RecordingListener::default());
    sender.set_response_listener(listener.clone());
    sender.open().await.unwrap();

    let ticket = OutboundMessage::new("ignored", Vec::new()).with_correlation_id("c4");
    sender.send(ticket).await.unwrap();

    assert!(
        wait_until(Duration::from_secs(3), || {
            listener.publish_failure_count() == 1
        })
        .await,
        "publish failure never reached the listener"
    );
    assert_eq!(listener.publish_failures.lock().unwrap()[0], "c4");

    // The failed publish must not later also fire a spurious timeout.
    tokio::time::sleep(Duration::from_millis(1800)).await;
    assert_eq!(listener.timeout_count(), 0);
    assert_eq!(listener.publish_failure_count(), 1);

    sender.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn close_drains_in_flight_requests() {
    let broker = MemoryBroker::new();
    let sender = Arc::new(build_sender(&broker, settings(Some(Duration::from_secs(5)))));
    sender.open().await.unwrap();
    respond_after(&broker, Duration::from_millis(300), b"late-ok");

    let caller = sender.clone();
    let call = tokio::spawn(async move {
        let ticket = OutboundMessage::new("ignored", Vec::new()).with_business_id("ticket-7");
        caller.call(ticket, Duration::from_secs(2)).await
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    sender.close().await;

    let reply = call.await.unwrap().expect("in-flight call survived close");
    assert_eq!(reply.payload, b"late-ok");
}
