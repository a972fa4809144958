//! Connection supervision tests against the in-memory broker
//!
//! Covers startup (dial retry, QoS, queue declaration, fatal setup errors)
//! and the monitor's reconnect behavior when nothing is consuming.

mod test_helpers;

use mqlink::supervisor::{RecoveryHandoff, initialize};
use mqlink::testing::{MockBroker, MockQueueDeclarer};
use mqlink::{MqError, QosPolicy};
use std::time::Duration;
use test_helpers::{Fixture, TEST_DELAY, test_options, wait_until};
use tokio::time::{sleep, timeout};

#[tokio::test]
async fn test_initialize_applies_default_qos_and_declares_queues() {
    let fixture = Fixture::start(test_options(), &["orders", "events"]).await;

    assert_eq!(fixture.broker.applied_qos(), vec![QosPolicy::default()]);
    assert_eq!(
        fixture.handle.current_link().queue_names(),
        vec!["events", "orders"]
    );
    assert!(fixture.healthy(), "Broker should be reachable after startup");
    assert_eq!(fixture.health.history(), vec![true]);
}

#[tokio::test]
async fn test_initialize_applies_configured_qos() {
    let options = test_options().with_qos(QosPolicy::new(25, 0, true));
    let fixture = Fixture::start(options, &["orders"]).await;

    assert_eq!(
        fixture.broker.applied_qos(),
        vec![QosPolicy::new(25, 0, true)]
    );
    assert_eq!(fixture.handle.qos().prefetch_count, 25);
}

#[tokio::test]
async fn test_initialize_retries_dial_until_broker_answers() {
    let broker = MockBroker::new();
    broker.fail_next_dials(3);

    let handle = initialize(
        broker.clone(),
        test_options(),
        MockQueueDeclarer::new(&["orders"]),
        None,
    )
    .await
    .expect("Initialization should succeed once the broker answers");

    assert_eq!(broker.dial_attempts(), 4);
    assert_eq!(broker.connections_opened(), 1);
    assert!(handle.health_status());
}

#[tokio::test]
async fn test_initialize_can_be_abandoned_while_broker_is_down() {
    let broker = MockBroker::new();
    broker.fail_next_dials(u32::MAX);

    let result = timeout(
        Duration::from_millis(100),
        initialize(
            broker.clone(),
            test_options(),
            MockQueueDeclarer::new(&[]),
            None,
        ),
    )
    .await;

    assert!(result.is_err(), "Initialization should still be retrying");
    assert!(broker.dial_attempts() > 1);
    assert_eq!(broker.connections_opened(), 0);
}

#[tokio::test]
async fn test_qos_rejection_is_fatal() {
    let broker = MockBroker::new();
    broker.reject_qos(true);

    let result = initialize(
        broker.clone(),
        test_options(),
        MockQueueDeclarer::new(&["orders"]),
        None,
    )
    .await;

    assert!(matches!(result, Err(MqError::QosFailed(_))));
    assert_eq!(broker.dial_attempts(), 1, "QoS failures must not be retried");
}

#[tokio::test]
async fn test_session_failure_is_fatal() {
    let broker = MockBroker::new();
    broker.reject_sessions(true);

    let result = initialize(
        broker.clone(),
        test_options(),
        MockQueueDeclarer::new(&["orders"]),
        None,
    )
    .await;

    assert!(matches!(result, Err(MqError::SessionFailed(_))));
    assert_eq!(broker.dial_attempts(), 1);
}

#[tokio::test]
async fn test_declare_failure_is_fatal() {
    let broker = MockBroker::new();
    let declarer = MockQueueDeclarer::new(&["orders"]);
    declarer.fail(true);

    let result = initialize(broker.clone(), test_options(), declarer, None).await;

    assert!(matches!(result, Err(MqError::DeclareFailed(_))));
    assert_eq!(broker.dial_attempts(), 1);
}

#[tokio::test]
async fn test_reconnect_without_consumers_reports_healthy() {
    // Arrange
    let fixture = Fixture::start(test_options(), &["orders"]).await;
    let _monitor = fixture.handle.spawn_monitor();

    // Act
    fixture.broker.drop_connection("heartbeat timeout");

    // Assert: new link installed and health restored by the monitor itself
    wait_until("second connection", || fixture.broker.connections_opened() == 2).await;
    wait_until("health restored", || fixture.healthy()).await;

    let link = fixture.handle.current_link();
    assert_eq!(link.connection.id, 2);
    assert_eq!(link.session.connection_id, 2);
    assert_eq!(link.queue("orders").map(|q| q.connection_id), Some(2));
    assert_eq!(fixture.health.history(), vec![true, false, true]);
    assert_eq!(fixture.broker.applied_qos().len(), 2, "QoS applied on every session");
    assert_eq!(
        fixture.handle.recovery_signals_sent(),
        0,
        "Nothing consuming, so nothing to hand off"
    );
}

#[tokio::test]
async fn test_health_stays_false_while_broker_is_down() {
    let fixture = Fixture::start(test_options(), &["orders"]).await;
    let _monitor = fixture.handle.spawn_monitor();

    fixture.broker.fail_next_dials(u32::MAX);
    fixture.broker.drop_connection("broker restarting");
    wait_until("health cleared", || !fixture.healthy()).await;

    let attempts_before = fixture.broker.dial_attempts();
    sleep(TEST_DELAY * 10).await;
    assert!(!fixture.healthy());
    assert!(
        fixture.broker.dial_attempts() > attempts_before,
        "Monitor should keep retrying at the fixed delay"
    );

    fixture.broker.fail_next_dials(0);
    wait_until("health restored", || fixture.healthy()).await;
    assert_eq!(fixture.handle.current_link().connection.id, 2);
}

#[tokio::test]
async fn test_link_updates_observe_replacement() {
    let fixture = Fixture::start(test_options(), &["orders"]).await;
    let mut updates = fixture.handle.link_updates();
    let _monitor = fixture.handle.spawn_monitor();

    fixture.broker.drop_connection("network partition");

    timeout(Duration::from_secs(5), updates.changed())
        .await
        .expect("Link replacement should be published")
        .expect("Link sender should still be alive");
    assert_eq!(updates.borrow().connection.id, 2);
}

#[tokio::test]
async fn test_clean_close_stops_monitor() {
    let fixture = Fixture::start(test_options(), &["orders"]).await;
    let monitor = fixture.handle.spawn_monitor();

    fixture.broker.close_connection();

    timeout(Duration::from_secs(5), monitor)
        .await
        .expect("Monitor should stop after a clean close")
        .expect("Monitor task should not panic");
    assert_eq!(fixture.broker.connections_opened(), 1, "No reconnect after a clean close");
}

#[tokio::test]
async fn test_shutdown_interrupts_reconnect() {
    let fixture = Fixture::start(test_options(), &["orders"]).await;
    let monitor = fixture.handle.spawn_monitor();

    fixture.broker.fail_next_dials(u32::MAX);
    fixture.broker.drop_connection("broker gone");
    wait_until("health cleared", || !fixture.healthy()).await;

    fixture.handle.shutdown();
    assert!(fixture.handle.is_shutdown());

    timeout(Duration::from_secs(5), monitor)
        .await
        .expect("Monitor should stop on shutdown")
        .expect("Monitor task should not panic");
}

#[tokio::test]
async fn test_health_tracked_without_a_sink() {
    let broker = MockBroker::new();
    let handle = initialize(
        broker.clone(),
        test_options(),
        MockQueueDeclarer::new(&["orders"]),
        None,
    )
    .await
    .expect("Initialization should succeed");
    let _monitor = handle.spawn_monitor();

    broker.fail_next_dials(u32::MAX);
    broker.drop_connection("lost");
    wait_until("health cleared", || !handle.health_status()).await;

    broker.fail_next_dials(0);
    wait_until("health restored", || handle.health_status()).await;
}

#[tokio::test]
async fn test_always_handoff_waits_for_a_listener() {
    // Arrange: the Always policy hands off even with nothing consuming
    let options = test_options().with_handoff(RecoveryHandoff::Always);
    let fixture = Fixture::start(options, &["orders"]).await;
    let _monitor = fixture.handle.spawn_monitor();

    // Act
    fixture.broker.drop_connection("broker restarted");
    wait_until("second connection", || fixture.broker.connections_opened() == 2).await;

    // Assert: nobody rebuilds, so health stays down
    sleep(TEST_DELAY * 5).await;
    assert!(!fixture.healthy());

    // A listener picks up the pending handoff and rebuilds
    let _listener = fixture.listen().await;
    wait_until("rebuild after pending handoff", || {
        fixture.factory.generation() == 2
    })
    .await;
    wait_until("health restored", || fixture.healthy()).await;
    wait_until("handoff counted", || fixture.handle.recovery_signals_sent() == 1).await;
}
