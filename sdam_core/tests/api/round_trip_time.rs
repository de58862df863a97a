use std::{sync::Arc, time::Duration};

use sdam_core::{ClusterId, EndPoint, RoundTripTimeMonitor, ServerId, ServerType};
use tokio_test::assert_ok;

use crate::helpers::{
    create_monitor, polling_settings, standalone_hello, ConnectionScript, ScriptedConnectionFactory,
    Step,
};

/// Averages go through floating point, so allow a microsecond of slack.
fn assert_close(actual: Duration, expected: Duration) {
    let difference = if actual > expected {
        actual - expected
    } else {
        expected - actual
    };
    assert!(
        difference <= Duration::from_micros(1),
        "expected about {:?}, got {:?}",
        expected,
        actual
    );
}

#[tokio::test(start_paused = true)]
async fn a_failed_heartbeat_resets_the_round_trip_time() {
    // Arrange
    let test = create_monitor(
        vec![
            ConnectionScript::opens_after(Duration::from_millis(200), standalone_hello())
                .then(Step::NetworkError),
            ConnectionScript::opens_after(Duration::from_millis(10), standalone_hello()),
        ],
        polling_settings(),
    );

    // Act
    assert_ok!(test.monitor.start());
    let changes = test.wait_for_changes(3).await;

    // Assert
    assert_eq!(changes.len(), 3);
    assert_eq!(changes[0].new_description.average_round_trip_time(), Duration::from_millis(200));
    assert_eq!(changes[1].new_description.server_type(), ServerType::Unknown);
    // 0.2 * 10 + 0.8 * 200 would be 162ms if the old sample survived.
    assert_eq!(changes[2].new_description.average_round_trip_time(), Duration::from_millis(10));

    test.monitor.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn polling_heartbeats_feed_the_estimator() {
    // Arrange
    let test = create_monitor(
        vec![ConnectionScript::opens_after(Duration::from_millis(100), standalone_hello()).then(
            Step::Reply {
                document: standalone_hello(),
                more_to_come: false,
                delay: Duration::from_millis(50),
            },
        )],
        polling_settings(),
    );

    // Act
    assert_ok!(test.monitor.start());
    tokio::time::sleep(Duration::from_secs(11)).await;

    // Assert: 0.2 * 50 + 0.8 * 100
    assert_close(test.monitor.round_trip_time_monitor().average(), Duration::from_millis(90));
    assert_eq!(test.monitor.description().average_round_trip_time(), Duration::from_millis(90));
    // Equal for server selection, so only the handshake was published.
    assert_eq!(test.changes().len(), 1);

    test.monitor.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn round_trip_time_monitor_samples_on_its_own_connection() {
    // Arrange
    let server_id = ServerId::new(ClusterId::new(), EndPoint::dns("localhost", 27017));
    let factory = Arc::new(ScriptedConnectionFactory::new(vec![
        ConnectionScript::opens_after(Duration::from_millis(30), standalone_hello())
            .then(Step::Reply {
                document: standalone_hello(),
                more_to_come: false,
                delay: Duration::from_millis(80),
            })
            .then(Step::NetworkError),
        ConnectionScript::opens_after(Duration::from_millis(20), standalone_hello()),
    ]));
    let monitor = RoundTripTimeMonitor::new(
        factory.clone(),
        server_id.clone(),
        server_id.end_point.clone(),
        Duration::from_secs(10),
    );

    // Act / Assert: opening is the first sample
    monitor.start();
    monitor.start();
    assert!(monitor.is_started());
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(monitor.average(), Duration::from_millis(30));

    // the hello ten seconds later is the second
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_close(monitor.average(), Duration::from_millis(40));

    // a failure drops the connection; the next iteration reopens it
    tokio::time::sleep(Duration::from_secs(20)).await;
    let connections = factory.connections();
    assert_eq!(connections.len(), 2);
    assert!(connections[0].is_disposed());
    assert_close(monitor.average(), Duration::from_millis(36));

    monitor.reset();
    assert_eq!(monitor.average(), Duration::ZERO);

    monitor.shutdown().await;
    assert!(connections[1].is_disposed());
}
