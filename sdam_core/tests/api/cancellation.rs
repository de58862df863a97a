use std::{sync::Arc, time::Duration};

use sdam_core::{events::SdamEvent, ServerMonitorState, ServerType};
use serde_json::json;
use tokio_test::assert_ok;

use crate::helpers::{
    create_monitor, disposed_flags, polling_settings, standalone_hello, ConnectionScript, Step,
};

#[tokio::test(start_paused = true)]
async fn dispose_during_connect_stops_the_loop_without_publishing() {
    // Arrange
    let test = create_monitor(vec![ConnectionScript::pending()], polling_settings());
    assert_ok!(test.monitor.start());
    tokio::time::sleep(Duration::from_secs(1)).await;

    // Act
    let shutdown = tokio::time::timeout(Duration::from_secs(5), test.monitor.shutdown()).await;

    // Assert
    assert_ok!(shutdown);
    assert_eq!(test.monitor.state(), ServerMonitorState::Disposed);
    assert_eq!(disposed_flags(&test.factory.connections()), vec![true]);
    assert!(test.round_trip_time_factory.connections().iter().all(|c| c.is_disposed()));

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert!(test.changes().is_empty());
    assert_eq!(test.factory.connections().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn dispose_is_idempotent_and_safe_during_a_heartbeat() {
    // Arrange
    let test = create_monitor(
        vec![ConnectionScript::opens_with(standalone_hello())],
        polling_settings(),
    );
    assert_ok!(test.monitor.start());
    test.wait_for_changes(1).await;
    // At 10s the heartbeat blocks on a connection that never answers.
    tokio::time::sleep(Duration::from_secs(11)).await;

    // Act
    test.monitor.dispose();
    test.monitor.dispose();
    let shutdown = tokio::time::timeout(Duration::from_secs(5), test.monitor.shutdown()).await;

    // Assert
    assert_ok!(shutdown);
    assert_eq!(disposed_flags(&test.factory.connections()), vec![true]);
    assert_eq!(test.changes().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn cancel_current_check_discards_the_connection_and_keeps_monitoring() {
    // Arrange
    let test = create_monitor(
        vec![
            ConnectionScript::opens_with(standalone_hello()),
            ConnectionScript::opens_with(standalone_hello()),
        ],
        polling_settings(),
    );
    assert_ok!(test.monitor.start());
    test.wait_for_changes(1).await;
    // The 10s heartbeat is now in flight and will never complete on its own.
    tokio::time::sleep(Duration::from_secs(15)).await;

    // Act
    assert_ok!(test.monitor.cancel_current_check());
    tokio::time::sleep(Duration::from_secs(6)).await;

    // Assert
    let connections = test.factory.connections();
    assert_eq!(connections.len(), 2);
    assert_eq!(disposed_flags(&connections), vec![true, false]);
    // The cancelled heartbeat published nothing and the new connection
    // reported the same server.
    assert_eq!(test.heartbeats_failed(), 0);
    assert_eq!(test.changes().len(), 1);
    assert_eq!(test.monitor.description().server_type(), ServerType::Standalone);
    assert_eq!(test.monitor.state(), ServerMonitorState::Open);

    test.monitor.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn cancel_current_check_during_connect_opens_a_new_connection() {
    // Arrange
    let test = create_monitor(
        vec![
            ConnectionScript::pending(),
            ConnectionScript::opens_with(standalone_hello()),
        ],
        polling_settings(),
    );
    assert_ok!(test.monitor.start());
    tokio::time::sleep(Duration::from_secs(1)).await;

    // Act
    assert_ok!(test.monitor.cancel_current_check());
    let changes = test.wait_for_changes(1).await;

    // Assert
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].new_description.server_type(), ServerType::Standalone);
    assert_eq!(disposed_flags(&test.factory.connections()), vec![true, false]);

    test.monitor.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn a_reply_received_after_cancel_current_check_is_not_published() {
    // Arrange
    let router_hello = json!({ "ok": 1, "msg": "isdbgrid", "minWireVersion": 0, "maxWireVersion": 17 });
    let test = create_monitor(
        vec![
            ConnectionScript::opens_with(standalone_hello()).then(Step::reply(router_hello)),
            ConnectionScript::opens_with(standalone_hello()),
        ],
        polling_settings(),
    );
    // The check is cancelled right after the router reply arrived and
    // before the monitor turned it into a description.
    let monitor = Arc::downgrade(&test.monitor);
    test.on_event(Box::new(move |event| {
        if let SdamEvent::ServerHeartbeatSucceeded(succeeded) = event {
            if succeeded.reply.get("msg").is_some() {
                if let Some(monitor) = monitor.upgrade() {
                    monitor.cancel_current_check().unwrap();
                }
            }
        }
    }));

    // Act
    assert_ok!(test.monitor.start());
    tokio::time::sleep(Duration::from_secs(15)).await;

    // Assert
    assert_eq!(test.heartbeats_succeeded(), 2);
    let changes = test.changes();
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].new_description.server_type(), ServerType::Standalone);
    assert_eq!(test.monitor.description().server_type(), ServerType::Standalone);
    assert_eq!(disposed_flags(&test.factory.connections()), vec![true]);

    // The next cycle opens a fresh connection to the same server.
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(disposed_flags(&test.factory.connections()), vec![true, false]);
    assert_eq!(test.changes().len(), 1);

    test.monitor.shutdown().await;
}
