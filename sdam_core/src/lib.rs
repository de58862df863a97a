/*!
sdam_core is the server discovery and monitoring core of a document database
driver. It tracks the liveness, role and capabilities of a single server
endpoint over time and publishes every meaningful change as an immutable
[`ServerDescription`].

This library requires tokio. A [`ServerMonitor`] owns two background tasks:
the heartbeat loop, which keeps a dedicated monitoring connection open and
turns hello replies (or failures) into descriptions, and a
[`RoundTripTimeMonitor`], which samples latency over its own connection.
The wire protocol is not part of this crate; it is consumed through the
[`Connection`] and [`ConnectionFactory`] traits.

# Example
```no_run
# use std::sync::Arc;
# use sdam_core::{ConnectionFactory, ServerMonitor, ServerMonitorSettings, ServerId, ClusterId};
# async fn run(factory: Arc<dyn ConnectionFactory>) -> anyhow::Result<()> {
let server_id = ServerId::new(ClusterId::new(), "localhost:27017".parse()?);
let settings = ServerMonitorSettings::builder().build()?;

let monitor = ServerMonitor::new(server_id, factory, settings);
monitor.subscribe(|event| {
    println!("{:?} -> {:?}", event.old_description.server_type(), event.new_description.server_type());
    Ok(())
});
monitor.start()?;

//...route operations using monitor.description()...

monitor.shutdown().await;
# Ok(())
# }
```

Dropping the monitor disposes it, cancelling any in-flight heartbeat.
*/

mod attempt_timer;
mod cadence;
mod connection;
mod hello;
mod round_trip_time_estimator;
mod round_trip_time_monitor;
mod server_description;
mod server_id;
mod server_monitor;
mod topology_version;

pub mod events;

pub use attempt_timer::*;
pub use cadence::*;
pub use connection::*;
pub use hello::*;
pub use round_trip_time_estimator::*;
pub use round_trip_time_monitor::*;
pub use server_description::*;
pub use server_id::*;
pub use server_monitor::*;
pub use topology_version::*;

/// Writes an error followed by every error in its `source()` chain.
pub fn error_chain_fmt(
    e: &impl std::error::Error,
    f: &mut std::fmt::Formatter<'_>,
) -> std::fmt::Result {
    writeln!(f, "{}\n", e)?;
    let mut current = e.source();
    while let Some(cause) = current {
        writeln!(f, "Caused by:\n\t{}", cause)?;
        current = cause.source();
    }
    Ok(())
}
