mod server_monitor_actor;
mod server_monitor_error;
mod server_monitor_handle;
mod server_monitor_settings;

pub(crate) use server_monitor_actor::{run_server_monitor, ServerMonitorShared};
pub use server_monitor_error::*;
pub use server_monitor_handle::*;
pub use server_monitor_settings::*;

/// Lifecycle of a [`ServerMonitor`]. Transitions only move forward.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ServerMonitorState {
    Initial = 0,
    Open = 1,
    Disposed = 2,
}

impl ServerMonitorState {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            0 => ServerMonitorState::Initial,
            1 => ServerMonitorState::Open,
            _ => ServerMonitorState::Disposed,
        }
    }
}
