use crate::{error_chain_fmt, ServerMonitorState};

#[derive(thiserror::Error)]
pub enum ServerMonitorError {
    #[error("{operation} is not allowed while the server monitor is {state:?}")]
    InvalidState {
        operation: &'static str,
        state: ServerMonitorState,
    },
    #[error("The server monitor has been disposed")]
    Disposed,
    #[error(transparent)]
    UnexpectedError(#[from] anyhow::Error),
}
impl std::fmt::Debug for ServerMonitorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        error_chain_fmt(self, f)
    }
}
