mod attempt_timer_actor;
mod attempt_timer_error;
mod attempt_timer_handle;

pub(crate) use attempt_timer_actor::{run_attempt_timer_actor, AttemptTimerActor};
pub use attempt_timer_error::AttemptTimerError;
pub use attempt_timer_handle::AttemptTimer;

#[derive(Debug)]
pub(crate) enum AttemptTimerMessage {
    /// Fire at the earliest allowed time instead of waiting out the interval.
    RequestEarly,
    /// Stop the timer without firing.
    Dispose,
}
