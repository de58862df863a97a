use tokio::{
    sync::{mpsc, watch},
    time::Instant,
};
use tracing::instrument;

use super::AttemptTimerMessage;

/// Owns the deadline of a single [`AttemptTimer`](super::AttemptTimer).
///
/// Only this task ever moves the deadline, so an early request racing the
/// natural expiry resolves to exactly one fire.
#[derive(Debug)]
pub(crate) struct AttemptTimerActor {
    receiver: mpsc::UnboundedReceiver<AttemptTimerMessage>,
    fired: watch::Sender<bool>,
    /// `None` for an infinite interval.
    deadline: Option<Instant>,
    earliest_fire_time: Option<Instant>,
}

impl AttemptTimerActor {
    pub(crate) fn new(
        receiver: mpsc::UnboundedReceiver<AttemptTimerMessage>,
        fired: watch::Sender<bool>,
        deadline: Option<Instant>,
        earliest_fire_time: Option<Instant>,
    ) -> Self {
        Self {
            receiver,
            fired,
            deadline,
            earliest_fire_time,
        }
    }

    /// Returns true when the request fired the timer.
    fn handle_request_early(&mut self) -> bool {
        match self.earliest_fire_time {
            Some(earliest) if Instant::now() >= earliest => {
                self.fire();
                true
            }
            Some(earliest) => {
                tracing::trace!("Early request arrived before the floor, rescheduling");
                self.deadline = Some(match self.deadline {
                    Some(deadline) => deadline.min(earliest),
                    None => earliest,
                });
                false
            }
            None => false,
        }
    }

    fn fire(&self) {
        // Nobody waiting is fine.
        let _ = self.fired.send(true);
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

#[instrument(level = "trace", name = "Running Attempt Timer Actor", skip(actor))]
pub(crate) async fn run_attempt_timer_actor(mut actor: AttemptTimerActor) {
    loop {
        tokio::select! {
            _ = sleep_until_deadline(actor.deadline) => {
                actor.fire();
                break;
            },
            opt_msg = actor.receiver.recv() => {
                match opt_msg {
                    Some(AttemptTimerMessage::RequestEarly) => {
                        if actor.handle_request_early() {
                            break;
                        }
                    }
                    Some(AttemptTimerMessage::Dispose) | None => break,
                }
            },
        }
    }
}
