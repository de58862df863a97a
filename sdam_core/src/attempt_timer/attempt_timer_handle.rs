use std::{
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::Instant,
};

use super::{run_attempt_timer_actor, AttemptTimerActor, AttemptTimerError, AttemptTimerMessage};

/**
A one-shot delay that can be asked to fire early.

The timer fires once `interval` has elapsed, or as soon as
[`request_early`](AttemptTimer::request_early) is called, but never before
`min_interval` has passed since construction. An early request made before
that floor moves the deadline to the floor instead of firing immediately.

The deadline lives in a small background task; this handle only sends it
messages and watches for the fire signal, so it is safe to call from any
thread at any time, including after the timer fired or was disposed.

`Duration::MAX` is treated as an infinite interval.

```rust
# tokio_test::block_on(async {
use std::time::Duration;
use sdam_core::AttemptTimer;

let timer = AttemptTimer::new(Duration::from_secs(10), Duration::ZERO);
timer.request_early();
timer.wait().await.unwrap();
# })
```
*/
#[derive(Debug)]
pub struct AttemptTimer {
    sender: mpsc::UnboundedSender<AttemptTimerMessage>,
    fired: watch::Receiver<bool>,
    early_requested: AtomicBool,
    earliest_fire_time: Option<Instant>,
    task: JoinHandle<()>,
}

impl AttemptTimer {
    pub fn new(interval: Duration, min_interval: Duration) -> Self {
        let min_interval = if interval != Duration::MAX && min_interval > interval {
            interval
        } else {
            min_interval
        };

        let now = Instant::now();
        let deadline = now.checked_add(interval);
        let earliest_fire_time = now.checked_add(min_interval);

        let (sender, receiver) = mpsc::unbounded_channel();
        let (fired_sender, fired) = watch::channel(false);
        let actor = AttemptTimerActor::new(receiver, fired_sender, deadline, earliest_fire_time);
        let task = tokio::spawn(run_attempt_timer_actor(actor));

        Self {
            sender,
            fired,
            early_requested: AtomicBool::new(false),
            earliest_fire_time,
            task,
        }
    }

    /// The instant before which an early request cannot fire the timer.
    pub fn earliest_fire_time(&self) -> Option<Instant> {
        self.earliest_fire_time
    }

    pub fn has_fired(&self) -> bool {
        *self.fired.borrow()
    }

    /// Asks the timer to fire as early as allowed. Only the first call has any effect.
    pub fn request_early(&self) {
        if self
            .early_requested
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        // The actor is gone once the timer fired or was disposed.
        let _ = self.sender.send(AttemptTimerMessage::RequestEarly);
    }

    /// Completes when the timer fires.
    ///
    /// Returns [`AttemptTimerError::Disposed`] if the timer was disposed first;
    /// callers treat that as a cancellation.
    pub async fn wait(&self) -> Result<(), AttemptTimerError> {
        let mut fired = self.fired.clone();
        fired
            .wait_for(|fired| *fired)
            .await
            .map(|_| ())
            .map_err(|_| AttemptTimerError::Disposed)
    }

    /// Stops the timer. Waiters that have not seen it fire get an error.
    pub fn dispose(&self) {
        let _ = self.sender.send(AttemptTimerMessage::Dispose);
    }
}

impl Drop for AttemptTimer {
    fn drop(&mut self) {
        self.task.abort();
    }
}
