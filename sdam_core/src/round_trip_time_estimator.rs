use std::time::Duration;

/// Smoothing factor applied to each new sample.
pub const DEFAULT_ROUND_TRIP_TIME_ALPHA: f64 = 0.2;

/// Exponentially weighted moving average of round trip times.
///
/// The first sample after construction or [`reset`](Self::reset) becomes the
/// average as-is. Every later sample is blended in as
/// `alpha * sample + (1 - alpha) * average`.
#[derive(Clone, Debug)]
pub struct RoundTripTimeEstimator {
    alpha: f64,
    average: Option<Duration>,
}

impl Default for RoundTripTimeEstimator {
    fn default() -> Self {
        Self::new(DEFAULT_ROUND_TRIP_TIME_ALPHA)
    }
}

impl RoundTripTimeEstimator {
    /// Creates an estimator with the given smoothing factor, clamped to `(0, 1]`.
    pub fn new(alpha: f64) -> Self {
        let alpha = if alpha.is_finite() && alpha > 0.0 {
            alpha.min(1.0)
        } else {
            DEFAULT_ROUND_TRIP_TIME_ALPHA
        };
        Self {
            alpha,
            average: None,
        }
    }

    pub fn add_sample(&mut self, sample: Duration) {
        let next = match self.average {
            None => sample,
            Some(average) => Duration::from_secs_f64(
                self.alpha * sample.as_secs_f64() + (1.0 - self.alpha) * average.as_secs_f64(),
            ),
        };
        self.average = Some(next);
    }

    /// Current average, or zero when no sample has been taken.
    pub fn average(&self) -> Duration {
        self.average.unwrap_or_default()
    }

    pub fn is_initialized(&self) -> bool {
        self.average.is_some()
    }

    pub fn reset(&mut self) {
        self.average = None;
    }
}
