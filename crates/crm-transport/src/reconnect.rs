//! Delay schedule for WebSocket reconnect attempts.

use std::time::Duration;

use rand::Rng;

/// Exponential reconnect schedule of a [`WsConfig`](crate::websocket::WsConfig).
#[derive(Clone, Copy, Debug)]
pub(crate) struct BackoffConfig {
    pub(crate) initial_delay: Duration,
    pub(crate) max_delay: Duration,
    pub(crate) factor: f64,
    /// Share of the delay drawn at random, in `[0, 1]`.
    pub(crate) jitter: f64,
}

impl BackoffConfig {
    pub(crate) fn validate(&self) -> Result<(), String> {
        if self.initial_delay.is_zero() {
            return Err("reconnect_initial_delay must be non-zero".to_string());
        }
        if self.max_delay < self.initial_delay {
            return Err("reconnect_max_delay must not be below reconnect_initial_delay".to_string());
        }
        if !self.factor.is_finite() || self.factor < 1.0 {
            return Err("reconnect_backoff_factor must be at least 1.0".to_string());
        }
        if !self.jitter.is_finite() || !(0.0..=1.0).contains(&self.jitter) {
            return Err("reconnect_jitter must lie in [0.0, 1.0]".to_string());
        }
        Ok(())
    }

    /// Wait before the zero-based reconnect `attempt`.
    ///
    /// The nominal delay `initial * factor^attempt` is capped at `max_delay`.
    /// A `jitter` share of it is then replaced by a uniform draw from
    /// `[0, nominal]`, so the result never exceeds the nominal delay.
    pub(crate) fn delay_for(&self, attempt: u32) -> Duration {
        let nominal = (self.initial_delay.as_secs_f64() * self.factor.powf(f64::from(attempt)))
            .min(self.max_delay.as_secs_f64());
        if self.jitter == 0.0 || nominal == 0.0 {
            return Duration::from_secs_f64(nominal);
        }

        let drawn = rand::rng().random_range(0.0..=nominal);
        Duration::from_secs_f64(nominal - self.jitter * (nominal - drawn))
    }
}
