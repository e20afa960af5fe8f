use std::time::Duration;

/// Bounded exponential backoff with symmetric jitter.
#[derive(Debug, Clone)]
pub struct Backoff {
    /// Delay after the first failure.
    pub base: Duration,
    /// Upper bound for any delay.
    pub max: Duration,
    pub multiplier: f64,
    /// Random jitter factor in [0, 1]; 0.1 means +/-10%.
    pub jitter: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self { base: Duration::from_millis(100), max: Duration::from_secs(30), multiplier: 2.0, jitter: 0.1 }
    }
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self { Self { base, max, ..Default::default() } }

    /// Same curve without jitter, for deterministic tests.
    pub fn exact(base: Duration, max: Duration) -> Self { Self { base, max, multiplier: 2.0, jitter: 0.0 } }

    /// Delay for the given zero-based attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let max = self.max.as_secs_f64();
        let raw = self.base.as_secs_f64() * self.multiplier.powi(attempt.min(64) as i32);
        let capped = if raw.is_finite() { raw.min(max) } else { max };
        let spread = capped * self.jitter.clamp(0.0, 1.0);
        let jittered = if spread > 0.0 { capped + (rand::random::<f64>() * 2.0 - 1.0) * spread } else { capped };
        Duration::from_secs_f64(jittered.clamp(0.0, max))
    }
}
