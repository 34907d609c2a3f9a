use crate::config::FetchConfig;
use crate::error::ErrorKind;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Duration;

/// Source of jitter samples in `[-1.0, 1.0]`.
pub trait JitterSource: Send {
    fn sample(&mut self) -> f64;
}

/// Jitter backed by a seeded or entropy-initialised `StdRng`.
pub struct RandomJitter(StdRng);

impl RandomJitter {
    pub fn from_entropy() -> Self {
        Self(StdRng::from_entropy())
    }

    pub fn seeded(seed: u64) -> Self {
        Self(StdRng::seed_from_u64(seed))
    }
}

impl JitterSource for RandomJitter {
    fn sample(&mut self) -> f64 {
        self.0.gen_range(-1.0..=1.0)
    }
}

/// Always returns the same sample. Useful for deterministic delays.
pub struct FixedJitter(pub f64);

impl JitterSource for FixedJitter {
    fn sample(&mut self) -> f64 {
        self.0.clamp(-1.0, 1.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Retry(Duration),
    Abandon,
}

pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    jitter: f64,
    source: Box<dyn JitterSource>,
}

impl RetryPolicy {
    pub fn new(config: &FetchConfig, source: Box<dyn JitterSource>) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: config.base_delay(),
            max_delay: config.max_delay(),
            jitter: config.jitter.clamp(0.0, 1.0),
            source,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// `attempts` is the number of attempts already made, including the one
    /// that just failed.
    pub fn decide(&mut self, kind: ErrorKind, attempts: u32) -> Decision {
        if !kind.is_retryable() || attempts >= self.max_attempts {
            return Decision::Abandon;
        }
        Decision::Retry(self.delay(attempts))
    }

    /// base * 2^(attempts - 1), scaled by `1 + jitter * sample`, capped.
    pub fn delay(&mut self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(30) as i32;
        let nominal = self.base_delay.as_nanos() as f64 * 2f64.powi(exponent);
        let factor = 1.0 + self.jitter * self.source.sample();
        let nanos = (nominal * factor)
            .max(0.0)
            .min(self.max_delay.as_nanos() as f64);
        Duration::from_nanos(nanos.round() as u64)
    }
}
