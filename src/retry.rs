use std::time::Duration;

use rand::Rng;

use crate::config::ConnectionRetryStrategy;

pub(crate) const EXPONENT_BASE: u32 = 2;
pub(crate) const FACTOR: u32 = 100;
pub(crate) const NUMBER_OF_RETRIES: u32 = 5;

const JITTER_LOW: f64 = 0.8;
const JITTER_HIGH: f64 = 1.2;

/// Bounded exponential backoff used when (re)establishing the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryStrategy {
    factor: u32,
    exponent_base: u32,
    number_of_retries: u32,
}

impl Default for RetryStrategy {
    fn default() -> Self {
        Self::new(None)
    }
}

impl RetryStrategy {
    pub fn new(data: Option<ConnectionRetryStrategy>) -> Self {
        match data {
            Some(strategy) => get_exponential_backoff(
                strategy.exponent_base,
                strategy.factor,
                strategy.number_of_retries,
            ),
            None => get_exponential_backoff(EXPONENT_BASE, FACTOR, NUMBER_OF_RETRIES),
        }
    }

    pub fn number_of_retries(&self) -> u32 {
        self.number_of_retries
    }

    /// Waits to apply between attempts, already jittered. One entry per retry.
    pub fn get_iterator(&self) -> impl Iterator<Item = Duration> {
        let factor = self.factor as u64;
        let base = self.exponent_base as u64;
        (1..=self.number_of_retries).map(move |attempt| {
            let millis = factor.saturating_mul(base.saturating_pow(attempt));
            jitter(Duration::from_millis(millis))
        })
    }
}

fn jitter(duration: Duration) -> Duration {
    duration.mul_f64(rand::thread_rng().gen_range(JITTER_LOW..JITTER_HIGH))
}

pub(crate) fn get_exponential_backoff(
    exponent_base: u32,
    factor: u32,
    number_of_retries: u32,
) -> RetryStrategy {
    let exponent_base = if exponent_base > 0 {
        exponent_base
    } else {
        EXPONENT_BASE
    };
    let factor = if factor > 0 { factor } else { FACTOR };

    RetryStrategy {
        factor,
        exponent_base,
        number_of_retries,
    }
}
