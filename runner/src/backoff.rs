use crate::{config::BackoffConfig, error::Result};
use rand::Rng;
use std::{fmt::Debug, sync::Arc, thread, time::Duration};
use tracing::{debug, warn};

/// Blocks the calling thread between two polling attempts
pub trait Sleeper: Send + Sync + Debug {
    fn sleep(&self, duration: Duration);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        thread::sleep(duration)
    }
}

/// Outcome of one polling attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attempt<T> {
    Ready(T),
    Pending,
}

/// Exponential backoff with jitter: the delay starts at `initial`, doubles after every
/// unsuccessful attempt up to `max`, and gets up to `jitter` times itself added at random.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    jitter: f64,
    sleeper: Arc<dyn Sleeper>,
}

/// Un-jittered delays of a `Backoff`, endless
#[derive(Debug, Clone)]
pub struct Delays {
    next: Duration,
    max: Duration,
}

impl Iterator for Delays {
    type Item = Duration;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next;
        self.next = (current * 2).min(self.max);

        Some(current)
    }
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration, jitter: f64, sleeper: Arc<dyn Sleeper>) -> Self {
        Self {
            initial,
            max,
            jitter: jitter.clamp(0.0, 1.0),
            sleeper,
        }
    }

    pub fn load(config: &BackoffConfig, sleeper: Arc<dyn Sleeper>) -> Self {
        Self::new(
            Duration::from_secs_f64(config.initial),
            Duration::from_secs_f64(config.max),
            config.jitter,
            sleeper,
        )
    }

    pub fn delays(&self) -> Delays {
        Delays {
            next: self.initial.min(self.max),
            max: self.max,
        }
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter == 0.0 {
            return delay;
        }

        delay + delay.mul_f64(rand::rng().random_range(0.0..=self.jitter))
    }

    /// Call `attempt` until it is ready, sleeping between calls. Transient failures
    /// count as not ready, any other failure is returned at once. No upper bound on
    /// the number of attempts.
    pub fn retry<T, F>(&self, what: &str, mut attempt: F) -> Result<T>
    where
        F: FnMut(u32) -> Result<Attempt<T>>,
    {
        let mut delays = self.delays();
        let mut counter = 1;

        loop {
            match attempt(counter) {
                Ok(Attempt::Ready(value)) => {
                    debug!(attempts = counter, "{what} is ready");

                    return Ok(value);
                }
                Ok(Attempt::Pending) => {
                    debug!(attempt = counter, "{what} is not ready yet");
                }
                Err(error) if error.is_transient() => {
                    warn!(attempt = counter, error = %error, "{what} failed, trying again");
                }
                Err(error) => return Err(error),
            }

            // delays never run out
            let delay = self.jittered(delays.next().unwrap_or(self.max));
            debug!("Waiting {:.1}s before the next attempt", delay.as_secs_f64());
            self.sleeper.sleep(delay);
            counter += 1;
        }
    }
}
