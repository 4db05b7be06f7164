use rand::Rng;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("maximum retry attempts exceeded")]
pub struct MaxRetriesExceeded;

/// Doubling delay between retries, capped at `max_delay`
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    initial_delay: Duration,
    max_delay: Duration,
    max_retries: u32,
    current_attempt: u32,
    jitter: bool,
}

impl ExponentialBackoff {
    pub fn new(initial: Duration, max: Duration, retries: u32) -> Self {
        Self {
            initial_delay: initial,
            max_delay: max,
            max_retries: retries,
            current_attempt: 0,
            jitter: false,
        }
    }

    /// Add up to 25% random delay on top of each step
    pub fn with_jitter(mut self) -> Self {
        self.jitter = true;
        self
    }

    /// Delay the next `sleep` would wait, without jitter
    pub fn next_delay(&self) -> Option<Duration> {
        if self.current_attempt >= self.max_retries {
            return None;
        }
        let factor = 2u32.checked_pow(self.current_attempt).unwrap_or(u32::MAX);
        let delay = self
            .initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay);
        Some(delay.min(self.max_delay))
    }

    pub async fn sleep(&mut self) -> Result<Duration, MaxRetriesExceeded> {
        let mut delay = self.next_delay().ok_or(MaxRetriesExceeded)?;
        if self.jitter {
            let extra_ms = delay.as_millis() as u64 / 4;
            if extra_ms > 0 {
                delay += Duration::from_millis(rand::thread_rng().gen_range(0..=extra_ms));
            }
        }

        log::warn!(
            "⏳ Retry attempt {} of {} in {:.1}s",
            self.current_attempt + 1,
            self.max_retries,
            delay.as_secs_f64()
        );

        sleep(delay).await;
        self.current_attempt += 1;
        Ok(delay)
    }

    pub fn attempt(&self) -> u32 {
        self.current_attempt
    }

    pub fn reset(&mut self) {
        self.current_attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_sequence_doubles_then_caps() {
        let mut backoff = ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(16), 7);
        let mut delays = Vec::new();
        while let Some(delay) = backoff.next_delay() {
            delays.push(delay.as_secs());
            backoff.current_attempt += 1;
        }
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 16, 16]);
    }

    #[test]
    fn test_huge_attempt_counts_do_not_overflow() {
        let mut backoff = ExponentialBackoff::new(Duration::from_secs(2), Duration::from_secs(60), u32::MAX);
        backoff.current_attempt = 40;
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(60)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_exhausts_and_resets() {
        let mut backoff = ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(16), 2);
        let start = tokio::time::Instant::now();

        assert_eq!(backoff.sleep().await, Ok(Duration::from_secs(1)));
        assert_eq!(backoff.sleep().await, Ok(Duration::from_secs(2)));
        assert_eq!(backoff.sleep().await, Err(MaxRetriesExceeded));
        assert_eq!(start.elapsed(), Duration::from_secs(3));

        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_jitter_stays_within_quarter() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_secs(4), Duration::from_secs(60), 3).with_jitter();
        let delay = backoff.sleep().await.unwrap();
        assert!(delay >= Duration::from_secs(4));
        assert!(delay <= Duration::from_secs(5));
    }
}
