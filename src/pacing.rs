use std::time::Duration;
use tokio::time::sleep;

/// Shared pacing policy: how many units to process before sleeping, and for
/// how long. One instance is threaded through the store adapter, the order
/// engine and the classifier so all three respect the same remote rate limits.
#[derive(Debug, Clone, Copy)]
pub struct Pacer {
    chunk_size: usize,
    delay: Duration,
}

impl Pacer {
    pub fn new(chunk_size: usize, delay: Duration) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            delay,
        }
    }

    /// Same delay, different chunk boundary. Used when a call site overrides
    /// the batch size.
    pub fn with_chunk(&self, chunk_size: usize) -> Self {
        Self::new(chunk_size, self.delay)
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Unconditional pacing pause.
    pub async fn pause(&self) {
        if !self.delay.is_zero() {
            sleep(self.delay).await;
        }
    }

    /// Pause only when `processed` has just crossed a chunk boundary.
    pub async fn pause_after(&self, processed: usize) {
        if processed > 0 && processed % self.chunk_size == 0 {
            self.pause().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn pauses_on_chunk_boundary() {
        let pacer = Pacer::new(5, Duration::from_secs(1));
        let start = Instant::now();
        pacer.pause_after(5).await;
        assert_eq!(start.elapsed(), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn skips_mid_chunk() {
        let pacer = Pacer::new(5, Duration::from_secs(1));
        let start = Instant::now();
        pacer.pause_after(4).await;
        pacer.pause_after(0).await;
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn chunk_override_keeps_delay() {
        let pacer = Pacer::new(5, Duration::from_secs(2)).with_chunk(2);
        assert_eq!(pacer.chunk_size(), 2);
        let start = Instant::now();
        pacer.pause_after(2).await;
        assert_eq!(start.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test]
    async fn zero_delay_is_a_noop() {
        let pacer = Pacer::new(1, Duration::ZERO);
        pacer.pause().await;
        pacer.pause_after(1).await;
    }
}
