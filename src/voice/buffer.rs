//! Output audio buffering
//!
//! The model streams audio in small fragments; playing each one as it arrives
//! stutters. Fragments accumulate until either `min_flush_bytes` is reached or
//! no new fragment has arrived for `flush_delay`, then leave as one chunk.

use std::time::Duration;

use tokio::time::Instant;

/// One second of 24 kHz 16-bit mono audio
pub const DEFAULT_MIN_FLUSH_BYTES: usize = 48_000;

/// Quiescence delay before a below-threshold flush
pub const DEFAULT_FLUSH_DELAY: Duration = Duration::from_millis(100);

/// Pending accumulator for output audio fragments
///
/// The debounce timer is represented as a deadline; the owner sleeps until
/// [`OutputBuffer::deadline`] and then calls [`OutputBuffer::on_deadline`].
#[derive(Debug)]
pub struct OutputBuffer {
    min_flush_bytes: usize,
    flush_delay: Duration,
    pending: Vec<Vec<u8>>,
    debounce: Option<Instant>,
}

impl Default for OutputBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_FLUSH_BYTES, DEFAULT_FLUSH_DELAY)
    }
}

impl OutputBuffer {
    /// Create a buffer with explicit thresholds
    #[must_use]
    pub const fn new(min_flush_bytes: usize, flush_delay: Duration) -> Self {
        Self {
            min_flush_bytes,
            flush_delay,
            pending: Vec::new(),
            debounce: None,
        }
    }

    /// Accept one fragment
    ///
    /// Returns the combined chunk when the threshold is reached; otherwise
    /// re-arms the debounce deadline.
    pub fn push(&mut self, fragment: Vec<u8>) -> Option<Vec<u8>> {
        self.debounce = None;
        self.pending.push(fragment);

        if self.pending_len() >= self.min_flush_bytes {
            return self.flush();
        }

        self.debounce = Some(Instant::now() + self.flush_delay);
        None
    }

    /// Outstanding debounce deadline, if any
    #[must_use]
    pub const fn deadline(&self) -> Option<Instant> {
        self.debounce
    }

    /// Debounce deadline reached: flush whatever is pending
    pub fn on_deadline(&mut self) -> Option<Vec<u8>> {
        self.debounce = None;
        self.flush()
    }

    /// Flush unconditionally (turn complete). Empty buffers yield `None`.
    pub fn force_flush(&mut self) -> Option<Vec<u8>> {
        self.debounce = None;
        self.flush()
    }

    /// Drop everything pending and cancel the debounce deadline
    pub fn discard(&mut self) {
        let dropped = self.pending_len();
        self.pending.clear();
        self.debounce = None;
        if dropped > 0 {
            tracing::debug!(bytes = dropped, "discarded pending output audio");
        }
    }

    /// Total bytes pending, recomputed from the fragments
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.iter().map(Vec::len).sum()
    }

    /// Whether nothing is pending
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending_len() == 0
    }

    fn flush(&mut self) -> Option<Vec<u8>> {
        let len = self.pending_len();
        if len == 0 {
            self.pending.clear();
            return None;
        }

        let mut chunk = Vec::with_capacity(len);
        for fragment in self.pending.drain(..) {
            chunk.extend_from_slice(&fragment);
        }
        tracing::trace!(bytes = len, "flushed output audio");
        Some(chunk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flushes_once_when_threshold_reached() {
        let mut buffer = OutputBuffer::default();

        assert!(buffer.push(vec![1; 20_000]).is_none());
        assert!(buffer.push(vec![2; 20_000]).is_none());
        assert_eq!(buffer.pending_len(), 40_000);

        let chunk = buffer.push(vec![3; 20_000]).unwrap();
        assert_eq!(chunk.len(), 60_000);
        assert_eq!(chunk[0], 1);
        assert_eq!(chunk[20_000], 2);
        assert_eq!(chunk[59_999], 3);

        assert!(buffer.is_empty());
        assert!(buffer.deadline().is_none());
        assert!(buffer.force_flush().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn each_fragment_rearms_the_deadline() {
        let mut buffer = OutputBuffer::new(1_000, Duration::from_millis(100));

        buffer.push(vec![0; 10]);
        let first = buffer.deadline().unwrap();

        tokio::time::advance(Duration::from_millis(50)).await;
        buffer.push(vec![0; 10]);
        let second = buffer.deadline().unwrap();
        assert_eq!(second - first, Duration::from_millis(50));

        let chunk = buffer.on_deadline().unwrap();
        assert_eq!(chunk.len(), 20);
        assert!(buffer.deadline().is_none());
    }

    #[test]
    fn force_flush_on_empty_is_noop() {
        let mut buffer = OutputBuffer::default();
        assert!(buffer.force_flush().is_none());
        assert!(buffer.on_deadline().is_none());
    }

    #[test]
    fn discard_clears_pending_and_timer() {
        let mut buffer = OutputBuffer::default();
        buffer.push(vec![0; 100]);
        assert!(buffer.deadline().is_some());

        buffer.discard();
        assert!(buffer.is_empty());
        assert!(buffer.deadline().is_none());
    }

    #[test]
    fn threshold_flush_cancels_debounce() {
        let mut buffer = OutputBuffer::new(10, Duration::from_millis(100));
        buffer.push(vec![0; 5]);
        assert!(buffer.deadline().is_some());
        assert!(buffer.push(vec![0; 5]).is_some());
        assert!(buffer.deadline().is_none());
    }
}
