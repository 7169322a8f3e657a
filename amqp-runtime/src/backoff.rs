use std::time::Duration;

const MAX_BACKOFF_SECS: u64 = 30;

/// Capped exponential backoff: 1, 2, 4, 8, 16, 30, 30, ... seconds. A single
/// success resets the next sequence back to 1.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    next_secs: u64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self { next_secs: 1 }
    }
}

impl Backoff {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the delay to sleep for this failed attempt, then doubles
    /// (capped) for next time.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next_secs;
        self.next_secs = (self.next_secs * 2).min(MAX_BACKOFF_SECS);
        Duration::from_secs(delay)
    }

    pub fn reset(&mut self) {
        self.next_secs = 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_and_caps_at_30() {
        let mut b = Backoff::new();
        let got: Vec<u64> = (0..8).map(|_| b.next_delay().as_secs()).collect();
        assert_eq!(got, vec![1, 2, 4, 8, 16, 30, 30, 30]);
    }

    #[test]
    fn reset_restarts_sequence() {
        let mut b = Backoff::new();
        b.next_delay();
        b.next_delay();
        b.next_delay();
        b.reset();
        assert_eq!(b.next_delay().as_secs(), 1);
    }
}
