//! Cooperative cancellation

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Shared cancel flag with an optional deadline.
///
/// Clones observe the same flag. Work polls `is_cancelled` at chunk
/// boundaries; nothing is interrupted mid-chunk.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token that also trips once `timeout` has elapsed from now
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            deadline: Instant::now().checked_add(timeout),
        }
    }

    /// Clone sharing this flag that also trips after `timeout`
    pub fn with_deadline_after(&self, timeout: Duration) -> Self {
        Self {
            flag: Arc::clone(&self.flag),
            deadline: Instant::now().checked_add(timeout),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst) || self.timed_out()
    }

    pub fn timed_out(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_the_flag() {
        let token = CancellationToken::new();
        let other = token.clone();
        assert!(!other.is_cancelled());
        token.cancel();
        assert!(other.is_cancelled());
    }

    #[test]
    fn deadline_clone_shares_the_flag() {
        let token = CancellationToken::new();
        let bounded = token.with_deadline_after(Duration::from_secs(3600));
        assert!(!bounded.is_cancelled());
        token.cancel();
        assert!(bounded.is_cancelled());
        assert!(!bounded.timed_out());
    }

    #[test]
    fn zero_timeout_trips_immediately() {
        let token = CancellationToken::with_timeout(Duration::ZERO);
        assert!(token.is_cancelled());
        assert!(token.timed_out());
    }
}
