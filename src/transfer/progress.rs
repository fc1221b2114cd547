use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::watch;

/// Tracks bytes moved for one transfer and publishes a percentage
pub struct ProgressTracker {
    total_bytes: u64,
    done_bytes: AtomicU64,
    progress_sender: watch::Sender<f64>,
}

/// Progress with 99% cap until complete is called.
impl ProgressTracker {
    pub fn new(total_bytes: u64) -> Self {
        let (progress_sender, _) = watch::channel(0.0);
        Self {
            total_bytes,
            done_bytes: AtomicU64::new(0),
            progress_sender,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<f64> {
        self.progress_sender.subscribe()
    }

    /// Add `bytes` and publish. Returns (done, percent).
    pub fn advance(&self, bytes: u64) -> (u64, f64) {
        let done = self.done_bytes.fetch_add(bytes, Ordering::SeqCst) + bytes;
        let percent = self.update_progress(done);
        (done, percent)
    }

    pub fn done(&self) -> u64 {
        self.done_bytes.load(Ordering::SeqCst)
    }

    pub fn total(&self) -> u64 {
        self.total_bytes
    }

    /// Sets progress to 100%
    pub fn complete(&self) {
        self.progress_sender.send_replace(100.0);
    }

    fn update_progress(&self, done: u64) -> f64 {
        let raw_progress = if self.total_bytes > 0 {
            (done as f64 / self.total_bytes as f64) * 100.0
        } else {
            0.0
        };

        // Cap at 99% until explicit completion
        let capped = raw_progress.min(99.0);
        self.progress_sender.send_replace(capped);
        capped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_stays_below_100_until_complete() {
        let tracker = ProgressTracker::new(50_000);
        let rx = tracker.subscribe();

        tracker.advance(16_384);
        assert!((*rx.borrow() - 32.768).abs() < 1e-9);

        tracker.advance(16_384 * 2 + 848);
        assert_eq!(tracker.done(), 50_000);
        assert_eq!(*rx.borrow(), 99.0);

        tracker.complete();
        assert_eq!(*rx.borrow(), 100.0);
    }

    #[test]
    fn empty_transfer_reports_zero_until_complete() {
        let tracker = ProgressTracker::new(0);
        let (_, percent) = tracker.advance(0);
        assert_eq!(percent, 0.0);
    }
}
