//! Single-slot debounced "viewer present" flag tied to a [`crate::stream::Stream`].
//!
//! Grounded on `original_source/cetrio/base.py`'s `HTTPClient`: a timer that
//! is reset (not re-armed) by repeated calls while already running, and
//! which decrements its parent exactly once when it finally expires. Rather
//! than reproduce the `__bool__`/`self.stopped` race spec.md §9 flags, this
//! models the explicit `idle` / `armed(deadline)` machine from spec.md §3.3
//! directly: a single background task owns the deadline and is only ever
//! told to reset it, never raced against.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use dusa_collection_utils::core::logger::LogLevel;
use dusa_collection_utils::log;

/// Anything an [`HttpViewer`] can decrement on expiry. Implemented by
/// [`crate::stream::Stream`]; kept as a trait so the viewer can be unit
/// tested without a full `Stream`.
#[async_trait::async_trait]
pub trait ViewerParent: Send + Sync {
    async fn dec_http(&self);
}

enum Command {
    Arm(Duration),
}

/// Debounced HTTP-viewer presence flag. `present()` is a plain atomic read;
/// `arm()` sends a message to the single background task that owns the
/// deadline, so concurrent `arm()` calls never race each other.
pub struct HttpViewer {
    present: Arc<std::sync::atomic::AtomicBool>,
    tx: mpsc::UnboundedSender<Command>,
    _worker: JoinHandle<()>,
}

impl HttpViewer {
    pub fn new<P>(parent: Arc<P>) -> Self
    where
        P: ViewerParent + 'static,
    {
        let present = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(Self::run(rx, present.clone(), parent));

        Self {
            present,
            tx,
            _worker: worker,
        }
    }

    /// If already armed, resets the deadline to `now + timeout` without
    /// re-arming (idempotent debounce). If idle, arms with that deadline.
    /// Returns immediately; the expiry itself happens on the background
    /// worker.
    pub fn arm(&self, timeout: Duration) {
        self.present
            .store(true, std::sync::atomic::Ordering::SeqCst);
        let _ = self.tx.send(Command::Arm(timeout));
    }

    pub fn present(&self) -> bool {
        self.present.load(std::sync::atomic::Ordering::SeqCst)
    }

    async fn run<P>(
        mut rx: mpsc::UnboundedReceiver<Command>,
        present: Arc<std::sync::atomic::AtomicBool>,
        parent: Arc<P>,
    ) where
        P: ViewerParent + 'static,
    {
        // Serializes deadline mutation: only this task ever writes `deadline`,
        // so a refreshing arm() can never be observed mid-expiry (spec.md §9).
        let deadline: Mutex<Option<Instant>> = Mutex::new(None);

        loop {
            let wait_for = {
                let guard = deadline.lock().await;
                match *guard {
                    Some(d) => d.saturating_duration_since(Instant::now()),
                    None => Duration::from_secs(3600 * 24 * 365),
                }
            };

            tokio::select! {
                cmd = rx.recv() => {
                    match cmd {
                        Some(Command::Arm(timeout)) => {
                            let mut guard = deadline.lock().await;
                            *guard = Some(Instant::now() + timeout);
                            log!(LogLevel::Trace, "http viewer armed/refreshed for {:?}", timeout);
                        }
                        None => return,
                    }
                }
                _ = tokio::time::sleep(wait_for), if deadline.lock().await.is_some() => {
                    let mut guard = deadline.lock().await;
                    if let Some(d) = *guard {
                        if Instant::now() >= d {
                            *guard = None;
                            drop(guard);
                            present.store(false, std::sync::atomic::Ordering::SeqCst);
                            log!(LogLevel::Trace, "http viewer expired");
                            parent.dec_http().await;
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingParent(AtomicU32);

    #[async_trait::async_trait]
    impl ViewerParent for CountingParent {
        async fn dec_http(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn arm_then_present_is_true() {
        let parent = Arc::new(CountingParent(AtomicU32::new(0)));
        let viewer = HttpViewer::new(parent);
        viewer.arm(Duration::from_secs(5));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(viewer.present());
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_decrements_parent_exactly_once() {
        let parent = Arc::new(CountingParent(AtomicU32::new(0)));
        let viewer = HttpViewer::new(parent.clone());
        viewer.arm(Duration::from_millis(50));
        tokio::time::advance(Duration::from_millis(100)).await;
        tokio::task::yield_now().await;
        assert!(!viewer.present());
        assert_eq!(parent.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn refreshing_arm_resets_deadline_without_early_expiry() {
        let parent = Arc::new(CountingParent(AtomicU32::new(0)));
        let viewer = HttpViewer::new(parent.clone());
        viewer.arm(Duration::from_millis(100));
        tokio::time::advance(Duration::from_millis(60)).await;
        tokio::task::yield_now().await;
        viewer.arm(Duration::from_millis(100));
        tokio::time::advance(Duration::from_millis(60)).await;
        tokio::task::yield_now().await;
        assert!(viewer.present());
        assert_eq!(parent.0.load(Ordering::SeqCst), 0);
    }
}
