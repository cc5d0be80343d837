//! The per-stream supervisor: viewer counter, owned transcoder process,
//! restart loop, delayed-shutdown loop (spec.md §4.3).
//!
//! `original_source/cetrio/base.py`'s `Stream` mutates `cnt`/`proc_run`
//! without a lock and spawns its worker thread *after* deciding to start it,
//! which spec.md §9 flags as racy (two `inc()` calls can both observe "no
//! process, no intent" and both spawn). This implementation tightens that
//! into a single critical section: the decision to start and the
//! bookkeeping that prevents a second start happen atomically under one
//! lock, and the process handle is never touched from two tasks at once —
//! it is exclusively owned by the supervised-loop task it was spawned on
//! (spec.md §5 "Subprocess handles are exclusively owned by their creating
//! worker"), with stop requests delivered to that task over a channel
//! rather than by reaching into its state from outside.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::{oneshot, Mutex};

use dusa_collection_utils::core::logger::LogLevel;
use dusa_collection_utils::log;

use crate::http_viewer::{HttpViewer, ViewerParent};
use crate::process_runner::{ProcessHandle, RunMode};
use crate::provider::StreamProvider;

/// The four observable states from spec.md §4.3, keyed by `(proc_run, proc
/// != nil)`. Exposed for tests and diagnostics; the engine itself reasons
/// in terms of `Inner`'s raw fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPhase {
    Idle,
    Running,
    Reloading,
    Draining,
}

/// A kill request handed to the supervised-loop task, carrying an ack
/// channel so a hard stop can block until the process is actually dead.
type KillAck = oneshot::Sender<()>;

struct Inner {
    proc_run: bool,
    /// `true` for the entire lifetime of the supervised-loop task (covers
    /// Running, Reloading and Draining); `false` only at Idle.
    active: bool,
    proc_handle: Option<Arc<ProcessHandle>>,
    kill_slot: Option<oneshot::Sender<KillAck>>,
}

impl Inner {
    fn phase(&self) -> StreamPhase {
        match (self.proc_run, self.proc_handle.is_some()) {
            (false, false) => StreamPhase::Idle,
            (true, true) => StreamPhase::Running,
            (true, false) => StreamPhase::Reloading,
            (false, true) => StreamPhase::Draining,
        }
    }
}

pub struct Stream {
    id: String,
    provider: Arc<dyn StreamProvider>,
    log_dir: String,
    run_timeout: Duration,
    reload_timeout: Duration,
    rtmp_count: AtomicU32,
    inner: Mutex<Inner>,
    http_viewer: HttpViewer,
}

/// Bridges `HttpViewer`'s expiry callback back to `Stream::dec` without
/// the viewer holding a strong reference to its own parent forever.
struct StreamHandleRef(Weak<Stream>);

#[async_trait::async_trait]
impl ViewerParent for StreamHandleRef {
    async fn dec_http(&self) {
        if let Some(stream) = self.0.upgrade() {
            stream.dec(true).await;
        }
    }
}

impl Stream {
    pub fn new(
        id: impl Into<String>,
        provider: Arc<dyn StreamProvider>,
        log_dir: impl Into<String>,
        run_timeout: Duration,
        reload_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Stream>| Stream {
            id: id.into(),
            provider,
            log_dir: log_dir.into(),
            run_timeout,
            reload_timeout,
            rtmp_count: AtomicU32::new(0),
            inner: Mutex::new(Inner {
                proc_run: false,
                active: false,
                proc_handle: None,
                kill_slot: None,
            }),
            http_viewer: HttpViewer::new(Arc::new(StreamHandleRef(weak.clone()))),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// `rtmp_count + (1 if an HTTP viewer is currently armed else 0)`.
    pub fn clients(&self) -> u32 {
        self.rtmp_count.load(Ordering::SeqCst) + self.http_viewer.present() as u32
    }

    pub fn rtmp_count(&self) -> u32 {
        self.rtmp_count.load(Ordering::SeqCst)
    }

    pub async fn phase(&self) -> StreamPhase {
        self.inner.lock().await.phase()
    }

    /// `self.proc or self.proc_run` in `original_source/cetrio/base.py`:
    /// true whenever the supervised loop currently owns this stream, i.e.
    /// any state but Idle. Used by the thumbnail sweeper to decide whether
    /// to draw from the local republisher or the origin server.
    pub async fn is_alive(&self) -> bool {
        self.inner.lock().await.active
    }

    /// Admits `k` non-HTTP viewers, or (if `http_wait` is set) arms/refreshes
    /// the HTTP-viewer debounce timer instead. Starts the transcoder if it
    /// isn't already running or about to be.
    pub async fn inc(self: &Arc<Self>, k: u32, http_wait: Option<Duration>) {
        match http_wait {
            Some(timeout) => self.http_viewer.arm(timeout),
            None => {
                self.rtmp_count.fetch_add(k, Ordering::SeqCst);
            }
        }

        let mut inner = self.inner.lock().await;
        if !inner.active && !inner.proc_run {
            // Mark started *before* releasing the lock: a second inc()
            // racing in right behind this one will see `active` already
            // true and never issue a second spawn (spec.md §8 round-trip
            // property: "two consecutive inc calls ... cause exactly one
            // spawn").
            inner.proc_run = true;
            inner.active = true;
            drop(inner);
            let this = self.clone();
            tokio::spawn(async move { this.supervised_loop().await });
        }
    }

    /// Removes one non-HTTP viewer (a no-op at zero, tolerating spurious
    /// disconnect events) and schedules a soft stop if no clients remain.
    pub async fn dec(self: &Arc<Self>, http: bool) {
        if !http {
            // Saturating decrement: never goes negative (spec.md §3 invariant).
            let _ = self
                .rtmp_count
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                    if n > 0 {
                        Some(n - 1)
                    } else {
                        None
                    }
                });
        }

        if self.clients() == 0 {
            self.proc_stop(false).await;
        }
    }

    /// `now=true`: kill immediately and block until reaped. `now=false`
    /// (soft): arm a grace-period deferrer that kills only if `clients` is
    /// still zero when it elapses, and is cancelled by a late `inc`.
    pub async fn proc_stop(self: &Arc<Self>, now: bool) {
        if now {
            let ack = {
                let mut inner = self.inner.lock().await;
                inner.proc_run = false;
                Self::request_kill(&mut inner)
            };
            if let Some(ack) = ack {
                let _ = ack.await;
            }
            return;
        }

        let mut inner = self.inner.lock().await;
        if !inner.active || !inner.proc_run {
            // Already idle or already draining/reloading-to-stop: no-op,
            // no second deferrer (spec.md §8 idempotence property).
            return;
        }
        inner.proc_run = false;
        drop(inner);

        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(this.run_timeout).await;
            if this.clients() == 0 {
                let ack = {
                    let mut inner = this.inner.lock().await;
                    Self::request_kill(&mut inner)
                };
                if let Some(ack) = ack {
                    let _ = ack.await;
                }
                log!(LogLevel::Trace, "{} fetch: grace elapsed, killing", this.id);
            } else {
                // Late-arriving viewer cancels the shutdown; the process is
                // never killed (spec.md §4.3 "Running -> Running").
                let mut inner = this.inner.lock().await;
                inner.proc_run = true;
                log!(LogLevel::Trace, "{} fetch: shutdown cancelled by new viewer", this.id);
            }
        });
    }

    /// Sends a kill request to the owning supervised-loop task, if one is
    /// currently waiting on a live process, and returns the ack channel to
    /// await. Returns `None` if there is nothing to kill right now (e.g.
    /// mid-reload-delay).
    fn request_kill(inner: &mut Inner) -> Option<oneshot::Receiver<()>> {
        let tx = inner.kill_slot.take()?;
        let (ack_tx, ack_rx) = oneshot::channel();
        let _ = tx.send(ack_tx);
        Some(ack_rx)
    }

    async fn supervised_loop(self: Arc<Self>) {
        let mut start_msg = "started";
        loop {
            let argv = self.provider.fetch_argv(&self.id);
            let spawned =
                ProcessHandle::spawn(&self.id, &argv, RunMode::Fetch, &self.log_dir).await;

            let handle = match spawned {
                Ok(h) => Arc::new(h),
                Err(e) => {
                    log!(LogLevel::Error, "{} fetch: failed to spawn: {}", self.id, e);
                    if self.wait_for_restart_or_stop().await {
                        start_msg = "restarted";
                        continue;
                    } else {
                        break;
                    }
                }
            };

            log!(LogLevel::Info, "{} fetch: {}", self.id, start_msg);

            let (req_tx, req_rx) = oneshot::channel::<KillAck>();
            {
                let mut inner = self.inner.lock().await;
                inner.proc_handle = Some(handle.clone());
                inner.kill_slot = Some(req_tx);
            }

            let was_killed = tokio::select! {
                _ = handle.wait() => false,
                ack = req_rx => {
                    let _ = handle.kill().await;
                    if let Ok(ack_tx) = ack { let _ = ack_tx.send(()); }
                    true
                }
            };

            {
                let mut inner = self.inner.lock().await;
                inner.proc_handle = None;
                inner.kill_slot = None;
            }

            if was_killed {
                log!(LogLevel::Trace, "{} fetch: stopped", self.id);
                let mut inner = self.inner.lock().await;
                inner.active = false;
                break;
            }

            // Exited on its own. If we still intend to run, this was an
            // unexpected death: restart after the reload delay. Check-and-
            // clear happen under the same guard so a concurrent `inc()`
            // can't observe `active` still true after we've already decided
            // to stop (and so silently skip spawning a replacement loop).
            {
                let mut inner = self.inner.lock().await;
                if !inner.proc_run {
                    inner.active = false;
                    log!(LogLevel::Trace, "{} fetch: stopped", self.id);
                    break;
                }
            }

            log!(LogLevel::Warn, "{} fetch: died", self.id);
            if self.wait_for_restart_or_stop().await {
                start_msg = "restarted";
                continue;
            } else {
                break;
            }
        }
    }

    /// Sleeps `reload_timeout`, then reports whether `proc_run` is still
    /// true (restart) or was cleared during the wait (stop), clearing
    /// `active` in the latter case.
    async fn wait_for_restart_or_stop(&self) -> bool {
        tokio::time::sleep(self.reload_timeout).await;
        let mut inner = self.inner.lock().await;
        if inner.proc_run {
            true
        } else {
            inner.active = false;
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::UrlTemplateProvider;

    fn provider(ok: bool) -> Arc<dyn StreamProvider> {
        let argv = if ok {
            vec!["true".to_string()]
        } else {
            vec![]
        };
        Arc::new(TestProvider { argv })
    }

    struct TestProvider {
        argv: Vec<String>,
    }

    impl StreamProvider for TestProvider {
        fn streams(&self) -> Vec<String> {
            vec!["camA".into()]
        }
        fn origin_url(&self, id: &str) -> String {
            format!("rtmp://origin/{}", id)
        }
        fn local_url(&self, id: &str) -> String {
            format!("rtmp://local/{}", id)
        }
        fn fetch_argv(&self, _id: &str) -> Vec<String> {
            self.argv.clone()
        }
    }

    fn new_stream(provider: Arc<dyn StreamProvider>, log_dir: &str) -> Arc<Stream> {
        Stream::new(
            "camA",
            provider,
            log_dir,
            Duration::from_millis(50),
            Duration::from_millis(50),
        )
    }

    #[tokio::test]
    async fn inc_then_dec_leaves_rtmp_count_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let stream = new_stream(provider(false), dir.path().to_str().unwrap());
        stream.inc(1, None).await;
        stream.dec(false).await;
        assert_eq!(stream.rtmp_count(), 0);
    }

    #[tokio::test]
    async fn rtmp_count_never_goes_negative() {
        let dir = tempfile::tempdir().unwrap();
        let stream = new_stream(provider(false), dir.path().to_str().unwrap());
        stream.dec(false).await;
        stream.dec(false).await;
        assert_eq!(stream.rtmp_count(), 0);
    }

    #[tokio::test]
    async fn cold_start_spawns_and_marks_running() {
        let dir = tempfile::tempdir().unwrap();
        let argv = vec!["sleep".to_string(), "5".to_string()];
        let provider: Arc<dyn StreamProvider> = Arc::new(TestProvider { argv });
        let stream = new_stream(provider, dir.path().to_str().unwrap());
        stream.inc(1, None).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(stream.phase().await, StreamPhase::Running);
        assert_eq!(stream.rtmp_count(), 1);
        stream.proc_stop(true).await;
    }

    #[tokio::test]
    async fn graceful_drain_kills_after_run_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let argv = vec!["sleep".to_string(), "30".to_string()];
        let provider: Arc<dyn StreamProvider> = Arc::new(TestProvider { argv });
        let stream = new_stream(provider, dir.path().to_str().unwrap());
        stream.inc(1, None).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        stream.dec(false).await;
        assert_eq!(stream.clients(), 0);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(stream.phase().await, StreamPhase::Idle);
    }

    #[tokio::test]
    async fn drain_cancelled_by_late_viewer() {
        let dir = tempfile::tempdir().unwrap();
        let argv = vec!["sleep".to_string(), "30".to_string()];
        let provider: Arc<dyn StreamProvider> = Arc::new(TestProvider { argv });
        let stream = new_stream(provider, dir.path().to_str().unwrap());
        stream.inc(1, None).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        stream.dec(false).await;
        stream.inc(1, None).await; // before the 50ms grace elapses
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(stream.phase().await, StreamPhase::Running);
        stream.proc_stop(true).await;
    }

    #[tokio::test]
    async fn hard_stop_clears_proc_run_and_proc() {
        let dir = tempfile::tempdir().unwrap();
        let argv = vec!["sleep".to_string(), "30".to_string()];
        let provider: Arc<dyn StreamProvider> = Arc::new(TestProvider { argv });
        let stream = new_stream(provider, dir.path().to_str().unwrap());
        stream.inc(1, None).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        stream.proc_stop(true).await;
        let inner = stream.inner.lock().await;
        assert!(!inner.proc_run);
        assert!(inner.proc_handle.is_none());
    }

    #[tokio::test]
    async fn two_concurrent_incs_spawn_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let argv = vec!["sleep".to_string(), "2".to_string()];
        let provider: Arc<dyn StreamProvider> = Arc::new(TestProvider { argv });
        let stream = new_stream(provider, dir.path().to_str().unwrap());
        let a = stream.clone();
        let b = stream.clone();
        tokio::join!(async { a.inc(1, None).await }, async { b.inc(1, None).await });
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(stream.rtmp_count(), 2);
        assert_eq!(stream.phase().await, StreamPhase::Running);
        stream.proc_stop(true).await;
    }
}
