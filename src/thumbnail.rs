//! Periodic thumbnail sweep: one bounded-concurrency round per
//! `interval` seconds, each stream's thumbnail drawn from whichever source
//! (local republisher or origin) is currently cheapest (spec.md §4.6).
//!
//! Grounded on `original_source/cetrio/base.py`'s `Thumbnail` class: same
//! run/clean flag pair, same "wait on a shared condition with a timeout,
//! woken early by shutdown" waiter shape for each job. Where the original
//! mutates `out_opt` in place across sizes (`out_opt += ' -ss ' + seek`,
//! which would accumulate across sweep rounds since `_thumb` is shared
//! class state), this builds the option string fresh per call.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dusa_collection_utils::core::logger::LogLevel;
use dusa_collection_utils::log;
use tokio::sync::{Notify, Semaphore};

use crate::config::ThumbnailConfig;
use crate::process_runner::{drain_to_eof, ProcessHandle, RunMode};
use crate::registry::StreamRegistry;

/// Parses the `"small:320,medium:640"` config string into `(name, size)`
/// pairs, in order.
fn parse_sizes(raw: &str) -> Vec<(String, String)> {
    raw.split(',')
        .filter_map(|entry| {
            let entry = entry.trim();
            if entry.is_empty() {
                return None;
            }
            let (name, size) = entry.split_once(':')?;
            Some((name.trim().to_string(), size.trim().to_string()))
        })
        .collect()
}

/// Builds the ffmpeg argv for one thumbnail job: one unscaled output plus
/// one scaled output per configured size, each to
/// `<dir>/<id>[-<size-name>].<format>`.
fn build_cmd(
    cfg: &ThumbnailConfig,
    filename_id: &str,
    source_url: &str,
    seek: Option<u32>,
) -> Vec<String> {
    let sizes = parse_sizes(&cfg.sizes);
    let out_opt = match seek {
        Some(s) => format!("{} -ss {}", cfg.output_opt, s),
        None => cfg.output_opt.clone(),
    };

    let mut argv = vec!["ffmpeg".to_string()];
    argv.extend(cfg.input_opt.split_whitespace().map(str::to_string));
    argv.push("-i".to_string());
    argv.push(source_url.to_string());

    // Unscaled output first, then one per named size.
    let mut outputs: Vec<(Option<String>, String)> = vec![(None, filename_id.to_string())];
    for (name, size) in &sizes {
        let resize = cfg.resize_opt.replace("{}", size);
        outputs.push((Some(resize), format!("{}-{}", filename_id, name)));
    }

    for (resize, stem) in outputs {
        argv.extend(out_opt.split_whitespace().map(str::to_string));
        if let Some(resize) = resize {
            argv.extend(resize.split_whitespace().map(str::to_string));
        }
        argv.push(format!("{}/{}.{}", cfg.dir, stem, cfg.format));
    }

    argv
}

/// Runs one stream's thumbnail job: picks a source, spawns ffmpeg, races a
/// watchdog against natural completion, returns the exit code (or a
/// sentinel when the round is shutting down before the job even starts).
struct ThumbnailJob {
    id: String,
    timeout: Duration,
}

impl ThumbnailJob {
    async fn run(
        &self,
        registry: &StreamRegistry,
        cfg: &ThumbnailConfig,
        shutdown: Arc<Notify>,
        running: Arc<AtomicBool>,
    ) -> i32 {
        if !running.load(Ordering::SeqCst) {
            return 0;
        }

        let provider = match registry.catalog().select(&self.id) {
            Some(p) => p,
            None => {
                log!(LogLevel::Warn, "{} thumb: no provider registered", self.id);
                return -1;
            }
        };

        let (source, filename_id, seek) = match registry.get(&self.id).await {
            Some(stream) if stream.is_alive().await => {
                (provider.local_url(&self.id), self.id.clone(), Some(1))
            }
            _ => {
                let origin_id = provider.origin_id(&self.id);
                (provider.origin_url(&self.id), origin_id, None)
            }
        };

        let argv = build_cmd(cfg, &filename_id, &source, seek);
        let handle = match ProcessHandle::spawn(&self.id, &argv, RunMode::Thumb, &cfg.dir).await {
            Ok(h) => Arc::new(h),
            Err(e) => {
                log!(LogLevel::Error, "{} thumb: failed to spawn: {}", self.id, e);
                return -1;
            }
        };

        let job_done = Arc::new(Notify::new());
        let watchdog = {
            let handle = handle.clone();
            let job_done = job_done.clone();
            let shutdown = shutdown.clone();
            let timeout = self.timeout;
            let id = self.id.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = shutdown.notified() => {}
                    _ = tokio::time::sleep(timeout) => {
                        log!(LogLevel::Warn, "{} thumb: timed out", id);
                    }
                    _ = job_done.notified() => return,
                }
                if matches!(handle.poll().await, Ok(None)) {
                    let _ = handle.kill().await;
                }
            })
        };

        if let Some(stdout) = handle.take_stdout().await {
            drain_to_eof(stdout).await;
        }
        let code = handle.wait().await.unwrap_or(-1);
        job_done.notify_waiters();
        let _ = watchdog.await;

        code
    }
}

/// Owns the catalog-wide sweep loop. `running`/`clean` mirror
/// `Thumbnail.run`/`Thumbnail.clean` in the original: `clean` is only true
/// between rounds, so `stop_download` can wait for an in-flight round to
/// finish before returning.
pub struct ThumbnailSweeper {
    config: ThumbnailConfig,
    running: Arc<AtomicBool>,
    clean: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
    clean_changed: Arc<Notify>,
}

impl ThumbnailSweeper {
    pub fn new(config: ThumbnailConfig) -> Self {
        Self {
            config,
            running: Arc::new(AtomicBool::new(false)),
            clean: Arc::new(AtomicBool::new(true)),
            shutdown: Arc::new(Notify::new()),
            clean_changed: Arc::new(Notify::new()),
        }
    }

    /// Spawns the sweep loop as a background task. Returns immediately.
    pub fn start_download(self: &Arc<Self>, registry: Arc<StreamRegistry>) {
        self.running.store(true, Ordering::SeqCst);
        let this = self.clone();
        tokio::spawn(async move { this.main_loop(registry).await });
    }

    /// Signals shutdown and waits for any in-flight round to finish
    /// cleanly, matching `Thumbnail.stop_download`'s "wait while not clean".
    pub async fn stop_download(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.shutdown.notify_waiters();
        while !self.clean.load(Ordering::SeqCst) {
            self.clean_changed.notified().await;
        }
    }

    async fn main_loop(&self, registry: Arc<StreamRegistry>) {
        let stream_list = registry.catalog().all_streams();

        if let Some(delay) = self.config.start_after {
            if delay > 0 {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(delay)) => {}
                    _ = self.shutdown.notified() => {}
                }
            }
        }

        loop {
            if !self.running.load(Ordering::SeqCst) {
                break;
            }
            self.clean.store(false, Ordering::SeqCst);

            let t0 = Instant::now();
            let results = self.run_round(registry.clone(), &stream_list).await;
            let elapsed = t0.elapsed();

            if self.running.load(Ordering::SeqCst) {
                let failed: Vec<&String> = stream_list
                    .iter()
                    .zip(results.iter())
                    .filter(|(_, code)| **code != 0)
                    .map(|(id, _)| id)
                    .collect();
                log!(
                    LogLevel::Info,
                    "thumbnails: {}/{} fetched",
                    stream_list.len() - failed.len(),
                    stream_list.len()
                );
                if !failed.is_empty() {
                    log!(LogLevel::Warn, "could not fetch: {}", failed
                        .iter()
                        .map(|s| s.as_str())
                        .collect::<Vec<_>>()
                        .join(", "));
                }
            }

            self.clean.store(true, Ordering::SeqCst);
            self.clean_changed.notify_waiters();

            let remaining = Duration::from_secs(self.config.interval).checked_sub(elapsed);
            match remaining {
                Some(remaining) if !remaining.is_zero() => {
                    tokio::select! {
                        _ = tokio::time::sleep(remaining) => {}
                        _ = self.shutdown.notified() => {}
                    }
                }
                _ => {
                    if self.running.load(Ordering::SeqCst) {
                        log!(
                            LogLevel::Warn,
                            "thumbnail round overran by {:?}",
                            elapsed.saturating_sub(Duration::from_secs(self.config.interval))
                        );
                    }
                }
            }
        }
    }

    /// Runs every stream's thumbnail job concurrently, bounded to `workers`
    /// children alive at once via a semaphore permit acquired inside each
    /// spawned task before it touches a process.
    async fn run_round(&self, registry: Arc<StreamRegistry>, stream_list: &[String]) -> Vec<i32> {
        let semaphore = Arc::new(Semaphore::new(self.config.workers.max(1)));
        let mut handles = Vec::with_capacity(stream_list.len());

        for id in stream_list {
            let semaphore = semaphore.clone();
            let registry = registry.clone();
            let job = ThumbnailJob {
                id: id.clone(),
                timeout: Duration::from_secs(self.config.timeout),
            };
            let cfg = self.config.clone();
            let shutdown = self.shutdown.clone();
            let running = self.running.clone();
            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore open");
                job.run(&registry, &cfg, shutdown, running).await
            }));
        }

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            results.push(handle.await.unwrap_or(-1));
        }
        results
    }
}
