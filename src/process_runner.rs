//! Thin wrapper around [`tokio::process::Command`] that gives every spawned
//! transcoder a log file and a handle supporting `wait`/`poll`/`kill`.
//!
//! Grounded on `process_manager.rs`'s `ChildLock`/`spawn_complex_process`:
//! same `LockWithTimeout<Child>` guard, same SIGTERM-then-SIGKILL escalation
//! on kill. Resource monitoring (CPU/RAM via `/proc`) is the teacher's, not
//! this spec's, and is dropped.

use dusa_collection_utils::core::errors::{ErrorArrayItem, Errors};
use dusa_collection_utils::core::logger::LogLevel;
use dusa_collection_utils::core::types::rwarc::LockWithTimeout;
use dusa_collection_utils::log;
use std::fs::File;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};

/// `fetch` (pulling from source, republishing) or `thumb` (thumbnail draw).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Fetch,
    Thumb,
}

impl RunMode {
    fn tag(self) -> &'static str {
        match self {
            RunMode::Fetch => "fetch",
            RunMode::Thumb => "thumb",
        }
    }
}

/// A running (or just-exited) transcoder process, plus the stream id and
/// mode it was spawned for, so kills/waits can be logged and errors
/// wrapped with useful context (spec.md §7's "Developer errors" policy).
pub struct ProcessHandle {
    id: String,
    mode: RunMode,
    child: LockWithTimeout<Child>,
}

impl ProcessHandle {
    /// Opens `<log_dir>/<mode>-<id>` in write/truncate mode (matching
    /// `original_source/cetrio/base.py`'s `open(log, 'w')`: each spawn gets a
    /// fresh log, not an appended one), spawns the child with stdout piped
    /// and stderr redirected to that file, and returns a handle.
    pub async fn spawn(
        id: &str,
        argv: &[String],
        mode: RunMode,
        log_dir: &str,
    ) -> Result<Self, ErrorArrayItem> {
        if argv.is_empty() {
            return Err(ErrorArrayItem::new(
                Errors::SupervisedChild,
                format!("{} [{}]: empty argv", id, mode.tag()),
            ));
        }

        let log_path: PathBuf = PathBuf::from(log_dir).join(format!("{}-{}", mode.tag(), id));
        let log_file = File::create(&log_path).map_err(|e| {
            ErrorArrayItem::new(
                Errors::InputOutput,
                format!(
                    "{} [{}]: failed to open log file {}: {}",
                    id,
                    mode.tag(),
                    log_path.display(),
                    e
                ),
            )
        })?;

        let mut command = Command::new(&argv[0]);
        command.args(&argv[1..]);
        command.stdout(Stdio::piped());
        command.stderr(Stdio::from(log_file));
        command.kill_on_drop(true);

        let child = command.spawn().map_err(|e| {
            ErrorArrayItem::new(
                Errors::SupervisedChild,
                format!("{} [{}]: failed to spawn: {}", id, mode.tag(), e),
            )
        })?;

        log!(
            LogLevel::Trace,
            "{} [{}]: spawned pid {:?}",
            id,
            mode.tag(),
            child.id()
        );

        Ok(Self {
            id: id.to_owned(),
            mode,
            child: LockWithTimeout::new(child),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn mode(&self) -> RunMode {
        self.mode
    }

    /// Blocks until the child exits, returning its exit code (or `-1` if it
    /// was killed by a signal, matching the shell convention the rest of the
    /// crate treats "success" / "non-zero" against).
    pub async fn wait(&self) -> Result<i32, ErrorArrayItem> {
        let mut guard = self.child.try_write().await.map_err(|e| {
            ErrorArrayItem::new(
                Errors::SupervisedChild,
                format!("{} [{}]: lock for wait: {}", self.id, self.mode.tag(), e),
            )
        })?;

        let status = guard.wait().await.map_err(|e| {
            ErrorArrayItem::new(
                Errors::SupervisedChild,
                format!("{} [{}]: wait failed: {}", self.id, self.mode.tag(), e),
            )
        })?;

        Ok(status.code().unwrap_or(-1))
    }

    /// Non-blocking check: `Some(code)` if already exited, `None` if still
    /// running.
    pub async fn poll(&self) -> Result<Option<i32>, ErrorArrayItem> {
        let mut guard = self.child.try_write().await.map_err(|e| {
            ErrorArrayItem::new(
                Errors::SupervisedChild,
                format!("{} [{}]: lock for poll: {}", self.id, self.mode.tag(), e),
            )
        })?;

        match guard.try_wait() {
            Ok(Some(status)) => Ok(Some(status.code().unwrap_or(-1))),
            Ok(None) => Ok(None),
            Err(e) => Err(ErrorArrayItem::new(
                Errors::SupervisedChild,
                format!("{} [{}]: poll failed: {}", self.id, self.mode.tag(), e),
            )),
        }
    }

    /// Takes the piped stdout, if it hasn't already been taken.
    pub async fn take_stdout(&self) -> Option<impl AsyncRead + Unpin> {
        let mut guard = self.child.try_write().await.ok()?;
        guard.stdout.take()
    }

    /// Sends SIGTERM, gives the process 400ms to exit gracefully, then sends
    /// SIGKILL if it is still around; reaps in both cases. Killing an
    /// already-dead process is swallowed (spec.md §4.7).
    pub async fn kill(&self) -> Result<(), ErrorArrayItem> {
        let mut guard = self.child.try_write().await.map_err(|e| {
            ErrorArrayItem::new(
                Errors::SupervisedChild,
                format!("{} [{}]: lock for kill: {}", self.id, self.mode.tag(), e),
            )
        })?;

        let pid = match guard.id() {
            Some(pid) => pid as i32,
            None => {
                log!(
                    LogLevel::Trace,
                    "{} [{}]: kill requested but process already reaped",
                    self.id,
                    self.mode.tag()
                );
                return Ok(());
            }
        };

        send_signal(pid, libc::SIGTERM);
        tokio::time::sleep(Duration::from_millis(400)).await;

        if is_pid_active(pid) {
            log!(
                LogLevel::Warn,
                "{} [{}]: pid {} survived SIGTERM, sending SIGKILL",
                self.id,
                self.mode.tag(),
                pid
            );
            send_signal(pid, libc::SIGKILL);
        }

        match guard.wait().await {
            Ok(status) => log!(
                LogLevel::Trace,
                "{} [{}]: reaped pid {} ({})",
                self.id,
                self.mode.tag(),
                pid,
                status
            ),
            Err(e) => log!(
                LogLevel::Trace,
                "{} [{}]: reap of pid {} failed (already gone): {}",
                self.id,
                self.mode.tag(),
                pid,
                e
            ),
        }

        Ok(())
    }
}

fn send_signal(pid: i32, signal: i32) {
    let res = unsafe { libc::kill(pid, signal) };
    if res != 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            log!(LogLevel::Warn, "failed to signal pid {}: {}", pid, err);
        }
    }
}

/// Checks if a PID is active on the system by sending signal 0 (a
/// non-destructive existence check), per `process_manager.rs::is_pid_active`.
pub fn is_pid_active(pid: i32) -> bool {
    let ret = unsafe { libc::kill(pid, 0) };
    ret == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Drains a stdout handle line-by-line, discarding content; used by
/// `ThumbnailJob` to know when a transcoder has fully finished writing
/// (mirrors `Popen.communicate()` in `original_source/cetrio/base.py`).
pub async fn drain_to_eof<R>(mut reader: R)
where
    R: Unpin + AsyncRead,
{
    let mut buf = [0u8; 4096];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(_) => continue,
            Err(_) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn spawn_rejects_empty_argv() {
        let dir = tempfile::tempdir().unwrap();
        let err = ProcessHandle::spawn("camA", &[], RunMode::Fetch, dir.path().to_str().unwrap())
            .await
            .unwrap_err();
        assert!(err.err_mesg.to_string().contains("empty argv"));
    }

    #[tokio::test]
    async fn spawn_true_exits_zero_and_logs_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let argv = vec!["true".to_string()];
        let handle = ProcessHandle::spawn("camA", &argv, RunMode::Fetch, dir.path().to_str().unwrap())
            .await
            .unwrap();
        let code = handle.wait().await.unwrap();
        assert_eq!(code, 0);
        assert!(dir.path().join("fetch-camA").exists());
    }

    #[tokio::test]
    async fn kill_on_already_exited_process_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let argv = vec!["true".to_string()];
        let handle = ProcessHandle::spawn("camA", &argv, RunMode::Fetch, dir.path().to_str().unwrap())
            .await
            .unwrap();
        let _ = handle.wait().await.unwrap();
        assert!(handle.kill().await.is_ok());
    }

    #[tokio::test]
    async fn kill_terminates_a_long_running_process() {
        let dir = tempfile::tempdir().unwrap();
        let argv = vec!["sleep".to_string(), "30".to_string()];
        let handle = ProcessHandle::spawn("camA", &argv, RunMode::Fetch, dir.path().to_str().unwrap())
            .await
            .unwrap();
        assert_eq!(handle.poll().await.unwrap(), None);
        handle.kill().await.unwrap();
    }
}
