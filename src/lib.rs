//! Concurrent supervision engine for a dynamic video streaming daemon:
//! per-stream transcoder lifecycle, viewer-driven start/stop, upstream
//! stats reconciliation, and a periodic thumbnail sweep.

pub mod config;
pub mod http_viewer;
pub mod process_runner;
pub mod provider;
pub mod registry;
pub mod stats;
pub mod stream;
pub mod thumbnail;

pub use config::SupervisorConfig;
pub use provider::{Catalog, StreamProvider, UrlTemplateProvider};
pub use registry::StreamRegistry;
#[cfg(target_os = "linux")]
pub use stats::HttpStatsSource;
pub use stats::{StatsReconciler, StatsSource};
pub use stream::{Stream, StreamPhase};
pub use thumbnail::ThumbnailSweeper;
