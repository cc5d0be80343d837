//! Process-wide id -> [`Stream`] table plus the `accepting` gate used during
//! shutdown (spec.md §4.4), grounded on `original_source/cetrio/base.py`'s
//! `streams` dict and its `Stream.get(name, create=True)` lazy-creation
//! pattern.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dusa_collection_utils::core::logger::LogLevel;
use dusa_collection_utils::log;
use tokio::sync::Mutex;

use crate::provider::Catalog;
use crate::stream::Stream;

/// Owns every [`Stream`] the supervisor has ever created, lazily
/// instantiating one on first `start()` for an id the catalog recognizes.
pub struct StreamRegistry {
    catalog: Catalog,
    streams: Mutex<HashMap<String, Arc<Stream>>>,
    log_dir: String,
    run_timeout: Duration,
    reload_timeout: Duration,
    /// Flips to `false` during shutdown; new `start()` calls after that are
    /// refused rather than spinning up transcoders that will be immediately
    /// torn down (spec.md §4.4 "Bulk teardown").
    accepting: AtomicBool,
}

impl StreamRegistry {
    pub fn new(
        catalog: Catalog,
        log_dir: impl Into<String>,
        run_timeout: Duration,
        reload_timeout: Duration,
    ) -> Self {
        Self {
            catalog,
            streams: Mutex::new(HashMap::new()),
            log_dir: log_dir.into(),
            run_timeout,
            reload_timeout,
            accepting: AtomicBool::new(true),
        }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// Returns the existing `Stream` for `id`, or creates one from the
    /// catalog's provider if this is the first time it's been seen. `None`
    /// if no registered provider knows this id.
    pub async fn get_or_create(&self, id: &str) -> Option<Arc<Stream>> {
        let mut streams = self.streams.lock().await;
        if let Some(stream) = streams.get(id) {
            return Some(stream.clone());
        }
        let provider = self.catalog.select(id)?;
        let stream = Stream::new(
            id,
            provider,
            self.log_dir.clone(),
            self.run_timeout,
            self.reload_timeout,
        );
        streams.insert(id.to_owned(), stream.clone());
        Some(stream)
    }

    /// Looks up an already-created `Stream` without creating one.
    pub async fn get(&self, id: &str) -> Option<Arc<Stream>> {
        self.streams.lock().await.get(id).cloned()
    }

    /// Admits `k` non-HTTP viewers (or arms the HTTP debounce if
    /// `http_wait` is set). No-op if `accepting` is false or the id isn't
    /// known to any provider.
    pub async fn start(&self, id: &str, k: u32, http_wait: Option<Duration>) {
        if !self.accepting() {
            log!(LogLevel::Warn, "{} start refused: registry is shutting down", id);
            return;
        }
        match self.get_or_create(id).await {
            Some(stream) => stream.inc(k, http_wait).await,
            None => log!(LogLevel::Error, "{} start refused: no provider registered", id),
        }
    }

    /// Removes one non-HTTP viewer from a previously-started stream;
    /// tolerates an id with no live `Stream` (spurious disconnect).
    pub async fn stop(&self, id: &str) {
        if let Some(stream) = self.get(id).await {
            stream.dec(false).await;
        }
    }

    /// Stops accepting new viewers and hard-stops every known stream,
    /// waiting for each kill to be acknowledged (spec.md §4.4 "Bulk
    /// teardown" / shutdown property: afterwards every stream has no
    /// process and no standing intent to run).
    pub async fn terminate_all(&self) {
        self.accepting.store(false, Ordering::SeqCst);
        let streams: Vec<Arc<Stream>> = self.streams.lock().await.values().cloned().collect();
        log!(LogLevel::Info, "terminating {} stream(s)", streams.len());
        for stream in streams {
            stream.proc_stop(true).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::UrlTemplateProvider;

    fn registry() -> StreamRegistry {
        let mut catalog = Catalog::new();
        catalog.register(Arc::new(UrlTemplateProvider::new(
            vec!["camA".into()],
            "rtmp://origin/{id}",
            "rtmp://local/{id}",
            vec![],
        )));
        StreamRegistry::new(
            catalog,
            std::env::temp_dir().to_str().unwrap().to_owned(),
            Duration::from_millis(50),
            Duration::from_millis(50),
        )
    }

    #[tokio::test]
    async fn start_creates_stream_lazily() {
        let registry = registry();
        assert!(registry.get("camA").await.is_none());
        registry.start("camA", 1, None).await;
        assert!(registry.get("camA").await.is_some());
    }

    #[tokio::test]
    async fn start_on_unknown_id_is_a_no_op() {
        let registry = registry();
        registry.start("camZ", 1, None).await;
        assert!(registry.get("camZ").await.is_none());
    }

    #[tokio::test]
    async fn stop_on_never_started_id_is_a_no_op() {
        let registry = registry();
        registry.stop("camA").await;
    }

    #[tokio::test]
    async fn terminate_all_refuses_further_starts() {
        let registry = registry();
        registry.start("camA", 1, None).await;
        let before = registry.get("camA").await.unwrap().rtmp_count();
        registry.terminate_all().await;
        assert!(!registry.accepting());
        registry.start("camA", 2, None).await;
        let stream = registry.get("camA").await.unwrap();
        assert_eq!(stream.rtmp_count(), before);
    }
}
