//! One-shot upstream-stats reconciliation against the nginx-rtmp-module
//! `/stat` endpoint (spec.md §4.5).
//!
//! Grounded on `original_source/cetrio/base.py`'s `Video.get_stats` /
//! `Video.initialize_from_stats`, which fetch `<addr><stat_url>` and decode
//! it with a generic nested-dict XML loader (`noxml.load`), then duck-type
//! `server.application` as either a single mapping or a sequence. Rust's
//! static XML deserialization (`quick-xml`, used the way the neolink-family
//! camera clients in the example pack parse ISAPI/ONVIF XML) sidesteps that
//! single-vs-sequence ambiguity entirely: `Vec<Application>` already holds
//! zero, one, or many entries regardless of how many `<application>`
//! elements nginx emits.

use dusa_collection_utils::core::errors::{ErrorArrayItem, Errors};
use dusa_collection_utils::core::logger::LogLevel;
use dusa_collection_utils::log;
use serde::Deserialize;

use crate::registry::StreamRegistry;

#[derive(Debug, Deserialize)]
struct StatDocument {
    server: ServerSection,
}

#[derive(Debug, Deserialize)]
struct ServerSection {
    #[serde(rename = "application", default)]
    applications: Vec<Application>,
}

#[derive(Debug, Deserialize)]
struct Application {
    name: String,
    live: Option<LiveSection>,
}

#[derive(Debug, Deserialize)]
struct LiveSection {
    #[serde(rename = "stream", default)]
    streams: Vec<StreamStat>,
}

#[derive(Debug, Deserialize)]
struct StreamStat {
    name: String,
    nclients: i64,
    /// Present (as an empty element) iff this client is the publisher, not
    /// a viewer; its value is never read, only its presence.
    #[serde(default)]
    publishing: Option<String>,
}

/// Anything that can hand back the raw `/stat` XML document. Kept as a
/// trait so reconciliation logic is testable without a live nginx-rtmp
/// instance.
#[async_trait::async_trait]
pub trait StatsSource: Send + Sync {
    async fn fetch(&self) -> Result<String, ErrorArrayItem>;
}

/// Fetches the document over HTTP, matching `urlopen(addr + stat_url)`.
/// `reqwest` is a Linux-only dependency in Cargo.toml (mirroring the
/// teacher's own scoping), so this implementation is gated the same way;
/// non-Linux unix builds still get the `StatsSource` trait and
/// `StatsReconciler`, just not this concrete fetcher.
#[cfg(target_os = "linux")]
pub struct HttpStatsSource {
    url: String,
}

#[cfg(target_os = "linux")]
impl HttpStatsSource {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[cfg(target_os = "linux")]
#[async_trait::async_trait]
impl StatsSource for HttpStatsSource {
    async fn fetch(&self) -> Result<String, ErrorArrayItem> {
        let response = reqwest::get(&self.url)
            .await
            .map_err(|e| ErrorArrayItem::new(Errors::InputOutput, format!("GET {}: {}", self.url, e)))?;
        response
            .text()
            .await
            .map_err(|e| ErrorArrayItem::new(Errors::InputOutput, format!("GET {}: {}", self.url, e)))
    }
}

/// One-shot reconciler: pulls current viewer counts from upstream and
/// seeds the registry with any stream that already has clients but no
/// local `Stream` yet (e.g. the supervisor restarted mid-broadcast).
pub struct StatsReconciler;

impl StatsReconciler {
    /// Runs exactly once. I/O failures are swallowed (best-effort,
    /// spec.md §4.7); a missing configured `app` is a structural failure
    /// and is raised to the caller.
    pub async fn reconcile(
        source: &dyn StatsSource,
        registry: &StreamRegistry,
        app: &str,
    ) -> Result<(), ErrorArrayItem> {
        let body = match source.fetch().await {
            Ok(body) => body,
            Err(e) => {
                log!(LogLevel::Warn, "stats reconciliation skipped: {}", e);
                return Ok(());
            }
        };

        let document: StatDocument = quick_xml::de::from_str(&body).map_err(|e| {
            ErrorArrayItem::new(Errors::GeneralError, format!("malformed /stat document: {}", e))
        })?;

        let application = document
            .server
            .applications
            .into_iter()
            .find(|a| a.name == app)
            .ok_or_else(|| {
                ErrorArrayItem::new(Errors::GeneralError, format!("no app named {:?}", app))
            })?;

        let Some(live) = application.live else {
            return Ok(());
        };

        for stream in live.streams {
            let mut clients = stream.nclients;
            if stream.publishing.is_some() {
                clients -= 1;
            }
            if clients > 0 {
                registry.start(&stream.name, clients as u32, None).await;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{Catalog, UrlTemplateProvider};
    use std::sync::Arc;
    use std::time::Duration;

    struct FixedSource(String);

    #[async_trait::async_trait]
    impl StatsSource for FixedSource {
        async fn fetch(&self) -> Result<String, ErrorArrayItem> {
            Ok(self.0.clone())
        }
    }

    struct FailingSource;

    #[async_trait::async_trait]
    impl StatsSource for FailingSource {
        async fn fetch(&self) -> Result<String, ErrorArrayItem> {
            Err(ErrorArrayItem::new(Errors::InputOutput, "connection refused".into()))
        }
    }

    fn registry() -> StreamRegistry {
        let mut catalog = Catalog::new();
        catalog.register(Arc::new(UrlTemplateProvider::new(
            vec!["camA".into(), "camB".into()],
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

    const DOC: &str = r#"
        <rtmp>
          <server>
            <application>
              <name>live</name>
              <live>
                <stream>
                  <name>camA</name>
                  <nclients>3</nclients>
                  <publishing/>
                </stream>
                <stream>
                  <name>camB</name>
                  <nclients>2</nclients>
                </stream>
              </live>
            </application>
          </server>
        </rtmp>
    "#;

    #[tokio::test]
    async fn subtracts_publisher_and_starts_remaining_viewers() {
        let registry = registry();
        let source = FixedSource(DOC.to_string());
        StatsReconciler::reconcile(&source, &registry, "live")
            .await
            .unwrap();
        // camA: 3 clients - 1 publisher = 2 viewers.
        assert_eq!(registry.get("camA").await.unwrap().rtmp_count(), 2);
        // camB: no publisher tag, 2 clients as-is.
        assert_eq!(registry.get("camB").await.unwrap().rtmp_count(), 2);
    }

    #[tokio::test]
    async fn missing_configured_app_is_a_fatal_error() {
        let registry = registry();
        let source = FixedSource(DOC.to_string());
        let err = StatsReconciler::reconcile(&source, &registry, "no-such-app")
            .await
            .unwrap_err();
        assert!(err.err_mesg.to_string().contains("no-such-app"));
    }

    #[tokio::test]
    async fn io_failure_is_swallowed() {
        let registry = registry();
        StatsReconciler::reconcile(&FailingSource, &registry, "live")
            .await
            .unwrap();
        assert!(registry.get("camA").await.is_none());
    }

    #[tokio::test]
    async fn app_with_no_live_section_is_a_no_op() {
        let registry = registry();
        let doc = r#"<rtmp><server><application><name>live</name></application></server></rtmp>"#;
        let source = FixedSource(doc.to_string());
        StatsReconciler::reconcile(&source, &registry, "live")
            .await
            .unwrap();
        assert!(registry.get("camA").await.is_none());
    }
}
