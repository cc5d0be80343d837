//! Stream-provider registry: a lookup from a stream id to its input/output
//! URL templates, id-translation helper, and transcoder argv builder.
//!
//! Spec.md §1 lists this as an external collaborator referenced only
//! through its interface; `StreamProvider` is that interface, `Catalog` is
//! the lookup (`streams.select_provider(id)` / `streams.providers` in
//! `original_source/cetrio/base.py`), and [`UrlTemplateProvider`] is one
//! concrete, minimal implementation so the crate is runnable without a real
//! provider plugin.

use std::collections::HashMap;
use std::sync::Arc;

/// Everything the supervision engine needs to know about a family of
/// streams: where to pull them from, where the local republisher exposes
/// them, how to translate a local id to the id the origin server uses, and
/// how to build the `fetch`-mode transcoder argv for one of them.
pub trait StreamProvider: Send + Sync {
    /// All stream ids this provider knows about (used to build the
    /// thumbnail sweep catalog, spec.md §4.6).
    fn streams(&self) -> Vec<String>;

    /// The URL the transcoder should read this stream's live media from
    /// when reaching out to the origin server.
    fn origin_url(&self, id: &str) -> String;

    /// The URL the local republishing endpoint exposes this stream at, once
    /// its transcoder is running.
    fn local_url(&self, id: &str) -> String;

    /// Translates a locally-known stream id into the id the origin server
    /// uses for it (identity by default).
    fn origin_id(&self, id: &str) -> String {
        id.to_owned()
    }

    /// Builds the argv for the `fetch`-mode transcoder invocation for this
    /// stream (pure function of id + this provider's option bag).
    fn fetch_argv(&self, id: &str) -> Vec<String>;
}

/// Process-wide mapping from stream id to the provider that owns it,
/// equivalent to `streams.select_provider` / `streams.providers` in
/// `original_source/cetrio/base.py`.
#[derive(Clone, Default)]
pub struct Catalog {
    providers: HashMap<String, Arc<dyn StreamProvider>>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `provider` as the owner of every id in `provider.streams()`.
    pub fn register(&mut self, provider: Arc<dyn StreamProvider>) {
        for id in provider.streams() {
            self.providers.insert(id, provider.clone());
        }
    }

    pub fn select(&self, id: &str) -> Option<Arc<dyn StreamProvider>> {
        self.providers.get(id).cloned()
    }

    /// The full sweep catalog: every stream id advertised by every
    /// registered provider, flattened (spec.md §4.6 "Catalog construction").
    pub fn all_streams(&self) -> Vec<String> {
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();
        for (id, _) in &self.providers {
            if seen.insert(id.clone()) {
                out.push(id.clone());
            }
        }
        out
    }
}

/// A provider whose input/output URLs are `"{id}"`-style templates and
/// whose fetch argv is a flat option list, matching how most real
/// transcoder wrappers (ffmpeg included) are actually invoked.
pub struct UrlTemplateProvider {
    stream_ids: Vec<String>,
    origin_template: String,
    local_template: String,
    fetch_options: Vec<String>,
}

impl UrlTemplateProvider {
    pub fn new(
        stream_ids: Vec<String>,
        origin_template: impl Into<String>,
        local_template: impl Into<String>,
        fetch_options: Vec<String>,
    ) -> Self {
        Self {
            stream_ids,
            origin_template: origin_template.into(),
            local_template: local_template.into(),
            fetch_options,
        }
    }

    fn fill(template: &str, id: &str) -> String {
        template.replace("{id}", id)
    }
}

impl StreamProvider for UrlTemplateProvider {
    fn streams(&self) -> Vec<String> {
        self.stream_ids.clone()
    }

    fn origin_url(&self, id: &str) -> String {
        Self::fill(&self.origin_template, id)
    }

    fn local_url(&self, id: &str) -> String {
        Self::fill(&self.local_template, id)
    }

    fn fetch_argv(&self, id: &str) -> Vec<String> {
        let mut argv = vec!["ffmpeg".to_string()];
        argv.extend(self.fetch_options.iter().cloned());
        argv.push("-i".to_string());
        argv.push(self.origin_url(id));
        argv
    }
}
