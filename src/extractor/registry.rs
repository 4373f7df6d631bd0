//! Platform → extractor dispatch table.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tracing::debug;

use super::{Extractor, MediaFetcher, YtDlpExtractor};
use crate::platform::Platform;

/// Maps each platform tag to the extractor that serves it.
///
/// Lookup is a plain map access: there is no dynamic discovery. Registering
/// a second extractor for a platform replaces the first.
#[derive(Default)]
pub struct ExtractorRegistry {
    extractors: HashMap<Platform, Arc<dyn Extractor>>,
}

impl ExtractorRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `extractor` under the platform it reports.
    #[tracing::instrument(skip(self, extractor), fields(platform = %extractor.platform()))]
    pub fn register(&mut self, extractor: Arc<dyn Extractor>) {
        debug!(requires_auth = extractor.requires_auth(), "registering extractor");
        self.extractors.insert(extractor.platform(), extractor);
    }

    /// Returns the extractor for `platform`, if any.
    #[must_use]
    pub fn get(&self, platform: Platform) -> Option<Arc<dyn Extractor>> {
        self.extractors.get(&platform).cloned()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.extractors.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.extractors.is_empty()
    }
}

impl fmt::Debug for ExtractorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut platforms: Vec<_> = self.extractors.keys().collect();
        platforms.sort();
        f.debug_struct("ExtractorRegistry")
            .field("platforms", &platforms)
            .finish()
    }
}

/// Builds the production registry: one `yt-dlp` extractor per supported platform.
#[must_use]
pub fn build_default_registry(ytdlp_program: &str, fetcher: &MediaFetcher) -> ExtractorRegistry {
    let mut registry = ExtractorRegistry::new();
    for platform in Platform::ALL {
        registry.register(Arc::new(YtDlpExtractor::new(
            platform,
            ytdlp_program,
            fetcher.clone(),
        )));
    }
    registry
}
