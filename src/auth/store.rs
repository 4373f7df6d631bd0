//! Per-platform cookie bundles with atomic replacement.
//!
//! Bundles live on disk as `{platform}_cookies.txt` inside the cookie
//! directory. Installation validates the text first, writes a temporary
//! sibling file, then renames it over the old one, so a reader never sees
//! a half-written file. In memory every bundle is an `Arc` snapshot: a
//! replacement swaps the pointer and in-flight extractions keep the
//! version they started with.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use dashmap::DashMap;
use reqwest::cookie::Jar;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use super::cookies::{CookieError, CookieLine, load_cookies_into_jar, parse_cookie_jar};
use crate::clock::SharedClock;
use crate::platform::Platform;

/// Errors from installing or loading cookie bundles.
#[derive(Debug, Error)]
pub enum CookieStoreError {
    /// Bundle text does not follow the cookie-jar grammar.
    #[error("invalid cookie bundle for {platform}: {source}")]
    Invalid {
        platform: Platform,
        #[source]
        source: CookieError,
    },

    /// Reading or writing a bundle file failed.
    #[error("cookie file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl CookieStoreError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// One installed, validated authentication bundle.
pub struct CookieBundle {
    pub platform: Platform,
    /// Epoch milliseconds.
    pub installed_at: i64,
    /// Monotonic per-store install counter.
    pub version: u64,
    raw_content: String,
    cookies: Vec<CookieLine>,
    jar: Arc<Jar>,
    source_mtime: Option<SystemTime>,
}

impl CookieBundle {
    /// Validates `raw_content` and builds a bundle.
    ///
    /// # Errors
    ///
    /// Returns [`CookieStoreError::Invalid`] when the grammar check fails.
    pub fn parse(
        platform: Platform,
        raw_content: String,
        installed_at: i64,
        version: u64,
    ) -> Result<Self, CookieStoreError> {
        let cookies = parse_cookie_jar(&raw_content)
            .map_err(|source| CookieStoreError::Invalid { platform, source })?;
        let jar = load_cookies_into_jar(&cookies);
        Ok(Self {
            platform,
            installed_at,
            version,
            raw_content,
            cookies,
            jar,
            source_mtime: None,
        })
    }

    /// Original cookie-jar text. Sensitive: never log it.
    #[must_use]
    pub fn raw_content(&self) -> &str {
        &self.raw_content
    }

    #[must_use]
    pub fn cookies(&self) -> &[CookieLine] {
        &self.cookies
    }

    /// Jar pre-loaded with this bundle's cookies.
    #[must_use]
    pub fn jar(&self) -> Arc<Jar> {
        Arc::clone(&self.jar)
    }

    #[must_use]
    pub fn info(&self) -> CookieBundleInfo {
        CookieBundleInfo {
            platform: self.platform,
            installed_at: self.installed_at,
            version: self.version,
            cookie_count: self.cookies.len(),
        }
    }
}

impl fmt::Debug for CookieBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CookieBundle")
            .field("platform", &self.platform)
            .field("installed_at", &self.installed_at)
            .field("version", &self.version)
            .field("cookie_count", &self.cookies.len())
            .field("raw_content", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}

/// Secret-free summary for listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CookieBundleInfo {
    pub platform: Platform,
    pub installed_at: i64,
    pub version: u64,
    pub cookie_count: usize,
}

/// File name for a platform's bundle inside the cookie directory.
#[must_use]
pub fn bundle_file_name(platform: Platform) -> String {
    format!("{platform}_cookies.txt")
}

/// Shared store of the active bundle per platform.
#[derive(Debug)]
pub struct CookieStore {
    dir: PathBuf,
    bundles: DashMap<Platform, Arc<CookieBundle>>,
    next_version: AtomicU64,
    clock: SharedClock,
}

impl CookieStore {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>, clock: SharedClock) -> Self {
        Self {
            dir: dir.into(),
            bundles: DashMap::new(),
            next_version: AtomicU64::new(1),
            clock,
        }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Returns the active bundle snapshot for `platform`.
    #[must_use]
    pub fn get(&self, platform: Platform) -> Option<Arc<CookieBundle>> {
        self.bundles.get(&platform).map(|entry| Arc::clone(&entry))
    }

    /// Lists installed bundles ordered by platform.
    #[must_use]
    pub fn list(&self) -> Vec<CookieBundleInfo> {
        let mut infos: Vec<_> = self.bundles.iter().map(|entry| entry.info()).collect();
        infos.sort_by_key(|info| info.platform);
        infos
    }

    /// Validates and installs a bundle, replacing any previous one.
    ///
    /// # Errors
    ///
    /// Returns [`CookieStoreError::Invalid`] before touching disk when the
    /// text is malformed, or [`CookieStoreError::Io`] if the write fails.
    #[instrument(skip(self, raw_content), fields(platform = %platform))]
    pub async fn install(
        &self,
        platform: Platform,
        raw_content: String,
    ) -> Result<Arc<CookieBundle>, CookieStoreError> {
        let version = self.next_version.fetch_add(1, Ordering::SeqCst);
        let mut bundle = CookieBundle::parse(platform, raw_content, self.clock.now_ms(), version)?;

        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| CookieStoreError::io(&self.dir, e))?;

        let final_path = self.dir.join(bundle_file_name(platform));
        let temp_path = self
            .dir
            .join(format!(".{}.{version}.tmp", bundle_file_name(platform)));

        tokio::fs::write(&temp_path, bundle.raw_content.as_bytes())
            .await
            .map_err(|e| CookieStoreError::io(&temp_path, e))?;
        if let Err(e) = tokio::fs::rename(&temp_path, &final_path).await {
            if let Err(cleanup) = tokio::fs::remove_file(&temp_path).await {
                debug!(error = %cleanup, path = %temp_path.display(), "temp cookie file left behind");
            }
            return Err(CookieStoreError::io(&final_path, e));
        }
        bundle.source_mtime = file_mtime(&final_path).await;

        let bundle = Arc::new(bundle);
        self.bundles.insert(platform, Arc::clone(&bundle));
        info!(version, cookies = bundle.cookies.len(), "cookie bundle installed");
        Ok(bundle)
    }

    /// Deletes a platform's bundle from memory and disk.
    ///
    /// # Errors
    ///
    /// Returns [`CookieStoreError::Io`] if the file exists but cannot be removed.
    #[instrument(skip(self), fields(platform = %platform))]
    pub async fn remove(&self, platform: Platform) -> Result<bool, CookieStoreError> {
        let existed = self.bundles.remove(&platform).is_some();
        let path = self.dir.join(bundle_file_name(platform));
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(existed),
            Err(e) => Err(CookieStoreError::io(&path, e)),
        }
    }

    /// Loads every platform's bundle file found in the cookie directory.
    ///
    /// Invalid files are logged and skipped so one bad bundle does not
    /// disable the others. Returns the number of bundles now active.
    #[instrument(skip(self), fields(dir = %self.dir.display()))]
    pub async fn load_from_dir(&self) -> usize {
        for platform in Platform::ALL {
            if let Err(error) = self.refresh(platform).await {
                warn!(platform = %platform, error = %error, "skipping cookie bundle");
            }
        }
        self.bundles.len()
    }

    /// Reloads a platform's bundle if its file changed since the last load.
    ///
    /// Lets worker processes pick up bundles installed by another process.
    /// A vanished file drops the in-memory bundle.
    ///
    /// # Errors
    ///
    /// Returns [`CookieStoreError`] when the changed file cannot be read or is invalid;
    /// the previous bundle stays active in that case.
    pub async fn refresh(&self, platform: Platform) -> Result<(), CookieStoreError> {
        let path = self.dir.join(bundle_file_name(platform));
        let Some(mtime) = file_mtime(&path).await else {
            if self.bundles.remove(&platform).is_some() {
                debug!(platform = %platform, "cookie bundle file removed");
            }
            return Ok(());
        };

        let unchanged = self
            .bundles
            .get(&platform)
            .is_some_and(|current| current.source_mtime == Some(mtime));
        if unchanged {
            return Ok(());
        }

        let raw = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| CookieStoreError::io(&path, e))?;
        let version = self.next_version.fetch_add(1, Ordering::SeqCst);
        let mut bundle = CookieBundle::parse(platform, raw, self.clock.now_ms(), version)?;
        bundle.source_mtime = Some(mtime);
        self.bundles.insert(platform, Arc::new(bundle));
        debug!(platform = %platform, version, "cookie bundle loaded from disk");
        Ok(())
    }
}

async fn file_mtime(path: &Path) -> Option<SystemTime> {
    tokio::fs::metadata(path)
        .await
        .ok()
        .and_then(|meta| meta.modified().ok())
}
