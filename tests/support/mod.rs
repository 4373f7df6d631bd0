//! Shared harness for integration tests: a scripted extractor and an
//! engine built on a temp directory with a manual clock.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use mediafetch_core::{
    Clock, Engine, EngineConfig, ExtractContext, ExtractError, Extractor, ExtractorRegistry,
    FormatList, ManualClock, MaterializedMedia, MediaFormat, Platform, SharedClock, SubmitRequest,
    SystemClock,
};
use tempfile::TempDir;
use url::Url;

/// What one `fetch_and_materialize` call does.
#[derive(Debug, Clone)]
pub enum Step {
    /// Write the file and succeed.
    Succeed,
    /// Return this error.
    Fail(ExtractError),
    /// Sleep past any sensible timeout.
    Hang,
}

/// Extractor returning a fixed format list and following a script of steps.
///
/// Every listing signs its format URLs with `?sig=<listing number>`, the way
/// real hosts hand out short-lived links. Once the script runs out every
/// call succeeds.
#[derive(Debug)]
pub struct FakeExtractor {
    platform: Platform,
    requires_auth: bool,
    formats: FormatList,
    script: Mutex<VecDeque<Step>>,
    pub fetch_calls: AtomicUsize,
    pub materialize_calls: AtomicUsize,
    materialized_urls: Mutex<Vec<String>>,
}

impl FakeExtractor {
    pub fn new(platform: Platform) -> Self {
        Self {
            platform,
            requires_auth: platform.requires_auth(),
            formats: standard_formats(),
            script: Mutex::new(VecDeque::new()),
            fetch_calls: AtomicUsize::new(0),
            materialize_calls: AtomicUsize::new(0),
            materialized_urls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_formats(mut self, formats: FormatList) -> Self {
        self.formats = formats;
        self
    }

    pub fn with_steps(self, steps: impl IntoIterator<Item = Step>) -> Self {
        self.script.lock().unwrap().extend(steps);
        self
    }

    pub fn materialize_count(&self) -> usize {
        self.materialize_calls.load(Ordering::SeqCst)
    }

    pub fn fetch_count(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    /// Format URLs handed to `fetch_and_materialize`, in call order.
    pub fn materialized_urls(&self) -> Vec<String> {
        self.materialized_urls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Extractor for FakeExtractor {
    fn platform(&self) -> Platform {
        self.platform
    }

    fn requires_auth(&self) -> bool {
        self.requires_auth
    }

    async fn fetch_formats(
        &self,
        _url: &Url,
        _ctx: &ExtractContext,
    ) -> Result<FormatList, ExtractError> {
        let listing = self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        let mut formats = self.formats.clone();
        for format in &mut formats.formats {
            format.url = format!("{}?sig={listing}", format.url);
        }
        Ok(formats)
    }

    async fn fetch_and_materialize(
        &self,
        _url: &Url,
        format: &MediaFormat,
        ctx: &ExtractContext,
    ) -> Result<MaterializedMedia, ExtractError> {
        self.materialize_calls.fetch_add(1, Ordering::SeqCst);
        self.materialized_urls.lock().unwrap().push(format.url.clone());
        let step = self.script.lock().unwrap().pop_front().unwrap_or(Step::Succeed);
        match step {
            Step::Succeed => {
                let path = ctx.output_path(&format.ext);
                let body = format!("media for {} in {}", ctx.task_id, format.format_id);
                tokio::fs::write(&path, body.as_bytes())
                    .await
                    .map_err(|e| ExtractError::storage("writing fake media", &e))?;
                Ok(MaterializedMedia {
                    path,
                    size_bytes: body.len() as u64,
                })
            }
            Step::Fail(error) => Err(error),
            Step::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                unreachable!("hang step outlived its timeout")
            }
        }
    }
}

pub fn video(format_id: &str, height: u32) -> MediaFormat {
    MediaFormat {
        format_id: format_id.to_string(),
        ext: "mp4".to_string(),
        height: Some(height),
        has_video: true,
        has_audio: true,
        filesize: Some(u64::from(height) * 1000),
        url: format!("https://cdn.example.test/{format_id}.mp4"),
        http_headers: Default::default(),
    }
}

pub fn audio(format_id: &str) -> MediaFormat {
    MediaFormat {
        format_id: format_id.to_string(),
        ext: "m4a".to_string(),
        height: None,
        has_video: false,
        has_audio: true,
        filesize: Some(4000),
        url: format!("https://cdn.example.test/{format_id}.m4a"),
        http_headers: Default::default(),
    }
}

/// 360p, 720p and 1080p video plus one audio-only stream.
pub fn standard_formats() -> FormatList {
    FormatList {
        title: Some("Test clip".to_string()),
        author: Some("tester".to_string()),
        duration_secs: Some(12.5),
        formats: vec![
            video("18", 360),
            video("22", 720),
            video("137", 1080),
            audio("140"),
        ],
    }
}

pub struct Harness {
    pub dir: TempDir,
    pub clock: Arc<ManualClock>,
    pub engine: Engine,
}

impl Harness {
    /// Builds an engine whose registry holds `extractors`; `tweak` adjusts the config.
    pub async fn new(
        extractors: Vec<Arc<FakeExtractor>>,
        tweak: impl FnOnce(&mut EngineConfig),
    ) -> Self {
        let dir = TempDir::new().unwrap();
        let mut config = EngineConfig {
            database_path: dir.path().join("mediafetch.db"),
            media_root: dir.path().join("media"),
            cookie_dir: dir.path().join("cookies"),
            worker_concurrency: 2,
            backoff_base_secs: 1,
            backoff_max_secs: 10,
            backoff_jitter_ms: 0,
            poll_interval_ms: 20,
            sync_wait_timeout_secs: 5,
            ..EngineConfig::default()
        };
        tweak(&mut config);

        let mut registry = ExtractorRegistry::new();
        for extractor in extractors {
            registry.register(extractor);
        }

        // Real wall-clock start so file mtimes and record times agree.
        let clock = Arc::new(ManualClock::new(SystemClock.now_ms()));
        let shared: SharedClock = clock.clone();
        let engine = Engine::with_registry(config, shared, registry).await.unwrap();
        Self { dir, clock, engine }
    }

    pub fn request(url: &str, quality: Option<&str>) -> SubmitRequest {
        SubmitRequest {
            url: url.to_string(),
            quality: quality.map(str::to_string),
            client_key: "198.51.100.7".to_string(),
        }
    }

    pub fn clock_now(&self) -> i64 {
        self.clock.now_ms()
    }

    /// Runs due tasks, advancing the clock past the longest backoff between rounds.
    pub async fn drain(&self, rounds: usize) {
        for _ in 0..rounds {
            self.engine.pool().run_until_idle().await.unwrap();
            if !self.engine.queue().has_unfinished().await.unwrap() {
                return;
            }
            self.clock.advance(Duration::from_secs(
                self.engine.config().backoff_max_secs + 1,
            ));
        }
    }
}
