//! Platform detection from validated URLs.
//!
//! Detection walks an ordered table of [`SignatureRule`]s. Each rule pairs a
//! set of domains with an optional path pattern and maps to exactly one
//! [`Platform`] variant. Adding a platform means adding one variant and one
//! rule; the matching loop itself never changes.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument};
use url::Url;

/// Supported content platforms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    TikTok,
    YouTube,
    Instagram,
    Twitter,
    Reddit,
    SoundCloud,
    Dailymotion,
    Twitch,
    Vimeo,
    Facebook,
    Bilibili,
    LinkedIn,
    Pinterest,
}

impl Platform {
    /// All platforms in detection order.
    pub const ALL: [Platform; 13] = [
        Self::TikTok,
        Self::YouTube,
        Self::Instagram,
        Self::Twitter,
        Self::Reddit,
        Self::SoundCloud,
        Self::Dailymotion,
        Self::Twitch,
        Self::Vimeo,
        Self::Facebook,
        Self::Bilibili,
        Self::LinkedIn,
        Self::Pinterest,
    ];

    /// Returns the storage/wire identifier.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TikTok => "tiktok",
            Self::YouTube => "youtube",
            Self::Instagram => "instagram",
            Self::Twitter => "twitter",
            Self::Reddit => "reddit",
            Self::SoundCloud => "soundcloud",
            Self::Dailymotion => "dailymotion",
            Self::Twitch => "twitch",
            Self::Vimeo => "vimeo",
            Self::Facebook => "facebook",
            Self::Bilibili => "bilibili",
            Self::LinkedIn => "linkedin",
            Self::Pinterest => "pinterest",
        }
    }

    /// Whether extraction on this platform needs an installed cookie bundle.
    #[must_use]
    pub fn requires_auth(&self) -> bool {
        matches!(self, Self::Instagram | Self::Facebook | Self::LinkedIn)
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|p| p.as_str() == lowered)
            .ok_or_else(|| format!("unknown platform: {s}"))
    }
}

/// Returned when no signature rule matches a URL.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unsupported platform for host '{host}'")]
pub struct UnsupportedPlatform {
    /// Host of the rejected URL.
    pub host: String,
}

/// One detection rule: a domain set plus an optional path constraint.
#[derive(Debug)]
pub struct SignatureRule {
    platform: Platform,
    domains: &'static [&'static str],
    path: Option<Regex>,
}

impl SignatureRule {
    fn new(platform: Platform, domains: &'static [&'static str]) -> Self {
        Self {
            platform,
            domains,
            path: None,
        }
    }

    #[allow(clippy::expect_used)]
    fn with_path(mut self, pattern: &str) -> Self {
        self.path = Some(Regex::new(pattern).expect("signature path regex is valid")); // Static pattern, safe to panic
        self
    }

    fn matches(&self, host: &str, path: &str) -> bool {
        let host_ok = self
            .domains
            .iter()
            .any(|d| host == *d || host.ends_with(&format!(".{d}")));
        host_ok && self.path.as_ref().is_none_or(|re| re.is_match(path))
    }
}

/// Ordered signature table. Short-link domains come with their parent platform.
static RULES: LazyLock<Vec<SignatureRule>> = LazyLock::new(|| {
    vec![
        SignatureRule::new(Platform::TikTok, &["tiktok.com"]),
        SignatureRule::new(
            Platform::YouTube,
            &["youtube.com", "youtu.be", "youtube-nocookie.com"],
        ),
        SignatureRule::new(Platform::Instagram, &["instagram.com", "instagr.am"]),
        SignatureRule::new(Platform::Twitter, &["twitter.com", "x.com", "t.co"]),
        SignatureRule::new(Platform::Reddit, &["reddit.com", "redd.it"]),
        SignatureRule::new(Platform::SoundCloud, &["soundcloud.com"]),
        SignatureRule::new(Platform::Dailymotion, &["dailymotion.com", "dai.ly"]),
        SignatureRule::new(Platform::Twitch, &["twitch.tv"]),
        SignatureRule::new(Platform::Vimeo, &["vimeo.com"]),
        SignatureRule::new(Platform::Facebook, &["facebook.com", "fb.watch"]),
        SignatureRule::new(Platform::Bilibili, &["bilibili.com", "b23.tv"]),
        // Only posts carry media; profile and job pages do not.
        SignatureRule::new(Platform::LinkedIn, &["linkedin.com"])
            .with_path(r"^/(posts|feed/update|embed|video|events)/"),
        SignatureRule::new(Platform::Pinterest, &["pinterest.com", "pin.it"]),
    ]
});

/// Detects the platform of a validated URL.
///
/// Pure function: the same URL always yields the same result.
///
/// # Errors
///
/// Returns [`UnsupportedPlatform`] when no rule matches.
///
/// # Examples
///
/// ```
/// use mediafetch_core::platform::{Platform, detect_platform};
/// use url::Url;
///
/// let url = Url::parse("https://youtu.be/abc").unwrap();
/// assert_eq!(detect_platform(&url).unwrap(), Platform::YouTube);
/// ```
#[instrument(skip(url), fields(host = url.host_str()))]
pub fn detect_platform(url: &Url) -> Result<Platform, UnsupportedPlatform> {
    let host = url
        .host_str()
        .unwrap_or_default()
        .trim_end_matches('.')
        .to_ascii_lowercase();
    let path = url.path();

    if let Some(rule) = RULES.iter().find(|rule| rule.matches(&host, path)) {
        debug!(platform = %rule.platform, "platform detected");
        return Ok(rule.platform);
    }

    Err(UnsupportedPlatform { host })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn detect(raw: &str) -> Result<Platform, UnsupportedPlatform> {
        detect_platform(&Url::parse(raw).unwrap())
    }

    #[test]
    fn test_detects_every_platform() {
        let cases = [
            ("https://www.tiktok.com/@u/video/1", Platform::TikTok),
            ("https://vt.tiktok.com/ZS123/", Platform::TikTok),
            ("https://youtube.com/watch?v=abc", Platform::YouTube),
            ("https://m.youtube.com/shorts/abc", Platform::YouTube),
            ("https://youtu.be/abc", Platform::YouTube),
            ("https://www.instagram.com/reel/abc/", Platform::Instagram),
            ("https://x.com/user/status/1", Platform::Twitter),
            ("https://t.co/abc", Platform::Twitter),
            ("https://old.reddit.com/r/videos/comments/x", Platform::Reddit),
            ("https://redd.it/abc", Platform::Reddit),
            ("https://soundcloud.com/artist/track", Platform::SoundCloud),
            ("https://dai.ly/x8abc", Platform::Dailymotion),
            ("https://www.twitch.tv/videos/1", Platform::Twitch),
            ("https://vimeo.com/123", Platform::Vimeo),
            ("https://fb.watch/abc/", Platform::Facebook),
            ("https://www.bilibili.com/video/BV1", Platform::Bilibili),
            ("https://b23.tv/abc", Platform::Bilibili),
            ("https://www.linkedin.com/posts/someone_activity-1", Platform::LinkedIn),
            ("https://pin.it/abc", Platform::Pinterest),
        ];
        for (raw, expected) in cases {
            assert_eq!(detect(raw).unwrap(), expected, "{raw}");
        }
    }

    #[test]
    fn test_lookalike_domains_are_not_matched() {
        // Substring matching would wrongly accept these.
        assert!(detect("https://notyoutube.com/watch?v=1").is_err());
        assert!(detect("https://box.com/file").is_err());
        assert!(detect("https://youtube.com.evil.example/x").is_err());
    }

    #[test]
    fn test_path_constraint_applies() {
        assert!(detect("https://www.linkedin.com/in/someone").is_err());
    }

    #[test]
    fn test_unknown_domain_is_unsupported() {
        let err = detect("https://example.com/video.mp4").unwrap_err();
        assert_eq!(err.host, "example.com");
    }

    #[test]
    fn test_detection_is_deterministic() {
        let url = Url::parse("https://www.youtube.com/watch?v=abc").unwrap();
        let first = detect_platform(&url).unwrap();
        for _ in 0..10 {
            assert_eq!(detect_platform(&url).unwrap(), first);
        }
    }

    #[test]
    fn test_platform_round_trips_through_str() {
        for platform in Platform::ALL {
            assert_eq!(platform.as_str().parse::<Platform>().unwrap(), platform);
        }
        assert!("myspace".parse::<Platform>().is_err());
    }
}
