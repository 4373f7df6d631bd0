//! Requested quality vocabulary and closest-match format selection.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{ExtractError, FailureCause, FormatList, MediaFormat};

/// Quality requested by a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Quality {
    /// Video with the given frame height, written `720p`.
    Height(u32),
    /// Audio-only stream.
    Audio,
    /// Highest available video.
    Best,
}

/// Quality used when a submission does not name one.
pub const DEFAULT_QUALITY: Quality = Quality::Height(720);

impl Default for Quality {
    fn default() -> Self {
        DEFAULT_QUALITY
    }
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Height(h) => write!(f, "{h}p"),
            Self::Audio => write!(f, "audio"),
            Self::Best => write!(f, "best"),
        }
    }
}

/// Unrecognized quality string.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unrecognized quality '{0}' (expected e.g. 720p, audio or best)")]
pub struct QualityParseError(pub String);

impl FromStr for Quality {
    type Err = QualityParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_ascii_lowercase();
        match lowered.as_str() {
            "audio" => Ok(Self::Audio),
            "best" => Ok(Self::Best),
            other => other
                .strip_suffix('p')
                .unwrap_or(other)
                .parse::<u32>()
                .ok()
                .filter(|h| *h > 0)
                .map(Self::Height)
                .ok_or_else(|| QualityParseError(s.to_string())),
        }
    }
}

impl Serialize for Quality {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Quality {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Chosen format plus what was actually delivered.
#[derive(Debug, Clone, PartialEq)]
pub struct Selection<'a> {
    pub format: &'a MediaFormat,
    pub delivered: Quality,
    /// True when `delivered` differs from what was requested.
    pub substituted: bool,
}

/// Picks the format that best satisfies `requested`.
///
/// Heights resolve to the closest available height, ties going to the
/// lower one. `best` takes the tallest video. `audio` takes an audio-only
/// format, else the smallest video. Only an empty list fails.
///
/// # Errors
///
/// Returns a fatal [`FailureCause::UnsupportedQuality`] when the list has no formats.
pub fn select_format(formats: &FormatList, requested: Quality) -> Result<Selection<'_>, ExtractError> {
    let videos = || formats.formats.iter().filter(|f| f.height.is_some());
    let audio = formats
        .formats
        .iter()
        .filter(|f| f.is_audio_only())
        .max_by_key(|f| f.filesize.unwrap_or(0));

    let chosen = match requested {
        Quality::Height(target) => videos()
            .min_by_key(|f| {
                let h = f.height.unwrap_or(0);
                (h.abs_diff(target), h)
            })
            .or(audio),
        Quality::Best => videos().max_by_key(|f| f.height.unwrap_or(0)).or(audio),
        Quality::Audio => audio.or_else(|| videos().min_by_key(|f| f.height.unwrap_or(0))),
    };

    let Some(format) = chosen.or_else(|| formats.formats.first()) else {
        return Err(ExtractError::fatal(
            FailureCause::UnsupportedQuality,
            format!("no formats available for requested quality {requested}"),
        ));
    };

    let delivered = match format.height {
        Some(h) if !format.is_audio_only() => Quality::Height(h),
        _ => Quality::Audio,
    };
    let substituted = match requested {
        Quality::Best => delivered == Quality::Audio,
        other => other != delivered,
    };

    Ok(Selection {
        format,
        delivered,
        substituted,
    })
}
