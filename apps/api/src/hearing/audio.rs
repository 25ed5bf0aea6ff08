//! Audio input handling — MIME allow-list and base64 decoding.
//!
//! Size limits are the caller's job; this module only checks that the payload is
//! decodable, non-empty, and of an accepted type.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::hearing::error::ChainError;

/// Accepted audio container types.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum AudioMime {
    #[serde(rename = "audio/mp3")]
    Mp3,
    #[serde(rename = "audio/wav")]
    Wav,
    #[default]
    #[serde(rename = "audio/webm")]
    Webm,
    #[serde(rename = "audio/ogg")]
    Ogg,
    #[serde(rename = "audio/mp4")]
    Mp4,
}

impl AudioMime {
    pub fn as_str(&self) -> &'static str {
        match self {
            AudioMime::Mp3 => "audio/mp3",
            AudioMime::Wav => "audio/wav",
            AudioMime::Webm => "audio/webm",
            AudioMime::Ogg => "audio/ogg",
            AudioMime::Mp4 => "audio/mp4",
        }
    }

    /// Resolves a declared content type against the allow-list.
    ///
    /// Parameters such as `;codecs=opus` are ignored and common aliases are folded
    /// in. A missing, empty, generic binary, or unrecognized `audio/*` content type
    /// yields the default (`audio/webm`, what browser recorders produce). Non-audio
    /// types are rejected.
    pub fn resolve(declared: Option<&str>) -> Result<Self, ChainError> {
        let Some(declared) = declared else {
            return Ok(AudioMime::default());
        };
        let essence = declared
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();

        match essence.as_str() {
            "" | "application/octet-stream" => Ok(AudioMime::default()),
            "audio/mp3" | "audio/mpeg" | "audio/mpeg3" | "audio/x-mp3" => Ok(AudioMime::Mp3),
            "audio/wav" | "audio/wave" | "audio/x-wav" | "audio/vnd.wave" => Ok(AudioMime::Wav),
            "audio/webm" => Ok(AudioMime::Webm),
            "audio/ogg" | "audio/opus" => Ok(AudioMime::Ogg),
            "audio/mp4" | "audio/m4a" | "audio/x-m4a" | "audio/aac" => Ok(AudioMime::Mp4),
            other if other.starts_with("audio/") => {
                debug!("Unrecognized audio type '{declared}', sending as {}", AudioMime::default().as_str());
                Ok(AudioMime::default())
            }
            _ => Err(ChainError::UnsupportedMime(declared.to_string())),
        }
    }
}

/// The audio as supplied by the caller: base64 text plus the declared content type.
/// Immutable for the lifetime of a run.
#[derive(Debug, Clone)]
pub struct AudioInput {
    pub base64: String,
    pub mime_type: Option<String>,
}

impl AudioInput {
    pub fn new(base64: impl Into<String>, mime_type: Option<String>) -> Self {
        Self {
            base64: base64.into(),
            mime_type,
        }
    }

    /// Decodes into a validated [`AudioBlob`].
    pub fn decode(&self) -> Result<AudioBlob, ChainError> {
        let mime = AudioMime::resolve(self.mime_type.as_deref())?;

        // Accept data URLs ("data:audio/webm;base64,....") as sent by browsers.
        let payload = match self.base64.split_once(";base64,") {
            Some((prefix, rest)) if prefix.starts_with("data:") => rest,
            _ => self.base64.as_str(),
        };
        let compact: String = payload.chars().filter(|c| !c.is_whitespace()).collect();
        if compact.is_empty() {
            return Err(ChainError::EmptyAudio);
        }

        let bytes = STANDARD
            .decode(compact.as_bytes())
            .map_err(|e| ChainError::InvalidAudioEncoding(e.to_string()))?;
        if bytes.is_empty() {
            return Err(ChainError::EmptyAudio);
        }

        Ok(AudioBlob {
            bytes: Bytes::from(bytes),
            mime,
        })
    }
}

/// Decoded audio ready to be sent to the provider.
#[derive(Debug, Clone)]
pub struct AudioBlob {
    pub bytes: Bytes,
    pub mime: AudioMime,
}
