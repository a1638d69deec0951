//! Output formats a client may request.

use std::fmt;
use std::str::FromStr;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Whether a container carries video or audio only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum MediaClass {
    Video,
    Audio,
}

/// A concrete container format the transcoder can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Mp4,
    Webm,
    Mkv,
    Mov,
    Mp3,
    M4a,
    /// PCM s16le, 16 kHz mono. Suited to speech transcription.
    Wav,
}

impl OutputFormat {
    pub const ALL: [OutputFormat; 7] = [
        OutputFormat::Mp4,
        OutputFormat::Webm,
        OutputFormat::Mkv,
        OutputFormat::Mov,
        OutputFormat::Mp3,
        OutputFormat::M4a,
        OutputFormat::Wav,
    ];

    /// File extension without the leading dot.
    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Mp4 => "mp4",
            OutputFormat::Webm => "webm",
            OutputFormat::Mkv => "mkv",
            OutputFormat::Mov => "mov",
            OutputFormat::Mp3 => "mp3",
            OutputFormat::M4a => "m4a",
            OutputFormat::Wav => "wav",
        }
    }

    /// MIME type used for the `Content-Type` header.
    pub fn content_type(&self) -> &'static str {
        match self {
            OutputFormat::Mp4 => "video/mp4",
            OutputFormat::Webm => "video/webm",
            OutputFormat::Mkv => "video/x-matroska",
            OutputFormat::Mov => "video/quicktime",
            OutputFormat::Mp3 => "audio/mpeg",
            OutputFormat::M4a => "audio/mp4",
            OutputFormat::Wav => "audio/wav",
        }
    }

    pub fn media_class(&self) -> MediaClass {
        match self {
            OutputFormat::Mp3 | OutputFormat::M4a | OutputFormat::Wav => MediaClass::Audio,
            _ => MediaClass::Video,
        }
    }

    /// Map a file extension (case-insensitive) back to a known format.
    pub fn from_extension(ext: &str) -> Option<Self> {
        let ext = ext.trim_start_matches('.').to_ascii_lowercase();
        Self::ALL.into_iter().find(|f| f.extension() == ext)
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unsupported output format: {0}")]
pub struct FormatParseError(pub String);

impl FromStr for OutputFormat {
    type Err = FormatParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_extension(s.trim()).ok_or_else(|| FormatParseError(s.to_string()))
    }
}

/// What the client asked for: keep whatever the downloader produced, or
/// force a specific container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case", tag = "mode", content = "format")]
pub enum TargetFormat {
    #[default]
    Native,
    Convert(OutputFormat),
}

impl TargetFormat {
    /// Parse an optional query/body parameter. Empty or `native` means pass-through.
    pub fn parse_param(value: Option<&str>) -> Result<Self, FormatParseError> {
        match value.map(str::trim) {
            None | Some("") => Ok(TargetFormat::Native),
            Some(v) if v.eq_ignore_ascii_case("native") => Ok(TargetFormat::Native),
            Some(v) => v.parse().map(TargetFormat::Convert),
        }
    }

    /// Returns the format to convert into, or `None` when the downloaded
    /// container already satisfies the request.
    pub fn conversion_for(&self, native_extension: &str) -> Option<OutputFormat> {
        match self {
            TargetFormat::Native => None,
            TargetFormat::Convert(format) => {
                if format.extension().eq_ignore_ascii_case(native_extension) {
                    None
                } else {
                    Some(*format)
                }
            }
        }
    }

    pub fn as_key_part(&self) -> &'static str {
        match self {
            TargetFormat::Native => "native",
            TargetFormat::Convert(format) => format.extension(),
        }
    }
}

impl fmt::Display for TargetFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_key_part())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_format() {
        assert_eq!("mp4".parse::<OutputFormat>(), Ok(OutputFormat::Mp4));
        assert_eq!("WAV".parse::<OutputFormat>(), Ok(OutputFormat::Wav));
        assert_eq!(".webm".parse::<OutputFormat>(), Ok(OutputFormat::Webm));
        assert!("avi".parse::<OutputFormat>().is_err());
    }

    #[test]
    fn test_target_param() {
        assert_eq!(TargetFormat::parse_param(None), Ok(TargetFormat::Native));
        assert_eq!(TargetFormat::parse_param(Some("")), Ok(TargetFormat::Native));
        assert_eq!(TargetFormat::parse_param(Some("Native")), Ok(TargetFormat::Native));
        assert_eq!(
            TargetFormat::parse_param(Some("mp3")),
            Ok(TargetFormat::Convert(OutputFormat::Mp3))
        );
        assert!(TargetFormat::parse_param(Some("--exec")).is_err());
    }

    #[test]
    fn test_conversion_skipped_for_matching_container() {
        let target = TargetFormat::Convert(OutputFormat::Mp4);
        assert_eq!(target.conversion_for("mp4"), None);
        assert_eq!(target.conversion_for("MP4"), None);
        assert_eq!(target.conversion_for("webm"), Some(OutputFormat::Mp4));
        assert_eq!(TargetFormat::Native.conversion_for("flv"), None);
    }

    #[test]
    fn test_media_class() {
        assert_eq!(OutputFormat::Wav.media_class(), MediaClass::Audio);
        assert_eq!(OutputFormat::Mkv.media_class(), MediaClass::Video);
        assert_eq!(OutputFormat::Wav.content_type(), "audio/wav");
    }
}
