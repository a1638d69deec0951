//! Availability checks for the external binaries.

use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::error::{MediaError, MediaResult};

/// Where a tool resolved, or why it did not.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolStatus {
    pub name: String,
    pub available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolStatus {
    /// Resolve `binary` on PATH (or check it directly when it contains a slash).
    pub fn probe(name: &str, binary: &Path) -> Self {
        match resolve(binary) {
            Ok(path) => Self {
                name: name.to_string(),
                available: true,
                path: Some(path),
                error: None,
            },
            Err(e) => Self {
                name: name.to_string(),
                available: false,
                path: None,
                error: Some(e.to_string()),
            },
        }
    }
}

/// Resolve an executable the same way the process runner will launch it.
pub fn resolve(binary: &Path) -> MediaResult<PathBuf> {
    let program = binary.to_string_lossy().into_owned();
    which::which(binary).map_err(|e| MediaError::launch_failure(program, e.to_string()))
}

/// Check if yt-dlp is available.
pub fn check_ytdlp(binary: &Path) -> ToolStatus {
    ToolStatus::probe("yt-dlp", binary)
}

/// Check if FFmpeg is available.
pub fn check_ffmpeg(binary: &Path) -> ToolStatus {
    ToolStatus::probe("ffmpeg", binary)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_tool() {
        let status = check_ffmpeg(Path::new("/nonexistent/ffmpeg"));
        assert!(!status.available);
        assert!(status.path.is_none());
        assert!(status.error.is_some());
    }

    #[cfg(unix)]
    #[test]
    fn test_present_tool() {
        let dir = tempfile::TempDir::new().unwrap();
        let script = crate::test_support::write_script(dir.path(), "yt-dlp", "exit 0");
        let status = check_ytdlp(&script);
        assert!(status.available);
        assert_eq!(status.path.as_deref(), Some(script.as_path()));

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["name"], "yt-dlp");
        assert!(json.get("error").is_none());
    }
}
