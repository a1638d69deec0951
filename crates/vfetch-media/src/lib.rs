//! yt-dlp / FFmpeg wrappers with guaranteed cleanup.
//!
//! This crate provides:
//! - Per-job workspaces with quota accounting and an orphan sweep
//! - A process runner that owns the whole process group of every tool it starts
//! - Source URL validation ahead of any process spawn
//! - Download and transcode stages behind the `Downloader` / `Transcoder` traits

pub mod download;
pub mod error;
pub mod process;
pub mod source;
pub mod tools;
pub mod transcode;
pub mod workspace;

#[cfg(all(test, unix))]
pub(crate) mod test_support;

pub use download::{DownloadStage, Downloader, DownloaderConfig};
pub use error::{MediaError, MediaResult};
pub use process::{CapturedOutput, Invocation, ProcessOutput, ProcessRunner, ResourceLimits};
pub use source::{SourcePolicy, SourceUrl};
pub use tools::{check_ffmpeg, check_ytdlp, ToolStatus};
pub use transcode::{TranscodeCommand, TranscodeStage, Transcoder, TranscoderConfig};
pub use workspace::{Workspace, WorkspaceConfig, WorkspaceManager, WorkspaceStats};
