//! Format conversion using FFmpeg.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use metrics::histogram;
use tokio::sync::watch;
use tracing::info;
use vfetch_models::{MediaClass, OutputFormat};

use crate::error::{MediaError, MediaResult};
use crate::process::{
    Invocation, ProcessRunner, ResourceLimits, DEFAULT_KILL_GRACE, DEFAULT_OUTPUT_LIMIT,
};

/// Builder for FFmpeg conversion arguments.
///
/// Overwriting is always disabled (`-n`): the output path must not exist.
#[derive(Debug, Clone)]
pub struct TranscodeCommand {
    input: PathBuf,
    output: PathBuf,
    output_args: Vec<String>,
    log_level: String,
}

impl TranscodeCommand {
    pub fn new(input: impl AsRef<Path>, output: impl AsRef<Path>) -> Self {
        Self {
            input: input.as_ref().to_path_buf(),
            output: output.as_ref().to_path_buf(),
            output_args: Vec::new(),
            log_level: "error".to_string(),
        }
    }

    /// Codec settings for `format`.
    pub fn for_format(input: impl AsRef<Path>, output: impl AsRef<Path>, format: OutputFormat) -> Self {
        let cmd = Self::new(input, output);
        match format {
            OutputFormat::Mp4 => cmd
                .video_codec("libx264")
                .preset("veryfast")
                .crf(23)
                .audio_codec("aac")
                .audio_bitrate("128k")
                .output_args(["-movflags", "+faststart"]),
            OutputFormat::Mov => cmd
                .video_codec("libx264")
                .preset("veryfast")
                .crf(23)
                .audio_codec("aac")
                .audio_bitrate("128k"),
            OutputFormat::Webm => cmd
                .video_codec("libvpx-vp9")
                .crf(32)
                .output_args(["-b:v", "0"])
                .audio_codec("libopus")
                .audio_bitrate("128k"),
            OutputFormat::Mkv => cmd.output_args(["-c", "copy"]),
            OutputFormat::Mp3 => cmd
                .no_video()
                .audio_codec("libmp3lame")
                .output_args(["-q:a", "2"]),
            OutputFormat::M4a => cmd.no_video().audio_codec("aac").audio_bitrate("192k"),
            // Speech-recognition preset: 16 kHz mono PCM.
            OutputFormat::Wav => cmd
                .no_video()
                .audio_codec("pcm_s16le")
                .output_args(["-ar", "16000", "-ac", "1"]),
        }
    }

    pub fn output_arg(mut self, arg: impl Into<String>) -> Self {
        self.output_args.push(arg.into());
        self
    }

    pub fn output_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.output_args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn video_codec(self, codec: impl Into<String>) -> Self {
        self.output_arg("-c:v").output_arg(codec)
    }

    pub fn audio_codec(self, codec: impl Into<String>) -> Self {
        self.output_arg("-c:a").output_arg(codec)
    }

    pub fn crf(self, crf: u8) -> Self {
        self.output_arg("-crf").output_arg(crf.to_string())
    }

    pub fn preset(self, preset: impl Into<String>) -> Self {
        self.output_arg("-preset").output_arg(preset)
    }

    pub fn audio_bitrate(self, bitrate: impl Into<String>) -> Self {
        self.output_arg("-b:a").output_arg(bitrate)
    }

    pub fn no_video(self) -> Self {
        self.output_arg("-vn")
    }

    pub fn log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = level.into();
        self
    }

    pub fn input(&self) -> &Path {
        &self.input
    }

    pub fn output(&self) -> &Path {
        &self.output
    }

    /// Full argument list, paths included.
    pub fn build_args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = ["-hide_banner", "-nostdin", "-n", "-v"]
            .into_iter()
            .map(OsString::from)
            .collect();
        args.push(self.log_level.clone().into());
        args.push("-i".into());
        args.push(self.input.clone().into_os_string());
        args.extend(self.output_args.iter().map(OsString::from));
        args.push(self.output.clone().into_os_string());
        args
    }
}

/// Transcoder settings.
#[derive(Debug, Clone)]
pub struct TranscoderConfig {
    pub binary: PathBuf,
    pub stage_timeout: Duration,
    pub max_file_size: Option<u64>,
    pub output_limit: usize,
    pub kill_grace: Duration,
}

impl Default for TranscoderConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("ffmpeg"),
            stage_timeout: Duration::from_secs(600),
            max_file_size: None,
            output_limit: DEFAULT_OUTPUT_LIMIT,
            kill_grace: DEFAULT_KILL_GRACE,
        }
    }
}

/// Converts a downloaded file to a target format.
#[async_trait]
pub trait Transcoder: Send + Sync {
    /// Convert `input` into `format`, writing next to it, and return the
    /// output path.
    async fn transcode(
        &self,
        input: &Path,
        format: OutputFormat,
        cancel: watch::Receiver<bool>,
    ) -> MediaResult<PathBuf>;
}

/// FFmpeg backed [`Transcoder`].
#[derive(Debug, Clone, Default)]
pub struct TranscodeStage {
    config: TranscoderConfig,
}

impl TranscodeStage {
    pub fn new(config: TranscoderConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TranscoderConfig {
        &self.config
    }

    /// `<stem>.<format ext>` in the input's directory.
    pub fn output_path(input: &Path, format: OutputFormat) -> PathBuf {
        input.with_extension(format.extension())
    }

    pub fn build_invocation(&self, command: &TranscodeCommand) -> MediaResult<Invocation> {
        let dir = command
            .output()
            .parent()
            .ok_or_else(|| MediaError::internal("transcode output has no parent directory"))?;
        Ok(Invocation::new(&self.config.binary, dir, self.config.stage_timeout)
            .args(command.build_args())
            .output_limit(self.config.output_limit)
            .kill_grace(self.config.kill_grace)
            .limits(ResourceLimits {
                max_file_size: self.config.max_file_size,
                cpu_seconds: None,
            }))
    }

    async fn run(
        &self,
        input: &Path,
        format: OutputFormat,
        cancel: watch::Receiver<bool>,
    ) -> MediaResult<PathBuf> {
        if !input.is_file() {
            return Err(MediaError::FileNotFound(input.to_path_buf()));
        }
        let output = Self::output_path(input, format);
        if output == input {
            return Err(MediaError::internal(format!(
                "{} is already {}",
                input.display(),
                format
            )));
        }
        // An audio-only source has no picture to put in a video container.
        let source_class = input
            .extension()
            .and_then(|ext| ext.to_str())
            .and_then(OutputFormat::from_extension)
            .map(|f| f.media_class());
        if source_class == Some(MediaClass::Audio) && format.media_class() == MediaClass::Video {
            return Err(MediaError::stage_failed(
                self.config.binary.display().to_string(),
                format!("cannot convert audio-only {} into {}", input.display(), format),
                None,
                None,
            ));
        }

        let command = TranscodeCommand::for_format(input, &output, format);
        let invocation = self.build_invocation(&command)?;
        let result = ProcessRunner::new().with_cancel(cancel).run(&invocation).await?;
        result.require_success(Some(&output))?;
        Ok(output)
    }
}

#[async_trait]
impl Transcoder for TranscodeStage {
    async fn transcode(
        &self,
        input: &Path,
        format: OutputFormat,
        cancel: watch::Receiver<bool>,
    ) -> MediaResult<PathBuf> {
        let started = Instant::now();
        info!(input = %input.display(), format = %format, "Transcoding media");

        let result = self.run(input, format, cancel).await;
        histogram!("vfetch_stage_duration_seconds", "stage" => "transcode")
            .record(started.elapsed().as_secs_f64());

        match result {
            Ok(path) => {
                info!(output = %path.display(), "Transcode complete");
                Ok(path)
            }
            Err(e) => Err(MediaError::transcode_failed(e)),
        }
    }
}
