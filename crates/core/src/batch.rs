//! Batch jobs mixing still images and videos.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::image_io::{read_image, write_image};
use crate::pipeline::{FrameTransform, PipelineState};
use crate::upscaler::UpscaleError;
use crate::video::VideoJob;

pub const VIDEO_EXTENSIONS: [&str; 5] = ["mp4", "avi", "mov", "mkv", "webm"];
pub const IMAGE_EXTENSIONS: [&str; 5] = ["jpg", "jpeg", "png", "bmp", "webp"];

/// Extension used when a video output path has no video extension.
const DEFAULT_VIDEO_EXTENSION: &str = "mp4";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Image,
    Video,
}

fn lowercase_extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
}

/// Classify an input by its extension (case-insensitive).
pub fn classify(path: &Path) -> Option<MediaKind> {
    let ext = lowercase_extension(path)?;
    if VIDEO_EXTENSIONS.contains(&ext.as_str()) {
        Some(MediaKind::Video)
    } else if IMAGE_EXTENSIONS.contains(&ext.as_str()) {
        Some(MediaKind::Image)
    } else {
        None
    }
}

/// Output file format: keep the source's extension, or force one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum SaveFormat {
    #[default]
    Auto,
    Extension(String),
}

impl SaveFormat {
    pub fn parse(value: &str) -> Self {
        let trimmed = value.trim().trim_start_matches('.');
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("auto") {
            Self::Auto
        } else {
            Self::Extension(trimmed.to_ascii_lowercase())
        }
    }
}

impl From<String> for SaveFormat {
    fn from(value: String) -> Self {
        Self::parse(&value)
    }
}

impl From<SaveFormat> for String {
    fn from(value: SaveFormat) -> Self {
        match value {
            SaveFormat::Auto => "auto".to_string(),
            SaveFormat::Extension(ext) => ext,
        }
    }
}

/// Where the upscaled version of `input` goes.
///
/// With several inputs, or when `output` is an existing directory, the file
/// is named `<stem>_upscaled<ext>` inside that directory (or `output`'s
/// parent for a multi-input batch pointed at a file). A single input with a
/// file `output` is written to `output` as given.
pub fn output_path_for(
    input: &Path,
    output: &Path,
    total_inputs: usize,
    format: &SaveFormat,
) -> PathBuf {
    let extension = match format {
        SaveFormat::Auto => lowercase_extension(input),
        SaveFormat::Extension(ext) => Some(ext.clone()),
    };
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    let file_name = match &extension {
        Some(ext) => format!("{stem}_upscaled.{ext}"),
        None => format!("{stem}_upscaled"),
    };

    let mut target = if output.is_dir() {
        output.join(&file_name)
    } else if total_inputs > 1 {
        output
            .parent()
            .map(|dir| dir.join(&file_name))
            .unwrap_or_else(|| PathBuf::from(&file_name))
    } else {
        output.to_path_buf()
    };

    if classify(input) == Some(MediaKind::Video) && classify(&target) != Some(MediaKind::Video) {
        target.set_extension(DEFAULT_VIDEO_EXTENSION);
    }
    target
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileStatus {
    Done,
    Failed(String),
    Cancelled,
    Skipped,
}

#[derive(Debug, Clone)]
pub struct FileResult {
    pub input: PathBuf,
    pub output: PathBuf,
    pub status: FileStatus,
}

#[derive(Debug, Clone, Default)]
pub struct BatchSummary {
    pub results: Vec<FileResult>,
    pub cancelled: bool,
}

impl BatchSummary {
    pub fn count(&self, status: &FileStatus) -> usize {
        self.results.iter().filter(|r| &r.status == status).count()
    }

    pub fn failed(&self) -> usize {
        self.results
            .iter()
            .filter(|r| matches!(r.status, FileStatus::Failed(_)))
            .count()
    }
}

pub struct BatchRunner {
    video: VideoJob,
    save_format: SaveFormat,
    cancel: Arc<AtomicBool>,
}

impl BatchRunner {
    /// `cancel` must be the same flag the `video` job was built with.
    pub fn new(video: VideoJob, save_format: SaveFormat, cancel: Arc<AtomicBool>) -> Self {
        Self {
            video,
            save_format,
            cancel,
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// Process every input in order. `progress(file_index, percent)` starts
    /// at 0 for each file and reports 100 when a file completes; returning
    /// `false` cancels the batch.
    pub fn run<T, P>(
        &self,
        inputs: &[PathBuf],
        output: &Path,
        transform: &mut T,
        mut progress: P,
    ) -> BatchSummary
    where
        T: FrameTransform + Send + ?Sized,
        P: FnMut(usize, f64) -> bool + Send,
    {
        let mut summary = BatchSummary::default();
        let total = inputs.len();

        for (index, input) in inputs.iter().enumerate() {
            if self.is_cancelled() {
                break;
            }

            let target = output_path_for(input, output, total, &self.save_format);
            info!(
                file = index + 1,
                total,
                input = %input.display(),
                output = %target.display(),
                "Processing file"
            );
            if !progress(index, 0.0) {
                self.cancel.store(true, Ordering::SeqCst);
                break;
            }

            let status = match classify(input) {
                None => {
                    warn!(input = %input.display(), "Unsupported file type; skipping");
                    FileStatus::Skipped
                }
                Some(MediaKind::Image) => self.run_image(input, &target, transform),
                Some(MediaKind::Video) => self.run_video(input, &target, transform, |percent| {
                    progress(index, percent)
                }),
            };

            if status == FileStatus::Done {
                progress(index, 100.0);
            }
            let stop = status == FileStatus::Cancelled;
            summary.results.push(FileResult {
                input: input.clone(),
                output: target,
                status,
            });
            if stop {
                break;
            }
        }

        summary.cancelled = self.is_cancelled();
        info!(
            done = summary.count(&FileStatus::Done),
            failed = summary.failed(),
            skipped = summary.count(&FileStatus::Skipped),
            cancelled = summary.cancelled,
            "Batch finished"
        );
        summary
    }

    fn run_image<T>(&self, input: &Path, output: &Path, transform: &mut T) -> FileStatus
    where
        T: FrameTransform + ?Sized,
    {
        let frame = match read_image(input) {
            Ok(frame) => frame,
            Err(e) => {
                error!(input = %input.display(), error = %format!("{e:#}"), "Failed to read image");
                return FileStatus::Failed(format!("{e:#}"));
            }
        };

        let interrupt = || self.is_cancelled();
        match transform.transform(&frame, &interrupt) {
            Ok(upscaled) => match write_image(&upscaled, output) {
                Ok(()) => FileStatus::Done,
                Err(e) => {
                    error!(output = %output.display(), error = %format!("{e:#}"), "Failed to save image");
                    FileStatus::Failed(format!("{e:#}"))
                }
            },
            Err(UpscaleError::Cancelled) => {
                info!(input = %input.display(), "Image processing cancelled");
                FileStatus::Cancelled
            }
            Err(UpscaleError::Failed(e)) => {
                error!(input = %input.display(), error = %format!("{e:#}"), "Failed to upscale image");
                FileStatus::Failed(format!("{e:#}"))
            }
        }
    }

    fn run_video<T, P>(&self, input: &Path, output: &Path, transform: &mut T, progress: P) -> FileStatus
    where
        T: FrameTransform + Send + ?Sized,
        P: FnMut(f64) -> bool + Send,
    {
        match self.video.run(input, output, transform, progress) {
            Ok(outcome) => match outcome.state {
                PipelineState::Completed => FileStatus::Done,
                PipelineState::Cancelled => {
                    info!(input = %input.display(), "Video processing cancelled");
                    FileStatus::Cancelled
                }
                _ => {
                    let reason = outcome
                        .report
                        .error
                        .clone()
                        .unwrap_or_else(|| format!("encoder exit code {:?}", outcome.encoder.exit_code));
                    error!(input = %input.display(), %reason, "Video processing failed");
                    FileStatus::Failed(reason)
                }
            },
            Err(e) => {
                error!(input = %input.display(), error = %format!("{e:#}"), "Video processing failed");
                FileStatus::Failed(format!("{e:#}"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::EncoderConfig;
    use crate::pipeline::PipelineConfig;
    use crate::types::{ChannelOrder, Frame};

    #[test]
    fn test_classify_by_extension() {
        assert_eq!(classify(Path::new("clip.MKV")), Some(MediaKind::Video));
        assert_eq!(classify(Path::new("a/b/photo.jpeg")), Some(MediaKind::Image));
        assert_eq!(classify(Path::new("notes.txt")), None);
        assert_eq!(classify(Path::new("README")), None);
    }

    #[test]
    fn test_save_format_parse() {
        assert_eq!(SaveFormat::parse("Auto"), SaveFormat::Auto);
        assert_eq!(SaveFormat::parse(""), SaveFormat::Auto);
        assert_eq!(SaveFormat::parse(".PNG"), SaveFormat::Extension("png".into()));
    }

    #[test]
    fn test_single_input_uses_output_as_given() {
        let out = output_path_for(
            Path::new("in/photo.jpg"),
            Path::new("/nonexistent/result.png"),
            1,
            &SaveFormat::Auto,
        );
        assert_eq!(out, PathBuf::from("/nonexistent/result.png"));
    }

    #[test]
    fn test_directory_output_gets_suffixed_name() {
        let dir = tempfile::tempdir().unwrap();
        let out = output_path_for(Path::new("in/Photo.JPG"), dir.path(), 1, &SaveFormat::Auto);
        assert_eq!(out, dir.path().join("Photo_upscaled.jpg"));

        let out = output_path_for(
            Path::new("in/photo.jpg"),
            dir.path(),
            3,
            &SaveFormat::Extension("png".into()),
        );
        assert_eq!(out, dir.path().join("photo_upscaled.png"));
    }

    #[test]
    fn test_multi_input_with_file_output_uses_parent() {
        let out = output_path_for(
            Path::new("a.bmp"),
            Path::new("/nonexistent/dir/ignored.png"),
            2,
            &SaveFormat::Auto,
        );
        assert_eq!(out, PathBuf::from("/nonexistent/dir/a_upscaled.bmp"));
    }

    #[test]
    fn test_video_output_forced_to_mp4() {
        let out = output_path_for(
            Path::new("clip.mov"),
            Path::new("/nonexistent/out.png"),
            1,
            &SaveFormat::Auto,
        );
        assert_eq!(out, PathBuf::from("/nonexistent/out.mp4"));

        let dir = tempfile::tempdir().unwrap();
        let out = output_path_for(
            Path::new("clip.webm"),
            dir.path(),
            2,
            &SaveFormat::Extension("jpg".into()),
        );
        assert_eq!(out, dir.path().join("clip_upscaled.mp4"));

        let out = output_path_for(Path::new("clip.mkv"), dir.path(), 1, &SaveFormat::Auto);
        assert_eq!(out, dir.path().join("clip_upscaled.mkv"));
    }

    /// Pixel-doubling stand-in for the upscaler.
    struct Double;

    impl FrameTransform for Double {
        fn transform(
            &mut self,
            frame: &Frame,
            interrupt: &dyn Fn() -> bool,
        ) -> Result<Frame, UpscaleError> {
            if interrupt() {
                return Err(UpscaleError::Cancelled);
            }
            let src = frame.view();
            let (h, w, _) = src.dim();
            let out = ndarray::Array3::from_shape_fn((h * 2, w * 2, 3), |(y, x, c)| {
                src[[y / 2, x / 2, c]]
            });
            Ok(Frame::from_array(out, frame.channel_order())?)
        }

        fn output_dims(&self, width: u32, height: u32) -> (u32, u32) {
            (width * 2, height * 2)
        }
    }

    fn runner(cancel: Arc<AtomicBool>) -> BatchRunner {
        let video = VideoJob::new(
            PipelineConfig::default(),
            EncoderConfig::default(),
            cancel.clone(),
        );
        BatchRunner::new(video, SaveFormat::Auto, cancel)
    }

    fn write_sample(path: &Path) {
        let frame = Frame::new(vec![90u8; 5 * 4 * 3], 5, 4, ChannelOrder::Rgb).unwrap();
        write_image(&frame, path).unwrap();
    }

    #[test]
    fn test_image_batch_reports_progress_per_file() {
        let dir = tempfile::tempdir().unwrap();
        let inputs = vec![dir.path().join("a.png"), dir.path().join("b.bmp")];
        for input in &inputs {
            write_sample(input);
        }
        let out_dir = dir.path().join("out");
        std::fs::create_dir_all(&out_dir).unwrap();

        let mut events = Vec::new();
        let summary = runner(Arc::new(AtomicBool::new(false))).run(
            &inputs,
            &out_dir,
            &mut Double,
            |index, percent| {
                events.push((index, percent));
                true
            },
        );

        assert!(!summary.cancelled);
        assert_eq!(summary.count(&FileStatus::Done), 2);
        assert_eq!(events, vec![(0, 0.0), (0, 100.0), (1, 0.0), (1, 100.0)]);
        let upscaled = read_image(&out_dir.join("b_upscaled.bmp")).unwrap();
        assert_eq!((upscaled.width(), upscaled.height()), (10, 8));
    }

    #[test]
    fn test_unreadable_image_does_not_stop_batch() {
        let dir = tempfile::tempdir().unwrap();
        let broken = dir.path().join("broken.png");
        std::fs::write(&broken, b"not a png").unwrap();
        let good = dir.path().join("good.png");
        write_sample(&good);
        let skipped = dir.path().join("notes.txt");

        let summary = runner(Arc::new(AtomicBool::new(false))).run(
            &[broken, skipped, good],
            dir.path(),
            &mut Double,
            |_, _| true,
        );

        let statuses: Vec<&FileStatus> = summary.results.iter().map(|r| &r.status).collect();
        assert!(matches!(statuses[0], FileStatus::Failed(_)));
        assert_eq!(statuses[1], &FileStatus::Skipped);
        assert_eq!(statuses[2], &FileStatus::Done);
    }

    #[test]
    fn test_progress_false_cancels_batch() {
        let dir = tempfile::tempdir().unwrap();
        let inputs = vec![dir.path().join("a.png"), dir.path().join("b.png")];
        for input in &inputs {
            write_sample(input);
        }

        let cancel = Arc::new(AtomicBool::new(false));
        let summary = runner(cancel.clone()).run(&inputs, dir.path(), &mut Double, |_, _| false);

        assert!(summary.cancelled);
        assert!(summary.results.is_empty());
        assert!(cancel.load(Ordering::SeqCst));
        assert!(!dir.path().join("a_upscaled.png").exists());
    }
}
