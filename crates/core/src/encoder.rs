//! External encoder bridge: an FFmpeg subprocess fed raw frames on stdin.
//!
//! The encoder muxes the optional audio track of the original file and copies
//! it without re-encoding. Stdin is handed to the pipeline's sink stage, so
//! the sink decides when the encoder sees end-of-input; [`EncoderHandle::finish`]
//! then waits for the process and reports its exit status.

use std::collections::VecDeque;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Stdio};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::types::ChannelOrder;

/// Stderr lines kept for the outcome report.
const STDERR_TAIL_LINES: usize = 20;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    /// Encoder executable, resolved through the bundled-binary search.
    pub program: String,
    /// Video codec (e.g. "libx264").
    pub codec: String,
    /// Constant Rate Factor.
    pub crf: u32,
    /// Encoder speed preset; `None` leaves the codec default.
    pub preset: Option<String>,
    /// Output pixel format (e.g. "yuv420p").
    pub pixel_format: String,
    /// Copy the source's audio track into the output.
    pub keep_audio: bool,
    /// Re-run a job without audio when the encoder fails with audio mapped.
    pub retry_without_audio: bool,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            program: "ffmpeg".to_string(),
            codec: "libx264".to_string(),
            crf: 18,
            preset: Some("medium".to_string()),
            pixel_format: "yuv420p".to_string(),
            keep_audio: true,
            retry_without_audio: true,
        }
    }
}

/// What to encode: one output file from a stream of raw frames.
#[derive(Debug, Clone)]
pub struct EncodeRequest {
    pub output_path: PathBuf,
    /// Frame rate as given by the prober, e.g. "24000/1001" or "25".
    pub fps: String,
    pub width: u32,
    pub height: u32,
    pub input_order: ChannelOrder,
    /// File whose first audio track (if any) is copied into the output.
    pub audio_source: Option<PathBuf>,
}

impl EncoderConfig {
    pub fn build_args(&self, request: &EncodeRequest) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "-nostdin".into(),
            "-y".into(),
            "-f".into(),
            "rawvideo".into(),
            "-pix_fmt".into(),
            request.input_order.ffmpeg_pix_fmt().into(),
            "-s".into(),
            format!("{}x{}", request.width, request.height),
            "-r".into(),
            request.fps.clone(),
            "-i".into(),
            "pipe:0".into(),
        ];

        match &request.audio_source {
            Some(source) => args.extend([
                "-i".into(),
                source.to_string_lossy().into_owned(),
                "-map".into(),
                "0:v".into(),
                "-map".into(),
                "1:a?".into(),
            ]),
            None => args.extend(["-map".into(), "0:v".into()]),
        }

        args.extend(["-c:v".into(), self.codec.clone()]);
        if let Some(preset) = &self.preset {
            args.extend(["-preset".into(), preset.clone()]);
        }
        args.extend([
            "-crf".into(),
            self.crf.to_string(),
            "-pix_fmt".into(),
            self.pixel_format.clone(),
        ]);
        if request.audio_source.is_some() {
            args.extend(["-c:a".into(), "copy".into()]);
        }

        args.push(request.output_path.to_string_lossy().into_owned());
        args
    }
}

/// Exit report of a finished encoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderOutcome {
    pub success: bool,
    pub exit_code: Option<i32>,
    /// Last lines the encoder wrote to stderr.
    pub stderr_tail: Vec<String>,
}

/// Running encoder process. Killed on [`Drop`] unless finished.
pub struct EncoderHandle {
    child: Child,
    stdin: Option<ChildStdin>,
    stderr_thread: Option<JoinHandle<()>>,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
    finished: bool,
}

impl EncoderHandle {
    pub fn start(config: &EncoderConfig, request: &EncodeRequest) -> Result<Self> {
        let mut request = request.clone();
        if let Some(source) = &request.audio_source {
            if !source.is_file() {
                warn!(
                    source = %source.display(),
                    "Audio source does not exist; encoding without audio"
                );
                request.audio_source = None;
            }
        }

        let args = config.build_args(&request);
        debug!(
            cmd = %format!("{} {}", config.program, args.join(" ")),
            "Launching encoder"
        );

        let mut child = crate::runtime::command_for(&config.program)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to launch encoder '{}'", config.program))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("failed to open encoder stdin"))?;

        let stderr_tail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));
        let stderr_thread = child.stderr.take().map(|stderr| {
            let tail = stderr_tail.clone();
            thread::spawn(move || {
                let reader = BufReader::new(stderr);
                for line in reader.lines() {
                    match line {
                        Ok(line) if !line.is_empty() => {
                            debug!(target: "ffmpeg_encode_stderr", "{}", line);
                            if let Ok(mut tail) = tail.lock() {
                                if tail.len() == STDERR_TAIL_LINES {
                                    tail.pop_front();
                                }
                                tail.push_back(line);
                            }
                        }
                        Err(e) => {
                            debug!(target: "ffmpeg_encode_stderr", "read error: {}", e);
                            break;
                        }
                        _ => {}
                    }
                }
            })
        });

        info!(
            output = %request.output_path.display(),
            width = request.width,
            height = request.height,
            fps = %request.fps,
            codec = %config.codec,
            crf = config.crf,
            audio = request.audio_source.is_some(),
            "Encoder started"
        );

        Ok(Self {
            child,
            stdin: Some(stdin),
            stderr_thread,
            stderr_tail,
            finished: false,
        })
    }

    /// Hand over the encoder's stdin. Dropping it signals end-of-input.
    pub fn take_input(&mut self) -> Result<ChildStdin> {
        self.stdin
            .take()
            .ok_or_else(|| anyhow!("encoder input already taken"))
    }

    /// Close stdin if still held, wait for exit and report the status.
    ///
    /// A non-zero exit is returned in the outcome, not as an error.
    pub fn finish(mut self) -> Result<EncoderOutcome> {
        drop(self.stdin.take());
        let status = self.child.wait().context("failed to wait for encoder")?;
        self.finished = true;
        self.join_stderr();

        let outcome = EncoderOutcome {
            success: status.success(),
            exit_code: status.code(),
            stderr_tail: self.stderr_lines(),
        };
        if outcome.success {
            debug!("Encoder finished successfully");
        } else {
            warn!(
                exit_code = ?outcome.exit_code,
                stderr = %outcome.stderr_tail.join("\n"),
                "Encoder exited with failure"
            );
        }
        Ok(outcome)
    }

    /// Hard stop. The process is reaped; later calls are no-ops.
    pub fn kill(&mut self) {
        if self.finished {
            return;
        }
        drop(self.stdin.take());
        let _ = self.child.kill();
        let _ = self.child.wait();
        self.finished = true;
        self.join_stderr();
    }

    fn join_stderr(&mut self) {
        if let Some(handle) = self.stderr_thread.take() {
            let _ = handle.join();
        }
    }

    fn stderr_lines(&self) -> Vec<String> {
        self.stderr_tail
            .lock()
            .map(|tail| tail.iter().cloned().collect())
            .unwrap_or_default()
    }
}

impl Drop for EncoderHandle {
    fn drop(&mut self) {
        self.kill();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(audio: Option<PathBuf>) -> EncodeRequest {
        EncodeRequest {
            output_path: PathBuf::from("/tmp/out.mp4"),
            fps: "24000/1001".to_string(),
            width: 1920,
            height: 1080,
            input_order: ChannelOrder::Rgb,
            audio_source: audio,
        }
    }

    fn arg_after<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
        args.iter()
            .position(|a| a == flag)
            .and_then(|i| args.get(i + 1))
            .map(String::as_str)
    }

    #[test]
    fn test_args_without_audio() {
        let args = EncoderConfig::default().build_args(&request(None));
        assert_eq!(arg_after(&args, "-f"), Some("rawvideo"));
        assert_eq!(arg_after(&args, "-pix_fmt"), Some("rgb24"));
        assert_eq!(arg_after(&args, "-s"), Some("1920x1080"));
        assert_eq!(arg_after(&args, "-r"), Some("24000/1001"));
        assert_eq!(arg_after(&args, "-i"), Some("pipe:0"));
        assert_eq!(arg_after(&args, "-map"), Some("0:v"));
        assert_eq!(arg_after(&args, "-c:v"), Some("libx264"));
        assert_eq!(arg_after(&args, "-crf"), Some("18"));
        assert_eq!(arg_after(&args, "-preset"), Some("medium"));
        assert!(!args.contains(&"-c:a".to_string()));
        assert!(!args.contains(&"1:a?".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("/tmp/out.mp4"));
    }

    #[test]
    fn test_args_with_optional_audio_map() {
        let args = EncoderConfig::default().build_args(&request(Some(PathBuf::from("in.mkv"))));
        let inputs: Vec<&String> = args
            .iter()
            .enumerate()
            .filter(|(i, _)| *i > 0 && args[i - 1] == "-i")
            .map(|(_, a)| a)
            .collect();
        assert_eq!(inputs, vec!["pipe:0", "in.mkv"]);
        assert!(args.windows(2).any(|w| w[0] == "-map" && w[1] == "1:a?"));
        assert_eq!(arg_after(&args, "-c:a"), Some("copy"));
    }

    #[test]
    fn test_args_bgr_input_and_output_pix_fmt() {
        let mut req = request(None);
        req.input_order = ChannelOrder::Bgr;
        let config = EncoderConfig {
            pixel_format: "yuv444p".to_string(),
            preset: None,
            ..EncoderConfig::default()
        };
        let args = config.build_args(&req);
        let pix_fmts: Vec<&str> = args
            .windows(2)
            .filter(|w| w[0] == "-pix_fmt")
            .map(|w| w[1].as_str())
            .collect();
        assert_eq!(pix_fmts, vec!["bgr24", "yuv444p"]);
        assert!(!args.contains(&"-preset".to_string()));
    }

    #[test]
    fn test_start_fails_for_missing_program() {
        let config = EncoderConfig {
            program: "definitely-not-an-encoder".to_string(),
            ..EncoderConfig::default()
        };
        let err = EncoderHandle::start(&config, &request(None))
            .err()
            .expect("should fail");
        assert!(err.to_string().contains("failed to launch encoder"));
    }

    #[test]
    fn test_config_toml_defaults() {
        let config: EncoderConfig = toml::from_str("crf = 23").unwrap();
        assert_eq!(config.crf, 23);
        assert_eq!(config.codec, "libx264");
        assert!(config.keep_audio);
    }

    #[test]
    fn test_finish_reports_exit_status() {
        let ok = EncoderConfig {
            program: "true".to_string(),
            ..EncoderConfig::default()
        };
        let outcome = EncoderHandle::start(&ok, &request(None))
            .unwrap()
            .finish()
            .unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.exit_code, Some(0));

        let failing = EncoderConfig {
            program: "false".to_string(),
            ..EncoderConfig::default()
        };
        let outcome = EncoderHandle::start(&failing, &request(None))
            .unwrap()
            .finish()
            .unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.exit_code, Some(1));
    }

    #[cfg(unix)]
    #[test]
    fn test_take_input_only_once() {
        let config = EncoderConfig {
            program: "true".to_string(),
            ..EncoderConfig::default()
        };
        let mut handle = EncoderHandle::start(&config, &request(None)).unwrap();
        let input = handle.take_input().unwrap();
        assert!(handle.take_input().is_err());
        drop(input);
        assert!(handle.finish().unwrap().success);
    }
}
