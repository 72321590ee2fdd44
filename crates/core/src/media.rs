//! Media probing via `ffprobe` and raw frame decoding via `ffmpeg`.

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use std::process::{Child, Stdio};
use std::thread::{self, JoinHandle};

use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::types::{ChannelOrder, Frame};

const FALLBACK_FPS: &str = "30";

#[derive(Deserialize, Debug)]
struct FfprobeOutput {
    #[serde(default)]
    streams: Vec<FfprobeStream>,
    #[serde(default)]
    format: Option<FfprobeFormat>,
}

#[derive(Deserialize, Debug)]
struct FfprobeStream {
    index: usize,
    codec_type: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    r_frame_rate: Option<String>,
    avg_frame_rate: Option<String>,
    nb_frames: Option<String>,
    duration: Option<String>,
    #[serde(default)]
    disposition: HashMap<String, serde_json::Value>,
}

#[derive(Deserialize, Debug)]
struct FfprobeFormat {
    duration: Option<String>,
}

/// What the pipeline and encoder need to know about a video file.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaInfo {
    pub stream_index: usize,
    pub width: u32,
    pub height: u32,
    /// Frame rate exactly as ffprobe reported it, e.g. "30000/1001".
    pub fps: String,
    pub fps_value: f64,
    /// Best-effort total; zero when neither a count nor a duration is known.
    pub frame_count: u64,
    pub has_audio: bool,
}

fn parse_frame_rate(s: &str) -> Option<f64> {
    match s.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.trim().parse().ok()?;
            let den: f64 = den.trim().parse().ok()?;
            (den > 0.0 && num > 0.0).then(|| num / den)
        }
        None => s.trim().parse().ok().filter(|v: &f64| *v > 0.0),
    }
}

fn disposition_flag(stream: &FfprobeStream, key: &str) -> bool {
    stream
        .disposition
        .get(key)
        .and_then(|value| value.as_i64().map(|n| n != 0).or_else(|| value.as_bool()))
        .unwrap_or(false)
}

/// Default-disposition streams first, cover art last, then by index.
fn select_primary_video_stream(streams: &[FfprobeStream]) -> Option<&FfprobeStream> {
    streams
        .iter()
        .filter(|stream| stream.codec_type.as_deref() == Some("video"))
        .min_by_key(|stream| {
            (
                disposition_flag(stream, "attached_pic"),
                !disposition_flag(stream, "default"),
                stream.index,
            )
        })
}

fn parse_media_info(json: &[u8]) -> Result<MediaInfo> {
    let probe: FfprobeOutput =
        serde_json::from_slice(json).context("failed to parse ffprobe JSON output")?;

    let stream = select_primary_video_stream(&probe.streams)
        .ok_or_else(|| anyhow!("no video stream found"))?;
    let width = stream
        .width
        .filter(|w| *w > 0)
        .ok_or_else(|| anyhow!("video stream missing width"))?;
    let height = stream
        .height
        .filter(|h| *h > 0)
        .ok_or_else(|| anyhow!("video stream missing height"))?;

    let (fps, fps_value) = [stream.r_frame_rate.as_deref(), stream.avg_frame_rate.as_deref()]
        .into_iter()
        .flatten()
        .find_map(|raw| parse_frame_rate(raw).map(|value| (raw.to_string(), value)))
        .unwrap_or_else(|| {
            warn!(fallback = FALLBACK_FPS, "Could not determine frame rate");
            (FALLBACK_FPS.to_string(), 30.0)
        });

    let frame_count = match stream.nb_frames.as_deref().and_then(|n| n.parse::<u64>().ok()) {
        Some(n) if n > 0 => n,
        _ => {
            let duration = stream
                .duration
                .as_deref()
                .or(probe.format.as_ref().and_then(|f| f.duration.as_deref()))
                .and_then(|d| d.parse::<f64>().ok())
                .unwrap_or(0.0);
            (duration * fps_value).round().max(0.0) as u64
        }
    };

    let has_audio = probe
        .streams
        .iter()
        .any(|s| s.codec_type.as_deref() == Some("audio"));

    Ok(MediaInfo {
        stream_index: stream.index,
        width,
        height,
        fps,
        fps_value,
        frame_count,
        has_audio,
    })
}

/// Probe a media file with `ffprobe`.
pub fn probe(path: &Path) -> Result<MediaInfo> {
    let output = crate::runtime::command_for("ffprobe")
        .args([
            "-v",
            "quiet",
            "-print_format",
            "json",
            "-show_format",
            "-show_streams",
        ])
        .arg(path)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .context("failed to execute ffprobe; is FFmpeg installed?")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!(
            "ffprobe exited with status {} for {}: {}",
            output.status,
            path.display(),
            stderr.trim()
        );
    }

    let info = parse_media_info(&output.stdout)
        .with_context(|| format!("failed to probe {}", path.display()))?;
    debug!(
        path = %path.display(),
        width = info.width,
        height = info.height,
        fps = %info.fps,
        frames = info.frame_count,
        audio = info.has_audio,
        "Probed media"
    );
    Ok(info)
}

/// FFmpeg decode subprocess yielding packed 8-bit frames. Killed on [`Drop`].
pub struct VideoDecoder {
    child: Child,
    stderr_thread: Option<JoinHandle<()>>,
    width: u32,
    height: u32,
    order: ChannelOrder,
    frame_size: usize,
    done: bool,
}

impl VideoDecoder {
    /// Decoder arguments. Frames stay in stored orientation so their size
    /// matches the probed width and height even for rotated sources.
    pub fn build_args(path: &Path, info: &MediaInfo, order: ChannelOrder) -> Vec<String> {
        vec![
            "-nostdin".into(),
            "-v".into(),
            "error".into(),
            "-noautorotate".into(),
            "-i".into(),
            path.to_string_lossy().into_owned(),
            "-map".into(),
            format!("0:{}", info.stream_index),
            "-f".into(),
            "rawvideo".into(),
            "-pix_fmt".into(),
            order.ffmpeg_pix_fmt().into(),
            "pipe:1".into(),
        ]
    }

    pub fn open(path: &Path, info: &MediaInfo, order: ChannelOrder) -> Result<Self> {
        let args = Self::build_args(path, info, order);

        let mut child = crate::runtime::command_for("ffmpeg")
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .context("failed to launch ffmpeg decoder")?;

        let stderr_thread = child.stderr.take().map(|stderr| {
            thread::spawn(move || {
                for line in BufReader::new(stderr).lines() {
                    match line {
                        Ok(line) if !line.is_empty() => {
                            debug!(target: "ffmpeg_decode_stderr", "{}", line);
                        }
                        Err(_) => break,
                        _ => {}
                    }
                }
            })
        });

        Ok(Self {
            child,
            stderr_thread,
            width: info.width,
            height: info.height,
            order,
            frame_size: info.width as usize * info.height as usize * Frame::CHANNELS,
            done: false,
        })
    }

    fn read_frame(&mut self) -> Result<Option<Frame>> {
        let stdout = self
            .child
            .stdout
            .as_mut()
            .ok_or_else(|| anyhow!("decoder stdout not available"))?;

        let mut buf = vec![0u8; self.frame_size];
        let mut filled = 0;
        while filled < self.frame_size {
            match stdout.read(&mut buf[filled..]) {
                Ok(0) => {
                    if filled > 0 {
                        warn!(
                            "partial frame at EOF ({filled}/{} bytes), discarding",
                            self.frame_size
                        );
                    }
                    return Ok(None);
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e).context("failed to read frame from decoder"),
            }
        }

        Frame::new(buf, self.width, self.height, self.order).map(Some)
    }
}

impl Iterator for VideoDecoder {
    type Item = Result<Frame>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.read_frame() {
            Ok(Some(frame)) => Some(Ok(frame)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

impl Drop for VideoDecoder {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
        if let Some(handle) = self.stderr_thread.take() {
            let _ = handle.join();
        }
    }
}
