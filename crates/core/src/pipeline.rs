//! Three-stage video pipeline: source → transform → sink.
//!
//! Each stage runs on its own OS thread and the stages are connected by two
//! bounded queues. Every blocking wait is a timed poll so that all stages
//! notice cancellation within one poll interval. The calling thread blocks
//! until all three stages have been joined.

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::types::Frame;
use crate::upscaler::UpscaleError;

pub const DEFAULT_QUEUE_CAPACITY: usize = 5;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub queue_capacity: usize,
    pub poll_interval_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
        }
    }
}

impl PipelineConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    fn capacity(&self) -> usize {
        self.queue_capacity.max(1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Running,
    Cancelled,
    Completed,
    Failed,
}

/// A decoded frame tagged with its 1-based position in the source.
#[derive(Debug)]
pub struct PipelineJob {
    pub sequence: u64,
    pub frame: Frame,
}

enum Message {
    Job(PipelineJob),
    EndOfStream,
}

/// Per-frame work done by the transform stage.
pub trait FrameTransform {
    /// `interrupt` turns true once the pipeline is stopping; long-running
    /// transforms should poll it and return [`UpscaleError::Cancelled`].
    fn transform(
        &mut self,
        frame: &Frame,
        interrupt: &dyn Fn() -> bool,
    ) -> Result<Frame, UpscaleError>;

    /// Size of the frames produced for `width` x `height` input.
    fn output_dims(&self, width: u32, height: u32) -> (u32, u32) {
        (width, height)
    }
}

impl<T: FrameTransform + ?Sized> FrameTransform for &mut T {
    fn transform(
        &mut self,
        frame: &Frame,
        interrupt: &dyn Fn() -> bool,
    ) -> Result<Frame, UpscaleError> {
        (**self).transform(frame, interrupt)
    }

    fn output_dims(&self, width: u32, height: u32) -> (u32, u32) {
        (**self).output_dims(width, height)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineReport {
    pub state: PipelineState,
    pub decoded: u64,
    pub transformed: u64,
    pub dropped: u64,
    pub written: u64,
    /// First stage error, if the run failed.
    pub error: Option<String>,
}

/// Flags observed by every stage.
struct StopSignals<'a> {
    /// User cancellation, shared with the caller.
    cancel: &'a AtomicBool,
    /// Set by a failing stage so the others wind down.
    abort: &'a AtomicBool,
}

impl StopSignals<'_> {
    fn should_stop(&self) -> bool {
        self.cancel.load(Ordering::SeqCst) || self.abort.load(Ordering::SeqCst)
    }
}

pub struct VideoPipeline {
    config: PipelineConfig,
    cancel: Arc<AtomicBool>,
    state: PipelineState,
}

impl VideoPipeline {
    pub fn new(config: PipelineConfig) -> Self {
        Self::with_cancel_flag(config, Arc::new(AtomicBool::new(false)))
    }

    /// Share an externally owned cancellation flag (e.g. a Ctrl-C handler).
    pub fn with_cancel_flag(config: PipelineConfig, cancel: Arc<AtomicBool>) -> Self {
        Self {
            config,
            cancel,
            state: PipelineState::Idle,
        }
    }

    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Drive `source` through `transform` into `sink` until the source is
    /// exhausted, the run is cancelled, or a stage fails.
    ///
    /// `sink` is owned by the sink stage and dropped when it exits, on every
    /// path. `progress` receives `written / total_frames * 100` after each
    /// written frame; returning `false` cancels the run.
    pub fn run<D, T, W, P>(
        &mut self,
        source: D,
        transform: &mut T,
        sink: W,
        total_frames: u64,
        mut progress: P,
    ) -> PipelineReport
    where
        D: Iterator<Item = Result<Frame>> + Send,
        T: FrameTransform + Send + ?Sized,
        W: Write + Send,
        P: FnMut(f64) -> bool + Send,
    {
        self.state = PipelineState::Running;
        let started = Instant::now();
        let poll = self.config.poll_interval();
        let capacity = self.config.capacity();
        let abort = AtomicBool::new(false);
        let signals = StopSignals {
            cancel: &self.cancel,
            abort: &abort,
        };

        debug!(
            total_frames,
            queue_capacity = capacity,
            poll_ms = poll.as_millis() as u64,
            "Starting video pipeline"
        );

        let (decoded_tx, decoded_rx) = bounded::<Message>(capacity);
        let (upscaled_tx, upscaled_rx) = bounded::<Message>(capacity);

        let mut errors: Vec<anyhow::Error> = Vec::new();
        let mut report = PipelineReport {
            state: PipelineState::Running,
            decoded: 0,
            transformed: 0,
            dropped: 0,
            written: 0,
            error: None,
        };
        let mut reached_end = false;

        thread::scope(|scope| {
            let signals = &signals;

            let source_handle = thread::Builder::new()
                .name("pipeline-source".to_string())
                .spawn_scoped(scope, move || run_source(source, decoded_tx, signals, poll));
            let transform_handle = thread::Builder::new()
                .name("pipeline-transform".to_string())
                .spawn_scoped(scope, move || {
                    run_transform(transform, decoded_rx, upscaled_tx, signals, poll)
                });
            let sink_handle = thread::Builder::new()
                .name("pipeline-sink".to_string())
                .spawn_scoped(scope, move || {
                    run_sink(sink, upscaled_rx, signals, poll, total_frames, &mut progress)
                });

            match join_stage("source", source_handle, signals) {
                Ok(decoded) => report.decoded = decoded,
                Err(e) => errors.push(e),
            }
            match join_stage("transform", transform_handle, signals) {
                Ok(stats) => {
                    report.transformed = stats.transformed;
                    report.dropped = stats.dropped;
                }
                Err(e) => errors.push(e),
            }
            match join_stage("sink", sink_handle, signals) {
                Ok(stats) => {
                    report.written = stats.written;
                    reached_end = stats.reached_end;
                }
                Err(e) => errors.push(e),
            }
        });

        // A cancel raised after the sink saw end of stream changes nothing.
        let state = if !errors.is_empty() {
            PipelineState::Failed
        } else if !reached_end && self.cancel.load(Ordering::SeqCst) {
            PipelineState::Cancelled
        } else {
            PipelineState::Completed
        };
        self.state = state;
        report.state = state;
        report.error = errors.first().map(|e| format!("{e:#}"));

        info!(
            state = ?state,
            decoded = report.decoded,
            transformed = report.transformed,
            dropped = report.dropped,
            written = report.written,
            elapsed_secs = format!("{:.2}", started.elapsed().as_secs_f64()),
            "Video pipeline finished"
        );
        for error in &errors {
            warn!(error = %format!("{error:#}"), "Pipeline stage failed");
        }

        report
    }
}

fn join_stage<R>(
    stage: &str,
    spawned: std::io::Result<thread::ScopedJoinHandle<'_, Result<R>>>,
    signals: &StopSignals<'_>,
) -> Result<R> {
    let handle = match spawned {
        Ok(handle) => handle,
        Err(e) => {
            signals.abort.store(true, Ordering::SeqCst);
            return Err(anyhow!(e).context(format!("failed to spawn {stage} stage")));
        }
    };
    match handle.join() {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(e.context(format!("{stage} stage failed"))),
        Err(panic) => {
            signals.abort.store(true, Ordering::SeqCst);
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(anyhow!("{stage} stage panicked: {message}"))
        }
    }
}

/// Push with a timed retry; `false` means the pipeline is stopping or the
/// receiver is gone.
fn send_polling(
    tx: &Sender<Message>,
    mut message: Message,
    signals: &StopSignals<'_>,
    poll: Duration,
) -> bool {
    loop {
        if signals.should_stop() {
            return false;
        }
        match tx.send_timeout(message, poll) {
            Ok(()) => return true,
            Err(SendTimeoutError::Timeout(returned)) => message = returned,
            Err(SendTimeoutError::Disconnected(_)) => return false,
        }
    }
}

/// Pop with a timed retry; `None` means the pipeline is stopping or the
/// sender is gone.
fn recv_polling(
    rx: &Receiver<Message>,
    signals: &StopSignals<'_>,
    poll: Duration,
) -> Option<Message> {
    loop {
        if signals.should_stop() {
            return None;
        }
        match rx.recv_timeout(poll) {
            Ok(message) => return Some(message),
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => return None,
        }
    }
}

fn abort_on_error<R>(result: Result<R>, signals: &StopSignals<'_>) -> Result<R> {
    if result.is_err() {
        signals.abort.store(true, Ordering::SeqCst);
    }
    result
}

fn run_source<D>(
    frames: D,
    tx: Sender<Message>,
    signals: &StopSignals<'_>,
    poll: Duration,
) -> Result<u64>
where
    D: Iterator<Item = Result<Frame>>,
{
    let result = (|| -> Result<u64> {
        let mut decoded = 0_u64;
        let mut total_decode_ms = 0.0_f64;
        let mut total_send_ms = 0.0_f64;
        let mut frames = frames;

        loop {
            if signals.should_stop() {
                break;
            }

            let t_decode = Instant::now();
            let Some(frame_result) = frames.next() else {
                send_polling(&tx, Message::EndOfStream, signals, poll);
                break;
            };
            let sequence = decoded + 1;
            let frame = frame_result.with_context(|| format!("failed to decode frame {sequence}"))?;
            total_decode_ms += t_decode.elapsed().as_secs_f64() * 1000.0;
            decoded = sequence;

            let t_send = Instant::now();
            if !send_polling(&tx, Message::Job(PipelineJob { sequence, frame }), signals, poll) {
                break;
            }
            total_send_ms += t_send.elapsed().as_secs_f64() * 1000.0;
        }

        if decoded > 0 {
            info!(
                frames = decoded,
                avg_decode_ms = format!("{:.1}", total_decode_ms / decoded as f64),
                avg_send_wait_ms = format!("{:.1}", total_send_ms / decoded as f64),
                total_decode_ms = format!("{:.0}", total_decode_ms),
                "Source stage summary"
            );
        }
        Ok(decoded)
    })();
    abort_on_error(result, signals)
}

#[derive(Debug, Default)]
struct TransformStats {
    transformed: u64,
    dropped: u64,
}

fn run_transform<T>(
    transform: &mut T,
    rx: Receiver<Message>,
    tx: Sender<Message>,
    signals: &StopSignals<'_>,
    poll: Duration,
) -> Result<TransformStats>
where
    T: FrameTransform + ?Sized,
{
    let mut stats = TransformStats::default();
    let mut total_recv_ms = 0.0_f64;
    let mut total_process_ms = 0.0_f64;
    let mut total_send_ms = 0.0_f64;
    let interrupt = || signals.should_stop();

    loop {
        let t_recv = Instant::now();
        let Some(message) = recv_polling(&rx, signals, poll) else {
            break;
        };
        total_recv_ms += t_recv.elapsed().as_secs_f64() * 1000.0;

        let job = match message {
            Message::EndOfStream => {
                send_polling(&tx, Message::EndOfStream, signals, poll);
                break;
            }
            Message::Job(job) => job,
        };

        let t_process = Instant::now();
        let result = transform.transform(&job.frame, &interrupt);
        total_process_ms += t_process.elapsed().as_secs_f64() * 1000.0;

        match result {
            Ok(frame) => {
                stats.transformed += 1;
                let t_send = Instant::now();
                let upscaled = PipelineJob {
                    sequence: job.sequence,
                    frame,
                };
                if !send_polling(&tx, Message::Job(upscaled), signals, poll) {
                    break;
                }
                total_send_ms += t_send.elapsed().as_secs_f64() * 1000.0;
            }
            Err(UpscaleError::Cancelled) => {
                debug!(sequence = job.sequence, "Transform interrupted");
                break;
            }
            Err(UpscaleError::Failed(error)) => {
                stats.dropped += 1;
                warn!(
                    sequence = job.sequence,
                    error = %format!("{error:#}"),
                    "Frame transform failed; dropping frame"
                );
            }
        }
    }

    let processed = stats.transformed + stats.dropped;
    if processed > 0 {
        info!(
            frames = stats.transformed,
            dropped = stats.dropped,
            avg_recv_wait_ms = format!("{:.1}", total_recv_ms / processed as f64),
            avg_process_ms = format!("{:.1}", total_process_ms / processed as f64),
            avg_send_wait_ms = format!("{:.1}", total_send_ms / processed as f64),
            total_process_ms = format!("{:.0}", total_process_ms),
            "Transform stage summary"
        );
    }

    Ok(stats)
}

#[derive(Debug, Default)]
struct SinkStats {
    written: u64,
    reached_end: bool,
}

fn run_sink<W, P>(
    mut writer: W,
    rx: Receiver<Message>,
    signals: &StopSignals<'_>,
    poll: Duration,
    total_frames: u64,
    progress: &mut P,
) -> Result<SinkStats>
where
    W: Write,
    P: FnMut(f64) -> bool,
{
    let result = (|| -> Result<SinkStats> {
        let mut written = 0_u64;
        let mut reached_end = false;
        let mut total_write_ms = 0.0_f64;

        while let Some(message) = recv_polling(&rx, signals, poll) {
            let job = match message {
                Message::EndOfStream => {
                    reached_end = true;
                    break;
                }
                Message::Job(job) => job,
            };

            let t_write = Instant::now();
            writer
                .write_all(job.frame.as_bytes())
                .and_then(|()| writer.flush())
                .with_context(|| format!("failed to write frame {} to encoder", job.sequence))?;
            total_write_ms += t_write.elapsed().as_secs_f64() * 1000.0;
            written += 1;

            if !progress(progress_percent(written, total_frames)) {
                info!(written, "Progress callback requested cancellation");
                signals.cancel.store(true, Ordering::SeqCst);
                break;
            }
        }

        if written > 0 {
            info!(
                frames = written,
                avg_write_ms = format!("{:.1}", total_write_ms / written as f64),
                total_write_ms = format!("{:.0}", total_write_ms),
                "Sink stage summary"
            );
        }
        Ok(SinkStats {
            written,
            reached_end,
        })
    })();

    // Closing the encoder input is what lets the encoder finish.
    drop(writer);
    debug!("Encoder input closed");
    abort_on_error(result, signals)
}

fn progress_percent(written: u64, total_frames: u64) -> f64 {
    if total_frames == 0 {
        return 0.0;
    }
    (written as f64 / total_frames as f64 * 100.0).min(100.0)
}
