//! One video file end to end: probe, encoder, decoder, pipeline, finish.

use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::encoder::{EncodeRequest, EncoderConfig, EncoderHandle, EncoderOutcome};
use crate::media::{self, MediaInfo, VideoDecoder};
use crate::pipeline::{FrameTransform, PipelineConfig, PipelineReport, PipelineState, VideoPipeline};
use crate::types::ChannelOrder;

/// Decoder and encoder agree on this raw layout.
const FRAME_ORDER: ChannelOrder = ChannelOrder::Rgb;

#[derive(Debug, Clone)]
pub struct VideoOutcome {
    /// Pipeline state, downgraded to `Failed` when the encoder failed.
    pub state: PipelineState,
    pub report: PipelineReport,
    pub encoder: EncoderOutcome,
    /// Whether the final attempt muxed the source audio.
    pub with_audio: bool,
}

pub struct VideoJob {
    pipeline: PipelineConfig,
    encoder: EncoderConfig,
    cancel: Arc<AtomicBool>,
}

impl VideoJob {
    pub fn new(pipeline: PipelineConfig, encoder: EncoderConfig, cancel: Arc<AtomicBool>) -> Self {
        Self {
            pipeline,
            encoder,
            cancel,
        }
    }

    /// Upscale `input` into `output`.
    ///
    /// When the encoder exits non-zero with the source audio mapped and
    /// `retry_without_audio` is set, the whole job runs once more without
    /// audio. `progress` restarts from zero on the retry.
    pub fn run<T, P>(
        &self,
        input: &Path,
        output: &Path,
        transform: &mut T,
        mut progress: P,
    ) -> Result<VideoOutcome>
    where
        T: FrameTransform + Send + ?Sized,
        P: FnMut(f64) -> bool + Send,
    {
        let info = media::probe(input)?;
        let with_audio = self.encoder.keep_audio && info.has_audio;

        let outcome = self.attempt(input, output, &info, transform, &mut progress, with_audio)?;
        let retry = with_audio
            && self.encoder.retry_without_audio
            && !outcome.encoder.success
            && outcome.report.state != PipelineState::Cancelled;
        if !retry {
            return Ok(outcome);
        }

        warn!(
            input = %input.display(),
            exit_code = ?outcome.encoder.exit_code,
            "Encoder failed with audio mapped; retrying without audio"
        );
        self.attempt(input, output, &info, transform, &mut progress, false)
    }

    fn attempt<T, P>(
        &self,
        input: &Path,
        output: &Path,
        info: &MediaInfo,
        transform: &mut T,
        progress: &mut P,
        with_audio: bool,
    ) -> Result<VideoOutcome>
    where
        T: FrameTransform + Send + ?Sized,
        P: FnMut(f64) -> bool + Send,
    {
        let (width, height) = transform.output_dims(info.width, info.height);
        info!(
            input = %input.display(),
            output = %output.display(),
            source = %format!("{}x{}", info.width, info.height),
            target = %format!("{width}x{height}"),
            fps = %info.fps,
            frames = info.frame_count,
            with_audio,
            "Starting video job"
        );

        let request = EncodeRequest {
            output_path: output.to_path_buf(),
            fps: info.fps.clone(),
            width,
            height,
            input_order: FRAME_ORDER,
            audio_source: with_audio.then(|| input.to_path_buf()),
        };
        let mut encoder = EncoderHandle::start(&self.encoder, &request)?;
        let encoder_input = encoder.take_input()?;
        let decoder = VideoDecoder::open(input, info, FRAME_ORDER)
            .with_context(|| format!("failed to open decoder for {}", input.display()))?;

        let mut pipeline = VideoPipeline::with_cancel_flag(self.pipeline.clone(), self.cancel.clone());
        let report = pipeline.run(decoder, transform, encoder_input, info.frame_count, |percent| {
            progress(percent)
        });

        // Stdin is already closed by the sink; let the encoder finalize
        // whatever it received, even for a cancelled run.
        let encoder_outcome = encoder.finish()?;

        let state = match report.state {
            PipelineState::Completed if !encoder_outcome.success => PipelineState::Failed,
            other => other,
        };

        Ok(VideoOutcome {
            state,
            report,
            encoder: encoder_outcome,
            with_audio,
        })
    }
}
