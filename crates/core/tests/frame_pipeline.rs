use std::io::{self, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use ndarray::Array4;

use upscaler_core::backend::InferenceBackend;
use upscaler_core::budget::TileBudget;
use upscaler_core::engine::{InferenceEngine, PatchTensor, Precision};
use upscaler_core::pipeline::{PipelineConfig, PipelineState, VideoPipeline};
use upscaler_core::types::{ChannelOrder, Frame};
use upscaler_core::upscaler::TileUpscaler;

struct SlowNearest {
    delay: Duration,
}

impl InferenceEngine for SlowNearest {
    fn scale(&self) -> usize {
        2
    }

    fn precision(&self) -> Precision {
        Precision::F32
    }

    fn backend(&self) -> InferenceBackend {
        InferenceBackend::Cpu
    }

    fn infer(&mut self, input: PatchTensor) -> Result<PatchTensor> {
        std::thread::sleep(self.delay);
        let PatchTensor::F32(arr) = input else {
            anyhow::bail!("expected f32");
        };
        let (n, c, h, w) = arr.dim();
        Ok(PatchTensor::F32(Array4::from_shape_fn(
            (n, c, h * 2, w * 2),
            |(b, ch, y, x)| arr[[b, ch, y / 2, x / 2]],
        )))
    }
}

/// Collects written bytes and counts how often it was dropped.
#[derive(Clone, Default)]
struct SharedSink {
    bytes: Arc<Mutex<Vec<u8>>>,
    closes: Arc<AtomicUsize>,
}

struct SinkWriter(SharedSink);

impl Write for SinkWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.bytes.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for SinkWriter {
    fn drop(&mut self) {
        self.0.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// 4x3 frame filled with `tag`.
fn tagged(tag: u8) -> Frame {
    Frame::new(vec![tag; 4 * 3 * 3], 4, 3, ChannelOrder::Rgb).unwrap()
}

fn config() -> PipelineConfig {
    PipelineConfig {
        queue_capacity: 3,
        poll_interval_ms: 10,
    }
}

#[test]
fn upscaled_frames_reach_the_sink_in_order() {
    let sink = SharedSink::default();
    let mut upscaler = TileUpscaler::new(
        SlowNearest {
            delay: Duration::from_millis(1),
        },
        TileBudget::from_tile_side(256),
        16,
    );
    let mut pipeline = VideoPipeline::new(config());
    let mut percents = Vec::new();

    let report = pipeline.run(
        (1..=40u8).map(|i| Ok(tagged(i))),
        &mut upscaler,
        SinkWriter(sink.clone()),
        40,
        |p| {
            percents.push(p);
            true
        },
    );

    assert_eq!(report.state, PipelineState::Completed);
    assert_eq!(report.written, 40);
    assert_eq!(sink.closes.load(Ordering::SeqCst), 1);

    let bytes = sink.bytes.lock().unwrap();
    let frame_len = 8 * 6 * 3;
    assert_eq!(bytes.len(), 40 * frame_len);
    for (i, chunk) in bytes.chunks(frame_len).enumerate() {
        assert!(chunk.iter().all(|b| *b == i as u8 + 1), "frame {} out of order", i + 1);
    }
    assert_eq!(percents.last().copied(), Some(100.0));
    assert!(percents.windows(2).all(|w| w[0] <= w[1]));
}

#[test]
fn cancel_from_progress_stops_endless_source_promptly() {
    let sink = SharedSink::default();
    let per_tile = Duration::from_millis(5);
    let mut upscaler = TileUpscaler::new(
        SlowNearest { delay: per_tile },
        TileBudget::from_tile_side(256),
        16,
    );
    let config = config();
    let poll = config.poll_interval();
    let mut pipeline = VideoPipeline::new(config);
    let mut cancelled_at = None;

    let report = pipeline.run(
        std::iter::repeat_with(|| Ok(tagged(7))),
        &mut upscaler,
        SinkWriter(sink.clone()),
        0,
        {
            let mut calls = 0;
            let cancelled_at = &mut cancelled_at;
            move |_| {
                calls += 1;
                if calls < 5 {
                    return true;
                }
                *cancelled_at = Some(Instant::now());
                false
            }
        },
    );
    let shutdown = cancelled_at.expect("cancel was requested").elapsed();

    assert_eq!(report.state, PipelineState::Cancelled);
    assert_eq!(report.written, 5);
    assert_eq!(sink.closes.load(Ordering::SeqCst), 1);
    assert!(pipeline.cancel_flag().load(Ordering::SeqCst));
    // Every stage polls the flag once per interval; the transform may be
    // mid-tile when it flips.
    assert!(
        shutdown <= poll * 10 + per_tile,
        "shutdown took {shutdown:?}"
    );
}
