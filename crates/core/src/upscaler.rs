//! Whole-image upscaling over a tile grid.
//!
//! Images that fit in one tile are sent to the engine as-is; larger images are
//! padded to the grid, split into overlapping tiles, and stitched back by
//! keeping only each tile's owned block. A failing tile is zero-filled and the
//! rest of the image still renders.

use std::time::Instant;

use anyhow::{bail, Context, Result};
use ndarray::{s, Array3, ArrayView3};
use thiserror::Error;
use tracing::{debug, warn};

use crate::budget::{estimate_budget, BudgetConfig, ResourceProbe, TileBudget};
use crate::codec;
use crate::engine::InferenceEngine;
use crate::pipeline::FrameTransform;
use crate::tiling::{align_pad, is_single_tile, pad_for_grid, pad_reflect, plan};
use crate::types::{ChannelOrder, Frame};

#[derive(Debug, Error)]
pub enum UpscaleError {
    #[error("upscaling cancelled")]
    Cancelled,
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

impl UpscaleError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

pub struct TileUpscaler<E> {
    engine: E,
    budget: TileBudget,
    tile_pad: usize,
}

impl<E: InferenceEngine> TileUpscaler<E> {
    pub fn new(engine: E, budget: TileBudget, tile_pad: usize) -> Self {
        Self {
            engine,
            budget,
            tile_pad,
        }
    }

    /// Size the tile budget for `engine` from a single probe of `probe`.
    ///
    /// A non-zero `tile_size_override` skips the probe entirely.
    pub fn from_engine(
        engine: E,
        probe: &dyn ResourceProbe,
        config: &BudgetConfig,
        tile_size_override: Option<u32>,
        tile_pad: usize,
    ) -> Self {
        let budget = match tile_size_override.filter(|side| *side > 0) {
            Some(side) => {
                let budget = TileBudget::from_tile_side(side);
                debug!(
                    requested = side,
                    tile_side = budget.tile_side(),
                    "Using configured tile size"
                );
                budget
            }
            None => estimate_budget(probe, engine.backend(), engine.precision(), config),
        };
        Self::new(engine, budget, tile_pad)
    }

    pub fn scale(&self) -> usize {
        self.engine.scale()
    }

    pub fn tile_size(&self) -> usize {
        self.budget.tile_side() as usize
    }

    pub fn tile_pad(&self) -> usize {
        self.tile_pad
    }

    pub fn budget(&self) -> TileBudget {
        self.budget
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// Upscale `frame`, checking `interrupt` before every engine call.
    pub fn process(
        &mut self,
        frame: &Frame,
        interrupt: &dyn Fn() -> bool,
    ) -> Result<Frame, UpscaleError> {
        let width = frame.width() as usize;
        let height = frame.height() as usize;
        let order = frame.channel_order();
        let scale = self.scale();
        let tile_size = self.tile_size();

        if interrupt() {
            return Err(UpscaleError::Cancelled);
        }

        if is_single_tile(width, height, tile_size) {
            let upscaled = self
                .infer_patch(frame.view(), order)
                .context("Single-tile inference failed")?;
            return Ok(Frame::from_array(upscaled, order)?);
        }

        let started = Instant::now();
        let pad = self.tile_pad;
        let crop = pad * scale;
        let padded = pad_for_grid(frame.view(), tile_size, pad);
        let tiles = plan(width, height, tile_size, pad, scale);
        let mut canvas = Array3::<u8>::zeros((height * scale, width * scale, Frame::CHANNELS));
        let mut failed_tiles = 0usize;

        for tile in &tiles {
            if interrupt() {
                return Err(UpscaleError::Cancelled);
            }

            let src = tile.source;
            let dest = tile.dest;
            let patch = padded.slice(s![src.y..src.bottom(), src.x..src.right(), ..]);
            let mut target = canvas.slice_mut(s![dest.y..dest.bottom(), dest.x..dest.right(), ..]);

            match self.infer_patch(patch, order) {
                Ok(output) => target.assign(&output.slice(s![
                    crop..crop + dest.height,
                    crop..crop + dest.width,
                    ..
                ])),
                Err(error) => {
                    failed_tiles += 1;
                    warn!(
                        row = tile.row,
                        col = tile.col,
                        error = %format!("{error:#}"),
                        "Tile inference failed; filling with zeros"
                    );
                    target.fill(0);
                }
            }
        }

        debug!(
            width,
            height,
            tile_size,
            tiles = tiles.len(),
            failed_tiles,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Tiled upscale complete"
        );

        Ok(Frame::from_array(canvas, order)?)
    }

    /// Run one patch through the engine and return exactly `(h*s, w*s, 3)`.
    fn infer_patch(&mut self, patch: ArrayView3<'_, u8>, order: ChannelOrder) -> Result<Array3<u8>> {
        let (h, w, _) = patch.dim();
        let scale = self.engine.scale();
        let pad_h = align_pad(h);
        let pad_w = align_pad(w);
        let aligned = pad_reflect(patch, 0, pad_h, 0, pad_w);

        let input = codec::encode(aligned.view(), order, self.engine.precision())?;
        let output = self.engine.infer(input)?;

        let expected = (1, 3, (h + pad_h) * scale, (w + pad_w) * scale);
        if output.dim() != expected {
            bail!(
                "engine output shape {:?} does not match expected {:?}",
                output.dim(),
                expected
            );
        }

        let decoded = codec::decode(&output, order)?;
        if pad_h > 0 || pad_w > 0 {
            Ok(decoded.slice(s![..h * scale, ..w * scale, ..]).to_owned())
        } else {
            Ok(decoded)
        }
    }
}

impl<E: InferenceEngine> FrameTransform for TileUpscaler<E> {
    fn transform(
        &mut self,
        frame: &Frame,
        interrupt: &dyn Fn() -> bool,
    ) -> Result<Frame, UpscaleError> {
        self.process(frame, interrupt)
    }

    fn output_dims(&self, width: u32, height: u32) -> (u32, u32) {
        let scale = self.scale() as u32;
        (width * scale, height * scale)
    }
}
