//! Tiled super-resolution for images and videos.

pub mod backend;
pub mod batch;
pub mod budget;
pub mod codec;
pub mod config;
pub mod encoder;
pub mod engine;
pub mod image_io;
pub mod logging;
pub mod media;
pub mod pipeline;
pub mod runtime;
pub mod tiling;
pub mod types;
pub mod upscaler;
pub mod video;
