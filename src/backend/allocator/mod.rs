//! Pixel formats and buffer descriptors
//!
//! Collection of the descriptions of client memory this crate understands:
//!
//! - [`format`] is the pixel format registry, answering bytes-per-pixel and alpha questions,
//! - [`dmabuf`] describes DMA-BUF backed buffers by their planes.

pub mod dmabuf;
pub mod format;

pub use drm_fourcc::{
    DrmFormat as Format, DrmFourcc as Fourcc, DrmModifier as Modifier, UnrecognizedFourcc,
};
