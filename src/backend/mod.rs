//! Buffer and rendering helpers
//!
//! Collection of the types sitting between client-provided pixel sources
//! and the GPU:
//!
//! - [`allocator`] describes pixel formats and DMA-BUF descriptors,
//! - [`buffer`] provides the reference-counted [`Buffer`](buffer::Buffer) and its variants,
//! - [`renderer`] imports buffers into [`Texture`](renderer::Texture)s and caches them.

pub mod allocator;
pub mod buffer;
pub mod renderer;
