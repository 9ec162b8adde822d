#![cfg_attr(docsrs, feature(doc_auto_cfg))]
#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]
// Allow acronyms like DMA
#![allow(clippy::upper_case_acronyms)]

//! # wlbuf: client buffers and texture import for wayland compositors
//!
//! This crate is the resource-ownership layer between the buffers wayland clients hand to a
//! compositor and the GPU renderer that eventually displays them. Client memory arrives as
//! shared-memory pools, DMA-BUF descriptors or legacy GPU-resident resources; this crate wraps
//! all of them into a single reference-counted [`Buffer`](backend::buffer::Buffer) type and
//! maps each distinct buffer onto exactly one [`Texture`](backend::renderer::Texture).
//!
//! ## Structure of the crate
//!
//! - [`backend`] contains the buffer abstraction, its variants, the pixel format registry and
//!   the texture import/cache coordinator built on top of an opaque [`GpuBackend`].
//! - [`wayland`] contains the transport side: client buffer resources, shared-memory pools and
//!   linux-dmabuf buffers, as far as this crate needs to know about them.
//! - [`utils`] contains geometry types, observer signals and id generation.
//!
//! ### Buffer lifecycle
//!
//! A [`Buffer`](backend::buffer::Buffer) is created in an "armed" state. Consumers call
//! [`lock`](backend::buffer::Buffer::lock) before any retained use and
//! [`unlock`](backend::buffer::Buffer::unlock) once done. The creator signals that it no longer
//! needs the buffer by calling [`drop`](backend::buffer::Buffer::drop). The variant's resources are
//! released the moment the buffer is both dropped and unlocked, no matter which of the two happens
//! last.
//!
//! Everything in this crate runs on a single thread. Callbacks fire synchronously from within the
//! call that triggered them.
//!
//! ### Logging
//!
//! wlbuf makes extensive use of [`tracing`] for its internal logging.
//!
//! For release builds it is recommended to limit the log level during compile time.
//! This can be done by adding a dependency to [`tracing`] and enabling the corresponding features.
//!
//! ```toml
//! [dependencies]
//! tracing = { version = "0.1", features = ["max_level_trace", "release_max_level_debug"] }
//! ```
//!
//! [`GpuBackend`]: backend::renderer::GpuBackend

pub mod backend;
pub mod utils;
pub mod wayland;

pub mod reexports;
