//! Client-side buffer resources
//!
//! This module models the objects a wayland client hands to the compositor when it attaches a
//! buffer, as far as buffer handling needs to know about them:
//!
//! - [`buffer`] contains [`WlBuffer`](buffer::WlBuffer), the protocol resource every client buffer
//!   is represented by, regardless of how its memory is shared,
//! - [`shm`] contains shared-memory pools and the buffers created from them,
//! - [`dmabuf`] contains buffers created through the linux-dmabuf protocol.
//!
//! Resources notify interested parties when the client destroys them, and record the `release`
//! events and protocol errors the compositor sends, so the buffer layer can be driven without a
//! running display.

pub mod buffer;
pub mod dmabuf;
pub mod shm;
