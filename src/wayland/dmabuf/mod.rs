//! Linux DMA-BUF buffer resources
//!
//! Clients create DMA-BUF backed buffers by sending the file descriptors and layout of every
//! plane. [`create_buffer`] validates those parameters the way `zwp_linux_buffer_params_v1`
//! requires and returns a [`WlBuffer`] classified as [`BufferKind::Dmabuf`].
//!
//! The resource owns the descriptors. Its memory is exposed through a
//! [`DmabufBuffer`], available with [`WlBuffer::dmabuf_buffer`]. When the client destroys the
//! resource while that buffer is still locked, the buffer keeps duplicates of the descriptors.
//!
//! ```
//! use std::os::unix::io::OwnedFd;
//! use wlbuf::backend::allocator::{
//!     dmabuf::{Dmabuf, DmabufFlags},
//!     Fourcc, Modifier,
//! };
//! use wlbuf::wayland::{buffer::BufferKind, dmabuf::create_buffer};
//!
//! let file = tempfile::tempfile().unwrap();
//! file.set_len(64 * 64 * 4).unwrap();
//!
//! let mut builder = Dmabuf::builder((64, 64), Fourcc::Argb8888, Modifier::Linear, DmabufFlags::empty());
//! builder.add_plane(OwnedFd::from(file), 0, 0, 64 * 4);
//! let resource = create_buffer(builder.build().unwrap()).unwrap();
//!
//! assert_eq!(resource.kind(), Some(BufferKind::Dmabuf));
//! assert!(resource.dmabuf_buffer().unwrap().get_dma_handle().is_ok());
//! ```
//!
//! [`BufferKind::Dmabuf`]: crate::wayland::buffer::BufferKind::Dmabuf
//! [`DmabufBuffer`]: crate::backend::buffer::DmabufBuffer

use std::{fmt, os::unix::io::BorrowedFd};

use rustix::fs::SeekFrom;
use tracing::{error, warn};

use crate::{
    backend::{
        allocator::dmabuf::{Dmabuf, Plane},
        buffer::{Buffer, DmabufBuffer},
    },
    utils::{Buffer as BufferCoords, Size},
    wayland::buffer::{BufferData, WlBuffer},
};

/// `zwp_linux_buffer_params_v1` error: plane index out of bounds
pub const ERROR_PLANE_IDX: u32 = 1;
/// `zwp_linux_buffer_params_v1` error: the plane index was already set
pub const ERROR_PLANE_SET: u32 = 2;
/// `zwp_linux_buffer_params_v1` error: missing or too many planes to create a buffer
pub const ERROR_INCOMPLETE: u32 = 3;
/// `zwp_linux_buffer_params_v1` error: width or height of the buffer are invalid
pub const ERROR_INVALID_DIMENSIONS: u32 = 5;
/// `zwp_linux_buffer_params_v1` error: offset + stride * height goes out of the dmabuf bounds
pub const ERROR_OUT_OF_BOUNDS: u32 = 6;

/// Errors of DMA-BUF buffer creation
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DmabufError {
    /// Width and height must be positive
    #[error("invalid dimensions {0:?}")]
    InvalidDimensions(Size<i32, BufferCoords>),
    /// The planes do not form a contiguous set starting at index 0
    #[error("plane {0} is missing")]
    Incomplete(u32),
    /// A plane index was given twice
    #[error("plane {0} was already set")]
    PlaneSet(u32),
    /// A plane exceeds the memory behind its descriptor
    #[error("plane {plane} is out of bounds: {reason}")]
    OutOfBounds {
        /// Index of the offending plane
        plane: u32,
        /// What exceeds the memory
        reason: &'static str,
    },
}

impl DmabufError {
    /// The `zwp_linux_buffer_params_v1` error code a client receives for this error
    pub fn protocol_code(&self) -> u32 {
        match self {
            DmabufError::InvalidDimensions(_) => ERROR_INVALID_DIMENSIONS,
            DmabufError::Incomplete(_) => ERROR_INCOMPLETE,
            DmabufError::PlaneSet(_) => ERROR_PLANE_SET,
            DmabufError::OutOfBounds { .. } => ERROR_OUT_OF_BOUNDS,
        }
    }
}

/// Data of a DMA-BUF resource
pub(crate) struct DmabufResource {
    buffer: Option<DmabufBuffer<'static>>,
    // owns the descriptors `buffer` refers to
    dmabuf: Dmabuf,
}

impl fmt::Debug for DmabufResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DmabufResource")
            .field("buffer", &self.buffer.as_ref().map(DmabufBuffer::buffer))
            .field("dmabuf", &self.dmabuf)
            .finish()
    }
}

impl DmabufResource {
    fn new(dmabuf: Dmabuf) -> DmabufResource {
        // SAFETY: `dmabuf` owns the descriptors and outlives the buffer, which is finished in `drop`
        let buffer = unsafe { DmabufBuffer::new_unbounded(dmabuf.attributes()) };
        DmabufResource {
            buffer: Some(buffer),
            dmabuf,
        }
    }

    pub(crate) fn buffer(&self) -> Option<&Buffer> {
        self.buffer.as_ref().map(DmabufBuffer::buffer)
    }

    pub(crate) fn size(&self) -> Size<i32, BufferCoords> {
        self.dmabuf.attributes().size()
    }
}

impl Drop for DmabufResource {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            if !buffer.drop_with_save() {
                warn!("DMA-BUF buffer outlives its resource without memory");
            }
        }
    }
}

/// Create a buffer resource out of a client-provided DMA-BUF.
///
/// Fails if the size is not positive, the plane indices do not form a contiguous set starting at
/// zero, or a plane exceeds the memory behind its descriptor. Descriptors that cannot be seeked
/// skip the bounds check against their size.
pub fn create_buffer(dmabuf: Dmabuf) -> Result<WlBuffer, DmabufError> {
    validate(&dmabuf).map_err(|err| {
        error!(code = err.protocol_code(), "{}", err);
        err
    })?;
    let resource = WlBuffer::new(BufferData::Dmabuf(DmabufResource::new(dmabuf)));

    // consumers hold locks on the buffer while they read the client memory
    if let Some(buffer) = resource.dmabuf_buffer() {
        let weak = resource.downgrade();
        buffer.add_release_listener(move || {
            if let Some(resource) = weak.upgrade() {
                resource.release();
            }
        });
    }
    Ok(resource)
}

fn validate(dmabuf: &Dmabuf) -> Result<(), DmabufError> {
    let attributes = dmabuf.attributes();
    let size = attributes.size();
    if size.w < 1 || size.h < 1 {
        return Err(DmabufError::InvalidDimensions(size));
    }

    // planes are sorted by index
    for (expected, plane) in (0u32..).zip(attributes.planes()) {
        if plane.plane_idx < expected {
            return Err(DmabufError::PlaneSet(plane.plane_idx));
        }
        if plane.plane_idx > expected {
            return Err(DmabufError::Incomplete(expected));
        }
        check_plane_bounds(plane, size.h as u32)?;
    }

    Ok(())
}

fn check_plane_bounds(plane: &Plane, height: u32) -> Result<(), DmabufError> {
    let out_of_bounds = |reason| DmabufError::OutOfBounds {
        plane: plane.plane_idx,
        reason,
    };

    let end = plane
        .stride
        .checked_mul(height)
        .and_then(|len| len.checked_add(plane.offset))
        .ok_or_else(|| out_of_bounds("size overflow"))?;

    // SAFETY: the descriptor is owned by the dmabuf being validated
    let fd = unsafe { BorrowedFd::borrow_raw(plane.fd) };
    let Ok(size) = rustix::fs::seek(fd, SeekFrom::End(0)) else {
        return Ok(());
    };
    let _ = rustix::fs::seek(fd, SeekFrom::Start(0));

    if u64::from(plane.offset) > size {
        return Err(out_of_bounds("invalid offset"));
    }
    if u64::from(plane.offset) + u64::from(plane.stride) > size {
        return Err(out_of_bounds("invalid stride"));
    }
    // planes > 0 can be subsampled, in which case the size will be smaller than expected
    if plane.plane_idx == 0 && u64::from(end) > size {
        return Err(out_of_bounds("invalid stride or height"));
    }
    Ok(())
}
