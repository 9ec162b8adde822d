//! SHM handling helpers
//!
//! SHM (Shared Memory) is the most basic way wayland clients can send content to the compositor:
//! the client creates a memory pool, writes pixels into it, and creates buffers describing
//! regions of that pool.
//!
//! [`ShmPool::create_buffer`] validates the parameters the way `wl_shm_pool.create_buffer`
//! requires, and returns a [`WlBuffer`] classified as [`BufferKind::Shm`].
//!
//! ```
//! use wlbuf::backend::allocator::{format::fourcc_to_shm_format, Fourcc};
//! use wlbuf::wayland::shm::{with_buffer_contents, ShmPool};
//!
//! let pool = ShmPool::new(4 * 4 * 4).unwrap();
//! pool.write(0, &[0xff; 16]).unwrap();
//! let buffer = pool
//!     .create_buffer(0, 4, 4, 16, fourcc_to_shm_format(Fourcc::Argb8888))
//!     .unwrap();
//!
//! let first_row = with_buffer_contents(&buffer, |slice, data| {
//!     assert_eq!(data.format, Fourcc::Argb8888);
//!     slice[..data.stride as usize].to_vec()
//! })
//! .unwrap();
//! assert_eq!(first_row, vec![0xff; 16]);
//! ```
//!
//! [`BufferKind::Shm`]: crate::wayland::buffer::BufferKind::Shm

use std::rc::Rc;

use tracing::error;

use crate::{
    backend::{
        allocator::{
            format::{lookup, shm_format_to_fourcc},
            Fourcc,
        },
        buffer::DataPtrAccess,
    },
    wayland::buffer::{BufferData, WlBuffer},
};

mod pool;

use self::pool::{Pool, ResizeError, WriteError};

/// `wl_shm` error: buffer format is not known
pub const ERROR_INVALID_FORMAT: u32 = 0;
/// `wl_shm` error: invalid size or stride during pool or buffer creation
pub const ERROR_INVALID_STRIDE: u32 = 1;
/// `wl_shm` error: mmapping the file descriptor failed
pub const ERROR_INVALID_FD: u32 = 2;

/// Errors of shared-memory pool requests
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ShmError {
    /// Pools cannot be empty or shrink
    #[error("invalid pool size {0}")]
    InvalidPoolSize(usize),
    /// Buffer offsets must not be negative
    #[error("offset must not be negative (got {0})")]
    InvalidOffset(i32),
    /// Buffers must have a positive size
    #[error("invalid width or height ({width}x{height})")]
    InvalidSize {
        /// Requested width
        width: i32,
        /// Requested height
        height: i32,
    },
    /// The stride cannot hold a row of the buffer
    #[error("invalid stride {stride} for width {width}")]
    InvalidStride {
        /// Requested stride
        stride: i32,
        /// Requested width
        width: i32,
    },
    /// The buffer exceeds the pool
    #[error("buffer does not fit into the pool of {pool_size} bytes")]
    OutOfBounds {
        /// Current size of the pool
        pool_size: usize,
    },
    /// The format code is unknown
    #[error("unknown format 0x{0:x}")]
    InvalidFormat(u32),
    /// The pool memory is currently being read
    #[error("the pool is being accessed")]
    PoolBusy,
}

impl ShmError {
    /// The `wl_shm` error code a client receives for this error
    pub fn protocol_code(&self) -> u32 {
        match self {
            ShmError::InvalidFormat(_) => ERROR_INVALID_FORMAT,
            ShmError::InvalidPoolSize(_) | ShmError::PoolBusy => ERROR_INVALID_FD,
            _ => ERROR_INVALID_STRIDE,
        }
    }
}

/// Layout of a shared-memory buffer within its pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShmBufferData {
    /// Offset of the start of the buffer relative to the start of the pool in bytes
    pub offset: i32,
    /// Width of the buffer in pixels
    pub width: i32,
    /// Height of the buffer in pixels
    pub height: i32,
    /// Stride of the buffer in bytes
    pub stride: i32,
    /// Format used by this buffer
    pub format: Fourcc,
}

impl ShmBufferData {
    /// Amount of bytes the buffer covers in its pool
    pub fn len(&self) -> usize {
        self.stride as usize * self.height as usize
    }

    /// Returns `true` if the buffer covers no memory
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A shared-memory pool
///
/// Pools are reference counted, buffers created from a pool keep it alive.
#[derive(Debug, Clone)]
pub struct ShmPool(Rc<Pool>);

impl PartialEq for ShmPool {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl ShmPool {
    /// Create a zero-initialized pool of `size` bytes
    pub fn new(size: usize) -> Result<ShmPool, ShmError> {
        if size == 0 || size > i32::MAX as usize {
            return Err(ShmError::InvalidPoolSize(size));
        }
        Ok(ShmPool(Rc::new(Pool::new(size))))
    }

    /// Size of the pool in bytes
    pub fn size(&self) -> usize {
        self.0.size()
    }

    /// Grow the pool to `size` bytes
    pub fn resize(&self, size: usize) -> Result<(), ShmError> {
        if size > i32::MAX as usize {
            return Err(ShmError::InvalidPoolSize(size));
        }
        self.0.resize(size).map_err(|err| match err {
            ResizeError::InvalidSize => ShmError::InvalidPoolSize(size),
            ResizeError::Busy => ShmError::PoolBusy,
        })
    }

    /// Write `bytes` into the pool at `offset`, like the client would
    pub fn write(&self, offset: usize, bytes: &[u8]) -> Result<(), ShmError> {
        self.0.write(offset, bytes).map_err(|err| match err {
            WriteError::OutOfBounds => ShmError::OutOfBounds {
                pool_size: self.size(),
            },
            WriteError::Busy => ShmError::PoolBusy,
        })
    }

    /// Call `f` with the whole pool memory
    pub fn with_data_slice<T, F: FnOnce(&[u8]) -> T>(&self, f: F) -> T {
        self.0.with_data_slice(f)
    }

    /// Whether a direct access to the pool memory is open
    pub fn is_accessed(&self) -> bool {
        self.0.is_accessed()
    }

    /// Create a buffer out of a region of this pool.
    ///
    /// `format` is a `wl_shm` format code.
    pub fn create_buffer(
        &self,
        offset: i32,
        width: i32,
        height: i32,
        stride: i32,
        format: u32,
    ) -> Result<WlBuffer, ShmError> {
        let data = self.validate(offset, width, height, stride, format).map_err(|err| {
            error!(code = err.protocol_code(), "{}", err);
            err
        })?;
        Ok(WlBuffer::new(BufferData::Shm {
            pool: self.clone(),
            data,
        }))
    }

    fn validate(
        &self,
        offset: i32,
        width: i32,
        height: i32,
        stride: i32,
        format: u32,
    ) -> Result<ShmBufferData, ShmError> {
        let fourcc = shm_format_to_fourcc(format).ok_or(ShmError::InvalidFormat(format))?;
        let info = lookup(fourcc).ok_or(ShmError::InvalidFormat(format))?;

        if offset < 0 {
            return Err(ShmError::InvalidOffset(offset));
        }
        if width <= 0 || height <= 0 {
            return Err(ShmError::InvalidSize { width, height });
        }
        if stride <= 0 || !info.is_valid_stride(stride as u32, width as u32) {
            return Err(ShmError::InvalidStride { stride, width });
        }
        if (i32::MAX / stride) < height {
            return Err(ShmError::InvalidStride { stride, width });
        }
        let pool_size = self.size();
        if offset as usize + (stride as usize * height as usize) > pool_size {
            return Err(ShmError::OutOfBounds { pool_size });
        }

        Ok(ShmBufferData {
            offset,
            width,
            height,
            stride,
            format: fourcc,
        })
    }

    pub(crate) fn begin_access(&self, data: &ShmBufferData) -> Option<DataPtrAccess> {
        self.0
            .begin_access(data.offset as usize, data.len(), data.format, data.stride as u32)
    }

    pub(crate) fn end_access(&self) {
        self.0.end_access()
    }
}

/// Error that can occur when accessing an SHM buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum BufferAccessError {
    /// This buffer is not a shared-memory buffer, or has been destroyed
    #[error("the buffer is not a shared-memory buffer")]
    NotManaged,
    /// The buffer does not fit into its pool anymore
    #[error("the buffer exceeds its pool")]
    BadMap,
}

/// Call given closure with the contents of the given buffer
///
/// The slice starts at the first byte of the buffer and covers `stride * height` bytes.
pub fn with_buffer_contents<F, T>(buffer: &WlBuffer, f: F) -> Result<T, BufferAccessError>
where
    F: FnOnce(&[u8], ShmBufferData) -> T,
{
    let (pool, data) = buffer.shm_data().ok_or(BufferAccessError::NotManaged)?;

    let result = pool.with_data_slice(|slice| {
        let start = data.offset as usize;
        slice.get(start..start + data.len()).map(|contents| f(contents, data))
    });

    result.ok_or_else(|| {
        buffer.post_error(ERROR_INVALID_FD, "Bad pool size.");
        BufferAccessError::BadMap
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::allocator::format::fourcc_to_shm_format;
    use crate::wayland::buffer::BufferKind;

    const ARGB: u32 = 0;

    #[test]
    fn create_buffer_validation() {
        let pool = ShmPool::new(256).unwrap();
        assert_eq!(
            pool.create_buffer(-1, 4, 4, 16, ARGB).unwrap_err(),
            ShmError::InvalidOffset(-1)
        );
        assert_eq!(
            pool.create_buffer(0, 0, 4, 16, ARGB).unwrap_err(),
            ShmError::InvalidSize { width: 0, height: 4 }
        );
        assert_eq!(
            pool.create_buffer(0, 4, 4, 12, ARGB).unwrap_err(),
            ShmError::InvalidStride { stride: 12, width: 4 }
        );
        assert_eq!(
            pool.create_buffer(0, 4, 4, 18, ARGB).unwrap_err(),
            ShmError::InvalidStride { stride: 18, width: 4 }
        );
        assert_eq!(
            pool.create_buffer(200, 4, 4, 16, ARGB).unwrap_err(),
            ShmError::OutOfBounds { pool_size: 256 }
        );
        assert_eq!(
            pool.create_buffer(0, 4, 4, 16, 0xdead_beef).unwrap_err(),
            ShmError::InvalidFormat(0xdead_beef)
        );
        assert_eq!(ShmError::InvalidFormat(3).protocol_code(), ERROR_INVALID_FORMAT);

        let buffer = pool.create_buffer(64, 4, 4, 16, ARGB).unwrap();
        assert_eq!(buffer.kind(), Some(BufferKind::Shm));
        assert_eq!(buffer.buffer_size(), Some((4, 4).into()));
    }

    #[test]
    fn huge_height_overflows() {
        let pool = ShmPool::new(256).unwrap();
        assert!(matches!(
            pool.create_buffer(0, 1, i32::MAX, 4, ARGB),
            Err(ShmError::InvalidStride { .. })
        ));
    }

    #[test]
    fn contents_cover_the_buffer_region() {
        let pool = ShmPool::new(64).unwrap();
        pool.write(32, &[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
        let buffer = pool
            .create_buffer(32, 2, 2, 8, fourcc_to_shm_format(Fourcc::Xrgb8888))
            .unwrap();

        let contents = with_buffer_contents(&buffer, |slice, data| {
            assert_eq!(data.format, Fourcc::Xrgb8888);
            slice.to_vec()
        })
        .unwrap();
        assert_eq!(contents.len(), 16);
        assert_eq!(&contents[..8], &[1, 2, 3, 4, 5, 6, 7, 8]);

        buffer.destroy();
        assert_eq!(
            with_buffer_contents(&buffer, |_, _| ()).unwrap_err(),
            BufferAccessError::NotManaged
        );
    }

    #[test]
    fn pool_is_busy_while_accessed() {
        let pool = ShmPool::new(64).unwrap();
        let buffer = pool.create_buffer(0, 4, 4, 16, ARGB).unwrap();
        let (_, data) = buffer.shm_data().unwrap();

        let access = pool.begin_access(&data).unwrap();
        assert_eq!(access.len(), 64);
        assert_eq!(pool.write(0, &[1]), Err(ShmError::PoolBusy));
        assert_eq!(pool.resize(128), Err(ShmError::PoolBusy));
        pool.end_access();

        pool.write(0, &[1]).unwrap();
        pool.resize(128).unwrap();
        assert_eq!(pool.resize(64), Err(ShmError::InvalidPoolSize(64)));
    }
}
