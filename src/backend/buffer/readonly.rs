use std::{collections::TryReserveError, marker::PhantomData, ptr::NonNull};

use tracing::{error, trace};

use super::{Buffer, BufferCapabilities, BufferError, BufferImplementation, DataPtrAccess};
use crate::{
    backend::allocator::Fourcc,
    utils::{Buffer as BufferCoords, Size},
};

#[derive(Debug)]
enum Contents {
    // memory owned by the wrapper's caller, valid until the wrapper finishes
    Borrowed { ptr: NonNull<u8>, len: usize },
    Saved(Vec<u8>),
    Unavailable,
}

#[derive(Debug)]
struct ReadOnlyData {
    contents: Contents,
    format: Fourcc,
    stride: u32,
}

impl ReadOnlyData {
    fn data(&self) -> Option<&[u8]> {
        match &self.contents {
            // SAFETY: borrowed contents are replaced before the borrow ends
            Contents::Borrowed { ptr, len } => Some(unsafe { std::slice::from_raw_parts(ptr.as_ptr(), *len) }),
            Contents::Saved(data) => Some(data),
            Contents::Unavailable => None,
        }
    }
}

impl BufferImplementation for ReadOnlyData {
    fn capabilities(&self) -> BufferCapabilities {
        BufferCapabilities::DESTROY | BufferCapabilities::DATA_PTR_ACCESS
    }

    fn destroy(&mut self) {
        self.contents = Contents::Unavailable;
    }

    fn begin_data_ptr_access(&mut self) -> Result<DataPtrAccess, BufferError> {
        let data = self.data().ok_or(BufferError::Unavailable)?;
        Ok(DataPtrAccess::new(data, self.format, self.stride))
    }
}

/// A [`Buffer`] exposing memory owned by the caller
///
/// The wrapped buffer reads the borrowed memory while the wrapper lives. Consumers still holding
/// a lock when the wrapper goes away make it copy the memory. If that copy cannot be allocated
/// the buffer stays alive but its memory becomes [unavailable](BufferError::Unavailable).
///
/// Wrappers only exist within [`ReadOnlyDataBuffer::with`], so the copy cannot be skipped.
#[derive(Debug)]
pub struct ReadOnlyDataBuffer<'a> {
    buffer: Buffer,
    finished: bool,
    _data: PhantomData<&'a [u8]>,
}

impl<'a> ReadOnlyDataBuffer<'a> {
    /// Wrap `data` into a buffer for the duration of `f`.
    ///
    /// `data` is laid out as `size` pixels of `format` with `stride` bytes per row. Once `f`
    /// returns or unwinds the wrapper is dropped, copying the memory if the buffer is still
    /// locked. Returns the result of `f` and whether the copy succeeded.
    ///
    /// Fails with [`BufferError::InvalidLayout`] if `data` is too small for the layout.
    pub fn with<F, T>(
        format: Fourcc,
        stride: u32,
        size: impl Into<Size<i32, BufferCoords>>,
        data: &'a [u8],
        f: F,
    ) -> Result<(T, bool), BufferError>
    where
        F: FnOnce(&ReadOnlyDataBuffer<'a>) -> T,
    {
        let wrapper = ReadOnlyDataBuffer::new(format, stride, size, data)?;
        let result = f(&wrapper);
        Ok((result, wrapper.drop_with_save()))
    }

    fn new(
        format: Fourcc,
        stride: u32,
        size: impl Into<Size<i32, BufferCoords>>,
        data: &'a [u8],
    ) -> Result<ReadOnlyDataBuffer<'a>, BufferError> {
        let size = size.into();
        let required = stride as usize * size.h.max(0) as usize;
        if data.len() < required {
            error!(len = data.len(), required, "Pixel data is too small for the buffer");
            return Err(BufferError::InvalidLayout {
                len: data.len(),
                required,
            });
        }

        let buffer = Buffer::new(
            ReadOnlyData {
                contents: Contents::Borrowed {
                    ptr: NonNull::from(data).cast(),
                    len: data.len(),
                },
                format,
                stride,
            },
            size,
        );
        Ok(ReadOnlyDataBuffer {
            buffer,
            finished: false,
            _data: PhantomData,
        })
    }

    /// The wrapped buffer
    pub fn buffer(&self) -> &Buffer {
        &self.buffer
    }

    fn drop_with_save(mut self) -> bool {
        self.finish(copy_contents)
    }

    fn finish<F>(&mut self, copy: F) -> bool
    where
        F: FnOnce(&[u8]) -> Result<Vec<u8>, TryReserveError>,
    {
        self.finished = true;

        let mut saved = true;
        if self.buffer.n_locks() > 0 {
            saved = self
                .buffer
                .with_implementation_mut(|state: &mut ReadOnlyData| {
                    let copied = match state.data() {
                        Some(data) => copy(data),
                        None => return false,
                    };
                    match copied {
                        Ok(data) => {
                            trace!(len = data.len(), "saved read-only buffer contents");
                            state.contents = Contents::Saved(data);
                            true
                        }
                        Err(err) => {
                            error!(?err, "Failed to save read-only buffer contents");
                            state.contents = Contents::Unavailable;
                            false
                        }
                    }
                })
                .unwrap_or(false);
        }

        self.buffer.drop();
        saved
    }
}

impl Drop for ReadOnlyDataBuffer<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.finish(copy_contents);
        }
    }
}

fn copy_contents(data: &[u8]) -> Result<Vec<u8>, TryReserveError> {
    let mut copy = Vec::new();
    copy.try_reserve_exact(data.len())?;
    copy.extend_from_slice(data);
    Ok(copy)
}
