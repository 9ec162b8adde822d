use std::{io, marker::PhantomData};

use tracing::error;

use super::{Buffer, BufferCapabilities, BufferError, BufferImplementation};
use crate::backend::allocator::dmabuf::{Dmabuf, DmabufAttributes};

#[derive(Debug)]
struct DmabufBufferState {
    attributes: DmabufAttributes,
    // duplicated descriptors, once the borrowed ones could go away
    saved: Option<Dmabuf>,
}

impl BufferImplementation for DmabufBufferState {
    fn capabilities(&self) -> BufferCapabilities {
        BufferCapabilities::DESTROY | BufferCapabilities::DMABUF
    }

    fn destroy(&mut self) {
        self.saved.take();
    }

    fn dmabuf(&self) -> Result<DmabufAttributes, BufferError> {
        if self.attributes.is_empty() {
            return Err(BufferError::Unavailable);
        }
        Ok(self.attributes.clone())
    }
}

/// A [`Buffer`] describing a DMA-BUF owned by someone else
///
/// The wrapped buffer exposes the borrowed attributes while the wrapper lives. Consumers still
/// holding a lock when the wrapper goes away make it save a copy of the attributes, duplicating
/// every file descriptor. If that fails the buffer stays alive but reports its DMA-BUF as
/// [unavailable](BufferError::Unavailable).
///
/// Wrappers only exist within [`DmabufBuffer::with`], so the save cannot be skipped.
#[derive(Debug)]
pub struct DmabufBuffer<'a> {
    buffer: Buffer,
    finished: bool,
    _attributes: PhantomData<&'a DmabufAttributes>,
}

impl<'a> DmabufBuffer<'a> {
    /// Wrap `attributes` into a buffer for the duration of `f`.
    ///
    /// Once `f` returns or unwinds the wrapper is dropped, saving the attributes if the buffer
    /// is still locked. Returns the result of `f` and whether saving succeeded.
    pub fn with<F, T>(attributes: &'a DmabufAttributes, f: F) -> (T, bool)
    where
        F: FnOnce(&DmabufBuffer<'a>) -> T,
    {
        // SAFETY: the wrapper is finished before this function returns, `attributes` outlives it
        let wrapper = unsafe { DmabufBuffer::new_unbounded(attributes) };
        let result = f(&wrapper);
        (result, wrapper.drop_with_save())
    }

    /// Wrap `attributes` into a new buffer without borrowing them
    ///
    /// # Safety
    ///
    /// The file descriptors of `attributes` must stay open until the wrapper is dropped.
    pub(crate) unsafe fn new_unbounded<'b>(attributes: &DmabufAttributes) -> DmabufBuffer<'b> {
        let buffer = Buffer::new(
            DmabufBufferState {
                attributes: attributes.clone(),
                saved: None,
            },
            attributes.size(),
        );
        DmabufBuffer {
            buffer,
            finished: false,
            _attributes: PhantomData,
        }
    }

    /// The wrapped buffer
    pub fn buffer(&self) -> &Buffer {
        &self.buffer
    }

    /// Drop the wrapped buffer, saving the attributes if it is still locked.
    ///
    /// Returns `false` if the attributes had to be saved but duplicating the descriptors failed.
    pub(crate) fn drop_with_save(mut self) -> bool {
        self.finish(DmabufAttributes::try_duplicate)
    }

    fn finish<F>(&mut self, duplicate: F) -> bool
    where
        F: FnOnce(&DmabufAttributes) -> io::Result<Dmabuf>,
    {
        self.finished = true;

        let mut saved = true;
        if self.buffer.n_locks() > 0 {
            saved = self
                .buffer
                .with_implementation_mut(|state: &mut DmabufBufferState| {
                    match duplicate(&state.attributes) {
                        Ok(dmabuf) => {
                            state.attributes = dmabuf.attributes().clone();
                            state.saved = Some(dmabuf);
                            true
                        }
                        Err(err) => {
                            error!(?err, "Failed to save DMA-BUF buffer");
                            state.attributes =
                                DmabufAttributes::empty(state.attributes.size(), state.attributes.format());
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

impl Drop for DmabufBuffer<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.finish(DmabufAttributes::try_duplicate);
        }
    }
}
