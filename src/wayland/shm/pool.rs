use std::{
    cell::{Cell, RefCell},
    fmt,
};

use tracing::trace;

use crate::backend::{allocator::Fourcc, buffer::DataPtrAccess};

#[derive(Debug)]
pub(crate) enum ResizeError {
    InvalidSize,
    Busy,
}

#[derive(Debug)]
pub(crate) enum WriteError {
    OutOfBounds,
    Busy,
}

/// Memory shared by a client
///
/// Held in process rather than mapped from a client file descriptor. The memory is never reallocated while a direct access is open, so pointers handed out by
/// [`Pool::begin_access`] stay valid until the matching [`Pool::end_access`].
pub(crate) struct Pool {
    memory: RefCell<Vec<u8>>,
    accessors: Cell<usize>,
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("size", &self.memory.try_borrow().map(|memory| memory.len()).ok())
            .field("accessors", &self.accessors.get())
            .finish()
    }
}

impl Pool {
    pub(crate) fn new(size: usize) -> Pool {
        trace!(size, "creating new shm pool");
        Pool {
            memory: RefCell::new(vec![0; size]),
            accessors: Cell::new(0),
        }
    }

    pub(crate) fn size(&self) -> usize {
        self.memory.borrow().len()
    }

    pub(crate) fn resize(&self, size: usize) -> Result<(), ResizeError> {
        if self.accessors.get() > 0 {
            return Err(ResizeError::Busy);
        }
        let mut memory = self.memory.borrow_mut();
        if size < memory.len() {
            return Err(ResizeError::InvalidSize);
        }
        trace!(from = memory.len(), to = size, "resizing shm pool");
        memory.resize(size, 0);
        Ok(())
    }

    pub(crate) fn write(&self, offset: usize, bytes: &[u8]) -> Result<(), WriteError> {
        if self.accessors.get() > 0 {
            return Err(WriteError::Busy);
        }
        let mut memory = self.memory.borrow_mut();
        let end = offset.checked_add(bytes.len()).ok_or(WriteError::OutOfBounds)?;
        memory
            .get_mut(offset..end)
            .ok_or(WriteError::OutOfBounds)?
            .copy_from_slice(bytes);
        Ok(())
    }

    pub(crate) fn with_data_slice<T, F: FnOnce(&[u8]) -> T>(&self, f: F) -> T {
        f(&self.memory.borrow())
    }

    /// Open a direct access to `len` bytes at `offset`
    pub(crate) fn begin_access(
        &self,
        offset: usize,
        len: usize,
        format: Fourcc,
        stride: u32,
    ) -> Option<DataPtrAccess> {
        let memory = self.memory.borrow();
        let data = memory.get(offset..offset.checked_add(len)?)?;
        self.accessors.set(self.accessors.get() + 1);
        Some(DataPtrAccess::new(data, format, stride))
    }

    pub(crate) fn end_access(&self) {
        let accessors = self.accessors.get();
        debug_assert!(accessors > 0, "unbalanced shm pool access");
        self.accessors.set(accessors.saturating_sub(1));
    }

    pub(crate) fn is_accessed(&self) -> bool {
        self.accessors.get() > 0
    }
}
