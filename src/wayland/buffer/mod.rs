//! Client buffer resources
//!
//! Every buffer a client attaches is represented by a [`WlBuffer`]. The resource does not expose
//! the memory directly, instead it can be classified with [`WlBuffer::kind`] and asked for the
//! data of the matching sharing mechanism:
//!
//! - [`WlBuffer::shm_data`] for buffers created from a [`ShmPool`](super::shm::ShmPool),
//! - [`WlBuffer::native`] for buffers living in GPU memory, shared through a legacy protocol,
//! - [`WlBuffer::dmabuf_buffer`] for buffers created through linux-dmabuf.
//!
//! Buffers created by protocol extensions this crate does not handle are classified as
//! [`BufferKind::Unknown`].
//!
//! Once the client destroys the resource, [`WlBuffer::destroy`] notifies all destroy listeners
//! and discards the data associated with the resource.

use std::{
    cell::{Cell, RefCell},
    fmt,
    rc::{Rc, Weak},
};

use tracing::{debug, error, trace};

use crate::{
    backend::buffer::Buffer,
    utils::{Buffer as BufferCoords, HookId, Signal, Size},
};

use super::{
    dmabuf::DmabufResource,
    shm::{ShmBufferData, ShmPool},
};

crate::utils::ids::id_gen!(object_ids);

/// `wl_display` error: server couldn't find object
pub const ERROR_INVALID_OBJECT: u32 = 0;

/// Identifier of a protocol object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectId(usize);

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "wl_buffer@{}", self.0)
    }
}

/// How the memory of a [`WlBuffer`] is shared with the compositor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferKind {
    /// Memory shared through a `wl_shm` pool
    Shm,
    /// GPU memory shared through a legacy protocol
    Native,
    /// Memory shared as a DMA-BUF
    Dmabuf,
    /// Created by a protocol extension not known to this crate
    Unknown,
}

/// A buffer living in GPU memory, shared through a legacy protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NativeBuffer {
    /// Opaque handle understood by the GPU backend
    pub handle: u64,
    /// Size of the buffer
    pub size: Size<i32, BufferCoords>,
    /// Whether the buffer carries an alpha channel
    pub has_alpha: bool,
    /// Whether the buffer is stored upside down
    pub y_inverted: bool,
}

/// A protocol error posted on a resource
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolError {
    /// Protocol-specific error code
    pub code: u32,
    /// Human readable description
    pub message: String,
}

#[derive(Debug)]
pub(crate) enum BufferData {
    Shm { pool: ShmPool, data: ShmBufferData },
    Native(NativeBuffer),
    Dmabuf(DmabufResource),
    Unknown { interface: String },
}

impl BufferData {
    fn kind(&self) -> BufferKind {
        match self {
            BufferData::Shm { .. } => BufferKind::Shm,
            BufferData::Native(_) => BufferKind::Native,
            BufferData::Dmabuf(_) => BufferKind::Dmabuf,
            BufferData::Unknown { .. } => BufferKind::Unknown,
        }
    }
}

#[derive(Debug)]
struct WlBufferInner {
    id: ObjectId,
    alive: Cell<bool>,
    data: RefCell<Option<BufferData>>,
    destroy_signal: Signal<()>,
    releases: Cell<usize>,
    error: RefCell<Option<ProtocolError>>,
}

impl Drop for WlBufferInner {
    fn drop(&mut self) {
        object_ids::remove(self.id.0);
    }
}

/// A client buffer resource
///
/// Handles are cheap to clone and compare equal if they refer to the same resource.
#[derive(Debug, Clone)]
pub struct WlBuffer(Rc<WlBufferInner>);

/// A non-owning handle to a [`WlBuffer`]
#[derive(Debug, Clone)]
pub(crate) struct WeakWlBuffer(Weak<WlBufferInner>);

impl WeakWlBuffer {
    pub(crate) fn upgrade(&self) -> Option<WlBuffer> {
        self.0.upgrade().map(WlBuffer)
    }
}

impl PartialEq for WlBuffer {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}
impl Eq for WlBuffer {}

impl WlBuffer {
    pub(crate) fn new(data: BufferData) -> WlBuffer {
        let id = ObjectId(object_ids::next());
        trace!(%id, kind = ?data.kind(), "new buffer resource");
        WlBuffer(Rc::new(WlBufferInner {
            id,
            alive: Cell::new(true),
            data: RefCell::new(Some(data)),
            destroy_signal: Signal::new(),
            releases: Cell::new(0),
            error: RefCell::new(None),
        }))
    }

    /// Create a resource for a buffer living in GPU memory
    pub fn new_native(buffer: NativeBuffer) -> WlBuffer {
        WlBuffer::new(BufferData::Native(buffer))
    }

    /// Create a resource created through a protocol extension this crate does not handle
    pub fn new_unknown(interface: impl Into<String>) -> WlBuffer {
        WlBuffer::new(BufferData::Unknown {
            interface: interface.into(),
        })
    }

    /// Identifier of this resource
    pub fn id(&self) -> ObjectId {
        self.0.id
    }

    pub(crate) fn downgrade(&self) -> WeakWlBuffer {
        WeakWlBuffer(Rc::downgrade(&self.0))
    }

    /// Whether the client has not destroyed this resource yet
    pub fn is_alive(&self) -> bool {
        self.0.alive.get()
    }

    /// How the memory of this buffer is shared
    ///
    /// Returns [`None`] once the resource has been destroyed.
    pub fn kind(&self) -> Option<BufferKind> {
        self.0.data.borrow().as_ref().map(BufferData::kind)
    }

    /// Size of the buffer in pixels, for every kind but [`BufferKind::Unknown`]
    pub fn buffer_size(&self) -> Option<Size<i32, BufferCoords>> {
        match self.0.data.borrow().as_ref()? {
            BufferData::Shm { data, .. } => Some((data.width, data.height).into()),
            BufferData::Native(native) => Some(native.size),
            BufferData::Dmabuf(dmabuf) => Some(dmabuf.size()),
            BufferData::Unknown { interface } => {
                debug!(id = %self.0.id, %interface, "cannot get size of unknown buffer type");
                None
            }
        }
    }

    /// The pool and layout of a shared-memory buffer
    pub fn shm_data(&self) -> Option<(ShmPool, ShmBufferData)> {
        match self.0.data.borrow().as_ref()? {
            BufferData::Shm { pool, data } => Some((pool.clone(), *data)),
            _ => None,
        }
    }

    /// The description of a GPU-resident buffer
    pub fn native(&self) -> Option<NativeBuffer> {
        match self.0.data.borrow().as_ref()? {
            BufferData::Native(native) => Some(*native),
            _ => None,
        }
    }

    /// The [`Buffer`] wrapping a linux-dmabuf buffer
    pub fn dmabuf_buffer(&self) -> Option<Buffer> {
        match self.0.data.borrow().as_ref()? {
            BufferData::Dmabuf(dmabuf) => dmabuf.buffer().cloned(),
            _ => None,
        }
    }

    /// Tell the client the compositor does not access the buffer anymore
    ///
    /// The client is free to reuse or destroy the buffer afterwards.
    pub fn release(&self) {
        if !self.is_alive() {
            debug!(id = %self.0.id, "not releasing destroyed buffer");
            return;
        }
        trace!(id = %self.0.id, "releasing buffer");
        self.0.releases.set(self.0.releases.get() + 1);
    }

    /// Amount of `release` events sent for this buffer
    pub fn release_count(&self) -> usize {
        self.0.releases.get()
    }

    /// Post a protocol error, disconnecting the client
    ///
    /// Only the first error posted on a resource is kept.
    pub fn post_error(&self, code: u32, message: impl Into<String>) {
        let message = message.into();
        error!(id = %self.0.id, code, reason = %message, "protocol error");
        let mut error = self.0.error.borrow_mut();
        if error.is_none() {
            *error = Some(ProtocolError { code, message });
        }
    }

    /// The protocol error posted on this resource, if any
    pub fn protocol_error(&self) -> Option<ProtocolError> {
        self.0.error.borrow().clone()
    }

    /// Register a listener notified when the client destroys the resource
    pub fn add_destroy_listener<F>(&self, f: F) -> HookId
    where
        F: Fn() + 'static,
    {
        self.0.destroy_signal.add(move |_| f())
    }

    /// Revoke a listener registered with [`add_destroy_listener`](WlBuffer::add_destroy_listener)
    pub fn remove_destroy_listener(&self, hook: &HookId) -> bool {
        self.0.destroy_signal.remove(hook)
    }

    /// Destroy the resource.
    ///
    /// Destroy listeners are notified before the data of the resource is discarded. Destroying a
    /// resource twice does nothing.
    pub fn destroy(&self) {
        if !self.0.alive.replace(false) {
            return;
        }
        trace!(id = %self.0.id, "destroying buffer resource");

        self.0.destroy_signal.emit(&());
        self.0.destroy_signal.clear();

        let data = self.0.data.borrow_mut().take();
        std::mem::drop(data);
    }
}
