//! Reference-counted pixel buffers
//!
//! A [`Buffer`] is the common handle for every kind of pixel memory a renderer may consume.
//! It does not know where its pixels live. That knowledge sits in a
//! [`BufferImplementation`], which advertises the operations it supports through
//! [`BufferCapabilities`].
//!
//! ## Lifecycle
//!
//! - A buffer starts out *armed*: not dropped, without locks.
//! - Consumers take a reference with [`Buffer::lock`] and give it back with [`Buffer::unlock`].
//!   When the last lock goes away the release listeners are notified, telling the producer it may
//!   reuse the storage.
//! - The creator calls [`Buffer::drop`] once it does not need the buffer anymore.
//! - The moment a buffer is dropped *and* unlocked, its destroy listeners fire and the
//!   implementation is destroyed. This happens exactly once, from within whichever call
//!   established the condition.
//!
//! Violating the lifecycle (dropping twice, unlocking more often than locking, tearing down a
//! buffer while its memory is being accessed) is a bug in the calling code and panics.
//!
//! ## Variants
//!
//! - [`ClientBuffer`] wraps a client resource together with the texture imported from it,
//! - [`ShmClientBuffer`] exposes the memory of a shared-memory resource,
//! - [`ReadOnlyDataBuffer`] exposes caller-owned memory,
//! - [`DmabufBuffer`] exposes a DMA-BUF description.

use std::{
    cell::{Cell, RefCell},
    fmt,
    hash::{Hash, Hasher},
    ptr::NonNull,
    rc::{Rc, Weak},
};

use downcast_rs::{impl_downcast, Downcast};
use tracing::trace;

use crate::{
    backend::allocator::{dmabuf::DmabufAttributes, Fourcc},
    utils::{Buffer as BufferCoords, HookId, Signal, Size},
};

mod client;
mod dmabuf;
mod readonly;
mod shm;

pub use self::client::{ClientBuffer, DamageError, ImportError};
pub use self::dmabuf::DmabufBuffer;
pub use self::readonly::ReadOnlyDataBuffer;
pub use self::shm::ShmClientBuffer;

bitflags::bitflags! {
    /// Operations a [`BufferImplementation`] provides
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BufferCapabilities: u32 {
        /// The implementation can be destroyed. Mandatory.
        const DESTROY = 1;
        /// The implementation may describe its memory as a DMA-BUF
        const DMABUF = 2;
        /// The implementation can open a direct memory access session
        const BEGIN_DATA_PTR_ACCESS = 4;
        /// The implementation can close a direct memory access session
        const END_DATA_PTR_ACCESS = 8;
        /// Both halves of direct memory access
        const DATA_PTR_ACCESS = Self::BEGIN_DATA_PTR_ACCESS.bits() | Self::END_DATA_PTR_ACCESS.bits();
    }
}

/// Errors returned by buffer operations
#[derive(Debug, thiserror::Error)]
pub enum BufferError {
    /// The buffer does not provide the requested operation
    #[error("The buffer does not support this operation")]
    Unsupported,
    /// The memory backing the buffer is not available anymore
    #[error("The buffer contents are not available anymore")]
    Unavailable,
    /// The provided memory does not cover the described buffer
    #[error("The provided memory ({len} bytes) is too small for the buffer layout ({required} bytes)")]
    InvalidLayout {
        /// Size of the provided memory
        len: usize,
        /// Size required by stride and height
        required: usize,
    },
    /// The buffer has already been torn down
    #[error("The buffer has already been destroyed")]
    Destroyed,
}

/// An open direct memory access session
///
/// Returned by [`Buffer::begin_data_ptr_access`]. The memory described is valid until the
/// session is closed with [`Buffer::end_data_ptr_access`].
#[derive(Debug, Clone, Copy)]
pub struct DataPtrAccess {
    ptr: NonNull<u8>,
    len: usize,
    format: Fourcc,
    stride: u32,
}

impl DataPtrAccess {
    /// Describe a session over `data`.
    ///
    /// The implementation handing this out must keep `data` alive and unmodified until its
    /// session is closed.
    pub fn new(data: &[u8], format: Fourcc, stride: u32) -> Self {
        DataPtrAccess {
            ptr: NonNull::from(data).cast(),
            len: data.len(),
            format,
            stride,
        }
    }

    /// Pixel format of the memory
    pub fn format(&self) -> Fourcc {
        self.format
    }

    /// Bytes between the starts of two consecutive rows
    pub fn stride(&self) -> u32 {
        self.stride
    }

    /// Size of the accessible memory in bytes
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if no memory is accessible
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Raw pointer to the first byte
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    /// View the memory as a slice.
    ///
    /// # Safety
    ///
    /// The session this access belongs to must still be open, and the returned slice must not be
    /// used after it was closed.
    pub unsafe fn as_slice(&self) -> &[u8] {
        std::slice::from_raw_parts(self.ptr.as_ptr(), self.len)
    }
}

/// The variant-specific half of a [`Buffer`]
///
/// Implementations declare their operations through [`capabilities`](Self::capabilities).
/// [`Buffer`] only dispatches to operations the capabilities announce; default method bodies of
/// operations that are not announced are never called.
pub trait BufferImplementation: Downcast + fmt::Debug {
    /// Operations this implementation provides.
    ///
    /// Must contain [`BufferCapabilities::DESTROY`] and either both or none of the data pointer
    /// access flags.
    fn capabilities(&self) -> BufferCapabilities;

    /// Release the resources held by this implementation.
    ///
    /// Called exactly once, after the destroy listeners of the buffer have run.
    fn destroy(&mut self);

    /// Describe the memory as a DMA-BUF
    fn dmabuf(&self) -> Result<DmabufAttributes, BufferError> {
        Err(BufferError::Unsupported)
    }

    /// Open a direct memory access session
    fn begin_data_ptr_access(&mut self) -> Result<DataPtrAccess, BufferError> {
        Err(BufferError::Unsupported)
    }

    /// Close the session opened by [`begin_data_ptr_access`](Self::begin_data_ptr_access)
    fn end_data_ptr_access(&mut self) {}
}
impl_downcast!(BufferImplementation);

struct BufferInner {
    size: Size<i32, BufferCoords>,
    capabilities: BufferCapabilities,
    n_locks: Cell<usize>,
    dropped: Cell<bool>,
    destroyed: Cell<bool>,
    accessing_data_ptr: Cell<bool>,
    implementation: RefCell<Option<Box<dyn BufferImplementation>>>,
    destroy_signal: Signal<()>,
    release_signal: Signal<()>,
}

/// A reference-counted pixel buffer
///
/// Cloning the handle does not take a lock, two handles are equal if they refer to the same
/// buffer.
#[derive(Clone)]
pub struct Buffer(Rc<BufferInner>);

/// A non-owning handle to a [`Buffer`]
#[derive(Clone)]
pub struct WeakBuffer(Weak<BufferInner>);

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("id", &Rc::as_ptr(&self.0))
            .field("size", &self.0.size)
            .field("n_locks", &self.0.n_locks.get())
            .field("dropped", &self.0.dropped.get())
            .field("destroyed", &self.0.destroyed.get())
            .finish_non_exhaustive()
    }
}

impl fmt::Debug for WeakBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("WeakBuffer").field(&self.0.as_ptr()).finish()
    }
}

impl PartialEq for Buffer {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}
impl Eq for Buffer {}

impl Hash for Buffer {
    fn hash<H: Hasher>(&self, state: &mut H) {
        Rc::as_ptr(&self.0).hash(state)
    }
}

impl Buffer {
    /// Create a new buffer driven by `implementation`.
    ///
    /// # Panics
    ///
    /// If the implementation does not announce [`BufferCapabilities::DESTROY`], or announces
    /// only one half of the data pointer access operations.
    pub fn new<I>(implementation: I, size: impl Into<Size<i32, BufferCoords>>) -> Buffer
    where
        I: BufferImplementation,
    {
        let capabilities = implementation.capabilities();
        assert!(
            capabilities.contains(BufferCapabilities::DESTROY),
            "buffer implementation {:?} does not provide a destroy operation",
            implementation
        );
        if capabilities.intersects(BufferCapabilities::DATA_PTR_ACCESS) {
            assert!(
                capabilities.contains(BufferCapabilities::DATA_PTR_ACCESS),
                "buffer implementation {:?} provides only one half of data pointer access",
                implementation
            );
        }

        Buffer(Rc::new(BufferInner {
            size: size.into(),
            capabilities,
            n_locks: Cell::new(0),
            dropped: Cell::new(false),
            destroyed: Cell::new(false),
            accessing_data_ptr: Cell::new(false),
            implementation: RefCell::new(Some(Box::new(implementation))),
            destroy_signal: Signal::new(),
            release_signal: Signal::new(),
        }))
    }

    /// Size of the buffer in pixels
    pub fn size(&self) -> Size<i32, BufferCoords> {
        self.0.size
    }

    /// Width of the buffer in pixels
    pub fn width(&self) -> i32 {
        self.0.size.w
    }

    /// Height of the buffer in pixels
    pub fn height(&self) -> i32 {
        self.0.size.h
    }

    /// Operations announced by the implementation
    pub fn capabilities(&self) -> BufferCapabilities {
        self.0.capabilities
    }

    /// Amount of locks currently held
    pub fn n_locks(&self) -> usize {
        self.0.n_locks.get()
    }

    /// Whether [`drop`](Buffer::drop) has been called
    pub fn is_dropped(&self) -> bool {
        self.0.dropped.get()
    }

    /// Whether the buffer has been torn down
    pub fn is_destroyed(&self) -> bool {
        self.0.destroyed.get()
    }

    /// Whether a direct memory access session is open
    pub fn is_accessing_data_ptr(&self) -> bool {
        self.0.accessing_data_ptr.get()
    }

    /// Create a non-owning handle
    pub fn downgrade(&self) -> WeakBuffer {
        WeakBuffer(Rc::downgrade(&self.0))
    }

    /// Take a reference on the buffer, returning a handle to the same buffer.
    ///
    /// # Panics
    ///
    /// If the buffer has already been torn down.
    pub fn lock(&self) -> Buffer {
        assert!(!self.0.destroyed.get(), "attempted to lock a destroyed buffer");
        self.0.n_locks.set(self.0.n_locks.get() + 1);
        self.clone()
    }

    /// Give back a reference taken with [`lock`](Buffer::lock).
    ///
    /// Once no lock is left the release listeners are notified, then the buffer is torn down if
    /// it has already been dropped.
    ///
    /// # Panics
    ///
    /// If the buffer is not locked.
    pub fn unlock(&self) {
        let n_locks = self.0.n_locks.get();
        assert!(n_locks > 0, "buffer unlocked more often than it was locked");
        self.0.n_locks.set(n_locks - 1);

        if n_locks == 1 {
            self.0.release_signal.emit(&());
        }

        self.consider_destroy();
    }

    /// Signal that the creator does not need the buffer anymore.
    ///
    /// The buffer is torn down immediately if it is not locked, otherwise as soon as the last
    /// lock is given back.
    ///
    /// # Panics
    ///
    /// If the buffer has already been dropped.
    #[allow(clippy::should_implement_trait)]
    pub fn drop(&self) {
        assert!(!self.0.dropped.get(), "buffer dropped twice");
        self.0.dropped.set(true);
        self.consider_destroy();
    }

    fn consider_destroy(&self) {
        let inner = &self.0;
        if !inner.dropped.get() || inner.n_locks.get() > 0 || inner.destroyed.get() {
            return;
        }

        assert!(
            !inner.accessing_data_ptr.get(),
            "buffer torn down while its memory is being accessed"
        );
        inner.destroyed.set(true);
        trace!(buffer = ?Rc::as_ptr(inner), "destroying buffer");

        inner.destroy_signal.emit(&());

        let implementation = inner.implementation.borrow_mut().take();
        if let Some(mut implementation) = implementation {
            implementation.destroy();
        }

        inner.destroy_signal.clear();
        inner.release_signal.clear();
    }

    /// Describe the buffer memory as a DMA-BUF.
    ///
    /// The file descriptors of the returned attributes are owned by the buffer and stay valid
    /// while the buffer is locked.
    pub fn get_dma_handle(&self) -> Result<DmabufAttributes, BufferError> {
        if !self.0.capabilities.contains(BufferCapabilities::DMABUF) {
            return Err(BufferError::Unsupported);
        }

        match self.0.implementation.borrow().as_ref() {
            Some(implementation) => implementation.dmabuf(),
            None => Err(BufferError::Destroyed),
        }
    }

    /// Open a direct memory access session.
    ///
    /// Every successful call has to be matched by exactly one
    /// [`end_data_ptr_access`](Buffer::end_data_ptr_access). Prefer
    /// [`with_data_ptr`](Buffer::with_data_ptr), which does that for you.
    ///
    /// # Panics
    ///
    /// If a session is already open.
    pub fn begin_data_ptr_access(&self) -> Result<DataPtrAccess, BufferError> {
        assert!(
            !self.0.accessing_data_ptr.get(),
            "data pointer access on a buffer that is already being accessed"
        );
        if !self.0.capabilities.contains(BufferCapabilities::DATA_PTR_ACCESS) {
            return Err(BufferError::Unsupported);
        }

        let access = match self.0.implementation.borrow_mut().as_mut() {
            Some(implementation) => implementation.begin_data_ptr_access()?,
            None => return Err(BufferError::Destroyed),
        };
        self.0.accessing_data_ptr.set(true);
        Ok(access)
    }

    /// Close the session opened by [`begin_data_ptr_access`](Buffer::begin_data_ptr_access).
    ///
    /// # Panics
    ///
    /// If no session is open.
    pub fn end_data_ptr_access(&self) {
        assert!(
            self.0.accessing_data_ptr.get(),
            "ending data pointer access on a buffer that is not being accessed"
        );
        if let Some(implementation) = self.0.implementation.borrow_mut().as_mut() {
            implementation.end_data_ptr_access();
        }
        self.0.accessing_data_ptr.set(false);
    }

    /// Run `f` with the buffer memory, its format and its stride.
    ///
    /// The session is closed when `f` returns or unwinds.
    pub fn with_data_ptr<F, T>(&self, f: F) -> Result<T, BufferError>
    where
        F: FnOnce(&[u8], Fourcc, u32) -> T,
    {
        let access = self.begin_data_ptr_access()?;
        let _session = scopeguard::guard((), |()| self.end_data_ptr_access());

        // SAFETY: the session stays open until `_session` is dropped, after `f` returned
        let data = unsafe { access.as_slice() };
        Ok(f(data, access.format(), access.stride()))
    }

    /// Register a listener notified right before the buffer is torn down
    pub fn add_destroy_listener<F>(&self, f: F) -> HookId
    where
        F: Fn() + 'static,
    {
        self.0.destroy_signal.add(move |_| f())
    }

    /// Revoke a listener registered with [`add_destroy_listener`](Buffer::add_destroy_listener)
    pub fn remove_destroy_listener(&self, hook: &HookId) -> bool {
        self.0.destroy_signal.remove(hook)
    }

    /// Register a listener notified whenever the last lock is given back
    pub fn add_release_listener<F>(&self, f: F) -> HookId
    where
        F: Fn() + 'static,
    {
        self.0.release_signal.add(move |_| f())
    }

    /// Revoke a listener registered with [`add_release_listener`](Buffer::add_release_listener)
    pub fn remove_release_listener(&self, hook: &HookId) -> bool {
        self.0.release_signal.remove(hook)
    }

    /// Access the implementation, if it is of type `T` and the buffer is still alive
    pub fn with_implementation<T, F, R>(&self, f: F) -> Option<R>
    where
        T: BufferImplementation,
        F: FnOnce(&T) -> R,
    {
        let implementation = self.0.implementation.borrow();
        implementation
            .as_ref()
            .and_then(|implementation| implementation.downcast_ref::<T>())
            .map(f)
    }

    pub(crate) fn with_implementation_mut<T, F, R>(&self, f: F) -> Option<R>
    where
        T: BufferImplementation,
        F: FnOnce(&mut T) -> R,
    {
        let mut implementation = self.0.implementation.borrow_mut();
        implementation
            .as_mut()
            .and_then(|implementation| implementation.downcast_mut::<T>())
            .map(f)
    }
}

impl WeakBuffer {
    /// Try to get a handle to the buffer, fails once all handles are gone
    pub fn upgrade(&self) -> Option<Buffer> {
        self.0.upgrade().map(Buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{cell::RefCell, rc::Rc};

    #[derive(Debug)]
    struct TestBuffer {
        capabilities: BufferCapabilities,
        data: Vec<u8>,
        log: Rc<RefCell<Vec<&'static str>>>,
    }

    impl TestBuffer {
        fn new(capabilities: BufferCapabilities) -> (Self, Rc<RefCell<Vec<&'static str>>>) {
            let log = Rc::new(RefCell::new(Vec::new()));
            (
                TestBuffer {
                    capabilities,
                    data: vec![0xaa; 16],
                    log: log.clone(),
                },
                log,
            )
        }
    }

    impl BufferImplementation for TestBuffer {
        fn capabilities(&self) -> BufferCapabilities {
            self.capabilities
        }

        fn destroy(&mut self) {
            self.log.borrow_mut().push("destroy");
        }

        fn begin_data_ptr_access(&mut self) -> Result<DataPtrAccess, BufferError> {
            self.log.borrow_mut().push("begin");
            Ok(DataPtrAccess::new(&self.data, Fourcc::Argb8888, 8))
        }

        fn end_data_ptr_access(&mut self) {
            self.log.borrow_mut().push("end");
        }
    }

    fn test_buffer() -> (Buffer, Rc<RefCell<Vec<&'static str>>>) {
        let (implementation, log) =
            TestBuffer::new(BufferCapabilities::DESTROY | BufferCapabilities::DATA_PTR_ACCESS);
        (Buffer::new(implementation, (2, 2)), log)
    }

    fn destroy_count(log: &Rc<RefCell<Vec<&'static str>>>) -> usize {
        log.borrow().iter().filter(|entry| **entry == "destroy").count()
    }

    #[test]
    fn drop_without_locks_destroys_immediately() {
        let (buffer, log) = test_buffer();
        buffer.drop();
        assert!(buffer.is_destroyed());
        assert_eq!(destroy_count(&log), 1);
    }

    #[test]
    fn locks_never_destroy_before_drop() {
        let (buffer, log) = test_buffer();
        for _ in 0..3 {
            buffer.lock();
        }
        for _ in 0..3 {
            buffer.unlock();
        }
        assert_eq!(destroy_count(&log), 0);
        assert!(!buffer.is_destroyed());
    }

    #[test]
    fn teardown_waits_for_last_unlock() {
        let (buffer, log) = test_buffer();
        let locked = buffer.lock();
        assert_eq!(locked, buffer);
        buffer.lock();
        buffer.drop();
        assert_eq!(destroy_count(&log), 0);
        buffer.unlock();
        assert_eq!(destroy_count(&log), 0);
        buffer.unlock();
        assert_eq!(destroy_count(&log), 1);
    }

    /// Walks every valid sequence of lock/unlock/drop up to a fixed length and checks that
    /// teardown happens exactly when the buffer is dropped and unlocked.
    #[test]
    fn destroy_fires_exactly_once_for_all_sequences() {
        #[derive(Debug, Clone, Copy)]
        enum Op {
            Lock,
            Unlock,
            Drop,
        }

        fn walk(prefix: &mut Vec<Op>, depth: usize) {
            check(prefix);
            if depth == 0 {
                return;
            }
            for op in [Op::Lock, Op::Unlock, Op::Drop] {
                prefix.push(op);
                walk(prefix, depth - 1);
                prefix.pop();
            }
        }

        fn check(ops: &[Op]) {
            let (buffer, log) = test_buffer();
            let (mut locks, mut dropped) = (0usize, false);
            for op in ops {
                if buffer.is_destroyed() {
                    // nothing may be done with a destroyed buffer
                    return;
                }
                match op {
                    Op::Lock => {
                        buffer.lock();
                        locks += 1;
                    }
                    Op::Unlock if locks > 0 => {
                        buffer.unlock();
                        locks -= 1;
                    }
                    Op::Drop if !dropped => {
                        buffer.drop();
                        dropped = true;
                    }
                    _ => return,
                }
                let expected = usize::from(dropped && locks == 0);
                assert_eq!(destroy_count(&log), expected, "after {:?}", ops);
            }
        }

        walk(&mut Vec::new(), 6);
    }

    #[test]
    #[should_panic(expected = "unlocked more often")]
    fn unlock_without_lock_panics() {
        let (buffer, _log) = test_buffer();
        buffer.unlock();
    }

    #[test]
    #[should_panic(expected = "dropped twice")]
    fn double_drop_panics() {
        let (buffer, _log) = test_buffer();
        buffer.lock();
        buffer.drop();
        buffer.drop();
    }

    #[test]
    #[should_panic(expected = "does not provide a destroy operation")]
    fn missing_destroy_is_rejected_at_construction() {
        let (implementation, _log) = TestBuffer::new(BufferCapabilities::DMABUF);
        let _ = Buffer::new(implementation, (1, 1));
    }

    #[test]
    #[should_panic(expected = "only one half of data pointer access")]
    fn partial_data_ptr_access_is_rejected() {
        let (implementation, _log) =
            TestBuffer::new(BufferCapabilities::DESTROY | BufferCapabilities::BEGIN_DATA_PTR_ACCESS);
        let _ = Buffer::new(implementation, (1, 1));
    }

    #[test]
    #[should_panic(expected = "already being accessed")]
    fn nested_data_ptr_access_panics() {
        let (buffer, _log) = test_buffer();
        let _access = buffer.begin_data_ptr_access().unwrap();
        let _ = buffer.begin_data_ptr_access();
    }

    #[test]
    #[should_panic(expected = "while its memory is being accessed")]
    fn teardown_with_open_session_panics() {
        let (buffer, _log) = test_buffer();
        buffer.lock();
        let _access = buffer.begin_data_ptr_access().unwrap();
        buffer.drop();
        buffer.unlock();
    }

    #[test]
    #[should_panic(expected = "lock a destroyed buffer")]
    fn lock_after_teardown_panics() {
        let (buffer, _log) = test_buffer();
        buffer.drop();
        buffer.lock();
    }

    #[test]
    fn release_fires_on_last_unlock_only() {
        let (buffer, _log) = test_buffer();
        let releases = Rc::new(Cell::new(0));
        let counter = releases.clone();
        buffer.add_release_listener(move || counter.set(counter.get() + 1));

        buffer.lock();
        buffer.lock();
        buffer.unlock();
        assert_eq!(releases.get(), 0);
        buffer.unlock();
        assert_eq!(releases.get(), 1);
    }

    #[test]
    fn release_precedes_teardown() {
        let (buffer, log) = test_buffer();
        let release_log = log.clone();
        buffer.add_release_listener(move || release_log.borrow_mut().push("release"));
        let destroy_log = log.clone();
        buffer.add_destroy_listener(move || destroy_log.borrow_mut().push("destroy listener"));

        buffer.lock();
        buffer.drop();
        buffer.unlock();
        assert_eq!(*log.borrow(), vec!["release", "destroy listener", "destroy"]);
    }

    #[test]
    fn removed_destroy_listener_is_not_notified() {
        let (buffer, _log) = test_buffer();
        let fired = Rc::new(Cell::new(false));
        let flag = fired.clone();
        let hook = buffer.add_destroy_listener(move || flag.set(true));
        assert!(buffer.remove_destroy_listener(&hook));
        buffer.drop();
        assert!(!fired.get());
    }

    #[test]
    fn with_data_ptr_closes_the_session() {
        let (buffer, log) = test_buffer();
        let (len, format, stride) = buffer
            .with_data_ptr(|data, format, stride| (data.len(), format, stride))
            .unwrap();
        assert_eq!((len, format, stride), (16, Fourcc::Argb8888, 8));
        assert!(!buffer.is_accessing_data_ptr());
        assert_eq!(*log.borrow(), vec!["begin", "end"]);

        // a second session is allowed once the first one is closed
        buffer.with_data_ptr(|_, _, _| ()).unwrap();
    }

    #[test]
    fn missing_capabilities_are_unsupported() {
        let (implementation, _log) = TestBuffer::new(BufferCapabilities::DESTROY);
        let buffer = Buffer::new(implementation, (1, 1));
        assert!(matches!(buffer.get_dma_handle(), Err(BufferError::Unsupported)));
        assert!(matches!(
            buffer.begin_data_ptr_access(),
            Err(BufferError::Unsupported)
        ));
        assert!(!buffer.is_accessing_data_ptr());
    }

    #[test]
    fn implementation_downcast() {
        let (buffer, _log) = test_buffer();
        assert_eq!(buffer.with_implementation(|test: &TestBuffer| test.data.len()), Some(16));
        buffer.drop();
        assert_eq!(buffer.with_implementation(|test: &TestBuffer| test.data.len()), None);
    }
}
