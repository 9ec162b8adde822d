use std::{
    cell::{Cell, RefCell},
    fmt,
    rc::Rc,
};

use tracing::{error, trace};

use super::{
    required_len, ExternalImage, GpuBackend, GpuError, GpuHandle, ImportedImage, PartialUpdate,
    TextureTarget, WeakRenderer,
};
use crate::{
    backend::{
        allocator::{format::lookup, Fourcc},
        buffer::{Buffer, BufferError},
    },
    utils::{Buffer as BufferCoords, HookId, Point, Rectangle, Size},
};

crate::utils::ids::id_gen!(texture_ids);

/// Errors of texture creation and updates
#[derive(Debug, thiserror::Error)]
pub enum TextureError {
    /// The pixel format is unknown or not supported by the GPU
    #[error("Unsupported pixel format: {0}")]
    UnsupportedPixelFormat(Fourcc),
    /// The stride is not a whole number of pixels or too small for a row
    #[error("Invalid stride {stride} for width {width}")]
    InvalidStride {
        /// The given stride
        stride: u32,
        /// The given width
        width: u32,
    },
    /// Textures need a positive size
    #[error("Invalid texture size {0:?}")]
    InvalidSize(Size<i32, BufferCoords>),
    /// The texture was imported from foreign memory and cannot be written to
    #[error("Cannot write pixels to immutable texture")]
    Immutable,
    /// A region exceeds the texture or the provided pixel data
    #[error("The region exceeds the texture or the provided data")]
    OutOfBounds,
    /// The buffer exposes neither a DMA-BUF nor its memory
    #[error("The buffer provides neither a DMA-BUF nor direct memory access")]
    UnsupportedBuffer,
    /// The texture is not bound to an imported image
    #[error("The texture is not backed by an imported image")]
    NotImported,
    /// The texture has already been destroyed
    #[error("The texture has already been destroyed")]
    Destroyed,
    /// Accessing the buffer failed
    #[error(transparent)]
    Buffer(#[from] BufferError),
    /// The GPU reported an error
    #[error(transparent)]
    Gpu(#[from] GpuError),
}

/// Snapshot of the GPU-side description of a [`Texture`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureAttributes {
    /// Binding target
    pub target: TextureTarget,
    /// Texture object
    pub handle: GpuHandle,
    /// Whether the contents are stored upside down
    pub y_inverted: bool,
    /// Whether the contents carry an alpha channel
    pub has_alpha: bool,
}

struct TextureInner {
    id: usize,
    renderer: WeakRenderer,
    handle: GpuHandle,
    target: TextureTarget,
    image: Option<ExternalImage>,
    size: Size<i32, BufferCoords>,
    has_alpha: bool,
    y_inverted: bool,
    format: Option<Fourcc>,
    buffer: RefCell<Option<Buffer>>,
    buffer_destroy: RefCell<Option<HookId>>,
    destroyed: Cell<bool>,
}

impl Drop for TextureInner {
    fn drop(&mut self) {
        texture_ids::remove(self.id);
    }
}

/// A texture created by a [`Renderer`](super::Renderer)
///
/// Handles are cheap to clone and compare equal if they refer to the same texture.
#[derive(Clone)]
pub struct Texture(Rc<TextureInner>);

impl fmt::Debug for Texture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Texture")
            .field("id", &self.0.id)
            .field("handle", &self.0.handle)
            .field("target", &self.0.target)
            .field("size", &self.0.size)
            .field("format", &self.0.format)
            .field("buffer", &self.0.buffer.borrow().is_some())
            .field("destroyed", &self.0.destroyed.get())
            .finish()
    }
}

impl PartialEq for Texture {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}
impl Eq for Texture {}

impl Texture {
    pub(super) fn new(renderer: WeakRenderer, image: ImportedImage, format: Option<Fourcc>) -> Texture {
        Texture(Rc::new(TextureInner {
            id: texture_ids::next(),
            renderer,
            handle: image.handle,
            target: image.target,
            image: image.image,
            size: image.size,
            has_alpha: image.has_alpha,
            y_inverted: image.y_inverted,
            format,
            buffer: RefCell::new(None),
            buffer_destroy: RefCell::new(None),
            destroyed: Cell::new(false),
        }))
    }

    pub(super) fn id(&self) -> usize {
        self.0.id
    }

    /// Size of the texture in pixels
    pub fn size(&self) -> Size<i32, BufferCoords> {
        self.0.size
    }

    /// Width of the texture in pixels
    pub fn width(&self) -> i32 {
        self.0.size.w
    }

    /// Height of the texture in pixels
    pub fn height(&self) -> i32 {
        self.0.size.h
    }

    /// Pixel format the texture was uploaded from, [`None`] for imported textures
    pub fn format(&self) -> Option<Fourcc> {
        self.0.format
    }

    /// Whether the texture carries an alpha channel
    pub fn has_alpha(&self) -> bool {
        self.0.has_alpha
    }

    /// Whether the texture is fully opaque
    pub fn is_opaque(&self) -> bool {
        !self.0.has_alpha
    }

    /// Whether the contents are stored upside down
    pub fn y_inverted(&self) -> bool {
        self.0.y_inverted
    }

    /// Binding target of the texture
    pub fn target(&self) -> TextureTarget {
        self.0.target
    }

    /// GPU texture object
    pub fn handle(&self) -> GpuHandle {
        self.0.handle
    }

    /// GPU-side description of the texture
    pub fn attributes(&self) -> TextureAttributes {
        TextureAttributes {
            target: self.0.target,
            handle: self.0.handle,
            y_inverted: self.0.y_inverted,
            has_alpha: self.0.has_alpha,
        }
    }

    /// The buffer this texture was imported from, while both are alive
    pub fn buffer(&self) -> Option<Buffer> {
        self.0.buffer.borrow().clone()
    }

    /// Whether the texture has been destroyed
    pub fn is_destroyed(&self) -> bool {
        self.0.destroyed.get()
    }

    /// Whether [`write_pixels`](Texture::write_pixels) can be used
    ///
    /// Only textures uploaded from pixels are mutable.
    pub fn is_mutable(&self) -> bool {
        self.0.target == TextureTarget::Texture2D && self.0.image.is_none() && self.0.format.is_some()
    }

    pub(super) fn is_backed_by(&self, buffer: &Buffer) -> bool {
        self.0.buffer.borrow().as_ref() == Some(buffer)
    }

    /// Update a region of the texture.
    ///
    /// Copies the `size` region at `src` of `data`, laid out with `stride` bytes per row in the
    /// format of the texture, to `dst` in the texture.
    #[profiling::function]
    pub fn write_pixels(
        &self,
        stride: u32,
        size: Size<u32, BufferCoords>,
        src: Point<u32, BufferCoords>,
        dst: Point<u32, BufferCoords>,
        data: &[u8],
    ) -> Result<(), TextureError> {
        if self.is_destroyed() {
            return Err(TextureError::Destroyed);
        }
        let format = match self.0.format {
            Some(format) if self.is_mutable() => format,
            _ => {
                error!("Cannot write pixels to immutable texture");
                return Err(TextureError::Immutable);
            }
        };
        let info = lookup(format).ok_or(TextureError::UnsupportedPixelFormat(format))?;
        super::check_stride(info, stride, size.w)?;

        let bounds = Rectangle::<i64, BufferCoords>::from_loc_and_size(
            (0, 0),
            (self.0.size.w as i64, self.0.size.h as i64),
        );
        let region = Rectangle::<i64, BufferCoords>::from_loc_and_size(
            (dst.x as i64, dst.y as i64),
            (size.w as i64, size.h as i64),
        );
        if !bounds.contains_rect(region) || required_len(info, stride, src, size) > data.len() {
            error!(?size, ?src, ?dst, len = data.len(), "Region out of bounds");
            return Err(TextureError::OutOfBounds);
        }

        let renderer = self.0.renderer.upgrade().ok_or(TextureError::Destroyed)?;
        let update = PartialUpdate {
            format,
            stride,
            size,
            src,
            dst,
        };
        renderer
            .backend
            .borrow_mut()
            .partial_update(self.0.handle, &update, data)?;
        Ok(())
    }

    /// Bind the imported image again, so changes of the underlying memory become visible
    pub(super) fn invalidate(&self) -> Result<(), TextureError> {
        let image = self.0.image.ok_or(TextureError::NotImported)?;
        if self.0.target == TextureTarget::External {
            // external images pick up changes by themselves
            return Ok(());
        }

        let renderer = self.0.renderer.upgrade().ok_or(TextureError::Destroyed)?;
        renderer
            .backend
            .borrow_mut()
            .rebind_external_image(self.0.handle, image)?;
        Ok(())
    }

    /// Associate the texture with the buffer it was imported from.
    ///
    /// Takes a lock on the buffer and destroys the texture together with the buffer.
    pub(super) fn attach_buffer(&self, buffer: &Buffer) {
        let weak = Rc::downgrade(&self.0);
        let hook = buffer.add_destroy_listener(move || {
            if let Some(inner) = weak.upgrade() {
                Texture(inner).destroy_now();
            }
        });
        *self.0.buffer.borrow_mut() = Some(buffer.lock());
        *self.0.buffer_destroy.borrow_mut() = Some(hook);
    }

    /// Give up this reference to the texture.
    ///
    /// Textures imported from a buffer give back the lock taken on the buffer, they are destroyed
    /// together with the buffer. Other textures are destroyed immediately.
    pub fn destroy(&self) {
        let buffer = self.0.buffer.borrow().clone();
        match buffer {
            Some(buffer) => buffer.unlock(),
            None => self.destroy_now(),
        }
    }

    fn destroy_now(&self) {
        if self.is_destroyed() {
            return;
        }
        let Some(renderer) = self.0.renderer.upgrade() else {
            return;
        };

        let removed = renderer.textures.borrow_mut().shift_remove(&self.0.id);
        std::mem::drop(removed);
        let mut backend = renderer.backend.borrow_mut();
        self.release(&mut **backend);
    }

    /// Free the GPU resources, the texture must not be registered anymore
    pub(super) fn release(&self, backend: &mut dyn GpuBackend) {
        if self.0.destroyed.replace(true) {
            return;
        }
        trace!(texture = self.0.id, handle = ?self.0.handle, "destroying texture");

        let buffer = self.0.buffer.borrow_mut().take();
        let hook = self.0.buffer_destroy.borrow_mut().take();
        if let (Some(buffer), Some(hook)) = (buffer, hook) {
            buffer.remove_destroy_listener(&hook);
        }

        backend.release_gpu_handle(self.0.handle, self.0.image);
    }
}
