//! Texture import and caching
//!
//! The [`Renderer`] turns buffers into [`Texture`]s. The GPU itself is abstracted by the
//! [`GpuBackend`] trait, the renderer only decides *what* to import and keeps track of the
//! textures it handed out.
//!
//! ## Deduplication
//!
//! Buffers exposing a DMA-BUF are imported at most once: as long as a texture created from a
//! buffer is alive, [`Renderer::texture_from_buffer`] hands out that same texture again, after
//! rebinding its image since the buffer contents may have changed. Every call takes a lock on the
//! buffer, which is given back by [`Texture::destroy`]. The texture itself is destroyed together
//! with the buffer.
//!
//! Buffers only exposing their memory are uploaded into a new, mutable texture on every call.

use std::{
    cell::RefCell,
    fmt,
    rc::{Rc, Weak},
};

use downcast_rs::{impl_downcast, Downcast};
use indexmap::IndexMap;
use tracing::{error, info_span, instrument, trace};

use crate::{
    backend::{
        allocator::{
            dmabuf::DmabufAttributes,
            format::{known_formats, lookup, PixelFormatInfo},
            Fourcc,
        },
        buffer::{Buffer, BufferError},
    },
    utils::{Buffer as BufferCoords, Point, Size},
    wayland::buffer::NativeBuffer,
};

mod texture;

#[cfg(any(test, feature = "renderer_test"))]
pub mod test;

pub use self::texture::{Texture, TextureAttributes, TextureError};

/// Name of a texture object on the GPU
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GpuHandle(pub u32);

/// Handle of an image imported from memory not owned by the GPU
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExternalImage(pub u64);

/// Binding target of a texture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureTarget {
    /// A regular two-dimensional texture
    Texture2D,
    /// An external image that can only be sampled
    External,
}

/// Result of an import by the [`GpuBackend`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImportedImage {
    /// The texture object holding the image
    pub handle: GpuHandle,
    /// Binding target of `handle`
    pub target: TextureTarget,
    /// The external image `handle` is bound to, if any
    pub image: Option<ExternalImage>,
    /// Size of the image
    pub size: Size<i32, BufferCoords>,
    /// Whether the image carries an alpha channel
    pub has_alpha: bool,
    /// Whether the image is stored upside down
    pub y_inverted: bool,
}

/// Parameters of a partial texture upload
///
/// Copies the `size` region starting at `src` in the source memory to `dst` in the texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartialUpdate {
    /// Format of the source memory
    pub format: Fourcc,
    /// Bytes between two rows of the source memory
    pub stride: u32,
    /// Size of the copied region
    pub size: Size<u32, BufferCoords>,
    /// Location of the region in the source memory
    pub src: Point<u32, BufferCoords>,
    /// Location of the region in the texture
    pub dst: Point<u32, BufferCoords>,
}

/// Errors reported by a [`GpuBackend`]
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GpuError {
    /// The context was lost and needs to be recreated
    #[error("The GPU context was lost: {0}")]
    ContextLost(String),
    /// The pixel format cannot be used by the GPU
    #[error("Unsupported pixel format: {0}")]
    UnsupportedPixelFormat(Fourcc),
    /// A required extension is not available
    #[error("Required extension is not supported: {0}")]
    ExtensionNotSupported(&'static str),
    /// Creating an image from foreign memory failed
    #[error("Failed to import the buffer: {0}")]
    ImportFailed(String),
    /// Uploading pixels failed
    #[error("Failed to upload pixels: {0}")]
    UploadFailed(String),
    /// Binding an imported image to its texture failed
    #[error("Failed to bind the external image: {0}")]
    BindFailed(String),
}

/// The GPU operations a [`Renderer`] relies on
pub trait GpuBackend: Downcast + fmt::Debug {
    /// Whether pixel data of `format` can be uploaded
    fn supports_format(&self, format: Fourcc) -> bool;

    /// Upload pixels into a new two-dimensional texture
    fn import_from_pixels(
        &mut self,
        format: Fourcc,
        stride: u32,
        size: Size<i32, BufferCoords>,
        data: &[u8],
    ) -> Result<ImportedImage, GpuError>;

    /// Import a buffer shared through a legacy GPU protocol
    fn import_from_native_resource(&mut self, buffer: &NativeBuffer) -> Result<ImportedImage, GpuError>;

    /// Import a DMA-BUF as an external image
    fn import_from_dma_buf(&mut self, dmabuf: &DmabufAttributes) -> Result<ImportedImage, GpuError>;

    /// Upload a region of pixels into an existing texture
    fn partial_update(
        &mut self,
        texture: GpuHandle,
        update: &PartialUpdate,
        data: &[u8],
    ) -> Result<(), GpuError>;

    /// Bind `image` to `texture` again, picking up changes of the underlying memory
    fn rebind_external_image(&mut self, texture: GpuHandle, image: ExternalImage) -> Result<(), GpuError>;

    /// Delete a texture and the external image bound to it
    fn release_gpu_handle(&mut self, texture: GpuHandle, image: Option<ExternalImage>);
}
impl_downcast!(GpuBackend);

struct RendererInner {
    backend: RefCell<Box<dyn GpuBackend>>,
    textures: RefCell<IndexMap<usize, Texture>>,
    span: tracing::Span,
}

impl Drop for RendererInner {
    fn drop(&mut self) {
        let _guard = self.span.enter();
        let textures = std::mem::take(self.textures.get_mut());
        trace!(textures = textures.len(), "releasing remaining textures");
        let backend = self.backend.get_mut();
        for texture in textures.into_values() {
            texture.release(&mut **backend);
        }
    }
}

/// Imports buffers into textures and keeps track of all live textures
///
/// Cloning the handle does not create a new renderer.
#[derive(Clone)]
pub struct Renderer(Rc<RendererInner>);

impl fmt::Debug for Renderer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Renderer")
            .field("backend", &self.0.backend)
            .field("textures", &self.0.textures.borrow().len())
            .finish()
    }
}

impl Renderer {
    /// Create a renderer driving `backend`
    pub fn new<B: GpuBackend>(backend: B) -> Renderer {
        let span = info_span!(parent: None, "renderer");
        Renderer(Rc::new(RendererInner {
            backend: RefCell::new(Box::new(backend)),
            textures: RefCell::new(IndexMap::new()),
            span,
        }))
    }

    /// Run `f` with the backend, if it is of type `B`
    pub fn with_backend<B, F, R>(&self, f: F) -> Option<R>
    where
        B: GpuBackend,
        F: FnOnce(&mut B) -> R,
    {
        let mut backend = self.0.backend.borrow_mut();
        backend.downcast_mut::<B>().map(f)
    }

    /// All textures currently alive, in creation order
    pub fn textures(&self) -> Vec<Texture> {
        self.0.textures.borrow().values().cloned().collect()
    }

    /// Formats clients may use for shared-memory buffers
    ///
    /// Always contains [`Fourcc::Argb8888`] and [`Fourcc::Xrgb8888`], which every compositor has
    /// to support.
    pub fn shm_formats(&self) -> Vec<Fourcc> {
        let backend = self.0.backend.borrow();
        let mandatory = [Fourcc::Argb8888, Fourcc::Xrgb8888];
        mandatory
            .into_iter()
            .chain(known_formats().filter(|format| !mandatory.contains(format) && backend.supports_format(*format)))
            .collect()
    }

    /// Create a texture out of a buffer.
    ///
    /// Buffers exposing a DMA-BUF are imported without copying, and the texture is shared by all
    /// callers until the buffer is destroyed. In that case a lock is taken on the buffer, which
    /// [`Texture::destroy`] gives back.
    ///
    /// Buffers exposing their memory are uploaded into a new texture.
    #[instrument(level = "trace", parent = &self.0.span, skip(self))]
    #[profiling::function]
    pub fn texture_from_buffer(&self, buffer: &Buffer) -> Result<Texture, TextureError> {
        if let Ok(attributes) = buffer.get_dma_handle() {
            return self.texture_from_dmabuf_buffer(buffer, &attributes);
        }

        let size = buffer.size();
        match buffer.with_data_ptr(|data, format, stride| self.texture_from_pixels(format, stride, size, data)) {
            Ok(result) => result,
            Err(BufferError::Unsupported) => {
                error!("Cannot import buffer: neither a DMA-BUF nor direct memory access is available");
                Err(TextureError::UnsupportedBuffer)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Upload pixels into a new mutable texture
    #[instrument(level = "trace", parent = &self.0.span, skip(self, data))]
    #[profiling::function]
    pub fn texture_from_pixels(
        &self,
        format: Fourcc,
        stride: u32,
        size: Size<i32, BufferCoords>,
        data: &[u8],
    ) -> Result<Texture, TextureError> {
        let info = match lookup(format) {
            Some(info) if self.0.backend.borrow().supports_format(format) => info,
            _ => {
                error!(%format, "Unsupported pixel format");
                return Err(TextureError::UnsupportedPixelFormat(format));
            }
        };
        if size.w <= 0 || size.h <= 0 {
            return Err(TextureError::InvalidSize(size));
        }
        let (width, height) = (size.w as u32, size.h as u32);
        check_stride(info, stride, width)?;
        if required_len(info, stride, Point::from((0, 0)), Size::from((width, height))) > data.len() {
            error!(len = data.len(), "Pixel data is too small for the texture");
            return Err(TextureError::OutOfBounds);
        }

        let image = self
            .0
            .backend
            .borrow_mut()
            .import_from_pixels(format, stride, size, data)?;

        Ok(self.register(
            ImportedImage {
                target: TextureTarget::Texture2D,
                image: None,
                size,
                has_alpha: info.has_alpha,
                y_inverted: false,
                ..image
            },
            Some(format),
        ))
    }

    /// Import a buffer shared through a legacy GPU protocol into a new immutable texture
    #[instrument(level = "trace", parent = &self.0.span, skip(self))]
    #[profiling::function]
    pub fn texture_from_native(&self, buffer: &NativeBuffer) -> Result<Texture, TextureError> {
        let image = self.0.backend.borrow_mut().import_from_native_resource(buffer)?;
        Ok(self.register(image, None))
    }

    /// Import a DMA-BUF into a new immutable texture.
    ///
    /// The texture is not associated with any buffer, see [`Renderer::texture_from_buffer`] for
    /// deduplicated imports.
    #[instrument(level = "trace", parent = &self.0.span, skip(self))]
    #[profiling::function]
    pub fn texture_from_dmabuf(&self, attributes: &DmabufAttributes) -> Result<Texture, TextureError> {
        if attributes.is_empty() {
            error!("Cannot import a DMA-BUF without planes");
            return Err(TextureError::Buffer(BufferError::Unavailable));
        }

        let image = self.0.backend.borrow_mut().import_from_dma_buf(attributes)?;
        Ok(self.register(
            ImportedImage {
                size: attributes.size(),
                has_alpha: true,
                y_inverted: attributes.y_inverted(),
                ..image
            },
            None,
        ))
    }

    fn texture_from_dmabuf_buffer(
        &self,
        buffer: &Buffer,
        attributes: &DmabufAttributes,
    ) -> Result<Texture, TextureError> {
        let cached = self
            .0
            .textures
            .borrow()
            .values()
            .find(|texture| texture.is_backed_by(buffer))
            .cloned();

        if let Some(texture) = cached {
            // the buffer contents might have changed since the image was bound
            if let Err(err) = texture.invalidate() {
                error!(?err, "Failed to invalidate texture");
                return Err(err);
            }
            trace!(texture = texture.id(), "reusing texture of buffer");
            buffer.lock();
            return Ok(texture);
        }

        let texture = self.texture_from_dmabuf(attributes)?;
        texture.attach_buffer(buffer);
        Ok(texture)
    }

    fn register(&self, image: ImportedImage, format: Option<Fourcc>) -> Texture {
        let texture = Texture::new(Rc::downgrade(&self.0), image, format);
        trace!(texture = texture.id(), ?image, "new texture");
        self.0.textures.borrow_mut().insert(texture.id(), texture.clone());
        texture
    }
}

fn check_stride(info: &PixelFormatInfo, stride: u32, width: u32) -> Result<(), TextureError> {
    if info.is_valid_stride(stride, width) {
        return Ok(());
    }
    error!(
        stride,
        width,
        bytes_per_pixel = info.bytes_per_pixel(),
        "Invalid stride"
    );
    Err(TextureError::InvalidStride { stride, width })
}

/// Bytes needed to read the `size` region at `src` from memory with the given layout
fn required_len(
    info: &PixelFormatInfo,
    stride: u32,
    src: Point<u32, BufferCoords>,
    size: Size<u32, BufferCoords>,
) -> usize {
    if size.w == 0 || size.h == 0 {
        return 0;
    }
    let last_row = (src.y as u64 + size.h as u64 - 1) * stride as u64;
    let row_end = (src.x as u64 + size.w as u64) * info.bytes_per_pixel() as u64;
    usize::try_from(last_row + row_end).unwrap_or(usize::MAX)
}

type WeakRenderer = Weak<RendererInner>;
