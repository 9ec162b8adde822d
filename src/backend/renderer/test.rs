//! A recording [`GpuBackend`] for tests
//!
//! [`DummyBackend`] keeps the pixels of every texture in memory and records every call it
//! receives, so tests can observe what a [`Renderer`](super::Renderer) asked the GPU to do.
//! Failures can be injected per operation.

use std::collections::HashMap;

use tracing::trace;

use super::{ExternalImage, GpuBackend, GpuError, GpuHandle, ImportedImage, PartialUpdate, TextureTarget};
use crate::{
    backend::allocator::{dmabuf::DmabufAttributes, format::lookup, Fourcc},
    utils::{Buffer as BufferCoords, Size},
    wayland::buffer::NativeBuffer,
};

/// Kind of import a [`DummyBackend`] performed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportKind {
    /// Pixels uploaded from memory
    Pixels(Fourcc),
    /// A legacy GPU buffer
    Native(u64),
    /// A DMA-BUF
    Dmabuf(Fourcc),
}

#[derive(Debug)]
struct TextureStorage {
    width: u32,
    bytes_per_pixel: usize,
    pixels: Vec<u8>,
}

/// A [`GpuBackend`] recording its calls instead of talking to a GPU
#[derive(Debug, Default)]
pub struct DummyBackend {
    next_handle: u32,
    next_image: u64,
    external_only: bool,
    fail_imports: bool,
    fail_rebinds: bool,
    fail_update_at: Option<usize>,
    imports: Vec<(GpuHandle, ImportKind)>,
    updates: Vec<(GpuHandle, PartialUpdate)>,
    rebinds: Vec<GpuHandle>,
    released: Vec<(GpuHandle, Option<ExternalImage>)>,
    storage: HashMap<GpuHandle, TextureStorage>,
}

impl DummyBackend {
    /// Import DMA-BUFs as external-only images
    pub fn set_external_only(&mut self, external_only: bool) {
        self.external_only = external_only;
    }

    /// Let all imports fail
    pub fn set_fail_imports(&mut self, fail: bool) {
        self.fail_imports = fail;
    }

    /// Let rebinding external images fail
    pub fn set_fail_rebinds(&mut self, fail: bool) {
        self.fail_rebinds = fail;
    }

    /// Let the partial update with the given index fail, counting from the next update
    pub fn fail_update_at(&mut self, index: Option<usize>) {
        self.fail_update_at = index.map(|index| self.updates.len() + index);
    }

    /// All imports, in order
    pub fn imports(&self) -> &[(GpuHandle, ImportKind)] {
        &self.imports
    }

    /// All successful partial updates, in order
    pub fn updates(&self) -> &[(GpuHandle, PartialUpdate)] {
        &self.updates
    }

    /// All rebinds of external images, in order
    pub fn rebinds(&self) -> &[GpuHandle] {
        &self.rebinds
    }

    /// All released textures, in order
    pub fn released(&self) -> &[(GpuHandle, Option<ExternalImage>)] {
        &self.released
    }

    /// Amount of textures not released yet
    pub fn live_textures(&self) -> usize {
        self.imports.len() - self.released.len()
    }

    /// Pixels of a texture uploaded from memory, tightly packed
    pub fn pixels(&self, texture: GpuHandle) -> Option<&[u8]> {
        self.storage.get(&texture).map(|storage| &storage.pixels[..])
    }

    fn handle(&mut self) -> GpuHandle {
        self.next_handle += 1;
        GpuHandle(self.next_handle)
    }

    fn image(&mut self) -> ExternalImage {
        self.next_image += 1;
        ExternalImage(self.next_image)
    }

    fn check_import(&self) -> Result<(), GpuError> {
        if self.fail_imports {
            Err(GpuError::ImportFailed(String::from("injected failure")))
        } else {
            Ok(())
        }
    }
}

impl GpuBackend for DummyBackend {
    fn supports_format(&self, format: Fourcc) -> bool {
        lookup(format).is_some()
    }

    fn import_from_pixels(
        &mut self,
        format: Fourcc,
        stride: u32,
        size: Size<i32, BufferCoords>,
        data: &[u8],
    ) -> Result<ImportedImage, GpuError> {
        self.check_import()?;
        let info = lookup(format).ok_or(GpuError::UnsupportedPixelFormat(format))?;

        let bytes_per_pixel = info.bytes_per_pixel();
        let row_len = size.w as usize * bytes_per_pixel;
        let mut pixels = Vec::with_capacity(row_len * size.h as usize);
        for row in 0..size.h as usize {
            let start = row * stride as usize;
            let src = data
                .get(start..start + row_len)
                .ok_or_else(|| GpuError::UploadFailed(String::from("short pixel data")))?;
            pixels.extend_from_slice(src);
        }

        let handle = self.handle();
        trace!(?handle, %format, "uploading pixels");
        self.storage.insert(
            handle,
            TextureStorage {
                width: size.w as u32,
                bytes_per_pixel,
                pixels,
            },
        );
        self.imports.push((handle, ImportKind::Pixels(format)));
        Ok(ImportedImage {
            handle,
            target: TextureTarget::Texture2D,
            image: None,
            size,
            has_alpha: info.has_alpha,
            y_inverted: false,
        })
    }

    fn import_from_native_resource(&mut self, buffer: &NativeBuffer) -> Result<ImportedImage, GpuError> {
        self.check_import()?;
        let handle = self.handle();
        let image = self.image();
        self.imports.push((handle, ImportKind::Native(buffer.handle)));
        Ok(ImportedImage {
            handle,
            target: TextureTarget::Texture2D,
            image: Some(image),
            size: buffer.size,
            has_alpha: buffer.has_alpha,
            y_inverted: buffer.y_inverted,
        })
    }

    fn import_from_dma_buf(&mut self, dmabuf: &DmabufAttributes) -> Result<ImportedImage, GpuError> {
        self.check_import()?;
        let handle = self.handle();
        let image = self.image();
        self.imports.push((handle, ImportKind::Dmabuf(dmabuf.format())));
        Ok(ImportedImage {
            handle,
            target: if self.external_only {
                TextureTarget::External
            } else {
                TextureTarget::Texture2D
            },
            image: Some(image),
            size: dmabuf.size(),
            has_alpha: true,
            y_inverted: dmabuf.y_inverted(),
        })
    }

    fn partial_update(
        &mut self,
        texture: GpuHandle,
        update: &PartialUpdate,
        data: &[u8],
    ) -> Result<(), GpuError> {
        if self.fail_update_at == Some(self.updates.len()) {
            self.fail_update_at = None;
            return Err(GpuError::UploadFailed(String::from("injected failure")));
        }
        let storage = self
            .storage
            .get_mut(&texture)
            .ok_or_else(|| GpuError::UploadFailed(format!("{:?} is not a pixel texture", texture)))?;

        let bpp = storage.bytes_per_pixel;
        let row_len = update.size.w as usize * bpp;
        for row in 0..update.size.h as usize {
            let src = (update.src.y as usize + row) * update.stride as usize + update.src.x as usize * bpp;
            let dst = ((update.dst.y as usize + row) * storage.width as usize + update.dst.x as usize) * bpp;
            let src = data
                .get(src..src + row_len)
                .ok_or_else(|| GpuError::UploadFailed(String::from("short pixel data")))?;
            storage
                .pixels
                .get_mut(dst..dst + row_len)
                .ok_or_else(|| GpuError::UploadFailed(String::from("region exceeds texture")))?
                .copy_from_slice(src);
        }

        self.updates.push((texture, *update));
        Ok(())
    }

    fn rebind_external_image(&mut self, texture: GpuHandle, _image: ExternalImage) -> Result<(), GpuError> {
        if self.fail_rebinds {
            return Err(GpuError::BindFailed(String::from("injected failure")));
        }
        self.rebinds.push(texture);
        Ok(())
    }

    fn release_gpu_handle(&mut self, texture: GpuHandle, image: Option<ExternalImage>) {
        trace!(?texture, ?image, "releasing texture");
        self.storage.remove(&texture);
        self.released.push((texture, image));
    }
}
