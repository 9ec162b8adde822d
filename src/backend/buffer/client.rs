use tracing::{debug, error, instrument, trace};

use super::{Buffer, BufferCapabilities, BufferError, BufferImplementation, ShmClientBuffer};
use crate::{
    backend::{
        allocator::{dmabuf::DmabufAttributes, Fourcc},
        renderer::{Renderer, Texture, TextureError},
    },
    utils::{Buffer as BufferCoords, HookId, Point, Rectangle, Size},
    wayland::{
        buffer::{BufferKind, WlBuffer, ERROR_INVALID_OBJECT},
        shm::{with_buffer_contents, BufferAccessError},
    },
};

/// Errors of [`ClientBuffer::import`]
#[derive(Debug, thiserror::Error)]
pub enum ImportError {
    /// The resource was created by an unknown protocol extension, the client has been disconnected
    #[error("Unknown buffer type")]
    UnknownBufferType,
    /// The client already destroyed the resource
    #[error("The buffer resource has been destroyed")]
    ResourceDestroyed,
    /// Creating the texture failed
    #[error("Failed to import the buffer contents")]
    Texture(#[from] TextureError),
    /// Wrapping the resource failed
    #[error(transparent)]
    Buffer(#[from] BufferError),
}

/// Reasons [`ClientBuffer::apply_damage`] did not update the texture
///
/// In every case the buffer has to be imported again from scratch.
#[derive(Debug, thiserror::Error)]
pub enum DamageError {
    /// Someone besides the caller holds a lock on the buffer
    #[error("The buffer is locked {0} times")]
    Locked(usize),
    /// The buffer has been torn down
    #[error("The buffer has been destroyed")]
    Destroyed,
    /// Only shared-memory buffers can be updated in place
    #[error("The old or the new resource is not a shared-memory buffer")]
    NotShm,
    /// The pixel format changed
    #[error("The format changed from {old} to {new}")]
    FormatMismatch {
        /// Format of the texture
        old: Fourcc,
        /// Format of the new resource
        new: Fourcc,
    },
    /// The size changed
    #[error("The size changed from {old:?} to {new:?}")]
    SizeMismatch {
        /// Size of the texture
        old: Size<i32, BufferCoords>,
        /// Size of the new resource
        new: Size<i32, BufferCoords>,
    },
    /// Uploading a damaged region failed, the texture is partially updated
    #[error("Failed to upload damaged region")]
    Upload(#[source] TextureError),
    /// Reading the new resource failed
    #[error("Failed to access the new resource")]
    Access(#[source] BufferAccessError),
}

#[derive(Debug)]
struct ClientBufferImpl {
    resource: Option<WlBuffer>,
    resource_destroy: Option<HookId>,
    texture: Texture,
    resource_released: bool,
}

impl ClientBufferImpl {
    fn release_resource(&mut self) {
        if self.resource_released {
            return;
        }
        if let Some(resource) = &self.resource {
            resource.release();
            self.resource_released = true;
        }
    }

    fn handle_resource_destroy(&mut self) {
        // The texture stays: DMA-BUF textures keep their own reference to the client memory.
        // A client reusing that memory for something else makes the texture show garbage.
        self.resource = None;
        self.resource_destroy = None;
    }
}

impl BufferImplementation for ClientBufferImpl {
    fn capabilities(&self) -> BufferCapabilities {
        BufferCapabilities::DESTROY | BufferCapabilities::DMABUF
    }

    fn destroy(&mut self) {
        if !self.resource_released {
            if let Some(resource) = &self.resource {
                resource.release();
            }
        }
        if let (Some(resource), Some(hook)) = (&self.resource, self.resource_destroy.take()) {
            resource.remove_destroy_listener(&hook);
        }
        self.texture.destroy();
    }

    fn dmabuf(&self) -> Result<DmabufAttributes, BufferError> {
        self.resource
            .as_ref()
            .and_then(WlBuffer::dmabuf_buffer)
            .ok_or(BufferError::Unsupported)?
            .get_dma_handle()
    }
}

/// A [`Buffer`] wrapping a client resource together with the texture imported from it
///
/// The buffer releases the resource to the client once its last lock is given back, and
/// destroys the texture when it is torn down. The buffer does not keep the client from
/// destroying the resource; afterwards [`resource`](ClientBuffer::resource) returns [`None`].
///
/// For DMA-BUF resources the texture keeps referencing the client memory after the resource is
/// gone. If the client reuses that memory for other contents, the texture shows them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientBuffer {
    buffer: Buffer,
}

impl ClientBuffer {
    /// Import a client resource into a texture.
    ///
    /// The returned buffer is dropped and holds one lock, which the caller gives back with
    /// [`Buffer::unlock`] once it does not need the texture anymore.
    ///
    /// Resources of an unknown kind are a protocol violation: an error is posted on the resource
    /// and nothing is created.
    #[instrument(level = "trace", skip_all, fields(resource = %resource.id()))]
    #[profiling::function]
    pub fn import(renderer: &Renderer, resource: &WlBuffer) -> Result<ClientBuffer, ImportError> {
        let kind = resource.kind().ok_or(ImportError::ResourceDestroyed)?;

        let imported = match kind {
            BufferKind::Shm => {
                let buffer = ShmClientBuffer::create(resource)?;
                // the texture import is the only lock holder, unlocking releases the resource
                buffer.lock();
                buffer.drop();
                let texture = renderer.texture_from_buffer(&buffer);
                buffer.unlock();
                texture.map(|texture| (texture, true))
            }
            BufferKind::Native => {
                let native = resource.native().ok_or(ImportError::ResourceDestroyed)?;
                renderer.texture_from_native(&native).map(|texture| (texture, false))
            }
            BufferKind::Dmabuf => {
                let buffer = resource.dmabuf_buffer().ok_or(ImportError::ResourceDestroyed)?;
                // unlocking the DMA-BUF buffer releases the resource
                renderer.texture_from_buffer(&buffer).map(|texture| (texture, true))
            }
            BufferKind::Unknown => {
                error!("Cannot upload texture: unknown buffer type");
                resource.post_error(ERROR_INVALID_OBJECT, "unknown buffer type");
                return Err(ImportError::UnknownBufferType);
            }
        };

        let (texture, resource_released) = match imported {
            Ok(imported) => imported,
            Err(err) => {
                error!(?err, "Failed to upload texture");
                resource.release();
                return Err(err.into());
            }
        };

        let buffer = Buffer::new(
            ClientBufferImpl {
                resource: Some(resource.clone()),
                resource_destroy: None,
                texture: texture.clone(),
                resource_released,
            },
            texture.size(),
        );
        let hook = listen_for_resource_destroy(&buffer, resource);
        buffer.with_implementation_mut(|client: &mut ClientBufferImpl| client.resource_destroy = Some(hook));

        let weak = buffer.downgrade();
        buffer.add_release_listener(move || {
            if let Some(buffer) = weak.upgrade() {
                buffer.with_implementation_mut(ClientBufferImpl::release_resource);
            }
        });

        // the caller holds the only lock, the buffer goes away with it
        buffer.lock();
        buffer.drop();

        trace!(?kind, texture = ?texture.handle(), "imported client buffer");
        Ok(ClientBuffer { buffer })
    }

    /// Recover the client buffer a generic [`Buffer`] belongs to
    pub fn get(buffer: &Buffer) -> Option<ClientBuffer> {
        buffer
            .with_implementation(|_: &ClientBufferImpl| ())
            .map(|()| ClientBuffer { buffer: buffer.clone() })
    }

    /// The generic buffer
    pub fn buffer(&self) -> &Buffer {
        &self.buffer
    }

    /// The imported texture, until the buffer is torn down
    pub fn texture(&self) -> Option<Texture> {
        self.buffer
            .with_implementation(|client: &ClientBufferImpl| client.texture.clone())
    }

    /// The client resource, until the client destroys it
    pub fn resource(&self) -> Option<WlBuffer> {
        self.buffer
            .with_implementation(|client: &ClientBufferImpl| client.resource.clone())
            .flatten()
    }

    /// Whether the client has been told it may reuse the resource
    pub fn resource_released(&self) -> bool {
        self.buffer
            .with_implementation(|client: &ClientBufferImpl| client.resource_released)
            .unwrap_or(true)
    }

    /// Update the texture in place with the damaged regions of a new shared-memory resource.
    ///
    /// Only applicable if the caller holds the only lock on the buffer, and the old and the new
    /// resource are shared-memory buffers of the same format and size. Regions are clipped to the
    /// buffer and uploaded in the given order; the first failing upload aborts the update.
    ///
    /// On success the new resource is released and replaces the old one. On failure the caller
    /// has to import the new resource from scratch.
    #[instrument(level = "trace", skip_all, fields(resource = %resource.id(), damage = damage.len()))]
    #[profiling::function]
    pub fn apply_damage(
        &self,
        resource: &WlBuffer,
        damage: &[Rectangle<i32, BufferCoords>],
    ) -> Result<(), DamageError> {
        let n_locks = self.buffer.n_locks();
        if n_locks > 1 {
            return Err(DamageError::Locked(n_locks));
        }

        let (texture, old_resource) = self
            .buffer
            .with_implementation(|client: &ClientBufferImpl| (client.texture.clone(), client.resource.clone()))
            .ok_or(DamageError::Destroyed)?;

        let (_, new) = resource.shm_data().ok_or(DamageError::NotShm)?;
        let (_, old) = old_resource
            .as_ref()
            .and_then(WlBuffer::shm_data)
            .ok_or(DamageError::NotShm)?;
        if old.format != new.format {
            return Err(DamageError::FormatMismatch {
                old: old.format,
                new: new.format,
            });
        }
        let new_size = Size::from((new.width, new.height));
        if texture.size() != new_size {
            return Err(DamageError::SizeMismatch {
                old: texture.size(),
                new: new_size,
            });
        }

        let bounds = Rectangle::from_size(texture.size());
        with_buffer_contents(resource, |data, shm| {
            damage
                .iter()
                .filter_map(|rect| bounds.intersection(*rect))
                .try_for_each(|rect| upload_region(&texture, data, shm.stride as u32, &rect))
        })
        .map_err(DamageError::Access)?
        .map_err(|err| {
            error!(?err, "Failed to upload damaged region");
            DamageError::Upload(err)
        })?;

        resource.release();

        let hook = listen_for_resource_destroy(&self.buffer, resource);
        self.buffer.with_implementation_mut(|client: &mut ClientBufferImpl| {
            if let (Some(old), Some(old_hook)) = (&client.resource, client.resource_destroy.take()) {
                old.remove_destroy_listener(&old_hook);
            }
            client.resource = Some(resource.clone());
            client.resource_destroy = Some(hook);
            client.resource_released = true;
        });

        debug!(regions = damage.len(), "applied damage to client buffer");
        Ok(())
    }
}

fn listen_for_resource_destroy(buffer: &Buffer, resource: &WlBuffer) -> HookId {
    let weak = buffer.downgrade();
    resource.add_destroy_listener(move || {
        if let Some(buffer) = weak.upgrade() {
            buffer.with_implementation_mut(ClientBufferImpl::handle_resource_destroy);
        }
    })
}

fn upload_region(
    texture: &Texture,
    data: &[u8],
    stride: u32,
    rect: &Rectangle<i32, BufferCoords>,
) -> Result<(), TextureError> {
    let (Ok(x), Ok(y), Ok(w), Ok(h)) = (
        u32::try_from(rect.loc.x),
        u32::try_from(rect.loc.y),
        u32::try_from(rect.size.w),
        u32::try_from(rect.size.h),
    ) else {
        return Err(TextureError::OutOfBounds);
    };
    let loc = Point::from((x, y));
    texture.write_pixels(stride, Size::from((w, h)), loc, loc, data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::{
            allocator::format::fourcc_to_shm_format,
            renderer::{test::DummyBackend, GpuError},
        },
        wayland::{buffer::NativeBuffer, shm::ShmPool},
    };

    fn shm_resource(pool: &ShmPool, format: Fourcc, size: (i32, i32)) -> WlBuffer {
        pool.create_buffer(0, size.0, size.1, size.0 * 4, fourcc_to_shm_format(format))
            .unwrap()
    }

    #[test]
    fn shm_import_releases_the_resource() {
        let renderer = Renderer::new(DummyBackend::default());
        let pool = ShmPool::new(8 * 8 * 4).unwrap();
        let resource = shm_resource(&pool, Fourcc::Argb8888, (8, 8));

        let client = ClientBuffer::import(&renderer, &resource).unwrap();
        assert_eq!(resource.release_count(), 1);
        assert!(client.resource_released());
        assert_eq!(client.buffer().n_locks(), 1);
        assert!(client.buffer().is_dropped());
        assert_eq!(ClientBuffer::get(client.buffer()), Some(client.clone()));

        let texture = client.texture().unwrap();
        assert!(texture.is_mutable());
        client.buffer().unlock();
        assert!(client.buffer().is_destroyed());
        assert!(texture.is_destroyed());
        assert_eq!(resource.release_count(), 1);
    }

    #[test]
    fn native_import_releases_on_unlock() {
        let renderer = Renderer::new(DummyBackend::default());
        let resource = WlBuffer::new_native(NativeBuffer {
            handle: 3,
            size: (16, 16).into(),
            has_alpha: true,
            y_inverted: false,
        });

        let client = ClientBuffer::import(&renderer, &resource).unwrap();
        assert!(!client.resource_released());
        assert!(!client.texture().unwrap().is_mutable());
        assert_eq!(resource.release_count(), 0);

        client.buffer().unlock();
        assert_eq!(resource.release_count(), 1);
        assert!(renderer.textures().is_empty());
    }

    #[test]
    fn unknown_resources_are_rejected() {
        let renderer = Renderer::new(DummyBackend::default());
        let resource = WlBuffer::new_unknown("wp_single_pixel_buffer_v1");
        assert!(matches!(
            ClientBuffer::import(&renderer, &resource),
            Err(ImportError::UnknownBufferType)
        ));
        assert_eq!(resource.protocol_error().map(|err| err.code), Some(ERROR_INVALID_OBJECT));
        assert!(renderer.textures().is_empty());
    }

    #[test]
    fn failed_import_releases_the_resource() {
        let mut backend = DummyBackend::default();
        backend.set_fail_imports(true);
        let renderer = Renderer::new(backend);
        let resource = WlBuffer::new_native(NativeBuffer {
            handle: 3,
            size: (16, 16).into(),
            has_alpha: true,
            y_inverted: false,
        });

        assert!(matches!(
            ClientBuffer::import(&renderer, &resource),
            Err(ImportError::Texture(TextureError::Gpu(GpuError::ImportFailed(_))))
        ));
        assert_eq!(resource.release_count(), 1);
    }

    #[test]
    fn resource_destruction_keeps_the_texture() {
        let renderer = Renderer::new(DummyBackend::default());
        let pool = ShmPool::new(8 * 8 * 4).unwrap();
        let resource = shm_resource(&pool, Fourcc::Argb8888, (8, 8));
        let client = ClientBuffer::import(&renderer, &resource).unwrap();

        resource.destroy();
        assert!(client.resource().is_none());
        assert!(!client.texture().unwrap().is_destroyed());
        client.buffer().unlock();
    }

    #[test]
    fn damage_requires_a_single_lock() {
        let renderer = Renderer::new(DummyBackend::default());
        let pool = ShmPool::new(8 * 8 * 4).unwrap();
        let client = ClientBuffer::import(&renderer, &shm_resource(&pool, Fourcc::Argb8888, (8, 8))).unwrap();
        let next = shm_resource(&pool, Fourcc::Argb8888, (8, 8));

        client.buffer().lock();
        assert!(matches!(
            client.apply_damage(&next, &[Rectangle::from_loc_and_size((0, 0), (1, 1))]),
            Err(DamageError::Locked(2))
        ));
        client.buffer().unlock();
        client.buffer().unlock();
    }

    #[test]
    fn damage_rejects_layout_changes() {
        let renderer = Renderer::new(DummyBackend::default());
        let pool = ShmPool::new(8 * 8 * 4).unwrap();
        let client = ClientBuffer::import(&renderer, &shm_resource(&pool, Fourcc::Argb8888, (8, 8))).unwrap();
        let damage = [Rectangle::from_loc_and_size((0, 0), (4, 4))];

        let other_format = shm_resource(&pool, Fourcc::Xrgb8888, (8, 8));
        assert!(matches!(
            client.apply_damage(&other_format, &damage),
            Err(DamageError::FormatMismatch { .. })
        ));
        let other_size = shm_resource(&pool, Fourcc::Argb8888, (4, 8));
        assert!(matches!(
            client.apply_damage(&other_size, &damage),
            Err(DamageError::SizeMismatch { .. })
        ));
        let native = WlBuffer::new_native(NativeBuffer {
            handle: 1,
            size: (8, 8).into(),
            has_alpha: true,
            y_inverted: false,
        });
        assert!(matches!(
            client.apply_damage(&native, &damage),
            Err(DamageError::NotShm)
        ));

        let updates = renderer.with_backend(|backend: &mut DummyBackend| backend.updates().len());
        assert_eq!(updates, Some(0));
        assert_eq!(other_format.release_count(), 0);
        client.buffer().unlock();
    }

    #[test]
    fn damage_is_applied_in_order() {
        let renderer = Renderer::new(DummyBackend::default());
        let pool = ShmPool::new(8 * 8 * 4).unwrap();
        let first = shm_resource(&pool, Fourcc::Argb8888, (8, 8));
        let client = ClientBuffer::import(&renderer, &first).unwrap();
        let second = shm_resource(&pool, Fourcc::Argb8888, (8, 8));

        let damage = [
            Rectangle::from_loc_and_size((0, 0), (4, 4)),
            Rectangle::from_loc_and_size((2, 2), (6, 6)),
        ];
        client.apply_damage(&second, &damage).unwrap();

        let updates = renderer
            .with_backend(|backend: &mut DummyBackend| backend.updates().to_vec())
            .unwrap();
        let regions = updates
            .iter()
            .map(|(_, update)| (update.dst, update.size))
            .collect::<Vec<_>>();
        let expected: Vec<(Point<u32, BufferCoords>, Size<u32, BufferCoords>)> = vec![
            (Point::from((0, 0)), Size::from((4, 4))),
            (Point::from((2, 2)), Size::from((6, 6))),
        ];
        assert_eq!(regions, expected);
        assert_eq!(client.resource(), Some(second.clone()));
        assert_eq!(second.release_count(), 1);

        // the old resource is not observed anymore
        first.destroy();
        assert_eq!(client.resource(), Some(second.clone()));
        second.destroy();
        assert!(client.resource().is_none());
        client.buffer().unlock();
    }

    #[test]
    fn failed_upload_aborts_the_damage() {
        let renderer = Renderer::new(DummyBackend::default());
        let pool = ShmPool::new(8 * 8 * 4).unwrap();
        let client = ClientBuffer::import(&renderer, &shm_resource(&pool, Fourcc::Argb8888, (8, 8))).unwrap();
        let next = shm_resource(&pool, Fourcc::Argb8888, (8, 8));
        renderer.with_backend(|backend: &mut DummyBackend| backend.fail_update_at(Some(1)));

        let damage = [
            Rectangle::from_loc_and_size((0, 0), (2, 2)),
            Rectangle::from_loc_and_size((2, 2), (2, 2)),
            Rectangle::from_loc_and_size((4, 4), (2, 2)),
        ];
        assert!(matches!(
            client.apply_damage(&next, &damage),
            Err(DamageError::Upload(TextureError::Gpu(_)))
        ));
        let updates = renderer.with_backend(|backend: &mut DummyBackend| backend.updates().len());
        assert_eq!(updates, Some(1));
        assert_eq!(next.release_count(), 0);

        client.buffer().unlock();
    }

    #[test]
    fn damage_is_clipped_to_the_buffer() {
        let renderer = Renderer::new(DummyBackend::default());
        let pool = ShmPool::new(8 * 8 * 4).unwrap();
        let client = ClientBuffer::import(&renderer, &shm_resource(&pool, Fourcc::Argb8888, (8, 8))).unwrap();
        let next = shm_resource(&pool, Fourcc::Argb8888, (8, 8));

        let damage = [
            Rectangle::from_loc_and_size((4, 4), (i32::MAX, i32::MAX)),
            Rectangle::from_loc_and_size((-2, 6), (4, 4)),
            Rectangle::from_loc_and_size((8, 0), (4, 4)),
        ];
        client.apply_damage(&next, &damage).unwrap();

        let regions = renderer
            .with_backend(|backend: &mut DummyBackend| {
                backend
                    .updates()
                    .iter()
                    .map(|(_, update)| (update.dst, update.size))
                    .collect::<Vec<_>>()
            })
            .unwrap();
        let expected: Vec<(Point<u32, BufferCoords>, Size<u32, BufferCoords>)> = vec![
            (Point::from((4, 4)), Size::from((4, 4))),
            (Point::from((0, 6)), Size::from((2, 2))),
        ];
        assert_eq!(regions, expected);
        assert_eq!(next.release_count(), 1);
        client.buffer().unlock();
    }
}
