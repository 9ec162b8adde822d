use tracing::{debug, trace};

use super::{Buffer, BufferCapabilities, BufferError, BufferImplementation, DataPtrAccess};
use crate::{
    backend::allocator::Fourcc,
    utils::HookId,
    wayland::{
        buffer::WlBuffer,
        shm::{ShmBufferData, ShmPool},
    },
};

#[derive(Debug)]
enum ShmSource {
    Resource(WlBuffer),
    // the client destroyed the resource, the pool outlives it
    Saved { pool: ShmPool, data: ShmBufferData },
}

/// A [`Buffer`] exposing the memory of a shared-memory client buffer
///
/// Memory is read directly from the pool. Once the client destroys the resource, the buffer
/// keeps the pool alive so locked buffers stay readable. The resource is released whenever the
/// last lock on the buffer is given back.
#[derive(Debug)]
pub struct ShmClientBuffer {
    source: ShmSource,
    format: Fourcc,
    stride: u32,
    resource_destroy: Option<HookId>,
    access: Option<ShmPool>,
}

impl ShmClientBuffer {
    /// Create a buffer for a shared-memory resource.
    ///
    /// Fails with [`BufferError::Unsupported`] if `resource` is not a shared-memory buffer.
    pub fn create(resource: &WlBuffer) -> Result<Buffer, BufferError> {
        let (_, data) = resource.shm_data().ok_or(BufferError::Unsupported)?;

        let buffer = Buffer::new(
            ShmClientBuffer {
                source: ShmSource::Resource(resource.clone()),
                format: data.format,
                stride: data.stride as u32,
                resource_destroy: None,
                access: None,
            },
            (data.width, data.height),
        );

        let weak = buffer.downgrade();
        let hook = resource.add_destroy_listener(move || {
            if let Some(buffer) = weak.upgrade() {
                buffer.with_implementation_mut(ShmClientBuffer::handle_resource_destroy);
            }
        });
        buffer.with_implementation_mut(|shm: &mut ShmClientBuffer| shm.resource_destroy = Some(hook));

        let weak = buffer.downgrade();
        buffer.add_release_listener(move || {
            let resource = weak
                .upgrade()
                .and_then(|buffer| buffer.with_implementation(|shm: &ShmClientBuffer| shm.resource()))
                .flatten();
            if let Some(resource) = resource {
                resource.release();
            }
        });

        trace!(id = %resource.id(), ?data, "created shm client buffer");
        Ok(buffer)
    }

    /// The client resource, until the client destroys it
    pub fn resource(&self) -> Option<WlBuffer> {
        match &self.source {
            ShmSource::Resource(resource) => Some(resource.clone()),
            ShmSource::Saved { .. } => None,
        }
    }

    /// Pixel format of the buffer
    pub fn format(&self) -> Fourcc {
        self.format
    }

    /// Bytes between the starts of two consecutive rows
    pub fn stride(&self) -> u32 {
        self.stride
    }

    fn handle_resource_destroy(&mut self) {
        let ShmSource::Resource(resource) = &self.source else {
            return;
        };
        // the data is still attached while destroy listeners run
        let Some((pool, data)) = resource.shm_data() else {
            return;
        };
        debug!(id = %resource.id(), "shm resource destroyed, keeping its pool");
        self.source = ShmSource::Saved { pool, data };
        self.resource_destroy = None;
    }

    fn pool_and_data(&self) -> Option<(ShmPool, ShmBufferData)> {
        match &self.source {
            ShmSource::Resource(resource) => resource.shm_data(),
            ShmSource::Saved { pool, data } => Some((pool.clone(), *data)),
        }
    }
}

impl BufferImplementation for ShmClientBuffer {
    fn capabilities(&self) -> BufferCapabilities {
        BufferCapabilities::DESTROY | BufferCapabilities::DATA_PTR_ACCESS
    }

    fn destroy(&mut self) {
        if let (ShmSource::Resource(resource), Some(hook)) = (&self.source, self.resource_destroy.take()) {
            resource.remove_destroy_listener(&hook);
        }
    }

    fn begin_data_ptr_access(&mut self) -> Result<DataPtrAccess, BufferError> {
        let (pool, data) = self.pool_and_data().ok_or(BufferError::Unavailable)?;
        let access = pool.begin_access(&data).ok_or(BufferError::Unavailable)?;
        self.access = Some(pool);
        Ok(access)
    }

    fn end_data_ptr_access(&mut self) {
        if let Some(pool) = self.access.take() {
            pool.end_access();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::allocator::format::fourcc_to_shm_format;

    fn resource() -> (ShmPool, WlBuffer) {
        let pool = ShmPool::new(64).unwrap();
        pool.write(0, &[0xaa; 64]).unwrap();
        let resource = pool
            .create_buffer(0, 4, 4, 16, fourcc_to_shm_format(Fourcc::Argb8888))
            .unwrap();
        (pool, resource)
    }

    #[test]
    fn reads_the_pool_memory() {
        let (pool, resource) = resource();
        let buffer = ShmClientBuffer::create(&resource).unwrap();
        assert_eq!(buffer.size(), crate::utils::Size::from((4, 4)));

        buffer
            .with_data_ptr(|data, format, stride| {
                assert!(pool.is_accessed());
                assert_eq!(data, &[0xaa; 64][..]);
                assert_eq!((format, stride), (Fourcc::Argb8888, 16));
            })
            .unwrap();
        assert!(!pool.is_accessed());
        assert!(buffer.get_dma_handle().is_err());
        buffer.drop();
    }

    #[test]
    fn rejects_other_resources() {
        let resource = WlBuffer::new_unknown("wl_drm");
        assert!(matches!(
            ShmClientBuffer::create(&resource),
            Err(BufferError::Unsupported)
        ));
    }

    #[test]
    fn last_unlock_releases_the_resource() {
        let (_pool, resource) = resource();
        let buffer = ShmClientBuffer::create(&resource).unwrap();
        buffer.lock();
        buffer.lock();
        buffer.unlock();
        assert_eq!(resource.release_count(), 0);
        buffer.unlock();
        assert_eq!(resource.release_count(), 1);
        buffer.drop();
    }

    #[test]
    fn survives_resource_destruction() {
        let (pool, resource) = resource();
        let buffer = ShmClientBuffer::create(&resource).unwrap();
        buffer.lock();

        resource.destroy();
        drop(pool);
        assert!(buffer
            .with_implementation(|shm: &ShmClientBuffer| shm.resource().is_none())
            .unwrap());
        let contents = buffer.with_data_ptr(|data, _, _| data.to_vec()).unwrap();
        assert_eq!(contents, vec![0xaa; 64]);

        buffer.drop();
        buffer.unlock();
        assert!(buffer.is_destroyed());
        assert_eq!(resource.release_count(), 0);
    }

    #[test]
    fn destroy_unregisters_from_the_resource() {
        let (_pool, resource) = resource();
        let buffer = ShmClientBuffer::create(&resource).unwrap();
        buffer.drop();
        assert!(buffer.is_destroyed());
        // must not reach the torn down buffer
        resource.destroy();
    }
}
