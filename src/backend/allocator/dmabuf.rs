//! Module for [dmabuf](https://docs.kernel.org/driver-api/dma-buf.html) buffers.
//!
//! A DMA-BUF is described by up to [`MAX_PLANES`] planes, each referencing a file descriptor,
//! an offset into it and a row stride. Two types describe them:
//!
//! - [`Dmabuf`] owns its file descriptors and closes them when dropped,
//! - [`DmabufAttributes`] is a plain description that merely refers to descriptors owned by
//!   someone else. It is what buffers hand out to renderers.
//!
//! [`DmabufAttributes::try_duplicate`] turns a borrowed description into an owned one by
//! duplicating every file descriptor.

use super::{Fourcc, Modifier};
use crate::utils::{Buffer as BufferCoords, Size};

use smallvec::SmallVec;
use std::io;
use std::os::unix::io::{AsRawFd, BorrowedFd, OwnedFd, RawFd};

/// Maximum amount of planes this implementation supports
pub const MAX_PLANES: usize = 4;

bitflags::bitflags! {
    /// Possible flags for a DMA buffer
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DmabufFlags: u32 {
        /// The buffer content is Y-inverted
        const Y_INVERT = 1;
        /// The buffer content is interlaced
        const INTERLACED = 2;
        /// The buffer content if interlaced is bottom-field first
        const BOTTOM_FIRST = 4;
    }
}

/// A single plane of a DMA-BUF
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Plane {
    /// File descriptor backing this plane, not owned by the plane
    pub fd: RawFd,
    /// The plane index
    pub plane_idx: u32,
    /// Offset from the start of the fd
    pub offset: u32,
    /// Stride for this plane
    pub stride: u32,
}

/// Description of a DMA-BUF that does not own its file descriptors
///
/// The descriptors stay valid only as long as their owner keeps them open. An attribute set
/// without any plane describes nothing and is used to mark unusable buffers.
#[derive(Debug, Clone, PartialEq)]
pub struct DmabufAttributes {
    size: Size<i32, BufferCoords>,
    format: Fourcc,
    modifier: Modifier,
    flags: DmabufFlags,
    planes: SmallVec<[Plane; MAX_PLANES]>,
}

impl DmabufAttributes {
    /// An attribute set without planes, describing no usable memory
    pub fn empty(size: impl Into<Size<i32, BufferCoords>>, format: Fourcc) -> Self {
        DmabufAttributes {
            size: size.into(),
            format,
            modifier: Modifier::Invalid,
            flags: DmabufFlags::empty(),
            planes: SmallVec::new(),
        }
    }

    /// Size of the described buffer
    pub fn size(&self) -> Size<i32, BufferCoords> {
        self.size
    }

    /// Pixel format of the described buffer
    pub fn format(&self) -> Fourcc {
        self.format
    }

    /// Format modifier shared by all planes
    pub fn modifier(&self) -> Modifier {
        self.modifier
    }

    /// Flags of the described buffer
    pub fn flags(&self) -> DmabufFlags {
        self.flags
    }

    /// The planes, sorted by their index
    pub fn planes(&self) -> &[Plane] {
        &self.planes
    }

    /// The amount of planes
    pub fn num_planes(&self) -> usize {
        self.planes.len()
    }

    /// Returns `true` if no plane is described
    pub fn is_empty(&self) -> bool {
        self.planes.is_empty()
    }

    /// Returns raw handles of the planes of this buffer
    pub fn handles(&self) -> impl Iterator<Item = RawFd> + '_ {
        self.planes.iter().map(|p| p.fd)
    }

    /// Returns offsets for the planes of this buffer
    pub fn offsets(&self) -> impl Iterator<Item = u32> + '_ {
        self.planes.iter().map(|p| p.offset)
    }

    /// Returns strides for the planes of this buffer
    pub fn strides(&self) -> impl Iterator<Item = u32> + '_ {
        self.planes.iter().map(|p| p.stride)
    }

    /// Returns if the buffer is stored inverted on the y-axis
    pub fn y_inverted(&self) -> bool {
        self.flags.contains(DmabufFlags::Y_INVERT)
    }

    /// Deep-copy this description, duplicating every file descriptor.
    ///
    /// The returned [`Dmabuf`] owns the duplicates and stays usable after the
    /// original descriptors have been closed. The original descriptors must still
    /// be open when this is called.
    pub fn try_duplicate(&self) -> io::Result<Dmabuf> {
        let mut fds = SmallVec::<[OwnedFd; MAX_PLANES]>::new();
        let mut planes = SmallVec::<[Plane; MAX_PLANES]>::new();
        for plane in &self.planes {
            // SAFETY: the owner of these attributes keeps the descriptor open for the
            // duration of this call
            let borrowed = unsafe { BorrowedFd::borrow_raw(plane.fd) };
            let dup = rustix::io::fcntl_dupfd_cloexec(borrowed, 0).map_err(io::Error::from)?;
            planes.push(Plane {
                fd: dup.as_raw_fd(),
                ..*plane
            });
            fds.push(dup);
        }

        Ok(Dmabuf {
            attributes: DmabufAttributes {
                planes,
                ..self.clone()
            },
            _fds: fds,
        })
    }
}

/// A DMA-BUF owning the file descriptors of its planes
#[derive(Debug)]
pub struct Dmabuf {
    attributes: DmabufAttributes,
    _fds: SmallVec<[OwnedFd; MAX_PLANES]>,
}

impl Dmabuf {
    /// Create a new Dmabuf builder
    pub fn builder(
        size: impl Into<Size<i32, BufferCoords>>,
        format: Fourcc,
        modifier: Modifier,
        flags: DmabufFlags,
    ) -> DmabufBuilder {
        DmabufBuilder {
            attributes: DmabufAttributes {
                size: size.into(),
                format,
                modifier,
                flags,
                planes: SmallVec::new(),
            },
            fds: SmallVec::new(),
        }
    }

    /// Description of this buffer
    ///
    /// The descriptors referenced by the attributes are valid for as long as this `Dmabuf` lives.
    pub fn attributes(&self) -> &DmabufAttributes {
        &self.attributes
    }
}

/// Builder for [`Dmabuf`]s
#[derive(Debug)]
pub struct DmabufBuilder {
    attributes: DmabufAttributes,
    fds: SmallVec<[OwnedFd; MAX_PLANES]>,
}

impl DmabufBuilder {
    /// Add a plane to the constructed Dmabuf
    ///
    /// Returns `false` and drops `fd` if [`MAX_PLANES`] planes were already added.
    pub fn add_plane(&mut self, fd: OwnedFd, idx: u32, offset: u32, stride: u32) -> bool {
        if self.attributes.planes.len() == MAX_PLANES {
            return false;
        }
        self.attributes.planes.push(Plane {
            fd: fd.as_raw_fd(),
            plane_idx: idx,
            offset,
            stride,
        });
        self.fds.push(fd);
        true
    }

    /// Build a `Dmabuf` out of the provided parameters and planes
    ///
    /// Returns `None` if the builder has no planes attached.
    pub fn build(mut self) -> Option<Dmabuf> {
        if self.attributes.planes.is_empty() {
            return None;
        }

        self.attributes.planes.sort_by_key(|plane| plane.plane_idx);
        Some(Dmabuf {
            attributes: self.attributes,
            _fds: self.fds,
        })
    }
}
