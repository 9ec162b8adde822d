//! Pixel format registry.
//!
//! Maps a [`Fourcc`] to its memory layout. Everything that needs to know how many bytes a pixel
//! occupies, or whether a format carries alpha, asks [`lookup`].
//!
//! ```
//! # use wlbuf::backend::allocator::Fourcc;
//! # use wlbuf::backend::allocator::format::{lookup, get_opaque};
//! let info = lookup(Fourcc::Argb8888).unwrap();
//! assert_eq!(info.bytes_per_pixel(), 4);
//! assert!(info.has_alpha);
//! assert_eq!(Some(Fourcc::Xrgb8888), get_opaque(Fourcc::Argb8888));
//! ```
//!
//! Client shared-memory buffers use the `wl_shm` format enumeration, which matches DRM fourcc
//! codes except for the two mandatory formats. [`shm_format_to_fourcc`] translates between them.

use super::Fourcc;

/// Layout description of a single pixel format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelFormatInfo {
    /// The described format
    pub fourcc: Fourcc,
    /// Bits per pixel, including padding
    pub bpp: usize,
    /// Bits per pixel actually carrying color or alpha
    pub depth: usize,
    /// Whether the format has an alpha channel
    pub has_alpha: bool,
    /// The same layout with the alpha channel ignored, if any
    pub opaque: Option<Fourcc>,
}

impl PixelFormatInfo {
    /// Bytes a single pixel occupies in memory
    pub const fn bytes_per_pixel(&self) -> usize {
        self.bpp / 8
    }

    /// Smallest stride able to hold a row of `width` pixels
    pub const fn min_stride(&self, width: u32) -> usize {
        width as usize * self.bytes_per_pixel()
    }

    /// Whether `stride` is usable for rows of `width` pixels of this format
    ///
    /// A stride has to be a whole number of pixels and large enough to hold a row.
    pub fn is_valid_stride(&self, stride: u32, width: u32) -> bool {
        let bytes_per_pixel = self.bytes_per_pixel();
        bytes_per_pixel != 0
            && stride as usize % bytes_per_pixel == 0
            && stride as usize >= self.min_stride(width)
    }
}

/// Generates the static format table.
macro_rules! pixel_formats {
    (@opaque) => {
        None
    };
    (@opaque $opaque: ident) => {
        Some(Fourcc::$opaque)
    };
    (
        $($fourcc: ident {
            $(opaque: $opaque: ident,)?
            alpha: $alpha: expr,
            bpp: $bpp: expr,
            depth: $depth: expr $(,)?
        }),* $(,)?
    ) => {
        static FORMATS: &[PixelFormatInfo] = &[
            $(
                PixelFormatInfo {
                    fourcc: Fourcc::$fourcc,
                    bpp: $bpp,
                    depth: $depth,
                    has_alpha: $alpha,
                    opaque: pixel_formats!(@opaque $($opaque)?),
                },
            )*
        ];
    };
}

pixel_formats! {
    // 8-bit bpp Red
    R8 { alpha: false, bpp: 8, depth: 8 },

    // 16-bit bpp RG
    Rg88 { alpha: false, bpp: 16, depth: 16 },
    Gr88 { alpha: false, bpp: 16, depth: 16 },

    // 16-bit bpp RGB, 4 bits per channel
    Argb4444 { opaque: Xrgb4444, alpha: true, bpp: 16, depth: 16 },
    Xrgb4444 { alpha: false, bpp: 16, depth: 12 },
    Abgr4444 { opaque: Xbgr4444, alpha: true, bpp: 16, depth: 16 },
    Xbgr4444 { alpha: false, bpp: 16, depth: 12 },

    // 16-bit bpp RGB, 5 bits per color channel, 1 bit for alpha channel
    Argb1555 { opaque: Xrgb1555, alpha: true, bpp: 16, depth: 16 },
    Xrgb1555 { alpha: false, bpp: 16, depth: 15 },
    Abgr1555 { opaque: Xbgr1555, alpha: true, bpp: 16, depth: 16 },
    Xbgr1555 { alpha: false, bpp: 16, depth: 15 },

    // 16-bit bpp RGB, no alpha
    Rgb565 { alpha: false, bpp: 16, depth: 16 },
    Bgr565 { alpha: false, bpp: 16, depth: 16 },

    // 24-bit bpp RGB
    Rgb888 { alpha: false, bpp: 24, depth: 24 },
    Bgr888 { alpha: false, bpp: 24, depth: 24 },

    // 32-bit bpp RGB, 8 bits per channel
    Argb8888 { opaque: Xrgb8888, alpha: true, bpp: 32, depth: 32 },
    Xrgb8888 { alpha: false, bpp: 32, depth: 24 },
    Abgr8888 { opaque: Xbgr8888, alpha: true, bpp: 32, depth: 32 },
    Xbgr8888 { alpha: false, bpp: 32, depth: 24 },
    Rgba8888 { opaque: Rgbx8888, alpha: true, bpp: 32, depth: 32 },
    Rgbx8888 { alpha: false, bpp: 32, depth: 24 },
    Bgra8888 { opaque: Bgrx8888, alpha: true, bpp: 32, depth: 32 },
    Bgrx8888 { alpha: false, bpp: 32, depth: 24 },

    // 32-bit bpp RGB with 10-bits per color channel
    Argb2101010 { opaque: Xrgb2101010, alpha: true, bpp: 32, depth: 32 },
    Xrgb2101010 { alpha: false, bpp: 32, depth: 30 },
    Abgr2101010 { opaque: Xbgr2101010, alpha: true, bpp: 32, depth: 32 },
    Xbgr2101010 { alpha: false, bpp: 32, depth: 30 },

    // Floating point 64bpp RGB, IEEE 754-2008 binary16 half-precision float
    Argb16161616f { opaque: Xrgb16161616f, alpha: true, bpp: 64, depth: 64 },
    Xrgb16161616f { alpha: false, bpp: 64, depth: 48 },
    Abgr16161616f { opaque: Xbgr16161616f, alpha: true, bpp: 64, depth: 64 },
    Xbgr16161616f { alpha: false, bpp: 64, depth: 48 },
}

/// Look up the layout of a format.
///
/// Returns [`None`] for formats this registry does not know about, like planar YUV layouts.
pub fn lookup(fourcc: Fourcc) -> Option<&'static PixelFormatInfo> {
    FORMATS.iter().find(|info| info.fourcc == fourcc)
}

/// All formats known to the registry, in table order
pub fn known_formats() -> impl Iterator<Item = Fourcc> {
    FORMATS.iter().map(|info| info.fourcc)
}

/// Returns the bits per pixel of the specified format.
///
/// Unknown formats will always return [`None`].
pub fn get_bpp(fourcc: Fourcc) -> Option<usize> {
    lookup(fourcc).map(|info| info.bpp)
}

/// Returns true if the format has an alpha channel.
///
/// Unknown formats will always return `false`.
pub fn has_alpha(fourcc: Fourcc) -> bool {
    lookup(fourcc).map(|info| info.has_alpha).unwrap_or(false)
}

/// Returns the opaque alternative of the specified format.
///
/// Unknown formats and formats without alpha will always return [`None`].
pub fn get_opaque(fourcc: Fourcc) -> Option<Fourcc> {
    lookup(fourcc).and_then(|info| info.opaque)
}

/// Returns the transparent alternative of the specified opaque format.
pub fn get_transparent(fourcc: Fourcc) -> Option<Fourcc> {
    FORMATS
        .iter()
        .find(|info| info.opaque == Some(fourcc))
        .map(|info| info.fourcc)
}

const WL_SHM_FORMAT_ARGB8888: u32 = 0;
const WL_SHM_FORMAT_XRGB8888: u32 = 1;

/// Translate a `wl_shm` format code into a DRM fourcc.
///
/// Returns [`None`] for codes that are not a known fourcc.
pub fn shm_format_to_fourcc(format: u32) -> Option<Fourcc> {
    match format {
        WL_SHM_FORMAT_ARGB8888 => Some(Fourcc::Argb8888),
        WL_SHM_FORMAT_XRGB8888 => Some(Fourcc::Xrgb8888),
        code => Fourcc::try_from(code).ok(),
    }
}

/// Translate a DRM fourcc into the matching `wl_shm` format code.
pub fn fourcc_to_shm_format(fourcc: Fourcc) -> u32 {
    match fourcc {
        Fourcc::Argb8888 => WL_SHM_FORMAT_ARGB8888,
        Fourcc::Xrgb8888 => WL_SHM_FORMAT_XRGB8888,
        code => code as u32,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Tests that opaque alternatives are not the same as the variant with alpha.
    #[test]
    fn opaque_neq() {
        for format in known_formats() {
            if let Some(opaque) = get_opaque(format) {
                assert_ne!(format, opaque, "{}'s opaque alternative is the same format", format);
            }
        }
    }

    /// Tests that opaque alternatives are cleanly converting back with get_transparent.
    #[test]
    fn opaque_inverse() {
        for format in known_formats() {
            if let Some(opaque) = get_opaque(format) {
                assert_eq!(Some(format), get_transparent(opaque));
            }
        }
    }

    /// Tests that opaque alternatives share the memory layout and drop the alpha channel.
    #[test]
    fn opaque_same_layout() {
        for format in known_formats() {
            if let Some(opaque) = get_opaque(format) {
                let info = lookup(opaque).expect("opaque alternative missing from the table");
                assert_eq!(get_bpp(format), Some(info.bpp));
                assert!(!info.has_alpha, "{} has alpha", opaque);
            }
        }
    }

    #[test]
    fn unknown_format() {
        assert_eq!(lookup(Fourcc::Nv12), None);
        assert!(!has_alpha(Fourcc::Nv12));
    }

    #[test]
    fn stride_validation() {
        let info = lookup(Fourcc::Xrgb8888).unwrap();
        assert!(info.is_valid_stride(64, 16));
        assert!(info.is_valid_stride(80, 16));
        // not a whole number of pixels
        assert!(!info.is_valid_stride(66, 16));
        // too small for the row
        assert!(!info.is_valid_stride(60, 16));
    }

    #[test]
    fn shm_codes() {
        assert_eq!(shm_format_to_fourcc(0), Some(Fourcc::Argb8888));
        assert_eq!(shm_format_to_fourcc(1), Some(Fourcc::Xrgb8888));
        assert_eq!(
            shm_format_to_fourcc(Fourcc::Abgr8888 as u32),
            Some(Fourcc::Abgr8888)
        );
        assert_eq!(shm_format_to_fourcc(0xdead_beef), None);
        assert_eq!(fourcc_to_shm_format(Fourcc::Argb8888), 0);
        assert_eq!(fourcc_to_shm_format(Fourcc::Rgb565), Fourcc::Rgb565 as u32);
    }
}
