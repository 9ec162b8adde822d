use std::fmt;
use std::marker::PhantomData;

/// Type-level marker for the buffer coordinate space
///
/// Pixel positions within a buffer, with the origin at the top-left corner of its memory.
#[derive(Debug)]
pub struct Buffer;

/// Numeric types usable as coordinates
pub trait Coordinate: Copy + Ord + fmt::Debug {
    /// The origin
    const ZERO: Self;
    /// Whether the value is zero or positive
    fn non_negative(self) -> bool;
    /// Addition stopping at the numeric bounds
    fn saturating_add(self, other: Self) -> Self;
    /// Subtraction stopping at the numeric bounds
    fn saturating_sub(self, other: Self) -> Self;
}

macro_rules! integer_coordinate {
    ($($ty:ty),*) => {
        $(
            impl Coordinate for $ty {
                const ZERO: $ty = 0;

                #[inline]
                #[allow(unused_comparisons)]
                fn non_negative(self) -> bool {
                    self >= 0
                }

                #[inline]
                fn saturating_add(self, other: Self) -> Self {
                    <$ty>::saturating_add(self, other)
                }

                #[inline]
                fn saturating_sub(self, other: Self) -> Self {
                    <$ty>::saturating_sub(self, other)
                }
            }
        )*
    };
}

integer_coordinate!(i32, u32, i64);

// `Kind` is only a marker, deriving would put bounds on it
macro_rules! pair_impls {
    ($name:ident { $a:ident, $b:ident }) => {
        impl<N: Copy, Kind> Clone for $name<N, Kind> {
            #[inline]
            fn clone(&self) -> Self {
                *self
            }
        }

        impl<N: Copy, Kind> Copy for $name<N, Kind> {}

        impl<N: PartialEq, Kind> PartialEq for $name<N, Kind> {
            #[inline]
            fn eq(&self, other: &Self) -> bool {
                self.$a == other.$a && self.$b == other.$b
            }
        }

        impl<N: Eq, Kind> Eq for $name<N, Kind> {}

        impl<N: fmt::Debug, Kind> fmt::Debug for $name<N, Kind> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_struct(stringify!($name))
                    .field(stringify!($a), &self.$a)
                    .field(stringify!($b), &self.$b)
                    .finish()
            }
        }
    };
}

/// A position, as x and y coordinates
#[repr(C)]
pub struct Point<N, Kind> {
    /// horizontal coordinate
    pub x: N,
    /// vertical coordinate
    pub y: N,
    _kind: PhantomData<Kind>,
}

pair_impls!(Point { x, y });

impl<N, Kind> From<(N, N)> for Point<N, Kind> {
    #[inline]
    fn from((x, y): (N, N)) -> Point<N, Kind> {
        Point {
            x,
            y,
            _kind: PhantomData,
        }
    }
}

/// Dimensions, as width and height
///
/// Constructing a negative size is caught by a `debug_assert!()`.
#[repr(C)]
pub struct Size<N, Kind> {
    /// horizontal extent
    pub w: N,
    /// vertical extent
    pub h: N,
    _kind: PhantomData<Kind>,
}

pair_impls!(Size { w, h });

impl<N: Coordinate, Kind> From<(N, N)> for Size<N, Kind> {
    #[inline]
    fn from((w, h): (N, N)) -> Size<N, Kind> {
        debug_assert!(
            w.non_negative() && h.non_negative(),
            "Attempting to create a `Size` of negative size: {:?}",
            (w, h)
        );
        Size {
            w,
            h,
            _kind: PhantomData,
        }
    }
}

/// A rectangle, as the location of its top-left corner and its size
///
/// Edges are computed with saturating arithmetic, so rectangles reaching past the numeric bounds
/// are cut off there.
#[repr(C)]
pub struct Rectangle<N, Kind> {
    /// Location of the top-left corner
    pub loc: Point<N, Kind>,
    /// Width and height
    pub size: Size<N, Kind>,
}

pair_impls!(Rectangle { loc, size });

impl<N: Coordinate, Kind> Rectangle<N, Kind> {
    /// Create a rectangle from its top-left corner and its size
    #[inline]
    pub fn from_loc_and_size(loc: impl Into<Point<N, Kind>>, size: impl Into<Size<N, Kind>>) -> Self {
        Rectangle {
            loc: loc.into(),
            size: size.into(),
        }
    }

    /// Create a rectangle of the given size at the origin
    #[inline]
    pub fn from_size(size: Size<N, Kind>) -> Self {
        Rectangle::from_loc_and_size((N::ZERO, N::ZERO), size)
    }

    #[inline]
    fn right(&self) -> N {
        self.loc.x.saturating_add(self.size.w)
    }

    #[inline]
    fn bottom(&self) -> N {
        self.loc.y.saturating_add(self.size.h)
    }

    /// Whether `rect` lies completely within this rectangle
    #[inline]
    pub fn contains_rect(self, rect: impl Into<Rectangle<N, Kind>>) -> bool {
        let rect = rect.into();
        rect.loc.x >= self.loc.x
            && rect.loc.y >= self.loc.y
            && rect.right() <= self.right()
            && rect.bottom() <= self.bottom()
    }

    /// The area covered by both rectangles
    ///
    /// Returns [`None`] if that area is empty, including for rectangles only touching each other.
    pub fn intersection(self, other: impl Into<Rectangle<N, Kind>>) -> Option<Self> {
        let other = other.into();
        let left = self.loc.x.max(other.loc.x);
        let top = self.loc.y.max(other.loc.y);
        let right = self.right().min(other.right());
        let bottom = self.bottom().min(other.bottom());
        if right <= left || bottom <= top {
            return None;
        }

        Some(Rectangle::from_loc_and_size(
            (left, top),
            (right.saturating_sub(left), bottom.saturating_sub(top)),
        ))
    }
}
