//! Various utilities functions and types

mod geometry;
pub(crate) mod ids;
pub mod signal;

pub use self::geometry::{Buffer, Coordinate, Point, Rectangle, Size};
pub use self::signal::{HookId, Signal};
