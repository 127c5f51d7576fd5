//! Output geometry.
//!
//! A [`Viewport`] is the presentation target of a backend. `(x, y)` places
//! the output within the host's coordinate space; the compositor itself
//! always paints in output coordinates, starting at `(0, 0)`.
//!
//! ```
//! use gosub_compositor::render::Viewport;
//!
//! let mut vp = Viewport::new(1920, 0, 800, 600);
//! vp.resize(1024, 768);
//! assert_eq!(vp.screen_region().extents().x1, 0);
//! assert_eq!(vp.screen_region().area(), 1024 * 768);
//! ```

use crate::region::{Rect, Region};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Viewport {
    /// Position of the output on the host
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Viewport {
    pub fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    pub fn resize(&mut self, width: u32, height: u32) {
        self.width = width;
        self.height = height;
    }

    /// The painted area in output coordinates.
    pub fn bounds(&self) -> Rect {
        Rect::new(0, 0, self.width as i32, self.height as i32)
    }

    /// The whole output as a region: the screen that damage is clamped to.
    pub fn screen_region(&self) -> Region {
        Region::from_rect(self.bounds())
    }
}
