//! Recorded backend operations.
//!
//! Backends that do not rasterize anything (see
//! [`NullBackend`](crate::render::backends::null::NullBackend)) append every
//! call they receive to a [`RenderList`] as a [`RenderOp`]. Tests use the list
//! to check what a frame asked the backend to do and in which order.
//!
//! # Example
//!
//! ```rust
//! use gosub_compositor::region::{Rect, Region};
//! use gosub_compositor::render::{Color, RenderList, RenderOp};
//!
//! let mut list = RenderList::new();
//! list.add_command(RenderOp::Fill {
//!     color: Color::from_u8(255, 0, 0, 255),
//!     region: Region::from_rect(Rect::new(0, 0, 10, 10)),
//! });
//! assert_eq!(list.count(|op| matches!(op, RenderOp::Fill { .. })), 1);
//! ```

use crate::region::Region;
use crate::render::ImageOp;

/// RGBA color used for fills.
///
/// Channels are represented as `f32` in the range `0.0 ..= 1.0` and are not
/// premultiplied.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Color {
    /// Red channel
    pub r: f32,
    /// Green channel
    pub g: f32,
    /// Blue channel
    pub b: f32,
    /// Alpha channel (opacity)
    pub a: f32,
}

impl Color {
    pub const TRANSPARENT: Color = Color::new(0.0, 0.0, 0.0, 0.0);
    pub const BLACK: Color = Color::new(0.0, 0.0, 0.0, 1.0);

    /// Creates a new color from `f32` channel values in the range `0.0 ..= 1.0`.
    pub const fn new(r: f32, g: f32, b: f32, a: f32) -> Color {
        Color { r, g, b, a }
    }

    /// Creates a new color from `u8` channel values in the range `0 ..= 255`.
    pub fn from_u8(r: u8, g: u8, b: u8, a: u8) -> Color {
        Color {
            r: r as f32 / 255.0,
            g: g as f32 / 255.0,
            b: b as f32 / 255.0,
            a: a as f32 / 255.0,
        }
    }

    fn channel_u8(v: f32) -> u32 {
        (v.clamp(0.0, 1.0) * 255.0).round() as u32
    }

    /// Packs the color as a premultiplied ARGB word.
    pub fn to_premul_argb32(&self) -> u32 {
        let a = self.a.clamp(0.0, 1.0);
        (Self::channel_u8(a) << 24)
            | (Self::channel_u8(self.r * a) << 16)
            | (Self::channel_u8(self.g * a) << 8)
            | Self::channel_u8(self.b * a)
    }

    /// Premultiplied channels as `[r, g, b, a]`.
    pub fn premultiplied(&self) -> [f32; 4] {
        [self.r * self.a, self.g * self.a, self.b * self.a, self.a]
    }
}

/// A single recorded backend call. Images are referred to by their handle id.
#[derive(Clone, Debug, PartialEq)]
pub enum RenderOp {
    Prepare {
        region: Region,
    },
    Compose {
        image: u64,
        x: i32,
        y: i32,
        clip: Region,
        visible: Region,
    },
    /// `source` was copied into the new image `copy`.
    Copy {
        source: u64,
        copy: u64,
    },
    ImageOp {
        image: u64,
        op: ImageOp,
        sub_region: Option<Region>,
    },
    Release {
        image: u64,
    },
    Fill {
        color: Color,
        region: Region,
    },
    Blur {
        opacity: f64,
        region: Region,
    },
    Present {
        region: Region,
    },
}

/// A list of recorded backend operations.
#[derive(Clone, Debug, Default)]
pub struct RenderList {
    /// Operations in the order they were issued.
    pub items: Vec<RenderOp>,
}

impl RenderList {
    /// Creates a new, empty render list.
    pub fn new() -> Self {
        RenderList { items: Vec::new() }
    }

    pub fn add_command(&mut self, command: RenderOp) {
        self.items.push(command);
    }

    /// Clears all recorded operations from the list.
    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Number of recorded operations matching `pred`.
    pub fn count(&self, pred: impl Fn(&RenderOp) -> bool) -> usize {
        self.items.iter().filter(|op| pred(op)).count()
    }

    /// Position of the first operation matching `pred`.
    pub fn position(&self, pred: impl Fn(&RenderOp) -> bool) -> Option<usize> {
        self.items.iter().position(pred)
    }
}
