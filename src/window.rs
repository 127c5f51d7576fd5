//! Window data handed to the compositor core.
//!
//! Windows are owned by the external window tracker. The paint pipeline reads
//! them in paint order (bottom of the stack first) and never stores per-frame
//! state on them.

use crate::render::backend::ImageHandle;
use crate::region::{Rect, Region};
use bitflags::bitflags;

/// Identifier the window tracker uses for a window.
pub type WindowId = u32;

/// Highest alpha value a window can be painted with.
pub const MAX_ALPHA: f64 = 255.0;

bitflags! {
    /// Image state flags. Any of these reaching the paint loop is a bug in
    /// the window tracker.
    #[derive(Default)]
    pub struct WindowFlags: u8 {
        /// Binding the window contents failed.
        const IMAGE_ERROR  = 0b0001;
        /// The contents changed and the image has not been rebound yet.
        const PIXMAP_STALE = 0b0010;
        /// No image has been bound at all.
        const PIXMAP_NONE  = 0b0100;
        /// No shadow image has been bound.
        const SHADOW_NONE  = 0b1000;
    }
}

/// How translucent a window is.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum WindowMode {
    /// Fully opaque.
    #[default]
    Solid,
    /// The body is opaque but the frame is translucent.
    FrameTrans,
    /// The window itself is translucent.
    Trans,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum WindowState {
    Unmapped,
    Mapping,
    #[default]
    Mapped,
    Unmapping,
    Destroying,
}

/// Window position and size in screen coordinates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct Geometry {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl Geometry {
    pub const fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self { x, y, width, height }
    }

    pub const fn rect(&self) -> Rect {
        Rect::new(self.x, self.y, self.width, self.height)
    }
}

/// Size of the decorations drawn by the window manager around the client.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct FrameExtents {
    pub top: i32,
    pub left: i32,
    pub bottom: i32,
    pub right: i32,
}

/// Shadow placement relative to the window origin.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct ShadowGeometry {
    pub dx: i32,
    pub dy: i32,
    pub width: i32,
    pub height: i32,
}

#[derive(Debug)]
pub struct Window {
    pub id: WindowId,
    pub geometry: Geometry,
    /// Bounding shape in window-local coordinates, frame included. `None`
    /// means the full window rectangle.
    pub bounding_shape: Option<Region>,
    pub frame_extents: FrameExtents,
    pub mode: WindowMode,
    pub state: WindowState,
    pub flags: WindowFlags,

    pub opacity: f64,
    /// Opacity the window fades towards.
    pub opacity_target: f64,
    pub frame_opacity: f64,
    pub invert_color: bool,
    pub dim: bool,

    pub shadow: bool,
    pub shadow_geometry: ShadowGeometry,
    /// Paint the shadow under the window body as well.
    pub full_shadow: bool,
    /// Screen (monitor) index the window is on, for shadow cropping.
    pub screen: Option<usize>,

    /// Whether the window manager policy allows blurring its background.
    pub blur_background: bool,

    /// Region covered by the windows painted after this one.
    pub reg_ignore: Region,
    /// Number of windows stacked above this one plus one.
    pub stacking_rank: u32,

    pub image: Option<ImageHandle>,
    pub shadow_image: Option<ImageHandle>,
}

impl Window {
    /// Creates an opaque, mapped window without images.
    pub fn new(id: WindowId, geometry: Geometry) -> Self {
        Self {
            id,
            geometry,
            bounding_shape: None,
            frame_extents: FrameExtents::default(),
            mode: WindowMode::Solid,
            state: WindowState::Mapped,
            flags: WindowFlags::empty(),
            opacity: 1.0,
            opacity_target: 1.0,
            frame_opacity: 1.0,
            invert_color: false,
            dim: false,
            shadow: false,
            shadow_geometry: ShadowGeometry::default(),
            full_shadow: false,
            screen: None,
            blur_background: true,
            reg_ignore: Region::new(),
            stacking_rank: 1,
            image: None,
            shadow_image: None,
        }
    }

    /// Bounding shape in window-local coordinates.
    pub fn bounding_shape_local(&self) -> Region {
        match &self.bounding_shape {
            Some(shape) => shape.clone(),
            None => Region::from_rect(Rect::new(0, 0, self.geometry.width, self.geometry.height)),
        }
    }

    /// Bounding shape in screen coordinates.
    pub fn bounding_shape_global(&self) -> Region {
        self.bounding_shape_local()
            .translated(self.geometry.x, self.geometry.y)
    }

    /// The frame part of the window, in window-local coordinates.
    pub fn frame_region_local(&self) -> Region {
        let Geometry { width, height, .. } = self.geometry;
        let FrameExtents { top, left, bottom, right } = self.frame_extents;

        let frame = Region::from_rects([
            Rect::new(0, 0, width, top),
            Rect::new(0, height - bottom, width, bottom),
            Rect::new(0, top, left, height - top - bottom),
            Rect::new(width - right, top, right, height - top - bottom),
        ]);
        frame.intersect(&self.bounding_shape_local())
    }

    /// Everything the window paints on screen, shadow included.
    pub fn extents(&self) -> Region {
        let mut extents = Region::from_rect(self.geometry.rect());
        if self.shadow {
            let s = self.shadow_geometry;
            extents = extents.union_rect(Rect::new(
                self.geometry.x + s.dx,
                self.geometry.y + s.dy,
                s.width,
                s.height,
            ));
        }
        extents
    }

    /// Whether the window needs a temporary copy to apply color or alpha
    /// transforms before composing.
    pub fn needs_transform(&self) -> bool {
        self.invert_color || self.dim || self.frame_opacity != 1.0 || self.opacity != 1.0
    }

    /// Panics when the window reached the paint loop with an unusable image.
    pub(crate) fn assert_paintable(&self) {
        assert!(
            !self.flags.contains(WindowFlags::IMAGE_ERROR),
            "window {:#010x} reached painting with an image error",
            self.id
        );
        assert!(
            !self.flags.contains(WindowFlags::PIXMAP_STALE),
            "window {:#010x} reached painting with a stale pixmap",
            self.id
        );
        assert!(
            !self.flags.contains(WindowFlags::PIXMAP_NONE) && self.image.is_some(),
            "window {:#010x} reached painting without a pixmap",
            self.id
        );
        if self.shadow {
            assert!(
                !self.flags.contains(WindowFlags::SHADOW_NONE) && self.shadow_image.is_some(),
                "window {:#010x} has a shadow but no shadow image",
                self.id
            );
        }
    }
}
