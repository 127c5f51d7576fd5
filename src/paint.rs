//! Per-frame paint orchestration.
//!
//! [`paint_frame`] resolves which part of the screen has to be repainted,
//! lets pipeline modules adjust that, and walks the window stack from the
//! bottom up, compositing the background, shadows and window contents through
//! the active [`Backend`].
//!
//! All regions created here live for one frame (or one window) only; nothing
//! is stored on the windows.

use anyhow::Result;

use crate::config::CompositorConfig;
use crate::damage::DamageRing;
use crate::region::Region;
use crate::render::{Backend, Color, ImageHandle, ImageOp};
use crate::stage::{Stage, StageBus, StageContext};
use crate::window::{Window, MAX_ALPHA};

/// Color of the damage overlay painted in repaint-monitor mode.
const MONITOR_REPAINT_COLOR: Color = Color::new(0.5, 0.0, 0.0, 0.5);

/// Frame-wide regions, shared with stage handlers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameRegions {
    /// What has to end up different on screen this frame. Passed to present.
    pub damage: Region,
    /// Where painting may happen. Contains `damage`.
    pub paint: Region,
    /// Part of the screen not hidden by windows above the one being painted
    pub visible: Region,
}

/// Scratch regions of the window being painted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WindowRegions {
    /// Bounding shape, frame included, in screen coordinates
    pub bound: Region,
    /// The part of `bound` painted this frame
    pub paint_in_bound: Region,
}

/// What the compositor paints this frame, in paint order.
pub struct Scene<'a> {
    pub screen: &'a Region,
    /// Per-monitor regions, indexed by [`Window::screen`]
    pub screens: &'a [Region],
    /// Wallpaper painted below all windows
    pub root_image: Option<&'a ImageHandle>,
    /// Windows from the bottom of the stack to the top
    pub windows: &'a [Window],
}

#[derive(Debug, Clone, PartialEq)]
pub enum FrameOutcome {
    /// Nothing was damaged, the backend was not touched.
    Skipped,
    /// A frame was painted and `damage` presented.
    Presented { damage: Region },
}

#[allow(clippy::too_many_arguments)]
fn emit_for_window(
    bus: &mut StageBus,
    stage: Stage,
    config: &CompositorConfig,
    screen: &Region,
    backend: &mut dyn Backend,
    frame: &mut FrameRegions,
    window: &Window,
    regions: &WindowRegions,
) -> usize {
    let mut ctx = StageContext::new(config, screen)
        .with_backend(backend)
        .with_frame(frame)
        .with_window(window);
    ctx.window_regions = Some(regions);
    bus.emit(stage, &mut ctx)
}

/// Paints one frame.
///
/// With `ignore_damage` the whole screen is repainted regardless of the
/// recorded damage.
///
/// # Panics
///
/// When a window reaches painting with an image error, a stale or missing
/// pixmap, or a shadow without a shadow image. This is checked for every
/// window before the backend is touched.
pub fn paint_frame(
    backend: &mut dyn Backend,
    damage: &mut DamageRing,
    bus: &mut StageBus,
    config: &CompositorConfig,
    scene: &Scene<'_>,
    ignore_damage: bool,
) -> Result<FrameOutcome> {
    let screen = scene.screen;

    let reg_damage = if ignore_damage {
        screen.clone()
    } else {
        let force_full = config.monitor_repaint || !config.use_damage;
        damage.repaint_region(force_full, backend.buffer_age(), screen)
    };

    if reg_damage.is_empty() {
        log::trace!("Nothing damaged, skipping frame");
        return Ok(FrameOutcome::Skipped);
    }

    for w in scene.windows {
        w.assert_paintable();
    }

    let mut frame = FrameRegions {
        paint: reg_damage.clone(),
        damage: reg_damage,
        visible: Region::new(),
    };

    let bottom = scene.windows.first();
    {
        let mut ctx = StageContext::new(config, screen)
            .with_backend(&mut *backend)
            .with_frame(&mut frame);
        ctx.bottom_window = bottom;
        bus.emit(Stage::PaintPrepare, &mut ctx);
    }
    debug_assert!(frame.paint.contains_region(&frame.damage));
    log::trace!("damage: {:?}, paint: {:?}", frame.damage, frame.paint);

    frame.visible = match bottom {
        Some(w) if !config.transparent_clipping => screen.subtract(&w.reg_ignore),
        _ => screen.clone(),
    };

    backend.prepare(&frame.paint);

    if let Some(root) = scene.root_image {
        backend.compose(root, 0, 0, &frame.paint, &frame.visible);
    }

    let shadow_exclude = config.shadow_exclude_region();

    for w in scene.windows {
        frame.visible = screen.subtract(&w.reg_ignore);

        let bound = w.bounding_shape_global();
        let mut paint_in_bound = bound.intersect(&frame.paint);
        if config.transparent_clipping {
            paint_in_bound = paint_in_bound.intersect(&frame.visible);
        }
        debug_assert!(bound.contains_region(&paint_in_bound));
        debug_assert!(frame.paint.contains_region(&paint_in_bound));

        let regions = WindowRegions { bound, paint_in_bound };

        emit_for_window(bus, Stage::WindowBlur, config, screen, backend, &mut frame, w, &regions);

        if w.shadow {
            emit_for_window(bus, Stage::WindowShadow, config, screen, backend, &mut frame, w, &regions);
            paint_shadow(backend, config, scene, &frame, w, &regions, &shadow_exclude);
        }

        if let Some(image) = &w.image {
            if config.max_brightness < 1.0 {
                backend.image_op(ImageOp::MaxBrightness(config.max_brightness), image, None, &frame.visible);
            }
            paint_body(backend, config, &frame, w, image, &regions);
        }

        emit_for_window(bus, Stage::WindowDecorate, config, screen, backend, &mut frame, w, &regions);
    }

    if config.monitor_repaint {
        let actual = damage.current().intersect(screen);
        backend.fill(MONITOR_REPAINT_COLOR, &actual);
    }

    damage.advance();

    backend.present(&frame.damage)?;
    Ok(FrameOutcome::Presented { damage: frame.damage })
}

fn paint_shadow(
    backend: &mut dyn Backend,
    config: &CompositorConfig,
    scene: &Scene<'_>,
    frame: &FrameRegions,
    w: &Window,
    regions: &WindowRegions,
    shadow_exclude: &Region,
) {
    let Some(shadow) = &w.shadow_image else {
        return;
    };

    let mut reg_shadow = w.extents().intersect(&frame.paint);
    if !(config.full_shadow || w.full_shadow) {
        reg_shadow = reg_shadow.subtract(&regions.bound);
    }
    if !shadow_exclude.is_empty() {
        reg_shadow = reg_shadow.subtract(shadow_exclude);
    }
    if config.crop_shadow_to_screen {
        // The window may still point at a monitor that has gone away.
        if let Some(monitor) = w.screen.and_then(|i| scene.screens.get(i)) {
            reg_shadow = reg_shadow.intersect(monitor);
        }
    }
    if config.transparent_clipping {
        reg_shadow = reg_shadow.intersect(&frame.visible);
    }

    let x = w.geometry.x + w.shadow_geometry.dx;
    let y = w.geometry.y + w.shadow_geometry.dy;

    if w.opacity == 1.0 {
        backend.compose(shadow, x, y, &reg_shadow, &frame.visible);
        return;
    }

    let local = reg_shadow.translated(-x, -y);
    match backend.copy(shadow, &local) {
        Ok(copy) => {
            backend.image_op(ImageOp::ApplyAlphaAll(w.opacity), &copy, None, &local);
            backend.compose(&copy, x, y, &reg_shadow, &frame.visible);
            backend.release_image(copy);
        }
        Err(e) => log::error!("Failed to copy shadow of window {:#010x}: {e:#}", w.id),
    }
}

fn paint_body(
    backend: &mut dyn Backend,
    config: &CompositorConfig,
    frame: &FrameRegions,
    w: &Window,
    image: &ImageHandle,
    regions: &WindowRegions,
) {
    let (x, y) = (w.geometry.x, w.geometry.y);

    if !w.needs_transform() {
        backend.compose(image, x, y, &regions.paint_in_bound, &frame.visible);
        return;
    }

    // A fully transparent body paints nothing.
    if w.opacity * MAX_ALPHA < 1.0 {
        return;
    }

    let bound_local = regions.bound.translated(-x, -y);
    let visible_local = frame
        .visible
        .intersect(&frame.paint)
        .translated(-x, -y)
        .intersect(&bound_local);

    let copy = match backend.copy(image, &visible_local) {
        Ok(copy) => copy,
        Err(e) => {
            log::error!("Failed to copy window {:#010x}: {e:#}", w.id);
            return;
        }
    };

    if w.invert_color {
        backend.image_op(ImageOp::InvertColorAll, &copy, None, &visible_local);
    }
    if w.dim {
        let mut dim = config.inactive_dim;
        if !config.inactive_dim_fixed {
            dim *= w.opacity;
        }
        backend.image_op(ImageOp::DimAll(dim), &copy, None, &visible_local);
    }
    if w.frame_opacity != 1.0 {
        let frame_local = w.frame_region_local();
        backend.image_op(
            ImageOp::ApplyAlpha(w.frame_opacity),
            &copy,
            Some(&frame_local),
            &visible_local,
        );
    }
    if w.opacity != 1.0 {
        backend.image_op(ImageOp::ApplyAlphaAll(w.opacity), &copy, None, &visible_local);
    }

    backend.compose(&copy, x, y, &regions.paint_in_bound, &frame.visible);
    backend.release_image(copy);
}
