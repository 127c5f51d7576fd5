use std::any::Any;
use std::collections::HashMap;

use anyhow::{anyhow, Result};

use crate::render::ErasedBlurContext;
use crate::stage::{Module, Stage, StageContext};
use crate::window::{Window, WindowId, WindowMode, WindowState};

/// Blurs the background of translucent windows.
///
/// The blur context is created once the backend is up and dropped before it
/// goes away. If the backend cannot blur, background blur stays off for the
/// rest of the session.
#[derive(Default)]
pub struct BlurModule {
    ctx: Option<Box<dyn ErasedBlurContext>>,
    /// Per-window decision whether to blur the background
    blur_background: HashMap<WindowId, bool>,
}

impl BlurModule {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a blur context exists and blur is painted.
    pub fn is_active(&self) -> bool {
        self.ctx.is_some()
    }

    /// Pixels outside a region that blurring it reads.
    pub fn margin(&self) -> (i32, i32) {
        self.ctx.as_ref().map(|c| c.margin()).unwrap_or((0, 0))
    }

    pub fn blurs_background(&self, id: WindowId) -> Option<bool> {
        self.blur_background.get(&id).copied()
    }

    fn backend_created(&mut self, ctx: &mut StageContext<'_>) -> Result<()> {
        let Some(method) = ctx.config.blur.method() else {
            return Ok(());
        };
        let backend = ctx
            .backend
            .as_deref_mut()
            .ok_or_else(|| anyhow!("no backend to create a blur context on"))?;

        match backend.create_blur_context(&method) {
            Ok(blur) => {
                log::debug!("Blur context created, margin {:?}", blur.margin());
                self.ctx = Some(blur);
            }
            Err(e) => log::warn!("Background blur disabled: {e}"),
        }
        Ok(())
    }

    fn backend_destroying(&mut self, ctx: &mut StageContext<'_>) -> Result<()> {
        let Some(blur) = self.ctx.take() else {
            return Ok(());
        };
        let backend = ctx
            .backend
            .as_deref_mut()
            .ok_or_else(|| anyhow!("no backend to destroy the blur context on"))?;
        backend.destroy_blur_context(blur);
        Ok(())
    }

    /// Grows the damage and paint regions by the blur margin.
    ///
    /// Stacked translucent windows smear a change further with every layer,
    /// so the margin is multiplied by the stacking rank of the bottom window.
    /// This over-approximates the area blur depends on.
    fn prepare(&mut self, ctx: &mut StageContext<'_>) -> Result<()> {
        let screen = ctx.screen;
        let factor = ctx.bottom_window.map(|w| w.stacking_rank.max(1)).unwrap_or(1) as i32;
        let frame = ctx
            .frame
            .as_deref_mut()
            .ok_or_else(|| anyhow!("paint-prepare without frame regions"))?;

        if !self.is_active() {
            frame.paint = frame.damage.clone();
            return Ok(());
        }

        let (w, h) = self.margin();
        let (dx, dy) = (w * factor, h * factor);
        let damage = frame.damage.resize(dx, dy);
        frame.paint = damage.resize(dx, dy).intersect(screen);
        frame.damage = damage.intersect(screen);
        Ok(())
    }

    fn blur_window(&mut self, ctx: &mut StageContext<'_>) -> Result<()> {
        let Some(blur) = self.ctx.as_deref_mut() else {
            return Ok(());
        };
        let config = ctx.config;
        let (Some(w), Some(regions)) = (ctx.window, ctx.window_regions) else {
            return Err(anyhow!("window-blur without a window"));
        };

        let wants = self
            .blur_background
            .get(&w.id)
            .copied()
            .unwrap_or(w.blur_background);
        let translucent = config.force_win_blend || w.mode == WindowMode::Trans;
        let frame_only = config.blur.background_frame && w.mode == WindowMode::FrameTrans;
        if !wants || !(translucent || frame_only) {
            return Ok(());
        }

        let opacity = if config.blur.background_fixed {
            1.0
        } else {
            match w.state {
                WindowState::Mapping | WindowState::Unmapping | WindowState::Destroying => {
                    (w.opacity * w.opacity_target).clamp(0.0, 1.0)
                }
                _ => 1.0,
            }
        };

        let backend = ctx
            .backend
            .as_deref_mut()
            .ok_or_else(|| anyhow!("window-blur without a backend"))?;
        let frame = ctx
            .frame
            .as_deref()
            .ok_or_else(|| anyhow!("window-blur without frame regions"))?;

        let ok = if translucent {
            backend.blur(blur, opacity, &regions.paint_in_bound, &frame.visible)
        } else {
            // The body is opaque, only what is behind the frame shows.
            let mut reg_blur = w
                .frame_region_local()
                .translated(w.geometry.x, w.geometry.y)
                .intersect(&frame.paint);
            if config.transparent_clipping {
                reg_blur = reg_blur.intersect(&frame.visible);
            }
            backend.blur(blur, opacity, &reg_blur, &frame.visible)
        };

        if !ok {
            log::warn!("Failed to blur background of window {:#010x}", w.id);
        }
        Ok(())
    }

    fn update_window(&mut self, ctx: &mut StageContext<'_>) -> Result<()> {
        let w: &Window = ctx
            .window
            .ok_or_else(|| anyhow!("window stage without a window"))?;
        if w.state == WindowState::Unmapped {
            return Ok(());
        }

        let new = ctx.config.blur.method().is_some() && w.blur_background;
        let old = self.blur_background.insert(w.id, new).unwrap_or(false);
        if old != new {
            log::debug!("Window {:#010x} background blur: {new}", w.id);
            if let Some(damage) = ctx.damage.as_deref_mut() {
                damage.add(&w.extents());
            }
        }
        Ok(())
    }
}

impl Module for BlurModule {
    fn name(&self) -> &'static str {
        "blur"
    }

    fn stages(&self) -> &'static [Stage] {
        &[
            Stage::BackendCreateDone,
            Stage::BackendDestroyStart,
            Stage::PaintPrepare,
            Stage::WindowBlur,
            Stage::WindowMapped,
            Stage::WindowChanged,
            Stage::WindowDestroyed,
            Stage::Exit,
        ]
    }

    fn handle(&mut self, stage: Stage, ctx: &mut StageContext<'_>) -> Result<()> {
        match stage {
            Stage::BackendCreateDone => self.backend_created(ctx),
            Stage::BackendDestroyStart => self.backend_destroying(ctx),
            Stage::PaintPrepare => self.prepare(ctx),
            Stage::WindowBlur => self.blur_window(ctx),
            Stage::WindowMapped | Stage::WindowChanged => self.update_window(ctx),
            Stage::WindowDestroyed => {
                if let Some(w) = ctx.window {
                    self.blur_background.remove(&w.id);
                }
                Ok(())
            }
            Stage::Exit => {
                self.blur_background.clear();
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BlurMethodConfig, CompositorConfig};
    use crate::damage::DamageRing;
    use crate::paint::{paint_frame, FrameRegions, Scene};
    use crate::region::{Rect, Region};
    use crate::render::backends::null::NullBackend;
    use crate::render::{Backend, Color, RenderOp, RgbaImage, Viewport};
    use crate::stage::StageBus;
    use crate::window::{FrameExtents, Geometry};

    fn blur_config() -> CompositorConfig {
        let mut config = CompositorConfig::default();
        config.blur.method = BlurMethodConfig::Box;
        config.blur.radius = 2;
        config
    }

    fn setup(config: &CompositorConfig) -> (NullBackend, StageBus) {
        let mut backend = NullBackend::new(Viewport::new(0, 0, 100, 100))
            .unwrap()
            .with_buffer_age(Some(1), 3);
        let mut bus = StageBus::new();
        bus.load_module(Box::new(BlurModule::new()));

        let screen = backend.viewport().screen_region();
        let mut ctx = StageContext::new(config, &screen).with_backend(&mut backend);
        bus.emit(Stage::BackendCreateDone, &mut ctx);
        (backend, bus)
    }

    fn translucent_window(backend: &mut NullBackend) -> Window {
        let mut w = Window::new(7, Geometry::new(20, 20, 30, 30));
        w.mode = WindowMode::Trans;
        w.opacity = 0.9;
        w.image = Some(
            backend
                .import_image(&RgbaImage::solid(30, 30, Color::BLACK))
                .unwrap(),
        );
        w
    }

    fn paint(backend: &mut NullBackend, bus: &mut StageBus, config: &CompositorConfig, ring: &mut DamageRing, windows: &[Window]) {
        let screen = backend.viewport().screen_region();
        let scene = Scene {
            screen: &screen,
            screens: &[],
            root_image: None,
            windows,
        };
        paint_frame(backend, ring, bus, config, &scene, false).unwrap();
    }

    #[test]
    fn context_follows_backend_lifecycle() {
        let config = blur_config();
        let (mut backend, mut bus) = setup(&config);
        assert!(bus.module::<BlurModule>().unwrap().is_active());
        assert_eq!(bus.module::<BlurModule>().unwrap().margin(), (2, 2));
        assert_eq!(backend.live_blur_contexts(), 1);

        let screen = backend.viewport().screen_region();
        let mut ctx = StageContext::new(&config, &screen).with_backend(&mut backend);
        bus.emit(Stage::BackendDestroyStart, &mut ctx);
        assert!(!bus.module::<BlurModule>().unwrap().is_active());
        assert_eq!(backend.live_blur_contexts(), 0);
    }

    #[test]
    fn no_method_means_no_context() {
        let config = CompositorConfig::default();
        let (backend, bus) = setup(&config);
        assert!(!bus.module::<BlurModule>().unwrap().is_active());
        assert_eq!(backend.live_blur_contexts(), 0);
    }

    #[test]
    fn prepare_grows_paint_by_margin_and_rank() {
        let config = blur_config();
        let (_backend, mut bus) = setup(&config);

        let screen = Region::from_rect(Rect::new(0, 0, 100, 100));
        let mut bottom = Window::new(1, Geometry::new(0, 0, 10, 10));
        bottom.stacking_rank = 3;
        let mut frame = FrameRegions {
            damage: Region::from_rect(Rect::new(40, 40, 10, 10)),
            ..Default::default()
        };

        let mut ctx = StageContext::new(&config, &screen).with_frame(&mut frame);
        ctx.bottom_window = Some(&bottom);
        bus.emit(Stage::PaintPrepare, &mut ctx);

        assert_eq!(frame.damage, Region::from_rect(Rect::from_corners(34, 34, 56, 56)));
        assert_eq!(frame.paint, Region::from_rect(Rect::from_corners(28, 28, 62, 62)));
        assert!(frame.paint.contains_region(&frame.damage));
    }

    #[test]
    fn prepare_is_clamped_to_screen() {
        let config = blur_config();
        let (_backend, mut bus) = setup(&config);

        let screen = Region::from_rect(Rect::new(0, 0, 100, 100));
        let mut frame = FrameRegions {
            damage: Region::from_rect(Rect::new(0, 0, 5, 5)),
            ..Default::default()
        };
        let mut ctx = StageContext::new(&config, &screen).with_frame(&mut frame);
        bus.emit(Stage::PaintPrepare, &mut ctx);

        assert_eq!(frame.damage, Region::from_rect(Rect::new(0, 0, 7, 7)));
        assert_eq!(frame.paint, Region::from_rect(Rect::new(0, 0, 9, 9)));
    }

    #[test]
    fn translucent_window_background_is_blurred() {
        let config = blur_config();
        let (mut backend, mut bus) = setup(&config);
        let w = translucent_window(&mut backend);
        let mut ring = DamageRing::new(3);
        ring.add(&Region::from_rect(Rect::new(0, 0, 100, 100)));

        paint(&mut backend, &mut bus, &config, &mut ring, &[w]);

        let list = backend.render_list();
        let blur = list.position(|op| matches!(op, RenderOp::Blur { .. })).unwrap();
        let compose = list.position(|op| matches!(op, RenderOp::Compose { .. })).unwrap();
        assert!(blur < compose);
        assert_eq!(
            list.items[blur],
            RenderOp::Blur {
                opacity: 1.0,
                region: Region::from_rect(Rect::new(20, 20, 30, 30))
            }
        );
    }

    #[test]
    fn solid_window_is_not_blurred() {
        let config = blur_config();
        let (mut backend, mut bus) = setup(&config);
        let mut w = translucent_window(&mut backend);
        w.mode = WindowMode::Solid;
        let mut ring = DamageRing::new(3);
        ring.add(&Region::from_rect(Rect::new(0, 0, 100, 100)));

        paint(&mut backend, &mut bus, &config, &mut ring, &[w]);
        assert_eq!(backend.render_list().count(|op| matches!(op, RenderOp::Blur { .. })), 0);
    }

    #[test]
    fn frame_transparent_window_blurs_frame_only() {
        let mut config = blur_config();
        config.blur.background_frame = true;
        let (mut backend, mut bus) = setup(&config);
        let mut w = translucent_window(&mut backend);
        w.mode = WindowMode::FrameTrans;
        w.frame_extents = FrameExtents { top: 4, left: 0, bottom: 0, right: 0 };
        let mut ring = DamageRing::new(3);
        ring.add(&Region::from_rect(Rect::new(0, 0, 100, 100)));

        paint(&mut backend, &mut bus, &config, &mut ring, &[w]);

        let regions: Vec<_> = backend
            .render_list()
            .items
            .iter()
            .filter_map(|op| match op {
                RenderOp::Blur { region, .. } => Some(region.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(regions, vec![Region::from_rect(Rect::new(20, 20, 30, 4))]);
    }

    #[test]
    fn fading_window_blurs_with_reduced_opacity() {
        let config = blur_config();
        let (mut backend, mut bus) = setup(&config);
        let mut w = translucent_window(&mut backend);
        w.state = WindowState::Mapping;
        w.opacity = 0.5;
        w.opacity_target = 0.8;
        let mut ring = DamageRing::new(3);
        ring.add(&Region::from_rect(Rect::new(0, 0, 100, 100)));

        paint(&mut backend, &mut bus, &config, &mut ring, &[w]);

        let opacity = backend
            .render_list()
            .items
            .iter()
            .find_map(|op| match op {
                RenderOp::Blur { opacity, .. } => Some(*opacity),
                _ => None,
            })
            .unwrap();
        assert!((opacity - 0.4).abs() < 1e-12);
    }

    #[test]
    fn mapping_decides_and_damages() {
        let config = blur_config();
        let (_backend, mut bus) = setup(&config);
        let screen = Region::from_rect(Rect::new(0, 0, 100, 100));
        let mut ring = DamageRing::new(2);

        let mut w = Window::new(9, Geometry::new(5, 5, 10, 10));
        {
            let mut ctx = StageContext::new(&config, &screen)
                .with_damage(&mut ring)
                .with_window(&w);
            bus.emit(Stage::WindowMapped, &mut ctx);
        }
        assert_eq!(bus.module::<BlurModule>().unwrap().blurs_background(9), Some(true));
        assert_eq!(ring.current(), &Region::from_rect(Rect::new(5, 5, 10, 10)));

        ring.advance();
        w.blur_background = false;
        {
            let mut ctx = StageContext::new(&config, &screen)
                .with_damage(&mut ring)
                .with_window(&w);
            bus.emit(Stage::WindowChanged, &mut ctx);
        }
        assert_eq!(bus.module::<BlurModule>().unwrap().blurs_background(9), Some(false));
        assert!(!ring.current().is_empty());
    }
}
