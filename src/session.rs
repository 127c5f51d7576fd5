//! Compositor session: owns the active backend, the damage ring and the
//! stage bus, and drives frames.

use anyhow::Result;

use crate::blur::BlurModule;
use crate::config::CompositorConfig;
use crate::damage::DamageRing;
use crate::errors::CompositorError;
use crate::paint::{paint_frame, FrameOutcome, Scene};
use crate::region::Region;
use crate::render::backends::create_backend;
use crate::render::{Backend, ExternalHandle, ImageHandle, RgbaImage, Viewport};
use crate::stage::{Stage, StageBus, StageContext};
use crate::window::Window;

/// Optional features that can be switched off at runtime when they fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub sync_fence: bool,
}

pub struct Session {
    config: CompositorConfig,
    capabilities: Capabilities,
    viewport: Viewport,
    screen: Region,
    /// Per-monitor regions for shadow cropping
    screens: Vec<Region>,
    backend: Option<Box<dyn Backend>>,
    damage: DamageRing,
    bus: StageBus,
    root_image: Option<ImageHandle>,
}

impl Session {
    /// Creates a session without a backend. The built-in modules are loaded
    /// and the init stages emitted.
    pub fn new(config: CompositorConfig, viewport: Viewport) -> Result<Self, CompositorError> {
        config.validate()?;

        let mut session = Self {
            capabilities: Capabilities {
                sync_fence: config.sync_fence,
            },
            config,
            viewport,
            screen: viewport.screen_region(),
            screens: Vec::new(),
            backend: None,
            damage: DamageRing::new(1),
            bus: StageBus::new(),
            root_image: None,
        };
        session.bus.load_module(Box::new(BlurModule::new()));

        session.emit(Stage::EarlyInit);
        session.emit(Stage::Init);
        Ok(session)
    }

    pub fn config(&self) -> &CompositorConfig {
        &self.config
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    pub fn screen(&self) -> &Region {
        &self.screen
    }

    pub fn set_screens(&mut self, screens: Vec<Region>) {
        self.screens = screens;
    }

    pub fn bus(&self) -> &StageBus {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut StageBus {
        &mut self.bus
    }

    pub fn damage(&self) -> &DamageRing {
        &self.damage
    }

    pub fn backend(&self) -> Option<&dyn Backend> {
        self.backend.as_deref()
    }

    pub fn backend_mut(&mut self) -> Option<&mut (dyn Backend + 'static)> {
        self.backend.as_deref_mut()
    }

    /// Emits a stage carrying only the session-wide context.
    fn emit(&mut self, stage: Stage) -> usize {
        let ctx = StageContext::new(&self.config, &self.screen).with_damage(&mut self.damage);
        let mut ctx = match self.backend.as_deref_mut() {
            Some(backend) => ctx.with_backend(backend),
            None => ctx,
        };
        self.bus.emit(stage, &mut ctx)
    }

    /// Activates the backend selected in the configuration.
    pub fn activate_backend(&mut self) -> Result<(), CompositorError> {
        let kind = self.config.backend;
        self.activate_backend_with(|viewport| create_backend(kind, viewport))
    }

    /// Activates a backend built by `factory`.
    ///
    /// A failing factory is fatal to painting: no backend means no frames.
    pub fn activate_backend_with<F>(&mut self, factory: F) -> Result<(), CompositorError>
    where
        F: FnOnce(Viewport) -> Result<Box<dyn Backend>>,
    {
        if self.backend.is_some() {
            return Err(CompositorError::BackendActive);
        }

        self.emit(Stage::BackendCreateStart);

        let backend = factory(self.viewport).map_err(|e| {
            log::error!("Failed to initialize backend: {e:#}");
            CompositorError::BackendInit(format!("{e:#}"))
        })?;
        log::info!("Activated {} backend", backend.name());

        self.damage = DamageRing::new(backend.max_buffer_age());
        self.damage.add(&self.screen);
        self.backend = Some(backend);

        self.emit(Stage::BackendCreateDone);
        Ok(())
    }

    /// Tears the active backend down. Window images must have been released
    /// through [`Session::release_window_images`] before.
    pub fn deactivate_backend(&mut self) {
        if self.backend.is_none() {
            return;
        }

        self.emit(Stage::BackendDestroyStart);

        if let Some(mut backend) = self.backend.take() {
            if let Some(root) = self.root_image.take() {
                backend.release_image(root);
            }
            log::info!("Deactivating {} backend", backend.name());
            backend.deinit();
        }

        self.emit(Stage::BackendDestroyDone);
    }

    /// Returns the images of `windows` to the active backend.
    pub fn release_window_images(&mut self, windows: &mut [Window]) {
        let Some(backend) = self.backend.as_deref_mut() else {
            return;
        };
        for w in windows {
            if let Some(image) = w.image.take() {
                backend.release_image(image);
            }
            if let Some(shadow) = w.shadow_image.take() {
                backend.release_image(shadow);
            }
        }
    }

    /// Replaces the wallpaper painted below all windows.
    pub fn set_root_image(&mut self, image: &RgbaImage) -> Result<(), CompositorError> {
        let backend = self.backend.as_deref_mut().ok_or(CompositorError::NoBackend)?;
        let root = backend
            .import_image(image)
            .map_err(|e| CompositorError::RootImage(format!("{e:#}")))?;
        if let Some(old) = self.root_image.replace(root) {
            backend.release_image(old);
        }
        self.damage.add(&self.screen);
        Ok(())
    }

    pub fn add_damage(&mut self, region: &Region) {
        self.damage.add(region);
    }

    /// Passes a window lifecycle event to the modules.
    pub fn notify_window(&mut self, stage: Stage, window: &Window) -> usize {
        let ctx = StageContext::new(&self.config, &self.screen)
            .with_damage(&mut self.damage)
            .with_window(window);
        let mut ctx = match self.backend.as_deref_mut() {
            Some(backend) => ctx.with_backend(backend),
            None => ctx,
        };
        self.bus.emit(stage, &mut ctx)
    }

    /// Resizes the output. Everything is repainted on the next frame.
    pub fn resize(&mut self, viewport: Viewport) -> Result<()> {
        self.viewport = viewport;
        self.screen = viewport.screen_region();
        if let Some(backend) = self.backend.as_deref_mut() {
            backend.resize(viewport)?;
            self.damage.reset(backend.max_buffer_age());
        }
        self.damage.add(&self.screen);
        Ok(())
    }

    /// Paints a frame of `windows`, given bottom to top.
    pub fn paint(&mut self, windows: &[Window], ignore_damage: bool) -> Result<FrameOutcome, CompositorError> {
        let backend = self.backend.as_deref_mut().ok_or(CompositorError::NoBackend)?;

        if self.capabilities.sync_fence {
            if let Err(e) = backend.sync_fence() {
                log::error!("Sync fence failed, it will be disabled from now on: {e:#}");
                self.capabilities.sync_fence = false;
            }
        }

        let scene = Scene {
            screen: &self.screen,
            screens: &self.screens,
            root_image: self.root_image.as_ref(),
            windows,
        };
        paint_frame(backend, &mut self.damage, &mut self.bus, &self.config, &scene, ignore_damage)
            .map_err(|e| CompositorError::Present(format!("{e:#}")))
    }

    /// The last presented frame.
    pub fn external_handle(&mut self) -> Option<ExternalHandle> {
        self.backend.as_deref_mut()?.external_handle()
    }

    /// Deactivates the backend and emits the exit stage.
    pub fn shutdown(&mut self) {
        self.deactivate_backend();
        self.emit(Stage::Exit);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BlurMethodConfig;
    use crate::region::Rect;
    use crate::render::backends::null::NullBackend;
    use crate::render::Color;
    use crate::window::Geometry;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn init() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn viewport() -> Viewport {
        Viewport::new(0, 0, 64, 48)
    }

    fn null_backend(vp: Viewport) -> Result<Box<dyn Backend>> {
        Ok(Box::new(NullBackend::new(vp)?.with_buffer_age(Some(1), 3)))
    }

    fn record(session: &mut Session) -> Rc<RefCell<Vec<(Stage, bool)>>> {
        let seen = Rc::new(RefCell::new(Vec::new()));
        for stage in [
            Stage::BackendCreateStart,
            Stage::BackendCreateDone,
            Stage::BackendDestroyStart,
            Stage::BackendDestroyDone,
        ] {
            let seen = seen.clone();
            session.bus_mut().subscribe_fn(stage, move |stage, ctx| {
                seen.borrow_mut().push((stage, ctx.backend.is_some()));
                Ok(())
            });
        }
        seen
    }

    #[test]
    fn backend_lifecycle_stages_are_ordered() {
        init();
        let mut session = Session::new(CompositorConfig::default(), viewport()).unwrap();
        let seen = record(&mut session);

        session.activate_backend_with(null_backend).unwrap();
        session.deactivate_backend();

        assert_eq!(
            *seen.borrow(),
            vec![
                (Stage::BackendCreateStart, false),
                (Stage::BackendCreateDone, true),
                (Stage::BackendDestroyStart, true),
                (Stage::BackendDestroyDone, false),
            ]
        );
    }

    #[test]
    fn failing_backend_init_is_reported() {
        init();
        let mut session = Session::new(CompositorConfig::default(), viewport()).unwrap();
        let err = session
            .activate_backend_with(|_| Err(anyhow::anyhow!("no display")))
            .unwrap_err();
        assert!(matches!(err, CompositorError::BackendInit(_)));
        assert!(session.backend().is_none());
        assert!(matches!(session.paint(&[], false), Err(CompositorError::NoBackend)));
    }

    #[test]
    fn first_frame_repaints_everything() {
        init();
        let mut session = Session::new(CompositorConfig::default(), viewport()).unwrap();
        session.activate_backend_with(null_backend).unwrap();

        let outcome = session.paint(&[], false).unwrap();
        assert_eq!(
            outcome,
            FrameOutcome::Presented {
                damage: Region::from_rect(Rect::new(0, 0, 64, 48))
            }
        );
        assert_eq!(session.damage().capacity(), 3);
        session.shutdown();
    }

    #[test]
    fn sync_fence_failure_disables_fence() {
        init();
        let config = CompositorConfig {
            sync_fence: true,
            ..Default::default()
        };
        let mut session = Session::new(config, viewport()).unwrap();
        session
            .activate_backend_with(|vp| Ok(Box::new(NullBackend::new(vp)?.with_failing_sync_fence())))
            .unwrap();
        assert!(session.capabilities().sync_fence);

        session.paint(&[], false).unwrap();
        assert!(!session.capabilities().sync_fence);
    }

    #[test]
    fn root_image_is_composed_and_released() {
        init();
        let mut session = Session::new(CompositorConfig::default(), viewport()).unwrap();
        session.activate_backend_with(null_backend).unwrap();
        session
            .set_root_image(&RgbaImage::solid(64, 48, Color::BLACK))
            .unwrap();

        let mut windows = vec![Window::new(1, Geometry::new(0, 0, 10, 10))];
        windows[0].image = Some(
            session
                .backend_mut()
                .unwrap()
                .import_image(&RgbaImage::solid(10, 10, Color::BLACK))
                .unwrap(),
        );
        session.paint(&windows, true).unwrap();

        session.release_window_images(&mut windows);
        // Teardown asserts that no image is left behind.
        session.deactivate_backend();
        assert!(session.backend().is_none());
    }

    #[test]
    fn rejected_root_image_keeps_previous_one() {
        init();
        let mut session = Session::new(CompositorConfig::default(), viewport()).unwrap();
        session
            .activate_backend_with(|vp| Ok(Box::new(NullBackend::new(vp)?.with_max_image_size(32))))
            .unwrap();
        session
            .set_root_image(&RgbaImage::solid(32, 32, Color::BLACK))
            .unwrap();

        let err = session
            .set_root_image(&RgbaImage::solid(64, 48, Color::BLACK))
            .unwrap_err();
        assert!(matches!(err, CompositorError::RootImage(_)));
        assert!(err.to_string().contains("64x48"));

        // The first root image is still painted and released on teardown.
        session.paint(&[], true).unwrap();
        session.deactivate_backend();
    }

    #[test]
    fn blur_module_is_loaded_and_follows_backend() {
        init();
        let mut config = CompositorConfig::default();
        config.blur.method = BlurMethodConfig::Gaussian;
        let mut session = Session::new(config, viewport()).unwrap();
        assert_eq!(session.bus().module_names(), vec!["blur"]);

        session.activate_backend_with(null_backend).unwrap();
        assert!(session.bus().module::<BlurModule>().unwrap().is_active());

        session.deactivate_backend();
        assert!(!session.bus().module::<BlurModule>().unwrap().is_active());
    }

    #[test]
    fn undamaged_frames_are_skipped_unless_damage_is_ignored() {
        init();
        let mut session = Session::new(CompositorConfig::default(), viewport()).unwrap();
        session.activate_backend_with(null_backend).unwrap();

        // Buffer age 1 repaints this frame's and the previous frame's damage.
        assert!(matches!(session.paint(&[], false).unwrap(), FrameOutcome::Presented { .. }));
        assert!(matches!(session.paint(&[], false).unwrap(), FrameOutcome::Presented { .. }));
        assert_eq!(session.paint(&[], false).unwrap(), FrameOutcome::Skipped);

        assert_eq!(
            session.paint(&[], true).unwrap(),
            FrameOutcome::Presented {
                damage: session.screen().clone()
            }
        );
        match session.external_handle() {
            Some(ExternalHandle::NullHandle { frame_id, width, .. }) => {
                assert_eq!((frame_id, width), (3, 64));
            }
            other => panic!("unexpected handle {other:?}"),
        }
    }
}
