//! Stage event bus.
//!
//! Optional pipeline modules (blur, shadows, decorations) hook into named
//! points of the compositor's lifecycle and of every frame. The painter only
//! knows the [`Stage`]s it emits; whoever subscribed gets called, in
//! subscription order, with a [`StageContext`] describing what is going on.
//!
//! ```
//! use gosub_compositor::config::CompositorConfig;
//! use gosub_compositor::region::Region;
//! use gosub_compositor::stage::{Stage, StageBus, StageContext};
//!
//! let mut bus = StageBus::new();
//! bus.subscribe_fn(Stage::PaintPrepare, |_, _| Ok(()));
//!
//! let config = CompositorConfig::default();
//! let screen = Region::new();
//! let mut ctx = StageContext::new(&config, &screen);
//! assert_eq!(bus.emit(Stage::PaintPrepare, &mut ctx), 1);
//! assert_eq!(bus.emit(Stage::WindowBlur, &mut ctx), 0);
//! ```

use std::any::Any;
use std::collections::HashMap;
use std::fmt::{Display, Formatter};

use anyhow::Result;

use crate::config::CompositorConfig;
use crate::damage::DamageRing;
use crate::paint::{FrameRegions, WindowRegions};
use crate::region::Region;
use crate::render::Backend;
use crate::window::Window;

/// Points at which modules can hook into the compositor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Session is being set up, before the configuration is final
    EarlyInit,
    /// Session is set up
    Init,
    /// Session is shutting down
    Exit,

    /// A backend is about to be created
    BackendCreateStart,
    /// A backend has been created and is the active backend
    BackendCreateDone,
    /// The active backend is about to be torn down
    BackendDestroyStart,
    /// The backend is gone
    BackendDestroyDone,

    /// A frame is about to be painted. Handlers may grow the paint region.
    PaintPrepare,
    /// A window's background may be blurred now
    WindowBlur,
    /// A window's shadow is about to be painted
    WindowShadow,
    /// A window has been painted
    WindowDecorate,

    WindowAdded,
    WindowMapped,
    WindowUnmapped,
    WindowChanged,
    WindowFocusIn,
    WindowFocusOut,
    WindowDestroying,
    WindowDestroyed,
}

impl Display for Stage {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Stage::EarlyInit => "early-init",
            Stage::Init => "init",
            Stage::Exit => "exit",
            Stage::BackendCreateStart => "backend-create-start",
            Stage::BackendCreateDone => "backend-create-done",
            Stage::BackendDestroyStart => "backend-destroy-start",
            Stage::BackendDestroyDone => "backend-destroy-done",
            Stage::PaintPrepare => "paint-prepare",
            Stage::WindowBlur => "window-blur",
            Stage::WindowShadow => "window-shadow",
            Stage::WindowDecorate => "window-decorate",
            Stage::WindowAdded => "window-added",
            Stage::WindowMapped => "window-mapped",
            Stage::WindowUnmapped => "window-unmapped",
            Stage::WindowChanged => "window-changed",
            Stage::WindowFocusIn => "window-focus-in",
            Stage::WindowFocusOut => "window-focus-out",
            Stage::WindowDestroying => "window-destroying",
            Stage::WindowDestroyed => "window-destroyed",
        };
        write!(f, "{name}")
    }
}

/// Everything a stage handler may look at or change. Which fields are set
/// depends on the stage: frame stages carry the frame regions, window stages
/// the window, backend stages the backend.
pub struct StageContext<'a> {
    pub config: &'a CompositorConfig,
    pub screen: &'a Region,
    pub backend: Option<&'a mut dyn Backend>,
    pub damage: Option<&'a mut DamageRing>,
    pub frame: Option<&'a mut FrameRegions>,
    pub window: Option<&'a Window>,
    /// Scratch regions of the window currently being painted
    pub window_regions: Option<&'a WindowRegions>,
    /// The lowest window painted this frame
    pub bottom_window: Option<&'a Window>,
}

impl<'a> StageContext<'a> {
    pub fn new(config: &'a CompositorConfig, screen: &'a Region) -> Self {
        Self {
            config,
            screen,
            backend: None,
            damage: None,
            frame: None,
            window: None,
            window_regions: None,
            bottom_window: None,
        }
    }

    pub fn with_backend(mut self, backend: &'a mut dyn Backend) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn with_damage(mut self, damage: &'a mut DamageRing) -> Self {
        self.damage = Some(damage);
        self
    }

    pub fn with_frame(mut self, frame: &'a mut FrameRegions) -> Self {
        self.frame = Some(frame);
        self
    }

    pub fn with_window(mut self, window: &'a Window) -> Self {
        self.window = Some(window);
        self
    }
}

/// A pipeline module living on the bus.
pub trait Module: Any {
    fn name(&self) -> &'static str;

    /// Stages the module wants to be called for.
    fn stages(&self) -> &'static [Stage];

    fn handle(&mut self, stage: Stage, ctx: &mut StageContext<'_>) -> Result<()>;

    fn as_any(&self) -> &dyn Any;
}

type HandlerFn = Box<dyn FnMut(Stage, &mut StageContext<'_>) -> Result<()>>;

enum Subscriber {
    /// Index into the bus' module list
    Module(usize),
    Fn(HandlerFn),
}

/// Ordered publish/subscribe dispatch table keyed by stage.
#[derive(Default)]
pub struct StageBus {
    modules: Vec<Box<dyn Module>>,
    subscribers: HashMap<Stage, Vec<Subscriber>>,
}

impl StageBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a module and subscribes it to the stages it asks for.
    pub fn load_module(&mut self, module: Box<dyn Module>) {
        log::info!("Loading module {}", module.name());

        let index = self.modules.len();
        for stage in module.stages() {
            self.subscribers
                .entry(*stage)
                .or_default()
                .push(Subscriber::Module(index));
        }
        self.modules.push(module);
    }

    /// Subscribes a closure to a single stage.
    pub fn subscribe_fn<F>(&mut self, stage: Stage, handler: F)
    where
        F: FnMut(Stage, &mut StageContext<'_>) -> Result<()> + 'static,
    {
        self.subscribers
            .entry(stage)
            .or_default()
            .push(Subscriber::Fn(Box::new(handler)));
    }

    /// Calls every subscriber of `stage` in subscription order and returns
    /// how many were called. A failing handler is logged and does not stop
    /// the ones after it.
    pub fn emit(&mut self, stage: Stage, ctx: &mut StageContext<'_>) -> usize {
        let Some(subscribers) = self.subscribers.get_mut(&stage) else {
            return 0;
        };

        let mut called = 0;
        for subscriber in subscribers.iter_mut() {
            let (name, result) = match subscriber {
                Subscriber::Module(index) => {
                    let module = &mut self.modules[*index];
                    (module.name(), module.handle(stage, ctx))
                }
                Subscriber::Fn(handler) => ("<fn>", handler(stage, ctx)),
            };
            called += 1;

            if let Err(e) = result {
                log::error!("Module {name} failed handling {stage}: {e:#}");
            }
        }
        called
    }

    /// Looks up a loaded module by type.
    pub fn module<T: Module>(&self) -> Option<&T> {
        self.modules
            .iter()
            .find_map(|m| m.as_any().downcast_ref::<T>())
    }

    pub fn module_names(&self) -> Vec<&'static str> {
        self.modules.iter().map(|m| m.name()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    struct Recorder {
        seen: Vec<Stage>,
    }

    impl Module for Recorder {
        fn name(&self) -> &'static str {
            "recorder"
        }

        fn stages(&self) -> &'static [Stage] {
            &[Stage::Init, Stage::PaintPrepare]
        }

        fn handle(&mut self, stage: Stage, _ctx: &mut StageContext<'_>) -> Result<()> {
            self.seen.push(stage);
            Ok(())
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[test]
    fn emit_calls_subscribers_in_order() {
        let order = Rc::new(RefCell::new(Vec::new()));
        let mut bus = StageBus::new();
        for i in 0..3 {
            let order = order.clone();
            bus.subscribe_fn(Stage::WindowBlur, move |_, _| {
                order.borrow_mut().push(i);
                Ok(())
            });
        }

        let config = CompositorConfig::default();
        let screen = Region::new();
        let mut ctx = StageContext::new(&config, &screen);
        assert_eq!(bus.emit(Stage::WindowBlur, &mut ctx), 3);
        assert_eq!(*order.borrow(), vec![0, 1, 2]);
    }

    #[test]
    fn failing_handler_does_not_stop_later_ones() {
        let hit = Rc::new(RefCell::new(false));
        let mut bus = StageBus::new();
        bus.subscribe_fn(Stage::Exit, |_, _| Err(anyhow::anyhow!("boom")));
        let h = hit.clone();
        bus.subscribe_fn(Stage::Exit, move |_, _| {
            *h.borrow_mut() = true;
            Ok(())
        });

        let config = CompositorConfig::default();
        let screen = Region::new();
        let mut ctx = StageContext::new(&config, &screen);
        assert_eq!(bus.emit(Stage::Exit, &mut ctx), 2);
        assert!(*hit.borrow());
    }

    #[test]
    fn modules_receive_their_stages() {
        let mut bus = StageBus::new();
        bus.load_module(Box::new(Recorder { seen: Vec::new() }));

        let config = CompositorConfig::default();
        let screen = Region::new();
        let mut ctx = StageContext::new(&config, &screen);
        bus.emit(Stage::Init, &mut ctx);
        bus.emit(Stage::Exit, &mut ctx);
        bus.emit(Stage::PaintPrepare, &mut ctx);

        let recorder = bus.module::<Recorder>().unwrap();
        assert_eq!(recorder.seen, vec![Stage::Init, Stage::PaintPrepare]);
        assert_eq!(bus.module_names(), vec!["recorder"]);
    }
}
