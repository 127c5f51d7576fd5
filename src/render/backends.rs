use anyhow::Result;

use crate::config::BackendKind;
use crate::render::{Backend, Viewport};

pub mod null;

#[cfg(feature = "backend_cairo")]
pub mod cairo;

#[cfg(feature = "backend_wgpu")]
pub mod wgpu;

/// Creates the backend selected in the configuration. Backends that were not
/// compiled in fail to initialize.
pub fn create_backend(kind: BackendKind, viewport: Viewport) -> Result<Box<dyn Backend>> {
    match kind {
        BackendKind::Null => Ok(Box::new(null::NullBackend::new(viewport)?)),

        #[cfg(feature = "backend_cairo")]
        BackendKind::Cairo => Ok(Box::new(cairo::CairoBackend::new(viewport)?)),
        #[cfg(not(feature = "backend_cairo"))]
        BackendKind::Cairo => Err(anyhow::anyhow!("built without the backend_cairo feature")),

        #[cfg(feature = "backend_wgpu")]
        BackendKind::Wgpu => Ok(Box::new(wgpu::WgpuBackend::new_headless(viewport)?)),
        #[cfg(not(feature = "backend_wgpu"))]
        BackendKind::Wgpu => Err(anyhow::anyhow!("built without the backend_wgpu feature")),
    }
}
