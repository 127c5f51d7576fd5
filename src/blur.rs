//! Background blur: kernel generation, CPU convolution and the stage bus
//! module that drives backend blur during painting.

pub mod convolve;
pub mod kernel;
mod module;

pub use kernel::{box_kernels, gaussian_kernels, passes_margin, BlurMethod, Kernel};
pub use module::BlurModule;
