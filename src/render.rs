pub mod backend;
pub mod backends;

mod render_list;
pub use render_list::*;

mod viewport;

pub use backend::{Backend, ErasedBlurContext, ExternalHandle, ImageHandle, ImageOp, PixelFormat, RgbaImage};
pub use viewport::Viewport;
