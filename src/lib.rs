pub mod blur;
pub mod config;
pub mod damage;
pub mod errors;
pub mod paint;
pub mod region;
pub mod render;
pub mod session;
pub mod stage;
pub mod window;

pub use config::CompositorConfig;
pub use errors::*;
pub use session::Session;
