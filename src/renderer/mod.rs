pub mod base;
pub mod device;
pub mod error;
pub mod headless;
pub mod runtime;
pub mod setup;
pub mod utilities;

pub use error::{HandleKind, RendererError, Result};
