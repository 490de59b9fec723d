pub mod apk;
pub mod core;
pub mod install;
pub mod pipeline;
pub mod sign;

#[cfg(target_os = "android")]
pub mod android;

pub use crate::core::error::{BuildError, InstallError};
pub use crate::pipeline::{BuildRequest, Pipeline};
