//! JNI glue for running the pipeline inside an Android app.

pub mod abi;
pub mod bridge;
pub mod installer;
pub mod ndk;
