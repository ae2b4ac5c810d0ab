//! Capture engine abstraction.
//!
//! An engine moves bytes from the network into the output file. Engines are
//! stateless; each run gets an [`EngineConfig`], an event sender and an
//! [`EngineControl`] for stop requests.

mod ffmpeg;
mod native;
mod traits;
pub mod utils;

pub use ffmpeg::FfmpegEngine;
pub use native::NativeEngine;
pub use traits::{
    CaptureEngine, DEFAULT_ACCEPT, DEFAULT_ACCEPT_LANGUAGE, DEFAULT_USER_AGENT, EngineConfig,
    EngineControl, EngineEvent, EngineEvents, EngineKind, EngineRegistry, StopHandle,
    engine_control,
};
