pub mod api;
pub mod cache;
pub mod config;
pub mod detection;
pub mod history;
pub mod playback;
pub mod rendering;
pub mod runtime;
pub mod timing;

// Re-export the top-level error type so callers only need `pole_overlay_core::Error`
pub use anyhow::Error;
pub use anyhow::Result;
