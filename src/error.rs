//! Error types shared across the pipeline

use std::path::PathBuf;

use crate::app::VideoCodec;

/// Session-level failures surfaced to the embedding application
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("no decoder backend available for {codec:?}")]
    NoBackendAvailable { codec: VideoCodec },

    #[error("decoder thread is not running")]
    DecoderClosed,

    #[error("failed to spawn decoder thread: {0}")]
    ThreadSpawn(#[from] std::io::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Configuration loading and validation failures
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("no config directory on this platform")]
    NoConfigDir,

    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Presentation failures. Never fatal for the session.
#[derive(Debug, PartialEq, thiserror::Error)]
pub enum RenderError {
    #[error("surface cannot bind {0:?} memory")]
    UnsupportedSurface(crate::media::GpuMemoryKind),

    #[error("plane {plane} too small: need {needed} bytes, have {actual}")]
    PlaneTooSmall {
        plane: &'static str,
        needed: usize,
        actual: usize,
    },

    #[error("overlay is {overlay_width}x{overlay_height}, target is {width}x{height}")]
    OverlaySize {
        overlay_width: u32,
        overlay_height: u32,
        width: u32,
        height: u32,
    },
}
