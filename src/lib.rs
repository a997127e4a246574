//! OpenNow media pipeline
//!
//! Depacketizes RTP video, decodes it on the best available backend and
//! hands frames to the renderer through a lock-free single-frame slot.

pub mod profiling;

pub mod app;
pub mod error;
pub mod gui;
pub mod media;

pub use app::{
    DisplayConfig, FrameReader, PipelineConfig, SessionClock, SharedFrame, StreamSession,
    VideoCodec, VideoDecoderBackend,
};
pub use error::{ConfigError, PipelineError, RenderError};
pub use media::{PipelineEvent, StreamStats, TransportPacket, VideoFrame};
