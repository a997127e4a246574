//! Pipeline Configuration
//!
//! Tunables for the decode pipeline, loaded from JSON.

use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;

/// Pipeline settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    // === Video ===
    /// Negotiated video codec
    pub codec: VideoCodec,

    /// Preferred video decoder backend
    pub decoder_backend: VideoDecoderBackend,

    /// Bind GPU surfaces directly when the backend yields them
    pub zero_copy: bool,

    // === Recovery ===
    /// Consecutive decode failures before the first keyframe request
    pub keyframe_request_threshold: u32,

    /// Further failures between repeated keyframe requests
    pub keyframe_retry_interval: u32,

    /// Consecutive hard errors before the backend is replaced
    pub backend_fault_threshold: u32,

    /// No decoded frame for this long raises a stall event
    pub stall_timeout_ms: u64,

    // === Queues ===
    /// Pending access units before the oldest is evicted
    pub decode_queue_depth: usize,

    /// Decode stats buffered before the oldest is dropped
    pub stats_channel_capacity: usize,

    /// Pipeline events buffered towards session control
    pub event_channel_capacity: usize,

    /// Rolling window for fps and timing averages
    pub stats_window_ms: u64,

    // === Display ===
    pub display: DisplayConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            codec: VideoCodec::H264,
            decoder_backend: VideoDecoderBackend::Auto, // Auto-select best decoder
            zero_copy: true,

            keyframe_request_threshold: 3,
            keyframe_retry_interval: 20, // ~166ms at 120fps
            backend_fault_threshold: 30,
            stall_timeout_ms: 2000,

            decode_queue_depth: 4,
            stats_channel_capacity: 64,
            event_channel_capacity: 16,
            stats_window_ms: 1000,

            display: DisplayConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Default config file path
    pub fn file_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("opennow-pipeline").join("pipeline.json"))
    }

    /// Load from the default location, falling back to defaults when absent
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path().ok_or(ConfigError::NoConfigDir)?;

        if !path.exists() {
            info!("No pipeline config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        Self::load_from(&path)
    }

    /// Load and validate a specific file
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_json_str(&content)?;
        info!("Loaded pipeline config from {}", path.display());
        Ok(config)
    }

    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: PipelineConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(field: &'static str, reason: &str) -> ConfigError {
            ConfigError::Invalid {
                field,
                reason: reason.to_string(),
            }
        }

        if self.keyframe_request_threshold == 0 {
            return Err(invalid("keyframe_request_threshold", "must be at least 1"));
        }
        if self.keyframe_retry_interval == 0 {
            return Err(invalid("keyframe_retry_interval", "must be at least 1"));
        }
        if self.backend_fault_threshold == 0 {
            return Err(invalid("backend_fault_threshold", "must be at least 1"));
        }
        if self.stall_timeout_ms == 0 {
            return Err(invalid("stall_timeout_ms", "must be positive"));
        }
        if self.decode_queue_depth == 0 {
            return Err(invalid("decode_queue_depth", "must be at least 1"));
        }
        if self.stats_channel_capacity == 0 {
            return Err(invalid("stats_channel_capacity", "must be at least 1"));
        }
        if self.event_channel_capacity == 0 {
            return Err(invalid("event_channel_capacity", "must be at least 1"));
        }
        if self.stats_window_ms == 0 {
            return Err(invalid("stats_window_ms", "must be positive"));
        }
        if !(self.display.peak_nits.is_finite() && self.display.peak_nits > 0.0) {
            return Err(invalid("display.peak_nits", "must be a positive number"));
        }
        if self.backend_fault_threshold < self.keyframe_request_threshold {
            warn!(
                "backend_fault_threshold ({}) below keyframe_request_threshold ({}): backends fault before a keyframe is requested",
                self.backend_fault_threshold, self.keyframe_request_threshold
            );
        }
        Ok(())
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_millis(self.stall_timeout_ms)
    }

    pub fn stats_window(&self) -> Duration {
        Duration::from_millis(self.stats_window_ms)
    }
}

/// Output display capability used for tone mapping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    /// Peak luminance of the display in nits
    pub peak_nits: f32,
    /// Display accepts an HDR (PQ) swapchain
    pub hdr_output: bool,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            peak_nits: 203.0, // SDR reference white
            hdr_output: false,
        }
    }
}

/// Video codec options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    /// H.264/AVC - widest compatibility
    #[default]
    H264,
    /// H.265/HEVC - better compression
    H265,
    /// AV1 - best compression, modern GPUs only
    AV1,
}

impl VideoCodec {
    pub fn as_str(&self) -> &'static str {
        match self {
            VideoCodec::H264 => "H264",
            VideoCodec::H265 => "H265",
            VideoCodec::AV1 => "AV1",
        }
    }

    /// Get display name with description
    pub fn display_name(&self) -> &'static str {
        match self {
            VideoCodec::H264 => "H.264 (Wide compatibility)",
            VideoCodec::H265 => "H.265/HEVC (Better quality)",
            VideoCodec::AV1 => "AV1 (Best compression, modern GPUs)",
        }
    }

    /// Get all available codecs
    pub fn all() -> &'static [VideoCodec] {
        &[VideoCodec::H264, VideoCodec::H265, VideoCodec::AV1]
    }
}

/// Video decoder backend preference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum VideoDecoderBackend {
    /// Auto-detect best decoder
    #[default]
    Auto,
    /// NVIDIA CUDA/CUVID
    Cuvid,
    /// Intel QuickSync
    Qsv,
    /// Linux VA-API
    Vaapi,
    /// DirectX 11 (Windows)
    Dxva,
    /// VideoToolbox (macOS)
    VideoToolbox,
    /// V4L2 stateful/stateless decoders (Raspberry Pi)
    V4l2,
    /// Software decoding (CPU)
    Software,
}

impl VideoDecoderBackend {
    /// Short display name for dropdown
    pub fn as_str(&self) -> &'static str {
        match self {
            VideoDecoderBackend::Auto => "Auto",
            VideoDecoderBackend::Cuvid => "NVDEC",
            VideoDecoderBackend::Qsv => "QuickSync",
            VideoDecoderBackend::Vaapi => "VA-API",
            VideoDecoderBackend::Dxva => "D3D11",
            VideoDecoderBackend::VideoToolbox => "VideoToolbox",
            VideoDecoderBackend::V4l2 => "V4L2",
            VideoDecoderBackend::Software => "Software",
        }
    }

    /// Detailed description for tooltip
    pub fn description(&self) -> &'static str {
        match self {
            VideoDecoderBackend::Auto => {
                "Automatically selects the best available decoder for your system.\n\n\
                 Windows: NVDEC / QuickSync / D3D11\n\
                 Linux: NVDEC / VA-API / V4L2\n\
                 macOS: VideoToolbox"
            }
            VideoDecoderBackend::Cuvid => {
                "NVIDIA hardware decoding using NVDEC.\n\n\
                 Backend: GStreamer + nvh264dec/nvh265dec/nvav1dec\n\
                 Compatibility: NVIDIA GPUs only"
            }
            VideoDecoderBackend::Qsv => {
                "Intel hardware decoding using Quick Sync Video.\n\n\
                 Backend: GStreamer + qsvh264dec/qsvh265dec\n\
                 Compatibility: Intel CPUs with integrated graphics, Intel Arc"
            }
            VideoDecoderBackend::Vaapi => {
                "Linux hardware decoding via Video Acceleration API.\n\n\
                 Backend: GStreamer + vah264dec/vah265dec (or legacy vaapih264dec)\n\
                 Compatibility: AMD, Intel GPUs on Linux"
            }
            VideoDecoderBackend::Dxva => {
                "Windows DirectX Video Acceleration via GStreamer.\n\n\
                 Backend: GStreamer + d3d11h264dec/d3d11h265dec\n\
                 Compatibility: Windows with any modern GPU"
            }
            VideoDecoderBackend::VideoToolbox => {
                "macOS hardware decoding using Apple's VideoToolbox.\n\n\
                 Backend: GStreamer + vtdec\n\
                 Compatibility: macOS only"
            }
            VideoDecoderBackend::V4l2 => {
                "Linux V4L2 memory-to-memory decoding.\n\n\
                 Backend: GStreamer + v4l2h264dec/v4l2slh265dec\n\
                 Compatibility: Raspberry Pi and embedded SoCs"
            }
            VideoDecoderBackend::Software => {
                "CPU-based software decoding.\n\n\
                 Backend: OpenH264 (H.264), GStreamer avdec_h265 / dav1ddec\n\
                 Note: Use only if hardware decode fails"
            }
        }
    }

    pub fn all() -> &'static [VideoDecoderBackend] {
        &[
            VideoDecoderBackend::Auto,
            VideoDecoderBackend::Cuvid,
            VideoDecoderBackend::Qsv,
            VideoDecoderBackend::Vaapi,
            VideoDecoderBackend::Dxva,
            VideoDecoderBackend::VideoToolbox,
            VideoDecoderBackend::V4l2,
            VideoDecoderBackend::Software,
        ]
    }
}
