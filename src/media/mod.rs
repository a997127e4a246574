//! Media Pipeline
//!
//! Depacketizing, backend selection, video decoding and decode statistics.

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

mod backend;
mod obu;
mod rtp;
mod stats;
mod video;

#[cfg(feature = "openh264")]
mod openh264_decoder;

#[cfg(feature = "gstreamer")]
mod gstreamer_decoder;

pub use backend::{
    detect_gpu, detect_gpu_vendor, pick_best_adapter, preferred_kind, probe_available_backends,
    select_backends, BackendAvailability, BackendDescriptor, BackendKind, GpuInfo, GpuVendor,
    Platform, SelectionInput, BACKENDS,
};
pub use rtp::{AccessUnit, DepacketizerCodec, RtpDepacketizer, TransportPacket};
pub use stats::{RenderStatsSender, StatsAggregator, StatsHandle};
pub use video::{
    BackendDecoder, DecodeError, DecodeStats, DecodedPicture, DecoderChannels, DecoderCounters,
    DecoderTotals, FrameDecoder, FrameSummary, UnifiedVideoDecoder,
};

#[cfg(feature = "openh264")]
pub use openh264_decoder::OpenH264Decoder;

#[cfg(feature = "gstreamer")]
pub use gstreamer_decoder::{is_gstreamer_element_available, GStreamerDecoder};

/// Pixel format of decoded video frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PixelFormat {
    /// YUV 4:2:0 planar (Y, U, V separate planes)
    #[default]
    YUV420P,
    /// NV12 semi-planar (Y plane + interleaved UV plane)
    NV12,
    /// P010 10-bit HDR (Y plane + interleaved UV, 10 bits per sample in 16-bit words)
    P010,
}

impl PixelFormat {
    pub fn bit_depth(&self) -> u32 {
        match self {
            PixelFormat::YUV420P | PixelFormat::NV12 => 8,
            PixelFormat::P010 => 10,
        }
    }

    /// Number of planes carried in `VideoFrame`
    pub fn plane_count(&self) -> usize {
        match self {
            PixelFormat::YUV420P => 3,
            PixelFormat::NV12 | PixelFormat::P010 => 2,
        }
    }

    pub fn bytes_per_sample(&self) -> usize {
        match self {
            PixelFormat::YUV420P | PixelFormat::NV12 => 1,
            PixelFormat::P010 => 2,
        }
    }
}

/// Video color range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ColorRange {
    /// Limited range (16-235 for Y, 16-240 for UV) - Standard for TV/Video
    #[default]
    Limited,
    /// Full range (0-255) - Standard for PC/JPEG
    Full,
}

/// Video color space (matrix coefficients)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ColorSpace {
    /// BT.709 (HDTV) - Default
    #[default]
    BT709,
    /// BT.601 (SDTV)
    BT601,
    /// BT.2020 (UHDTV)
    BT2020,
}

impl ColorSpace {
    pub fn name(&self) -> &'static str {
        match self {
            ColorSpace::BT709 => "BT.709",
            ColorSpace::BT601 => "BT.601",
            ColorSpace::BT2020 => "BT.2020",
        }
    }
}

/// Video transfer function (EOTF - Electro-Optical Transfer Function)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransferFunction {
    /// SDR gamma (~2.4) - BT.709/BT.601/sRGB
    #[default]
    SDR,
    /// HDR PQ (Perceptual Quantizer) - SMPTE ST 2084 / HDR10
    PQ,
    /// HDR HLG (Hybrid Log-Gamma) - ARIB STD-B67
    HLG,
}

impl TransferFunction {
    pub fn is_hdr(&self) -> bool {
        !matches!(self, TransferFunction::SDR)
    }
}

/// Kind of GPU-resident memory a backend hands out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpuMemoryKind {
    /// Linux DMA-BUF (VA-API, V4L2)
    DmaBuf,
    /// Windows D3D11 texture
    D3D11Texture,
    /// macOS CVPixelBuffer / IOSurface
    CvPixelBuffer,
    /// Opaque GStreamer memory (GL / CUDA / other)
    GstMemory,
}

/// Handle to a decoded picture that lives in GPU memory.
///
/// Cloning shares the handle. The backend resource is released when the
/// slot has replaced the frame and every in-flight render read has dropped
/// its `Arc<VideoFrame>`.
#[derive(Clone)]
pub struct GpuSurface {
    pub memory: GpuMemoryKind,
    resource: Arc<dyn Any + Send + Sync>,
}

impl GpuSurface {
    pub fn new<T: Any + Send + Sync>(memory: GpuMemoryKind, resource: T) -> Self {
        Self {
            memory,
            resource: Arc::new(resource),
        }
    }

    /// Borrow the backend resource as its concrete type
    pub fn resource<T: Any>(&self) -> Option<&T> {
        self.resource.downcast_ref::<T>()
    }
}

impl fmt::Debug for GpuSurface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GpuSurface")
            .field("memory", &self.memory)
            .finish_non_exhaustive()
    }
}

/// Decoded video frame
#[derive(Debug, Clone)]
pub struct VideoFrame {
    /// Unique frame ID, strictly increasing within a session
    /// Used to drop stale frames and skip redundant re-renders
    pub frame_id: u64,
    pub width: u32,
    pub height: u32,
    /// Y plane (luma) - full resolution
    pub y_plane: Vec<u8>,
    /// U plane (Cb chroma) - for YUV420P: half resolution
    /// For NV12/P010: this contains interleaved UV data
    pub u_plane: Vec<u8>,
    /// V plane (Cr chroma) - for YUV420P: half resolution
    /// For NV12/P010: this is empty (UV is interleaved in u_plane)
    pub v_plane: Vec<u8>,
    /// Row strides in bytes
    pub y_stride: u32,
    pub u_stride: u32,
    pub v_stride: u32,
    /// Presentation timestamp, microseconds since session start
    pub timestamp_us: u64,
    pub format: PixelFormat,
    pub color_range: ColorRange,
    pub color_space: ColorSpace,
    pub transfer_function: TransferFunction,
    /// Zero-copy GPU surface
    /// When present, the CPU planes are empty and rendering binds this directly
    pub gpu_frame: Option<GpuSurface>,
}

impl VideoFrame {
    /// Build a YUV420P frame filled with a single color. Chroma planes are
    /// half resolution, rounded up.
    pub fn solid(frame_id: u64, width: u32, height: u32, y: u8, u: u8, v: u8) -> Self {
        let uv_width = width.div_ceil(2);
        let uv_height = height.div_ceil(2);
        let y_size = (width * height) as usize;
        let uv_size = (uv_width * uv_height) as usize;

        Self {
            frame_id,
            width,
            height,
            y_plane: vec![y; y_size],
            u_plane: vec![u; uv_size],
            v_plane: vec![v; uv_size],
            y_stride: width,
            u_stride: uv_width,
            v_stride: uv_width,
            timestamp_us: 0,
            format: PixelFormat::YUV420P,
            color_range: ColorRange::Limited,
            color_space: ColorSpace::BT709,
            transfer_function: TransferFunction::SDR,
            gpu_frame: None,
        }
    }

    /// Whether the picture is GPU-resident (zero-copy path)
    pub fn is_gpu_resident(&self) -> bool {
        self.gpu_frame.is_some()
    }

    pub fn is_hdr(&self) -> bool {
        self.transfer_function.is_hdr()
    }

    /// "1920x1080"
    pub fn resolution(&self) -> String {
        format!("{}x{}", self.width, self.height)
    }
}

/// Signals that leave the pipeline towards the session-control layer
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    /// Forward a keyframe (PLI) request to the remote encoder
    KeyframeRequest { consecutive_failures: u32 },
    /// No decoded frame for the stall window; likely resolution or SSRC change
    Stall { silent_for: Duration },
    /// Backend became unusable and was replaced by `fallback`
    BackendFault {
        failed: BackendKind,
        fallback: BackendKind,
        reason: String,
    },
    /// Backend became unusable and nothing is left to fall back to
    FatalStreamError { reason: String },
}

/// Stream statistics snapshot polled by the UI
#[derive(Debug, Clone, Default)]
pub struct StreamStats {
    /// Video resolution
    pub resolution: String,
    /// Current decoded FPS (frames decoded per second)
    pub fps: f32,
    /// Render FPS (frames actually rendered to screen per second)
    pub render_fps: f32,
    /// Frame decode time in ms (rolling average)
    pub decode_time_ms: f32,
    /// Frame render time in ms (rolling average)
    pub render_time_ms: f32,
    /// Frame delivery latency (packet arrival to decode complete) in ms
    pub frame_delivery_ms: f32,
    /// Video codec name
    pub codec: String,
    /// Active decoder backend
    pub decoder_backend: String,
    /// Total access units handed to the decoder
    pub frames_received: u64,
    /// Total frames decoded
    pub frames_decoded: u64,
    /// Total frames dropped (decode failures, evicted units, stale frames)
    pub frames_dropped: u64,
    /// Total frames rendered
    pub frames_rendered: u64,
    /// Keyframe requests sent upstream
    pub keyframe_requests: u64,
    /// Whether the decoder currently waits for a keyframe
    pub needs_keyframe: bool,
    /// HDR mode (true = HDR/PQ/HLG, false = SDR)
    pub is_hdr: bool,
    /// Color space (e.g., "BT.709", "BT.2020")
    pub color_space: String,
}

impl StreamStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Format resolution string
    pub fn format_resolution(&self) -> String {
        if self.resolution.is_empty() {
            "N/A".to_string()
        } else {
            self.resolution.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_solid_frame_layout() {
        let frame = VideoFrame::solid(7, 5, 3, 16, 128, 128);
        assert_eq!(frame.y_plane.len(), 15);
        // 3x2 chroma for odd dimensions
        assert_eq!(frame.u_plane.len(), 6);
        assert_eq!(frame.u_stride, 3);
        assert_eq!(frame.resolution(), "5x3");
        assert!(!frame.is_gpu_resident());
    }

    #[test]
    fn test_gpu_surface_downcast() {
        let surface = GpuSurface::new(GpuMemoryKind::DmaBuf, 42u32);
        assert_eq!(surface.resource::<u32>(), Some(&42));
        assert!(surface.resource::<String>().is_none());
        assert!(format!("{:?}", surface).contains("DmaBuf"));
    }

    #[test]
    fn test_pixel_format_properties() {
        assert_eq!(PixelFormat::P010.bit_depth(), 10);
        assert_eq!(PixelFormat::P010.bytes_per_sample(), 2);
        assert_eq!(PixelFormat::YUV420P.plane_count(), 3);
        assert_eq!(PixelFormat::NV12.plane_count(), 2);
    }
}
