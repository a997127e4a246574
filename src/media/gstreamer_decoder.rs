//! GStreamer decoder backend
//!
//! appsrc -> parser -> decoder element -> [videoconvert] -> appsink
//!
//! One implementation covers NVDEC, QuickSync, VA-API, D3D11, VideoToolbox,
//! V4L2 and the software decoders; the backend only picks the element.
//! With zero-copy enabled, hardware decoders keep their native memory and
//! frames carry a `GpuSurface` holding the sample.

use anyhow::{anyhow, Context, Result};
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use log::{debug, info, warn};

use super::backend::{BackendDescriptor, BackendKind};
use super::rtp::AccessUnit;
use super::video::{DecodeError, DecodedPicture, FrameDecoder};
use super::{ColorRange, ColorSpace, GpuMemoryKind, GpuSurface, PixelFormat, TransferFunction};
use crate::app::VideoCodec;

/// How long one decode call waits for the pipeline to emit a picture
const PULL_TIMEOUT_MS: u64 = 8;

/// Whether GStreamer is usable and has `name` registered
pub fn is_gstreamer_element_available(name: &str) -> bool {
    gst::init().is_ok() && gst::ElementFactory::find(name).is_some()
}

pub struct GStreamerDecoder {
    pipeline: gst::Pipeline,
    appsrc: gst_app::AppSrc,
    appsink: gst_app::AppSink,
    kind: BackendKind,
    element: &'static str,
    frames_decoded: u64,
}

impl GStreamerDecoder {
    pub fn new(descriptor: &BackendDescriptor, codec: VideoCodec, zero_copy: bool) -> Result<Self> {
        gst::init().map_err(|e| anyhow!("GStreamer init failed: {e}"))?;

        let element = descriptor
            .kind
            .gstreamer_elements(codec)
            .iter()
            .copied()
            .find(|name| gst::ElementFactory::find(name).is_some())
            .ok_or_else(|| anyhow!("no {} element registered for {:?}", descriptor.name, codec))?;

        let (caps, parser_name) = match codec {
            VideoCodec::H264 => (
                gst::Caps::builder("video/x-h264")
                    .field("stream-format", "byte-stream")
                    .field("alignment", "au")
                    .build(),
                "h264parse",
            ),
            VideoCodec::H265 => (
                gst::Caps::builder("video/x-h265")
                    .field("stream-format", "byte-stream")
                    .field("alignment", "au")
                    .build(),
                "h265parse",
            ),
            VideoCodec::AV1 => (
                gst::Caps::builder("video/x-av1")
                    .field("stream-format", "obu-stream")
                    .field("alignment", "tu")
                    .build(),
                "av1parse",
            ),
        };

        let pipeline = gst::Pipeline::new();

        let appsrc = gst_app::AppSrc::builder()
            .stream_type(gst_app::AppStreamType::Stream)
            .format(gst::Format::Time)
            .is_live(true)
            .do_timestamp(true)
            .caps(&caps)
            .build();

        let parser = gst::ElementFactory::make(parser_name)
            .build()
            .with_context(|| format!("Failed to create {parser_name}"))?;
        let decoder = gst::ElementFactory::make(element)
            .build()
            .with_context(|| format!("Failed to create {element}"))?;

        let keep_gpu_memory = zero_copy && descriptor.gpu_output;
        let appsink = if keep_gpu_memory {
            gst_app::AppSink::builder()
                .max_buffers(2)
                .drop(true)
                .sync(false)
                .build()
        } else {
            gst_app::AppSink::builder()
                .caps(
                    &gst::Caps::builder("video/x-raw")
                        .field(
                            "format",
                            gst::List::new(["NV12", "P010_10LE", "I420"]),
                        )
                        .build(),
                )
                .max_buffers(2)
                .drop(true)
                .sync(false)
                .build()
        };

        let mut chain: Vec<gst::Element> = vec![appsrc.clone().upcast(), parser, decoder];
        if !keep_gpu_memory {
            chain.push(
                gst::ElementFactory::make("videoconvert")
                    .build()
                    .context("Failed to create videoconvert")?,
            );
        }
        chain.push(appsink.clone().upcast());

        pipeline
            .add_many(&chain)
            .context("Failed to add elements to pipeline")?;
        gst::Element::link_many(&chain)
            .with_context(|| format!("Failed to link appsrc -> {parser_name} -> {element}"))?;

        pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| anyhow!("Failed to start {element} pipeline: {e:?}"))?;

        info!(
            "GStreamer {} pipeline created: {} -> {} (zero-copy: {})",
            descriptor.name, parser_name, element, keep_gpu_memory
        );

        Ok(Self {
            pipeline,
            appsrc,
            appsink,
            kind: descriptor.kind,
            element,
            frames_decoded: 0,
        })
    }

    pub fn frames_decoded(&self) -> u64 {
        self.frames_decoded
    }

    /// First error posted on the bus since the last call
    fn pipeline_error(&self) -> Option<String> {
        let bus = self.pipeline.bus()?;
        let message = bus.pop_filtered(&[gst::MessageType::Error])?;
        match message.view() {
            gst::MessageView::Error(err) => Some(format!(
                "{} ({})",
                err.error(),
                err.debug().map(|d| d.to_string()).unwrap_or_default()
            )),
            _ => None,
        }
    }

    fn sample_to_picture(&self, sample: gst::Sample) -> Result<DecodedPicture, DecodeError> {
        let caps = sample
            .caps()
            .ok_or_else(|| DecodeError::Backend("sample has no caps".into()))?;
        let info = gst_video::VideoInfo::from_caps(caps)
            .map_err(|e| DecodeError::Backend(format!("invalid video caps: {e}")))?;

        let format = match info.format() {
            gst_video::VideoFormat::Nv12 => PixelFormat::NV12,
            gst_video::VideoFormat::P01010le => PixelFormat::P010,
            gst_video::VideoFormat::I420 => PixelFormat::YUV420P,
            other => {
                return Err(DecodeError::Backend(format!(
                    "unsupported output format {other:?}"
                )))
            }
        };

        let colorimetry = info.colorimetry();
        let color_space = match colorimetry.matrix() {
            gst_video::VideoColorMatrix::Bt601 => ColorSpace::BT601,
            gst_video::VideoColorMatrix::Bt2020 => ColorSpace::BT2020,
            _ => ColorSpace::BT709,
        };
        let color_range = match colorimetry.range() {
            gst_video::VideoColorRange::Range0_255 => ColorRange::Full,
            _ => ColorRange::Limited,
        };
        let transfer_function = match colorimetry.transfer() {
            gst_video::VideoTransferFunction::Smpte2084 => TransferFunction::PQ,
            gst_video::VideoTransferFunction::AribStdB67 => TransferFunction::HLG,
            _ => TransferFunction::SDR,
        };

        let mut picture = DecodedPicture {
            width: info.width(),
            height: info.height(),
            y_plane: Vec::new(),
            u_plane: Vec::new(),
            v_plane: Vec::new(),
            y_stride: 0,
            u_stride: 0,
            v_stride: 0,
            format,
            color_range,
            color_space,
            transfer_function,
            gpu_frame: None,
        };

        if let Some(memory) = caps.features(0).and_then(gpu_memory_kind) {
            picture.gpu_frame = Some(GpuSurface::new(memory, sample));
            return Ok(picture);
        }

        let buffer = sample
            .buffer()
            .ok_or_else(|| DecodeError::Backend("sample has no buffer".into()))?;
        let frame = gst_video::VideoFrameRef::from_buffer_ref_readable(buffer, &info)
            .map_err(|_| DecodeError::Backend("failed to map video buffer".into()))?;

        let plane = |index: u32| -> Result<Vec<u8>, DecodeError> {
            frame
                .plane_data(index)
                .map(|data| data.to_vec())
                .map_err(|e| DecodeError::Backend(format!("plane {index}: {e}")))
        };
        let strides = frame.plane_stride();

        picture.y_plane = plane(0)?;
        picture.y_stride = strides[0] as u32;
        picture.u_plane = plane(1)?;
        picture.u_stride = strides[1] as u32;
        if format == PixelFormat::YUV420P {
            picture.v_plane = plane(2)?;
            picture.v_stride = strides[2] as u32;
        }

        Ok(picture)
    }
}

fn gpu_memory_kind(features: &gst::CapsFeaturesRef) -> Option<GpuMemoryKind> {
    if features.contains("memory:DMABuf") {
        Some(GpuMemoryKind::DmaBuf)
    } else if features.contains("memory:D3D11Memory") {
        Some(GpuMemoryKind::D3D11Texture)
    } else if features.contains("memory:GLMemory")
        || features.contains("memory:CUDAMemory")
        || features.contains("memory:VAMemory")
    {
        Some(GpuMemoryKind::GstMemory)
    } else {
        None
    }
}

impl FrameDecoder for GStreamerDecoder {
    fn decode(&mut self, au: &AccessUnit) -> Result<Option<DecodedPicture>, DecodeError> {
        let mut buffer = gst::Buffer::from_slice(au.data.clone());
        if !au.is_keyframe {
            if let Some(buffer_ref) = buffer.get_mut() {
                buffer_ref.set_flags(gst::BufferFlags::DELTA_UNIT);
            }
        }

        match self.appsrc.push_buffer(buffer) {
            Ok(_) => {}
            Err(gst::FlowError::Flushing) => {
                debug!("{}: pipeline flushing, skipping buffer", self.element);
                return Ok(None);
            }
            Err(e) => {
                return Err(DecodeError::DeviceLost(format!(
                    "{} rejected buffer: {e:?}",
                    self.element
                )))
            }
        }

        if let Some(err) = self.pipeline_error() {
            warn!("{}: pipeline error: {}", self.element, err);
            return Err(DecodeError::DeviceLost(err));
        }

        let Some(sample) = self
            .appsink
            .try_pull_sample(gst::ClockTime::from_mseconds(PULL_TIMEOUT_MS))
        else {
            return Ok(None);
        };

        let picture = self.sample_to_picture(sample)?;
        self.frames_decoded += 1;
        if self.frames_decoded == 1 {
            info!(
                "{}: first frame {}x{} {:?} {:?}",
                self.element,
                picture.width,
                picture.height,
                picture.format,
                picture.transfer_function
            );
        }
        Ok(Some(picture))
    }

    fn kind(&self) -> BackendKind {
        self.kind
    }
}

impl Drop for GStreamerDecoder {
    fn drop(&mut self) {
        let _ = self.appsrc.end_of_stream();
        if let Err(e) = self.pipeline.set_state(gst::State::Null) {
            warn!("{}: failed to stop pipeline: {:?}", self.element, e);
        }
    }
}
