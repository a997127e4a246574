//! OpenH264 software decoder
//!
//! H.264 fallback available on every platform. Output is YUV420P in CPU memory.

use anyhow::{Context, Result};
use log::{debug, info};
use openh264::decoder::Decoder;
use openh264::formats::YUVSource;

use super::backend::BackendKind;
use super::rtp::AccessUnit;
use super::video::{DecodeError, DecodedPicture, FrameDecoder};
use super::{ColorRange, ColorSpace, PixelFormat, TransferFunction};

pub struct OpenH264Decoder {
    decoder: Decoder,
    frames_decoded: u64,
    resolution: (u32, u32),
}

impl OpenH264Decoder {
    pub fn new() -> Result<Self> {
        let decoder = Decoder::new().context("Failed to create OpenH264 decoder")?;
        info!("OpenH264 decoder created");
        Ok(Self {
            decoder,
            frames_decoded: 0,
            resolution: (0, 0),
        })
    }

    pub fn frames_decoded(&self) -> u64 {
        self.frames_decoded
    }
}

impl FrameDecoder for OpenH264Decoder {
    fn decode(&mut self, au: &AccessUnit) -> Result<Option<DecodedPicture>, DecodeError> {
        let decoded = self
            .decoder
            .decode(&au.data)
            .map_err(|e| DecodeError::Malformed(e.to_string()))?;

        let Some(yuv) = decoded else {
            return Ok(None);
        };

        let (width, height) = yuv.dimensions();
        let (y_stride, u_stride, v_stride) = yuv.strides();
        let (width, height) = (width as u32, height as u32);

        if self.resolution != (width, height) {
            debug!(
                "OpenH264: resolution {}x{} -> {}x{}",
                self.resolution.0, self.resolution.1, width, height
            );
            self.resolution = (width, height);
        }
        self.frames_decoded += 1;

        // The decoder reuses its buffers on the next call
        Ok(Some(DecodedPicture {
            width,
            height,
            y_plane: yuv.y().to_vec(),
            u_plane: yuv.u().to_vec(),
            v_plane: yuv.v().to_vec(),
            y_stride: y_stride as u32,
            u_stride: u_stride as u32,
            v_stride: v_stride as u32,
            format: PixelFormat::YUV420P,
            // OpenH264 does not surface VUI color description
            color_range: ColorRange::Limited,
            color_space: ColorSpace::BT709,
            transfer_function: TransferFunction::SDR,
            gpu_frame: None,
        }))
    }

    fn kind(&self) -> BackendKind {
        BackendKind::OpenH264
    }
}
