//! Video Renderer
//!
//! Pulls the newest frame from the shared slot at render cadence, prepares
//! the color pipeline and hands the frame to a `RenderSurface`. A frame id is
//! drawn at most once; redraws only happen when the overlay changes.

use log::{debug, info, warn};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::color::{convert_frame_to_rgba, ColorUniforms};
use crate::app::{DisplayConfig, FrameReader};
use crate::error::RenderError;
use crate::media::{GpuSurface, PixelFormat, RenderStatsSender, TransferFunction, VideoFrame};
use crate::profile_scope;

/// Destination of rendered frames.
///
/// The renderer calls `configure` whenever size or format changes, then one
/// of `upload_planes` / `bind_gpu_surface`, `draw`, optionally
/// `composite_overlay`, and finally `present`.
pub trait RenderSurface {
    fn configure(&mut self, width: u32, height: u32, format: PixelFormat)
        -> Result<(), RenderError>;

    /// Copy CPU planes into the surface's textures
    fn upload_planes(&mut self, frame: &Arc<VideoFrame>) -> Result<(), RenderError>;

    /// Bind a GPU-resident picture without copying.
    /// Surfaces that cannot import `surface.memory` return `UnsupportedSurface`.
    fn bind_gpu_surface(
        &mut self,
        frame: &Arc<VideoFrame>,
        surface: &GpuSurface,
    ) -> Result<(), RenderError>;

    fn draw(&mut self, uniforms: &ColorUniforms) -> Result<(), RenderError>;

    fn composite_overlay(&mut self, overlay: &OverlayLayer) -> Result<(), RenderError>;

    fn present(&mut self) -> Result<(), RenderError>;
}

/// UI layer drawn over the video, straight-alpha RGBA8
#[derive(Debug, Clone, PartialEq)]
pub struct OverlayLayer {
    pub width: u32,
    pub height: u32,
    pub rgba: Vec<u8>,
}

impl OverlayLayer {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            rgba: vec![0; (width * height * 4) as usize],
        }
    }

    pub fn fill_rect(&mut self, x: u32, y: u32, w: u32, h: u32, color: [u8; 4]) {
        for row in y..(y + h).min(self.height) {
            for col in x..(x + w).min(self.width) {
                let at = ((row * self.width + col) * 4) as usize;
                self.rgba[at..at + 4].copy_from_slice(&color);
            }
        }
    }
}

/// Result of one `Renderer::render` call
#[derive(Debug, Clone, PartialEq)]
pub enum RenderOutcome {
    /// A new frame was drawn and presented
    Presented {
        frame_id: u64,
        render_time: Duration,
        /// Frames replaced in the slot before this render could pick them up
        skipped: u64,
    },
    /// Current frame redrawn because the overlay changed
    OverlayRefreshed { frame_id: u64 },
    /// Nothing new to draw
    Unchanged,
}

pub struct Renderer<S: RenderSurface> {
    surface: S,
    reader: FrameReader,
    display: DisplayConfig,
    zero_copy: bool,

    current_frame: Option<Arc<VideoFrame>>,
    last_rendered_id: u64,
    video_size: (u32, u32),
    current_format: PixelFormat,
    current_transfer_function: TransferFunction,
    uniforms: Option<ColorUniforms>,

    overlay: Option<OverlayLayer>,
    overlay_dirty: bool,
    frames_rendered: u64,
    stats: Option<RenderStatsSender>,
}

impl<S: RenderSurface> Renderer<S> {
    pub fn new(surface: S, reader: FrameReader, display: DisplayConfig, zero_copy: bool) -> Self {
        Self {
            surface,
            reader,
            display,
            zero_copy,
            current_frame: None,
            last_rendered_id: 0,
            video_size: (0, 0),
            current_format: PixelFormat::default(),
            current_transfer_function: TransferFunction::default(),
            uniforms: None,
            overlay: None,
            overlay_dirty: false,
            frames_rendered: 0,
            stats: None,
        }
    }

    /// Report presented frames to a stats aggregator
    pub fn with_stats(mut self, stats: RenderStatsSender) -> Self {
        self.stats = Some(stats);
        self
    }

    pub fn surface(&self) -> &S {
        &self.surface
    }

    pub fn surface_mut(&mut self) -> &mut S {
        &mut self.surface
    }

    pub fn frames_rendered(&self) -> u64 {
        self.frames_rendered
    }

    pub fn last_rendered_id(&self) -> u64 {
        self.last_rendered_id
    }

    pub fn set_overlay(&mut self, overlay: Option<OverlayLayer>) {
        if self.overlay != overlay {
            self.overlay = overlay;
            self.overlay_dirty = true;
        }
    }

    /// Display capability changed (e.g. window moved to an HDR monitor)
    pub fn set_display(&mut self, display: DisplayConfig) {
        if self.display != display {
            info!(
                "Display changed: peak {} nits, HDR output {}",
                display.peak_nits, display.hdr_output
            );
            self.display = display;
            self.uniforms = None;
            self.overlay_dirty = true;
        }
    }

    /// Render the newest frame if there is one
    pub fn render(&mut self) -> Result<RenderOutcome, RenderError> {
        profile_scope!("render_frame");
        let start = Instant::now();

        let previous_id = self.reader.cursor();
        let Some(frame) = self.reader.read() else {
            return self.refresh_overlay();
        };

        if frame.frame_id <= self.last_rendered_id {
            return Ok(RenderOutcome::Unchanged);
        }
        let skipped = if self.last_rendered_id > 0 {
            frame.frame_id.saturating_sub(previous_id.max(self.last_rendered_id) + 1)
        } else {
            0
        };
        if skipped > 0 {
            debug!(
                "{} frame(s) replaced before render (now at {})",
                skipped, frame.frame_id
            );
        }

        self.update_video(&frame)?;
        self.draw_current()?;

        self.last_rendered_id = frame.frame_id;
        self.current_frame = Some(Arc::clone(&frame));
        self.frames_rendered += 1;
        crate::profiling::frame_mark();

        let render_time = start.elapsed();
        if let Some(ref stats) = self.stats {
            stats.record_presented(render_time, skipped);
        }
        Ok(RenderOutcome::Presented {
            frame_id: frame.frame_id,
            render_time,
            skipped,
        })
    }

    fn refresh_overlay(&mut self) -> Result<RenderOutcome, RenderError> {
        if !self.overlay_dirty {
            return Ok(RenderOutcome::Unchanged);
        }
        let Some(frame) = self.current_frame.clone() else {
            return Ok(RenderOutcome::Unchanged);
        };
        self.update_video(&frame)?;
        self.draw_current()?;
        Ok(RenderOutcome::OverlayRefreshed {
            frame_id: frame.frame_id,
        })
    }

    fn update_video(&mut self, frame: &Arc<VideoFrame>) -> Result<(), RenderError> {
        let format_changed = self.current_format != frame.format;
        let size_changed = self.video_size != (frame.width, frame.height);

        if self.current_transfer_function != frame.transfer_function {
            info!(
                "Transfer function changed: {:?} -> {:?}",
                self.current_transfer_function, frame.transfer_function
            );
            self.current_transfer_function = frame.transfer_function;
            self.uniforms = None;
        }

        if size_changed || format_changed {
            info!(
                "Video surface: {}x{} {:?} -> {}x{} {:?}",
                self.video_size.0,
                self.video_size.1,
                self.current_format,
                frame.width,
                frame.height,
                frame.format
            );
            self.surface.configure(frame.width, frame.height, frame.format)?;
            self.current_format = frame.format;
            self.video_size = (frame.width, frame.height);
        }

        let uniforms = ColorUniforms::for_frame(frame, &self.display);
        if self.uniforms != Some(uniforms) {
            debug!(
                "Color pipeline: {:?} {} {:?} (output {})",
                frame.color_range,
                frame.color_space.name(),
                frame.transfer_function,
                if uniforms.output == super::color::OUTPUT_PQ { "PQ" } else { "SDR" }
            );
            self.uniforms = Some(uniforms);
        }

        match frame.gpu_frame {
            Some(ref gpu) if self.zero_copy => {
                match self.surface.bind_gpu_surface(frame, gpu) {
                    Ok(()) => Ok(()),
                    Err(RenderError::UnsupportedSurface(kind)) if !frame.y_plane.is_empty() => {
                        warn!("{:?} import unsupported, uploading planes", kind);
                        self.surface.upload_planes(frame)
                    }
                    Err(e) => Err(e),
                }
            }
            Some(ref gpu) if frame.y_plane.is_empty() => {
                // No CPU copy exists; the handle is the only way to draw it
                self.surface.bind_gpu_surface(frame, gpu)
            }
            _ => self.surface.upload_planes(frame),
        }
    }

    fn draw_current(&mut self) -> Result<(), RenderError> {
        let Some(uniforms) = self.uniforms else {
            return Ok(());
        };
        self.surface.draw(&uniforms)?;
        if let Some(ref overlay) = self.overlay {
            self.surface.composite_overlay(overlay)?;
        }
        self.overlay_dirty = false;
        self.surface.present()
    }
}

/// Software surface producing an RGBA8 framebuffer.
///
/// Used for headless rendering, screenshots and recording. GPU handles are
/// not importable here.
#[derive(Default)]
pub struct CpuSurface {
    width: u32,
    height: u32,
    frame: Option<Arc<VideoFrame>>,
    framebuffer: Vec<u8>,
    presented: Vec<u8>,
    present_count: u64,
    configure_count: u64,
}

impl CpuSurface {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Last presented image, RGBA8
    pub fn pixels(&self) -> &[u8] {
        &self.presented
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let at = ((y * self.width + x) * 4) as usize;
        self.presented
            .get(at..at + 4)
            .and_then(|p| p.try_into().ok())
    }

    pub fn present_count(&self) -> u64 {
        self.present_count
    }

    pub fn configure_count(&self) -> u64 {
        self.configure_count
    }
}

impl RenderSurface for CpuSurface {
    fn configure(
        &mut self,
        width: u32,
        height: u32,
        _format: PixelFormat,
    ) -> Result<(), RenderError> {
        self.width = width;
        self.height = height;
        self.framebuffer = vec![0; (width * height * 4) as usize];
        self.configure_count += 1;
        Ok(())
    }

    fn upload_planes(&mut self, frame: &Arc<VideoFrame>) -> Result<(), RenderError> {
        self.frame = Some(Arc::clone(frame));
        Ok(())
    }

    fn bind_gpu_surface(
        &mut self,
        _frame: &Arc<VideoFrame>,
        surface: &GpuSurface,
    ) -> Result<(), RenderError> {
        Err(RenderError::UnsupportedSurface(surface.memory))
    }

    fn draw(&mut self, uniforms: &ColorUniforms) -> Result<(), RenderError> {
        if let Some(ref frame) = self.frame {
            convert_frame_to_rgba(frame, uniforms, &mut self.framebuffer)?;
        }
        Ok(())
    }

    fn composite_overlay(&mut self, overlay: &OverlayLayer) -> Result<(), RenderError> {
        if (overlay.width, overlay.height) != (self.width, self.height) {
            return Err(RenderError::OverlaySize {
                overlay_width: overlay.width,
                overlay_height: overlay.height,
                width: self.width,
                height: self.height,
            });
        }
        for (dst, src) in self
            .framebuffer
            .chunks_exact_mut(4)
            .zip(overlay.rgba.chunks_exact(4))
        {
            let alpha = u32::from(src[3]);
            if alpha == 0 {
                continue;
            }
            for c in 0..3 {
                let blended = (u32::from(src[c]) * alpha + u32::from(dst[c]) * (255 - alpha)) / 255;
                dst[c] = blended as u8;
            }
            dst[3] = 255;
        }
        Ok(())
    }

    fn present(&mut self) -> Result<(), RenderError> {
        self.presented.clone_from(&self.framebuffer);
        self.present_count += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::SharedFrame;
    use crate::media::GpuMemoryKind;

    fn renderer(slot: &Arc<SharedFrame>) -> Renderer<CpuSurface> {
        Renderer::new(CpuSurface::new(), slot.reader(), DisplayConfig::default(), true)
    }

    #[test]
    fn test_duplicate_id_renders_once() {
        let slot = Arc::new(SharedFrame::new());
        let mut renderer = renderer(&slot);

        assert!(slot.write(VideoFrame::solid(1, 4, 4, 235, 128, 128)));
        assert!(!slot.write(VideoFrame::solid(1, 4, 4, 16, 128, 128)));

        assert!(matches!(
            renderer.render().unwrap(),
            RenderOutcome::Presented { frame_id: 1, .. }
        ));
        assert_eq!(renderer.render().unwrap(), RenderOutcome::Unchanged);
        assert_eq!(renderer.surface().present_count(), 1);
        assert_eq!(renderer.surface().pixel(0, 0), Some([255, 255, 255, 255]));
    }

    #[test]
    fn test_skipped_frames_reported() {
        let slot = Arc::new(SharedFrame::new());
        let mut renderer = renderer(&slot);

        slot.write(VideoFrame::solid(1, 2, 2, 16, 128, 128));
        renderer.render().unwrap();
        for id in 2..=5 {
            slot.write(VideoFrame::solid(id, 2, 2, 16, 128, 128));
        }
        match renderer.render().unwrap() {
            RenderOutcome::Presented {
                frame_id, skipped, ..
            } => {
                assert_eq!(frame_id, 5);
                assert_eq!(skipped, 3);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_presents_reported_to_stats() {
        use crate::app::VideoCodec;
        use crate::media::StatsAggregator;

        let slot = Arc::new(SharedFrame::new());
        let mut aggregator = StatsAggregator::detached(VideoCodec::H264, Duration::from_secs(1));
        let mut renderer = renderer(&slot).with_stats(aggregator.render_stats());

        slot.write(VideoFrame::solid(1, 2, 2, 16, 128, 128));
        renderer.render().unwrap();
        slot.write(VideoFrame::solid(4, 2, 2, 16, 128, 128));
        renderer.render().unwrap();
        // Unchanged renders are not counted
        renderer.render().unwrap();

        aggregator.poll();
        let stats = aggregator.handle().load();
        assert_eq!(stats.frames_rendered, 2);
        assert_eq!(stats.frames_dropped, 2);
    }

    #[test]
    fn test_reconfigure_on_size_change() {
        let slot = Arc::new(SharedFrame::new());
        let mut renderer = renderer(&slot);

        slot.write(VideoFrame::solid(1, 4, 4, 16, 128, 128));
        renderer.render().unwrap();
        slot.write(VideoFrame::solid(2, 4, 4, 16, 128, 128));
        renderer.render().unwrap();
        assert_eq!(renderer.surface().configure_count(), 1);

        slot.write(VideoFrame::solid(3, 8, 6, 16, 128, 128));
        renderer.render().unwrap();
        assert_eq!(renderer.surface().configure_count(), 2);
        assert_eq!(renderer.surface().size(), (8, 6));
        assert_eq!(renderer.surface().pixels().len(), 8 * 6 * 4);
    }

    #[test]
    fn test_overlay_change_redraws_current_frame() {
        let slot = Arc::new(SharedFrame::new());
        let mut renderer = renderer(&slot);

        slot.write(VideoFrame::solid(1, 2, 2, 16, 128, 128));
        renderer.render().unwrap();

        let mut overlay = OverlayLayer::new(2, 2);
        overlay.fill_rect(0, 0, 1, 1, [255, 0, 0, 255]);
        renderer.set_overlay(Some(overlay));

        assert_eq!(
            renderer.render().unwrap(),
            RenderOutcome::OverlayRefreshed { frame_id: 1 }
        );
        assert_eq!(renderer.surface().pixel(0, 0), Some([255, 0, 0, 255]));
        assert_eq!(renderer.surface().pixel(1, 1), Some([0, 0, 0, 255]));
        assert_eq!(renderer.render().unwrap(), RenderOutcome::Unchanged);
    }

    #[test]
    fn test_overlay_size_mismatch() {
        let slot = Arc::new(SharedFrame::new());
        let mut renderer = renderer(&slot);
        renderer.set_overlay(Some(OverlayLayer::new(3, 3)));

        slot.write(VideoFrame::solid(1, 2, 2, 16, 128, 128));
        let err = renderer.render().unwrap_err();
        assert!(matches!(err, RenderError::OverlaySize { .. }));
    }

    #[test]
    fn test_gpu_frame_falls_back_to_planes() {
        let slot = Arc::new(SharedFrame::new());
        let mut renderer = renderer(&slot);

        let mut frame = VideoFrame::solid(1, 2, 2, 235, 128, 128);
        frame.gpu_frame = Some(GpuSurface::new(GpuMemoryKind::DmaBuf, ()));
        slot.write(frame);
        assert!(matches!(
            renderer.render().unwrap(),
            RenderOutcome::Presented { .. }
        ));

        let mut gpu_only = VideoFrame::solid(2, 2, 2, 0, 0, 0);
        gpu_only.y_plane.clear();
        gpu_only.gpu_frame = Some(GpuSurface::new(GpuMemoryKind::D3D11Texture, ()));
        slot.write(gpu_only);
        assert_eq!(
            renderer.render().unwrap_err(),
            RenderError::UnsupportedSurface(GpuMemoryKind::D3D11Texture)
        );
    }
}
