//! Stats Aggregator
//!
//! Folds per-unit `DecodeStats` and renderer timings into a `StreamStats`
//! snapshot. The snapshot is swapped atomically so UI reads never block.
//! Totals come from lossless atomics; the broadcast only feeds window
//! averages and per-frame metadata.

use arc_swap::ArcSwap;
use log::{debug, info};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast::{self, error::TryRecvError};

use super::video::{DecodeStats, DecoderCounters, DecoderTotals};
use super::StreamStats;
use crate::app::VideoCodec;

/// Read side of the published snapshot
#[derive(Clone)]
pub struct StatsHandle {
    snapshot: Arc<ArcSwap<StreamStats>>,
}

impl StatsHandle {
    /// Latest snapshot; may be one window stale
    pub fn load(&self) -> Arc<StreamStats> {
        self.snapshot.load_full()
    }
}

#[derive(Debug, Default)]
struct RenderCounters {
    presented: AtomicU64,
    skipped: AtomicU64,
    render_us: AtomicU64,
}

/// Render-thread side of the stats. Cloneable and lock-free, so the render
/// loop reports without touching the session.
#[derive(Debug, Clone, Default)]
pub struct RenderStatsSender {
    counters: Arc<RenderCounters>,
}

#[derive(Debug, Clone, Copy, Default)]
struct RenderTotals {
    presented: u64,
    skipped: u64,
    render_us: u64,
}

impl RenderStatsSender {
    /// A frame was presented after `skipped` newer-than-drawn frames were replaced
    pub fn record_presented(&self, render_time: Duration, skipped: u64) {
        let render_us = u64::try_from(render_time.as_micros()).unwrap_or(u64::MAX);
        self.counters.render_us.fetch_add(render_us, Ordering::Relaxed);
        self.counters.skipped.fetch_add(skipped, Ordering::Relaxed);
        self.counters.presented.fetch_add(1, Ordering::Relaxed);
    }

    fn totals(&self) -> RenderTotals {
        RenderTotals {
            presented: self.counters.presented.load(Ordering::Relaxed),
            skipped: self.counters.skipped.load(Ordering::Relaxed),
            render_us: self.counters.render_us.load(Ordering::Relaxed),
        }
    }
}

/// Sums over the current window
#[derive(Default)]
struct Window {
    decoded: u64,
    decode_ms: f64,
    decode_samples: u32,
    delivery_ms: f64,
}

pub struct StatsAggregator {
    rx: Option<broadcast::Receiver<DecodeStats>>,
    /// Lossless totals; without them totals are counted from `ingest`
    decoder: Option<Arc<DecoderCounters>>,
    ingested: DecoderTotals,
    render: RenderStatsSender,
    /// Render totals when the current window started
    render_base: RenderTotals,
    window_len: Duration,
    window_start: Instant,
    window: Window,
    current: StreamStats,
    snapshot: Arc<ArcSwap<StreamStats>>,
}

impl StatsAggregator {
    pub fn new(
        rx: broadcast::Receiver<DecodeStats>,
        counters: Arc<DecoderCounters>,
        codec: VideoCodec,
        window: Duration,
    ) -> Self {
        let mut aggregator = Self::detached(codec, window);
        aggregator.rx = Some(rx);
        aggregator.decoder = Some(counters);
        aggregator
    }

    /// Aggregator fed only through `ingest` and its render sender
    pub fn detached(codec: VideoCodec, window: Duration) -> Self {
        let current = StreamStats {
            codec: codec.as_str().to_string(),
            ..StreamStats::new()
        };
        Self {
            rx: None,
            decoder: None,
            ingested: DecoderTotals::default(),
            render: RenderStatsSender::default(),
            render_base: RenderTotals::default(),
            window_len: window,
            window_start: Instant::now(),
            window: Window::default(),
            snapshot: Arc::new(ArcSwap::from_pointee(current.clone())),
            current,
        }
    }

    pub fn handle(&self) -> StatsHandle {
        StatsHandle {
            snapshot: Arc::clone(&self.snapshot),
        }
    }

    /// Sender for the render thread
    pub fn render_stats(&self) -> RenderStatsSender {
        self.render.clone()
    }

    /// Drain pending decode stats and publish
    pub fn poll(&mut self) {
        self.poll_at(Instant::now());
    }

    pub fn poll_at(&mut self, now: Instant) {
        // Read before draining: every unit counted here has its stats queued
        let totals = self.decoder.as_ref().map(|counters| counters.totals());

        while let Some(rx) = self.rx.as_mut() {
            match rx.try_recv() {
                Ok(stats) => self.ingest(&stats),
                Err(TryRecvError::Lagged(missed)) => {
                    debug!("Stats receiver lagged, {} updates skipped", missed);
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Closed) => {
                    info!("Decoder stats channel closed");
                    self.rx = None;
                }
            }
        }
        let render = self.render.totals();
        self.roll_window(now, render);
        self.update_totals(totals.unwrap_or(self.ingested), render);
        self.publish();
    }

    /// Fold one decode result into the window and frame metadata
    pub fn ingest(&mut self, stats: &DecodeStats) {
        let ingested = &mut self.ingested;
        ingested.frames_received += 1;
        ingested.units_dropped += u64::from(stats.dropped);
        if stats.is_error {
            ingested.decode_errors += 1;
        }
        if stats.keyframe_requested {
            ingested.keyframe_requests += 1;
        }

        let current = &mut self.current;
        current.needs_keyframe = stats.needs_keyframe;
        current.decoder_backend = stats.backend.to_string();

        if let Some(frame) = stats.frame {
            self.ingested.frames_decoded += 1;
            let resolution = format!("{}x{}", frame.width, frame.height);
            if current.resolution != resolution {
                if !current.resolution.is_empty() {
                    info!("Resolution changed: {} -> {}", current.resolution, resolution);
                }
                current.resolution = resolution;
            }
            current.is_hdr = frame.is_hdr;
            current.color_space = frame.color_space.name().to_string();

            self.window.decoded += 1;
            self.window.decode_ms += f64::from(stats.decode_time_ms);
            self.window.delivery_ms += f64::from(stats.delivery_ms);
            self.window.decode_samples += 1;
        }
    }

    fn update_totals(&mut self, decoder: DecoderTotals, render: RenderTotals) {
        let current = &mut self.current;
        current.frames_received = decoder.frames_received;
        current.frames_decoded = decoder.frames_decoded;
        current.frames_dropped = decoder.units_dropped + decoder.decode_errors + render.skipped;
        current.keyframe_requests = decoder.keyframe_requests;
        current.frames_rendered = render.presented;
    }

    fn roll_window(&mut self, now: Instant, render: RenderTotals) {
        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed < self.window_len {
            return;
        }
        let secs = elapsed.as_secs_f64();
        let window = std::mem::take(&mut self.window);
        let rendered = render.presented - self.render_base.presented;
        let render_us = render.render_us - self.render_base.render_us;

        self.current.fps = (window.decoded as f64 / secs) as f32;
        self.current.render_fps = (rendered as f64 / secs) as f32;
        if window.decode_samples > 0 {
            let samples = f64::from(window.decode_samples);
            self.current.decode_time_ms = (window.decode_ms / samples) as f32;
            self.current.frame_delivery_ms = (window.delivery_ms / samples) as f32;
        }
        if rendered > 0 {
            self.current.render_time_ms = (render_us as f64 / 1000.0 / rendered as f64) as f32;
        }
        self.render_base = render;
        self.window_start = now;
    }

    fn publish(&self) {
        self.snapshot.store(Arc::new(self.current.clone()));
    }
}
