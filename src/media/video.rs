//! Unified Video Decoder
//!
//! One decode thread per session, fed through a bounded queue. The thread
//! owns the active backend, writes decoded frames to the `SharedFrame` slot,
//! publishes `DecodeStats` and raises `PipelineEvent`s for keyframe
//! requests, stalls and backend faults.

use anyhow::{anyhow, Result};
use log::{debug, error, info, warn};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc as std_mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc as tokio_mpsc};

use super::backend::{select_backends, BackendDescriptor, BackendKind, SelectionInput};
use super::rtp::AccessUnit;
use super::{
    ColorRange, ColorSpace, GpuSurface, PipelineEvent, PixelFormat, TransferFunction, VideoFrame,
};
use crate::app::{PipelineConfig, SessionClock, SharedFrame, VideoCodec};
use crate::error::PipelineError;
use crate::profile_scope;

/// Backend failure for a single decode call
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// Bitstream rejected (loss, reordering, missing references)
    #[error("malformed access unit: {0}")]
    Malformed(String),
    /// Backend-internal failure; the backend may recover
    #[error("backend error: {0}")]
    Backend(String),
    /// Device or driver gone; the backend cannot recover
    #[error("device lost: {0}")]
    DeviceLost(String),
}

/// Decoded picture as produced by a backend, before the session assigns
/// its frame id and timestamp
#[derive(Debug, Clone)]
pub struct DecodedPicture {
    pub width: u32,
    pub height: u32,
    pub y_plane: Vec<u8>,
    pub u_plane: Vec<u8>,
    pub v_plane: Vec<u8>,
    pub y_stride: u32,
    pub u_stride: u32,
    pub v_stride: u32,
    pub format: PixelFormat,
    pub color_range: ColorRange,
    pub color_space: ColorSpace,
    pub transfer_function: TransferFunction,
    pub gpu_frame: Option<GpuSurface>,
}

impl DecodedPicture {
    pub fn into_frame(self, frame_id: u64, timestamp_us: u64) -> VideoFrame {
        VideoFrame {
            frame_id,
            width: self.width,
            height: self.height,
            y_plane: self.y_plane,
            u_plane: self.u_plane,
            v_plane: self.v_plane,
            y_stride: self.y_stride,
            u_stride: self.u_stride,
            v_stride: self.v_stride,
            timestamp_us,
            format: self.format,
            color_range: self.color_range,
            color_space: self.color_space,
            transfer_function: self.transfer_function,
            gpu_frame: self.gpu_frame,
        }
    }
}

/// Contract every decode backend implements
pub trait FrameDecoder {
    /// Decode one access unit. `Ok(None)` means the backend buffered the
    /// unit without producing output.
    fn decode(&mut self, au: &AccessUnit) -> Result<Option<DecodedPicture>, DecodeError>;

    fn kind(&self) -> BackendKind;

    fn is_hw_accelerated(&self) -> bool {
        !self.kind().is_software()
    }
}

/// Closed set of compiled-in backends
pub enum BackendDecoder {
    #[cfg(feature = "openh264")]
    OpenH264(super::OpenH264Decoder),
    #[cfg(feature = "gstreamer")]
    GStreamer(super::GStreamerDecoder),
}

impl BackendDecoder {
    /// Open the backend described by `descriptor`
    pub fn open(descriptor: &BackendDescriptor, codec: VideoCodec, zero_copy: bool) -> Result<Self> {
        match descriptor.kind {
            #[cfg(feature = "openh264")]
            BackendKind::OpenH264 => {
                let _ = zero_copy;
                if codec != VideoCodec::H264 {
                    return Err(anyhow!("OpenH264 cannot decode {:?}", codec));
                }
                Ok(BackendDecoder::OpenH264(super::OpenH264Decoder::new()?))
            }
            #[cfg(feature = "gstreamer")]
            kind if kind != BackendKind::OpenH264 => Ok(BackendDecoder::GStreamer(
                super::GStreamerDecoder::new(descriptor, codec, zero_copy)?,
            )),
            kind => {
                let _ = (codec, zero_copy);
                Err(anyhow!("{} backend is not compiled into this build", kind))
            }
        }
    }
}

impl FrameDecoder for BackendDecoder {
    fn decode(&mut self, au: &AccessUnit) -> Result<Option<DecodedPicture>, DecodeError> {
        #[cfg(not(any(feature = "openh264", feature = "gstreamer")))]
        let _ = au;
        match *self {
            #[cfg(feature = "openh264")]
            BackendDecoder::OpenH264(ref mut decoder) => decoder.decode(au),
            #[cfg(feature = "gstreamer")]
            BackendDecoder::GStreamer(ref mut decoder) => decoder.decode(au),
        }
    }

    fn kind(&self) -> BackendKind {
        match *self {
            #[cfg(feature = "openh264")]
            BackendDecoder::OpenH264(_) => BackendKind::OpenH264,
            #[cfg(feature = "gstreamer")]
            BackendDecoder::GStreamer(ref decoder) => decoder.kind(),
        }
    }
}

/// Stats from the decoder thread
#[derive(Debug, Clone)]
pub struct DecodeStats {
    /// Time spent inside the backend (ms)
    pub decode_time_ms: f32,
    /// Time from packet receive to decode complete (ms)
    pub delivery_ms: f32,
    /// Whether a frame was produced
    pub frame_produced: bool,
    /// Whether the decoder is waiting for a keyframe
    pub needs_keyframe: bool,
    /// A keyframe request was raised for this unit
    pub keyframe_requested: bool,
    /// The backend returned an error
    pub is_error: bool,
    /// Units dropped before this one (queue evictions, discards)
    pub dropped: u32,
    pub backend: BackendKind,
    /// Set when a frame was produced
    pub frame: Option<FrameSummary>,
}

/// Metadata of a produced frame carried in stats
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameSummary {
    pub frame_id: u64,
    pub width: u32,
    pub height: u32,
    pub color_space: ColorSpace,
    pub is_hdr: bool,
}

/// Access unit waiting for the decode thread
struct QueuedUnit {
    au: AccessUnit,
    receive_time: Instant,
}

enum Pop {
    Unit(QueuedUnit, u32),
    Timeout,
    Closed,
}

struct QueueState {
    units: VecDeque<QueuedUnit>,
    evicted: u32,
    closed: bool,
}

/// Bounded hand-off between ingest and decode. Full queue evicts the oldest.
struct DecodeQueue {
    state: Mutex<QueueState>,
    ready: Condvar,
    capacity: usize,
}

impl DecodeQueue {
    fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                units: VecDeque::with_capacity(capacity),
                evicted: 0,
                closed: false,
            }),
            ready: Condvar::new(),
            capacity: capacity.max(1),
        }
    }

    /// Returns true if the oldest pending unit was evicted
    fn push(&self, unit: QueuedUnit) -> Result<bool, PipelineError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(PipelineError::DecoderClosed);
        }
        let evicted = if state.units.len() >= self.capacity {
            state.units.pop_front();
            state.evicted += 1;
            true
        } else {
            false
        };
        state.units.push_back(unit);
        drop(state);
        self.ready.notify_one();
        Ok(evicted)
    }

    fn pop(&self, timeout: Option<Duration>) -> Pop {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return Pop::Closed;
            }
            if let Some(unit) = state.units.pop_front() {
                let evicted = std::mem::take(&mut state.evicted);
                return Pop::Unit(unit, evicted);
            }
            match deadline {
                Some(deadline) => {
                    if self.ready.wait_until(&mut state, deadline).timed_out()
                        && !state.closed
                        && state.units.is_empty()
                    {
                        return Pop::Timeout;
                    }
                }
                None => self.ready.wait(&mut state),
            }
        }
    }

    /// Returns the number of pending units discarded
    fn close(&self) -> usize {
        let mut state = self.state.lock();
        state.closed = true;
        let pending = state.units.len();
        state.units.clear();
        drop(state);
        self.ready.notify_all();
        pending
    }
}

/// Recovery thresholds copied out of `PipelineConfig`
#[derive(Debug, Clone, Copy)]
struct Thresholds {
    keyframe_request: u32,
    keyframe_retry: u32,
    backend_fault: u32,
    stall_timeout: Duration,
}

impl Thresholds {
    fn from_config(config: &PipelineConfig) -> Self {
        Self {
            keyframe_request: config.keyframe_request_threshold.max(1),
            keyframe_retry: config.keyframe_retry_interval.max(1),
            backend_fault: config.backend_fault_threshold.max(1),
            stall_timeout: config.stall_timeout(),
        }
    }

    fn should_request_keyframe(&self, failures: u32) -> bool {
        failures == self.keyframe_request
            || (failures > self.keyframe_request
                && (failures - self.keyframe_request) % self.keyframe_retry == 0)
    }
}

/// Lossless totals kept by the decode thread.
///
/// The stats broadcast may drop updates under load; these counters never
/// do, so the stats aggregator reads its totals from here.
#[derive(Debug, Default)]
pub struct DecoderCounters {
    frames_received: AtomicU64,
    frames_decoded: AtomicU64,
    decode_errors: AtomicU64,
    units_dropped: AtomicU64,
    keyframe_requests: AtomicU64,
}

/// Point-in-time copy of `DecoderCounters`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecoderTotals {
    /// Units that reached the decode thread
    pub frames_received: u64,
    pub frames_decoded: u64,
    pub decode_errors: u64,
    /// Queue evictions, post-fatal discards and units pending at shutdown
    pub units_dropped: u64,
    pub keyframe_requests: u64,
}

impl DecoderCounters {
    pub fn totals(&self) -> DecoderTotals {
        DecoderTotals {
            frames_received: self.frames_received.load(Ordering::Acquire),
            frames_decoded: self.frames_decoded.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            units_dropped: self.units_dropped.load(Ordering::Relaxed),
            keyframe_requests: self.keyframe_requests.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn add_dropped(&self, units: u64) {
        self.units_dropped.fetch_add(units, Ordering::Relaxed);
    }

    /// Count one unit handled by the decode thread. Published after the
    /// unit's `DecodeStats` so a reader that sees the count can drain them.
    pub(crate) fn record_unit(&self, decoded: bool, is_error: bool) {
        if decoded {
            self.frames_decoded.fetch_add(1, Ordering::Relaxed);
        }
        if is_error {
            self.decode_errors.fetch_add(1, Ordering::Relaxed);
        }
        self.frames_received.fetch_add(1, Ordering::Release);
    }
}

/// Unified video decoder handle
///
/// `decode_async` never blocks beyond the queue push.
pub struct UnifiedVideoDecoder {
    queue: Arc<DecodeQueue>,
    thread: Option<JoinHandle<()>>,
    slot: Arc<SharedFrame>,
    stats_tx: broadcast::Sender<DecodeStats>,
    active: Arc<Mutex<BackendKind>>,
    counters: Arc<DecoderCounters>,
    codec: VideoCodec,
}

/// Receivers handed to the session when the decoder starts
pub struct DecoderChannels {
    pub stats: broadcast::Receiver<DecodeStats>,
    pub events: tokio_mpsc::Receiver<PipelineEvent>,
    pub counters: Arc<DecoderCounters>,
}

impl UnifiedVideoDecoder {
    /// Start a decoder on the compiled-in backends
    pub fn new_async(
        config: &PipelineConfig,
        selection: SelectionInput,
        slot: Arc<SharedFrame>,
        clock: SessionClock,
    ) -> Result<(Self, DecoderChannels), PipelineError> {
        let zero_copy = config.zero_copy;
        Self::spawn_with(config, selection, slot, clock, move |descriptor, codec| {
            BackendDecoder::open(descriptor, codec, zero_copy)
        })
    }

    /// Start a decoder whose backends are constructed by `open`.
    ///
    /// `open` runs on the decode thread, so backends need not be `Send`.
    pub fn spawn_with<D, F>(
        config: &PipelineConfig,
        selection: SelectionInput,
        slot: Arc<SharedFrame>,
        clock: SessionClock,
        open: F,
    ) -> Result<(Self, DecoderChannels), PipelineError>
    where
        D: FrameDecoder + 'static,
        F: FnMut(&BackendDescriptor, VideoCodec) -> Result<D> + Send + 'static,
    {
        let codec = selection.codec;
        let queue = Arc::new(DecodeQueue::new(config.decode_queue_depth));
        let (stats_tx, stats_rx) = broadcast::channel(config.stats_channel_capacity.max(1));
        let (events_tx, events_rx) = tokio_mpsc::channel(config.event_channel_capacity.max(1));
        let counters = Arc::new(DecoderCounters::default());
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<BackendKind, PipelineError>>();

        let worker_queue = Arc::clone(&queue);
        let worker_slot = Arc::clone(&slot);
        let worker_stats = stats_tx.clone();
        let worker_counters = Arc::clone(&counters);
        let thresholds = Thresholds::from_config(config);
        // Placeholder until the thread reports the opened backend
        let active = Arc::new(Mutex::new(BackendKind::OpenH264));
        let worker_active = Arc::clone(&active);

        let thread = thread::Builder::new()
            .name(format!("decoder-{}", codec.as_str().to_lowercase()))
            .spawn(move || {
                info!("Decoder thread started for {:?}", codec);
                let mut worker = DecodeWorker {
                    open,
                    decoder: None,
                    selection,
                    thresholds,
                    slot: worker_slot,
                    clock,
                    stats_tx: worker_stats,
                    events_tx,
                    active: worker_active,
                    counters: worker_counters,
                    next_frame_id: 0,
                    consecutive_failures: 0,
                    consecutive_errors: 0,
                    watchdog_since: None,
                    stall_reported: false,
                    awaiting_keyframe: false,
                    units_awaiting_keyframe: 0,
                };

                match worker.open_next() {
                    Some(kind) => {
                        let _ = ready_tx.send(Ok(kind));
                    }
                    None => {
                        let _ = ready_tx.send(Err(PipelineError::NoBackendAvailable { codec }));
                        return;
                    }
                }
                drop(ready_tx);

                worker.run(&worker_queue);
                info!("Decoder thread stopped");
            })?;

        match ready_rx.recv() {
            Ok(Ok(kind)) => info!("Decoder ready: {} for {:?}", kind, codec),
            Ok(Err(e)) => {
                let _ = thread.join();
                return Err(e);
            }
            Err(_) => {
                let _ = thread.join();
                return Err(PipelineError::DecoderClosed);
            }
        }

        let decoder = Self {
            queue,
            thread: Some(thread),
            slot,
            stats_tx,
            active,
            counters: Arc::clone(&counters),
            codec,
        };
        Ok((
            decoder,
            DecoderChannels {
                stats: stats_rx,
                events: events_rx,
                counters,
            },
        ))
    }

    /// Queue an access unit for decoding
    pub fn decode_async(&self, au: AccessUnit, receive_time: Instant) -> Result<(), PipelineError> {
        if self.queue.push(QueuedUnit { au, receive_time })? {
            self.counters.add_dropped(1);
            debug!("Decode queue full, evicted oldest access unit");
        }
        Ok(())
    }

    /// Additional stats subscriber
    pub fn subscribe_stats(&self) -> broadcast::Receiver<DecodeStats> {
        self.stats_tx.subscribe()
    }

    /// Backend currently decoding
    pub fn active_backend(&self) -> BackendKind {
        *self.active.lock()
    }

    /// Check if using hardware acceleration
    pub fn is_hw_accelerated(&self) -> bool {
        !self.active_backend().is_software()
    }

    pub fn codec(&self) -> VideoCodec {
        self.codec
    }

    /// Get number of frames decoded
    pub fn frames_decoded(&self) -> u64 {
        self.counters.frames_decoded.load(Ordering::Relaxed)
    }

    /// Units evicted from the queue or discarded after a fatal error
    pub fn units_dropped(&self) -> u64 {
        self.counters.units_dropped.load(Ordering::Relaxed)
    }

    pub fn counters(&self) -> Arc<DecoderCounters> {
        Arc::clone(&self.counters)
    }

    /// Stop accepting units, let the in-flight decode finish, clear the slot
    pub fn shutdown(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        let pending = self.queue.close();
        if pending > 0 {
            debug!("Discarding {} queued access units on shutdown", pending);
            self.counters.add_dropped(pending as u64);
        }
        if thread.join().is_err() {
            error!("Decoder thread panicked");
        }
        self.slot.clear();
    }
}

impl Drop for UnifiedVideoDecoder {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// State owned by the decode thread
struct DecodeWorker<D, F> {
    open: F,
    /// None once every candidate has faulted
    decoder: Option<D>,
    selection: SelectionInput,
    thresholds: Thresholds,
    slot: Arc<SharedFrame>,
    clock: SessionClock,
    stats_tx: broadcast::Sender<DecodeStats>,
    events_tx: tokio_mpsc::Sender<PipelineEvent>,
    active: Arc<Mutex<BackendKind>>,
    counters: Arc<DecoderCounters>,
    next_frame_id: u64,
    /// Units without output (errors and empty results)
    consecutive_failures: u32,
    /// Units that returned an error
    consecutive_errors: u32,
    /// Armed by the first unit, reset by every decoded frame
    watchdog_since: Option<Instant>,
    stall_reported: bool,
    /// Keyframe requested after queue eviction; cleared by a decoded keyframe
    awaiting_keyframe: bool,
    units_awaiting_keyframe: u32,
}

impl<D, F> DecodeWorker<D, F>
where
    D: FrameDecoder,
    F: FnMut(&BackendDescriptor, VideoCodec) -> Result<D>,
{
    fn run(&mut self, queue: &DecodeQueue) {
        loop {
            match queue.pop(self.stall_wait()) {
                Pop::Closed => break,
                Pop::Timeout => self.check_stall(),
                Pop::Unit(unit, evicted) => {
                    self.process(unit, evicted);
                    self.check_stall();
                }
            }
        }
    }

    /// How long to wait for input before the stall check is due
    fn stall_wait(&self) -> Option<Duration> {
        match self.watchdog_since {
            Some(at) if !self.stall_reported && self.decoder.is_some() => {
                Some(self.thresholds.stall_timeout.saturating_sub(at.elapsed()))
            }
            _ => None,
        }
    }

    fn check_stall(&mut self) {
        let Some(at) = self.watchdog_since else {
            return;
        };
        if self.decoder.is_none() {
            // Fatal error already reported
            return;
        }
        let silent_for = at.elapsed();
        if !self.stall_reported && silent_for >= self.thresholds.stall_timeout {
            warn!(
                "Decoder: no frame for {}ms - stream stalled",
                silent_for.as_millis()
            );
            self.stall_reported = true;
            self.emit(PipelineEvent::Stall { silent_for });
        }
    }

    fn emit(&self, event: PipelineEvent) {
        if let Err(e) = self.events_tx.try_send(event) {
            warn!("Pipeline event not delivered: {}", e);
        }
    }

    fn request_keyframe(&self) {
        self.counters.keyframe_requests.fetch_add(1, Ordering::Relaxed);
        self.emit(PipelineEvent::KeyframeRequest {
            consecutive_failures: self.consecutive_failures,
        });
    }

    /// Request a keyframe and keep asking on the retry schedule until one decodes
    fn await_keyframe(&mut self) {
        self.awaiting_keyframe = true;
        self.units_awaiting_keyframe = 0;
        self.request_keyframe();
    }

    fn process(&mut self, unit: QueuedUnit, evicted: u32) {
        profile_scope!("decode_unit");

        if self.decoder.is_none() {
            // Fatal error already reported
            self.counters.add_dropped(1);
            self.counters.record_unit(false, false);
            return;
        }
        if self.watchdog_since.is_none() {
            self.watchdog_since = Some(Instant::now());
        }

        if evicted > 0 {
            if self.awaiting_keyframe {
                debug!(
                    "Decoder: {} more access units evicted while awaiting keyframe",
                    evicted
                );
            } else {
                warn!(
                    "Decoder: {} access units evicted from queue - requesting keyframe",
                    evicted
                );
                self.await_keyframe();
            }
        }

        let started = Instant::now();
        let (backend, result) = match self.decoder.as_mut() {
            Some(decoder) => (decoder.kind(), decoder.decode(&unit.au)),
            None => return,
        };
        let decode_time_ms = started.elapsed().as_secs_f32() * 1000.0;

        let mut is_error = false;
        let mut summary = None;
        let mut fault = None;

        match result {
            Ok(Some(picture)) => {
                self.next_frame_id += 1;
                let timestamp_us = self.clock.elapsed_us(unit.au.received_at);
                let frame = picture.into_frame(self.next_frame_id, timestamp_us);
                summary = Some(FrameSummary {
                    frame_id: frame.frame_id,
                    width: frame.width,
                    height: frame.height,
                    color_space: frame.color_space,
                    is_hdr: frame.is_hdr(),
                });

                if self.consecutive_failures >= self.thresholds.keyframe_request {
                    info!(
                        "Decoder: recovered after {} units without output",
                        self.consecutive_failures
                    );
                }
                if frame.frame_id == 1 {
                    info!(
                        "{}: first frame {}x{} decoded in {:.1}ms",
                        backend, frame.width, frame.height, decode_time_ms
                    );
                }

                if self.awaiting_keyframe && unit.au.is_keyframe {
                    debug!(
                        "Decoder: keyframe decoded after {} units",
                        self.units_awaiting_keyframe
                    );
                    self.awaiting_keyframe = false;
                }

                self.consecutive_failures = 0;
                self.consecutive_errors = 0;
                self.watchdog_since = Some(Instant::now());
                self.stall_reported = false;
                self.slot.write(frame);
            }
            Ok(None) => {
                // Buffering; counts toward keyframe recovery but not backend health
                self.consecutive_failures += 1;
            }
            Err(e) => {
                is_error = true;
                self.consecutive_failures += 1;
                self.consecutive_errors += 1;

                if self.consecutive_errors == 1 || self.consecutive_errors % 30 == 0 {
                    debug!(
                        "{}: decode failed ({} consecutive): {}",
                        backend, self.consecutive_errors, e
                    );
                }

                if matches!(e, DecodeError::DeviceLost(_))
                    || self.consecutive_errors >= self.thresholds.backend_fault
                {
                    fault = Some(e.to_string());
                }
            }
        }

        let keyframe_requested = summary.is_none()
            && fault.is_none()
            && self.thresholds.should_request_keyframe(self.consecutive_failures);
        if keyframe_requested {
            warn!(
                "Decoder: {} consecutive units without output - requesting keyframe",
                self.consecutive_failures
            );
            self.request_keyframe();
            self.units_awaiting_keyframe = 0;
        } else if self.awaiting_keyframe && fault.is_none() {
            self.units_awaiting_keyframe += 1;
            if self.units_awaiting_keyframe % self.thresholds.keyframe_retry == 0 {
                debug!(
                    "Decoder: still awaiting keyframe after {} units - requesting again",
                    self.units_awaiting_keyframe
                );
                self.request_keyframe();
            }
        }

        let _ = self.stats_tx.send(DecodeStats {
            decode_time_ms,
            delivery_ms: unit.receive_time.elapsed().as_secs_f32() * 1000.0,
            frame_produced: summary.is_some(),
            needs_keyframe: is_error
                || self.consecutive_failures >= self.thresholds.keyframe_request,
            keyframe_requested,
            is_error,
            dropped: evicted,
            backend,
            frame: summary,
        });
        self.counters.record_unit(summary.is_some(), is_error);

        if let Some(reason) = fault {
            self.fault(backend, reason);
        }
    }

    /// Open the first candidate the selector yields, excluding those that fail
    fn open_next(&mut self) -> Option<BackendKind> {
        loop {
            let candidates = select_backends(&self.selection);
            let descriptor = *candidates.first()?;
            match (self.open)(&descriptor, self.selection.codec) {
                Ok(decoder) => {
                    info!(
                        "Opened {} decoder (hw accel: {})",
                        descriptor.name,
                        decoder.is_hw_accelerated()
                    );
                    *self.active.lock() = descriptor.kind;
                    self.decoder = Some(decoder);
                    return Some(descriptor.kind);
                }
                Err(e) => {
                    warn!("Failed to open {} decoder: {:#}", descriptor.name, e);
                    self.selection.exclude(descriptor.kind);
                }
            }
        }
    }

    fn fault(&mut self, failed: BackendKind, reason: String) {
        error!("{} decoder faulted: {}", failed, reason);
        self.decoder = None;
        self.selection.exclude(failed);
        self.consecutive_failures = 0;
        self.consecutive_errors = 0;

        match self.open_next() {
            Some(fallback) => {
                warn!("Falling back from {} to {}", failed, fallback);
                self.emit(PipelineEvent::BackendFault {
                    failed,
                    fallback,
                    reason,
                });
                // Fresh decoder has no references
                self.await_keyframe();
            }
            None => {
                error!("No decoder backend left for {:?}", self.selection.codec);
                self.emit(PipelineEvent::FatalStreamError {
                    reason: format!("{} faulted with no fallback: {}", failed, reason),
                });
            }
        }
    }
}
