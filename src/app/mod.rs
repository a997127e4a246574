//! Stream Session
//!
//! Wires one session's pipeline together: depacketizer on the ingest side,
//! the unified decoder thread, the shared frame slot and the stats
//! aggregator. Session control drains `PipelineEvent`s; render threads
//! read the slot and report through a `RenderStatsSender`.

pub mod config;
pub mod types;

pub use config::{DisplayConfig, PipelineConfig, VideoCodec, VideoDecoderBackend};
pub use types::{FrameReader, SessionClock, SharedFrame};

use anyhow::Result;
use log::{debug, info, warn};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TryRecvError};

use crate::error::PipelineError;
use crate::media::{
    BackendDescriptor, BackendKind, FrameDecoder, PipelineEvent, RenderStatsSender,
    RtpDepacketizer, SelectionInput, StatsAggregator, StatsHandle, StreamStats, TransportPacket,
    UnifiedVideoDecoder,
};

/// Warn about sequence gaps at most once per this many incomplete units
const GAP_WARN_INTERVAL: u64 = 100;

/// One streaming session's media pipeline
pub struct StreamSession {
    config: PipelineConfig,
    clock: SessionClock,
    depacketizer: RtpDepacketizer,
    decoder: UnifiedVideoDecoder,
    slot: Arc<SharedFrame>,
    stats: StatsAggregator,
    events: mpsc::Receiver<PipelineEvent>,
    units_with_gaps: u64,
}

impl StreamSession {
    /// Start a session on this machine's backends
    pub fn start(config: PipelineConfig) -> Result<Self, PipelineError> {
        config.validate()?;
        let selection = SelectionInput::probe(config.codec, config.decoder_backend);
        let clock = SessionClock::new();
        let slot = Arc::new(SharedFrame::new());
        let (decoder, channels) =
            UnifiedVideoDecoder::new_async(&config, selection, Arc::clone(&slot), clock)?;
        Ok(Self::assemble(config, clock, slot, decoder, channels))
    }

    /// Start a session whose backends are built by `open`
    pub fn start_with<D, F>(
        config: PipelineConfig,
        selection: SelectionInput,
        open: F,
    ) -> Result<Self, PipelineError>
    where
        D: FrameDecoder + 'static,
        F: FnMut(&BackendDescriptor, VideoCodec) -> Result<D> + Send + 'static,
    {
        config.validate()?;
        let clock = SessionClock::new();
        let slot = Arc::new(SharedFrame::new());
        let (decoder, channels) =
            UnifiedVideoDecoder::spawn_with(&config, selection, Arc::clone(&slot), clock, open)?;
        Ok(Self::assemble(config, clock, slot, decoder, channels))
    }

    fn assemble(
        config: PipelineConfig,
        clock: SessionClock,
        slot: Arc<SharedFrame>,
        decoder: UnifiedVideoDecoder,
        channels: crate::media::DecoderChannels,
    ) -> Self {
        info!(
            "Stream session started: {} via {}",
            config.codec.display_name(),
            decoder.active_backend()
        );
        let stats = StatsAggregator::new(
            channels.stats,
            channels.counters,
            config.codec,
            config.stats_window(),
        );
        Self {
            depacketizer: RtpDepacketizer::with_codec(config.codec.into()),
            config,
            clock,
            decoder,
            slot,
            stats,
            events: channels.events,
            units_with_gaps: 0,
        }
    }

    /// Ingest one transport packet; completed access units go to the decoder
    pub fn on_packet(&mut self, packet: &TransportPacket) -> Result<(), PipelineError> {
        let Some(au) = self.depacketizer.push(packet) else {
            return Ok(());
        };

        if au.has_gaps {
            self.units_with_gaps += 1;
            if self.units_with_gaps % GAP_WARN_INTERVAL == 1 {
                warn!(
                    "Access unit assembled across a sequence gap ({} so far, {} packets lost)",
                    self.units_with_gaps,
                    self.depacketizer.packets_lost()
                );
            }
        }

        let receive_time = au.received_at;
        self.decoder.decode_async(au, receive_time)
    }

    /// Slot render threads read from
    pub fn frame_slot(&self) -> Arc<SharedFrame> {
        Arc::clone(&self.slot)
    }

    /// Independent reader with its own cursor
    pub fn frame_reader(&self) -> FrameReader {
        self.slot.reader()
    }

    pub fn clock(&self) -> SessionClock {
        self.clock
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn active_backend(&self) -> BackendKind {
        self.decoder.active_backend()
    }

    pub fn is_hw_accelerated(&self) -> bool {
        self.decoder.is_hw_accelerated()
    }

    pub fn packets_lost(&self) -> u64 {
        self.depacketizer.packets_lost()
    }

    /// Next pending event, if any
    pub fn try_next_event(&mut self) -> Option<PipelineEvent> {
        match self.events.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => {
                debug!("Pipeline event channel closed");
                None
            }
        }
    }

    /// Wait for the next event; `None` once the decoder has stopped
    pub async fn next_event(&mut self) -> Option<PipelineEvent> {
        self.events.recv().await
    }

    /// Render timing sink for a render thread; see `Renderer::with_stats`
    pub fn render_stats(&self) -> RenderStatsSender {
        self.stats.render_stats()
    }

    /// Fold pending decode stats and return the latest snapshot
    pub fn poll_stats(&mut self) -> Arc<StreamStats> {
        self.stats.poll();
        self.stats.handle().load()
    }

    /// Snapshot reader for UI threads
    pub fn stats_handle(&self) -> StatsHandle {
        self.stats.handle()
    }

    /// Stop the decoder and clear the slot
    pub fn shutdown(&mut self) {
        self.decoder.shutdown();
        self.depacketizer.reset();
        self.stats.poll();
        info!(
            "Stream session stopped: {} frames decoded, {} units dropped",
            self.decoder.frames_decoded(),
            self.decoder.units_dropped()
        );
    }
}
