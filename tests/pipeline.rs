//! End-to-end session scenarios driven through the public API with a
//! scripted backend.

use bytes::Bytes;
use std::thread;
use std::time::{Duration, Instant};

use opennow_pipeline::gui::{CpuSurface, RenderOutcome, Renderer};
use opennow_pipeline::media::{
    AccessUnit, BackendAvailability, BackendKind, DecodeError, DecodedPicture, FrameDecoder,
    GpuVendor, Platform, SelectionInput,
};
use opennow_pipeline::{
    DisplayConfig, PipelineConfig, PipelineEvent, StreamSession, TransportPacket, VideoCodec,
    VideoDecoderBackend, VideoFrame,
};

/// Trailing byte that makes the test backend reject a unit
const CORRUPT: u8 = 0xFF;

struct TestDecoder {
    kind: BackendKind,
}

impl FrameDecoder for TestDecoder {
    fn decode(&mut self, au: &AccessUnit) -> Result<Option<DecodedPicture>, DecodeError> {
        if au.data.last() == Some(&CORRUPT) {
            return Err(DecodeError::Malformed("corrupt slice".into()));
        }
        let frame = VideoFrame::solid(0, 16, 16, 235, 128, 128);
        Ok(Some(DecodedPicture {
            width: frame.width,
            height: frame.height,
            y_plane: frame.y_plane,
            u_plane: frame.u_plane,
            v_plane: frame.v_plane,
            y_stride: frame.y_stride,
            u_stride: frame.u_stride,
            v_stride: frame.v_stride,
            format: frame.format,
            color_range: frame.color_range,
            color_space: frame.color_space,
            transfer_function: frame.transfer_function,
            gpu_frame: None,
        }))
    }

    fn kind(&self) -> BackendKind {
        self.kind
    }
}

fn start(config: PipelineConfig) -> StreamSession {
    let selection = SelectionInput {
        platform: Platform::Linux,
        vendor: GpuVendor::Unknown,
        codec: VideoCodec::H264,
        preference: VideoDecoderBackend::Auto,
        availability: BackendAvailability::with([BackendKind::OpenH264]),
        excluded: Vec::new(),
    };
    StreamSession::start_with(config, selection, |descriptor, _codec| {
        Ok(TestDecoder {
            kind: descriptor.kind,
        })
    })
    .unwrap()
}

/// Single-NAL H.264 packet that completes an access unit
fn packet(sequence: u16, corrupt: bool) -> TransportPacket {
    let nal_type = if sequence == 0 { 0x65 } else { 0x41 };
    let last = if corrupt { CORRUPT } else { 0x00 };
    TransportPacket {
        payload: Bytes::from(vec![nal_type, 0x88, 0x84, last]),
        received_at: Instant::now(),
        marker: true,
        sequence,
    }
}

fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    false
}

#[test]
fn test_thirty_units_render_in_order() {
    let mut session = start(PipelineConfig::default());
    let slot = session.frame_slot();
    let mut renderer = Renderer::new(
        CpuSurface::new(),
        session.frame_reader(),
        DisplayConfig::default(),
        true,
    )
    .with_stats(session.render_stats());

    let mut rendered = Vec::new();
    for sequence in 0..30u16 {
        session.on_packet(&packet(sequence, false)).unwrap();
        let expected = u64::from(sequence) + 1;
        assert!(wait_for(|| slot.latest_id() >= expected));

        let outcome = renderer.render().unwrap();
        match outcome {
            RenderOutcome::Presented { frame_id, .. } => rendered.push(frame_id),
            ref other => panic!("frame {} not presented: {:?}", expected, other),
        }
        assert_eq!(renderer.render().unwrap(), RenderOutcome::Unchanged);
    }

    assert_eq!(rendered, (1..=30).collect::<Vec<u64>>());
    assert_eq!(renderer.surface().present_count(), 30);
    assert_eq!(renderer.surface().pixel(0, 0), Some([255, 255, 255, 255]));

    let mut stats = session.poll_stats();
    assert!(wait_for(|| {
        stats = session.poll_stats();
        stats.frames_decoded == 30
    }));
    assert_eq!(stats.frames_rendered, 30);
    assert_eq!(stats.resolution, "16x16");
    assert_eq!(stats.decoder_backend, "OpenH264");

    while let Some(event) = session.try_next_event() {
        assert!(
            !matches!(event, PipelineEvent::Stall { .. }),
            "unexpected stall"
        );
    }
    session.shutdown();
    assert!(slot.peek().is_none());
}

#[tokio::test]
async fn test_malformed_units_request_keyframe() {
    let mut session = start(PipelineConfig::default());
    let slot = session.frame_slot();

    for sequence in 0..10u16 {
        session.on_packet(&packet(sequence, false)).unwrap();
        assert!(wait_for(|| slot.latest_id() == u64::from(sequence) + 1));
    }

    for sequence in 10..13u16 {
        session.on_packet(&packet(sequence, true)).unwrap();
    }

    let event = tokio::time::timeout(Duration::from_secs(5), session.next_event())
        .await
        .unwrap();
    assert_eq!(
        event,
        Some(PipelineEvent::KeyframeRequest {
            consecutive_failures: 3
        })
    );

    let mut stats = session.poll_stats();
    assert!(wait_for(|| {
        stats = session.poll_stats();
        stats.frames_received == 13 && stats.keyframe_requests == 1
    }));
    assert!(stats.needs_keyframe);
    assert_eq!(stats.keyframe_requests, 1);
    assert_eq!(stats.frames_decoded, 10);

    // Stream keeps going once a good unit arrives
    session.on_packet(&packet(13, false)).unwrap();
    assert!(wait_for(|| slot.latest_id() == 11));
    assert!(wait_for(|| !session.poll_stats().needs_keyframe));
    session.shutdown();
}

#[tokio::test]
async fn test_silence_raises_one_stall() {
    let config = PipelineConfig {
        stall_timeout_ms: 100,
        ..PipelineConfig::default()
    };
    let mut session = start(config);
    let slot = session.frame_slot();

    session.on_packet(&packet(0, false)).unwrap();
    assert!(wait_for(|| slot.latest_id() == 1));

    let event = tokio::time::timeout(Duration::from_secs(5), session.next_event())
        .await
        .unwrap();
    match event {
        Some(PipelineEvent::Stall { silent_for }) => {
            assert!(silent_for >= Duration::from_millis(100))
        }
        other => panic!("expected a stall, got {:?}", other),
    }

    // Stall is reported once until the next frame
    let again = tokio::time::timeout(Duration::from_millis(400), session.next_event()).await;
    assert!(again.is_err());
    session.shutdown();
}

#[tokio::test]
async fn test_stall_without_any_decoded_frame() {
    let config = PipelineConfig {
        stall_timeout_ms: 100,
        ..PipelineConfig::default()
    };
    let mut session = start(config);

    session.on_packet(&packet(0, true)).unwrap();
    session.on_packet(&packet(1, true)).unwrap();

    let event = tokio::time::timeout(Duration::from_secs(5), session.next_event())
        .await
        .unwrap();
    match event {
        Some(PipelineEvent::Stall { silent_for }) => {
            assert!(silent_for >= Duration::from_millis(100))
        }
        other => panic!("expected a stall, got {:?}", other),
    }

    let again = tokio::time::timeout(Duration::from_millis(400), session.next_event()).await;
    assert!(again.is_err());
    assert_eq!(session.frame_slot().latest_id(), 0);
    session.shutdown();
}

#[test]
fn test_render_thread_reports_without_session() {
    let config = PipelineConfig {
        stats_window_ms: 50,
        ..PipelineConfig::default()
    };
    let mut session = start(config);
    let slot = session.frame_slot();
    let reader = session.frame_reader();
    let render_stats = session.render_stats();

    let render_thread = thread::spawn(move || {
        let mut renderer =
            Renderer::new(CpuSurface::new(), reader, DisplayConfig::default(), true)
                .with_stats(render_stats);
        let mut skipped_total = 0;
        let deadline = Instant::now() + Duration::from_secs(5);
        while renderer.last_rendered_id() < 20 && Instant::now() < deadline {
            if let RenderOutcome::Presented { skipped, .. } = renderer.render().unwrap() {
                skipped_total += skipped;
            }
            thread::sleep(Duration::from_millis(1));
        }
        (renderer.frames_rendered(), skipped_total, renderer.last_rendered_id())
    });

    for sequence in 0..20u16 {
        session.on_packet(&packet(sequence, false)).unwrap();
        let expected = u64::from(sequence) + 1;
        assert!(wait_for(|| slot.latest_id() >= expected));
    }

    let (presented, skipped, last_id) = render_thread.join().unwrap();
    assert_eq!(last_id, 20);
    assert!(presented > 0);

    thread::sleep(Duration::from_millis(100));
    let stats = session.poll_stats();
    assert_eq!(stats.frames_rendered, presented);
    assert_eq!(stats.frames_dropped, skipped);
    assert_eq!(stats.frames_decoded, 20);
    assert!(stats.render_fps > 0.0);
    session.shutdown();
}
