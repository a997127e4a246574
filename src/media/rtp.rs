//! RTP Depacketizer
//!
//! Reassembles codec-native access units from RTP payloads:
//! - H.264 (RFC 6184): single NAL, STAP-A, FU-A
//! - H.265 (RFC 7798): single NAL, AP, FU
//! - AV1 (AV1 RTP payload format): aggregated / fragmented OBU elements
//!
//! Units accumulate until the marker bit closes the access unit.
//! Packets are expected in order; reordering belongs to the transport.

use bytes::Bytes;
use log::{debug, warn};
use std::time::Instant;

use super::obu::{self, AggregationHeader};
use crate::app::VideoCodec;

const START_CODE: [u8; 4] = [0, 0, 0, 1];

/// Transport packet as delivered by the WebRTC layer
#[derive(Debug, Clone)]
pub struct TransportPacket {
    pub payload: Bytes,
    /// Monotonic receive time
    pub received_at: Instant,
    /// End-of-access-unit flag
    pub marker: bool,
    pub sequence: u16,
}

/// One complete encoded frame
#[derive(Debug, Clone)]
pub struct AccessUnit {
    pub codec: DepacketizerCodec,
    /// Annex B NAL sequence (H.264/H.265) or sized OBU sequence (AV1)
    pub data: Bytes,
    /// Receive time of the last packet of this unit
    pub received_at: Instant,
    pub first_sequence: Option<u16>,
    pub last_sequence: Option<u16>,
    /// Contains an IDR / IRAP picture or an AV1 sequence header
    pub is_keyframe: bool,
    /// Sequence numbers were not contiguous while this unit was assembled
    pub has_gaps: bool,
    /// Number of NAL units / OBUs joined into `data`
    pub unit_count: usize,
}

/// Codec type for depacketizer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepacketizerCodec {
    H264,
    H265,
    AV1,
}

impl From<VideoCodec> for DepacketizerCodec {
    fn from(codec: VideoCodec) -> Self {
        match codec {
            VideoCodec::H264 => DepacketizerCodec::H264,
            VideoCodec::H265 => DepacketizerCodec::H265,
            VideoCodec::AV1 => DepacketizerCodec::AV1,
        }
    }
}

/// RTP depacketizer supporting H.264, H.265/HEVC and AV1
pub struct RtpDepacketizer {
    codec: DepacketizerCodec,
    /// Fragment reassembly buffer (FU-A / FU / continued OBU)
    buffer: Vec<u8>,
    in_fragment: bool,
    /// Units of the access unit being assembled, in arrival order
    units: Vec<Vec<u8>>,
    /// Cached VPS NAL unit (H.265 only)
    vps: Option<Vec<u8>>,
    /// Cached SPS NAL unit
    sps: Option<Vec<u8>>,
    /// Cached PPS NAL unit
    pps: Option<Vec<u8>>,
    /// AV1 N bit seen in the current access unit
    new_sequence: bool,
    first_sequence: Option<u16>,
    last_sequence: Option<u16>,
    /// Last sequence number seen, kept across access units for gap detection
    prev_sequence: Option<u16>,
    has_gaps: bool,
    last_received: Option<Instant>,
    discarded_fragments: u64,
    packets_lost: u64,
}

impl RtpDepacketizer {
    pub fn new() -> Self {
        Self::with_codec(DepacketizerCodec::H264)
    }

    pub fn with_codec(codec: DepacketizerCodec) -> Self {
        Self {
            codec,
            buffer: Vec::with_capacity(64 * 1024),
            in_fragment: false,
            units: Vec::new(),
            vps: None,
            sps: None,
            pps: None,
            new_sequence: false,
            first_sequence: None,
            last_sequence: None,
            prev_sequence: None,
            has_gaps: false,
            last_received: None,
            discarded_fragments: 0,
            packets_lost: 0,
        }
    }

    pub fn codec(&self) -> DepacketizerCodec {
        self.codec
    }

    /// Fragments dropped because their start or continuation was lost
    pub fn discarded_fragments(&self) -> u64 {
        self.discarded_fragments
    }

    /// Packets missing according to sequence numbers
    pub fn packets_lost(&self) -> u64 {
        self.packets_lost
    }

    /// Drop any partially assembled access unit. Cached parameter sets survive.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.in_fragment = false;
        self.units.clear();
        self.new_sequence = false;
        self.first_sequence = None;
        self.last_sequence = None;
        self.has_gaps = false;
    }

    /// Feed one transport packet. Returns the finished access unit when the
    /// packet carries the marker bit and anything was accumulated.
    pub fn push(&mut self, packet: &TransportPacket) -> Option<AccessUnit> {
        self.track_sequence(packet.sequence);
        self.last_received = Some(packet.received_at);

        for unit in self.process(&packet.payload) {
            self.accumulate(unit);
        }

        if packet.marker {
            self.take_frame()
        } else {
            None
        }
    }

    fn track_sequence(&mut self, sequence: u16) {
        if let Some(prev) = self.prev_sequence {
            let expected = prev.wrapping_add(1);
            if sequence != expected {
                let missing = sequence.wrapping_sub(expected);
                // Large distances are duplicates or reordering, not loss
                if missing < 0x8000 {
                    self.packets_lost += u64::from(missing);
                }
                self.has_gaps = true;
                if self.in_fragment {
                    debug!(
                        "Sequence gap {} -> {} inside fragment, discarding partial unit",
                        prev, sequence
                    );
                    self.buffer.clear();
                    self.in_fragment = false;
                    self.discarded_fragments += 1;
                }
            }
        }
        self.prev_sequence = Some(sequence);
        if self.first_sequence.is_none() {
            self.first_sequence = Some(sequence);
        }
        self.last_sequence = Some(sequence);
    }

    /// Process an RTP payload and return complete NAL units / OBUs
    pub fn process(&mut self, payload: &[u8]) -> Vec<Vec<u8>> {
        match self.codec {
            DepacketizerCodec::H264 => self.process_h264(payload),
            DepacketizerCodec::H265 => self.process_h265(payload),
            DepacketizerCodec::AV1 => self.process_av1(payload),
        }
    }

    /// Append a complete unit to the access unit being assembled
    pub fn accumulate(&mut self, unit: Vec<u8>) {
        if unit.is_empty() {
            return;
        }
        self.cache_parameter_set(&unit);
        self.units.push(unit);
    }

    /// Close the current access unit (marker bit seen).
    /// An empty accumulator yields `None`.
    pub fn take_frame(&mut self) -> Option<AccessUnit> {
        if self.in_fragment {
            match self.codec {
                DepacketizerCodec::AV1 => {
                    // OBU headers don't self-delimit across packets - flush what we have
                    let pending = std::mem::take(&mut self.buffer);
                    self.in_fragment = false;
                    self.accumulate(pending);
                }
                DepacketizerCodec::H264 | DepacketizerCodec::H265 => {
                    debug!("Marker inside unfinished fragment, discarding partial NAL");
                    self.buffer.clear();
                    self.in_fragment = false;
                    self.discarded_fragments += 1;
                }
            }
        }

        if self.units.is_empty() {
            self.reset();
            return None;
        }

        let (data, is_keyframe) = match self.codec {
            DepacketizerCodec::H264 | DepacketizerCodec::H265 => self.build_annex_b(),
            DepacketizerCodec::AV1 => self.build_obu_sequence(),
        };

        let access_unit = AccessUnit {
            codec: self.codec,
            data: Bytes::from(data),
            received_at: self.last_received.unwrap_or_else(Instant::now),
            first_sequence: self.first_sequence,
            last_sequence: self.last_sequence,
            is_keyframe,
            has_gaps: self.has_gaps,
            unit_count: self.units.len(),
        };

        self.reset();
        Some(access_unit)
    }

    fn nal_type(&self, unit: &[u8]) -> u8 {
        match self.codec {
            DepacketizerCodec::H264 => unit.first().map(|b| b & 0x1F).unwrap_or(0),
            DepacketizerCodec::H265 => unit.first().map(|b| (b >> 1) & 0x3F).unwrap_or(0),
            DepacketizerCodec::AV1 => unit.first().map(|b| obu::obu_type(*b)).unwrap_or(0),
        }
    }

    fn cache_parameter_set(&mut self, unit: &[u8]) {
        let nal_type = self.nal_type(unit);
        match (self.codec, nal_type) {
            (DepacketizerCodec::H264, 7) | (DepacketizerCodec::H265, 33) => {
                debug!("Caching SPS ({} bytes)", unit.len());
                self.sps = Some(unit.to_vec());
            }
            (DepacketizerCodec::H264, 8) | (DepacketizerCodec::H265, 34) => {
                debug!("Caching PPS ({} bytes)", unit.len());
                self.pps = Some(unit.to_vec());
            }
            (DepacketizerCodec::H265, 32) => {
                debug!("Caching VPS ({} bytes)", unit.len());
                self.vps = Some(unit.to_vec());
            }
            _ => {}
        }
    }

    /// Join NAL units with start codes. IDR/IRAP units that arrived without
    /// parameter sets get the cached ones prepended.
    fn build_annex_b(&self) -> (Vec<u8>, bool) {
        let types: Vec<u8> = self.units.iter().map(|u| self.nal_type(u)).collect();

        let (is_keyframe, needs_params) = match self.codec {
            DepacketizerCodec::H264 => {
                let idr = types.contains(&5);
                let has_params = types.contains(&7) && types.contains(&8);
                (idr || types.contains(&7), idr && !has_params)
            }
            _ => {
                let irap = types.iter().any(|t| (16..=21).contains(t));
                let has_params =
                    types.contains(&32) && types.contains(&33) && types.contains(&34);
                (irap || types.contains(&32), irap && !has_params)
            }
        };

        let total: usize = self.units.iter().map(|u| u.len() + START_CODE.len()).sum();
        let mut data = Vec::with_capacity(total + 256);

        if needs_params {
            let cached = [&self.vps, &self.sps, &self.pps];
            let mut prepended = 0;
            for param in cached.into_iter().flatten() {
                data.extend_from_slice(&START_CODE);
                data.extend_from_slice(param);
                prepended += 1;
            }
            if prepended > 0 {
                debug!("Prepended {} cached parameter sets to keyframe", prepended);
            }
        }

        for unit in &self.units {
            data.extend_from_slice(&START_CODE);
            data.extend_from_slice(unit);
        }

        (data, is_keyframe)
    }

    /// Temporal delimiter followed by every OBU with its size field set
    fn build_obu_sequence(&self) -> (Vec<u8>, bool) {
        let total: usize = self.units.iter().map(|u| u.len() + 8).sum();
        let mut data = Vec::with_capacity(total + obu::TEMPORAL_DELIMITER.len());
        data.extend_from_slice(&obu::TEMPORAL_DELIMITER);

        let mut is_keyframe = self.new_sequence;
        for unit in &self.units {
            if self.nal_type(unit) == obu::OBU_SEQUENCE_HEADER {
                is_keyframe = true;
            }
            if !obu::write_sized_obu(unit, &mut data) {
                debug!("AV1: malformed OBU ({} bytes) passed through", unit.len());
            }
        }

        (data, is_keyframe)
    }

    /// Process H.264 RTP payload
    fn process_h264(&mut self, payload: &[u8]) -> Vec<Vec<u8>> {
        let mut result = Vec::new();

        if payload.is_empty() {
            return result;
        }

        let nal_type = payload[0] & 0x1F;

        match nal_type {
            // Single NAL unit (1-23)
            1..=23 => {
                result.push(payload.to_vec());
            }

            // STAP-A (24) - Single-time aggregation packet
            24 => {
                Self::split_aggregate(payload, 1, &mut result);
            }

            // FU-A (28) - Fragmentation unit
            28 => {
                if payload.len() < 2 {
                    return result;
                }

                let fu_header = payload[1];
                let start = (fu_header & 0x80) != 0;
                let end = (fu_header & 0x40) != 0;
                let inner_nal_type = fu_header & 0x1F;

                if start {
                    if self.in_fragment {
                        self.discarded_fragments += 1;
                    }
                    self.buffer.clear();
                    self.in_fragment = true;
                    let nal_header = (payload[0] & 0xE0) | inner_nal_type;
                    self.buffer.push(nal_header);
                    self.buffer.extend_from_slice(&payload[2..]);
                } else if self.in_fragment {
                    self.buffer.extend_from_slice(&payload[2..]);
                } else {
                    // Start fragment was lost
                    self.discarded_fragments += 1;
                    return result;
                }

                if end && self.in_fragment {
                    self.in_fragment = false;
                    result.push(std::mem::take(&mut self.buffer));
                }
            }

            _ => {
                debug!("H264: Unsupported NAL type: {}", nal_type);
            }
        }

        result
    }

    /// Process H.265/HEVC RTP payload (RFC 7798)
    fn process_h265(&mut self, payload: &[u8]) -> Vec<Vec<u8>> {
        let mut result = Vec::new();

        if payload.len() < 2 {
            return result;
        }

        // H.265 NAL unit header is 2 bytes
        // Type is in bits 1-6 of first byte: (byte0 >> 1) & 0x3F
        let nal_type = (payload[0] >> 1) & 0x3F;

        match nal_type {
            // Single NAL unit
            0..=47 => {
                result.push(payload.to_vec());
            }

            // AP (48) - Aggregation Packet
            48 => {
                Self::split_aggregate(payload, 2, &mut result);
            }

            // FU (49) - Fragmentation Unit
            49 => {
                if payload.len() < 3 {
                    return result;
                }

                // FU header is at byte 2
                let fu_header = payload[2];
                let start = (fu_header & 0x80) != 0;
                let end = (fu_header & 0x40) != 0;
                let inner_nal_type = fu_header & 0x3F;

                if start {
                    if self.in_fragment {
                        self.discarded_fragments += 1;
                    }
                    self.buffer.clear();
                    self.in_fragment = true;

                    // Rebuild the NAL header: keep F bit and layer-id MSB, swap in the real type.
                    // Second byte (layer-id low bits + temporal id) is copied as-is.
                    self.buffer.push((payload[0] & 0x81) | (inner_nal_type << 1));
                    self.buffer.push(payload[1]);
                    self.buffer.extend_from_slice(&payload[3..]);
                } else if self.in_fragment {
                    self.buffer.extend_from_slice(&payload[3..]);
                } else {
                    self.discarded_fragments += 1;
                    return result;
                }

                if end && self.in_fragment {
                    self.in_fragment = false;
                    result.push(std::mem::take(&mut self.buffer));
                }
            }

            _ => {
                debug!("H265: Unsupported NAL type: {}", nal_type);
            }
        }

        result
    }

    /// STAP-A / AP body: repeated (u16 size, NAL) pairs after `header_len` bytes
    fn split_aggregate(payload: &[u8], header_len: usize, result: &mut Vec<Vec<u8>>) {
        let mut offset = header_len;

        while offset + 2 <= payload.len() {
            let size = u16::from_be_bytes([payload[offset], payload[offset + 1]]) as usize;
            offset += 2;

            if size == 0 || offset + size > payload.len() {
                warn!(
                    "Aggregation packet: invalid size {} at offset {}",
                    size, offset
                );
                break;
            }

            result.push(payload[offset..offset + size].to_vec());
            offset += size;
        }
    }

    /// Process AV1 RTP payload
    fn process_av1(&mut self, payload: &[u8]) -> Vec<Vec<u8>> {
        let mut result = Vec::new();

        let Some((&first, body)) = payload.split_first() else {
            return result;
        };
        let header = AggregationHeader::parse(first);
        if header.n {
            debug!("AV1: new coded video sequence");
            self.new_sequence = true;
        }

        // Split into OBU elements
        let mut elements: Vec<&[u8]> = Vec::new();
        let mut offset = 0;
        while offset < body.len() {
            let is_last_counted = header.w != 0 && elements.len() + 1 == header.w as usize;
            let len = if is_last_counted {
                body.len() - offset
            } else {
                match obu::read_leb128(&body[offset..]) {
                    Some((len, consumed)) => {
                        offset += consumed;
                        len
                    }
                    None => {
                        warn!("AV1: truncated OBU element length");
                        break;
                    }
                }
            };

            if offset + len > body.len() {
                warn!(
                    "AV1: OBU element length {} exceeds payload at offset {}",
                    len, offset
                );
                break;
            }

            elements.push(&body[offset..offset + len]);
            offset += len;

            if is_last_counted {
                break;
            }
        }

        let count = elements.len();
        for (i, element) in elements.into_iter().enumerate() {
            let continues_previous = i == 0 && header.z;
            let continues_next = i + 1 == count && header.y;

            if continues_previous {
                if !self.in_fragment {
                    // Head of this OBU was lost
                    self.discarded_fragments += 1;
                    continue;
                }
                self.buffer.extend_from_slice(element);
            } else {
                if self.in_fragment {
                    debug!("AV1: fragment not continued, discarding pending OBU");
                    self.discarded_fragments += 1;
                }
                self.buffer.clear();
                self.buffer.extend_from_slice(element);
                self.in_fragment = true;
            }

            if !continues_next {
                self.in_fragment = false;
                let unit = std::mem::take(&mut self.buffer);
                match unit.first().map(|b| obu::obu_type(*b)) {
                    Some(obu::OBU_TEMPORAL_DELIMITER) | Some(obu::OBU_TILE_LIST) | None => {}
                    Some(_) => result.push(unit),
                }
            }
        }

        result
    }
}

impl Default for RtpDepacketizer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(payload: &[u8], marker: bool, sequence: u16) -> TransportPacket {
        TransportPacket {
            payload: Bytes::copy_from_slice(payload),
            received_at: Instant::now(),
            marker,
            sequence,
        }
    }

    #[test]
    fn test_h264_single_nals_joined_in_order() {
        let mut depacketizer = RtpDepacketizer::with_codec(DepacketizerCodec::H264);
        assert!(depacketizer.push(&packet(&[0x41, 0xAA], false, 1)).is_none());
        let au = depacketizer
            .push(&packet(&[0x41, 0xBB], true, 2))
            .expect("marker closes the access unit");

        assert_eq!(
            au.data.as_ref(),
            &[0, 0, 0, 1, 0x41, 0xAA, 0, 0, 0, 1, 0x41, 0xBB]
        );
        assert_eq!(au.unit_count, 2);
        assert_eq!(au.first_sequence, Some(1));
        assert_eq!(au.last_sequence, Some(2));
        assert!(!au.is_keyframe);
        assert!(!au.has_gaps);
    }

    #[test]
    fn test_h264_fu_a_reassembly() {
        let mut depacketizer = RtpDepacketizer::with_codec(DepacketizerCodec::H264);
        // FU indicator NRI=3 type 28, FU header S + type 5 (IDR)
        depacketizer.push(&packet(&[0x7C, 0x85, 1, 2], false, 10));
        depacketizer.push(&packet(&[0x7C, 0x05, 3, 4], false, 11));
        let au = depacketizer
            .push(&packet(&[0x7C, 0x45, 5], true, 12))
            .unwrap();

        assert_eq!(au.data.as_ref(), &[0, 0, 0, 1, 0x65, 1, 2, 3, 4, 5]);
        assert!(au.is_keyframe);
    }

    #[test]
    fn test_h264_stap_a_and_parameter_set_prepend() {
        let mut depacketizer = RtpDepacketizer::with_codec(DepacketizerCodec::H264);
        // STAP-A with SPS (2 bytes) and PPS (2 bytes)
        let stap = [0x18, 0x00, 0x02, 0x67, 0x01, 0x00, 0x02, 0x68, 0x02];
        depacketizer.push(&packet(&stap, false, 1));
        depacketizer.push(&packet(&[0x65, 0x10], true, 2)).unwrap();

        // Next IDR arrives without parameter sets
        let au = depacketizer.push(&packet(&[0x65, 0x20], true, 3)).unwrap();
        assert_eq!(
            au.data.as_ref(),
            &[0, 0, 0, 1, 0x67, 0x01, 0, 0, 0, 1, 0x68, 0x02, 0, 0, 0, 1, 0x65, 0x20]
        );
    }

    #[test]
    fn test_fu_continuation_without_start_is_discarded() {
        let mut depacketizer = RtpDepacketizer::with_codec(DepacketizerCodec::H264);
        assert!(depacketizer.push(&packet(&[0x7C, 0x45, 9], true, 1)).is_none());
        assert_eq!(depacketizer.discarded_fragments(), 1);
    }

    #[test]
    fn test_sequence_gap_flags_access_unit() {
        let mut depacketizer = RtpDepacketizer::with_codec(DepacketizerCodec::H264);
        depacketizer.push(&packet(&[0x41, 1], true, 100)).unwrap();
        let au = depacketizer.push(&packet(&[0x41, 2], true, 103)).unwrap();
        assert!(au.has_gaps);
        assert_eq!(depacketizer.packets_lost(), 2);

        // Wrap-around is contiguous
        let mut depacketizer = RtpDepacketizer::with_codec(DepacketizerCodec::H264);
        depacketizer.push(&packet(&[0x41, 1], true, u16::MAX)).unwrap();
        let au = depacketizer.push(&packet(&[0x41, 2], true, 0)).unwrap();
        assert!(!au.has_gaps);
    }

    #[test]
    fn test_h265_fu_header_reconstruction() {
        let mut depacketizer = RtpDepacketizer::with_codec(DepacketizerCodec::H265);
        // PayloadHdr type 49, layer 0, tid 1; FU header S + type 19 (IDR_W_RADL)
        depacketizer.push(&packet(&[49 << 1, 0x01, 0x80 | 19, 0xAA], false, 1));
        let au = depacketizer
            .push(&packet(&[49 << 1, 0x01, 0x40 | 19, 0xBB], true, 2))
            .unwrap();

        assert_eq!(au.data.as_ref(), &[0, 0, 0, 1, 19 << 1, 0x01, 0xAA, 0xBB]);
        assert!(au.is_keyframe);
    }

    #[test]
    fn test_h265_aggregation_packet() {
        let mut depacketizer = RtpDepacketizer::with_codec(DepacketizerCodec::H265);
        let ap = [48 << 1, 0x01, 0x00, 0x02, 1 << 1, 0x01, 0x00, 0x02, 1 << 1, 0x02];
        let au = depacketizer.push(&packet(&ap, true, 1)).unwrap();
        assert_eq!(au.unit_count, 2);
    }

    #[test]
    fn test_av1_fragmented_obu() {
        let mut depacketizer = RtpDepacketizer::with_codec(DepacketizerCodec::AV1);
        // W=1, Y=1: one element continuing in next packet (frame OBU, type 6)
        depacketizer.push(&packet(&[0b0101_0000, 6 << 3, 0xA1, 0xA2], false, 1));
        // Z=1, W=1: continuation, ends here
        let au = depacketizer
            .push(&packet(&[0b1001_0000, 0xA3], true, 2))
            .unwrap();

        assert_eq!(
            au.data.as_ref(),
            &[0x12, 0x00, (6 << 3) | 0x02, 3, 0xA1, 0xA2, 0xA3]
        );
        assert_eq!(au.unit_count, 1);
    }

    #[test]
    fn test_av1_length_prefixed_elements_and_keyframe() {
        let mut depacketizer = RtpDepacketizer::with_codec(DepacketizerCodec::AV1);
        // N=1, W=0: sequence header (2 bytes) + temporal delimiter (dropped) + frame (2 bytes)
        let payload = [
            0b0000_1000,
            2,
            1 << 3,
            0x0A,
            1,
            2 << 3,
            2,
            6 << 3,
            0x0B,
        ];
        let au = depacketizer.push(&packet(&payload, true, 1)).unwrap();
        assert!(au.is_keyframe);
        assert_eq!(au.unit_count, 2);
        assert_eq!(
            au.data.as_ref(),
            &[0x12, 0x00, (1 << 3) | 0x02, 1, 0x0A, (6 << 3) | 0x02, 1, 0x0B]
        );
    }

    #[test]
    fn test_av1_pending_obu_flushed_on_marker() {
        let mut depacketizer = RtpDepacketizer::with_codec(DepacketizerCodec::AV1);
        // Y=1 but marker set: pending partial OBU is flushed
        let au = depacketizer
            .push(&packet(&[0b0101_0000, 6 << 3, 0xA1], true, 1))
            .unwrap();
        assert_eq!(au.unit_count, 1);
    }

    #[test]
    fn test_marker_after_flush_yields_nothing() {
        for codec in [
            DepacketizerCodec::H264,
            DepacketizerCodec::H265,
            DepacketizerCodec::AV1,
        ] {
            let mut depacketizer = RtpDepacketizer::with_codec(codec);
            assert!(depacketizer.take_frame().is_none());
            assert!(depacketizer.push(&packet(&[], true, 1)).is_none());
            assert!(depacketizer.take_frame().is_none());
        }
    }
}
