//! AV1 OBU helpers for the RTP depacketizer
//!
//! RTP carries OBUs without `obu_has_size_field`; decoders expect the
//! low-overhead bitstream format where every OBU is size-prefixed.

pub(crate) const OBU_SEQUENCE_HEADER: u8 = 1;
pub(crate) const OBU_TEMPORAL_DELIMITER: u8 = 2;
pub(crate) const OBU_TILE_LIST: u8 = 8;

/// Temporal delimiter OBU with `obu_has_size_field = 1` and zero payload
pub(crate) const TEMPORAL_DELIMITER: [u8; 2] = [0x12, 0x00];

/// First byte of every AV1 RTP payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct AggregationHeader {
    /// First OBU element continues the last OBU of the previous packet
    pub z: bool,
    /// Last OBU element continues in the next packet
    pub y: bool,
    /// Number of OBU elements; 0 means every element is length-prefixed
    pub w: u8,
    /// First packet of a new coded video sequence
    pub n: bool,
}

impl AggregationHeader {
    pub fn parse(byte: u8) -> Self {
        Self {
            z: byte & 0x80 != 0,
            y: byte & 0x40 != 0,
            w: (byte >> 4) & 0x03,
            n: byte & 0x08 != 0,
        }
    }
}

/// Decode an unsigned LEB128 value. Returns the value and the bytes consumed.
pub(crate) fn read_leb128(data: &[u8]) -> Option<(usize, usize)> {
    let mut value: u64 = 0;
    for (i, byte) in data.iter().take(8).enumerate() {
        value |= u64::from(byte & 0x7F) << (i * 7);
        if byte & 0x80 == 0 {
            return usize::try_from(value).ok().map(|v| (v, i + 1));
        }
    }
    None
}

pub(crate) fn write_leb128(mut value: usize, out: &mut Vec<u8>) {
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if value == 0 {
            break;
        }
    }
}

pub(crate) fn obu_type(header: u8) -> u8 {
    (header >> 3) & 0x0F
}

/// Append `obu` to `out` with `obu_has_size_field` set.
///
/// Returns false (and appends the OBU unchanged) when the header or an
/// embedded size field is truncated; the decoder reports the failure.
pub(crate) fn write_sized_obu(obu: &[u8], out: &mut Vec<u8>) -> bool {
    let Some(&header) = obu.first() else {
        return false;
    };
    let has_extension = header & 0x04 != 0;
    let has_size = header & 0x02 != 0;
    let header_len = if has_extension { 2 } else { 1 };

    if obu.len() < header_len {
        out.extend_from_slice(obu);
        return false;
    }

    let payload = if has_size {
        match read_leb128(&obu[header_len..]) {
            Some((size, consumed)) => {
                let start = header_len + consumed;
                match obu.get(start..start + size) {
                    Some(payload) => payload,
                    None => {
                        out.extend_from_slice(obu);
                        return false;
                    }
                }
            }
            None => {
                out.extend_from_slice(obu);
                return false;
            }
        }
    } else {
        &obu[header_len..]
    };

    out.push(header | 0x02);
    if has_extension {
        out.push(obu[1]);
    }
    write_leb128(payload.len(), out);
    out.extend_from_slice(payload);
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregation_header_bits() {
        let header = AggregationHeader::parse(0b1110_1000);
        assert!(header.z);
        assert!(header.y);
        assert_eq!(header.w, 2);
        assert!(header.n);

        let header = AggregationHeader::parse(0b0001_0000);
        assert!(!header.z && !header.y && !header.n);
        assert_eq!(header.w, 1);
    }

    #[test]
    fn test_leb128_multibyte() {
        let mut out = Vec::new();
        write_leb128(300, &mut out);
        assert_eq!(out, vec![0xAC, 0x02]);
        assert_eq!(read_leb128(&out), Some((300, 2)));
        // Unterminated
        assert_eq!(read_leb128(&[0x80, 0x80]), None);
    }

    #[test]
    fn test_sized_obu_adds_size_field() {
        // Frame OBU (type 6) without size field, 3 payload bytes
        let obu = [6 << 3, 0xAA, 0xBB, 0xCC];
        let mut out = Vec::new();
        assert!(write_sized_obu(&obu, &mut out));
        assert_eq!(out, vec![(6 << 3) | 0x02, 3, 0xAA, 0xBB, 0xCC]);
    }

    #[test]
    fn test_sized_obu_keeps_extension_and_trims_trailing() {
        // Extension flag + size field of 1, followed by a trailing byte
        let obu = [(6 << 3) | 0x04 | 0x02, 0x20, 1, 0xAA, 0xFF];
        let mut out = Vec::new();
        assert!(write_sized_obu(&obu, &mut out));
        assert_eq!(out, vec![(6 << 3) | 0x06, 0x20, 1, 0xAA]);
    }

    #[test]
    fn test_sized_obu_truncated_size_field() {
        let obu = [(6 << 3) | 0x02, 10, 0xAA];
        let mut out = Vec::new();
        assert!(!write_sized_obu(&obu, &mut out));
        assert_eq!(out, obu.to_vec());
    }
}
