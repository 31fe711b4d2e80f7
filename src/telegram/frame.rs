//! Frame assembly and parsing.
//!
//! `compose` copies a Tx RAM payload image into a contiguous wire frame;
//! `parse` validates a received frame and returns typed references into
//! its payload. Structural errors are returned as [`FrameError`] so the
//! caller can count and drop — a malformed frame is never surfaced past
//! the codec.

use super::{
    SercosHeader, BROADCAST_MAC, ETHERTYPE_SERCOS, ETH_HEADER_LEN, HEADER_LEN, SERCOS_HEADER_LEN,
};

/// Structural frame errors. Counted per port, then dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// Shorter than Ethernet + Sercos headers.
    Truncated,
    /// EtherType is not 0x88CD.
    NotSercos,
    /// Kind nibble or slot out of range.
    BadHeader,
}

/// A validated received telegram, borrowing the frame bytes.
#[derive(Debug)]
pub struct ParsedTelegram<'a> {
    pub header: SercosHeader,
    pub src_mac: [u8; 6],
    pub payload: &'a [u8],
}

/// EtherType of a raw frame, if it is long enough to carry one.
/// Used by the UC-channel path to tell Sercos traffic from pass-through.
pub fn ethertype(frame: &[u8]) -> Option<u16> {
    if frame.len() < ETH_HEADER_LEN {
        return None;
    }
    Some(u16::from_be_bytes([frame[12], frame[13]]))
}

/// Assemble one telegram into `out`. Returns the wire length.
///
/// `out` must hold `HEADER_LEN + payload.len()` bytes; the caller sizes it
/// from the MTU, which placement has already checked the payload against.
pub fn compose(header: &SercosHeader, src_mac: [u8; 6], payload: &[u8], out: &mut [u8]) -> usize {
    let total = HEADER_LEN + payload.len();
    debug_assert!(out.len() >= total, "frame buffer undersized");

    out[0..6].copy_from_slice(&BROADCAST_MAC);
    out[6..12].copy_from_slice(&src_mac);
    out[12..14].copy_from_slice(&ETHERTYPE_SERCOS.to_be_bytes());
    out[14..18].copy_from_slice(&header.pack());
    out[HEADER_LEN..total].copy_from_slice(payload);
    total
}

/// Validate and split one received frame.
pub fn parse(frame: &[u8]) -> Result<ParsedTelegram<'_>, FrameError> {
    if frame.len() < HEADER_LEN {
        return Err(FrameError::Truncated);
    }
    if u16::from_be_bytes([frame[12], frame[13]]) != ETHERTYPE_SERCOS {
        return Err(FrameError::NotSercos);
    }

    let mut hdr_bytes = [0u8; SERCOS_HEADER_LEN];
    hdr_bytes.copy_from_slice(&frame[ETH_HEADER_LEN..HEADER_LEN]);
    let header = SercosHeader::parse(&hdr_bytes).ok_or(FrameError::BadHeader)?;

    let mut src_mac = [0u8; 6];
    src_mac.copy_from_slice(&frame[6..12]);

    Ok(ParsedTelegram {
        header,
        src_mac,
        payload: &frame[HEADER_LEN..],
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::ports::Port;
    use crate::config::TelegramClass;

    fn header() -> SercosHeader {
        SercosHeader {
            class: TelegramClass::Mdt,
            slot: 0,
            channel: Port::P1,
            phase: 4,
            phase_switch: false,
            cycle_count: 5,
        }
    }

    #[test]
    fn compose_parse_round_trip() {
        let src = [0x02, 0x00, 0x00, 0xAB, 0xCD, 0xEF];
        let payload = [0x11u8, 0x22, 0x33, 0x44];
        let mut out = [0u8; 64];

        let len = compose(&header(), src, &payload, &mut out);
        assert_eq!(len, HEADER_LEN + 4);

        let parsed = parse(&out[..len]).unwrap();
        assert_eq!(parsed.header, header());
        assert_eq!(parsed.src_mac, src);
        assert_eq!(parsed.payload, &payload);
    }

    #[test]
    fn wire_bytes_are_fixed() {
        // The encoded frame must be byte-identical on any host.
        let src = [0x02, 0, 0, 0, 0, 0x01];
        let mut out = [0u8; 32];
        let len = compose(&header(), src, &[0xAA], &mut out);
        assert_eq!(&out[..6], &[0xFF; 6]);
        assert_eq!(&out[12..14], &[0x88, 0xCD]);
        assert_eq!(out[14], 0x80); // MDT kind nibble, slot 0
        assert_eq!(out[15], 0x04); // CP4, no switch pending
        assert_eq!(out[16], 0x05); // cycle count
        assert_eq!(out[len - 1], 0xAA);
    }

    #[test]
    fn parse_rejects_short_frames() {
        assert_eq!(parse(&[0u8; 10]).unwrap_err(), FrameError::Truncated);
    }

    #[test]
    fn parse_rejects_foreign_ethertype() {
        let mut frame = [0u8; 32];
        frame[12] = 0x08; // IPv4
        assert_eq!(parse(&frame).unwrap_err(), FrameError::NotSercos);
    }

    #[test]
    fn parse_rejects_bad_kind() {
        let src = [0u8; 6];
        let mut out = [0u8; 32];
        let len = compose(&header(), src, &[], &mut out);
        out[14] = 0x30; // unknown kind nibble
        assert_eq!(parse(&out[..len]).unwrap_err(), FrameError::BadHeader);
    }

    #[test]
    fn ethertype_helper() {
        let mut frame = [0u8; 20];
        frame[12] = 0x88;
        frame[13] = 0xCD;
        assert_eq!(ethertype(&frame), Some(0x88CD));
        assert_eq!(ethertype(&frame[..8]), None);
    }
}
