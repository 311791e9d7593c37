use crate::types::*;
use bytes::{BufMut, Bytes, BytesMut};
use num_traits::{FromPrimitive, ToPrimitive};
use std::io;

/// Length of the fixed frame header preceding every payload.
pub const FRAME_HEADER_LEN: usize = 9;

/// A single frame as exchanged with the connection multiplexer: the
/// multiplexer owns transport I/O, this type owns the octet layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub typ: FrameType,
    pub flags: u8,
    pub stream_id: StreamId,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(typ: FrameType, flags: u8, stream_id: StreamId, payload: impl Into<Bytes>) -> Self {
        Self {
            typ,
            flags,
            stream_id,
            payload: payload.into(),
        }
    }

    /// The on-wire type octet.
    #[must_use]
    pub fn type_byte(&self) -> u8 {
        // unwrap: FrameType is repr(u8)
        self.typ.to_u8().unwrap()
    }

    /// Serializes the 9-octet header followed by the payload.
    ///
    /// https://httpwg.org/specs/rfc7540.html#FrameHeader
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + self.payload.len());
        buf.put_slice(&(self.payload.len() as u32).to_be_bytes()[1..]);
        buf.put_u8(self.type_byte());
        buf.put_u8(self.flags);
        buf.put_u32(self.stream_id & U31_MAX);
        buf.put_slice(&self.payload);
        buf.freeze()
    }
}

/// Parses a 9-octet frame header into (payload length, type byte, flags,
/// stream id). The reserved bit of the id is dropped; an unknown type byte is
/// surfaced as-is so callers can skip the frame per RFC 7540 Section 4.1.
#[must_use]
pub fn parse_frame_header(header: [u8; FRAME_HEADER_LEN]) -> (usize, u8, u8, StreamId) {
    let length = u32::from_be_bytes([0, header[0], header[1], header[2]]) as usize;
    // unwrap: the length of the slice is always 4
    let stream_id = u32::from_be_bytes(header[5..=8].try_into().unwrap()) & U31_MAX;
    (length, header[3], header[4], stream_id)
}

/// Where outbound frames go: the connection multiplexer's submission side.
///
/// The transport (TCP/TLS) and the read loop live behind this seam; the core
/// only produces framed payloads for it.
pub trait FrameSink: Send {
    fn send_frame(&mut self, frame: Frame) -> io::Result<()>;
}

/// Frame channels stand in for the transport in tests and in-process pairs.
impl FrameSink for std::sync::mpsc::Sender<Frame> {
    fn send_frame(&mut self, frame: Frame) -> io::Result<()> {
        self.send(frame)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "frame receiver dropped"))
    }
}

/// Raw SETTINGS payload entries in wire order, unknown ids included.
///
/// Recognized ids are interpreted later; preserving order and unknown
/// entries keeps `pack_settings_payload(parse_settings_payload(b)) == b`.
pub fn parse_settings_payload(payload: &[u8]) -> Result<Vec<(u16, u32)>, ProtocolError> {
    if payload.len() % 6 != 0 {
        return Err(ProtocolError::connection(
            ErrorType::FrameSizeError,
            "SETTINGS payload length is not a multiple of 6",
        ));
    }
    let mut params = Vec::with_capacity(payload.len() / 6);
    for entry in payload.chunks_exact(6) {
        // unwrap: chunks_exact yields 6-octet slices
        params.push((
            u16::from_be_bytes(entry[0..=1].try_into().unwrap()),
            u32::from_be_bytes(entry[2..=5].try_into().unwrap()),
        ));
    }
    Ok(params)
}

#[must_use]
pub fn pack_settings_payload(params: &[(u16, u32)]) -> Bytes {
    let mut payload = BytesMut::with_capacity(params.len() * 6);
    for (id, value) in params {
        payload.put_u16(*id);
        payload.put_u32(*value);
    }
    payload.freeze()
}

/// WINDOW_UPDATE payload: one 31-bit increment, reserved top bit dropped.
pub fn parse_window_update(payload: &[u8]) -> Result<u32, ProtocolError> {
    let raw: [u8; 4] = payload.try_into().map_err(|_| {
        ProtocolError::connection(
            ErrorType::FrameSizeError,
            "WINDOW_UPDATE payload is not 4 octets",
        )
    })?;
    Ok(u32::from_be_bytes(raw) & U31_MAX)
}

/// The 5-octet priority field of PRIORITY frames and HEADERS frames carrying
/// the PRIORITY flag. Weight is transmitted as `weight - 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrioritySpec {
    pub exclusive: bool,
    pub dependency: StreamId,
    pub weight: u16,
}

impl PrioritySpec {
    pub fn parse(payload: &[u8]) -> Result<Self, ProtocolError> {
        let raw: [u8; 5] = payload.try_into().map_err(|_| {
            ProtocolError::stream(
                ErrorType::FrameSizeError,
                "priority field is not 5 octets",
            )
        })?;
        // unwrap: the length of the slice is always 4
        let dependency = u32::from_be_bytes(raw[0..=3].try_into().unwrap());
        Ok(Self {
            exclusive: dependency & !U31_MAX != 0,
            dependency: dependency & U31_MAX,
            weight: u16::from(raw[4]) + 1,
        })
    }

    #[must_use]
    pub fn pack(&self) -> [u8; 5] {
        let mut raw = [0u8; 5];
        let mut dependency = self.dependency & U31_MAX;
        if self.exclusive {
            dependency |= !U31_MAX;
        }
        raw[0..=3].copy_from_slice(&dependency.to_be_bytes());
        raw[4] = (self.weight - 1) as u8;
        raw
    }
}

/// RST_STREAM / GOAWAY error codes are 32-bit big-endian; unknown codes map
/// to INTERNAL_ERROR.
#[must_use]
pub fn parse_error_code(raw: u32) -> ErrorType {
    ErrorType::from_u32(raw).unwrap_or(ErrorType::InternalError)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layout() {
        let frame = Frame::new(FrameType::Ping, 0x1, 0, vec![0u8; 8]);
        let wire = frame.encode();
        assert_eq!(&wire[..], &[0, 0, 8, 0x6, 0x1, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0][..]);

        let (length, typ, flags, stream_id) = parse_frame_header(wire[..9].try_into().unwrap());
        assert_eq!(length, 8);
        assert_eq!(typ, 0x6);
        assert_eq!(flags, 0x1);
        assert_eq!(stream_id, 0);
    }

    #[test]
    fn reserved_stream_bit_dropped() {
        let (_, _, _, stream_id) =
            parse_frame_header([0, 0, 0, 0x0, 0, 0x80, 0, 0, 0x3]);
        assert_eq!(stream_id, 3);
    }

    #[test]
    fn settings_round_trip() {
        // Ascending ids, one unrecognized (0x9) entry kept verbatim.
        let bytes = pack_settings_payload(&[(0x1, 4096), (0x4, 65_535), (0x9, 7)]);
        let params = parse_settings_payload(&bytes).unwrap();
        assert_eq!(params, vec![(0x1, 4096), (0x4, 65_535), (0x9, 7)]);
        assert_eq!(pack_settings_payload(&params), bytes);
    }

    #[test]
    fn settings_length_not_multiple_of_six() {
        let err = parse_settings_payload(&[0; 7]).unwrap_err();
        assert_eq!(err.code, ErrorType::FrameSizeError);
        assert_eq!(err.level, Level::Connection);
    }

    #[test]
    fn window_update_masks_reserved_bit() {
        assert_eq!(parse_window_update(&[0x80, 0, 0, 5]).unwrap(), 5);
        assert!(parse_window_update(&[0, 0, 5]).is_err());
    }

    #[test]
    fn priority_spec_round_trip() {
        let spec = PrioritySpec {
            exclusive: true,
            dependency: 11,
            weight: 256,
        };
        let packed = spec.pack();
        assert_eq!(packed, [0x80, 0, 0, 11, 255]);
        assert_eq!(PrioritySpec::parse(&packed).unwrap(), spec);
    }

    #[test]
    fn unknown_error_code_is_internal() {
        assert_eq!(parse_error_code(0x8), ErrorType::Cancel);
        assert_eq!(parse_error_code(0xff), ErrorType::InternalError);
    }
}
