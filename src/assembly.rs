use crate::flags::*;
use crate::frame::PrioritySpec;
use crate::headers::Headers;
use crate::types::*;
use bytes::{BufMut, BytesMut};

/// Hard cap on the pre-HPACK size of one assembling header block.
pub const MAX_HEADER_BUFFER_SIZE: usize = 400 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    Headers,
    PushPromise,
}

/// Reassembly state for one HEADERS or PUSH_PROMISE frame and its
/// CONTINUATION tail. While one of these exists, the connection admits no
/// frame other than CONTINUATION on the same stream.
///
/// Padding from the opening frame is kept in the buffer and stripped only
/// once the block completes, so the size guard sees the pre-strip total.
///
/// https://httpwg.org/specs/rfc7540.html#HeaderBlock
#[derive(Debug)]
pub struct HeaderAssembler {
    stream_id: StreamId,
    kind: BlockKind,
    buffer: BytesMut,
    pad_len: usize,
    end_stream: bool,
    end_headers: bool,
    promised_id: Option<StreamId>,
    priority: Option<PrioritySpec>,
}

impl HeaderAssembler {
    /// Starts assembly from a HEADERS frame payload, consuming the
    /// flags-dependent prefix (pad length, priority field).
    pub fn begin_headers(
        stream_id: StreamId,
        flags: HeadersFlags,
        payload: &[u8],
    ) -> Result<Self, ProtocolError> {
        let mut rest = payload;
        let pad_len = take_pad_length(&mut rest, flags.contains(HeadersFlags::PADDED))?;
        let priority = if flags.contains(HeadersFlags::PRIORITY) {
            if rest.len() < 5 {
                return Err(ProtocolError::connection(
                    ErrorType::FrameSizeError,
                    "HEADERS too short for its priority field",
                ));
            }
            let spec = PrioritySpec::parse(&rest[..5])?;
            rest = &rest[5..];
            Some(spec)
        } else {
            None
        };
        if pad_len > rest.len() {
            return Err(ProtocolError::connection(
                ErrorType::ProtocolError,
                "padding exceeds the HEADERS fragment",
            ));
        }

        let mut assembler = Self {
            stream_id,
            kind: BlockKind::Headers,
            buffer: BytesMut::new(),
            pad_len,
            end_stream: flags.contains(HeadersFlags::END_STREAM),
            end_headers: flags.contains(HeadersFlags::END_HEADERS),
            promised_id: None,
            priority,
        };
        assembler.append(rest)?;
        Ok(assembler)
    }

    /// Starts assembly from a PUSH_PROMISE frame payload; the promised
    /// stream id sits between the optional pad length and the fragment.
    pub fn begin_push_promise(
        stream_id: StreamId,
        flags: PushPromiseFlags,
        payload: &[u8],
    ) -> Result<Self, ProtocolError> {
        let mut rest = payload;
        let pad_len = take_pad_length(&mut rest, flags.contains(PushPromiseFlags::PADDED))?;
        if rest.len() < 4 {
            return Err(ProtocolError::connection(
                ErrorType::FrameSizeError,
                "PUSH_PROMISE too short for its promised stream id",
            ));
        }
        // unwrap: the length of the slice is always 4
        let promised_id = u32::from_be_bytes(rest[0..=3].try_into().unwrap()) & U31_MAX;
        rest = &rest[4..];
        if pad_len > rest.len() {
            return Err(ProtocolError::connection(
                ErrorType::ProtocolError,
                "padding exceeds the PUSH_PROMISE fragment",
            ));
        }

        let mut assembler = Self {
            stream_id,
            kind: BlockKind::PushPromise,
            buffer: BytesMut::new(),
            pad_len,
            end_stream: false,
            end_headers: flags.contains(PushPromiseFlags::END_HEADERS),
            promised_id: Some(promised_id),
            priority: None,
        };
        assembler.append(rest)?;
        Ok(assembler)
    }

    /// Appends a fragment (the opening frame's remainder or a CONTINUATION
    /// payload), enforcing the cumulative size cap.
    pub fn append(&mut self, fragment: &[u8]) -> Result<(), ProtocolError> {
        if self.buffer.len() + fragment.len() > MAX_HEADER_BUFFER_SIZE {
            return Err(ProtocolError::connection(
                ErrorType::ProtocolError,
                "header block larger than the 400 KiB assembly buffer",
            ));
        }
        self.buffer.put_slice(fragment);
        Ok(())
    }

    pub fn continuation(&mut self, flags: ContinuationFlags, fragment: &[u8]) -> Result<(), ProtocolError> {
        self.append(fragment)?;
        if flags.contains(ContinuationFlags::END_HEADERS) {
            self.end_headers = true;
        }
        Ok(())
    }

    #[must_use]
    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    #[must_use]
    pub fn kind(&self) -> BlockKind {
        self.kind
    }

    #[must_use]
    pub fn end_stream(&self) -> bool {
        self.end_stream
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.end_headers
    }

    #[must_use]
    pub fn promised_id(&self) -> Option<StreamId> {
        self.promised_id
    }

    #[must_use]
    pub fn priority(&self) -> Option<PrioritySpec> {
        self.priority
    }

    /// Strips and verifies the padding, then hands the block to the HPACK
    /// decoder. The decoder consumes the buffer exactly; anything it rejects
    /// is a COMPRESSION_ERROR.
    pub fn finish(self, decoder: &mut hpack::Decoder<'_>) -> Result<Headers, ProtocolError> {
        debug_assert!(self.end_headers);
        let block_len = self.buffer.len() - self.pad_len;
        let (block, padding) = self.buffer.split_at(block_len);
        if padding.iter().any(|&octet| octet != 0) {
            return Err(ProtocolError::connection(
                ErrorType::ProtocolError,
                "non-zero padding octets",
            ));
        }
        let fields = decoder.decode(block).map_err(|err| {
            ProtocolError::connection(
                ErrorType::CompressionError,
                format!("header block does not decode: {err:?}"),
            )
        })?;
        Headers::from_decoded(fields)
    }
}

fn take_pad_length(payload: &mut &[u8], padded: bool) -> Result<usize, ProtocolError> {
    if !padded {
        return Ok(0);
    }
    let (&pad_len, rest) = payload.split_first().ok_or_else(|| {
        ProtocolError::connection(
            ErrorType::FrameSizeError,
            "padded frame too short for its pad length octet",
        )
    })?;
    *payload = rest;
    Ok(usize::from(pad_len))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(headers: &[(&str, &str)]) -> Vec<u8> {
        let mut encoder = hpack::Encoder::new();
        encoder.encode(
            headers
                .iter()
                .map(|(name, value)| (name.as_bytes(), value.as_bytes())),
        )
    }

    fn decode_all(assembler: HeaderAssembler) -> Headers {
        let mut decoder = hpack::Decoder::new();
        assembler.finish(&mut decoder).unwrap()
    }

    #[test]
    fn single_frame_block() {
        let block = encode(&[(":status", "200")]);
        let assembler = HeaderAssembler::begin_headers(
            1,
            HeadersFlags::END_HEADERS | HeadersFlags::END_STREAM,
            &block,
        )
        .unwrap();
        assert!(assembler.is_complete());
        assert!(assembler.end_stream());
        let headers = decode_all(assembler);
        assert_eq!(headers.get_one(":status"), Some("200"));
    }

    #[test]
    fn fragmented_block_equals_single_frame_encoding() {
        let block = encode(&[(":status", "200"), ("server", "h2"), ("via", "proxy")]);
        let (first, second) = block.split_at(block.len() / 2);

        let mut assembler =
            HeaderAssembler::begin_headers(1, HeadersFlags::empty(), first).unwrap();
        assert!(!assembler.is_complete());
        assembler
            .continuation(ContinuationFlags::END_HEADERS, second)
            .unwrap();
        assert!(assembler.is_complete());

        let reassembled = decode_all(assembler);
        let whole = decode_all(
            HeaderAssembler::begin_headers(1, HeadersFlags::END_HEADERS, &block).unwrap(),
        );
        assert_eq!(reassembled, whole);
    }

    #[test]
    fn padding_is_stripped_and_verified() {
        let block = encode(&[(":status", "200")]);
        let mut payload = vec![3u8];
        payload.extend_from_slice(&block);
        payload.extend_from_slice(&[0, 0, 0]);
        let assembler = HeaderAssembler::begin_headers(
            1,
            HeadersFlags::END_HEADERS | HeadersFlags::PADDED,
            &payload,
        )
        .unwrap();
        let headers = decode_all(assembler);
        assert_eq!(headers.get_one(":status"), Some("200"));

        let mut payload = vec![3u8];
        payload.extend_from_slice(&block);
        payload.extend_from_slice(&[0, 1, 0]);
        let assembler = HeaderAssembler::begin_headers(
            1,
            HeadersFlags::END_HEADERS | HeadersFlags::PADDED,
            &payload,
        )
        .unwrap();
        let mut decoder = hpack::Decoder::new();
        let err = assembler.finish(&mut decoder).unwrap_err();
        assert_eq!(err.code, ErrorType::ProtocolError);
    }

    #[test]
    fn priority_prefix_is_consumed() {
        let block = encode(&[(":status", "200")]);
        let mut payload = PrioritySpec {
            exclusive: false,
            dependency: 3,
            weight: 20,
        }
        .pack()
        .to_vec();
        payload.extend_from_slice(&block);
        let assembler = HeaderAssembler::begin_headers(
            5,
            HeadersFlags::END_HEADERS | HeadersFlags::PRIORITY,
            &payload,
        )
        .unwrap();
        let priority = assembler.priority().unwrap();
        assert_eq!(priority.dependency, 3);
        assert_eq!(priority.weight, 20);
        let headers = decode_all(assembler);
        assert_eq!(headers.get_one(":status"), Some("200"));
    }

    #[test]
    fn push_promise_prefix_carries_the_promised_id() {
        let block = encode(&[(":method", "GET")]);
        let mut payload = 2u32.to_be_bytes().to_vec();
        payload.extend_from_slice(&block);
        let assembler =
            HeaderAssembler::begin_push_promise(1, PushPromiseFlags::END_HEADERS, &payload)
                .unwrap();
        assert_eq!(assembler.promised_id(), Some(2));
        assert_eq!(assembler.kind(), BlockKind::PushPromise);
    }

    #[test]
    fn cumulative_size_guard() {
        let mut assembler =
            HeaderAssembler::begin_headers(1, HeadersFlags::empty(), &[0u8; 1024]).unwrap();
        let fragment = vec![0u8; 64 * 1024];
        for _ in 0..6 {
            assembler.append(&fragment).unwrap();
        }
        let err = assembler.append(&fragment).unwrap_err();
        assert_eq!(err.code, ErrorType::ProtocolError);
        assert_eq!(err.level, Level::Connection);
    }

    #[test]
    fn padding_beyond_fragment_rejected() {
        let err = HeaderAssembler::begin_headers(
            1,
            HeadersFlags::END_HEADERS | HeadersFlags::PADDED,
            &[200, 1, 2],
        )
        .unwrap_err();
        assert_eq!(err.code, ErrorType::ProtocolError);
    }
}
