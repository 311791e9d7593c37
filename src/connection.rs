use crate::assembly::{BlockKind, HeaderAssembler};
use crate::flags::*;
use crate::flow::FlowWindow;
use crate::frame::*;
use crate::headers::{validate_received_block, BlockDirection, Headers};
use crate::priority::PriorityTree;
use crate::state::{self, StreamState};
use crate::stream::{wait_deadline, Chunk, ChunkEntry, Stream, StreamInner};
use crate::stream_coordinator::{Lookup, StreamCoordinator};
use crate::types::*;
use bytes::Bytes;
use derivative::Derivative;
use enum_map::EnumMap;
use log::{debug, error, trace, warn};
use num_traits::{FromPrimitive, ToPrimitive};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::time::Instant;

/// The connection's HPACK contexts. Stateful across frames; only ever
/// touched under the codec mutex so dynamic-table updates stay ordered with
/// the blocks that reference them.
#[derive(Derivative)]
#[derivative(Debug)]
pub(crate) struct HeaderCodec {
    #[derivative(Debug = "ignore")]
    pub encoder: hpack::Encoder<'static>,
    #[derivative(Debug = "ignore")]
    pub decoder: hpack::Decoder<'static>,
    /// Dynamic-table cap the peer advertised for our encoder. Recorded from
    /// SETTINGS; the encoder's own table management stays within it.
    pub peer_table_cap: u32,
}

impl HeaderCodec {
    fn new() -> Self {
        Self {
            encoder: hpack::Encoder::new(),
            decoder: hpack::Decoder::new(),
            peer_table_cap: 4096,
        }
    }
}

/// Completion handle for an outstanding PING, keyed by its opaque payload.
#[derive(Debug, Clone)]
pub struct PingHandle {
    state: Arc<(Mutex<bool>, Condvar)>,
}

impl PingHandle {
    /// Blocks until the matching PING ACK arrives or `deadline` elapses.
    pub fn wait(&self, deadline: Option<Instant>) -> Result<(), Error> {
        let mut done = self.state.0.lock().expect("ping state");
        loop {
            if *done {
                return Ok(());
            }
            let (guard, timed_out) = wait_deadline(&self.state.1, done, deadline);
            done = guard;
            if timed_out && !*done {
                return Err(Error::Timeout);
            }
        }
    }
}

/// State shared between the connection handle, its streams, and the frame
/// handlers.
///
/// Lock order: connection-level state (settings, codec, windows, assembler)
/// before any stream core, stream cores before the sink; the priority tree
/// and the active-stream counter are leaves.
pub(crate) struct ConnectionShared {
    pub role: Role,
    sink: Mutex<Box<dyn FrameSink>>,
    codec: Mutex<HeaderCodec>,
    /// Local settings the peer has acknowledged.
    our_settings: RwLock<EnumMap<SettingsParameter, u32>>,
    /// Local settings sent but not yet acknowledged.
    pending_settings: Mutex<Option<Vec<(SettingsParameter, u32)>>>,
    their_settings: RwLock<EnumMap<SettingsParameter, u32>>,
    /// Connection-level credit for what we may send.
    send_window: Mutex<FlowWindow>,
    send_window_cond: Condvar,
    /// Connection-level credit for what the peer may send.
    recv_window: Mutex<FlowWindow>,
    pub(crate) streams: StreamCoordinator,
    tree: Mutex<PriorityTree>,
    /// In-progress HEADERS/PUSH_PROMISE + CONTINUATION reassembly, if any.
    assembler: Mutex<Option<HeaderAssembler>>,
    pings: Mutex<HashMap<[u8; 8], Arc<(Mutex<bool>, Condvar)>>>,
    /// Minimum last-stream-id and latest code from received GOAWAY frames.
    goaway: Mutex<Option<(StreamId, ErrorType)>>,
    goaway_cond: Condvar,
    /// Streams the peer initiated (requests, pushes) not yet claimed.
    incoming: Mutex<VecDeque<Arc<StreamInner>>>,
    incoming_cond: Condvar,
}

impl ConnectionShared {
    // ---- inbound dispatch ------------------------------------------------

    pub(crate) fn handle_frame(
        &self,
        typ: u8,
        flags: u8,
        stream_id: StreamId,
        payload: Bytes,
    ) -> Result<(), Error> {
        let result = self.admit_frame(typ, flags, stream_id, payload);
        if let Err(Error::Protocol(protocol)) = &result {
            self.react(stream_id, protocol);
        }
        result
    }

    fn admit_frame(
        &self,
        typ: u8,
        flags: u8,
        stream_id: StreamId,
        payload: Bytes,
    ) -> Result<(), Error> {
        let Some(typ) = FrameType::from_u8(typ) else {
            trace!("ignoring unknown frame type {typ:#x}");
            return Ok(());
        };
        {
            let assembler = self.assembler.lock().expect("assembler slot");
            if let Some(pending) = assembler.as_ref() {
                if typ != FrameType::Continuation || stream_id != pending.stream_id() {
                    return Err(ProtocolError::connection(
                        ErrorType::ProtocolError,
                        "expected CONTINUATION for the header block in progress",
                    )
                    .into());
                }
            } else if typ == FrameType::Continuation {
                return Err(ProtocolError::connection(
                    ErrorType::ProtocolError,
                    "CONTINUATION without a header block in progress",
                )
                .into());
            }
        }
        match typ {
            FrameType::Data => self.handle_data(flags, stream_id, &payload),
            FrameType::Headers => self.handle_headers(flags, stream_id, &payload),
            FrameType::Priority => self.handle_priority(stream_id, &payload),
            FrameType::ResetStream => self.handle_reset(stream_id, &payload),
            FrameType::Settings => self.handle_settings(flags, stream_id, &payload),
            FrameType::PushPromise => self.handle_push_promise(flags, stream_id, &payload),
            FrameType::Ping => self.handle_ping(flags, stream_id, payload),
            FrameType::GoAway => self.handle_goaway(stream_id, &payload),
            FrameType::WindowUpdate => self.handle_window_update(stream_id, &payload),
            FrameType::Continuation => self.handle_continuation(flags, &payload),
        }
    }

    /// Translates a protocol violation into wire reaction: RST_STREAM for
    /// stream-level errors, GOAWAY for connection-level ones.
    fn react(&self, stream_id: StreamId, protocol: &ProtocolError) {
        match protocol.level {
            Level::Stream => {
                warn!("stream {stream_id}: {protocol}");
                if let Some(stream) = self.streams.get(stream_id) {
                    self.close_stream(&stream, Some(protocol.clone()));
                }
                if let Err(err) = self.write_rst_stream(stream_id, protocol.code) {
                    warn!("RST_STREAM on stream {stream_id} failed: {err}");
                }
            }
            Level::Connection => {
                error!("connection: {protocol}");
                if let Err(err) = self.write_goaway(protocol.code, protocol.message.as_bytes()) {
                    warn!("GOAWAY failed: {err}");
                }
            }
        }
    }

    fn handle_data(&self, flags: u8, stream_id: StreamId, payload: &Bytes) -> Result<(), Error> {
        if stream_id == 0 {
            return Err(ProtocolError::connection(
                ErrorType::ProtocolError,
                "DATA on the connection control stream",
            )
            .into());
        }
        let flags = DataFlags::from_bits_truncate(flags);
        let wire_len = payload.len();
        // The connection window pays for every flow-controlled frame, even
        // one the stream state will reject.
        self.recv_window
            .lock()
            .expect("connection recv window")
            .consume(wire_len, Level::Connection)?;
        let stream = match self.streams.classify(stream_id) {
            Lookup::Known(stream) => stream,
            Lookup::Idle => {
                return Err(ProtocolError::connection(
                    ErrorType::ProtocolError,
                    "DATA received on an idle stream",
                )
                .into())
            }
            Lookup::Closed => {
                return Err(ProtocolError::stream(
                    ErrorType::StreamClosed,
                    "DATA received on a closed stream",
                )
                .into())
            }
        };
        let data = strip_data_padding(payload, flags.contains(DataFlags::PADDED))?;

        let mut core = stream.core.lock().expect("stream core");
        state::check_recv_data(core.state)?;
        core.recv_window.consume(wire_len, Level::Stream)?;
        core.stats.data_bytes_received += wire_len as u64;
        core.chunk_queue
            .push_back(ChunkEntry::Data(Chunk::new(data, wire_len as u32)));
        if flags.contains(DataFlags::END_STREAM) {
            core.chunk_queue.push_back(ChunkEntry::End);
            let next = state::after_recv_data_end(core.state);
            self.set_stream_state(&stream, &mut core, next);
        }
        stream.chunks_cond.notify_all();
        Ok(())
    }

    fn handle_headers(&self, flags: u8, stream_id: StreamId, payload: &Bytes) -> Result<(), Error> {
        if stream_id == 0 {
            return Err(ProtocolError::connection(
                ErrorType::ProtocolError,
                "HEADERS on the connection control stream",
            )
            .into());
        }
        let flags = HeadersFlags::from_bits_truncate(flags);
        let (stream, fresh) = match self.streams.classify(stream_id) {
            Lookup::Known(stream) => (stream, false),
            Lookup::Idle => {
                if self.streams.is_local(stream_id) {
                    return Err(ProtocolError::connection(
                        ErrorType::ProtocolError,
                        "HEADERS on a local stream that was never opened",
                    )
                    .into());
                }
                self.streams.observe_remote(stream_id);
                (self.create_stream(stream_id), true)
            }
            Lookup::Closed => {
                return Err(ProtocolError::stream(
                    ErrorType::StreamClosed,
                    "HEADERS received on a closed stream",
                )
                .into())
            }
        };

        let assembler = HeaderAssembler::begin_headers(stream_id, flags, payload)?;
        if let Some(priority) = assembler.priority() {
            let mut tree = self.tree.lock().expect("priority tree");
            tree.reprioritise(stream_id, priority.dependency, priority.exclusive)?;
            tree.set_weight(stream_id, priority.weight);
        }
        {
            let mut core = stream.core.lock().expect("stream core");
            let next = state::after_recv_headers(core.state, assembler.end_stream())?;
            self.set_stream_state(&stream, &mut core, next);
        }
        if fresh {
            let mut incoming = self.incoming.lock().expect("incoming streams");
            incoming.push_back(Arc::clone(&stream));
            self.incoming_cond.notify_all();
        }
        self.install_or_complete(assembler)
    }

    fn handle_priority(&self, stream_id: StreamId, payload: &Bytes) -> Result<(), Error> {
        if stream_id == 0 {
            return Err(ProtocolError::connection(
                ErrorType::ProtocolError,
                "PRIORITY on the connection control stream",
            )
            .into());
        }
        if payload.len() != 5 {
            return Err(ProtocolError::stream(
                ErrorType::FrameSizeError,
                "PRIORITY payload is not 5 octets",
            )
            .into());
        }
        let spec = PrioritySpec::parse(payload)?;
        let mut tree = self.tree.lock().expect("priority tree");
        tree.reprioritise(stream_id, spec.dependency, spec.exclusive)?;
        tree.set_weight(stream_id, spec.weight);
        Ok(())
    }

    fn handle_reset(&self, stream_id: StreamId, payload: &Bytes) -> Result<(), Error> {
        if stream_id == 0 {
            return Err(ProtocolError::connection(
                ErrorType::ProtocolError,
                "RST_STREAM on the connection control stream",
            )
            .into());
        }
        let raw: [u8; 4] = payload[..].try_into().map_err(|_| {
            ProtocolError::connection(
                ErrorType::FrameSizeError,
                "RST_STREAM payload is not 4 octets",
            )
        })?;
        let code = parse_error_code(u32::from_be_bytes(raw));
        match self.streams.classify(stream_id) {
            Lookup::Known(stream) => {
                {
                    let core = stream.core.lock().expect("stream core");
                    state::check_recv_reset(core.state)?;
                }
                warn!("stream {stream_id} reset by peer: {code:?}");
                self.close_stream(&stream, Some(ProtocolError::stream(code, "reset by peer")));
                Ok(())
            }
            Lookup::Idle => Err(ProtocolError::connection(
                ErrorType::ProtocolError,
                "RST_STREAM received on an idle stream",
            )
            .into()),
            Lookup::Closed => Ok(()),
        }
    }

    fn handle_settings(&self, flags: u8, stream_id: StreamId, payload: &Bytes) -> Result<(), Error> {
        if stream_id != 0 {
            return Err(ProtocolError::connection(
                ErrorType::ProtocolError,
                "SETTINGS on a stream",
            )
            .into());
        }
        if SettingsFlags::from_bits_truncate(flags).contains(SettingsFlags::ACK) {
            if !payload.is_empty() {
                return Err(ProtocolError::connection(
                    ErrorType::FrameSizeError,
                    "SETTINGS ACK with a payload",
                )
                .into());
            }
            // The peer confirmed our outstanding settings; they now bind us.
            if let Some(pending) = self.pending_settings.lock().expect("pending settings").take()
            {
                let mut ours = self.our_settings.write().expect("local settings");
                for (param, value) in pending {
                    ours[param] = value;
                }
            }
            return Ok(());
        }

        let params = parse_settings_payload(payload)?;
        {
            let mut theirs = self.their_settings.write().expect("peer settings");
            let mut codec = self.codec.lock().expect("header codec");
            for (id, value) in params {
                // spec says to ignore unknown settings
                let Some(param) = SettingsParameter::from_u16(id) else {
                    continue;
                };
                match param {
                    SettingsParameter::HeaderTableSize => {
                        codec.peer_table_cap = value;
                    }
                    SettingsParameter::EnablePush => {
                        if value > 1 {
                            return Err(ProtocolError::connection(
                                ErrorType::ProtocolError,
                                "ENABLE_PUSH must be 0 or 1",
                            )
                            .into());
                        }
                        if value == 1 && self.role == Role::Client {
                            return Err(ProtocolError::connection(
                                ErrorType::ProtocolError,
                                "server advertised ENABLE_PUSH=1",
                            )
                            .into());
                        }
                    }
                    SettingsParameter::InitialWindowSize => {
                        if value > U31_MAX {
                            return Err(ProtocolError::connection(
                                ErrorType::FlowControlError,
                                "INITIAL_WINDOW_SIZE above 2^31-1",
                            )
                            .into());
                        }
                    }
                    SettingsParameter::MaxFrameSize => {
                        if !(16_384..(1 << 24)).contains(&value) {
                            return Err(ProtocolError::connection(
                                ErrorType::ProtocolError,
                                "MAX_FRAME_SIZE outside the allowed range",
                            )
                            .into());
                        }
                    }
                    SettingsParameter::MaxConcurrentStreams
                    | SettingsParameter::MaxHeaderListSize => {}
                }
                theirs[param] = value;
            }
        }
        // Best-effort acknowledgement.
        if let Err(err) = self.submit(Frame::new(
            FrameType::Settings,
            SettingsFlags::ACK.bits(),
            0,
            Bytes::new(),
        )) {
            warn!("SETTINGS ACK failed: {err}");
        }
        Ok(())
    }

    fn handle_push_promise(
        &self,
        flags: u8,
        stream_id: StreamId,
        payload: &Bytes,
    ) -> Result<(), Error> {
        if self.role == Role::Server {
            return Err(ProtocolError::connection(
                ErrorType::ProtocolError,
                "PUSH_PROMISE received by a server",
            )
            .into());
        }
        if self.our_settings.read().expect("local settings")[SettingsParameter::EnablePush] == 0 {
            return Err(ProtocolError::connection(
                ErrorType::ProtocolError,
                "PUSH_PROMISE after push was disabled",
            )
            .into());
        }
        if stream_id == 0 {
            return Err(ProtocolError::connection(
                ErrorType::ProtocolError,
                "PUSH_PROMISE on the connection control stream",
            )
            .into());
        }
        let parent = match self.streams.classify(stream_id) {
            Lookup::Known(stream) => stream,
            Lookup::Idle | Lookup::Closed => {
                return Err(ProtocolError::connection(
                    ErrorType::ProtocolError,
                    "PUSH_PROMISE on a stream that cannot carry it",
                )
                .into())
            }
        };
        {
            let core = parent.core.lock().expect("stream core");
            if !matches!(core.state, StreamState::Open | StreamState::HalfClosedLocal) {
                return Err(ProtocolError::connection(
                    ErrorType::ProtocolError,
                    "PUSH_PROMISE on a stream that cannot carry it",
                )
                .into());
            }
        }

        let flags = PushPromiseFlags::from_bits_truncate(flags);
        let assembler = HeaderAssembler::begin_push_promise(stream_id, flags, payload)?;
        let promised_id = assembler.promised_id().expect("promised id recorded");
        if promised_id == 0 || self.streams.is_local(promised_id) {
            return Err(ProtocolError::connection(
                ErrorType::ProtocolError,
                "promised stream id has the wrong parity",
            )
            .into());
        }
        if !matches!(self.streams.classify(promised_id), Lookup::Idle) {
            return Err(ProtocolError::connection(
                ErrorType::ProtocolError,
                "promised stream id was already used",
            )
            .into());
        }
        self.streams.observe_remote(promised_id);
        let promised = self.create_stream(promised_id);
        // A pushed stream depends on the stream that promised it.
        self.tree
            .lock()
            .expect("priority tree")
            .reprioritise(promised_id, stream_id, false)?;
        {
            let mut core = promised.core.lock().expect("stream core");
            self.set_stream_state(&promised, &mut core, StreamState::ReservedRemote);
        }
        self.install_or_complete(assembler)
    }

    fn handle_ping(&self, flags: u8, stream_id: StreamId, payload: Bytes) -> Result<(), Error> {
        if stream_id != 0 {
            return Err(ProtocolError::connection(
                ErrorType::ProtocolError,
                "PING on a stream",
            )
            .into());
        }
        let octets: [u8; 8] = payload[..].try_into().map_err(|_| {
            ProtocolError::connection(ErrorType::FrameSizeError, "PING payload is not 8 octets")
        })?;
        if PingFlags::from_bits_truncate(flags).contains(PingFlags::ACK) {
            if let Some(state) = self.pings.lock().expect("pending pings").remove(&octets) {
                *state.0.lock().expect("ping state") = true;
                state.1.notify_all();
            }
            Ok(())
        } else {
            self.submit(Frame::new(
                FrameType::Ping,
                PingFlags::ACK.bits(),
                0,
                payload,
            ))
        }
    }

    fn handle_goaway(&self, stream_id: StreamId, payload: &Bytes) -> Result<(), Error> {
        if stream_id != 0 {
            return Err(ProtocolError::connection(
                ErrorType::ProtocolError,
                "GOAWAY on a stream",
            )
            .into());
        }
        if payload.len() < 8 {
            return Err(ProtocolError::connection(
                ErrorType::FrameSizeError,
                "GOAWAY payload shorter than 8 octets",
            )
            .into());
        }
        // unwrap: the length of the slice is always 4
        let last_stream = u32::from_be_bytes(payload[0..=3].try_into().unwrap()) & U31_MAX;
        let code = parse_error_code(u32::from_be_bytes(payload[4..=7].try_into().unwrap()));
        error!("go away: {code:?}");
        if payload.len() > 8 {
            if let Ok(text) = std::str::from_utf8(&payload[8..]) {
                debug!("go away debug: {text}");
            }
        }
        {
            let mut goaway = self.goaway.lock().expect("goaway state");
            let horizon = goaway.get_or_insert((last_stream, code));
            horizon.0 = horizon.0.min(last_stream);
            horizon.1 = code;
        }
        self.goaway_cond.notify_all();
        Ok(())
    }

    fn handle_window_update(&self, stream_id: StreamId, payload: &Bytes) -> Result<(), Error> {
        let increment = parse_window_update(payload)?;
        if stream_id == 0 {
            if increment == 0 {
                return Err(ProtocolError::connection(
                    ErrorType::ProtocolError,
                    "WINDOW_UPDATE with a zero increment",
                )
                .into());
            }
            self.send_window
                .lock()
                .expect("connection send window")
                .replenish(increment, Level::Connection)?;
            self.send_window_cond.notify_all();
            return Ok(());
        }
        if increment == 0 {
            return Err(ProtocolError::stream(
                ErrorType::ProtocolError,
                "WINDOW_UPDATE with a zero increment",
            )
            .into());
        }
        match self.streams.classify(stream_id) {
            Lookup::Known(stream) => {
                let mut core = stream.core.lock().expect("stream core");
                if core.state.is_closed() {
                    // Tolerated: the peer may not have seen the close yet.
                    return Ok(());
                }
                state::check_recv_window_update(core.state)?;
                core.send_window.replenish(increment, Level::Stream)?;
                stream.credit_cond.notify_all();
                Ok(())
            }
            Lookup::Idle => Err(ProtocolError::connection(
                ErrorType::ProtocolError,
                "WINDOW_UPDATE received on an idle stream",
            )
            .into()),
            Lookup::Closed => Ok(()),
        }
    }

    fn handle_continuation(&self, flags: u8, payload: &Bytes) -> Result<(), Error> {
        let flags = ContinuationFlags::from_bits_truncate(flags);
        let mut slot = self.assembler.lock().expect("assembler slot");
        let mut assembler = slot.take().expect("header block in progress");
        assembler.continuation(flags, payload)?;
        if assembler.is_complete() {
            drop(slot);
            self.complete_block(assembler)
        } else {
            *slot = Some(assembler);
            Ok(())
        }
    }

    /// Parks an unfinished block for its CONTINUATION tail, or decodes and
    /// delivers a finished one.
    fn install_or_complete(&self, assembler: HeaderAssembler) -> Result<(), Error> {
        if assembler.is_complete() {
            self.complete_block(assembler)
        } else {
            *self.assembler.lock().expect("assembler slot") = Some(assembler);
            Ok(())
        }
    }

    fn complete_block(&self, assembler: HeaderAssembler) -> Result<(), Error> {
        let stream_id = assembler.stream_id();
        let kind = assembler.kind();
        let end_stream = assembler.end_stream();
        let promised_id = assembler.promised_id();
        let headers = {
            let mut codec = self.codec.lock().expect("header codec");
            assembler.finish(&mut codec.decoder)?
        };

        match kind {
            BlockKind::Headers => {
                let stream = self
                    .streams
                    .get(stream_id)
                    .expect("assembling stream exists");
                let mut core = stream.core.lock().expect("stream core");
                validate_received_block(
                    &headers,
                    BlockDirection::receiving(self.role),
                    core.recv_blocks,
                    end_stream,
                )?;
                core.recv_blocks += 1;
                core.stats.header_blocks_received += 1;
                core.headers_queue.push_back(headers);
                stream.headers_cond.notify_all();
                Ok(())
            }
            BlockKind::PushPromise => {
                let promised_id = promised_id.expect("promised id recorded");
                let promised = self
                    .streams
                    .get(promised_id)
                    .expect("promised stream exists");
                // A malformed promise condemns the promised stream only.
                if let Err(err) =
                    validate_received_block(&headers, BlockDirection::Request, 0, false)
                {
                    warn!("promised stream {promised_id}: {err}");
                    self.close_stream(&promised, Some(err.clone()));
                    if let Err(err) = self.write_rst_stream(promised_id, err.code) {
                        warn!("RST_STREAM on stream {promised_id} failed: {err}");
                    }
                    return Ok(());
                }
                {
                    let mut core = promised.core.lock().expect("stream core");
                    core.stats.header_blocks_received += 1;
                    core.headers_queue.push_back(headers);
                    promised.headers_cond.notify_all();
                }
                let mut incoming = self.incoming.lock().expect("incoming streams");
                incoming.push_back(promised);
                self.incoming_cond.notify_all();
                Ok(())
            }
        }
    }

    // ---- outbound writers ------------------------------------------------

    pub(crate) fn submit(&self, frame: Frame) -> Result<(), Error> {
        self.sink.lock().expect("frame sink").send_frame(frame)?;
        Ok(())
    }

    fn write_rst_stream(&self, stream_id: StreamId, code: ErrorType) -> Result<(), Error> {
        // unwrap: ErrorType is repr(u32)
        let code = code.to_u32().unwrap();
        self.submit(Frame::new(
            FrameType::ResetStream,
            0,
            stream_id,
            code.to_be_bytes().to_vec(),
        ))
    }

    pub(crate) fn write_goaway(&self, code: ErrorType, debug_data: &[u8]) -> Result<(), Error> {
        let mut payload = Vec::with_capacity(8 + debug_data.len());
        payload.extend_from_slice(&self.streams.last_remote_id().to_be_bytes());
        // unwrap: ErrorType is repr(u32)
        payload.extend_from_slice(&code.to_u32().unwrap().to_be_bytes());
        payload.extend_from_slice(debug_data);
        self.submit(Frame::new(FrameType::GoAway, 0, 0, payload))
    }

    /// Emits WINDOW_UPDATE frames totalling `increment`; a single semantic
    /// increment above 2^31-1 is split across frames.
    pub(crate) fn write_window_update(
        &self,
        stream_id: StreamId,
        mut increment: u64,
    ) -> Result<(), Error> {
        while increment > 0 {
            let step = increment.min(u64::from(U31_MAX)) as u32;
            self.submit(Frame::new(
                FrameType::WindowUpdate,
                0,
                stream_id,
                step.to_be_bytes().to_vec(),
            ))?;
            increment -= u64::from(step);
        }
        Ok(())
    }

    /// Releases a consumed chunk: credits both receive ledgers and owes the
    /// peer matching WINDOW_UPDATEs, exactly once per chunk.
    pub(crate) fn ack_chunk(&self, stream: &Arc<StreamInner>, chunk: &mut Chunk) -> Result<(), Error> {
        let increment = chunk.take_ack();
        if increment == 0 {
            return Ok(());
        }
        self.recv_window
            .lock()
            .expect("connection recv window")
            .replenish(increment, Level::Connection)?;
        self.write_window_update(0, u64::from(increment))?;
        {
            let mut core = stream.core.lock().expect("stream core");
            core.recv_window.replenish(increment, Level::Stream)?;
        }
        self.write_window_update(stream.id, u64::from(increment))?;
        Ok(())
    }

    pub(crate) fn write_headers(
        &self,
        stream: &Arc<StreamInner>,
        headers: &Headers,
        end_stream: bool,
    ) -> Result<(), Error> {
        let max_frame =
            self.their_settings.read().expect("peer settings")[SettingsParameter::MaxFrameSize]
                as usize;
        let mut codec = self.codec.lock().expect("header codec");
        let block = codec.encoder.encode(
            headers
                .iter()
                .map(|(name, value)| (name.as_bytes(), value.as_bytes())),
        );
        let mut core = stream.core.lock().expect("stream core");
        if let Some(error) = &core.error {
            return Err(Error::Reset(error.clone()));
        }
        let next = state::after_send_headers(core.state, end_stream)?;
        let base_flags = if end_stream {
            HeadersFlags::END_STREAM.bits()
        } else {
            0
        };
        self.submit_header_block(FrameType::Headers, base_flags, stream.id, &[], &block, max_frame)?;
        drop(codec);
        self.set_stream_state(stream, &mut core, next);
        core.stats.header_blocks_sent += 1;
        Ok(())
    }

    pub(crate) fn push_promise(
        &self,
        parent: &Arc<StreamInner>,
        request: &Headers,
    ) -> Result<Arc<StreamInner>, Error> {
        if self.role != Role::Server {
            return Err(ProtocolError::connection(
                ErrorType::ProtocolError,
                "only servers initiate pushes",
            )
            .into());
        }
        let (push_enabled, max_frame) = {
            let theirs = self.their_settings.read().expect("peer settings");
            (
                theirs[SettingsParameter::EnablePush] == 1,
                theirs[SettingsParameter::MaxFrameSize] as usize,
            )
        };
        if !push_enabled {
            return Err(ProtocolError::stream(
                ErrorType::RefusedStream,
                "peer disabled server push",
            )
            .into());
        }

        let promised_id = self.streams.allocate_local_id();
        let promised = self.create_stream(promised_id);
        self.tree
            .lock()
            .expect("priority tree")
            .reprioritise(promised_id, parent.id, false)?;

        let mut codec = self.codec.lock().expect("header codec");
        let block = codec.encoder.encode(
            request
                .iter()
                .map(|(name, value)| (name.as_bytes(), value.as_bytes())),
        );
        {
            let mut parent_core = parent.core.lock().expect("stream core");
            if let Some(error) = &parent_core.error {
                return Err(Error::Reset(error.clone()));
            }
            if !matches!(
                parent_core.state,
                StreamState::Open | StreamState::HalfClosedRemote
            ) {
                return Err(ProtocolError::stream(
                    ErrorType::StreamClosed,
                    "PUSH_PROMISE on a stream that cannot carry it",
                )
                .into());
            }
            self.submit_header_block(
                FrameType::PushPromise,
                0,
                parent.id,
                &promised_id.to_be_bytes(),
                &block,
                max_frame,
            )?;
            parent_core.stats.header_blocks_sent += 1;
        }
        drop(codec);
        {
            let mut core = promised.core.lock().expect("stream core");
            self.set_stream_state(&promised, &mut core, StreamState::ReservedLocal);
        }
        Ok(promised)
    }

    /// Frames one encoded header block: the opening frame, then CONTINUATION
    /// frames, END_HEADERS on the last only. The END_HEADERS bit occupies
    /// bit 2 for HEADERS, PUSH_PROMISE, and CONTINUATION alike.
    fn submit_header_block(
        &self,
        typ: FrameType,
        base_flags: u8,
        stream_id: StreamId,
        prefix: &[u8],
        block: &[u8],
        max_frame: usize,
    ) -> Result<(), Error> {
        let end_headers = ContinuationFlags::END_HEADERS.bits();
        let mut sink = self.sink.lock().expect("frame sink");
        let first_take = block.len().min(max_frame.saturating_sub(prefix.len()));
        let mut last = first_take == block.len();
        let mut payload = Vec::with_capacity(prefix.len() + first_take);
        payload.extend_from_slice(prefix);
        payload.extend_from_slice(&block[..first_take]);
        sink.send_frame(Frame::new(
            typ,
            base_flags | if last { end_headers } else { 0 },
            stream_id,
            payload,
        ))?;
        let mut offset = first_take;
        while !last {
            let take = (block.len() - offset).min(max_frame);
            last = offset + take == block.len();
            sink.send_frame(Frame::new(
                FrameType::Continuation,
                if last { end_headers } else { 0 },
                stream_id,
                Bytes::copy_from_slice(&block[offset..offset + take]),
            ))?;
            offset += take;
        }
        Ok(())
    }

    pub(crate) fn write_chunk(
        &self,
        stream: &Arc<StreamInner>,
        payload: &[u8],
        end_stream: bool,
        deadline: Option<Instant>,
    ) -> Result<(), Error> {
        if payload.is_empty() {
            let mut core = stream.core.lock().expect("stream core");
            if let Some(error) = &core.error {
                return Err(Error::Reset(error.clone()));
            }
            state::check_send_data(core.state)?;
            if end_stream {
                self.submit(Frame::new(
                    FrameType::Data,
                    DataFlags::END_STREAM.bits(),
                    stream.id,
                    Bytes::new(),
                ))?;
                let next = state::after_send_data_end(core.state);
                self.set_stream_state(stream, &mut core, next);
            }
            return Ok(());
        }

        let mut sent = 0usize;
        loop {
            let max_frame = self.their_settings.read().expect("peer settings")
                [SettingsParameter::MaxFrameSize] as usize;
            let mut conn_window = self.send_window.lock().expect("connection send window");
            let mut core = stream.core.lock().expect("stream core");
            if let Some(error) = &core.error {
                return Err(Error::Reset(error.clone()));
            }
            state::check_send_data(core.state)?;
            let stream_quota = core.send_window.available().max(0) as usize;
            let conn_quota = conn_window.available().max(0) as usize;
            let quota = (payload.len() - sent)
                .min(max_frame)
                .min(conn_quota)
                .min(stream_quota);
            if quota == 0 {
                let timed_out = if stream_quota == 0 {
                    drop(conn_window);
                    let (guard, timed_out) = wait_deadline(&stream.credit_cond, core, deadline);
                    drop(guard);
                    timed_out
                } else {
                    drop(core);
                    let (guard, timed_out) =
                        wait_deadline(&self.send_window_cond, conn_window, deadline);
                    drop(guard);
                    timed_out
                };
                if timed_out {
                    return Err(Error::Timeout);
                }
                continue;
            }

            let last = sent + quota == payload.len();
            let flags = if last && end_stream {
                DataFlags::END_STREAM.bits()
            } else {
                0
            };
            self.sink.lock().expect("frame sink").send_frame(Frame::new(
                FrameType::Data,
                flags,
                stream.id,
                Bytes::copy_from_slice(&payload[sent..sent + quota]),
            ))?;
            // unwrap: quota is bounded by both windows
            conn_window.consume(quota, Level::Connection).unwrap();
            core.send_window.consume(quota, Level::Stream).unwrap();
            core.stats.data_bytes_sent += quota as u64;
            sent += quota;
            if last {
                if end_stream {
                    let next = state::after_send_data_end(core.state);
                    self.set_stream_state(stream, &mut core, next);
                }
                return Ok(());
            }
        }
    }

    /// Tears the stream down locally: best-effort RST_STREAM (code 0), then
    /// drains unread chunks, returning their octets to the connection window
    /// in one aggregate update while the per-stream window is left alone.
    pub(crate) fn shutdown_stream(&self, stream: &Arc<StreamInner>) {
        let (send_reset, freed) = {
            let mut core = stream.core.lock().expect("stream core");
            let send_reset = !matches!(core.state, StreamState::Idle | StreamState::Closed);
            let mut freed: u64 = 0;
            while let Some(entry) = core.chunk_queue.pop_front() {
                if let ChunkEntry::Data(mut chunk) = entry {
                    freed += u64::from(chunk.take_ack());
                }
            }
            if send_reset {
                core.error
                    .get_or_insert(ProtocolError::stream(ErrorType::NoError, "stream shut down"));
            }
            if !core.state.is_closed() {
                self.set_stream_state(stream, &mut core, StreamState::Closed);
            }
            (send_reset, freed)
        };
        if send_reset {
            if let Err(err) = self.write_rst_stream(stream.id, ErrorType::NoError) {
                debug!("shutdown RST_STREAM failed: {err}");
            }
        }
        if freed > 0 {
            let replenished = self
                .recv_window
                .lock()
                .expect("connection recv window")
                .replenish(freed as u32, Level::Connection);
            match replenished {
                Ok(()) => {
                    if let Err(err) = self.write_window_update(0, freed) {
                        debug!("shutdown WINDOW_UPDATE failed: {err}");
                    }
                }
                Err(err) => warn!("shutdown window accounting: {err}"),
            }
        }
    }

    // ---- shared plumbing -------------------------------------------------

    fn create_stream(&self, id: StreamId) -> Arc<StreamInner> {
        let send_initial = self.their_settings.read().expect("peer settings")
            [SettingsParameter::InitialWindowSize];
        let recv_initial = self.our_settings.read().expect("local settings")
            [SettingsParameter::InitialWindowSize];
        let inner = Arc::new(StreamInner::new(id, send_initial, recv_initial));
        self.streams.insert(Arc::clone(&inner));
        self.tree.lock().expect("priority tree").insert(id);
        inner
    }

    /// Applies a lifecycle transition and its connection-wide side effects:
    /// active-stream accounting, priority-tree removal, and waking every
    /// waiter when the stream closes.
    pub(crate) fn set_stream_state(
        &self,
        stream: &StreamInner,
        core: &mut crate::stream::StreamCore,
        new: StreamState,
    ) {
        let old = core.set_state(stream.id, new);
        if old == new {
            return;
        }
        if old == StreamState::Idle && !new.is_closed() {
            self.streams.activated();
        }
        if old != StreamState::Idle && new.is_closed() {
            self.streams.deactivated();
        }
        if new.is_closed() {
            self.tree.lock().expect("priority tree").remove(stream.id);
            stream.headers_cond.notify_all();
            stream.chunks_cond.notify_all();
            stream.credit_cond.notify_all();
        }
    }

    pub(crate) fn close_stream(&self, stream: &StreamInner, error: Option<ProtocolError>) {
        let mut core = stream.core.lock().expect("stream core");
        if let Some(error) = error {
            core.error.get_or_insert(error);
        }
        if core.state.is_closed() {
            stream.headers_cond.notify_all();
            stream.chunks_cond.notify_all();
            stream.credit_cond.notify_all();
        } else {
            self.set_stream_state(stream, &mut core, StreamState::Closed);
        }
    }

    pub(crate) fn send_credit(&self) -> i64 {
        self.send_window
            .lock()
            .expect("connection send window")
            .available()
    }
}

fn strip_data_padding(payload: &Bytes, padded: bool) -> Result<Bytes, Error> {
    if !padded {
        return Ok(payload.clone());
    }
    let Some(&pad_len) = payload.first() else {
        return Err(ProtocolError::connection(
            ErrorType::FrameSizeError,
            "padded DATA frame without a pad length octet",
        )
        .into());
    };
    let pad_len = usize::from(pad_len);
    // Strict: the pad-length octet itself counts against the payload.
    if pad_len >= payload.len() {
        return Err(ProtocolError::connection(
            ErrorType::ProtocolError,
            "DATA padding as long as the payload",
        )
        .into());
    }
    let data_end = payload.len() - pad_len;
    if payload[data_end..].iter().any(|&octet| octet != 0) {
        return Err(ProtocolError::connection(
            ErrorType::ProtocolError,
            "non-zero padding octets",
        )
        .into());
    }
    Ok(payload.slice(1..data_end))
}

/// One HTTP/2 connection endpoint: streams, settings, and the frame
/// handlers behind them. The frame-reading multiplexer feeds
/// [`Connection::handle_frame`]; writers hand framed payloads back to the
/// [`FrameSink`] it was built over.
pub struct Connection {
    pub(crate) shared: Arc<ConnectionShared>,
}

impl Connection {
    #[must_use]
    pub fn new(role: Role, sink: Box<dyn FrameSink>) -> Self {
        Self {
            shared: Arc::new(ConnectionShared {
                role,
                sink: Mutex::new(sink),
                codec: Mutex::new(HeaderCodec::new()),
                our_settings: RwLock::new(default_settings()),
                pending_settings: Mutex::new(None),
                their_settings: RwLock::new(default_settings()),
                send_window: Mutex::new(FlowWindow::new(65_535)),
                send_window_cond: Condvar::new(),
                recv_window: Mutex::new(FlowWindow::new(65_535)),
                streams: StreamCoordinator::new(role),
                tree: Mutex::new(PriorityTree::new()),
                assembler: Mutex::new(None),
                pings: Mutex::new(HashMap::new()),
                goaway: Mutex::new(None),
                goaway_cond: Condvar::new(),
                incoming: Mutex::new(VecDeque::new()),
                incoming_cond: Condvar::new(),
            }),
        }
    }

    #[must_use]
    pub fn role(&self) -> Role {
        self.shared.role
    }

    /// Entry point for the connection multiplexer: one parsed frame header
    /// plus its payload. Unknown frame types are ignored. A returned
    /// stream-level error has already been answered with RST_STREAM and the
    /// connection remains usable; a connection-level error has emitted
    /// GOAWAY and the multiplexer should stop.
    pub fn handle_frame(
        &self,
        typ: u8,
        flags: u8,
        stream_id: StreamId,
        payload: Bytes,
    ) -> Result<(), Error> {
        self.shared.handle_frame(typ, flags, stream_id, payload)
    }

    /// Opens a new locally-initiated stream in idle state.
    pub fn new_stream(&self) -> Result<Stream, Error> {
        if self.shared.goaway.lock().expect("goaway state").is_some() {
            return Err(ProtocolError::stream(
                ErrorType::RefusedStream,
                "peer announced shutdown",
            )
            .into());
        }
        let id = self.shared.streams.allocate_local_id();
        let inner = self.shared.create_stream(id);
        Ok(Stream {
            inner,
            conn: Arc::clone(&self.shared),
        })
    }

    /// Sends a SETTINGS frame; the values bind once the peer acknowledges.
    pub fn send_settings(&self, params: &[(SettingsParameter, u32)]) -> Result<(), Error> {
        *self
            .shared
            .pending_settings
            .lock()
            .expect("pending settings") = Some(params.to_vec());
        let raw: Vec<(u16, u32)> = params
            .iter()
            // unwrap: SettingsParameter is repr(u16)
            .map(|(param, value)| (param.to_u16().unwrap(), *value))
            .collect();
        self.shared.submit(Frame::new(
            FrameType::Settings,
            0,
            0,
            pack_settings_payload(&raw),
        ))
    }

    /// Sends a PING and returns a handle that resolves on the matching ACK.
    pub fn ping(&self, payload: [u8; 8]) -> Result<PingHandle, Error> {
        let state = Arc::new((Mutex::new(false), Condvar::new()));
        self.shared
            .pings
            .lock()
            .expect("pending pings")
            .insert(payload, Arc::clone(&state));
        if let Err(err) =
            self.shared
                .submit(Frame::new(FrameType::Ping, 0, 0, payload.to_vec()))
        {
            self.shared
                .pings
                .lock()
                .expect("pending pings")
                .remove(&payload);
            return Err(err);
        }
        Ok(PingHandle { state })
    }

    /// Emits WINDOW_UPDATE frames totalling `increment` on the given stream
    /// (0 for the connection), splitting increments above 2^31-1.
    pub fn write_window_update(&self, stream_id: StreamId, increment: u64) -> Result<(), Error> {
        self.shared.write_window_update(stream_id, increment)
    }

    pub fn goaway(&self, code: ErrorType, debug_data: &[u8]) -> Result<(), Error> {
        self.shared.write_goaway(code, debug_data)
    }

    /// Next peer-initiated stream (a request on servers, a push on clients).
    pub fn next_incoming(&self, deadline: Option<Instant>) -> Result<Stream, Error> {
        let mut incoming = self.shared.incoming.lock().expect("incoming streams");
        loop {
            if let Some(inner) = incoming.pop_front() {
                return Ok(Stream {
                    inner,
                    conn: Arc::clone(&self.shared),
                });
            }
            let (guard, timed_out) = wait_deadline(&self.shared.incoming_cond, incoming, deadline);
            incoming = guard;
            if timed_out && incoming.is_empty() {
                return Err(Error::Timeout);
            }
        }
    }

    /// Shutdown horizon from received GOAWAY frames: the minimum
    /// last-stream-id observed and the latest error code.
    #[must_use]
    pub fn remote_goaway(&self) -> Option<(StreamId, ErrorType)> {
        *self.shared.goaway.lock().expect("goaway state")
    }

    /// Blocks until the peer announces shutdown or `deadline` elapses.
    pub fn wait_goaway(&self, deadline: Option<Instant>) -> Result<(StreamId, ErrorType), Error> {
        let mut goaway = self.shared.goaway.lock().expect("goaway state");
        loop {
            if let Some(horizon) = *goaway {
                return Ok(horizon);
            }
            let (guard, timed_out) = wait_deadline(&self.shared.goaway_cond, goaway, deadline);
            goaway = guard;
            if timed_out && goaway.is_none() {
                return Err(Error::Timeout);
            }
        }
    }

    /// Runs `hook` each time the last active stream closes. The hook runs
    /// under the counter lock and must not call back into the connection.
    pub fn set_idle_hook(&self, hook: impl FnMut() + Send + 'static) {
        self.shared.streams.set_idle_hook(Box::new(hook));
    }

    #[must_use]
    pub fn peer_settings(&self) -> EnumMap<SettingsParameter, u32> {
        self.shared.their_settings.read().expect("peer settings").clone()
    }

    #[must_use]
    pub fn local_settings(&self) -> EnumMap<SettingsParameter, u32> {
        self.shared.our_settings.read().expect("local settings").clone()
    }

    /// Connection-level credit still available for outgoing DATA.
    #[must_use]
    pub fn send_credit(&self) -> i64 {
        self.shared.send_credit()
    }
}
