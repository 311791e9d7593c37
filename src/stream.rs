use crate::connection::ConnectionShared;
use crate::flow::FlowWindow;
use crate::headers::Headers;
use crate::state::StreamState;
use crate::types::*;
use bytes::Bytes;
use derivative::Derivative;
use log::trace;
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Instant;

/// A unit of received DATA: the payload after padding strip, plus the
/// original on-wire length the window accounting owes the sender.
#[derive(Debug, Clone)]
pub struct Chunk {
    payload: Bytes,
    wire_len: u32,
    acked: bool,
}

impl Chunk {
    pub(crate) fn new(payload: Bytes, wire_len: u32) -> Self {
        Self {
            payload,
            wire_len,
            acked: false,
        }
    }

    /// A pseudo-chunk of zero on-wire length, as produced by `unget`; its
    /// ack never owes a window update.
    pub(crate) fn pseudo(payload: Bytes) -> Self {
        Self {
            payload,
            wire_len: 0,
            acked: true,
        }
    }

    #[must_use]
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    #[must_use]
    pub fn wire_len(&self) -> u32 {
        self.wire_len
    }

    /// Marks the owed window update as emitted. Returns the increment to
    /// credit, exactly once per chunk.
    pub(crate) fn take_ack(&mut self) -> u32 {
        if self.acked {
            return 0;
        }
        self.acked = true;
        self.wire_len
    }
}

/// Entries of the received-chunk queue; `End` is the END_STREAM sentinel
/// following the last real chunk.
#[derive(Debug)]
pub(crate) enum ChunkEntry {
    Data(Chunk),
    End,
}

/// Cumulative per-stream traffic counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamStats {
    pub header_blocks_sent: u64,
    pub header_blocks_received: u64,
    pub data_bytes_sent: u64,
    pub data_bytes_received: u64,
}

/// Mutable per-stream state, guarded by the stream mutex.
#[derive(Debug)]
pub(crate) struct StreamCore {
    pub state: StreamState,
    /// Stored RST_STREAM state (either direction); consumers observe it on
    /// every wait until the stream object is released.
    pub error: Option<ProtocolError>,
    /// Credit the peer granted us: what we may still send.
    pub send_window: FlowWindow,
    /// Credit we granted the peer: what it may still send.
    pub recv_window: FlowWindow,
    pub headers_queue: VecDeque<Headers>,
    pub chunk_queue: VecDeque<ChunkEntry>,
    pub stats: StreamStats,
    /// Completed header blocks received so far; index 1 is trailers.
    pub recv_blocks: u32,
}

impl StreamCore {
    pub(crate) fn new(send_initial: u32, recv_initial: u32) -> Self {
        Self {
            state: StreamState::Idle,
            error: None,
            send_window: FlowWindow::new(send_initial),
            recv_window: FlowWindow::new(recv_initial),
            headers_queue: VecDeque::new(),
            chunk_queue: VecDeque::new(),
            stats: StreamStats::default(),
            recv_blocks: 0,
        }
    }

    /// Applies a lifecycle transition. Ranks never regress; a caller asking
    /// for one has a bug, the peer cannot trigger this.
    pub(crate) fn set_state(&mut self, id: StreamId, new: StreamState) -> StreamState {
        let old = self.state;
        if new == old {
            return old;
        }
        assert!(
            new.rank() > old.rank(),
            "stream {id} state regressed {old:?} -> {new:?}"
        );
        trace!("stream {id} {old:?} -> {new:?}");
        self.state = new;
        old
    }
}

/// Shared per-stream object: one mutex, one condition per waiter class.
#[derive(Debug)]
pub(crate) struct StreamInner {
    pub id: StreamId,
    pub core: Mutex<StreamCore>,
    pub headers_cond: Condvar,
    pub chunks_cond: Condvar,
    pub credit_cond: Condvar,
}

impl StreamInner {
    pub(crate) fn new(id: StreamId, send_initial: u32, recv_initial: u32) -> Self {
        Self {
            id,
            core: Mutex::new(StreamCore::new(send_initial, recv_initial)),
            headers_cond: Condvar::new(),
            chunks_cond: Condvar::new(),
            credit_cond: Condvar::new(),
        }
    }
}

/// Waits on `cond` until signalled or the absolute deadline elapses.
/// Returns the reacquired guard and whether the deadline hit. Spurious
/// wakeups are the caller's loop to absorb.
pub(crate) fn wait_deadline<'a, T>(
    cond: &Condvar,
    guard: MutexGuard<'a, T>,
    deadline: Option<Instant>,
) -> (MutexGuard<'a, T>, bool) {
    match deadline {
        None => (cond.wait(guard).expect("condition wait"), false),
        Some(deadline) => {
            let now = Instant::now();
            if now >= deadline {
                return (guard, true);
            }
            let (guard, result) = cond
                .wait_timeout(guard, deadline - now)
                .expect("condition wait");
            (guard, result.timed_out())
        }
    }
}

/// Handle to one HTTP/2 stream. Clones share the same stream.
#[derive(Derivative, Clone)]
#[derivative(Debug)]
pub struct Stream {
    pub(crate) inner: Arc<StreamInner>,
    #[derivative(Debug = "ignore")]
    pub(crate) conn: Arc<ConnectionShared>,
}

impl Stream {
    #[must_use]
    pub fn id(&self) -> StreamId {
        self.inner.id
    }

    #[must_use]
    pub fn state(&self) -> StreamState {
        self.inner.core.lock().expect("stream core").state
    }

    #[must_use]
    pub fn stats(&self) -> StreamStats {
        self.inner.core.lock().expect("stream core").stats
    }

    /// Stream-level credit still available for outgoing DATA.
    #[must_use]
    pub fn send_credit(&self) -> i64 {
        self.inner
            .core
            .lock()
            .expect("stream core")
            .send_window
            .available()
    }

    /// Next received header block, blocking until one arrives, the stream
    /// closes, or `deadline` elapses. A close with stored RST_STREAM state
    /// yields that error; a plain close yields `None`.
    pub fn get_headers(&self, deadline: Option<Instant>) -> Result<Option<Headers>, Error> {
        let mut core = self.inner.core.lock().expect("stream core");
        loop {
            if let Some(headers) = core.headers_queue.pop_front() {
                return Ok(Some(headers));
            }
            if let Some(error) = &core.error {
                return Err(Error::Reset(error.clone()));
            }
            if core.state.is_closed() {
                return Ok(None);
            }
            let (guard, timed_out) = wait_deadline(&self.inner.headers_cond, core, deadline);
            core = guard;
            if timed_out && core.headers_queue.is_empty() && !core.state.is_closed() {
                return Err(Error::Timeout);
            }
        }
    }

    /// Next received DATA payload. Acks the chunk, crediting the stream and
    /// connection windows by its on-wire length. `None` signals END_STREAM.
    pub fn get_next_chunk(&self, deadline: Option<Instant>) -> Result<Option<Bytes>, Error> {
        let entry = {
            let mut core = self.inner.core.lock().expect("stream core");
            loop {
                if let Some(entry) = core.chunk_queue.pop_front() {
                    break entry;
                }
                if let Some(error) = &core.error {
                    return Err(Error::Reset(error.clone()));
                }
                if core.state.is_closed() {
                    return Ok(None);
                }
                let (guard, timed_out) = wait_deadline(&self.inner.chunks_cond, core, deadline);
                core = guard;
                if timed_out && core.chunk_queue.is_empty() && !core.state.is_closed() {
                    return Err(Error::Timeout);
                }
            }
        };
        match entry {
            ChunkEntry::Data(mut chunk) => {
                self.conn.ack_chunk(&self.inner, &mut chunk)?;
                Ok(Some(chunk.payload))
            }
            ChunkEntry::End => Ok(None),
        }
    }

    /// Pushes bytes back to the front of the chunk queue. The pseudo-chunk
    /// has zero on-wire length, so releasing it owes no window update.
    pub fn unget(&self, payload: impl Into<Bytes>) {
        let mut core = self.inner.core.lock().expect("stream core");
        core.chunk_queue
            .push_front(ChunkEntry::Data(Chunk::pseudo(payload.into())));
        self.inner.chunks_cond.notify_all();
    }

    /// Encodes and sends one header block, fragmented across HEADERS and
    /// CONTINUATION frames as the peer's max frame size requires.
    pub fn write_headers(&self, headers: &Headers, end_stream: bool) -> Result<(), Error> {
        self.conn.write_headers(&self.inner, headers, end_stream)
    }

    /// Reserves a pushed stream and announces it with PUSH_PROMISE carrying
    /// the given request headers. Server endpoints only.
    pub fn push_promise(&self, request: &Headers) -> Result<Stream, Error> {
        let inner = self.conn.push_promise(&self.inner, request)?;
        Ok(Stream {
            inner,
            conn: Arc::clone(&self.conn),
        })
    }

    /// Sends `payload` as DATA frames, suspending while stream or connection
    /// credit is exhausted. Frames are sized to the available credit and the
    /// peer's max frame size; only the final frame carries END_STREAM.
    pub fn write_chunk(
        &self,
        payload: &[u8],
        end_stream: bool,
        deadline: Option<Instant>,
    ) -> Result<(), Error> {
        self.conn
            .write_chunk(&self.inner, payload, end_stream, deadline)
    }

    /// Abandons the stream: best-effort RST_STREAM, then drains the receive
    /// queue, returning the freed window to the connection in one aggregate
    /// update while skipping per-stream updates.
    pub fn shutdown(&self) {
        self.conn.shutdown_stream(&self.inner);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_ack_is_idempotent() {
        let mut chunk = Chunk::new(Bytes::from_static(b"hi"), 6);
        assert_eq!(chunk.take_ack(), 6);
        assert_eq!(chunk.take_ack(), 0);
    }

    #[test]
    fn pseudo_chunk_acks_to_nothing() {
        let mut chunk = Chunk::pseudo(Bytes::from_static(b"back"));
        assert_eq!(chunk.wire_len(), 0);
        assert_eq!(chunk.take_ack(), 0);
    }

    #[test]
    fn state_regression_panics() {
        let mut core = StreamCore::new(65_535, 65_535);
        core.set_state(1, StreamState::Open);
        core.set_state(1, StreamState::Open);
        core.set_state(1, StreamState::Closed);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            core.set_state(1, StreamState::Open);
        }));
        assert!(result.is_err());
    }

    #[test]
    fn wait_deadline_times_out() {
        let pair = (Mutex::new(()), Condvar::new());
        let guard = pair.0.lock().unwrap();
        let deadline = Instant::now() + std::time::Duration::from_millis(10);
        let (_guard, timed_out) = wait_deadline(&pair.1, guard, Some(deadline));
        assert!(timed_out);
    }
}
