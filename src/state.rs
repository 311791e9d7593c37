use crate::types::*;

/// https://httpwg.org/specs/rfc7540.html#StreamStates
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StreamState {
    Idle,
    ReservedLocal,
    ReservedRemote,
    Open,
    HalfClosedLocal,
    HalfClosedRemote,
    Closed,
}

impl StreamState {
    /// Lifecycle rank. Transitions never decrease it; a regression is a
    /// programming error, not a peer error.
    #[must_use]
    pub fn rank(self) -> u8 {
        match self {
            StreamState::Idle => 1,
            StreamState::ReservedLocal | StreamState::ReservedRemote | StreamState::Open => 2,
            StreamState::HalfClosedLocal | StreamState::HalfClosedRemote => 3,
            StreamState::Closed => 4,
        }
    }

    #[must_use]
    pub fn is_closed(self) -> bool {
        self == StreamState::Closed
    }
}

/// State after the local endpoint sends a HEADERS frame, or why it may not.
pub fn after_send_headers(state: StreamState, end_stream: bool) -> Result<StreamState, ProtocolError> {
    Ok(match state {
        StreamState::Idle => {
            if end_stream {
                StreamState::HalfClosedLocal
            } else {
                StreamState::Open
            }
        }
        StreamState::ReservedLocal => {
            if end_stream {
                StreamState::Closed
            } else {
                StreamState::HalfClosedRemote
            }
        }
        StreamState::Open => {
            if end_stream {
                StreamState::HalfClosedLocal
            } else {
                StreamState::Open
            }
        }
        StreamState::HalfClosedRemote => {
            if end_stream {
                StreamState::Closed
            } else {
                StreamState::HalfClosedRemote
            }
        }
        StreamState::ReservedRemote | StreamState::HalfClosedLocal | StreamState::Closed => {
            return Err(ProtocolError::stream(
                ErrorType::StreamClosed,
                "sending HEADERS on a closed sending side",
            ))
        }
    })
}

/// State after the peer's HEADERS frame is admitted, or the violation it
/// constitutes. HEADERS is valid in idle, open, half closed (local), and
/// reserved (remote).
pub fn after_recv_headers(state: StreamState, end_stream: bool) -> Result<StreamState, ProtocolError> {
    Ok(match state {
        StreamState::Idle | StreamState::Open => {
            if end_stream {
                StreamState::HalfClosedRemote
            } else {
                StreamState::Open
            }
        }
        StreamState::ReservedRemote => {
            if end_stream {
                StreamState::Closed
            } else {
                StreamState::HalfClosedLocal
            }
        }
        StreamState::HalfClosedLocal => {
            if end_stream {
                StreamState::Closed
            } else {
                StreamState::HalfClosedLocal
            }
        }
        StreamState::ReservedLocal => {
            return Err(ProtocolError::connection(
                ErrorType::ProtocolError,
                "HEADERS received on a reserved (local) stream",
            ))
        }
        StreamState::HalfClosedRemote | StreamState::Closed => {
            return Err(ProtocolError::stream(
                ErrorType::StreamClosed,
                "HEADERS received after the peer closed its sending side",
            ))
        }
    })
}

/// DATA is valid only in open and half closed (local); on an idle or
/// reserved (remote) stream it is a connection-level PROTOCOL_ERROR, in
/// other states a stream-level STREAM_CLOSED.
pub fn check_recv_data(state: StreamState) -> Result<(), ProtocolError> {
    match state {
        StreamState::Open | StreamState::HalfClosedLocal => Ok(()),
        StreamState::Idle | StreamState::ReservedRemote => Err(ProtocolError::connection(
            ErrorType::ProtocolError,
            "DATA received on an idle or reserved stream",
        )),
        _ => Err(ProtocolError::stream(
            ErrorType::StreamClosed,
            "DATA received after the peer closed its sending side",
        )),
    }
}

#[must_use]
pub fn after_recv_data_end(state: StreamState) -> StreamState {
    match state {
        StreamState::Open => StreamState::HalfClosedRemote,
        StreamState::HalfClosedLocal => StreamState::Closed,
        other => other,
    }
}

pub fn check_send_data(state: StreamState) -> Result<(), ProtocolError> {
    match state {
        StreamState::Open | StreamState::HalfClosedRemote => Ok(()),
        _ => Err(ProtocolError::stream(
            ErrorType::StreamClosed,
            "sending DATA on a closed sending side",
        )),
    }
}

#[must_use]
pub fn after_send_data_end(state: StreamState) -> StreamState {
    match state {
        StreamState::Open => StreamState::HalfClosedLocal,
        StreamState::HalfClosedRemote => StreamState::Closed,
        other => other,
    }
}

/// RST_STREAM is forbidden on idle streams.
pub fn check_recv_reset(state: StreamState) -> Result<(), ProtocolError> {
    if state == StreamState::Idle {
        return Err(ProtocolError::connection(
            ErrorType::ProtocolError,
            "RST_STREAM received on an idle stream",
        ));
    }
    Ok(())
}

/// WINDOW_UPDATE is forbidden on idle streams.
pub fn check_recv_window_update(state: StreamState) -> Result<(), ProtocolError> {
    if state == StreamState::Idle {
        return Err(ProtocolError::connection(
            ErrorType::ProtocolError,
            "WINDOW_UPDATE received on an idle stream",
        ));
    }
    Ok(())
}
