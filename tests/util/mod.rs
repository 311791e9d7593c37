//! Two connection endpoints joined by frame channels, standing in for the
//! transport and the read loop.
#![allow(dead_code)]

use http2_core::{Connection, Error, Frame, Role};
use std::sync::mpsc::{channel, Receiver};
use std::time::{Duration, Instant};

pub struct TestConn {
    pub conn: Connection,
    outbound: Receiver<Frame>,
}

impl TestConn {
    pub fn new(role: Role) -> Self {
        let (tx, rx) = channel();
        Self {
            conn: Connection::new(role, Box::new(tx)),
            outbound: rx,
        }
    }

    /// Drains this endpoint's queued outbound frames without delivering
    /// them anywhere.
    pub fn take_frames(&self) -> Vec<Frame> {
        self.outbound.try_iter().collect()
    }

    /// Blocks briefly for the next outbound frame; for watching a writer
    /// that runs on another thread.
    pub fn next_frame(&self) -> Frame {
        self.outbound
            .recv_timeout(Duration::from_secs(2))
            .expect("expected an outbound frame")
    }

    /// Delivers every queued outbound frame to `peer`, panicking on any
    /// handler error. Returns the delivered frames for inspection.
    pub fn pump_into(&self, peer: &TestConn) -> Vec<Frame> {
        let frames = self.take_frames();
        for frame in &frames {
            peer.conn
                .handle_frame(
                    frame.type_byte(),
                    frame.flags,
                    frame.stream_id,
                    frame.payload.clone(),
                )
                .unwrap_or_else(|err| panic!("{:?} frame rejected: {err}", frame.typ));
        }
        frames
    }
}

/// Hands one crafted frame to a connection, as the multiplexer would.
pub fn deliver(conn: &Connection, frame: &Frame) -> Result<(), Error> {
    conn.handle_frame(
        frame.type_byte(),
        frame.flags,
        frame.stream_id,
        frame.payload.clone(),
    )
}

pub fn pair() -> (TestConn, TestConn) {
    let _ = env_logger::builder().is_test(true).try_init();
    (TestConn::new(Role::Client), TestConn::new(Role::Server))
}

pub fn soon() -> Option<Instant> {
    Some(Instant::now() + Duration::from_secs(2))
}

pub fn expect_protocol(result: Result<(), Error>) -> http2_core::ProtocolError {
    match result {
        Err(Error::Protocol(protocol)) => protocol,
        other => panic!("expected a protocol error, got {other:?}"),
    }
}
