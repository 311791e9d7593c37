use enum_map::{enum_map, EnumMap};
use num_derive::{FromPrimitive, ToPrimitive};
use std::borrow::Cow;

/// Largest value representable in a 31-bit field: the flow-control cap and
/// the stream id mask.
pub const U31_MAX: u32 = u32::MAX >> 1;

pub type StreamId = u32;

/// Which side of the connection this endpoint is. Pushed streams and the
/// request/response orientation of header validation follow from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Client,
    Server,
}

impl Role {
    /// First stream id this endpoint may allocate (clients odd, servers even).
    #[must_use]
    pub fn first_local_id(self) -> StreamId {
        match self {
            Role::Client => 1,
            Role::Server => 2,
        }
    }
}

/// https://httpwg.org/specs/rfc7540.html#FrameTypes
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, FromPrimitive, ToPrimitive)]
#[repr(u8)]
pub enum FrameType {
    Data = 0x0,
    Headers = 0x1,
    Priority = 0x2,
    ResetStream = 0x3,
    Settings = 0x4,
    PushPromise = 0x5,
    Ping = 0x6,
    GoAway = 0x7,
    WindowUpdate = 0x8,
    Continuation = 0x9,
}

/// https://httpwg.org/specs/rfc7540.html#ErrorCodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, FromPrimitive, ToPrimitive)]
#[repr(u32)]
#[non_exhaustive]
pub enum ErrorType {
    NoError = 0x0,
    ProtocolError = 0x1,
    InternalError = 0x2,
    FlowControlError = 0x3,
    SettingsTimeout = 0x4,
    StreamClosed = 0x5,
    FrameSizeError = 0x6,
    RefusedStream = 0x7,
    Cancel = 0x8,
    CompressionError = 0x9,
    ConnectError = 0xa,
    EnhanceYourCalm = 0xb,
    InadequateSecurity = 0xc,
    Http11Required = 0xd,
}

/// https://httpwg.org/specs/rfc7540.html#SettingValues
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    FromPrimitive,
    ToPrimitive,
    enum_map::Enum,
)]
#[repr(u16)]
#[non_exhaustive]
pub enum SettingsParameter {
    /// Maximum size of the header compression table used to decode header
    /// blocks, in octets. The initial value is 4,096 octets.
    HeaderTableSize = 0x1,
    /// 0 disables server push. Any value other than 0 or 1 MUST be treated as
    /// a connection error (Section 5.4.1) of type PROTOCOL_ERROR.
    EnablePush = 0x2,
    /// Maximum number of concurrent streams that the sender will allow.
    MaxConcurrentStreams = 0x3,
    /// The sender's initial window size (in octets) for stream-level flow
    /// control. Values above 2^31-1 MUST be treated as a connection error of
    /// type FLOW_CONTROL_ERROR.
    InitialWindowSize = 0x4,
    /// Size of the largest frame payload the sender is willing to receive.
    /// Values outside [2^14, 2^24-1] MUST be treated as a connection error of
    /// type PROTOCOL_ERROR.
    MaxFrameSize = 0x5,
    /// Advisory maximum size of the header list the sender will accept.
    MaxHeaderListSize = 0x6,
}

/// Settings initially assumed for either peer, per RFC 7540 Section 11.3.
#[must_use]
pub fn default_settings() -> EnumMap<SettingsParameter, u32> {
    enum_map! {
        SettingsParameter::HeaderTableSize => 4096,
        SettingsParameter::EnablePush => 1,
        SettingsParameter::MaxConcurrentStreams => u32::MAX,
        SettingsParameter::InitialWindowSize => 65_535,
        SettingsParameter::MaxFrameSize => 16_384,
        SettingsParameter::MaxHeaderListSize => u32::MAX,
    }
}

/// Whether an error condemns one stream or the whole connection.
///
/// https://httpwg.org/specs/rfc7540.html#ErrorHandler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Level {
    /// Reset this stream; the connection continues.
    Stream,
    /// Terminate the connection via GOAWAY.
    Connection,
}

/// A protocol violation carrying its RFC error code, severity, and a
/// human-readable diagnostic.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{level:?}-level {code:?}: {message}")]
pub struct ProtocolError {
    pub code: ErrorType,
    pub level: Level,
    pub message: Cow<'static, str>,
}

impl ProtocolError {
    pub fn stream(code: ErrorType, message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            code,
            level: Level::Stream,
            message: message.into(),
        }
    }

    pub fn connection(code: ErrorType, message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            code,
            level: Level::Connection,
            message: message.into(),
        }
    }
}

/// Errors surfaced to consumers and writers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    /// The stream was torn down by RST_STREAM (either direction); carries the
    /// stored reset state.
    #[error("stream reset: {0}")]
    Reset(ProtocolError),
    #[error("deadline elapsed")]
    Timeout,
    #[error("frame sink: {0}")]
    Io(String),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
