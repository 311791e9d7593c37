#![warn(future_incompatible, nonstandard_style, rust_2018_idioms, unused)]
#![warn(clippy::pedantic)]
#![allow(
    clippy::doc_markdown,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::wildcard_imports,
    clippy::similar_names,
    clippy::cast_possible_truncation,
)]

mod assembly;
mod connection;
mod flags;
mod flow;
mod frame;
mod headers;
mod priority;
mod state;
mod stream;
mod stream_coordinator;
mod types;

pub use assembly::MAX_HEADER_BUFFER_SIZE;
pub use bytes::Bytes;
pub use connection::{Connection, PingHandle};
pub use flags::{
    ContinuationFlags, DataFlags, HeadersFlags, PingFlags, PushPromiseFlags, SettingsFlags,
};
pub use frame::{
    pack_settings_payload, parse_error_code, parse_frame_header, parse_settings_payload,
    parse_window_update, Frame, FrameSink, PrioritySpec, FRAME_HEADER_LEN,
};
pub use headers::{validate_received_block, BlockDirection, Headers};
pub use state::StreamState;
pub use stream::{Chunk, Stream, StreamStats};
pub use types::{
    default_settings, Error, ErrorType, FrameType, Level, ProtocolError, Role, SettingsParameter,
    StreamId, U31_MAX,
};
