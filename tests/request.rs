mod util;

use http2_core::{FrameType, Headers, HeadersFlags, StreamState};
use maplit::hashmap;
use std::collections::HashMap;
use util::{pair, soon};

fn request_headers() -> Headers {
    [
        (":method", "GET"),
        (":scheme", "https"),
        (":path", "/"),
        (":authority", "example.com"),
    ]
    .into_iter()
    .collect()
}

#[test]
fn simple_request() -> anyhow::Result<()> {
    let (client, server) = pair();

    let stream = client.conn.new_stream()?;
    assert_eq!(stream.id(), 1);
    stream.write_headers(&request_headers(), true)?;
    assert_eq!(stream.state(), StreamState::HalfClosedLocal);
    client.pump_into(&server);

    let incoming = server.conn.next_incoming(soon())?;
    assert_eq!(incoming.id(), 1);
    assert_eq!(incoming.state(), StreamState::HalfClosedRemote);
    let request = incoming.get_headers(soon())?.expect("request headers");
    assert_eq!(request.get_one(":method"), Some("GET"));
    assert_eq!(request.get_one(":authority"), Some("example.com"));

    let response: Headers = [(":status", "200"), ("content-type", "text/plain")]
        .into_iter()
        .collect();
    incoming.write_headers(&response, false)?;
    incoming.write_chunk(b"hello", true, None)?;
    assert_eq!(incoming.state(), StreamState::Closed);
    // The five octets of "hello" came out of both server-side ledgers.
    assert_eq!(server.conn.send_credit(), 65_535 - 5);
    assert_eq!(incoming.send_credit(), 65_535 - 5);
    // The client sent no DATA at all.
    assert_eq!(client.conn.send_credit(), 65_535);
    server.pump_into(&client);

    let got = stream.get_headers(soon())?.expect("response headers");
    let got: HashMap<String, String> = got
        .iter()
        .map(|(name, value)| (name.to_owned(), value.to_owned()))
        .collect();
    assert_eq!(
        got,
        hashmap! {
            ":status".to_owned() => "200".to_owned(),
            "content-type".to_owned() => "text/plain".to_owned(),
        }
    );
    assert_eq!(
        stream.get_next_chunk(soon())?.as_deref(),
        Some(&b"hello"[..])
    );
    assert_eq!(stream.get_next_chunk(soon())?, None);
    assert_eq!(stream.state(), StreamState::Closed);

    // Releasing the chunk owed the server its window back.
    client.pump_into(&server);
    assert_eq!(server.conn.send_credit(), 65_535);

    let stats = incoming.stats();
    assert_eq!(stats.header_blocks_received, 1);
    assert_eq!(stats.header_blocks_sent, 1);
    assert_eq!(stats.data_bytes_sent, 5);
    Ok(())
}

#[test]
fn headers_fragment_across_continuations() -> anyhow::Result<()> {
    let (client, server) = pair();

    let stream = client.conn.new_stream()?;
    let mut request = request_headers();
    request.push("cookie", "c".repeat(40_000));
    stream.write_headers(&request, true)?;

    let frames = client.pump_into(&server);
    assert!(frames.len() >= 3, "expected fragmentation, got {frames:?}");
    assert_eq!(frames[0].typ, FrameType::Headers);
    assert_eq!(
        frames[0].flags & HeadersFlags::END_HEADERS.bits(),
        0,
        "first fragment must not end the block"
    );
    assert_ne!(frames[0].flags & HeadersFlags::END_STREAM.bits(), 0);
    for frame in &frames[1..] {
        assert_eq!(frame.typ, FrameType::Continuation);
        assert!(frame.payload.len() <= 16_384);
    }
    let (middle, last) = frames[1..].split_at(frames.len() - 2);
    for frame in middle {
        assert_eq!(frame.flags, 0);
    }
    assert_ne!(last[0].flags & HeadersFlags::END_HEADERS.bits(), 0);

    // Reassembly yields the same list a single-frame encoding would.
    let incoming = server.conn.next_incoming(soon())?;
    let got = incoming.get_headers(soon())?.expect("request headers");
    assert_eq!(got, request);
    Ok(())
}

#[test]
fn trailers_follow_all_data() -> anyhow::Result<()> {
    let (client, server) = pair();

    let stream = client.conn.new_stream()?;
    stream.write_headers(&request_headers(), false)?;
    stream.write_chunk(b"payload", false, None)?;
    let trailers: Headers = [("grpc-status", "0")].into_iter().collect();
    stream.write_headers(&trailers, true)?;
    client.pump_into(&server);

    let incoming = server.conn.next_incoming(soon())?;
    let request = incoming.get_headers(soon())?.expect("request headers");
    assert!(request.has(":method"));
    assert_eq!(
        incoming.get_next_chunk(soon())?.as_deref(),
        Some(&b"payload"[..])
    );
    let got = incoming.get_headers(soon())?.expect("trailers");
    assert_eq!(got.get_one("grpc-status"), Some("0"));
    assert_eq!(incoming.stats().header_blocks_received, 2);
    assert_eq!(incoming.state(), StreamState::HalfClosedRemote);
    Ok(())
}

#[test]
fn server_push_reaches_the_client() -> anyhow::Result<()> {
    let (client, server) = pair();

    let stream = client.conn.new_stream()?;
    stream.write_headers(&request_headers(), false)?;
    client.pump_into(&server);

    let incoming = server.conn.next_incoming(soon())?;
    let mut push_request = request_headers();
    push_request.push("accept", "text/css");
    let promised = incoming.push_promise(&push_request)?;
    assert_eq!(promised.id(), 2);
    assert_eq!(promised.state(), StreamState::ReservedLocal);
    let response: Headers = [(":status", "200")].into_iter().collect();
    promised.write_headers(&response, true)?;
    assert_eq!(promised.state(), StreamState::Closed);
    server.pump_into(&client);

    let pushed = client.conn.next_incoming(soon())?;
    assert_eq!(pushed.id(), 2);
    let announced = pushed.get_headers(soon())?.expect("promised request");
    assert_eq!(announced.get_one("accept"), Some("text/css"));
    let got = pushed.get_headers(soon())?.expect("pushed response");
    assert_eq!(got.get_one(":status"), Some("200"));
    assert_eq!(pushed.state(), StreamState::Closed);
    Ok(())
}

#[test]
fn get_headers_times_out_without_traffic() -> anyhow::Result<()> {
    let (client, _server) = pair();
    let stream = client.conn.new_stream()?;
    stream.write_headers(&request_headers(), false)?;
    let deadline = std::time::Instant::now() + std::time::Duration::from_millis(30);
    assert_eq!(
        stream.get_headers(Some(deadline)),
        Err(http2_core::Error::Timeout)
    );
    Ok(())
}
