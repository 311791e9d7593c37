mod util;

use http2_core::{
    parse_window_update, DataFlags, ErrorType, Frame, FrameType, Headers, Level,
    pack_settings_payload, SettingsFlags, SettingsParameter, U31_MAX,
};
use std::thread;
use util::{deliver, expect_protocol, pair, soon};

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
fn padded_data_acks_the_full_wire_length() -> anyhow::Result<()> {
    let (client, _server) = pair();
    let stream = client.conn.new_stream()?;
    stream.write_headers(&request_headers(), false)?;
    client.take_frames();

    // pad-length octet + "hi" + three zero octets: six octets on the wire.
    let payload = vec![3u8, b'h', b'i', 0, 0, 0];
    deliver(
        &client.conn,
        &Frame::new(
            FrameType::Data,
            (DataFlags::PADDED | DataFlags::END_STREAM).bits(),
            1,
            payload,
        ),
    )?;

    assert_eq!(stream.get_next_chunk(soon())?.as_deref(), Some(&b"hi"[..]));
    let frames = client.take_frames();
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0].typ, FrameType::WindowUpdate);
    assert_eq!(frames[0].stream_id, 0);
    assert_eq!(parse_window_update(&frames[0].payload).unwrap(), 6);
    assert_eq!(frames[1].stream_id, 1);
    assert_eq!(parse_window_update(&frames[1].payload).unwrap(), 6);

    assert_eq!(stream.get_next_chunk(soon())?, None);
    Ok(())
}

#[test]
fn nonzero_padding_is_rejected() -> anyhow::Result<()> {
    let (client, _server) = pair();
    let stream = client.conn.new_stream()?;
    stream.write_headers(&request_headers(), false)?;
    client.take_frames();

    let payload = vec![2u8, b'h', b'i', 0, 7];
    let err = expect_protocol(deliver(
        &client.conn,
        &Frame::new(FrameType::Data, DataFlags::PADDED.bits(), 1, payload),
    ));
    assert_eq!(err.code, ErrorType::ProtocolError);

    // Strict boundary: a pad length equal to the payload length is invalid.
    let payload = vec![4u8, 0, 0, 0];
    let err = expect_protocol(deliver(
        &client.conn,
        &Frame::new(FrameType::Data, DataFlags::PADDED.bits(), 1, payload),
    ));
    assert_eq!(err.code, ErrorType::ProtocolError);
    Ok(())
}

#[test]
fn write_chunk_stalls_until_credit_arrives() -> anyhow::Result<()> {
    let (client, server) = pair();

    // The peer grants ten octets of stream window to begin with.
    server
        .conn
        .send_settings(&[(SettingsParameter::InitialWindowSize, 10)])?;
    server.pump_into(&client);
    client.pump_into(&server);

    let stream = client.conn.new_stream()?;
    stream.write_headers(&request_headers(), false)?;
    client.take_frames();

    let writer = stream.clone();
    let worker = thread::spawn(move || writer.write_chunk(&[0x42; 25], true, None));

    let first = client.next_frame();
    assert_eq!(first.typ, FrameType::Data);
    assert_eq!(first.payload.len(), 10);
    assert_eq!(first.flags & DataFlags::END_STREAM.bits(), 0);

    deliver(
        &client.conn,
        &Frame::new(FrameType::WindowUpdate, 0, 1, 100u32.to_be_bytes().to_vec()),
    )?;

    let second = client.next_frame();
    assert_eq!(second.typ, FrameType::Data);
    assert_eq!(second.payload.len(), 15);
    assert_ne!(second.flags & DataFlags::END_STREAM.bits(), 0);

    worker.join().expect("writer thread")?;
    assert_eq!(stream.send_credit(), 10 - 25 + 100);
    assert_eq!(client.conn.send_credit(), 65_535 - 25);
    Ok(())
}

#[test]
fn zero_window_update_is_a_protocol_error() -> anyhow::Result<()> {
    let (client, _server) = pair();
    let err = expect_protocol(deliver(
        &client.conn,
        &Frame::new(FrameType::WindowUpdate, 0, 0, 0u32.to_be_bytes().to_vec()),
    ));
    assert_eq!(err.code, ErrorType::ProtocolError);
    assert_eq!(err.level, Level::Connection);
    let frames = client.take_frames();
    assert_eq!(frames.last().map(|frame| frame.typ), Some(FrameType::GoAway));
    Ok(())
}

#[test]
fn window_saturation_is_a_flow_control_error() -> anyhow::Result<()> {
    let (client, _server) = pair();
    let stream = client.conn.new_stream()?;
    stream.write_headers(&request_headers(), false)?;
    client.take_frames();

    let err = expect_protocol(deliver(
        &client.conn,
        &Frame::new(
            FrameType::WindowUpdate,
            0,
            1,
            U31_MAX.to_be_bytes().to_vec(),
        ),
    ));
    assert_eq!(err.code, ErrorType::FlowControlError);
    assert_eq!(err.level, Level::Stream);
    let frames = client.take_frames();
    let reset = frames.last().expect("an outbound frame");
    assert_eq!(reset.typ, FrameType::ResetStream);
    assert_eq!(&reset.payload[..], &0x3u32.to_be_bytes()[..]);
    Ok(())
}

#[test]
fn oversized_window_update_is_split() -> anyhow::Result<()> {
    let (client, _server) = pair();
    client.conn.write_window_update(1, 1u64 << 32)?;
    let increments: Vec<u32> = client
        .take_frames()
        .iter()
        .map(|frame| {
            assert_eq!(frame.typ, FrameType::WindowUpdate);
            assert_eq!(frame.stream_id, 1);
            parse_window_update(&frame.payload).unwrap()
        })
        .collect();
    assert_eq!(increments, vec![U31_MAX, U31_MAX, 2]);
    Ok(())
}

#[test]
fn max_frame_size_boundary() -> anyhow::Result<()> {
    let (_client, server) = pair();

    let err = expect_protocol(deliver(
        &server.conn,
        &Frame::new(
            FrameType::Settings,
            0,
            0,
            pack_settings_payload(&[(0x5, 16_383)]),
        ),
    ));
    assert_eq!(err.code, ErrorType::ProtocolError);
    server.take_frames();

    deliver(
        &server.conn,
        &Frame::new(
            FrameType::Settings,
            0,
            0,
            pack_settings_payload(&[(0x5, 16_384)]),
        ),
    )?;
    assert_eq!(
        server.conn.peer_settings()[SettingsParameter::MaxFrameSize],
        16_384
    );
    let frames = server.take_frames();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].typ, FrameType::Settings);
    assert_ne!(frames[0].flags & SettingsFlags::ACK.bits(), 0);
    assert!(frames[0].payload.is_empty());
    Ok(())
}

#[test]
fn ping_acknowledges_with_the_same_payload() -> anyhow::Result<()> {
    let (client, server) = pair();
    let handle = client.conn.ping(*b"01234567")?;
    client.pump_into(&server);
    let replies = server.pump_into(&client);
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].typ, FrameType::Ping);
    assert_eq!(&replies[0].payload[..], b"01234567");
    handle.wait(soon())?;
    Ok(())
}

#[test]
fn unget_replays_without_further_window_updates() -> anyhow::Result<()> {
    let (client, _server) = pair();
    let stream = client.conn.new_stream()?;
    stream.write_headers(&request_headers(), false)?;
    client.take_frames();

    deliver(
        &client.conn,
        &Frame::new(FrameType::Data, 0, 1, b"hello".to_vec()),
    )?;
    assert_eq!(
        stream.get_next_chunk(soon())?.as_deref(),
        Some(&b"hello"[..])
    );
    assert_eq!(client.take_frames().len(), 2);

    stream.unget(&b"he"[..]);
    assert_eq!(stream.get_next_chunk(soon())?.as_deref(), Some(&b"he"[..]));
    assert!(client.take_frames().is_empty());
    Ok(())
}
