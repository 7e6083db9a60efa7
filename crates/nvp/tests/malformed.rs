//! Protocol robustness against frames that do not decode.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use nvp::msg::{Message, Opcode, errno};
use nvp_server::VolumeBackend;

mod common;
use common::TestServer;

fn frame_bytes(header: &[u8]) -> Vec<u8> {
    let frame_len = (4 + header.len()) as u32;
    let mut out = Vec::with_capacity(8 + header.len());
    out.extend_from_slice(&frame_len.to_be_bytes());
    out.extend_from_slice(&(header.len() as u32).to_be_bytes());
    out.extend_from_slice(header);
    out
}

fn read_frame(stream: &mut TcpStream) -> (Vec<u8>, Vec<u8>) {
    let mut len = [0u8; 4];
    stream.read_exact(&mut len).expect("frame length");
    let frame_len = u32::from_be_bytes(len) as usize;
    let mut frame = vec![0u8; frame_len];
    stream.read_exact(&mut frame).expect("frame body");
    let header_len = u32::from_be_bytes(frame[..4].try_into().unwrap()) as usize;
    let data = frame.split_off(4 + header_len);
    (frame.split_off(4), data)
}

#[test_log::test]
fn undecodable_request_header_gets_error_rsp_and_spares_the_session() {
    let server = TestServer::start_default();
    server.backend.create_volume("v", 4096).unwrap();

    let uri: nvp::transport::Uri = server.uri.parse().unwrap();
    let mut stream = TcpStream::connect(uri.authority()).expect("raw connect");
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();

    // One garbage header followed by a valid request on the same session.
    stream.write_all(&frame_bytes(&[0xc1, 0xde, 0xad])).unwrap();
    stream
        .write_all(&frame_bytes(&Message::list_volumes_req(42).encode().unwrap()))
        .unwrap();
    stream.flush().unwrap();

    let mut got_error = false;
    let mut got_list = false;
    for _ in 0..2 {
        let (header, data) = read_frame(&mut stream);
        let reply = Message::decode(&header).expect("reply decodes");
        match reply.opcode {
            Opcode::ErrorRsp => {
                assert_eq!(reply.retval, -1);
                assert_eq!(reply.errval, errno::EBADMSG);
                got_error = true;
            }
            Opcode::ListVolumesRsp => {
                assert_eq!(reply.opaque, 42);
                assert_eq!(reply.retval, 1);
                let names = nvp::msg::unpack_names(&data).unwrap();
                assert_eq!(names, ["v"]);
                got_list = true;
            }
            other => panic!("unexpected reply {other}"),
        }
    }
    assert!(got_error && got_list);

    // The session survived: another request still gets served.
    stream
        .write_all(&frame_bytes(&Message::stat_volume_req("v", 7).encode().unwrap()))
        .unwrap();
    let (header, _) = read_frame(&mut stream);
    let reply = Message::decode(&header).unwrap();
    assert_eq!(reply.opcode, Opcode::StatVolumeRsp);
    assert_eq!(reply.opaque, 7);
    assert_eq!(reply.retval, 4096);
}

#[test_log::test]
fn oversized_frame_only_kills_the_offending_connection() {
    let server = TestServer::start_default();
    server.backend.create_volume("v", 4096).unwrap();

    let uri: nvp::transport::Uri = server.uri.parse().unwrap();

    // A framing violation is connection-fatal for the sender.
    let mut bad = TcpStream::connect(uri.authority()).unwrap();
    bad.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
    bad.write_all(&u32::MAX.to_be_bytes()).unwrap();
    bad.flush().unwrap();
    let mut buf = [0u8; 1];
    // Server drops the connection without replying.
    assert_eq!(bad.read(&mut buf).unwrap_or(0), 0);

    // Other sessions are unaffected.
    let mut good = TcpStream::connect(uri.authority()).unwrap();
    good.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
    good.write_all(&frame_bytes(&Message::stat_volume_req("v", 9).encode().unwrap()))
        .unwrap();
    let (header, _) = read_frame(&mut good);
    let reply = Message::decode(&header).unwrap();
    assert_eq!(reply.retval, 4096);
    assert_eq!(reply.opaque, 9);
}
