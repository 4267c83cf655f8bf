//! End-to-end data plane tests
//!
//! Drives the client-side pipeline (reassemble, encapsulate, encrypt,
//! segment) into the server-side pipeline (reorder, decrypt, decapsulate,
//! NAT) over in-memory segment exchange, in both directions.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Instant;

use etherparse::{IpFragOffset, IpNumber, Ipv4Header};
use rust_tunnel::config::NatConfig;
use rust_tunnel::crypto::{Cipher, Method, GCM_NONCE_LEN, TAG_LEN};
use rust_tunnel::encap::{self, FrameReader};
use rust_tunnel::faketcp::Endpoint;
use rust_tunnel::fragment::{refragment, FragmentQueue, REASSEMBLY_TIMEOUT};
use rust_tunnel::nat::NatTable;
use rust_tunnel::packet::{finalize_datagram, parse_datagram, Transport};
use rust_tunnel::tunnel::{unwrap_frame, wrap_frame};

use super::{echo_request, established_pair, to_meta, udp_datagram, CLIENT_ADDR, SERVER_ADDR};

const SOURCE: SocketAddrV4 = SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 5), 5000);
const DESTINATION: SocketAddrV4 = SocketAddrV4::new(Ipv4Addr::new(8, 8, 8, 8), 53);

/// Push one captured datagram through the client pipeline, returning the
/// emitted tunnel segments.
fn client_side(
    endpoint: &mut Endpoint,
    cipher: &Cipher,
    frag: &FragmentQueue,
    captured: &[u8],
) -> Vec<Vec<u8>> {
    let packet = parse_datagram(captured).expect("captured packet parses");
    let Some((datagram, fingerprint)) = frag.process(&packet) else {
        return Vec::new();
    };
    let frame = encap::encode(&fingerprint, &datagram).expect("frame encodes");
    let wire = wrap_frame(cipher, frame).expect("frame wraps");
    endpoint.send(&wire).expect("segments build")
}

/// Feed tunnel segments into the receiving endpoint and split out the
/// decapsulated frames.
fn peer_side(
    endpoint: &mut Endpoint,
    cipher: &Cipher,
    reader: &mut FrameReader,
    segments: &[Vec<u8>],
) -> Vec<encap::EncapFrame> {
    let now = Instant::now();
    let mut frames = Vec::new();
    for segment in segments {
        let outcome = endpoint
            .handle_segment(&to_meta(segment), now)
            .expect("segment handled");
        assert!(outcome.emit.is_empty(), "data segments trigger no passive ACK");
        reader.push(&outcome.delivered);
        while let Some(body) = reader.next_frame() {
            frames.push(unwrap_frame(cipher, &body).expect("frame unwraps"));
        }
    }
    frames
}

fn udp_round_trip(method: Method, password: Option<&str>) {
    let (mut client, mut server) = established_pair();
    let client_cipher = Cipher::new(method, password).expect("client cipher");
    let server_cipher = Cipher::new(method, password).expect("server cipher");
    let frag = FragmentQueue::new(REASSEMBLY_TIMEOUT);
    let nat = NatTable::new(*SERVER_ADDR.ip(), &NatConfig::default());

    // Source -> destination.
    let query = vec![0x51u8; 100];
    let captured = udp_datagram(SOURCE, DESTINATION, &query);
    let segments = client_side(&mut client, &client_cipher, &frag, &captured);
    assert_eq!(segments.len(), 1);

    let mut server_reader = FrameReader::new();
    let frames = peer_side(&mut server, &server_cipher, &mut server_reader, &segments);
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].datagram, captured);

    let translated = nat
        .translate_outbound(&frames[0].datagram, CLIENT_ADDR)
        .expect("NAT maps the source");
    let emitted = refragment(&translated, &frames[0].fingerprint).expect("emit side slices");
    assert_eq!(emitted.len(), 1);

    let out = parse_datagram(&emitted[0]).expect("emitted parses");
    assert_eq!(out.src_ip(), *SERVER_ADDR.ip());
    assert_eq!(out.dst_ip(), *DESTINATION.ip());
    let (mapped_port, dst_port) = out.transport.ports().expect("UDP ports");
    assert_eq!(dst_port, DESTINATION.port());
    assert_ne!(mapped_port, SOURCE.port());
    // Identical payload bytes reach the destination.
    assert_eq!(&out.ip_payload()[8..], &query[..]);

    // Destination -> source.
    let answer = vec![0xa5u8; 300];
    let reply = udp_datagram(
        DESTINATION,
        SocketAddrV4::new(*SERVER_ADDR.ip(), mapped_port),
        &answer,
    );
    let reply_packet = parse_datagram(&reply).expect("reply parses");
    let (reply_datagram, reply_fp) = frag.process(&reply_packet).expect("reply is whole");
    let (restored, peer) = nat
        .translate_inbound(&reply_datagram)
        .expect("reply translates")
        .expect("reply has a binding");
    assert_eq!(peer, CLIENT_ADDR);

    let frame = encap::encode(&reply_fp, &restored).expect("reply encodes");
    let wire = wrap_frame(&server_cipher, frame).expect("reply wraps");
    let back_segments = server.send(&wire).expect("reply segments");

    let mut client_reader = FrameReader::new();
    let delivered = peer_side(
        &mut client,
        &client_cipher,
        &mut client_reader,
        &back_segments,
    );
    assert_eq!(delivered.len(), 1);

    let final_packets = refragment(&delivered[0].datagram, &delivered[0].fingerprint)
        .expect("client emit side slices");
    let to_source = parse_datagram(&final_packets[0]).expect("final parses");
    assert_eq!(to_source.src_ip(), *DESTINATION.ip());
    assert_eq!(to_source.dst_ip(), *SOURCE.ip());
    assert_eq!(
        to_source.transport.ports().expect("UDP ports"),
        (DESTINATION.port(), SOURCE.port())
    );
    assert_eq!(&to_source.ip_payload()[8..], &answer[..]);
}

#[test]
fn test_udp_round_trip_plain() {
    udp_round_trip(Method::Plain, None);
}

#[test]
fn test_udp_round_trip_aes_128_gcm() {
    udp_round_trip(Method::Aes128Gcm, Some("integration psk"));
}

#[test]
fn test_encrypted_wire_carries_nonce_and_tag() {
    let (mut client, _server) = established_pair();
    let cipher = Cipher::new(Method::Aes128Gcm, Some("integration psk")).expect("cipher");
    let frag = FragmentQueue::new(REASSEMBLY_TIMEOUT);

    let captured = udp_datagram(SOURCE, DESTINATION, &[0u8; 100]);
    let segments = client_side(&mut client, &cipher, &frag, &captured);
    let meta = to_meta(&segments[0]);
    let payload = &meta.payload;

    // Outer length prefix, then nonce ‖ ciphertext ‖ tag.
    let body_len = u16::from_be_bytes([payload[0], payload[1]]) as usize;
    assert_eq!(body_len, payload.len() - 2);
    let body = &payload[2..];
    assert!(body.len() > GCM_NONCE_LEN + TAG_LEN);

    // Decryption with the PSK yields the encapsulated frame byte for byte.
    let peer_cipher = Cipher::new(Method::Aes128Gcm, Some("integration psk")).expect("cipher");
    let frame = unwrap_frame(&peer_cipher, body).expect("unwraps");
    assert_eq!(frame.datagram, captured);
}

#[test]
fn test_fragmented_echo_preserves_identity() {
    // A 3000-byte echo request leaves a 1500-MTU link as two fragments.
    let (mut client, mut server) = established_pair();
    let cipher = Cipher::new(Method::Plain, None).expect("cipher");
    let frag = FragmentQueue::new(REASSEMBLY_TIMEOUT);
    let nat = NatTable::new(*SERVER_ADDR.ip(), &NatConfig::default());

    let whole = echo_request(*SOURCE.ip(), *DESTINATION.ip(), 700, &vec![0x2au8; 2972]);
    let ip_payload = &whole[20..];
    let original_id = 4660u16;

    // Fragment at the 1480-byte boundary, as a 1500-MTU link would.
    let mut fragments = Vec::new();
    for (offset_units, mf) in [(0u16, true), (185u16, false)] {
        let start = offset_units as usize * 8;
        let end = if mf { start + 1480 } else { ip_payload.len() };
        let mut header = Ipv4Header::new(
            (end - start) as u16,
            64,
            IpNumber::ICMP,
            SOURCE.ip().octets(),
            DESTINATION.ip().octets(),
        )
        .expect("header builds");
        header.identification = original_id;
        header.more_fragments = mf;
        header.fragment_offset = IpFragOffset::try_new(offset_units).expect("offset fits");
        fragments
            .push(finalize_datagram(&header, &Transport::None, &ip_payload[start..end]).unwrap());
    }

    // Both fragments enter the client; one tunnel delivery results.
    let mut segments = client_side(&mut client, &cipher, &frag, &fragments[0]);
    assert!(segments.is_empty());
    segments = client_side(&mut client, &cipher, &frag, &fragments[1]);
    assert!(!segments.is_empty());

    let mut reader = FrameReader::new();
    let frames = peer_side(&mut server, &cipher, &mut reader, &segments);
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].fingerprint.id, original_id);
    assert_eq!(frames[0].fingerprint.offsets, vec![0, 185]);

    // The server emits exactly two fragments with the source's ID and
    // boundaries, NAT rewrite notwithstanding.
    let translated = nat
        .translate_outbound(&frames[0].datagram, CLIENT_ADDR)
        .expect("NAT maps the echo");
    let emitted = refragment(&translated, &frames[0].fingerprint).expect("refragment");
    assert_eq!(emitted.len(), 2);
    for (i, datagram) in emitted.iter().enumerate() {
        let packet = parse_datagram(datagram).expect("fragment parses");
        assert_eq!(packet.ipv4.identification, original_id);
        assert_eq!(packet.ipv4.more_fragments, i == 0);
        let expected_offset = if i == 0 { 0 } else { 185 };
        assert_eq!(packet.ipv4.fragment_offset.value(), expected_offset);
        assert_eq!(packet.src_ip(), *SERVER_ADDR.ip());
    }
    // Byte-identical payload after the rewritten ICMP header.
    let reassembled: Vec<u8> = emitted
        .iter()
        .flat_map(|d| d[20..].to_vec())
        .collect();
    assert_eq!(reassembled[8..], ip_payload[8..]);
}

#[test]
fn test_third_party_injection_survives() {
    let (mut client, mut server) = established_pair();
    let cipher = Cipher::new(Method::Aes256Gcm, Some("integration psk")).expect("cipher");
    let frag = FragmentQueue::new(REASSEMBLY_TIMEOUT);
    let mut reader = FrameReader::new();
    let now = Instant::now();

    // A third party injects a random 200-byte segment; its sequence lands
    // nowhere near the stream and the bytes never become contiguous.
    let stray = rust_tunnel::faketcp::build_segment(
        CLIENT_ADDR,
        SERVER_ADDR,
        0x55aa_55aa,
        0,
        false,
        999,
        &[0x5au8; 200],
    )
    .expect("stray segment builds");
    let outcome = server
        .handle_segment(&to_meta(&stray), now)
        .expect("stray segment handled");
    assert!(outcome.delivered.is_empty());
    assert!(server.is_established());

    // A tampered legitimate segment: the bytes are contiguous, the outer
    // framing holds, but the tag check rejects the body. Frame dropped,
    // session intact.
    let captured = udp_datagram(SOURCE, DESTINATION, &[1u8; 64]);
    let segments = client_side(&mut client, &cipher, &frag, &captured);
    let mut tampered = to_meta(&segments[0]);
    tampered.payload[30] ^= 0xff;
    let outcome = server
        .handle_segment(&tampered, now)
        .expect("tampered segment handled");
    reader.push(&outcome.delivered);
    let mut rejected = 0;
    while let Some(body) = reader.next_frame() {
        assert!(unwrap_frame(&cipher, &body).is_err());
        rejected += 1;
    }
    assert_eq!(rejected, 1);
    assert!(server.is_established());

    // The flow still carries traffic afterwards.
    let more = udp_datagram(SOURCE, DESTINATION, &[2u8; 32]);
    let segments = client_side(&mut client, &cipher, &frag, &more);
    let frames = peer_side(&mut server, &cipher, &mut reader, &segments);
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].datagram, more);
}
