//! FakeTCP pseudo-connection endpoint
//!
//! Presents a single TCP flow per peer while carrying whole encapsulated IP
//! packets as its byte stream. The state machine is three-legged:
//!
//! | State         | Client                        | Server                          |
//! |---------------|-------------------------------|---------------------------------|
//! | `Closed`      | initial                       | initial                         |
//! | `SynSent`     | after emitting SYN            | —                               |
//! | `SynReceived` | —                             | after SYN, emitting SYN+ACK     |
//! | `Established` | after SYN+ACK, emitting ACK   | after the final ACK             |
//!
//! The third-leg ACK is the only empty segment ever emitted after opening;
//! passive ACKs never happen — acknowledgment piggybacks on data, and `seq_in`
//! is local bookkeeping for ordering only. SYN legs consume no sequence
//! space, so the first data byte on each side is sequence 0. There are no
//! retransmissions: loss on the tunnel is loss of the encapsulated packet,
//! which the protocols inside handle end-to-end.

mod reorder;
mod segment;

pub use reorder::{ReorderBuffer, REORDER_LIMIT};
pub use segment::{build_segment, parse_segment, SegmentMeta, TUNNEL_TTL, TUNNEL_WINDOW};

use std::net::SocketAddrV4;
use std::time::{Duration, Instant};

use tracing::{debug, info, trace};

use crate::error::{HandshakeError, PacketError, TunnelError};

/// Payload bytes per segment: 1500 MTU minus IPv4 and TCP headers
pub const MSS: usize = 1460;

/// Per-leg handshake timeout; no retry, expiry is fatal for the peer
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Quiet period after a desync reset before a new handshake
pub const RESET_COOLDOWN: Duration = Duration::from_secs(1);

/// Endpoint connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Closed,
    SynSent,
    SynReceived,
    Established,
}

impl State {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "Closed",
            Self::SynSent => "SynSent",
            Self::SynReceived => "SynReceived",
            Self::Established => "Established",
        }
    }
}

/// Which side of the tunnel this endpoint is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// What handling one inbound segment produced
#[derive(Debug, Default)]
pub struct HandleOutcome {
    /// Segments to emit in response (raw IPv4 datagrams)
    pub emit: Vec<Vec<u8>>,
    /// Newly contiguous stream bytes from the peer
    pub delivered: Vec<u8>,
    /// The endpoint just reached `Established`
    pub established_now: bool,
}

/// One side of a FakeTCP flow.
///
/// Owned by a single dispatcher thread; `seq_out` and `ipid_out` have exactly
/// one writer.
pub struct Endpoint {
    role: Role,
    local: SocketAddrV4,
    peer: SocketAddrV4,
    state: State,
    seq_out: u32,
    ipid_out: u16,
    reorder: ReorderBuffer,
    handshake_deadline: Option<Instant>,
    cooldown_until: Option<Instant>,
}

impl Endpoint {
    /// Client endpoint toward `peer`; call [`connect`](Self::connect) to open
    #[must_use]
    pub fn client(local: SocketAddrV4, peer: SocketAddrV4) -> Self {
        Self::new(Role::Client, local, peer)
    }

    /// Server endpoint for a peer whose SYN is expected or just arrived
    #[must_use]
    pub fn server(local: SocketAddrV4, peer: SocketAddrV4) -> Self {
        Self::new(Role::Server, local, peer)
    }

    fn new(role: Role, local: SocketAddrV4, peer: SocketAddrV4) -> Self {
        Self {
            role,
            local,
            peer,
            state: State::Closed,
            seq_out: 0,
            ipid_out: 0,
            reorder: ReorderBuffer::new(REORDER_LIMIT),
            handshake_deadline: None,
            cooldown_until: None,
        }
    }

    #[must_use]
    pub fn state(&self) -> State {
        self.state
    }

    #[must_use]
    pub fn is_established(&self) -> bool {
        self.state == State::Established
    }

    #[must_use]
    pub fn peer(&self) -> SocketAddrV4 {
        self.peer
    }

    #[must_use]
    pub fn local(&self) -> SocketAddrV4 {
        self.local
    }

    /// Emit the next segment, advancing `ipid_out` and (for payload bytes)
    /// `seq_out`.
    fn emit(&mut self, syn: bool, payload: &[u8]) -> Result<Vec<u8>, PacketError> {
        let datagram = segment::build_segment(
            self.local,
            self.peer,
            self.seq_out,
            self.reorder.next_seq(),
            syn,
            self.ipid_out,
            payload,
        )?;
        self.ipid_out = self.ipid_out.wrapping_add(1);
        self.seq_out = self.seq_out.wrapping_add(payload.len() as u32);
        Ok(datagram)
    }

    /// Client side: open the flow by emitting a SYN.
    ///
    /// # Errors
    ///
    /// Returns `PacketError` if the segment cannot be built.
    pub fn connect(&mut self, now: Instant) -> Result<Vec<u8>, PacketError> {
        debug_assert_eq!(self.role, Role::Client);
        let syn = self.emit(true, &[])?;
        self.state = State::SynSent;
        self.handshake_deadline = Some(now + HANDSHAKE_TIMEOUT);
        debug!("FakeTCP {} -> {}: SYN sent", self.local, self.peer);
        Ok(syn)
    }

    /// Whether a closed client endpoint may re-handshake now
    #[must_use]
    pub fn can_reconnect(&self, now: Instant) -> bool {
        self.role == Role::Client
            && self.state == State::Closed
            && self.cooldown_until.is_none_or(|until| now >= until)
    }

    /// Feed one inbound segment from the tunnel pump.
    ///
    /// # Errors
    ///
    /// Returns `TunnelError::PeerDesync` on a SYN over an established flow;
    /// the endpoint has then already reset itself and entered its cooldown.
    pub fn handle_segment(
        &mut self,
        seg: &SegmentMeta,
        now: Instant,
    ) -> Result<HandleOutcome, TunnelError> {
        let mut outcome = HandleOutcome::default();

        match self.state {
            State::Closed => {
                if self.role == Role::Server && seg.syn {
                    if self.cooldown_until.is_some_and(|until| now < until) {
                        trace!("Dropping SYN from {} during reset cooldown", seg.src);
                        return Ok(outcome);
                    }
                    outcome.emit.push(self.emit(true, &[])?);
                    self.state = State::SynReceived;
                    self.handshake_deadline = Some(now + HANDSHAKE_TIMEOUT);
                    debug!("FakeTCP {} -> {}: SYN+ACK sent", self.local, self.peer);
                }
                // Anything else while closed is noise.
            }
            State::SynSent => {
                if seg.syn {
                    // SYN+ACK: complete the handshake with the only empty
                    // non-SYN segment this endpoint will ever emit.
                    outcome.emit.push(self.emit(false, &[])?);
                    self.state = State::Established;
                    self.handshake_deadline = None;
                    outcome.established_now = true;
                    info!("FakeTCP {} -> {}: established", self.local, self.peer);
                }
            }
            State::SynReceived => {
                if seg.syn {
                    // Duplicate SYN; the SYN+ACK is not retransmitted.
                    trace!("Duplicate SYN from {} in SynReceived", seg.src);
                } else {
                    // The third-leg ACK, possibly already carrying data.
                    self.state = State::Established;
                    self.handshake_deadline = None;
                    outcome.established_now = true;
                    info!("FakeTCP {} -> {}: established", self.local, self.peer);
                    if !seg.payload.is_empty() {
                        outcome.delivered = self.reorder.offer(seg.seq, seg.payload.clone());
                    }
                }
            }
            State::Established => {
                if seg.syn {
                    self.reset(now);
                    return Err(TunnelError::PeerDesync {
                        peer: *self.peer.ip(),
                        reason: "unexpected SYN on established flow".into(),
                    });
                }
                if !seg.payload.is_empty() {
                    outcome.delivered = self.reorder.offer(seg.seq, seg.payload.clone());
                }
                // Empty non-SYN segments are stray probes; per the passive-ACK
                // rule we never answer them.
            }
        }

        Ok(outcome)
    }

    /// Queue stream bytes for the peer, drained as MSS-sized segments.
    ///
    /// Before establishment nothing is sent and the bytes are dropped; the
    /// protocols inside the tunnel retransmit end-to-end.
    ///
    /// # Errors
    ///
    /// Returns `PacketError` if a segment cannot be built.
    pub fn send(&mut self, stream: &[u8]) -> Result<Vec<Vec<u8>>, PacketError> {
        if self.state != State::Established {
            trace!(
                "Dropping {} stream bytes: endpoint {} not established",
                stream.len(),
                self.peer
            );
            return Ok(Vec::new());
        }
        stream.chunks(MSS).map(|chunk| self.emit(false, chunk)).collect()
    }

    /// Enforce the per-leg handshake timeout.
    ///
    /// # Errors
    ///
    /// Returns `HandshakeError::Timeout` once a leg has waited longer than
    /// [`HANDSHAKE_TIMEOUT`]; the endpoint falls back to `Closed`.
    pub fn check_handshake_timeout(&mut self, now: Instant) -> Result<(), HandshakeError> {
        let waiting = matches!(self.state, State::SynSent | State::SynReceived);
        if waiting && self.handshake_deadline.is_some_and(|deadline| now >= deadline) {
            let state = self.state.as_str();
            self.state = State::Closed;
            self.handshake_deadline = None;
            return Err(HandshakeError::Timeout {
                peer: *self.peer.ip(),
                state,
            });
        }
        Ok(())
    }

    /// Return to `Closed` and start the desync cooldown. Sequence counters
    /// restart at zero for the next handshake.
    pub fn reset(&mut self, now: Instant) {
        debug!(
            "FakeTCP {} -> {}: reset from {}",
            self.local,
            self.peer,
            self.state.as_str()
        );
        self.state = State::Closed;
        self.seq_out = 0;
        self.ipid_out = 0;
        self.reorder.reset();
        self.handshake_deadline = None;
        self.cooldown_until = Some(now + RESET_COOLDOWN);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{build_frame, parse_frame, LinkKind, LinkLayer};
    use std::net::Ipv4Addr;

    fn client_addr() -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 10), 45000)
    }

    fn server_addr() -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(203, 0, 113, 1), 19986)
    }

    fn to_meta(datagram: &[u8]) -> SegmentMeta {
        let frame = build_frame(&LinkLayer::Loopback, datagram).unwrap();
        let packet = parse_frame(LinkKind::Loopback, &frame).unwrap();
        parse_segment(&packet).unwrap()
    }

    fn established_pair() -> (Endpoint, Endpoint) {
        let now = Instant::now();
        let mut client = Endpoint::client(client_addr(), server_addr());
        let mut server = Endpoint::server(server_addr(), client_addr());

        let syn = client.connect(now).unwrap();
        let synack = server
            .handle_segment(&to_meta(&syn), now)
            .unwrap()
            .emit
            .remove(0);
        let ack = client
            .handle_segment(&to_meta(&synack), now)
            .unwrap()
            .emit
            .remove(0);
        let outcome = server.handle_segment(&to_meta(&ack), now).unwrap();
        assert!(outcome.established_now);
        assert!(client.is_established());
        assert!(server.is_established());
        (client, server)
    }

    #[test]
    fn test_three_way_handshake() {
        let (client, server) = established_pair();
        assert_eq!(client.state(), State::Established);
        assert_eq!(server.state(), State::Established);
    }

    #[test]
    fn test_handshake_segments_are_empty_then_data_flows() {
        let now = Instant::now();
        let mut client = Endpoint::client(client_addr(), server_addr());
        let mut server = Endpoint::server(server_addr(), client_addr());

        let syn = to_meta(&client.connect(now).unwrap());
        assert!(syn.syn && syn.payload.is_empty() && syn.seq == 0);

        let synack_bytes = server
            .handle_segment(&syn, now)
            .unwrap()
            .emit
            .remove(0);
        let synack = to_meta(&synack_bytes);
        assert!(synack.syn && synack.payload.is_empty() && synack.seq == 0);

        let ack_bytes = client.handle_segment(&synack, now).unwrap().emit.remove(0);
        let ack = to_meta(&ack_bytes);
        assert!(!ack.syn && ack.payload.is_empty());
        server.handle_segment(&ack, now).unwrap();

        // First data segment on each side starts at sequence 0.
        let data = client.send(b"first frame").unwrap();
        assert_eq!(data.len(), 1);
        let meta = to_meta(&data[0]);
        assert_eq!(meta.seq, 0);
        assert_eq!(meta.payload, b"first frame");

        let back = server.send(b"reply frame").unwrap();
        assert_eq!(to_meta(&back[0]).seq, 0);
    }

    #[test]
    fn test_first_segment_has_ipid_zero() {
        let now = Instant::now();
        let mut client = Endpoint::client(client_addr(), server_addr());
        let syn = client.connect(now).unwrap();
        let frame = build_frame(&LinkLayer::Loopback, &syn).unwrap();
        let packet = parse_frame(LinkKind::Loopback, &frame).unwrap();
        assert_eq!(packet.ipv4.identification, 0);
    }

    #[test]
    fn test_ipid_increments_per_segment() {
        let (mut client, _server) = established_pair();
        let a = client.send(b"a").unwrap();
        let b = client.send(b"b").unwrap();
        let frame_a = parse_frame(
            LinkKind::Loopback,
            &build_frame(&LinkLayer::Loopback, &a[0]).unwrap(),
        )
        .unwrap();
        let frame_b = parse_frame(
            LinkKind::Loopback,
            &build_frame(&LinkLayer::Loopback, &b[0]).unwrap(),
        )
        .unwrap();
        assert_eq!(
            frame_b.ipv4.identification,
            frame_a.ipv4.identification.wrapping_add(1)
        );
    }

    #[test]
    fn test_seq_advances_by_payload_bytes() {
        let (mut client, mut server) = established_pair();
        let first = client.send(&vec![1u8; 10]).unwrap();
        let second = client.send(&vec![2u8; 5]).unwrap();
        assert_eq!(to_meta(&second[0]).seq, 10);

        let now = Instant::now();
        let d1 = server
            .handle_segment(&to_meta(&first[0]), now)
            .unwrap()
            .delivered;
        let d2 = server
            .handle_segment(&to_meta(&second[0]), now)
            .unwrap()
            .delivered;
        assert_eq!(d1.len(), 10);
        assert_eq!(d2.len(), 5);
    }

    #[test]
    fn test_mss_chunking() {
        let (mut client, _server) = established_pair();
        let segments = client.send(&vec![0u8; MSS * 2 + 100]).unwrap();
        assert_eq!(segments.len(), 3);
        assert_eq!(to_meta(&segments[0]).payload.len(), MSS);
        assert_eq!(to_meta(&segments[2]).payload.len(), 100);
        // Every data segment carries payload
        assert!(segments.iter().all(|s| !to_meta(s).payload.is_empty()));
    }

    #[test]
    fn test_out_of_order_segments_reorder() {
        let (mut client, mut server) = established_pair();
        let first = client.send(b"aaaa").unwrap();
        let second = client.send(b"bbbb").unwrap();

        let now = Instant::now();
        let early = server
            .handle_segment(&to_meta(&second[0]), now)
            .unwrap()
            .delivered;
        assert!(early.is_empty());
        let full = server
            .handle_segment(&to_meta(&first[0]), now)
            .unwrap()
            .delivered;
        assert_eq!(full, b"aaaabbbb");
    }

    #[test]
    fn test_data_before_establishment_dropped() {
        let mut client = Endpoint::client(client_addr(), server_addr());
        assert!(client.send(b"too early").unwrap().is_empty());
    }

    #[test]
    fn test_unexpected_syn_resets() {
        let (mut client, mut server) = established_pair();
        let _ = client;
        let now = Instant::now();
        let stray_syn = to_meta(
            &build_segment(client_addr(), server_addr(), 0, 0, true, 0, &[]).unwrap(),
        );
        let err = server.handle_segment(&stray_syn, now).unwrap_err();
        assert!(matches!(err, TunnelError::PeerDesync { .. }));
        assert_eq!(server.state(), State::Closed);

        // During the cooldown a new SYN is ignored
        assert!(server
            .handle_segment(&stray_syn, now)
            .unwrap()
            .emit
            .is_empty());

        // After the cooldown the handshake may start over
        let later = now + RESET_COOLDOWN + Duration::from_millis(1);
        let outcome = server.handle_segment(&stray_syn, later).unwrap();
        assert_eq!(outcome.emit.len(), 1);
        assert_eq!(server.state(), State::SynReceived);
        // Counters restarted from zero
        assert_eq!(to_meta(&outcome.emit[0]).seq, 0);
    }

    #[test]
    fn test_handshake_timeout() {
        let now = Instant::now();
        let mut client = Endpoint::client(client_addr(), server_addr());
        client.connect(now).unwrap();
        assert!(client.check_handshake_timeout(now).is_ok());
        let err = client
            .check_handshake_timeout(now + HANDSHAKE_TIMEOUT)
            .unwrap_err();
        assert!(matches!(err, HandshakeError::Timeout { state: "SynSent", .. }));
        assert_eq!(client.state(), State::Closed);
    }

    #[test]
    fn test_stray_empty_segment_ignored() {
        let (_client, mut server) = established_pair();
        let now = Instant::now();
        let stray = to_meta(
            &build_segment(client_addr(), server_addr(), 9999, 0, false, 50, &[]).unwrap(),
        );
        let outcome = server.handle_segment(&stray, now).unwrap();
        assert!(outcome.emit.is_empty());
        assert!(outcome.delivered.is_empty());
        assert!(server.is_established());
    }

    #[test]
    fn test_third_leg_ack_with_piggybacked_data() {
        let now = Instant::now();
        let mut client = Endpoint::client(client_addr(), server_addr());
        let mut server = Endpoint::server(server_addr(), client_addr());

        let syn = client.connect(now).unwrap();
        let synack = server
            .handle_segment(&to_meta(&syn), now)
            .unwrap()
            .emit
            .remove(0);
        client.handle_segment(&to_meta(&synack), now).unwrap();

        // The ACK is lost but data follows immediately; the server treats the
        // first data segment as establishing.
        let data = client.send(b"eager").unwrap();
        let outcome = server.handle_segment(&to_meta(&data[0]), now).unwrap();
        assert!(outcome.established_now);
        assert_eq!(outcome.delivered, b"eager");
    }
}
