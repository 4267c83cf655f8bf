//! Server side of the tunnel
//!
//! Accepts FakeTCP flows from any number of clients on the tunnel device,
//! decapsulates their frames, rewrites sources through the NAT table and
//! re-emits the original packets on the upstream device. Replies captured on
//! the upstream device are reassembled, restored to their original source
//! and carried back over the owning peer's flow.

use std::collections::HashMap;
use std::net::SocketAddrV4;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use tracing::{debug, info, trace, warn};

use super::{
    gateway_link, resolve_gateway, unwrap_frame, wrap_frame, EVENT_POLL, HOUSEKEEPING_INTERVAL,
    QUEUE_DEPTH,
};
use crate::capture::{filter, spawn_receiver, spawn_sender, PacketSink, PacketSource};
use crate::config::Config;
use crate::crypto::{Cipher, Method};
use crate::device::find_all_devices;
use crate::encap::{self, EncapFrame, FrameReader};
use crate::error::{CaptureError, DeviceError, TunnelError};
use crate::faketcp::{parse_segment, Endpoint};
use crate::fragment::{refragment, FragmentQueue, REASSEMBLY_TIMEOUT};
use crate::nat::NatTable;
use crate::packet::{build_frame, CapturedPacket, LinkLayer};

/// Non-established peer sessions are forgotten after this much quiet
const SESSION_IDLE: Duration = Duration::from_secs(60);

/// Dispatcher input
enum Event {
    /// A segment arriving on the tunnel device
    Tunnel(CapturedPacket),
    /// A reply captured on the upstream device
    Reply(CapturedPacket),
}

/// Per-peer flow state
struct PeerSession {
    endpoint: Endpoint,
    reader: FrameReader,
    last_activity: Instant,
}

impl PeerSession {
    fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            reader: FrameReader::new(),
            last_activity: Instant::now(),
        }
    }
}

/// The server tunnel. Construct, then [`run`](Self::run) until shutdown.
pub struct ServerTunnel {
    config: Config,
    shutdown: Arc<AtomicBool>,
}

impl ServerTunnel {
    #[must_use]
    pub fn new(config: Config, shutdown: Arc<AtomicBool>) -> Self {
        Self { config, shutdown }
    }

    /// Run the server data plane until the shutdown flag is set or a fatal
    /// error tears the tunnel down.
    ///
    /// # Errors
    ///
    /// Fatal conditions only: device setup failures or an essential device
    /// going offline.
    pub fn run(&self) -> Result<(), TunnelError> {
        let set = find_all_devices()?;
        for device in &set.devices {
            info!("Device {}", device);
        }

        let upstream = set
            .upstream_device(self.config.upstream.as_deref(), self.config.gateway)?
            .clone();
        let tunnel_dev = match self.config.listen_devices.first() {
            Some(name) => set
                .find(name)
                .ok_or_else(|| DeviceError::Unknown { name: name.clone() })?
                .clone(),
            None => upstream.clone(),
        };
        let server_ip = upstream.ipv4_addr().ok_or(DeviceError::NoIpv4 {
            device: upstream.name.clone(),
        })?;
        let tunnel_ip = tunnel_dev.ipv4_addr().ok_or(DeviceError::NoIpv4 {
            device: tunnel_dev.name.clone(),
        })?;
        let port = self.config.port;
        let local = SocketAddrV4::new(tunnel_ip, port);

        let upstream_gateway = resolve_gateway(&upstream, self.config.gateway)?;
        let upstream_link = gateway_link(&upstream, upstream_gateway.as_ref())?;
        let tunnel_link = if tunnel_dev.name == upstream.name {
            upstream_link.clone()
        } else {
            let tunnel_gateway = resolve_gateway(&tunnel_dev, self.config.gateway)?;
            gateway_link(&tunnel_dev, tunnel_gateway.as_ref())?
        };

        let method: Method = self.config.crypto.method.parse()?;
        let cipher = Cipher::new(method, self.config.crypto.password.as_deref())?;

        info!(
            "Server {} on {} (upstream {}, NAT {} - {}, method {})",
            local,
            tunnel_dev.alias,
            upstream.alias,
            self.config.nat.port_min,
            self.config.nat.port_max,
            method
        );

        let (events_tx, events_rx) = bounded::<Event>(QUEUE_DEPTH);
        let tunnel_source = PacketSource::open(&tunnel_dev, &filter::tunnel_filter_server(port))?;
        let reply_source =
            PacketSource::open(&upstream, &filter::destinations_filter(server_ip, port))?;
        let tunnel_sink = PacketSink::open(&tunnel_dev)?;
        let upstream_sink = PacketSink::open(&upstream)?;

        let tunnel_rx = spawn_receiver(
            tunnel_source,
            events_tx.clone(),
            Event::Tunnel,
            Arc::clone(&self.shutdown),
        );
        let reply_rx = spawn_receiver(
            reply_source,
            events_tx,
            Event::Reply,
            Arc::clone(&self.shutdown),
        );

        let mut handles: Vec<JoinHandle<()>> = Vec::new();
        let (tunnel_tx, tunnel_frames) = bounded::<Vec<u8>>(QUEUE_DEPTH);
        handles.push(spawn_sender(
            tunnel_sink,
            tunnel_frames,
            Arc::clone(&self.shutdown),
        ));
        let (upstream_tx, upstream_frames) = bounded::<Vec<u8>>(QUEUE_DEPTH);
        handles.push(spawn_sender(
            upstream_sink,
            upstream_frames,
            Arc::clone(&self.shutdown),
        ));

        let mut dispatcher = Dispatcher {
            local,
            peers: HashMap::new(),
            cipher,
            nat: NatTable::new(server_ip, &self.config.nat),
            frag: FragmentQueue::new(REASSEMBLY_TIMEOUT),
            tunnel_name: tunnel_dev.name.clone(),
            tunnel_link,
            tunnel_tx,
            upstream_name: upstream.name.clone(),
            upstream_link,
            upstream_tx,
        };

        let result = self.dispatch(&events_rx, &mut dispatcher, &tunnel_rx, &reply_rx);

        self.shutdown.store(true, Ordering::Relaxed);
        drop(dispatcher);
        drop(events_rx);
        handles.push(tunnel_rx);
        handles.push(reply_rx);
        for handle in handles {
            let _ = handle.join();
        }
        result
    }

    fn dispatch(
        &self,
        events: &Receiver<Event>,
        dispatcher: &mut Dispatcher,
        tunnel_rx: &JoinHandle<()>,
        reply_rx: &JoinHandle<()>,
    ) -> Result<(), TunnelError> {
        let mut last_tick = Instant::now();
        while !self.shutdown.load(Ordering::Relaxed) {
            match events.recv_timeout(EVENT_POLL) {
                Ok(Event::Tunnel(packet)) => dispatcher.handle_tunnel(packet)?,
                Ok(Event::Reply(packet)) => dispatcher.handle_reply(&packet)?,
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    if self.shutdown.load(Ordering::Relaxed) {
                        break;
                    }
                    return Err(CaptureError::Read {
                        device: "all capture devices".into(),
                        reason: "every receiver exited".into(),
                    }
                    .into());
                }
            }

            let now = Instant::now();
            if now.duration_since(last_tick) >= HOUSEKEEPING_INTERVAL {
                last_tick = now;
                dispatcher.housekeeping(now);

                // Both pumps are essential; either going offline is fatal.
                if tunnel_rx.is_finished() {
                    return Err(CaptureError::Read {
                        device: dispatcher.tunnel_name.clone(),
                        reason: "tunnel pump exited".into(),
                    }
                    .into());
                }
                if reply_rx.is_finished() {
                    return Err(CaptureError::Read {
                        device: dispatcher.upstream_name.clone(),
                        reason: "reply pump exited".into(),
                    }
                    .into());
                }
            }
        }
        Ok(())
    }
}

/// Dispatcher state owned by the run loop
struct Dispatcher {
    local: SocketAddrV4,
    peers: HashMap<SocketAddrV4, PeerSession>,
    cipher: Cipher,
    nat: NatTable,
    frag: FragmentQueue,
    tunnel_name: String,
    tunnel_link: LinkLayer,
    tunnel_tx: Sender<Vec<u8>>,
    upstream_name: String,
    upstream_link: LinkLayer,
    upstream_tx: Sender<Vec<u8>>,
}

impl Dispatcher {
    /// One segment from some peer on the tunnel device.
    fn handle_tunnel(&mut self, packet: CapturedPacket) -> Result<(), TunnelError> {
        let Some(segment) = parse_segment(&packet) else {
            return Ok(());
        };
        if segment.dst.port() != self.local.port() {
            return Ok(());
        }

        let peer = segment.src;
        let local = self.local;
        let session = self
            .peers
            .entry(peer)
            .or_insert_with(|| PeerSession::new(Endpoint::server(local, peer)));
        session.last_activity = Instant::now();

        let outcome = match session.endpoint.handle_segment(&segment, Instant::now()) {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("{}", e);
                return Ok(());
            }
        };
        // Frames become visible once the segment bytes are contiguous.
        let mut frames = Vec::new();
        if !outcome.delivered.is_empty() {
            session.reader.push(&outcome.delivered);
            while let Some(body) = session.reader.next_frame() {
                match unwrap_frame(&self.cipher, &body) {
                    Ok(frame) => frames.push(frame),
                    Err(e) => warn!("Dropping frame from {}: {}", peer, e),
                }
            }
        }

        if outcome.established_now {
            info!("Peer {} established ({} peers)", peer, self.peers.len());
        }
        self.send_tunnel(outcome.emit)?;
        for frame in frames {
            self.forward_outbound(&frame, peer)?;
        }
        Ok(())
    }

    /// Decapsulated client packet: NAT rewrite and emit toward destination.
    fn forward_outbound(&mut self, frame: &EncapFrame, peer: SocketAddrV4) -> Result<(), TunnelError> {
        let translated = match self.nat.translate_outbound(&frame.datagram, peer) {
            Ok(translated) => translated,
            Err(TunnelError::Nat(_)) => {
                // Exhaustion (rate-limited info) and untranslatable packets
                // (debug) are logged by the table itself.
                return Ok(());
            }
            Err(e) => {
                warn!("Dropping outbound packet from {}: {}", peer, e);
                return Ok(());
            }
        };
        let datagrams = match refragment(&translated, &frame.fingerprint) {
            Ok(datagrams) => datagrams,
            Err(e) => {
                warn!("Dropping outbound packet from {}: {}", peer, e);
                return Ok(());
            }
        };
        for datagram in datagrams {
            let out = build_frame(&self.upstream_link, &datagram)?;
            self.upstream_tx
                .send(out)
                .map_err(|_| CaptureError::Inject {
                    device: self.upstream_name.clone(),
                    reason: "sender thread exited".into(),
                })?;
        }
        Ok(())
    }

    /// A reply captured on the upstream device.
    fn handle_reply(&mut self, packet: &CapturedPacket) -> Result<(), TunnelError> {
        let Some((datagram, fingerprint)) = self.frag.process(packet) else {
            return Ok(());
        };
        let (restored, peer) = match self.nat.translate_inbound(&datagram) {
            Ok(Some(hit)) => hit,
            Ok(None) => {
                trace!("Reply without a NAT binding, dropping");
                return Ok(());
            }
            Err(e) => {
                warn!("Dropping reply: {}", e);
                return Ok(());
            }
        };

        let Some(session) = self.peers.get_mut(&peer) else {
            debug!("Peer {} has no session, dropping reply", peer);
            return Ok(());
        };
        let frame = match encap::encode(&fingerprint, &restored) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Dropping reply for {}: {}", peer, e);
                return Ok(());
            }
        };
        let wire = match wrap_frame(&self.cipher, frame) {
            Ok(wire) => wire,
            Err(e) => {
                warn!("Dropping reply for {}: {}", peer, e);
                return Ok(());
            }
        };
        let segments = match session.endpoint.send(&wire) {
            Ok(segments) => segments,
            Err(e) => {
                warn!("Failed to segment reply for {}: {}", peer, e);
                return Ok(());
            }
        };
        self.send_tunnel(segments)
    }

    /// Frame segments for the tunnel link and queue them for injection.
    fn send_tunnel(&self, segments: Vec<Vec<u8>>) -> Result<(), TunnelError> {
        for segment in segments {
            let frame = build_frame(&self.tunnel_link, &segment)?;
            self.tunnel_tx.send(frame).map_err(|_| CaptureError::Inject {
                device: self.tunnel_name.clone(),
                reason: "sender thread exited".into(),
            })?;
        }
        Ok(())
    }

    /// Periodic expiry and per-peer supervision.
    fn housekeeping(&mut self, now: Instant) {
        self.frag.purge_expired();
        self.nat.purge_expired();

        self.peers.retain(|peer, session| {
            if let Err(e) = session.endpoint.check_handshake_timeout(now) {
                warn!("Dropping peer {}: {}", peer, e);
                return false;
            }
            // Idle, never-established or reset sessions age out; established
            // flows live as long as the tunnel.
            if !session.endpoint.is_established()
                && now.duration_since(session.last_activity) >= SESSION_IDLE
            {
                debug!("Forgetting idle peer {}", peer);
                return false;
            }
            true
        });
    }
}
