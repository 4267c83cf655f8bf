//! Client side of the tunnel
//!
//! Captures source traffic on the listen devices, reassembles fragments,
//! encapsulates (and optionally encrypts) whole datagrams and carries them to
//! the server over one FakeTCP flow on the upstream device. Returning frames
//! decapsulate, refragment per their fingerprint and inject back toward the
//! originating source, whose MAC was learned from its own captured traffic.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use rand::Rng;
use tracing::{debug, info, warn};

use super::{
    gateway_link, resolve_gateway, unwrap_frame, wrap_frame, EVENT_POLL, HOUSEKEEPING_INTERVAL,
    QUEUE_DEPTH,
};
use crate::capture::{filter, spawn_receiver, spawn_sender, PacketSink, PacketSource};
use crate::config::Config;
use crate::crypto::{Cipher, Method};
use crate::device::{find_all_devices, Device};
use crate::encap::{EncapFrame, FrameReader};
use crate::error::{CaptureError, DeviceError, TunnelError};
use crate::faketcp::{parse_segment, Endpoint};
use crate::fragment::{refragment, FragmentQueue, REASSEMBLY_TIMEOUT};
use crate::packet::{build_frame, parse_datagram, CapturedPacket, LinkLayer};

/// Ephemeral range for the client's FakeTCP source port
const LOCAL_PORT_RANGE: std::ops::RangeInclusive<u16> = 32768..=60999;

/// Dispatcher input
enum Event {
    /// Intercepted source traffic from listen device `dev`
    Source { packet: CapturedPacket, dev: usize },
    /// A segment of the tunnel flow
    Tunnel(CapturedPacket),
}

/// A source seen on a listen device
struct Neighbor {
    dev: usize,
    mac: Option<[u8; 6]>,
}

/// The client tunnel. Construct, then [`run`](Self::run) until shutdown.
pub struct ClientTunnel {
    config: Config,
    shutdown: Arc<AtomicBool>,
}

impl ClientTunnel {
    #[must_use]
    pub fn new(config: Config, shutdown: Arc<AtomicBool>) -> Self {
        Self { config, shutdown }
    }

    /// Run the client data plane until the shutdown flag is set or a fatal
    /// error tears the tunnel down.
    ///
    /// # Errors
    ///
    /// Fatal conditions only: device setup, handshake timeout, or the
    /// upstream device going offline.
    pub fn run(&self) -> Result<(), TunnelError> {
        let server = self.config.server.ok_or_else(|| {
            TunnelError::Config(crate::error::ConfigError::ValidationError(
                "client mode requires a server address".into(),
            ))
        })?;

        let set = find_all_devices()?;
        for device in &set.devices {
            info!("Device {}", device);
        }

        let upstream = set
            .upstream_device(self.config.upstream.as_deref(), self.config.gateway)?
            .clone();
        let listen_devices = set.listen_devices(&self.config.listen_devices)?;
        let local_ip = upstream.ipv4_addr().ok_or(DeviceError::NoIpv4 {
            device: upstream.name.clone(),
        })?;
        let local_port = self
            .config
            .local_port
            .unwrap_or_else(|| rand::thread_rng().gen_range(LOCAL_PORT_RANGE));
        let local = SocketAddrV4::new(local_ip, local_port);

        let gateway = resolve_gateway(&upstream, self.config.gateway)?;
        let upstream_link = gateway_link(&upstream, gateway.as_ref())?;

        let method: Method = self.config.crypto.method.parse()?;
        let cipher = Cipher::new(method, self.config.crypto.password.as_deref())?;

        info!(
            "Client {} -> {} on {} ({} listen devices, method {})",
            local,
            server,
            upstream.alias,
            listen_devices.len(),
            method
        );

        // Open every handle before spawning anything so setup errors abort
        // cleanly.
        let (events_tx, events_rx) = bounded::<Event>(QUEUE_DEPTH);
        let tunnel_source = PacketSource::open(
            &upstream,
            &filter::tunnel_filter_client(*server.ip(), local_port),
        )?;
        let upstream_sink = PacketSink::open(&upstream)?;

        let source_filter = filter::sources_filter(&self.config.sources, *server.ip());
        let mut listen_sources = Vec::with_capacity(listen_devices.len());
        let mut listen_sinks = Vec::with_capacity(listen_devices.len());
        for device in &listen_devices {
            listen_sources.push(PacketSource::open(device, &source_filter)?);
            listen_sinks.push(PacketSink::open(device)?);
        }

        // Receiver and sender threads per handle.
        let mut handles: Vec<JoinHandle<()>> = Vec::new();
        let tunnel_rx = spawn_receiver(
            tunnel_source,
            events_tx.clone(),
            Event::Tunnel,
            Arc::clone(&self.shutdown),
        );

        let (upstream_tx, upstream_frames) = bounded::<Vec<u8>>(QUEUE_DEPTH);
        handles.push(spawn_sender(
            upstream_sink,
            upstream_frames,
            Arc::clone(&self.shutdown),
        ));

        let mut listen_rx_handles = Vec::with_capacity(listen_sources.len());
        let mut listen_txs: Vec<Option<Sender<Vec<u8>>>> = Vec::new();
        for (dev, source) in listen_sources.into_iter().enumerate() {
            listen_rx_handles.push(spawn_receiver(
                source,
                events_tx.clone(),
                move |packet| Event::Source { packet, dev },
                Arc::clone(&self.shutdown),
            ));
        }
        for sink in listen_sinks {
            let (tx, frames) = bounded::<Vec<u8>>(QUEUE_DEPTH);
            handles.push(spawn_sender(sink, frames, Arc::clone(&self.shutdown)));
            listen_txs.push(Some(tx));
        }
        drop(events_tx);

        let mut dispatcher = Dispatcher {
            server,
            endpoint: Endpoint::client(local, server),
            cipher,
            frag: FragmentQueue::new(REASSEMBLY_TIMEOUT),
            reader: FrameReader::new(),
            neighbors: HashMap::new(),
            listen_devices,
            listen_txs,
            upstream_name: upstream.name.clone(),
            upstream_link,
            upstream_tx,
        };

        // Open the flow.
        let syn = dispatcher.endpoint.connect(Instant::now())?;
        dispatcher.send_upstream(vec![syn])?;

        let result = self.dispatch(&events_rx, &mut dispatcher, &tunnel_rx, &listen_rx_handles);

        // Stop every pump, drain senders, then join.
        self.shutdown.store(true, Ordering::Relaxed);
        drop(dispatcher);
        drop(events_rx);
        handles.push(tunnel_rx);
        handles.extend(listen_rx_handles);
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
        listen_rx: &[JoinHandle<()>],
    ) -> Result<(), TunnelError> {
        let mut last_tick = Instant::now();
        while !self.shutdown.load(Ordering::Relaxed) {
            match events.recv_timeout(EVENT_POLL) {
                Ok(Event::Source { packet, dev }) => dispatcher.handle_source(packet, dev)?,
                Ok(Event::Tunnel(packet)) => dispatcher.handle_tunnel(packet)?,
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
                dispatcher.housekeeping(now)?;

                // A dead tunnel pump means the upstream device went offline,
                // which is fatal for the only upstream.
                if tunnel_rx.is_finished() {
                    return Err(CaptureError::Read {
                        device: dispatcher.upstream_name.clone(),
                        reason: "tunnel pump exited".into(),
                    }
                    .into());
                }
                for (dev, handle) in listen_rx.iter().enumerate() {
                    if handle.is_finished() {
                        dispatcher.mark_listen_offline(dev);
                    }
                }
                if dispatcher.all_listen_offline() {
                    return Err(CaptureError::Read {
                        device: "all listen devices".into(),
                        reason: "every listen pump exited".into(),
                    }
                    .into());
                }
            }
        }
        Ok(())
    }
}

/// Dispatcher state owned by the run loop; the single writer of the
/// endpoint's counters.
struct Dispatcher {
    server: SocketAddrV4,
    endpoint: Endpoint,
    cipher: Cipher,
    frag: FragmentQueue,
    reader: FrameReader,
    neighbors: HashMap<Ipv4Addr, Neighbor>,
    listen_devices: Vec<Device>,
    listen_txs: Vec<Option<Sender<Vec<u8>>>>,
    upstream_name: String,
    upstream_link: LinkLayer,
    upstream_tx: Sender<Vec<u8>>,
}

impl Dispatcher {
    /// Intercepted source packet: reassemble, encapsulate, encrypt, segment.
    fn handle_source(&mut self, packet: CapturedPacket, dev: usize) -> Result<(), TunnelError> {
        let mac = match packet.link {
            LinkLayer::Ethernet { src, .. } => Some(src),
            LinkLayer::Loopback => None,
        };
        self.neighbors
            .insert(packet.src_ip(), Neighbor { dev, mac });

        let Some((datagram, fingerprint)) = self.frag.process(&packet) else {
            return Ok(());
        };
        let frame = match crate::encap::encode(&fingerprint, &datagram) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Dropping packet from {}: {}", packet.src_ip(), e);
                return Ok(());
            }
        };
        let wire = match wrap_frame(&self.cipher, frame) {
            Ok(wire) => wire,
            Err(e) => {
                warn!("Dropping packet from {}: {}", packet.src_ip(), e);
                return Ok(());
            }
        };
        let segments = match self.endpoint.send(&wire) {
            Ok(segments) => segments,
            Err(e) => {
                warn!("Failed to segment tunnel frame: {}", e);
                return Ok(());
            }
        };
        self.send_upstream(segments)
    }

    /// A segment of the tunnel flow from the server.
    fn handle_tunnel(&mut self, packet: CapturedPacket) -> Result<(), TunnelError> {
        let Some(segment) = parse_segment(&packet) else {
            return Ok(());
        };
        if segment.src != self.server {
            return Ok(());
        }

        let outcome = match self.endpoint.handle_segment(&segment, Instant::now()) {
            Ok(outcome) => outcome,
            Err(e) => {
                // Desync: the endpoint reset itself; housekeeping reconnects
                // after the cooldown.
                warn!("{}", e);
                return Ok(());
            }
        };
        self.send_upstream(outcome.emit)?;

        if !outcome.delivered.is_empty() {
            self.reader.push(&outcome.delivered);
            while let Some(body) = self.reader.next_frame() {
                match unwrap_frame(&self.cipher, &body) {
                    Ok(frame) => self.deliver_to_source(&frame)?,
                    Err(e) => warn!("Dropping tunnel frame: {}", e),
                }
            }
        }
        Ok(())
    }

    /// Refragment a returning datagram and inject it toward its source.
    fn deliver_to_source(&mut self, frame: &EncapFrame) -> Result<(), TunnelError> {
        let dst = match parse_datagram(&frame.datagram) {
            Ok(packet) => packet.dst_ip(),
            Err(e) => {
                warn!("Dropping undeliverable frame: {}", e);
                return Ok(());
            }
        };
        let datagrams = match refragment(&frame.datagram, &frame.fingerprint) {
            Ok(datagrams) => datagrams,
            Err(e) => {
                warn!("Dropping frame for {}: {}", dst, e);
                return Ok(());
            }
        };

        let Some(neighbor) = self.neighbors.get(&dst) else {
            warn!("No known source {} for returning packet", dst);
            return Ok(());
        };
        let dev = neighbor.dev;
        let neighbor_mac = neighbor.mac;
        let device = &self.listen_devices[dev];
        let link = if device.is_loopback {
            LinkLayer::Loopback
        } else {
            let (Some(src), Some(dst_mac)) = (device.hardware_addr, neighbor_mac) else {
                warn!("No link addressing for source {}", dst);
                return Ok(());
            };
            LinkLayer::Ethernet { src, dst: dst_mac }
        };

        let Some(tx) = self.listen_txs[dev].clone() else {
            debug!("Listen device {} offline, dropping packet", device.name);
            return Ok(());
        };
        for datagram in datagrams {
            let out = match build_frame(&link, &datagram) {
                Ok(out) => out,
                Err(e) => {
                    warn!("Failed to frame packet for {}: {}", dst, e);
                    return Ok(());
                }
            };
            if tx.send(out).is_err() {
                self.mark_listen_offline(dev);
                return Ok(());
            }
        }
        Ok(())
    }

    /// Frame segments for the upstream link and queue them for injection.
    fn send_upstream(&self, segments: Vec<Vec<u8>>) -> Result<(), TunnelError> {
        for segment in segments {
            let frame = build_frame(&self.upstream_link, &segment)?;
            self.upstream_tx
                .send(frame)
                .map_err(|_| CaptureError::Inject {
                    device: self.upstream_name.clone(),
                    reason: "sender thread exited".into(),
                })?;
        }
        Ok(())
    }

    /// Periodic expiry, handshake supervision and reconnects.
    fn housekeeping(&mut self, now: Instant) -> Result<(), TunnelError> {
        self.frag.purge_expired();
        self.endpoint.check_handshake_timeout(now)?;
        if self.endpoint.can_reconnect(now) {
            info!("Re-opening FakeTCP flow to {}", self.server);
            let syn = self.endpoint.connect(now)?;
            self.send_upstream(vec![syn])?;
        }
        Ok(())
    }

    fn mark_listen_offline(&mut self, dev: usize) {
        if self.listen_txs[dev].take().is_some() {
            warn!(
                "Listen device {} is offline",
                self.listen_devices[dev].name
            );
        }
    }

    fn all_listen_offline(&self) -> bool {
        self.listen_txs.iter().all(Option::is_none)
    }
}
