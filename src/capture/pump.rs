//! Receiver and sender threads per capture handle
//!
//! One receiver thread blocks on the capture socket and forwards parsed
//! packets (mapped into the dispatcher's event type) over a bounded channel.
//! One sender thread drains an outbound frame queue into raw injection.
//! Both observe the shared shutdown flag; read timeouts bound how long that
//! takes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use tracing::{debug, error};

use super::{PacketSink, PacketSource};
use crate::packet::CapturedPacket;

/// How long senders keep draining queued frames after shutdown begins
pub const SHUTDOWN_DRAIN: Duration = Duration::from_millis(500);

/// Poll interval for the outbound queue
const SEND_POLL: Duration = Duration::from_millis(100);

/// Spawn the receiver thread for a capture handle.
///
/// `map` lifts each packet into the dispatcher's event type. The thread exits
/// when the shutdown flag is set, the event channel closes, or the capture
/// fails; a failed capture drops the sender so the dispatcher observes the
/// device going offline as a disconnect.
pub fn spawn_receiver<T, F>(
    mut source: PacketSource,
    events: Sender<T>,
    map: F,
    shutdown: Arc<AtomicBool>,
) -> JoinHandle<()>
where
    T: Send + 'static,
    F: Fn(CapturedPacket) -> T + Send + 'static,
{
    thread::spawn(move || {
        while !shutdown.load(Ordering::Relaxed) {
            match source.next() {
                Ok(Some(packet)) => {
                    if events.send(map(packet)).is_err() {
                        break;
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    error!("Receiver on {} failed: {}", source.device.name, e);
                    break;
                }
            }
        }
        debug!("Receiver for {} exiting", source.device.name);
    })
}

/// Spawn the sender thread for a capture handle.
///
/// Frames received on `frames` are injected as-is. After shutdown begins the
/// queue is drained for at most [`SHUTDOWN_DRAIN`], then the thread exits.
pub fn spawn_sender(
    mut sink: PacketSink,
    frames: Receiver<Vec<u8>>,
    shutdown: Arc<AtomicBool>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        loop {
            if shutdown.load(Ordering::Relaxed) {
                let deadline = Instant::now() + SHUTDOWN_DRAIN;
                while Instant::now() < deadline {
                    match frames.try_recv() {
                        Ok(frame) => {
                            if let Err(e) = sink.inject(&frame) {
                                error!("Drain inject on {} failed: {}", sink.device.name, e);
                                break;
                            }
                        }
                        Err(_) => break,
                    }
                }
                break;
            }
            match frames.recv_timeout(SEND_POLL) {
                Ok(frame) => {
                    if let Err(e) = sink.inject(&frame) {
                        error!("Sender on {} failed: {}", sink.device.name, e);
                        break;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        debug!("Sender for {} exiting", sink.device.name);
    })
}
