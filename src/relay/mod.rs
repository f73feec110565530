//! UDP relay and shadow controller
//!
//! [`RelayController::spawn`] binds the gateway socket and runs a single
//! receive loop that owns the [`Dispatcher`]. The loop multiplexes:
//!
//! - datagrams from devices and the cloud;
//! - commands issued through the [`GatewayHandle`];
//! - boost expiry timers;
//! - cancellation.
//!
//! In RELAY mode device traffic is forwarded verbatim to the cloud and cloud
//! traffic to the last device peer, while the dispatcher shadows both
//! directions without answering. A peer that knocks three times gets its next
//! datagram handled DIRECT: decoded and answered locally as cloud-origin
//! traffic.

mod session;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_stream::wrappers::WatchStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::capture::CaptureSink;
use crate::codec::{Direction, SetAttribute, hexdump};
use crate::dispatch::{Dispatcher, Outbound};
use crate::persistence::{self, Persistence, TraceRecord, TraceSource};
use crate::rendezvous::{CommandReply, Rendezvous};
use crate::state::StateStore;
use crate::{GatewayError, Result};

pub use session::{KNOCK, KNOCKS_TO_ARM, Mode, Sessions};

const MAX_DATAGRAM: usize = 65_535;
const CONTROL_CAPACITY: usize = 32;

/// Socket-level settings for the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelaySettings {
    pub listen: SocketAddr,
    /// Resolved vendor cloud endpoint
    pub cloud: SocketAddr,
    /// Forward device datagrams to the cloud
    pub relay_upstream: bool,
    /// Decode cloud datagrams locally instead of relaying them
    pub decode_cloud: bool,
}

/// Requests sent into the receive loop.
enum Control {
    Command {
        device_id: u32,
        room: u32,
        attribute: SetAttribute,
        value: u32,
        cseq: u8,
        sent: oneshot::Sender<Result<()>>,
    },
}

/// Handle to a running controller.
pub struct GatewayHandle {
    local_addr: SocketAddr,
    state: watch::Receiver<Arc<StateStore>>,
    rendezvous: Arc<Rendezvous>,
    control: mpsc::Sender<Control>,
    cancel: CancellationToken,
}

impl GatewayHandle {
    /// Address the gateway socket is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Latest state snapshot.
    pub fn state(&self) -> Arc<StateStore> {
        self.state.borrow().clone()
    }

    /// Stream of state snapshots, starting with the current one.
    pub fn state_updates(&self) -> WatchStream<Arc<StateStore>> {
        WatchStream::new(self.state.clone())
    }

    pub fn rendezvous(&self) -> &Arc<Rendezvous> {
        &self.rendezvous
    }

    /// Send `SET_<attribute>` to a device and wait for its reply.
    pub async fn send_command(
        &self,
        device_id: u32,
        room: u32,
        attribute: SetAttribute,
        value: u32,
        timeout: Duration,
    ) -> Result<CommandReply> {
        let cseq = self.rendezvous.next_sequence(device_id);
        let waiter = self.rendezvous.register(device_id, cseq)?;

        let (sent_tx, sent_rx) = oneshot::channel();
        let control = Control::Command { device_id, room, attribute, value, cseq, sent: sent_tx };
        self.control.send(control).await.map_err(|_| GatewayError::Closed)?;
        sent_rx.await.map_err(|_| GatewayError::Closed)??;

        waiter.wait(timeout).await
    }

    /// Stop the receive loop.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

/// Owner of the gateway socket and the dispatcher.
pub struct RelayController {
    socket: Arc<UdpSocket>,
    settings: RelaySettings,
    dispatcher: Dispatcher,
    sessions: Sessions,
    last_device_peer: Option<SocketAddr>,
    persistence: Arc<dyn Persistence>,
    capture: Option<Arc<CaptureSink>>,
    state_tx: watch::Sender<Arc<StateStore>>,
}

impl RelayController {
    /// Bind the socket and spawn the receive loop.
    pub async fn spawn(
        settings: RelaySettings,
        dispatcher: Dispatcher,
        persistence: Arc<dyn Persistence>,
        capture: Option<Arc<CaptureSink>>,
    ) -> Result<GatewayHandle> {
        let socket = UdpSocket::bind(settings.listen)
            .await
            .map_err(|e| GatewayError::io(format!("bind {}", settings.listen), e))?;
        let local_addr = socket.local_addr()?;
        info!("UDP gateway listening on {} (cloud {})", local_addr, settings.cloud);

        let rendezvous = dispatcher.rendezvous().clone();
        let (state_tx, state_rx) = watch::channel(Arc::new(dispatcher.state().clone()));
        let (control_tx, control_rx) = mpsc::channel(CONTROL_CAPACITY);
        let cancel = CancellationToken::new();

        let controller = Self {
            socket: Arc::new(socket),
            settings,
            dispatcher,
            sessions: Sessions::new(),
            last_device_peer: None,
            persistence,
            capture,
            state_tx,
        };

        let cancel_loop = cancel.clone();
        tokio::spawn(async move {
            controller.run(control_rx, cancel_loop).await;
        });

        Ok(GatewayHandle { local_addr, state: state_rx, rendezvous, control: control_tx, cancel })
    }

    async fn run(mut self, mut control: mpsc::Receiver<Control>, cancel: CancellationToken) {
        info!("Receive loop started");
        let socket = self.socket.clone();
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let mut handled = 0u64;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Receive loop cancelled");
                    break;
                }
                received = socket.recv_from(&mut buf) => match received {
                    Ok((len, peer)) => {
                        handled += 1;
                        if let Err(e) = self.handle_datagram(&buf[..len], peer).await {
                            error!("Datagram from {} failed: {}", peer, e);
                        }
                    }
                    Err(e) => {
                        // ICMP unreachable from a previous send surfaces here on some platforms
                        warn!("Receive failed: {}", e);
                        continue;
                    }
                },
                Some(request) = control.recv() => self.handle_control(request).await,
                Some((device_id, room)) = self.dispatcher.next_boost_expiry(), if self.dispatcher.has_boosts() => {
                    if let Some(outbound) = self.dispatcher.boost_timer_fired(device_id, room) {
                        if let Err(e) = self.deliver(outbound, None).await {
                            warn!("Boost clear for {:#010x} not delivered: {}", device_id, e);
                        }
                    }
                }
            }

            self.publish_state();
        }

        info!("Receive loop ended ({} datagrams)", handled);
    }

    async fn handle_datagram(&mut self, datagram: &[u8], peer: SocketAddr) -> Result<()> {
        let Some(mode) = self.sessions.classify(peer, datagram) else {
            trace!("Knock from {}", peer);
            return Ok(());
        };

        let started = Instant::now();
        self.capture("IN", peer, datagram).await;

        let from_cloud = peer == self.settings.cloud;
        let result = if mode == Mode::Direct || (from_cloud && self.settings.decode_cloud) {
            self.handle_direct(datagram, peer).await
        } else if from_cloud {
            self.relay_to_device(datagram, peer).await
        } else {
            self.relay_to_cloud(datagram, peer).await
        };

        let elapsed = started.elapsed();
        debug!("{:?} datagram from {} took {:?}", mode, peer, elapsed);
        let (uri, status) = match &result {
            Ok(name) => (name.clone(), "OK".to_string()),
            Err(e) => (hexdump(datagram), e.to_string()),
        };
        let record = TraceRecord {
            timestamp: Utc::now(),
            source: TraceSource::Udp,
            host: peer.to_string(),
            uri,
            elapsed_ms: elapsed.as_millis() as u64,
            status,
        };
        persistence::report("log_trace", self.persistence.log_trace(record).await);

        result.map(|_| ())
    }

    async fn handle_direct(&mut self, datagram: &[u8], peer: SocketAddr) -> Result<String> {
        let dispatched = self.dispatcher.dispatch(datagram, peer, Direction::Downlink).await?;
        for outbound in dispatched.outbound {
            if let Err(e) = self.deliver(outbound, Some(peer)).await {
                warn!("{} reply not delivered: {}", dispatched.name, e);
            }
        }
        Ok(dispatched.name)
    }

    /// Forward a device datagram to the cloud byte for byte. Observing it
    /// updates state but never alters what is forwarded. Replies to local
    /// commands are not forwarded.
    async fn relay_to_cloud(&mut self, datagram: &[u8], peer: SocketAddr) -> Result<String> {
        self.last_device_peer = Some(peer);
        let observation = self.dispatcher.observe(datagram, peer, Direction::Uplink).await;

        if let Ok(observation) = &observation {
            if observation.local_reply {
                debug!("{} from {} answers a local command, not relayed", observation.name, peer);
                return Ok(observation.name.clone());
            }
        }

        if self.settings.relay_upstream {
            trace!("Relay {} bytes {} -> {}", datagram.len(), peer, self.settings.cloud);
            self.send(datagram, self.settings.cloud).await?;
        }
        observation.map(|observation| observation.name)
    }

    async fn relay_to_device(&mut self, datagram: &[u8], peer: SocketAddr) -> Result<String> {
        let observation = self.dispatcher.observe(datagram, peer, Direction::Downlink).await;

        let target = observation
            .as_ref()
            .ok()
            .and_then(|observation| observation.device_id)
            .and_then(|device_id| self.dispatcher.state().peer_of(device_id))
            .or(self.last_device_peer);

        match target {
            Some(target) => {
                trace!("Relay {} bytes {} -> {}", datagram.len(), peer, target);
                self.send(datagram, target).await?;
            }
            None => warn!("Cloud datagram from {} dropped, no device peer yet", peer),
        }
        observation.map(|observation| observation.name)
    }

    async fn handle_control(&mut self, request: Control) {
        match request {
            Control::Command { device_id, room, attribute, value, cseq, sent } => {
                let outbound = self.dispatcher.command(device_id, room, attribute, value, cseq);
                let result = self.deliver(outbound, None).await;
                if let Err(e) = &result {
                    warn!("Command to {:#010x} not sent: {}", device_id, e);
                }
                let _ = sent.send(result);
            }
        }
    }

    async fn deliver(&self, outbound: Outbound, sender: Option<SocketAddr>) -> Result<()> {
        let target = self.dispatcher.resolve(outbound.destination, sender)?;
        self.send(&outbound.datagram, target).await
    }

    async fn send(&self, datagram: &[u8], target: SocketAddr) -> Result<()> {
        self.capture("OUT", target, datagram).await;
        self.socket
            .send_to(datagram, target)
            .await
            .map_err(|e| GatewayError::io(format!("send to {}", target), e))?;
        Ok(())
    }

    async fn capture(&self, direction: &str, peer: SocketAddr, datagram: &[u8]) {
        if let Some(capture) = &self.capture {
            if let Err(e) = capture.record(direction, &peer.to_string(), &hexdump(datagram)).await {
                warn!("UDP capture failed: {}", e);
            }
        }
    }

    fn publish_state(&self) {
        let snapshot = self.dispatcher.state();
        self.state_tx.send_if_modified(|current| {
            if **current == *snapshot {
                return false;
            }
            *current = Arc::new(snapshot.clone());
            true
        });
    }
}
