//! KNX bus adapter
//!
//! Speaks KNXnet/IP over UDP in two modes: tunneling to a gateway and
//! multicast routing. Inbound group telegrams are resolved against the
//! configured `(group address -> entity, operation)` map and dispatched as
//! `Source=Knx` commands; outbound status writes go through a bounded queue
//! that drops the oldest entry on overflow.
//!
//! The connection policy owns an auto-reconnect timer (default 30 s), armed
//! on connect failure or heartbeat loss and cleared on success.

pub mod addr;
pub mod dpt;
pub mod frame;

use std::collections::{HashMap, VecDeque};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::{watch, Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::adapters::knx::addr::GroupAddress;
use crate::adapters::knx::dpt::GroupValue;
use crate::adapters::knx::frame::{GroupTelegram, InboundFrame};
use crate::bus::commands::{ClientOp, Command, CommandEnvelope, CommandSource, ZoneOp};
use crate::bus::SharedMediator;
use crate::config::{AppConfig, KnxConfig, KnxConnectionType};
use crate::error::{Error, Result};
use crate::stats::{bump, Stats};

/// Ack wait per tunneled telegram.
const ACK_TIMEOUT: Duration = Duration::from_secs(3);

/// Heartbeat interval for tunnel connection-state checks.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);

// =============================================================================
// Inbound command mapping
// =============================================================================

/// What a telegram on a mapped group address means.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KnxBinding {
    ZonePlay(usize),
    ZonePause(usize),
    ZoneStop(usize),
    ZoneNext(usize),
    ZonePrevious(usize),
    ZoneVolume(usize),
    ZoneMute(usize),
    ZoneTrack(usize),
    ZonePlaylist(usize),
    ZoneRepeatTrack(usize),
    ZoneRepeatPlaylist(usize),
    ZoneShuffle(usize),
    ClientVolume(usize),
    ClientMute(usize),
    ClientZone(usize),
}

/// Build the inbound `(ga -> binding)` map from configuration.
fn command_map(config: &AppConfig) -> HashMap<GroupAddress, KnxBinding> {
    let mut map = HashMap::new();
    for (i, zone) in config.zones.iter().enumerate() {
        let index = i + 1;
        let Some(knx) = &zone.knx else { continue };
        let mut add = |ga: &Option<GroupAddress>, binding: KnxBinding| {
            if let Some(ga) = ga {
                map.insert(*ga, binding);
            }
        };
        add(&knx.play, KnxBinding::ZonePlay(index));
        add(&knx.pause, KnxBinding::ZonePause(index));
        add(&knx.stop, KnxBinding::ZoneStop(index));
        add(&knx.next, KnxBinding::ZoneNext(index));
        add(&knx.previous, KnxBinding::ZonePrevious(index));
        add(&knx.volume, KnxBinding::ZoneVolume(index));
        add(&knx.mute, KnxBinding::ZoneMute(index));
        add(&knx.track, KnxBinding::ZoneTrack(index));
        add(&knx.playlist, KnxBinding::ZonePlaylist(index));
        add(&knx.repeat_track, KnxBinding::ZoneRepeatTrack(index));
        add(&knx.repeat_playlist, KnxBinding::ZoneRepeatPlaylist(index));
        add(&knx.shuffle, KnxBinding::ZoneShuffle(index));
    }
    for (i, client) in config.clients.iter().enumerate() {
        let index = i + 1;
        let Some(knx) = &client.knx else { continue };
        let mut add = |ga: &Option<GroupAddress>, binding: KnxBinding| {
            if let Some(ga) = ga {
                map.insert(*ga, binding);
            }
        };
        add(&knx.volume, KnxBinding::ClientVolume(index));
        add(&knx.mute, KnxBinding::ClientMute(index));
        add(&knx.zone, KnxBinding::ClientZone(index));
    }
    map
}

/// Translate one bound telegram into a command, if the value is actionable.
fn telegram_to_command(binding: KnxBinding, value: &GroupValue) -> Option<Command> {
    let command = match binding {
        // Trigger GAs act on `true` only; the off edge is not a command
        KnxBinding::ZonePlay(zone) => value.as_bool().then_some(Command::Zone {
            zone,
            op: ZoneOp::Play,
        })?,
        KnxBinding::ZonePause(zone) => value.as_bool().then_some(Command::Zone {
            zone,
            op: ZoneOp::Pause,
        })?,
        KnxBinding::ZoneStop(zone) => value.as_bool().then_some(Command::Zone {
            zone,
            op: ZoneOp::Stop,
        })?,
        KnxBinding::ZoneNext(zone) => value.as_bool().then_some(Command::Zone {
            zone,
            op: ZoneOp::NextTrack,
        })?,
        KnxBinding::ZonePrevious(zone) => value.as_bool().then_some(Command::Zone {
            zone,
            op: ZoneOp::PreviousTrack,
        })?,
        KnxBinding::ZoneVolume(zone) => Command::Zone {
            zone,
            op: ZoneOp::SetVolume {
                volume: value.as_int() as i64,
            },
        },
        KnxBinding::ZoneMute(zone) => Command::Zone {
            zone,
            op: ZoneOp::SetMute {
                mute: value.as_bool(),
            },
        },
        KnxBinding::ZoneTrack(zone) => Command::Zone {
            zone,
            op: ZoneOp::PlayTrack {
                index: value.as_int() as i64,
            },
        },
        KnxBinding::ZonePlaylist(zone) => Command::Zone {
            zone,
            op: ZoneOp::LoadPlaylist {
                index: value.as_int() as i64,
            },
        },
        KnxBinding::ZoneRepeatTrack(zone) => Command::Zone {
            zone,
            op: ZoneOp::SetTrackRepeat {
                enabled: value.as_bool(),
            },
        },
        KnxBinding::ZoneRepeatPlaylist(zone) => Command::Zone {
            zone,
            op: ZoneOp::SetPlaylistRepeat {
                enabled: value.as_bool(),
            },
        },
        KnxBinding::ZoneShuffle(zone) => Command::Zone {
            zone,
            op: ZoneOp::SetShuffle {
                enabled: value.as_bool(),
            },
        },
        KnxBinding::ClientVolume(client) => Command::Client {
            client,
            op: ClientOp::SetVolume {
                volume: value.as_int() as i64,
            },
        },
        KnxBinding::ClientMute(client) => Command::Client {
            client,
            op: ClientOp::SetMute {
                mute: value.as_bool(),
            },
        },
        KnxBinding::ClientZone(client) => Command::Client {
            client,
            op: ClientOp::AssignZone {
                zone: value.as_int() as i64,
            },
        },
    };
    Some(command)
}

// =============================================================================
// Outbound queue
// =============================================================================

/// An outbound bus operation.
#[derive(Debug, Clone, PartialEq)]
enum OutboundItem {
    Write(GroupTelegram),
    Read(GroupAddress),
}

/// Bounded outbound queue with drop-oldest overflow semantics.
struct OutboundQueue {
    items: Mutex<VecDeque<OutboundItem>>,
    capacity: usize,
    notify: Notify,
}

impl OutboundQueue {
    fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            capacity,
            notify: Notify::new(),
        }
    }

    async fn push(&self, item: OutboundItem) -> bool {
        let mut items = self.items.lock().await;
        let dropped = if items.len() == self.capacity {
            items.pop_front();
            true
        } else {
            false
        };
        items.push_back(item);
        drop(items);
        self.notify.notify_one();
        dropped
    }

    async fn pop(&self) -> OutboundItem {
        loop {
            if let Some(item) = self.items.lock().await.pop_front() {
                return item;
            }
            self.notify.notified().await;
        }
    }
}

// =============================================================================
// Adapter
// =============================================================================

pub struct KnxAdapter {
    config: KnxConfig,
    bindings: HashMap<GroupAddress, KnxBinding>,
    mediator: SharedMediator,
    outbound: OutboundQueue,
    connected: AtomicBool,
    connected_tx: watch::Sender<bool>,
    stats: Arc<Stats>,
    shutdown: CancellationToken,
}

impl KnxAdapter {
    pub fn new(
        config: KnxConfig,
        app: &AppConfig,
        mediator: SharedMediator,
        stats: Arc<Stats>,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        let (connected_tx, _) = watch::channel(false);
        Arc::new(Self {
            bindings: command_map(app),
            outbound: OutboundQueue::new(config.outbound_queue),
            config,
            mediator,
            connected: AtomicBool::new(false),
            connected_tx,
            stats,
            shutdown,
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn connected_watch(&self) -> watch::Receiver<bool> {
        self.connected_tx.subscribe()
    }

    /// Queue a group-value write. Returns immediately; overflow drops the
    /// oldest queued telegram.
    pub async fn write_group_value(&self, ga: GroupAddress, value: GroupValue) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::unavailable("knx is not connected"));
        }
        let dropped = self
            .outbound
            .push(OutboundItem::Write(GroupTelegram {
                destination: ga,
                value,
            }))
            .await;
        if dropped {
            bump(&self.stats.counters.knx_publish_failures);
            warn!(ga = %ga, "knx outbound queue full, dropped oldest telegram");
        }
        Ok(())
    }

    /// Request the value of a group address. The GroupValueResponse arrives
    /// as a regular telegram through the inbound pipeline.
    pub async fn read_group_value(&self, ga: GroupAddress) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::unavailable("knx is not connected"));
        }
        self.outbound.push(OutboundItem::Read(ga)).await;
        Ok(())
    }

    fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
        let _ = self.connected_tx.send(connected);
    }

    /// Run the connection loop until shutdown.
    pub async fn run(self: Arc<Self>) {
        let reconnect = Duration::from_secs(self.config.reconnect_secs);
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }
            let result = match self.config.connection {
                KnxConnectionType::Tunnel => self.run_tunnel().await,
                KnxConnectionType::Routing => self.run_routing().await,
                // Rejected by config validation; unreachable in practice
                KnxConnectionType::Usb => Err(Error::invalid("usb mode unsupported")),
            };
            self.set_connected(false);
            match result {
                Ok(()) => break,
                Err(e) => {
                    warn!(error = %e, retry_in = ?reconnect, "knx connection failed");
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(reconnect) => {}
                    }
                }
            }
        }
        info!("knx adapter stopped");
    }

    async fn resolve_peer(&self) -> Result<SocketAddrV4> {
        let target = format!("{}:{}", self.config.host, self.config.port);
        let mut addrs = tokio::net::lookup_host(&target)
            .await
            .map_err(|e| Error::unavailable(format!("resolve {}: {}", target, e)))?;
        addrs
            .find_map(|a| match a {
                SocketAddr::V4(v4) => Some(v4),
                SocketAddr::V6(_) => None,
            })
            .ok_or_else(|| Error::unavailable(format!("{} has no IPv4 address", target)))
    }

    async fn run_tunnel(&self) -> Result<()> {
        let peer = self.resolve_peer().await?;
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(peer).await?;
        let local = match socket.local_addr()? {
            SocketAddr::V4(v4) => v4,
            SocketAddr::V6(_) => return Err(Error::internal("bound to IPv6 unexpectedly")),
        };

        // Connect handshake
        socket.send(&frame::connect_request(local)).await?;
        let mut buf = [0u8; 512];
        let n = tokio::time::timeout(ACK_TIMEOUT, socket.recv(&mut buf))
            .await
            .map_err(|_| Error::unavailable("knx gateway did not answer connect"))??;
        let channel = match frame::decode(&buf[..n])? {
            InboundFrame::ConnectResponse { channel, status: 0 } => channel,
            InboundFrame::ConnectResponse { status, .. } => {
                return Err(Error::unavailable(format!(
                    "knx gateway refused tunnel (status 0x{:02x})",
                    status
                )));
            }
            other => {
                return Err(Error::external(format!(
                    "unexpected reply to connect: {:?}",
                    other
                )));
            }
        };

        info!(gateway = %peer, channel, "knx tunnel established");
        self.set_connected(true);

        let mut seq: u8 = 0;
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        heartbeat.reset();

        let result: Result<()> = loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    let _ = socket.send(&frame::disconnect_request(channel, local)).await;
                    break Ok(());
                }

                _ = heartbeat.tick() => {
                    socket.send(&frame::connectionstate_request(channel, local)).await?;
                }

                item = self.outbound.pop() => {
                    let datagram = match &item {
                        OutboundItem::Write(telegram) => {
                            frame::tunneling_request(channel, seq, telegram)
                        }
                        OutboundItem::Read(ga) => {
                            frame::tunneling_read_request(channel, seq, *ga)
                        }
                    };
                    socket.send(&datagram).await?;
                    // Wait for the matching ack inline; telegram rate is low
                    let acked = self.await_ack(&socket, channel, seq).await?;
                    if !acked {
                        break Err(Error::timeout("knx gateway did not ack telegram"));
                    }
                    seq = seq.wrapping_add(1);
                }

                received = socket.recv(&mut buf) => {
                    let n = received?;
                    match frame::decode(&buf[..n]) {
                        Ok(InboundFrame::Tunneling { channel: ch, seq, telegram }) => {
                            socket.send(&frame::tunneling_ack(ch, seq)).await?;
                            if let Some(t) = telegram {
                                self.dispatch_telegram(t);
                            }
                        }
                        Ok(InboundFrame::DisconnectRequest { .. }) => {
                            break Err(Error::unavailable("knx gateway disconnected the tunnel"));
                        }
                        Ok(InboundFrame::ConnectionstateResponse { status, .. }) => {
                            if status != 0 {
                                break Err(Error::unavailable("knx tunnel heartbeat failed"));
                            }
                        }
                        Ok(_) => {}
                        Err(e) => {
                            debug!(error = %e, frame = %hex::encode(&buf[..n]), "undecodable knx datagram")
                        }
                    }
                }
            }
        };

        result
    }

    /// Read datagrams until the ack for (channel, seq) arrives, processing
    /// interleaved inbound telegrams on the way.
    async fn await_ack(&self, socket: &UdpSocket, channel: u8, seq: u8) -> Result<bool> {
        let mut buf = [0u8; 512];
        let deadline = tokio::time::Instant::now() + ACK_TIMEOUT;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Ok(false);
            }
            let n = match tokio::time::timeout(remaining, socket.recv(&mut buf)).await {
                Ok(result) => result?,
                Err(_) => return Ok(false),
            };
            match frame::decode(&buf[..n]) {
                Ok(InboundFrame::TunnelingAck {
                    channel: ch,
                    seq: s,
                    status,
                }) if ch == channel && s == seq => {
                    return if status == 0 {
                        Ok(true)
                    } else {
                        Err(Error::external(format!(
                            "knx gateway rejected telegram (status 0x{:02x})",
                            status
                        )))
                    };
                }
                Ok(InboundFrame::Tunneling {
                    channel: ch,
                    seq,
                    telegram,
                }) => {
                    socket.send(&frame::tunneling_ack(ch, seq)).await?;
                    if let Some(t) = telegram {
                        self.dispatch_telegram(t);
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    debug!(error = %e, frame = %hex::encode(&buf[..n]), "undecodable knx datagram")
                }
            }
        }
    }

    async fn run_routing(&self) -> Result<()> {
        let peer = self.resolve_peer().await?;
        let multicast = *peer.ip();
        if !multicast.is_multicast() {
            return Err(Error::invalid(format!(
                "routing mode requires a multicast address, got {}",
                multicast
            )));
        }

        let socket = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, peer.port())).await?;
        socket.join_multicast_v4(multicast, Ipv4Addr::UNSPECIFIED)?;

        info!(group = %multicast, port = peer.port(), "knx routing joined");
        self.set_connected(true);

        let mut buf = [0u8; 512];
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break Ok(()),

                item = self.outbound.pop() => {
                    let datagram = match &item {
                        OutboundItem::Write(telegram) => frame::routing_indication(telegram),
                        OutboundItem::Read(ga) => frame::routing_read_indication(*ga),
                    };
                    socket.send_to(&datagram, SocketAddr::V4(peer)).await?;
                }

                received = socket.recv_from(&mut buf) => {
                    let (n, _) = received?;
                    match frame::decode(&buf[..n]) {
                        Ok(InboundFrame::Routing { telegram: Some(t) }) => {
                            self.dispatch_telegram(t);
                        }
                        Ok(_) => {}
                        Err(e) => {
                            debug!(error = %e, frame = %hex::encode(&buf[..n]), "undecodable knx datagram")
                        }
                    }
                }
            }
        }
    }

    /// Resolve a telegram against the binding map and dispatch the command.
    fn dispatch_telegram(&self, telegram: GroupTelegram) {
        let Some(binding) = self.bindings.get(&telegram.destination) else {
            debug!(ga = %telegram.destination, "telegram on unmapped group address");
            return;
        };
        let Some(command) = telegram_to_command(*binding, &telegram.value) else {
            return;
        };

        debug!(ga = %telegram.destination, ?command, "knx command");
        let mediator = self.mediator.clone();
        let stats = self.stats.clone();
        tokio::spawn(async move {
            bump(&stats.counters.commands_processed);
            if let Err(e) = mediator
                .send(CommandEnvelope::new(CommandSource::Knx, command))
                .await
            {
                bump(&stats.counters.commands_failed);
                stats.record_error("knx", &e);
                warn!(error = %e, "knx command failed");
            }
        });
    }
}
