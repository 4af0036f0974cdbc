//! UDP transport boundary for one zone.
//!
//! Background tasks receive and decode datagrams, track connections, answer
//! pings and resend reliable events. None of them touch the simulation: they
//! turn traffic into [`ClientEvent`]s on the zone's bounded inbound queue. The
//! zone's tick loop runs in [`ZoneServer::run`] and hands everything it
//! produced back to the sender task.

use crate::client_manager::ConnectionId;
use crate::config::{NetworkConfig, ServerConfig, TickConfig};
use crate::error::{ConnectRefused, ServerError};
use crate::zone::tick::FixedTimestep;
use crate::zone::{ClientEvent, LeaveReason, Outbound, Zone};
use log::{debug, error, info, warn};
use shared::{decode_packet, encode_packet, Packet, ReliableEvent, PROTOCOL_VERSION};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, RwLock};
use tokio::time::{interval, MissedTickBehavior};

/// Datagrams queued for the sender task
#[derive(Debug)]
pub struct SendRequest {
    /// Packet to encode and send
    pub packet: Packet,
    /// Destination address
    pub addr: SocketAddr,
}

/// Smoothed round trip time, seeded by the first sample.
#[derive(Debug, Clone)]
pub struct RttEstimator {
    smoothed: Option<f32>,
    factor: f32,
}

impl RttEstimator {
    /// Creates an estimator with no samples; `factor` is the weight of each new sample
    pub fn new(factor: f32) -> Self {
        Self {
            smoothed: None,
            factor: factor.clamp(0.0, 1.0),
        }
    }

    /// Folds in one measured round trip and returns the updated estimate
    pub fn sample(&mut self, rtt_ms: f32) -> u64 {
        let smoothed = match self.smoothed {
            Some(current) => current + self.factor * (rtt_ms - current),
            None => rtt_ms,
        };
        self.smoothed = Some(smoothed);
        smoothed.round().max(0.0) as u64
    }

    /// Current estimate, `None` until the first sample
    pub fn estimate(&self) -> Option<u64> {
        self.smoothed.map(|rtt| rtt.round().max(0.0) as u64)
    }
}

#[derive(Debug, Clone)]
struct PendingReliable {
    sequence: u32,
    event: ReliableEvent,
    last_sent: Instant,
    attempts: u32,
}

/// Resend-until-acked queue of one connection's reliable events.
#[derive(Debug, Clone, Default)]
pub struct ReliableChannel {
    next_sequence: u32,
    unacked: VecDeque<PendingReliable>,
}

impl ReliableChannel {
    /// Queues an event and returns the packet for its first transmission.
    pub fn push(&mut self, event: ReliableEvent, now: Instant) -> Packet {
        self.next_sequence = self.next_sequence.wrapping_add(1);
        let sequence = self.next_sequence;
        self.unacked.push_back(PendingReliable {
            sequence,
            event: event.clone(),
            last_sent: now,
            attempts: 1,
        });
        Packet::Reliable { sequence, event }
    }

    /// Drops an acknowledged event. False for unknown or repeated acks.
    pub fn ack(&mut self, sequence: u32) -> bool {
        let before = self.unacked.len();
        self.unacked.retain(|pending| pending.sequence != sequence);
        self.unacked.len() != before
    }

    /// Packets due for another attempt. The second value is true when an
    /// event ran out of attempts.
    pub fn due(&mut self, now: Instant, resend: Duration, max_attempts: u32) -> (Vec<Packet>, bool) {
        let mut exhausted = false;
        self.unacked.retain(|pending| {
            let keep = pending.attempts < max_attempts
                || now.duration_since(pending.last_sent) < resend;
            exhausted |= !keep;
            keep
        });
        let packets = self
            .unacked
            .iter_mut()
            .filter(|pending| now.duration_since(pending.last_sent) >= resend)
            .map(|pending| {
                pending.last_sent = now;
                pending.attempts += 1;
                Packet::Reliable {
                    sequence: pending.sequence,
                    event: pending.event.clone(),
                }
            })
            .collect();
        (packets, exhausted)
    }

    /// Events still waiting for an ack
    pub fn pending(&self) -> usize {
        self.unacked.len()
    }
}

/// Transport state of one remote address
///
/// Tracks liveness, the RTT estimate and the reliable channel. Gameplay
/// state lives in the zone's client manager, keyed by the same id.
#[derive(Debug)]
pub struct Connection {
    /// Identifier shared with the zone's client manager
    pub id: ConnectionId,
    /// Address datagrams for this connection are sent to
    pub addr: SocketAddr,
    last_seen: Instant,
    rtt: RttEstimator,
    ping: Option<(u32, Instant)>,
    reliable: ReliableChannel,
}

/// Recent new-connection attempts from one IP address
#[derive(Debug, Default)]
struct ConnectAttempts {
    recent: VecDeque<Instant>,
    blocked_until: Option<Instant>,
}

/// Address to connection mapping plus per-connection transport state.
#[derive(Debug)]
pub struct ConnectionTable {
    by_addr: HashMap<SocketAddr, ConnectionId>,
    connections: HashMap<ConnectionId, Connection>,
    /// Open connections per source IP
    per_ip: HashMap<IpAddr, usize>,
    attempts: HashMap<IpAddr, ConnectAttempts>,
    next_id: u32,
    next_nonce: u32,
    config: NetworkConfig,
}

impl ConnectionTable {
    /// Creates an empty table. Connection ids start at 1.
    pub fn new(config: NetworkConfig) -> Self {
        Self {
            by_addr: HashMap::new(),
            connections: HashMap::new(),
            per_ip: HashMap::new(),
            attempts: HashMap::new(),
            next_id: 1,
            next_nonce: 1,
            config,
        }
    }

    /// The connection for `addr`, created if new. The flag is true for new ones.
    ///
    /// Repeated connects from a known address always succeed. New ones are
    /// refused while the table is full, while the IP already holds its share
    /// of connections, or while the IP is blocked for connecting too often.
    pub fn connect(&mut self, addr: SocketAddr, now: Instant) -> Result<(ConnectionId, bool), ConnectRefused> {
        if let Some(id) = self.by_addr.get(&addr) {
            return Ok((*id, false));
        }
        let ip = addr.ip();
        if !self.config.trusted_addresses.contains(&ip) {
            self.admit(ip, now)?;
        }
        if self.connections.len() >= self.config.max_clients {
            return Err(ConnectRefused::Full);
        }

        let id = ConnectionId(self.next_id);
        self.next_id = self.next_id.wrapping_add(1).max(1);
        self.by_addr.insert(addr, id);
        *self.per_ip.entry(ip).or_default() += 1;
        self.connections.insert(
            id,
            Connection {
                id,
                addr,
                last_seen: now,
                rtt: RttEstimator::new(self.config.rtt_smoothing),
                ping: None,
                reliable: ReliableChannel::default(),
            },
        );
        info!("{} connected from {}", id, addr);
        Ok((id, true))
    }

    /// Applies the per-IP attempt throttle and connection limit.
    fn admit(&mut self, ip: IpAddr, now: Instant) -> Result<(), ConnectRefused> {
        let window = Duration::from_millis(self.config.connect_window_ms);
        let attempts = self.attempts.entry(ip).or_default();
        if attempts.blocked_until.map_or(false, |until| now < until) {
            return Err(ConnectRefused::Blocked);
        }
        attempts.blocked_until = None;
        while attempts
            .recent
            .front()
            .map_or(false, |at| now.duration_since(*at) > window)
        {
            attempts.recent.pop_front();
        }
        attempts.recent.push_back(now);
        if attempts.recent.len() > self.config.max_connect_attempts {
            attempts.recent.clear();
            attempts.blocked_until = Some(now + Duration::from_millis(self.config.connect_block_ms));
            warn!(
                "Blocking {} for {} ms after too many connection attempts",
                ip, self.config.connect_block_ms
            );
            return Err(ConnectRefused::Blocked);
        }

        if self.per_ip.get(&ip).copied().unwrap_or(0) >= self.config.max_connections_per_ip {
            return Err(ConnectRefused::TooManyFromAddress);
        }
        Ok(())
    }

    /// Forgets attempt histories that can no longer affect a decision.
    fn prune_attempts(&mut self, now: Instant) {
        let window = Duration::from_millis(self.config.connect_window_ms);
        self.attempts.retain(|_, attempts| {
            attempts.blocked_until.map_or(false, |until| now < until)
                || attempts
                    .recent
                    .back()
                    .map_or(false, |at| now.duration_since(*at) <= window)
        });
    }

    /// Looks up the connection owning `addr`
    pub fn find(&self, addr: SocketAddr) -> Option<ConnectionId> {
        self.by_addr.get(&addr).copied()
    }

    /// Address of a connection, if it is still open
    pub fn addr(&self, id: ConnectionId) -> Option<SocketAddr> {
        self.connections.get(&id).map(|connection| connection.addr)
    }

    /// Closes a connection and frees its per-address slot
    pub fn remove(&mut self, id: ConnectionId) -> Option<Connection> {
        let connection = self.connections.remove(&id)?;
        self.by_addr.remove(&connection.addr);
        let ip = connection.addr.ip();
        if let Some(count) = self.per_ip.get_mut(&ip) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.per_ip.remove(&ip);
            }
        }
        Some(connection)
    }

    /// Marks a connection as heard from at `now`
    pub fn touch(&mut self, id: ConnectionId, now: Instant) {
        if let Some(connection) = self.connections.get_mut(&id) {
            connection.last_seen = now;
        }
    }

    /// Matches a pong to its ping. Returns the smoothed RTT.
    pub fn pong(&mut self, id: ConnectionId, nonce: u32, now: Instant) -> Option<u64> {
        let connection = self.connections.get_mut(&id)?;
        let (expected, sent) = connection.ping?;
        if expected != nonce {
            return None;
        }
        connection.ping = None;
        let sample = now.duration_since(sent).as_secs_f32() * 1_000.0;
        Some(connection.rtt.sample(sample))
    }

    /// Smoothed RTT of a connection, once a pong has arrived
    pub fn rtt(&self, id: ConnectionId) -> Option<u64> {
        self.connections.get(&id)?.rtt.estimate()
    }

    /// Queues a reliable event and returns its first transmission
    pub fn send_reliable(&mut self, id: ConnectionId, event: ReliableEvent, now: Instant) -> Option<SendRequest> {
        let connection = self.connections.get_mut(&id)?;
        let packet = connection.reliable.push(event, now);
        Some(SendRequest {
            packet,
            addr: connection.addr,
        })
    }

    /// Forwards a reliable ack to the connection's channel
    pub fn ack(&mut self, id: ConnectionId, sequence: u32) -> bool {
        self.connections
            .get_mut(&id)
            .map_or(false, |connection| connection.reliable.ack(sequence))
    }

    /// Removes connections silent for longer than the timeout.
    pub fn check_timeouts(&mut self, now: Instant) -> Vec<ConnectionId> {
        let timeout = Duration::from_millis(self.config.client_timeout_ms);
        let timed_out: Vec<ConnectionId> = self
            .connections
            .values()
            .filter(|connection| now.duration_since(connection.last_seen) > timeout)
            .map(|connection| connection.id)
            .collect();
        for id in &timed_out {
            info!("{} timed out", id);
            self.remove(*id);
        }
        self.prune_attempts(now);
        timed_out
    }

    /// Pings due this round and reliable resends. Connections whose reliable
    /// events ran out of attempts are returned for disconnection.
    pub fn maintenance(&mut self, now: Instant, ping_due: bool) -> (Vec<SendRequest>, Vec<ConnectionId>) {
        let resend = Duration::from_millis(self.config.reliable_resend_ms);
        let max_attempts = self.config.reliable_max_attempts.max(1);
        let mut requests = Vec::new();
        let mut failed = Vec::new();

        for connection in self.connections.values_mut() {
            if ping_due {
                let nonce = self.next_nonce;
                self.next_nonce = self.next_nonce.wrapping_add(1);
                connection.ping = Some((nonce, now));
                requests.push(SendRequest {
                    packet: Packet::Ping { nonce },
                    addr: connection.addr,
                });
            }
            let (packets, exhausted) = connection.reliable.due(now, resend, max_attempts);
            requests.extend(packets.into_iter().map(|packet| SendRequest {
                packet,
                addr: connection.addr,
            }));
            if exhausted {
                failed.push(connection.id);
            }
        }
        (requests, failed)
    }

    /// Number of open connections
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

/// One zone behind one UDP socket
pub struct ZoneServer {
    socket: Arc<UdpSocket>,
    /// Shared with the receiver and maintenance tasks
    connections: Arc<RwLock<ConnectionTable>>,
    zone: Zone,
    tick: TickConfig,
    network: NetworkConfig,
    send_tx: mpsc::UnboundedSender<SendRequest>,
    send_rx: Option<mpsc::UnboundedReceiver<SendRequest>>,
}

impl ZoneServer {
    /// Binds the zone's UDP socket
    ///
    /// No task is started until [`ZoneServer::run`].
    pub async fn bind(addr: &str, zone: Zone, config: &ServerConfig) -> Result<Self, ServerError> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        info!("{} listening on {}", zone.id(), socket.local_addr()?);
        let (send_tx, send_rx) = mpsc::unbounded_channel();

        Ok(ZoneServer {
            socket,
            connections: Arc::new(RwLock::new(ConnectionTable::new(config.network.clone()))),
            zone,
            tick: config.tick.clone(),
            network: config.network.clone(),
            send_tx,
            send_rx: Some(send_rx),
        })
    }

    /// Address the socket is bound to, useful when binding port 0
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.socket.local_addr()?)
    }

    /// Spawns task that continuously listens for incoming packets
    fn spawn_network_receiver(&self) {
        let socket = Arc::clone(&self.socket);
        let connections = Arc::clone(&self.connections);
        let events = self.zone.client_sender();
        let send_tx = self.send_tx.clone();

        tokio::spawn(async move {
            let mut buffer = vec![0u8; 2048];

            loop {
                match socket.recv_from(&mut buffer).await {
                    Ok((len, addr)) => {
                        let now = Instant::now();
                        let event = match decode_packet(&buffer[..len]) {
                            Ok(packet) => {
                                Self::route(&connections, &send_tx, packet, addr, now).await
                            }
                            Err(err) => {
                                let connection = connections.read().await.find(addr);
                                match connection {
                                    Some(connection) => Some(ClientEvent::Malformed { connection }),
                                    None => {
                                        debug!("Undecodable datagram from {}: {}", addr, err);
                                        None
                                    }
                                }
                            }
                        };
                        if let Some(event) = event {
                            if let Err(err) = events.try_send(event) {
                                if let mpsc::error::TrySendError::Closed(_) = err {
                                    break;
                                }
                                warn!("Inbound queue full, dropping event from {}", addr);
                            }
                        }
                    }
                    Err(e) => {
                        error!("Error receiving packet: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        });
    }

    /// Turns one decoded packet into transport bookkeeping and, where the
    /// simulation needs to know, a zone event.
    async fn route(
        connections: &RwLock<ConnectionTable>,
        send_tx: &mpsc::UnboundedSender<SendRequest>,
        packet: Packet,
        addr: SocketAddr,
        now: Instant,
    ) -> Option<ClientEvent> {
        if let Packet::Connect {
            client_version,
            player_id,
        } = packet
        {
            if client_version != PROTOCOL_VERSION {
                warn!("Rejecting {} with protocol version {}", addr, client_version);
                Self::send_disconnected(
                    send_tx,
                    addr,
                    format!("Protocol version {} required", PROTOCOL_VERSION),
                );
                return None;
            }
            let connected = connections.write().await.connect(addr, now);
            return match connected {
                Ok((connection, _)) => Some(ClientEvent::Join {
                    connection,
                    player_id,
                }),
                Err(ConnectRefused::Blocked) => {
                    debug!("Ignoring connect from blocked {}", addr);
                    None
                }
                Err(refused) => {
                    info!("Refused connection from {}: {}", addr, refused);
                    Self::send_disconnected(send_tx, addr, refused.to_string());
                    None
                }
            };
        }

        let mut table = connections.write().await;
        let Some(connection) = table.find(addr) else {
            debug!("Packet from unconnected {}", addr);
            return None;
        };
        table.touch(connection, now);

        match packet {
            Packet::Input(input) => Some(ClientEvent::Input { connection, input }),
            Packet::Ack { reliable_sequence } => {
                table.ack(connection, reliable_sequence);
                None
            }
            Packet::Pong { nonce } => table
                .pong(connection, nonce, now)
                .map(|rtt_ms| ClientEvent::RttSample { connection, rtt_ms }),
            Packet::Disconnect => {
                table.remove(connection);
                Some(ClientEvent::Leave {
                    connection,
                    reason: LeaveReason::Disconnected,
                })
            }
            _ => {
                warn!("Unexpected packet type from {}", connection);
                Some(ClientEvent::Malformed { connection })
            }
        }
    }

    /// Spawns task that processes outgoing packet queue
    fn spawn_network_sender(&mut self) {
        let socket = Arc::clone(&self.socket);
        let Some(mut send_rx) = self.send_rx.take() else {
            return;
        };

        tokio::spawn(async move {
            while let Some(SendRequest { packet, addr }) = send_rx.recv().await {
                match encode_packet(&packet) {
                    Ok(data) => {
                        if let Err(e) = socket.send_to(&data, addr).await {
                            error!("Failed to send packet to {}: {}", addr, e);
                        }
                    }
                    Err(e) => error!("Failed to encode packet for {}: {}", addr, e),
                }
            }
        });
    }

    /// Spawns task that handles timeouts, pings and reliable resends
    fn spawn_maintenance(&self) {
        let connections = Arc::clone(&self.connections);
        let events = self.zone.client_sender();
        let send_tx = self.send_tx.clone();
        let period = Duration::from_millis(self.network.reliable_resend_ms.clamp(10, 1_000) / 2);
        let ping_every = Duration::from_millis(self.network.ping_interval_ms.max(1));

        tokio::spawn(async move {
            let mut ticker = interval(period.max(Duration::from_millis(5)));
            let mut last_ping = Instant::now();

            loop {
                ticker.tick().await;
                let now = Instant::now();
                let ping_due = now.duration_since(last_ping) >= ping_every;
                if ping_due {
                    last_ping = now;
                }

                let (timed_out, requests, failed) = {
                    let mut table = connections.write().await;
                    let timed_out = table.check_timeouts(now);
                    let (requests, failed) = table.maintenance(now, ping_due);
                    for id in &failed {
                        table.remove(*id);
                    }
                    (timed_out, requests, failed)
                };

                for request in requests {
                    if send_tx.send(request).is_err() {
                        return;
                    }
                }
                let leaves = timed_out
                    .into_iter()
                    .chain(failed.into_iter().inspect(|id| {
                        warn!("{} stopped acknowledging reliable events", id);
                    }))
                    .map(|connection| ClientEvent::Leave {
                        connection,
                        reason: LeaveReason::TimedOut,
                    });
                for leave in leaves {
                    if let Err(mpsc::error::TrySendError::Closed(_)) = events.try_send(leave) {
                        return;
                    }
                }
            }
        });
    }

    /// Routes what the zone produced to the sender task.
    async fn dispatch(
        connections: &RwLock<ConnectionTable>,
        send_tx: &mpsc::UnboundedSender<SendRequest>,
        outbound: Vec<Outbound>,
    ) {
        if outbound.is_empty() {
            return;
        }
        let now = Instant::now();
        let mut table = connections.write().await;
        for message in outbound {
            let request = match message {
                Outbound::Unreliable { connection, packet } => table
                    .addr(connection)
                    .map(|addr| SendRequest { packet, addr }),
                Outbound::Reliable { connection, event } => {
                    table.send_reliable(connection, event, now)
                }
                Outbound::Close { connection, reason } => {
                    table.remove(connection).map(|closed| SendRequest {
                        packet: Packet::Disconnected { reason },
                        addr: closed.addr,
                    })
                }
            };
            if let Some(request) = request {
                if send_tx.send(request).is_err() {
                    error!("Sender task is gone");
                    return;
                }
            }
        }
    }

    /// Runs the zone until `shutdown` resolves.
    pub async fn run(mut self, shutdown: impl Future<Output = ()> + Send) -> Result<(), ServerError> {
        self.spawn_network_receiver();
        self.spawn_network_sender();
        self.spawn_maintenance();

        let mut timestep = FixedTimestep::new(self.tick.tick_duration(), self.tick.max_catchup_ticks);
        let mut tick_interval = interval(self.tick.tick_duration());
        tick_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut last_tick = Instant::now();
        tokio::pin!(shutdown);

        info!("{} started at {} Hz", self.zone.id(), self.tick.tick_rate);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("{} shutting down", self.zone.id());
                    break;
                }
                _ = tick_interval.tick() => {
                    let now = Instant::now();
                    let budget = timestep.accumulate(now.duration_since(last_tick));
                    last_tick = now;

                    for _ in 0..budget.run {
                        self.zone.step();
                        let outbound = self.zone.drain_outbound();
                        Self::dispatch(&self.connections, &self.send_tx, outbound).await;
                    }
                }
            }
        }

        let addrs: Vec<SocketAddr> = self
            .connections
            .read()
            .await
            .connections
            .values()
            .map(|connection| connection.addr)
            .collect();
        for addr in addrs {
            Self::send_disconnected(&self.send_tx, addr, "Server shutting down".to_string());
        }
        Ok(())
    }

    /// Tells an address it is not (or no longer) connected.
    fn send_disconnected(send_tx: &mpsc::UnboundedSender<SendRequest>, addr: SocketAddr, reason: String) {
        let request = SendRequest {
            packet: Packet::Disconnected { reason },
            addr,
        };
        if send_tx.send(request).is_err() {
            debug!("Sender task is gone, {} not notified", addr);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MigrationConfig;
    use crate::persistence::{EventLog, InMemorySessionStore, ResilientSessionCache};
    use crate::zone::{WorldPartition, ZoneId};
    use std::net::{IpAddr, Ipv4Addr};

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), port)
    }

    #[test]
    fn test_rtt_seeded_then_smoothed() {
        let mut rtt = RttEstimator::new(0.125);
        assert_eq!(rtt.estimate(), None);
        assert_eq!(rtt.sample(100.0), 100);
        assert_eq!(rtt.sample(180.0), 110);
    }

    #[test]
    fn test_reliable_resend_until_acked() {
        let start = Instant::now();
        let resend = Duration::from_millis(200);
        let mut channel = ReliableChannel::default();
        let packet = channel.push(ReliableEvent::Despawned { entity: 3 }, start);
        let sequence = match packet {
            Packet::Reliable { sequence, .. } => sequence,
            other => panic!("unexpected {:?}", other),
        };

        assert!(channel.due(start + Duration::from_millis(100), resend, 10).0.is_empty());
        assert_eq!(channel.due(start + resend, resend, 10).0.len(), 1);
        assert!(channel.ack(sequence));
        assert_eq!(channel.pending(), 0);
        assert!(channel.due(start + resend * 3, resend, 10).0.is_empty());
    }

    #[test]
    fn test_reliable_gives_up() {
        let start = Instant::now();
        let resend = Duration::from_millis(200);
        let mut channel = ReliableChannel::default();
        channel.push(ReliableEvent::Despawned { entity: 3 }, start);

        let mut exhausted = false;
        for attempt in 1..=3 {
            let (_, gave_up) = channel.due(start + resend * attempt, resend, 3);
            exhausted |= gave_up;
        }
        assert!(exhausted);
        assert_eq!(channel.pending(), 0);
    }

    #[test]
    fn test_connection_table_timeouts() {
        let start = Instant::now();
        let mut table = ConnectionTable::new(NetworkConfig::default());
        let (a, new) = table.connect(addr(1000), start).unwrap();
        assert!(new);
        assert_eq!(table.connect(addr(1000), start), Ok((a, false)));
        let (b, _) = table.connect(addr(1001), start).unwrap();
        assert_ne!(a, b);

        table.touch(b, start + Duration::from_secs(4));
        let timed_out = table.check_timeouts(start + Duration::from_secs(6));
        assert_eq!(timed_out, vec![a]);
        assert_eq!(table.find(addr(1000)), None);
        assert_eq!(table.len(), 1);
    }

    fn remote(last: u8, port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, last)), port)
    }

    #[test]
    fn test_connections_per_address_are_limited() {
        let start = Instant::now();
        let mut table = ConnectionTable::new(NetworkConfig {
            max_connections_per_ip: 2,
            ..NetworkConfig::default()
        });
        let (first, _) = table.connect(remote(1, 1000), start).unwrap();
        table.connect(remote(1, 1001), start).unwrap();
        assert_eq!(
            table.connect(remote(1, 1002), start),
            Err(ConnectRefused::TooManyFromAddress)
        );
        // Other addresses are unaffected
        assert!(table.connect(remote(2, 1000), start).is_ok());

        // A slot frees up once a connection leaves
        table.remove(first);
        assert!(table.connect(remote(1, 1002), start).is_ok());
    }

    #[test]
    fn test_connect_flood_blocks_address() {
        let start = Instant::now();
        let mut table = ConnectionTable::new(NetworkConfig {
            max_connect_attempts: 3,
            connect_window_ms: 1_000,
            connect_block_ms: 5_000,
            ..NetworkConfig::default()
        });
        for port in 0..3 {
            table.connect(remote(1, 2000 + port), start).unwrap();
        }
        assert_eq!(
            table.connect(remote(1, 2003), start),
            Err(ConnectRefused::Blocked)
        );
        // Still blocked after the attempt window, released after the block
        let later = start + Duration::from_secs(2);
        assert_eq!(table.connect(remote(1, 2004), later), Err(ConnectRefused::Blocked));
        let released = start + Duration::from_secs(6);
        assert!(table.connect(remote(1, 2005), released).is_ok());
        assert_eq!(table.len(), 4);
    }

    #[test]
    fn test_table_full_and_trusted_addresses() {
        let start = Instant::now();
        let mut table = ConnectionTable::new(NetworkConfig {
            max_clients: 3,
            max_connections_per_ip: 1,
            ..NetworkConfig::default()
        });
        // Loopback is trusted by default, so the per-address limit does not apply
        table.connect(addr(1000), start).unwrap();
        table.connect(addr(1001), start).unwrap();
        table.connect(remote(1, 1000), start).unwrap();
        assert_eq!(table.connect(remote(2, 1000), start), Err(ConnectRefused::Full));
    }

    #[test]
    fn test_ping_pong_updates_rtt() {
        let start = Instant::now();
        let mut table = ConnectionTable::new(NetworkConfig::default());
        let (id, _) = table.connect(addr(1000), start).unwrap();
        let (requests, _) = table.maintenance(start, true);
        let nonce = match requests[0].packet {
            Packet::Ping { nonce } => nonce,
            ref other => panic!("unexpected {:?}", other),
        };
        assert_eq!(table.pong(id, nonce + 1, start), None);
        assert_eq!(table.pong(id, nonce, start + Duration::from_millis(80)), Some(80));
        assert_eq!(table.rtt(id), Some(80));
    }

    #[tokio::test]
    async fn test_udp_connect_handshake() {
        let config = ServerConfig {
            migration: MigrationConfig {
                zones_x: 1,
                zones_z: 1,
                ..MigrationConfig::default()
            },
            ..ServerConfig::default()
        };
        let partition = Arc::new(WorldPartition::grid(&config.migration, &config.movement));
        let zone = Zone::new(
            ZoneId(0),
            partition,
            config.clone(),
            ResilientSessionCache::in_memory(InMemorySessionStore::new()),
            EventLog::detached(),
        )
        .unwrap();
        let server = ZoneServer::bind("127.0.0.1:0", zone, &config).await.unwrap();
        let server_addr = server.local_addr().unwrap();
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let handle = tokio::spawn(server.run(async {
            let _ = stop_rx.await;
        }));

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let connect = encode_packet(&Packet::Connect {
            client_version: PROTOCOL_VERSION,
            player_id: 77,
        })
        .unwrap();
        client.send_to(&connect, server_addr).await.unwrap();

        let mut buffer = vec![0u8; 2048];
        let connected = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let (len, _) = client.recv_from(&mut buffer).await.unwrap();
                if let Ok(Packet::Connected { player_id, .. }) = decode_packet(&buffer[..len]) {
                    return player_id;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(connected, 77);

        let _ = stop_tx.send(());
        handle.await.unwrap().unwrap();
    }
}
