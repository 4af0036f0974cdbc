//! Load generator: connects a number of UDP bots that wander randomly,
//! occasionally swing at whatever is in front of them, and follow zone
//! redirects across the cluster.

use clap::Parser;
use log::{debug, error, info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use server::replication::apply_snapshot;
use shared::{
    decode_packet, encode_packet, timestamp_millis, ActionFlags, EntityState, InputRecord, Packet,
    ReliableEvent, PROTOCOL_VERSION,
};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::{interval, Instant, MissedTickBehavior};

#[derive(Parser, Debug, Clone)]
#[clap(author, version, about)]
struct Args {
    /// Server IP address
    #[clap(short = 'H', long, default_value = "127.0.0.1")]
    host: String,
    /// Port of zone 0
    #[clap(short, long, default_value_t = shared::DEFAULT_PORT)]
    port: u16,
    /// Zone to connect to first
    #[clap(short, long, default_value = "0")]
    zone: u16,
    /// Number of bots
    #[clap(short, long, default_value = "10")]
    bots: u32,
    /// Seconds to run before disconnecting
    #[clap(short, long, default_value = "30")]
    duration: u64,
    /// Input rate per bot
    #[clap(short, long, default_value = "60")]
    rate: u32,
    /// Chance of attacking on any given input
    #[clap(long, default_value = "0.02")]
    attack_chance: f64,
}

/// Snapshot frames older than this many ticks behind the newest are discarded.
const KEPT_FRAMES: u32 = 64;

#[derive(Debug, Default)]
struct BotStats {
    snapshots: u64,
    snapshot_bytes: u64,
    unusable_snapshots: u64,
    hits: u64,
    redirects: u64,
    last_seen_entities: usize,
}

struct Bot {
    index: u32,
    socket: UdpSocket,
    host: String,
    base_port: u16,
    server: SocketAddr,
    player_id: u64,
    entity: Option<u32>,
    sequence: u32,
    ack_tick: u32,
    frames: HashMap<u32, HashMap<u32, EntityState>>,
    seen_reliable: HashSet<u32>,
    heading: (f32, f32),
    yaw: f32,
    rng: StdRng,
    stats: BotStats,
}

impl Bot {
    async fn connect(index: u32, args: &Args) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        let server: SocketAddr = format!("{}:{}", args.host, args.port + args.zone).parse()?;
        let mut bot = Bot {
            index,
            socket,
            host: args.host.clone(),
            base_port: args.port,
            server,
            player_id: 0,
            entity: None,
            sequence: 0,
            ack_tick: 0,
            frames: HashMap::new(),
            seen_reliable: HashSet::new(),
            heading: (0.0, 1.0),
            yaw: 0.0,
            rng: StdRng::from_entropy(),
            stats: BotStats::default(),
        };
        bot.send_connect().await;
        Ok(bot)
    }

    async fn send(&self, packet: &Packet, addr: SocketAddr) {
        match encode_packet(packet) {
            Ok(data) => {
                if let Err(e) = self.socket.send_to(&data, addr).await {
                    warn!("bot {}: send to {} failed: {}", self.index, addr, e);
                }
            }
            Err(e) => error!("bot {}: encode failed: {}", self.index, e),
        }
    }

    async fn send_connect(&self) {
        let packet = Packet::Connect {
            client_version: PROTOCOL_VERSION,
            player_id: self.player_id,
        };
        self.send(&packet, self.server).await;
    }

    async fn send_input(&mut self, attack_chance: f64) {
        if self.entity.is_none() {
            return;
        }
        // Change direction now and then
        if self.rng.gen_bool(0.02) {
            self.heading = (self.rng.gen_range(-1.0..=1.0), self.rng.gen_range(-1.0..=1.0));
            self.yaw = self.rng.gen_range(-std::f32::consts::PI..std::f32::consts::PI);
        }

        let mut actions = ActionFlags::default();
        if self.rng.gen_bool(attack_chance.clamp(0.0, 1.0)) {
            actions = actions.with(ActionFlags::ATTACK);
        }
        if self.rng.gen_bool(0.1) {
            actions = actions.with(ActionFlags::SPRINT);
        }

        self.sequence = self.sequence.wrapping_add(1);
        let input = InputRecord::new(self.sequence, timestamp_millis())
            .with_move(self.heading.0, self.heading.1)
            .with_look(self.yaw, 0.0)
            .with_actions(actions)
            .with_ack(self.ack_tick);
        self.send(&Packet::Input(input), self.server).await;
    }

    async fn handle(&mut self, packet: Packet, from: SocketAddr, len: usize) {
        match packet {
            Packet::Connected {
                client_id,
                player_id,
                entity,
                zone,
                ..
            } if from == self.server => {
                debug!(
                    "bot {}: connected as client {} player {} entity {} in zone {}",
                    self.index, client_id, player_id, entity, zone
                );
                self.player_id = player_id;
                self.entity = Some(entity);
            }
            Packet::Snapshot(snapshot) if from == self.server => {
                self.stats.snapshots += 1;
                self.stats.snapshot_bytes += len as u64;
                if snapshot.server_tick <= self.ack_tick {
                    return;
                }
                match apply_snapshot(&self.frames, &snapshot) {
                    Some(frame) => {
                        self.stats.last_seen_entities = frame.len();
                        self.frames.insert(snapshot.server_tick, frame);
                        self.ack_tick = snapshot.server_tick;
                        let oldest = self.ack_tick.saturating_sub(KEPT_FRAMES);
                        self.frames.retain(|tick, _| *tick >= oldest);
                    }
                    None => self.stats.unusable_snapshots += 1,
                }
            }
            Packet::Ping { nonce } => self.send(&Packet::Pong { nonce }, from).await,
            Packet::Reliable { sequence, event } => {
                self.send(&Packet::Ack { reliable_sequence: sequence }, from).await;
                if from != self.server || !self.seen_reliable.insert(sequence) {
                    return;
                }
                self.handle_event(event, from).await;
            }
            Packet::Disconnected { reason } if from == self.server => {
                warn!("bot {}: disconnected: {}", self.index, reason);
                self.entity = None;
            }
            _ => {}
        }
    }

    async fn handle_event(&mut self, event: ReliableEvent, from: SocketAddr) {
        match event {
            ReliableEvent::HitConfirmed { attacker, .. } if Some(attacker) == self.entity => {
                self.stats.hits += 1;
            }
            ReliableEvent::ZoneRedirect { zone, player_id } => {
                let Ok(next) = format!("{}:{}", self.host, self.base_port as u32 + zone)
                    .parse::<SocketAddr>()
                else {
                    error!("bot {}: bad redirect to zone {}", self.index, zone);
                    return;
                };
                info!("bot {}: redirected to zone {} at {}", self.index, zone, next);
                self.send(&Packet::Disconnect, from).await;
                self.stats.redirects += 1;
                self.server = next;
                self.player_id = player_id;
                self.entity = None;
                self.ack_tick = 0;
                self.frames.clear();
                self.seen_reliable.clear();
                self.send_connect().await;
            }
            ReliableEvent::Kicked { reason } => {
                warn!("bot {}: kicked: {}", self.index, reason);
                self.entity = None;
            }
            _ => {}
        }
    }

    async fn run(mut self, args: Args) -> BotStats {
        let mut buffer = vec![0u8; 65_536];
        let mut input_timer = interval(Duration::from_secs_f64(1.0 / args.rate.max(1) as f64));
        input_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut reconnect_timer = interval(Duration::from_secs(1));
        let deadline = Instant::now() + Duration::from_secs(args.duration);

        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => break,
                _ = input_timer.tick() => self.send_input(args.attack_chance).await,
                _ = reconnect_timer.tick() => {
                    if self.entity.is_none() {
                        self.send_connect().await;
                    }
                }
                received = self.socket.recv_from(&mut buffer) => match received {
                    Ok((len, from)) => match decode_packet(&buffer[..len]) {
                        Ok(packet) => self.handle(packet, from, len).await,
                        Err(e) => warn!("bot {}: undecodable packet: {}", self.index, e),
                    },
                    Err(e) => {
                        error!("bot {}: receive failed: {}", self.index, e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                },
            }
        }

        self.send(&Packet::Disconnect, self.server).await;
        self.stats
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let args = Args::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    info!(
        "Starting {} bots against {}:{} for {}s",
        args.bots,
        args.host,
        args.port + args.zone,
        args.duration
    );

    let mut handles = Vec::new();
    for index in 0..args.bots {
        let bot = Bot::connect(index, &args).await?;
        handles.push(tokio::spawn(bot.run(args.clone())));
    }

    let mut total = BotStats::default();
    for handle in handles {
        match handle.await {
            Ok(stats) => {
                total.snapshots += stats.snapshots;
                total.snapshot_bytes += stats.snapshot_bytes;
                total.unusable_snapshots += stats.unusable_snapshots;
                total.hits += stats.hits;
                total.redirects += stats.redirects;
                total.last_seen_entities = total.last_seen_entities.max(stats.last_seen_entities);
            }
            Err(e) => error!("Bot task panicked: {}", e),
        }
    }

    let average = if total.snapshots == 0 {
        0
    } else {
        total.snapshot_bytes / total.snapshots
    };
    info!(
        "{} snapshots ({} bytes avg, {} unusable), {} hits, {} redirects, up to {} entities in view",
        total.snapshots,
        average,
        total.unusable_snapshots,
        total.hits,
        total.redirects,
        total.last_seen_entities
    );
    Ok(())
}
