//! One zone: an independent simulation timeline for a region of the world.
//!
//! A [`Zone`] owns its entity world and every system that touches it. The
//! transport and neighbouring zones never mutate it directly; they enqueue
//! [`ClientEvent`]s and [`migration::ZoneEnvelope`]s which are drained at the
//! start of each [`Zone::step`], and read what the zone produced through
//! [`Zone::drain_outbound`]. One call to `step` is one tick:
//!
//! 1. Drain neighbour messages, then client events
//! 2. Movement, one buffered input per controlled entity
//! 3. Sanctions for movement violations
//! 4. Spatial grid rebuild and lag-compensation frame
//! 5. Attacks, resolved against rewound positions
//! 6. Respawns
//! 7. Migration
//! 8. Replication capture and per-viewer snapshots

pub mod cluster;
pub mod migration;
pub mod partition;
pub mod tick;

pub use partition::{WorldPartition, ZoneBounds, ZoneDefinition, ZoneId};

use crate::client_manager::{ClientManager, ConnectionId, InputDisposition};
use crate::combat::{AttackKind, AttackOutcome, AttackRequest, CombatResolver, HitEvent, HitOutcome, PendingHit};
use crate::components::{CombatState, EntityKind, GlobalId, Transform, VelocityState};
use crate::config::ServerConfig;
use crate::error::{ServerError, WorldError};
use crate::history::LagCompensator;
use crate::movement::MovementSystem;
use crate::persistence::{CombatLogEntry, EventLog, ResilientSessionCache, SessionRecord};
use crate::physics::Vec3;
use crate::replication::ReplicationEngine;
use crate::spatial::SpatialGrid;
use crate::validation::{MovementValidator, Sanction};
use crate::world::{EntityId, World};
use log::{debug, info, warn};
use migration::{
    zone_channel, MigrantSnapshot, MigrationEvent, MigrationManager, MigrationState,
    MigrationStats, ZoneMessage, ZoneReceiver, ZoneSender,
};
use shared::{ActionFlags, InputRecord, Packet, ProtocolError, ReliableEvent};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Attacker id reported when the attacker is not in this zone.
const UNKNOWN_ENTITY: u32 = u32::MAX;

/// Why a client left the zone
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveReason {
    Disconnected,
    TimedOut,
    Kicked,
}

impl fmt::Display for LeaveReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LeaveReason::Disconnected => write!(f, "disconnected"),
            LeaveReason::TimedOut => write!(f, "timed out"),
            LeaveReason::Kicked => write!(f, "kicked"),
        }
    }
}

/// Transport-side happenings, queued for the next tick.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// `player_id` 0 asks the zone to assign one.
    Join { connection: ConnectionId, player_id: u64 },
    Input { connection: ConnectionId, input: InputRecord },
    RttSample { connection: ConnectionId, rtt_ms: u64 },
    /// A packet from this connection failed to decode.
    Malformed { connection: ConnectionId },
    Leave { connection: ConnectionId, reason: LeaveReason },
}

/// What the zone wants the transport to do.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Unreliable { connection: ConnectionId, packet: Packet },
    Reliable { connection: ConnectionId, event: ReliableEvent },
    Close { connection: ConnectionId, reason: String },
}

/// Running counters for one zone, reported in the periodic tick log
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ZoneStats {
    /// Attack actions received
    pub attacks: u64,
    /// Hits applied to a target
    pub hits: u64,
    /// Hits rejected because their key was already applied
    pub duplicate_hits: u64,
    /// Attacks rejected because the rewind target was out of reach
    pub unverifiable_attacks: u64,
    /// Clients disconnected for violations or protocol errors
    pub kicks: u64,
    /// Snapshots handed to the transport
    pub snapshots: u64,
    /// Estimated bytes of those snapshots
    pub snapshot_bytes: u64,
}

/// One authoritative zone
///
/// Owns every entity inside its region and advances them one tick at a
/// time. All mutation happens on the thread calling [`Zone::step`];
/// clients and neighbours reach it only through bounded queues.
pub struct Zone {
    definition: ZoneDefinition,
    config: ServerConfig,
    world: World,
    grid: SpatialGrid,
    movement: MovementSystem,
    validator: MovementValidator,
    lag: LagCompensator,
    combat: CombatResolver,
    replication: ReplicationEngine,
    migration: MigrationManager,
    clients: ClientManager,
    sessions: ResilientSessionCache,
    events: EventLog,
    client_tx: mpsc::Sender<ClientEvent>,
    client_rx: mpsc::Receiver<ClientEvent>,
    zone_tx: ZoneSender,
    zone_rx: ZoneReceiver,
    outbound: Vec<Outbound>,
    tick: u32,
    next_serial: u32,
    stats: ZoneStats,
}

impl Zone {
    /// Builds a zone for `id` from the shared partition
    ///
    /// The zone starts empty with its inbound queues open. Neighbours are
    /// linked afterwards with [`Zone::connect_neighbor`].
    pub fn new(
        id: ZoneId,
        partition: Arc<WorldPartition>,
        config: ServerConfig,
        sessions: ResilientSessionCache,
        events: EventLog,
    ) -> Result<Self, ServerError> {
        let definition = partition
            .zone(id)
            .cloned()
            .ok_or_else(|| ServerError::Config(format!("{} is not in the world partition", id)))?;
        let (client_tx, client_rx) = mpsc::channel(config.network.inbound_queue.max(1));
        let (zone_tx, zone_rx) = zone_channel(config.migration.channel_capacity);

        Ok(Self {
            world: World::new(EntityId::MAX_SLOTS),
            grid: SpatialGrid::new(&config.spatial),
            movement: MovementSystem::new(config.movement.clone(), config.tick.dt()),
            validator: MovementValidator::new(config.anti_cheat.clone()),
            lag: LagCompensator::new(&config.lag_compensation),
            combat: CombatResolver::new(config.combat.clone(), config.spatial.clone()),
            replication: ReplicationEngine::new(config.replication.clone()),
            migration: MigrationManager::new(id, partition, config.migration.clone()),
            clients: ClientManager::new(config.network.max_clients, config.anti_cheat.clone()),
            definition,
            config,
            sessions,
            events,
            client_tx,
            client_rx,
            zone_tx,
            zone_rx,
            outbound: Vec::new(),
            tick: 1,
            next_serial: 1,
            stats: ZoneStats::default(),
        })
    }

    /// This zone's id
    pub fn id(&self) -> ZoneId {
        self.definition.id
    }

    pub fn definition(&self) -> &ZoneDefinition {
        &self.definition
    }

    /// Number of the last completed tick
    pub fn tick(&self) -> u32 {
        self.tick
    }

    /// Simulation time of the current tick.
    pub fn now_ms(&self) -> u64 {
        self.config.tick.tick_to_ms(self.tick)
    }

    /// Read access to the entity world
    pub fn world(&self) -> &World {
        &self.world
    }

    /// Write access to the entity world, outside the tick
    pub fn world_mut(&mut self) -> &mut World {
        &mut self.world
    }

    /// Clients connected to this zone
    pub fn clients(&self) -> &ClientManager {
        &self.clients
    }

    pub fn replication(&self) -> &ReplicationEngine {
        &self.replication
    }

    pub fn lag_compensator(&self) -> &LagCompensator {
        &self.lag
    }

    /// Snapshot of the zone counters
    pub fn stats(&self) -> ZoneStats {
        self.stats
    }

    /// Hand-off counters of this zone
    pub fn migration_stats(&self) -> MigrationStats {
        self.migration.stats()
    }

    pub fn sessions_mut(&mut self) -> &mut ResilientSessionCache {
        &mut self.sessions
    }

    /// Queue the transport feeds client events into.
    pub fn client_sender(&self) -> mpsc::Sender<ClientEvent> {
        self.client_tx.clone()
    }

    /// Queue neighbouring zones send migration messages into.
    pub fn zone_sender(&self) -> ZoneSender {
        self.zone_tx.clone()
    }

    /// Links the inbound queue of an adjacent zone
    pub fn connect_neighbor(&mut self, neighbor: ZoneId, sender: ZoneSender) {
        self.migration.connect(neighbor, sender);
    }

    /// Takes everything produced since the last call, in order
    pub fn drain_outbound(&mut self) -> Vec<Outbound> {
        std::mem::take(&mut self.outbound)
    }

    /// Migration state of a global entity held here, if any.
    pub fn migration_state(&self, global: GlobalId) -> Option<MigrationState> {
        let id = self.world.find_global(global)?;
        Some(self.world.get::<MigrationState>(id).copied().unwrap_or_default())
    }

    /// Spawns a non-player character owned by this zone.
    pub fn spawn_npc(&mut self, position: Vec3, team: u8) -> Result<EntityId, WorldError> {
        let global = GlobalId::spawned(self.id().0, self.next_serial);
        self.next_serial = self.next_serial.wrapping_add(1);
        self.spawn(global, EntityKind::Npc, position, team)
    }

    fn spawn(
        &mut self,
        global: GlobalId,
        kind: EntityKind,
        position: Vec3,
        team: u8,
    ) -> Result<EntityId, WorldError> {
        let id = self.world.create_with_global(global)?;
        let mut transform = Transform::at(self.movement.clamp_to_world(position));
        transform.tick = self.tick;
        self.world.set(id, transform)?;
        self.world.set(id, VelocityState::default())?;
        self.world
            .set(id, CombatState::new(self.config.combat.max_health, team))?;
        self.world.set(id, kind)?;
        self.world.set(id, MigrationState::Local)?;
        debug!("Spawned {} as {} in {}", global, id, self.id());
        Ok(id)
    }

    /// Runs one tick.
    pub fn step(&mut self) {
        let now = self.now_ms();

        self.drain_zone_messages(now);
        self.drain_client_events(now);

        let inputs = self.clients.take_inputs();
        let mut by_entity = HashMap::with_capacity(inputs.len());
        for (_, entity, input) in &inputs {
            if let Some(combat) = self.world.get_mut::<CombatState>(*entity) {
                combat.blocking = input.actions.contains(ActionFlags::BLOCK);
            }
            by_entity.insert(*entity, input.clone());
        }
        let reports = self
            .movement
            .run(&mut self.world, &self.validator, &by_entity, self.tick, now);
        for report in reports {
            if report.sanction == Sanction::Disconnect {
                if let Some(connection) = self.clients.find_by_entity(report.entity) {
                    self.kick(connection, "repeated movement violations", now);
                }
            }
        }

        self.rebuild_grid();
        self.lag.record(self.tick, now, &self.world);

        for (connection, entity, input) in &inputs {
            if let Some(kind) = AttackKind::from_actions(input.actions) {
                self.attack(*connection, *entity, kind, input, now);
            }
        }

        self.respawn(now);

        let events = self.migration.update(&mut self.world, now);
        self.handle_migration_events(events, now);
        if self.migration.reap(&mut self.world) > 0 {
            self.rebuild_grid();
        }

        self.replicate();

        if self.config.tick.stats_interval_ticks > 0
            && self.tick % self.config.tick.stats_interval_ticks == 0
        {
            let migration = self.migration.stats();
            debug!(
                "{} tick {}: {} entities, {} clients, {} hits, {} snapshots ({} bytes), migrations {}/{}/{}/{} (started/completed/aborted/forced)",
                self.id(),
                self.tick,
                self.world.len(),
                self.clients.len(),
                self.stats.hits,
                self.stats.snapshots,
                self.stats.snapshot_bytes,
                migration.started,
                migration.completed,
                migration.aborted,
                migration.force_resolved
            );
        }
        self.tick = self.tick.wrapping_add(1);
    }

    /// Applies every queued message from neighbouring zones
    fn drain_zone_messages(&mut self, now: u64) {
        while let Ok(envelope) = self.zone_rx.try_recv() {
            let events = self
                .migration
                .handle(&mut self.world, envelope, self.tick, now);
            self.handle_migration_events(events, now);
        }
    }

    fn drain_client_events(&mut self, now: u64) {
        while let Ok(event) = self.client_rx.try_recv() {
            self.handle_client_event(event, now);
        }
    }

    /// Applies one client event immediately. The tick loop does this for
    /// every queued event; tests may call it directly.
    pub fn handle_client_event(&mut self, event: ClientEvent, now: u64) {
        match event {
            ClientEvent::Join {
                connection,
                player_id,
            } => self.join(connection, player_id, now),
            ClientEvent::Input { connection, input } => {
                if let Err(err) = input.validate() {
                    self.malformed(connection, &err, now);
                    return;
                }
                if let Err(err) = self.replication.acknowledge(connection, input.ack_tick) {
                    self.malformed(connection, &err, now);
                    return;
                }
                match self.clients.add_input(connection, input, now) {
                    InputDisposition::RateLimited => {
                        let err = ProtocolError::OutOfRange { field: "input rate" };
                        self.malformed(connection, &err, now);
                    }
                    InputDisposition::UnknownClient => {
                        debug!("Input from unjoined {}", connection);
                    }
                    _ => {}
                }
            }
            ClientEvent::RttSample { connection, rtt_ms } => {
                self.clients.set_rtt(connection, rtt_ms);
            }
            ClientEvent::Malformed { connection } => {
                let err = ProtocolError::OutOfRange { field: "packet" };
                self.malformed(connection, &err, now);
            }
            ClientEvent::Leave { connection, reason } => self.leave(connection, reason, now),
        }
    }

    /// Counts a protocol error against a client, kicking it over the limit
    fn malformed(&mut self, connection: ConnectionId, err: &ProtocolError, now: u64) {
        let over_limit = self.clients.record_malformed(connection);
        let count = self.clients.get(connection).map_or(0, |client| client.malformed);
        if count.is_power_of_two() {
            warn!("Malformed input from {} ({} so far): {}", connection, count, err);
        }
        if over_limit {
            self.kick(connection, "too many malformed packets", now);
        }
    }

    /// Admits a player: resumes a saved session, takes over a migrated
    /// entity, or spawns a fresh one. Players standing in another zone are
    /// redirected there.
    fn join(&mut self, connection: ConnectionId, player_id: u64, now: u64) {
        let player_id = if player_id == 0 {
            self.assign_player_id()
        } else {
            player_id
        };

        if let Some(existing) = self.clients.get(connection) {
            // Repeated connect; answer again.
            if let Some(entity) = existing.entity {
                let player_id = existing.player_id;
                self.send_connected(connection, player_id, entity);
            }
            return;
        }
        if !self.clients.add_client(connection, player_id) {
            info!("{} refused {}: zone full", self.id(), connection);
            self.outbound.push(Outbound::Unreliable {
                connection,
                packet: Packet::Disconnected {
                    reason: "Server full".to_string(),
                },
            });
            self.outbound.push(Outbound::Close {
                connection,
                reason: "Server full".to_string(),
            });
            return;
        }

        let global = GlobalId::player(player_id);
        let entity = match self.world.find_global(global) {
            Some(id) => {
                let state = self.world.get::<MigrationState>(id).copied().unwrap_or_default();
                match state.owner() {
                    Some(owner) if !state.is_authoritative() => {
                        self.redirect(connection, owner, player_id);
                        return;
                    }
                    _ => Ok(id),
                }
            }
            None => match self.sessions.load(player_id) {
                Some(record) => {
                    let home = self
                        .migration
                        .partition()
                        .zone_at(record.snapshot.transform.position);
                    if home != self.id() {
                        self.redirect(connection, home, player_id);
                        return;
                    }
                    self.sessions.remove(player_id);
                    self.restore(&record.snapshot)
                }
                None => self.spawn(
                    global,
                    EntityKind::Player,
                    self.definition.spawn_point,
                    player_team(player_id),
                ),
            },
        };

        let entity = match entity {
            Ok(entity) => entity,
            Err(err) => {
                warn!("{} could not place player {}: {}", self.id(), player_id, err);
                self.clients.remove_client(connection);
                self.outbound.push(Outbound::Close {
                    connection,
                    reason: "No room in zone".to_string(),
                });
                return;
            }
        };

        if let Some(previous) = self.clients.find_by_entity(entity) {
            if previous != connection {
                self.kick(previous, "logged in elsewhere", now);
            }
        }
        self.bind(connection, entity);
        self.send_connected(connection, player_id, entity);
        info!("Player {} controls {} in {}", player_id, entity, self.id());
    }

    fn restore(&mut self, snapshot: &MigrantSnapshot) -> Result<EntityId, WorldError> {
        let id = self.world.create_with_global(snapshot.global)?;
        snapshot.apply(&mut self.world, id, self.tick)?;
        self.world.set(id, MigrationState::Local)?;
        Ok(id)
    }

    /// Gives a connection control of an entity and makes it a viewer
    fn bind(&mut self, connection: ConnectionId, entity: EntityId) {
        self.clients.bind_entity(connection, Some(entity));
        if let Err(err) = self.world.set(entity, connection) {
            debug!("{} not bound to {}: {}", connection, entity, err);
        }
        if self.replication.viewer(connection).is_some() {
            self.replication.set_viewer_entity(connection, Some(entity));
        } else {
            self.replication.add_viewer(connection, Some(entity));
        }
    }

    fn unbind(&mut self, connection: ConnectionId, entity: EntityId) {
        self.clients.bind_entity(connection, None);
        self.world.remove::<ConnectionId>(entity);
        self.replication.set_viewer_entity(connection, None);
    }

    fn send_connected(&mut self, connection: ConnectionId, player_id: u64, entity: EntityId) {
        self.outbound.push(Outbound::Unreliable {
            connection,
            packet: Packet::Connected {
                client_id: connection.0,
                player_id,
                entity: entity.to_raw(),
                zone: self.id().0,
                tick_rate: self.config.tick.tick_rate,
            },
        });
    }

    /// Tells a client to reconnect to the zone that owns it
    fn redirect(&mut self, connection: ConnectionId, zone: ZoneId, player_id: u64) {
        info!("{} redirects player {} to {}", self.id(), player_id, zone);
        self.outbound.push(Outbound::Reliable {
            connection,
            event: ReliableEvent::ZoneRedirect {
                zone: zone.0,
                player_id,
            },
        });
    }

    fn assign_player_id(&mut self) -> u64 {
        let id = ((self.id().0 as u64 + 1) << 32) | self.next_serial as u64;
        self.next_serial = self.next_serial.wrapping_add(1);
        id
    }

    /// Saves and despawns a departing player's entity
    fn leave(&mut self, connection: ConnectionId, reason: LeaveReason, now: u64) {
        self.replication.remove_viewer(connection);
        let Some(client) = self.clients.remove_client(connection) else {
            return;
        };
        info!("{} left {} ({})", connection, self.id(), reason);

        let Some(entity) = client.entity.filter(|entity| self.world.contains(*entity)) else {
            return;
        };
        let state = self.world.get::<MigrationState>(entity).copied().unwrap_or_default();
        if !state.is_simulated() {
            // Mid hand-off; the entity's fate is with the neighbour now.
            self.world.remove::<ConnectionId>(entity);
            return;
        }
        if let MigrationState::Projected { target, .. } = state {
            if let Some(global) = self.world.global(entity) {
                self.migration.send(target, ZoneMessage::ShadowDrop { global });
            }
        }
        if let Some(snapshot) = MigrantSnapshot::capture(&self.world, entity) {
            self.sessions.save(&SessionRecord {
                player_id: client.player_id,
                zone: self.id().0,
                saved_ms: now,
                snapshot,
            });
        }
        if let Err(err) = self.world.destroy(entity) {
            debug!("Despawn of {} failed: {}", entity, err);
        }
        self.broadcast(ReliableEvent::Despawned {
            entity: entity.to_raw(),
        });
    }

    /// Disconnects a client with a reason it is told about
    fn kick(&mut self, connection: ConnectionId, reason: &str, now: u64) {
        if self.clients.get(connection).is_none() {
            return;
        }
        warn!("Kicking {} from {}: {}", connection, self.id(), reason);
        self.stats.kicks += 1;
        self.outbound.push(Outbound::Reliable {
            connection,
            event: ReliableEvent::Kicked {
                reason: reason.to_string(),
            },
        });
        self.outbound.push(Outbound::Close {
            connection,
            reason: reason.to_string(),
        });
        self.leave(connection, LeaveReason::Kicked, now);
    }

    fn broadcast(&mut self, event: ReliableEvent) {
        for connection in self.clients.ids() {
            self.outbound.push(Outbound::Reliable {
                connection,
                event: event.clone(),
            });
        }
    }

    fn rebuild_grid(&mut self) {
        self.grid.clear();
        for (id, transform) in self.world.iter::<Transform>() {
            self.grid.insert(id, transform.position);
        }
    }

    /// Resolves one attack action and applies or forwards its hits
    fn attack(
        &mut self,
        connection: ConnectionId,
        attacker: EntityId,
        kind: AttackKind,
        input: &InputRecord,
        now: u64,
    ) {
        let rtt_ms = self.clients.get(connection).map_or(0, |client| client.rtt_ms);
        let request = AttackRequest {
            attacker,
            kind,
            yaw: input.yaw_radians(),
            pitch: input.pitch_radians(),
            sequence: input.sequence,
            ack_tick: input.ack_tick,
            rtt_ms,
        };
        self.stats.attacks += 1;
        match self.combat.resolve(&mut self.world, &self.lag, &request, now) {
            AttackOutcome::Hits(hits) => {
                for hit in hits {
                    self.land_hit(hit, now);
                }
            }
            AttackOutcome::Unverifiable(_) => self.stats.unverifiable_attacks += 1,
            AttackOutcome::Miss | AttackOutcome::OnCooldown | AttackOutcome::Ineligible => {}
        }
    }

    /// Applies a hit here, or forwards it when another zone owns the target.
    fn land_hit(&mut self, hit: PendingHit, now: u64) {
        let state = self
            .world
            .get::<MigrationState>(hit.target)
            .copied()
            .unwrap_or_default();
        if let Some(owner) = state.owner() {
            self.migration.forward_hit(owner, &hit);
            return;
        }
        match self.combat.apply_hit(&mut self.world, &hit, now) {
            HitOutcome::Applied(event) => self.confirm_hit(event, now),
            HitOutcome::Duplicate => {
                self.stats.duplicate_hits += 1;
                debug!(
                    "Duplicate hit {}#{} on {} ignored",
                    hit.key.attacker, hit.key.sequence, hit.key.target
                );
            }
            HitOutcome::TargetGone => {}
        }
    }

    /// Reports an applied hit to both parties and the event log
    fn confirm_hit(&mut self, event: HitEvent, now: u64) {
        self.stats.hits += 1;
        if event.killed {
            info!("{} killed {} in {}", event.key.attacker, event.key.target, self.id());
        }
        let confirmation = ReliableEvent::HitConfirmed {
            attacker: event.attacker.map_or(UNKNOWN_ENTITY, EntityId::to_raw),
            target: event.target.to_raw(),
            damage: event.damage,
            killed: event.killed,
            tick: self.tick,
        };
        let mut recipients: Vec<ConnectionId> = [event.attacker, Some(event.target)]
            .into_iter()
            .flatten()
            .filter_map(|entity| self.world.get::<ConnectionId>(entity).copied())
            .collect();
        recipients.dedup();
        for connection in recipients {
            self.outbound.push(Outbound::Reliable {
                connection,
                event: confirmation.clone(),
            });
        }

        self.events.record(CombatLogEntry {
            timestamp_ms: now,
            zone: self.id().0,
            tick: self.tick,
            attacker: event.key.attacker,
            target: event.key.target,
            sequence: event.key.sequence,
            damage: event.damage,
            killed: event.killed,
            critical: event.critical,
        });
    }

    fn respawn(&mut self, now: u64) {
        for id in self.combat.due_respawns(&self.world, now) {
            let simulated = self
                .world
                .get::<MigrationState>(id)
                .map_or(true, MigrationState::is_simulated);
            if !simulated {
                continue;
            }
            if let Some(combat) = self.world.get_mut::<CombatState>(id) {
                combat.revive();
            }
            let mut transform = Transform::at(self.definition.spawn_point);
            transform.tick = self.tick;
            if let Err(err) = self
                .world
                .set(id, transform)
                .and(self.world.set(id, VelocityState::default()))
            {
                debug!("Respawn of {} failed: {}", id, err);
                continue;
            }
            if let Some(connection) = self.world.get::<ConnectionId>(id).copied() {
                let kind = self.world.get::<EntityKind>(id).copied().unwrap_or_default();
                self.outbound.push(Outbound::Reliable {
                    connection,
                    event: ReliableEvent::Spawned {
                        entity: id.to_raw(),
                        kind: kind as u8,
                    },
                });
            }
            debug!("{} respawned in {}", id, self.id());
        }
    }

    fn handle_migration_events(&mut self, events: Vec<MigrationEvent>, now: u64) {
        for event in events {
            match event {
                MigrationEvent::Departed { entity, global, to } => {
                    if let Some(connection) = self.clients.find_by_entity(entity) {
                        if let Some(player_id) = global.player_id() {
                            self.redirect(connection, to, player_id);
                        }
                        self.unbind(connection, entity);
                    }
                }
                MigrationEvent::Adopted { entity, global } => {
                    let waiting = global
                        .player_id()
                        .and_then(|player_id| self.clients.find_by_player(player_id))
                        .filter(|connection| {
                            self.clients
                                .get(*connection)
                                .map_or(false, |client| client.entity.is_none())
                        });
                    if let Some(connection) = waiting {
                        self.bind(connection, entity);
                    }
                }
                MigrationEvent::Removed { entity, .. } => {
                    if let Some(connection) = self.clients.find_by_entity(entity) {
                        self.unbind(connection, entity);
                    }
                }
                MigrationEvent::HitReceived(hit) => self.land_hit(hit, now),
            }
        }
    }

    /// Builds and queues this tick's snapshot for every viewer
    fn replicate(&mut self) {
        self.replication.capture(self.tick, &self.world);
        let clients = &self.clients;
        let built = self.replication.build_all(self.tick, &self.world, &self.grid, |connection| {
            clients.last_processed_input(connection)
        });
        for (connection, snapshot) in built {
            self.stats.snapshots += 1;
            self.stats.snapshot_bytes += snapshot.estimated_bytes as u64;
            self.outbound.push(Outbound::Unreliable {
                connection,
                packet: Packet::Snapshot(snapshot.snapshot),
            });
        }
    }
}

/// Players each get a team of their own unless ids collide modulo 255, so
/// friendly fire settings only matter for NPC teams by default.
fn player_team(player_id: u64) -> u8 {
    1 + (player_id % 255) as u8
}
