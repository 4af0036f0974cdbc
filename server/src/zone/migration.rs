//! Authority hand-off between neighbouring zones.
//!
//! Every entity a zone holds carries a [`MigrationState`]:
//!
//! - `Local`: this zone simulates it and nobody else holds a copy.
//! - `Projected`: it is inside the aura band and the neighbour holds a
//!   shadow fed with updates every tick. Once it crosses the edge an offer
//!   is sent and it stops being simulated until the neighbour answers.
//! - `Handoff`: the neighbour accepted; what remains here is a ghost kept
//!   briefly for in-flight interactions.
//! - `Shadow`: a read-only copy of an entity another zone owns.
//! - `Remote`: gone from this zone, reaped at the end of the update.
//!
//! Authority only moves through an accepted offer or a forced resolution,
//! and the sender gives up simulating before the receiver starts, so no
//! entity is `Local` in two zones at once. Messages travel over bounded
//! channels and are applied on the receiver's own tick.

use super::partition::{WorldPartition, ZoneId};
use crate::combat::{AttackKind, PendingHit};
use crate::components::{CombatState, EntityKind, GlobalId, HitKey, Transform, VelocityState};
use crate::config::MigrationConfig;
use crate::error::WorldError;
use crate::validation::ViolationTracker;
use crate::world::{EntityId, World};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingOffer {
    pub sequence: u32,
    pub sent_ms: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum MigrationState {
    #[default]
    Local,
    Projected {
        target: ZoneId,
        since_ms: u64,
        offer: Option<PendingOffer>,
    },
    Handoff {
        target: ZoneId,
        since_ms: u64,
    },
    Shadow {
        owner: ZoneId,
        updated_ms: u64,
    },
    Remote,
}

impl MigrationState {
    /// Whether movement and respawn run for the entity in this zone.
    pub fn is_simulated(&self) -> bool {
        matches!(
            self,
            MigrationState::Local | MigrationState::Projected { offer: None, .. }
        )
    }

    /// Whether this zone owns the entity's state.
    pub fn is_authoritative(&self) -> bool {
        matches!(
            self,
            MigrationState::Local | MigrationState::Projected { .. }
        )
    }

    /// Zone that owns an entity held here without authority.
    pub fn owner(&self) -> Option<ZoneId> {
        match self {
            MigrationState::Handoff { target, .. } => Some(*target),
            MigrationState::Shadow { owner, .. } => Some(*owner),
            _ => None,
        }
    }
}

/// Everything needed to recreate an entity in another zone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrantSnapshot {
    pub global: GlobalId,
    pub kind: EntityKind,
    pub transform: Transform,
    pub velocity: Option<VelocityState>,
    pub combat: Option<CombatState>,
    pub violations: Option<ViolationTracker>,
}

impl MigrantSnapshot {
    pub fn capture(world: &World, id: EntityId) -> Option<Self> {
        Some(Self {
            global: world.global(id)?,
            kind: world.get::<EntityKind>(id).copied().unwrap_or_default(),
            transform: *world.get::<Transform>(id)?,
            velocity: world.get::<VelocityState>(id).copied(),
            combat: world.get::<CombatState>(id).cloned(),
            violations: world.get::<ViolationTracker>(id).cloned(),
        })
    }

    /// Writes the snapshot's components onto `id`, stamping the local tick.
    pub fn apply(&self, world: &mut World, id: EntityId, tick: u32) -> Result<(), WorldError> {
        let mut transform = self.transform;
        transform.tick = tick;
        world.set(id, transform)?;
        world.set(id, self.kind)?;
        if let Some(velocity) = self.velocity {
            world.set(id, velocity)?;
        }
        if let Some(combat) = &self.combat {
            world.set(id, combat.clone())?;
        }
        if let Some(violations) = &self.violations {
            world.set(id, violations.clone())?;
        }
        Ok(())
    }

    /// Finds the entity for this snapshot's global id or creates one.
    fn materialize(&self, world: &mut World, tick: u32) -> Option<EntityId> {
        let id = match world.find_global(self.global) {
            Some(id) => id,
            None => world.create_with_global(self.global).ok()?,
        };
        if let Err(err) = self.apply(world, id, tick) {
            debug!("Could not materialize {}: {}", self.global, err);
            return None;
        }
        Some(id)
    }
}

/// A hit landed on a shadow or ghost, forwarded to the owning zone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteHit {
    pub key: HitKey,
    pub damage: u16,
    pub kind: AttackKind,
    pub critical: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ZoneMessage {
    ShadowCreate(MigrantSnapshot),
    ShadowUpdate(MigrantSnapshot),
    ShadowDrop { global: GlobalId },
    HandoffOffer { sequence: u32, snapshot: MigrantSnapshot },
    HandoffAccept { global: GlobalId, sequence: u32 },
    HandoffReject { global: GlobalId, sequence: u32 },
    /// Authority moves without an answer; sent when an offer timed out.
    ForceAuthority(MigrantSnapshot),
    RemoteHit(RemoteHit),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ZoneEnvelope {
    pub from: ZoneId,
    pub message: ZoneMessage,
}

pub type ZoneSender = mpsc::Sender<ZoneEnvelope>;
pub type ZoneReceiver = mpsc::Receiver<ZoneEnvelope>;

pub fn zone_channel(capacity: usize) -> (ZoneSender, ZoneReceiver) {
    mpsc::channel(capacity.max(1))
}

/// Things the zone has to act on after a migration step.
#[derive(Debug, Clone, PartialEq)]
pub enum MigrationEvent {
    /// Authority over the entity left for `to`; its controller should follow.
    Departed {
        entity: EntityId,
        global: GlobalId,
        to: ZoneId,
    },
    /// The entity became local here.
    Adopted { entity: EntityId, global: GlobalId },
    /// The entity is about to be destroyed.
    Removed { entity: EntityId, global: GlobalId },
    /// A hit on an entity we own, landed in another zone.
    HitReceived(PendingHit),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MigrationStats {
    pub started: u64,
    pub completed: u64,
    pub aborted: u64,
    pub force_resolved: u64,
    pub adopted: u64,
    pub dropped_messages: u64,
}

pub struct MigrationManager {
    zone: ZoneId,
    partition: Arc<WorldPartition>,
    config: MigrationConfig,
    links: HashMap<ZoneId, ZoneSender>,
    /// Earliest time each entity may start projecting again.
    cooldowns: HashMap<GlobalId, u64>,
    next_offer: u32,
    stats: MigrationStats,
}

impl MigrationManager {
    pub fn new(zone: ZoneId, partition: Arc<WorldPartition>, config: MigrationConfig) -> Self {
        Self {
            zone,
            partition,
            config,
            links: HashMap::new(),
            cooldowns: HashMap::new(),
            next_offer: 1,
            stats: MigrationStats::default(),
        }
    }

    pub fn zone(&self) -> ZoneId {
        self.zone
    }

    pub fn partition(&self) -> &WorldPartition {
        &self.partition
    }

    pub fn stats(&self) -> MigrationStats {
        self.stats
    }

    pub fn connect(&mut self, neighbor: ZoneId, sender: ZoneSender) {
        self.links.insert(neighbor, sender);
    }

    pub fn is_linked(&self, zone: ZoneId) -> bool {
        self.links.contains_key(&zone)
    }

    /// Sends without waiting. A full or closed channel drops the message.
    pub fn send(&mut self, to: ZoneId, message: ZoneMessage) -> bool {
        let Some(link) = self.links.get(&to) else {
            return false;
        };
        match link.try_send(ZoneEnvelope {
            from: self.zone,
            message,
        }) {
            Ok(()) => true,
            Err(err) => {
                self.stats.dropped_messages += 1;
                debug!("{} -> {} migration message dropped: {}", self.zone, to, err);
                false
            }
        }
    }

    /// Routes a hit on a non-authoritative entity to its owner.
    pub fn forward_hit(&mut self, owner: ZoneId, hit: &PendingHit) -> bool {
        self.send(
            owner,
            ZoneMessage::RemoteHit(RemoteHit {
                key: hit.key,
                damage: hit.damage,
                kind: hit.kind,
                critical: hit.critical,
            }),
        )
    }

    /// Advances every entity's migration state and reaps removed ones.
    pub fn update(&mut self, world: &mut World, now_ms: u64) -> Vec<MigrationEvent> {
        let mut events = Vec::new();
        self.cooldowns.retain(|_, until| *until > now_ms);
        let tracked: Vec<(EntityId, GlobalId, MigrationState)> = world
            .entities()
            .filter_map(|id| {
                let global = world.global(id)?;
                let state = world.get::<MigrationState>(id).copied().unwrap_or_default();
                Some((id, global, state))
            })
            .collect();

        for (id, global, state) in tracked {
            let next = self.step(world, id, global, state, now_ms, &mut events);
            if next != state {
                if let Err(err) = world.set(id, next) {
                    debug!("Migration state of {} not stored: {}", global, err);
                }
            }
        }

        let removed: Vec<(EntityId, GlobalId)> = world
            .iter::<MigrationState>()
            .filter(|(_, state)| **state == MigrationState::Remote)
            .filter_map(|(id, _)| Some((id, world.global(id)?)))
            .collect();
        for (entity, global) in removed {
            events.push(MigrationEvent::Removed { entity, global });
        }
        events
    }

    /// Destroys entities marked `Remote`. Run after the zone has handled
    /// the `Removed` events.
    pub fn reap(&mut self, world: &mut World) -> usize {
        let removed: Vec<EntityId> = world
            .iter::<MigrationState>()
            .filter(|(_, state)| **state == MigrationState::Remote)
            .map(|(id, _)| id)
            .collect();
        for id in &removed {
            if let Err(err) = world.destroy(*id) {
                debug!("Reaping {} failed: {}", id, err);
            }
        }
        removed.len()
    }

    fn step(
        &mut self,
        world: &World,
        id: EntityId,
        global: GlobalId,
        state: MigrationState,
        now_ms: u64,
        events: &mut Vec<MigrationEvent>,
    ) -> MigrationState {
        let Some(position) = world.get::<Transform>(id).map(|t| t.position) else {
            return state;
        };
        match state {
            MigrationState::Local => {
                let cooling = self
                    .cooldowns
                    .get(&global)
                    .map_or(false, |until| now_ms < *until);
                let here = self.partition.zone_at(position);
                if cooling {
                    return state;
                }
                if here != self.zone && self.is_linked(here) {
                    // Crossed without a projection; offer directly.
                    return match self.offer(world, id, here, now_ms, now_ms) {
                        Some(next) => {
                            self.stats.started += 1;
                            next
                        }
                        None => state,
                    };
                }
                match self.partition.neighbor_toward(self.zone, position) {
                    Some(target) if self.is_linked(target) => {
                        let Some(snapshot) = MigrantSnapshot::capture(world, id) else {
                            return state;
                        };
                        if self.send(target, ZoneMessage::ShadowCreate(snapshot)) {
                            self.stats.started += 1;
                            info!("{} projected into {} from {}", global, target, self.zone);
                            MigrationState::Projected {
                                target,
                                since_ms: now_ms,
                                offer: None,
                            }
                        } else {
                            state
                        }
                    }
                    _ => state,
                }
            }
            MigrationState::Projected {
                target,
                since_ms,
                offer: None,
            } => {
                let here = self.partition.zone_at(position);
                if here == target {
                    return self.offer(world, id, target, since_ms, now_ms).unwrap_or(state);
                }
                let still_bound = self.partition.neighbor_toward(self.zone, position)
                    == Some(target)
                    && here == self.zone;
                let expired = now_ms.saturating_sub(since_ms) > self.config.max_projection_ms;
                if !still_bound || expired {
                    self.send(target, ZoneMessage::ShadowDrop { global });
                    self.abort(global, now_ms);
                    info!(
                        "{} projection into {} aborted ({})",
                        global,
                        target,
                        if expired { "expired" } else { "left aura" }
                    );
                    return MigrationState::Local;
                }
                if let Some(snapshot) = MigrantSnapshot::capture(world, id) {
                    self.send(target, ZoneMessage::ShadowUpdate(snapshot));
                }
                state
            }
            MigrationState::Projected {
                target,
                offer: Some(offer),
                ..
            } => {
                if now_ms.saturating_sub(offer.sent_ms) < self.config.handoff_timeout_ms {
                    return state;
                }
                // Frozen since the offer, so still inside the target's territory.
                let resolved = self.partition.zone_at(position);
                let Some(snapshot) = MigrantSnapshot::capture(world, id) else {
                    return state;
                };
                if self.send(target, ZoneMessage::ForceAuthority(snapshot)) {
                    self.stats.force_resolved += 1;
                    warn!(
                        "{} hand-off to {} timed out after {} ms, forced (geographically in {})",
                        global,
                        target,
                        now_ms.saturating_sub(offer.sent_ms),
                        resolved
                    );
                    events.push(MigrationEvent::Departed {
                        entity: id,
                        global,
                        to: target,
                    });
                    MigrationState::Remote
                } else {
                    state
                }
            }
            MigrationState::Handoff { since_ms, .. } => {
                if now_ms.saturating_sub(since_ms) >= self.config.ghost_lifetime_ms {
                    MigrationState::Remote
                } else {
                    state
                }
            }
            MigrationState::Shadow { owner, updated_ms } => {
                if now_ms.saturating_sub(updated_ms) > self.config.shadow_timeout_ms {
                    debug!("Stale shadow of {} from {} dropped", global, owner);
                    MigrationState::Remote
                } else {
                    state
                }
            }
            MigrationState::Remote => state,
        }
    }

    fn offer(
        &mut self,
        world: &World,
        id: EntityId,
        target: ZoneId,
        since_ms: u64,
        now_ms: u64,
    ) -> Option<MigrationState> {
        let snapshot = MigrantSnapshot::capture(world, id)?;
        let sequence = self.next_offer;
        let global = snapshot.global;
        if !self.send(target, ZoneMessage::HandoffOffer { sequence, snapshot }) {
            return None;
        }
        self.next_offer = self.next_offer.wrapping_add(1).max(1);
        info!("{} offered to {} (offer {})", global, target, sequence);
        Some(MigrationState::Projected {
            target,
            since_ms,
            offer: Some(PendingOffer {
                sequence,
                sent_ms: now_ms,
            }),
        })
    }

    fn abort(&mut self, global: GlobalId, now_ms: u64) {
        self.stats.aborted += 1;
        self.cooldowns
            .insert(global, now_ms + self.config.reproject_cooldown_ms);
    }

    /// Applies one message from a neighbour.
    pub fn handle(
        &mut self,
        world: &mut World,
        envelope: ZoneEnvelope,
        tick: u32,
        now_ms: u64,
    ) -> Vec<MigrationEvent> {
        let from = envelope.from;
        let mut events = Vec::new();
        match envelope.message {
            ZoneMessage::ShadowCreate(snapshot) | ZoneMessage::ShadowUpdate(snapshot) => {
                let existing = world
                    .find_global(snapshot.global)
                    .map(|id| world.get::<MigrationState>(id).copied().unwrap_or_default());
                match existing {
                    Some(state) if state.is_authoritative() => {
                        warn!(
                            "{} sent a shadow of {} which {} owns; ignored",
                            from, snapshot.global, self.zone
                        );
                    }
                    Some(MigrationState::Shadow { owner, .. }) if owner != from => {
                        debug!("Shadow of {} from {} ignored, held for {}", snapshot.global, from, owner);
                    }
                    _ => {
                        if let Some(id) = snapshot.materialize(world, tick) {
                            let shadow = MigrationState::Shadow {
                                owner: from,
                                updated_ms: now_ms,
                            };
                            if let Err(err) = world.set(id, shadow) {
                                debug!("Shadow of {} not stored: {}", snapshot.global, err);
                            }
                        }
                    }
                }
            }
            ZoneMessage::ShadowDrop { global } => {
                if let Some(id) = world.find_global(global) {
                    if matches!(
                        world.get::<MigrationState>(id),
                        Some(MigrationState::Shadow { owner, .. }) if *owner == from
                    ) {
                        if let Err(err) = world.set(id, MigrationState::Remote) {
                            debug!("Shadow of {} not dropped: {}", global, err);
                        }
                    }
                }
            }
            ZoneMessage::HandoffOffer { sequence, snapshot } => {
                let global = snapshot.global;
                match self.adopt(world, &snapshot, tick, now_ms) {
                    Some(entity) => {
                        self.send(from, ZoneMessage::HandoffAccept { global, sequence });
                        info!("{} accepted {} from {}", self.zone, global, from);
                        events.push(MigrationEvent::Adopted { entity, global });
                    }
                    None => {
                        warn!("{} rejected {} from {}: world full", self.zone, global, from);
                        self.send(from, ZoneMessage::HandoffReject { global, sequence });
                    }
                }
            }
            ZoneMessage::ForceAuthority(snapshot) => {
                let global = snapshot.global;
                let owned = world
                    .find_global(global)
                    .and_then(|id| world.get::<MigrationState>(id))
                    .map_or(false, MigrationState::is_authoritative);
                if owned {
                    debug!("Forced authority over {} already held by {}", global, self.zone);
                } else if let Some(entity) = self.adopt(world, &snapshot, tick, now_ms) {
                    warn!("{} took forced authority over {} from {}", self.zone, global, from);
                    events.push(MigrationEvent::Adopted { entity, global });
                }
            }
            ZoneMessage::HandoffAccept { global, sequence } => {
                let pending = world.find_global(global).filter(|id| {
                    matches!(
                        world.get::<MigrationState>(*id),
                        Some(MigrationState::Projected { target, offer: Some(offer), .. })
                            if *target == from && offer.sequence == sequence
                    )
                });
                match pending {
                    Some(entity) => {
                        let handoff = MigrationState::Handoff {
                            target: from,
                            since_ms: now_ms,
                        };
                        if let Err(err) = world.set(entity, handoff) {
                            debug!("Hand-off of {} not stored: {}", global, err);
                        }
                        self.stats.completed += 1;
                        info!("{} handed off from {} to {}", global, self.zone, from);
                        events.push(MigrationEvent::Departed {
                            entity,
                            global,
                            to: from,
                        });
                    }
                    None => debug!("Late hand-off accept for {} from {} ignored", global, from),
                }
            }
            ZoneMessage::HandoffReject { global, sequence } => {
                let pending = world.find_global(global).filter(|id| {
                    matches!(
                        world.get::<MigrationState>(*id),
                        Some(MigrationState::Projected { offer: Some(offer), .. })
                            if offer.sequence == sequence
                    )
                });
                if let Some(entity) = pending {
                    if let Err(err) = world.set(entity, MigrationState::Local) {
                        debug!("{} could not return to local: {}", global, err);
                    }
                    self.abort(global, now_ms);
                    info!("{} hand-off to {} rejected; stays in {}", global, from, self.zone);
                }
            }
            ZoneMessage::RemoteHit(hit) => {
                let Some(target) = world.find_global(hit.key.target) else {
                    debug!("Remote hit on unknown {} dropped", hit.key.target);
                    return events;
                };
                let state = world.get::<MigrationState>(target).copied().unwrap_or_default();
                match state.owner() {
                    Some(owner) if owner != from => {
                        let pending = pending_hit(target, &hit);
                        self.forward_hit(owner, &pending);
                    }
                    Some(_) => debug!("Remote hit on {} bounced back; dropped", hit.key.target),
                    None if state.is_authoritative() => {
                        events.push(MigrationEvent::HitReceived(pending_hit(target, &hit)));
                    }
                    None => {}
                }
            }
        }
        events
    }

    /// Makes the snapshot's entity local here. Idempotent.
    fn adopt(
        &mut self,
        world: &mut World,
        snapshot: &MigrantSnapshot,
        tick: u32,
        now_ms: u64,
    ) -> Option<EntityId> {
        if let Some(id) = world.find_global(snapshot.global) {
            let state = world.get::<MigrationState>(id).copied().unwrap_or_default();
            if state.is_authoritative() {
                return Some(id);
            }
        }
        let id = snapshot.materialize(world, tick)?;
        if let Err(err) = world.set(id, MigrationState::Local) {
            debug!("Adopted {} not marked local: {}", snapshot.global, err);
            return None;
        }
        self.stats.adopted += 1;
        self.cooldowns
            .insert(snapshot.global, now_ms + self.config.reproject_cooldown_ms);
        Some(id)
    }
}

fn pending_hit(target: EntityId, hit: &RemoteHit) -> PendingHit {
    PendingHit {
        key: hit.key,
        target,
        damage: hit.damage,
        kind: hit.kind,
        critical: hit.critical,
    }
}
