//! Hit resolution under latency.
//!
//! Targets are tested where the attacker saw them: every candidate is rewound
//! to the attacker's perceived instant before the exact shape test. Damage is
//! then applied to the target's present combat state. Each application is
//! keyed by (attacker, target, tick, sequence) and remembered in the target's
//! hit ring so a replayed or duplicated attack cannot land twice.

use crate::components::{CombatState, EntityKind, GlobalId, HitKey, Transform};
use crate::config::{CombatConfig, SpatialConfig};
use crate::error::RewindError;
use crate::history::LagCompensator;
use crate::physics::{forward_from_yaw, in_cone, in_sphere, look_direction, ray_sphere, Vec3};
use crate::spatial::SpatialGrid;
use crate::world::{EntityId, World};
use log::debug;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use shared::ActionFlags;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AttackKind {
    Melee,
    Ranged,
    Area,
}

impl AttackKind {
    /// The attack an input's action bits request, if any.
    pub fn from_actions(actions: ActionFlags) -> Option<Self> {
        if !actions.contains(ActionFlags::ATTACK) {
            None
        } else if actions.contains(ActionFlags::AREA) {
            Some(AttackKind::Area)
        } else if actions.contains(ActionFlags::RANGED) {
            Some(AttackKind::Ranged)
        } else {
            Some(AttackKind::Melee)
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AttackRequest {
    pub attacker: EntityId,
    pub kind: AttackKind,
    pub yaw: f32,
    pub pitch: f32,
    pub sequence: u32,
    /// Snapshot tick the attacker had applied when it acted.
    pub ack_tick: u32,
    pub rtt_ms: u64,
}

/// A hit that passed the shape test but has not been applied yet.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingHit {
    pub key: HitKey,
    pub target: EntityId,
    pub damage: u16,
    pub kind: AttackKind,
    pub critical: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AttackOutcome {
    Hits(Vec<PendingHit>),
    Miss,
    OnCooldown,
    /// The perceived instant is outside the retained history.
    Unverifiable(RewindError),
    /// Attacker missing, dead or unable to fight.
    Ineligible,
}

/// An applied hit.
#[derive(Debug, Clone, PartialEq)]
pub struct HitEvent {
    pub key: HitKey,
    pub attacker: Option<EntityId>,
    pub target: EntityId,
    pub damage: u16,
    pub killed: bool,
    pub kind: AttackKind,
    pub critical: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum HitOutcome {
    Applied(HitEvent),
    Duplicate,
    TargetGone,
}

pub struct CombatResolver {
    config: CombatConfig,
    spatial: SpatialConfig,
    rng: StdRng,
}

impl CombatResolver {
    pub fn new(config: CombatConfig, spatial: SpatialConfig) -> Self {
        let rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            config,
            spatial,
            rng,
        }
    }

    pub fn config(&self) -> &CombatConfig {
        &self.config
    }

    /// Decides which targets an attack hits. Only the attacker's cooldown is
    /// written, and only once the attack could be rewound; damage is applied
    /// separately with [`CombatResolver::apply_hit`].
    pub fn resolve(
        &mut self,
        world: &mut World,
        history: &LagCompensator,
        request: &AttackRequest,
        now_ms: u64,
    ) -> AttackOutcome {
        let Some(attacker_global) = world.global(request.attacker) else {
            return AttackOutcome::Ineligible;
        };
        let Some(origin) = world.get::<Transform>(request.attacker).map(|t| t.position) else {
            return AttackOutcome::Ineligible;
        };
        let attacker_team = match world.get_mut::<CombatState>(request.attacker) {
            Some(combat) if !combat.is_dead() => {
                if let Some(last) = combat.last_attack_ms {
                    if now_ms.saturating_sub(last) < self.config.cooldown_ms {
                        return AttackOutcome::OnCooldown;
                    }
                }
                combat.team
            }
            _ => return AttackOutcome::Ineligible,
        };

        let rewound = match history
            .target_for(now_ms, request.rtt_ms)
            .and_then(|target| history.rewind(target))
        {
            Ok(rewound) => rewound,
            Err(err) => {
                debug!(
                    "Attack {} by {} unverifiable: {}",
                    request.sequence, request.attacker, err
                );
                return AttackOutcome::Unverifiable(err);
            }
        };
        // Only a verifiable attack starts the cooldown
        if let Some(combat) = world.get_mut::<CombatState>(request.attacker) {
            combat.last_attack_ms = Some(now_ms);
        }

        // Rewound positions of everything the attacker may hit.
        let candidates: Vec<(EntityId, GlobalId, Vec3)> = rewound
            .iter()
            .filter(|(id, _)| **id != request.attacker)
            .filter_map(|(id, transform)| {
                let global = world.global(*id)?;
                self.targetable(world, *id, attacker_team)
                    .then_some((*id, global, transform.position))
            })
            .collect();

        let aim = Vec3::new(0.0, self.config.aim_height, 0.0);
        let targets: Vec<(EntityId, GlobalId)> = match request.kind {
            AttackKind::Melee => {
                let forward = forward_from_yaw(request.yaw);
                let cone = self.config.melee_cone_degrees.to_radians();
                nearest(
                    candidates
                        .iter()
                        .filter(|(_, _, at)| {
                            in_cone(origin, forward, *at, self.config.melee_range, cone)
                        })
                        .map(|(id, global, at)| (*id, *global, origin.horizontal_distance(at))),
                )
            }
            AttackKind::Ranged => {
                let direction = look_direction(request.yaw, request.pitch);
                nearest(candidates.iter().filter_map(|(id, global, at)| {
                    ray_sphere(
                        origin + aim,
                        direction,
                        self.config.ranged_range,
                        *at + aim,
                        self.config.hit_radius,
                    )
                    .map(|distance| (*id, *global, distance))
                }))
            }
            AttackKind::Area => {
                let attacker_then = rewound
                    .get(&request.attacker)
                    .map_or(origin, |t| t.position);
                let epicenter =
                    attacker_then + forward_from_yaw(request.yaw) * self.config.area_offset;
                let mut grid = SpatialGrid::new(&self.spatial);
                for (id, _, at) in &candidates {
                    grid.insert(*id, *at);
                }
                grid.query_positions(epicenter, self.config.area_radius)
                    .into_iter()
                    .filter(|(_, at)| in_sphere(epicenter, self.config.area_radius, *at))
                    .filter_map(|(id, _)| Some((id, world.global(id)?)))
                    .collect()
            }
        };

        if targets.is_empty() {
            return AttackOutcome::Miss;
        }

        let base = match request.kind {
            AttackKind::Melee => self.config.melee_damage,
            AttackKind::Ranged => self.config.ranged_damage,
            AttackKind::Area => self.config.area_damage,
        };
        let hits = targets
            .into_iter()
            .map(|(target, target_global)| {
                let critical = self.config.crit_chance > 0.0
                    && self.rng.gen_bool(self.config.crit_chance.clamp(0.0, 1.0));
                let damage = if critical {
                    (base as f32 * self.config.crit_multiplier).min(u16::MAX as f32) as u16
                } else {
                    base
                };
                PendingHit {
                    key: HitKey {
                        attacker: attacker_global,
                        target: target_global,
                        tick: request.ack_tick,
                        sequence: request.sequence,
                    },
                    target,
                    damage,
                    kind: request.kind,
                    critical,
                }
            })
            .collect();
        AttackOutcome::Hits(hits)
    }

    /// Applies a hit to the target's present state, once per key.
    pub fn apply_hit(&self, world: &mut World, hit: &PendingHit, now_ms: u64) -> HitOutcome {
        let attacker = world.find_global(hit.key.attacker);
        let Some(combat) = world.get_mut::<CombatState>(hit.target) else {
            return HitOutcome::TargetGone;
        };
        if combat.hits.contains(&hit.key, now_ms, self.config.hit_retention_ms) {
            return HitOutcome::Duplicate;
        }
        if combat.is_dead() {
            return HitOutcome::TargetGone;
        }

        let damage = if combat.blocking && hit.kind != AttackKind::Area {
            hit.damage / 2
        } else {
            hit.damage
        };
        let killed = combat.take_damage(damage, now_ms);
        combat.hits.record(hit.key, now_ms);

        HitOutcome::Applied(HitEvent {
            key: hit.key,
            attacker,
            target: hit.target,
            damage,
            killed,
            kind: hit.kind,
            critical: hit.critical,
        })
    }

    /// Dead entities whose respawn delay has elapsed.
    pub fn due_respawns(&self, world: &World, now_ms: u64) -> Vec<EntityId> {
        world
            .iter::<CombatState>()
            .filter(|(_, combat)| {
                combat
                    .dead_since_ms
                    .map_or(false, |since| now_ms.saturating_sub(since) >= self.config.respawn_ms)
            })
            .map(|(id, _)| id)
            .collect()
    }

    fn targetable(&self, world: &World, id: EntityId, attacker_team: u8) -> bool {
        let Some(combat) = world.get::<CombatState>(id) else {
            return false;
        };
        let kind = world.get::<EntityKind>(id).copied().unwrap_or_default();
        !combat.is_dead()
            && matches!(kind, EntityKind::Player | EntityKind::Npc)
            && (self.config.friendly_fire || combat.team != attacker_team)
    }
}

fn nearest(
    candidates: impl Iterator<Item = (EntityId, GlobalId, f32)>,
) -> Vec<(EntityId, GlobalId)> {
    candidates
        .min_by(|a, b| a.2.total_cmp(&b.2))
        .map(|(id, global, _)| vec![(id, global)])
        .unwrap_or_default()
}
