//! Component types stored in the entity world.
//!
//! Each type here is one dense column in [`crate::world::World`]. Components
//! reference other entities only through [`GlobalId`] values resolved on use,
//! never through owning pointers.

use crate::physics::Vec3;
use serde::{Deserialize, Serialize};
use shared::{quantize_angle, quantize_position, quantize_velocity, EntityState};

/// Process-independent identity that survives migration between zones.
///
/// Player ids have the top bit set; zone-spawned entities carry the spawning
/// zone in the upper half and a serial in the lower half.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GlobalId(pub u64);

impl GlobalId {
    const PLAYER_BIT: u64 = 1 << 63;

    pub fn player(player_id: u64) -> Self {
        GlobalId(player_id | Self::PLAYER_BIT)
    }

    pub fn spawned(zone: u32, serial: u32) -> Self {
        GlobalId(((zone as u64) << 32) | serial as u64)
    }

    pub fn player_id(&self) -> Option<u64> {
        (self.0 & Self::PLAYER_BIT != 0).then_some(self.0 & !Self::PLAYER_BIT)
    }
}

impl std::fmt::Display for GlobalId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.player_id() {
            Some(player) => write!(f, "player:{}", player),
            None => write!(f, "g:{:x}", self.0),
        }
    }
}

/// Authoritative position and orientation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Transform {
    pub position: Vec3,
    pub yaw: f32,
    pub pitch: f32,
    /// Tick of the last write. Never decreases.
    pub tick: u32,
}

impl Transform {
    pub fn at(position: Vec3) -> Self {
        Self {
            position,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum Locomotion {
    #[default]
    Grounded = 0,
    Airborne = 1,
    Sprinting = 2,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct VelocityState {
    pub velocity: Vec3,
    pub locomotion: Locomotion,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum EntityKind {
    #[default]
    Player = 0,
    Npc = 1,
    Projectile = 2,
    Item = 3,
}

/// Identifies one application of one attack to one target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HitKey {
    pub attacker: GlobalId,
    pub target: GlobalId,
    /// Snapshot tick the attacker acknowledged when it acted.
    pub tick: u32,
    pub sequence: u32,
}

/// Fixed-length ring of recently applied hits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HitHistory {
    entries: Vec<Option<(HitKey, u64)>>,
    cursor: usize,
}

impl HitHistory {
    pub const CAPACITY: usize = 32;

    pub fn new() -> Self {
        Self {
            entries: vec![None; Self::CAPACITY],
            cursor: 0,
        }
    }

    /// Whether `key` was applied within the last `retention_ms`.
    pub fn contains(&self, key: &HitKey, now_ms: u64, retention_ms: u64) -> bool {
        self.entries.iter().flatten().any(|(recorded, applied_ms)| {
            recorded == key && now_ms.saturating_sub(*applied_ms) <= retention_ms
        })
    }

    pub fn record(&mut self, key: HitKey, now_ms: u64) {
        if self.entries.is_empty() {
            self.entries = vec![None; Self::CAPACITY];
        }
        self.entries[self.cursor] = Some((key, now_ms));
        self.cursor = (self.cursor + 1) % self.entries.len();
    }
}

impl Default for HitHistory {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CombatState {
    pub health: u16,
    pub max_health: u16,
    pub team: u8,
    pub blocking: bool,
    pub dead_since_ms: Option<u64>,
    pub last_attack_ms: Option<u64>,
    pub hits: HitHistory,
}

impl CombatState {
    pub fn new(max_health: u16, team: u8) -> Self {
        Self {
            health: max_health,
            max_health,
            team,
            blocking: false,
            dead_since_ms: None,
            last_attack_ms: None,
            hits: HitHistory::new(),
        }
    }

    pub fn is_dead(&self) -> bool {
        self.dead_since_ms.is_some()
    }

    /// Subtracts `damage`, saturating at zero. Returns true if this killed.
    pub fn take_damage(&mut self, damage: u16, now_ms: u64) -> bool {
        if self.is_dead() {
            return false;
        }
        self.health = self.health.saturating_sub(damage);
        if self.health == 0 {
            self.dead_since_ms = Some(now_ms);
            true
        } else {
            false
        }
    }

    pub fn revive(&mut self) {
        self.health = self.max_health;
        self.dead_since_ms = None;
        self.blocking = false;
    }
}

/// Quantized replicated view of an entity's components.
pub fn entity_state(
    raw_id: u32,
    transform: &Transform,
    velocity: Option<&VelocityState>,
    combat: Option<&CombatState>,
    kind: EntityKind,
) -> EntityState {
    let (velocity, locomotion) = velocity
        .map(|v| (v.velocity, v.locomotion))
        .unwrap_or_default();
    EntityState {
        entity: raw_id,
        position: quantize_position(transform.position.to_array()),
        rotation: [quantize_angle(transform.yaw), quantize_angle(transform.pitch)],
        velocity: quantize_velocity(velocity.to_array()),
        health: combat.map(|c| c.health).unwrap_or(0),
        locomotion: locomotion as u8,
        kind: kind as u8,
        team: combat.map(|c| c.team).unwrap_or(0),
    }
}
