//! Server configuration.
//!
//! Every section deserializes with defaults, so a config file only needs to
//! name the values it changes:
//!
//! ```json
//! { "movement": { "max_speed": 7.5 }, "network": { "port": 9000 } }
//! ```

use crate::error::ServerError;
use log::warn;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub tick: TickConfig,
    pub movement: MovementConfig,
    pub anti_cheat: AntiCheatConfig,
    pub lag_compensation: LagCompensationConfig,
    pub combat: CombatConfig,
    pub spatial: SpatialConfig,
    pub replication: ReplicationConfig,
    pub migration: MigrationConfig,
    pub network: NetworkConfig,
    pub persistence: PersistenceConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TickConfig {
    pub tick_rate: u32,
    /// Most ticks run back to back after a stall; older backlog is dropped.
    pub max_catchup_ticks: u32,
    pub stats_interval_ticks: u32,
}

impl Default for TickConfig {
    fn default() -> Self {
        Self {
            tick_rate: 60,
            max_catchup_ticks: 5,
            stats_interval_ticks: 60,
        }
    }
}

impl TickConfig {
    pub fn tick_duration(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.tick_rate.max(1) as f64)
    }

    pub fn dt(&self) -> f32 {
        1.0 / self.tick_rate.max(1) as f32
    }

    /// Simulation time at the start of `tick`.
    pub fn tick_to_ms(&self, tick: u32) -> u64 {
        (tick as f64 * 1000.0 / self.tick_rate.max(1) as f64).round() as u64
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MovementConfig {
    pub max_speed: f32,
    pub sprint_multiplier: f32,
    pub acceleration: f32,
    pub deceleration: f32,
    pub jump_velocity: f32,
    pub gravity: f32,
    pub ground_height: f32,
    pub world_min: [f32; 3],
    pub world_max: [f32; 3],
}

impl Default for MovementConfig {
    fn default() -> Self {
        Self {
            max_speed: 6.0,
            sprint_multiplier: 1.5,
            acceleration: 10.0,
            deceleration: 8.0,
            jump_velocity: 8.0,
            gravity: 20.0,
            ground_height: 0.0,
            world_min: [-5000.0, -100.0, -5000.0],
            world_max: [5000.0, 500.0, 5000.0],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AntiCheatConfig {
    /// Multiplier on the per-tick displacement allowance.
    pub speed_tolerance: f32,
    pub teleport_threshold: f32,
    /// Claimed positions closer than this to the authoritative one are fine.
    pub position_tolerance: f32,
    pub violation_threshold: u32,
    pub violation_window_ms: u64,
    pub input_rate_per_second: u32,
    pub input_burst: u32,
    pub max_pending_inputs: usize,
    pub max_malformed: u32,
}

impl Default for AntiCheatConfig {
    fn default() -> Self {
        Self {
            speed_tolerance: 1.2,
            teleport_threshold: 100.0,
            position_tolerance: 0.5,
            violation_threshold: 3,
            violation_window_ms: 5000,
            input_rate_per_second: 60,
            input_burst: 5,
            max_pending_inputs: 16,
            max_malformed: 50,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LagCompensationConfig {
    pub history_frames: usize,
    pub max_rewind_ms: u64,
    pub processing_margin_ms: u64,
}

impl Default for LagCompensationConfig {
    fn default() -> Self {
        Self {
            history_frames: 120,
            max_rewind_ms: 500,
            processing_margin_ms: 20,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CombatConfig {
    pub max_health: u16,
    pub melee_range: f32,
    /// Full opening angle of the melee cone.
    pub melee_cone_degrees: f32,
    pub ranged_range: f32,
    pub hit_radius: f32,
    pub area_radius: f32,
    /// Distance in front of the attacker where area effects are centred.
    pub area_offset: f32,
    /// Height above the entity origin that attacks are aimed from and at.
    pub aim_height: f32,
    pub melee_damage: u16,
    pub ranged_damage: u16,
    pub area_damage: u16,
    pub cooldown_ms: u64,
    pub crit_chance: f64,
    pub crit_multiplier: f32,
    pub friendly_fire: bool,
    pub respawn_ms: u64,
    /// Applied-hit keys are remembered this long for duplicate rejection.
    pub hit_retention_ms: u64,
    pub rng_seed: Option<u64>,
}

impl Default for CombatConfig {
    fn default() -> Self {
        Self {
            max_health: 10_000,
            melee_range: 2.5,
            melee_cone_degrees: 60.0,
            ranged_range: 50.0,
            hit_radius: 0.5,
            area_radius: 5.0,
            area_offset: 0.0,
            aim_height: 1.0,
            melee_damage: 2_500,
            ranged_damage: 1_500,
            area_damage: 1_000,
            cooldown_ms: 500,
            crit_chance: 0.0,
            crit_multiplier: 1.5,
            friendly_fire: false,
            respawn_ms: 3_000,
            hit_retention_ms: 2_000,
            rng_seed: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpatialConfig {
    pub cell_size: f32,
    /// Entries read from a single cell per query before it is truncated.
    pub max_cell_entities: usize,
    /// Widest span of cells a single query walks along one axis.
    pub max_query_span: i32,
}

impl Default for SpatialConfig {
    fn default() -> Self {
        Self {
            cell_size: 10.0,
            max_cell_entities: 500,
            max_query_span: 64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    pub view_radius: f32,
    pub near_radius: f32,
    pub mid_radius: f32,
    /// Entities this close to a viewer are sent every tick, always.
    pub interaction_radius: f32,
    /// Entities at least this fast are sent every tick.
    pub fast_speed: f32,
    pub mid_interval: u32,
    pub far_interval: u32,
    pub snapshot_byte_budget: usize,
    pub history_ticks: usize,
    /// Ticks to wait for a full snapshot to be acknowledged before resending.
    pub full_retry_ticks: u32,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            view_radius: 200.0,
            near_radius: 50.0,
            mid_radius: 100.0,
            interaction_radius: 50.0,
            fast_speed: 7.0,
            mid_interval: 2,
            far_interval: 4,
            snapshot_byte_budget: 1_200,
            history_ticks: 120,
            full_retry_ticks: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationConfig {
    pub zones_x: u32,
    pub zones_z: u32,
    pub aura_band: f32,
    /// Offer sent but no answer: force resolution after this long.
    pub handoff_timeout_ms: u64,
    /// Longest an entity may hold a shadow copy in a neighbour.
    pub max_projection_ms: u64,
    pub ghost_lifetime_ms: u64,
    /// Shadows not refreshed for this long are dropped.
    pub shadow_timeout_ms: u64,
    pub reproject_cooldown_ms: u64,
    pub channel_capacity: usize,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            zones_x: 2,
            zones_z: 2,
            aura_band: 50.0,
            handoff_timeout_ms: 3_000,
            max_projection_ms: 10_000,
            ghost_lifetime_ms: 500,
            shadow_timeout_ms: 2_000,
            reproject_cooldown_ms: 1_000,
            channel_capacity: 1_024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// IP address every zone socket binds to
    pub bind_address: String,
    /// Zone `n` listens on `port + n`.
    pub port: u16,
    /// Players per zone; also caps the zone's connection table
    pub max_clients: usize,
    /// Silence after which a connection is dropped
    pub client_timeout_ms: u64,
    pub ping_interval_ms: u64,
    pub reliable_resend_ms: u64,
    /// Resends before a reliable event gives up and the connection drops
    pub reliable_max_attempts: u32,
    /// EWMA factor applied to each RTT sample
    pub rtt_smoothing: f32,
    /// Capacity of the zone's inbound event queue
    pub inbound_queue: usize,
    /// Simultaneous connections allowed from one IP address
    pub max_connections_per_ip: usize,
    /// New-connection attempts one IP may make per `connect_window_ms`
    pub max_connect_attempts: usize,
    pub connect_window_ms: u64,
    /// How long an address that exceeded the attempt limit is ignored
    pub connect_block_ms: u64,
    /// Addresses exempt from the per-IP limits
    pub trusted_addresses: Vec<IpAddr>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1".to_string(),
            port: shared::DEFAULT_PORT,
            max_clients: 256,
            client_timeout_ms: 5_000,
            ping_interval_ms: 1_000,
            reliable_resend_ms: 200,
            reliable_max_attempts: 10,
            rtt_smoothing: 0.125,
            inbound_queue: 4_096,
            max_connections_per_ip: 5,
            max_connect_attempts: 10,
            connect_window_ms: 60_000,
            connect_block_ms: 300_000,
            // Local bots share one address
            trusted_addresses: vec![
                IpAddr::V4(Ipv4Addr::LOCALHOST),
                IpAddr::V6(Ipv6Addr::LOCALHOST),
            ],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub event_log_path: PathBuf,
    pub batch_size: usize,
    pub flush_interval_ms: u64,
    pub queue_capacity: usize,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            event_log_path: PathBuf::from("combat_events.jsonl"),
            batch_size: 1_000,
            flush_interval_ms: 5_000,
            queue_capacity: 10_000,
        }
    }
}

impl ServerConfig {
    /// Reads a JSON config file, or the defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self, ServerError> {
        let config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path)?;
                serde_json::from_str(&text)?
            }
            None => ServerConfig::default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ServerError> {
        fn reject(message: &str) -> Result<(), ServerError> {
            Err(ServerError::Config(message.to_string()))
        }

        if self.tick.tick_rate == 0 {
            return reject("tick_rate must be positive");
        }
        if self.spatial.cell_size <= 0.0 || !self.spatial.cell_size.is_finite() {
            return reject("spatial cell_size must be positive");
        }
        if self.movement.max_speed <= 0.0 || self.movement.sprint_multiplier < 1.0 {
            return reject("max_speed must be positive and sprint_multiplier at least 1");
        }
        if self.anti_cheat.speed_tolerance < 1.0 {
            return reject("speed_tolerance below 1.0 would reject legal movement");
        }
        if self.lag_compensation.history_frames < 2 {
            return reject("history_frames must hold at least two frames");
        }
        if self.replication.history_ticks < 2 {
            return reject("replication history_ticks must hold at least two ticks");
        }
        if self.replication.mid_interval == 0 || self.replication.far_interval == 0 {
            return reject("replication intervals must be positive");
        }
        if self.migration.zones_x == 0 || self.migration.zones_z == 0 {
            return reject("zone grid must have at least one zone per axis");
        }
        if self.network.max_connections_per_ip == 0 || self.network.max_connect_attempts == 0 {
            return reject("per-address connection limits must be positive");
        }
        for axis in 0..3 {
            if self.movement.world_min[axis] >= self.movement.world_max[axis] {
                return reject("world_min must be below world_max on every axis");
            }
        }

        if self.lag_compensation.history_frames < self.tick.tick_rate as usize {
            warn!(
                "Lag compensation history holds {} frames, less than one second at {}Hz",
                self.lag_compensation.history_frames, self.tick.tick_rate
            );
        }
        Ok(())
    }
}
