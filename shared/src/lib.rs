//! Wire protocol shared by the zone server and its clients.
//!
//! Everything that crosses the transport boundary lives here: the packet
//! envelope, the input record a client sends every tick, the replicated entity
//! state and its delta record, and the quantization rules both ends must agree
//! on. Packets are encoded with bincode using varint integers and a hard size
//! limit so a hostile datagram can never make the decoder allocate unbounded
//! memory.

use bincode::Options;
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub const PROTOCOL_VERSION: u32 = 1;
pub const DEFAULT_PORT: u16 = 7777;
pub const TICK_RATE: u32 = 60;

/// Largest datagram the decoder will accept.
pub const MAX_PACKET_SIZE: u64 = 65_507;

/// Position quantum: 1/64 unit, roughly 1.5 cm.
pub const POSITION_SCALE: f32 = 64.0;
/// Angle quantum: 0.0001 radian.
pub const ANGLE_SCALE: f32 = 10_000.0;
/// Velocity quantum: 1/256 unit per second.
pub const VELOCITY_SCALE: f32 = 256.0;
/// Movement axis quantum, [-1, 1] mapped onto [-127, 127].
pub const MOVE_SCALE: f32 = 127.0;

pub const MAX_PITCH: f32 = std::f32::consts::FRAC_PI_2;

/// Errors raised while encoding, decoding or range-checking wire data.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("failed to encode packet: {0}")]
    Encode(bincode::Error),

    #[error("failed to decode packet: {0}")]
    Decode(bincode::Error),

    #[error("entity {entity} field mask {mask:#04x} does not match present fields")]
    MaskMismatch { entity: u32, mask: u8 },

    #[error("field `{field}` out of range")]
    OutOfRange { field: &'static str },

    #[error("packet of {0} bytes exceeds the datagram limit")]
    Oversized(usize),
}

/// Milliseconds since the unix epoch.
pub fn timestamp_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis() as u64
}

// ---------------------------------------------------------------------------
// Quantization
// ---------------------------------------------------------------------------

pub fn quantize_position(position: [f32; 3]) -> [i32; 3] {
    position.map(|v| (v * POSITION_SCALE).round() as i32)
}

pub fn dequantize_position(position: [i32; 3]) -> [f32; 3] {
    position.map(|v| v as f32 / POSITION_SCALE)
}

/// Wraps an angle into [-π, π].
pub fn normalize_angle(angle: f32) -> f32 {
    use std::f32::consts::{PI, TAU};
    if !angle.is_finite() {
        return 0.0;
    }
    let wrapped = (angle + PI).rem_euclid(TAU) - PI;
    if wrapped < -PI {
        wrapped + TAU
    } else {
        wrapped
    }
}

pub fn quantize_angle(angle: f32) -> i16 {
    (normalize_angle(angle) * ANGLE_SCALE)
        .round()
        .clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

pub fn dequantize_angle(angle: i16) -> f32 {
    angle as f32 / ANGLE_SCALE
}

pub fn quantize_velocity(velocity: [f32; 3]) -> [i16; 3] {
    velocity.map(|v| {
        (v * VELOCITY_SCALE)
            .round()
            .clamp(i16::MIN as f32, i16::MAX as f32) as i16
    })
}

pub fn dequantize_velocity(velocity: [i16; 3]) -> [f32; 3] {
    velocity.map(|v| v as f32 / VELOCITY_SCALE)
}

// ---------------------------------------------------------------------------
// Input
// ---------------------------------------------------------------------------

/// Discrete action bits carried by every input record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActionFlags(pub u8);

impl ActionFlags {
    pub const ATTACK: u8 = 1 << 0;
    pub const BLOCK: u8 = 1 << 1;
    pub const SPRINT: u8 = 1 << 2;
    pub const JUMP: u8 = 1 << 3;
    /// With `ATTACK`: fire along the look direction instead of swinging.
    pub const RANGED: u8 = 1 << 4;
    /// With `ATTACK`: area effect centred in front of the attacker.
    pub const AREA: u8 = 1 << 5;

    pub fn contains(self, flag: u8) -> bool {
        self.0 & flag == flag
    }

    pub fn with(self, flag: u8) -> Self {
        Self(self.0 | flag)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

/// One client's intent for one tick.
///
/// `move_x` strafes right, `move_z` moves forward along the look yaw. The
/// client echoes the newest snapshot tick it applied in `ack_tick`, which
/// anchors the server's delta compression for that viewer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputRecord {
    pub sequence: u32,
    pub client_timestamp: u64,
    pub ack_tick: u32,
    pub actions: ActionFlags,
    pub move_x: i8,
    pub move_z: i8,
    pub yaw: i16,
    pub pitch: i16,
    /// Position the client predicted after applying this input. Only ever
    /// compared against the authoritative result, never applied.
    pub claimed_position: Option<[i32; 3]>,
}

impl InputRecord {
    pub fn new(sequence: u32, client_timestamp: u64) -> Self {
        Self {
            sequence,
            client_timestamp,
            ack_tick: 0,
            actions: ActionFlags::default(),
            move_x: 0,
            move_z: 0,
            yaw: 0,
            pitch: 0,
            claimed_position: None,
        }
    }

    pub fn with_move(mut self, strafe: f32, forward: f32) -> Self {
        self.move_x = (strafe.clamp(-1.0, 1.0) * MOVE_SCALE).round() as i8;
        self.move_z = (forward.clamp(-1.0, 1.0) * MOVE_SCALE).round() as i8;
        self
    }

    pub fn with_look(mut self, yaw: f32, pitch: f32) -> Self {
        self.yaw = quantize_angle(yaw);
        self.pitch = quantize_angle(pitch.clamp(-MAX_PITCH, MAX_PITCH));
        self
    }

    pub fn with_actions(mut self, actions: ActionFlags) -> Self {
        self.actions = actions;
        self
    }

    pub fn with_ack(mut self, ack_tick: u32) -> Self {
        self.ack_tick = ack_tick;
        self
    }

    pub fn with_claimed_position(mut self, position: [f32; 3]) -> Self {
        self.claimed_position = Some(quantize_position(position));
        self
    }

    /// Requested movement as (strafe, forward), magnitude at most 1.
    pub fn move_vector(&self) -> (f32, f32) {
        let x = self.move_x.max(-127) as f32 / MOVE_SCALE;
        let z = self.move_z.max(-127) as f32 / MOVE_SCALE;
        let magnitude = (x * x + z * z).sqrt();
        if magnitude > 1.0 {
            (x / magnitude, z / magnitude)
        } else {
            (x, z)
        }
    }

    pub fn yaw_radians(&self) -> f32 {
        dequantize_angle(self.yaw)
    }

    pub fn pitch_radians(&self) -> f32 {
        dequantize_angle(self.pitch)
    }

    /// Range checks applied before an input is queued for simulation.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.pitch_radians().abs() > MAX_PITCH + 1.0 / ANGLE_SCALE {
            return Err(ProtocolError::OutOfRange { field: "pitch" });
        }
        if self.actions.0 & !0x3F != 0 {
            return Err(ProtocolError::OutOfRange { field: "actions" });
        }
        if self.sequence == 0 {
            return Err(ProtocolError::OutOfRange { field: "sequence" });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Replicated entity state
// ---------------------------------------------------------------------------

/// Bitmask of the fields present in an [`EntityRecord`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FieldMask(pub u8);

impl FieldMask {
    pub const POSITION: u8 = 1 << 0;
    pub const ROTATION: u8 = 1 << 1;
    pub const VELOCITY: u8 = 1 << 2;
    pub const HEALTH: u8 = 1 << 3;
    pub const LOCOMOTION: u8 = 1 << 4;
    pub const KIND: u8 = 1 << 5;
    pub const TEAM: u8 = 1 << 6;

    pub const ALL: FieldMask = FieldMask(0x7F);
    pub const NONE: FieldMask = FieldMask(0);

    pub fn contains(self, field: u8) -> bool {
        self.0 & field == field
    }

    pub fn set(&mut self, field: u8) {
        self.0 |= field;
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Full-state records carry every field.
    pub fn is_full(self) -> bool {
        self == Self::ALL
    }

    pub fn count(self) -> u32 {
        self.0.count_ones()
    }
}

/// Quantized replicated state of one entity at one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityState {
    pub entity: u32,
    pub position: [i32; 3],
    pub rotation: [i16; 2],
    pub velocity: [i16; 3],
    pub health: u16,
    pub locomotion: u8,
    pub kind: u8,
    pub team: u8,
}

impl EntityState {
    /// Fields that differ from `baseline`.
    pub fn diff(&self, baseline: &EntityState) -> FieldMask {
        let mut mask = FieldMask::NONE;
        if self.position != baseline.position {
            mask.set(FieldMask::POSITION);
        }
        if self.rotation != baseline.rotation {
            mask.set(FieldMask::ROTATION);
        }
        if self.velocity != baseline.velocity {
            mask.set(FieldMask::VELOCITY);
        }
        if self.health != baseline.health {
            mask.set(FieldMask::HEALTH);
        }
        if self.locomotion != baseline.locomotion {
            mask.set(FieldMask::LOCOMOTION);
        }
        if self.kind != baseline.kind {
            mask.set(FieldMask::KIND);
        }
        if self.team != baseline.team {
            mask.set(FieldMask::TEAM);
        }
        mask
    }

    /// Builds a wire record carrying only the fields in `mask`.
    pub fn to_record(&self, mask: FieldMask) -> EntityRecord {
        EntityRecord {
            entity: self.entity,
            mask,
            position: mask.contains(FieldMask::POSITION).then_some(self.position),
            rotation: mask.contains(FieldMask::ROTATION).then_some(self.rotation),
            velocity: mask.contains(FieldMask::VELOCITY).then_some(self.velocity),
            health: mask.contains(FieldMask::HEALTH).then_some(self.health),
            locomotion: mask.contains(FieldMask::LOCOMOTION).then_some(self.locomotion),
            kind: mask.contains(FieldMask::KIND).then_some(self.kind),
            team: mask.contains(FieldMask::TEAM).then_some(self.team),
        }
    }

    /// Reconstructs a full state from a full-state record.
    pub fn from_full_record(record: &EntityRecord) -> Option<EntityState> {
        Some(EntityState {
            entity: record.entity,
            position: record.position?,
            rotation: record.rotation?,
            velocity: record.velocity?,
            health: record.health?,
            locomotion: record.locomotion?,
            kind: record.kind?,
            team: record.team?,
        })
    }

    /// Applies the present fields of a delta record.
    pub fn apply(&mut self, record: &EntityRecord) {
        if let Some(position) = record.position {
            self.position = position;
        }
        if let Some(rotation) = record.rotation {
            self.rotation = rotation;
        }
        if let Some(velocity) = record.velocity {
            self.velocity = velocity;
        }
        if let Some(health) = record.health {
            self.health = health;
        }
        if let Some(locomotion) = record.locomotion {
            self.locomotion = locomotion;
        }
        if let Some(kind) = record.kind {
            self.kind = kind;
        }
        if let Some(team) = record.team {
            self.team = team;
        }
    }
}

/// Full-state or delta record. Full and delta share this schema; a record
/// whose mask is [`FieldMask::ALL`] is a full-state ("new entity") record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub entity: u32,
    pub mask: FieldMask,
    pub position: Option<[i32; 3]>,
    pub rotation: Option<[i16; 2]>,
    pub velocity: Option<[i16; 3]>,
    pub health: Option<u16>,
    pub locomotion: Option<u8>,
    pub kind: Option<u8>,
    pub team: Option<u8>,
}

impl EntityRecord {
    /// Checks that the present-fields mask agrees with the fields carried.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        let present = [
            (FieldMask::POSITION, self.position.is_some()),
            (FieldMask::ROTATION, self.rotation.is_some()),
            (FieldMask::VELOCITY, self.velocity.is_some()),
            (FieldMask::HEALTH, self.health.is_some()),
            (FieldMask::LOCOMOTION, self.locomotion.is_some()),
            (FieldMask::KIND, self.kind.is_some()),
            (FieldMask::TEAM, self.team.is_some()),
        ];
        let consistent = self.mask.0 & !FieldMask::ALL.0 == 0
            && present
                .iter()
                .all(|(bit, has)| self.mask.contains(*bit) == *has);
        if consistent {
            Ok(())
        } else {
            Err(ProtocolError::MaskMismatch {
                entity: self.entity,
                mask: self.mask.0,
            })
        }
    }

    pub fn is_full(&self) -> bool {
        self.mask.is_full()
    }
}

/// One viewer's view of the world at `server_tick`, delta-encoded against
/// `baseline_tick` unless `full` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub server_tick: u32,
    pub baseline_tick: u32,
    pub full: bool,
    pub last_processed_input: u32,
    pub entities: Vec<EntityRecord>,
    pub removed: Vec<u32>,
}

/// Discrete events delivered on the reliable channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ReliableEvent {
    HitConfirmed {
        attacker: u32,
        target: u32,
        damage: u16,
        killed: bool,
        tick: u32,
    },
    Spawned {
        entity: u32,
        kind: u8,
    },
    Despawned {
        entity: u32,
    },
    ZoneRedirect {
        zone: u32,
        player_id: u64,
    },
    Kicked {
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Packet {
    // client -> server
    /// `player_id` 0 asks the server to assign one. A client redirected to a
    /// new zone reconnects with the id it was given to resume its entity.
    Connect {
        client_version: u32,
        player_id: u64,
    },
    Input(InputRecord),
    Ack {
        reliable_sequence: u32,
    },
    Pong {
        nonce: u32,
    },
    Disconnect,

    // server -> client
    Connected {
        client_id: u32,
        player_id: u64,
        entity: u32,
        zone: u32,
        tick_rate: u32,
    },
    Snapshot(Snapshot),
    Ping {
        nonce: u32,
    },
    Reliable {
        sequence: u32,
        event: ReliableEvent,
    },
    Disconnected {
        reason: String,
    },
}

fn codec() -> impl Options {
    bincode::DefaultOptions::new().with_limit(MAX_PACKET_SIZE)
}

pub fn encode_packet(packet: &Packet) -> Result<Vec<u8>, ProtocolError> {
    let bytes = codec().serialize(packet).map_err(ProtocolError::Encode)?;
    if bytes.len() as u64 > MAX_PACKET_SIZE {
        return Err(ProtocolError::Oversized(bytes.len()));
    }
    Ok(bytes)
}

/// Decodes and structurally validates a packet.
pub fn decode_packet(bytes: &[u8]) -> Result<Packet, ProtocolError> {
    if bytes.len() as u64 > MAX_PACKET_SIZE {
        return Err(ProtocolError::Oversized(bytes.len()));
    }
    let packet: Packet = codec().deserialize(bytes).map_err(ProtocolError::Decode)?;
    match &packet {
        Packet::Input(input) => input.validate()?,
        Packet::Snapshot(snapshot) => {
            for record in &snapshot.entities {
                record.validate()?;
            }
        }
        _ => {}
    }
    Ok(packet)
}
