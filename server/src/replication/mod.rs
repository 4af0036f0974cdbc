//! Per-viewer snapshot construction.
//!
//! Each viewer has a baseline: the newest tick it has acknowledged. For every
//! snapshot the engine also remembers, per entity, which tick's state the
//! viewer holds after applying it. A delta snapshot against baseline `B`
//! therefore diffs each visible entity against the exact state the viewer
//! holds for it in frame `B`, sends full records for entities that frame does
//! not contain, and lists entities of frame `B` that are no longer visible.
//!
//! When `B` is no longer retained the viewer gets a full snapshot and its
//! baseline is reset to the tick of that snapshot.

pub mod history;
pub mod interest;

use crate::client_manager::ConnectionId;
use crate::components::Transform;
use crate::config::ReplicationConfig;
use crate::spatial::SpatialGrid;
use crate::world::{EntityId, World};
use history::StateHistory;
use interest::{select, Interest};
use log::debug;
use shared::{EntityRecord, FieldMask, ProtocolError, Snapshot};
use std::collections::{HashMap, VecDeque};

/// Fixed per-snapshot overhead in the byte estimate.
const SNAPSHOT_HEADER_BYTES: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotKind {
    Delta,
    Full,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BuiltSnapshot {
    pub snapshot: Snapshot,
    pub kind: SnapshotKind,
    /// Entities left out for throttling or budget.
    pub deferred: usize,
    pub estimated_bytes: usize,
}

/// Which state tick the viewer holds for each entity after one snapshot.
#[derive(Debug, Clone)]
struct SentRecord {
    tick: u32,
    known: HashMap<EntityId, u32>,
}

#[derive(Debug)]
pub struct Viewer {
    pub connection: ConnectionId,
    pub entity: Option<EntityId>,
    baseline: Option<u32>,
    records: VecDeque<SentRecord>,
    /// Tick of a full snapshot not yet acknowledged.
    pending_full: Option<u32>,
    last_built: Option<u32>,
}

impl Viewer {
    fn new(connection: ConnectionId, entity: Option<EntityId>) -> Self {
        Self {
            connection,
            entity,
            baseline: None,
            records: VecDeque::new(),
            pending_full: None,
            last_built: None,
        }
    }

    pub fn baseline(&self) -> Option<u32> {
        self.baseline
    }

    fn record(&self, tick: u32) -> Option<&SentRecord> {
        self.records.iter().find(|record| record.tick == tick)
    }

    fn push_record(&mut self, record: SentRecord, oldest_retained: Option<u32>) {
        self.records.retain(|existing| existing.tick != record.tick);
        self.records.push_back(record);
        if let Some(oldest) = oldest_retained {
            while self
                .records
                .front()
                .map_or(false, |front| front.tick < oldest)
            {
                self.records.pop_front();
            }
        }
    }
}

pub struct ReplicationEngine {
    config: ReplicationConfig,
    history: StateHistory,
    viewers: HashMap<ConnectionId, Viewer>,
}

impl ReplicationEngine {
    pub fn new(config: ReplicationConfig) -> Self {
        let history = StateHistory::new(config.history_ticks);
        Self {
            config,
            history,
            viewers: HashMap::new(),
        }
    }

    pub fn config(&self) -> &ReplicationConfig {
        &self.config
    }

    pub fn history(&self) -> &StateHistory {
        &self.history
    }

    pub fn viewer(&self, connection: ConnectionId) -> Option<&Viewer> {
        self.viewers.get(&connection)
    }

    pub fn viewer_count(&self) -> usize {
        self.viewers.len()
    }

    pub fn add_viewer(&mut self, connection: ConnectionId, entity: Option<EntityId>) {
        self.viewers
            .insert(connection, Viewer::new(connection, entity));
    }

    /// Drops the viewer and its baseline.
    pub fn remove_viewer(&mut self, connection: ConnectionId) -> bool {
        self.viewers.remove(&connection).is_some()
    }

    pub fn set_viewer_entity(&mut self, connection: ConnectionId, entity: Option<EntityId>) {
        if let Some(viewer) = self.viewers.get_mut(&connection) {
            viewer.entity = entity;
        }
    }

    /// Records the newest snapshot tick a viewer has applied.
    ///
    /// Zero means nothing applied yet. Acks older than the current baseline
    /// arrive out of order and are ignored; acks of ticks never sent are a
    /// protocol error.
    pub fn acknowledge(&mut self, connection: ConnectionId, ack_tick: u32) -> Result<(), ProtocolError> {
        let Some(viewer) = self.viewers.get_mut(&connection) else {
            return Ok(());
        };
        if ack_tick == 0 {
            return Ok(());
        }
        if viewer.last_built.map_or(true, |last| ack_tick > last) {
            return Err(ProtocolError::OutOfRange { field: "ack_tick" });
        }
        if viewer.baseline.map_or(true, |baseline| ack_tick >= baseline) {
            viewer.baseline = Some(ack_tick);
            if viewer.pending_full.map_or(false, |full| ack_tick >= full) {
                viewer.pending_full = None;
            }
        }
        Ok(())
    }

    /// Captures this tick's replicated state. Call once per tick before
    /// building snapshots.
    pub fn capture(&mut self, tick: u32, world: &World) {
        self.history.capture(tick, world);
    }

    /// Builds the snapshot for one viewer at `tick`.
    ///
    /// Returns None for unknown viewers, viewers without a position and
    /// ticks that were not captured.
    pub fn build(
        &mut self,
        connection: ConnectionId,
        tick: u32,
        world: &World,
        grid: &SpatialGrid,
        last_processed_input: u32,
    ) -> Option<BuiltSnapshot> {
        let config = &self.config;
        let history = &self.history;
        let viewer = self.viewers.get_mut(&connection)?;
        let center = world.get::<Transform>(viewer.entity?)?.position;
        let Some(frame) = history.frame(tick) else {
            debug!("No captured state for tick {}, skipping snapshots", tick);
            return None;
        };

        let visible = select(world, grid, center, viewer.entity, config);

        let retry_full = viewer
            .pending_full
            .map_or(false, |full| tick.saturating_sub(full) >= config.full_retry_ticks);
        let base = viewer
            .baseline
            .filter(|baseline| !retry_full && history.contains(*baseline))
            .and_then(|baseline| viewer.record(baseline));

        let mut known = HashMap::with_capacity(visible.len());
        let mut entities = Vec::new();
        let mut deferred = 0;
        let mut bytes = SNAPSHOT_HEADER_BYTES;

        let built = match base {
            Some(base) => {
                for Interest { entity, tier, .. } in &visible {
                    let Some(current) = frame.states.get(entity) else {
                        continue;
                    };
                    let held = base
                        .known
                        .get(entity)
                        .and_then(|held_tick| Some((*held_tick, history.state(*held_tick, *entity)?)));

                    let mask = match held {
                        Some((held_tick, old)) => {
                            let mask = current.diff(old);
                            if mask.is_empty() {
                                known.insert(*entity, tick);
                                continue;
                            }
                            if tick.saturating_sub(held_tick) < tier.interval(config) {
                                known.insert(*entity, held_tick);
                                deferred += 1;
                                continue;
                            }
                            mask
                        }
                        None => FieldMask::ALL,
                    };

                    let cost = record_bytes(mask);
                    if !tier.is_mandatory() && bytes + cost > config.snapshot_byte_budget {
                        if let Some((held_tick, _)) = held {
                            known.insert(*entity, held_tick);
                        }
                        deferred += 1;
                        continue;
                    }
                    bytes += cost;
                    entities.push(current.to_record(mask));
                    known.insert(*entity, tick);
                }

                let removed: Vec<u32> = base
                    .known
                    .keys()
                    .filter(|id| !known.contains_key(*id) && !visible.iter().any(|v| v.entity == **id))
                    .map(|id| id.to_raw())
                    .collect();
                bytes += removed.len() * 4;

                BuiltSnapshot {
                    snapshot: Snapshot {
                        server_tick: tick,
                        baseline_tick: base.tick,
                        full: false,
                        last_processed_input,
                        entities,
                        removed,
                    },
                    kind: SnapshotKind::Delta,
                    deferred,
                    estimated_bytes: bytes,
                }
            }
            None => {
                for Interest { entity, tier, .. } in &visible {
                    let Some(current) = frame.states.get(entity) else {
                        continue;
                    };
                    let cost = record_bytes(FieldMask::ALL);
                    if !tier.is_mandatory() && bytes + cost > config.snapshot_byte_budget {
                        deferred += 1;
                        continue;
                    }
                    bytes += cost;
                    entities.push(current.to_record(FieldMask::ALL));
                    known.insert(*entity, tick);
                }

                if viewer.baseline.is_some() {
                    debug!(
                        "Viewer {} baseline {:?} unavailable, sending full snapshot at tick {}",
                        connection, viewer.baseline, tick
                    );
                }
                viewer.baseline = Some(tick);
                viewer.pending_full = Some(tick);

                BuiltSnapshot {
                    snapshot: Snapshot {
                        server_tick: tick,
                        baseline_tick: tick,
                        full: true,
                        last_processed_input,
                        entities,
                        removed: Vec::new(),
                    },
                    kind: SnapshotKind::Full,
                    deferred,
                    estimated_bytes: bytes,
                }
            }
        };

        viewer.push_record(SentRecord { tick, known }, history.oldest_tick());
        viewer.last_built = Some(viewer.last_built.map_or(tick, |last| last.max(tick)));
        Some(built)
    }

    /// Builds snapshots for every viewer.
    pub fn build_all(
        &mut self,
        tick: u32,
        world: &World,
        grid: &SpatialGrid,
        last_processed: impl Fn(ConnectionId) -> u32,
    ) -> Vec<(ConnectionId, BuiltSnapshot)> {
        let connections: Vec<ConnectionId> = self.viewers.keys().copied().collect();
        connections
            .into_iter()
            .filter_map(|connection| {
                let built = self.build(connection, tick, world, grid, last_processed(connection))?;
                Some((connection, built))
            })
            .collect()
    }
}

/// Rough encoded size of a record carrying `mask`.
pub fn record_bytes(mask: FieldMask) -> usize {
    const FIELDS: [(u8, usize); 7] = [
        (FieldMask::POSITION, 12),
        (FieldMask::ROTATION, 6),
        (FieldMask::VELOCITY, 9),
        (FieldMask::HEALTH, 3),
        (FieldMask::LOCOMOTION, 1),
        (FieldMask::KIND, 1),
        (FieldMask::TEAM, 1),
    ];
    // Entity id, mask and one presence tag per field
    let header = 5 + 1 + FIELDS.len();
    header
        + FIELDS
            .iter()
            .filter(|(bit, _)| mask.contains(*bit))
            .map(|(_, size)| size)
            .sum::<usize>()
}

/// Applies a snapshot to the frames a client keeps, the way a client does.
///
/// `frames` maps server tick to the entity states held at that tick. Returns
/// the resulting frame, or None when the snapshot's baseline is not held.
pub fn apply_snapshot(
    frames: &HashMap<u32, HashMap<u32, shared::EntityState>>,
    snapshot: &Snapshot,
) -> Option<HashMap<u32, shared::EntityState>> {
    let mut next = if snapshot.full {
        HashMap::new()
    } else {
        frames.get(&snapshot.baseline_tick)?.clone()
    };
    for id in &snapshot.removed {
        next.remove(id);
    }
    for record in &snapshot.entities {
        apply_record(&mut next, record)?;
    }
    Some(next)
}

fn apply_record(
    frame: &mut HashMap<u32, shared::EntityState>,
    record: &EntityRecord,
) -> Option<()> {
    if record.is_full() {
        frame.insert(record.entity, shared::EntityState::from_full_record(record)?);
    } else {
        frame.get_mut(&record.entity)?.apply(record);
    }
    Some(())
}
