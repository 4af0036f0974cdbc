//! Static division of the world into rectangular zones.

use crate::config::{MigrationConfig, MovementConfig};
use crate::physics::Vec3;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ZoneId(pub u32);

impl fmt::Display for ZoneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "zone {}", self.0)
    }
}

/// Axis-aligned rectangle on the XZ plane. Min inclusive, max exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ZoneBounds {
    pub min_x: f32,
    pub min_z: f32,
    pub max_x: f32,
    pub max_z: f32,
}

impl ZoneBounds {
    pub fn contains(&self, position: Vec3) -> bool {
        position.x >= self.min_x
            && position.x < self.max_x
            && position.z >= self.min_z
            && position.z < self.max_z
    }

    /// Distance from `position` to the nearest edge, negative outside.
    pub fn edge_distance(&self, position: Vec3) -> f32 {
        let dx = (position.x - self.min_x).min(self.max_x - position.x);
        let dz = (position.z - self.min_z).min(self.max_z - position.z);
        dx.min(dz)
    }

    pub fn center(&self) -> Vec3 {
        Vec3::new(
            (self.min_x + self.max_x) * 0.5,
            0.0,
            (self.min_z + self.max_z) * 0.5,
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ZoneDefinition {
    pub id: ZoneId,
    pub bounds: ZoneBounds,
    pub aura_band: f32,
    pub spawn_point: Vec3,
    /// Zones sharing an edge or corner.
    pub neighbors: Vec<ZoneId>,
}

impl ZoneDefinition {
    pub fn contains(&self, position: Vec3) -> bool {
        self.bounds.contains(position)
    }

    /// Inside the zone but within the aura band of an edge.
    pub fn in_aura(&self, position: Vec3) -> bool {
        self.contains(position) && self.bounds.edge_distance(position) < self.aura_band
    }

    /// Outside the zone but close enough to hold a shadow of.
    pub fn in_outer_aura(&self, position: Vec3) -> bool {
        !self.contains(position) && self.bounds.edge_distance(position) > -self.aura_band
    }
}

/// Every zone in the world, laid out as a `zones_x` by `zones_z` grid.
#[derive(Debug, Clone)]
pub struct WorldPartition {
    zones: Vec<ZoneDefinition>,
    columns: u32,
    rows: u32,
    world_min: [f32; 3],
    cell_x: f32,
    cell_z: f32,
}

impl WorldPartition {
    pub fn grid(migration: &MigrationConfig, movement: &MovementConfig) -> Self {
        let columns = migration.zones_x.max(1);
        let rows = migration.zones_z.max(1);
        let min = movement.world_min;
        let max = movement.world_max;
        let cell_x = (max[0] - min[0]) / columns as f32;
        let cell_z = (max[2] - min[2]) / rows as f32;

        let mut zones = Vec::with_capacity((columns * rows) as usize);
        for row in 0..rows {
            for column in 0..columns {
                let bounds = ZoneBounds {
                    min_x: min[0] + column as f32 * cell_x,
                    min_z: min[2] + row as f32 * cell_z,
                    max_x: min[0] + (column + 1) as f32 * cell_x,
                    max_z: min[2] + (row + 1) as f32 * cell_z,
                };
                let mut neighbors = Vec::new();
                for dz in -1i64..=1 {
                    for dx in -1i64..=1 {
                        let (nx, nz) = (column as i64 + dx, row as i64 + dz);
                        if (dx, dz) != (0, 0)
                            && (0..columns as i64).contains(&nx)
                            && (0..rows as i64).contains(&nz)
                        {
                            neighbors.push(ZoneId((nz * columns as i64 + nx) as u32));
                        }
                    }
                }
                let mut spawn_point = bounds.center();
                spawn_point.y = movement.ground_height;
                zones.push(ZoneDefinition {
                    id: ZoneId(row * columns + column),
                    bounds,
                    aura_band: migration.aura_band,
                    spawn_point,
                    neighbors,
                });
            }
        }

        Self {
            zones,
            columns,
            rows,
            world_min: min,
            cell_x,
            cell_z,
        }
    }

    pub fn zones(&self) -> &[ZoneDefinition] {
        &self.zones
    }

    pub fn zone(&self, id: ZoneId) -> Option<&ZoneDefinition> {
        self.zones.get(id.0 as usize)
    }

    pub fn len(&self) -> usize {
        self.zones.len()
    }

    pub fn is_empty(&self) -> bool {
        self.zones.is_empty()
    }

    /// The zone a position is geographically inside. Positions outside the
    /// world are attributed to the nearest edge zone.
    pub fn zone_at(&self, position: Vec3) -> ZoneId {
        let column = ((position.x - self.world_min[0]) / self.cell_x).floor() as i64;
        let row = ((position.z - self.world_min[2]) / self.cell_z).floor() as i64;
        let column = column.clamp(0, self.columns as i64 - 1) as u32;
        let row = row.clamp(0, self.rows as i64 - 1) as u32;
        ZoneId(row * self.columns + column)
    }

    /// The neighbour of `from` whose territory `position` is in or nearest to,
    /// if the position is in `from`'s aura band.
    pub fn neighbor_toward(&self, from: ZoneId, position: Vec3) -> Option<ZoneId> {
        let zone = self.zone(from)?;
        let band = zone.aura_band;
        // Push a test point across the nearest edge so a position still inside
        // the band resolves to the zone on the other side.
        let b = &zone.bounds;
        let mut outside = position;
        if position.x - b.min_x < band {
            outside.x = b.min_x - band;
        } else if b.max_x - position.x <= band {
            outside.x = b.max_x + band;
        }
        if position.z - b.min_z < band {
            outside.z = b.min_z - band;
        } else if b.max_z - position.z <= band {
            outside.z = b.max_z + band;
        }
        let target = self.zone_at(outside);
        (target != from && zone.neighbors.contains(&target)).then_some(target)
    }
}
