//! Uniform grid broad-phase over the ground plane.
//!
//! The grid is rebuilt from scratch every tick. Queries return every entity in
//! the cells touched by the query circle, which is a superset of the entities
//! actually inside it; callers do their own exact distance test.

use crate::config::SpatialConfig;
use crate::physics::Vec3;
use crate::world::EntityId;
use log::debug;
use std::collections::HashMap;

#[derive(Debug)]
pub struct SpatialGrid {
    cell_size: f32,
    max_cell_entities: usize,
    max_query_span: i32,
    buckets: HashMap<(i32, i32), Vec<(EntityId, Vec3)>>,
    len: usize,
}

impl SpatialGrid {
    pub fn new(config: &SpatialConfig) -> Self {
        Self {
            cell_size: config.cell_size,
            max_cell_entities: config.max_cell_entities.max(1),
            max_query_span: config.max_query_span.max(1),
            buckets: HashMap::new(),
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Empties the grid. Buckets used last tick keep their allocation.
    pub fn clear(&mut self) {
        self.buckets.retain(|_, bucket| {
            let keep = !bucket.is_empty();
            bucket.clear();
            keep
        });
        self.len = 0;
    }

    pub fn insert(&mut self, id: EntityId, position: Vec3) {
        let key = self.key(position.x, position.z);
        self.buckets.entry(key).or_default().push((id, position));
        self.len += 1;
    }

    /// Candidates within `radius` of `center` on the ground plane.
    pub fn query_radius(&self, center: Vec3, radius: f32) -> Vec<EntityId> {
        let mut out = Vec::new();
        self.query_into(center, radius, &mut out);
        out
    }

    /// Like [`SpatialGrid::query_radius`], appending into a reused buffer.
    ///
    /// Overloaded cells contribute only their `max_cell_entities` entries
    /// nearest to `center`, and a query never walks more than
    /// `max_query_span` cells per axis, so a pathological cluster yields a
    /// partial result instead of a stall.
    pub fn query_into(&self, center: Vec3, radius: f32, out: &mut Vec<EntityId>) {
        if !radius.is_finite() || radius < 0.0 || !center.is_finite() {
            return;
        }

        let mut reach = (radius / self.cell_size).ceil() as i32;
        if reach > self.max_query_span / 2 {
            debug!(
                "Spatial query radius {:.1} spans {} cells, truncating to {}",
                radius,
                reach * 2 + 1,
                self.max_query_span
            );
            reach = self.max_query_span / 2;
        }

        let (cx, cz) = self.key(center.x, center.z);
        let mut truncated_cells = 0;
        for dx in -reach..=reach {
            for dz in -reach..=reach {
                if let Some(bucket) = self.buckets.get(&(cx + dx, cz + dz)) {
                    if bucket.len() > self.max_cell_entities {
                        truncated_cells += 1;
                        out.extend(self.nearest_in(bucket, center).into_iter().map(|(id, _)| id));
                    } else {
                        out.extend(bucket.iter().map(|(id, _)| *id));
                    }
                }
            }
        }

        if truncated_cells > 0 {
            debug!(
                "Spatial query at ({:.1}, {:.1}) truncated {} overloaded cells",
                center.x, center.z, truncated_cells
            );
        }
    }

    /// Candidates paired with the position they were inserted at.
    pub fn query_positions(&self, center: Vec3, radius: f32) -> Vec<(EntityId, Vec3)> {
        let reach = ((radius / self.cell_size).ceil() as i32).min(self.max_query_span / 2);
        let (cx, cz) = self.key(center.x, center.z);
        let mut out = Vec::new();
        for dx in -reach..=reach {
            for dz in -reach..=reach {
                if let Some(bucket) = self.buckets.get(&(cx + dx, cz + dz)) {
                    if bucket.len() > self.max_cell_entities {
                        out.extend(self.nearest_in(bucket, center));
                    } else {
                        out.extend_from_slice(bucket);
                    }
                }
            }
        }
        out
    }

    /// The `max_cell_entities` entries of an overloaded bucket closest to `center`.
    fn nearest_in(&self, bucket: &[(EntityId, Vec3)], center: Vec3) -> Vec<(EntityId, Vec3)> {
        let mut nearest = bucket.to_vec();
        nearest.select_nth_unstable_by(self.max_cell_entities - 1, |a, b| {
            a.1.horizontal_distance(&center)
                .total_cmp(&b.1.horizontal_distance(&center))
        });
        nearest.truncate(self.max_cell_entities);
        nearest
    }

    fn key(&self, x: f32, z: f32) -> (i32, i32) {
        (
            (x / self.cell_size).floor() as i32,
            (z / self.cell_size).floor() as i32,
        )
    }
}
