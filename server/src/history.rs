//! Lag compensation.
//!
//! A ring of per-tick transform frames, appended after movement every tick.
//! [`LagCompensator::rewind`] rebuilds the world as it was at an earlier
//! instant by interpolating between the two frames that bracket it. Requests
//! newer than the newest frame are answered with the newest frame; nothing is
//! ever extrapolated. Requests older than the oldest frame fail, and the caller
//! must reject the action instead of falling back to present positions.

use crate::components::Transform;
use crate::config::LagCompensationConfig;
use crate::error::RewindError;
use crate::world::{EntityId, World};
use shared::normalize_angle;
use std::collections::{HashMap, VecDeque};

#[derive(Debug, Clone)]
pub struct HistoryFrame {
    pub tick: u32,
    pub timestamp_ms: u64,
    /// Sorted by id.
    transforms: Vec<(EntityId, Transform)>,
}

impl HistoryFrame {
    pub fn get(&self, id: EntityId) -> Option<&Transform> {
        self.transforms
            .binary_search_by_key(&id, |(entry, _)| *entry)
            .ok()
            .map(|index| &self.transforms[index].1)
    }

    pub fn len(&self) -> usize {
        self.transforms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transforms.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(EntityId, Transform)> {
        self.transforms.iter()
    }
}

pub struct LagCompensator {
    frames: VecDeque<HistoryFrame>,
    capacity: usize,
    max_rewind_ms: u64,
    processing_margin_ms: u64,
}

impl LagCompensator {
    pub fn new(config: &LagCompensationConfig) -> Self {
        Self {
            frames: VecDeque::with_capacity(config.history_frames),
            capacity: config.history_frames.max(2),
            max_rewind_ms: config.max_rewind_ms,
            processing_margin_ms: config.processing_margin_ms,
        }
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Oldest and newest retained timestamps.
    pub fn window(&self) -> Option<(u64, u64)> {
        Some((self.frames.front()?.timestamp_ms, self.frames.back()?.timestamp_ms))
    }

    /// Appends the current transforms of every entity.
    ///
    /// Recording the same or an older timestamp again replaces the newest
    /// frame, so frame timestamps stay strictly increasing.
    pub fn record(&mut self, tick: u32, timestamp_ms: u64, world: &World) {
        let mut transforms: Vec<(EntityId, Transform)> = world
            .iter::<Transform>()
            .map(|(id, transform)| (id, *transform))
            .collect();
        transforms.sort_unstable_by_key(|(id, _)| *id);

        let frame = HistoryFrame {
            tick,
            timestamp_ms,
            transforms,
        };

        if let Some(newest) = self.frames.back_mut() {
            if timestamp_ms <= newest.timestamp_ms {
                *newest = frame;
                return;
            }
        }
        if self.frames.len() == self.capacity {
            self.frames.pop_front();
        }
        self.frames.push_back(frame);
    }

    /// The instant an observer with round trip `rtt_ms` was looking at.
    pub fn target_for(&self, now_ms: u64, rtt_ms: u64) -> Result<u64, RewindError> {
        let rewind = rtt_ms / 2 + self.processing_margin_ms;
        if rewind > self.max_rewind_ms {
            return Err(RewindError::ExceedsMaxRewind {
                requested: rewind,
                limit: self.max_rewind_ms,
            });
        }
        Ok(now_ms.saturating_sub(rewind))
    }

    /// Every entity's transform at `target_ms`.
    pub fn rewind(&self, target_ms: u64) -> Result<HashMap<EntityId, Transform>, RewindError> {
        let (older, newer, t) = self.bracket(target_ms)?;
        let mut out = HashMap::with_capacity(newer.len().max(older.len()));

        for (id, from) in older.iter() {
            let transform = match newer.get(*id) {
                Some(to) => interpolate(from, to, t),
                // Gone by the newer frame
                None => *from,
            };
            out.insert(*id, transform);
        }
        if t >= 0.5 {
            for (id, to) in newer.iter() {
                out.entry(*id).or_insert(*to);
            }
        }
        Ok(out)
    }

    /// One entity's transform at `target_ms`, if it existed then.
    pub fn rewind_entity(
        &self,
        id: EntityId,
        target_ms: u64,
    ) -> Result<Option<Transform>, RewindError> {
        let (older, newer, t) = self.bracket(target_ms)?;
        Ok(match (older.get(id), newer.get(id)) {
            (Some(from), Some(to)) => Some(interpolate(from, to, t)),
            (Some(from), None) => Some(*from),
            (None, Some(to)) if t >= 0.5 => Some(*to),
            _ => None,
        })
    }

    /// The frames on either side of `target_ms` and the blend factor.
    fn bracket(&self, target_ms: u64) -> Result<(&HistoryFrame, &HistoryFrame, f32), RewindError> {
        let oldest = self.frames.front().ok_or(RewindError::EmptyHistory)?;
        let newest = self.frames.back().ok_or(RewindError::EmptyHistory)?;

        if target_ms < oldest.timestamp_ms {
            return Err(RewindError::BeforeWindow {
                target: target_ms,
                oldest: oldest.timestamp_ms,
            });
        }
        if target_ms >= newest.timestamp_ms {
            return Ok((newest, newest, 0.0));
        }

        // First frame strictly newer than the target; index >= 1 here.
        let upper = self
            .frames
            .partition_point(|frame| frame.timestamp_ms <= target_ms);
        let older = &self.frames[upper - 1];
        let newer = &self.frames[upper];
        let span = (newer.timestamp_ms - older.timestamp_ms) as f32;
        let t = ((target_ms - older.timestamp_ms) as f32 / span).clamp(0.0, 1.0);
        Ok((older, newer, t))
    }
}

fn interpolate(from: &Transform, to: &Transform, t: f32) -> Transform {
    let yaw_delta = normalize_angle(to.yaw - from.yaw);
    Transform {
        position: from.position.lerp(&to.position, t),
        yaw: normalize_angle(from.yaw + yaw_delta * t),
        pitch: from.pitch + (to.pitch - from.pitch) * t,
        tick: if t < 0.5 { from.tick } else { to.tick },
    }
}
