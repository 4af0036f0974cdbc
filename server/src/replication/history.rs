//! Per-tick replicated state, kept so deltas can be computed against any
//! tick a viewer may still hold.

use crate::components::{entity_state, CombatState, EntityKind, Transform, VelocityState};
use crate::world::{EntityId, World};
use shared::EntityState;
use std::collections::{HashMap, VecDeque};

#[derive(Debug, Clone)]
pub struct StateFrame {
    pub tick: u32,
    pub states: HashMap<EntityId, EntityState>,
}

pub struct StateHistory {
    frames: VecDeque<StateFrame>,
    capacity: usize,
}

impl StateHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            frames: VecDeque::with_capacity(capacity),
            capacity: capacity.max(2),
        }
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn oldest_tick(&self) -> Option<u32> {
        self.frames.front().map(|frame| frame.tick)
    }

    pub fn newest_tick(&self) -> Option<u32> {
        self.frames.back().map(|frame| frame.tick)
    }

    /// Quantizes every entity with a transform. Capturing a tick twice
    /// replaces the earlier capture.
    pub fn capture(&mut self, tick: u32, world: &World) {
        let states = world
            .iter::<Transform>()
            .map(|(id, transform)| {
                let state = entity_state(
                    id.to_raw(),
                    transform,
                    world.get::<VelocityState>(id),
                    world.get::<CombatState>(id),
                    world.get::<EntityKind>(id).copied().unwrap_or_default(),
                );
                (id, state)
            })
            .collect();
        let frame = StateFrame { tick, states };

        if let Some(newest) = self.frames.back_mut() {
            if newest.tick == tick {
                *newest = frame;
                return;
            }
        }
        if self.frames.len() == self.capacity {
            self.frames.pop_front();
        }
        self.frames.push_back(frame);
    }

    pub fn frame(&self, tick: u32) -> Option<&StateFrame> {
        let index = self
            .frames
            .binary_search_by_key(&tick, |frame| frame.tick)
            .ok()?;
        self.frames.get(index)
    }

    pub fn state(&self, tick: u32, id: EntityId) -> Option<&EntityState> {
        self.frame(tick)?.states.get(&id)
    }

    /// Whether `tick` is still retained.
    pub fn contains(&self, tick: u32) -> bool {
        self.frame(tick).is_some()
    }
}
