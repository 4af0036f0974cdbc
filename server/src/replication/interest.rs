//! Interest management: which entities a viewer sees and how often.

use crate::components::{EntityKind, Transform, VelocityState};
use crate::config::ReplicationConfig;
use crate::physics::Vec3;
use crate::spatial::SpatialGrid;
use crate::world::{EntityId, World};

/// Update tier, in priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Tier {
    /// Within weapon or interaction range. Never throttled or deferred.
    Interaction,
    Near,
    Mid,
    Far,
}

impl Tier {
    /// Ticks between updates for this tier.
    pub fn interval(self, config: &ReplicationConfig) -> u32 {
        match self {
            Tier::Interaction | Tier::Near => 1,
            Tier::Mid => config.mid_interval.max(1),
            Tier::Far => config.far_interval.max(1),
        }
    }

    pub fn is_mandatory(self) -> bool {
        self == Tier::Interaction
    }
}

/// Tier for an entity at `distance` moving at `speed`, or None when it is
/// out of view entirely.
pub fn classify(distance: f32, speed: f32, config: &ReplicationConfig) -> Option<Tier> {
    if !distance.is_finite() || distance > config.view_radius {
        None
    } else if distance <= config.interaction_radius {
        Some(Tier::Interaction)
    } else if distance <= config.near_radius || speed >= config.fast_speed {
        Some(Tier::Near)
    } else if distance <= config.mid_radius {
        Some(Tier::Mid)
    } else {
        Some(Tier::Far)
    }
}

/// Dropped items only matter up close.
pub fn is_relevant(kind: EntityKind, distance: f32, config: &ReplicationConfig) -> bool {
    match kind {
        EntityKind::Item => distance <= config.near_radius,
        _ => true,
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Interest {
    pub entity: EntityId,
    pub tier: Tier,
    pub distance: f32,
}

/// Everything visible from `center`, highest priority first.
///
/// `own` is the viewer's own entity, always included at the top tier.
pub fn select(
    world: &World,
    grid: &SpatialGrid,
    center: Vec3,
    own: Option<EntityId>,
    config: &ReplicationConfig,
) -> Vec<Interest> {
    let mut visible: Vec<Interest> = grid
        .query_radius(center, config.view_radius)
        .into_iter()
        .filter_map(|id| {
            let transform = world.get::<Transform>(id)?;
            let distance = transform.position.horizontal_distance(&center);
            let kind = world.get::<EntityKind>(id).copied().unwrap_or_default();
            if Some(id) != own && !is_relevant(kind, distance, config) {
                return None;
            }
            let speed = world
                .get::<VelocityState>(id)
                .map_or(0.0, |v| v.velocity.horizontal_magnitude());
            let tier = if Some(id) == own {
                Tier::Interaction
            } else {
                classify(distance, speed, config)?
            };
            Some(Interest {
                entity: id,
                tier,
                distance,
            })
        })
        .collect();

    if let Some(own) = own {
        if world.contains(own) && !visible.iter().any(|interest| interest.entity == own) {
            visible.push(Interest {
                entity: own,
                tier: Tier::Interaction,
                distance: 0.0,
            });
        }
    }

    visible.sort_by(|a, b| {
        a.tier
            .cmp(&b.tier)
            .then(a.distance.total_cmp(&b.distance))
    });
    visible
}
