//! Kinematic movement for one zone tick.
//!
//! Horizontal velocity eases toward the requested velocity with a fixed
//! per-tick factor (acceleration while input is held, deceleration when it
//! is released) and is then capped for the current locomotion mode. Vertical
//! motion only comes from jumping and gravity. There is no force integration,
//! so the client can run the same function and land on the same result.

use crate::components::{CombatState, Locomotion, Transform, VelocityState};
use crate::config::MovementConfig;
use crate::physics::{forward_from_yaw, right_from_yaw, Vec3};
use crate::validation::{
    log_violation, ClaimCheck, MovementValidator, Sanction, StepVerdict, ViolationTracker,
};
use crate::world::{EntityId, World};
use crate::zone::migration::MigrationState;
use log::debug;
use shared::{dequantize_position, normalize_angle, ActionFlags, InputRecord, MAX_PITCH};
use std::collections::HashMap;

/// Speeds below this snap to rest.
const REST_SPEED: f32 = 0.01;

/// Something worth acting on from one entity's step.
#[derive(Debug, Clone, PartialEq)]
pub struct MovementReport {
    pub entity: EntityId,
    pub sequence: Option<u32>,
    pub verdict: StepVerdict,
    pub claim: ClaimCheck,
    pub sanction: Sanction,
}

pub struct MovementSystem {
    config: MovementConfig,
    dt: f32,
}

impl MovementSystem {
    pub fn new(config: MovementConfig, dt: f32) -> Self {
        Self { config, dt }
    }

    pub fn dt(&self) -> f32 {
        self.dt
    }

    /// Horizontal speed cap for a locomotion mode.
    pub fn max_speed(&self, locomotion: Locomotion) -> f32 {
        match locomotion {
            Locomotion::Grounded => self.config.max_speed,
            // Airborne keeps the sprint cap so a running jump keeps its momentum.
            Locomotion::Sprinting | Locomotion::Airborne => {
                self.config.max_speed * self.config.sprint_multiplier
            }
        }
    }

    /// Advances one entity by one tick. Pure: callers decide what to keep.
    pub fn integrate(
        &self,
        transform: &Transform,
        state: &VelocityState,
        input: Option<&InputRecord>,
    ) -> (Transform, VelocityState) {
        let ground = self.config.ground_height;
        let mut next = *transform;
        let mut velocity = state.velocity;
        let grounded = transform.position.y <= ground + f32::EPSILON && velocity.y <= 0.0;

        let (strafe, forward, sprint, jump) = match input {
            Some(input) => {
                next.yaw = normalize_angle(input.yaw_radians());
                next.pitch = input.pitch_radians().clamp(-MAX_PITCH, MAX_PITCH);
                let (strafe, forward) = input.move_vector();
                (
                    strafe,
                    forward,
                    input.actions.contains(ActionFlags::SPRINT),
                    input.actions.contains(ActionFlags::JUMP),
                )
            }
            None => (0.0, 0.0, false, false),
        };

        let moving = strafe != 0.0 || forward != 0.0;
        let sprinting = sprint && moving;
        let target_speed = if sprinting {
            self.config.max_speed * self.config.sprint_multiplier
        } else {
            self.config.max_speed
        };

        let wish = (forward_from_yaw(next.yaw) * forward + right_from_yaw(next.yaw) * strafe)
            * target_speed;
        let rate = if moving {
            self.config.acceleration
        } else {
            self.config.deceleration
        };
        let factor = (rate * self.dt).min(1.0);
        let mut horizontal = velocity.with_y(0.0).lerp(&wish, factor);
        if !moving && horizontal.horizontal_magnitude() < REST_SPEED {
            horizontal = Vec3::ZERO;
        }

        // Vertical
        let mut vertical = if grounded { 0.0 } else { velocity.y };
        if grounded && jump {
            vertical = self.config.jump_velocity;
        } else if !grounded {
            vertical -= self.config.gravity * self.dt;
        }

        let mut locomotion = if grounded && vertical <= 0.0 {
            if sprinting {
                Locomotion::Sprinting
            } else {
                Locomotion::Grounded
            }
        } else {
            Locomotion::Airborne
        };

        let cap = self.max_speed(locomotion);
        let speed = horizontal.horizontal_magnitude();
        if speed > cap {
            horizontal = horizontal.scale(cap / speed);
        }
        velocity = horizontal.with_y(vertical);

        let mut position = transform.position + velocity * self.dt;
        if position.y <= ground {
            position.y = ground;
            if velocity.y < 0.0 {
                velocity.y = 0.0;
            }
            if locomotion == Locomotion::Airborne && velocity.y <= 0.0 {
                locomotion = if sprinting {
                    Locomotion::Sprinting
                } else {
                    Locomotion::Grounded
                };
            }
        }
        next.position = self.clamp_to_world(position);

        (
            next,
            VelocityState {
                velocity,
                locomotion,
            },
        )
    }

    pub fn clamp_to_world(&self, position: Vec3) -> Vec3 {
        let min = self.config.world_min;
        let max = self.config.world_max;
        Vec3::new(
            position.x.clamp(min[0], max[0]),
            position.y.clamp(min[1], max[1]),
            position.z.clamp(min[2], max[2]),
        )
    }

    /// Runs one tick for every simulated entity in the world.
    ///
    /// Entities in `inputs` consume exactly that input; everything else keeps
    /// decelerating and falling. Entities frozen for migration and dead
    /// entities are skipped.
    pub fn run(
        &self,
        world: &mut World,
        validator: &MovementValidator,
        inputs: &HashMap<EntityId, InputRecord>,
        tick: u32,
        now_ms: u64,
    ) -> Vec<MovementReport> {
        let mut reports = Vec::new();
        let movers: Vec<(EntityId, Transform, VelocityState)> = world
            .iter::<VelocityState>()
            .filter_map(|(id, state)| {
                let transform = world.get::<Transform>(id)?;
                Some((id, *transform, *state))
            })
            .collect();

        for (id, transform, state) in movers {
            let simulated = world
                .get::<MigrationState>(id)
                .map_or(true, MigrationState::is_simulated);
            let dead = world.get::<CombatState>(id).map_or(false, CombatState::is_dead);
            if !simulated || dead {
                continue;
            }

            let input = inputs.get(&id);
            let (candidate, next_state) = self.integrate(&transform, &state, input);

            let elapsed = tick.saturating_sub(transform.tick).max(1) as f32 * self.dt;
            let cap = self.max_speed(state.locomotion).max(self.max_speed(next_state.locomotion));
            let verdict = validator.check_step(transform.position, candidate.position, cap, elapsed);
            let mut next = candidate;
            next.position =
                validator.resolve_step(transform.position, candidate.position, verdict);
            next.tick = tick.max(transform.tick);

            let claimed = input
                .and_then(|input| input.claimed_position)
                .map(|q| Vec3::from_array(dequantize_position(q)));
            let claim = validator.check_claim(claimed, next.position, cap, elapsed);

            let mut final_state = next_state;
            if let StepVerdict::Teleport { .. } = verdict {
                final_state.velocity = Vec3::ZERO;
            }

            if let Err(err) = world.set(id, next).and(world.set(id, final_state)) {
                debug!("Movement of {} not stored: {}", id, err);
                continue;
            }

            let violation = verdict.is_violation() || claim.is_violation();
            let sanction = if violation {
                let sanction = match world.get_mut::<ViolationTracker>(id) {
                    Some(tracker) => tracker.record(now_ms, validator.config()),
                    None => {
                        let mut tracker = ViolationTracker::new();
                        let sanction = tracker.record(now_ms, validator.config());
                        if let Err(err) = world.set(id, tracker) {
                            debug!("Violation tracker for {} not stored: {}", id, err);
                        }
                        sanction
                    }
                };
                let (what, detail) = describe(&verdict, &claim);
                log_violation(id, what, detail, sanction);
                sanction
            } else {
                Sanction::None
            };

            if violation || matches!(claim, ClaimCheck::NeedsCorrection { .. }) {
                reports.push(MovementReport {
                    entity: id,
                    sequence: input.map(|input| input.sequence),
                    verdict,
                    claim,
                    sanction,
                });
            }
        }

        reports
    }
}

fn describe(verdict: &StepVerdict, claim: &ClaimCheck) -> (&'static str, f32) {
    match (verdict, claim) {
        (StepVerdict::Teleport { distance }, _) => ("teleport step", *distance),
        (StepVerdict::Clamped { requested, .. }, _) => ("overspeed step", *requested),
        (_, ClaimCheck::Teleport { error }) => ("teleport claim", *error),
        (_, ClaimCheck::SpeedViolation { error }) => ("overspeed claim", *error),
        _ => ("movement", 0.0),
    }
}
