//! Movement validation and violation accounting.
//!
//! Every step the simulation produces is checked against the largest
//! displacement physically possible since the entity's last authoritative
//! write. The client's own idea of where it is only ever gets compared against
//! the result, never applied.

use crate::config::AntiCheatConfig;
use crate::physics::Vec3;
use log::warn;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StepVerdict {
    Accepted,
    /// Step was longer than allowed and has been shortened.
    Clamped { requested: f32, allowed: f32 },
    /// Step exceeded the absolute teleport threshold and was reverted.
    Teleport { distance: f32 },
}

impl StepVerdict {
    pub fn is_violation(&self) -> bool {
        !matches!(self, StepVerdict::Accepted)
    }
}

/// Outcome of comparing a client's predicted position with ours.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClaimCheck {
    /// No claim, or within tolerance.
    Agrees,
    /// Off by more than the tolerance but physically plausible.
    NeedsCorrection { error: f32 },
    /// Further off than the client could have moved.
    SpeedViolation { error: f32 },
    Teleport { error: f32 },
}

impl ClaimCheck {
    pub fn is_violation(&self) -> bool {
        matches!(
            self,
            ClaimCheck::SpeedViolation { .. } | ClaimCheck::Teleport { .. }
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sanction {
    None,
    Warn,
    Disconnect,
}

pub struct MovementValidator {
    config: AntiCheatConfig,
}

impl MovementValidator {
    pub fn new(config: AntiCheatConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AntiCheatConfig {
        &self.config
    }

    /// Largest horizontal step allowed over `elapsed` seconds.
    pub fn allowance(&self, max_speed: f32, elapsed: f32) -> f32 {
        max_speed * elapsed * self.config.speed_tolerance
    }

    /// Checks a horizontal step from `from` to `to`.
    pub fn check_step(&self, from: Vec3, to: Vec3, max_speed: f32, elapsed: f32) -> StepVerdict {
        let distance = from.horizontal_distance(&to);
        if !distance.is_finite() || distance > self.config.teleport_threshold {
            return StepVerdict::Teleport {
                distance: if distance.is_finite() { distance } else { f32::MAX },
            };
        }
        let allowed = self.allowance(max_speed, elapsed);
        if distance > allowed {
            StepVerdict::Clamped {
                requested: distance,
                allowed,
            }
        } else {
            StepVerdict::Accepted
        }
    }

    /// Where the entity ends up after a verdict on the step `from` -> `to`.
    pub fn resolve_step(&self, from: Vec3, to: Vec3, verdict: StepVerdict) -> Vec3 {
        match verdict {
            StepVerdict::Accepted => to,
            StepVerdict::Teleport { .. } => from,
            StepVerdict::Clamped { requested, allowed } => {
                let ratio = if requested > 0.0 { allowed / requested } else { 0.0 };
                let offset = to - from;
                Vec3::new(
                    from.x + offset.x * ratio,
                    to.y,
                    from.z + offset.z * ratio,
                )
            }
        }
    }

    /// Compares a client claim against the authoritative position.
    pub fn check_claim(
        &self,
        claimed: Option<Vec3>,
        authoritative: Vec3,
        max_speed: f32,
        elapsed: f32,
    ) -> ClaimCheck {
        let Some(claimed) = claimed else {
            return ClaimCheck::Agrees;
        };
        let error = claimed.horizontal_distance(&authoritative);
        if !error.is_finite() || error > self.config.teleport_threshold {
            ClaimCheck::Teleport { error }
        } else if error > self.allowance(max_speed, elapsed) + self.config.position_tolerance {
            ClaimCheck::SpeedViolation { error }
        } else if error > self.config.position_tolerance {
            ClaimCheck::NeedsCorrection { error }
        } else {
            ClaimCheck::Agrees
        }
    }
}

/// Rolling window of violation timestamps for one entity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ViolationTracker {
    recent: VecDeque<u64>,
    total: u32,
}

impl ViolationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn total(&self) -> u32 {
        self.total
    }

    /// Violations inside the window ending at `now_ms`.
    pub fn recent(&self, now_ms: u64, window_ms: u64) -> usize {
        self.recent
            .iter()
            .filter(|at| now_ms.saturating_sub(**at) <= window_ms)
            .count()
    }

    /// Records a violation and reports what should happen to the offender.
    pub fn record(&mut self, now_ms: u64, config: &AntiCheatConfig) -> Sanction {
        while let Some(oldest) = self.recent.front() {
            if now_ms.saturating_sub(*oldest) > config.violation_window_ms {
                self.recent.pop_front();
            } else {
                break;
            }
        }
        self.recent.push_back(now_ms);
        self.total = self.total.saturating_add(1);

        if self.recent.len() >= config.violation_threshold as usize {
            Sanction::Disconnect
        } else {
            Sanction::Warn
        }
    }
}

/// Logs a violation in one place so every source reads the same.
pub fn log_violation(entity: impl std::fmt::Display, what: &str, detail: f32, sanction: Sanction) {
    warn!(
        "Movement violation by {}: {} ({:.2}), sanction {:?}",
        entity, what, detail, sanction
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    const DT: f32 = 1.0 / 60.0;

    fn validator() -> MovementValidator {
        MovementValidator::new(AntiCheatConfig::default())
    }

    #[test]
    fn test_legal_step_accepted() {
        let v = validator();
        let verdict = v.check_step(Vec3::ZERO, Vec3::new(0.0, 0.0, -0.1), 6.0, DT);
        assert_eq!(verdict, StepVerdict::Accepted);
    }

    #[test]
    fn test_fast_step_clamped_to_allowance() {
        let v = validator();
        let to = Vec3::new(0.0, 0.0, -1.0);
        let verdict = v.check_step(Vec3::ZERO, to, 6.0, DT);
        let StepVerdict::Clamped { allowed, .. } = verdict else {
            panic!("expected clamp, got {:?}", verdict);
        };
        assert_approx_eq!(allowed, 6.0 * DT * 1.2);

        let resolved = v.resolve_step(Vec3::ZERO, to, verdict);
        assert_approx_eq!(resolved.horizontal_magnitude(), allowed);
        assert!(resolved.z < 0.0);
    }

    #[test]
    fn test_teleport_flagged() {
        let v = validator();
        let verdict = v.check_step(Vec3::ZERO, Vec3::new(150.0, 0.0, 0.0), 6.0, DT);
        assert!(matches!(verdict, StepVerdict::Teleport { .. }));
        assert_eq!(
            v.resolve_step(Vec3::ZERO, Vec3::new(150.0, 0.0, 0.0), verdict),
            Vec3::ZERO
        );
    }

    #[test]
    fn test_teleport_flagged_even_with_long_elapsed() {
        let v = validator();
        // 101 units over 100 seconds is slow, but still a single-step teleport
        let verdict = v.check_step(Vec3::ZERO, Vec3::new(0.0, 0.0, 101.0), 6.0, 100.0);
        assert!(matches!(verdict, StepVerdict::Teleport { .. }));
    }

    #[test]
    fn test_claim_checks() {
        let v = validator();
        let here = Vec3::new(10.0, 0.0, 10.0);

        assert_eq!(v.check_claim(None, here, 6.0, DT), ClaimCheck::Agrees);
        assert_eq!(
            v.check_claim(Some(Vec3::new(10.2, 0.0, 10.0)), here, 6.0, DT),
            ClaimCheck::Agrees
        );
        assert!(matches!(
            v.check_claim(Some(Vec3::new(10.55, 0.0, 10.0)), here, 6.0, DT),
            ClaimCheck::NeedsCorrection { .. }
        ));
        assert!(matches!(
            v.check_claim(Some(Vec3::new(15.0, 0.0, 10.0)), here, 6.0, DT),
            ClaimCheck::SpeedViolation { .. }
        ));
        assert!(matches!(
            v.check_claim(Some(Vec3::new(500.0, 0.0, 10.0)), here, 6.0, DT),
            ClaimCheck::Teleport { .. }
        ));
    }

    #[test]
    fn test_violation_window_escalates() {
        let config = AntiCheatConfig::default();
        let mut tracker = ViolationTracker::new();

        assert_eq!(tracker.record(0, &config), Sanction::Warn);
        assert_eq!(tracker.record(1_000, &config), Sanction::Warn);
        assert_eq!(tracker.record(2_000, &config), Sanction::Disconnect);
        assert_eq!(tracker.total(), 3);
    }

    #[test]
    fn test_violation_window_expires() {
        let config = AntiCheatConfig::default();
        let mut tracker = ViolationTracker::new();

        tracker.record(0, &config);
        tracker.record(1_000, &config);
        // Both earlier violations are outside the 5 s window by now
        assert_eq!(tracker.record(7_000, &config), Sanction::Warn);
        assert_eq!(tracker.recent(7_000, config.violation_window_ms), 1);
    }
}
