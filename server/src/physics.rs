use serde::{Deserialize, Serialize};
use std::ops::{Add, AddAssign, Mul, Sub};

///Represents a vector in 3D world space.
/// Y is up; the ground plane is X/Z.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    pub const ZERO: Vec3 = Vec3 {
        x: 0.0,
        y: 0.0,
        z: 0.0,
    };

    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    ///Returns the magnitude of the vector.
    pub fn magnitude(&self) -> f32 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }

    ///Returns the magnitude of the vector projected onto the ground plane.
    pub fn horizontal_magnitude(&self) -> f32 {
        (self.x * self.x + self.z * self.z).sqrt()
    }

    ///Returns the normalized vector, or zero for a zero vector.
    pub fn normalize(&self) -> Vec3 {
        let mag = self.magnitude();
        if mag == 0.0 {
            Vec3::ZERO
        } else {
            self.scale(1.0 / mag)
        }
    }

    ///Returns the scaled vector.
    pub fn scale(&self, scalar: f32) -> Vec3 {
        Vec3::new(self.x * scalar, self.y * scalar, self.z * scalar)
    }

    pub fn dot(&self, other: &Vec3) -> f32 {
        self.x * other.x + self.y * other.y + self.z * other.z
    }

    pub fn distance(&self, other: &Vec3) -> f32 {
        (*self - *other).magnitude()
    }

    pub fn horizontal_distance(&self, other: &Vec3) -> f32 {
        (*self - *other).horizontal_magnitude()
    }

    ///Linear interpolation, `t` = 0 yields `self`.
    pub fn lerp(&self, other: &Vec3, t: f32) -> Vec3 {
        Vec3::new(
            self.x + (other.x - self.x) * t,
            self.y + (other.y - self.y) * t,
            self.z + (other.z - self.z) * t,
        )
    }

    pub fn with_y(&self, y: f32) -> Vec3 {
        Vec3::new(self.x, y, self.z)
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }

    pub fn to_array(self) -> [f32; 3] {
        [self.x, self.y, self.z]
    }

    pub fn from_array(values: [f32; 3]) -> Self {
        Vec3::new(values[0], values[1], values[2])
    }
}

impl Add for Vec3 {
    type Output = Vec3;
    fn add(self, other: Vec3) -> Vec3 {
        Vec3::new(self.x + other.x, self.y + other.y, self.z + other.z)
    }
}

impl AddAssign for Vec3 {
    fn add_assign(&mut self, other: Vec3) {
        *self = *self + other;
    }
}

impl Sub for Vec3 {
    type Output = Vec3;
    fn sub(self, other: Vec3) -> Vec3 {
        Vec3::new(self.x - other.x, self.y - other.y, self.z - other.z)
    }
}

impl Mul<f32> for Vec3 {
    type Output = Vec3;
    fn mul(self, scalar: f32) -> Vec3 {
        self.scale(scalar)
    }
}

///Unit vector on the ground plane for a yaw. Yaw 0 faces -Z.
pub fn forward_from_yaw(yaw: f32) -> Vec3 {
    Vec3::new(-yaw.sin(), 0.0, -yaw.cos())
}

///Unit vector to the right of `forward_from_yaw(yaw)`.
pub fn right_from_yaw(yaw: f32) -> Vec3 {
    Vec3::new(yaw.cos(), 0.0, -yaw.sin())
}

///Unit look direction including pitch. Positive pitch looks up.
pub fn look_direction(yaw: f32, pitch: f32) -> Vec3 {
    let (sin_pitch, cos_pitch) = pitch.sin_cos();
    Vec3::new(-yaw.sin() * cos_pitch, sin_pitch, -yaw.cos() * cos_pitch)
}

///Distance along a ray to the first intersection with a sphere.
///
/// `direction` must be normalized. Returns None when the ray misses, when the
/// sphere is behind the origin, or when the hit lies beyond `max_distance`.
pub fn ray_sphere(
    origin: Vec3,
    direction: Vec3,
    max_distance: f32,
    center: Vec3,
    radius: f32,
) -> Option<f32> {
    let to_center = center - origin;
    let along = to_center.dot(&direction);
    let closest_sq = to_center.dot(&to_center) - along * along;
    let radius_sq = radius * radius;
    if closest_sq > radius_sq {
        return None;
    }
    let half_chord = (radius_sq - closest_sq).sqrt();
    let mut distance = along - half_chord;
    if distance < 0.0 {
        // Origin inside the sphere
        distance = along + half_chord;
    }
    if distance < 0.0 || distance > max_distance {
        None
    } else {
        Some(distance)
    }
}

///Whether `target` lies inside a horizontal cone of `range` and full opening `angle`.
pub fn in_cone(origin: Vec3, forward: Vec3, target: Vec3, range: f32, angle: f32) -> bool {
    let offset = (target - origin).with_y(0.0);
    let distance = offset.magnitude();
    if distance > range {
        return false;
    }
    if distance <= f32::EPSILON {
        return true;
    }
    let facing = forward.with_y(0.0).normalize();
    let cos_between = offset.scale(1.0 / distance).dot(&facing);
    cos_between >= (angle * 0.5).cos()
}

///Whether `point` lies within `radius` of `center`.
pub fn in_sphere(center: Vec3, radius: f32, point: Vec3) -> bool {
    let offset = point - center;
    offset.dot(&offset) <= radius * radius
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use std::f32::consts::{FRAC_PI_2, FRAC_PI_3};

    #[test]
    fn test_vector_magnitude() {
        let v = Vec3::new(3.0, 0.0, 4.0);
        assert_approx_eq!(v.magnitude(), 5.0);
        assert_approx_eq!(Vec3::new(3.0, 10.0, 4.0).horizontal_magnitude(), 5.0);
    }

    #[test]
    fn test_vector_normalize_zero() {
        assert_eq!(Vec3::ZERO.normalize(), Vec3::ZERO);
        let n = Vec3::new(0.0, 0.0, -2.0).normalize();
        assert_approx_eq!(n.z, -1.0);
    }

    #[test]
    fn test_lerp_endpoints() {
        let a = Vec3::new(0.0, 0.0, 0.0);
        let b = Vec3::new(10.0, 2.0, -4.0);
        assert_eq!(a.lerp(&b, 0.0), a);
        assert_eq!(a.lerp(&b, 1.0), b);
        assert_approx_eq!(a.lerp(&b, 0.5).x, 5.0);
    }

    #[test]
    fn test_forward_and_right() {
        let forward = forward_from_yaw(0.0);
        assert_approx_eq!(forward.z, -1.0);
        assert_approx_eq!(forward.x, 0.0);

        let right = right_from_yaw(0.0);
        assert_approx_eq!(right.x, 1.0);
        assert_approx_eq!(forward.dot(&right), 0.0);

        let turned = forward_from_yaw(FRAC_PI_2);
        assert_approx_eq!(turned.x, -1.0);
    }

    #[test]
    fn test_ray_sphere_hit_and_miss() {
        let origin = Vec3::ZERO;
        let dir = Vec3::new(0.0, 0.0, -1.0);

        let hit = ray_sphere(origin, dir, 50.0, Vec3::new(0.0, 0.0, -10.0), 0.5);
        assert_approx_eq!(hit.unwrap(), 9.5);

        assert!(ray_sphere(origin, dir, 50.0, Vec3::new(1.0, 0.0, -10.0), 0.5).is_none());
        assert!(ray_sphere(origin, dir, 50.0, Vec3::new(0.0, 0.0, 10.0), 0.5).is_none());
        assert!(ray_sphere(origin, dir, 5.0, Vec3::new(0.0, 0.0, -10.0), 0.5).is_none());
    }

    #[test]
    fn test_cone() {
        let origin = Vec3::ZERO;
        let forward = forward_from_yaw(0.0);
        assert!(in_cone(origin, forward, Vec3::new(0.0, 0.0, -2.0), 2.5, FRAC_PI_3));
        // 45 degrees off axis is outside a 60 degree cone
        assert!(!in_cone(origin, forward, Vec3::new(1.5, 0.0, -1.5), 2.5, FRAC_PI_3));
        assert!(!in_cone(origin, forward, Vec3::new(0.0, 0.0, -3.0), 2.5, FRAC_PI_3));
        assert!(!in_cone(origin, forward, Vec3::new(0.0, 0.0, 2.0), 2.5, FRAC_PI_3));
    }

    #[test]
    fn test_sphere_contains() {
        assert!(in_sphere(Vec3::ZERO, 5.0, Vec3::new(3.0, 0.0, 4.0)));
        assert!(!in_sphere(Vec3::ZERO, 5.0, Vec3::new(3.0, 0.1, 4.0)));
    }
}
