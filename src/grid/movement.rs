use crate::grid::bounds::{Bounds, Dimensions};
use crate::util::vec3::Vec3;

/// Why a move was refused
#[derive(Debug, Clone, Copy, PartialEq, thiserror::Error)]
pub enum MoveViolation {
    #[error("NaN or Infinity in destination")]
    NonFinite,
    #[error("Destination ({0:?}) outside map bounds")]
    OutOfBounds(Vec3),
    #[error("Displacement {distance} exceeds speed cap {cap}")]
    TooFast { distance: f32, cap: f32 },
}

/// Who asked for a move
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveOrigin {
    /// Requested by the owning client; speed capped
    Client,
    /// Issued by server code (teleports, map entry); never speed capped
    Server,
}

/// Movement policy for one map
#[derive(Debug, Clone, Copy)]
pub struct MoveValidator {
    bounds: Bounds,
    dimensions: Dimensions,
    speed_cap: f32,
}

impl MoveValidator {
    pub fn new(bounds: Bounds, dimensions: Dimensions, speed_cap: f32) -> Self {
        Self {
            bounds,
            dimensions,
            speed_cap,
        }
    }

    pub fn speed_cap(&self) -> f32 {
        self.speed_cap
    }

    /// Check a move from the last accepted position `from` to `to`
    pub fn validate(&self, from: Vec3, to: Vec3, origin: MoveOrigin) -> Result<(), MoveViolation> {
        if !to.is_finite() {
            return Err(MoveViolation::NonFinite);
        }
        if !self.bounds.contains(to, self.dimensions) {
            return Err(MoveViolation::OutOfBounds(to));
        }
        if origin == MoveOrigin::Client {
            let distance = if self.dimensions.is_planar() {
                (to - from).planar_length()
            } else {
                from.distance_to(to)
            };
            if distance > self.speed_cap {
                return Err(MoveViolation::TooFast {
                    distance,
                    cap: self.speed_cap,
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validator() -> MoveValidator {
        MoveValidator::new(
            Bounds::Box {
                half_extents: Vec3::new(100.0, 100.0, 10.0),
            },
            Dimensions::Planar,
            5.0,
        )
    }

    #[test]
    fn test_client_move_within_cap() {
        let v = validator();
        assert!(v
            .validate(Vec3::ZERO, Vec3::new(3.0, 4.0, 0.0), MoveOrigin::Client)
            .is_ok());
    }

    #[test]
    fn test_client_move_too_fast() {
        let v = validator();
        let result = v.validate(Vec3::ZERO, Vec3::new(6.0, 0.0, 0.0), MoveOrigin::Client);
        assert!(matches!(result, Err(MoveViolation::TooFast { .. })));
    }

    #[test]
    fn test_server_move_ignores_cap() {
        let v = validator();
        assert!(v
            .validate(Vec3::ZERO, Vec3::new(90.0, -90.0, 0.0), MoveOrigin::Server)
            .is_ok());
    }

    #[test]
    fn test_bounds_apply_to_everyone() {
        let v = validator();
        let outside = Vec3::new(101.0, 0.0, 0.0);
        assert!(matches!(
            v.validate(Vec3::new(99.0, 0.0, 0.0), outside, MoveOrigin::Server),
            Err(MoveViolation::OutOfBounds(_))
        ));
    }

    #[test]
    fn test_non_finite() {
        let v = validator();
        assert_eq!(
            v.validate(Vec3::ZERO, Vec3::new(f32::INFINITY, 0.0, 0.0), MoveOrigin::Server),
            Err(MoveViolation::NonFinite)
        );
    }
}
