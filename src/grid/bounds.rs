//! Map extents
//!
//! All shapes are centred on the map origin. Planar maps ignore the z axis.

use serde::{Deserialize, Serialize};

use crate::util::vec3::Vec3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Dimensions {
    /// x/y grid; z is carried but never bucketed or bounded
    #[default]
    Planar,
    Volumetric,
}

impl Dimensions {
    pub fn is_planar(&self) -> bool {
        matches!(self, Dimensions::Planar)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "shape", rename_all = "snake_case")]
pub enum Bounds {
    Box { half_extents: Vec3 },
    /// Upright cylinder around the z axis
    Cylinder { radius: f32, half_height: f32 },
    Sphere { radius: f32 },
}

impl Bounds {
    /// Inclusive containment test
    pub fn contains(&self, p: Vec3, dimensions: Dimensions) -> bool {
        if !p.is_finite() {
            return false;
        }
        let planar = dimensions.is_planar();
        match *self {
            Bounds::Box { half_extents: h } => {
                p.x.abs() <= h.x && p.y.abs() <= h.y && (planar || p.z.abs() <= h.z)
            }
            Bounds::Cylinder { radius, half_height } => {
                p.planar_length() <= radius && (planar || p.z.abs() <= half_height)
            }
            Bounds::Sphere { radius } => {
                if planar {
                    p.planar_length() <= radius
                } else {
                    p.length() <= radius
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_box() {
        let b = Bounds::Box {
            half_extents: Vec3::new(10.0, 5.0, 2.0),
        };
        assert!(b.contains(Vec3::new(10.0, -5.0, 0.0), Dimensions::Volumetric));
        assert!(!b.contains(Vec3::new(10.1, 0.0, 0.0), Dimensions::Volumetric));
        assert!(!b.contains(Vec3::new(0.0, 0.0, 3.0), Dimensions::Volumetric));
        assert!(b.contains(Vec3::new(0.0, 0.0, 3.0), Dimensions::Planar));
    }

    #[test]
    fn test_cylinder() {
        let b = Bounds::Cylinder {
            radius: 5.0,
            half_height: 1.0,
        };
        assert!(b.contains(Vec3::new(3.0, 4.0, 0.5), Dimensions::Volumetric));
        assert!(!b.contains(Vec3::new(3.0, 4.1, 0.0), Dimensions::Volumetric));
        assert!(!b.contains(Vec3::new(0.0, 0.0, 1.5), Dimensions::Volumetric));
    }

    #[test]
    fn test_sphere() {
        let b = Bounds::Sphere { radius: 5.0 };
        assert!(b.contains(Vec3::new(3.0, 0.0, 4.0), Dimensions::Volumetric));
        assert!(!b.contains(Vec3::new(3.0, 1.0, 4.0), Dimensions::Volumetric));
        assert!(b.contains(Vec3::new(3.0, 1.0, 4.0), Dimensions::Planar));
    }

    #[test]
    fn test_non_finite_never_contained() {
        let b = Bounds::Sphere { radius: f32::MAX };
        assert!(!b.contains(Vec3::new(f32::NAN, 0.0, 0.0), Dimensions::Planar));
    }

    #[test]
    fn test_serde_shape_tag() {
        let json = serde_json::to_value(Bounds::Sphere { radius: 2.0 }).unwrap();
        assert_eq!(json["shape"], "sphere");
        let back: Bounds = serde_json::from_value(json).unwrap();
        assert_eq!(back, Bounds::Sphere { radius: 2.0 });
    }
}
