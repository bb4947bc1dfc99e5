// Scaling range tables per motor type, and the id -> type registry.
//
// Profiles are fixed at process start and shared by reference; a registry
// lookup failure is a configuration error raised before any bus I/O.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("motor id {0} is outside the addressable range 1..=127")]
    IdOutOfRange(u8),

    #[error("motor id {id} has no type assignment in the registry")]
    UnknownMotor { id: u8 },

    #[error("{profile} {field} range [{min}, {max}] is degenerate")]
    DegenerateRange {
        profile: &'static str,
        field: &'static str,
        min: f32,
        max: f32,
    },
}

/// Closed numeric range for one physical quantity
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Range {
    pub min: f32,
    pub max: f32,
}

impl Range {
    pub const fn new(min: f32, max: f32) -> Self {
        Self { min, max }
    }

    pub fn width(self) -> f32 {
        self.max - self.min
    }

    pub fn clamp(self, value: f32) -> f32 {
        value.clamp(self.min, self.max)
    }
}

/// Motor classes found on the robot
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum MotorType {
    O2,
    O3,
    O5,
}

impl fmt::Display for MotorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.profile().name)
    }
}

impl MotorType {
    pub fn profile(self) -> &'static MotorProfile {
        match self {
            MotorType::O2 => &PROFILE_O2,
            MotorType::O3 => &PROFILE_O3,
            MotorType::O5 => &PROFILE_O5,
        }
    }
}

/// Scaling ranges for one motor class. The codec clamps commands into these
/// ranges before quantizing, so the table bounds what ever reaches the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct MotorProfile {
    pub name: &'static str,
    /// rad
    pub position: Range,
    /// rad/s
    pub velocity: Range,
    /// N·m
    pub torque: Range,
    pub kp: Range,
    pub kd: Range,
}

pub const PROFILE_O2: MotorProfile = MotorProfile {
    name: "RobStride O2",
    position: Range::new(-12.57, 12.57),
    velocity: Range::new(-44.0, 44.0),
    torque: Range::new(-17.0, 17.0),
    kp: Range::new(0.0, 500.0),
    kd: Range::new(0.0, 5.0),
};

pub const PROFILE_O3: MotorProfile = MotorProfile {
    name: "RobStride O3",
    position: Range::new(-12.57, 12.57),
    velocity: Range::new(-20.0, 20.0),
    torque: Range::new(-60.0, 60.0),
    kp: Range::new(0.0, 5000.0),
    kd: Range::new(0.0, 100.0),
};

pub const PROFILE_O5: MotorProfile = MotorProfile {
    name: "RobStride O5",
    position: Range::new(-12.57, 12.57),
    velocity: Range::new(-50.0, 50.0),
    torque: Range::new(-5.5, 5.5),
    kp: Range::new(0.0, 500.0),
    kd: Range::new(0.0, 5.0),
};

impl MotorProfile {
    /// Reject degenerate ranges up front; a zero-width range would divide by
    /// zero inside the codec on every encode.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let fields = [
            ("position", self.position),
            ("velocity", self.velocity),
            ("torque", self.torque),
            ("kp", self.kp),
            ("kd", self.kd),
        ];
        for (field, range) in fields {
            if !(range.min < range.max) {
                return Err(ConfigError::DegenerateRange {
                    profile: self.name,
                    field,
                    min: range.min,
                    max: range.max,
                });
            }
        }
        Ok(())
    }
}

/// Factory wiring of the biped
pub const STOCK_ASSIGNMENTS: &[(u8, MotorType)] = &[
    (1, MotorType::O2),
    (2, MotorType::O2),
    (5, MotorType::O5),
    (16, MotorType::O3),
    (17, MotorType::O3),
    (18, MotorType::O3),
    (19, MotorType::O3),
    (20, MotorType::O2),
    (127, MotorType::O2),
];

/// Maps motor identities to their type, and through it to the range table.
pub struct MotorRegistry {
    assignments: HashMap<u8, MotorType>,
}

impl MotorRegistry {
    pub fn new(assignments: &[(u8, MotorType)]) -> Result<Self, ConfigError> {
        let mut map = HashMap::with_capacity(assignments.len());
        for &(id, motor_type) in assignments {
            if id == 0 || id > 127 {
                return Err(ConfigError::IdOutOfRange(id));
            }
            motor_type.profile().validate()?;
            map.insert(id, motor_type);
        }
        Ok(Self { assignments: map })
    }

    /// Registry with the factory wiring of the biped
    pub fn stock_biped() -> Self {
        Self {
            assignments: STOCK_ASSIGNMENTS.iter().copied().collect(),
        }
    }

    pub fn motor_type(&self, id: u8) -> Result<MotorType, ConfigError> {
        self.assignments
            .get(&id)
            .copied()
            .ok_or(ConfigError::UnknownMotor { id })
    }

    pub fn lookup(&self, id: u8) -> Result<&'static MotorProfile, ConfigError> {
        self.motor_type(id).map(MotorType::profile)
    }

    pub fn ids(&self) -> Vec<u8> {
        let mut ids: Vec<u8> = self.assignments.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stock_profiles_are_valid() {
        for profile in [&PROFILE_O2, &PROFILE_O3, &PROFILE_O5] {
            profile.validate().unwrap();
        }
    }

    #[test]
    fn degenerate_range_is_rejected_at_validation() {
        let broken = MotorProfile {
            kd: Range::new(5.0, 5.0),
            ..PROFILE_O2.clone()
        };
        let err = broken.validate().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::DegenerateRange { field: "kd", .. }
        ));
    }

    #[test]
    fn registry_lookup_maps_id_to_profile() {
        let registry = MotorRegistry::stock_biped();
        assert_eq!(registry.lookup(20).unwrap().name, "RobStride O2");
        assert_eq!(registry.motor_type(5).unwrap(), MotorType::O5);
    }

    #[test]
    fn unknown_motor_is_a_config_error() {
        let registry = MotorRegistry::stock_biped();
        assert!(matches!(
            registry.lookup(42),
            Err(ConfigError::UnknownMotor { id: 42 })
        ));
    }

    #[test]
    fn out_of_range_id_is_rejected() {
        assert!(matches!(
            MotorRegistry::new(&[(0, MotorType::O2)]),
            Err(ConfigError::IdOutOfRange(0))
        ));
        assert!(matches!(
            MotorRegistry::new(&[(128, MotorType::O2)]),
            Err(ConfigError::IdOutOfRange(128))
        ));
    }

    #[test]
    fn registry_ids_are_sorted() {
        let registry = MotorRegistry::stock_biped();
        assert_eq!(registry.ids(), vec![1, 2, 5, 16, 17, 18, 19, 20, 127]);
    }
}
