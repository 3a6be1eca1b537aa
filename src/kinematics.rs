//! Joint angle <-> multi-turn tick conversion.
//!
//! A servo reports `0..ticks_per_turn` within one motor turn. Counting whole
//! turns on top of that gives a continuous "total tick" position; the home
//! reference (`home_loops`, `home_ticks`) is the total tick count at which the
//! joint angle is zero.

use std::f64::consts::TAU;

use crate::error::{Result, ServoError};

pub const DEFAULT_TICKS_PER_TURN: u32 = 4096;

/// Mechanical sign between motor rotation and joint angle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Orientation {
    #[default]
    Normal,
    Reversed,
}

impl Orientation {
    pub fn sign(self) -> f64 {
        match self {
            Orientation::Normal => 1.0,
            Orientation::Reversed => -1.0,
        }
    }
}

impl TryFrom<i64> for Orientation {
    type Error = ServoError;

    fn try_from(value: i64) -> Result<Self> {
        match value {
            1 => Ok(Orientation::Normal),
            -1 => Ok(Orientation::Reversed),
            other => Err(ServoError::InvalidArgument(format!(
                "orientation must be 1 or -1, got {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ServoKinematics {
    ticks_per_turn: u32,
    gear_ratio: f64,
    orientation: Orientation,
    offset_rad: f64,
    home_ticks: u32,
    home_loops: i64,
}

impl Default for ServoKinematics {
    fn default() -> Self {
        Self {
            ticks_per_turn: DEFAULT_TICKS_PER_TURN,
            gear_ratio: 1.0,
            orientation: Orientation::Normal,
            offset_rad: 0.0,
            home_ticks: 0,
            home_loops: 0,
        }
    }
}

impl ServoKinematics {
    pub fn new(
        ticks_per_turn: u32,
        gear_ratio: f64,
        orientation: Orientation,
        offset_rad: f64,
        home_ticks: u32,
        home_loops: i64,
    ) -> Result<Self> {
        if ticks_per_turn == 0 {
            return Err(ServoError::InvalidArgument(
                "ticks_per_turn must be positive".into(),
            ));
        }
        if !(gear_ratio.is_finite() && gear_ratio > 0.0) {
            return Err(ServoError::InvalidArgument(format!(
                "gear_ratio must be positive, got {gear_ratio}"
            )));
        }
        if !offset_rad.is_finite() {
            return Err(ServoError::InvalidArgument(format!(
                "position offset must be finite, got {offset_rad}"
            )));
        }
        if home_ticks >= ticks_per_turn {
            return Err(ServoError::InvalidArgument(format!(
                "home_ticks {home_ticks} outside 0..{ticks_per_turn}"
            )));
        }

        Ok(Self {
            ticks_per_turn,
            gear_ratio,
            orientation,
            offset_rad,
            home_ticks,
            home_loops,
        })
    }

    pub fn ticks_per_turn(&self) -> u32 {
        self.ticks_per_turn
    }

    pub fn gear_ratio(&self) -> f64 {
        self.gear_ratio
    }

    pub fn orientation(&self) -> Orientation {
        self.orientation
    }

    pub fn home_loops(&self) -> i64 {
        self.home_loops
    }

    pub fn home_total_ticks(&self) -> i64 {
        self.home_loops * self.ticks_per_turn as i64 + self.home_ticks as i64
    }

    /// Total (unwrapped) motor ticks for a joint angle in radians.
    pub fn angle_to_ticks(&self, angle_rad: f64) -> f64 {
        let joint_angle = (angle_rad + self.offset_rad) * self.orientation.sign();
        let motor_ticks = joint_angle * (self.ticks_per_turn as f64 / TAU) * self.gear_ratio;
        self.home_total_ticks() as f64 + motor_ticks
    }

    /// Joint angle in radians for a total (unwrapped) tick count.
    pub fn ticks_to_angle(&self, total_ticks: f64) -> f64 {
        let mech = (total_ticks - self.home_total_ticks() as f64)
            / (self.ticks_per_turn as f64 * self.gear_ratio)
            * TAU;
        // sign * sign == 1, so this undoes the forward orientation flip.
        mech * self.orientation.sign() - self.offset_rad
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::{FRAC_PI_2, PI};

    fn variants() -> Vec<ServoKinematics> {
        let mut variants = Vec::new();
        for &gear in &[1.0, 3.0, 0.5, 7.25] {
            for &orientation in &[Orientation::Normal, Orientation::Reversed] {
                for &offset in &[0.0, 0.3, -1.2] {
                    for &(home_ticks, home_loops) in &[(0, 0), (2048, 0), (17, -3), (4095, 5)] {
                        variants.push(
                            ServoKinematics::new(4096, gear, orientation, offset, home_ticks, home_loops)
                                .unwrap(),
                        );
                    }
                }
            }
        }
        variants
    }

    #[test]
    fn quarter_turn_with_gear_three() {
        let kin = ServoKinematics::new(4096, 3.0, Orientation::Normal, 0.0, 0, 0).unwrap();
        assert!((kin.angle_to_ticks(FRAC_PI_2) - 3072.0).abs() < 1e-9);
    }

    #[test]
    fn round_trip_within_two_turns() {
        for kin in variants() {
            for step in -40..=40 {
                let angle = step as f64 * (2.0 * PI / 40.0);
                let back = kin.ticks_to_angle(kin.angle_to_ticks(angle));
                assert!(
                    (back - angle).abs() < 1e-6,
                    "{:?}: {} -> {}",
                    kin,
                    angle,
                    back
                );
            }
        }
    }

    #[test]
    fn reversed_orientation_flips_direction() {
        let normal = ServoKinematics::new(4096, 1.0, Orientation::Normal, 0.0, 2048, 0).unwrap();
        let reversed = ServoKinematics::new(4096, 1.0, Orientation::Reversed, 0.0, 2048, 0).unwrap();
        assert!((normal.angle_to_ticks(FRAC_PI_2) - 3072.0).abs() < 1e-9);
        assert!((reversed.angle_to_ticks(FRAC_PI_2) - 1024.0).abs() < 1e-9);
    }

    #[test]
    fn home_reference_is_zero_angle() {
        let kin = ServoKinematics::new(4096, 2.0, Orientation::Reversed, 0.0, 100, -2).unwrap();
        assert_eq!(kin.home_total_ticks(), -2 * 4096 + 100);
        assert!(kin.ticks_to_angle(kin.home_total_ticks() as f64).abs() < 1e-12);
    }

    #[test]
    fn rejects_invalid_parameters() {
        assert!(ServoKinematics::new(0, 1.0, Orientation::Normal, 0.0, 0, 0).is_err());
        assert!(ServoKinematics::new(4096, 0.0, Orientation::Normal, 0.0, 0, 0).is_err());
        assert!(ServoKinematics::new(4096, -2.0, Orientation::Normal, 0.0, 0, 0).is_err());
        assert!(ServoKinematics::new(4096, 1.0, Orientation::Normal, 0.0, 4096, 0).is_err());
        assert!(Orientation::try_from(0).is_err());
        assert_eq!(Orientation::try_from(-1).unwrap(), Orientation::Reversed);
    }
}
