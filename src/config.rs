//! Driver configuration, loaded from TOML.
//!
//! ```toml
//! port = "/dev/ttyUSB0"
//! joint_order = ["shoulder", "elbow"]
//! motor_ids = [1, 2]
//!
//! [gear_ratios]
//! "2" = 3.0
//!
//! [motor_orientations]
//! "2" = -1
//! ```
//!
//! Per-servo tables are keyed by the servo id as a string; servos missing from
//! a table get the neutral value. Keys this driver does not use (older offset
//! tables, gripper sections) are ignored with a warning.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use log::warn;
use serde::Deserialize;

use crate::controller::MotionSettings;
use crate::error::{Result, ServoError};
use crate::kinematics::{DEFAULT_TICKS_PER_TURN, Orientation, ServoKinematics};
use crate::registers::MAX_ID;
use crate::transport::DEFAULT_BAUD_RATE;

fn default_baudrate() -> u32 {
    DEFAULT_BAUD_RATE
}

fn default_ticks_per_turn() -> u32 {
    DEFAULT_TICKS_PER_TURN
}

fn default_speed() -> u16 {
    MotionSettings::default().speed_default
}

fn default_acceleration() -> u8 {
    MotionSettings::default().acceleration_default
}

fn default_speed_min() -> u16 {
    MotionSettings::default().speed_min
}

fn default_speed_max() -> u16 {
    MotionSettings::default().speed_max
}

fn enabled() -> bool {
    true
}

const KNOWN_KEYS: &[&str] = &[
    "port",
    "baudrate",
    "joint_order",
    "motor_ids",
    "ticks_per_turn",
    "gear_ratios",
    "motor_orientations",
    "position_offsets_deg",
    "hack_pos_zero_offsets_deg",
    "home_ticks",
    "home_loops",
    "speed_default",
    "acceleration_default",
    "acc_default",
    "speed_min",
    "speed_max",
    "init_position_mode",
    "disable_limits",
];

#[derive(Debug, Clone, Deserialize)]
pub struct DriverConfig {
    pub port: String,
    #[serde(default = "default_baudrate")]
    pub baudrate: u32,

    pub joint_order: Vec<String>,
    pub motor_ids: Vec<u8>,

    #[serde(default = "default_ticks_per_turn")]
    pub ticks_per_turn: u32,
    #[serde(default)]
    pub gear_ratios: BTreeMap<String, f64>,
    #[serde(default)]
    pub motor_orientations: BTreeMap<String, i64>,
    #[serde(default, alias = "hack_pos_zero_offsets_deg")]
    pub position_offsets_deg: BTreeMap<String, f64>,
    #[serde(default)]
    pub home_ticks: BTreeMap<String, u32>,
    #[serde(default)]
    pub home_loops: BTreeMap<String, i64>,

    #[serde(default = "default_speed")]
    pub speed_default: u16,
    #[serde(default = "default_acceleration", alias = "acc_default")]
    pub acceleration_default: u8,
    #[serde(default = "default_speed_min")]
    pub speed_min: u16,
    #[serde(default = "default_speed_max")]
    pub speed_max: u16,
    #[serde(default = "enabled")]
    pub init_position_mode: bool,
    #[serde(default = "enabled")]
    pub disable_limits: bool,
}

impl DriverConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let table: toml::Table = toml::from_str(text).map_err(|e| ServoError::Config(e.to_string()))?;
        for key in table.keys().filter(|key| !KNOWN_KEYS.contains(&key.as_str())) {
            warn!("Ignoring unknown configuration key '{}'", key);
        }

        let config: Self = toml::Value::Table(table)
            .try_into()
            .map_err(|e: toml::de::Error| ServoError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.joint_order.len() != self.motor_ids.len() {
            return Err(ServoError::Config(format!(
                "joint_order has {} entries but motor_ids has {}",
                self.joint_order.len(),
                self.motor_ids.len()
            )));
        }
        if self.motor_ids.is_empty() {
            return Err(ServoError::Config("no joints configured".into()));
        }

        let mut names = BTreeSet::new();
        for name in &self.joint_order {
            if !names.insert(name.as_str()) {
                return Err(ServoError::Config(format!("joint {name} listed twice")));
            }
        }
        let mut ids = BTreeSet::new();
        for &id in &self.motor_ids {
            if id > MAX_ID {
                return Err(ServoError::Config(format!(
                    "motor id {id} must be between 0 and {MAX_ID}"
                )));
            }
            if !ids.insert(id) {
                return Err(ServoError::Config(format!("motor id {id} listed twice")));
            }
        }

        if self.speed_min > self.speed_max {
            return Err(ServoError::Config(format!(
                "speed_min {} is above speed_max {}",
                self.speed_min, self.speed_max
            )));
        }

        // Surfaces bad keys and out-of-range values early.
        self.kinematics().map(|_| ())
    }

    /// Joint name to servo id, in `joint_order`.
    pub fn joints(&self) -> Vec<(String, u8)> {
        self.joint_order
            .iter()
            .cloned()
            .zip(self.motor_ids.iter().copied())
            .collect()
    }

    pub fn kinematics(&self) -> Result<BTreeMap<u8, ServoKinematics>> {
        let gear_ratios = self.per_id("gear_ratios", &self.gear_ratios)?;
        let orientations = self.per_id("motor_orientations", &self.motor_orientations)?;
        let offsets = self.per_id("position_offsets_deg", &self.position_offsets_deg)?;
        let home_ticks = self.per_id("home_ticks", &self.home_ticks)?;
        let home_loops = self.per_id("home_loops", &self.home_loops)?;

        let mut kinematics = BTreeMap::new();
        for &id in &self.motor_ids {
            let orientation = Orientation::try_from(orientations.get(&id).copied().unwrap_or(1))?;
            let kin = ServoKinematics::new(
                self.ticks_per_turn,
                gear_ratios.get(&id).copied().unwrap_or(1.0),
                orientation,
                offsets.get(&id).copied().unwrap_or(0.0).to_radians(),
                home_ticks.get(&id).copied().unwrap_or(0),
                home_loops.get(&id).copied().unwrap_or(0),
            )
            .map_err(|e| ServoError::Config(format!("servo {id}: {e}")))?;
            kinematics.insert(id, kin);
        }
        Ok(kinematics)
    }

    pub fn motion(&self) -> MotionSettings {
        MotionSettings {
            speed_default: self.speed_default,
            acceleration_default: self.acceleration_default,
            speed_min: self.speed_min,
            speed_max: self.speed_max,
            init_position_mode: self.init_position_mode,
            disable_limits: self.disable_limits,
        }
    }

    fn per_id<V: Copy>(&self, table: &str, values: &BTreeMap<String, V>) -> Result<BTreeMap<u8, V>> {
        values
            .iter()
            .map(|(key, &value)| {
                let id: u8 = key.trim().parse().map_err(|_| {
                    ServoError::Config(format!("{table}: key {key:?} is not a servo id"))
                })?;
                if !self.motor_ids.contains(&id) {
                    return Err(ServoError::Config(format!(
                        "{table}: servo {id} is not in motor_ids"
                    )));
                }
                Ok((id, value))
            })
            .collect()
    }
}
