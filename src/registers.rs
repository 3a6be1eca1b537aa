//! STS3215 control table and protocol constants.

use crate::error::ServoError;

pub const BROADCAST_ID: u8 = 0xFE;
pub const MAX_ID: u8 = 253;

// Instructions
pub const INST_PING: u8 = 0x01;
pub const INST_READ: u8 = 0x02;
pub const INST_WRITE: u8 = 0x03;
pub const INST_SYNC_WRITE: u8 = 0x83;

// EEPROM area, writable only while unlocked
pub const MODEL_NUMBER: u8 = 3;
pub const ID: u8 = 5;
pub const MIN_ANGLE_LIMIT: u8 = 9;
pub const MAX_ANGLE_LIMIT: u8 = 11;
pub const MODE: u8 = 33;

// RAM area
pub const TORQUE_ENABLE: u8 = 40;
pub const ACCELERATION: u8 = 41;
pub const GOAL_POSITION: u8 = 42;
pub const GOAL_SPEED: u8 = 46;
pub const LOCK: u8 = 55;
pub const PRESENT_POSITION: u8 = 56;

/// Writing this to `TORQUE_ENABLE` makes the servo adopt its current
/// position as mid scale.
pub const DEFINE_MIDDLE: u8 = 128;

/// Length of the acceleration/position/time/speed block starting at
/// `ACCELERATION`.
pub const GOAL_BLOCK_LEN: usize = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatingMode {
    Position = 0,
    Wheel = 1,
    Pwm = 2,
    Step = 3,
}

impl From<OperatingMode> for u8 {
    fn from(mode: OperatingMode) -> u8 {
        mode as u8
    }
}

impl TryFrom<u8> for OperatingMode {
    type Error = ServoError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(OperatingMode::Position),
            1 => Ok(OperatingMode::Wheel),
            2 => Ok(OperatingMode::Pwm),
            3 => Ok(OperatingMode::Step),
            other => Err(ServoError::InvalidArgument(format!(
                "unknown operating mode {other}"
            ))),
        }
    }
}

/// Which end of the travel range a limit applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Limit {
    Min,
    Max,
}

impl Limit {
    pub fn register(self) -> u8 {
        match self {
            Limit::Min => MIN_ANGLE_LIMIT,
            Limit::Max => MAX_ANGLE_LIMIT,
        }
    }
}

/// One goal as written to the servo: position, speed and acceleration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GoalCommand {
    pub position: u16,
    pub speed: u16,
    pub acceleration: u8,
}

impl GoalCommand {
    pub fn to_block(self) -> [u8; GOAL_BLOCK_LEN] {
        let [pos_lo, pos_hi] = self.position.to_le_bytes();
        let [speed_lo, speed_hi] = self.speed.to_le_bytes();
        [self.acceleration, pos_lo, pos_hi, 0, 0, speed_lo, speed_hi]
    }
}
