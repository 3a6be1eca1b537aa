//! Driver for Feetech STS/SCS serial-bus servos.
//!
//! Layers, bottom up: [`transport`] moves bytes, [`protocol`] frames
//! instruction and status packets, [`procedures`] runs EEPROM configuration
//! sequences, [`controller`] keeps one worker thread per servo and
//! [`driver`] maps joint names onto servo ids.

pub mod bus;
pub mod config;
pub mod control_loop;
pub mod controller;
pub mod driver;
pub mod error;
pub mod kinematics;
pub mod procedures;
pub mod protocol;
pub mod registers;
pub mod transport;

#[cfg(feature = "python")]
mod bindings;

pub use bus::{ServoBus, SimulatedBus, StsBus};
pub use config::DriverConfig;
pub use control_loop::{JointCommand, LastPosition, ServoControlLoop};
pub use controller::{AngleReading, MotionSettings, MultiServoController};
pub use driver::ServoArmDriver;
pub use error::{CommResult, DeviceStatus, Result, ServoError};
pub use kinematics::{Orientation, ServoKinematics};
pub use procedures::{Outcome, Procedure};
pub use registers::{Limit, OperatingMode};
