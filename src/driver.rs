use std::collections::{BTreeMap, HashMap};

use log::info;

use crate::bus::{ServoBus, StsBus};
use crate::config::DriverConfig;
use crate::controller::{AngleReading, MultiServoController};
use crate::error::{Result, ServoError};
use crate::procedures::{Outcome, Procedure};
use crate::transport::SerialTransport;

/// Joint-name front end over [`MultiServoController`].
pub struct ServoArmDriver<B: ServoBus + 'static> {
    joints: BTreeMap<String, u8>,
    joint_order: Vec<String>,
    controller: MultiServoController<B>,
}

impl ServoArmDriver<StsBus<SerialTransport>> {
    /// Open the configured serial port and start the controller.
    pub fn open(config: &DriverConfig) -> Result<Self> {
        let bus = StsBus::open(&config.port, config.baudrate)?;
        let driver = Self::with_bus(config, bus)?;
        info!("Servo driver initialised on {} @ {}", config.port, config.baudrate);
        Ok(driver)
    }
}

impl<B: ServoBus + 'static> ServoArmDriver<B> {
    pub fn with_bus(config: &DriverConfig, bus: B) -> Result<Self> {
        config.validate()?;
        let controller = MultiServoController::new(bus, config.kinematics()?, config.motion())?;

        Ok(Self {
            joints: config.joints().into_iter().collect(),
            joint_order: config.joint_order.clone(),
            controller,
        })
    }

    pub fn joint_names(&self) -> &[String] {
        &self.joint_order
    }

    pub fn controller(&self) -> &MultiServoController<B> {
        &self.controller
    }

    pub fn servo_id(&self, joint: &str) -> Result<u8> {
        self.joints
            .get(joint)
            .copied()
            .ok_or_else(|| ServoError::InvalidArgument(format!("unknown joint name '{joint}'")))
    }

    /// Current angle of each named joint, in radians.
    pub fn read_joint_positions<S: AsRef<str>>(
        &self,
        joints: &[S],
    ) -> Result<HashMap<String, AngleReading>> {
        let ids = joints
            .iter()
            .map(|joint| self.servo_id(joint.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        let readings = self.controller.read_angles(&ids)?;

        Ok(joints
            .iter()
            .zip(ids)
            .filter_map(|(joint, id)| {
                readings
                    .get(&id)
                    .map(|reading| (joint.as_ref().to_string(), *reading))
            })
            .collect())
    }

    /// Angles of every configured joint.
    pub fn read_all_joint_positions(&self) -> Result<HashMap<String, AngleReading>> {
        self.read_joint_positions(&self.joint_order)
    }

    /// Queue goal angles (radians) by joint name. Unknown names reject the
    /// whole command.
    pub fn send_joint_goals(&self, goals: &HashMap<String, f64>) -> Result<()> {
        let goals = goals
            .iter()
            .map(|(joint, &angle)| self.servo_id(joint).map(|id| (id, angle)))
            .collect::<Result<Vec<_>>>()?;
        self.controller.set_goals(goals)
    }

    pub fn run_configuration_procedure(&self, procedure: Procedure) -> Result<Outcome> {
        self.controller.run_procedure(procedure)
    }

    pub fn set_torque(&self, enable: bool) -> Result<()> {
        self.controller.set_torque(enable)
    }

    pub fn shutdown(&mut self) {
        self.controller.shutdown();
        info!("Servo driver shutdown complete");
    }
}
