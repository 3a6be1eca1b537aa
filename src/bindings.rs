use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use pyo3::exceptions::{PyRuntimeError, PyValueError};
use pyo3::prelude::*;
use pyo3_stub_gen::{
    define_stub_info_gatherer,
    derive::{gen_stub_pyclass, gen_stub_pymethods},
};

use crate::bus::StsBus;
use crate::config::DriverConfig;
use crate::control_loop::{JointCommand, ServoControlLoop};
use crate::driver::ServoArmDriver;
use crate::procedures::{Outcome, Procedure};
use crate::registers::{Limit, OperatingMode};
use crate::transport::SerialTransport;

type Driver = ServoArmDriver<StsBus<SerialTransport>>;

fn runtime_err(e: impl ToString) -> PyErr {
    PyRuntimeError::new_err(e.to_string())
}

fn warning_text(outcome: Outcome) -> Option<String> {
    outcome.warning().map(|w| w.to_string())
}

fn open_driver(config_path: &str) -> PyResult<Driver> {
    let config = DriverConfig::load(config_path).map_err(runtime_err)?;
    Driver::open(&config).map_err(runtime_err)
}

#[gen_stub_pyclass]
#[pyclass(frozen)]
struct ServoArm {
    inner: Mutex<Driver>,
}

impl ServoArm {
    fn with_driver<R>(&self, f: impl FnOnce(&mut Driver) -> crate::Result<R>) -> PyResult<R> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| PyRuntimeError::new_err("Failed to lock servo driver"))?;
        f(&mut inner).map_err(runtime_err)
    }

    fn procedure(&self, procedure: Procedure) -> PyResult<Option<String>> {
        self.with_driver(|driver| driver.run_configuration_procedure(procedure))
            .map(warning_text)
    }
}

#[gen_stub_pymethods]
#[pymethods]
impl ServoArm {
    #[new]
    fn new(config_path: String) -> PyResult<Self> {
        Ok(ServoArm {
            inner: Mutex::new(open_driver(&config_path)?),
        })
    }

    fn joint_names(&self) -> PyResult<Vec<String>> {
        self.with_driver(|driver| Ok(driver.joint_names().to_vec()))
    }

    fn read_joint_positions(&self, joints: Vec<String>) -> PyResult<HashMap<String, f64>> {
        self.with_driver(|driver| driver.read_joint_positions(&joints))
            .map(|readings| {
                readings
                    .into_iter()
                    .map(|(name, reading)| (name, reading.radians))
                    .collect()
            })
    }

    fn read_all_joint_positions(&self) -> PyResult<HashMap<String, f64>> {
        self.with_driver(|driver| driver.read_all_joint_positions())
            .map(|readings| {
                readings
                    .into_iter()
                    .map(|(name, reading)| (name, reading.radians))
                    .collect()
            })
    }

    fn send_joint_goals(&self, goals: HashMap<String, f64>) -> PyResult<()> {
        self.with_driver(|driver| driver.send_joint_goals(&goals))
    }

    fn enable_torque(&self) -> PyResult<()> {
        self.with_driver(|driver| driver.set_torque(true))
    }

    fn disable_torque(&self) -> PyResult<()> {
        self.with_driver(|driver| driver.set_torque(false))
    }

    fn scan(&self, first: u8, last: u8) -> PyResult<Vec<(u8, u16)>> {
        self.with_driver(|driver| Ok(driver.controller().scan(first..=last)))
    }

    /// Returns a warning when the id changed but re-locking failed.
    fn change_id(&self, old_id: u8, new_id: u8) -> PyResult<Option<String>> {
        self.procedure(Procedure::ChangeId { old_id, new_id })
    }

    fn change_mode(&self, id: u8, mode: u8) -> PyResult<Option<String>> {
        let mode = OperatingMode::try_from(mode).map_err(|e| PyValueError::new_err(e.to_string()))?;
        self.procedure(Procedure::ChangeMode { id, mode })
    }

    /// `limit` is "min" or "max".
    fn change_limit(&self, id: u8, limit: String, value: u16) -> PyResult<Option<String>> {
        let limit = match limit.as_str() {
            "min" => Limit::Min,
            "max" => Limit::Max,
            other => {
                return Err(PyValueError::new_err(format!(
                    "limit must be 'min' or 'max', got '{other}'"
                )));
            }
        };
        self.procedure(Procedure::ChangeLimit { id, limit, value })
    }

    fn define_middle(&self, id: u8) -> PyResult<Option<String>> {
        self.procedure(Procedure::DefineMiddle { id })
    }

    fn shutdown(&self) -> PyResult<()> {
        self.with_driver(|driver| {
            driver.shutdown();
            Ok(())
        })
    }
}

#[gen_stub_pyclass]
#[pyclass(frozen, name = "LastPosition")]
#[derive(Debug, Clone)]
struct PyLastPosition {
    #[pyo3(get)]
    positions: HashMap<String, f64>,
    #[pyo3(get)]
    timestamp: f64,
}

#[gen_stub_pyclass]
#[pyclass(frozen)]
struct ServoArmControlLoop {
    inner: Mutex<Option<ServoControlLoop>>,
}

impl ServoArmControlLoop {
    fn push(&self, command: JointCommand) -> PyResult<()> {
        let inner = self
            .inner
            .lock()
            .map_err(|_| PyRuntimeError::new_err("Failed to lock control loop"))?;
        match inner.as_ref() {
            Some(control_loop) => control_loop.push_command(command).map_err(runtime_err),
            None => Err(PyRuntimeError::new_err("Control loop is stopped")),
        }
    }
}

#[gen_stub_pymethods]
#[pymethods]
impl ServoArmControlLoop {
    #[new]
    fn new(config_path: String, freq: f64, retries: u64) -> PyResult<Self> {
        if !(freq > 0.0) {
            return Err(PyValueError::new_err("freq must be positive"));
        }
        let driver = open_driver(&config_path)?;
        let control_loop =
            ServoControlLoop::new(driver, Duration::from_secs_f64(1.0 / freq), retries)
                .map_err(runtime_err)?;
        Ok(ServoArmControlLoop {
            inner: Mutex::new(Some(control_loop)),
        })
    }

    fn get_last_position(&self) -> PyResult<PyLastPosition> {
        let inner = self
            .inner
            .lock()
            .map_err(|_| PyRuntimeError::new_err("Failed to lock control loop"))?;
        let control_loop = inner
            .as_ref()
            .ok_or_else(|| PyRuntimeError::new_err("Control loop is stopped"))?;
        let last = control_loop.get_last_position().map_err(runtime_err)?;
        Ok(PyLastPosition {
            positions: last.positions,
            timestamp: last.timestamp,
        })
    }

    fn send_joint_goals(&self, goals: HashMap<String, f64>) -> PyResult<()> {
        self.push(JointCommand::SetJointGoals { goals })
    }

    fn enable_torque(&self) -> PyResult<()> {
        self.push(JointCommand::EnableTorque())
    }

    fn disable_torque(&self) -> PyResult<()> {
        self.push(JointCommand::DisableTorque())
    }

    fn stop(&self) -> PyResult<()> {
        let control_loop = self
            .inner
            .lock()
            .map_err(|_| PyRuntimeError::new_err("Failed to lock control loop"))?
            .take();
        if let Some(control_loop) = control_loop {
            control_loop.stop();
        }
        Ok(())
    }
}

#[pyo3::pymodule]
fn stservo_controller(m: &Bound<'_, PyModule>) -> PyResult<()> {
    pyo3_log::init();

    m.add_class::<ServoArm>()?;
    m.add_class::<ServoArmControlLoop>()?;
    m.add_class::<PyLastPosition>()?;

    Ok(())
}

define_stub_info_gatherer!(stub_info);
