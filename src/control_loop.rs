use log::{error, warn};
use std::collections::HashMap;
use std::thread::JoinHandle;
use std::time::Duration;

use tokio::{
    sync::mpsc::{self, Sender},
    time,
};

use crate::bus::ServoBus;
use crate::driver::ServoArmDriver;
use crate::error::Result;

use std::sync::{Arc, Mutex};

const COMMAND_QUEUE_LEN: usize = 100;

#[derive(Debug, Clone, PartialEq)]
pub struct LastPosition {
    /// Joint angles in radians.
    pub positions: HashMap<String, f64>,
    pub timestamp: f64, // seconds since UNIX epoch
}

#[derive(Debug, Clone)]
pub enum JointCommand {
    SetJointGoals { goals: HashMap<String, f64> },
    EnableTorque(),
    DisableTorque(),
    Shutdown,
}

/// Background loop that applies joint commands and polls positions at a
/// fixed period.
pub struct ServoControlLoop {
    tx: Option<Sender<JointCommand>>,
    last_position: Arc<Mutex<std::result::Result<LastPosition, String>>>,
    handle: Option<JoinHandle<()>>,
}

impl ServoControlLoop {
    pub fn new<B: ServoBus + 'static>(
        driver: ServoArmDriver<B>,
        read_period: Duration,
        retries: u64,
    ) -> Result<Self> {
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE_LEN);
        let last_position = Arc::new(Mutex::new(Err("Not read yet".to_string())));
        let last_position_clone = last_position.clone();

        let handle = std::thread::Builder::new()
            .name("servo-control-loop".into())
            .spawn(move || {
                run(driver, rx, last_position_clone, read_period, retries);
            })?;

        Ok(ServoControlLoop {
            tx: Some(tx),
            last_position,
            handle: Some(handle),
        })
    }

    /// Queue a command. Must not be called from inside an async context.
    pub fn push_command(
        &self,
        command: JointCommand,
    ) -> std::result::Result<(), mpsc::error::SendError<JointCommand>> {
        match &self.tx {
            Some(tx) => tx.blocking_send(command),
            None => Err(mpsc::error::SendError(command)),
        }
    }

    pub fn get_last_position(&self) -> std::result::Result<LastPosition, String> {
        match &*self
            .last_position
            .lock()
            .map_err(|_| "Failed to lock last position".to_string())?
        {
            Ok(pos) => Ok(pos.clone()),
            Err(e) => Err(e.clone()),
        }
    }

    /// Stop the loop and wait for the servos to be released.
    pub fn stop(mut self) {
        self.stop_and_join();
    }

    fn stop_and_join(&mut self) {
        // Closing the channel ends the loop once queued commands are applied.
        self.tx = None;
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("Control loop thread panicked");
            }
        }
    }
}

impl Drop for ServoControlLoop {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}

fn run<B: ServoBus + 'static>(
    mut driver: ServoArmDriver<B>,
    mut rx: mpsc::Receiver<JointCommand>,
    last_position: Arc<Mutex<std::result::Result<LastPosition, String>>>,
    read_period: Duration,
    retries: u64,
) {
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to start control loop runtime: {}", e);
            if let Ok(mut pos) = last_position.lock() {
                *pos = Err(e.to_string());
            }
            driver.shutdown();
            return;
        }
    };

    runtime.block_on(async {
        let mut interval = time::interval(read_period);
        let mut error_count = 0;

        loop {
            tokio::select! {
                maybe_command = rx.recv() => {
                    match maybe_command {
                        Some(JointCommand::Shutdown) | None => break,
                        Some(command) => {
                            if let Err(e) = handle_command(&driver, command) {
                                warn!("Command failed: {}", e);
                            }
                        }
                    }
                }
                _ = interval.tick() => {
                    let failure = match driver.read_all_joint_positions() {
                        Ok(readings) => {
                            let stale: Vec<&String> = readings
                                .iter()
                                .filter(|(_, reading)| reading.stale)
                                .map(|(name, _)| name)
                                .collect();
                            if stale.is_empty() {
                                error_count = 0;
                                let now = std::time::SystemTime::now()
                                    .duration_since(std::time::UNIX_EPOCH)
                                    .unwrap_or_else(|_| std::time::Duration::from_secs(0));
                                let last = LastPosition {
                                    positions: readings
                                        .iter()
                                        .map(|(name, reading)| (name.clone(), reading.radians))
                                        .collect(),
                                    timestamp: now.as_secs_f64(),
                                };
                                if let Ok(mut pos) = last_position.lock() {
                                    *pos = Ok(last);
                                }
                                None
                            } else {
                                Some(format!("no fresh reading for {:?}", stale))
                            }
                        }
                        Err(e) => Some(e.to_string()),
                    };

                    if let Some(e) = failure {
                        error_count += 1;
                        if error_count < retries {
                            warn!("Failed to read positions ({}). Retry {}/{}", e, error_count, retries);
                        } else {
                            error!("Failed to read positions after {} retries: {}", retries, e);
                            if let Ok(mut pos) = last_position.lock() {
                                *pos = Err(e);
                            }
                        }
                    }
                }
            }
        }
    });

    driver.shutdown();
}

fn handle_command<B: ServoBus + 'static>(
    driver: &ServoArmDriver<B>,
    command: JointCommand,
) -> Result<()> {
    use JointCommand::*;

    match command {
        SetJointGoals { goals } => driver.send_joint_goals(&goals),
        EnableTorque() => driver.set_torque(true),
        DisableTorque() => driver.set_torque(false),
        Shutdown => Ok(()),
    }
}
