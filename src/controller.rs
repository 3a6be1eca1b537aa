use std::collections::BTreeMap;
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, info, warn};

use crate::bus::ServoBus;
use crate::error::{Result, ServoError};
use crate::kinematics::ServoKinematics;
use crate::procedures::{Outcome, Procedure};
use crate::registers::{GoalCommand, Limit, MAX_ID, OperatingMode, TORQUE_ENABLE};

// Worker timing
const WAKE_TIMEOUT_MS: u64 = 250;
const MAX_RETRIES: u8 = 3;
const RETRY_DELAY_MS: u64 = 5;

/// Goals within this many wire ticks of the last sent one are not resent.
const GOAL_TOLERANCE_TICKS: i32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MotionSettings {
    pub speed_default: u16,
    pub acceleration_default: u8,
    pub speed_min: u16,
    pub speed_max: u16,
    /// Switch every servo to position mode at startup.
    pub init_position_mode: bool,
    /// Clear both angle limits at startup so servos can turn freely.
    pub disable_limits: bool,
}

impl Default for MotionSettings {
    fn default() -> Self {
        Self {
            speed_default: 133,
            acceleration_default: 50,
            speed_min: 1,
            speed_max: 4095,
            init_position_mode: true,
            disable_limits: true,
        }
    }
}

impl MotionSettings {
    pub fn goal_speed(&self) -> u16 {
        self.speed_default.max(self.speed_min).min(self.speed_max)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    GoalPending,
    Sending,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AngleReading {
    pub radians: f64,
    /// The bus read failed; `radians` is the last known position.
    pub stale: bool,
}

#[derive(Debug)]
struct ServoState {
    previous_raw_ticks: u16,
    loop_count: i64,
    pending_goal_ticks: Option<i64>,
    last_sent_ticks: Option<u16>,
    wake_requested: bool,
    phase: Phase,
}

impl ServoState {
    /// Track whole turns: a jump of more than half a turn between two
    /// readings is taken as a wrap through zero.
    fn observe(&mut self, raw: u16, ticks_per_turn: u32) {
        let raw = (raw as u32 % ticks_per_turn) as u16;
        let half = ticks_per_turn as i64 / 2;
        let delta = raw as i64 - self.previous_raw_ticks as i64;
        if delta > half {
            self.loop_count -= 1;
        } else if delta < -half {
            self.loop_count += 1;
        }
        self.previous_raw_ticks = raw;
    }

    fn total_ticks(&self, ticks_per_turn: u32) -> i64 {
        self.loop_count * ticks_per_turn as i64 + self.previous_raw_ticks as i64
    }
}

struct ServoSlot {
    id: u8,
    kinematics: ServoKinematics,
    state: Mutex<ServoState>,
    wake: Condvar,
}

impl ServoSlot {
    fn lock(&self) -> MutexGuard<'_, ServoState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn lock_bus<B>(bus: &Mutex<B>) -> MutexGuard<'_, B> {
    bus.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Goals go out as 16 bits; anything wider is truncated.
fn wire_position(total_ticks: i64) -> u16 {
    (total_ticks & 0xFFFF) as u16
}

fn needs_send(goal_ticks: i64, last_sent: Option<u16>) -> bool {
    match last_sent {
        None => true,
        Some(previous) => {
            let distance = wire_position(goal_ticks).wrapping_sub(previous) as i16;
            (distance as i32).abs() > GOAL_TOLERANCE_TICKS
        }
    }
}

/// Drives several servos sharing one bus.
///
/// Each servo gets its own worker thread that writes goals as they change.
/// Reads and configuration procedures run on the calling thread. All of them
/// go through a single bus lock; per-servo bookkeeping has its own lock so
/// unrelated servos never wait on each other except for the bus itself.
pub struct MultiServoController<B: ServoBus + 'static> {
    bus: Arc<Mutex<B>>,
    slots: BTreeMap<u8, Arc<ServoSlot>>,
    stop: Arc<AtomicBool>,
    workers: Vec<JoinHandle<()>>,
    motion: MotionSettings,
    closed: bool,
}

impl<B: ServoBus + 'static> MultiServoController<B> {
    pub fn new(
        mut bus: B,
        kinematics: BTreeMap<u8, ServoKinematics>,
        motion: MotionSettings,
    ) -> Result<Self> {
        if kinematics.is_empty() {
            return Err(ServoError::InvalidArgument("no servos configured".into()));
        }

        let mut slots = BTreeMap::new();
        for (&id, &kin) in &kinematics {
            if id > MAX_ID {
                return Err(ServoError::InvalidArgument(format!(
                    "servo id {id} must be between 0 and {MAX_ID}"
                )));
            }

            if motion.init_position_mode {
                log_setup_step(
                    id,
                    bus.run_procedure(Procedure::ChangeMode {
                        id,
                        mode: OperatingMode::Position,
                    }),
                );
            }
            if motion.disable_limits {
                for limit in [Limit::Max, Limit::Min] {
                    log_setup_step(
                        id,
                        bus.run_procedure(Procedure::ChangeLimit { id, limit, value: 0 }),
                    );
                }
            }

            let raw = read_with_retries(&mut bus, id)?;
            let mut state = ServoState {
                previous_raw_ticks: 0,
                loop_count: kin.home_loops(),
                pending_goal_ticks: None,
                last_sent_ticks: None,
                wake_requested: false,
                phase: Phase::Idle,
            };
            state.previous_raw_ticks = (raw as u32 % kin.ticks_per_turn()) as u16;
            state.pending_goal_ticks = Some(state.total_ticks(kin.ticks_per_turn()));
            debug!(
                "Servo {} starts at raw {} (total {:?})",
                id, raw, state.pending_goal_ticks
            );

            slots.insert(
                id,
                Arc::new(ServoSlot {
                    id,
                    kinematics: kin,
                    state: Mutex::new(state),
                    wake: Condvar::new(),
                }),
            );
        }

        let mut controller = Self {
            bus: Arc::new(Mutex::new(bus)),
            slots,
            stop: Arc::new(AtomicBool::new(false)),
            workers: Vec::new(),
            motion,
            closed: false,
        };

        let slots: Vec<Arc<ServoSlot>> = controller.slots.values().cloned().collect();
        for slot in slots {
            let worker = Worker {
                slot,
                bus: controller.bus.clone(),
                stop: controller.stop.clone(),
                speed: motion.goal_speed(),
                acceleration: motion.acceleration_default,
            };
            // On error the partially started controller is dropped, which
            // joins the workers already running.
            let handle = thread::Builder::new()
                .name(format!("servo-{}", worker.slot.id))
                .spawn(move || worker.run())?;
            controller.workers.push(handle);
        }

        info!("Controller started for servos {:?}", controller.ids());
        Ok(controller)
    }

    pub fn ids(&self) -> Vec<u8> {
        self.slots.keys().copied().collect()
    }

    pub fn motion(&self) -> &MotionSettings {
        &self.motion
    }

    pub fn kinematics(&self, id: u8) -> Option<&ServoKinematics> {
        self.slots.get(&id).map(|slot| &slot.kinematics)
    }

    fn slot(&self, id: u8) -> Result<&Arc<ServoSlot>> {
        self.slots
            .get(&id)
            .ok_or_else(|| ServoError::InvalidArgument(format!("servo {id} is not managed")))
    }

    /// Record a new goal for one servo and wake its worker. Never touches the bus.
    pub fn set_goal(&self, id: u8, angle_rad: f64) -> Result<()> {
        let slot = self.slot(id)?;
        if !angle_rad.is_finite() {
            return Err(ServoError::InvalidArgument(format!(
                "goal for servo {id} is not finite"
            )));
        }
        store_goal(slot, angle_rad);
        Ok(())
    }

    /// Set several goals at once. Nothing is applied unless every id is known.
    pub fn set_goals(&self, goals: impl IntoIterator<Item = (u8, f64)>) -> Result<()> {
        let goals = goals
            .into_iter()
            .map(|(id, angle)| {
                if angle.is_finite() {
                    self.slot(id).map(|slot| (slot, angle))
                } else {
                    Err(ServoError::InvalidArgument(format!(
                        "goal for servo {id} is not finite"
                    )))
                }
            })
            .collect::<Result<Vec<_>>>()?;

        for (slot, angle) in goals {
            store_goal(slot, angle);
        }
        Ok(())
    }

    /// Read the joint angle of each servo in `ids`, one bus exchange each.
    pub fn read_angles(&self, ids: &[u8]) -> Result<BTreeMap<u8, AngleReading>> {
        let slots = ids
            .iter()
            .map(|&id| self.slot(id))
            .collect::<Result<Vec<_>>>()?;

        let mut readings = BTreeMap::new();
        for slot in slots {
            let reading = lock_bus(&self.bus).read_position(slot.id);

            let ticks_per_turn = slot.kinematics.ticks_per_turn();
            let mut state = slot.lock();
            let stale = match reading {
                Ok(raw) => {
                    state.observe(raw, ticks_per_turn);
                    false
                }
                Err(e) => {
                    warn!("Failed to read servo {} ({}), keeping last position", slot.id, e);
                    true
                }
            };
            let radians = slot
                .kinematics
                .ticks_to_angle(state.total_ticks(ticks_per_turn) as f64);
            readings.insert(slot.id, AngleReading { radians, stale });
        }
        Ok(readings)
    }

    /// Run a configuration procedure with the bus held for its whole duration.
    ///
    /// Managed servos keep their ids for the controller's lifetime, so an id
    /// change from or onto one of them is refused.
    pub fn run_procedure(&self, procedure: Procedure) -> Result<Outcome> {
        if let Procedure::ChangeId { old_id, new_id } = procedure {
            if let Some(id) = [old_id, new_id].into_iter().find(|id| self.slots.contains_key(id)) {
                return Err(ServoError::InvalidArgument(format!(
                    "servo {id} is managed by this controller, its id cannot change"
                )));
            }
        }
        lock_bus(&self.bus).run_procedure(procedure)
    }

    pub fn scan(&self, ids: RangeInclusive<u8>) -> Vec<(u8, u16)> {
        lock_bus(&self.bus).scan(ids)
    }

    /// Enable or disable torque on every managed servo with one sync write.
    pub fn set_torque(&self, enable: bool) -> Result<()> {
        let targets: BTreeMap<u8, Vec<u8>> = self
            .slots
            .keys()
            .map(|&id| (id, vec![u8::from(enable)]))
            .collect();
        lock_bus(&self.bus).sync_write(TORQUE_ENABLE, &targets)
    }

    pub fn loop_count(&self, id: u8) -> Option<i64> {
        self.slots.get(&id).map(|slot| slot.lock().loop_count)
    }

    pub fn phase(&self, id: u8) -> Option<Phase> {
        self.slots.get(&id).map(|slot| slot.lock().phase)
    }

    pub fn last_sent_ticks(&self, id: u8) -> Option<u16> {
        self.slots.get(&id).and_then(|slot| slot.lock().last_sent_ticks)
    }

    /// Stop every worker and close the bus. Safe to call more than once.
    pub fn shutdown(&mut self) {
        if self.closed {
            return;
        }
        self.stop.store(true, Ordering::SeqCst);
        for slot in self.slots.values() {
            slot.lock().wake_requested = true;
            slot.wake.notify_all();
        }
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                error!("A servo worker panicked");
            }
        }
        lock_bus(&self.bus).close();
        self.closed = true;
        info!("Controller shut down");
    }
}

impl<B: ServoBus + 'static> Drop for MultiServoController<B> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn store_goal(slot: &ServoSlot, angle_rad: f64) {
    let goal = slot.kinematics.angle_to_ticks(angle_rad).round() as i64;
    {
        let mut state = slot.lock();
        state.pending_goal_ticks = Some(goal);
        state.wake_requested = true;
        state.phase = Phase::GoalPending;
    }
    slot.wake.notify_one();
}

fn log_setup_step(id: u8, result: Result<Outcome>) {
    match result {
        Ok(Outcome::Applied) => {}
        Ok(Outcome::PartialSuccess { warning }) => {
            warn!("Setup of servo {} applied with warning: {}", id, warning)
        }
        Err(e) => warn!("Setup of servo {} failed: {}", id, e),
    }
}

fn read_with_retries<B: ServoBus>(bus: &mut B, id: u8) -> Result<u16> {
    let mut retries = 0;
    loop {
        match bus.read_position(id) {
            Ok(raw) => return Ok(raw),
            Err(e) if e.is_transient() && retries < MAX_RETRIES => {
                debug!("Initial read of servo {} failed ({}), retrying", id, e);
                retries += 1;
                thread::sleep(Duration::from_millis(RETRY_DELAY_MS));
            }
            Err(e) => {
                error!("Servo {} not responding after {} retries: {}", id, retries, e);
                return Err(e);
            }
        }
    }
}

struct Worker<B> {
    slot: Arc<ServoSlot>,
    bus: Arc<Mutex<B>>,
    stop: Arc<AtomicBool>,
    speed: u16,
    acceleration: u8,
}

impl<B: ServoBus> Worker<B> {
    fn run(self) {
        let id = self.slot.id;
        debug!("Worker for servo {} started", id);

        while let Some(goal) = self.next_goal() {
            let command = GoalCommand {
                position: wire_position(goal),
                speed: self.speed,
                acceleration: self.acceleration,
            };
            let result = lock_bus(&self.bus).write_goal(id, command);

            let mut state = self.slot.lock();
            match result {
                Ok(()) => state.last_sent_ticks = Some(command.position),
                // Left unsent; the next wake for this servo tries again.
                Err(e) => warn!("Goal write to servo {} failed: {}", id, e),
            }
            state.phase = if state.wake_requested {
                Phase::GoalPending
            } else {
                Phase::Idle
            };
        }

        debug!("Worker for servo {} stopped", id);
    }

    /// Block until there is a goal worth sending. `None` once stopping.
    fn next_goal(&self) -> Option<i64> {
        let mut state = self.slot.lock();
        loop {
            if self.stop.load(Ordering::SeqCst) {
                return None;
            }
            if !state.wake_requested {
                state = self
                    .slot
                    .wake
                    .wait_timeout(state, Duration::from_millis(WAKE_TIMEOUT_MS))
                    .unwrap_or_else(PoisonError::into_inner)
                    .0;
                if self.stop.load(Ordering::SeqCst) {
                    return None;
                }
                if !state.wake_requested {
                    continue;
                }
            }

            state.wake_requested = false;
            let pending = state.pending_goal_ticks;
            match pending {
                Some(goal) if needs_send(goal, state.last_sent_ticks) => {
                    state.phase = Phase::Sending;
                    return Some(goal);
                }
                _ => state.phase = Phase::Idle,
            }
        }
    }
}
