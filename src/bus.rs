use std::collections::BTreeMap;
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use log::debug;

use crate::error::{CommResult, Result, ServoError};
use crate::procedures::{Outcome, Procedure};
use crate::protocol::PacketHandler;
use crate::registers::{
    self, ACCELERATION, BROADCAST_ID, DEFINE_MIDDLE, GoalCommand, MAX_ID,
};
use crate::transport::{SerialTransport, Transport};

/// What the controller needs from a chain of servos.
///
/// Every call is one complete bus exchange (or one complete configuration
/// procedure); callers serialize access.
pub trait ServoBus: Send {
    /// Model number of the servo at `id`.
    fn ping(&mut self, id: u8) -> Result<u16>;

    /// Raw position within one turn.
    fn read_position(&mut self, id: u8) -> Result<u16>;

    fn write_goal(&mut self, id: u8, goal: GoalCommand) -> Result<()>;

    /// Same register block on several servos in one frame, no replies.
    fn sync_write(&mut self, address: u8, targets: &BTreeMap<u8, Vec<u8>>) -> Result<()>;

    fn run_procedure(&mut self, procedure: Procedure) -> Result<Outcome>;

    fn scan(&mut self, ids: RangeInclusive<u8>) -> Vec<(u8, u16)>;

    fn close(&mut self);
}

/// Servos on a real (or scripted) byte transport.
pub struct StsBus<T: Transport> {
    handler: PacketHandler<T>,
}

impl StsBus<SerialTransport> {
    pub fn open(port_name: &str, baud_rate: u32) -> Result<Self> {
        Ok(Self::new(PacketHandler::new(SerialTransport::open(
            port_name, baud_rate,
        )?)))
    }
}

impl<T: Transport> StsBus<T> {
    pub fn new(handler: PacketHandler<T>) -> Self {
        Self { handler }
    }
}

impl<T: Transport> ServoBus for StsBus<T> {
    fn ping(&mut self, id: u8) -> Result<u16> {
        self.handler.ping(id).into_result(id)
    }

    fn read_position(&mut self, id: u8) -> Result<u16> {
        self.handler
            .read_u16(id, registers::PRESENT_POSITION)
            .into_result(id)
    }

    fn write_goal(&mut self, id: u8, goal: GoalCommand) -> Result<()> {
        self.handler
            .write(id, ACCELERATION, &goal.to_block())
            .into_result(id)
    }

    fn sync_write(&mut self, address: u8, targets: &BTreeMap<u8, Vec<u8>>) -> Result<()> {
        match self.handler.group_write(address, targets) {
            CommResult::Success => Ok(()),
            result => Err(ServoError::Communication {
                id: BROADCAST_ID,
                result,
            }),
        }
    }

    fn run_procedure(&mut self, procedure: Procedure) -> Result<Outcome> {
        procedure.run(&mut self.handler)
    }

    fn scan(&mut self, ids: RangeInclusive<u8>) -> Vec<(u8, u16)> {
        self.handler.scan(ids)
    }

    fn close(&mut self) {
        self.handler.close();
    }
}

const SIM_TICKS_PER_TURN: u16 = 4096;
const SIM_REGISTER_COUNT: usize = 128;
pub const SIM_MODEL_NUMBER: u16 = 777;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusOp {
    Ping,
    Read,
    Write,
    SyncWrite,
    Procedure,
}

/// One completed exchange on the simulated bus.
#[derive(Debug, Clone)]
pub struct BusAccess {
    pub id: u8,
    pub op: BusOp,
    pub started: Instant,
    pub finished: Instant,
}

struct SimState {
    servos: BTreeMap<u8, Vec<u8>>,
    log: Vec<BusAccess>,
    latency: Duration,
    failing_reads: BTreeMap<u8, usize>,
    failing_writes: BTreeMap<u8, usize>,
    closed: bool,
}

/// In-memory servos that share one register table each.
///
/// Clones share state, so a test can keep a handle while the controller owns
/// another. Every exchange takes `latency` and is recorded; exchanges that
/// overlap in time are counted.
#[derive(Clone)]
pub struct SimulatedBus {
    state: Arc<Mutex<SimState>>,
    in_flight: Arc<AtomicUsize>,
    overlaps: Arc<AtomicUsize>,
}

impl Default for SimulatedBus {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedBus {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState {
                servos: BTreeMap::new(),
                log: Vec::new(),
                latency: Duration::ZERO,
                failing_reads: BTreeMap::new(),
                failing_writes: BTreeMap::new(),
                closed: false,
            })),
            in_flight: Arc::new(AtomicUsize::new(0)),
            overlaps: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_latency(self, latency: Duration) -> Self {
        self.state().latency = latency;
        self
    }

    pub fn with_servo(self, id: u8, position: u16) -> Self {
        self.add_servo(id, position);
        self
    }

    pub fn add_servo(&self, id: u8, position: u16) {
        let mut table = vec![0u8; SIM_REGISTER_COUNT];
        put(&mut table, registers::MODEL_NUMBER, &SIM_MODEL_NUMBER.to_le_bytes());
        table[registers::ID as usize] = id;
        table[registers::LOCK as usize] = 1;
        put(&mut table, registers::PRESENT_POSITION, &position.to_le_bytes());
        self.state().servos.insert(id, table);
    }

    pub fn set_position(&self, id: u8, position: u16) {
        if let Some(table) = self.state().servos.get_mut(&id) {
            put(table, registers::PRESENT_POSITION, &position.to_le_bytes());
        }
    }

    pub fn register_u8(&self, id: u8, address: u8) -> Option<u8> {
        self.state()
            .servos
            .get(&id)
            .map(|table| table[address as usize])
    }

    pub fn register_u16(&self, id: u8, address: u8) -> Option<u16> {
        self.state().servos.get(&id).map(|table| {
            u16::from_le_bytes([table[address as usize], table[address as usize + 1]])
        })
    }

    pub fn has_servo(&self, id: u8) -> bool {
        self.state().servos.contains_key(&id)
    }

    /// The next `count` reads from `id` time out.
    pub fn fail_reads(&self, id: u8, count: usize) {
        self.state().failing_reads.insert(id, count);
    }

    /// The next `count` writes to `id` time out.
    pub fn fail_writes(&self, id: u8, count: usize) {
        self.state().failing_writes.insert(id, count);
    }

    pub fn accesses(&self) -> Vec<BusAccess> {
        self.state().log.clone()
    }

    pub fn goal_writes(&self, id: u8) -> usize {
        self.state()
            .log
            .iter()
            .filter(|a| a.id == id && a.op == BusOp::Write)
            .count()
    }

    pub fn overlaps(&self) -> usize {
        self.overlaps.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `apply` as one timed exchange.
    fn exchange<R>(&self, id: u8, op: BusOp, apply: impl FnOnce(&mut SimState) -> R) -> R {
        let started = Instant::now();
        if self.in_flight.fetch_add(1, Ordering::SeqCst) > 0 {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }

        let latency = self.state().latency;
        if !latency.is_zero() {
            thread::sleep(latency);
        }

        let mut state = self.state();
        let result = apply(&mut *state);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        state.log.push(BusAccess {
            id,
            op,
            started,
            finished: Instant::now(),
        });
        result
    }
}

fn put(table: &mut [u8], address: u8, bytes: &[u8]) {
    let start = address as usize;
    table[start..start + bytes.len()].copy_from_slice(bytes);
}

fn no_response(id: u8) -> ServoError {
    ServoError::Communication {
        id,
        result: CommResult::NoResponse,
    }
}

fn injected_timeout(failing: &mut BTreeMap<u8, usize>, id: u8) -> Result<()> {
    match failing.get_mut(&id) {
        Some(remaining) if *remaining > 0 => {
            *remaining -= 1;
            Err(ServoError::Communication {
                id,
                result: CommResult::Timeout,
            })
        }
        _ => Ok(()),
    }
}

fn check_sim_id(id: u8) -> Result<()> {
    if id > MAX_ID {
        return Err(ServoError::InvalidArgument(format!(
            "servo id {id} must be between 0 and {MAX_ID}"
        )));
    }
    Ok(())
}

impl SimState {
    fn servo(&mut self, id: u8) -> Result<&mut Vec<u8>> {
        self.servos.get_mut(&id).ok_or_else(|| no_response(id))
    }

    fn apply_procedure(&mut self, procedure: Procedure) -> Result<Outcome> {
        match procedure {
            Procedure::ChangeId { old_id, new_id } => {
                check_sim_id(old_id)?;
                check_sim_id(new_id)?;
                let mut table =
                    self.servos
                        .remove(&old_id)
                        .ok_or_else(|| ServoError::Unreachable {
                            id: old_id,
                            source: Box::new(no_response(old_id)),
                        })?;
                table[registers::ID as usize] = new_id;
                self.servos.insert(new_id, table);
            }
            Procedure::ChangeMode { id, mode } => {
                self.servo(id)?[registers::MODE as usize] = mode.into();
            }
            Procedure::ChangeLimit { id, limit, value } => {
                put(self.servo(id)?, limit.register(), &value.to_le_bytes());
            }
            Procedure::DefineMiddle { id } => {
                let table = self.servo(id)?;
                table[registers::TORQUE_ENABLE as usize] = DEFINE_MIDDLE;
                put(
                    table,
                    registers::PRESENT_POSITION,
                    &(SIM_TICKS_PER_TURN / 2).to_le_bytes(),
                );
            }
        }
        Ok(Outcome::Applied)
    }
}

impl ServoBus for SimulatedBus {
    fn ping(&mut self, id: u8) -> Result<u16> {
        self.exchange(id, BusOp::Ping, |state| {
            let table = state.servo(id)?;
            let model = registers::MODEL_NUMBER as usize;
            Ok(u16::from_le_bytes([table[model], table[model + 1]]))
        })
    }

    fn read_position(&mut self, id: u8) -> Result<u16> {
        self.exchange(id, BusOp::Read, |state| {
            injected_timeout(&mut state.failing_reads, id)?;
            let table = state.servo(id)?;
            let at = registers::PRESENT_POSITION as usize;
            Ok(u16::from_le_bytes([table[at], table[at + 1]]))
        })
    }

    fn write_goal(&mut self, id: u8, goal: GoalCommand) -> Result<()> {
        self.exchange(id, BusOp::Write, |state| {
            injected_timeout(&mut state.failing_writes, id)?;
            let table = state.servo(id)?;
            put(table, ACCELERATION, &goal.to_block());
            // Instant motion; the wire value wraps the same way the encoder does.
            let position = goal.position % SIM_TICKS_PER_TURN;
            put(table, registers::PRESENT_POSITION, &position.to_le_bytes());
            debug!("Simulated servo {} moved to {}", id, position);
            Ok(())
        })
    }

    fn sync_write(&mut self, address: u8, targets: &BTreeMap<u8, Vec<u8>>) -> Result<()> {
        self.exchange(BROADCAST_ID, BusOp::SyncWrite, |state| {
            for (id, data) in targets {
                // No replies on a sync write, so absent servos are skipped silently.
                if let Some(table) = state.servos.get_mut(id) {
                    put(table, address, data);
                }
            }
            Ok(())
        })
    }

    fn run_procedure(&mut self, procedure: Procedure) -> Result<Outcome> {
        let id = match procedure {
            Procedure::ChangeId { old_id, .. } => old_id,
            Procedure::ChangeMode { id, .. }
            | Procedure::ChangeLimit { id, .. }
            | Procedure::DefineMiddle { id } => id,
        };
        self.exchange(id, BusOp::Procedure, |state| state.apply_procedure(procedure))
    }

    fn scan(&mut self, ids: RangeInclusive<u8>) -> Vec<(u8, u16)> {
        ids.filter_map(|id| self.ping(id).ok().map(|model| (id, model)))
            .collect()
    }

    fn close(&mut self) {
        self.state().closed = true;
    }
}
