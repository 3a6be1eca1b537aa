//! Configuration sagas built on the packet primitives.
//!
//! Persistent registers (id, mode, angle limits) sit behind the EEPROM lock.
//! Every procedure unlocks, writes, optionally verifies and locks again. If
//! the primary write did not take effect the procedure fails; if only the final
//! lock failed the change stands and the outcome carries a warning instead.

use std::fmt;
use std::thread;
use std::time::Duration;

use log::{info, warn};

use crate::error::{Result, ServoError};
use crate::protocol::PacketHandler;
use crate::registers::{self, DEFINE_MIDDLE, Limit, MAX_ID, OperatingMode};
use crate::transport::Transport;

/// Time the servo needs to commit an EEPROM write before it answers again.
pub const SETTLE_DELAY: Duration = Duration::from_millis(50);

#[derive(Debug)]
pub enum Outcome {
    Applied,
    /// The change took effect but a follow-up step (re-locking) failed.
    PartialSuccess { warning: ServoError },
}

impl Outcome {
    pub fn warning(&self) -> Option<&ServoError> {
        match self {
            Outcome::Applied => None,
            Outcome::PartialSuccess { warning } => Some(warning),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Procedure {
    ChangeId { old_id: u8, new_id: u8 },
    ChangeMode { id: u8, mode: OperatingMode },
    ChangeLimit { id: u8, limit: Limit, value: u16 },
    DefineMiddle { id: u8 },
}

impl Procedure {
    pub fn run<T: Transport>(self, handler: &mut PacketHandler<T>) -> Result<Outcome> {
        info!("Running {}", self);
        let outcome = match self {
            Procedure::ChangeId { old_id, new_id } => change_id(handler, old_id, new_id),
            Procedure::ChangeMode { id, mode } => change_mode(handler, id, mode),
            Procedure::ChangeLimit { id, limit, value } => change_limit(handler, id, limit, value),
            Procedure::DefineMiddle { id } => define_middle(handler, id),
        };
        if let Ok(Outcome::PartialSuccess { warning }) = &outcome {
            warn!("{} applied with warning: {}", self, warning);
        }
        outcome
    }
}

impl fmt::Display for Procedure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Procedure::ChangeId { old_id, new_id } => {
                write!(f, "id change {} -> {}", old_id, new_id)
            }
            Procedure::ChangeMode { id, mode } => write!(f, "mode change on {} to {:?}", id, mode),
            Procedure::ChangeLimit { id, limit, value } => {
                write!(f, "{:?} limit change on {} to {}", limit, id, value)
            }
            Procedure::DefineMiddle { id } => write!(f, "define middle on {}", id),
        }
    }
}

fn check_id(id: u8) -> Result<()> {
    if id > MAX_ID {
        return Err(ServoError::InvalidArgument(format!(
            "servo id {id} must be between 0 and {MAX_ID}"
        )));
    }
    Ok(())
}

fn lock<T: Transport>(handler: &mut PacketHandler<T>, id: u8) -> Result<()> {
    handler.write_u8(id, registers::LOCK, 1).into_result(id)
}

fn unlock<T: Transport>(handler: &mut PacketHandler<T>, id: u8) -> Result<()> {
    handler
        .write_u8(id, registers::LOCK, 0)
        .into_result(id)
        .map_err(|e| write_failed(id, "unlocking EEPROM", e, None))
}

/// Best-effort lock on a failure path. The error is logged and handed back
/// so it can ride along with the primary failure.
fn relock<T: Transport>(handler: &mut PacketHandler<T>, id: u8) -> Option<Box<ServoError>> {
    match lock(handler, id) {
        Ok(()) => None,
        Err(e) => {
            warn!("Re-locking EEPROM on servo {} failed: {}", id, e);
            Some(Box::new(e))
        }
    }
}

fn finish_with_lock<T: Transport>(handler: &mut PacketHandler<T>, id: u8) -> Result<Outcome> {
    match lock(handler, id) {
        Ok(()) => Ok(Outcome::Applied),
        Err(warning) => Ok(Outcome::PartialSuccess { warning }),
    }
}

fn write_failed(
    id: u8,
    step: &'static str,
    source: ServoError,
    relock: Option<Box<ServoError>>,
) -> ServoError {
    ServoError::WriteFailed {
        id,
        step,
        source: Box::new(source),
        relock,
    }
}

pub fn change_id<T: Transport>(
    handler: &mut PacketHandler<T>,
    old_id: u8,
    new_id: u8,
) -> Result<Outcome> {
    check_id(old_id)?;
    check_id(new_id)?;

    handler
        .ping(old_id)
        .into_result(old_id)
        .map_err(|e| ServoError::Unreachable {
            id: old_id,
            source: Box::new(e),
        })?;

    unlock(handler, old_id)?;

    if let Err(e) = handler.write_u8(old_id, registers::ID, new_id).into_result(old_id) {
        let relock = relock(handler, old_id);
        return Err(write_failed(old_id, "writing id", e, relock));
    }

    thread::sleep(SETTLE_DELAY);

    if let Err(e) = handler.ping(new_id).into_result(new_id) {
        // Lock under whichever id still answers.
        let relock = match lock(handler, new_id) {
            Ok(()) => None,
            Err(_) => relock(handler, old_id),
        };
        return Err(ServoError::VerifyMismatch {
            id: old_id,
            detail: format!("id {new_id} was written but the servo does not answer on it: {e}"),
            relock,
        });
    }

    finish_with_lock(handler, new_id)
}

pub fn change_mode<T: Transport>(
    handler: &mut PacketHandler<T>,
    id: u8,
    mode: OperatingMode,
) -> Result<Outcome> {
    check_id(id)?;
    unlock(handler, id)?;

    if let Err(e) = handler.write_u8(id, registers::MODE, mode.into()).into_result(id) {
        let relock = relock(handler, id);
        return Err(write_failed(id, "writing mode", e, relock));
    }

    thread::sleep(SETTLE_DELAY);

    let mismatch = match handler.read_u8(id, registers::MODE).into_result(id) {
        Ok(value) if value == u8::from(mode) => None,
        Ok(value) => Some(format!("wrote mode {}, read back {}", u8::from(mode), value)),
        Err(e) => Some(format!("could not read mode back: {e}")),
    };
    if let Some(detail) = mismatch {
        let relock = relock(handler, id);
        return Err(ServoError::VerifyMismatch { id, detail, relock });
    }

    finish_with_lock(handler, id)
}

/// Change one travel limit. 0 on both ends disables limits (multi-turn).
///
/// The value is not read back.
pub fn change_limit<T: Transport>(
    handler: &mut PacketHandler<T>,
    id: u8,
    limit: Limit,
    value: u16,
) -> Result<Outcome> {
    check_id(id)?;
    unlock(handler, id)?;

    if let Err(e) = handler.write_u16(id, limit.register(), value).into_result(id) {
        let relock = relock(handler, id);
        return Err(write_failed(id, "writing angle limit", e, relock));
    }

    finish_with_lock(handler, id)
}

/// Make the servo take its current position as mid scale (2048).
pub fn define_middle<T: Transport>(handler: &mut PacketHandler<T>, id: u8) -> Result<Outcome> {
    check_id(id)?;
    handler
        .write_u8(id, registers::TORQUE_ENABLE, DEFINE_MIDDLE)
        .into_result(id)
        .map_err(|e| write_failed(id, "defining middle", e, None))?;
    Ok(Outcome::Applied)
}
