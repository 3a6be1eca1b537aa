//! Instruction/status packet codec for the Feetech STS serial protocol.
//!
//! Packet format: `[0xFF, 0xFF, id, length, instruction | error, params..., checksum]`
//! where `length = params + 2` and the checksum is the inverted low byte of the
//! sum of every field after the header.

use std::collections::BTreeMap;
use std::io;
use std::ops::RangeInclusive;
use std::time::{Duration, Instant};

use log::{debug, trace, warn};

use crate::error::{CommResult, DeviceStatus, Result, ServoError};
use crate::registers::{
    BROADCAST_ID, INST_PING, INST_READ, INST_SYNC_WRITE, INST_WRITE, MODEL_NUMBER,
};
use crate::transport::{DEFAULT_TIMEOUT_MS, Transport};

const HEADER: [u8; 2] = [0xFF, 0xFF];

pub const TX_PACKET_MAX_LEN: usize = 250;
pub const RX_PACKET_MAX_LEN: usize = 250;

pub fn checksum(body: &[u8]) -> u8 {
    !body.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))
}

/// Build an instruction packet. Fails with `TxError` if it would not fit.
pub fn encode_instruction(
    id: u8,
    instruction: u8,
    params: &[u8],
) -> std::result::Result<Vec<u8>, CommResult> {
    let total = params.len() + 6;
    if total > TX_PACKET_MAX_LEN {
        return Err(CommResult::TxError);
    }

    let mut packet = Vec::with_capacity(total);
    packet.extend_from_slice(&HEADER);
    packet.push(id);
    packet.push((params.len() + 2) as u8);
    packet.push(instruction);
    packet.extend_from_slice(params);
    packet.push(checksum(&packet[2..]));
    Ok(packet)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusPacket {
    pub id: u8,
    pub status: DeviceStatus,
    pub params: Vec<u8>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Decoded {
    Complete(StatusPacket),
    Incomplete,
    Invalid(CommResult),
}

/// Try to parse a status packet for `expected_id` out of `buf`.
///
/// Leading noise before the header is skipped, and so are complete frames
/// from other ids (late replies to an exchange that already timed out).
pub fn decode_status(buf: &[u8], expected_id: u8) -> Decoded {
    let mut offset = 0;
    loop {
        let rest = &buf[offset..];
        let Some(mut start) = rest.windows(2).position(|w| w == HEADER) else {
            return Decoded::Incomplete;
        };
        // Runs of 0xFF: the header is the last two of them.
        while rest.get(start + 2) == Some(&0xFF) {
            start += 1;
        }

        let frame = &rest[start..];
        if frame.len() < 4 {
            return Decoded::Incomplete;
        }

        let id = frame[2];
        let length = frame[3] as usize;
        if length < 2 || length + 4 > RX_PACKET_MAX_LEN {
            return Decoded::Invalid(CommResult::Corrupt);
        }

        let total = length + 4;
        if frame.len() < total {
            return Decoded::Incomplete;
        }
        if checksum(&frame[2..total - 1]) != frame[total - 1] {
            return Decoded::Invalid(CommResult::ChecksumError);
        }
        if id != expected_id {
            debug!("Skipping status packet from {} while waiting for {}", id, expected_id);
            offset += start + total;
            continue;
        }

        return Decoded::Complete(StatusPacket {
            id,
            status: DeviceStatus::from_byte(frame[4]),
            params: frame[5..total - 1].to_vec(),
        });
    }
}

/// Result of a read-type exchange. Communication and device errors are
/// reported side by side and never raised, so callers can sweep ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply<T> {
    pub comm: CommResult,
    pub status: DeviceStatus,
    pub value: Option<T>,
}

impl<T> Reply<T> {
    fn failed(comm: CommResult) -> Self {
        Self {
            comm,
            status: DeviceStatus::empty(),
            value: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.comm.is_success() && self.status.is_ok() && self.value.is_some()
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Reply<U> {
        Reply {
            comm: self.comm,
            status: self.status,
            value: self.value.map(f),
        }
    }

    pub fn into_result(self, id: u8) -> Result<T> {
        if !self.comm.is_success() {
            return Err(ServoError::Communication {
                id,
                result: self.comm,
            });
        }
        if !self.status.is_ok() {
            return Err(ServoError::Device {
                id,
                status: self.status,
            });
        }
        self.value.ok_or(ServoError::Communication {
            id,
            result: CommResult::Corrupt,
        })
    }
}

/// Result of a write-type exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    pub comm: CommResult,
    pub status: DeviceStatus,
}

impl Ack {
    pub fn is_ok(&self) -> bool {
        self.comm.is_success() && self.status.is_ok()
    }

    pub fn into_result(self, id: u8) -> Result<()> {
        if !self.comm.is_success() {
            return Err(ServoError::Communication {
                id,
                result: self.comm,
            });
        }
        if !self.status.is_ok() {
            return Err(ServoError::Device {
                id,
                status: self.status,
            });
        }
        Ok(())
    }
}

pub struct PacketHandler<T: Transport> {
    transport: T,
    timeout: Duration,
}

impl<T: Transport> PacketHandler<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn close(&mut self) {
        self.transport.close();
    }

    /// Ping a servo and read back its model number.
    pub fn ping(&mut self, id: u8) -> Reply<u16> {
        match self.tx_rx(id, INST_PING, &[]) {
            Ok(packet) if !packet.status.is_ok() => Reply {
                comm: CommResult::Success,
                status: packet.status,
                value: None,
            },
            Ok(_) => self.read_u16(id, MODEL_NUMBER),
            Err(comm) => Reply::failed(comm),
        }
    }

    /// Ping every id in `ids` and return those that answered cleanly.
    pub fn scan(&mut self, ids: RangeInclusive<u8>) -> Vec<(u8, u16)> {
        let mut found = Vec::new();
        for id in ids {
            if id == BROADCAST_ID {
                continue;
            }
            let reply = self.ping(id);
            if let (true, Some(model)) = (reply.is_ok(), reply.value) {
                debug!("Servo found at id {} (model {})", id, model);
                found.push((id, model));
            }
        }
        found
    }

    pub fn read(&mut self, id: u8, address: u8, length: u8) -> Reply<Vec<u8>> {
        match self.tx_rx(id, INST_READ, &[address, length]) {
            Ok(packet) if packet.params.len() != length as usize && packet.status.is_ok() => {
                warn!(
                    "Servo {} returned {} bytes for a {} byte read at {}",
                    id,
                    packet.params.len(),
                    length,
                    address
                );
                Reply::failed(CommResult::Corrupt)
            }
            Ok(packet) => {
                let value = packet.status.is_ok().then_some(packet.params);
                Reply {
                    comm: CommResult::Success,
                    status: packet.status,
                    value,
                }
            }
            Err(comm) => Reply::failed(comm),
        }
    }

    pub fn read_u8(&mut self, id: u8, address: u8) -> Reply<u8> {
        self.read(id, address, 1).map(|bytes| bytes[0])
    }

    pub fn read_u16(&mut self, id: u8, address: u8) -> Reply<u16> {
        self.read(id, address, 2)
            .map(|bytes| u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    pub fn read_u32(&mut self, id: u8, address: u8) -> Reply<u32> {
        self.read(id, address, 4)
            .map(|bytes| u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn write(&mut self, id: u8, address: u8, data: &[u8]) -> Ack {
        let mut params = Vec::with_capacity(data.len() + 1);
        params.push(address);
        params.extend_from_slice(data);

        match self.tx_rx(id, INST_WRITE, &params) {
            Ok(packet) => Ack {
                comm: CommResult::Success,
                status: packet.status,
            },
            Err(comm) => Ack {
                comm,
                status: DeviceStatus::empty(),
            },
        }
    }

    pub fn write_u8(&mut self, id: u8, address: u8, value: u8) -> Ack {
        self.write(id, address, &[value])
    }

    pub fn write_u16(&mut self, id: u8, address: u8, value: u16) -> Ack {
        self.write(id, address, &value.to_le_bytes())
    }

    pub fn write_u32(&mut self, id: u8, address: u8, value: u32) -> Ack {
        self.write(id, address, &value.to_le_bytes())
    }

    /// Write the same register block on several servos with one broadcast
    /// frame. Servos do not answer a sync write.
    pub fn group_write(&mut self, address: u8, targets: &BTreeMap<u8, Vec<u8>>) -> CommResult {
        let Some(data_len) = targets.values().next().map(Vec::len) else {
            return CommResult::TxError;
        };
        if data_len > u8::MAX as usize || targets.values().any(|d| d.len() != data_len) {
            return CommResult::TxError;
        }

        let mut params = Vec::with_capacity(2 + targets.len() * (data_len + 1));
        params.push(address);
        params.push(data_len as u8);
        for (&id, data) in targets {
            params.push(id);
            params.extend_from_slice(data);
        }

        trace!("Sync write to {} servos at {}", targets.len(), address);
        match self.tx_rx(BROADCAST_ID, INST_SYNC_WRITE, &params) {
            Ok(_) => CommResult::Success,
            Err(comm) => comm,
        }
    }

    fn tx_rx(
        &mut self,
        id: u8,
        instruction: u8,
        params: &[u8],
    ) -> std::result::Result<StatusPacket, CommResult> {
        let packet = encode_instruction(id, instruction, params)?;

        if let Err(e) = self.transport.clear_input() {
            debug!("Could not clear input buffer: {}", e);
        }
        if let Err(e) = self.transport.send(&packet) {
            warn!("Failed to send instruction 0x{:02X} to {}: {}", instruction, id, e);
            return Err(CommResult::TxFail);
        }

        if id == BROADCAST_ID {
            return Ok(StatusPacket {
                id,
                status: DeviceStatus::empty(),
                params: Vec::new(),
            });
        }
        self.receive_status(id)
    }

    fn receive_status(&mut self, id: u8) -> std::result::Result<StatusPacket, CommResult> {
        let deadline = Instant::now() + self.timeout;
        let mut buf = Vec::with_capacity(RX_PACKET_MAX_LEN);

        loop {
            match decode_status(&buf, id) {
                Decoded::Complete(packet) => return Ok(packet),
                Decoded::Invalid(comm) => return Err(comm),
                Decoded::Incomplete => {}
            }

            let now = Instant::now();
            if now >= deadline || buf.len() >= RX_PACKET_MAX_LEN {
                return Err(timeout_result(&buf));
            }

            match self
                .transport
                .receive(RX_PACKET_MAX_LEN - buf.len(), deadline - now)
            {
                Ok(bytes) => buf.extend_from_slice(&bytes),
                Err(e) if matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock) => {}
                Err(e) => {
                    warn!("Receive from servo {} failed: {}", id, e);
                    return Err(timeout_result(&buf));
                }
            }
        }
    }
}

fn timeout_result(buf: &[u8]) -> CommResult {
    if buf.is_empty() {
        CommResult::NoResponse
    } else {
        CommResult::Timeout
    }
}
