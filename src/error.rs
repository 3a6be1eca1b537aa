use std::fmt;

use bitflags::bitflags;

/// Outcome of a single request/response exchange on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommResult {
    Success,
    /// The request could not be written to the port.
    TxFail,
    /// The request itself was malformed and never sent.
    TxError,
    /// Nothing came back before the timeout.
    NoResponse,
    /// A status packet started arriving but did not complete in time.
    Timeout,
    ChecksumError,
    /// Bad header, unexpected id or impossible length.
    Corrupt,
}

impl CommResult {
    pub fn is_success(self) -> bool {
        self == CommResult::Success
    }
}

impl fmt::Display for CommResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            CommResult::Success => "success",
            CommResult::TxFail => "failed to transmit instruction packet",
            CommResult::TxError => "incorrect instruction packet",
            CommResult::NoResponse => "no status packet received",
            CommResult::Timeout => "status packet timed out",
            CommResult::ChecksumError => "status packet checksum mismatch",
            CommResult::Corrupt => "corrupted status packet",
        };
        f.write_str(text)
    }
}

bitflags! {
    /// Error byte reported by the servo in its status packet.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DeviceStatus: u8 {
        const VOLTAGE = 1;
        const ANGLE = 2;
        const OVERHEAT = 4;
        const OVERCURRENT = 8;
        const OVERLOAD = 32;
    }
}

impl DeviceStatus {
    pub fn from_byte(byte: u8) -> Self {
        DeviceStatus::from_bits_retain(byte)
    }

    pub fn is_ok(self) -> bool {
        self.bits() == 0
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_ok() {
            return f.write_str("no error");
        }
        let mut names = Vec::new();
        if self.contains(DeviceStatus::VOLTAGE) {
            names.push("input voltage");
        }
        if self.contains(DeviceStatus::ANGLE) {
            names.push("angle sensor");
        }
        if self.contains(DeviceStatus::OVERHEAT) {
            names.push("overheat");
        }
        if self.contains(DeviceStatus::OVERCURRENT) {
            names.push("overcurrent");
        }
        if self.contains(DeviceStatus::OVERLOAD) {
            names.push("overload");
        }
        let unknown = self.bits() & !DeviceStatus::all().bits();
        if unknown != 0 {
            return write!(f, "{} (unknown bits 0x{:02X})", names.join(", "), unknown);
        }
        f.write_str(&names.join(", "))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServoError {
    #[error("communication with servo {id} failed: {result}")]
    Communication { id: u8, result: CommResult },

    #[error("servo {id} reported error status 0x{bits:02X} ({status})", bits = .status.bits())]
    Device { id: u8, status: DeviceStatus },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("servo {id} is not reachable: {source}")]
    Unreachable {
        id: u8,
        #[source]
        source: Box<ServoError>,
    },

    #[error("{step} on servo {id} failed: {source}")]
    WriteFailed {
        id: u8,
        step: &'static str,
        #[source]
        source: Box<ServoError>,
        /// Error from the rollback lock attempt, if it failed too.
        relock: Option<Box<ServoError>>,
    },

    #[error("verification on servo {id} failed: {detail}")]
    VerifyMismatch {
        id: u8,
        detail: String,
        relock: Option<Box<ServoError>>,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ServoError {
    /// Bus-level failures that a later retry may clear.
    pub fn is_transient(&self) -> bool {
        matches!(self, ServoError::Communication { .. } | ServoError::Io(_))
    }
}

pub type Result<T> = std::result::Result<T, ServoError>;
