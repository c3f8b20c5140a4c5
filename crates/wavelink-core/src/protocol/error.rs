//! Protocol errors

use thiserror::Error;

/// Errors that can occur during protocol communication
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Serial port error: {0}")]
    SerialError(String),

    #[error("Response timeout")]
    Timeout,

    #[error("Not connected to device")]
    NotConnected,

    #[error("Invalid response from device")]
    InvalidResponse,

    #[error("Reply was not valid text after {attempts} attempts")]
    DecodeFailure { attempts: u32 },

    #[error("Unknown waveform format version {0:#04x}")]
    UnknownFormatVersion(u8),

    #[error("Checksum mismatch: expected {expected:#06x}, got {actual:#06x}")]
    ChecksumMismatch { expected: u16, actual: u16 },

    #[error("Sync marker mismatch: got {actual:#06x}")]
    SyncMismatch { actual: u16 },

    #[error("Frame of {len} bytes exceeds the maximum frame length")]
    FrameTooLarge { len: usize },

    #[error("Record of {got} words does not match the {needed} expected for version {tag:#04x}")]
    RecordLength { tag: u8, needed: usize, got: usize },

    #[error("Remote filename of {len} bytes exceeds the device limit of {max}")]
    FilenameTooLong { len: usize, max: usize },

    #[error("File transfer aborted at block {block}")]
    TransferAborted { block: u32 },

    #[error("Operation denied by interlock: {0}")]
    InterlockDenied(String),

    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Errors reported by the device itself inside a packet response header.
///
/// The wire codes are fixed by the device firmware; code 0 means success and
/// is never represented here.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceError {
    #[error("opcode error (code 1)")]
    Opcode,
    #[error("hardware error (code 2)")]
    Hardware,
    #[error("value error (code 3)")]
    Value,
    #[error("FIFO underflow (code 4)")]
    FifoUnderflow,
    #[error("software error (code 5)")]
    Software,
    #[error("packet error (code 6)")]
    Packet,
    #[error("interlock error (code 7)")]
    Interlock,
    #[error("device timeout (code 8)")]
    Timeout,
    #[error("no such target (code 9)")]
    NoSuchTarget,
    #[error("FPGA not configured (code 10)")]
    FpgaNotConfigured,
    #[error("unsupported device (code 11)")]
    UnsupportedDevice,
    #[error("no such file (code 12)")]
    NoSuchFile,
    #[error("hardware not ready (code 13)")]
    HardwareNotReady,
    #[error("memory allocation failed (code 14)")]
    MemoryAllocationFailed,
    #[error("unrecognized device error code {0}")]
    Unknown(u8),
}

impl DeviceError {
    /// Translate a status byte from a response header.
    ///
    /// Returns `None` for 0 (success) and the matching error for anything
    /// else. Codes outside 1..=14 are surfaced verbatim as `Unknown`.
    pub fn from_code(code: u8) -> Option<DeviceError> {
        match code {
            0 => None,
            1 => Some(DeviceError::Opcode),
            2 => Some(DeviceError::Hardware),
            3 => Some(DeviceError::Value),
            4 => Some(DeviceError::FifoUnderflow),
            5 => Some(DeviceError::Software),
            6 => Some(DeviceError::Packet),
            7 => Some(DeviceError::Interlock),
            8 => Some(DeviceError::Timeout),
            9 => Some(DeviceError::NoSuchTarget),
            10 => Some(DeviceError::FpgaNotConfigured),
            11 => Some(DeviceError::UnsupportedDevice),
            12 => Some(DeviceError::NoSuchFile),
            13 => Some(DeviceError::HardwareNotReady),
            14 => Some(DeviceError::MemoryAllocationFailed),
            other => Some(DeviceError::Unknown(other)),
        }
    }

    /// The wire code for this error.
    pub fn code(&self) -> u8 {
        match self {
            DeviceError::Opcode => 1,
            DeviceError::Hardware => 2,
            DeviceError::Value => 3,
            DeviceError::FifoUnderflow => 4,
            DeviceError::Software => 5,
            DeviceError::Packet => 6,
            DeviceError::Interlock => 7,
            DeviceError::Timeout => 8,
            DeviceError::NoSuchTarget => 9,
            DeviceError::FpgaNotConfigured => 10,
            DeviceError::UnsupportedDevice => 11,
            DeviceError::NoSuchFile => 12,
            DeviceError::HardwareNotReady => 13,
            DeviceError::MemoryAllocationFailed => 14,
            DeviceError::Unknown(code) => *code,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_code_is_not_an_error() {
        assert_eq!(DeviceError::from_code(0), None);
    }

    #[test]
    fn test_interlock_code() {
        assert_eq!(DeviceError::from_code(7), Some(DeviceError::Interlock));
    }

    #[test]
    fn test_code_roundtrip() {
        for code in 1..=14u8 {
            let err = DeviceError::from_code(code).unwrap();
            assert_eq!(err.code(), code);
        }
    }

    #[test]
    fn test_unknown_code_kept_verbatim() {
        assert_eq!(DeviceError::from_code(99), Some(DeviceError::Unknown(99)));
        assert_eq!(DeviceError::Unknown(99).code(), 99);
    }
}
