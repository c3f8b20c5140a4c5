//! Controller Communication Protocols
//!
//! Implements the two on-wire protocols spoken by the instrument controller:
//! the line-oriented command/response console (with its chunked file-upload
//! mode) and the binary checksummed packet protocol.

pub mod channel;
pub mod command;
mod error;
pub mod packet;
pub mod session;
pub mod upload;
mod xmodem;

#[cfg(test)]
pub(crate) mod testing;

pub use channel::{
    clear_buffers, configure_port, list_ports, open_port, PortInfo, SerialChannel, TcpChannel,
    TransportChannel,
};
pub use command::{parse_numeric_reply, Command};
pub use error::{DeviceError, ProtocolError};
pub use packet::{Frame, Opcode, PacketConfig, PacketSession, Tokens};
pub use session::{CommandSession, SessionConfig, TERMINATOR};
pub use upload::{FileTransferSession, MAX_REMOTE_NAME_LEN};

/// Default baud rate for controller communication
pub const DEFAULT_BAUD_RATE: u32 = 115200;

/// Default timeout for replies in milliseconds
pub const DEFAULT_TIMEOUT_MS: u64 = 2000;
