//! # Wavelink Core Library
//!
//! Communication core for operating a remote embedded instrument controller
//! over an unreliable byte stream (TCP socket or serial line).

//!
//! This library provides:
//! - Line-oriented command/response framing with binary payload support
//! - Chunked file upload to the controller
//! - Streaming reassembly of versioned binary waveform records
//! - The alternate checksummed binary packet protocol
//!
//! ## Example
//!
//! ```rust,ignore
//! use wavelink_core::protocol::{CommandSession, SessionConfig, TcpChannel};
//! use wavelink_core::waveform::{CommandPagePuller, RingBufferReader};
//!
//! let channel = TcpChannel::connect("10.0.0.5:5000", timeout)?;
//! let mut session = CommandSession::connect(Box::new(channel), SessionConfig::default())?;
//!
//! let reader = RingBufferReader::new(CommandPagePuller::new(&mut session));
//! for record in reader {
//!     let record = record?;
//!     println!("channel {} at {}", record.channel, record.timestamp);
//! }
//! ```

#![warn(missing_docs)]

pub mod guard;
pub mod protocol;
pub mod waveform;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::guard::{Guard, Interlocks};
    pub use crate::protocol::{
        Command, CommandSession, DeviceError, FileTransferSession, PacketSession, ProtocolError,
        SerialChannel, SessionConfig, TcpChannel, TransportChannel,
    };
    pub use crate::waveform::{
        CommandPagePuller, RingBufferReader, Version, WaveformRecord,
    };
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
