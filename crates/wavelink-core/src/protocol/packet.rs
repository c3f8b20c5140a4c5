//! Binary packet protocol
//!
//! Checksummed request/response frames used by devices that speak the binary
//! protocol instead of the text console. Strictly synchronous: one request in
//! flight per channel, bounded automatic retry on link-level failure.
//!
//! Frame layout, all multi-byte fields big-endian:
//! - 2 bytes: sync marker (0x8F15)
//! - 2 bytes: total frame length, header through trailer
//! - 1 byte:  opcode
//! - 2 bytes: target id
//! - 1 byte:  token1 (status byte in responses)
//! - 1 byte:  token2
//! - N bytes: payload
//! - 2 bytes: checksum

use byteorder::{BigEndian, ByteOrder};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

use super::channel::{read_exact_timeout, TransportChannel};
use super::error::DeviceError;
use super::ProtocolError;

/// Frame sync marker
pub const SYNC: u16 = 0x8F15;

/// Fixed header size in bytes
pub const HEADER_LEN: usize = 9;

/// Trailing checksum size in bytes
pub const TRAILER_LEN: usize = 2;

/// Hard ceiling on the declared total frame length
pub const MAX_FRAME_LEN: usize = 0x8000;

/// Packet operation codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum Opcode {
    /// Read data from a target
    Read = 1,
    /// Write data to a target
    Write = 2,
    /// Poll a target for pending data
    Poll = 3,
    /// Loopback test
    Echo = 4,
}

impl Opcode {
    fn byte(self) -> u8 {
        self as u8
    }
}

/// Addressing tokens selecting a channel/device sub-target
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tokens {
    /// First addressing token
    pub token1: u8,
    /// Second addressing token
    pub token2: u8,
}

/// One framed request or response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Operation code byte
    pub opcode: u8,
    /// Target id
    pub target: u16,
    /// First token byte; carries the status code in responses
    pub token1: u8,
    /// Second token byte
    pub token2: u8,
    /// Payload bytes
    pub payload: Vec<u8>,
}

impl Frame {
    /// Build a request frame
    pub fn new(opcode: Opcode, target: u16, tokens: Tokens, payload: Vec<u8>) -> Self {
        Self {
            opcode: opcode.byte(),
            target,
            token1: tokens.token1,
            token2: tokens.token2,
            payload,
        }
    }

    /// Total encoded length of this frame
    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.payload.len() + TRAILER_LEN
    }

    /// Encode to wire bytes, appending the checksum over header+payload
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        let total = self.encoded_len();
        if total > MAX_FRAME_LEN {
            return Err(ProtocolError::FrameTooLarge { len: total });
        }

        let mut bytes = Vec::with_capacity(total);
        let mut field = [0u8; 2];
        BigEndian::write_u16(&mut field, SYNC);
        bytes.extend_from_slice(&field);
        BigEndian::write_u16(&mut field, total as u16);
        bytes.extend_from_slice(&field);
        bytes.push(self.opcode);
        BigEndian::write_u16(&mut field, self.target);
        bytes.extend_from_slice(&field);
        bytes.push(self.token1);
        bytes.push(self.token2);
        bytes.extend_from_slice(&self.payload);

        BigEndian::write_u16(&mut field, checksum16(&bytes));
        bytes.extend_from_slice(&field);
        Ok(bytes)
    }

    /// Decode a complete frame, verifying sync, length and checksum
    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < HEADER_LEN + TRAILER_LEN {
            return Err(ProtocolError::InvalidResponse);
        }
        let sync = BigEndian::read_u16(&data[0..2]);
        if sync != SYNC {
            return Err(ProtocolError::SyncMismatch { actual: sync });
        }
        let total = BigEndian::read_u16(&data[2..4]) as usize;
        if total > MAX_FRAME_LEN {
            return Err(ProtocolError::FrameTooLarge { len: total });
        }
        if total != data.len() || total < HEADER_LEN + TRAILER_LEN {
            return Err(ProtocolError::InvalidResponse);
        }

        // The byte sum of header+payload plus the trailer value must reduce
        // to zero.
        let body = &data[..total - TRAILER_LEN];
        let trailer = BigEndian::read_u16(&data[total - TRAILER_LEN..]);
        let expected = checksum16(body);
        if expected != trailer {
            return Err(ProtocolError::ChecksumMismatch {
                expected,
                actual: trailer,
            });
        }

        Ok(Self {
            opcode: data[4],
            target: BigEndian::read_u16(&data[5..7]),
            token1: data[7],
            token2: data[8],
            payload: data[HEADER_LEN..total - TRAILER_LEN].to_vec(),
        })
    }

    /// Status byte embedded in a response header
    pub fn status(&self) -> u8 {
        self.token1
    }
}

/// 16-bit two's-complement of the byte sum: appending it makes the whole
/// frame sum to zero modulo 2^16.
fn checksum16(data: &[u8]) -> u16 {
    let sum: u32 = data.iter().map(|b| u32::from(*b)).sum();
    (sum as u16).wrapping_neg()
}

/// Packet session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PacketConfig {
    /// Automatic retries after a transport or checksum failure
    pub retries: u32,
    /// Grace period spent draining stray bytes before a checksum retry, ms
    pub drain_grace_ms: u64,
}

impl Default for PacketConfig {
    fn default() -> Self {
        Self {
            retries: 1,
            drain_grace_ms: 50,
        }
    }
}

/// Synchronous binary packet session.
///
/// Owns its channel exclusively; one request in flight at a time.
pub struct PacketSession {
    channel: Box<dyn TransportChannel>,
    config: PacketConfig,
}

impl PacketSession {
    /// Create a session over an established channel
    pub fn new(channel: Box<dyn TransportChannel>, config: PacketConfig) -> Self {
        Self { channel, config }
    }

    /// Read up to `len` bytes from a target
    pub fn read(
        &mut self,
        target: u16,
        len: usize,
        tokens: Tokens,
        timeout: Duration,
    ) -> Result<Vec<u8>, ProtocolError> {
        let mut payload = [0u8; 2];
        BigEndian::write_u16(&mut payload, len as u16);
        let frame = Frame::new(Opcode::Read, target, tokens, payload.to_vec());
        self.transact(&frame, timeout)
    }

    /// Write bytes to a target
    pub fn write(
        &mut self,
        target: u16,
        bytes: &[u8],
        tokens: Tokens,
        timeout: Duration,
    ) -> Result<(), ProtocolError> {
        let frame = Frame::new(Opcode::Write, target, tokens, bytes.to_vec());
        self.transact(&frame, timeout)?;
        Ok(())
    }

    /// Poll a target for pending data
    pub fn poll(
        &mut self,
        target: u16,
        tokens: Tokens,
        timeout: Duration,
    ) -> Result<Vec<u8>, ProtocolError> {
        let frame = Frame::new(Opcode::Poll, target, tokens, Vec::new());
        self.transact(&frame, timeout)
    }

    /// Loopback test: the device returns the payload unchanged
    pub fn echo(&mut self, bytes: &[u8], timeout: Duration) -> Result<Vec<u8>, ProtocolError> {
        let frame = Frame::new(Opcode::Echo, 0, Tokens::default(), bytes.to_vec());
        self.transact(&frame, timeout)
    }

    /// Issue one request with bounded automatic retry.
    ///
    /// Transport IO errors and checksum failures are retried silently;
    /// everything else, device-reported errors included, surfaces at once.
    fn transact(&mut self, frame: &Frame, timeout: Duration) -> Result<Vec<u8>, ProtocolError> {
        let mut last = None;
        for attempt in 0..=self.config.retries {
            if attempt > 0 {
                debug!(attempt, opcode = frame.opcode, "retrying packet request");
            }
            match self.transact_once(frame, timeout) {
                Ok(payload) => return Ok(payload),
                Err(e) => match e {
                    ProtocolError::ChecksumMismatch { .. } => {
                        // Resynchronize with any stray trailing bytes before
                        // re-issuing the request.
                        self.drain_for(Duration::from_millis(self.config.drain_grace_ms));
                        last = Some(e);
                    }
                    ProtocolError::IoError(_) | ProtocolError::SerialError(_) => {
                        last = Some(e);
                    }
                    other => return Err(other),
                },
            }
        }
        // The loop ran at least once, so a retryable error was recorded.
        Err(last.unwrap_or(ProtocolError::InvalidResponse))
    }

    fn transact_once(
        &mut self,
        frame: &Frame,
        timeout: Duration,
    ) -> Result<Vec<u8>, ProtocolError> {
        let request = frame.to_bytes()?;
        trace!(bytes = request.len(), opcode = frame.opcode, "sending packet");
        self.channel.write_all(&request)?;
        self.channel.flush()?;

        let mut header = [0u8; HEADER_LEN];
        read_exact_timeout(self.channel.as_mut(), &mut header, timeout)?;

        let sync = BigEndian::read_u16(&header[0..2]);
        if sync != SYNC {
            return Err(ProtocolError::SyncMismatch { actual: sync });
        }
        let total = BigEndian::read_u16(&header[2..4]) as usize;
        if total > MAX_FRAME_LEN {
            return Err(ProtocolError::FrameTooLarge { len: total });
        }
        if total < HEADER_LEN + TRAILER_LEN {
            return Err(ProtocolError::InvalidResponse);
        }

        let mut rest = vec![0u8; total - HEADER_LEN];
        read_exact_timeout(self.channel.as_mut(), &mut rest, timeout)?;

        let mut full = header.to_vec();
        full.extend_from_slice(&rest);
        let response = Frame::from_bytes(&full)?;

        if response.opcode != frame.opcode {
            return Err(ProtocolError::InvalidResponse);
        }
        if let Some(err) = DeviceError::from_code(response.status()) {
            // Device-reported failures carry no payload to the caller.
            return Err(ProtocolError::Device(err));
        }

        trace!(bytes = response.payload.len(), "packet response");
        Ok(response.payload)
    }

    /// Read and discard whatever arrives within the grace period
    fn drain_for(&mut self, grace: Duration) {
        let start = Instant::now();
        let mut buf = [0u8; 256];
        while start.elapsed() < grace {
            match self.channel.bytes_to_read() {
                Ok(0) => std::thread::sleep(Duration::from_millis(1)),
                Ok(n) => {
                    let to_read = (n as usize).min(buf.len());
                    if self.channel.read(&mut buf[..to_read]).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    }
}
