//! Block-oriented upload sub-protocol
//!
//! Classic 128-byte checksum XMODEM, sender side only: the device switches
//! into receive mode after the trigger command and drives the transfer with
//! NAK/ACK bytes.

use std::io::Write;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

use super::channel::TransportChannel;
use super::ProtocolError;

const SOH: u8 = 0x01;
const EOT: u8 = 0x04;
const ACK: u8 = 0x06;
const NAK: u8 = 0x15;
const CAN: u8 = 0x18;
/// Padding byte for the final short block (SUB)
const PAD: u8 = 0x1A;

/// Fixed data block size
pub(crate) const BLOCK_SIZE: usize = 128;

/// Retransmissions allowed per block before the transfer is aborted
const MAX_BLOCK_RETRIES: u32 = 10;

/// Stream `data` to a receiver that has just been switched into
/// block-receive mode.
pub(crate) fn send(
    channel: &mut dyn TransportChannel,
    data: &[u8],
    timeout: Duration,
) -> Result<(), ProtocolError> {
    wait_for_start(channel, timeout)?;

    let mut seq: u8 = 1;
    for chunk in data.chunks(BLOCK_SIZE) {
        send_block(channel, seq, chunk, timeout)?;
        seq = seq.wrapping_add(1);
    }

    // End-of-transfer marker, re-sent until acknowledged.
    let mut attempts = 0u32;
    loop {
        channel.write_all(&[EOT])?;
        channel.flush()?;
        match read_byte(channel, timeout) {
            Ok(ACK) => {
                debug!(blocks = data.len().div_ceil(BLOCK_SIZE), "transfer complete");
                return Ok(());
            }
            Ok(byte) => trace!(byte, "unexpected response to EOT"),
            Err(ProtocolError::Timeout) => trace!("no response to EOT"),
            Err(e) => return Err(e),
        }
        attempts += 1;
        if attempts > MAX_BLOCK_RETRIES {
            return Err(ProtocolError::TransferAborted { block: seq as u32 });
        }
    }
}

/// Wait for the receiver's initial NAK that starts a checksum-mode transfer
fn wait_for_start(
    channel: &mut dyn TransportChannel,
    timeout: Duration,
) -> Result<(), ProtocolError> {
    let start = Instant::now();
    loop {
        match read_byte(channel, timeout.saturating_sub(start.elapsed())) {
            Ok(NAK) => return Ok(()),
            Ok(CAN) => return Err(ProtocolError::TransferAborted { block: 0 }),
            Ok(byte) => trace!(byte, "ignoring byte while waiting for transfer start"),
            Err(e) => return Err(e),
        }
    }
}

fn send_block(
    channel: &mut dyn TransportChannel,
    seq: u8,
    chunk: &[u8],
    timeout: Duration,
) -> Result<(), ProtocolError> {
    let mut frame = Vec::with_capacity(3 + BLOCK_SIZE + 1);
    frame.push(SOH);
    frame.push(seq);
    frame.push(!seq);
    frame.extend_from_slice(chunk);
    frame.resize(3 + BLOCK_SIZE, PAD);
    let checksum = frame[3..].iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
    frame.push(checksum);

    for attempt in 0..=MAX_BLOCK_RETRIES {
        channel.write_all(&frame)?;
        channel.flush()?;
        match read_byte(channel, timeout) {
            Ok(ACK) => return Ok(()),
            Ok(NAK) => debug!(seq, attempt, "block rejected, retransmitting"),
            Ok(CAN) => return Err(ProtocolError::TransferAborted { block: seq as u32 }),
            Ok(byte) => debug!(seq, byte, "unexpected block response"),
            Err(ProtocolError::Timeout) => debug!(seq, attempt, "block unacknowledged"),
            Err(e) => return Err(e),
        }
    }
    Err(ProtocolError::TransferAborted { block: seq as u32 })
}

fn read_byte(
    channel: &mut dyn TransportChannel,
    timeout: Duration,
) -> Result<u8, ProtocolError> {
    let start = Instant::now();
    loop {
        if start.elapsed() > timeout {
            return Err(ProtocolError::Timeout);
        }
        if channel.bytes_to_read()? == 0 {
            std::thread::sleep(Duration::from_millis(1));
            continue;
        }
        let mut byte = [0u8; 1];
        let n = std::io::Read::read(channel, &mut byte)?;
        if n == 1 {
            return Ok(byte[0]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::testing::MockChannel;

    #[test]
    fn test_single_block_with_padding() {
        let (mut channel, handle) = MockChannel::new();
        handle.push_rx(&[NAK]); // receiver starts the transfer
        handle.queue_reply(vec![ACK]); // block accepted
        handle.queue_reply(vec![ACK]); // EOT accepted

        send(&mut channel, b"hello", Duration::from_millis(200)).unwrap();

        let tx = handle.tx();
        assert_eq!(tx.len(), 3 + BLOCK_SIZE + 1 + 1); // block + EOT
        assert_eq!(&tx[..3], &[SOH, 1, 0xFE]);
        assert_eq!(&tx[3..8], b"hello");
        assert!(tx[8..3 + BLOCK_SIZE].iter().all(|b| *b == PAD));
        assert_eq!(*tx.last().unwrap(), EOT);
    }

    #[test]
    fn test_rejected_block_is_retransmitted() {
        let (mut channel, handle) = MockChannel::new();
        handle.push_rx(&[NAK]);
        handle.queue_reply(vec![NAK]); // checksum mismatch on first try
        handle.queue_reply(vec![ACK]);
        handle.queue_reply(vec![ACK]); // EOT

        send(&mut channel, &[0x42; 10], Duration::from_millis(200)).unwrap();

        // Two identical block frames followed by EOT.
        let tx = handle.tx();
        let frame_len = 3 + BLOCK_SIZE + 1;
        assert_eq!(tx.len(), 2 * frame_len + 1);
        assert_eq!(tx[..frame_len], tx[frame_len..2 * frame_len]);
    }

    #[test]
    fn test_retry_exhaustion_aborts() {
        let (mut channel, handle) = MockChannel::new();
        handle.push_rx(&[NAK]);
        for _ in 0..=MAX_BLOCK_RETRIES {
            handle.queue_reply(vec![NAK]);
        }

        let err = send(&mut channel, &[0u8; 4], Duration::from_millis(200));
        assert!(matches!(
            err,
            Err(ProtocolError::TransferAborted { block: 1 })
        ));
    }

    #[test]
    fn test_cancel_aborts_immediately() {
        let (mut channel, handle) = MockChannel::new();
        handle.push_rx(&[NAK]);
        handle.queue_reply(vec![CAN]);

        let err = send(&mut channel, &[0u8; 4], Duration::from_millis(200));
        assert!(matches!(err, Err(ProtocolError::TransferAborted { .. })));
    }
}
