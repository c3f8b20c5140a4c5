//! File upload
//!
//! Puts the device into block-receive mode with a trigger command, streams
//! the file through the block sub-protocol, then resynchronizes with the
//! command prompt.

use std::time::Duration;
use tracing::debug;

use super::session::CommandSession;
use super::xmodem;
use super::ProtocolError;

/// Device-imposed limit on remote filenames, in bytes
pub const MAX_REMOTE_NAME_LEN: usize = 31;

/// Command word that switches the device into file-receive mode
const RECEIVE_COMMAND: &str = "recv";

/// Chunked file upload over an established command session.
///
/// Takes over the channel for the duration of one transfer and returns it
/// resynchronized with the prompt, whether or not the transfer succeeded.
pub struct FileTransferSession<'a> {
    session: &'a mut CommandSession,
    timeout: Duration,
}

impl<'a> FileTransferSession<'a> {
    /// Borrow a command session for file transfers
    pub fn new(session: &'a mut CommandSession) -> Self {
        let timeout = session.default_timeout();
        Self { session, timeout }
    }

    /// Override the per-exchange timeout
    pub fn with_timeout(session: &'a mut CommandSession, timeout: Duration) -> Self {
        Self { session, timeout }
    }

    /// Upload `data` to the device under `remote_name`.
    ///
    /// The filename limit is enforced before anything is written, so an
    /// oversized name never disturbs the device state.
    pub fn upload(&mut self, data: &[u8], remote_name: &str) -> Result<(), ProtocolError> {
        if remote_name.len() > MAX_REMOTE_NAME_LEN {
            return Err(ProtocolError::FilenameTooLong {
                len: remote_name.len(),
                max: MAX_REMOTE_NAME_LEN,
            });
        }

        debug!(remote_name, bytes = data.len(), "starting file upload");

        // Only the echo comes back here; the device is in block-receive mode
        // until the transfer ends.
        self.session
            .send_expect_echo(&format!("{RECEIVE_COMMAND} {remote_name}"), self.timeout)?;

        let result = xmodem::send(self.session.channel_mut(), data, self.timeout);

        // Resynchronize regardless of the transfer outcome so the session
        // stays usable; this absorbs the partial prompt left by the switch.
        let resync = self.session.resync(self.timeout);

        result?;
        resync?;
        debug!(remote_name, "file upload finished");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::session::{SessionConfig, TERMINATOR};
    use crate::protocol::testing::MockChannel;

    const ACK: u8 = 0x06;
    const NAK: u8 = 0x15;

    fn session(channel: MockChannel) -> CommandSession {
        CommandSession::new(Box::new(channel), SessionConfig::default())
    }

    #[test]
    fn test_oversized_filename_rejected_before_any_write() {
        let (channel, handle) = MockChannel::echoing();
        let mut session = session(channel);
        let mut transfer = FileTransferSession::new(&mut session);

        let name = "x".repeat(32);
        let err = transfer.upload(b"payload", &name);
        assert!(matches!(
            err,
            Err(ProtocolError::FilenameTooLong { len: 32, max: 31 })
        ));
        assert!(handle.tx().is_empty());
    }

    #[test]
    fn test_upload_single_block() {
        // No console echo once the device is in binary receive mode, so the
        // trigger echo is scripted explicitly.
        let (channel, handle) = MockChannel::new();
        let mut trigger_reply = b"recv fpga.bit\r\n".to_vec();
        trigger_reply.push(NAK); // the receiver's starting NAK
        handle.queue_reply(trigger_reply);
        // Block accepted.
        handle.queue_reply(vec![ACK]);
        // EOT accepted, then the prompt returns.
        let mut eot_reply = vec![ACK];
        eot_reply.extend_from_slice(TERMINATOR);
        handle.queue_reply(eot_reply);

        let mut session = session(channel);
        let mut transfer =
            FileTransferSession::with_timeout(&mut session, Duration::from_millis(200));
        transfer.upload(b"firmware bytes", "fpga.bit").unwrap();

        let tx = handle.tx();
        assert!(tx.starts_with(b"recv fpga.bit\r\n"));
        assert_eq!(*tx.last().unwrap(), 0x04); // EOT
    }

    #[test]
    fn test_failed_transfer_still_resynchronizes() {
        let (channel, handle) = MockChannel::new();
        let mut trigger_reply = b"recv f.bin\r\n".to_vec();
        trigger_reply.push(NAK);
        handle.queue_reply(trigger_reply);
        // Every block attempt rejected until the retry ceiling; the prompt
        // returns after the last rejection.
        for _ in 0..10 {
            handle.queue_reply(vec![NAK]);
        }
        let mut last = vec![NAK];
        last.extend_from_slice(TERMINATOR);
        handle.queue_reply(last);

        let mut session = session(channel);
        let mut transfer =
            FileTransferSession::with_timeout(&mut session, Duration::from_millis(200));
        let err = transfer.upload(b"doomed", "f.bin");
        assert!(matches!(err, Err(ProtocolError::TransferAborted { .. })));
    }
}
