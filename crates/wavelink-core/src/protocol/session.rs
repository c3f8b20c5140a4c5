//! Command session
//!
//! Runs the line-oriented command/response protocol over a transport channel:
//! write a command, accumulate the reply until the prompt terminator appears,
//! strip the echo and terminator, hand back the payload.

use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

use super::channel::{read_exact_timeout, TransportChannel};
use super::command::{parse_numeric_reply, Command};
use super::{ProtocolError, DEFAULT_TIMEOUT_MS};

/// Prompt sequence signaling the device is ready for the next command.
///
/// Under normal operation it never appears inside a well-formed text reply;
/// binary replies that may contain it must carry an expected payload length.
pub const TERMINATOR: &[u8] = b"\r\n> ";

/// Poll interval while waiting for reply bytes
const POLL_INTERVAL: Duration = Duration::from_millis(2);

/// Deadline for the best-effort logging restore during teardown
const RESTORE_TIMEOUT: Duration = Duration::from_millis(500);

/// Session configuration
///
/// The command words are device vocabulary and can be overridden per
/// controller generation; the defaults match current firmware.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Idempotent "enter known state" command sent on session start
    pub init_command: String,
    /// Command clearing any residual numeric stack
    pub stack_clear_command: String,
    /// Command issued to clear the device echo state after a garbled reply
    pub recovery_command: String,
    /// Command printing the current logging-output enable state
    pub logging_query_command: String,
    /// Command word that sets the logging-output enable state
    pub logging_command_prefix: String,
    /// Default reply timeout in milliseconds
    pub default_timeout_ms: u64,
    /// Ceiling for garbled-reply retries before the failure is fatal
    pub max_decode_retries: u32,
    /// Timeout increment applied on each garbled-reply retry, in milliseconds
    pub decode_retry_step_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            init_command: "prompt on".to_string(),
            stack_clear_command: "stack clear".to_string(),
            recovery_command: "stack clear".to_string(),
            logging_query_command: "verbose".to_string(),
            logging_command_prefix: "verbose".to_string(),
            default_timeout_ms: DEFAULT_TIMEOUT_MS,
            max_decode_retries: 3,
            decode_retry_step_ms: 500,
        }
    }
}

/// One synchronous command/response session.
///
/// Owns its channel exclusively. On teardown the device logging state saved
/// during establishment is restored and the channel is shut down, tolerating
/// an already-closed peer.
pub struct CommandSession {
    channel: Box<dyn TransportChannel>,
    config: SessionConfig,
    saved_logging: Option<i64>,
}

impl CommandSession {
    /// Wrap a channel without performing session establishment.
    ///
    /// Assumes the device is already in a known state; use [`connect`] for
    /// the full establishment sequence.
    ///
    /// [`connect`]: CommandSession::connect
    pub fn new(channel: Box<dyn TransportChannel>, config: SessionConfig) -> Self {
        Self {
            channel,
            config,
            saved_logging: None,
        }
    }

    /// Establish a session: bring the device to a known state, drain stale
    /// bytes, clear the residual stack, and silence logging output for the
    /// lifetime of the session.
    pub fn connect(
        channel: Box<dyn TransportChannel>,
        config: SessionConfig,
    ) -> Result<Self, ProtocolError> {
        let mut session = Self::new(channel, config);
        let timeout = session.default_timeout();

        session.drain();

        // The device may already be in the target state, making a failed
        // first attempt harmless; one re-send covers the bootloader case.
        let init = Command::new(&session.config.init_command, timeout);
        if let Err(e) = session.execute(&init) {
            debug!(error = %e, "first init attempt failed, re-sending");
            session.execute(&init)?;
        }
        session.drain();

        let clear = Command::new(&session.config.stack_clear_command, timeout);
        session.execute(&clear)?;

        let query = Command::new(&session.config.logging_query_command, timeout);
        let reply = session.execute_text(&query)?;
        let values = parse_numeric_reply(&reply)?;
        let previous = *values.first().ok_or(ProtocolError::InvalidResponse)?;

        let off = format!("{} 0", session.config.logging_command_prefix);
        session.execute(&Command::new(off, timeout))?;
        session.saved_logging = Some(previous);
        debug!(previous, "session established, logging output disabled");

        Ok(session)
    }

    /// Default timeout from the configuration
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.config.default_timeout_ms)
    }

    /// Execute a command and return its reply payload.
    ///
    /// Text replies (no expected payload length) that fail to decode as
    /// UTF-8 trigger the recovery command and a re-issue of the same command
    /// with an incremented timeout, up to the configured ceiling.
    pub fn execute(&mut self, cmd: &Command) -> Result<Vec<u8>, ProtocolError> {
        let mut timeout = cmd.timeout;
        let mut attempts = 0u32;

        loop {
            let reply = self.execute_once(cmd, timeout)?;
            if cmd.expected_len.is_some() || std::str::from_utf8(&reply).is_ok() {
                return Ok(reply);
            }

            attempts += 1;
            if attempts > self.config.max_decode_retries {
                return Err(ProtocolError::DecodeFailure { attempts });
            }
            warn!(
                command = %cmd.text,
                attempts,
                "reply was not valid text, clearing device state and retrying"
            );

            let recovery = Command::new(&self.config.recovery_command, timeout);
            if let Err(e) = self.execute_once(&recovery, timeout) {
                debug!(error = %e, "recovery command failed, retrying anyway");
            }
            timeout += Duration::from_millis(self.config.decode_retry_step_ms);
        }
    }

    /// Execute a command whose reply is expected to be text
    pub fn execute_text(&mut self, cmd: &Command) -> Result<String, ProtocolError> {
        let reply = self.execute(cmd)?;
        let text = String::from_utf8(reply)
            .map_err(|_| ProtocolError::DecodeFailure { attempts: 1 })?;
        Ok(text.trim().to_string())
    }

    /// One send/receive exchange without the decode-retry layer
    fn execute_once(
        &mut self,
        cmd: &Command,
        timeout: Duration,
    ) -> Result<Vec<u8>, ProtocolError> {
        let wire = cmd.wire_bytes();
        trace!(command = %cmd.text, "sending command");
        self.channel.write_all(&wire)?;
        self.channel.flush()?;

        // With an expected payload length the reply stays pending until at
        // least echo + terminator + payload bytes have arrived, so a payload
        // that happens to contain the terminator cannot end it early.
        let min_len = cmd
            .expected_len
            .map(|n| wire.len() + TERMINATOR.len() + n);

        let mut reply: Vec<u8> = Vec::new();
        let mut buf = [0u8; 512];
        let start = Instant::now();

        loop {
            if reply_complete(&reply, min_len) {
                break;
            }
            if start.elapsed() > timeout {
                debug!(
                    command = %cmd.text,
                    received = reply.len(),
                    "reply timeout"
                );
                return Err(ProtocolError::Timeout);
            }

            let available = self.channel.bytes_to_read()? as usize;
            if available == 0 {
                std::thread::sleep(POLL_INTERVAL);
                continue;
            }

            let to_read = available.min(buf.len());
            let n = self.channel.read(&mut buf[..to_read])?;
            if n == 0 {
                return Err(ProtocolError::Timeout);
            }
            reply.extend_from_slice(&buf[..n]);
        }

        trace!(bytes = reply.len(), "reply complete");

        let body = reply.as_slice();
        let body = match body.strip_prefix(wire.as_slice()) {
            Some(stripped) => stripped,
            None => {
                warn!(command = %cmd.text, "reply is missing the command echo");
                body
            }
        };
        let body = body.strip_suffix(TERMINATOR).unwrap_or(body);
        Ok(body.to_vec())
    }

    /// Send a command and consume only its echo, leaving the channel in
    /// whatever mode the command switches the device into.
    pub(crate) fn send_expect_echo(
        &mut self,
        text: &str,
        timeout: Duration,
    ) -> Result<(), ProtocolError> {
        let cmd = Command::new(text, timeout);
        let wire = cmd.wire_bytes();
        trace!(command = text, "sending mode-switch command");
        self.channel.write_all(&wire)?;
        self.channel.flush()?;

        let mut echo = vec![0u8; wire.len()];
        read_exact_timeout(self.channel.as_mut(), &mut echo, timeout)?;
        if echo != wire {
            warn!(command = text, "echo mismatch after mode-switch command");
            return Err(ProtocolError::InvalidResponse);
        }
        Ok(())
    }

    /// Read and discard until the terminator reappears.
    ///
    /// Used after a mode-switch sequence to absorb any partial prompt and get
    /// back in step with the command/response framing.
    pub(crate) fn resync(&mut self, timeout: Duration) -> Result<(), ProtocolError> {
        let mut seen: Vec<u8> = Vec::new();
        let mut buf = [0u8; 512];
        let start = Instant::now();

        loop {
            if seen.ends_with(TERMINATOR) {
                trace!(bytes = seen.len(), "resynchronized with prompt");
                return Ok(());
            }
            if start.elapsed() > timeout {
                return Err(ProtocolError::Timeout);
            }

            let available = self.channel.bytes_to_read()? as usize;
            if available == 0 {
                std::thread::sleep(POLL_INTERVAL);
                continue;
            }
            let limit = available.min(buf.len());
            let n = self.channel.read(&mut buf[..limit])?;
            seen.extend_from_slice(&buf[..n]);
        }
    }

    /// Discard any bytes currently pending on the channel
    fn drain(&mut self) {
        if let Err(e) = self.channel.clear_input_buffer() {
            debug!(error = %e, "failed to drain channel");
        }
    }

    /// Direct channel access for sub-protocols that take over the link
    pub(crate) fn channel_mut(&mut self) -> &mut dyn TransportChannel {
        self.channel.as_mut()
    }
}

fn reply_complete(reply: &[u8], min_len: Option<usize>) -> bool {
    if !reply.ends_with(TERMINATOR) {
        return false;
    }
    match min_len {
        None => true,
        Some(min) => reply.len() >= min,
    }
}

impl Drop for CommandSession {
    fn drop(&mut self) {
        // Restore the logging state on every exit path, best effort.
        if let Some(previous) = self.saved_logging.take() {
            let restore = format!("{} {}", self.config.logging_command_prefix, previous);
            let cmd = Command::new(restore, RESTORE_TIMEOUT);
            if let Err(e) = self.execute_once(&cmd, RESTORE_TIMEOUT) {
                debug!(error = %e, "failed to restore device logging state");
            }
        }
        if let Err(e) = self.channel.shutdown() {
            debug!(error = %e, "channel shutdown failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::testing::MockChannel;
    use pretty_assertions::assert_eq;

    fn reply(payload: &[u8]) -> Vec<u8> {
        let mut bytes = payload.to_vec();
        bytes.extend_from_slice(TERMINATOR);
        bytes
    }

    fn session(channel: MockChannel) -> CommandSession {
        CommandSession::new(Box::new(channel), SessionConfig::default())
    }

    #[test]
    fn test_execute_returns_payload_exactly() {
        let (channel, handle) = MockChannel::echoing();
        handle.queue_reply(reply(b"ADC0 1 2 3"));
        let mut session = session(channel);

        let cmd = Command::new("readout", Duration::from_millis(200));
        let payload = session.execute(&cmd).unwrap();
        assert_eq!(payload, b"ADC0 1 2 3".to_vec());
        assert_eq!(handle.tx(), b"readout\r\n".to_vec());
    }

    #[test]
    fn test_execute_empty_payload() {
        let (channel, handle) = MockChannel::echoing();
        handle.queue_reply(reply(b""));
        let mut session = session(channel);

        let cmd = Command::new("nop", Duration::from_millis(200));
        assert_eq!(session.execute(&cmd).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn test_binary_payload_containing_terminator() {
        // A payload that embeds the terminator must not end the reply early
        // when the expected length is supplied.
        let mut payload = b"\x01\x02".to_vec();
        payload.extend_from_slice(TERMINATOR);
        payload.extend_from_slice(b"\x03\x04");

        let (channel, handle) = MockChannel::echoing();
        handle.queue_reply(reply(&payload));
        let mut session = session(channel);

        let cmd = Command::with_payload("pop", Duration::from_millis(200), payload.len());
        assert_eq!(session.execute(&cmd).unwrap(), payload);
    }

    #[test]
    fn test_silent_transport_times_out() {
        let (channel, _handle) = MockChannel::new();
        let mut session = session(channel);

        let timeout = Duration::from_millis(60);
        let start = Instant::now();
        let cmd = Command::new("status", timeout);
        let err = session.execute(&cmd);
        assert!(matches!(err, Err(ProtocolError::Timeout)));
        assert!(start.elapsed() >= timeout);
    }

    #[test]
    fn test_garbled_reply_recovers() {
        let (channel, handle) = MockChannel::echoing();
        handle.queue_reply(reply(&[0xFF, 0xFE])); // not valid UTF-8
        handle.queue_reply(reply(b"")); // recovery command reply
        handle.queue_reply(reply(b"ready"));
        let mut session = session(channel);

        let cmd = Command::new("status", Duration::from_millis(200));
        assert_eq!(session.execute(&cmd).unwrap(), b"ready".to_vec());
        assert_eq!(handle.tx_count(b"status\r\n"), 2);
        assert_eq!(handle.tx_count(b"stack clear\r\n"), 1);
    }

    #[test]
    fn test_garbled_reply_ceiling_is_fatal() {
        let (channel, handle) = MockChannel::echoing();
        // Initial attempt + 3 retries, each preceded by a recovery exchange.
        for _ in 0..4 {
            handle.queue_reply(reply(&[0xFF, 0xFE]));
            handle.queue_reply(reply(b""));
        }
        let mut session = session(channel);

        let cmd = Command::new("status", Duration::from_millis(200));
        let err = session.execute(&cmd);
        assert!(matches!(
            err,
            Err(ProtocolError::DecodeFailure { attempts: 4 })
        ));
        assert_eq!(handle.tx_count(b"status\r\n"), 4);
    }

    #[test]
    fn test_connect_establishes_and_drop_restores() {
        let (channel, handle) = MockChannel::echoing();
        handle.queue_reply(reply(b"")); // prompt on
        handle.queue_reply(reply(b"")); // stack clear
        handle.queue_reply(reply(b"verbose 1")); // logging query
        handle.queue_reply(reply(b"")); // verbose 0
        handle.queue_reply(reply(b"")); // verbose 1 (restore on drop)

        let session =
            CommandSession::connect(Box::new(channel), SessionConfig::default()).unwrap();
        drop(session);

        assert_eq!(handle.tx_count(b"prompt on\r\n"), 1);
        assert_eq!(handle.tx_count(b"verbose 0\r\n"), 1);
        assert_eq!(handle.tx_count(b"verbose 1\r\n"), 1);
    }

    #[test]
    fn test_connect_resends_init_after_failure() {
        let (channel, handle) = MockChannel::echoing();
        // No reply for the first init attempt; the re-send gets one.
        handle.queue_reply(Vec::new());
        handle.queue_reply(reply(b""));
        handle.queue_reply(reply(b"")); // stack clear
        handle.queue_reply(reply(b"verbose 0")); // logging query
        handle.queue_reply(reply(b"")); // verbose 0

        let mut config = SessionConfig::default();
        config.default_timeout_ms = 80; // keep the failed first attempt short
        let session = CommandSession::connect(Box::new(channel), config).unwrap();
        assert_eq!(handle.tx_count(b"prompt on\r\n"), 2);
        drop(session);
    }

    #[test]
    fn test_config_json_roundtrip() {
        let config = SessionConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: SessionConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.init_command, config.init_command);
        assert_eq!(back.default_timeout_ms, config.default_timeout_ms);
        assert_eq!(back.max_decode_retries, config.max_decode_retries);
    }

    #[test]
    fn test_resync_absorbs_partial_prompt() {
        let (channel, handle) = MockChannel::new();
        handle.push_rx(b"leftover noise\r\n> ");
        let mut session = session(channel);
        session.resync(Duration::from_millis(200)).unwrap();
    }
}
