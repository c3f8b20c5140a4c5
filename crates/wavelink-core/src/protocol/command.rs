//! Commands and reply parsing
//!
//! A [`Command`] is built per call, sent once, and never persisted. Replies
//! that follow the numeric-stack grammar (`"<word> tok1 tok2 …"`) are parsed
//! with [`parse_numeric_reply`].

use std::time::Duration;

use super::ProtocolError;

/// One text command for the controller console.
#[derive(Debug, Clone)]
pub struct Command {
    /// Command text, without the trailing CRLF
    pub text: String,
    /// Overall deadline for the reply
    pub timeout: Duration,
    /// Binary payload bytes the device owes beyond the echo and terminator.
    ///
    /// Mandatory whenever the payload could contain the terminator sequence,
    /// otherwise the reply would be cut short.
    pub expected_len: Option<usize>,
}

impl Command {
    /// A plain text command expecting a text reply
    pub fn new(text: impl Into<String>, timeout: Duration) -> Self {
        Self {
            text: text.into(),
            timeout,
            expected_len: None,
        }
    }

    /// A command whose reply carries at least `expected_len` binary bytes
    pub fn with_payload(text: impl Into<String>, timeout: Duration, expected_len: usize) -> Self {
        Self {
            text: text.into(),
            timeout,
            expected_len: Some(expected_len),
        }
    }

    /// Bytes as written to the channel: the text, CRLF-terminated if not
    /// already.
    pub fn wire_bytes(&self) -> Vec<u8> {
        let mut bytes = self.text.as_bytes().to_vec();
        if !bytes.ends_with(b"\r\n") {
            bytes.extend_from_slice(b"\r\n");
        }
        bytes
    }
}

/// Parse a numeric-stack reply.
///
/// The console prints stack contents as whitespace-delimited tokens where the
/// first token is the echoed word, not data; it is stripped by convention.
/// Every remaining token must parse as a signed integer.
pub fn parse_numeric_reply(reply: &str) -> Result<Vec<i64>, ProtocolError> {
    let mut tokens = reply.split_whitespace();
    tokens.next(); // leading token is not data
    tokens
        .map(|t| {
            t.parse::<i64>()
                .map_err(|_| ProtocolError::Protocol(format!("non-numeric token {t:?} in reply")))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_wire_bytes_appends_crlf() {
        let cmd = Command::new("status", Duration::from_millis(100));
        assert_eq!(cmd.wire_bytes(), b"status\r\n".to_vec());
    }

    #[test]
    fn test_wire_bytes_keeps_existing_crlf() {
        let cmd = Command::new("status\r\n", Duration::from_millis(100));
        assert_eq!(cmd.wire_bytes(), b"status\r\n".to_vec());
    }

    #[test]
    fn test_parse_numeric_reply_strips_first_token() {
        let values = parse_numeric_reply("hbuf 3 512 -7").unwrap();
        assert_eq!(values, vec![3, 512, -7]);
    }

    #[test]
    fn test_parse_numeric_reply_empty() {
        assert_eq!(parse_numeric_reply("").unwrap(), Vec::<i64>::new());
        assert_eq!(parse_numeric_reply("ok").unwrap(), Vec::<i64>::new());
    }

    #[test]
    fn test_parse_numeric_reply_rejects_garbage() {
        assert!(parse_numeric_reply("ok 12 banana").is_err());
    }
}
