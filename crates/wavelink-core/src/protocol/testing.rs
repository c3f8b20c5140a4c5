//! In-memory channel for protocol tests.
//!
//! The channel side is handed to a session; the handle side lets a test
//! script responses and inspect everything the session wrote.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::channel::TransportChannel;

#[derive(Default)]
struct MockState {
    rx: VecDeque<u8>,
    tx: Vec<u8>,
    echo: bool,
    replies: VecDeque<Vec<u8>>,
}

/// Scripted stand-in for a serial or TCP channel.
#[derive(Clone)]
pub(crate) struct MockChannel {
    state: Arc<Mutex<MockState>>,
}

/// Test-side handle to a [`MockChannel`].
#[derive(Clone)]
pub(crate) struct MockHandle {
    state: Arc<Mutex<MockState>>,
}

impl MockChannel {
    /// A channel that does not echo writes.
    pub fn new() -> (Self, MockHandle) {
        let state = Arc::new(Mutex::new(MockState::default()));
        (
            Self {
                state: state.clone(),
            },
            MockHandle { state },
        )
    }

    /// A channel that echoes every written byte back, like the device console.
    pub fn echoing() -> (Self, MockHandle) {
        let (channel, handle) = Self::new();
        handle.state.lock().unwrap().echo = true;
        (channel, handle)
    }
}

impl MockHandle {
    /// Queue a reply to be delivered after the next write.
    pub fn queue_reply(&self, bytes: impl Into<Vec<u8>>) {
        self.state.lock().unwrap().replies.push_back(bytes.into());
    }

    /// Make bytes immediately available for reading.
    pub fn push_rx(&self, bytes: &[u8]) {
        self.state.lock().unwrap().rx.extend(bytes.iter().copied());
    }

    /// Everything the session has written so far.
    pub fn tx(&self) -> Vec<u8> {
        self.state.lock().unwrap().tx.clone()
    }

    /// Number of times `needle` occurs in the written byte stream.
    pub fn tx_count(&self, needle: &[u8]) -> usize {
        let tx = self.tx();
        if needle.is_empty() {
            return 0;
        }
        tx.windows(needle.len()).filter(|w| *w == needle).count()
    }
}

impl Read for MockChannel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.state.lock().unwrap();
        let n = buf.len().min(state.rx.len());
        for slot in buf.iter_mut().take(n) {
            *slot = state.rx.pop_front().unwrap();
        }
        Ok(n)
    }
}

impl Write for MockChannel {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.state.lock().unwrap();
        state.tx.extend_from_slice(buf);
        if state.echo {
            state.rx.extend(buf.iter().copied());
        }
        if let Some(reply) = state.replies.pop_front() {
            state.rx.extend(reply);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl TransportChannel for MockChannel {
    fn set_timeout(&mut self, _timeout: Duration) -> io::Result<()> {
        Ok(())
    }

    fn bytes_to_read(&mut self) -> io::Result<u32> {
        Ok(self.state.lock().unwrap().rx.len() as u32)
    }

    fn clear_input_buffer(&mut self) -> io::Result<()> {
        self.state.lock().unwrap().rx.clear();
        Ok(())
    }

    fn shutdown(&mut self) -> io::Result<()> {
        Ok(())
    }
}
