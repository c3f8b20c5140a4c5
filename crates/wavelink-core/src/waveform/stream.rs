//! Record stream reassembly
//!
//! Records come out of the device-side ring buffer in fixed-size pages that
//! split records at arbitrary word boundaries, including mid-header. The
//! reader buffers pages and yields whole decoded records, lazily and in
//! order, until the buffer reports no more data.

use byteorder::{BigEndian, ByteOrder};
use std::time::Duration;
use tracing::{debug, trace};

use super::codec;
use super::record::WaveformRecord;
use crate::protocol::{parse_numeric_reply, Command, CommandSession, ProtocolError};

/// Default page size of the device ring buffer, in 16-bit words
pub const DEFAULT_PAGE_WORDS: usize = 2048;

/// Source of ring-buffer pages.
///
/// `Ok(None)` means the buffer has no more data; this is the expected end
/// condition, not an error.
pub trait PagePuller {
    /// Pull the next page of words, or `None` when the buffer is empty
    fn pull_page(&mut self) -> Result<Option<Vec<u16>>, ProtocolError>;
}

/// Lazy, forward-only, non-restartable stream of waveform records.
pub struct RingBufferReader<P: PagePuller> {
    puller: P,
    buf: Vec<u16>,
    exhausted: bool,
}

impl<P: PagePuller> RingBufferReader<P> {
    /// Create a reader over a page source
    pub fn new(puller: P) -> Self {
        Self {
            puller,
            buf: Vec::new(),
            exhausted: false,
        }
    }

    /// Extract the next complete record, pulling pages as needed.
    ///
    /// Returns `Ok(None)` once the underlying buffer is exhausted; further
    /// calls keep returning `Ok(None)`.
    pub fn next_record(&mut self) -> Result<Option<WaveformRecord>, ProtocolError> {
        if self.exhausted {
            return Ok(None);
        }

        loop {
            // Leading zero words are flush artifacts, not data.
            let lead = self.buf.iter().take_while(|w| **w == 0).count();
            if lead > 0 {
                trace!(words = lead, "stripping zero padding");
                self.buf.drain(..lead);
            }

            if self.buf.len() >= 2 {
                let (_, total) = codec::peek_header(self.buf[0], self.buf[1])?;
                if self.buf.len() >= total {
                    let words: Vec<u16> = self.buf.drain(..total).collect();
                    let record = codec::decode(&words)?;
                    return Ok(Some(record));
                }
            }

            match self.puller.pull_page()? {
                Some(page) => {
                    if !page.is_empty() && page.iter().all(|w| *w == 0) {
                        // A fully zeroed page marks a buffer flush; anything
                        // buffered before it is stale.
                        self.buf.clear();
                    } else {
                        self.buf.extend_from_slice(&page);
                    }
                }
                None => {
                    debug!("ring buffer exhausted");
                    self.exhausted = true;
                    return Ok(None);
                }
            }
        }
    }
}

impl<P: PagePuller> Iterator for RingBufferReader<P> {
    type Item = Result<WaveformRecord, ProtocolError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_record() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => None,
            Err(e) => {
                self.exhausted = true;
                Some(Err(e))
            }
        }
    }
}

/// Page source backed by a command session.
///
/// Asks the device how many pages are pending with a text query, then pops
/// one page as a binary reply with a known payload length.
pub struct CommandPagePuller<'a> {
    session: &'a mut CommandSession,
    avail_command: String,
    pop_command: String,
    page_words: usize,
    timeout: Duration,
}

impl<'a> CommandPagePuller<'a> {
    /// Create a puller using the default device vocabulary
    pub fn new(session: &'a mut CommandSession) -> Self {
        let timeout = session.default_timeout();
        Self {
            session,
            avail_command: "hbuf avail".to_string(),
            pop_command: "hbuf pop".to_string(),
            page_words: DEFAULT_PAGE_WORDS,
            timeout,
        }
    }

    /// Override the page size in words
    pub fn with_page_words(mut self, page_words: usize) -> Self {
        self.page_words = page_words;
        self
    }
}

impl PagePuller for CommandPagePuller<'_> {
    fn pull_page(&mut self) -> Result<Option<Vec<u16>>, ProtocolError> {
        let query = Command::new(&self.avail_command, self.timeout);
        let reply = self.session.execute_text(&query)?;
        let values = parse_numeric_reply(&reply)?;
        let pending = *values.first().ok_or(ProtocolError::InvalidResponse)?;
        if pending == 0 {
            return Ok(None);
        }

        let page_bytes = self.page_words * 2;
        let pop = Command::with_payload(&self.pop_command, self.timeout, page_bytes);
        let bytes = self.session.execute(&pop)?;
        if bytes.len() < page_bytes {
            return Err(ProtocolError::InvalidResponse);
        }

        let mut words = vec![0u16; self.page_words];
        BigEndian::read_u16_into(&bytes[..page_bytes], &mut words);
        Ok(Some(words))
    }
}
