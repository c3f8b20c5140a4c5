//! Waveform Records
//!
//! Versioned binary record decoding and streaming reassembly from the
//! device-side ring buffer.

pub mod codec;
pub mod record;
pub mod stream;

pub use codec::{decode, peek_header, sample_count_for, word_count_for, Layout, Version};
pub use record::{AuxFields, BaselineSum, StatusFlags, WaveformRecord};
pub use stream::{CommandPagePuller, PagePuller, RingBufferReader, DEFAULT_PAGE_WORDS};
