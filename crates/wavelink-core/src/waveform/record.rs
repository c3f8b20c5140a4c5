//! Decoded waveform records

use serde::{Deserialize, Serialize};

use super::codec::Version;

/// One decoded, variable-length waveform record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaveformRecord {
    /// On-wire format version this record was decoded from
    pub version: Version,
    /// Front-end channel the waveform was captured on
    pub channel: u8,
    /// 48-bit capture timestamp, reassembled from the header words
    pub timestamp: u64,
    /// ADC samples
    pub samples: Vec<u16>,
    /// Per-sample over-threshold flags, parallel to `samples`
    pub over_threshold: Vec<bool>,
    /// Version-specific auxiliary fields
    pub aux: AuxFields,
}

/// Auxiliary header fields that exist only for some format versions.
///
/// The bit semantics are reproduced from the wire layout; fields whose
/// physical meaning is undocumented are carried as opaque values.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuxFields {
    /// Raw discriminator word (0x80, 0x81, 0x82)
    pub discriminator: Option<u16>,
    /// Trigger source nibble (0x81, 0x82)
    pub trigger_source: Option<u8>,
    /// Baseline sum block (0x81, 0x82)
    pub baseline_sum: Option<BaselineSum>,
    /// 48-bit charge stamp (0x82)
    pub charge_stamp: Option<u64>,
    /// Run status flags (0x90, 0x91, 0x92)
    pub status: Option<StatusFlags>,
    /// Trigger pattern bits, concatenated from several words (0x91, 0x92)
    pub pattern: Option<u64>,
}

/// Baseline-sum block from the extended headers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaselineSum {
    /// Whether the accumulator held a valid sum at readout
    pub valid: bool,
    /// Number of samples accumulated
    pub length: u8,
    /// Accumulated sum
    pub sum: u32,
}

/// Run status flags from the 0x9x headers. Opaque beyond the bit names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusFlags {
    /// "const" bit
    pub const_run: bool,
    /// "lc" (local coincidence) bit
    pub local_coincidence: bool,
    /// "syncReady" bit
    pub sync_ready: bool,
    /// Whole status word as received
    pub raw: u16,
}
