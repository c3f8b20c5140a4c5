//! Waveform record codec
//!
//! Pure, stateless decoding of the versioned binary record format. The
//! version tag lives in the high byte of word 0; each version fixes a
//! (header, footer, words-per-sample) layout, so record length and sample
//! count convert both ways exactly.

use serde::{Deserialize, Serialize};

use super::record::{AuxFields, BaselineSum, StatusFlags, WaveformRecord};
use crate::protocol::ProtocolError;

/// Supported on-wire record format versions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Version {
    /// Tag 0x80: compact header, two words per sample
    V80,
    /// Tag 0x81: extended header with discriminator and baseline sum
    V81,
    /// Tag 0x82: as 0x81 plus a charge stamp
    V82,
    /// Tag 0x90: compact header with run status flags
    V90,
    /// Tag 0x91: as 0x90 plus a 32-bit trigger pattern
    V91,
    /// Tag 0x92: as 0x91 with a 48-bit trigger pattern
    V92,
}

/// Per-version word layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    /// Header words before the sample block
    pub header_words: usize,
    /// Trailer words after the sample block
    pub footer_words: usize,
    /// Words occupied by each sample
    pub words_per_sample: usize,
}

impl Version {
    /// Resolve a version tag. Unknown tags are a fatal decode error, never
    /// guessed at.
    pub fn from_tag(tag: u8) -> Result<Version, ProtocolError> {
        match tag {
            0x80 => Ok(Version::V80),
            0x81 => Ok(Version::V81),
            0x82 => Ok(Version::V82),
            0x90 => Ok(Version::V90),
            0x91 => Ok(Version::V91),
            0x92 => Ok(Version::V92),
            other => Err(ProtocolError::UnknownFormatVersion(other)),
        }
    }

    /// The on-wire tag for this version
    pub fn tag(&self) -> u8 {
        match self {
            Version::V80 => 0x80,
            Version::V81 => 0x81,
            Version::V82 => 0x82,
            Version::V90 => 0x90,
            Version::V91 => 0x91,
            Version::V92 => 0x92,
        }
    }

    /// The fixed word layout for this version
    pub fn layout(&self) -> Layout {
        match self {
            Version::V80 => Layout {
                header_words: 6,
                footer_words: 2,
                words_per_sample: 2,
            },
            Version::V81 => Layout {
                header_words: 13,
                footer_words: 2,
                words_per_sample: 1,
            },
            Version::V82 => Layout {
                header_words: 17,
                footer_words: 2,
                words_per_sample: 1,
            },
            Version::V90 => Layout {
                header_words: 6,
                footer_words: 2,
                words_per_sample: 2,
            },
            Version::V91 | Version::V92 => Layout {
                header_words: 8,
                footer_words: 2,
                words_per_sample: 2,
            },
        }
    }
}

/// Total record length in words for `sample_count` samples
pub fn word_count_for(sample_count: usize, version: Version) -> usize {
    let layout = version.layout();
    layout.header_words + layout.footer_words + layout.words_per_sample * sample_count
}

/// Sample count recovered from a total record length.
///
/// Exact inverse of [`word_count_for`]; lengths that no sample count could
/// produce are rejected.
pub fn sample_count_for(word_count: usize, version: Version) -> Result<usize, ProtocolError> {
    let layout = version.layout();
    let fixed = layout.header_words + layout.footer_words;
    let body = word_count.checked_sub(fixed).ok_or(ProtocolError::RecordLength {
        tag: version.tag(),
        needed: fixed,
        got: word_count,
    })?;
    if body % layout.words_per_sample != 0 {
        return Err(ProtocolError::RecordLength {
            tag: version.tag(),
            needed: fixed + (body / layout.words_per_sample + 1) * layout.words_per_sample,
            got: word_count,
        });
    }
    Ok(body / layout.words_per_sample)
}

/// Inspect a two-word record header and return the version and total word
/// count of the record it starts.
pub fn peek_header(word0: u16, word1: u16) -> Result<(Version, usize), ProtocolError> {
    let version = Version::from_tag((word0 >> 8) as u8)?;
    let sample_count = (word1 & 0x0FFF) as usize;
    Ok((version, word_count_for(sample_count, version)))
}

/// Decode one complete record.
///
/// Pure function of its input: `words` must hold exactly the record, as
/// delimited by [`peek_header`].
pub fn decode(words: &[u16]) -> Result<WaveformRecord, ProtocolError> {
    if words.len() < 2 {
        return Err(ProtocolError::InvalidResponse);
    }
    let version = Version::from_tag((words[0] >> 8) as u8)?;
    let channel = (words[0] & 0x00FF) as u8;
    let sample_count = (words[1] & 0x0FFF) as usize;

    let expected = word_count_for(sample_count, version);
    if words.len() != expected {
        return Err(ProtocolError::RecordLength {
            tag: version.tag(),
            needed: expected,
            got: words.len(),
        });
    }

    // 48-bit timestamp spread over words 2..=4, most significant first.
    let timestamp = (u64::from(words[2]) << 32) | (u64::from(words[3]) << 16) | u64::from(words[4]);

    let layout = version.layout();
    let body = &words[layout.header_words..expected - layout.footer_words];
    let footer = &words[expected - layout.footer_words..];

    let (samples, over_threshold) = decode_samples(body, sample_count, layout.words_per_sample);
    let aux = decode_aux(version, words, footer);

    Ok(WaveformRecord {
        version,
        channel,
        timestamp,
        samples,
        over_threshold,
        aux,
    })
}

fn decode_samples(
    body: &[u16],
    sample_count: usize,
    words_per_sample: usize,
) -> (Vec<u16>, Vec<bool>) {
    let mut samples = Vec::with_capacity(sample_count);
    let mut flags = Vec::with_capacity(sample_count);
    match words_per_sample {
        // Alternating sample word / flag word.
        2 => {
            for pair in body.chunks_exact(2) {
                samples.push(pair[0] & 0x0FFF);
                flags.push(pair[1] & 0x0001 != 0);
            }
        }
        // Sample and flag packed into one word.
        _ => {
            for word in body {
                samples.push(word & 0x0FFF);
                flags.push((word >> 12) & 0x1 != 0);
            }
        }
    }
    (samples, flags)
}

fn decode_aux(version: Version, words: &[u16], footer: &[u16]) -> AuxFields {
    let mut aux = AuxFields::default();
    match version {
        Version::V80 => {
            aux.discriminator = Some(words[5]);
        }
        Version::V81 | Version::V82 => {
            aux.discriminator = Some(words[5]);
            aux.trigger_source = Some(((words[1] >> 12) & 0xF) as u8);
            aux.baseline_sum = Some(BaselineSum {
                valid: words[6] & 0x8000 != 0,
                length: (words[6] & 0x00FF) as u8,
                sum: (u32::from(words[7]) << 16) | u32::from(words[8]),
            });
            if version == Version::V82 {
                // Charge stamp embedded across words 13..=15.
                aux.charge_stamp = Some(
                    (u64::from(words[13]) << 32)
                        | (u64::from(words[14]) << 16)
                        | u64::from(words[15]),
                );
            }
        }
        Version::V90 | Version::V91 | Version::V92 => {
            let status = words[5];
            aux.status = Some(StatusFlags {
                const_run: status & 0x0001 != 0,
                local_coincidence: status & 0x0002 != 0,
                sync_ready: status & 0x0004 != 0,
                raw: status,
            });
            match version {
                Version::V91 => {
                    aux.pattern = Some((u64::from(words[6]) << 16) | u64::from(words[7]));
                }
                Version::V92 => {
                    // The low fragment of the pattern lives in the first
                    // trailer word.
                    aux.pattern = Some(
                        (u64::from(words[6]) << 32)
                            | (u64::from(words[7]) << 16)
                            | u64::from(footer[0]),
                    );
                }
                _ => {}
            }
        }
    }
    aux
}

/// All versions, for table-driven tests and diagnostics
pub const ALL_VERSIONS: [Version; 6] = [
    Version::V80,
    Version::V81,
    Version::V82,
    Version::V90,
    Version::V91,
    Version::V92,
];
