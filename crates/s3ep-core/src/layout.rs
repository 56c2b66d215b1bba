//! Counter windows, physical part blocks and the persisted part layout
//!
//! Every logical part owns a fixed counter window so that concurrent parts
//! never coordinate on a running byte offset:
//!
//! ```text
//! window(part, generation) = ((generation * 10000) + part - 1) * standard_part_size
//! ```
//!
//! and a fixed block of physical part numbers, so sorting physical parts
//! ascending always yields logical order:
//!
//! ```text
//! block(part) = [(part - 1) * S + 1, part * S]     S = ceil(standard_part_size / segment_size)
//! ```
//!
//! Because windows are reserved analytically, a reader needs the real length
//! of each logical part to locate its ciphertext. That is what [`PartLayout`]
//! records, as a run-length string such as `1-12:8388608,13:1048576`.

use crate::{CoreError, EngineConfig, Result};
use s3ep_backend::MAX_PART_NUMBER;
use std::fmt;
use std::ops::RangeInclusive;
use std::str::FromStr;

/// Start of the counter window for a logical part
pub fn counter_window(standard_part_size: u64, part_number: u32, generation: u32) -> Result<u64> {
    if part_number == 0 {
        return Err(CoreError::PartNumberOutOfRange {
            part_number,
            max: MAX_PART_NUMBER,
        });
    }
    let overflow = || {
        CoreError::CounterOverflow(format!(
            "window for part {} generation {} exceeds the counter range",
            part_number, generation
        ))
    };
    u64::from(generation)
        .checked_mul(u64::from(MAX_PART_NUMBER))
        .and_then(|slot| slot.checked_add(u64::from(part_number - 1)))
        .and_then(|slot| slot.checked_mul(standard_part_size))
        .ok_or_else(overflow)
}

/// Mapping between logical parts, counter windows and physical part numbers
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PartGeometry {
    pub standard_part_size: u64,
    pub segments_per_part: u32,
}

impl PartGeometry {
    /// Derive the geometry from a validated configuration
    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        config.validate()?;
        let segments_per_part = u32::try_from(config.segments_per_part())
            .map_err(|_| CoreError::Configuration("too many segments per part".to_string()))?;
        Ok(Self {
            standard_part_size: config.standard_part_size,
            segments_per_part,
        })
    }

    /// Highest logical part number whose block still fits under 10000
    pub fn max_logical_part(&self) -> u32 {
        MAX_PART_NUMBER / self.segments_per_part
    }

    /// Check a client-supplied logical part number
    pub fn check_part_number(&self, part_number: u32) -> Result<()> {
        let max = self.max_logical_part();
        if part_number == 0 || part_number > max {
            return Err(CoreError::PartNumberOutOfRange { part_number, max });
        }
        Ok(())
    }

    /// Start of the counter window for a logical part
    pub fn window(&self, part_number: u32, generation: u32) -> Result<u64> {
        counter_window(self.standard_part_size, part_number, generation)
    }

    /// Physical part numbers owned by a logical part
    pub fn physical_block(&self, part_number: u32) -> Result<RangeInclusive<u32>> {
        self.check_part_number(part_number)?;
        let first = (part_number - 1) * self.segments_per_part + 1;
        Ok(first..=part_number * self.segments_per_part)
    }

    /// Logical part that owns a physical part number
    pub fn logical_for_physical(&self, physical: u32) -> u32 {
        (physical.saturating_sub(1)) / self.segments_per_part + 1
    }
}

/// One logical part as seen by a reader
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LayoutEntry {
    pub part_number: u32,
    pub generation: u32,
    /// Plaintext (and ciphertext) length in bytes
    pub size: u64,
}

/// Ordered logical parts of a completed multipart object
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PartLayout {
    entries: Vec<LayoutEntry>,
}

impl PartLayout {
    /// Build from entries in ascending part order
    pub fn new(entries: Vec<LayoutEntry>) -> Result<Self> {
        if entries.windows(2).any(|w| w[0].part_number >= w[1].part_number) {
            return Err(CoreError::InvalidMetadata(
                "part layout must be strictly ascending".to_string(),
            ));
        }
        Ok(Self { entries })
    }

    pub fn entries(&self) -> &[LayoutEntry] {
        &self.entries
    }

    /// Total object length described by the layout
    pub fn total_size(&self) -> u64 {
        self.entries.iter().map(|e| e.size).sum()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Display for PartLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut i = 0;
        let mut first = true;
        while i < self.entries.len() {
            let start = self.entries[i];
            let mut end = i;
            while end + 1 < self.entries.len() {
                let next = self.entries[end + 1];
                if next.part_number == self.entries[end].part_number + 1
                    && next.size == start.size
                    && next.generation == start.generation
                {
                    end += 1;
                } else {
                    break;
                }
            }

            if !first {
                f.write_str(",")?;
            }
            first = false;
            if end == i {
                write!(f, "{}:{}", start.part_number, start.size)?;
            } else {
                write!(f, "{}-{}:{}", start.part_number, self.entries[end].part_number, start.size)?;
            }
            if start.generation != 0 {
                write!(f, "@{}", start.generation)?;
            }
            i = end + 1;
        }
        Ok(())
    }
}

impl FromStr for PartLayout {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = |run: &str| CoreError::InvalidMetadata(format!("bad part layout entry {:?}", run));
        let mut entries = Vec::new();

        for run in s.split(',').map(str::trim).filter(|r| !r.is_empty()) {
            let (range, rest) = run.split_once(':').ok_or_else(|| invalid(run))?;
            let (size, generation) = match rest.split_once('@') {
                Some((size, generation)) => (size, generation.parse().map_err(|_| invalid(run))?),
                None => (rest, 0),
            };
            let size: u64 = size.parse().map_err(|_| invalid(run))?;
            let (start, end): (u32, u32) = match range.split_once('-') {
                Some((a, b)) => (
                    a.parse().map_err(|_| invalid(run))?,
                    b.parse().map_err(|_| invalid(run))?,
                ),
                None => {
                    let n = range.parse().map_err(|_| invalid(run))?;
                    (n, n)
                }
            };
            if start == 0 || end < start || end > MAX_PART_NUMBER {
                return Err(invalid(run));
            }
            entries.extend((start..=end).map(|part_number| LayoutEntry {
                part_number,
                generation,
                size,
            }));
        }

        Self::new(entries)
    }
}
