//! Engine configuration

use crate::{CoreError, Result};
use s3ep_backend::MAX_PART_NUMBER;
use serde::{Deserialize, Serialize};

const MIB: usize = 1024 * 1024;

/// Sizing, retry and metadata settings for the encryption engine
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Counter window reserved for every logical part, and its size limit
    pub standard_part_size: u64,
    /// Size of a physical ciphertext segment
    pub segment_size: usize,
    /// Plaintext read increment
    pub read_size: usize,
    /// Smallest allowed non-final physical part
    pub min_segment_size: usize,
    /// Extra attempts for a failed segment upload
    pub upload_retries: u32,
    /// Extra attempts for the metadata self-copy
    pub attach_retries: u32,
    /// Base delay between retries in milliseconds, multiplied by the attempt
    pub retry_backoff_ms: u64,
    /// Prefix for encryption metadata keys
    pub metadata_prefix: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            standard_part_size: 64 * MIB as u64,
            segment_size: 8 * MIB,
            read_size: 64 * 1024,
            min_segment_size: 5 * MIB,
            upload_retries: 2,
            attach_retries: 3,
            retry_backoff_ms: 100,
            metadata_prefix: "s3ep-".to_string(),
        }
    }
}

impl EngineConfig {
    /// Check that the sizes are usable together
    pub fn validate(&self) -> Result<()> {
        if self.standard_part_size == 0 || self.segment_size == 0 || self.read_size == 0 {
            return Err(CoreError::Configuration(
                "standard_part_size, segment_size and read_size must be non-zero".to_string(),
            ));
        }
        if self.read_size > self.segment_size {
            return Err(CoreError::Configuration(format!(
                "read_size ({}) must not exceed segment_size ({})",
                self.read_size, self.segment_size
            )));
        }
        if self.segments_per_part() > u64::from(MAX_PART_NUMBER) {
            return Err(CoreError::Configuration(format!(
                "a {}-byte part split into {}-byte segments needs more than {} physical parts",
                self.standard_part_size, self.segment_size, MAX_PART_NUMBER
            )));
        }
        if self.metadata_prefix.is_empty() {
            return Err(CoreError::Configuration(
                "metadata_prefix must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Physical part numbers reserved per logical part
    pub fn segments_per_part(&self) -> u64 {
        self.standard_part_size.div_ceil(self.segment_size as u64)
    }
}
