//! Engine configuration: stream format and queue sizing.

use crate::invariant_ppt::{assert_invariant, INGRESS_VALIDATION};

/// Largest block the scheduler accepts.
pub const MAX_BLOCK_SIZE: usize = 8192;

/// Largest channel count on either side of the stream.
pub const MAX_CHANNELS: usize = 32;

/// Stream format and sizing for one engine session.
///
/// Defaults match a typical Pd host: 48 kHz, 64-frame blocks, stereo out, no input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct EngineConfig {
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Frames per block.
    pub block_size: usize,
    /// Interleaved input channels delivered to `adc~` nodes.
    pub channels_in: usize,
    /// Interleaved output channels written by `dac~` nodes.
    pub channels_out: usize,
    /// Messages held while the audio context is not consuming them.
    pub message_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            block_size: 64,
            channels_in: 0,
            channels_out: 2,
            message_capacity: 256,
        }
    }
}

/// Errors for an unusable configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// Sample rate outside 8 kHz..=384 kHz.
    #[error("sample rate {0} Hz is out of range")]
    SampleRate(u32),
    /// Block size zero or above [`MAX_BLOCK_SIZE`].
    #[error("block size {0} is out of range (1..={MAX_BLOCK_SIZE})")]
    BlockSize(usize),
    /// Channel count above [`MAX_CHANNELS`], or no output channel.
    #[error("{direction} channel count {count} is out of range")]
    Channels {
        /// "input" or "output".
        direction: &'static str,
        /// Requested count.
        count: usize,
    },
    /// Zero message capacity.
    #[error("message capacity must be at least 1")]
    MessageCapacity,
}

impl EngineConfig {
    /// Check every field against the supported ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(8_000..=384_000).contains(&self.sample_rate) {
            return Err(ConfigError::SampleRate(self.sample_rate));
        }
        if self.block_size == 0 || self.block_size > MAX_BLOCK_SIZE {
            return Err(ConfigError::BlockSize(self.block_size));
        }
        if self.channels_in > MAX_CHANNELS {
            return Err(ConfigError::Channels {
                direction: "input",
                count: self.channels_in,
            });
        }
        if self.channels_out == 0 || self.channels_out > MAX_CHANNELS {
            return Err(ConfigError::Channels {
                direction: "output",
                count: self.channels_out,
            });
        }
        if self.message_capacity == 0 {
            return Err(ConfigError::MessageCapacity);
        }
        assert_invariant(
            INGRESS_VALIDATION,
            self.block_size <= MAX_BLOCK_SIZE,
            "Engine config validated",
            Some("EngineConfig::validate"),
        );
        Ok(())
    }

    /// Interleaved samples in one output block.
    pub fn output_len(&self) -> usize {
        self.block_size * self.channels_out
    }

    /// Interleaved samples in one input block.
    pub fn input_len(&self) -> usize {
        self.block_size * self.channels_in
    }

    /// Wall-clock duration of one block.
    pub fn block_duration(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f64(self.block_size as f64 / self.sample_rate as f64)
    }
}
