//! Tunables the standard fixes as constants, exposed as named, defaulted configuration
//! rather than bare literals scattered through the engines.

use std::time::Duration;

/// CCM parameters for CCMP (802.11-2007 §8.3.3.3.2: "CCMP uses M = 8, L = 2").
#[derive(Debug, Clone, Copy)]
pub struct CcmParams {
    /// MIC length in octets.
    pub mic_len: usize,
    /// Length-field width in octets, determining the counter field width (`16 - 1 - L`).
    pub length_field_len: usize,
}

impl Default for CcmParams {
    fn default() -> Self {
        CcmParams { mic_len: 8, length_field_len: 2 }
    }
}

/// Michael-failure countermeasures tuning (802.11-2007 §8.3.2.4).
#[derive(Debug, Clone, Copy)]
pub struct CountermeasuresConfig {
    /// Width of the window within which a second Michael failure triggers countermeasures.
    pub window: Duration,
}

impl Default for CountermeasuresConfig {
    fn default() -> Self {
        CountermeasuresConfig { window: Duration::from_secs(60) }
    }
}

/// Buffer-segment sizing used when a caller doesn't have its own pool-derived capacity.
#[derive(Debug, Clone, Copy)]
pub struct BufferParams {
    pub segment_capacity: usize,
}

impl Default for BufferParams {
    fn default() -> Self {
        BufferParams { segment_capacity: 2048 }
    }
}

/// Aggregate configuration threaded through the engines and the countermeasures controller.
#[derive(Debug, Clone, Copy, Default)]
pub struct EngineConfig {
    pub ccm: CcmParams,
    pub countermeasures: CountermeasuresConfig,
    pub buffers: BufferParams,
}
