//! Convolution engines
//!
//! Two engines implement the [`ConvolutionEngine`] trait:
//!
//! - [`LowLatencyConvolver`]: non-uniformly partitioned FFT convolution with
//!   modulo scheduling. Fixed latency of `2^min_block_order` samples and
//!   bounded per-callback work regardless of IR length. This is the engine
//!   for real-time use.
//! - [`OverlapAddConvolver`]: classical single-FFT overlap-add. Simple and
//!   exact, but the whole IR is convolved on every block, so it is only
//!   suitable for short IRs. Also serves as the oracle in engine tests.
//!
//! Dispatch is per-block through the trait object owned by the reverb
//! coordinator; engines are not shared between channels.

mod overlap_add;
mod partitioned;
mod stage;

pub use overlap_add::OverlapAddConvolver;
pub use partitioned::LowLatencyConvolver;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::Sample;

/// Errors from convolution engine construction and processing
#[derive(Error, Debug)]
pub enum EngineError {
    /// Bad construction parameters (orders out of range, empty IR, ...)
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// An FFT failed during processing. The engine is left in a consistent
    /// state and can be reset.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<realfft::FftError> for EngineError {
    fn from(err: realfft::FftError) -> Self {
        EngineError::Internal(err.to_string())
    }
}

/// Which convolution engine the reverb builds on the next IR load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EngineType {
    /// Partitioned low-latency engine; right choice for long IRs
    #[default]
    LowLatency,
    /// Single-FFT overlap-add; short IRs only
    OverlapAdd,
}

/// Common interface of the convolution engines.
///
/// `process` consumes input samples and produces the same number of output
/// samples; the output is the linear convolution of the input stream with the
/// engine's IR, delayed by [`latency`](Self::latency) samples.
pub trait ConvolutionEngine: Send {
    /// Process a block of samples. `input` and `output` must have the same
    /// length; any length is accepted, partial blocks are buffered
    /// internally.
    fn process(&mut self, input: &[Sample], output: &mut [Sample]) -> Result<(), EngineError>;

    /// Processing latency in samples.
    fn latency(&self) -> usize;

    /// Clear all internal buffers and scheduling state, restoring the engine
    /// to its freshly constructed state.
    fn reset(&mut self);
}
