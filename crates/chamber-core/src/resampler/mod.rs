//! Sample rate conversion for impulse responses
//!
//! Windowed-sinc interpolation with a Blackman taper. IRs are stored at
//! whatever rate they were recorded at; when the engine runs at a different
//! rate the IR is resampled once at load time, so quality matters far more
//! than speed here.

use rayon::prelude::*;
use thiserror::Error;

use crate::types::Sample;

/// Errors from the resampler
#[derive(Error, Debug)]
pub enum ResampleError {
    /// Source or destination rate was not positive
    #[error("sample rates must be positive: src={src} Hz, dst={dst} Hz")]
    InvalidRate { src: f64, dst: f64 },
}

/// Default number of sinc lobes on each side of the filter kernel.
/// Good balance of quality and speed.
const DEFAULT_LOBES: usize = 16;

/// Windowed-sinc resampler.
///
/// Deterministic and stateless: the same input always produces the same
/// output, and instances can be shared freely across threads.
#[derive(Debug, Clone, Copy)]
pub struct Resampler {
    /// Quality parameter: number of sinc lobes on each side
    sinc_lobes: usize,
}

impl Resampler {
    /// Create a resampler with the default quality.
    pub fn new() -> Self {
        Self {
            sinc_lobes: DEFAULT_LOBES,
        }
    }

    /// Create a resampler with a specific quality.
    ///
    /// More lobes mean higher quality and slower conversion; the value is
    /// clamped to [4, 64].
    pub fn with_quality(lobes: usize) -> Self {
        Self {
            sinc_lobes: lobes.clamp(4, 64),
        }
    }

    /// Number of sinc lobes this instance uses.
    pub fn lobes(&self) -> usize {
        self.sinc_lobes
    }

    /// Resample `data` from `src_rate` to `dst_rate`.
    ///
    /// The output length is `round(len * dst_rate / src_rate)`. An identity
    /// ratio returns a plain copy and empty input returns empty.
    pub fn resample(
        &self,
        data: &[Sample],
        src_rate: f64,
        dst_rate: f64,
    ) -> Result<Vec<Sample>, ResampleError> {
        if src_rate <= 0.0 || dst_rate <= 0.0 {
            return Err(ResampleError::InvalidRate {
                src: src_rate,
                dst: dst_rate,
            });
        }

        if data.is_empty() {
            return Ok(Vec::new());
        }

        if src_rate == dst_rate {
            return Ok(data.to_vec());
        }

        let ratio = dst_rate / src_rate;
        let input_len = data.len();
        let output_len = (input_len as f64 * ratio).round() as usize;

        if output_len == 0 {
            return Ok(Vec::new());
        }

        // Downsampling widens the filter (scales the sinc down in frequency)
        // to suppress aliasing; upsampling uses the unit filter.
        let filter_scale = ratio.min(1.0);
        let window_radius = self.sinc_lobes as f64 / filter_scale;

        let mut output = vec![0.0; output_len];

        for (i, out) in output.iter_mut().enumerate() {
            let input_pos = i as f64 / ratio;

            let start = ((input_pos - window_radius).floor() as i64).max(0) as usize;
            let end = ((input_pos + window_radius).ceil() as usize).min(input_len - 1);

            let mut sum = 0.0f64;
            let mut weight_sum = 0.0f64;

            for (j, &sample) in data.iter().enumerate().take(end + 1).skip(start) {
                let d = input_pos - j as f64;
                let weight = sinc(d * filter_scale) * blackman(d / window_radius);
                sum += sample as f64 * weight;
                weight_sum += weight;
            }

            if weight_sum > 0.0 {
                *out = (sum / weight_sum) as Sample;
            }
        }

        Ok(output)
    }

    /// Resample planar multi-channel audio (`data[channel][sample]`).
    ///
    /// Channels are independent, so they are converted in parallel.
    pub fn resample_multichannel(
        &self,
        data: &[Vec<Sample>],
        src_rate: f64,
        dst_rate: f64,
    ) -> Result<Vec<Vec<Sample>>, ResampleError> {
        data.par_iter()
            .map(|channel| self.resample(channel, src_rate, dst_rate))
            .collect()
    }
}

impl Default for Resampler {
    fn default() -> Self {
        Self::new()
    }
}

/// Expected output length for a resampling operation.
pub fn output_length(input_len: usize, src_rate: f64, dst_rate: f64) -> usize {
    if input_len == 0 {
        return 0;
    }
    (input_len as f64 * dst_rate / src_rate).round() as usize
}

/// Normalized sinc: sin(pi*x) / (pi*x), with sinc(0) = 1.
fn sinc(x: f64) -> f64 {
    if x.abs() < 1e-10 {
        return 1.0;
    }
    let pix = std::f64::consts::PI * x;
    pix.sin() / pix
}

/// Blackman window over [-1, 1]; zero outside.
fn blackman(x: f64) -> f64 {
    if !(-1.0..=1.0).contains(&x) {
        return 0.0;
    }
    let t = (x + 1.0) / 2.0;
    0.42 - 0.5 * (std::f64::consts::TAU * t).cos() + 0.08 * (2.0 * std::f64::consts::TAU * t).cos()
}
