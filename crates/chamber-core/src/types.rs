//! Common types for Chamber
//!
//! This module contains the fundamental types shared between the convolution
//! engines, the IR library format, and the reverb coordinator.

/// Audio sample type (32-bit float for processing, stored as 16-bit in library files)
pub type Sample = f32;

/// Descriptive information about an impulse response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IrMetadata {
    /// Short name for the IR
    pub name: String,
    /// Longer description
    pub description: String,
    /// Category (e.g., "Hall", "Plate", "Room")
    pub category: String,
    /// Additional tags for organization
    pub tags: Vec<String>,
    /// Sample rate in Hz
    pub sample_rate: f64,
    /// Number of audio channels
    pub channels: usize,
    /// Samples per channel
    pub length: usize,
}

/// A single impulse response with metadata and decoded audio data.
///
/// Audio data is planar: `data[channel][sample]`. For mono, `data[0]`
/// contains all samples; for stereo, `data[0]` is left and `data[1]` is
/// right. All channels have the same length.
#[derive(Debug, Clone)]
pub struct ImpulseResponse {
    pub metadata: IrMetadata,
    pub data: Vec<Vec<Sample>>,
}

impl ImpulseResponse {
    /// Create an impulse response from planar audio data.
    ///
    /// The channel count and length fields are derived from the shape of
    /// `data`; the remaining metadata fields start empty.
    pub fn new(name: impl Into<String>, sample_rate: f64, data: Vec<Vec<Sample>>) -> Self {
        let channels = data.len();
        let length = data.first().map(|ch| ch.len()).unwrap_or(0);

        Self {
            metadata: IrMetadata {
                name: name.into(),
                sample_rate,
                channels,
                length,
                ..Default::default()
            },
            data,
        }
    }

    /// Duration of the impulse response in seconds.
    ///
    /// Returns 0.0 for a non-positive sample rate.
    pub fn duration(&self) -> f64 {
        if self.metadata.sample_rate <= 0.0 {
            return 0.0;
        }
        self.metadata.length as f64 / self.metadata.sample_rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_derives_shape() {
        let ir = ImpulseResponse::new("Test", 48000.0, vec![vec![0.0; 128], vec![0.0; 128]]);
        assert_eq!(ir.metadata.channels, 2);
        assert_eq!(ir.metadata.length, 128);
        assert_eq!(ir.metadata.name, "Test");
    }

    #[test]
    fn test_duration() {
        let ir = ImpulseResponse::new("Two seconds", 48000.0, vec![vec![0.0; 96000]]);
        assert!((ir.duration() - 2.0).abs() < 1e-3);
    }

    #[test]
    fn test_duration_zero_rate() {
        let ir = ImpulseResponse::new("Broken", 0.0, vec![vec![0.0; 96000]]);
        assert_eq!(ir.duration(), 0.0);
    }
}
