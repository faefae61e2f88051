//! Overlap-add convolution
//!
//! The classical block-FFT method: one FFT sized to hold a full block plus
//! the IR, a precomputed IR spectrum, and an overlap buffer carrying the
//! convolution tail into the next block. Exact and simple, but every block
//! convolves the entire IR, so this engine is only appropriate when the IR
//! is about as short as the processing block. It doubles as the oracle for
//! the partitioned engine's tests.

use std::sync::Arc;

use realfft::num_complex::Complex;
use realfft::{ComplexToReal, RealFftPlanner, RealToComplex};

use super::{ConvolutionEngine, EngineError};
use crate::types::Sample;

/// Single-FFT overlap-add convolution engine for one channel.
pub struct OverlapAddConvolver {
    fft_size: usize,
    block_size: usize,
    ir_len: usize,

    forward: Arc<dyn RealToComplex<Sample>>,
    inverse: Arc<dyn ComplexToReal<Sample>>,

    /// Pre-computed IR spectrum, length fft_size/2 + 1
    ir_spectrum: Vec<Complex<Sample>>,
    /// Convolution tail carried into the next block, length ir_len - 1
    overlap: Vec<Sample>,

    // Scratch
    fft_in: Vec<Sample>,
    spectrum: Vec<Complex<Sample>>,
    time_out: Vec<Sample>,
}

impl OverlapAddConvolver {
    /// Create an engine for one IR channel processing `block_size` samples
    /// at a time.
    ///
    /// The FFT is sized to `max(next_pow2(2*block_size - 1),
    /// next_pow2(ir_len))` so a block and the IR tail always fit without
    /// wraparound.
    pub fn new(ir: &[Sample], block_size: usize) -> Result<Self, EngineError> {
        if ir.is_empty() {
            return Err(EngineError::InvalidParameter(
                "impulse response cannot be empty".to_string(),
            ));
        }
        if block_size == 0 {
            return Err(EngineError::InvalidParameter(
                "block size must be at least 1".to_string(),
            ));
        }

        let ir_len = ir.len();
        let fft_size = (2 * block_size - 1)
            .next_power_of_two()
            .max(ir_len.next_power_of_two());
        let spectrum_len = fft_size / 2 + 1;

        let mut planner = RealFftPlanner::<Sample>::new();
        let forward = planner.plan_fft_forward(fft_size);
        let inverse = planner.plan_fft_inverse(fft_size);

        let mut engine = Self {
            fft_size,
            block_size,
            ir_len,
            forward,
            inverse,
            ir_spectrum: vec![Complex::new(0.0, 0.0); spectrum_len],
            overlap: vec![0.0; ir_len - 1],
            fft_in: vec![0.0; fft_size],
            spectrum: vec![Complex::new(0.0, 0.0); spectrum_len],
            time_out: vec![0.0; fft_size],
        };

        engine.fft_in[..ir_len].copy_from_slice(ir);
        engine.fft_in[ir_len..].fill(0.0);
        engine
            .forward
            .process(&mut engine.fft_in, &mut engine.ir_spectrum)?;

        Ok(engine)
    }

    /// Configured block size.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Process a block. Inputs longer than the configured block size are
    /// handled in block-sized chunks.
    pub fn process(&mut self, input: &[Sample], output: &mut [Sample]) -> Result<(), EngineError> {
        assert_eq!(
            input.len(),
            output.len(),
            "input and output must have the same length"
        );

        for (chunk_in, chunk_out) in input
            .chunks(self.block_size)
            .zip(output.chunks_mut(self.block_size))
        {
            self.process_chunk(chunk_in, chunk_out)?;
        }
        Ok(())
    }

    fn process_chunk(&mut self, input: &[Sample], output: &mut [Sample]) -> Result<(), EngineError> {
        let n = input.len();

        self.fft_in[..n].copy_from_slice(input);
        self.fft_in[n..].fill(0.0);

        self.forward.process(&mut self.fft_in, &mut self.spectrum)?;

        for (s, &ir) in self.spectrum.iter_mut().zip(self.ir_spectrum.iter()) {
            *s *= ir;
        }

        self.inverse.process(&mut self.spectrum, &mut self.time_out)?;

        let scale = 1.0 / self.fft_size as Sample;

        // Emit this block summed with the carried tail
        for (i, out) in output.iter_mut().enumerate() {
            let carried = if i < self.overlap.len() {
                self.overlap[i]
            } else {
                0.0
            };
            *out = self.time_out[i] * scale + carried;
        }

        // Carry the new tail for the next block
        let carry = (self.ir_len - 1).min(self.fft_size - n);
        for i in 0..carry {
            self.overlap[i] = self.time_out[n + i] * scale;
        }

        Ok(())
    }

    /// Latency in samples; equals the configured block size.
    pub fn latency(&self) -> usize {
        self.block_size
    }

    /// Clear the overlap and scratch buffers.
    pub fn reset(&mut self) {
        self.overlap.fill(0.0);
        self.fft_in.fill(0.0);
        self.spectrum.fill(Complex::new(0.0, 0.0));
        self.time_out.fill(0.0);
    }
}

impl ConvolutionEngine for OverlapAddConvolver {
    fn process(&mut self, input: &[Sample], output: &mut [Sample]) -> Result<(), EngineError> {
        OverlapAddConvolver::process(self, input, output)
    }

    fn latency(&self) -> usize {
        OverlapAddConvolver::latency(self)
    }

    fn reset(&mut self) {
        OverlapAddConvolver::reset(self)
    }
}
