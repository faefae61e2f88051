//! A single partition tier of the low-latency convolution engine
//!
//! Each stage owns a set of equally sized IR partitions and convolves them at
//! its own rate. A stage of order `o` works on partitions of `2^o` samples
//! with FFTs of `2^(o+1)`, and executes once every `2^o / latency` blocks.
//! The modulo counter spreads the larger FFTs across callbacks so the
//! per-callback cost stays bounded.

use std::sync::Arc;

use realfft::num_complex::Complex;
use realfft::{ComplexToReal, RealFftPlanner, RealToComplex};

use super::EngineError;
use crate::types::Sample;

pub(super) struct ConvolutionStage {
    /// FFT size = 2^(order+1), double the partition size
    fft_size: usize,
    /// Partition size = 2^order
    fft_size_half: usize,
    /// Starting sample index of this stage's partitions in the padded IR
    output_pos: usize,
    /// Engine latency (smallest partition size)
    latency: usize,

    /// Stage executes only when the counter is zero
    mod_counter: usize,
    /// Counter wrap mask: (2^order / latency) - 1
    mod_mask: usize,

    /// Pre-computed spectrum of each partition, length fft_size/2 + 1.
    /// Partitions are zero-prepended by half an FFT so the usable part of
    /// the circular convolution lands in the first half of the inverse
    /// transform.
    ir_spectra: Vec<Vec<Complex<Sample>>>,

    forward: Arc<dyn RealToComplex<Sample>>,
    inverse: Arc<dyn ComplexToReal<Sample>>,

    // Scratch buffers, preallocated so processing never allocates
    fft_in: Vec<Sample>,
    signal_spectrum: Vec<Complex<Sample>>,
    product: Vec<Complex<Sample>>,
    time_out: Vec<Sample>,
}

impl ConvolutionStage {
    /// Create a stage of the given order holding `count` partitions starting
    /// at `output_pos` samples into the padded IR.
    pub(super) fn new(order: usize, output_pos: usize, latency: usize, count: usize) -> Self {
        let fft_size = 1 << (order + 1);
        let fft_size_half = 1 << order;
        let spectrum_len = fft_size_half + 1;

        let mut planner = RealFftPlanner::<Sample>::new();
        let forward = planner.plan_fft_forward(fft_size);
        let inverse = planner.plan_fft_inverse(fft_size);

        Self {
            fft_size,
            fft_size_half,
            output_pos,
            latency,
            mod_counter: 0,
            mod_mask: fft_size_half / latency - 1,
            ir_spectra: vec![vec![Complex::new(0.0, 0.0); spectrum_len]; count],
            forward,
            inverse,
            fft_in: vec![0.0; fft_size],
            signal_spectrum: vec![Complex::new(0.0, 0.0); spectrum_len],
            product: vec![Complex::new(0.0, 0.0); spectrum_len],
            time_out: vec![0.0; fft_size],
        }
    }

    pub(super) fn fft_size(&self) -> usize {
        self.fft_size
    }

    pub(super) fn partition_count(&self) -> usize {
        self.ir_spectra.len()
    }

    /// Pre-compute the spectrum of every partition from the padded IR.
    ///
    /// Each partition is laid out as [zeros; half | IR data; half] before the
    /// forward transform; samples past the end of the IR are zero.
    pub(super) fn compute_ir_spectra(&mut self, padded_ir: &[Sample]) -> Result<(), EngineError> {
        for block_idx in 0..self.ir_spectra.len() {
            let half = self.fft_size_half;
            self.fft_in[..half].fill(0.0);

            let src_start = self.output_pos + block_idx * half;
            let src_end = (src_start + half).min(padded_ir.len());
            let copied = src_end.saturating_sub(src_start);

            if copied > 0 {
                self.fft_in[half..half + copied].copy_from_slice(&padded_ir[src_start..src_end]);
            }
            self.fft_in[half + copied..].fill(0.0);

            self.forward
                .process(&mut self.fft_in, &mut self.ir_spectra[block_idx])?;
        }

        Ok(())
    }

    /// Run the stage for one completed latency block.
    ///
    /// Executes only when the modulo counter is zero; always advances the
    /// counter. When executing, reads the trailing `fft_size` samples of
    /// `input_ring`, multiplies by each partition spectrum and overlap-adds
    /// the results into `output_ring`.
    pub(super) fn perform(
        &mut self,
        input_ring: &[Sample],
        output_ring: &mut [Sample],
    ) -> Result<(), EngineError> {
        if self.mod_counter == 0 {
            let input_start = input_ring.len() - self.fft_size;
            self.fft_in
                .copy_from_slice(&input_ring[input_start..input_start + self.fft_size]);

            self.forward
                .process(&mut self.fft_in, &mut self.signal_spectrum)?;

            let half = self.fft_size_half;
            let scale = 1.0 / self.fft_size as Sample;

            for block_idx in 0..self.ir_spectra.len() {
                self.product.copy_from_slice(&self.signal_spectrum);
                for (p, &ir) in self.product.iter_mut().zip(self.ir_spectra[block_idx].iter()) {
                    *p *= ir;
                }

                self.inverse.process(&mut self.product, &mut self.time_out)?;

                // The first half of the inverse transform is the valid part
                // of the circular convolution; the rest is wraparound.
                let out_pos = match (self.output_pos + self.latency + block_idx * half)
                    .checked_sub(half)
                {
                    Some(pos) => pos,
                    None => continue,
                };
                if out_pos + half <= output_ring.len() {
                    for (out, &v) in output_ring[out_pos..out_pos + half]
                        .iter_mut()
                        .zip(self.time_out[..half].iter())
                    {
                        *out += v * scale;
                    }
                }
            }
        }

        self.mod_counter = (self.mod_counter + 1) & self.mod_mask;
        Ok(())
    }

    /// Reset the modulo counter and clear the scratch buffers.
    pub(super) fn reset(&mut self) {
        self.mod_counter = 0;
        self.fft_in.fill(0.0);
        self.signal_spectrum.fill(Complex::new(0.0, 0.0));
        self.product.fill(Complex::new(0.0, 0.0));
        self.time_out.fill(0.0);
    }
}
