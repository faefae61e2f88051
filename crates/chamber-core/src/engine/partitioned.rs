//! Partitioned low-latency convolution
//!
//! A single FFT sized for the whole IR would make callback cost proportional
//! to IR length. This engine splits the IR into tiers of geometrically
//! increasing partition sizes: the earliest part of the IR uses the smallest
//! FFT (run every block), later parts use larger FFTs run every 2nd, 4th,
//! 8th... block. Worst-case callback cost stays bounded even for IRs of
//! hundreds of thousands of samples.
//!
//! Latency is fixed at `2^min_block_order` samples:
//!
//! - `min_block_order = 6` → 64 samples
//! - `min_block_order = 7` → 128 samples
//! - `min_block_order = 8` → 256 samples
//! - `min_block_order = 9` → 512 samples

use super::stage::ConvolutionStage;
use super::{ConvolutionEngine, EngineError};
use crate::types::Sample;

/// Non-uniformly partitioned convolution engine for one channel.
pub struct LowLatencyConvolver {
    /// Original IR length in samples
    ir_size: usize,

    /// Latency = 2^min_block_order samples
    latency: usize,

    /// Ring buffer of input history; stages read their FFT windows from its
    /// tail. Size = 2 * largest partition size.
    input_buffer: Vec<Sample>,
    /// Ring buffer accumulating convolution output, drained one latency
    /// block at a time. Size = padded IR length.
    output_buffer: Vec<Sample>,
    /// input_buffer.len() - latency
    input_history_size: usize,
    /// output_buffer.len() - latency
    output_history_size: usize,
    /// Cursor within the current latency block for partial-block buffering
    block_position: usize,

    /// Partition tiers in increasing order
    stages: Vec<ConvolutionStage>,
}

impl LowLatencyConvolver {
    /// Create an engine for one IR channel.
    ///
    /// `min_block_order` must be in [6, 12] and determines the latency as
    /// `2^min_block_order` samples. `max_block_order` caps the largest
    /// partition size and must be >= `min_block_order`. The IR must not be
    /// empty.
    pub fn new(
        ir: &[Sample],
        min_block_order: usize,
        max_block_order: usize,
    ) -> Result<Self, EngineError> {
        if !(6..=12).contains(&min_block_order) {
            return Err(EngineError::InvalidParameter(format!(
                "min_block_order must be between 6 and 12, got {min_block_order}"
            )));
        }
        if max_block_order < min_block_order {
            return Err(EngineError::InvalidParameter(format!(
                "max_block_order ({max_block_order}) must be >= min_block_order ({min_block_order})"
            )));
        }
        if ir.is_empty() {
            return Err(EngineError::InvalidParameter(
                "impulse response cannot be empty".to_string(),
            ));
        }

        let latency = 1 << min_block_order;
        let ir_size_padded = ir.len().div_ceil(latency) * latency;

        let (stages, max_ir_order) =
            Self::partition(ir_size_padded, min_block_order, max_block_order, latency);

        let input_buffer_size = 2 << max_ir_order;

        let mut engine = Self {
            ir_size: ir.len(),
            latency,
            input_buffer: vec![0.0; input_buffer_size],
            output_buffer: vec![0.0; ir_size_padded],
            input_history_size: input_buffer_size - latency,
            output_history_size: ir_size_padded - latency,
            block_position: 0,
            stages,
        };

        // Pad the IR to the partition grid and pre-compute all spectra
        let mut padded_ir = vec![0.0; ir_size_padded];
        padded_ir[..ir.len()].copy_from_slice(ir);
        for stage in &mut engine.stages {
            stage.compute_ir_spectra(&padded_ir)?;
        }

        Ok(engine)
    }

    /// Split the padded IR into stages of increasing order.
    ///
    /// One partition per order is mandatory; the residual length is
    /// distributed by its binary representation (bit `o` set means a second
    /// partition at order `o`), with everything left over going to the top
    /// stage. The partition sizes sum exactly to the padded IR length.
    fn partition(
        ir_size_padded: usize,
        min_block_order: usize,
        max_block_order: usize,
        latency: usize,
    ) -> (Vec<ConvolutionStage>, usize) {
        let min_block_size = 1usize << min_block_order;

        // Highest order needed for this IR
        let mut max_ir_order = trunc_log2(ir_size_padded + min_block_size) - 1;

        // Reserve one mandatory partition per order, then check whether the
        // top order would hold only that single partition; if so it is
        // wasteful and one order less suffices.
        let residual = ir_size_padded - (order_sum(max_ir_order) - order_sum(min_block_order - 1));
        if (residual >> max_ir_order) & 1 == 0 && max_ir_order > min_block_order {
            max_ir_order -= 1;
        }
        if max_ir_order > max_block_order {
            max_ir_order = max_block_order;
        }

        // Recompute the residual for the final top order
        let mut residual =
            ir_size_padded - (order_sum(max_ir_order) - order_sum(min_block_order - 1));

        let mut stages = Vec::with_capacity(max_ir_order - min_block_order + 1);
        let mut start_pos = 0usize;

        for order in min_block_order..max_ir_order {
            let count = 1 + ((residual >> order) & 1);
            stages.push(ConvolutionStage::new(order, start_pos, latency, count));
            start_pos += count << order;
            residual -= (count - 1) << order;
        }

        // Top stage takes everything that remains
        let count = 1 + (residual >> max_ir_order);
        stages.push(ConvolutionStage::new(
            max_ir_order,
            start_pos,
            latency,
            count,
        ));

        (stages, max_ir_order)
    }

    /// Process a block of any size. Partial latency blocks are buffered; each
    /// completed latency block triggers one round of stage convolutions.
    pub fn process(&mut self, input: &[Sample], output: &mut [Sample]) -> Result<(), EngineError> {
        assert_eq!(
            input.len(),
            output.len(),
            "input and output must have the same length"
        );

        let frames = input.len();
        let mut current = 0;

        while current < frames {
            let remaining = frames - current;

            if self.block_position + remaining < self.latency {
                // Not enough to complete a latency block: buffer input, emit
                // the already computed output and stop.
                let dst = self.input_history_size + self.block_position;
                self.input_buffer[dst..dst + remaining]
                    .copy_from_slice(&input[current..current + remaining]);
                output[current..current + remaining].copy_from_slice(
                    &self.output_buffer[self.block_position..self.block_position + remaining],
                );

                self.block_position += remaining;
                break;
            }

            // Complete the current latency block
            let to_process = self.latency - self.block_position;
            let dst = self.input_history_size + self.block_position;
            self.input_buffer[dst..dst + to_process]
                .copy_from_slice(&input[current..current + to_process]);
            output[current..current + to_process].copy_from_slice(
                &self.output_buffer[self.block_position..self.block_position + to_process],
            );

            self.complete_block()?;

            current += to_process;
            self.block_position = 0;
        }

        Ok(())
    }

    /// Process one sample. Same semantics as [`process`](Self::process), one
    /// sample at a time.
    pub fn process_sample(&mut self, input: Sample) -> Result<Sample, EngineError> {
        self.input_buffer[self.input_history_size + self.block_position] = input;
        let output = self.output_buffer[self.block_position];

        self.block_position += 1;
        if self.block_position >= self.latency {
            self.complete_block()?;
            self.block_position = 0;
        }

        Ok(output)
    }

    /// Advance the rings by one latency block and run all stages.
    fn complete_block(&mut self) -> Result<(), EngineError> {
        // Drain the emitted block from the output ring and clear space for
        // new contributions
        self.output_buffer.copy_within(self.latency.., 0);
        self.output_buffer[self.output_history_size..].fill(0.0);

        for stage in &mut self.stages {
            stage.perform(&self.input_buffer, &mut self.output_buffer)?;
        }

        // Keep the input tail for stages that run less often
        self.input_buffer.copy_within(self.latency.., 0);
        Ok(())
    }

    /// Processing latency in samples (2^min_block_order).
    pub fn latency(&self) -> usize {
        self.latency
    }

    /// Original IR length in samples.
    pub fn ir_size(&self) -> usize {
        self.ir_size
    }

    /// Number of partition stages.
    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    /// FFT size and partition count of a stage.
    pub fn stage_info(&self, index: usize) -> Option<(usize, usize)> {
        self.stages
            .get(index)
            .map(|s| (s.fft_size(), s.partition_count()))
    }

    /// Clear all buffers and scheduling state.
    pub fn reset(&mut self) {
        self.input_buffer.fill(0.0);
        self.output_buffer.fill(0.0);
        self.block_position = 0;
        for stage in &mut self.stages {
            stage.reset();
        }
    }
}

impl ConvolutionEngine for LowLatencyConvolver {
    fn process(&mut self, input: &[Sample], output: &mut [Sample]) -> Result<(), EngineError> {
        LowLatencyConvolver::process(self, input, output)
    }

    fn latency(&self) -> usize {
        LowLatencyConvolver::latency(self)
    }

    fn reset(&mut self) {
        LowLatencyConvolver::reset(self)
    }
}

/// floor(log2(n)); 0 for n <= 1.
fn trunc_log2(n: usize) -> usize {
    if n <= 1 {
        return 0;
    }
    (usize::BITS - 1 - n.leading_zeros()) as usize
}

/// Sum of one partition per order up to and including `order`:
/// 2^(order+1) - 1.
fn order_sum(order: usize) -> usize {
    (2usize << order) - 1
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Direct O(n*m) convolution truncated to `len` samples.
    fn direct_convolve(ir: &[Sample], input: &[Sample], len: usize) -> Vec<Sample> {
        let mut out = vec![0.0f64; len];
        for (n, o) in out.iter_mut().enumerate() {
            for (m, &h) in ir.iter().enumerate() {
                if n >= m && n - m < input.len() {
                    *o += h as f64 * input[n - m] as f64;
                }
            }
        }
        out.into_iter().map(|v| v as Sample).collect()
    }

    /// Deterministic pseudo-random signal in [-1, 1].
    fn noise(len: usize, seed: u32) -> Vec<Sample> {
        let mut state = seed;
        (0..len)
            .map(|_| {
                state = state.wrapping_mul(1664525).wrapping_add(1013904223);
                (state >> 8) as Sample / (1 << 23) as Sample - 1.0
            })
            .collect()
    }

    fn rms_relative_error(a: &[Sample], b: &[Sample]) -> f64 {
        assert_eq!(a.len(), b.len());
        let mut err = 0.0f64;
        let mut reference = 0.0f64;
        for (&x, &y) in a.iter().zip(b.iter()) {
            err += ((x - y) as f64).powi(2);
            reference += (y as f64).powi(2);
        }
        if reference == 0.0 {
            return if err == 0.0 { 0.0 } else { f64::INFINITY };
        }
        (err / reference).sqrt()
    }

    #[test]
    fn test_invalid_parameters() {
        let ir = vec![1.0; 128];
        assert!(LowLatencyConvolver::new(&ir, 5, 9).is_err());
        assert!(LowLatencyConvolver::new(&ir, 13, 13).is_err());
        assert!(LowLatencyConvolver::new(&ir, 8, 7).is_err());
        assert!(LowLatencyConvolver::new(&[], 6, 9).is_err());
    }

    #[test]
    fn test_latency_values() {
        let ir = vec![1.0; 256];
        for order in 6..=9 {
            let engine = LowLatencyConvolver::new(&ir, order, 9.max(order)).unwrap();
            assert_eq!(engine.latency(), 1 << order);
        }
    }

    #[test]
    fn test_partition_sizes_sum_to_padded_ir() {
        for ir_len in [1usize, 64, 100, 256, 1000, 4096, 16384, 100_000] {
            let ir = vec![0.1; ir_len];
            let engine = LowLatencyConvolver::new(&ir, 6, 9).unwrap();

            let padded = ir_len.div_ceil(64) * 64;
            let total: usize = (0..engine.stage_count())
                .map(|i| {
                    let (fft_size, count) = engine.stage_info(i).unwrap();
                    (fft_size / 2) * count
                })
                .sum();
            assert_eq!(total, padded, "ir_len={ir_len}");
        }
    }

    #[test]
    fn test_impulse_reproduces_ir() {
        // Exponentially decaying IR; feeding a unit impulse must reproduce it
        // after the engine latency.
        let ir: Vec<Sample> = (0..256).map(|i| 0.5f32.powi(i)).collect();
        let mut engine = LowLatencyConvolver::new(&ir, 6, 8).unwrap();
        let latency = engine.latency();

        let total = 256 + latency + 256;
        let mut input = vec![0.0; total];
        input[0] = 1.0;

        let mut output = vec![0.0; total];
        for (inp, out) in input.chunks(64).zip(output.chunks_mut(64)) {
            engine.process(inp, out).unwrap();
        }

        let close = output[latency..latency + 256]
            .iter()
            .zip(ir.iter())
            .filter(|(&o, &h)| (o - h).abs() < 0.01)
            .count();
        assert!(close >= 256 * 8 / 10, "only {close}/256 samples match");
    }

    #[test]
    fn test_matches_direct_convolution() {
        let ir = noise(1000, 7);
        let input = noise(700, 42);

        let mut engine = LowLatencyConvolver::new(&ir, 6, 9).unwrap();
        let latency = engine.latency();

        // Pad the input so the tail of the convolution window clears latency
        let mut padded_input = input.clone();
        padded_input.resize(input.len() + latency, 0.0);

        let mut output = vec![0.0; padded_input.len()];
        engine.process(&padded_input, &mut output).unwrap();

        let expected = direct_convolve(&ir, &input, input.len());
        let produced = &output[latency..latency + input.len()];

        let err = rms_relative_error(produced, &expected);
        assert!(err <= 1e-3, "RMS relative error {err}");
    }

    #[test]
    fn test_block_size_independence() {
        // Processing the same stream in odd-sized blocks must give exactly
        // the same result as one big block.
        let ir = noise(2500, 3);
        let input = noise(1500, 99);

        let mut reference_engine = LowLatencyConvolver::new(&ir, 6, 9).unwrap();
        let mut reference = vec![0.0; input.len()];
        reference_engine.process(&input, &mut reference).unwrap();

        let mut engine = LowLatencyConvolver::new(&ir, 6, 9).unwrap();
        let mut output = vec![0.0; input.len()];
        let mut pos = 0;
        for &size in [1usize, 63, 64, 100, 472, 512, 288].iter().cycle() {
            if pos >= input.len() {
                break;
            }
            let end = (pos + size).min(input.len());
            engine
                .process(&input[pos..end], &mut output[pos..end])
                .unwrap();
            pos = end;
        }

        for (i, (&a, &b)) in output.iter().zip(reference.iter()).enumerate() {
            assert!((a - b).abs() < 1e-6, "sample {i}: {a} vs {b}");
        }
    }

    #[test]
    fn test_process_sample_matches_process() {
        let ir = noise(300, 5);
        let input = noise(256, 11);

        let mut block_engine = LowLatencyConvolver::new(&ir, 6, 9).unwrap();
        let mut block_out = vec![0.0; input.len()];
        block_engine.process(&input, &mut block_out).unwrap();

        let mut sample_engine = LowLatencyConvolver::new(&ir, 6, 9).unwrap();
        for (i, &x) in input.iter().enumerate() {
            let y = sample_engine.process_sample(x).unwrap();
            assert!((y - block_out[i]).abs() < 1e-6, "sample {i}");
        }
    }

    #[test]
    fn test_reset_restores_fresh_state() {
        let ir = noise(1000, 21);
        let input = noise(640, 55);

        let mut engine = LowLatencyConvolver::new(&ir, 6, 9).unwrap();

        let mut first = vec![0.0; input.len()];
        engine.process(&input, &mut first).unwrap();

        engine.reset();

        let mut second = vec![0.0; input.len()];
        engine.process(&input, &mut second).unwrap();

        assert_eq!(first, second);
    }

    #[test]
    fn test_observers() {
        let ir = vec![0.5; 10_000];
        let engine = LowLatencyConvolver::new(&ir, 6, 9).unwrap();

        assert_eq!(engine.ir_size(), 10_000);
        assert_eq!(engine.latency(), 64);
        assert!(engine.stage_count() >= 1);
        assert!(engine.stage_info(engine.stage_count()).is_none());
    }
}
