//! Reverb coordinator
//!
//! Owns the currently loaded IR and one convolution engine per channel,
//! services the host's audio callback, and exposes thread-safe control.
//!
//! ## Real-Time Safety
//!
//! The audio thread calls [`ConvolutionReverb::process_block`] once per
//! channel per callback. That path takes the state reader lock plus one
//! uncontended per-channel mutex, mixes into a preallocated wet scratch
//! buffer, and never allocates for host blocks up to [`MAX_BLOCK_SIZE`].
//!
//! Everything expensive (decoding a library, resampling, FFT plan and
//! engine construction) happens on control threads **outside** the writer
//! lock. Only the final engine-vector swap runs under the lock, so the
//! audio callback is never blocked for more than a pointer assignment.
//! Old engines are dropped by the control thread after the lock is
//! released, never by the audio thread.
//!
//! A sample-rate change triggers asynchronous resampling of the cached
//! original IR on a detached thread; the old engines keep serving callbacks
//! until the replacement set is ready. If the rate changes again mid-work
//! the stale result is discarded and the resample restarts for the new
//! rate.

use std::io::{Cursor, Read, Seek};
use std::sync::{Arc, Mutex, RwLock};

use thiserror::Error;

use crate::engine::{
    ConvolutionEngine, EngineError, EngineType, LowLatencyConvolver, OverlapAddConvolver,
};
use crate::library::{LibraryError, LibraryReader};
use crate::resampler::{ResampleError, Resampler};
use crate::types::Sample;

/// Maximum host block size to pre-allocate for real-time safety.
/// Covers all common callback configurations (64, 128, 256, 512, 1024,
/// 2048, 4096); pre-allocating the wet scratch to this size eliminates
/// allocations in the audio callback.
pub const MAX_BLOCK_SIZE: usize = 8192;

const POISONED: &str = "reverb state lock poisoned";

/// Errors from the reverb coordinator
#[derive(Error, Debug)]
pub enum ReverbError {
    /// Bad construction parameters or empty IR data
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error(transparent)]
    Library(#[from] LibraryError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Resample(#[from] ResampleError),
}

/// Selects an IR inside a library.
#[derive(Debug, Clone)]
pub enum IrSelector {
    /// By position in the library index
    Index(usize),
    /// By exact name match
    Name(String),
}

/// Notification sink for state changes.
///
/// Notifications are delivered on detached threads in fire-and-forget
/// fashion; implementations must not call back into the coordinator
/// synchronously and must tolerate unspecified ordering between listeners.
pub trait StateListener: Send + Sync {
    fn on_wet_changed(&self, level: f64);
    fn on_dry_changed(&self, level: f64);
    fn on_ir_changed(&self, index: usize, name: &str);
}

/// One channel's engine plus its preallocated wet scratch buffer.
struct ChannelStrip {
    engine: Box<dyn ConvolutionEngine>,
    wet: Vec<Sample>,
}

/// The original IR as loaded, kept at its native rate so that any future
/// sample-rate change can re-resample losslessly from the source.
struct IrSource {
    data: Vec<Vec<Sample>>,
    sample_rate: f64,
}

/// Snapshot of the fields engine construction depends on, taken under the
/// reader lock before building outside of any lock.
#[derive(Clone, Copy)]
struct EngineConfig {
    engine_type: EngineType,
    min_block_order: usize,
    max_block_order: usize,
    channels: usize,
    /// The sample rate engines are being built for; checked again at
    /// install time to detect a rate change that happened mid-build.
    sample_rate: f64,
}

struct ReverbState {
    sample_rate: f64,
    channels: usize,

    wet_level: f64,
    dry_level: f64,

    engine_type: EngineType,
    min_block_order: usize,
    max_block_order: usize,

    enabled: bool,
    resampling_in_flight: bool,

    /// Latency of the installed engines, if any
    engine_latency: Option<usize>,
    current_ir_name: String,

    original_ir: Option<Arc<IrSource>>,
    engines: Vec<Option<Mutex<ChannelStrip>>>,

    listeners: Vec<Arc<dyn StateListener>>,
}

/// Convolution reverb processor.
///
/// Cheaply cloneable handle; clones share the same underlying state, so the
/// audio thread and any number of control threads can hold their own copy.
#[derive(Clone)]
pub struct ConvolutionReverb {
    state: Arc<RwLock<ReverbState>>,
    resampler: Resampler,
}

impl ConvolutionReverb {
    /// Create a reverb for the given stream configuration.
    ///
    /// Starts disabled (bypassing) until an IR is loaded. Defaults: low
    /// latency engine, 64-sample latency (`min_block_order` 6), wet 0.3,
    /// dry 0.7.
    pub fn new(sample_rate: f64, channels: usize) -> Result<Self, ReverbError> {
        if sample_rate <= 0.0 {
            return Err(ReverbError::InvalidParameter(format!(
                "sample rate must be positive, got {sample_rate}"
            )));
        }
        if channels == 0 {
            return Err(ReverbError::InvalidParameter(
                "channel count must be at least 1".to_string(),
            ));
        }

        let state = ReverbState {
            sample_rate,
            channels,
            wet_level: 0.3,
            dry_level: 0.7,
            engine_type: EngineType::LowLatency,
            min_block_order: 6,
            max_block_order: 9,
            enabled: false,
            resampling_in_flight: false,
            engine_latency: None,
            current_ir_name: String::new(),
            original_ir: None,
            engines: (0..channels).map(|_| None).collect(),
            listeners: Vec::new(),
        };

        Ok(Self {
            state: Arc::new(RwLock::new(state)),
            resampler: Resampler::new(),
        })
    }

    // ── configuration ───────────────────────────────────────────────────

    /// Select the engine type used on the next IR load.
    pub fn set_engine_type(&self, engine_type: EngineType) {
        self.state.write().expect(POISONED).engine_type = engine_type;
    }

    /// Set the latency of the low-latency engine as a block order
    /// (6 = 64 samples ... 9 = 512 samples; clamped). Takes effect on the
    /// next IR load.
    pub fn set_latency(&self, min_block_order: usize) {
        self.state.write().expect(POISONED).min_block_order = min_block_order.clamp(6, 9);
    }

    /// Current processing latency in samples.
    pub fn get_latency(&self) -> usize {
        let state = self.state.read().expect(POISONED);
        state
            .engine_latency
            .unwrap_or(1 << state.min_block_order)
    }

    /// Set the wet (reverb) mix level; clamped to [0, 1]. Listeners are
    /// notified on detached threads.
    pub fn set_wet(&self, level: f64) {
        let level = level.clamp(0.0, 1.0);
        let listeners = {
            let mut state = self.state.write().expect(POISONED);
            state.wet_level = level;
            state.listeners.clone()
        };
        for listener in listeners {
            std::thread::spawn(move || listener.on_wet_changed(level));
        }
    }

    /// Set the dry (direct) mix level; clamped to [0, 1]. Listeners are
    /// notified on detached threads.
    pub fn set_dry(&self, level: f64) {
        let level = level.clamp(0.0, 1.0);
        let listeners = {
            let mut state = self.state.write().expect(POISONED);
            state.dry_level = level;
            state.listeners.clone()
        };
        for listener in listeners {
            std::thread::spawn(move || listener.on_dry_changed(level));
        }
    }

    pub fn get_wet(&self) -> f64 {
        self.state.read().expect(POISONED).wet_level
    }

    pub fn get_dry(&self) -> f64 {
        self.state.read().expect(POISONED).dry_level
    }

    /// Whether an IR is loaded and the reverb is processing.
    pub fn is_enabled(&self) -> bool {
        self.state.read().expect(POISONED).enabled
    }

    /// Whether an asynchronous resample is currently in flight.
    pub fn is_resampling(&self) -> bool {
        self.state.read().expect(POISONED).resampling_in_flight
    }

    /// The configured stream sample rate.
    pub fn sample_rate(&self) -> f64 {
        self.state.read().expect(POISONED).sample_rate
    }

    /// Number of output channels.
    pub fn channels(&self) -> usize {
        self.state.read().expect(POISONED).channels
    }

    /// Name of the currently loaded IR (empty before the first load).
    pub fn current_ir_name(&self) -> String {
        self.state.read().expect(POISONED).current_ir_name.clone()
    }

    /// Register a listener for state-change notifications.
    pub fn add_listener(&self, listener: Arc<dyn StateListener>) {
        self.state.write().expect(POISONED).listeners.push(listener);
    }

    /// Current processing metrics for a channel: (input level, output
    /// level, reverb level). Metering is not implemented; the observer
    /// exists for control-surface parity and reports zeros.
    pub fn get_metrics(&self, _channel: usize) -> (f32, f32, f32) {
        (0.0, 0.0, 0.0)
    }

    // ── audio path ──────────────────────────────────────────────────────

    /// Process one channel's block: convolve and mix wet/dry into `output`.
    ///
    /// Bypasses (copies input to output) when disabled, when the channel is
    /// out of range, or when the engine fails mid-block; engine errors are
    /// logged out-of-band and never propagate to the host.
    ///
    /// Panics if `input` and `output` differ in length; that is a
    /// programming fault in the host glue, not a runtime condition.
    pub fn process_block(&self, input: &[Sample], output: &mut [Sample], channel: usize) {
        assert_eq!(
            input.len(),
            output.len(),
            "input and output buffers must have the same length"
        );

        let Ok(state) = self.state.read() else {
            output.copy_from_slice(input);
            return;
        };

        if !state.enabled || channel >= state.engines.len() {
            output.copy_from_slice(input);
            return;
        }
        let Some(strip) = &state.engines[channel] else {
            output.copy_from_slice(input);
            return;
        };
        let Ok(mut strip) = strip.lock() else {
            output.copy_from_slice(input);
            return;
        };

        let frames = input.len();
        if strip.wet.len() < frames {
            // Only reachable for host blocks beyond MAX_BLOCK_SIZE
            strip.wet.resize(frames, 0.0);
        }

        let ChannelStrip { engine, wet } = &mut *strip;
        match engine.process(input, &mut wet[..frames]) {
            Ok(()) => {
                let dry_level = state.dry_level as Sample;
                let wet_level = state.wet_level as Sample;
                for ((out, &inp), &w) in output.iter_mut().zip(input.iter()).zip(wet.iter()) {
                    *out = inp * dry_level + w * wet_level;
                }
            }
            Err(err) => {
                log::warn!("engine failed on channel {channel}: {err}; bypassing block");
                output.copy_from_slice(input);
            }
        }
    }

    /// Process a single sample.
    ///
    /// The sample-wise path is non-convolutive: it returns the dry portion
    /// of the input only. Block processing is the real reverb path.
    pub fn process_sample(&self, input: Sample, channel: usize) -> Sample {
        let Ok(state) = self.state.read() else {
            return input;
        };

        if !state.enabled || channel >= state.channels {
            return input;
        }

        input * state.dry_level as Sample
    }

    // ── IR loading ──────────────────────────────────────────────────────

    /// Load an IR from a library byte source.
    pub fn load_from_reader<R: Read + Seek>(
        &self,
        source: R,
        selector: &IrSelector,
    ) -> Result<(), ReverbError> {
        let mut reader = LibraryReader::new(source)?;

        let ir = match selector {
            IrSelector::Index(index) => reader.load(*index)?,
            IrSelector::Name(name) => reader.load_by_name(name)?,
        };

        let name = ir.metadata.name.clone();
        let rate = ir.metadata.sample_rate;
        self.apply_impulse_response(ir.data, rate)?;

        self.state.write().expect(POISONED).current_ir_name = name;
        Ok(())
    }

    /// Load an IR from an in-memory library (e.g. embedded data).
    pub fn load_from_bytes(&self, data: &[u8], selector: &IrSelector) -> Result<(), ReverbError> {
        self.load_from_reader(Cursor::new(data), selector)
    }

    /// Fast path for runtime IR switching from a control surface.
    ///
    /// Loads the IR at `index` from the in-memory library, swaps it in and
    /// notifies listeners with the committed name, which is also returned.
    pub fn switch_ir(&self, data: &[u8], index: usize) -> Result<String, ReverbError> {
        let mut reader = LibraryReader::new(Cursor::new(data))?;
        let entries = reader.list();
        if index >= entries.len() {
            return Err(LibraryError::IndexOutOfRange {
                index,
                count: entries.len(),
            }
            .into());
        }

        let ir = reader.load(index)?;
        let rate = ir.metadata.sample_rate;
        self.apply_impulse_response(ir.data, rate)?;

        let name = entries[index].name.clone();
        let listeners = {
            let mut state = self.state.write().expect(POISONED);
            state.current_ir_name = name.clone();
            state.listeners.clone()
        };

        for listener in listeners {
            let name = name.clone();
            std::thread::spawn(move || listener.on_ir_changed(index, &name));
        }

        Ok(name)
    }

    /// Load a synthetic exponential-decay IR of the given length.
    ///
    /// Useful as a fallback when no library is available.
    pub fn load_synthetic(&self, seconds: f64) -> Result<(), ReverbError> {
        if seconds <= 0.0 {
            return Err(ReverbError::InvalidParameter(format!(
                "synthetic IR length must be positive, got {seconds}"
            )));
        }

        let rate = self.sample_rate();
        let length = (rate * seconds) as usize;
        let ir: Vec<Sample> = (0..length)
            .map(|i| {
                let t = i as f64 / rate;
                (0.5 * (-3.0 * t).exp()) as Sample
            })
            .collect();

        self.apply_impulse_response(vec![ir], rate)?;
        self.state.write().expect(POISONED).current_ir_name = "Synthetic".to_string();
        Ok(())
    }

    /// Update the stream sample rate.
    ///
    /// If an IR is loaded and the rate actually changed, the original IR is
    /// resampled asynchronously on a detached thread; the current engines
    /// stay in service until the replacements are installed. Non-positive
    /// rates are ignored with a warning.
    pub fn set_sample_rate(&self, sample_rate: f64) {
        if sample_rate <= 0.0 {
            log::warn!("ignoring non-positive sample rate {sample_rate}");
            return;
        }

        let mut state = self.state.write().expect(POISONED);
        if state.sample_rate == sample_rate {
            return;
        }

        let old_rate = state.sample_rate;
        state.sample_rate = sample_rate;

        let Some(source) = state.original_ir.clone() else {
            return;
        };
        if state.resampling_in_flight {
            // The in-flight worker will observe the new rate at install time
            // and restart itself.
            return;
        }

        state.resampling_in_flight = true;
        let config = Self::snapshot_config(&state);
        drop(state);

        log::info!(
            "sample rate changed from {old_rate} Hz to {sample_rate} Hz, resampling IR asynchronously"
        );
        Self::spawn_resample(Arc::clone(&self.state), self.resampler, source, config);
    }

    // ── internals ───────────────────────────────────────────────────────

    fn snapshot_config(state: &ReverbState) -> EngineConfig {
        EngineConfig {
            engine_type: state.engine_type,
            min_block_order: state.min_block_order,
            max_block_order: state.max_block_order,
            channels: state.channels,
            sample_rate: state.sample_rate,
        }
    }

    /// Apply decoded IR data: resample if needed, build one engine per
    /// channel, then atomically swap the engines in.
    ///
    /// Resampling and engine construction run outside any lock; the writer
    /// lock is held only for the final swap. If the sample rate changed
    /// while building, the freshly built engines are discarded and an async
    /// resample for the new rate is kicked off instead.
    fn apply_impulse_response(
        &self,
        data: Vec<Vec<Sample>>,
        ir_sample_rate: f64,
    ) -> Result<(), ReverbError> {
        if data.is_empty() || data[0].is_empty() {
            return Err(ReverbError::InvalidParameter("IR data is empty".to_string()));
        }

        let config = Self::snapshot_config(&self.state.read().expect(POISONED));
        let source = Arc::new(IrSource {
            data,
            sample_rate: ir_sample_rate,
        });

        let strips = Self::build_strips(&self.resampler, &source, config)?;

        let mut state = self.state.write().expect(POISONED);
        state.original_ir = Some(Arc::clone(&source));

        if state.sample_rate == config.sample_rate {
            let old = Self::install(&mut state, strips);
            drop(state);
            drop(old);
        } else {
            // The rate changed under us mid-build; these engines are stale.
            log::info!(
                "sample rate changed during IR load ({} Hz -> {} Hz), rebuilding",
                config.sample_rate,
                state.sample_rate
            );
            drop(strips);
            if !state.resampling_in_flight {
                state.resampling_in_flight = true;
                let config = Self::snapshot_config(&state);
                drop(state);
                Self::spawn_resample(Arc::clone(&self.state), self.resampler, source, config);
            }
        }

        Ok(())
    }

    /// Resample (when rates differ) and build one engine strip per output
    /// channel. Never called with a lock held.
    fn build_strips(
        resampler: &Resampler,
        source: &IrSource,
        config: EngineConfig,
    ) -> Result<Vec<Option<Mutex<ChannelStrip>>>, ReverbError> {
        let ir_to_use = if source.sample_rate != config.sample_rate {
            log::info!(
                "resampling IR from {} Hz to {} Hz",
                source.sample_rate,
                config.sample_rate
            );
            resampler.resample_multichannel(&source.data, source.sample_rate, config.sample_rate)?
        } else {
            source.data.clone()
        };

        let mut strips = Vec::with_capacity(config.channels);
        for ch in 0..config.channels {
            // Mono spreads to all channels; excess source channels are ignored
            let src = ch.min(ir_to_use.len() - 1);
            let engine = Self::create_engine(&ir_to_use[src], config)?;
            strips.push(Some(Mutex::new(ChannelStrip {
                engine,
                wet: vec![0.0; MAX_BLOCK_SIZE],
            })));
        }

        Ok(strips)
    }

    fn create_engine(
        ir: &[Sample],
        config: EngineConfig,
    ) -> Result<Box<dyn ConvolutionEngine>, ReverbError> {
        Ok(match config.engine_type {
            EngineType::LowLatency => Box::new(LowLatencyConvolver::new(
                ir,
                config.min_block_order,
                config.max_block_order,
            )?),
            EngineType::OverlapAdd => {
                Box::new(OverlapAddConvolver::new(ir, 1 << config.min_block_order)?)
            }
        })
    }

    /// Swap the engine vector in and mark the reverb enabled. Returns the
    /// old engines so the caller can drop them after releasing the lock.
    fn install(
        state: &mut ReverbState,
        strips: Vec<Option<Mutex<ChannelStrip>>>,
    ) -> Vec<Option<Mutex<ChannelStrip>>> {
        state.engine_latency = strips.iter().flatten().next().map(|strip| {
            strip
                .lock()
                .expect("freshly built engine lock cannot be poisoned")
                .engine
                .latency()
        });

        let old = std::mem::replace(&mut state.engines, strips);
        state.enabled = true;
        old
    }

    /// Resample and rebuild engines on a detached worker thread, then
    /// install under the writer lock if the target rate is still current.
    /// If the rate moved on, restart for the new rate instead.
    fn spawn_resample(
        state: Arc<RwLock<ReverbState>>,
        resampler: Resampler,
        source: Arc<IrSource>,
        config: EngineConfig,
    ) {
        std::thread::spawn(move || {
            let strips = match Self::build_strips(&resampler, &source, config) {
                Ok(strips) => strips,
                Err(err) => {
                    log::error!("failed to rebuild engines after rate change: {err}");
                    state.write().expect(POISONED).resampling_in_flight = false;
                    return;
                }
            };

            let mut guard = state.write().expect(POISONED);

            if guard.sample_rate != config.sample_rate {
                // Superseded while we were working; go again for the rate
                // that is current now.
                log::info!(
                    "sample rate changed again during resampling ({} Hz -> {} Hz), restarting",
                    config.sample_rate,
                    guard.sample_rate
                );
                drop(strips);
                let config = Self::snapshot_config(&guard);
                let source = guard.original_ir.clone();
                match source {
                    Some(source) => {
                        drop(guard);
                        Self::spawn_resample(state, resampler, source, config);
                    }
                    None => guard.resampling_in_flight = false,
                }
                return;
            }

            guard.resampling_in_flight = false;
            let old = Self::install(&mut guard, strips);
            drop(guard);
            drop(old);

            log::info!("IR resampling complete, now at {} Hz", config.sample_rate);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::library::{IrLibrary, write_library};
    use crate::types::ImpulseResponse;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    /// Build an in-memory library with the given IRs.
    fn library_bytes(irs: Vec<ImpulseResponse>) -> Vec<u8> {
        let library = IrLibrary { irs };
        write_library(Cursor::new(Vec::new()), &library)
            .unwrap()
            .into_inner()
    }

    fn exp_decay_ir(name: &str, channels: usize, length: usize, rate: f64) -> ImpulseResponse {
        let data: Vec<Vec<Sample>> = (0..channels)
            .map(|_| {
                (0..length)
                    .map(|i| (0.8 * (-3.0 * i as f64 / length as f64).exp()) as Sample)
                    .collect()
            })
            .collect();
        ImpulseResponse::new(name, rate, data)
    }

    fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    #[derive(Default)]
    struct RecordingListener {
        wet_events: AtomicUsize,
        dry_events: AtomicUsize,
        ir_events: AtomicUsize,
        last_ir: Mutex<Option<(usize, String)>>,
    }

    impl StateListener for RecordingListener {
        fn on_wet_changed(&self, _level: f64) {
            self.wet_events.fetch_add(1, Ordering::SeqCst);
        }

        fn on_dry_changed(&self, _level: f64) {
            self.dry_events.fetch_add(1, Ordering::SeqCst);
        }

        fn on_ir_changed(&self, index: usize, name: &str) {
            *self.last_ir.lock().unwrap() = Some((index, name.to_string()));
            self.ir_events.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_invalid_construction() {
        assert!(ConvolutionReverb::new(0.0, 2).is_err());
        assert!(ConvolutionReverb::new(-44100.0, 2).is_err());
        assert!(ConvolutionReverb::new(48000.0, 0).is_err());
    }

    #[test]
    fn test_bypass_when_disabled() {
        let reverb = ConvolutionReverb::new(48000.0, 2).unwrap();
        assert!(!reverb.is_enabled());

        let input = vec![0.5; 64];
        let mut output = vec![0.0; 64];
        reverb.process_block(&input, &mut output, 0);

        // Bypass copies the input verbatim, it does not apply the dry level
        assert_eq!(output, input);
    }

    #[test]
    fn test_level_clamping() {
        let reverb = ConvolutionReverb::new(48000.0, 2).unwrap();

        reverb.set_wet(1.5);
        assert_eq!(reverb.get_wet(), 1.0);
        reverb.set_wet(-0.5);
        assert_eq!(reverb.get_wet(), 0.0);

        reverb.set_dry(2.0);
        assert_eq!(reverb.get_dry(), 1.0);
        reverb.set_dry(-1.0);
        assert_eq!(reverb.get_dry(), 0.0);

        reverb.set_wet(0.4);
        reverb.set_dry(0.6);
        assert!((0.0..=1.0).contains(&reverb.get_wet()));
        assert!((0.0..=1.0).contains(&reverb.get_dry()));
    }

    #[test]
    fn test_latency_clamping() {
        let reverb = ConvolutionReverb::new(48000.0, 1).unwrap();

        reverb.set_latency(3);
        assert_eq!(reverb.get_latency(), 64);

        reverb.set_latency(12);
        assert_eq!(reverb.get_latency(), 512);

        reverb.set_latency(7);
        assert_eq!(reverb.get_latency(), 128);
    }

    #[test]
    fn test_stereo_load_and_process() {
        let bytes = library_bytes(vec![exp_decay_ir("Test IR", 2, 1024, 48000.0)]);

        let reverb = ConvolutionReverb::new(48000.0, 2).unwrap();
        reverb
            .load_from_bytes(&bytes, &IrSelector::Name("Test IR".to_string()))
            .unwrap();

        assert!(reverb.is_enabled());
        assert_eq!(reverb.current_ir_name(), "Test IR");

        for channel in 0..2 {
            let input = vec![0.5; 64];
            let mut output = vec![0.0; 64];
            reverb.process_block(&input, &mut output, channel);

            assert_eq!(output.len(), 64);
            assert!(output.iter().any(|&y| y.abs() > 0.0));
        }
    }

    #[test]
    fn test_mono_ir_spreads_to_all_channels() {
        let bytes = library_bytes(vec![exp_decay_ir("Mono", 1, 512, 48000.0)]);

        let reverb = ConvolutionReverb::new(48000.0, 2).unwrap();
        reverb
            .load_from_bytes(&bytes, &IrSelector::Index(0))
            .unwrap();

        let input: Vec<Sample> = (0..256).map(|i| ((i % 17) as Sample / 17.0) - 0.5).collect();
        let mut left = vec![0.0; 256];
        let mut right = vec![0.0; 256];
        reverb.process_block(&input, &mut left, 0);
        reverb.process_block(&input, &mut right, 1);

        assert_eq!(left, right);
        assert!(left.iter().any(|&y| y != 0.0));
    }

    #[test]
    fn test_load_by_name_miss() {
        let bytes = library_bytes(vec![exp_decay_ir("Test IR", 2, 256, 48000.0)]);

        let reverb = ConvolutionReverb::new(48000.0, 2).unwrap();
        let result = reverb.load_from_bytes(&bytes, &IrSelector::Name("Non-existent".to_string()));

        assert!(matches!(
            result,
            Err(ReverbError::Library(LibraryError::NotFound(_)))
        ));
        assert!(!reverb.is_enabled());
    }

    #[test]
    fn test_out_of_range_channel_bypasses() {
        let bytes = library_bytes(vec![exp_decay_ir("Test IR", 2, 256, 48000.0)]);
        let reverb = ConvolutionReverb::new(48000.0, 2).unwrap();
        reverb
            .load_from_bytes(&bytes, &IrSelector::Index(0))
            .unwrap();

        let input = vec![0.25; 64];
        let mut output = vec![0.0; 64];
        reverb.process_block(&input, &mut output, 5);
        assert_eq!(output, input);
    }

    #[test]
    #[should_panic(expected = "same length")]
    fn test_mismatched_buffers_panic() {
        let reverb = ConvolutionReverb::new(48000.0, 1).unwrap();
        let input = vec![0.0; 64];
        let mut output = vec![0.0; 32];
        reverb.process_block(&input, &mut output, 0);
    }

    #[test]
    fn test_process_sample_is_dry_only() {
        let bytes = library_bytes(vec![exp_decay_ir("Test IR", 1, 256, 48000.0)]);
        let reverb = ConvolutionReverb::new(48000.0, 1).unwrap();

        // Disabled: passthrough
        assert_eq!(reverb.process_sample(0.5, 0), 0.5);

        reverb
            .load_from_bytes(&bytes, &IrSelector::Index(0))
            .unwrap();
        reverb.set_dry(0.7);

        // Enabled: dry portion only, no convolution on the sample path
        let y = reverb.process_sample(0.5, 0);
        assert!((y - 0.35).abs() < 1e-6);
    }

    #[test]
    fn test_switch_ir_notifies_listeners() {
        let bytes = library_bytes(vec![
            exp_decay_ir("First", 1, 256, 48000.0),
            exp_decay_ir("Second", 1, 256, 48000.0),
        ]);

        let reverb = ConvolutionReverb::new(48000.0, 2).unwrap();
        let listener = Arc::new(RecordingListener::default());
        reverb.add_listener(listener.clone());

        let name = reverb.switch_ir(&bytes, 1).unwrap();
        assert_eq!(name, "Second");
        assert_eq!(reverb.current_ir_name(), "Second");

        assert!(wait_until(Duration::from_secs(2), || {
            listener.ir_events.load(Ordering::SeqCst) > 0
        }));
        let last = listener.last_ir.lock().unwrap().clone();
        assert_eq!(last, Some((1, "Second".to_string())));
    }

    #[test]
    fn test_switch_ir_out_of_range() {
        let bytes = library_bytes(vec![exp_decay_ir("Only", 1, 128, 48000.0)]);
        let reverb = ConvolutionReverb::new(48000.0, 1).unwrap();

        assert!(matches!(
            reverb.switch_ir(&bytes, 3),
            Err(ReverbError::Library(LibraryError::IndexOutOfRange { .. }))
        ));
    }

    #[test]
    fn test_setters_notify_listeners() {
        let reverb = ConvolutionReverb::new(48000.0, 1).unwrap();
        let listener = Arc::new(RecordingListener::default());
        reverb.add_listener(listener.clone());

        reverb.set_wet(0.8);
        reverb.set_dry(0.2);

        assert!(wait_until(Duration::from_secs(2), || {
            listener.wet_events.load(Ordering::SeqCst) > 0
                && listener.dry_events.load(Ordering::SeqCst) > 0
        }));
    }

    #[test]
    fn test_ir_loaded_at_other_rate_is_resampled() {
        // IR recorded at 96 kHz, stream at 48 kHz: loading must resample
        // synchronously and still produce a working reverb.
        let bytes = library_bytes(vec![exp_decay_ir("HiRate", 1, 2048, 96000.0)]);

        let reverb = ConvolutionReverb::new(48000.0, 1).unwrap();
        reverb
            .load_from_bytes(&bytes, &IrSelector::Index(0))
            .unwrap();
        assert!(reverb.is_enabled());

        let input = vec![0.5; 128];
        let mut output = vec![0.0; 128];
        reverb.process_block(&input, &mut output, 0);
        assert!(output.iter().any(|&y| y != 0.0));
    }

    #[test]
    fn test_sample_rate_change_resamples_async() {
        let bytes = library_bytes(vec![exp_decay_ir("Test IR", 1, 1024, 48000.0)]);

        let reverb = ConvolutionReverb::new(48000.0, 1).unwrap();
        reverb
            .load_from_bytes(&bytes, &IrSelector::Index(0))
            .unwrap();

        reverb.set_sample_rate(44100.0);
        assert_eq!(reverb.sample_rate(), 44100.0);

        // The old engines keep serving until the worker swaps in new ones
        assert!(wait_until(Duration::from_secs(5), || !reverb.is_resampling()));
        assert!(reverb.is_enabled());

        let input = vec![0.5; 64];
        let mut output = vec![0.0; 64];
        reverb.process_block(&input, &mut output, 0);
        assert!(output.iter().any(|&y| y != 0.0));
    }

    #[test]
    fn test_sample_rate_change_without_ir_is_cheap() {
        let reverb = ConvolutionReverb::new(48000.0, 2).unwrap();
        reverb.set_sample_rate(96000.0);
        assert_eq!(reverb.sample_rate(), 96000.0);
        assert!(!reverb.is_resampling());
    }

    #[test]
    fn test_overlap_add_engine_type() {
        let bytes = library_bytes(vec![exp_decay_ir("Short", 1, 64, 48000.0)]);

        let reverb = ConvolutionReverb::new(48000.0, 1).unwrap();
        reverb.set_engine_type(EngineType::OverlapAdd);
        reverb
            .load_from_bytes(&bytes, &IrSelector::Index(0))
            .unwrap();

        let input = vec![0.5; 64];
        let mut output = vec![0.0; 64];
        reverb.process_block(&input, &mut output, 0);
        assert!(output.iter().any(|&y| y != 0.0));
    }

    #[test]
    fn test_synthetic_ir() {
        let reverb = ConvolutionReverb::new(48000.0, 2).unwrap();
        reverb.load_synthetic(0.25).unwrap();

        assert!(reverb.is_enabled());
        assert_eq!(reverb.current_ir_name(), "Synthetic");
        assert!(reverb.load_synthetic(0.0).is_err());
    }

    #[test]
    fn test_metrics_are_zero() {
        let reverb = ConvolutionReverb::new(48000.0, 2).unwrap();
        assert_eq!(reverb.get_metrics(0), (0.0, 0.0, 0.0));
    }
}
