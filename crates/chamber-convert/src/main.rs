//! chamber-convert - build IR libraries from AIFF impulse responses
//!
//! Scans a directory for `.aif`/`.aiff` files, decodes them, and writes a
//! single `.irlib` library with inferred metadata. Files that fail to parse
//! are skipped with a warning so one bad file never sinks a batch.

mod aiff;

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::Parser;
use walkdir::WalkDir;

use chamber_core::f16;
use chamber_core::library::{write_library, IrLibrary};
use chamber_core::{ImpulseResponse, IrMetadata};

/// Filename keywords promoted to tags.
const TAG_KEYWORDS: &[&str] = &[
    "hall", "room", "plate", "spring", "chamber", "church", "ambience", "studio", "vocal", "drum",
    "guitar", "large", "small", "medium", "short", "long", "bright", "dark", "warm", "wet", "dry",
];

#[derive(Parser)]
#[command(
    name = "chamber-convert",
    about = "Convert AIFF impulse responses into an IR library (.irlib)"
)]
struct Args {
    /// Directory to scan for .aif/.aiff files
    input_dir: PathBuf,

    /// Output .irlib file
    output: PathBuf,

    /// Scan the input directory recursively
    #[arg(short, long)]
    recursive: bool,

    /// Category for all IRs (default: inferred from the directory structure)
    #[arg(short, long)]
    category: Option<String>,

    /// Normalize peak amplitude to -1.0 dBFS
    #[arg(short, long)]
    normalize: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    run(&args)
}

fn run(args: &Args) -> Result<()> {
    let files = find_aiff_files(&args.input_dir, args.recursive)?;
    if files.is_empty() {
        bail!("no .aif/.aiff files found in {:?}", args.input_dir);
    }

    log::info!("found {} AIFF files", files.len());

    let mut library = IrLibrary::new();

    for (i, path) in files.iter().enumerate() {
        log::info!("[{}/{}] processing {:?}", i + 1, files.len(), path);

        match convert_file(path, &args.input_dir, args) {
            Ok(ir) => library.add(ir),
            Err(err) => {
                log::warn!("skipping {path:?}: {err}");
            }
        }
    }

    if library.irs.is_empty() {
        bail!("no files were successfully converted");
    }

    let file = File::create(&args.output)
        .with_context(|| format!("failed to create output file {:?}", args.output))?;
    write_library(BufWriter::new(file), &library).context("failed to write library")?;

    let size = std::fs::metadata(&args.output).map(|m| m.len()).unwrap_or(0);
    log::info!(
        "wrote {:?}: {} IRs, {:.2} MB",
        args.output,
        library.irs.len(),
        size as f64 / (1024.0 * 1024.0)
    );

    Ok(())
}

fn find_aiff_files(dir: &Path, recursive: bool) -> Result<Vec<PathBuf>> {
    let max_depth = if recursive { usize::MAX } else { 1 };

    let mut files: Vec<PathBuf> = WalkDir::new(dir)
        .max_depth(max_depth)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| {
            matches!(
                path.extension().and_then(|e| e.to_str()).map(str::to_lowercase).as_deref(),
                Some("aif") | Some("aiff")
            )
        })
        .collect();

    files.sort();
    Ok(files)
}

fn convert_file(path: &Path, base_dir: &Path, args: &Args) -> Result<ImpulseResponse> {
    let file = File::open(path).with_context(|| format!("failed to open {path:?}"))?;
    let parsed = aiff::parse(std::io::BufReader::new(file))?;

    let duration = parsed.duration();
    let mut data = parsed.data;
    if args.normalize {
        normalize_audio(&mut data);
    }

    let name = infer_name(path);
    let category = args
        .category
        .clone()
        .unwrap_or_else(|| infer_category(path, base_dir));
    let tags = infer_tags(&name);

    // Report how much precision the f16 payload costs for this IR
    for (ch, channel) in data.iter().enumerate() {
        let stats = f16::analyze_conversion_error(channel);
        log::debug!(
            "    {name} ch{ch}: f16 max abs error {:.2e}, SNR {:.1} dB",
            stats.max_abs_error,
            stats.snr_db
        );
    }

    log::info!(
        "    {name}: {} ch, {:.0} Hz, {} samples ({:.2}s)",
        parsed.channels,
        parsed.sample_rate,
        parsed.num_samples,
        duration
    );

    Ok(ImpulseResponse {
        metadata: IrMetadata {
            name,
            description: String::new(),
            category,
            tags,
            sample_rate: parsed.sample_rate,
            channels: parsed.channels,
            length: parsed.num_samples,
        },
        data,
    })
}

/// Derive a display name from the file name: extension stripped,
/// underscores replaced with spaces.
fn infer_name(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().replace('_', " "))
        .unwrap_or_else(|| "Unnamed".to_string())
}

/// Use the first directory level below the scan root as the category.
fn infer_category(path: &Path, base_dir: &Path) -> String {
    let Ok(relative) = path.strip_prefix(base_dir) else {
        return "Default".to_string();
    };

    match relative.components().next() {
        Some(first) if relative.components().count() > 1 => {
            first.as_os_str().to_string_lossy().into_owned()
        }
        _ => "Default".to_string(),
    }
}

/// Promote known reverb keywords found in the name to tags.
fn infer_tags(name: &str) -> Vec<String> {
    let lower = name.to_lowercase();
    TAG_KEYWORDS
        .iter()
        .filter(|kw| lower.contains(**kw))
        .map(|kw| kw.to_string())
        .collect()
}

/// Scale all channels so the global peak sits at -1.0 dBFS.
fn normalize_audio(data: &mut [Vec<f32>]) {
    let peak = data
        .iter()
        .flat_map(|ch| ch.iter())
        .fold(0.0f32, |acc, &s| acc.max(s.abs()));

    if peak == 0.0 {
        return;
    }

    let target = 10f32.powf(-1.0 / 20.0); // -1.0 dBFS
    let gain = target / peak;

    for channel in data.iter_mut() {
        for sample in channel.iter_mut() {
            *sample *= gain;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_infer_name() {
        assert_eq!(
            infer_name(Path::new("/irs/Large_Hall_A.aiff")),
            "Large Hall A"
        );
        assert_eq!(infer_name(Path::new("plate.aif")), "plate");
    }

    #[test]
    fn test_infer_category() {
        let base = Path::new("/irs");
        assert_eq!(infer_category(Path::new("/irs/Halls/big.aiff"), base), "Halls");
        assert_eq!(infer_category(Path::new("/irs/top.aiff"), base), "Default");
        assert_eq!(infer_category(Path::new("/elsewhere/x.aiff"), base), "Default");
    }

    #[test]
    fn test_infer_tags() {
        let tags = infer_tags("Large Hall Bright");
        assert!(tags.contains(&"large".to_string()));
        assert!(tags.contains(&"hall".to_string()));
        assert!(tags.contains(&"bright".to_string()));
        assert!(infer_tags("Untagged 123").is_empty());
    }

    #[test]
    fn test_normalize() {
        let mut data = vec![vec![0.1, -0.4, 0.2], vec![0.05, 0.0, -0.1]];
        normalize_audio(&mut data);

        let peak = data
            .iter()
            .flat_map(|ch| ch.iter())
            .fold(0.0f32, |acc, &s| acc.max(s.abs()));
        let target = 10f32.powf(-1.0 / 20.0);
        assert!((peak - target).abs() < 1e-6);
    }

    #[test]
    fn test_normalize_silence_is_noop() {
        let mut data = vec![vec![0.0; 8]];
        normalize_audio(&mut data);
        assert!(data[0].iter().all(|&s| s == 0.0));
    }
}
