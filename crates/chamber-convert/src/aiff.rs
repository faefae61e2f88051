//! AIFF and AIFF-C parsing
//!
//! IFF-based big-endian audio container, the common delivery format for
//! measured impulse responses. Supports uncompressed PCM at 8, 16, 24 and
//! 32 bits, mono to 8 channels. AIFF-C files are accepted only with the
//! `NONE` (uncompressed) compression type.
//!
//! The sample rate in the COMM chunk is stored as an 80-bit IEEE 754
//! extended-precision float; see [`extended_to_f64`].

use std::io::Read;

use thiserror::Error;

/// Errors from the AIFF parser
#[derive(Error, Debug)]
pub enum AiffError {
    /// Not a FORM/AIFF file at all
    #[error("not an AIFF file")]
    NotAiff,

    /// Structurally valid but using features we do not support
    #[error("unsupported format: {0}")]
    Unsupported(String),

    /// Truncated or inconsistent file structure
    #[error("invalid file structure: {0}")]
    Invalid(String),

    /// A required chunk is missing
    #[error("missing required chunk: {0}")]
    MissingChunk(&'static str),
}

/// A parsed AIFF file with decoded audio.
#[derive(Debug, Clone)]
pub struct AiffFile {
    pub channels: usize,
    pub sample_rate: f64,
    pub bits_per_sample: usize,
    pub num_samples: usize,
    /// Decoded audio in [-1, 1], planar: `data[channel][sample]`
    pub data: Vec<Vec<f32>>,
}

impl AiffFile {
    /// Duration in seconds.
    pub fn duration(&self) -> f64 {
        if self.sample_rate <= 0.0 {
            return 0.0;
        }
        self.num_samples as f64 / self.sample_rate
    }
}

/// Parse an AIFF or AIFF-C file.
pub fn parse<R: Read>(mut source: R) -> Result<AiffFile, AiffError> {
    let mut form_header = [0u8; 12];
    read_exact(&mut source, &mut form_header)?;

    if &form_header[0..4] != b"FORM" {
        return Err(AiffError::NotAiff);
    }

    let form_type = &form_header[8..12];
    let is_aifc = match form_type {
        b"AIFF" => false,
        b"AIFC" => true,
        _ => return Err(AiffError::NotAiff),
    };

    let mut comm: Option<CommChunk> = None;
    let mut ssnd_data: Option<Vec<u8>> = None;

    // Walk the chunks; unknown ids are skipped. Chunks are padded to even
    // boundaries.
    loop {
        let mut chunk_header = [0u8; 8];
        match source.read_exact(&mut chunk_header) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(AiffError::Invalid(format!("chunk header: {e}"))),
        }

        let chunk_id = [
            chunk_header[0],
            chunk_header[1],
            chunk_header[2],
            chunk_header[3],
        ];
        let chunk_size = u32::from_be_bytes([
            chunk_header[4],
            chunk_header[5],
            chunk_header[6],
            chunk_header[7],
        ]) as usize;
        let padding = chunk_size % 2;

        match &chunk_id {
            b"COMM" => {
                comm = Some(parse_comm(&mut source, chunk_size, is_aifc)?);
                skip(&mut source, padding)?;
            }
            b"SSND" => {
                ssnd_data = Some(parse_ssnd(&mut source, chunk_size)?);
                skip(&mut source, padding)?;
            }
            _ => {
                if skip(&mut source, chunk_size + padding).is_err() {
                    // Some writers leave the last chunk unpadded
                    break;
                }
            }
        }
    }

    let comm = comm.ok_or(AiffError::MissingChunk("COMM"))?;
    let ssnd_data = ssnd_data.ok_or(AiffError::MissingChunk("SSND"))?;

    decode_audio(comm, &ssnd_data)
}

struct CommChunk {
    channels: usize,
    num_samples: usize,
    bits_per_sample: usize,
    sample_rate: f64,
}

fn parse_comm<R: Read>(
    source: &mut R,
    size: usize,
    is_aifc: bool,
) -> Result<CommChunk, AiffError> {
    if size < 18 {
        return Err(AiffError::Invalid("COMM chunk too small".into()));
    }

    let mut comm = [0u8; 18];
    read_exact(source, &mut comm)?;

    let channels = u16::from_be_bytes([comm[0], comm[1]]) as usize;
    let num_samples = u32::from_be_bytes([comm[2], comm[3], comm[4], comm[5]]) as usize;
    let bits_per_sample = u16::from_be_bytes([comm[6], comm[7]]) as usize;
    let sample_rate = extended_to_f64(&comm[8..18]);

    if !(1..=8).contains(&channels) {
        return Err(AiffError::Unsupported(format!(
            "channel count {channels}"
        )));
    }
    if ![8, 16, 24, 32].contains(&bits_per_sample) {
        return Err(AiffError::Unsupported(format!(
            "bit depth {bits_per_sample}"
        )));
    }
    if sample_rate <= 0.0 || sample_rate > 384000.0 {
        return Err(AiffError::Unsupported(format!(
            "sample rate {sample_rate}"
        )));
    }

    let remaining = size - 18;
    if is_aifc && remaining >= 4 {
        let mut compression = vec![0u8; remaining];
        read_exact(source, &mut compression)?;
        let compression_type = &compression[0..4];
        if compression_type != b"NONE" && compression_type != b"none" {
            return Err(AiffError::Unsupported(format!(
                "AIFC compression type {:?}",
                String::from_utf8_lossy(compression_type)
            )));
        }
    } else if remaining > 0 {
        skip(source, remaining)?;
    }

    Ok(CommChunk {
        channels,
        num_samples,
        bits_per_sample,
        sample_rate,
    })
}

fn parse_ssnd<R: Read>(source: &mut R, size: usize) -> Result<Vec<u8>, AiffError> {
    if size < 8 {
        return Err(AiffError::Invalid("SSND chunk too small".into()));
    }

    let mut header = [0u8; 8];
    read_exact(source, &mut header)?;
    let offset = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
    // header[4..8] is the block size, normally 0

    if offset > 0 {
        skip(source, offset)?;
    }

    let data_size = size
        .checked_sub(8 + offset)
        .ok_or_else(|| AiffError::Invalid("SSND offset exceeds chunk".into()))?;

    let mut data = vec![0u8; data_size];
    read_exact(source, &mut data)?;
    Ok(data)
}

fn decode_audio(comm: CommChunk, data: &[u8]) -> Result<AiffFile, AiffError> {
    let bytes_per_sample = comm.bits_per_sample / 8;
    let frame_size = bytes_per_sample * comm.channels;
    let frames_in_data = data.len() / frame_size;

    // Some files declare more frames in COMM than the SSND chunk holds
    let num_samples = comm.num_samples.min(frames_in_data);

    let mut channels: Vec<Vec<f32>> = vec![vec![0.0; num_samples]; comm.channels];

    let mut offset = 0;
    for frame in 0..num_samples {
        for channel in channels.iter_mut() {
            let sample = match comm.bits_per_sample {
                8 => data[offset] as i8 as f32 / 128.0,
                16 => {
                    i16::from_be_bytes([data[offset], data[offset + 1]]) as f32 / 32768.0
                }
                24 => {
                    let raw = [data[offset], data[offset + 1], data[offset + 2]];
                    let mut value =
                        (raw[0] as i32) << 16 | (raw[1] as i32) << 8 | raw[2] as i32;
                    if raw[0] & 0x80 != 0 {
                        value |= -1i32 << 24; // sign-extend
                    }
                    value as f32 / 8_388_608.0
                }
                32 => {
                    i32::from_be_bytes([
                        data[offset],
                        data[offset + 1],
                        data[offset + 2],
                        data[offset + 3],
                    ]) as f32
                        / 2_147_483_648.0
                }
                _ => unreachable!("bit depth validated in parse_comm"),
            };
            channel[frame] = sample;
            offset += bytes_per_sample;
        }
    }

    Ok(AiffFile {
        channels: comm.channels,
        sample_rate: comm.sample_rate,
        bits_per_sample: comm.bits_per_sample,
        num_samples,
        data: channels,
    })
}

/// Convert an 80-bit IEEE 754 extended-precision float to f64.
///
/// AIFF stores the sample rate in this 10-byte format: 1 sign bit, 15
/// exponent bits (bias 16383) and a 64-bit mantissa with an explicit
/// integer bit.
pub fn extended_to_f64(bytes: &[u8]) -> f64 {
    if bytes.len() != 10 {
        return 0.0;
    }

    let sign = (bytes[0] >> 7) & 1;
    let exponent = (u16::from_be_bytes([bytes[0], bytes[1]]) & 0x7FFF) as i32;
    let mantissa = u64::from_be_bytes([
        bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7], bytes[8], bytes[9],
    ]);

    if exponent == 0 {
        // Zero or (for sample rates, implausible) denormal
        return 0.0;
    }
    if exponent == 0x7FFF {
        return f64::INFINITY;
    }

    // The explicit integer bit makes the mantissa a value in [1, 2) after
    // dividing by 2^63. The exponent is applied with a +1 offset on top of
    // the 16383 bias, matching the convention of AIFF writers.
    let fraction = mantissa as f64 / (1u64 << 63) as f64;
    let value = fraction * 2f64.powi(exponent - 16383 + 1);

    if sign == 1 {
        -value
    } else {
        value
    }
}

fn read_exact<R: Read>(source: &mut R, buf: &mut [u8]) -> Result<(), AiffError> {
    source
        .read_exact(buf)
        .map_err(|e| AiffError::Invalid(format!("truncated read: {e}")))
}

fn skip<R: Read>(source: &mut R, bytes: usize) -> Result<(), AiffError> {
    let copied = std::io::copy(&mut source.take(bytes as u64), &mut std::io::sink())
        .map_err(|e| AiffError::Invalid(format!("skip failed: {e}")))?;
    if copied < bytes as u64 {
        return Err(AiffError::Invalid("truncated chunk".into()));
    }
    Ok(())
}
