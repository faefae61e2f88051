//! IR library container format (`.irlib`)
//!
//! A chunk-based binary container holding multiple impulse responses with
//! metadata. Audio payloads are IEEE 754 half-precision (see [`crate::f16`]),
//! halving storage compared to f32.
//!
//! Layout (all integers little-endian):
//!
//! ```text
//! header:  "IRLB" | version u16 | irCount u32 | indexOffset u64
//! per IR:  "IR--" | size u64
//!            "META" | size u32 | sampleRate f64 | channels u32 | length u32
//!                   | name | description | category | tagCount u16 | tags...
//!            "AUDI" | size u32 | interleaved f16 samples
//! index:   "INDX" | size u64 | per IR: offset u64 | sampleRate f64
//!                   | channels u32 | length u32 | name | category
//! ```
//!
//! Strings are u16-length-prefixed UTF-8. The index chunk sits at the end of
//! the file and its offset is back-patched into the header when the writer
//! closes, so a library is written in a single forward pass while readers can
//! browse metadata without touching any audio data.
//!
//! Unknown sub-chunk ids inside an IR chunk are skipped so that newer writers
//! can add sub-chunks without breaking old readers.

mod reader;
mod writer;

pub use reader::LibraryReader;
pub use writer::LibraryWriter;

use std::io::{Read, Seek, Write};

use thiserror::Error;

use crate::types::ImpulseResponse;

/// Magic number identifying an IRLB file.
pub const MAGIC: &[u8; 4] = b"IRLB";

/// Format version implemented by this module.
pub const CURRENT_VERSION: u16 = 1;

pub(crate) const CHUNK_IR: &[u8; 4] = b"IR--";
pub(crate) const CHUNK_INDEX: &[u8; 4] = b"INDX";
pub(crate) const CHUNK_META: &[u8; 4] = b"META";
pub(crate) const CHUNK_AUDIO: &[u8; 4] = b"AUDI";

/// Magic(4) + version(2) + irCount(4) + indexOffset(8)
pub(crate) const FILE_HEADER_SIZE: u64 = 18;
/// ChunkID(4) + chunk size(8)
pub(crate) const CHUNK_HEADER_SIZE: u64 = 12;
/// Sub-chunk ID(4) + sub-chunk size(4)
pub(crate) const SUB_CHUNK_HEADER_SIZE: u64 = 8;
/// Byte position of the indexOffset field inside the header (for back-patching)
pub(crate) const INDEX_OFFSET_FIELD: u64 = 10;

/// Errors raised by the library reader and writer
#[derive(Error, Debug)]
pub enum LibraryError {
    /// The file does not start with the IRLB magic
    #[error("invalid magic number")]
    InvalidMagic,

    /// The file uses a format version this reader does not understand
    #[error("unsupported format version {0}, expected {CURRENT_VERSION}")]
    UnsupportedVersion(u16),

    /// A chunk id did not match the expected structure
    #[error("invalid chunk: {0}")]
    InvalidChunk(String),

    /// The file is truncated or internally inconsistent
    #[error("corrupted data: {0}")]
    Corrupted(String),

    /// No IR with the requested name exists
    #[error("IR not found: {0:?}")]
    NotFound(String),

    /// The requested IR index is out of range
    #[error("IR index {index} out of range (library has {count} IRs)")]
    IndexOutOfRange { index: usize, count: usize },

    /// An I/O error while writing
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Index entry: enough metadata to present an IR in a chooser without
/// loading its audio data.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry {
    /// Byte offset of the IR chunk from the start of the file
    pub offset: u64,
    /// Sample rate in Hz
    pub sample_rate: f64,
    /// Number of audio channels
    pub channels: usize,
    /// Samples per channel
    pub length: usize,
    /// IR name
    pub name: String,
    /// IR category
    pub category: String,
}

impl IndexEntry {
    /// Duration of the indexed IR in seconds.
    pub fn duration(&self) -> f64 {
        if self.sample_rate <= 0.0 {
            return 0.0;
        }
        self.length as f64 / self.sample_rate
    }
}

/// A fully loaded IR library.
#[derive(Debug, Clone, Default)]
pub struct IrLibrary {
    pub irs: Vec<ImpulseResponse>,
}

impl IrLibrary {
    /// Create an empty library.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an impulse response to the library.
    pub fn add(&mut self, ir: ImpulseResponse) {
        self.irs.push(ir);
    }
}

/// Read an entire library in one call.
pub fn read_library<R: Read + Seek>(source: R) -> Result<IrLibrary, LibraryError> {
    let mut reader = LibraryReader::new(source)?;

    let mut irs = Vec::with_capacity(reader.ir_count());
    for i in 0..reader.ir_count() {
        irs.push(reader.load(i)?);
    }

    Ok(IrLibrary { irs })
}

/// Write an entire library in one call, returning the sink.
pub fn write_library<W: Write + Seek>(sink: W, library: &IrLibrary) -> Result<W, LibraryError> {
    let mut writer = LibraryWriter::new(sink);

    writer.write_header(library.irs.len())?;
    for ir in &library.irs {
        writer.write_ir(ir)?;
    }

    writer.close()
}

/// List the IRs in a library without loading audio data.
pub fn list_irs<R: Read + Seek>(source: R) -> Result<Vec<IndexEntry>, LibraryError> {
    Ok(LibraryReader::new(source)?.list())
}
