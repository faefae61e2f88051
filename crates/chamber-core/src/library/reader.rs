//! IR library reading
//!
//! The reader validates the header, loads the whole index up front (cheap:
//! short metadata only) and lazily loads audio on demand. Any truncated read
//! or structural mismatch surfaces as [`LibraryError::Corrupted`] /
//! [`LibraryError::InvalidChunk`]; the reader itself stays usable for other
//! entries afterwards.

use std::io::{Read, Seek, SeekFrom};

use super::{
    IndexEntry, LibraryError, CHUNK_AUDIO, CHUNK_INDEX, CHUNK_IR, CHUNK_META, CURRENT_VERSION,
    MAGIC, SUB_CHUNK_HEADER_SIZE,
};
use crate::f16;
use crate::types::{ImpulseResponse, IrMetadata, Sample};

/// Reads IR library files from any seekable byte source.
pub struct LibraryReader<R: Read + Seek> {
    source: R,
    version: u16,
    ir_count: u32,
    index: Vec<IndexEntry>,
}

impl<R: Read + Seek> LibraryReader<R> {
    /// Open a library: validate the header and load the index.
    pub fn new(source: R) -> Result<Self, LibraryError> {
        let mut reader = Self {
            source,
            version: 0,
            ir_count: 0,
            index: Vec::new(),
        };

        reader.read_header()?;
        reader.read_index()?;

        Ok(reader)
    }

    /// Format version of the library.
    pub fn version(&self) -> u16 {
        self.version
    }

    /// Number of IRs in the library.
    pub fn ir_count(&self) -> usize {
        self.ir_count as usize
    }

    /// Metadata for all IRs, without loading audio data.
    pub fn list(&self) -> Vec<IndexEntry> {
        self.index.clone()
    }

    /// Load a specific IR by index.
    pub fn load(&mut self, index: usize) -> Result<ImpulseResponse, LibraryError> {
        let offset = match self.index.get(index) {
            Some(entry) => entry.offset,
            None => {
                return Err(LibraryError::IndexOutOfRange {
                    index,
                    count: self.index.len(),
                })
            }
        };

        self.seek_to(offset)?;
        self.read_ir_chunk()
    }

    /// Load an IR by name.
    pub fn load_by_name(&mut self, name: &str) -> Result<ImpulseResponse, LibraryError> {
        match self.index.iter().position(|entry| entry.name == name) {
            Some(i) => self.load(i),
            None => Err(LibraryError::NotFound(name.to_string())),
        }
    }

    fn read_header(&mut self) -> Result<(), LibraryError> {
        let mut magic = [0u8; 4];
        self.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(LibraryError::InvalidMagic);
        }

        self.version = self.read_u16()?;
        if self.version != CURRENT_VERSION {
            return Err(LibraryError::UnsupportedVersion(self.version));
        }

        self.ir_count = self.read_u32()?;
        let index_offset = self.read_u64()?;

        self.seek_to(index_offset)
    }

    fn read_index(&mut self) -> Result<(), LibraryError> {
        let mut chunk_id = [0u8; 4];
        self.read_exact(&mut chunk_id)?;
        if &chunk_id != CHUNK_INDEX {
            return Err(LibraryError::InvalidChunk(format!(
                "expected index chunk, got {:?}",
                String::from_utf8_lossy(&chunk_id)
            )));
        }

        let _chunk_size = self.read_u64()?;

        self.index = Vec::with_capacity(self.ir_count as usize);
        for _ in 0..self.ir_count {
            let entry = self.read_index_entry()?;
            self.index.push(entry);
        }

        Ok(())
    }

    fn read_index_entry(&mut self) -> Result<IndexEntry, LibraryError> {
        let offset = self.read_u64()?;
        let sample_rate = self.read_f64()?;
        let channels = self.read_u32()? as usize;
        let length = self.read_u32()? as usize;
        let name = self.read_string()?;
        let category = self.read_string()?;

        Ok(IndexEntry {
            offset,
            sample_rate,
            channels,
            length,
            name,
            category,
        })
    }

    /// Read a complete IR chunk (metadata + audio) at the current position.
    ///
    /// Sub-chunks with unknown ids are skipped for forward compatibility.
    fn read_ir_chunk(&mut self) -> Result<ImpulseResponse, LibraryError> {
        let mut chunk_id = [0u8; 4];
        self.read_exact(&mut chunk_id)?;
        if &chunk_id != CHUNK_IR {
            return Err(LibraryError::InvalidChunk(format!(
                "expected IR chunk, got {:?}",
                String::from_utf8_lossy(&chunk_id)
            )));
        }

        let chunk_size = self.read_u64()?;

        let mut metadata: Option<IrMetadata> = None;
        let mut data: Option<Vec<Vec<Sample>>> = None;
        let mut consumed: u64 = 0;

        while consumed < chunk_size && data.is_none() {
            let mut sub_id = [0u8; 4];
            self.read_exact(&mut sub_id)?;
            let sub_size = self.read_u32()?;
            consumed += SUB_CHUNK_HEADER_SIZE + sub_size as u64;

            match &sub_id {
                id if id == CHUNK_META => {
                    metadata = Some(self.read_metadata_sub_chunk(sub_size)?);
                }
                id if id == CHUNK_AUDIO => {
                    let meta = metadata.as_ref().ok_or_else(|| {
                        LibraryError::InvalidChunk(
                            "audio sub-chunk before metadata sub-chunk".to_string(),
                        )
                    })?;
                    data = Some(self.read_audio_sub_chunk(sub_size, meta.channels, meta.length)?);
                }
                other => {
                    log::debug!(
                        "skipping unknown sub-chunk {:?} ({} bytes)",
                        String::from_utf8_lossy(other),
                        sub_size
                    );
                    self.skip(sub_size as i64)?;
                }
            }
        }

        let metadata =
            metadata.ok_or_else(|| LibraryError::InvalidChunk("missing META sub-chunk".into()))?;
        let data =
            data.ok_or_else(|| LibraryError::InvalidChunk("missing AUDI sub-chunk".into()))?;

        Ok(ImpulseResponse { metadata, data })
    }

    /// Parse the META sub-chunk. The stream is left positioned at the end of
    /// the declared sub-chunk size even if a newer writer appended fields.
    fn read_metadata_sub_chunk(&mut self, sub_size: u32) -> Result<IrMetadata, LibraryError> {
        let start = self.position()?;

        let sample_rate = self.read_f64()?;
        let channels = self.read_u32()? as usize;
        let length = self.read_u32()? as usize;
        let name = self.read_string()?;
        let description = self.read_string()?;
        let category = self.read_string()?;

        let tag_count = self.read_u16()?;
        let mut tags = Vec::with_capacity(tag_count as usize);
        for _ in 0..tag_count {
            tags.push(self.read_string()?);
        }

        // Skip any trailing fields from a newer writer
        self.seek_to(start + sub_size as u64)?;

        Ok(IrMetadata {
            name,
            description,
            category,
            tags,
            sample_rate,
            channels,
            length,
        })
    }

    /// Read and decode the AUDI sub-chunk.
    fn read_audio_sub_chunk(
        &mut self,
        sub_size: u32,
        channels: usize,
        length: usize,
    ) -> Result<Vec<Vec<Sample>>, LibraryError> {
        if channels == 0 {
            return Err(LibraryError::Corrupted("IR declares zero channels".into()));
        }

        let expected = channels
            .checked_mul(length)
            .and_then(|s| s.checked_mul(2))
            .ok_or_else(|| LibraryError::Corrupted("audio size overflow".into()))?;
        if sub_size as usize != expected {
            return Err(LibraryError::Corrupted(format!(
                "audio sub-chunk is {} bytes, metadata implies {} ({} ch x {} samples)",
                sub_size, expected, channels, length
            )));
        }

        let mut payload = vec![0u8; sub_size as usize];
        self.read_exact(&mut payload)?;

        Ok(f16::decode_deinterleaved(&payload, channels))
    }

    // ── byte-level helpers ──────────────────────────────────────────────

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), LibraryError> {
        self.source
            .read_exact(buf)
            .map_err(|e| LibraryError::Corrupted(format!("truncated read: {e}")))
    }

    fn read_u16(&mut self) -> Result<u16, LibraryError> {
        let mut buf = [0u8; 2];
        self.read_exact(&mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    fn read_u32(&mut self) -> Result<u32, LibraryError> {
        let mut buf = [0u8; 4];
        self.read_exact(&mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn read_u64(&mut self) -> Result<u64, LibraryError> {
        let mut buf = [0u8; 8];
        self.read_exact(&mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    fn read_f64(&mut self) -> Result<f64, LibraryError> {
        Ok(f64::from_bits(self.read_u64()?))
    }

    /// Read a u16-length-prefixed UTF-8 string.
    fn read_string(&mut self) -> Result<String, LibraryError> {
        let len = self.read_u16()?;
        if len == 0 {
            return Ok(String::new());
        }

        let mut buf = vec![0u8; len as usize];
        self.read_exact(&mut buf)?;

        String::from_utf8(buf)
            .map_err(|_| LibraryError::Corrupted("string is not valid UTF-8".into()))
    }

    fn seek_to(&mut self, offset: u64) -> Result<(), LibraryError> {
        self.source
            .seek(SeekFrom::Start(offset))
            .map(|_| ())
            .map_err(|e| LibraryError::Corrupted(format!("seek failed: {e}")))
    }

    fn skip(&mut self, bytes: i64) -> Result<(), LibraryError> {
        self.source
            .seek(SeekFrom::Current(bytes))
            .map(|_| ())
            .map_err(|e| LibraryError::Corrupted(format!("seek failed: {e}")))
    }

    fn position(&mut self) -> Result<u64, LibraryError> {
        self.source
            .stream_position()
            .map_err(|e| LibraryError::Corrupted(format!("seek failed: {e}")))
    }
}
