//! IR library writing
//!
//! Libraries are written in a single forward pass: header, then one chunk per
//! IR, then the index chunk. The index offset is back-patched into the header
//! on [`LibraryWriter::close`], which is why the sink must support seeking.

use std::io::{Seek, SeekFrom, Write};

use super::{
    LibraryError, CHUNK_AUDIO, CHUNK_HEADER_SIZE, CHUNK_INDEX, CHUNK_IR, CHUNK_META,
    CURRENT_VERSION, FILE_HEADER_SIZE, INDEX_OFFSET_FIELD, MAGIC, SUB_CHUNK_HEADER_SIZE,
};
use crate::f16;
use crate::types::{ImpulseResponse, IrMetadata};

/// Writes IR library files to any seekable byte sink.
pub struct LibraryWriter<W: Write + Seek> {
    sink: W,
    offsets: Vec<u64>,
    metas: Vec<IrMetadata>,
    position: u64,
}

impl<W: Write + Seek> LibraryWriter<W> {
    /// Create a writer. Call [`write_header`](Self::write_header) before
    /// writing any IRs.
    pub fn new(sink: W) -> Self {
        Self {
            sink,
            offsets: Vec::new(),
            metas: Vec::new(),
            position: 0,
        }
    }

    /// Write the file header. `ir_count` is the number of IRs that will
    /// follow; the index offset is reserved and patched on close.
    pub fn write_header(&mut self, ir_count: usize) -> Result<(), LibraryError> {
        self.sink.write_all(MAGIC)?;
        self.sink.write_all(&CURRENT_VERSION.to_le_bytes())?;
        self.sink.write_all(&(ir_count as u32).to_le_bytes())?;
        self.sink.write_all(&0u64.to_le_bytes())?; // index offset placeholder

        self.position = FILE_HEADER_SIZE;
        Ok(())
    }

    /// Append one IR chunk and record its offset for the index.
    ///
    /// The metadata must describe the audio data exactly; a mismatch is a
    /// caller bug.
    pub fn write_ir(&mut self, ir: &ImpulseResponse) -> Result<(), LibraryError> {
        assert_eq!(
            ir.metadata.channels,
            ir.data.len(),
            "metadata channel count must match audio data"
        );
        for channel in &ir.data {
            assert_eq!(
                channel.len(),
                ir.metadata.length,
                "metadata length must match every channel"
            );
        }

        self.offsets.push(self.position);
        self.metas.push(ir.metadata.clone());

        let meta_chunk = build_metadata_sub_chunk(&ir.metadata);
        let audio_chunk = build_audio_sub_chunk(ir);
        let chunk_size = (meta_chunk.len() + audio_chunk.len()) as u64;

        self.sink.write_all(CHUNK_IR)?;
        self.sink.write_all(&chunk_size.to_le_bytes())?;
        self.sink.write_all(&meta_chunk)?;
        self.sink.write_all(&audio_chunk)?;

        self.position += CHUNK_HEADER_SIZE + chunk_size;
        Ok(())
    }

    /// Finalize the file: write the index chunk and back-patch the header.
    /// Returns the sink.
    pub fn close(mut self) -> Result<W, LibraryError> {
        let index_offset = self.position;
        let index_data = self.build_index_chunk();

        self.sink.write_all(CHUNK_INDEX)?;
        self.sink.write_all(&(index_data.len() as u64).to_le_bytes())?;
        self.sink.write_all(&index_data)?;

        self.sink.seek(SeekFrom::Start(INDEX_OFFSET_FIELD))?;
        self.sink.write_all(&index_offset.to_le_bytes())?;
        self.sink.flush()?;

        Ok(self.sink)
    }

    fn build_index_chunk(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        for (offset, meta) in self.offsets.iter().zip(self.metas.iter()) {
            buf.extend_from_slice(&offset.to_le_bytes());
            buf.extend_from_slice(&meta.sample_rate.to_bits().to_le_bytes());
            buf.extend_from_slice(&(meta.channels as u32).to_le_bytes());
            buf.extend_from_slice(&(meta.length as u32).to_le_bytes());
            put_string(&mut buf, &meta.name);
            put_string(&mut buf, &meta.category);
        }
        buf
    }
}

fn build_metadata_sub_chunk(meta: &IrMetadata) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&meta.sample_rate.to_bits().to_le_bytes());
    body.extend_from_slice(&(meta.channels as u32).to_le_bytes());
    body.extend_from_slice(&(meta.length as u32).to_le_bytes());
    put_string(&mut body, &meta.name);
    put_string(&mut body, &meta.description);
    put_string(&mut body, &meta.category);
    body.extend_from_slice(&(meta.tags.len() as u16).to_le_bytes());
    for tag in &meta.tags {
        put_string(&mut body, tag);
    }

    let mut chunk = Vec::with_capacity(SUB_CHUNK_HEADER_SIZE as usize + body.len());
    chunk.extend_from_slice(CHUNK_META);
    chunk.extend_from_slice(&(body.len() as u32).to_le_bytes());
    chunk.extend(body);
    chunk
}

fn build_audio_sub_chunk(ir: &ImpulseResponse) -> Vec<u8> {
    let payload = f16::encode_interleaved(&ir.data);

    let mut chunk = Vec::with_capacity(SUB_CHUNK_HEADER_SIZE as usize + payload.len());
    chunk.extend_from_slice(CHUNK_AUDIO);
    chunk.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    chunk.extend(payload);
    chunk
}

/// Append a u16-length-prefixed UTF-8 string.
fn put_string(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(&(s.len() as u16).to_le_bytes());
    buf.extend_from_slice(s.as_bytes());
}

#[cfg(test)]
mod tests {
    use super::super::LibraryReader;
    use super::*;
    use crate::types::ImpulseResponse;
    use std::io::Cursor;

    fn test_ir(name: &str, channels: usize, length: usize) -> ImpulseResponse {
        let data: Vec<Vec<f32>> = (0..channels)
            .map(|ch| {
                (0..length)
                    .map(|i| ((i + ch) as f32 / length as f32) - 0.5)
                    .collect()
            })
            .collect();

        let mut ir = ImpulseResponse::new(name, 48000.0, data);
        ir.metadata.description = format!("{name} description");
        ir.metadata.category = "Hall".to_string();
        ir.metadata.tags = vec!["large".to_string(), "bright".to_string()];
        ir
    }

    #[test]
    fn test_round_trip_metadata() {
        let ir = test_ir("Cathedral", 2, 256);

        let mut writer = LibraryWriter::new(Cursor::new(Vec::new()));
        writer.write_header(1).unwrap();
        writer.write_ir(&ir).unwrap();
        let bytes = writer.close().unwrap().into_inner();

        let mut reader = LibraryReader::new(Cursor::new(bytes)).unwrap();
        let loaded = reader.load(0).unwrap();

        assert_eq!(loaded.metadata, ir.metadata);
    }

    #[test]
    fn test_round_trip_audio_within_f16_tolerance() {
        let ir = test_ir("Plate", 2, 512);

        let mut writer = LibraryWriter::new(Cursor::new(Vec::new()));
        writer.write_header(1).unwrap();
        writer.write_ir(&ir).unwrap();
        let bytes = writer.close().unwrap().into_inner();

        let mut reader = LibraryReader::new(Cursor::new(bytes)).unwrap();
        let loaded = reader.load(0).unwrap();

        for (orig_ch, loaded_ch) in ir.data.iter().zip(loaded.data.iter()) {
            for (&a, &b) in orig_ch.iter().zip(loaded_ch.iter()) {
                assert!((a - b).abs() <= 1e-3, "sample {a} decoded as {b}");
            }
        }
    }

    #[test]
    fn test_index_offsets_dereference() {
        let irs = vec![
            test_ir("First", 1, 64),
            test_ir("Second", 2, 128),
            test_ir("Third", 1, 32),
        ];

        let mut writer = LibraryWriter::new(Cursor::new(Vec::new()));
        writer.write_header(irs.len()).unwrap();
        for ir in &irs {
            writer.write_ir(ir).unwrap();
        }
        let bytes = writer.close().unwrap().into_inner();

        let mut reader = LibraryReader::new(Cursor::new(bytes)).unwrap();
        let entries = reader.list();
        assert_eq!(entries.len(), 3);

        // Every index entry must point at a well-formed IR chunk whose
        // metadata matches the short metadata in the entry.
        for (i, entry) in entries.iter().enumerate() {
            let loaded = reader.load(i).unwrap();
            assert_eq!(loaded.metadata.name, entry.name);
            assert_eq!(loaded.metadata.channels, entry.channels);
            assert_eq!(loaded.metadata.length, entry.length);
        }

        assert_eq!(entries[0].offset, 18);
        assert!(entries[1].offset > entries[0].offset);
        assert!(entries[2].offset > entries[1].offset);
    }

    #[test]
    fn test_by_name_after_round_trip() {
        let mut writer = LibraryWriter::new(Cursor::new(Vec::new()));
        writer.write_header(2).unwrap();
        writer.write_ir(&test_ir("Alpha", 1, 16)).unwrap();
        writer.write_ir(&test_ir("Beta", 1, 16)).unwrap();
        let bytes = writer.close().unwrap().into_inner();

        let mut reader = LibraryReader::new(Cursor::new(bytes)).unwrap();
        assert_eq!(reader.load_by_name("Beta").unwrap().metadata.name, "Beta");
    }
}
