//! Persistence for the vector database.
//!
//! Each modality persists as a pair of files plus a shared manifest:
//!
//! Vector file (`text_vectors.bin` / `image_vectors.bin`):
//!
//! Header (47 bytes):
//! - version: u8 (1)
//! - model_id: [u8; 32] (SHA256 hash of the encoder model name)
//! - dimensions: u16 (little-endian)
//! - entry_count: u64 (little-endian)
//! - checksum: u32 (CRC32 of header fields before checksum)
//!
//! Rows (repeated `entry_count` times, position = row number):
//! - embedding: [f32; dimensions] (little-endian)
//!
//! Record file (`text_records.json` / `image_records.json`): a JSON array of
//! records, one per row, in row order.
//!
//! Manifest (`database.json`): embedding dimension, per-modality counts and
//! the encoder model name. Loading fails fatally when any of these disagree
//! with the files on disk.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::retrieval::index::VectorIndex;
use crate::retrieval::metadata::{KnowledgeRecord, MetadataStore};

/// Current vector file format version
const FORMAT_VERSION: u8 = 1;

/// Header size in bytes: version(1) + model_id(32) + dimensions(2) + entry_count(8) + checksum(4)
const HEADER_SIZE: usize = 47;

pub const MANIFEST_FILE: &str = "database.json";
pub const TEXT_VECTORS_FILE: &str = "text_vectors.bin";
pub const IMAGE_VECTORS_FILE: &str = "image_vectors.bin";
pub const TEXT_RECORDS_FILE: &str = "text_records.json";
pub const IMAGE_RECORDS_FILE: &str = "image_records.json";

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid file format: {0}")]
    InvalidFormat(String),

    #[error("Version mismatch: file version {0}, supported version {1}")]
    VersionMismatch(u8, u8),

    #[error("Model mismatch: file was built with a different encoder model")]
    ModelMismatch,

    #[error("Checksum mismatch: file may be corrupted")]
    ChecksumMismatch,

    #[error("Dimension mismatch: expected {expected}, file has {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Cardinality mismatch: {vectors} vectors but {records} metadata records")]
    CardinalityMismatch { vectors: usize, records: usize },

    #[error("Record file error: {0}")]
    Records(#[from] serde_json::Error),
}

/// Summary record persisted alongside the indices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseManifest {
    pub embedding_dim: usize,
    pub text_count: usize,
    pub image_count: usize,
    pub model: String,
}

/// Storage manager for one modality's vector file.
pub struct VectorFile {
    path: PathBuf,
}

impl VectorFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Load a vector index from this file.
    ///
    /// The header's model id and dimensions must match the expected values.
    pub fn load(
        &self,
        expected_model_id: &[u8; 32],
        expected_dimensions: usize,
    ) -> Result<VectorIndex, StorageError> {
        let file = File::open(&self.path)?;
        let mut reader = BufReader::new(file);

        let header = read_header(&mut reader)?;
        if header.model_id != *expected_model_id {
            return Err(StorageError::ModelMismatch);
        }
        if header.dimensions as usize != expected_dimensions {
            return Err(StorageError::DimensionMismatch {
                expected: expected_dimensions,
                got: header.dimensions as usize,
            });
        }

        let dimensions = header.dimensions as usize;
        let mut index = VectorIndex::with_capacity(dimensions, header.entry_count as usize);
        let mut row = vec![0f32; dimensions];
        let mut buf = vec![0u8; dimensions * 4];
        for _ in 0..header.entry_count {
            reader.read_exact(&mut buf)?;
            for (value, bytes) in row.iter_mut().zip(buf.chunks_exact(4)) {
                *value = f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
            }
            index
                .push(&row)
                .map_err(|e| StorageError::InvalidFormat(e.to_string()))?;
        }

        Ok(index)
    }

    /// Save a vector index to this file.
    ///
    /// Uses atomic write: temp file -> fsync -> rename
    pub fn save(&self, index: &VectorIndex, model_id: &[u8; 32]) -> Result<(), StorageError> {
        let temp_path = self.path.with_extension("tmp");

        let result = self.write_to_file(&temp_path, index, model_id);
        if result.is_err() {
            let _ = std::fs::remove_file(&temp_path);
            return result;
        }

        std::fs::rename(&temp_path, &self.path)?;
        Ok(())
    }

    fn write_to_file(
        &self,
        path: &Path,
        index: &VectorIndex,
        model_id: &[u8; 32],
    ) -> Result<(), StorageError> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);

        let header = Header {
            version: FORMAT_VERSION,
            model_id: *model_id,
            dimensions: index.dimensions() as u16,
            entry_count: index.len() as u64,
        };
        write_header(&mut writer, &header)?;

        for row in index.rows() {
            for &value in row {
                writer.write_all(&value.to_le_bytes())?;
            }
        }

        writer.flush()?;
        let file = writer
            .into_inner()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        file.sync_all()?;

        Ok(())
    }
}

#[derive(Debug)]
struct Header {
    version: u8,
    model_id: [u8; 32],
    dimensions: u16,
    entry_count: u64,
}

fn read_header(reader: &mut BufReader<File>) -> Result<Header, StorageError> {
    let mut header_bytes = [0u8; HEADER_SIZE];
    reader.read_exact(&mut header_bytes)?;

    let version = header_bytes[0];
    if version > FORMAT_VERSION {
        return Err(StorageError::VersionMismatch(version, FORMAT_VERSION));
    }

    let mut model_id = [0u8; 32];
    model_id.copy_from_slice(&header_bytes[1..33]);

    let dimensions = u16::from_le_bytes([header_bytes[33], header_bytes[34]]);
    let entry_count = u64::from_le_bytes([
        header_bytes[35],
        header_bytes[36],
        header_bytes[37],
        header_bytes[38],
        header_bytes[39],
        header_bytes[40],
        header_bytes[41],
        header_bytes[42],
    ]);
    let stored_checksum = u32::from_le_bytes([
        header_bytes[43],
        header_bytes[44],
        header_bytes[45],
        header_bytes[46],
    ]);

    let computed_checksum = crc32fast::hash(&header_bytes[0..43]);
    if stored_checksum != computed_checksum {
        return Err(StorageError::ChecksumMismatch);
    }

    Ok(Header {
        version,
        model_id,
        dimensions,
        entry_count,
    })
}

fn write_header(writer: &mut BufWriter<File>, header: &Header) -> Result<(), StorageError> {
    let mut header_bytes = [0u8; HEADER_SIZE];

    header_bytes[0] = header.version;
    header_bytes[1..33].copy_from_slice(&header.model_id);
    header_bytes[33..35].copy_from_slice(&header.dimensions.to_le_bytes());
    header_bytes[35..43].copy_from_slice(&header.entry_count.to_le_bytes());

    let checksum = crc32fast::hash(&header_bytes[0..43]);
    header_bytes[43..47].copy_from_slice(&checksum.to_le_bytes());

    writer.write_all(&header_bytes)?;
    Ok(())
}

/// Load a metadata record file.
pub fn load_records(path: &Path) -> Result<MetadataStore, StorageError> {
    let file = File::open(path)?;
    let records: Vec<KnowledgeRecord> = serde_json::from_reader(BufReader::new(file))?;
    Ok(MetadataStore::from_records(records))
}

/// Save a metadata record file with the same atomic-replace discipline as
/// the vector files.
pub fn save_records(path: &Path, store: &MetadataStore) -> Result<(), StorageError> {
    let temp_path = path.with_extension("tmp");

    let result = (|| -> Result<(), StorageError> {
        let file = File::create(&temp_path)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, store.records())?;
        writer.flush()?;
        let file = writer
            .into_inner()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        file.sync_all()?;
        Ok(())
    })();

    if result.is_err() {
        let _ = std::fs::remove_file(&temp_path);
        return result;
    }

    std::fs::rename(&temp_path, path)?;
    Ok(())
}

pub fn load_manifest(database_dir: &Path) -> Result<DatabaseManifest, StorageError> {
    let file = File::open(database_dir.join(MANIFEST_FILE))?;
    Ok(serde_json::from_reader(BufReader::new(file))?)
}

pub fn save_manifest(
    database_dir: &Path,
    manifest: &DatabaseManifest,
) -> Result<(), StorageError> {
    let path = database_dir.join(MANIFEST_FILE);
    let json = serde_json::to_string_pretty(manifest)?;
    std::fs::write(path, json)?;
    Ok(())
}

/// Load one modality's vector/record pair, enforcing the positional pairing
/// invariant.
pub fn load_pair(
    vectors_path: &Path,
    records_path: &Path,
    model_id: &[u8; 32],
    dimensions: usize,
) -> Result<(VectorIndex, MetadataStore), StorageError> {
    let index = VectorFile::new(vectors_path.to_path_buf()).load(model_id, dimensions)?;
    let store = load_records(records_path)?;

    if index.len() != store.len() {
        return Err(StorageError::CardinalityMismatch {
            vectors: index.len(),
            records: store.len(),
        });
    }

    Ok((index, store))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retrieval::metadata::TextRecord;
    use std::io::Seek;

    fn test_model_id() -> [u8; 32] {
        let mut id = [0u8; 32];
        id[0] = 0xAB;
        id[31] = 0xCD;
        id
    }

    fn text_record(chunk: u32) -> KnowledgeRecord {
        KnowledgeRecord::Text(TextRecord {
            chapter_number: 1,
            chapter_name: "Origins".to_string(),
            chunk_id: chunk,
            text: format!("passage {chunk}"),
        })
    }

    #[test]
    fn test_save_and_load_empty() {
        let dir = tempfile::tempdir().unwrap();
        let storage = VectorFile::new(dir.path().join("vectors.bin"));
        let model_id = test_model_id();

        let index = VectorIndex::new(512);
        storage.save(&index, &model_id).unwrap();
        assert!(storage.exists());

        let loaded = storage.load(&model_id, 512).unwrap();
        assert_eq!(loaded.len(), 0);
        assert_eq!(loaded.dimensions(), 512);
    }

    #[test]
    fn test_save_and_load_preserves_rows_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let storage = VectorFile::new(dir.path().join("vectors.bin"));
        let model_id = test_model_id();

        let mut index = VectorIndex::new(3);
        index.push(&[1.0, 0.0, 0.0]).unwrap();
        index.push(&[0.0, 1.0, 0.0]).unwrap();
        index.push(&[0.0, 0.0, 1.0]).unwrap();
        storage.save(&index, &model_id).unwrap();

        let loaded = storage.load(&model_id, 3).unwrap();
        assert_eq!(loaded.len(), 3);
        assert_eq!(loaded.row(0), Some(&[1.0, 0.0, 0.0][..]));
        assert_eq!(loaded.row(2), Some(&[0.0, 0.0, 1.0][..]));
    }

    #[test]
    fn test_reload_returns_identical_search_results() {
        let dir = tempfile::tempdir().unwrap();
        let storage = VectorFile::new(dir.path().join("vectors.bin"));
        let model_id = test_model_id();

        let mut index = VectorIndex::new(2);
        index.push(&[0.8, 0.6]).unwrap();
        index.push(&[1.0, 0.0]).unwrap();
        index.push(&[0.6, 0.8]).unwrap();
        storage.save(&index, &model_id).unwrap();

        let loaded = storage.load(&model_id, 2).unwrap();
        let query = [1.0, 0.0];
        let before = index.search(&query, 3).unwrap();
        let after = loaded.search(&query, 3).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn test_model_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let storage = VectorFile::new(dir.path().join("vectors.bin"));

        storage.save(&VectorIndex::new(3), &test_model_id()).unwrap();

        let mut wrong_model_id = [0u8; 32];
        wrong_model_id[0] = 0xFF;
        let result = storage.load(&wrong_model_id, 3);
        assert!(matches!(result, Err(StorageError::ModelMismatch)));
    }

    #[test]
    fn test_dimension_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let storage = VectorFile::new(dir.path().join("vectors.bin"));
        let model_id = test_model_id();

        storage.save(&VectorIndex::new(3), &model_id).unwrap();

        let result = storage.load(&model_id, 512);
        assert!(matches!(
            result,
            Err(StorageError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn test_checksum_detects_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vectors.bin");
        let storage = VectorFile::new(path.clone());
        let model_id = test_model_id();

        let mut index = VectorIndex::new(3);
        index.push(&[1.0, 0.0, 0.0]).unwrap();
        storage.save(&index, &model_id).unwrap();

        let mut file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.seek(std::io::SeekFrom::Start(10)).unwrap();
        file.write_all(&[0xFF]).unwrap();

        let result = storage.load(&model_id, 3);
        assert!(matches!(result, Err(StorageError::ChecksumMismatch)));
    }

    #[test]
    fn test_atomic_write_cleans_up_on_error() {
        let path = PathBuf::from("/nonexistent/directory/vectors.bin");
        let storage = VectorFile::new(path.clone());

        let result = storage.save(&VectorIndex::new(3), &test_model_id());
        assert!(result.is_err());
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_records_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.json");

        let store = MetadataStore::from_records(vec![text_record(0), text_record(1)]);
        save_records(&path, &store).unwrap();

        let loaded = load_records(&path).unwrap();
        assert_eq!(loaded.records(), store.records());
    }

    #[test]
    fn test_load_pair_cardinality_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let vectors_path = dir.path().join("vectors.bin");
        let records_path = dir.path().join("records.json");
        let model_id = test_model_id();

        let mut index = VectorIndex::new(2);
        index.push(&[1.0, 0.0]).unwrap();
        index.push(&[0.0, 1.0]).unwrap();
        VectorFile::new(vectors_path.clone())
            .save(&index, &model_id)
            .unwrap();
        save_records(
            &records_path,
            &MetadataStore::from_records(vec![text_record(0)]),
        )
        .unwrap();

        let result = load_pair(&vectors_path, &records_path, &model_id, 2);
        assert!(matches!(
            result,
            Err(StorageError::CardinalityMismatch {
                vectors: 2,
                records: 1
            })
        ));
    }

    #[test]
    fn test_manifest_round_trip() {
        let dir = tempfile::tempdir().unwrap();

        let manifest = DatabaseManifest {
            embedding_dim: 512,
            text_count: 42,
            image_count: 7,
            model: "clip-vit-b-32".to_string(),
        };
        save_manifest(dir.path(), &manifest).unwrap();

        let loaded = load_manifest(dir.path()).unwrap();
        assert_eq!(loaded, manifest);
    }
}
