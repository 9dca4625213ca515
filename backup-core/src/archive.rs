//! The ZIP container: `metadata.json`, optional `checksums.json`, and
//! `data/<table>/chunk_<NNNNN>.msgpack` entries (spec §4.8, §6).

use std::collections::HashMap;
use std::io::{Read, Seek, Write};

use common::CompressionMethod;
use sha2::{Digest, Sha256};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod as ZipCompressionMethod, ZipArchive, ZipWriter};

use crate::error::{BackupError, RestoreError};
use crate::metadata::Metadata;

pub const METADATA_ENTRY: &str = "metadata.json";
pub const CHECKSUMS_ENTRY: &str = "checksums.json";

/// `data/<table>/chunk_<NNNNN>.msgpack` → sha256 hex digest, the shape
/// `checksums.json` is serialized as.
pub type ChecksumMap = HashMap<String, String>;

pub fn chunk_entry_path(table: &str, chunk_index: u32) -> String {
    format!("data/{table}/chunk_{chunk_index:05}.msgpack")
}

/// Parses `data/<table>/chunk_<NNNNN>.msgpack` back into `(table, index)`.
pub fn parse_chunk_entry_path(path: &str) -> Result<(String, u32), RestoreError> {
    let rest = path.strip_prefix("data/").ok_or_else(|| RestoreError::MalformedEntryPath(path.to_string()))?;
    let (table, file) = rest.rsplit_once('/').ok_or_else(|| RestoreError::MalformedEntryPath(path.to_string()))?;
    let stem = file
        .strip_prefix("chunk_")
        .and_then(|s| s.strip_suffix(".msgpack"))
        .ok_or_else(|| RestoreError::MalformedEntryPath(path.to_string()))?;
    let index: u32 = stem.parse().map_err(|_| RestoreError::MalformedEntryPath(path.to_string()))?;
    Ok((table.to_string(), index))
}

fn zip_compression(method: CompressionMethod) -> ZipCompressionMethod {
    match method {
        CompressionMethod::Stored => ZipCompressionMethod::Stored,
        CompressionMethod::Deflate => ZipCompressionMethod::Deflated,
    }
}

/// Backup-side writer: buffers computed checksums in memory and writes
/// `checksums.json` alongside `metadata.json` once every table has drained
/// (spec §4.5 stage 9).
pub struct ArchiveWriter<W: Write + Seek> {
    zip: ZipWriter<W>,
    options: SimpleFileOptions,
    checksums: ChecksumMap,
}

impl<W: Write + Seek> ArchiveWriter<W> {
    pub fn new(sink: W, compression: CompressionMethod, compression_level: u8) -> Self {
        let options = SimpleFileOptions::default()
            .compression_method(zip_compression(compression))
            .compression_level(Some(compression_level as i64));
        Self { zip: ZipWriter::new(sink), options, checksums: HashMap::new() }
    }

    /// Writes one chunk entry and records its SHA-256 digest. Callers hold
    /// the single mutex guarding archive writes (spec §5) — this type is
    /// not itself `Sync`.
    pub fn write_chunk(&mut self, table: &str, chunk_index: u32, bytes: &[u8]) -> Result<(), BackupError> {
        let path = chunk_entry_path(table, chunk_index);
        self.zip.start_file(&path, self.options)?;
        self.zip.write_all(bytes)?;

        let mut hasher = Sha256::new();
        hasher.update(bytes);
        let digest = hasher.finalize();
        self.checksums.insert(path, hex_encode(&digest));
        Ok(())
    }

    pub fn finish(mut self, metadata: &Metadata, write_checksums: bool) -> Result<W, BackupError> {
        self.zip.start_file(METADATA_ENTRY, self.options)?;
        self.zip.write_all(serde_json::to_string_pretty(metadata)?.as_bytes())?;

        if write_checksums {
            self.zip.start_file(CHECKSUMS_ENTRY, self.options)?;
            self.zip.write_all(serde_json::to_string_pretty(&self.checksums)?.as_bytes())?;
        }

        Ok(self.zip.finish()?)
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Restore-side reader. `metadata.json` is mandatory; `checksums.json` is
/// optional — its absence just means checksum verification is skipped
/// (spec §4.6, §8.5).
pub struct ArchiveReader<R: Read + Seek> {
    zip: ZipArchive<R>,
    checksums: Option<ChecksumMap>,
}

impl<R: Read + Seek> ArchiveReader<R> {
    pub fn open(source: R) -> Result<Self, RestoreError> {
        let mut zip = ZipArchive::new(source)?;
        let checksums = match zip.by_name(CHECKSUMS_ENTRY) {
            Ok(mut entry) => {
                let mut buf = String::new();
                entry.read_to_string(&mut buf)?;
                Some(serde_json::from_str(&buf)?)
            }
            Err(zip::result::ZipError::FileNotFound) => None,
            Err(e) => return Err(e.into()),
        };
        Ok(Self { zip, checksums })
    }

    pub fn read_metadata(&mut self) -> Result<Metadata, RestoreError> {
        let mut entry = self.zip.by_name(METADATA_ENTRY)?;
        let mut buf = String::new();
        entry.read_to_string(&mut buf)?;
        let metadata: Metadata = serde_json::from_str(&buf)?;
        metadata.validate_format_version()?;
        Ok(metadata)
    }

    /// All `data/<table>/...` entry paths, grouped by table and sorted by
    /// chunk index so restore workers can consume them in order.
    pub fn chunk_entries_by_table(&mut self) -> Result<HashMap<String, Vec<(u32, String)>>, RestoreError> {
        let mut by_table: HashMap<String, Vec<(u32, String)>> = HashMap::new();
        for i in 0..self.zip.len() {
            let name = self.zip.by_index(i)?.name().to_string();
            if !name.starts_with("data/") {
                continue;
            }
            let (table, index) = parse_chunk_entry_path(&name)?;
            by_table.entry(table).or_default().push((index, name));
        }
        for entries in by_table.values_mut() {
            entries.sort_by_key(|(index, _)| *index);
        }
        Ok(by_table)
    }

    /// Reads one chunk entry's raw bytes, verifying its checksum first if
    /// `checksums.json` was present (spec §8.5, scenario S7: mismatch
    /// surfaces the literal message `"Checksum mismatch"`).
    pub fn read_chunk(&mut self, entry_path: &str) -> Result<Vec<u8>, RestoreError> {
        let mut entry = self.zip.by_name(entry_path)?;
        let mut bytes = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut bytes)?;
        drop(entry);

        if let Some(checksums) = &self.checksums {
            if let Some(expected) = checksums.get(entry_path) {
                let mut hasher = Sha256::new();
                hasher.update(&bytes);
                let actual = hex_encode(&hasher.finalize());
                if &actual != expected {
                    return Err(RestoreError::ChecksumMismatch);
                }
            }
        }
        Ok(bytes)
    }

    pub fn has_checksums(&self) -> bool {
        self.checksums.is_some()
    }
}
