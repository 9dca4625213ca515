use sql_client::ClientError;
use thiserror::Error;

use crate::chunk::ChunkError;

#[derive(Debug, Error)]
pub enum BackupError {
    #[error(transparent)]
    Sql(#[from] ClientError),

    #[error("archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Chunk(#[from] ChunkError),

    #[error("backup cancelled after exhausting retries for table {table}: {source}")]
    RetriesExhausted { table: String, #[source] source: ClientError },
}

#[derive(Debug, Error)]
pub enum RestoreError {
    #[error(transparent)]
    Sql(#[from] ClientError),

    #[error("archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Chunk(#[from] ChunkError),

    #[error("unsupported metadata format_version '{0}', expected '1.0'")]
    UnsupportedFormatVersion(String),

    #[error("Checksum mismatch")]
    ChecksumMismatch,

    #[error("malformed chunk entry path: {0}")]
    MalformedEntryPath(String),

    #[error("archive entry references table '{0}' which is not present in metadata.json")]
    UnknownTableInArchive(String),

    #[error("restore cancelled after exhausting retries for table {table}: {source}")]
    RetriesExhausted { table: String, #[source] source: ClientError },
}
