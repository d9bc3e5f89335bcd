//! Value persistence with atomic replacement
//!
//! `store_file` writes the pretty encoding to a temporary file in the
//! destination directory, syncs it and renames it over the target, so
//! readers never observe a partially written file.

use std::io::Write as _;
use std::path::Path;

use thiserror::Error;

use super::codec::{self, DecodeError, EncodeError};
use super::value::Value;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("failed to persist temporary file: {0}")]
    Persist(#[from] tempfile::PersistError),
}

/// Encodes `value` and atomically replaces the file at `path` with it.
pub fn store_file(path: impl AsRef<Path>, value: &Value) -> Result<(), StoreError> {
    let path = path.as_ref();
    let text = codec::encode_pretty(value)?;
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(text.as_bytes())?;
    tmp.write_all(b"\n")?;
    tmp.as_file().sync_all()?;
    tmp.persist(path)?;
    Ok(())
}

/// Reads the file at `path` and decodes the value stored in it.
pub fn load_file(path: impl AsRef<Path>) -> Result<Value, StoreError> {
    let text = std::fs::read_to_string(path)?;
    Ok(codec::decode(&text)?)
}
