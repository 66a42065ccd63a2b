//! Whole-file TOML records.
//!
//! Every write goes to a temp file in the target directory and is renamed over
//! the destination, so a concurrent reader sees either the old record or the
//! new one. A missing file reads as `None`.

use std::fs;
use std::io::{self, Write};
use std::path::Path;

use serde::Serialize;
use serde::de::DeserializeOwned;

use super::state_store::DecodeError;
use super::StateError;

pub(crate) fn load<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StateError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(source) => return Err(StateError::io(path, source)),
    };
    let corrupt = |source: DecodeError| StateError::Corrupt {
        path: path.to_path_buf(),
        source,
    };
    let contents = String::from_utf8(bytes).map_err(|err| corrupt(err.into()))?;
    toml::from_str(&contents)
        .map(Some)
        .map_err(|err| corrupt(err.into()))
}

pub(crate) fn save<T: Serialize>(path: &Path, record: &T) -> Result<(), StateError> {
    let contents = toml::to_string(record)?;
    write_atomic(path, contents.as_bytes()).map_err(|source| StateError::io(path, source))
}

/// Replace `path` with `data`, creating the parent directory if needed.
pub(crate) fn write_atomic(path: &Path, data: &[u8]) -> io::Result<()> {
    let dir = path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)?;
    let mut temp = tempfile::NamedTempFile::new_in(dir)?;
    temp.write_all(data)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|err| err.error)?;
    Ok(())
}

/// Delete `path`, treating an already-missing file as success.
pub(crate) fn remove_if_exists(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err),
    }
}
