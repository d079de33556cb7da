use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::PatchError;

/// Flat string key-value store persisted as one JSON document.
///
/// Every mutation rewrites the whole document through a temp file and a
/// rename, so a reader after a crash sees either the old or the new map,
/// never a mix.
#[derive(Debug)]
pub struct JsonKvStore {
    path: PathBuf,
    values: BTreeMap<String, String>,
}

#[derive(Debug, Default)]
pub struct KvBatch {
    ops: Vec<(String, Option<String>)>,
}

impl KvBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(mut self, key: &str, value: impl Into<String>) -> Self {
        self.ops.push((key.to_string(), Some(value.into())));
        self
    }

    pub fn put_opt(self, key: &str, value: Option<impl Into<String>>) -> Self {
        match value {
            Some(value) => self.put(key, value),
            None => self.remove(key),
        }
    }

    pub fn remove(mut self, key: &str) -> Self {
        self.ops.push((key.to_string(), None));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

impl JsonKvStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, PatchError> {
        let path = path.as_ref().to_path_buf();
        let values = load_values(&path)?;
        Ok(Self { path, values })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn get_u32(&self, key: &str) -> Option<u32> {
        self.get(key).and_then(|value| value.trim().parse::<u32>().ok())
    }

    pub fn get_bool(&self, key: &str) -> bool {
        matches!(self.get(key).map(str::trim), Some("true") | Some("1"))
    }

    pub fn apply(&mut self, batch: KvBatch) -> Result<(), PatchError> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut next = self.values.clone();
        for (key, value) in batch.ops {
            match value {
                Some(value) => {
                    next.insert(key, value);
                }
                None => {
                    next.remove(&key);
                }
            }
        }
        persist_values(&self.path, &next)?;
        self.values = next;
        Ok(())
    }

    pub fn put(&mut self, key: &str, value: impl Into<String>) -> Result<(), PatchError> {
        self.apply(KvBatch::new().put(key, value))
    }

    pub fn remove(&mut self, key: &str) -> Result<(), PatchError> {
        if !self.values.contains_key(key) {
            return Ok(());
        }
        self.apply(KvBatch::new().remove(key))
    }
}

fn load_values(path: &Path) -> Result<BTreeMap<String, String>, PatchError> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
        Err(err) => return Err(PatchError::io(path, err)),
    };
    if raw.trim().is_empty() {
        return Ok(BTreeMap::new());
    }
    serde_json::from_str(&raw).map_err(|err| {
        PatchError::io(
            path,
            std::io::Error::new(std::io::ErrorKind::InvalidData, err),
        )
    })
}

fn persist_values(path: &Path, values: &BTreeMap<String, String>) -> Result<(), PatchError> {
    let payload = serde_json::to_vec_pretty(values).map_err(|err| {
        PatchError::io(
            path,
            std::io::Error::new(std::io::ErrorKind::InvalidData, err),
        )
    })?;
    write_atomic(path, &payload)
}

pub(crate) fn atomic_tmp_path(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .map(|value| value.to_string_lossy().to_string())
        .unwrap_or_else(|| "state".to_string());
    path.with_file_name(format!(".{}.tmp", file_name))
}

/// Writes `data` to a sibling temp file, syncs it, then renames it over
/// `path`.
pub(crate) fn write_atomic(path: &Path, data: &[u8]) -> Result<(), PatchError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|err| PatchError::io(parent, err))?;
    }
    let tmp = atomic_tmp_path(path);
    let mut file = fs::File::create(&tmp).map_err(|err| PatchError::io(&tmp, err))?;
    file.write_all(data)
        .and_then(|_| file.sync_all())
        .map_err(|err| PatchError::io(&tmp, err))?;
    drop(file);
    fs::rename(&tmp, path).map_err(|err| PatchError::io(path, err))?;
    sync_parent_dir(path);
    Ok(())
}

#[cfg(unix)]
fn sync_parent_dir(path: &Path) {
    if let Some(parent) = path.parent() {
        if let Ok(dir) = fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
}

#[cfg(not(unix))]
fn sync_parent_dir(_path: &Path) {}
