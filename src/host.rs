//! Boundaries to the host process: code injection, resource overlay and
//! operator notification, plus the default adapters used by the CLI.

use std::collections::BTreeMap;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::Serialize;
use tracing::{info, warn};
use zip::write::FileOptions;

use crate::error::PatchError;
use crate::verifier::is_signature_block;

/// Loads executable code from a verified payload into the running process.
pub trait CodeInjector: Send + Sync {
    fn inject(&self, payload: &Path) -> bool;
    fn is_injected(&self, payload: &Path) -> bool;
}

/// Produces a merged resource bundle from the original application bundle
/// and a patch.
pub trait ResourceMerger: Send + Sync {
    fn merge(&self, original: &Path, patch: &Path, output: &Path) -> bool;
}

/// Points the process resource resolver at a bundle.
pub trait ResourceOverlay: Send + Sync {
    fn apply_overlay(&self, bundle: &Path) -> bool;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "notice", rename_all = "snake_case")]
pub enum OperatorNotice {
    /// A trusted copy was recovered; it loads on the next start.
    RestartRequired { patch_id: String },
    /// Tamper threshold reached and all patch state was wiped.
    ReinstallRequired { tamper_count: u32 },
}

pub trait OperatorNotifier: Send + Sync {
    fn notify(&self, notice: &OperatorNotice);
}

/// Keeps track of the payloads loaded in this process.
#[derive(Debug, Default)]
pub struct InProcessInjector {
    injected: Mutex<Vec<PathBuf>>,
}

impl InProcessInjector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn injected(&self) -> Vec<PathBuf> {
        self.injected
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .clone()
    }
}

impl CodeInjector for InProcessInjector {
    fn inject(&self, payload: &Path) -> bool {
        if !payload.is_file() {
            warn!(payload = %payload.display(), "injection payload is missing");
            return false;
        }
        let mut injected = self
            .injected
            .lock()
            .unwrap_or_else(|poison| poison.into_inner());
        if !injected.iter().any(|path| path == payload) {
            injected.push(payload.to_path_buf());
        }
        info!(payload = %payload.display(), "patch payload injected");
        true
    }

    fn is_injected(&self, payload: &Path) -> bool {
        self.injected
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .iter()
            .any(|path| path == payload)
    }
}

#[derive(Debug, Default)]
pub struct LoggingOverlay {
    active: Mutex<Option<PathBuf>>,
}

impl LoggingOverlay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active(&self) -> Option<PathBuf> {
        self.active
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .clone()
    }
}

impl ResourceOverlay for LoggingOverlay {
    fn apply_overlay(&self, bundle: &Path) -> bool {
        *self
            .active
            .lock()
            .unwrap_or_else(|poison| poison.into_inner()) = Some(bundle.to_path_buf());
        info!(bundle = %bundle.display(), "resource overlay active");
        true
    }
}

/// Overlays patch entries onto the original ZIP bundle. Signature blocks
/// from the patch are not carried into the merged bundle.
#[derive(Debug, Default, Clone, Copy)]
pub struct ZipOverlayMerger;

impl ZipOverlayMerger {
    fn merge_archives(original: &Path, patch: &Path, output: &Path) -> Result<usize, PatchError> {
        let mut merged = read_entries(original, false)?;
        for (name, data) in read_entries(patch, true)? {
            merged.insert(name, data);
        }

        if let Some(parent) = output.parent() {
            fs::create_dir_all(parent).map_err(|err| PatchError::io(parent, err))?;
        }
        let file = fs::File::create(output).map_err(|err| PatchError::io(output, err))?;
        let mut writer = zip::ZipWriter::new(file);
        let options = FileOptions::default().compression_method(zip::CompressionMethod::Deflated);
        for (name, data) in &merged {
            writer.start_file(name.as_str(), options)?;
            writer
                .write_all(data)
                .map_err(|err| PatchError::io(output, err))?;
        }
        writer.finish()?;
        Ok(merged.len())
    }
}

impl ResourceMerger for ZipOverlayMerger {
    fn merge(&self, original: &Path, patch: &Path, output: &Path) -> bool {
        match Self::merge_archives(original, patch, output) {
            Ok(entries) => {
                info!(
                    original = %original.display(),
                    output = %output.display(),
                    entries,
                    "resource bundle merged"
                );
                true
            }
            Err(err) => {
                warn!(
                    original = %original.display(),
                    patch = %patch.display(),
                    error = %err,
                    "resource merge failed"
                );
                let _ = fs::remove_file(output);
                false
            }
        }
    }
}

fn read_entries(
    path: &Path,
    skip_signatures: bool,
) -> Result<BTreeMap<String, Vec<u8>>, PatchError> {
    let file = fs::File::open(path).map_err(|err| PatchError::io(path, err))?;
    let mut archive = zip::ZipArchive::new(file)?;
    let mut entries = BTreeMap::new();
    for index in 0..archive.len() {
        let mut entry = archive.by_index(index)?;
        if entry.is_dir() || (skip_signatures && is_signature_block(entry.name())) {
            continue;
        }
        let name = entry.name().to_string();
        let mut data = Vec::new();
        entry
            .read_to_end(&mut data)
            .map_err(|err| PatchError::Archive(format!("failed reading {}: {}", name, err)))?;
        entries.insert(name, data);
    }
    Ok(entries)
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl OperatorNotifier for LogNotifier {
    fn notify(&self, notice: &OperatorNotice) {
        match notice {
            OperatorNotice::RestartRequired { patch_id } => {
                info!(patch_id = %patch_id, "patch recovered; restart to load it");
            }
            OperatorNotice::ReinstallRequired { tamper_count } => {
                warn!(
                    tamper_count,
                    "patch state wiped after repeated tampering; reinstall required"
                );
            }
        }
        if let Ok(line) = serde_json::to_string(notice) {
            eprintln!("{{\"event\":\"operator_notice\",\"detail\":{}}}", line);
        }
    }
}
