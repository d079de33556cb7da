//! Restricted-phase loader: decides at process start whether the applied
//! patch may be loaded.
//!
//! Only the file system is available here. The loader never holds key
//! material, so it cannot decrypt backups; a tampered primary is deleted
//! and recovery is deferred to the full-capability phase through the
//! persisted recovery flag.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

use crate::error::PatchError;
use crate::host::{CodeInjector, ResourceMerger, ResourceOverlay};
use crate::storage::{PatchStorage, TAMPER_THRESHOLD};
use crate::verifier::{self, ContentKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BootState {
    NoPatch,
    Checking,
    Trusted,
    Tampered,
    Missing,
}

impl BootState {
    pub fn label(self) -> &'static str {
        match self {
            Self::NoPatch => "no_patch",
            Self::Checking => "checking",
            Self::Trusted => "trusted",
            Self::Tampered => "tampered",
            Self::Missing => "missing",
        }
    }
}

impl fmt::Display for BootState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Result of one bootstrap pass. A pass that failed midway reports the
/// state it reached plus the error, and loads nothing.
#[derive(Debug, Clone, Serialize)]
pub struct BootOutcome {
    pub state: BootState,
    pub patch_id: Option<String>,
    /// `verified`, `legacy_trusted` or `mismatch` once the hash was checked.
    pub integrity: Option<&'static str>,
    pub content_kind: Option<ContentKind>,
    pub tamper_count: Option<u32>,
    pub recovery_requested: bool,
    pub hard_reset: bool,
    pub merged_resources: bool,
    pub injected: bool,
    pub already_injected: bool,
    pub effective_payload: Option<String>,
    pub error_kind: Option<&'static str>,
    pub error: Option<String>,
}

impl BootOutcome {
    fn new() -> Self {
        Self {
            state: BootState::NoPatch,
            patch_id: None,
            integrity: None,
            content_kind: None,
            tamper_count: None,
            recovery_requested: false,
            hard_reset: false,
            merged_resources: false,
            injected: false,
            already_injected: false,
            effective_payload: None,
            error_kind: None,
            error: None,
        }
    }

    pub fn loaded(&self) -> bool {
        self.state == BootState::Trusted && self.error.is_none()
    }
}

pub struct BootstrapLoader<'a> {
    storage: &'a PatchStorage,
    injector: &'a dyn CodeInjector,
    merger: &'a dyn ResourceMerger,
    overlay: &'a dyn ResourceOverlay,
    original_bundle: Option<&'a Path>,
}

impl<'a> BootstrapLoader<'a> {
    pub fn new(
        storage: &'a PatchStorage,
        injector: &'a dyn CodeInjector,
        merger: &'a dyn ResourceMerger,
        overlay: &'a dyn ResourceOverlay,
    ) -> Self {
        Self {
            storage,
            injector,
            merger,
            overlay,
            original_bundle: None,
        }
    }

    pub fn with_original_bundle(mut self, bundle: Option<&'a Path>) -> Self {
        self.original_bundle = bundle;
        self
    }

    /// Runs one pass. Never panics and never returns an error: any failure
    /// degrades to running without a patch.
    #[instrument(name = "bootstrap", skip_all)]
    pub fn run(&self) -> BootOutcome {
        let mut outcome = BootOutcome::new();
        let result = panic::catch_unwind(AssertUnwindSafe(|| self.try_run(&mut outcome)));
        match result {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                error!(
                    state = %outcome.state,
                    error_kind = err.kind(),
                    error = %err,
                    "bootstrap failed; running without patch"
                );
                outcome.injected = false;
                outcome.error_kind = Some(err.kind());
                outcome.error = Some(err.to_string());
            }
            Err(_) => {
                error!(state = %outcome.state, "bootstrap panicked; running without patch");
                outcome.injected = false;
                outcome.error = Some("bootstrap panicked".to_string());
            }
        }
        outcome
    }

    fn try_run(&self, outcome: &mut BootOutcome) -> Result<(), PatchError> {
        let Some(record) = self.storage.get_applied()? else {
            debug!("no applied patch");
            return Ok(());
        };
        outcome.state = BootState::Checking;
        outcome.patch_id = Some(record.patch_id.clone());
        outcome.tamper_count = Some(record.tamper_count);

        let Some(primary) = self.storage.locate_primary(&record)? else {
            warn!(patch_id = %record.patch_id, "primary patch file missing; skipping load");
            outcome.state = BootState::Missing;
            return Ok(());
        };

        let verdict = verifier::verify_integrity(&primary, record.content_hash.as_ref())?;
        outcome.integrity = Some(verdict.label());
        if let Some(mismatch) = verdict.mismatch_error() {
            outcome.state = BootState::Tampered;
            warn!(
                patch_id = %record.patch_id,
                error_kind = mismatch.kind(),
                error = %mismatch,
                "primary patch file failed integrity check"
            );
            outcome.error_kind = Some(mismatch.kind());
            outcome.error = Some(mismatch.to_string());
            return self.handle_tamper(&record.patch_id, outcome);
        }

        outcome.state = BootState::Trusted;
        let kind = ContentKind::sniff(&primary)?;
        outcome.content_kind = Some(kind);
        let effective = self.resolve_payload(&record.patch_id, &primary, kind, outcome);
        outcome.effective_payload = Some(effective.display().to_string());

        if self.injector.is_injected(&effective) {
            debug!(payload = %effective.display(), "payload already injected");
            outcome.already_injected = true;
        } else {
            outcome.injected = self.injector.inject(&effective);
            if !outcome.injected {
                warn!(payload = %effective.display(), "code injector declined payload");
            }
        }
        if kind.may_contain_resources() && !self.overlay.apply_overlay(&effective) {
            warn!(payload = %effective.display(), "resource overlay declined payload");
        }

        info!(
            patch_id = %record.patch_id,
            integrity = verdict.label(),
            content_kind = ?kind,
            merged = outcome.merged_resources,
            "patch trusted"
        );
        Ok(())
    }

    fn handle_tamper(&self, patch_id: &str, outcome: &mut BootOutcome) -> Result<(), PatchError> {
        let count = self.storage.increment_tamper_count(patch_id)?;
        outcome.tamper_count = Some(count);
        self.storage.delete_primary(patch_id)?;

        if count >= TAMPER_THRESHOLD {
            self.storage.clear_all()?;
            outcome.hard_reset = true;
            let reset = PatchError::ThresholdExceeded { count };
            error!(patch_id = %patch_id, tamper_count = count, error = %reset, "hard reset");
            outcome.error_kind = Some(reset.kind());
            outcome.error = Some(reset.to_string());
            return Ok(());
        }

        self.storage.set_recovery_flag(true)?;
        outcome.recovery_requested = true;
        warn!(
            patch_id = %patch_id,
            tamper_count = count,
            "tampered primary deleted; recovery deferred"
        );
        Ok(())
    }

    /// Merged bundle when the patch may carry resources and the merge
    /// succeeds; the primary file otherwise.
    fn resolve_payload(
        &self,
        patch_id: &str,
        primary: &Path,
        kind: ContentKind,
        outcome: &mut BootOutcome,
    ) -> PathBuf {
        if !kind.may_contain_resources() {
            return primary.to_path_buf();
        }
        let Some(original) = self.original_bundle else {
            debug!("no original bundle configured; using patch directly");
            return primary.to_path_buf();
        };
        let output = match self.storage.merged_path(patch_id) {
            Ok(path) => path,
            Err(err) => {
                warn!(patch_id = %patch_id, error = %err, "no merge location; using patch directly");
                return primary.to_path_buf();
            }
        };
        if self.merger.merge(original, primary, &output) {
            outcome.merged_resources = true;
            output
        } else {
            warn!(patch_id = %patch_id, "resource merge failed; falling back to patch");
            primary.to_path_buf()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use sha2::{Digest, Sha256};

    use super::{BootState, BootstrapLoader};
    use crate::crypto::seal_backup;
    use crate::host::{
        CodeInjector, InProcessInjector, LoggingOverlay, ResourceMerger, ZipOverlayMerger,
    };
    use crate::signer::write_archive;
    use crate::storage::{PatchRecord, PatchStorage};
    use crate::verifier::ContentHash;

    struct FailingMerger;

    impl ResourceMerger for FailingMerger {
        fn merge(&self, _original: &Path, _patch: &Path, _output: &Path) -> bool {
            false
        }
    }

    #[derive(Default)]
    struct CountingInjector {
        calls: AtomicUsize,
    }

    impl CodeInjector for CountingInjector {
        fn inject(&self, _payload: &Path) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            true
        }

        fn is_injected(&self, _payload: &Path) -> bool {
            self.calls.load(Ordering::SeqCst) > 0
        }
    }

    struct PanickingInjector;

    impl CodeInjector for PanickingInjector {
        fn inject(&self, _payload: &Path) -> bool {
            panic!("injector defect");
        }

        fn is_injected(&self, _payload: &Path) -> bool {
            false
        }
    }

    fn install(storage: &PatchStorage, id: &str, payload: &[u8]) {
        let hash = ContentHash::from_digest(&Sha256::digest(payload));
        let record = PatchRecord::new(id, "1.0", hash);
        let sealed = seal_backup(&[1u8; 32], id, payload).expect("seal");
        storage.commit(&record, payload, &sealed).expect("commit");
    }

    #[test]
    fn no_record_is_no_patch() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = PatchStorage::open(dir.path()).expect("open");
        let injector = InProcessInjector::new();
        let overlay = LoggingOverlay::new();
        let outcome = BootstrapLoader::new(&storage, &injector, &ZipOverlayMerger, &overlay).run();
        assert_eq!(outcome.state, BootState::NoPatch);
        assert!(injector.injected().is_empty());
    }

    #[test]
    fn trusted_patch_is_injected_once_per_process() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = PatchStorage::open(dir.path()).expect("open");
        install(&storage, "patch_1", b"dex\n035\0code");
        let injector = CountingInjector::default();
        let overlay = LoggingOverlay::new();
        let loader = BootstrapLoader::new(&storage, &injector, &ZipOverlayMerger, &overlay);

        let first = loader.run();
        assert_eq!(first.state, BootState::Trusted);
        assert_eq!(first.integrity, Some("verified"));
        assert!(first.injected);
        let second = loader.run();
        assert!(second.already_injected);
        assert_eq!(injector.calls.load(Ordering::SeqCst), 1);
        assert!(overlay.active().is_none());
    }

    #[test]
    fn tampered_primary_is_deleted_and_recovery_requested() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = PatchStorage::open(dir.path()).expect("open");
        install(&storage, "patch_1", b"dex\n035\0code");
        let primary = storage.primary_path("patch_1").expect("path");
        fs::write(&primary, b"dex\n035\0evil").expect("tamper");

        let injector = InProcessInjector::new();
        let overlay = LoggingOverlay::new();
        let outcome = BootstrapLoader::new(&storage, &injector, &ZipOverlayMerger, &overlay).run();
        assert_eq!(outcome.state, BootState::Tampered);
        assert_eq!(outcome.tamper_count, Some(1));
        assert_eq!(outcome.error_kind, Some("hash_mismatch"));
        assert!(outcome
            .error
            .as_deref()
            .is_some_and(|message| message.starts_with("content hash mismatch")));
        assert!(outcome.recovery_requested);
        assert!(!primary.exists());
        assert!(storage.get_recovery_flag());
        assert!(injector.injected().is_empty());

        let next = BootstrapLoader::new(&storage, &injector, &ZipOverlayMerger, &overlay).run();
        assert_eq!(next.state, BootState::Missing);
    }

    #[test]
    fn third_detection_wipes_all_state() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = PatchStorage::open(dir.path()).expect("open");
        install(&storage, "patch_1", b"dex\n035\0code");
        storage.increment_tamper_count("patch_1").expect("inc");
        storage.increment_tamper_count("patch_1").expect("inc");
        fs::write(storage.primary_path("patch_1").expect("path"), b"evil").expect("tamper");

        let injector = InProcessInjector::new();
        let overlay = LoggingOverlay::new();
        let outcome = BootstrapLoader::new(&storage, &injector, &ZipOverlayMerger, &overlay).run();
        assert!(outcome.hard_reset);
        assert_eq!(outcome.tamper_count, Some(3));
        assert!(storage.get_applied().expect("read").is_none());
        assert!(!storage.get_recovery_flag());
        assert!(!storage.has_archive_entry("patch_1"));
    }

    #[test]
    fn failed_merge_falls_back_to_patch() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = PatchStorage::open(dir.path().join("store")).expect("open");
        let patch = dir.path().join("patch.zip");
        write_archive(&patch, &[("res/a.txt".to_string(), b"new".to_vec())]).expect("zip");
        install(&storage, "patch_1", &fs::read(&patch).expect("read"));
        let original = dir.path().join("base.zip");
        write_archive(&original, &[("res/a.txt".to_string(), b"old".to_vec())]).expect("zip");

        let injector = InProcessInjector::new();
        let overlay = LoggingOverlay::new();
        let merged = BootstrapLoader::new(&storage, &injector, &ZipOverlayMerger, &overlay)
            .with_original_bundle(Some(&original))
            .run();
        assert!(merged.merged_resources);
        assert!(merged.loaded());

        let fallback_injector = InProcessInjector::new();
        let fallback =
            BootstrapLoader::new(&storage, &fallback_injector, &FailingMerger, &overlay)
                .with_original_bundle(Some(&original))
                .run();
        assert_eq!(fallback.state, BootState::Trusted);
        assert!(!fallback.merged_resources);
        assert_eq!(
            fallback_injector.injected(),
            vec![storage.primary_path("patch_1").expect("path")]
        );
    }

    #[test]
    fn legacy_install_without_hash_is_flagged() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = PatchStorage::open(dir.path()).expect("open");
        let mut record = PatchRecord::new("patch_1", "1.0", ContentHash::from_digest(&[0u8; 32]));
        record.content_hash = None;
        storage.commit(&record, b"dex\n035\0", b"sealed").expect("commit");

        let injector = InProcessInjector::new();
        let overlay = LoggingOverlay::new();
        let outcome = BootstrapLoader::new(&storage, &injector, &ZipOverlayMerger, &overlay).run();
        assert_eq!(outcome.state, BootState::Trusted);
        assert_eq!(outcome.integrity, Some("legacy_trusted"));
    }

    #[test]
    fn injector_panic_degrades_to_no_load() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = PatchStorage::open(dir.path()).expect("open");
        install(&storage, "patch_1", b"dex\n035\0code");
        let overlay = LoggingOverlay::new();
        let outcome =
            BootstrapLoader::new(&storage, &PanickingInjector, &ZipOverlayMerger, &overlay).run();
        assert!(!outcome.loaded());
        assert!(outcome.error.is_some());
    }
}
