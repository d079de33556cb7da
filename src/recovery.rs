//! Full-capability recovery of a primary patch deleted at bootstrap.
//!
//! A recovered patch only takes effect on the next process start; this
//! phase never injects.

use std::fmt;

use serde::Serialize;
use tracing::{error, info, instrument, warn};

use crate::crypto::KeyMaterial;
use crate::error::PatchError;
use crate::host::{OperatorNotice, OperatorNotifier};
use crate::storage::{PatchStorage, TAMPER_THRESHOLD};
use crate::verifier;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RecoveryOutcome {
    NotNeeded,
    /// The flag was set without an applied record; the flag is cleared.
    NoRecord,
    /// Backup could not be decrypted or verified; the flag is cleared and
    /// the patch stays unloaded.
    Abandoned { patch_id: String, reason: String },
    /// Hash matched; counter reset, restart required to load.
    Restored { patch_id: String },
    /// The recovered copy did not match the recorded hash.
    Tampered { patch_id: String, tamper_count: u32 },
    HardReset { patch_id: String, tamper_count: u32 },
}

impl RecoveryOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::NotNeeded => "not_needed",
            Self::NoRecord => "no_record",
            Self::Abandoned { .. } => "abandoned",
            Self::Restored { .. } => "restored",
            Self::Tampered { .. } => "tampered",
            Self::HardReset { .. } => "hard_reset",
        }
    }

    pub fn needs_restart(&self) -> bool {
        matches!(self, Self::Restored { .. })
    }
}

impl fmt::Display for RecoveryOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

pub struct RecoveryManager<'a> {
    storage: &'a PatchStorage,
    keys: &'a dyn KeyMaterial,
    notifier: &'a dyn OperatorNotifier,
}

impl<'a> RecoveryManager<'a> {
    pub fn new(
        storage: &'a PatchStorage,
        keys: &'a dyn KeyMaterial,
        notifier: &'a dyn OperatorNotifier,
    ) -> Self {
        Self {
            storage,
            keys,
            notifier,
        }
    }

    /// Consumes the recovery flag left by the bootstrap phase. Errors are
    /// storage failures only; a failed decrypt is an `Abandoned` outcome.
    #[instrument(name = "recovery", skip_all)]
    pub fn run(&self) -> Result<RecoveryOutcome, PatchError> {
        if !self.storage.get_recovery_flag() {
            return Ok(RecoveryOutcome::NotNeeded);
        }

        let Some(record) = self.storage.get_applied()? else {
            warn!("recovery flag set without an applied patch; clearing");
            self.storage.set_recovery_flag(false)?;
            return Ok(RecoveryOutcome::NoRecord);
        };
        let patch_id = record.patch_id.clone();

        let Some(expected) = record.content_hash.as_ref() else {
            return self.abandon(&patch_id, "applied record has no content hash to check against");
        };

        let recovered = match self.storage.decrypt_to_primary(&patch_id, self.keys) {
            Ok(path) => path,
            Err(err) => {
                error!(
                    patch_id = %patch_id,
                    error_kind = err.kind(),
                    error = %err,
                    "decrypt failed"
                );
                return self.abandon(&patch_id, &err.to_string());
            }
        };

        let verdict = verifier::verify_integrity(&recovered, Some(expected))?;
        let Some(mismatch) = verdict.mismatch_error() else {
            self.storage.reset_tamper_count(&patch_id)?;
            self.storage.set_recovery_flag(false)?;
            info!(patch_id = %patch_id, "patch recovered from encrypted archive");
            self.notifier.notify(&OperatorNotice::RestartRequired {
                patch_id: patch_id.clone(),
            });
            return Ok(RecoveryOutcome::Restored { patch_id });
        };

        warn!(
            patch_id = %patch_id,
            error_kind = mismatch.kind(),
            error = %mismatch,
            "recovered copy failed integrity check"
        );
        self.storage.delete_primary(&patch_id)?;
        let count = self.storage.increment_tamper_count(&patch_id)?;
        if count >= TAMPER_THRESHOLD {
            self.storage.clear_all()?;
            error!(
                patch_id = %patch_id,
                tamper_count = count,
                "hard reset after recovery mismatch"
            );
            self.notifier
                .notify(&OperatorNotice::ReinstallRequired { tamper_count: count });
            return Ok(RecoveryOutcome::HardReset {
                patch_id,
                tamper_count: count,
            });
        }
        Ok(RecoveryOutcome::Tampered {
            patch_id,
            tamper_count: count,
        })
    }

    fn abandon(&self, patch_id: &str, reason: &str) -> Result<RecoveryOutcome, PatchError> {
        self.storage.delete_primary(patch_id)?;
        self.storage.set_recovery_flag(false)?;
        warn!(patch_id = %patch_id, reason = %reason, "recovery abandoned for this cycle");
        Ok(RecoveryOutcome::Abandoned {
            patch_id: patch_id.to_string(),
            reason: reason.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::sync::Mutex;

    use sha2::{Digest, Sha256};
    use zeroize::Zeroizing;

    use super::{RecoveryManager, RecoveryOutcome};
    use crate::crypto::{seal_backup, KeyMaterial};
    use crate::error::PatchError;
    use crate::host::{OperatorNotice, OperatorNotifier};
    use crate::storage::{PatchRecord, PatchStorage};
    use crate::verifier::ContentHash;

    const KEY: [u8; 32] = [3u8; 32];

    struct FixedKey([u8; 32]);

    impl KeyMaterial for FixedKey {
        fn archive_key(&self) -> Result<Zeroizing<[u8; 32]>, PatchError> {
            Ok(Zeroizing::new(self.0))
        }
    }

    #[derive(Default)]
    struct RecordingNotifier {
        notices: Mutex<Vec<OperatorNotice>>,
    }

    impl OperatorNotifier for RecordingNotifier {
        fn notify(&self, notice: &OperatorNotice) {
            self.notices.lock().expect("lock").push(notice.clone());
        }
    }

    fn tampered_store(dir: &std::path::Path, backup_payload: &[u8]) -> PatchStorage {
        let storage = PatchStorage::open(dir).expect("open");
        let payload = b"dex\n035\0code";
        let hash = ContentHash::from_digest(&Sha256::digest(payload));
        let record = PatchRecord::new("patch_1", "1.0", hash);
        let sealed = seal_backup(&KEY, "patch_1", backup_payload).expect("seal");
        storage.commit(&record, payload, &sealed).expect("commit");
        storage.increment_tamper_count("patch_1").expect("inc");
        storage.delete_primary("patch_1").expect("delete");
        storage.set_recovery_flag(true).expect("flag");
        storage
    }

    #[test]
    fn no_flag_is_noop() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = PatchStorage::open(dir.path()).expect("open");
        let notifier = RecordingNotifier::default();
        let outcome = RecoveryManager::new(&storage, &FixedKey(KEY), &notifier)
            .run()
            .expect("run");
        assert_eq!(outcome, RecoveryOutcome::NotNeeded);
    }

    #[test]
    fn matching_backup_restores_and_resets_counter() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = tampered_store(dir.path(), b"dex\n035\0code");
        let notifier = RecordingNotifier::default();
        let outcome = RecoveryManager::new(&storage, &FixedKey(KEY), &notifier)
            .run()
            .expect("run");
        assert!(outcome.needs_restart());

        let record = storage.get_applied().expect("read").expect("record");
        assert_eq!(record.tamper_count, 0);
        assert!(!storage.get_recovery_flag());
        assert_eq!(
            fs::read(storage.primary_path("patch_1").expect("path")).expect("read"),
            b"dex\n035\0code"
        );
        assert_eq!(
            notifier.notices.lock().expect("lock").as_slice(),
            &[OperatorNotice::RestartRequired {
                patch_id: "patch_1".to_string()
            }]
        );
    }

    #[test]
    fn wrong_key_abandons_cycle_without_counting() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = tampered_store(dir.path(), b"dex\n035\0code");
        let notifier = RecordingNotifier::default();
        let outcome = RecoveryManager::new(&storage, &FixedKey([9u8; 32]), &notifier)
            .run()
            .expect("run");
        assert_eq!(outcome.label(), "abandoned");
        assert!(!storage.get_recovery_flag());
        let record = storage.get_applied().expect("read").expect("record");
        assert_eq!(record.tamper_count, 1);
        assert!(storage
            .locate_primary(&record)
            .expect("locate")
            .is_none());
    }

    #[test]
    fn mismatching_backup_counts_and_eventually_wipes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = tampered_store(dir.path(), b"dex\n035\0forged");
        let notifier = RecordingNotifier::default();
        let manager = RecoveryManager::new(&storage, &FixedKey(KEY), &notifier);

        assert_eq!(
            manager.run().expect("run"),
            RecoveryOutcome::Tampered {
                patch_id: "patch_1".to_string(),
                tamper_count: 2
            }
        );
        assert!(storage.get_recovery_flag());

        assert_eq!(
            manager.run().expect("run"),
            RecoveryOutcome::HardReset {
                patch_id: "patch_1".to_string(),
                tamper_count: 3
            }
        );
        assert!(storage.get_applied().expect("read").is_none());
        assert!(!storage.get_recovery_flag());
        assert!(!storage.has_archive_entry("patch_1"));
        assert_eq!(
            notifier.notices.lock().expect("lock").as_slice(),
            &[OperatorNotice::ReinstallRequired { tamper_count: 3 }]
        );
    }
}
