//! Persistent record of the applied patch plus the encrypted recovery store.
//!
//! Layout under the storage root:
//!
//! ```text
//! state.json              applied record, tamper counter, recovery flag
//! primary/<id>.patch      directly loadable copy of the applied patch
//! archive/<id>.hpbk       encrypted recovery-only copy
//! merged/<id>.zip         resource bundle built at boot from the primary
//! ```

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::crypto::{self, KeyMaterial};
use crate::error::PatchError;
use crate::kv::{self, JsonKvStore, KvBatch};
use crate::verifier::ContentHash;

pub const KEY_APPLIED_PATCH_ID: &str = "applied_patch_id";
pub const KEY_APPLIED_PATCH_HASH: &str = "applied_patch_hash";
pub const KEY_APPLIED_PATCH_VERSION: &str = "applied_patch_version";
pub const KEY_APPLIED_AT: &str = "applied_at";
pub const KEY_TAMPER_COUNT: &str = "tamper_count";
pub const KEY_NEED_PATCH_RECOVERY: &str = "need_patch_recovery";

/// Detections (bootstrap or recovery, any mix) that trigger a hard reset.
pub const TAMPER_THRESHOLD: u32 = 3;

const STATE_FILE: &str = "state.json";
const PRIMARY_DIR: &str = "primary";
const ARCHIVE_DIR: &str = "archive";
const MERGED_DIR: &str = "merged";
const PRIMARY_EXT: &str = "patch";
const ARCHIVE_EXT: &str = "hpbk";
const MERGED_EXT: &str = "zip";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PatchRecord {
    pub patch_id: String,
    pub version: String,
    /// Absent for installs that predate content hashing.
    pub content_hash: Option<ContentHash>,
    pub tamper_count: u32,
    pub needs_recovery: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub applied_at: Option<String>,
}

impl PatchRecord {
    pub fn new(patch_id: impl Into<String>, version: impl Into<String>, hash: ContentHash) -> Self {
        Self {
            patch_id: patch_id.into(),
            version: version.into(),
            content_hash: Some(hash),
            tamper_count: 0,
            needs_recovery: false,
            applied_at: None,
        }
    }
}

pub struct PatchStorage {
    root: PathBuf,
    kv: Mutex<JsonKvStore>,
}

impl PatchStorage {
    pub fn open(root: impl AsRef<Path>) -> Result<Self, PatchError> {
        let root = root.as_ref().to_path_buf();
        let kv = JsonKvStore::open(root.join(STATE_FILE))?;
        Ok(Self {
            root,
            kv: Mutex::new(kv),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn kv(&self) -> MutexGuard<'_, JsonKvStore> {
        self.kv.lock().unwrap_or_else(|poison| poison.into_inner())
    }

    pub fn primary_path(&self, patch_id: &str) -> Result<PathBuf, PatchError> {
        validate_patch_id(patch_id)?;
        Ok(self
            .root
            .join(PRIMARY_DIR)
            .join(format!("{}.{}", patch_id, PRIMARY_EXT)))
    }

    pub fn archive_path(&self, patch_id: &str) -> Result<PathBuf, PatchError> {
        validate_patch_id(patch_id)?;
        Ok(self
            .root
            .join(ARCHIVE_DIR)
            .join(format!("{}.{}", patch_id, ARCHIVE_EXT)))
    }

    /// Output location for the merged resource bundle of a patch.
    pub fn merged_path(&self, patch_id: &str) -> Result<PathBuf, PatchError> {
        validate_patch_id(patch_id)?;
        Ok(self
            .root
            .join(MERGED_DIR)
            .join(format!("{}.{}", patch_id, MERGED_EXT)))
    }

    pub fn get_applied(&self) -> Result<Option<PatchRecord>, PatchError> {
        let kv = self.kv();
        read_record(&kv)
    }

    /// Existing primary file for the record, if any.
    pub fn locate_primary(&self, record: &PatchRecord) -> Result<Option<PathBuf>, PatchError> {
        let path = self.primary_path(&record.patch_id)?;
        Ok(path.is_file().then_some(path))
    }

    pub fn has_archive_entry(&self, patch_id: &str) -> bool {
        self.archive_path(patch_id)
            .map(|path| path.is_file())
            .unwrap_or(false)
    }

    /// Installs `record` as the applied patch.
    ///
    /// The new primary file and backup are written under their own names
    /// first; only then is the record swapped in a single atomic rewrite of
    /// the state file. A crash before the swap leaves the previous record
    /// pointing at its untouched primary file.
    pub fn commit(
        &self,
        record: &PatchRecord,
        primary: &[u8],
        encrypted_copy: &[u8],
    ) -> Result<PathBuf, PatchError> {
        let primary_path = self.primary_path(&record.patch_id)?;
        let archive_path = self.archive_path(&record.patch_id)?;

        let mut kv = self.kv();
        let previous = read_record(&kv).ok().flatten();

        kv::write_atomic(&primary_path, primary)?;
        if let Err(err) = kv::write_atomic(&archive_path, encrypted_copy) {
            remove_if_exists(&primary_path);
            return Err(err);
        }

        let applied_at = record
            .applied_at
            .clone()
            .unwrap_or_else(|| Utc::now().to_rfc3339());
        let batch = KvBatch::new()
            .put(KEY_APPLIED_PATCH_ID, record.patch_id.as_str())
            .put(KEY_APPLIED_PATCH_VERSION, record.version.as_str())
            .put_opt(
                KEY_APPLIED_PATCH_HASH,
                record.content_hash.as_ref().map(ToString::to_string),
            )
            .put(KEY_APPLIED_AT, applied_at)
            .put(KEY_TAMPER_COUNT, "0")
            .remove(KEY_NEED_PATCH_RECOVERY);
        if let Err(err) = kv.apply(batch) {
            remove_if_exists(&primary_path);
            remove_if_exists(&archive_path);
            return Err(err);
        }
        drop(kv);

        if let Some(previous) = previous.filter(|prev| prev.patch_id != record.patch_id) {
            self.remove_patch_files(&previous.patch_id);
        }
        self.sweep_orphans(&record.patch_id);

        info!(
            patch_id = %record.patch_id,
            version = %record.version,
            primary = %primary_path.display(),
            "patch committed"
        );
        Ok(primary_path)
    }

    /// Bumps the counter of the applied record. The counter belongs to the
    /// record: a stale id is refused.
    pub fn increment_tamper_count(&self, patch_id: &str) -> Result<u32, PatchError> {
        let mut kv = self.kv();
        ensure_applied(&kv, patch_id)?;
        let next = kv.get_u32(KEY_TAMPER_COUNT).unwrap_or(0).saturating_add(1);
        kv.put(KEY_TAMPER_COUNT, next.to_string())?;
        warn!(patch_id = %patch_id, tamper_count = next, "tamper counter incremented");
        Ok(next)
    }

    pub fn reset_tamper_count(&self, patch_id: &str) -> Result<(), PatchError> {
        let mut kv = self.kv();
        ensure_applied(&kv, patch_id)?;
        kv.put(KEY_TAMPER_COUNT, "0")
    }

    pub fn set_recovery_flag(&self, value: bool) -> Result<(), PatchError> {
        let mut kv = self.kv();
        if value {
            kv.put(KEY_NEED_PATCH_RECOVERY, "true")
        } else {
            kv.remove(KEY_NEED_PATCH_RECOVERY)
        }
    }

    pub fn get_recovery_flag(&self) -> bool {
        self.kv().get_bool(KEY_NEED_PATCH_RECOVERY)
    }

    /// Hard reset: record, hash, counter, recovery flag and every stored
    /// copy are removed. The state file goes first so no record can point
    /// at a file that is being deleted.
    pub fn clear_all(&self) -> Result<(), PatchError> {
        let mut kv = self.kv();
        kv.apply(
            KvBatch::new()
                .remove(KEY_APPLIED_PATCH_ID)
                .remove(KEY_APPLIED_PATCH_VERSION)
                .remove(KEY_APPLIED_PATCH_HASH)
                .remove(KEY_APPLIED_AT)
                .remove(KEY_TAMPER_COUNT)
                .remove(KEY_NEED_PATCH_RECOVERY),
        )?;
        drop(kv);

        for dir in [PRIMARY_DIR, ARCHIVE_DIR, MERGED_DIR] {
            let path = self.root.join(dir);
            match fs::remove_dir_all(&path) {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => return Err(PatchError::io(&path, err)),
            }
        }
        info!(root = %self.root.display(), "all patch state cleared");
        Ok(())
    }

    pub fn delete_primary(&self, patch_id: &str) -> Result<(), PatchError> {
        let path = self.primary_path(patch_id)?;
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!(path = %path.display(), "primary patch file deleted");
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(PatchError::io(&path, err)),
        }
    }

    /// Rebuilds the primary file from the encrypted archive entry. Needs key
    /// material, so only the full-capability phase can call it.
    pub fn decrypt_to_primary(
        &self,
        patch_id: &str,
        keys: &dyn KeyMaterial,
    ) -> Result<PathBuf, PatchError> {
        let archive_path = self.archive_path(patch_id)?;
        let sealed = fs::read(&archive_path).map_err(|err| {
            PatchError::DecryptFailure(format!(
                "encrypted archive entry {} unavailable: {}",
                archive_path.display(),
                err
            ))
        })?;
        let key = keys.archive_key()?;
        let plaintext = crypto::open_backup(&key, patch_id, &sealed)?;
        let primary_path = self.primary_path(patch_id)?;
        kv::write_atomic(&primary_path, &plaintext)?;
        info!(
            patch_id = %patch_id,
            primary = %primary_path.display(),
            "primary rebuilt from archive"
        );
        Ok(primary_path)
    }

    fn remove_patch_files(&self, patch_id: &str) {
        for path in [
            self.primary_path(patch_id),
            self.archive_path(patch_id),
            self.merged_path(patch_id),
        ]
        .into_iter()
            .flatten()
        {
            remove_if_exists(&path);
        }
    }

    /// Drops files left behind by a crash between writing a new primary and
    /// swapping the record, plus merged bundles of superseded patches.
    fn sweep_orphans(&self, keep: &str) {
        for (dir, ext) in [
            (PRIMARY_DIR, PRIMARY_EXT),
            (ARCHIVE_DIR, ARCHIVE_EXT),
            (MERGED_DIR, MERGED_EXT),
        ] {
            let Ok(entries) = fs::read_dir(self.root.join(dir)) else {
                continue;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                let stem_matches = path.file_stem().and_then(|stem| stem.to_str()) == Some(keep);
                let ext_matches = path.extension().and_then(|value| value.to_str()) == Some(ext);
                if !(stem_matches && ext_matches) {
                    remove_if_exists(&path);
                }
            }
        }
    }
}

fn read_record(kv: &JsonKvStore) -> Result<Option<PatchRecord>, PatchError> {
    let Some(patch_id) = kv.get(KEY_APPLIED_PATCH_ID).map(str::trim) else {
        return Ok(None);
    };
    if patch_id.is_empty() {
        return Ok(None);
    }
    let content_hash = kv
        .get(KEY_APPLIED_PATCH_HASH)
        .filter(|value| !value.trim().is_empty())
        .map(ContentHash::parse)
        .transpose()?;
    Ok(Some(PatchRecord {
        patch_id: patch_id.to_string(),
        version: kv.get(KEY_APPLIED_PATCH_VERSION).unwrap_or_default().to_string(),
        content_hash,
        tamper_count: kv.get_u32(KEY_TAMPER_COUNT).unwrap_or(0),
        needs_recovery: kv.get_bool(KEY_NEED_PATCH_RECOVERY),
        applied_at: kv.get(KEY_APPLIED_AT).map(ToString::to_string),
    }))
}

fn ensure_applied(kv: &JsonKvStore, patch_id: &str) -> Result<(), PatchError> {
    match kv.get(KEY_APPLIED_PATCH_ID) {
        Some(applied) if applied == patch_id => Ok(()),
        _ => Err(PatchError::io(
            kv.path(),
            std::io::Error::new(
                ErrorKind::NotFound,
                format!("patch '{}' is not the applied patch", patch_id),
            ),
        )),
    }
}

fn validate_patch_id(patch_id: &str) -> Result<(), PatchError> {
    let valid = !patch_id.is_empty()
        && patch_id.len() <= 128
        && !patch_id.starts_with('.')
        && patch_id
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '_' | '-' | '.'));
    if valid {
        Ok(())
    } else {
        Err(PatchError::Archive(format!(
            "patch id '{}' contains unsupported characters",
            patch_id
        )))
    }
}

fn remove_if_exists(path: &Path) {
    if let Err(err) = fs::remove_file(path) {
        if err.kind() != ErrorKind::NotFound {
            warn!(path = %path.display(), error = %err, "failed to remove patch file");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use sha2::{Digest, Sha256};
    use zeroize::Zeroizing;

    use super::{PatchRecord, PatchStorage, KEY_APPLIED_PATCH_ID, KEY_APPLIED_PATCH_HASH};
    use crate::crypto::{seal_backup, KeyMaterial};
    use crate::error::PatchError;
    use crate::kv::JsonKvStore;
    use crate::verifier::{compute_content_hash, ContentHash};

    struct FixedKey([u8; 32]);

    impl KeyMaterial for FixedKey {
        fn archive_key(&self) -> Result<Zeroizing<[u8; 32]>, PatchError> {
            Ok(Zeroizing::new(self.0))
        }
    }

    fn commit(storage: &PatchStorage, id: &str, payload: &[u8]) -> PatchRecord {
        let hash = ContentHash::from_digest(&Sha256::digest(payload));
        let record = PatchRecord::new(id, "1.0", hash);
        let sealed = seal_backup(&[7u8; 32], id, payload).expect("seal");
        storage.commit(&record, payload, &sealed).expect("commit");
        record
    }

    #[test]
    fn commit_supersedes_previous_record_and_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = PatchStorage::open(dir.path()).expect("open");
        assert!(storage.get_applied().expect("read").is_none());

        commit(&storage, "patch_1", b"first");
        let second = commit(&storage, "patch_2", b"second");

        let applied = storage.get_applied().expect("read").expect("record");
        assert_eq!(applied.patch_id, "patch_2");
        assert_eq!(applied.content_hash, second.content_hash);
        assert!(!storage.primary_path("patch_1").expect("path").exists());
        assert!(!storage.archive_path("patch_1").expect("path").exists());
        let primary = storage.locate_primary(&applied).expect("locate").expect("primary");
        assert_eq!(
            compute_content_hash(&primary).expect("hash"),
            second.content_hash.expect("hash")
        );
    }

    #[test]
    fn crash_before_record_swap_keeps_old_record_valid() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = PatchStorage::open(dir.path()).expect("open");
        let old = commit(&storage, "patch_1", b"first");

        // New primary landed but the record was never swapped.
        fs::write(storage.primary_path("patch_2").expect("path"), b"second").expect("write");

        let reopened = PatchStorage::open(dir.path()).expect("reopen");
        let applied = reopened.get_applied().expect("read").expect("record");
        assert_eq!(applied.patch_id, "patch_1");
        let primary = reopened.locate_primary(&applied).expect("locate").expect("primary");
        assert_eq!(
            compute_content_hash(&primary).expect("hash"),
            old.content_hash.expect("hash")
        );

        commit(&reopened, "patch_3", b"third");
        assert!(!reopened.primary_path("patch_2").expect("path").exists());
    }

    #[test]
    fn tamper_counter_is_bound_to_applied_record() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = PatchStorage::open(dir.path()).expect("open");
        commit(&storage, "patch_1", b"first");
        assert_eq!(storage.increment_tamper_count("patch_1").expect("inc"), 1);
        assert_eq!(storage.increment_tamper_count("patch_1").expect("inc"), 2);
        assert!(storage.increment_tamper_count("patch_0").is_err());

        commit(&storage, "patch_2", b"second");
        let applied = storage.get_applied().expect("read").expect("record");
        assert_eq!(applied.tamper_count, 0);
    }

    #[test]
    fn clear_all_removes_every_trace() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = PatchStorage::open(dir.path()).expect("open");
        commit(&storage, "patch_1", b"first");
        storage.increment_tamper_count("patch_1").expect("inc");
        storage.set_recovery_flag(true).expect("flag");
        assert!(storage.get_recovery_flag());
        let merged = storage.merged_path("patch_1").expect("path");
        fs::create_dir_all(merged.parent().expect("parent")).expect("mkdir");
        fs::write(&merged, b"PK\x03\x04merged").expect("merged");

        storage.clear_all().expect("clear");
        assert!(storage.get_applied().expect("read").is_none());
        assert!(!storage.get_recovery_flag());
        assert!(!storage.has_archive_entry("patch_1"));
        assert!(!storage.primary_path("patch_1").expect("path").exists());
        assert!(!dir.path().join("merged").exists());

        let kv = JsonKvStore::open(dir.path().join("state.json")).expect("kv");
        assert_eq!(kv.get(KEY_APPLIED_PATCH_ID), None);
        assert_eq!(kv.get(KEY_APPLIED_PATCH_HASH), None);
    }

    #[test]
    fn superseded_merged_bundle_is_removed_on_commit() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = PatchStorage::open(dir.path()).expect("open");
        commit(&storage, "patch_1", b"first");
        let merged_dir = dir.path().join("merged");
        fs::create_dir_all(&merged_dir).expect("mkdir");
        fs::write(merged_dir.join("patch_1.zip"), b"bundle").expect("bundle");
        fs::write(merged_dir.join("stale_0.zip"), b"bundle").expect("bundle");

        commit(&storage, "patch_2", b"second");
        assert!(!merged_dir.join("patch_1.zip").exists());
        assert!(!merged_dir.join("stale_0.zip").exists());
        assert_eq!(
            storage.merged_path("patch_2").expect("path"),
            merged_dir.join("patch_2.zip")
        );
    }

    #[test]
    fn decrypt_to_primary_restores_bytes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = PatchStorage::open(dir.path()).expect("open");
        let record = commit(&storage, "patch_1", b"payload");
        storage.delete_primary("patch_1").expect("delete");
        assert!(storage.locate_primary(&record).expect("locate").is_none());

        assert!(matches!(
            storage.decrypt_to_primary("patch_1", &FixedKey([8u8; 32])),
            Err(PatchError::DecryptFailure(_))
        ));
        let restored = storage
            .decrypt_to_primary("patch_1", &FixedKey([7u8; 32]))
            .expect("restore");
        assert_eq!(fs::read(restored).expect("read"), b"payload");
    }

    #[test]
    fn rejects_path_like_patch_ids() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = PatchStorage::open(dir.path()).expect("open");
        assert!(storage.primary_path("../escape").is_err());
        assert!(storage.primary_path("").is_err());
        assert!(storage.primary_path("patch_1700000000000").is_ok());
    }
}
