//! At-rest encryption for recovery backups and password-protected patches.

use std::fs;
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use tracing::info;
use zeroize::Zeroizing;

use crate::error::PatchError;

const BACKUP_MAGIC: &[u8; 4] = b"HPBK";
const BACKUP_VERSION: u8 = 1;
const PAYLOAD_MAGIC: &[u8; 6] = b"HPENC1";
const NONCE_LEN: usize = 12;
const SALT_LEN: usize = 16;
const DEVICE_SECRET_LEN: usize = 32;
const ARCHIVE_KEY_INFO: &[u8] = b"hotpatch-archive-key-v1";
pub const PAYLOAD_KDF_ROUNDS: u32 = 100_000;

/// Secret material that only exists once the process reaches full
/// capability. The bootstrap phase never holds one of these.
pub trait KeyMaterial: Send + Sync {
    fn archive_key(&self) -> Result<Zeroizing<[u8; 32]>, PatchError>;
}

/// Device secret kept in a private file, optionally mixed with an
/// operator-held password.
pub struct FileKeyStore {
    path: PathBuf,
    password: Option<Zeroizing<String>>,
    cached: Mutex<Option<Zeroizing<[u8; 32]>>>,
}

impl FileKeyStore {
    pub fn new(path: impl AsRef<Path>, password: Option<&str>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            password: password
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(|value| Zeroizing::new(value.to_string())),
            cached: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_provisioned(&self) -> bool {
        self.path.exists()
    }

    /// Creates the device secret on first use. Returns true when a new
    /// secret was written.
    pub fn provision(&self) -> Result<bool, PatchError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|err| PatchError::io(parent, err))?;
        }
        let mut file = match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
        {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::AlreadyExists => return Ok(false),
            Err(err) => return Err(PatchError::io(&self.path, err)),
        };

        let mut secret = Zeroizing::new([0u8; DEVICE_SECRET_LEN]);
        OsRng.fill_bytes(&mut secret[..]);
        file.write_all(&secret[..])
            .and_then(|_| file.sync_all())
            .map_err(|err| PatchError::io(&self.path, err))?;
        restrict_permissions(&self.path)?;
        info!(path = %self.path.display(), "archive key store provisioned");
        Ok(true)
    }

    fn read_device_secret(&self) -> Result<Zeroizing<Vec<u8>>, PatchError> {
        let mut file = fs::File::open(&self.path).map_err(|err| {
            PatchError::DecryptFailure(format!(
                "key store {} unavailable: {}",
                self.path.display(),
                err
            ))
        })?;
        let mut secret = Zeroizing::new(Vec::with_capacity(DEVICE_SECRET_LEN));
        file.read_to_end(&mut secret)
            .map_err(|err| PatchError::DecryptFailure(format!("key store unreadable: {}", err)))?;
        if secret.len() != DEVICE_SECRET_LEN {
            return Err(PatchError::DecryptFailure(
                "key store has unexpected length".to_string(),
            ));
        }
        Ok(secret)
    }
}

impl KeyMaterial for FileKeyStore {
    fn archive_key(&self) -> Result<Zeroizing<[u8; 32]>, PatchError> {
        let mut cached = self
            .cached
            .lock()
            .unwrap_or_else(|poison| poison.into_inner());
        if let Some(key) = cached.as_ref() {
            return Ok(key.clone());
        }

        let secret = self.read_device_secret()?;
        let salt = self.password.as_ref().map(|password| {
            let mut derived = Zeroizing::new([0u8; 32]);
            pbkdf2::pbkdf2_hmac::<Sha256>(
                password.as_bytes(),
                &secret[..],
                PAYLOAD_KDF_ROUNDS,
                &mut derived[..],
            );
            derived
        });
        let hk = Hkdf::<Sha256>::new(salt.as_ref().map(|value| &value[..]), &secret[..]);
        let mut key = Zeroizing::new([0u8; 32]);
        hk.expand(ARCHIVE_KEY_INFO, &mut key[..])
            .map_err(|_| PatchError::DecryptFailure("archive key expansion failed".to_string()))?;
        *cached = Some(key.clone());
        Ok(key)
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<(), PatchError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
        .map_err(|err| PatchError::io(path, err))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> Result<(), PatchError> {
    Ok(())
}

/// Encrypts a recovery backup. The patch id is bound as associated data so
/// a backup cannot be replayed under another record.
pub fn seal_backup(
    key: &[u8; 32],
    patch_id: &str,
    plaintext: &[u8],
) -> Result<Vec<u8>, PatchError> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|_| PatchError::DecryptFailure("invalid archive key length".to_string()))?;
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    let ciphertext = cipher
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: plaintext,
                aad: patch_id.as_bytes(),
            },
        )
        .map_err(|_| PatchError::DecryptFailure("backup encryption failed".to_string()))?;

    let mut out = Vec::with_capacity(BACKUP_MAGIC.len() + 1 + NONCE_LEN + ciphertext.len());
    out.extend_from_slice(BACKUP_MAGIC);
    out.push(BACKUP_VERSION);
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

pub fn open_backup(
    key: &[u8; 32],
    patch_id: &str,
    sealed: &[u8],
) -> Result<Zeroizing<Vec<u8>>, PatchError> {
    let header = BACKUP_MAGIC.len() + 1;
    if sealed.len() < header + NONCE_LEN || &sealed[..BACKUP_MAGIC.len()] != BACKUP_MAGIC {
        return Err(PatchError::DecryptFailure(
            "backup entry is not a sealed archive".to_string(),
        ));
    }
    if sealed[BACKUP_MAGIC.len()] != BACKUP_VERSION {
        return Err(PatchError::DecryptFailure(format!(
            "unsupported backup version {}",
            sealed[BACKUP_MAGIC.len()]
        )));
    }
    let nonce = &sealed[header..header + NONCE_LEN];
    let ciphertext = &sealed[header + NONCE_LEN..];
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|_| PatchError::DecryptFailure("invalid archive key length".to_string()))?;
    let plaintext = cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad: patch_id.as_bytes(),
            },
        )
        .map_err(|_| {
            PatchError::DecryptFailure("backup authentication failed".to_string())
        })?;
    Ok(Zeroizing::new(plaintext))
}

pub fn is_encrypted_payload(path: &Path) -> Result<bool, PatchError> {
    let mut file = fs::File::open(path).map_err(|err| PatchError::io(path, err))?;
    let mut magic = [0u8; 6];
    match file.read_exact(&mut magic) {
        Ok(()) => Ok(&magic == PAYLOAD_MAGIC),
        Err(err) if err.kind() == ErrorKind::UnexpectedEof => Ok(false),
        Err(err) => Err(PatchError::io(path, err)),
    }
}

fn derive_payload_key(password: &str, salt: &[u8]) -> Zeroizing<[u8; 32]> {
    let mut key = Zeroizing::new([0u8; 32]);
    pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, PAYLOAD_KDF_ROUNDS, &mut key[..]);
    key
}

/// Wraps a patch in a password-protected envelope.
pub fn seal_payload(password: &str, plaintext: &[u8]) -> Result<Vec<u8>, PatchError> {
    if password.trim().is_empty() {
        return Err(PatchError::DecryptFailure(
            "payload password cannot be empty".to_string(),
        ));
    }
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    let key = derive_payload_key(password, &salt);
    let cipher = Aes256Gcm::new_from_slice(&key[..])
        .map_err(|_| PatchError::DecryptFailure("invalid payload key length".to_string()))?;
    let ciphertext = cipher
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: plaintext,
                aad: PAYLOAD_MAGIC,
            },
        )
        .map_err(|_| PatchError::DecryptFailure("payload encryption failed".to_string()))?;

    let mut out = Vec::with_capacity(PAYLOAD_MAGIC.len() + SALT_LEN + NONCE_LEN + ciphertext.len());
    out.extend_from_slice(PAYLOAD_MAGIC);
    out.extend_from_slice(&salt);
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

pub fn open_payload(password: &str, sealed: &[u8]) -> Result<Zeroizing<Vec<u8>>, PatchError> {
    let header = PAYLOAD_MAGIC.len();
    if sealed.len() < header + SALT_LEN + NONCE_LEN || &sealed[..header] != PAYLOAD_MAGIC {
        return Err(PatchError::DecryptFailure(
            "patch is not a password-protected payload".to_string(),
        ));
    }
    let salt = &sealed[header..header + SALT_LEN];
    let nonce = &sealed[header + SALT_LEN..header + SALT_LEN + NONCE_LEN];
    let ciphertext = &sealed[header + SALT_LEN + NONCE_LEN..];
    let key = derive_payload_key(password, salt);
    let cipher = Aes256Gcm::new_from_slice(&key[..])
        .map_err(|_| PatchError::DecryptFailure("invalid payload key length".to_string()))?;
    let plaintext = cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad: PAYLOAD_MAGIC,
            },
        )
        .map_err(|_| {
            PatchError::DecryptFailure("wrong patch password or corrupted payload".to_string())
        })?;
    Ok(Zeroizing::new(plaintext))
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::{
        is_encrypted_payload, open_backup, open_payload, seal_backup, seal_payload, FileKeyStore,
        KeyMaterial,
    };
    use crate::error::PatchError;

    #[test]
    fn backup_is_bound_to_patch_id() {
        let key = [4u8; 32];
        let sealed = seal_backup(&key, "patch_1", b"payload").expect("seal");
        assert_eq!(
            open_backup(&key, "patch_1", &sealed).expect("open").as_slice(),
            b"payload"
        );
        assert!(matches!(
            open_backup(&key, "patch_2", &sealed),
            Err(PatchError::DecryptFailure(_))
        ));
        assert!(open_backup(&[5u8; 32], "patch_1", &sealed).is_err());
    }

    #[test]
    fn corrupted_backup_fails_to_open() {
        let key = [4u8; 32];
        let mut sealed = seal_backup(&key, "patch_1", b"payload").expect("seal");
        let last = sealed.len() - 1;
        sealed[last] ^= 0x55;
        assert!(open_backup(&key, "patch_1", &sealed).is_err());
        assert!(open_backup(&key, "patch_1", b"HPBK").is_err());
    }

    #[test]
    fn key_store_must_be_provisioned_before_use() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileKeyStore::new(dir.path().join("keys/archive.key"), None);
        assert!(matches!(
            store.archive_key(),
            Err(PatchError::DecryptFailure(_))
        ));

        assert!(store.provision().expect("provision"));
        assert!(!store.provision().expect("second provision"));
        let first = store.archive_key().expect("key");
        let reopened = FileKeyStore::new(dir.path().join("keys/archive.key"), None);
        assert_eq!(*first, *reopened.archive_key().expect("key"));
    }

    #[test]
    fn operator_password_changes_derived_key() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("archive.key");
        let plain = FileKeyStore::new(&path, None);
        plain.provision().expect("provision");
        let with_password = FileKeyStore::new(&path, Some("correct horse"));
        let other_password = FileKeyStore::new(&path, Some("battery staple"));

        let a = plain.archive_key().expect("plain");
        let b = with_password.archive_key().expect("password");
        let c = other_password.archive_key().expect("other");
        assert_ne!(*a, *b);
        assert_ne!(*b, *c);
    }

    #[test]
    fn payload_envelope_requires_the_right_password() {
        let dir = tempfile::tempdir().expect("tempdir");
        let sealed = seal_payload("s3cret-pass", b"dex\n035\0").expect("seal");
        let path = dir.path().join("patch.enc");
        fs::write(&path, &sealed).expect("write");
        assert!(is_encrypted_payload(&path).expect("sniff"));

        assert_eq!(
            open_payload("s3cret-pass", &sealed).expect("open").as_slice(),
            b"dex\n035\0"
        );
        assert!(open_payload("wrong", &sealed).is_err());
        assert!(seal_payload("  ", b"x").is_err());

        let plain = dir.path().join("patch.dex");
        fs::write(&plain, b"dex\n").expect("write");
        assert!(!is_encrypted_payload(&plain).expect("sniff plain"));
    }
}
