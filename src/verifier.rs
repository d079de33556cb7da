//! Content hashing, signed-archive inspection and certificate comparison.
//!
//! Everything here is stateless and only touches the file system, so it is
//! safe to call from the bootstrap phase.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::io::Read;
use std::path::Path;

use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::{debug, warn};

use crate::error::PatchError;

pub const SIGNATURE_BLOCK_PREFIX: &str = "META-INF/";
pub const SIGNATURE_BLOCK_SUFFIX: &str = ".SIG";
pub const SIGNATURE_ALGORITHM: &str = "ed25519";
const SIGNATURE_PAYLOAD_HEADER: &str = "hotpatch-signature-v1";

const ZIP_LOCAL_HEADER_MAGIC: &[u8; 4] = b"PK\x03\x04";
const ZIP_EMPTY_ARCHIVE_MAGIC: &[u8; 4] = b"PK\x05\x06";
const DEX_MAGIC: &[u8; 4] = b"dex\n";

/// Lower-case hex SHA-256 digest of a patch file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentHash(String);

impl ContentHash {
    pub fn parse(raw: &str) -> Result<Self, PatchError> {
        let normalized = raw.trim().to_ascii_lowercase();
        if normalized.len() != 64 || !normalized.chars().all(|ch| ch.is_ascii_hexdigit()) {
            return Err(PatchError::Archive(
                "content hash must be a 64-character SHA-256 hex string".to_string(),
            ));
        }
        Ok(Self(normalized))
    }

    pub fn from_digest(digest: &[u8]) -> Self {
        Self(to_lower_hex(digest))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Compares without short-circuiting on the first differing byte.
    pub fn ct_eq(&self, other: &ContentHash) -> bool {
        self.0.as_bytes().ct_eq(other.0.as_bytes()).into()
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntegrityVerdict {
    Verified,
    /// No hash was recorded for this install. Accepted for backward
    /// compatibility, never for new installs.
    LegacyTrusted,
    Mismatch {
        expected: ContentHash,
        actual: ContentHash,
    },
}

impl IntegrityVerdict {
    pub fn is_trusted(&self) -> bool {
        !matches!(self, Self::Mismatch { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Verified => "verified",
            Self::LegacyTrusted => "legacy_trusted",
            Self::Mismatch { .. } => "mismatch",
        }
    }

    pub fn mismatch_error(&self) -> Option<PatchError> {
        match self {
            Self::Mismatch { expected, actual } => Some(PatchError::HashMismatch {
                expected: expected.to_string(),
                actual: actual.to_string(),
            }),
            _ => None,
        }
    }
}

/// Signer identity bound to archive entries. Only the public key takes
/// part in comparisons; the subject is informational.
#[derive(Debug, Clone, Serialize)]
pub struct Certificate {
    pub subject: Option<String>,
    #[serde(serialize_with = "serialize_key_hex")]
    pub public_key: [u8; 32],
}

impl Certificate {
    pub fn new(subject: Option<String>, public_key: [u8; 32]) -> Self {
        Self {
            subject,
            public_key,
        }
    }

    pub fn from_verifying_key(subject: Option<String>, key: &VerifyingKey) -> Self {
        Self::new(subject, key.to_bytes())
    }

    pub fn public_key_hex(&self) -> String {
        to_lower_hex(&self.public_key)
    }

    pub fn fingerprint(&self) -> String {
        to_lower_hex(&Sha256::digest(self.public_key))
    }

    fn verifying_key(&self) -> Result<VerifyingKey, PatchError> {
        VerifyingKey::from_bytes(&self.public_key)
            .map_err(|_| PatchError::SignatureInvalid("invalid Ed25519 public key".to_string()))
    }
}

fn serialize_key_hex<S>(key: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_str(&to_lower_hex(key))
}

/// Compares public-key encodings only.
pub fn certificates_match(a: &Certificate, b: &Certificate) -> bool {
    a.public_key[..].ct_eq(&b.public_key[..]).into()
}

/// JSON document stored at `META-INF/<ALIAS>.SIG`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignatureBlock {
    pub version: u32,
    pub algorithm: String,
    pub subject: Option<String>,
    pub public_key: String,
    pub entries: BTreeMap<String, String>,
    pub signature: String,
}

impl SignatureBlock {
    pub(crate) fn payload(subject: Option<&str>, entries: &BTreeMap<String, String>) -> String {
        let mut payload = String::new();
        payload.push_str(SIGNATURE_PAYLOAD_HEADER);
        payload.push('\n');
        payload.push_str("subject=");
        payload.push_str(subject.unwrap_or(""));
        payload.push('\n');
        for (name, digest) in entries {
            payload.push_str(digest);
            payload.push_str("  ");
            payload.push_str(name);
            payload.push('\n');
        }
        payload
    }

    fn certificate(&self) -> Result<Certificate, PatchError> {
        let bytes = decode_hex(&self.public_key).map_err(PatchError::SignatureInvalid)?;
        let key: [u8; 32] = bytes.try_into().map_err(|_| {
            PatchError::SignatureInvalid("signer public key must be 32 bytes".to_string())
        })?;
        Ok(Certificate::new(self.subject.clone(), key))
    }

    fn verify(&self) -> Result<Certificate, PatchError> {
        if !self.algorithm.eq_ignore_ascii_case(SIGNATURE_ALGORITHM) {
            return Err(PatchError::SignatureInvalid(format!(
                "unsupported signature algorithm '{}'",
                self.algorithm
            )));
        }
        let certificate = self.certificate()?;
        let signature_bytes = decode_hex(&self.signature).map_err(PatchError::SignatureInvalid)?;
        let signature_bytes: [u8; 64] = signature_bytes.try_into().map_err(|_| {
            PatchError::SignatureInvalid("signature must be 64 bytes".to_string())
        })?;
        let signature = Signature::from_bytes(&signature_bytes);
        let payload = Self::payload(self.subject.as_deref(), &self.entries);
        certificate
            .verifying_key()?
            .verify(payload.as_bytes(), &signature)
            .map_err(|_| {
                PatchError::SignatureInvalid("signature block verification failed".to_string())
            })?;
        Ok(certificate)
    }
}

/// Streams the file through SHA-256.
pub fn compute_content_hash(path: &Path) -> Result<ContentHash, PatchError> {
    let mut file = fs::File::open(path).map_err(|err| PatchError::io(path, err))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf).map_err(|err| PatchError::io(path, err))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(ContentHash::from_digest(&hasher.finalize()))
}

pub fn verify_integrity(
    path: &Path,
    expected: Option<&ContentHash>,
) -> Result<IntegrityVerdict, PatchError> {
    let Some(expected) = expected else {
        warn!(
            path = %path.display(),
            integrity = "legacy_trusted",
            "no content hash recorded for applied patch; trusting legacy install"
        );
        return Ok(IntegrityVerdict::LegacyTrusted);
    };

    let actual = compute_content_hash(path)?;
    if actual.ct_eq(expected) {
        Ok(IntegrityVerdict::Verified)
    } else {
        Ok(IntegrityVerdict::Mismatch {
            expected: expected.clone(),
            actual,
        })
    }
}

pub fn is_signature_block(name: &str) -> bool {
    name.starts_with(SIGNATURE_BLOCK_PREFIX) && name.ends_with(SIGNATURE_BLOCK_SUFFIX)
}

pub fn is_metadata_entry(name: &str, is_dir: bool) -> bool {
    is_dir || name.starts_with(SIGNATURE_BLOCK_PREFIX)
}

/// True when the archive declares at least one signature block, valid or
/// not.
pub fn has_signature_blocks(path: &Path) -> Result<bool, PatchError> {
    let file = fs::File::open(path).map_err(|err| PatchError::io(path, err))?;
    let archive = zip::ZipArchive::new(file)?;
    let signed = archive.file_names().any(is_signature_block);
    Ok(signed)
}

/// Verifies every content entry of a signed archive and returns the one
/// certificate they all share.
///
/// Entries are read to the end before their binding is trusted; a digest
/// recorded in a signature block says nothing about bytes nobody read.
pub fn inspect_signed_archive(path: &Path) -> Result<Certificate, PatchError> {
    let file = fs::File::open(path).map_err(|err| PatchError::io(path, err))?;
    let mut archive = zip::ZipArchive::new(file)?;

    let mut blocks: Vec<(SignatureBlock, Certificate)> = Vec::new();
    for index in 0..archive.len() {
        let mut entry = archive.by_index(index)?;
        if entry.is_dir() || !is_signature_block(entry.name()) {
            continue;
        }
        let name = entry.name().to_string();
        let mut raw = String::new();
        entry
            .read_to_string(&mut raw)
            .map_err(|err| PatchError::Archive(format!("failed reading {}: {}", name, err)))?;
        let block: SignatureBlock = serde_json::from_str(&raw).map_err(|err| {
            PatchError::SignatureInvalid(format!("failed decoding {}: {}", name, err))
        })?;
        let certificate = block.verify()?;
        debug!(block = %name, signer = %certificate.fingerprint(), "signature block verified");
        blocks.push((block, certificate));
    }

    if blocks.is_empty() {
        return Err(PatchError::SignatureInvalid(
            "archive carries no signature block".to_string(),
        ));
    }

    let mut signer: Option<Certificate> = None;
    let mut seen = BTreeSet::new();
    let mut buf = [0u8; 8192];
    for index in 0..archive.len() {
        let mut entry = archive.by_index(index)?;
        if is_metadata_entry(entry.name(), entry.is_dir()) {
            continue;
        }
        let name = entry.name().to_string();

        let mut hasher = Sha256::new();
        loop {
            let n = entry
                .read(&mut buf)
                .map_err(|err| PatchError::Archive(format!("failed reading {}: {}", name, err)))?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        let digest = to_lower_hex(&hasher.finalize());

        let mut bound: Option<&Certificate> = None;
        for (block, certificate) in &blocks {
            let Some(recorded) = block.entries.get(&name) else {
                continue;
            };
            if !recorded.eq_ignore_ascii_case(&digest) {
                return Err(PatchError::SignatureInvalid(format!(
                    "entry {} does not match its signed digest",
                    name
                )));
            }
            match bound {
                Some(existing) if !certificates_match(existing, certificate) => {
                    return Err(PatchError::SignatureInvalid(format!(
                        "entry {} is bound to more than one signer",
                        name
                    )));
                }
                _ => bound = Some(certificate),
            }
        }

        let Some(bound) = bound else {
            return Err(PatchError::SignatureInvalid(format!(
                "entry {} is not covered by any signature",
                name
            )));
        };
        match signer.as_ref() {
            Some(existing) if !certificates_match(existing, bound) => {
                return Err(PatchError::SignatureInvalid(
                    "archive entries are signed by different certificates".to_string(),
                ));
            }
            Some(_) => {}
            None => signer = Some(bound.clone()),
        }
        seen.insert(name);
    }

    for (block, _) in &blocks {
        if let Some(missing) = block.entries.keys().find(|name| !seen.contains(*name)) {
            return Err(PatchError::SignatureInvalid(format!(
                "signed entry {} is missing from the archive",
                missing
            )));
        }
    }

    signer.ok_or_else(|| {
        PatchError::SignatureInvalid("archive has no content entries".to_string())
    })
}

/// `None` when the archive is unsigned, partially signed, multi-signed or
/// unreadable. The reason is logged.
pub fn extract_signer_certificate(path: &Path) -> Option<Certificate> {
    match inspect_signed_archive(path) {
        Ok(certificate) => Some(certificate),
        Err(err) => {
            debug!(path = %path.display(), error = %err, "no consistent signer certificate");
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    /// Container that may carry a resource bundle next to code.
    Archive,
    /// Bare code module.
    CodeModule,
    Unknown,
}

impl ContentKind {
    pub fn sniff(path: &Path) -> Result<Self, PatchError> {
        let mut file = fs::File::open(path).map_err(|err| PatchError::io(path, err))?;
        let mut magic = [0u8; 4];
        let mut filled = 0;
        while filled < magic.len() {
            let n = file
                .read(&mut magic[filled..])
                .map_err(|err| PatchError::io(path, err))?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled < magic.len() {
            return Ok(Self::Unknown);
        }
        Ok(Self::from_magic(&magic))
    }

    pub fn from_magic(magic: &[u8; 4]) -> Self {
        if magic == ZIP_LOCAL_HEADER_MAGIC || magic == ZIP_EMPTY_ARCHIVE_MAGIC {
            Self::Archive
        } else if magic == DEX_MAGIC {
            Self::CodeModule
        } else {
            Self::Unknown
        }
    }

    /// Unknown content is treated as code only rather than failing open.
    pub fn may_contain_resources(self) -> bool {
        matches!(self, Self::Archive)
    }
}

/// True when the first local header of a ZIP archive has the traditional
/// encryption flag set.
pub fn is_archive_password_protected(path: &Path) -> Result<bool, PatchError> {
    let mut file = fs::File::open(path).map_err(|err| PatchError::io(path, err))?;
    let mut header = [0u8; 8];
    match file.read_exact(&mut header) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(false),
        Err(err) => return Err(PatchError::io(path, err)),
    }
    if &header[..4] != ZIP_LOCAL_HEADER_MAGIC {
        return Ok(false);
    }
    let flags = u16::from_le_bytes([header[6], header[7]]);
    Ok(flags & 0x0001 != 0)
}

pub(crate) fn to_lower_hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|byte| format!("{:02x}", byte))
        .collect::<String>()
}

pub(crate) fn decode_hex(hex: &str) -> Result<Vec<u8>, String> {
    let hex = hex.trim();
    if hex.len() % 2 != 0 {
        return Err("hex value length must be even".to_string());
    }

    let mut out = Vec::with_capacity(hex.len() / 2);
    for i in (0..hex.len()).step_by(2) {
        let byte = hex
            .get(i..i + 2)
            .and_then(|pair| u8::from_str_radix(pair, 16).ok())
            .ok_or_else(|| "value must contain valid hexadecimal characters".to_string())?;
        out.push(byte);
    }
    Ok(out)
}
