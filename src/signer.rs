use std::collections::BTreeMap;
use std::fs;
use std::io::{Read, Write};
use std::path::Path;

use ed25519_dalek::{Signer, SigningKey};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use tracing::info;
use zeroize::Zeroizing;
use zip::write::FileOptions;

use crate::error::PatchError;
use crate::verifier::{
    is_metadata_entry, is_signature_block, to_lower_hex, Certificate, SignatureBlock,
    SIGNATURE_ALGORITHM, SIGNATURE_BLOCK_PREFIX, SIGNATURE_BLOCK_SUFFIX,
};

pub fn generate_signing_key() -> SigningKey {
    let mut seed = Zeroizing::new([0u8; 32]);
    OsRng.fill_bytes(&mut seed[..]);
    SigningKey::from_bytes(&seed)
}

/// Reads a 32-byte Ed25519 seed given as hex or base64.
pub fn parse_signing_key(raw: &str) -> Result<SigningKey, PatchError> {
    let bytes = Zeroizing::new(crate::trust::decode_hex_or_base64(raw)?);
    let seed: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
        PatchError::SignatureInvalid("Ed25519 signing seed must decode to 32 bytes".to_string())
    })?;
    Ok(SigningKey::from_bytes(&seed))
}

/// Writes a ZIP archive with the given entries in order.
pub fn write_archive(path: &Path, entries: &[(String, Vec<u8>)]) -> Result<(), PatchError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|err| PatchError::io(parent, err))?;
    }
    let file = fs::File::create(path).map_err(|err| PatchError::io(path, err))?;
    let mut writer = zip::ZipWriter::new(file);
    let options = FileOptions::default().compression_method(zip::CompressionMethod::Deflated);
    for (name, data) in entries {
        writer.start_file(name.as_str(), options)?;
        writer
            .write_all(data)
            .map_err(|err| PatchError::io(path, err))?;
    }
    writer.finish()?;
    Ok(())
}

/// Signs every content entry of `input` with `signing_key` and writes the
/// result to `output`. Existing signature blocks are dropped.
pub fn sign_archive(
    input: &Path,
    output: &Path,
    signing_key: &SigningKey,
    alias: &str,
    subject: Option<&str>,
) -> Result<Certificate, PatchError> {
    let alias = normalize_alias(alias)?;
    let file = fs::File::open(input).map_err(|err| PatchError::io(input, err))?;
    let mut archive = zip::ZipArchive::new(file)?;

    let mut entries = Vec::new();
    let mut digests = BTreeMap::new();
    for index in 0..archive.len() {
        let mut entry = archive.by_index(index)?;
        if entry.is_dir() || is_signature_block(entry.name()) {
            continue;
        }
        let name = entry.name().to_string();
        let mut data = Vec::new();
        entry
            .read_to_end(&mut data)
            .map_err(|err| PatchError::Archive(format!("failed reading {}: {}", name, err)))?;
        if !is_metadata_entry(&name, false) {
            digests.insert(name.clone(), to_lower_hex(&Sha256::digest(&data)));
        }
        entries.push((name, data));
    }

    if digests.is_empty() {
        return Err(PatchError::Archive(
            "archive has no content entries to sign".to_string(),
        ));
    }

    let subject = subject
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToString::to_string);
    let payload = SignatureBlock::payload(subject.as_deref(), &digests);
    let signature = signing_key.sign(payload.as_bytes());
    let verifying_key = signing_key.verifying_key();
    let block = SignatureBlock {
        version: 1,
        algorithm: SIGNATURE_ALGORITHM.to_string(),
        subject: subject.clone(),
        public_key: to_lower_hex(&verifying_key.to_bytes()),
        entries: digests,
        signature: to_lower_hex(&signature.to_bytes()),
    };
    let encoded = serde_json::to_vec_pretty(&block)
        .map_err(|err| PatchError::Archive(format!("failed encoding signature block: {}", err)))?;
    entries.push((
        format!("{}{}{}", SIGNATURE_BLOCK_PREFIX, alias, SIGNATURE_BLOCK_SUFFIX),
        encoded,
    ));

    write_archive(output, &entries)?;
    let certificate = Certificate::from_verifying_key(subject, &verifying_key);
    info!(
        output = %output.display(),
        alias = %alias,
        signer = %certificate.fingerprint(),
        entries = block.entries.len(),
        "patch archive signed"
    );
    Ok(certificate)
}

fn normalize_alias(raw: &str) -> Result<String, PatchError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(PatchError::Archive("signing alias cannot be empty".to_string()));
    }
    if !trimmed
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '-')
    {
        return Err(PatchError::Archive(format!(
            "signing alias '{}' must be ASCII alphanumeric, '-' or '_'",
            trimmed
        )));
    }
    Ok(trimmed.to_ascii_uppercase())
}
