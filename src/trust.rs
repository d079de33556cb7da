use std::path::Path;

use base64::{engine::general_purpose, Engine as _};
use ed25519_dalek::VerifyingKey;
use tracing::{error, info};

use crate::error::PatchError;
use crate::verifier::{self, certificates_match, Certificate};

/// The host application's own signing identity.
///
/// Used only as a comparison target, never as a PKI root. A host that
/// declares more than one signing certificate is not supported: every
/// host-identity check against it fails.
#[derive(Debug, Clone)]
pub struct TrustAnchor {
    certificates: Vec<Certificate>,
}

impl TrustAnchor {
    pub fn new(certificate: Certificate) -> Self {
        Self {
            certificates: vec![certificate],
        }
    }

    pub fn from_certificates(certificates: Vec<Certificate>) -> Result<Self, PatchError> {
        if certificates.is_empty() {
            return Err(PatchError::SignatureMismatchWithHost(
                "host signing identity is empty".to_string(),
            ));
        }
        Ok(Self { certificates })
    }

    /// Parses a comma-separated list of hex or base64 Ed25519 public keys.
    pub fn parse(raw: &str) -> Result<Self, PatchError> {
        let certificates = raw
            .split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(|part| {
                parse_ed25519_public_key(part)
                    .map(|key| Certificate::from_verifying_key(None, &key))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Self::from_certificates(certificates)
    }

    pub fn is_multi_signer(&self) -> bool {
        self.certificates.len() > 1
    }

    pub fn certificates(&self) -> &[Certificate] {
        &self.certificates
    }

    pub fn signer(&self) -> Result<&Certificate, PatchError> {
        match self.certificates.as_slice() {
            [single] => Ok(single),
            _ => Err(PatchError::SignatureMismatchWithHost(format!(
                "host declares {} signing certificates; multi-signer hosts are not supported",
                self.certificates.len()
            ))),
        }
    }
}

/// Every entry must be signature-valid and the shared signer must be the
/// host itself.
pub fn check_patch_signer(path: &Path, anchor: &TrustAnchor) -> Result<Certificate, PatchError> {
    let host = anchor.signer()?;
    let patch_signer = verifier::inspect_signed_archive(path)?;
    if !certificates_match(&patch_signer, host) {
        return Err(PatchError::SignatureMismatchWithHost(format!(
            "patch signer {} differs from host signer {}",
            patch_signer.fingerprint(),
            host.fingerprint()
        )));
    }
    Ok(patch_signer)
}

pub fn verify_patch_signature_matches_app(path: &Path, anchor: &TrustAnchor) -> bool {
    match check_patch_signer(path, anchor) {
        Ok(signer) => {
            info!(path = %path.display(), signer = %signer.fingerprint(), "patch signer matches host");
            true
        }
        Err(err) => {
            error!(path = %path.display(), error = %err, "patch signer does not match host");
            false
        }
    }
}

pub fn parse_ed25519_public_key(raw: &str) -> Result<VerifyingKey, PatchError> {
    let bytes = decode_hex_or_base64(raw)?;
    let key_bytes: [u8; 32] = bytes.try_into().map_err(|_| {
        PatchError::SignatureInvalid("Ed25519 public key must decode to 32 bytes".to_string())
    })?;
    VerifyingKey::from_bytes(&key_bytes)
        .map_err(|_| PatchError::SignatureInvalid("invalid Ed25519 public key bytes".to_string()))
}

pub fn decode_hex_or_base64(raw: &str) -> Result<Vec<u8>, PatchError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(PatchError::SignatureInvalid("key value is empty".to_string()));
    }
    if trimmed.len() % 2 == 0 && trimmed.chars().all(|ch| ch.is_ascii_hexdigit()) {
        return verifier::decode_hex(trimmed).map_err(PatchError::SignatureInvalid);
    }

    general_purpose::STANDARD
        .decode(trimmed)
        .or_else(|_| general_purpose::STANDARD_NO_PAD.decode(trimmed))
        .or_else(|_| general_purpose::URL_SAFE.decode(trimmed))
        .or_else(|_| general_purpose::URL_SAFE_NO_PAD.decode(trimmed))
        .map_err(|_| PatchError::SignatureInvalid("value must be base64 or hex encoded".to_string()))
}
