use std::env;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use zeroize::Zeroizing;

use crate::apply::DEFAULT_QUEUE_CAPACITY;
use crate::policy::SecurityPolicy;
use crate::trust::TrustAnchor;

const ENV_FILE_ENV: &str = "HOTPATCH_ENV_FILE";

#[derive(Debug, Clone)]
pub struct Settings {
    pub data_dir: PathBuf,
    pub telemetry_file: PathBuf,
    pub require_signature: bool,
    pub require_encryption: bool,
    pub require_host_signer: bool,
    pub trust_anchor: Option<String>,
    pub patch_password: Option<Zeroizing<String>>,
    pub archive_password: Option<Zeroizing<String>>,
    pub original_bundle: Option<PathBuf>,
    pub apply_queue_capacity: usize,
}

impl Settings {
    pub fn load() -> Result<Self> {
        load_dotenv()?;

        let data_dir = read_non_empty_env("HOTPATCH_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./data"));

        let telemetry_file = read_non_empty_env("HOTPATCH_TELEMETRY_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("telemetry/latest.json"));

        Ok(Self {
            telemetry_file,
            require_signature: read_bool_env("HOTPATCH_REQUIRE_SIGNATURE", false),
            require_encryption: read_bool_env("HOTPATCH_REQUIRE_ENCRYPTION", false),
            require_host_signer: read_bool_env("HOTPATCH_REQUIRE_HOST_SIGNER", false),
            trust_anchor: read_non_empty_env("HOTPATCH_TRUST_ANCHOR"),
            patch_password: read_secret_env("HOTPATCH_PATCH_PASSWORD"),
            archive_password: read_secret_env("HOTPATCH_ARCHIVE_PASSWORD"),
            original_bundle: read_non_empty_env("HOTPATCH_ORIGINAL_BUNDLE").map(PathBuf::from),
            apply_queue_capacity: read_usize_env(
                "HOTPATCH_APPLY_QUEUE_CAPACITY",
                DEFAULT_QUEUE_CAPACITY,
            )
            .max(1),
            data_dir,
        })
    }

    pub fn initial_policy(&self) -> SecurityPolicy {
        SecurityPolicy {
            require_signature: self.require_signature,
            require_encryption: self.require_encryption,
        }
    }

    pub fn parsed_trust_anchor(&self) -> Result<Option<TrustAnchor>> {
        self.trust_anchor
            .as_deref()
            .map(|raw| TrustAnchor::parse(raw).context("invalid HOTPATCH_TRUST_ANCHOR"))
            .transpose()
    }

    pub fn doctor_report(&self) -> DoctorReport {
        let mut warnings = Vec::new();

        let anchor = match self.trust_anchor.as_deref() {
            Some(raw) => match TrustAnchor::parse(raw) {
                Ok(anchor) => Some(anchor),
                Err(err) => {
                    warnings.push(format!(
                        "HOTPATCH_TRUST_ANCHOR could not be parsed: {}",
                        err
                    ));
                    None
                }
            },
            None => None,
        };
        let trust_anchor_count = anchor
            .as_ref()
            .map(|value| value.certificates().len())
            .unwrap_or(0);

        if self.require_host_signer && self.trust_anchor.is_none() {
            warnings.push(
                "HOTPATCH_REQUIRE_HOST_SIGNER=true but HOTPATCH_TRUST_ANCHOR is missing; every install will be rejected"
                    .to_string(),
            );
        }
        if anchor.as_ref().is_some_and(TrustAnchor::is_multi_signer) {
            warnings.push(
                "HOTPATCH_TRUST_ANCHOR lists more than one signing key; multi-signer hosts always fail host-signer checks"
                    .to_string(),
            );
        }
        if self.require_encryption && self.patch_password.is_none() {
            warnings.push(
                "HOTPATCH_REQUIRE_ENCRYPTION=true but HOTPATCH_PATCH_PASSWORD is missing; encrypted payloads cannot be unwrapped"
                    .to_string(),
            );
        }
        if self.require_host_signer && !self.require_signature {
            warnings.push(
                "HOTPATCH_REQUIRE_HOST_SIGNER=true while HOTPATCH_REQUIRE_SIGNATURE=false; unsigned patches pass the policy check and are then rejected by the host-signer check as signature_invalid"
                    .to_string(),
            );
        }
        if self
            .original_bundle
            .as_ref()
            .is_some_and(|path| !path.exists())
        {
            warnings.push(format!(
                "HOTPATCH_ORIGINAL_BUNDLE points at a missing file: {}",
                self.original_bundle
                    .as_ref()
                    .map(|path| path.display().to_string())
                    .unwrap_or_default()
            ));
        }

        DoctorReport {
            data_dir: self.data_dir.clone(),
            telemetry_file: self.telemetry_file.clone(),
            require_signature: self.require_signature,
            require_encryption: self.require_encryption,
            require_host_signer: self.require_host_signer,
            trust_anchor_count,
            patch_password_loaded: self.patch_password.is_some(),
            archive_password_loaded: self.archive_password.is_some(),
            original_bundle: self.original_bundle.clone(),
            apply_queue_capacity: self.apply_queue_capacity,
            warnings,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DoctorReport {
    pub data_dir: PathBuf,
    pub telemetry_file: PathBuf,
    pub require_signature: bool,
    pub require_encryption: bool,
    pub require_host_signer: bool,
    pub trust_anchor_count: usize,
    pub patch_password_loaded: bool,
    pub archive_password_loaded: bool,
    pub original_bundle: Option<PathBuf>,
    pub apply_queue_capacity: usize,
    pub warnings: Vec<String>,
}

fn read_non_empty_env(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn read_secret_env(key: &str) -> Option<Zeroizing<String>> {
    // Passwords are taken verbatim; surrounding whitespace may be significant.
    env::var(key)
        .ok()
        .filter(|value| !value.is_empty())
        .map(Zeroizing::new)
}

fn read_usize_env(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<usize>().ok())
        .unwrap_or(default)
}

fn read_bool_env(key: &str, default: bool) -> bool {
    let Some(value) = env::var(key).ok() else {
        return default;
    };
    let normalized = value.trim().to_ascii_lowercase();
    match normalized.as_str() {
        "1" | "true" | "yes" | "on" => true,
        "0" | "false" | "no" | "off" => false,
        _ => default,
    }
}

fn load_dotenv() -> Result<()> {
    if let Ok(path) = env::var(ENV_FILE_ENV) {
        if !path.trim().is_empty() {
            dotenvy::from_path(path.trim())
                .with_context(|| format!("failed loading {} from {}", ENV_FILE_ENV, path.trim()))?;
            return Ok(());
        }
    }

    if Path::new(".env").exists() {
        dotenvy::from_path(".env").context("failed loading .env from current directory")?;
    }

    Ok(())
}
