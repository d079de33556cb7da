use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Serialize)]
pub struct AuditVerifyReport {
    pub audit_log_path: String,
    pub entries: usize,
    pub last_hash: Option<String>,
    pub valid: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub timestamp: String,
    pub event: String,
    pub status: String,
    pub patch_id: Option<String>,
    pub version: Option<String>,
    pub content_hash: Option<String>,
    pub integrity: Option<String>,
    pub tamper_count: Option<u32>,
    pub error_kind: Option<String>,
    pub error: Option<String>,
    pub prev_hash: Option<String>,
    pub hash: String,
}

/// One trust decision to be appended. `event` is the phase (`boot`,
/// `recovery`, `install`, `clear`), `status` its outcome label.
#[derive(Debug, Default)]
pub struct AuditEvent<'a> {
    pub event: &'a str,
    pub status: &'a str,
    pub patch_id: Option<&'a str>,
    pub version: Option<&'a str>,
    pub content_hash: Option<&'a str>,
    pub integrity: Option<&'a str>,
    pub tamper_count: Option<u32>,
    pub error_kind: Option<&'a str>,
    pub error: Option<String>,
}

/// Append-only JSON-lines log where every record carries the hash of its
/// predecessor. Clones share one append lock so the read of the chain tail
/// and the write of the next record happen as a unit.
#[derive(Debug, Clone)]
pub struct AuditLog {
    path: PathBuf,
    append_lock: Arc<Mutex<()>>,
}

impl AuditLog {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            append_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends and reports failures on stderr instead of returning them.
    pub fn append_safe(&self, event: AuditEvent<'_>) {
        if let Err(err) = self.append(event) {
            eprintln!(
                "{{\"event\":\"patch_audit_error\",\"message\":{}}}",
                serde_json::to_string(&err.to_string())
                    .unwrap_or_else(|_| "\"failed to encode audit error\"".to_string())
            );
        }
    }

    pub fn append(&self, event: AuditEvent<'_>) -> Result<()> {
        let _guard = self
            .append_lock
            .lock()
            .unwrap_or_else(|poison| poison.into_inner());
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed creating audit dir {}", parent.display()))?;
        }

        let prev_hash = read_last_audit_hash(&self.path)?;
        let mut record = AuditRecord {
            timestamp: Utc::now().to_rfc3339(),
            event: event.event.to_string(),
            status: event.status.to_string(),
            patch_id: event.patch_id.map(ToString::to_string),
            version: event.version.map(ToString::to_string),
            content_hash: event.content_hash.map(ToString::to_string),
            integrity: event.integrity.map(ToString::to_string),
            tamper_count: event.tamper_count,
            error_kind: event.error_kind.map(ToString::to_string),
            error: event.error,
            prev_hash,
            hash: String::new(),
        };
        record.hash = compute_audit_record_hash(&record);

        let line = serde_json::to_string(&record).context("failed encoding patch audit")?;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed opening patch audit log {}", self.path.display()))?;
        file.write_all(line.as_bytes())
            .with_context(|| format!("failed writing patch audit log {}", self.path.display()))?;
        file.write_all(b"\n").with_context(|| {
            format!("failed finalizing patch audit log {}", self.path.display())
        })?;
        Ok(())
    }

    pub fn read_records(&self) -> Result<Vec<AuditRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let raw = fs::read_to_string(&self.path)
            .with_context(|| format!("failed reading patch audit log {}", self.path.display()))?;
        raw.lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(idx, line)| {
                serde_json::from_str::<AuditRecord>(line).with_context(|| {
                    format!(
                        "failed decoding patch audit record at line {} in {}",
                        idx + 1,
                        self.path.display()
                    )
                })
            })
            .collect()
    }

    pub fn verify(&self) -> Result<AuditVerifyReport> {
        if !self.path.exists() {
            return Ok(AuditVerifyReport {
                audit_log_path: self.path.display().to_string(),
                entries: 0,
                last_hash: None,
                valid: true,
            });
        }

        let raw = fs::read_to_string(&self.path)
            .with_context(|| format!("failed reading patch audit log {}", self.path.display()))?;
        let mut entries = 0usize;
        let mut expected_prev_hash: Option<String> = None;
        let mut last_hash = None;

        for (idx, line) in raw.lines().enumerate() {
            let line_no = idx + 1;
            if line.trim().is_empty() {
                continue;
            }
            let record: AuditRecord = serde_json::from_str(line).with_context(|| {
                format!(
                    "failed decoding patch audit record at line {} in {}",
                    line_no,
                    self.path.display()
                )
            })?;
            let record_hash = normalize_audit_hash(&record.hash)
                .with_context(|| format!("invalid audit hash at line {}", line_no))?;
            if compute_audit_record_hash(&record) != record_hash {
                return Err(anyhow!("audit hash mismatch at line {}", line_no));
            }

            let prev_hash = record
                .prev_hash
                .as_deref()
                .map(normalize_audit_hash)
                .transpose()
                .with_context(|| format!("invalid audit prev_hash at line {}", line_no))?;
            if prev_hash != expected_prev_hash {
                return Err(anyhow!(
                    "audit chain prev_hash mismatch at line {}",
                    line_no
                ));
            }

            expected_prev_hash = Some(record_hash.clone());
            last_hash = Some(record_hash);
            entries += 1;
        }

        Ok(AuditVerifyReport {
            audit_log_path: self.path.display().to_string(),
            entries,
            last_hash,
            valid: true,
        })
    }
}

fn read_last_audit_hash(path: &Path) -> Result<Option<String>> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed reading patch audit log {}", path.display()))?;
    let Some(last_line) = raw.lines().rev().find(|line| !line.trim().is_empty()) else {
        return Ok(None);
    };
    let parsed: AuditRecord =
        serde_json::from_str(last_line).context("failed decoding patch audit log line")?;
    normalize_audit_hash(&parsed.hash).map(Some)
}

fn compute_audit_record_hash(record: &AuditRecord) -> String {
    let payload = format!(
        "timestamp={}\nevent={}\nstatus={}\npatch_id={}\nversion={}\ncontent_hash={}\nintegrity={}\ntamper_count={}\nerror_kind={}\nerror={}\nprev_hash={}\n",
        record.timestamp,
        record.event,
        record.status,
        record.patch_id.as_deref().unwrap_or_default(),
        record.version.as_deref().unwrap_or_default(),
        record.content_hash.as_deref().unwrap_or_default(),
        record.integrity.as_deref().unwrap_or_default(),
        record
            .tamper_count
            .map(|value| value.to_string())
            .unwrap_or_default(),
        record.error_kind.as_deref().unwrap_or_default(),
        record.error.as_deref().unwrap_or_default(),
        record.prev_hash.as_deref().unwrap_or_default(),
    );
    format!("{:x}", Sha256::digest(payload.as_bytes()))
}

fn normalize_audit_hash(raw: &str) -> Result<String> {
    let normalized = raw.trim().to_ascii_lowercase();
    if normalized.len() != 64 || !normalized.chars().all(|ch| ch.is_ascii_hexdigit()) {
        return Err(anyhow!("audit hash must be a 64-character sha256 hex string"));
    }
    Ok(normalized)
}
