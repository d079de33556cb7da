use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::apply::InstallResult;
use crate::bootstrap::{BootOutcome, BootState};
use crate::error::PatchError;
use crate::recovery::RecoveryOutcome;

const TELEMETRY_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootTelemetry {
    pub timestamp: String,
    pub state: String,
    pub patch_id: Option<String>,
    pub integrity: Option<String>,
    pub tamper_count: Option<u32>,
    pub injected: bool,
    pub merged_resources: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryTelemetry {
    pub timestamp: String,
    pub outcome: String,
    pub patch_id: Option<String>,
    pub tamper_count: Option<u32>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallTelemetry {
    pub timestamp: String,
    pub status: String,
    pub patch_id: Option<String>,
    pub version: Option<String>,
    pub size: Option<u64>,
    pub signed: Option<bool>,
    pub encrypted: Option<bool>,
    pub error_kind: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetrySnapshot {
    pub schema_version: u32,
    pub updated_at: String,
    pub boots_total: u64,
    pub legacy_trusted_boots: u64,
    pub tamper_events: u64,
    pub hard_resets: u64,
    pub recoveries_restored: u64,
    pub installs_ok: u64,
    pub installs_failed: u64,
    pub last_boot: Option<BootTelemetry>,
    pub last_recovery: Option<RecoveryTelemetry>,
    pub last_install: Option<InstallTelemetry>,
}

impl Default for TelemetrySnapshot {
    fn default() -> Self {
        Self {
            schema_version: TELEMETRY_SCHEMA_VERSION,
            updated_at: Utc::now().to_rfc3339(),
            boots_total: 0,
            legacy_trusted_boots: 0,
            tamper_events: 0,
            hard_resets: 0,
            recoveries_restored: 0,
            installs_ok: 0,
            installs_failed: 0,
            last_boot: None,
            last_recovery: None,
            last_install: None,
        }
    }
}

pub struct TelemetryStore {
    path: PathBuf,
    snapshot: TelemetrySnapshot,
}

impl TelemetryStore {
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let snapshot = load_snapshot(&path)?;
        Ok(Self { path, snapshot })
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        self.snapshot.clone()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record_boot(&mut self, outcome: &BootOutcome) -> Result<()> {
        let now = self.touch();
        self.snapshot.boots_total = self.snapshot.boots_total.saturating_add(1);
        if outcome.integrity == Some("legacy_trusted") {
            self.snapshot.legacy_trusted_boots =
                self.snapshot.legacy_trusted_boots.saturating_add(1);
        }
        if outcome.state == BootState::Tampered {
            self.snapshot.tamper_events = self.snapshot.tamper_events.saturating_add(1);
        }
        if outcome.hard_reset {
            self.snapshot.hard_resets = self.snapshot.hard_resets.saturating_add(1);
        }
        self.snapshot.last_boot = Some(BootTelemetry {
            timestamp: now,
            state: outcome.state.label().to_string(),
            patch_id: outcome.patch_id.clone(),
            integrity: outcome.integrity.map(ToString::to_string),
            tamper_count: outcome.tamper_count,
            injected: outcome.injected,
            merged_resources: outcome.merged_resources,
            error: outcome.error.clone(),
        });
        self.persist()
    }

    pub fn record_recovery(&mut self, outcome: &RecoveryOutcome) -> Result<()> {
        let now = self.touch();
        let (patch_id, tamper_count) = match outcome {
            RecoveryOutcome::NotNeeded | RecoveryOutcome::NoRecord => (None, None),
            RecoveryOutcome::Abandoned { patch_id, .. }
            | RecoveryOutcome::Restored { patch_id } => (Some(patch_id.clone()), None),
            RecoveryOutcome::Tampered {
                patch_id,
                tamper_count,
            }
            | RecoveryOutcome::HardReset {
                patch_id,
                tamper_count,
            } => (Some(patch_id.clone()), Some(*tamper_count)),
        };
        match outcome {
            RecoveryOutcome::Restored { .. } => {
                self.snapshot.recoveries_restored =
                    self.snapshot.recoveries_restored.saturating_add(1);
            }
            RecoveryOutcome::Tampered { .. } => {
                self.snapshot.tamper_events = self.snapshot.tamper_events.saturating_add(1);
            }
            RecoveryOutcome::HardReset { .. } => {
                self.snapshot.tamper_events = self.snapshot.tamper_events.saturating_add(1);
                self.snapshot.hard_resets = self.snapshot.hard_resets.saturating_add(1);
            }
            _ => {}
        }
        let error = match outcome {
            RecoveryOutcome::Abandoned { reason, .. } => Some(reason.clone()),
            _ => None,
        };
        self.snapshot.last_recovery = Some(RecoveryTelemetry {
            timestamp: now,
            outcome: outcome.label().to_string(),
            patch_id,
            tamper_count,
            error,
        });
        self.persist()
    }

    pub fn record_install_success(&mut self, result: &InstallResult) -> Result<()> {
        let now = self.touch();
        self.snapshot.installs_ok = self.snapshot.installs_ok.saturating_add(1);
        self.snapshot.last_install = Some(InstallTelemetry {
            timestamp: now,
            status: "ok".to_string(),
            patch_id: Some(result.patch_id.clone()),
            version: Some(result.version.clone()),
            size: Some(result.size),
            signed: Some(result.signed),
            encrypted: Some(result.encrypted),
            error_kind: None,
            error: None,
        });
        self.persist()
    }

    pub fn record_install_failure(&mut self, version: &str, error: &PatchError) -> Result<()> {
        let now = self.touch();
        self.snapshot.installs_failed = self.snapshot.installs_failed.saturating_add(1);
        self.snapshot.last_install = Some(InstallTelemetry {
            timestamp: now,
            status: "error".to_string(),
            patch_id: None,
            version: Some(version.to_string()),
            size: None,
            signed: None,
            encrypted: None,
            error_kind: Some(error.kind().to_string()),
            error: Some(error.to_string()),
        });
        self.persist()
    }

    fn touch(&mut self) -> String {
        let now = Utc::now().to_rfc3339();
        self.snapshot.schema_version = TELEMETRY_SCHEMA_VERSION;
        self.snapshot.updated_at = now.clone();
        now
    }

    fn persist(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed creating telemetry dir {}", parent.display()))?;
        }

        let payload = serde_json::to_string_pretty(&self.snapshot)
            .context("failed encoding telemetry snapshot")?;
        let tmp_path = self.path.with_extension("tmp");

        fs::write(&tmp_path, payload).with_context(|| {
            format!(
                "failed writing temporary telemetry file {}",
                tmp_path.display()
            )
        })?;
        fs::rename(&tmp_path, &self.path).with_context(|| {
            format!(
                "failed moving telemetry snapshot {} -> {}",
                tmp_path.display(),
                self.path.display()
            )
        })?;

        Ok(())
    }
}

fn load_snapshot(path: &Path) -> Result<TelemetrySnapshot> {
    if !path.exists() {
        return Ok(TelemetrySnapshot::default());
    }

    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed reading telemetry file {}", path.display()))?;
    let mut snapshot: TelemetrySnapshot = serde_json::from_str(&raw)
        .with_context(|| format!("failed decoding telemetry file {}", path.display()))?;

    if snapshot.schema_version == 0 {
        snapshot.schema_version = TELEMETRY_SCHEMA_VERSION;
    }
    if snapshot.updated_at.trim().is_empty() {
        snapshot.updated_at = Utc::now().to_rfc3339();
    }
    Ok(snapshot)
}

#[cfg(test)]
mod tests {
    use super::TelemetryStore;
    use crate::error::PatchError;
    use crate::policy::PolicyResult;
    use crate::recovery::RecoveryOutcome;

    #[test]
    fn counters_survive_reload() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("telemetry/latest.json");
        let mut store = TelemetryStore::new(&path).expect("store");
        store
            .record_recovery(&RecoveryOutcome::HardReset {
                patch_id: "patch_1".to_string(),
                tamper_count: 3,
            })
            .expect("recovery");
        store
            .record_install_failure(
                "1.0",
                &PatchError::PolicyViolation(PolicyResult::MissingSignature),
            )
            .expect("install");

        let reloaded = TelemetryStore::new(&path).expect("reload").snapshot();
        assert_eq!(reloaded.hard_resets, 1);
        assert_eq!(reloaded.tamper_events, 1);
        assert_eq!(reloaded.installs_failed, 1);
        let last_install = reloaded.last_install.expect("install");
        assert_eq!(last_install.error_kind.as_deref(), Some("policy_violation"));
        assert_eq!(
            reloaded.last_recovery.expect("recovery").outcome,
            "hard_reset"
        );
    }
}
