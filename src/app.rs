use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, Context, Result};
use serde_json::json;
use tracing::{info, warn};

use crate::apply::{
    ApplyCallback, ApplyContext, ApplyOrchestrator, InstallRequest, InstallResult, InstallTicket,
};
use crate::audit::{AuditEvent, AuditLog, AuditVerifyReport};
use crate::bootstrap::{BootOutcome, BootState, BootstrapLoader};
use crate::config::{DoctorReport, Settings};
use crate::crypto::FileKeyStore;
use crate::error::PatchError;
use crate::host::{
    CodeInjector, InProcessInjector, LogNotifier, LoggingOverlay, OperatorNotifier,
    ResourceMerger, ResourceOverlay, ZipOverlayMerger,
};
use crate::observability;
use crate::policy::{SecurityPolicy, SecurityPolicyEngine};
use crate::recovery::{RecoveryManager, RecoveryOutcome};
use crate::storage::PatchStorage;
use crate::telemetry::TelemetryStore;
use crate::trust::{self, TrustAnchor};

const STORAGE_DIR: &str = "patch";
const STAGING_DIR: &str = "staging";
const KEY_STORE_FILE: &str = "keys/archive.key";
const AUDIT_LOG_FILE: &str = "audit.jsonl";

/// The host collaborators the lifecycle drivers call out to.
pub struct HostAdapters {
    pub injector: Arc<dyn CodeInjector>,
    pub merger: Arc<dyn ResourceMerger>,
    pub overlay: Arc<dyn ResourceOverlay>,
    pub notifier: Arc<dyn OperatorNotifier>,
}

impl Default for HostAdapters {
    fn default() -> Self {
        Self {
            injector: Arc::new(InProcessInjector::new()),
            merger: Arc::new(ZipOverlayMerger),
            overlay: Arc::new(LoggingOverlay::new()),
            notifier: Arc::new(LogNotifier),
        }
    }
}

/// Owns patch state for one process and drives its two lifecycle phases.
///
/// `bootstrap` runs with file-system access only. Everything that needs the
/// archive key (`recover`, `install`) provisions it on first use.
pub struct HotpatchRuntime {
    settings: Settings,
    storage: Arc<PatchStorage>,
    policy: Arc<SecurityPolicyEngine>,
    trust_anchor: Option<TrustAnchor>,
    host: HostAdapters,
    audit: AuditLog,
    telemetry: Arc<Mutex<TelemetryStore>>,
    keys: Option<Arc<FileKeyStore>>,
    orchestrator: Option<ApplyOrchestrator>,
}

impl HotpatchRuntime {
    pub fn new(settings: Settings) -> Result<Self> {
        Self::with_host(settings, HostAdapters::default())
    }

    pub fn with_host(settings: Settings, host: HostAdapters) -> Result<Self> {
        let storage = PatchStorage::open(settings.data_dir.join(STORAGE_DIR))
            .context("failed opening patch storage")?;
        let telemetry = TelemetryStore::new(&settings.telemetry_file)?;
        let trust_anchor = settings.parsed_trust_anchor()?;
        let policy = SecurityPolicyEngine::new(settings.initial_policy());
        let audit = AuditLog::new(settings.data_dir.join(AUDIT_LOG_FILE));

        Ok(Self {
            storage: Arc::new(storage),
            policy: Arc::new(policy),
            trust_anchor,
            host,
            audit,
            telemetry: Arc::new(Mutex::new(telemetry)),
            keys: None,
            orchestrator: None,
            settings,
        })
    }

    pub fn doctor(&self) -> DoctorReport {
        self.settings.doctor_report()
    }

    pub fn storage(&self) -> &PatchStorage {
        &self.storage
    }

    pub fn audit_log(&self) -> &AuditLog {
        &self.audit
    }

    pub fn key_store_path(&self) -> PathBuf {
        self.settings.data_dir.join(KEY_STORE_FILE)
    }

    /// Restricted-phase pass. Never fails; problems are reported in the
    /// outcome and the process continues without a patch.
    pub fn bootstrap(&mut self) -> BootOutcome {
        let outcome = BootstrapLoader::new(
            &self.storage,
            self.host.injector.as_ref(),
            self.host.merger.as_ref(),
            self.host.overlay.as_ref(),
        )
        .with_original_bundle(self.settings.original_bundle.as_deref())
        .run();

        observability::record_boot_outcome(outcome.state.label(), outcome.integrity);
        if outcome.state == BootState::Tampered {
            observability::record_tamper_event("bootstrap", outcome.tamper_count.unwrap_or(0));
        }
        self.audit.append_safe(AuditEvent {
            event: "boot",
            status: if outcome.hard_reset {
                "hard_reset"
            } else {
                outcome.state.label()
            },
            patch_id: outcome.patch_id.as_deref(),
            integrity: outcome.integrity,
            tamper_count: outcome.tamper_count,
            error_kind: outcome.error_kind,
            error: outcome.error.clone(),
            ..AuditEvent::default()
        });
        match lock_telemetry(&self.telemetry) {
            Ok(mut telemetry) => {
                if let Err(err) = telemetry.record_boot(&outcome) {
                    report_telemetry_error(&err);
                }
            }
            Err(err) => report_telemetry_error(&err),
        }
        outcome
    }

    pub fn bootstrap_json(&mut self) -> Result<String> {
        let outcome = self.bootstrap();
        serde_json::to_string_pretty(&json!({
            "status": if outcome.error.is_some() { "degraded" } else { "ok" },
            "loaded": outcome.loaded(),
            "outcome": outcome
        }))
        .context("failed to encode bootstrap outcome")
    }

    /// Full-capability recovery pass. Safe to call on every start.
    pub fn recover(&mut self) -> Result<RecoveryOutcome> {
        let keys = self.key_store()?;
        let outcome =
            RecoveryManager::new(&self.storage, keys.as_ref(), self.host.notifier.as_ref())
                .run()
                .context("recovery failed")?;

        observability::record_recovery_outcome(outcome.label());
        let (patch_id, tamper_count, error) = match &outcome {
            RecoveryOutcome::Tampered {
                patch_id,
                tamper_count,
            }
            | RecoveryOutcome::HardReset {
                patch_id,
                tamper_count,
            } => {
                observability::record_tamper_event("recovery", *tamper_count);
                (Some(patch_id.as_str()), Some(*tamper_count), None)
            }
            RecoveryOutcome::Abandoned { patch_id, reason } => {
                (Some(patch_id.as_str()), None, Some(reason.clone()))
            }
            RecoveryOutcome::Restored { patch_id } => (Some(patch_id.as_str()), None, None),
            RecoveryOutcome::NotNeeded | RecoveryOutcome::NoRecord => (None, None, None),
        };
        if outcome != RecoveryOutcome::NotNeeded {
            self.audit.append_safe(AuditEvent {
                event: "recovery",
                status: outcome.label(),
                patch_id,
                tamper_count,
                error,
                ..AuditEvent::default()
            });
        }
        lock_telemetry(&self.telemetry)?.record_recovery(&outcome)?;
        Ok(outcome)
    }

    pub fn recover_json(&mut self) -> Result<String> {
        let outcome = self.recover()?;
        serde_json::to_string_pretty(&json!({
            "status": "ok",
            "needs_restart": outcome.needs_restart(),
            "outcome": outcome
        }))
        .context("failed to encode recovery outcome")
    }

    /// Queues an install behind any already in flight. The returned ticket
    /// resolves once the worker finished or abandoned the request.
    pub fn submit_install(
        &mut self,
        source: impl AsRef<Path>,
        version: &str,
        callback: Arc<dyn ApplyCallback>,
    ) -> Result<InstallTicket> {
        let recording: Arc<dyn ApplyCallback> = Arc::new(RecordingCallback {
            inner: callback,
            audit: self.audit.clone(),
            telemetry: Arc::clone(&self.telemetry),
            version: version.to_string(),
        });
        let orchestrator = self.orchestrator()?;
        orchestrator
            .submit(InstallRequest::new(source, version), recording)
            .context("failed queueing patch install")
    }

    /// Installs synchronously. Install failures come back as a
    /// [`PatchError`] inside the returned error.
    pub fn install(
        &mut self,
        source: impl AsRef<Path>,
        version: &str,
        callback: Arc<dyn ApplyCallback>,
    ) -> Result<InstallResult> {
        let ticket = self.submit_install(source, version, callback)?;
        Ok(ticket.wait()?)
    }

    pub fn install_json(
        &mut self,
        source: impl AsRef<Path>,
        version: &str,
        callback: Arc<dyn ApplyCallback>,
    ) -> Result<String> {
        let result = self.install(source, version, callback)?;
        serde_json::to_string_pretty(&json!({
            "status": "ok",
            "result": result
        }))
        .context("failed to encode install result")
    }

    /// Operator-requested removal of every patch artifact. Does not touch
    /// the tamper escalation path.
    pub fn clear(&mut self) -> Result<()> {
        let previous = self.storage.get_applied()?;
        self.storage.clear_all().context("failed clearing patch state")?;
        info!(
            patch_id = previous.as_ref().map(|record| record.patch_id.as_str()),
            "patch state cleared by operator"
        );
        self.audit.append(AuditEvent {
            event: "clear",
            status: "ok",
            patch_id: previous.as_ref().map(|record| record.patch_id.as_str()),
            version: previous.as_ref().map(|record| record.version.as_str()),
            ..AuditEvent::default()
        })?;
        Ok(())
    }

    pub fn clear_json(&mut self) -> Result<String> {
        self.clear()?;
        serde_json::to_string_pretty(&json!({ "status": "ok", "cleared": true }))
            .context("failed to encode clear result")
    }

    pub fn policy(&self) -> SecurityPolicy {
        self.policy.policy()
    }

    /// Changes apply to installs started afterwards only.
    pub fn set_policy(
        &self,
        require_signature: Option<bool>,
        require_encryption: Option<bool>,
    ) -> SecurityPolicy {
        if let Some(value) = require_signature {
            self.policy.set_require_signature(value);
        }
        if let Some(value) = require_encryption {
            self.policy.set_require_encryption(value);
        }
        self.policy.policy()
    }

    pub fn policy_json(
        &self,
        require_signature: Option<bool>,
        require_encryption: Option<bool>,
    ) -> Result<String> {
        let policy = self.set_policy(require_signature, require_encryption);
        serde_json::to_string_pretty(&json!({ "status": "ok", "policy": policy }))
            .context("failed to encode policy")
    }

    /// On-demand host-identity check of a patch file.
    pub fn verify_host_signer(&self, path: &Path) -> Result<bool> {
        let anchor = self
            .trust_anchor
            .as_ref()
            .ok_or_else(|| anyhow!("HOTPATCH_TRUST_ANCHOR is not configured"))?;
        Ok(trust::verify_patch_signature_matches_app(path, anchor))
    }

    pub fn verify_host_signer_json(&self, path: &Path) -> Result<String> {
        let anchor = self
            .trust_anchor
            .as_ref()
            .ok_or_else(|| anyhow!("HOTPATCH_TRUST_ANCHOR is not configured"))?;
        let payload = match trust::check_patch_signer(path, anchor) {
            Ok(signer) => json!({
                "status": "ok",
                "matches": true,
                "signer": signer.fingerprint()
            }),
            Err(err) => json!({
                "status": "mismatch",
                "matches": false,
                "error_kind": err.kind(),
                "error": err.to_string()
            }),
        };
        serde_json::to_string_pretty(&payload).context("failed to encode host signer check")
    }

    pub fn audit_verify(&self) -> Result<AuditVerifyReport> {
        self.audit.verify()
    }

    pub fn audit_verify_json(&self) -> Result<String> {
        let report = self.audit_verify()?;
        serde_json::to_string_pretty(&json!({
            "status": "ok",
            "report": report
        }))
        .context("failed to encode audit verify result")
    }

    pub fn status_json(&self) -> Result<String> {
        let applied = self.storage.get_applied()?;
        let primary_present = match applied.as_ref() {
            Some(record) => self.storage.locate_primary(record)?.is_some(),
            None => false,
        };
        let archive_present = applied
            .as_ref()
            .is_some_and(|record| self.storage.has_archive_entry(&record.patch_id));
        let telemetry = lock_telemetry(&self.telemetry)?;
        let snapshot = telemetry.snapshot();
        let payload = json!({
            "applied": applied,
            "primary_present": primary_present,
            "archive_present": archive_present,
            "recovery_pending": self.storage.get_recovery_flag(),
            "policy": self.policy.policy(),
            "key_store_provisioned": self.key_store_path().exists(),
            "telemetry": {
                "file": telemetry.path().display().to_string(),
                "snapshot": snapshot
            }
        });
        serde_json::to_string_pretty(&payload).context("failed to encode status")
    }

    fn key_store(&mut self) -> Result<Arc<FileKeyStore>> {
        if let Some(keys) = self.keys.as_ref() {
            return Ok(Arc::clone(keys));
        }
        let store = FileKeyStore::new(
            self.key_store_path(),
            self.settings
                .archive_password
                .as_ref()
                .map(|value| value.as_str()),
        );
        if store.provision().context("failed provisioning archive key")? {
            eprintln!(
                "{{\"event\":\"key_store_provisioned\",\"path\":{}}}",
                serde_json::to_string(&store.path().display().to_string())
                    .unwrap_or_else(|_| "\"<encode-error>\"".to_string())
            );
        }
        let store = Arc::new(store);
        self.keys = Some(Arc::clone(&store));
        Ok(store)
    }

    fn orchestrator(&mut self) -> Result<&ApplyOrchestrator> {
        if self.orchestrator.is_none() {
            let keys = self.key_store()?;
            let context = ApplyContext {
                storage: Arc::clone(&self.storage),
                policy: Arc::clone(&self.policy),
                keys,
                trust_anchor: self.trust_anchor.clone(),
                require_host_signer: self.settings.require_host_signer,
                patch_password: self.settings.patch_password.clone(),
                staging_dir: self.settings.data_dir.join(STAGING_DIR),
            };
            let orchestrator =
                ApplyOrchestrator::start(context, self.settings.apply_queue_capacity)
                    .context("failed starting apply worker")?;
            self.orchestrator = Some(orchestrator);
        }
        self.orchestrator
            .as_ref()
            .ok_or_else(|| anyhow!("apply worker is not running"))
    }
}

/// Forwards to the caller's callback after recording the result.
struct RecordingCallback {
    inner: Arc<dyn ApplyCallback>,
    audit: AuditLog,
    telemetry: Arc<Mutex<TelemetryStore>>,
    version: String,
}

impl ApplyCallback for RecordingCallback {
    fn on_progress(&self, percent: u8, message: &str) {
        self.inner.on_progress(percent, message);
    }

    fn on_success(&self, result: &InstallResult) {
        observability::record_install("ok", None);
        self.audit.append_safe(AuditEvent {
            event: "install",
            status: "ok",
            patch_id: Some(&result.patch_id),
            version: Some(&result.version),
            content_hash: Some(&result.content_hash),
            ..AuditEvent::default()
        });
        match lock_telemetry(&self.telemetry) {
            Ok(mut telemetry) => {
                if let Err(err) = telemetry.record_install_success(result) {
                    report_telemetry_error(&err);
                }
            }
            Err(err) => report_telemetry_error(&err),
        }
        self.inner.on_success(result);
    }

    fn on_error(&self, error: &PatchError) {
        observability::record_install("error", Some(error.kind()));
        if matches!(error, PatchError::SignatureMismatchWithHost(_)) {
            warn!(error = %error, "install rejected by host signer check");
        }
        self.audit.append_safe(AuditEvent {
            event: "install",
            status: "error",
            version: Some(&self.version),
            error_kind: Some(error.kind()),
            error: Some(error.to_string()),
            ..AuditEvent::default()
        });
        match lock_telemetry(&self.telemetry) {
            Ok(mut telemetry) => {
                if let Err(err) = telemetry.record_install_failure(&self.version, error) {
                    report_telemetry_error(&err);
                }
            }
            Err(err) => report_telemetry_error(&err),
        }
        self.inner.on_error(error);
    }
}

fn lock_telemetry(telemetry: &Mutex<TelemetryStore>) -> Result<MutexGuard<'_, TelemetryStore>> {
    telemetry
        .lock()
        .map_err(|_| anyhow!("telemetry store lock poisoned"))
}

fn report_telemetry_error(err: &anyhow::Error) {
    eprintln!(
        "{{\"event\":\"telemetry_error\",\"message\":{}}}",
        serde_json::to_string(&err.to_string())
            .unwrap_or_else(|_| "\"<encode-error>\"".to_string())
    );
}
