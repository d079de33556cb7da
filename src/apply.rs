//! Install path: a single worker thread that verifies, checks policy,
//! seals the recovery backup and commits each staged patch in submission
//! order.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, error, info, info_span, warn};
use zeroize::Zeroizing;

use crate::crypto::{self, KeyMaterial};
use crate::error::PatchError;
use crate::kv;
use crate::policy::{PatchProperties, SecurityPolicyEngine};
use crate::storage::{PatchRecord, PatchStorage};
use crate::trust::{self, TrustAnchor};
use crate::verifier::{self, ContentKind};

pub const DEFAULT_QUEUE_CAPACITY: usize = 16;

#[derive(Debug, Clone)]
pub struct InstallRequest {
    pub source: PathBuf,
    pub version: String,
}

impl InstallRequest {
    pub fn new(source: impl AsRef<Path>, version: impl Into<String>) -> Self {
        Self {
            source: source.as_ref().to_path_buf(),
            version: version.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstallResult {
    pub patch_id: String,
    pub version: String,
    pub size: u64,
    pub needs_restart: bool,
    pub content_hash: String,
    pub signed: bool,
    pub encrypted: bool,
    pub signer: Option<String>,
}

/// Caller-facing progress and completion hooks. Invoked on the worker
/// thread.
pub trait ApplyCallback: Send + Sync {
    fn on_progress(&self, percent: u8, message: &str);
    fn on_success(&self, result: &InstallResult);
    fn on_error(&self, error: &PatchError);
}

/// Callback that ignores everything; useful when only the ticket matters.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCallback;

impl ApplyCallback for NoopCallback {
    fn on_progress(&self, _percent: u8, _message: &str) {}
    fn on_success(&self, _result: &InstallResult) {}
    fn on_error(&self, _error: &PatchError) {}
}

/// Everything the worker needs to judge and commit a patch.
pub struct ApplyContext {
    pub storage: Arc<PatchStorage>,
    pub policy: Arc<SecurityPolicyEngine>,
    pub keys: Arc<dyn KeyMaterial>,
    pub trust_anchor: Option<TrustAnchor>,
    pub require_host_signer: bool,
    pub patch_password: Option<Zeroizing<String>>,
    pub staging_dir: PathBuf,
}

struct InstallJob {
    request: InstallRequest,
    callback: Arc<dyn ApplyCallback>,
    cancelled: Arc<AtomicBool>,
    reply: mpsc::Sender<Result<InstallResult, PatchError>>,
}

/// Handle to one queued install.
pub struct InstallTicket {
    cancelled: Arc<AtomicBool>,
    reply: Receiver<Result<InstallResult, PatchError>>,
}

impl InstallTicket {
    /// Abandons the install if it has not reached the commit step yet.
    /// Once commit starts the install runs to completion.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn wait(self) -> Result<InstallResult, PatchError> {
        self.reply.recv().unwrap_or(Err(PatchError::Cancelled))
    }
}

pub struct ApplyOrchestrator {
    sender: Option<SyncSender<InstallJob>>,
    worker: Option<JoinHandle<()>>,
}

impl ApplyOrchestrator {
    pub fn start(context: ApplyContext, capacity: usize) -> Result<Self, PatchError> {
        let (sender, receiver) = mpsc::sync_channel::<InstallJob>(capacity.max(1));
        let staging_dir = context.staging_dir.clone();
        let worker = thread::Builder::new()
            .name("hotpatch-apply".to_string())
            .spawn(move || run_worker(context, receiver))
            .map_err(|err| PatchError::io(&staging_dir, err))?;
        Ok(Self {
            sender: Some(sender),
            worker: Some(worker),
        })
    }

    /// Queues an install behind any in flight. Blocks while the queue is
    /// full rather than rejecting.
    pub fn submit(
        &self,
        request: InstallRequest,
        callback: Arc<dyn ApplyCallback>,
    ) -> Result<InstallTicket, PatchError> {
        let cancelled = Arc::new(AtomicBool::new(false));
        let (reply, receiver) = mpsc::channel();
        let job = InstallJob {
            request,
            callback,
            cancelled: Arc::clone(&cancelled),
            reply,
        };
        let Some(sender) = self.sender.as_ref() else {
            return Err(PatchError::Cancelled);
        };
        sender.send(job).map_err(|_| PatchError::Cancelled)?;
        Ok(InstallTicket {
            cancelled,
            reply: receiver,
        })
    }
}

impl Drop for ApplyOrchestrator {
    fn drop(&mut self) {
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                eprintln!("{{\"event\":\"apply_worker_join_error\"}}");
            }
        }
    }
}

fn run_worker(context: ApplyContext, receiver: Receiver<InstallJob>) {
    let ids = PatchIdGenerator::default();
    for job in receiver {
        let span = info_span!("install", source = %job.request.source.display());
        let _entered = span.enter();
        let mut progress = Progress::new(job.callback.as_ref());
        let result = install(&context, &ids, &job, &mut progress);
        match &result {
            Ok(installed) => {
                progress.report(100, "installed");
                job.callback.on_success(installed);
            }
            Err(err) => {
                error!(error_kind = err.kind(), error = %err, "install failed");
                job.callback.on_error(err);
            }
        }
        if job.reply.send(result).is_err() {
            debug!("install ticket dropped before completion");
        }
    }
    debug!("apply worker stopped");
}

fn install(
    context: &ApplyContext,
    ids: &PatchIdGenerator,
    job: &InstallJob,
    progress: &mut Progress<'_>,
) -> Result<InstallResult, PatchError> {
    let check_cancelled = || {
        if job.cancelled.load(Ordering::SeqCst) {
            Err(PatchError::Cancelled)
        } else {
            Ok(())
        }
    };
    check_cancelled()?;

    let request = &job.request;
    let patch_id = ids.next();
    progress.report(5, "staging patch");
    let raw = fs::read(&request.source).map_err(|err| PatchError::io(&request.source, err))?;

    let payload_encrypted = crypto::is_encrypted_payload(&request.source)?;
    let payload: Zeroizing<Vec<u8>> = if payload_encrypted {
        let password = context.patch_password.as_ref().ok_or_else(|| {
            PatchError::DecryptFailure(
                "patch is password protected but no patch password is configured".to_string(),
            )
        })?;
        progress.report(10, "decrypting patch payload");
        crypto::open_payload(password, &raw)?
    } else {
        Zeroizing::new(raw)
    };

    let staged = StagedFile::write(&context.staging_dir, &patch_id, &payload)?;
    check_cancelled()?;

    progress.report(20, "hashing patch");
    let content_hash = verifier::compute_content_hash(staged.path())?;
    let kind = ContentKind::sniff(staged.path())?;
    let archive_encrypted =
        kind == ContentKind::Archive && verifier::is_archive_password_protected(staged.path())?;

    progress.report(35, "checking signature");
    let signer = match kind {
        ContentKind::Archive if verifier::has_signature_blocks(staged.path())? => {
            Some(verifier::inspect_signed_archive(staged.path())?)
        }
        _ => None,
    };
    let properties = PatchProperties {
        signed: signer.is_some(),
        encrypted: payload_encrypted || archive_encrypted,
    };

    progress.report(50, "evaluating security policy");
    let verdict = context.policy.evaluate(&properties);
    if !verdict.is_ok() {
        return Err(PatchError::PolicyViolation(verdict));
    }
    if archive_encrypted {
        return Err(PatchError::Archive(
            "password-protected archive entries cannot be loaded directly".to_string(),
        ));
    }
    if context.require_host_signer {
        let anchor = context.trust_anchor.as_ref().ok_or_else(|| {
            PatchError::SignatureMismatchWithHost("no host signing identity configured".to_string())
        })?;
        trust::check_patch_signer(staged.path(), anchor)?;
    }
    check_cancelled()?;

    progress.report(65, "sealing recovery backup");
    let key = context.keys.archive_key()?;
    let sealed = crypto::seal_backup(&key, &patch_id, &payload)?;
    check_cancelled()?;

    // Past this point the install is no longer cancellable.
    progress.report(80, "committing patch");
    let mut record = PatchRecord::new(&patch_id, request.version.as_str(), content_hash.clone());
    record.applied_at = Some(Utc::now().to_rfc3339());
    context.storage.commit(&record, &payload, &sealed)?;

    let result = InstallResult {
        patch_id,
        version: request.version.clone(),
        size: payload.len() as u64,
        needs_restart: true,
        content_hash: content_hash.to_string(),
        signed: properties.signed,
        encrypted: properties.encrypted,
        signer: signer.map(|certificate| certificate.fingerprint()),
    };
    info!(
        patch_id = %result.patch_id,
        version = %result.version,
        size = result.size,
        signed = result.signed,
        encrypted = result.encrypted,
        "patch installed"
    );
    Ok(result)
}

/// Progress reporter that never goes backwards.
struct Progress<'a> {
    callback: &'a dyn ApplyCallback,
    last: u8,
}

impl<'a> Progress<'a> {
    fn new(callback: &'a dyn ApplyCallback) -> Self {
        Self { callback, last: 0 }
    }

    fn report(&mut self, percent: u8, message: &str) {
        let percent = percent.min(100).max(self.last);
        self.last = percent;
        debug!(percent, message, "install progress");
        self.callback.on_progress(percent, message);
    }
}

/// `patch_<millis>`, strictly increasing within the process.
#[derive(Default)]
struct PatchIdGenerator {
    last: AtomicI64,
}

impl PatchIdGenerator {
    fn next(&self) -> String {
        let now = Utc::now().timestamp_millis();
        let mut previous = self.last.load(Ordering::SeqCst);
        loop {
            let candidate = now.max(previous + 1);
            match self.last.compare_exchange(
                previous,
                candidate,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return format!("patch_{}", candidate),
                Err(actual) => previous = actual,
            }
        }
    }
}

/// Plaintext copy of the payload used for inspection; removed on drop.
struct StagedFile {
    path: PathBuf,
}

impl StagedFile {
    fn write(dir: &Path, patch_id: &str, data: &[u8]) -> Result<Self, PatchError> {
        let path = dir.join(format!("{}.staged", patch_id));
        kv::write_atomic(&path, data)?;
        Ok(Self { path })
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %err, "failed removing staged patch");
            }
        }
    }
}
