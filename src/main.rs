use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose, Engine as _};
use clap::{Parser, Subcommand};
use zeroize::Zeroizing;

use hotpatch_guard::app::HotpatchRuntime;
use hotpatch_guard::apply::{ApplyCallback, InstallResult};
use hotpatch_guard::config::Settings;
use hotpatch_guard::crypto;
use hotpatch_guard::error::PatchError;
use hotpatch_guard::observability::ObservabilityGuard;
use hotpatch_guard::signer;
use hotpatch_guard::verifier::Certificate;

#[derive(Parser, Debug)]
#[command(name = "hotpatch-guard")]
#[command(about = "Patch integrity, trust and recovery", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate runtime config.
    Doctor,
    /// Show the applied patch record, policy and last outcomes.
    Status,
    /// Remove the applied patch and every stored copy.
    Clear,
    /// Show or change install policy for this process.
    Policy {
        #[arg(long)]
        require_signature: Option<bool>,
        #[arg(long)]
        require_encryption: Option<bool>,
    },
    /// Check that a patch is signed by the host's own signing key.
    VerifyHostSigner { file: PathBuf },
    /// Run the restricted-phase loader once.
    Boot,
    /// Run encrypted-archive recovery once.
    Recover,
    /// Install a patch through the apply queue.
    Apply {
        file: PathBuf,
        #[arg(long)]
        version: String,
    },
    /// Sign every content entry of a patch archive.
    Sign {
        input: PathBuf,
        output: PathBuf,
        /// File holding a hex or base64 Ed25519 seed.
        #[arg(long)]
        key_file: PathBuf,
        #[arg(long, default_value = "HOTPATCH")]
        alias: String,
        #[arg(long)]
        subject: Option<String>,
    },
    /// Generate an Ed25519 signing seed.
    Keygen {
        #[arg(long)]
        out: PathBuf,
    },
    /// Wrap a patch in a password-protected envelope (HOTPATCH_PATCH_PASSWORD).
    Encrypt { input: PathBuf, output: PathBuf },
    /// Audit trail commands.
    Audit {
        #[command(subcommand)]
        command: AuditCommands,
    },
}

#[derive(Subcommand, Debug)]
enum AuditCommands {
    /// Replay the hash chain of the audit log.
    Verify,
}

struct ProgressPrinter;

impl ApplyCallback for ProgressPrinter {
    fn on_progress(&self, percent: u8, message: &str) {
        eprintln!(
            "{{\"event\":\"install_progress\",\"percent\":{},\"message\":{}}}",
            percent,
            serde_json::to_string(message).unwrap_or_else(|_| "\"<encode-error>\"".to_string())
        );
    }

    fn on_success(&self, result: &InstallResult) {
        eprintln!(
            "{{\"event\":\"install_complete\",\"patch_id\":{},\"needs_restart\":{}}}",
            serde_json::to_string(&result.patch_id)
                .unwrap_or_else(|_| "\"<encode-error>\"".to_string()),
            result.needs_restart
        );
    }

    fn on_error(&self, error: &PatchError) {
        eprintln!(
            "{{\"event\":\"install_error\",\"error_kind\":\"{}\",\"message\":{}}}",
            error.kind(),
            serde_json::to_string(&error.to_string())
                .unwrap_or_else(|_| "\"<encode-error>\"".to_string())
        );
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load()?;
    let _observability = ObservabilityGuard::init();

    let command = cli.command.unwrap_or(Commands::Doctor);
    match command {
        Commands::Sign {
            input,
            output,
            key_file,
            alias,
            subject,
        } => {
            let raw = Zeroizing::new(
                fs::read_to_string(&key_file)
                    .with_context(|| format!("failed reading {}", key_file.display()))?,
            );
            let signing_key = signer::parse_signing_key(&raw)?;
            let certificate =
                signer::sign_archive(&input, &output, &signing_key, &alias, subject.as_deref())?;
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "status": "ok",
                    "output": output.display().to_string(),
                    "signer": certificate.fingerprint(),
                    "public_key": certificate.public_key_hex()
                }))
                .context("failed to encode sign result")?
            );
            return Ok(());
        }
        Commands::Keygen { out } => {
            if out.exists() {
                return Err(anyhow!("refusing to overwrite {}", out.display()));
            }
            let signing_key = signer::generate_signing_key();
            let seed = Zeroizing::new(general_purpose::STANDARD.encode(signing_key.to_bytes()));
            if let Some(parent) = out.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)
                    .with_context(|| format!("failed creating {}", parent.display()))?;
            }
            fs::write(&out, seed.as_bytes())
                .with_context(|| format!("failed writing {}", out.display()))?;
            let certificate = Certificate::from_verifying_key(None, &signing_key.verifying_key());
            println!("seed_file: {}", out.display());
            println!("public_key: {}", certificate.public_key_hex());
            println!("fingerprint: {}", certificate.fingerprint());
            return Ok(());
        }
        Commands::Encrypt { input, output } => {
            let password = settings
                .patch_password
                .as_ref()
                .ok_or_else(|| anyhow!("HOTPATCH_PATCH_PASSWORD is required to encrypt"))?;
            let plaintext = Zeroizing::new(
                fs::read(&input).with_context(|| format!("failed reading {}", input.display()))?,
            );
            let sealed = crypto::seal_payload(password, &plaintext)?;
            fs::write(&output, sealed)
                .with_context(|| format!("failed writing {}", output.display()))?;
            println!("encrypted: {}", output.display());
            return Ok(());
        }
        _ => {}
    }

    let mut runtime = HotpatchRuntime::new(settings)?;
    match command {
        Commands::Doctor => {
            let report = runtime.doctor();
            println!("Hotpatch Guard Doctor");
            println!("data_dir: {}", report.data_dir.display());
            println!("telemetry_file: {}", report.telemetry_file.display());
            println!("require_signature: {}", report.require_signature);
            println!("require_encryption: {}", report.require_encryption);
            println!("require_host_signer: {}", report.require_host_signer);
            println!("trust_anchor_count: {}", report.trust_anchor_count);
            println!("patch_password_loaded: {}", report.patch_password_loaded);
            println!("archive_password_loaded: {}", report.archive_password_loaded);
            println!(
                "original_bundle: {}",
                report
                    .original_bundle
                    .map(|path| path.display().to_string())
                    .unwrap_or_else(|| "<unset>".to_string())
            );
            println!("apply_queue_capacity: {}", report.apply_queue_capacity);
            if report.warnings.is_empty() {
                println!("status: ok");
            } else {
                println!("status: warning");
                for warning in report.warnings {
                    println!("- {}", warning);
                }
            }
        }
        Commands::Status => println!("{}", runtime.status_json()?),
        Commands::Clear => println!("{}", runtime.clear_json()?),
        Commands::Policy {
            require_signature,
            require_encryption,
        } => println!(
            "{}",
            runtime.policy_json(require_signature, require_encryption)?
        ),
        Commands::VerifyHostSigner { file } => {
            println!("{}", runtime.verify_host_signer_json(&file)?)
        }
        Commands::Boot => println!("{}", runtime.bootstrap_json()?),
        Commands::Recover => println!("{}", runtime.recover_json()?),
        Commands::Apply { file, version } => {
            println!(
                "{}",
                runtime.install_json(&file, &version, Arc::new(ProgressPrinter))?
            );
        }
        Commands::Audit { command } => match command {
            AuditCommands::Verify => println!("{}", runtime.audit_verify_json()?),
        },
        Commands::Sign { .. } | Commands::Keygen { .. } | Commands::Encrypt { .. } => {}
    }

    Ok(())
}
