use std::fs;
use std::sync::Mutex;

use ed25519_dalek::SigningKey;

use hotpatch_guard::app::HotpatchRuntime;
use hotpatch_guard::config::Settings;
use hotpatch_guard::signer::{sign_archive, write_archive};
use hotpatch_guard::verifier::Certificate;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn reset_hotpatch_env() {
    for key in [
        "HOTPATCH_DATA_DIR",
        "HOTPATCH_TELEMETRY_FILE",
        "HOTPATCH_REQUIRE_SIGNATURE",
        "HOTPATCH_REQUIRE_ENCRYPTION",
        "HOTPATCH_REQUIRE_HOST_SIGNER",
        "HOTPATCH_TRUST_ANCHOR",
        "HOTPATCH_PATCH_PASSWORD",
        "HOTPATCH_ARCHIVE_PASSWORD",
        "HOTPATCH_ORIGINAL_BUNDLE",
        "HOTPATCH_APPLY_QUEUE_CAPACITY",
        "HOTPATCH_ENV_FILE",
    ] {
        std::env::remove_var(key);
    }
}

fn load_with_env(temp: &tempfile::TempDir, contents: &str) -> Settings {
    fs::write(temp.path().join(".env"), contents).expect("write env");
    std::env::set_var(
        "HOTPATCH_ENV_FILE",
        temp.path().join(".env").display().to_string(),
    );
    Settings::load().expect("load settings")
}

fn host_key_hex(seed: u8) -> String {
    Certificate::from_verifying_key(None, &SigningKey::from_bytes(&[seed; 32]).verifying_key())
        .public_key_hex()
}

#[test]
fn defaults_follow_data_dir() {
    let _guard = ENV_LOCK.lock().expect("lock env");
    reset_hotpatch_env();
    let temp = tempfile::tempdir().expect("tempdir");
    let data_dir = temp.path().join("state");
    let settings = load_with_env(&temp, &format!("HOTPATCH_DATA_DIR={}\n", data_dir.display()));

    assert_eq!(settings.data_dir, data_dir);
    assert_eq!(settings.telemetry_file, data_dir.join("telemetry/latest.json"));
    assert!(!settings.require_signature);
    assert!(!settings.require_encryption);
    assert_eq!(settings.apply_queue_capacity, 16);
    assert!(settings.doctor_report().warnings.is_empty());
}

#[test]
fn doctor_flags_inconsistent_trust_settings() {
    let _guard = ENV_LOCK.lock().expect("lock env");
    reset_hotpatch_env();
    let temp = tempfile::tempdir().expect("tempdir");
    let settings = load_with_env(
        &temp,
        &format!(
            "HOTPATCH_DATA_DIR={}\nHOTPATCH_REQUIRE_HOST_SIGNER=true\nHOTPATCH_REQUIRE_ENCRYPTION=true\nHOTPATCH_APPLY_QUEUE_CAPACITY=0\n",
            temp.path().join("data").display()
        ),
    );
    assert_eq!(settings.apply_queue_capacity, 1);

    let report = settings.doctor_report();
    assert!(report
        .warnings
        .iter()
        .any(|warning| warning.contains("HOTPATCH_TRUST_ANCHOR is missing")));
    assert!(report
        .warnings
        .iter()
        .any(|warning| warning.contains("HOTPATCH_PATCH_PASSWORD is missing")));
}

#[test]
fn doctor_explains_host_signer_without_signature_requirement() {
    let _guard = ENV_LOCK.lock().expect("lock env");
    reset_hotpatch_env();
    let temp = tempfile::tempdir().expect("tempdir");
    let settings = load_with_env(
        &temp,
        &format!(
            "HOTPATCH_DATA_DIR={}\nHOTPATCH_REQUIRE_HOST_SIGNER=true\nHOTPATCH_TRUST_ANCHOR={}\n",
            temp.path().join("data").display(),
            host_key_hex(7)
        ),
    );
    let report = settings.doctor_report();
    let warning = report
        .warnings
        .iter()
        .find(|warning| warning.contains("HOTPATCH_REQUIRE_SIGNATURE=false"))
        .expect("host signer warning");
    assert!(warning.contains("pass the policy check"));
    assert!(warning.contains("signature_invalid"));
    assert!(!warning.contains("policy violations"));

    let unsigned = temp.path().join("unsigned.zip");
    write_archive(
        &unsigned,
        &[("classes.dex".to_string(), b"dex\n035\0code".to_vec())],
    )
    .expect("archive");
    let mut runtime = HotpatchRuntime::new(settings).expect("runtime");
    let err = runtime
        .install(
            &unsigned,
            "1.0.0",
            std::sync::Arc::new(hotpatch_guard::apply::NoopCallback),
        )
        .expect_err("unsigned rejected by host-signer check");
    assert!(matches!(
        err.downcast_ref::<hotpatch_guard::error::PatchError>(),
        Some(hotpatch_guard::error::PatchError::SignatureInvalid(_))
    ));
}

#[test]
fn doctor_flags_multi_signer_anchor() {
    let _guard = ENV_LOCK.lock().expect("lock env");
    reset_hotpatch_env();
    let temp = tempfile::tempdir().expect("tempdir");
    let settings = load_with_env(
        &temp,
        &format!(
            "HOTPATCH_DATA_DIR={}\nHOTPATCH_TRUST_ANCHOR={},{}\n",
            temp.path().join("data").display(),
            host_key_hex(1),
            host_key_hex(2)
        ),
    );
    let report = settings.doctor_report();
    assert_eq!(report.trust_anchor_count, 2);
    assert!(report
        .warnings
        .iter()
        .any(|warning| warning.contains("multi-signer")));
}

#[test]
fn host_signer_requirement_gates_installs() {
    let _guard = ENV_LOCK.lock().expect("lock env");
    reset_hotpatch_env();
    let temp = tempfile::tempdir().expect("tempdir");
    let settings = load_with_env(
        &temp,
        &format!(
            "HOTPATCH_DATA_DIR={}\nHOTPATCH_REQUIRE_SIGNATURE=true\nHOTPATCH_REQUIRE_HOST_SIGNER=true\nHOTPATCH_TRUST_ANCHOR={}\n",
            temp.path().join("data").display(),
            host_key_hex(7)
        ),
    );
    let unsigned = temp.path().join("unsigned.zip");
    write_archive(
        &unsigned,
        &[("classes.dex".to_string(), b"dex\n035\0code".to_vec())],
    )
    .expect("archive");
    let by_host = temp.path().join("host.zip");
    let by_stranger = temp.path().join("stranger.zip");
    sign_archive(
        &unsigned,
        &by_host,
        &SigningKey::from_bytes(&[7u8; 32]),
        "HOST",
        None,
    )
    .expect("sign");
    sign_archive(
        &unsigned,
        &by_stranger,
        &SigningKey::from_bytes(&[8u8; 32]),
        "OTHER",
        None,
    )
    .expect("sign");

    let mut runtime = HotpatchRuntime::new(settings).expect("runtime");
    assert!(runtime.verify_host_signer(&by_host).expect("check"));
    assert!(!runtime.verify_host_signer(&by_stranger).expect("check"));

    let err = runtime
        .install(
            &by_stranger,
            "1.0.0",
            std::sync::Arc::new(hotpatch_guard::apply::NoopCallback),
        )
        .expect_err("foreign signer rejected");
    assert!(matches!(
        err.downcast_ref::<hotpatch_guard::error::PatchError>(),
        Some(hotpatch_guard::error::PatchError::SignatureMismatchWithHost(_))
    ));
    assert!(runtime.storage().get_applied().expect("read").is_none());

    let result = runtime
        .install(
            &by_host,
            "1.0.0",
            std::sync::Arc::new(hotpatch_guard::apply::NoopCallback),
        )
        .expect("host-signed install");
    assert!(result.signed);
    assert!(result.signer.is_some());
}
