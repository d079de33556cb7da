use std::fmt;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use tracing::info;

/// Operator-controlled install requirements.
///
/// Read at install time only; changing a flag never re-judges a patch that
/// is already applied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityPolicy {
    pub require_signature: bool,
    pub require_encryption: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyResult {
    Ok,
    MissingSignature,
    MissingEncryption,
}

impl PolicyResult {
    pub fn is_ok(self) -> bool {
        matches!(self, Self::Ok)
    }
}

impl fmt::Display for PolicyResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => f.write_str("ok"),
            Self::MissingSignature => f.write_str("patch is not signed but a signature is required"),
            Self::MissingEncryption => {
                f.write_str("patch is not encrypted but encryption is required")
            }
        }
    }
}

/// Observed properties of a staged patch, as judged by the verifier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PatchProperties {
    /// Every content entry carries a valid, consistent signature.
    pub signed: bool,
    /// Payload-level AEAD envelope or archive-level password protection.
    pub encrypted: bool,
}

#[derive(Debug, Default)]
pub struct SecurityPolicyEngine {
    policy: RwLock<SecurityPolicy>,
}

impl SecurityPolicyEngine {
    pub fn new(policy: SecurityPolicy) -> Self {
        Self {
            policy: RwLock::new(policy),
        }
    }

    pub fn policy(&self) -> SecurityPolicy {
        *self
            .policy
            .read()
            .unwrap_or_else(|poison| poison.into_inner())
    }

    pub fn set_policy(&self, policy: SecurityPolicy) {
        let mut guard = self
            .policy
            .write()
            .unwrap_or_else(|poison| poison.into_inner());
        if *guard != policy {
            info!(
                require_signature = policy.require_signature,
                require_encryption = policy.require_encryption,
                "security policy updated"
            );
        }
        *guard = policy;
    }

    pub fn set_require_signature(&self, value: bool) {
        let mut policy = self.policy();
        policy.require_signature = value;
        self.set_policy(policy);
    }

    pub fn set_require_encryption(&self, value: bool) {
        let mut policy = self.policy();
        policy.require_encryption = value;
        self.set_policy(policy);
    }

    /// Signature is judged before encryption so an unsigned patch always
    /// reports `MissingSignature` first.
    pub fn evaluate(&self, properties: &PatchProperties) -> PolicyResult {
        let policy = self.policy();
        if policy.require_signature && !properties.signed {
            return PolicyResult::MissingSignature;
        }
        if policy.require_encryption && !properties.encrypted {
            return PolicyResult::MissingEncryption;
        }
        PolicyResult::Ok
    }
}

#[cfg(test)]
mod tests {
    use super::{PatchProperties, PolicyResult, SecurityPolicy, SecurityPolicyEngine};

    #[test]
    fn default_policy_accepts_everything() {
        let engine = SecurityPolicyEngine::default();
        assert_eq!(
            engine.evaluate(&PatchProperties::default()),
            PolicyResult::Ok
        );
    }

    #[test]
    fn signature_requirement_is_reported_before_encryption() {
        let engine = SecurityPolicyEngine::new(SecurityPolicy {
            require_signature: true,
            require_encryption: true,
        });
        assert_eq!(
            engine.evaluate(&PatchProperties::default()),
            PolicyResult::MissingSignature
        );
        assert_eq!(
            engine.evaluate(&PatchProperties {
                signed: true,
                encrypted: false,
            }),
            PolicyResult::MissingEncryption
        );
        assert!(engine
            .evaluate(&PatchProperties {
                signed: true,
                encrypted: true,
            })
            .is_ok());
    }

    #[test]
    fn setters_change_later_evaluations_only() {
        let engine = SecurityPolicyEngine::default();
        let unsigned = PatchProperties::default();
        assert!(engine.evaluate(&unsigned).is_ok());

        engine.set_require_signature(true);
        assert_eq!(engine.evaluate(&unsigned), PolicyResult::MissingSignature);

        engine.set_require_signature(false);
        engine.set_require_encryption(true);
        assert_eq!(engine.evaluate(&unsigned), PolicyResult::MissingEncryption);
        assert!(engine.policy().require_encryption);
    }
}
