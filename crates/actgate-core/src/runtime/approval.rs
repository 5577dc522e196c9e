//! Signed human-approval tokens bound to one action and one session state.
//!
//! A token is `v1.` followed by base64url(JCS(envelope)). The envelope's
//! claims are signed with ed25519 over the DSSE pre-authentication encoding:
//!
//! ```text
//! PAE(type, claims) = "DSSEv1" SP LEN(type) SP type SP LEN(claims) SP JCS(claims)
//! ```
//!
//! `action_hash` covers the action's name and arguments; `context_hash`
//! covers the session's live facts and budget snapshot. Replaying a token
//! against another action, or after the session moved on, fails.

use crate::action::Action;
use crate::errors::{ApprovalFailure, ConfigurationError, GuardError};
use crate::jcs;
use crate::runtime::budget::BudgetSnapshot;
use anyhow::{Context, Result};
use base64::{
    engine::general_purpose::{STANDARD as BASE64, URL_SAFE_NO_PAD as BASE64URL},
    Engine,
};
use chrono::{DateTime, Duration, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// Payload type for approval claims (DSSE-style binding).
pub const PAYLOAD_TYPE_APPROVAL_V1: &str = "application/vnd.actgate.approval+json;v=1";

pub const TOKEN_VERSION: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignatureAlgorithm {
    Ed25519,
}

/// What the approver signed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalClaims {
    pub action_hash: String,
    pub context_hash: String,
    pub approver_id: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalToken {
    pub version: u8,
    pub algorithm: SignatureAlgorithm,
    #[serde(flatten)]
    pub claims: ApprovalClaims,
    /// `sha256:` of the approver's SPKI public key.
    pub key_id: String,
    /// Base64 ed25519 signature over the PAE of the claims.
    pub signature: String,
}

impl ApprovalToken {
    pub fn encode(&self) -> Result<String> {
        let bytes = jcs::to_vec(self)?;
        Ok(format!("v{}.{}", self.version, BASE64URL.encode(bytes)))
    }

    pub fn decode(token: &str) -> Result<Self, ApprovalFailure> {
        let malformed = |detail: String| ApprovalFailure::Malformed { detail };

        let (prefix, body) = token
            .trim()
            .split_once('.')
            .ok_or_else(|| malformed("missing version prefix".to_string()))?;
        let version: u8 = prefix
            .strip_prefix('v')
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| malformed(format!("bad version prefix '{}'", prefix)))?;
        if version != TOKEN_VERSION {
            return Err(ApprovalFailure::UnsupportedVersion { version });
        }

        let bytes = BASE64URL
            .decode(body)
            .map_err(|e| malformed(format!("invalid base64: {}", e)))?;
        let parsed: ApprovalToken =
            serde_json::from_slice(&bytes).map_err(|e| malformed(e.to_string()))?;
        if parsed.version != version {
            return Err(ApprovalFailure::UnsupportedVersion {
                version: parsed.version,
            });
        }
        Ok(parsed)
    }
}

/// Session state an approval is bound to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalContext {
    pub session_id: String,
    /// Live `(kind, value)` pairs, sorted.
    pub facts: Vec<(String, String)>,
    pub budget: Option<BudgetSnapshot>,
}

impl ApprovalContext {
    pub fn context_hash(&self) -> Result<String> {
        jcs::canonical_digest(self)
    }
}

/// Compute key_id from a verifying key: `sha256:<hex>` of its SPKI DER.
pub fn compute_key_id(key: &VerifyingKey) -> Result<String> {
    use pkcs8::EncodePublicKey;
    let doc = key
        .to_public_key_der()
        .context("failed to encode public key as SPKI DER")?;
    Ok(format!("sha256:{}", hex::encode(Sha256::digest(doc.as_bytes()))))
}

fn build_pae(payload_type: &str, payload: &[u8]) -> Vec<u8> {
    let mut pae = Vec::with_capacity(payload.len() + payload_type.len() + 32);
    pae.extend_from_slice(b"DSSEv1 ");
    pae.extend_from_slice(payload_type.len().to_string().as_bytes());
    pae.push(b' ');
    pae.extend_from_slice(payload_type.as_bytes());
    pae.push(b' ');
    pae.extend_from_slice(payload.len().to_string().as_bytes());
    pae.push(b' ');
    pae.extend_from_slice(payload);
    pae
}

/// Signs approvals. Lives on the human-approval service side.
pub struct ApprovalIssuer {
    approver_id: String,
    signing_key: SigningKey,
}

impl std::fmt::Debug for ApprovalIssuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApprovalIssuer")
            .field("approver_id", &self.approver_id)
            .finish_non_exhaustive()
    }
}

impl ApprovalIssuer {
    pub fn new(approver_id: impl Into<String>, signing_key: SigningKey) -> Self {
        Self {
            approver_id: approver_id.into(),
            signing_key,
        }
    }

    /// Fresh random key, mostly for tests and local setups.
    pub fn generate(approver_id: impl Into<String>) -> Self {
        Self::new(approver_id, SigningKey::generate(&mut rand::thread_rng()))
    }

    pub fn approver_id(&self) -> &str {
        &self.approver_id
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn public_key_pem(&self) -> Result<String> {
        use pkcs8::{EncodePublicKey, LineEnding};
        self.verifying_key()
            .to_public_key_pem(LineEnding::LF)
            .context("failed to encode public key as PEM")
    }

    /// Sign claims for the given hashes, valid for `ttl` from `issued_at`.
    pub fn issue(
        &self,
        action_hash: &str,
        context_hash: &str,
        issued_at: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<ApprovalToken> {
        let claims = ApprovalClaims {
            action_hash: action_hash.to_string(),
            context_hash: context_hash.to_string(),
            approver_id: self.approver_id.clone(),
            issued_at,
            expires_at: issued_at
                .checked_add_signed(ttl)
                .context("approval ttl out of range")?,
        };
        let canonical = jcs::to_vec(&claims)?;
        let signature: Signature = self
            .signing_key
            .sign(&build_pae(PAYLOAD_TYPE_APPROVAL_V1, &canonical));

        Ok(ApprovalToken {
            version: TOKEN_VERSION,
            algorithm: SignatureAlgorithm::Ed25519,
            claims,
            key_id: compute_key_id(&self.verifying_key())?,
            signature: BASE64.encode(signature.to_bytes()),
        })
    }

    /// Encoded token approving `action` in the state captured by `context`.
    pub fn issue_for(
        &self,
        action: &Action,
        context: &ApprovalContext,
        ttl: Duration,
    ) -> Result<String> {
        self.issue_for_at(Utc::now(), action, context, ttl)
    }

    pub fn issue_for_at(
        &self,
        now: DateTime<Utc>,
        action: &Action,
        context: &ApprovalContext,
        ttl: Duration,
    ) -> Result<String> {
        self.issue(&action.action_hash()?, &context.context_hash()?, now, ttl)?
            .encode()
    }
}

#[derive(Debug, Clone)]
struct TrustedApprover {
    key: VerifyingKey,
    key_id: String,
}

/// Result of successful verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedApproval {
    pub approver_id: String,
    pub key_id: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Verifies approval tokens against a fixed set of trusted approvers.
#[derive(Debug, Clone, Default)]
pub struct ApprovalVerifier {
    approvers: HashMap<String, TrustedApprover>,
    clock_skew: Duration,
}

impl ApprovalVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tolerance applied to `issued_at` / `expires_at`.
    pub fn with_clock_skew(mut self, skew: Duration) -> Self {
        self.clock_skew = skew;
        self
    }

    pub fn trust(
        &mut self,
        approver_id: impl Into<String>,
        key: VerifyingKey,
    ) -> Result<(), ConfigurationError> {
        let approver_id = approver_id.into();
        let key_id = compute_key_id(&key).map_err(|e| ConfigurationError::InvalidApproverKey {
            approver_id: approver_id.clone(),
            reason: e.to_string(),
        })?;
        self.approvers
            .insert(approver_id, TrustedApprover { key, key_id });
        Ok(())
    }

    /// Trust an approver given an SPKI PEM public key.
    pub fn trust_pem(&mut self, approver_id: &str, pem: &str) -> Result<(), ConfigurationError> {
        use pkcs8::DecodePublicKey;
        let key = VerifyingKey::from_public_key_pem(pem.trim()).map_err(|e| {
            ConfigurationError::InvalidApproverKey {
                approver_id: approver_id.to_string(),
                reason: e.to_string(),
            }
        })?;
        self.trust(approver_id, key)
    }

    pub fn is_empty(&self) -> bool {
        self.approvers.is_empty()
    }

    pub fn verify(
        &self,
        token: Option<&str>,
        action: &Action,
        context: &ApprovalContext,
    ) -> Result<VerifiedApproval, GuardError> {
        self.verify_at(Utc::now(), token, action, context)
    }

    /// Check that `token` approves exactly `action` in exactly `context`.
    ///
    /// Signature and validity window are checked before the bindings, so a
    /// forged token never reports a hash mismatch.
    pub fn verify_at(
        &self,
        now: DateTime<Utc>,
        token: Option<&str>,
        action: &Action,
        context: &ApprovalContext,
    ) -> Result<VerifiedApproval, GuardError> {
        let invalid = |reason: ApprovalFailure| GuardError::ApprovalInvalid { reason };

        let raw = token
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| invalid(ApprovalFailure::Missing))?;
        let token = ApprovalToken::decode(raw).map_err(invalid)?;
        let claims = &token.claims;

        let trusted = self.approvers.get(&claims.approver_id).ok_or_else(|| {
            invalid(ApprovalFailure::UnknownApprover {
                approver_id: claims.approver_id.clone(),
            })
        })?;

        // 1. Signature
        if token.key_id != trusted.key_id {
            return Err(invalid(ApprovalFailure::SignatureInvalid));
        }
        let canonical = jcs::to_vec(claims).map_err(|e| {
            invalid(ApprovalFailure::Malformed {
                detail: e.to_string(),
            })
        })?;
        let signature = BASE64
            .decode(&token.signature)
            .ok()
            .and_then(|bytes| Signature::from_slice(&bytes).ok())
            .ok_or_else(|| {
                invalid(ApprovalFailure::Malformed {
                    detail: "invalid signature encoding".to_string(),
                })
            })?;
        trusted
            .key
            .verify(&build_pae(PAYLOAD_TYPE_APPROVAL_V1, &canonical), &signature)
            .map_err(|_| invalid(ApprovalFailure::SignatureInvalid))?;

        // 2. Validity window
        let earliest = now.checked_add_signed(self.clock_skew);
        if earliest.map_or(false, |t| t < claims.issued_at) {
            return Err(invalid(ApprovalFailure::NotYetValid {
                issued_at: claims.issued_at,
            }));
        }
        let deadline = claims.expires_at.checked_add_signed(self.clock_skew);
        if deadline.map_or(false, |end| now >= end) {
            return Err(invalid(ApprovalFailure::Expired {
                expires_at: claims.expires_at,
            }));
        }

        // 3. Bindings
        let action_hash = action.action_hash().map_err(|e| GuardError::InvalidAction {
            reason: e.to_string(),
        })?;
        if claims.action_hash != action_hash {
            return Err(invalid(ApprovalFailure::ActionMismatch {
                expected: claims.action_hash.clone(),
                actual: action_hash,
            }));
        }
        let context_hash = context.context_hash().map_err(|e| GuardError::InvalidAction {
            reason: e.to_string(),
        })?;
        if claims.context_hash != context_hash {
            return Err(invalid(ApprovalFailure::ContextMismatch {
                expected: claims.context_hash.clone(),
                actual: context_hash,
            }));
        }

        Ok(VerifiedApproval {
            approver_id: claims.approver_id.clone(),
            key_id: token.key_id.clone(),
            issued_at: claims.issued_at,
            expires_at: claims.expires_at,
        })
    }
}
