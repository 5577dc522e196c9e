//! The pending action a caller asks to authorize.

use crate::jcs;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Opaque reference to a credential resolved outside the core.
///
/// Only the reference ever reaches the ledger, never the secret behind it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CredentialRef(String);

impl CredentialRef {
    pub fn new(reference: impl Into<String>) -> Self {
        Self(reference.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CredentialRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A side-effecting call an agent wants to make.
#[derive(Debug, Clone)]
pub struct Action {
    /// Per-attempt identifier (not part of the approval binding).
    pub action_id: String,
    /// Logical action name, e.g. `refund_order`.
    pub name: String,
    /// Call arguments as JSON.
    pub arguments: Value,
    /// Expected cost, used for the budget pre-check.
    pub cost_estimate: Option<f64>,
    /// Explicit idempotency key; overrides `key_arg` and the derived key.
    pub idempotency_key: Option<String>,
    /// Credential the action will use, recorded as a reference.
    pub credential_ref: Option<CredentialRef>,
    /// Whether a human approval is required regardless of guard config.
    pub requires_approval: bool,
    /// Encoded approval token supplied with this attempt.
    pub approval: Option<String>,
}

impl Action {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            action_id: format!("act_{}", uuid::Uuid::new_v4()),
            name: name.into(),
            arguments: Value::Object(serde_json::Map::new()),
            cost_estimate: None,
            idempotency_key: None,
            credential_ref: None,
            requires_approval: false,
            approval: None,
        }
    }

    pub fn with_action_id(mut self, action_id: impl Into<String>) -> Self {
        self.action_id = action_id.into();
        self
    }

    pub fn with_arguments(mut self, arguments: Value) -> Self {
        self.arguments = arguments;
        self
    }

    pub fn with_cost_estimate(mut self, estimate: f64) -> Self {
        self.cost_estimate = Some(estimate);
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_credential_ref(mut self, reference: CredentialRef) -> Self {
        self.credential_ref = Some(reference);
        self
    }

    pub fn requiring_approval(mut self) -> Self {
        self.requires_approval = true;
        self
    }

    pub fn with_approval(mut self, token: impl Into<String>) -> Self {
        self.approval = Some(token.into());
        self
    }

    /// Resolve an argument by top-level key or JSON pointer (`/a/b`).
    ///
    /// Strings are returned verbatim, other scalars via their JSON rendering.
    /// `null` and absent arguments resolve to `None`.
    pub fn argument(&self, name: &str) -> Option<String> {
        let value = if name.starts_with('/') {
            self.arguments.pointer(name)
        } else {
            self.arguments.get(name)
        }?;
        scalar_to_string(value)
    }

    /// `sha256(JCS({name, arguments}))`: what an approval token binds to.
    pub fn action_hash(&self) -> anyhow::Result<String> {
        jcs::canonical_digest(&serde_json::json!({
            "name": self.name,
            "arguments": self.arguments,
        }))
    }
}

pub(crate) fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}
