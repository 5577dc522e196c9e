//! YAML guard configuration.
//!
//! ```yaml
//! ledger:
//!   path: decisions.ndjson
//!   on_write_failure: best_effort
//! approvals:
//!   clock_skew_s: 30
//!   approvers:
//!     - id: ops-oncall
//!       public_key_pem: |
//!         -----BEGIN PUBLIC KEY-----
//!         ...
//! actions:
//!   refund:
//!     requires_approval: true
//!     guards:
//!       - { type: require_fact, kind: order_id, arg: order_id }
//!       - { type: idempotent, ttl_s: 86400, on_duplicate: return }
//! ```

mod spec;

pub use crate::runtime::idempotency::OnDuplicate;
pub use spec::{
    BreakerGuard, FactGuard, GuardSet, GuardSpec, IdempotentGuard, ProveGuard, RateLimitGuard,
    ScopeKey, DEFAULT_WAIT_TIMEOUT_SECS, MAX_DURATION_SECS,
};

use crate::errors::ConfigurationError;
use crate::ledger::{DecisionLedger, LedgerWritePolicy, SqliteLedgerSink};
use crate::runtime::{
    ApprovalVerifier, FactPolicy, GuardChain, IdempotencyCoordinator, SessionConfig,
};
use anyhow::{Context, Result};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// A whole-second setting as a duration; `allow_zero` admits 0.
fn setting_secs(
    secs: u64,
    setting: &'static str,
    allow_zero: bool,
) -> Result<Duration, ConfigurationError> {
    if secs == 0 && !allow_zero {
        return Err(ConfigurationError::InvalidSetting {
            setting,
            reason: "must be > 0".to_string(),
        });
    }
    spec::bounded_secs(secs).ok_or_else(|| ConfigurationError::InvalidSetting {
        setting,
        reason: format!("must be at most {} seconds", MAX_DURATION_SECS),
    })
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerFormat {
    #[default]
    Ndjson,
    Sqlite,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LedgerSettings {
    /// No path means records are discarded.
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub format: LedgerFormat,
    #[serde(default)]
    pub on_write_failure: LedgerWritePolicy,
}

fn default_in_flight_ttl() -> u64 {
    crate::runtime::idempotency::DEFAULT_IN_FLIGHT_TTL_SECS as u64
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencySettings {
    /// In-flight claims older than this are reclaimed.
    #[serde(default = "default_in_flight_ttl")]
    pub in_flight_ttl_s: u64,
    /// How long a failed key refuses retries; 0 frees it at once.
    #[serde(default)]
    pub failed_retry_ttl_s: u64,
}

impl Default for IdempotencySettings {
    fn default() -> Self {
        Self {
            in_flight_ttl_s: default_in_flight_ttl(),
            failed_retry_ttl_s: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApproverEntry {
    pub id: String,
    pub public_key_pem: String,
}

fn default_clock_skew() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalSettings {
    #[serde(default = "default_clock_skew")]
    pub clock_skew_s: u64,
    #[serde(default)]
    pub approvers: Vec<ApproverEntry>,
}

impl Default for ApprovalSettings {
    fn default() -> Self {
        Self {
            clock_skew_s: default_clock_skew(),
            approvers: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FactSettings {
    #[serde(default)]
    pub policy: FactPolicy,
    #[serde(default)]
    pub default_ttl_s: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActionEntry {
    #[serde(default)]
    pub requires_approval: bool,
    #[serde(default)]
    pub guards: Vec<GuardSpec>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GuardConfig {
    #[serde(default)]
    pub ledger: LedgerSettings,
    #[serde(default)]
    pub idempotency: IdempotencySettings,
    #[serde(default)]
    pub approvals: ApprovalSettings,
    #[serde(default)]
    pub facts: FactSettings,
    #[serde(default)]
    pub actions: BTreeMap<String, ActionEntry>,
}

/// Validated guard sets by action name.
#[derive(Debug, Clone, Default)]
pub struct ActionGuards {
    by_action: HashMap<String, GuardSet>,
    unguarded: GuardSet,
}

impl ActionGuards {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, action: impl Into<String>, guards: GuardSet) {
        self.by_action.insert(action.into(), guards);
    }

    pub fn get(&self, action: &str) -> Option<&GuardSet> {
        self.by_action.get(action)
    }

    /// Guards for `action`; an unconfigured action gets an empty set.
    pub fn for_action(&self, action: &str) -> &GuardSet {
        self.by_action.get(action).unwrap_or(&self.unguarded)
    }

    pub fn len(&self) -> usize {
        self.by_action.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_action.is_empty()
    }
}

impl GuardConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read guard config {}", path.display()))?;
        Self::from_yaml(&content)
            .with_context(|| format!("failed to parse guard config {}", path.display()))
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: GuardConfig =
            serde_yaml::from_str(content).context("invalid guard config YAML")?;
        Ok(config)
    }

    /// Turn every action entry into a validated guard set.
    pub fn validate(&self) -> Result<ActionGuards, ConfigurationError> {
        if let Some(ttl) = self.facts.default_ttl_s {
            setting_secs(ttl, "facts.default_ttl_s", false)?;
        }
        setting_secs(self.approvals.clock_skew_s, "approvals.clock_skew_s", true)?;
        self.idempotency_coordinator()?;

        let mut guards = ActionGuards::new();
        for (name, entry) in &self.actions {
            let mut set = GuardSet::new(entry.guards.clone()).map_err(|e| e.in_action(name))?;
            if entry.requires_approval {
                set = set.requiring_approval();
            }
            guards.insert(name.clone(), set);
        }

        // Breakers are shared by name, so every action must agree on one config.
        let mut breakers: HashMap<&str, (&str, &crate::runtime::BreakerConfig)> = HashMap::new();
        for action in self.actions.keys() {
            let Some(set) = guards.get(action) else {
                continue;
            };
            for breaker in &set.breakers {
                match breakers.get(breaker.name.as_str()) {
                    Some((first_action, config)) if **config != breaker.config => {
                        return Err(ConfigurationError::ConflictingBreaker {
                            name: breaker.name.clone(),
                            first_action: first_action.to_string(),
                            action: action.clone(),
                        });
                    }
                    Some(_) => {}
                    None => {
                        breakers.insert(breaker.name.as_str(), (action.as_str(), &breaker.config));
                    }
                }
            }
        }

        let needs_approvers = guards.by_action.values().any(GuardSet::requires_approval);
        if needs_approvers && self.approvals.approvers.is_empty() {
            return Err(ConfigurationError::InvalidSetting {
                setting: "approvals.approvers",
                reason: "an action requires approval but no approver is trusted".to_string(),
            });
        }
        Ok(guards)
    }

    pub fn approval_verifier(&self) -> Result<ApprovalVerifier, ConfigurationError> {
        let skew = setting_secs(self.approvals.clock_skew_s, "approvals.clock_skew_s", true)?;
        let mut verifier = ApprovalVerifier::new().with_clock_skew(skew);
        for approver in &self.approvals.approvers {
            verifier.trust_pem(&approver.id, &approver.public_key_pem)?;
        }
        Ok(verifier)
    }

    pub fn idempotency_coordinator(&self) -> Result<IdempotencyCoordinator, ConfigurationError> {
        Ok(IdempotencyCoordinator::new(
            setting_secs(
                self.idempotency.in_flight_ttl_s,
                "idempotency.in_flight_ttl_s",
                false,
            )?,
            setting_secs(
                self.idempotency.failed_retry_ttl_s,
                "idempotency.failed_retry_ttl_s",
                true,
            )?,
        ))
    }

    /// Base session config carrying the fact settings.
    pub fn session_config(&self) -> SessionConfig {
        let mut config = SessionConfig::new().with_fact_policy(self.facts.policy);
        // `validate` rejects an out-of-range TTL; here it means no expiry.
        if let Some(ttl) = self.facts.default_ttl_s.and_then(spec::bounded_secs) {
            config = config.with_fact_ttl(ttl);
        }
        config
    }

    /// Chain with this config's approvers and idempotency settings.
    pub fn build_chain(&self) -> Result<GuardChain, ConfigurationError> {
        Ok(GuardChain::new()
            .with_idempotency(self.idempotency_coordinator()?)
            .with_approvals(self.approval_verifier()?))
    }

    pub fn open_ledger(&self) -> Result<Arc<DecisionLedger>> {
        let ledger = match (&self.ledger.path, self.ledger.format) {
            (None, _) => DecisionLedger::null(),
            (Some(path), LedgerFormat::Ndjson) => DecisionLedger::to_file(path)
                .with_context(|| format!("failed to open ledger {}", path.display()))?,
            (Some(path), LedgerFormat::Sqlite) => {
                let sink = SqliteLedgerSink::open(path)
                    .with_context(|| format!("failed to open ledger {}", path.display()))?;
                DecisionLedger::new(Box::new(sink))
            }
        };
        Ok(Arc::new(ledger.with_policy(self.ledger.on_write_failure)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
ledger:
  on_write_failure: fail_closed
idempotency:
  in_flight_ttl_s: 60
facts:
  policy: accumulate
  default_ttl_s: 900
actions:
  lookup_order:
    guards:
      - type: prove
        kind: order_id
        field: /order/id
  refund:
    guards:
      - { type: require_fact, kind: order_id, arg: order_id }
      - { type: rate_limit, max_calls: 5, period: 60, scope_key: user }
      - { type: circuit_breaker, name: payments, max_fails: 3, reset_timeout: 30 }
      - { type: idempotent, ttl_s: 86400, key_arg: order_id }
"#;

    #[test]
    fn test_parse_and_validate() {
        let config = GuardConfig::from_yaml(CONFIG).unwrap();
        assert_eq!(config.ledger.on_write_failure, LedgerWritePolicy::FailClosed);
        assert_eq!(config.approvals.clock_skew_s, 30);

        let guards = config.validate().unwrap();
        assert_eq!(guards.len(), 2);
        let refund = guards.get("refund").unwrap();
        assert_eq!(refund.specs().len(), 4);
        assert!(!refund.requires_approval());
        assert!(guards.for_action("unknown").is_empty());
    }

    #[test]
    fn test_invalid_guard_names_action() {
        let config = GuardConfig::from_yaml(
            r#"
actions:
  search:
    guards:
      - { type: rate_limit, max_calls: 0, period: 60 }
"#,
        )
        .unwrap();
        let err = config.validate().unwrap_err();
        assert_eq!(
            err.to_string(),
            "action 'search': rate_limit: 'max_calls' must be an integer > 0"
        );
    }

    #[test]
    fn test_unknown_guard_type_is_a_parse_error() {
        let err = GuardConfig::from_yaml(
            r#"
actions:
  search:
    guards:
      - { type: teleport }
"#,
        )
        .unwrap_err();
        assert!(format!("{:#}", err).contains("invalid guard config YAML"));
    }

    #[test]
    fn test_approval_requires_trusted_approver() {
        let config = GuardConfig::from_yaml(
            r#"
actions:
  wire_transfer:
    requires_approval: true
"#,
        )
        .unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigurationError::InvalidSetting {
                setting: "approvals.approvers",
                ..
            })
        ));
    }

    #[test]
    fn test_breaker_shared_by_name_must_agree() {
        let config = GuardConfig::from_yaml(
            r#"
actions:
  charge:
    guards:
      - { type: circuit_breaker, name: payments, max_fails: 3, reset_timeout: 30 }
  refund:
    guards:
      - { type: circuit_breaker, name: payments, max_fails: 5, reset_timeout: 30 }
"#,
        )
        .unwrap();
        assert_eq!(
            config.validate().unwrap_err(),
            ConfigurationError::ConflictingBreaker {
                name: "payments".into(),
                first_action: "charge".into(),
                action: "refund".into(),
            }
        );

        let agreeing = GuardConfig::from_yaml(
            r#"
actions:
  charge:
    guards:
      - { type: circuit_breaker, name: payments, max_fails: 3, reset_timeout: 30 }
  refund:
    guards:
      - { type: circuit_breaker, name: payments, max_fails: 3, reset_timeout: 30 }
"#,
        )
        .unwrap();
        assert!(agreeing.validate().is_ok());
    }

    #[test]
    fn test_out_of_range_settings_are_rejected() {
        let cases = [
            ("idempotency:\n  in_flight_ttl_s: 0\n", "idempotency.in_flight_ttl_s"),
            (
                "idempotency:\n  failed_retry_ttl_s: 9000000000000\n",
                "idempotency.failed_retry_ttl_s",
            ),
            (
                "approvals:\n  clock_skew_s: 18446744073709551615\n",
                "approvals.clock_skew_s",
            ),
            ("facts:\n  default_ttl_s: 0\n", "facts.default_ttl_s"),
            ("facts:\n  default_ttl_s: 9000000000000\n", "facts.default_ttl_s"),
        ];
        for (yaml, expected) in cases {
            let config = GuardConfig::from_yaml(yaml).unwrap();
            match config.validate() {
                Err(ConfigurationError::InvalidSetting { setting, .. }) => {
                    assert_eq!(setting, expected, "config {:?}", yaml)
                }
                other => panic!("expected InvalidSetting for {:?}, got {:?}", yaml, other),
            }
        }

        let config = GuardConfig::from_yaml("idempotency:\n  failed_retry_ttl_s: 9000000000000\n")
            .unwrap();
        assert!(config.build_chain().is_err());
    }

    #[test]
    fn test_bad_pem_is_configuration_error() {
        let config = GuardConfig::from_yaml(
            r#"
approvals:
  approvers:
    - id: ops
      public_key_pem: "-----BEGIN PUBLIC KEY-----\nnope\n-----END PUBLIC KEY-----"
"#,
        )
        .unwrap();
        assert!(matches!(
            config.build_chain(),
            Err(ConfigurationError::InvalidApproverKey { .. })
        ));
    }

    #[test]
    fn test_from_file_and_open_sqlite_ledger() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("guards.yaml");
        let ledger_path = dir.path().join("ledger.db");
        std::fs::write(
            &config_path,
            format!(
                "ledger:\n  path: {}\n  format: sqlite\n",
                ledger_path.display()
            ),
        )
        .unwrap();

        let config = GuardConfig::from_file(&config_path).unwrap();
        let ledger = config.open_ledger().unwrap();
        assert_eq!(ledger.policy(), LedgerWritePolicy::BestEffort);
        assert!(ledger_path.exists());
    }

    #[test]
    fn test_missing_file_has_context() {
        let err = GuardConfig::from_file(Path::new("/nonexistent/guards.yaml")).unwrap_err();
        assert!(err.to_string().contains("failed to read guard config"));
    }
}
