//! Declarative guard specs and their validated form.
//!
//! A [`GuardSpec`] is what configuration says; a [`GuardSet`] is the checked,
//! immutable set the chain evaluates. Every range rule is enforced in
//! [`GuardSet::new`], so nothing invalid survives to the first call.

use crate::errors::ConfigurationError;
use crate::runtime::circuit::BreakerConfig;
use crate::runtime::idempotency::{IdempotencyPolicy, OnDuplicate};
use chrono::Duration;
use serde::{Deserialize, Serialize};

/// Default upper bound for `on_duplicate: block` waits.
pub const DEFAULT_WAIT_TIMEOUT_SECS: f64 = 30.0;

/// Longest accepted TTL, period or timeout: 100 years.
pub const MAX_DURATION_SECS: u64 = 100 * 365 * 24 * 60 * 60;

fn default_scope_key() -> String {
    "session".to_string()
}

/// One guard instance, as configured.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GuardSpec {
    /// The value of argument `arg` must be a proven fact of `kind`.
    RequireFact { kind: String, arg: String },
    /// On success, prove the value at `field` of the result as `kind`.
    Prove {
        kind: String,
        field: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ttl_s: Option<u64>,
    },
    RateLimit {
        max_calls: u32,
        /// Seconds.
        period: f64,
        #[serde(default = "default_scope_key")]
        scope_key: String,
    },
    CircuitBreaker {
        name: String,
        max_fails: u32,
        /// Seconds.
        reset_timeout: f64,
    },
    MaxAttempts { calls: u32 },
    Timeout { seconds: f64 },
    Idempotent {
        ttl_s: u64,
        #[serde(default)]
        on_duplicate: OnDuplicate,
        /// Argument holding the key; default is the action's own key or hash.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        key_arg: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        wait_timeout_s: Option<f64>,
    },
}

impl GuardSpec {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::RequireFact { .. } => "require_fact",
            Self::Prove { .. } => "prove",
            Self::RateLimit { .. } => "rate_limit",
            Self::CircuitBreaker { .. } => "circuit_breaker",
            Self::MaxAttempts { .. } => "max_attempts",
            Self::Timeout { .. } => "timeout",
            Self::Idempotent { .. } => "idempotent",
        }
    }
}

/// Which value a rate limit counts against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScopeKey {
    Session,
    User,
    Tenant,
    /// One window shared by every caller.
    Global,
    /// The value of an action argument, e.g. `arg:customer_id`.
    Arg(String),
}

impl ScopeKey {
    fn parse(raw: &str) -> Result<Self, ConfigurationError> {
        match raw.trim() {
            "session" => Ok(Self::Session),
            "user" => Ok(Self::User),
            "tenant" => Ok(Self::Tenant),
            "global" | "*" => Ok(Self::Global),
            other => match other.strip_prefix("arg:") {
                Some(arg) if !arg.is_empty() => Ok(Self::Arg(arg.to_string())),
                _ => Err(ConfigurationError::field(
                    "rate_limit",
                    "scope_key",
                    "one of session, user, tenant, global or arg:<name>",
                )),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FactGuard {
    pub kind: String,
    pub arg: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProveGuard {
    pub kind: String,
    pub field: String,
    pub ttl: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitGuard {
    pub max_calls: u32,
    pub period: Duration,
    pub scope_key: ScopeKey,
    /// Distinguishes windows of different length on the same action.
    pub window: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerGuard {
    pub name: String,
    pub config: BreakerConfig,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdempotentGuard {
    pub policy: IdempotencyPolicy,
    pub key_arg: Option<String>,
}

/// Validated, immutable guards for one action.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GuardSet {
    specs: Vec<GuardSpec>,
    pub(crate) facts: Vec<FactGuard>,
    pub(crate) proofs: Vec<ProveGuard>,
    pub(crate) rate_limits: Vec<RateLimitGuard>,
    pub(crate) max_attempts: Option<u32>,
    pub(crate) breakers: Vec<BreakerGuard>,
    pub(crate) timeout: Option<std::time::Duration>,
    pub(crate) idempotent: Option<IdempotentGuard>,
    pub(crate) requires_approval: bool,
}

fn non_empty(
    value: &str,
    guard: &'static str,
    field: &'static str,
) -> Result<String, ConfigurationError> {
    if value.trim().is_empty() {
        return Err(ConfigurationError::field(guard, field, "a non-empty string"));
    }
    Ok(value.to_string())
}

fn positive_secs(
    secs: f64,
    guard: &'static str,
    field: &'static str,
) -> Result<std::time::Duration, ConfigurationError> {
    if !secs.is_finite() || secs <= 0.0 {
        return Err(ConfigurationError::field(guard, field, "a number of seconds > 0"));
    }
    if secs > MAX_DURATION_SECS as f64 {
        return Err(ConfigurationError::field(guard, field, "at most 100 years"));
    }
    std::time::Duration::try_from_secs_f64(secs)
        .map_err(|_| ConfigurationError::field(guard, field, "a representable duration"))
}

fn chrono_secs(
    secs: f64,
    guard: &'static str,
    field: &'static str,
) -> Result<Duration, ConfigurationError> {
    let std = positive_secs(secs, guard, field)?;
    Duration::from_std(std)
        .map_err(|_| ConfigurationError::field(guard, field, "a representable duration"))
}

/// Whole seconds in `0..=MAX_DURATION_SECS` as a chrono duration.
pub(crate) fn bounded_secs(secs: u64) -> Option<Duration> {
    if secs > MAX_DURATION_SECS {
        return None;
    }
    i64::try_from(secs).ok().and_then(Duration::try_seconds)
}

fn ttl_secs(
    secs: u64,
    guard: &'static str,
    field: &'static str,
) -> Result<Duration, ConfigurationError> {
    if secs == 0 {
        return Err(ConfigurationError::field(guard, field, "an integer > 0"));
    }
    bounded_secs(secs).ok_or_else(|| ConfigurationError::field(guard, field, "at most 100 years"))
}

fn window_label(secs: f64) -> String {
    if secs.fract() == 0.0 {
        format!("{}s", secs as u64)
    } else {
        format!("{}s", secs)
    }
}

impl GuardSet {
    /// Validate `specs` into a guard set.
    pub fn new(specs: Vec<GuardSpec>) -> Result<Self, ConfigurationError> {
        let mut set = GuardSet::default();

        for spec in &specs {
            match spec {
                GuardSpec::RequireFact { kind, arg } => set.facts.push(FactGuard {
                    kind: non_empty(kind, "require_fact", "kind")?,
                    arg: non_empty(arg, "require_fact", "arg")?,
                }),
                GuardSpec::Prove { kind, field, ttl_s } => {
                    let ttl = ttl_s
                        .map(|s| ttl_secs(s, "prove", "ttl_s"))
                        .transpose()?;
                    set.proofs.push(ProveGuard {
                        kind: non_empty(kind, "prove", "kind")?,
                        field: non_empty(field, "prove", "field")?,
                        ttl,
                    });
                }
                GuardSpec::RateLimit {
                    max_calls,
                    period,
                    scope_key,
                } => {
                    if *max_calls == 0 {
                        return Err(ConfigurationError::field(
                            "rate_limit",
                            "max_calls",
                            "an integer > 0",
                        ));
                    }
                    let guard = RateLimitGuard {
                        max_calls: *max_calls,
                        period: chrono_secs(*period, "rate_limit", "period")?,
                        scope_key: ScopeKey::parse(scope_key)?,
                        window: window_label(*period),
                    };
                    if set
                        .rate_limits
                        .iter()
                        .any(|r| r.scope_key == guard.scope_key && r.period == guard.period)
                    {
                        return Err(ConfigurationError::DuplicateGuard {
                            guard: "rate_limit",
                        });
                    }
                    set.rate_limits.push(guard);
                }
                GuardSpec::CircuitBreaker {
                    name,
                    max_fails,
                    reset_timeout,
                } => {
                    if *max_fails == 0 {
                        return Err(ConfigurationError::field(
                            "circuit_breaker",
                            "max_fails",
                            "an integer > 0",
                        ));
                    }
                    let name = non_empty(name, "circuit_breaker", "name")?;
                    if set.breakers.iter().any(|b| b.name == name) {
                        return Err(ConfigurationError::DuplicateGuard {
                            guard: "circuit_breaker",
                        });
                    }
                    set.breakers.push(BreakerGuard {
                        name,
                        config: BreakerConfig {
                            max_fails: *max_fails,
                            reset_timeout: chrono_secs(
                                *reset_timeout,
                                "circuit_breaker",
                                "reset_timeout",
                            )?,
                        },
                    });
                }
                GuardSpec::MaxAttempts { calls } => {
                    if *calls == 0 {
                        return Err(ConfigurationError::field(
                            "max_attempts",
                            "calls",
                            "an integer > 0",
                        ));
                    }
                    if set.max_attempts.replace(*calls).is_some() {
                        return Err(ConfigurationError::DuplicateGuard {
                            guard: "max_attempts",
                        });
                    }
                }
                GuardSpec::Timeout { seconds } => {
                    let timeout = positive_secs(*seconds, "timeout", "seconds")?;
                    if set.timeout.replace(timeout).is_some() {
                        return Err(ConfigurationError::DuplicateGuard { guard: "timeout" });
                    }
                }
                GuardSpec::Idempotent {
                    ttl_s,
                    on_duplicate,
                    key_arg,
                    wait_timeout_s,
                } => {
                    let ttl = ttl_secs(*ttl_s, "idempotent", "ttl_s")?;
                    let wait_timeout = positive_secs(
                        wait_timeout_s.unwrap_or(DEFAULT_WAIT_TIMEOUT_SECS),
                        "idempotent",
                        "wait_timeout_s",
                    )?;
                    let key_arg = key_arg
                        .as_deref()
                        .map(|k| non_empty(k, "idempotent", "key_arg"))
                        .transpose()?;
                    let guard = IdempotentGuard {
                        policy: IdempotencyPolicy {
                            ttl,
                            on_duplicate: *on_duplicate,
                            wait_timeout,
                        },
                        key_arg,
                    };
                    if set.idempotent.replace(guard).is_some() {
                        return Err(ConfigurationError::DuplicateGuard {
                            guard: "idempotent",
                        });
                    }
                }
            }
        }

        set.specs = specs;
        Ok(set)
    }

    /// Mark every action using this set as needing human approval.
    pub fn requiring_approval(mut self) -> Self {
        self.requires_approval = true;
        self
    }

    pub fn requires_approval(&self) -> bool {
        self.requires_approval
    }

    pub fn specs(&self) -> &[GuardSpec] {
        &self.specs
    }

    pub fn timeout(&self) -> Option<std::time::Duration> {
        self.timeout
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty() && !self.requires_approval
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rate(max_calls: u32, period: f64) -> GuardSpec {
        GuardSpec::RateLimit {
            max_calls,
            period,
            scope_key: "session".into(),
        }
    }

    #[test]
    fn test_valid_set() {
        let set = GuardSet::new(vec![
            GuardSpec::RequireFact {
                kind: "order_id".into(),
                arg: "order_id".into(),
            },
            rate(10, 60.0),
            rate(100, 3600.0),
            GuardSpec::CircuitBreaker {
                name: "payments".into(),
                max_fails: 3,
                reset_timeout: 30.0,
            },
            GuardSpec::Timeout { seconds: 2.5 },
            GuardSpec::Idempotent {
                ttl_s: 3600,
                on_duplicate: OnDuplicate::Block,
                key_arg: Some("order_id".into()),
                wait_timeout_s: None,
            },
        ])
        .unwrap();

        assert_eq!(set.rate_limits.len(), 2);
        assert_eq!(set.rate_limits[0].window, "60s");
        assert_eq!(set.timeout(), Some(std::time::Duration::from_millis(2500)));
        let idem = set.idempotent.as_ref().unwrap();
        assert_eq!(
            idem.policy.wait_timeout,
            std::time::Duration::from_secs(30)
        );
        assert_eq!(set.specs().len(), 6);
    }

    #[test]
    fn test_range_rules() {
        let cases = vec![
            (rate(0, 60.0), "max_calls"),
            (rate(10, 0.0), "period"),
            (rate(10, f64::NAN), "period"),
            (
                GuardSpec::CircuitBreaker {
                    name: "x".into(),
                    max_fails: 0,
                    reset_timeout: 1.0,
                },
                "max_fails",
            ),
            (
                GuardSpec::CircuitBreaker {
                    name: "x".into(),
                    max_fails: 1,
                    reset_timeout: -1.0,
                },
                "reset_timeout",
            ),
            (GuardSpec::MaxAttempts { calls: 0 }, "calls"),
            (GuardSpec::Timeout { seconds: 0.0 }, "seconds"),
            (
                GuardSpec::Idempotent {
                    ttl_s: 0,
                    on_duplicate: OnDuplicate::Return,
                    key_arg: None,
                    wait_timeout_s: None,
                },
                "ttl_s",
            ),
            (
                GuardSpec::Idempotent {
                    ttl_s: 100_000_000_000_000_000,
                    on_duplicate: OnDuplicate::Return,
                    key_arg: None,
                    wait_timeout_s: None,
                },
                "ttl_s",
            ),
            (
                GuardSpec::Idempotent {
                    ttl_s: u64::MAX,
                    on_duplicate: OnDuplicate::Return,
                    key_arg: None,
                    wait_timeout_s: None,
                },
                "ttl_s",
            ),
            (
                GuardSpec::Prove {
                    kind: "order_id".into(),
                    field: "id".into(),
                    ttl_s: Some(9_000_000_000_000),
                },
                "ttl_s",
            ),
            (rate(10, 1e15), "period"),
            (GuardSpec::Timeout { seconds: 1e300 }, "seconds"),
        ];

        for (spec, expected_field) in cases {
            match GuardSet::new(vec![spec.clone()]) {
                Err(ConfigurationError::InvalidField { field, .. }) => {
                    assert_eq!(field, expected_field, "spec {:?}", spec)
                }
                other => panic!("expected InvalidField for {:?}, got {:?}", spec, other),
            }
        }
    }

    #[test]
    fn test_longest_ttl_is_accepted() {
        let set = GuardSet::new(vec![GuardSpec::Idempotent {
            ttl_s: MAX_DURATION_SECS,
            on_duplicate: OnDuplicate::Return,
            key_arg: None,
            wait_timeout_s: None,
        }])
        .unwrap();
        assert_eq!(
            set.idempotent.unwrap().policy.ttl,
            Duration::seconds(MAX_DURATION_SECS as i64)
        );
        assert!(bounded_secs(MAX_DURATION_SECS + 1).is_none());
    }

    #[test]
    fn test_single_instance_guards() {
        let err = GuardSet::new(vec![
            GuardSpec::Timeout { seconds: 1.0 },
            GuardSpec::Timeout { seconds: 2.0 },
        ])
        .unwrap_err();
        assert_eq!(err, ConfigurationError::DuplicateGuard { guard: "timeout" });

        let err = GuardSet::new(vec![rate(1, 60.0), rate(5, 60.0)]).unwrap_err();
        assert_eq!(err, ConfigurationError::DuplicateGuard { guard: "rate_limit" });
    }

    #[test]
    fn test_scope_keys() {
        assert_eq!(ScopeKey::parse("user").unwrap(), ScopeKey::User);
        assert_eq!(ScopeKey::parse("*").unwrap(), ScopeKey::Global);
        assert_eq!(
            ScopeKey::parse("arg:customer_id").unwrap(),
            ScopeKey::Arg("customer_id".into())
        );
        assert!(ScopeKey::parse("arg:").is_err());
        assert!(ScopeKey::parse("planet").is_err());
    }

    #[test]
    fn test_yaml_shape() {
        let specs: Vec<GuardSpec> = serde_yaml::from_str(
            r#"
- type: require_fact
  kind: order_id
  arg: order_id
- type: rate_limit
  max_calls: 10
  period: 60
- type: idempotent
  ttl_s: 86400
  on_duplicate: raise
"#,
        )
        .unwrap();
        assert_eq!(
            specs[1],
            GuardSpec::RateLimit {
                max_calls: 10,
                period: 60.0,
                scope_key: "session".into()
            }
        );
        assert!(matches!(
            specs[2],
            GuardSpec::Idempotent {
                on_duplicate: OnDuplicate::Raise,
                ..
            }
        ));
    }
}
