//! Engine configuration.
//!
//! [`ConvergeConfig`] is deserialized from the provider's `configure`
//! payload (or any JSON value). Every field has a default, so an empty
//! object is a valid configuration.
//!
//! Durations accept either integer seconds or a string with a unit:
//! `"500ms"`, `"30s"`, `"5m"`, `"1h"`.
//!
//! ```
//! use std::time::Duration;
//! use hemmer_converge::ConvergeConfig;
//! use serde_json::json;
//!
//! let config = ConvergeConfig::from_value(json!({
//!     "poll_interval": "5s",
//!     "timeouts": { "create": "45m" },
//!     "ignore_labels": { "prefixes": ["kubernetes.io/"] }
//! }))
//! .unwrap();
//!
//! assert_eq!(config.poll_interval, Duration::from_secs(5));
//! assert_eq!(config.timeouts.create, Duration::from_secs(45 * 60));
//! assert_eq!(config.timeouts.delete, Duration::from_secs(20 * 60));
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::classify::ErrorClassifier;
use crate::error::{ConvergeError, Operation};
use crate::poll::{PollConfig, StatusWaiter};
use crate::tags::{DefaultLabels, ReservedKeys};

/// Per-operation timeout budgets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    /// Budget for a whole create, including any provisioning wait.
    #[serde(with = "duration")]
    pub create: Duration,
    /// Budget for a whole update.
    #[serde(with = "duration")]
    pub update: Duration,
    /// Budget for a whole delete, including the wait for disappearance.
    #[serde(with = "duration")]
    pub delete: Duration,
}

impl Timeouts {
    /// The default budget for every operation.
    pub const DEFAULT: Duration = Duration::from_secs(20 * 60);

    /// The budget for an operation. Reads and label operations run inside
    /// another operation's budget, so they share the update budget.
    pub fn for_operation(&self, operation: Operation) -> Duration {
        match operation {
            Operation::Create => self.create,
            Operation::Delete => self.delete,
            Operation::Read | Operation::Update | Operation::Tag | Operation::Untag => self.update,
        }
    }
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            create: Self::DEFAULT,
            update: Self::DEFAULT,
            delete: Self::DEFAULT,
        }
    }
}

/// Configuration for a [`Converger`](crate::Converger).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConvergeConfig {
    /// Sleep between status probes.
    #[serde(with = "duration")]
    pub poll_interval: Duration,
    /// Lower bound on the sleep between probes.
    #[serde(with = "duration")]
    pub min_poll_interval: Duration,
    /// Wait before the first status probe after a mutation.
    #[serde(with = "duration")]
    pub delay: Duration,
    /// How long a single mutation is retried on transient errors.
    #[serde(with = "duration")]
    pub mutation_retry_timeout: Duration,
    /// Sleep between mutation retries.
    #[serde(with = "duration")]
    pub mutation_retry_interval: Duration,
    /// Consecutive not-found describes tolerated when reading a resource back
    /// right after a mutation. Status waiters carry their own tolerance.
    pub not_found_checks: u32,
    /// Per-operation budgets.
    pub timeouts: Timeouts,
    /// Maximum labels per tag/untag call; zero means unbounded.
    pub label_batch_size: usize,
    /// Extra error signatures, consulted before the built-in table.
    pub error_signatures: ErrorClassifier,
    /// Label keys and prefixes excluded from reconciliation on every resource.
    pub ignore_labels: ReservedKeys,
    /// Labels applied to every resource unless the resource overrides them.
    pub default_labels: DefaultLabels,
}

impl Default for ConvergeConfig {
    fn default() -> Self {
        Self {
            poll_interval: PollConfig::DEFAULT_POLL_INTERVAL,
            min_poll_interval: Duration::ZERO,
            delay: Duration::ZERO,
            mutation_retry_timeout: Duration::from_secs(2 * 60),
            mutation_retry_interval: Duration::from_secs(5),
            not_found_checks: StatusWaiter::DEFAULT_NOT_FOUND_CHECKS,
            timeouts: Timeouts::default(),
            label_batch_size: 0,
            error_signatures: ErrorClassifier::new(),
            ignore_labels: ReservedKeys::none(),
            default_labels: DefaultLabels::default(),
        }
    }
}

impl ConvergeConfig {
    /// Parse a configuration from JSON, filling in defaults.
    ///
    /// A `null` value yields the default configuration.
    pub fn from_value(value: serde_json::Value) -> Result<Self, ConvergeError> {
        if value.is_null() {
            return Ok(Self::default());
        }
        let config: Self = serde_json::from_value(value)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that would make polling meaningless.
    pub fn validate(&self) -> Result<(), ConvergeError> {
        let budgets = [
            ("timeouts.create", self.timeouts.create),
            ("timeouts.update", self.timeouts.update),
            ("timeouts.delete", self.timeouts.delete),
            ("mutation_retry_timeout", self.mutation_retry_timeout),
        ];
        for (name, budget) in budgets {
            if budget.is_zero() {
                return Err(ConvergeError::Configuration(format!(
                    "{} must be greater than zero",
                    name
                )));
            }
        }
        Ok(())
    }

    /// Poll timing for a status wait with the given budget.
    pub fn status_poll(&self, timeout: Duration) -> PollConfig {
        PollConfig::new(timeout)
            .with_poll_interval(self.poll_interval)
            .with_min_poll_interval(self.min_poll_interval)
            .with_delay(self.delay)
    }

    /// Poll timing for retrying a mutation, capped by the remaining budget.
    pub fn mutation_poll(&self, remaining: Duration) -> PollConfig {
        PollConfig::new(self.mutation_retry_timeout.min(remaining))
            .with_poll_interval(self.mutation_retry_interval)
            .with_min_poll_interval(self.min_poll_interval)
    }
}

/// Parse a duration string (`"500ms"`, `"30s"`, `"5m"`, `"1h"`, or bare
/// seconds such as `"90"`).
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim().to_lowercase();
    if s.is_empty() {
        return Err("empty duration".to_string());
    }

    let (number, unit) = if let Some(n) = s.strip_suffix("ms") {
        (n, "ms")
    } else if let Some(n) = s.strip_suffix('s') {
        (n, "s")
    } else if let Some(n) = s.strip_suffix('m') {
        (n, "m")
    } else if let Some(n) = s.strip_suffix('h') {
        (n, "h")
    } else {
        (s.as_str(), "s")
    };

    let n: u64 = number
        .trim()
        .parse()
        .map_err(|_| format!("invalid duration: {}", s))?;

    let secs = match unit {
        "ms" => return Ok(Duration::from_millis(n)),
        "m" => n.checked_mul(60),
        "h" => n.checked_mul(3600),
        _ => Some(n),
    };
    secs.map(Duration::from_secs)
        .ok_or_else(|| format!("duration out of range: {}", s))
}

/// Durations serialize at millisecond resolution, the finest unit
/// [`parse_duration`] reads back. Anything below a millisecond is dropped.
mod duration {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Seconds(u64),
        Text(String),
    }

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        if value.subsec_millis() == 0 {
            serializer.serialize_str(&format!("{}s", value.as_secs()))
        } else {
            serializer.serialize_str(&format!("{}ms", value.as_millis()))
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        match Raw::deserialize(deserializer)? {
            Raw::Seconds(secs) => Ok(Duration::from_secs(secs)),
            Raw::Text(text) => super::parse_duration(&text).map_err(serde::de::Error::custom),
        }
    }
}
