//! Label (tag) sets and the reconciler that diffs them.
//!
//! A [`LabelSet`] is the key/value label map of a resource, either as the
//! configuration declares it or as the remote API reports it. [`reconcile`]
//! turns a desired and an observed set into a [`ReconciliationPlan`]: the
//! labels to remove and the labels to create so the remote set matches the
//! desired one. Keys managed by the platform itself are filtered out of both
//! sides first and never appear in a plan.
//!
//! # Example
//!
//! ```
//! use hemmer_converge::tags::{reconcile, LabelSet, ReservedKeys};
//!
//! let desired = LabelSet::from_pairs([("env", "prod"), ("aws:cloudformation:stack", "x")]);
//! let observed = LabelSet::from_pairs([("env", "dev")]);
//!
//! let plan = reconcile(&desired, &observed, &ReservedKeys::aws());
//! assert_eq!(plan.to_create, LabelSet::from_pairs([("env", "prod")]));
//! assert_eq!(plan.to_remove, LabelSet::from_pairs([("env", "dev")]));
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Prefix of keys the AWS control plane reserves for itself.
pub const AWS_RESERVED_PREFIX: &str = "aws:";

/// Prefix of keys Elastic Beanstalk injects into its environments.
pub const ELASTICBEANSTALK_RESERVED_PREFIX: &str = "elasticbeanstalk:";

/// An unordered key/value label set.
///
/// Backed by a sorted map so iteration (and therefore the order in which
/// label operations are issued) is deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LabelSet(BTreeMap<String, String>);

impl LabelSet {
    /// Create an empty label set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a label set from key/value pairs. Later duplicates win.
    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    /// Read labels out of a JSON object. Non-string values are rendered
    /// with their JSON representation; anything that is not an object
    /// yields an empty set.
    pub fn from_json(value: &serde_json::Value) -> Self {
        let Some(map) = value.as_object() else {
            return Self::new();
        };
        Self(
            map.iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| {
                    let v = match v {
                        serde_json::Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    (k.clone(), v)
                })
                .collect(),
        )
    }

    /// Render the labels as a JSON object.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Object(
            self.0
                .iter()
                .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
                .collect(),
        )
    }

    /// Insert a label, returning the previous value for the key.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.0.insert(key.into(), value.into())
    }

    /// Remove a label, returning its value.
    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.0.remove(key)
    }

    /// Look up a label value.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Whether the key is present.
    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Number of labels.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the set has no labels.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over the labels in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// The keys, in order.
    pub fn keys(&self) -> Vec<String> {
        self.0.keys().cloned().collect()
    }

    /// A copy without any key the predicate reports as reserved.
    pub fn without_reserved<P: ReservedKeyPredicate + ?Sized>(&self, reserved: &P) -> Self {
        self.filter(|k| !reserved.is_reserved(k))
    }

    /// A copy without keys starting with any of the given prefixes.
    pub fn ignore_prefixes<S: AsRef<str>>(&self, prefixes: &[S]) -> Self {
        self.filter(|k| !prefixes.iter().any(|p| k.starts_with(p.as_ref())))
    }

    /// A copy without the given keys.
    pub fn ignore_keys<S: AsRef<str>>(&self, keys: &[S]) -> Self {
        self.filter(|k| !keys.iter().any(|ignored| ignored.as_ref() == k))
    }

    /// A copy holding only the keys that are present in `other`.
    pub fn only(&self, other: &LabelSet) -> Self {
        self.filter(|k| other.contains_key(k))
    }

    /// Merge two sets; labels in `other` win on conflict.
    pub fn merge(&self, other: &LabelSet) -> Self {
        let mut merged = self.clone();
        merged.0.extend(other.0.clone());
        merged
    }

    /// Labels in `self` whose key is absent from `new`.
    pub fn removed(&self, new: &LabelSet) -> Self {
        self.filter(|k| !new.contains_key(k))
    }

    /// Labels in `new` that are absent from `self` or carry a different value.
    pub fn updated(&self, new: &LabelSet) -> Self {
        new.filter_pairs(|k, v| self.get(k) != Some(v))
    }

    /// Split into consecutive batches of at most `size` labels.
    ///
    /// Label APIs cap how many keys a single call may carry. A `size` of
    /// zero means "no cap" and yields the whole set as one batch.
    pub fn chunks(&self, size: usize) -> Vec<LabelSet> {
        if self.is_empty() {
            return Vec::new();
        }
        if size == 0 {
            return vec![self.clone()];
        }

        let mut chunks = Vec::with_capacity(self.len().div_ceil(size));
        let mut current = LabelSet::new();
        for (k, v) in &self.0 {
            current.0.insert(k.clone(), v.clone());
            if current.len() == size {
                chunks.push(std::mem::take(&mut current));
            }
        }
        if !current.is_empty() {
            chunks.push(current);
        }
        chunks
    }

    fn filter(&self, keep: impl Fn(&str) -> bool) -> Self {
        self.filter_pairs(|k, _| keep(k))
    }

    fn filter_pairs(&self, keep: impl Fn(&str, &str) -> bool) -> Self {
        Self(
            self.0
                .iter()
                .filter(|(k, v)| keep(k, v))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }
}

impl<'a> IntoIterator for &'a LabelSet {
    type Item = (&'a String, &'a String);
    type IntoIter = std::collections::btree_map::Iter<'a, String, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for LabelSet {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self::from_pairs(iter)
    }
}

/// Identifies label keys that are managed by the platform and must never
/// be created, removed, or diffed.
///
/// Implemented for every `Fn(&str) -> bool`, so a closure works wherever a
/// predicate is expected.
pub trait ReservedKeyPredicate {
    /// Whether the key is reserved.
    fn is_reserved(&self, key: &str) -> bool;
}

impl<F> ReservedKeyPredicate for F
where
    F: Fn(&str) -> bool,
{
    fn is_reserved(&self, key: &str) -> bool {
        self(key)
    }
}

/// A table-driven [`ReservedKeyPredicate`]: exact keys plus key prefixes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReservedKeys {
    /// Keys reserved verbatim.
    pub keys: Vec<String>,
    /// Any key starting with one of these is reserved.
    pub prefixes: Vec<String>,
}

impl ReservedKeys {
    /// Nothing is reserved.
    pub fn none() -> Self {
        Self::default()
    }

    /// The `aws:` prefix every AWS service reserves.
    pub fn aws() -> Self {
        Self::none().with_prefix(AWS_RESERVED_PREFIX)
    }

    /// Elastic Beanstalk additionally injects `elasticbeanstalk:` keys and
    /// a `Name` label into the environments it manages.
    pub fn elasticbeanstalk() -> Self {
        Self::aws()
            .with_prefix(ELASTICBEANSTALK_RESERVED_PREFIX)
            .with_key("Name")
    }

    /// Reserve an exact key.
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.keys.push(key.into());
        self
    }

    /// Reserve every key with the given prefix.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefixes.push(prefix.into());
        self
    }

    /// Combine two tables.
    pub fn union(mut self, other: &ReservedKeys) -> Self {
        self.keys.extend(other.keys.iter().cloned());
        self.prefixes.extend(other.prefixes.iter().cloned());
        self
    }
}

impl ReservedKeyPredicate for ReservedKeys {
    fn is_reserved(&self, key: &str) -> bool {
        self.keys.iter().any(|k| k == key) || self.prefixes.iter().any(|p| key.starts_with(p))
    }
}

/// Provider-wide labels applied to every resource.
///
/// Resource-level labels take precedence when a key is declared in both.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DefaultLabels(pub LabelSet);

impl DefaultLabels {
    /// The full desired set for a resource: defaults overlaid by the
    /// resource's own labels.
    pub fn merge_into(&self, resource_labels: &LabelSet) -> LabelSet {
        self.0.merge(resource_labels)
    }

    /// Strip from an observed set the labels that only exist because of the
    /// defaults, leaving what the resource itself declares.
    pub fn strip_from(&self, labels: &LabelSet) -> LabelSet {
        labels.filter_pairs(|k, v| self.0.get(k) != Some(v))
    }
}

/// The operations needed to turn an observed label set into a desired one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationPlan {
    /// Labels to create: missing remotely, or remote value differs.
    pub to_create: LabelSet,
    /// Labels to remove: absent from the desired set, or superseded.
    pub to_remove: LabelSet,
}

impl ReconciliationPlan {
    /// Whether the plan does nothing.
    pub fn is_empty(&self) -> bool {
        self.to_create.is_empty() && self.to_remove.is_empty()
    }

    /// Apply the plan to a label set locally, removes first.
    ///
    /// Reserved keys in `observed` are untouched because a plan never
    /// mentions them.
    pub fn apply(&self, observed: &LabelSet) -> LabelSet {
        let mut result = observed.clone();
        for (k, _) in self.to_remove.iter() {
            result.remove(k);
        }
        for (k, v) in self.to_create.iter() {
            result.insert(k, v);
        }
        result
    }

    /// The keys whose value changes, present in both halves of the plan.
    pub fn changed_keys(&self) -> Vec<String> {
        self.to_create
            .iter()
            .filter(|(k, _)| self.to_remove.contains_key(k))
            .map(|(k, _)| k.to_string())
            .collect()
    }
}

/// Compute the minimal create/remove operations to converge `observed`
/// onto `desired`.
///
/// Reserved keys are dropped from both sides before diffing. A key whose
/// value changes shows up in both `to_create` (new value) and `to_remove`
/// (old value); the caller decides whether its API needs the remove or
/// treats create as an upsert.
pub fn reconcile<P: ReservedKeyPredicate + ?Sized>(
    desired: &LabelSet,
    observed: &LabelSet,
    reserved: &P,
) -> ReconciliationPlan {
    let desired = desired.without_reserved(reserved);
    let observed = observed.without_reserved(reserved);

    ReconciliationPlan {
        to_create: observed.updated(&desired),
        to_remove: observed.filter_pairs(|k, v| desired.get(k) != Some(v)),
    }
}
