//! Seams between the engine and the outside world.
//!
//! The engine talks to exactly two collaborators:
//!
//! - a [`RemoteApi`]: issues [`Mutation`]s and describes resources;
//! - a [`StateStore`]: supplies the declared fields and labels, and receives
//!   the observed resource back once an operation converges.
//!
//! [`JsonState`] is the store used by providers whose state is a JSON
//! document, which is all of them in practice.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Operation, RemoteError};
use crate::poll::StatusReport;
use crate::tags::{DefaultLabels, LabelSet};

/// State key holding the remote identifier.
pub const ID_KEY: &str = "id";
/// State key holding the labels the configuration declares.
pub const TAGS_KEY: &str = "tags";
/// State key holding every label on the resource, defaults included.
pub const TAGS_ALL_KEY: &str = "tags_all";

/// A mutating request against the remote API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Mutation {
    /// Create a resource from its declared fields.
    Create {
        /// Resource type name.
        resource_type: String,
        /// Declared fields, labels excluded.
        fields: Value,
    },
    /// Change fields of an existing resource.
    Update {
        /// Resource type name.
        resource_type: String,
        /// Remote identifier.
        id: String,
        /// Declared fields, labels excluded.
        fields: Value,
    },
    /// Delete a resource.
    Delete {
        /// Resource type name.
        resource_type: String,
        /// Remote identifier.
        id: String,
    },
    /// Add or overwrite labels.
    Tag {
        /// Resource type name.
        resource_type: String,
        /// Remote identifier.
        id: String,
        /// Labels to set.
        labels: LabelSet,
    },
    /// Remove labels by key.
    Untag {
        /// Resource type name.
        resource_type: String,
        /// Remote identifier.
        id: String,
        /// Keys to remove.
        keys: Vec<String>,
    },
}

impl Mutation {
    /// The lifecycle step this mutation belongs to.
    pub fn operation(&self) -> Operation {
        match self {
            Self::Create { .. } => Operation::Create,
            Self::Update { .. } => Operation::Update,
            Self::Delete { .. } => Operation::Delete,
            Self::Tag { .. } => Operation::Tag,
            Self::Untag { .. } => Operation::Untag,
        }
    }

    /// The resource type the mutation targets.
    pub fn resource_type(&self) -> &str {
        match self {
            Self::Create { resource_type, .. }
            | Self::Update { resource_type, .. }
            | Self::Delete { resource_type, .. }
            | Self::Tag { resource_type, .. }
            | Self::Untag { resource_type, .. } => resource_type,
        }
    }

    /// The remote identifier, absent for a create.
    pub fn id(&self) -> Option<&str> {
        match self {
            Self::Create { .. } => None,
            Self::Update { id, .. }
            | Self::Delete { id, .. }
            | Self::Tag { id, .. }
            | Self::Untag { id, .. } => Some(id),
        }
    }
}

/// What the remote API answered to a mutation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MutationResponse {
    /// The identifier assigned by a create.
    #[serde(default)]
    pub id: Option<String>,
    /// Any fields the response carried.
    #[serde(default)]
    pub fields: Value,
}

impl MutationResponse {
    /// A response carrying only an identifier.
    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            fields: Value::Null,
        }
    }
}

/// A resource as the remote API describes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observed {
    /// Remote identifier.
    pub id: String,
    /// Lifecycle status, as the API names it (`CREATING`, `ACTIVE`, ...).
    pub status: String,
    /// Observed fields, labels excluded.
    #[serde(default)]
    pub fields: Value,
    /// Observed labels.
    #[serde(default)]
    pub labels: LabelSet,
}

impl Observed {
    /// An observation with no fields and no labels.
    pub fn new(id: impl Into<String>, status: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: status.into(),
            fields: Value::Object(Map::new()),
            labels: LabelSet::new(),
        }
    }

    /// Replace the fields.
    pub fn with_fields(mut self, fields: Value) -> Self {
        self.fields = fields;
        self
    }

    /// Replace the labels.
    pub fn with_labels(mut self, labels: LabelSet) -> Self {
        self.labels = labels;
        self
    }
}

impl StatusReport for Observed {
    fn status(&self) -> &str {
        &self.status
    }
}

/// The remote management API, as the engine sees it.
///
/// Implementations must be safe to share between concurrent operations;
/// the remote system is the authority on conflicting mutations.
///
/// `describe` should return `Ok(None)` for a resource that does not exist.
/// An error whose code follows the not-found naming convention
/// ([`RemoteError::is_not_found`]) is treated the same way.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// Issue a mutation.
    async fn mutate(&self, mutation: &Mutation) -> Result<MutationResponse, RemoteError>;

    /// Describe a resource.
    async fn describe(&self, resource_type: &str, id: &str)
        -> Result<Option<Observed>, RemoteError>;
}

/// Where declared state comes from and observed state goes back to.
pub trait StateStore {
    /// The remote identifier, once the resource exists.
    fn id(&self) -> Option<String>;

    /// The declared fields, labels excluded.
    fn desired_fields(&self) -> Value;

    /// The declared labels, defaults included.
    fn desired_labels(&self) -> LabelSet;

    /// Write a converged observation back.
    fn record(&mut self, observed: &Observed);

    /// Forget the resource: it no longer exists remotely.
    fn clear(&mut self);
}

/// A [`StateStore`] over a JSON object.
///
/// Labels live under `tags` (what the configuration declares) and
/// `tags_all` (everything on the resource, provider defaults included).
/// Every other key except `id` is a field.
#[derive(Debug, Clone, PartialEq)]
pub struct JsonState {
    doc: Map<String, Value>,
    defaults: DefaultLabels,
}

impl JsonState {
    /// Wrap a state document. Anything but an object is treated as empty.
    pub fn new(doc: Value) -> Self {
        let doc = match doc {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self {
            doc,
            defaults: DefaultLabels::default(),
        }
    }

    /// Apply provider-wide default labels.
    pub fn with_defaults(mut self, defaults: DefaultLabels) -> Self {
        self.defaults = defaults;
        self
    }

    /// The document as it stands.
    pub fn value(&self) -> Value {
        Value::Object(self.doc.clone())
    }

    /// Consume the store, yielding the document.
    pub fn into_value(self) -> Value {
        Value::Object(self.doc)
    }

    fn declared_labels(&self) -> LabelSet {
        self.doc
            .get(TAGS_KEY)
            .map(LabelSet::from_json)
            .unwrap_or_default()
    }
}

impl StateStore for JsonState {
    fn id(&self) -> Option<String> {
        self.doc
            .get(ID_KEY)
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
    }

    fn desired_fields(&self) -> Value {
        Value::Object(
            self.doc
                .iter()
                .filter(|(k, _)| !matches!(k.as_str(), ID_KEY | TAGS_KEY | TAGS_ALL_KEY))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }

    fn desired_labels(&self) -> LabelSet {
        self.defaults.merge_into(&self.declared_labels())
    }

    fn record(&mut self, observed: &Observed) {
        // Keys the configuration declares stay in `tags` even when a default
        // carries the same value.
        let declared = observed.labels.only(&self.declared_labels());
        let tags = self.defaults.strip_from(&observed.labels).merge(&declared);

        self.doc
            .insert(ID_KEY.to_string(), Value::String(observed.id.clone()));
        if let Value::Object(fields) = &observed.fields {
            for (k, v) in fields {
                self.doc.insert(k.clone(), v.clone());
            }
        }
        self.doc.insert(TAGS_KEY.to_string(), tags.to_json());
        self.doc
            .insert(TAGS_ALL_KEY.to_string(), observed.labels.to_json());
    }

    fn clear(&mut self) {
        self.doc.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_mutation_accessors() {
        let m = Mutation::Untag {
            resource_type: "aws_sqs_queue".to_string(),
            id: "q-1".to_string(),
            keys: vec!["env".to_string()],
        };
        assert_eq!(m.operation(), Operation::Untag);
        assert_eq!(m.resource_type(), "aws_sqs_queue");
        assert_eq!(m.id(), Some("q-1"));

        let m = Mutation::Create {
            resource_type: "aws_sqs_queue".to_string(),
            fields: json!({}),
        };
        assert_eq!(m.id(), None);
    }

    #[test]
    fn test_mutation_serialization() {
        let m = Mutation::Tag {
            resource_type: "aws_kms_key".to_string(),
            id: "k".to_string(),
            labels: LabelSet::from_pairs([("env", "prod")]),
        };
        let value = serde_json::to_value(&m).unwrap();
        assert_eq!(value["kind"], "tag");
        assert_eq!(value["labels"]["env"], "prod");

        let back: Mutation = serde_json::from_value(value).unwrap();
        assert_eq!(back, m);
    }

    #[test]
    fn test_json_state_desired() {
        let state = JsonState::new(json!({
            "id": "q-1",
            "name": "orders",
            "delay_seconds": 5,
            "tags": {"env": "prod"},
            "tags_all": {"env": "prod", "team": "core"}
        }))
        .with_defaults(DefaultLabels(LabelSet::from_pairs([("team", "core"), ("env", "dev")])));

        assert_eq!(state.id(), Some("q-1".to_string()));
        assert_eq!(state.desired_fields(), json!({"name": "orders", "delay_seconds": 5}));
        assert_eq!(
            state.desired_labels(),
            LabelSet::from_pairs([("env", "prod"), ("team", "core")])
        );
    }

    #[test]
    fn test_json_state_without_id() {
        let state = JsonState::new(json!({"id": "", "name": "x"}));
        assert_eq!(state.id(), None);

        let state = JsonState::new(json!("not an object"));
        assert_eq!(state.id(), None);
        assert_eq!(state.desired_fields(), json!({}));
        assert!(state.desired_labels().is_empty());
    }

    #[test]
    fn test_json_state_record_splits_defaults() {
        let mut state = JsonState::new(json!({
            "name": "orders",
            "tags": {"env": "prod", "team": "core"}
        }))
        .with_defaults(DefaultLabels(LabelSet::from_pairs([
            ("team", "core"),
            ("cost-center", "42"),
        ])));

        let observed = Observed::new("q-1", "ACTIVE")
            .with_fields(json!({"name": "orders", "arn": "arn:aws:sqs:q-1"}))
            .with_labels(LabelSet::from_pairs([
                ("env", "prod"),
                ("team", "core"),
                ("cost-center", "42"),
            ]));
        state.record(&observed);

        let doc = state.into_value();
        assert_eq!(doc["id"], "q-1");
        assert_eq!(doc["arn"], "arn:aws:sqs:q-1");
        assert_eq!(doc["tags"], json!({"env": "prod", "team": "core"}));
        assert_eq!(
            doc["tags_all"],
            json!({"env": "prod", "team": "core", "cost-center": "42"})
        );
    }

    #[test]
    fn test_json_state_clear() {
        let mut state = JsonState::new(json!({"id": "q-1", "name": "orders"}));
        state.clear();
        assert_eq!(state.id(), None);
        assert_eq!(state.value(), json!({}));
    }
}
