//! Transient-versus-fatal classification of remote errors.
//!
//! Remote control planes are eventually consistent: a role created a moment
//! ago may not be usable yet, and the API says so with an ordinary error.
//! An [`ErrorClassifier`] is a table of known error signatures, each
//! matching on the error code, a message substring, or both, and naming a
//! class. The first matching signature wins; an error that matches nothing
//! is fatal, so a genuinely broken request is never retried for the whole
//! timeout window.
//!
//! # Example
//!
//! ```
//! use hemmer_converge::classify::{ErrorClass, ErrorClassifier};
//! use hemmer_converge::RemoteError;
//!
//! let classifier = ErrorClassifier::defaults();
//!
//! let err = RemoteError::with_code(
//!     "InvalidArgumentException",
//!     "Kinesis Analytics service doesn't have sufficient privileges to assume the role",
//! );
//! assert_eq!(classifier.classify(&err), ErrorClass::Transient);
//!
//! let err = RemoteError::with_code("ValidationException", "name too long");
//! assert_eq!(classifier.classify(&err), ErrorClass::Fatal);
//! ```

use serde::{Deserialize, Serialize};

use crate::error::RemoteError;

/// How an error should be treated by a poll loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// May succeed if retried after a delay.
    Transient,
    /// Cannot succeed without changing the request.
    Fatal,
}

fn transient() -> ErrorClass {
    ErrorClass::Transient
}

/// One row of the classification table.
///
/// A signature with both `code` and `message` matches only when both do.
/// A signature with neither matches nothing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    /// Exact error code to match.
    #[serde(default)]
    pub code: Option<String>,
    /// Substring of the error message to match.
    #[serde(default)]
    pub message: Option<String>,
    /// The class assigned on a match.
    #[serde(default = "transient")]
    pub class: ErrorClass,
}

impl Signature {
    /// A transient signature matching a message substring.
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: Some(message.into()),
            class: ErrorClass::Transient,
        }
    }

    /// A transient signature matching an error code.
    pub fn code(code: impl Into<String>) -> Self {
        Self {
            code: Some(code.into()),
            message: None,
            class: ErrorClass::Transient,
        }
    }

    /// A transient signature matching both a code and a message substring.
    pub fn code_and_message(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: Some(code.into()),
            message: Some(message.into()),
            class: ErrorClass::Transient,
        }
    }

    /// Mark the signature as fatal instead.
    pub fn fatal(mut self) -> Self {
        self.class = ErrorClass::Fatal;
        self
    }

    /// Whether the error matches this signature.
    pub fn matches(&self, err: &RemoteError) -> bool {
        if self.code.is_none() && self.message.is_none() {
            return false;
        }
        let code_ok = self.code.as_deref().map_or(true, |c| err.has_code(c));
        let message_ok = self.message.as_deref().map_or(true, |m| err.message_contains(m));
        code_ok && message_ok
    }
}

/// An ordered table of error signatures.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ErrorClassifier {
    signatures: Vec<Signature>,
}

impl ErrorClassifier {
    /// An empty table: everything is fatal.
    pub fn new() -> Self {
        Self::default()
    }

    /// IAM eventual-consistency signatures: roles and trust policies that
    /// exist but have not propagated to the calling service yet.
    pub fn iam_propagation() -> Self {
        Self::new()
            .with(Signature::message("IAM role not yet propagated"))
            .with(Signature::message("validate IAM role permission"))
            .with(Signature::message("not the necessary trust relationship"))
            .with(Signature::message("doesn't have sufficient privileges"))
            .with(Signature::message(
                "does not provide Invoke permissions on the Lambda resource",
            ))
            .with(Signature::message("does not have a trust relationship allowing"))
            .with(Signature::message(
                "IAM role ARN value is invalid or does not include the required permissions",
            ))
            .with(Signature::message("unable to assume the given role"))
            .with(Signature::message("cannot assume role"))
            .with(Signature::message("has no associated IAM Roles"))
            .with(Signature::message("couldn't fetch the role from instance profile"))
    }

    /// Rate limiting and conflicting-mutation signatures.
    pub fn throttling() -> Self {
        Self::new()
            .with(Signature::code("ThrottlingException"))
            .with(Signature::code("Throttling"))
            .with(Signature::code("RequestLimitExceeded"))
            .with(Signature::code("TooManyRequestsException"))
            .with(Signature::code("ConcurrentModificationException"))
            .with(Signature::code("OperationAbortedException"))
    }

    /// IAM propagation plus throttling.
    pub fn defaults() -> Self {
        Self::iam_propagation().extend(Self::throttling())
    }

    /// Parse a table from JSON: an array of `{code?, message?, class?}`.
    pub fn from_value(value: serde_json::Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }

    /// Append a signature. Earlier signatures take precedence.
    pub fn with(mut self, signature: Signature) -> Self {
        self.signatures.push(signature);
        self
    }

    /// Append a transient message signature.
    pub fn transient_message(self, message: impl Into<String>) -> Self {
        self.with(Signature::message(message))
    }

    /// Append a transient code signature.
    pub fn transient_code(self, code: impl Into<String>) -> Self {
        self.with(Signature::code(code))
    }

    /// Place `overrides` ahead of this table, so its signatures win.
    pub fn with_overrides(self, overrides: ErrorClassifier) -> Self {
        overrides.extend(self)
    }

    /// Append every signature of `other` after this table's own.
    pub fn extend(mut self, other: ErrorClassifier) -> Self {
        self.signatures.extend(other.signatures);
        self
    }

    /// The signatures, in precedence order.
    pub fn signatures(&self) -> &[Signature] {
        &self.signatures
    }

    /// Classify an error. Unmatched errors are fatal.
    pub fn classify(&self, err: &RemoteError) -> ErrorClass {
        self.signatures
            .iter()
            .find(|s| s.matches(err))
            .map_or(ErrorClass::Fatal, |s| s.class)
    }

    /// Whether the error is worth retrying.
    pub fn is_transient(&self, err: &RemoteError) -> bool {
        self.classify(err) == ErrorClass::Transient
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_unmatched_is_fatal() {
        let classifier = ErrorClassifier::new();
        assert_eq!(
            classifier.classify(&RemoteError::new("anything")),
            ErrorClass::Fatal
        );
    }

    #[test]
    fn test_iam_propagation_messages() {
        let classifier = ErrorClassifier::iam_propagation();

        let cases = [
            "InvalidArgumentException: Given IAM role arn : arn:aws:iam::123456789012:role/xxx \
             does not provide Invoke permissions on the Lambda resource : arn:aws:lambda:fn",
            "Role does not have a trust relationship allowing Cognito to assume the role",
            "The role has not the necessary trust relationship",
            "Unable to validate IAM role permission",
        ];
        for message in cases {
            assert!(
                classifier.is_transient(&RemoteError::new(message)),
                "expected transient: {}",
                message
            );
        }
        assert!(!classifier.is_transient(&RemoteError::new("Access denied")));
    }

    #[test]
    fn test_code_and_message_must_both_match() {
        let classifier = ErrorClassifier::new().with(Signature::code_and_message(
            "InvalidParameterValue",
            "has no associated IAM Roles",
        ));

        let both = RemoteError::with_code("InvalidParameterValue", "cluster has no associated IAM Roles");
        let code_only = RemoteError::with_code("InvalidParameterValue", "bad size");
        let message_only = RemoteError::new("cluster has no associated IAM Roles");

        assert_eq!(classifier.classify(&both), ErrorClass::Transient);
        assert_eq!(classifier.classify(&code_only), ErrorClass::Fatal);
        assert_eq!(classifier.classify(&message_only), ErrorClass::Fatal);
    }

    #[test]
    fn test_first_match_wins() {
        let classifier = ErrorClassifier::throttling().with_overrides(
            ErrorClassifier::new().with(
                Signature::code_and_message("ConcurrentModificationException", "being deleted")
                    .fatal(),
            ),
        );

        let racing_update = RemoteError::with_code("ConcurrentModificationException", "Try again later");
        let racing_delete =
            RemoteError::with_code("ConcurrentModificationException", "resource is being deleted");

        assert_eq!(classifier.classify(&racing_update), ErrorClass::Transient);
        assert_eq!(classifier.classify(&racing_delete), ErrorClass::Fatal);
    }

    #[test]
    fn test_empty_signature_matches_nothing() {
        let sig = Signature {
            code: None,
            message: None,
            class: ErrorClass::Transient,
        };
        assert!(!sig.matches(&RemoteError::new("x")));
    }

    #[test]
    fn test_from_value() {
        let classifier = ErrorClassifier::from_value(json!([
            {"message": "still provisioning"},
            {"code": "Gone", "class": "fatal"},
            {"code": "Busy", "message": "retry"}
        ]))
        .unwrap();

        assert_eq!(classifier.signatures().len(), 3);
        assert!(classifier.is_transient(&RemoteError::new("role still provisioning")));
        assert_eq!(classifier.classify(&RemoteError::with_code("Gone", "x")), ErrorClass::Fatal);
        assert!(classifier.is_transient(&RemoteError::with_code("Busy", "please retry")));
    }

    #[test]
    fn test_defaults_cover_throttling() {
        let classifier = ErrorClassifier::defaults();
        assert!(classifier.is_transient(&RemoteError::with_code("ThrottlingException", "Rate exceeded")));
        assert!(classifier.is_transient(&RemoteError::new("cannot assume role arn:aws:iam::1:role/r")));
    }
}
