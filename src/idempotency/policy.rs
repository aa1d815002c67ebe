use crate::idempotency::record::StoredFailure;
use std::fmt;

/// Failure reported by a protected handler.
///
/// `descriptor` names the error kind hierarchically with `::` separators
/// (`books::ResourceManagement::AlreadyExists`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerFailure {
    pub descriptor: String,
    pub message: String,
}

impl HandlerFailure {
    pub fn new(descriptor: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            descriptor: descriptor.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for HandlerFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.descriptor, self.message)
    }
}

impl std::error::Error for HandlerFailure {}

impl From<HandlerFailure> for StoredFailure {
    fn from(failure: HandlerFailure) -> Self {
        StoredFailure::new(failure.descriptor, failure.message)
    }
}

impl From<StoredFailure> for HandlerFailure {
    fn from(failure: StoredFailure) -> Self {
        HandlerFailure::new(failure.error_descriptor, failure.message)
    }
}

/// Per-operation idempotency settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OperationPolicy {
    name: String,
    registerable: Vec<String>,
}

impl OperationPolicy {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            registerable: Vec::new(),
        }
    }

    /// Marks `kind` and every kind nested under it as registerable.
    pub fn with_registerable(mut self, kind: impl Into<String>) -> Self {
        self.registerable.push(kind.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn registerable_kinds(&self) -> &[String] {
        &self.registerable
    }

    pub fn is_registerable(&self, descriptor: &str) -> bool {
        self.registerable.iter().any(|kind| {
            descriptor == kind
                || descriptor
                    .strip_prefix(kind.as_str())
                    .map_or(false, |rest| rest.starts_with("::"))
        })
    }
}
