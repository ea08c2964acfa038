use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// An error reported by the server in an `error` frame.
///
/// Remote errors are named (`BucketNotFoundError`, `EtagConflictError`, ...)
/// and may carry a chain of causes. Callers usually care about whether a
/// particular name appears anywhere in that chain, see [`RemoteError::find`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteError {
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<Box<RemoteError>>,
}

fn default_name() -> String {
    "Error".to_string()
}

impl RemoteError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            context: None,
            cause: None,
        }
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.context = Some(context);
        self
    }

    pub fn with_cause(mut self, cause: RemoteError) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Builds a remote error from the body of an `error` frame.
    ///
    /// Servers are not required to send a well-formed error object; anything
    /// that does not parse is kept as the message of a generic `Error`.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(_) => serde_json::from_value::<RemoteError>(value.clone())
                .unwrap_or_else(|_| Self::new(default_name(), value.to_string())),
            Value::String(message) => Self::new(default_name(), message),
            other => Self::new(default_name(), other.to_string()),
        }
    }

    pub fn kind(&self) -> RemoteErrorKind {
        RemoteErrorKind::from_name(&self.name)
    }

    /// Walks this error and its causes and returns the first one of `kind`.
    pub fn find(&self, kind: &RemoteErrorKind) -> Option<&RemoteError> {
        let mut current = Some(self);
        while let Some(err) = current {
            if &err.kind() == kind {
                return Some(err);
            }
            current = err.cause.as_deref();
        }
        None
    }

    /// Iterates over this error followed by each of its causes.
    pub fn chain(&self) -> impl Iterator<Item = &RemoteError> {
        std::iter::successors(Some(self), |err| err.cause.as_deref())
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

impl std::error::Error for RemoteError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_deref()
            .map(|cause| cause as &(dyn std::error::Error + 'static))
    }
}

/// Well-known remote error names.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RemoteErrorKind {
    BucketNotFound,
    BucketConflict,
    ObjectNotFound,
    EtagConflict,
    UniqueAttribute,
    InvalidQuery,
    NotIndexed,
    NotFunction,
    InvalidIndexType,
    NoDatabasePeers,
    QueryTimeout,
    Other(String),
}

impl RemoteErrorKind {
    pub fn from_name(name: &str) -> Self {
        match name {
            "BucketNotFoundError" => Self::BucketNotFound,
            "BucketConflictError" => Self::BucketConflict,
            "ObjectNotFoundError" => Self::ObjectNotFound,
            "EtagConflictError" => Self::EtagConflict,
            "UniqueAttributeError" => Self::UniqueAttribute,
            "InvalidQueryError" => Self::InvalidQuery,
            "NotIndexedError" => Self::NotIndexed,
            "NotFunctionError" => Self::NotFunction,
            "InvalidIndexTypeError" => Self::InvalidIndexType,
            "NoDatabasePeersError" => Self::NoDatabasePeers,
            "QueryTimeoutError" => Self::QueryTimeout,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::BucketNotFound => "BucketNotFoundError",
            Self::BucketConflict => "BucketConflictError",
            Self::ObjectNotFound => "ObjectNotFoundError",
            Self::EtagConflict => "EtagConflictError",
            Self::UniqueAttribute => "UniqueAttributeError",
            Self::InvalidQuery => "InvalidQueryError",
            Self::NotIndexed => "NotIndexedError",
            Self::NotFunction => "NotFunctionError",
            Self::InvalidIndexType => "InvalidIndexTypeError",
            Self::NoDatabasePeers => "NoDatabasePeersError",
            Self::QueryTimeout => "QueryTimeoutError",
            Self::Other(name) => name,
        }
    }
}

impl fmt::Display for RemoteErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
