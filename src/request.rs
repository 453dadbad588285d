//! Request descriptor and owner identity consumed by the limiter.

use http::Method;
use std::fmt;

/// Logical description of an outgoing call, supplied by the request-building layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestDescriptor {
    method: Method,
    path: String,
    required_scope: Option<String>,
}

impl RequestDescriptor {
    /// `path` is the endpoint pattern (e.g. `/characters/{character_id}/`), not the expanded URL.
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self { method, path: path.into(), required_scope: None }
    }

    /// Mark the endpoint as requiring an authorization scope. Empty means none.
    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        let scope = scope.into();
        self.required_scope = if scope.is_empty() { None } else { Some(scope) };
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn required_scope(&self) -> Option<&str> {
        self.required_scope.as_deref()
    }

    pub fn requires_scope(&self) -> bool {
        self.required_scope.is_some()
    }
}

/// Identity of the credential a call is made with, supplied by the authentication layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Owner {
    /// No credential attached.
    #[default]
    Anonymous,
    /// Credential belonging to this subject.
    Subject(i64),
}

impl Owner {
    /// Pick the bucket owner for a call.
    ///
    /// Unauthenticated calls share one bucket, authenticated calls to unscoped endpoints share
    /// the application bucket, and scoped calls are bucketed per subject.
    pub fn bind(self, descriptor: &RequestDescriptor) -> BoundOwner {
        match self {
            Owner::Anonymous => BoundOwner::Shared,
            Owner::Subject(_) if !descriptor.requires_scope() => BoundOwner::Application,
            Owner::Subject(id) => BoundOwner::Subject(id),
        }
    }
}

impl From<Option<i64>> for Owner {
    fn from(id: Option<i64>) -> Self {
        id.map_or(Owner::Anonymous, Owner::Subject)
    }
}

/// Owner half of a bucket key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum BoundOwner {
    /// Shared by every unauthenticated caller.
    Shared,
    /// Shared by every subject of this application.
    Application,
    /// A single subject.
    Subject(i64),
}

impl BoundOwner {
    pub const SHARED_KEY: i64 = -1;
    pub const APPLICATION_KEY: i64 = -2;

    /// Integer owner key: `-1` shared, `-2` application, otherwise the subject id.
    pub fn key(&self) -> i64 {
        match self {
            BoundOwner::Shared => Self::SHARED_KEY,
            BoundOwner::Application => Self::APPLICATION_KEY,
            BoundOwner::Subject(id) => *id,
        }
    }
}

impl fmt::Display for BoundOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BoundOwner::Shared => write!(f, "shared"),
            BoundOwner::Application => write!(f, "application"),
            BoundOwner::Subject(id) => write!(f, "subject:{id}"),
        }
    }
}
