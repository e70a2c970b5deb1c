use core::fmt;
use std::fmt::{Debug, Display, Formatter};
use std::{error, io};

use thiserror::Error;

pub type Result<T, E = ScopeError> = core::result::Result<T, E>;

/// Application errors
#[derive(Error)]
pub enum ScopeError {
    #[error("Unable to locate a scope in {0} or any of its parent directories")]
    ScopeNotFound(String),

    #[error("Component {0} was not found")]
    ComponentNotFound(String),

    #[error("Dependency {0} could not be resolved")]
    DependencyNotFound(String),

    #[error("Object {0} was not found")]
    ObjectNotFound(String),

    #[error("Failed to resolve environment {id}: {message}")]
    ResolutionFailed { id: String, message: String },

    #[error("Remote scope {0} was not found")]
    RemoteScopeNotFound(String),

    #[error("Permission denied by remote scope {0}")]
    PermissionDenied(String),

    #[error("Merge conflict on {id}: version {version} maps to conflicting refs")]
    MergeConflict { id: String, version: String },

    #[error("Object {object_ref} is corrupt: {message}")]
    CorruptedObject {
        object_ref: String,
        message: String,
    },

    #[error("Unknown object type {0}")]
    UnknownObjectType(String),

    #[error("Specs failed for component {0}")]
    SpecsFailed(String),

    #[error("Circular dependencies detected: {0}")]
    CyclicDependency(String),

    #[error("Invalid component id: {0}")]
    InvalidId(String),

    #[error("Illegal argument: {0}")]
    IllegalArgument(String),

    #[error("Illegal state: {0}")]
    IllegalState(String),

    #[error("{0}")]
    Io(io::Error),

    #[error("{0}")]
    Wrapped(Box<dyn error::Error + Send + Sync>),
}

/// Constructs a `ScopeError::ComponentNotFound` error
pub fn component_not_found(id: impl Display) -> ScopeError {
    ScopeError::ComponentNotFound(id.to_string())
}

/// Constructs a `ScopeError::DependencyNotFound` error
pub fn dependency_not_found(id: impl Display) -> ScopeError {
    ScopeError::DependencyNotFound(id.to_string())
}

/// Constructs a `ScopeError::ObjectNotFound` error
pub fn object_not_found(object_ref: impl Display) -> ScopeError {
    ScopeError::ObjectNotFound(object_ref.to_string())
}

/// Constructs a `ScopeError::CorruptedObject` error
pub fn corrupt_object(object_ref: impl Display, message: impl Display) -> ScopeError {
    ScopeError::CorruptedObject {
        object_ref: object_ref.to_string(),
        message: message.to_string(),
    }
}

impl Debug for ScopeError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(self, f)
    }
}

impl From<io::Error> for ScopeError {
    fn from(e: io::Error) -> Self {
        ScopeError::Io(e)
    }
}

impl From<serde_json::Error> for ScopeError {
    fn from(e: serde_json::Error) -> Self {
        ScopeError::Wrapped(Box::new(e))
    }
}

impl From<semver::Error> for ScopeError {
    fn from(e: semver::Error) -> Self {
        ScopeError::Wrapped(Box::new(e))
    }
}

impl From<walkdir::Error> for ScopeError {
    fn from(e: walkdir::Error) -> Self {
        ScopeError::Wrapped(Box::new(e))
    }
}
