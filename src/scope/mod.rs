//! A content-addressed object store plus a versioned component graph.
//!
//! A [`Scope`] ingests working-copy components with their dependency
//! closures, assigns every revision an immutable identity, persists it
//! durably, and reconstructs any component with its full transitive
//! dependency set from local or remote storage.

pub use self::consumer::{ComponentResolver, ConsumerComponent, Hooks, NoopHooks, SourceFile};
pub use self::digest::ObjectRef;
pub use self::error::{Result, ScopeError};
pub use self::id::BitId;
pub use self::migrate::MigrationReport;
pub use self::models::*;
pub use self::remotes::{RemoteScope, Remotes};
pub use self::repo::{
    ComponentWithVersion, DeprecationResult, RemovedComponents, ResetResult, Scope, ScopeJson,
    VersionDependencies,
};
pub use self::repository::ObjectRepository;
pub use self::sources::{SourceRevision, SourcesRepository};

mod consts;
mod consumer;
mod digest;
mod error;
mod graph;
mod id;
mod migrate;
mod models;
mod paths;
mod remotes;
mod repo;
mod repository;
mod sources;
mod util;
