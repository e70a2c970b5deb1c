//! Capability traits at the boundary between the scope engine and its
//! callers. The engine never executes user code itself; building, testing,
//! hook side effects, and environment module resolution are all delegated
//! through these traits.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use semver::Version as SemVer;

use crate::scope::error::Result;
use crate::scope::id::BitId;
use crate::scope::models::{Dependency, SpecsResults};
use crate::scope::repo::Scope;

/// A file belonging to a working-copy component, by value
#[derive(Debug, Eq, PartialEq, Clone)]
pub struct SourceFile {
    pub name: String,
    pub relative_path: String,
    pub contents: Vec<u8>,
}

/// A working-copy component as the consumer presents it for ingest.
///
/// `build` and `run_specs` may have side effects (package installs, emitted
/// artifacts) and are invoked strictly sequentially in dependency order.
pub trait ConsumerComponent {
    fn id(&self) -> BitId;

    fn main_file(&self) -> String;

    fn files(&self) -> Vec<SourceFile>;

    /// Direct dependencies. Ids may lack versions; ingest fills them from
    /// the batch or from the latest known version.
    fn dependencies(&self) -> Vec<Dependency>;

    fn package_dependencies(&self) -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    fn compiler(&self) -> Option<BitId> {
        None
    }

    fn tester(&self) -> Option<BitId> {
        None
    }

    /// Builds the component, returning emitted dist files if any
    fn build(&mut self, scope: &Scope) -> Result<Option<Vec<SourceFile>>>;

    /// Runs the component's specs, returning results if the component has
    /// specs to run
    fn run_specs(&mut self, scope: &Scope) -> Result<Option<SpecsResults>>;

    /// Informs the working copy of the version ingest assigned, so later
    /// components in the same batch observe the bump
    fn set_version(&mut self, version: SemVer);
}

/// Post-operation notifications. Hook failures are logged and never fail the
/// operation that triggered them.
pub trait Hooks {
    fn post_export(&self, _ids: &[String]) -> Result<()> {
        Ok(())
    }

    fn post_import(&self, _ids: &[String]) -> Result<()> {
        Ok(())
    }

    fn post_deprecate(&self, _ids: &[String]) -> Result<()> {
        Ok(())
    }

    fn post_remove(&self, _ids: &[String]) -> Result<()> {
        Ok(())
    }
}

/// The default hook set: does nothing
pub struct NoopHooks;

impl Hooks for NoopHooks {}

/// Locates the loadable module of an environment component (a compiler or
/// tester) given its main file and the scope it is stored in.
pub trait ComponentResolver {
    fn resolve(&self, id: &BitId, main_file: &str, scope_path: &Path) -> Result<PathBuf>;
}
