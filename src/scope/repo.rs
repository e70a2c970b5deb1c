//! The scope façade: ingest, import, export, and the maintenance
//! operations layered on top of the sources repository.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use log::{info, warn};
use semver::Version as SemVer;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::scope::consts::{
    BUMP_MESSAGE, HIDDEN_SCOPE_DIR, OBJECTS_DIR, SCOPE_FORMAT_VERSION, SCOPE_JSON_FILE,
};
use crate::scope::consumer::{ComponentResolver, ConsumerComponent, Hooks, NoopHooks, SourceFile};
use crate::scope::digest::ObjectRef;
use crate::scope::error::{
    component_not_found, corrupt_object, dependency_not_found, Result, ScopeError,
};
use crate::scope::graph;
use crate::scope::id::BitId;
use crate::scope::migrate::{self, MigrationReport};
use crate::scope::models::{
    BitObject, Component, ComponentObjects, Dependency, ReleaseType, SpecsResults, Symlink,
    Version,
};
use crate::scope::remotes::Remotes;
use crate::scope::repository::ObjectRepository;
use crate::scope::sources::{SourceRevision, SourcesRepository};
use crate::scope::paths;

/// `scope.json` serialization object
#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ScopeJson {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_name: Option<String>,
    pub version: String,
    #[serde(default)]
    pub remotes: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolver_path: Option<String>,
}

/// A component resolved to one concrete version, with that version loaded
#[derive(Debug, Eq, PartialEq, Clone)]
pub struct ComponentWithVersion {
    pub id: BitId,
    pub component: Component,
    pub version: Version,
}

/// A resolved component together with its full flattened dependency set,
/// each dependency loaded at its pinned version
#[derive(Debug, Eq, PartialEq, Clone)]
pub struct VersionDependencies {
    pub component: ComponentWithVersion,
    pub dependencies: Vec<ComponentWithVersion>,
}

/// Outcome of [`Scope::remove_many`]. When dependents block the removal,
/// `removed` is empty, `dependent_bits` maps each blocked id to the
/// components that depend on it, and nothing was modified.
#[derive(Debug, Eq, PartialEq, Clone)]
pub struct RemovedComponents {
    pub removed: Vec<BitId>,
    pub missing: Vec<BitId>,
    pub dependent_bits: BTreeMap<String, Vec<BitId>>,
}

/// Outcome of [`Scope::deprecate_many`]
#[derive(Debug, Eq, PartialEq, Clone)]
pub struct DeprecationResult {
    pub deprecated: Vec<BitId>,
    pub missing: Vec<BitId>,
}

/// Outcome of [`Scope::reset`]. The caller owns removing the matching
/// working copy.
#[derive(Debug, Eq, PartialEq, Clone)]
pub struct ResetResult {
    pub id: BitId,
    pub removed_version: SemVer,
    pub component_deleted: bool,
}

/// A local scope: the object store, its metadata, and the operations that
/// work across both.
///
/// A `Scope` exclusively owns its object directory for its lifetime; running
/// multiple processes against the same directory is not supported.
pub struct Scope {
    root: PathBuf,
    scope_json: ScopeJson,
    sources: SourcesRepository,
    remotes: Remotes,
    hooks: Box<dyn Hooks>,
    resolver: Option<Box<dyn ComponentResolver>>,
}

impl Scope {
    /// Walks up from `path` looking for a scope root: either a `.bit`
    /// directory or a directory holding `objects/` and `scope.json`.
    pub fn find_scope_root(path: &Path) -> Result<PathBuf> {
        let mut current = Some(path);

        while let Some(dir) = current {
            let hidden = dir.join(HIDDEN_SCOPE_DIR);
            if hidden.is_dir() {
                return Ok(hidden);
            }
            if dir.join(OBJECTS_DIR).is_dir() && dir.join(SCOPE_JSON_FILE).is_file() {
                return Ok(dir.to_path_buf());
            }
            current = dir.parent();
        }

        Err(ScopeError::ScopeNotFound(path.display().to_string()))
    }

    /// Opens the scope that `path` belongs to
    pub fn load(path: impl AsRef<Path>, remotes: Remotes) -> Result<Self> {
        let root = Self::find_scope_root(path.as_ref())?;
        let scope_json = read_scope_json(&root)?;
        let sources = SourcesRepository::new(ObjectRepository::open(&root)?);

        info!("Loaded scope {} at {}", scope_json.name, root.display());

        Ok(Self {
            root,
            scope_json,
            sources,
            remotes,
            hooks: Box::new(NoopHooks),
            resolver: None,
        })
    }

    /// Creates a new scope rooted at `path`. The directory must not already
    /// be a scope.
    pub fn init(path: impl AsRef<Path>, name: &str, remotes: Remotes) -> Result<Self> {
        let root = path.as_ref().to_path_buf();

        if paths::scope_json_path(&root).exists() {
            return Err(ScopeError::IllegalState(format!(
                "{} is already a scope",
                root.display()
            )));
        }

        fs::create_dir_all(&root)?;
        let sources = SourcesRepository::new(ObjectRepository::init(&root)?);

        let scope_json = ScopeJson {
            name: name.to_string(),
            group_name: None,
            version: SCOPE_FORMAT_VERSION.to_string(),
            remotes: BTreeMap::new(),
            resolver_path: None,
        };
        write_scope_json(&root, &scope_json)?;

        info!("Initialized scope {} at {}", name, root.display());

        Ok(Self {
            root,
            scope_json,
            sources,
            remotes,
            hooks: Box::new(NoopHooks),
            resolver: None,
        })
    }

    /// Opens the scope at `path`, creating it first when none exists there
    pub fn ensure(path: impl AsRef<Path>, name: &str, remotes: Remotes) -> Result<Self> {
        if paths::scope_json_path(path.as_ref()).exists() {
            Self::load(path, remotes)
        } else {
            Self::init(path, name, remotes)
        }
    }

    pub fn with_hooks(mut self, hooks: Box<dyn Hooks>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_resolver(mut self, resolver: Box<dyn ComponentResolver>) -> Self {
        self.resolver = resolver.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.scope_json.name
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn sources(&self) -> &SourcesRepository {
        &self.sources
    }

    pub fn sources_mut(&mut self) -> &mut SourcesRepository {
        &mut self.sources
    }

    /// Every component catalog this scope holds
    pub fn list(&self) -> Result<Vec<Component>> {
        Ok(self
            .sources
            .objects()
            .list_components(false)?
            .into_iter()
            .filter_map(|object| match object {
                BitObject::Component(component) => Some(component),
                _ => None,
            })
            .collect())
    }

    /// Ingests new versions of a batch of working-copy components.
    ///
    /// The batch is topologically sorted so leaves come first, then built,
    /// tested, and persisted strictly in that order. Failing specs abort the
    /// whole batch before anything is staged, unless `force` is set. The
    /// final flush is atomic: either every new version is visible
    /// afterwards, or none is.
    pub fn put_many(
        &mut self,
        components: &mut [Box<dyn ConsumerComponent>],
        message: &str,
        exact_version: Option<SemVer>,
        release_type: ReleaseType,
        force: bool,
        verbose: bool,
    ) -> Result<Vec<BitId>> {
        let nodes: Vec<(String, Vec<String>)> = components
            .iter()
            .map(|component| {
                let key = component.id().without_version().to_string();
                let dep_keys = component
                    .dependencies()
                    .iter()
                    .map(|dep| dep.id.without_version().to_string())
                    .collect();
                (key, dep_keys)
            })
            .collect();
        let order = graph::topo_sort_leaves_first(&nodes)?;

        // builds run serially; they may install shared packages
        let mut dists: HashMap<usize, Option<Vec<SourceFile>>> = HashMap::new();
        for &idx in &order {
            if verbose {
                info!("Building {}", components[idx].id());
            }
            let built = components[idx].build(self)?;
            dists.insert(idx, built);
        }

        let mut specs: HashMap<usize, Option<SpecsResults>> = HashMap::new();
        for &idx in &order {
            let id = components[idx].id();
            if verbose {
                info!("Running specs of {}", id);
            }
            let results = components[idx].run_specs(self)?;
            if !force {
                if let Some(results) = &results {
                    if !results.pass {
                        return Err(ScopeError::SpecsFailed(id.to_string()));
                    }
                }
            }
            specs.insert(idx, results);
        }

        let mut assigned: HashMap<String, SemVer> = HashMap::new();
        let mut closure_memo: HashMap<String, Vec<BitId>> = HashMap::new();
        let mut committed = Vec::with_capacity(order.len());

        for &idx in &order {
            let consumer_id = components[idx].id();
            let key = consumer_id.without_version().to_string();

            let mut dependencies = Vec::new();
            for dep in components[idx].dependencies() {
                let id = self.qualify_dependency(dep.id, &assigned)?;
                dependencies.push(Dependency {
                    id,
                    relative_path: dep.relative_path,
                });
            }

            let mut flattened = Vec::new();
            for dep in &dependencies {
                flattened.extend(self.flattened_closure(&dep.id, &mut closure_memo)?);
            }

            let revision = SourceRevision {
                id: consumer_id,
                main_file: components[idx].main_file(),
                files: components[idx].files(),
                dists: dists.remove(&idx).flatten(),
                package_dependencies: components[idx].package_dependencies(),
                compiler: components[idx].compiler(),
                tester: components[idx].tester(),
                specs_results: specs.remove(&idx).flatten(),
            };

            let (component, version) = self.sources.add_source(
                revision,
                dependencies,
                flattened,
                message,
                exact_version.clone(),
                release_type,
            )?;

            components[idx].set_version(version.clone());
            assigned.insert(key, version.clone());
            committed.push(component.id().with_version(version));
        }

        self.sources.objects_mut().persist()?;
        info!("Committed {} component version(s)", committed.len());

        Ok(committed)
    }

    /// Resolves a set of ids to their loaded form with the full dependency
    /// closure of each, fetching from remotes whatever the local store is
    /// missing. Results preserve input order.
    ///
    /// With `cache` disabled, external ids are re-fetched even when cached
    /// locally. With `with_environments`, the compilers and testers of the
    /// resolved versions are imported as well.
    pub fn import_many(
        &mut self,
        ids: &[BitId],
        with_environments: bool,
        cache: bool,
        persist: bool,
    ) -> Result<Vec<VersionDependencies>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let scope_name = self.scope_json.name.clone();
        let mut results: Vec<Option<VersionDependencies>> = vec![None; ids.len()];
        let mut to_fetch: BTreeMap<String, Vec<usize>> = BTreeMap::new();

        for (i, id) in ids.iter().enumerate() {
            if id.is_local(&scope_name) {
                results[i] = Some(self.materialize(id)?);
                continue;
            }

            let mut cached = false;
            if cache {
                if let Some(component) = self.get_local(id)? {
                    if resolve_version_num(&component, id).is_ok() {
                        results[i] = Some(self.materialize(id)?);
                        cached = true;
                    }
                }
            }

            if !cached {
                let remote_scope = id.scope().ok_or_else(|| {
                    ScopeError::IllegalState(format!("{} has no owning scope", id))
                })?;
                to_fetch.entry(remote_scope.to_string()).or_default().push(i);
            }
        }

        for (remote_scope, indices) in to_fetch {
            let fetch_ids: Vec<BitId> = indices.iter().map(|&i| ids[i].clone()).collect();
            let bundles = self
                .remotes
                .fetch_from_any(&remote_scope, &fetch_ids, false)?;

            for bundle in bundles {
                self.sources.merge(bundle, false)?;
            }

            for i in indices {
                results[i] = Some(
                    self.materialize(&ids[i])
                        .map_err(|e| into_dependency_not_found(e, &ids[i]))?,
                );
            }
        }

        let resolved: Vec<VersionDependencies> = results.into_iter().flatten().collect();

        if with_environments {
            let env_ids: Vec<BitId> = resolved
                .iter()
                .flat_map(|vd| {
                    vd.component
                        .version
                        .compiler
                        .iter()
                        .chain(vd.component.version.tester.iter())
                        .cloned()
                })
                .collect();
            if !env_ids.is_empty() {
                self.import_many_ones(&env_ids, cache, false)?;
            }
        }

        let resolved_ids: Vec<String> = resolved
            .iter()
            .map(|vd| vd.component.id.to_string())
            .collect();
        if let Err(e) = self.hooks.post_import(&resolved_ids) {
            warn!("post-import hook failed: {}", e);
        }

        if persist {
            self.sources.objects_mut().persist()?;
        }

        Ok(resolved)
    }

    /// The version-only variant of [`Scope::import_many`]: resolves each id
    /// to its head without materializing flattened dependencies.
    pub fn import_many_ones(
        &mut self,
        ids: &[BitId],
        cache: bool,
        persist: bool,
    ) -> Result<Vec<ComponentWithVersion>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let scope_name = self.scope_json.name.clone();
        let mut results: Vec<Option<ComponentWithVersion>> = vec![None; ids.len()];
        let mut to_fetch: BTreeMap<String, Vec<usize>> = BTreeMap::new();

        for (i, id) in ids.iter().enumerate() {
            if id.is_local(&scope_name) {
                let component = self
                    .get_local(id)?
                    .ok_or_else(|| component_not_found(id))?;
                results[i] = Some(self.head_of(component, id)?);
                continue;
            }

            let mut cached = false;
            if cache {
                if let Some(component) = self.get_local(id)? {
                    if resolve_version_num(&component, id).is_ok() {
                        results[i] = Some(self.head_of(component, id)?);
                        cached = true;
                    }
                }
            }

            if !cached {
                let remote_scope = id.scope().ok_or_else(|| {
                    ScopeError::IllegalState(format!("{} has no owning scope", id))
                })?;
                to_fetch.entry(remote_scope.to_string()).or_default().push(i);
            }
        }

        for (remote_scope, indices) in to_fetch {
            let fetch_ids: Vec<BitId> = indices.iter().map(|&i| ids[i].clone()).collect();
            let bundles = self.remotes.fetch_from_any(&remote_scope, &fetch_ids, true)?;

            for bundle in bundles {
                // a head-only bundle legitimately lacks older version objects
                self.sources.merge(bundle, true)?;
            }

            for i in indices {
                let component = self
                    .get_local(&ids[i])?
                    .ok_or_else(|| dependency_not_found(&ids[i]))?;
                results[i] = Some(self.head_of(component, &ids[i])?);
            }
        }

        if persist {
            self.sources.objects_mut().persist()?;
        }

        Ok(results.into_iter().flatten().collect())
    }

    /// Publishes local components to a named remote.
    ///
    /// Locally-created dependency ids inside the exported objects are
    /// rewritten to their real scope (from a matching symlink) or to the
    /// target remote; a version whose encoding changed gets a new ref and
    /// the catalog is repointed. On a successful push the local catalogs are
    /// replaced by symlinks and the exported objects are merged back under
    /// their remote id. A failed push leaves the scope untouched.
    pub fn export_many(&mut self, ids: &[BitId], remote_name: &str) -> Result<Vec<BitId>> {
        let mut bundles = Vec::with_capacity(ids.len());
        let mut exported = Vec::with_capacity(ids.len());

        for id in ids {
            let objects = self.sources.get_objects(id)?;

            if let Some(scope) = &objects.component.scope {
                if scope != remote_name {
                    return Err(ScopeError::IllegalState(format!(
                        "{} already belongs to scope {}",
                        id, scope
                    )));
                }
            }

            let bundle = self.rewrite_for_export(objects, remote_name)?;
            exported.push(bundle.component.id());
            bundles.push(bundle);
        }

        let accepted = self
            .remotes
            .resolve(remote_name)?
            .push_many(bundles.clone())?;
        info!("Remote {} accepted {:?}", remote_name, accepted);

        for (id, bundle) in ids.iter().zip(bundles) {
            self.sources.clean(&id.without_version(), true)?;

            let local_id = id.without_version().without_scope();
            let symlink = BitObject::Symlink(Symlink::new(&local_id, remote_name));
            let symlink_ref = self.sources.objects_mut().add(&symlink)?;
            self.sources
                .objects_mut()
                .set_index(local_id.to_string(), symlink_ref);

            self.sources.merge(bundle, false)?;
        }

        self.sources.objects_mut().persist()?;

        let exported_strings: Vec<String> = exported.iter().map(ToString::to_string).collect();
        if let Err(e) = self.hooks.post_export(&exported_strings) {
            warn!("post-export hook failed: {}", e);
        }

        Ok(exported)
    }

    /// Marks components deprecated
    pub fn deprecate_many(&mut self, ids: &[BitId]) -> Result<DeprecationResult> {
        let mut deprecated = Vec::new();
        let mut missing = Vec::new();

        for id in ids {
            match self.get_local(id)? {
                None => missing.push(id.clone()),
                Some(mut component) => {
                    component.deprecated = true;
                    self.sources.stage_component(&component)?;
                    deprecated.push(component.id());
                }
            }
        }

        self.sources.objects_mut().persist()?;

        let deprecated_strings: Vec<String> =
            deprecated.iter().map(ToString::to_string).collect();
        if let Err(e) = self.hooks.post_deprecate(&deprecated_strings) {
            warn!("post-deprecate hook failed: {}", e);
        }

        Ok(DeprecationResult {
            deprecated,
            missing,
        })
    }

    /// Removes components, refusing when other components still depend on
    /// them unless `force` is set. A refusal reports the dependents and
    /// modifies nothing.
    pub fn remove_many(&mut self, ids: &[BitId], force: bool) -> Result<RemovedComponents> {
        let mut found = Vec::new();
        let mut missing = Vec::new();

        for id in ids {
            if self.local_entry(id)?.is_some() {
                found.push(id.clone());
            } else {
                missing.push(id.clone());
            }
        }

        if !force {
            let dependent_bits = self.dependents_of(&found)?;
            if !dependent_bits.is_empty() {
                return Ok(RemovedComponents {
                    removed: Vec::new(),
                    missing,
                    dependent_bits,
                });
            }
        }

        for id in &found {
            self.sources.clean(&id.without_version(), true)?;

            // a symlink sharing the local key goes with the component
            let local_id = id.without_version().without_scope();
            if let Some(BitObject::Symlink(_)) = self.sources.get_entry(&local_id)? {
                self.sources.clean(&local_id, true)?;
            }
        }

        self.sources.objects_mut().persist()?;

        let removed_strings: Vec<String> = found.iter().map(ToString::to_string).collect();
        if let Err(e) = self.hooks.post_remove(&removed_strings) {
            warn!("post-remove hook failed: {}", e);
        }

        Ok(RemovedComponents {
            removed: found,
            missing,
            dependent_bits: BTreeMap::new(),
        })
    }

    /// Drops the latest version of a local component. When only one version
    /// exists the whole component is deleted. The new latest is the greatest
    /// remaining version.
    pub fn reset(&mut self, id: &BitId) -> Result<ResetResult> {
        if !id.is_local(&self.scope_json.name) {
            return Err(ScopeError::IllegalArgument(format!(
                "cannot reset {}: it belongs to another scope",
                id
            )));
        }

        let component = self
            .get_local(id)?
            .ok_or_else(|| component_not_found(id))?;
        let local_id = component.id();
        let latest = component
            .latest()
            .cloned()
            .ok_or_else(|| corrupt_empty_catalog(&local_id))?;

        let component_deleted = component.versions.len() == 1;

        if component_deleted {
            self.sources.clean(&local_id, true)?;
        } else {
            self.sources
                .clean(&local_id.with_version(latest.clone()), false)?;
        }

        self.sources.objects_mut().persist()?;

        info!(
            "Reset {}@{}{}",
            local_id,
            latest,
            if component_deleted {
                ", removing the component"
            } else {
                ""
            }
        );

        Ok(ResetResult {
            id: local_id,
            removed_version: latest,
            component_deleted,
        })
    }

    /// Cascades freshly committed versions into the components that depend
    /// on them.
    ///
    /// With `persist`, every candidate whose dependency is older than a
    /// committed version gets a new patch version with the dependency and
    /// its flattened entry repointed, and the changes are flushed. Without
    /// `persist`, candidates whose dependency is at or below a committed
    /// version are only reported.
    pub fn bump_dependencies_versions(
        &mut self,
        candidates: &[BitId],
        committed: &[BitId],
        persist: bool,
    ) -> Result<Vec<BitId>> {
        let mut updated = Vec::new();

        for candidate in candidates {
            let component = self
                .get_local(candidate)?
                .ok_or_else(|| component_not_found(candidate))?;
            let latest = match component.latest() {
                Some(latest) => latest.clone(),
                None => continue,
            };
            let mut version = self.load_version_object(&component, &latest)?;

            let mut changed = false;
            let mut pending = false;

            for dep in &mut version.dependencies {
                for committed_id in committed {
                    if !committed_id.same_component(&dep.id) {
                        continue;
                    }
                    let (committed_version, current) =
                        match (committed_id.version(), dep.id.version()) {
                            (Some(c), Some(d)) => (c, d),
                            _ => continue,
                        };

                    if persist && committed_version > current {
                        dep.id = committed_id.clone();
                        changed = true;
                    } else if !persist && committed_version >= current {
                        pending = true;
                    }
                }
            }

            if changed {
                for flat in &mut version.flattened_dependencies {
                    for committed_id in committed {
                        if committed_id.same_component(flat) {
                            *flat = committed_id.clone();
                        }
                    }
                }

                let (bumped, new_version) =
                    self.sources
                        .put_additional_version(component, version, BUMP_MESSAGE)?;
                updated.push(bumped.id().with_version(new_version));
            } else if pending {
                updated.push(candidate.clone());
            }
        }

        if persist && !updated.is_empty() {
            self.sources.objects_mut().persist()?;
        }

        Ok(updated)
    }

    /// Upgrades the on-disk format to the current version. A no-op when the
    /// recorded version is already current. The recorded version advances
    /// only after the migrated objects are durable.
    pub fn migrate(&mut self) -> Result<MigrationReport> {
        let recorded = SemVer::parse(&self.scope_json.version)?;
        let current = SemVer::parse(SCOPE_FORMAT_VERSION)?;

        if recorded >= current {
            info!("Scope {} is already at format {}", self.name(), recorded);
            return Ok(MigrationReport {
                run: false,
                success: true,
                migrated_objects: 0,
            });
        }

        let migrated = migrate::run(self.sources.objects_mut(), &recorded)?;
        self.sources.objects_mut().persist()?;

        self.scope_json.version = SCOPE_FORMAT_VERSION.to_string();
        write_scope_json(&self.root, &self.scope_json)?;

        info!(
            "Migrated scope {} from format {} to {}",
            self.name(),
            recorded,
            current
        );

        Ok(MigrationReport {
            run: true,
            success: true,
            migrated_objects: migrated,
        })
    }

    /// Resolves an environment component (a compiler or tester) to the path
    /// of its loadable module, importing it first when needed
    pub fn load_environment(&mut self, id: &BitId) -> Result<PathBuf> {
        if self.resolver.is_none() {
            return Err(ScopeError::ResolutionFailed {
                id: id.to_string(),
                message: "no component resolver configured".to_string(),
            });
        }

        let head = self
            .import_many_ones(std::slice::from_ref(id), true, true)?
            .pop()
            .ok_or_else(|| dependency_not_found(id))?;
        let main_file = head.version.main_file;

        match &self.resolver {
            Some(resolver) => resolver
                .resolve(id, &main_file, &self.root)
                .map_err(|e| ScopeError::ResolutionFailed {
                    id: id.to_string(),
                    message: e.to_string(),
                }),
            None => Err(ScopeError::ResolutionFailed {
                id: id.to_string(),
                message: "no component resolver configured".to_string(),
            }),
        }
    }

    /// Resolves an id against the local store, also trying the unexported
    /// form of ids that carry this scope's own name
    fn get_local(&self, id: &BitId) -> Result<Option<Component>> {
        if let Some(component) = self.sources.get(id)? {
            return Ok(Some(component));
        }

        if id.scope() == Some(self.scope_json.name.as_str()) {
            return self.sources.get(&id.without_scope());
        }

        Ok(None)
    }

    fn local_entry(&self, id: &BitId) -> Result<Option<BitObject>> {
        if let Some(entry) = self.sources.get_entry(id)? {
            return Ok(Some(entry));
        }

        if id.scope() == Some(self.scope_json.name.as_str()) {
            return self.sources.get_entry(&id.without_scope());
        }

        Ok(None)
    }

    /// Fills a missing dependency version from the batch's freshly assigned
    /// versions or from the resolved latest
    fn qualify_dependency(
        &mut self,
        id: BitId,
        assigned: &HashMap<String, SemVer>,
    ) -> Result<BitId> {
        if id.version().is_some() {
            return Ok(id);
        }

        let key = id.without_version().to_string();
        if let Some(version) = assigned.get(&key) {
            return Ok(id.with_version(version.clone()));
        }

        let component = self.ensure_component(&id)?;
        let latest = component
            .latest()
            .cloned()
            .ok_or_else(|| dependency_not_found(&id))?;
        Ok(id.with_version(latest))
    }

    /// The flattened closure contributed by one dependency: the dependency
    /// itself plus its own flattened set, memoized across a batch
    fn flattened_closure(
        &mut self,
        id: &BitId,
        memo: &mut HashMap<String, Vec<BitId>>,
    ) -> Result<Vec<BitId>> {
        let key = id.to_string();
        if let Some(closure) = memo.get(&key) {
            return Ok(closure.clone());
        }

        let component = self.ensure_component(id)?;
        let version_num = resolve_version_num(&component, id)?;
        let version = self.load_version_object(&component, &version_num)?;

        let mut closure = vec![component.id().with_version(version_num)];
        closure.extend(version.flattened_dependencies.iter().cloned());

        memo.insert(key, closure.clone());
        Ok(closure)
    }

    /// Returns the catalog for an id, fetching and merging it from a remote
    /// when it is external and missing (or missing the requested version)
    fn ensure_component(&mut self, id: &BitId) -> Result<Component> {
        if let Some(component) = self.get_local(id)? {
            match id.version() {
                None => return Ok(component),
                Some(version) if component.versions.contains_key(version) => {
                    return Ok(component);
                }
                Some(_) => {
                    if id.is_local(&self.scope_json.name) {
                        return Err(component_not_found(id));
                    }
                }
            }
        } else if id.is_local(&self.scope_json.name) {
            return Err(component_not_found(id));
        }

        let remote_scope = id
            .scope()
            .ok_or_else(|| component_not_found(id))?
            .to_string();

        let bundles =
            self.remotes
                .fetch_from_any(&remote_scope, std::slice::from_ref(id), false)?;
        for bundle in bundles {
            self.sources.merge(bundle, false)?;
        }

        match self.get_local(id)? {
            Some(component) => match id.version() {
                Some(version) if !component.versions.contains_key(version) => {
                    Err(dependency_not_found(id))
                }
                _ => Ok(component),
            },
            None => Err(dependency_not_found(id)),
        }
    }

    /// Loads an id as a version plus all of its flattened dependencies
    fn materialize(&mut self, id: &BitId) -> Result<VersionDependencies> {
        let component = self
            .get_local(id)?
            .ok_or_else(|| component_not_found(id))?;
        let version_num = resolve_version_num(&component, id)?;
        let version = self.load_version_object(&component, &version_num)?;

        let mut dependencies = Vec::with_capacity(version.flattened_dependencies.len());
        for dep_id in version.flattened_dependencies.clone() {
            let dep_component = self
                .ensure_component(&dep_id)
                .map_err(|e| into_dependency_not_found(e, &dep_id))?;
            let dep_version_num = resolve_version_num(&dep_component, &dep_id)
                .map_err(|e| into_dependency_not_found(e, &dep_id))?;
            let dep_version = self.load_version_object(&dep_component, &dep_version_num)?;
            dependencies.push(ComponentWithVersion {
                id: dep_component.id().with_version(dep_version_num),
                component: dep_component,
                version: dep_version,
            });
        }

        Ok(VersionDependencies {
            component: ComponentWithVersion {
                id: component.id().with_version(version_num.clone()),
                component,
                version,
            },
            dependencies,
        })
    }

    fn head_of(&self, component: Component, id: &BitId) -> Result<ComponentWithVersion> {
        let version_num = resolve_version_num(&component, id)?;
        let version = self.load_version_object(&component, &version_num)?;
        Ok(ComponentWithVersion {
            id: component.id().with_version(version_num),
            component,
            version,
        })
    }

    fn load_version_object(&self, component: &Component, version_num: &SemVer) -> Result<Version> {
        let version_ref = component
            .version_ref(version_num)
            .ok_or_else(|| component_not_found(component.id().with_version(version_num.clone())))?;

        match self.sources.objects().load(version_ref)? {
            BitObject::Version(version) => Ok(version),
            _ => Err(corrupt_object(
                version_ref,
                format!(
                    "{}@{} does not point at a version object",
                    component.id(),
                    version_num
                ),
            )),
        }
    }

    /// Rewrites a bundle for publication: the component takes the remote's
    /// scope, and locally-created dependency ids are resolved to their real
    /// scope or the target remote. Only versions whose encoding actually
    /// changed get new refs.
    fn rewrite_for_export(
        &self,
        bundle: ComponentObjects,
        remote_name: &str,
    ) -> Result<ComponentObjects> {
        let mut component = bundle.component;
        component.scope = Some(remote_name.to_string());

        let mut moved: HashMap<ObjectRef, ObjectRef> = HashMap::new();
        let mut objects = Vec::with_capacity(bundle.objects.len());

        for object in bundle.objects {
            match object {
                BitObject::Version(version) => {
                    let old_ref = BitObject::Version(version.clone()).compute_ref()?;
                    let mut version = version;
                    let changed = self.rewrite_version_scopes(&mut version, remote_name)?;
                    let object = BitObject::Version(version);

                    if changed {
                        let new_ref = object.compute_ref()?;
                        if new_ref != old_ref {
                            moved.insert(old_ref, new_ref);
                        }
                    }

                    objects.push(object);
                }
                other => objects.push(other),
            }
        }

        for version_ref in component.versions.values_mut() {
            if let Some(new_ref) = moved.get(version_ref) {
                *version_ref = new_ref.clone();
            }
        }

        Ok(ComponentObjects { component, objects })
    }

    fn rewrite_version_scopes(&self, version: &mut Version, remote_name: &str) -> Result<bool> {
        let mut changed = false;

        for dep in &mut version.dependencies {
            changed |= self.rewrite_id_scope(&mut dep.id, remote_name)?;
        }
        for id in &mut version.flattened_dependencies {
            changed |= self.rewrite_id_scope(id, remote_name)?;
        }
        if let Some(id) = &mut version.compiler {
            changed |= self.rewrite_id_scope(id, remote_name)?;
        }
        if let Some(id) = &mut version.tester {
            changed |= self.rewrite_id_scope(id, remote_name)?;
        }

        Ok(changed)
    }

    fn rewrite_id_scope(&self, id: &mut BitId, remote_name: &str) -> Result<bool> {
        if id.scope().is_some() {
            return Ok(false);
        }

        // a symlink records where the dependency already lives; otherwise it
        // is being exported along with its dependent
        let target = match self.sources.get_entry(&id.without_version())? {
            Some(BitObject::Symlink(symlink)) => symlink.real_scope,
            _ => remote_name.to_string(),
        };

        *id = id.with_scope(&target);
        Ok(true)
    }

    fn dependents_of(&self, targets: &[BitId]) -> Result<BTreeMap<String, Vec<BitId>>> {
        let target_keys: HashSet<String> = targets
            .iter()
            .map(|id| id.without_version().to_string())
            .collect();
        let mut dependents: BTreeMap<String, Vec<BitId>> = BTreeMap::new();

        for component in self.list()? {
            let component_id = component.id();
            if target_keys.contains(&component_id.to_string()) {
                continue;
            }

            for version_num in component.versions.keys() {
                let version = self.load_version_object(&component, version_num)?;
                for dep in &version.flattened_dependencies {
                    let dep_key = dep.without_version().to_string();
                    if target_keys.contains(&dep_key) {
                        let entries = dependents.entry(dep_key).or_default();
                        if !entries.contains(&component_id) {
                            entries.push(component_id.clone());
                        }
                    }
                }
            }
        }

        Ok(dependents)
    }
}

fn resolve_version_num(component: &Component, id: &BitId) -> Result<SemVer> {
    match id.version() {
        Some(version) => {
            if component.versions.contains_key(version) {
                Ok(version.clone())
            } else {
                Err(component_not_found(id))
            }
        }
        None => component
            .latest()
            .cloned()
            .ok_or_else(|| component_not_found(id)),
    }
}

fn into_dependency_not_found(e: ScopeError, id: &BitId) -> ScopeError {
    match e {
        ScopeError::ComponentNotFound(_)
        | ScopeError::ObjectNotFound(_)
        | ScopeError::RemoteScopeNotFound(_) => dependency_not_found(id),
        other => other,
    }
}

fn corrupt_empty_catalog(id: &BitId) -> ScopeError {
    ScopeError::IllegalState(format!("component {} has no versions", id))
}

fn read_scope_json(root: &Path) -> Result<ScopeJson> {
    let path = paths::scope_json_path(root);

    if !path.exists() {
        return Err(ScopeError::ScopeNotFound(root.display().to_string()));
    }

    Ok(serde_json::from_reader(File::open(path)?)?)
}

fn write_scope_json(root: &Path, scope_json: &ScopeJson) -> Result<()> {
    let tmp_dir = paths::tmp_path(root);
    fs::create_dir_all(&tmp_dir)?;

    let mut tmp = NamedTempFile::new_in(&tmp_dir)?;
    serde_json::to_writer_pretty(tmp.as_file_mut(), scope_json)?;
    tmp.as_file_mut().flush()?;
    tmp.persist(paths::scope_json_path(root))
        .map_err(|e| ScopeError::Io(e.error))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::TempDir;

    use super::Scope;
    use crate::scope::error::ScopeError;
    use crate::scope::remotes::Remotes;

    #[test]
    fn init_then_load_round_trips_the_metadata() {
        let root = TempDir::new().unwrap();

        Scope::init(root.path(), "my-scope", Remotes::new()).unwrap();
        let scope = Scope::load(root.path(), Remotes::new()).unwrap();

        assert_eq!("my-scope", scope.name());
        assert_eq!(root.path(), scope.path());
    }

    #[test]
    fn ensure_initializes_once_and_reopens_after() {
        let root = TempDir::new().unwrap();

        let scope = Scope::ensure(root.path(), "my-scope", Remotes::new()).unwrap();
        assert_eq!("my-scope", scope.name());

        // the recorded name wins over the one passed on reopen
        let scope = Scope::ensure(root.path(), "other", Remotes::new()).unwrap();
        assert_eq!("my-scope", scope.name());
    }

    #[test]
    fn init_refuses_an_existing_scope() {
        let root = TempDir::new().unwrap();

        Scope::init(root.path(), "my-scope", Remotes::new()).unwrap();
        assert!(matches!(
            Scope::init(root.path(), "other", Remotes::new()),
            Err(ScopeError::IllegalState(_))
        ));
    }

    #[test]
    fn detection_walks_up_to_a_hidden_scope_dir() {
        let root = TempDir::new().unwrap();

        let hidden = root.path().join(".bit");
        Scope::init(&hidden, "my-scope", Remotes::new()).unwrap();

        let nested = root.path().join("src").join("components");
        fs::create_dir_all(&nested).unwrap();

        assert_eq!(hidden, Scope::find_scope_root(&nested).unwrap());
    }

    #[test]
    fn detection_recognizes_a_bare_scope() {
        let root = TempDir::new().unwrap();

        Scope::init(root.path(), "bare", Remotes::new()).unwrap();
        assert_eq!(root.path(), Scope::find_scope_root(root.path()).unwrap());
    }

    #[test]
    fn detection_fails_outside_any_scope() {
        let root = TempDir::new().unwrap();
        assert!(matches!(
            Scope::find_scope_root(root.path()),
            Err(ScopeError::ScopeNotFound(_))
        ));
    }
}
