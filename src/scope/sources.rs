//! Logical-component operations layered over the object repository.

use std::collections::{BTreeMap, HashSet};

use chrono::Utc;
use log::info;
use semver::Version as SemVer;

use crate::scope::consts::MAX_SYMLINK_HOPS;
use crate::scope::consumer::SourceFile;
use crate::scope::digest::ObjectRef;
use crate::scope::error::{component_not_found, corrupt_object, object_not_found, Result, ScopeError};
use crate::scope::id::BitId;
use crate::scope::models::{
    BitObject, Component, ComponentObjects, Dependency, Log, ReleaseType, Source, SpecsResults,
    Version, VersionFile,
};
use crate::scope::repository::ObjectRepository;

/// A new revision of a component as handed to [`SourcesRepository::add_source`]
pub struct SourceRevision {
    pub id: BitId,
    pub main_file: String,
    pub files: Vec<SourceFile>,
    pub dists: Option<Vec<SourceFile>>,
    pub package_dependencies: BTreeMap<String, String>,
    pub compiler: Option<BitId>,
    pub tester: Option<BitId>,
    pub specs_results: Option<SpecsResults>,
}

/// CRUD over logical components: resolving ids to catalogs, writing new
/// revisions, merging incoming bundles, and deleting.
pub struct SourcesRepository {
    objects: ObjectRepository,
}

impl SourcesRepository {
    pub fn new(objects: ObjectRepository) -> Self {
        Self { objects }
    }

    pub fn objects(&self) -> &ObjectRepository {
        &self.objects
    }

    pub fn objects_mut(&mut self) -> &mut ObjectRepository {
        &mut self.objects
    }

    /// Resolves an id to its current component catalog. Symlinks are
    /// followed by retrying with the symlink's real scope.
    pub fn get(&self, id: &BitId) -> Result<Option<Component>> {
        let mut current = id.without_version();

        for _ in 0..MAX_SYMLINK_HOPS {
            let object_ref = match self.objects.lookup(&current.to_string()) {
                Some(object_ref) => object_ref.clone(),
                None => return Ok(None),
            };

            match self.objects.load(&object_ref)? {
                BitObject::Component(component) => return Ok(Some(component)),
                BitObject::Symlink(symlink) => {
                    current = current.with_scope(&symlink.real_scope);
                }
                _ => {
                    return Err(corrupt_object(
                        &object_ref,
                        format!("index entry {} does not point at a component", current),
                    ));
                }
            }
        }

        Err(ScopeError::IllegalState(format!(
            "symlink chain for {} does not terminate",
            id
        )))
    }

    /// Same as `get`, but fails with `ComponentNotFound` on a miss
    pub fn get_expect(&self, id: &BitId) -> Result<Component> {
        self.get(id)?.ok_or_else(|| component_not_found(id))
    }

    /// Looks up the object stored directly under an id, without following
    /// symlinks
    pub fn get_entry(&self, id: &BitId) -> Result<Option<BitObject>> {
        match self.objects.lookup(&id.without_version().to_string()) {
            Some(object_ref) => Ok(Some(self.objects.load(object_ref)?)),
            None => Ok(None),
        }
    }

    /// Batched `get`, preserving input order
    pub fn get_many(&self, ids: &[BitId]) -> Result<Vec<(BitId, Option<Component>)>> {
        ids.iter()
            .map(|id| Ok((id.clone(), self.get(id)?)))
            .collect()
    }

    /// Returns the component plus every version it lists plus every source
    /// those versions reference. Dependency ids are not inlined.
    pub fn get_objects(&self, id: &BitId) -> Result<ComponentObjects> {
        let component = self.get_expect(id)?;
        let mut seen: HashSet<ObjectRef> = HashSet::new();
        let mut objects = Vec::new();

        for (version_num, version_ref) in &component.versions {
            let version = self.load_version(version_ref, &component, version_num)?;

            for source_ref in version.source_refs() {
                if seen.insert(source_ref.clone()) {
                    objects.push(self.objects.load(&source_ref)?);
                }
            }

            if seen.insert(version_ref.clone()) {
                objects.push(BitObject::Version(version));
            }
        }

        Ok(ComponentObjects { component, objects })
    }

    /// The write primitive: stages a new version of a component.
    ///
    /// Creates the catalog when the component is new, computes the next
    /// version, stores every file as a `Source` blob, and stages the new
    /// `Version` together with the updated catalog. Dependency ids must be
    /// fully qualified.
    pub fn add_source(
        &mut self,
        revision: SourceRevision,
        dependencies: Vec<Dependency>,
        flattened_dependencies: Vec<BitId>,
        message: &str,
        exact_version: Option<SemVer>,
        release_type: ReleaseType,
    ) -> Result<(Component, SemVer)> {
        for dependency in &dependencies {
            if dependency.id.version().is_none() {
                return Err(ScopeError::IllegalArgument(format!(
                    "dependency {} must carry a version",
                    dependency.id
                )));
            }
        }

        let mut component = self
            .get(&revision.id)?
            .unwrap_or_else(|| Component::new(&revision.id));

        let next = component.next_version(release_type, exact_version)?;

        let files = self.add_files(revision.files)?;
        let dists = match revision.dists {
            Some(dists) if !dists.is_empty() => Some(self.add_files(dists)?),
            _ => None,
        };

        let version = Version {
            main_file: revision.main_file,
            files,
            dists,
            dependencies,
            flattened_dependencies: dedup_ids(flattened_dependencies),
            package_dependencies: revision.package_dependencies,
            compiler: revision.compiler,
            tester: revision.tester,
            log: Log {
                message: message.to_string(),
                date: Utc::now(),
                author: None,
            },
            specs_results: revision.specs_results,
        };

        let version_ref = self.objects.add(&BitObject::Version(version))?;
        component.versions.insert(next.clone(), version_ref);
        self.stage_component(&component)?;

        info!("Staged {}@{}", component.id(), next);

        Ok((component, next))
    }

    /// Stages an already-built version under the next patch bump. Used when
    /// a new revision is derived from a stored one rather than from a
    /// working copy.
    pub fn put_additional_version(
        &mut self,
        mut component: Component,
        mut version: Version,
        message: &str,
    ) -> Result<(Component, SemVer)> {
        let next = component.next_version(ReleaseType::Patch, None)?;

        version.log = Log {
            message: message.to_string(),
            date: Utc::now(),
            author: None,
        };

        let version_ref = self.objects.add(&BitObject::Version(version))?;
        component.versions.insert(next.clone(), version_ref);
        self.stage_component(&component)?;

        Ok((component, next))
    }

    /// Merges an incoming bundle into the store.
    ///
    /// Objects absent locally are added; identical refs are skipped. When a
    /// catalog for the same id already exists the two version maps are
    /// unioned, and a version present on both sides must map to the same ref
    /// or the merge fails with `MergeConflict`. Unless
    /// `ignore_missing_objects` is set, every version ref the merged catalog
    /// lists must be present after the merge.
    pub fn merge(
        &mut self,
        incoming: ComponentObjects,
        ignore_missing_objects: bool,
    ) -> Result<Component> {
        for object in &incoming.objects {
            let object_ref = object.compute_ref()?;
            if !self.objects.contains(&object_ref) {
                self.objects.add(object)?;
            }
        }

        let id = incoming.component.id();
        let merged = match self.get_entry(&id)? {
            None => incoming.component,
            Some(BitObject::Component(existing)) => {
                merge_versions(existing, &incoming.component)?
            }
            Some(BitObject::Symlink(_)) => {
                return Err(ScopeError::IllegalState(format!(
                    "cannot merge {} over a symlink",
                    id
                )));
            }
            Some(other) => {
                return Err(corrupt_object(
                    other.compute_ref()?,
                    format!("index entry {} does not point at a component", id),
                ));
            }
        };

        if !ignore_missing_objects {
            for (version_num, version_ref) in &merged.versions {
                if !self.objects.contains(version_ref) {
                    return Err(object_not_found(format!(
                        "{} (version {} of {})",
                        version_ref, version_num, id
                    )));
                }
            }
        }

        self.stage_component(&merged)?;

        Ok(merged)
    }

    /// Removes a component, or one version of it.
    ///
    /// With `delete_all_versions`, or when the id has no version, the whole
    /// catalog and every object only it references are removed. Otherwise
    /// only the named version is dropped along with blobs no remaining
    /// version references; dropping the last version removes the catalog.
    pub fn clean(&mut self, id: &BitId, delete_all_versions: bool) -> Result<()> {
        let key = id.without_version().to_string();

        let component = match self.get_entry(id)? {
            None => return Ok(()),
            Some(BitObject::Symlink(_)) => {
                if let Some(object_ref) = self.objects.lookup(&key).cloned() {
                    self.objects.remove(&object_ref);
                    self.objects.remove_index(&key);
                }
                return Ok(());
            }
            Some(BitObject::Component(component)) => component,
            Some(other) => {
                return Err(corrupt_object(
                    other.compute_ref()?,
                    format!("index entry {} does not point at a component", key),
                ));
            }
        };

        match id.version() {
            Some(version_num) if !delete_all_versions => {
                self.remove_component_version(component, version_num, &key)
            }
            _ => self.remove_component(component, &key),
        }
    }

    fn remove_component(&mut self, component: Component, key: &str) -> Result<()> {
        for (version_num, version_ref) in &component.versions {
            let version = self.load_version(version_ref, &component, version_num)?;
            self.objects.remove_many(&version.source_refs());
            self.objects.remove(version_ref);
        }

        if let Some(component_ref) = self.objects.lookup(key).cloned() {
            self.objects.remove(&component_ref);
        }
        self.objects.remove_index(key);

        info!("Removed component {}", key);

        Ok(())
    }

    fn remove_component_version(
        &mut self,
        mut component: Component,
        version_num: &SemVer,
        key: &str,
    ) -> Result<()> {
        let version_ref = match component.versions.remove(version_num) {
            Some(version_ref) => version_ref,
            None => return Ok(()),
        };

        if component.versions.is_empty() {
            component.versions.insert(version_num.clone(), version_ref);
            return self.remove_component(component, key);
        }

        let removed = self.load_version(&version_ref, &component, version_num)?;

        // sources still referenced by surviving versions stay
        let mut retained: HashSet<ObjectRef> = HashSet::new();
        for (surviving_num, surviving_ref) in &component.versions {
            let surviving = self.load_version(surviving_ref, &component, surviving_num)?;
            retained.extend(surviving.source_refs());
        }

        for source_ref in removed.source_refs() {
            if !retained.contains(&source_ref) {
                self.objects.remove(&source_ref);
            }
        }
        self.objects.remove(&version_ref);

        self.stage_component(&component)?;

        info!("Removed {}@{}", key, version_num);

        Ok(())
    }

    fn add_files(&mut self, files: Vec<SourceFile>) -> Result<Vec<VersionFile>> {
        files
            .into_iter()
            .map(|file| {
                let source_ref = self
                    .objects
                    .add(&BitObject::Source(Source::new(file.contents)))?;
                Ok(VersionFile {
                    name: file.name,
                    relative_path: file.relative_path,
                    file: source_ref,
                })
            })
            .collect()
    }

    fn load_version(
        &self,
        version_ref: &ObjectRef,
        component: &Component,
        version_num: &SemVer,
    ) -> Result<Version> {
        match self.objects.load(version_ref)? {
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

    pub(crate) fn stage_component(&mut self, component: &Component) -> Result<ObjectRef> {
        let component_ref = self
            .objects
            .add(&BitObject::Component(component.clone()))?;
        self.objects
            .set_index(component.id().to_string(), component_ref.clone());
        Ok(component_ref)
    }
}

fn dedup_ids(ids: Vec<BitId>) -> Vec<BitId> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut deduped: Vec<BitId> = ids
        .into_iter()
        .filter(|id| seen.insert(id.to_string()))
        .collect();
    deduped.sort();
    deduped
}

fn merge_versions(mut existing: Component, incoming: &Component) -> Result<Component> {
    for (version_num, incoming_ref) in &incoming.versions {
        match existing.versions.get(version_num) {
            Some(existing_ref) if existing_ref != incoming_ref => {
                return Err(ScopeError::MergeConflict {
                    id: existing.id().to_string(),
                    version: version_num.to_string(),
                });
            }
            Some(_) => {}
            None => {
                existing
                    .versions
                    .insert(version_num.clone(), incoming_ref.clone());
            }
        }
    }

    Ok(existing)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use semver::Version as SemVer;
    use tempfile::TempDir;

    use super::{SourceRevision, SourcesRepository};
    use crate::scope::consumer::SourceFile;
    use crate::scope::error::ScopeError;
    use crate::scope::id::BitId;
    use crate::scope::models::{BitObject, ReleaseType, Symlink};
    use crate::scope::repository::ObjectRepository;

    fn new_sources(root: &TempDir) -> SourcesRepository {
        SourcesRepository::new(ObjectRepository::init(root.path()).unwrap())
    }

    fn revision(id: &str, contents: &str) -> SourceRevision {
        SourceRevision {
            id: BitId::parse(id).unwrap(),
            main_file: "index.js".to_string(),
            files: vec![SourceFile {
                name: "index.js".to_string(),
                relative_path: "index.js".to_string(),
                contents: contents.as_bytes().to_vec(),
            }],
            dists: None,
            package_dependencies: BTreeMap::new(),
            compiler: None,
            tester: None,
            specs_results: None,
        }
    }

    fn add(sources: &mut SourcesRepository, id: &str, contents: &str) -> SemVer {
        let (_, version) = sources
            .add_source(
                revision(id, contents),
                vec![],
                vec![],
                "message",
                None,
                ReleaseType::Patch,
            )
            .unwrap();
        version
    }

    #[test]
    fn add_source_starts_at_first_version() {
        let root = TempDir::new().unwrap();
        let mut sources = new_sources(&root);

        let version = add(&mut sources, "ui/button", "hello");
        assert_eq!(SemVer::new(0, 0, 1), version);

        let component = sources
            .get_expect(&BitId::parse("ui/button").unwrap())
            .unwrap();
        assert_eq!(1, component.versions.len());

        let version_ref = component.version_ref(&version).unwrap();
        match sources.objects().load(version_ref).unwrap() {
            BitObject::Version(stored) => {
                let source_ref = &stored.files[0].file;
                match sources.objects().load(source_ref).unwrap() {
                    BitObject::Source(source) => assert_eq!(b"hello", source.as_bytes()),
                    other => panic!("expected source, got {:?}", other),
                }
            }
            other => panic!("expected version, got {:?}", other),
        }
    }

    #[test]
    fn add_source_bumps_existing_component() {
        let root = TempDir::new().unwrap();
        let mut sources = new_sources(&root);

        add(&mut sources, "ui/button", "one");
        let second = add(&mut sources, "ui/button", "two");

        assert_eq!(SemVer::new(0, 0, 2), second);
    }

    #[test]
    fn get_many_preserves_input_order() {
        let root = TempDir::new().unwrap();
        let mut sources = new_sources(&root);

        add(&mut sources, "ui/button", "button");
        add(&mut sources, "utils/is-string", "is-string");

        let ids = vec![
            BitId::parse("utils/is-string").unwrap(),
            BitId::parse("ui/ghost").unwrap(),
            BitId::parse("ui/button").unwrap(),
        ];
        let results = sources.get_many(&ids).unwrap();

        assert_eq!(3, results.len());
        assert_eq!("is-string", results[0].1.as_ref().unwrap().name);
        assert!(results[1].1.is_none());
        assert_eq!("button", results[2].1.as_ref().unwrap().name);
    }

    #[test]
    fn get_follows_symlinks() {
        let root = TempDir::new().unwrap();
        let mut sources = new_sources(&root);

        add(&mut sources, "remote1/ui/button", "exported");

        let local = BitId::parse("ui/button").unwrap();
        let symlink = BitObject::Symlink(Symlink::new(&local, "remote1"));
        let symlink_ref = sources.objects_mut().add(&symlink).unwrap();
        sources
            .objects_mut()
            .set_index(local.to_string(), symlink_ref);

        let component = sources.get_expect(&local).unwrap();
        assert_eq!(Some("remote1"), component.scope.as_deref());
        assert_eq!("button", component.name);
    }

    #[test]
    fn merging_own_objects_is_a_noop() {
        let root = TempDir::new().unwrap();
        let mut sources = new_sources(&root);

        let id = BitId::parse("ui/button").unwrap();
        add(&mut sources, "ui/button", "hello");

        let before = sources.get_expect(&id).unwrap();
        let bundle = sources.get_objects(&id).unwrap();
        let merged = sources.merge(bundle, false).unwrap();

        assert_eq!(before, merged);
        assert_eq!(before, sources.get_expect(&id).unwrap());
    }

    #[test]
    fn merge_rejects_conflicting_version_refs() {
        let root = TempDir::new().unwrap();
        let mut sources = new_sources(&root);

        let id = BitId::parse("ui/button").unwrap();
        add(&mut sources, "ui/button", "local contents");

        let other_root = TempDir::new().unwrap();
        let mut other = new_sources(&other_root);
        add(&mut other, "ui/button", "different contents");
        let bundle = other.get_objects(&id).unwrap();

        assert!(matches!(
            sources.merge(bundle, false),
            Err(ScopeError::MergeConflict { .. })
        ));
    }

    #[test]
    fn clean_drops_one_version_and_its_orphaned_sources() {
        let root = TempDir::new().unwrap();
        let mut sources = new_sources(&root);

        let id = BitId::parse("ui/button").unwrap();
        add(&mut sources, "ui/button", "one");
        add(&mut sources, "ui/button", "two");

        let component = sources.get_expect(&id).unwrap();
        let second = SemVer::new(0, 0, 2);
        let second_ref = component.version_ref(&second).unwrap().clone();

        sources.clean(&id.with_version(second.clone()), false).unwrap();

        let component = sources.get_expect(&id).unwrap();
        assert_eq!(1, component.versions.len());
        assert_eq!(Some(&SemVer::new(0, 0, 1)), component.latest());
        assert!(!sources.objects().contains(&second_ref));
    }

    #[test]
    fn cleaning_the_last_version_removes_the_component() {
        let root = TempDir::new().unwrap();
        let mut sources = new_sources(&root);

        let id = BitId::parse("ui/button").unwrap();
        let only = add(&mut sources, "ui/button", "hello");

        sources.clean(&id.with_version(only), false).unwrap();

        assert!(sources.get(&id).unwrap().is_none());
    }
}
