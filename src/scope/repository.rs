//! Content-addressed object storage under `<scope root>/objects`.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use log::info;
use tempfile::NamedTempFile;
use walkdir::WalkDir;

use crate::scope::digest::ObjectRef;
use crate::scope::error::{corrupt_object, object_not_found, Result, ScopeError};
use crate::scope::models::{BitObject, RawObject};
use crate::scope::{paths, util};

/// Append-mostly store of immutable blobs keyed by their content digest.
///
/// Mutations are staged in a write-back buffer and become durable only when
/// [`ObjectRepository::persist`] runs. Reads see the staged state: staged
/// additions are loadable before they hit disk and staged removals hide
/// whatever is on disk. A crash before `persist` returns leaves the store
/// exactly as the previous `persist` left it.
///
/// Alongside the blobs the repository keeps the component index, the named
/// map from component id to its current catalog ref. The index rewrite is the
/// commit point of `persist`.
pub struct ObjectRepository {
    scope_root: PathBuf,
    index: BTreeMap<String, ObjectRef>,
    staged: HashMap<ObjectRef, Vec<u8>>,
    staged_removals: HashSet<ObjectRef>,
}

impl ObjectRepository {
    /// Opens the object repository under an existing scope root
    pub fn open(scope_root: impl AsRef<Path>) -> Result<Self> {
        let scope_root = scope_root.as_ref().to_path_buf();
        let index = read_index(&scope_root)?;

        Ok(Self {
            scope_root,
            index,
            staged: HashMap::new(),
            staged_removals: HashSet::new(),
        })
    }

    /// Creates the object directories under a new scope root
    pub fn init(scope_root: impl AsRef<Path>) -> Result<Self> {
        let scope_root = scope_root.as_ref().to_path_buf();

        fs::create_dir_all(paths::objects_path(&scope_root))?;
        fs::create_dir_all(paths::tmp_path(&scope_root))?;

        Ok(Self {
            scope_root,
            index: BTreeMap::new(),
            staged: HashMap::new(),
            staged_removals: HashSet::new(),
        })
    }

    /// Stages an object for addition, returning its ref. Idempotent by
    /// digest: staging the same content twice is a no-op.
    pub fn add(&mut self, object: &BitObject) -> Result<ObjectRef> {
        let bytes = object.encode()?;
        self.add_bytes(bytes)
    }

    /// Stages an object from its raw tagged form, without decoding it
    pub fn add_raw(&mut self, raw: &RawObject) -> Result<ObjectRef> {
        self.add_bytes(raw.bytes())
    }

    pub fn add_many(&mut self, objects: &[BitObject]) -> Result<Vec<ObjectRef>> {
        objects.iter().map(|object| self.add(object)).collect()
    }

    fn add_bytes(&mut self, bytes: Vec<u8>) -> Result<ObjectRef> {
        let object_ref = ObjectRef::compute(&bytes);
        self.staged_removals.remove(&object_ref);
        self.staged.entry(object_ref.clone()).or_insert(bytes);
        Ok(object_ref)
    }

    /// Stages an object for removal
    pub fn remove(&mut self, object_ref: &ObjectRef) {
        self.staged.remove(object_ref);
        self.staged_removals.insert(object_ref.clone());
    }

    pub fn remove_many(&mut self, refs: &[ObjectRef]) {
        for object_ref in refs {
            self.remove(object_ref);
        }
    }

    pub fn contains(&self, object_ref: &ObjectRef) -> bool {
        if self.staged_removals.contains(object_ref) {
            return false;
        }
        self.staged.contains_key(object_ref)
            || paths::object_path(&self.scope_root, object_ref).exists()
    }

    /// Loads and decodes the object with the given ref
    pub fn load(&self, object_ref: &ObjectRef) -> Result<BitObject> {
        self.load_raw(object_ref)?.decode()
    }

    /// Loads an object's bytes and tag without a full decode
    pub fn load_raw(&self, object_ref: &ObjectRef) -> Result<RawObject> {
        if self.staged_removals.contains(object_ref) {
            return Err(object_not_found(object_ref));
        }

        if let Some(bytes) = self.staged.get(object_ref) {
            return RawObject::parse(bytes);
        }

        let path = paths::object_path(&self.scope_root, object_ref);
        if !path.exists() {
            return Err(object_not_found(object_ref));
        }

        let bytes = read_compressed(&path)?;

        if ObjectRef::compute(&bytes) != *object_ref {
            return Err(corrupt_object(
                object_ref,
                "stored bytes do not match the object's digest",
            ));
        }

        RawObject::parse(&bytes)
    }

    /// Scans the object directory and returns every persisted object in its
    /// raw form. Staged objects are not included.
    pub fn list_raw_objects(&self) -> Result<Vec<(ObjectRef, RawObject)>> {
        let objects_dir = paths::objects_path(&self.scope_root);
        let mut objects = Vec::new();

        if !objects_dir.exists() {
            return Ok(objects);
        }

        for entry in WalkDir::new(&objects_dir).min_depth(2).max_depth(2) {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }

            let prefix = entry
                .path()
                .parent()
                .and_then(|p| p.file_name())
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            let name = entry.file_name().to_string_lossy();
            let object_ref = match ObjectRef::from_hex(&format!("{}{}", prefix, name)) {
                Ok(object_ref) => object_ref,
                // not an object file
                Err(_) => continue,
            };

            let bytes = read_compressed(entry.path())?;
            objects.push((object_ref, RawObject::parse(&bytes)?));
        }

        Ok(objects)
    }

    /// Loads every component the index names, optionally with symlinks
    pub fn list_components(&self, include_symlinks: bool) -> Result<Vec<BitObject>> {
        let mut components = Vec::new();

        for (key, object_ref) in &self.index {
            match self.load(object_ref)? {
                component @ BitObject::Component(_) => components.push(component),
                symlink @ BitObject::Symlink(_) => {
                    if include_symlinks {
                        components.push(symlink);
                    }
                }
                _ => {
                    return Err(corrupt_object(
                        object_ref,
                        format!("index entry {} does not point at a component", key),
                    ));
                }
            }
        }

        Ok(components)
    }

    /// Resolves a component id string to its current catalog ref
    pub fn lookup(&self, key: &str) -> Option<&ObjectRef> {
        self.index.get(key)
    }

    /// Points the index entry for a component id at a new ref
    pub fn set_index(&mut self, key: String, object_ref: ObjectRef) {
        self.index.insert(key, object_ref);
    }

    pub fn remove_index(&mut self, key: &str) {
        self.index.remove(key);
    }

    /// Atomically flushes all staged additions and removals.
    ///
    /// Blobs are first written to temp files under `tmp/` and renamed into
    /// place, then the index is rewritten with a temp-file-and-rename, which
    /// is the commit point, and finally removed blobs are deleted. A failure
    /// before the index rewrite leaves no new index entries behind; extra
    /// unreferenced blobs are harmless.
    pub fn persist(&mut self) -> Result<()> {
        let tmp_dir = paths::tmp_path(&self.scope_root);
        fs::create_dir_all(&tmp_dir)?;
        fs::create_dir_all(paths::objects_path(&self.scope_root))?;

        let mut pending: Vec<(NamedTempFile, PathBuf)> = Vec::with_capacity(self.staged.len());

        for (object_ref, bytes) in &self.staged {
            let path = paths::object_path(&self.scope_root, object_ref);
            if path.exists() {
                continue;
            }

            let mut tmp = NamedTempFile::new_in(&tmp_dir)?;
            tmp.write_all(&write_compressed(bytes)?)?;
            pending.push((tmp, path));
        }

        let written = pending.len();

        for (tmp, path) in pending {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            tmp.persist(&path).map_err(|e| ScopeError::Io(e.error))?;
        }

        self.write_index(&tmp_dir)?;

        let removed = self.staged_removals.len();
        for object_ref in &self.staged_removals {
            let path = paths::object_path(&self.scope_root, object_ref);
            util::remove_file_ignore_not_found(&path)?;
            if let Some(parent) = path.parent() {
                util::remove_dir_if_empty(parent);
            }
        }

        self.staged.clear();
        self.staged_removals.clear();

        info!(
            "Persisted {} new and {} removed objects under {}",
            written,
            removed,
            self.scope_root.display()
        );

        Ok(())
    }

    fn write_index(&self, tmp_dir: &Path) -> Result<()> {
        let mut tmp = NamedTempFile::new_in(tmp_dir)?;
        serde_json::to_writer_pretty(tmp.as_file_mut(), &self.index)?;
        tmp.as_file_mut().flush()?;
        tmp.persist(paths::index_path(&self.scope_root))
            .map_err(|e| ScopeError::Io(e.error))?;
        Ok(())
    }
}

fn read_index(scope_root: &Path) -> Result<BTreeMap<String, ObjectRef>> {
    let path = paths::index_path(scope_root);

    if !path.exists() {
        return Ok(BTreeMap::new());
    }

    let file = File::open(&path)?;
    Ok(serde_json::from_reader(file)?)
}

fn read_compressed(path: &Path) -> Result<Vec<u8>> {
    let file = File::open(path)?;
    let mut decoder = ZlibDecoder::new(file);
    let mut bytes = Vec::new();
    decoder.read_to_end(&mut bytes)?;
    Ok(bytes)
}

fn write_compressed(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes)?;
    Ok(encoder.finish()?)
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::ObjectRepository;
    use crate::scope::error::ScopeError;
    use crate::scope::models::{BitObject, Source};

    fn source(contents: &str) -> BitObject {
        BitObject::Source(Source::new(contents.as_bytes().to_vec()))
    }

    #[test]
    fn staged_objects_are_loadable_before_persist() {
        let root = TempDir::new().unwrap();
        let mut repo = ObjectRepository::init(root.path()).unwrap();

        let object = source("hello");
        let object_ref = repo.add(&object).unwrap();

        assert_eq!(object, repo.load(&object_ref).unwrap());
        assert!(repo.contains(&object_ref));
    }

    #[test]
    fn persist_survives_reopen() {
        let root = TempDir::new().unwrap();
        let mut repo = ObjectRepository::init(root.path()).unwrap();

        let object = source("hello");
        let object_ref = repo.add(&object).unwrap();
        repo.set_index("ui/button".to_string(), object_ref.clone());
        repo.persist().unwrap();

        let reopened = ObjectRepository::open(root.path()).unwrap();
        assert_eq!(object, reopened.load(&object_ref).unwrap());
        assert_eq!(Some(&object_ref), reopened.lookup("ui/button"));
    }

    #[test]
    fn add_many_stages_everything() {
        let root = TempDir::new().unwrap();
        let mut repo = ObjectRepository::init(root.path()).unwrap();

        let objects = vec![source("one"), source("two"), source("three")];
        let refs = repo.add_many(&objects).unwrap();

        assert_eq!(3, refs.len());
        for (object, object_ref) in objects.iter().zip(&refs) {
            assert_eq!(*object, repo.load(object_ref).unwrap());
        }
    }

    #[test]
    fn add_is_idempotent_by_digest() {
        let root = TempDir::new().unwrap();
        let mut repo = ObjectRepository::init(root.path()).unwrap();

        let first = repo.add(&source("same")).unwrap();
        let second = repo.add(&source("same")).unwrap();

        assert_eq!(first, second);
    }

    #[test]
    fn missing_object_is_not_found() {
        let root = TempDir::new().unwrap();
        let repo = ObjectRepository::init(root.path()).unwrap();

        let object_ref = source("never added").compute_ref().unwrap();
        assert!(matches!(
            repo.load(&object_ref),
            Err(ScopeError::ObjectNotFound(_))
        ));
    }

    #[test]
    fn staged_removal_hides_persisted_object() {
        let root = TempDir::new().unwrap();
        let mut repo = ObjectRepository::init(root.path()).unwrap();

        let object_ref = repo.add(&source("doomed")).unwrap();
        repo.persist().unwrap();

        repo.remove(&object_ref);
        assert!(!repo.contains(&object_ref));
        assert!(repo.load(&object_ref).is_err());

        repo.persist().unwrap();
        let reopened = ObjectRepository::open(root.path()).unwrap();
        assert!(!reopened.contains(&object_ref));
    }

    #[test]
    fn list_components_honors_the_symlink_flag() {
        use crate::scope::id::BitId;
        use crate::scope::models::{Component, Symlink};

        let root = TempDir::new().unwrap();
        let mut repo = ObjectRepository::init(root.path()).unwrap();

        let component_id = BitId::parse("remote1/ui/button").unwrap();
        let component = BitObject::Component(Component::new(&component_id));
        let component_ref = repo.add(&component).unwrap();
        repo.set_index(component_id.to_string(), component_ref);

        let local_id = BitId::parse("ui/button").unwrap();
        let symlink = BitObject::Symlink(Symlink::new(&local_id, "remote1"));
        let symlink_ref = repo.add(&symlink).unwrap();
        repo.set_index(local_id.to_string(), symlink_ref);

        assert_eq!(1, repo.list_components(false).unwrap().len());
        assert_eq!(2, repo.list_components(true).unwrap().len());
    }

    #[test]
    fn list_raw_objects_scans_the_fan_out() {
        let root = TempDir::new().unwrap();
        let mut repo = ObjectRepository::init(root.path()).unwrap();

        let first = repo.add(&source("one")).unwrap();
        let second = repo.add(&source("two")).unwrap();
        repo.persist().unwrap();

        let mut listed: Vec<_> = repo
            .list_raw_objects()
            .unwrap()
            .into_iter()
            .map(|(object_ref, _)| object_ref)
            .collect();
        listed.sort();

        let mut expected = vec![first, second];
        expected.sort();
        assert_eq!(expected, listed);
    }

    #[test]
    fn unpersisted_staging_is_invisible_to_a_fresh_open() {
        let root = TempDir::new().unwrap();
        let mut repo = ObjectRepository::init(root.path()).unwrap();

        let object_ref = repo.add(&source("volatile")).unwrap();
        repo.set_index("ui/volatile".to_string(), object_ref.clone());

        let reopened = ObjectRepository::open(root.path()).unwrap();
        assert!(!reopened.contains(&object_ref));
        assert_eq!(None, reopened.lookup("ui/volatile"));
    }
}
