//! Schema migration of the on-disk object format.
//!
//! Migrations operate on raw objects so they can read payloads the current
//! typed model no longer accepts. Each manifest entry declares the format
//! version it produces and per-type payload transformations; the runner
//! stages replacement objects, repoints catalog refs and the component
//! index, and leaves persistence to the caller so a failed run changes
//! nothing on disk.

use std::collections::HashMap;

use log::{debug, info};
use semver::Version as SemVer;
use serde_json::Value;

use crate::scope::consts::{COMPONENT_TAG, VERSION_TAG};
use crate::scope::digest::ObjectRef;
use crate::scope::error::{corrupt_object, Result};
use crate::scope::id::BitId;
use crate::scope::models::RawObject;
use crate::scope::repository::ObjectRepository;

/// Outcome of a `migrate` call
#[derive(Debug, Eq, PartialEq, Clone)]
pub struct MigrationReport {
    /// False when the scope was already at the current format version
    pub run: bool,
    pub success: bool,
    pub migrated_objects: usize,
}

type Transform = fn(&mut Value) -> Result<bool>;

struct Migration {
    to_version: SemVer,
    component: Option<Transform>,
    version: Option<Transform>,
}

/// The ordered migration manifest. Each entry upgrades the format to its
/// `to_version`.
fn manifest() -> Vec<Migration> {
    vec![
        // 0.11.0 switched component versions from bare integers to semver
        Migration {
            to_version: SemVer::new(0, 11, 0),
            component: Some(component_versions_to_semver),
            version: Some(version_ids_to_semver),
        },
    ]
}

/// Applies every migration newer than `recorded` to all persisted objects,
/// staging the results. Returns the number of rewritten objects.
pub(crate) fn run(objects: &mut ObjectRepository, recorded: &SemVer) -> Result<usize> {
    let mut applicable: Vec<Migration> = manifest()
        .into_iter()
        .filter(|migration| migration.to_version > *recorded)
        .collect();
    applicable.sort_by(|a, b| a.to_version.cmp(&b.to_version));

    if applicable.is_empty() {
        return Ok(0);
    }

    let raw_objects = objects.list_raw_objects()?;
    let mut migrated = 0;

    // versions first, so rewritten components can repoint at the new refs
    let mut moved_refs: HashMap<ObjectRef, ObjectRef> = HashMap::new();

    for (object_ref, raw) in &raw_objects {
        if raw.tag != VERSION_TAG {
            continue;
        }

        let mut payload = parse_payload(object_ref, raw)?;
        let mut changed = false;
        for migration in &applicable {
            if let Some(transform) = migration.version {
                changed |= transform(&mut payload)?;
            }
        }

        if changed {
            let new_ref = replace_object(objects, object_ref, raw, &payload)?;
            moved_refs.insert(object_ref.clone(), new_ref);
            migrated += 1;
        }
    }

    for (object_ref, raw) in &raw_objects {
        if raw.tag != COMPONENT_TAG {
            continue;
        }

        let mut payload = parse_payload(object_ref, raw)?;
        let mut changed = false;
        for migration in &applicable {
            if let Some(transform) = migration.component {
                changed |= transform(&mut payload)?;
            }
        }
        changed |= repoint_version_refs(&mut payload, &moved_refs);

        if changed {
            let new_ref = replace_object(objects, object_ref, raw, &payload)?;
            repoint_index(objects, &payload, new_ref)?;
            migrated += 1;
        }
    }

    info!("Migrated {} object(s)", migrated);

    Ok(migrated)
}

fn parse_payload(object_ref: &ObjectRef, raw: &RawObject) -> Result<Value> {
    serde_json::from_slice(&raw.payload)
        .map_err(|e| corrupt_object(object_ref, e.to_string()))
}

fn replace_object(
    objects: &mut ObjectRepository,
    old_ref: &ObjectRef,
    raw: &RawObject,
    payload: &Value,
) -> Result<ObjectRef> {
    let new_raw = RawObject::new(&raw.tag, serde_json::to_vec(payload)?);
    let new_ref = objects.add_raw(&new_raw)?;
    objects.remove(old_ref);
    debug!("Rewrote {} {} as {}", raw.tag, old_ref, new_ref);
    Ok(new_ref)
}

fn repoint_version_refs(payload: &mut Value, moved_refs: &HashMap<ObjectRef, ObjectRef>) -> bool {
    let mut changed = false;

    if let Some(versions) = payload.get_mut("versions").and_then(Value::as_object_mut) {
        for value in versions.values_mut() {
            if let Some(old) = value.as_str().and_then(|s| ObjectRef::from_hex(s).ok()) {
                if let Some(new_ref) = moved_refs.get(&old) {
                    *value = Value::String(new_ref.to_string());
                    changed = true;
                }
            }
        }
    }

    changed
}

fn repoint_index(
    objects: &mut ObjectRepository,
    payload: &Value,
    new_ref: ObjectRef,
) -> Result<()> {
    let scope = payload
        .get("scope")
        .and_then(Value::as_str)
        .map(str::to_string);
    let box_name = payload
        .get("box")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let name = payload
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let key = BitId::from_parts(scope, box_name, name, None).to_string();
    objects.set_index(key, new_ref);
    Ok(())
}

/// Renames integer version keys (`"1"`) in a component's catalog to their
/// semver form (`"0.0.1"`)
fn component_versions_to_semver(payload: &mut Value) -> Result<bool> {
    let versions = match payload.get_mut("versions").and_then(Value::as_object_mut) {
        Some(versions) => versions,
        None => return Ok(false),
    };

    let integer_keys: Vec<String> = versions
        .keys()
        .filter(|key| key.parse::<u64>().is_ok())
        .cloned()
        .collect();

    for key in &integer_keys {
        if let (Some(value), Ok(number)) = (versions.remove(key), key.parse::<u64>()) {
            versions.insert(int_to_semver(number), value);
        }
    }

    Ok(!integer_keys.is_empty())
}

/// Rewrites integer version suffixes on dependency ids inside a version
/// payload
fn version_ids_to_semver(payload: &mut Value) -> Result<bool> {
    let mut changed = false;

    if let Some(dependencies) = payload.get_mut("dependencies").and_then(Value::as_array_mut) {
        for dependency in dependencies {
            if let Some(id) = dependency.get_mut("id") {
                changed |= rewrite_id_value(id);
            }
        }
    }

    if let Some(flattened) = payload
        .get_mut("flattenedDependencies")
        .and_then(Value::as_array_mut)
    {
        for id in flattened {
            changed |= rewrite_id_value(id);
        }
    }

    for field in ["compiler", "tester"] {
        if let Some(id) = payload.get_mut(field) {
            changed |= rewrite_id_value(id);
        }
    }

    Ok(changed)
}

fn rewrite_id_value(value: &mut Value) -> bool {
    if let Some(rewritten) = value.as_str().and_then(rewrite_integer_version) {
        *value = Value::String(rewritten);
        return true;
    }
    false
}

fn rewrite_integer_version(id: &str) -> Option<String> {
    let (path, version) = id.rsplit_once('@')?;
    let number = version.parse::<u64>().ok()?;
    Some(format!("{}@{}", path, int_to_semver(number)))
}

fn int_to_semver(number: u64) -> String {
    format!("0.0.{}", number)
}

#[cfg(test)]
mod tests {
    use semver::Version as SemVer;
    use serde_json::{json, Value};
    use tempfile::TempDir;

    use super::{component_versions_to_semver, run, version_ids_to_semver};
    use crate::scope::models::{BitObject, RawObject};
    use crate::scope::repository::ObjectRepository;

    #[test]
    fn integer_version_keys_become_semver() {
        let mut payload = json!({
            "box": "ui",
            "name": "button",
            "versions": {"1": "a", "2": "b", "0.1.0": "c"},
        });

        assert!(component_versions_to_semver(&mut payload).unwrap());
        assert_eq!(
            json!({"0.0.1": "a", "0.0.2": "b", "0.1.0": "c"}),
            payload["versions"]
        );

        assert!(!component_versions_to_semver(&mut payload).unwrap());
    }

    #[test]
    fn dependency_ids_gain_semver_suffixes() {
        let mut payload = json!({
            "dependencies": [{"id": "remote1/utils/is-string@2", "relativePath": "x"}],
            "flattenedDependencies": ["remote1/utils/is-string@2", "remote1/ui/text@0.0.3"],
            "compiler": "envs/babel@4",
        });

        assert!(version_ids_to_semver(&mut payload).unwrap());
        assert_eq!(
            Value::String("remote1/utils/is-string@0.0.2".to_string()),
            payload["dependencies"][0]["id"]
        );
        assert_eq!(
            Value::String("remote1/utils/is-string@0.0.2".to_string()),
            payload["flattenedDependencies"][0]
        );
        assert_eq!(
            Value::String("remote1/ui/text@0.0.3".to_string()),
            payload["flattenedDependencies"][1]
        );
        assert_eq!(
            Value::String("envs/babel@0.0.4".to_string()),
            payload["compiler"]
        );
    }

    #[test]
    fn run_rewrites_objects_and_repoints_the_index() {
        let root = TempDir::new().unwrap();
        let mut objects = ObjectRepository::init(root.path()).unwrap();

        let old_version = RawObject::new(
            "version",
            serde_json::to_vec(&json!({
                "mainFile": "index.js",
                "files": [],
                "dependencies": [],
                "flattenedDependencies": ["utils/is-string@1"],
                "packageDependencies": {},
                "log": {"message": "m", "date": "2017-08-01T00:00:00Z"},
            }))
            .unwrap(),
        );
        let old_version_ref = objects.add_raw(&old_version).unwrap();

        let old_component = RawObject::new(
            "component",
            serde_json::to_vec(&json!({
                "box": "ui",
                "name": "button",
                "versions": {"1": old_version_ref.to_string()},
                "deprecated": false,
            }))
            .unwrap(),
        );
        let old_component_ref = objects.add_raw(&old_component).unwrap();
        objects.set_index("ui/button".to_string(), old_component_ref.clone());
        objects.persist().unwrap();

        let migrated = run(&mut objects, &SemVer::new(0, 10, 9)).unwrap();
        assert_eq!(2, migrated);
        objects.persist().unwrap();

        let reopened = ObjectRepository::open(root.path()).unwrap();
        let new_ref = reopened.lookup("ui/button").unwrap().clone();
        assert_ne!(old_component_ref, new_ref);

        match reopened.load(&new_ref).unwrap() {
            BitObject::Component(component) => {
                let version_num = SemVer::new(0, 0, 1);
                let version_ref = component.version_ref(&version_num).unwrap();
                match reopened.load(version_ref).unwrap() {
                    BitObject::Version(version) => {
                        assert_eq!(
                            "utils/is-string@0.0.1",
                            version.flattened_dependencies[0].to_string()
                        );
                    }
                    other => panic!("expected version, got {:?}", other),
                }
            }
            other => panic!("expected component, got {:?}", other),
        }

        assert!(!reopened.contains(&old_component_ref));
        assert!(!reopened.contains(&old_version_ref));
    }

    #[test]
    fn run_is_a_noop_at_the_current_format_version() {
        let root = TempDir::new().unwrap();
        let mut objects = ObjectRepository::init(root.path()).unwrap();
        assert_eq!(0, run(&mut objects, &SemVer::new(0, 11, 0)).unwrap());
    }
}
