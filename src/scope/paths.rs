use std::path::{Path, PathBuf};

use crate::scope::consts::*;
use crate::scope::digest::ObjectRef;

/// Returns the path to the `objects` directory within the scope root
pub fn objects_path<P>(scope_root: P) -> PathBuf
where
    P: AsRef<Path>,
{
    scope_root.as_ref().join(OBJECTS_DIR)
}

/// Returns the path to the component index within the scope root
pub fn index_path<P>(scope_root: P) -> PathBuf
where
    P: AsRef<Path>,
{
    objects_path(scope_root).join(INDEX_FILE)
}

/// Returns the path to the scratch directory used for in-flight writes
pub fn tmp_path<P>(scope_root: P) -> PathBuf
where
    P: AsRef<Path>,
{
    scope_root.as_ref().join(TMP_DIR)
}

/// Returns the path to `scope.json` within the scope root
pub fn scope_json_path<P>(scope_root: P) -> PathBuf
where
    P: AsRef<Path>,
{
    scope_root.as_ref().join(SCOPE_JSON_FILE)
}

/// Returns the path a ref is stored at, fanned out into a two character
/// prefix directory followed by the remainder of the digest.
pub fn object_path<P>(scope_root: P, object_ref: &ObjectRef) -> PathBuf
where
    P: AsRef<Path>,
{
    let mut path = objects_path(scope_root);
    path.push(object_ref.prefix());
    path.push(object_ref.rest());
    path
}
