pub const SCOPE_JSON_FILE: &str = "scope.json";
pub const OBJECTS_DIR: &str = "objects";
pub const INDEX_FILE: &str = "index.json";
pub const TMP_DIR: &str = "tmp";
pub const HIDDEN_SCOPE_DIR: &str = ".bit";

pub const DEFAULT_BOX: &str = "global";
pub const FIRST_VERSION: &str = "0.0.1";

/// The on-disk format version written by this build.
pub const SCOPE_FORMAT_VERSION: &str = "0.11.0";

pub const COMPONENT_TAG: &str = "component";
pub const VERSION_TAG: &str = "version";

pub const REF_DIR_PREFIX_LEN: usize = 2;
pub const MAX_SYMLINK_HOPS: usize = 10;

pub const BUMP_MESSAGE: &str = "bump dependencies versions";
