use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use semver::Version as SemVer;
use serde::{Deserialize, Serialize};
use strum_macros::{Display as EnumDisplay, EnumString};

use crate::scope::consts::FIRST_VERSION;
use crate::scope::digest::ObjectRef;
use crate::scope::error::{corrupt_object, Result, ScopeError};
use crate::scope::id::BitId;

/// Enum of all stored object variants, keyed by the ASCII tag that leads
/// every encoded blob.
#[derive(Debug, Hash, Eq, PartialEq, Copy, Clone, EnumString, EnumDisplay)]
pub enum ObjectType {
    #[strum(serialize = "component")]
    Component,
    #[strum(serialize = "version")]
    Version,
    #[strum(serialize = "source")]
    Source,
    #[strum(serialize = "symlink")]
    Symlink,
}

/// The kind of version bump applied when a new revision is ingested without
/// an exact version.
#[derive(Debug, Hash, Eq, PartialEq, Copy, Clone, EnumString, EnumDisplay)]
pub enum ReleaseType {
    #[strum(serialize = "major")]
    Major,
    #[strum(serialize = "minor")]
    Minor,
    #[strum(serialize = "patch")]
    Patch,
}

/// Catalog of all versions of one logical component. This is the only
/// mutable record in the store; every change to it is persisted as a fresh
/// object with a fresh ref, and the component index is repointed atomically.
#[derive(Deserialize, Serialize, Debug, Eq, PartialEq, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Component {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(rename = "box")]
    pub box_name: String,
    pub name: String,
    pub versions: BTreeMap<SemVer, ObjectRef>,
    #[serde(default)]
    pub deprecated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lang: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub binding_prefix: Option<String>,
}

/// Immutable snapshot of one release of a component.
#[derive(Deserialize, Serialize, Debug, Eq, PartialEq, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Version {
    pub main_file: String,
    pub files: Vec<VersionFile>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dists: Option<Vec<VersionFile>>,
    pub dependencies: Vec<Dependency>,
    pub flattened_dependencies: Vec<BitId>,
    pub package_dependencies: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compiler: Option<BitId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tester: Option<BitId>,
    pub log: Log,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub specs_results: Option<SpecsResults>,
}

/// A file belonging to a version, with its content stored as a `Source` blob
#[derive(Deserialize, Serialize, Debug, Eq, PartialEq, Clone)]
#[serde(rename_all = "camelCase")]
pub struct VersionFile {
    pub name: String,
    pub relative_path: String,
    pub file: ObjectRef,
}

/// A direct dependency on another component. The id must carry a version.
#[derive(Deserialize, Serialize, Debug, Eq, PartialEq, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Dependency {
    pub id: BitId,
    pub relative_path: String,
}

#[derive(Deserialize, Serialize, Debug, Eq, PartialEq, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Log {
    pub message: String,
    pub date: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
}

#[derive(Deserialize, Serialize, Debug, Eq, PartialEq, Clone)]
#[serde(rename_all = "camelCase")]
pub struct SpecsResults {
    pub pass: bool,
    pub tests: Vec<SpecResult>,
}

#[derive(Deserialize, Serialize, Debug, Eq, PartialEq, Clone)]
#[serde(rename_all = "camelCase")]
pub struct SpecResult {
    pub title: String,
    pub pass: bool,
}

/// Raw file content blob
#[derive(Debug, Eq, PartialEq, Clone)]
pub struct Source {
    contents: Vec<u8>,
}

/// Redirect from a locally-created id to the scope it was exported to.
/// At most one of a `Component` or a `Symlink` may exist for the same local
/// box and name at any time.
#[derive(Deserialize, Serialize, Debug, Eq, PartialEq, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Symlink {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(rename = "box")]
    pub box_name: String,
    pub name: String,
    pub real_scope: String,
}

/// Tagged union of everything the store can hold
#[derive(Debug, Eq, PartialEq, Clone)]
pub enum BitObject {
    Component(Component),
    Version(Version),
    Source(Source),
    Symlink(Symlink),
}

/// An object's bytes and tag, without a full decode. Used by migrations,
/// which operate on payloads directly.
#[derive(Debug, Eq, PartialEq, Clone)]
pub struct RawObject {
    pub tag: String,
    pub payload: Vec<u8>,
}

/// A component together with every object it references: its versions and
/// the sources those versions list. This is the unit remotes exchange.
#[derive(Debug, Eq, PartialEq, Clone)]
pub struct ComponentObjects {
    pub component: Component,
    pub objects: Vec<BitObject>,
}

impl Component {
    pub fn new(id: &BitId) -> Self {
        Self {
            scope: id.scope().map(Into::into),
            box_name: id.box_name().to_string(),
            name: id.name().to_string(),
            versions: BTreeMap::new(),
            deprecated: false,
            lang: None,
            binding_prefix: None,
        }
    }

    /// The id of this component, without a version
    pub fn id(&self) -> BitId {
        BitId::from_parts(
            self.scope.clone(),
            self.box_name.clone(),
            self.name.clone(),
            None,
        )
    }

    /// The greatest version in the catalog
    pub fn latest(&self) -> Option<&SemVer> {
        self.versions.keys().next_back()
    }

    pub fn version_ref(&self, version: &SemVer) -> Option<&ObjectRef> {
        self.versions.get(version)
    }

    /// Computes the version the next revision should be stored under.
    ///
    /// An exact version wins but must be greater than every existing version.
    /// Otherwise the latest version is bumped by the release type, and a
    /// component with no versions starts at `0.0.1`.
    pub fn next_version(
        &self,
        release_type: ReleaseType,
        exact_version: Option<SemVer>,
    ) -> Result<SemVer> {
        if let Some(exact) = exact_version {
            if let Some(latest) = self.latest() {
                if exact <= *latest {
                    return Err(ScopeError::IllegalArgument(format!(
                        "version {} must be greater than the current latest {}",
                        exact, latest
                    )));
                }
            }
            return Ok(exact);
        }

        match self.latest() {
            None => Ok(SemVer::from_str(FIRST_VERSION)?),
            Some(latest) => Ok(match release_type {
                ReleaseType::Major => SemVer::new(latest.major + 1, 0, 0),
                ReleaseType::Minor => SemVer::new(latest.major, latest.minor + 1, 0),
                ReleaseType::Patch => SemVer::new(latest.major, latest.minor, latest.patch + 1),
            }),
        }
    }
}

impl Version {
    /// The ids of every direct dependency
    pub fn dependency_ids(&self) -> Vec<BitId> {
        self.dependencies.iter().map(|dep| dep.id.clone()).collect()
    }

    /// Every source ref this version references, dists included
    pub fn source_refs(&self) -> Vec<ObjectRef> {
        self.files
            .iter()
            .chain(self.dists.iter().flatten())
            .map(|file| file.file.clone())
            .collect()
    }
}

impl Source {
    pub fn new(contents: Vec<u8>) -> Self {
        Self { contents }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.contents
    }
}

impl Symlink {
    pub fn new(id: &BitId, real_scope: &str) -> Self {
        Self {
            scope: id.scope().map(Into::into),
            box_name: id.box_name().to_string(),
            name: id.name().to_string(),
            real_scope: real_scope.to_string(),
        }
    }

    /// The local id this symlink is stored under
    pub fn id(&self) -> BitId {
        BitId::from_parts(
            self.scope.clone(),
            self.box_name.clone(),
            self.name.clone(),
            None,
        )
    }
}

impl BitObject {
    pub fn object_type(&self) -> ObjectType {
        match self {
            BitObject::Component(_) => ObjectType::Component,
            BitObject::Version(_) => ObjectType::Version,
            BitObject::Source(_) => ObjectType::Source,
            BitObject::Symlink(_) => ObjectType::Symlink,
        }
    }

    /// Encodes the object into its canonical tagged form:
    /// `<tag> <payload-len>\0<payload>`. Struct payloads serialize with fixed
    /// field order and sorted maps, so the encoding is stable across runs.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let payload = match self {
            BitObject::Component(component) => serde_json::to_vec(component)?,
            BitObject::Version(version) => serde_json::to_vec(version)?,
            BitObject::Source(source) => source.contents.clone(),
            BitObject::Symlink(symlink) => serde_json::to_vec(symlink)?,
        };

        Ok(tag_payload(&self.object_type().to_string(), &payload))
    }

    /// Decodes canonical tagged bytes back into a typed object
    pub fn decode(bytes: &[u8]) -> Result<BitObject> {
        RawObject::parse(bytes)?.decode()
    }

    /// The ref of this object's canonical encoding
    pub fn compute_ref(&self) -> Result<ObjectRef> {
        Ok(ObjectRef::compute(&self.encode()?))
    }
}

impl RawObject {
    pub fn new(tag: &str, payload: Vec<u8>) -> Self {
        Self {
            tag: tag.to_string(),
            payload,
        }
    }

    /// Splits canonical tagged bytes into tag and payload, verifying the
    /// recorded payload length.
    pub fn parse(bytes: &[u8]) -> Result<RawObject> {
        let not_canonical = || {
            corrupt_object(
                ObjectRef::compute(bytes),
                "object header is not canonical",
            )
        };

        let null = bytes
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(not_canonical)?;
        let header = std::str::from_utf8(&bytes[..null]).map_err(|_| not_canonical())?;
        let (tag, len) = header.split_once(' ').ok_or_else(not_canonical)?;
        let len: usize = len.parse().map_err(|_| not_canonical())?;
        let payload = &bytes[null + 1..];

        if len != payload.len() {
            return Err(corrupt_object(
                ObjectRef::compute(bytes),
                format!(
                    "declared payload length {} does not match actual length {}",
                    len,
                    payload.len()
                ),
            ));
        }

        Ok(RawObject::new(tag, payload.to_vec()))
    }

    /// Reassembles the canonical tagged bytes
    pub fn bytes(&self) -> Vec<u8> {
        tag_payload(&self.tag, &self.payload)
    }

    pub fn object_ref(&self) -> ObjectRef {
        ObjectRef::compute(&self.bytes())
    }

    /// Fully decodes the payload, rejecting tags the registry does not know
    pub fn decode(&self) -> Result<BitObject> {
        let object_type = ObjectType::from_str(&self.tag)
            .map_err(|_| ScopeError::UnknownObjectType(self.tag.clone()))?;

        let decode_err =
            |e: serde_json::Error| corrupt_object(self.object_ref(), e.to_string());

        Ok(match object_type {
            ObjectType::Component => {
                BitObject::Component(serde_json::from_slice(&self.payload).map_err(decode_err)?)
            }
            ObjectType::Version => {
                BitObject::Version(serde_json::from_slice(&self.payload).map_err(decode_err)?)
            }
            ObjectType::Source => BitObject::Source(Source::new(self.payload.clone())),
            ObjectType::Symlink => {
                BitObject::Symlink(serde_json::from_slice(&self.payload).map_err(decode_err)?)
            }
        })
    }
}

fn tag_payload(tag: &str, payload: &[u8]) -> Vec<u8> {
    let mut bytes = format!("{} {}\0", tag, payload.len()).into_bytes();
    bytes.extend_from_slice(payload);
    bytes
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::TimeZone;
    use chrono::Utc;
    use semver::Version as SemVer;

    use super::*;
    use crate::scope::id::BitId;

    fn sample_version() -> Version {
        Version {
            main_file: "index.js".to_string(),
            files: vec![VersionFile {
                name: "index.js".to_string(),
                relative_path: "index.js".to_string(),
                file: ObjectRef::compute(b"contents"),
            }],
            dists: None,
            dependencies: vec![Dependency {
                id: BitId::parse("remote1/utils/is-string@0.0.1").unwrap(),
                relative_path: "utils/is-string".to_string(),
            }],
            flattened_dependencies: vec![BitId::parse("remote1/utils/is-string@0.0.1").unwrap()],
            package_dependencies: BTreeMap::new(),
            compiler: None,
            tester: None,
            log: Log {
                message: "initial release".to_string(),
                date: Utc.timestamp_opt(1_500_000_000, 0).unwrap(),
                author: None,
            },
            specs_results: None,
        }
    }

    #[test]
    fn round_trip_component() {
        let mut component = Component::new(&BitId::parse("ui/button").unwrap());
        component.versions.insert(SemVer::new(0, 0, 1), ObjectRef::compute(b"v1"));

        let object = BitObject::Component(component);
        let decoded = BitObject::decode(&object.encode().unwrap()).unwrap();

        assert_eq!(object, decoded);
        assert_eq!(object.compute_ref().unwrap(), decoded.compute_ref().unwrap());
    }

    #[test]
    fn round_trip_version() {
        let object = BitObject::Version(sample_version());
        let decoded = BitObject::decode(&object.encode().unwrap()).unwrap();

        assert_eq!(object, decoded);
        assert_eq!(object.compute_ref().unwrap(), decoded.compute_ref().unwrap());
    }

    #[test]
    fn round_trip_source() {
        let object = BitObject::Source(Source::new(b"hello".to_vec()));
        let decoded = BitObject::decode(&object.encode().unwrap()).unwrap();

        assert_eq!(object, decoded);
    }

    #[test]
    fn round_trip_symlink() {
        let id = BitId::parse("ui/button").unwrap();
        let object = BitObject::Symlink(Symlink::new(&id, "remote1"));
        let decoded = BitObject::decode(&object.encode().unwrap()).unwrap();

        assert_eq!(object, decoded);
    }

    #[test]
    fn encoding_is_stable() {
        let object = BitObject::Version(sample_version());
        assert_eq!(object.encode().unwrap(), object.encode().unwrap());
    }

    #[test]
    fn decode_rejects_unknown_tags() {
        let bytes = tag_payload("tarball", b"{}");
        match BitObject::decode(&bytes) {
            Err(ScopeError::UnknownObjectType(tag)) => assert_eq!("tarball", tag),
            other => panic!("expected UnknownObjectType, got {:?}", other),
        }
    }

    #[test]
    fn decode_rejects_length_mismatch() {
        let bytes = b"source 99\0hello".to_vec();
        assert!(matches!(
            BitObject::decode(&bytes),
            Err(ScopeError::CorruptedObject { .. })
        ));
    }

    #[test]
    fn first_version_is_0_0_1() {
        let component = Component::new(&BitId::parse("ui/button").unwrap());
        assert_eq!(
            SemVer::new(0, 0, 1),
            component.next_version(ReleaseType::Patch, None).unwrap()
        );
    }

    #[test]
    fn bumps_follow_release_type() {
        let mut component = Component::new(&BitId::parse("ui/button").unwrap());
        component.versions.insert(SemVer::new(1, 2, 3), ObjectRef::compute(b"v"));

        assert_eq!(
            SemVer::new(2, 0, 0),
            component.next_version(ReleaseType::Major, None).unwrap()
        );
        assert_eq!(
            SemVer::new(1, 3, 0),
            component.next_version(ReleaseType::Minor, None).unwrap()
        );
        assert_eq!(
            SemVer::new(1, 2, 4),
            component.next_version(ReleaseType::Patch, None).unwrap()
        );
    }

    #[test]
    fn exact_version_must_be_greater_than_latest() {
        let mut component = Component::new(&BitId::parse("ui/button").unwrap());
        component.versions.insert(SemVer::new(0, 1, 0), ObjectRef::compute(b"v"));

        assert!(component
            .next_version(ReleaseType::Patch, Some(SemVer::new(0, 0, 9)))
            .is_err());
        assert_eq!(
            SemVer::new(2, 0, 0),
            component
                .next_version(ReleaseType::Patch, Some(SemVer::new(2, 0, 0)))
                .unwrap()
        );
    }
}
