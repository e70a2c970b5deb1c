use core::fmt;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::Regex;
use semver::Version as SemVer;
use serde::{Deserialize, Serialize};

use crate::scope::consts::DEFAULT_BOX;
use crate::scope::error::{Result, ScopeError};

static NAME_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-zA-Z0-9_][a-zA-Z0-9_.-]*$").unwrap());

/// Identifies a logical component: an optional owning scope, a box, and a
/// name, plus an optional version.
///
/// A null scope means the component was created locally and has not been
/// exported. The string form is `[scope/]box/name[@version]`; a bare name
/// belongs to the default box.
///
/// Full equality includes the version. Comparisons that should ignore it go
/// through [`BitId::same_component`] or [`BitId::without_version`] so the
/// distinction is visible at the call site; no operation mutates an id's
/// version in place.
#[derive(Deserialize, Serialize, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Clone)]
#[serde(try_from = "String")]
#[serde(into = "String")]
pub struct BitId {
    scope: Option<String>,
    box_name: String,
    name: String,
    version: Option<SemVer>,
}

impl BitId {
    pub fn new(
        scope: Option<&str>,
        box_name: &str,
        name: &str,
        version: Option<SemVer>,
    ) -> Result<Self> {
        for part in [box_name, name].into_iter().chain(scope) {
            if !NAME_REGEX.is_match(part) {
                return Err(ScopeError::InvalidId(format!(
                    "illegal id part '{}'",
                    part
                )));
            }
        }

        Ok(Self {
            scope: scope.map(Into::into),
            box_name: box_name.to_string(),
            name: name.to_string(),
            version,
        })
    }

    /// Assembles an id from parts that are already known to be legal, such
    /// as the fields of a stored object.
    pub(crate) fn from_parts(
        scope: Option<String>,
        box_name: String,
        name: String,
        version: Option<SemVer>,
    ) -> Self {
        Self {
            scope,
            box_name,
            name,
            version,
        }
    }

    /// Parses the string form of an id. Parsing is lossless: formatting the
    /// result always reproduces the input.
    pub fn parse(id: &str) -> Result<Self> {
        let (path, version) = match id.rsplit_once('@') {
            Some((path, version)) => {
                let version = SemVer::parse(version)
                    .map_err(|e| ScopeError::InvalidId(format!("{}: {}", id, e)))?;
                (path, Some(version))
            }
            None => (id, None),
        };

        let parts: Vec<&str> = path.split('/').collect();

        match parts.as_slice() {
            [name] => Self::new(None, DEFAULT_BOX, name, version),
            [box_name, name] => Self::new(None, box_name, name, version),
            [scope, box_name, name] => Self::new(Some(scope), box_name, name, version),
            _ => Err(ScopeError::InvalidId(id.to_string())),
        }
    }

    pub fn scope(&self) -> Option<&str> {
        self.scope.as_deref()
    }

    pub fn box_name(&self) -> &str {
        &self.box_name
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> Option<&SemVer> {
        self.version.as_ref()
    }

    /// True when the id belongs to this scope: either it was created locally
    /// and never exported, or its scope is this scope's name.
    pub fn is_local(&self, scope_name: &str) -> bool {
        match &self.scope {
            Some(scope) => scope == scope_name,
            None => true,
        }
    }

    /// Returns a copy of this id with no version
    pub fn without_version(&self) -> BitId {
        BitId {
            scope: self.scope.clone(),
            box_name: self.box_name.clone(),
            name: self.name.clone(),
            version: None,
        }
    }

    /// Returns a copy of this id carrying the given version
    pub fn with_version(&self, version: SemVer) -> BitId {
        BitId {
            scope: self.scope.clone(),
            box_name: self.box_name.clone(),
            name: self.name.clone(),
            version: Some(version),
        }
    }

    /// Returns a copy of this id with no owning scope, the form a
    /// locally-created component is stored under
    pub fn without_scope(&self) -> BitId {
        BitId {
            scope: None,
            box_name: self.box_name.clone(),
            name: self.name.clone(),
            version: self.version.clone(),
        }
    }

    /// Returns a copy of this id owned by the given scope
    pub fn with_scope(&self, scope: &str) -> BitId {
        BitId {
            scope: Some(scope.to_string()),
            box_name: self.box_name.clone(),
            name: self.name.clone(),
            version: self.version.clone(),
        }
    }

    /// True when both ids name the same logical component, ignoring versions
    pub fn same_component(&self, other: &BitId) -> bool {
        self.scope == other.scope && self.box_name == other.box_name && self.name == other.name
    }
}

impl TryFrom<String> for BitId {
    type Error = ScopeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        BitId::parse(&value)
    }
}

impl From<BitId> for String {
    fn from(id: BitId) -> Self {
        id.to_string()
    }
}

impl FromStr for BitId {
    type Err = ScopeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BitId::parse(s)
    }
}

impl Display for BitId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match &self.scope {
            Some(scope) => write!(f, "{}/{}/{}", scope, self.box_name, self.name)?,
            None if self.box_name == DEFAULT_BOX => write!(f, "{}", self.name)?,
            None => write!(f, "{}/{}", self.box_name, self.name)?,
        }

        if let Some(version) = &self.version {
            write!(f, "@{}", version)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use semver::Version as SemVer;

    use super::BitId;

    #[test]
    fn parse_full_id_with_version() {
        let id = BitId::parse("remote1/ui/button@0.0.1").unwrap();
        assert_eq!(Some("remote1"), id.scope());
        assert_eq!("ui", id.box_name());
        assert_eq!("button", id.name());
        assert_eq!(Some(&SemVer::new(0, 0, 1)), id.version());
    }

    #[test]
    fn parse_local_id_without_scope() {
        let id = BitId::parse("ui/button").unwrap();
        assert_eq!(None, id.scope());
        assert_eq!("ui", id.box_name());
        assert_eq!("button", id.name());
        assert_eq!(None, id.version());
    }

    #[test]
    fn bare_name_lands_in_default_box() {
        let id = BitId::parse("left-pad").unwrap();
        assert_eq!("global", id.box_name());
        assert_eq!("left-pad", id.name());
    }

    #[test]
    fn format_is_lossless() {
        for input in [
            "left-pad",
            "ui/button",
            "remote1/ui/button",
            "left-pad@1.2.3",
            "ui/button@0.0.1",
            "remote1/global/left-pad@0.1.0",
        ] {
            assert_eq!(input, BitId::parse(input).unwrap().to_string());
        }
    }

    #[test]
    fn reject_malformed_ids() {
        assert!(BitId::parse("a/b/c/d").is_err());
        assert!(BitId::parse("ui/button@nope").is_err());
        assert!(BitId::parse("ui//button").is_err());
    }

    #[test]
    fn equality_includes_version() {
        let with_version = BitId::parse("ui/button@0.0.1").unwrap();
        let without = BitId::parse("ui/button").unwrap();

        assert_ne!(with_version, without);
        assert!(with_version.same_component(&without));
        assert_eq!(without, with_version.without_version());
    }

    #[test]
    fn locality_follows_scope() {
        assert!(BitId::parse("ui/button").unwrap().is_local("my-scope"));
        assert!(BitId::parse("my-scope/ui/button").unwrap().is_local("my-scope"));
        assert!(!BitId::parse("remote1/ui/button").unwrap().is_local("my-scope"));
    }
}
