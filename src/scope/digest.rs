use core::fmt;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use crate::scope::error::{Result, ScopeError};

static REF_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-f0-9]{40}$").unwrap());

/// The content digest that identifies a stored object. Every reference
/// between objects is an `ObjectRef`.
///
/// Refs are computed over an object's canonical uncompressed encoding, so
/// equivalent objects always hash identically regardless of how they are
/// stored on disk.
#[derive(Deserialize, Serialize, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Clone)]
#[serde(try_from = "String")]
#[serde(into = "String")]
pub struct ObjectRef(String);

impl ObjectRef {
    /// Computes the ref of the supplied canonical bytes
    pub fn compute(bytes: &[u8]) -> Self {
        Self(hex::encode(Sha1::digest(bytes)))
    }

    /// Parses a hex encoded digest into an `ObjectRef`
    pub fn from_hex(digest: &str) -> Result<Self> {
        let digest = digest.to_ascii_lowercase();

        if !REF_REGEX.is_match(&digest) {
            return Err(ScopeError::IllegalArgument(format!(
                "Invalid object ref {}",
                digest
            )));
        }

        Ok(Self(digest))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The leading characters used as the fan-out directory name
    pub fn prefix(&self) -> &str {
        &self.0[..crate::scope::consts::REF_DIR_PREFIX_LEN]
    }

    /// The remainder of the digest, used as the file name
    pub fn rest(&self) -> &str {
        &self.0[crate::scope::consts::REF_DIR_PREFIX_LEN..]
    }
}

impl TryFrom<String> for ObjectRef {
    type Error = ScopeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        ObjectRef::from_hex(&value)
    }
}

impl From<ObjectRef> for String {
    fn from(object_ref: ObjectRef) -> Self {
        object_ref.0
    }
}

impl FromStr for ObjectRef {
    type Err = ScopeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ObjectRef::from_hex(s)
    }
}

impl AsRef<str> for ObjectRef {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Display for ObjectRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::ObjectRef;

    #[test]
    fn compute_ref_of_known_input() {
        let object_ref = ObjectRef::compute(b"hello");
        assert_eq!("aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d", object_ref.as_str());
    }

    #[test]
    fn identical_input_hashes_identically() {
        assert_eq!(ObjectRef::compute(b"abc"), ObjectRef::compute(b"abc"));
        assert_ne!(ObjectRef::compute(b"abc"), ObjectRef::compute(b"abd"));
    }

    #[test]
    fn parse_normalizes_case() {
        let object_ref =
            ObjectRef::from_hex("AAF4C61DDCC5E8A2DABEDE0F3B482CD9AEA9434D").unwrap();
        assert_eq!("aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d", object_ref.as_str());
    }

    #[test]
    fn reject_refs_with_bad_length_or_chars() {
        assert!(ObjectRef::from_hex("abc123").is_err());
        assert!(ObjectRef::from_hex("zzf4c61ddcc5e8a2dabede0f3b482cd9aea9434d").is_err());
    }

    #[test]
    fn fan_out_splits_prefix() {
        let object_ref = ObjectRef::compute(b"hello");
        assert_eq!("aa", object_ref.prefix());
        assert_eq!("f4c61ddcc5e8a2dabede0f3b482cd9aea9434d", object_ref.rest());
    }
}
