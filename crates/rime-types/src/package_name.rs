use std::fmt;
use std::str::FromStr;

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};
use serde::{Deserialize, Serialize};

/// Characters that must not appear verbatim in a cache file stem.
const FILE_STEM: &AsciiSet = &CONTROLS.add(b'%').add(b'/').add(b'@');

/// The name of a package in the registry, either bare (`express`) or scoped
/// (`@types/node`).
///
/// Names are case-sensitive and compared byte-for-byte. The separating slash
/// of a scoped name never becomes a directory on disk; [`PackageName::file_stem`]
/// percent-encodes it away so every package owns exactly one cache file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct PackageName(String);

impl PackageName {
    /// Validate a decoded package name.
    pub fn new(name: impl Into<String>) -> Result<Self, InvalidNameError> {
        let name = name.into();
        if name.is_empty() {
            return Err(InvalidNameError::Empty);
        }
        if name.contains('\0') || name.contains('\\') {
            return Err(InvalidNameError::Character(name));
        }
        let mut segments = name.split('/');
        let first = segments.next().unwrap_or_default();
        let second = segments.next();
        if segments.next().is_some() {
            return Err(InvalidNameError::Scope(name));
        }
        let mut has_empty_segment = false;
        let mut has_traversal_segment = false;
        for segment in [Some(first), second].into_iter().flatten() {
            if segment.is_empty() {
                has_empty_segment = true;
            }
            if segment == "." || segment == ".." {
                has_traversal_segment = true;
            }
        }
        if has_empty_segment {
            return Err(InvalidNameError::Scope(name));
        }
        if has_traversal_segment {
            return Err(InvalidNameError::Traversal(name));
        }
        if second.is_some() && !first.starts_with('@') {
            return Err(InvalidNameError::Scope(name));
        }
        Ok(Self(name))
    }

    /// Derive a package name from a request path such as `/express` or
    /// `/@types%2Fnode`, percent-decoding as needed.
    pub fn from_uri_path(path: &str) -> Result<Self, InvalidNameError> {
        let raw = path.strip_prefix('/').unwrap_or(path);
        let decoded = percent_decode_str(raw)
            .decode_utf8()
            .map_err(|_| InvalidNameError::Encoding(raw.to_string()))?;
        Self::new(decoded.into_owned())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the name is already its own lowercase form.
    pub fn is_lowercase(&self) -> bool {
        !self.0.chars().any(char::is_uppercase)
    }

    /// The file stem this package maps to on disk, with `/`, `@`, and `%`
    /// percent-encoded so scoped names stay a single path segment.
    pub fn file_stem(&self) -> String {
        utf8_percent_encode(&self.0, FILE_STEM).to_string()
    }
}

impl AsRef<str> for PackageName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PackageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for PackageName {
    type Err = InvalidNameError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        Self::new(name)
    }
}

impl<'de> Deserialize<'de> for PackageName {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::de::Deserializer<'de>,
    {
        let name = String::deserialize(deserializer)?;
        Self::new(name).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum InvalidNameError {
    #[error("package name is empty")]
    Empty,

    #[error("package name `{0}` contains a path-traversal segment")]
    Traversal(String),

    #[error("package name `{0}` contains a forbidden character")]
    Character(String),

    #[error("package name `{0}` is not a bare or `@scope/name` identifier")]
    Scope(String),

    #[error("package name `{0}` is not valid percent-encoded UTF-8")]
    Encoding(String),
}
