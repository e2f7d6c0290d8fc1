use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// normalized repository path: forward slashes, no leading slash
///
/// equal content at different keys is never merged; equal keys coming from
/// different sources are compared directly.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PathKey(String);

impl PathKey {
    /// normalize and validate a path
    pub fn new(raw: &str) -> Result<Self> {
        normalize_path(raw).map(Self)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// final path component
    pub fn file_name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }

    /// path components from the root
    pub fn components(&self) -> impl Iterator<Item = &str> {
        self.0.split('/')
    }

    /// lowercase extension without the dot
    pub fn extension(&self) -> Option<String> {
        let name = self.file_name();
        match name.rfind('.') {
            Some(0) | None => None,
            Some(idx) => Some(name[idx + 1..].to_ascii_lowercase()),
        }
    }
}

impl fmt::Display for PathKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for PathKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PathKey({})", self.0)
    }
}

impl AsRef<str> for PathKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for PathKey {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::new(&value)
    }
}

impl From<PathKey> for String {
    fn from(value: PathKey) -> Self {
        value.0
    }
}

/// normalize a raw path from any source (remote listing, archive, user input)
pub fn normalize_path(raw: &str) -> Result<String> {
    if raw.contains('\0') {
        return Err(Error::InvalidPath(format!("path contains null byte: {:?}", raw)));
    }

    let unified = raw.replace('\\', "/");
    let mut parts = Vec::new();
    for component in unified.split('/') {
        match component {
            "" | "." => continue,
            ".." => {
                return Err(Error::InvalidPath(format!("path escapes root: {}", raw)));
            }
            other => parts.push(other),
        }
    }

    if parts.is_empty() {
        return Err(Error::InvalidPath(format!("empty path: {:?}", raw)));
    }

    Ok(parts.join("/"))
}

/// selects the tracked file class (by extension) and optional path globs
#[derive(Clone, Debug, Default)]
pub struct PathFilter {
    extensions: Vec<String>,
    patterns: Vec<glob::Pattern>,
}

impl PathFilter {
    /// track files with any of the given extensions (case-insensitive)
    ///
    /// an empty list tracks every file.
    pub fn new<I, S>(extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            extensions: extensions
                .into_iter()
                .map(|e| e.as_ref().trim_start_matches('.').to_ascii_lowercase())
                .filter(|e| !e.is_empty())
                .collect(),
            patterns: vec![],
        }
    }

    /// additionally restrict to paths matching at least one glob
    pub fn with_patterns<I, S>(mut self, patterns: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for pattern in patterns {
            let pattern = pattern.as_ref();
            let compiled = glob::Pattern::new(pattern)
                .map_err(|e| Error::InvalidPattern(format!("{}: {}", pattern, e)))?;
            self.patterns.push(compiled);
        }
        Ok(self)
    }

    pub fn extensions(&self) -> &[String] {
        &self.extensions
    }

    /// whether a path belongs to the tracked set
    pub fn matches(&self, path: &PathKey) -> bool {
        self.matches_extension(path) && self.matches_patterns(path)
    }

    fn matches_extension(&self, path: &PathKey) -> bool {
        if self.extensions.is_empty() {
            return true;
        }
        path.extension()
            .map(|ext| self.extensions.iter().any(|e| *e == ext))
            .unwrap_or(false)
    }

    fn matches_patterns(&self, path: &PathKey) -> bool {
        self.patterns.is_empty() || self.patterns.iter().any(|p| p.matches(path.as_str()))
    }
}
