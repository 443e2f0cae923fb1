//! Selections: which items of a revision an archive covers.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// A set of logical paths, or a wildcard pattern (`*`, `?`, `[...]`) matched
/// against full paths. `*` also matches `/`, so `Content/*` covers subfolders.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Selection {
    Paths(BTreeSet<String>),
    Pattern(String),
}

/// Canonical form of a selection; equal keys select the same items from any revision.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SelectionKey(String);

impl SelectionKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SelectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SelectionError {
    #[error("invalid pattern {pattern:?}: {reason}")]
    BadPattern { pattern: String, reason: String },
    #[error("no such item: {0}")]
    NotFound(String),
    #[error("selection is empty")]
    Empty,
}

impl Selection {
    pub fn paths<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Selection::Paths(paths.into_iter().map(Into::into).collect())
    }

    pub fn pattern(pattern: impl Into<String>) -> Self {
        Selection::Pattern(pattern.into())
    }

    /// Everything in the revision.
    pub fn all() -> Self {
        Selection::Pattern("*".to_string())
    }

    pub fn key(&self) -> SelectionKey {
        match self {
            Selection::Paths(paths) => {
                let joined: Vec<&str> = paths.iter().map(String::as_str).collect();
                SelectionKey(format!("paths:{}", joined.join("\n")))
            }
            Selection::Pattern(p) => SelectionKey(format!("pattern:{}", p)),
        }
    }

    /// Compile into a matcher. Fails on an unparsable pattern or an empty path set.
    pub fn matcher(&self) -> Result<Matcher<'_>, SelectionError> {
        match self {
            Selection::Paths(paths) if paths.is_empty() => Err(SelectionError::Empty),
            Selection::Paths(paths) => Ok(Matcher::Paths(paths)),
            Selection::Pattern(p) => glob::Pattern::new(p)
                .map(Matcher::Pattern)
                .map_err(|e| SelectionError::BadPattern {
                    pattern: p.clone(),
                    reason: e.msg.to_string(),
                }),
        }
    }
}

pub enum Matcher<'a> {
    Paths(&'a BTreeSet<String>),
    Pattern(glob::Pattern),
}

impl Matcher<'_> {
    pub fn matches(&self, path: &str) -> bool {
        match self {
            Matcher::Paths(paths) => paths.contains(path),
            Matcher::Pattern(p) => p.matches(path),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_order_does_not_change_key() {
        let a = Selection::paths(["b.pak", "a.pak"]);
        let b = Selection::paths(["a.pak", "b.pak"]);
        assert_eq!(a.key(), b.key());
        assert_ne!(a.key(), Selection::pattern("*.pak").key());
    }

    #[test]
    fn wildcard_crosses_directories() {
        let sel = Selection::pattern("Content/*.uasset");
        let m = sel.matcher().unwrap();
        assert!(m.matches("Content/Maps/Level.uasset"));
        assert!(!m.matches("Config/Default.ini"));
        assert!(Selection::all().matcher().unwrap().matches("anything/at/all"));
    }

    #[test]
    fn bad_pattern_rejected() {
        let err = Selection::pattern("Content/[").matcher().err().unwrap();
        assert!(matches!(err, SelectionError::BadPattern { .. }));
    }

    #[test]
    fn empty_path_set_rejected() {
        let sel = Selection::paths(Vec::<String>::new());
        assert_eq!(sel.matcher().err(), Some(SelectionError::Empty));
    }
}
