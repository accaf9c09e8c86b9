//! Content-addressed parser source store.
//!
//! Parser source lives under `<root>/<name>_<version>` (lowercased, spaces
//! and dots folded to underscores). Every write produces two files: one
//! with the language's extension and one without, so a store populated by
//! an older installer that only ever wrote the bare path still resolves.

use crate::error::{RelayError, Result};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Language {
    Python,
    Javascript,
    Bash,
}

impl Language {
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Python => "py",
            Self::Javascript => "js",
            Self::Bash => "sh",
        }
    }
}

impl std::str::FromStr for Language {
    type Err = RelayError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "python" => Ok(Self::Python),
            "javascript" | "js" => Ok(Self::Javascript),
            "bash" | "sh" => Ok(Self::Bash),
            other => Err(RelayError::LanguageNotHandled(0, other.to_string())),
        }
    }
}

/// `<name>_<version>`, lowercased, with spaces and dots replaced by
/// underscores.
pub fn slug(name: &str, version: &str) -> String {
    let fold = |s: &str| s.to_lowercase().replace([' ', '.'], "_");
    format!("{}_{}", fold(name), fold(version))
}

pub struct ParserStore {
    root: PathBuf,
}

impl ParserStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn extensioned_path(&self, name: &str, version: &str, lang: Language) -> PathBuf {
        self.root.join(format!("{}.{}", slug(name, version), lang.extension()))
    }

    fn bare_path(&self, name: &str, version: &str) -> PathBuf {
        self.root.join(slug(name, version))
    }

    /// Write `source` to both the extensioned and bare paths for
    /// `(name, version)`.
    pub fn put(&self, name: &str, version: &str, lang: Language, source: &str) -> Result<()> {
        std::fs::create_dir_all(&self.root)?;
        std::fs::write(self.extensioned_path(name, version, lang), source)?;
        std::fs::write(self.bare_path(name, version), source)?;
        Ok(())
    }

    /// Load source for `(name, version, language)`. Prefers the
    /// extensioned path; falls back to the bare path so stores written by
    /// an older layout still resolve.
    pub fn get(&self, name: &str, version: &str, lang: Language, parser_id: i64) -> Result<String> {
        let extensioned = self.extensioned_path(name, version, lang);
        if let Ok(contents) = std::fs::read_to_string(&extensioned) {
            return Ok(contents);
        }
        let bare = self.bare_path(name, version);
        std::fs::read_to_string(&bare).map_err(|_| RelayError::ParserCodeNotFound(parser_id))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slug_folds_spaces_and_dots() {
        assert_eq!(slug("Echo Parser", "v1.0"), "echo_parser_v1_0");
    }

    #[test]
    fn put_then_get_round_trips() {
        let dir = std::env::temp_dir().join(format!("relay-parser-store-test-{}", std::process::id()));
        let store = ParserStore::new(&dir);
        store.put("echo", "v1.0", Language::Python, "def parse(p, **c): return p").unwrap();

        let via_extensioned = store.get("echo", "v1.0", Language::Python, 1).unwrap();
        assert!(via_extensioned.contains("def parse"));

        assert!(dir.join("echo_v1_0.py").exists());
        assert!(dir.join("echo_v1_0").exists());

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn missing_parser_errors_with_its_id() {
        let dir = std::env::temp_dir().join(format!("relay-parser-store-missing-{}", std::process::id()));
        let store = ParserStore::new(&dir);
        let err = store.get("nope", "v1.0", Language::Python, 77).unwrap_err();
        assert!(matches!(err, RelayError::ParserCodeNotFound(77)));
    }
}
