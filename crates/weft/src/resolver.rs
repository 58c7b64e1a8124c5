// Copyright 2019-2026 Maravilla Labs, operated by SOLUTAS GmbH, Switzerland
// SPDX-License-Identifier: Apache-2.0
// SPDX-License-Identifier: MIT

//! Template lookup behind the [`TemplateResolver`] trait.
//!
//! The engine never touches the filesystem directly; every `@extends`,
//! `@include` and `render_file` path goes through a resolver. The bundled
//! [`FileSystemResolver`] confines lookups to a root directory and rejects
//! traversal outside it with a distinct error so callers can tell a security
//! rejection from a plain miss.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};

use crate::error::{Result, WeftError};

/// Extensions probed, in order, after the path as given.
const PROBE_EXTENSIONS: &[&str] = &["tpl", "html"];

/// A template located by a resolver.
#[derive(Debug, Clone)]
pub struct ResolvedTemplate {
    /// Normalized logical path the template was found under, extension
    /// probing applied. Stable across spellings of the same template, so
    /// the engine keys cycle detection on it.
    pub path: String,
    /// Raw template source text.
    pub source: String,
}

/// Source of template text for the engine.
///
/// Implementations must be thread-safe; one resolver instance may serve
/// concurrent renders.
pub trait TemplateResolver: Send + Sync {
    /// Whether a template exists at the logical path.
    fn exists(&self, path: &str) -> bool;

    /// Loads the template at the logical path.
    fn load(&self, path: &str) -> Result<ResolvedTemplate>;

    /// Clones the resolver into a boxed trait object.
    fn clone_box(&self) -> Box<dyn TemplateResolver>;
}

impl Clone for Box<dyn TemplateResolver> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

/// Lexically normalizes a logical path: drops `.` components and resolves
/// `..` against earlier components. Returns `None` when the path would
/// escape its root.
fn normalize_logical(path: &str) -> Option<PathBuf> {
    let mut normalized = PathBuf::new();
    for component in Path::new(path).components() {
        match component {
            Component::Normal(part) => normalized.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                if !normalized.pop() {
                    return None;
                }
            }
            // Absolute prefixes are treated as root-relative.
            Component::RootDir | Component::Prefix(_) => {}
        }
    }
    Some(normalized)
}

/// Resolver that loads templates from files under a fixed root directory.
#[derive(Debug, Clone)]
pub struct FileSystemResolver {
    root: PathBuf,
}

impl FileSystemResolver {
    /// Creates a resolver rooted at `root`. Lookups outside the root fail
    /// with [`WeftError::PathRejected`].
    pub fn new(root: impl Into<PathBuf>) -> Self {
        FileSystemResolver { root: root.into() }
    }

    /// The configured root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the normalized logical path and the canonical on-disk
    /// location of the first candidate that exists.
    fn locate(&self, logical: &str) -> Result<(String, PathBuf)> {
        let normalized = normalize_logical(logical).ok_or_else(|| WeftError::PathRejected {
            path: logical.to_string(),
        })?;

        let mut candidates = vec![normalized.clone()];
        if normalized.extension().is_none() {
            for ext in PROBE_EXTENSIONS {
                candidates.push(normalized.with_extension(ext));
            }
        }

        for relative in candidates {
            let candidate = self.root.join(&relative);
            if !candidate.is_file() {
                continue;
            }
            // Canonicalize both sides so symlinks cannot smuggle a lookup
            // outside the root.
            let canonical_root = self.root.canonicalize()?;
            let canonical = candidate.canonicalize()?;
            if !canonical.starts_with(&canonical_root) {
                tracing::debug!(path = logical, "rejected path outside template root");
                return Err(WeftError::PathRejected {
                    path: logical.to_string(),
                });
            }
            let logical_found = relative.to_string_lossy().replace('\\', "/");
            return Ok((logical_found, canonical));
        }
        Err(WeftError::NotFound {
            path: logical.to_string(),
        })
    }
}

impl TemplateResolver for FileSystemResolver {
    fn exists(&self, path: &str) -> bool {
        self.locate(path).is_ok()
    }

    fn load(&self, path: &str) -> Result<ResolvedTemplate> {
        let (logical, located) = self.locate(path)?;
        tracing::debug!(path, file = %located.display(), "loading template");
        let source = std::fs::read_to_string(&located)?;
        Ok(ResolvedTemplate {
            path: logical,
            source,
        })
    }

    fn clone_box(&self) -> Box<dyn TemplateResolver> {
        Box::new(self.clone())
    }
}

/// In-memory resolver backed by a path-to-source map.
///
/// Applies the same lexical containment rule as the filesystem resolver so
/// traversal behavior can be exercised without touching disk.
#[derive(Debug, Clone, Default)]
pub struct MemoryResolver {
    templates: HashMap<String, String>,
}

impl MemoryResolver {
    /// Creates an empty resolver.
    pub fn new() -> Self {
        MemoryResolver::default()
    }

    /// Registers a template under a logical path.
    pub fn insert(&mut self, path: impl Into<String>, source: impl Into<String>) {
        self.templates.insert(path.into(), source.into());
    }

    /// Returns the registered key that matched along with its source.
    fn locate(&self, logical: &str) -> Result<(&str, &String)> {
        let normalized = normalize_logical(logical).ok_or_else(|| WeftError::PathRejected {
            path: logical.to_string(),
        })?;
        let base = normalized.to_string_lossy().replace('\\', "/");
        let mut candidates = vec![base.clone()];
        if normalized.extension().is_none() {
            for ext in PROBE_EXTENSIONS {
                candidates.push(format!("{}.{}", base, ext));
            }
        }
        for candidate in &candidates {
            if let Some((key, source)) = self.templates.get_key_value(candidate) {
                return Ok((key.as_str(), source));
            }
        }
        Err(WeftError::NotFound {
            path: logical.to_string(),
        })
    }
}

impl TemplateResolver for MemoryResolver {
    fn exists(&self, path: &str) -> bool {
        self.locate(path).is_ok()
    }

    fn load(&self, path: &str) -> Result<ResolvedTemplate> {
        let (key, source) = self.locate(path)?;
        Ok(ResolvedTemplate {
            path: key.to_string(),
            source: source.clone(),
        })
    }

    fn clone_box(&self) -> Box<dyn TemplateResolver> {
        Box::new(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write_template(dir: &TempDir, rel: &str, content: &str) {
        let path = dir.path().join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, content).unwrap();
    }

    #[test]
    fn test_fs_loads_relative_path() {
        let dir = TempDir::new().unwrap();
        write_template(&dir, "pages/home.tpl", "<h1>Home</h1>");
        let resolver = FileSystemResolver::new(dir.path());
        let loaded = resolver.load("pages/home.tpl").unwrap();
        assert_eq!(loaded.source, "<h1>Home</h1>");
        assert_eq!(loaded.path, "pages/home.tpl");
    }

    #[test]
    fn test_fs_probes_extensions() {
        let dir = TempDir::new().unwrap();
        write_template(&dir, "card.tpl", "tpl wins");
        write_template(&dir, "footer.html", "html");
        let resolver = FileSystemResolver::new(dir.path());
        assert_eq!(resolver.load("card").unwrap().source, "tpl wins");
        assert_eq!(resolver.load("footer").unwrap().source, "html");
    }

    #[test]
    fn test_resolved_path_is_spelling_independent() {
        let dir = TempDir::new().unwrap();
        write_template(&dir, "card.tpl", "C");
        let resolver = FileSystemResolver::new(dir.path());
        assert_eq!(resolver.load("card").unwrap().path, "card.tpl");
        assert_eq!(resolver.load("card.tpl").unwrap().path, "card.tpl");
        assert_eq!(resolver.load("sub/../card").unwrap().path, "card.tpl");

        let mut memory = MemoryResolver::new();
        memory.insert("card.tpl", "C");
        assert_eq!(memory.load("card").unwrap().path, "card.tpl");
        assert_eq!(memory.load("card.tpl").unwrap().path, "card.tpl");
    }

    #[test]
    fn test_fs_rejects_traversal_before_touching_disk() {
        let dir = TempDir::new().unwrap();
        let resolver = FileSystemResolver::new(dir.path());
        let err = resolver.load("../outside.tpl").unwrap_err();
        assert_eq!(err.kind(), "path-rejected");
        // Interior `..` that stays inside the root is fine.
        write_template(&dir, "a.tpl", "a");
        assert!(resolver.exists("sub/../a.tpl"));
    }

    #[test]
    fn test_fs_missing_is_not_found() {
        let dir = TempDir::new().unwrap();
        let resolver = FileSystemResolver::new(dir.path());
        let err = resolver.load("nope").unwrap_err();
        assert_eq!(err.kind(), "not-found");
    }

    #[test]
    fn test_fs_prefix_sharing_sibling_rejected() {
        let parent = TempDir::new().unwrap();
        fs::create_dir_all(parent.path().join("views")).unwrap();
        fs::create_dir_all(parent.path().join("views-private")).unwrap();
        fs::write(parent.path().join("views-private/secret.tpl"), "s").unwrap();
        let resolver = FileSystemResolver::new(parent.path().join("views"));
        let err = resolver.load("../views-private/secret.tpl").unwrap_err();
        assert_eq!(err.kind(), "path-rejected");
    }

    #[test]
    fn test_memory_resolver_containment() {
        let mut resolver = MemoryResolver::new();
        resolver.insert("card.tpl", "C");
        assert_eq!(resolver.load("card").unwrap().source, "C");
        let err = resolver.load("../card.tpl").unwrap_err();
        assert_eq!(err.kind(), "path-rejected");
    }
}
