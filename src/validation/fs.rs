//! Filesystem checks used to verify claimed file paths.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Answers whether a claimed path exists.
///
/// Kept synchronous so validation stays a plain function of its inputs.
pub trait FsChecker: Send + Sync {
    fn exists(&self, path: &Path) -> bool;
}

/// Checks the real filesystem, resolving relative paths against a workspace.
#[derive(Debug, Clone)]
pub struct WorkspaceFs {
    root: PathBuf,
}

impl WorkspaceFs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }
}

impl FsChecker for WorkspaceFs {
    fn exists(&self, path: &Path) -> bool {
        self.resolve(path).exists()
    }
}

/// Fixed set of paths that "exist". Paths are compared as written.
#[derive(Debug, Clone, Default)]
pub struct StaticFs {
    paths: HashSet<PathBuf>,
}

impl StaticFs {
    pub fn new<I, P>(paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self {
            paths: paths.into_iter().map(Into::into).collect(),
        }
    }
}

impl FsChecker for StaticFs {
    fn exists(&self, path: &Path) -> bool {
        self.paths.contains(path)
    }
}
