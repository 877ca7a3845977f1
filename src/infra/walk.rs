//! Gitignore-aware workspace walking.
//!
//! Hosts enumerate candidate targets with this before building proposals.
//! Respects `.gitignore`, `.git/info/exclude`, and the global gitignore,
//! plus the engine's extra ignore globs from `infra::config`. Deterministic
//! ordering for stable tests.

use std::path::{Path, PathBuf};

use anyhow::Result;
use globset::{Glob, GlobSet, GlobSetBuilder};
use ignore::WalkBuilder;

use crate::infra::config::EngineConfig;

/// Gitignore-aware walker with additional ignore globs.
/// Extra globs are applied as a late filter over surviving entries.
pub struct WorkspaceWalker {
    /// Compiled set of additional ignore patterns
    ignore_patterns: GlobSet,

    /// Include hidden (dot) files; default false
    include_hidden: bool,

    /// Maximum recursion depth; default None (unbounded)
    max_depth: Option<usize>,
}

impl WorkspaceWalker {
    /// Build a walker with additional ignore patterns (e.g., "target/**",
    /// "node_modules/**", "**/*.min.js"). Patterns match on relative paths.
    pub fn new<S: AsRef<str>>(additional_ignores: &[S]) -> Result<Self> {
        let mut builder = GlobSetBuilder::new();

        for pattern in additional_ignores {
            // Directory-style entries from config ("target/") cover their
            // whole subtree.
            let p = pattern.as_ref();
            let expanded = match p.strip_suffix('/') {
                Some(stem) => format!("{stem}/**"),
                None => p.to_string(),
            };
            builder.add(Glob::new(&expanded)?);
        }

        Ok(Self {
            ignore_patterns: builder.build()?,
            include_hidden: false,
            max_depth: None,
        })
    }

    /// Walker using the engine configuration's extra ignore patterns.
    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        Self::new(&config.ignore_patterns)
    }

    pub fn with_include_hidden(mut self, include_hidden: bool) -> Self {
        self.include_hidden = include_hidden;
        self
    }

    pub fn with_max_depth(mut self, depth: Option<usize>) -> Self {
        self.max_depth = depth;
        self
    }

    /// Walk all non-ignored files under `root`, sorted for determinism.
    pub fn walk_files(&self, root: &Path) -> Vec<PathBuf> {
        let mut builder = WalkBuilder::new(root);
        builder
            // WalkBuilder::hidden(true) *skips* dotfiles; invert our flag.
            .hidden(!self.include_hidden)
            .git_ignore(true)
            .git_global(true)
            .git_exclude(true)
            .max_depth(self.max_depth);

        let mut files: Vec<PathBuf> = builder
            .build()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_some_and(|t| t.is_file()))
            .map(|entry| entry.into_path())
            .filter(|path| {
                let rel = path.strip_prefix(root).unwrap_or(path);
                !self.ignore_patterns.is_match(rel)
            })
            .collect();

        files.sort();
        files
    }
}
