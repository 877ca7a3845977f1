//! Gitignore-style ignore pattern matching.
//!
//! Supports the subset hosts actually feed the engine:
//! - `*` / `**` globs (compiled with `globset`)
//! - `!pattern` negation
//! - trailing `/` for directory-only patterns
//! - last-match-wins semantics, like `.gitignore`
//!
//! Workspace traversal itself is left to the `ignore` crate's
//! `WalkBuilder`; this matcher covers the extra patterns configured on the
//! engine (see `infra::config`).

use anyhow::{Context, Result};
use globset::{Glob, GlobMatcher};
use std::path::Path;

/// One parsed ignore rule.
#[derive(Debug)]
struct Rule {
    matcher: GlobMatcher,
    negated: bool,
    dir_only: bool,
}

/// Ordered ignore rules with `.gitignore`-style evaluation.
#[derive(Debug, Default)]
pub struct IgnoreMatcher {
    rules: Vec<Rule>,
}

impl IgnoreMatcher {
    /// Compile a pattern list in order. Blank lines and `#` comments are
    /// skipped, matching gitignore file conventions.
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self> {
        let mut rules = Vec::with_capacity(patterns.len());

        for raw in patterns {
            let mut pattern = raw.as_ref().trim();
            if pattern.is_empty() || pattern.starts_with('#') {
                continue;
            }

            let negated = if let Some(rest) = pattern.strip_prefix('!') {
                pattern = rest;
                true
            } else {
                false
            };

            let dir_only = if let Some(rest) = pattern.strip_suffix('/') {
                pattern = rest;
                true
            } else {
                false
            };

            // A bare name like `target` matches at any depth, as gitignore
            // does for patterns without a slash.
            let expanded = if pattern.contains('/') {
                pattern.to_string()
            } else {
                format!("**/{pattern}")
            };

            let glob = Glob::new(&expanded)
                .with_context(|| format!("invalid ignore pattern: {}", raw.as_ref()))?;

            rules.push(Rule {
                matcher: glob.compile_matcher(),
                negated,
                dir_only,
            });
        }

        Ok(Self { rules })
    }

    /// Evaluate a workspace-relative path. The last rule that matches wins;
    /// with no match the path is not ignored.
    pub fn is_ignored(&self, rel_path: &Path, is_dir: bool) -> bool {
        let mut ignored = false;

        for rule in &self.rules {
            // Directory-only patterns match the directory itself and shadow
            // everything inside it: `build/` ignores `build/out.txt`.
            let matched = if rule.dir_only {
                (is_dir && rule.matcher.is_match(rel_path))
                    || self.has_matching_ancestor(rule, rel_path)
            } else {
                rule.matcher.is_match(rel_path)
            };

            if matched {
                ignored = !rule.negated;
            }
        }

        ignored
    }

    fn has_matching_ancestor(&self, rule: &Rule, rel_path: &Path) -> bool {
        rel_path
            .ancestors()
            .skip(1) // the path itself was already tested
            .any(|a| !a.as_os_str().is_empty() && rule.matcher.is_match(a))
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
