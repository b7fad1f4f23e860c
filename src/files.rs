//! Utilities for tree copies and exclusion filtering.

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;
use walkdir::WalkDir;
use wax::{CandidatePath, Glob, Pattern};

/// Compiled exclusion patterns, matched independently against each
/// path segment so a pattern can exclude a directory or file at any
/// depth. Matching is case-insensitive; the pattern list historically
/// targets Windows, where `readme*` is expected to catch `README.md`.
pub struct ExcludeFilter {
    globs: Vec<Glob<'static>>,
}

impl ExcludeFilter {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self> {
        let mut globs = Vec::new();
        for pattern in patterns {
            let lowered = pattern.as_ref().to_lowercase();
            let glob = Glob::new(&lowered)
                .with_context(|| format!("invalid exclusion pattern {:?}", pattern.as_ref()))?
                .into_owned();
            globs.push(glob);
        }
        Ok(Self { globs })
    }

    /// Empty filter that excludes nothing.
    pub fn none() -> Self {
        Self { globs: Vec::new() }
    }

    /// True if a single path segment matches any pattern.
    pub fn matches(&self, segment: &str) -> bool {
        let lowered = segment.to_lowercase();
        let candidate = CandidatePath::from(lowered.as_str());
        self.globs.iter().any(|g| g.matched(&candidate).is_some())
    }

    /// True if any segment of a relative path matches.
    pub fn matches_path(&self, relative: &Path) -> bool {
        relative
            .components()
            .any(|c| self.matches(&c.as_os_str().to_string_lossy()))
    }
}

/// Write a file, creating parent directories as needed.
pub fn write_file_with_dirs<P: AsRef<Path>, C: AsRef<[u8]>>(path: P, content: C) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, content)?;
    Ok(())
}

/// Copy a directory tree verbatim, replacing any existing target.
///
/// Delete-then-recreate, never merge: a unit in the output tree is
/// never a mixture of two builds.
pub fn replace_tree(src: &Path, dst: &Path) -> Result<()> {
    if dst.exists() {
        fs::remove_dir_all(dst)
            .with_context(|| format!("cannot remove stale copy {}", dst.display()))?;
    }
    copy_tree_filtered(src, dst, &ExcludeFilter::none())
}

/// Copy a directory tree, skipping any entry whose name matches the
/// exclusion filter (the filter applies at every depth).
pub fn copy_tree_filtered(src: &Path, dst: &Path, excludes: &ExcludeFilter) -> Result<()> {
    fs::create_dir_all(dst)?;
    let mut walker = WalkDir::new(src).min_depth(1).into_iter();

    while let Some(entry) = walker.next() {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if excludes.matches(&name) {
            if entry.file_type().is_dir() {
                walker.skip_current_dir();
            }
            continue;
        }

        let relative = entry
            .path()
            .strip_prefix(src)
            .context("walked entry outside copy root")?;
        let target = dst.join(relative);

        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else if entry.file_type().is_symlink() {
            // Archives flatten symlinks anyway; follow the link.
            let resolved = fs::read_link(entry.path())?;
            let source = if resolved.is_absolute() {
                resolved
            } else {
                entry.path().parent().unwrap_or(src).join(resolved)
            };
            if source.is_file() {
                copy_file(&source, &target)?;
            } else if source.is_dir() {
                copy_tree_filtered(&source, &target, excludes)?;
            } else {
                eprintln!(
                    "  [WARN] skipping dangling symlink {}",
                    entry.path().display()
                );
            }
        } else {
            copy_file(entry.path(), &target)?;
        }
    }
    Ok(())
}

fn copy_file(src: &Path, dst: &Path) -> Result<()> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::copy(src, dst)
        .with_context(|| format!("cannot copy {} to {}", src.display(), dst.display()))?;
    Ok(())
}

/// Remove every path under `root` whose root-relative path matches any
/// of the glob patterns. Missing matches are not an error.
pub fn remove_matching(root: &Path, patterns: &[String]) -> Result<()> {
    let mut globs = Vec::new();
    for pattern in patterns {
        globs.push(
            Glob::new(pattern)
                .with_context(|| format!("invalid removal pattern {pattern:?}"))?
                .into_owned(),
        );
    }

    let mut doomed = Vec::new();
    for entry in WalkDir::new(root).min_depth(1) {
        let entry = entry?;
        let Ok(relative) = entry.path().strip_prefix(root) else {
            continue;
        };
        let rel_str = relative.to_string_lossy().replace('\\', "/");
        let candidate = CandidatePath::from(rel_str.as_str());
        if globs.iter().any(|g| g.matched(&candidate).is_some()) {
            doomed.push((entry.path().to_path_buf(), entry.file_type().is_dir()));
        }
    }

    for (path, is_dir) in doomed {
        if !path.exists() {
            continue; // parent already removed
        }
        let result = if is_dir {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };
        if let Err(e) = result {
            eprintln!("  [WARN] cannot remove {}: {e}", path.display());
        }
    }
    Ok(())
}
