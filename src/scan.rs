//! Static reference scanner.
//!
//! Walks a script and every local file it references, collecting the
//! dotted names imported at module scope. The result deliberately
//! over-approximates: false positives are discarded by the resolution
//! probe, false negatives are what this stage must avoid for files it
//! can read. A file that fails to read or parse contributes zero
//! references and the scan continues.

use anyhow::{Context, Result};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

/// One symbolic reference extracted from a source file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyReference {
    /// Dotted name, e.g. `pkg.sub`. Empty for a bare `from . import x`.
    pub name: String,
    /// Leading-dot count of a relative reference; 0 = absolute.
    pub depth: usize,
    /// Names listed after `import` in a `from`-form statement.
    /// Needed to resolve `from . import sibling`.
    pub imported: Vec<String>,
}

/// Result of a recursive scan.
#[derive(Debug, Default)]
pub struct ScanResult {
    /// First path segment of every reference seen; seeds the probe.
    pub top_level: BTreeSet<String>,
    /// Every local file visited, entry script included.
    pub visited: Vec<PathBuf>,
}

/// Recursively scan `entry` and the local files it references.
pub fn recursive_scan(entry: &Path, verbose: bool) -> Result<ScanResult> {
    let entry = entry
        .canonicalize()
        .with_context(|| format!("cannot scan {}", entry.display()))?;
    let base_dir = entry
        .parent()
        .context("entry script has no parent directory")?
        .to_path_buf();

    let mut result = ScanResult::default();
    let mut seen: BTreeSet<PathBuf> = BTreeSet::new();
    let mut worklist = vec![entry];

    while let Some(file) = worklist.pop() {
        if !seen.insert(file.clone()) {
            continue;
        }
        result.visited.push(file.clone());

        let source = match fs::read_to_string(&file) {
            Ok(s) => s,
            Err(e) => {
                eprintln!("  [WARN] Failed to read {}: {} (skipped)", file.display(), e);
                continue;
            }
        };
        let file_dir = file.parent().unwrap_or(&base_dir).to_path_buf();

        for reference in parse_imports(&source) {
            if let Some(seg) = reference.name.split('.').next() {
                if !seg.is_empty() {
                    result.top_level.insert(seg.to_string());
                }
            }
            for local in resolve_local(&base_dir, &file_dir, &reference) {
                if verbose {
                    println!(
                        "  [scan] {} -> {}",
                        file.display(),
                        local.display()
                    );
                }
                worklist.push(local);
            }
        }
    }

    Ok(result)
}

/// Extract import references from Python source text.
///
/// Line-level parse of `import a.b as c, d` and
/// `from [dots]mod import (x, y)` statements, including statements
/// separated by semicolons. Anything that does not look like an import
/// is ignored, which keeps broken files harmless.
pub fn parse_imports(source: &str) -> Vec<DependencyReference> {
    let mut refs = Vec::new();

    for raw_line in source.lines() {
        let line = strip_comment(raw_line).trim();
        for stmt in line.split(';') {
            let stmt = stmt.trim();
            if let Some(rest) = stmt.strip_prefix("import ") {
                for part in rest.split(',') {
                    let name = part.split_whitespace().next().unwrap_or("");
                    if is_dotted_name(name) {
                        refs.push(DependencyReference {
                            name: name.to_string(),
                            depth: 0,
                            imported: Vec::new(),
                        });
                    }
                }
            } else if let Some(rest) = stmt.strip_prefix("from ") {
                let Some((module_part, import_part)) = rest.split_once(" import ") else {
                    continue;
                };
                let module_part = module_part.trim();
                let depth = module_part.chars().take_while(|c| *c == '.').count();
                let name = &module_part[depth..];
                if !name.is_empty() && !is_dotted_name(name) {
                    continue;
                }
                let imported = import_part
                    .trim()
                    .trim_start_matches('(')
                    .trim_end_matches(')')
                    .split(',')
                    .filter_map(|p| p.split_whitespace().next())
                    .filter(|n| is_dotted_name(n))
                    .map(|n| n.to_string())
                    .collect();
                refs.push(DependencyReference {
                    name: name.to_string(),
                    depth,
                    imported,
                });
            }
        }
    }

    refs
}

/// Resolve a reference to local candidate files, if any exist.
///
/// Absolute references resolve against the project base directory by
/// first segment (`name.py` or `name/__init__.py`); relative ones walk
/// `depth - 1` directories up from the declaring file and follow the
/// remaining segments.
fn resolve_local(base_dir: &Path, file_dir: &Path, reference: &DependencyReference) -> Vec<PathBuf> {
    let mut found = Vec::new();

    if reference.depth == 0 {
        if let Some(seg) = reference.name.split('.').next() {
            if !seg.is_empty() {
                push_candidates(base_dir, &[seg], &mut found);
            }
        }
        return found;
    }

    let mut root = file_dir.to_path_buf();
    for _ in 1..reference.depth {
        if !root.pop() {
            return found;
        }
    }

    if reference.name.is_empty() {
        // `from . import sibling` names its modules on the import side.
        for name in &reference.imported {
            push_candidates(&root, &[name.as_str()], &mut found);
        }
    } else {
        let segments: Vec<&str> = reference.name.split('.').collect();
        push_candidates(&root, &segments, &mut found);
    }

    found
}

fn push_candidates(root: &Path, segments: &[&str], found: &mut Vec<PathBuf>) {
    let mut path = root.to_path_buf();
    for seg in segments {
        path.push(seg);
    }
    let as_file = path.with_extension("py");
    if as_file.is_file() {
        found.push(as_file);
    }
    let as_package = path.join("__init__.py");
    if as_package.is_file() {
        found.push(as_package);
    }
}

fn strip_comment(line: &str) -> &str {
    // Good enough for import lines; a '#' inside a string only ever
    // truncates a statement the probe would reject anyway.
    match line.find('#') {
        Some(idx) => &line[..idx],
        None => line,
    }
}

fn is_dotted_name(s: &str) -> bool {
    !s.is_empty()
        && s.split('.').all(|seg| {
            !seg.is_empty()
                && seg
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_')
                && !seg.starts_with(|c: char| c.is_ascii_digit())
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_and_aliased_imports() {
        let refs = parse_imports("import os\nimport numpy as np, json\n");
        let names: Vec<_> = refs.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["os", "numpy", "json"]);
    }

    #[test]
    fn parses_from_imports_with_depth() {
        let refs = parse_imports("from ..pkg.sub import thing\nfrom . import sibling\n");
        assert_eq!(refs[0].name, "pkg.sub");
        assert_eq!(refs[0].depth, 2);
        assert_eq!(refs[1].name, "");
        assert_eq!(refs[1].depth, 1);
        assert_eq!(refs[1].imported, vec!["sibling".to_string()]);
    }

    #[test]
    fn ignores_comments_and_noise() {
        let refs = parse_imports("# import fake\nx = 1\nimport real  # trailing\n");
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].name, "real");
    }

    #[test]
    fn rejects_malformed_names() {
        let refs = parse_imports("import 123bad\nimport good_name\n");
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].name, "good_name");
    }
}
