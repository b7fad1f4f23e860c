//! Resolution probe.
//!
//! Static scanning cannot see reflective or conditional loads, so the
//! authoritative dependency set comes from actually loading everything:
//! a throwaway driver script imports every candidate (each attempt
//! wrapped so one failure never aborts the rest), then dumps the names
//! of every module that ended up loaded into a side-channel file. The
//! parent only ever talks to the driver through that file and the
//! process exit code.
//!
//! A second driver asks `importlib.util.find_spec` where each final
//! name lives; the origin strings are classified here, in the parent.

use anyhow::{Context, Result};
use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use crate::process::Cmd;

/// Probe driver written into the project directory so relative
/// references resolve the same way they do for the real script.
pub const DRIVER_FILE: &str = "tmp_pybale_probe.py";
/// Side-channel output of the enumeration driver.
pub const OUTPUT_FILE: &str = "tmp_pybale_probe_out.txt";
/// Origin-query driver and its output.
pub const CLASSIFY_DRIVER_FILE: &str = "tmp_pybale_classify.py";
pub const CLASSIFY_OUTPUT_FILE: &str = "tmp_pybale_classify_out.txt";

/// Where a resolved unit physically lives and how it must be copied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OriginKind {
    /// Directory with an `__init__` file; copied whole under lib/.
    PackageDirectory,
    /// Plain module file; copied into lib/.
    SingleFile,
    /// Compiled extension (.pyd/.so); copied into the binaries subtree.
    NativeBinary,
    /// Plain folder next to the script, not an installable package.
    LocalProjectFolder,
    /// The interpreter could not locate it; optional or built in.
    Unresolved,
}

impl fmt::Display for OriginKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OriginKind::PackageDirectory => "package-directory",
            OriginKind::SingleFile => "single-file",
            OriginKind::NativeBinary => "native-binary",
            OriginKind::LocalProjectFolder => "local-project-folder",
            OriginKind::Unresolved => "unresolved",
        };
        f.write_str(s)
    }
}

/// Authoritative result for one dependency name.
#[derive(Debug, Clone)]
pub struct ResolvedUnit {
    pub name: String,
    pub kind: OriginKind,
    /// Absent only for `Unresolved`.
    pub origin: Option<PathBuf>,
}

/// Runs probe drivers against one project directory.
pub struct Prober {
    python: PathBuf,
    source_dir: PathBuf,
    verbose: bool,
    keep_files: bool,
}

impl Prober {
    pub fn new(python: &Path, source_dir: &Path, verbose: bool, keep_files: bool) -> Self {
        Self {
            python: python.to_path_buf(),
            source_dir: source_dir.to_path_buf(),
            verbose,
            keep_files,
        }
    }

    /// Attempt to load every candidate name and report everything that
    /// ended up in `sys.modules`.
    ///
    /// A driver crash or unparsable output degrades to an empty set;
    /// the caller falls back to whatever was already known.
    pub fn realized_units(&self, candidates: &BTreeSet<String>) -> Result<BTreeSet<String>> {
        let driver_path = self.source_dir.join(DRIVER_FILE);
        let output_path = self.source_dir.join(OUTPUT_FILE);
        let _ = fs::remove_file(&output_path);

        fs::write(&driver_path, enumeration_driver(candidates, &output_path))
            .with_context(|| format!("cannot write probe driver {}", driver_path.display()))?;

        // Non-zero exit is not fatal: partial side-channel output, if
        // any, is still read.
        let result = Cmd::new(&self.python)
            .arg_path(&driver_path)
            .dir(&self.source_dir)
            .allow_fail()
            .run()?;
        if !result.success() {
            eprintln!(
                "  [WARN] probe driver exited with {}; using partial output",
                result.code()
            );
        }

        let realized = match fs::read_to_string(&output_path) {
            Ok(content) => parse_module_list(&content),
            Err(e) => {
                eprintln!("  [WARN] probe produced no output: {e}");
                BTreeSet::new()
            }
        };

        if !self.keep_files {
            let _ = fs::remove_file(&driver_path);
            let _ = fs::remove_file(&output_path);
        }
        if self.verbose {
            println!("  [probe] {} candidates -> {} loaded units", candidates.len(), realized.len());
        }
        Ok(realized)
    }

    /// Ask the interpreter where each name lives and classify it.
    pub fn classify(&self, names: &BTreeSet<String>) -> Result<Vec<ResolvedUnit>> {
        let driver_path = self.source_dir.join(CLASSIFY_DRIVER_FILE);
        let output_path = self.source_dir.join(CLASSIFY_OUTPUT_FILE);
        let _ = fs::remove_file(&output_path);

        fs::write(&driver_path, classification_driver(names, &output_path))
            .with_context(|| format!("cannot write classify driver {}", driver_path.display()))?;

        let result = Cmd::new(&self.python)
            .arg_path(&driver_path)
            .dir(&self.source_dir)
            .allow_fail()
            .run()?;
        if !result.success() {
            eprintln!(
                "  [WARN] classification driver exited with {}; using partial output",
                result.code()
            );
        }

        let content = fs::read_to_string(&output_path).unwrap_or_default();
        if !self.keep_files {
            let _ = fs::remove_file(&driver_path);
            let _ = fs::remove_file(&output_path);
        }

        let mut units = Vec::new();
        let mut seen = BTreeSet::new();
        for line in content.lines() {
            let Some((name, origin)) = line.split_once('|') else {
                continue;
            };
            if !seen.insert(name.to_string()) {
                continue;
            }
            units.push(classify_origin(name, origin, &self.source_dir));
        }
        // Names the driver never reported (e.g. it crashed midway)
        // still appear, as unresolved.
        for name in names {
            if !seen.contains(name) {
                units.push(classify_origin(name, "", &self.source_dir));
            }
        }
        Ok(units)
    }
}

/// Parse the driver's side-channel content: a Python list literal of
/// module names, e.g. `['os', 'sys', 'json']`.
///
/// Malformed content yields an empty set and an error log, never a
/// failure.
pub fn parse_module_list(content: &str) -> BTreeSet<String> {
    let content = content.trim();
    let Some(inner) = content
        .strip_prefix('[')
        .and_then(|rest| rest.strip_suffix(']'))
    else {
        eprintln!("  [ERROR] probe output is not a module list: {content:?}");
        return BTreeSet::new();
    };

    let mut names = BTreeSet::new();
    for item in inner.split(',') {
        let item = item.trim();
        if item.is_empty() {
            continue;
        }
        let unquoted = item
            .strip_prefix('\'')
            .and_then(|s| s.strip_suffix('\''))
            .or_else(|| item.strip_prefix('"').and_then(|s| s.strip_suffix('"')));
        match unquoted {
            Some(name) if !name.is_empty() => {
                names.insert(name.to_string());
            }
            _ => {
                eprintln!("  [ERROR] probe output has a malformed entry: {item:?}");
                return BTreeSet::new();
            }
        }
    }
    names
}

/// Map a `find_spec` origin string to an origin kind.
///
/// Built-in, frozen, and unlocatable names fall back to a local-folder
/// check: a plain directory next to the script is sibling project code,
/// anything else is unresolved (optional or platform-conditional).
pub fn classify_origin(name: &str, origin: &str, source_dir: &Path) -> ResolvedUnit {
    let origin = origin.trim();
    if origin.is_empty() || origin.contains("built-in") || origin.contains("frozen") {
        let local = source_dir.join(name);
        if local.is_dir() {
            return ResolvedUnit {
                name: name.to_string(),
                kind: OriginKind::LocalProjectFolder,
                origin: Some(local),
            };
        }
        return ResolvedUnit {
            name: name.to_string(),
            kind: OriginKind::Unresolved,
            origin: None,
        };
    }

    let path = PathBuf::from(origin);
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    if file_name == "__init__.py" || file_name == "__init__.pyc" {
        let package_dir = path.parent().map(Path::to_path_buf).unwrap_or(path.clone());
        return ResolvedUnit {
            name: name.to_string(),
            kind: OriginKind::PackageDirectory,
            origin: Some(package_dir),
        };
    }

    let lower = file_name.to_lowercase();
    if lower.ends_with(".pyd") || lower.ends_with(".so") || lower.ends_with(".dylib") {
        return ResolvedUnit {
            name: name.to_string(),
            kind: OriginKind::NativeBinary,
            origin: Some(path),
        };
    }

    ResolvedUnit {
        name: name.to_string(),
        kind: OriginKind::SingleFile,
        origin: Some(path),
    }
}

fn enumeration_driver(candidates: &BTreeSet<String>, output_path: &Path) -> String {
    let mut driver = String::new();
    for name in candidates {
        driver.push_str(&format!("try:\n    import {name}\nexcept Exception: pass\n"));
    }
    driver.push_str("\nimport sys\n");
    driver.push_str(&format!(
        "with open(r'{}', 'w') as out_file:\n",
        output_path.display()
    ));
    driver.push_str(
        "    out_file.write(str([m.__name__ for m in sys.modules.values() if m and hasattr(m, '__name__')]))\n",
    );
    driver
}

fn classification_driver(names: &BTreeSet<String>, output_path: &Path) -> String {
    let list = names
        .iter()
        .map(|n| format!("'{n}'"))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "import importlib.util\n\
         lines = []\n\
         for name in [{list}]:\n\
         \x20   try:\n\
         \x20       spec = importlib.util.find_spec(name)\n\
         \x20   except Exception:\n\
         \x20       spec = None\n\
         \x20   origin = ''\n\
         \x20   if spec is not None and spec.origin:\n\
         \x20       origin = spec.origin\n\
         \x20   lines.append(name + '|' + origin)\n\
         with open(r'{out}', 'w') as out_file:\n\
         \x20   out_file.write('\\n'.join(lines))\n",
        list = list,
        out = output_path.display()
    )
}
