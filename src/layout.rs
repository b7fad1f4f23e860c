//! Artifact layout builder.
//!
//! Owns the output tree for the duration of a build. Places the
//! interpreter runtime at the tree root, library units under `lib/`,
//! native binary extensions under `dlls/` (searched first by the
//! embedded interpreter), local project folders at the root, and the
//! metadata files the launcher consumes: the `entrypoint` marker and
//! the `pybale.pth` search-root list.
//!
//! Per-unit copy failures are logged and skipped so one bad dependency
//! never sinks a build; re-running against an existing tree deletes and
//! recreates it, so the result always matches a from-scratch build.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::BuildConfig;
use crate::files::{self, ExcludeFilter};
use crate::plugin::{HookContext, Registry, GLOBAL_UNIT};
use crate::probe::{OriginKind, ResolvedUnit};
use crate::process::Cmd;

/// Library subtree for interpreted units.
pub const LIB_DIR: &str = "lib";
/// Binary subtree for native extensions; distinct from `lib` so the
/// loader can search it first.
pub const BIN_DIR: &str = "dlls";
/// The packaged script, always renamed to the interpreter's entry name.
pub const ENTRY_SCRIPT: &str = "__main__.py";
/// Marker file recording the original script name.
pub const ENTRY_MARKER: &str = "entrypoint";
/// Search roots for the embedded interpreter, one per line.
pub const PATH_CONFIG: &str = "pybale.pth";

/// Unit names never copied: the script itself and this tool.
const SKIP_UNITS: &[&str] = &["__main__", "pybale"];

/// Where the bundled interpreter's pieces live on the build machine.
#[derive(Debug, Clone)]
pub struct RuntimeInfo {
    /// Fully resolved interpreter executable (through venv shims).
    pub executable: PathBuf,
    /// Shared library the executable links against, if any.
    pub shared_library: Option<PathBuf>,
    /// Directory of the runtime's compiled extension modules, when it
    /// lives apart from the executable (lib-dynload on Unix).
    pub extension_dir: Option<PathBuf>,
}

impl RuntimeInfo {
    /// Ask the interpreter where it actually lives.
    pub fn detect(python: &Path) -> Result<Self> {
        let script = "import sys, sysconfig\n\
                      print(sys.executable)\n\
                      print(sysconfig.get_config_var('LIBDIR') or '')\n\
                      print(sysconfig.get_config_var('INSTSONAME') or '')\n\
                      print(sysconfig.get_config_var('DESTSHARED') or '')\n";
        let result = Cmd::new(python)
            .arg("-c")
            .arg(script)
            .error_msg("failed to query the Python runtime")
            .run()?;
        Ok(Self::parse(&result.stdout, python))
    }

    /// Parse the four-line introspection output.
    pub fn parse(stdout: &str, fallback: &Path) -> Self {
        let mut lines = stdout.lines().map(str::trim);
        let executable = match lines.next() {
            Some(s) if !s.is_empty() => PathBuf::from(s),
            _ => fallback.to_path_buf(),
        };
        let libdir = lines.next().unwrap_or("");
        let soname = lines.next().unwrap_or("");
        let shared_library = if libdir.is_empty() || soname.is_empty() {
            None
        } else {
            let candidate = Path::new(libdir).join(soname);
            candidate.is_file().then_some(candidate)
        };
        let destshared = lines.next().unwrap_or("");
        let extension_dir = if destshared.is_empty() {
            None
        } else {
            let candidate = PathBuf::from(destshared);
            candidate.is_dir().then_some(candidate)
        };
        Self {
            executable,
            shared_library,
            extension_dir,
        }
    }
}

/// Builds the output tree for one run.
pub struct LayoutBuilder<'a> {
    config: &'a BuildConfig,
    excludes: ExcludeFilter,
}

impl<'a> LayoutBuilder<'a> {
    pub fn new(config: &'a BuildConfig) -> Result<Self> {
        let excludes = ExcludeFilter::new(&config.exclude_patterns)?;
        Ok(Self { config, excludes })
    }

    /// Delete any stale output tree and create it fresh.
    pub fn prepare_tree(&self) -> Result<()> {
        let dest = &self.config.dest_dir;
        if dest.exists() {
            fs::remove_dir_all(dest)
                .with_context(|| format!("cannot clear stale build {}", dest.display()))?;
        }
        fs::create_dir_all(dest.join(LIB_DIR))?;
        fs::create_dir_all(dest.join(BIN_DIR))?;
        Ok(())
    }

    /// Copy the interpreter runtime to the tree root.
    pub fn copy_runtime(&self, runtime: &RuntimeInfo) -> Result<()> {
        let dest = &self.config.dest_dir;
        let exe_name = if cfg!(windows) { "python.exe" } else { "python" };
        fs::copy(&runtime.executable, dest.join(exe_name)).with_context(|| {
            format!("cannot copy interpreter {}", runtime.executable.display())
        })?;
        println!("Copied interpreter to {}", dest.display());

        let exe_dir = runtime
            .executable
            .parent()
            .context("interpreter has no parent directory")?;

        if cfg!(windows) {
            // The stock layout keeps extension modules in DLLs/ and the
            // core + CRT DLLs next to the executable.
            let dlls = exe_dir.join("DLLs");
            if dlls.is_dir() {
                files::copy_tree_filtered(&dlls, &dest.join(BIN_DIR), &ExcludeFilter::none())?;
            }
            for phrase in ["python", "vcruntime"] {
                for dll in find_files_with_phrase(exe_dir, phrase, ".dll") {
                    let name = dll.file_name().context("dll has no name")?;
                    fs::copy(&dll, dest.join(name))?;
                }
            }
        } else {
            if let Some(lib) = &runtime.shared_library {
                let name = lib.file_name().context("shared library has no name")?;
                fs::copy(lib, dest.join(name))
                    .with_context(|| format!("cannot copy {}", lib.display()))?;
            }
            // lib-dynload: the stdlib's compiled extensions, searched
            // via the binaries subtree like any other native unit.
            if let Some(ext_dir) = &runtime.extension_dir {
                files::copy_tree_filtered(ext_dir, &dest.join(BIN_DIR), &ExcludeFilter::none())?;
            }
        }
        Ok(())
    }

    /// Copy the script as `__main__.py` and write the metadata files.
    pub fn install_entry(&self) -> Result<()> {
        let dest = &self.config.dest_dir;
        fs::copy(&self.config.source_file, dest.join(ENTRY_SCRIPT))?;

        let original_name = self
            .config
            .source_file
            .file_name()
            .context("source file has no name")?
            .to_string_lossy()
            .into_owned();
        files::write_file_with_dirs(dest.join(ENTRY_MARKER), original_name)?;
        files::write_file_with_dirs(dest.join(PATH_CONFIG), format!("{BIN_DIR}\n{LIB_DIR}\n.\n"))?;
        Ok(())
    }

    /// Copy user-requested extra files/folders into the tree root.
    pub fn copy_extras(&self) -> Result<()> {
        for path in &self.config.copy_paths {
            let Some(name) = path.file_name() else {
                eprintln!("  [ERROR] cannot copy {}: no file name", path.display());
                continue;
            };
            let target = self.config.dest_dir.join(name);
            let outcome = if path.is_dir() {
                files::copy_tree_filtered(path, &target, &self.excludes)
            } else if path.is_file() {
                fs::copy(path, &target).map(|_| ()).map_err(Into::into)
            } else {
                eprintln!("  [ERROR] path does not exist: {}", path.display());
                continue;
            };
            match outcome {
                Ok(()) => println!("Copied extra path {}", path.display()),
                Err(e) => eprintln!("  [ERROR] failed to copy {}: {e}", path.display()),
            }
        }
        Ok(())
    }

    /// Place every resolved unit, dispatching extension handlers
    /// around (or instead of) default placement. Handlers bound to the
    /// global name run once per build: `before`-placed ones ahead of
    /// any placement, `after`-placed ones once everything is in.
    pub fn place_units(&self, units: &[ResolvedUnit], registry: &mut Registry) -> Result<()> {
        let global = ResolvedUnit {
            name: GLOBAL_UNIT.to_string(),
            kind: OriginKind::Unresolved,
            origin: None,
        };
        let global_ctx = HookContext {
            unit: &global,
            tree_root: &self.config.dest_dir,
            source_dir: &self.config.source_dir,
            excludes: &self.excludes,
            verbose: self.config.verbose,
        };
        registry.dispatch_before(&global_ctx)?;

        let mut saw_tk = false;
        for unit in units {
            if SKIP_UNITS.contains(&unit.name.as_str()) {
                continue;
            }
            if unit.name == "tkinter" || unit.name == "_tkinter" {
                saw_tk = true;
            }

            let ctx = HookContext {
                unit,
                tree_root: &self.config.dest_dir,
                source_dir: &self.config.source_dir,
                excludes: &self.excludes,
                verbose: self.config.verbose,
            };

            let run_default = registry.dispatch_before(&ctx)?;
            if run_default {
                if let Err(e) = self.place_unit(unit) {
                    // One bad dependency never blocks the rest.
                    eprintln!("  [ERROR] failed to place '{}': {e}", unit.name);
                }
            } else if self.config.verbose {
                println!("  [plugin] default placement for '{}' suppressed", unit.name);
            }
            registry.dispatch_after(&ctx)?;
        }

        if saw_tk {
            self.copy_tcl_runtime()?;
        }
        registry.dispatch_after(&global_ctx)?;
        Ok(())
    }

    fn place_unit(&self, unit: &ResolvedUnit) -> Result<()> {
        let dest = &self.config.dest_dir;
        match unit.kind {
            OriginKind::PackageDirectory => {
                let origin = require_origin(unit)?;
                let name = origin.file_name().context("package dir has no name")?;
                files::replace_tree(origin, &dest.join(LIB_DIR).join(name))?;
                println!("Copied package folder: {} to {LIB_DIR}", unit.name);
            }
            OriginKind::SingleFile => {
                let origin = require_origin(unit)?;
                let name = origin.file_name().context("module file has no name")?;
                fs::copy(origin, dest.join(LIB_DIR).join(name))?;
                println!("Copied module file: {}", unit.name);
            }
            OriginKind::NativeBinary => {
                let origin = require_origin(unit)?;
                let name = origin.file_name().context("binary has no name")?;
                fs::copy(origin, dest.join(BIN_DIR).join(name))?;
                println!("Copied native binary: {}", unit.name);
            }
            OriginKind::LocalProjectFolder => {
                let origin = require_origin(unit)?;
                files::copy_tree_filtered(origin, &dest.join(&unit.name), &self.excludes)?;
                println!("Copied local project folder: {}", unit.name);
            }
            OriginKind::Unresolved => {
                if self.config.verbose {
                    println!("  [debug] no origin for unit: {} (skipped)", unit.name);
                }
            }
        }
        Ok(())
    }

    /// The tcl/tk runtime (fonts, encodings, platform scripts) is not
    /// itself an importable unit; pull its directories in whole when a
    /// tk binding resolved.
    fn copy_tcl_runtime(&self) -> Result<()> {
        let exe_dir = match self.config.python.parent() {
            Some(d) => d.to_path_buf(),
            None => return Ok(()),
        };
        let candidates = [
            exe_dir.join("tcl"),
            exe_dir.join("../tcl"),
            exe_dir.join("../lib"),
        ];
        let Some(tcl_root) = candidates.iter().find(|p| p.is_dir()) else {
            eprintln!("  [WARN] tcl runtime directory not found; tkinter may not start");
            return Ok(());
        };

        for entry in fs::read_dir(tcl_root)? {
            let entry = entry?;
            if !entry.path().is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            let lower = name.to_lowercase();
            if lower.starts_with("tcl") || lower.starts_with("tk") {
                let target = self.config.dest_dir.join(LIB_DIR).join(&name);
                if let Err(e) = files::replace_tree(&entry.path(), &target) {
                    eprintln!("  [ERROR] failed to copy tcl dir {}: {e}", name);
                }
            }
        }
        println!("Copied tcl runtime directories to {LIB_DIR}");
        Ok(())
    }
}

fn require_origin(unit: &ResolvedUnit) -> Result<&PathBuf> {
    unit.origin
        .as_ref()
        .with_context(|| format!("unit '{}' has no origin path", unit.name))
}

/// Files in `dir` whose lowercase name contains `phrase` and ends with
/// `suffix`.
pub fn find_files_with_phrase(dir: &Path, phrase: &str, suffix: &str) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    entries
        .flatten()
        .filter(|e| {
            let name = e.file_name().to_string_lossy().to_lowercase();
            name.ends_with(suffix) && name.contains(&phrase.to_lowercase())
        })
        .map(|e| e.path())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_parse_full_output() {
        let info = RuntimeInfo::parse(
            "/usr/bin/python3.12\n/missing-libdir\nlibpython3.12.so.1.0\n/missing-dynload\n",
            Path::new("/fallback"),
        );
        assert_eq!(info.executable, PathBuf::from("/usr/bin/python3.12"));
        // Paths that don't exist on disk yield no runtime pieces.
        assert!(info.shared_library.is_none());
        assert!(info.extension_dir.is_none());
    }

    #[test]
    fn runtime_parse_picks_up_an_existing_extension_dir() {
        let tmp = tempfile::TempDir::new().unwrap();
        let dynload = tmp.path().join("lib-dynload");
        fs::create_dir_all(&dynload).unwrap();

        let stdout = format!("/usr/bin/python3\n\n\n{}\n", dynload.display());
        let info = RuntimeInfo::parse(&stdout, Path::new("/fallback"));
        assert_eq!(info.extension_dir, Some(dynload));
    }

    #[test]
    fn runtime_parse_falls_back_on_empty() {
        let info = RuntimeInfo::parse("", Path::new("/usr/bin/python3"));
        assert_eq!(info.executable, PathBuf::from("/usr/bin/python3"));
        assert!(info.shared_library.is_none());
        assert!(info.extension_dir.is_none());
    }
}
