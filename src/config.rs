//! Configuration management for pybale.
//!
//! Build settings come from CLI arguments; the interpreter and cache
//! locations can additionally be overridden from the environment or a
//! .env file next to the source script. Environment variables take
//! precedence over the .env file.

use anyhow::{bail, Context, Result};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Exclusion patterns applied to every filtered folder copy.
/// Matched case-insensitively against each path segment.
pub const DEFAULT_EXCLUDES: &[&str] = &[
    "__pycache__",
    ".git",
    ".github",
    ".gitignore",
    "readme*",
    "licence*",
    "license*",
    ".vscode",
];

/// Shape of the final artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Self-extracting executable: launcher stub + appended payload.
    OneFile,
    /// Plain directory tree.
    Folder,
    /// Zip archive of the directory tree.
    Zip,
}

/// Settings for one build run.
#[derive(Debug, Clone)]
pub struct BuildConfig {
    /// Absolute path of the script being packaged.
    pub source_file: PathBuf,
    /// Directory containing the script; root for relative references.
    pub source_dir: PathBuf,
    /// Output tree (NAME.build next to the script unless overridden).
    pub dest_dir: PathBuf,
    /// Python interpreter used for probing and as the bundled runtime.
    pub python: PathBuf,
    /// Cache directory (linked-reference map, compression cache).
    pub cache_dir: PathBuf,
    pub output: OutputMode,
    /// Use the console-less launcher stub (Windows).
    pub windowed: bool,
    pub verbose: bool,
    /// Keep the intermediate tree and probe driver files.
    pub keep_files: bool,
    /// Extra unit names force-included in every probe pass.
    pub packages: Vec<String>,
    /// Extra files/folders copied into the output root.
    pub copy_paths: Vec<PathBuf>,
    /// Exclusion patterns (defaults plus user additions).
    pub exclude_patterns: Vec<String>,
    /// Precompile the lib subtree to bytecode before archiving.
    pub compile_bytecode: bool,
    /// Compress native binaries with UPX.
    pub compress_binaries: bool,
    /// Encrypt the onefile payload with the embedded passphrase.
    pub password: bool,
    /// Wipe the linked-map cache before resolving.
    pub force_refresh: bool,
    /// Custom launcher stub instead of the installed one.
    pub launcher: Option<PathBuf>,
    /// UPX worker pool size override (default: CPU count).
    pub jobs: Option<usize>,
}

impl BuildConfig {
    /// Resolve the source path and fill in derived locations.
    ///
    /// Fails if the script does not exist; everything else has a default.
    pub fn resolve(source: &Path) -> Result<(PathBuf, PathBuf, PathBuf)> {
        let source_file = source
            .canonicalize()
            .with_context(|| format!("{} does not exist", source.display()))?;
        if !source_file.is_file() {
            bail!("{} is not a file", source_file.display());
        }
        let source_dir = source_file
            .parent()
            .context("source file has no parent directory")?
            .to_path_buf();
        let stem = source_file
            .file_stem()
            .context("source file has no name")?
            .to_string_lossy()
            .into_owned();
        let dest_dir = source_dir.join(format!("{stem}.build"));
        Ok((source_file, source_dir, dest_dir))
    }

    /// Locate the Python interpreter.
    ///
    /// Order: PYBALE_PYTHON (environment or .env), then `python3`,
    /// then `python` on PATH.
    pub fn find_python(env_vars: &HashMap<String, String>) -> Result<PathBuf> {
        if let Some(p) = env_vars.get("PYBALE_PYTHON") {
            let path = PathBuf::from(p);
            if path.exists() {
                return Ok(path);
            }
            bail!("PYBALE_PYTHON points at {}, which does not exist", p);
        }
        which::which("python3")
            .or_else(|_| which::which("python"))
            .context("no Python interpreter found on PATH (set PYBALE_PYTHON to override)")
    }

    /// Cache directory: PYBALE_CACHE_DIR or <user cache dir>/pybale.
    pub fn cache_dir(env_vars: &HashMap<String, String>) -> PathBuf {
        if let Some(p) = env_vars.get("PYBALE_CACHE_DIR") {
            return PathBuf::from(p);
        }
        dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("pybale")
    }

    /// Collect override variables from a .env file and the environment.
    ///
    /// Searches for .env in the given directory. Environment variables
    /// override .env entries.
    pub fn load_env(base_dir: &Path) -> HashMap<String, String> {
        let mut env_vars = HashMap::new();

        let env_path = base_dir.join(".env");
        if env_path.exists() {
            if let Ok(content) = fs::read_to_string(&env_path) {
                for line in content.lines() {
                    let line = line.trim();
                    // Skip comments and empty lines
                    if line.is_empty() || line.starts_with('#') {
                        continue;
                    }
                    // Parse KEY=value
                    if let Some((key, value)) = line.split_once('=') {
                        let key = key.trim();
                        let value = value.trim();
                        // Remove quotes if present
                        let value = value.trim_matches('"').trim_matches('\'');
                        env_vars.insert(key.to_string(), value.to_string());
                    }
                }
            }
        }

        for (key, value) in std::env::vars() {
            env_vars.insert(key, value);
        }

        env_vars
    }

    /// Print configuration for debugging.
    pub fn print(&self) {
        println!("Configuration:");
        println!("  source: {}", self.source_file.display());
        println!("  dest:   {}", self.dest_dir.display());
        println!("  python: {}", self.python.display());
        println!("  cache:  {}", self.cache_dir.display());
        println!("  output: {:?}", self.output);
    }
}
