//! Shared test utilities for pybale tests.
#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

use pybale::config::{BuildConfig, OutputMode, DEFAULT_EXCLUDES};

/// Test environment with temporary directories for a mock project,
/// its output tree, and an isolated cache.
pub struct TestEnv {
    /// Temporary directory (kept alive for lifetime of TestEnv)
    pub _temp_dir: TempDir,
    /// Mock project directory containing the script
    pub source_dir: PathBuf,
    /// Mock installed-packages directory (probe origin simulation)
    pub site_dir: PathBuf,
    /// Isolated cache directory
    pub cache_dir: PathBuf,
}

impl TestEnv {
    /// Create a new test environment with temporary directories.
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let base = temp_dir.path();

        let source_dir = base.join("project");
        let site_dir = base.join("site-packages");
        let cache_dir = base.join("cache");
        fs::create_dir_all(&source_dir).expect("Failed to create project dir");
        fs::create_dir_all(&site_dir).expect("Failed to create site dir");
        fs::create_dir_all(&cache_dir).expect("Failed to create cache dir");

        Self {
            _temp_dir: temp_dir,
            source_dir,
            site_dir,
            cache_dir,
        }
    }

    /// Write a script into the project directory.
    pub fn write_script(&self, name: &str, content: &str) -> PathBuf {
        let path = self.source_dir.join(name);
        fs::write(&path, content).expect("Failed to write script");
        path
    }

    /// Build configuration pointing at a script in this environment.
    /// The interpreter path is a placeholder; tests that use this
    /// config never spawn it.
    pub fn config(&self, script: &Path) -> BuildConfig {
        let stem = script
            .file_stem()
            .expect("script has no name")
            .to_string_lossy()
            .into_owned();
        BuildConfig {
            source_file: script.to_path_buf(),
            source_dir: self.source_dir.clone(),
            dest_dir: self.source_dir.join(format!("{stem}.build")),
            python: PathBuf::from("python3"),
            cache_dir: self.cache_dir.clone(),
            output: OutputMode::Folder,
            windowed: false,
            verbose: false,
            keep_files: false,
            packages: Vec::new(),
            copy_paths: Vec::new(),
            exclude_patterns: DEFAULT_EXCLUDES.iter().map(|s| s.to_string()).collect(),
            compile_bytecode: false,
            compress_binaries: false,
            password: false,
            force_refresh: false,
            launcher: None,
            jobs: None,
        }
    }
}

/// Create a mock installed package directory with an `__init__.py`
/// plus the named submodule files. Returns the package directory.
pub fn create_mock_package(site_dir: &Path, name: &str, submodules: &[&str]) -> PathBuf {
    let pkg = site_dir.join(name);
    fs::create_dir_all(&pkg).expect("Failed to create package dir");
    fs::write(pkg.join("__init__.py"), "").expect("Failed to write __init__.py");
    for sub in submodules {
        fs::write(pkg.join(format!("{sub}.py")), format!("# {sub}\n"))
            .expect("Failed to write submodule");
    }
    pkg
}

pub fn assert_file_exists(path: &Path) {
    assert!(path.is_file(), "Expected file to exist: {}", path.display());
}

pub fn assert_dir_exists(path: &Path) {
    assert!(path.is_dir(), "Expected dir to exist: {}", path.display());
}

pub fn assert_not_exists(path: &Path) {
    assert!(!path.exists(), "Expected path to be absent: {}", path.display());
}

pub fn assert_file_contains(path: &Path, needle: &str) {
    let content = fs::read_to_string(path)
        .unwrap_or_else(|e| panic!("Failed to read {}: {e}", path.display()));
    assert!(
        content.contains(needle),
        "Expected {} to contain {:?}, got:\n{}",
        path.display(),
        needle,
        content
    );
}

/// Every file under `root`, as sorted root-relative path strings.
pub fn file_listing(root: &Path) -> Vec<String> {
    let mut files: Vec<String> = walkdir::WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| {
            e.path()
                .strip_prefix(root)
                .expect("entry outside root")
                .to_string_lossy()
                .into_owned()
        })
        .collect();
    files.sort();
    files
}
