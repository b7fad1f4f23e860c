//! Packaging stage: bytecode precompile, cache stripping, binary
//! compression, archive creation, and launcher embedding.
//!
//! Compression of independent binaries is the one parallel stage of the
//! pipeline: a bounded rayon pool sized from the CPU count (overridable)
//! runs UPX, guarded by the shared content-hash cache so a binary is
//! never recompressed across runs. Archive or embedding failure is
//! fatal: a broken artifact is worse than no artifact.

use anyhow::{bail, Context, Result};
use indicatif::ProgressBar;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{AesMode, CompressionMethod, ZipWriter};

use crate::cache::CompressionCache;
use crate::config::{BuildConfig, OutputMode};
use crate::payload;
use crate::process::Cmd;

/// Passphrase baked into launcher and builder for onefile payloads.
pub const PAYLOAD_PASSPHRASE: &str = "pybale";

/// Binary kinds UPX can usefully shrink.
const COMPRESSIBLE_EXTENSIONS: &[&str] = &["exe", "dll", "pyd", "so"];
/// Known to break when UPX-packed (Qt platform plugin, CRT).
const COMPRESSION_SKIP_PREFIXES: &[&str] = &["qwindows", "vcruntime"];

/// Produce the final artifact from a finished tree. Returns the path
/// of whatever was produced.
pub fn package(config: &BuildConfig) -> Result<PathBuf> {
    let tree = &config.dest_dir;
    let stem = artifact_stem(config)?;

    println!("Removing __pycache__ directories");
    let removed = strip_pycache(tree)?;
    if config.verbose {
        println!("  [package] {removed} __pycache__ folders deleted");
    }

    if config.compile_bytecode {
        precompile(config)?;
    }
    if config.compress_binaries {
        compress_binaries(config)?;
    }

    match config.output {
        OutputMode::Folder => {
            println!("Packaging complete: {}", tree.display());
            Ok(tree.clone())
        }
        OutputMode::Zip => {
            let archive = config.source_dir.join(format!("{stem}.zip"));
            create_archive(tree, &archive, None)?;
            if !config.keep_files {
                fs::remove_dir_all(tree)?;
            }
            println!("Packaging complete: {}", archive.display());
            Ok(archive)
        }
        OutputMode::OneFile => {
            let archive = config.source_dir.join(format!("{stem}.payload.zip"));
            let password = config.password.then_some(PAYLOAD_PASSPHRASE);
            create_archive(tree, &archive, password)?;

            let stub = launcher_stub(config)?;
            let exe_name = if cfg!(windows) {
                format!("{stem}.exe")
            } else {
                stem.clone()
            };
            let output = config.source_dir.join(exe_name);
            println!("Creating executable");
            payload::append_payload(&stub, &archive, &output)
                .context("failed to embed the payload into the launcher stub")?;

            fs::remove_file(&archive)?;
            if !config.keep_files {
                fs::remove_dir_all(tree)?;
            }
            println!("Packaging complete: {}", output.display());
            Ok(output)
        }
    }
}

fn artifact_stem(config: &BuildConfig) -> Result<String> {
    let name = config
        .dest_dir
        .file_name()
        .context("output tree has no name")?
        .to_string_lossy()
        .into_owned();
    Ok(name.trim_end_matches(".build").to_string())
}

/// Delete every `__pycache__` directory under `root`.
pub fn strip_pycache(root: &Path) -> Result<usize> {
    let mut doomed = Vec::new();
    for entry in WalkDir::new(root).min_depth(1) {
        let entry = entry?;
        if entry.file_type().is_dir() && entry.file_name() == "__pycache__" {
            doomed.push(entry.path().to_path_buf());
        }
    }
    let mut removed = 0;
    for path in doomed {
        if !path.exists() {
            continue;
        }
        match fs::remove_dir_all(&path) {
            Ok(()) => removed += 1,
            Err(e) => eprintln!("  [WARN] cannot delete {}: {e}", path.display()),
        }
    }
    Ok(removed)
}

/// Compile the lib subtree to bytecode next to the sources. Failure is
/// not fatal; the tree still runs from source.
fn precompile(config: &BuildConfig) -> Result<()> {
    println!("Precompiling library bytecode");
    let result = Cmd::new(&config.python)
        .args(["-m", "compileall", "-q", "-b"])
        .arg_path(&config.dest_dir.join(crate::layout::LIB_DIR))
        .allow_fail()
        .run()?;
    if !result.success() {
        eprintln!(
            "  [WARN] compileall exited with {}; shipping source only",
            result.code()
        );
    }
    Ok(())
}

/// Collect binaries worth handing to UPX.
pub fn binaries_to_compress(root: &Path) -> Vec<PathBuf> {
    let mut found = Vec::new();
    for entry in WalkDir::new(root).into_iter().flatten() {
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_lowercase();
        let compressible = COMPRESSIBLE_EXTENSIONS
            .iter()
            .any(|ext| name.ends_with(&format!(".{ext}")));
        let skipped = COMPRESSION_SKIP_PREFIXES
            .iter()
            .any(|prefix| name.starts_with(prefix));
        if compressible && !skipped {
            found.push(entry.path().to_path_buf());
        }
    }
    found
}

/// Run UPX over every binary in the tree through a bounded worker
/// pool, consulting the content-hash cache first.
fn compress_binaries(config: &BuildConfig) -> Result<()> {
    let Ok(upx) = which::which("upx") else {
        eprintln!("  [WARN] upx not found on PATH; binary compression skipped");
        return Ok(());
    };

    let targets = binaries_to_compress(&config.dest_dir);
    if targets.is_empty() {
        return Ok(());
    }

    let cache = CompressionCache::open(&config.cache_dir)?;
    let jobs = config.jobs.unwrap_or_else(num_cpus::get).max(1);
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(jobs)
        .build()
        .context("cannot build compression worker pool")?;

    println!("Compressing {} binaries with UPX ({jobs} workers)", targets.len());
    let progress = ProgressBar::new(targets.len() as u64);

    pool.install(|| {
        use rayon::prelude::*;
        targets.par_iter().for_each(|target| {
            compress_one(&upx, &cache, target, config.verbose);
            progress.inc(1);
        });
    });
    progress.finish_and_clear();

    cache.evict_stale();
    Ok(())
}

fn compress_one(upx: &Path, cache: &CompressionCache, target: &Path, verbose: bool) {
    let key = CompressionCache::key_for(target);

    if let Some(key) = &key {
        match cache.fetch(key, target) {
            Ok(true) => {
                if verbose {
                    println!("  [upx] cache hit for {}", target.display());
                }
                return;
            }
            Ok(false) => {}
            Err(e) => eprintln!("  [WARN] cache lookup failed for {}: {e}", target.display()),
        }
    }

    let result = Cmd::new(upx)
        .arg("--best")
        .arg_path(target)
        .quiet()
        .allow_fail()
        .run();
    match result {
        Ok(r) if r.success() => {
            if let Some(key) = &key {
                if let Err(e) = cache.store(key, target) {
                    eprintln!("  [WARN] cannot cache {}: {e}", target.display());
                }
            }
        }
        // Already packed or unpackable; the original binary is intact.
        Ok(_) => {
            if verbose {
                println!("  [upx] skipped {}", target.display());
            }
        }
        Err(e) => eprintln!("  [WARN] upx failed on {}: {e}", target.display()),
    }
}

/// Zip the tree. With a password the entries are AES-256 encrypted,
/// matching what the launcher expects for onefile payloads.
pub fn create_archive(tree: &Path, archive_path: &Path, password: Option<&str>) -> Result<()> {
    println!("Compressing {}", tree.display());
    let total: u64 = WalkDir::new(tree)
        .into_iter()
        .flatten()
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok().map(|m| m.len()))
        .sum();
    let progress = ProgressBar::new(total);

    let file = File::create(archive_path)
        .with_context(|| format!("cannot create archive {}", archive_path.display()))?;
    let mut writer = ZipWriter::new(file);

    for entry in WalkDir::new(tree).min_depth(1) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(tree)
            .context("archive entry outside tree")?;
        let name = relative.to_string_lossy().replace('\\', "/");

        let mut options = SimpleFileOptions::default()
            .compression_method(CompressionMethod::Deflated);
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Ok(meta) = entry.metadata() {
                options = options.unix_permissions(meta.permissions().mode());
            }
        }
        if let Some(pw) = password {
            options = options.with_aes_encryption(AesMode::Aes256, pw);
        }

        writer
            .start_file(name.as_str(), options)
            .with_context(|| format!("cannot add {name} to archive"))?;
        let mut source = File::open(entry.path())?;
        let written = io::copy(&mut source, &mut writer)
            .with_context(|| format!("cannot compress {name}"))?;
        progress.inc(written);
    }

    writer.finish().context("cannot finalize archive")?;
    progress.finish_and_clear();
    Ok(())
}

/// Locate the launcher stub: explicit override, else the stub installed
/// next to the builder.
fn launcher_stub(config: &BuildConfig) -> Result<PathBuf> {
    if let Some(custom) = &config.launcher {
        if !custom.is_file() {
            bail!("custom launcher {} does not exist", custom.display());
        }
        return Ok(custom.clone());
    }

    let base = if config.windowed {
        "pybale-launcherw"
    } else {
        "pybale-launcher"
    };
    let name = if cfg!(windows) {
        format!("{base}.exe")
    } else {
        base.to_string()
    };

    let own_dir = std::env::current_exe()
        .context("cannot locate own executable")?
        .parent()
        .context("own executable has no parent")?
        .to_path_buf();
    let stub = own_dir.join(&name);
    if stub.is_file() {
        return Ok(stub);
    }
    bail!(
        "launcher stub '{name}' not found next to pybale ({}); \
         reinstall pybale or pass --launcher",
        own_dir.display()
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn finds_compressible_binaries_and_skips_fragile_ones() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("dlls")).unwrap();
        fs::write(tmp.path().join("dlls/_ssl.pyd"), b"x").unwrap();
        fs::write(tmp.path().join("dlls/vcruntime140.dll"), b"x").unwrap();
        fs::write(tmp.path().join("dlls/qwindows.dll"), b"x").unwrap();
        fs::write(tmp.path().join("notes.txt"), b"x").unwrap();

        let found = binaries_to_compress(tmp.path());
        assert_eq!(found.len(), 1);
        assert!(found[0].ends_with("dlls/_ssl.pyd"));
    }

    #[test]
    fn strips_pycache_at_any_depth() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("lib/pkg/__pycache__")).unwrap();
        fs::create_dir_all(tmp.path().join("__pycache__")).unwrap();
        fs::write(tmp.path().join("lib/pkg/__pycache__/mod.pyc"), b"x").unwrap();

        let removed = strip_pycache(tmp.path()).unwrap();
        assert_eq!(removed, 2);
        assert!(!tmp.path().join("lib/pkg/__pycache__").exists());
    }

    #[test]
    fn archive_round_trips_without_password() {
        let tmp = TempDir::new().unwrap();
        let tree = tmp.path().join("tree");
        fs::create_dir_all(tree.join("lib")).unwrap();
        fs::write(tree.join("__main__.py"), b"print('hi')").unwrap();
        fs::write(tree.join("lib/mod.py"), b"x = 1").unwrap();

        let archive = tmp.path().join("out.zip");
        create_archive(&tree, &archive, None).unwrap();

        let mut zip = zip::ZipArchive::new(File::open(&archive).unwrap()).unwrap();
        let names: Vec<String> = (0..zip.len())
            .map(|i| zip.by_index(i).unwrap().name().to_string())
            .collect();
        assert!(names.contains(&"__main__.py".to_string()));
        assert!(names.contains(&"lib/mod.py".to_string()));
    }
}
