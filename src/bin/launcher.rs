//! pybale-launcher - the stub prepended to onefile artifacts.
//!
//! At run time it scans its own image for the embedded zip payload,
//! extracts it to a per-run temp directory, patches the entry script
//! header, and hands off to the bundled interpreter. Without a payload
//! it falls back to folder mode: an extracted tree sitting next to the
//! stub. The temp directory is removed after the child exits; on
//! Windows, files still mapped by the child are cleaned up by a
//! deferred deletion script instead.
//!
//! Set PYBALE_DEBUG=1 to trace every step.

use anyhow::{bail, Context, Result};
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{SystemTime, UNIX_EPOCH};

use pybale::payload::{self, SectionReader};

/// Passphrase for encrypted payload entries; mirrored by the builder.
const PAYLOAD_PASSPHRASE: &[u8] = b"pybale";
/// Entry script inside the tree.
const ENTRY_SCRIPT: &str = "__main__.py";
/// Search-root list written by the builder, one path per line.
const PATH_CONFIG: &str = "pybale.pth";
/// Optional interpreter flags, one per line.
const PYARGS_FILE: &str = "pyargs";
/// Interpreter flags used when no pyargs file is present.
const DEFAULT_PYARGS: &[&str] = &["-B"];
/// Boundary between the injected header and the user's script.
const HEADER_MARKER: &str = "# pybale launcher header above, do not edit\n";

fn main() {
    let code = match run() {
        Ok(code) => code,
        Err(e) => {
            eprintln!("pybale-launcher: {e:#}");
            1
        }
    };
    std::process::exit(code);
}

fn run() -> Result<i32> {
    let exe = std::env::current_exe().context("cannot locate own executable")?;
    debug(&format!("launcher image: {}", exe.display()));

    let offset = payload::locate_archive(&exe)?;

    let (tree, cleanup) = match offset {
        Some(offset) => {
            debug(&format!("payload found at offset {offset}"));
            let tree = extract_payload(&exe, offset)?;
            (tree, true)
        }
        None => {
            // Folder mode: the stub sits inside an extracted tree.
            let dir = exe
                .parent()
                .context("own executable has no parent directory")?
                .to_path_buf();
            if !dir.join(ENTRY_SCRIPT).is_file() {
                bail!(
                    "no embedded payload and no {ENTRY_SCRIPT} next to {}",
                    exe.display()
                );
            }
            debug(&format!("no payload; folder mode in {}", dir.display()));
            (dir, false)
        }
    };

    patch_entry_script(&tree, &exe)?;
    let status = spawn_interpreter(&tree)?;

    if cleanup {
        remove_tree(&tree);
    }
    Ok(status)
}

/// Extract the embedded archive into a fresh per-run directory named
/// after the current time and pid, so concurrent runs never collide.
fn extract_payload(exe: &Path, offset: u64) -> Result<PathBuf> {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let tree = std::env::temp_dir().join(format!("pybale.{secs}.{}", std::process::id()));
    fs::create_dir_all(&tree)
        .with_context(|| format!("cannot create {}", tree.display()))?;
    debug(&format!("extracting to {}", tree.display()));

    let section = SectionReader::open(exe, offset)?;
    let mut archive = zip::ZipArchive::new(section).context("embedded payload is not a valid archive")?;

    for i in 0..archive.len() {
        // Entries may or may not be encrypted; probe plain access
        // first, then retry with the passphrase.
        let needs_password = matches!(
            archive.by_index(i),
            Err(zip::result::ZipError::UnsupportedArchive(_))
        );
        let mut entry = if needs_password {
            archive
                .by_index_decrypt(i, PAYLOAD_PASSPHRASE)
                .context("cannot decrypt payload entry")?
        } else {
            archive.by_index(i).context("cannot read payload entry")?
        };
        let Some(relative) = entry.enclosed_name() else {
            bail!("payload entry {} has an unsafe path", entry.name());
        };
        let target = tree.join(relative);
        if entry.is_dir() {
            fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = File::create(&target)
            .with_context(|| format!("cannot create {}", target.display()))?;
        io::copy(&mut entry, &mut out)
            .with_context(|| format!("cannot extract {}", target.display()))?;

        #[cfg(unix)]
        if let Some(mode) = entry.unix_mode() {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&target, fs::Permissions::from_mode(mode))?;
        }
    }
    Ok(tree)
}

/// Prepend (or refresh) the header that points the running script back
/// at the launcher and at the tree's search roots.
fn patch_entry_script(tree: &Path, exe: &Path) -> Result<()> {
    let entry = tree.join(ENTRY_SCRIPT);
    let original = fs::read_to_string(&entry)
        .with_context(|| format!("cannot read {}", entry.display()))?;

    let roots = search_roots(tree);
    let header = entry_header(exe, &roots);

    match patched_source(&original, &header) {
        Some(patched) => {
            fs::write(&entry, patched)
                .with_context(|| format!("cannot patch {}", entry.display()))?;
            debug("entry script patched");
        }
        None => debug("entry script already patched"),
    }
    Ok(())
}

/// Search roots from the builder's path file, tree-relative, in order.
fn search_roots(tree: &Path) -> Vec<String> {
    match fs::read_to_string(tree.join(PATH_CONFIG)) {
        Ok(content) => content
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect(),
        Err(_) => vec!["dlls".to_string(), "lib".to_string(), ".".to_string()],
    }
}

fn entry_header(exe: &Path, roots: &[String]) -> String {
    let mut header = String::new();
    header.push_str("import os as _pybale_os, sys as _pybale_sys\n");
    header.push_str(&format!("_pybale_sys.argv[0] = {:?}\n", exe.display().to_string()));
    header.push_str(&format!(
        "_pybale_sys.executable = {:?}\n",
        exe.display().to_string()
    ));
    header.push_str(
        "_pybale_root = _pybale_os.path.dirname(_pybale_os.path.abspath(__file__))\n",
    );
    for root in roots.iter().rev() {
        header.push_str(&format!(
            "_pybale_sys.path.insert(0, _pybale_os.path.join(_pybale_root, {root:?}))\n"
        ));
    }
    header.push_str("_pybale_os.chdir(_pybale_root)\n");
    header
}

/// Insert the header above the marker, replacing any previous header.
/// Returns None when the file already carries exactly this header.
fn patched_source(original: &str, header: &str) -> Option<String> {
    match original.find(HEADER_MARKER) {
        Some(idx) => {
            let body = &original[idx + HEADER_MARKER.len()..];
            if &original[..idx] == header {
                return None;
            }
            Some(format!("{header}{HEADER_MARKER}{body}"))
        }
        None => Some(format!("{header}{HEADER_MARKER}{original}")),
    }
}

/// Launch the bundled interpreter on the entry script, forwarding our
/// own arguments, and report its exit code.
fn spawn_interpreter(tree: &Path) -> Result<i32> {
    let python = tree.join(if cfg!(windows) { "python.exe" } else { "python" });
    if !python.is_file() {
        bail!("bundled interpreter missing: {}", python.display());
    }

    let pyargs = interpreter_args(tree);
    debug(&format!("interpreter args: {pyargs:?}"));

    let status = Command::new(&python)
        .args(&pyargs)
        .arg(tree.join(ENTRY_SCRIPT))
        .args(std::env::args_os().skip(1))
        .current_dir(tree)
        .status()
        .with_context(|| format!("cannot start {}", python.display()))?;

    debug(&format!("interpreter exited: {status}"));
    Ok(status.code().unwrap_or(1))
}

fn interpreter_args(tree: &Path) -> Vec<String> {
    match fs::read_to_string(tree.join(PYARGS_FILE)) {
        Ok(content) => content
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .map(str::to_string)
            .collect(),
        Err(_) => DEFAULT_PYARGS.iter().map(|s| s.to_string()).collect(),
    }
}

/// Best-effort removal of the extraction directory. On Windows the
/// child can still hold mappings on its DLLs at this point, so a
/// failed removal schedules a deferred cleanup at next logon instead.
fn remove_tree(tree: &Path) {
    match fs::remove_dir_all(tree) {
        Ok(()) => debug("extraction directory removed"),
        Err(e) => {
            debug(&format!("direct removal failed: {e}"));
            #[cfg(windows)]
            if let Err(e) = schedule_deferred_removal(tree) {
                eprintln!(
                    "pybale-launcher: could not clean up {}: {e}",
                    tree.display()
                );
            }
            #[cfg(not(windows))]
            eprintln!(
                "pybale-launcher: could not clean up {}: {e}",
                tree.display()
            );
        }
    }
}

/// Drop a self-deleting batch file into the Startup folder that removes
/// the leftover extraction directory on next logon.
#[cfg(windows)]
fn schedule_deferred_removal(tree: &Path) -> Result<()> {
    let appdata = std::env::var("APPDATA").context("APPDATA not set")?;
    let startup = Path::new(&appdata)
        .join("Microsoft")
        .join("Windows")
        .join("Start Menu")
        .join("Programs")
        .join("Startup");
    if !startup.is_dir() {
        bail!("Startup folder not found at {}", startup.display());
    }

    let name = tree
        .file_name()
        .context("extraction directory has no name")?
        .to_string_lossy()
        .into_owned();
    let script = startup.join(format!("{name}.cleanup.bat"));
    let body = format!(
        "@echo off\r\nrmdir /s /q \"{}\"\r\ndel \"%~f0\"\r\n",
        tree.display()
    );
    fs::write(&script, body)
        .with_context(|| format!("cannot write {}", script.display()))?;
    debug(&format!("deferred cleanup scheduled: {}", script.display()));
    Ok(())
}

fn debug(msg: &str) {
    if std::env::var_os("PYBALE_DEBUG").is_some_and(|v| v == "1") {
        eprintln!("pybale-launcher: {msg}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patch_inserts_header_and_marker_once() {
        let header = entry_header(Path::new("/opt/app"), &["lib".to_string()]);
        let patched = patched_source("print('hi')\n", &header).unwrap();
        assert!(patched.starts_with(&header));
        assert!(patched.contains(HEADER_MARKER));
        assert!(patched.ends_with("print('hi')\n"));
        assert_eq!(patched.matches(HEADER_MARKER).count(), 1);
    }

    #[test]
    fn patch_is_idempotent() {
        let header = entry_header(Path::new("/opt/app"), &["lib".to_string()]);
        let patched = patched_source("x = 1\n", &header).unwrap();
        assert!(patched_source(&patched, &header).is_none());
    }

    #[test]
    fn patch_replaces_a_stale_header() {
        let old = entry_header(Path::new("/old/place"), &["lib".to_string()]);
        let new = entry_header(Path::new("/new/place"), &["lib".to_string()]);
        let patched = patched_source("x = 1\n", &old).unwrap();

        let repatched = patched_source(&patched, &new).unwrap();
        assert!(repatched.starts_with(&new));
        assert!(!repatched.contains("/old/place"));
        assert!(repatched.ends_with("x = 1\n"));
        assert_eq!(repatched.matches(HEADER_MARKER).count(), 1);
    }

    #[test]
    fn header_orders_roots_first_wins() {
        let header = entry_header(
            Path::new("/x"),
            &["dlls".to_string(), "lib".to_string(), ".".to_string()],
        );
        // Reversed insertion at index 0 leaves "dlls" in front.
        let dlls = header.find("\"dlls\"").unwrap();
        let lib = header.find("\"lib\"").unwrap();
        assert!(dlls > lib);
    }

    #[test]
    fn pyargs_default_when_file_missing() {
        let tmp = tempfile::TempDir::new().unwrap();
        assert_eq!(interpreter_args(tmp.path()), vec!["-B".to_string()]);
    }

    #[test]
    fn pyargs_read_from_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        fs::write(tmp.path().join(PYARGS_FILE), "-B\n# comment\n-O\n\n").unwrap();
        assert_eq!(
            interpreter_args(tmp.path()),
            vec!["-B".to_string(), "-O".to_string()]
        );
    }
}
