//! Linked-reference closure.
//!
//! Some units load native companions or optional submodules that
//! neither static scanning nor dynamic probing can see unless those
//! companions are already importable on the build machine. An
//! externally maintained map (unit name -> implied unit names) corrects
//! for that. The map is cached locally and refreshed on a 24 h TTL from
//! a remote copy; a local override file wins when an explicit marker
//! file enables it. Network failure never aborts a build.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::fs;
use std::path::Path;

use crate::process::Cmd;

/// Remote copy of the map, fetched with curl on refresh.
pub const REMOTE_URL: &str =
    "https://raw.githubusercontent.com/pybale/pybale/main/linked_units.json";
/// Cache and override file name.
pub const MAP_FILE: &str = "linked_units.json";
/// Companion timestamp file (RFC 3339 UTC).
pub const TIMESTAMP_FILE: &str = "linked_units.timestamp";
/// Marker file that enables the local override next to the script.
pub const LOCAL_MARKER_FILE: &str = "linked_units.local";

const REFRESH_TTL_HOURS: i64 = 24;

/// Name -> ordered list of implied names. Read-only once loaded.
#[derive(Debug, Default, Clone)]
pub struct LinkedMap {
    map: HashMap<String, Vec<String>>,
}

impl LinkedMap {
    pub fn from_map(map: HashMap<String, Vec<String>>) -> Self {
        Self { map }
    }

    pub fn parse(content: &str) -> Result<Self> {
        let map: HashMap<String, Vec<String>> = serde_json::from_str(content)?;
        Ok(Self { map })
    }

    pub fn implied(&self, name: &str) -> &[String] {
        self.map.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Close `seed` under the implied-unit relation.
    ///
    /// BFS with a membership test before enqueue, so cyclic maps
    /// terminate and every name is visited once.
    pub fn closure(&self, seed: &BTreeSet<String>) -> BTreeSet<String> {
        let mut resolved: BTreeSet<String> = BTreeSet::new();
        let mut queue: VecDeque<String> = seed.iter().cloned().collect();

        while let Some(name) = queue.pop_front() {
            if !resolved.insert(name.clone()) {
                continue;
            }
            for implied in self.implied(&name) {
                if !resolved.contains(implied) {
                    queue.push_back(implied.clone());
                }
            }
        }
        resolved
    }
}

/// Load the map, refreshing the cache when stale.
///
/// Precedence: explicitly enabled local override, then the cache file,
/// then a local file without the marker, then an empty map.
pub fn load(cache_dir: &Path, source_dir: &Path, force_refresh: bool, verbose: bool) -> LinkedMap {
    let cache_file = cache_dir.join(MAP_FILE);
    let timestamp_file = cache_dir.join(TIMESTAMP_FILE);

    if force_refresh {
        let _ = fs::remove_file(&cache_file);
        let _ = fs::remove_file(&timestamp_file);
    }
    let _ = fs::create_dir_all(cache_dir);

    let timestamp = fs::read_to_string(&timestamp_file).ok();
    if needs_refresh(cache_file.exists(), timestamp.as_deref(), Utc::now(), verbose) {
        refresh(&cache_file, &timestamp_file);
    }

    let local_file = source_dir.join(MAP_FILE);
    if local_file.exists() && source_dir.join(LOCAL_MARKER_FILE).exists() {
        match read_map(&local_file) {
            Some(map) => {
                println!("Using local {MAP_FILE} (override enabled)");
                return map;
            }
            None => eprintln!("  [WARN] local {MAP_FILE} is invalid"),
        }
    }

    if cache_file.exists() {
        if let Some(map) = read_map(&cache_file) {
            if verbose {
                println!("  [linked] using cached {MAP_FILE}");
            }
            return map;
        }
        eprintln!("  [WARN] cached {MAP_FILE} is invalid");
    }

    if local_file.exists() {
        if let Some(map) = read_map(&local_file) {
            println!("Using local {MAP_FILE} (no cache available)");
            return map;
        }
    }

    eprintln!("  [WARN] no valid {MAP_FILE} available; continuing without linked references");
    LinkedMap::default()
}

/// Decide whether the cache must be refreshed.
///
/// Missing cache file: refresh. Unparsable timestamp: refresh. Cache
/// present but no timestamp: trust the cache.
pub fn needs_refresh(
    cache_exists: bool,
    timestamp: Option<&str>,
    now: DateTime<Utc>,
    verbose: bool,
) -> bool {
    if !cache_exists {
        return true;
    }
    let Some(raw) = timestamp else {
        return false;
    };
    match DateTime::parse_from_rfc3339(raw.trim()) {
        Ok(last) => {
            let stale = now - last.with_timezone(&Utc) >= Duration::hours(REFRESH_TTL_HOURS);
            if stale && verbose {
                println!("  [linked] cache older than {REFRESH_TTL_HOURS} h, will refresh");
            }
            stale
        }
        Err(e) => {
            eprintln!("  [WARN] invalid {TIMESTAMP_FILE}, forcing refresh: {e}");
            true
        }
    }
}

/// Fetch the remote map with curl; failure only logs a warning.
pub fn refresh(cache_file: &Path, timestamp_file: &Path) {
    println!("Refreshing {MAP_FILE}");
    let result = Cmd::new("curl")
        .args(["-fsSL", "--max-time", "30", "-o"])
        .arg_path(cache_file)
        .arg(REMOTE_URL)
        .allow_fail()
        .run();

    match result {
        Ok(r) if r.success() => {
            if let Err(e) = fs::write(timestamp_file, Utc::now().to_rfc3339()) {
                eprintln!("  [WARN] cannot write {TIMESTAMP_FILE}: {e}");
            }
        }
        Ok(r) => eprintln!(
            "  [WARN] failed to download {MAP_FILE} (curl exit {}); using previous data",
            r.code()
        ),
        Err(e) => eprintln!("  [WARN] failed to run curl: {e}; using previous data"),
    }
}

fn read_map(path: &Path) -> Option<LinkedMap> {
    let content = fs::read_to_string(path).ok()?;
    LinkedMap::parse(&content).ok()
}
