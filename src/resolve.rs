//! Dependency closure resolution pipeline.
//!
//! Scan -> probe -> linked closure, iterated: resolving a name can pull
//! in units absent from the previous candidate set, and closure-added
//! names can themselves pull in more units when actually loaded. The
//! loop runs until the closed set stops growing, with a floor of two
//! probes and a hard cap. A fixed two-pass cut-off silently
//! under-resolves deeper chains.

use anyhow::Result;
use std::collections::BTreeSet;

use crate::config::BuildConfig;
use crate::linked::LinkedMap;
use crate::probe::{Prober, ResolvedUnit};
use crate::scan;

/// Passes never observed to matter beyond 3 in practice; the cap only
/// guards against a pathological linked map.
pub const MAX_PROBE_PASSES: usize = 5;

/// Resolve the full dependency closure of the configured script.
///
/// `extra_packages` are user- or plugin-declared names force-included
/// in every pass. Returns one unit per distinct top-level name, sorted.
pub fn resolve_units(
    config: &BuildConfig,
    extra_packages: &[String],
    map: &LinkedMap,
) -> Result<Vec<ResolvedUnit>> {
    println!("Scanning {}", config.source_file.display());
    let scan_result = scan::recursive_scan(&config.source_file, config.verbose)?;
    if config.verbose {
        println!(
            "  [scan] {} files visited, {} candidate names",
            scan_result.visited.len(),
            scan_result.top_level.len()
        );
    }

    let mut forced: BTreeSet<String> = config.packages.iter().cloned().collect();
    forced.extend(extra_packages.iter().cloned());

    let mut candidates = scan_result.top_level;
    candidates.extend(forced.iter().cloned());

    let prober = Prober::new(
        &config.python,
        &config.source_dir,
        config.verbose,
        config.keep_files,
    );

    let mut resolved: BTreeSet<String> = BTreeSet::new();
    for pass in 1..=MAX_PROBE_PASSES {
        println!("Running import probe (pass {pass})");
        let realized = prober.realized_units(&candidates)?;

        if realized.is_empty() {
            // ProbeError policy: degrade to what is already known.
            eprintln!("  [WARN] probe pass {pass} produced nothing; keeping previous result");
            break;
        }

        // Dedup on first path segment: submodules collapse into their
        // top-level unit.
        let mut cleaned: BTreeSet<String> = realized
            .iter()
            .filter_map(|name| name.split('.').next())
            .filter(|seg| !seg.is_empty())
            .map(|seg| seg.to_string())
            .collect();
        cleaned.extend(forced.iter().cloned());

        let closed = map.closure(&cleaned);
        let stable = closed == resolved;
        resolved = closed;
        candidates = resolved.clone();

        if stable && pass >= 2 {
            break;
        }
    }

    // The probe always reports the driver itself.
    resolved.remove("__main__");

    println!("Classifying {} resolved units", resolved.len());
    let mut units = prober.classify(&resolved)?;
    units.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(units)
}
