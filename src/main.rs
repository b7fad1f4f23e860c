//! pybale - bundles a Python script and everything it imports into a
//! standalone artifact:
//! - resolves the transitive import closure by actually loading it
//! - lays out a private interpreter runtime next to the dependencies
//! - packs the tree into a folder, a zip, or a single executable

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::fs;
use std::path::{Path, PathBuf};

use pybale::config::{BuildConfig, OutputMode, DEFAULT_EXCLUDES};
use pybale::layout::{LayoutBuilder, RuntimeInfo};
use pybale::plugin::Registry;
use pybale::{linked, package, probe, resolve};

#[derive(Parser)]
#[command(name = "pybale")]
#[command(about = "Standalone Python application bundler")]
#[command(
    after_help = "QUICK START:\n  pybale build app.py            Single executable\n  pybale build app.py --folder   Plain directory tree\n  pybale refresh                 Re-fetch the linked-reference map\n  pybale clean app.py            Remove build artifacts"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Bundle a script (resolves dependencies automatically)
    Build {
        /// The script to package
        source: PathBuf,

        /// Produce a plain directory tree instead of an executable
        #[arg(long, conflicts_with = "zip")]
        folder: bool,

        /// Produce a zip archive instead of an executable
        #[arg(long)]
        zip: bool,

        /// Use the console-less launcher stub (Windows GUI apps)
        #[arg(short, long)]
        windowed: bool,

        /// Force-include a unit the scan cannot see (repeatable)
        #[arg(short, long = "package", value_name = "NAME")]
        packages: Vec<String>,

        /// Copy an extra file or folder into the output root (repeatable)
        #[arg(short, long = "copy", value_name = "PATH")]
        copy_paths: Vec<PathBuf>,

        /// Additional exclusion pattern for folder copies (repeatable)
        #[arg(short, long = "exclude", value_name = "GLOB")]
        excludes: Vec<String>,

        /// Load a plugin: JSON file path or built-in name (repeatable)
        #[arg(long = "plugin", value_name = "SPEC")]
        plugins: Vec<String>,

        /// Skip bytecode precompilation
        #[arg(long)]
        no_compile: bool,

        /// Skip UPX binary compression
        #[arg(long)]
        no_compress: bool,

        /// Leave the onefile payload unencrypted
        #[arg(long)]
        no_password: bool,

        /// Discard the cached linked-reference map before resolving
        #[arg(long)]
        force_refresh: bool,

        /// Keep the intermediate tree and probe driver files
        #[arg(long)]
        keep_files: bool,

        /// Use a custom launcher stub
        #[arg(long, value_name = "PATH")]
        launcher: Option<PathBuf>,

        /// UPX worker count (default: CPU count)
        #[arg(short, long)]
        jobs: Option<usize>,

        #[arg(short, long)]
        verbose: bool,
    },

    /// Remove the build tree and probe leftovers for a script
    Clean {
        /// The script whose artifacts to remove
        source: PathBuf,
    },

    /// Re-fetch the linked-reference map into the cache
    Refresh {
        #[arg(short, long)]
        verbose: bool,
    },

    /// Show the resolved configuration for a script
    Show {
        source: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Build {
            source,
            folder,
            zip,
            windowed,
            packages,
            copy_paths,
            excludes,
            plugins,
            no_compile,
            no_compress,
            no_password,
            force_refresh,
            keep_files,
            launcher,
            jobs,
            verbose,
        } => {
            let output = if folder {
                OutputMode::Folder
            } else if zip {
                OutputMode::Zip
            } else {
                OutputMode::OneFile
            };

            let (source_file, source_dir, dest_dir) = BuildConfig::resolve(&source)?;
            let env_vars = BuildConfig::load_env(&source_dir);

            let mut exclude_patterns: Vec<String> =
                DEFAULT_EXCLUDES.iter().map(|s| s.to_string()).collect();
            exclude_patterns.extend(excludes);

            let config = BuildConfig {
                source_file,
                source_dir,
                dest_dir,
                python: BuildConfig::find_python(&env_vars)?,
                cache_dir: BuildConfig::cache_dir(&env_vars),
                output,
                windowed,
                verbose,
                keep_files,
                packages,
                copy_paths,
                exclude_patterns,
                compile_bytecode: !no_compile,
                compress_binaries: !no_compress,
                password: !no_password,
                force_refresh,
                launcher,
                jobs,
            };
            cmd_build(&config, &plugins)?;
        }

        Commands::Clean { source } => {
            cmd_clean(&source)?;
        }

        Commands::Refresh { verbose } => {
            let env_vars = BuildConfig::load_env(&std::env::current_dir()?);
            let cache_dir = BuildConfig::cache_dir(&env_vars);
            let cwd = std::env::current_dir()?;
            let map = linked::load(&cache_dir, &cwd, true, verbose);
            if map.is_empty() {
                eprintln!("  [WARN] linked-reference map is empty after refresh");
            } else {
                println!("Linked-reference map refreshed in {}", cache_dir.display());
            }
        }

        Commands::Show { source } => {
            let (source_file, source_dir, dest_dir) = BuildConfig::resolve(&source)?;
            let env_vars = BuildConfig::load_env(&source_dir);
            let config = BuildConfig {
                source_file,
                source_dir,
                dest_dir,
                python: BuildConfig::find_python(&env_vars)?,
                cache_dir: BuildConfig::cache_dir(&env_vars),
                output: OutputMode::OneFile,
                windowed: false,
                verbose: false,
                keep_files: false,
                packages: Vec::new(),
                copy_paths: Vec::new(),
                exclude_patterns: DEFAULT_EXCLUDES.iter().map(|s| s.to_string()).collect(),
                compile_bytecode: true,
                compress_binaries: true,
                password: true,
                force_refresh: false,
                launcher: None,
                jobs: None,
            };
            config.print();
        }
    }

    Ok(())
}

fn cmd_build(config: &BuildConfig, plugins: &[String]) -> Result<()> {
    if config.verbose {
        config.print();
    }

    let mut registry = Registry::new();
    registry.load_builtin("qt-stripper")?;
    if cfg!(windows) {
        registry.load_builtin("pywin32")?;
    }
    registry.load_dir(&config.source_dir.join("plugins"))?;
    for spec in plugins {
        registry.load(spec)?;
    }

    let map = linked::load(
        &config.cache_dir,
        &config.source_dir,
        config.force_refresh,
        config.verbose,
    );
    let units = resolve::resolve_units(config, &registry.extra_packages(), &map)?;
    println!("Resolved {} units", units.len());

    let runtime = RuntimeInfo::detect(&config.python)?;
    let builder = LayoutBuilder::new(config)?;
    builder.prepare_tree()?;
    builder.copy_runtime(&runtime)?;
    builder.copy_extras()?;
    builder.place_units(&units, &mut registry)?;
    builder.install_entry()?;

    package::package(config)?;
    Ok(())
}

fn cmd_clean(source: &Path) -> Result<()> {
    let (source_file, source_dir, dest_dir) = BuildConfig::resolve(source)?;

    if dest_dir.exists() {
        fs::remove_dir_all(&dest_dir)?;
        println!("Removed {}", dest_dir.display());
    }

    let stem = source_file
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let leftovers = [
        source_dir.join(format!("{stem}.zip")),
        source_dir.join(format!("{stem}.payload.zip")),
        source_dir.join(probe::DRIVER_FILE),
        source_dir.join(probe::OUTPUT_FILE),
        source_dir.join(probe::CLASSIFY_DRIVER_FILE),
        source_dir.join(probe::CLASSIFY_OUTPUT_FILE),
    ];
    for path in leftovers {
        if path.exists() {
            fs::remove_file(&path)?;
            println!("Removed {}", path.display());
        }
    }
    Ok(())
}
