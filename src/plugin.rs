//! Extension point dispatcher.
//!
//! Plugins register handlers bound to a unit name. A handler declares
//! where it runs relative to default placement (`before`/`after`) and
//! whether default placement still runs at all. Handlers are
//! declarative: a list of actions over the output tree, not executable
//! plugin source. External plugins are JSON files; the historical
//! GUI-toolkit strippers ship built in under well-known names.
//!
//! Handlers run with the same process state as the build and are
//! user-supplied: an action failing aborts the build.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use crate::files::{self, ExcludeFilter};
use crate::probe::ResolvedUnit;

/// Binding name for handlers that run once globally rather than for a
/// specific unit.
pub const GLOBAL_UNIT: &str = "__build__";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Placement {
    Before,
    After,
}

/// One declarative step a handler may take against the output tree.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// Remove everything under the tree root whose relative path
    /// matches one of the glob patterns.
    RemoveMatching { patterns: Vec<String> },
    /// Remove every child of `dir` (tree-relative) except the named
    /// entries.
    PruneDirKeeping { dir: String, keep: Vec<String> },
    /// Copy a directory that lives next to the unit's origin file into
    /// the tree (e.g. a native companion folder shipped alongside a
    /// binary extension).
    CopyOriginSibling { sibling: String, dest: String },
    /// Copy an arbitrary directory (relative paths resolve against the
    /// project directory) into the tree, exclusion-filtered.
    CopyTree { from: String, to: String },
}

/// Plugin-registered hook bound to a unit name.
#[derive(Debug, Clone, Deserialize)]
pub struct Handler {
    /// Unit name this handler matches; defaults to the global binding.
    #[serde(default = "default_unit")]
    pub unit: String,
    #[serde(default = "default_placement")]
    pub placement: Placement,
    /// Whether default placement still runs for the matched unit.
    #[serde(default = "default_continue", rename = "continue")]
    pub continue_default: bool,
    #[serde(default)]
    pub actions: Vec<Action>,
    /// Extra unit names the plugin wants force-included in probing.
    #[serde(default)]
    pub extra_packages: Vec<String>,
}

fn default_unit() -> String {
    GLOBAL_UNIT.to_string()
}
fn default_placement() -> Placement {
    Placement::After
}
fn default_continue() -> bool {
    true
}

/// A plugin file is one handler or a list of them.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PluginFile {
    One(Handler),
    Many(Vec<Handler>),
}

/// Everything a handler may need while acting on one unit.
pub struct HookContext<'a> {
    pub unit: &'a ResolvedUnit,
    pub tree_root: &'a Path,
    pub source_dir: &'a Path,
    pub excludes: &'a ExcludeFilter,
    pub verbose: bool,
}

/// Explicit handler registry, passed through the pipeline instead of
/// living in process-global state.
#[derive(Default)]
pub struct Registry {
    handlers: Vec<Handler>,
    /// Indices of handlers that already ran this build.
    ran: BTreeSet<usize>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: Handler) {
        self.handlers.push(handler);
    }

    /// Load a plugin by JSON file path or built-in name.
    pub fn load(&mut self, spec: &str) -> Result<()> {
        let path = Path::new(spec);
        if path.is_file() {
            return self.load_file(path);
        }
        self.load_builtin(spec)
    }

    pub fn load_file(&mut self, path: &Path) -> Result<()> {
        println!("Loading plugin: {}", path.display());
        let content = fs::read_to_string(path)
            .with_context(|| format!("cannot read plugin {}", path.display()))?;
        let parsed: PluginFile = serde_json::from_str(&content)
            .with_context(|| format!("plugin {} is not valid", path.display()))?;
        match parsed {
            PluginFile::One(h) => self.register(h),
            PluginFile::Many(hs) => hs.into_iter().for_each(|h| self.register(h)),
        }
        Ok(())
    }

    /// Load every `*.json` plugin file from a directory, in name order.
    /// A missing directory is not an error.
    pub fn load_dir(&mut self, dir: &Path) -> Result<()> {
        if !dir.is_dir() {
            return Ok(());
        }
        let mut files: Vec<_> = fs::read_dir(dir)?
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .collect();
        files.sort();
        for file in files {
            self.load_file(&file)?;
        }
        Ok(())
    }

    pub fn load_builtin(&mut self, name: &str) -> Result<()> {
        match name {
            "qt-stripper" => {
                println!("Loading built-in plugin: qt-stripper");
                self.register(builtin_qt_stripper());
            }
            "pywin32" => {
                println!("Loading built-in plugin: pywin32");
                for handler in builtin_pywin32() {
                    self.register(handler);
                }
            }
            other => bail!("unknown plugin '{other}' (not a file, not a built-in)"),
        }
        Ok(())
    }

    /// Extra unit names requested by loaded plugins.
    pub fn extra_packages(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .handlers
            .iter()
            .flat_map(|h| h.extra_packages.iter().cloned())
            .collect();
        names.sort();
        names.dedup();
        names
    }

    /// Run `before`-placed handlers for a unit and decide whether
    /// default placement still runs.
    ///
    /// Default placement is skipped only when every matching handler
    /// declares "do not continue". Each handler runs at most once per
    /// build, even if it matches repeatedly.
    pub fn dispatch_before(&mut self, ctx: &HookContext) -> Result<bool> {
        let matching: Vec<usize> = self.matching(&ctx.unit.name);
        if matching.is_empty() {
            return Ok(true);
        }

        let run_default = matching
            .iter()
            .any(|&i| self.handlers[i].continue_default);

        for i in matching {
            if self.handlers[i].placement == Placement::Before && self.ran.insert(i) {
                let handler = self.handlers[i].clone();
                run_handler(&handler, ctx)?;
            }
        }
        Ok(run_default)
    }

    /// Run `after`-placed handlers for a unit.
    pub fn dispatch_after(&mut self, ctx: &HookContext) -> Result<()> {
        for i in self.matching(&ctx.unit.name) {
            if self.handlers[i].placement == Placement::After && self.ran.insert(i) {
                let handler = self.handlers[i].clone();
                run_handler(&handler, ctx)?;
            }
        }
        Ok(())
    }

    /// True if any handler claims the unit name.
    pub fn claims(&self, unit: &str) -> bool {
        !self.matching(unit).is_empty()
    }

    fn matching(&self, unit: &str) -> Vec<usize> {
        self.handlers
            .iter()
            .enumerate()
            .filter(|(_, h)| h.unit == unit)
            .map(|(i, _)| i)
            .collect()
    }
}

fn run_handler(handler: &Handler, ctx: &HookContext) -> Result<()> {
    if ctx.verbose {
        println!(
            "  [plugin] running {:?} handler for '{}'",
            handler.placement, handler.unit
        );
    }
    for action in &handler.actions {
        run_action(action, ctx)
            .with_context(|| format!("plugin handler for '{}' failed", handler.unit))?;
    }
    Ok(())
}

fn run_action(action: &Action, ctx: &HookContext) -> Result<()> {
    match action {
        Action::RemoveMatching { patterns } => files::remove_matching(ctx.tree_root, patterns),
        Action::PruneDirKeeping { dir, keep } => {
            let target = ctx.tree_root.join(dir);
            if !target.is_dir() {
                return Ok(());
            }
            for entry in fs::read_dir(&target)? {
                let entry = entry?;
                let name = entry.file_name().to_string_lossy().into_owned();
                if keep.iter().any(|k| k == &name) {
                    continue;
                }
                let path = entry.path();
                if path.is_dir() {
                    fs::remove_dir_all(&path)?;
                } else {
                    fs::remove_file(&path)?;
                }
            }
            Ok(())
        }
        Action::CopyOriginSibling { sibling, dest } => {
            let Some(origin) = &ctx.unit.origin else {
                bail!("unit '{}' has no origin to locate '{sibling}' against", ctx.unit.name);
            };
            let source = origin
                .parent()
                .context("unit origin has no parent directory")?
                .join(sibling);
            if !source.is_dir() {
                eprintln!(
                    "  [WARN] companion folder {} not found, skipping",
                    source.display()
                );
                return Ok(());
            }
            files::copy_tree_filtered(&source, &ctx.tree_root.join(dest), ctx.excludes)
        }
        Action::CopyTree { from, to } => {
            let source = Path::new(from);
            let source = if source.is_absolute() {
                source.to_path_buf()
            } else {
                ctx.source_dir.join(source)
            };
            files::copy_tree_filtered(&source, &ctx.tree_root.join(to), ctx.excludes)
        }
    }
}

/// Qt submodules pruned by the built-in stripper: not needed for a
/// plain widgets application.
const QT_UNNEEDED: &[&str] = &[
    "QtXml",
    "QtXmlPatterns",
    "QtNetwork",
    "QtMultimedia",
    "QtMultimediaWidgets",
    "QtQml",
    "QtQuick",
    "QtQuickWidgets",
    "QtQuick3D",
    "QtSensors",
    "QtWebChannel",
    "QtSerialPort",
    "QtSql",
    "QtRemoteObjects",
    "QtWebSockets",
    "QtBluetooth",
    "QtPositioning",
    "QtPrintSupport",
    "QtTextToSpeech",
    "QtLocation",
    "QtHelp",
    "QtNfc",
];

fn builtin_qt_stripper() -> Handler {
    let mut patterns = vec![
        "lib/PyQt5/bindings".to_string(),
        "lib/PyQt5/uic".to_string(),
        "lib/PyQt5/Qt5/qml".to_string(),
    ];
    for module in QT_UNNEEDED {
        patterns.push(format!("lib/PyQt5/{module}.pyd"));
        patterns.push(format!("lib/PyQt5/{module}.pyi"));
        patterns.push(format!("lib/PyQt5/Qt5/bin/{module}.dll"));
        // Translation files are keyed by the lowercased module name
        // minus the "Qt" prefix.
        let stem = module[2..].to_lowercase();
        patterns.push(format!("lib/PyQt5/Qt5/translations/qt{stem}*"));
    }

    Handler {
        unit: "PyQt5".to_string(),
        placement: Placement::After,
        continue_default: true,
        actions: vec![
            Action::RemoveMatching { patterns },
            Action::PruneDirKeeping {
                dir: "lib/PyQt5/Qt5/plugins".to_string(),
                keep: vec!["platforms".to_string()],
            },
        ],
        extra_packages: Vec::new(),
    }
}

fn builtin_pywin32() -> Vec<Handler> {
    vec![Handler {
        unit: "pythoncom".to_string(),
        placement: Placement::After,
        continue_default: true,
        actions: vec![Action::CopyOriginSibling {
            sibling: "pywin32_system32".to_string(),
            dest: "lib/pywin32_system32".to_string(),
        }],
        extra_packages: vec![
            "pythoncom".to_string(),
            "win32event".to_string(),
            "winerror".to_string(),
            "traceback".to_string(),
            "pickle".to_string(),
            "glob".to_string(),
        ],
    }]
}
