//! Integration tests for the pybale build pipeline.
//!
//! These drive the layout builder, the plugin dispatcher, and the
//! packaging stage against mock projects and mock resolved units.
//! No Python interpreter is required.

mod helpers;

use helpers::{
    assert_dir_exists, assert_file_contains, assert_file_exists, assert_not_exists,
    create_mock_package, file_listing, TestEnv,
};
use pybale::layout::LayoutBuilder;
use pybale::package;
use pybale::payload::{self, SectionReader};
use pybale::plugin::{Action, Handler, Placement, Registry, GLOBAL_UNIT};
use pybale::probe::{OriginKind, ResolvedUnit};
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};

fn unit(name: &str, kind: OriginKind, origin: Option<PathBuf>) -> ResolvedUnit {
    ResolvedUnit {
        name: name.to_string(),
        kind,
        origin,
    }
}

/// A representative mix of resolved units against a mock site dir.
fn mock_units(env: &TestEnv) -> Vec<ResolvedUnit> {
    let pkg = create_mock_package(&env.site_dir, "mypkg", &["core", "util"]);
    fs::write(env.site_dir.join("six.py"), "# six\n").unwrap();
    fs::write(env.site_dir.join("_fast.so"), b"\x7fELF fake").unwrap();

    let local = env.source_dir.join("assets_mod");
    fs::create_dir_all(&local).unwrap();
    fs::write(local.join("__init__.py"), "").unwrap();
    fs::write(local.join("README.md"), "internal notes").unwrap();

    vec![
        unit("mypkg", OriginKind::PackageDirectory, Some(pkg)),
        unit("six", OriginKind::SingleFile, Some(env.site_dir.join("six.py"))),
        unit("_fast", OriginKind::NativeBinary, Some(env.site_dir.join("_fast.so"))),
        unit("assets_mod", OriginKind::LocalProjectFolder, Some(local)),
        unit("ctypes", OriginKind::Unresolved, None),
    ]
}

// =============================================================================
// Layout tests
// =============================================================================

#[test]
fn test_layout_places_each_unit_kind() {
    let env = TestEnv::new();
    let script = env.write_script("app.py", "print('hi')\n");
    let config = env.config(&script);
    let units = mock_units(&env);

    let builder = LayoutBuilder::new(&config).unwrap();
    builder.prepare_tree().unwrap();
    builder.place_units(&units, &mut Registry::new()).unwrap();
    builder.install_entry().unwrap();

    let tree = &config.dest_dir;
    assert_file_exists(&tree.join("lib/mypkg/__init__.py"));
    assert_file_exists(&tree.join("lib/mypkg/core.py"));
    assert_file_exists(&tree.join("lib/six.py"));
    assert_file_exists(&tree.join("dlls/_fast.so"));
    assert_dir_exists(&tree.join("assets_mod"));
    // Exclusion patterns apply to local project folders.
    assert_not_exists(&tree.join("assets_mod/README.md"));
}

#[test]
fn test_layout_writes_launcher_metadata() {
    let env = TestEnv::new();
    let script = env.write_script("my_tool.py", "print('hi')\n");
    let config = env.config(&script);

    let builder = LayoutBuilder::new(&config).unwrap();
    builder.prepare_tree().unwrap();
    builder.install_entry().unwrap();

    let tree = &config.dest_dir;
    assert_file_exists(&tree.join("__main__.py"));
    assert_file_contains(&tree.join("entrypoint"), "my_tool.py");
    assert_eq!(
        fs::read_to_string(tree.join("pybale.pth")).unwrap(),
        "dlls\nlib\n.\n"
    );
}

#[test]
fn test_rebuild_produces_an_identical_tree() {
    let env = TestEnv::new();
    let script = env.write_script("app.py", "print('hi')\n");
    let config = env.config(&script);
    let units = mock_units(&env);

    let builder = LayoutBuilder::new(&config).unwrap();
    let snapshot = |tree: &std::path::Path| -> Vec<(String, Vec<u8>)> {
        file_listing(tree)
            .into_iter()
            .map(|f| {
                let bytes = fs::read(tree.join(&f)).unwrap();
                (f, bytes)
            })
            .collect()
    };

    builder.prepare_tree().unwrap();
    builder.place_units(&units, &mut Registry::new()).unwrap();
    builder.install_entry().unwrap();
    // Plant a file a stale tree would carry; the rebuild must not keep it.
    fs::write(config.dest_dir.join("lib/stale.py"), "old").unwrap();
    let first: Vec<(String, Vec<u8>)> = snapshot(&config.dest_dir)
        .into_iter()
        .filter(|(f, _)| f != "lib/stale.py")
        .collect();

    builder.prepare_tree().unwrap();
    builder.place_units(&units, &mut Registry::new()).unwrap();
    builder.install_entry().unwrap();
    let second = snapshot(&config.dest_dir);

    // Same file set, same contents as a from-scratch build.
    assert_eq!(first, second);
    assert_not_exists(&config.dest_dir.join("lib/stale.py"));
}

#[test]
fn test_unresolved_units_are_skipped_not_fatal() {
    let env = TestEnv::new();
    let script = env.write_script("app.py", "print('hi')\n");
    let config = env.config(&script);
    let units = vec![
        unit("ctypes", OriginKind::Unresolved, None),
        // Origin pointing nowhere: logged and skipped.
        unit("ghost", OriginKind::SingleFile, Some(PathBuf::from("/nope/ghost.py"))),
    ];

    let builder = LayoutBuilder::new(&config).unwrap();
    builder.prepare_tree().unwrap();
    builder.place_units(&units, &mut Registry::new()).unwrap();
    assert_dir_exists(&config.dest_dir.join("lib"));
}

// =============================================================================
// Plugin dispatch tests
// =============================================================================

#[test]
fn test_after_handler_prunes_a_placed_package() {
    let env = TestEnv::new();
    let script = env.write_script("app.py", "print('hi')\n");
    let config = env.config(&script);
    let units = mock_units(&env);

    let mut registry = Registry::new();
    registry.register(Handler {
        unit: "mypkg".to_string(),
        placement: Placement::After,
        continue_default: true,
        actions: vec![Action::RemoveMatching {
            patterns: vec!["lib/mypkg/util.py".to_string()],
        }],
        extra_packages: Vec::new(),
    });

    let builder = LayoutBuilder::new(&config).unwrap();
    builder.prepare_tree().unwrap();
    builder.place_units(&units, &mut registry).unwrap();

    assert_file_exists(&config.dest_dir.join("lib/mypkg/core.py"));
    assert_not_exists(&config.dest_dir.join("lib/mypkg/util.py"));
}

#[test]
fn test_noncontinue_handler_replaces_default_placement() {
    let env = TestEnv::new();
    let script = env.write_script("app.py", "print('hi')\n");
    let config = env.config(&script);
    let units = mock_units(&env);

    let mut registry = Registry::new();
    registry.register(Handler {
        unit: "mypkg".to_string(),
        placement: Placement::Before,
        continue_default: false,
        actions: Vec::new(),
        extra_packages: Vec::new(),
    });

    let builder = LayoutBuilder::new(&config).unwrap();
    builder.prepare_tree().unwrap();
    builder.place_units(&units, &mut registry).unwrap();

    // Default placement suppressed for the claimed unit only.
    assert_not_exists(&config.dest_dir.join("lib/mypkg"));
    assert_file_exists(&config.dest_dir.join("lib/six.py"));
}

#[test]
fn test_global_handlers_run_once_per_build() {
    let env = TestEnv::new();
    let script = env.write_script("app.py", "print('hi')\n");
    let config = env.config(&script);
    let units = mock_units(&env);

    fs::create_dir_all(env.source_dir.join("branding")).unwrap();
    fs::write(env.source_dir.join("branding/logo.txt"), "logo").unwrap();

    // A handler that names no unit binds to the whole build.
    let mut registry = Registry::new();
    registry.register(Handler {
        unit: GLOBAL_UNIT.to_string(),
        placement: Placement::After,
        continue_default: true,
        actions: vec![Action::CopyTree {
            from: "branding".to_string(),
            to: "branding".to_string(),
        }],
        extra_packages: Vec::new(),
    });

    let builder = LayoutBuilder::new(&config).unwrap();
    builder.prepare_tree().unwrap();
    builder.place_units(&units, &mut registry).unwrap();

    assert_file_exists(&config.dest_dir.join("branding/logo.txt"));
    // Every per-unit placement still happened.
    assert_file_exists(&config.dest_dir.join("lib/six.py"));
}

// =============================================================================
// Packaging tests
// =============================================================================

#[test]
fn test_onefile_payload_round_trip() {
    let env = TestEnv::new();
    let tree = env.source_dir.join("app.build");
    fs::create_dir_all(tree.join("lib")).unwrap();
    fs::write(tree.join("__main__.py"), "print('hi')\n").unwrap();
    fs::write(tree.join("lib/six.py"), "# six\n").unwrap();

    let archive = env.source_dir.join("payload.zip");
    package::create_archive(&tree, &archive, None).unwrap();

    // A stub with no zip signature of its own.
    let stub = env.source_dir.join("stub");
    fs::write(&stub, vec![0x7fu8; 3000]).unwrap();
    let output = env.source_dir.join("app");
    payload::append_payload(&stub, &archive, &output).unwrap();

    let offset = payload::find_payload_offset(File::open(&output).unwrap())
        .unwrap()
        .expect("payload signature not found");
    assert_eq!(offset, 3000);

    let section = SectionReader::open(&output, offset).unwrap();
    let mut zip = zip::ZipArchive::new(section).unwrap();
    let mut entry = zip.by_name("__main__.py").unwrap();
    let mut content = String::new();
    entry.read_to_string(&mut content).unwrap();
    assert_eq!(content, "print('hi')\n");
}

#[test]
fn test_bare_launcher_stub_runs_in_folder_mode() {
    // The launcher binary links the zip reader, so its image contains
    // raw signature bytes. They must not be mistaken for a payload.
    let stub = Path::new(env!("CARGO_BIN_EXE_pybale-launcher"));
    assert_eq!(payload::locate_archive(stub).unwrap(), None);
}

#[test]
fn test_embedded_payload_is_located_in_a_real_stub() {
    let env = TestEnv::new();
    let tree = env.source_dir.join("app.build");
    fs::create_dir_all(&tree).unwrap();
    fs::write(tree.join("__main__.py"), "print('hi')\n").unwrap();

    let archive = env.source_dir.join("payload.zip");
    package::create_archive(&tree, &archive, None).unwrap();

    let stub = Path::new(env!("CARGO_BIN_EXE_pybale-launcher"));
    let output = env.source_dir.join("app");
    payload::append_payload(stub, &archive, &output).unwrap();

    let offset = payload::locate_archive(&output)
        .unwrap()
        .expect("payload not found in built executable");
    let section = SectionReader::open(&output, offset).unwrap();
    let mut zip = zip::ZipArchive::new(section).unwrap();
    let mut entry = zip.by_name("__main__.py").unwrap();
    let mut content = String::new();
    entry.read_to_string(&mut content).unwrap();
    assert_eq!(content, "print('hi')\n");

    // A built executable is not a valid stub for another build.
    let stacked = env.source_dir.join("app2");
    assert!(payload::append_payload(&output, &archive, &stacked).is_err());
}

#[test]
fn test_encrypted_payload_requires_the_passphrase() {
    let env = TestEnv::new();
    let tree = env.source_dir.join("app.build");
    fs::create_dir_all(&tree).unwrap();
    fs::write(tree.join("__main__.py"), "print('hi')\n").unwrap();

    let archive = env.source_dir.join("payload.zip");
    package::create_archive(&tree, &archive, Some("pybale")).unwrap();

    let mut zip = zip::ZipArchive::new(File::open(&archive).unwrap()).unwrap();
    let mut entry = zip.by_index_decrypt(0, b"pybale").unwrap();
    let mut content = String::new();
    entry.read_to_string(&mut content).unwrap();
    assert_eq!(content, "print('hi')\n");
}
