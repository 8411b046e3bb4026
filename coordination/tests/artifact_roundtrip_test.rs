//! Applying an action and re-extracting structure must show the new content.

use std::fs;

use repair_coordination::{
    extract_structure, ArtifactError, ArtifactStore, IsaPair, Package, RepairAction,
    StructureOptions,
};

const MAKEFILE: &str = "CFLAGS = -O2 -msse2\nall:\n\t$(CC) $(CFLAGS) -o hello hello.c\n";

fn staged() -> (tempfile::TempDir, ArtifactStore) {
    let tmp = tempfile::tempdir().unwrap();
    let pkg = tmp.path().join("in").join("hello");
    fs::create_dir_all(&pkg).unwrap();
    fs::write(pkg.join("hello.spec"), "Name: hello\n").unwrap();
    fs::write(pkg.join("Makefile"), MAKEFILE).unwrap();
    let package = Package::discover(&pkg, IsaPair::new("x86_64", "aarch64")).unwrap();
    let store = ArtifactStore::stage(package, &tmp.path().join("work")).unwrap();
    (tmp, store)
}

fn listed_content(store: &ArtifactStore, path: &str) -> String {
    let listing = extract_structure(store.root(), &StructureOptions::default()).unwrap();
    listing
        .entry(path)
        .and_then(|e| e.content.clone())
        .unwrap_or_default()
}

/// Test: a patch shows up in the next structure extraction.
#[test]
fn test_patch_then_extract_shows_patched_content() {
    let (_tmp, mut store) = staged();
    let diff = "\
--- a/Makefile
+++ b/Makefile
@@ -1,2 +1,2 @@
-CFLAGS = -O2 -msse2
+CFLAGS = -O2
 all:
";
    store
        .apply(&RepairAction::Patch {
            path: "Makefile".into(),
            diff: diff.into(),
        })
        .unwrap();

    let content = listed_content(&store, "Makefile");
    assert!(content.starts_with("CFLAGS = -O2\nall:\n"));
    assert!(!content.contains("msse2"));
}

/// Test: a full-file rewrite shows up verbatim.
#[test]
fn test_rewrite_then_extract_shows_exact_content() {
    let (_tmp, mut store) = staged();
    let replacement = "CFLAGS = -O2\nall:\n\t$(CC) -o hello hello.c\n";
    store
        .apply(&RepairAction::FullFileRewrite {
            path: "Makefile".into(),
            content: replacement.into(),
        })
        .unwrap();

    assert_eq!(listed_content(&store, "Makefile"), replacement);
}

/// Test: the original package directory is never touched.
#[test]
fn test_source_dir_is_not_mutated() {
    let (_tmp, mut store) = staged();
    let source = store.package().source_dir.join("Makefile");
    store
        .apply(&RepairAction::FullFileRewrite {
            path: "Makefile".into(),
            content: String::new(),
        })
        .unwrap();
    assert_eq!(fs::read_to_string(source).unwrap(), MAKEFILE);
}

/// Test: creation via /dev/null is refused as an unknown target.
#[test]
fn test_dev_null_creation_is_invalid_target() {
    let (_tmp, mut store) = staged();
    let diff = "--- /dev/null\n+++ b/Makefile\n@@ -0,0 +1 @@\n+x\n";
    let err = store
        .apply(&RepairAction::Patch {
            path: "Makefile".into(),
            diff: diff.into(),
        })
        .unwrap_err();
    assert!(matches!(err, ArtifactError::InvalidTarget { .. }));
    assert_eq!(store.revision(), 0);
}
