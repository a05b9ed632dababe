//! `hashtable` stages by content hash; `run` executes in a throwaway tree

use crate::common::TestProject;
use crate::isolate;
use anyhow::Result;

const ISOLATE: &str = "src/tests/sample.isolate";
const ISOLATED: &str = "out/sample.isolated";

#[test]
fn test_hashtable_stages_files_and_manifest() -> Result<()> {
    let project = TestProject::with_sample()?;

    let result = isolate!(project.root(), "hashtable", "-i", ISOLATE, "-s", ISOLATED, "-o", "store")
        .assert_success()?;

    let line = result.stdout.trim();
    let (digest, name) = line.split_once("  ").expect("<hash>  <name>");
    assert_eq!(name, "sample.isolated");
    assert_eq!(digest.len(), 40);

    let store = project.path("store");
    let staged_manifest = std::fs::read(store.join(digest))?;
    assert_eq!(staged_manifest, std::fs::read(project.path(ISOLATED))?);

    // lib, script, input and the manifest; the blacklisted file is not staged
    assert_eq!(std::fs::read_dir(&store)?.count(), 4);
    Ok(())
}

#[test]
fn test_hashtable_failure_removes_manifest() -> Result<()> {
    let project = TestProject::with_sample()?;
    isolate!(project.root(), "check", "-i", ISOLATE, "-s", ISOLATED).assert_success()?;
    assert!(project.path(ISOLATED).is_file());

    std::fs::remove_file(project.path("src/base/lib.txt"))?;
    isolate!(project.root(), "hashtable", "-s", ISOLATED, "-o", "store").assert_failure()?;
    assert!(!project.path(ISOLATED).exists());
    Ok(())
}

#[cfg(unix)]
#[test]
fn test_run_executes_in_isolated_tree() -> Result<()> {
    let project = TestProject::with_sample()?;
    project.write(
        "src/tests/run.sh",
        "test -f data/input.txt || exit 90\ntest -f ../base/lib.txt || exit 91\nexit \"$1\"\n",
    )?;

    let result = isolate!(project.root(), "run", "-i", ISOLATE, "-s", ISOLATED, "--", "7").execute()?;
    assert_eq!(result.exit_code, 7, "stderr: {}", result.stderr);

    // The temporary tree lives next to the root and is removed afterwards
    let leftovers: Vec<_> = std::fs::read_dir(project.root())?
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with("isolate-"))
        .collect();
    assert!(leftovers.is_empty());
    assert!(project.path(ISOLATED).is_file());
    Ok(())
}

#[cfg(unix)]
#[test]
fn test_run_without_command_fails() -> Result<()> {
    let project = TestProject::new()?;
    project.write("src/a.txt", "a")?;
    project.write("src/empty.isolate", r#"{"variables": {"files": ["a.txt"]}}"#)?;

    let result = isolate!(project.root(), "run", "-i", "src/empty.isolate").assert_failure()?;
    assert!(result.contains_stderr("No command to run"));
    Ok(())
}
