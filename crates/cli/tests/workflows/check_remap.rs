//! `check` writes manifest and state; `remap` recreates the tree

use crate::common::TestProject;
use crate::isolate;
use anyhow::Result;

const ISOLATE: &str = "src/tests/sample.isolate";
const ISOLATED: &str = "out/sample.isolated";

#[test]
fn test_check_writes_manifest_and_state() -> Result<()> {
    let project = TestProject::with_sample()?;

    isolate!(project.root(), "check", "-i", ISOLATE, "-s", ISOLATED).assert_success()?;

    assert_eq!(
        project.manifest_files(ISOLATED)?,
        vec!["base/lib.txt", "tests/data/input.txt", "tests/run.sh"]
    );
    let manifest = project.read_json(ISOLATED)?;
    assert_eq!(manifest["algo"], "sha-1");
    assert_eq!(manifest["version"], "1.4");
    assert_eq!(manifest["relative_cwd"], "tests");
    assert_eq!(manifest["command"], serde_json::json!(["sh", "run.sh"]));
    assert_eq!(manifest["files"]["tests/data/input.txt"]["s"], 5);

    let state = project.read_json("out/sample.isolated.state")?;
    assert_eq!(state["version"], "1.4.2");
    assert_eq!(state["isolate_file"], "../src/tests/sample.isolate");
    assert_eq!(state["relative_cwd"], "tests");
    assert!(state["files"]["tests/run.sh"]["t"].is_number());
    Ok(())
}

#[test]
fn test_check_is_stable_across_runs() -> Result<()> {
    let project = TestProject::with_sample()?;

    isolate!(project.root(), "check", "-i", ISOLATE, "-s", ISOLATED).assert_success()?;
    let first = std::fs::read(project.path(ISOLATED))?;

    // The description is remembered by the state
    isolate!(project.root(), "check", "-s", ISOLATED).assert_success()?;
    let second = std::fs::read(project.path(ISOLATED))?;
    assert_eq!(first, second);
    Ok(())
}

#[test]
fn test_removed_input_fails_unless_ignored() -> Result<()> {
    let project = TestProject::with_sample()?;
    std::fs::remove_file(project.path("src/base/lib.txt"))?;

    let result = isolate!(project.root(), "check", "-i", ISOLATE, "-s", ISOLATED).assert_failure()?;
    assert!(result.contains_stderr("lib.txt"));

    isolate!(
        project.root(),
        "check",
        "-i",
        ISOLATE,
        "-s",
        ISOLATED,
        "--ignore-broken-items"
    )
    .assert_success()?;
    assert_eq!(
        project.manifest_files(ISOLATED)?,
        vec!["tests/data/input.txt", "tests/run.sh"]
    );
    Ok(())
}

#[test]
fn test_ignore_broken_items_from_env() -> Result<()> {
    let project = TestProject::with_sample()?;
    std::fs::remove_file(project.path("src/base/lib.txt"))?;

    isolate!(project.root(), "check", "-i", ISOLATE, "-s", ISOLATED)
        .env("ISOLATE_IGNORE_BROKEN_ITEMS", "1")
        .assert_success()?;
    Ok(())
}

#[test]
fn test_check_requires_isolated() -> Result<()> {
    let project = TestProject::with_sample()?;

    let result = isolate!(project.root(), "check", "-i", ISOLATE).assert_failure()?;
    assert!(result.contains_stderr("--isolated is required"));

    let result =
        isolate!(project.root(), "check", "-i", ISOLATE, "-s", "out/sample.json").assert_failure()?;
    assert!(result.contains_stderr(".isolated"));
    Ok(())
}

#[test]
fn test_subdir_restricts_manifest() -> Result<()> {
    let project = TestProject::with_sample()?;

    isolate!(
        project.root(),
        "check",
        "-i",
        ISOLATE,
        "-s",
        ISOLATED,
        "--subdir",
        "tests/data/"
    )
    .assert_success()?;
    assert_eq!(project.manifest_files(ISOLATED)?, vec!["tests/data/input.txt"]);
    Ok(())
}

#[test]
fn test_remap_recreates_tree() -> Result<()> {
    let project = TestProject::with_sample()?;

    let result =
        isolate!(project.root(), "remap", "-i", ISOLATE, "-s", ISOLATED, "-o", "remapped").assert_success()?;
    assert!(result.contains_stdout("Remapping into"));

    let remapped = project.path("remapped");
    assert_eq!(std::fs::read_to_string(remapped.join("base/lib.txt"))?, "shared library");
    assert_eq!(std::fs::read_to_string(remapped.join("tests/data/input.txt"))?, "input");
    assert!(remapped.join("tests/run.sh").is_file());
    assert!(!remapped.join("tests/data/skip.pyc").exists());

    // remap also saves the state
    assert!(project.path(ISOLATED).is_file());
    Ok(())
}

#[test]
fn test_remap_refuses_non_empty_directory() -> Result<()> {
    let project = TestProject::with_sample()?;
    project.write("remapped/existing.txt", "keep me")?;

    let result =
        isolate!(project.root(), "remap", "-i", ISOLATE, "-o", "remapped").assert_failure()?;
    assert!(result.contains_stderr("non-empty"));
    assert_eq!(std::fs::read_to_string(project.path("remapped/existing.txt"))?, "keep me");
    Ok(())
}

#[test]
fn test_config_example() -> Result<()> {
    let project = TestProject::new()?;

    let result = isolate!(project.root(), "config", "--example").assert_success()?;
    assert!(result.contains_stdout("[hashing]"));
    assert!(result.contains_stdout("algo = \"sha-1\""));

    let result = isolate!(project.root(), "config", "--path").assert_success()?;
    assert!(result.contains_stdout("config.toml"));
    Ok(())
}
