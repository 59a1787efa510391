// Integration tests for plan import
//
// Import copies a plan and its artifacts into the managed layout, is a no-op
// for an identical plan, refuses a different plan under the same name, and
// never touches the state store.

mod common;

use std::fs;

use common::*;
use kluster::import::{import, ImportError, ImportOptions, ImportOutcome};
use kluster::{AssetLayout, Error, ErrorKind, Plan};
use tempfile::tempdir;

#[test]
fn test_import_copies_plan_byte_identical_without_touching_store() {
    let dir = tempdir().unwrap();
    let plan_file = write_plan(dir.path(), "plan.yaml", SAMPLE_PLAN);
    let layout = AssetLayout::new(dir.path().join("clusters"));

    let outcome = import(&layout, &ImportOptions::new(&plan_file)).unwrap();

    assert_eq!(outcome, ImportOutcome::Imported { name: CLUSTER.to_string() });
    assert_eq!(
        fs::read(layout.plan_path(CLUSTER)).unwrap(),
        fs::read(&plan_file).unwrap()
    );
    assert_eq!(layout.plan_path(CLUSTER), dir.path().join("clusters/test-cluster/plan.yaml"));
    assert!(!layout.store_path().exists());
}

#[test]
fn test_import_copies_optional_artifacts() {
    let dir = tempdir().unwrap();
    let plan_file = write_plan(dir.path(), "plan.yaml", SAMPLE_PLAN);
    let key = dir.path().join("id.pem");
    fs::write(&key, "KEY").unwrap();
    let generated = dir.path().join("old-generated");
    fs::create_dir_all(generated.join("keys")).unwrap();
    fs::write(generated.join("keys/ca.pem"), "CA").unwrap();
    let runs = dir.path().join("old-runs");
    fs::create_dir_all(runs.join("20240101-kubernetes")).unwrap();
    fs::write(runs.join("20240101-kubernetes/kubernetes.log"), "ok").unwrap();
    let layout = AssetLayout::new(dir.path().join("clusters"));

    let opts = ImportOptions::new(&plan_file)
        .with_ssh_key(&key)
        .with_generated_assets_dir(&generated)
        .with_runs_dir(&runs);
    import(&layout, &opts).unwrap();

    assert_eq!(fs::read_to_string(layout.ssh_key_path(CLUSTER)).unwrap(), "KEY");
    assert_eq!(fs::read_to_string(layout.keys_dir(CLUSTER).join("ca.pem")).unwrap(), "CA");
    assert_eq!(
        fs::read_to_string(layout.runs_dir(CLUSTER).join("20240101-kubernetes/kubernetes.log")).unwrap(),
        "ok"
    );

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = fs::metadata(layout.ssh_key_path(CLUSTER)).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}

#[test]
fn test_reimporting_identical_plan_changes_nothing() {
    let dir = tempdir().unwrap();
    let plan_file = write_plan(dir.path(), "plan.yaml", SAMPLE_PLAN);
    let key = dir.path().join("id.pem");
    fs::write(&key, "FIRST").unwrap();
    let layout = AssetLayout::new(dir.path().join("clusters"));
    import(&layout, &ImportOptions::new(&plan_file).with_ssh_key(&key)).unwrap();

    // Same plan, different formatting and key order.
    let plan = Plan::from_yaml(SAMPLE_PLAN).unwrap();
    let reformatted = serde_json::to_string(&plan).unwrap();
    let again = write_plan(dir.path(), "plan-again.yaml", &reformatted);
    fs::write(&key, "SECOND").unwrap();

    let outcome = import(&layout, &ImportOptions::new(&again).with_ssh_key(&key)).unwrap();

    assert_eq!(outcome, ImportOutcome::AlreadyImported { name: CLUSTER.to_string() });
    assert_eq!(fs::read_to_string(layout.ssh_key_path(CLUSTER)).unwrap(), "FIRST");
    assert_eq!(fs::read_to_string(layout.plan_path(CLUSTER)).unwrap(), SAMPLE_PLAN);
}

#[test]
fn test_reimporting_identical_plan_ignores_missing_artifacts() {
    let dir = tempdir().unwrap();
    let plan_file = write_plan(dir.path(), "plan.yaml", SAMPLE_PLAN);
    let layout = AssetLayout::new(dir.path().join("clusters"));
    import(&layout, &ImportOptions::new(&plan_file)).unwrap();

    let opts = ImportOptions::new(&plan_file).with_runs_dir(dir.path().join("no-such-runs"));
    let outcome = import(&layout, &opts).unwrap();

    assert_eq!(outcome, ImportOutcome::AlreadyImported { name: CLUSTER.to_string() });
}

#[test]
fn test_importing_different_plan_conflicts() {
    let dir = tempdir().unwrap();
    let layout = AssetLayout::new(dir.path().join("clusters"));
    let plan_file = write_plan(dir.path(), "plan.yaml", SAMPLE_PLAN);
    import(&layout, &ImportOptions::new(&plan_file)).unwrap();

    let changed = SAMPLE_PLAN.replace("10.0.0.3", "10.0.0.33");
    let changed_file = write_plan(dir.path(), "changed.yaml", &changed);
    let err = import(&layout, &ImportOptions::new(&changed_file)).unwrap_err();

    assert!(matches!(err, ImportError::Conflict { ref name, .. } if name == CLUSTER));
    assert_eq!(Error::from(err).kind(), ErrorKind::Conflict);
    assert_eq!(fs::read_to_string(layout.plan_path(CLUSTER)).unwrap(), SAMPLE_PLAN);
}

#[test]
fn test_interrupted_import_leftovers_are_replaced() {
    let dir = tempdir().unwrap();
    let layout = AssetLayout::new(dir.path().join("clusters"));
    let stale = layout.generated_dir(CLUSTER);
    fs::create_dir_all(&stale).unwrap();
    fs::write(stale.join("stale.pem"), "stale").unwrap();
    assert!(!layout.cluster_exists(CLUSTER));

    let generated = dir.path().join("generated");
    fs::create_dir_all(&generated).unwrap();
    fs::write(generated.join("fresh.pem"), "fresh").unwrap();
    let plan_file = write_plan(dir.path(), "plan.yaml", SAMPLE_PLAN);

    import(&layout, &ImportOptions::new(&plan_file).with_generated_assets_dir(&generated)).unwrap();

    assert!(layout.cluster_exists(CLUSTER));
    assert!(!stale.join("stale.pem").exists());
    assert_eq!(fs::read_to_string(stale.join("fresh.pem")).unwrap(), "fresh");
}

#[test]
fn test_import_missing_plan_is_not_found() {
    let dir = tempdir().unwrap();
    let layout = AssetLayout::new(dir.path().join("clusters"));

    let err = import(&layout, &ImportOptions::new(dir.path().join("absent.yaml"))).unwrap_err();

    assert_eq!(Error::from(err).kind(), ErrorKind::NotFound);
    assert!(!layout.root().exists());
}

#[test]
fn test_import_malformed_plan_is_parse_error() {
    let dir = tempdir().unwrap();
    let plan_file = write_plan(dir.path(), "plan.yaml", "cluster: [unterminated");
    let layout = AssetLayout::new(dir.path().join("clusters"));

    let err = import(&layout, &ImportOptions::new(&plan_file)).unwrap_err();

    assert_eq!(Error::from(err).kind(), ErrorKind::Parse);
}
