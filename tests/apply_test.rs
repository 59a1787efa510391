// Integration tests for apply
//
// Drive an imported cluster through every phase with in-memory doubles and
// check what ends up in the state store and the asset tree.

mod common;

use common::*;
use kluster::cluster::LAST_RUN_FILE_NAME;
use kluster::phase::{LifecycleState, INSTALL_ACTION, PREFLIGHT_ACTION, SMOKE_TEST_ACTION};
use kluster::{ClusterContext, ClusterState, Error, ErrorKind, Executor, ExecutorError, Phase};
use rstest::rstest;
use tempfile::tempdir;

#[tokio::test]
async fn test_apply_records_installed_when_every_phase_passes() {
    let dir = tempdir().unwrap();
    let mut ctx = imported_context(dir.path(), SAMPLE_PLAN);
    let runner = FakeActionRunner::new();
    let remote = FakeRemote::answering("1");
    let mut executor = Executor::new(&runner, &remote, fast_options(&ctx, 3));

    let report = ctx.apply(CLUSTER, &mut executor).await.unwrap();

    assert_eq!(report.state.lifecycle, LifecycleState::Done);
    assert_eq!(runner.actions(), vec![PREFLIGHT_ACTION, INSTALL_ACTION, SMOKE_TEST_ACTION]);
    assert_eq!(report.certificates.generated, vec!["ca", "etcd01", "master01", "worker01", "admin"]);

    let layout = ctx.layout().clone();
    assert!(layout.kubeconfig_path(CLUSTER).is_file());
    assert!(layout.keys_dir(CLUSTER).join("ca.pem").is_file());

    assert_eq!(ctx.store().list().unwrap(), vec![CLUSTER.to_string()]);
    let status = ctx.store().get(CLUSTER).unwrap().unwrap();
    assert_eq!(status.current_state, ClusterState::Installed);
    assert_eq!(status.desired_state, ClusterState::Installed);
    assert_eq!(status.spec.cluster.name, CLUSTER);
    ctx.close().unwrap();
}

#[tokio::test]
async fn test_failing_install_records_install_failed() {
    let dir = tempdir().unwrap();
    let mut ctx = imported_context(dir.path(), SAMPLE_PLAN);
    let runner = FakeActionRunner::failing_on(INSTALL_ACTION);
    let remote = FakeRemote::answering("1");
    let mut executor = Executor::new(&runner, &remote, fast_options(&ctx, 3));

    let err = ctx.apply(CLUSTER, &mut executor).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Phase);
    assert!(err.to_string().contains("install"));
    assert!(matches!(
        err,
        Error::Executor(ExecutorError::Phase { phase: Phase::Install, .. })
    ));
    assert!(!runner.actions().contains(&SMOKE_TEST_ACTION.to_string()));
    assert_eq!(remote.calls(), 0);

    let status = ctx.store().get(CLUSTER).unwrap().unwrap();
    assert_eq!(status.current_state, ClusterState::InstallFailed);
    assert_eq!(ctx.store().list().unwrap().len(), 1);
}

#[tokio::test]
async fn test_failing_install_with_unwritable_store_reports_both_failures() {
    let dir = tempdir().unwrap();
    let mut ctx = imported_context(dir.path(), SAMPLE_PLAN);
    let locker = rusqlite::Connection::open(ctx.layout().store_path()).unwrap();
    locker
        .execute_batch(
            "CREATE TRIGGER deny_insert BEFORE INSERT ON buckets
             BEGIN SELECT RAISE(ABORT, 'store is read-only'); END;
             CREATE TRIGGER deny_update BEFORE UPDATE ON buckets
             BEGIN SELECT RAISE(ABORT, 'store is read-only'); END;",
        )
        .unwrap();
    drop(locker);

    let runner = FakeActionRunner::failing_on(INSTALL_ACTION);
    let remote = FakeRemote::answering("1");
    let mut executor = Executor::new(&runner, &remote, fast_options(&ctx, 3));

    let err = ctx.apply(CLUSTER, &mut executor).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Persistence);
    let text = err.to_string();
    assert!(text.contains("install phase failed"), "{text}");
    assert!(text.contains("store is read-only"), "{text}");
    match err {
        Error::RecordFailed { cause, .. } => assert!(matches!(
            *cause,
            Error::Executor(ExecutorError::Phase { phase: Phase::Install, .. })
        )),
        other => panic!("unexpected error: {other}"),
    }
    assert!(ctx.store().get(CLUSTER).unwrap().is_none());
}

#[tokio::test]
async fn test_invalid_plan_records_install_failed_without_remote_work() {
    let dir = tempdir().unwrap();
    let yaml = SAMPLE_PLAN.replace("worker:\n  expected_count: 1", "worker:\n  expected_count: 2");
    let mut ctx = imported_context(dir.path(), &yaml);
    let runner = FakeActionRunner::new();
    let remote = FakeRemote::answering("1");
    let mut executor = Executor::new(&runner, &remote, fast_options(&ctx, 3));

    let err = ctx.apply(CLUSTER, &mut executor).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Validation);
    assert!(runner.actions().is_empty());
    let status = ctx.store().get(CLUSTER).unwrap().unwrap();
    assert_eq!(status.current_state, ClusterState::InstallFailed);
}

#[tokio::test]
async fn test_smoke_test_gives_up_after_attempt_budget() {
    let dir = tempdir().unwrap();
    let mut ctx = imported_context(dir.path(), SAMPLE_PLAN);
    let runner = FakeActionRunner::new();
    let remote = FakeRemote::answering("0");
    let mut executor = Executor::new(&runner, &remote, fast_options(&ctx, 4));

    let err = ctx.apply(CLUSTER, &mut executor).await.unwrap_err();

    assert!(matches!(
        err,
        Error::Executor(ExecutorError::Phase { phase: Phase::SmokeTest, .. })
    ));
    assert!(err.to_string().contains("kube-dns"));
    assert_eq!(remote.calls(), 4);
    assert_eq!(
        ctx.store().get(CLUSTER).unwrap().unwrap().current_state,
        ClusterState::InstallFailed
    );
}

#[tokio::test]
async fn test_smoke_test_retries_through_transient_failures() {
    let dir = tempdir().unwrap();
    let mut ctx = imported_context(dir.path(), SAMPLE_PLAN);
    let runner = FakeActionRunner::new();
    let remote = FakeRemote::scripted(vec![Err(connection_refused("master01")), Ok(String::new())], "1");
    let mut executor = Executor::new(&runner, &remote, fast_options(&ctx, 5));

    ctx.apply(CLUSTER, &mut executor).await.unwrap();
    assert_eq!(remote.calls(), 3);
}

#[rstest]
#[case(false, vec![PREFLIGHT_ACTION, INSTALL_ACTION, SMOKE_TEST_ACTION])]
#[case(true, vec![INSTALL_ACTION, SMOKE_TEST_ACTION])]
#[tokio::test]
async fn test_skip_preflight_only_drops_the_preflight_action(
    #[case] skip_preflight: bool,
    #[case] expected: Vec<&str>,
) {
    let dir = tempdir().unwrap();
    let mut ctx = imported_context(dir.path(), SAMPLE_PLAN);
    let runner = FakeActionRunner::new();
    let remote = FakeRemote::answering("1");
    let mut options = fast_options(&ctx, 3);
    options.skip_preflight = skip_preflight;
    let mut executor = Executor::new(&runner, &remote, options);

    let report = ctx.apply(CLUSTER, &mut executor).await.unwrap();

    assert_eq!(runner.actions(), expected);
    assert_eq!(report.state.completed, Phase::ALL.to_vec());
}

#[tokio::test]
async fn test_restart_services_reaches_install_request() {
    let dir = tempdir().unwrap();
    let mut ctx = imported_context(dir.path(), SAMPLE_PLAN);
    let runner = FakeActionRunner::new();
    let remote = FakeRemote::answering("1");
    let mut options = fast_options(&ctx, 3);
    options.restart_services = true;
    let mut executor = Executor::new(&runner, &remote, options);

    ctx.apply(CLUSTER, &mut executor).await.unwrap();

    let install = runner
        .requests()
        .into_iter()
        .find(|r| r.action == INSTALL_ACTION)
        .unwrap();
    assert!(install.restart_services);
}

#[tokio::test]
async fn test_second_apply_reuses_certificates() {
    let dir = tempdir().unwrap();
    let mut ctx = imported_context(dir.path(), SAMPLE_PLAN);
    let runner = FakeActionRunner::new();
    let remote = FakeRemote::answering("1");
    let mut executor = Executor::new(&runner, &remote, fast_options(&ctx, 3));

    ctx.apply(CLUSTER, &mut executor).await.unwrap();
    let second = ctx.apply(CLUSTER, &mut executor).await.unwrap();

    assert!(second.certificates.generated.is_empty());
    assert_eq!(second.certificates.reused.len(), 5);
    assert_eq!(ctx.store().list().unwrap().len(), 1);
}

#[tokio::test]
async fn test_info_reports_status_and_last_run() {
    let dir = tempdir().unwrap();
    let mut ctx = imported_context(dir.path(), SAMPLE_PLAN);
    let runner = FakeActionRunner::failing_on(SMOKE_TEST_ACTION);
    let remote = FakeRemote::answering("1");
    let mut executor = Executor::new(&runner, &remote, fast_options(&ctx, 3));

    assert!(ctx.info(CLUSTER).unwrap().status.is_none());
    ctx.apply(CLUSTER, &mut executor).await.unwrap_err();

    assert!(ctx.layout().runs_dir(CLUSTER).join(LAST_RUN_FILE_NAME).is_file());
    let info = ctx.info(CLUSTER).unwrap();
    assert_eq!(info.status.unwrap().current_state, ClusterState::InstallFailed);
    let last_run = info.last_run.unwrap();
    assert_eq!(last_run.lifecycle, LifecycleState::Failed(Phase::SmokeTest));
    assert!(last_run.has_completed(Phase::Install));
}

#[tokio::test]
async fn test_apply_unknown_cluster_is_not_found() {
    let dir = tempdir().unwrap();
    let mut ctx = ClusterContext::open(config_in(dir.path())).unwrap();
    let runner = FakeActionRunner::new();
    let remote = FakeRemote::answering("1");
    let mut executor = Executor::new(&runner, &remote, fast_options(&ctx, 3));

    let err = ctx.apply("missing", &mut executor).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert!(err.suggestion().unwrap().contains("kluster import"));
    assert!(ctx.store().list().unwrap().is_empty());
}
