// Shared fixtures for integration tests
//
// In-memory doubles for the action runner and the remote command channel,
// plus helpers to stage an imported cluster in a temporary assets root.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use kluster::import::{import, ImportOptions};
use kluster::phase::{ExecutorOptions, INSTALL_ACTION, PREFLIGHT_ACTION, SMOKE_TEST_ACTION};
use kluster::remote::{ActionError, ActionRequest, ActionRun, ActionRunner, RemoteCommand, RemoteError};
use kluster::{AssetLayout, ClusterContext, Config, Node, Plan, RetryPolicy};

pub const CLUSTER: &str = "test-cluster";

pub const SAMPLE_PLAN: &str = r#"cluster:
  name: test-cluster
  networking:
    type: overlay
    pod_cidr_block: 172.16.0.0/16
    service_cidr_block: 172.20.0.0/16
  certificates:
    expiry: 17520h
    location_city: Troy
    location_state: New York
    location_country: US
  ssh:
    user: ubuntu
    ssh_key: /home/ubuntu/.ssh/cluster.pem
    ssh_port: 22
etcd:
  expected_count: 1
  nodes:
    - host: etcd01
      ip: 10.0.0.1
      internalip: 192.168.0.1
master:
  expected_count: 1
  nodes:
    - host: master01
      ip: 10.0.0.2
      internalip: 192.168.0.2
  load_balanced_fqdn: master01.example.com
  load_balanced_short_name: master01
worker:
  expected_count: 1
  nodes:
    - host: worker01
      ip: 10.0.0.3
      internalip: 192.168.0.3
ingress:
  expected_count: 0
  nodes: []
storage:
  expected_count: 0
  nodes: []
"#;

/// Write `yaml` as a plan file inside `dir`.
pub fn write_plan(dir: &Path, file_name: &str, yaml: &str) -> PathBuf {
    let path = dir.join(file_name);
    fs::write(&path, yaml).unwrap();
    path
}

/// Configuration rooted at `<dir>/clusters`.
pub fn config_in(dir: &Path) -> Config {
    Config::default().with_root(dir.join("clusters"))
}

/// Import `yaml` into `<dir>/clusters` and open a context over it.
pub fn imported_context(dir: &Path, yaml: &str) -> ClusterContext {
    let config = config_in(dir);
    let plan_file = write_plan(dir, "source-plan.yaml", yaml);
    import(&AssetLayout::new(&config.assets.root), &ImportOptions::new(plan_file)).unwrap();
    ClusterContext::open(config).unwrap()
}

/// Executor options for `CLUSTER` that never sleep between verification attempts.
pub fn fast_options(ctx: &ClusterContext, attempts: u32) -> ExecutorOptions {
    ExecutorOptions {
        verify_policy: RetryPolicy::immediate(attempts),
        ..ctx.executor_options(CLUSTER)
    }
}

/// Action runner that records requests and can fail one named action.
#[derive(Default)]
pub struct FakeActionRunner {
    fail_on: Option<String>,
    requests: Mutex<Vec<ActionRequest>>,
}

impl FakeActionRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_on(action: &str) -> Self {
        Self {
            fail_on: Some(action.to_string()),
            ..Self::default()
        }
    }

    pub fn requests(&self) -> Vec<ActionRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn actions(&self) -> Vec<String> {
        self.requests().into_iter().map(|r| r.action).collect()
    }
}

impl ActionRunner for FakeActionRunner {
    fn known_actions(&self) -> Vec<String> {
        let mut known: Vec<String> = [INSTALL_ACTION, PREFLIGHT_ACTION, SMOKE_TEST_ACTION]
            .iter()
            .map(|a| a.to_string())
            .collect();
        known.sort();
        known
    }

    async fn run_action(&self, _plan: &Plan, request: &ActionRequest) -> Result<ActionRun, ActionError> {
        self.requests.lock().unwrap().push(request.clone());
        if self.fail_on.as_deref() == Some(request.action.as_str()) {
            return Err(ActionError::Failed {
                action: request.action.clone(),
                status: Some(2),
                log: PathBuf::from(format!("{}.log", request.action)),
            });
        }
        Ok(ActionRun {
            action: request.action.clone(),
            run_dir: None,
            elapsed: Duration::from_millis(5),
        })
    }
}

/// Remote channel replaying scripted replies, then repeating a fallback.
pub struct FakeRemote {
    replies: Mutex<VecDeque<Result<String, RemoteError>>>,
    fallback: String,
    calls: AtomicUsize,
}

impl FakeRemote {
    /// Always answers `output`.
    pub fn answering(output: &str) -> Self {
        Self::scripted(Vec::new(), output)
    }

    /// Answers `replies` in order, then `fallback`.
    pub fn scripted(replies: Vec<Result<String, RemoteError>>, fallback: &str) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            fallback: fallback.to_string(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl RemoteCommand for FakeRemote {
    async fn execute(&self, _node: &Node, _command: &str) -> Result<String, RemoteError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self.replies.lock().unwrap().pop_front();
        next.unwrap_or_else(|| Ok(self.fallback.clone()))
    }
}

pub fn connection_refused(host: &str) -> RemoteError {
    RemoteError::Connection {
        host: host.to_string(),
        message: "connection refused".to_string(),
    }
}
