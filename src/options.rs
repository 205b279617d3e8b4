//! Request fingerprint: what the caller wants a session for.
//!
//! Two `Options` values address the same group iff their derived group name
//! is equal. The group name is a pure function of the identity fields
//! (application root, environment, user); tuning fields (process counts,
//! timeouts, queue bounds) travel with the request but do not affect routing.

use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// How the spawning kit materialises a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SpawnMethod {
    /// Fork from a long-lived preloader process.
    Smart,
    /// Exec the start command directly.
    Direct,
}

/// How a group restart replaces its processes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RestartMethod {
    /// Spawn a fresh generation first, drain the old one as replacements
    /// attach. In-flight sessions are never interrupted.
    #[default]
    Rolling,
    /// Stop routing to the old generation immediately; replacements are
    /// spawned afterwards. In-flight sessions still finish.
    Immediate,
}

/// Immutable descriptor of a `get` request.
#[derive(Debug, Clone)]
pub struct Options {
    /// Application root directory; part of the group identity.
    pub app_root: PathBuf,
    /// Deployment environment, e.g. "production"; part of the group identity.
    pub environment: String,
    /// User identity the worker runs as; part of the group identity.
    pub user: Option<String>,
    /// Spawn strategy handed to the spawning kit.
    pub spawn_method: SpawnMethod,
    /// Command line the spawning kit execs for a new worker.
    pub start_command: Vec<String>,
    /// Extra environment variables for spawned workers.
    pub env: Vec<(String, String)>,
    /// Processes the group keeps alive even without traffic.
    pub min_processes: usize,
    /// Upper bound on processes in this group; 0 means bounded only by the
    /// pool-wide budget.
    pub max_processes: usize,
    /// Sessions a single worker accepts concurrently; 0 means unlimited.
    pub concurrency: usize,
    /// How long the spawning kit may take before giving up.
    pub start_timeout: Duration,
    /// Queue size bound; enqueueing beyond it fails with `request_queue_full`.
    pub max_request_queue_size: usize,
    /// Queue dwell bound; exceeding it fails with `request_queue_timeout`.
    pub max_request_queue_time: Option<Duration>,
    /// Sentinel file whose mtime bump triggers a group restart.
    pub restart_marker: Option<PathBuf>,
    /// Route to the process holding this sticky session, when still present.
    pub sticky_session_id: Option<u32>,
}

impl Options {
    /// Options for an application rooted at `app_root`, with defaults for
    /// everything else.
    pub fn new(app_root: impl Into<PathBuf>) -> Self {
        let app_root = app_root.into();
        let restart_marker = Some(app_root.join("tmp").join("restart.txt"));
        Self {
            app_root,
            environment: "production".to_string(),
            user: None,
            spawn_method: SpawnMethod::Direct,
            start_command: Vec::new(),
            env: Vec::new(),
            min_processes: 1,
            max_processes: 0,
            concurrency: 1,
            start_timeout: Duration::from_secs(90),
            max_request_queue_size: 100,
            max_request_queue_time: None,
            restart_marker,
            sticky_session_id: None,
        }
    }

    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = environment.into();
        self
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn with_start_command<I, S>(mut self, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.start_command = command.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_min_processes(mut self, min: usize) -> Self {
        self.min_processes = min;
        self
    }

    pub fn with_max_processes(mut self, max: usize) -> Self {
        self.max_processes = max;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Derive the identity key of the group this request routes to.
    ///
    /// Pure function of the stable identity fields only. Equivalent requests
    /// yield byte-identical names.
    pub fn group_name(&self) -> String {
        let mut name = self.app_root.to_string_lossy().into_owned();
        name.push('#');
        name.push_str(&self.environment);
        if let Some(user) = &self.user {
            name.push('#');
            name.push_str(user);
        }
        name
    }

    pub fn app_root(&self) -> &Path {
        &self.app_root
    }
}
