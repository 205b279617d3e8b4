//! The spawning-kit seam.
//!
//! The pool never materialises OS processes itself; it asks a [`Spawner`].
//! `CommandSpawner` is the direct implementation used in production for
//! apps started by exec'ing a command line. Spawners that keep long-lived
//! preloader parents implement [`Spawner::cleanup_preloader`] so the
//! garbage collector can expire them.

use crate::error::SpawnError;
use crate::options::Options;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use tracing::{debug, info};

/// A freshly materialised worker, handed back by the spawning kit.
pub struct SpawnedWorker {
    /// OS process id.
    pub pid: u32,
    /// Child handle when the kit itself spawned the process; `None` when the
    /// worker was forked by an external preloader and only the pid is known.
    pub child: Option<Child>,
    /// Sessions this worker accepts concurrently; 0 means unlimited.
    pub concurrency: usize,
}

impl std::fmt::Debug for SpawnedWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpawnedWorker")
            .field("pid", &self.pid)
            .field("concurrency", &self.concurrency)
            .finish()
    }
}

/// External collaborator that turns `Options` into a running worker.
///
/// `spawn` is called with the pool lock released and may block up to the
/// options' start timeout. Implementations must be callable from multiple
/// group spawn loops concurrently.
pub trait Spawner: Send + Sync {
    fn spawn(&self, options: &Options, generation: u64) -> Result<SpawnedWorker, SpawnError>;

    /// Expire any long-lived preloader for `app_root`. Called by the garbage
    /// collector when a group has been idle past the preloader threshold.
    fn cleanup_preloader(&self, app_root: &Path) {
        let _ = app_root;
    }
}

/// Spawner that execs the options' start command directly.
#[derive(Debug, Default)]
pub struct CommandSpawner;

impl CommandSpawner {
    pub fn new() -> Self {
        Self
    }
}

impl Spawner for CommandSpawner {
    fn spawn(&self, options: &Options, generation: u64) -> Result<SpawnedWorker, SpawnError> {
        let (program, args) = options
            .start_command
            .split_first()
            .ok_or(SpawnError::MissingCommand)?;

        debug!(
            group = %options.group_name(),
            command = %program,
            generation,
            "Spawning worker"
        );

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .env("APP_ENV", &options.environment)
            .env("APP_GENERATION", generation.to_string());
        if options.app_root.is_dir() {
            cmd.current_dir(&options.app_root);
        }
        for (key, value) in &options.env {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn().map_err(|e| SpawnError::Exec(e.to_string()))?;
        let pid = child.id();

        // A worker that exits before we can account for it never became
        // ready; report the exit status as the failure cause.
        match child.try_wait() {
            Ok(Some(status)) => return Err(SpawnError::Failed(format!("exited early: {}", status))),
            Ok(None) => {}
            Err(e) => return Err(SpawnError::Failed(e.to_string())),
        }

        info!(group = %options.group_name(), pid, generation, "Worker spawned");

        Ok(SpawnedWorker {
            pid,
            child: Some(child),
            concurrency: options.concurrency,
        })
    }
}
