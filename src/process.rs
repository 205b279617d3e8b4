//! In-memory handle for a single running worker process.
//!
//! A `Process` is created only by its owning group's spawn loop and destroyed
//! only after it has been detached and its last session ended. All fields are
//! guarded by the pool-wide lock; nothing here synchronises on its own.

use crate::error::DisableResult;
use crate::metrics::ProcessMetrics;
use serde::Serialize;
use std::process::Child;
use std::time::Instant;
use tracing::debug;

/// Lifecycle state of a worker.
///
/// `spawning -> enabled <-> disabling -> detached`; `detached` is terminal
/// and every process passes through it before destruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessState {
    /// Serving; may accept new sessions.
    Enabled,
    /// Keeps existing sessions but accepts no new ones.
    Disabling,
    /// Removed from service; terminated once its sessions end.
    Detached,
}

/// Out-of-band-work progress for a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OobwState {
    None,
    /// Worker asked for OOBW; new sessions are routed away until it drains.
    Requested,
    /// OOBW is running off-lock; still not accepting sessions.
    InProgress,
}

pub(crate) type DisableCallback = Box<dyn FnOnce(DisableResult) + Send>;

pub(crate) struct Process {
    /// Globally unique id, independent of OS pid reuse.
    pub gupid: String,
    pub pid: u32,
    /// Restart cohort this worker belongs to.
    pub generation: u64,
    /// Key callers use to be routed back to this worker.
    pub sticky_session_id: u32,
    /// Session slots; 0 means unlimited.
    pub concurrency: usize,
    pub sessions: usize,
    pub sessions_started: u64,
    pub sessions_completed: u64,
    pub last_used: Instant,
    pub spawned_at: Instant,
    pub state: ProcessState,
    pub oobw: OobwState,
    /// Owned OS handle when this pool spawned the worker itself.
    pub child: Option<Child>,
    /// Callbacks pending on the disable-drain transition.
    pub disable_callbacks: Vec<DisableCallback>,
    pub metrics: Option<ProcessMetrics>,
    /// When SIGTERM was sent, for SIGKILL escalation.
    pub term_sent_at: Option<Instant>,
}

impl Process {
    pub fn new(
        gupid: String,
        pid: u32,
        generation: u64,
        sticky_session_id: u32,
        concurrency: usize,
        child: Option<Child>,
        now: Instant,
    ) -> Self {
        Self {
            gupid,
            pid,
            generation,
            sticky_session_id,
            concurrency,
            sessions: 0,
            sessions_started: 0,
            sessions_completed: 0,
            last_used: now,
            spawned_at: now,
            state: ProcessState::Enabled,
            oobw: OobwState::None,
            child,
            disable_callbacks: Vec::new(),
            metrics: None,
            term_sent_at: None,
        }
    }

    /// Load metric used for least-loaded ordering. Scaled by declared
    /// concurrency so workers with different slot counts compare fairly;
    /// an unlimited-concurrency worker counts raw sessions.
    pub fn busyness(&self) -> usize {
        if self.concurrency == 0 {
            self.sessions
        } else {
            self.sessions * 1000 / self.concurrency
        }
    }

    pub fn at_full_capacity(&self) -> bool {
        self.concurrency != 0 && self.sessions >= self.concurrency
    }

    /// Whether the router may hand this worker a new session.
    pub fn can_accept(&self) -> bool {
        self.state == ProcessState::Enabled
            && self.oobw == OobwState::None
            && !self.at_full_capacity()
    }

    pub fn session_opened(&mut self, now: Instant) {
        debug_assert!(!self.at_full_capacity());
        self.sessions += 1;
        self.sessions_started += 1;
        self.last_used = now;
    }

    /// Returns the number of sessions still open.
    pub fn session_closed(&mut self, now: Instant) -> usize {
        debug_assert!(self.sessions > 0);
        self.sessions = self.sessions.saturating_sub(1);
        self.sessions_completed += 1;
        self.last_used = now;
        self.sessions
    }

    pub fn idle_duration(&self, now: Instant) -> std::time::Duration {
        if self.sessions > 0 {
            std::time::Duration::ZERO
        } else {
            now.saturating_duration_since(self.last_used)
        }
    }

    /// Poll the OS for liveness without signalling.
    pub fn is_alive(&self) -> bool {
        // EPERM still proves the pid exists.
        let rc = unsafe { libc::kill(self.pid as libc::pid_t, 0) };
        rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }

    pub fn send_term(&mut self, now: Instant) {
        if self.term_sent_at.is_none() {
            debug!(pid = self.pid, gupid = %self.gupid, "Sending SIGTERM to worker");
            unsafe {
                libc::kill(self.pid as libc::pid_t, libc::SIGTERM);
            }
            self.term_sent_at = Some(now);
        }
    }

    pub fn send_kill(&mut self) {
        debug!(pid = self.pid, gupid = %self.gupid, "Sending SIGKILL to worker");
        unsafe {
            libc::kill(self.pid as libc::pid_t, libc::SIGKILL);
        }
    }

    /// Attempt to reap the worker. Returns true once the OS process is gone.
    pub fn try_reap(&mut self) -> bool {
        match &mut self.child {
            Some(child) => match child.try_wait() {
                Ok(Some(_)) => {
                    self.child = None;
                    true
                }
                Ok(None) => false,
                // The child was already waited on elsewhere; treat as reaped.
                Err(_) => {
                    self.child = None;
                    true
                }
            },
            None => !self.is_alive(),
        }
    }

    /// Fire all pending disable callbacks with `result`, returning them as
    /// deferred actions to run after lock release.
    pub fn take_disable_callbacks(
        &mut self,
        result: DisableResult,
    ) -> Vec<Box<dyn FnOnce() + Send>> {
        self.disable_callbacks
            .drain(..)
            .map(|cb| {
                let action: Box<dyn FnOnce() + Send> = Box::new(move || cb(result));
                action
            })
            .collect()
    }

    pub fn status(&self, now: Instant) -> ProcessStatus {
        ProcessStatus {
            gupid: self.gupid.clone(),
            pid: self.pid,
            state: self.state,
            generation: self.generation,
            sessions: self.sessions,
            sessions_started: self.sessions_started,
            sessions_completed: self.sessions_completed,
            busyness: self.busyness(),
            uptime_secs: now.saturating_duration_since(self.spawned_at).as_secs(),
            rss_bytes: self.metrics.map(|m| m.rss_bytes),
            cpu_percent: self.metrics.map(|m| m.cpu_percent),
        }
    }
}

impl std::fmt::Debug for Process {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Process")
            .field("gupid", &self.gupid)
            .field("pid", &self.pid)
            .field("state", &self.state)
            .field("generation", &self.generation)
            .field("sessions", &self.sessions)
            .finish()
    }
}

/// Point-in-time snapshot of a worker, safe to hand outside the lock.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessStatus {
    pub gupid: String,
    pub pid: u32,
    pub state: ProcessState,
    pub generation: u64,
    pub sessions: usize,
    pub sessions_started: u64,
    pub sessions_completed: u64,
    pub busyness: usize,
    pub uptime_secs: u64,
    pub rss_bytes: Option<u64>,
    pub cpu_percent: Option<f64>,
}
