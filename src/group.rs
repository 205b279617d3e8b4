//! A group: the cohort of worker processes sharing one application identity.
//!
//! The group owns the spawn-loop and restart state machines and the local
//! FIFO wait list. Every method here must be called with the pool-wide lock
//! held; callbacks are never invoked directly but pushed onto the caller's
//! post-lock action buffer.

use crate::error::{DisableResult, GetError};
use crate::options::{Options, RestartMethod};
use crate::pool::Pool;
use crate::process::{DisableCallback, OobwState, Process, ProcessState, ProcessStatus};
use crate::session::Session;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Weak;
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, info, warn};

/// Restart-marker polls are coalesced and rate-limited to this interval.
const RESTART_MARKER_THROTTLE: Duration = Duration::from_secs(2);

/// Completion callback for a `get` request.
pub type GetCallback = Box<dyn FnOnce(Result<Session, GetError>) + Send>;

/// Closures accumulated during a locked section and run after release, in
/// insertion order, on the invoking thread.
pub(crate) type PostLockActions = Vec<Box<dyn FnOnce() + Send>>;

/// A queued `get` request.
pub(crate) struct GetWaiter {
    pub options: Options,
    pub callback: GetCallback,
    pub enqueued_at: Instant,
    pub deadline: Option<Instant>,
}

impl GetWaiter {
    pub fn new(options: Options, callback: GetCallback, now: Instant) -> Self {
        let deadline = options.max_request_queue_time.map(|limit| now + limit);
        Self {
            options,
            callback,
            enqueued_at: now,
            deadline,
        }
    }
}

/// Shared context for routing operations performed under the pool lock.
pub(crate) struct RouteCtx<'a> {
    pub pool: &'a Weak<Pool>,
    pub actions: &'a mut PostLockActions,
    pub now: Instant,
}

/// Spawn-loop state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SpawnLoopState {
    NotSpawning,
    Spawning,
    /// Draining an old generation while fresh processes replace it.
    Restarting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupLifeStatus {
    Alive,
    /// Detached from the pool map; remaining processes drain and terminate.
    ShuttingDown,
}

/// Outcome of a session-closed notification against this group.
pub(crate) enum SessionClosedOutcome {
    NotFound,
    Closed,
    /// The worker drained with out-of-band work pending; the pool must run it.
    StartOobw { gupid: String },
}

pub(crate) struct Group {
    pub name: String,
    /// Random credential for authenticated management operations.
    pub secret: String,
    /// Current options template; refreshed by the most recent `get`.
    pub options: Options,
    /// Serving processes, ascending by (busyness, last_used).
    pub enabled: Vec<Process>,
    /// Processes holding existing sessions but accepting no new ones.
    pub disabling: Vec<Process>,
    /// Processes awaiting termination and reaping.
    pub detached: Vec<Process>,
    pub get_wait_list: VecDeque<GetWaiter>,
    pub spawn_state: SpawnLoopState,
    /// Whether a spawn-loop thread currently exists for this group.
    pub spawn_loop_running: bool,
    pub processes_being_spawned: usize,
    /// Restart cohort counter; bumped by every restart.
    pub generation: u64,
    pub life_status: GroupLifeStatus,
    pub last_used: Instant,
    /// Last time the spawn loop produced a worker, for preloader expiry.
    pub last_spawn_activity: Instant,
    last_marker_check: Option<Instant>,
    marker_mtime: Option<SystemTime>,
    /// Invoked when the last detached process is reaped after group shutdown.
    pub shutdown_callbacks: Vec<Box<dyn FnOnce() + Send>>,
}

impl Group {
    pub fn new(options: Options, now: Instant) -> Self {
        let name = options.group_name();
        let secret: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(22)
            .map(char::from)
            .collect();
        // Record the marker's current mtime so only later bumps trigger.
        let marker_mtime = options
            .restart_marker
            .as_deref()
            .and_then(|path| std::fs::metadata(path).ok())
            .and_then(|meta| meta.modified().ok());
        Self {
            name,
            secret,
            options,
            enabled: Vec::new(),
            disabling: Vec::new(),
            detached: Vec::new(),
            get_wait_list: VecDeque::new(),
            spawn_state: SpawnLoopState::NotSpawning,
            spawn_loop_running: false,
            processes_being_spawned: 0,
            generation: 1,
            life_status: GroupLifeStatus::Alive,
            last_used: now,
            last_spawn_activity: now,
            last_marker_check: None,
            marker_mtime,
            shutdown_callbacks: Vec::new(),
        }
    }

    /// Processes counted against the pool budget: serving, draining, and
    /// in-flight spawns. Detached processes are already off the books.
    pub fn capacity_used(&self) -> usize {
        self.enabled.len() + self.disabling.len() + self.processes_being_spawned
    }

    /// All processes still tracked by this group, detached included.
    pub fn process_count(&self) -> usize {
        self.enabled.len() + self.disabling.len() + self.detached.len()
    }

    pub fn is_alive(&self) -> bool {
        self.life_status == GroupLifeStatus::Alive
    }

    fn current_generation_enabled(&self) -> usize {
        self.enabled
            .iter()
            .filter(|p| p.generation == self.generation)
            .count()
    }

    fn old_generation_exists(&self) -> bool {
        self.enabled.iter().any(|p| p.generation < self.generation)
            || self.disabling.iter().any(|p| p.generation < self.generation)
    }

    fn below_min(&self) -> bool {
        self.current_generation_enabled() + self.processes_being_spawned
            < self.options.min_processes
    }

    fn below_group_max(&self) -> bool {
        self.options.max_processes == 0 || self.capacity_used() < self.options.max_processes
    }

    pub fn enabled_has_capacity(&self) -> bool {
        self.enabled.iter().any(|p| p.can_accept())
    }

    /// Whether the spawn loop has work, ignoring the global budget (the loop
    /// re-checks that under the lock before every spawn).
    pub fn wants_to_spawn(&self) -> bool {
        if !self.is_alive() {
            return false;
        }
        if self.below_min() && self.below_group_max() {
            return true;
        }
        if self.spawn_state == SpawnLoopState::Restarting && self.old_generation_exists() {
            return true;
        }
        !self.get_wait_list.is_empty() && !self.enabled_has_capacity() && self.below_group_max()
    }

    /* ----- routing ----- */

    fn find_routeable(&self, options: &Options) -> Option<usize> {
        // A sticky session pins the request to its worker while it exists.
        if let Some(sticky) = options.sticky_session_id {
            if let Some(idx) = self
                .enabled
                .iter()
                .position(|p| p.sticky_session_id == sticky && p.can_accept())
            {
                return Some(idx);
            }
        }
        // enabled is sorted least-loaded first; the first acceptor wins.
        self.enabled.iter().position(|p| p.can_accept())
    }

    fn insert_enabled_sorted(&mut self, process: Process) {
        let key = (process.busyness(), process.last_used);
        let pos = self
            .enabled
            .partition_point(|p| (p.busyness(), p.last_used) <= key);
        self.enabled.insert(pos, process);
    }

    fn resort_enabled(&mut self, idx: usize) {
        let process = self.enabled.remove(idx);
        self.insert_enabled_sorted(process);
    }

    fn open_session_at(&mut self, idx: usize, ctx: &mut RouteCtx<'_>) -> Session {
        let process = &mut self.enabled[idx];
        process.session_opened(ctx.now);
        let session = Session::new(
            ctx.pool.clone(),
            self.name.clone(),
            process.gupid.clone(),
            process.pid,
            process.sticky_session_id,
        );
        self.resort_enabled(idx);
        session
    }

    /// Serve or enqueue one request. The caller decides afterwards whether
    /// the spawn loop needs a kick (`wants_to_spawn`).
    pub fn get(&mut self, options: Options, callback: GetCallback, ctx: &mut RouteCtx<'_>) {
        self.last_used = ctx.now;
        if !self.is_alive() {
            ctx.actions
                .push(Box::new(move || callback(Err(GetError::GroupDetached))));
            return;
        }

        if self.check_restart_marker(ctx.now) {
            info!(group = %self.name, "Restart marker touched; restarting group");
            self.restart(RestartMethod::Rolling, ctx);
        }

        // Refresh the template so newly spawned workers pick up the latest
        // tuning fields.
        self.options = options.clone();

        if let Some(idx) = self.find_routeable(&options) {
            let session = self.open_session_at(idx, ctx);
            ctx.actions.push(Box::new(move || callback(Ok(session))));
            return;
        }

        self.enqueue(GetWaiter::new(options, callback, ctx.now), ctx);
    }

    /// Serve or enqueue an already-built waiter, preserving its original
    /// enqueue time and deadline. Used when the pool re-routes a request
    /// from the global wait list.
    pub fn route_waiter(&mut self, waiter: GetWaiter, ctx: &mut RouteCtx<'_>) {
        self.last_used = ctx.now;
        if !self.is_alive() {
            let callback = waiter.callback;
            ctx.actions
                .push(Box::new(move || callback(Err(GetError::GroupDetached))));
            return;
        }
        if let Some(idx) = self.find_routeable(&waiter.options) {
            let session = self.open_session_at(idx, ctx);
            let callback = waiter.callback;
            ctx.actions.push(Box::new(move || callback(Ok(session))));
            return;
        }
        self.enqueue(waiter, ctx);
    }

    /// Queue a waiter, enforcing the size bound.
    pub fn enqueue(&mut self, waiter: GetWaiter, ctx: &mut RouteCtx<'_>) {
        let limit = waiter.options.max_request_queue_size;
        if limit != 0 && self.get_wait_list.len() >= limit {
            warn!(group = %self.name, limit, "Request queue full");
            let callback = waiter.callback;
            ctx.actions
                .push(Box::new(move || callback(Err(GetError::RequestQueueFull { limit }))));
            return;
        }
        self.get_wait_list.push_back(waiter);
    }

    /// Walk the wait list head-first, assigning sessions until the list
    /// empties or no enabled process has capacity.
    pub fn assign_waiters(&mut self, ctx: &mut RouteCtx<'_>) {
        loop {
            let Some(front) = self.get_wait_list.front() else {
                break;
            };
            let Some(idx) = self.find_routeable(&front.options) else {
                break;
            };
            let waiter = self.get_wait_list.pop_front().expect("front checked");
            let session = self.open_session_at(idx, ctx);
            let callback = waiter.callback;
            ctx.actions.push(Box::new(move || callback(Ok(session))));
        }
    }

    /// Fail every queued request with `make_error`.
    pub fn flush_wait_list<F>(&mut self, actions: &mut PostLockActions, make_error: F)
    where
        F: Fn(&GetWaiter) -> GetError,
    {
        for waiter in self.get_wait_list.drain(..) {
            let err = make_error(&waiter);
            let callback = waiter.callback;
            actions.push(Box::new(move || callback(Err(err))));
        }
    }

    /// Drop queued requests whose dwell deadline has passed.
    pub fn sweep_expired_waiters(&mut self, now: Instant, actions: &mut PostLockActions) {
        let mut idx = 0;
        while idx < self.get_wait_list.len() {
            let expired = self.get_wait_list[idx]
                .deadline
                .is_some_and(|deadline| deadline <= now);
            if expired {
                let waiter = self.get_wait_list.remove(idx).expect("index in bounds");
                let waited = now.saturating_duration_since(waiter.enqueued_at);
                let callback = waiter.callback;
                actions.push(Box::new(move || {
                    callback(Err(GetError::RequestQueueTimeout { waited }))
                }));
            } else {
                idx += 1;
            }
        }
    }

    /// Earliest pending queue deadline, for the GC wakeup computation.
    pub fn next_waiter_deadline(&self) -> Option<Instant> {
        self.get_wait_list.iter().filter_map(|w| w.deadline).min()
    }

    /* ----- spawn-loop support ----- */

    /// Called by the spawn loop when a worker becomes ready.
    pub fn attach(&mut self, process: Process, ctx: &mut RouteCtx<'_>) {
        debug!(
            group = %self.name,
            pid = process.pid,
            gupid = %process.gupid,
            generation = process.generation,
            "Worker attached"
        );
        self.last_spawn_activity = ctx.now;
        self.insert_enabled_sorted(process);

        if self.spawn_state == SpawnLoopState::Restarting {
            self.detach_one_old_generation(ctx);
            self.settle_spawn_state();
        }

        self.assign_waiters(ctx);
    }

    fn detach_one_old_generation(&mut self, ctx: &mut RouteCtx<'_>) {
        let generation = self.generation;
        if let Some(idx) = self
            .enabled
            .iter()
            .position(|p| p.generation < generation)
        {
            let process = self.enabled.remove(idx);
            self.detach_process_record(process, ctx);
        } else if let Some(idx) = self
            .disabling
            .iter()
            .position(|p| p.generation < generation)
        {
            let process = self.disabling.remove(idx);
            self.detach_process_record(process, ctx);
        }
    }

    /* ----- restart ----- */

    /// Begin a restart. A restart already in flight coalesces.
    /// Returns false when coalesced.
    pub fn restart(&mut self, method: RestartMethod, ctx: &mut RouteCtx<'_>) -> bool {
        if self.spawn_state == SpawnLoopState::Restarting {
            debug!(group = %self.name, "Restart already in progress; coalescing");
            return false;
        }
        self.generation += 1;
        info!(
            group = %self.name,
            generation = self.generation,
            ?method,
            "Restarting group"
        );
        match method {
            RestartMethod::Rolling => {
                self.spawn_state = SpawnLoopState::Restarting;
            }
            RestartMethod::Immediate => {
                // Old workers stop serving now; their live sessions finish.
                while let Some(process) = self.enabled.pop() {
                    self.detach_process_record(process, ctx);
                }
                while let Some(process) = self.disabling.pop() {
                    self.detach_process_record(process, ctx);
                }
                self.spawn_state = SpawnLoopState::Restarting;
            }
        }
        true
    }

    /// Leave the `Restarting` state once the old generation is gone, however
    /// it went (replaced on attach, garbage collected, or died).
    pub fn settle_spawn_state(&mut self) {
        if self.spawn_state == SpawnLoopState::Restarting && !self.old_generation_exists() {
            self.spawn_state = if self.spawn_loop_running {
                SpawnLoopState::Spawning
            } else {
                SpawnLoopState::NotSpawning
            };
        }
    }

    fn check_restart_marker(&mut self, now: Instant) -> bool {
        let Some(path) = self.options.restart_marker.clone() else {
            return false;
        };
        if self
            .last_marker_check
            .is_some_and(|last| now.saturating_duration_since(last) < RESTART_MARKER_THROTTLE)
        {
            return false;
        }
        self.last_marker_check = Some(now);

        let mtime = std::fs::metadata(&path)
            .ok()
            .and_then(|meta| meta.modified().ok());
        match (self.marker_mtime, mtime) {
            (None, Some(new)) => {
                self.marker_mtime = Some(new);
                true
            }
            (Some(old), Some(new)) if new > old => {
                self.marker_mtime = Some(new);
                true
            }
            _ => false,
        }
    }

    /* ----- disable / detach ----- */

    fn position(list: &[Process], gupid: &str) -> Option<usize> {
        list.iter().position(|p| p.gupid == gupid)
    }

    /// Move a process out of service. Pending disable callbacks are
    /// cancelled; the process terminates once its sessions end.
    /// Returns false if the process is unknown or already detached.
    pub fn detach_process(&mut self, gupid: &str, ctx: &mut RouteCtx<'_>) -> bool {
        if let Some(idx) = Self::position(&self.enabled, gupid) {
            let process = self.enabled.remove(idx);
            self.detach_process_record(process, ctx);
        } else if let Some(idx) = Self::position(&self.disabling, gupid) {
            let process = self.disabling.remove(idx);
            self.detach_process_record(process, ctx);
        } else {
            return false;
        }
        self.settle_spawn_state();
        true
    }

    fn detach_process_record(&mut self, mut process: Process, ctx: &mut RouteCtx<'_>) {
        debug!(
            group = %self.name,
            pid = process.pid,
            gupid = %process.gupid,
            sessions = process.sessions,
            "Worker detached"
        );
        process.state = ProcessState::Detached;
        ctx.actions
            .extend(process.take_disable_callbacks(DisableResult::Canceled));
        self.detached.push(process);
    }

    /// Ask a process to drain. The callback fires with `Success` once its
    /// sessions reach zero, `Canceled` if it is detached first, or `Error`
    /// if it is already detached or unknown.
    pub fn disable_process(
        &mut self,
        gupid: &str,
        callback: DisableCallback,
        ctx: &mut RouteCtx<'_>,
    ) {
        if let Some(idx) = Self::position(&self.enabled, gupid) {
            let mut process = self.enabled.remove(idx);
            process.state = ProcessState::Disabling;
            if process.sessions == 0 {
                ctx.actions
                    .push(Box::new(move || callback(DisableResult::Success)));
            } else {
                process.disable_callbacks.push(callback);
            }
            self.disabling.push(process);
        } else if let Some(idx) = Self::position(&self.disabling, gupid) {
            let process = &mut self.disabling[idx];
            if process.sessions == 0 {
                ctx.actions
                    .push(Box::new(move || callback(DisableResult::Success)));
            } else {
                process.disable_callbacks.push(callback);
            }
        } else {
            ctx.actions
                .push(Box::new(move || callback(DisableResult::Error)));
        }
    }

    /// Return a drained disabling process to service.
    pub fn enable_process(&mut self, gupid: &str, ctx: &mut RouteCtx<'_>) -> bool {
        let Some(idx) = Self::position(&self.disabling, gupid) else {
            return false;
        };
        let mut process = self.disabling.remove(idx);
        process.state = ProcessState::Enabled;
        self.insert_enabled_sorted(process);
        self.assign_waiters(ctx);
        true
    }

    /* ----- out-of-band work ----- */

    /// Flag a worker for out-of-band work. Returns `Some(gupid)` when the
    /// worker is already drained and the OOBW should start immediately.
    pub fn request_oobw(&mut self, gupid: &str) -> Option<String> {
        let idx = Self::position(&self.enabled, gupid)?;
        let process = &mut self.enabled[idx];
        if process.oobw != OobwState::None {
            return None;
        }
        if process.sessions == 0 {
            process.oobw = OobwState::InProgress;
            Some(process.gupid.clone())
        } else {
            process.oobw = OobwState::Requested;
            None
        }
    }

    /// Re-admit a worker whose out-of-band work finished.
    pub fn oobw_finished(&mut self, gupid: &str, ctx: &mut RouteCtx<'_>) {
        if let Some(idx) = Self::position(&self.enabled, gupid) {
            self.enabled[idx].oobw = OobwState::None;
            self.assign_waiters(ctx);
        }
    }

    /* ----- session accounting ----- */

    pub fn session_closed(&mut self, gupid: &str, ctx: &mut RouteCtx<'_>) -> SessionClosedOutcome {
        if let Some(idx) = Self::position(&self.enabled, gupid) {
            let remaining = self.enabled[idx].session_closed(ctx.now);
            let process = &mut self.enabled[idx];
            let oobw_due = remaining == 0 && process.oobw == OobwState::Requested;
            if oobw_due {
                process.oobw = OobwState::InProgress;
            }
            let gupid = process.gupid.clone();
            self.resort_enabled(idx);
            self.assign_waiters(ctx);
            if oobw_due {
                return SessionClosedOutcome::StartOobw { gupid };
            }
            return SessionClosedOutcome::Closed;
        }

        if let Some(idx) = Self::position(&self.disabling, gupid) {
            let process = &mut self.disabling[idx];
            if process.session_closed(ctx.now) == 0 {
                ctx.actions
                    .extend(process.take_disable_callbacks(DisableResult::Success));
            }
            return SessionClosedOutcome::Closed;
        }

        if let Some(idx) = Self::position(&self.detached, gupid) {
            self.detached[idx].session_closed(ctx.now);
            return SessionClosedOutcome::Closed;
        }

        SessionClosedOutcome::NotFound
    }

    /* ----- shutdown ----- */

    /// Detach every process and fail every waiter; the group keeps draining
    /// outside the pool map until the reaper finishes it.
    pub fn initiate_shutdown(&mut self, ctx: &mut RouteCtx<'_>) {
        self.life_status = GroupLifeStatus::ShuttingDown;
        self.spawn_state = SpawnLoopState::NotSpawning;
        while let Some(process) = self.enabled.pop() {
            self.detach_process_record(process, ctx);
        }
        while let Some(process) = self.disabling.pop() {
            self.detach_process_record(process, ctx);
        }
        let mut flushed = PostLockActions::new();
        self.flush_wait_list(&mut flushed, |_| GetError::GroupDetached);
        ctx.actions.extend(flushed);
    }

    pub fn has_no_processes(&self) -> bool {
        self.enabled.is_empty()
            && self.disabling.is_empty()
            && self.detached.is_empty()
            && self.processes_being_spawned == 0
    }

    /// An empty, idle, demand-free group can be dropped by the collector.
    pub fn is_garbage(&self, now: Instant, max_idle: Duration) -> bool {
        self.has_no_processes()
            && self.get_wait_list.is_empty()
            && !self.wants_to_spawn()
            && now.saturating_duration_since(self.last_used) > max_idle
    }

    pub fn status(&self, now: Instant) -> GroupStatus {
        let mut processes: Vec<ProcessStatus> = Vec::with_capacity(self.process_count());
        processes.extend(self.enabled.iter().map(|p| p.status(now)));
        processes.extend(self.disabling.iter().map(|p| p.status(now)));
        processes.extend(self.detached.iter().map(|p| p.status(now)));
        GroupStatus {
            name: self.name.clone(),
            app_root: self.options.app_root.display().to_string(),
            life_status: self.life_status,
            spawn_state: self.spawn_state,
            generation: self.generation,
            queue_length: self.get_wait_list.len(),
            processes_being_spawned: self.processes_being_spawned,
            processes,
        }
    }
}

/// Point-in-time snapshot of a group.
#[derive(Debug, Clone, Serialize)]
pub struct GroupStatus {
    pub name: String,
    pub app_root: String,
    pub life_status: GroupLifeStatus,
    pub spawn_state: SpawnLoopState,
    pub generation: u64,
    pub queue_length: usize,
    pub processes_being_spawned: usize,
    pub processes: Vec<ProcessStatus>,
}
