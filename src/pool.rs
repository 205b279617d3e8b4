//! The pool: global capacity manager and router.
//!
//! One pool-wide mutex guards the group map and every group's mutable state;
//! cross-component transitions (pool <-> group <-> process) must be atomic
//! and fine-grained locking breeds ordering bugs in the wait-list and restart
//! paths. The lock is released in exactly two situations: around the blocking
//! spawning-kit call, and around user callbacks, which are accumulated as
//! post-lock actions and run after release in insertion order.
//!
//! Background threads (garbage collector, detached-process reaper, analytics
//! collector, per-group spawn loops) observe the pool life status at their
//! suspension points and are joined by [`Pool::destroy`].

use crate::config::PoolConfig;
use crate::error::{DisableResult, GetError, SpawnError};
use crate::group::{
    GetCallback, GetWaiter, Group, GroupStatus, PostLockActions, RouteCtx, SessionClosedOutcome,
    SpawnLoopState,
};
use crate::hooks::HookRegistry;
use crate::metrics::{self, ProcessMetrics};
use crate::options::{Options, RestartMethod};
use crate::process::{Process, ProcessStatus};
use crate::session::Session;
use crate::spawn::{SpawnedWorker, Spawner};
use parking_lot::{Condvar, Mutex};
use rand::Rng;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::fmt::Write as _;
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

const ANSI_BOLD: &str = "\x1b[1m";
const ANSI_RESET: &str = "\x1b[0m";

/// Pool life status; only `Alive` accepts new `get` requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolLifeStatus {
    Alive,
    PreparedForShutdown,
    ShuttingDown,
    ShutDown,
}

/// Formatting switches for [`Pool::inspect`].
#[derive(Debug, Clone, Copy, Default)]
pub struct InspectOptions {
    pub colorize: bool,
    pub verbose: bool,
}

/// Point-in-time snapshot of the whole pool.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub life_status: PoolLifeStatus,
    pub max: usize,
    pub capacity_used: usize,
    pub process_count: usize,
    pub group_count: usize,
    pub global_queue_length: usize,
    pub system_load: Option<(f64, f64, f64)>,
    pub groups: Vec<GroupStatus>,
}

/// Wait ticket for the blocking `get` variant.
///
/// Cloning shares the ticket, so another thread can [`abort`](Ticket::abort)
/// while the owner blocks in [`wait`](Ticket::wait). If the session arrives
/// after an abort it is released immediately through the normal close path.
#[derive(Clone)]
pub struct Ticket {
    shared: Arc<TicketShared>,
}

struct TicketShared {
    state: Mutex<TicketState>,
    cond: Condvar,
}

#[derive(Default)]
struct TicketState {
    result: Option<Result<Session, GetError>>,
    aborted: bool,
}

impl Ticket {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(TicketShared {
                state: Mutex::new(TicketState::default()),
                cond: Condvar::new(),
            }),
        }
    }

    /// Drop interest in the outcome. The pending callback still fires
    /// exactly once; a session delivered afterwards is closed on the spot.
    pub fn abort(&self) {
        let stale = {
            let mut state = self.shared.state.lock();
            state.aborted = true;
            self.shared.cond.notify_all();
            state.result.take()
        };
        // Dropping a session re-enters the pool; never do it under our lock.
        drop(stale);
    }

    /// Block until the callback fires, or until aborted.
    pub fn wait(&self) -> Result<Session, GetError> {
        let mut state = self.shared.state.lock();
        loop {
            if let Some(result) = state.result.take() {
                return result;
            }
            if state.aborted {
                return Err(GetError::GetAborted);
            }
            self.shared.cond.wait(&mut state);
        }
    }

    pub(crate) fn callback(&self) -> GetCallback {
        let shared = Arc::clone(&self.shared);
        Box::new(move |result| {
            let stale = {
                let mut state = shared.state.lock();
                if state.aborted {
                    Some(result)
                } else {
                    state.result = Some(result);
                    shared.cond.notify_all();
                    None
                }
            };
            drop(stale);
        })
    }
}

impl Default for Ticket {
    fn default() -> Self {
        Self::new()
    }
}

struct PoolInner {
    max: usize,
    /// Transient allowance when `set_max` dropped below the live count; no
    /// eviction happens, new spawns are refused until attrition catches up.
    max_overcommit: usize,
    max_idle_time: Duration,
    self_checking: bool,
    life_status: PoolLifeStatus,
    groups: HashMap<String, Group>,
    /// Detached groups draining outside the map; a fresh group under the
    /// same name may already exist while these terminate.
    doomed_groups: Vec<Group>,
    /// Requests that could not be matched to any group because the pool is
    /// at full capacity and nothing could be trashed.
    get_wait_list: VecDeque<GetWaiter>,
    gupid_seq: u64,
    system_load: Option<(f64, f64, f64)>,
}

impl PoolInner {
    fn capacity_used(&self) -> usize {
        self.groups.values().map(Group::capacity_used).sum()
    }

    fn allowed_max(&self) -> usize {
        self.max.max(self.max_overcommit)
    }

    fn at_full_capacity(&self) -> bool {
        self.capacity_used() >= self.allowed_max()
    }

    fn settle_overcommit(&mut self) {
        let used = self.capacity_used();
        if used <= self.max {
            self.max_overcommit = 0;
        } else {
            self.max_overcommit = self.max_overcommit.min(used);
        }
    }

    fn next_gupid(&mut self) -> String {
        self.gupid_seq += 1;
        let nonce = uuid::Uuid::new_v4().simple().to_string();
        format!("{}-{:x}", &nonce[..8], self.gupid_seq)
    }
}

/// Application process pool.
///
/// Construct with [`Pool::new`]; call [`Pool::destroy`] before dropping the
/// last handle, otherwise the background threads keep their `Arc` clones and
/// the pool (and its workers) outlive the caller.
pub struct Pool {
    spawner: Arc<dyn Spawner>,
    hooks: HookRegistry,
    shutdown_grace_period: Duration,
    detached_check_interval: Duration,
    gc_interval_ceiling: Duration,
    preloader_idle_time: Duration,
    analytics_interval: Option<Duration>,
    inner: Mutex<PoolInner>,
    /// Wakes the garbage collector when a deadline may have moved earlier.
    gc_cond: Condvar,
    /// Wakes the reaper and analytics sleeps at shutdown.
    task_cond: Condvar,
    self_weak: Weak<Pool>,
    interruptable_threads: Mutex<Vec<JoinHandle<()>>>,
    cleanup_threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Pool {
    pub fn new(config: PoolConfig, spawner: Arc<dyn Spawner>) -> Arc<Pool> {
        let pool = Arc::new_cyclic(|weak| Pool {
            spawner,
            hooks: HookRegistry::new(config.hooks.clone()),
            shutdown_grace_period: config.shutdown_grace_period(),
            detached_check_interval: config.detached_check_interval(),
            gc_interval_ceiling: config.gc_interval_ceiling(),
            preloader_idle_time: config.preloader_idle_time(),
            analytics_interval: config.analytics_interval(),
            inner: Mutex::new(PoolInner {
                max: config.max,
                max_overcommit: 0,
                max_idle_time: config.max_idle_time(),
                self_checking: config.self_checking,
                life_status: PoolLifeStatus::Alive,
                groups: HashMap::new(),
                doomed_groups: Vec::new(),
                get_wait_list: VecDeque::new(),
                gupid_seq: 0,
                system_load: None,
            }),
            gc_cond: Condvar::new(),
            task_cond: Condvar::new(),
            self_weak: weak.clone(),
            interruptable_threads: Mutex::new(Vec::new()),
            cleanup_threads: Mutex::new(Vec::new()),
        });

        pool.spawn_interruptable("pool-gc", {
            let pool = Arc::clone(&pool);
            move || pool.garbage_collector_main()
        });
        pool.spawn_interruptable("pool-reaper", {
            let pool = Arc::clone(&pool);
            move || pool.detached_processes_checker_main()
        });
        if pool.analytics_interval.is_some() {
            pool.spawn_interruptable("pool-analytics", {
                let pool = Arc::clone(&pool);
                move || pool.analytics_main()
            });
        }

        info!(max = config.max, "Pool initialized");
        pool
    }

    /* ----- get ----- */

    /// Route a request; never blocks. The callback fires exactly once, after
    /// the lock is released, with a session or an error.
    pub fn async_get(&self, options: &Options, callback: GetCallback) {
        let mut actions = PostLockActions::new();
        {
            let mut inner = self.inner.lock();
            self.async_get_locked(&mut inner, options.clone(), callback, &mut actions);
            self.verify_invariants(&inner);
        }
        // The request may have queued with a dwell deadline the collector
        // must wake up for.
        if options.max_request_queue_time.is_some() {
            self.gc_cond.notify_one();
        }
        run_actions(actions);
    }

    /// Blocking `get`: waits on a ticket until the callback fires.
    pub fn get(&self, options: &Options) -> Result<Session, GetError> {
        let ticket = Ticket::new();
        self.get_with_ticket(options, &ticket);
        ticket.wait()
    }

    /// `async_get` wired to an externally held ticket, so the caller can
    /// abort while another thread waits.
    pub fn get_with_ticket(&self, options: &Options, ticket: &Ticket) {
        self.async_get(options, ticket.callback());
    }

    fn async_get_locked(
        &self,
        inner: &mut PoolInner,
        options: Options,
        callback: GetCallback,
        actions: &mut PostLockActions,
    ) {
        let now = Instant::now();
        if inner.life_status != PoolLifeStatus::Alive {
            actions.push(Box::new(move || callback(Err(GetError::PoolShuttingDown))));
            return;
        }

        let name = options.group_name();
        if inner.groups.contains_key(&name) {
            {
                let mut ctx = RouteCtx {
                    pool: &self.self_weak,
                    actions,
                    now,
                };
                let group = inner.groups.get_mut(&name).expect("checked above");
                group.get(options, callback, &mut ctx);
            }
            self.consider_spawning(inner, &name, actions);
            return;
        }

        // No such group yet: admit it if the budget has room, or if room can
        // be made by trashing a victim elsewhere.
        if !inner.at_full_capacity() || self.force_free_capacity(inner, Some(&name), actions) {
            let group = Group::new(options.clone(), now);
            inner.groups.insert(name.clone(), group);
            {
                let mut ctx = RouteCtx {
                    pool: &self.self_weak,
                    actions,
                    now,
                };
                let group = inner.groups.get_mut(&name).expect("just inserted");
                group.route_waiter(GetWaiter::new(options, callback, now), &mut ctx);
            }
            self.consider_spawning(inner, &name, actions);
            return;
        }

        debug!(group = %name, "Pool at full capacity; queueing on global wait list");
        inner
            .get_wait_list
            .push_back(GetWaiter::new(options, callback, now));
        // The waiter may carry a queue-time deadline the collector must honor.
        self.gc_cond.notify_one();
    }

    /* ----- capacity arbitration ----- */

    /// Detach a victim process to make room for one more. Preference order:
    /// a waiter-less group above its minimum, then the oldest idle process
    /// outside the requesting group, then a drained disabling process. A
    /// group that is actively serving or has waiters never loses its last
    /// process.
    fn force_free_capacity(
        &self,
        inner: &mut PoolInner,
        exclude: Option<&str>,
        actions: &mut PostLockActions,
    ) -> bool {
        let Some((group_name, gupid)) = Self::find_best_process_to_trash(inner, exclude) else {
            return false;
        };
        debug!(group = %group_name, gupid = %gupid, "Trashing process to free capacity");
        self.detach_process_in_group(inner, &group_name, &gupid, actions);
        true
    }

    fn find_best_process_to_trash(
        inner: &PoolInner,
        exclude: Option<&str>,
    ) -> Option<(String, String)> {
        let eligible = |group: &&Group| Some(group.name.as_str()) != exclude;

        // (a) groups above their minimum with nobody waiting
        let mut best: Option<(&Group, &Process)> = None;
        for group in inner.groups.values().filter(eligible) {
            if !group.get_wait_list.is_empty()
                || group.enabled.len() <= group.options.min_processes
            {
                continue;
            }
            if let Some(process) = group
                .enabled
                .iter()
                .min_by_key(|p| (p.sessions, p.last_used))
            {
                if best.is_none() || process.last_used < best.expect("checked").1.last_used {
                    best = Some((group, process));
                }
            }
        }
        if let Some((group, process)) = best {
            return Some((group.name.clone(), process.gupid.clone()));
        }

        // (b) the oldest idle process in any other quiet group
        let mut best: Option<(&Group, &Process)> = None;
        for group in inner.groups.values().filter(eligible) {
            if !group.get_wait_list.is_empty() {
                continue;
            }
            for process in group.enabled.iter().filter(|p| p.sessions == 0) {
                if best.is_none() || process.last_used < best.expect("checked").1.last_used {
                    best = Some((group, process));
                }
            }
        }
        if let Some((group, process)) = best {
            return Some((group.name.clone(), process.gupid.clone()));
        }

        // (c) a disabling process that already drained
        for group in inner.groups.values().filter(eligible) {
            if let Some(process) = group.disabling.iter().find(|p| p.sessions == 0) {
                return Some((group.name.clone(), process.gupid.clone()));
            }
        }
        None
    }

    fn detach_process_in_group(
        &self,
        inner: &mut PoolInner,
        group_name: &str,
        gupid: &str,
        actions: &mut PostLockActions,
    ) -> bool {
        let now = Instant::now();
        let Some(group) = inner.groups.get_mut(group_name) else {
            return false;
        };
        let pid = group
            .enabled
            .iter()
            .chain(group.disabling.iter())
            .find(|p| p.gupid == gupid)
            .map(|p| p.pid);
        let mut ctx = RouteCtx {
            pool: &self.self_weak,
            actions,
            now,
        };
        if !group.detach_process(gupid, &mut ctx) {
            return false;
        }
        self.push_hook(
            actions,
            "detached_process",
            vec![
                ("group", group_name.to_string()),
                ("gupid", gupid.to_string()),
                ("pid", pid.unwrap_or(0).to_string()),
            ],
        );
        true
    }

    /// React to freed capacity: drain the global wait list head-first, then
    /// re-kick spawn loops of groups that still have demand.
    fn capacity_event(&self, inner: &mut PoolInner, actions: &mut PostLockActions) {
        inner.settle_overcommit();
        self.assign_global_waiters(inner, actions);
        self.possibly_spawn_more(inner, actions);
    }

    fn assign_global_waiters(&self, inner: &mut PoolInner, actions: &mut PostLockActions) {
        let now = Instant::now();
        loop {
            let Some(front) = inner.get_wait_list.front() else {
                break;
            };
            let name = front.options.group_name();

            if !inner.groups.contains_key(&name) {
                if inner.at_full_capacity()
                    && !self.force_free_capacity(inner, Some(&name), actions)
                {
                    // Head cannot be satisfied; stop to preserve FIFO.
                    break;
                }
                let options = inner
                    .get_wait_list
                    .front()
                    .expect("still present")
                    .options
                    .clone();
                inner.groups.insert(name.clone(), Group::new(options, now));
            }

            let waiter = inner.get_wait_list.pop_front().expect("front checked");
            {
                let mut ctx = RouteCtx {
                    pool: &self.self_weak,
                    actions,
                    now,
                };
                let group = inner.groups.get_mut(&name).expect("present");
                group.route_waiter(waiter, &mut ctx);
            }
            self.consider_spawning(inner, &name, actions);
        }
    }

    fn possibly_spawn_more(&self, inner: &mut PoolInner, actions: &mut PostLockActions) {
        let names: Vec<String> = inner
            .groups
            .iter()
            .filter(|(_, g)| g.wants_to_spawn() && !g.spawn_loop_running)
            .map(|(name, _)| name.clone())
            .collect();
        for name in names {
            // Background refills only use spare capacity; trashing victims
            // is reserved for request-driven paths, otherwise two groups
            // below their minimum would evict each other forever.
            self.consider_spawning_spare(inner, &name, actions);
        }
    }

    /// Start the group's spawn loop on behalf of a request, trashing a
    /// victim elsewhere if that is what it takes.
    fn consider_spawning(
        &self,
        inner: &mut PoolInner,
        group_name: &str,
        actions: &mut PostLockActions,
    ) {
        if inner.life_status != PoolLifeStatus::Alive {
            return;
        }
        {
            let Some(group) = inner.groups.get(group_name) else {
                return;
            };
            if !group.wants_to_spawn() || group.spawn_loop_running {
                return;
            }
        }
        if inner.at_full_capacity() && !self.force_free_capacity(inner, Some(group_name), actions)
        {
            return;
        }
        self.start_spawn_loop(inner, group_name);
    }

    /// Like [`consider_spawning`](Self::consider_spawning), but never trashes
    /// a victim; the group waits for the next capacity event instead.
    fn consider_spawning_spare(
        &self,
        inner: &mut PoolInner,
        group_name: &str,
        _actions: &mut PostLockActions,
    ) {
        if inner.life_status != PoolLifeStatus::Alive || inner.at_full_capacity() {
            return;
        }
        {
            let Some(group) = inner.groups.get(group_name) else {
                return;
            };
            if !group.wants_to_spawn() || group.spawn_loop_running {
                return;
            }
        }
        self.start_spawn_loop(inner, group_name);
    }

    fn start_spawn_loop(&self, inner: &mut PoolInner, group_name: &str) {
        let group = inner.groups.get_mut(group_name).expect("caller checked presence");
        group.spawn_loop_running = true;
        if group.spawn_state == SpawnLoopState::NotSpawning {
            group.spawn_state = SpawnLoopState::Spawning;
        }
        let name = group.name.clone();
        let secret = group.secret.clone();
        let Some(pool) = self.self_weak.upgrade() else {
            return;
        };
        self.spawn_interruptable(&format!("spawn:{}", name), move || {
            pool.spawn_loop_main(name, secret)
        });
    }

    /* ----- spawn loop ----- */

    /// One spawn at a time per group. The lock is dropped around the
    /// blocking spawner call and every precondition is re-verified after
    /// re-acquiring it.
    fn spawn_loop_main(self: &Arc<Self>, group_name: String, group_secret: String) {
        loop {
            let job = {
                let mut inner = self.inner.lock();
                let alive = inner.life_status == PoolLifeStatus::Alive;
                let has_room = !inner.at_full_capacity();
                match inner.groups.get_mut(&group_name) {
                    Some(group) if group.secret == group_secret => {
                        group.settle_spawn_state();
                        if alive && group.wants_to_spawn() && has_room {
                            group.processes_being_spawned += 1;
                            Some((group.options.clone(), group.generation))
                        } else {
                            group.spawn_loop_running = false;
                            if group.spawn_state == SpawnLoopState::Spawning {
                                group.spawn_state = SpawnLoopState::NotSpawning;
                            }
                            None
                        }
                    }
                    _ => None,
                }
            };
            let Some((options, generation)) = job else {
                return;
            };

            let result = self.spawner.spawn(&options, generation);

            let mut actions = PostLockActions::new();
            let keep_going = {
                let mut inner = self.inner.lock();
                let outcome =
                    self.finish_spawn(&mut inner, &group_name, &group_secret, generation, result, &mut actions);
                self.verify_invariants(&inner);
                outcome
            };
            run_actions(actions);
            if !keep_going {
                return;
            }
        }
    }

    fn finish_spawn(
        &self,
        inner: &mut PoolInner,
        group_name: &str,
        group_secret: &str,
        generation: u64,
        result: Result<SpawnedWorker, SpawnError>,
        actions: &mut PostLockActions,
    ) -> bool {
        let now = Instant::now();

        let group_matches = inner
            .groups
            .get(group_name)
            .is_some_and(|g| g.secret == group_secret);
        if !group_matches {
            // The group was detached (or replaced) while we were spawning.
            if let Some(doomed) = inner
                .doomed_groups
                .iter_mut()
                .find(|g| g.secret == group_secret)
            {
                doomed.processes_being_spawned =
                    doomed.processes_being_spawned.saturating_sub(1);
            }
            if let Ok(worker) = result {
                actions.push(Box::new(move || discard_worker(worker)));
            }
            return false;
        }

        let pool_alive = inner.life_status == PoolLifeStatus::Alive;
        let gupid = inner.next_gupid();
        let group = inner.groups.get_mut(group_name).expect("checked above");
        group.processes_being_spawned -= 1;

        match result {
            Ok(worker) => {
                if !pool_alive || group.generation != generation {
                    // Shutdown, or a restart superseded this cohort mid-spawn.
                    if !pool_alive {
                        group.spawn_loop_running = false;
                        group.spawn_state = SpawnLoopState::NotSpawning;
                    }
                    actions.push(Box::new(move || discard_worker(worker)));
                    // The discarded spawn's budget slot is free again.
                    self.capacity_event(inner, actions);
                    return pool_alive;
                }
                let pid = worker.pid;
                let sticky = rand::thread_rng().gen_range(1..u32::MAX);
                let process = Process::new(
                    gupid.clone(),
                    pid,
                    generation,
                    sticky,
                    worker.concurrency,
                    worker.child,
                    now,
                );
                let mut ctx = RouteCtx {
                    pool: &self.self_weak,
                    actions,
                    now,
                };
                group.attach(process, &mut ctx);
                self.push_hook(
                    actions,
                    "attached_process",
                    vec![
                        ("group", group_name.to_string()),
                        ("gupid", gupid),
                        ("pid", pid.to_string()),
                    ],
                );
                // A worker attached into a waiter-less group is the first
                // drain trigger for the global wait list: it only becomes
                // trash-eligible now, so global waiters must be re-examined.
                self.capacity_event(inner, actions);
                true
            }
            Err(err) => {
                warn!(group = %group_name, error = %err, "Spawn failed; flushing group wait list");
                group.spawn_state = SpawnLoopState::NotSpawning;
                group.spawn_loop_running = false;
                let flush_err = err.clone();
                group.flush_wait_list(actions, |_| GetError::SpawnFailed(flush_err.clone()));
                let remove_group = group.has_no_processes();
                if remove_group {
                    inner.groups.remove(group_name);
                    debug!(group = %group_name, "Removed group after spawn failure");
                }
                self.push_hook(
                    actions,
                    "spawn_failed",
                    vec![
                        ("group", group_name.to_string()),
                        ("error", err.to_string()),
                    ],
                );
                // Whatever budget this spawn held is free again.
                self.capacity_event(inner, actions);
                false
            }
        }
    }

    /* ----- session lifecycle ----- */

    /// Called by [`Session::close`]. Updates accounting, completes pending
    /// disable drains, starts out-of-band work, and lets the global wait
    /// list take a crack at the freed slot.
    pub(crate) fn session_closed(&self, group_name: &str, gupid: &str) {
        let mut actions = PostLockActions::new();
        {
            let mut inner = self.inner.lock();
            let now = Instant::now();
            let mut outcome = SessionClosedOutcome::NotFound;
            if let Some(group) = inner.groups.get_mut(group_name) {
                let mut ctx = RouteCtx {
                    pool: &self.self_weak,
                    actions: &mut actions,
                    now,
                };
                outcome = group.session_closed(gupid, &mut ctx);
            }
            if matches!(outcome, SessionClosedOutcome::NotFound) {
                for group in inner.doomed_groups.iter_mut() {
                    let mut ctx = RouteCtx {
                        pool: &self.self_weak,
                        actions: &mut actions,
                        now,
                    };
                    if !matches!(
                        group.session_closed(gupid, &mut ctx),
                        SessionClosedOutcome::NotFound
                    ) {
                        outcome = SessionClosedOutcome::Closed;
                        break;
                    }
                }
            }
            if let SessionClosedOutcome::StartOobw { gupid } = outcome {
                self.start_oobw(group_name.to_string(), gupid, &mut actions);
            }
            // A now-idle process may be trashable on behalf of global waiters.
            self.assign_global_waiters(&mut inner, &mut actions);
            self.verify_invariants(&inner);
        }
        self.gc_cond.notify_one();
        run_actions(actions);
    }

    /// Route new sessions away from a worker until it drains, run the
    /// `oob_work` hook, then re-admit it.
    pub fn request_oobw(&self, gupid: &str) -> bool {
        let mut actions = PostLockActions::new();
        let requested = {
            let mut inner = self.inner.lock();
            let mut requested = false;
            let mut start: Option<(String, String)> = None;
            for (name, group) in inner.groups.iter_mut() {
                if group.enabled.iter().any(|p| p.gupid == gupid) {
                    if let Some(drained) = group.request_oobw(gupid) {
                        start = Some((name.clone(), drained));
                    }
                    requested = true;
                    break;
                }
            }
            if let Some((group_name, gupid)) = start {
                self.start_oobw(group_name, gupid, &mut actions);
            }
            requested
        };
        run_actions(actions);
        requested
    }

    fn start_oobw(&self, group_name: String, gupid: String, actions: &mut PostLockActions) {
        let Some(pool) = self.self_weak.upgrade() else {
            return;
        };
        actions.push(Box::new(move || {
            let pool2 = Arc::clone(&pool);
            pool.spawn_cleanup("oobw", move || {
                let fields = [
                    ("group", group_name.clone()),
                    ("gupid", gupid.clone()),
                ];
                if let Err(err) = pool2.hooks.run("oob_work", &fields) {
                    warn!(gupid = %gupid, error = %err, "Out-of-band work hook failed");
                }
                pool2.oobw_finished(&group_name, &gupid);
            });
        }));
    }

    fn oobw_finished(&self, group_name: &str, gupid: &str) {
        let mut actions = PostLockActions::new();
        {
            let mut inner = self.inner.lock();
            let now = Instant::now();
            if let Some(group) = inner.groups.get_mut(group_name) {
                let mut ctx = RouteCtx {
                    pool: &self.self_weak,
                    actions: &mut actions,
                    now,
                };
                group.oobw_finished(gupid, &mut ctx);
            }
            self.verify_invariants(&inner);
        }
        run_actions(actions);
    }

    /* ----- group manipulation ----- */

    /// Look up the group these options route to, creating it (without
    /// spawning) if absent, and return its snapshot.
    pub fn find_or_create_group(&self, options: &Options) -> GroupStatus {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        let name = options.group_name();
        let group = inner
            .groups
            .entry(name)
            .or_insert_with(|| Group::new(options.clone(), now));
        group.status(now)
    }

    pub fn find_group_by_secret(&self, secret: &str) -> Option<GroupStatus> {
        let inner = self.inner.lock();
        let now = Instant::now();
        inner
            .groups
            .values()
            .find(|g| g.secret == secret)
            .map(|g| g.status(now))
    }

    /// Detach the group: fail its waiters, stop routing to it, and block
    /// until its processes have terminated. Returns false for unknown names.
    pub fn detach_group_by_name(&self, name: &str) -> bool {
        let ticket = Ticket::new();
        let mut actions = PostLockActions::new();
        let found = {
            let mut inner = self.inner.lock();
            let found = self.detach_group_locked(&mut inner, name, &ticket, &mut actions);
            self.verify_invariants(&inner);
            found
        };
        run_actions(actions);
        if !found {
            return false;
        }
        self.task_cond.notify_all();
        let _ = ticket.wait();
        true
    }

    pub fn detach_group_by_secret(&self, secret: &str) -> bool {
        let name = {
            let inner = self.inner.lock();
            inner
                .groups
                .values()
                .find(|g| g.secret == secret)
                .map(|g| g.name.clone())
        };
        match name {
            Some(name) => self.detach_group_by_name(&name),
            None => false,
        }
    }

    fn detach_group_locked(
        &self,
        inner: &mut PoolInner,
        name: &str,
        ticket: &Ticket,
        actions: &mut PostLockActions,
    ) -> bool {
        let Some(mut group) = inner.groups.remove(name) else {
            return false;
        };
        info!(group = %name, "Detaching group");
        let now = Instant::now();
        {
            let mut ctx = RouteCtx {
                pool: &self.self_weak,
                actions,
                now,
            };
            group.initiate_shutdown(&mut ctx);
        }
        let callback = ticket.callback();
        if group.has_no_processes() {
            actions.push(Box::new(move || {
                callback(Err(GetError::GroupDetached));
            }));
        } else {
            group.shutdown_callbacks.push(Box::new(move || {
                callback(Err(GetError::GroupDetached));
            }));
            inner.doomed_groups.push(group);
        }
        self.capacity_event(inner, actions);
        true
    }

    pub fn restart_group_by_name(&self, name: &str, method: RestartMethod) -> bool {
        let mut actions = PostLockActions::new();
        let found = {
            let mut inner = self.inner.lock();
            let found = self.restart_group_locked(&mut inner, name, method, &mut actions);
            self.verify_invariants(&inner);
            found
        };
        run_actions(actions);
        found
    }

    /// Restart every group whose app root matches. Returns how many were hit.
    pub fn restart_groups_by_app_root(&self, app_root: &std::path::Path, method: RestartMethod) -> usize {
        let names: Vec<String> = {
            let inner = self.inner.lock();
            inner
                .groups
                .values()
                .filter(|g| g.options.app_root() == app_root)
                .map(|g| g.name.clone())
                .collect()
        };
        let mut restarted = 0;
        for name in &names {
            if self.restart_group_by_name(name, method) {
                restarted += 1;
            }
        }
        restarted
    }

    fn restart_group_locked(
        &self,
        inner: &mut PoolInner,
        name: &str,
        method: RestartMethod,
        actions: &mut PostLockActions,
    ) -> bool {
        let now = Instant::now();
        {
            let Some(group) = inner.groups.get_mut(name) else {
                return false;
            };
            let mut ctx = RouteCtx {
                pool: &self.self_weak,
                actions,
                now,
            };
            group.restart(method, &mut ctx);
        }
        // Immediate restarts free capacity; rolling restarts need a kick.
        self.capacity_event(inner, actions);
        self.consider_spawning(inner, name, actions);
        true
    }

    /* ----- process manipulation ----- */

    pub fn find_process_by_gupid(&self, gupid: &str) -> Option<ProcessStatus> {
        let inner = self.inner.lock();
        let now = Instant::now();
        let result = all_processes(&inner)
            .find(|p| p.gupid == gupid)
            .map(|p| p.status(now));
        result
    }

    pub fn find_process_by_pid(&self, pid: u32) -> Option<ProcessStatus> {
        let inner = self.inner.lock();
        let now = Instant::now();
        let result = all_processes(&inner).find(|p| p.pid == pid).map(|p| p.status(now));
        result
    }

    /// Snapshot of every process the pool tracks, detached ones included.
    pub fn processes(&self) -> Vec<ProcessStatus> {
        let inner = self.inner.lock();
        let now = Instant::now();
        all_processes(&inner).map(|p| p.status(now)).collect()
    }

    /// Remove a process from service; it terminates once its sessions end.
    /// Idempotent: detaching an already-detached process is a no-op.
    pub fn detach_process_by_gupid(&self, gupid: &str) -> bool {
        let location = {
            let inner = self.inner.lock();
            inner
                .groups
                .values()
                .find(|g| {
                    g.enabled.iter().chain(g.disabling.iter()).any(|p| p.gupid == gupid)
                })
                .map(|g| g.name.clone())
        };
        let Some(group_name) = location else {
            return false;
        };
        self.detach_process_in(&group_name, gupid)
    }

    pub fn detach_process_by_pid(&self, pid: u32) -> bool {
        let location = {
            let inner = self.inner.lock();
            inner
                .groups
                .values()
                .find_map(|g| {
                    g.enabled
                        .iter()
                        .chain(g.disabling.iter())
                        .find(|p| p.pid == pid)
                        .map(|p| (g.name.clone(), p.gupid.clone()))
                })
        };
        let Some((group_name, gupid)) = location else {
            return false;
        };
        self.detach_process_in(&group_name, &gupid)
    }

    fn detach_process_in(&self, group_name: &str, gupid: &str) -> bool {
        let mut actions = PostLockActions::new();
        let detached = {
            let mut inner = self.inner.lock();
            let detached = self.detach_process_in_group(&mut inner, group_name, gupid, &mut actions);
            if detached {
                self.capacity_event(&mut inner, &mut actions);
            }
            self.verify_invariants(&inner);
            detached
        };
        run_actions(actions);
        if detached {
            self.task_cond.notify_all();
        }
        detached
    }

    /// Ask a process to drain and block until it does. `Success` once its
    /// sessions hit zero, `Canceled` if it died or was detached first,
    /// `Error` if it was already detached or unknown.
    pub fn disable_process(&self, gupid: &str) -> DisableResult {
        let (tx, rx) = std::sync::mpsc::channel();
        self.disable_process_async(
            gupid,
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        );
        rx.recv().unwrap_or(DisableResult::Error)
    }

    pub fn disable_process_async(
        &self,
        gupid: &str,
        callback: Box<dyn FnOnce(DisableResult) + Send>,
    ) {
        let mut actions = PostLockActions::new();
        {
            let mut inner = self.inner.lock();
            let now = Instant::now();
            let group_name = inner
                .groups
                .values()
                .find(|g| {
                    g.enabled
                        .iter()
                        .chain(g.disabling.iter())
                        .chain(g.detached.iter())
                        .any(|p| p.gupid == gupid)
                })
                .map(|g| g.name.clone());
            match group_name {
                Some(name) => {
                    let mut ctx = RouteCtx {
                        pool: &self.self_weak,
                        actions: &mut actions,
                        now,
                    };
                    let group = inner.groups.get_mut(&name).expect("found above");
                    group.disable_process(gupid, callback, &mut ctx);
                }
                None => {
                    actions.push(Box::new(move || callback(DisableResult::Error)));
                }
            }
            self.verify_invariants(&inner);
        }
        run_actions(actions);
    }

    /// Return a disabled (draining or drained) process to service.
    pub fn enable_process(&self, gupid: &str) -> bool {
        let mut actions = PostLockActions::new();
        let enabled = {
            let mut inner = self.inner.lock();
            let now = Instant::now();
            let mut enabled = false;
            let names: Vec<String> = inner.groups.keys().cloned().collect();
            for name in names {
                let mut ctx = RouteCtx {
                    pool: &self.self_weak,
                    actions: &mut actions,
                    now,
                };
                let group = inner.groups.get_mut(&name).expect("name from key set");
                if group.enable_process(gupid, &mut ctx) {
                    enabled = true;
                    break;
                }
            }
            self.verify_invariants(&inner);
            enabled
        };
        run_actions(actions);
        enabled
    }

    /* ----- tuning ----- */

    /// Raise or lower the process budget. Raising drains the global wait
    /// list; lowering never evicts, it just refuses new spawns until the
    /// count falls naturally.
    pub fn set_max(&self, max: usize) {
        let mut actions = PostLockActions::new();
        {
            let mut inner = self.inner.lock();
            let used = inner.capacity_used();
            inner.max = max;
            inner.max_overcommit = if used > max { used } else { 0 };
            self.capacity_event(&mut inner, &mut actions);
            self.verify_invariants(&inner);
        }
        run_actions(actions);
        self.gc_cond.notify_one();
    }

    pub fn set_max_idle_time(&self, value: Duration) {
        {
            let mut inner = self.inner.lock();
            inner.max_idle_time = value;
        }
        self.gc_cond.notify_one();
    }

    pub fn enable_self_checking(&self, enabled: bool) {
        self.inner.lock().self_checking = enabled;
    }

    /* ----- state inspection ----- */

    pub fn capacity_used(&self) -> usize {
        self.inner.lock().capacity_used()
    }

    pub fn at_full_capacity(&self) -> bool {
        self.inner.lock().at_full_capacity()
    }

    /// Number of tracked processes, detached ones included.
    pub fn process_count(&self) -> usize {
        let inner = self.inner.lock();
        inner.groups.values().map(Group::process_count).sum::<usize>()
            + inner
                .doomed_groups
                .iter()
                .map(Group::process_count)
                .sum::<usize>()
    }

    pub fn group_count(&self) -> usize {
        self.inner.lock().groups.len()
    }

    pub fn is_spawning(&self) -> bool {
        self.inner
            .lock()
            .groups
            .values()
            .any(|g| g.spawn_state != SpawnLoopState::NotSpawning)
    }

    pub fn life_status(&self) -> PoolLifeStatus {
        self.inner.lock().life_status
    }

    pub fn status(&self) -> PoolStatus {
        let inner = self.inner.lock();
        let now = Instant::now();
        PoolStatus {
            life_status: inner.life_status,
            max: inner.max,
            capacity_used: inner.capacity_used(),
            process_count: inner
                .groups
                .values()
                .chain(inner.doomed_groups.iter())
                .map(Group::process_count)
                .sum(),
            group_count: inner.groups.len(),
            global_queue_length: inner.get_wait_list.len(),
            system_load: inner.system_load,
            groups: inner.groups.values().map(|g| g.status(now)).collect(),
        }
    }

    /// Human-readable dump of the whole pool.
    pub fn inspect(&self, options: &InspectOptions) -> String {
        let status = self.status();
        let (bold, reset) = if options.colorize {
            (ANSI_BOLD, ANSI_RESET)
        } else {
            ("", "")
        };
        let mut out = String::new();
        let _ = writeln!(out, "{}----------- General information -----------{}", bold, reset);
        let _ = writeln!(out, "Max pool size : {}", status.max);
        let _ = writeln!(out, "App groups    : {}", status.group_count);
        let _ = writeln!(out, "Processes     : {}", status.process_count);
        let _ = writeln!(
            out,
            "Requests in top-level queue : {}",
            status.global_queue_length
        );
        if let Some((one, five, fifteen)) = status.system_load {
            let _ = writeln!(out, "Load average  : {:.2} {:.2} {:.2}", one, five, fifteen);
        }
        let _ = writeln!(out);
        let _ = writeln!(out, "{}----------- Application groups -----------{}", bold, reset);
        for group in &status.groups {
            let _ = writeln!(
                out,
                "{}{}{} (generation {}, {} processes, {} spawning):",
                bold, group.name, reset, group.generation, group.processes.len(),
                group.processes_being_spawned
            );
            let _ = writeln!(out, "  Requests in queue: {}", group.queue_length);
            for p in &group.processes {
                let _ = writeln!(
                    out,
                    "  * PID: {:<7} Sessions: {:<4} Processed: {:<6} Uptime: {}s",
                    p.pid, p.sessions, p.sessions_completed, p.uptime_secs
                );
                if options.verbose {
                    let memory = p
                        .rss_bytes
                        .map(|b| format!("{}M", b / (1024 * 1024)))
                        .unwrap_or_else(|| "?".to_string());
                    let cpu = p
                        .cpu_percent
                        .map(|c| format!("{:.0}%", c))
                        .unwrap_or_else(|| "?".to_string());
                    let _ = writeln!(
                        out,
                        "    gupid: {}  state: {:?}  CPU: {}  Memory: {}",
                        p.gupid, p.state, cpu, memory
                    );
                }
            }
        }
        out
    }

    /// Structured XML dump. Group secrets are included only on request.
    pub fn to_xml(&self, include_secrets: bool) -> String {
        let now = Instant::now();
        let inner = self.inner.lock();
        let mut out = String::new();
        out.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
        let _ = writeln!(out, "<pool version=\"1\">");
        let _ = writeln!(out, "  <max>{}</max>", inner.max);
        let _ = writeln!(out, "  <capacity_used>{}</capacity_used>", inner.capacity_used());
        let _ = writeln!(
            out,
            "  <get_wait_list_size>{}</get_wait_list_size>",
            inner.get_wait_list.len()
        );
        let _ = writeln!(out, "  <groups>");
        for group in inner.groups.values() {
            let _ = writeln!(out, "    <group>");
            let _ = writeln!(out, "      <name>{}</name>", xml_escape(&group.name));
            let _ = writeln!(
                out,
                "      <app_root>{}</app_root>",
                xml_escape(&group.options.app_root().display().to_string())
            );
            if include_secrets {
                let _ = writeln!(out, "      <secret>{}</secret>", xml_escape(&group.secret));
            }
            let _ = writeln!(out, "      <generation>{}</generation>", group.generation);
            let _ = writeln!(
                out,
                "      <get_wait_list_size>{}</get_wait_list_size>",
                group.get_wait_list.len()
            );
            let _ = writeln!(out, "      <processes>");
            for p in group
                .enabled
                .iter()
                .chain(group.disabling.iter())
                .chain(group.detached.iter())
            {
                let status = p.status(now);
                let _ = writeln!(out, "        <process>");
                let _ = writeln!(out, "          <gupid>{}</gupid>", xml_escape(&status.gupid));
                let _ = writeln!(out, "          <pid>{}</pid>", status.pid);
                let _ = writeln!(
                    out,
                    "          <state>{}</state>",
                    format!("{:?}", status.state).to_lowercase()
                );
                let _ = writeln!(out, "          <sessions>{}</sessions>", status.sessions);
                let _ = writeln!(out, "          <processed>{}</processed>", status.sessions_completed);
                let _ = writeln!(out, "          <uptime>{}</uptime>", status.uptime_secs);
                let _ = writeln!(out, "        </process>");
            }
            let _ = writeln!(out, "      </processes>");
            let _ = writeln!(out, "    </group>");
        }
        let _ = writeln!(out, "  </groups>");
        let _ = writeln!(out, "</pool>");
        out
    }

    /* ----- garbage collection ----- */

    fn garbage_collector_main(self: &Arc<Self>) {
        let mut inner = self.inner.lock();
        loop {
            if inner.life_status >= PoolLifeStatus::ShuttingDown {
                return;
            }
            let mut actions = PostLockActions::new();
            let next_wake = self.garbage_collect(&mut inner, &mut actions);
            self.verify_invariants(&inner);
            if !actions.is_empty() {
                drop(inner);
                run_actions(actions);
                inner = self.inner.lock();
                continue;
            }
            self.gc_cond.wait_until(&mut inner, next_wake);
        }
    }

    /// One collector pass. Returns the next wakeup: the earliest pending
    /// deadline (idle expiry or queue timeout), bounded by the ceiling.
    fn garbage_collect(&self, inner: &mut PoolInner, actions: &mut PostLockActions) -> Instant {
        let now = Instant::now();
        let max_idle = inner.max_idle_time;
        let mut next_wake = now + self.gc_interval_ceiling;

        // Global wait-list queue timeouts.
        let mut idx = 0;
        while idx < inner.get_wait_list.len() {
            let deadline = inner.get_wait_list[idx].deadline;
            match deadline {
                Some(deadline) if deadline <= now => {
                    let waiter = inner.get_wait_list.remove(idx).expect("index in bounds");
                    let waited = now.saturating_duration_since(waiter.enqueued_at);
                    let callback = waiter.callback;
                    actions.push(Box::new(move || {
                        callback(Err(GetError::RequestQueueTimeout { waited }))
                    }));
                }
                Some(deadline) => {
                    next_wake = next_wake.min(deadline);
                    idx += 1;
                }
                None => idx += 1,
            }
        }

        let names: Vec<String> = inner.groups.keys().cloned().collect();
        let mut detached_any = false;
        for name in names {
            let group = inner.groups.get_mut(&name).expect("name from key set");
            group.sweep_expired_waiters(now, actions);
            if let Some(deadline) = group.next_waiter_deadline() {
                next_wake = next_wake.min(deadline);
            }

            // Idle processes above the group minimum are expired.
            loop {
                if group.enabled.len() <= group.options.min_processes {
                    break;
                }
                let Some(idx) = group
                    .enabled
                    .iter()
                    .position(|p| p.idle_duration(now) > max_idle)
                else {
                    break;
                };
                let gupid = group.enabled[idx].gupid.clone();
                let pid = group.enabled[idx].pid;
                info!(group = %name, gupid = %gupid, pid, "Garbage collecting idle process");
                let mut ctx = RouteCtx {
                    pool: &self.self_weak,
                    actions,
                    now,
                };
                group.detach_process(&gupid, &mut ctx);
                detached_any = true;
                self.push_hook(
                    actions,
                    "detached_process",
                    vec![
                        ("group", name.clone()),
                        ("gupid", gupid),
                        ("pid", pid.to_string()),
                    ],
                );
            }

            // Earliest upcoming idle expiry among the survivors.
            let group = inner.groups.get(&name).expect("still present");
            if group.enabled.len() > group.options.min_processes {
                for p in group.enabled.iter().filter(|p| p.sessions == 0) {
                    next_wake = next_wake.min(p.last_used + max_idle);
                }
            }

            // Preloaders idle past their own (longer) threshold.
            if now.saturating_duration_since(group.last_spawn_activity) > self.preloader_idle_time
            {
                let app_root = group.options.app_root().to_path_buf();
                let spawner = Arc::clone(&self.spawner);
                actions.push(Box::new(move || spawner.cleanup_preloader(&app_root)));
                // Re-arm from now rather than firing every pass.
                inner
                    .groups
                    .get_mut(&name)
                    .expect("still present")
                    .last_spawn_activity = now;
            }

            let group = inner.groups.get(&name).expect("still present");
            if group.is_garbage(now, max_idle) {
                debug!(group = %name, "Garbage collecting empty idle group");
                inner.groups.remove(&name);
            }
        }

        if detached_any {
            self.capacity_event(inner, actions);
            self.task_cond.notify_all();
        }
        next_wake
    }

    /* ----- detached process reaping ----- */

    fn detached_processes_checker_main(self: &Arc<Self>) {
        let mut inner = self.inner.lock();
        loop {
            if inner.life_status >= PoolLifeStatus::ShuttingDown {
                return;
            }
            let mut actions = PostLockActions::new();
            self.reap_detached(&mut inner, false, &mut actions);
            self.verify_invariants(&inner);
            if !actions.is_empty() {
                drop(inner);
                run_actions(actions);
                inner = self.inner.lock();
                continue;
            }
            self.task_cond
                .wait_for(&mut inner, self.detached_check_interval);
        }
    }

    /// Terminate and reap detached processes that have drained. SIGTERM
    /// first; SIGKILL once the grace period passes. `force` skips straight
    /// to SIGKILL regardless of live sessions.
    fn reap_detached(&self, inner: &mut PoolInner, force: bool, actions: &mut PostLockActions) {
        let now = Instant::now();
        let grace = self.shutdown_grace_period;
        let PoolInner {
            groups,
            doomed_groups,
            ..
        } = inner;

        let mut reap_group = |group: &mut Group| {
            let mut idx = 0;
            while idx < group.detached.len() {
                let process = &mut group.detached[idx];
                if process.sessions > 0 && !force && process.is_alive() {
                    idx += 1;
                    continue;
                }
                if force {
                    process.send_kill();
                } else {
                    process.send_term(now);
                    if process
                        .term_sent_at
                        .is_some_and(|sent| now.saturating_duration_since(sent) > grace)
                    {
                        process.send_kill();
                    }
                }
                if process.try_reap() {
                    let process = group.detached.remove(idx);
                    debug!(
                        group = %group.name,
                        pid = process.pid,
                        gupid = %process.gupid,
                        "Reaped detached worker"
                    );
                } else {
                    idx += 1;
                }
            }
        };

        for group in groups.values_mut() {
            reap_group(group);
        }
        for group in doomed_groups.iter_mut() {
            reap_group(group);
        }
        // A doomed group with nothing left to drain is finished.
        doomed_groups.retain_mut(|group| {
            if group.has_no_processes() {
                actions.append(&mut group.shutdown_callbacks);
                false
            } else {
                true
            }
        });
    }

    /* ----- analytics ----- */

    fn analytics_main(self: &Arc<Self>) {
        let interval = self.analytics_interval.expect("thread started only with interval");
        loop {
            // Interruptible sleep, then snapshot pids under the lock and read
            // /proc outside it.
            let targets: Vec<(String, String, u32)> = {
                let mut inner = self.inner.lock();
                if inner.life_status >= PoolLifeStatus::ShuttingDown {
                    return;
                }
                self.task_cond.wait_for(&mut inner, interval);
                if inner.life_status >= PoolLifeStatus::ShuttingDown {
                    return;
                }
                inner
                    .groups
                    .iter()
                    .flat_map(|(name, g)| {
                        g.enabled.iter().chain(g.disabling.iter()).map(move |p| {
                            (name.clone(), p.gupid.clone(), p.pid)
                        })
                    })
                    .collect()
            };

            let now = Instant::now();
            let samples: Vec<_> = targets
                .iter()
                .map(|(group, gupid, pid)| {
                    (group.clone(), gupid.clone(), *pid, metrics::sample_process(*pid))
                })
                .collect();
            let load = metrics::load_average();

            let mut actions = PostLockActions::new();
            {
                let mut inner = self.inner.lock();
                if inner.life_status >= PoolLifeStatus::ShuttingDown {
                    return;
                }
                inner.system_load = load;
                let mut dead: Vec<(String, String)> = Vec::new();
                for (group_name, gupid, _pid, sample) in samples {
                    let Some(group) = inner.groups.get_mut(&group_name) else {
                        continue;
                    };
                    let Some(process) = group
                        .enabled
                        .iter_mut()
                        .chain(group.disabling.iter_mut())
                        .find(|p| p.gupid == gupid)
                    else {
                        continue;
                    };
                    match sample {
                        Some(sample) => {
                            process.metrics =
                                Some(ProcessMetrics::update(process.metrics.as_ref(), sample, now));
                        }
                        None => {
                            if !process.is_alive() {
                                dead.push((group_name.clone(), gupid));
                            }
                        }
                    }
                }
                for (group_name, gupid) in dead {
                    warn!(group = %group_name, gupid = %gupid, "Worker died unexpectedly; detaching");
                    self.detach_process_in_group(&mut inner, &group_name, &gupid, &mut actions);
                }
                self.capacity_event(&mut inner, &mut actions);
                self.verify_invariants(&inner);
            }
            run_actions(actions);
        }
    }

    /* ----- shutdown ----- */

    /// Stop accepting requests, fail every queued waiter, and detach every
    /// group. Processes drain and terminate in the background.
    pub fn prepare_for_shutdown(&self) {
        let mut actions = PostLockActions::new();
        {
            let mut inner = self.inner.lock();
            if inner.life_status != PoolLifeStatus::Alive {
                return;
            }
            info!("Pool preparing for shutdown");
            inner.life_status = PoolLifeStatus::PreparedForShutdown;

            for waiter in inner.get_wait_list.drain(..) {
                let callback = waiter.callback;
                actions.push(Box::new(move || callback(Err(GetError::PoolShuttingDown))));
            }

            let now = Instant::now();
            let names: Vec<String> = inner.groups.keys().cloned().collect();
            for name in names {
                let mut group = inner.groups.remove(&name).expect("name from key set");
                group.flush_wait_list(&mut actions, |_| GetError::PoolShuttingDown);
                let mut ctx = RouteCtx {
                    pool: &self.self_weak,
                    actions: &mut actions,
                    now,
                };
                group.initiate_shutdown(&mut ctx);
                if !group.has_no_processes() {
                    inner.doomed_groups.push(group);
                }
            }
        }
        run_actions(actions);
        self.gc_cond.notify_all();
        self.task_cond.notify_all();
    }

    /// Full teardown: prepare, join the interruptable threads (spawn loops,
    /// GC, reaper, analytics), force-kill whatever is still running, then
    /// join the non-interruptable cleanup threads.
    pub fn destroy(&self) {
        self.prepare_for_shutdown();
        {
            let mut inner = self.inner.lock();
            inner.life_status = PoolLifeStatus::ShuttingDown;
        }
        self.gc_cond.notify_all();
        self.task_cond.notify_all();

        let handles: Vec<JoinHandle<()>> =
            std::mem::take(&mut *self.interruptable_threads.lock());
        for handle in handles {
            let _ = handle.join();
        }

        let mut actions = PostLockActions::new();
        {
            let mut inner = self.inner.lock();
            self.reap_detached(&mut inner, true, &mut actions);
            // Anything that survived SIGKILL delivery gets removed from the
            // books; the kernel owns it now.
            for group in inner.doomed_groups.iter_mut() {
                for mut process in group.detached.drain(..) {
                    if let Some(mut child) = process.child.take() {
                        let _ = child.kill();
                        let _ = child.wait();
                    }
                }
                actions.append(&mut group.shutdown_callbacks);
            }
            inner.doomed_groups.clear();
            inner.life_status = PoolLifeStatus::ShutDown;
        }
        run_actions(actions);

        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.cleanup_threads.lock());
        for handle in handles {
            let _ = handle.join();
        }
        info!("Pool shut down");
    }

    /* ----- invariants ----- */

    /// Re-check the structural invariants; enabled via config or
    /// [`Pool::enable_self_checking`]. A violation is a programming error
    /// that would otherwise corrupt state silently, so the whole process
    /// aborts.
    fn verify_invariants(&self, inner: &PoolInner) {
        if !inner.self_checking {
            return;
        }
        let used = inner.capacity_used();
        if used > inner.allowed_max() {
            abort_invariant(format!(
                "capacity_used {} exceeds max {}",
                used,
                inner.allowed_max()
            ));
        }
        if !inner.get_wait_list.is_empty() && !inner.at_full_capacity() {
            abort_invariant("global wait list non-empty below capacity".to_string());
        }
        for waiter in &inner.get_wait_list {
            let name = waiter.options.group_name();
            if inner.groups.contains_key(&name) {
                abort_invariant(format!("global waiter for existing group {}", name));
            }
        }
        for group in inner.groups.values().chain(inner.doomed_groups.iter()) {
            for p in group
                .enabled
                .iter()
                .chain(group.disabling.iter())
                .chain(group.detached.iter())
            {
                if p.sessions_started < p.sessions_completed
                    || p.sessions_started - p.sessions_completed != p.sessions as u64
                {
                    abort_invariant(format!("session accounting broken for {}", p.gupid));
                }
            }
            // enabled must stay sorted least-loaded-first
            for pair in group.enabled.windows(2) {
                if pair[0].busyness() > pair[1].busyness() {
                    abort_invariant(format!("enabled list out of order in {}", group.name));
                }
            }
        }
    }

    /* ----- plumbing ----- */

    fn push_hook(
        &self,
        actions: &mut PostLockActions,
        name: &'static str,
        fields: Vec<(&'static str, String)>,
    ) {
        if !self.hooks.is_configured(name) {
            return;
        }
        let hooks = self.hooks.clone();
        actions.push(Box::new(move || {
            if let Err(err) = hooks.run(name, &fields) {
                error!(hook = name, error = %err, "Hook script error");
            }
        }));
    }

    fn spawn_interruptable(&self, name: &str, f: impl FnOnce() + Send + 'static) {
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(f)
            .expect("failed to spawn pool thread");
        let mut threads = self.interruptable_threads.lock();
        threads.retain(|h| !h.is_finished());
        threads.push(handle);
    }

    fn spawn_cleanup(&self, name: &str, f: impl FnOnce() + Send + 'static) {
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(f)
            .expect("failed to spawn cleanup thread");
        let mut threads = self.cleanup_threads.lock();
        threads.retain(|h| !h.is_finished());
        threads.push(handle);
    }
}

fn all_processes(inner: &PoolInner) -> impl Iterator<Item = &Process> {
    inner
        .groups
        .values()
        .chain(inner.doomed_groups.iter())
        .flat_map(|g| {
            g.enabled
                .iter()
                .chain(g.disabling.iter())
                .chain(g.detached.iter())
        })
}

fn run_actions(actions: PostLockActions) {
    for action in actions {
        action();
    }
}

/// Self-check failure. The self-check runs on background threads as well as
/// callers' threads, and unwinding would only kill the offending thread while
/// the rest keep mutating the corrupt state; the whole process goes down.
fn abort_invariant(message: String) -> ! {
    error!(%message, "Internal invariant violation; aborting");
    std::process::abort();
}

/// Kill a worker that was spawned but can no longer be attached (its group
/// vanished or a restart superseded it).
fn discard_worker(mut worker: SpawnedWorker) {
    debug!(pid = worker.pid, "Discarding worker spawned for a vanished group");
    match worker.child.take() {
        Some(mut child) => {
            let _ = child.kill();
            let _ = child.wait();
        }
        None => unsafe {
            libc::kill(worker.pid as libc::pid_t, libc::SIGKILL);
        },
    }
}

fn xml_escape(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_xml_escape() {
        assert_eq!(xml_escape("a<b>&\"c'"), "a&lt;b&gt;&amp;&quot;c&apos;");
        assert_eq!(xml_escape("/srv/app#production"), "/srv/app#production");
    }

    #[test]
    fn test_ticket_abort_before_result() {
        let ticket = Ticket::new();
        ticket.abort();
        assert_eq!(ticket.wait().unwrap_err(), GetError::GetAborted);
    }

    #[test]
    fn test_ticket_delivery() {
        let ticket = Ticket::new();
        let callback = ticket.callback();
        callback(Err(GetError::GroupDetached));
        assert_eq!(ticket.wait().unwrap_err(), GetError::GroupDetached);
    }

    #[test]
    fn test_ticket_callback_after_abort_is_swallowed() {
        let ticket = Ticket::new();
        let callback = ticket.callback();
        ticket.abort();
        callback(Err(GetError::GroupDetached));
        // The abort outcome wins; the late result is released quietly.
        assert_eq!(ticket.wait().unwrap_err(), GetError::GetAborted);
    }
}
