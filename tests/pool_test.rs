//! End-to-end tests for the pool, driving real worker processes.
//!
//! Workers are plain `sleep` children spawned through `CommandSpawner`, so
//! liveness polling, SIGTERM/SIGKILL termination, and reaping all exercise
//! the real OS paths. Timers are tuned down so the background tasks run at
//! test speed.

use corral::error::{DisableResult, GetError, SpawnError};
use corral::options::Options;
use corral::pool::{Pool, Ticket};
use corral::spawn::{CommandSpawner, SpawnedWorker, Spawner};
use corral::{PoolConfig, RestartMethod};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

const WAIT: Duration = Duration::from_secs(5);

fn test_config(max: usize) -> PoolConfig {
    PoolConfig {
        max,
        max_idle_time_secs: 300,
        gc_interval_ceiling_secs: 1,
        detached_check_interval_ms: 50,
        shutdown_grace_period_secs: 1,
        analytics_interval_ms: 200,
        self_checking: true,
        ..PoolConfig::default()
    }
}

fn sleep_options(app_root: &str) -> Options {
    let mut options = Options::new(app_root).with_start_command(["sleep", "600"]);
    options.restart_marker = None;
    options
}

fn new_pool(max: usize) -> Arc<Pool> {
    Pool::new(test_config(max), Arc::new(CommandSpawner::new()))
}

/// Poll `condition` until it holds or the timeout expires.
fn wait_until(condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    false
}

struct FailingSpawner;

impl Spawner for FailingSpawner {
    fn spawn(&self, _options: &Options, _generation: u64) -> Result<SpawnedWorker, SpawnError> {
        Err(SpawnError::Failed("exit status 1".to_string()))
    }
}

/// Blocks the first spawn until the test releases it; later spawns pass
/// straight through to the real spawner.
struct GatedSpawner {
    gate: std::sync::Mutex<Option<mpsc::Receiver<()>>>,
    inner: CommandSpawner,
}

impl Spawner for GatedSpawner {
    fn spawn(&self, options: &Options, generation: u64) -> Result<SpawnedWorker, SpawnError> {
        let gate = self.gate.lock().unwrap().take();
        if let Some(gate) = gate {
            let _ = gate.recv_timeout(WAIT);
        }
        self.inner.spawn(options, generation)
    }
}

/// Fails the first `failures` spawns, then delegates to the real spawner.
struct FlakySpawner {
    failures: AtomicUsize,
    inner: CommandSpawner,
}

impl Spawner for FlakySpawner {
    fn spawn(&self, options: &Options, generation: u64) -> Result<SpawnedWorker, SpawnError> {
        if self.failures.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(SpawnError::Failed("transient".to_string()));
        }
        self.inner.spawn(options, generation)
    }
}

#[test]
fn test_cold_start() {
    let pool = new_pool(2);
    let options = sleep_options("/srv/app-cold");

    let session = pool.get(&options).unwrap();
    assert_eq!(session.group_name(), options.group_name());
    assert_eq!(pool.process_count(), 1);
    assert_eq!(pool.group_count(), 1);

    // The session's pid is the spawned worker, and it is really running.
    let status = pool.find_process_by_pid(session.pid()).unwrap();
    assert_eq!(status.gupid, session.gupid());
    assert_eq!(status.sessions, 1);
    assert_eq!(unsafe { libc::kill(session.pid() as i32, 0) }, 0);

    drop(session);
    pool.destroy();
}

#[test]
fn test_saturation_and_release() {
    let pool = new_pool(1);
    let opts_a = sleep_options("/srv/app-sat-a");
    let opts_b = sleep_options("/srv/app-sat-b");

    // Group A's single worker is serving a long request.
    let session_a = pool.get(&opts_a).unwrap();
    assert!(pool.at_full_capacity());

    // A request for a different group cannot be satisfied and must wait at
    // the pool level.
    let (tx, rx) = mpsc::channel();
    pool.async_get(
        &opts_b,
        Box::new(move |result| {
            let _ = tx.send(result);
        }),
    );
    assert!(rx.try_recv().is_err());

    // Releasing A's session frees its worker for trashing; B gets a fresh
    // worker in its own group.
    drop(session_a);
    let session_b = rx.recv_timeout(WAIT).unwrap().unwrap();
    assert_eq!(session_b.group_name(), opts_b.group_name());

    // A's worker terminates; only B's worker remains.
    assert!(wait_until(|| pool.process_count() == 1));
    drop(session_b);
    pool.destroy();
}

#[test]
fn test_spawn_failure_flushes_and_removes_group() {
    let pool = Pool::new(test_config(2), Arc::new(FailingSpawner));
    let opts_a = sleep_options("/srv/app-fail-a");

    match pool.get(&opts_a) {
        Err(GetError::SpawnFailed(SpawnError::Failed(msg))) => {
            assert_eq!(msg, "exit status 1");
        }
        other => panic!("expected spawn failure, got {:?}", other),
    }
    // The failed group is gone; the pool stays usable.
    assert!(wait_until(|| pool.group_count() == 0));
    assert_eq!(pool.process_count(), 0);
    pool.destroy();
}

#[test]
fn test_pool_survives_spawn_failure_then_recovers() {
    let pool = Pool::new(
        test_config(2),
        Arc::new(FlakySpawner {
            failures: AtomicUsize::new(1),
            inner: CommandSpawner::new(),
        }),
    );
    let opts = sleep_options("/srv/app-flaky");

    assert!(matches!(pool.get(&opts), Err(GetError::SpawnFailed(_))));
    // A subsequent get re-creates the group and succeeds.
    let session = pool.get(&opts).unwrap();
    assert_eq!(pool.process_count(), 1);
    drop(session);
    pool.destroy();
}

#[test]
fn test_graceful_restart_replaces_generation() {
    let pool = new_pool(6);
    let options = sleep_options("/srv/app-restart").with_min_processes(3);

    let session = pool.get(&options).unwrap();
    assert!(wait_until(|| pool.process_count() == 3));
    let old_pids: Vec<u32> = pool.processes().iter().map(|p| p.pid).collect();
    assert!(pool.processes().iter().all(|p| p.generation == 1));

    assert!(pool.restart_group_by_name(&options.group_name(), RestartMethod::Rolling));

    // Three fresh workers, one generation up; the old cohort drains away.
    assert!(wait_until(|| {
        let procs = pool.processes();
        procs.iter().filter(|p| p.generation == 2).count() == 3
            && procs.iter().all(|p| p.generation == 2 || p.sessions > 0)
    }));

    // The in-flight session kept its (old-generation) worker alive.
    let held = pool.find_process_by_pid(session.pid()).unwrap();
    assert_eq!(held.sessions, 1);
    assert!(old_pids.contains(&session.pid()));
    assert_eq!(unsafe { libc::kill(session.pid() as i32, 0) }, 0);

    // Once released, the old worker terminates too.
    drop(session);
    assert!(wait_until(|| pool.process_count() == 3));
    assert!(pool.processes().iter().all(|p| p.generation == 2));
    pool.destroy();
}

#[test]
fn test_disable_waits_for_drain_and_routes_away() {
    let pool = new_pool(6);
    let options = sleep_options("/srv/app-disable").with_concurrency(2);

    let s1 = pool.get(&options).unwrap();
    let s2 = pool.get(&options).unwrap();
    assert_eq!(s1.gupid(), s2.gupid());
    let gupid = s1.gupid().to_string();

    let (tx, rx) = mpsc::channel();
    pool.disable_process_async(
        &gupid,
        Box::new(move |result| {
            let _ = tx.send(result);
        }),
    );
    assert!(rx.try_recv().is_err());

    // While draining, new gets go to a different worker.
    let s3 = pool.get(&options).unwrap();
    assert_ne!(s3.gupid(), gupid);

    drop(s1);
    assert!(rx.try_recv().is_err());
    drop(s2);
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), DisableResult::Success);
    assert_eq!(
        pool.find_process_by_gupid(&gupid).unwrap().state,
        corral::ProcessState::Disabling
    );

    // A disabled worker can be brought back into service.
    assert!(pool.enable_process(&gupid));
    assert_eq!(
        pool.find_process_by_gupid(&gupid).unwrap().state,
        corral::ProcessState::Enabled
    );

    drop(s3);
    pool.destroy();
}

#[test]
fn test_disable_unknown_process_errors() {
    let pool = new_pool(2);
    assert_eq!(pool.disable_process("no-such-gupid"), DisableResult::Error);
    pool.destroy();
}

#[test]
fn test_request_queue_timeout() {
    let pool = new_pool(1);
    let mut options = sleep_options("/srv/app-timeout");
    options.max_request_queue_time = Some(Duration::from_millis(100));

    // The single worker is stuck serving a session.
    let session = pool.get(&options).unwrap();

    let started = Instant::now();
    let (tx, rx) = mpsc::channel();
    pool.async_get(
        &options,
        Box::new(move |result| {
            let _ = tx.send(result);
        }),
    );

    match rx.recv_timeout(WAIT).unwrap() {
        Err(GetError::RequestQueueTimeout { waited }) => {
            assert!(waited >= Duration::from_millis(100));
            assert!(started.elapsed() >= Duration::from_millis(100));
        }
        other => panic!("expected queue timeout, got {:?}", other),
    }

    drop(session);
    pool.destroy();
}

#[test]
fn test_request_queue_full() {
    let pool = new_pool(1);
    let mut options = sleep_options("/srv/app-queue-full");
    options.max_request_queue_size = 1;

    let session = pool.get(&options).unwrap();

    let quiet = Box::new(|_result: Result<corral::Session, GetError>| {});
    pool.async_get(&options, quiet);

    let (tx, rx) = mpsc::channel();
    pool.async_get(
        &options,
        Box::new(move |result| {
            let _ = tx.send(result);
        }),
    );
    match rx.recv_timeout(WAIT).unwrap() {
        Err(GetError::RequestQueueFull { limit }) => assert_eq!(limit, 1),
        other => panic!("expected queue full, got {:?}", other),
    }

    drop(session);
    pool.destroy();
}

#[test]
fn test_fifo_within_group() {
    let pool = new_pool(1);
    let mut options = sleep_options("/srv/app-fifo");
    options.max_processes = 1;

    let session = pool.get(&options).unwrap();

    // Three queued requests; each closes its session on arrival, letting
    // the single slot pass down the line.
    let order: Arc<std::sync::Mutex<Vec<u32>>> = Arc::new(std::sync::Mutex::new(Vec::new()));
    let (tx, rx) = mpsc::channel();
    for id in 1..=3u32 {
        let order = Arc::clone(&order);
        let tx = tx.clone();
        pool.async_get(
            &options,
            Box::new(move |result| {
                let session = result.unwrap();
                order.lock().unwrap().push(id);
                drop(session);
                let _ = tx.send(id);
            }),
        );
    }

    drop(session);
    for _ in 0..3 {
        rx.recv_timeout(WAIT).unwrap();
    }
    assert_eq!(order.lock().unwrap().as_slice(), &[1, 2, 3]);
    pool.destroy();
}

#[test]
fn test_detach_process_is_idempotent() {
    let pool = new_pool(2);
    let options = sleep_options("/srv/app-detach");

    let session = pool.get(&options).unwrap();
    let gupid = session.gupid().to_string();
    drop(session);

    assert!(pool.detach_process_by_gupid(&gupid));
    let count_after_first = pool.process_count();
    assert!(!pool.detach_process_by_gupid(&gupid));
    assert_eq!(pool.process_count(), count_after_first);

    // The worker is torn down exactly once.
    assert!(wait_until(|| pool.process_count() == 0));
    pool.destroy();
}

#[test]
fn test_detach_group_terminates_workers() {
    let pool = new_pool(4);
    let options = sleep_options("/srv/app-detach-group").with_min_processes(2);

    let session = pool.get(&options).unwrap();
    assert!(wait_until(|| pool.process_count() == 2));
    let pid = session.pid();
    drop(session);

    assert!(pool.detach_group_by_name(&options.group_name()));
    assert_eq!(pool.group_count(), 0);
    assert_eq!(pool.process_count(), 0);
    assert!(wait_until(|| unsafe { libc::kill(pid as i32, 0) } != 0));

    assert!(!pool.detach_group_by_name(&options.group_name()));
    pool.destroy();
}

#[test]
fn test_idle_garbage_collection() {
    let mut config = test_config(4);
    config.max_idle_time_secs = 1;
    let pool = Pool::new(config, Arc::new(CommandSpawner::new()));

    let mut options = sleep_options("/srv/app-gc");
    options.min_processes = 0;

    let session = pool.get(&options).unwrap();
    assert_eq!(pool.process_count(), 1);
    drop(session);

    // Idle past max_idle_time: the worker is detached and reaped, and the
    // empty idle group goes with it.
    assert!(wait_until(|| pool.process_count() == 0));
    assert!(wait_until(|| pool.group_count() == 0));
    pool.destroy();
}

#[test]
fn test_attach_into_waiterless_group_drains_global_wait_list() {
    let (release_tx, release_rx) = mpsc::channel();
    let pool = Pool::new(
        test_config(1),
        Arc::new(GatedSpawner {
            gate: std::sync::Mutex::new(Some(release_rx)),
            inner: CommandSpawner::new(),
        }),
    );
    let mut opts_a = sleep_options("/srv/app-waiterless-a");
    opts_a.min_processes = 0;
    opts_a.max_request_queue_time = Some(Duration::from_millis(100));
    let opts_b = sleep_options("/srv/app-waiterless-b");

    // A's first worker hangs inside the spawning kit; its request will time
    // out in the queue, leaving the group waiter-less when the worker
    // finally attaches.
    let (tx_a, rx_a) = mpsc::channel();
    pool.async_get(
        &opts_a,
        Box::new(move |result| {
            let _ = tx_a.send(result.map(|_| ()));
        }),
    );
    assert!(wait_until(|| pool.capacity_used() == 1));

    // B cannot be placed: the only occupied slot is the in-flight spawn,
    // which is not trashable, so the request waits at the pool level.
    let (tx_b, rx_b) = mpsc::channel();
    pool.async_get(
        &opts_b,
        Box::new(move |result| {
            let _ = tx_b.send(result);
        }),
    );
    assert!(pool.at_full_capacity());
    assert!(rx_b.try_recv().is_err());

    match rx_a.recv_timeout(WAIT).unwrap() {
        Err(GetError::RequestQueueTimeout { .. }) => {}
        other => panic!("expected queue timeout, got {:?}", other),
    }

    // The worker attaches into a group with nobody waiting. That very
    // transition makes it trash-eligible, and B's waiter must be drained on
    // it rather than waiting for some unrelated capacity event.
    release_tx.send(()).unwrap();
    let session_b = rx_b.recv_timeout(WAIT).unwrap().unwrap();
    assert_eq!(session_b.group_name(), opts_b.group_name());

    drop(session_b);
    pool.destroy();
}

#[test]
fn test_set_max_raise_drains_global_wait_list() {
    let pool = new_pool(1);
    let opts_a = sleep_options("/srv/app-raise-a");
    let opts_b = sleep_options("/srv/app-raise-b");

    let session_a = pool.get(&opts_a).unwrap();
    let (tx, rx) = mpsc::channel();
    pool.async_get(
        &opts_b,
        Box::new(move |result| {
            let _ = tx.send(result);
        }),
    );
    assert!(rx.try_recv().is_err());

    pool.set_max(2);
    let session_b = rx.recv_timeout(WAIT).unwrap().unwrap();
    assert_eq!(pool.process_count(), 2);

    drop(session_a);
    drop(session_b);
    pool.destroy();
}

#[test]
fn test_lowering_max_never_evicts() {
    let pool = new_pool(2);
    let options = sleep_options("/srv/app-lower").with_min_processes(2);

    let session = pool.get(&options).unwrap();
    assert!(wait_until(|| pool.process_count() == 2));

    pool.set_max(1);
    assert_eq!(pool.process_count(), 2);
    assert_eq!(pool.capacity_used(), 2);
    assert!(pool.at_full_capacity());

    drop(session);
    pool.destroy();
}

#[test]
fn test_abort_releases_late_session() {
    let pool = new_pool(1);
    let options = sleep_options("/srv/app-abort");

    let ticket = Ticket::new();
    pool.get_with_ticket(&options, &ticket);
    ticket.abort();
    // Whatever the race outcome, the caller sees an abort or the session;
    // an aborted ticket reports GetAborted.
    match ticket.wait() {
        Err(GetError::GetAborted) => {
            // The spawned worker's session was released on delivery.
            assert!(wait_until(|| {
                pool.processes().iter().all(|p| p.sessions == 0)
            }));
        }
        Ok(session) => drop(session),
        Err(other) => panic!("unexpected error: {}", other),
    }
    pool.destroy();
}

#[test]
fn test_shutdown_flushes_all_waiters() {
    let pool = new_pool(1);
    let opts_a = sleep_options("/srv/app-shutdown-a");
    let opts_b = sleep_options("/srv/app-shutdown-b");

    let session = pool.get(&opts_a).unwrap();

    // One waiter on the group list, one on the global list.
    let (tx, rx) = mpsc::channel();
    for opts in [&opts_a, &opts_b] {
        let tx = tx.clone();
        pool.async_get(
            opts,
            Box::new(move |result| {
                let _ = tx.send(result.map(|_| ()));
            }),
        );
    }

    pool.destroy();

    let mut outcomes = Vec::new();
    for _ in 0..2 {
        outcomes.push(rx.recv_timeout(WAIT).unwrap());
    }
    for outcome in outcomes {
        assert_eq!(outcome.unwrap_err(), GetError::PoolShuttingDown);
    }

    // New requests are refused outright.
    assert_eq!(pool.get(&opts_a).unwrap_err(), GetError::PoolShuttingDown);

    // Workers are gone despite the still-open session handle.
    let pid = session.pid();
    assert!(wait_until(|| unsafe { libc::kill(pid as i32, 0) } != 0));
    drop(session);
}

#[test]
fn test_callback_fires_exactly_once() {
    let pool = new_pool(2);
    let options = sleep_options("/srv/app-once");

    let calls = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = mpsc::channel();
    for _ in 0..4 {
        let calls = Arc::clone(&calls);
        let tx = tx.clone();
        pool.async_get(
            &options,
            Box::new(move |result| {
                calls.fetch_add(1, Ordering::SeqCst);
                drop(result);
                let _ = tx.send(());
            }),
        );
    }
    for _ in 0..4 {
        rx.recv_timeout(WAIT).unwrap();
    }
    // Give any erroneous double-invocation a moment to show up.
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(calls.load(Ordering::SeqCst), 4);
    pool.destroy();
}

#[test]
fn test_inspect_and_xml_dump() {
    let pool = new_pool(2);
    let options = sleep_options("/srv/app-inspect");

    let session = pool.get(&options).unwrap();

    let text = pool.inspect(&corral::InspectOptions::default());
    assert!(text.contains("Max pool size : 2"));
    assert!(text.contains(&options.group_name()));
    assert!(text.contains(&format!("PID: {}", session.pid())));

    let xml = pool.to_xml(true);
    assert!(xml.contains("<secret>"));
    assert!(xml.contains(&format!("<pid>{}</pid>", session.pid())));
    let xml_no_secrets = pool.to_xml(false);
    assert!(!xml_no_secrets.contains("<secret>"));

    drop(session);
    pool.destroy();
}

#[test]
fn test_restart_marker_triggers_rolling_restart() {
    let root = std::env::temp_dir().join(format!("corral-marker-{}", std::process::id()));
    std::fs::create_dir_all(root.join("tmp")).unwrap();
    let marker = root.join("tmp").join("restart.txt");
    let _ = std::fs::remove_file(&marker);

    let pool = new_pool(4);
    // Keep the default marker path for this group.
    let options = Options::new(&root).with_start_command(["sleep", "600"]);

    let session = pool.get(&options).unwrap();
    assert_eq!(
        pool.find_process_by_pid(session.pid()).unwrap().generation,
        1
    );
    drop(session);

    // Touch the marker, then wait out the poll throttle before the next get.
    std::fs::write(&marker, b"").unwrap();
    std::thread::sleep(Duration::from_millis(2100));

    let session = pool.get(&options).unwrap();
    drop(session);
    assert!(wait_until(|| {
        pool.processes().iter().any(|p| p.generation == 2)
    }));

    pool.destroy();
    let _ = std::fs::remove_dir_all(&root);
}
