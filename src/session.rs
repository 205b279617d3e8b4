//! A session: one request's hold on a worker process.
//!
//! Sessions are handed out by the pool and decrement their worker's load on
//! close. The back-reference to the pool is weak and every close is routed
//! through the pool's map, so a session outliving its process (or the whole
//! pool) degrades to a no-op instead of resurrecting a dying parent.

use crate::pool::Pool;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Weak;

pub struct Session {
    pool: Weak<Pool>,
    group_name: String,
    gupid: String,
    pid: u32,
    sticky_session_id: u32,
    closed: AtomicBool,
}

impl Session {
    pub(crate) fn new(
        pool: Weak<Pool>,
        group_name: String,
        gupid: String,
        pid: u32,
        sticky_session_id: u32,
    ) -> Self {
        Self {
            pool,
            group_name,
            gupid,
            pid,
            sticky_session_id,
            closed: AtomicBool::new(false),
        }
    }

    /// The group this session's worker belongs to.
    pub fn group_name(&self) -> &str {
        &self.group_name
    }

    /// Globally unique id of the worker serving this session.
    pub fn gupid(&self) -> &str {
        &self.gupid
    }

    /// OS pid of the worker serving this session.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Sticky-session key callers embed to be routed back to this worker.
    pub fn sticky_session_id(&self) -> u32 {
        self.sticky_session_id
    }

    /// Release the hold on the worker. Idempotent; also invoked on drop.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(pool) = self.pool.upgrade() {
            pool.session_closed(&self.group_name, &self.gupid);
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("group", &self.group_name)
            .field("gupid", &self.gupid)
            .field("pid", &self.pid)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_without_pool_is_noop() {
        // A session whose pool is gone must close quietly.
        let session = Session::new(Weak::new(), "g".into(), "gupid-1".into(), 42, 7);
        session.close();
        session.close();
        assert_eq!(session.pid(), 42);
        assert_eq!(session.sticky_session_id(), 7);
    }
}
