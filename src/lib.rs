//! Corral - an application process pool
//!
//! This library is the dispatch and capacity-management core of a request
//! router that fronts web applications:
//! - Spawns worker processes on demand through a pluggable spawning kit
//! - Groups workers by application identity (root, environment, user)
//! - Routes requests to the least-loaded worker, FIFO within a group
//! - Arbitrates a global process budget across groups, trashing idle
//!   workers elsewhere when a starved group needs room
//! - Supports rolling and immediate restarts, disable/drain, and
//!   out-of-band work windows
//! - Garbage collects idle workers and empty groups, reaps detached
//!   processes, and recovers from worker crashes
//!
//! It does not parse HTTP, own request sockets, or persist anything; the
//! surrounding agent provides those.

pub mod config;
pub mod error;
pub mod group;
pub mod hooks;
pub mod metrics;
pub mod options;
pub mod pool;
pub mod process;
pub mod session;
pub mod spawn;

pub use config::{HookScript, PoolConfig};
pub use error::{DisableResult, GetError, SpawnError};
pub use group::{GetCallback, GroupStatus};
pub use options::{Options, RestartMethod, SpawnMethod};
pub use pool::{InspectOptions, Pool, PoolLifeStatus, PoolStatus, Ticket};
pub use process::{ProcessState, ProcessStatus};
pub use session::Session;
pub use spawn::{CommandSpawner, SpawnedWorker, Spawner};
