//! Single-threaded event-loop worker.
//!
//! One worker thread owns a [`Reactor`] and is the execution home for every
//! resource allocated against it. Other threads post callbacks onto the loop
//! through thread-safe, double-buffered queues; a heartbeat timer distributes
//! a cached clock to every enrolled connection; and shutdown escalates from
//! cooperative exit to an immediate loop stop under a caller-supplied budget.

pub mod config;
pub mod connection;
pub mod error;
pub mod metrics;
pub mod pool;
pub mod queue;
pub mod reactor;
pub mod worker;

// Public API re-exports
pub use config::{BufferPoolConfig, Config};
pub use connection::{ConnId, Connection, ConnectionManager};
pub use error::{BoxError, Error};
pub use pool::{BufSlot, BufferPool, WriteReq, WriteReqPool};
pub use queue::{CloseFn, Completion};
pub use reactor::{Handle, HandleId, HandleKind, NotifyHandle, Reactor, Wakeup};
pub use worker::{LoopContext, LoopWorker, Scheduler, WorkerHandle};
