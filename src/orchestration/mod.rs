// Scheduling and pool lifecycle
//
// The pool owns the workers; the dispatcher runs tasks against it; the
// monitor keeps it healthy in the background.

pub mod dispatcher;
pub mod monitor;
pub mod pool;

// Re-export commonly used types
pub use dispatcher::{run_queue, Dispatcher};
pub use monitor::run_monitor;
pub use pool::{PoolGauges, Worker, WorkerPool};
