//! Task execution engine for the montytest worker.
//!
//! Given one task descriptor pulled from the coordinator, the engine
//! provisions the two monty revisions it names (source download, build,
//! network assets), calibrates the time control against the machine's
//! measured bench throughput, and then supervises the match runner (or
//! the data-generation engine), streaming batch results back to the
//! coordinator until the match finishes or the coordinator cancels the
//! task.

pub mod assets;
pub mod bench;
pub mod builder;
pub mod coordinator;
pub mod datagen;
pub mod fastchess;
pub mod process;
pub mod task;
pub mod tc;

pub use coordinator::{
    RequestTaskReply, Run, TaskReport, TaskRequest, TaskState, WorkerInfo,
};
pub use task::{run_task, WorkerEnv};
