//! Core services: the task queue, the executor, and the stream accumulator.

pub mod accumulator;
pub mod executor;
pub mod task_queue;

pub use accumulator::StreamAccumulator;
pub use executor::{ExecutorConfig, ExecutorError, TaskExecutor, DEFAULT_TASK_TIMEOUT};
pub use task_queue::{QueueError, TaskQueue, DEFAULT_QUEUE_CAPACITY};
