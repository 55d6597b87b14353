pub mod scheduler;
pub mod task;

pub use scheduler::Scheduler;
pub use task::{yield_now, Task, TaskEntry, TaskFuture, TaskState};

use crate::memory::{heap::HeapError, MemoryError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskError {
    TableFull,
    StackAllocation(HeapError),
    Memory(MemoryError),
}

impl From<MemoryError> for TaskError {
    fn from(err: MemoryError) -> Self {
        TaskError::Memory(err)
    }
}

impl core::fmt::Display for TaskError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            TaskError::TableFull => write!(f, "Maximum number of tasks reached"),
            TaskError::StackAllocation(err) => write!(f, "Failed to allocate a stack: {}", err),
            TaskError::Memory(err) => write!(f, "{}", err),
        }
    }
}
