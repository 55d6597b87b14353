/// Capacity of the task table.
pub const MAX_TASKS: usize = 10;
/// Every task gets one heap-allocated stack of this size.
pub const STACK_SIZE: usize = 4096;
pub const MAX_TASK_NAME: usize = 31;
