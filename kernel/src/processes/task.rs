use core::{
    fmt,
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use arrayvec::ArrayString;
use futures::{future::LocalBoxFuture, task::noop_waker_ref};
use log::warn;
use x86_64::{structures::paging::PhysFrame, VirtAddr};

use crate::constants::processes::MAX_TASK_NAME;

/// Resumable body of a task. Everything between two `yield_now().await`
/// points runs without interruption.
pub type TaskFuture = LocalBoxFuture<'static, ()>;

/// Entry procedure of a task, called once on the task's first turn.
pub type TaskEntry = fn() -> TaskFuture;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Created, never run.
    Registered,
    Running,
    /// Suspended at a yield, waiting for its next turn.
    Ready,
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            TaskState::Registered => "registered",
            TaskState::Running => "running",
            TaskState::Ready => "ready",
        })
    }
}

pub struct Task {
    pub id: u32,
    name: ArrayString<MAX_TASK_NAME>,
    state: TaskState,
    stack_base: VirtAddr,
    stack_pointer: VirtAddr,
    root: PhysFrame,
    entry: TaskEntry,
    resume: Option<TaskFuture>,
    returned: bool,
}

impl Task {
    pub(super) fn new(
        id: u32,
        name: &str,
        entry: TaskEntry,
        stack_base: VirtAddr,
        stack_pointer: VirtAddr,
        root: PhysFrame,
    ) -> Self {
        // cut at a char boundary
        let mut task_name = ArrayString::new();
        for ch in name.chars() {
            if task_name.try_push(ch).is_err() {
                break;
            }
        }

        Task {
            id,
            name: task_name,
            state: TaskState::Registered,
            stack_base,
            stack_pointer,
            root,
            entry,
            resume: None,
            returned: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn stack_base(&self) -> VirtAddr {
        self.stack_base
    }

    pub fn stack_pointer(&self) -> VirtAddr {
        self.stack_pointer
    }

    /// Root page table that was active when the task was created.
    pub fn root(&self) -> PhysFrame {
        self.root
    }

    pub fn entry(&self) -> TaskEntry {
        self.entry
    }

    pub(super) fn set_state(&mut self, state: TaskState) {
        self.state = state;
    }

    /// Runs the task until its next yield. The first turn enters the entry
    /// procedure, later turns resume where the task left off.
    pub(super) fn run_until_yield(&mut self) {
        if self.returned {
            return;
        }

        let entry = self.entry;
        let future = self.resume.get_or_insert_with(entry);
        let mut context = Context::from_waker(noop_waker_ref());

        if future.as_mut().poll(&mut context).is_ready() {
            warn!(
                "Task {} ({}) returned from its entry procedure",
                self.id, self.name
            );
            self.resume = None;
            self.returned = true;
        }
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:>3} {:<31} {:<10} sp={:#x} root={:#x}",
            self.id,
            self.name.as_str(),
            self.state,
            self.stack_pointer.as_u64(),
            self.root.start_address().as_u64()
        )
    }
}

/// Gives up the rest of the current turn.
pub fn yield_now() -> YieldNow {
    YieldNow { yielded: false }
}

pub struct YieldNow {
    yielded: bool,
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Self::Output> {
        if self.yielded {
            Poll::Ready(())
        } else {
            self.yielded = true;
            Poll::Pending
        }
    }
}
