//! Round-robin cooperative scheduler.
//!
//! Tasks are registered up front, kept in creation order and never removed.
//! A turn lasts until the running task yields; `schedule` then hands the CPU
//! to the next task in the table, wrapping around at the end.

use arrayvec::ArrayVec;
use log::{debug, error, info};
use x86_64::VirtAddr;

use crate::{
    constants::processes::{MAX_TASKS, STACK_SIZE},
    memory::{heap::Heap, paging::VirtualMemoryManager},
};

use super::{
    task::{Task, TaskEntry, TaskState},
    TaskError,
};

pub struct Scheduler {
    tasks: ArrayVec<Task, MAX_TASKS>,
    current: Option<usize>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::init()
    }
}

impl Scheduler {
    /// Empty task table, nothing running.
    pub fn init() -> Self {
        Scheduler {
            tasks: ArrayVec::new(),
            current: None,
        }
    }

    /// Registers a task and gives it a stack from the kernel heap.
    ///
    /// The entry procedure's address sits on top of the new stack, and the
    /// task records the root page table active right now as its address
    /// space. Returns the task's index in the table.
    pub fn create(
        &mut self,
        id: u32,
        name: &str,
        entry: TaskEntry,
        heap: &mut Heap,
        vmm: &mut VirtualMemoryManager,
    ) -> Result<usize, TaskError> {
        if self.tasks.is_full() {
            error!("Maximum number of tasks reached, dropping task {} ({})", id, name);
            return Err(TaskError::TableFull);
        }

        let stack_base = heap.allocate(vmm, STACK_SIZE).map_err(|err| {
            error!("No stack for task {} ({}): {}", id, name, err);
            TaskError::StackAllocation(err)
        })?;

        let stack_pointer = stack_base + (STACK_SIZE - 8) as u64;
        if let Err(err) = vmm.write_u64(stack_pointer, entry as usize as u64) {
            if let Err(free_err) = heap.free(vmm, stack_base) {
                error!("Stack of task {} ({}) could not be released: {}", id, name, free_err);
            }
            return Err(err.into());
        }

        let task = Task::new(id, name, entry, stack_base, stack_pointer, vmm.read_root());
        info!("Created task {} ({}) with stack at {:#X}", id, task.name(), stack_base.as_u64());
        self.tasks.push(task);

        Ok(self.tasks.len() - 1)
    }

    /// Runs the next task until it yields and returns its index.
    ///
    /// The very first call enters task 0; after that the CPU moves one slot
    /// along the table on every call. Does nothing without tasks.
    pub fn schedule(&mut self) -> Option<usize> {
        if self.tasks.is_empty() {
            return None;
        }

        let next = match self.current {
            None => 0,
            Some(current) => {
                self.tasks[current].set_state(TaskState::Ready);
                (current + 1) % self.tasks.len()
            }
        };

        debug!("Switching to task {}", self.tasks[next].id);
        self.current = Some(next);

        let task = &mut self.tasks[next];
        task.set_state(TaskState::Running);
        task.run_until_yield();

        Some(next)
    }

    /// Same as [`schedule`](Self::schedule).
    pub fn yield_cpu(&mut self) -> Option<usize> {
        self.schedule()
    }

    pub fn current(&self) -> Option<&Task> {
        self.current.map(|index| &self.tasks[index])
    }

    pub fn current_index(&self) -> Option<usize> {
        self.current
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.iter()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Stack top of the task at `index`, if there is one.
    pub fn stack_pointer(&self, index: usize) -> Option<VirtAddr> {
        self.tasks.get(index).map(Task::stack_pointer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        memory::{
            bitmap_frame_allocator::BitmapFrameAllocator, physical_memory::PhysicalMemory,
            MemoryError,
        },
        processes::task::{yield_now, TaskFuture},
    };
    use alloc::{boxed::Box, vec::Vec};
    use core::sync::atomic::{AtomicUsize, Ordering};
    use x86_64::structures::paging::Page;

    const MEMORY: u64 = 16 * 1024 * 1024;

    fn setup(heap_size: usize) -> (Heap, VirtualMemoryManager) {
        let mut frames = BitmapFrameAllocator::init(MEMORY);
        let mut vmm = VirtualMemoryManager::new(PhysicalMemory::new(MEMORY), &mut frames).unwrap();
        let heap = Heap::init_range(
            VirtAddr::new(crate::constants::memory::HEAP_START),
            heap_size,
            &mut vmm,
            &mut frames,
        )
        .unwrap();
        (heap, vmm)
    }

    fn spinning_task() -> TaskFuture {
        Box::pin(async {
            loop {
                yield_now().await;
            }
        })
    }

    static STEPS: AtomicUsize = AtomicUsize::new(0);

    fn stepping_task() -> TaskFuture {
        Box::pin(async {
            loop {
                STEPS.fetch_add(1, Ordering::SeqCst);
                yield_now().await;
            }
        })
    }

    static FINISHED: AtomicUsize = AtomicUsize::new(0);

    fn finishing_task() -> TaskFuture {
        Box::pin(async {
            FINISHED.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_schedule_without_tasks() {
        let mut scheduler = Scheduler::init();
        assert_eq!(scheduler.schedule(), None);
        assert!(scheduler.current().is_none());
    }

    #[test]
    fn test_round_robin_in_creation_order() {
        let (mut heap, mut vmm) = setup(64 * 1024);
        let mut scheduler = Scheduler::init();
        for id in 1..=4 {
            scheduler
                .create(id, "spin", spinning_task, &mut heap, &mut vmm)
                .unwrap();
        }

        assert_eq!(scheduler.schedule(), Some(0));
        let visited: Vec<usize> = (0..4).filter_map(|_| scheduler.schedule()).collect();
        assert_eq!(visited, [1, 2, 3, 0]);
        assert_eq!(scheduler.yield_cpu(), Some(1));
        assert_eq!(scheduler.current().map(|task| task.id), Some(2));
    }

    #[test]
    fn test_states_follow_turns() {
        let (mut heap, mut vmm) = setup(64 * 1024);
        let mut scheduler = Scheduler::init();
        scheduler.create(1, "a", spinning_task, &mut heap, &mut vmm).unwrap();
        scheduler.create(2, "b", spinning_task, &mut heap, &mut vmm).unwrap();

        let states = |s: &Scheduler| s.tasks().map(Task::state).collect::<Vec<_>>();
        assert_eq!(states(&scheduler), [TaskState::Registered, TaskState::Registered]);
        scheduler.schedule();
        assert_eq!(states(&scheduler), [TaskState::Running, TaskState::Registered]);
        scheduler.schedule();
        assert_eq!(states(&scheduler), [TaskState::Ready, TaskState::Running]);
    }

    #[test]
    fn test_task_resumes_after_yield() {
        let (mut heap, mut vmm) = setup(64 * 1024);
        let mut scheduler = Scheduler::init();
        scheduler.create(7, "stepper", stepping_task, &mut heap, &mut vmm).unwrap();

        for turn in 1..=5 {
            assert_eq!(scheduler.schedule(), Some(0));
            assert_eq!(STEPS.load(Ordering::SeqCst), turn);
        }
    }

    #[test]
    fn test_returned_task_stays_idle() {
        let (mut heap, mut vmm) = setup(64 * 1024);
        let mut scheduler = Scheduler::init();
        scheduler.create(1, "short", finishing_task, &mut heap, &mut vmm).unwrap();
        scheduler.create(2, "spin", spinning_task, &mut heap, &mut vmm).unwrap();

        for _ in 0..6 {
            scheduler.schedule();
        }
        assert_eq!(FINISHED.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.len(), 2);
    }

    #[test]
    fn test_initial_stack_frame() {
        let (mut heap, mut vmm) = setup(64 * 1024);
        let mut scheduler = Scheduler::init();
        let index = scheduler
            .create(3, "stack", spinning_task, &mut heap, &mut vmm)
            .unwrap();

        let task = scheduler.tasks().nth(index).unwrap();
        assert_eq!(task.stack_pointer(), task.stack_base() + (STACK_SIZE - 8) as u64);
        assert_eq!(
            vmm.read_u64(task.stack_pointer()),
            Ok(task.entry() as usize as u64)
        );
        assert_eq!(task.root(), vmm.read_root());
        assert_eq!(scheduler.stack_pointer(index), Some(task.stack_pointer()));
    }

    #[test]
    fn test_table_full() {
        let (mut heap, mut vmm) = setup(64 * 1024);
        let mut scheduler = Scheduler::init();
        for id in 0..MAX_TASKS as u32 {
            scheduler.create(id, "t", spinning_task, &mut heap, &mut vmm).unwrap();
        }
        assert_eq!(
            scheduler.create(99, "extra", spinning_task, &mut heap, &mut vmm),
            Err(TaskError::TableFull)
        );
        assert_eq!(scheduler.len(), MAX_TASKS);
    }

    #[test]
    fn test_stack_allocation_failure() {
        let (mut heap, mut vmm) = setup(4096);
        let mut scheduler = Scheduler::init();
        assert!(matches!(
            scheduler.create(1, "big", spinning_task, &mut heap, &mut vmm),
            Err(TaskError::StackAllocation(_))
        ));
        assert!(scheduler.is_empty());
    }

    #[test]
    fn test_unwritable_stack_is_released() {
        // one block that fits a stack exactly, its top on the second page
        let (mut heap, mut vmm) = setup(STACK_SIZE + 2 * crate::memory::heap::HEADER_SIZE);
        let top_page = Page::containing_address(heap.start() + 4096u64);
        vmm.unmap(top_page).unwrap();

        let mut scheduler = Scheduler::init();
        let err = scheduler
            .create(1, "broken", spinning_task, &mut heap, &mut vmm)
            .unwrap_err();
        assert!(matches!(err, TaskError::Memory(MemoryError::PageNotMapped(_))));
        assert!(scheduler.is_empty());

        let blocks = heap.blocks(&vmm).unwrap();
        assert_eq!(blocks.len(), 1);
        assert!(blocks[0].free);
    }

    #[test]
    fn test_long_names_are_truncated() {
        let (mut heap, mut vmm) = setup(64 * 1024);
        let mut scheduler = Scheduler::init();
        let name = "a-task-name-that-is-definitely-longer-than-the-table-allows";
        scheduler.create(1, name, spinning_task, &mut heap, &mut vmm).unwrap();
        assert_eq!(scheduler.tasks().next().unwrap().name(), &name[..31]);
    }
}
