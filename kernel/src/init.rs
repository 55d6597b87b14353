//! Kernel context and start-up.
//!
//! [`Kernel`] owns one instance of every component and hands them to each
//! other by `&mut` where they cooperate.

use core::fmt;

use log::{info, warn};
use x86_64::VirtAddr;

use crate::{
    constants::memory::{DEFAULT_IDENTITY_MAP_SIZE, DEFAULT_TOTAL_MEMORY},
    devices::console::Console,
    filesys::{FileStore, FsError},
    kprintln, logging,
    memory::{
        bitmap_frame_allocator::BitmapFrameAllocator,
        heap::{Heap, HeapError},
        paging::VirtualMemoryManager,
        physical_memory::PhysicalMemory,
        MapError, MemoryInfo,
    },
    processes::{yield_now, Scheduler, TaskEntry, TaskError, TaskFuture},
    shell,
};

/// Values the boot code hands to [`Kernel::init`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelConfig {
    /// Bytes of physical memory.
    pub total_memory: u64,
    /// Bytes identity mapped (and mirrored at `KERNEL_BASE`) during boot.
    pub identity_map_size: u64,
}

impl Default for KernelConfig {
    fn default() -> Self {
        KernelConfig {
            total_memory: DEFAULT_TOTAL_MEMORY,
            identity_map_size: DEFAULT_IDENTITY_MAP_SIZE,
        }
    }
}

/// Errors that stop the kernel from coming up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    Paging(MapError),
    Heap(HeapError),
    Task(TaskError),
    Fs(FsError),
}

impl From<MapError> for KernelError {
    fn from(err: MapError) -> Self {
        KernelError::Paging(err)
    }
}

impl From<HeapError> for KernelError {
    fn from(err: HeapError) -> Self {
        KernelError::Heap(err)
    }
}

impl From<TaskError> for KernelError {
    fn from(err: TaskError) -> Self {
        KernelError::Task(err)
    }
}

impl From<FsError> for KernelError {
    fn from(err: FsError) -> Self {
        KernelError::Fs(err)
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelError::Paging(err) => write!(f, "Paging setup failed: {}", err),
            KernelError::Heap(err) => write!(f, "Heap setup failed: {}", err),
            KernelError::Task(err) => write!(f, "Task setup failed: {}", err),
            KernelError::Fs(err) => write!(f, "File store error: {}", err),
        }
    }
}

pub struct Kernel {
    pub frames: BitmapFrameAllocator,
    pub vmm: VirtualMemoryManager,
    pub heap: Heap,
    pub scheduler: Scheduler,
    pub fs: FileStore,
}

impl Kernel {
    /// Brings up memory management, the scheduler and the file store, in
    /// that order.
    pub fn init(config: KernelConfig) -> Result<Self, KernelError> {
        logging::init();
        info!("Initializing memory management...");
        let mut frames = BitmapFrameAllocator::init(config.total_memory);

        let identity_map_size = config.identity_map_size.min(config.total_memory);
        if identity_map_size < config.identity_map_size {
            warn!(
                "Identity map clamped to physical memory: {:#X} bytes",
                identity_map_size
            );
        }

        let ram = PhysicalMemory::new(config.total_memory);
        let mut vmm = VirtualMemoryManager::new(ram, &mut frames)?;
        vmm.init(identity_map_size, &mut frames)?;
        let heap = Heap::init(&mut vmm, &mut frames)?;

        let scheduler = Scheduler::init();
        let fs = FileStore::new();
        info!("File system initialized");

        let kernel = Kernel {
            frames,
            vmm,
            heap,
            scheduler,
            fs,
        };
        info!("{}", kernel.memory_info());

        Ok(kernel)
    }

    /// [`init`](Self::init), then the boot self-test on the file store and
    /// the two demo tasks.
    pub fn boot(config: KernelConfig) -> Result<Self, KernelError> {
        let mut kernel = Self::init(config)?;

        kernel.fs.create("test.txt", &mut kernel.heap, &mut kernel.vmm)?;
        kernel.fs.write("test.txt", b"Hello, World!", &mut kernel.vmm)?;
        let mut buf = [0u8; 20];
        let len = kernel.fs.read("test.txt", &mut buf, &kernel.vmm)?;
        info!(
            "Read from test.txt: {}",
            core::str::from_utf8(&buf[..len]).unwrap_or("<binary>")
        );

        kernel.create_task(1, "Task 1", task1)?;
        kernel.create_task(2, "Task 2", task2)?;

        kprintln!("Welcome to ML Kernel");
        kprintln!("Type 'help' for a list of commands");

        Ok(kernel)
    }

    pub fn allocate(&mut self, size: usize) -> Result<VirtAddr, HeapError> {
        self.heap.allocate(&mut self.vmm, size)
    }

    pub fn free(&mut self, ptr: VirtAddr) -> Result<(), HeapError> {
        self.heap.free(&mut self.vmm, ptr)
    }

    pub fn memory_info(&self) -> MemoryInfo {
        self.frames.stats()
    }

    pub fn create_task(
        &mut self,
        id: u32,
        name: &str,
        entry: TaskEntry,
    ) -> Result<usize, TaskError> {
        self.scheduler
            .create(id, name, entry, &mut self.heap, &mut self.vmm)
    }

    pub fn schedule(&mut self) -> Option<usize> {
        self.scheduler.schedule()
    }

    pub fn yield_cpu(&mut self) -> Option<usize> {
        self.scheduler.yield_cpu()
    }

    /// One pass of the main loop: run a command line, then give one task
    /// a turn.
    pub fn tick(&mut self, line: &str, console: &mut dyn Console) -> Option<usize> {
        shell::handle_command(self, line, console);
        self.schedule()
    }
}

fn task1() -> TaskFuture {
    alloc::boxed::Box::pin(async {
        loop {
            info!("Task 1 running");
            yield_now().await;
        }
    })
}

fn task2() -> TaskFuture {
    alloc::boxed::Box::pin(async {
        loop {
            info!("Task 2 running");
            yield_now().await;
        }
    })
}
