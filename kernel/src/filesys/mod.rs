//! Flat in-memory file store.
//!
//! One root directory, no nesting. File contents live in kernel heap
//! allocations and are reached through the virtual memory manager.

pub mod ramfs;

use core::fmt;

use arrayvec::ArrayString;

use crate::constants::filesys::MAX_FILENAME_LENGTH;
use crate::memory::MemoryError;

pub use ramfs::FileStore;

pub type FileName = ArrayString<MAX_FILENAME_LENGTH>;

// Define error types for the filesystem operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    TooManyFiles,
    AlreadyExists,
    /// No heap memory left for the file's data buffer.
    OutOfMemory,
    DirectoryFull,
    NotFound,
    InvalidName,
    InvalidSeek,
    Memory(MemoryError),
}

impl From<MemoryError> for FsError {
    fn from(err: MemoryError) -> Self {
        FsError::Memory(err)
    }
}

impl fmt::Display for FsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FsError::TooManyFiles => write!(f, "Maximum number of files reached"),
            FsError::AlreadyExists => write!(f, "File already exists"),
            FsError::OutOfMemory => write!(f, "Failed to allocate memory for file"),
            FsError::DirectoryFull => write!(f, "Root directory is full"),
            FsError::NotFound => write!(f, "File not found"),
            FsError::InvalidName => write!(f, "Invalid file name"),
            FsError::InvalidSeek => write!(f, "Seek outside the file"),
            FsError::Memory(err) => write!(f, "{}", err),
        }
    }
}

/// Seek positions for file operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekFrom {
    Start(u64),
    Current(i64),
    End(i64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
}

/// Represents a directory entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirEntry {
    pub name: FileName,
    pub kind: EntryKind,
    /// Always 0 for directories.
    pub size: usize,
}

impl fmt::Display for DirEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            EntryKind::File => "FILE",
            EntryKind::Directory => "DIR",
        };
        write!(f, "{} {} ({} bytes)", kind, self.name, self.size)
    }
}

/// Cursor into an open file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHandle {
    name: FileName,
    position: u32,
}

impl FileHandle {
    pub fn name(&self) -> &str {
        &self.name
    }
}
