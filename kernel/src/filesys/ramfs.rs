use arrayvec::ArrayVec;
use log::{debug, error, warn};
use x86_64::VirtAddr;

use crate::{
    constants::filesys::{MAX_DIRECTORY_ENTRIES, MAX_FILES, MAX_FILE_SIZE},
    memory::{heap::Heap, paging::VirtualMemoryManager},
};

use super::{DirEntry, EntryKind, FileHandle, FileName, FsError, SeekFrom};

struct File {
    name: FileName,
    size: usize,
    /// Heap buffer of MAX_FILE_SIZE bytes.
    data: VirtAddr,
}

struct Entry {
    name: FileName,
    kind: EntryKind,
}

/// Files and the root directory that lists them.
///
/// Every file has exactly one root entry. Directories are entries only and
/// cannot hold anything.
pub struct FileStore {
    files: ArrayVec<File, MAX_FILES>,
    root: ArrayVec<Entry, MAX_DIRECTORY_ENTRIES>,
}

impl Default for FileStore {
    fn default() -> Self {
        Self::new()
    }
}

fn file_name(name: &str) -> Result<FileName, FsError> {
    if name.is_empty() {
        return Err(FsError::InvalidName);
    }
    FileName::from(name).map_err(|_| FsError::InvalidName)
}

impl FileStore {
    pub fn new() -> Self {
        FileStore {
            files: ArrayVec::new(),
            root: ArrayVec::new(),
        }
    }

    /// Creates an empty file and returns its slot.
    pub fn create(
        &mut self,
        name: &str,
        heap: &mut Heap,
        vmm: &mut VirtualMemoryManager,
    ) -> Result<usize, FsError> {
        let name = file_name(name)?;
        if self.files.is_full() {
            return Err(FsError::TooManyFiles);
        }
        if self.entry(&name).is_some() {
            return Err(FsError::AlreadyExists);
        }
        if self.root.is_full() {
            return Err(FsError::DirectoryFull);
        }

        let data = heap.allocate(vmm, MAX_FILE_SIZE).map_err(|err| {
            error!("No buffer for file {}: {}", name, err);
            FsError::OutOfMemory
        })?;

        self.files.push(File {
            name,
            size: 0,
            data,
        });
        self.root.push(Entry {
            name,
            kind: EntryKind::File,
        });
        debug!("Created file {}", name);

        Ok(self.files.len() - 1)
    }

    /// Replaces the contents of `name`. Anything past MAX_FILE_SIZE is cut.
    pub fn write(
        &mut self,
        name: &str,
        data: &[u8],
        vmm: &mut VirtualMemoryManager,
    ) -> Result<usize, FsError> {
        let file = self.file_mut(name)?;
        let len = if data.len() > MAX_FILE_SIZE {
            warn!(
                "Truncating {} from {} to {} bytes",
                file.name,
                data.len(),
                MAX_FILE_SIZE
            );
            MAX_FILE_SIZE
        } else {
            data.len()
        };

        vmm.write(file.data, &data[..len])?;
        file.size = len;
        debug!("Wrote {} bytes to {}", len, file.name);

        Ok(len)
    }

    /// Copies the start of the file into `buf`.
    pub fn read(
        &self,
        name: &str,
        buf: &mut [u8],
        vmm: &VirtualMemoryManager,
    ) -> Result<usize, FsError> {
        let file = self.file(name)?;
        let len = buf.len().min(file.size);
        vmm.read(file.data, &mut buf[..len])?;
        Ok(len)
    }

    /// Removes a file and releases its buffer, or removes an empty directory
    /// entry.
    pub fn delete(
        &mut self,
        name: &str,
        heap: &mut Heap,
        vmm: &mut VirtualMemoryManager,
    ) -> Result<(), FsError> {
        if let Some(index) = self.files.iter().position(|file| file.name.as_str() == name) {
            let file = self.files.swap_remove(index);
            if let Err(err) = heap.free(vmm, file.data) {
                error!("Buffer of {} could not be released: {}", file.name, err);
            }
        }

        let index = self
            .root
            .iter()
            .position(|entry| entry.name.as_str() == name)
            .ok_or(FsError::NotFound)?;
        self.root.swap_remove(index);
        debug!("Deleted {}", name);

        Ok(())
    }

    pub fn mkdir(&mut self, name: &str) -> Result<(), FsError> {
        let name = file_name(name)?;
        if self.root.is_full() {
            return Err(FsError::DirectoryFull);
        }
        if self.entry(&name).is_some() {
            return Err(FsError::AlreadyExists);
        }

        self.root.push(Entry {
            name,
            kind: EntryKind::Directory,
        });
        debug!("Created directory {}", name);
        Ok(())
    }

    /// Root directory contents with file sizes.
    pub fn list(&self) -> impl Iterator<Item = DirEntry> + '_ {
        self.root.iter().map(|entry| DirEntry {
            name: entry.name,
            kind: entry.kind,
            size: match entry.kind {
                EntryKind::File => self.file(&entry.name).map_or(0, |file| file.size),
                EntryKind::Directory => 0,
            },
        })
    }

    pub fn open(&self, name: &str) -> Result<FileHandle, FsError> {
        let file = self.file(name)?;
        Ok(FileHandle {
            name: file.name,
            position: 0,
        })
    }

    pub fn close(&self, handle: FileHandle) {
        debug!("Closed {}", handle.name);
    }

    /// Moves the cursor and returns the new position. The cursor may sit
    /// at the end of the file, never before the start or past the end.
    pub fn seek(&self, handle: &mut FileHandle, pos: SeekFrom) -> Result<u32, FsError> {
        let size = self.file(&handle.name)?.size as i64;
        let target = match pos {
            SeekFrom::Start(offset) => i64::try_from(offset).ok(),
            SeekFrom::Current(delta) => i64::from(handle.position).checked_add(delta),
            SeekFrom::End(delta) => size.checked_add(delta),
        }
        .ok_or(FsError::InvalidSeek)?;

        if !(0..=size).contains(&target) {
            return Err(FsError::InvalidSeek);
        }

        handle.position = target as u32;
        Ok(handle.position)
    }

    pub fn tell(&self, handle: &FileHandle) -> u32 {
        handle.position
    }

    /// Size of a file in bytes.
    pub fn size(&self, name: &str) -> Result<usize, FsError> {
        self.file(name).map(|file| file.size)
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    fn entry(&self, name: &str) -> Option<&Entry> {
        self.root.iter().find(|entry| entry.name.as_str() == name)
    }

    fn file(&self, name: &str) -> Result<&File, FsError> {
        self.files
            .iter()
            .find(|file| file.name.as_str() == name)
            .ok_or(FsError::NotFound)
    }

    fn file_mut(&mut self, name: &str) -> Result<&mut File, FsError> {
        self.files
            .iter_mut()
            .find(|file| file.name.as_str() == name)
            .ok_or(FsError::NotFound)
    }
}
