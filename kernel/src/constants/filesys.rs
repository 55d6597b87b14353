//! Limits of the flat in-memory file store.

pub const MAX_FILENAME_LENGTH: usize = 31;
pub const MAX_FILE_SIZE: usize = 4096;
pub const MAX_FILES: usize = 64;
pub const MAX_DIRECTORY_ENTRIES: usize = 16;

pub const MAX_COMMAND_LENGTH: usize = 256;
pub const MAX_ARGS: usize = 10;
