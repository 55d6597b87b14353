//! Kernel core for a single-core x86-64 machine: physical and virtual memory
//! management, a first-fit heap and a cooperative round-robin scheduler,
//! with an in-memory file store and a command shell on top.
//!
//! Physical memory and the root page-table register are modelled in
//! software, so everything here also runs (and is tested) on a host.

#![cfg_attr(not(test), no_std)]
#![cfg_attr(feature = "strict", deny(warnings))]
extern crate alloc;

pub mod constants;
pub mod devices;
pub mod filesys;
pub mod init;
pub mod logging;
pub mod memory;
pub mod processes;
pub mod shell;

pub use init::{Kernel, KernelConfig, KernelError};

pub mod prelude {
    pub use crate::kprint;
    pub use crate::kprintln;
}
