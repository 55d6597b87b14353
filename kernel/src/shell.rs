//! Line-oriented command shell over the file store, memory statistics and
//! the task table.

use core::fmt;

use alloc::{string::String, vec};
use arrayvec::ArrayVec;
use log::debug;

use crate::{
    constants::filesys::{MAX_ARGS, MAX_COMMAND_LENGTH, MAX_FILE_SIZE},
    devices::console::Console,
    init::Kernel,
};

const SELFTEST_FILE: &str = "selftest.tmp";
const SELFTEST_PATTERN: &[u8] = b"The quick brown fox jumps over the lazy dog";

/// Runs one command line, writing its response to `console`.
///
/// Words are separated by whitespace; anything after the tenth word is
/// dropped. An empty line does nothing.
pub fn handle_command(kernel: &mut Kernel, line: &str, console: &mut dyn Console) {
    let line = truncate(line, MAX_COMMAND_LENGTH - 1);
    let args: ArrayVec<&str, MAX_ARGS> = line.split_whitespace().take(MAX_ARGS).collect();
    let Some(&command) = args.first() else {
        return;
    };

    debug!("Command: {}", command);
    // a console that refuses output has nothing useful to tell us
    let _ = run(kernel, command, &args[1..], console);
}

fn truncate(line: &str, max: usize) -> &str {
    if line.len() <= max {
        return line;
    }
    let mut end = max;
    while !line.is_char_boundary(end) {
        end -= 1;
    }
    &line[..end]
}

fn run(
    kernel: &mut Kernel,
    command: &str,
    args: &[&str],
    console: &mut dyn Console,
) -> fmt::Result {
    match command {
        "help" => help(console),
        "clear" => {
            console.clear();
            Ok(())
        }
        "create" => match args.first() {
            None => writeln!(console, "Usage: create <filename>"),
            Some(name) => match kernel.fs.create(name, &mut kernel.heap, &mut kernel.vmm) {
                Ok(_) => writeln!(console, "File created successfully"),
                Err(err) => writeln!(console, "Error: {}", err),
            },
        },
        "write" => {
            if args.len() < 2 {
                return writeln!(console, "Usage: write <filename> <content>");
            }
            let content = args[1..].join(" ");
            match kernel.fs.write(args[0], content.as_bytes(), &mut kernel.vmm) {
                Ok(len) => writeln!(console, "Content written to file ({} bytes)", len),
                Err(err) => writeln!(console, "Error: {}", err),
            }
        }
        "read" => match args.first() {
            None => writeln!(console, "Usage: read <filename>"),
            Some(name) => {
                let mut buf = vec![0u8; MAX_FILE_SIZE];
                match kernel.fs.read(name, &mut buf, &kernel.vmm) {
                    Ok(len) => {
                        writeln!(console, "File contents:")?;
                        writeln!(console, "{}", String::from_utf8_lossy(&buf[..len]))
                    }
                    Err(err) => writeln!(console, "Error: {}", err),
                }
            }
        },
        "delete" => match args.first() {
            None => writeln!(console, "Usage: delete <filename>"),
            Some(name) => match kernel.fs.delete(name, &mut kernel.heap, &mut kernel.vmm) {
                Ok(()) => writeln!(console, "File deleted successfully"),
                Err(err) => writeln!(console, "Error: {}", err),
            },
        },
        "list" => {
            writeln!(console, "Files:")?;
            for entry in kernel.fs.list() {
                writeln!(console, "{}", entry)?;
            }
            Ok(())
        }
        "mkdir" => match args.first() {
            None => writeln!(console, "Usage: mkdir <dirname>"),
            Some(name) => match kernel.fs.mkdir(name) {
                Ok(()) => writeln!(console, "Directory created successfully"),
                Err(err) => writeln!(console, "Error: {}", err),
            },
        },
        "meminfo" => meminfo(kernel, console),
        "ps" => {
            writeln!(console, " ID {:<31} {:<10} SP / ROOT", "NAME", "STATE")?;
            for task in kernel.scheduler.tasks() {
                writeln!(console, "{}", task)?;
            }
            Ok(())
        }
        "test" => selftest(kernel, console),
        _ => writeln!(console, "Unknown command. Type 'help' for a list of commands."),
    }
}

fn help(console: &mut dyn Console) -> fmt::Result {
    writeln!(console, "Available commands:")?;
    for (usage, description) in [
        ("help", "Display this help message"),
        ("clear", "Clear the screen"),
        ("create <filename>", "Create a new file"),
        ("write <filename> <content>", "Write content to a file"),
        ("read <filename>", "Read content from a file"),
        ("delete <filename>", "Delete a file or directory"),
        ("list", "List all files"),
        ("mkdir <dirname>", "Create a new directory"),
        ("meminfo", "Display memory information"),
        ("ps", "List tasks"),
        ("test", "Run a series of tests"),
    ] {
        writeln!(console, "  {} - {}", usage, description)?;
    }
    Ok(())
}

fn meminfo(kernel: &Kernel, console: &mut dyn Console) -> fmt::Result {
    writeln!(console, "{}", kernel.memory_info())?;
    match kernel.heap.stats(&kernel.vmm) {
        Ok(stats) => writeln!(
            console,
            "Heap: {} bytes used, {} bytes free in {} blocks",
            stats.used, stats.free, stats.blocks
        ),
        Err(err) => writeln!(console, "Heap: {}", err),
    }
}

fn selftest(kernel: &mut Kernel, console: &mut dyn Console) -> fmt::Result {
    writeln!(console, "Running tests...")?;

    let heap = heap_selftest(kernel);
    writeln!(console, "  heap: {}", verdict(heap))?;
    let fs = fs_selftest(kernel);
    writeln!(console, "  file store: {}", verdict(fs))?;

    if heap && fs {
        writeln!(console, "All tests passed")
    } else {
        writeln!(console, "Some tests failed")
    }
}

fn verdict(passed: bool) -> &'static str {
    if passed {
        "ok"
    } else {
        "FAILED"
    }
}

fn heap_selftest(kernel: &mut Kernel) -> bool {
    let Ok(ptr) = kernel.allocate(SELFTEST_PATTERN.len()) else {
        return false;
    };

    let mut buf = [0u8; SELFTEST_PATTERN.len()];
    let intact = kernel.vmm.write(ptr, SELFTEST_PATTERN).is_ok()
        && kernel.vmm.read(ptr, &mut buf).is_ok()
        && buf == SELFTEST_PATTERN;

    let freed = kernel.free(ptr).is_ok();
    let double_free_caught = kernel.free(ptr).is_err();

    intact && freed && double_free_caught
}

fn fs_selftest(kernel: &mut Kernel) -> bool {
    if kernel
        .fs
        .create(SELFTEST_FILE, &mut kernel.heap, &mut kernel.vmm)
        .is_err()
    {
        return false;
    }

    let mut buf = [0u8; SELFTEST_PATTERN.len()];
    let round_trip = kernel
        .fs
        .write(SELFTEST_FILE, SELFTEST_PATTERN, &mut kernel.vmm)
        .is_ok()
        && kernel.fs.read(SELFTEST_FILE, &mut buf, &kernel.vmm) == Ok(buf.len())
        && buf == SELFTEST_PATTERN;

    let deleted = kernel
        .fs
        .delete(SELFTEST_FILE, &mut kernel.heap, &mut kernel.vmm)
        .is_ok();

    round_trip && deleted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{devices::console::BufferConsole, init::KernelConfig};

    fn kernel() -> Kernel {
        Kernel::init(KernelConfig {
            total_memory: 64 * 1024 * 1024,
            identity_map_size: 2 * 1024 * 1024,
        })
        .unwrap()
    }

    fn exec(kernel: &mut Kernel, line: &str) -> String {
        let mut console = BufferConsole::default();
        handle_command(kernel, line, &mut console);
        console.output
    }

    #[test]
    fn test_empty_line() {
        let mut kernel = kernel();
        assert_eq!(exec(&mut kernel, ""), "");
        assert_eq!(exec(&mut kernel, "   \t "), "");
    }

    #[test]
    fn test_unknown_command() {
        let mut kernel = kernel();
        assert_eq!(
            exec(&mut kernel, "frobnicate now"),
            "Unknown command. Type 'help' for a list of commands.\n"
        );
    }

    #[test]
    fn test_help_lists_every_command() {
        let mut kernel = kernel();
        let output = exec(&mut kernel, "help");
        for command in [
            "help", "clear", "create", "write", "read", "delete", "list", "mkdir", "meminfo",
            "ps", "test",
        ] {
            assert!(output.contains(&alloc::format!("  {}", command)), "{}", command);
        }
    }

    #[test]
    fn test_file_session() {
        let mut kernel = kernel();
        assert_eq!(exec(&mut kernel, "create notes"), "File created successfully\n");
        assert_eq!(
            exec(&mut kernel, "write notes hello   brave new world"),
            "Content written to file (21 bytes)\n"
        );
        assert_eq!(
            exec(&mut kernel, "read notes"),
            "File contents:\nhello brave new world\n"
        );
        assert_eq!(exec(&mut kernel, "mkdir docs"), "Directory created successfully\n");
        assert_eq!(
            exec(&mut kernel, "list"),
            "Files:\nFILE notes (21 bytes)\nDIR docs (0 bytes)\n"
        );
        assert_eq!(exec(&mut kernel, "delete notes"), "File deleted successfully\n");
        assert_eq!(exec(&mut kernel, "read notes"), "Error: File not found\n");
        assert_eq!(exec(&mut kernel, "create docs"), "Error: File already exists\n");
    }

    #[test]
    fn test_usage_messages() {
        let mut kernel = kernel();
        assert_eq!(exec(&mut kernel, "create"), "Usage: create <filename>\n");
        assert_eq!(exec(&mut kernel, "write notes"), "Usage: write <filename> <content>\n");
        assert_eq!(exec(&mut kernel, "read"), "Usage: read <filename>\n");
        assert_eq!(exec(&mut kernel, "delete"), "Usage: delete <filename>\n");
        assert_eq!(exec(&mut kernel, "mkdir"), "Usage: mkdir <dirname>\n");
    }

    #[test]
    fn test_write_keeps_ten_words() {
        let mut kernel = kernel();
        exec(&mut kernel, "create f");
        exec(&mut kernel, "write f 1 2 3 4 5 6 7 8 9 10 11");
        assert_eq!(exec(&mut kernel, "read f"), "File contents:\n1 2 3 4 5 6 7 8\n");
    }

    #[test]
    fn test_clear() {
        let mut kernel = kernel();
        let mut console = BufferConsole::default();
        console.output.push_str("old output");
        handle_command(&mut kernel, "clear", &mut console);
        assert!(console.output.is_empty());
    }

    #[test]
    fn test_meminfo() {
        let mut kernel = kernel();
        let output = exec(&mut kernel, "meminfo");
        assert!(output.starts_with("Memory Info:\n  Total: 67108864 bytes\n"));
        assert!(output.contains("Reserved: 1048576 bytes"));
        assert!(output.contains("Heap: 0 bytes used"));
    }

    #[test]
    fn test_ps() {
        let mut kernel = kernel();
        fn idle() -> crate::processes::TaskFuture {
            alloc::boxed::Box::pin(async {
                loop {
                    crate::processes::yield_now().await;
                }
            })
        }
        kernel.create_task(5, "idle", idle).unwrap();
        kernel.schedule();

        let output = exec(&mut kernel, "ps");
        let rows: alloc::vec::Vec<&str> = output.lines().collect();
        assert_eq!(rows.len(), 2);
        assert!(rows[0].starts_with(" ID NAME"));
        assert!(rows[1].starts_with("  5 idle"));
        assert_eq!(rows[0].find("STATE"), rows[1].find("running"));
        assert_eq!(rows[0].find("SP / ROOT"), rows[1].find("sp="));
        assert!(rows[1].contains(" root=0x"));
    }

    #[test]
    fn test_selftest_leaves_no_trace() {
        let mut kernel = kernel();
        let before = kernel.heap.stats(&kernel.vmm).unwrap();
        let output = exec(&mut kernel, "test");
        assert!(output.ends_with("All tests passed\n"), "{}", output);
        assert_eq!(kernel.heap.stats(&kernel.vmm).unwrap(), before);
        assert_eq!(kernel.fs.file_count(), 0);
    }

    #[test]
    fn test_long_line_is_cut() {
        assert_eq!(truncate("abc", 10), "abc");
        assert_eq!(truncate("abcdef", 4), "abcd");
        assert_eq!(truncate("aé", 2), "a");
    }
}
