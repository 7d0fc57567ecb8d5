//! Worker-side stdout/stderr redirection (spec §4.4 step 2, Design Notes §9
//! "byte-stream tee to (a) the original descriptor and (b) a line-buffered
//! splitter that emits `LogEntry` values").
//!
//! Each standard stream's fd is replaced with the write end of a pipe; a
//! background thread reads lines from the pipe, re-emits them on a duplicate
//! of the original fd (so `println!`/`eprintln!` output still reaches the
//! worker's real stdout/stderr, e.g. under a terminal or test harness), and
//! forwards each line to the host as a `STDOUT`/`STDERR` [`LogEntry`].

use crate::ipc::WorkerMessage;
use crate::log_entry::{LogEntry, LogLevel};
use nix::fcntl::{fcntl, FcntlArg};
use std::io::{BufRead, BufReader, Write};
use std::os::fd::{AsRawFd, FromRawFd, RawFd};
use tokio::sync::mpsc::UnboundedSender;

const STDOUT_FILENO: RawFd = 1;
const STDERR_FILENO: RawFd = 2;

/// Install tees on both stdout and stderr. Best-effort: if the underlying fd
/// operations fail (e.g. running under a harness that already redirected
/// stdio in a way that rejects further duplication), the stream is left
/// alone and only that stream's log forwarding is skipped.
pub fn install(sink: UnboundedSender<WorkerMessage>) {
    if let Err(err) = install_one(STDOUT_FILENO, LogLevel::Stdout, sink.clone()) {
        eprintln!("failed to install stdout tee: {err}");
    }
    if let Err(err) = install_one(STDERR_FILENO, LogLevel::Stderr, sink) {
        eprintln!("failed to install stderr tee: {err}");
    }
}

/// Duplicate `fd` onto a fresh descriptor via `fcntl(F_DUPFD_CLOEXEC)`,
/// mirroring the fd-control calls `supervisor::spawn_worker` already makes
/// through `nix::fcntl` rather than introducing a second duplication API.
fn dup_fd(fd: RawFd) -> nix::Result<RawFd> {
    fcntl(fd, FcntlArg::F_DUPFD_CLOEXEC(0))
}

fn install_one(fd: RawFd, level: LogLevel, sink: UnboundedSender<WorkerMessage>) -> nix::Result<()> {
    let passthrough = dup_fd(fd)?;
    let (read_end, write_end) = nix::unistd::pipe()?;
    let write_raw = write_end.as_raw_fd();
    nix::unistd::dup2(write_raw, fd)?;
    drop(write_end);

    let passthrough_file = unsafe { std::fs::File::from_raw_fd(passthrough) };
    let read_file = unsafe { std::fs::File::from_raw_fd(read_end.as_raw_fd()) };
    std::mem::forget(read_end);

    let _ = spawn_tee_thread(read_file, passthrough_file, level, sink);
    Ok(())
}

fn spawn_tee_thread(
    read_file: std::fs::File,
    mut passthrough_file: std::fs::File,
    level: LogLevel,
    sink: UnboundedSender<WorkerMessage>,
) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        let mut reader = BufReader::new(read_file);
        let mut line = String::new();
        loop {
            line.clear();
            match reader.read_line(&mut line) {
                Ok(0) => break,
                Ok(_) => {
                    let trimmed = line.trim_end_matches('\n');
                    let _ = writeln!(passthrough_file, "{trimmed}");
                    let _ = sink.send(WorkerMessage::Log {
                        entries: vec![LogEntry::new(trimmed.to_string(), level)],
                    });
                }
                Err(_) => break,
            }
        }
    })
}
