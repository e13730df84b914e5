use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::Once;
use std::thread;
use std::time::{self, Duration};

use libc::pid_t;
use log::{debug, error};
use nix::errno::Errno;
use nix::fcntl::{self, FcntlArg, OFlag};
use nix::poll::{self, PollFd, PollFlags, PollTimeout};
use nix::{sys, unistd};

use crate::core::{EmptyResult, OpResult};

pub struct Pipe {
    pub read: OwnedFd,
    pub write: OwnedFd,
}

pub fn pipe() -> OpResult<Pipe> {
    let (read, write) = unistd::pipe2(OFlag::O_CLOEXEC).map_err(|e| format!(
        "Unable to create a pipe: {}", e))?;
    Ok(Pipe {read, write})
}

pub fn set_nonblocking<F: AsFd>(fd: F) -> EmptyResult {
    let flags = fcntl::fcntl(fd.as_fd(), FcntlArg::F_GETFL).map_err(|e| format!(
        "fcntl() failed: {}", e))?;
    let flags = OFlag::from_bits_retain(flags) | OFlag::O_NONBLOCK;
    fcntl::fcntl(fd.as_fd(), FcntlArg::F_SETFL(flags)).map_err(|e| format!(
        "fcntl() failed: {}", e))?;
    Ok(())
}

pub fn read_retry<F: AsFd>(fd: F, buf: &mut [u8]) -> nix::Result<usize> {
    loop {
        match unistd::read(fd.as_fd(), buf) {
            Err(Errno::EINTR) => continue,
            result => return result,
        }
    }
}

pub fn write_retry<F: AsFd>(fd: F, buf: &[u8]) -> nix::Result<usize> {
    loop {
        match unistd::write(fd.as_fd(), buf) {
            Err(Errno::EINTR) => continue,
            result => return result,
        }
    }
}

/// A file descriptor the child inherits: either dupped onto a well known
/// number (stdin/stdout/stderr) or kept at its own number, in which case the
/// close-on-exec flag has to be dropped in the child.
pub struct InheritedFd {
    pub fd: OwnedFd,
    pub target: Option<RawFd>,
}

/// Spawns an engine process with the passed fd plan. All pipe ends we create
/// carry close-on-exec, so everything not listed in `inherited` simply
/// disappears in the child. Unclaimed stdin and stderr are connected to the
/// null device. The caller still owns the fds in `inherited` and is expected
/// to drop them right after the spawn.
pub fn spawn(path: &Path, args: &[String], inherited: &[InheritedFd]) -> OpResult<Child> {
    ignore_sigpipe();

    let plan: Vec<(RawFd, Option<RawFd>)> = inherited.iter()
        .map(|item| (item.fd.as_raw_fd(), item.target)).collect();

    let mut command = Command::new(path);
    command.args(args).stdin(Stdio::null()).stderr(Stdio::null());

    unsafe {
        command.pre_exec(move || {
            for &(fd, target) in &plan {
                match target {
                    Some(target) => {
                        // dup2() drops close-on-exec on the duplicate
                        if libc::dup2(fd, target) == -1 {
                            return Err(std::io::Error::last_os_error());
                        }
                    },
                    None => {
                        if libc::fcntl(fd, libc::F_SETFD, 0) == -1 {
                            return Err(std::io::Error::last_os_error());
                        }
                    },
                }
            }
            Ok(())
        });
    }

    let child = command.spawn().map_err(|e| format!(
        "Unable to spawn {:?}: {}", path, e))?;

    debug!("Spawned {:?} with pid {}.", path, child.id());
    Ok(child)
}

// A child exiting early must not kill us with SIGPIPE when we still write to
// its stdin. Installed once, and only if the application hasn't set its own
// handler.
fn ignore_sigpipe() {
    static SIGPIPE_GUARD: Once = Once::new();

    SIGPIPE_GUARD.call_once(|| unsafe {
        let old = libc::signal(libc::SIGPIPE, libc::SIG_IGN);
        if old != libc::SIG_DFL && old != libc::SIG_ERR {
            libc::signal(libc::SIGPIPE, old);
        }
    });
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

/// One slot of the multiplexer's working set. Frozen entries stay in the set
/// but aren't polled, which is how the command channel is parked until an
/// inquiry arrives.
pub struct FdEntry {
    pub fd: RawFd,
    pub direction: Direction,
    pub frozen: bool,
    pub signalled: bool,
}

impl FdEntry {
    pub fn new(fd: RawFd, direction: Direction) -> FdEntry {
        FdEntry {fd, direction, frozen: false, signalled: false}
    }
}

/// The readiness notification seam. The default implementation polls with a
/// small timeout; callers integrating an external event loop may install
/// their own.
pub trait Multiplexer {
    /// Marks ready entries as signalled and returns their count. Zero means
    /// the wait timed out with nothing ready.
    fn select(&mut self, entries: &mut [FdEntry], nonblock: bool) -> OpResult<usize>;
}

pub struct PollMultiplexer;

// Bound the sleep so that cancellation flags are observed timely even when
// the child produces nothing
const SELECT_TIMEOUT_MS: u8 = 50;

impl Multiplexer for PollMultiplexer {
    fn select(&mut self, entries: &mut [FdEntry], nonblock: bool) -> OpResult<usize> {
        for entry in entries.iter_mut() {
            entry.signalled = false;
        }

        let mut indexes = Vec::with_capacity(entries.len());
        let mut poll_fds = Vec::with_capacity(entries.len());

        for (index, entry) in entries.iter().enumerate() {
            if entry.frozen {
                continue;
            }

            let events = match entry.direction {
                Direction::Read => PollFlags::POLLIN,
                Direction::Write => PollFlags::POLLOUT,
            };

            indexes.push(index);
            poll_fds.push(PollFd::new(unsafe {
                BorrowedFd::borrow_raw(entry.fd)
            }, events));
        }

        if poll_fds.is_empty() {
            return Ok(0);
        }

        let timeout = if nonblock {
            PollTimeout::ZERO
        } else {
            PollTimeout::from(SELECT_TIMEOUT_MS)
        };

        let count = loop {
            match poll::poll(&mut poll_fds, timeout) {
                Err(Errno::EINTR) => continue,
                Err(err) => return Err!("poll() failed: {}", err),
                Ok(count) => break count,
            }
        };

        let ready: Vec<bool> = poll_fds.iter().map(|poll_fd| {
            poll_fd.revents().is_some_and(|revents| revents.intersects(
                PollFlags::POLLIN | PollFlags::POLLOUT | PollFlags::POLLHUP | PollFlags::POLLERR))
        }).collect();

        for (&index, ready) in indexes.iter().zip(ready) {
            entries[index].signalled = ready;
        }

        Ok(count as usize)
    }
}

/// Reaps the child and returns its exit code, or `None` when it has been
/// terminated by a signal.
pub fn reap(name: &str, child: &mut Child) -> OpResult<Option<i32>> {
    let status = child.wait().map_err(|e| format!(
        "Failed to wait() {}: {}", name, e))?;

    if status.success() {
        debug!("{} has finished successfully.", name);
    } else {
        debug!("{} has terminated with {}.", name, status);
    }

    Ok(status.code())
}

pub fn terminate_process(name: &str, pid: pid_t, timeout: Duration) -> EmptyResult {
    debug!("Terminating {}...", name);

    let pid = unistd::Pid::from_raw(pid);
    let mut signal = sys::signal::SIGTERM;
    let start_time = time::Instant::now();

    loop {
        match sys::signal::kill(pid, signal) {
            Ok(_) => {
                if signal != sys::signal::SIGKILL && start_time.elapsed() >= timeout {
                    error!("Failed to terminate {} using SIGTERM. Using SIGKILL...", name);
                    signal = sys::signal::SIGKILL;
                }

                match sys::wait::waitpid(pid, Some(sys::wait::WaitPidFlag::WNOHANG)) {
                    Ok(_) => break,
                    Err(Errno::ECHILD) => (),
                    Err(err) => return Err!("Failed to wait() {}: {}", name, err),
                };

                thread::sleep(Duration::from_millis(100));
            },
            Err(Errno::ESRCH) => break,
            Err(err) => return Err!("Failed to terminate {}: {}", name, err),
        }
    }

    debug!("Successfully terminated {}.", name);

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use super::*;

    #[test]
    fn pipe_multiplexing() {
        let pipe = pipe().unwrap();
        set_nonblocking(&pipe.read).unwrap();

        let mut entries = [FdEntry::new(pipe.read.as_raw_fd(), Direction::Read)];
        assert_eq!(PollMultiplexer.select(&mut entries, true).unwrap(), 0);
        assert!(!entries[0].signalled);

        let mut write: std::fs::File = pipe.write.into();
        write.write_all(b"ping").unwrap();

        assert_eq!(PollMultiplexer.select(&mut entries, false).unwrap(), 1);
        assert!(entries[0].signalled);

        let mut buf = [0; 16];
        assert_eq!(read_retry(&pipe.read, &mut buf).unwrap(), 4);
        assert_eq!(&buf[..4], b"ping");

        // EOF shows up as readable too
        drop(write);
        assert_eq!(PollMultiplexer.select(&mut entries, false).unwrap(), 1);
        assert_eq!(read_retry(&pipe.read, &mut buf).unwrap(), 0);
    }

    #[test]
    fn frozen_entries() {
        let pipe = pipe().unwrap();
        let mut write: std::fs::File = pipe.write.try_clone().unwrap().into();
        write.write_all(b"data").unwrap();

        let mut entries = [FdEntry::new(pipe.read.as_raw_fd(), Direction::Read)];
        entries[0].frozen = true;
        assert_eq!(PollMultiplexer.select(&mut entries, true).unwrap(), 0);
        assert!(!entries[0].signalled);

        entries[0].frozen = false;
        assert_eq!(PollMultiplexer.select(&mut entries, true).unwrap(), 1);
        assert!(entries[0].signalled);
    }
}
