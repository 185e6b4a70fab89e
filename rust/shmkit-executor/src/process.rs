//! Spawning child processes with their output captured.
//!
//! [`spawn`] forks and runs a closure in the child; [`spawn_command`] runs
//! an executable. Either way the child's stdout and stderr are pipes whose
//! read ends the parent gets in a [`ChildProcess`], with the write ends
//! already closed on the parent side. [`spawn_with`] can leave a forked
//! child on the parent's own stdout and stderr instead.
//!
//! Pipe descriptors are close-on-exec; only the copies a child installs as
//! its stdout and stderr survive an exec.

use std::ffi::OsStr;
use std::fs::File;
use std::io::{self, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::process::ExitStatusExt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::process::{Command, ExitStatus, Stdio};

/// Exit code of a forked child whose closure panicked.
pub const PANIC_EXIT_CODE: i32 = 101;

pub(crate) fn os_error(call: &'static str) -> shmkit::Error {
    shmkit::Error::SystemCall {
        call,
        source: io::Error::last_os_error(),
    }
}

struct Pipe {
    read: OwnedFd,
    write: OwnedFd,
}

#[cfg(target_os = "linux")]
fn raw_pipe(fds: &mut [libc::c_int; 2]) -> io::Result<()> {
    // SAFETY: fds has room for the two descriptors pipe2 writes.
    if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn raw_pipe(fds: &mut [libc::c_int; 2]) -> io::Result<()> {
    // SAFETY: fds has room for the two descriptors pipe writes.
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return Err(io::Error::last_os_error());
    }
    for &fd in fds.iter() {
        // SAFETY: fd was just opened by pipe.
        if unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) } != 0 {
            let err = io::Error::last_os_error();
            // SAFETY: both descriptors are ours and not yet wrapped.
            unsafe {
                libc::close(fds[0]);
                libc::close(fds[1]);
            }
            return Err(err);
        }
    }
    Ok(())
}

fn pipe() -> shmkit::Result<Pipe> {
    let mut fds = [0 as libc::c_int; 2];
    raw_pipe(&mut fds).map_err(|source| shmkit::Error::SystemCall {
        call: "pipe",
        source,
    })?;
    // SAFETY: the pipe call succeeded; both descriptors are fresh and ours.
    unsafe {
        Ok(Pipe {
            read: OwnedFd::from_raw_fd(fds[0]),
            write: OwnedFd::from_raw_fd(fds[1]),
        })
    }
}

/// Child side: install the pipe's write end as `target` and close the
/// originals. The installed copy is not close-on-exec.
fn redirect(pipe: Pipe, target: libc::c_int) {
    let Pipe { read, write } = pipe;
    drop(read);
    // SAFETY: plain descriptor duplication.
    unsafe { libc::dup2(write.as_raw_fd(), target) };
}

/// Where a forked child's stdout and stderr go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildOutput {
    /// Pipes the parent reads through [`ChildProcess::stdout`] and
    /// [`ChildProcess::stderr`]. A child that writes more than a pipe holds
    /// blocks until the parent reads.
    Captured,
    /// The parent's own stdout and stderr.
    Inherited,
}

/// Fork and run `entry` in the child, which exits with the returned code
/// (or [`PANIC_EXIT_CODE`] if it panics). Destructors of the parent's
/// values never run in the child. The child's output is captured.
///
/// The child starts with a copy of the calling thread only; `entry` should
/// not rely on locks that other threads of the parent might have held.
pub fn spawn<F>(entry: F) -> shmkit::Result<ChildProcess>
where
    F: FnOnce() -> i32,
{
    spawn_with(ChildOutput::Captured, entry)
}

/// [`spawn`] with a choice of where the child's output goes.
pub fn spawn_with<F>(output: ChildOutput, entry: F) -> shmkit::Result<ChildProcess>
where
    F: FnOnce() -> i32,
{
    let pipes = match output {
        ChildOutput::Captured => Some((pipe()?, pipe()?)),
        ChildOutput::Inherited => None,
    };

    // SAFETY: the child only redirects descriptors, runs `entry` and calls
    // _exit; it never returns into the caller's frames.
    let pid = unsafe { libc::fork() };
    if pid == -1 {
        return Err(os_error("fork"));
    }

    if pid == 0 {
        if let Some((stdout, stderr)) = pipes {
            redirect(stdout, libc::STDOUT_FILENO);
            redirect(stderr, libc::STDERR_FILENO);
        }

        let code = catch_unwind(AssertUnwindSafe(entry)).unwrap_or(PANIC_EXIT_CODE);
        let _ = io::stdout().flush();
        let _ = io::stderr().flush();
        // SAFETY: terminating the child without running the parent's
        // atexit handlers or destructors.
        unsafe { libc::_exit(code) };
    }

    tracing::debug!(pid, ?output, "forked child process");
    Ok(match pipes {
        Some((stdout, stderr)) => ChildProcess::new(pid, Some(stdout.read), Some(stderr.read)),
        None => ChildProcess::new(pid, None, None),
    })
}

/// Run the executable `program` with `args`.
pub fn spawn_command<I, S>(program: impl AsRef<OsStr>, args: I) -> shmkit::Result<ChildProcess>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut child = Command::new(program.as_ref())
        .args(args)
        .stdin(Stdio::inherit())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| shmkit::Error::SystemCall {
            call: "spawn",
            source,
        })?;

    let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
        return Err(shmkit::Error::Precondition(
            "spawned child is missing its output pipes".to_owned(),
        ));
    };
    let pid = child.id() as libc::pid_t;
    tracing::debug!(pid, program = ?program.as_ref(), "spawned command");
    Ok(ChildProcess::new(
        pid,
        Some(OwnedFd::from(stdout)),
        Some(OwnedFd::from(stderr)),
    ))
}

/// A spawned child and the read ends of its output pipes, if captured.
#[derive(Debug)]
pub struct ChildProcess {
    pid: libc::pid_t,
    stdout: Option<File>,
    stderr: Option<File>,
    status: Option<ExitStatus>,
}

impl ChildProcess {
    fn new(pid: libc::pid_t, stdout: Option<OwnedFd>, stderr: Option<OwnedFd>) -> Self {
        Self {
            pid,
            stdout: stdout.map(File::from),
            stderr: stderr.map(File::from),
            status: None,
        }
    }

    pub fn pid(&self) -> libc::pid_t {
        self.pid
    }

    /// The child's standard output, `None` unless captured. `&File`
    /// implements `Read`.
    pub fn stdout(&self) -> Option<&File> {
        self.stdout.as_ref()
    }

    pub fn stderr(&self) -> Option<&File> {
        self.stderr.as_ref()
    }

    /// Block until the child exits. Repeated calls return the same status.
    pub fn wait(&mut self) -> shmkit::Result<ExitStatus> {
        if let Some(status) = self.status {
            return Ok(status);
        }
        let mut raw = 0;
        loop {
            // SAFETY: raw is valid for writes.
            let rc = unsafe { libc::waitpid(self.pid, &mut raw, 0) };
            if rc == self.pid {
                break;
            }
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINTR) {
                return Err(shmkit::Error::SystemCall {
                    call: "waitpid",
                    source: err,
                });
            }
        }
        let status = ExitStatus::from_raw(raw);
        tracing::debug!(pid = self.pid, %status, "child exited");
        self.status = Some(status);
        Ok(status)
    }
}

impl Drop for ChildProcess {
    fn drop(&mut self) {
        if self.status.is_some() {
            return;
        }
        // Reap it if it is already gone; never block here.
        let mut raw = 0;
        // SAFETY: raw is valid for writes.
        let rc = unsafe { libc::waitpid(self.pid, &mut raw, libc::WNOHANG) };
        if rc == 0 {
            tracing::debug!(pid = self.pid, "dropping handle to a running child");
        }
    }
}
