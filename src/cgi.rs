//! Bounded-lifetime CGI child supervisor.
//!
//! A POST target is executed as a local program: the request body is fed to
//! its standard input, and whatever it writes to standard output within
//! [`MAX_CGI_RUNTIME`] becomes the response body. A child that overruns the
//! budget is killed, twice: once by pid, and once by process group in case
//! the child already finished moving itself into its own group. Both pipes
//! are close-on-exec from creation (`std::process` guarantees this), so
//! concurrently forked siblings cannot hold stray write ends open and break
//! EOF detection.

use std::io::{self, Read, Write};
use std::os::unix::io::AsRawFd;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, warn};

/// Hard ceiling on a child's lifetime.
pub const MAX_CGI_RUNTIME: Duration = Duration::from_millis(1000);
/// Interval between non-blocking waits on the child.
pub const CGI_STEP: Duration = Duration::from_millis(1);

/// Runs `path` with `body` on its standard input and collects its standard
/// output, for at most [`MAX_CGI_RUNTIME`].
///
/// The child inherits the parent's environment unmodified and receives no
/// arguments. Its standard error is folded into standard output. An empty
/// collection is the caller's cue to report an internal server error.
pub fn run(path: &Path, body: &[u8]) -> io::Result<Vec<u8>> {
    let mut command = Command::new(path);
    command.stdin(Stdio::piped()).stdout(Stdio::piped());
    // SAFETY: the hook runs between fork and exec and only issues
    // async-signal-safe syscalls.
    unsafe {
        command.pre_exec(|| {
            // Own process group, so the supervisor can signal the whole
            // subtree with one negative-pid kill.
            if libc::setpgid(0, 0) != 0 {
                return Err(io::Error::last_os_error());
            }
            // Do not outlive the server.
            if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL as libc::c_ulong) != 0 {
                return Err(io::Error::last_os_error());
            }
            // The stdio pipes are already on descriptors 0 and 1 here;
            // fold stderr onto the output pipe. dup2 clears close-on-exec
            // on the standard descriptors as required.
            if libc::dup2(libc::STDOUT_FILENO, libc::STDERR_FILENO) < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let mut child = command.spawn()?;
    let pid = child.id() as libc::pid_t;

    // Feed the body and close the input so the child sees EOF. A child
    // that exits without reading produces a broken pipe here; that is its
    // business, not a request failure.
    if let Some(mut stdin) = child.stdin.take() {
        let _ = stdin.write_all(body);
    }

    let start = Instant::now();
    loop {
        thread::sleep(CGI_STEP);
        match child.try_wait()? {
            Some(status) => {
                debug!("cgi child {pid} finished: {status}");
                break;
            }
            None if start.elapsed() > MAX_CGI_RUNTIME => {
                warn!("cgi child {pid} overran its budget, killing");
                // SAFETY: plain kill(2) on the child we spawned. The
                // pid-directed kill covers the window before the child's
                // setpgid took effect; the group-directed kill covers
                // everything it spawned afterwards.
                unsafe {
                    libc::kill(pid, libc::SIGKILL);
                    if libc::getpgid(pid) == pid {
                        libc::kill(-pid, libc::SIGKILL);
                    }
                }
                // Keep looping; the next wait reaps the zombie.
            }
            None => {}
        }
    }

    let mut output = Vec::new();
    if let Some(mut stdout) = child.stdout.take() {
        set_nonblocking(stdout.as_raw_fd())?;
        let mut chunk = [0u8; 1024];
        loop {
            match stdout.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => output.extend_from_slice(&chunk[..n]),
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(err),
            }
        }
    }
    Ok(output)
}

fn set_nonblocking(fd: libc::c_int) -> io::Result<()> {
    // SAFETY: fcntl on a descriptor we own.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}
