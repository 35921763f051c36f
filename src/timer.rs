//! One-shot countdown tied to a file descriptor.

use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};

/// A descriptor-based one-shot timer.
///
/// The descriptor becomes readable exactly once when the armed interval
/// elapses, making it registrable with the readiness multiplexer alongside
/// the socket it bounds. The countdown runs on the boot-time monotonic
/// clock, so wall-clock jumps and system suspension cannot stretch or
/// shrink it.
#[derive(Debug)]
pub struct Timer {
    fd: OwnedFd,
}

impl Timer {
    /// Creates a disarmed timer.
    pub fn new() -> io::Result<Timer> {
        // SAFETY: plain syscall, no pointers involved.
        let fd = unsafe {
            libc::timerfd_create(libc::CLOCK_BOOTTIME, libc::TFD_NONBLOCK | libc::TFD_CLOEXEC)
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: `fd` is a freshly created descriptor we exclusively own.
        Ok(Timer {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    /// Arms the timer to expire once at now + `secs` + `nanos`.
    ///
    /// `(0, 0)` cancels a pending expiry instead.
    pub fn arm(&self, secs: u64, nanos: u32) -> io::Result<()> {
        let spec = libc::itimerspec {
            // Zero interval keeps the timer one-shot.
            it_interval: libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            },
            it_value: libc::timespec {
                tv_sec: secs as libc::time_t,
                tv_nsec: nanos as libc::c_long,
            },
        };
        // SAFETY: `spec` is a valid itimerspec for the duration of the call.
        let ret =
            unsafe { libc::timerfd_settime(self.fd.as_raw_fd(), 0, &spec, std::ptr::null_mut()) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Cancels a pending expiry. Equivalent to `arm(0, 0)`.
    pub fn cancel(&self) -> io::Result<()> {
        self.arm(0, 0)
    }

    /// Descriptor to register with the multiplexer.
    pub fn fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

#[cfg(test)]
mod test {
    use super::Timer;
    use crate::poll::{Epoll, Events, Interest, Token};

    #[test]
    fn armed_timer_becomes_readable_at_expiry() {
        let epoll = Epoll::new(true).unwrap();
        let timer = Timer::new().unwrap();
        epoll
            .add(timer.fd(), Token(3), Interest::READABLE)
            .unwrap();
        timer.arm(0, 20_000_000).unwrap();

        let mut events = Events::with_capacity(4);
        assert_eq!(1, epoll.wait(&mut events, 2000).unwrap());
        assert_eq!(Token(3), events.iter().next().unwrap().token());
    }

    #[test]
    fn cancelled_timer_never_fires() {
        let epoll = Epoll::new(true).unwrap();
        let timer = Timer::new().unwrap();
        epoll
            .add(timer.fd(), Token(4), Interest::READABLE)
            .unwrap();
        timer.arm(0, 50_000_000).unwrap();
        timer.cancel().unwrap();

        let mut events = Events::with_capacity(4);
        assert_eq!(0, epoll.wait(&mut events, 100).unwrap());
    }

    #[test]
    fn rearming_replaces_the_pending_expiry() {
        let timer = Timer::new().unwrap();
        timer.arm(600, 0).unwrap();
        // Re-arm far in the future, then cancel; neither must error.
        timer.arm(1200, 0).unwrap();
        timer.cancel().unwrap();
    }
}
