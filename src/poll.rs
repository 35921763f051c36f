// Copyright 2024 the vev authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Edge-triggered readiness multiplexer built directly on `epoll`.
//!
//! The one-shot discipline is what lets a connection be driven by at most
//! one worker thread at a time: a registration fires once and stays silent
//! until it is explicitly re-armed with [`Epoll::modify`].

use std::fmt;
use std::io;
use std::ops::BitOr;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};

/// Associates a readiness registration with its owner.
///
/// The rest of the crate packs a tag into the low bit to distinguish a
/// client socket from its per-request timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token(pub u64);

/// Interest mask for a registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest(u32);

impl Interest {
    /// No interest at all. A registration modified to this mask is disarmed
    /// but stays in the interest set.
    pub const NONE: Interest = Interest(0);
    /// The descriptor has bytes to read.
    pub const READABLE: Interest = Interest(libc::EPOLLIN as u32);
    /// Report transitions from non-ready to ready only.
    pub const EDGE: Interest = Interest(libc::EPOLLET as u32);
    /// Fire at most once, then stay disarmed until re-armed via `modify`.
    pub const ONESHOT: Interest = Interest(libc::EPOLLONESHOT as u32);
    /// The peer shut down its writing half (`EPOLLRDHUP`).
    pub const PEER_CLOSED: Interest = Interest(libc::EPOLLRDHUP as u32);

    fn bits(self) -> u32 {
        self.0
    }
}

impl BitOr for Interest {
    type Output = Interest;

    fn bitor(self, rhs: Interest) -> Interest {
        Interest(self.0 | rhs.0)
    }
}

/// A single readiness notification retrieved from [`Epoll::wait`].
#[derive(Debug, Clone, Copy)]
pub struct Event {
    token: Token,
    mask: u32,
}

impl Event {
    /// Token supplied when the descriptor was registered.
    pub fn token(&self) -> Token {
        self.token
    }

    /// The descriptor has bytes to read.
    pub fn is_readable(&self) -> bool {
        self.mask & libc::EPOLLIN as u32 != 0
    }

    /// The peer closed its writing half.
    pub fn is_read_closed(&self) -> bool {
        self.mask & libc::EPOLLRDHUP as u32 != 0
    }

    /// Both halves of the connection are gone. Always reported, interest or
    /// not.
    pub fn is_hangup(&self) -> bool {
        self.mask & libc::EPOLLHUP as u32 != 0
    }

    /// An error condition is pending on the descriptor. Always reported.
    pub fn is_error(&self) -> bool {
        self.mask & libc::EPOLLERR as u32 != 0
    }
}

/// Buffer of events filled by one call to [`Epoll::wait`].
pub struct Events {
    inner: Vec<libc::epoll_event>,
}

impl Events {
    /// Creates a buffer able to receive up to `capacity` events per wait.
    pub fn with_capacity(capacity: usize) -> Events {
        Events {
            inner: Vec::with_capacity(capacity),
        }
    }

    /// Number of events delivered by the last wait.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// True when the last wait expired without readiness.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Iterates over the events of the last wait, in delivery order.
    pub fn iter(&self) -> impl Iterator<Item = Event> + '_ {
        self.inner.iter().map(|raw| Event {
            token: Token(raw.u64),
            mask: raw.events,
        })
    }
}

impl fmt::Debug for Events {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Events").field("len", &self.len()).finish()
    }
}

/// Readiness multiplexer over a set of registered descriptors.
///
/// All control operations report failure through [`io::Error`], preserving
/// the OS error code for diagnostics. The instance itself may be shared
/// across threads; the kernel serializes concurrent control operations.
#[derive(Debug)]
pub struct Epoll {
    fd: OwnedFd,
}

impl Epoll {
    /// Creates the underlying epoll instance.
    pub fn new(cloexec: bool) -> io::Result<Epoll> {
        let flags = if cloexec { libc::EPOLL_CLOEXEC } else { 0 };
        // SAFETY: plain syscall, no pointers involved.
        let fd = unsafe { libc::epoll_create1(flags) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: `fd` is a freshly created descriptor we exclusively own.
        Ok(Epoll {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    /// Adds `fd` to the interest set.
    pub fn add(&self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, token, interest)
    }

    /// Replaces the registration of `fd`, re-arming a one-shot entry.
    pub fn modify(&self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, token, interest)
    }

    /// Removes `fd` from the interest set.
    pub fn delete(&self, fd: RawFd) -> io::Result<()> {
        // SAFETY: the event argument is ignored for EPOLL_CTL_DEL.
        let ret = unsafe {
            libc::epoll_ctl(
                self.fd.as_raw_fd(),
                libc::EPOLL_CTL_DEL,
                fd,
                std::ptr::null_mut(),
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Blocks for up to `timeout_ms` milliseconds (`-1` waits indefinitely)
    /// and returns the number of events delivered; `0` means the timeout
    /// expired. An interrupted wait surfaces as
    /// [`io::ErrorKind::Interrupted`], which callers treat as "try again".
    pub fn wait(&self, events: &mut Events, timeout_ms: i32) -> io::Result<usize> {
        events.inner.clear();
        // SAFETY: the kernel writes at most `capacity` entries into the
        // buffer; the length is adjusted to the returned count below.
        let n = unsafe {
            libc::epoll_wait(
                self.fd.as_raw_fd(),
                events.inner.as_mut_ptr(),
                events.inner.capacity() as libc::c_int,
                timeout_ms,
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: epoll_wait initialized the first `n` entries.
        unsafe { events.inner.set_len(n as usize) };
        Ok(n as usize)
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        let mut ev = libc::epoll_event {
            events: interest.bits(),
            u64: token.0,
        };
        // SAFETY: `ev` is a valid epoll_event for the duration of the call.
        let ret = unsafe { libc::epoll_ctl(self.fd.as_raw_fd(), op, fd, &mut ev) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

/// Wakes a thread blocked in [`Epoll::wait`].
///
/// Backed by an `eventfd` registered level-triggered, so a wake issued while
/// the supervising thread is busy is not lost. Workers call [`Waker::wake`]
/// after queueing a completion; the supervising thread calls
/// [`Waker::drain`] once it has seen the event.
#[derive(Debug)]
pub struct Waker {
    fd: OwnedFd,
}

impl Waker {
    /// Creates the eventfd and registers it with `epoll` under `token`.
    pub fn new(epoll: &Epoll, token: Token) -> io::Result<Waker> {
        // SAFETY: plain syscall, no pointers involved.
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: `fd` is a freshly created descriptor we exclusively own.
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };
        epoll.add(fd.as_raw_fd(), token, Interest::READABLE)?;
        Ok(Waker { fd })
    }

    /// Makes the registered token ready on the waiting thread.
    pub fn wake(&self) -> io::Result<()> {
        let one: u64 = 1;
        // SAFETY: writes 8 bytes from a valid u64.
        let ret = unsafe {
            libc::write(
                self.fd.as_raw_fd(),
                &one as *const u64 as *const libc::c_void,
                8,
            )
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            // A full counter still means the waiter will wake.
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(());
            }
            return Err(err);
        }
        Ok(())
    }

    /// Resets the eventfd counter so the token goes quiet again.
    pub fn drain(&self) {
        let mut buf = [0u8; 8];
        // SAFETY: reads at most 8 bytes into a valid buffer.
        unsafe {
            libc::read(self.fd.as_raw_fd(), buf.as_mut_ptr() as *mut libc::c_void, 8);
        }
    }
}

#[cfg(test)]
mod test {
    use super::{Epoll, Events, Interest, Token, Waker};

    #[test]
    fn wait_returns_zero_on_timeout() {
        let epoll = Epoll::new(true).unwrap();
        let mut events = Events::with_capacity(8);
        assert_eq!(0, epoll.wait(&mut events, 10).unwrap());
        assert!(events.is_empty());
    }

    #[test]
    fn waker_makes_token_ready() {
        let epoll = Epoll::new(true).unwrap();
        let waker = Waker::new(&epoll, Token(7)).unwrap();
        waker.wake().unwrap();

        let mut events = Events::with_capacity(8);
        assert_eq!(1, epoll.wait(&mut events, 1000).unwrap());
        let event = events.iter().next().unwrap();
        assert_eq!(Token(7), event.token());
        assert!(event.is_readable());

        waker.drain();
        assert_eq!(0, epoll.wait(&mut events, 10).unwrap());
    }

    #[test]
    fn oneshot_registration_fires_once_until_rearmed() {
        use std::os::unix::io::AsRawFd;

        let epoll = Epoll::new(true).unwrap();
        // A waker whose eventfd stays readable until drained makes a handy
        // persistent-readiness source.
        let ready = Waker::new(&epoll, Token(1)).unwrap();
        epoll
            .modify(
                ready.fd.as_raw_fd(),
                Token(1),
                Interest::READABLE | Interest::EDGE | Interest::ONESHOT,
            )
            .unwrap();
        ready.wake().unwrap();

        let mut events = Events::with_capacity(8);
        assert_eq!(1, epoll.wait(&mut events, 1000).unwrap());
        // Still readable, but the one-shot registration is now disarmed.
        assert_eq!(0, epoll.wait(&mut events, 50).unwrap());

        // Re-arming delivers the still-pending readiness again.
        epoll
            .modify(
                ready.fd.as_raw_fd(),
                Token(1),
                Interest::READABLE | Interest::EDGE | Interest::ONESHOT,
            )
            .unwrap();
        assert_eq!(1, epoll.wait(&mut events, 1000).unwrap());
    }
}
