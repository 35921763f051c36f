//! The supervising thread: accepts connections and dispatches readiness.
//!
//! The listener owns the listening socket, the readiness multiplexer and
//! the connection table. Accept events are handled inline, exhaustively
//! under edge triggering; client events are handed to the worker pool; a
//! finished worker reports back over a channel and the multiplexer's waker.
//! All multiplexer mutations for a connection happen either here or are
//! requested from here while the connection's registrations are disarmed,
//! which is what makes a slot's `busy` flag authoritative.

use std::fs::File;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, TcpListener as TcpSocket, TcpStream};
use std::os::unix::io::{AsRawFd, FromRawFd};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};

use log::{debug, error, info, warn};
use slab::Slab;

use crate::config::Config;
use crate::connection::Connection;
use crate::poll::{Epoll, Event, Events, Interest, Token, Waker};
use crate::pool::{ShutdownMode, ThreadPool};

const LISTEN_TOKEN: Token = Token(u64::MAX);
const WAKE_TOKEN: Token = Token(u64::MAX - 1);
const EVENT_CAPACITY: usize = 1024;

#[derive(Debug)]
struct Slot {
    conn: Arc<Mutex<Connection>>,
    /// A worker currently holds this connection (or a task for it is
    /// queued). Timer and hang-up events never destroy a busy slot.
    busy: bool,
    /// Destruction decided mid-batch; performed once the batch ends so
    /// slab keys are not reused while stale events may still be pending.
    dying: bool,
}

/// Accepts connections and drives the readiness loop.
#[derive(Debug)]
pub struct Listener {
    inner: TcpSocket,
    epoll: Epoll,
    connections: Slab<Slot>,
    pool: ThreadPool,
    waker: Arc<Waker>,
    done_tx: Sender<(usize, bool)>,
    done_rx: Receiver<(usize, bool)>,
    /// Pre-opened idle descriptor released to drain the accept queue when
    /// the process runs out of descriptors.
    spare: Option<File>,
    config: Arc<Config>,
}

impl Listener {
    /// Binds the listening socket and brings up multiplexer, waker and
    /// worker pool.
    pub fn bind(config: Config) -> io::Result<Listener> {
        let inner = TcpSocket::bind((Ipv4Addr::UNSPECIFIED, config.port))?;
        inner.set_nonblocking(true)?;

        let epoll = Epoll::new(true)?;
        epoll.add(
            inner.as_raw_fd(),
            LISTEN_TOKEN,
            Interest::READABLE | Interest::EDGE,
        )?;
        let waker = Arc::new(Waker::new(&epoll, WAKE_TOKEN)?);
        let (done_tx, done_rx) = channel();
        let pool = ThreadPool::new(config.worker_count, ShutdownMode::Graceful, config.max_queue);

        Ok(Listener {
            inner,
            epoll,
            connections: Slab::new(),
            pool,
            waker,
            done_tx,
            done_rx,
            spare: File::open("/dev/null").ok(),
            config: Arc::new(config),
        })
    }

    /// Address the listening socket is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    /// Runs the readiness loop. Only a failing `wait` makes it return.
    pub fn run(&mut self) {
        let mut events = Events::with_capacity(EVENT_CAPACITY);
        loop {
            match self.epoll.wait(&mut events, -1) {
                Ok(_) => {}
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    error!("wait failed: {err}");
                    return;
                }
            }
            for event in events.iter() {
                match event.token() {
                    LISTEN_TOKEN => self.accept(),
                    WAKE_TOKEN => self.reap_completions(),
                    token => self.dispatch(token, event),
                }
            }
            self.sweep();
        }
    }

    /// Accepts until the queue is empty, as edge triggering requires.
    fn accept(&mut self) {
        loop {
            // SAFETY: accept4 writes nothing through the null address
            // pointers.
            let fd = unsafe {
                libc::accept4(
                    self.inner.as_raw_fd(),
                    std::ptr::null_mut(),
                    std::ptr::null_mut(),
                    libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                )
            };
            if fd < 0 {
                let err = io::Error::last_os_error();
                match err.raw_os_error() {
                    Some(libc::EAGAIN) => break,
                    Some(libc::EINTR) | Some(libc::ECONNABORTED) => continue,
                    Some(libc::EMFILE) | Some(libc::ENFILE) => {
                        self.drain_accept_queue();
                        continue;
                    }
                    _ => {
                        error!("accept failed: {err}");
                        break;
                    }
                }
            }
            // SAFETY: accept4 returned a fresh connected socket we now own.
            let stream = unsafe { TcpStream::from_raw_fd(fd) };
            self.install(stream);
        }
    }

    fn install(&mut self, stream: TcpStream) {
        let entry = self.connections.vacant_entry();
        let key = entry.key();
        let conn = match Connection::new(stream, key, self.config.clone()) {
            Ok(conn) => conn,
            Err(err) => {
                warn!("failed to set up connection: {err}");
                return;
            }
        };
        if let Err(err) = conn.register(&self.epoll) {
            warn!("failed to register connection: {err}");
            return;
        }
        entry.insert(Slot {
            conn: Arc::new(Mutex::new(conn)),
            busy: false,
            dying: false,
        });
    }

    /// Out of descriptors: close the spare, accept-and-close everything
    /// pending so clients get a prompt reset, then re-acquire the spare.
    fn drain_accept_queue(&mut self) {
        self.spare.take();
        let mut drained = 0usize;
        loop {
            // SAFETY: as in accept.
            let fd = unsafe {
                libc::accept4(
                    self.inner.as_raw_fd(),
                    std::ptr::null_mut(),
                    std::ptr::null_mut(),
                    libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                )
            };
            if fd < 0 {
                if io::Error::last_os_error().kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                break;
            }
            // SAFETY: closing the descriptor we just received.
            unsafe { libc::close(fd) };
            drained += 1;
        }
        self.spare = File::open("/dev/null").ok();
        warn!("out of descriptors: reset {drained} pending connections");
    }

    /// Routes one client-socket or timer event.
    fn dispatch(&mut self, token: Token, event: Event) {
        let key = (token.0 >> 1) as usize;
        let timer_fired = token.0 & 1 == 1;

        let conn = {
            let Some(slot) = self.connections.get_mut(key) else {
                return;
            };
            // The timer event may sit in the same batch that handed the
            // socket to a worker; a busy slot is never torn down here.
            if slot.busy || slot.dying {
                return;
            }
            if timer_fired {
                info!("connection {key} timed out");
                slot.dying = true;
                return;
            }
            if event.is_read_closed()
                || event.is_hangup()
                || event.is_error()
                || !event.is_readable()
            {
                debug!("connection {key} hung up");
                slot.dying = true;
                return;
            }
            slot.busy = true;
            slot.conn.clone()
        };

        // Keep a pending timeout from racing the worker.
        if let Err(err) = conn.lock().unwrap().disarm_timer(&self.epoll) {
            warn!("failed to disarm timer for connection {key}: {err}");
        }

        let done = self.done_tx.clone();
        let waker = self.waker.clone();
        let submitted = self.pool.submit(move || {
            let keep_going = conn.lock().unwrap().run_step();
            // A failed send means the listener is gone and the process is
            // shutting down; nothing left to report to.
            let _ = done.send((key, keep_going));
            let _ = waker.wake();
        });
        if !submitted {
            warn!("task queue full, dropping connection {key}");
            if let Some(slot) = self.connections.get_mut(key) {
                slot.busy = false;
                slot.dying = true;
            }
        }
    }

    /// Applies every completion the workers queued since the last wake.
    fn reap_completions(&mut self) {
        self.waker.drain();
        while let Ok((key, keep_going)) = self.done_rx.try_recv() {
            self.complete(key, keep_going);
        }
    }

    fn complete(&mut self, key: usize, keep_going: bool) {
        let conn = match self.connections.get_mut(key) {
            Some(slot) => {
                slot.busy = false;
                slot.conn.clone()
            }
            None => return,
        };
        if keep_going {
            match conn.lock().unwrap().rearm(&self.epoll) {
                Ok(()) => return,
                Err(err) => warn!("failed to re-arm connection {key}: {err}"),
            }
        }
        self.destroy(key);
    }

    /// Ends the batch by destroying every slot marked dying.
    fn sweep(&mut self) {
        let dying: Vec<usize> = self
            .connections
            .iter()
            .filter(|(_, slot)| slot.dying)
            .map(|(key, _)| key)
            .collect();
        for key in dying {
            self.destroy(key);
        }
    }

    fn destroy(&mut self, key: usize) {
        if !self.connections.contains(key) {
            return;
        }
        let slot = self.connections.remove(key);
        slot.conn.lock().unwrap().close(&self.epoll);
    }
}
