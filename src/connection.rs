//! Per-connection HTTP state machine and static-file/CGI request handling.
//!
//! A `Connection` owns its client socket and its per-request timer. It is
//! re-entered by a worker on every readiness notification via
//! [`Connection::run_step`] and yields back as soon as it needs more input.
//! One-shot registrations guarantee that at most one worker runs a step at
//! any instant; the supervising thread only touches a connection while its
//! registrations are disarmed.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info, warn};

use crate::cgi;
use crate::config::Config;
use crate::http::method::Method;
use crate::http::mime;
use crate::http::request::Request;
use crate::http::response::{KeepAlive, Response};
use crate::http::status::Status;
use crate::http::{HttpError, ParseStatus};
use crate::poll::{Epoll, Interest, Token};
use crate::timer::Timer;

/// Seconds a single request may stay in flight before the connection is
/// torn down.
pub const PER_REQUEST_TIMEOUT: u64 = 10;
/// How many "need more data" yields a single request may consume before
/// the connection is dropped.
pub const MAX_RETRIES: u32 = 10;

const SCRATCH: usize = 1024;

/// Where the state machine currently is within one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Waiting for / parsing the request line.
    ParseUri,
    /// Parsing header lines up to the empty-line terminator.
    ParseHeader,
    /// Parsing a POST body of `content-length` bytes.
    ParseBody,
    /// Synthesizing and sending the response.
    Handle,
    /// A response went out; keep-alive policy decides what happens next.
    Finished,
    /// A protocol error was reported to the peer with an error response.
    SoftError,
    /// The connection is unusable and must be destroyed.
    FatalError,
}

/// State for one accepted client connection.
#[derive(Debug)]
pub struct Connection {
    stream: TcpStream,
    timer: Timer,
    key: usize,
    config: Arc<Config>,
    buf: Vec<u8>,
    pos: usize,
    phase: Phase,
    request: Request,
    keep_alive: bool,
    retries: u32,
    closed: bool,
}

fn client_interest() -> Interest {
    Interest::READABLE | Interest::EDGE | Interest::ONESHOT | Interest::PEER_CLOSED
}

fn timer_interest() -> Interest {
    Interest::READABLE | Interest::EDGE | Interest::ONESHOT
}

impl Connection {
    /// Binds a freshly accepted socket to a new connection, creating and
    /// arming its per-request timer.
    pub fn new(stream: TcpStream, key: usize, config: Arc<Config>) -> io::Result<Connection> {
        stream.set_nonblocking(true)?;
        let _ = stream.set_nodelay(true);
        let timer = Timer::new()?;
        timer.arm(PER_REQUEST_TIMEOUT, 0)?;

        if let (Ok(local), Ok(peer)) = (stream.local_addr(), stream.peer_addr()) {
            info!(
                "(socket {}) [server] {local} <---> [client] {peer}",
                stream.as_raw_fd()
            );
        }

        Ok(Connection {
            stream,
            timer,
            key,
            config,
            buf: Vec::new(),
            pos: 0,
            phase: Phase::ParseUri,
            request: Request::new(),
            keep_alive: true,
            retries: MAX_RETRIES,
            closed: false,
        })
    }

    /// Token identifying client-socket readiness for this connection.
    pub fn socket_token(&self) -> Token {
        Token((self.key as u64) << 1)
    }

    /// Token identifying timer expiry for this connection.
    pub fn timer_token(&self) -> Token {
        Token(((self.key as u64) << 1) | 1)
    }

    /// Registers socket and timer with the multiplexer, edge-triggered and
    /// one-shot. Undoes itself on failure.
    pub fn register(&self, epoll: &Epoll) -> io::Result<()> {
        epoll.add(
            self.stream.as_raw_fd(),
            self.socket_token(),
            client_interest(),
        )?;
        if let Err(err) = epoll.add(self.timer.fd(), self.timer_token(), timer_interest()) {
            let _ = epoll.delete(self.stream.as_raw_fd());
            return Err(err);
        }
        Ok(())
    }

    /// Disarms the timer registration so a pending timeout cannot tear the
    /// connection down while a worker runs it.
    pub fn disarm_timer(&self, epoll: &Epoll) -> io::Result<()> {
        epoll.modify(self.timer.fd(), self.timer_token(), Interest::NONE)
    }

    /// Restarts the countdown and re-arms both one-shot registrations.
    ///
    /// The timer descriptor is re-armed first: `timerfd_settime` clears any
    /// expiry that slipped in while the registration was disarmed, so a
    /// stale timeout can never fire against the next request.
    pub fn rearm(&self, epoll: &Epoll) -> io::Result<()> {
        self.timer.arm(PER_REQUEST_TIMEOUT, 0)?;
        epoll.modify(self.timer.fd(), self.timer_token(), timer_interest())?;
        epoll.modify(
            self.stream.as_raw_fd(),
            self.socket_token(),
            client_interest(),
        )
    }

    /// Removes both registrations from the multiplexer and cancels the
    /// timer. The descriptors themselves close when the connection is
    /// dropped, strictly after deregistration.
    pub fn close(&mut self, epoll: &Epoll) {
        if self.closed {
            return;
        }
        self.closed = true;
        let _ = epoll.delete(self.stream.as_raw_fd());
        let _ = epoll.delete(self.timer.fd());
        let _ = self.timer.cancel();
        info!("(socket {}) connection closed", self.stream.as_raw_fd());
    }

    /// Runs one step of the state machine: drain the socket, parse as far
    /// as the buffered bytes allow, and respond once a request is complete.
    ///
    /// Returns `true` when the connection wants to continue (the caller
    /// re-arms its registrations and releases it) and `false` when it is
    /// terminal and must be destroyed.
    pub fn run_step(&mut self) -> bool {
        if self.closed {
            return false;
        }
        if let Err(err) = self.fill() {
            debug!(
                "(socket {}) dropping connection: {err}",
                self.stream.as_raw_fd()
            );
            self.phase = Phase::FatalError;
            return false;
        }

        loop {
            match self.phase {
                Phase::ParseUri => {
                    match self.request.parse_request_line(
                        &self.config.document_root,
                        &self.buf,
                        &mut self.pos,
                    ) {
                        Ok(ParseStatus::Complete) => self.phase = Phase::ParseHeader,
                        Ok(ParseStatus::Partial) => return self.yield_for_more(),
                        Err(err) => return self.soft_error(err),
                    }
                }
                Phase::ParseHeader => match self.request.parse_headers(&self.buf, &mut self.pos) {
                    Ok(ParseStatus::Complete) => self.phase = Phase::ParseBody,
                    Ok(ParseStatus::Partial) => return self.yield_for_more(),
                    Err(err) => return self.soft_error(err),
                },
                Phase::ParseBody => {
                    if self.request.method == Some(Method::Post) {
                        match self.request.parse_body(&self.buf, &mut self.pos) {
                            Ok(ParseStatus::Complete) => self.phase = Phase::Handle,
                            Ok(ParseStatus::Partial) => return self.yield_for_more(),
                            Err(err) => return self.soft_error(err),
                        }
                    } else {
                        self.phase = Phase::Handle;
                    }
                }
                Phase::Handle => {
                    self.keep_alive = self.request.keep_alive();
                    match self.handle() {
                        Ok(response) => {
                            let include_body = self.request.method != Some(Method::Head);
                            if self.send(&response, include_body).is_err() {
                                return false;
                            }
                            self.phase = Phase::Finished;
                        }
                        Err(err) => return self.soft_error(err),
                    }
                }
                Phase::Finished => {
                    if self.keep_alive {
                        self.reset();
                        return true;
                    }
                    return false;
                }
                Phase::SoftError | Phase::FatalError => return false,
            }
        }
    }

    /// Reads everything currently available, non-blocking, into the
    /// receive buffer.
    fn fill(&mut self) -> io::Result<()> {
        let mut chunk = [0u8; SCRATCH];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "peer closed the connection",
                    ))
                }
                Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(err),
            }
        }
    }

    fn yield_for_more(&mut self) -> bool {
        self.retries -= 1;
        if self.retries == 0 {
            debug!(
                "(socket {}) retry budget exhausted, dropping",
                self.stream.as_raw_fd()
            );
            self.phase = Phase::FatalError;
            return false;
        }
        true
    }

    fn soft_error(&mut self, err: HttpError) -> bool {
        warn!(
            "(socket {}) {err}, responding {}",
            self.stream.as_raw_fd(),
            err.status()
        );
        self.phase = Phase::SoftError;
        let response = Response::error(err.status(), self.keep_alive_params());
        let include_body = self.request.method != Some(Method::Head);
        if self.send(&response, include_body).is_err() {
            return false;
        }
        if self.keep_alive {
            self.reset();
            return true;
        }
        false
    }

    fn keep_alive_params(&self) -> Option<KeepAlive> {
        self.keep_alive.then_some(KeepAlive {
            timeout: PER_REQUEST_TIMEOUT,
            max: self.retries,
        })
    }

    fn handle(&mut self) -> Result<Response, HttpError> {
        let path = self.resolve_path()?;
        match self.request.method {
            Some(Method::Get) | Some(Method::Head) => self.serve_file(&path),
            Some(Method::Post) => self.run_cgi(&path),
            // The request line parser rejects everything else first.
            None => Err(HttpError::InternalServerError),
        }
    }

    /// Resolves the requested path against the filesystem: directories are
    /// served through their `index.html`, and a resolved path escaping the
    /// document root reads as absent.
    fn resolve_path(&self) -> Result<PathBuf, HttpError> {
        let root = fs::canonicalize(&self.config.document_root)
            .map_err(|_| HttpError::InternalServerError)?;
        let mut path = fs::canonicalize(&self.request.path).map_err(stat_error)?;
        if !path.starts_with(&root) {
            warn!(
                "(socket {}) {} escapes the document root",
                self.stream.as_raw_fd(),
                self.request.path
            );
            return Err(HttpError::NotFound);
        }
        let meta = fs::metadata(&path).map_err(stat_error)?;
        if meta.is_dir() {
            path.push("index.html");
        }
        Ok(path)
    }

    fn serve_file(&self, path: &Path) -> Result<Response, HttpError> {
        let file = File::open(path).map_err(stat_error)?;
        let len = file
            .metadata()
            .map_err(|_| HttpError::InternalServerError)?
            .len() as usize;
        let body = if len == 0 {
            Vec::new()
        } else {
            let map = Mmap::new(&file, len).map_err(|err| {
                warn!("(socket {}) mmap failed: {err}", self.stream.as_raw_fd());
                HttpError::InternalServerError
            })?;
            map.bytes().to_vec()
        };

        let content_type = mime::content_type(path.to_str().unwrap_or(&self.request.path));
        Ok(Response::new(
            Status::Ok,
            content_type,
            body,
            self.keep_alive_params(),
        ))
    }

    fn run_cgi(&self, path: &Path) -> Result<Response, HttpError> {
        let output = cgi::run(path, &self.request.body).map_err(|err| {
            warn!("(socket {}) cgi failed: {err}", self.stream.as_raw_fd());
            HttpError::InternalServerError
        })?;
        if output.is_empty() {
            return Err(HttpError::InternalServerError);
        }
        Ok(Response::new(
            Status::Ok,
            "text/plain",
            output,
            self.keep_alive_params(),
        ))
    }

    fn send(&mut self, response: &Response, include_body: bool) -> io::Result<()> {
        let bytes = response.encode(include_body);
        if let Err(err) = write_all(&mut self.stream, &bytes) {
            warn!(
                "(socket {}) sending response failed: {err}",
                self.stream.as_raw_fd()
            );
            self.phase = Phase::FatalError;
            return Err(err);
        }
        info!(
            "(socket {}) {} {} -> {}",
            self.stream.as_raw_fd(),
            self.request
                .method
                .map(|m| m.to_string())
                .unwrap_or_default(),
            self.request.path,
            // encode always begins with "HTTP/1.1 XXX".
            String::from_utf8_lossy(&bytes[9..12]),
        );
        Ok(())
    }

    /// Forgets the completed request so the next one starts clean: consumed
    /// bytes leave the buffer, the cursor returns to zero, and the timer
    /// restarts.
    fn reset(&mut self) {
        self.buf.drain(..self.pos);
        self.pos = 0;
        self.request.clear();
        self.phase = Phase::ParseUri;
        self.retries = MAX_RETRIES;
        self.keep_alive = true;
        let _ = self.timer.arm(PER_REQUEST_TIMEOUT, 0);
    }
}

fn stat_error(err: io::Error) -> HttpError {
    if err.kind() == io::ErrorKind::NotFound {
        HttpError::NotFound
    } else {
        HttpError::InternalServerError
    }
}

/// Blocking full write over a non-blocking socket: short writes, signal
/// interruptions and would-block conditions are retried until every byte is
/// out or a hard error occurs.
fn write_all(stream: &mut TcpStream, bytes: &[u8]) -> io::Result<()> {
    let mut written = 0;
    while written < bytes.len() {
        match stream.write(&bytes[written..]) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "peer stopped accepting bytes",
                ))
            }
            Ok(n) => written += n,
            Err(ref err)
                if err.kind() == io::ErrorKind::WouldBlock
                    || err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

/// Read-only private mapping of a served file.
struct Mmap {
    ptr: *mut libc::c_void,
    len: usize,
}

impl Mmap {
    fn new(file: &File, len: usize) -> io::Result<Mmap> {
        // SAFETY: maps `len` bytes of an open file read-only; the mapping
        // owns no borrow of the file once established.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ,
                libc::MAP_PRIVATE,
                file.as_raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(Mmap { ptr, len })
    }

    fn bytes(&self) -> &[u8] {
        // SAFETY: the mapping covers exactly `len` readable bytes for the
        // lifetime of `self`.
        unsafe { std::slice::from_raw_parts(self.ptr as *const u8, self.len) }
    }
}

impl Drop for Mmap {
    fn drop(&mut self) {
        // SAFETY: unmaps the region mapped in `new`.
        unsafe {
            libc::munmap(self.ptr, self.len);
        }
    }
}

#[cfg(test)]
mod test {
    use super::{Connection, MAX_RETRIES};
    use crate::config::Config;
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn stream_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    fn config_for(root: &std::path::Path) -> Arc<Config> {
        Arc::new(Config {
            port: 0,
            document_root: root.to_str().unwrap().to_string(),
            worker_count: 1,
            max_queue: None,
        })
    }

    fn settle() {
        // Give loopback TCP a moment to deliver what the peer wrote.
        thread::sleep(Duration::from_millis(100));
    }

    #[test]
    fn complete_get_produces_exact_response_and_keeps_alive() {
        let root = tempfile::tempdir().unwrap();
        std::fs::write(root.path().join("a.txt"), b"hi").unwrap();

        let (mut client, server) = stream_pair();
        let mut conn = Connection::new(server, 0, config_for(root.path())).unwrap();

        client
            .write_all(b"GET /a.txt HTTP/1.1\r\nHost: x\r\n\r\n")
            .unwrap();
        settle();
        assert!(conn.run_step());

        let expected = b"HTTP/1.1 200 OK\r\n\
            Connection: Keep-Alive\r\n\
            Keep-Alive: timeout=10, max=10\r\n\
            Server: WebServer/1.1\r\n\
            Content-length: 2\r\n\
            Content-type: text/plain\r\n\r\nhi";
        let mut got = vec![0u8; expected.len()];
        client.read_exact(&mut got).unwrap();
        assert_eq!(expected.to_vec(), got);
    }

    #[test]
    fn connection_close_header_finishes_the_connection() {
        let root = tempfile::tempdir().unwrap();
        std::fs::write(root.path().join("a.txt"), b"hi").unwrap();

        let (mut client, server) = stream_pair();
        let mut conn = Connection::new(server, 0, config_for(root.path())).unwrap();

        client
            .write_all(b"GET /a.txt HTTP/1.1\r\nConnection: close\r\n\r\n")
            .unwrap();
        settle();
        assert!(!conn.run_step());

        client
            .set_read_timeout(Some(Duration::from_millis(500)))
            .unwrap();
        let mut got = Vec::new();
        let mut chunk = [0u8; 4096];
        while let Ok(n) = client.read(&mut chunk) {
            if n == 0 {
                break;
            }
            got.extend_from_slice(&chunk[..n]);
        }
        let got = String::from_utf8(got).unwrap();
        assert!(got.starts_with("HTTP/1.1 200 OK\r\nConnection: Close\r\n"));
        assert!(!got.contains("Keep-Alive:"));
    }

    #[test]
    fn missing_file_is_reported_as_404() {
        let root = tempfile::tempdir().unwrap();
        let (mut client, server) = stream_pair();
        let mut conn = Connection::new(server, 0, config_for(root.path())).unwrap();

        client.write_all(b"GET /missing HTTP/1.1\r\n\r\n").unwrap();
        settle();
        // A soft error keeps an HTTP/1.1 connection alive.
        assert!(conn.run_step());

        let mut head = [0u8; 24];
        client.read_exact(&mut head).unwrap();
        assert_eq!(b"HTTP/1.1 404 Not Found\r\n", &head);
    }

    #[test]
    fn path_escaping_the_document_root_reads_as_absent() {
        let root = tempfile::tempdir().unwrap();
        let inner = root.path().join("www");
        std::fs::create_dir(&inner).unwrap();
        std::fs::write(root.path().join("secret.txt"), b"no").unwrap();

        let (mut client, server) = stream_pair();
        let mut conn = Connection::new(server, 0, config_for(&inner)).unwrap();

        client
            .write_all(b"GET /../secret.txt HTTP/1.1\r\n\r\n")
            .unwrap();
        settle();
        assert!(conn.run_step());

        let mut head = [0u8; 24];
        client.read_exact(&mut head).unwrap();
        assert_eq!(b"HTTP/1.1 404 Not Found\r\n", &head);
    }

    #[test]
    fn post_without_content_length_is_411() {
        let root = tempfile::tempdir().unwrap();
        let (mut client, server) = stream_pair();
        let mut conn = Connection::new(server, 0, config_for(root.path())).unwrap();

        client.write_all(b"POST /cgi HTTP/1.1\r\n\r\n").unwrap();
        settle();
        assert!(conn.run_step());

        let mut head = [0u8; 30];
        client.read_exact(&mut head).unwrap();
        assert_eq!(b"HTTP/1.1 411 Length Required\r\n", &head);
    }

    #[test]
    fn retry_budget_exhaustion_closes_without_a_response() {
        let root = tempfile::tempdir().unwrap();
        let (mut client, server) = stream_pair();
        let mut conn = Connection::new(server, 0, config_for(root.path())).unwrap();

        // A request line that never completes: every step is a
        // "need more data" outcome.
        client.write_all(b"G").unwrap();
        settle();
        for _ in 0..MAX_RETRIES - 1 {
            assert!(conn.run_step());
        }
        assert!(!conn.run_step());

        client
            .set_read_timeout(Some(Duration::from_millis(200)))
            .unwrap();
        let mut chunk = [0u8; 16];
        // No response bytes were ever emitted.
        assert!(client.read(&mut chunk).is_err());
    }

    #[test]
    fn keep_alive_serves_two_sequential_requests() {
        let root = tempfile::tempdir().unwrap();
        std::fs::write(root.path().join("a.txt"), b"hi").unwrap();

        let (mut client, server) = stream_pair();
        let mut conn = Connection::new(server, 0, config_for(root.path())).unwrap();

        let request = b"GET /a.txt HTTP/1.1\r\n\r\n";
        let expected = b"HTTP/1.1 200 OK\r\n\
            Connection: Keep-Alive\r\n\
            Keep-Alive: timeout=10, max=10\r\n\
            Server: WebServer/1.1\r\n\
            Content-length: 2\r\n\
            Content-type: text/plain\r\n\r\nhi";

        for _ in 0..2 {
            client.write_all(request).unwrap();
            settle();
            assert!(conn.run_step());
            let mut got = vec![0u8; expected.len()];
            client.read_exact(&mut got).unwrap();
            assert_eq!(expected.to_vec(), got);
        }
    }

    #[test]
    fn head_sends_get_headers_without_body() {
        let root = tempfile::tempdir().unwrap();
        std::fs::write(root.path().join("a.txt"), b"hi").unwrap();

        let (mut client, server) = stream_pair();
        let mut conn = Connection::new(server, 0, config_for(root.path())).unwrap();

        client.write_all(b"HEAD /a.txt HTTP/1.1\r\n\r\n").unwrap();
        settle();
        assert!(conn.run_step());

        let expected = b"HTTP/1.1 200 OK\r\n\
            Connection: Keep-Alive\r\n\
            Keep-Alive: timeout=10, max=10\r\n\
            Server: WebServer/1.1\r\n\
            Content-length: 2\r\n\
            Content-type: text/plain\r\n\r\n";
        let mut got = vec![0u8; expected.len()];
        client.read_exact(&mut got).unwrap();
        assert_eq!(expected.to_vec(), got);

        // Nothing follows the blank line.
        client
            .set_read_timeout(Some(Duration::from_millis(200)))
            .unwrap();
        let mut chunk = [0u8; 4];
        assert!(client.read(&mut chunk).is_err());
    }

    #[test]
    fn peer_close_is_fatal() {
        let root = tempfile::tempdir().unwrap();
        let (client, server) = stream_pair();
        let mut conn = Connection::new(server, 0, config_for(root.path())).unwrap();

        drop(client);
        settle();
        assert!(!conn.run_step());
    }
}
