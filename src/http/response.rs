//! Response model and wire emission.

use std::fmt::Write;

use super::status::Status;

/// Parameters advertised in the `Keep-Alive` response header.
#[derive(Debug, Clone, Copy)]
pub struct KeepAlive {
    /// Per-request timeout in seconds.
    pub timeout: u64,
    /// Remaining retry budget of the connection.
    pub max: u32,
}

/// A response ready for emission.
///
/// Every response, error or not, goes through the same emission path and
/// carries the same header set in the same order.
#[derive(Debug)]
pub struct Response {
    status: Status,
    content_type: &'static str,
    body: Vec<u8>,
    keep_alive: Option<KeepAlive>,
}

impl Response {
    /// Creates a response with the given body. `keep_alive` of `None`
    /// announces `Connection: Close`.
    pub fn new(
        status: Status,
        content_type: &'static str,
        body: Vec<u8>,
        keep_alive: Option<KeepAlive>,
    ) -> Response {
        Response {
            status,
            content_type,
            body,
            keep_alive,
        }
    }

    /// Creates the fixed HTML error response for `status`.
    pub fn error(status: Status, keep_alive: Option<KeepAlive>) -> Response {
        let body = format!(
            "<html><title>{status}</title><body>{status}\
             <hr><em> Kiprey's Web Server</em></body></html>"
        );
        Response::new(status, "text/html", body.into_bytes(), keep_alive)
    }

    /// Serializes status line, headers, blank line and body.
    ///
    /// `include_body` is false for HEAD: the headers, including
    /// `Content-length`, are computed as for GET, but no body bytes follow
    /// the blank line.
    pub fn encode(&self, include_body: bool) -> Vec<u8> {
        let mut head = String::with_capacity(128 + self.body.len());
        let _ = write!(
            head,
            "HTTP/1.1 {} {}\r\n",
            self.status.code(),
            self.status.reason()
        );
        match self.keep_alive {
            Some(keep) => {
                head.push_str("Connection: Keep-Alive\r\n");
                let _ = write!(head, "Keep-Alive: timeout={}, max={}\r\n", keep.timeout, keep.max);
            }
            None => head.push_str("Connection: Close\r\n"),
        }
        head.push_str("Server: WebServer/1.1\r\n");
        let _ = write!(head, "Content-length: {}\r\n", self.body.len());
        let _ = write!(head, "Content-type: {}\r\n\r\n", self.content_type);

        let mut out = head.into_bytes();
        if include_body {
            out.extend_from_slice(&self.body);
        }
        out
    }
}
