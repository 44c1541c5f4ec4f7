// src/conn.rs
//
// One Conn per accepted socket. The reactor drains bytes into `read_buf`,
// a worker drives the parse-then-respond pipeline over those bytes, and the
// reactor performs the vectored write. The oneshot re-arm discipline
// guarantees at most one of those threads touches the Conn between an
// event delivery and the next re-arm.

use std::fs::File;
use std::io::{self, Write};
use std::net::SocketAddr;
use std::os::fd::AsRawFd;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::time::SystemTime;

use tracing::debug;

use crate::parser::{self, HeaderField, HttpCode, LineStatus};
use crate::server::ServerCtx;
use crate::syscalls::{self, Mmap};

pub const READ_BUF_SIZE: usize = 2048;
pub const WRITE_BUF_SIZE: usize = 1024;

const ERROR_BODY_400: &str = "Your request has bad syntax or is inherently impossible to satisfy.\n";
const ERROR_BODY_403: &str = "You do not have permission to get file from this server.\n";
const ERROR_BODY_404: &str = "The requested file was not found on this server.\n";
const ERROR_BODY_500: &str = "There was an unusual problem serving the requested file.\n";

/// Main state machine position while parsing a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckState {
    RequestLine,
    Headers,
    Content,
}

pub struct Conn {
    pub fd: i32,
    pub peer: SocketAddr,

    read_buf: [u8; READ_BUF_SIZE],
    /// Bytes received so far.
    read_idx: usize,
    /// Bytes scanned by the tokenizer. 0 <= check_idx <= read_idx.
    check_idx: usize,
    /// Start of the line currently being tokenized.
    line_start_idx: usize,
    state: CheckState,

    // Parsed request fields.
    path: String,
    host: String,
    keep_alive: bool,
    content_len: usize,

    // File response state. `mapping` is Some only while a file response is
    // in flight; dropping it releases the mapping on every exit path.
    file_len: usize,
    mapping: Option<Mmap>,

    // Status line + headers (+ error body) staged for the response.
    write_buf: [u8; WRITE_BUF_SIZE],
    write_idx: usize,

    // Vectored-write progress: segment 0 is write_buf, segment 1 the mapping.
    header_sent: usize,
    file_sent: usize,
    bytes_left: usize,
}

impl Conn {
    pub fn new(fd: i32, peer: SocketAddr) -> Self {
        let mut conn = Self {
            fd,
            peer,
            read_buf: [0; READ_BUF_SIZE],
            read_idx: 0,
            check_idx: 0,
            line_start_idx: 0,
            state: CheckState::RequestLine,
            path: String::new(),
            host: String::new(),
            keep_alive: false,
            content_len: 0,
            file_len: 0,
            mapping: None,
            write_buf: [0; WRITE_BUF_SIZE],
            write_idx: 0,
            header_sent: 0,
            file_sent: 0,
            bytes_left: 0,
        };
        conn.reset();
        conn
    }

    /// Rebind a reused slot to a freshly accepted socket.
    pub fn reinit(&mut self, fd: i32, peer: SocketAddr) {
        self.fd = fd;
        self.peer = peer;
        self.reset();
    }

    /// Back to the initial parser state: on creation and after a completed
    /// keep-alive cycle. Buffers are not zeroed; the cursors make stale
    /// bytes unreachable.
    pub fn reset(&mut self) {
        self.read_idx = 0;
        self.check_idx = 0;
        self.line_start_idx = 0;
        self.state = CheckState::RequestLine;
        self.path.clear();
        self.host.clear();
        self.keep_alive = false;
        self.content_len = 0;
        self.file_len = 0;
        self.mapping = None;
        self.write_idx = 0;
        self.header_sent = 0;
        self.file_sent = 0;
        self.bytes_left = 0;
    }

    /// Drain the socket into the read buffer (edge-triggered: keep reading
    /// until WouldBlock or the buffer is exhausted). Returns false on a
    /// hard error, peer close, or an already-full buffer.
    pub fn read(&mut self) -> bool {
        if self.read_idx >= READ_BUF_SIZE {
            return false;
        }
        loop {
            match syscalls::recv_nonblocking(self.fd, &mut self.read_buf[self.read_idx..]) {
                Ok(None) => break,
                Ok(Some(0)) => return false,
                Ok(Some(n)) => {
                    self.read_idx += n;
                    if self.read_idx >= READ_BUF_SIZE {
                        break;
                    }
                }
                Err(_) => return false,
            }
        }
        true
    }

    /// The full parse-then-respond pipeline, run by a worker. Ends by
    /// re-arming the connection for read (need more data) or write
    /// (response staged). Returns false when the connection must close.
    pub fn process(&mut self, ctx: &ServerCtx) -> bool {
        let mut code = self.process_read();
        if code == HttpCode::NoRequest {
            return ctx.epoll.rearm_read(self.fd).is_ok();
        }

        ctx.metrics.inc_req();
        if code == HttpCode::GetRequest {
            code = self.resolve_file(&ctx.document_root);
        }
        debug!(fd = self.fd, peer = %self.peer, ?code, path = %self.path, "request processed");

        if !self.build_response(code) {
            return false;
        }
        ctx.epoll.rearm_write(self.fd).is_ok()
    }

    /// Drive the state machine over already-buffered bytes only.
    fn process_read(&mut self) -> HttpCode {
        loop {
            if self.state == CheckState::Content {
                // Body bytes are length-checked, never interpreted. A length
                // that overflows the cursor can never be satisfied.
                let Some(body_end) = self.check_idx.checked_add(self.content_len) else {
                    return HttpCode::BadRequest;
                };
                if self.read_idx >= body_end {
                    self.check_idx += self.content_len;
                    self.line_start_idx = self.check_idx;
                    return HttpCode::GetRequest;
                }
                return HttpCode::NoRequest;
            }

            let status = parser::parse_line(
                &self.read_buf,
                &mut self.check_idx,
                self.read_idx,
                self.line_start_idx,
            );
            let (start, end) = match status {
                LineStatus::Open => return HttpCode::NoRequest,
                LineStatus::Bad => return HttpCode::BadRequest,
                LineStatus::Complete { start, end } => (start, end),
            };
            self.line_start_idx = self.check_idx;

            match self.state {
                CheckState::RequestLine => {
                    let parsed = parser::parse_request_line(&self.read_buf[start..end])
                        .map(str::to_owned);
                    match parsed {
                        Ok(path) => {
                            self.path = path;
                            self.state = CheckState::Headers;
                        }
                        Err(code) => return code,
                    }
                }
                CheckState::Headers => {
                    match parser::parse_header_line(&self.read_buf[start..end]) {
                        Err(code) => return code,
                        Ok(HeaderField::End) => {
                            if self.content_len > 0 {
                                self.state = CheckState::Content;
                            } else {
                                return HttpCode::GetRequest;
                            }
                        }
                        Ok(HeaderField::Host(h)) => {
                            self.host.clear();
                            self.host.push_str(h);
                        }
                        Ok(HeaderField::Connection(v)) => {
                            if v.eq_ignore_ascii_case("keep-alive") {
                                self.keep_alive = true;
                            }
                        }
                        Ok(HeaderField::ContentLength(n)) => self.content_len = n,
                        Ok(HeaderField::Other) => {}
                    }
                }
                CheckState::Content => return HttpCode::InternalError,
            }
        }
    }

    /// Resolve the parsed path under the document root, check the file, and
    /// map it read-only. The mapping stays valid after the fd closes.
    fn resolve_file(&mut self, root: &Path) -> HttpCode {
        let rel = if self.path == "/" { "/index.html" } else { self.path.as_str() };
        let target = root.join(rel.trim_start_matches('/'));

        let target = match target.canonicalize() {
            Ok(t) => t,
            Err(_) => return HttpCode::NoResource,
        };
        let root = match root.canonicalize() {
            Ok(r) => r,
            Err(_) => return HttpCode::InternalError,
        };
        // Containment: a traversal sequence that escapes the root is forbidden.
        if !target.starts_with(&root) {
            return HttpCode::ForbiddenRequest;
        }

        let meta = match std::fs::metadata(&target) {
            Ok(m) => m,
            Err(_) => return HttpCode::NoResource,
        };
        if meta.mode() & libc::S_IROTH == 0 {
            return HttpCode::ForbiddenRequest;
        }
        if meta.is_dir() {
            return HttpCode::BadRequest;
        }

        let file = match File::open(&target) {
            Ok(f) => f,
            Err(_) => return HttpCode::NoResource,
        };
        self.file_len = meta.len() as usize;
        if self.file_len > 0 {
            match Mmap::map_readonly(file.as_raw_fd(), self.file_len) {
                Ok(m) => self.mapping = Some(m),
                Err(_) => return HttpCode::InternalError,
            }
        }
        HttpCode::FileRequest
    }

    /// Stage the status line and headers (plus a literal HTML body for
    /// error outcomes) and set up the 2-segment vectored descriptor.
    fn build_response(&mut self, code: HttpCode) -> bool {
        self.write_idx = 0;
        self.header_sent = 0;
        self.file_sent = 0;
        match code {
            HttpCode::FileRequest => {
                let ok = self.add_status_line(200, "OK") && self.add_headers(self.file_len);
                if !ok {
                    return false;
                }
                self.bytes_left = self.write_idx + self.file_len;
                true
            }
            HttpCode::BadRequest => self.error_response(400, "Bad Request", ERROR_BODY_400),
            HttpCode::ForbiddenRequest => self.error_response(403, "Forbidden", ERROR_BODY_403),
            HttpCode::NoResource => self.error_response(404, "Not Found", ERROR_BODY_404),
            _ => self.error_response(500, "Internal Error", ERROR_BODY_500),
        }
    }

    /// One best-effort error response; the connection closes after it is
    /// sent, regardless of any negotiated keep-alive.
    fn error_response(&mut self, status: u16, title: &str, body: &str) -> bool {
        self.keep_alive = false;
        self.mapping = None;
        self.file_len = 0;
        let ok = self.add_status_line(status, title)
            && self.add_headers(body.len())
            && self.add_bytes(body.as_bytes());
        if !ok {
            return false;
        }
        self.bytes_left = self.write_idx;
        true
    }

    fn add_status_line(&mut self, status: u16, title: &str) -> bool {
        self.add_fmt(format_args!("HTTP/1.1 {} {}\r\n", status, title))
    }

    fn add_headers(&mut self, content_len: usize) -> bool {
        self.add_fmt(format_args!("Content-Length: {}\r\n", content_len))
            && self.add_bytes(b"Content-Type: text/html\r\n")
            && self.add_fmt(format_args!(
                "Date: {}\r\n",
                httpdate::fmt_http_date(SystemTime::now())
            ))
            && self.add_fmt(format_args!(
                "Connection: {}\r\n",
                if self.keep_alive { "keep-alive" } else { "close" }
            ))
            && self.add_bytes(b"\r\n")
    }

    fn add_bytes(&mut self, bytes: &[u8]) -> bool {
        if self.write_idx + bytes.len() > WRITE_BUF_SIZE {
            return false;
        }
        self.write_buf[self.write_idx..self.write_idx + bytes.len()].copy_from_slice(bytes);
        self.write_idx += bytes.len();
        true
    }

    fn add_fmt(&mut self, args: std::fmt::Arguments<'_>) -> bool {
        let mut cursor = io::Cursor::new(&mut self.write_buf[self.write_idx..]);
        if write!(cursor, "{}", args).is_err() {
            return false;
        }
        self.write_idx += cursor.position() as usize;
        true
    }

    /// Continue the vectored write. Run on the reactor thread on writable
    /// events. Returns false when the connection must close (send complete
    /// without keep-alive, or a hard write error).
    pub fn write(&mut self, ctx: &ServerCtx) -> bool {
        loop {
            let header = &self.write_buf[self.header_sent..self.write_idx];
            let file: &[u8] = match &self.mapping {
                Some(m) => &m.as_slice()[self.file_sent..],
                None => &[],
            };

            match syscalls::writev_nonblocking(self.fd, &[header, file]) {
                Ok(None) => {
                    // Kernel buffer full: resume on the next writable event.
                    return ctx.epoll.rearm_write(self.fd).is_ok();
                }
                Ok(Some(n)) => {
                    ctx.metrics.add_bytes(n as u64);
                    self.bytes_left -= n;

                    // Segment 0 shrinks first; the overflow advances segment 1.
                    let header_remaining = self.write_idx - self.header_sent;
                    if n < header_remaining {
                        self.header_sent += n;
                    } else {
                        self.file_sent += n - header_remaining;
                        self.header_sent = self.write_idx;
                    }

                    if self.bytes_left == 0 {
                        self.mapping = None;
                        if self.keep_alive {
                            self.reset();
                            return ctx.epoll.rearm_read(self.fd).is_ok();
                        }
                        return false;
                    }
                }
                Err(_) => {
                    self.mapping = None;
                    return false;
                }
            }
        }
    }

    /// Tear the connection down: deregister, close the socket, release the
    /// mapping, decrement the live-connection count. Safe to call twice.
    pub fn close(&mut self, ctx: &ServerCtx) {
        if self.fd == -1 {
            return;
        }
        debug!(fd = self.fd, peer = %self.peer, "closing connection");
        ctx.epoll.delete(self.fd).ok();
        unsafe {
            libc::close(self.fd);
        }
        self.fd = -1;
        self.mapping = None;
        ctx.metrics.dec_conn();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::net::{Ipv4Addr, SocketAddrV4};
    use std::os::unix::fs::PermissionsExt;
    use std::path::PathBuf;

    fn dummy_conn() -> Conn {
        Conn::new(-1, SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0)))
    }

    fn feed(conn: &mut Conn, bytes: &[u8]) {
        conn.read_buf[conn.read_idx..conn.read_idx + bytes.len()].copy_from_slice(bytes);
        conn.read_idx += bytes.len();
    }

    fn staged(conn: &Conn) -> &str {
        std::str::from_utf8(&conn.write_buf[..conn.write_idx]).unwrap()
    }

    struct TestRoot {
        dir: PathBuf,
    }

    impl TestRoot {
        fn new(tag: &str) -> Self {
            let dir = std::env::temp_dir().join(format!("etude-{}-{}", tag, std::process::id()));
            fs::create_dir_all(&dir).unwrap();
            Self { dir }
        }

        fn file(&self, name: &str, contents: &[u8]) -> PathBuf {
            let path = self.dir.join(name);
            fs::write(&path, contents).unwrap();
            path
        }
    }

    impl Drop for TestRoot {
        fn drop(&mut self) {
            fs::remove_dir_all(&self.dir).ok();
        }
    }

    #[test]
    fn complete_request_parses_to_get() {
        let mut conn = dummy_conn();
        feed(&mut conn, b"GET /hello.html HTTP/1.1\r\nHost: x\r\n\r\n");
        assert_eq!(conn.process_read(), HttpCode::GetRequest);
        assert_eq!(conn.path, "/hello.html");
        assert_eq!(conn.host, "x");
        assert!(!conn.keep_alive);
    }

    #[test]
    fn partial_request_needs_more_data() {
        let mut conn = dummy_conn();
        feed(&mut conn, b"GET /hello.html HTTP/1.1\r\nHost: x\r");
        assert_eq!(conn.process_read(), HttpCode::NoRequest);

        // The rest arrives on a later readable event, terminator split.
        feed(&mut conn, b"\nConnection: keep-alive\r\n\r\n");
        assert_eq!(conn.process_read(), HttpCode::GetRequest);
        assert!(conn.keep_alive);
    }

    #[test]
    fn post_is_a_bad_request() {
        let mut conn = dummy_conn();
        feed(&mut conn, b"POST / HTTP/1.1\r\n\r\n");
        assert_eq!(conn.process_read(), HttpCode::BadRequest);
    }

    #[test]
    fn oversized_content_length_is_a_bad_request() {
        let mut conn = dummy_conn();
        feed(
            &mut conn,
            b"GET / HTTP/1.1\r\nContent-Length: 18446744073709551615\r\n\r\n",
        );
        assert_eq!(conn.process_read(), HttpCode::BadRequest);
    }

    #[test]
    fn body_is_length_checked_only() {
        let mut conn = dummy_conn();
        feed(&mut conn, b"GET / HTTP/1.1\r\nContent-Length: 5\r\n\r\nab");
        assert_eq!(conn.process_read(), HttpCode::NoRequest);
        feed(&mut conn, b"cde");
        assert_eq!(conn.process_read(), HttpCode::GetRequest);
    }

    #[test]
    fn reset_clears_residual_state_for_keep_alive() {
        let mut conn = dummy_conn();
        feed(
            &mut conn,
            b"GET /a HTTP/1.1\r\nHost: h\r\nConnection: keep-alive\r\nContent-Length: 3\r\n\r\nxyz",
        );
        assert_eq!(conn.process_read(), HttpCode::GetRequest);
        assert!(conn.keep_alive);
        assert_eq!(conn.content_len, 3);

        conn.reset();
        feed(&mut conn, b"GET /b HTTP/1.1\r\n\r\n");
        assert_eq!(conn.process_read(), HttpCode::GetRequest);
        assert_eq!(conn.path, "/b");
        assert_eq!(conn.host, "");
        assert_eq!(conn.content_len, 0);
        assert!(!conn.keep_alive);
    }

    #[test]
    fn resolve_serves_existing_file() {
        let root = TestRoot::new("resolve-ok");
        root.file("hello.html", b"<h1>hi</h1>");

        let mut conn = dummy_conn();
        conn.path = "/hello.html".to_string();
        assert_eq!(conn.resolve_file(&root.dir), HttpCode::FileRequest);
        assert_eq!(conn.file_len, 11);
        assert_eq!(conn.mapping.as_ref().unwrap().as_slice(), b"<h1>hi</h1>");
    }

    #[test]
    fn resolve_maps_slash_to_index() {
        let root = TestRoot::new("resolve-index");
        root.file("index.html", b"home");

        let mut conn = dummy_conn();
        conn.path = "/".to_string();
        assert_eq!(conn.resolve_file(&root.dir), HttpCode::FileRequest);
        assert_eq!(conn.file_len, 4);
    }

    #[test]
    fn resolve_missing_file_is_no_resource() {
        let root = TestRoot::new("resolve-missing");
        let mut conn = dummy_conn();
        conn.path = "/nope.html".to_string();
        assert_eq!(conn.resolve_file(&root.dir), HttpCode::NoResource);
    }

    #[test]
    fn resolve_unreadable_file_is_forbidden() {
        let root = TestRoot::new("resolve-forbidden");
        let secret = root.file("secret.html", b"top secret");
        fs::set_permissions(&secret, fs::Permissions::from_mode(0o200)).unwrap();

        let mut conn = dummy_conn();
        conn.path = "/secret.html".to_string();
        assert_eq!(conn.resolve_file(&root.dir), HttpCode::ForbiddenRequest);
    }

    #[test]
    fn resolve_directory_is_bad_request() {
        let root = TestRoot::new("resolve-dir");
        fs::create_dir_all(root.dir.join("sub")).unwrap();

        let mut conn = dummy_conn();
        conn.path = "/sub".to_string();
        assert_eq!(conn.resolve_file(&root.dir), HttpCode::BadRequest);
    }

    #[test]
    fn resolve_blocks_traversal_out_of_root() {
        let root = TestRoot::new("resolve-traversal");
        root.file("inside.html", b"fine");

        let mut conn = dummy_conn();
        conn.path = "/../../etc/passwd".to_string();
        let code = conn.resolve_file(&root.dir);
        assert!(
            code == HttpCode::ForbiddenRequest || code == HttpCode::NoResource,
            "traversal must not resolve, got {:?}",
            code
        );
        assert!(conn.mapping.is_none());
    }

    #[test]
    fn zero_length_file_served_without_mapping() {
        let root = TestRoot::new("resolve-empty");
        root.file("empty.html", b"");

        let mut conn = dummy_conn();
        conn.path = "/empty.html".to_string();
        assert_eq!(conn.resolve_file(&root.dir), HttpCode::FileRequest);
        assert!(conn.mapping.is_none());
        assert!(conn.build_response(HttpCode::FileRequest));
        assert!(staged(&conn).contains("Content-Length: 0\r\n"));
        assert_eq!(conn.bytes_left, conn.write_idx);
    }

    #[test]
    fn file_response_headers_and_segments() {
        let root = TestRoot::new("build-file");
        root.file("page.html", b"0123456789");

        let mut conn = dummy_conn();
        conn.path = "/page.html".to_string();
        conn.keep_alive = true;
        assert_eq!(conn.resolve_file(&root.dir), HttpCode::FileRequest);
        assert!(conn.build_response(HttpCode::FileRequest));

        let head = staged(&conn);
        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(head.contains("Content-Length: 10\r\n"));
        assert!(head.contains("Content-Type: text/html\r\n"));
        assert!(head.contains("Connection: keep-alive\r\n"));
        assert!(head.contains("Date: "));
        assert!(head.ends_with("\r\n\r\n"));
        assert_eq!(conn.bytes_left, conn.write_idx + 10);
    }

    #[test]
    fn error_response_closes_even_if_keep_alive_was_negotiated() {
        let mut conn = dummy_conn();
        conn.keep_alive = true;
        assert!(conn.build_response(HttpCode::NoResource));

        let head = staged(&conn);
        assert!(head.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(head.contains("Connection: close\r\n"));
        assert!(head.ends_with(ERROR_BODY_404));
        assert!(!conn.keep_alive);
        assert_eq!(conn.bytes_left, conn.write_idx);
    }

    #[test]
    fn error_responses_carry_fixed_bodies() {
        for (code, status, body) in [
            (HttpCode::BadRequest, "400 Bad Request", ERROR_BODY_400),
            (HttpCode::ForbiddenRequest, "403 Forbidden", ERROR_BODY_403),
            (HttpCode::NoResource, "404 Not Found", ERROR_BODY_404),
            (HttpCode::InternalError, "500 Internal Error", ERROR_BODY_500),
        ] {
            let mut conn = dummy_conn();
            assert!(conn.build_response(code));
            let head = staged(&conn);
            assert!(head.contains(status), "{:?} missing {}", code, status);
            assert!(head.contains(&format!("Content-Length: {}\r\n", body.len())));
            assert!(head.ends_with(body));
        }
    }
}
