// src/parser.rs
//
// The tokenizer and sub-parsers of the HTTP request state machine. All of
// them operate on the connection's raw read buffer via offset cursors; no
// byte is ever rewritten in place, and no socket I/O happens here.

/// Verdict of one tokenizer scan over `[check_idx, read_idx)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineStatus {
    /// A full CRLF-terminated line: the byte range of its content,
    /// terminator excluded. `check_idx` has been advanced past the
    /// terminator.
    Complete { start: usize, end: usize },
    /// No complete terminator yet; cursors are left where more data can
    /// resume the scan (a terminator split across two reads is fine).
    Open,
    /// Malformed terminator placement.
    Bad,
}

/// Outcome of driving the request state machine over buffered bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpCode {
    /// Request incomplete, need more data.
    NoRequest,
    /// A complete request was parsed.
    GetRequest,
    /// Syntactically invalid request.
    BadRequest,
    /// Target file does not exist.
    NoResource,
    /// Target exists but is not accessible.
    ForbiddenRequest,
    /// File resolved and mapped, response ready to build.
    FileRequest,
    /// Internal invariant violation.
    InternalError,
}

/// Extract one logical line. Scans forward from `*check_idx` up to
/// `read_idx`; `line_start` is where the current line began.
///
/// A `\r` as the last received byte leaves the cursor on it and reports
/// `Open` so the scan resumes once the `\n` arrives. A bare `\n` directly
/// preceded by `\r` is accepted leniently; any other stray `\r`/`\n` is
/// malformed.
pub fn parse_line(
    buf: &[u8],
    check_idx: &mut usize,
    read_idx: usize,
    line_start: usize,
) -> LineStatus {
    while *check_idx < read_idx {
        match buf[*check_idx] {
            b'\r' => {
                if *check_idx + 1 == read_idx {
                    return LineStatus::Open;
                }
                if buf[*check_idx + 1] == b'\n' {
                    let end = *check_idx;
                    *check_idx += 2;
                    return LineStatus::Complete { start: line_start, end };
                }
                return LineStatus::Bad;
            }
            b'\n' => {
                if *check_idx > 0 && buf[*check_idx - 1] == b'\r' {
                    let end = *check_idx - 1;
                    *check_idx += 1;
                    return LineStatus::Complete { start: line_start, end };
                }
                return LineStatus::Bad;
            }
            _ => *check_idx += 1,
        }
    }
    LineStatus::Open
}

/// Parse `METHOD SP TARGET SP VERSION`. Only `GET` and version `HTTP/1.1`
/// are accepted. An absolute-URI target (`http://host/path`) is reduced to
/// its path component, which must start with `/`.
pub fn parse_request_line(line: &[u8]) -> Result<&str, HttpCode> {
    let text = std::str::from_utf8(line).map_err(|_| HttpCode::BadRequest)?;
    let mut parts = text.splitn(3, ' ');
    let method = parts.next().unwrap_or("");
    let target = parts.next().ok_or(HttpCode::BadRequest)?;
    let version = parts.next().ok_or(HttpCode::BadRequest)?;

    if !method.eq_ignore_ascii_case("GET") {
        return Err(HttpCode::BadRequest);
    }
    if version != "HTTP/1.1" {
        return Err(HttpCode::BadRequest);
    }

    let path = match strip_http_scheme(target) {
        Some(rest) => match rest.find('/') {
            Some(idx) => &rest[idx..],
            None => return Err(HttpCode::BadRequest),
        },
        None => target,
    };
    if !path.starts_with('/') {
        return Err(HttpCode::BadRequest);
    }
    Ok(path)
}

fn strip_http_scheme(target: &str) -> Option<&str> {
    // Byte-wise compare: slicing the str could land inside a multi-byte
    // character. A matching prefix is all ASCII, so index 7 is a boundary.
    let prefix = target.as_bytes().get(..7)?;
    if prefix.eq_ignore_ascii_case(b"http://") {
        Some(&target[7..])
    } else {
        None
    }
}

/// One recognized header field. Borrowed values point into the line buffer.
#[derive(Debug, PartialEq, Eq)]
pub enum HeaderField<'a> {
    /// The empty line terminating the header section.
    End,
    Host(&'a str),
    Connection(&'a str),
    ContentLength(usize),
    /// Any header we do not interpret.
    Other,
}

/// Split a header line on the first colon. Keys match case-insensitively;
/// a non-empty line without a colon is malformed.
pub fn parse_header_line(line: &[u8]) -> Result<HeaderField<'_>, HttpCode> {
    if line.is_empty() {
        return Ok(HeaderField::End);
    }
    let text = std::str::from_utf8(line).map_err(|_| HttpCode::BadRequest)?;
    let colon = text.find(':').ok_or(HttpCode::BadRequest)?;
    let name = &text[..colon];
    let value = text[colon + 1..].trim_start_matches(' ');

    if name.eq_ignore_ascii_case("Host") {
        Ok(HeaderField::Host(value))
    } else if name.eq_ignore_ascii_case("Connection") {
        Ok(HeaderField::Connection(value))
    } else if name.eq_ignore_ascii_case("Content-Length") {
        // atoi semantics: garbage counts as no body.
        Ok(HeaderField::ContentLength(value.trim().parse().unwrap_or(0)))
    } else {
        Ok(HeaderField::Other)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan(buf: &[u8]) -> (LineStatus, usize) {
        let mut check_idx = 0;
        let status = parse_line(buf, &mut check_idx, buf.len(), 0);
        (status, check_idx)
    }

    #[test]
    fn tokenizer_complete_line() {
        let (status, check_idx) = scan(b"GET / HTTP/1.1\r\nHost");
        assert_eq!(status, LineStatus::Complete { start: 0, end: 14 });
        assert_eq!(check_idx, 16);
    }

    #[test]
    fn tokenizer_open_without_terminator() {
        let (status, check_idx) = scan(b"GET / HTTP");
        assert_eq!(status, LineStatus::Open);
        assert_eq!(check_idx, 10);
    }

    #[test]
    fn tokenizer_open_on_trailing_cr() {
        // The \r is the last received byte: wait for the \n.
        let (status, check_idx) = scan(b"GET / HTTP/1.1\r");
        assert_eq!(status, LineStatus::Open);
        assert_eq!(check_idx, 14);
    }

    #[test]
    fn tokenizer_resumes_across_split_terminator() {
        let mut buf = b"GET /\r".to_vec();
        let mut check_idx = 0;
        assert_eq!(parse_line(&buf, &mut check_idx, buf.len(), 0), LineStatus::Open);

        // Second read delivers the \n.
        buf.push(b'\n');
        let status = parse_line(&buf, &mut check_idx, buf.len(), 0);
        assert_eq!(status, LineStatus::Complete { start: 0, end: 5 });
        assert_eq!(check_idx, 7);
    }

    #[test]
    fn tokenizer_rejects_stray_terminators() {
        assert_eq!(scan(b"GET \rX HTTP/1.1").0, LineStatus::Bad);
        assert_eq!(scan(b"\nGET /").0, LineStatus::Bad);
        assert_eq!(scan(b"GET\n /").0, LineStatus::Bad);
    }

    #[test]
    fn tokenizer_never_passes_read_idx() {
        let buf = b"abcdef\r\n";
        let mut check_idx = 0;
        // Only part of the buffer has been "received".
        for read_idx in 0..=buf.len() {
            let status = parse_line(buf, &mut check_idx, read_idx, 0);
            assert!(check_idx <= read_idx);
            if read_idx < buf.len() {
                assert_eq!(status, LineStatus::Open);
            } else {
                assert_eq!(status, LineStatus::Complete { start: 0, end: 6 });
            }
        }
    }

    #[test]
    fn request_line_get_ok() {
        assert_eq!(parse_request_line(b"GET /index.html HTTP/1.1"), Ok("/index.html"));
    }

    #[test]
    fn request_line_rejects_other_methods() {
        assert_eq!(parse_request_line(b"POST / HTTP/1.1"), Err(HttpCode::BadRequest));
        assert_eq!(parse_request_line(b"HEAD / HTTP/1.1"), Err(HttpCode::BadRequest));
    }

    #[test]
    fn request_line_rejects_wrong_version() {
        assert_eq!(parse_request_line(b"GET / HTTP/1.0"), Err(HttpCode::BadRequest));
        assert_eq!(parse_request_line(b"GET /"), Err(HttpCode::BadRequest));
    }

    #[test]
    fn request_line_strips_absolute_uri() {
        assert_eq!(
            parse_request_line(b"GET http://192.168.17.128:8080/index.html HTTP/1.1"),
            Ok("/index.html")
        );
        // Authority without a path has no absolute path left.
        assert_eq!(
            parse_request_line(b"GET http://example.com HTTP/1.1"),
            Err(HttpCode::BadRequest)
        );
    }

    #[test]
    fn request_line_accepts_multibyte_target_bytes() {
        // The second byte of 'é' sits at the scheme-prefix length.
        assert_eq!(
            parse_request_line("GET /12345é HTTP/1.1".as_bytes()),
            Ok("/12345é")
        );
        assert_eq!(parse_request_line("GET /é HTTP/1.1".as_bytes()), Ok("/é"));
    }

    #[test]
    fn request_line_rejects_relative_target() {
        assert_eq!(parse_request_line(b"GET index.html HTTP/1.1"), Err(HttpCode::BadRequest));
    }

    #[test]
    fn header_line_matches_case_insensitively() {
        assert_eq!(parse_header_line(b"HOST: example.com"), Ok(HeaderField::Host("example.com")));
        assert_eq!(
            parse_header_line(b"connection: keep-alive"),
            Ok(HeaderField::Connection("keep-alive"))
        );
        assert_eq!(
            parse_header_line(b"content-length: 42"),
            Ok(HeaderField::ContentLength(42))
        );
    }

    #[test]
    fn header_line_end_and_unknown() {
        assert_eq!(parse_header_line(b""), Ok(HeaderField::End));
        assert_eq!(parse_header_line(b"Accept: */*"), Ok(HeaderField::Other));
    }

    #[test]
    fn header_line_without_colon_is_malformed() {
        assert_eq!(parse_header_line(b"not a header"), Err(HttpCode::BadRequest));
    }

    #[test]
    fn content_length_garbage_counts_as_zero() {
        assert_eq!(
            parse_header_line(b"Content-Length: banana"),
            Ok(HeaderField::ContentLength(0))
        );
    }
}
