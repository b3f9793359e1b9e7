//! Minimal HTTP/1.1 frame layer: just enough request framing for program
//! delivery and connection reuse, nothing resembling general compliance.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::debug;

use crate::buffer::{BufferPool, QueueBuffer};
use crate::program::{ParseOutcome, Program, SEND_BUFFER_SIZE};
use crate::session::{Feedback, Protocol, SessionIo};
use crate::vm::VirtualMachine;

const VSCRIPT_URL: &str = "/vscript/";
const SINKHOLE_URL: &str = "/sinkhole/";
const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Smallest possible program body: `0<LF>`.
const MIN_PROGRAM_BODY: usize = 2;

fn find_terminator(data: &[u8]) -> Option<usize> {
    data.windows(HEADER_TERMINATOR.len())
        .position(|w| w == HEADER_TERMINATOR)
}

fn status_reason(code: u16) -> &'static str {
    match code {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        203 => "Non-Authoritative Information",
        204 => "No Content",
        205 => "Reset Content",
        206 => "Partial Content",
        300 => "Multiple Choices",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        305 => "Use Proxy",
        307 => "Temporary Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        402 => "Payment Required",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        406 => "Not Acceptable",
        407 => "Proxy Authentication Required",
        408 => "Request Time-out",
        409 => "Conflict",
        410 => "Gone",
        411 => "Length Required",
        412 => "Precondition Failed",
        413 => "Request Entity Too Large",
        414 => "Request-URI Too Large",
        415 => "Unsupported Media Type",
        416 => "Requested range not satisfiable",
        417 => "Expectation Failed",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Time-out",
        505 => "HTTP Version not supported",
        _ => "",
    }
}

/// Parsed request header state, reset between keep-alive requests.
#[derive(Default)]
pub struct RequestHeader {
    keep_alive: bool,
    ready: bool,
    url: String,
    content_length: usize,
}

impl RequestHeader {
    /// Look for the `\r\n\r\n` terminator; once found, parse the header
    /// fields and return the header's byte length.
    pub fn try_parse(&mut self, data: &[u8]) -> Option<usize> {
        debug_assert!(!self.ready);
        let header_end = find_terminator(data)? + HEADER_TERMINATOR.len();
        self.parse_fields(&data[..header_end]);
        self.ready = true;
        Some(header_end)
    }

    fn parse_fields(&mut self, header: &[u8]) {
        let mut lines = header.split(|&b| b == b'\n');

        if let Some(request_line) = lines.next() {
            let mut parts = request_line.split(|&b| b == b' ').filter(|p| !p.is_empty());
            let _method = parts.next();
            if let Some(url) = parts.next() {
                self.url = String::from_utf8_lossy(url).trim_end().to_string();
            }
        }

        for line in lines {
            let line = match line.strip_suffix(b"\r") {
                Some(stripped) => stripped,
                None => line,
            };
            let colon = match line.iter().position(|&b| b == b':') {
                Some(pos) => pos,
                None => continue,
            };
            let name = &line[..colon];
            let value = String::from_utf8_lossy(&line[colon + 1..]);
            let value = value.trim();

            if name.eq_ignore_ascii_case(b"connection") {
                if value.eq_ignore_ascii_case("close") {
                    self.keep_alive = false;
                } else if value.eq_ignore_ascii_case("keep-alive") {
                    self.keep_alive = true;
                }
            } else if name.eq_ignore_ascii_case(b"content-length") {
                // A negative length is treated as zero.
                self.content_length = value.parse::<i64>().unwrap_or(0).max(0) as usize;
            }
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn keep_alive(&self) -> bool {
        debug_assert!(self.ready);
        self.keep_alive
    }

    pub fn content_length(&self) -> usize {
        debug_assert!(self.ready);
        self.content_length
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Serialises response headers into a reusable queue buffer.
pub struct ResponseHeader {
    buffer: QueueBuffer,
    code: u16,
    content_length: usize,
    keep_alive: bool,
    sent: bool,
}

impl ResponseHeader {
    pub fn new(buffer: QueueBuffer) -> Self {
        Self {
            buffer,
            code: 0,
            content_length: 0,
            keep_alive: false,
            sent: false,
        }
    }

    pub fn prepare(&mut self, code: u16, content_length: usize, keep_alive: bool) {
        self.code = code;
        self.content_length = content_length;
        self.keep_alive = keep_alive;

        let mut buf = self.buffer.lock().unwrap();
        buf.clear();
        buf.printf(format_args!("HTTP/1.1 {} {}", code, status_reason(code)));
        buf.printf(format_args!("\r\n"));
        buf.printf(format_args!("Content-Length: {}", content_length));
        buf.printf(format_args!("\r\n"));
        buf.printf(format_args!(
            "Connection: {}",
            if keep_alive { "Keep-Alive" } else { "Close" }
        ));
        buf.printf(format_args!("\r\n"));
        buf.printf(format_args!("\r\n"));
    }

    pub fn buffer(&self) -> QueueBuffer {
        self.buffer.clone()
    }

    pub fn set_sent(&mut self) {
        self.sent = true;
    }

    pub fn is_sent(&self) -> bool {
        self.sent
    }

    pub fn reset(&mut self) {
        self.sent = false;
    }
}

fn next_http_id() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

/// The HTTP protocol bound to a session: parses request frames,
/// dispatches by URL prefix, runs the program, and streams the download.
pub struct Http {
    id: u64,
    request_header: RequestHeader,
    response_header: ResponseHeader,
    program: Program,
    /// Reusable body sink for download chunks.
    body_buffer: QueueBuffer,
}

impl Default for Http {
    fn default() -> Self {
        let pool = BufferPool::global();
        Self {
            id: next_http_id(),
            request_header: RequestHeader::default(),
            response_header: ResponseHeader::new(pool.borrow(64)),
            program: Program::sinkhole(),
            body_buffer: pool.borrow(SEND_BUFFER_SIZE),
        }
    }
}

impl Http {
    fn respond(&mut self, io: &mut SessionIo<'_, Self>, code: u16, keep_alive: bool, size: usize) {
        debug_assert!(!self.response_header.is_sent());
        self.response_header.prepare(code, size, keep_alive);
        io.send(self.response_header.buffer());
        self.response_header.set_sent();
    }

    fn reset(&mut self, io: &mut SessionIo<'_, Self>) {
        self.program.reset();
        self.request_header.reset();
        self.response_header.reset();
        io.reset_buffers();
    }

    /// Decide what program serves this request based on the URL prefix.
    /// Returns `None` when the session should just be closed.
    fn bind_program(&mut self, io: &mut SessionIo<'_, Self>) -> Option<Feedback> {
        let url = self.request_header.url();

        if url.starts_with(VSCRIPT_URL) {
            if self.request_header.content_length() < MIN_PROGRAM_BODY {
                return Some(Feedback::Close);
            }

            match Program::try_parse(io.data()) {
                ParseOutcome::Success { program, consumed } => {
                    self.program = program;
                    io.consume(consumed);
                    self.attach_vm(io);
                    // The program text itself is part of the body stream,
                    // so its bytes count toward the trigger offsets.
                    self.program.feed(consumed, false);
                    None
                }
                ParseOutcome::NeedMoreData => {
                    // A body that ends before the program framing does is
                    // malformed.
                    if io.check_finished() {
                        Some(Feedback::Close)
                    } else {
                        Some(Feedback::Continue)
                    }
                }
                ParseOutcome::Failed => Some(Feedback::Close),
            }
        } else if url.starts_with(SINKHOLE_URL) {
            self.program = Program::sinkhole();
            self.attach_vm(io);
            None
        } else {
            Some(Feedback::Close)
        }
    }

    fn attach_vm(&mut self, io: &mut SessionIo<'_, Self>) {
        self.program.set_vm(VirtualMachine::shared().clone());
        self.program.set_cancel_flag(io.abort_flag());
    }
}

impl Protocol for Http {
    fn start(&mut self, io: &mut SessionIo<'_, Self>) {
        self.reset(io);
    }

    fn on_data(&mut self, io: &mut SessionIo<'_, Self>) -> Feedback {
        if !self.request_header.is_ready() {
            if !self.try_handle_header(io) {
                return Feedback::Continue;
            }
            io.transaction_started();
        }

        if !self.program.is_set() {
            if let Some(feedback) = self.bind_program(io) {
                return feedback;
            }
        }

        let finished = self.program.feed(io.data_size(), io.check_finished());
        io.consume(0);

        if finished {
            let (code, download_size) = self.program.response();
            let keep_alive = self.request_header.keep_alive();
            self.respond(io, code, keep_alive, download_size as usize);
            return Feedback::Finished;
        }

        Feedback::Continue
    }

    fn on_sent(&mut self, io: &mut SessionIo<'_, Self>) -> Feedback {
        if self.program.has_more_data() {
            {
                let mut buf = self.body_buffer.lock().unwrap();
                self.program.get_data(&mut buf);
            }
            io.send(self.body_buffer.clone());
            return Feedback::Data;
        }

        if self.request_header.keep_alive() {
            self.reset(io);
            // Read the next request's header on the same connection.
            Feedback::Continue
        } else {
            Feedback::Close
        }
    }

    fn on_error(&mut self, error: &io::Error) {
        debug!(protocol = self.id, error = %error, "http transport error");
    }

    fn on_closed(&mut self) {
        self.program.reset();
    }

    fn try_handle_header(&mut self, io: &mut SessionIo<'_, Self>) -> bool {
        let header_end = match self.request_header.try_parse(io.data()) {
            Some(end) => end,
            None => return false,
        };

        // The transaction's total expected bytes: the header we just saw
        // plus the declared body length.
        io.set_expected_data_length(header_end + self.request_header.content_length());
        io.consume(header_end);
        true
    }

    fn id(&self) -> u64 {
        self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn header_waits_for_terminator() {
        let mut header = RequestHeader::default();
        assert!(header
            .try_parse(b"GET /sinkhole/ HTTP/1.1\r\nConnection: keep-alive\r\n")
            .is_none());
        assert!(!header.is_ready());
    }

    #[test]
    fn header_parses_url_connection_and_length() {
        let raw = b"POST /vscript/x HTTP/1.1\r\nContent-Length: 34\r\nConnection: close\r\n\r\nrest";
        let mut header = RequestHeader::default();
        let end = header.try_parse(raw).unwrap();
        assert_eq!(end, raw.len() - 4);
        assert!(header.is_ready());
        assert_eq!(header.url(), "/vscript/x");
        assert_eq!(header.content_length(), 34);
        assert!(!header.keep_alive());
    }

    #[test]
    fn connection_tokens_are_case_insensitive() {
        let mut header = RequestHeader::default();
        header
            .try_parse(b"GET / HTTP/1.1\r\nConnection: Keep-Alive\r\n\r\n")
            .unwrap();
        assert!(header.keep_alive());

        let mut header = RequestHeader::default();
        header
            .try_parse(b"GET / HTTP/1.1\r\nCONNECTION: CLOSE\r\n\r\n")
            .unwrap();
        assert!(!header.keep_alive());
    }

    #[test]
    fn unknown_headers_are_ignored() {
        let mut header = RequestHeader::default();
        header
            .try_parse(b"GET /x HTTP/1.1\r\nHost: a\r\nX-Weird: close\r\n\r\n")
            .unwrap();
        assert!(!header.keep_alive());
        assert_eq!(header.content_length(), 0);
    }

    #[test]
    fn negative_content_length_is_zero() {
        let mut header = RequestHeader::default();
        header
            .try_parse(b"POST / HTTP/1.1\r\nContent-Length: -5\r\n\r\n")
            .unwrap();
        assert_eq!(header.content_length(), 0);
    }

    #[test]
    fn reset_clears_residual_fields() {
        let mut header = RequestHeader::default();
        header
            .try_parse(b"GET /a HTTP/1.1\r\nConnection: keep-alive\r\nContent-Length: 9\r\n\r\n")
            .unwrap();
        header.reset();
        assert!(!header.is_ready());
        assert_eq!(header.url(), "");

        header
            .try_parse(b"GET /b HTTP/1.1\r\n\r\n")
            .unwrap();
        assert_eq!(header.url(), "/b");
        assert!(!header.keep_alive());
        assert_eq!(header.content_length(), 0);
    }

    #[test]
    fn response_header_serialises_exactly() {
        let buffer: QueueBuffer =
            Arc::new(Mutex::new(crate::buffer::DynamicString::with_capacity(64)));
        let mut response = ResponseHeader::new(buffer.clone());

        response.prepare(200, 1024, false);
        assert_eq!(
            buffer.lock().unwrap().as_slice(),
            b"HTTP/1.1 200 OK\r\nContent-Length: 1024\r\nConnection: Close\r\n\r\n".as_slice()
        );

        response.prepare(200, 0, true);
        assert_eq!(
            buffer.lock().unwrap().as_slice(),
            b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\nConnection: Keep-Alive\r\n\r\n".as_slice()
        );
    }

    #[test]
    fn unknown_status_gets_empty_reason() {
        let buffer: QueueBuffer =
            Arc::new(Mutex::new(crate::buffer::DynamicString::with_capacity(64)));
        let mut response = ResponseHeader::new(buffer.clone());
        response.prepare(299, 0, false);
        assert!(buffer
            .lock()
            .unwrap()
            .as_slice()
            .starts_with(b"HTTP/1.1 299 \r\n"));
    }

    #[test]
    fn sent_flag_latches_until_reset() {
        let buffer: QueueBuffer =
            Arc::new(Mutex::new(crate::buffer::DynamicString::with_capacity(64)));
        let mut response = ResponseHeader::new(buffer);
        assert!(!response.is_sent());
        response.prepare(200, 0, false);
        response.set_sent();
        assert!(response.is_sent());
        response.reset();
        assert!(!response.is_sent());
    }
}
