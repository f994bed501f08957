//! HTTP/1.1 response encoding onto a connection's write buffer.
//!
//! A [`ResponseWriter`] queues raw bytes: status lines, header blocks,
//! chunk frames and canned error/redirect responses. Nothing reaches the
//! socket until the connection flushes its write buffer.

use std::fmt;

use crate::buffer::{Buffer, BufferError};

use super::reason_phrase;

/// How the body length is announced by [`ResponseWriter::send_head`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyLength {
    /// `Content-Length: n`.
    Fixed(usize),
    /// Unknown length: `Transfer-Encoding: chunked`.
    Chunked,
}

impl From<usize> for BodyLength {
    fn from(len: usize) -> Self {
        Self::Fixed(len)
    }
}

/// Response encoder bound to one connection's write buffer.
///
/// Every method returns the number of bytes queued.
///
/// # Examples
///
/// ```
/// use embhttp::buffer::Buffer;
/// use embhttp::http::{BodyLength, ResponseWriter};
///
/// let mut buf = Buffer::default();
/// let mut close = false;
/// let mut writer = ResponseWriter::new(&mut buf, &mut close, false, true);
/// writer.send_head(200, BodyLength::Fixed(2), None).unwrap();
/// writer.send(b"hi").unwrap();
///
/// let text = std::str::from_utf8(buf.as_slice()).unwrap();
/// assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
/// assert!(text.ends_with("Content-Length: 2\r\n\r\nhi"));
/// ```
#[derive(Debug)]
pub struct ResponseWriter<'a> {
    buf: &'a mut Buffer,
    close_after_flush: &'a mut bool,
    head_only: bool,
    keep_alive: bool,
}

impl<'a> ResponseWriter<'a> {
    /// Binds a writer to `buf`.
    ///
    /// `head_only` suppresses canned bodies (the request was `HEAD`);
    /// `keep_alive` is the request's keep-alive eligibility. The writer sets
    /// `close_after_flush` whenever it advertises `Connection: close`.
    pub fn new(
        buf: &'a mut Buffer,
        close_after_flush: &'a mut bool,
        head_only: bool,
        keep_alive: bool,
    ) -> Self {
        Self {
            buf,
            close_after_flush,
            head_only,
            keep_alive,
        }
    }

    /// Queues raw bytes.
    ///
    /// # Errors
    ///
    /// Returns [`BufferError::LimitExceeded`] when the write buffer is full.
    pub fn send(&mut self, data: &[u8]) -> Result<usize, BufferError> {
        self.buf.append(data)
    }

    /// Formats `args` into a fresh string and queues it.
    ///
    /// This makes `write!` usable on the writer.
    pub fn write_fmt(&mut self, args: fmt::Arguments<'_>) -> Result<usize, BufferError> {
        let text = fmt::format(args);
        self.send(text.as_bytes())
    }

    /// Queues `HTTP/1.1 <code> <reason>` and the `Server` header.
    pub fn send_status_line(&mut self, code: u16) -> Result<usize, BufferError> {
        write!(
            self,
            "HTTP/1.1 {code} {}\r\nServer: {}\r\n",
            reason_phrase(code),
            crate::SERVER_NAME
        )
    }

    /// Queues a status line, the length header, `extra_headers` verbatim and
    /// the blank line ending the head.
    ///
    /// `extra_headers` must be complete `Name: value\r\n` lines.
    pub fn send_head(
        &mut self,
        code: u16,
        length: impl Into<BodyLength>,
        extra_headers: Option<&str>,
    ) -> Result<usize, BufferError> {
        let mut queued = self.send_status_line(code)?;
        queued += match length.into() {
            BodyLength::Fixed(len) => write!(self, "Content-Length: {len}\r\n")?,
            BodyLength::Chunked => self.send(b"Transfer-Encoding: chunked\r\n")?,
        };
        if let Some(headers) = extra_headers {
            queued += self.send(headers.as_bytes())?;
        }
        queued += self.send(b"\r\n")?;
        Ok(queued)
    }

    /// Queues one chunk frame: uppercase hex length, CRLF, payload, CRLF.
    ///
    /// An empty payload produces the terminal `0\r\n\r\n` frame, which the
    /// caller must send to end a chunked body.
    pub fn send_chunk(&mut self, data: &[u8]) -> Result<usize, BufferError> {
        let mut queued = write!(self, "{:X}\r\n", data.len())?;
        queued += self.send(data)?;
        queued += self.send(b"\r\n")?;
        Ok(queued)
    }

    /// Formats `args` and queues the result as a single chunk frame.
    pub fn write_chunk_fmt(&mut self, args: fmt::Arguments<'_>) -> Result<usize, BufferError> {
        let text = fmt::format(args);
        self.send_chunk(text.as_bytes())
    }

    /// Queues a complete plain-text response whose body is `reason`.
    ///
    /// `reason` defaults to the status table entry for `code`. The response
    /// says `Connection: keep-alive` only when the request allows it and
    /// `code < 400`; otherwise it says `Connection: close` and the connection
    /// is closed once the write buffer drains.
    pub fn send_error(&mut self, code: u16, reason: Option<&str>) -> Result<usize, BufferError> {
        let reason = reason.unwrap_or_else(|| reason_phrase(code));
        let keep_alive = self.keep_alive && code < 400;
        let headers = if keep_alive {
            "Content-Type: text/plain\r\nConnection: keep-alive\r\n"
        } else {
            "Content-Type: text/plain\r\nConnection: close\r\n"
        };

        let mut queued = self.send_head(code, reason.len(), Some(headers))?;
        if !self.head_only {
            queued += self.send(reason.as_bytes())?;
        }
        if !keep_alive {
            *self.close_after_flush = true;
        }
        Ok(queued)
    }

    /// Queues a redirect to `location` with a minimal HTML body.
    pub fn redirect(&mut self, code: u16, location: &str) -> Result<usize, BufferError> {
        let body = format!("<p>Moved <a href=\"{location}\">here</a></p>");

        let mut queued = self.send_status_line(code)?;
        queued += write!(
            self,
            "Location: {location}\r\n\
             Content-Type: text/html\r\n\
             Content-Length: {}\r\n\
             Cache-Control: no-cache\r\n\r\n",
            body.len()
        )?;
        if !self.head_only {
            queued += self.send(body.as_bytes())?;
        }
        Ok(queued)
    }

    /// Closes the connection once everything queued so far is written.
    pub fn close_after_flush(&mut self) {
        *self.close_after_flush = true;
    }

    /// Whether the request permits reusing the connection.
    pub fn is_keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// Whether the request was `HEAD`.
    pub fn is_head_only(&self) -> bool {
        self.head_only
    }

    /// Bytes currently waiting in the write buffer.
    pub fn queued(&self) -> usize {
        self.buf.len()
    }
}
