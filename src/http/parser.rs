//! Incremental request tokenizer built on [`httparse`].
//!
//! [`Tokenizer::feed`] accepts bytes as they arrive from the socket and
//! reports message structure through [`ParserCallbacks`]: the head is staged
//! until complete and handed to `httparse`, bodies framed by
//! `Content-Length` or chunked transfer coding are streamed through
//! [`ParserCallbacks::on_body`]. Several pipelined messages in one feed are
//! delivered in order.

use bytes::BytesMut;
use thiserror::Error;

use super::Method;

/// Upper bound on a single chunk-size or trailer line.
const MAX_LINE: usize = 4096;

/// Errors that stop the tokenizer.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("malformed request head: {0}")]
    Head(httparse::Error),

    #[error("request head exceeds {limit} bytes")]
    HeadTooLarge { limit: usize },

    #[error("too many headers (maximum is {max})")]
    TooManyHeaders { max: usize },

    #[error("invalid Content-Length header")]
    InvalidContentLength,

    #[error("invalid chunk size line")]
    InvalidChunkSize,

    #[error("malformed chunked body")]
    InvalidChunk,

    #[error("request exceeds maximum allowed size of {limit} bytes")]
    RequestTooLarge { limit: usize },

    #[error("message handling aborted")]
    Aborted,
}

/// Request line facts shared with [`ParserCallbacks::on_headers_complete`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHead {
    pub method: Method,
    /// HTTP minor version: 0 for HTTP/1.0, 1 for HTTP/1.1.
    pub version: u8,
    /// Whether the connection may carry another request after this one.
    pub keep_alive: bool,
}

/// Receiver of tokenizer events.
///
/// Every method is called synchronously from inside [`Tokenizer::feed`].
/// Returning an error aborts the feed; the tokenizer then stays failed.
pub trait ParserCallbacks {
    fn on_message_begin(&mut self) -> Result<(), ParseError>;
    fn on_url(&mut self, url: &[u8]) -> Result<(), ParseError>;
    fn on_header_field(&mut self, field: &[u8]) -> Result<(), ParseError>;
    fn on_header_value(&mut self, value: &[u8]) -> Result<(), ParseError>;
    fn on_headers_complete(&mut self, head: &MessageHead) -> Result<(), ParseError>;
    fn on_body(&mut self, chunk: &[u8]) -> Result<(), ParseError>;
    fn on_message_complete(&mut self) -> Result<(), ParseError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Between messages.
    Idle,
    Head,
    Body { remaining: u64 },
    ChunkSize,
    ChunkData { remaining: u64 },
    ChunkDataEnd,
    Trailers,
    Failed,
}

// How the body of a message is delimited.
enum Framing {
    Length(u64),
    Chunked,
}

/// Push tokenizer for HTTP/1.x requests.
#[derive(Debug)]
pub struct Tokenizer {
    state: State,
    staging: BytesMut,
    max_headers: usize,
    max_head_size: usize,
    error: Option<ParseError>,
}

impl Tokenizer {
    /// Creates a tokenizer accepting at most `max_headers` header fields and
    /// `max_head_size` bytes of request line plus headers.
    pub fn new(max_headers: usize, max_head_size: usize) -> Self {
        Self {
            state: State::Idle,
            staging: BytesMut::new(),
            max_headers,
            max_head_size,
            error: None,
        }
    }

    /// Feeds bytes to the tokenizer, invoking `callbacks` as structure is recognised.
    ///
    /// Returns the number of bytes consumed. A result smaller than
    /// `data.len()` means parsing failed; see [`error`](Self::error).
    pub fn feed<C: ParserCallbacks>(&mut self, data: &[u8], callbacks: &mut C) -> usize {
        if self.state == State::Failed {
            return 0;
        }

        let mut pos = 0;
        while pos < data.len() {
            match self.step(&data[pos..], callbacks) {
                Ok(used) => pos += used,
                Err(err) => {
                    self.state = State::Failed;
                    self.staging = BytesMut::new();
                    self.error = Some(err);
                    return pos;
                }
            }
        }
        pos
    }

    /// The error that stopped the tokenizer, if any.
    pub fn error(&self) -> Option<&ParseError> {
        self.error.as_ref()
    }

    /// Returns `true` when no message is partially parsed.
    pub fn is_idle(&self) -> bool {
        self.state == State::Idle
    }

    /// Returns the tokenizer to its initial state, clearing any error.
    pub fn reset(&mut self) {
        self.state = State::Idle;
        self.staging.clear();
        self.error = None;
    }

    // Processes a prefix of `input`, returning how many bytes were used.
    fn step<C: ParserCallbacks>(
        &mut self,
        input: &[u8],
        callbacks: &mut C,
    ) -> Result<usize, ParseError> {
        match self.state {
            State::Idle => {
                callbacks.on_message_begin()?;
                self.state = State::Head;
                Ok(0)
            }
            State::Head => self.step_head(input, callbacks),
            State::Body { remaining } => {
                let used = take_len(remaining, input.len());
                callbacks.on_body(&input[..used])?;
                let remaining = remaining - used as u64;
                if remaining == 0 {
                    self.finish(callbacks)?;
                } else {
                    self.state = State::Body { remaining };
                }
                Ok(used)
            }
            State::ChunkSize => {
                let (used, complete) = self.stage_line(input)?;
                if complete {
                    let size = match httparse::parse_chunk_size(&self.staging) {
                        Ok(httparse::Status::Complete((_, size))) => size,
                        _ => return Err(ParseError::InvalidChunkSize),
                    };
                    self.staging.clear();
                    self.state = if size == 0 {
                        State::Trailers
                    } else {
                        State::ChunkData { remaining: size }
                    };
                }
                Ok(used)
            }
            State::ChunkData { remaining } => {
                let used = take_len(remaining, input.len());
                callbacks.on_body(&input[..used])?;
                let remaining = remaining - used as u64;
                self.state = if remaining == 0 {
                    State::ChunkDataEnd
                } else {
                    State::ChunkData { remaining }
                };
                Ok(used)
            }
            State::ChunkDataEnd => {
                let (used, complete) = self.stage_line(input)?;
                if complete {
                    if !is_blank_line(&self.staging) {
                        return Err(ParseError::InvalidChunk);
                    }
                    self.staging.clear();
                    self.state = State::ChunkSize;
                }
                Ok(used)
            }
            State::Trailers => {
                let (used, complete) = self.stage_line(input)?;
                if complete {
                    let last = is_blank_line(&self.staging);
                    self.staging.clear();
                    if last {
                        self.finish(callbacks)?;
                    }
                }
                Ok(used)
            }
            State::Failed => Err(ParseError::Aborted),
        }
    }

    fn step_head<C: ParserCallbacks>(
        &mut self,
        input: &[u8],
        callbacks: &mut C,
    ) -> Result<usize, ParseError> {
        let staged_before = self.staging.len();
        let room = self.max_head_size.saturating_sub(staged_before);
        let appended = input.len().min(room);
        self.staging.extend_from_slice(&input[..appended]);

        match parse_head(&self.staging, self.max_headers, callbacks)? {
            None if self.staging.len() >= self.max_head_size => Err(ParseError::HeadTooLarge {
                limit: self.max_head_size,
            }),
            None => Ok(appended),
            Some((head_len, framing)) => {
                self.staging.clear();
                match framing {
                    Framing::Length(0) => self.finish(callbacks)?,
                    Framing::Length(remaining) => self.state = State::Body { remaining },
                    Framing::Chunked => self.state = State::ChunkSize,
                }
                Ok(head_len.saturating_sub(staged_before))
            }
        }
    }

    fn finish<C: ParserCallbacks>(&mut self, callbacks: &mut C) -> Result<(), ParseError> {
        self.state = State::Idle;
        callbacks.on_message_complete()
    }

    // Stages bytes up to and including the next LF. Returns the bytes used
    // and whether a full line is now staged.
    fn stage_line(&mut self, input: &[u8]) -> Result<(usize, bool), ParseError> {
        let (used, complete) = match input.iter().position(|&b| b == b'\n') {
            Some(idx) => (idx + 1, true),
            None => (input.len(), false),
        };
        if self.staging.len() + used > MAX_LINE {
            return Err(ParseError::InvalidChunk);
        }
        self.staging.extend_from_slice(&input[..used]);
        Ok((used, complete))
    }
}

impl Default for Tokenizer {
    fn default() -> Self {
        Self::new(64, 8 * 1024)
    }
}

// Parses a staged head. On completion, emits the URL, header and
// headers-complete callbacks and returns the head length plus body framing.
fn parse_head<C: ParserCallbacks>(
    staged: &[u8],
    max_headers: usize,
    callbacks: &mut C,
) -> Result<Option<(usize, Framing)>, ParseError> {
    let mut headers = vec![httparse::EMPTY_HEADER; max_headers];
    let mut req = httparse::Request::new(&mut headers);

    let head_len = match req.parse(staged) {
        Ok(httparse::Status::Complete(len)) => len,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(httparse::Error::TooManyHeaders) => {
            return Err(ParseError::TooManyHeaders { max: max_headers });
        }
        Err(e) => return Err(ParseError::Head(e)),
    };

    let (Some(method), Some(path), Some(version)) = (req.method, req.path, req.version) else {
        return Err(ParseError::Head(httparse::Error::Token));
    };
    let method: Method = method.parse().unwrap_or_else(|never| match never {});

    let mut content_length: Option<u64> = None;
    let mut chunked = false;
    let mut connection_close = false;
    let mut connection_keep_alive = false;

    callbacks.on_url(path.as_bytes())?;
    for header in req.headers.iter() {
        callbacks.on_header_field(header.name.as_bytes())?;
        callbacks.on_header_value(header.value)?;

        if header.name.eq_ignore_ascii_case("content-length") {
            let length = std::str::from_utf8(header.value)
                .ok()
                .and_then(|v| v.trim().parse::<u64>().ok())
                .ok_or(ParseError::InvalidContentLength)?;
            if content_length.is_some_and(|existing| existing != length) {
                return Err(ParseError::InvalidContentLength);
            }
            content_length = Some(length);
        } else if header.name.eq_ignore_ascii_case("transfer-encoding") {
            chunked = header_tokens(header.value)
                .last()
                .is_some_and(|coding| coding.eq_ignore_ascii_case("chunked"));
        } else if header.name.eq_ignore_ascii_case("connection") {
            for token in header_tokens(header.value) {
                connection_close |= token.eq_ignore_ascii_case("close");
                connection_keep_alive |= token.eq_ignore_ascii_case("keep-alive");
            }
        }
    }

    let keep_alive = if connection_close {
        false
    } else {
        connection_keep_alive || version == 1
    };
    callbacks.on_headers_complete(&MessageHead {
        method,
        version,
        keep_alive,
    })?;

    let framing = if chunked {
        Framing::Chunked
    } else {
        Framing::Length(content_length.unwrap_or(0))
    };
    Ok(Some((head_len, framing)))
}

// Comma-separated, trimmed tokens of a header value.
fn header_tokens(value: &[u8]) -> impl Iterator<Item = &str> {
    std::str::from_utf8(value)
        .unwrap_or("")
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

fn is_blank_line(line: &[u8]) -> bool {
    line == b"\r\n" || line == b"\n"
}

fn take_len(remaining: u64, available: usize) -> usize {
    usize::try_from(remaining).map_or(available, |r| r.min(available))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default)]
    struct Recorder {
        events: Vec<String>,
        body: Vec<u8>,
        heads: Vec<MessageHead>,
    }

    impl ParserCallbacks for Recorder {
        fn on_message_begin(&mut self) -> Result<(), ParseError> {
            self.events.push("begin".into());
            Ok(())
        }
        fn on_url(&mut self, url: &[u8]) -> Result<(), ParseError> {
            self.events
                .push(format!("url:{}", String::from_utf8_lossy(url)));
            Ok(())
        }
        fn on_header_field(&mut self, field: &[u8]) -> Result<(), ParseError> {
            self.events
                .push(format!("field:{}", String::from_utf8_lossy(field)));
            Ok(())
        }
        fn on_header_value(&mut self, value: &[u8]) -> Result<(), ParseError> {
            self.events
                .push(format!("value:{}", String::from_utf8_lossy(value)));
            Ok(())
        }
        fn on_headers_complete(&mut self, head: &MessageHead) -> Result<(), ParseError> {
            self.heads.push(head.clone());
            Ok(())
        }
        fn on_body(&mut self, chunk: &[u8]) -> Result<(), ParseError> {
            self.body.extend_from_slice(chunk);
            Ok(())
        }
        fn on_message_complete(&mut self) -> Result<(), ParseError> {
            self.events.push("complete".into());
            Ok(())
        }
    }

    #[test]
    fn simple_get() {
        let raw = b"GET /hello HTTP/1.1\r\nHost: localhost\r\n\r\n";
        let mut tok = Tokenizer::default();
        let mut rec = Recorder::default();
        assert_eq!(tok.feed(raw, &mut rec), raw.len());
        assert_eq!(
            rec.events,
            vec![
                "begin",
                "url:/hello",
                "field:Host",
                "value:localhost",
                "complete"
            ]
        );
        assert_eq!(rec.heads[0].method, Method::Get);
        assert!(rec.heads[0].keep_alive);
        assert!(tok.is_idle());
    }

    #[test]
    fn head_split_across_feeds() {
        let raw = b"POST /echo HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello";
        let mut tok = Tokenizer::default();
        let mut rec = Recorder::default();
        for piece in raw.chunks(3) {
            assert_eq!(tok.feed(piece, &mut rec), piece.len());
        }
        assert_eq!(rec.body, b"hello");
        assert_eq!(rec.events.first().map(String::as_str), Some("begin"));
        assert_eq!(rec.events.last().map(String::as_str), Some("complete"));
        assert_eq!(rec.events.iter().filter(|e| *e == "begin").count(), 1);
    }

    #[test]
    fn pipelined_messages_in_one_feed() {
        let raw = b"GET /a HTTP/1.1\r\n\r\nGET /b HTTP/1.1\r\n\r\n";
        let mut tok = Tokenizer::default();
        let mut rec = Recorder::default();
        assert_eq!(tok.feed(raw, &mut rec), raw.len());
        let urls: Vec<_> = rec.events.iter().filter(|e| e.starts_with("url:")).collect();
        assert_eq!(urls, vec!["url:/a", "url:/b"]);
        assert_eq!(rec.events.iter().filter(|e| *e == "complete").count(), 2);
    }

    #[test]
    fn chunked_request_body() {
        let raw = b"POST /up HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n\
                    4\r\nWiki\r\n5\r\npedia\r\n0\r\nX-Trailer: yes\r\n\r\n";
        let mut tok = Tokenizer::default();
        let mut rec = Recorder::default();
        for piece in raw.chunks(5) {
            assert_eq!(tok.feed(piece, &mut rec), piece.len());
        }
        assert_eq!(rec.body, b"Wikipedia");
        assert_eq!(rec.events.last().map(String::as_str), Some("complete"));
        assert!(tok.is_idle());
    }

    #[test]
    fn malformed_request_line_consumes_less() {
        let raw = b"NOT A REQUEST\r\n\r\n";
        let mut tok = Tokenizer::default();
        let mut rec = Recorder::default();
        assert!(tok.feed(raw, &mut rec) < raw.len());
        assert!(matches!(tok.error(), Some(ParseError::Head(_))));
        assert_eq!(tok.feed(b"GET / HTTP/1.1\r\n\r\n", &mut rec), 0);
    }

    #[test]
    fn too_many_headers() {
        let mut raw = String::from("GET / HTTP/1.1\r\n");
        for i in 0..5 {
            raw.push_str(&format!("X-H{i}: v\r\n"));
        }
        raw.push_str("\r\n");
        let mut tok = Tokenizer::new(4, 8192);
        let mut rec = Recorder::default();
        assert!(tok.feed(raw.as_bytes(), &mut rec) < raw.len());
        assert!(matches!(
            tok.error(),
            Some(ParseError::TooManyHeaders { max: 4 })
        ));
    }

    #[test]
    fn head_too_large() {
        let mut tok = Tokenizer::new(64, 32);
        let mut rec = Recorder::default();
        let raw = b"GET /a-very-long-path-that-never-ends HTTP/1.1\r\n";
        assert!(tok.feed(raw, &mut rec) < raw.len());
        assert!(matches!(
            tok.error(),
            Some(ParseError::HeadTooLarge { limit: 32 })
        ));
    }

    #[test]
    fn conflicting_content_length() {
        let raw = b"POST / HTTP/1.1\r\nContent-Length: 3\r\nContent-Length: 4\r\n\r\nabc";
        let mut tok = Tokenizer::default();
        let mut rec = Recorder::default();
        assert!(tok.feed(raw, &mut rec) < raw.len());
        assert!(matches!(tok.error(), Some(ParseError::InvalidContentLength)));
    }

    #[test]
    fn bad_chunk_size() {
        let raw = b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\nzz\r\n";
        let mut tok = Tokenizer::default();
        let mut rec = Recorder::default();
        assert!(tok.feed(raw, &mut rec) < raw.len());
        assert!(matches!(tok.error(), Some(ParseError::InvalidChunkSize)));
    }

    #[test]
    fn keep_alive_rules() {
        let cases: [(&[u8], bool); 4] = [
            (b"GET / HTTP/1.1\r\n\r\n", true),
            (b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n", false),
            (b"GET / HTTP/1.0\r\n\r\n", false),
            (b"GET / HTTP/1.0\r\nConnection: Keep-Alive\r\n\r\n", true),
        ];
        for (raw, expected) in cases {
            let mut tok = Tokenizer::default();
            let mut rec = Recorder::default();
            tok.feed(raw, &mut rec);
            assert_eq!(rec.heads[0].keep_alive, expected);
        }
    }

    #[test]
    fn reset_clears_failure() {
        let mut tok = Tokenizer::default();
        let mut rec = Recorder::default();
        tok.feed(b"\x01\x02\r\n\r\n", &mut rec);
        assert!(tok.error().is_some());
        tok.reset();
        assert!(tok.error().is_none());
        let raw = b"GET / HTTP/1.1\r\n\r\n";
        assert_eq!(tok.feed(raw, &mut rec), raw.len());
    }
}
