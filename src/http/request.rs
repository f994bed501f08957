//! The request model populated by the tokenizer callbacks.
//!
//! URL, header and body fragments are copied into storage owned by the
//! [`Request`] as they arrive, so accessors hand out plain borrowed slices
//! that stay valid however the connection's read buffer is reused.

use bytes::BytesMut;

use super::parser::{MessageHead, ParseError};
use super::Method;

/// Default cap on header pairs per request.
pub const DEFAULT_MAX_HEADERS: usize = 64;

#[derive(Debug, Default)]
struct HeaderPair {
    field: BytesMut,
    value: BytesMut,
}

/// An HTTP/1.1 request as seen by handlers.
///
/// Created empty per connection and refilled for every message.
///
/// # Examples
///
/// ```
/// use embhttp::http::{Method, Request, Tokenizer};
/// # use embhttp::http::{MessageHead, ParseError, ParserCallbacks};
/// # struct Fill(Request);
/// # impl ParserCallbacks for Fill {
/// #     fn on_message_begin(&mut self) -> Result<(), ParseError> { self.0.clear(); Ok(()) }
/// #     fn on_url(&mut self, b: &[u8]) -> Result<(), ParseError> { self.0.push_url(b); Ok(()) }
/// #     fn on_header_field(&mut self, b: &[u8]) -> Result<(), ParseError> { self.0.push_header_field(b) }
/// #     fn on_header_value(&mut self, b: &[u8]) -> Result<(), ParseError> { self.0.push_header_value(b); Ok(()) }
/// #     fn on_headers_complete(&mut self, h: &MessageHead) -> Result<(), ParseError> { self.0.set_head(h); Ok(()) }
/// #     fn on_body(&mut self, b: &[u8]) -> Result<(), ParseError> { self.0.push_body(b); Ok(()) }
/// #     fn on_message_complete(&mut self) -> Result<(), ParseError> { Ok(()) }
/// # }
/// let mut fill = Fill(Request::default());
/// let raw = b"GET /hello?name=world HTTP/1.1\r\nHost: localhost\r\n\r\n";
/// Tokenizer::default().feed(raw, &mut fill);
///
/// let request = fill.0;
/// assert_eq!(request.method(), &Method::Get);
/// assert_eq!(request.path(), "/hello");
/// assert_eq!(request.query_param("name"), Some("world"));
/// assert_eq!(request.header("host"), Some("localhost"));
/// ```
#[derive(Debug)]
pub struct Request {
    method: Method,
    /// HTTP minor version: 0 for HTTP/1.0, 1 for HTTP/1.1.
    version: u8,
    url: BytesMut,
    headers: Vec<HeaderPair>,
    /// Set once a value fragment arrives for the last pair; the next field
    /// fragment then opens a new pair.
    value_started: bool,
    body: BytesMut,
    keep_alive: bool,
    max_headers: usize,
}

impl Request {
    /// Creates an empty request that accepts at most `max_headers` header pairs.
    pub fn new(max_headers: usize) -> Self {
        Self {
            method: Method::Get,
            version: 1,
            url: BytesMut::new(),
            headers: Vec::new(),
            value_started: false,
            body: BytesMut::new(),
            keep_alive: true,
            max_headers,
        }
    }

    /// Zeroes the request for the next message, keeping allocations.
    pub fn clear(&mut self) {
        self.method = Method::Get;
        self.version = 1;
        self.url.clear();
        self.headers.clear();
        self.value_started = false;
        self.body.clear();
        self.keep_alive = true;
    }

    /// Appends a URL fragment.
    pub fn push_url(&mut self, fragment: &[u8]) {
        self.url.extend_from_slice(fragment);
    }

    /// Appends a header-name fragment, opening a new pair when the previous
    /// pair already has a value.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError::TooManyHeaders`] when a new pair would exceed the cap.
    pub fn push_header_field(&mut self, fragment: &[u8]) -> Result<(), ParseError> {
        if self.headers.is_empty() || self.value_started {
            if self.headers.len() >= self.max_headers {
                return Err(ParseError::TooManyHeaders {
                    max: self.max_headers,
                });
            }
            self.headers.push(HeaderPair::default());
            self.value_started = false;
        }
        if let Some(pair) = self.headers.last_mut() {
            pair.field.extend_from_slice(fragment);
        }
        Ok(())
    }

    /// Appends a header-value fragment to the current pair.
    pub fn push_header_value(&mut self, fragment: &[u8]) {
        if let Some(pair) = self.headers.last_mut() {
            pair.value.extend_from_slice(fragment);
            self.value_started = true;
        }
    }

    /// Records request-line facts once the head is complete.
    pub fn set_head(&mut self, head: &MessageHead) {
        self.method = head.method.clone();
        self.version = head.version;
        self.keep_alive = head.keep_alive;
    }

    /// Appends a body fragment.
    pub fn push_body(&mut self, fragment: &[u8]) {
        self.body.extend_from_slice(fragment);
    }

    /// Bytes held for URL, header pairs and body together.
    pub fn size(&self) -> usize {
        let headers: usize = self
            .headers
            .iter()
            .map(|pair| pair.field.len() + pair.value.len())
            .sum();
        self.url.len() + headers + self.body.len()
    }

    /// Returns the HTTP method.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Returns the HTTP minor version number (0 = HTTP/1.0, 1 = HTTP/1.1).
    pub fn version(&self) -> u8 {
        self.version
    }

    /// Returns the full request target, or `""` if it is not valid UTF-8.
    pub fn url(&self) -> &str {
        std::str::from_utf8(&self.url).unwrap_or("")
    }

    /// Returns the request path (the URL without its query string).
    pub fn path(&self) -> &str {
        let url = self.url();
        url.split_once('?').map_or(url, |(path, _)| path)
    }

    /// Returns the raw query string (without the leading `?`), if any.
    pub fn query_string(&self) -> Option<&str> {
        self.url().split_once('?').map(|(_, query)| query)
    }

    /// Returns the raw value of the first query parameter named `key`.
    ///
    /// No percent-decoding is applied.
    pub fn query_param(&self, key: &str) -> Option<&str> {
        self.query_string()?
            .split('&')
            .filter_map(|pair| {
                let mut parts = pair.splitn(2, '=');
                Some((parts.next()?, parts.next().unwrap_or("")))
            })
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v)
    }

    /// Returns the first value for the header `name` (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers()
            .find(|(field, _)| field.eq_ignore_ascii_case(name))
            .map(|(_, value)| value)
    }

    /// Returns all `(name, value)` pairs in arrival order, skipping non-UTF-8 entries.
    pub fn headers(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers.iter().filter_map(|pair| {
            let field = std::str::from_utf8(&pair.field).ok()?;
            let value = std::str::from_utf8(&pair.value).ok()?;
            Some((field, value))
        })
    }

    /// Number of header pairs received.
    pub fn header_count(&self) -> usize {
        self.headers.len()
    }

    /// Returns the request body bytes.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Returns `true` if the connection should be kept alive after this request.
    ///
    /// HTTP/1.1 defaults to keep-alive. HTTP/1.0 defaults to close unless
    /// `Connection: keep-alive` is explicitly set.
    pub fn is_keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// Returns the value of the `Content-Length` header parsed as a `usize`, if present.
    pub fn content_length(&self) -> Option<usize> {
        self.header("content-length")?.trim().parse().ok()
    }
}

impl Default for Request {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_HEADERS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Request {
        let mut req = Request::default();
        req.push_url(b"/search?q=rust");
        req.push_url(b"&page=2");
        req.push_header_field(b"Ho").unwrap();
        req.push_header_field(b"st").unwrap();
        req.push_header_value(b"local");
        req.push_header_value(b"host");
        req.push_header_field(b"Content-Length").unwrap();
        req.push_header_value(b"5");
        req.set_head(&MessageHead {
            method: Method::Post,
            version: 1,
            keep_alive: true,
        });
        req.push_body(b"hel");
        req.push_body(b"lo");
        req
    }

    #[test]
    fn fragments_accumulate() {
        let req = sample();
        assert_eq!(req.url(), "/search?q=rust&page=2");
        assert_eq!(req.header("host"), Some("localhost"));
        assert_eq!(req.header_count(), 2);
        assert_eq!(req.body(), b"hello");
        assert_eq!(req.content_length(), Some(5));
        assert_eq!(req.method(), &Method::Post);
    }

    #[test]
    fn path_and_query() {
        let req = sample();
        assert_eq!(req.path(), "/search");
        assert_eq!(req.query_string(), Some("q=rust&page=2"));
        assert_eq!(req.query_param("q"), Some("rust"));
        assert_eq!(req.query_param("page"), Some("2"));
        assert_eq!(req.query_param("missing"), None);
    }

    #[test]
    fn header_cap_is_enforced() {
        let mut req = Request::new(2);
        for name in [&b"A"[..], b"B"] {
            req.push_header_field(name).unwrap();
            req.push_header_value(b"v");
        }
        assert!(matches!(
            req.push_header_field(b"C"),
            Err(ParseError::TooManyHeaders { max: 2 })
        ));
        assert_eq!(req.header_count(), 2);
    }

    #[test]
    fn clear_resets_everything() {
        let mut req = sample();
        req.clear();
        assert_eq!(req.url(), "");
        assert_eq!(req.header_count(), 0);
        assert!(req.body().is_empty());
        assert_eq!(req.size(), 0);
        assert!(req.is_keep_alive());
    }

    #[test]
    fn size_counts_all_parts() {
        let req = sample();
        let expected = "/search?q=rust&page=2".len() + "Hostlocalhost".len() + "Content-Length5".len() + 5;
        assert_eq!(req.size(), expected);
    }
}
