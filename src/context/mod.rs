//! Per-request context handed to route handlers.
//!
//! A [`Context`] pairs the parsed [`Request`] with the [`ResponseWriter`]
//! for the connection it arrived on. Handlers run synchronously on the
//! connection's task and answer by queueing bytes through the context.

use std::fmt;

use crate::buffer::BufferError;
use crate::http::{BodyLength, Request, ResponseWriter};

/// Request plus response writer for one dispatched message.
pub struct Context<'a> {
    request: &'a Request,
    response: ResponseWriter<'a>,
}

impl<'a> Context<'a> {
    /// Create a new context from a request and the writer answering it
    pub fn new(request: &'a Request, response: ResponseWriter<'a>) -> Self {
        Self { request, response }
    }

    /// The request being handled.
    ///
    /// The returned reference is not tied to the context borrow, so request
    /// data can be passed straight back into the writer methods.
    pub fn request(&self) -> &'a Request {
        self.request
    }

    pub fn response(&mut self) -> &mut ResponseWriter<'a> {
        &mut self.response
    }

    pub fn send(&mut self, data: &[u8]) -> Result<usize, BufferError> {
        self.response.send(data)
    }

    pub fn write_fmt(&mut self, args: fmt::Arguments<'_>) -> Result<usize, BufferError> {
        self.response.write_fmt(args)
    }

    pub fn send_head(
        &mut self,
        code: u16,
        length: impl Into<BodyLength>,
        extra_headers: Option<&str>,
    ) -> Result<usize, BufferError> {
        self.response.send_head(code, length, extra_headers)
    }

    pub fn send_chunk(&mut self, data: &[u8]) -> Result<usize, BufferError> {
        self.response.send_chunk(data)
    }

    pub fn write_chunk_fmt(&mut self, args: fmt::Arguments<'_>) -> Result<usize, BufferError> {
        self.response.write_chunk_fmt(args)
    }

    pub fn send_error(&mut self, code: u16, reason: Option<&str>) -> Result<usize, BufferError> {
        self.response.send_error(code, reason)
    }

    pub fn redirect(&mut self, code: u16, location: &str) -> Result<usize, BufferError> {
        self.response.redirect(code, location)
    }

    /// Convenience: a complete response with a fixed-length body.
    ///
    /// The body is omitted for `HEAD` requests; `Content-Length` still
    /// reports its size.
    pub fn respond(
        &mut self,
        code: u16,
        content_type: &str,
        body: &[u8],
    ) -> Result<usize, BufferError> {
        let headers = format!("Content-Type: {content_type}\r\n");
        let mut queued = self.response.send_head(code, body.len(), Some(&headers))?;
        if !self.response.is_head_only() {
            queued += self.response.send(body)?;
        }
        Ok(queued)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::Buffer;
    use crate::http::{MessageHead, Method};

    fn request(method: Method, body: &[u8]) -> Request {
        let mut req = Request::default();
        req.push_url(b"/echo");
        req.set_head(&MessageHead {
            method,
            version: 1,
            keep_alive: true,
        });
        req.push_body(body);
        req
    }

    #[test]
    fn echo_through_context() {
        let req = request(Method::Post, b"hi");
        let mut buf = Buffer::default();
        let mut close = false;
        {
            let mut ctx = Context::new(&req, ResponseWriter::new(&mut buf, &mut close, false, true));
            let body = ctx.request().body();
            ctx.respond(200, "text/plain", body).unwrap();
        }
        let text = String::from_utf8(buf.as_slice().to_vec()).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Type: text/plain\r\n"));
        assert!(text.ends_with("\r\n\r\nhi"));
        assert!(!close);
    }

    #[test]
    fn respond_to_head_omits_body() {
        let req = request(Method::Head, b"");
        let mut buf = Buffer::default();
        let mut close = false;
        {
            let mut ctx = Context::new(&req, ResponseWriter::new(&mut buf, &mut close, true, true));
            ctx.respond(200, "text/plain", b"hello").unwrap();
        }
        let text = String::from_utf8(buf.as_slice().to_vec()).unwrap();
        assert!(text.contains("Content-Length: 5\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn formatted_writes() {
        let req = request(Method::Get, b"");
        let mut buf = Buffer::default();
        let mut close = false;
        {
            let mut ctx = Context::new(&req, ResponseWriter::new(&mut buf, &mut close, false, true));
            write!(ctx, "path={} n={}", ctx.request().path(), 7).unwrap();
        }
        assert_eq!(buf.as_slice(), b"path=/echo n=7");
    }
}
