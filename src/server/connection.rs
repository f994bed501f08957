//! Per-connection state machine.
//!
//! A [`Connection`] owns one socket, a read buffer, a write buffer, the
//! request being assembled, the tokenizer state and an idle timer. It moves
//! through these states:
//!
//! ```text
//! Accepted -> Reading -> Writing -> Reading ... -> Closing
//!                \______________________________/
//! ```
//!
//! Requests are dispatched synchronously from the tokenizer's
//! message-complete callback; whatever the handler queues is flushed in
//! `Writing`. While flushing, the connection keeps reading (and dispatching
//! pipelined requests) unless it is already flagged to close. Dropping the
//! connection releases the socket, both buffers and the timer.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{Instant, Sleep};
use tracing::{debug, info, warn};

use crate::buffer::{Buffer, BufferError};
use crate::config::ServerConfig;
use crate::context::Context;
use crate::http::{
    Method, MessageHead, ParseError, ParserCallbacks, Request, ResponseWriter, Tokenizer,
};
use crate::router::Router;

/// Reasons a connection is torn down without a response.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Buffer(#[from] BufferError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum State {
    Accepted,
    Reading,
    Writing,
    Closing,
}

// Readiness outcome that drives one state transition.
enum Event {
    Read(io::Result<usize>),
    Written(io::Result<usize>),
    IdleTimeout,
}

/// One-shot timer reset on activity.
struct IdleTimer {
    sleep: Pin<Box<Sleep>>,
    timeout: Duration,
}

impl IdleTimer {
    fn new(timeout: Duration) -> Self {
        Self {
            sleep: Box::pin(tokio::time::sleep(timeout)),
            timeout,
        }
    }

    fn reset(&mut self) {
        let deadline = Instant::now() + self.timeout;
        self.sleep.as_mut().reset(deadline);
    }

    async fn expired(&mut self) {
        self.sleep.as_mut().await;
    }
}

/// Message-level state: receives tokenizer callbacks and dispatches
/// complete requests into the write buffer.
struct Exchange {
    peer: SocketAddr,
    router: Arc<Router>,
    request: Request,
    write_buf: Buffer,
    idle: IdleTimer,
    close_after_flush: bool,
    max_request_size: usize,
    /// Set when a handler could not queue its response.
    failure: Option<BufferError>,
}

impl Exchange {
    fn check_size(&self, extra: usize) -> Result<(), ParseError> {
        if self.request.size() + extra > self.max_request_size {
            return Err(ParseError::RequestTooLarge {
                limit: self.max_request_size,
            });
        }
        Ok(())
    }

    fn writer(&mut self) -> ResponseWriter<'_> {
        let head_only = *self.request.method() == Method::Head;
        let keep_alive = self.request.is_keep_alive();
        ResponseWriter::new(
            &mut self.write_buf,
            &mut self.close_after_flush,
            head_only,
            keep_alive,
        )
    }

    // Queues a canned error response; always closes after flushing.
    fn respond_error(&mut self, code: u16) -> Result<(), BufferError> {
        self.writer().send_error(code, None)?;
        self.close_after_flush = true;
        Ok(())
    }

    fn dispatch(&mut self) -> Result<(), ParseError> {
        let keep_alive = self.request.is_keep_alive();
        if !keep_alive {
            self.close_after_flush = true;
        }
        debug!(
            peer = %self.peer,
            method = %self.request.method(),
            path = %self.request.path(),
            keep_alive,
            "dispatching request"
        );

        let head_only = *self.request.method() == Method::Head;
        let writer = ResponseWriter::new(
            &mut self.write_buf,
            &mut self.close_after_flush,
            head_only,
            keep_alive,
        );
        let mut ctx = Context::new(&self.request, writer);
        if let Err(e) = self.router.dispatch(&mut ctx) {
            self.failure = Some(e);
            return Err(ParseError::Aborted);
        }
        Ok(())
    }
}

impl ParserCallbacks for Exchange {
    fn on_message_begin(&mut self) -> Result<(), ParseError> {
        self.idle.reset();
        self.request.clear();
        // Responses to earlier pipelined requests may still be queued.
        if self.write_buf.is_empty() {
            self.write_buf.reset();
        }
        Ok(())
    }

    fn on_url(&mut self, url: &[u8]) -> Result<(), ParseError> {
        self.check_size(url.len())?;
        self.request.push_url(url);
        Ok(())
    }

    fn on_header_field(&mut self, field: &[u8]) -> Result<(), ParseError> {
        self.check_size(field.len())?;
        self.request.push_header_field(field)
    }

    fn on_header_value(&mut self, value: &[u8]) -> Result<(), ParseError> {
        self.check_size(value.len())?;
        self.request.push_header_value(value);
        Ok(())
    }

    fn on_headers_complete(&mut self, head: &MessageHead) -> Result<(), ParseError> {
        self.request.set_head(head);
        Ok(())
    }

    fn on_body(&mut self, chunk: &[u8]) -> Result<(), ParseError> {
        self.check_size(chunk.len())?;
        self.request.push_body(chunk);
        Ok(())
    }

    fn on_message_complete(&mut self) -> Result<(), ParseError> {
        self.dispatch()
    }
}

/// A live client connection.
pub(crate) struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    read_buf: Buffer,
    tokenizer: Tokenizer,
    exchange: Exchange,
    state: State,
    read_step: usize,
}

impl Connection {
    pub(crate) fn new(
        stream: TcpStream,
        peer: SocketAddr,
        router: Arc<Router>,
        config: &ServerConfig,
    ) -> Self {
        Self {
            stream,
            peer,
            read_buf: Buffer::new(config.buffer_size),
            tokenizer: Tokenizer::new(config.max_headers, config.max_head_size),
            exchange: Exchange {
                peer,
                router,
                request: Request::new(config.max_headers),
                write_buf: Buffer::with_limit(config.buffer_size, config.max_write_buffer),
                idle: IdleTimer::new(config.idle_timeout),
                close_after_flush: false,
                max_request_size: config.max_request_size,
                failure: None,
            },
            state: State::Accepted,
            read_step: config.buffer_size,
        }
    }

    /// Drives the connection until it closes.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError`] when the connection is torn down by a
    /// fatal I/O error or an exhausted write buffer.
    pub(crate) async fn run(mut self) -> Result<(), ConnectionError> {
        loop {
            match self.state {
                State::Accepted => {
                    self.exchange.idle.reset();
                    self.state = State::Reading;
                }
                State::Reading => {
                    let event = self.wait_readable().await?;
                    self.on_event(event)?;
                }
                State::Writing => {
                    let event = self.wait_writable().await?;
                    self.on_event(event)?;
                }
                State::Closing => break,
            }
        }

        debug!(peer = %self.peer, "connection closed");
        Ok(())
    }

    async fn wait_readable(&mut self) -> Result<Event, ConnectionError> {
        self.read_buf.ensure_headroom(self.read_step)?;
        let event = tokio::select! {
            res = self.stream.read_buf(self.read_buf.as_bytes_mut()) => Event::Read(res),
            () = self.exchange.idle.expired() => Event::IdleTimeout,
        };
        Ok(event)
    }

    async fn wait_writable(&mut self) -> Result<Event, ConnectionError> {
        let reading = !self.exchange.close_after_flush;
        if reading {
            self.read_buf.ensure_headroom(self.read_step)?;
        }

        let (mut rd, mut wr) = self.stream.split();
        // Queued output drains before a peer EOF is observed.
        let event = tokio::select! {
            biased;
            res = wr.write(self.exchange.write_buf.as_slice()) => Event::Written(res),
            res = rd.read_buf(self.read_buf.as_bytes_mut()), if reading => Event::Read(res),
            () = self.exchange.idle.expired() => Event::IdleTimeout,
        };
        Ok(event)
    }

    fn on_event(&mut self, event: Event) -> Result<(), ConnectionError> {
        match event {
            Event::Read(Ok(0)) if !self.exchange.write_buf.is_empty() => {
                debug!(peer = %self.peer, "peer half-closed, flushing before close");
                self.exchange.close_after_flush = true;
            }
            Event::Read(Ok(0)) => {
                debug!(peer = %self.peer, "connection closed by peer");
                self.state = State::Closing;
            }
            Event::Read(Ok(_)) => self.on_readable()?,
            Event::Read(Err(e)) if e.kind() == io::ErrorKind::Interrupted => {}
            Event::Read(Err(e)) => {
                warn!(peer = %self.peer, error = %e, "read failed, sending 500");
                self.exchange.respond_error(500)?;
                self.after_dispatch();
            }
            Event::Written(Ok(0)) => {
                return Err(io::Error::from(io::ErrorKind::WriteZero).into());
            }
            Event::Written(Ok(n)) => self.on_written(n),
            Event::Written(Err(e)) if e.kind() == io::ErrorKind::Interrupted => {}
            Event::Written(Err(e)) => return Err(e.into()),
            Event::IdleTimeout => {
                info!(peer = %self.peer, state = ?self.state, "connection timed out");
                self.state = State::Closing;
            }
        }
        Ok(())
    }

    fn on_readable(&mut self) -> Result<(), ConnectionError> {
        let data = self.read_buf.as_slice();
        let fed = data.len();
        let consumed = self.tokenizer.feed(data, &mut self.exchange);
        self.read_buf.consume(consumed);

        if consumed < fed {
            if let Some(e) = self.exchange.failure.take() {
                return Err(e.into());
            }
            let code = match self.tokenizer.error() {
                Some(ParseError::RequestTooLarge { .. }) => 413,
                _ => 400,
            };
            if let Some(e) = self.tokenizer.error() {
                warn!(peer = %self.peer, error = %e, status = code, "rejecting request");
            }
            self.read_buf.reset();
            self.exchange.respond_error(code)?;
        }

        self.after_dispatch();
        Ok(())
    }

    // Picks the next state once handlers have queued their output.
    fn after_dispatch(&mut self) {
        if !self.exchange.write_buf.is_empty() {
            self.state = State::Writing;
        } else if self.exchange.close_after_flush {
            self.state = State::Closing;
        }
    }

    fn on_written(&mut self, n: usize) {
        self.exchange.write_buf.consume(n);
        if !self.exchange.write_buf.is_empty() {
            return;
        }

        if self.exchange.close_after_flush {
            self.state = State::Closing;
        } else {
            self.exchange.idle.reset();
            self.state = State::Reading;
        }
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> State {
        self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn pair(router: Router, config: ServerConfig) -> (Connection, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, peer) = listener.accept().await.unwrap();
        (Connection::new(server, peer, Arc::new(router), &config), client)
    }

    fn echo_router() -> Router {
        let mut router = Router::new();
        router.register("/echo", |ctx| {
            let body = ctx.request().body();
            ctx.respond(200, "text/plain", body)?;
            Ok(())
        });
        router
    }

    #[tokio::test]
    async fn dispatch_moves_to_writing_then_back_to_reading() {
        let (mut conn, _client) = pair(echo_router(), ServerConfig::default()).await;
        conn.state = State::Reading;
        conn.read_buf
            .append(b"POST /echo HTTP/1.1\r\nContent-Length: 2\r\n\r\nhi")
            .unwrap();
        conn.on_readable().unwrap();
        assert_eq!(conn.state(), State::Writing);
        assert!(conn.read_buf.is_empty());

        let queued = conn.exchange.write_buf.len();
        let text = String::from_utf8(conn.exchange.write_buf.as_slice().to_vec()).unwrap();
        assert!(text.ends_with("\r\n\r\nhi"));

        conn.on_written(queued - 1);
        assert_eq!(conn.state(), State::Writing);
        conn.on_written(1);
        assert_eq!(conn.state(), State::Reading);
    }

    #[tokio::test]
    async fn parse_error_queues_400_and_closes_after_flush() {
        let (mut conn, _client) = pair(echo_router(), ServerConfig::default()).await;
        conn.state = State::Reading;
        conn.read_buf.append(b"BROKEN\x01 / HTTP/1.1\r\n\r\n").unwrap();
        conn.on_readable().unwrap();
        assert_eq!(conn.state(), State::Writing);
        assert!(conn.exchange.close_after_flush);

        let text = String::from_utf8(conn.exchange.write_buf.as_slice().to_vec()).unwrap();
        assert!(text.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(text.contains("Connection: close\r\n"));

        let queued = conn.exchange.write_buf.len();
        conn.on_written(queued);
        assert_eq!(conn.state(), State::Closing);
    }

    #[tokio::test]
    async fn connection_close_request_closes_after_flush() {
        let (mut conn, _client) = pair(echo_router(), ServerConfig::default()).await;
        conn.state = State::Reading;
        conn.read_buf
            .append(b"POST /echo HTTP/1.1\r\nConnection: close\r\nContent-Length: 1\r\n\r\nx")
            .unwrap();
        conn.on_readable().unwrap();
        let queued = conn.exchange.write_buf.len();
        conn.on_written(queued);
        assert_eq!(conn.state(), State::Closing);
    }

    #[tokio::test]
    async fn oversized_request_gets_413() {
        let config = ServerConfig::default().with_max_request_size(16);
        let (mut conn, _client) = pair(echo_router(), config).await;
        conn.state = State::Reading;
        conn.read_buf
            .append(b"POST /echo HTTP/1.1\r\nContent-Length: 40\r\n\r\n")
            .unwrap();
        conn.on_readable().unwrap();
        let text = String::from_utf8(conn.exchange.write_buf.as_slice().to_vec()).unwrap();
        assert!(text.starts_with("HTTP/1.1 413 Payload Too Large\r\n"));
        assert!(conn.exchange.close_after_flush);
    }

    #[tokio::test]
    async fn handler_overflow_tears_down() {
        let mut router = Router::new();
        router.register("/big", |ctx| {
            ctx.send(&[b'x'; 4096])?;
            Ok(())
        });
        let config = ServerConfig::default()
            .with_buffer_size(256)
            .with_max_write_buffer(1024);
        let (mut conn, _client) = pair(router, config).await;
        conn.state = State::Reading;
        conn.read_buf.append(b"GET /big HTTP/1.1\r\n\r\n").unwrap();
        assert!(matches!(
            conn.on_readable(),
            Err(ConnectionError::Buffer(BufferError::LimitExceeded { .. }))
        ));
    }

    #[tokio::test]
    async fn handler_writing_nothing_stays_reading() {
        let mut router = Router::new();
        router.register("/silent", |_ctx| Ok(()));
        let (mut conn, _client) = pair(router, ServerConfig::default()).await;
        conn.state = State::Reading;
        conn.read_buf.append(b"GET /silent HTTP/1.1\r\n\r\n").unwrap();
        conn.on_readable().unwrap();
        assert_eq!(conn.state(), State::Reading);
    }

    #[tokio::test]
    async fn peer_eof_with_queued_output_flushes_first() {
        let (mut conn, _client) = pair(echo_router(), ServerConfig::default()).await;
        conn.state = State::Reading;
        conn.read_buf
            .append(b"POST /echo HTTP/1.1\r\nContent-Length: 2\r\n\r\nhi")
            .unwrap();
        conn.on_readable().unwrap();
        let queued = conn.exchange.write_buf.len();

        conn.on_event(Event::Read(Ok(0))).unwrap();
        assert_eq!(conn.state(), State::Writing);
        assert!(conn.exchange.close_after_flush);
        assert_eq!(conn.exchange.write_buf.len(), queued);

        conn.on_written(queued);
        assert_eq!(conn.state(), State::Closing);
    }

    #[tokio::test]
    async fn peer_eof_with_nothing_queued_closes() {
        let (mut conn, _client) = pair(echo_router(), ServerConfig::default()).await;
        conn.state = State::Reading;
        conn.on_event(Event::Read(Ok(0))).unwrap();
        assert_eq!(conn.state(), State::Closing);
    }

    #[tokio::test]
    async fn read_error_queues_500_and_closes_after_flush() {
        let (mut conn, _client) = pair(echo_router(), ServerConfig::default()).await;
        conn.state = State::Reading;
        conn.on_event(Event::Read(Err(io::Error::from(io::ErrorKind::ConnectionReset))))
            .unwrap();
        assert_eq!(conn.state(), State::Writing);
        assert!(conn.exchange.close_after_flush);

        let text = String::from_utf8(conn.exchange.write_buf.as_slice().to_vec()).unwrap();
        assert!(text.starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
        assert!(text.contains("Connection: close\r\n"));

        let queued = conn.exchange.write_buf.len();
        conn.on_written(queued);
        assert_eq!(conn.state(), State::Closing);
    }

    #[tokio::test]
    async fn interrupted_read_is_ignored() {
        let (mut conn, _client) = pair(echo_router(), ServerConfig::default()).await;
        conn.state = State::Reading;
        conn.on_event(Event::Read(Err(io::Error::from(io::ErrorKind::Interrupted))))
            .unwrap();
        assert_eq!(conn.state(), State::Reading);
        assert!(conn.exchange.write_buf.is_empty());
    }

    #[tokio::test]
    async fn idle_timeout_closes() {
        let config = ServerConfig::default().with_idle_timeout(Duration::from_millis(20));
        let (conn, _client) = pair(echo_router(), config).await;
        let result = tokio::time::timeout(Duration::from_secs(5), conn.run()).await;
        assert!(matches!(result, Ok(Ok(()))));
    }
}
