//! # embhttp
//!
//! An embeddable HTTP/1.1 server core for small hosts.
//!
//! Each connection runs an explicit state machine on its own Tokio task:
//! bytes are pushed through an incremental tokenizer, complete requests are
//! dispatched to exact-path handlers, and responses are queued into a
//! bounded write buffer that is flushed while the connection keeps reading
//! pipelined requests. Idle connections are destroyed after a timeout.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use embhttp::Server;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut server = Server::bind("127.0.0.1:8080").await?;
//!     server.register("/echo", |ctx| {
//!         let body = ctx.request().body();
//!         ctx.respond(200, "text/plain", body)?;
//!         Ok(())
//!     });
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod buffer;
pub mod config;
pub mod context;
pub mod http;
pub mod router;
pub mod server;

pub use buffer::{Buffer, BufferError};
pub use config::{ConfigError, ServerConfig};
pub use context::Context;
pub use http::{BodyLength, Method, Request, ResponseWriter, StatusCode};
pub use router::{HandlerResult, Router};
pub use server::{Server, ServerError, ServerHandle};

/// Value of the `Server` header sent with every response.
pub const SERVER_NAME: &str = concat!("embhttp/", env!("CARGO_PKG_VERSION"));

/// The crate version.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
