//! Small demo server.
//!
//! ```text
//! cargo run --example echo -- 127.0.0.1:8080
//! curl -d 'hello' http://127.0.0.1:8080/echo
//! curl http://127.0.0.1:8080/stream
//! curl -i http://127.0.0.1:8080/old
//! ```
//!
//! Set `RUST_LOG=embhttp=debug` for per-request logs.

use embhttp::{BodyLength, Server, ServerConfig};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("embhttp=info")),
        )
        .init();

    let addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:8080".to_owned());
    let config = match std::env::var("EMBHTTP_CONFIG") {
        Ok(json) => ServerConfig::from_json(&json)?,
        Err(_) => ServerConfig::default(),
    };

    let mut server = Server::bind_with_config(&addr, config).await?;
    server
        .register("/echo", |ctx| {
            let body = ctx.request().body();
            ctx.respond(200, "text/plain", body)?;
            Ok(())
        })
        .register("/hello", |ctx| {
            let name = ctx.request().query_param("name").unwrap_or("world");
            let body = format!("Hello, {name}!\n");
            ctx.respond(200, "text/plain", body.as_bytes())?;
            Ok(())
        })
        .register("/stream", |ctx| {
            ctx.send_head(200, BodyLength::Chunked, Some("Content-Type: text/plain\r\n"))?;
            for (name, value) in ctx.request().headers() {
                ctx.write_chunk_fmt(format_args!("{name}: {value}\n"))?;
            }
            ctx.send_chunk(b"")?;
            Ok(())
        })
        .register("/old", |ctx| {
            ctx.redirect(301, "/hello")?;
            Ok(())
        });

    let handle = server.handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!(live = handle.active_connections(), "shutting down");
            handle.shutdown();
        }
    });

    println!("embhttp {} listening on http://{}", embhttp::version(), server.local_addr());
    server.run().await?;
    Ok(())
}
