//! hearth_web - Self-tuning HTTP application runtime
//!
//! An HTTP/1.x server library built around three cooperating subsystems:
//!
//! - **Learning reply cache**: GET endpoints that are slow and return
//!   byte-identical responses across observations get their serialized
//!   replies frozen; later requests are answered with a single socket
//!   write, skipping parsing-onward work entirely.
//! - **Static asset pool**: registered directory trees are loaded into a
//!   fixed-budget memory arena and served zero-copy through
//!   reference-counted pins; a watcher thread hot-swaps bodies when files
//!   change without disturbing in-flight sends.
//! - **A bounded serve loop**: per-connection buffers with pipelining
//!   leftover handoff, strict header and body caps, keep-alive
//!   bookkeeping, and single vectored writes.
//!
//! # Quick Start
//!
//! ```no_run
//! use hearth_web::{App, Server, StatusCode};
//!
//! #[tokio::main]
//! async fn main() {
//!     let app = App::builder()
//!         .get("/hello/:name", |req, resp| {
//!             let name = req.param("name").unwrap_or("world").to_string();
//!             resp.status(StatusCode::Ok);
//!             resp.set_body_owned(format!("Hello, {name}!"));
//!         })
//!         .static_dir("/assets", "./public")
//!         .build();
//!
//!     Server::builder()
//!         .bind("127.0.0.1", 8080, 128).await.unwrap()
//!         .app(app)
//!         .build()
//!         .launch()
//!         .await;
//! }
//! ```
//!
//! # What gets cached
//!
//! Only GET requests participate. A handler must exceed the configured
//! latency threshold and produce the same bytes twice in a row before its
//! reply is frozen; endpoints that vary per request (timestamps, counters)
//! never stabilize. Frozen entries decay by age, by hit count, and under a
//! global byte budget. See [`limits::CacheLimits`].
//!
//! # Limits
//!
//! Defaults are conservative; see the [`limits`] module to tune buffer
//! sizes, timeouts, pool capacity, and cache behavior.

pub(crate) mod http {
    pub(crate) mod query;
    pub(crate) mod request;
    pub(crate) mod response;
    pub(crate) mod types;
}
pub(crate) mod server {
    pub(crate) mod connection;
    pub(crate) mod server_impl;
}
pub(crate) mod app;
pub(crate) mod assets;
pub(crate) mod cache;
pub(crate) mod errors;
pub mod limits;
pub(crate) mod middleware;
pub(crate) mod router;

pub use crate::{
    app::{App, AppBuilder, ErrorHandler},
    cache::CacheStats,
    errors::ServerError,
    http::{
        request::Request,
        response::{BodyPin, Response},
        types::{HeaderList, Method, StatusCode, Version},
    },
    middleware::{Middleware, Next},
    router::Handler,
    server::server_impl::{Server, ServerBuilder},
};
