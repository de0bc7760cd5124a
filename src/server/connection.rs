//! The per-connection serve loop.
//!
//! One `HttpConnection` belongs to one worker and is reused across
//! connections; its reader buffer is the only per-connection allocation.
//! Requests on a connection are fully serialized: pipelined bytes wait in
//! the reader until the previous response has been written.

use crate::{
    app::App,
    http::{
        request::RequestReader,
        response::{write_all_vectored, Response},
        types::Method,
    },
    limits::{ConnLimits, ReqLimits},
};
use std::{sync::Arc, time::Instant};
use tokio::io::{AsyncRead, AsyncWrite};

pub(crate) struct HttpConnection {
    app: Arc<App>,
    reader: RequestReader,
    conn_limits: ConnLimits,
}

impl HttpConnection {
    pub(crate) fn new(app: Arc<App>, req_limits: &ReqLimits, conn_limits: &ConnLimits) -> Self {
        Self {
            app,
            reader: RequestReader::new(req_limits),
            conn_limits: conn_limits.clone(),
        }
    }

    // Called between connections so leftovers never leak across peers.
    #[inline(always)]
    pub(crate) fn reset(&mut self) {
        self.reader.reset();
    }

    /// Serves requests until the connection is done: a read or write
    /// failure, a non-keep-alive exchange, or the connection limits.
    ///
    /// Per request: read, replay from the reply cache if it holds a stable
    /// blob for the target, otherwise dispatch through the app, send, and
    /// let the cache observe the serialized response when the handler was
    /// slow enough to be worth learning.
    pub(crate) async fn run<S: AsyncRead + AsyncWrite + Unpin>(&mut self, stream: &mut S) {
        let opened = Instant::now();
        let mut served = 0usize;

        loop {
            if served >= self.conn_limits.max_requests_per_connection
                || opened.elapsed() > self.conn_limits.connection_lifetime
            {
                break;
            }

            let Ok(mut req) = self.reader.receive(stream).await else {
                break;
            };
            req.attach(self.app.clone());
            let request_keep_alive = req.keep_alive();

            // Replay path: a stable blob goes straight to the socket and
            // routing, middleware, and the handler are all skipped.
            if req.method() == Method::Get {
                if let Some(blob) = self.app.cache().get(Method::Get, req.target()) {
                    let written = write_all_vectored(
                        stream,
                        &blob,
                        b"",
                        self.conn_limits.socket_write_timeout,
                    )
                    .await;
                    if written.is_err() {
                        break;
                    }

                    served += 1;
                    match request_keep_alive {
                        true => continue,
                        false => break,
                    }
                }
            }

            let mut res = Response::new();
            res.version = req.version();
            if !request_keep_alive {
                res.close();
            }

            let begun = Instant::now();
            self.app.dispatch(&mut req, &mut res);
            let elapsed = begun.elapsed();

            if res
                .send(stream, self.conn_limits.socket_write_timeout)
                .await
                .is_err()
            {
                break;
            }

            // Learn path: only GET, and only when the handler was slower
            // than the threshold.
            if req.method() == Method::Get && elapsed > self.app.cache().latency_threshold() {
                if let Ok(wire) = res.to_bytes() {
                    self.app.cache().put(Method::Get, req.target(), &wire);
                }
            }

            let keep_alive = request_keep_alive && res.keep_alive();
            drop(res);
            drop(req);

            served += 1;
            if !keep_alive {
                break;
            }
        }
    }
}
