//! Listener setup, admission control, and the worker pool.

use crate::{
    app::App,
    errors::{ServerError, BLOB_503},
    http::response::write_all_vectored,
    limits::{ConnLimits, ReqLimits, ServerLimits, WaitStrategy},
    server::connection::HttpConnection,
};
use crossbeam::queue::SegQueue;
use std::{net::SocketAddr, sync::Arc};
use tokio::{
    net::{TcpListener, TcpStream},
    task::yield_now,
    time::sleep as tokio_sleep,
};
use tracing::{error, info};

/// The HTTP server.
///
/// Accepted connections land in a pending queue drained by a fixed pool of
/// worker tasks; each worker owns one reusable connection state and serves
/// one connection at a time. When the queue is full, dedicated responders
/// answer with 503 and close.
///
/// # Examples
///
/// ```no_run
/// use hearth_web::{App, Server, StatusCode};
///
/// #[tokio::main]
/// async fn main() {
///     let app = App::builder()
///         .get("/", |_req, resp| {
///             resp.status(StatusCode::Ok);
///             resp.set_body_owned("Hello world!");
///         })
///         .build();
///
///     Server::builder()
///         .bind("127.0.0.1", 8080, 128).await.unwrap()
///         .app(app)
///         .build()
///         .launch()
///         .await;
/// }
/// ```
pub struct Server {
    listener: TcpListener,
    stream_queue: TcpQueue,
    error_queue: TcpQueue,
    server_limits: ServerLimits,
}

impl Server {
    /// Creates a builder for configuring the server.
    #[inline]
    pub fn builder() -> ServerBuilder {
        ServerBuilder {
            listener: None,
            app: None,
            server_limits: None,
            connection_limits: None,
            request_limits: None,
        }
    }

    /// The bound local address.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts connections until the process ends. Never returns under
    /// normal operation.
    pub async fn launch(self) {
        info!(
            addr = ?self.listener.local_addr().ok(),
            workers = self.server_limits.max_connections,
            "server accepting connections",
        );

        loop {
            let Ok(value) = self.listener.accept().await else {
                continue;
            };

            match self.stream_queue.len() < self.server_limits.max_pending_connections {
                true => self.stream_queue.push(value),
                false => self.error_queue.push(value),
            }
        }
    }

    #[inline]
    async fn get_stream(queue: &TcpQueue, wait: &WaitStrategy) -> (TcpStream, SocketAddr) {
        loop {
            if let Some(value) = queue.pop() {
                return value;
            }

            match wait {
                WaitStrategy::Yield => yield_now().await,
                WaitStrategy::Sleep(time) => tokio_sleep(*time).await,
            }
        }
    }
}

/// Builder for [`Server`] instances.
pub struct ServerBuilder {
    listener: Option<TcpListener>,
    app: Option<Arc<App>>,
    server_limits: Option<ServerLimits>,
    connection_limits: Option<ConnLimits>,
    request_limits: Option<ReqLimits>,
}

impl ServerBuilder {
    /// Uses an already-bound listener.
    #[inline(always)]
    pub fn listener(mut self, listener: TcpListener) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Binds a listener with `SO_REUSEADDR` and the given backlog.
    ///
    /// This is the path a binary should surface failures from: a bind or
    /// listen error here is the non-zero-exit case.
    pub async fn bind(mut self, host: &str, port: u16, backlog: u32) -> Result<Self, ServerError> {
        use socket2::{Domain, Protocol, Socket, Type};

        let addr_text = format!("{host}:{port}");
        let addr: SocketAddr = addr_text.parse().map_err(|_| ServerError::Bind {
            addr: addr_text.clone(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "unparseable address"),
        })?;

        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into()).map_err(|source| {
            error!(%addr, %source, "bind failed");
            ServerError::Bind {
                addr: addr_text.clone(),
                source,
            }
        })?;
        socket.listen(backlog as i32).map_err(|source| {
            error!(%addr, %source, "listen failed");
            ServerError::Listen {
                addr: addr_text,
                source,
            }
        })?;
        socket.set_nonblocking(true)?;

        let std_listener: std::net::TcpListener = socket.into();
        self.listener = Some(TcpListener::from_std(std_listener)?);
        Ok(self)
    }

    /// Sets the application the server dispatches into.
    /// **This is a required component.**
    #[inline(always)]
    pub fn app(mut self, app: App) -> Self {
        self.app = Some(Arc::new(app));
        self
    }

    #[inline(always)]
    pub fn server_limits(mut self, limits: ServerLimits) -> Self {
        self.server_limits = Some(limits);
        self
    }

    #[inline(always)]
    pub fn connection_limits(mut self, limits: ConnLimits) -> Self {
        self.connection_limits = Some(limits);
        self
    }

    #[inline(always)]
    pub fn request_limits(mut self, limits: ReqLimits) -> Self {
        self.request_limits = Some(limits);
        self
    }

    /// Spawns the worker pool and finalizes the server.
    ///
    /// # Panics
    ///
    /// Panics when no listener was provided (via
    /// [`listener`](Self::listener) or [`bind`](Self::bind)) or no app was
    /// set.
    #[inline]
    #[track_caller]
    pub fn build(self) -> Server {
        let listener = self
            .listener
            .expect("a `listener` or `bind` call is required to create");
        let app = self.app.expect("the `app` method must be called to create");

        let server_limits = self.server_limits.unwrap_or_default();
        let conn_limits = self.connection_limits.unwrap_or_default();
        let req_limits = self.request_limits.unwrap_or_default();

        let stream_queue: TcpQueue = Arc::new(SegQueue::new());
        let error_queue: TcpQueue = Arc::new(SegQueue::new());

        for _ in 0..server_limits.max_connections {
            spawn_worker(
                &stream_queue,
                &app,
                &server_limits,
                &conn_limits,
                &req_limits,
            );
        }
        match server_limits.count_503_handlers {
            0 => spawn_quiet_alarmist(&error_queue, &server_limits),
            n => {
                for _ in 0..n {
                    spawn_alarmist(&error_queue, &server_limits, &conn_limits);
                }
            }
        }

        Server {
            listener,
            stream_queue,
            error_queue,
            server_limits,
        }
    }
}

#[inline]
fn spawn_worker(
    queue: &TcpQueue,
    app: &Arc<App>,
    server_limits: &ServerLimits,
    conn_limits: &ConnLimits,
    req_limits: &ReqLimits,
) {
    let queue = queue.clone();
    let wait = server_limits.wait_strategy.clone();
    let mut conn = HttpConnection::new(app.clone(), req_limits, conn_limits);

    tokio::spawn(async move {
        loop {
            let (mut stream, _) = Server::get_stream(&queue, &wait).await;
            conn.reset();
            conn.run(&mut stream).await;
        }
    });
}

#[inline]
fn spawn_alarmist(queue: &TcpQueue, server_limits: &ServerLimits, conn_limits: &ConnLimits) {
    let queue = queue.clone();
    let wait = server_limits.wait_strategy.clone();
    let write_timeout = conn_limits.socket_write_timeout;

    tokio::spawn(async move {
        loop {
            let (mut stream, _) = Server::get_stream(&queue, &wait).await;
            let _ = write_all_vectored(&mut stream, BLOB_503, b"", write_timeout).await;
        }
    });
}

#[inline]
fn spawn_quiet_alarmist(queue: &TcpQueue, server_limits: &ServerLimits) {
    let queue = queue.clone();
    let wait = server_limits.wait_strategy.clone();

    tokio::spawn(async move {
        loop {
            let (stream, _) = Server::get_stream(&queue, &wait).await;
            drop(stream);
        }
    });
}

type TcpQueue = Arc<SegQueue<(TcpStream, SocketAddr)>>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StatusCode;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn hello_app() -> App {
        App::builder()
            .get("/", |_req, res| {
                res.status(StatusCode::Ok);
                res.set_body_owned("hello from pool");
            })
            .build()
    }

    #[tokio::test]
    async fn serves_over_real_sockets() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = Server::builder()
            .listener(listener)
            .app(hello_app())
            .server_limits(ServerLimits {
                max_connections: 2,
                ..ServerLimits::default()
            })
            .build();
        let server_task = tokio::spawn(server.launch());

        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();

        let mut captured = Vec::new();
        client.read_to_end(&mut captured).await.unwrap();

        let text = String::from_utf8(captured).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.ends_with("hello from pool"));

        server_task.abort();
    }

    #[tokio::test]
    async fn bind_sets_up_listener() {
        let server = Server::builder()
            .bind("127.0.0.1", 0, 128)
            .await
            .unwrap()
            .app(hello_app())
            .build();

        let addr = server.local_addr().unwrap();
        assert_eq!(addr.ip().to_string(), "127.0.0.1");
        assert_ne!(addr.port(), 0);
    }

    #[tokio::test]
    async fn bind_failure_surfaces() {
        let first = Server::builder().bind("127.0.0.1", 0, 128).await.unwrap();
        let addr = first.listener.as_ref().unwrap().local_addr().unwrap();

        // SO_REUSEADDR does not allow two live listeners on the same port
        // without SO_REUSEPORT, so a second bind must fail.
        let second = Server::builder().bind("127.0.0.1", addr.port(), 128).await;
        assert!(matches!(
            second.map(|_| ()),
            Err(ServerError::Bind { .. }) | Err(ServerError::Listen { .. })
        ));
    }

    #[tokio::test]
    async fn unparseable_address_is_a_bind_error() {
        let result = Server::builder().bind("not an address", 80, 1).await;
        assert!(matches!(result.map(|_| ()), Err(ServerError::Bind { .. })));
    }
}
