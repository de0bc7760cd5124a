//! The application value: routes, middleware, static mappings, the reply
//! cache, and the dispatch pipeline that binds them.

use crate::{
    assets::{self, StaticDir, StaticPool},
    cache::{CacheStats, ReplyCache},
    http::{
        request::Request,
        response::Response,
        types::{Method, StatusCode},
    },
    limits::{CacheLimits, PoolLimits},
    middleware::{execute_chain, Middleware},
    router::Router,
};
use std::{any::Any, path::PathBuf, sync::Arc};

/// Invoked when no static mapping or route claims a request.
pub type ErrorHandler = Arc<dyn Fn(&mut Request, &mut Response, StatusCode) + Send + Sync>;

/// Everything one application serves: the router, the middleware chain,
/// static directory mappings backed by the in-memory pool, the learning
/// reply cache, and optional shared state for handlers.
///
/// Built once with [`App::builder`], then handed to a
/// [`Server`](crate::Server). Requests reach it through worker tasks; after
/// `build()` the app is read-only apart from the cache and pool internals,
/// which synchronize themselves.
///
/// # Examples
/// ```
/// use hearth_web::{App, StatusCode};
///
/// let app = App::builder()
///     .get("/hello", |_req, resp| {
///         resp.status(StatusCode::Ok);
///         resp.set_body_owned("Hello, World!");
///     })
///     .build();
/// ```
pub struct App {
    router: Router,
    middleware: Vec<Middleware>,
    static_dirs: Vec<StaticDir>,
    pool: Option<StaticPool>,
    cache: ReplyCache,
    error_handler: Option<ErrorHandler>,
    shared: Option<Arc<dyn Any + Send + Sync>>,
}

impl App {
    pub fn builder() -> AppBuilder {
        AppBuilder {
            router: Router::new(),
            middleware: Vec::new(),
            static_dirs: Vec::new(),
            error_handler: None,
            shared: None,
            cache_limits: CacheLimits::default(),
            pool_limits: PoolLimits::default(),
        }
    }

    /// Shared application data registered at build time.
    #[inline]
    pub fn shared(&self) -> Option<&(dyn Any + Send + Sync)> {
        self.shared.as_deref()
    }

    /// Shared data downcast to a concrete type.
    ///
    /// # Examples
    /// ```
    /// use hearth_web::App;
    ///
    /// struct Counters;
    ///
    /// let app = App::builder().shared(Counters).build();
    /// assert!(app.shared_as::<Counters>().is_some());
    /// ```
    #[inline]
    pub fn shared_as<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.shared.as_deref().and_then(|s| s.downcast_ref())
    }

    /// Reply-cache occupancy counters.
    #[inline]
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    #[inline(always)]
    pub(crate) fn cache(&self) -> &ReplyCache {
        &self.cache
    }

    /// Resolves and runs one request: static prefix first, then literal
    /// route, then parameterized route, then the error handler. Every
    /// resolved endpoint runs behind the middleware chain.
    pub(crate) fn dispatch(&self, req: &mut Request, res: &mut Response) {
        if matches!(req.method(), Method::Get | Method::Head) {
            if let Some(prepared) = self.prepare_static(req) {
                let serve = |req: &mut Request, res: &mut Response| {
                    self.serve_static(&prepared, req, res)
                };
                execute_chain(&self.middleware, &serve, req, res);
                return;
            }
        }

        req.path_params.clear();

        if let Some(handler) = self.router.lookup_literal(req.method(), req.path()) {
            execute_chain(&self.middleware, &**handler, req, res);
            return;
        }

        let mut params = std::mem::take(&mut req.path_params);
        let matched = self
            .router
            .match_params(req.method(), req.path(), &mut params)
            .cloned();
        req.path_params = params;

        if let Some(handler) = matched {
            execute_chain(&self.middleware, &*handler, req, res);
            return;
        }

        match &self.error_handler {
            Some(handler) => handler(req, res, StatusCode::NotFound),
            None => {
                res.status(StatusCode::NotFound);
                res.set_body_owned("404 Not Found");
            }
        }
    }

    // Resolves the request path against the registered mappings, producing
    // the owned relative path the static handler will serve.
    fn prepare_static(&self, req: &Request) -> Option<PreparedStatic> {
        if self.pool.is_none() {
            return None;
        }

        for dir in &self.static_dirs {
            if let Some(target) = assets::match_prefix(dir, req.path()) {
                let relative = match target.relative {
                    Some(rel) if !target.use_index && !rel.is_empty() => rel.to_string(),
                    _ => "index.html".to_string(),
                };
                return Some(PreparedStatic {
                    root: target.dir.root.clone(),
                    relative,
                });
            }
        }
        None
    }

    fn serve_static(&self, prepared: &PreparedStatic, req: &mut Request, res: &mut Response) {
        if assets::has_parent_ref(&prepared.relative) {
            res.status(StatusCode::Forbidden);
            res.set_body_owned("Directory traversal blocked");
            return;
        }

        let fs_path = prepared.root.join(&prepared.relative);
        let Some(pool) = &self.pool else {
            res.status(StatusCode::InternalServerError);
            res.set_body_owned("Static pool not initialized");
            return;
        };

        match pool.lookup(&fs_path) {
            Some((node, size)) => {
                res.header("content-length", size.to_string());
                res.header("content-type", assets::mime_for(&fs_path));
                if req.method() != Method::Head {
                    res.set_body_borrowed(node);
                }
                res.status(StatusCode::Ok);
            }
            None => {
                res.status(StatusCode::NotFound);
                res.set_body_owned("Not Found");
            }
        }
    }
}

struct PreparedStatic {
    root: PathBuf,
    relative: String,
}

/// Configures and constructs an [`App`].
pub struct AppBuilder {
    router: Router,
    middleware: Vec<Middleware>,
    static_dirs: Vec<StaticDir>,
    error_handler: Option<ErrorHandler>,
    shared: Option<Arc<dyn Any + Send + Sync>>,
    cache_limits: CacheLimits,
    pool_limits: PoolLimits,
}

impl AppBuilder {
    /// Registers a route. Patterns may contain `:name` segments which
    /// capture into the request's path parameters.
    pub fn route(
        mut self,
        method: Method,
        pattern: &str,
        handler: impl Fn(&mut Request, &mut Response) + Send + Sync + 'static,
    ) -> Self {
        self.router.insert(method, pattern, Arc::new(handler));
        self
    }

    pub fn get(
        self,
        pattern: &str,
        handler: impl Fn(&mut Request, &mut Response) + Send + Sync + 'static,
    ) -> Self {
        self.route(Method::Get, pattern, handler)
    }

    pub fn post(
        self,
        pattern: &str,
        handler: impl Fn(&mut Request, &mut Response) + Send + Sync + 'static,
    ) -> Self {
        self.route(Method::Post, pattern, handler)
    }

    pub fn put(
        self,
        pattern: &str,
        handler: impl Fn(&mut Request, &mut Response) + Send + Sync + 'static,
    ) -> Self {
        self.route(Method::Put, pattern, handler)
    }

    pub fn delete(
        self,
        pattern: &str,
        handler: impl Fn(&mut Request, &mut Response) + Send + Sync + 'static,
    ) -> Self {
        self.route(Method::Delete, pattern, handler)
    }

    pub fn head(
        self,
        pattern: &str,
        handler: impl Fn(&mut Request, &mut Response) + Send + Sync + 'static,
    ) -> Self {
        self.route(Method::Head, pattern, handler)
    }

    /// Appends a middleware stage. Stages run in registration order around
    /// every resolved endpoint, static assets included.
    pub fn middleware(
        mut self,
        mw: impl Fn(&mut Request, &mut Response, &mut crate::middleware::Next<'_>)
            + Send
            + Sync
            + 'static,
    ) -> Self {
        self.middleware.push(Arc::new(mw));
        self
    }

    /// Maps a URL prefix onto a filesystem directory whose files are
    /// loaded into the static pool at build time.
    pub fn static_dir(mut self, url_prefix: &str, directory: &str) -> Self {
        self.static_dirs.push(StaticDir {
            prefix: assets::normalize_prefix(url_prefix),
            root: assets::normalize_root(directory),
        });
        self
    }

    /// Overrides the route-miss handler (default: 404 with body
    /// `404 Not Found`).
    pub fn error_handler(
        mut self,
        handler: impl Fn(&mut Request, &mut Response, StatusCode) + Send + Sync + 'static,
    ) -> Self {
        self.error_handler = Some(Arc::new(handler));
        self
    }

    /// Registers shared application data, reachable from handlers via
    /// [`Request::app`] and [`App::shared_as`].
    pub fn shared(mut self, value: impl Any + Send + Sync) -> Self {
        self.shared = Some(Arc::new(value));
        self
    }

    pub fn cache_limits(mut self, limits: CacheLimits) -> Self {
        self.cache_limits = limits;
        self
    }

    pub fn pool_limits(mut self, limits: PoolLimits) -> Self {
        self.pool_limits = limits;
        self
    }

    /// Loads the static pool, starts its watcher, and finalizes the app.
    pub fn build(self) -> App {
        let pool = match self.static_dirs.is_empty() {
            true => None,
            false => {
                let mut pool = StaticPool::build(&self.static_dirs, &self.pool_limits);
                pool.start_watcher();
                Some(pool)
            }
        };

        App {
            router: self.router,
            middleware: self.middleware,
            static_dirs: self.static_dirs,
            pool,
            cache: ReplyCache::new(self.cache_limits),
            error_handler: self.error_handler,
            shared: self.shared,
        }
    }
}

#[cfg(test)]
mod dispatch_tests {
    use super::*;
    use crate::{http::request::parse_head, limits::ReqLimits};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn request(method: &str, target: &str) -> Request {
        let raw = format!("{method} {target} HTTP/1.1\r\n\r\n");
        parse_head(raw.as_bytes(), &ReqLimits::default()).unwrap().0
    }

    fn run(app: &App, method: &str, target: &str) -> (Request, Response) {
        let mut req = request(method, target);
        let mut res = Response::new();
        app.dispatch(&mut req, &mut res);
        (req, res)
    }

    #[test]
    fn default_route_miss_is_404() {
        let app = App::builder().build();
        let (_, res) = run(&app, "GET", "/missing");

        assert_eq!(res.status_code(), StatusCode::NotFound);
        assert_eq!(res.body_bytes(), b"404 Not Found");
    }

    #[test]
    fn custom_error_handler_runs() {
        let app = App::builder()
            .error_handler(|_req, res, status| {
                res.status(status);
                res.set_body_owned("custom miss page");
            })
            .build();

        let (_, res) = run(&app, "GET", "/none");
        assert_eq!(res.status_code(), StatusCode::NotFound);
        assert_eq!(res.body_bytes(), b"custom miss page");
    }

    #[test]
    fn literal_route_resolves() {
        let app = App::builder()
            .get("/hello", |_req, res| {
                res.set_body_owned("hi");
            })
            .build();

        let (_, res) = run(&app, "GET", "/hello");
        assert_eq!(res.body_bytes(), b"hi");
        assert_eq!(res.status_code(), StatusCode::Ok);
    }

    // GET /users/:id/posts invoked with /users/42/posts captures id=42;
    // /users/42 misses it.
    #[test]
    fn param_route_captures_into_request() {
        let app = App::builder()
            .get("/users/:id/posts", |req, res| {
                let id = req.param("id").unwrap_or("?").to_string();
                res.set_body_owned(format!("posts of {id}"));
            })
            .build();

        let (req, res) = run(&app, "GET", "/users/42/posts");
        assert_eq!(res.body_bytes(), b"posts of 42");
        assert_eq!(req.param("id"), Some("42"));

        let (_, res) = run(&app, "GET", "/users/42");
        assert_eq!(res.status_code(), StatusCode::NotFound);
    }

    #[test]
    fn literal_beats_param() {
        let app = App::builder()
            .get("/users/:id", |_req, res| {
                res.set_body_owned("param");
            })
            .get("/users/me", |_req, res| {
                res.set_body_owned("literal");
            })
            .build();

        let (_, res) = run(&app, "GET", "/users/me");
        assert_eq!(res.body_bytes(), b"literal");

        let (_, res) = run(&app, "GET", "/users/7");
        assert_eq!(res.body_bytes(), b"param");
    }

    #[test]
    fn params_reset_between_requests() {
        let app = App::builder()
            .get("/a/:x", |_req, res| {
                res.set_body_owned("a");
            })
            .get("/plain", |_req, res| {
                res.set_body_owned("p");
            })
            .build();

        let mut req = request("GET", "/a/1");
        let mut res = Response::new();
        app.dispatch(&mut req, &mut res);
        assert_eq!(req.param("x"), Some("1"));

        // Redirect the same request object at a literal route: captures
        // from the previous dispatch must not leak through.
        req.path = "/plain".to_string();
        req.target = "/plain".to_string();
        let mut res = Response::new();
        app.dispatch(&mut req, &mut res);
        assert!(req.params().is_empty());
        assert_eq!(res.body_bytes(), b"p");
    }

    #[test]
    fn middleware_wraps_routes() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        let mw_order = order.clone();
        let handler_order = order.clone();
        let app = App::builder()
            .middleware(move |req, res, next| {
                mw_order.lock().unwrap().push("mw");
                next.run(req, res);
            })
            .get("/x", move |_req, _res| {
                handler_order.lock().unwrap().push("handler");
            })
            .build();

        run(&app, "GET", "/x");
        assert_eq!(*order.lock().unwrap(), vec!["mw", "handler"]);
    }

    #[test]
    fn middleware_short_circuit_blocks_handler() {
        let reached = Arc::new(AtomicUsize::new(0));

        let reached_clone = reached.clone();
        let app = App::builder()
            .middleware(|_req, res, _next| {
                res.status(StatusCode::Unauthorized);
            })
            .get("/locked", move |_req, _res| {
                reached_clone.fetch_add(1, Ordering::SeqCst);
            })
            .build();

        let (_, res) = run(&app, "GET", "/locked");
        assert_eq!(res.status_code(), StatusCode::Unauthorized);
        assert_eq!(reached.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn shared_data_reachable_from_handler() {
        struct Flag(&'static str);

        let app = App::builder()
            .shared(Flag("present"))
            .get("/s", |req, res| {
                let text = req
                    .app()
                    .and_then(|app| app.shared_as::<Flag>())
                    .map(|f| f.0)
                    .unwrap_or("absent");
                res.set_body_owned(text);
            })
            .build();

        let app = Arc::new(app);
        let mut req = request("GET", "/s");
        req.attach(app.clone());
        let mut res = Response::new();
        app.dispatch(&mut req, &mut res);

        assert_eq!(res.body_bytes(), b"present");
    }
}
