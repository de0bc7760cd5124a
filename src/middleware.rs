//! The middleware chain.

use crate::http::{request::Request, response::Response};
use std::sync::Arc;

/// A middleware stage.
///
/// Receives the request, the response, and the continuation. A stage either
/// calls [`Next::run`] to forward (optionally doing work before or after),
/// or short-circuits by mutating the response and returning without calling
/// it.
///
/// # Examples
/// ```
/// use hearth_web::{Middleware, Next, Request, Response, StatusCode};
/// use std::sync::Arc;
///
/// let guard: Middleware = Arc::new(|req: &mut Request, resp: &mut Response, next: &mut Next| {
///     if req.header("x-api-key").is_none() {
///         resp.status(StatusCode::Unauthorized);
///         resp.set_body_owned("missing key");
///         return;
///     }
///     next.run(req, resp);
/// });
/// ```
pub type Middleware = Arc<dyn Fn(&mut Request, &mut Response, &mut Next<'_>) + Send + Sync>;

/// The continuation through the remaining middleware into the final handler.
///
/// Each dispatch gets its own `Next` cursor, so concurrent requests never
/// share chain state, and a stage invoking the continuation more than once
/// still advances exactly one node per call.
pub struct Next<'a> {
    chain: &'a [Middleware],
    handler: &'a dyn Fn(&mut Request, &mut Response),
}

impl<'a> Next<'a> {
    #[inline(always)]
    pub(crate) fn new(
        chain: &'a [Middleware],
        handler: &'a dyn Fn(&mut Request, &mut Response),
    ) -> Self {
        Self { chain, handler }
    }

    /// Invokes the next middleware, or the final handler once the chain is
    /// exhausted.
    pub fn run(&mut self, req: &mut Request, resp: &mut Response) {
        match self.chain.split_first() {
            Some((stage, rest)) => {
                self.chain = rest;
                stage(req, resp, self);
            }
            None => (self.handler)(req, resp),
        }
    }
}

/// Runs `handler` behind the full `chain` for one request.
#[inline]
pub(crate) fn execute_chain(
    chain: &[Middleware],
    handler: &dyn Fn(&mut Request, &mut Response),
    req: &mut Request,
    resp: &mut Response,
) {
    Next::new(chain, handler).run(req, resp);
}
