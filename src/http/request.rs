//! Request representation and the bounded connection reader.

use crate::{
    app::App,
    errors::ErrorKind,
    http::{
        query,
        types::{self, HeaderList, Method, Version},
    },
    limits::ReqLimits,
};
use memchr::{memchr, memmem};
use std::{sync::Arc, time::Duration};
use tokio::{io::AsyncRead, io::AsyncReadExt, time::sleep};

/// A parsed HTTP request.
///
/// All fields are owned; the connection's working buffer is reused for the
/// next request as soon as this one is constructed.
///
/// Handlers receive `&mut Request` together with the response. The owning
/// [`App`] is reachable through [`Request::app`] as an observed
/// back-reference attached by the serve loop.
pub struct Request {
    pub(crate) method: Method,
    pub(crate) target: String,
    pub(crate) path: String,
    pub(crate) query: String,
    pub(crate) query_params: Vec<(String, String)>,
    pub(crate) path_params: Vec<(String, String)>,
    pub(crate) version: Version,
    pub(crate) headers: HeaderList,
    pub(crate) body: Vec<u8>,
    pub(crate) keep_alive: bool,
    pub(crate) content_length: Option<usize>,
    pub(crate) app: Option<Arc<App>>,
}

impl Request {
    #[inline(always)]
    pub const fn method(&self) -> Method {
        self.method
    }

    /// The full request target as received: path plus raw query string.
    #[inline(always)]
    pub fn target(&self) -> &str {
        &self.target
    }

    /// The path component, query excluded.
    #[inline(always)]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The raw query string without the leading `?`, empty if absent.
    #[inline(always)]
    pub fn query(&self) -> &str {
        &self.query
    }

    /// The first query parameter with this name, in wire order.
    #[inline]
    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query_params
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// All query parameters in wire order.
    #[inline(always)]
    pub fn query_params(&self) -> &[(String, String)] {
        &self.query_params
    }

    /// A path parameter captured by a `:name` route segment.
    #[inline]
    pub fn param(&self, name: &str) -> Option<&str> {
        self.path_params
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// All captured path parameters.
    #[inline(always)]
    pub fn params(&self) -> &[(String, String)] {
        &self.path_params
    }

    #[inline(always)]
    pub const fn version(&self) -> Version {
        self.version
    }

    /// Case-insensitive header lookup, first match wins.
    #[inline]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    #[inline(always)]
    pub fn headers(&self) -> &HeaderList {
        &self.headers
    }

    #[inline(always)]
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Whether the client asked to keep the connection open. Initialized
    /// from the protocol version, then overridden by `Connection:`.
    #[inline(always)]
    pub const fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    #[inline(always)]
    pub const fn content_length(&self) -> Option<usize> {
        self.content_length
    }

    /// The application serving this request, once attached by the serve
    /// loop. Observed, never owned.
    #[inline]
    pub fn app(&self) -> Option<&App> {
        self.app.as_deref()
    }

    #[inline(always)]
    pub(crate) fn attach(&mut self, app: Arc<App>) {
        self.app = Some(app);
    }
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("method", &self.method)
            .field("target", &self.target)
            .field("version", &self.version)
            .field("headers", &self.headers)
            .field("body_len", &self.body.len())
            .field("keep_alive", &self.keep_alive)
            .finish_non_exhaustive()
    }
}

/// Reads requests off a connection into a persistent working buffer.
///
/// The buffer and its fill level survive across requests on the same
/// connection, so bytes pipelined past one request's body wait there as
/// leftovers for the next [`receive`](RequestReader::receive).
#[derive(Debug)]
pub(crate) struct RequestReader {
    buffer: Box<[u8]>,
    len: usize,
    limits: ReqLimits,
}

impl RequestReader {
    #[inline(always)]
    pub(crate) fn new(limits: &ReqLimits) -> Self {
        Self {
            buffer: vec![0; limits.buffer_size].into_boxed_slice(),
            len: 0,
            limits: limits.clone(),
        }
    }

    // Called between connections; the buffer allocation is kept.
    #[inline(always)]
    pub(crate) fn reset(&mut self) {
        self.len = 0;
    }

    /// Reads one complete request.
    ///
    /// Every failure means the caller must drop the connection; no partial
    /// state leaks because the buffer is only consumed on success.
    pub(crate) async fn receive<S: AsyncRead + Unpin>(
        &mut self,
        stream: &mut S,
    ) -> Result<Request, ErrorKind> {
        let header_end = self.read_head(stream).await?;
        let (mut request, content_length) = parse_head(&self.buffer[..header_end], &self.limits)?;

        let mut consumed = header_end;
        if let Some(expected) = content_length {
            let buffered = self.len - header_end;
            let seed = buffered.min(expected);

            request.body.resize(expected, 0);
            request.body[..seed].copy_from_slice(&self.buffer[header_end..header_end + seed]);
            consumed += seed;

            let mut filled = seed;
            while filled < expected {
                let n = read_with_timeout(
                    stream,
                    &mut request.body[filled..],
                    self.limits.read_timeout,
                )
                .await?;
                if n == 0 {
                    return Err(ErrorKind::PeerClosed);
                }
                filled += n;
            }
        }

        // Keep pipelined bytes for the next request on this connection.
        self.buffer.copy_within(consumed..self.len, 0);
        self.len -= consumed;

        Ok(request)
    }

    // Fills the buffer until the head terminator is present, enforcing the
    // header cap and the buffer bound.
    async fn read_head<S: AsyncRead + Unpin>(&mut self, stream: &mut S) -> Result<usize, ErrorKind> {
        loop {
            let window = self.len.min(self.limits.header_block_size);
            if let Some(pos) = memmem::find(&self.buffer[..window], b"\r\n\r\n") {
                return Ok(pos + 4);
            }
            if self.len >= self.limits.header_block_size {
                return Err(ErrorKind::HeadersTooLarge);
            }
            if self.len == self.buffer.len() {
                return Err(ErrorKind::BufferExhausted);
            }

            let n = read_with_timeout(
                stream,
                &mut self.buffer[self.len..],
                self.limits.read_timeout,
            )
            .await?;
            if n == 0 {
                return Err(ErrorKind::PeerClosed);
            }
            self.len += n;
        }
    }
}

#[inline]
async fn read_with_timeout<S: AsyncRead + Unpin>(
    stream: &mut S,
    buf: &mut [u8],
    time: Duration,
) -> Result<usize, ErrorKind> {
    tokio::select! {
        biased;

        read_result = stream.read(buf) => Ok(read_result?),
        _ = sleep(time) => Err(ErrorKind::Timeout),
    }
}

// Parses the request line and header block. `block` ends with the blank
// line terminator. Returns the request (body empty) and the declared
// content length.
pub(crate) fn parse_head(
    block: &[u8],
    limits: &ReqLimits,
) -> Result<(Request, Option<usize>), ErrorKind> {
    let line_end = memmem::find(block, b"\r\n").ok_or(ErrorKind::InvalidRequestLine)?;
    let line = &block[..line_end];

    let (method, after_method) = Method::from_bytes(line)?;

    let rest = &line[after_method..];
    let space = memchr(b' ', rest).ok_or(ErrorKind::InvalidRequestLine)?;
    let target_bytes = &rest[..space];
    if target_bytes.first() != Some(&b'/') {
        return Err(ErrorKind::InvalidRequestLine);
    }

    let target = simdutf8::basic::from_utf8(target_bytes)
        .map_err(|_| ErrorKind::InvalidRequestLine)?
        .to_string();

    let (version, implied_keep_alive) = Version::from_bytes(&rest[space + 1..])?;

    let (path, raw_query) = match target.find('?') {
        Some(idx) => (target[..idx].to_string(), target[idx + 1..].to_string()),
        None => (target.clone(), String::new()),
    };

    let mut query_params = Vec::new();
    query::parse_into(&mut query_params, raw_query.as_bytes(), limits.query_params);

    let mut request = Request {
        method,
        target,
        path,
        query: raw_query,
        query_params,
        path_params: Vec::new(),
        version,
        headers: HeaderList::new(),
        body: Vec::new(),
        keep_alive: implied_keep_alive,
        content_length: None,
        app: None,
    };

    parse_headers(&block[line_end + 2..], limits, &mut request)?;

    let content_length = request.content_length;
    Ok((request, content_length))
}

fn parse_headers(mut rest: &[u8], limits: &ReqLimits, request: &mut Request) -> Result<(), ErrorKind> {
    loop {
        let line_end = memmem::find(rest, b"\r\n").ok_or(ErrorKind::InvalidHeader)?;
        let line = &rest[..line_end];
        if line.is_empty() {
            return Ok(());
        }

        let colon = memchr(b':', line).ok_or(ErrorKind::InvalidHeader)?;
        let name = &line[..colon];
        if name.is_empty() {
            return Err(ErrorKind::InvalidHeader);
        }

        let mut value = &line[colon + 1..];
        while value.first() == Some(&b' ') {
            value = &value[1..];
        }

        parse_special_header(name, value, limits, request)?;
        request.headers.push(
            String::from_utf8_lossy(name).into_owned(),
            String::from_utf8_lossy(value).into_owned(),
        );

        rest = &rest[line_end + 2..];
    }
}

#[inline]
fn parse_special_header(
    name: &[u8],
    value: &[u8],
    limits: &ReqLimits,
    request: &mut Request,
) -> Result<(), ErrorKind> {
    if name.eq_ignore_ascii_case(b"content-length") {
        let len = types::slice_to_usize(value).ok_or(ErrorKind::InvalidContentLength)?;
        if len > limits.body_size {
            return Err(ErrorKind::BodyTooLarge);
        }
        request.content_length = Some(len);
    } else if name.eq_ignore_ascii_case(b"connection") {
        let mut normalized = [0; 10];
        let len = types::into_lower_case(value, &mut normalized);

        // Values other than the two recognized tokens are ignored.
        match &normalized[..len] {
            b"keep-alive" => request.keep_alive = true,
            b"close" => request.keep_alive = false,
            _ => {}
        }
    }

    Ok(())
}

#[cfg(test)]
mod parse_tests {
    use super::*;

    fn head(raw: &str) -> Result<(Request, Option<usize>), ErrorKind> {
        parse_head(raw.as_bytes(), &ReqLimits::default())
    }

    #[test]
    fn request_line() {
        #[rustfmt::skip]
        let cases = [
            ("GET / HTTP/1.1\r\n\r\n",            Ok((Method::Get, "/", Version::Http11, true))),
            ("GET /api/users HTTP/1.1\r\n\r\n",   Ok((Method::Get, "/api/users", Version::Http11, true))),
            ("POST /submit HTTP/1.0\r\n\r\n",     Ok((Method::Post, "/submit", Version::Http10, false))),
            ("HEAD / HTTP/1.0\r\n\r\n",           Ok((Method::Head, "/", Version::Http10, false))),
            ("DELETE /x/y HTTP/1.1\r\n\r\n",      Ok((Method::Delete, "/x/y", Version::Http11, true))),

            ("FETCH / HTTP/1.1\r\n\r\n",          Err(ErrorKind::InvalidRequestLine)),
            ("GET  HTTP/1.1\r\n\r\n",             Err(ErrorKind::InvalidRequestLine)),
            ("GET noslash HTTP/1.1\r\n\r\n",      Err(ErrorKind::InvalidRequestLine)),
            ("GET / HTTP/2.0\r\n\r\n",            Err(ErrorKind::InvalidRequestLine)),
            ("GET /\r\n\r\n",                     Err(ErrorKind::InvalidRequestLine)),
        ];

        for (raw, expected) in cases {
            match expected {
                Ok((method, target, version, keep_alive)) => {
                    let (req, _) = head(raw).unwrap();
                    assert_eq!(req.method(), method, "{raw:?}");
                    assert_eq!(req.target(), target);
                    assert_eq!(req.version(), version);
                    assert_eq!(req.keep_alive(), keep_alive);
                }
                Err(e) => assert_eq!(head(raw).unwrap_err(), e, "{raw:?}"),
            }
        }
    }

    #[test]
    fn query_split() {
        let (req, _) = head("GET /find?user=qwe&id=223&debug HTTP/1.1\r\n\r\n").unwrap();

        assert_eq!(req.target(), "/find?user=qwe&id=223&debug");
        assert_eq!(req.path(), "/find");
        assert_eq!(req.query(), "user=qwe&id=223&debug");
        assert_eq!(req.query_param("user"), Some("qwe"));
        assert_eq!(req.query_param("id"), Some("223"));
        assert_eq!(req.query_param("debug"), Some(""));
        assert_eq!(req.query_param("missing"), None);
    }

    #[test]
    fn headers() {
        let (req, _) = head(
            "GET / HTTP/1.1\r\nHost: 127.0.0.1\r\nX-Empty: \r\nUser-Agent: curl\r\n\r\n",
        )
        .unwrap();

        assert_eq!(req.header("host"), Some("127.0.0.1"));
        assert_eq!(req.header("HOST"), Some("127.0.0.1"));
        assert_eq!(req.header("x-empty"), Some(""));
        assert_eq!(req.header("user-agent"), Some("curl"));
        assert_eq!(req.headers().len(), 3);
    }

    #[test]
    fn invalid_headers() {
        #[rustfmt::skip]
        let cases = [
            ("GET / HTTP/1.1\r\nNo-Colon value\r\n\r\n",  ErrorKind::InvalidHeader),
            ("GET / HTTP/1.1\r\n: empty-name\r\n\r\n",    ErrorKind::InvalidHeader),
        ];

        for (raw, expected) in cases {
            assert_eq!(head(raw).unwrap_err(), expected, "{raw:?}");
        }
    }

    #[test]
    fn connection_overrides() {
        #[rustfmt::skip]
        let cases = [
            ("GET / HTTP/1.1\r\n\r\n",                            true),
            ("GET / HTTP/1.0\r\n\r\n",                            false),
            ("GET / HTTP/1.1\r\nConnection: close\r\n\r\n",       false),
            ("GET / HTTP/1.1\r\nCoNNEctIon: CLOSE\r\n\r\n",       false),
            ("GET / HTTP/1.0\r\nConnection: keep-alive\r\n\r\n",  true),
            ("GET / HTTP/1.1\r\nConnection: upgrade\r\n\r\n",     true),
            ("GET / HTTP/1.0\r\nConnection: nonsense\r\n\r\n",    false),
        ];

        for (raw, keep_alive) in cases {
            let (req, _) = head(raw).unwrap();
            assert_eq!(req.keep_alive(), keep_alive, "{raw:?}");
        }
    }

    #[test]
    fn content_length() {
        let (_, len) = head("POST / HTTP/1.1\r\nContent-Length: 1256\r\n\r\n").unwrap();
        assert_eq!(len, Some(1256));

        assert_eq!(
            head("POST / HTTP/1.1\r\nContent-Length: 12a\r\n\r\n").unwrap_err(),
            ErrorKind::InvalidContentLength
        );
    }

    #[test]
    fn body_cap_boundary() {
        let cap = ReqLimits::default().body_size;

        let (_, len) = head(&format!("POST / HTTP/1.1\r\nContent-Length: {cap}\r\n\r\n")).unwrap();
        assert_eq!(len, Some(cap));

        assert_eq!(
            head(&format!(
                "POST / HTTP/1.1\r\nContent-Length: {}\r\n\r\n",
                cap + 1
            ))
            .unwrap_err(),
            ErrorKind::BodyTooLarge
        );
    }
}

#[cfg(test)]
mod reader_tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    async fn reader_with(raw: &[u8]) -> (RequestReader, tokio::io::DuplexStream) {
        let (mut tx, rx) = tokio::io::duplex(64 * 1024);
        tx.write_all(raw).await.unwrap();
        drop(tx);
        (RequestReader::new(&ReqLimits::default()), rx)
    }

    #[tokio::test]
    async fn simple_request() {
        let (mut reader, mut rx) = reader_with(b"GET /hello HTTP/1.1\r\nHost: x\r\n\r\n").await;

        let req = reader.receive(&mut rx).await.unwrap();
        assert_eq!(req.path(), "/hello");
        assert!(req.body().is_empty());
        assert_eq!(reader.len, 0);
    }

    #[tokio::test]
    async fn body_read_exactly() {
        let (mut reader, mut rx) =
            reader_with(b"POST /up HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello").await;

        let req = reader.receive(&mut rx).await.unwrap();
        assert_eq!(req.body(), b"hello");
        assert_eq!(req.content_length(), Some(5));
    }

    #[tokio::test]
    async fn pipelined_leftovers_survive() {
        let raw = b"GET /a HTTP/1.1\r\n\r\nGET /b HTTP/1.1\r\nConnection: close\r\n\r\n";
        let (mut reader, mut rx) = reader_with(raw).await;

        let first = reader.receive(&mut rx).await.unwrap();
        assert_eq!(first.path(), "/a");
        assert!(reader.len > 0);

        let second = reader.receive(&mut rx).await.unwrap();
        assert_eq!(second.path(), "/b");
        assert!(!second.keep_alive());
        assert_eq!(reader.len, 0);
    }

    #[tokio::test]
    async fn body_boundary_leaves_leftovers() {
        let raw = b"POST /a HTTP/1.1\r\nContent-Length: 3\r\n\r\nabcGET /b HTTP/1.1\r\n\r\n";
        let (mut reader, mut rx) = reader_with(raw).await;

        let first = reader.receive(&mut rx).await.unwrap();
        assert_eq!(first.body(), b"abc");

        let second = reader.receive(&mut rx).await.unwrap();
        assert_eq!(second.path(), "/b");
    }

    #[tokio::test]
    async fn peer_close_is_reported() {
        let (mut reader, mut rx) = reader_with(b"GET /partial HTT").await;

        assert_eq!(
            reader.receive(&mut rx).await.unwrap_err(),
            ErrorKind::PeerClosed
        );
    }

    #[tokio::test]
    async fn header_cap_boundary() {
        let cap = ReqLimits::default().header_block_size;

        // Pad the head so the terminator ends exactly at the cap.
        let skeleton = "GET / HTTP/1.1\r\nX-Pad: \r\n\r\n";
        let pad = cap - skeleton.len();
        let exact = format!("GET / HTTP/1.1\r\nX-Pad: {}\r\n\r\n", "p".repeat(pad));
        assert_eq!(exact.len(), cap);

        let (mut reader, mut rx) = reader_with(exact.as_bytes()).await;
        assert!(reader.receive(&mut rx).await.is_ok());

        let over = format!("GET / HTTP/1.1\r\nX-Pad: {}\r\n\r\n", "p".repeat(pad + 1));
        let (mut reader, mut rx) = reader_with(over.as_bytes()).await;
        assert_eq!(
            reader.receive(&mut rx).await.unwrap_err(),
            ErrorKind::HeadersTooLarge
        );
    }
}
