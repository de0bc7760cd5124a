//! Response construction and the scatter/gather writer.

use crate::{
    errors::ErrorKind,
    http::types::{HeaderList, StatusCode, Version},
};
use std::{fmt, io::IoSlice, sync::Arc, time::Duration};
use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    time::sleep,
};

// Serialized status line plus headers must fit this many bytes.
const HEADER_BLOCK_CAP: usize = 8 * 1024;

/// Pins a region of borrowed memory for the duration of a response body.
///
/// The `bytes` the pin exposes must stay readable for as long as the pin
/// exists; dropping the pin is the cleanup that releases the underlying
/// claim. The static asset pool hands out reference-counted pins so file
/// bodies can be written to the socket without copying.
pub trait BodyPin: Send + Sync {
    fn bytes(&self) -> &[u8];
}

impl BodyPin for Arc<[u8]> {
    #[inline(always)]
    fn bytes(&self) -> &[u8] {
        self
    }
}

pub(crate) enum Body {
    Owned(Vec<u8>),
    Borrowed(Box<dyn BodyPin>),
}

impl Body {
    #[inline(always)]
    fn bytes(&self) -> &[u8] {
        match self {
            Body::Owned(bytes) => bytes,
            Body::Borrowed(pin) => pin.bytes(),
        }
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Body::Owned(bytes) => write!(f, "Body::Owned({} bytes)", bytes.len()),
            Body::Borrowed(pin) => write!(f, "Body::Borrowed({} bytes)", pin.bytes().len()),
        }
    }
}

/// An HTTP response under construction.
///
/// Created by the serve loop with defaults (200 OK, the request's protocol
/// version, keep-alive), mutated by middleware and the handler, then
/// serialized and written in a single vectored write.
///
/// The body is exactly one of:
/// - owned bytes, set with [`set_body_owned`](Response::set_body_owned), or
/// - a borrowed region, set with
///   [`set_body_borrowed`](Response::set_body_borrowed), whose [`BodyPin`]
///   is dropped (running its cleanup) exactly once: when the body is
///   replaced or when the response is dropped, whichever comes first.
///
/// # Examples
/// ```
/// use hearth_web::{Response, StatusCode};
///
/// let mut resp = Response::new();
/// resp.status(StatusCode::Ok)
///     .header("content-type", "text/plain");
/// resp.set_body_owned("Hello, World!");
/// ```
#[derive(Debug)]
pub struct Response {
    pub(crate) version: Version,
    status: StatusCode,
    headers: HeaderList,
    body: Body,
    keep_alive: bool,
}

impl Response {
    #[inline(always)]
    pub fn new() -> Self {
        Self {
            version: Version::Http11,
            status: StatusCode::Ok,
            headers: HeaderList::new(),
            body: Body::Owned(Vec::new()),
            keep_alive: true,
        }
    }

    /// Sets the status code.
    #[inline]
    pub fn status(&mut self, status: StatusCode) -> &mut Self {
        self.status = status;
        self
    }

    #[inline(always)]
    pub const fn status_code(&self) -> StatusCode {
        self.status
    }

    #[inline(always)]
    pub const fn version(&self) -> Version {
        self.version
    }

    /// Appends a header. `content-length` and `connection` are synthesized
    /// at send time when absent, so most handlers never set them.
    #[inline]
    pub fn header(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.headers.push(name, value);
        self
    }

    #[inline(always)]
    pub fn headers(&self) -> &HeaderList {
        &self.headers
    }

    /// Forces the connection to close after this response.
    #[inline]
    pub fn close(&mut self) -> &mut Self {
        self.keep_alive = false;
        self
    }

    #[inline(always)]
    pub const fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// Replaces the body with owned bytes. A previously set borrowed pin is
    /// dropped here, releasing its claim.
    #[inline]
    pub fn set_body_owned(&mut self, bytes: impl Into<Vec<u8>>) -> &mut Self {
        self.body = Body::Owned(bytes.into());
        self
    }

    /// Replaces the body with a borrowed region held alive by `pin`. Any
    /// previous borrowed pin is dropped first.
    #[inline]
    pub fn set_body_borrowed(&mut self, pin: impl BodyPin + 'static) -> &mut Self {
        self.body = Body::Borrowed(Box::new(pin));
        self
    }

    /// The current body bytes, whichever variant is active.
    #[inline(always)]
    pub fn body_bytes(&self) -> &[u8] {
        self.body.bytes()
    }

    #[inline(always)]
    pub fn body_len(&self) -> usize {
        self.body.bytes().len()
    }
}

impl Default for Response {
    fn default() -> Self {
        Self::new()
    }
}

// Serialization and sending.
impl Response {
    /// Writes the serialized response in one vectored write, headers and
    /// body gathered into a single syscall where the transport allows.
    /// Each write attempt races the write timeout.
    pub(crate) async fn send<S: AsyncWrite + Unpin>(
        &mut self,
        stream: &mut S,
        timeout: Duration,
    ) -> Result<(), ErrorKind> {
        let head = self.serialize_head()?;
        write_all_vectored(stream, &head, self.body.bytes(), timeout).await
    }

    /// The complete wire form of this response, headers and body. Used by
    /// the serve loop to feed the reply cache after a send.
    pub(crate) fn to_bytes(&self) -> Result<Vec<u8>, ErrorKind> {
        let mut out = self.serialize_head()?;
        out.extend_from_slice(self.body.bytes());
        Ok(out)
    }

    // Status line, headers in insertion order, synthesized content-length
    // and connection when absent, terminating blank line.
    fn serialize_head(&self) -> Result<Vec<u8>, ErrorKind> {
        let mut head = Vec::with_capacity(256);
        head.extend_from_slice(self.status.status_line(self.version));

        for (name, value) in self.headers.iter() {
            head.extend_from_slice(name.as_bytes());
            head.extend_from_slice(b": ");
            head.extend_from_slice(value.as_bytes());
            head.extend_from_slice(b"\r\n");
        }

        if !self.headers.contains("content-length") {
            head.extend_from_slice(b"content-length: ");
            let (arr, start) = number_to_bytes(self.body.bytes().len() as u64);
            head.extend_from_slice(&arr[start..]);
            head.extend_from_slice(b"\r\n");
        }

        if !self.headers.contains("connection") {
            head.extend_from_slice(match self.keep_alive {
                true => b"connection: keep-alive\r\n" as &[u8],
                false => b"connection: close\r\n",
            });
        }

        head.extend_from_slice(b"\r\n");

        if head.len() > HEADER_BLOCK_CAP {
            return Err(ErrorKind::ResponseHeadersTooLarge);
        }
        Ok(head)
    }
}

#[inline]
const fn number_to_bytes(mut n: u64) -> ([u8; 20], usize) {
    let mut buffer = [b'0'; 20];
    let mut i = 20;

    if n == 0 {
        return (buffer, 19);
    }

    while n > 0 {
        i -= 1;
        buffer[i] = b'0' + (n % 10) as u8;
        n /= 10;
    }

    (buffer, i)
}

pub(crate) async fn write_all_vectored<S: AsyncWrite + Unpin>(
    stream: &mut S,
    head: &[u8],
    body: &[u8],
    timeout: Duration,
) -> Result<(), ErrorKind> {
    let mut slices = [IoSlice::new(head), IoSlice::new(body)];
    let mut bufs: &mut [IoSlice<'_>] = &mut slices;
    let mut remaining = head.len() + body.len();

    while remaining > 0 {
        let written = tokio::select! {
            biased;

            result = stream.write_vectored(bufs) => result?,
            _ = sleep(timeout) => {
                return Err(
                    std::io::Error::new(std::io::ErrorKind::TimedOut, "write timeout").into(),
                );
            }
        };

        if written == 0 {
            return Err(
                std::io::Error::new(std::io::ErrorKind::WriteZero, "connection stalled").into(),
            );
        }

        remaining -= written;
        IoSlice::advance_slices(&mut bufs, written);
    }

    stream.flush().await?;
    Ok(())
}

#[cfg(test)]
mod serialize_tests {
    use super::*;
    use crate::tools::str_op;

    #[test]
    fn defaults() {
        let resp = Response::new();
        let head = resp.serialize_head().unwrap();

        assert_eq!(
            str_op(&head),
            "HTTP/1.1 200 OK\r\ncontent-length: 0\r\nconnection: keep-alive\r\n\r\n"
        );
    }

    #[test]
    fn headers_in_insertion_order() {
        let mut resp = Response::new();
        resp.status(StatusCode::Found)
            .header("location", "/api/update")
            .header("x-first", "1")
            .header("x-second", "2");
        resp.set_body_owned("Sample body");

        let head = resp.serialize_head().unwrap();
        assert_eq!(
            str_op(&head),
            "HTTP/1.1 302 Found\r\n\
             location: /api/update\r\n\
             x-first: 1\r\n\
             x-second: 2\r\n\
             content-length: 11\r\n\
             connection: keep-alive\r\n\r\n"
        );
    }

    #[test]
    fn explicit_content_length_not_duplicated() {
        let mut resp = Response::new();
        resp.header("Content-Length", "5");
        resp.set_body_owned("hello");

        let head = resp.serialize_head().unwrap();
        let text = str_op(&head);
        assert_eq!(text.matches("ontent-").count(), 1);
        assert!(text.contains("Content-Length: 5\r\n"));
    }

    #[test]
    fn connection_synthesis() {
        #[rustfmt::skip]
        let cases = [
            (Version::Http11, true,  "connection: keep-alive\r\n"),
            (Version::Http11, false, "connection: close\r\n"),
            (Version::Http10, true,  "connection: keep-alive\r\n"),
            (Version::Http10, false, "connection: close\r\n"),
        ];

        for (version, keep_alive, expected) in cases {
            let mut resp = Response::new();
            resp.version = version;
            if !keep_alive {
                resp.close();
            }

            let head = resp.serialize_head().unwrap();
            assert!(str_op(&head).contains(expected), "{version:?} {keep_alive}");
        }
    }

    #[test]
    fn explicit_connection_wins() {
        let mut resp = Response::new();
        resp.header("connection", "upgrade");

        let head = resp.serialize_head().unwrap();
        let text = str_op(&head);
        assert!(text.contains("connection: upgrade\r\n"));
        assert!(!text.contains("keep-alive"));
    }

    #[test]
    fn oversized_header_block_rejected() {
        let mut resp = Response::new();
        resp.header("x-big", "v".repeat(HEADER_BLOCK_CAP));

        assert_eq!(
            resp.serialize_head().unwrap_err(),
            ErrorKind::ResponseHeadersTooLarge
        );
    }

    #[test]
    fn to_bytes_appends_body() {
        let mut resp = Response::new();
        resp.set_body_owned("abc");

        let wire = resp.to_bytes().unwrap();
        assert!(wire.ends_with(b"\r\n\r\nabc"));
    }

    #[test]
    fn headers_round_trip_through_parser() {
        let mut resp = Response::new();
        resp.header("X-Alpha", "one")
            .header("x-beta", " padded")
            .header("X-Alpha", "two");
        resp.set_body_owned("");

        let head = resp.serialize_head().unwrap();
        let raw = format!(
            "GET / HTTP/1.1\r\n{}",
            str_op(&head).split_once("\r\n").unwrap().1
        );
        let (req, _) =
            crate::http::request::parse_head(raw.as_bytes(), &crate::limits::ReqLimits::default())
                .unwrap();

        // Names compare case-insensitively, values come back trimmed.
        assert_eq!(req.header("x-alpha"), Some("one"));
        assert_eq!(req.header("X-BETA"), Some("padded"));
        let duplicates: Vec<_> = req
            .headers()
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case("x-alpha"))
            .collect();
        assert_eq!(duplicates.len(), 2);
    }
}

#[cfg(test)]
mod body_tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingPin {
        data: Vec<u8>,
        drops: Arc<AtomicUsize>,
    }

    impl BodyPin for CountingPin {
        fn bytes(&self) -> &[u8] {
            &self.data
        }
    }

    impl Drop for CountingPin {
        fn drop(&mut self) {
            self.drops.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn counting_pin(data: &[u8]) -> (CountingPin, Arc<AtomicUsize>) {
        let drops = Arc::new(AtomicUsize::new(0));
        (
            CountingPin {
                data: data.to_vec(),
                drops: drops.clone(),
            },
            drops,
        )
    }

    #[test]
    fn borrowed_body_bytes() {
        let (pin, _) = counting_pin(b"static file");
        let mut resp = Response::new();
        resp.set_body_borrowed(pin);

        assert_eq!(resp.body_bytes(), b"static file");
        assert_eq!(resp.body_len(), 11);
    }

    #[test]
    fn cleanup_runs_once_on_drop() {
        let (pin, drops) = counting_pin(b"x");
        {
            let mut resp = Response::new();
            resp.set_body_borrowed(pin);
            assert_eq!(drops.load(Ordering::SeqCst), 0);
        }
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cleanup_runs_once_on_replace_with_owned() {
        let (pin, drops) = counting_pin(b"x");
        let mut resp = Response::new();
        resp.set_body_borrowed(pin);
        resp.set_body_owned("replacement");

        assert_eq!(drops.load(Ordering::SeqCst), 1);
        drop(resp);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cleanup_runs_once_per_pin_on_replace_with_borrowed() {
        let (first, first_drops) = counting_pin(b"a");
        let (second, second_drops) = counting_pin(b"b");

        let mut resp = Response::new();
        resp.set_body_borrowed(first);
        resp.set_body_borrowed(second);

        assert_eq!(first_drops.load(Ordering::SeqCst), 1);
        assert_eq!(second_drops.load(Ordering::SeqCst), 0);

        drop(resp);
        assert_eq!(second_drops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cleanup_survives_send() {
        let (pin, drops) = counting_pin(b"zero copy");
        let mut resp = Response::new();
        resp.set_body_borrowed(pin);

        let (mut tx, _rx) = tokio::io::duplex(4096);
        resp.send(&mut tx, Duration::from_secs(1)).await.unwrap();

        // The pin survives the send so the serve loop can still serialize
        // the response for the reply cache; drop releases it exactly once.
        assert_eq!(drops.load(Ordering::SeqCst), 0);
        assert!(resp.to_bytes().unwrap().ends_with(b"zero copy"));

        drop(resp);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }
}
