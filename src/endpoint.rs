//! The endpoint capability: one remote target that can be connected to and
//! read from.

use std::fmt;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use serde_derive::Deserialize;
use tokio::io::{self, AsyncRead, AsyncReadExt, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::{self, Instant, Sleep};

use crate::error::Result;

/// Byte stream handed out by [`Endpoint::reader`].
pub type EndpointStream<'a> = Box<dyn AsyncRead + Send + Unpin + 'a>;

/// A single remote target.
///
/// The searcher owns an endpoint for the duration of one scan: it calls
/// [`connect`](Endpoint::connect), reads through [`read`](Endpoint::read),
/// then [`close`](Endpoint::close)s it exactly once whatever the outcome.
#[async_trait]
pub trait Endpoint: fmt::Debug + Send {
    /// Opens the connection, giving up after `timeout`.
    async fn connect(&mut self, timeout: Duration) -> io::Result<()>;

    /// Unbounded stream of the endpoint's content. Only valid after a
    /// successful [`connect`](Endpoint::connect).
    fn reader(&mut self) -> io::Result<EndpointStream<'_>>;

    /// Releases the connection. Must be safe to call on an endpoint that
    /// never connected.
    async fn close(&mut self) -> io::Result<()>;

    /// Address of the target.
    fn address(&self) -> IpAddr;

    /// Port of the target.
    fn port(&self) -> u16;

    /// Human readable identity, typically a connection string.
    fn identity(&self) -> String;

    /// Content stream that yields at most `limit` bytes (0 means unlimited).
    fn read(&mut self, limit: u64) -> io::Result<EndpointStream<'_>> {
        let stream = self.reader()?;
        if limit == 0 {
            Ok(stream)
        } else {
            Ok(Box::new(stream.take(limit)))
        }
    }
}

/// What kind of service is expected behind an endpoint.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolHint {
    /// Plain TCP, the banner is whatever the service sends first.
    Raw,
    /// HTTP, a `GET /` is sent after connecting.
    Http,
}

impl ProtocolHint {
    /// Guesses a hint from a product name reported by a host search.
    ///
    /// ```rust
    /// # use patdown::endpoint::ProtocolHint;
    /// assert_eq!(ProtocolHint::from_product("Elastic"), ProtocolHint::Http);
    /// assert_eq!(ProtocolHint::from_product("OpenSSH"), ProtocolHint::Raw);
    /// ```
    pub fn from_product(product: &str) -> Self {
        const HTTP_PRODUCTS: [&str; 8] = [
            "elastic", "kibana", "nginx", "apache", "httpd", "iis", "http", "jetty",
        ];
        let product = product.to_lowercase();
        if HTTP_PRODUCTS.iter().any(|p| product.contains(p)) {
            Self::Http
        } else {
            Self::Raw
        }
    }

    fn scheme(self) -> &'static str {
        match self {
            Self::Raw => "tcp",
            Self::Http => "http",
        }
    }
}

/// Builds endpoints for targets discovered by a reader.
///
/// Construction failures are skipped by readers, never surfaced.
pub trait EndpointFactory: fmt::Debug + Send + Sync {
    /// Builds an endpoint for `target`. `product` is the product name a host
    /// search reported for it, if any.
    fn build(&self, target: SocketAddr, product: Option<&str>) -> Result<Box<dyn Endpoint>>;
}

/// Factory producing [`TcpEndpoint`]s.
///
/// With no fixed hint the protocol is guessed from the reported product,
/// falling back to [`ProtocolHint::Raw`].
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpEndpointFactory {
    hint: Option<ProtocolHint>,
}

impl TcpEndpointFactory {
    /// Factory that always uses `hint`.
    pub const fn with_hint(hint: ProtocolHint) -> Self {
        Self { hint: Some(hint) }
    }
}

impl EndpointFactory for TcpEndpointFactory {
    fn build(&self, target: SocketAddr, product: Option<&str>) -> Result<Box<dyn Endpoint>> {
        let hint = self
            .hint
            .or_else(|| product.map(ProtocolHint::from_product))
            .unwrap_or(ProtocolHint::Raw);
        Ok(Box::new(TcpEndpoint::new(target, hint)))
    }
}

/// Endpoint reached over a plain TCP connection.
#[derive(Debug)]
pub struct TcpEndpoint {
    target: SocketAddr,
    hint: ProtocolHint,
    stream: Option<TcpStream>,
}

impl TcpEndpoint {
    /// Unconnected endpoint for `target`.
    pub const fn new(target: SocketAddr, hint: ProtocolHint) -> Self {
        Self {
            target,
            hint,
            stream: None,
        }
    }
}

#[async_trait]
impl Endpoint for TcpEndpoint {
    async fn connect(&mut self, timeout: Duration) -> io::Result<()> {
        let target = self.target;
        let mut stream = time::timeout(timeout, TcpStream::connect(target)).await??;

        if self.hint == ProtocolHint::Http {
            let request = format!(
                "GET / HTTP/1.0\r\nHost: {target}\r\nUser-Agent: patdown\r\nAccept: */*\r\n\r\n"
            );
            time::timeout(timeout, stream.write_all(request.as_bytes())).await??;
        }

        debug!("Connected to {}", self.identity());
        self.stream = Some(stream);
        Ok(())
    }

    fn reader(&mut self) -> io::Result<EndpointStream<'_>> {
        match self.stream.as_mut() {
            Some(stream) => Ok(Box::new(stream)),
            None => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                format!("{} is not connected", self.target),
            )),
        }
    }

    async fn close(&mut self) -> io::Result<()> {
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.shutdown().await {
                debug!("Shutdown stream error {e}");
            }
        }
        Ok(())
    }

    fn address(&self) -> IpAddr {
        self.target.ip()
    }

    fn port(&self) -> u16 {
        self.target.port()
    }

    fn identity(&self) -> String {
        format!("{}://{}", self.hint.scheme(), self.target)
    }
}

/// Ends a stream at a deadline. Once it passes, reads report end of stream
/// instead of waiting, so the bytes received so far are all there is.
pub(crate) struct ReadDeadline<R> {
    inner: R,
    deadline: Instant,
    sleep: Pin<Box<Sleep>>,
}

impl<R> ReadDeadline<R> {
    pub(crate) fn new(inner: R, timeout: Duration) -> Self {
        let deadline = Instant::now() + timeout;
        Self {
            inner,
            deadline,
            sleep: Box::pin(time::sleep_until(deadline)),
        }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for ReadDeadline<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        // The timer cannot fire while the source is always ready.
        if Instant::now() >= self.deadline || self.sleep.as_mut().poll(cx).is_ready() {
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}
