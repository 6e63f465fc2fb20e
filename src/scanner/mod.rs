//! Core functionality for discovering endpoints by walking address space.
//!
//! [`AddressSpace`] expands ranges and ports into `ip:port` pairs on a
//! background task, [`PortProbe`] optionally filters those down to open
//! ports, and [`ScanReader`] turns the survivors into endpoints.
use crate::address::AddressRange;
use crate::endpoint::{Endpoint, EndpointFactory, ProtocolHint, TcpEndpointFactory};
use crate::error::Result;
use crate::reader::EndpointReader;
use log::{debug, warn};

mod socket_iterator;
pub use socket_iterator::SocketIterator;

use async_trait::async_trait;
use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};
use tokio::{
    io,
    net::TcpStream,
    sync::mpsc,
    time,
};
use tokio_util::sync::CancellationToken;

/// Timeout used by a [`PortProbe`] unless told otherwise.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// A fixed set of address ranges crossed with a fixed list of ports.
#[derive(Debug, Clone)]
pub struct AddressSpace {
    ranges: Arc<[AddressRange]>,
    ports: Arc<[u16]>,
}

impl AddressSpace {
    /// Space crossing every address of `ranges` with `ports`, in order.
    pub fn new(ranges: Vec<AddressRange>, ports: Vec<u16>) -> Self {
        Self {
            ranges: ranges.into(),
            ports: ports.into(),
        }
    }

    /// Synchronous walk over every pair, address-major then port-minor.
    pub fn iter(&self) -> SocketIterator {
        SocketIterator::new(Arc::clone(&self.ranges), Arc::clone(&self.ports))
    }

    /// Generates the pairs on a background task.
    ///
    /// The returned channel holds at most one pending pair, so generation
    /// only advances as fast as the receiver pulls. The task stops as soon
    /// as `token` is cancelled or the receiver is dropped.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    pub fn produce(&self, token: CancellationToken) -> mpsc::Receiver<SocketAddr> {
        let (tx, rx) = mpsc::channel(1);
        let pairs = self.iter();

        tokio::spawn(async move {
            for socket in pairs {
                tokio::select! {
                    biased;
                    () = token.cancelled() => {
                        debug!("Address space producer cancelled before {socket}");
                        return;
                    }
                    sent = tx.send(socket) => {
                        if sent.is_err() {
                            debug!("Address space consumer went away");
                            return;
                        }
                    }
                }
            }
            debug!("Address space exhausted");
        });

        rx
    }
}

/// Checks whether a port accepts TCP connections.
///
/// A refused, unreachable or timed out connection means the port is not of
/// interest. Running out of local sockets ("too many open files") says
/// nothing about the target, so the probe sleeps one full timeout and tries
/// again, forever unless [`max_exhaustion_retries`](Self::max_exhaustion_retries)
/// is set.
#[derive(Debug, Clone, Copy)]
pub struct PortProbe {
    timeout: Duration,
    max_exhaustion_retries: Option<u32>,
}

impl Default for PortProbe {
    fn default() -> Self {
        Self::new(DEFAULT_PROBE_TIMEOUT)
    }
}

impl PortProbe {
    /// Probe giving up on a connection after `timeout`, retrying on socket
    /// exhaustion without limit.
    pub const fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            max_exhaustion_retries: None,
        }
    }

    /// Caps the resource-exhaustion retries. `None` retries indefinitely.
    #[must_use]
    pub const fn max_exhaustion_retries(mut self, retries: Option<u32>) -> Self {
        self.max_exhaustion_retries = retries;
        self
    }

    /// Time allowed for one connection attempt.
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Whether `socket` accepts a TCP connection within the timeout.
    pub async fn is_open(&self, socket: SocketAddr) -> bool {
        self.probe_with(socket, |socket| async move {
            TcpStream::connect(socket).await.map(drop)
        })
        .await
    }

    async fn probe_with<F, Fut>(&self, socket: SocketAddr, mut dial: F) -> bool
    where
        F: FnMut(SocketAddr) -> Fut,
        Fut: Future<Output = io::Result<()>>,
    {
        let mut retries = 0u32;
        loop {
            match time::timeout(self.timeout, dial(socket)).await {
                Ok(Ok(())) => {
                    debug!("Port open {socket}");
                    return true;
                }
                Ok(Err(e)) if is_resource_exhaustion(&e) => {
                    if self.max_exhaustion_retries.is_some_and(|max| retries >= max) {
                        warn!("Giving up on {socket} after {retries} retries: {e}");
                        return false;
                    }
                    retries += 1;
                    warn!(
                        "Too many open files while probing {socket}, retrying in {:?}",
                        self.timeout
                    );
                    time::sleep(self.timeout).await;
                }
                Ok(Err(e)) => {
                    debug!("Port closed {socket}: {e}");
                    return false;
                }
                Err(_) => {
                    debug!("Probe of {socket} timed out");
                    return false;
                }
            }
        }
    }
}

/// Whether a connection failure is local socket exhaustion rather than a
/// statement about the target.
pub fn is_resource_exhaustion(error: &io::Error) -> bool {
    error
        .to_string()
        .to_lowercase()
        .contains("too many open files")
}

/// [`EndpointReader`] over every `ip:port` pair of some address ranges.
///
/// Pairs that fail the optional [`PortProbe`], or for which no endpoint can
/// be built, are skipped.
///
/// ```rust
/// # use patdown::scanner::ScanReader;
/// # use patdown::reader::EndpointReader;
/// # #[tokio::main]
/// # async fn main() -> Result<(), patdown::Error> {
/// let mut reader = ScanReader::new();
/// reader.add_range("127.0.0.1/32".parse()?);
/// reader.add_port(9200);
///
/// let endpoint = reader.next().await?.unwrap();
/// assert_eq!(endpoint.port(), 9200);
/// assert!(reader.next().await?.is_none());
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct ScanReader {
    ranges: Vec<AddressRange>,
    ports: Vec<u16>,
    probe: Option<PortProbe>,
    factory: Arc<dyn EndpointFactory>,
    pairs: Option<mpsc::Receiver<SocketAddr>>,
    token: Option<CancellationToken>,
    exhausted: bool,
}

impl Default for ScanReader {
    fn default() -> Self {
        Self::new()
    }
}

impl ScanReader {
    /// Reader with no ranges or ports yet, building raw TCP endpoints.
    pub fn new() -> Self {
        Self {
            ranges: Vec::new(),
            ports: Vec::new(),
            probe: None,
            factory: Arc::new(TcpEndpointFactory::default()),
            pairs: None,
            token: None,
            exhausted: false,
        }
    }

    /// Adds a range to scan. Takes effect on the next pass.
    pub fn add_range(&mut self, range: AddressRange) {
        self.ranges.push(range);
    }

    /// Adds a port to scan. Takes effect on the next pass.
    pub fn add_port(&mut self, port: u16) {
        self.ports.push(port);
    }

    /// Only yield pairs whose port accepts a connection.
    pub fn check_port_open(&mut self, probe: PortProbe) {
        self.probe = Some(probe);
    }

    /// Use a known protocol instead of a raw TCP endpoint.
    pub fn set_protocol(&mut self, hint: ProtocolHint) {
        self.factory = Arc::new(TcpEndpointFactory::with_hint(hint));
    }

    /// Builds endpoints with `factory` from now on.
    pub fn set_factory(&mut self, factory: Arc<dyn EndpointFactory>) {
        self.factory = factory;
    }

    fn start(&mut self) {
        let space = AddressSpace::new(self.ranges.clone(), self.ports.clone());
        let token = CancellationToken::new();
        debug!(
            "Start scanning. Ranges {} Ports {}",
            self.ranges.len(),
            self.ports.len()
        );
        self.pairs = Some(space.produce(token.clone()));
        self.token = Some(token);
    }

    fn stop(&mut self) {
        if let Some(token) = self.token.take() {
            token.cancel();
        }
        self.pairs = None;
    }
}

#[async_trait]
impl EndpointReader for ScanReader {
    async fn next(&mut self) -> Result<Option<Box<dyn Endpoint>>> {
        if self.exhausted {
            return Ok(None);
        }

        if self.pairs.is_none() {
            self.start();
        }

        loop {
            let next = match self.pairs.as_mut() {
                Some(pairs) => pairs.recv().await,
                None => None,
            };

            let Some(socket) = next else {
                debug!("Scan reader exhausted");
                self.stop();
                self.exhausted = true;
                return Ok(None);
            };

            if let Some(probe) = &self.probe {
                if !probe.is_open(socket).await {
                    continue;
                }
            }

            match self.factory.build(socket, None) {
                Ok(endpoint) => return Ok(Some(endpoint)),
                Err(e) => debug!("Skipping {socket}: {e}"),
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.stop();
        self.exhausted = true;
        Ok(())
    }

    async fn reset(&mut self) -> Result<()> {
        self.stop();
        self.exhausted = false;
        Ok(())
    }
}
