//! Sequential sources of endpoints.
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use log::debug;

use crate::endpoint::{Endpoint, EndpointFactory, TcpEndpointFactory};
use crate::error::Result;

/// A resettable cursor over a sequence of endpoints.
///
/// `next` returns `Ok(None)` once the sequence is exhausted and keeps
/// returning it on every later call, until [`reset`](EndpointReader::reset).
/// An `Err` means the reader itself broke; the searcher stops consuming
/// from it.
#[async_trait]
pub trait EndpointReader: fmt::Debug + Send {
    /// Next endpoint, or `None` once exhausted.
    async fn next(&mut self) -> Result<Option<Box<dyn Endpoint>>>;

    /// Stops the reader; subsequent `next` calls report exhaustion.
    async fn close(&mut self) -> Result<()>;

    /// Rewinds the reader for another full pass.
    async fn reset(&mut self) -> Result<()>;
}

/// Reader over a fixed list of targets.
#[derive(Debug)]
pub struct ListReader {
    targets: Vec<SocketAddr>,
    index: usize,
    factory: Arc<dyn EndpointFactory>,
}

impl ListReader {
    /// Reader building [`TcpEndpoint`](crate::endpoint::TcpEndpoint)s with a
    /// raw protocol hint.
    pub fn new(targets: Vec<SocketAddr>) -> Self {
        Self::with_factory(targets, Arc::new(TcpEndpointFactory::default()))
    }

    /// Reader building endpoints with `factory`.
    pub fn with_factory(targets: Vec<SocketAddr>, factory: Arc<dyn EndpointFactory>) -> Self {
        Self {
            targets,
            index: 0,
            factory,
        }
    }
}

#[async_trait]
impl EndpointReader for ListReader {
    async fn next(&mut self) -> Result<Option<Box<dyn Endpoint>>> {
        while let Some(&target) = self.targets.get(self.index) {
            self.index += 1;
            match self.factory.build(target, None) {
                Ok(endpoint) => return Ok(Some(endpoint)),
                Err(e) => debug!("Skipping {target}: {e}"),
            }
        }
        Ok(None)
    }

    async fn close(&mut self) -> Result<()> {
        self.index = self.targets.len();
        Ok(())
    }

    async fn reset(&mut self) -> Result<()> {
        self.index = 0;
        Ok(())
    }
}
