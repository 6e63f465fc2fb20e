//! This crate exposes the internals of the `patdown` endpoint searcher.
//!
//! `patdown` finds network endpoints from several sources, reads what each
//! one sends back and tests it against a set of regular expressions. It is
//! meant for asset discovery and exposure detection: "which hosts in this
//! range serve something that looks like an open Elasticsearch index?"
//!
//! ## Architecture Overview
//!
//! Everything is driven by the [`Searcher`](crate::searcher::Searcher),
//! which owns a list of static endpoints, any number of
//! [`EndpointReader`](crate::reader::EndpointReader)s and the rules:
//!
//! 1. **Address space**: [`AddressSpace`](crate::scanner::AddressSpace)
//!    expands CIDRs and ports into `ip:port` pairs on a background task
//! 2. **Readers**: [`ScanReader`](crate::scanner::ScanReader) turns those
//!    pairs into endpoints (optionally only open ports),
//!    [`QueryReader`](crate::query::QueryReader) does the same for hosts
//!    returned by a host search service such as Shodan
//! 3. **Scanning**: each endpoint is connected, read up to a byte limit and
//!    matched, either stopping at the first hit or capturing every fragment
//! 4. **Results**: [`Match`](crate::searcher::Match)es are streamed back in
//!    scan order, one at a time
//!
//! ## Basic Usage Example
//!
//! ```rust,no_run
//! use futures::StreamExt;
//! use patdown::scanner::{PortProbe, ScanReader};
//! use patdown::searcher::{IterationStyle, Searcher};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), patdown::Error> {
//!     let mut searcher = Searcher::new();
//!     searcher.add_search_rule(r#""cluster_name""#)?;
//!     searcher.options_mut().data_limit = 1024 * 1024;
//!     searcher.options_mut().iteration = IterationStyle::DepthFirst;
//!
//!     let mut reader = ScanReader::new();
//!     reader.add_range("192.168.1.0/24".parse()?);
//!     reader.add_port(9200);
//!     reader.check_port_open(PortProbe::default());
//!     searcher.add_reader(Box::new(reader));
//!
//!     let mut matches = searcher.process(CancellationToken::new())?;
//!     while let Some(found) = matches.next().await {
//!         println!("{}", found.endpoint.identity());
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Error Handling
//!
//! Only setup problems are reported as [`Error`]s: bad rules, bad ranges, a
//! failing host search. Anything that goes wrong with a single endpoint
//! (refused, timed out, broken stream) just means it did not match.
#![allow(clippy::needless_doctest_main)]
#![warn(missing_docs)]

pub mod address;

pub mod endpoint;

mod error;
pub use error::{Error, Result};

pub mod input;

pub mod query;

pub mod reader;

pub mod rules;

pub mod scanner;

pub mod searcher;
