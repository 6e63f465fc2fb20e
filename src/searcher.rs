//! The search orchestrator: pulls endpoints from every source, scans each
//! one against the rules and streams the results.
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use clap::ValueEnum;
use futures::Stream;
use log::{debug, info, warn};
use regex::bytes::Regex;
use serde_derive::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::endpoint::{Endpoint, EndpointStream, ReadDeadline};
use crate::error::{Error, Result};
use crate::reader::EndpointReader;
use crate::rules::{RegexMatcher, RuleMatcher, RuleSet};

/// Default time allowed to connect to one endpoint.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Default time allowed to read and match one endpoint.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Stream of results returned by [`Searcher::process`].
///
/// Ends as soon as the search's cancellation token fires, even if a result
/// was already waiting to be handed over.
#[derive(Debug)]
pub struct Matches {
    inner: ReceiverStream<Match>,
    token: CancellationToken,
}

impl Stream for Matches {
    type Item = Match;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Match>> {
        if self.token.is_cancelled() {
            return Poll::Ready(None);
        }
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

/// How the searcher walks several readers.
///   - BreadthFirst takes one endpoint from each live reader per round.
///   - DepthFirst drains each reader before moving to the next.
#[derive(Deserialize, Debug, ValueEnum, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum IterationStyle {
    /// One endpoint per live reader per round.
    #[default]
    BreadthFirst,
    /// Each reader until exhaustion, in insertion order.
    DepthFirst,
}

/// Tunables for a search.
#[derive(Debug, Clone, Copy)]
pub struct SearchOptions {
    /// Maximum bytes read from each endpoint, 0 for no limit.
    pub data_limit: u64,
    /// Time allowed to connect to one endpoint. Expiry counts as no match.
    pub connect_timeout: Duration,
    /// Time allowed to read one endpoint. When it runs out the stream is
    /// considered finished and whatever arrived so far is matched.
    pub read_timeout: Duration,
    /// Also emit a [`Match`] for endpoints that did not match.
    pub report_non_matches: bool,
    /// Collect every matched fragment instead of stopping at the first hit.
    pub capture: bool,
    /// Order in which readers are drained.
    pub iteration: IterationStyle,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            data_limit: 0,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
            report_non_matches: false,
            capture: false,
            iteration: IterationStyle::default(),
        }
    }
}

/// Outcome of scanning one endpoint.
///
/// `fragments` is only ever filled when capturing, and is non-empty only
/// when `matched` is true.
#[derive(Debug)]
pub struct Match {
    /// The scanned endpoint, already closed.
    pub endpoint: Box<dyn Endpoint>,
    /// Whether any rule matched.
    pub matched: bool,
    /// Matched fragments, in rule order then position order.
    pub fragments: Vec<String>,
}

impl Match {
    /// JSON rendering used by the command line output.
    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "endpoint": self.endpoint.identity(),
            "address": self.endpoint.address().to_string(),
            "port": self.endpoint.port(),
            "matched": self.matched,
            "fragments": self.fragments,
        })
    }
}

/// Holds endpoint sources and search rules.
///
/// Static endpoints are scanned first, in insertion order, then the readers
/// are walked according to [`SearchOptions::iteration`].
///
/// ```rust
/// # use patdown::searcher::Searcher;
/// # use patdown::scanner::ScanReader;
/// # use tokio_util::sync::CancellationToken;
/// # use futures::StreamExt;
/// # #[tokio::main]
/// # async fn main() -> Result<(), patdown::Error> {
/// let mut searcher = Searcher::new();
/// searcher.add_search_rule("elastic")?;
///
/// let mut reader = ScanReader::new();
/// reader.add_range("127.0.0.1".parse()?);
/// reader.add_port(9);
/// searcher.add_reader(Box::new(reader));
///
/// let mut matches = searcher.process(CancellationToken::new())?;
/// while let Some(found) = matches.next().await {
///     println!("{}", found.endpoint.identity());
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct Searcher {
    endpoints: Vec<Box<dyn Endpoint>>,
    readers: Vec<Box<dyn EndpointReader>>,
    rules: Vec<Regex>,
    matcher: Arc<dyn RuleMatcher>,
    options: SearchOptions,
}

impl Default for Searcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Searcher {
    /// Searcher with default options and the regex matcher.
    pub fn new() -> Self {
        Self::with_options(SearchOptions::default())
    }

    /// Searcher with the given options and the regex matcher.
    pub fn with_options(options: SearchOptions) -> Self {
        Self {
            endpoints: Vec::new(),
            readers: Vec::new(),
            rules: Vec::new(),
            matcher: Arc::new(RegexMatcher),
            options,
        }
    }

    /// Options used by the next [`process`](Self::process).
    pub fn options_mut(&mut self) -> &mut SearchOptions {
        &mut self.options
    }

    /// Adds a single endpoint to scan before any reader.
    pub fn add_endpoint(&mut self, endpoint: Box<dyn Endpoint>) {
        self.endpoints.push(endpoint);
    }

    /// Adds a source of endpoints. Every reader added is closed exactly
    /// once when processing ends.
    pub fn add_reader(&mut self, reader: Box<dyn EndpointReader>) {
        self.readers.push(reader);
    }

    /// Compiles and adds a search rule.
    pub fn add_search_rule(&mut self, pattern: &str) -> Result<()> {
        self.rules.push(Regex::new(pattern)?);
        Ok(())
    }

    /// Replaces the default regex matcher.
    pub fn set_matcher(&mut self, matcher: Arc<dyn RuleMatcher>) {
        self.matcher = matcher;
    }

    /// Starts scanning on a background task and returns the result stream.
    ///
    /// The task hands over one [`Match`] at a time, so it never runs ahead
    /// of the consumer. Cancelling `token`, or dropping the stream, stops it;
    /// either way every reader is closed. Consumes the searcher: a new run
    /// needs a new searcher (readers can be [`reset`](EndpointReader::reset)
    /// and moved over).
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    pub fn process(self, token: CancellationToken) -> Result<Matches> {
        if self.rules.is_empty() {
            return Err(Error::NoRules);
        }
        let rules = RuleSet::from_regexes(self.rules)?;

        let (tx, rx) = mpsc::channel(1);
        let run = Run {
            rules,
            matcher: self.matcher,
            options: self.options,
            tx,
            token: token.clone(),
        };
        tokio::spawn(run.drive(self.endpoints, self.readers));

        Ok(Matches {
            inner: ReceiverStream::new(rx),
            token,
        })
    }
}

/// Processing was cut short, by cancellation or by the consumer going away.
#[derive(Debug)]
struct Stopped;

type Flow = std::result::Result<(), Stopped>;

struct Run {
    rules: RuleSet,
    matcher: Arc<dyn RuleMatcher>,
    options: SearchOptions,
    tx: mpsc::Sender<Match>,
    token: CancellationToken,
}

impl Run {
    async fn drive(self, endpoints: Vec<Box<dyn Endpoint>>, mut readers: Vec<Box<dyn EndpointReader>>) {
        let mut closed = vec![false; readers.len()];

        match self.walk(endpoints, &mut readers, &mut closed).await {
            Ok(()) => info!("All sources exhausted"),
            Err(Stopped) => info!("Search stopped early"),
        }

        for (reader, closed) in readers.iter_mut().zip(closed) {
            if closed {
                continue;
            }
            if let Err(e) = reader.close().await {
                warn!("Failed to close reader: {e}");
            }
        }
        debug!("Search done");
    }

    async fn walk(
        &self,
        endpoints: Vec<Box<dyn Endpoint>>,
        readers: &mut [Box<dyn EndpointReader>],
        closed: &mut [bool],
    ) -> Flow {
        info!("Scanning {} static endpoints", endpoints.len());
        for endpoint in endpoints {
            self.search_and_send(endpoint).await?;
        }

        info!(
            "Scanning {} readers {:?}",
            readers.len(),
            self.options.iteration
        );
        match self.options.iteration {
            IterationStyle::DepthFirst => {
                for (reader, closed) in readers.iter_mut().zip(closed.iter_mut()) {
                    while self.step(reader.as_mut(), closed).await? {}
                }
            }
            IterationStyle::BreadthFirst => {
                let mut live = vec![true; readers.len()];
                while live.contains(&true) {
                    for ((reader, closed), live) in
                        readers.iter_mut().zip(closed.iter_mut()).zip(live.iter_mut())
                    {
                        if *live {
                            *live = self.step(reader.as_mut(), closed).await?;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Reads and scans one endpoint from `reader`. `Ok(false)` once the
    /// reader has nothing more to give.
    async fn step(
        &self,
        reader: &mut dyn EndpointReader,
        closed: &mut bool,
    ) -> std::result::Result<bool, Stopped> {
        let next = tokio::select! {
            biased;
            () = self.token.cancelled() => return Err(Stopped),
            next = reader.next() => next,
        };

        match next {
            Ok(Some(endpoint)) => {
                self.search_and_send(endpoint).await?;
                Ok(true)
            }
            Ok(None) => Ok(false),
            Err(e) => {
                warn!("Reader failed, dropping it: {e}");
                if let Err(e) = reader.close().await {
                    warn!("Failed to close reader: {e}");
                }
                *closed = true;
                Ok(false)
            }
        }
    }

    async fn search_and_send(&self, mut endpoint: Box<dyn Endpoint>) -> Flow {
        let outcome = tokio::select! {
            biased;
            () = self.token.cancelled() => None,
            outcome = self.search_endpoint(endpoint.as_mut()) => Some(outcome),
        };

        if let Err(e) = endpoint.close().await {
            debug!("Error closing {}: {e}", endpoint.identity());
        }

        let (matched, fragments) = outcome.ok_or(Stopped)?;
        if !matched && !self.options.report_non_matches {
            return Ok(());
        }

        let found = Match {
            endpoint,
            matched,
            fragments,
        };
        tokio::select! {
            biased;
            () = self.token.cancelled() => Err(Stopped),
            sent = self.tx.send(found) => sent.map_err(|_| Stopped),
        }
    }

    /// Connects, reads up to the data limit or the read deadline and runs the
    /// rules. A failed connect or a stream error before any data means "not
    /// matched".
    async fn search_endpoint(&self, endpoint: &mut dyn Endpoint) -> (bool, Vec<String>) {
        let identity = endpoint.identity();
        let connect_timeout = self.options.connect_timeout;

        match time::timeout(connect_timeout, endpoint.connect(connect_timeout)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!("Could not connect to {identity}: {e}");
                return (false, Vec::new());
            }
            Err(_) => {
                debug!("Connecting to {identity} timed out");
                return (false, Vec::new());
            }
        }

        let stream = match endpoint.read(self.options.data_limit) {
            Ok(stream) => stream,
            Err(e) => {
                debug!("Could not read {identity}: {e}");
                return (false, Vec::new());
            }
        };
        let stream: EndpointStream<'_> =
            Box::new(ReadDeadline::new(stream, self.options.read_timeout));

        let outcome = if self.options.capture {
            self.matcher
                .enumerate_matches(stream, &self.rules)
                .await
                .map(|fragments| (!fragments.is_empty(), fragments))
        } else {
            self.matcher
                .matches_any(stream, &self.rules)
                .await
                .map(|matched| (matched, Vec::new()))
        };

        match outcome {
            Ok(outcome) => {
                debug!("Scanned {identity}, matched: {}", outcome.0);
                outcome
            }
            Err(e) => {
                debug!("Stream error from {identity}: {e}");
                (false, Vec::new())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn process_requires_rules() {
        let err = Searcher::new()
            .process(CancellationToken::new())
            .unwrap_err();
        assert!(matches!(err, Error::NoRules));
    }

    #[test]
    #[should_panic(expected = "runtime")]
    fn process_outside_a_runtime_panics() {
        let mut searcher = Searcher::new();
        searcher.add_search_rule("google").unwrap();
        let _ = searcher.process(CancellationToken::new());
    }

    #[test]
    fn invalid_rule_is_rejected_at_setup() {
        let mut searcher = Searcher::new();
        assert!(searcher.add_search_rule("(google").is_err());
        assert!(searcher.add_search_rule("google").is_ok());
    }

    #[test]
    fn iteration_style_parses_from_config() {
        #[derive(Deserialize)]
        struct Holder {
            iteration: IterationStyle,
        }
        let parsed: Holder = toml::from_str("iteration = \"depth-first\"").unwrap();
        assert_eq!(parsed.iteration, IterationStyle::DepthFirst);
    }
}
