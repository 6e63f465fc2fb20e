//! Compiled search rules and the matcher that runs them over endpoint content.
use std::fmt;

use async_trait::async_trait;
use log::debug;
use regex::bytes::{Regex, RegexSet};
use tokio::io::{self, AsyncRead, AsyncReadExt};

use crate::endpoint::EndpointStream;
use crate::error::Result;

/// Size of each read from an endpoint stream.
const CHUNK_SIZE: usize = 8 * 1024;

/// Bytes kept from previous chunks in fast mode, so a match straddling two
/// reads is still seen.
const LOOKBEHIND: usize = 4 * 1024;

/// Bytes kept in front of the look-behind region so `\b` and multi-line `^`
/// see the real preceding character. Never searched themselves.
const CONTEXT: usize = 4;

/// Immutable, ordered collection of compiled patterns.
///
/// Order only matters for the order in which
/// [`RuleMatcher::enumerate_matches`] reports fragments.
#[derive(Debug, Clone)]
pub struct RuleSet {
    rules: Vec<Regex>,
    set: RegexSet,
}

impl RuleSet {
    /// Compiles `patterns` in order.
    ///
    /// ```rust
    /// # use patdown::rules::RuleSet;
    /// assert!(RuleSet::new(["google", "elastic(search)?"]).is_ok());
    /// assert!(RuleSet::new(["(unclosed"]).is_err());
    /// ```
    pub fn new<I, S>(patterns: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let rules = patterns
            .into_iter()
            .map(|p| Regex::new(p.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Self::from_regexes(rules)
    }

    /// Builds a set from already compiled patterns.
    pub fn from_regexes(rules: Vec<Regex>) -> Result<Self> {
        let set = RegexSet::new(rules.iter().map(Regex::as_str))?;
        Ok(Self { rules, set })
    }

    /// Number of rules.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Whether the set holds no rule at all.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// The rules, in insertion order.
    pub fn rules(&self) -> &[Regex] {
        &self.rules
    }

    /// Whether a rule matches somewhere in `window[start..]` in a way later
    /// bytes cannot undo. Bytes before `start` are only look-behind context.
    ///
    /// Until `eof`, a match running up to the end of the window may still be
    /// invalidated (`$`, `\b`) by what comes next, so it does not count yet.
    fn settled_match(&self, window: &[u8], start: usize, eof: bool) -> bool {
        self.set
            .matches_at(window, start)
            .into_iter()
            .filter_map(|index| self.rules[index].find_at(window, start))
            .any(|found| eof || found.end() < window.len())
    }
}

/// Tests a byte stream against a [`RuleSet`].
///
/// Both methods must agree: `matches_any` is true exactly when
/// `enumerate_matches` would return at least one fragment for the same bytes.
#[async_trait]
pub trait RuleMatcher: fmt::Debug + Send + Sync {
    /// Whether any rule matches. Implementations should stop reading at the
    /// first hit.
    async fn matches_any(&self, stream: EndpointStream<'_>, rules: &RuleSet) -> io::Result<bool>;

    /// Every fragment matched by every rule over the whole stream.
    async fn enumerate_matches(
        &self,
        stream: EndpointStream<'_>,
        rules: &RuleSet,
    ) -> io::Result<Vec<String>>;
}

/// Reads one chunk. A failure after some bytes already arrived ends the
/// stream instead, so what was received still gets matched.
async fn read_chunk<R>(stream: &mut R, chunk: &mut [u8], received: usize) -> io::Result<usize>
where
    R: AsyncRead + Unpin + ?Sized,
{
    match stream.read(chunk).await {
        Err(e) if received > 0 => {
            debug!("Stream broke after {received} bytes, matching what arrived: {e}");
            Ok(0)
        }
        read => read,
    }
}

/// Default [`RuleMatcher`] backed by byte regexes.
///
/// Anchors and word boundaries are evaluated against the real stream: `^`
/// only at its first byte, `$` only at its end.
#[derive(Debug, Clone, Copy, Default)]
pub struct RegexMatcher;

#[async_trait]
impl RuleMatcher for RegexMatcher {
    async fn matches_any(
        &self,
        mut stream: EndpointStream<'_>,
        rules: &RuleSet,
    ) -> io::Result<bool> {
        let mut window = Vec::with_capacity(CHUNK_SIZE + LOOKBEHIND + CONTEXT);
        let mut chunk = vec![0u8; CHUNK_SIZE];
        let mut received = 0;
        let mut trimmed = false;

        loop {
            let read = read_chunk(&mut stream, &mut chunk, received).await?;
            received += read;
            let eof = read == 0;
            window.extend_from_slice(&chunk[..read]);

            let start = if trimmed { CONTEXT } else { 0 };
            if rules.settled_match(&window, start, eof) {
                return Ok(true);
            }
            if eof {
                return Ok(false);
            }

            if window.len() > LOOKBEHIND + CONTEXT {
                window.drain(..window.len() - LOOKBEHIND - CONTEXT);
                trimmed = true;
            }
        }
    }

    async fn enumerate_matches(
        &self,
        mut stream: EndpointStream<'_>,
        rules: &RuleSet,
    ) -> io::Result<Vec<String>> {
        let mut data = Vec::new();
        let mut chunk = vec![0u8; CHUNK_SIZE];
        loop {
            let read = read_chunk(&mut stream, &mut chunk, data.len()).await?;
            if read == 0 {
                break;
            }
            data.extend_from_slice(&chunk[..read]);
        }

        let fragments = rules
            .rules
            .iter()
            .flat_map(|rule| rule.find_iter(&data))
            .map(|m| String::from_utf8_lossy(m.as_bytes()).into_owned())
            .collect();
        Ok(fragments)
    }
}
