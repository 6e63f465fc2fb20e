//! Endpoints discovered through a third-party host search service.
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info};
use serde_derive::Deserialize;

use crate::endpoint::{Endpoint, EndpointFactory, ProtocolHint, TcpEndpointFactory};
use crate::error::{Error, Result};
use crate::reader::EndpointReader;

/// Shodan query returning exposed Elasticsearch instances.
pub const SHODAN_ELK_QUERY: &str = "\"Elastic Indices\"";

const SHODAN_API: &str = "https://api.shodan.io";

/// One host reported by a search.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct HostRecord {
    /// Address, as reported. May not parse.
    #[serde(rename = "ip_str")]
    pub ip: String,
    /// Port the service was seen on.
    pub port: u16,
    /// Product name the service guessed for this host, if any.
    #[serde(default)]
    pub product: Option<String>,
}

/// A service answering host queries with a finite list of hosts.
#[async_trait]
pub trait HostSearch: fmt::Debug + Send + Sync {
    /// Hosts matching `criteria`. Errors are fatal to the caller.
    async fn query(&self, criteria: &str) -> Result<Vec<HostRecord>>;
}

#[derive(Deserialize, Debug)]
struct SearchResponse {
    #[serde(default)]
    matches: Vec<HostRecord>,
}

/// [`HostSearch`] backed by the Shodan REST API.
///
/// Only the first result page is fetched.
#[derive(Debug, Clone)]
pub struct ShodanClient {
    client: reqwest::Client,
    token: String,
    base_url: String,
}

impl ShodanClient {
    /// Client authenticating with `token`. Every request gives up after `timeout`.
    pub fn new(token: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            token: token.into(),
            base_url: SHODAN_API.to_owned(),
        })
    }

    /// Points the client at another deployment of the same API.
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

#[async_trait]
impl HostSearch for ShodanClient {
    async fn query(&self, criteria: &str) -> Result<Vec<HostRecord>> {
        let url = format!("{}/shodan/host/search", self.base_url.trim_end_matches('/'));
        let response = self
            .client
            .get(url)
            .query(&[("key", self.token.as_str()), ("query", criteria)])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::QueryStatus {
                status: status.as_u16(),
                body,
            });
        }

        let found: SearchResponse = response.json().await?;
        info!("Host search {criteria:?} returned {} hosts", found.matches.len());
        Ok(found.matches)
    }
}

/// [`EndpointReader`] over the hosts returned by one search query.
///
/// [`reset`](EndpointReader::reset) runs the query again, so a second pass
/// may see different hosts, or the same hosts in another order.
#[derive(Debug)]
pub struct QueryReader {
    search: Arc<dyn HostSearch>,
    criteria: String,
    hosts: Vec<HostRecord>,
    index: usize,
    factory: Arc<dyn EndpointFactory>,
}

impl QueryReader {
    /// Runs `criteria` once; query errors surface here.
    pub async fn new(search: Arc<dyn HostSearch>, criteria: impl Into<String>) -> Result<Self> {
        let mut reader = Self {
            search,
            criteria: criteria.into(),
            hosts: Vec::new(),
            index: 0,
            factory: Arc::new(TcpEndpointFactory::default()),
        };
        reader.reset().await?;
        Ok(reader)
    }

    /// Use a known protocol instead of guessing it from the product name.
    pub fn set_protocol(&mut self, hint: ProtocolHint) {
        self.factory = Arc::new(TcpEndpointFactory::with_hint(hint));
    }

    /// Builds endpoints with `factory` from now on.
    pub fn set_factory(&mut self, factory: Arc<dyn EndpointFactory>) {
        self.factory = factory;
    }

    /// Number of hosts returned by the last query.
    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    /// Whether the last query returned no host.
    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }
}

#[async_trait]
impl EndpointReader for QueryReader {
    async fn next(&mut self) -> Result<Option<Box<dyn Endpoint>>> {
        while let Some(host) = self.hosts.get(self.index) {
            self.index += 1;

            let Ok(ip) = host.ip.parse::<IpAddr>() else {
                debug!("Skipping unparsable host {:?}", host.ip);
                continue;
            };
            let target = SocketAddr::new(ip, host.port);
            match self.factory.build(target, host.product.as_deref()) {
                Ok(endpoint) => return Ok(Some(endpoint)),
                Err(e) => debug!("Skipping {target}: {e}"),
            }
        }
        Ok(None)
    }

    async fn close(&mut self) -> Result<()> {
        self.index = self.hosts.len();
        Ok(())
    }

    async fn reset(&mut self) -> Result<()> {
        self.hosts = self.search.query(&self.criteria).await?;
        self.index = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Default)]
    struct CannedSearch {
        calls: AtomicUsize,
        fail_from_call: Option<usize>,
    }

    #[async_trait]
    impl HostSearch for CannedSearch {
        async fn query(&self, criteria: &str) -> Result<Vec<HostRecord>> {
            assert_eq!(criteria, SHODAN_ELK_QUERY);
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_from_call.is_some_and(|from| call >= from) {
                return Err(Error::QueryStatus {
                    status: 503,
                    body: "busy".to_owned(),
                });
            }
            let mut hosts = vec![
                HostRecord {
                    ip: "203.0.113.7".to_owned(),
                    port: 9200,
                    product: Some("Elastic".to_owned()),
                },
                HostRecord {
                    ip: "not-an-ip".to_owned(),
                    port: 9200,
                    product: None,
                },
                HostRecord {
                    ip: "203.0.113.8".to_owned(),
                    port: 22,
                    product: None,
                },
            ];
            if call > 0 {
                hosts.reverse();
            }
            Ok(hosts)
        }
    }

    async fn drain(reader: &mut QueryReader) -> Vec<String> {
        let mut seen = Vec::new();
        while let Some(endpoint) = reader.next().await.unwrap() {
            seen.push(endpoint.identity());
        }
        seen
    }

    #[tokio::test]
    async fn walks_hosts_and_exhausts() {
        let search = Arc::new(CannedSearch::default());
        let mut reader = QueryReader::new(search, SHODAN_ELK_QUERY).await.unwrap();

        assert_eq!(
            drain(&mut reader).await,
            ["http://203.0.113.7:9200", "tcp://203.0.113.8:22"]
        );
        assert!(reader.next().await.unwrap().is_none());
        assert!(reader.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn close_exhausts_without_querying() {
        let search = Arc::new(CannedSearch::default());
        let mut reader = QueryReader::new(Arc::clone(&search) as Arc<dyn HostSearch>, SHODAN_ELK_QUERY)
            .await
            .unwrap();

        reader.close().await.unwrap();
        assert!(reader.next().await.unwrap().is_none());
        assert_eq!(search.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn reset_queries_again() {
        let search = Arc::new(CannedSearch::default());
        let mut reader = QueryReader::new(Arc::clone(&search) as Arc<dyn HostSearch>, SHODAN_ELK_QUERY)
            .await
            .unwrap();
        drain(&mut reader).await;

        reader.reset().await.unwrap();
        assert_eq!(search.calls.load(Ordering::SeqCst), 2);
        assert_eq!(
            drain(&mut reader).await,
            ["tcp://203.0.113.8:22", "http://203.0.113.7:9200"]
        );
    }

    #[tokio::test]
    async fn failed_reset_leaves_reader_exhausted() {
        let search = Arc::new(CannedSearch {
            fail_from_call: Some(1),
            ..CannedSearch::default()
        });
        let mut reader = QueryReader::new(search, SHODAN_ELK_QUERY).await.unwrap();
        drain(&mut reader).await;

        assert!(matches!(
            reader.reset().await,
            Err(Error::QueryStatus { status: 503, .. })
        ));
        assert!(reader.next().await.unwrap().is_none());
    }

    #[test]
    fn parses_search_response() {
        let body = r#"{
            "matches": [
                {"ip_str": "198.51.100.4", "port": 9200, "product": "Elastic", "org": "x"},
                {"ip_str": "198.51.100.5", "port": 80}
            ],
            "total": 2
        }"#;
        let parsed: SearchResponse = serde_json::from_str(body).unwrap();

        assert_eq!(parsed.matches.len(), 2);
        assert_eq!(parsed.matches[0].product.as_deref(), Some("Elastic"));
        assert_eq!(parsed.matches[1].product, None);
    }
}
