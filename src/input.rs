//! Provides a means to read, parse and hold configuration options for searches.
use clap::Parser;
use itertools::Itertools;
use serde_derive::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::endpoint::ProtocolHint;
use crate::error::{Error, Result};
use crate::searcher::{IterationStyle, SearchOptions};

const LOWEST_PORT_NUMBER: u16 = 1;
const TOP_PORT_NUMBER: u16 = 65535;

/// Ports in the order they were configured.
pub type Ports = Vec<u16>;

/// Parses `80,443,9000-9010` style input.
///
/// Ports keep the order they were given in; repeated ports are dropped.
#[cfg(not(tarpaulin_include))]
pub fn parse_ports_and_ranges(input: &str) -> Result<Ports> {
    let mut ports = Vec::new();

    for part in input.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }

        if part.contains('-') {
            ports.extend(parse_port_range(part).map_err(Error::InvalidPort)?);
        } else {
            ports.push(parse_single_port(part).map_err(Error::InvalidPort)?);
        }
    }

    if ports.is_empty() {
        return Err(Error::InvalidPort(String::from(
            "No valid ports or ranges provided",
        )));
    }

    Ok(ports.into_iter().unique().collect())
}

fn parse_port_range(range_str: &str) -> Result<Vec<u16>, String> {
    let Some((start, end)) = range_str.split('-').collect_tuple() else {
        return Err(format!(
            "Invalid range format '{range_str}'. Expected 'start-end'. Example: 1-1000.",
        ));
    };

    let start: u16 = start
        .trim()
        .parse()
        .map_err(|_| format!("Invalid start port '{start}' in range '{range_str}'"))?;
    let end: u16 = end
        .trim()
        .parse()
        .map_err(|_| format!("Invalid end port '{end}' in range '{range_str}'"))?;

    if start > end {
        return Err(format!(
            "Start port {start} is greater than end port {end} in range '{range_str}'",
        ));
    }

    if start < LOWEST_PORT_NUMBER {
        return Err(format!(
            "Ports in range '{range_str}' must be between {LOWEST_PORT_NUMBER} and {TOP_PORT_NUMBER}",
        ));
    }

    Ok((start..=end).collect())
}

fn parse_single_port(port_str: &str) -> Result<u16, String> {
    let port: u16 = port_str
        .parse()
        .map_err(|_| format!("Invalid port number '{port_str}'"))?;

    if port < LOWEST_PORT_NUMBER {
        return Err(format!(
            "Port {port} must be between {LOWEST_PORT_NUMBER} and {TOP_PORT_NUMBER}",
        ));
    }

    Ok(port)
}

/// Reads one pattern per line. Blank lines and `#` comments are ignored.
pub fn read_rules_file(path: &Path) -> Result<Vec<String>> {
    let rules = fs::read_to_string(path)?
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(ToOwned::to_owned)
        .collect();
    Ok(rules)
}

#[derive(Parser, Debug, Clone)]
#[command(
    name = "patdown",
    version = env!("CARGO_PKG_VERSION"),
    max_term_width = 120,
    help_template = "{bin} {version}\n{about}\n\nUSAGE:\n    {usage}\n\nOPTIONS:\n{options}",
)]
#[allow(clippy::struct_excessive_bools)]
/// Finds reachable endpoints and searches what they send back.
/// WARNING Only point this at infrastructure you are allowed to probe.
pub struct Opts {
    /// A comma-delimited list of CIDRs or IPs to scan.
    #[arg(short, long, value_delimiter = ',')]
    pub addresses: Vec<String>,

    /// Ports and/or port ranges to pair with every address. Examples: 80,443 or 9200-9210
    #[arg(short, long, value_parser = parse_ports_and_ranges)]
    pub ports: Option<Ports>,

    /// A search rule (regular expression). Can be given several times.
    #[arg(short, long = "rule")]
    pub rules: Vec<String>,

    /// File holding one search rule per line.
    #[arg(long)]
    pub rules_file: Option<PathBuf>,

    /// Host search query to run on Shodan.
    #[arg(long)]
    pub shodan_query: Option<String>,

    /// Shodan API key.
    #[arg(long, env = "SHODAN_KEY", hide_env_values = true)]
    pub shodan_key: Option<String>,

    /// Protocol spoken by the endpoints. Guessed when not given.
    #[arg(long, value_enum, ignore_case = true)]
    pub protocol: Option<ProtocolHint>,

    /// Maximum bytes read from each endpoint, 0 for no limit.
    #[arg(short, long, default_value = "0")]
    pub limit: u64,

    /// The timeout in milliseconds for connecting to an endpoint.
    #[arg(short, long, default_value = "3000")]
    pub timeout: u32,

    /// Milliseconds spent reading an endpoint. Whatever arrived by then is matched.
    #[arg(long, default_value = "10000")]
    pub read_timeout: u32,

    /// Report endpoints that did not match as well.
    #[arg(long)]
    pub report_all: bool,

    /// Capture every matched fragment instead of stopping at the first hit.
    #[arg(long)]
    pub capture: bool,

    /// How to walk several endpoint sources.
    #[arg(long, value_enum, ignore_case = true, default_value = "breadth-first")]
    pub iteration: IterationStyle,

    /// Only search addresses whose port accepts a connection.
    #[arg(long)]
    pub check_open: bool,

    /// How often a port probe is retried after running out of sockets.
    /// Unbounded when not given.
    #[arg(long)]
    pub exhaustion_retries: Option<u32>,

    /// Automatically ups the ULIMIT with the value you provided.
    #[arg(short, long)]
    pub ulimit: Option<u64>,

    /// Greppable mode. Only output the matching endpoints.
    #[arg(short, long)]
    pub greppable: bool,

    /// Accessible mode. Turns off features which negatively affect screen readers.
    #[arg(long)]
    pub accessible: bool,

    /// Print every match as a JSON object.
    #[arg(long)]
    pub json: bool,

    /// Whether to ignore the configuration file or not.
    #[arg(short, long)]
    pub no_config: bool,

    /// Custom path to config file
    #[arg(short, long, value_parser)]
    pub config_path: Option<PathBuf>,
}

#[cfg(not(tarpaulin_include))]
impl Opts {
    /// Parses the process arguments.
    pub fn read() -> Self {
        Self::parse()
    }

    /// Merge values found within the user configuration file into the
    /// command line options.
    pub fn merge(&mut self, config: &Config) {
        if !self.no_config {
            self.merge_required(config);
            self.merge_optional(config);
        }
    }

    fn merge_required(&mut self, config: &Config) {
        macro_rules! merge_required {
            ($($field: ident),+) => {
                $(
                    if let Some(e) = &config.$field {
                        self.$field = e.clone();
                    }
                )+
            }
        }

        merge_required!(
            addresses, rules, greppable, accessible, json, limit, timeout, read_timeout,
            report_all, capture, iteration, check_open
        );
    }

    fn merge_optional(&mut self, config: &Config) {
        macro_rules! merge_optional {
            ($($field: ident),+) => {
                $(
                    if config.$field.is_some() {
                        self.$field = config.$field.clone();
                    }
                )+
            }
        }

        merge_optional!(
            ports, rules_file, shodan_query, shodan_key, protocol, exhaustion_retries, ulimit
        );
    }

    /// Library options matching these command line options.
    pub fn search_options(&self) -> SearchOptions {
        SearchOptions {
            data_limit: self.limit,
            connect_timeout: Duration::from_millis(u64::from(self.timeout)),
            read_timeout: Duration::from_millis(u64::from(self.read_timeout)),
            report_non_matches: self.report_all,
            capture: self.capture,
            iteration: self.iteration,
        }
    }
}

impl Default for Opts {
    fn default() -> Self {
        Self {
            addresses: vec![],
            ports: None,
            rules: vec![],
            rules_file: None,
            shodan_query: None,
            shodan_key: None,
            protocol: None,
            limit: 0,
            timeout: 0,
            read_timeout: 0,
            report_all: false,
            capture: false,
            iteration: IterationStyle::BreadthFirst,
            check_open: false,
            exhaustion_retries: None,
            ulimit: None,
            greppable: true,
            accessible: false,
            json: false,
            no_config: true,
            config_path: None,
        }
    }
}

/// Struct used to deserialize the options specified within our config file.
/// These will be further merged with our command line arguments in order to
/// generate the final Opts struct.
#[cfg(not(tarpaulin_include))]
#[derive(Debug, Deserialize, Default)]
pub struct Config {
    addresses: Option<Vec<String>>,
    ports: Option<Vec<u16>>,
    rules: Option<Vec<String>>,
    rules_file: Option<PathBuf>,
    shodan_query: Option<String>,
    shodan_key: Option<String>,
    protocol: Option<ProtocolHint>,
    limit: Option<u64>,
    timeout: Option<u32>,
    read_timeout: Option<u32>,
    report_all: Option<bool>,
    capture: Option<bool>,
    iteration: Option<IterationStyle>,
    check_open: Option<bool>,
    exhaustion_retries: Option<u32>,
    ulimit: Option<u64>,
    greppable: Option<bool>,
    accessible: Option<bool>,
    json: Option<bool>,
}

#[cfg(not(tarpaulin_include))]
#[allow(clippy::doc_link_with_quotes)]
impl Config {
    /// Reads the configuration file with TOML format and parses it into a
    /// Config struct. A missing file yields an empty config.
    ///
    /// # Format
    ///
    /// addresses = ["10.0.0.0/24"]
    /// ports = [80, 9200]
    /// rules = ["\"cluster_name\"", "(?i)index of"]
    /// capture = true
    /// iteration = "depth-first"
    ///
    pub fn read(custom_config_path: Option<PathBuf>) -> Result<Self> {
        let Some(config_path) = custom_config_path.or_else(default_config_path) else {
            return Ok(Self::default());
        };
        if !config_path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(config_path)?;
        Ok(toml::from_str(&content)?)
    }
}

/// Constructs default path to config toml
pub fn default_config_path() -> Option<PathBuf> {
    let mut config_path = dirs::home_dir()?;
    config_path.push(".patdown.toml");
    Some(config_path)
}
