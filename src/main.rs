#![deny(clippy::all)]
#![warn(clippy::pedantic)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use colored::Colorize;
use futures::StreamExt;
use log::{debug, info, warn};
use tokio_util::sync::CancellationToken;

use patdown::address::parse_ranges;
use patdown::input::{read_rules_file, Config, Opts};
use patdown::query::{QueryReader, ShodanClient};
use patdown::scanner::{PortProbe, ScanReader};
use patdown::searcher::{Match, Searcher};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let mut opts = Opts::read();
    let config = Config::read(opts.config_path.clone()).context("Failed to read config file")?;
    opts.merge(&config);

    debug!(
        "Main() `opts` arguments: addresses {:?} ports {:?} rules {:?}",
        opts.addresses, opts.ports, opts.rules
    );

    #[cfg(unix)]
    adjust_ulimit_size(&opts);

    let searcher = build_searcher(&opts).await?;

    let token = CancellationToken::new();
    let interrupt = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping search");
            interrupt.cancel();
        }
    });

    let mut matches = searcher.process(token)?;
    let mut matched = 0usize;
    while let Some(found) = matches.next().await {
        if found.matched {
            matched += 1;
        }
        print_match(&opts, &found);
    }

    if !opts.greppable && !opts.json {
        println!("{matched} endpoint(s) matched");
    }
    Ok(())
}

async fn build_searcher(opts: &Opts) -> anyhow::Result<Searcher> {
    let mut searcher = Searcher::with_options(opts.search_options());

    let mut rules = opts.rules.clone();
    if let Some(path) = &opts.rules_file {
        rules.extend(
            read_rules_file(path)
                .with_context(|| format!("Failed to read rules from {}", path.display()))?,
        );
    }
    for rule in &rules {
        searcher
            .add_search_rule(rule)
            .with_context(|| format!("Bad rule {rule:?}"))?;
    }

    let mut sources = 0;
    if !opts.addresses.is_empty() {
        let Some(ports) = &opts.ports else {
            bail!("Addresses given without ports. Use --ports, e.g. --ports 80,9200");
        };

        let mut reader = ScanReader::new();
        for range in parse_ranges(&opts.addresses)? {
            reader.add_range(range);
        }
        for &port in ports {
            reader.add_port(port);
        }
        if let Some(hint) = opts.protocol {
            reader.set_protocol(hint);
        }
        if opts.check_open {
            let timeout = Duration::from_millis(u64::from(opts.timeout));
            reader.check_port_open(
                PortProbe::new(timeout).max_exhaustion_retries(opts.exhaustion_retries),
            );
        }
        searcher.add_reader(Box::new(reader));
        sources += 1;
    }

    if let Some(query) = &opts.shodan_query {
        let Some(key) = &opts.shodan_key else {
            bail!("A Shodan query needs an API key, set SHODAN_KEY or --shodan-key");
        };
        let timeout = Duration::from_millis(u64::from(opts.read_timeout));
        let client = ShodanClient::new(key.as_str(), timeout)?;
        let mut reader = QueryReader::new(Arc::new(client), query.as_str())
            .await
            .context("Shodan query failed")?;
        info!("Shodan returned {} hosts", reader.len());
        if let Some(hint) = opts.protocol {
            reader.set_protocol(hint);
        }
        searcher.add_reader(Box::new(reader));
        sources += 1;
    }

    if sources == 0 {
        bail!("Nothing to search. Give --addresses and --ports, or --shodan-query");
    }
    Ok(searcher)
}

fn print_match(opts: &Opts, found: &Match) {
    if opts.json {
        println!("{}", found.to_json());
        return;
    }

    let identity = found.endpoint.identity();
    if opts.greppable {
        if found.matched {
            println!("{identity}");
        }
        return;
    }

    match (found.matched, opts.accessible) {
        (true, true) => println!("Match {identity}"),
        (true, false) => println!("Match {}", identity.green()),
        (false, true) => println!("No match {identity}"),
        (false, false) => println!("No match {}", identity.dimmed()),
    }
    for fragment in &found.fragments {
        println!("    {fragment}");
    }
}

#[cfg(unix)]
fn adjust_ulimit_size(opts: &Opts) -> Option<u64> {
    use rlimit::Resource;

    if let Some(limit) = opts.ulimit {
        if Resource::NOFILE.set(limit, limit).is_ok() {
            info!("Automatically increasing ulimit value to {limit}.");
        } else {
            warn!("ERROR. Failed to set ulimit value.");
        }
    }

    let (soft, _) = Resource::NOFILE.get().ok()?;
    debug!("Open file limit is {soft}");
    Some(soft)
}
