use std::net::SocketAddr;
use std::sync::Arc;

use crate::address::{AddressRange, Addresses};

/// Lazily pairs every address of every range with every port.
///
/// Ranges are walked in insertion order; for each address all ports are
/// yielded before moving on to the next address.
#[derive(Debug, Clone)]
pub struct SocketIterator {
    ranges: Arc<[AddressRange]>,
    ports: Arc<[u16]>,
    range_idx: usize,
    port_idx: usize,
    addresses: Option<Addresses>,
    current: Option<std::net::IpAddr>,
}

impl SocketIterator {
    /// Starts before the first address of the first range.
    pub fn new(ranges: Arc<[AddressRange]>, ports: Arc<[u16]>) -> Self {
        Self {
            ranges,
            ports,
            range_idx: 0,
            port_idx: 0,
            addresses: None,
            current: None,
        }
    }

    fn next_address(&mut self) -> Option<std::net::IpAddr> {
        loop {
            if let Some(ip) = self.addresses.as_mut().and_then(Iterator::next) {
                return Some(ip);
            }
            let range = self.ranges.get(self.range_idx)?;
            self.range_idx += 1;
            self.addresses = Some(range.addresses());
        }
    }
}

impl Iterator for SocketIterator {
    type Item = SocketAddr;

    fn next(&mut self) -> Option<SocketAddr> {
        if self.ports.is_empty() {
            return None;
        }

        if self.port_idx == 0 || self.current.is_none() {
            self.current = Some(self.next_address()?);
        }

        let ip = self.current?;
        let port = self.ports[self.port_idx];
        self.port_idx = (self.port_idx + 1) % self.ports.len();
        Some(SocketAddr::new(ip, port))
    }
}

#[cfg(test)]
mod tests {
    use super::SocketIterator;
    use crate::address::parse_ranges;
    use std::net::SocketAddr;

    fn pairs(ranges: &[&str], ports: &[u16]) -> Vec<SocketAddr> {
        let ranges = parse_ranges(ranges).unwrap();
        SocketIterator::new(ranges.into(), ports.into()).collect()
    }

    #[test]
    fn goes_through_every_ip_every_port() {
        let sockets = pairs(&["127.0.0.1", "192.168.0.1"], &[22, 80]);

        let expected = [
            "127.0.0.1:22",
            "127.0.0.1:80",
            "192.168.0.1:22",
            "192.168.0.1:80",
        ]
        .map(|s| s.parse::<SocketAddr>().unwrap());
        assert_eq!(sockets, expected);
    }

    #[test]
    fn address_major_port_minor_across_a_range() {
        let sockets = pairs(&["10.0.0.0/31"], &[1, 2, 3]);
        let rendered = sockets.iter().map(ToString::to_string).collect::<Vec<_>>();
        assert_eq!(
            rendered,
            [
                "10.0.0.0:1", "10.0.0.0:2", "10.0.0.0:3",
                "10.0.0.1:1", "10.0.0.1:2", "10.0.0.1:3",
            ]
        );
    }

    #[test]
    fn empty_inputs_yield_nothing() {
        assert!(pairs(&[], &[80]).is_empty());
        assert!(pairs(&["127.0.0.1"], &[]).is_empty());
    }

    #[test]
    fn every_pair_exactly_once() {
        let sockets = pairs(&["172.16.0.0/24", "172.16.0.0/30"], &[443]);
        // Overlapping ranges are walked independently.
        assert_eq!(sockets.len(), 256 + 4);
        assert_eq!(sockets[255].to_string(), "172.16.0.255:443");
        assert_eq!(sockets[256].to_string(), "172.16.0.0:443");
    }
}
