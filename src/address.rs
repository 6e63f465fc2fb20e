//! Provides functions to parse address ranges (CIDRs or single IPs) and walk
//! the addresses they contain.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use cidr_utils::cidr::{IpCidr, IpInet};
use log::debug;

use crate::error::{Error, Result};

/// A contiguous block of addresses: a base address plus a mask.
///
/// The base is always stored masked, so `192.168.1.77/24` covers
/// `192.168.1.0` up to `192.168.1.255`.
///
/// ```rust
/// # use patdown::address::AddressRange;
/// let range: AddressRange = "10.0.0.9/30".parse().unwrap();
/// let addrs = range.addresses().map(|a| a.to_string()).collect::<Vec<_>>();
/// assert_eq!(addrs, ["10.0.0.8", "10.0.0.9", "10.0.0.10", "10.0.0.11"]);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressRange {
    cidr: IpCidr,
}

impl AddressRange {
    /// Range holding exactly one address.
    pub fn host(addr: IpAddr) -> Self {
        Self {
            cidr: IpCidr::new_host(addr),
        }
    }

    /// First (masked base) address of the range.
    pub fn first(&self) -> IpAddr {
        self.cidr.first_address()
    }

    /// Whether `addr` falls inside the range's mask.
    pub fn contains(&self, addr: &IpAddr) -> bool {
        self.cidr.contains(addr)
    }

    /// Walks every address of the range in numeric order.
    pub fn addresses(&self) -> Addresses {
        Addresses {
            range: *self,
            next: Some(self.first()),
        }
    }
}

impl FromStr for AddressRange {
    type Err = Error;

    fn from_str(input: &str) -> Result<Self> {
        let input = input.trim();
        if !input.contains('/') {
            return IpAddr::from_str(input)
                .map(Self::host)
                .map_err(|_| Error::InvalidRange(input.to_owned()));
        }

        // IpInet keeps host bits, which lets "192.168.1.77/24" through.
        IpInet::from_str(input)
            .map(|inet| Self {
                cidr: inet.network(),
            })
            .map_err(|_| Error::InvalidRange(input.to_owned()))
    }
}

impl fmt::Display for AddressRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.cidr)
    }
}

/// Iterator over the addresses of one [`AddressRange`].
#[derive(Debug, Clone)]
pub struct Addresses {
    range: AddressRange,
    next: Option<IpAddr>,
}

impl Iterator for Addresses {
    type Item = IpAddr;

    fn next(&mut self) -> Option<IpAddr> {
        let current = self.next?;
        self.next = increment(current).filter(|candidate| self.range.contains(candidate));
        Some(current)
    }
}

/// Big-endian increment with carry.
///
/// Returns `None` when the carry runs off the most significant byte, i.e.
/// the address space is exhausted.
pub fn increment(addr: IpAddr) -> Option<IpAddr> {
    match addr {
        IpAddr::V4(v4) => {
            let mut octets = v4.octets();
            carry(&mut octets).then(|| IpAddr::V4(Ipv4Addr::from(octets)))
        }
        IpAddr::V6(v6) => {
            let mut octets = v6.octets();
            carry(&mut octets).then(|| IpAddr::V6(Ipv6Addr::from(octets)))
        }
    }
}

fn carry(octets: &mut [u8]) -> bool {
    for byte in octets.iter_mut().rev() {
        *byte = byte.wrapping_add(1);
        if *byte != 0 {
            return true;
        }
    }
    false
}

/// Parses every entry as an [`AddressRange`], keeping insertion order.
///
/// ```rust
/// # use patdown::address::parse_ranges;
/// let ranges = parse_ranges(["127.0.0.1", "192.168.0.0/30"]).unwrap();
/// assert_eq!(ranges.len(), 2);
/// ```
pub fn parse_ranges<I, S>(inputs: I) -> Result<Vec<AddressRange>>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    inputs
        .into_iter()
        .map(|input| {
            let range = input.as_ref().parse::<AddressRange>()?;
            debug!("Parsed address range {range}");
            Ok(range)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::{increment, parse_ranges, AddressRange};
    use parameterized::parameterized;
    use std::net::{IpAddr, Ipv4Addr};

    #[test]
    fn parse_correct_addresses() {
        let ranges = parse_ranges(["127.0.0.1", "192.168.0.0/30"]).unwrap();
        let ips = ranges
            .iter()
            .flat_map(AddressRange::addresses)
            .collect::<Vec<_>>();

        assert_eq!(
            ips,
            [
                Ipv4Addr::new(127, 0, 0, 1),
                Ipv4Addr::new(192, 168, 0, 0),
                Ipv4Addr::new(192, 168, 0, 1),
                Ipv4Addr::new(192, 168, 0, 2),
                Ipv4Addr::new(192, 168, 0, 3)
            ]
        );
    }

    #[test]
    fn parse_incorrect_addresses() {
        assert!(parse_ranges(["im_wrong"]).is_err());
        assert!(parse_ranges(["300.10.1.1"]).is_err());
        assert!(parse_ranges(["10.0.0.0/33"]).is_err());
    }

    #[test]
    fn host_bits_are_masked() {
        let range: AddressRange = "1.2.3.4/16".parse().unwrap();
        assert_eq!(range.first(), IpAddr::from([1, 2, 0, 0]));

        let mut count = 0;
        for ip in range.addresses() {
            let IpAddr::V4(v4) = ip else {
                panic!("expected an IPv4 address, got {ip}");
            };
            assert_eq!(&v4.octets()[..2], &[1, 2]);
            count += 1;
        }
        assert_eq!(count, 65536);
    }

    #[parameterized(input = {
        "10.0.0.255", "10.0.255.255", "9.255.255.255", "::ff",
    }, expected = {
        "10.0.1.0", "10.1.0.0", "10.0.0.0", "::100",
    })]
    fn increment_carries(input: &str, expected: &str) {
        let ip = input.parse::<IpAddr>().unwrap();
        assert_eq!(increment(ip), Some(expected.parse().unwrap()));
    }

    #[test]
    fn increment_stops_at_top_of_space() {
        assert_eq!(increment(IpAddr::from([255, 255, 255, 255])), None);

        let last: AddressRange = "255.255.255.254/31".parse().unwrap();
        assert_eq!(last.addresses().count(), 2);
    }

    #[test]
    fn ipv6_range() {
        let range: AddressRange = "fe80::/126".parse().unwrap();
        let ips = range.addresses().map(|ip| ip.to_string()).collect::<Vec<_>>();
        assert_eq!(ips, ["fe80::", "fe80::1", "fe80::2", "fe80::3"]);
    }
}
