//! LAN-side IPv4 helpers: longest-prefix matching and local address
//! discovery.

use std::fmt;
use std::io;
use std::net::Ipv4Addr;

use futures_lite::future::Boxed as BoxFuture;
use futures_lite::FutureExt;

/// Number of leading bits shared by two addresses.
fn common_prefix_len(a: Ipv4Addr, b: Ipv4Addr) -> u32 {
    (u32::from(a) ^ u32::from(b)).leading_zeros()
}

/// Returns the entry of `list` sharing the longest high-order bit prefix
/// with `target`. Ties are broken by list order, first wins. `None` only
/// for an empty list.
pub fn longest_prefix_match(list: &[Ipv4Addr], target: Ipv4Addr) -> Option<Ipv4Addr> {
    let mut best: Option<(Ipv4Addr, u32)> = None;
    for &candidate in list {
        let len = common_prefix_len(candidate, target);
        if best.map(|(_, best_len)| len > best_len).unwrap_or(true) {
            best = Some((candidate, len));
        }
    }
    best.map(|(addr, _)| addr)
}

/// Picks the local address closest to `router` from `lan_ips`, the address
/// the router will see our traffic from.
pub(crate) fn closest_local_ip(lan_ips: &[Ipv4Addr], router: Ipv4Addr) -> Option<Ipv4Addr> {
    longest_prefix_match(lan_ips, router)
}

/// Capability to enumerate the host's LAN-routable IPv4 addresses.
///
/// Injected into the service at construction so tests can substitute a
/// fixed address list for the host network.
pub trait LanDiscovery: fmt::Debug + Send + Sync + 'static {
    /// Enumerate the host's IPv4 addresses that are routable on the LAN.
    fn lan_ipv4s(&self) -> BoxFuture<io::Result<Vec<Ipv4Addr>>>;
}

/// Production [`LanDiscovery`]: learns the outbound LAN address from the
/// routing decision of a connected UDP socket. No traffic is sent.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemLan;

impl LanDiscovery for SystemLan {
    fn lan_ipv4s(&self) -> BoxFuture<io::Result<Vec<Ipv4Addr>>> {
        async {
            let socket = tokio::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
            socket.connect("8.8.8.8:53").await?;
            match socket.local_addr()?.ip() {
                std::net::IpAddr::V4(ip) if !ip.is_unspecified() && !ip.is_loopback() => {
                    Ok(vec![ip])
                }
                other => Err(io::Error::new(
                    io::ErrorKind::AddrNotAvailable,
                    format!("no LAN-routable IPv4 address ({other:?})"),
                )),
            }
        }
        .boxed()
    }
}

/// A fixed address list, used by tests and hosts that know their topology.
#[derive(Debug, Clone)]
pub struct StaticLan(pub Vec<Ipv4Addr>);

impl LanDiscovery for StaticLan {
    fn lan_ipv4s(&self) -> BoxFuture<io::Result<Vec<Ipv4Addr>>> {
        let ips = self.0.clone();
        async move {
            if ips.is_empty() {
                Err(io::Error::new(
                    io::ErrorKind::AddrNotAvailable,
                    "static LAN address list is empty",
                ))
            } else {
                Ok(ips)
            }
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    #[test]
    fn lpm_returns_list_member() {
        let list = [ip("192.168.0.1"), ip("192.168.1.1"), ip("10.0.0.1")];
        let found = longest_prefix_match(&list, ip("192.168.1.42")).unwrap();
        assert!(list.contains(&found));
        assert_eq!(found, ip("192.168.1.1"));
    }

    #[test]
    fn lpm_exact_member_wins() {
        let list = [ip("10.0.0.1"), ip("10.0.0.138"), ip("192.168.1.1")];
        assert_eq!(
            longest_prefix_match(&list, ip("10.0.0.138")),
            Some(ip("10.0.0.138"))
        );
    }

    #[test]
    fn lpm_tie_breaks_by_list_order() {
        // both entries share the same 24-bit prefix with the target
        let list = [ip("10.1.1.1"), ip("10.1.1.2")];
        assert_eq!(
            longest_prefix_match(&list, ip("10.1.1.200")),
            Some(ip("10.1.1.1"))
        );
    }

    #[test]
    fn lpm_empty_list() {
        assert_eq!(longest_prefix_match(&[], ip("192.168.1.1")), None);
    }
}
