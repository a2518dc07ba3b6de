//! Router-candidate selection.
//!
//! On an unknown home network the gateway address is guessed from a list of
//! popular defaults. Protocols with per-router requests (NAT-PMP, PCP) fan
//! out in two waves: first the candidates we have reason to believe in
//! (previously successful routers, then defaults on our own subnets), and
//! only if that wave stays silent the remaining defaults.

use std::net::Ipv4Addr;

use tracing::trace;

use crate::lan::longest_prefix_match;
use crate::Error;

/// The two ordered candidate batches for one discovery run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Waves {
    /// Known-good cache first, then defaults matching a local subnet.
    pub matched: Vec<Ipv4Addr>,
    /// Every other default, tried only when `matched` produced nothing.
    pub other: Vec<Ipv4Addr>,
}

/// Computes the candidate waves from the known-good cache, the host's LAN
/// addresses and the default router list.
pub(crate) fn waves(cache: &[Ipv4Addr], lan_ips: &[Ipv4Addr], defaults: &[Ipv4Addr]) -> Waves {
    let mut matched: Vec<Ipv4Addr> = Vec::with_capacity(cache.len() + lan_ips.len());
    for &router in cache {
        if !matched.contains(&router) {
            matched.push(router);
        }
    }
    for &ip in lan_ips {
        if let Some(router) = longest_prefix_match(defaults, ip) {
            if !matched.contains(&router) {
                matched.push(router);
            }
        }
    }

    let other = defaults
        .iter()
        .copied()
        .filter(|router| !matched.contains(router))
        .collect();

    Waves { matched, other }
}

/// Runs `attempt` against every candidate of a wave concurrently and picks
/// the first success in wave order; the second wave is only queried when
/// the first stayed silent.
///
/// Per-candidate failures are demoted to log lines. When no candidate
/// succeeds the most telling error is reported: a router that answered
/// with an error code beats plain silence.
pub(crate) async fn sweep<T, F, Fut>(waves: &Waves, attempt: F) -> Result<(Ipv4Addr, T), Error>
where
    F: Fn(Ipv4Addr) -> Fut,
    Fut: std::future::Future<Output = Result<T, Error>>,
{
    let mut reported = Error::NoRouterResponse;
    for wave in [&waves.matched, &waves.other] {
        if wave.is_empty() {
            continue;
        }
        let attempts = wave.iter().map(|&router| attempt(router));
        let results = futures_util::future::join_all(attempts).await;
        for (&router, result) in wave.iter().zip(results) {
            match result {
                Ok(value) => return Ok((router, value)),
                Err(e) => {
                    trace!("candidate {router} failed: {e}");
                    if matches!(e, Error::Protocol { .. }) {
                        reported = e;
                    }
                }
            }
        }
    }
    Err(reported)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::defaults::ROUTER_IPS;

    fn ip(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    #[test]
    fn cache_comes_first() {
        let cache = [ip("10.0.0.138")];
        let lan = [ip("192.168.1.42")];
        let waves = waves(&cache, &lan, &ROUTER_IPS);
        assert_eq!(waves.matched[0], ip("10.0.0.138"));
        assert_eq!(waves.matched[1], ip("192.168.1.1"));
    }

    #[test]
    fn matched_and_other_partition_the_defaults() {
        let lan = [ip("192.168.1.42")];
        let waves = waves(&[], &lan, &ROUTER_IPS);
        assert_eq!(waves.matched, vec![ip("192.168.1.1")]);
        assert_eq!(waves.other.len(), ROUTER_IPS.len() - 1);
        assert!(!waves.other.contains(&ip("192.168.1.1")));
    }

    #[test]
    fn cached_router_not_repeated_in_other() {
        let cache = [ip("192.168.1.1")];
        let waves = waves(&cache, &[], &ROUTER_IPS);
        assert_eq!(waves.matched, vec![ip("192.168.1.1")]);
        assert!(!waves.other.contains(&ip("192.168.1.1")));
    }

    #[test]
    fn off_list_cache_entry_is_kept() {
        // a router learned at runtime does not need to be a default
        let cache = [ip("172.16.0.1")];
        let waves = waves(&cache, &[], &ROUTER_IPS);
        assert_eq!(waves.matched, vec![ip("172.16.0.1")]);
        assert_eq!(waves.other.len(), ROUTER_IPS.len());
    }
}
