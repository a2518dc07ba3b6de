//! Default addresses, ports and timing constants.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;

/// UDP port NAT-PMP and PCP servers listen on, see RFC 6886 and RFC 6887.
pub const GATEWAY_PORT: u16 = 5351;

/// SSDP multicast group and port used for UPnP discovery.
pub const SSDP_ADDR: SocketAddrV4 = SocketAddrV4::new(Ipv4Addr::new(239, 255, 255, 250), 1900);

/// Time a single UDP request is given to produce a reply.
pub const RECV_TIMEOUT: Duration = Duration::from_secs(2);

/// Window during which unicast replies to an SSDP search are collected.
pub const SSDP_COLLECT_WINDOW: Duration = Duration::from_secs(1);

/// Time allowed for LAN address enumeration before giving up.
pub const LAN_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(2);

/// Refresh cadence applied to mappings the router considers static
/// (granted lifetime 0).
pub const STATIC_REFRESH_INTERVAL: Duration = Duration::from_secs(60 * 60 * 24);

/// Lifetime requested when probing a protocol for support.
pub const PROBE_LIFETIME_SECONDS: u32 = 120;

/// External port used when probing NAT-PMP support.
pub const NAT_PMP_PROBE_PORT: u16 = 55555;

/// External port used when probing PCP support.
pub const PCP_PROBE_PORT: u16 = 55556;

/// External port used when probing UPnP support.
pub const UPNP_PROBE_PORT: u16 = 55557;

/// Ports reserved for support probes. These are refused as real mapping
/// ports for the lifetime of the process.
pub const PROBE_PORTS: [u16; 3] = [NAT_PMP_PROBE_PORT, PCP_PROBE_PORT, UPNP_PROBE_PORT];

/// Default gateway addresses handed out by popular residential routers.
///
/// Ordered; treated as an immutable set shared by every discovery wave.
pub const ROUTER_IPS: [Ipv4Addr; 20] = [
    Ipv4Addr::new(192, 168, 0, 1),
    Ipv4Addr::new(192, 168, 1, 1),
    Ipv4Addr::new(192, 168, 1, 254),
    Ipv4Addr::new(192, 168, 2, 1),
    Ipv4Addr::new(192, 168, 8, 1),
    Ipv4Addr::new(192, 168, 10, 1),
    Ipv4Addr::new(192, 168, 11, 1),
    Ipv4Addr::new(192, 168, 15, 1),
    Ipv4Addr::new(192, 168, 20, 1),
    Ipv4Addr::new(192, 168, 30, 1),
    Ipv4Addr::new(192, 168, 50, 1),
    Ipv4Addr::new(192, 168, 62, 1),
    Ipv4Addr::new(192, 168, 100, 1),
    Ipv4Addr::new(192, 168, 102, 1),
    Ipv4Addr::new(192, 168, 123, 254),
    Ipv4Addr::new(10, 0, 0, 1),
    Ipv4Addr::new(10, 0, 0, 2),
    Ipv4Addr::new(10, 0, 0, 138),
    Ipv4Addr::new(10, 0, 1, 1),
    Ipv4Addr::new(10, 1, 1, 1),
];
