//! NAT-PMP client, RFC 6886.

use std::net::Ipv4Addr;
use std::num::NonZeroU16;

use tokio::net::UdpSocket;
use tracing::{debug, trace};

use crate::candidates::{sweep, Waves};
use crate::defaults::{NAT_PMP_PROBE_PORT, PROBE_LIFETIME_SECONDS, RECV_TIMEOUT};
use crate::lan::closest_local_ip;
use crate::{Error, Transport};

pub(crate) mod protocol;

/// Largest datagram a NAT-PMP conversation can produce.
const MAX_DATAGRAM_SIZE: usize = 512;

/// A port mapping granted by a NAT-PMP gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mapping {
    /// Gateway that granted the mapping.
    pub(crate) gateway: Ipv4Addr,
    /// Local address forwarded traffic is delivered to.
    pub(crate) local_ip: Ipv4Addr,
    pub(crate) internal_port: NonZeroU16,
    /// Port granted by the gateway, possibly different from the one asked
    /// for.
    pub(crate) external_port: NonZeroU16,
    /// Lifetime granted by the gateway, possibly shorter than requested.
    pub(crate) lifetime_seconds: u32,
    pub(crate) transport: Transport,
}

/// Sends one request to `router` and awaits the first reply under the 2 s
/// cap. The socket lives for the scope of this call and is released on
/// every exit path.
async fn request_one(
    router: Ipv4Addr,
    gateway_port: u16,
    request: protocol::Request,
) -> Result<protocol::Response, Error> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
        .await
        .map_err(|e| {
            trace!("bind failed: {e}");
            Error::NoRouterResponse
        })?;
    socket.connect((router, gateway_port)).await.map_err(|e| {
        trace!("connect {router} failed: {e}");
        Error::NoRouterResponse
    })?;
    socket.send(&request.encode()).await.map_err(|e| {
        trace!("send to {router} failed: {e}");
        Error::NoRouterResponse
    })?;

    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    let read = tokio::time::timeout(RECV_TIMEOUT, socket.recv(&mut buf))
        .await
        .map_err(|_| Error::NoRouterResponse)?
        .map_err(|e| {
            trace!("recv from {router} failed: {e}");
            Error::NoRouterResponse
        })?;

    protocol::Response::decode(&buf[..read]).map_err(|e| match e {
        protocol::Error::Result(code) => Error::Protocol { code: code as u16 },
        other => {
            debug!("router {router} sent a malformed reply: {other}");
            Error::NoRouterResponse
        }
    })
}

/// Maps `internal_port` on the first responsive gateway, trying the
/// candidate waves in order.
pub(crate) async fn map(
    waves: &Waves,
    lan_ips: &[Ipv4Addr],
    gateway_port: u16,
    transport: Transport,
    internal_port: NonZeroU16,
    external_port: u16,
    lifetime_seconds: u32,
) -> Result<Mapping, Error> {
    let request = protocol::Request::Mapping {
        transport,
        internal_port: internal_port.into(),
        external_port,
        lifetime_seconds,
    };
    let (gateway, (granted_port, granted_lifetime)) = sweep(waves, |router| async move {
        match request_one(router, gateway_port, request).await? {
            protocol::Response::Mapping {
                external_port,
                lifetime_seconds,
                ..
            } => {
                let external_port = NonZeroU16::new(external_port).ok_or_else(|| {
                    debug!("router {router} granted external port 0");
                    Error::NoRouterResponse
                })?;
                Ok((external_port, lifetime_seconds))
            }
            protocol::Response::ExternalAddress { .. } => {
                debug!("router {router} answered a map request with an address response");
                Err(Error::NoRouterResponse)
            }
        }
    })
    .await?;

    let local_ip = closest_local_ip(lan_ips, gateway).ok_or(Error::NoLocalIp)?;
    debug!("NAT-PMP mapping {local_ip}:{internal_port} -> {granted_port} via {gateway}");

    Ok(Mapping {
        gateway,
        local_ip,
        internal_port,
        external_port: granted_port,
        lifetime_seconds: granted_lifetime,
        transport,
    })
}

/// Unmaps a granted mapping by re-announcing it with lifetime 0 across the
/// candidate waves.
pub(crate) async fn release(
    mapping: &Mapping,
    waves: &Waves,
    gateway_port: u16,
) -> Result<(), Error> {
    let request = protocol::Request::Mapping {
        transport: mapping.transport,
        internal_port: mapping.internal_port.into(),
        external_port: 0,
        lifetime_seconds: 0,
    };
    let (gateway, ()) = sweep(waves, |router| async move {
        request_one(router, gateway_port, request).await.map(|_| ())
    })
    .await?;
    debug!("NAT-PMP mapping for {} released via {gateway}", mapping.internal_port);
    Ok(())
}

/// Queries the gateway's external address, RFC 6886 section 3.2.
pub(crate) async fn external_address(
    waves: &Waves,
    gateway_port: u16,
) -> Result<(Ipv4Addr, Ipv4Addr), Error> {
    let (gateway, external_ip) = sweep(waves, |router| async move {
        match request_one(router, gateway_port, protocol::Request::ExternalAddress).await? {
            protocol::Response::ExternalAddress { external_ip, .. } => Ok(external_ip),
            protocol::Response::Mapping { .. } => Err(Error::NoRouterResponse),
        }
    })
    .await?;
    Ok((gateway, external_ip))
}

/// Checks for NAT-PMP support by mapping the reserved probe port for a
/// couple of minutes. The probe mapping is left to expire at the router.
pub(crate) async fn probe_available(
    waves: &Waves,
    lan_ips: &[Ipv4Addr],
    gateway_port: u16,
    transport: Transport,
) -> bool {
    let probe_port = NonZeroU16::new(NAT_PMP_PROBE_PORT).expect("probe port is non-zero");
    match map(
        waves,
        lan_ips,
        gateway_port,
        transport,
        probe_port,
        NAT_PMP_PROBE_PORT,
        PROBE_LIFETIME_SECONDS,
    )
    .await
    {
        Ok(mapping) => {
            trace!("NAT-PMP probe succeeded via {}", mapping.gateway);
            true
        }
        Err(e) => {
            debug!("NAT-PMP probe failed: {e}");
            false
        }
    }
}
