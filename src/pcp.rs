//! PCP client, RFC 6887. Base MAP opcode only.

use std::net::Ipv4Addr;
use std::num::NonZeroU16;

use rand::RngCore;
use tokio::net::UdpSocket;
use tracing::{debug, trace};

use crate::candidates::{sweep, Waves};
use crate::defaults::{PCP_PROBE_PORT, PROBE_LIFETIME_SECONDS, RECV_TIMEOUT};
use crate::lan::closest_local_ip;
use crate::{Error, Transport};

pub(crate) mod protocol;

/// A port mapping granted by a PCP gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mapping {
    /// Gateway that granted the mapping.
    pub(crate) gateway: Ipv4Addr,
    /// Local address forwarded traffic is delivered to, as embedded in the
    /// request.
    pub(crate) local_ip: Ipv4Addr,
    pub(crate) internal_port: NonZeroU16,
    pub(crate) external_port: NonZeroU16,
    /// External address reported by the gateway.
    pub(crate) external_ip: Ipv4Addr,
    pub(crate) lifetime_seconds: u32,
    /// Nonce of the granting request; deletion must present it again.
    pub(crate) nonce: [u8; 12],
    pub(crate) transport: Transport,
}

/// Sends one MAP request to `router` and awaits the first reply under the
/// 2 s cap. The socket is scoped to this call and released on every exit
/// path.
async fn request_one(
    router: Ipv4Addr,
    gateway_port: u16,
    request: protocol::MapRequest,
) -> Result<protocol::MapResponse, Error> {
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

    let mut buf = vec![0u8; protocol::MAX_RESPONSE_SIZE];
    let read = tokio::time::timeout(RECV_TIMEOUT, socket.recv(&mut buf))
        .await
        .map_err(|_| Error::NoRouterResponse)?
        .map_err(|e| {
            trace!("recv from {router} failed: {e}");
            Error::NoRouterResponse
        })?;

    let response = protocol::MapResponse::decode(&buf[..read]).map_err(|e| {
        debug!("router {router} sent a malformed reply: {e}");
        Error::NoRouterResponse
    })?;
    if response.nonce != request.nonce {
        debug!("router {router} echoed a foreign nonce");
        return Err(Error::NoRouterResponse);
    }
    Ok(response)
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
    let (gateway, mapping) = sweep(waves, |router| async move {
        let local_ip = closest_local_ip(lan_ips, router).ok_or(Error::NoLocalIp)?;

        let mut nonce = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut nonce);

        let request = protocol::MapRequest {
            lifetime_seconds,
            client_ip: local_ip,
            nonce,
            transport,
            internal_port: internal_port.into(),
            external_port,
        };
        let response = request_one(router, gateway_port, request).await?;

        if response.result != protocol::ResultCode::Success {
            return Err(Error::Protocol {
                code: response.result as u16,
            });
        }
        if response.internal_port != u16::from(internal_port) {
            debug!("router {router} granted a mapping for a foreign internal port");
            return Err(Error::NoRouterResponse);
        }
        let granted_port = NonZeroU16::new(response.external_port).ok_or_else(|| {
            debug!("router {router} granted external port 0");
            Error::NoRouterResponse
        })?;

        Ok(Mapping {
            gateway: router,
            local_ip,
            internal_port,
            external_port: granted_port,
            external_ip: response.external_ip,
            lifetime_seconds: response.lifetime_seconds,
            nonce,
            transport,
        })
    })
    .await?;

    debug!(
        "PCP mapping {}:{} -> {}:{} via {gateway}",
        mapping.local_ip, mapping.internal_port, mapping.external_ip, mapping.external_port
    );
    Ok(mapping)
}

/// Deletes a granted mapping: a MAP request with lifetime 0, suggested
/// external port 0 and the original nonce, across the candidate waves.
/// `NO_RESOURCES` means the mapping is already gone and counts as success.
pub(crate) async fn release(
    mapping: &Mapping,
    waves: &Waves,
    gateway_port: u16,
) -> Result<(), Error> {
    let request = protocol::MapRequest {
        lifetime_seconds: 0,
        client_ip: mapping.local_ip,
        nonce: mapping.nonce,
        transport: mapping.transport,
        internal_port: mapping.internal_port.into(),
        external_port: 0,
    };
    let (gateway, ()) = sweep(waves, |router| async move {
        let response = request_one(router, gateway_port, request).await?;
        match response.result {
            protocol::ResultCode::Success | protocol::ResultCode::NoResources => Ok(()),
            other => Err(Error::Protocol { code: other as u16 }),
        }
    })
    .await?;
    debug!("PCP mapping for {} released via {gateway}", mapping.internal_port);
    Ok(())
}

/// Checks for PCP support by mapping the reserved probe port for a couple
/// of minutes. The probe mapping is left to expire at the router.
pub(crate) async fn probe_available(
    waves: &Waves,
    lan_ips: &[Ipv4Addr],
    gateway_port: u16,
    transport: Transport,
) -> bool {
    let probe_port = NonZeroU16::new(PCP_PROBE_PORT).expect("probe port is non-zero");
    match map(
        waves,
        lan_ips,
        gateway_port,
        transport,
        probe_port,
        PCP_PROBE_PORT,
        PROBE_LIFETIME_SECONDS,
    )
    .await
    {
        Ok(mapping) => {
            trace!("PCP probe succeeded via {}", mapping.gateway);
            true
        }
        Err(e) => {
            debug!("PCP probe failed: {e}");
            false
        }
    }
}
