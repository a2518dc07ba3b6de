//! UPnP IGD client: SSDP discovery, device description fetch and SOAP
//! control of a WANIPConnection service.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::num::NonZeroU16;

use tokio::net::UdpSocket;
use tokio::time::Instant;
use tracing::{debug, trace};
use url::Url;

use crate::defaults::{PROBE_LIFETIME_SECONDS, SSDP_COLLECT_WINDOW, UPNP_PROBE_PORT};
use crate::lan::closest_local_ip;
use crate::{Error, Transport};

/// The service this client drives.
pub(crate) const SERVICE_TYPE: &str = "urn:schemas-upnp-org:service:WANIPConnection:1";

/// Description attached to mappings created through SOAP.
const MAPPING_DESCRIPTION: &str = "PortControl";

/// Largest SSDP reply datagram worth looking at.
const MAX_SSDP_REPLY_SIZE: usize = 2048;

/// A port mapping created on a WANIPConnection service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mapping {
    /// Control URL of the service that accepted the mapping.
    pub(crate) control_url: Url,
    /// Local address forwarded traffic is delivered to.
    pub(crate) local_ip: Ipv4Addr,
    pub(crate) internal_port: NonZeroU16,
    /// UPnP maps exactly the requested port or faults.
    pub(crate) external_port: NonZeroU16,
    /// Lease duration as requested; 0 means static at the router.
    pub(crate) lifetime_seconds: u32,
    pub(crate) transport: Transport,
}

/// One row of the gateway's mapping table, from
/// `GetGenericPortMappingEntry`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PortMappingEntry {
    pub external_port: u16,
    pub transport: String,
    pub internal_port: u16,
    pub internal_client: String,
    pub enabled: bool,
    pub description: String,
    pub lease_seconds: u32,
}

/// Sends an M-SEARCH for WANIPConnection devices and collects the unicast
/// replies arriving within the collection window, returning the LOCATION
/// URLs in arrival order, deduplicated.
async fn search_locations(ssdp_addr: SocketAddrV4) -> Result<Vec<String>, Error> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
        .await
        .map_err(|e| {
            trace!("ssdp bind failed: {e}");
            Error::NoRouterResponse
        })?;

    let search = format!(
        "M-SEARCH * HTTP/1.1\r\n\
         HOST: {ssdp_addr}\r\n\
         MAN: \"ssdp:discover\"\r\n\
         MX: 2\r\n\
         ST: {SERVICE_TYPE}\r\n\
         \r\n"
    );
    socket
        .send_to(search.as_bytes(), ssdp_addr)
        .await
        .map_err(|e| {
            trace!("ssdp send failed: {e}");
            Error::NoRouterResponse
        })?;

    let mut locations = Vec::new();
    let mut buf = vec![0u8; MAX_SSDP_REPLY_SIZE];
    let deadline = Instant::now() + SSDP_COLLECT_WINDOW;
    loop {
        let reply = tokio::time::timeout_at(deadline, socket.recv_from(&mut buf)).await;
        match reply {
            Err(_) => break, // window closed
            Ok(Err(e)) => {
                trace!("ssdp recv failed: {e}");
                break;
            }
            Ok(Ok((read, from))) => {
                let reply = String::from_utf8_lossy(&buf[..read]);
                if let Some(location) = parse_location(&reply) {
                    trace!("ssdp reply from {from}: {location}");
                    if !locations.contains(&location) {
                        locations.push(location);
                    }
                }
            }
        }
    }
    Ok(locations)
}

/// Extracts the `LOCATION:` header from an SSDP reply.
fn parse_location(reply: &str) -> Option<String> {
    let line = reply
        .lines()
        .find(|line| line.to_ascii_lowercase().starts_with("location:"))?;
    let location = line["location:".len()..].trim();
    (!location.is_empty()).then(|| location.to_string())
}

/// Returns the text inside the first `<tag>...</tag>` pair.
fn tag_text<'a>(xml: &'a str, tag: &str) -> Option<&'a str> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = xml.find(&open)? + open.len();
    let end = xml[start..].find(&close)? + start;
    Some(xml[start..end].trim())
}

/// Finds the `<controlURL>` of the WANIPConnection service inside a device
/// description, resolved against the description's own URL.
fn control_url_from_description(location: &Url, xml: &str) -> Option<Url> {
    let service_pos = xml.find(SERVICE_TYPE)?;
    let block = &xml[service_pos..];
    let block = &block[..block.find("</service>").unwrap_or(block.len())];
    let control_path = tag_text(block, "controlURL")?;
    location.join(control_path).ok()
}

/// Fetches each LOCATION's device description and returns the first
/// WANIPConnection control URL that parses cleanly.
async fn fetch_control_url(
    http: &reqwest::Client,
    locations: &[String],
) -> Result<Url, Error> {
    for location in locations {
        let Ok(base) = Url::parse(location) else {
            debug!("discarding unparseable LOCATION {location}");
            continue;
        };
        let body = match http.get(base.clone()).send().await {
            Ok(response) => match response.text().await {
                Ok(body) => body,
                Err(e) => {
                    debug!("device description read from {location} failed: {e}");
                    continue;
                }
            },
            Err(e) => {
                debug!("device description fetch from {location} failed: {e}");
                continue;
            }
        };
        if let Some(control_url) = control_url_from_description(&base, &body) {
            debug!("WANIPConnection control URL: {control_url}");
            return Ok(control_url);
        }
    }
    Err(Error::NoRouterResponse)
}

/// Runs SSDP discovery and returns the control URL of the first usable
/// WANIPConnection service.
pub(crate) async fn discover(
    ssdp_addr: SocketAddrV4,
    http: &reqwest::Client,
) -> Result<Url, Error> {
    let locations = search_locations(ssdp_addr).await?;
    if locations.is_empty() {
        return Err(Error::NoRouterResponse);
    }
    fetch_control_url(http, &locations).await
}

/// Issues one SOAP action against a control URL and returns the response
/// body. Faults surface as [`Error::UpnpSoapFault`] with the router's own
/// description when it provides one.
async fn soap_request(
    http: &reqwest::Client,
    control_url: &Url,
    action: &str,
    arguments: &str,
) -> Result<String, Error> {
    let body = format!(
        r#"<?xml version="1.0"?>
<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/" s:encodingStyle="http://schemas.xmlsoap.org/soap/encoding/">
<s:Body>
<u:{action} xmlns:u="{SERVICE_TYPE}">
{arguments}
</u:{action}>
</s:Body>
</s:Envelope>"#
    );

    let response = http
        .post(control_url.clone())
        .header("Content-Type", "text/xml")
        .header("SOAPAction", format!("\"{SERVICE_TYPE}#{action}\""))
        .body(body)
        .send()
        .await
        .map_err(|e| {
            debug!("soap {action} against {control_url} failed: {e}");
            Error::NoRouterResponse
        })?;

    let status = response.status();
    let body = response.text().await.map_err(|e| {
        debug!("soap {action} response read failed: {e}");
        Error::NoRouterResponse
    })?;

    if let Some(fault) = fault_description(&body) {
        return Err(Error::UpnpSoapFault { description: fault });
    }
    if !status.is_success() {
        return Err(Error::UpnpSoapFault {
            description: format!("HTTP {status}"),
        });
    }
    Ok(body)
}

/// Pulls a human-readable description out of a SOAP fault body.
fn fault_description(body: &str) -> Option<String> {
    if !body.contains("Fault>") && !body.contains("fault>") {
        return None;
    }
    let description = tag_text(body, "errorDescription")
        .or_else(|| tag_text(body, "faultstring"))
        .unwrap_or("unspecified SOAP fault");
    Some(description.to_string())
}

/// SOAP `AddPortMapping`.
pub(crate) async fn add_port_mapping(
    http: &reqwest::Client,
    control_url: &Url,
    local_ip: Ipv4Addr,
    internal_port: NonZeroU16,
    external_port: NonZeroU16,
    lifetime_seconds: u32,
    transport: Transport,
) -> Result<(), Error> {
    let arguments = format!(
        "<NewRemoteHost></NewRemoteHost>\n\
         <NewExternalPort>{external_port}</NewExternalPort>\n\
         <NewProtocol>{transport}</NewProtocol>\n\
         <NewInternalPort>{internal_port}</NewInternalPort>\n\
         <NewInternalClient>{local_ip}</NewInternalClient>\n\
         <NewEnabled>1</NewEnabled>\n\
         <NewPortMappingDescription>{MAPPING_DESCRIPTION}</NewPortMappingDescription>\n\
         <NewLeaseDuration>{lifetime_seconds}</NewLeaseDuration>"
    );
    soap_request(http, control_url, "AddPortMapping", &arguments)
        .await
        .map(|_| ())
}

/// SOAP `DeletePortMapping`.
pub(crate) async fn delete_port_mapping(
    http: &reqwest::Client,
    control_url: &Url,
    external_port: NonZeroU16,
    transport: Transport,
) -> Result<(), Error> {
    let arguments = format!(
        "<NewRemoteHost></NewRemoteHost>\n\
         <NewExternalPort>{external_port}</NewExternalPort>\n\
         <NewProtocol>{transport}</NewProtocol>"
    );
    soap_request(http, control_url, "DeletePortMapping", &arguments)
        .await
        .map(|_| ())
}

/// SOAP `GetGenericPortMappingEntry`: reads one row of the gateway's
/// mapping table by index.
pub(crate) async fn get_generic_port_mapping_entry(
    http: &reqwest::Client,
    control_url: &Url,
    index: u32,
) -> Result<PortMappingEntry, Error> {
    let arguments = format!("<NewPortMappingIndex>{index}</NewPortMappingIndex>");
    let body = soap_request(http, control_url, "GetGenericPortMappingEntry", &arguments).await?;

    let number = |tag: &str| -> u32 {
        tag_text(&body, tag)
            .and_then(|text| text.parse().ok())
            .unwrap_or_default()
    };
    Ok(PortMappingEntry {
        external_port: number("NewExternalPort") as u16,
        transport: tag_text(&body, "NewProtocol").unwrap_or_default().to_string(),
        internal_port: number("NewInternalPort") as u16,
        internal_client: tag_text(&body, "NewInternalClient")
            .unwrap_or_default()
            .to_string(),
        enabled: number("NewEnabled") == 1,
        description: tag_text(&body, "NewPortMappingDescription")
            .unwrap_or_default()
            .to_string(),
        lease_seconds: number("NewLeaseDuration"),
    })
}

/// Creates a mapping, discovering a control URL first unless a cached one
/// is supplied.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn map(
    ssdp_addr: SocketAddrV4,
    http: &reqwest::Client,
    cached_control_url: Option<Url>,
    lan_ips: &[Ipv4Addr],
    internal_port: NonZeroU16,
    external_port: NonZeroU16,
    lifetime_seconds: u32,
    transport: Transport,
) -> Result<Mapping, Error> {
    let control_url = match cached_control_url {
        Some(url) => url,
        None => discover(ssdp_addr, http).await?,
    };
    let local_ip = local_ip_for(&control_url, lan_ips)?;

    add_port_mapping(
        http,
        &control_url,
        local_ip,
        internal_port,
        external_port,
        lifetime_seconds,
        transport,
    )
    .await?;

    debug!("UPnP mapping {local_ip}:{internal_port} -> {external_port} via {control_url}");
    Ok(Mapping {
        control_url,
        local_ip,
        internal_port,
        external_port,
        lifetime_seconds,
        transport,
    })
}

/// Picks the local address the gateway can reach us on, judged against the
/// control URL's host.
fn local_ip_for(control_url: &Url, lan_ips: &[Ipv4Addr]) -> Result<Ipv4Addr, Error> {
    let gateway_ip = control_url
        .host_str()
        .and_then(|host| host.parse::<Ipv4Addr>().ok());
    match gateway_ip {
        Some(gateway_ip) => closest_local_ip(lan_ips, gateway_ip).ok_or(Error::NoLocalIp),
        None => lan_ips.first().copied().ok_or(Error::NoLocalIp),
    }
}

/// Checks for UPnP support: a control URL must be discoverable and an add
/// on the reserved probe port must come back without a fault. Returns the
/// discovered control URL for the support cache.
pub(crate) async fn probe_available(
    ssdp_addr: SocketAddrV4,
    http: &reqwest::Client,
    lan_ips: &[Ipv4Addr],
    transport: Transport,
) -> (bool, Option<Url>) {
    let probe_port = NonZeroU16::new(UPNP_PROBE_PORT).expect("probe port is non-zero");
    match map(
        ssdp_addr,
        http,
        None,
        lan_ips,
        probe_port,
        probe_port,
        PROBE_LIFETIME_SECONDS,
        transport,
    )
    .await
    {
        Ok(mapping) => {
            trace!("UPnP probe succeeded via {}", mapping.control_url);
            (true, Some(mapping.control_url))
        }
        Err(e) => {
            debug!("UPnP probe failed: {e}");
            (false, None)
        }
    }
}
