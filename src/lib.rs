//! Port mapping client and service.
//!
//! Opens and maintains inbound port forwardings on a residential NAT
//! gateway from behind the NAT, without manual router configuration. Three
//! wire protocols are spoken behind one protocol-agnostic API: NAT-PMP
//! (RFC 6886), PCP (RFC 6887) and UPnP IGD WANIPConnection. For every
//! mapping the router-granted lifetime is tracked and the mapping is
//! refreshed before it expires, so the hole stays open for as long as the
//! application wants it.
//!
//! [`Client::add_mapping`] tries the protocols in turn (NAT-PMP, then PCP,
//! then UPnP) and registers the first grant. Routers are found by fanning
//! out to a list of popular gateway defaults, best candidates first; a
//! router that answered once is remembered and tried first from then on.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::num::NonZeroU16;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use futures_lite::StreamExt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tracing::{debug, info_span, trace, warn, Instrument};
use url::Url;

pub mod defaults;
pub mod lan;

mod candidates;
mod mapping;
mod nat_pmp;
mod pcp;
mod registry;
mod upnp;
mod util;
mod wire;

pub use lan::{longest_prefix_match, LanDiscovery, StaticLan, SystemLan};
pub use mapping::{Mapping, Protocol};

use defaults::{
    GATEWAY_PORT, LAN_DISCOVERY_TIMEOUT, PROBE_PORTS, RECV_TIMEOUT, ROUTER_IPS, SSDP_ADDR,
};
use mapping::ReleaseContext;
use registry::Registry;

/// Capacity of the channel to communicate with the long-running service.
const SERVICE_CHANNEL_CAPACITY: usize = 32; // should be plenty

/// Errors surfaced by the port mapping service.
///
/// Failures inside a discovery wave or the protocol fallback chain are
/// demoted to log lines; only the aggregate outcome of an operation is
/// reported here.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// LAN address enumeration produced nothing within its deadline.
    #[error("no LAN-routable IPv4 address found")]
    NoLocalIp,
    /// Every candidate router in both waves stayed silent.
    #[error("no router answered")]
    NoRouterResponse,
    /// A router answered with a non-success result code.
    #[error("router rejected the request with code {code}")]
    Protocol { code: u16 },
    /// The WANIPConnection service replied with a SOAP fault.
    #[error("SOAP fault: {description}")]
    UpnpSoapFault { description: String },
    /// Every protocol in the fallback chain failed.
    #[error("no port mapping protocol succeeded{}", .reason.as_deref().map(|r| format!(": {r}")).unwrap_or_default())]
    AllProtocolsFailed { reason: Option<String> },
    /// The requested port is reserved for support probes.
    #[error("port {port} is reserved for support probes")]
    ProbePortReserved { port: u16 },
    /// The service has been closed.
    #[error("the port mapping service is closed")]
    Closed,
}

/// Transport a mapping forwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, derive_more::Display)]
pub enum Transport {
    #[display("TCP")]
    #[default]
    Tcp,
    #[display("UDP")]
    Udp,
}

/// Output of a port mapping probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
#[display("portmap={{ PMP: {nat_pmp}, PCP: {pcp}, UPnP: {upnp} }}")]
pub struct ProbeOutput {
    /// If NAT-PMP can be considered available.
    pub nat_pmp: bool,
    /// If PCP can be considered available.
    pub pcp: bool,
    /// If UPnP can be considered available.
    pub upnp: bool,
}

impl ProbeOutput {
    /// Indicates if no port mapping protocol is available.
    pub fn none_available(&self) -> bool {
        !(self.nat_pmp || self.pcp || self.upnp)
    }
}

/// What the service knows about the gateway's protocol support.
///
/// `None` means the protocol has never been probed; a probe settles all
/// three flags at once.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProtocolSupport {
    pub nat_pmp: Option<bool>,
    pub pcp: Option<bool>,
    pub upnp: Option<bool>,
    /// Control URL of the WANIPConnection service, once one was found.
    pub upnp_control_url: Option<Url>,
}

impl ProtocolSupport {
    /// A completed probe found no working protocol.
    fn known_unsupported(&self) -> bool {
        self.nat_pmp == Some(false) && self.pcp == Some(false) && self.upnp == Some(false)
    }
}

/// Configures the service: which protocols to try, which transport to map,
/// and where to look for gateways.
///
/// The endpoint fields exist so tests can point the service at fake
/// routers on loopback.
#[derive(Debug, Clone)]
pub struct Config {
    /// Whether UPnP is enabled.
    pub enable_upnp: bool,
    /// Whether PCP is enabled.
    pub enable_pcp: bool,
    /// Whether PMP is enabled.
    pub enable_nat_pmp: bool,
    /// Transport requested for mappings.
    pub transport: Transport,
    /// Gateway candidates used by the discovery waves.
    pub router_ips: Vec<Ipv4Addr>,
    /// UDP port NAT-PMP and PCP requests are sent to.
    pub gateway_port: u16,
    /// Address SSDP searches are sent to.
    pub ssdp_addr: std::net::SocketAddrV4,
    /// LAN address enumeration capability.
    pub lan: Arc<dyn LanDiscovery>,
}

impl Default for Config {
    /// All protocols enabled, TCP mappings, the stock gateway endpoints
    /// and the host's own network interfaces.
    fn default() -> Self {
        Config {
            enable_upnp: true,
            enable_pcp: true,
            enable_nat_pmp: true,
            transport: Transport::default(),
            router_ips: ROUTER_IPS.to_vec(),
            gateway_port: GATEWAY_PORT,
            ssdp_addr: SSDP_ADDR,
            lan: Arc::new(SystemLan),
        }
    }
}

#[derive(derive_more::Debug)]
enum Message {
    /// Request to map `external_port` to `internal_port` for
    /// `lifetime_seconds` (0 = static).
    AddMapping {
        internal_port: NonZeroU16,
        external_port: NonZeroU16,
        lifetime_seconds: u32,
        #[debug("_")]
        result_tx: oneshot::Sender<Result<Mapping, Error>>,
    },
    /// Request to delete the mapping registered for `external_port`.
    DeleteMapping {
        external_port: u16,
        #[debug("_")]
        result_tx: oneshot::Sender<bool>,
    },
    /// Request to probe the port mapping protocols.
    Probe {
        #[debug("_")]
        result_tx: oneshot::Sender<Result<ProbeOutput, Error>>,
    },
    /// Request for the gateway's external address over NAT-PMP.
    ExternalAddress {
        #[debug("_")]
        result_tx: oneshot::Sender<Result<Ipv4Addr, Error>>,
    },
    /// Request for a snapshot of the active mappings.
    ActiveMappings {
        #[debug("_")]
        result_tx: oneshot::Sender<BTreeMap<u16, Mapping>>,
    },
    /// Request for the known-good router addresses.
    RouterCache {
        #[debug("_")]
        result_tx: oneshot::Sender<Vec<Ipv4Addr>>,
    },
    /// Request for the protocol support cache.
    SupportCache {
        #[debug("_")]
        result_tx: oneshot::Sender<ProtocolSupport>,
    },
    /// Request for the host's LAN addresses.
    LanIps {
        #[debug("_")]
        result_tx: oneshot::Sender<Result<Vec<Ipv4Addr>, Error>>,
    },
    /// Release every registered mapping and stop the service.
    Close {
        #[debug("_")]
        result_tx: oneshot::Sender<()>,
    },
}

/// Port mapping client.
///
/// Cheap to clone; all clones talk to the same service. The service task
/// is aborted once the last clone is dropped.
#[derive(Debug, Clone)]
pub struct Client {
    /// Channel used to communicate with the port mapping service.
    service_tx: mpsc::Sender<Message>,
    /// A handle to the service that will cancel the spawned task once the
    /// client is dropped.
    _service_handle: Arc<util::CancelOnDrop>,
}

impl Default for Client {
    /// Creates a client that uses the default configuration.
    ///
    /// See [`Config::default`]. Must be called within a tokio runtime.
    fn default() -> Self {
        Self::new(Config::default())
    }
}

impl Client {
    /// Create a new port mapping client, spawning its service.
    pub fn new(config: Config) -> Self {
        let (service_tx, service_rx) = mpsc::channel(SERVICE_CHANNEL_CAPACITY);

        let service = Service::new(config, service_rx);

        let handle = util::CancelOnDrop::new(
            "portcontrol_service",
            tokio::spawn(
                async move { service.run().await }.instrument(info_span!("portcontrol.service")),
            )
            .abort_handle(),
        );

        Client {
            service_tx,
            _service_handle: Arc::new(handle),
        }
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Message,
    ) -> Result<T, Error> {
        let (result_tx, result_rx) = oneshot::channel();
        self.service_tx
            .send(make(result_tx))
            .await
            .map_err(|_| Error::Closed)?;
        result_rx.await.map_err(|_| Error::Closed)
    }

    /// Maps `external_port` on the gateway to `internal_port` on this host
    /// for `lifetime_seconds`.
    ///
    /// A lifetime of 0 asks for a static mapping, which is still refreshed
    /// on a 24 h cadence. The granted external port and lifetime in the
    /// returned [`Mapping`] are authoritative and may differ from the
    /// request. The mapping is kept alive until [`Client::delete_mapping`]
    /// or [`Client::close`].
    pub async fn add_mapping(
        &self,
        internal_port: NonZeroU16,
        external_port: NonZeroU16,
        lifetime_seconds: u32,
    ) -> Result<Mapping, Error> {
        self.request(|result_tx| Message::AddMapping {
            internal_port,
            external_port,
            lifetime_seconds,
            result_tx,
        })
        .await?
    }

    /// Deletes the mapping registered for `external_port`.
    ///
    /// Returns `false` when no such mapping is registered or the router
    /// refused the deletion.
    pub async fn delete_mapping(&self, external_port: u16) -> bool {
        self.request(|result_tx| Message::DeleteMapping {
            external_port,
            result_tx,
        })
        .await
        .unwrap_or(false)
    }

    /// Probes gateway support for all three protocols, updating the
    /// support cache.
    ///
    /// Concurrent probe requests are answered by the probe already
    /// underway.
    pub async fn probe(&self) -> Result<ProbeOutput, Error> {
        self.request(|result_tx| Message::Probe { result_tx }).await?
    }

    /// Queries the gateway's external address over NAT-PMP.
    pub async fn external_address(&self) -> Result<Ipv4Addr, Error> {
        self.request(|result_tx| Message::ExternalAddress { result_tx })
            .await?
    }

    /// Snapshot of the registered mappings, keyed by external port.
    pub async fn active_mappings(&self) -> BTreeMap<u16, Mapping> {
        self.request(|result_tx| Message::ActiveMappings { result_tx })
            .await
            .unwrap_or_default()
    }

    /// Routers that granted a mapping at some point, most senior first.
    pub async fn router_cache(&self) -> Vec<Ipv4Addr> {
        self.request(|result_tx| Message::RouterCache { result_tx })
            .await
            .unwrap_or_default()
    }

    /// What the service currently knows about protocol support.
    pub async fn support_cache(&self) -> ProtocolSupport {
        self.request(|result_tx| Message::SupportCache { result_tx })
            .await
            .unwrap_or_default()
    }

    /// The host's LAN-routable IPv4 addresses.
    pub async fn lan_ips(&self) -> Result<Vec<Ipv4Addr>, Error> {
        self.request(|result_tx| Message::LanIps { result_tx }).await?
    }

    /// Releases every registered mapping and stops the service.
    ///
    /// Individual deletion failures are logged, not reported; the service
    /// is gone either way and subsequent calls return [`Error::Closed`].
    pub async fn close(&self) {
        let _ = self.request(|result_tx| Message::Close { result_tx }).await;
    }
}

/// Where an add attempt originated, deciding who hears about the outcome.
#[derive(derive_more::Debug)]
enum AddOrigin {
    /// A caller waiting on the result.
    Request {
        #[debug("_")]
        result_tx: oneshot::Sender<Result<Mapping, Error>>,
    },
    /// A refresh timer re-acquiring an expiring mapping.
    Refresh,
}

/// Successful outcome of one add attempt.
#[derive(Debug)]
struct AddSuccess {
    mapping: Mapping,
    /// Router that granted the mapping, for the known-good cache.
    router_ip: Option<Ipv4Addr>,
    /// Control URL used, for the support cache.
    control_url: Option<Url>,
}

/// Outcome of one add task, routed back into the service loop.
#[derive(derive_more::Debug)]
struct AddOutcome {
    origin: AddOrigin,
    requested_lifetime: u32,
    result: Result<AddSuccess, Error>,
}

type ProbeTaskResult = Result<(ProbeOutput, Option<Url>), Error>;

/// The long-running port mapping service.
///
/// Owns the registry and both caches; nothing else mutates them.
#[derive(derive_more::Debug)]
struct Service {
    config: Config,
    /// Channel over which the service is informed of messages.
    ///
    /// The service stops when all senders are gone.
    rx: mpsc::Receiver<Message>,
    /// Active mappings and their refresh/expiry timers.
    registry: Registry,
    /// Routers that granted a mapping, in first-success order. Never
    /// evicted.
    router_cache: Vec<Ipv4Addr>,
    /// Tri-state protocol support, settled by probes.
    support: ProtocolSupport,
    /// HTTP client shared by every UPnP exchange.
    #[debug("_")]
    http: reqwest::Client,
    /// In-flight add attempts. Distinct external ports proceed
    /// independently.
    #[debug("_")]
    add_tasks: JoinSet<AddOutcome>,
    /// Task probing the protocols.
    ///
    /// Requests for a probe that arrive while this task is still in
    /// progress will receive the same result.
    #[debug("_")]
    probing_task: Option<(
        util::AbortingJoinHandle<ProbeTaskResult>,
        Vec<oneshot::Sender<Result<ProbeOutput, Error>>>,
    )>,
}

impl Service {
    fn new(config: Config, rx: mpsc::Receiver<Message>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(RECV_TIMEOUT)
            .build()
            .expect("HTTP client construction only fails on broken TLS backends");
        Service {
            config,
            rx,
            registry: Registry::new(),
            router_cache: Vec::new(),
            support: ProtocolSupport::default(),
            http,
            add_tasks: JoinSet::new(),
            probing_task: None,
        }
    }

    async fn run(mut self) -> Result<()> {
        debug!("portcontrol starting");
        loop {
            tokio::select! {
                msg = self.rx.recv() => {
                    trace!("tick: msg {msg:?}");
                    match msg {
                        Some(Message::Close { result_tx }) => {
                            self.close().await;
                            let _ = result_tx.send(());
                            break;
                        }
                        Some(msg) => {
                            self.handle_msg(msg).await;
                        },
                        None => {
                            debug!("portcontrol service channel dropped. Likely shutting down.");
                            break;
                        }
                    }
                }
                Some(add_result) = self.add_tasks.join_next(), if !self.add_tasks.is_empty() => {
                    trace!("tick: add task ready");
                    match add_result {
                        Ok(outcome) => self.on_add_outcome(outcome),
                        Err(join_err) => debug!("add task failed to produce a result: {join_err}"),
                    }
                }
                probe_result = util::MaybeFuture{ inner: self.probing_task.as_mut().map(|(fut, _rec)| fut) } => {
                    trace!("tick: probe ready");
                    // retrieve the receivers and clear the task
                    let receivers = self.probing_task.take().expect("is some").1;
                    let probe_result = probe_result
                        .map_err(|join_err| anyhow!("failed to obtain a probe result {join_err}"));
                    self.on_probe_result(probe_result, receivers);
                }
                Some(event) = self.registry.next() => {
                    trace!("tick: registry event {event:?}");
                    self.on_registry_event(event);
                }
            }
        }
        debug!("portcontrol shutting down");
        Ok(())
    }

    async fn handle_msg(&mut self, msg: Message) {
        match msg {
            Message::AddMapping {
                internal_port,
                external_port,
                lifetime_seconds,
                result_tx,
            } => {
                self.add_mapping(
                    internal_port,
                    external_port,
                    lifetime_seconds,
                    AddOrigin::Request { result_tx },
                );
            }
            Message::DeleteMapping {
                external_port,
                result_tx,
            } => {
                let deleted = self.delete_mapping(external_port).await;
                let _ = result_tx.send(deleted);
            }
            Message::Probe { result_tx } => self.probe_request(result_tx),
            Message::ExternalAddress { result_tx } => {
                let result = self.external_address().await;
                let _ = result_tx.send(result);
            }
            Message::ActiveMappings { result_tx } => {
                let _ = result_tx.send(self.registry.snapshot());
            }
            Message::RouterCache { result_tx } => {
                let _ = result_tx.send(self.router_cache.clone());
            }
            Message::SupportCache { result_tx } => {
                let _ = result_tx.send(self.support.clone());
            }
            Message::LanIps { result_tx } => {
                let _ = result_tx.send(lan_ips(&self.config.lan).await);
            }
            Message::Close { .. } => unreachable!("close is intercepted by the run loop"),
        }
    }

    /// Starts an add attempt in its own task. Attempts for distinct
    /// external ports proceed independently; the protocol fallback within
    /// one attempt is strictly sequential.
    fn add_mapping(
        &mut self,
        internal_port: NonZeroU16,
        external_port: NonZeroU16,
        lifetime_seconds: u32,
        origin: AddOrigin,
    ) {
        if let Some(port) = [internal_port.get(), external_port.get()]
            .into_iter()
            .find(|port| PROBE_PORTS.contains(port))
        {
            if let AddOrigin::Request { result_tx } = origin {
                let _ = result_tx.send(Err(Error::ProbePortReserved { port }));
            }
            return;
        }

        if self.support.known_unsupported() {
            if let AddOrigin::Request { result_tx } = origin {
                let _ = result_tx.send(Err(Error::AllProtocolsFailed {
                    reason: Some("No protocols are supported from last probe".into()),
                }));
            }
            return;
        }

        let config = self.config.clone();
        let router_cache = self.router_cache.clone();
        let support = self.support.clone();
        let http = self.http.clone();
        self.add_tasks.spawn(
            async move {
                let result = procure_mapping(
                    &config,
                    &router_cache,
                    &support,
                    &http,
                    internal_port,
                    external_port,
                    lifetime_seconds,
                )
                .await;
                AddOutcome {
                    origin,
                    requested_lifetime: lifetime_seconds,
                    result,
                }
            }
            .instrument(info_span!("portcontrol.add")),
        );
    }

    /// Registers a granted mapping, arms its timer and remembers the
    /// responding router.
    fn on_add_outcome(&mut self, outcome: AddOutcome) {
        let AddOutcome {
            origin,
            requested_lifetime,
            result,
        } = outcome;
        let result = match result {
            Ok(AddSuccess {
                mapping,
                router_ip,
                control_url,
            }) => {
                if let Some(router_ip) = router_ip {
                    if !self.router_cache.contains(&router_ip) {
                        debug!("router {router_ip} added to the known-good cache");
                        self.router_cache.push(router_ip);
                    }
                }
                if control_url.is_some() {
                    self.support.upnp_control_url = control_url;
                }
                self.registry.insert(mapping.clone(), requested_lifetime);
                Ok(mapping)
            }
            Err(e) => Err(e),
        };
        match origin {
            AddOrigin::Request { result_tx } => {
                // the requester may be gone; the mapping stays registered
                let _ = result_tx.send(result);
            }
            AddOrigin::Refresh => {
                if let Err(e) = result {
                    warn!("failed to refresh a mapping, the hole is closed: {e}");
                }
            }
        }
    }

    /// Releases and forgets the mapping registered for `external_port`.
    /// The entry stays registered (timer armed) when the router refuses.
    async fn delete_mapping(&mut self, external_port: u16) -> bool {
        let Some(mapping) = self.registry.get(external_port).cloned() else {
            return false;
        };
        match self.release(&mapping).await {
            Ok(()) => {
                self.registry.remove(external_port);
                true
            }
            Err(e) => {
                debug!("failed to delete mapping for port {external_port}: {e}");
                false
            }
        }
    }

    async fn release(&self, mapping: &Mapping) -> Result<(), Error> {
        let lan_ips = lan_ips(&self.config.lan).await.unwrap_or_default();
        let waves = candidates::waves(&self.router_cache, &lan_ips, &self.config.router_ips);
        let ctx = ReleaseContext {
            waves: &waves,
            gateway_port: self.config.gateway_port,
            http: &self.http,
        };
        mapping.release(&ctx).await
    }

    async fn external_address(&self) -> Result<Ipv4Addr, Error> {
        let lan_ips = lan_ips(&self.config.lan).await?;
        let waves = candidates::waves(&self.router_cache, &lan_ips, &self.config.router_ips);
        nat_pmp::external_address(&waves, self.config.gateway_port)
            .await
            .map(|(_router, external_ip)| external_ip)
    }

    /// Handles a probe request.
    ///
    /// If there is a task getting a probe, the receiver will be added with
    /// any other waiting for a result. Otherwise a new probe task is
    /// started.
    fn probe_request(&mut self, result_tx: oneshot::Sender<Result<ProbeOutput, Error>>) {
        match self.probing_task.as_mut() {
            Some((_task_handle, receivers)) => receivers.push(result_tx),
            None => {
                let config = self.config.clone();
                let router_cache = self.router_cache.clone();
                let http = self.http.clone();
                let handle = tokio::spawn(
                    async move { run_probe(config, router_cache, http).await }
                        .instrument(info_span!("portcontrol.probe")),
                );
                self.probing_task = Some((handle.into(), vec![result_tx]));
            }
        }
    }

    fn on_probe_result(
        &mut self,
        result: Result<ProbeTaskResult>,
        receivers: Vec<oneshot::Sender<Result<ProbeOutput, Error>>>,
    ) {
        let result = match result {
            Err(e) => {
                debug!("probe task died: {e}");
                Err(Error::NoRouterResponse)
            }
            Ok(Err(e)) => Err(e),
            Ok(Ok((output, control_url))) => {
                debug!("probe output {output}");
                self.support.nat_pmp = Some(output.nat_pmp);
                self.support.pcp = Some(output.pcp);
                self.support.upnp = Some(output.upnp);
                if control_url.is_some() {
                    self.support.upnp_control_url = control_url;
                }
                Ok(output)
            }
        };
        for tx in receivers {
            // ignore the error. If the receiver is no longer there we don't really care
            let _ = tx.send(result.clone());
        }
    }

    fn on_registry_event(&mut self, event: registry::Event) {
        match event {
            registry::Event::Refresh {
                external_port,
                internal_port,
                lifetime_seconds,
            } => {
                debug!("refreshing mapping for port {external_port}");
                self.add_mapping(
                    internal_port,
                    external_port,
                    lifetime_seconds,
                    AddOrigin::Refresh,
                );
            }
            registry::Event::Expired { external_port } => {
                debug!("mapping for port {external_port} reached its granted lifetime");
            }
        }
    }

    /// Releases every registered mapping in parallel. Individual failures
    /// do not abort the others.
    async fn close(&mut self) {
        let mappings = self.registry.drain();
        if mappings.is_empty() {
            return;
        }
        debug!("releasing {} mappings", mappings.len());
        let lan_ips = lan_ips(&self.config.lan).await.unwrap_or_default();
        let waves = candidates::waves(&self.router_cache, &lan_ips, &self.config.router_ips);
        let ctx = ReleaseContext {
            waves: &waves,
            gateway_port: self.config.gateway_port,
            http: &self.http,
        };
        let releases = mappings.iter().map(|mapping| {
            let ctx = &ctx;
            async move {
                if let Err(e) = mapping.release(ctx).await {
                    debug!("failed to release {mapping}: {e}");
                }
            }
        });
        futures_util::future::join_all(releases).await;
    }
}

/// Enumerates LAN addresses under the discovery deadline.
async fn lan_ips(lan: &Arc<dyn LanDiscovery>) -> Result<Vec<Ipv4Addr>, Error> {
    match tokio::time::timeout(LAN_DISCOVERY_TIMEOUT, lan.lan_ipv4s()).await {
        Ok(Ok(ips)) if !ips.is_empty() => Ok(ips),
        Ok(Ok(_)) => Err(Error::NoLocalIp),
        Ok(Err(e)) => {
            debug!("LAN discovery failed: {e}");
            Err(Error::NoLocalIp)
        }
        Err(_) => {
            debug!("LAN discovery timed out");
            Err(Error::NoLocalIp)
        }
    }
}

/// One full add attempt: LAN discovery, candidate waves, then the
/// protocol fallback chain. Strictly sequential; the next protocol is
/// only tried after the previous one resolved.
async fn procure_mapping(
    config: &Config,
    router_cache: &[Ipv4Addr],
    support: &ProtocolSupport,
    http: &reqwest::Client,
    internal_port: NonZeroU16,
    external_port: NonZeroU16,
    lifetime_seconds: u32,
) -> Result<AddSuccess, Error> {
    let lan_ips = lan_ips(&config.lan).await?;
    let waves = candidates::waves(router_cache, &lan_ips, &config.router_ips);
    debug!(
        "mapping {external_port} -> {internal_port} for {lifetime_seconds}s, candidates {:?} then {:?}",
        waves.matched, waves.other
    );

    let mut last_error: Option<Error> = None;
    let mut fault: Option<String> = None;

    if config.enable_nat_pmp && support.nat_pmp != Some(false) {
        match nat_pmp::map(
            &waves,
            &lan_ips,
            config.gateway_port,
            config.transport,
            internal_port,
            external_port.get(),
            lifetime_seconds,
        )
        .await
        {
            Ok(mapping) => {
                let router_ip = Some(mapping.gateway);
                return Ok(AddSuccess {
                    mapping: Mapping::NatPmp(mapping),
                    router_ip,
                    control_url: None,
                });
            }
            Err(e) => {
                debug!("NAT-PMP attempt failed: {e}");
                last_error = Some(e);
            }
        }
    }

    if config.enable_pcp && support.pcp != Some(false) {
        match pcp::map(
            &waves,
            &lan_ips,
            config.gateway_port,
            config.transport,
            internal_port,
            external_port.get(),
            lifetime_seconds,
        )
        .await
        {
            Ok(mapping) => {
                let router_ip = Some(mapping.gateway);
                return Ok(AddSuccess {
                    mapping: Mapping::Pcp(mapping),
                    router_ip,
                    control_url: None,
                });
            }
            Err(e) => {
                debug!("PCP attempt failed: {e}");
                last_error = Some(e);
            }
        }
    }

    if config.enable_upnp && support.upnp != Some(false) {
        match upnp::map(
            config.ssdp_addr,
            http,
            support.upnp_control_url.clone(),
            &lan_ips,
            internal_port,
            external_port,
            lifetime_seconds,
            config.transport,
        )
        .await
        {
            Ok(mapping) => {
                let router_ip = mapping
                    .control_url
                    .host_str()
                    .and_then(|host| host.parse().ok());
                let control_url = Some(mapping.control_url.clone());
                return Ok(AddSuccess {
                    mapping: Mapping::Upnp(mapping),
                    router_ip,
                    control_url,
                });
            }
            Err(e) => {
                debug!("UPnP attempt failed: {e}");
                if let Error::UpnpSoapFault { ref description } = e {
                    fault = Some(description.clone());
                }
                last_error = Some(e);
            }
        }
    }

    Err(Error::AllProtocolsFailed {
        reason: fault.or_else(|| last_error.map(|e| e.to_string())),
    })
}

/// Probes all three protocols concurrently and reports which answered.
async fn run_probe(
    config: Config,
    router_cache: Vec<Ipv4Addr>,
    http: reqwest::Client,
) -> ProbeTaskResult {
    let lan_ips = lan_ips(&config.lan).await?;
    let waves = candidates::waves(&router_cache, &lan_ips, &config.router_ips);

    let nat_pmp_probe = async {
        config.enable_nat_pmp
            && nat_pmp::probe_available(
                &waves,
                &lan_ips,
                config.gateway_port,
                config.transport,
            )
            .await
    };
    let pcp_probe = async {
        config.enable_pcp
            && pcp::probe_available(&waves, &lan_ips, config.gateway_port, config.transport).await
    };
    let upnp_probe = async {
        if config.enable_upnp {
            upnp::probe_available(config.ssdp_addr, &http, &lan_ips, config.transport).await
        } else {
            (false, None)
        }
    };

    let (nat_pmp, pcp, (upnp, control_url)) =
        tokio::join!(nat_pmp_probe, pcp_probe, upnp_probe);

    Ok((ProbeOutput { nat_pmp, pcp, upnp }, control_url))
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddrV4;
    use std::sync::Mutex;
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream, UdpSocket};

    use super::*;
    use crate::wire::{self, Field};

    fn setup_logging() -> tracing::subscriber::DefaultGuard {
        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .finish();
        tracing::subscriber::set_default(subscriber)
    }

    fn nz(port: u16) -> NonZeroU16 {
        NonZeroU16::new(port).unwrap()
    }

    /// Everything pointed at loopback so fake gateways can answer.
    fn test_config(gateway_port: u16) -> Config {
        Config {
            router_ips: vec![Ipv4Addr::LOCALHOST],
            gateway_port,
            ssdp_addr: SocketAddrV4::new(Ipv4Addr::LOCALHOST, 1),
            lan: Arc::new(StaticLan(vec![Ipv4Addr::LOCALHOST])),
            ..Config::default()
        }
    }

    type RequestLog = Arc<Mutex<Vec<Vec<u8>>>>;

    /// A fake gateway on loopback UDP: `handler` turns each received
    /// datagram into an optional reply. Every request is recorded.
    async fn udp_gateway<F>(handler: F) -> (u16, RequestLog)
    where
        F: Fn(&[u8]) -> Option<Vec<u8>> + Send + 'static,
    {
        let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let port = socket.local_addr().unwrap().port();
        let log: RequestLog = Arc::new(Mutex::new(Vec::new()));
        let task_log = log.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            loop {
                let Ok((read, from)) = socket.recv_from(&mut buf).await else {
                    break;
                };
                let request = buf[..read].to_vec();
                task_log.lock().unwrap().push(request.clone());
                if let Some(reply) = handler(&request) {
                    let _ = socket.send_to(&reply, from).await;
                }
            }
        });
        (port, log)
    }

    /// NAT-PMP mapping response granting `external_port` for
    /// `lifetime_seconds`.
    fn pmp_grant(request: &[u8], external_port: u16, lifetime_seconds: u32) -> Vec<u8> {
        wire::build(
            16,
            &[
                Field::u8(1, 0x80 | request[1]),
                Field::u32(4, 1),
                Field::u16(8, wire::read_u16(request, 4)),
                Field::u16(10, external_port),
                Field::u32(12, lifetime_seconds),
            ],
        )
    }

    /// PCP MAP response echoing the request's nonce and internal port.
    fn pcp_grant(
        request: &[u8],
        result: u8,
        external_port: u16,
        lifetime_seconds: u32,
        external_ip: Ipv4Addr,
    ) -> Vec<u8> {
        let mut reply = wire::build(
            60,
            &[
                Field::u8(0, 2),
                Field::u8(1, 0x80 | 1),
                Field::u8(3, result),
                Field::u32(4, lifetime_seconds),
                Field::u32(8, 1),
                Field::u8(36, request[36]),
                Field::u16(40, wire::read_u16(request, 40)),
                Field::u16(42, external_port),
                Field::u16(54, 0xffff),
                Field::u32(56, external_ip.into()),
            ],
        );
        reply[24..36].copy_from_slice(&request[24..36]);
        reply
    }

    fn is_pmp_map(request: &[u8]) -> bool {
        request.len() == 12 && request[0] == 0
    }

    // ---- fake UPnP gateway: SSDP responder plus HTTP/SOAP endpoint ----

    async fn ssdp_responder(location: String) -> u16 {
        let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let port = socket.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            loop {
                let Ok((_, from)) = socket.recv_from(&mut buf).await else {
                    break;
                };
                let reply = format!(
                    "HTTP/1.1 200 OK\r\nST: {}\r\nLOCATION: {location}\r\n\r\n",
                    upnp::SERVICE_TYPE
                );
                let _ = socket.send_to(reply.as_bytes(), from).await;
            }
        });
        port
    }

    fn device_description() -> String {
        format!(
            r#"<?xml version="1.0"?>
<root xmlns="urn:schemas-upnp-org:device-1-0">
  <device>
    <serviceList>
      <service>
        <serviceType>{}</serviceType>
        <controlURL>/ctl</controlURL>
      </service>
    </serviceList>
  </device>
</root>"#,
            upnp::SERVICE_TYPE
        )
    }

    fn http_ok(body: &str) -> String {
        format!(
            "HTTP/1.1 200 OK\r\nContent-Type: text/xml\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        )
    }

    fn soap_ok(action: &str) -> String {
        format!(
            r#"<?xml version="1.0"?><s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/"><s:Body><u:{action}Response xmlns:u="{}"/></s:Body></s:Envelope>"#,
            upnp::SERVICE_TYPE
        )
    }

    fn soap_fault(description: &str) -> String {
        let body = format!(
            r#"<?xml version="1.0"?><s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/"><s:Body><s:Fault><faultcode>s:Client</faultcode><faultstring>UPnPError</faultstring><detail><UPnPError><errorCode>718</errorCode><errorDescription>{description}</errorDescription></UPnPError></detail></s:Fault></s:Body></s:Envelope>"#
        );
        format!(
            "HTTP/1.1 500 Internal Server Error\r\nContent-Type: text/xml\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        )
    }

    fn soap_mapping_entry() -> String {
        let fields = "<NewRemoteHost></NewRemoteHost><NewExternalPort>8080</NewExternalPort>\
                      <NewProtocol>TCP</NewProtocol><NewInternalPort>8080</NewInternalPort>\
                      <NewInternalClient>127.0.0.1</NewInternalClient><NewEnabled>1</NewEnabled>\
                      <NewPortMappingDescription>PortControl</NewPortMappingDescription>\
                      <NewLeaseDuration>0</NewLeaseDuration>";
        format!(
            r#"<?xml version="1.0"?><s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/"><s:Body><u:GetGenericPortMappingEntryResponse xmlns:u="{}">{fields}</u:GetGenericPortMappingEntryResponse></s:Body></s:Envelope>"#,
            upnp::SERVICE_TYPE
        )
    }

    fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
        haystack.windows(needle.len()).position(|window| window == needle)
    }

    async fn read_http_request(stream: &mut TcpStream) -> Option<(String, String)> {
        let mut data = Vec::new();
        let mut buf = [0u8; 1024];
        let header_end = loop {
            let read = stream.read(&mut buf).await.ok()?;
            if read == 0 {
                return None;
            }
            data.extend_from_slice(&buf[..read]);
            if let Some(pos) = find_subsequence(&data, b"\r\n\r\n") {
                break pos + 4;
            }
        };
        let head = String::from_utf8_lossy(&data[..header_end]).to_string();
        let content_length = head
            .lines()
            .find_map(|line| {
                line.to_ascii_lowercase()
                    .strip_prefix("content-length:")
                    .and_then(|value| value.trim().parse::<usize>().ok())
            })
            .unwrap_or(0);
        while data.len() < header_end + content_length {
            let read = stream.read(&mut buf).await.ok()?;
            if read == 0 {
                break;
            }
            data.extend_from_slice(&buf[..read]);
        }
        let body = String::from_utf8_lossy(&data[header_end..]).to_string();
        Some((head, body))
    }

    /// Serves the device description on GET and answers SOAP posts,
    /// logging their bodies. With `fault_on_add` the AddPortMapping action
    /// replies with a SOAP fault.
    async fn http_gateway(fault_on_add: bool) -> (u16, Arc<Mutex<Vec<String>>>) {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let log = Arc::new(Mutex::new(Vec::new()));
        let task_log = log.clone();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                let log = task_log.clone();
                tokio::spawn(async move {
                    let Some((head, body)) = read_http_request(&mut stream).await else {
                        return;
                    };
                    let response = if head.starts_with("GET") {
                        http_ok(&device_description())
                    } else {
                        log.lock().unwrap().push(body.clone());
                        if body.contains("GetGenericPortMappingEntry") {
                            http_ok(&soap_mapping_entry())
                        } else if body.contains("AddPortMapping") {
                            if fault_on_add {
                                soap_fault("ConflictInMappingEntry")
                            } else {
                                http_ok(&soap_ok("AddPortMapping"))
                            }
                        } else {
                            http_ok(&soap_ok("DeletePortMapping"))
                        }
                    };
                    let _ = stream.write_all(response.as_bytes()).await;
                    let _ = stream.shutdown().await;
                });
            }
        });
        (port, log)
    }

    // ---- end-to-end scenarios ----

    #[tokio::test]
    async fn nat_pmp_mapping_success() {
        let _guard = setup_logging();
        let (port, _log) = udp_gateway(|request| {
            is_pmp_map(request).then(|| {
                pmp_grant(
                    request,
                    wire::read_u16(request, 6),
                    wire::read_u32(request, 8),
                )
            })
        })
        .await;
        let client = Client::new(test_config(port));

        // nothing probed yet
        assert_eq!(client.support_cache().await, ProtocolSupport::default());

        let mapping = client.add_mapping(nz(4000), nz(4000), 7200).await.unwrap();
        assert_eq!(mapping.protocol(), Protocol::NatPmp);
        assert_eq!(mapping.external_port(), nz(4000));
        assert_eq!(mapping.lifetime_seconds(), 7200);
        assert_eq!(mapping.external_ip(), None);
        assert_eq!(mapping.transport(), Transport::Tcp);

        assert_eq!(client.router_cache().await, vec![Ipv4Addr::LOCALHOST]);
        let mappings = client.active_mappings().await;
        assert_eq!(mappings.len(), 1);
        assert_eq!(mappings[&4000], mapping);
    }

    #[tokio::test]
    async fn silent_nat_pmp_falls_back_to_pcp() {
        let _guard = setup_logging();
        let (port, _log) = udp_gateway(|request| match request.first() {
            // NAT-PMP requests are ignored, PCP is granted
            Some(2) => Some(pcp_grant(
                request,
                0,
                4001,
                120,
                "203.0.113.5".parse().unwrap(),
            )),
            _ => None,
        })
        .await;
        let client = Client::new(test_config(port));

        let mapping = client.add_mapping(nz(4000), nz(4000), 300).await.unwrap();
        assert_eq!(mapping.protocol(), Protocol::Pcp);
        assert_eq!(mapping.external_port(), nz(4001));
        assert_eq!(
            mapping.external_ip(),
            Some("203.0.113.5".parse().unwrap())
        );
        assert!(mapping.nonce().is_some());

        // registered under the granted port, not the requested one
        assert!(client.active_mappings().await.contains_key(&4001));
    }

    #[tokio::test]
    async fn short_grant_is_refreshed_with_the_remainder() {
        let _guard = setup_logging();
        // grants at most one second per request
        let (port, log) = udp_gateway(|request| {
            is_pmp_map(request).then(|| {
                let requested = wire::read_u32(request, 8);
                pmp_grant(request, wire::read_u16(request, 6), requested.min(1))
            })
        })
        .await;
        let client = Client::new(test_config(port));

        let mapping = client.add_mapping(nz(4000), nz(4000), 3).await.unwrap();
        assert_eq!(mapping.lifetime_seconds(), 1);

        tokio::time::sleep(Duration::from_millis(1600)).await;

        // exactly one refresh so far, asking for the remainder
        let lifetimes: Vec<u32> = log
            .lock()
            .unwrap()
            .iter()
            .map(|request| wire::read_u32(request, 8))
            .collect();
        assert_eq!(lifetimes, vec![3, 2]);
        assert!(client.active_mappings().await.contains_key(&4000));
    }

    #[tokio::test]
    async fn upnp_static_mapping_and_delete() {
        let _guard = setup_logging();
        let (http_port, soap_log) = http_gateway(false).await;
        let ssdp_port =
            ssdp_responder(format!("http://127.0.0.1:{http_port}/rootDesc.xml")).await;

        let mut config = test_config(1);
        config.enable_nat_pmp = false;
        config.enable_pcp = false;
        config.ssdp_addr = SocketAddrV4::new(Ipv4Addr::LOCALHOST, ssdp_port);
        let client = Client::new(config);

        let mapping = client.add_mapping(nz(8080), nz(8080), 0).await.unwrap();
        assert_eq!(mapping.protocol(), Protocol::Upnp);
        assert_eq!(mapping.lifetime_seconds(), 0);
        assert_eq!(mapping.external_ip(), None);

        let support = client.support_cache().await;
        let control_url = support.upnp_control_url.expect("control URL cached");
        assert!(control_url.as_str().ends_with("/ctl"));
        // only a probe settles the flags
        assert_eq!(support.upnp, None);

        assert!(client.active_mappings().await.contains_key(&8080));

        let entry =
            upnp::get_generic_port_mapping_entry(&reqwest::Client::new(), &control_url, 0)
                .await
                .unwrap();
        assert_eq!(entry.external_port, 8080);
        assert_eq!(entry.description, "PortControl");
        assert!(entry.enabled);

        assert!(client.delete_mapping(8080).await);
        assert!(client.active_mappings().await.is_empty());

        let bodies = soap_log.lock().unwrap().clone();
        assert!(bodies
            .iter()
            .any(|body| body.contains("AddPortMapping")
                && body.contains("<NewLeaseDuration>0</NewLeaseDuration>")));
        assert!(bodies.iter().any(|body| body.contains("DeletePortMapping")));
    }

    #[tokio::test]
    async fn upnp_fault_description_is_surfaced() {
        let _guard = setup_logging();
        let (http_port, _soap_log) = http_gateway(true).await;
        let ssdp_port =
            ssdp_responder(format!("http://127.0.0.1:{http_port}/rootDesc.xml")).await;

        let mut config = test_config(1);
        config.enable_nat_pmp = false;
        config.enable_pcp = false;
        config.ssdp_addr = SocketAddrV4::new(Ipv4Addr::LOCALHOST, ssdp_port);
        let client = Client::new(config);

        let err = client.add_mapping(nz(8081), nz(8081), 0).await.unwrap_err();
        assert_eq!(
            err,
            Error::AllProtocolsFailed {
                reason: Some("ConflictInMappingEntry".into()),
            }
        );
        assert!(client.active_mappings().await.is_empty());
    }

    #[tokio::test]
    async fn pcp_delete_accepts_no_resources() {
        let _guard = setup_logging();
        let (port, _log) = udp_gateway(|request| {
            if request.first() != Some(&2) {
                return None;
            }
            if wire::read_u32(request, 4) == 0 {
                // deletion of a mapping the router already dropped
                Some(pcp_grant(request, 8, 0, 0, Ipv4Addr::UNSPECIFIED))
            } else {
                Some(pcp_grant(
                    request,
                    0,
                    4001,
                    120,
                    "203.0.113.5".parse().unwrap(),
                ))
            }
        })
        .await;

        let mut config = test_config(port);
        config.enable_nat_pmp = false;
        let client = Client::new(config);

        let mapping = client.add_mapping(nz(4000), nz(4000), 120).await.unwrap();
        assert_eq!(mapping.protocol(), Protocol::Pcp);

        assert!(client.delete_mapping(4001).await);
        assert!(client.active_mappings().await.is_empty());

        // deleting again reports absence
        assert!(!client.delete_mapping(4001).await);
    }

    #[tokio::test]
    async fn nothing_answers_fails_softly() {
        let _guard = setup_logging();
        // reserve a port with nothing behind it
        let port = {
            let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
            socket.local_addr().unwrap().port()
        };
        let client = Client::new(test_config(port));

        let err = client.add_mapping(nz(4000), nz(4000), 600).await.unwrap_err();
        assert!(matches!(err, Error::AllProtocolsFailed { .. }));
        assert!(client.active_mappings().await.is_empty());
        assert!(client.router_cache().await.is_empty());
        // a failed add leaves the support cache untouched
        assert_eq!(client.support_cache().await, ProtocolSupport::default());

        let output = client.probe().await.unwrap();
        assert!(output.none_available());

        // with the probe settled, failure is immediate and explained
        let err = client.add_mapping(nz(4000), nz(4000), 600).await.unwrap_err();
        assert_eq!(
            err,
            Error::AllProtocolsFailed {
                reason: Some("No protocols are supported from last probe".into()),
            }
        );
    }

    #[tokio::test]
    async fn probe_settles_all_three_flags() {
        let _guard = setup_logging();
        let (port, _log) = udp_gateway(|request| match request.first() {
            // PCP answers, NAT-PMP stays silent
            Some(2) => Some(pcp_grant(
                request,
                0,
                wire::read_u16(request, 42),
                defaults::PROBE_LIFETIME_SECONDS,
                "203.0.113.5".parse().unwrap(),
            )),
            _ => None,
        })
        .await;
        let client = Client::new(test_config(port));

        let output = client.probe().await.unwrap();
        assert_eq!(
            output,
            ProbeOutput {
                nat_pmp: false,
                pcp: true,
                upnp: false,
            }
        );

        let support = client.support_cache().await;
        assert_eq!(support.nat_pmp, Some(false));
        assert_eq!(support.pcp, Some(true));
        assert_eq!(support.upnp, Some(false));
    }

    #[tokio::test]
    async fn probe_ports_are_refused() {
        let _guard = setup_logging();
        let client = Client::new(test_config(1));
        let err = client
            .add_mapping(nz(4000), nz(defaults::NAT_PMP_PROBE_PORT), 600)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            Error::ProbePortReserved {
                port: defaults::NAT_PMP_PROBE_PORT,
            }
        );
    }

    #[tokio::test]
    async fn readding_a_port_keeps_one_entry() {
        let _guard = setup_logging();
        let (port, _log) = udp_gateway(|request| {
            is_pmp_map(request).then(|| {
                pmp_grant(
                    request,
                    wire::read_u16(request, 6),
                    wire::read_u32(request, 8),
                )
            })
        })
        .await;
        let client = Client::new(test_config(port));

        let first = client.add_mapping(nz(4000), nz(4000), 7200).await.unwrap();
        let second = client.add_mapping(nz(4000), nz(4000), 7200).await.unwrap();
        assert_eq!(first, second);

        let mappings = client.active_mappings().await;
        assert_eq!(mappings.len(), 1);
        assert_eq!(mappings[&4000], second);
    }

    #[tokio::test]
    async fn close_releases_every_mapping() {
        let _guard = setup_logging();
        let (port, log) = udp_gateway(|request| {
            is_pmp_map(request).then(|| {
                let external = wire::read_u16(request, 6);
                let lifetime = wire::read_u32(request, 8);
                pmp_grant(request, external, lifetime)
            })
        })
        .await;
        let client = Client::new(test_config(port));

        client.add_mapping(nz(4000), nz(4000), 7200).await.unwrap();
        client.add_mapping(nz(5000), nz(5000), 7200).await.unwrap();
        client.close().await;

        // one lifetime-0 request per registered mapping
        let deletes: Vec<u16> = log
            .lock()
            .unwrap()
            .iter()
            .filter(|request| wire::read_u32(request, 8) == 0)
            .map(|request| wire::read_u16(request, 4))
            .collect();
        assert_eq!(deletes.len(), 2);
        assert!(deletes.contains(&4000));
        assert!(deletes.contains(&5000));

        assert_eq!(
            client.add_mapping(nz(6000), nz(6000), 60).await,
            Err(Error::Closed)
        );
    }

    #[tokio::test]
    async fn external_address_over_nat_pmp() {
        let _guard = setup_logging();
        let (port, _log) = udp_gateway(|request| {
            (request.len() == 2 && request[0] == 0).then(|| {
                let mut reply = wire::build(12, &[Field::u8(1, 0x80), Field::u32(4, 1)]);
                reply[8..12].copy_from_slice(&[203, 0, 113, 5]);
                reply
            })
        })
        .await;
        let client = Client::new(test_config(port));

        assert_eq!(
            client.external_address().await.unwrap(),
            "203.0.113.5".parse::<Ipv4Addr>().unwrap()
        );
    }
}
