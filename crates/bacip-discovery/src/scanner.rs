//! Discovery scanner that combines ARP and IP probing
//!
//! One scan spawns a probing task per `(interface, subnet)` target. All tasks
//! publish into a single buffered channel; the [`DiscoveryStream`] ends once
//! every task, delivery, and capture cleanup has finished.

use network_interface::{Addr, NetworkInterface, NetworkInterfaceConfig};
use std::collections::HashSet;
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::arp::{probe_arp, ProbeError};
use crate::capture::{Capability, CaptureProvider, PnetCapture};
use crate::probe::{probe_ip, ProbeContext, ProbeSettings};
use crate::subnet::Subnet;

/// Default result channel capacity
pub const CHANNEL_CAPACITY: usize = 65536;

#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("failed to enumerate network interfaces: {0}")]
    Interfaces(#[source] network_interface::Error),
}

/// Scanner configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannerConfig {
    /// Prefer ARP probing where capture is available
    pub use_arp: bool,
    /// Probe timing
    pub settings: ProbeSettings,
    /// Result channel capacity
    pub channel_capacity: usize,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            use_arp: true,
            settings: ProbeSettings::default(),
            channel_capacity: CHANNEL_CAPACITY,
        }
    }
}

/// Per-scan narrowing of the local interfaces
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveryFilter {
    /// Interface names to scan; empty means all
    pub interfaces: Vec<String>,
    /// Override [`ScannerConfig::use_arp`] for this scan
    pub use_arp: Option<bool>,
}

impl DiscoveryFilter {
    pub fn matches(&self, interface: &str) -> bool {
        self.interfaces.is_empty() || self.interfaces.iter().any(|name| name == interface)
    }
}

/// One subnet reachable through one local interface
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScanTarget {
    pub interface: Arc<str>,
    /// Local interface address and prefix
    pub subnet: Subnet,
}

impl ScanTarget {
    pub fn new(interface: impl Into<Arc<str>>, subnet: Subnet) -> Self {
        Self {
            interface: interface.into(),
            subnet,
        }
    }
}

impl fmt::Display for ScanTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} on {}", self.subnet, self.interface)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProbeMethod {
    /// Host answered an ARP request
    Arp,
    /// Host is a subnet candidate, liveness unknown
    Ip,
}

/// A discovered candidate address, owned by the consumer
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DiscoveredHost {
    pub interface: Arc<str>,
    pub address: Ipv4Addr,
    pub method: ProbeMethod,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeFailure {
    /// A probing task panicked; results from other tasks are still valid
    Panicked {
        interface: Arc<str>,
        subnet: Subnet,
        message: String,
    },
}

impl fmt::Display for ProbeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeFailure::Panicked {
                interface,
                subnet,
                message,
            } => write!(f, "probing {} on {} panicked: {}", subnet, interface, message),
        }
    }
}

/// Item on the result path of a scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Discovered {
    Host(DiscoveredHost),
    Failure(ProbeFailure),
}

/// Results of one scan. Ends once all probing work is done or cancelled.
#[derive(Debug)]
pub struct DiscoveryStream {
    rx: mpsc::Receiver<Discovered>,
}

impl DiscoveryStream {
    pub async fn next(&mut self) -> Option<Discovered> {
        self.rx.recv().await
    }

    /// Drain the stream, keeping hosts and dropping failures
    pub async fn collect_hosts(mut self) -> Vec<DiscoveredHost> {
        let mut hosts = Vec::new();
        while let Some(item) = self.next().await {
            match item {
                Discovered::Host(host) => hosts.push(host),
                Discovered::Failure(failure) => debug!(%failure, "Dropping probe failure"),
            }
        }
        hosts
    }
}

/// Discovery scanner service
pub struct DiscoveryScanner {
    config: ScannerConfig,
    capture: Arc<dyn CaptureProvider>,
}

impl DiscoveryScanner {
    /// Create a scanner that captures through pnet
    pub fn new(config: ScannerConfig) -> Self {
        Self::with_capture(config, Arc::new(PnetCapture))
    }

    pub fn with_capture(config: ScannerConfig, capture: Arc<dyn CaptureProvider>) -> Self {
        Self { config, capture }
    }

    pub fn config(&self) -> &ScannerConfig {
        &self.config
    }

    /// Scan every IPv4 subnet of the local interfaces admitted by `filter`
    pub fn scan(
        &self,
        cancel: &CancellationToken,
        filter: &DiscoveryFilter,
    ) -> Result<DiscoveryStream, DiscoveryError> {
        let targets = local_targets(filter)?;
        let use_arp = filter.use_arp.unwrap_or(self.config.use_arp);
        Ok(self.spawn_scan(cancel, targets, use_arp))
    }

    /// Scan explicit targets
    pub fn scan_targets(
        &self,
        cancel: &CancellationToken,
        targets: Vec<ScanTarget>,
    ) -> DiscoveryStream {
        self.spawn_scan(cancel, targets, self.config.use_arp)
    }

    fn spawn_scan(
        &self,
        cancel: &CancellationToken,
        targets: Vec<ScanTarget>,
        use_arp: bool,
    ) -> DiscoveryStream {
        let (results, rx) = mpsc::channel(self.config.channel_capacity.max(1));
        let ctx = ProbeContext {
            results,
            cancel: cancel.clone(),
            settings: self.config.settings,
        };
        let capture = Arc::clone(&self.capture);

        info!(targets = targets.len(), use_arp, "Starting discovery scan");
        tokio::spawn(supervise(capture, targets, ctx, use_arp));

        DiscoveryStream { rx }
    }
}

/// Run one probing task per target and turn panics into failure results.
/// The supervisor's sender is dropped when it returns.
async fn supervise(
    capture: Arc<dyn CaptureProvider>,
    targets: Vec<ScanTarget>,
    ctx: ProbeContext,
    use_arp: bool,
) {
    let mut tasks = JoinSet::new();
    for target in targets {
        if ctx.cancel.is_cancelled() {
            debug!("Scan cancelled before all targets were started");
            break;
        }
        let capture = Arc::clone(&capture);
        let task_ctx = ctx.clone();
        tasks.spawn(async move {
            let probe_target = target.clone();
            let joined = tokio::spawn(async move {
                probe_subnet(capture.as_ref(), &probe_target, &task_ctx, use_arp).await
            })
            .await;
            (target, joined)
        });
    }

    let mut failures = 0usize;
    while let Some(joined) = tasks.join_next().await {
        let Ok((target, result)) = joined else {
            continue;
        };
        if let Err(e) = result {
            failures += 1;
            let message = panic_message(e);
            warn!(
                target = %target,
                error = %message,
                "Probing task panicked, continuing with partial results"
            );
            let failure = Discovered::Failure(ProbeFailure::Panicked {
                interface: target.interface,
                subnet: target.subnet,
                message,
            });
            tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => {}
                _ = ctx.results.send(failure) => {}
                _ = tokio::time::sleep(ctx.settings.delivery_timeout) => {}
            }
        }
    }

    debug!(failures, "All probing tasks joined, closing result channel");
}

async fn probe_subnet(
    capture: &dyn CaptureProvider,
    target: &ScanTarget,
    ctx: &ProbeContext,
    use_arp: bool,
) {
    debug!(interface = %target.interface, subnet = %target.subnet, "Expanding local subnet");

    if use_arp {
        match capture.capability(target.subnet.address()) {
            Capability::ArpCapable(device) => match probe_arp(capture, device, target, ctx).await {
                Ok(_) | Err(ProbeError::Cancelled) => return,
                Err(e) => warn!(
                    interface = %target.interface,
                    subnet = %target.subnet,
                    error = %e,
                    "ARP scan failed, falling back to IP based scan"
                ),
            },
            Capability::Unavailable(e) => warn!(
                interface = %target.interface,
                subnet = %target.subnet,
                error = %e,
                "ARP capture unavailable, falling back to IP based scan"
            ),
        }
    }

    match probe_ip(target, ctx) {
        Ok(_) | Err(ProbeError::Cancelled) => {}
        Err(e) => warn!(interface = %target.interface, error = %e, "Error looking up IPs"),
    }
}

/// Every IPv4, non-loopback subnet on the local interfaces admitted by `filter`
pub fn local_targets(filter: &DiscoveryFilter) -> Result<Vec<ScanTarget>, DiscoveryError> {
    let interfaces = NetworkInterface::show().map_err(DiscoveryError::Interfaces)?;
    Ok(targets_from_interfaces(interfaces, filter))
}

fn targets_from_interfaces(
    interfaces: Vec<NetworkInterface>,
    filter: &DiscoveryFilter,
) -> Vec<ScanTarget> {
    let mut seen = HashSet::new();
    let mut targets = Vec::new();

    for iface in interfaces {
        if !filter.matches(&iface.name) {
            trace!(interface = %iface.name, "Interface not selected");
            continue;
        }
        let name: Arc<str> = Arc::from(iface.name.as_str());
        for addr in &iface.addr {
            let Addr::V4(v4) = addr else {
                trace!(interface = %iface.name, "Skipping non-IPv4 address");
                continue;
            };
            if v4.ip.is_loopback() {
                trace!(interface = %iface.name, ip = %v4.ip, "Skipping loopback address");
                continue;
            }
            let subnet = v4
                .netmask
                .and_then(|mask| Subnet::from_netmask(v4.ip, mask).ok())
                .unwrap_or_else(|| Subnet::with_default_mask(v4.ip));
            let target = ScanTarget::new(Arc::clone(&name), subnet);
            if seen.insert(target.clone()) {
                debug!(interface = %iface.name, subnet = %subnet, "Found local subnet");
                targets.push(target);
            }
        }
    }
    targets
}

pub(crate) fn panic_message(err: JoinError) -> String {
    if !err.is_panic() {
        return err.to_string();
    }
    let payload = err.into_panic();
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Bound for draining a stream in tests and the CLI
pub fn scan_budget(config: &ScannerConfig) -> Duration {
    config.settings.arp_cleanup_delay + config.settings.delivery_timeout * 2
}
