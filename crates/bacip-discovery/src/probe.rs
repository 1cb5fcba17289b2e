//! IP probing and result delivery
//!
//! IP probing forwards every host of a subnet as a discovery candidate
//! without checking reachability; a real connection attempt decides later.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::arp::ProbeError;
use crate::scanner::{Discovered, DiscoveredHost, ProbeMethod, ScanTarget};

/// Default bound on a single result delivery
pub const DELIVERY_TIMEOUT: Duration = Duration::from_secs(2);

/// Default delay between the last ARP request and closing the capture
pub const ARP_CLEANUP_DELAY: Duration = Duration::from_secs(10);

/// Default wake-up interval of the capture reader
pub const CAPTURE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Timing knobs shared by all probers of one scan
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeSettings {
    pub delivery_timeout: Duration,
    pub arp_cleanup_delay: Duration,
    pub capture_poll_interval: Duration,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            delivery_timeout: DELIVERY_TIMEOUT,
            arp_cleanup_delay: ARP_CLEANUP_DELAY,
            capture_poll_interval: CAPTURE_POLL_INTERVAL,
        }
    }
}

/// Everything a prober needs to publish results. Every clone holds a sender;
/// the scan's stream closes once the last clone is gone.
#[derive(Debug, Clone)]
pub struct ProbeContext {
    pub results: mpsc::Sender<Discovered>,
    pub cancel: CancellationToken,
    pub settings: ProbeSettings,
}

impl ProbeContext {
    /// Deliver `address` on a detached task bounded by cancellation, a
    /// successful send, or the delivery timeout
    pub fn schedule(&self, interface: &Arc<str>, address: std::net::Ipv4Addr, method: ProbeMethod) {
        let host = DiscoveredHost {
            interface: Arc::clone(interface),
            address,
            method,
        };
        tokio::spawn(deliver(
            self.results.clone(),
            host,
            self.settings.delivery_timeout,
            self.cancel.clone(),
        ));
    }

    /// Same as [`ProbeContext::schedule`] from a thread outside the runtime
    pub fn schedule_on(
        &self,
        runtime: &tokio::runtime::Handle,
        interface: &Arc<str>,
        address: std::net::Ipv4Addr,
        method: ProbeMethod,
    ) {
        let host = DiscoveredHost {
            interface: Arc::clone(interface),
            address,
            method,
        };
        runtime.spawn(deliver(
            self.results.clone(),
            host,
            self.settings.delivery_timeout,
            self.cancel.clone(),
        ));
    }
}

/// Send one result. Returns true if the consumer received it.
pub async fn deliver(
    results: mpsc::Sender<Discovered>,
    host: DiscoveredHost,
    timeout: Duration,
    cancel: CancellationToken,
) -> bool {
    let address = host.address;
    // Cancellation wins over a send that became ready at the same time
    tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            trace!(ip = %address, "Scan cancelled before delivery");
            false
        }
        sent = results.send(Discovered::Host(host)) => sent.is_ok(),
        _ = tokio::time::sleep(timeout) => {
            trace!(ip = %address, "Timed out waiting to deliver IP address");
            false
        }
    }
}

/// Schedule one delivery per host of the target subnet. Returns the number of
/// scheduled deliveries; stops before new work once the scan is cancelled.
pub fn probe_ip(target: &ScanTarget, ctx: &ProbeContext) -> Result<usize, ProbeError> {
    debug!(
        interface = %target.interface,
        subnet = %target.subnet,
        hosts = target.subnet.host_count(),
        "Scanning all IP addresses for network"
    );

    let mut scheduled = 0;
    for address in target.subnet.hosts() {
        if ctx.cancel.is_cancelled() {
            debug!(interface = %target.interface, scheduled, "IP scan cancelled");
            return Err(ProbeError::Cancelled);
        }
        ctx.schedule(&target.interface, address, ProbeMethod::Ip);
        scheduled += 1;
        trace!(ip = %address, "Expanded subnet");
    }

    debug!(subnet = %target.subnet, scheduled, "Done expanding subnet");
    Ok(scheduled)
}
