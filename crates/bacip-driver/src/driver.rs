//! BACnet/IP driver
//!
//! Ties the pieces together: transport lookup and shared codecs for
//! connections, the discovery scanner for `discover`, and an orderly
//! shutdown that reports every failure.

use bacip_core::options::{OPTION_DEFAULT_UDP_PORT, OPTION_SO_REUSE};
use bacip_core::{DriverOptions, TransportUrl, UrlError, Watchdog, WatchdogGuard};
use bacip_discovery::{
    CaptureProvider, Discovered, DiscoveredHost, DiscoveryError, DiscoveryFilter, DiscoveryScanner,
    DiscoveryStream, PnetCapture, ProbeMethod, ScanTarget,
};
use bacip_transport::{
    BvlcCodecFactory, CodecCache, CodecError, CodecFactory, EndpointIdentity, UdpTransport,
};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{Config, WatchdogConfig};

pub const PROTOCOL_CODE: &str = "bacnet-ip";
pub const PROTOCOL_NAME: &str = "BACnet/IP";

#[derive(Error, Debug)]
pub enum DriverError {
    #[error("couldn't find transport for given transport url {0:?}")]
    TransportNotFound(String),
    #[error("invalid transport url: {0}")]
    Url(#[from] UrlError),
    #[error("error getting codec: {0}")]
    Codec(#[from] CodecError),
    #[error("discovery failed: {0}")]
    Discovery(#[from] DiscoveryError),
    #[error("driver is closed")]
    Closed,
    #[error("error closing driver: {}", join_failures(.0))]
    Shutdown(Vec<ShutdownFailure>),
}

fn join_failures(failures: &[ShutdownFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// One failed step of [`Driver::close`]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ShutdownFailure {
    #[error("error closing discoverer: {0}")]
    Discoverer(#[source] DiscovererError),
    #[error("error closing transaction manager: {0}")]
    TransactionManager(#[source] TransactionError),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DiscovererError {
    #[error("discoverer is already closed")]
    AlreadyClosed,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransactionError {
    #[error("transaction manager is closed")]
    Closed,
    #[error("{0}")]
    Failed(String),
}

/// Owner of outstanding request transactions
pub trait TransactionManager: Send + Sync {
    /// Stop accepting work. Closing twice is an error.
    fn close(&self) -> Result<(), TransactionError>;

    fn is_closed(&self) -> bool;
}

/// Runs at most `max_concurrent` request transactions at a time
#[derive(Debug)]
pub struct RequestTransactionManager {
    permits: Semaphore,
    max_concurrent: usize,
    closed: AtomicBool,
}

impl RequestTransactionManager {
    pub fn new(max_concurrent: usize) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            permits: Semaphore::new(max_concurrent),
            max_concurrent,
            closed: AtomicBool::new(false),
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Run `request` once a slot is free
    pub async fn submit<T, Fut>(&self, request: Fut) -> Result<T, TransactionError>
    where
        Fut: Future<Output = T>,
    {
        let _permit = self.permits.acquire().await.map_err(|_| TransactionError::Closed)?;
        Ok(request.await)
    }
}

impl TransactionManager for RequestTransactionManager {
    fn close(&self) -> Result<(), TransactionError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(TransactionError::Closed);
        }
        self.permits.close();
        debug!("Closed transaction manager");
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Transports by URL scheme
#[derive(Debug, Clone)]
pub struct TransportRegistry {
    transports: HashMap<String, UdpTransport>,
}

impl Default for TransportRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportRegistry {
    /// Registry with the UDP transport
    pub fn new() -> Self {
        Self {
            transports: HashMap::from([(UdpTransport::CODE.to_string(), UdpTransport)]),
        }
    }

    pub fn get(&self, code: &str) -> Option<&UdpTransport> {
        self.transports.get(code)
    }

    pub fn codes(&self) -> Vec<&str> {
        let mut codes: Vec<&str> = self.transports.keys().map(String::as_str).collect();
        codes.sort_unstable();
        codes
    }
}

/// A discovered device address, ready to be passed to [`Driver::connect`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryItem {
    pub protocol_code: String,
    pub transport_code: String,
    pub transport_url: String,
    pub name: String,
    pub interface: String,
    pub address: Ipv4Addr,
    pub method: ProbeMethod,
}

impl DiscoveryItem {
    fn from_host(host: DiscoveredHost, port: u16) -> Self {
        let endpoint = SocketAddr::from((host.address, port));
        Self {
            protocol_code: PROTOCOL_CODE.to_string(),
            transport_code: UdpTransport::CODE.to_string(),
            transport_url: format!("{}://{}", UdpTransport::CODE, endpoint),
            name: endpoint.to_string(),
            interface: host.interface.to_string(),
            address: host.address,
            method: host.method,
        }
    }
}

/// Counts from one discovery run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiscoverySummary {
    pub hosts: usize,
    pub failures: usize,
    /// Watchdog warnings emitted while the run was draining
    pub stall_warnings: u32,
}

/// Start a watchdog for `process_id`. A misconfigured watchdog is logged and
/// the operation runs unwatched.
#[track_caller]
fn start_watchdog(process_id: &str, config: &WatchdogConfig) -> Option<WatchdogGuard> {
    match Watchdog::new()
        .process_id(process_id)
        .interval(config.interval())
        .include_backtrace(config.include_backtrace)
        .start()
    {
        Ok(guard) => Some(guard),
        Err(e) => {
            warn!(process_id, error = %e, "Running without watchdog");
            None
        }
    }
}

/// Hand-off to connection setup: the shared codec plus what it was opened for
pub struct Connection<C> {
    codec: Arc<C>,
    endpoint: EndpointIdentity,
    url: TransportUrl,
    options: DriverOptions,
    transactions: Arc<dyn TransactionManager>,
}

impl<C> Connection<C> {
    pub fn codec(&self) -> &Arc<C> {
        &self.codec
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.endpoint.remote
    }

    /// Canonical local endpoint the codec is keyed by
    pub fn local_endpoint(&self) -> SocketAddr {
        self.endpoint.local
    }

    pub fn url(&self) -> &TransportUrl {
        &self.url
    }

    pub fn options(&self) -> &DriverOptions {
        &self.options
    }

    pub fn transactions(&self) -> &Arc<dyn TransactionManager> {
        &self.transactions
    }
}

impl<C> fmt::Debug for Connection<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("url", &self.url.to_string())
            .field("endpoint", &self.endpoint)
            .field("options", &self.options)
            .finish()
    }
}

/// Runs discovery scans; closing it cancels every scan in flight
pub struct Discoverer {
    scanner: DiscoveryScanner,
    shutdown: CancellationToken,
    udp_port: u16,
    watchdog: WatchdogConfig,
}

impl Discoverer {
    pub fn new(scanner: DiscoveryScanner, udp_port: u16, watchdog: WatchdogConfig) -> Self {
        Self {
            scanner,
            shutdown: CancellationToken::new(),
            udp_port,
            watchdog,
        }
    }

    /// Scan local interfaces admitted by `filter`
    pub async fn discover<C>(
        &self,
        cancel: &CancellationToken,
        filter: &DiscoveryFilter,
        callback: C,
    ) -> Result<DiscoverySummary, DriverError>
    where
        C: FnMut(DiscoveryItem),
    {
        let scan_cancel = self.shutdown.child_token();
        let stream = self.scanner.scan(&scan_cancel, filter)?;
        Ok(self.drain(cancel, scan_cancel, stream, callback).await)
    }

    /// Scan explicit targets
    pub async fn discover_targets<C>(
        &self,
        cancel: &CancellationToken,
        targets: Vec<ScanTarget>,
        callback: C,
    ) -> DiscoverySummary
    where
        C: FnMut(DiscoveryItem),
    {
        let scan_cancel = self.shutdown.child_token();
        let stream = self.scanner.scan_targets(&scan_cancel, targets);
        self.drain(cancel, scan_cancel, stream, callback).await
    }

    async fn drain<C>(
        &self,
        cancel: &CancellationToken,
        scan_cancel: CancellationToken,
        mut stream: DiscoveryStream,
        mut callback: C,
    ) -> DiscoverySummary
    where
        C: FnMut(DiscoveryItem),
    {
        // Stop probing if the caller stops polling us
        let _stop = scan_cancel.clone().drop_guard();
        let watchdog = start_watchdog("discovering", &self.watchdog);
        let mut summary = DiscoverySummary::default();

        loop {
            let item = tokio::select! {
                _ = cancel.cancelled(), if !scan_cancel.is_cancelled() => {
                    debug!("Discovery cancelled by caller");
                    scan_cancel.cancel();
                    continue;
                }
                item = stream.next() => item,
            };

            match item {
                Some(Discovered::Host(host)) => {
                    summary.hosts += 1;
                    callback(DiscoveryItem::from_host(host, self.udp_port));
                }
                Some(Discovered::Failure(failure)) => {
                    summary.failures += 1;
                    warn!(%failure, "Probe failed during discovery");
                }
                None => break,
            }
        }

        if let Some(guard) = watchdog {
            summary.stall_warnings = guard.finish().warnings;
        }
        info!(
            hosts = summary.hosts,
            failures = summary.failures,
            stall_warnings = summary.stall_warnings,
            "Discovery finished"
        );
        summary
    }

    pub fn close(&self) -> Result<(), DiscovererError> {
        if self.shutdown.is_cancelled() {
            return Err(DiscovererError::AlreadyClosed);
        }
        self.shutdown.cancel();
        debug!("Closed discoverer");
        Ok(())
    }
}

/// BACnet/IP driver
pub struct Driver<F: CodecFactory = BvlcCodecFactory> {
    config: Config,
    transports: TransportRegistry,
    codecs: CodecCache<F>,
    discoverer: Discoverer,
    transactions: Arc<dyn TransactionManager>,
    closed: AtomicBool,
}

impl Driver<BvlcCodecFactory> {
    /// Driver with BVLC codecs, pnet capture and a single-slot transaction manager
    pub fn new(config: Config) -> Self {
        Self::with_components(
            config,
            BvlcCodecFactory,
            Arc::new(PnetCapture),
            Arc::new(RequestTransactionManager::new(1)),
        )
    }
}

impl<F: CodecFactory> Driver<F> {
    pub fn with_components(
        config: Config,
        factory: F,
        capture: Arc<dyn CaptureProvider>,
        transactions: Arc<dyn TransactionManager>,
    ) -> Self {
        let scanner = DiscoveryScanner::with_capture(config.to_scanner_config(), capture);
        let discoverer = Discoverer::new(
            scanner,
            config.connection.default_udp_port,
            config.watchdog.clone(),
        );
        Self {
            config,
            transports: TransportRegistry::new(),
            codecs: CodecCache::with_factory(factory),
            discoverer,
            transactions,
            closed: AtomicBool::new(false),
        }
    }

    pub fn protocol_code(&self) -> &'static str {
        PROTOCOL_CODE
    }

    pub fn protocol_name(&self) -> &'static str {
        PROTOCOL_NAME
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn transports(&self) -> &TransportRegistry {
        &self.transports
    }

    pub fn codecs(&self) -> &CodecCache<F> {
        &self.codecs
    }

    fn ensure_open(&self) -> Result<(), DriverError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DriverError::Closed);
        }
        Ok(())
    }

    /// Connect to `url` (`udp://host[:port][?options]`). Query options take
    /// precedence over `options`.
    pub async fn connect(
        &self,
        url: &str,
        options: &DriverOptions,
    ) -> Result<Connection<F::Codec>, DriverError> {
        self.ensure_open()?;
        debug!(url, "Getting connection");

        let url: TransportUrl = url.parse()?;
        let transport = self
            .transports
            .get(url.scheme())
            .ok_or_else(|| {
                debug!(
                    scheme = url.scheme(),
                    known = ?self.transports.codes(),
                    "Unknown transport"
                );
                DriverError::TransportNotFound(url.to_string())
            })?;

        let mut options = {
            let mut merged = url.options();
            merged.merge_missing(options);
            merged
        };
        options.insert_default(
            OPTION_DEFAULT_UDP_PORT,
            self.config.connection.default_udp_port.to_string(),
        );
        options.insert_default(OPTION_SO_REUSE, self.config.connection.so_reuse.to_string());

        let (codec, endpoint) = self.codecs.get_or_create(transport, &url, &options).await?;
        info!(
            url = %url,
            local = %endpoint.local,
            remote = %endpoint.remote,
            "Connection established"
        );

        Ok(Connection {
            codec,
            endpoint,
            url,
            options,
            transactions: Arc::clone(&self.transactions),
        })
    }

    /// Discover devices on the local networks. `callback` runs once per
    /// discovered address; probe failures are logged and counted.
    pub async fn discover<C>(
        &self,
        cancel: &CancellationToken,
        callback: C,
        filter: &DiscoveryFilter,
    ) -> Result<DiscoverySummary, DriverError>
    where
        C: FnMut(DiscoveryItem),
    {
        self.ensure_open()?;
        self.discoverer.discover(cancel, filter, callback).await
    }

    /// Discover devices on explicit `(interface, subnet)` targets
    pub async fn discover_targets<C>(
        &self,
        cancel: &CancellationToken,
        callback: C,
        targets: Vec<ScanTarget>,
    ) -> Result<DiscoverySummary, DriverError>
    where
        C: FnMut(DiscoveryItem),
    {
        self.ensure_open()?;
        Ok(self.discoverer.discover_targets(cancel, targets, callback).await)
    }

    /// Close the discoverer and the transaction manager. Both are attempted;
    /// every failure is reported.
    pub fn close(&self) -> Result<(), DriverError> {
        let guard = start_watchdog("closing driver", &self.config.watchdog);

        self.closed.store(true, Ordering::SeqCst);
        let mut failures = Vec::new();

        if let Err(e) = self.discoverer.close() {
            warn!(error = %e, "Error closing discoverer");
            failures.push(ShutdownFailure::Discoverer(e));
        }
        if let Err(e) = self.transactions.close() {
            warn!(error = %e, "Error closing transaction manager");
            failures.push(ShutdownFailure::TransactionManager(e));
        }

        if let Some(guard) = guard {
            let report = guard.finish();
            debug!(elapsed = ?report.elapsed, warnings = report.warnings, "Driver closed");
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(DriverError::Shutdown(failures))
        }
    }
}
