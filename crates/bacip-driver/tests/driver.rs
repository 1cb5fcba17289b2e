use bacip_core::options::OPTION_DEFAULT_UDP_PORT;
use bacip_core::DriverOptions;
use bacip_discovery::{
    CaptureDevice, CaptureError, CaptureHandle, CaptureProvider, ProbeMethod, ScanTarget,
};
use bacip_driver::{
    Config, DiscovererError, Driver, DriverError, RequestTransactionManager, ShutdownFailure,
    TransactionError, TransactionManager,
};
use bacip_transport::{CodecError, CodecFactory, EndpointIdentity, UdpTransport};
use std::collections::HashSet;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// No interface is capture capable, so every scan falls back to IP probing
struct NoCapture;

impl CaptureProvider for NoCapture {
    fn find_device(&self, address: Ipv4Addr) -> Result<CaptureDevice, CaptureError> {
        Err(CaptureError::DeviceNotFound(address))
    }

    fn open(
        &self,
        device: &CaptureDevice,
        _poll_interval: Duration,
    ) -> Result<CaptureHandle, CaptureError> {
        Err(CaptureError::DeviceNotFound(device.address))
    }
}

#[derive(Debug)]
struct RecordedCodec {
    local: SocketAddr,
}

#[derive(Default)]
struct RecordingFactory {
    created: Arc<AtomicUsize>,
}

impl CodecFactory for RecordingFactory {
    type Codec = RecordedCodec;

    fn create(
        &self,
        _transport: &UdpTransport,
        endpoint: &EndpointIdentity,
        _options: &DriverOptions,
    ) -> io::Result<RecordedCodec> {
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(RecordedCodec { local: endpoint.local })
    }
}

/// Transaction manager whose close always fails
#[derive(Default)]
struct StuckTransactions {
    closed: AtomicBool,
}

impl TransactionManager for StuckTransactions {
    fn close(&self) -> Result<(), TransactionError> {
        self.closed.store(true, Ordering::SeqCst);
        Err(TransactionError::Failed("transactions still pending".to_string()))
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

fn fast_config() -> Config {
    let mut config = Config::default();
    config.discovery.delivery_timeout_ms = 2000;
    config.discovery.arp_cleanup_delay_ms = 100;
    config.discovery.capture_poll_interval_ms = 5;
    config.watchdog.interval_ms = 50;
    config
}

fn test_driver(factory: RecordingFactory) -> Driver<RecordingFactory> {
    driver_with(fast_config(), factory)
}

fn driver_with(config: Config, factory: RecordingFactory) -> Driver<RecordingFactory> {
    Driver::with_components(
        config,
        factory,
        Arc::new(NoCapture),
        Arc::new(RequestTransactionManager::new(1)),
    )
}

#[tokio::test]
async fn test_connect_with_and_without_port_shares_codec() {
    let factory = RecordingFactory::default();
    let created = Arc::clone(&factory.created);
    let driver = test_driver(factory);

    let bare = driver.connect("udp://127.0.0.1", &DriverOptions::new()).await.unwrap();
    let explicit = driver
        .connect("udp://127.0.0.1:47808", &DriverOptions::new())
        .await
        .unwrap();

    assert!(Arc::ptr_eq(bare.codec(), explicit.codec()));
    assert_eq!(created.load(Ordering::SeqCst), 1);
    assert_eq!(bare.remote_addr(), "127.0.0.1:47808".parse::<SocketAddr>().unwrap());
    assert_eq!(bare.local_endpoint(), bare.codec().local);
    assert_eq!(bare.options().first("so-reuse"), Some("true"));
    assert_eq!(bare.options().first(OPTION_DEFAULT_UDP_PORT), Some("47808"));
}

#[tokio::test]
async fn test_connect_query_options_override_defaults() {
    let driver = test_driver(RecordingFactory::default());

    let mut caller = DriverOptions::new();
    caller.insert("so-reuse", "true");
    let conn = driver
        .connect("udp://127.0.0.1?default-udp-port=47810&so-reuse=false", &caller)
        .await
        .unwrap();

    assert_eq!(conn.remote_addr().port(), 47810);
    assert_eq!(conn.options().first("so-reuse"), Some("false"));
    assert_eq!(driver.codecs().keys().await, vec!["127.0.0.1:47810".to_string()]);
}

#[tokio::test]
async fn test_connect_rejects_unknown_transport_and_bad_urls() {
    let driver = test_driver(RecordingFactory::default());

    assert!(matches!(
        driver.connect("tcp://127.0.0.1:47808", &DriverOptions::new()).await,
        Err(DriverError::TransportNotFound(_))
    ));
    assert!(matches!(
        driver.connect("127.0.0.1:47808", &DriverOptions::new()).await,
        Err(DriverError::Url(_))
    ));

    let mut options = DriverOptions::new();
    options.insert(OPTION_DEFAULT_UDP_PORT, "huge");
    assert!(matches!(
        driver.connect("udp://127.0.0.1", &options).await,
        Err(DriverError::Codec(CodecError::Option(_)))
    ));
    assert!(driver.codecs().is_empty().await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_discover_reports_every_subnet_host() {
    let driver = test_driver(RecordingFactory::default());
    let targets = vec![ScanTarget::new("eth0", "10.20.30.0/24".parse().unwrap())];

    let mut items = Vec::new();
    let summary = tokio::time::timeout(
        Duration::from_secs(10),
        driver.discover_targets(&CancellationToken::new(), |item| items.push(item), targets),
    )
    .await
    .expect("discovery did not finish in time")
    .unwrap();

    assert_eq!(summary.hosts, 254);
    assert_eq!(summary.failures, 0);
    let urls: HashSet<_> = items.iter().map(|i| i.transport_url.clone()).collect();
    assert_eq!(urls.len(), 254);
    assert!(urls.contains("udp://10.20.30.1:47808"));
    assert!(!urls.contains("udp://10.20.30.0:47808"));
    assert!(!urls.contains("udp://10.20.30.255:47808"));
    assert!(items.iter().all(|i| i.method == ProbeMethod::Ip && i.transport_code == "udp"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancelled_discovery_ends_promptly() {
    // A small channel keeps most of the /16 unsent when the cancel lands
    let mut config = fast_config();
    config.discovery.channel_capacity = 8;
    let driver = driver_with(config, RecordingFactory::default());
    let targets = vec![ScanTarget::new("eth0", "10.0.0.0/16".parse().unwrap())];
    let cancel = CancellationToken::new();

    let mut seen = 0usize;
    let canceller = cancel.clone();
    let result = tokio::time::timeout(
        Duration::from_secs(5),
        driver.discover_targets(
            &cancel,
            |_| {
                seen += 1;
                if seen == 10 {
                    canceller.cancel();
                }
            },
            targets,
        ),
    )
    .await;

    let summary = result.expect("cancelled discovery did not end").unwrap();
    assert!(summary.hosts >= 10);
    assert!(summary.hosts < 65534);
}

#[tokio::test]
async fn test_close_joins_every_failure() {
    let driver = Driver::with_components(
        fast_config(),
        RecordingFactory::default(),
        Arc::new(NoCapture),
        Arc::new(StuckTransactions::default()),
    );

    // The discoverer closes cleanly; the stuck transaction manager does not
    match driver.close() {
        Err(DriverError::Shutdown(failures)) => {
            assert_eq!(
                failures,
                vec![ShutdownFailure::TransactionManager(TransactionError::Failed(
                    "transactions still pending".to_string()
                ))]
            );
        }
        other => panic!("unexpected close result: {:?}", other),
    }

    // Second close fails in both places and reports both
    match driver.close() {
        Err(DriverError::Shutdown(failures)) => {
            assert_eq!(failures.len(), 2);
            assert_eq!(
                failures[0],
                ShutdownFailure::Discoverer(DiscovererError::AlreadyClosed)
            );
            assert!(matches!(failures[1], ShutdownFailure::TransactionManager(_)));
        }
        other => panic!("unexpected close result: {:?}", other),
    }
}

#[tokio::test]
async fn test_closed_driver_rejects_calls() {
    let driver = test_driver(RecordingFactory::default());
    driver.close().unwrap();

    assert!(matches!(
        driver.connect("udp://127.0.0.1", &DriverOptions::new()).await,
        Err(DriverError::Closed)
    ));
    let targets = vec![ScanTarget::new("eth0", "10.0.0.0/30".parse().unwrap())];
    assert!(matches!(
        driver
            .discover_targets(&CancellationToken::new(), |_| {}, targets)
            .await,
        Err(DriverError::Closed)
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_slow_discovery_drain_is_watched() {
    let mut config = fast_config();
    config.watchdog.interval_ms = 10;
    let driver = driver_with(config, RecordingFactory::default());
    let targets = vec![ScanTarget::new("eth0", "10.1.2.0/28".parse().unwrap())];

    // 14 hosts at 10 ms each keeps the drain open well past the interval
    let summary = driver
        .discover_targets(
            &CancellationToken::new(),
            |_| std::thread::sleep(Duration::from_millis(10)),
            targets,
        )
        .await
        .unwrap();
    assert_eq!(summary.hosts, 14);
    assert!(summary.stall_warnings >= 3, "got {} warnings", summary.stall_warnings);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_quick_discovery_drain_stays_quiet() {
    let driver = test_driver(RecordingFactory::default());
    let targets = vec![ScanTarget::new("eth0", "10.1.2.0/30".parse().unwrap())];

    let summary = driver
        .discover_targets(&CancellationToken::new(), |_| {}, targets)
        .await
        .unwrap();
    assert_eq!(summary.hosts, 2);
    assert_eq!(summary.stall_warnings, 0);
}
