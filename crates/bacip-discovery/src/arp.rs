//! ARP-based host discovery
//!
//! Ping can be filtered by a firewall, but an IP host has to answer ARP. We
//! broadcast one ARP request per subnet host and treat every reply as a live
//! device. Replies are read on a blocking thread for as long as the capture
//! stays open (the cleanup delay after the last request).

use pnet::datalink::{DataLinkReceiver, DataLinkSender, MacAddr};
use pnet::packet::arp::{ArpHardwareTypes, ArpOperations, ArpPacket, MutableArpPacket};
use pnet::packet::ethernet::{EtherTypes, EthernetPacket, MutableEthernetPacket};
use pnet::packet::{MutablePacket, Packet};
use std::io;
use std::net::Ipv4Addr;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::capture::{CaptureDevice, CaptureError, CaptureProvider};
use crate::probe::ProbeContext;
use crate::scanner::{panic_message, Discovered, ProbeFailure, ProbeMethod, ScanTarget};
use crate::subnet::Subnet;

/// Ethernet header (14) + ARP for IPv4 over Ethernet (28)
pub const ARP_FRAME_LEN: usize = 42;

#[derive(Error, Debug)]
pub enum ProbeError {
    #[error(transparent)]
    Capture(#[from] CaptureError),
    #[error("failed to build ARP frame")]
    FrameBuild,
    #[error("failed to write ARP request for {target} on {device}: {source}")]
    Write {
        device: String,
        target: Ipv4Addr,
        #[source]
        source: io::Error,
    },
    #[error("capture on {0} cannot send frames")]
    SendUnsupported(String),
    #[error("ARP writer on {device} panicked: {message}")]
    WriterPanicked { device: String, message: String },
    #[error("scan cancelled")]
    Cancelled,
}

/// Serialize a broadcast ARP request asking who has `target`
pub fn arp_request(
    source_mac: MacAddr,
    source_ip: Ipv4Addr,
    target: Ipv4Addr,
) -> Result<[u8; ARP_FRAME_LEN], ProbeError> {
    let mut frame = [0u8; ARP_FRAME_LEN];
    {
        let mut ethernet = MutableEthernetPacket::new(&mut frame).ok_or(ProbeError::FrameBuild)?;
        ethernet.set_destination(MacAddr::broadcast());
        ethernet.set_source(source_mac);
        ethernet.set_ethertype(EtherTypes::Arp);

        let mut arp = MutableArpPacket::new(ethernet.payload_mut()).ok_or(ProbeError::FrameBuild)?;
        arp.set_hardware_type(ArpHardwareTypes::Ethernet);
        arp.set_protocol_type(EtherTypes::Ipv4);
        arp.set_hw_addr_len(6);
        arp.set_proto_addr_len(4);
        arp.set_operation(ArpOperations::Request);
        arp.set_sender_hw_addr(source_mac);
        arp.set_sender_proto_addr(source_ip);
        arp.set_target_hw_addr(MacAddr::zero());
        arp.set_target_proto_addr(target);
    }
    Ok(frame)
}

/// Sender address of an ARP reply not originating from `local_mac`
pub fn parse_arp_reply(frame: &[u8], local_mac: MacAddr) -> Option<Ipv4Addr> {
    let ethernet = EthernetPacket::new(frame)?;
    if ethernet.get_ethertype() != EtherTypes::Arp {
        return None;
    }
    let arp = ArpPacket::new(ethernet.payload())?;
    if arp.get_operation() != ArpOperations::Reply || arp.get_sender_hw_addr() == local_mac {
        return None;
    }
    Some(arp.get_sender_proto_addr())
}

/// Probe one subnet with ARP.
///
/// Returns once every request is written. The capture stays open for the
/// cleanup delay afterwards on a task that owns the context, so the scan's
/// stream does not close before late replies are in.
pub async fn probe_arp(
    capture: &dyn CaptureProvider,
    device: CaptureDevice,
    target: &ScanTarget,
    ctx: &ProbeContext,
) -> Result<usize, ProbeError> {
    debug!(
        interface = %target.interface,
        device = %device.name,
        subnet = %target.subnet,
        "Scanning for alive IP addresses using ARP"
    );

    let handle = capture.open(&device, ctx.settings.capture_poll_interval)?;
    let stop = ctx.cancel.child_token();
    let runtime = tokio::runtime::Handle::current();

    let reader = {
        let ctx = ctx.clone();
        let stop = stop.clone();
        let interface = Arc::clone(&target.interface);
        let local_mac = device.mac;
        let rx = handle.rx;
        tokio::task::spawn_blocking(move || {
            read_replies(rx, local_mac, interface, ctx, stop, runtime)
        })
    };

    let writer = {
        let device = device.clone();
        let subnet = target.subnet;
        let cancel = ctx.cancel.clone();
        let tx = handle.tx;
        tokio::task::spawn_blocking(move || write_requests(tx, &device, subnet, &cancel))
    };

    let written = match writer.await {
        Ok(result) => result,
        Err(e) => Err(ProbeError::WriterPanicked {
            device: device.name.clone(),
            message: panic_message(e),
        }),
    };

    // Close the capture after the cleanup delay, or right away on cancellation
    let cleanup_ctx = ctx.clone();
    let cleanup_target = target.clone();
    tokio::spawn(async move {
        // Stops the reader even if this task is dropped with the runtime
        let _stop_reader = stop.clone().drop_guard();
        tokio::select! {
            _ = tokio::time::sleep(cleanup_ctx.settings.arp_cleanup_delay) => {}
            _ = stop.cancelled() => {}
        }
        stop.cancel();
        if let Err(e) = reader.await {
            let message = panic_message(e);
            warn!(interface = %cleanup_target.interface, error = %message, "ARP reader panicked");
            let _ = cleanup_ctx.results.try_send(Discovered::Failure(ProbeFailure::Panicked {
                interface: cleanup_target.interface,
                subnet: cleanup_target.subnet,
                message,
            }));
        }
        trace!(device = %device.name, "Closed capture");
    });

    match &written {
        Ok(count) => debug!(interface = %target.interface, requests = count, "Sent ARP requests"),
        Err(ProbeError::Cancelled) => debug!(interface = %target.interface, "ARP scan cancelled"),
        Err(e) => warn!(interface = %target.interface, error = %e, "Error writing ARP packets"),
    }
    written
}

fn write_requests(
    mut tx: Box<dyn DataLinkSender>,
    device: &CaptureDevice,
    subnet: Subnet,
    cancel: &CancellationToken,
) -> Result<usize, ProbeError> {
    debug!(subnet = %subnet, "Sending ARP requests to all devices in network");
    let mut written = 0;
    for target in subnet.hosts() {
        if cancel.is_cancelled() {
            return Err(ProbeError::Cancelled);
        }
        let frame = arp_request(device.mac, device.address, target)?;
        match tx.send_to(&frame, None) {
            Some(Ok(())) => written += 1,
            Some(Err(source)) => {
                return Err(ProbeError::Write {
                    device: device.name.clone(),
                    target,
                    source,
                })
            }
            None => return Err(ProbeError::SendUnsupported(device.name.clone())),
        }
    }
    Ok(written)
}

fn read_replies(
    mut rx: Box<dyn DataLinkReceiver>,
    local_mac: MacAddr,
    interface: Arc<str>,
    ctx: ProbeContext,
    stop: CancellationToken,
    runtime: tokio::runtime::Handle,
) {
    while !stop.is_cancelled() && !ctx.results.is_closed() {
        match rx.next() {
            Ok(frame) => {
                if let Some(ip) = parse_arp_reply(frame, local_mac) {
                    trace!(ip = %ip, "Scheduling discovery for IP");
                    ctx.schedule_on(&runtime, &interface, ip, ProbeMethod::Arp);
                }
            }
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) => {}
            Err(e) => {
                debug!(interface = %interface, error = %e, "Capture read failed, stopping reader");
                break;
            }
        }
    }
    trace!(interface = %interface, "ARP reader stopped");
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::capture::CaptureHandle;
    use crate::probe::ProbeSettings;
    use pnet::datalink::NetworkInterface;
    use std::collections::{HashSet, VecDeque};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::mpsc;

    pub const LOCAL_MAC: MacAddr = MacAddr(0x02, 0, 0, 0, 0, 0x01);

    /// Serialize an ARP reply from `sender_mac`/`sender_ip`
    pub fn arp_reply(sender_mac: MacAddr, sender_ip: Ipv4Addr) -> Vec<u8> {
        let mut frame = arp_request(sender_mac, sender_ip, Ipv4Addr::new(192, 168, 50, 10))
            .unwrap()
            .to_vec();
        let mut ethernet = MutableEthernetPacket::new(&mut frame).unwrap();
        ethernet.set_destination(LOCAL_MAC);
        let mut arp = MutableArpPacket::new(ethernet.payload_mut()).unwrap();
        arp.set_operation(ArpOperations::Reply);
        arp.set_target_hw_addr(LOCAL_MAC);
        frame
    }

    pub struct FakeSender {
        pub frames: Arc<Mutex<Vec<Vec<u8>>>>,
        pub fail_after: Option<usize>,
    }

    impl DataLinkSender for FakeSender {
        fn build_and_send(
            &mut self,
            num_packets: usize,
            packet_size: usize,
            func: &mut dyn FnMut(&mut [u8]),
        ) -> Option<io::Result<()>> {
            for _ in 0..num_packets {
                let mut buf = vec![0u8; packet_size];
                func(&mut buf);
                if let Some(Err(e)) = self.send_to(&buf, None) {
                    return Some(Err(e));
                }
            }
            Some(Ok(()))
        }

        fn send_to(
            &mut self,
            packet: &[u8],
            _dst: Option<NetworkInterface>,
        ) -> Option<io::Result<()>> {
            let mut frames = self.frames.lock().unwrap();
            if self.fail_after.is_some_and(|limit| frames.len() >= limit) {
                return Some(Err(io::Error::new(io::ErrorKind::Other, "link down")));
            }
            frames.push(packet.to_vec());
            Some(Ok(()))
        }
    }

    pub struct FakeReceiver {
        pub pending: VecDeque<Vec<u8>>,
        pub current: Vec<u8>,
        pub poll: Duration,
    }

    impl DataLinkReceiver for FakeReceiver {
        fn next(&mut self) -> io::Result<&[u8]> {
            match self.pending.pop_front() {
                Some(frame) => {
                    self.current = frame;
                    Ok(&self.current)
                }
                None => {
                    std::thread::sleep(self.poll);
                    Err(io::Error::new(io::ErrorKind::TimedOut, "poll"))
                }
            }
        }
    }

    /// Capture provider scripted per test
    pub struct FakeCapture {
        pub device: Option<CaptureDevice>,
        pub fail_open: bool,
        pub replies: Vec<Vec<u8>>,
        pub fail_after: Option<usize>,
        pub frames: Arc<Mutex<Vec<Vec<u8>>>>,
        pub opened: AtomicUsize,
    }

    impl FakeCapture {
        pub fn new(address: Ipv4Addr) -> Self {
            Self {
                device: Some(CaptureDevice {
                    name: "fake0".to_string(),
                    mac: LOCAL_MAC,
                    address,
                }),
                fail_open: false,
                replies: Vec::new(),
                fail_after: None,
                frames: Arc::new(Mutex::new(Vec::new())),
                opened: AtomicUsize::new(0),
            }
        }
    }

    impl CaptureProvider for FakeCapture {
        fn find_device(&self, address: Ipv4Addr) -> Result<CaptureDevice, CaptureError> {
            self.device
                .clone()
                .filter(|d| d.address == address)
                .ok_or(CaptureError::DeviceNotFound(address))
        }

        fn open(
            &self,
            device: &CaptureDevice,
            poll_interval: Duration,
        ) -> Result<CaptureHandle, CaptureError> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            if self.fail_open {
                return Err(CaptureError::Open {
                    device: device.name.clone(),
                    source: io::Error::new(
                        io::ErrorKind::PermissionDenied,
                        "operation not permitted",
                    ),
                });
            }
            Ok(CaptureHandle {
                tx: Box::new(FakeSender {
                    frames: Arc::clone(&self.frames),
                    fail_after: self.fail_after,
                }),
                rx: Box::new(FakeReceiver {
                    pending: self.replies.iter().cloned().collect(),
                    current: Vec::new(),
                    poll: poll_interval,
                }),
            })
        }
    }

    pub fn fast_settings() -> ProbeSettings {
        ProbeSettings {
            delivery_timeout: Duration::from_secs(2),
            arp_cleanup_delay: Duration::from_millis(100),
            capture_poll_interval: Duration::from_millis(5),
        }
    }

    #[test]
    fn test_arp_request_layout() {
        let mac = MacAddr(0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff);
        let frame =
            arp_request(mac, Ipv4Addr::new(192, 168, 1, 10), Ipv4Addr::new(192, 168, 1, 77))
                .unwrap();
        assert_eq!(frame.len(), ARP_FRAME_LEN);

        let ethernet = EthernetPacket::new(&frame).unwrap();
        assert_eq!(ethernet.get_destination(), MacAddr::broadcast());
        assert_eq!(ethernet.get_source(), mac);
        assert_eq!(ethernet.get_ethertype(), EtherTypes::Arp);

        let arp = ArpPacket::new(ethernet.payload()).unwrap();
        assert_eq!(arp.get_hardware_type(), ArpHardwareTypes::Ethernet);
        assert_eq!(arp.get_protocol_type(), EtherTypes::Ipv4);
        assert_eq!(arp.get_hw_addr_len(), 6);
        assert_eq!(arp.get_proto_addr_len(), 4);
        assert_eq!(arp.get_operation(), ArpOperations::Request);
        assert_eq!(arp.get_sender_proto_addr(), Ipv4Addr::new(192, 168, 1, 10));
        assert_eq!(arp.get_target_hw_addr(), MacAddr::zero());
        assert_eq!(arp.get_target_proto_addr(), Ipv4Addr::new(192, 168, 1, 77));
    }

    #[test]
    fn test_parse_arp_reply_filters() {
        let remote = MacAddr(0x02, 0, 0, 0, 0, 0x42);
        let reply = arp_reply(remote, Ipv4Addr::new(192, 168, 50, 42));
        assert_eq!(parse_arp_reply(&reply, LOCAL_MAC), Some(Ipv4Addr::new(192, 168, 50, 42)));

        // Our own reply is ignored
        let own = arp_reply(LOCAL_MAC, Ipv4Addr::new(192, 168, 50, 10));
        assert_eq!(parse_arp_reply(&own, LOCAL_MAC), None);

        // Requests are not replies
        let request = arp_request(
            remote,
            Ipv4Addr::new(192, 168, 50, 42),
            Ipv4Addr::new(192, 168, 50, 1),
        )
        .unwrap();
        assert_eq!(parse_arp_reply(&request, LOCAL_MAC), None);

        // Truncated and non-ARP frames
        assert_eq!(parse_arp_reply(&reply[..20], LOCAL_MAC), None);
        let mut ipv4 = reply.clone();
        ipv4[12] = 0x08;
        ipv4[13] = 0x00;
        assert_eq!(parse_arp_reply(&ipv4, LOCAL_MAC), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_probe_arp_reports_repliers() {
        let local = Ipv4Addr::new(192, 168, 50, 10);
        let mut capture = FakeCapture::new(local);
        capture.replies = vec![
            arp_reply(MacAddr(0x02, 0, 0, 0, 0, 0x02), Ipv4Addr::new(192, 168, 50, 2)),
            arp_reply(LOCAL_MAC, local),
            arp_reply(MacAddr(0x02, 0, 0, 0, 0, 0x05), Ipv4Addr::new(192, 168, 50, 5)),
        ];
        let frames = Arc::clone(&capture.frames);
        let device = capture.find_device(local).unwrap();

        let (results, mut rx) = mpsc::channel(64);
        let ctx = ProbeContext {
            results,
            cancel: CancellationToken::new(),
            settings: fast_settings(),
        };
        let target = ScanTarget::new("eth0", Subnet::new(local, 29).unwrap());

        let written = probe_arp(&capture, device, &target, &ctx).await.unwrap();
        assert_eq!(written, 6);
        assert_eq!(frames.lock().unwrap().len(), 6);
        drop(ctx);

        let mut found = HashSet::new();
        let drained = tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(item) = rx.recv().await {
                if let Discovered::Host(host) = item {
                    assert_eq!(host.method, ProbeMethod::Arp);
                    found.insert(host.address);
                }
            }
        })
        .await;
        assert!(drained.is_ok(), "stream did not close after cleanup");
        assert_eq!(
            found,
            HashSet::from([Ipv4Addr::new(192, 168, 50, 2), Ipv4Addr::new(192, 168, 50, 5)])
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_write_failure_aborts_probe() {
        let local = Ipv4Addr::new(10, 1, 1, 1);
        let mut capture = FakeCapture::new(local);
        capture.fail_after = Some(2);
        let device = capture.find_device(local).unwrap();

        let (results, mut rx) = mpsc::channel(64);
        let ctx = ProbeContext {
            results,
            cancel: CancellationToken::new(),
            settings: fast_settings(),
        };
        let target = ScanTarget::new("eth1", Subnet::new(local, 24).unwrap());

        let result = probe_arp(&capture, device, &target, &ctx).await;
        assert!(matches!(
            result,
            Err(ProbeError::Write { target, .. }) if target == Ipv4Addr::new(10, 1, 1, 3)
        ));
        assert_eq!(capture.frames.lock().unwrap().len(), 2);

        // The capture still closes after the cleanup delay
        drop(ctx);
        let closed = tokio::time::timeout(Duration::from_secs(5), async {
            while rx.recv().await.is_some() {}
        })
        .await;
        assert!(closed.is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_open_failure_is_reported() {
        let local = Ipv4Addr::new(10, 1, 1, 1);
        let mut capture = FakeCapture::new(local);
        capture.fail_open = true;
        let device = capture.find_device(local).unwrap();

        let (results, _rx) = mpsc::channel(4);
        let ctx = ProbeContext {
            results,
            cancel: CancellationToken::new(),
            settings: fast_settings(),
        };
        let target = ScanTarget::new("eth1", Subnet::new(local, 24).unwrap());

        let result = probe_arp(&capture, device, &target, &ctx).await;
        assert!(matches!(result, Err(ProbeError::Capture(CaptureError::Open { .. }))));
    }
}
