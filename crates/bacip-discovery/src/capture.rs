//! Raw packet capture capability
//!
//! ARP probing needs a live datalink channel, which depends on platform
//! support and privileges (CAP_NET_RAW on Linux). The scanner asks a
//! [`CaptureProvider`] for the [`Capability`] of each interface and falls
//! back to IP probing when capture is unavailable.

use pnet::datalink::{self, Channel, DataLinkReceiver, DataLinkSender, MacAddr};
use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, trace};

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("no capture device found for address {0}")]
    DeviceNotFound(Ipv4Addr),
    #[error("capture device {0} has no hardware address")]
    NoHardwareAddress(String),
    #[error("failed to open capture on {device}: {source}")]
    Open {
        device: String,
        #[source]
        source: io::Error,
    },
    #[error("capture on {0} is not an ethernet channel")]
    UnsupportedChannel(String),
}

/// A capture-capable device matched to a local interface address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureDevice {
    pub name: String,
    pub mac: MacAddr,
    pub address: Ipv4Addr,
}

/// An open capture. Exclusively owned by the probing call that opened it;
/// dropping both halves closes the underlying socket.
pub struct CaptureHandle {
    pub tx: Box<dyn DataLinkSender>,
    pub rx: Box<dyn DataLinkReceiver>,
}

/// Whether ARP probing is possible on an interface
#[derive(Debug)]
pub enum Capability {
    ArpCapable(CaptureDevice),
    Unavailable(CaptureError),
}

pub trait CaptureProvider: Send + Sync + 'static {
    /// Find the capture device that carries `address`
    fn find_device(&self, address: Ipv4Addr) -> Result<CaptureDevice, CaptureError>;

    /// Open a promiscuous capture. Reads wake up every `poll_interval` so the
    /// reader can observe a stop request; a wake-up is not an error.
    fn open(
        &self,
        device: &CaptureDevice,
        poll_interval: Duration,
    ) -> Result<CaptureHandle, CaptureError>;

    fn capability(&self, address: Ipv4Addr) -> Capability {
        match self.find_device(address) {
            Ok(device) => Capability::ArpCapable(device),
            Err(e) => Capability::Unavailable(e),
        }
    }
}

/// Capture backed by pnet datalink channels
#[derive(Debug, Clone, Copy, Default)]
pub struct PnetCapture;

impl CaptureProvider for PnetCapture {
    fn find_device(&self, address: Ipv4Addr) -> Result<CaptureDevice, CaptureError> {
        let interfaces = datalink::interfaces();
        trace!(count = interfaces.len(), "Enumerated capture devices");

        let iface = interfaces
            .into_iter()
            .find(|iface| iface.ips.iter().any(|net| net.ip() == IpAddr::V4(address)))
            .ok_or(CaptureError::DeviceNotFound(address))?;

        let mac = iface
            .mac
            .filter(|mac| *mac != MacAddr::zero())
            .ok_or_else(|| CaptureError::NoHardwareAddress(iface.name.clone()))?;

        debug!(device = %iface.name, mac = %mac, ip = %address, "Matched capture device");
        Ok(CaptureDevice {
            name: iface.name,
            mac,
            address,
        })
    }

    fn open(
        &self,
        device: &CaptureDevice,
        poll_interval: Duration,
    ) -> Result<CaptureHandle, CaptureError> {
        let iface = datalink::interfaces()
            .into_iter()
            .find(|iface| iface.name == device.name)
            .ok_or(CaptureError::DeviceNotFound(device.address))?;

        let config = datalink::Config {
            promiscuous: true,
            read_timeout: Some(poll_interval),
            ..Default::default()
        };

        match datalink::channel(&iface, config) {
            Ok(Channel::Ethernet(tx, rx)) => Ok(CaptureHandle { tx, rx }),
            Ok(_) => Err(CaptureError::UnsupportedChannel(device.name.clone())),
            Err(source) => Err(CaptureError::Open {
                device: device.name.clone(),
                source,
            }),
        }
    }
}
