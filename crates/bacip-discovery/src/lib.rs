//! bacip Discovery - Active discovery of BACnet/IP devices
//!
//! This crate turns local subnets into a stream of candidate addresses:
//! - ARP probing where raw capture is available (live hosts only)
//! - IP probing as a fallback (every subnet host is a candidate)
//! - A scanner that runs both per interface and merges their results

pub mod arp;
pub mod capture;
pub mod probe;
pub mod scanner;
pub mod subnet;

pub use arp::ProbeError;
pub use capture::{
    Capability, CaptureDevice, CaptureError, CaptureHandle, CaptureProvider, PnetCapture,
};
pub use probe::ProbeSettings;
pub use scanner::{
    local_targets, scan_budget, Discovered, DiscoveredHost, DiscoveryError, DiscoveryFilter,
    DiscoveryScanner, DiscoveryStream, ProbeFailure, ProbeMethod, ScanTarget, ScannerConfig,
};
pub use subnet::{HostIter, Subnet, SubnetError};
