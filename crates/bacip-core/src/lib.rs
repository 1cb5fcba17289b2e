//! bacip Core - Shared types for the BACnet/IP connection and discovery layer
//!
//! This crate provides the pieces every other bacip crate leans on:
//! - Connection option multimap and the well-known option keys
//! - Transport URL parsing (`udp://host[:port][?options]`)
//! - A stall watchdog that warns while a scoped operation is still running

pub mod options;
pub mod url;
pub mod watchdog;

pub use options::{DriverOptions, OptionError, BACNET_UDP_DEFAULT_PORT};
pub use url::{TransportUrl, UrlError};
pub use watchdog::{Watchdog, WatchdogError, WatchdogGuard, WatchdogReport};
