//! bacip Driver - BACnet/IP connection establishment and discovery
//!
//! The [`Driver`] owns everything that outlives a single call: the transport
//! registry, the per-endpoint codec cache, the discoverer and the
//! transaction manager.

pub mod config;
pub mod driver;

pub use config::{load_config, Config, ConfigError};
pub use driver::{
    Connection, Discoverer, DiscovererError, DiscoveryItem, DiscoverySummary, Driver, DriverError,
    RequestTransactionManager, ShutdownFailure, TransactionError, TransactionManager,
    TransportRegistry, PROTOCOL_CODE, PROTOCOL_NAME,
};
