//! Local endpoint identity for a remote device
//!
//! The local address the OS would route from, with its port replaced by the
//! remote port. Connections that resolve to the same identity share a codec.

use bacip_core::{DriverOptions, TransportUrl, BACNET_UDP_DEFAULT_PORT};
use bacip_core::options::OPTION_DEFAULT_UDP_PORT;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::net::UdpSocket;
use tracing::{debug, trace};

use crate::cache::CodecError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EndpointIdentity {
    pub local: SocketAddr,
    pub remote: SocketAddr,
}

impl EndpointIdentity {
    /// Resolve the remote of `url` and compute the local endpoint toward it.
    /// The URL port wins over the `default-udp-port` option, which wins over
    /// 47808.
    pub async fn resolve(url: &TransportUrl, options: &DriverOptions) -> Result<Self, CodecError> {
        let port = match url.port() {
            Some(port) => port,
            None => options
                .parse::<u16>(OPTION_DEFAULT_UDP_PORT)?
                .unwrap_or(BACNET_UDP_DEFAULT_PORT),
        };
        let address = url.host_port(port);

        let remote = tokio::net::lookup_host(address.as_str())
            .await
            .map_err(|source| CodecError::AddressResolution {
                address: address.clone(),
                source,
            })?
            .next()
            .ok_or_else(|| CodecError::AddressResolution {
                address: address.clone(),
                source: io::Error::new(io::ErrorKind::NotFound, "no addresses returned"),
            })?;
        trace!(address = %address, remote = %remote, "Resolved remote address");

        let local = local_endpoint(remote)
            .await
            .map_err(|source| CodecError::EndpointIdentity { remote, source })?;

        debug!(local = %local, remote = %remote, "Computed endpoint identity");
        Ok(Self { local, remote })
    }

    /// Cache key: the canonical local address
    pub fn key(&self) -> String {
        self.local.to_string()
    }
}

/// Ask the OS which local address routes to `remote` by connecting an
/// ephemeral datagram socket. Nothing is sent.
async fn local_endpoint(remote: SocketAddr) -> io::Result<SocketAddr> {
    let any: SocketAddr = if remote.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let socket = UdpSocket::bind(any).await?;
    socket.connect(remote).await?;
    let mut local = socket.local_addr()?;
    local.set_port(remote.port());
    Ok(local)
}
