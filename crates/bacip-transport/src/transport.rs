//! UDP transport and BVLC framing for BACnet/IP

use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::SocketAddr;
use thiserror::Error;
use tokio::net::UdpSocket;
use tracing::{debug, trace};

use crate::endpoint::EndpointIdentity;

/// BVLC type octet for BACnet/IP
pub const BVLC_TYPE_BACNET_IP: u8 = 0x81;

/// BVLC header length
pub const BVLC_HEADER_LEN: usize = 4;

/// B/IP address carried by Forwarded-NPDU (IPv4 + port)
const BIP_ADDRESS_LEN: usize = 6;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BvlcError {
    #[error("frame too short: {0} bytes")]
    TooShort(usize),
    #[error("not a BACnet/IP frame (type {0:#04x})")]
    WrongType(u8),
    #[error("length field {declared} does not match frame length {actual}")]
    LengthMismatch { declared: u16, actual: usize },
    #[error("payload of {0} bytes does not fit a BVLC frame")]
    TooLong(usize),
}

/// BVLC functions the codec sends or unwraps
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BvlcFunction {
    ForwardedNpdu,
    OriginalUnicastNpdu,
    OriginalBroadcastNpdu,
    Other(u8),
}

impl BvlcFunction {
    pub fn code(self) -> u8 {
        match self {
            BvlcFunction::ForwardedNpdu => 0x04,
            BvlcFunction::OriginalUnicastNpdu => 0x0A,
            BvlcFunction::OriginalBroadcastNpdu => 0x0B,
            BvlcFunction::Other(code) => code,
        }
    }
}

impl From<u8> for BvlcFunction {
    fn from(code: u8) -> Self {
        match code {
            0x04 => BvlcFunction::ForwardedNpdu,
            0x0A => BvlcFunction::OriginalUnicastNpdu,
            0x0B => BvlcFunction::OriginalBroadcastNpdu,
            other => BvlcFunction::Other(other),
        }
    }
}

/// Prefix `npdu` with a BVLC header
pub fn encode_bvlc(function: BvlcFunction, npdu: &[u8]) -> Result<Vec<u8>, BvlcError> {
    let total = BVLC_HEADER_LEN + npdu.len();
    let length = u16::try_from(total).map_err(|_| BvlcError::TooLong(npdu.len()))?;

    let mut frame = Vec::with_capacity(total);
    frame.push(BVLC_TYPE_BACNET_IP);
    frame.push(function.code());
    frame.extend_from_slice(&length.to_be_bytes());
    frame.extend_from_slice(npdu);
    Ok(frame)
}

/// Split a frame into its function and NPDU. Forwarded-NPDU frames have the
/// originating B/IP address stripped.
pub fn decode_bvlc(frame: &[u8]) -> Result<(BvlcFunction, &[u8]), BvlcError> {
    if frame.len() < BVLC_HEADER_LEN {
        return Err(BvlcError::TooShort(frame.len()));
    }
    if frame[0] != BVLC_TYPE_BACNET_IP {
        return Err(BvlcError::WrongType(frame[0]));
    }
    let function = BvlcFunction::from(frame[1]);
    let declared = u16::from_be_bytes([frame[2], frame[3]]);
    if declared as usize != frame.len() {
        return Err(BvlcError::LengthMismatch {
            declared,
            actual: frame.len(),
        });
    }

    let body = &frame[BVLC_HEADER_LEN..];
    match function {
        BvlcFunction::ForwardedNpdu if body.len() < BIP_ADDRESS_LEN => {
            Err(BvlcError::TooShort(frame.len()))
        }
        BvlcFunction::ForwardedNpdu => Ok((function, &body[BIP_ADDRESS_LEN..])),
        _ => Ok((function, body)),
    }
}

/// UDP transport (`udp://` URLs)
#[derive(Debug, Clone, Copy, Default)]
pub struct UdpTransport;

impl UdpTransport {
    pub const CODE: &'static str = "udp";

    /// Bind a broadcast-capable socket, optionally with SO_REUSEADDR/SO_REUSEPORT
    pub fn bind(&self, local: SocketAddr, reuse: bool) -> io::Result<UdpSocket> {
        let socket = Socket::new(Domain::for_address(local), Type::DGRAM, Some(Protocol::UDP))?;

        if reuse {
            socket.set_reuse_address(true)?;
            #[cfg(unix)]
            socket.set_reuse_port(true)?;
        }
        socket.set_broadcast(true)?;
        socket.bind(&local.into())?;
        socket.set_nonblocking(true)?;

        debug!(local = %local, reuse, "Bound UDP socket");
        UdpSocket::from_std(socket.into())
    }
}

/// Shared BVLC codec for one local endpoint. All connections through that
/// endpoint send and receive through this socket.
#[derive(Debug)]
pub struct BvlcCodec {
    socket: UdpSocket,
    local: SocketAddr,
    remote: SocketAddr,
    mtu: usize,
}

impl BvlcCodec {
    /// Bind the codec socket on the endpoint's local address
    pub fn bind(
        transport: &UdpTransport,
        endpoint: &EndpointIdentity,
        reuse: bool,
    ) -> io::Result<Self> {
        let socket = transport.bind(endpoint.local, reuse)?;
        let local = socket.local_addr()?;
        Ok(Self {
            socket,
            local,
            remote: endpoint.remote,
            mtu: 1500,
        })
    }

    /// Actual bound address (differs from the endpoint when bound to port 0)
    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Remote the codec was created for
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    /// Original-Unicast-NPDU to `destination`
    pub async fn send_to(&self, npdu: &[u8], destination: SocketAddr) -> io::Result<()> {
        self.send_frame(BvlcFunction::OriginalUnicastNpdu, npdu, destination).await
    }

    /// Original-Broadcast-NPDU to a (directed) broadcast address
    pub async fn broadcast(&self, npdu: &[u8], broadcast: SocketAddr) -> io::Result<()> {
        self.send_frame(BvlcFunction::OriginalBroadcastNpdu, npdu, broadcast).await
    }

    async fn send_frame(
        &self,
        function: BvlcFunction,
        npdu: &[u8],
        destination: SocketAddr,
    ) -> io::Result<()> {
        let frame = encode_bvlc(function, npdu)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        trace!(
            local = %self.local,
            destination = %destination,
            function = ?function,
            len = frame.len(),
            "Sending BVLC frame"
        );
        self.socket.send_to(&frame, destination).await?;
        Ok(())
    }

    /// Receive the next valid frame. Frames that are not BACnet/IP are
    /// skipped.
    pub async fn recv(&self) -> io::Result<(BvlcFunction, Vec<u8>, SocketAddr)> {
        let mut buf = vec![0u8; self.mtu];
        loop {
            let (len, from) = self.socket.recv_from(&mut buf).await?;
            match decode_bvlc(&buf[..len]) {
                Ok((function, npdu)) => {
                    trace!(from = %from, function = ?function, len, "Received BVLC frame");
                    return Ok((function, npdu.to_vec(), from));
                }
                Err(e) => debug!(from = %from, error = %e, "Dropping invalid BVLC frame"),
            }
        }
    }
}

impl std::fmt::Display for BvlcCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "BvlcCodec({} -> {})", self.local, self.remote)
    }
}
