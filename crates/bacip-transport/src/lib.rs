//! bacip Transport - UDP transport and shared BVLC codecs
//!
//! Connections are keyed by the local endpoint they route out of; every
//! connection through one local address shares a single codec.

pub mod cache;
pub mod endpoint;
pub mod transport;

pub use cache::{BvlcCodecFactory, CodecCache, CodecError, CodecFactory};
pub use endpoint::EndpointIdentity;
pub use transport::{decode_bvlc, encode_bvlc, BvlcCodec, BvlcError, BvlcFunction, UdpTransport};
