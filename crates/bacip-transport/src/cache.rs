//! Endpoint codec cache
//!
//! At most one codec per local endpoint. Every connection that routes out of
//! the same local address shares it.

use bacip_core::options::OPTION_SO_REUSE;
use bacip_core::{DriverOptions, OptionError, TransportUrl};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, trace};

use crate::endpoint::EndpointIdentity;
use crate::transport::{BvlcCodec, UdpTransport};

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("failed to resolve remote address {address}: {source}")]
    AddressResolution {
        address: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to determine local endpoint toward {remote}: {source}")]
    EndpointIdentity {
        remote: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("failed to create codec for {local}: {source}")]
    Construction {
        local: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Option(#[from] OptionError),
}

/// Builds the codec for a newly seen endpoint
pub trait CodecFactory: Send + Sync + 'static {
    type Codec: Send + Sync + 'static;

    fn create(
        &self,
        transport: &UdpTransport,
        endpoint: &EndpointIdentity,
        options: &DriverOptions,
    ) -> io::Result<Self::Codec>;
}

/// Binds a [`BvlcCodec`] on the endpoint's local address, honoring `so-reuse`
#[derive(Debug, Clone, Copy, Default)]
pub struct BvlcCodecFactory;

impl CodecFactory for BvlcCodecFactory {
    type Codec = BvlcCodec;

    fn create(
        &self,
        transport: &UdpTransport,
        endpoint: &EndpointIdentity,
        options: &DriverOptions,
    ) -> io::Result<BvlcCodec> {
        let reuse = options
            .flag(OPTION_SO_REUSE)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?
            .unwrap_or(false);
        BvlcCodec::bind(transport, endpoint, reuse)
    }
}

pub struct CodecCache<F: CodecFactory = BvlcCodecFactory> {
    factory: F,
    codecs: Mutex<HashMap<String, Arc<F::Codec>>>,
}

impl CodecCache<BvlcCodecFactory> {
    pub fn new() -> Self {
        Self::with_factory(BvlcCodecFactory)
    }
}

impl Default for CodecCache<BvlcCodecFactory> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: CodecFactory> CodecCache<F> {
    pub fn with_factory(factory: F) -> Self {
        Self {
            factory,
            codecs: Mutex::new(HashMap::new()),
        }
    }

    /// Return the codec for the local endpoint `url` routes through, creating
    /// it on first use. The lock is held across resolution, lookup and
    /// construction so concurrent callers for one endpoint get one instance.
    pub async fn get_or_create(
        &self,
        transport: &UdpTransport,
        url: &TransportUrl,
        options: &DriverOptions,
    ) -> Result<(Arc<F::Codec>, EndpointIdentity), CodecError> {
        let mut codecs = self.codecs.lock().await;

        let endpoint = EndpointIdentity::resolve(url, options).await?;
        let key = endpoint.key();

        if let Some(codec) = codecs.get(&key) {
            trace!(local = %key, remote = %endpoint.remote, "Reusing codec");
            return Ok((Arc::clone(codec), endpoint));
        }

        let codec = self
            .factory
            .create(transport, &endpoint, options)
            .map(Arc::new)
            .map_err(|source| CodecError::Construction {
                local: endpoint.local,
                source,
            })?;

        debug!(local = %key, remote = %endpoint.remote, "Created codec");
        codecs.insert(key, Arc::clone(&codec));
        Ok((codec, endpoint))
    }

    pub async fn get(&self, key: &str) -> Option<Arc<F::Codec>> {
        self.codecs.lock().await.get(key).cloned()
    }

    pub async fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.codecs.lock().await.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub async fn len(&self) -> usize {
        self.codecs.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.codecs.lock().await.is_empty()
    }
}
