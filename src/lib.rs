//! Shadow-verification gateway for a proprietary thermostat protocol.
//!
//! The gateway sits between thermostats and their vendor cloud. It decodes the
//! binary UDP protocol in both directions, keeps a model of every device and
//! room, and can answer devices itself. Alongside it an HTTP shadow proxy
//! sends selected web API requests to both a local reimplementation and the
//! real service and records where they disagree.
//!
//! # Layout
//!
//! - [`codec`]: frame, wrapper and field-level encoding
//! - [`dispatch`]: per-opcode handling, replies and state updates
//! - [`rendezvous`]: command sequence correlation
//! - [`relay`]: the UDP socket loop, RELAY and DIRECT modes
//! - [`proxy`]: HTTP policy table, upstream pool and shadow comparison
//! - [`persistence`], [`capture`]: where observations go
//! - [`config`], [`logging`]: startup
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use bytes::Bytes;
//! use http::{Method, Request, Response};
//! use shadowgate::{Gateway, GatewayConfig};
//! use shadowgate::persistence::MemoryStore;
//! use shadowgate::proxy::LocalApp;
//!
//! struct NotImplemented;
//!
//! #[async_trait::async_trait]
//! impl LocalApp for NotImplemented {
//!     fn route_exists(&self, _path: &str, _method: &Method) -> bool {
//!         false
//!     }
//!     async fn handle(&self, _request: Request<Bytes>) -> Response<Bytes> {
//!         Response::new(Bytes::new())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> shadowgate::Result<()> {
//!     let config = GatewayConfig::load("shadowgate.yaml").await?;
//!     shadowgate::logging::init(&config.log_level);
//!
//!     let gateway = Gateway::start(config, Arc::new(NotImplemented), Arc::new(MemoryStore::new())).await?;
//!     println!("UDP on {}", gateway.udp().local_addr());
//!     gateway.udp().cancellation_token().cancelled().await;
//!     Ok(())
//! }
//! ```

pub mod capture;
pub mod codec;
pub mod config;
pub mod dispatch;
mod error;
pub mod logging;
pub mod persistence;
pub mod proxy;
pub mod relay;
pub mod rendezvous;
pub mod state;
#[cfg_attr(any(test, feature = "benchmark"), path = "test_utils.rs")]
#[cfg(any(test, feature = "benchmark"))]
pub mod test_utils;

pub use error::*;

pub use config::GatewayConfig;
pub use relay::GatewayHandle;
pub use rendezvous::CommandReply;

use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::Arc;

use tracing::{info, warn};

use crate::capture::CaptureSink;
use crate::codec::SetAttribute;
use crate::dispatch::Dispatcher;
use crate::persistence::Persistence;
use crate::proxy::{HttpUpstream, LocalApp, NameserverResolver, Resolve, ShadowProxy};
use crate::relay::{RelayController, RelaySettings};
use crate::rendezvous::Rendezvous;

/// A running gateway: the UDP controller plus the HTTP shadow proxy.
///
/// The proxy is not bound to a listener; the embedding HTTP server calls
/// [`ShadowProxy::call`] for each request it receives.
pub struct Gateway {
    config: GatewayConfig,
    udp: GatewayHandle,
    proxy: ShadowProxy,
    persistence: Arc<dyn Persistence>,
}

impl Gateway {
    /// Start every component from `config`, resolving upstream hosts through
    /// the configured nameserver. Records older than the retention window are
    /// purged once at startup; long-running embedders call
    /// [`Gateway::purge_expired`] periodically.
    pub async fn start(
        config: GatewayConfig,
        local: Arc<dyn LocalApp>,
        persistence: Arc<dyn Persistence>,
    ) -> Result<Self> {
        let resolver = Arc::new(NameserverResolver::new(config.upstream_dns));
        Self::start_with_resolver(config, local, persistence, resolver).await
    }

    /// Like [`Gateway::start`] with a caller-provided resolver.
    pub async fn start_with_resolver(
        config: GatewayConfig,
        local: Arc<dyn LocalApp>,
        persistence: Arc<dyn Persistence>,
        resolver: Arc<dyn Resolve>,
    ) -> Result<Self> {
        config.validate()?;

        let cloud_ip = match config.udp.cloud_host.parse::<IpAddr>() {
            Ok(ip) => ip,
            Err(_) => resolver.resolve(&config.udp.cloud_host).await?,
        };
        let cloud = SocketAddr::new(cloud_ip, config.udp.cloud_port);

        let upstream = HttpUpstream::new(resolver, config.http.upstream_port, config.pool_max_age());
        let mut proxy =
            ShadowProxy::new(local, Arc::new(upstream), config.policy_table()?, persistence.clone())?
                .with_local_hosts(&config.http.local_hosts)?;
        if let Some(sink) = open_capture(config.capture.http.as_deref()).await? {
            proxy = proxy.with_capture(sink);
        }

        let udp_capture = open_capture(config.capture.udp.as_deref()).await?;
        let dispatcher = Dispatcher::new(Rendezvous::new(), persistence.clone());
        let settings = RelaySettings {
            listen: config.udp.listen,
            cloud,
            relay_upstream: config.udp.relay_upstream,
            decode_cloud: config.udp.decode_cloud,
        };
        let udp = RelayController::spawn(settings, dispatcher, persistence.clone(), udp_capture).await?;

        info!("Gateway started, {} proxy rules", proxy.policy().len());
        let gateway = Self { config, udp, proxy, persistence };
        if let Err(e) = gateway.purge_expired().await {
            warn!("Startup purge failed: {}", e);
        }
        Ok(gateway)
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn udp(&self) -> &GatewayHandle {
        &self.udp
    }

    pub fn proxy(&self) -> &ShadowProxy {
        &self.proxy
    }

    /// Send a SET command with the configured timeout.
    pub async fn send_command(
        &self,
        device_id: u32,
        room: u32,
        attribute: SetAttribute,
        value: u32,
    ) -> Result<CommandReply> {
        self.udp
            .send_command(device_id, room, attribute, value, self.config.command_timeout())
            .await
    }

    /// Drop records older than the retention window.
    pub async fn purge_expired(&self) -> Result<usize> {
        let removed = self.persistence.purge_older_than(self.config.retention_days).await?;
        info!("Purged {} records older than {} days", removed, self.config.retention_days);
        Ok(removed)
    }

    pub fn shutdown(&self) {
        self.udp.shutdown();
    }
}

async fn open_capture(path: Option<&Path>) -> Result<Option<Arc<CaptureSink>>> {
    match path {
        Some(path) => Ok(Some(Arc::new(CaptureSink::open(path).await?))),
        None => Ok(None),
    }
}
