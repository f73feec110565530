//! Upstream HTTP forwarding
//!
//! Upstream hosts are resolved through a [`Resolve`] implementation rather
//! than the system resolver, since on the gateway's network the vendor
//! hostnames point back at the gateway itself. Each resolved host gets a
//! client pinned to its address, cached in a [`ConnectionPool`] with one async
//! lock per host.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use hickory_resolver::TokioAsyncResolver;
use hickory_resolver::config::{NameServerConfigGroup, ResolverConfig, ResolverOpts};
use http::header::{CONNECTION, CONTENT_LENGTH, HOST, TRANSFER_ENCODING};
use http::{HeaderMap, Request, Response};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};

use crate::{GatewayError, Result};

const DNS_PORT: u16 = 53;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Hostname to address lookup.
#[async_trait]
pub trait Resolve: Send + Sync {
    async fn resolve(&self, host: &str) -> Result<IpAddr>;
}

/// Resolver that asks one specific nameserver for IPv4 addresses.
pub struct NameserverResolver {
    nameserver: IpAddr,
    resolver: TokioAsyncResolver,
}

impl NameserverResolver {
    pub fn new(nameserver: IpAddr) -> Self {
        let group = NameServerConfigGroup::from_ips_clear(&[nameserver], DNS_PORT, true);
        let config = ResolverConfig::from_parts(None, Vec::new(), group);
        let resolver = TokioAsyncResolver::tokio(config, ResolverOpts::default());
        Self { nameserver, resolver }
    }

    pub fn nameserver(&self) -> IpAddr {
        self.nameserver
    }
}

#[async_trait]
impl Resolve for NameserverResolver {
    async fn resolve(&self, host: &str) -> Result<IpAddr> {
        let lookup = self.resolver.lookup_ip(host).await.map_err(|e| {
            GatewayError::upstream_unavailable_with_source(
                host,
                format!("lookup via {} failed", self.nameserver),
                Box::new(e),
            )
        })?;
        let address = lookup
            .iter()
            .find(IpAddr::is_ipv4)
            .ok_or_else(|| GatewayError::upstream_unavailable(host, "no A record"))?;
        debug!("Resolved {} to {} via {}", host, address, self.nameserver);
        Ok(address)
    }
}

/// Fixed host table, for tests and offline setups.
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    hosts: HashMap<String, IpAddr>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_host(mut self, host: &str, address: IpAddr) -> Self {
        self.hosts.insert(host.to_ascii_lowercase(), address);
        self
    }
}

#[async_trait]
impl Resolve for StaticResolver {
    async fn resolve(&self, host: &str) -> Result<IpAddr> {
        self.hosts
            .get(&host.to_ascii_lowercase())
            .copied()
            .ok_or_else(|| GatewayError::upstream_unavailable(host, "not in static host table"))
    }
}

/// Client pinned to one upstream address.
#[derive(Debug, Clone)]
pub struct PooledClient {
    client: reqwest::Client,
    address: SocketAddr,
    created: Instant,
}

impl PooledClient {
    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    fn is_stale(&self, max_age: Duration) -> bool {
        self.created.elapsed() > max_age
    }
}

type Slot = Arc<tokio::sync::Mutex<Option<PooledClient>>>;

/// Exclusive use of a host's client until released.
pub struct Lease {
    host: String,
    slot: OwnedMutexGuard<Option<PooledClient>>,
}

impl Lease {
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn client(&self) -> Option<&PooledClient> {
        self.slot.as_ref()
    }
}

/// Per-host cache of resolved clients.
pub struct ConnectionPool {
    slots: Mutex<HashMap<String, Slot>>,
    max_age: Duration,
}

impl ConnectionPool {
    pub fn new(max_age: Duration) -> Self {
        Self { slots: Mutex::new(HashMap::new()), max_age }
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn slot(&self, host: &str) -> Slot {
        self.slots().entry(host.to_string()).or_default().clone()
    }

    /// Lock the host's slot, resolving and building a client if the slot is
    /// empty or stale.
    pub async fn acquire(&self, host: &str, port: u16, resolver: &dyn Resolve) -> Result<Lease> {
        let mut slot = self.slot(host).lock_owned().await;

        if slot.as_ref().is_some_and(|client| client.is_stale(self.max_age)) {
            debug!("Evicting stale upstream client for {}", host);
            *slot = None;
        }

        if slot.is_none() {
            let address = SocketAddr::new(resolver.resolve(host).await?, port);
            let client = reqwest::Client::builder()
                .resolve(host, address)
                .no_proxy()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .map_err(|e| {
                    GatewayError::upstream_unavailable_with_source(host, "client setup failed", Box::new(e))
                })?;
            info!("Upstream connection for {} is {}", host, address);
            *slot = Some(PooledClient { client, address, created: Instant::now() });
        }

        Ok(Lease { host: host.to_string(), slot })
    }

    /// Return a lease. An unhealthy lease evicts the client.
    pub fn release(&self, mut lease: Lease, healthy: bool) {
        if !healthy {
            debug!("Evicting upstream client for {} after failure", lease.host);
            *lease.slot = None;
        }
    }

    /// Drop the cached client for `host` if it is still `failed`. A client
    /// rebuilt since `failed` was taken is kept.
    pub async fn evict(&self, host: &str, failed: &PooledClient) {
        let Some(slot) = self.slots().get(host).cloned() else {
            return;
        };
        let mut slot = slot.lock().await;
        if slot.as_ref().is_some_and(|cached| cached.created == failed.created) {
            debug!("Evicting upstream client for {} after failure", host);
            *slot = None;
        }
    }

    /// Whether a client is cached for `host`. Returns false while the host is
    /// leased.
    pub fn is_cached(&self, host: &str) -> bool {
        let Some(slot) = self.slots().get(host).cloned() else {
            return false;
        };
        let cached = match slot.try_lock() {
            Ok(guard) => guard.is_some(),
            Err(_) => false,
        };
        cached
    }

    pub fn len(&self) -> usize {
        self.slots().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots().is_empty()
    }
}

/// Forwarder to the real service.
#[async_trait]
pub trait Upstream: Send + Sync {
    async fn forward(&self, request: &Request<Bytes>) -> Result<Response<Bytes>>;
}

/// [`Upstream`] over plain HTTP with pooled, pre-resolved clients.
pub struct HttpUpstream {
    resolver: Arc<dyn Resolve>,
    pool: ConnectionPool,
    port: u16,
}

impl HttpUpstream {
    pub fn new(resolver: Arc<dyn Resolve>, port: u16, max_age: Duration) -> Self {
        Self { resolver, pool: ConnectionPool::new(max_age), port }
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }
}

/// Host of a request, without the port.
pub fn request_host(request: &Request<Bytes>) -> Option<String> {
    let host = request
        .headers()
        .get(HOST)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .or_else(|| request.uri().host().map(str::to_string))?;
    let host = match host.rsplit_once(':') {
        Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name.to_string(),
        _ => host,
    };
    Some(host)
}

fn forwarded_headers(headers: &HeaderMap) -> HeaderMap {
    let mut headers = headers.clone();
    for name in [HOST, CONTENT_LENGTH, CONNECTION, TRANSFER_ENCODING] {
        headers.remove(name);
    }
    headers
}

#[async_trait]
impl Upstream for HttpUpstream {
    async fn forward(&self, request: &Request<Bytes>) -> Result<Response<Bytes>> {
        let host = request_host(request)
            .ok_or_else(|| GatewayError::upstream_unavailable("<none>", "request has no host"))?;
        let path = request.uri().path_and_query().map(|p| p.as_str()).unwrap_or("/");
        let url = format!("http://{}:{}{}", host, self.port, path);

        // The slot is held only while picking the client
        let lease = self.pool.acquire(&host, self.port, self.resolver.as_ref()).await?;
        let Some(pooled) = lease.client().cloned() else {
            self.pool.release(lease, false);
            return Err(GatewayError::invariant("acquired lease without a client"));
        };
        self.pool.release(lease, true);

        let sent = pooled
            .client()
            .request(request.method().clone(), &url)
            .headers(forwarded_headers(request.headers()))
            .body(request.body().clone())
            .send()
            .await;

        let upstream = match sent {
            Ok(upstream) => upstream,
            Err(e) => {
                warn!("Upstream {} {} failed: {}", request.method(), url, e);
                self.pool.evict(&host, &pooled).await;
                return Err(GatewayError::upstream_unavailable_with_source(host, "request failed", Box::new(e)));
            }
        };

        let status = upstream.status();
        let headers = upstream.headers().clone();
        let body = match upstream.bytes().await {
            Ok(body) => body,
            Err(e) => {
                self.pool.evict(&host, &pooled).await;
                return Err(GatewayError::upstream_unavailable_with_source(host, "body read failed", Box::new(e)));
            }
        };

        let mut response = Response::new(body);
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        Ok(response)
    }
}
