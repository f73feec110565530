//! HTTP shadow proxy
//!
//! [`ShadowProxy`] sits in front of the local reimplementation of the vendor
//! web API. For each request the [`PolicyTable`] decides whether the local
//! app, the real upstream service, or both answer it. When both answer, the
//! bodies are compared and any difference is recorded as a
//! [`DisagreementRecord`].
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use bytes::Bytes;
//! use http::{Method, Request, Response};
//! use shadowgate::persistence::MemoryStore;
//! use shadowgate::proxy::{HttpUpstream, LocalApp, PolicyTable, ShadowProxy, StaticResolver};
//!
//! struct Hello;
//!
//! #[async_trait::async_trait]
//! impl LocalApp for Hello {
//!     fn route_exists(&self, path: &str, _method: &Method) -> bool {
//!         path == "/hello"
//!     }
//!     async fn handle(&self, _request: Request<Bytes>) -> Response<Bytes> {
//!         Response::new(Bytes::from_static(b"hi"))
//!     }
//! }
//!
//! # async fn run() -> shadowgate::Result<()> {
//! let upstream = HttpUpstream::new(Arc::new(StaticResolver::new()), 80, Duration::from_secs(300));
//! let proxy = ShadowProxy::new(
//!     Arc::new(Hello),
//!     Arc::new(upstream),
//!     PolicyTable::with_defaults(false)?,
//!     Arc::new(MemoryStore::new()),
//! )?;
//! let response = proxy.call(Request::get("/hello").header("host", "www.example.com").body(Bytes::new()).unwrap()).await;
//! # Ok(())
//! # }
//! ```

mod policy;
mod upstream;

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use chrono::Utc;
use http::{Method, Request, Response, StatusCode};
use regex::{Regex, RegexBuilder};
use tracing::{debug, info, warn};

use crate::capture::CaptureSink;
use crate::persistence::{self, DisagreementRecord, Persistence, TraceRecord, TraceSource};
use crate::{GatewayError, Result};

pub use policy::{
    Behaviour, DEVICES_PATTERN, PolicyRule, PolicyTable, VERSION_PATTERN, WEB_TEMPERATURE_PATTERN,
};
pub use upstream::{
    ConnectionPool, HttpUpstream, Lease, NameserverResolver, PooledClient, Resolve, StaticResolver,
    Upstream, request_host,
};

/// Hosts that address the gateway itself and bypass the proxy.
pub const DEFAULT_LOCAL_HOSTS: &str = r"((\w+-besim\w?)|(127\.\d+\.\d+\.\d+)|(localhost.*))(:\d+)?";

/// The local reimplementation of the web API.
#[async_trait::async_trait]
pub trait LocalApp: Send + Sync {
    /// Whether the app has a handler for `method path`.
    fn route_exists(&self, path: &str, method: &Method) -> bool;

    async fn handle(&self, request: Request<Bytes>) -> Response<Bytes>;
}

pub struct ShadowProxy {
    local: Arc<dyn LocalApp>,
    upstream: Arc<dyn Upstream>,
    policy: PolicyTable,
    local_hosts: Regex,
    persistence: Arc<dyn Persistence>,
    capture: Option<Arc<CaptureSink>>,
}

impl ShadowProxy {
    pub fn new(
        local: Arc<dyn LocalApp>,
        upstream: Arc<dyn Upstream>,
        policy: PolicyTable,
        persistence: Arc<dyn Persistence>,
    ) -> Result<Self> {
        Ok(Self {
            local,
            upstream,
            policy,
            local_hosts: compile_hosts(DEFAULT_LOCAL_HOSTS)?,
            persistence,
            capture: None,
        })
    }

    /// Replace the pattern for hosts that bypass the proxy.
    pub fn with_local_hosts(mut self, pattern: &str) -> Result<Self> {
        self.local_hosts = compile_hosts(pattern)?;
        Ok(self)
    }

    pub fn with_capture(mut self, capture: Arc<CaptureSink>) -> Self {
        self.capture = Some(capture);
        self
    }

    pub fn policy(&self) -> &PolicyTable {
        &self.policy
    }

    /// Whether `host` addresses the gateway itself.
    pub fn is_local_host(&self, host: &str) -> bool {
        self.local_hosts.is_match(host)
    }

    /// Behaviour for a request after route lookup. Never returns
    /// [`Behaviour::RemoteIfMissing`].
    pub fn behaviour_for(&self, method: &Method, uri: &str) -> Behaviour {
        match self.policy.behaviour_for(uri) {
            Behaviour::RemoteIfMissing => {
                let path = uri.split('?').next().unwrap_or(uri);
                if self.local.route_exists(path, method) {
                    Behaviour::LocalFirst
                } else {
                    warn!("Method {} {} doesn't exist locally, forcing ONLY_REMOTE", method, uri);
                    Behaviour::OnlyRemote
                }
            }
            behaviour => behaviour,
        }
    }

    /// Answer one request.
    pub async fn call(&self, request: Request<Bytes>) -> Response<Bytes> {
        let host = request
            .headers()
            .get(http::header::HOST)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();
        if self.is_local_host(&host) {
            debug!("{} is local, not proxied", host);
            return self.local.handle(request).await;
        }

        let started = Instant::now();
        let method = request.method().clone();
        let uri = request.uri().path_and_query().map(|p| p.as_str().to_string()).unwrap_or_else(|| "/".to_string());
        let behaviour = self.behaviour_for(&method, &uri);
        info!("{} {} {}", method, uri, behaviour);
        self.capture("REQ", &host, &format!("{} {} {}", method, uri, String::from_utf8_lossy(request.body())))
            .await;

        let response = match behaviour {
            Behaviour::OnlyLocal => self.local.handle(request).await,
            behaviour if behaviour.compares() => self.shadow(request, behaviour, &uri).await,
            _ => match self.upstream.forward(&request).await {
                Ok(response) => response,
                Err(e) => bad_gateway(&e),
            },
        };

        self.capture(
            "RESP",
            &host,
            &format!("{} {}", response.status().as_u16(), String::from_utf8_lossy(response.body())),
        )
        .await;

        let record = TraceRecord {
            timestamp: Utc::now(),
            source: TraceSource::Http,
            host,
            uri,
            elapsed_ms: started.elapsed().as_millis() as u64,
            status: response.status().as_u16().to_string(),
        };
        persistence::report("log_trace", self.persistence.log_trace(record).await);

        response
    }

    /// Consult both sides, compare, and return the primary answer.
    async fn shadow(&self, request: Request<Bytes>, behaviour: Behaviour, uri: &str) -> Response<Bytes> {
        let method = request.method().to_string();
        let local_request = duplicate(&request);
        let (local, remote) = tokio::join!(self.local.handle(local_request), self.upstream.forward(&request));

        let remote = match remote {
            Ok(remote) => remote,
            Err(e) => {
                warn!("Upstream failed for {} {}: {}", method, uri, e);
                return if behaviour.remote_primary() { bad_gateway(&e) } else { local };
            }
        };

        if local.body() != remote.body() {
            warn!(
                "Response from upstream and local differ Cloud=\"{}\" Local=\"{}\"",
                String::from_utf8_lossy(remote.body()),
                String::from_utf8_lossy(local.body())
            );
            let record = DisagreementRecord {
                timestamp: Utc::now(),
                method,
                uri: uri.to_string(),
                behaviour: behaviour.name().to_string(),
                local_body: local.body().clone(),
                remote_body: remote.body().clone(),
            };
            persistence::report("log_disagreement", self.persistence.log_disagreement(record).await);
        }

        if behaviour.remote_primary() { remote } else { local }
    }

    async fn capture(&self, direction: &str, host: &str, text: &str) {
        if let Some(capture) = &self.capture {
            if let Err(e) = capture.record(direction, host, text).await {
                warn!("HTTP capture failed: {}", e);
            }
        }
    }
}

fn compile_hosts(pattern: &str) -> Result<Regex> {
    Ok(RegexBuilder::new(&format!("^(?:{})", pattern)).case_insensitive(true).build()?)
}

fn duplicate(request: &Request<Bytes>) -> Request<Bytes> {
    let mut copy = Request::new(request.body().clone());
    *copy.method_mut() = request.method().clone();
    *copy.uri_mut() = request.uri().clone();
    *copy.version_mut() = request.version();
    *copy.headers_mut() = request.headers().clone();
    copy
}

fn bad_gateway(error: &GatewayError) -> Response<Bytes> {
    let mut response = Response::new(Bytes::from(error.to_string()));
    *response.status_mut() = StatusCode::BAD_GATEWAY;
    response
}
