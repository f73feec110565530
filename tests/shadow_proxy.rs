//! Shadow proxy against a loopback HTTP upstream.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use http::{Method, Request, Response, StatusCode};
use shadowgate::persistence::{MemoryStore, TraceSource};
use shadowgate::proxy::{Behaviour, LocalApp, StaticResolver};
use shadowgate::{Gateway, GatewayConfig};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

const CLOUD_HOST: &str = "www.besmart-home.com";

struct LocalBody {
    routes: Vec<&'static str>,
    body: &'static str,
}

#[async_trait::async_trait]
impl LocalApp for LocalBody {
    fn route_exists(&self, path: &str, _method: &Method) -> bool {
        self.routes.iter().any(|route| *route == path)
    }

    async fn handle(&self, _request: Request<Bytes>) -> Response<Bytes> {
        Response::new(Bytes::from_static(self.body.as_bytes()))
    }
}

/// Minimal HTTP/1.1 server answering every request with `body`. Paths
/// starting with `/slow` are answered after half a second.
async fn serve(body: &'static str) -> anyhow::Result<(u16, Arc<Mutex<Vec<String>>>)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let log = seen.clone();

    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let log = log.clone();
            tokio::spawn(async move {
                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => request.extend_from_slice(&buf[..n]),
                    }
                }
                let text = String::from_utf8_lossy(&request);
                let line = text.lines().next().unwrap_or_default().to_string();
                let slow = line.starts_with("GET /slow");
                log.lock().unwrap().push(line);
                if slow {
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = stream.write_all(response.as_bytes()).await;
            });
        }
    });

    Ok((port, seen))
}

async fn start_gateway(yaml: &str, upstream_port: u16, local: LocalBody) -> anyhow::Result<(Gateway, Arc<MemoryStore>)> {
    let _ = tracing_subscriber::fmt::try_init();

    let mut config = GatewayConfig::from_yaml(yaml)?;
    config.udp.listen = "127.0.0.1:0".parse()?;
    config.udp.cloud_host = "127.0.0.1".to_string();
    config.http.upstream_port = upstream_port;

    let store = Arc::new(MemoryStore::new());
    let resolver = StaticResolver::new().with_host(CLOUD_HOST, IpAddr::V4(Ipv4Addr::LOCALHOST));
    let gateway = Gateway::start_with_resolver(config, Arc::new(local), store.clone(), Arc::new(resolver)).await?;
    Ok((gateway, store))
}

fn get(path: &str, host: &str) -> Request<Bytes> {
    Request::get(path).header("host", host).body(Bytes::new()).unwrap()
}

#[tokio::test]
async fn local_first_disagreement_end_to_end() -> anyhow::Result<()> {
    let (port, seen) = serve("B").await?;
    let (gateway, store) = start_gateway("{}", port, LocalBody { routes: vec![], body: "A" }).await?;

    let response = gateway.proxy().call(get("/fwUpgrade/PR06549/version.txt", CLOUD_HOST)).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.body().as_ref(), b"A");

    let disagreements = store.disagreements();
    assert_eq!(disagreements.len(), 1);
    assert_eq!(disagreements[0].local_body.as_ref(), b"A");
    assert_eq!(disagreements[0].remote_body.as_ref(), b"B");
    assert_eq!(disagreements[0].uri, "/fwUpgrade/PR06549/version.txt");

    assert_eq!(seen.lock().unwrap().as_slice(), ["GET /fwUpgrade/PR06549/version.txt HTTP/1.1"]);

    let traces = store.traces();
    assert_eq!(traces.len(), 1);
    assert_eq!(traces[0].source, TraceSource::Http);
    assert_eq!(traces[0].host, CLOUD_HOST);
    assert_eq!(traces[0].status, "200");

    gateway.shutdown();
    Ok(())
}

#[tokio::test]
async fn missing_route_goes_to_upstream_only() -> anyhow::Result<()> {
    let (port, seen) = serve("from cloud").await?;
    let (gateway, store) = start_gateway("{}", port, LocalBody { routes: vec!["/known"], body: "local" }).await?;

    assert_eq!(gateway.proxy().behaviour_for(&Method::GET, "/index.html"), Behaviour::OnlyRemote);
    let response = gateway.proxy().call(get("/index.html?lang=it", CLOUD_HOST)).await;
    assert_eq!(response.body().as_ref(), b"from cloud");
    assert_eq!(seen.lock().unwrap().as_slice(), ["GET /index.html?lang=it HTTP/1.1"]);
    assert!(store.disagreements().is_empty());
    gateway.shutdown();

    // Same body on both sides is not a disagreement
    let (port, _) = serve("local").await?;
    let (gateway, store) = start_gateway("{}", port, LocalBody { routes: vec!["/known"], body: "local" }).await?;
    let response = gateway.proxy().call(get("/known", CLOUD_HOST)).await;
    assert_eq!(response.body().as_ref(), b"local");
    assert!(store.disagreements().is_empty());

    gateway.shutdown();
    Ok(())
}

#[tokio::test]
async fn unreachable_upstream() -> anyhow::Result<()> {
    let closed_port = {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        listener.local_addr()?.port()
    };
    let (gateway, store) = start_gateway("{}", closed_port, LocalBody { routes: vec![], body: "local" }).await?;

    let response = gateway.proxy().call(get("/unknown", CLOUD_HOST)).await;
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

    let response = gateway.proxy().call(get("/fwUpgrade/PR06549/version.txt", CLOUD_HOST)).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.body().as_ref(), b"local");

    let statuses: Vec<_> = store.traces().into_iter().map(|trace| trace.status).collect();
    assert_eq!(statuses, ["502", "200"]);
    assert!(store.disagreements().is_empty());

    gateway.shutdown();
    Ok(())
}

#[tokio::test]
async fn local_hosts_bypass_the_proxy() -> anyhow::Result<()> {
    let (port, seen) = serve("B").await?;
    let (gateway, store) = start_gateway("{}", port, LocalBody { routes: vec![], body: "A" }).await?;

    for host in ["localhost:8080", "127.0.0.1", "thermo-besim"] {
        let response = gateway.proxy().call(get("/fwUpgrade/PR06549/version.txt", host)).await;
        assert_eq!(response.body().as_ref(), b"A");
    }
    assert!(seen.lock().unwrap().is_empty());
    assert!(store.traces().is_empty());

    gateway.shutdown();
    Ok(())
}

#[tokio::test]
async fn configured_rules_take_precedence() -> anyhow::Result<()> {
    let (port, _) = serve("B").await?;
    let yaml = "http:\n  rules:\n    - { pattern: '/fwUpgrade/.*', behaviour: ONLY_REMOTE }\n";
    let (gateway, store) = start_gateway(yaml, port, LocalBody { routes: vec![], body: "A" }).await?;

    let response = gateway.proxy().call(get("/fwUpgrade/PR06549/version.txt", CLOUD_HOST)).await;
    assert_eq!(response.body().as_ref(), b"B");
    assert!(store.disagreements().is_empty());
    assert_eq!(gateway.proxy().policy().rules()[0].pattern(), "/fwUpgrade/.*");

    gateway.shutdown();
    Ok(())
}

#[tokio::test]
async fn slow_upstream_does_not_hold_up_the_same_host() -> anyhow::Result<()> {
    let (port, seen) = serve("B").await?;
    let (gateway, _) = start_gateway("{}", port, LocalBody { routes: vec![], body: "A" }).await?;
    let proxy = gateway.proxy();

    let started = Instant::now();
    let (slow, fast) = tokio::join!(
        async {
            let response = proxy.call(get("/slow", CLOUD_HOST)).await;
            (response, Instant::now())
        },
        async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let response = proxy.call(get("/fast", CLOUD_HOST)).await;
            (response, Instant::now())
        }
    );

    assert_eq!(slow.0.body().as_ref(), b"B");
    assert_eq!(fast.0.body().as_ref(), b"B");
    assert!(fast.1 < slow.1);
    assert!(fast.1.duration_since(started) < Duration::from_millis(400));
    assert_eq!(seen.lock().unwrap().len(), 2);

    gateway.shutdown();
    Ok(())
}
