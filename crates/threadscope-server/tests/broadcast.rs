//! End-to-end tests: real sampler, real axum server, tungstenite viewers.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use threadscope_core::{FallbackProvider, Sampler, SamplerConfig, SystemSnapshot};
use threadscope_server::{Hub, ServerConfig, SessionConfig, build_router};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

type Viewer = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<TcpStream>,
>;

struct TestServer {
    addr: SocketAddr,
    sampler: Sampler,
    hub: Hub,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl TestServer {
    async fn start(interval_ms: u64) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();

        let sampler = Sampler::new(
            Arc::new(FallbackProvider::new()),
            SamplerConfig::default().with_interval(Duration::from_millis(interval_ms)),
        );
        let hub = Hub::new(SessionConfig::default(), shutdown.child_token());
        hub.spawn_dispatch(sampler.subscribe());
        sampler.start().unwrap();

        let app = build_router(sampler.clone(), hub.clone());
        let signal = shutdown.clone();
        let task = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { signal.cancelled().await })
                .await
                .unwrap();
        });

        Self {
            addr,
            sampler,
            hub,
            shutdown,
            task,
        }
    }

    async fn connect(&self) -> Viewer {
        let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{}/ws", self.addr))
            .await
            .unwrap();
        ws
    }

    async fn stop(self) {
        self.shutdown.cancel();
        self.sampler.shutdown().await;
        timeout(Duration::from_secs(5), self.task)
            .await
            .expect("server stops")
            .unwrap();
    }
}

async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(3);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn next_snapshot(ws: &mut Viewer) -> SystemSnapshot {
    loop {
        let msg = timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("snapshot within 2s")
            .expect("stream open")
            .unwrap();
        if msg.is_text() {
            return serde_json::from_str(msg.to_text().unwrap()).unwrap();
        }
    }
}

async fn http_get(addr: SocketAddr, path: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!("GET {path} HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    response
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn closing_two_of_three_viewers_leaves_one_receiving() {
    let server = TestServer::start(25).await;

    let mut a = server.connect().await;
    let mut b = server.connect().await;
    let mut c = server.connect().await;
    wait_until("three sessions", || server.hub.session_count() == 3).await;

    for ws in [&mut a, &mut b, &mut c] {
        let snap = next_snapshot(ws).await;
        assert!(snap.seq >= 1);
        assert!(snap.units_approximate);
    }

    let (ra, rb) = tokio::join!(a.close(None), b.close(None));
    ra.unwrap();
    rb.unwrap();
    wait_until("one session left", || server.hub.session_count() == 1).await;

    let produced = server.sampler.produced();
    let mut last = next_snapshot(&mut c).await.seq;
    while last <= produced + 2 {
        let snap = next_snapshot(&mut c).await;
        assert_eq!(snap.seq, last + 1, "gap in the surviving stream");
        last = snap.seq;
    }
    assert_eq!(server.hub.session_count(), 1);

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn plain_get_on_ws_route_is_rejected_without_registering() {
    let server = TestServer::start(50).await;

    let response = http_get(server.addr, "/ws").await;
    assert!(response.starts_with("HTTP/1.1 4"), "{response}");
    assert_eq!(server.hub.session_count(), 0);
    assert_eq!(server.hub.accepted(), 0);

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn health_reports_sampler_and_sessions() {
    let server = TestServer::start(20).await;
    let _viewer = server.connect().await;
    wait_until("session", || server.hub.session_count() == 1).await;
    wait_until("snapshots", || server.sampler.produced() > 0).await;

    let response = http_get(server.addr, "/health").await;
    assert!(response.starts_with("HTTP/1.1 200"), "{response}");
    let body = response.split("\r\n\r\n").nth(1).unwrap();
    let health: serde_json::Value = serde_json::from_str(body).unwrap();
    assert_eq!(health["status"], "healthy");
    assert_eq!(health["sampler"], "running");
    assert_eq!(health["sessions"], 1);
    assert_eq!(health["interval_ms"], 20);
    assert!(health["snapshots_produced"].as_u64().unwrap() > 0);

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_closes_open_viewers() {
    let server = TestServer::start(20).await;
    let mut viewer = server.connect().await;
    next_snapshot(&mut viewer).await;

    let hub = server.hub.clone();
    server.stop().await;
    assert!(hub.is_shutting_down());
    wait_until("sessions drained", || hub.session_count() == 0).await;

    // Remaining frames drain, then the stream ends with a close.
    let ended = timeout(Duration::from_secs(3), async {
        while let Some(Ok(msg)) = viewer.next().await {
            if let Message::Close(_) = msg {
                return true;
            }
        }
        true
    })
    .await
    .expect("viewer stream ends");
    assert!(ended);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn serve_runs_until_cancelled() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    let mut config = ServerConfig::default();
    config.sampler = config.sampler.with_interval(Duration::from_millis(20));

    let server = tokio::spawn(threadscope_server::serve(
        listener,
        Arc::new(FallbackProvider::new()),
        config,
        shutdown.clone(),
    ));

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws"))
        .await
        .unwrap();
    let first = next_snapshot(&mut ws).await;
    let second = next_snapshot(&mut ws).await;
    assert!(second.seq > first.seq);

    shutdown.cancel();
    timeout(Duration::from_secs(5), server)
        .await
        .expect("serve returns after cancel")
        .unwrap()
        .unwrap();
}
