//! End-to-end proxy tests: mock agent, real backend server, real sockets.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{Message as WsMessage, WebSocketUpgrade};
use axum::response::Response;
use axum::routing::{any, get};
use axum::Router;
use futures::{SinkExt, StreamExt};

use sandpiper_broker::testing::MockAgent;
use sandpiper_broker::{Broker, BrokerConfig, ProcessState};
use sandpiper_proxy::{AppDirectory, AppProxy, AppRecord, ProxyConfig, ProxyServer};

struct StaticDirectory {
    apps: HashMap<String, AppRecord>,
}

#[async_trait]
impl AppDirectory for StaticDirectory {
    async fn app_by_name(&self, name: &str) -> anyhow::Result<Option<AppRecord>> {
        Ok(self.apps.get(name).cloned())
    }
}

fn app1_record() -> AppRecord {
    AppRecord {
        id: "app1-id".to_string(),
        name: "app1".to_string(),
        worktree_id: "w1".to_string(),
        start_cmd: "npm start".to_string(),
        env: vec![],
    }
}

async fn spawn_backend() -> SocketAddr {
    let router = Router::new()
        .route("/", get(|| async { "hello from app1" }))
        .route("/ws", any(ws_echo));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind backend");
    let addr = listener.local_addr().expect("backend addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.ok();
    });
    addr
}

async fn ws_echo(ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(|mut socket| async move {
        while let Some(Ok(msg)) = socket.next().await {
            if let WsMessage::Text(text) = msg {
                if socket.send(WsMessage::Text(text)).await.is_err() {
                    break;
                }
            }
        }
    })
}

/// Wires mock agent + broker + directory + proxy server and returns the
/// proxy's bound address.
async fn spawn_proxy(agent: &MockAgent, ready_timeout: Duration) -> SocketAddr {
    let broker = Broker::connect(&[agent.endpoint()], BrokerConfig::default())
        .await
        .expect("broker connect");

    let mut apps = HashMap::new();
    apps.insert("app1".to_string(), app1_record());
    let directory = Arc::new(StaticDirectory { apps });

    let proxy = AppProxy::new(
        broker,
        directory,
        ProxyConfig {
            app_domain_label: "sandpiper".to_string(),
            ready_timeout,
        },
    );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind proxy");
    let addr = listener.local_addr().expect("proxy addr");
    let server = ProxyServer::new(proxy);
    tokio::spawn(async move {
        server.serve(listener).await.ok();
    });
    addr
}

fn client_for(proxy: SocketAddr) -> reqwest::Client {
    reqwest::Client::builder()
        .resolve("app1.sandpiper.com", proxy)
        .resolve("app2.sandpiper.com", proxy)
        .resolve("example.com", proxy)
        .build()
        .expect("reqwest client")
}

#[tokio::test]
async fn request_is_forwarded_once_the_app_runs() {
    let backend = spawn_backend().await;
    let agent = MockAgent::spawn().await;
    agent.set_app_endpoint(backend.to_string());
    agent.set_run_delay(Duration::from_millis(200));

    let proxy = spawn_proxy(&agent, Duration::from_secs(10)).await;
    let client = client_for(proxy);

    let resp = client
        .get(format!("http://app1.sandpiper.com:{}/", proxy.port()))
        .send()
        .await
        .expect("proxy request");
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.text().await.expect("body"), "hello from app1");

    // The app process was configured on the way in.
    assert!(agent.configure_count() >= 1);
}

#[tokio::test]
async fn non_app_hosts_are_rejected() {
    let agent = MockAgent::spawn().await;
    let proxy = spawn_proxy(&agent, Duration::from_secs(1)).await;
    let client = client_for(proxy);

    let resp = client
        .get(format!("http://example.com:{}/", proxy.port()))
        .send()
        .await
        .expect("request");
    assert_eq!(resp.status(), 404);
    assert_eq!(agent.open_count(), 0);
}

#[tokio::test]
async fn unknown_apps_get_404_without_a_sandbox() {
    let agent = MockAgent::spawn().await;
    let proxy = spawn_proxy(&agent, Duration::from_secs(1)).await;
    let client = client_for(proxy);

    let resp = client
        .get(format!("http://app2.sandpiper.com:{}/", proxy.port()))
        .send()
        .await
        .expect("request");
    assert_eq!(resp.status(), 404);
    assert_eq!(agent.open_count(), 0);
}

#[tokio::test]
async fn an_app_that_never_starts_times_out_to_404() {
    let agent = MockAgent::spawn().await;
    // No run delay configured: the state stays NOT_RUNNING forever.
    let proxy = spawn_proxy(&agent, Duration::from_millis(300)).await;
    let client = client_for(proxy);

    let resp = client
        .get(format!("http://app1.sandpiper.com:{}/", proxy.port()))
        .send()
        .await
        .expect("request");
    assert_eq!(resp.status(), 404);
    assert_eq!(agent.open_count(), 1);
}

#[tokio::test]
async fn a_finished_app_is_404() {
    let agent = MockAgent::spawn().await;
    agent.set_app_state(ProcessState::Finished);

    let proxy = spawn_proxy(&agent, Duration::from_secs(5)).await;
    let client = client_for(proxy);

    let resp = client
        .get(format!("http://app1.sandpiper.com:{}/", proxy.port()))
        .send()
        .await
        .expect("request");
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn websocket_traffic_is_tunnelled_through() {
    let backend = spawn_backend().await;
    let agent = MockAgent::spawn().await;
    agent.set_app_endpoint(backend.to_string());
    agent.set_run_delay(Duration::from_millis(100));

    let proxy = spawn_proxy(&agent, Duration::from_secs(10)).await;

    let stream = tokio::net::TcpStream::connect(proxy)
        .await
        .expect("connect proxy");
    let (mut ws, _resp) = tokio_tungstenite::client_async("ws://app1.sandpiper.com/ws", stream)
        .await
        .expect("websocket handshake");

    ws.send(tokio_tungstenite::tungstenite::Message::Text(
        "ping across the tunnel".to_string(),
    ))
    .await
    .expect("send frame");

    let echoed = ws.next().await.expect("frame").expect("frame ok");
    assert_eq!(
        echoed,
        tokio_tungstenite::tungstenite::Message::Text("ping across the tunnel".to_string())
    );
}
