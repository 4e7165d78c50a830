//! End-to-end tests: HTTP server in front of a cache manager and a mock origin

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use clash_subconvert::{
    subscription_name, CacheManager, Configuration, ConvertError, ConverterRegistry, ManagerOptions,
    RequestHandler, SubscriptionFetcher, SubscriptionServer,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn vmess_link(name: &str) -> String {
    let json = format!(
        r#"{{"ps":"{}","add":"hk.example.com","port":443,"id":"u","net":"ws","path":"/ray","host":"cdn.example.com","tls":"tls"}}"#,
        name
    );
    format!("vmess://{}", STANDARD.encode(json))
}

struct TestServer {
    addr: SocketAddr,
    manager: Arc<CacheManager>,
    shutdown: CancellationToken,
    task: JoinHandle<clash_subconvert::Result<()>>,
}

impl TestServer {
    async fn start() -> Self {
        let manager = Arc::new(
            CacheManager::start(
                Arc::new(ConverterRegistry::with_defaults().unwrap()),
                Arc::new(SubscriptionFetcher::new().unwrap()),
                ManagerOptions::default(),
            )
            .await,
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = SubscriptionServer::new(RequestHandler::new(Arc::clone(&manager)), addr);
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(server.serve(listener, shutdown.clone()));

        TestServer {
            addr,
            manager,
            shutdown,
            task,
        }
    }

    fn url(&self, route: &str) -> String {
        format!("http://{}{}", self.addr, route)
    }

    async fn stop(self) {
        self.shutdown.cancel();
        self.task.await.unwrap().unwrap();
        self.manager.shutdown().await;
    }
}

async fn origin(body: String) -> MockServer {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/clash.txt"))
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .expect(1)
        .mount(&mock_server)
        .await;
    mock_server
}

#[tokio::test]
async fn test_config_download_registers_subscription() {
    let origin = origin(STANDARD.encode(vmess_link("hk-01"))).await;
    let server = TestServer::start().await;
    let client = reqwest::Client::new();

    let source = format!("{}/api/clash.txt", origin.uri());
    let response = client
        .get(server.url("/config"))
        .query(&[("name", "hk"), ("url", source.as_str())])
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers()["content-disposition"],
        "attachment; filename=\"Clash.yaml\""
    );
    let config = Configuration::from_yaml(&response.text().await.unwrap()).unwrap();
    assert_eq!(config.proxy_names(), vec!["hk-01"]);
    let proxy = &config.proxies[0];
    assert!(proxy.tls);
    assert_eq!(proxy.network, "ws");
    assert_eq!(proxy.ws_path, "/ray");
    assert_eq!(proxy.ws_headers["Host"], "cdn.example.com");

    // Served from cache, no second fetch
    let cached = client
        .get(server.url("/config?name=hk"))
        .send()
        .await
        .unwrap();
    assert_eq!(cached.status(), 200);
    assert!(cached.text().await.unwrap().contains("hk-01"));

    server.stop().await;
    origin.verify().await;
}

#[tokio::test]
async fn test_add_subscribe_returns_config_link() {
    let origin = origin(STANDARD.encode(vmess_link("jp-01"))).await;
    let server = TestServer::start().await;
    let client = reqwest::Client::new();

    let source = format!("{}/api/clash.txt", origin.uri());
    let body = serde_json::json!({
        "port": 7000,
        "socks_port": "7001",
        "allow_lan": true,
        "subscribe_input": source,
    });
    let response = client
        .post(server.url("/add-subscribe"))
        .header("content-type", "application/json")
        .body(body.to_string())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let name = subscription_name(&source);
    let link = response.text().await.unwrap();
    assert_eq!(link, format!("http://{}/config?name={}", server.addr, name));

    // Adding the same subscription again does not refetch
    let again = client
        .post(server.url("/add-subscribe"))
        .body(body.to_string())
        .send()
        .await
        .unwrap();
    assert_eq!(again.text().await.unwrap(), link);

    let config = Configuration::from_yaml(&client.get(&link).send().await.unwrap().text().await.unwrap())
        .unwrap();
    assert_eq!(config.port, 7000);
    assert_eq!(config.socks_port, 7001);
    assert!(config.allow_lan);
    assert_eq!(config.proxy_names(), vec!["jp-01"]);

    server.stop().await;
    origin.verify().await;
}

#[tokio::test]
async fn test_upstream_failure_maps_to_bad_gateway() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&mock_server)
        .await;
    let server = TestServer::start().await;

    let source = format!("{}/api/clash.txt", mock_server.uri());
    let response = reqwest::Client::new()
        .get(server.url("/config"))
        .query(&[("name", "down"), ("url", source.as_str())])
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 502);
    assert!(response.text().await.unwrap().contains("http_code=500"));
    assert!(!server.manager.contains("down"));

    server.stop().await;
}

#[tokio::test]
async fn test_run_fails_when_address_in_use() {
    let manager = Arc::new(
        CacheManager::start(
            Arc::new(ConverterRegistry::with_defaults().unwrap()),
            Arc::new(SubscriptionFetcher::new().unwrap()),
            ManagerOptions::default(),
        )
        .await,
    );
    let occupied = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = occupied.local_addr().unwrap();

    let server = SubscriptionServer::new(RequestHandler::new(Arc::clone(&manager)), addr);
    let result = tokio::time::timeout(
        std::time::Duration::from_secs(5),
        server.run(CancellationToken::new()),
    )
    .await
    .expect("run must return instead of serving");

    match result {
        Err(ConvertError::IoError(msg)) => assert!(msg.contains("Failed to bind"), "{}", msg),
        other => panic!("expected a bind error, got {:?}", other),
    }

    drop(occupied);
    manager.shutdown().await;
}

#[tokio::test]
async fn test_health_and_metrics() {
    let server = TestServer::start().await;
    let client = reqwest::Client::new();

    let health = client.get(server.url("/health")).send().await.unwrap();
    assert_eq!(health.status(), 200);
    let body: serde_json::Value = serde_json::from_str(&health.text().await.unwrap()).unwrap();
    assert_eq!(body["status"], "healthy");

    let metrics = client.get(server.url("/metrics")).send().await.unwrap();
    assert_eq!(metrics.status(), 200);
    assert!(metrics
        .text()
        .await
        .unwrap()
        .contains("clash_subconvert_registrations_total 0"));

    server.stop().await;
}
