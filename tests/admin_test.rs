//! Admin API authentication and reporting.

use serde_json::Value;

mod common;

async fn start_with_admin() -> (String, socks_reverse_proxy::Shutdown) {
    let backend = common::start_mock_backend("admin").await;
    let admin_port = common::free_port();

    let mut config = common::proxy_config(backend);
    config.admin.enabled = true;
    config.admin.api_key = "test-key".to_string();
    config.admin.bind_address = format!("127.0.0.1:{admin_port}");
    let (proxy, shutdown) = common::start_proxy(config).await;

    // one proxied request so the counters move
    let res = common::client().get(format!("http://{}/", proxy)).send().await.unwrap();
    assert_eq!(res.text().await.unwrap(), "admin");

    (format!("http://127.0.0.1:{admin_port}"), shutdown)
}

#[tokio::test]
async fn test_admin_requires_bearer_key() {
    let (admin, _shutdown) = start_with_admin().await;
    let client = common::client();

    let res = client.get(format!("{admin}/admin/status")).send().await.unwrap();
    assert_eq!(res.status(), 401);

    let res = client
        .get(format!("{admin}/admin/status"))
        .bearer_auth("wrong-key")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 401);
}

#[tokio::test]
async fn test_admin_reports_state() {
    let (admin, _shutdown) = start_with_admin().await;
    let client = common::client();

    let status: Value = client
        .get(format!("{admin}/admin/status"))
        .bearer_auth("test-key")
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["status"], "operational");
    assert_eq!(status["total_requests"], 1);
    assert_eq!(status["socks_enabled"], false);

    let pool: Value = client
        .get(format!("{admin}/admin/pool"))
        .bearer_auth("test-key")
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(pool["segment_size"], 16 * 1024);
    assert!(pool["ceiling"].as_u64().unwrap() > 0);

    let connections: Value = client
        .get(format!("{admin}/admin/connections"))
        .bearer_auth("test-key")
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(connections.is_array());
}
