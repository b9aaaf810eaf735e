//! End-to-end scenarios against the HTTP façade, using the process driver and
//! local storage under a temp directory.

use std::{net::SocketAddr, time::Duration};

use cubicle::{
    config::Config,
    server::{create_router, AppState},
};
use serde_json::{json, Value};

//--------------------------------------------------------------------------------------------------
// Helpers
//--------------------------------------------------------------------------------------------------

struct TestServer {
    addr: SocketAddr,
    state: AppState,
    client: reqwest::Client,
    _dir: tempfile::TempDir,
    _server: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn start(extra_yaml: &str) -> anyhow::Result<Self> {
        let dir = tempfile::tempdir()?;
        let yaml = format!(
            "isolation_backend: process\n\
             workspaces_root: {}\n\
             storage_root: {}\n\
             snapshot_compression_level: 3\n\
             {}",
            dir.path().join("workspaces").display(),
            dir.path().join("store").display(),
            extra_yaml
        );
        let config: Config = serde_yaml::from_str(&yaml)?;
        let state = AppState::new(config).await?;
        let router = create_router(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let server = tokio::spawn(async move {
            axum::serve(listener, router.into_make_service())
                .await
                .unwrap();
        });

        Ok(Self {
            addr,
            state,
            client: reqwest::Client::new(),
            _dir: dir,
            _server: server,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    async fn create_sandbox(&self, user: &str) -> anyhow::Result<String> {
        let body: Value = self
            .client
            .post(self.url("/sandboxes"))
            .header("x-user-id", user)
            .json(&json!({}))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(body["sandbox_id"].as_str().unwrap().to_string())
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[tokio::test]
async fn exec_round_trip() -> anyhow::Result<()> {
    let server = TestServer::start("").await?;
    let sandbox_id = server.create_sandbox("u_a").await?;

    let body: Value = server
        .client
        .post(server.url(&format!("/sandboxes/{}/exec", sandbox_id)))
        .header("x-user-id", "u_a")
        .json(&json!({"argv": ["echo", "hello"], "timeout_seconds": 5}))
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;

    assert_eq!(body["exit_code"], 0);
    assert_eq!(body["stdout"], "hello\n");
    assert_eq!(body["timed_out"], false);
    Ok(())
}

#[tokio::test]
async fn snapshot_restore_idempotence() -> anyhow::Result<()> {
    let server = TestServer::start("").await?;
    let sandbox_id = server.create_sandbox("u_a").await?;

    let put = |content: &'static str| {
        server
            .client
            .put(server.url(&format!("/sandboxes/{}/files/work/a.txt", sandbox_id)))
            .header("x-user-id", "u_a")
            .body(content)
            .send()
    };

    put("one").await?.error_for_status()?;

    let snapshot: Value = server
        .client
        .post(server.url("/snapshot/create"))
        .header("x-user-id", "u_a")
        .json(&json!({"sandbox_id": sandbox_id}))
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;
    let snapshot_id = snapshot["snapshot_id"].as_str().unwrap().to_string();

    put("two").await?.error_for_status()?;

    server
        .client
        .post(server.url("/snapshot/restore"))
        .header("x-user-id", "u_a")
        .json(&json!({"snapshot_id": snapshot_id, "sandbox_id": sandbox_id}))
        .send()
        .await?
        .error_for_status()?;

    let content = server
        .client
        .get(server.url(&format!("/sandboxes/{}/files/work/a.txt", sandbox_id)))
        .header("x-user-id", "u_a")
        .send()
        .await?
        .error_for_status()?
        .text()
        .await?;
    assert_eq!(content, "one");

    let listed: Value = server
        .client
        .get(server.url("/snapshot/list"))
        .header("x-user-id", "u_a")
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;
    assert_eq!(listed["snapshots"].as_array().unwrap().len(), 1);
    Ok(())
}

#[tokio::test]
async fn snapshot_retention_keeps_newest_three() -> anyhow::Result<()> {
    let server = TestServer::start("snapshot_retention: 3").await?;
    let sandbox_id = server.create_sandbox("u_a").await?;

    let mut ids = Vec::new();
    for i in 0..5 {
        server
            .client
            .put(server.url(&format!("/sandboxes/{}/files/v.txt", sandbox_id)))
            .header("x-user-id", "u_a")
            .body(format!("v{}", i))
            .send()
            .await?
            .error_for_status()?;

        let snapshot: Value = server
            .client
            .post(server.url("/snapshot/create"))
            .header("x-user-id", "u_a")
            .json(&json!({"sandbox_id": sandbox_id}))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        ids.push(snapshot["snapshot_id"].as_str().unwrap().to_string());
        // Snapshot ids carry second-resolution timestamps; give ordering room.
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    let listed: Value = server
        .client
        .get(server.url("/snapshot/list"))
        .header("x-user-id", "u_a")
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;
    let snapshots = listed["snapshots"].as_array().unwrap();
    assert_eq!(snapshots.len(), 3);
    assert_eq!(snapshots[0]["snapshot_id"], ids[4].as_str());

    // The two oldest payloads are gone from the backend.
    assert!(!server.state.snapshots.exists("u_a", &ids[0]).await?);
    assert!(!server.state.snapshots.exists("u_a", &ids[1]).await?);
    assert!(server.state.snapshots.exists("u_a", &ids[2]).await?);
    Ok(())
}

#[tokio::test]
async fn path_traversal_rejected() -> anyhow::Result<()> {
    let server = TestServer::start("").await?;
    let sandbox_id = server.create_sandbox("u_a").await?;

    let response = server
        .client
        .put(server.url(&format!(
            "/sandboxes/{}/files/%2E%2E/%2E%2E/etc/passwd",
            sandbox_id
        )))
        .header("x-user-id", "u_a")
        .body("intruder")
        .send()
        .await?;
    assert_eq!(response.status(), 400);

    let body: Value = response.json().await?;
    assert_eq!(body["error_type"], "invalid_argument");
    Ok(())
}

#[tokio::test]
async fn concurrent_exec_quota_trip() -> anyhow::Result<()> {
    let server = TestServer::start("quota:\n  max_concurrent_exec: 1").await?;
    let sandbox_id = server.create_sandbox("u_a").await?;

    let slow = {
        let client = server.client.clone();
        let url = server.url(&format!("/sandboxes/{}/exec", sandbox_id));
        tokio::spawn(async move {
            client
                .post(url)
                .header("x-user-id", "u_a")
                .json(&json!({"argv": ["sleep", "10"], "timeout_seconds": 10}))
                .send()
                .await
        })
    };
    // Let the slow exec claim the only concurrency unit.
    tokio::time::sleep(Duration::from_millis(300)).await;

    let response = server
        .client
        .post(server.url(&format!("/sandboxes/{}/exec", sandbox_id)))
        .header("x-user-id", "u_a")
        .json(&json!({"argv": ["echo", "x"]}))
        .send()
        .await?;
    assert_eq!(response.status(), 429);
    let body: Value = response.json().await?;
    assert_eq!(body["error_type"], "quota_exceeded");

    let metrics = server
        .client
        .get(server.url("/metrics"))
        .send()
        .await?
        .text()
        .await?;
    assert!(metrics.contains("quota_violations_total{kind=\"concurrent_exec\"} 1"));

    slow.abort();
    Ok(())
}

#[tokio::test]
async fn missing_identity_is_unauthorized() -> anyhow::Result<()> {
    let server = TestServer::start("").await?;

    let response = server
        .client
        .post(server.url("/sandboxes"))
        .json(&json!({}))
        .send()
        .await?;
    assert_eq!(response.status(), 401);
    Ok(())
}

#[tokio::test]
async fn health_and_metrics_endpoints() -> anyhow::Result<()> {
    let server = TestServer::start("").await?;
    server.create_sandbox("u_a").await?;

    let health = server.client.get(server.url("/health")).send().await?;
    assert_eq!(health.status(), 200);

    let ready = server
        .client
        .get(server.url("/health/ready"))
        .send()
        .await?;
    assert_eq!(ready.status(), 200);

    let metrics = server
        .client
        .get(server.url("/metrics"))
        .send()
        .await?
        .text()
        .await?;
    assert!(metrics.contains("# TYPE sandbox_created_total counter"));
    assert!(metrics.contains("sandbox_created_total 1"));
    assert!(metrics.contains("sandbox_active 1"));
    assert!(metrics.contains("# TYPE http_requests_total counter"));
    Ok(())
}

#[tokio::test]
async fn background_job_gets_stopped() -> anyhow::Result<()> {
    let server = TestServer::start("").await?;
    let sandbox_id = server.create_sandbox("u_a").await?;

    let started: Value = server
        .client
        .post(server.url(&format!("/sandboxes/{}/background", sandbox_id)))
        .header("x-user-id", "u_a")
        .json(&json!({"argv": ["sleep", "30"]}))
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;
    let job_id = started["job_id"].as_str().unwrap();

    let stopped: Value = server
        .client
        .delete(server.url(&format!(
            "/sandboxes/{}/background/{}",
            sandbox_id, job_id
        )))
        .header("x-user-id", "u_a")
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;
    assert_eq!(stopped["stopped"], true);
    Ok(())
}
