//! Preview proxy scenarios: plain forwarding and fallback promotion.

use std::net::SocketAddr;

use axum::{routing::get, Router};
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
    client: reqwest::Client,
    _dir: tempfile::TempDir,
    _server: tokio::task::JoinHandle<()>,
}

async fn start_server() -> anyhow::Result<TestServer> {
    let dir = tempfile::tempdir()?;
    let yaml = format!(
        "isolation_backend: process\n\
         workspaces_root: {}\n\
         storage_root: {}\n\
         proxy_error_budget: 3",
        dir.path().join("workspaces").display(),
        dir.path().join("store").display(),
    );
    let config: Config = serde_yaml::from_str(&yaml)?;
    let state = AppState::new(config).await?;
    let router = create_router(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let server = tokio::spawn(async move {
        axum::serve(listener, router.into_make_service())
            .await
            .unwrap();
    });

    Ok(TestServer {
        addr,
        client: reqwest::Client::new(),
        _dir: dir,
        _server: server,
    })
}

impl TestServer {
    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    async fn create_sandbox(&self) -> anyhow::Result<String> {
        let body: Value = self
            .client
            .post(self.url("/sandboxes"))
            .header("x-user-id", "u_a")
            .json(&json!({}))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(body["sandbox_id"].as_str().unwrap().to_string())
    }

    async fn register_preview(&self, sandbox_id: &str, port: u16, upstream_port: u16) -> anyhow::Result<()> {
        self.client
            .post(self.url(&format!("/sandboxes/{}/preview", sandbox_id)))
            .header("x-user-id", "u_a")
            .json(&json!({
                "port": port,
                "upstream": {"host": "127.0.0.1", "port": upstream_port}
            }))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// Spawns a tiny upstream answering `pong` on `/ping`, returning its port.
async fn spawn_upstream() -> anyhow::Result<u16> {
    let app = Router::new().route(
        "/ping",
        get(|| async { ([("x-upstream", "yes")], "pong") }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    tokio::spawn(async move {
        axum::serve(listener, app.into_make_service()).await.unwrap();
    });
    Ok(port)
}

/// Reserves a port nothing listens on.
async fn dead_port() -> anyhow::Result<u16> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    drop(listener);
    Ok(port)
}

async fn python3_present() -> bool {
    tokio::process::Command::new("python3")
        .arg("--version")
        .output()
        .await
        .map(|o| o.status.success())
        .unwrap_or(false)
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[tokio::test]
async fn proxies_to_live_upstream() -> anyhow::Result<()> {
    let server = start_server().await?;
    let sandbox_id = server.create_sandbox().await?;
    let upstream_port = spawn_upstream().await?;
    server
        .register_preview(&sandbox_id, 3000, upstream_port)
        .await?;

    let response = server
        .client
        .get(server.url(&format!("/preview/{}/3000/ping", sandbox_id)))
        .send()
        .await?;
    assert_eq!(response.status(), 200);
    assert_eq!(response.headers().get("x-upstream").unwrap(), "yes");
    assert_eq!(response.text().await?, "pong");
    Ok(())
}

#[tokio::test]
async fn unregistered_target_is_bad_gateway() -> anyhow::Result<()> {
    let server = start_server().await?;
    let sandbox_id = server.create_sandbox().await?;

    let response = server
        .client
        .get(server.url(&format!("/preview/{}/4000/", sandbox_id)))
        .send()
        .await?;
    assert_eq!(response.status(), 502);
    assert_eq!(response.text().await?, "NotListening");
    Ok(())
}

#[tokio::test]
async fn dead_upstream_without_promotion_path_is_bad_gateway() -> anyhow::Result<()> {
    let server = start_server().await?;
    let sandbox_id = server.create_sandbox().await?;
    // Point at a port with no listener; the workspace has no serveable
    // content, so even the promoted replica cannot answer unless python3
    // exists. Either way the client sees a gateway-class status quickly when
    // promotion is impossible, or a successful fallback listing when it is.
    server
        .register_preview(&sandbox_id, 3000, dead_port().await?)
        .await?;

    let response = server
        .client
        .get(server.url(&format!("/preview/{}/3000/absent", sandbox_id)))
        .send()
        .await?;
    if python3_present().await {
        // Promotion succeeded; the replica serves the workspace, which has no
        // `absent` file.
        assert_eq!(response.status(), 404);
    } else {
        assert_eq!(response.status(), 502);
    }
    Ok(())
}

#[tokio::test]
async fn fallback_promotion_serves_workspace() -> anyhow::Result<()> {
    if !python3_present().await {
        // The fallback replica serves with python3's http.server.
        return Ok(());
    }

    let server = start_server().await?;
    let sandbox_id = server.create_sandbox().await?;

    // The file the post-promotion upstream will serve.
    server
        .client
        .put(server.url(&format!("/sandboxes/{}/files/ping", sandbox_id)))
        .header("x-user-id", "u_a")
        .body("pong")
        .send()
        .await?
        .error_for_status()?;

    // An upstream that refuses every connect.
    server
        .register_preview(&sandbox_id, 3000, dead_port().await?)
        .await?;

    let response = server
        .client
        .get(server.url(&format!("/preview/{}/3000/ping", sandbox_id)))
        .send()
        .await?;
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await?, "pong");

    // Exactly one promotion: the upstream now points into the fallback range
    // and a second request reuses it as-is.
    let previews: Value = server
        .client
        .get(server.url("/previews"))
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;
    let upstream_port = previews[0]["upstream"]["port"].as_u64().unwrap();
    assert!((33000..=33999).contains(&upstream_port));

    let again = server
        .client
        .get(server.url(&format!("/preview/{}/3000/ping", sandbox_id)))
        .send()
        .await?;
    assert_eq!(again.status(), 200);
    assert_eq!(again.text().await?, "pong");

    let previews_after: Value = server
        .client
        .get(server.url("/previews"))
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;
    assert_eq!(
        previews_after[0]["upstream"]["port"].as_u64().unwrap(),
        upstream_port
    );
    Ok(())
}
