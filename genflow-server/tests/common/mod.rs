//! Shared harness for HTTP-level tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use genflow_server::auth::Authenticator;
use genflow_server::config::ServerConfig;
use genflow_server::model::now_secs;
use genflow_server::server::Server;

pub const SECRET: &str = "test-secret";

pub fn test_config() -> ServerConfig {
    ServerConfig {
        listen_addr: "127.0.0.1:0".to_string(),
        auth_secret: SECRET.to_string(),
        poll_interval_ms: 50,
        ..Default::default()
    }
}

pub async fn start(server: Server) -> (SocketAddr, tokio::task::JoinHandle<anyhow::Result<()>>) {
    server.start().await.unwrap()
}

pub async fn start_server() -> (SocketAddr, tokio::task::JoinHandle<anyhow::Result<()>>) {
    start(Server::new(test_config())).await
}

pub fn token_for(requester: &str) -> String {
    Authenticator::new(SECRET)
        .mint(requester, Duration::from_secs(600), now_secs())
        .unwrap()
}

pub struct Client {
    pub base: String,
    pub token: String,
    pub http: reqwest::Client,
}

impl Client {
    pub fn new(addr: SocketAddr, requester: &str) -> Self {
        Self {
            base: format!("http://{addr}/api/v1"),
            token: token_for(requester),
            http: reqwest::Client::new(),
        }
    }

    pub async fn get(&self, path: &str) -> reqwest::Response {
        self.http
            .get(format!("{}{path}", self.base))
            .bearer_auth(&self.token)
            .send()
            .await
            .unwrap()
    }

    pub async fn post(&self, path: &str, body: serde_json::Value) -> reqwest::Response {
        self.http
            .post(format!("{}{path}", self.base))
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await
            .unwrap()
    }

    pub async fn create_persona(&self, name: &str) -> String {
        let resp = self.post("/personas", serde_json::json!({ "name": name })).await;
        assert_eq!(resp.status(), 201);
        let body: serde_json::Value = resp.json().await.unwrap();
        body["id"].as_str().unwrap().to_string()
    }

    pub async fn create_generation(&self, persona_id: &str, prompt: &str) -> String {
        let resp = self
            .post(
                "/generations",
                serde_json::json!({ "persona_id": persona_id, "kind": "text", "prompt": prompt }),
            )
            .await;
        assert_eq!(resp.status(), 201);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["state"], "pending");
        body["id"].as_str().unwrap().to_string()
    }

    pub async fn ticket(&self, generation_id: &str) -> String {
        let resp = self
            .post(&format!("/generations/{generation_id}/ticket"), serde_json::json!({}))
            .await;
        assert_eq!(resp.status(), 200);
        let body: serde_json::Value = resp.json().await.unwrap();
        body["ticket"].as_str().unwrap().to_string()
    }

    /// Open the SSE stream and read it to the end.
    pub async fn stream(&self, generation_id: &str, query: &str) -> (u16, Vec<SseEvent>) {
        let resp = self
            .http
            .get(format!("{}/generations/{generation_id}/stream?{query}", self.base))
            .send()
            .await
            .unwrap();
        let status = resp.status().as_u16();
        let text = tokio::time::timeout(Duration::from_secs(10), resp.text())
            .await
            .expect("stream did not close")
            .unwrap();
        (status, parse_sse(&text))
    }
}

#[derive(Debug)]
pub struct SseEvent {
    pub name: String,
    pub data: serde_json::Value,
}

pub fn parse_sse(text: &str) -> Vec<SseEvent> {
    let mut events = Vec::new();
    for block in text.split("\n\n") {
        let mut name = None;
        let mut data = None;
        for line in block.lines() {
            if let Some(v) = line.strip_prefix("event:") {
                name = Some(v.trim().to_string());
            } else if let Some(v) = line.strip_prefix("data:") {
                data = serde_json::from_str(v.trim()).ok();
            }
        }
        if let (Some(name), Some(data)) = (name, data) {
            events.push(SseEvent { name, data });
        }
    }
    events
}
