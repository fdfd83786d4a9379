// Shared helpers for driving the router in-process

#![allow(dead_code)]

use axum::body::{Body, Bytes};
use axum::extract::connect_info::MockConnectInfo;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use mail_gateway::transport::LoopbackTransport;
use mail_gateway::{GatewayConfig, GatewayServer};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tower::ServiceExt;

pub const PEER: ([u8; 4], u16) = ([127, 0, 0, 1], 40000);

/// Defaults with forwarding disabled and a generous rate limit
pub fn test_config() -> GatewayConfig {
    GatewayConfig {
        trust_proxy: 0,
        rate_limit_max: 1000,
        ..GatewayConfig::default()
    }
}

pub struct TestApp {
    pub server: GatewayServer,
    pub router: Router,
    pub transport: Arc<LoopbackTransport>,
}

impl TestApp {
    pub fn new(config: GatewayConfig) -> Self {
        Self::with_transport(config, LoopbackTransport::new())
    }

    pub fn with_transport(config: GatewayConfig, transport: LoopbackTransport) -> Self {
        let transport = Arc::new(transport);
        let server = GatewayServer::new(config, transport.clone()).unwrap();
        let router = server
            .router()
            .layer(MockConnectInfo(SocketAddr::from(PEER)));
        Self {
            server,
            router,
            transport,
        }
    }

    pub async fn request(&self, request: Request<Body>) -> TestResponse {
        collect(self.router.clone(), request).await
    }

    /// Send `request` as if it arrived on a socket from `peer`
    pub async fn request_from(&self, peer: SocketAddr, request: Request<Body>) -> TestResponse {
        let router = self.server.router().layer(MockConnectInfo(peer));
        collect(router, request).await
    }

    pub async fn get(&self, uri: &str) -> TestResponse {
        self.request(Request::get(uri).body(Body::empty()).unwrap())
            .await
    }

    pub async fn send(&self, payload: &Value, key: Option<&str>) -> TestResponse {
        self.request(send_request(payload, key)).await
    }
}

async fn collect(router: Router, request: Request<Body>) -> TestResponse {
    let response = router.oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    TestResponse {
        status,
        headers,
        body,
    }
}

pub struct TestResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl TestResponse {
    pub fn json(&self) -> Value {
        serde_json::from_slice(&self.body).unwrap()
    }
}

pub fn send_request(payload: &Value, key: Option<&str>) -> Request<Body> {
    let mut builder = Request::post("/send-mail").header("content-type", "application/json");
    if let Some(key) = key {
        builder = builder.header("idempotency-key", key);
    }
    builder
        .body(Body::from(serde_json::to_vec(payload).unwrap()))
        .unwrap()
}

/// A valid request on the default `465-tls` mode
pub fn valid_payload() -> Value {
    json!({
        "smtp": {
            "host": "smtp.example.com",
            "username": "sender@example.com",
            "password": "secret"
        },
        "message": {
            "from": "sender@example.com",
            "to": ["a@b.com"],
            "subject": "hi",
            "text": "hello"
        }
    })
}
