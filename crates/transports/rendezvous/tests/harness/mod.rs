//! Rendezvous test harness
//!
//! Two ways of driving the service:
//! - [`call`] pushes a single request through the router with `tower::ServiceExt::oneshot`
//! - [`TestServer`] serves the router on a random local port for client tests

#![allow(dead_code)]

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use peerlink_rendezvous::{RendezvousClient, RendezvousConfig, RendezvousServer, RendezvousService};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tower::ServiceExt;

/// Initialize test logging (safe to call from every test)
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info,peerlink_rendezvous=debug")
        .with_test_writer()
        .try_init();
}

/// Fresh service with default configuration
pub fn service() -> Arc<RendezvousService> {
    Arc::new(RendezvousService::new(RendezvousConfig::default()))
}

/// Send one request through the router and decode the JSON response
///
/// Non-JSON bodies come back as a JSON string.
pub async fn call(
    router: &Router,
    method: Method,
    uri: &str,
    body: Option<serde_json::Value>,
) -> (StatusCode, serde_json::Value) {
    call_raw(
        router,
        method,
        uri,
        body.map(|b| b.to_string()),
    )
    .await
}

/// Like [`call`] but with a raw request body
pub async fn call_raw(
    router: &Router,
    method: Method,
    uri: &str,
    body: Option<String>,
) -> (StatusCode, serde_json::Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(text) => {
            builder = builder.header("content-type", "application/json");
            Body::from(text)
        }
        None => Body::empty(),
    };

    let response = router
        .clone()
        .oneshot(builder.body(body).unwrap())
        .await
        .unwrap();

    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = serde_json::from_slice(&bytes)
        .unwrap_or_else(|_| serde_json::Value::String(String::from_utf8_lossy(&bytes).into_owned()));

    (status, value)
}

/// Rendezvous server on a random local port
pub struct TestServer {
    base_url: String,
    service: Arc<RendezvousService>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl TestServer {
    pub async fn start() -> Self {
        let service = service();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let server = RendezvousServer::new(Arc::clone(&service));
        let handle = tokio::spawn(async move {
            let shutdown = async move {
                let _ = shutdown_rx.await;
            };
            if let Err(e) = server.serve_with_listener(listener, shutdown).await {
                tracing::error!("Test server failed: {}", e);
            }
        });

        Self {
            base_url: format!("http://{}", addr),
            service,
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn service(&self) -> Arc<RendezvousService> {
        Arc::clone(&self.service)
    }

    pub fn client(&self) -> RendezvousClient {
        RendezvousClient::new(self.base_url.clone()).unwrap()
    }

    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}
